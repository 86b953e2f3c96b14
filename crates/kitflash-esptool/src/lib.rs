//! kitflash-esptool - Chip programmer backed by esptool
//!
//! Drives the `esptool.py` command line utility, one process per bootloader
//! operation. esptool uploads its own flasher stub and switches to the
//! requested baud rate on every run, so [`Chip::run_stub`] and
//! [`Stub::change_baud`] only adjust the settings used for later runs.
//!
//! Images are spooled to a private temporary directory because esptool reads
//! them from files. The directory is removed when the stub is dropped.

pub mod command;
pub mod error;

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use kitflash_core::config::FlashParams;
use kitflash_core::programmer::{Chip, ChipProgrammer, ProgrammerError, Result, Stub};
use kitflash_core::source::FlashImage;
use tempfile::TempDir;

use command::{After, Session};
pub use error::EsptoolError;

/// Default executable name
pub const DEFAULT_PROGRAM: &str = "esptool.py";

/// esptool-backed chip programmer
#[derive(Debug, Clone)]
pub struct Esptool {
    program: String,
    chip: String,
}

impl Default for Esptool {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            chip: "auto".to_string(),
        }
    }
}

impl Esptool {
    /// Use `esptool.py` from `PATH` with chip auto-detection
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different esptool executable
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Restrict detection to one chip family, e.g. `esp32`
    pub fn with_chip(mut self, chip: impl Into<String>) -> Self {
        self.chip = chip.into();
        self
    }

    /// Executable in use
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Check that the executable can be started
    pub fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

impl ChipProgrammer for Esptool {
    fn detect_chip(&self, port: &str, baud: u32, trace: bool) -> Result<Box<dyn Chip>> {
        let session = Session {
            program: self.program.clone(),
            chip: self.chip.clone(),
            port: port.to_string(),
            baud,
            trace,
        };

        let output = session.run(After::NoReset, &["chip_id"])?;
        let description = command::parse_chip(&output).ok_or(ProgrammerError::NoChip)?;
        log::debug!("esptool: chip on {} is {}", port, description);

        Ok(Box::new(EsptoolChip {
            session,
            description,
        }))
    }
}

struct EsptoolChip {
    session: Session,
    description: String,
}

impl Chip for EsptoolChip {
    fn description(&self) -> String {
        self.description.clone()
    }

    fn run_stub(self: Box<Self>) -> Result<Box<dyn Stub>> {
        Ok(Box::new(EsptoolStub {
            session: self.session,
            params: None,
        }))
    }
}

struct EsptoolStub {
    session: Session,
    params: Option<FlashParams>,
}

impl Stub for EsptoolStub {
    fn change_baud(&mut self, rate: u32) -> Result<()> {
        self.session.baud = rate;
        Ok(())
    }

    fn detect_flash_size(&mut self) -> Result<u32> {
        let output = self.session.run(After::NoReset, &["flash_id"])?;
        command::parse_flash_size(&output).ok_or_else(|| {
            EsptoolError::Parse {
                command: "flash_id".to_string(),
                expected: "Detected flash size: ",
            }
            .into()
        })
    }

    fn set_flash_params(&mut self, params: &FlashParams) -> Result<()> {
        self.params = Some(*params);
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        self.session.run(After::NoReset, &["erase_flash"])?;
        Ok(())
    }

    fn write(&mut self, images: &mut [FlashImage], on_output: &mut dyn FnMut(&[u8])) -> Result<()> {
        let params = self
            .params
            .ok_or_else(|| ProgrammerError::Protocol("flash parameters not set".to_string()))?;

        let spool = ImageSpool::create()?;
        let mut args: Vec<OsString> = command::write_flash_args(&params)
            .into_iter()
            .map(OsString::from)
            .collect();
        for image in images {
            let path = spool.store(image)?;
            args.push(format!("0x{:x}", image.address()).into());
            args.push(path.into_os_string());
        }

        self.session.stream(After::NoReset, args, on_output)?;
        Ok(())
    }

    fn hard_reset(&mut self) -> Result<()> {
        self.session.run(After::HardReset, &["run"])?;
        Ok(())
    }
}

/// Temporary directory holding images for one write, removed on drop
struct ImageSpool {
    dir: TempDir,
}

impl ImageSpool {
    fn create() -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("kitflash-").tempdir()?;
        log::trace!("Spooling images in {}", dir.path().display());
        Ok(Self { dir })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn store(&self, image: &mut FlashImage) -> std::io::Result<PathBuf> {
        let path = self.path().join(format!("{:08x}.bin", image.address()));
        let mut file = fs::File::create_new(&path)?;
        file.write_all(&image.read_to_vec()?)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kitflash_core::profile::SourceRef;
    use kitflash_core::source::{FirmwareProvider, MemoryProvider};

    #[test]
    fn test_spool_stores_and_cleans_up() {
        let provider = MemoryProvider::new().with_image("app.bin", vec![0xE9u8, 0x03, 0x02]);
        let mut image = FlashImage::new(0x10000, provider.open(&SourceRef::new("app.bin")).unwrap());

        let spool = ImageSpool::create().unwrap();
        let dir = spool.path().to_path_buf();
        let path = spool.store(&mut image).unwrap();
        assert_eq!(path.file_name().unwrap(), "00010000.bin");
        assert_eq!(fs::read(&path).unwrap(), vec![0xE9, 0x03, 0x02]);

        drop(spool);
        assert!(!dir.exists());
    }

    #[test]
    fn test_spool_directories_are_unique_and_private() {
        let first = ImageSpool::create().unwrap();
        let second = ImageSpool::create().unwrap();
        assert_ne!(first.path(), second.path());
        assert!(first
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("kitflash-"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(first.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn test_spool_refuses_to_replace_existing_file() {
        let provider = MemoryProvider::new().with_image("app.bin", vec![0x41u8; 4]);
        let mut image = FlashImage::new(0x10000, provider.open(&SourceRef::new("app.bin")).unwrap());

        let spool = ImageSpool::create().unwrap();
        let planted = spool.path().join("00010000.bin");
        fs::write(&planted, b"precious").unwrap();

        assert!(spool.store(&mut image).is_err());
        assert_eq!(fs::read(&planted).unwrap(), b"precious");
    }

    #[test]
    fn test_missing_program_is_detect_error() {
        let esptool = Esptool::new().with_program("kitflash-no-such-esptool");
        assert!(!esptool.is_available());
        let err = esptool.detect_chip("/dev/null", 115_200, false).err().unwrap();
        assert!(matches!(err, ProgrammerError::Protocol(_)));
    }

    #[test]
    fn test_write_requires_params() {
        let mut stub = EsptoolStub {
            session: Session {
                program: DEFAULT_PROGRAM.into(),
                chip: "auto".into(),
                port: "/dev/ttyUSB0".into(),
                baud: 115_200,
                trace: false,
            },
            params: None,
        };
        stub.change_baud(921_600).unwrap();
        assert_eq!(stub.session.baud, 921_600);
        let err = stub.write(&mut [], &mut |_| {}).unwrap_err();
        assert!(matches!(err, ProgrammerError::Protocol(_)));
    }
}
