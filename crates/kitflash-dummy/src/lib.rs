//! kitflash-dummy - In-memory chip programmer for testing
//!
//! Emulates an ESP32-style device behind a serial bootloader. The flash lives
//! in memory, every programmer call is recorded, and any phase can be made to
//! fail. Write output mimics esptool's progress lines so the whole job
//! pipeline, progress interpretation included, runs without hardware.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use kitflash_core::config::FlashParams;
use kitflash_core::programmer::{Chip, ChipProgrammer, ProgrammerError, Result, Stub};
use kitflash_core::source::FlashImage;

/// Phase at which the dummy device fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// No chip answers
    Detect,
    /// Stub upload times out
    Stub,
    /// Baud rate change is rejected
    ChangeBaud,
    /// Flash size detection or parameter setting fails
    FlashParams,
    /// Erase fails
    Erase,
    /// Writing the image at this address fails half-way
    Write {
        /// Address of the failing image
        address: u32,
    },
    /// Hard reset fails
    Reset,
}

impl FromStr for FailPoint {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "detect" => Ok(Self::Detect),
            "stub" => Ok(Self::Stub),
            "baud" => Ok(Self::ChangeBaud),
            "params" => Ok(Self::FlashParams),
            "erase" => Ok(Self::Erase),
            "reset" => Ok(Self::Reset),
            other => {
                let address = other
                    .strip_prefix("write@")
                    .ok_or_else(|| format!("unknown failure point '{}'", s))?;
                let address = kitflash_core::profile::parse_address(address)
                    .map_err(|e| format!("invalid write address '{}': {}", address, e))?;
                Ok(Self::Write { address })
            }
        }
    }
}

/// Configuration for the dummy device
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Chip description reported after detection
    pub chip: String,
    /// Flash size in bytes
    pub flash_size: u32,
    /// Ports that have a device attached; `None` accepts any port
    pub ports: Option<Vec<String>>,
    /// Phase that fails, if any
    pub fail_at: Option<FailPoint>,
    /// Bytes per emulated write block
    pub block_size: usize,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            chip: "ESP32D0WDQ6 (revision 1)".to_string(),
            flash_size: 4 * 1024 * 1024,
            ports: None,
            fail_at: None,
            block_size: 1024,
        }
    }
}

/// A recorded programmer call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Chip detection on a port
    Detect {
        /// Port name
        port: String,
        /// Baud rate
        baud: u32,
    },
    /// Stub upload
    RunStub,
    /// Baud rate change
    ChangeBaud(u32),
    /// Flash size detection
    DetectFlashSize,
    /// Flash parameters applied
    SetFlashParams(FlashParams),
    /// Whole-chip erase
    Erase,
    /// Image write
    Write {
        /// Image address
        address: u32,
        /// Image length
        len: usize,
    },
    /// Hard reset
    HardReset,
}

struct DummyState {
    flash: Vec<u8>,
    operations: Vec<Operation>,
    connected: Option<String>,
}

#[derive(Default)]
struct Hold {
    held: Mutex<bool>,
    released: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Dummy chip programmer
///
/// Clones share the emulated device, so a clone kept by a test can inspect
/// what a job did.
#[derive(Clone)]
pub struct DummyProgrammer {
    config: Arc<DummyConfig>,
    state: Arc<Mutex<DummyState>>,
    hold: Arc<Hold>,
}

impl DummyProgrammer {
    /// Create a dummy device with the given configuration
    pub fn new(config: DummyConfig) -> Self {
        let flash = vec![0xFF; config.flash_size as usize];
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(DummyState {
                flash,
                operations: Vec::new(),
                connected: None,
            })),
            hold: Arc::new(Hold::default()),
        }
    }

    /// Create a dummy device with default configuration
    pub fn new_default() -> Self {
        Self::new(DummyConfig::default())
    }

    /// Get the configuration
    pub fn config(&self) -> &DummyConfig {
        &self.config
    }

    /// Copy of the emulated flash contents
    pub fn flash(&self) -> Vec<u8> {
        lock(&self.state).flash.clone()
    }

    /// Read `len` bytes of emulated flash at `address`
    pub fn read(&self, address: u32, len: usize) -> Vec<u8> {
        let state = lock(&self.state);
        let start = (address as usize).min(state.flash.len());
        let end = (start + len).min(state.flash.len());
        state.flash[start..end].to_vec()
    }

    /// Calls recorded so far
    pub fn operations(&self) -> Vec<Operation> {
        lock(&self.state).operations.clone()
    }

    /// Port with an open connection, if any
    pub fn connected_port(&self) -> Option<String> {
        lock(&self.state).connected.clone()
    }

    /// Block chip detection until the returned guard is dropped
    pub fn hold(&self) -> HoldGuard {
        *lock(&self.hold.held) = true;
        HoldGuard {
            hold: Arc::clone(&self.hold),
        }
    }

    fn record(&self, operation: Operation) {
        log::trace!("dummy: {:?}", operation);
        lock(&self.state).operations.push(operation);
    }

    fn fails_at(&self, point: FailPoint) -> bool {
        self.config.fail_at == Some(point)
    }

    fn wait_for_release(&self) {
        let mut held = lock(&self.hold.held);
        while *held {
            held = self
                .hold
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl fmt::Debug for DummyProgrammer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DummyProgrammer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Keeps chip detection blocked while alive
pub struct HoldGuard {
    hold: Arc<Hold>,
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        *lock(&self.hold.held) = false;
        self.hold.released.notify_all();
    }
}

/// Open serial connection; closes on drop
struct Connection {
    device: DummyProgrammer,
    port: String,
}

impl Drop for Connection {
    fn drop(&mut self) {
        let mut state = lock(&self.device.state);
        if state.connected.as_deref() == Some(self.port.as_str()) {
            state.connected = None;
        }
        log::trace!("dummy: closed {}", self.port);
    }
}

impl ChipProgrammer for DummyProgrammer {
    fn detect_chip(&self, port: &str, baud: u32, _trace: bool) -> Result<Box<dyn Chip>> {
        self.record(Operation::Detect {
            port: port.to_string(),
            baud,
        });
        self.wait_for_release();

        if let Some(ports) = &self.config.ports {
            if !ports.iter().any(|p| p == port) {
                return Err(ProgrammerError::Serial(format!(
                    "could not open port {}: No such file or directory",
                    port
                )));
            }
        }
        if self.fails_at(FailPoint::Detect) {
            return Err(ProgrammerError::NoChip);
        }

        lock(&self.state).connected = Some(port.to_string());
        Ok(Box::new(DummyChip {
            conn: Connection {
                device: self.clone(),
                port: port.to_string(),
            },
        }))
    }
}

struct DummyChip {
    conn: Connection,
}

impl Chip for DummyChip {
    fn description(&self) -> String {
        self.conn.device.config.chip.clone()
    }

    fn run_stub(self: Box<Self>) -> Result<Box<dyn Stub>> {
        let DummyChip { conn } = *self;
        conn.device.record(Operation::RunStub);
        if conn.device.fails_at(FailPoint::Stub) {
            return Err(ProgrammerError::Timeout);
        }
        Ok(Box::new(DummyStub { conn }))
    }
}

struct DummyStub {
    conn: Connection,
}

impl DummyStub {
    fn write_image(&mut self, image: &mut FlashImage, on_output: &mut dyn FnMut(&[u8])) -> Result<()> {
        let device = &self.conn.device;
        let address = image.address();
        let data = image.read_to_vec()?;
        device.record(Operation::Write {
            address,
            len: data.len(),
        });

        let flash_size = device.config.flash_size;
        if address as u64 + data.len() as u64 > flash_size as u64 {
            return Err(ProgrammerError::OutOfBounds {
                address,
                len: data.len() as u64,
                flash_size,
            });
        }

        let block_size = device.config.block_size.max(1);
        let blocks = data.len().div_ceil(block_size);
        let fail_after = device
            .fails_at(FailPoint::Write { address })
            .then_some(blocks / 2);

        for (seq, block) in data.chunks(block_size).enumerate() {
            if fail_after == Some(seq) {
                return Err(ProgrammerError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    format!("device stopped responding at 0x{:08x}", address as usize + seq * block_size),
                )));
            }

            let offset = address as usize + seq * block_size;
            {
                let mut state = lock(&device.state);
                // Programming can only clear bits
                for (dst, &src) in state.flash[offset..offset + block.len()].iter_mut().zip(block) {
                    *dst &= src;
                }
            }
            let line = format!("\rWriting at 0x{:08x}... ({} %)", offset, 100 * (seq + 1) / blocks);
            on_output(line.as_bytes());
        }

        on_output(format!("\nWrote {} bytes at 0x{:08x}.\nHash of data verified.\n", data.len(), address).as_bytes());
        Ok(())
    }
}

impl Stub for DummyStub {
    fn change_baud(&mut self, rate: u32) -> Result<()> {
        self.conn.device.record(Operation::ChangeBaud(rate));
        if self.conn.device.fails_at(FailPoint::ChangeBaud) {
            return Err(ProgrammerError::Protocol(format!("baud rate {} rejected", rate)));
        }
        Ok(())
    }

    fn detect_flash_size(&mut self) -> Result<u32> {
        self.conn.device.record(Operation::DetectFlashSize);
        if self.conn.device.fails_at(FailPoint::FlashParams) {
            return Err(ProgrammerError::Protocol("flash ID read failed".to_string()));
        }
        Ok(self.conn.device.config.flash_size)
    }

    fn set_flash_params(&mut self, params: &FlashParams) -> Result<()> {
        self.conn.device.record(Operation::SetFlashParams(*params));
        if self.conn.device.fails_at(FailPoint::FlashParams) {
            return Err(ProgrammerError::Protocol("SPI_SET_PARAMS failed".to_string()));
        }
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        let device = &self.conn.device;
        device.record(Operation::Erase);
        if device.fails_at(FailPoint::Erase) {
            return Err(ProgrammerError::Protocol("erase failed".to_string()));
        }
        lock(&device.state).flash.fill(0xFF);
        Ok(())
    }

    fn write(&mut self, images: &mut [FlashImage], on_output: &mut dyn FnMut(&[u8])) -> Result<()> {
        for image in images {
            self.write_image(image, on_output)?;
        }
        Ok(())
    }

    fn hard_reset(&mut self) -> Result<()> {
        self.conn.device.record(Operation::HardReset);
        if self.conn.device.fails_at(FailPoint::Reset) {
            return Err(ProgrammerError::Serial("could not toggle RTS".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kitflash_core::profile::SourceRef;
    use kitflash_core::source::{FirmwareProvider, MemoryProvider};

    fn image(address: u32, data: Vec<u8>) -> FlashImage {
        let provider = MemoryProvider::new().with_image("img", data);
        FlashImage::new(address, provider.open(&SourceRef::new("img")).unwrap())
    }

    fn stub(device: &DummyProgrammer) -> Box<dyn Stub> {
        device
            .detect_chip("/dev/ttyDUMMY", 115_200, false)
            .unwrap()
            .run_stub()
            .unwrap()
    }

    #[test]
    fn test_write_and_progress_lines() {
        let device = DummyProgrammer::new_default();
        let mut stub = stub(&device);
        stub.erase().unwrap();

        let mut output = Vec::new();
        let mut images = [image(0x1000, vec![0x12u8; 4096])];
        stub.write(&mut images, &mut |chunk| output.push(String::from_utf8_lossy(chunk).into_owned()))
            .unwrap();

        assert_eq!(output[0], "\rWriting at 0x00001000... (25 %)");
        assert_eq!(output[3], "\rWriting at 0x00001c00... (100 %)");
        assert!(output[4].contains("Wrote 4096 bytes"));
        assert!(device.read(0x1000, 4096).iter().all(|&b| b == 0x12));
        assert_eq!(device.read(0x0FFF, 1), vec![0xFF]);
    }

    #[test]
    fn test_write_only_clears_bits() {
        let device = DummyProgrammer::new_default();
        let mut stub = stub(&device);
        stub.write(&mut [image(0, vec![0xF0u8; 4])], &mut |_| {}).unwrap();
        stub.write(&mut [image(0, vec![0x0Fu8; 4])], &mut |_| {}).unwrap();
        assert_eq!(device.read(0, 4), vec![0x00; 4]);
    }

    #[test]
    fn test_out_of_bounds() {
        let device = DummyProgrammer::new(DummyConfig {
            flash_size: 1024,
            ..Default::default()
        });
        let mut stub = stub(&device);
        let err = stub
            .write(&mut [image(1000, vec![0u8; 100])], &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, ProgrammerError::OutOfBounds { address: 1000, .. }));
    }

    #[test]
    fn test_connection_closes_on_drop() {
        let device = DummyProgrammer::new_default();
        let stub = stub(&device);
        assert_eq!(device.connected_port().as_deref(), Some("/dev/ttyDUMMY"));
        drop(stub);
        assert_eq!(device.connected_port(), None);
    }

    #[test]
    fn test_unknown_port() {
        let device = DummyProgrammer::new(DummyConfig {
            ports: Some(vec!["/dev/ttyUSB0".into()]),
            ..Default::default()
        });
        let err = device.detect_chip("/dev/ttyUSB1", 115_200, false).err().unwrap();
        assert!(matches!(err, ProgrammerError::Serial(_)));
        assert_eq!(device.connected_port(), None);
    }

    #[test]
    fn test_parse_fail_point() {
        assert_eq!("erase".parse::<FailPoint>(), Ok(FailPoint::Erase));
        assert_eq!("Detect".parse::<FailPoint>(), Ok(FailPoint::Detect));
        assert_eq!(
            "write@0x200000".parse::<FailPoint>(),
            Ok(FailPoint::Write { address: 0x200000 })
        );
        assert!("write@zz".parse::<FailPoint>().is_err());
        assert!("explode".parse::<FailPoint>().is_err());
    }
}
