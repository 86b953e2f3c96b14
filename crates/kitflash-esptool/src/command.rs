//! esptool invocations
//!
//! Every bootloader operation is one esptool run. Global options must precede
//! the sub-command:
//!
//! ```text
//! esptool.py --chip auto --port /dev/ttyUSB0 --baud 921600 \
//!     --before default_reset --after no_reset [--trace] <command> [args...]
//! ```

use std::ffi::OsString;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};

use crate::error::{EsptoolError, Result};
use kitflash_core::config::FlashParams;

const FATAL: &str = "A fatal error occurred: ";

/// What esptool does with the chip after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum After {
    /// Leave the chip in the bootloader
    NoReset,
    /// Reset into the application
    HardReset,
}

impl After {
    fn as_str(&self) -> &'static str {
        match self {
            Self::NoReset => "no_reset",
            Self::HardReset => "hard_reset",
        }
    }
}

/// Connection settings shared by all invocations on one port
#[derive(Debug, Clone)]
pub struct Session {
    /// esptool executable
    pub program: String,
    /// `--chip` value
    pub chip: String,
    /// Serial port
    pub port: String,
    /// Baud rate
    pub baud: u32,
    /// Pass `--trace`
    pub trace: bool,
}

impl Session {
    /// Full argument list for `command`
    pub fn args<I, S>(&self, after: After, command: I) -> Vec<OsString>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut args: Vec<OsString> = vec![
            "--chip".into(),
            self.chip.clone().into(),
            "--port".into(),
            self.port.clone().into(),
            "--baud".into(),
            self.baud.to_string().into(),
            "--before".into(),
            "default_reset".into(),
            "--after".into(),
            after.as_str().into(),
        ];
        if self.trace {
            args.push("--trace".into());
        }
        args.extend(command.into_iter().map(Into::into));
        args
    }

    /// Run `command` and return its combined output
    pub fn run(&self, after: After, command: &[&str]) -> Result<String> {
        let name = command.first().copied().unwrap_or_default().to_string();
        let args = self.args(after, command.iter().copied());
        log::debug!("{} {:?}", self.program, args);

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|source| EsptoolError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(failure(name, &text, output.status.code()));
        }
        Ok(text)
    }

    /// Run `command` and hand stdout to `on_output` as it arrives
    pub fn stream(
        &self,
        after: After,
        command: Vec<OsString>,
        on_output: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let name = command
            .first()
            .map(|c| c.to_string_lossy().into_owned())
            .unwrap_or_default();
        let args = self.args(after, command);
        log::debug!("{} {:?}", self.program, args);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EsptoolError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Drained separately so a chatty stderr cannot block the child
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        let mut transcript = Vec::new();
        if let Some(mut stdout) = child.stdout.take() {
            if let Err(e) = pump(&mut stdout, on_output, &mut transcript) {
                abort(&mut child, stderr);
                return Err(e.into());
            }
        }

        let status = child.wait()?;
        let mut text = String::from_utf8_lossy(&transcript).into_owned();
        if let Some(text_err) = stderr.and_then(|h| h.join().ok()) {
            text.push_str(&text_err);
        }
        if !status.success() {
            return Err(failure(name, &text, status.code()));
        }
        Ok(())
    }
}

/// Forward everything `reader` produces to `on_output`, keeping a copy
fn pump(
    reader: &mut dyn Read,
    on_output: &mut dyn FnMut(&[u8]),
    transcript: &mut Vec<u8>,
) -> std::io::Result<()> {
    let mut buf = [0u8; 256];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        on_output(&buf[..n]);
        transcript.extend_from_slice(&buf[..n]);
    }
}

/// Stop a child whose output can no longer be read
fn abort(child: &mut Child, stderr: Option<JoinHandle<String>>) {
    if let Err(e) = child.kill() {
        log::debug!("Could not kill esptool: {}", e);
    }
    if let Err(e) = child.wait() {
        log::debug!("Could not reap esptool: {}", e);
    }
    // The pipe closes with the child, so the drain thread finishes
    if let Some(handle) = stderr {
        let _ = handle.join();
    }
}

fn failure(command: String, output: &str, code: Option<i32>) -> EsptoolError {
    let message = fatal_error(output)
        .map(str::to_string)
        .unwrap_or_else(|| match code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        });
    EsptoolError::Failed { command, message }
}

/// The message of esptool's fatal error line, if any
pub fn fatal_error(output: &str) -> Option<&str> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(FATAL))
        .map(str::trim)
}

/// Chip description from `chip_id` output
pub fn parse_chip(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Chip is "))
        .map(|chip| chip.trim().to_string())
}

/// Flash size in bytes from `flash_id` output
pub fn parse_flash_size(output: &str) -> Option<u32> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Detected flash size: "))
        .and_then(|size| kitflash_core::config::parse_size(size).ok())
}

/// `--flash_size` argument for a size in bytes
pub fn size_arg(bytes: u32) -> String {
    const MIB: u32 = 1024 * 1024;
    if bytes >= MIB && bytes % MIB == 0 {
        format!("{}MB", bytes / MIB)
    } else {
        format!("{}KB", bytes / 1024)
    }
}

/// `write_flash` sub-command arguments, without the address/file pairs
pub fn write_flash_args(params: &FlashParams) -> Vec<String> {
    let mut args = vec![
        "write_flash".to_string(),
        "--flash_mode".to_string(),
        params.mode.as_str().to_string(),
        "--flash_freq".to_string(),
        params.freq.as_str().to_string(),
        "--flash_size".to_string(),
        size_arg(params.size),
        if params.compress { "-z" } else { "-u" }.to_string(),
    ];
    if params.verify {
        args.push("--verify".to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use kitflash_core::config::{FlashFreq, FlashMode};

    /// Yields one chunk, then fails
    struct BrokenPipe {
        sent: bool,
    }

    impl Read for BrokenPipe {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.sent {
                return Err(std::io::ErrorKind::BrokenPipe.into());
            }
            self.sent = true;
            let chunk = b"Writing at 0x00001000... (3 %)";
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn test_pump_forwards_then_reports_read_error() {
        let mut seen = Vec::new();
        let mut transcript = Vec::new();
        let err = pump(
            &mut BrokenPipe { sent: false },
            &mut |chunk| seen.extend_from_slice(chunk),
            &mut transcript,
        )
        .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
        assert_eq!(seen, b"Writing at 0x00001000... (3 %)");
        assert_eq!(transcript, seen);
    }

    #[cfg(unix)]
    #[test]
    fn test_abort_reaps_child_and_drain_thread() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        abort(&mut child, stderr);
        assert!(child.try_wait().unwrap().is_some());
    }

    const CHIP_ID: &str = "esptool.py v2.5.1\n\
        Serial port /dev/ttyUSB0\n\
        Connecting........_\n\
        Detecting chip type... ESP32\n\
        Chip is ESP32D0WDQ6 (revision 1)\n\
        Features: WiFi, BT, Dual Core\n\
        MAC: 24:0a:c4:00:00:01\n";

    #[test]
    fn test_parse_chip() {
        assert_eq!(parse_chip(CHIP_ID).as_deref(), Some("ESP32D0WDQ6 (revision 1)"));
        assert_eq!(parse_chip("Connecting....\n"), None);
    }

    #[test]
    fn test_parse_flash_size() {
        let output = "Manufacturer: c8\nDevice: 4016\nDetected flash size: 4MB\nHard resetting via RTS pin...\n";
        assert_eq!(parse_flash_size(output), Some(4 * 1024 * 1024));
        assert_eq!(parse_flash_size("Detected flash size: Unknown\n"), None);
    }

    #[test]
    fn test_fatal_error() {
        let output = "Connecting........_____....\n\nA fatal error occurred: Failed to connect to ESP32: Timed out waiting for packet header\n";
        assert_eq!(
            fatal_error(output),
            Some("Failed to connect to ESP32: Timed out waiting for packet header")
        );
        assert_eq!(fatal_error(CHIP_ID), None);
    }

    #[test]
    fn test_global_args_precede_command() {
        let session = Session {
            program: "esptool.py".into(),
            chip: "auto".into(),
            port: "/dev/ttyUSB0".into(),
            baud: 115_200,
            trace: true,
        };
        let args: Vec<String> = session
            .args(After::HardReset, ["run"])
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        assert_eq!(
            args,
            vec![
                "--chip", "auto", "--port", "/dev/ttyUSB0", "--baud", "115200", "--before",
                "default_reset", "--after", "hard_reset", "--trace", "run",
            ]
        );
    }

    #[test]
    fn test_write_flash_args() {
        let params = FlashParams {
            mode: FlashMode::Dio,
            freq: FlashFreq::F40M,
            size: 4 * 1024 * 1024,
            compress: true,
            verify: false,
        };
        assert_eq!(
            write_flash_args(&params),
            vec!["write_flash", "--flash_mode", "dio", "--flash_freq", "40m", "--flash_size", "4MB", "-z"]
        );

        let params = FlashParams {
            size: 512 * 1024,
            compress: false,
            verify: true,
            ..params
        };
        let args = write_flash_args(&params);
        assert!(args.contains(&"512KB".to_string()));
        assert!(args.ends_with(&["-u".to_string(), "--verify".to_string()]));
    }
}
