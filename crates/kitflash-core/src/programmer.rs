//! Chip programmer port
//!
//! The serial bootloader protocol is implemented outside this crate. A job
//! drives it through these traits, one phase at a time:
//!
//! ```text
//! ChipProgrammer::detect_chip ──▶ Chip::run_stub ──▶ Stub
//!                                                     ├─ change_baud
//!                                                     ├─ detect_flash_size / set_flash_params
//!                                                     ├─ erase
//!                                                     ├─ write (raw output callback)
//!                                                     └─ hard_reset
//! ```
//!
//! A [`Chip`] or [`Stub`] owns the serial connection; dropping it closes the
//! port.

use crate::config::FlashParams;
use crate::source::FlashImage;
use thiserror::Error;

/// Errors reported by a chip programmer
#[derive(Debug, Error)]
pub enum ProgrammerError {
    /// Serial port could not be opened or configured
    #[error("serial port error: {0}")]
    Serial(String),
    /// I/O error during communication
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// No compatible chip answered
    #[error("no compatible chip responded")]
    NoChip,
    /// Timeout waiting for the bootloader
    #[error("timed out waiting for the bootloader")]
    Timeout,
    /// Unexpected response from the bootloader
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Image does not fit into the flash chip
    #[error("image at 0x{address:08X} ({len} bytes) exceeds flash size of {flash_size} bytes")]
    OutOfBounds {
        /// Image address
        address: u32,
        /// Image length
        len: u64,
        /// Flash size in bytes
        flash_size: u32,
    },
}

/// Result type for programmer operations
pub type Result<T> = core::result::Result<T, ProgrammerError>;

/// Entry point of a chip programmer
///
/// Shared between jobs, so it must not hold per-connection state.
pub trait ChipProgrammer: Send + Sync {
    /// Open `port` at `baud` and detect the attached chip
    fn detect_chip(&self, port: &str, baud: u32, trace: bool) -> Result<Box<dyn Chip>>;
}

/// A detected chip talking to its ROM bootloader
pub trait Chip: Send {
    /// Human readable chip description
    fn description(&self) -> String;

    /// Upload and start the flasher stub
    fn run_stub(self: Box<Self>) -> Result<Box<dyn Stub>>;
}

/// A running flasher stub
pub trait Stub: Send {
    /// Switch the connection to a new baud rate
    fn change_baud(&mut self, rate: u32) -> Result<()>;

    /// Read the flash size in bytes from the flash chip
    fn detect_flash_size(&mut self) -> Result<u32>;

    /// Apply flash parameters
    fn set_flash_params(&mut self, params: &FlashParams) -> Result<()>;

    /// Erase the entire flash
    fn erase(&mut self) -> Result<()>;

    /// Write images at their addresses
    ///
    /// Every chunk of console-style output the programmer produces while
    /// writing is handed to `on_output`.
    fn write(&mut self, images: &mut [FlashImage], on_output: &mut dyn FnMut(&[u8])) -> Result<()>;

    /// Hard-reset the chip into the new firmware
    fn hard_reset(&mut self) -> Result<()>;
}
