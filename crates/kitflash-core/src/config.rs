//! Flash configuration
//!
//! Device flashing parameters as a typed structure. Every field has a default
//! matching the values the Pixel Kit bootloader expects, so an empty
//! configuration file is valid:
//!
//! ```toml
//! [flash]
//! initial_baud = 115200
//! flash_baud = 921600
//! flash_mode = "dio"
//! flash_freq = "40m"
//! flash_size = "detect"   # or "4MB", "16 MiB", 4194304
//! trace = false
//! compress = false
//! verify = false
//! ```

use core::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Baud rate used to talk to the ROM bootloader during detection
pub const DEFAULT_INITIAL_BAUD: u32 = 115_200;

/// High-speed baud rate negotiated once the stub is running
pub const DEFAULT_FLASH_BAUD: u32 = 921_600;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path of the file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Configuration file is not valid TOML or has invalid values
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// SPI flash access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashMode {
    /// Quad I/O
    Qio,
    /// Quad output
    Qout,
    /// Dual I/O
    #[default]
    Dio,
    /// Dual output
    Dout,
}

impl FlashMode {
    /// Name as understood by the bootloader tooling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qio => "qio",
            Self::Qout => "qout",
            Self::Dio => "dio",
            Self::Dout => "dout",
        }
    }
}

impl fmt::Display for FlashMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SPI flash clock frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum FlashFreq {
    /// 80 MHz
    #[serde(rename = "80m")]
    F80M,
    /// 40 MHz
    #[default]
    #[serde(rename = "40m")]
    F40M,
    /// 26 MHz
    #[serde(rename = "26m")]
    F26M,
    /// 20 MHz
    #[serde(rename = "20m")]
    F20M,
}

impl FlashFreq {
    /// Name as understood by the bootloader tooling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::F80M => "80m",
            Self::F40M => "40m",
            Self::F26M => "26m",
            Self::F20M => "20m",
        }
    }
}

impl fmt::Display for FlashFreq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flash chip size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashSize {
    /// Ask the stub to read the flash JEDEC ID
    #[default]
    Detect,
    /// Fixed size in bytes
    Fixed(u32),
}

impl<'de> Deserialize<'de> for FlashSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum SizeOrName {
            Int(u32),
            Str(String),
        }

        match SizeOrName::deserialize(deserializer)? {
            SizeOrName::Int(n) => Ok(Self::Fixed(n)),
            SizeOrName::Str(s) if s.trim().eq_ignore_ascii_case("detect") => Ok(Self::Detect),
            SizeOrName::Str(s) => parse_size(&s)
                .map(Self::Fixed)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Parse a size string like "4MB", "16 MiB", "0x400000" or "4096"
pub fn parse_size(s: &str) -> Result<u32, String> {
    let s = s.trim();

    if let Ok(n) = s.parse::<u32>() {
        return Ok(n);
    }

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u32::from_str_radix(hex.trim(), 16).map_err(|e| format!("invalid hex: {}", e));
    }

    let lower = s.to_lowercase();
    let (num_str, multiplier) = if let Some(n) = lower.strip_suffix("mib") {
        (n.trim(), 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("mb") {
        (n.trim(), 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("kib") {
        (n.trim(), 1024)
    } else if let Some(n) = lower.strip_suffix("kb") {
        (n.trim(), 1024)
    } else {
        return Err(format!("invalid size: {}", s));
    };

    let num: u32 = num_str
        .parse()
        .map_err(|_| format!("invalid size: {}", s))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size too large: {}", s))
}

/// Flashing configuration shared by every job of a supervisor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlashConfig {
    /// Baud rate for chip detection (ROM bootloader)
    pub initial_baud: u32,
    /// Baud rate after the stub is running
    pub flash_baud: u32,
    /// SPI flash mode written into the image header
    pub flash_mode: FlashMode,
    /// SPI flash frequency written into the image header
    pub flash_freq: FlashFreq,
    /// Flash size, detected by default
    pub flash_size: FlashSize,
    /// Trace bootloader traffic
    pub trace: bool,
    /// Compress images on the wire
    pub compress: bool,
    /// Verify written data
    pub verify: bool,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            initial_baud: DEFAULT_INITIAL_BAUD,
            flash_baud: DEFAULT_FLASH_BAUD,
            flash_mode: FlashMode::default(),
            flash_freq: FlashFreq::default(),
            flash_size: FlashSize::default(),
            trace: false,
            compress: false,
            verify: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    flash: FlashConfig,
}

impl FlashConfig {
    /// Parse a configuration from a TOML string with a `[flash]` table
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        Ok(file.flash)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Resolve the parameters handed to the stub once the flash size is known
    pub fn params(&self, size: u32) -> FlashParams {
        FlashParams {
            mode: self.flash_mode,
            freq: self.flash_freq,
            size,
            compress: self.compress,
            verify: self.verify,
        }
    }
}

/// Parameters applied to the flash chip before erasing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashParams {
    /// SPI flash mode
    pub mode: FlashMode,
    /// SPI flash frequency
    pub freq: FlashFreq,
    /// Flash size in bytes
    pub size: u32,
    /// Compress images on the wire
    pub compress: bool,
    /// Verify written data
    pub verify: bool,
}
