//! CLI argument parsing

use crate::programmers;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Generate dynamic help text for the programmer argument
fn programmer_help() -> String {
    format!(
        "Chip programmer to use [available: {}]",
        programmers::programmer_names_short()
    )
}

#[derive(Parser)]
#[command(name = "kitflash")]
#[command(author, version, about = "Firmware flasher for ESP32 maker kits", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Flash configuration file (TOML with a [flash] table)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Additional firmware profiles (TOML with [[profile]] entries)
    #[arg(long, global = true)]
    pub profiles: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Flash a firmware profile onto a device
    Flash {
        /// Serial port of the device
        #[arg(short, long)]
        port: String,

        /// Firmware profile identifier or alias (e.g. runtime, factory-restore)
        #[arg(short = 'f', long)]
        profile: String,

        /// Profile version
        #[arg(long, default_value = "latest")]
        version: String,

        /// Chip programmer to use
        #[arg(long, default_value = "esptool", help = programmer_help())]
        programmer: String,

        /// Directory holding the firmware files
        #[arg(short = 'd', long, default_value = "firmware")]
        firmware_dir: PathBuf,

        /// Baud rate once the flasher stub is running
        #[arg(short, long)]
        baud: Option<u32>,

        /// Trace bootloader traffic
        #[arg(long)]
        trace: bool,
    },

    /// List firmware profiles
    ListProfiles,

    /// List serial ports with an attached kit
    ListPorts {
        /// Show every serial port, not only known kits
        #[arg(short, long)]
        all: bool,
    },

    /// List supported chip programmers
    ListProgrammers,
}
