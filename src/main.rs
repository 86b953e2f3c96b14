//! kitflash - Firmware flasher for ESP32 maker kits
//!
//! Flashes named firmware profiles (the MicroPython runtime, the factory
//! image) onto a kit connected over USB serial. The work is done by
//! `kitflash-core`; this binary wires it to a chip programmer, a firmware
//! directory and a terminal progress display.

mod cli;
mod commands;
mod programmers;

use clap::Parser;
use cli::{Cli, Commands};
use kitflash_core::{FlashConfig, ProfileRegistry};
use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let registry = load_registry(cli.profiles.as_deref())?;
    log::debug!("Loaded {} firmware profiles", registry.len());

    match cli.command {
        Commands::Flash {
            port,
            profile,
            version,
            programmer,
            firmware_dir,
            baud,
            trace,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(baud) = baud {
                config.flash_baud = baud;
            }
            config.trace |= trace;

            let programmer = programmers::open_programmer(&programmer)?;
            let args = commands::flash::FlashArgs {
                port: &port,
                profile: &profile,
                version: &version,
                firmware_dir: &firmware_dir,
            };
            commands::flash::run(&args, registry, programmer, config)
        }
        Commands::ListProfiles => {
            commands::list_profiles(&registry);
            Ok(())
        }
        Commands::ListPorts { all } => commands::list_ports(all),
        Commands::ListProgrammers => {
            commands::list_programmers();
            Ok(())
        }
    }
}

/// Load the flash configuration, falling back to defaults
fn load_config(path: Option<&Path>) -> Result<FlashConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let config = FlashConfig::load(path)?;
            log::info!("Loaded flash configuration from {}", path.display());
            Ok(config)
        }
        None => Ok(FlashConfig::default()),
    }
}

/// Built-in profiles, extended by a user profile file if given
fn load_registry(path: Option<&Path>) -> Result<ProfileRegistry, Box<dyn std::error::Error>> {
    let mut registry = ProfileRegistry::builtin();
    if let Some(path) = path {
        registry.merge_toml_file(path)?;
        log::info!("Loaded firmware profiles from {}", path.display());
    }
    Ok(registry)
}
