//! Programmer registration and dispatch
//!
//! Chip programmers are feature-gated. A programmer is selected by name,
//! optionally followed by parameters: `dummy:size=4MB,fail=erase` or
//! `esptool:bin=/opt/esptool/esptool.py`.

use kitflash_core::ChipProgrammer;
use std::sync::Arc;

/// Information about a programmer
pub struct ProgrammerInfo {
    /// Primary name (used for matching)
    pub name: &'static str,
    /// Alternative names/aliases
    pub aliases: &'static [&'static str],
    /// Short description
    pub description: &'static str,
}

/// Get information about all available programmers (enabled at compile time)
#[allow(unused_mut, clippy::vec_init_then_push)]
pub fn available_programmers() -> Vec<ProgrammerInfo> {
    let mut programmers = Vec::new();

    #[cfg(feature = "esptool")]
    programmers.push(ProgrammerInfo {
        name: "esptool",
        aliases: &["esptool.py"],
        description: "External esptool utility (bin=<path>,chip=<esp32|auto>)",
    });

    #[cfg(feature = "dummy")]
    programmers.push(ProgrammerInfo {
        name: "dummy",
        aliases: &[],
        description: "In-memory device emulator for testing (size=<bytes>,chip=<name>,fail=<phase>)",
    });

    programmers
}

/// Generate help text listing all available programmers
pub fn programmer_help() -> String {
    let programmers = available_programmers();

    if programmers.is_empty() {
        return "No programmers available (recompile with programmer features enabled)".to_string();
    }

    let mut help = String::from("Available programmers:\n");
    for p in &programmers {
        help.push_str(&format!("  {:10} - {}\n", p.name, p.description));
    }
    help
}

/// Generate a short list of programmer names for CLI help
pub fn programmer_names_short() -> String {
    let programmers = available_programmers();
    let names: Vec<&str> = programmers.iter().map(|p| p.name).collect();
    names.join(", ")
}

/// Resolve a name or alias to the canonical programmer name
pub fn find_programmer(name: &str) -> Option<&'static str> {
    available_programmers()
        .into_iter()
        .find(|p| p.name == name || p.aliases.iter().any(|a| *a == name))
        .map(|p| p.name)
}

/// Open the programmer described by `programmer`
#[allow(unused_variables)]
pub fn open_programmer(
    programmer: &str,
) -> Result<Arc<dyn ChipProgrammer>, Box<dyn std::error::Error>> {
    let (name, options) = parse_programmer_string(programmer);

    let canonical_name = match find_programmer(name) {
        Some(n) => n,
        None => return Err(unknown_programmer_error(name)),
    };

    match canonical_name {
        #[cfg(feature = "esptool")]
        "esptool" => {
            let mut esptool = kitflash_esptool::Esptool::new();
            for (key, value) in &options {
                match *key {
                    "bin" => esptool = esptool.with_program(*value),
                    "chip" => esptool = esptool.with_chip(*value),
                    other => return Err(format!("Unknown esptool option: {}", other).into()),
                }
            }
            if !esptool.is_available() {
                log::warn!(
                    "'{}' did not run; install esptool with: pip install esptool",
                    esptool.program()
                );
            }
            Ok(Arc::new(esptool))
        }

        #[cfg(feature = "dummy")]
        "dummy" => {
            let mut config = kitflash_dummy::DummyConfig::default();
            for (key, value) in &options {
                match *key {
                    "size" => config.flash_size = kitflash_core::config::parse_size(value)?,
                    "chip" => config.chip = value.to_string(),
                    "fail" => config.fail_at = Some(value.parse()?),
                    other => return Err(format!("Unknown dummy option: {}", other).into()),
                }
            }
            log::info!("Using dummy programmer ({} byte flash)", config.flash_size);
            Ok(Arc::new(kitflash_dummy::DummyProgrammer::new(config)))
        }

        _ => Err(unknown_programmer_error(name)),
    }
}

/// Split `name:key=value,key=value` into its name and options
pub fn parse_programmer_string(s: &str) -> (&str, Vec<(&str, &str)>) {
    if let Some((name, opts)) = s.split_once(':') {
        let options: Vec<_> = opts
            .split(',')
            .filter_map(|opt| opt.split_once('='))
            .collect();
        (name, options)
    } else {
        (s, Vec::new())
    }
}

fn unknown_programmer_error(name: &str) -> Box<dyn std::error::Error> {
    let mut msg = format!("Unknown programmer: {}\n\n", name);
    msg.push_str(&programmer_help());
    msg.push_str("\nUse 'kitflash list-programmers' for more details");
    msg.into()
}
