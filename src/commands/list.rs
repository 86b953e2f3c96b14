//! List commands implementation

use crate::programmers;
use kitflash_core::ProfileRegistry;
use serialport::SerialPortType;

/// USB VID:PID of the kits' FTDI serial bridge
const KIT_USB_ID: (u16, u16) = (0x0403, 0x6015);

/// List all supported programmers
pub fn list_programmers() {
    println!("Supported programmers:");
    println!();
    for p in programmers::available_programmers() {
        let aliases = if p.aliases.is_empty() {
            String::new()
        } else {
            format!(" (aliases: {})", p.aliases.join(", "))
        };
        println!("  {:10} - {}{}", p.name, p.description, aliases);
    }
}

/// List every profile version in the registry
pub fn list_profiles(registry: &ProfileRegistry) {
    println!("Firmware profiles:");
    println!();
    println!("{:<18} {:<16} {:<8} {}", "Profile", "Version", "Default", "Images");
    println!("{}", "-".repeat(72));

    for summary in registry.summaries() {
        let images: Vec<String> = summary
            .images
            .iter()
            .map(|i| format!("0x{:06X} {}", i.address, i.source))
            .collect();
        println!(
            "{:<18} {:<16} {:<8} {}",
            summary.id,
            summary.version,
            if summary.is_default { "yes" } else { "" },
            images.join(", ")
        );
        if summary.is_default && !summary.aliases.is_empty() {
            println!("{:<18} aliases: {}", "", summary.aliases.join(", "));
        }
    }
}

/// List serial ports, only those with a kit attached unless `all` is set
pub fn list_ports(all: bool) -> Result<(), Box<dyn std::error::Error>> {
    let ports = serialport::available_ports()?;
    let mut shown = 0;

    for port in ports {
        let usb = match &port.port_type {
            SerialPortType::UsbPort(info) => Some(info),
            _ => None,
        };
        let is_kit = usb.is_some_and(|info| (info.vid, info.pid) == KIT_USB_ID);
        if !all && !is_kit {
            continue;
        }

        shown += 1;
        match usb {
            Some(info) => println!(
                "{:<24} {:04x}:{:04x} {}{}",
                port.port_name,
                info.vid,
                info.pid,
                info.product.as_deref().unwrap_or(""),
                if is_kit { " [kit]" } else { "" }
            ),
            None => println!("{}", port.port_name),
        }
    }

    if shown == 0 {
        if all {
            println!("No serial ports found");
        } else {
            println!("No kit found (use --all to show every serial port)");
        }
    }
    Ok(())
}
