//! Built-in Pixel Kit profiles

use super::address::address;

pub(super) struct ImageSpec {
    pub address: u32,
    pub source: &'static str,
}

impl ImageSpec {
    const fn new(addr: &'static str, source: &'static str) -> Self {
        Self {
            address: address(addr),
            source,
        }
    }
}

pub(super) struct BuiltinProfile {
    pub id: &'static str,
    pub aliases: &'static [&'static str],
    pub description: &'static str,
    pub default_version: &'static str,
    pub versions: &'static [(&'static str, &'static [ImageSpec])],
}

// MicroPython 1.9.4 plus the Pixel32 filesystem image
const RUNTIME_1_9_4: &[ImageSpec] = &[
    ImageSpec::new("0x1000", "esp32-20180511-v1.9.4.bin"),
    ImageSpec::new("0x200000", "pixel32-v0.1.0.img"),
];

// Full flash dump of the factory firmware
const FACTORY_1_0_2: &[ImageSpec] = &[ImageSpec::new("0x0", "rpk_1.0.2_dump.bin")];

// Factory firmware from the extracted release archive
const FACTORY_1_0_2_ARCHIVE: &[ImageSpec] = &[
    ImageSpec::new("0x1000", "rpk_1.0.2/RPK_Bootloader_V1_0_2.bin"),
    ImageSpec::new("0x10000", "rpk_1.0.2/RPK_App_V1_0_2.bin"),
    ImageSpec::new("0x8000", "rpk_1.0.2/RPK_Partitions_V1_0_2.bin"),
];

pub(super) const PROFILES: &[BuiltinProfile] = &[
    BuiltinProfile {
        id: "runtime",
        aliases: &["micropython"],
        description: "MicroPython runtime with the Pixel32 library",
        default_version: "1.9.4",
        versions: &[("1.9.4", RUNTIME_1_9_4)],
    },
    BuiltinProfile {
        id: "factory-restore",
        aliases: &["kanocode"],
        description: "Factory Kano Code firmware",
        default_version: "1.0.2",
        versions: &[
            ("1.0.2", FACTORY_1_0_2),
            ("1.0.2-archive", FACTORY_1_0_2_ARCHIVE),
        ],
    },
];
