//! Firmware profile registry
//!
//! A profile is a named, versioned set of firmware images and the flash
//! addresses they are written to. The registry is pure data: it hands out
//! addresses and [`SourceRef`]s, and the bytes behind a reference are only
//! read when a job opens them through a
//! [`FirmwareProvider`](crate::source::FirmwareProvider).

mod address;
mod builtin;
mod toml;

pub use address::{parse_address, AddressError};
pub use self::toml::ProfileFileError;

use core::fmt;

use crate::error::{Error, Result};
use thiserror::Error;

/// Version string that selects a profile's default version
pub const LATEST: &str = "latest";

/// Reference to the bytes of one image
///
/// Interpreted by the firmware provider, typically as a path relative to a
/// firmware directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef(String);

impl SourceRef {
    /// Create a source reference
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Get the reference string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One image of a profile: where it goes and where its bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    /// Flash offset
    pub address: u32,
    /// Byte source reference
    pub source: SourceRef,
}

impl ImageDescriptor {
    /// Create an image descriptor
    pub fn new(address: u32, source: impl Into<String>) -> Self {
        Self {
            address,
            source: SourceRef::new(source),
        }
    }
}

/// A resolved profile
///
/// Immutable once returned by [`ProfileRegistry::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareProfile {
    id: String,
    version: String,
    images: Vec<ImageDescriptor>,
}

impl FirmwareProfile {
    /// Canonical profile identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolved version
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Images in write order
    pub fn images(&self) -> &[ImageDescriptor] {
        &self.images
    }
}

/// Errors while building a registry table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    /// Profile version has no images
    #[error("profile '{id}' version '{version}' has no images")]
    Empty {
        /// Profile identifier
        id: String,
        /// Profile version
        version: String,
    },
    /// Two images target the same address
    #[error("profile '{id}' version '{version}' writes twice to 0x{address:08X}")]
    DuplicateAddress {
        /// Profile identifier
        id: String,
        /// Profile version
        version: String,
        /// Duplicated address
        address: u32,
    },
    /// Identifier or version is blank
    #[error("profile identifiers and versions must not be empty")]
    BlankName,
}

/// Summary of one registered profile version, for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSummary {
    /// Profile identifier
    pub id: String,
    /// Alternative names
    pub aliases: Vec<String>,
    /// Short description
    pub description: String,
    /// Version
    pub version: String,
    /// Whether `latest` resolves to this version
    pub is_default: bool,
    /// Images of this version
    pub images: Vec<ImageDescriptor>,
}

#[derive(Debug, Clone)]
struct VersionEntry {
    version: String,
    images: Vec<ImageDescriptor>,
}

#[derive(Debug, Clone)]
struct ProfileEntry {
    id: String,
    aliases: Vec<String>,
    description: String,
    default_version: String,
    versions: Vec<VersionEntry>,
}

impl ProfileEntry {
    fn matches(&self, name: &str) -> bool {
        self.id.eq_ignore_ascii_case(name) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// Maps profile identifiers and versions to image lists
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    entries: Vec<ProfileEntry>,
}

impl ProfileRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in Pixel Kit profiles
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for profile in builtin::PROFILES {
            for (version, images) in profile.versions {
                let images = images
                    .iter()
                    .map(|spec| ImageDescriptor::new(spec.address, spec.source))
                    .collect();
                registry.insert(
                    profile.id,
                    version,
                    images,
                    *version == profile.default_version,
                );
            }
            if let Some(entry) = registry.find_mut(profile.id) {
                entry.description = profile.description.to_string();
                entry.aliases = profile.aliases.iter().map(|a| a.to_string()).collect();
            }
        }
        registry
    }

    /// Register (or replace) one version of a profile
    ///
    /// The first version registered for a profile becomes its default unless a
    /// later call passes `make_default`.
    pub fn add_version(
        &mut self,
        id: &str,
        version: &str,
        images: Vec<ImageDescriptor>,
        make_default: bool,
    ) -> core::result::Result<(), ProfileError> {
        if id.trim().is_empty() || version.trim().is_empty() {
            return Err(ProfileError::BlankName);
        }
        if images.is_empty() {
            return Err(ProfileError::Empty {
                id: id.to_string(),
                version: version.to_string(),
            });
        }
        let mut addresses: Vec<u32> = images.iter().map(|i| i.address).collect();
        addresses.sort_unstable();
        if let Some(pair) = addresses.windows(2).find(|w| w[0] == w[1]) {
            return Err(ProfileError::DuplicateAddress {
                id: id.to_string(),
                version: version.to_string(),
                address: pair[0],
            });
        }

        self.insert(id, version, images, make_default);
        Ok(())
    }

    fn insert(&mut self, id: &str, version: &str, images: Vec<ImageDescriptor>, make_default: bool) {
        let entry = match self.entries.iter().position(|e| e.id.eq_ignore_ascii_case(id)) {
            Some(index) => &mut self.entries[index],
            None => {
                self.entries.push(ProfileEntry {
                    id: id.to_string(),
                    aliases: Vec::new(),
                    description: String::new(),
                    default_version: version.to_string(),
                    versions: Vec::new(),
                });
                let last = self.entries.len() - 1;
                &mut self.entries[last]
            }
        };

        match entry.versions.iter_mut().find(|v| v.version == version) {
            Some(existing) => existing.images = images,
            None => entry.versions.push(VersionEntry {
                version: version.to_string(),
                images,
            }),
        }
        if make_default {
            entry.default_version = version.to_string();
        }
    }

    /// Set aliases and description of an already registered profile
    pub fn describe(&mut self, id: &str, aliases: &[String], description: &str) {
        if let Some(entry) = self.find_mut(id) {
            entry.aliases = aliases.to_vec();
            entry.description = description.to_string();
        }
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut ProfileEntry> {
        self.entries.iter_mut().find(|e| e.id.eq_ignore_ascii_case(id))
    }

    /// Resolve a profile identifier (or alias) and version
    ///
    /// An empty version or [`LATEST`] selects the profile's default version.
    pub fn resolve(&self, id: &str, version: &str) -> Result<FirmwareProfile> {
        let unknown = || Error::UnknownProfile {
            id: id.to_string(),
            version: version.to_string(),
        };

        let entry = self.entries.iter().find(|e| e.matches(id)).ok_or_else(unknown)?;
        let wanted = if version.is_empty() || version.eq_ignore_ascii_case(LATEST) {
            entry.default_version.as_str()
        } else {
            version
        };
        let found = entry
            .versions
            .iter()
            .find(|v| v.version == wanted)
            .ok_or_else(unknown)?;

        Ok(FirmwareProfile {
            id: entry.id.clone(),
            version: found.version.clone(),
            images: found.images.clone(),
        })
    }

    /// List every registered profile version
    pub fn summaries(&self) -> Vec<ProfileSummary> {
        self.entries
            .iter()
            .flat_map(|entry| {
                entry.versions.iter().map(move |v| ProfileSummary {
                    id: entry.id.clone(),
                    aliases: entry.aliases.clone(),
                    description: entry.description.clone(),
                    version: v.version.clone(),
                    is_default: v.version == entry.default_version,
                    images: v.images.clone(),
                })
            })
            .collect()
    }

    /// Number of profiles (not versions)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Find the first pair of overlapping regions
///
/// Regions are `(address, length)` pairs. Returns the addresses of the lower
/// region and of the region that starts inside it.
pub fn find_overlap(regions: &[(u32, u64)]) -> Option<(u32, u32)> {
    let mut sorted = regions.to_vec();
    sorted.sort_unstable_by_key(|&(addr, _)| addr);
    sorted.windows(2).find_map(|pair| {
        let (first, len) = pair[0];
        let (second, _) = pair[1];
        (first as u64 + len > second as u64).then_some((first, second))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_runtime_default() {
        let registry = ProfileRegistry::builtin();
        let profile = registry.resolve("runtime", LATEST).unwrap();
        assert_eq!(profile.id(), "runtime");
        assert_eq!(profile.version(), "1.9.4");
        let addrs: Vec<u32> = profile.images().iter().map(|i| i.address).collect();
        assert_eq!(addrs, vec![0x1000, 0x200000]);
    }

    #[test]
    fn test_resolve_alias_and_version() {
        let registry = ProfileRegistry::builtin();
        let profile = registry.resolve("kanocode", "1.0.2-archive").unwrap();
        assert_eq!(profile.id(), "factory-restore");
        let addrs: Vec<u32> = profile.images().iter().map(|i| i.address).collect();
        assert_eq!(addrs, vec![0x1000, 0x10000, 0x8000]);
    }

    #[test]
    fn test_unknown_profile() {
        let registry = ProfileRegistry::builtin();
        let err = registry.resolve("does-not-exist", LATEST).unwrap_err();
        assert!(matches!(err, Error::UnknownProfile { .. }));
    }

    #[test]
    fn test_unknown_version() {
        let registry = ProfileRegistry::builtin();
        let err = registry.resolve("runtime", "0.0.1").unwrap_err();
        assert!(matches!(err, Error::UnknownProfile { ref version, .. } if version == "0.0.1"));
    }

    #[test]
    fn test_every_builtin_profile_non_empty() {
        let registry = ProfileRegistry::builtin();
        assert!(!registry.is_empty());
        for summary in registry.summaries() {
            assert!(!summary.images.is_empty(), "{} {}", summary.id, summary.version);
        }
    }

    #[test]
    fn test_add_version_validation() {
        let mut registry = ProfileRegistry::new();
        assert_eq!(
            registry.add_version("custom", "1", Vec::new(), false),
            Err(ProfileError::Empty {
                id: "custom".into(),
                version: "1".into()
            })
        );
        let dup = vec![
            ImageDescriptor::new(0x1000, "a.bin"),
            ImageDescriptor::new(0x1000, "b.bin"),
        ];
        assert!(matches!(
            registry.add_version("custom", "1", dup, false),
            Err(ProfileError::DuplicateAddress { address: 0x1000, .. })
        ));
        assert_eq!(
            registry.add_version(" ", "1", vec![ImageDescriptor::new(0, "a.bin")], false),
            Err(ProfileError::BlankName)
        );
    }

    #[test]
    fn test_default_version_selection() {
        let mut registry = ProfileRegistry::new();
        registry
            .add_version("custom", "1", vec![ImageDescriptor::new(0, "v1.bin")], false)
            .unwrap();
        registry
            .add_version("custom", "2", vec![ImageDescriptor::new(0, "v2.bin")], false)
            .unwrap();
        assert_eq!(registry.resolve("custom", "").unwrap().version(), "1");

        registry
            .add_version("custom", "2", vec![ImageDescriptor::new(0, "v2b.bin")], true)
            .unwrap();
        let profile = registry.resolve("custom", LATEST).unwrap();
        assert_eq!(profile.version(), "2");
        assert_eq!(profile.images()[0].source.as_str(), "v2b.bin");
    }

    #[test]
    fn test_find_overlap() {
        assert_eq!(find_overlap(&[(0x1000, 4096), (0x200000, 2048)]), None);
        assert_eq!(find_overlap(&[(0x1000, 0x1000), (0x2000, 16)]), None);
        assert_eq!(
            find_overlap(&[(0x2000, 16), (0x1000, 0x1001)]),
            Some((0x1000, 0x2000))
        );
        assert_eq!(find_overlap(&[(0xFFFF_FFFF, 2), (0, 1)]), None);
    }
}
