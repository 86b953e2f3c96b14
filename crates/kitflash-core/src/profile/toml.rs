//! TOML profile table parsing
//!
//! Extra profiles (or newer versions of the built-in ones) can be supplied in
//! a TOML file:
//!
//! ```toml
//! [[profile]]
//! id = "runtime"
//! version = "1.10.0"
//! default = true
//!
//! [[profile.image]]
//! address = "0x1000"
//! source = "esp32-v1.10.bin"
//!
//! [[profile.image]]
//! address = 0x200000
//! source = "pixel32-v0.2.0.img"
//! ```
//!
//! A malformed address is reported when the file is loaded, never when a job
//! runs.

use std::fs;
use std::path::{Path, PathBuf};

use super::{parse_address, AddressError, ImageDescriptor, ProfileError, ProfileRegistry};
use thiserror::Error;

/// Errors while loading a profile table file
#[derive(Debug, Error)]
pub enum ProfileFileError {
    /// File could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path of the file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Not valid TOML or missing fields
    #[error("invalid profile table: {0}")]
    Parse(#[from] ::toml::de::Error),
    /// Malformed address literal
    #[error("invalid address '{literal}' in profile '{id}': {source}")]
    Address {
        /// Profile identifier
        id: String,
        /// The literal as written
        literal: String,
        /// Parse error
        #[source]
        source: AddressError,
    },
    /// Table content rejected by the registry
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlProfileFile {
    #[serde(default)]
    profile: Vec<TomlProfile>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlProfile {
    id: String,
    version: String,
    #[serde(default)]
    default: bool,
    #[serde(default)]
    aliases: Vec<String>,
    description: Option<String>,
    #[serde(default)]
    image: Vec<TomlImage>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlImage {
    address: TomlAddress,
    source: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum TomlAddress {
    Int(u32),
    Str(String),
}

impl ProfileRegistry {
    /// Merge profiles from a TOML string into this registry
    ///
    /// Entries with the id and version of an existing profile replace it.
    /// The registry is left untouched unless every entry is accepted.
    pub fn merge_toml_str(&mut self, content: &str) -> Result<(), ProfileFileError> {
        let file: TomlProfileFile = ::toml::from_str(content)?;

        let mut staged = self.clone();
        for profile in file.profile {
            let mut images = Vec::with_capacity(profile.image.len());
            for image in profile.image {
                let address = match image.address {
                    TomlAddress::Int(n) => n,
                    TomlAddress::Str(literal) => {
                        parse_address(literal.trim()).map_err(|source| {
                            ProfileFileError::Address {
                                id: profile.id.clone(),
                                literal: literal.clone(),
                                source,
                            }
                        })?
                    }
                };
                images.push(ImageDescriptor::new(address, image.source));
            }

            staged.add_version(&profile.id, &profile.version, images, profile.default)?;
            if !profile.aliases.is_empty() || profile.description.is_some() {
                staged.describe(
                    &profile.id,
                    &profile.aliases,
                    profile.description.as_deref().unwrap_or_default(),
                );
            }
            log::debug!("Loaded profile {} version {}", profile.id, profile.version);
        }

        *self = staged;
        Ok(())
    }

    /// Merge profiles from a TOML file into this registry
    pub fn merge_toml_file(&mut self, path: &Path) -> Result<(), ProfileFileError> {
        let content = fs::read_to_string(path).map_err(|source| ProfileFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.merge_toml_str(&content)
    }
}
