//! Firmware byte sources
//!
//! A [`FirmwareProvider`] turns a [`SourceRef`] into an open [`ByteSource`].
//! Opening happens inside the flash job; the job owns every opened source and
//! drops them all when it terminates.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::profile::SourceRef;

/// A readable, finite stream of firmware bytes
pub trait ByteSource: Read + Send {
    /// Total length of the stream in bytes
    fn len(&self) -> u64;

    /// Check if the stream is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves source references to byte sources
pub trait FirmwareProvider: Send + Sync {
    /// Open the bytes behind `source` for reading
    fn open(&self, source: &SourceRef) -> io::Result<Box<dyn ByteSource>>;
}

/// An opened image ready to be written
pub struct FlashImage {
    address: u32,
    source: Box<dyn ByteSource>,
}

impl FlashImage {
    /// Pair an opened source with its flash address
    pub fn new(address: u32, source: Box<dyn ByteSource>) -> Self {
        Self { address, source }
    }

    /// Flash offset
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Image length in bytes
    pub fn len(&self) -> u64 {
        self.source.len()
    }

    /// Check if the image is empty
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// Reader over the image bytes
    pub fn reader(&mut self) -> &mut dyn Read {
        &mut self.source
    }

    /// Read the remaining image bytes into memory
    pub fn read_to_vec(&mut self) -> io::Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.len() as usize);
        self.source.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl core::fmt::Debug for FlashImage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FlashImage")
            .field("address", &self.address)
            .field("len", &self.len())
            .finish()
    }
}

// =============================================================================
// Directory provider
// =============================================================================

/// Firmware files bundled in a directory
///
/// References are paths relative to the directory, e.g. `esp32-v1.9.4.bin`
/// or `rpk_1.0.2/RPK_App_V1_0_2.bin` for a member of an extracted archive.
#[derive(Debug, Clone)]
pub struct BundledFirmware {
    root: PathBuf,
}

impl BundledFirmware {
    /// Create a provider rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the firmware files
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, source: &SourceRef) -> io::Result<PathBuf> {
        let relative = Path::new(source.as_str());
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || source.as_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("firmware reference '{}' leaves the firmware directory", source),
            ));
        }
        Ok(self.root.join(relative))
    }
}

struct FileSource {
    file: File,
    len: u64,
}

impl Read for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }
}

impl FirmwareProvider for BundledFirmware {
    fn open(&self, source: &SourceRef) -> io::Result<Box<dyn ByteSource>> {
        let path = self.resolve(source)?;
        let file = File::open(&path)
            .map_err(|e| io::Error::new(e.kind(), format!("{}: {}", path.display(), e)))?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        log::debug!("Opened {} ({} bytes)", path.display(), metadata.len());
        Ok(Box::new(FileSource {
            file,
            len: metadata.len(),
        }))
    }
}

// =============================================================================
// In-memory provider
// =============================================================================

/// Firmware images held in memory
///
/// Counts how many of its sources are currently open. Clones share the count,
/// so a clone kept aside can check that a job released everything.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    images: HashMap<String, Arc<[u8]>>,
    open: Arc<AtomicUsize>,
}

impl MemoryProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image under a reference name
    pub fn insert(&mut self, reference: impl Into<String>, data: impl Into<Vec<u8>>) {
        let data: Vec<u8> = data.into();
        self.images.insert(reference.into(), Arc::from(data));
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with_image(mut self, reference: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.insert(reference, data);
        self
    }

    /// Number of sources opened and not yet dropped
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

struct MemorySource {
    cursor: Cursor<Arc<[u8]>>,
    open: Arc<AtomicUsize>,
}

impl Read for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }
}

impl Drop for MemorySource {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FirmwareProvider for MemoryProvider {
    fn open(&self, source: &SourceRef) -> io::Result<Box<dyn ByteSource>> {
        let data = self.images.get(source.as_str()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no firmware image named '{}'", source),
            )
        })?;
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySource {
            cursor: Cursor::new(Arc::clone(data)),
            open: Arc::clone(&self.open),
        }))
    }
}
