//! Trustlet image registry.
//!
//! Trustlet images are looked up by UUID. [`FileRegistry`] reads
//! `<dir>/<uuid>.tlbin`; [`MemoryRegistry`] serves images registered in
//! process.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Bytes of the image header the monitor inspects before loading.
pub const TRUSTLET_HEADER_LEN: usize = 128;

/// File extension of trustlet images.
pub const TRUSTLET_EXTENSION: &str = "tlbin";

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No image for this UUID.
    #[error("trustlet {0} not found")]
    NotFound(Uuid),

    /// The image exists but is empty.
    #[error("trustlet {0} image is empty")]
    Empty(Uuid),

    /// The image could not be read.
    #[error("failed to read trustlet {uuid} from {path}: {source}")]
    Io {
        /// Requested trustlet.
        uuid: Uuid,
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// A loaded trustlet image.
#[derive(Debug, Clone)]
pub struct TrustletBlob {
    image: Arc<[u8]>,
}

impl TrustletBlob {
    /// Wraps an image.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Empty`] for an empty image.
    pub fn new(uuid: Uuid, image: impl Into<Arc<[u8]>>) -> Result<Self, RegistryError> {
        let image = image.into();
        if image.is_empty() {
            return Err(RegistryError::Empty(uuid));
        }
        Ok(Self { image })
    }

    /// The image bytes.
    #[must_use]
    pub fn image(&self) -> &Arc<[u8]> {
        &self.image
    }

    /// Image length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.image.len()
    }

    /// Always `false`; empty images are rejected at construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    /// Length of the header the monitor inspects.
    #[must_use]
    pub fn header_len(&self) -> usize {
        self.image.len().min(TRUSTLET_HEADER_LEN)
    }
}

/// Source of trustlet images.
pub trait Registry: Send + Sync {
    /// Loads the image for `uuid`.
    fn load_trustlet(&self, uuid: &Uuid) -> Result<TrustletBlob, RegistryError>;
}

/// Registry backed by a directory of `<uuid>.tlbin` files.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    root: PathBuf,
}

impl FileRegistry {
    /// Creates a registry rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory images are read from.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the image for `uuid`.
    #[must_use]
    pub fn image_path(&self, uuid: &Uuid) -> PathBuf {
        self.root
            .join(format!("{}.{TRUSTLET_EXTENSION}", uuid.as_hyphenated()))
    }
}

impl Registry for FileRegistry {
    fn load_trustlet(&self, uuid: &Uuid) -> Result<TrustletBlob, RegistryError> {
        let path = self.image_path(uuid);
        let image = match std::fs::read(&path) {
            Ok(image) => image,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RegistryError::NotFound(*uuid));
            },
            Err(source) => {
                return Err(RegistryError::Io {
                    uuid: *uuid,
                    path,
                    source,
                });
            },
        };
        debug!(%uuid, path = %path.display(), len = image.len(), "loaded trustlet image");
        TrustletBlob::new(*uuid, image)
    }
}

/// Registry holding images in memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    images: RwLock<HashMap<Uuid, TrustletBlob>>,
}

impl MemoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) an image.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Empty`] for an empty image.
    pub fn insert(&self, uuid: Uuid, image: impl Into<Arc<[u8]>>) -> Result<(), RegistryError> {
        let blob = TrustletBlob::new(uuid, image)?;
        self.images
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(uuid, blob);
        Ok(())
    }
}

impl Registry for MemoryRegistry {
    fn load_trustlet(&self, uuid: &Uuid) -> Result<TrustletBlob, RegistryError> {
        self.images
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(uuid)
            .cloned()
            .ok_or(RegistryError::NotFound(*uuid))
    }
}
