//! Process-wide artwork cache keyed by canonical video id.
//!
//! One instance is built by the composition root and shared by reference.
//! The in-memory map is a write-through cache over one file per id in the
//! thumbnail directory and is populated lazily on read. An entry is only
//! ever replaced by an image with a strictly larger pixel area.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use image::GenericImageView;
use log::{debug, warn};

/// Decoded-size information plus the encoded bytes of one thumbnail.
#[derive(Clone, PartialEq, Eq)]
pub struct Thumbnail {
    bytes: Arc<[u8]>,
    width: u32,
    height: u32,
}

impl fmt::Debug for Thumbnail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thumbnail")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl Thumbnail {
    /// Decodes `bytes` to learn the image dimensions. Returns `None` for
    /// data no supported decoder accepts.
    pub fn decode(bytes: Vec<u8>) -> Option<Thumbnail> {
        let decoded = image::load_from_memory(&bytes).ok()?;
        let (width, height) = decoded.dimensions();
        Some(Thumbnail {
            bytes: Arc::from(bytes),
            width,
            height,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ThumbnailError {
    #[error("invalid thumbnail id {0:?}")]
    InvalidId(String),
    #[error("image data could not be decoded")]
    Undecodable,
    #[error("failed to write thumbnail {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Shared thumbnail store. See the module docs for the replacement policy.
pub struct ThumbnailCache {
    directory: PathBuf,
    entries: RwLock<HashMap<String, Thumbnail>>,
    file_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
        && !id.ends_with(".tmp")
}

impl ThumbnailCache {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            entries: RwLock::new(HashMap::new()),
            file_locks: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.directory.join(id)
    }

    fn file_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Memory hit, else disk read. Any read or decode failure yields `None`.
    pub fn get_cached(&self, id: &str) -> Option<Thumbnail> {
        if !is_valid_id(id) {
            return None;
        }
        if let Some(hit) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            return Some(hit.clone());
        }

        let bytes = fs::read(self.path_for(id)).ok()?;
        let Some(thumbnail) = Thumbnail::decode(bytes) else {
            debug!("ThumbnailCache: undecodable file for {}", id);
            return None;
        };
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Some(entries.entry(id.to_string()).or_insert(thumbnail).clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get_cached(id).is_some()
    }

    /// Replaces the cached image for `id` if `thumbnail` has a strictly
    /// larger pixel area. Returns whether the entry changed.
    pub fn update(&self, id: &str, thumbnail: Thumbnail) -> bool {
        if !is_valid_id(id) {
            return false;
        }
        // Pulls a persisted image into memory so it takes part in the comparison.
        let _ = self.get_cached(id);
        self.insert_if_larger(id, thumbnail)
    }

    fn insert_if_larger(&self, id: &str, thumbnail: Thumbnail) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let cached_area = entries.get(id).map(Thumbnail::area).unwrap_or(0);
        if thumbnail.area() <= cached_area {
            return false;
        }
        entries.insert(id.to_string(), thumbnail);
        true
    }

    /// Decodes `bytes` and, when they beat the current entry, persists them
    /// and then replaces the entry. A failed write leaves the entry as it
    /// was. Returns whether the entry changed.
    pub fn store(&self, id: &str, bytes: Vec<u8>) -> Result<bool, ThumbnailError> {
        if !is_valid_id(id) {
            return Err(ThumbnailError::InvalidId(id.to_string()));
        }
        let thumbnail = Thumbnail::decode(bytes).ok_or(ThumbnailError::Undecodable)?;

        let lock = self.file_lock(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let cached_area = self.get_cached(id).map(|cached| cached.area()).unwrap_or(0);
        if thumbnail.area() <= cached_area {
            return Ok(false);
        }
        self.write_file(id, thumbnail.bytes())?;
        Ok(self.insert_if_larger(id, thumbnail))
    }

    fn write_file(&self, id: &str, bytes: &[u8]) -> Result<(), ThumbnailError> {
        let target_path = self.path_for(id);
        let temp_path = self.directory.join(format!("{id}.tmp"));
        let io_error = |source| ThumbnailError::Io {
            path: target_path.clone(),
            source,
        };
        fs::create_dir_all(&self.directory).map_err(io_error)?;
        fs::write(&temp_path, bytes).map_err(io_error)?;
        if let Err(source) = fs::rename(&temp_path, &target_path) {
            warn!(
                "ThumbnailCache: failed to move {} into place",
                temp_path.display()
            );
            let _ = fs::remove_file(&temp_path);
            return Err(io_error(source));
        }
        Ok(())
    }
}
