//! JSON persistence for playlists and the "now playing" pointer.
//!
//! `playlists.json` maps playlist names to arrays of flat track objects.
//! `currentTrack.json` records the active track either by position in a
//! playlist or, for an orphaned track, by its full attribute bag.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde_json::{Map, Value};

use crate::playlist::Playlist;
use crate::track::{Track, TrackRef, TrackTags};

const PLAYLISTS_FILE_NAME: &str = "playlists.json";
const ACTIVE_TRACK_FILE_NAME: &str = "currentTrack.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Persisted pointer to the active track.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTrackRecord {
    pub playlist: Option<String>,
    pub track_index: Option<i64>,
    #[serde(default)]
    pub tags: Map<String, Value>,
}

impl ActiveTrackRecord {
    /// Record for `track`, located at `index` in `playlist` when owned.
    pub fn for_track(track: &TrackRef, location: Option<(&str, usize)>) -> Self {
        Self {
            playlist: location.map(|(name, _)| name.to_string()),
            track_index: location.map(|(_, index)| index as i64),
            tags: track.tags().to_map(),
        }
    }
}

/// Serializes playlists in order into the `playlists.json` shape.
pub fn playlists_to_value(playlists: &[Playlist]) -> Value {
    let mut root = Map::new();
    for playlist in playlists {
        let tracks = playlist
            .iter()
            .map(|track| track.tags().to_value())
            .collect();
        root.insert(playlist.name().to_string(), Value::Array(tracks));
    }
    Value::Object(root)
}

/// Builds playlists from the `playlists.json` shape, setting each track's
/// owner. Any structural problem is reported as a reason string.
pub fn playlists_from_value(value: Value) -> Result<Vec<Playlist>, String> {
    let Value::Object(root) = value else {
        return Err("top level is not an object".to_string());
    };
    let mut playlists = Vec::with_capacity(root.len());
    for (name, entries) in root {
        let Value::Array(entries) = entries else {
            return Err(format!("playlist {name:?} is not an array"));
        };
        let mut playlist = Playlist::new(name.clone());
        for (index, entry) in entries.into_iter().enumerate() {
            let tags = TrackTags::from_value(entry)
                .map_err(|error| format!("playlist {name:?} track {index}: {error}"))?;
            let track = Track::new(tags);
            track.set_playlist(Some(name.clone()));
            playlist.push(track);
        }
        playlists.push(playlist);
    }
    Ok(playlists)
}

/// Reads and writes the persisted state files of one state directory.
#[derive(Debug, Clone)]
pub struct PlaylistStore {
    playlists_path: PathBuf,
    active_track_path: PathBuf,
}

impl PlaylistStore {
    pub fn new(directory: &Path) -> Self {
        Self {
            playlists_path: directory.join(PLAYLISTS_FILE_NAME),
            active_track_path: directory.join(ACTIVE_TRACK_FILE_NAME),
        }
    }

    pub fn playlists_path(&self) -> &Path {
        &self.playlists_path
    }

    fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn write_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
        let io_error = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, content).map_err(io_error)?;
        fs::rename(&temp_path, path).map_err(io_error)
    }

    /// A missing file yields no playlists; unreadable or malformed content
    /// is an error the caller must not paper over.
    pub fn load_playlists(&self) -> Result<Vec<Playlist>, StoreError> {
        let Some(content) = Self::read_optional(&self.playlists_path)? else {
            debug!(
                "PlaylistStore: no playlists at {}",
                self.playlists_path.display()
            );
            return Ok(Vec::new());
        };
        let malformed = |reason: String| StoreError::Malformed {
            path: self.playlists_path.clone(),
            reason,
        };
        let value: Value =
            serde_json::from_str(&content).map_err(|error| malformed(error.to_string()))?;
        playlists_from_value(value).map_err(malformed)
    }

    pub fn save_playlists(&self, playlists: &[Playlist]) -> Result<(), StoreError> {
        let serialized = playlists_to_value(playlists).to_string();
        Self::write_atomic(&self.playlists_path, &serialized)
    }

    /// Malformed pointer files are logged and treated as absent.
    pub fn load_active_track(&self) -> Result<Option<ActiveTrackRecord>, StoreError> {
        let Some(content) = Self::read_optional(&self.active_track_path)? else {
            return Ok(None);
        };
        match serde_json::from_str::<ActiveTrackRecord>(&content) {
            Ok(record) => Ok(Some(record)),
            Err(error) => {
                warn!(
                    "PlaylistStore: ignoring unreadable {}: {}",
                    self.active_track_path.display(),
                    error
                );
                Ok(None)
            }
        }
    }

    /// Writes the pointer, or removes it when there is no active track.
    pub fn save_active_track(&self, record: Option<&ActiveTrackRecord>) -> Result<(), StoreError> {
        match record {
            Some(record) => {
                let serialized =
                    serde_json::to_string(record).map_err(|error| StoreError::Malformed {
                        path: self.active_track_path.clone(),
                        reason: error.to_string(),
                    })?;
                Self::write_atomic(&self.active_track_path, &serialized)
            }
            None => match fs::remove_file(&self.active_track_path) {
                Ok(()) => Ok(()),
                Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
                Err(source) => Err(StoreError::Io {
                    path: self.active_track_path.clone(),
                    source,
                }),
            },
        }
    }
}
