//! Track entity shared between the playlist owner, background jobs and the
//! playback session.
//!
//! Tracks are identified by handle, not by value: two `TrackRef`s denote the
//! same track iff they point at the same allocation. All attribute reads and
//! writes go through one lock per track so that enrichment jobs can update a
//! track while the owner thread reads it.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Value};
use uuid::Uuid;

/// Shared handle to a track.
pub type TrackRef = Arc<Track>;

const KEY_TITLE: &str = "title";
const KEY_VIDEO_ID: &str = "videoId";
const KEY_DURATION: &str = "duration";
const KEY_CHANNEL: &str = "channel";
const KEY_POSITION: &str = "position";
const KEY_PLAY_TIME: &str = "playTime";
const KEY_ARTIST: &str = "artist";
const KEY_ALBUM: &str = "album";
const KEY_TRACK: &str = "track";
const KEY_ICON_URL: &str = "iconUrl";

/// Error raised when a persisted attribute bag cannot become a track.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagError {
    #[error("track entry is missing a string `title`")]
    MissingTitle,
    #[error("track entry is not a JSON object")]
    NotAnObject,
}

/// Attribute bag of a track: typed known fields plus residual fields that are
/// carried through persistence untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackTags {
    pub title: String,
    /// Canonical id on the video platform, once resolved.
    pub video_id: Option<String>,
    /// Length in seconds.
    pub duration: Option<u64>,
    pub channel: Option<String>,
    /// Saved playback offset in whole seconds. Fractional values on disk are
    /// rounded when read.
    pub position: u64,
    /// Cumulative seconds played.
    pub play_time: u64,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track: Option<String>,
    pub icon_url: Option<String>,
    /// Fields no component knows about. Values are kept verbatim.
    pub extra: Map<String, Value>,
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key) {
        Some(Value::String(_)) => match map.remove(key) {
            Some(Value::String(value)) => Some(value),
            _ => None,
        },
        Some(Value::Null) => {
            map.remove(key);
            None
        }
        _ => None,
    }
}

fn take_u64(map: &mut Map<String, Value>, key: &str) -> Option<u64> {
    let value = map.get(key)?.as_u64()?;
    map.remove(key);
    Some(value)
}

fn take_seconds(map: &mut Map<String, Value>, key: &str) -> u64 {
    let seconds = match map.get(key) {
        Some(Value::Number(number)) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| *v >= 0.0).map(|v| v.round() as u64)),
        _ => None,
    };
    if seconds.is_some() || matches!(map.get(key), Some(Value::Null)) {
        map.remove(key);
    }
    seconds.unwrap_or(0)
}

impl TrackTags {
    pub fn with_title(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Builds tags from one persisted track object.
    ///
    /// Known keys holding an unexpected type stay in `extra` so that they are
    /// written back exactly as they were read.
    pub fn from_map(mut map: Map<String, Value>) -> Result<Self, TagError> {
        let title = match map.remove(KEY_TITLE) {
            Some(Value::String(title)) => title,
            _ => return Err(TagError::MissingTitle),
        };
        Ok(Self {
            title,
            video_id: take_string(&mut map, KEY_VIDEO_ID),
            duration: take_u64(&mut map, KEY_DURATION),
            channel: take_string(&mut map, KEY_CHANNEL),
            position: take_seconds(&mut map, KEY_POSITION),
            play_time: take_seconds(&mut map, KEY_PLAY_TIME),
            artist: take_string(&mut map, KEY_ARTIST),
            album: take_string(&mut map, KEY_ALBUM),
            track: take_string(&mut map, KEY_TRACK),
            icon_url: take_string(&mut map, KEY_ICON_URL),
            extra: map,
        })
    }

    pub fn from_value(value: Value) -> Result<Self, TagError> {
        match value {
            Value::Object(map) => Self::from_map(map),
            _ => Err(TagError::NotAnObject),
        }
    }

    /// Flattens typed and residual fields into one object.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(KEY_TITLE.to_string(), Value::from(self.title.clone()));
        let optional_strings = [
            (KEY_VIDEO_ID, &self.video_id),
            (KEY_CHANNEL, &self.channel),
            (KEY_ARTIST, &self.artist),
            (KEY_ALBUM, &self.album),
            (KEY_TRACK, &self.track),
            (KEY_ICON_URL, &self.icon_url),
        ];
        for (key, value) in optional_strings {
            if let Some(value) = value {
                map.insert(key.to_string(), Value::from(value.clone()));
            }
        }
        if let Some(duration) = self.duration {
            map.insert(KEY_DURATION.to_string(), Value::from(duration));
        }
        map.insert(KEY_POSITION.to_string(), Value::from(self.position));
        map.insert(KEY_PLAY_TIME.to_string(), Value::from(self.play_time));
        for (key, value) in &self.extra {
            map.entry(key.clone()).or_insert_with(|| value.clone());
        }
        map
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.to_map())
    }

    /// Reads a residual field, treating absence as unset.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

struct TrackState {
    tags: TrackTags,
    playlist: Option<String>,
}

/// A track. Construct through [`Track::new`], which hands out a [`TrackRef`].
pub struct Track {
    id: Uuid,
    state: RwLock<TrackState>,
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read_state();
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("title", &state.tags.title)
            .field("video_id", &state.tags.video_id)
            .field("playlist", &state.playlist)
            .finish()
    }
}

impl Track {
    pub fn new(tags: TrackTags) -> TrackRef {
        Arc::new(Self {
            id: Uuid::new_v4(),
            state: RwLock::new(TrackState {
                tags,
                playlist: None,
            }),
        })
    }

    pub fn with_title(title: impl Into<String>) -> TrackRef {
        Self::new(TrackTags::with_title(title))
    }

    fn read_state(&self) -> RwLockReadGuard<'_, TrackState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, TrackState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process-local id, stable for the lifetime of this handle.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tags(&self) -> TrackTags {
        self.read_state().tags.clone()
    }

    /// Runs `f` against the tags under the read lock.
    pub fn with_tags<R>(&self, f: impl FnOnce(&TrackTags) -> R) -> R {
        f(&self.read_state().tags)
    }

    /// Mutates the tags under the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut TrackTags) -> R) -> R {
        f(&mut self.write_state().tags)
    }

    pub fn title(&self) -> String {
        self.read_state().tags.title.clone()
    }

    pub fn video_id(&self) -> Option<String> {
        self.read_state().tags.video_id.clone()
    }

    pub fn duration(&self) -> Option<u64> {
        self.read_state().tags.duration
    }

    pub fn position(&self) -> u64 {
        self.read_state().tags.position
    }

    pub fn set_position(&self, position: u64) {
        self.write_state().tags.position = position;
    }

    pub fn play_time(&self) -> u64 {
        self.read_state().tags.play_time
    }

    /// Name of the playlist that currently contains this track.
    pub fn playlist(&self) -> Option<String> {
        self.read_state().playlist.clone()
    }

    pub(crate) fn set_playlist(&self, playlist: Option<String>) {
        self.write_state().playlist = playlist;
    }

    pub fn is_orphaned(&self) -> bool {
        self.read_state().playlist.is_none()
    }

    /// Copies every tag into a new, unowned track with position and play
    /// time reset.
    pub fn make_copy(&self) -> TrackRef {
        let mut tags = self.tags();
        tags.position = 0;
        tags.play_time = 0;
        Self::new(tags)
    }

    pub fn same(a: &TrackRef, b: &TrackRef) -> bool {
        Arc::ptr_eq(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_map_splits_known_and_residual_fields() {
        let value = json!({
            "title": "Song",
            "videoId": "abc",
            "duration": 215,
            "position": 12,
            "playTime": 300,
            "artist": "Band",
            "url": "abc",
            "rating": 4
        });
        let tags = TrackTags::from_value(value).expect("valid tags");
        assert_eq!(tags.title, "Song");
        assert_eq!(tags.video_id.as_deref(), Some("abc"));
        assert_eq!(tags.duration, Some(215));
        assert_eq!(tags.position, 12);
        assert_eq!(tags.play_time, 300);
        assert_eq!(tags.artist.as_deref(), Some("Band"));
        assert_eq!(tags.extra_str("url"), Some("abc"));
        assert_eq!(tags.extra.get("rating"), Some(&json!(4)));
    }

    #[test]
    fn test_fractional_seconds_are_rounded() {
        let value = json!({"title": "Song", "position": 41.6, "playTime": 299.4});
        let tags = TrackTags::from_value(value).expect("valid tags");
        assert_eq!(tags.position, 42);
        assert_eq!(tags.play_time, 299);
        let written = tags.to_value();
        assert_eq!(written["position"], json!(42));
        assert_eq!(written["playTime"], json!(299));
    }

    #[test]
    fn test_unexpected_types_for_known_keys_are_kept_verbatim() {
        let value = json!({"title": "Song", "duration": "3:35", "track": 7});
        let tags = TrackTags::from_value(value.clone()).expect("valid tags");
        assert_eq!(tags.duration, None);
        assert_eq!(tags.track, None);
        let written = tags.to_value();
        assert_eq!(written["duration"], json!("3:35"));
        assert_eq!(written["track"], json!(7));
    }

    #[test]
    fn test_missing_title_is_rejected() {
        assert_eq!(
            TrackTags::from_value(json!({"videoId": "x"})),
            Err(TagError::MissingTitle)
        );
        assert_eq!(
            TrackTags::from_value(json!(["title"])),
            Err(TagError::NotAnObject)
        );
    }

    #[test]
    fn test_new_tags_serialize_position_and_play_time() {
        let written = TrackTags::with_title("A").to_value();
        assert_eq!(written, json!({"title": "A", "position": 0, "playTime": 0}));
    }

    #[test]
    fn test_make_copy_resets_progress_and_ownership() {
        let track = Track::with_title("Song");
        track.update(|tags| {
            tags.position = 42;
            tags.play_time = 99;
            tags.video_id = Some("vid".to_string());
        });
        track.set_playlist(Some("Mix".to_string()));

        let copy = track.make_copy();
        assert!(!Track::same(&track, &copy));
        assert_eq!(copy.position(), 0);
        assert_eq!(copy.play_time(), 0);
        assert_eq!(copy.video_id().as_deref(), Some("vid"));
        assert!(copy.is_orphaned());
        assert_eq!(track.position(), 42);
    }
}
