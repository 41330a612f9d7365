use crate::track::{Track, TrackRef};

/// Reserved playlist receiving a copy of every activated track.
pub const HISTORY_PLAYLIST: &str = "# History";
/// Reserved playlist receiving the results of the most recent search.
pub const SEARCH_RESULTS_PLAYLIST: &str = "# Search Results";

/// Ordered, named collection of tracks. Two playlists are equal iff their
/// names are equal.
#[derive(Debug, Clone)]
pub struct Playlist {
    name: String,
    tracks: Vec<TrackRef>,
}

impl PartialEq for Playlist {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Playlist {}

impl Playlist {
    pub fn new(name: impl Into<String>) -> Playlist {
        Playlist {
            name: name.into(),
            tracks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracks(&self) -> &[TrackRef] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Indexes modulo the playlist length, so `-1` is the last track.
    /// Returns `None` only for an empty playlist.
    pub fn get(&self, index: isize) -> Option<&TrackRef> {
        if self.tracks.is_empty() {
            return None;
        }
        let len = self.tracks.len() as isize;
        self.tracks.get(index.rem_euclid(len) as usize)
    }

    pub fn index_of(&self, track: &TrackRef) -> Option<usize> {
        self.tracks
            .iter()
            .position(|candidate| Track::same(candidate, track))
    }

    pub fn contains(&self, track: &TrackRef) -> bool {
        self.index_of(track).is_some()
    }

    /// Appends `track` unless this exact handle is already present.
    pub fn push(&mut self, track: TrackRef) -> bool {
        if self.contains(&track) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn remove(&mut self, track: &TrackRef) -> bool {
        match self.index_of(track) {
            Some(index) => {
                self.tracks.remove(index);
                true
            }
            None => false,
        }
    }

    /// Empties the playlist in place and returns the tracks it held.
    pub fn clear(&mut self) -> Vec<TrackRef> {
        std::mem::take(&mut self.tracks)
    }

    /// Replaces the contents wholesale, dropping repeated handles.
    pub fn replace(&mut self, tracks: Vec<TrackRef>) {
        self.tracks.clear();
        for track in tracks {
            self.push(track);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackRef> {
        self.tracks.iter()
    }
}
