use std::cmp::Ordering;
use std::collections::HashSet;

use log::{debug, error, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::{
    playlist::{Playlist, HISTORY_PLAYLIST},
    playlist_store::{ActiveTrackRecord, PlaylistStore},
    protocol::{self, PlayMode, PlaylistSummary, SortKey},
    track::{Track, TrackRef, TrackTags},
};

// Owns all playlists, the active track and the play mode. Every mutation
// arrives over the bus and is followed by exactly one notification.
pub struct PlaylistManager {
    playlists: Vec<Playlist>,
    active_track: Option<TrackRef>,
    play_mode: PlayMode,
    is_dirty: bool,
    save_failing: bool,
    rng: StdRng,
    store: PlaylistStore,
    bus_consumer: Receiver<protocol::Message>,
    bus_producer: Sender<protocol::Message>,
}

fn lowercase(value: &Option<String>) -> String {
    value.as_deref().unwrap_or_default().to_lowercase()
}

fn compare_tags(a: &TrackTags, b: &TrackTags, key: SortKey) -> Ordering {
    match key {
        SortKey::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
        SortKey::Artist => lowercase(&a.artist).cmp(&lowercase(&b.artist)),
        SortKey::Album => lowercase(&a.album).cmp(&lowercase(&b.album)),
        SortKey::Channel => lowercase(&a.channel).cmp(&lowercase(&b.channel)),
        SortKey::Duration => a.duration.cmp(&b.duration),
        SortKey::PlayTime => a.play_time.cmp(&b.play_time),
    }
}

/// Tracks among `tracks` that repeat an earlier one. Tracks without an id
/// are keyed by title, tracks with an id by id; the two key spaces never
/// meet.
pub fn find_duplicates(tracks: &[TrackRef]) -> Vec<TrackRef> {
    let mut seen_titles = HashSet::new();
    let mut seen_ids = HashSet::new();
    let mut duplicates = Vec::new();
    for track in tracks {
        let (title, video_id) = track.with_tags(|tags| (tags.title.clone(), tags.video_id.clone()));
        let first_occurrence = match video_id {
            Some(video_id) => seen_ids.insert(video_id),
            None => seen_titles.insert(title),
        };
        if !first_occurrence {
            duplicates.push(track.clone());
        }
    }
    duplicates
}

impl PlaylistManager {
    pub fn new(
        playlists: Vec<Playlist>,
        store: PlaylistStore,
        bus_consumer: Receiver<protocol::Message>,
        bus_producer: Sender<protocol::Message>,
    ) -> Self {
        Self {
            playlists,
            active_track: None,
            play_mode: PlayMode::Normal,
            is_dirty: false,
            save_failing: false,
            rng: StdRng::from_os_rng(),
            store,
            bus_consumer,
            bus_producer,
        }
    }

    /// Replaces the shuffle generator with a deterministic one.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn notify(&self, message: protocol::PlaylistMessage) {
        let _ = self
            .bus_producer
            .send(protocol::Message::Playlist(message));
    }

    fn notice_error(&self, text: String) {
        let _ = self.bus_producer.send(protocol::Message::Notice(
            protocol::NoticeMessage::Error(text),
        ));
    }

    pub fn playlists(&self) -> &[Playlist] {
        &self.playlists
    }

    pub fn playlist(&self, name: &str) -> Option<&Playlist> {
        self.playlists.iter().find(|playlist| playlist.name() == name)
    }

    fn playlist_mut(&mut self, name: &str) -> Option<&mut Playlist> {
        self.playlists
            .iter_mut()
            .find(|playlist| playlist.name() == name)
    }

    pub fn active_track(&self) -> Option<&TrackRef> {
        self.active_track.as_ref()
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn summaries(&self) -> Vec<PlaylistSummary> {
        self.playlists
            .iter()
            .map(|playlist| PlaylistSummary {
                name: playlist.name().to_string(),
                track_count: playlist.len(),
            })
            .collect()
    }

    fn active_in(&self, name: &str) -> bool {
        self.active_track
            .as_ref()
            .and_then(|track| track.playlist())
            .is_some_and(|owner| owner == name)
    }

    /// Returns `false` without notifying when the name is taken.
    pub fn create_playlist(&mut self, name: &str) -> bool {
        if self.playlist(name).is_some() {
            return false;
        }
        self.playlists.push(Playlist::new(name));
        self.is_dirty = true;
        self.notify(protocol::PlaylistMessage::PlaylistCreated {
            name: name.to_string(),
        });
        true
    }

    /// Orphans the playlist's tracks. The active track stays active.
    pub fn remove_playlist(&mut self, name: &str) {
        let Some(index) = self
            .playlists
            .iter()
            .position(|playlist| playlist.name() == name)
        else {
            return;
        };
        let mut removed = self.playlists.remove(index);
        for track in removed.clear() {
            track.set_playlist(None);
        }
        self.is_dirty = true;
        self.notify(protocol::PlaylistMessage::PlaylistRemoved {
            name: name.to_string(),
        });
        if self.active_track.as_ref().is_some_and(|t| t.is_orphaned()) {
            self.save_active_track();
        }
    }

    pub fn clear_playlist(&mut self, name: &str) {
        let had_active = self.active_in(name);
        let Some(playlist) = self.playlist_mut(name) else {
            return;
        };
        for track in playlist.clear() {
            track.set_playlist(None);
        }
        self.is_dirty = true;
        self.notify(protocol::PlaylistMessage::PlaylistCleared {
            name: name.to_string(),
        });
        if had_active {
            self.save_active_track();
        }
    }

    /// Appends `tracks`, creating the playlist on first use. A track owned by
    /// another playlist is moved out of it first; one already in this
    /// playlist is skipped.
    pub fn add_tracks(&mut self, name: &str, tracks: Vec<TrackRef>) {
        self.create_playlist(name);

        let mut added = Vec::with_capacity(tracks.len());
        for track in tracks {
            match track.playlist() {
                Some(owner) if owner == name => continue,
                Some(owner) => self.remove_tracks(&owner, std::slice::from_ref(&track)),
                None => {}
            }
            added.push(track);
        }

        let Some(playlist) = self.playlist_mut(name) else {
            return;
        };
        added.retain(|track| playlist.push(track.clone()));
        for track in &added {
            track.set_playlist(Some(name.to_string()));
        }
        debug!(
            "PlaylistManager: added {} tracks to {:?}",
            added.len(),
            name
        );
        self.is_dirty = true;
        self.notify(protocol::PlaylistMessage::TracksAdded {
            name: name.to_string(),
            tracks: added,
        });
        self.save_active_track();
    }

    /// Orphans and removes `tracks`. Removing the active track leaves it
    /// active; playback is not interrupted.
    pub fn remove_tracks(&mut self, name: &str, tracks: &[TrackRef]) {
        let had_active = self.active_in(name);
        let Some(playlist) = self.playlist_mut(name) else {
            return;
        };
        let mut removed = Vec::with_capacity(tracks.len());
        for track in tracks {
            if playlist.remove(track) {
                track.set_playlist(None);
                removed.push(track.clone());
            }
        }
        self.is_dirty = true;
        self.notify(protocol::PlaylistMessage::TracksRemoved {
            name: name.to_string(),
            tracks: removed,
        });
        if had_active {
            self.save_active_track();
        }
    }

    /// The single entry point for "now playing" changes.
    pub fn activate_track(&mut self, track: TrackRef) {
        info!("PlaylistManager: activating {:?}", track.title());
        self.active_track = Some(track.clone());
        self.notify(protocol::PlaylistMessage::TrackActivated(track.clone()));
        self.add_tracks(HISTORY_PLAYLIST, vec![track.make_copy()]);
    }

    pub fn activate_track_at(&mut self, name: &str, index: isize) {
        let track = self
            .playlist(name)
            .and_then(|playlist| playlist.get(index))
            .cloned();
        match track {
            Some(track) => self.activate_track(track),
            None => self.notice_error(format!("No track {index} in playlist {name:?}")),
        }
    }

    pub fn activate_next_track(&mut self, loop_other: bool) {
        self.jump_playlist_by(1, loop_other);
    }

    pub fn activate_previous_track(&mut self, loop_other: bool) {
        self.jump_playlist_by(-1, loop_other);
    }

    /// Moves the active track by `direction` within its playlist according
    /// to the play mode. No-op when nothing is active or it is orphaned.
    pub fn jump_playlist_by(&mut self, direction: isize, loop_other: bool) {
        let Some(active) = self.active_track.clone() else {
            return;
        };
        let Some(owner) = active.playlist() else {
            debug!("PlaylistManager: active track is orphaned, not advancing");
            return;
        };
        let Some(playlist) = self.playlists.iter().find(|p| p.name() == owner) else {
            return;
        };
        let Some(current) = playlist.index_of(&active) else {
            return;
        };

        let next = match self.play_mode {
            PlayMode::Shuffle if playlist.len() < 2 => active.clone(),
            PlayMode::Shuffle => {
                let mut index = self.rng.random_range(0..playlist.len() - 1);
                if index >= current {
                    index += 1;
                }
                playlist.tracks()[index].clone()
            }
            PlayMode::Loop if !loop_other => {
                active.set_position(0);
                active.clone()
            }
            PlayMode::Normal | PlayMode::Loop => playlist
                .get(current as isize + direction)
                .cloned()
                .unwrap_or_else(|| active.clone()),
        };
        self.activate_track(next);
    }

    pub fn remove_duplicates(&mut self, name: &str, tracks: &[TrackRef]) {
        let duplicates = find_duplicates(tracks);
        info!(
            "PlaylistManager: removing {} duplicates from {:?}",
            duplicates.len(),
            name
        );
        self.remove_tracks(name, &duplicates);
    }

    /// Replaces the playlist's contents wholesale.
    pub fn arrange_tracks(&mut self, name: &str, tracks: Vec<TrackRef>) {
        let Some(playlist) = self.playlist_mut(name) else {
            return;
        };
        let previous = playlist.clear();
        playlist.replace(tracks);
        let current: Vec<TrackRef> = playlist.tracks().to_vec();
        for track in previous {
            if !current.iter().any(|kept| Track::same(kept, &track)) {
                track.set_playlist(None);
            }
        }
        for track in &current {
            track.set_playlist(Some(name.to_string()));
        }
        self.is_dirty = true;
        self.notify(protocol::PlaylistMessage::PlaylistArranged {
            name: name.to_string(),
        });
        self.save_active_track();
    }

    pub fn sort_playlist(&mut self, name: &str, key: SortKey, descending: bool) {
        let Some(playlist) = self.playlist(name) else {
            return;
        };
        let mut keyed: Vec<(TrackTags, TrackRef)> = playlist
            .iter()
            .map(|track| (track.tags(), track.clone()))
            .collect();
        keyed.sort_by(|(a, _), (b, _)| {
            let ordering = compare_tags(a, b, key);
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
        self.arrange_tracks(name, keyed.into_iter().map(|(_, track)| track).collect());
    }

    /// Re-broadcasts an in-place change to `track`.
    pub fn update_track(&mut self, track: TrackRef) {
        self.is_dirty = true;
        self.notify(protocol::PlaylistMessage::TrackUpdated(track));
    }

    pub fn set_play_mode(&mut self, mode: PlayMode) {
        self.play_mode = mode;
        self.notify(protocol::PlaylistMessage::PlayModeChanged(mode));
    }

    /// Writes all playlists. A failure keeps the dirty flag so the next tick
    /// retries, and is reported once per streak of failures.
    pub fn save_playlists(&mut self) {
        match self.store.save_playlists(&self.playlists) {
            Ok(()) => {
                trace!("PlaylistManager: playlists saved");
                self.is_dirty = false;
                self.save_failing = false;
            }
            Err(err) => {
                error!("PlaylistManager: failed to save playlists: {}", err);
                if !self.save_failing {
                    self.save_failing = true;
                    self.notice_error(format!("Could not save playlists: {err}"));
                }
            }
        }
    }

    pub fn save_if_dirty(&mut self) {
        if self.is_dirty {
            self.save_playlists();
        }
    }

    fn active_track_record(&self) -> Option<ActiveTrackRecord> {
        let track = self.active_track.as_ref()?;
        let location = track.playlist().and_then(|owner| {
            let index = self.playlist(&owner)?.index_of(track)?;
            Some((owner, index))
        });
        Some(ActiveTrackRecord::for_track(
            track,
            location.as_ref().map(|(owner, index)| (owner.as_str(), *index)),
        ))
    }

    pub fn save_active_track(&self) {
        let record = self.active_track_record();
        if let Err(err) = self.store.save_active_track(record.as_ref()) {
            warn!("PlaylistManager: failed to save active track: {}", err);
        }
    }

    /// Resolves the persisted pointer against the loaded playlists. Dangling
    /// references resolve to `None`.
    pub fn load_active_track(&self) -> Option<TrackRef> {
        let record = match self.store.load_active_track() {
            Ok(record) => record?,
            Err(err) => {
                warn!("PlaylistManager: failed to load active track: {}", err);
                return None;
            }
        };
        match record.playlist {
            Some(name) => {
                let track = record
                    .track_index
                    .and_then(|index| usize::try_from(index).ok())
                    .and_then(|index| self.playlist(&name)?.tracks().get(index).cloned());
                if track.is_none() {
                    warn!(
                        "PlaylistManager: saved track {:?}[{:?}] no longer exists",
                        name, record.track_index
                    );
                }
                track
            }
            None => match TrackTags::from_map(record.tags) {
                Ok(tags) => Some(Track::new(tags)),
                Err(err) => {
                    warn!("PlaylistManager: saved orphaned track is invalid: {}", err);
                    None
                }
            },
        }
    }

    fn restore(&mut self) {
        info!(
            "PlaylistManager: restoring {} playlists",
            self.playlists.len()
        );
        self.notify(protocol::PlaylistMessage::PlaylistsRestored(
            self.summaries(),
        ));
        if let Some(track) = self.load_active_track() {
            self.activate_track(track);
        }
    }

    fn handle_playlist_message(&mut self, message: protocol::PlaylistMessage) {
        match message {
            protocol::PlaylistMessage::CreatePlaylist { name } => {
                self.create_playlist(&name);
            }
            protocol::PlaylistMessage::RemovePlaylist { name } => self.remove_playlist(&name),
            protocol::PlaylistMessage::ClearPlaylist { name } => self.clear_playlist(&name),
            protocol::PlaylistMessage::AddTracks { name, tracks } => self.add_tracks(&name, tracks),
            protocol::PlaylistMessage::RemoveTracks { name, tracks } => {
                self.remove_tracks(&name, &tracks)
            }
            protocol::PlaylistMessage::RemoveDuplicates { name, tracks } => {
                self.remove_duplicates(&name, &tracks)
            }
            protocol::PlaylistMessage::SortPlaylist {
                name,
                key,
                descending,
            } => self.sort_playlist(&name, key, descending),
            protocol::PlaylistMessage::ActivateTrack(track) => self.activate_track(track),
            protocol::PlaylistMessage::ActivateTrackAt { name, index } => {
                self.activate_track_at(&name, index)
            }
            protocol::PlaylistMessage::ActivateNext { loop_other } => {
                self.activate_next_track(loop_other)
            }
            protocol::PlaylistMessage::ActivatePrevious { loop_other } => {
                self.activate_previous_track(loop_other)
            }
            protocol::PlaylistMessage::SetPlayMode(mode) => self.set_play_mode(mode),
            protocol::PlaylistMessage::CyclePlayMode => self.set_play_mode(self.play_mode.cycled()),
            protocol::PlaylistMessage::UpdateTrack(track) => self.update_track(track),
            protocol::PlaylistMessage::SaveIfDirty => self.save_if_dirty(),
            protocol::PlaylistMessage::RequestOverview => {
                self.notify(protocol::PlaylistMessage::Overview {
                    playlists: self.summaries(),
                    active_track: self.active_track.clone(),
                    play_mode: self.play_mode,
                });
            }
            protocol::PlaylistMessage::RequestTracks { name } => match self.playlist(&name) {
                Some(playlist) => self.notify(protocol::PlaylistMessage::Tracks {
                    name,
                    tracks: playlist.tracks().to_vec(),
                }),
                None => self.notice_error(format!("No playlist named {name:?}")),
            },
            _ => trace!("PlaylistManager: ignoring notification"),
        }
    }

    pub fn run(&mut self) {
        self.restore();

        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(protocol::Message::Playlist(message)) => self.handle_playlist_message(message),
                Ok(protocol::Message::Lifecycle(protocol::LifecycleMessage::SessionFlushed)) => {
                    info!("PlaylistManager: final save before shutdown");
                    self.save_playlists();
                    self.save_active_track();
                    let _ = self.bus_producer.send(protocol::Message::Lifecycle(
                        protocol::LifecycleMessage::StateSaved,
                    ));
                    break;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("PlaylistManager: bus lagged, skipped {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    error!("PlaylistManager: bus closed");
                    break;
                }
            }
        }
    }
}
