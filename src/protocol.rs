//! Event-bus protocol shared by all runtime components.
//!
//! This module defines all message payloads exchanged between the playlist
//! owner, the playback session, background job managers and the console.
//! Subscribing to the bus is how a component registers as an observer;
//! dropping its receiver unregisters it.

use uuid::Uuid;

use crate::track::TrackRef;

/// Track advancement policy applied by next/previous operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayMode {
    #[default]
    Normal, // Sequential, wraps at both ends
    Shuffle, // Random track other than the current one
    Loop,    // Repeat the current track
}

impl PlayMode {
    /// Mode selected by the play-mode toggle after `self`.
    pub fn cycled(self) -> PlayMode {
        match self {
            PlayMode::Normal => PlayMode::Shuffle,
            PlayMode::Shuffle => PlayMode::Loop,
            PlayMode::Loop => PlayMode::Normal,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PlayMode::Normal => "normal",
            PlayMode::Shuffle => "shuffle",
            PlayMode::Loop => "loop",
        }
    }
}

/// Lifecycle state reported by the playback surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Unstarted,
    Ended,
    Playing,
    Paused,
    Buffering,
    Cued,
}

/// Column used when re-sorting a playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Title,
    Artist,
    Album,
    Channel,
    Duration,
    PlayTime,
}

/// Name and size of one playlist, for overviews.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistSummary {
    pub name: String,
    pub track_count: usize,
}

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Playlist(PlaylistMessage),
    Playback(PlaybackMessage),
    Enrichment(EnrichmentMessage),
    Search(SearchMessage),
    Notice(NoticeMessage),
    Lifecycle(LifecycleMessage),
}

/// Playlist-domain commands (handled by the playlist owner) and the
/// notifications it broadcasts after each mutation.
#[derive(Debug, Clone)]
pub enum PlaylistMessage {
    CreatePlaylist {
        name: String,
    },
    RemovePlaylist {
        name: String,
    },
    ClearPlaylist {
        name: String,
    },
    AddTracks {
        name: String,
        tracks: Vec<TrackRef>,
    },
    RemoveTracks {
        name: String,
        tracks: Vec<TrackRef>,
    },
    /// Removes repeated tracks among `tracks`, keeping first occurrences.
    RemoveDuplicates {
        name: String,
        tracks: Vec<TrackRef>,
    },
    SortPlaylist {
        name: String,
        key: SortKey,
        descending: bool,
    },
    ActivateTrack(TrackRef),
    ActivateTrackAt {
        name: String,
        index: isize,
    },
    /// `loop_other` forces a track change even in loop mode.
    ActivateNext {
        loop_other: bool,
    },
    ActivatePrevious {
        loop_other: bool,
    },
    SetPlayMode(PlayMode),
    CyclePlayMode,
    /// A track's fields were changed in place; re-broadcast and persist.
    UpdateTrack(TrackRef),
    /// Periodic autosave tick.
    SaveIfDirty,
    RequestOverview,
    RequestTracks {
        name: String,
    },

    PlaylistCreated {
        name: String,
    },
    PlaylistRemoved {
        name: String,
    },
    PlaylistCleared {
        name: String,
    },
    TracksAdded {
        name: String,
        tracks: Vec<TrackRef>,
    },
    TracksRemoved {
        name: String,
        tracks: Vec<TrackRef>,
    },
    PlaylistArranged {
        name: String,
    },
    TrackActivated(TrackRef),
    TrackUpdated(TrackRef),
    PlayModeChanged(PlayMode),
    PlaylistsRestored(Vec<PlaylistSummary>),
    Overview {
        playlists: Vec<PlaylistSummary>,
        active_track: Option<TrackRef>,
        play_mode: PlayMode,
    },
    Tracks {
        name: String,
        tracks: Vec<TrackRef>,
    },
}

/// Transport commands from the user and asynchronous callbacks from the
/// playback surface.
#[derive(Debug, Clone)]
pub enum PlaybackMessage {
    PlayPause,
    /// Absolute seek in seconds.
    Seek(u64),
    /// Relative seek in seconds.
    SeekBy(i64),
    SeekPercent(u8),
    SetVolume(u8),

    SurfaceReady,
    StateChanged(PlayerState),
    PositionChanged(u64),
    VolumeChanged(u8),
}

/// Metadata enrichment requests and job completion reports.
#[derive(Debug, Clone)]
pub enum EnrichmentMessage {
    Refresh {
        tracks: Vec<TrackRef>,
        refresh_title: bool,
        refresh_thumbnail: bool,
    },
    JobFinished {
        job_id: Uuid,
        track: TrackRef,
        outcome: JobOutcome,
    },
}

/// Terminal result of one enrichment job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Updated,
    Failed(String),
    Aborted,
}

/// What a search should look for.
#[derive(Debug, Clone)]
pub enum SearchRequest {
    Term(String),
    RelatedTo(TrackRef),
}

/// Search requests and the batches, errors and completion of search jobs.
#[derive(Debug, Clone)]
pub enum SearchMessage {
    Request(SearchRequest),
    Started {
        search_id: Uuid,
    },
    TracksFound {
        search_id: Uuid,
        tracks: Vec<TrackRef>,
    },
    Error {
        search_id: Uuid,
        message: String,
    },
    Finished {
        search_id: Uuid,
    },
}

/// Short human-readable messages for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeMessage {
    Info(String),
    Error(String),
}

/// Ordered shutdown handshake: the session flushes play time, then the
/// playlist owner performs its final save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleMessage {
    ShutdownRequested,
    SessionFlushed,
    StateSaved,
}
