//! Playback session coordinator.
//!
//! Mirrors the playlist owner's active track onto the playback surface and
//! reacts to the surface's state callbacks: play-time accounting, auto-play
//! of cued videos and advancing when a video ends. Commands are only sent
//! after the surface has reported ready; earlier ones are dropped.

use std::time::Instant;

use log::{debug, error, info, trace, warn};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::{
    playback_surface::{PlaybackSurface, SurfaceCommand},
    protocol::{self, PlayerState},
    track::{Track, TrackRef},
};

pub struct PlaybackSession {
    surface: Box<dyn PlaybackSurface>,
    surface_ready: bool,
    player_state: Option<PlayerState>,
    // Last track the owner activated. Lags the owner's pointer.
    requested_track: Option<TrackRef>,
    // Track the surface is actually playing; switched only on `Unstarted`.
    playing_track: Option<TrackRef>,
    waiting_for_id: bool,
    playing_since: Option<Instant>,
    volume: Option<u8>,
    resume_threshold_secs: u64,
    bus_consumer: Receiver<protocol::Message>,
    bus_producer: Sender<protocol::Message>,
}

impl PlaybackSession {
    pub fn new(
        surface: Box<dyn PlaybackSurface>,
        resume_threshold_secs: u64,
        bus_consumer: Receiver<protocol::Message>,
        bus_producer: Sender<protocol::Message>,
    ) -> Self {
        Self {
            surface,
            surface_ready: false,
            player_state: None,
            requested_track: None,
            playing_track: None,
            waiting_for_id: false,
            playing_since: None,
            volume: None,
            resume_threshold_secs,
            bus_consumer,
            bus_producer,
        }
    }

    pub fn player_state(&self) -> Option<PlayerState> {
        self.player_state
    }

    pub fn playing_track(&self) -> Option<&TrackRef> {
        self.playing_track.as_ref()
    }

    pub fn is_waiting_for_id(&self) -> bool {
        self.waiting_for_id
    }

    pub fn volume(&self) -> Option<u8> {
        self.volume
    }

    fn command(&mut self, command: SurfaceCommand) {
        if !self.surface_ready {
            debug!("PlaybackSession: surface not ready, dropping {:?}", command);
            return;
        }
        if let Err(err) = self.surface.execute(command) {
            info!("PlaybackSession: surface command failed: {}", err);
        }
    }

    /// Starts `track` on the surface, or waits for its video id first.
    pub fn play_track(&mut self, track: TrackRef) {
        self.requested_track = Some(track.clone());
        let Some(video_id) = track.video_id() else {
            debug!("PlaybackSession: waiting for video id of {:?}", track.title());
            self.waiting_for_id = true;
            return;
        };
        self.waiting_for_id = false;
        let position = track.position();
        if position < self.resume_threshold_secs {
            self.command(SurfaceCommand::Load { video_id });
        } else {
            self.command(SurfaceCommand::Cue {
                video_id,
                start_secs: position,
            });
        }
    }

    fn on_track_updated(&mut self, track: TrackRef) {
        let is_requested = self
            .requested_track
            .as_ref()
            .is_some_and(|requested| Track::same(requested, &track));
        if is_requested && self.waiting_for_id {
            self.play_track(track);
        } else {
            trace!("PlaybackSession: update for {:?} needs no action", track.title());
        }
    }

    fn flush_play_time(&mut self) {
        let (Some(track), Some(since)) = (self.playing_track.clone(), self.playing_since.take())
        else {
            return;
        };
        let played = since.elapsed().as_secs();
        track.update(|tags| tags.play_time += played);
        trace!("PlaybackSession: +{}s play time for {:?}", played, track.title());
        let _ = self.bus_producer.send(protocol::Message::Playlist(
            protocol::PlaylistMessage::UpdateTrack(track),
        ));
    }

    fn on_state_changed(&mut self, state: PlayerState) {
        debug!("PlaybackSession: player state {:?}", state);
        self.player_state = Some(state);

        if state == PlayerState::Unstarted {
            self.flush_play_time();
            self.playing_track = self.requested_track.clone();
        }
        if state == PlayerState::Playing {
            self.playing_since = Some(Instant::now());
        } else {
            self.flush_play_time();
        }

        match state {
            PlayerState::Cued => self.command(SurfaceCommand::Play),
            PlayerState::Ended => {
                if let Some(track) = &self.playing_track {
                    track.set_position(0);
                }
                // The surface may restart an ended video on its own.
                self.command(SurfaceCommand::Pause);
                let _ = self.bus_producer.send(protocol::Message::Playlist(
                    protocol::PlaylistMessage::ActivateNext { loop_other: false },
                ));
            }
            _ => {}
        }
    }

    fn on_position_changed(&mut self, position: u64) {
        if let Some(track) = &self.playing_track {
            track.set_position(position);
        }
    }

    fn play_pause(&mut self) {
        if self.player_state == Some(PlayerState::Playing) {
            self.command(SurfaceCommand::Pause);
        } else {
            self.command(SurfaceCommand::Play);
        }
    }

    fn seek_by(&mut self, offset: i64) {
        let Some(track) = self.playing_track.clone() else {
            return;
        };
        let position = track.position().saturating_add_signed(offset);
        track.set_position(position);
        self.command(SurfaceCommand::Seek(position));
    }

    fn seek_percent(&mut self, percent: u8) {
        let duration = self.playing_track.as_ref().and_then(|track| track.duration());
        if let Some(duration) = duration {
            let percent = u64::from(percent.min(100));
            self.command(SurfaceCommand::Seek(duration * percent / 100));
        }
    }

    /// Handles one bus message. Returns `false` once the session is done.
    pub fn handle_message(&mut self, message: protocol::Message) -> bool {
        match message {
            protocol::Message::Playlist(protocol::PlaylistMessage::TrackActivated(track)) => {
                self.play_track(track)
            }
            protocol::Message::Playlist(protocol::PlaylistMessage::TrackUpdated(track)) => {
                self.on_track_updated(track)
            }
            protocol::Message::Playback(playback) => match playback {
                protocol::PlaybackMessage::SurfaceReady => {
                    info!("PlaybackSession: surface ready");
                    self.surface_ready = true;
                }
                protocol::PlaybackMessage::StateChanged(state) => self.on_state_changed(state),
                protocol::PlaybackMessage::PositionChanged(position) => {
                    self.on_position_changed(position)
                }
                protocol::PlaybackMessage::VolumeChanged(volume) => self.volume = Some(volume),
                protocol::PlaybackMessage::PlayPause => self.play_pause(),
                protocol::PlaybackMessage::Seek(position) => {
                    self.command(SurfaceCommand::Seek(position))
                }
                protocol::PlaybackMessage::SeekBy(offset) => self.seek_by(offset),
                protocol::PlaybackMessage::SeekPercent(percent) => self.seek_percent(percent),
                protocol::PlaybackMessage::SetVolume(volume) => {
                    self.command(SurfaceCommand::SetVolume(volume.min(100)))
                }
            },
            protocol::Message::Lifecycle(protocol::LifecycleMessage::ShutdownRequested) => {
                self.flush_play_time();
                let _ = self.bus_producer.send(protocol::Message::Lifecycle(
                    protocol::LifecycleMessage::SessionFlushed,
                ));
                return false;
            }
            _ => {}
        }
        true
    }

    pub fn run(&mut self) {
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(message) => {
                    if !self.handle_message(message) {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("PlaybackSession: bus lagged, skipped {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    error!("PlaybackSession: bus closed");
                    break;
                }
            }
        }
    }

    #[cfg(test)]
    fn backdate_playing_since(&mut self, by: std::time::Duration) {
        self.playing_since = self.playing_since.and_then(|since| since.checked_sub(by));
    }
}
