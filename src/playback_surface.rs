//! Boundary to the video player that actually renders playback.
//!
//! The session drives a surface with [`SurfaceCommand`]s. A surface reports
//! back asynchronously by publishing `PlaybackMessage` callbacks
//! (`SurfaceReady`, `StateChanged`, `PositionChanged`, `VolumeChanged`) on
//! the bus.

use log::{debug, info};
use tokio::sync::broadcast::Sender;

use crate::protocol::{self, PlayerState};

/// Commands accepted by a playback surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceCommand {
    /// Load and start a video from its beginning.
    Load { video_id: String },
    /// Prepare a video at an offset without starting it.
    Cue { video_id: String, start_secs: u64 },
    Play,
    Pause,
    SetVolume(u8),
    Seek(u64),
}

pub trait PlaybackSurface: Send {
    fn execute(&mut self, command: SurfaceCommand) -> Result<(), String>;
}

/// Surface for headless runs: logs each command and answers with the
/// callbacks an embedded player would send, without a playback clock.
pub struct HeadlessSurface {
    bus_producer: Sender<protocol::Message>,
    loaded: Option<String>,
}

impl HeadlessSurface {
    pub fn new(bus_producer: Sender<protocol::Message>) -> Self {
        Self {
            bus_producer,
            loaded: None,
        }
    }

    /// Publishes the readiness callback; call once the session is listening.
    pub fn announce_ready(&self) {
        self.emit(protocol::PlaybackMessage::SurfaceReady);
    }

    fn emit(&self, message: protocol::PlaybackMessage) {
        let _ = self.bus_producer.send(protocol::Message::Playback(message));
    }

    fn emit_state(&self, state: PlayerState) {
        self.emit(protocol::PlaybackMessage::StateChanged(state));
    }
}

impl PlaybackSurface for HeadlessSurface {
    fn execute(&mut self, command: SurfaceCommand) -> Result<(), String> {
        debug!("HeadlessSurface: {:?}", command);
        match command {
            SurfaceCommand::Load { video_id } => {
                info!("HeadlessSurface: playing {}", video_id);
                self.loaded = Some(video_id);
                self.emit_state(PlayerState::Unstarted);
                self.emit(protocol::PlaybackMessage::PositionChanged(0));
                self.emit_state(PlayerState::Playing);
            }
            SurfaceCommand::Cue {
                video_id,
                start_secs,
            } => {
                info!("HeadlessSurface: cueing {} at {}s", video_id, start_secs);
                self.loaded = Some(video_id);
                self.emit_state(PlayerState::Unstarted);
                self.emit(protocol::PlaybackMessage::PositionChanged(start_secs));
                self.emit_state(PlayerState::Cued);
            }
            SurfaceCommand::Play | SurfaceCommand::Pause if self.loaded.is_none() => {
                return Err("no video loaded".to_string());
            }
            SurfaceCommand::Play => self.emit_state(PlayerState::Playing),
            SurfaceCommand::Pause => self.emit_state(PlayerState::Paused),
            SurfaceCommand::SetVolume(volume) => {
                self.emit(protocol::PlaybackMessage::VolumeChanged(volume.min(100)));
            }
            SurfaceCommand::Seek(position) => {
                if self.loaded.is_none() {
                    return Err("no video loaded".to_string());
                }
                self.emit(protocol::PlaybackMessage::PositionChanged(position));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::{self, error::TryRecvError};

    fn drain(receiver: &mut broadcast::Receiver<protocol::Message>) -> Vec<protocol::PlaybackMessage> {
        let mut messages = Vec::new();
        loop {
            match receiver.try_recv() {
                Ok(protocol::Message::Playback(message)) => messages.push(message),
                Ok(_) => {}
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return messages,
            }
        }
    }

    #[test]
    fn test_cue_reports_offset_then_cued_state() {
        let (bus_sender, mut receiver) = broadcast::channel(16);
        let mut surface = HeadlessSurface::new(bus_sender);
        surface
            .execute(SurfaceCommand::Cue {
                video_id: "abc".to_string(),
                start_secs: 42,
            })
            .expect("cue");
        let messages = drain(&mut receiver);
        assert!(matches!(
            messages.as_slice(),
            [
                protocol::PlaybackMessage::StateChanged(PlayerState::Unstarted),
                protocol::PlaybackMessage::PositionChanged(42),
                protocol::PlaybackMessage::StateChanged(PlayerState::Cued),
            ]
        ));
    }

    #[test]
    fn test_transport_without_video_is_an_error() {
        let (bus_sender, mut receiver) = broadcast::channel(16);
        let mut surface = HeadlessSurface::new(bus_sender);
        assert!(surface.execute(SurfaceCommand::Play).is_err());
        assert!(surface.execute(SurfaceCommand::Seek(5)).is_err());
        surface.execute(SurfaceCommand::SetVolume(150)).expect("volume");
        let messages = drain(&mut receiver);
        assert!(matches!(
            messages.as_slice(),
            [protocol::PlaybackMessage::VolumeChanged(100)]
        ));
    }
}
