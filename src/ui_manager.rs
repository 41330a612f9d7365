//! Headless console front end.
//!
//! `UiManager` renders bus notifications as text and keeps the console's
//! view of the listed playlist current. [`read_commands`] turns typed lines
//! into bus messages against that view.

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, warn};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::{
    console_command::{self, ConsoleCommand, ConsoleState},
    playlist::SEARCH_RESULTS_PLAYLIST,
    protocol::{self, PlaylistSummary},
    track::{Track, TrackRef},
};

pub type SharedConsoleState = Arc<Mutex<ConsoleState>>;

/// `m:ss`, or `h:mm:ss` from one hour on.
pub fn format_seconds(seconds: u64) -> String {
    let (hours, minutes, seconds) = (seconds / 3600, (seconds / 60) % 60, seconds % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

fn track_line(number: usize, track: &TrackRef) -> String {
    track.with_tags(|tags| {
        let mut line = format!("{number:>4}. {}", tags.title);
        if let Some(duration) = tags.duration {
            line.push_str(&format!(" [{}]", format_seconds(duration)));
        }
        if let Some(channel) = &tags.channel {
            line.push_str(&format!(" ({channel})"));
        }
        line
    })
}

pub struct UiManager {
    bus_consumer: Receiver<protocol::Message>,
    bus_producer: Sender<protocol::Message>,
    state: SharedConsoleState,
    output: Box<dyn Write + Send>,
}

impl UiManager {
    pub fn new(
        bus_consumer: Receiver<protocol::Message>,
        bus_producer: Sender<protocol::Message>,
        state: SharedConsoleState,
        output: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            bus_consumer,
            bus_producer,
            state,
            output,
        }
    }

    fn print(&mut self, line: &str) {
        if let Err(err) = writeln!(self.output, "{line}") {
            warn!("UiManager: console write failed: {}", err);
        }
        let _ = self.output.flush();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConsoleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_listed(&self, name: &str) -> bool {
        self.lock_state()
            .listed
            .as_ref()
            .is_some_and(|(listed, _)| listed == name)
    }

    fn print_overview(
        &mut self,
        playlists: &[PlaylistSummary],
        active_track: Option<&TrackRef>,
        play_mode: protocol::PlayMode,
    ) {
        for summary in playlists {
            let line = format!("  {} ({} tracks)", summary.name, summary.track_count);
            self.print(&line);
        }
        let now_playing = active_track
            .map(|track| track.title())
            .unwrap_or_else(|| "nothing".to_string());
        self.print(&format!("Now playing: {now_playing}"));
        self.print(&format!("Play mode: {}", play_mode.label()));
    }

    fn show_tracks(&mut self, name: String, tracks: Vec<TrackRef>) {
        self.print(&format!("{name}:"));
        if tracks.is_empty() {
            self.print("  (empty)");
        }
        for (index, track) in tracks.iter().enumerate() {
            self.print(&track_line(index + 1, track));
        }
        self.lock_state().listed = Some((name, tracks));
    }

    fn on_tracks_added(&mut self, name: &str, tracks: Vec<TrackRef>) {
        if !self.is_listed(name) {
            return;
        }
        let first_number = {
            let mut state = self.lock_state();
            let Some((_, listed)) = state.listed.as_mut() else {
                return;
            };
            let first_number = listed.len() + 1;
            listed.extend(tracks.iter().cloned());
            first_number
        };
        for (offset, track) in tracks.iter().enumerate() {
            self.print(&track_line(first_number + offset, track));
        }
    }

    fn on_tracks_removed(&mut self, name: &str, tracks: &[TrackRef]) {
        let mut state = self.lock_state();
        if let Some((listed, listed_tracks)) = state.listed.as_mut() {
            if listed.as_str() == name {
                listed_tracks.retain(|t| !tracks.iter().any(|removed| Track::same(t, removed)));
            }
        }
    }

    fn handle_playlist_message(&mut self, message: protocol::PlaylistMessage) {
        match message {
            protocol::PlaylistMessage::PlaylistsRestored(playlists) => {
                self.print(&format!("Loaded {} playlists.", playlists.len()));
            }
            protocol::PlaylistMessage::Overview {
                playlists,
                active_track,
                play_mode,
            } => self.print_overview(&playlists, active_track.as_ref(), play_mode),
            protocol::PlaylistMessage::Tracks { name, tracks } => self.show_tracks(name, tracks),
            protocol::PlaylistMessage::TrackActivated(track) => {
                self.print(&format!("Now playing: {}", track.title()));
                self.lock_state().active_track = Some(track);
            }
            protocol::PlaylistMessage::PlayModeChanged(mode) => {
                self.print(&format!("Play mode: {}", mode.label()));
            }
            protocol::PlaylistMessage::PlaylistCreated { name } => {
                self.print(&format!("Created playlist {name}."));
            }
            protocol::PlaylistMessage::PlaylistRemoved { name } => {
                if self.is_listed(&name) {
                    self.lock_state().listed = None;
                }
                self.print(&format!("Removed playlist {name}."));
            }
            protocol::PlaylistMessage::PlaylistCleared { name } => {
                if let Some((listed, tracks)) = self.lock_state().listed.as_mut() {
                    if *listed == name {
                        tracks.clear();
                    }
                }
            }
            protocol::PlaylistMessage::TracksAdded { name, tracks } => {
                self.on_tracks_added(&name, tracks)
            }
            protocol::PlaylistMessage::TracksRemoved { name, tracks } => {
                self.on_tracks_removed(&name, &tracks)
            }
            protocol::PlaylistMessage::PlaylistArranged { name } => {
                if self.is_listed(&name) {
                    let _ = self.bus_producer.send(protocol::Message::Playlist(
                        protocol::PlaylistMessage::RequestTracks { name },
                    ));
                }
            }
            _ => {}
        }
    }

    pub fn run(&mut self) {
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(protocol::Message::Playlist(message)) => self.handle_playlist_message(message),
                Ok(protocol::Message::Search(protocol::SearchMessage::Started { .. })) => {
                    self.show_tracks(SEARCH_RESULTS_PLAYLIST.to_string(), Vec::new());
                }
                Ok(protocol::Message::Notice(protocol::NoticeMessage::Info(text))) => {
                    self.print(&text);
                }
                Ok(protocol::Message::Notice(protocol::NoticeMessage::Error(text))) => {
                    self.print(&format!("error: {text}"));
                }
                Ok(protocol::Message::Playback(protocol::PlaybackMessage::VolumeChanged(
                    volume,
                ))) => {
                    self.print(&format!("Volume: {volume}"));
                }
                Ok(protocol::Message::Lifecycle(protocol::LifecycleMessage::StateSaved)) => {
                    debug!("UiManager: state saved, stopping");
                    break;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("UiManager: bus lagged, skipped {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    error!("UiManager: bus closed");
                    break;
                }
            }
        }
    }
}

/// Reads commands until `quit` or end of input. Returns once the user asked
/// to leave; the caller starts the shutdown.
pub fn read_commands(
    input: impl BufRead,
    output: &mut dyn Write,
    state: &SharedConsoleState,
    bus_producer: &Sender<protocol::Message>,
) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!("Console: failed to read input: {}", err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let command = match console_command::parse_command(&line) {
            Ok(command) => command,
            Err(message) => {
                let _ = writeln!(output, "error: {message}");
                continue;
            }
        };
        match command {
            ConsoleCommand::Quit => return,
            ConsoleCommand::Help => {
                let _ = writeln!(output, "{}", console_command::HELP);
            }
            command => {
                let resolved = {
                    let state = state.lock().unwrap_or_else(PoisonError::into_inner);
                    console_command::to_messages(command, &state)
                };
                match resolved {
                    Ok(messages) => {
                        for message in messages {
                            let _ = bus_producer.send(message);
                        }
                    }
                    Err(message) => {
                        let _ = writeln!(output, "error: {message}");
                    }
                }
            }
        }
        let _ = output.flush();
    }
}
