//! Periodic persistence ticker.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::debug;
use tokio::sync::broadcast::Sender;

use crate::protocol;

/// Asks the playlist owner to save once per interval. The owner decides
/// whether anything is dirty; the ticker never touches playlist state.
pub struct AutosaveTicker {
    should_quit: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AutosaveTicker {
    pub fn spawn(bus_producer: Sender<protocol::Message>, interval: Duration) -> Self {
        let should_quit = Arc::new(AtomicBool::new(false));
        let thread_should_quit = Arc::clone(&should_quit);
        let handle = thread::Builder::new()
            .name("autosave".to_string())
            .spawn(move || {
                while !thread_should_quit.load(Ordering::Relaxed) {
                    thread::sleep(interval);
                    if thread_should_quit.load(Ordering::Relaxed) {
                        break;
                    }
                    let _ = bus_producer.send(protocol::Message::Playlist(
                        protocol::PlaylistMessage::SaveIfDirty,
                    ));
                }
                debug!("AutosaveTicker: stopped");
            })
            .ok();
        Self {
            should_quit,
            handle,
        }
    }

    /// Raises the quit flag and waits for the current sleep to finish.
    pub fn stop(mut self) {
        self.should_quit.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
