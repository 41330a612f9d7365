//! Application runtime bootstrap and top-level orchestration.

use std::{
    io,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::{
    app_bootstrap::services::{
        spawn_background_services, BackgroundServices, BackgroundServicesConfig,
    },
    config::{self, Config},
    playlist_store::{PlaylistStore, StoreError},
    protocol::{LifecycleMessage, Message},
    thumbnail_cache::ThumbnailCache,
    ui_manager::{self, SharedConsoleState},
};

const BUS_CAPACITY: usize = 4096;
const THUMBNAIL_DIR_NAME: &str = "thumbnails";

/// Failures that prevent the application from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("cannot use state directory {path}: {source}")]
    StateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("refusing to start with unreadable playlists: {0}")]
    Playlists(#[from] StoreError),
    #[error("failed to start services: {0}")]
    Services(#[source] io::Error),
}

/// Owns startup wiring and the console session.
pub(crate) struct AppRuntime {
    config: Config,
    bus_sender: broadcast::Sender<Message>,
    console_state: SharedConsoleState,
    services: BackgroundServices,
}

impl AppRuntime {
    /// Loads config and persisted state, then starts every service.
    pub(crate) fn build() -> Result<Self, StartupError> {
        Self::build_with_config_file(config::config_file_path()?)
    }

    fn build_with_config_file(config_file: PathBuf) -> Result<Self, StartupError> {
        let config = config::load_or_create(&config_file)?;
        log::set_max_level(config.log_level());

        let data_dir = config.data_dir()?;
        std::fs::create_dir_all(&data_dir).map_err(|source| StartupError::StateDir {
            path: data_dir.clone(),
            source,
        })?;
        info!("Using state directory {}", data_dir.display());

        let store = PlaylistStore::new(&data_dir);
        let playlists = store.load_playlists()?;
        let thumbnail_cache = Arc::new(ThumbnailCache::new(data_dir.join(THUMBNAIL_DIR_NAME)));

        let (bus_sender, _) = broadcast::channel(BUS_CAPACITY);
        let console_state = SharedConsoleState::default();

        let services = spawn_background_services(BackgroundServicesConfig {
            bus_sender: bus_sender.clone(),
            config: config.clone(),
            config_file,
            store,
            playlists,
            thumbnail_cache,
            console_state: Arc::clone(&console_state),
        })
        .map_err(StartupError::Services)?;

        Ok(Self {
            config,
            bus_sender,
            console_state,
            services,
        })
    }

    /// Runs the console until the user quits, then shuts down in order.
    pub(crate) fn run(mut self) {
        let stdin = io::stdin();
        let mut stdout = io::stdout();
        ui_manager::read_commands(stdin.lock(), &mut stdout, &self.console_state, &self.bus_sender);
        self.shutdown();
        self.services.finish(Duration::from_millis(500));
    }

    fn shutdown(&mut self) {
        info!("Shutting down");
        self.services.stop_autosave();
        let mut receiver = self.bus_sender.subscribe();
        let _ = self
            .bus_sender
            .send(Message::Lifecycle(LifecycleMessage::ShutdownRequested));

        let timeout = self.shutdown_timeout();
        if !wait_for_state_saved(&mut receiver, timeout) {
            warn!("State was not saved within {:?}", timeout);
        }
    }

    fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.config.network.read_timeout_secs.max(5))
    }
}

fn wait_for_state_saved(receiver: &mut broadcast::Receiver<Message>, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        match receiver.try_recv() {
            Ok(Message::Lifecycle(LifecycleMessage::StateSaved)) => return true,
            Ok(_) => {}
            Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(10)),
            Err(TryRecvError::Lagged(skipped)) => {
                debug!("Shutdown wait skipped {} messages", skipped);
            }
            Err(TryRecvError::Closed) => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_wait_for_state_saved_skips_other_traffic() {
        let (bus_sender, mut receiver) = broadcast::channel(16);
        bus_sender
            .send(Message::Lifecycle(LifecycleMessage::SessionFlushed))
            .expect("send");
        bus_sender
            .send(Message::Lifecycle(LifecycleMessage::StateSaved))
            .expect("send");
        assert!(wait_for_state_saved(&mut receiver, Duration::from_secs(1)));
    }

    #[test]
    fn test_wait_for_state_saved_times_out() {
        let (bus_sender, mut receiver) = broadcast::channel::<Message>(16);
        let started = Instant::now();
        assert!(!wait_for_state_saved(&mut receiver, Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        drop(bus_sender);
    }

    #[test]
    fn test_malformed_playlists_abort_startup_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().join("state");
        fs::create_dir_all(&data_dir).expect("data dir");
        let corrupt = "{\"Mix\": [{\"title\": ";
        fs::write(data_dir.join("playlists.json"), corrupt).expect("seed playlists");

        let mut config = Config::default();
        config.storage.data_dir = Some(data_dir.clone());
        let config_file = dir.path().join("config.toml");
        fs::write(&config_file, toml::to_string(&config).expect("serialize")).expect("config");

        match AppRuntime::build_with_config_file(config_file) {
            Err(StartupError::Playlists(StoreError::Malformed { .. })) => {}
            Err(other) => panic!("unexpected startup error: {other}"),
            Ok(_) => panic!("startup should refuse malformed playlists"),
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(
            fs::read_to_string(data_dir.join("playlists.json")).expect("read"),
            corrupt
        );
        assert!(!data_dir.join("currentTrack.json").exists());
    }
}
