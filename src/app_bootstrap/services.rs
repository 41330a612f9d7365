use std::{
    any::Any,
    io,
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{error, info};
use tokio::sync::broadcast;

use crate::{
    autosave::AutosaveTicker,
    backends::{lastfm::LastFmBackend, ytdlp::YtDlpSearch},
    config::Config,
    enrichment_manager::EnrichmentManager,
    metadata_resolver::YtDlpResolver,
    playback_session::PlaybackSession,
    playback_surface::HeadlessSurface,
    playlist::Playlist,
    playlist_manager::PlaylistManager,
    playlist_store::PlaylistStore,
    protocol::Message,
    search::SearchBackend,
    search_manager::SearchManager,
    thumbnail_cache::ThumbnailCache,
    thumbnail_fetcher::HttpThumbnailFetcher,
    track_enrichment::EnrichmentContext,
    ui_manager::{SharedConsoleState, UiManager},
    worker_pool::WorkerPool,
};

pub struct BackgroundServicesConfig {
    pub bus_sender: broadcast::Sender<Message>,
    pub config: Config,
    pub config_file: PathBuf,
    pub store: PlaylistStore,
    pub playlists: Vec<Playlist>,
    pub thumbnail_cache: Arc<ThumbnailCache>,
    pub console_state: SharedConsoleState,
}

/// Handles of everything `spawn_background_services` started.
pub struct BackgroundServices {
    workers: WorkerPool,
    autosave: Option<AutosaveTicker>,
    threads: Vec<JoinHandle<()>>,
}

impl BackgroundServices {
    /// Stops the autosave ticker. Call before the final save is requested.
    pub fn stop_autosave(&mut self) {
        if let Some(autosave) = self.autosave.take() {
            autosave.stop();
        }
    }

    /// Gives service threads up to `grace` to exit, joins those that did and
    /// reports the rest.
    pub fn finish(self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && !self.threads.iter().all(JoinHandle::is_finished) {
            thread::sleep(Duration::from_millis(10));
        }
        let mut still_running = 0;
        for handle in self.threads {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                still_running += 1;
            }
        }
        if still_running > 0 {
            info!("{} services still running at exit", still_running);
        }
        // Queued jobs are abandoned; their results have nowhere to go.
        drop(self.workers);
    }
}

/// Text of a panic payload, for logging.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn spawn_service<F>(name: &str, run: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let thread_name = name.to_string();
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let run_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(run));
        if let Err(payload) = run_result {
            error!(
                "{} thread terminated due to panic: {}",
                thread_name,
                panic_message(payload.as_ref())
            );
        }
    })
}

pub fn spawn_background_services(
    services_config: BackgroundServicesConfig,
) -> io::Result<BackgroundServices> {
    let BackgroundServicesConfig {
        bus_sender,
        config,
        config_file,
        store,
        playlists,
        thumbnail_cache,
        console_state,
    } = services_config;

    let workers = WorkerPool::new(config.workers.max_concurrent_jobs);
    let connect_timeout = Duration::from_secs(config.network.connect_timeout_secs);
    let read_timeout = Duration::from_secs(config.network.read_timeout_secs);
    let resolver_timeout = Duration::from_secs(config.network.resolver_timeout_secs);

    // Every receiver exists before any component starts publishing.
    let session_bus_receiver = bus_sender.subscribe();
    let enrichment_bus_receiver = bus_sender.subscribe();
    let search_bus_receiver = bus_sender.subscribe();
    let ui_bus_receiver = bus_sender.subscribe();
    let playlist_manager_bus_receiver = bus_sender.subscribe();

    let mut threads = Vec::new();

    let surface = HeadlessSurface::new(bus_sender.clone());
    // Queued ahead of the restored track's activation.
    surface.announce_ready();
    let session_bus_sender = bus_sender.clone();
    let resume_threshold_secs = config.playback.resume_threshold_secs;
    threads.push(spawn_service("playback-session", move || {
        let mut session = PlaybackSession::new(
            Box::new(surface),
            resume_threshold_secs,
            session_bus_receiver,
            session_bus_sender,
        );
        session.run();
    })?);

    let enrichment_context = EnrichmentContext {
        resolver: Arc::new(YtDlpResolver::new(
            config.network.resolver_command.clone(),
            resolver_timeout,
        )),
        fetcher: Arc::new(HttpThumbnailFetcher::new(connect_timeout, read_timeout)),
        cache: Arc::clone(&thumbnail_cache),
        workers: workers.handle(),
        bus_producer: bus_sender.clone(),
    };
    threads.push(spawn_service("enrichment-manager", move || {
        let mut enrichment_manager =
            EnrichmentManager::new(enrichment_bus_receiver, enrichment_context);
        enrichment_manager.run();
    })?);

    let video_backend: Arc<dyn SearchBackend> = Arc::new(YtDlpSearch::new(
        config.network.resolver_command.clone(),
        resolver_timeout,
        config.search.video_result_limit,
    ));
    let catalog_backend: Option<Arc<dyn SearchBackend>> =
        if config.search.lastfm_api_key.is_empty() {
            info!("No Last.fm key configured; catalog searches are disabled");
            None
        } else {
            Some(Arc::new(LastFmBackend::new(
                config.search.lastfm_api_key.clone(),
                config.search.lastfm_track_limit,
                connect_timeout,
                read_timeout,
            )))
        };
    let search_bus_sender = bus_sender.clone();
    let search_workers = workers.handle();
    threads.push(spawn_service("search-manager", move || {
        let mut search_manager = SearchManager::new(
            search_bus_receiver,
            search_bus_sender,
            video_backend,
            catalog_backend,
            search_workers,
            config_file,
        );
        search_manager.run();
    })?);

    let ui_bus_sender = bus_sender.clone();
    threads.push(spawn_service("ui-manager", move || {
        let mut ui_manager = UiManager::new(
            ui_bus_receiver,
            ui_bus_sender,
            console_state,
            Box::new(io::stdout()),
        );
        ui_manager.run();
    })?);

    // Started last: restoring state publishes right away.
    let playlist_manager_bus_sender = bus_sender.clone();
    threads.push(spawn_service("playlist-manager", move || {
        let mut playlist_manager = PlaylistManager::new(
            playlists,
            store,
            playlist_manager_bus_receiver,
            playlist_manager_bus_sender,
        );
        playlist_manager.run();
    })?);

    let autosave = AutosaveTicker::spawn(
        bus_sender,
        Duration::from_millis(config.storage.autosave_interval_ms),
    );

    Ok(BackgroundServices {
        workers,
        autosave: Some(autosave),
        threads,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_reads_str_and_string_payloads() {
        let borrowed: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(borrowed.as_ref()), "boom");
        assert_eq!(panic_message(owned.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_spawn_service_contains_panics() {
        let handle = spawn_service("panicking-service", || panic!("service failed"))
            .expect("spawn");
        assert!(handle.join().is_ok());
    }
}
