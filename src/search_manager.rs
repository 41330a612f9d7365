use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use tokio::sync::broadcast::{Receiver, Sender};
use uuid::Uuid;

use crate::{
    playlist::SEARCH_RESULTS_PLAYLIST,
    protocol::{self, SearchRequest},
    search::{self, SearchBackend, SearchQuery},
    track::TrackRef,
    worker_pool::WorkerHandle,
};

// The search whose results currently own `# Search Results`.
struct CurrentSearch {
    search_id: Uuid,
    found: usize,
    failed: bool,
}

/// Routes search requests to a backend and funnels the results of the
/// latest search into the search results playlist.
pub struct SearchManager {
    bus_consumer: Receiver<protocol::Message>,
    bus_producer: Sender<protocol::Message>,
    video_backend: Arc<dyn SearchBackend>,
    catalog_backend: Option<Arc<dyn SearchBackend>>,
    workers: WorkerHandle,
    config_path: PathBuf,
    current: Option<CurrentSearch>,
    accepting: bool,
}

impl SearchManager {
    pub fn new(
        bus_consumer: Receiver<protocol::Message>,
        bus_producer: Sender<protocol::Message>,
        video_backend: Arc<dyn SearchBackend>,
        catalog_backend: Option<Arc<dyn SearchBackend>>,
        workers: WorkerHandle,
        config_path: PathBuf,
    ) -> Self {
        Self {
            bus_consumer,
            bus_producer,
            video_backend,
            catalog_backend,
            workers,
            config_path,
            current: None,
            accepting: true,
        }
    }

    fn notice(&self, notice: protocol::NoticeMessage) {
        let _ = self.bus_producer.send(protocol::Message::Notice(notice));
    }

    fn is_current(&self, search_id: Uuid) -> bool {
        self.current
            .as_ref()
            .is_some_and(|current| current.search_id == search_id)
    }

    fn backend_for(&self, query: &SearchQuery) -> Option<Arc<dyn SearchBackend>> {
        if query.needs_catalog() {
            self.catalog_backend.clone()
        } else {
            Some(Arc::clone(&self.video_backend))
        }
    }

    fn start_search(&mut self, request: SearchRequest) {
        if !self.accepting {
            debug!("SearchManager: shutting down, dropping request");
            return;
        }
        let Some(query) = search::route(&request) else {
            trace!("SearchManager: ignoring empty search");
            return;
        };
        let Some(backend) = self.backend_for(&query) else {
            self.notice(protocol::NoticeMessage::Error(format!(
                "No Last.fm key configured. Add one to {}.",
                self.config_path.display()
            )));
            return;
        };

        let search_id = Uuid::new_v4();
        info!("SearchManager: search {} for {:?}", search_id, query);
        let _ = self.bus_producer.send(protocol::Message::Playlist(
            protocol::PlaylistMessage::ClearPlaylist {
                name: SEARCH_RESULTS_PLAYLIST.to_string(),
            },
        ));
        let _ = self.bus_producer.send(protocol::Message::Search(
            protocol::SearchMessage::Started { search_id },
        ));
        self.current = Some(CurrentSearch {
            search_id,
            found: 0,
            failed: false,
        });

        let bus_producer = self.bus_producer.clone();
        let spawned = self.workers.spawn(move || {
            search::run_search(search_id, backend.as_ref(), &query, &bus_producer);
        });
        if let Err(err) = spawned {
            error!("SearchManager: could not queue search: {}", err);
            self.current = None;
            self.notice(protocol::NoticeMessage::Error(format!(
                "Could not start search: {err}"
            )));
        }
    }

    fn on_tracks_found(&mut self, search_id: Uuid, tracks: Vec<TrackRef>) {
        let Some(current) = self.current.as_mut().filter(|c| c.search_id == search_id) else {
            debug!("SearchManager: dropping {} stale results", tracks.len());
            return;
        };
        current.found += tracks.len();
        let _ = self.bus_producer.send(protocol::Message::Playlist(
            protocol::PlaylistMessage::AddTracks {
                name: SEARCH_RESULTS_PLAYLIST.to_string(),
                tracks,
            },
        ));
    }

    fn on_error(&mut self, search_id: Uuid, message: String) {
        match self.current.as_mut().filter(|c| c.search_id == search_id) {
            Some(current) => {
                current.failed = true;
                self.notice(protocol::NoticeMessage::Error(message));
            }
            None => debug!("SearchManager: stale search error: {}", message),
        }
    }

    fn on_finished(&mut self, search_id: Uuid) {
        if !self.is_current(search_id) {
            return;
        }
        let Some(current) = self.current.take() else {
            return;
        };
        debug!(
            "SearchManager: search {} finished with {} results",
            search_id, current.found
        );
        if current.failed {
            return;
        }
        let summary = match current.found {
            0 => "No results found.".to_string(),
            1 => "Found 1 track.".to_string(),
            found => format!("Found {found} tracks."),
        };
        self.notice(protocol::NoticeMessage::Info(summary));
    }

    pub fn run(&mut self) {
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(protocol::Message::Search(protocol::SearchMessage::Request(request))) => {
                    self.start_search(request)
                }
                Ok(protocol::Message::Search(protocol::SearchMessage::TracksFound {
                    search_id,
                    tracks,
                })) => self.on_tracks_found(search_id, tracks),
                Ok(protocol::Message::Search(protocol::SearchMessage::Error {
                    search_id,
                    message,
                })) => self.on_error(search_id, message),
                Ok(protocol::Message::Search(protocol::SearchMessage::Finished { search_id })) => {
                    self.on_finished(search_id)
                }
                Ok(protocol::Message::Lifecycle(protocol::LifecycleMessage::ShutdownRequested)) => {
                    self.accepting = false;
                }
                Ok(protocol::Message::Lifecycle(protocol::LifecycleMessage::StateSaved)) => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SearchManager: bus lagged, skipped {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    error!("SearchManager: bus closed");
                    break;
                }
            }
        }
    }
}
