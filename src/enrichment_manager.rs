use std::collections::HashMap;

use log::{debug, error, info, trace, warn};
use tokio::sync::broadcast::{Receiver, Sender};
use uuid::Uuid;

use crate::{
    protocol::{self, JobOutcome},
    thumbnail_cache::ThumbnailCache,
    track::TrackRef,
    track_enrichment::{EnrichmentContext, EnrichmentJob, EnrichmentRequest},
};

/// Whether `track` lacks any authoritative field or cached artwork.
pub fn needs_enrichment(track: &TrackRef, cache: &ThumbnailCache) -> bool {
    let (has_duration, has_channel, video_id) = track.with_tags(|tags| {
        (
            tags.duration.is_some(),
            tags.channel.is_some(),
            tags.video_id.clone(),
        )
    });
    match video_id {
        Some(video_id) => !has_duration || !has_channel || !cache.contains(&video_id),
        None => true,
    }
}

/// Decides which tracks get enriched and keeps count of jobs in flight.
pub struct EnrichmentManager {
    bus_consumer: Receiver<protocol::Message>,
    context: EnrichmentContext,
    in_flight: HashMap<Uuid, Uuid>, // job id -> track id
    accepting: bool,
}

impl EnrichmentManager {
    pub fn new(bus_consumer: Receiver<protocol::Message>, context: EnrichmentContext) -> Self {
        Self {
            bus_consumer,
            context,
            in_flight: HashMap::new(),
            accepting: true,
        }
    }

    fn bus_producer(&self) -> &Sender<protocol::Message> {
        &self.context.bus_producer
    }

    fn is_in_flight(&self, track: &TrackRef) -> bool {
        self.in_flight.values().any(|track_id| *track_id == track.id())
    }

    fn dispatch(&mut self, request: EnrichmentRequest) {
        if !self.accepting {
            debug!("EnrichmentManager: shutting down, dropping request");
            return;
        }
        let track_id = request.track.id();
        let job = EnrichmentJob::new(request, self.context.clone());
        let job_id = job.id();
        match self.context.workers.spawn(move || job.run()) {
            Ok(()) => {
                self.in_flight.insert(job_id, track_id);
            }
            Err(err) => {
                error!("EnrichmentManager: could not queue job: {}", err);
                let _ = self.bus_producer().send(protocol::Message::Notice(
                    protocol::NoticeMessage::Error(format!("Could not look up track: {err}")),
                ));
            }
        }
    }

    fn on_track_activated(&mut self, track: TrackRef) {
        if self.is_in_flight(&track) {
            trace!("EnrichmentManager: {:?} already being enriched", track.title());
            return;
        }
        if needs_enrichment(&track, &self.context.cache) {
            debug!("EnrichmentManager: enriching {:?}", track.title());
            self.dispatch(EnrichmentRequest::plain(track));
        }
    }

    fn on_refresh(&mut self, tracks: Vec<TrackRef>, refresh_title: bool, refresh_thumbnail: bool) {
        info!(
            "EnrichmentManager: refreshing {} tracks (title={}, thumbnail={})",
            tracks.len(),
            refresh_title,
            refresh_thumbnail
        );
        for track in tracks {
            self.dispatch(EnrichmentRequest {
                track,
                refresh_title,
                refresh_thumbnail,
            });
        }
    }

    fn on_job_finished(&mut self, job_id: Uuid, outcome: &JobOutcome) {
        if self.in_flight.remove(&job_id).is_some() {
            trace!(
                "EnrichmentManager: job {} finished ({:?}), {} in flight",
                job_id,
                outcome,
                self.in_flight.len()
            );
        }
    }

    pub fn run(&mut self) {
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(protocol::Message::Playlist(protocol::PlaylistMessage::TrackActivated(
                    track,
                ))) => self.on_track_activated(track),
                Ok(protocol::Message::Enrichment(protocol::EnrichmentMessage::Refresh {
                    tracks,
                    refresh_title,
                    refresh_thumbnail,
                })) => self.on_refresh(tracks, refresh_title, refresh_thumbnail),
                Ok(protocol::Message::Enrichment(protocol::EnrichmentMessage::JobFinished {
                    job_id,
                    outcome,
                    ..
                })) => self.on_job_finished(job_id, &outcome),
                Ok(protocol::Message::Lifecycle(protocol::LifecycleMessage::ShutdownRequested)) => {
                    self.accepting = false;
                }
                Ok(protocol::Message::Lifecycle(protocol::LifecycleMessage::StateSaved)) => {
                    debug!(
                        "EnrichmentManager: stopping with {} jobs in flight",
                        self.in_flight.len()
                    );
                    break;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("EnrichmentManager: bus lagged, skipped {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    error!("EnrichmentManager: bus closed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_resolver::{
        MetadataResolver, ResolveError, ResolveQuery, ResolvedMetadata,
    };
    use crate::thumbnail_fetcher::ThumbnailFetcher;
    use crate::track::Track;
    use crate::worker_pool::WorkerPool;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast::{self, error::TryRecvError};

    struct CountingResolver {
        calls: AtomicUsize,
    }

    impl MetadataResolver for CountingResolver {
        fn resolve(&self, _query: &ResolveQuery) -> Result<ResolvedMetadata, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResolvedMetadata {
                video_id: "vid".to_string(),
                title: None,
                duration: Some(100),
                uploader: Some("Chan".to_string()),
                thumbnails: Vec::new(),
            })
        }
    }

    struct NoFetcher;

    impl ThumbnailFetcher for NoFetcher {
        fn fetch(&self, _url: &str) -> Result<Vec<u8>, String> {
            Err("offline".to_string())
        }
    }

    struct EnrichmentManagerHarness {
        bus_sender: Sender<protocol::Message>,
        receiver: Receiver<protocol::Message>,
        resolver: Arc<CountingResolver>,
        cache: Arc<ThumbnailCache>,
        _pool: WorkerPool,
        _dir: tempfile::TempDir,
    }

    impl EnrichmentManagerHarness {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let (bus_sender, _) = broadcast::channel(4096);
            let resolver = Arc::new(CountingResolver {
                calls: AtomicUsize::new(0),
            });
            let cache = Arc::new(ThumbnailCache::new(dir.path()));
            let pool = WorkerPool::new(2);
            let context = EnrichmentContext {
                resolver: resolver.clone(),
                fetcher: Arc::new(NoFetcher),
                cache: Arc::clone(&cache),
                workers: pool.handle(),
                bus_producer: bus_sender.clone(),
            };
            let manager_receiver = bus_sender.subscribe();
            thread::spawn(move || {
                let mut manager = EnrichmentManager::new(manager_receiver, context);
                manager.run();
            });
            Self {
                receiver: bus_sender.subscribe(),
                bus_sender,
                resolver,
                cache,
                _pool: pool,
                _dir: dir,
            }
        }

        fn activate(&self, track: &TrackRef) {
            self.bus_sender
                .send(protocol::Message::Playlist(
                    protocol::PlaylistMessage::TrackActivated(track.clone()),
                ))
                .expect("send");
        }
    }

    fn wait_for_message<F>(
        receiver: &mut Receiver<protocol::Message>,
        timeout: Duration,
        mut predicate: F,
    ) -> protocol::Message
    where
        F: FnMut(&protocol::Message) -> bool,
    {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                panic!("timed out waiting for expected message");
            }
            match receiver.try_recv() {
                Ok(message) => {
                    if predicate(&message) {
                        return message;
                    }
                }
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("bus closed while waiting for message"),
            }
        }
    }

    fn assert_no_message<F>(
        receiver: &mut Receiver<protocol::Message>,
        timeout: Duration,
        mut predicate: F,
    ) where
        F: FnMut(&protocol::Message) -> bool,
    {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                return;
            }
            match receiver.try_recv() {
                Ok(message) => {
                    if predicate(&message) {
                        panic!("received unexpected message: {:?}", message);
                    }
                }
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => return,
            }
        }
    }

    fn is_job_finished(message: &protocol::Message) -> bool {
        matches!(
            message,
            protocol::Message::Enrichment(protocol::EnrichmentMessage::JobFinished { .. })
        )
    }

    fn png_bytes() -> Vec<u8> {
        let image = image::DynamicImage::new_rgb8(2, 2);
        let mut cursor = Cursor::new(Vec::new());
        image
            .write_to(&mut cursor, image::ImageFormat::Png)
            .expect("encode png");
        cursor.into_inner()
    }

    #[test]
    fn test_needs_enrichment_checks_every_field_and_artwork() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ThumbnailCache::new(dir.path());
        let track = Track::with_title("song");
        assert!(needs_enrichment(&track, &cache));

        track.update(|tags| {
            tags.video_id = Some("vid".to_string());
            tags.duration = Some(10);
            tags.channel = Some("Chan".to_string());
        });
        assert!(needs_enrichment(&track, &cache));

        cache.store("vid", png_bytes()).expect("store");
        assert!(!needs_enrichment(&track, &cache));

        track.update(|tags| tags.channel = None);
        assert!(needs_enrichment(&track, &cache));
    }

    #[test]
    fn test_activation_of_bare_track_dispatches_job() {
        let mut harness = EnrichmentManagerHarness::new();
        let track = Track::with_title("bare");
        harness.activate(&track);

        let _ = wait_for_message(&mut harness.receiver, Duration::from_secs(2), is_job_finished);
        assert_eq!(harness.resolver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(track.video_id().as_deref(), Some("vid"));
    }

    #[test]
    fn test_activation_of_complete_track_is_ignored() {
        let mut harness = EnrichmentManagerHarness::new();
        harness.cache.store("vid", png_bytes()).expect("store");
        let track = Track::with_title("complete");
        track.update(|tags| {
            tags.video_id = Some("vid".to_string());
            tags.duration = Some(10);
            tags.channel = Some("Chan".to_string());
        });
        harness.activate(&track);

        assert_no_message(&mut harness.receiver, Duration::from_millis(200), is_job_finished);
        assert_eq!(harness.resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_refresh_dispatches_one_job_per_track() {
        let mut harness = EnrichmentManagerHarness::new();
        let tracks = vec![Track::with_title("a"), Track::with_title("b")];
        harness
            .bus_sender
            .send(protocol::Message::Enrichment(
                protocol::EnrichmentMessage::Refresh {
                    tracks,
                    refresh_title: true,
                    refresh_thumbnail: false,
                },
            ))
            .expect("send");

        let _ = wait_for_message(&mut harness.receiver, Duration::from_secs(2), is_job_finished);
        let _ = wait_for_message(&mut harness.receiver, Duration::from_secs(2), is_job_finished);
        assert_eq!(harness.resolver.calls.load(Ordering::SeqCst), 2);
    }
}
