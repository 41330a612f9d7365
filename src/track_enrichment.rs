//! Background jobs that fill in a track's authoritative metadata and artwork.
//!
//! A metadata job resolves the track, writes the result into the track under
//! its lock and asks the playlist owner to re-broadcast it. When artwork is
//! missing or a refresh was asked for, it hands a thumbnail job to the same
//! pool. Every metadata job reports `JobFinished` exactly once, including
//! when it panics.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::broadcast::Sender;
use uuid::Uuid;

use crate::{
    metadata_resolver::{MetadataResolver, ResolveQuery, ResolvedMetadata, ThumbnailCandidate},
    protocol::{self, JobOutcome},
    thumbnail_cache::ThumbnailCache,
    thumbnail_fetcher::ThumbnailFetcher,
    track::TrackRef,
    worker_pool::WorkerHandle,
};

/// Collaborators shared by all enrichment jobs.
#[derive(Clone)]
pub struct EnrichmentContext {
    pub resolver: Arc<dyn MetadataResolver>,
    pub fetcher: Arc<dyn ThumbnailFetcher>,
    pub cache: Arc<ThumbnailCache>,
    pub workers: WorkerHandle,
    pub bus_producer: Sender<protocol::Message>,
}

#[derive(Debug, Clone)]
pub struct EnrichmentRequest {
    pub track: TrackRef,
    pub refresh_title: bool,
    pub refresh_thumbnail: bool,
}

impl EnrichmentRequest {
    pub fn plain(track: TrackRef) -> Self {
        Self {
            track,
            refresh_title: false,
            refresh_thumbnail: false,
        }
    }
}

/// Strips characters that degrade search matching and collapses whitespace.
pub fn sanitize_search_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || "'&.,()".contains(c) {
                c
            } else {
                ' '
            }
        })
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Highest pixel area when refreshing, otherwise the first candidate.
pub fn choose_thumbnail(
    candidates: &[ThumbnailCandidate],
    refresh_thumbnail: bool,
) -> Option<&ThumbnailCandidate> {
    if refresh_thumbnail {
        candidates.iter().max_by_key(|candidate| candidate.area())
    } else {
        candidates.first()
    }
}

// Reports the job's outcome when dropped, so unwinding still reports.
struct FinishGuard {
    job_id: Uuid,
    track: TrackRef,
    outcome: JobOutcome,
    bus_producer: Sender<protocol::Message>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let outcome = std::mem::replace(&mut self.outcome, JobOutcome::Aborted);
        let _ = self.bus_producer.send(protocol::Message::Enrichment(
            protocol::EnrichmentMessage::JobFinished {
                job_id: self.job_id,
                track: self.track.clone(),
                outcome,
            },
        ));
    }
}

pub struct EnrichmentJob {
    id: Uuid,
    request: EnrichmentRequest,
    context: EnrichmentContext,
}

impl EnrichmentJob {
    pub fn new(request: EnrichmentRequest, context: EnrichmentContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            context,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn query(&self) -> Result<ResolveQuery, String> {
        let (video_id, title) = self
            .request
            .track
            .with_tags(|tags| (tags.video_id.clone(), tags.title.clone()));
        if let Some(video_id) = video_id.filter(|id| !id.is_empty()) {
            return Ok(ResolveQuery::CanonicalId(video_id));
        }
        let cleaned = sanitize_search_title(&title);
        if cleaned.is_empty() {
            return Err(format!("Cannot search for {title:?}"));
        }
        Ok(ResolveQuery::Title(cleaned))
    }

    fn apply(&self, metadata: &ResolvedMetadata) {
        let refresh_title = self.request.refresh_title;
        self.request.track.update(|tags| {
            if let Some(duration) = metadata.duration {
                tags.duration = Some(duration);
            }
            tags.video_id = Some(metadata.video_id.clone());
            if let Some(uploader) = &metadata.uploader {
                tags.channel = Some(uploader.clone());
            }
            if refresh_title {
                if let Some(title) = &metadata.title {
                    tags.title = title.clone();
                }
            }
        });
    }

    pub fn run(self) {
        let mut guard = FinishGuard {
            job_id: self.id,
            track: self.request.track.clone(),
            outcome: JobOutcome::Aborted,
            bus_producer: self.context.bus_producer.clone(),
        };

        let resolved = self.query().and_then(|query| {
            self.context
                .resolver
                .resolve(&query)
                .map_err(|err| err.to_string())
        });
        let metadata = match resolved {
            Ok(metadata) => metadata,
            Err(message) => {
                info!(
                    "Enrichment of {:?} failed: {}",
                    self.request.track.title(),
                    message
                );
                let _ = self.context.bus_producer.send(protocol::Message::Notice(
                    protocol::NoticeMessage::Error(message.clone()),
                ));
                guard.outcome = JobOutcome::Failed(message);
                return;
            }
        };

        self.apply(&metadata);
        let _ = self.context.bus_producer.send(protocol::Message::Playlist(
            protocol::PlaylistMessage::UpdateTrack(self.request.track.clone()),
        ));

        let wants_thumbnail = self.request.refresh_thumbnail
            || self.context.cache.get_cached(&metadata.video_id).is_none();
        if wants_thumbnail {
            if let Some(candidate) =
                choose_thumbnail(&metadata.thumbnails, self.request.refresh_thumbnail)
            {
                let thumbnail_job = ThumbnailJob {
                    url: candidate.url.clone(),
                    video_id: metadata.video_id.clone(),
                    track: self.request.track.clone(),
                    context: self.context.clone(),
                };
                if let Err(err) = self.context.workers.spawn(move || thumbnail_job.run()) {
                    warn!("Could not queue thumbnail download: {}", err);
                }
            }
        }
        guard.outcome = JobOutcome::Updated;
    }
}

/// Downloads one thumbnail and offers it to the cache.
struct ThumbnailJob {
    url: String,
    video_id: String,
    track: TrackRef,
    context: EnrichmentContext,
}

impl ThumbnailJob {
    fn run(self) {
        let bytes = match self.context.fetcher.fetch(&self.url) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("Could not retrieve thumbnail {}: {}", self.url, err);
                return;
            }
        };
        match self.context.cache.store(&self.video_id, bytes) {
            Ok(true) => {
                self.track.update(|tags| tags.icon_url = Some(self.url.clone()));
                let _ = self.context.bus_producer.send(protocol::Message::Playlist(
                    protocol::PlaylistMessage::UpdateTrack(self.track.clone()),
                ));
            }
            Ok(false) => debug!("Kept larger cached thumbnail for {}", self.video_id),
            Err(err) => warn!("Could not store thumbnail for {}: {}", self.video_id, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_resolver::ResolveError;
    use crate::track::Track;
    use crate::worker_pool::WorkerPool;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast::{self, error::TryRecvError, Receiver};

    struct FakeResolver {
        result: Result<ResolvedMetadata, ResolveError>,
        queries: Mutex<Vec<ResolveQuery>>,
        panics: bool,
    }

    impl MetadataResolver for FakeResolver {
        fn resolve(&self, query: &ResolveQuery) -> Result<ResolvedMetadata, ResolveError> {
            self.queries.lock().expect("queries").push(query.clone());
            if self.panics {
                panic!("resolver exploded");
            }
            self.result.clone()
        }
    }

    struct FakeFetcher {
        images: HashMap<String, Vec<u8>>,
        fetched: Mutex<Vec<String>>,
    }

    impl ThumbnailFetcher for FakeFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
            self.fetched.lock().expect("fetched").push(url.to_string());
            self.images
                .get(url)
                .cloned()
                .ok_or_else(|| "404".to_string())
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = image::DynamicImage::new_rgb8(width, height);
        let mut cursor = Cursor::new(Vec::new());
        image
            .write_to(&mut cursor, image::ImageFormat::Png)
            .expect("encode png");
        cursor.into_inner()
    }

    fn metadata() -> ResolvedMetadata {
        ResolvedMetadata {
            video_id: "vid".to_string(),
            title: Some("Official Title".to_string()),
            duration: Some(245),
            uploader: Some("Uploader".to_string()),
            thumbnails: vec![
                ThumbnailCandidate {
                    url: "small".to_string(),
                    width: Some(12),
                    height: Some(9),
                },
                ThumbnailCandidate {
                    url: "large".to_string(),
                    width: Some(48),
                    height: Some(36),
                },
                ThumbnailCandidate {
                    url: "unsized".to_string(),
                    width: None,
                    height: None,
                },
            ],
        }
    }

    struct Harness {
        context: EnrichmentContext,
        resolver: Arc<FakeResolver>,
        fetcher: Arc<FakeFetcher>,
        receiver: Receiver<protocol::Message>,
        pool: WorkerPool,
        _dir: tempfile::TempDir,
    }

    fn harness(result: Result<ResolvedMetadata, ResolveError>, panics: bool) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let (bus_producer, receiver) = broadcast::channel(256);
        let resolver = Arc::new(FakeResolver {
            result,
            queries: Mutex::new(Vec::new()),
            panics,
        });
        let fetcher = Arc::new(FakeFetcher {
            images: HashMap::from([
                ("small".to_string(), png_bytes(12, 9)),
                ("large".to_string(), png_bytes(48, 36)),
            ]),
            fetched: Mutex::new(Vec::new()),
        });
        let pool = WorkerPool::new(2);
        let context = EnrichmentContext {
            resolver: resolver.clone(),
            fetcher: fetcher.clone(),
            cache: Arc::new(ThumbnailCache::new(dir.path())),
            workers: pool.handle(),
            bus_producer,
        };
        Harness {
            context,
            resolver,
            fetcher,
            receiver,
            pool,
            _dir: dir,
        }
    }

    fn collect_until_idle(receiver: &mut Receiver<protocol::Message>) -> Vec<protocol::Message> {
        let mut messages = Vec::new();
        let mut last_seen = Instant::now();
        while last_seen.elapsed() < Duration::from_millis(150) {
            match receiver.try_recv() {
                Ok(message) => {
                    messages.push(message);
                    last_seen = Instant::now();
                }
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => break,
            }
        }
        messages
    }

    fn update_count(messages: &[protocol::Message]) -> usize {
        messages
            .iter()
            .filter(|m| {
                matches!(
                    m,
                    protocol::Message::Playlist(protocol::PlaylistMessage::UpdateTrack(_))
                )
            })
            .count()
    }

    fn finished_outcomes(messages: &[protocol::Message]) -> Vec<JobOutcome> {
        messages
            .iter()
            .filter_map(|m| match m {
                protocol::Message::Enrichment(protocol::EnrichmentMessage::JobFinished {
                    outcome,
                    ..
                }) => Some(outcome.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_sanitize_search_title() {
        assert_eq!(
            sanitize_search_title("AC/DC - Back in Black [HD] (Live)"),
            "AC DC Back in Black HD (Live)"
        );
        assert_eq!(sanitize_search_title("Rock'n Roll & more..."), "Rock'n Roll & more...");
        assert_eq!(sanitize_search_title("***"), "");
    }

    #[test]
    fn test_choose_thumbnail_prefers_area_only_on_refresh() {
        let candidates = metadata().thumbnails;
        assert_eq!(
            choose_thumbnail(&candidates, false).map(|c| c.url.as_str()),
            Some("small")
        );
        assert_eq!(
            choose_thumbnail(&candidates, true).map(|c| c.url.as_str()),
            Some("large")
        );
        assert!(choose_thumbnail(&[], true).is_none());
    }

    #[test]
    fn test_successful_job_updates_track_and_fetches_first_thumbnail() {
        let mut harness = harness(Ok(metadata()), false);
        let track = Track::with_title("my song [hq]");
        let job = EnrichmentJob::new(EnrichmentRequest::plain(track.clone()), harness.context.clone());
        job.run();

        let messages = collect_until_idle(&mut harness.receiver);
        assert_eq!(track.title(), "my song [hq]");
        assert_eq!(track.video_id().as_deref(), Some("vid"));
        assert_eq!(track.duration(), Some(245));
        assert_eq!(track.tags().channel.as_deref(), Some("Uploader"));
        assert_eq!(track.tags().icon_url.as_deref(), Some("small"));
        assert_eq!(update_count(&messages), 2);
        assert_eq!(finished_outcomes(&messages), vec![JobOutcome::Updated]);
        assert_eq!(
            harness.resolver.queries.lock().expect("queries").as_slice(),
            &[ResolveQuery::Title("my song hq".to_string())]
        );
        assert_eq!(
            harness.context.cache.get_cached("vid").map(|t| t.area()),
            Some(12 * 9)
        );
        harness.pool.shutdown();
    }

    #[test]
    fn test_refresh_renames_and_takes_largest_thumbnail() {
        let mut harness = harness(Ok(metadata()), false);
        let track = Track::with_title("old");
        track.update(|tags| tags.video_id = Some("vid".to_string()));
        let request = EnrichmentRequest {
            track: track.clone(),
            refresh_title: true,
            refresh_thumbnail: true,
        };
        EnrichmentJob::new(request, harness.context.clone()).run();
        let _ = collect_until_idle(&mut harness.receiver);

        assert_eq!(track.title(), "Official Title");
        assert_eq!(
            harness.resolver.queries.lock().expect("queries").as_slice(),
            &[ResolveQuery::CanonicalId("vid".to_string())]
        );
        assert_eq!(
            harness.context.cache.get_cached("vid").map(|t| t.area()),
            Some(48 * 36)
        );
        harness.pool.shutdown();
    }

    #[test]
    fn test_cached_thumbnail_is_not_fetched_again() {
        let mut harness = harness(Ok(metadata()), false);
        harness
            .context
            .cache
            .store("vid", png_bytes(4, 4))
            .expect("seed cache");
        let track = Track::with_title("song");
        EnrichmentJob::new(EnrichmentRequest::plain(track), harness.context.clone()).run();

        let messages = collect_until_idle(&mut harness.receiver);
        assert_eq!(update_count(&messages), 1);
        assert!(harness.fetcher.fetched.lock().expect("fetched").is_empty());
        harness.pool.shutdown();
    }

    #[test]
    fn test_failure_reports_resolver_text_and_no_update() {
        let mut harness = harness(
            Err(ResolveError::Resolver("ERROR: This video is private".to_string())),
            false,
        );
        let track = Track::with_title("song");
        EnrichmentJob::new(EnrichmentRequest::plain(track.clone()), harness.context.clone()).run();

        let messages = collect_until_idle(&mut harness.receiver);
        assert_eq!(update_count(&messages), 0);
        assert!(messages.iter().any(|m| matches!(
            m,
            protocol::Message::Notice(protocol::NoticeMessage::Error(text))
                if text == "ERROR: This video is private"
        )));
        assert_eq!(
            finished_outcomes(&messages),
            vec![JobOutcome::Failed("ERROR: This video is private".to_string())]
        );
        assert_eq!(track.video_id(), None);
        harness.pool.shutdown();
    }

    #[test]
    fn test_empty_result_reports_no_results() {
        let mut harness = harness(Err(ResolveError::NoResults), false);
        EnrichmentJob::new(
            EnrichmentRequest::plain(Track::with_title("song")),
            harness.context.clone(),
        )
        .run();
        let messages = collect_until_idle(&mut harness.receiver);
        assert_eq!(
            finished_outcomes(&messages),
            vec![JobOutcome::Failed("No results found.".to_string())]
        );
        harness.pool.shutdown();
    }

    #[test]
    fn test_panicking_job_still_reports_finished_once() {
        let mut harness = harness(Ok(metadata()), true);
        let job = EnrichmentJob::new(
            EnrichmentRequest::plain(Track::with_title("song")),
            harness.context.clone(),
        );
        harness.pool.spawn(move || job.run()).expect("spawn");

        let messages = collect_until_idle(&mut harness.receiver);
        assert_eq!(finished_outcomes(&messages), vec![JobOutcome::Aborted]);
        harness.pool.shutdown();
    }
}
