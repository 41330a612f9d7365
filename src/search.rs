//! Uniform contract over result-producing search backends.
//!
//! A backend streams batches of tracks into a sink and returns once it is
//! done. [`run_search`] wraps one backend call into a search job that emits
//! the batches, at most one error and exactly one `Finished` on the bus.

use log::{debug, info};
use tokio::sync::broadcast::Sender;
use uuid::Uuid;

use crate::{
    protocol::{self, SearchRequest},
    track::TrackRef,
};

/// Prefix routing a term to the video search backend.
pub const VIDEO_SEARCH_PREFIX: &str = "y:";

/// A routed search, in the vocabulary of the backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchQuery {
    /// Free-text video search.
    Videos(String),
    /// Music catalog search by album/artist term.
    Tracks(String),
    /// Tracks similar to a known artist and track name.
    Similar { artist: String, track: String },
}

impl SearchQuery {
    /// Whether the query is served by the music catalog backend.
    pub fn needs_catalog(&self) -> bool {
        !matches!(self, SearchQuery::Videos(_))
    }
}

pub trait SearchBackend: Send + Sync {
    /// Streams results into `sink`, possibly over several batches. Returns a
    /// human-readable message on failure.
    fn search(
        &self,
        query: &SearchQuery,
        sink: &mut dyn FnMut(Vec<TrackRef>),
    ) -> Result<(), String>;
}

/// Maps a user request onto a backend query. Empty terms yield `None`.
pub fn route(request: &SearchRequest) -> Option<SearchQuery> {
    match request {
        SearchRequest::Term(term) => {
            let term = term.trim();
            if let Some(videos) = term.strip_prefix(VIDEO_SEARCH_PREFIX) {
                let videos = videos.trim();
                return (!videos.is_empty()).then(|| SearchQuery::Videos(videos.to_string()));
            }
            (!term.is_empty()).then(|| SearchQuery::Tracks(term.to_string()))
        }
        SearchRequest::RelatedTo(track) => Some(track.with_tags(|tags| {
            SearchQuery::Similar {
                artist: tags.artist.clone().unwrap_or_else(|| tags.title.clone()),
                track: tags.track.clone().unwrap_or_else(|| tags.title.clone()),
            }
        })),
    }
}

// Sends `Finished` on drop so a panicking backend still completes its search.
struct FinishGuard<'a> {
    search_id: Uuid,
    bus_producer: &'a Sender<protocol::Message>,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        let _ = self.bus_producer.send(protocol::Message::Search(
            protocol::SearchMessage::Finished {
                search_id: self.search_id,
            },
        ));
    }
}

/// Runs one backend call as search `search_id`.
pub fn run_search(
    search_id: Uuid,
    backend: &dyn SearchBackend,
    query: &SearchQuery,
    bus_producer: &Sender<protocol::Message>,
) {
    let _finished = FinishGuard {
        search_id,
        bus_producer,
    };
    let mut batches = 0usize;
    let mut sink = |tracks: Vec<TrackRef>| {
        if tracks.is_empty() {
            return;
        }
        batches += 1;
        debug!("Search {}: batch of {} tracks", search_id, tracks.len());
        let _ = bus_producer.send(protocol::Message::Search(
            protocol::SearchMessage::TracksFound { search_id, tracks },
        ));
    };
    let result = backend.search(query, &mut sink);
    if let Err(message) = result {
        info!("Search {} failed: {}", search_id, message);
        let _ = bus_producer.send(protocol::Message::Search(protocol::SearchMessage::Error {
            search_id,
            message: format!("An error occurred during search: {message}"),
        }));
    }
    debug!("Search {} done after {} batches", search_id, batches);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::Track;
    use tokio::sync::broadcast::{self, error::TryRecvError, Receiver};

    struct ScriptedBackend {
        batches: Vec<Vec<&'static str>>,
        failure: Option<&'static str>,
    }

    impl SearchBackend for ScriptedBackend {
        fn search(
            &self,
            _query: &SearchQuery,
            sink: &mut dyn FnMut(Vec<TrackRef>),
        ) -> Result<(), String> {
            for batch in &self.batches {
                sink(batch.iter().map(|t| Track::with_title(*t)).collect());
            }
            match self.failure {
                Some(message) => Err(message.to_string()),
                None => Ok(()),
            }
        }
    }

    fn drain(receiver: &mut Receiver<protocol::Message>) -> Vec<protocol::SearchMessage> {
        let mut messages = Vec::new();
        loop {
            match receiver.try_recv() {
                Ok(protocol::Message::Search(message)) => messages.push(message),
                Ok(_) => {}
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return messages,
            }
        }
    }

    #[test]
    fn test_route_prefixes_and_related_tracks() {
        assert_eq!(
            route(&SearchRequest::Term("y: live set ".to_string())),
            Some(SearchQuery::Videos("live set".to_string()))
        );
        assert_eq!(
            route(&SearchRequest::Term("  Kind of Blue".to_string())),
            Some(SearchQuery::Tracks("Kind of Blue".to_string()))
        );
        assert_eq!(route(&SearchRequest::Term("y:".to_string())), None);
        assert_eq!(route(&SearchRequest::Term("   ".to_string())), None);

        let track = Track::with_title("Some Title");
        assert_eq!(
            route(&SearchRequest::RelatedTo(track.clone())),
            Some(SearchQuery::Similar {
                artist: "Some Title".to_string(),
                track: "Some Title".to_string()
            })
        );
        track.update(|tags| {
            tags.artist = Some("Band".to_string());
            tags.track = Some("Song".to_string());
        });
        assert_eq!(
            route(&SearchRequest::RelatedTo(track)),
            Some(SearchQuery::Similar {
                artist: "Band".to_string(),
                track: "Song".to_string()
            })
        );
    }

    #[test]
    fn test_job_emits_batches_then_single_finished() {
        let (bus_producer, mut receiver) = broadcast::channel(64);
        let backend = ScriptedBackend {
            batches: vec![vec!["a", "b"], vec![], vec!["c"]],
            failure: None,
        };
        let search_id = Uuid::new_v4();
        run_search(search_id, &backend, &SearchQuery::Tracks("x".to_string()), &bus_producer);

        let messages = drain(&mut receiver);
        assert_eq!(messages.len(), 3);
        assert!(matches!(
            &messages[0],
            protocol::SearchMessage::TracksFound { tracks, .. } if tracks.len() == 2
        ));
        assert!(matches!(
            &messages[2],
            protocol::SearchMessage::Finished { search_id: id } if *id == search_id
        ));
    }

    #[test]
    fn test_job_failure_reports_error_before_finished() {
        let (bus_producer, mut receiver) = broadcast::channel(64);
        let backend = ScriptedBackend {
            batches: vec![vec!["partial"]],
            failure: Some("connection reset"),
        };
        run_search(
            Uuid::new_v4(),
            &backend,
            &SearchQuery::Videos("x".to_string()),
            &bus_producer,
        );

        let messages = drain(&mut receiver);
        assert_eq!(messages.len(), 3);
        assert!(matches!(
            &messages[1],
            protocol::SearchMessage::Error { message, .. } if message.contains("connection reset")
        ));
        assert!(matches!(&messages[2], protocol::SearchMessage::Finished { .. }));
    }
}
