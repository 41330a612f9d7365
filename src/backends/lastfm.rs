//! Music catalog search backed by the Last.fm web API.
//!
//! Term searches walk the album matches page by page and emit, per album,
//! its track list followed by the artist's top tracks, until the configured
//! track limit is reached. Similar-track searches are a single request.

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::thread;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, trace};
use serde_json::Value;

use crate::{
    backends::{array_or_single, string_field},
    search::{SearchBackend, SearchQuery},
    track::{Track, TrackRef, TrackTags},
};

const API_ROOT: &str = "http://ws.audioscrobbler.com/2.0/";
const MAX_ALBUM_PAGES: usize = 20;
const REQUESTS_PER_SECOND: u32 = 5;

pub struct LastFmBackend {
    api_key: String,
    track_limit: usize,
    http_client: ureq::Agent,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

pub fn similar_track_tags(response: &Value) -> Vec<TrackTags> {
    let Some(similar) = response.get("similartracks") else {
        return Vec::new();
    };
    array_or_single(similar.get("track"))
        .into_iter()
        .filter_map(|entry| {
            let name = string_field(entry, "name")?;
            let artist = entry.get("artist").and_then(|a| string_field(a, "name"))?;
            let mut tags = TrackTags::with_title(format!("{artist} - {name}"));
            tags.duration = entry
                .get("duration")
                .and_then(Value::as_u64)
                .filter(|seconds| *seconds > 0);
            tags.artist = Some(artist);
            tags.track = Some(name);
            Some(tags)
        })
        .collect()
}

/// `(artist, album)` pairs of one `album.search` page.
pub fn album_matches(response: &Value) -> Option<Vec<(String, String)>> {
    let albums = response.get("results")?.get("albummatches")?;
    Some(
        array_or_single(albums.get("album"))
            .into_iter()
            .filter_map(|album| Some((string_field(album, "artist")?, string_field(album, "name")?)))
            .collect(),
    )
}

pub fn album_track_tags(response: &Value) -> Vec<TrackTags> {
    let Some(album) = response.get("album") else {
        return Vec::new();
    };
    let (Some(artist), Some(album_name)) = (string_field(album, "artist"), string_field(album, "name"))
    else {
        return Vec::new();
    };
    let tracks = album.get("tracks").and_then(|tracks| tracks.get("track"));
    array_or_single(tracks)
        .into_iter()
        .filter_map(|entry| {
            let name = string_field(entry, "name")?;
            let mut tags = TrackTags::with_title(format!("{artist} - {album_name} - {name}"));
            tags.artist = Some(artist.clone());
            tags.album = Some(album_name.clone());
            tags.track = Some(name);
            Some(tags)
        })
        .collect()
}

pub fn top_track_tags(response: &Value) -> Vec<TrackTags> {
    let Some(top) = response.get("toptracks") else {
        return Vec::new();
    };
    array_or_single(top.get("track"))
        .into_iter()
        .filter_map(|entry| {
            let name = string_field(entry, "name")?;
            let artist = entry.get("artist").and_then(|a| string_field(a, "name"))?;
            let album = string_field(entry, "album");
            let title = match &album {
                Some(album) => format!("{artist} - {album} - {name}"),
                None => format!("{artist} - {name}"),
            };
            let mut tags = TrackTags::with_title(title);
            tags.artist = Some(artist);
            tags.album = album;
            tags.track = Some(name);
            Some(tags)
        })
        .collect()
}

// Drops titles already emitted by this search and stops at the limit.
struct SeenTitles {
    titles: HashSet<String>,
    limit: usize,
}

impl SeenTitles {
    fn admit(&mut self, candidates: Vec<TrackTags>) -> Vec<TrackRef> {
        let mut admitted = Vec::new();
        for tags in candidates {
            if self.is_full() {
                break;
            }
            if self.titles.insert(tags.title.clone()) {
                admitted.push(Track::new(tags));
            }
        }
        admitted
    }

    fn is_full(&self) -> bool {
        self.titles.len() >= self.limit
    }
}

impl LastFmBackend {
    pub fn new(
        api_key: impl Into<String>,
        track_limit: usize,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(read_timeout)
            .timeout_write(read_timeout)
            .build();
        let per_second = NonZeroU32::new(REQUESTS_PER_SECOND).unwrap_or(NonZeroU32::MIN);
        Self {
            api_key: api_key.into(),
            track_limit: track_limit.max(1),
            http_client,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
        }
    }

    fn wait_for_slot(&self) {
        while let Err(not_until) = self.limiter.check() {
            thread::sleep(not_until.wait_time_from(DefaultClock::default().now()));
        }
    }

    fn request(&self, method: &str, params: &[(&str, &str)]) -> Result<Value, String> {
        let mut url = format!(
            "{API_ROOT}?method={method}&api_key={}&format=json",
            urlencoding::encode(&self.api_key)
        );
        for (key, value) in params {
            url.push_str(&format!("&{key}={}", urlencoding::encode(value)));
        }
        self.wait_for_slot();
        trace!("LastFmBackend: {}", method);
        let response = self
            .http_client
            .get(&url)
            .call()
            .map_err(|err| format!("Last.fm request failed ({method}): {err}"))?;
        let parsed: Value = response
            .into_json()
            .map_err(|err| format!("Last.fm response parse failed ({method}): {err}"))?;
        if let Some(message) = parsed.get("message").and_then(Value::as_str) {
            if parsed.get("error").is_some() {
                return Err(message.to_string());
            }
        }
        Ok(parsed)
    }

    fn search_similar(
        &self,
        artist: &str,
        track: &str,
        sink: &mut dyn FnMut(Vec<TrackRef>),
    ) -> Result<(), String> {
        let limit = self.track_limit.to_string();
        let response = self.request(
            "track.getsimilar",
            &[("artist", artist), ("track", track), ("limit", &limit)],
        )?;
        let mut seen = SeenTitles {
            titles: HashSet::new(),
            limit: self.track_limit,
        };
        sink(seen.admit(similar_track_tags(&response)));
        Ok(())
    }

    fn search_term(&self, term: &str, sink: &mut dyn FnMut(Vec<TrackRef>)) -> Result<(), String> {
        let mut seen = SeenTitles {
            titles: HashSet::new(),
            limit: self.track_limit,
        };
        let mut searched_artists = HashSet::new();
        for page in 1..=MAX_ALBUM_PAGES {
            let page_number = page.to_string();
            let response = self.request("album.search", &[("album", term), ("page", &page_number)])?;
            let Some(albums) = album_matches(&response) else {
                return Ok(());
            };
            if albums.is_empty() {
                break;
            }
            for (artist, album) in albums {
                // Per-album failures only lose that album.
                match self.request("album.getinfo", &[("artist", &artist), ("album", &album)]) {
                    Ok(info) => sink(seen.admit(album_track_tags(&info))),
                    Err(err) => debug!("LastFmBackend: skipping album {:?}: {}", album, err),
                }
                if seen.is_full() {
                    return Ok(());
                }
                if searched_artists.insert(artist.clone()) {
                    match self.request("artist.gettoptracks", &[("artist", &artist)]) {
                        Ok(top) => sink(seen.admit(top_track_tags(&top))),
                        Err(err) => debug!("LastFmBackend: skipping artist {:?}: {}", artist, err),
                    }
                }
                if seen.is_full() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

impl SearchBackend for LastFmBackend {
    fn search(
        &self,
        query: &SearchQuery,
        sink: &mut dyn FnMut(Vec<TrackRef>),
    ) -> Result<(), String> {
        match query {
            SearchQuery::Similar { artist, track } => self.search_similar(artist, track, sink),
            SearchQuery::Tracks(term) => self.search_term(term, sink),
            SearchQuery::Videos(_) => Err(format!("{query:?} is not a catalog search")),
        }
    }
}
