//! Video search through the `yt-dlp` command line.

use std::time::Duration;

use log::debug;
use serde_json::Value;

use crate::{
    backends::string_field,
    metadata_resolver::run_with_timeout,
    search::{SearchBackend, SearchQuery},
    track::{Track, TrackRef, TrackTags},
};

pub struct YtDlpSearch {
    command: String,
    timeout: Duration,
    result_limit: usize,
}

impl YtDlpSearch {
    pub fn new(command: impl Into<String>, timeout: Duration, result_limit: usize) -> Self {
        Self {
            command: command.into(),
            timeout,
            result_limit: result_limit.max(1),
        }
    }

    fn arguments(&self, term: &str) -> Vec<String> {
        vec![
            "-j".to_string(),
            "--".to_string(),
            format!("ytsearch{}:{}", self.result_limit, term),
        ]
    }
}

/// Builds a track from one line of `-j` output. Lines lacking an id or a
/// title are skipped.
pub fn parse_result_line(line: &str) -> Option<TrackTags> {
    let record: Value = serde_json::from_str(line).ok()?;
    let video_id = string_field(&record, "id")?;
    let title = string_field(&record, "fulltitle").or_else(|| string_field(&record, "title"))?;
    let mut tags = TrackTags::with_title(title);
    tags.video_id = Some(video_id);
    tags.channel = string_field(&record, "uploader").or_else(|| string_field(&record, "channel"));
    tags.duration = record
        .get("duration")
        .and_then(Value::as_f64)
        .filter(|seconds| *seconds >= 0.0)
        .map(|seconds| seconds as u64);
    Some(tags)
}

impl SearchBackend for YtDlpSearch {
    fn search(
        &self,
        query: &SearchQuery,
        sink: &mut dyn FnMut(Vec<TrackRef>),
    ) -> Result<(), String> {
        let SearchQuery::Videos(term) = query else {
            return Err(format!("{query:?} is not a video search"));
        };
        let output = run_with_timeout(&self.command, &self.arguments(term), self.timeout)
            .map_err(|err| err.to_string())?;
        let tracks: Vec<TrackRef> = output
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(parse_result_line)
            .map(Track::new)
            .collect();
        debug!("YtDlpSearch: {} results for {:?}", tracks.len(), term);

        let diagnostics = output.stderr.trim();
        if tracks.is_empty() && !diagnostics.is_empty() {
            return Err(diagnostics.to_string());
        }
        sink(tracks);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_line() {
        let tags = parse_result_line(
            r#"{"id": "abc", "fulltitle": "Full", "title": "Short", "uploader": "Up", "duration": 61.5}"#,
        )
        .expect("tags");
        assert_eq!(tags.title, "Full");
        assert_eq!(tags.video_id.as_deref(), Some("abc"));
        assert_eq!(tags.channel.as_deref(), Some("Up"));
        assert_eq!(tags.duration, Some(61));

        let tags = parse_result_line(r#"{"id": "abc", "title": "Short", "channel": "Ch"}"#)
            .expect("tags");
        assert_eq!(tags.title, "Short");
        assert_eq!(tags.channel.as_deref(), Some("Ch"));
        assert_eq!(tags.duration, None);
    }

    #[test]
    fn test_parse_result_line_skips_incomplete_records() {
        assert!(parse_result_line(r#"{"title": "no id"}"#).is_none());
        assert!(parse_result_line(r#"{"id": "no title"}"#).is_none());
        assert!(parse_result_line("WARNING: not json").is_none());
    }

    #[test]
    fn test_search_term_is_passed_after_separator() {
        let search = YtDlpSearch::new("yt-dlp", Duration::from_secs(1), 5);
        assert_eq!(
            search.arguments("-rf"),
            vec!["-j".to_string(), "--".to_string(), "ytsearch5:-rf".to_string()]
        );
    }

    #[test]
    fn test_non_video_query_is_rejected() {
        let search = YtDlpSearch::new("yt-dlp", Duration::from_secs(1), 5);
        let mut batches = 0;
        let result = search.search(&SearchQuery::Tracks("x".to_string()), &mut |_| batches += 1);
        assert!(result.is_err());
        assert_eq!(batches, 0);
    }
}
