//! Authoritative metadata lookup for a single video.

use std::{
    io::Read,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};
use serde::Deserialize;

/// How a track is looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveQuery {
    CanonicalId(String),
    /// Free-text search; the best match wins.
    Title(String),
}

/// One thumbnail offered by the resolver. Missing dimensions rank lowest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ThumbnailCandidate {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl ThumbnailCandidate {
    pub fn area(&self) -> u64 {
        match (self.width, self.height) {
            (Some(width), Some(height)) => u64::from(width) * u64::from(height),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMetadata {
    pub video_id: String,
    pub title: Option<String>,
    pub duration: Option<u64>,
    pub uploader: Option<String>,
    pub thumbnails: Vec<ThumbnailCandidate>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("Could not run {command}: {reason}")]
    Unavailable { command: String, reason: String },
    #[error("{command} did not answer within {seconds} seconds")]
    TimedOut { command: String, seconds: u64 },
    /// The resolver's own diagnostic output.
    #[error("{0}")]
    Resolver(String),
    #[error("No results found.")]
    NoResults,
}

/// Resolves a query to metadata. Implementations block the calling worker.
pub trait MetadataResolver: Send + Sync {
    fn resolve(&self, query: &ResolveQuery) -> Result<ResolvedMetadata, ResolveError>;
}

#[derive(Deserialize)]
struct YtDlpRecord {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    thumbnails: Vec<ThumbnailCandidate>,
}

impl From<YtDlpRecord> for ResolvedMetadata {
    fn from(record: YtDlpRecord) -> Self {
        Self {
            video_id: record.id,
            title: record.title,
            duration: record
                .duration
                .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
                .map(|seconds| seconds as u64),
            uploader: record.uploader.or(record.channel),
            thumbnails: record.thumbnails,
        }
    }
}

/// Output of a finished subprocess.
#[derive(Debug, Clone, Default)]
pub(crate) struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut bytes);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

/// Runs `program args...`, killing it when `timeout` elapses. Both pipes are
/// drained on helper threads so a chatty child cannot block on a full pipe.
pub(crate) fn run_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<CommandOutput, ResolveError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| ResolveError::Unavailable {
            command: program.to_string(),
            reason: err.to_string(),
        })?;
    let stdout = drain_pipe(child.stdout.take());
    let stderr = drain_pipe(child.stderr.take());

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_status)) => break,
            Ok(None) if Instant::now() >= deadline => {
                warn!("{} exceeded {:?}, killing it", program, timeout);
                let _ = child.kill();
                let _ = child.wait();
                return Err(ResolveError::TimedOut {
                    command: program.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
            Ok(None) => thread::sleep(Duration::from_millis(20)),
            Err(err) => {
                let _ = child.kill();
                return Err(ResolveError::Unavailable {
                    command: program.to_string(),
                    reason: err.to_string(),
                });
            }
        }
    }

    Ok(CommandOutput {
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

/// Interprets one `-j` dump. Unparsable output is reported with the
/// resolver's diagnostics when it printed any, else as "no results".
pub(crate) fn parse_dump(output: &CommandOutput) -> Result<ResolvedMetadata, ResolveError> {
    let first_line = output.stdout.lines().find(|line| !line.trim().is_empty());
    match first_line.map(serde_json::from_str::<YtDlpRecord>) {
        Some(Ok(record)) => Ok(record.into()),
        parse_failure => {
            if let Some(Err(err)) = parse_failure {
                debug!("Unparsable resolver output: {}", err);
            }
            let diagnostics = output.stderr.trim();
            if diagnostics.is_empty() {
                Err(ResolveError::NoResults)
            } else {
                Err(ResolveError::Resolver(diagnostics.to_string()))
            }
        }
    }
}

/// Runs `yt-dlp -j` (or a compatible command) per lookup.
pub struct YtDlpResolver {
    command: String,
    timeout: Duration,
}

impl YtDlpResolver {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    fn arguments(query: &ResolveQuery) -> Vec<String> {
        let target = match query {
            ResolveQuery::CanonicalId(id) => id.clone(),
            ResolveQuery::Title(title) => format!("ytsearch1:{title}"),
        };
        vec![
            "-j".to_string(),
            "--no-playlist".to_string(),
            "--".to_string(),
            target,
        ]
    }
}

impl MetadataResolver for YtDlpResolver {
    fn resolve(&self, query: &ResolveQuery) -> Result<ResolvedMetadata, ResolveError> {
        debug!("YtDlpResolver: resolving {:?}", query);
        let output = run_with_timeout(&self.command, &Self::arguments(query), self.timeout)?;
        parse_dump(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_parse_dump_reads_record() {
        let dump = r#"{"id": "dQw4w9WgXcQ", "title": "Song", "duration": 212.0, "uploader": "Chan",
            "thumbnails": [{"url": "http://a/small.jpg", "width": 120, "height": 90}, {"url": "http://a/raw.jpg"}]}"#;
        let metadata = parse_dump(&output(&dump.replace('\n', " "), "")).expect("parsed");
        assert_eq!(metadata.video_id, "dQw4w9WgXcQ");
        assert_eq!(metadata.duration, Some(212));
        assert_eq!(metadata.uploader.as_deref(), Some("Chan"));
        assert_eq!(metadata.thumbnails.len(), 2);
        assert_eq!(metadata.thumbnails[0].area(), 120 * 90);
        assert_eq!(metadata.thumbnails[1].area(), 0);
    }

    #[test]
    fn test_uploader_falls_back_to_channel() {
        let metadata = parse_dump(&output(r#"{"id": "x", "channel": "Fallback"}"#, ""))
            .expect("parsed");
        assert_eq!(metadata.uploader.as_deref(), Some("Fallback"));
        assert_eq!(metadata.duration, None);
    }

    #[test]
    fn test_parse_failure_prefers_resolver_diagnostics() {
        assert_eq!(
            parse_dump(&output("", "ERROR: Video unavailable\n")),
            Err(ResolveError::Resolver("ERROR: Video unavailable".to_string()))
        );
        assert_eq!(parse_dump(&output("not json", "  ")), Err(ResolveError::NoResults));
        assert_eq!(parse_dump(&output("", "")), Err(ResolveError::NoResults));
    }

    #[test]
    fn test_title_query_uses_search_prefix() {
        let args = YtDlpResolver::arguments(&ResolveQuery::Title("a b".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("ytsearch1:a b"));
        let args = YtDlpResolver::arguments(&ResolveQuery::CanonicalId("-x".to_string()));
        assert_eq!(args[args.len() - 2], "--");
    }

    #[test]
    fn test_missing_command_is_unavailable() {
        let resolver = YtDlpResolver::new("tubejuke-no-such-binary", Duration::from_secs(1));
        assert!(matches!(
            resolver.resolve(&ResolveQuery::CanonicalId("x".to_string())),
            Err(ResolveError::Unavailable { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_timeout_collects_output_and_kills_slow_children() {
        let output = run_with_timeout(
            "sh",
            &["-c".to_string(), "echo out; echo err >&2".to_string()],
            Duration::from_secs(5),
        )
        .expect("ran");
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");

        let started = Instant::now();
        let result = run_with_timeout(
            "sh",
            &["-c".to_string(), "sleep 5".to_string()],
            Duration::from_millis(100),
        );
        assert!(matches!(result, Err(ResolveError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
