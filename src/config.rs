//! Persistent application configuration model and defaults.

use std::path::{Path, PathBuf};

use log::{info, warn};

const APP_DIR_NAME: &str = "tubejuke";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Where playlists, the active track and thumbnails are stored.
    pub storage: StorageConfig,
    #[serde(default)]
    /// Background worker limits.
    pub workers: WorkerConfig,
    #[serde(default)]
    /// External call timeouts and resolver command.
    pub network: NetworkConfig,
    #[serde(default)]
    /// Search provider settings and credentials.
    pub search: SearchConfig,
    #[serde(default)]
    /// Playback session behavior.
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StorageConfig {
    /// Overrides the default `<config dir>/tubejuke` state directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_autosave_interval_ms")]
    pub autosave_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct WorkerConfig {
    /// Upper bound on concurrently running background jobs.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NetworkConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Resolver subprocesses running longer than this are killed.
    #[serde(default = "default_resolver_timeout_secs")]
    pub resolver_timeout_secs: u64,
    #[serde(default = "default_resolver_command")]
    pub resolver_command: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SearchConfig {
    /// Last.fm API key. Empty disables Last.fm searches.
    #[serde(default)]
    pub lastfm_api_key: String,
    #[serde(default = "default_lastfm_track_limit")]
    pub lastfm_track_limit: usize,
    #[serde(default = "default_video_result_limit")]
    pub video_result_limit: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlaybackConfig {
    /// Saved positions below this start the track from the beginning.
    #[serde(default = "default_resume_threshold_secs")]
    pub resume_threshold_secs: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            autosave_interval_ms: default_autosave_interval_ms(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            resolver_timeout_secs: default_resolver_timeout_secs(),
            resolver_command: default_resolver_command(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            lastfm_api_key: String::new(),
            lastfm_track_limit: default_lastfm_track_limit(),
            video_result_limit: default_video_result_limit(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            resume_threshold_secs: default_resume_threshold_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_autosave_interval_ms() -> u64 {
    1000
}

fn default_max_concurrent_jobs() -> usize {
    8
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_read_timeout_secs() -> u64 {
    7
}

fn default_resolver_timeout_secs() -> u64 {
    45
}

fn default_resolver_command() -> String {
    "yt-dlp".to_string()
}

fn default_lastfm_track_limit() -> usize {
    350
}

fn default_video_result_limit() -> usize {
    10
}

fn default_resume_threshold_secs() -> u64 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Error raised while creating or reading `config.toml`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no configuration directory is available on this system")]
    NoConfigDir,
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize default config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// `<config dir>/tubejuke`.
pub fn app_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|path| path.join(APP_DIR_NAME))
        .ok_or(ConfigError::NoConfigDir)
}

pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(app_config_dir()?.join(CONFIG_FILE_NAME))
}

impl Config {
    /// Directory holding `playlists.json`, `currentTrack.json` and thumbnails.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.data_dir {
            Some(path) if !path.as_os_str().is_empty() => Ok(path.clone()),
            _ => app_config_dir(),
        }
    }

    /// Configured level, capped at the `debug` filter the logger is built with.
    pub fn log_level(&self) -> log::LevelFilter {
        self.logging
            .level
            .parse::<log::LevelFilter>()
            .unwrap_or(log::LevelFilter::Info)
            .min(log::LevelFilter::Debug)
    }
}

/// Clamps values that would stall or disable core behavior.
pub fn sanitize_config(config: Config) -> Config {
    let mut config = config;
    config.storage.autosave_interval_ms = config.storage.autosave_interval_ms.clamp(100, 60_000);
    config.workers.max_concurrent_jobs = config.workers.max_concurrent_jobs.clamp(1, 64);
    config.network.connect_timeout_secs = config.network.connect_timeout_secs.max(1);
    config.network.read_timeout_secs = config.network.read_timeout_secs.max(1);
    config.network.resolver_timeout_secs = config.network.resolver_timeout_secs.max(1);
    if config.network.resolver_command.trim().is_empty() {
        config.network.resolver_command = default_resolver_command();
    }
    config.search.lastfm_api_key = config.search.lastfm_api_key.trim().to_string();
    config.search.video_result_limit = config.search.video_result_limit.clamp(1, 50);
    config
}

/// Reads `path`, writing a default config there first when it is missing.
/// An unparsable file falls back to defaults rather than blocking startup.
pub fn load_or_create(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        let default_config = Config::default();
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, toml::to_string(&default_config)?).map_err(|source| {
            ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?;
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = match toml::from_str::<Config>(&content) {
        Ok(config) => config,
        Err(error) => {
            warn!(
                "Ignoring unreadable config file {}: {}",
                path.display(),
                error
            );
            Config::default()
        }
    };
    Ok(sanitize_config(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [search]
            lastfm_api_key = "  key  "
            "#,
        )
        .expect("config should parse");
        let config = sanitize_config(config);
        assert_eq!(config.search.lastfm_api_key, "key");
        assert_eq!(config.workers.max_concurrent_jobs, 8);
        assert_eq!(config.storage.autosave_interval_ms, 1000);
        assert_eq!(config.playback.resume_threshold_secs, 3);
    }

    #[test]
    fn test_sanitize_clamps_zero_limits() {
        let mut config = Config::default();
        config.workers.max_concurrent_jobs = 0;
        config.storage.autosave_interval_ms = 0;
        config.network.resolver_command = "   ".to_string();
        let config = sanitize_config(config);
        assert_eq!(config.workers.max_concurrent_jobs, 1);
        assert_eq!(config.storage.autosave_interval_ms, 100);
        assert_eq!(config.network.resolver_command, "yt-dlp");
    }

    #[test]
    fn test_load_or_create_writes_defaults_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let created = load_or_create(&path).expect("create config");
        assert!(path.exists());
        assert_eq!(created, Config::default());

        std::fs::write(&path, "[workers]\nmax_concurrent_jobs = 3\n").expect("write config");
        let loaded = load_or_create(&path).expect("load config");
        assert_eq!(loaded.workers.max_concurrent_jobs, 3);
    }

    #[test]
    fn test_unreadable_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "this is = = not toml").expect("write config");
        assert_eq!(load_or_create(&path).expect("load"), Config::default());
    }

    #[test]
    fn test_data_dir_override() {
        let mut config = Config::default();
        config.storage.data_dir = Some(PathBuf::from("/tmp/tubejuke-state"));
        assert_eq!(
            config.data_dir().expect("data dir"),
            PathBuf::from("/tmp/tubejuke-state")
        );
    }

    #[test]
    fn test_log_level_parses_and_caps_at_debug() {
        let mut config = Config::default();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
        config.logging.level = "warn".to_string();
        assert_eq!(config.log_level(), log::LevelFilter::Warn);
        config.logging.level = "trace".to_string();
        assert_eq!(config.log_level(), log::LevelFilter::Debug);
        config.logging.level = "loud".to_string();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }
}
