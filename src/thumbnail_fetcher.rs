use std::io::Read;
use std::time::Duration;

/// Upper bound on a single thumbnail download.
const MAX_THUMBNAIL_BYTES: u64 = 8 * 1024 * 1024;

/// Downloads the raw bytes behind a thumbnail URL.
pub trait ThumbnailFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, String>;
}

/// Thumbnail fetcher backed by `ureq`.
pub struct HttpThumbnailFetcher {
    http_client: ureq::Agent,
}

impl HttpThumbnailFetcher {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(read_timeout)
            .timeout_write(read_timeout)
            .build();
        Self { http_client }
    }
}

impl ThumbnailFetcher for HttpThumbnailFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self
            .http_client
            .get(url)
            .call()
            .map_err(|err| format!("Thumbnail request failed: {err}"))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_THUMBNAIL_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|err| format!("Thumbnail read failed: {err}"))?;
        if bytes.is_empty() {
            return Err("Thumbnail response was empty".to_string());
        }
        Ok(bytes)
    }
}
