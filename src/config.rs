// src/config.rs

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Process-wide engine settings.
///
/// Read once when the [`DownloadManager`](crate::manager::DownloadManager) is
/// built and handed down to every component that needs a value from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How many downloads may be in `Downloading` at once.
    pub max_concurrent: usize,
    /// Segment count used when a download does not ask for one.
    pub default_segments: usize,
    /// Segments smaller than this are merged away; a file below it gets a
    /// single segment.
    pub min_segment_size: u64,
    /// Global bandwidth cap in bytes per second. 0 means unlimited.
    pub speed_limit: u64,
    pub retry: RetryPolicy,
    /// Re-queue transient whole-download failures automatically.
    pub auto_retry: bool,
    /// Where per-segment temp files live.
    pub scratch_dir: PathBuf,
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Longest silence tolerated between two body chunks.
    pub read_timeout: Duration,
    /// Fetchers report progress at least this often...
    pub progress_interval: Duration,
    /// ...or after this many new bytes, whichever comes first.
    pub progress_bytes: u64,
    /// Rolling window used for speed smoothing.
    pub speed_window: Duration,
    /// Progress is persisted each time it advances by this many percentage points.
    pub persist_step_percent: f64,
    /// Buffer size of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            default_segments: 8,
            min_segment_size: 1024 * 1024,
            speed_limit: 0,
            retry: RetryPolicy::default(),
            auto_retry: true,
            scratch_dir: std::env::temp_dir().join("odm-scratch"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            progress_interval: Duration::from_millis(250),
            progress_bytes: 64 * 1024,
            speed_window: Duration::from_secs(3),
            persist_step_percent: 5.0,
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_speed_limit(mut self, bytes_per_sec: u64) -> Self {
        self.speed_limit = bytes_per_sec;
        self
    }

    /// Builds the shared HTTP client used for probing and fetching.
    pub fn http_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .connect_timeout(self.connect_timeout)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_expectations() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.default_segments, 8);
        assert_eq!(config.speed_window, Duration::from_secs(3));
        assert_eq!(config.progress_bytes, 64 * 1024);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_concurrent": 7, "speed_limit": 1024}"#).unwrap();
        assert_eq!(config.max_concurrent, 7);
        assert_eq!(config.speed_limit, 1024);
        assert_eq!(config.default_segments, 8);
    }

    #[test]
    fn max_concurrent_never_drops_to_zero() {
        let config = EngineConfig::default().with_max_concurrent(0);
        assert_eq!(config.max_concurrent, 1);
    }
}
