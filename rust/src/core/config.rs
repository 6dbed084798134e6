use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::connectivity::DEFAULT_PROBE_URL;
use crate::messages::DEFAULT_CONTENT_MATCH_WINDOW_MS;
use crate::notifications::{
    DEFAULT_BANNER_ADVANCE_MS, DEFAULT_DEBOUNCE_MS, DEFAULT_PROCESSED_IDS_TTL_MS,
};
use crate::presence::{DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_PRESENCE_STALE_MS};
use crate::typing::DEFAULT_TYPING_TIMEOUT_MS;

const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_CONNECTIVITY_POLL_MS: u64 = 1_500;
const DEFAULT_RECONNECT_SETTLE_MS: u64 = 3_000;

/// Contents of `courier_config.json`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(super) struct AppConfig {
    pub(super) probe_url: Option<String>,
    pub(super) probe_timeout_ms: Option<u64>,
    pub(super) connectivity_poll_ms: Option<u64>,
    pub(super) reconnect_settle_ms: Option<u64>,
    pub(super) heartbeat_interval_ms: Option<u64>,
    pub(super) presence_stale_ms: Option<u64>,
    pub(super) typing_timeout_ms: Option<u64>,
    pub(super) notification_debounce_ms: Option<u64>,
    pub(super) processed_ids_ttl_ms: Option<u64>,
    pub(super) banner_advance_ms: Option<u64>,
    pub(super) content_match_window_ms: Option<u64>,
}

pub(super) fn load_app_config(data_dir: &str) -> AppConfig {
    let path = Path::new(data_dir).join("courier_config.json");
    let Ok(bytes) = std::fs::read(&path) else {
        return AppConfig::default();
    };
    match serde_json::from_slice::<AppConfig>(&bytes) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(%e, path = %path.display(), "ignoring unreadable config");
            AppConfig::default()
        }
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v.max(1))
}

impl AppConfig {
    pub(super) fn probe_url(&self) -> &str {
        self.probe_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_PROBE_URL)
    }

    pub(super) fn probe_timeout(&self) -> Duration {
        ms(self.probe_timeout_ms.unwrap_or(DEFAULT_PROBE_TIMEOUT_MS))
    }

    pub(super) fn connectivity_poll(&self) -> Duration {
        ms(self.connectivity_poll_ms.unwrap_or(DEFAULT_CONNECTIVITY_POLL_MS))
    }

    pub(super) fn reconnect_settle(&self) -> Duration {
        ms(self.reconnect_settle_ms.unwrap_or(DEFAULT_RECONNECT_SETTLE_MS))
    }

    pub(super) fn heartbeat_interval(&self) -> Duration {
        ms(self
            .heartbeat_interval_ms
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS as u64))
    }

    pub(super) fn presence_stale_ms(&self) -> i64 {
        self.presence_stale_ms
            .map_or(DEFAULT_PRESENCE_STALE_MS, |v| v as i64)
    }

    pub(super) fn typing_timeout_ms(&self) -> i64 {
        self.typing_timeout_ms
            .map_or(DEFAULT_TYPING_TIMEOUT_MS, |v| v as i64)
    }

    /// Five housekeeping ticks per typing timeout, so an expired record lingers at most a fifth
    /// of the timeout.
    pub(super) fn housekeeping_interval(&self) -> Duration {
        ms(self.typing_timeout_ms().max(0) as u64 / 5)
    }

    pub(super) fn notification_debounce(&self) -> Duration {
        ms(self.notification_debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS))
    }

    pub(super) fn processed_ids_ttl_ms(&self) -> i64 {
        self.processed_ids_ttl_ms
            .map_or(DEFAULT_PROCESSED_IDS_TTL_MS, |v| v as i64)
    }

    pub(super) fn banner_advance(&self) -> Duration {
        ms(self.banner_advance_ms.unwrap_or(DEFAULT_BANNER_ADVANCE_MS))
    }

    pub(super) fn content_match_window_ms(&self) -> i64 {
        self.content_match_window_ms
            .map_or(DEFAULT_CONTENT_MATCH_WINDOW_MS, |v| v as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_app_config(dir.path().to_str().unwrap());
        assert_eq!(config.probe_url(), DEFAULT_PROBE_URL);
        assert_eq!(config.reconnect_settle(), Duration::from_secs(3));
        assert_eq!(config.connectivity_poll(), Duration::from_millis(1_500));
        assert_eq!(config.typing_timeout_ms(), 5_000);
        assert_eq!(config.presence_stale_ms(), 15_000);
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("courier_config.json"),
            r#"{"reconnect_settle_ms": 50, "probe_url": "  "}"#,
        )
        .unwrap();
        let config = load_app_config(dir.path().to_str().unwrap());
        assert_eq!(config.reconnect_settle(), Duration::from_millis(50));
        assert_eq!(config.probe_url(), DEFAULT_PROBE_URL);
        assert_eq!(config.notification_debounce(), Duration::from_millis(300));
    }

    #[test]
    fn garbage_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("courier_config.json"), b"{not json").unwrap();
        let config = load_app_config(dir.path().to_str().unwrap());
        assert_eq!(config.banner_advance(), Duration::from_millis(500));
    }

    #[test]
    fn housekeeping_ticks_five_times_per_typing_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_app_config(dir.path().to_str().unwrap());
        assert_eq!(config.housekeeping_interval(), Duration::from_millis(1_000));

        std::fs::write(
            dir.path().join("courier_config.json"),
            r#"{"typing_timeout_ms": 3}"#,
        )
        .unwrap();
        let config = load_app_config(dir.path().to_str().unwrap());
        assert_eq!(config.housekeeping_interval(), Duration::from_millis(1));
    }
}
