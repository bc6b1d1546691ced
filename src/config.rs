//! Runtime configuration: backend endpoint and credential, data directory,
//! scheduling constants and cache TTLs.
//!
//! Values come from the environment first and fall back to the OS
//! credential store for the endpoint and key.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::error::ConfigError;
use crate::storage;

/// Full sync while online.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Wait after an offline -> online transition before syncing.
pub const RECONNECT_DEBOUNCE: Duration = Duration::from_secs(2);
/// Upper bound for any single remote call.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(8);
/// Health probe cadence for the connectivity monitor.
pub const CONNECTIVITY_PROBE_INTERVAL: Duration = Duration::from_secs(15);
/// Phoenix channel heartbeat.
pub const REALTIME_HEARTBEAT: Duration = Duration::from_secs(30);
pub const REALTIME_BACKOFF_MIN: Duration = Duration::from_secs(1);
pub const REALTIME_BACKOFF_MAX: Duration = Duration::from_secs(30);

const ENV_REMOTE_URL: &str = "POS_REMOTE_URL";
const ENV_API_KEY: &str = "POS_API_KEY";
const ENV_CONNECTION_STRING: &str = "POS_CONNECTION_STRING";
const ENV_DATA_DIR: &str = "POS_DATA_DIR";
const ENV_REALTIME_URL: &str = "POS_REALTIME_URL";
const ENV_SYNC_INTERVAL: &str = "POS_SYNC_INTERVAL_SECS";
const ENV_REMOTE_TIMEOUT: &str = "POS_REMOTE_TIMEOUT_SECS";

/// Cache TTLs by key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub menu_items: Duration,
    pub inventory: Duration,
    pub orders: Duration,
    pub profile: Duration,
    pub closings: Duration,
    pub default: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            menu_items: Duration::from_secs(30 * 60),
            inventory: Duration::from_secs(5 * 60),
            orders: Duration::from_secs(2 * 60),
            profile: Duration::from_secs(24 * 60 * 60),
            closings: Duration::from_secs(60 * 60),
            default: Duration::from_secs(10 * 60),
        }
    }
}

impl CacheTtls {
    pub fn for_key(&self, key: &str) -> Duration {
        if key.starts_with("menuItems") {
            self.menu_items
        } else if key.starts_with("inventory") {
            self.inventory
        } else if key.starts_with("orders") {
            self.orders
        } else if key.starts_with("profile") {
            self.profile
        } else if key.starts_with("closings") {
            self.closings
        } else {
            self.default
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub remote_url: String,
    pub api_key: Zeroizing<String>,
    pub realtime_url: String,
    pub data_dir: PathBuf,
    pub sync_interval: Duration,
    pub reconnect_debounce: Duration,
    pub remote_timeout: Duration,
    pub probe_interval: Duration,
    pub cache_ttls: CacheTtls,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("remote_url", &self.remote_url)
            .field("api_key", &"<redacted>")
            .field("realtime_url", &self.realtime_url)
            .field("data_dir", &self.data_dir)
            .field("sync_interval", &self.sync_interval)
            .field("remote_timeout", &self.remote_timeout)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn new(remote_url: &str, api_key: &str, data_dir: PathBuf) -> Self {
        let remote_url = normalize_remote_url(remote_url);
        Self {
            realtime_url: realtime_url_for(&remote_url),
            remote_url,
            api_key: Zeroizing::new(api_key.trim().to_string()),
            data_dir,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            reconnect_debounce: RECONNECT_DEBOUNCE,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            probe_interval: CONNECTIVITY_PROBE_INTERVAL,
            cache_ttls: CacheTtls::default(),
        }
    }

    /// Build from the environment, falling back to the credential store.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let connection = env(ENV_CONNECTION_STRING).and_then(|raw| decode_connection_string(&raw));

        let remote_url = env(ENV_REMOTE_URL)
            .or_else(|| connection.as_ref().map(|c| c.0.clone()))
            .or_else(|| storage::get_credential(storage::KEY_REMOTE_URL).map(|v| v.to_string()))
            .ok_or(ConfigError::Missing(ENV_REMOTE_URL))?;
        let api_key = env(ENV_API_KEY)
            .map(Zeroizing::new)
            .or_else(|| connection.as_ref().map(|c| c.1.clone()))
            .or_else(|| storage::get_credential(storage::KEY_API_KEY))
            .ok_or(ConfigError::Missing(ENV_API_KEY))?;

        let data_dir = env(ENV_DATA_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let mut config = Config::new(&remote_url, &api_key, data_dir);

        if let Some(url) = env(ENV_REALTIME_URL)
            .or_else(|| storage::get_credential(storage::KEY_REALTIME_URL).map(|v| v.to_string()))
        {
            config.realtime_url = url;
        }
        if let Some(secs) = env(ENV_SYNC_INTERVAL) {
            config.sync_interval = parse_secs(ENV_SYNC_INTERVAL, &secs)?;
        }
        if let Some(secs) = env(ENV_REMOTE_TIMEOUT) {
            config.remote_timeout = parse_secs(ENV_REMOTE_TIMEOUT, &secs)?;
        }

        Ok(config)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn parse_secs(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    match raw.parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            key,
            reason: "must be greater than zero".into(),
        }),
        Ok(n) => Ok(Duration::from_secs(n)),
        Err(e) => Err(ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".restaurant-pos")
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` or `/rest/v1` segment
pub fn normalize_remote_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    for suffix in ["/rest/v1", "/api"] {
        if url.ends_with(suffix) {
            url.truncate(url.len() - suffix.len());
        }
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Websocket endpoint of the change feed served next to the REST API.
pub fn realtime_url_for(remote_url: &str) -> String {
    let ws = if let Some(rest) = remote_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = remote_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        remote_url.to_string()
    };
    format!("{ws}/realtime/v1/websocket")
}

/// Decode a connection string carrying `{"url": ..., "key": ...}` either as
/// plain JSON or (url-safe) base64 of it.
pub fn decode_connection_string(raw: &str) -> Option<(String, Zeroizing<String>)> {
    let compact: String = raw.trim().chars().filter(|c| !c.is_whitespace()).collect();
    let payload: Value = if compact.starts_with('{') {
        serde_json::from_str(&compact).ok()?
    } else {
        if compact.len() < 20 {
            return None;
        }
        let base64 = compact.replace('-', "+").replace('_', "/");
        let padded = format!(
            "{}{}",
            base64,
            "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
        );
        let decoded = Zeroizing::new(BASE64_STANDARD.decode(padded).ok()?);
        serde_json::from_slice(&decoded).ok()?
    };

    let url = payload
        .get("url")
        .and_then(Value::as_str)
        .map(normalize_remote_url)
        .filter(|s| !s.is_empty())?;
    let key = payload
        .get("key")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())?;
    Some((url, Zeroizing::new(key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_normalize_remote_url() {
        assert_eq!(normalize_remote_url("pos.example.com/"), "https://pos.example.com");
        assert_eq!(normalize_remote_url("localhost:54321/rest/v1/"), "http://localhost:54321");
        assert_eq!(normalize_remote_url(" https://x.supabase.co/api "), "https://x.supabase.co");
    }

    #[test]
    fn test_realtime_url_follows_scheme() {
        assert_eq!(
            realtime_url_for("https://x.supabase.co"),
            "wss://x.supabase.co/realtime/v1/websocket"
        );
        assert_eq!(
            realtime_url_for("http://localhost:54321"),
            "ws://localhost:54321/realtime/v1/websocket"
        );
    }

    #[test]
    fn test_decode_connection_string_plain_and_base64() {
        let json = r#"{"url":"pos.example.com","key":"anon-key-123"}"#;
        let (url, key) = decode_connection_string(json).unwrap();
        assert_eq!(url, "https://pos.example.com");
        assert_eq!(key.as_str(), "anon-key-123");

        let encoded = BASE64_STANDARD.encode(json).trim_end_matches('=').to_string();
        let (url, key) = decode_connection_string(&encoded).unwrap();
        assert_eq!(url, "https://pos.example.com");
        assert_eq!(key.as_str(), "anon-key-123");

        assert!(decode_connection_string("short").is_none());
    }

    #[test]
    fn test_ttl_prefix_table() {
        let ttls = CacheTtls::default();
        assert_eq!(ttls.for_key("menuItems:available"), ttls.menu_items);
        assert_eq!(ttls.for_key("inventory"), ttls.inventory);
        assert_eq!(ttls.for_key("profile:business"), ttls.profile);
        assert_eq!(ttls.for_key("closings:recent"), ttls.closings);
        assert_eq!(ttls.for_key("something-else"), ttls.default);
    }

    #[test]
    #[serial]
    fn test_from_env_reads_overrides() {
        std::env::set_var(ENV_REMOTE_URL, "pos.example.com");
        std::env::set_var(ENV_API_KEY, "secret");
        std::env::set_var(ENV_DATA_DIR, "/tmp/pos-config-test");
        std::env::set_var(ENV_SYNC_INTERVAL, "60");

        let config = Config::from_env().unwrap();
        assert_eq!(config.remote_url, "https://pos.example.com");
        assert_eq!(config.api_key.as_str(), "secret");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/pos-config-test"));
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert!(!format!("{config:?}").contains("secret"));

        std::env::set_var(ENV_SYNC_INTERVAL, "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { .. })
        ));

        for key in [ENV_REMOTE_URL, ENV_API_KEY, ENV_DATA_DIR, ENV_SYNC_INTERVAL] {
            std::env::remove_var(key);
        }
    }
}
