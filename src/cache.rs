//! Advisory key/value cache with per-prefix TTLs.
//!
//! Lives in its own SQLite file, separate from the local store. Losing it
//! only costs extra remote fetches, so every storage failure is logged and
//! swallowed. Orders and order items never go through here.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::CacheTtls;

/// Source of "now" for expiry checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|_| Utc::now())
    }
}

pub struct CacheLayer {
    /// `None` when no SQLite connection could be opened; the cache then
    /// behaves as always-miss.
    conn: Mutex<Option<Connection>>,
    ttls: CacheTtls,
    clock: Arc<dyn Clock>,
}

impl CacheLayer {
    /// Open `{data_dir}/cache.db`. A cache that cannot be opened on disk
    /// falls back to memory.
    pub fn open(data_dir: &Path, ttls: CacheTtls) -> Self {
        let path = data_dir.join("cache.db");
        let conn = match Connection::open(&path).and_then(|c| {
            c.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 2000;")?;
            Ok(c)
        }) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cache open failed, using in-memory cache");
                in_memory_connection()
            }
        };
        Self::with_connection(conn, ttls, Arc::new(SystemClock))
    }

    pub fn in_memory(ttls: CacheTtls, clock: Arc<dyn Clock>) -> Self {
        Self::with_connection(in_memory_connection(), ttls, clock)
    }

    fn with_connection(conn: Option<Connection>, ttls: CacheTtls, clock: Arc<dyn Clock>) -> Self {
        if let Some(ref c) = conn {
            if let Err(e) = c.execute_batch(
                "CREATE TABLE IF NOT EXISTS cache_entries (
                    cache_key TEXT PRIMARY KEY,
                    data TEXT NOT NULL,
                    cached_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL
                );",
            ) {
                warn!(error = %e, "cache schema setup failed");
            }
        }
        Self {
            conn: Mutex::new(conn),
            ttls,
            clock,
        }
    }

    /// Store `value` under `key` with the TTL of the key's prefix.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        let data = match serde_json::to_string(value) {
            Ok(d) => d,
            Err(e) => {
                warn!(key, error = %e, "cache value not serializable");
                return;
            }
        };
        let now = self.clock.now().timestamp_millis();
        let ttl_ms = self.ttls.for_key(key).as_millis() as i64;

        let write = |conn: &Connection| {
            conn.execute(
                "INSERT INTO cache_entries (cache_key, data, cached_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(cache_key) DO UPDATE SET
                    data = excluded.data,
                    cached_at = excluded.cached_at,
                    expires_at = excluded.expires_at",
                params![key, data, now, now + ttl_ms],
            )
        };

        let Ok(guard) = self.conn.lock() else {
            warn!(key, "cache lock poisoned, dropping write");
            return;
        };
        let Some(conn) = guard.as_ref() else {
            return;
        };
        if let Err(first) = write(conn) {
            warn!(key, error = %first, "cache write failed, evicting expired entries and retrying");
            let _ = purge_expired(conn, now);
            if let Err(e) = write(conn) {
                warn!(key, error = %e, "cache write failed after eviction");
            }
        }
    }

    /// The cached value, or `None` on miss. Expired entries are removed.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = self.clock.now().timestamp_millis();
        let guard = self.conn.lock().ok()?;
        let conn = guard.as_ref()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT data, expires_at FROM cache_entries WHERE cache_key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .unwrap_or_else(|e| {
                warn!(key, error = %e, "cache read failed");
                None
            });

        let (data, expires_at) = row?;
        if now >= expires_at {
            debug!(key, "cache entry expired");
            let _ = conn.execute("DELETE FROM cache_entries WHERE cache_key = ?1", params![key]);
            return None;
        }
        match serde_json::from_str(&data) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "cache entry unreadable, evicting");
                let _ = conn.execute("DELETE FROM cache_entries WHERE cache_key = ?1", params![key]);
                None
            }
        }
    }

    pub fn invalidate(&self, key: &str) {
        let Ok(guard) = self.conn.lock() else { return };
        if let Some(conn) = guard.as_ref() {
            let _ = conn.execute("DELETE FROM cache_entries WHERE cache_key = ?1", params![key]);
        }
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let Ok(guard) = self.conn.lock() else { return };
        if let Some(conn) = guard.as_ref() {
            let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
            let _ = conn.execute(
                "DELETE FROM cache_entries WHERE cache_key LIKE ?1 ESCAPE '\\'",
                params![pattern],
            );
        }
    }

    /// Seconds since `key` was cached, for "last updated" displays.
    pub fn age(&self, key: &str) -> Option<i64> {
        let guard = self.conn.lock().ok()?;
        let conn = guard.as_ref()?;
        let cached_at: i64 = conn
            .query_row(
                "SELECT cached_at FROM cache_entries WHERE cache_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .ok()??;
        Some((self.clock.now().timestamp_millis() - cached_at) / 1000)
    }

    /// True when the key has a stored row, expired or not.
    #[cfg(test)]
    fn has_row(&self, key: &str) -> bool {
        let guard = self.conn.lock().unwrap();
        guard.as_ref().unwrap().query_row(
            "SELECT COUNT(*) FROM cache_entries WHERE cache_key = ?1",
            params![key],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            > 0
    }
}

fn in_memory_connection() -> Option<Connection> {
    match Connection::open_in_memory() {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(error = %e, "in-memory cache unavailable, caching disabled");
            None
        }
    }
}

fn purge_expired(conn: &Connection, now_ms: i64) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM cache_entries WHERE expires_at <= ?1", params![now_ms])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache_with_clock() -> (CacheLayer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = CacheLayer::in_memory(CacheTtls::default(), clock.clone());
        (cache, clock)
    }

    #[test]
    fn test_get_returns_value_before_ttl() {
        let (cache, _clock) = cache_with_clock();
        let menu = json!([{ "id": "m1", "name": "Masala Dosa" }]);
        cache.set("menuItems", &menu);
        assert_eq!(cache.get::<serde_json::Value>("menuItems"), Some(menu));
    }

    #[test]
    fn test_expired_entry_is_a_miss_and_removed() {
        let (cache, clock) = cache_with_clock();
        cache.set("menuItems", &json!(["x"]));
        clock.advance(CacheTtls::default().menu_items + Duration::from_secs(1));

        assert!(cache.has_row("menuItems"));
        assert_eq!(cache.get::<serde_json::Value>("menuItems"), None);
        assert!(!cache.has_row("menuItems"));
    }

    #[test]
    fn test_prefix_ttls_differ() {
        let (cache, clock) = cache_with_clock();
        cache.set("inventory:all", &json!(1));
        cache.set("profile:business", &json!(2));
        clock.advance(CacheTtls::default().inventory + Duration::from_secs(1));

        assert_eq!(cache.get::<i64>("inventory:all"), None);
        assert_eq!(cache.get::<i64>("profile:business"), Some(2));
    }

    #[test]
    fn test_invalidate_and_age() {
        let (cache, clock) = cache_with_clock();
        cache.set("closings:recent", &json!([]));
        clock.advance(Duration::from_secs(42));
        assert_eq!(cache.age("closings:recent"), Some(42));

        cache.invalidate("closings:recent");
        assert_eq!(cache.age("closings:recent"), None);
        assert_eq!(cache.get::<serde_json::Value>("closings:recent"), None);
    }

    #[test]
    fn test_invalidate_prefix() {
        let (cache, _clock) = cache_with_clock();
        cache.set("menuItems:available", &json!([1]));
        cache.set("menuItems:all", &json!([2]));
        cache.set("inventory:all", &json!([3]));
        cache.invalidate_prefix("menuItems");
        assert_eq!(cache.get::<serde_json::Value>("menuItems:available"), None);
        assert_eq!(cache.get::<serde_json::Value>("menuItems:all"), None);
        assert!(cache.get::<serde_json::Value>("inventory:all").is_some());
    }
}
