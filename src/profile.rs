//! Business profile shown on receipts.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::api::{self, bounded, Query, RemoteBackend};
use crate::cache::CacheLayer;
use crate::error::RemoteError;
use crate::models::Table;

pub const CACHE_KEY: &str = "profile:business";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessProfile {
    pub id: String,
    pub business_name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tax_number: Option<String>,
    #[serde(default)]
    pub receipt_footer: Option<String>,
    #[serde(default = "default_currency")]
    pub currency_symbol: String,
}

fn default_currency() -> String {
    "₹".to_string()
}

pub struct ProfileService {
    cache: Arc<CacheLayer>,
    remote: Arc<dyn RemoteBackend>,
    remote_timeout: Duration,
}

impl ProfileService {
    pub fn new(cache: Arc<CacheLayer>, remote: Arc<dyn RemoteBackend>, remote_timeout: Duration) -> Self {
        Self {
            cache,
            remote,
            remote_timeout,
        }
    }

    /// Cached profile, else the first remote row. `Ok(None)` when the
    /// backend has no profile configured.
    pub async fn business_profile(&self) -> Result<Option<BusinessProfile>, RemoteError> {
        if let Some(profile) = self.cache.get::<BusinessProfile>(CACHE_KEY) {
            return Ok(Some(profile));
        }
        debug!("business profile cache miss, fetching");
        let rows = bounded(
            self.remote_timeout,
            self.remote.select(Table::BusinessProfiles, &Query::new().limit(1)),
        )
        .await
        .inspect_err(|e| warn!(error = %e, "business profile fetch failed"))?;

        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let profile: BusinessProfile = api::decode(row)?;
        self.cache.set(CACHE_KEY, &profile);
        Ok(Some(profile))
    }

    /// Drop the cached copy so the next read refetches.
    pub fn refresh(&self) {
        self.cache.invalidate(CACHE_KEY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SystemClock;
    use crate::config::CacheTtls;
    use crate::testing::MemoryBackend;
    use serde_json::json;

    #[tokio::test]
    async fn test_profile_is_fetched_once_then_cached() {
        let remote = Arc::new(MemoryBackend::new());
        remote.seed(
            Table::BusinessProfiles,
            json!({ "id": "bp-1", "business_name": "Udupi Corner", "phone": "0821-555" }),
        );
        let cache = Arc::new(CacheLayer::in_memory(CacheTtls::default(), Arc::new(SystemClock)));
        let svc = ProfileService::new(cache, remote.clone(), Duration::from_secs(1));

        let first = svc.business_profile().await.unwrap().unwrap();
        assert_eq!(first.business_name, "Udupi Corner");
        assert_eq!(first.currency_symbol, "₹");

        remote.set_offline(true);
        let second = svc.business_profile().await.unwrap().unwrap();
        assert_eq!(second, first);
        assert_eq!(remote.call_count(), 1);

        svc.refresh();
        assert!(svc.business_profile().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_profile_is_none() {
        let remote = Arc::new(MemoryBackend::new());
        let cache = Arc::new(CacheLayer::in_memory(CacheTtls::default(), Arc::new(SystemClock)));
        let svc = ProfileService::new(cache, remote, Duration::from_secs(1));
        assert!(svc.business_profile().await.unwrap().is_none());
    }
}
