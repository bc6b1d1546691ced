//! Restaurant POS sync core.
//!
//! Offline-first data layer for a point-of-sale terminal: a durable local
//! SQLite store that every screen reads and writes, a TTL cache for
//! non-critical reads, a sync engine that pushes local work and pulls remote
//! deltas, a realtime listener for low-latency cross-terminal updates, and
//! the order/menu/inventory/closing workflows on top. [`PosCore`] wires them
//! together; a UI shell holds one for the life of the app.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod api;
pub mod cache;
pub mod closings;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod menu;
pub mod models;
pub mod orders;
pub mod profile;
pub mod queue;
pub mod realtime;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod testing;

use api::{RemoteBackend, RestBackend};
use cache::CacheLayer;
use closings::ClosingService;
use config::Config;
use connectivity::Connectivity;
use db::LocalStore;
use error::StartupError;
use inventory::InventoryService;
use menu::MenuService;
use orders::OrderWorkflow;
use profile::ProfileService;
use realtime::RealtimeListener;
use sync::{SyncEngine, SyncHandle};

pub use logging::init_logging;

/// Composition root: every store, service and background component of one
/// terminal.
pub struct PosCore {
    pub config: Config,
    pub store: Arc<LocalStore>,
    pub cache: Arc<CacheLayer>,
    pub remote: Arc<dyn RemoteBackend>,
    pub connectivity: Connectivity,
    pub sync: Arc<SyncEngine>,
    pub orders: OrderWorkflow,
    pub menu: MenuService,
    pub inventory: InventoryService,
    pub closings: ClosingService,
    pub profile: ProfileService,
    pub realtime: Arc<RealtimeListener>,
}

impl PosCore {
    /// Open the on-disk stores under `config.data_dir` and connect to the
    /// configured REST backend.
    pub fn open(config: Config) -> Result<Self, StartupError> {
        let store = Arc::new(LocalStore::open(&config.data_dir)?);
        let cache = Arc::new(CacheLayer::open(&config.data_dir, config.cache_ttls.clone()));
        let remote: Arc<dyn RemoteBackend> = Arc::new(RestBackend::new(&config)?);
        Ok(Self::assemble(config, store, cache, remote))
    }

    /// Wire the services around already-opened stores and a backend.
    pub fn assemble(
        config: Config,
        store: Arc<LocalStore>,
        cache: Arc<CacheLayer>,
        remote: Arc<dyn RemoteBackend>,
    ) -> Self {
        // Offline until the first probe says otherwise.
        let connectivity = Connectivity::new(false);
        let sync = SyncEngine::with_cache(store.clone(), remote.clone(), cache.clone(), &config);
        let orders = OrderWorkflow::new(
            store.clone(),
            remote.clone(),
            connectivity.clone(),
            sync.clone(),
            config.remote_timeout,
        );
        let menu = MenuService::new(
            store.clone(),
            cache.clone(),
            remote.clone(),
            connectivity.clone(),
            config.remote_timeout,
        );
        let inventory = InventoryService::new(store.clone(), cache.clone());
        let closings = ClosingService::new(store.clone(), cache.clone());
        let profile = ProfileService::new(cache.clone(), remote.clone(), config.remote_timeout);
        let realtime = RealtimeListener::new(
            store.clone(),
            cache.clone(),
            config.realtime_url.clone(),
            config.api_key.clone(),
        );

        Self {
            config,
            store,
            cache,
            remote,
            connectivity,
            sync,
            orders,
            menu,
            inventory,
            closings,
            profile,
            realtime,
        }
    }

    /// Start the connectivity probe, the sync scheduler and the realtime
    /// listener. The first probe runs immediately so the reconnect trigger
    /// performs the initial sync.
    pub fn start(&self) -> BackgroundTasks {
        let cancel = CancellationToken::new();
        let sync = self.sync.start(self.connectivity.clone());
        let probe = self
            .connectivity
            .spawn_probe(self.remote.clone(), self.config.probe_interval, cancel.clone());
        let realtime = tokio::spawn(self.realtime.clone().run(cancel.clone()));
        info!(
            data_dir = %self.config.data_dir.display(),
            remote = %self.config.remote_url,
            "POS sync core started"
        );
        BackgroundTasks {
            cancel,
            sync,
            tasks: vec![probe, realtime],
        }
    }
}

/// Handles of the tasks spawned by [`PosCore::start`].
pub struct BackgroundTasks {
    cancel: CancellationToken,
    sync: SyncHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.sync.shutdown().await;
        for task in self.tasks {
            let _ = task.await;
        }
        info!("POS sync core stopped");
    }
}
