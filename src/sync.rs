//! Background sync engine.
//!
//! One full cycle pushes every unsynced local row to the backend, then pulls
//! the remote delta and applies it without touching rows that still have
//! unpushed local changes. At most one cycle runs at a time; a trigger that
//! arrives while a cycle is in flight is dropped, not queued.
//!
//! Cycles are triggered by the periodic timer, by an offline -> online
//! transition (debounced), by an explicit "sync now" and right after an
//! order is created offline while the backend is reachable.

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{
    self, bounded, ClosingRequest, CreateOrderItemRequest, CreateOrderRequest, CreatedOrder,
    CreatedRow, MenuItemRequest, OrderUpdateRequest, Query, RemoteBackend, StockUpdateRequest,
    VerificationRequest,
};
use crate::cache::CacheLayer;
use crate::closings::{self, ClosingWithVerifications, DUPLICATE_CLOSING_MESSAGE};
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::db::{ApplyCounts, LocalStore, StoreChange, UnsyncedCounts};
use crate::error::{RemoteError, SyncError};
use crate::inventory;
use crate::menu;
use crate::orders;
use crate::models::{
    now_iso, DailyClosing, EntityId, InventoryItem, MenuItem, Order, OrderItem, OrderWithItems,
    StockVerification, Table,
};
use crate::queue::OperationKind;

/// First-run snapshot bounds.
const INITIAL_ORDER_WINDOW_DAYS: i64 = 7;
const INITIAL_CLOSING_LIMIT: usize = 30;
/// Ids per `in.(...)` filter, keeping request URLs short.
const IN_FILTER_CHUNK: usize = 100;

// ---------------------------------------------------------------------------
// Reports / status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Reconnect,
    Periodic,
    Manual,
    OfflineOrder,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Reconnect => "reconnect",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Manual => "manual",
            SyncTrigger::OfflineOrder => "offline_order",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityPush {
    pub succeeded: usize,
    pub failed: usize,
}

impl EntityPush {
    fn record<T, E>(&mut self, result: &Result<T, E>) {
        if result.is_ok() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub queued_operations: EntityPush,
    pub orders: EntityPush,
    pub order_items: EntityPush,
    pub menu_items: EntityPush,
    pub inventory_items: EntityPush,
    pub daily_closings: EntityPush,
}

impl PushReport {
    pub fn failed(&self) -> usize {
        self.queued_operations.failed
            + self.orders.failed
            + self.order_items.failed
            + self.menu_items.failed
            + self.inventory_items.failed
            + self.daily_closings.failed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    pub incremental: bool,
    pub menu_items: ApplyCounts,
    pub inventory_items: ApplyCounts,
    pub orders: ApplyCounts,
    pub daily_closings: ApplyCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub trigger: &'static str,
    pub push: PushReport,
    pub pull: PullReport,
    pub finished_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another cycle was already running.
    Skipped,
    /// The pull failed; the last-sync timestamp was not advanced.
    Failed(String),
}

/// What the status indicator shows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub last_sync_at: Option<String>,
    pub last_error: Option<String>,
    pub unsynced: UnsyncedCounts,
    pub last_report: Option<SyncReport>,
}

/// Resets the busy flag when a cycle ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteBackend>,
    cache: Option<Arc<CacheLayer>>,
    remote_timeout: Duration,
    sync_interval: Duration,
    reconnect_debounce: Duration,
    busy: AtomicBool,
    status: watch::Sender<SyncStatus>,
}

impl SyncEngine {
    pub fn new(store: Arc<LocalStore>, remote: Arc<dyn RemoteBackend>, config: &Config) -> Arc<Self> {
        Self::build(store, remote, None, config)
    }

    /// Engine that also drops stale cache entries after each pull.
    pub fn with_cache(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteBackend>,
        cache: Arc<CacheLayer>,
        config: &Config,
    ) -> Arc<Self> {
        Self::build(store, remote, Some(cache), config)
    }

    fn build(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteBackend>,
        cache: Option<Arc<CacheLayer>>,
        config: &Config,
    ) -> Arc<Self> {
        let initial = SyncStatus {
            last_sync_at: store.last_sync_at().ok().flatten(),
            unsynced: store.unsynced_counts().unwrap_or_default(),
            ..SyncStatus::default()
        };
        let (status, _) = watch::channel(initial);
        Arc::new(Self {
            store,
            remote,
            cache,
            remote_timeout: config.remote_timeout,
            sync_interval: config.sync_interval,
            reconnect_debounce: config.reconnect_debounce,
            busy: AtomicBool::new(false),
            status,
        })
    }

    pub fn is_syncing(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Re-read unsynced counts, e.g. after a local write.
    pub fn refresh_status(&self) {
        match self.store.unsynced_counts() {
            Ok(counts) => {
                self.status.send_if_modified(|s| {
                    let changed = s.unsynced != counts;
                    s.unsynced = counts;
                    changed
                });
            }
            Err(e) => warn!(error = %e, "failed to read unsynced counts"),
        }
    }

    /// "Sync now".
    pub async fn sync_now(&self) -> SyncOutcome {
        self.run_full_sync(SyncTrigger::Manual).await
    }

    /// Push, then pull, then advance the last-sync timestamp. Never panics
    /// or returns an error: the outcome is also published on the status
    /// channel.
    pub async fn run_full_sync(&self, trigger: SyncTrigger) -> SyncOutcome {
        let Some(_busy) = BusyGuard::acquire(&self.busy) else {
            debug!(trigger = trigger.as_str(), "sync already in progress, trigger dropped");
            return SyncOutcome::Skipped;
        };
        self.status.send_modify(|s| s.is_syncing = true);
        info!(trigger = trigger.as_str(), "Sync cycle started");

        let push = self.push().await;
        // Rows changed remotely while the pull runs are picked up next cycle.
        let cycle_started = now_iso();
        let outcome = match self.pull().await {
            Ok(pull) => {
                if let Err(e) = self.store.set_last_sync_at(&cycle_started) {
                    error!(error = %e, "failed to persist last sync timestamp");
                }
                let report = SyncReport {
                    trigger: trigger.as_str(),
                    push,
                    pull,
                    finished_at: now_iso(),
                };
                info!(
                    trigger = trigger.as_str(),
                    push_failed = report.push.failed(),
                    orders_pulled = report.pull.orders.applied,
                    "Sync cycle complete"
                );
                SyncOutcome::Completed(report)
            }
            Err(e) => {
                warn!(trigger = trigger.as_str(), error = %e, "Sync cycle failed during pull");
                SyncOutcome::Failed(e.to_string())
            }
        };

        let unsynced = self.store.unsynced_counts().unwrap_or_default();
        let last_sync_at = self.store.last_sync_at().ok().flatten();
        self.status.send_modify(|s| {
            s.is_syncing = false;
            s.unsynced = unsynced;
            s.last_sync_at = last_sync_at;
            match &outcome {
                SyncOutcome::Completed(report) => {
                    s.last_error = None;
                    s.last_report = Some(report.clone());
                }
                SyncOutcome::Failed(message) => s.last_error = Some(message.clone()),
                SyncOutcome::Skipped => {}
            }
        });
        outcome
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    /// Push every unsynced row. A failure on one row is recorded and never
    /// stops the others.
    pub async fn push(&self) -> PushReport {
        let mut report = PushReport {
            queued_operations: self.replay_queue().await,
            ..PushReport::default()
        };

        // Menu items first: their remap rewrites the order lines that
        // reference them.
        match self.store.unsynced_menu_items() {
            Ok(items) => {
                for item in items {
                    let result = self.push_menu_item(&item).await;
                    if let Err(e) = &result {
                        warn!(menu_item_id = %item.id, error = %e, "push: menu item failed");
                    }
                    report.menu_items.record(&result);
                }
            }
            Err(e) => error!(error = %e, "push: failed to read unsynced menu items"),
        }

        match self.store.unsynced_orders() {
            Ok(orders) => {
                for entry in orders {
                    self.push_order(entry, &mut report).await;
                }
            }
            Err(e) => error!(error = %e, "push: failed to read unsynced orders"),
        }

        match self.store.stranded_order_items() {
            Ok(items) => {
                for item in items {
                    let result = self.push_order_item(&item).await;
                    report.order_items.record(&result);
                }
            }
            Err(e) => error!(error = %e, "push: failed to read stranded order items"),
        }

        match self.store.unsynced_inventory() {
            Ok(items) => {
                for item in items {
                    let result = self.push_inventory_item(&item).await;
                    if let Err(e) = &result {
                        warn!(item_id = %item.id, error = %e, "push: stock update failed");
                    }
                    report.inventory_items.record(&result);
                }
            }
            Err(e) => error!(error = %e, "push: failed to read unsynced inventory"),
        }

        match self.store.unsynced_closings() {
            Ok(closings) => {
                for entry in closings {
                    let result = self.push_closing(&entry).await;
                    report.daily_closings.record(&result);
                }
            }
            Err(e) => error!(error = %e, "push: failed to read unsynced closings"),
        }
        match self.store.stranded_verifications() {
            Ok(rows) => {
                for v in rows {
                    if let Err(e) = self.push_verification(&v).await {
                        warn!(verification_id = %v.id, error = %e, "push: stock verification failed");
                    }
                }
            }
            Err(e) => error!(error = %e, "push: failed to read stranded verifications"),
        }

        if let Some(cache) = &self.cache {
            if report.menu_items.succeeded > 0 {
                cache.invalidate_prefix(menu::CACHE_PREFIX);
            }
        }
        report
    }

    /// Replay queued operations oldest first.
    async fn replay_queue(&self) -> EntityPush {
        let mut counts = EntityPush::default();
        let ops = match self.store.list_pending() {
            Ok(ops) => ops,
            Err(e) => {
                error!(error = %e, "push: failed to read pending operations");
                return counts;
            }
        };

        for op in ops {
            if op.is_exhausted() {
                debug!(op_id = %op.id, retries = op.retry_count, "skipping exhausted operation");
                continue;
            }
            let Some(target) = op.target_id().map(str::to_string) else {
                warn!(op_id = %op.id, "queued operation has no target id");
                let _ = self.store.record_operation_failure(&op.id, "payload has no id");
                counts.failed += 1;
                continue;
            };

            let result = match op.operation {
                OperationKind::Insert => self.call(self.remote.insert(op.table, op.payload.clone())).await.map(|_| ()),
                OperationKind::Update => {
                    let mut body = op.payload.clone();
                    if let Value::Object(fields) = &mut body {
                        fields.remove("id");
                        if fields.contains_key("updated_at") {
                            fields.insert("updated_at".into(), Value::String(now_iso()));
                        }
                    }
                    self.call(self.remote.update(op.table, &target, body)).await.map(|_| ())
                }
                OperationKind::Delete => self.call(self.remote.delete(op.table, &target)).await,
            };

            match result {
                Ok(()) => {
                    if let Err(e) = self.store.dequeue(&op.id) {
                        error!(op_id = %op.id, error = %e, "failed to dequeue replayed operation");
                    }
                    info!(op_id = %op.id, table = %op.table, operation = %op.operation, "Replayed queued operation");
                    counts.succeeded += 1;
                }
                Err(e) => {
                    warn!(op_id = %op.id, error = %e, "queued operation replay failed");
                    if let Err(e) = self.store.record_operation_failure(&op.id, &e.to_string()) {
                        error!(op_id = %op.id, error = %e, "failed to record replay failure");
                    }
                    counts.failed += 1;
                }
            }
        }
        counts
    }

    async fn push_order(&self, entry: OrderWithItems, report: &mut PushReport) {
        let OrderWithItems { order, items } = entry;
        let order_id = order.id.to_string();

        let waiting_on = items.iter().find(|i| orders::references_local_menu_item(i));
        let result = if let (true, Some(item)) = (order.id.is_local(), waiting_on) {
            Err(SyncError::Deferred(format!("menu item {}", item.menu_item_id)))
        } else if order.id.is_local() {
            self.push_new_order(&order, &items, report).await
        } else {
            self.push_order_update(&order).await
        };
        report.orders.record(&result);

        if let Err(e) = result {
            warn!(order_id, error = %e, "push: order failed");
            if let Err(store_err) = self.store.mark_order_sync_error(&order_id, &e.to_string()) {
                error!(order_id, error = %store_err, "failed to record order sync error");
            }
        }
    }

    /// Create a local-origin order remotely, re-key it, then create its items.
    async fn push_new_order(
        &self,
        order: &Order,
        items: &[OrderItem],
        report: &mut PushReport,
    ) -> Result<(), SyncError> {
        let body = api::encode(&CreateOrderRequest::from(order))?;
        let created: CreatedOrder = api::decode(self.call(self.remote.insert(Table::Orders, body)).await?)?;
        self.store
            .remap_order(order.id.as_str(), &created.id, created.order_number, &order.updated_at)?;
        info!(
            old_id = %order.id,
            new_id = %created.id,
            order_number = created.order_number,
            "Pushed offline order"
        );

        for item in items {
            let mut item = item.clone();
            item.order_id = EntityId::remote(created.id.clone());
            let result = self.push_order_item(&item).await;
            report.order_items.record(&result);
        }
        Ok(())
    }

    async fn push_order_update(&self, order: &Order) -> Result<(), SyncError> {
        let body = api::encode(&OrderUpdateRequest::from(order))?;
        self.call(self.remote.update(Table::Orders, order.id.as_str(), body)).await?;
        self.store.mark_order_pushed(order.id.as_str(), &order.updated_at)?;
        Ok(())
    }

    /// Create one item under its (remote) order and re-key it locally.
    async fn push_order_item(&self, item: &OrderItem) -> Result<(), SyncError> {
        let result = async {
            if orders::references_local_menu_item(item) {
                return Err(SyncError::Deferred(format!("menu item {}", item.menu_item_id)));
            }
            let body = api::encode(&CreateOrderItemRequest::from(item))?;
            let row: CreatedRow = api::decode(self.call(self.remote.insert(Table::OrderItems, body)).await?)?;
            self.store.remap_order_item(item.id.as_str(), &row.id)?;
            Ok::<_, SyncError>(())
        }
        .await;
        if let Err(e) = &result {
            warn!(item_id = %item.id, order_id = %item.order_id, error = %e, "push: order item failed");
        }
        result
    }

    async fn push_menu_item(&self, item: &MenuItem) -> Result<(), SyncError> {
        let body = api::encode(&MenuItemRequest::from(item))?;
        if item.id.is_local() {
            let row: CreatedRow = api::decode(self.call(self.remote.insert(Table::MenuItems, body)).await?)?;
            self.store.remap_menu_item(item.id.as_str(), &row.id, &item.updated_at)?;
        } else {
            self.call(self.remote.update(Table::MenuItems, item.id.as_str(), body)).await?;
            self.store.mark_menu_item_pushed(item.id.as_str(), &item.updated_at)?;
        }
        Ok(())
    }

    async fn push_inventory_item(&self, item: &InventoryItem) -> Result<(), SyncError> {
        let body = api::encode(&StockUpdateRequest {
            current_stock: item.current_stock,
            updated_at: now_iso(),
        })?;
        self.call(self.remote.update(Table::InventoryItems, item.id.as_str(), body)).await?;
        self.store.mark_inventory_pushed(item.id.as_str(), &item.updated_at)?;
        Ok(())
    }

    async fn push_closing(&self, entry: &ClosingWithVerifications) -> Result<(), SyncError> {
        let closing = &entry.closing;
        let result = async {
            let body = api::encode(&ClosingRequest::from(closing))?;
            let row: CreatedRow = api::decode(self.call(self.remote.insert(Table::DailyClosings, body)).await?)?;

            let mut remapped = Vec::with_capacity(entry.verifications.len());
            for v in &entry.verifications {
                let mut v = v.clone();
                v.closing_id = EntityId::remote(row.id.clone());
                match self.insert_verification(&v).await {
                    Ok(new_id) => remapped.push((v.id.to_string(), new_id)),
                    Err(e) => warn!(verification_id = %v.id, error = %e, "push: stock verification failed"),
                }
            }
            self.store.remap_closing(closing.id.as_str(), &row.id, &remapped)?;
            info!(old_id = %closing.id, new_id = %row.id, date = %closing.closing_date, "Pushed daily closing");
            Ok::<_, SyncError>(())
        }
        .await;

        if let Err(e) = &result {
            let message = match e {
                SyncError::Remote(RemoteError::Conflict(_)) => DUPLICATE_CLOSING_MESSAGE.to_string(),
                other => other.to_string(),
            };
            warn!(closing_id = %closing.id, date = %closing.closing_date, error = %message, "push: closing failed");
            if let Err(store_err) = self.store.mark_closing_sync_error(closing.id.as_str(), &message) {
                error!(closing_id = %closing.id, error = %store_err, "failed to record closing sync error");
            }
        }
        result
    }

    async fn insert_verification(&self, v: &StockVerification) -> Result<String, SyncError> {
        let body = api::encode(&VerificationRequest::from(v))?;
        let row: CreatedRow =
            api::decode(self.call(self.remote.insert(Table::StockVerifications, body)).await?)?;
        Ok(row.id)
    }

    async fn push_verification(&self, v: &StockVerification) -> Result<(), SyncError> {
        let new_id = self.insert_verification(v).await?;
        self.store.remap_verification(v.id.as_str(), &new_id)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------------

    /// Fetch the remote delta (or the first-run snapshot) and apply it.
    /// Any fetch failure aborts the pull; batches already applied stay.
    pub async fn pull(&self) -> Result<PullReport, SyncError> {
        let since = self.store.last_sync_at()?;
        let mut report = PullReport {
            incremental: since.is_some(),
            ..PullReport::default()
        };

        let menu_query = match &since {
            Some(ts) => Query::new().gt("updated_at", ts.as_str()),
            None => Query::new().eq("is_available", true),
        };
        let menu_items: Vec<MenuItem> = self.fetch(Table::MenuItems, &menu_query).await?;
        report.menu_items = self.store.upsert_remote_menu_items(menu_items)?;

        let inventory_query = match &since {
            Some(ts) => Query::new().gt("updated_at", ts.as_str()),
            None => Query::new().eq("is_active", true),
        };
        let stock: Vec<InventoryItem> = self.fetch(Table::InventoryItems, &inventory_query).await?;
        report.inventory_items = self.store.upsert_remote_inventory(stock)?;

        let order_query = match &since {
            Some(ts) => Query::new().gt("updated_at", ts.as_str()),
            None => {
                let cutoff = (Utc::now() - ChronoDuration::days(INITIAL_ORDER_WINDOW_DAYS))
                    .to_rfc3339_opts(SecondsFormat::Millis, true);
                Query::new().gte("created_at", cutoff)
            }
        };
        let orders: Vec<Order> = self.fetch(Table::Orders, &order_query.order_by("created_at", true)).await?;
        let order_ids: Vec<String> = orders.iter().map(|o| o.id.to_string()).collect();
        let mut items: Vec<OrderItem> = self.fetch_in(Table::OrderItems, "order_id", &order_ids).await?;
        if let Some(ts) = &since {
            // Items added to orders that did not change themselves.
            let known: HashSet<String> = items.iter().map(|i| i.id.to_string()).collect();
            let added: Vec<OrderItem> = self
                .fetch(Table::OrderItems, &Query::new().gt("created_at", ts.as_str()))
                .await?;
            items.extend(added.into_iter().filter(|i| !known.contains(i.id.as_str())));
        }
        report.orders = self.store.upsert_remote_orders(orders, items)?;

        let closing_query = match &since {
            Some(ts) => Query::new().gt("updated_at", ts.as_str()),
            None => Query::new()
                .order_by("closing_date", false)
                .limit(INITIAL_CLOSING_LIMIT),
        };
        let closings: Vec<DailyClosing> = self.fetch(Table::DailyClosings, &closing_query).await?;
        let closing_ids: Vec<String> = closings.iter().map(|c| c.id.to_string()).collect();
        let verifications: Vec<StockVerification> =
            self.fetch_in(Table::StockVerifications, "closing_id", &closing_ids).await?;
        report.daily_closings = self.store.upsert_remote_closings(closings, verifications)?;

        if let Some(cache) = &self.cache {
            if report.menu_items.applied > 0 {
                cache.invalidate_prefix(menu::CACHE_PREFIX);
            }
            if report.inventory_items.applied > 0 {
                cache.invalidate_prefix(inventory::CACHE_PREFIX);
            }
            if report.daily_closings.applied > 0 {
                cache.invalidate_prefix(closings::CACHE_PREFIX);
            }
        }
        debug!(?report, "pull applied");
        Ok(report)
    }

    async fn fetch<T: DeserializeOwned>(&self, table: Table, query: &Query) -> Result<Vec<T>, SyncError> {
        let rows = self.call(self.remote.select(table, query)).await?;
        Ok(decode_rows(table, rows))
    }

    async fn fetch_in<T: DeserializeOwned>(
        &self,
        table: Table,
        column: &str,
        ids: &[String],
    ) -> Result<Vec<T>, SyncError> {
        let mut out = Vec::new();
        for chunk in ids.chunks(IN_FILTER_CHUNK) {
            let query = Query::new().is_in(column, chunk.iter().cloned());
            out.extend(self.fetch(table, &query).await?);
        }
        Ok(out)
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, RemoteError>
    where
        F: std::future::Future<Output = Result<T, RemoteError>>,
    {
        bounded(self.remote_timeout, fut).await
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Start the periodic and reconnect triggers. They run until the
    /// returned handle is shut down.
    pub fn start(self: &Arc<Self>, connectivity: Connectivity) -> SyncHandle {
        let cancel = CancellationToken::new();
        let periodic = tokio::spawn(periodic_loop(Arc::clone(self), connectivity.clone(), cancel.clone()));
        let reconnect = tokio::spawn(reconnect_loop(Arc::clone(self), connectivity, cancel.clone()));
        let counts = tokio::spawn(status_loop(Arc::clone(self), self.store.subscribe(), cancel.clone()));
        info!(
            interval_secs = self.sync_interval.as_secs(),
            debounce_ms = self.reconnect_debounce.as_millis() as u64,
            "Sync scheduler started"
        );
        SyncHandle {
            cancel,
            tasks: vec![periodic, reconnect, counts],
        }
    }
}

/// Decode remote rows, dropping (and logging) rows that do not fit.
fn decode_rows<T: DeserializeOwned>(table: Table, rows: Vec<Value>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<T>(row) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(%table, error = %e, "pull: skipping undecodable row");
                None
            }
        })
        .collect()
}

async fn periodic_loop(engine: Arc<SyncEngine>, connectivity: Connectivity, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(engine.sync_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if connectivity.is_online() {
                    engine.run_full_sync(SyncTrigger::Periodic).await;
                } else {
                    debug!("periodic sync skipped while offline");
                }
            }
        }
    }
    debug!("periodic sync loop stopped");
}

/// Sync once the terminal has been back online for the debounce window.
async fn reconnect_loop(engine: Arc<SyncEngine>, connectivity: Connectivity, cancel: CancellationToken) {
    let mut rx = connectivity.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rx.changed() => if changed.is_err() { break },
        }
        if !*rx.borrow_and_update() {
            continue;
        }

        let settled = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(engine.reconnect_debounce) => break *rx.borrow(),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    rx.borrow_and_update();
                }
            }
        };
        if settled {
            info!("Back online, syncing");
            engine.run_full_sync(SyncTrigger::Reconnect).await;
        }
    }
    debug!("reconnect sync loop stopped");
}

/// Keep the unsynced counts in the status current between cycles.
async fn status_loop(
    engine: Arc<SyncEngine>,
    mut changes: broadcast::Receiver<StoreChange>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = changes.recv() => match received {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => engine.refresh_status(),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("sync status loop stopped");
}

/// Running scheduler tasks.
pub struct SyncHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    /// Stop the timers. An in-flight cycle finishes on its own.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Sync scheduler stopped");
    }
}
