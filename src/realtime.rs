//! Realtime change feed.
//!
//! Subscribes to row-level change events for `orders`, `order_items` and
//! `inventory_items` over the backend's Phoenix-channel websocket and merges
//! them into the local store as they arrive. This runs beside the sync
//! engine, not through it; both write paths are idempotent and never touch
//! rows that still carry unpushed local changes.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::cache::CacheLayer;
use crate::config::{REALTIME_BACKOFF_MAX, REALTIME_BACKOFF_MIN, REALTIME_HEARTBEAT};
use crate::db::LocalStore;
use crate::error::{RemoteError, StoreError};
use crate::inventory;
use crate::models::{now_iso, InventoryItem, Order, OrderItem, OrderStatus, Table};

/// Tables with a live subscription.
pub const WATCHED_TABLES: [Table; 3] = [Table::Orders, Table::OrderItems, Table::InventoryItems];

const ORDERS_CACHE_PREFIX: &str = "orders";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl EventType {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "insert" => Some(EventType::Insert),
            "update" => Some(EventType::Update),
            "delete" => Some(EventType::Delete),
            _ => None,
        }
    }
}

/// One decoded row-level change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub event_type: EventType,
    pub new: Value,
    pub old: Value,
}

/// Decode a websocket text frame into a change event.
///
/// Accepts the flat `{eventType, new, old}` payload as well as the
/// `postgres_changes` shape `{data: {type, table, record, old_record}}`.
/// Replies, heartbeats and system messages yield `None`.
pub fn parse_frame(text: &str) -> Option<ChangeEvent> {
    let frame: Value = serde_json::from_str(text).ok()?;
    let payload = frame.get("payload")?;
    let body = payload.get("data").unwrap_or(payload);

    let (event_type, new, old) = if let Some(kind) = body.get("eventType").and_then(Value::as_str) {
        (kind, body.get("new"), body.get("old"))
    } else {
        let kind = body.get("type").and_then(Value::as_str)?;
        (kind, body.get("record"), body.get("old_record"))
    };
    let event_type = EventType::parse(event_type)?;

    let topic = frame.get("topic").and_then(Value::as_str).unwrap_or_default();
    let table = body
        .get("table")
        .and_then(Value::as_str)
        .or_else(|| topic.rsplit(':').next())?
        .parse::<Table>()
        .ok()?;

    Some(ChangeEvent {
        table,
        event_type,
        new: new.cloned().unwrap_or(Value::Null),
        old: old.cloned().unwrap_or(Value::Null),
    })
}

/// User-facing notice raised by a remote change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Notification {
    NewOrder {
        order_id: String,
        order_number: i64,
    },
    StatusChanged {
        order_id: String,
        order_number: Option<i64>,
        from: OrderStatus,
        to: OrderStatus,
        message: String,
    },
}

fn status_message(order_number: Option<i64>, status: OrderStatus) -> String {
    let order = match order_number {
        Some(n) => format!("Order #{n}"),
        None => "An order".to_string(),
    };
    match status {
        OrderStatus::Pending => format!("{order} is back to pending"),
        OrderStatus::Preparing => format!("{order} is being prepared"),
        OrderStatus::Ready => format!("{order} is ready for pickup"),
        OrderStatus::Completed => format!("{order} has been completed"),
        OrderStatus::Cancelled => format!("{order} was cancelled"),
    }
}

fn row_id(row: &Value) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

fn decode_row<T: serde::de::DeserializeOwned>(event: &ChangeEvent) -> Option<T> {
    match serde_json::from_value(event.new.clone()) {
        Ok(row) => Some(row),
        Err(e) => {
            warn!(table = %event.table, error = %e, "realtime: undecodable row, ignoring");
            None
        }
    }
}

pub struct RealtimeListener {
    store: Arc<LocalStore>,
    cache: Arc<CacheLayer>,
    realtime_url: String,
    api_key: Zeroizing<String>,
    notifications: broadcast::Sender<Notification>,
}

impl RealtimeListener {
    pub fn new(
        store: Arc<LocalStore>,
        cache: Arc<CacheLayer>,
        realtime_url: impl Into<String>,
        api_key: Zeroizing<String>,
    ) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(64);
        Arc::new(Self {
            store,
            cache,
            realtime_url: realtime_url.into(),
            api_key,
            notifications,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Merge one change into the local store. Returns the notification it
    /// raises, if any. Re-applying the same event is a no-op.
    pub fn apply(&self, event: &ChangeEvent) -> Result<Option<Notification>, StoreError> {
        let notification = match event.table {
            Table::Orders => self.apply_order(event)?,
            Table::OrderItems => {
                match event.event_type {
                    EventType::Insert | EventType::Update => {
                        if let Some(item) = decode_row::<OrderItem>(event) {
                            self.store.apply_remote_order_item_insert(item)?;
                        }
                    }
                    EventType::Delete => {
                        if let Some(id) = row_id(&event.old) {
                            self.store.apply_remote_order_item_delete(id)?;
                        }
                    }
                }
                self.cache.invalidate_prefix(ORDERS_CACHE_PREFIX);
                None
            }
            Table::InventoryItems => {
                match event.event_type {
                    EventType::Insert | EventType::Update => {
                        if let Some(item) = decode_row::<InventoryItem>(event) {
                            self.store.apply_remote_inventory_item(item)?;
                        }
                    }
                    EventType::Delete => {
                        if let Some(id) = row_id(&event.old) {
                            self.store.apply_remote_inventory_delete(id)?;
                        }
                    }
                }
                self.cache.invalidate_prefix(inventory::CACHE_PREFIX);
                None
            }
            other => {
                debug!(table = %other, "realtime: table not watched");
                None
            }
        };
        Ok(notification)
    }

    fn apply_order(&self, event: &ChangeEvent) -> Result<Option<Notification>, StoreError> {
        let notification = match event.event_type {
            EventType::Insert => {
                let Some(order) = decode_row::<Order>(event) else {
                    return Ok(None);
                };
                let (order_id, order_number) = (order.id.to_string(), order.order_number);
                self.store
                    .apply_remote_order_insert(order)?
                    .then_some(Notification::NewOrder { order_id, order_number })
            }
            EventType::Update => {
                let Some(id) = row_id(&event.new) else {
                    return Ok(None);
                };
                let Some(status) = event
                    .new
                    .get("status")
                    .cloned()
                    .and_then(|s| serde_json::from_value::<OrderStatus>(s).ok())
                else {
                    warn!(order_id = id, "realtime: order update without a known status");
                    return Ok(None);
                };
                let updated_at = event
                    .new
                    .get("updated_at")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(now_iso);

                match self.store.apply_remote_order_status(id, status, &updated_at)? {
                    Some(previous) if previous != status => {
                        let order_number = event.new.get("order_number").and_then(Value::as_i64);
                        Some(Notification::StatusChanged {
                            order_id: id.to_string(),
                            order_number,
                            from: previous,
                            to: status,
                            message: status_message(order_number, status),
                        })
                    }
                    Some(_) => None,
                    None => {
                        // Order not known locally yet: take the full row if present.
                        if self.store.get_order(id)?.is_none() {
                            if let Some(order) = decode_row::<Order>(event) {
                                self.store.apply_remote_order_insert(order)?;
                            }
                        }
                        None
                    }
                }
            }
            EventType::Delete => {
                if let Some(id) = row_id(&event.old) {
                    self.store.apply_remote_order_delete(id)?;
                }
                None
            }
        };
        self.cache.invalidate_prefix(ORDERS_CACHE_PREFIX);
        Ok(notification)
    }

    fn handle_text(&self, text: &str) {
        let Some(event) = parse_frame(text) else {
            return;
        };
        debug!(table = %event.table, event = ?event.event_type, "realtime change");
        match self.apply(&event) {
            Ok(Some(notification)) => {
                info!(?notification, "Realtime notification");
                // No receivers is fine.
                let _ = self.notifications.send(notification);
            }
            Ok(None) => {}
            Err(e) => warn!(table = %event.table, error = %e, "realtime: failed to apply change"),
        }
    }

    /// Keep the subscription alive until cancelled, reconnecting with
    /// exponential backoff and re-joining every watched table.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = REALTIME_BACKOFF_MIN;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.session(&cancel, &mut backoff).await {
                Ok(()) if cancel.is_cancelled() => break,
                Ok(()) => info!("Realtime connection closed by server"),
                Err(e) => warn!(error = %e, retry_in_secs = backoff.as_secs(), "Realtime connection failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff);
        }
        info!("Realtime listener stopped");
    }

    async fn session(&self, cancel: &CancellationToken, backoff: &mut Duration) -> Result<(), RemoteError> {
        let url = format!("{}?apikey={}&vsn=1.0.0", self.realtime_url, self.api_key.as_str());
        let (ws, _) = connect_async(url.as_str()).await.map_err(ws_error)?;
        let (mut sink, mut stream) = ws.split();

        let mut next_ref: u64 = 0;
        let mut join_refs = Vec::with_capacity(WATCHED_TABLES.len());
        for table in WATCHED_TABLES {
            next_ref += 1;
            let frame = join_frame(table, self.api_key.as_str(), next_ref);
            sink.send(Message::Text(frame.to_string())).await.map_err(ws_error)?;
            join_refs.push(next_ref.to_string());
        }
        debug!(tables = WATCHED_TABLES.len(), "Realtime join sent");
        // Backoff only resets once the server has accepted a join.
        let mut joined = false;

        let mut heartbeat = tokio::time::interval(REALTIME_HEARTBEAT);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    next_ref += 1;
                    sink.send(Message::Text(heartbeat_frame(next_ref).to_string()))
                        .await
                        .map_err(ws_error)?;
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !joined && is_join_ack(&text, &join_refs) {
                            joined = true;
                            *backoff = REALTIME_BACKOFF_MIN;
                            info!(tables = WATCHED_TABLES.len(), "Realtime subscribed");
                        }
                        self.handle_text(&text);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "realtime close frame");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(ws_error(e)),
                    None => return Ok(()),
                },
            }
        }
    }
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> RemoteError {
    RemoteError::Network(format!("realtime: {e}"))
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(REALTIME_BACKOFF_MAX)
}

fn join_frame(table: Table, access_token: &str, message_ref: u64) -> Value {
    json!({
        "topic": format!("realtime:public:{table}"),
        "event": "phx_join",
        "payload": {
            "config": {
                "postgres_changes": [
                    { "event": "*", "schema": "public", "table": table.as_str() }
                ]
            },
            "access_token": access_token,
        },
        "ref": message_ref.to_string(),
    })
}

/// A `phx_reply` with status ok answering one of our join frames.
fn is_join_ack(text: &str, join_refs: &[String]) -> bool {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        return false;
    };
    frame.get("event").and_then(Value::as_str) == Some("phx_reply")
        && frame.pointer("/payload/status").and_then(Value::as_str) == Some("ok")
        && frame
            .get("ref")
            .and_then(Value::as_str)
            .is_some_and(|r| join_refs.iter().any(|j| j == r))
}

fn heartbeat_frame(message_ref: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": message_ref.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SystemClock;
    use crate::config::CacheTtls;

    fn listener() -> (Arc<RealtimeListener>, Arc<LocalStore>) {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let cache = Arc::new(CacheLayer::in_memory(CacheTtls::default(), Arc::new(SystemClock)));
        let listener = RealtimeListener::new(
            store.clone(),
            cache,
            "ws://localhost/realtime/v1/websocket",
            Zeroizing::new("key".to_string()),
        );
        (listener, store)
    }

    fn order_row(id: &str, number: i64, status: &str) -> Value {
        json!({
            "id": id,
            "order_number": number,
            "bill_type": "tax_invoice",
            "subtotal": 200.0,
            "total_amount": 200.0,
            "status": status,
            "created_at": "2026-10-17T10:00:00.000Z",
            "updated_at": "2026-10-17T10:00:00.000Z",
        })
    }

    fn event(table: Table, event_type: EventType, new: Value, old: Value) -> ChangeEvent {
        ChangeEvent { table, event_type, new, old }
    }

    #[test]
    fn test_parse_flat_and_postgres_changes_frames() {
        let flat = json!({
            "topic": "realtime:public:orders",
            "event": "postgres_changes",
            "payload": { "eventType": "UPDATE", "new": { "id": "o1" }, "old": {} }
        });
        let parsed = parse_frame(&flat.to_string()).unwrap();
        assert_eq!(parsed.table, Table::Orders);
        assert_eq!(parsed.event_type, EventType::Update);
        assert_eq!(parsed.new["id"], "o1");

        let nested = json!({
            "topic": "realtime:public:inventory_items",
            "event": "postgres_changes",
            "payload": { "data": {
                "type": "DELETE",
                "table": "inventory_items",
                "record": null,
                "old_record": { "id": "rice" }
            }}
        });
        let parsed = parse_frame(&nested.to_string()).unwrap();
        assert_eq!(parsed.table, Table::InventoryItems);
        assert_eq!(parsed.event_type, EventType::Delete);
        assert_eq!(parsed.old["id"], "rice");
    }

    #[test]
    fn test_parse_ignores_replies_and_garbage() {
        let reply = json!({
            "topic": "phoenix",
            "event": "phx_reply",
            "payload": { "status": "ok", "response": {} },
            "ref": "4"
        });
        assert!(parse_frame(&reply.to_string()).is_none());
        assert!(parse_frame("not json").is_none());
    }

    #[test]
    fn test_order_insert_notifies_once() {
        let (listener, store) = listener();
        let insert = event(Table::Orders, EventType::Insert, order_row("o1", 1001, "pending"), Value::Null);

        let first = listener.apply(&insert).unwrap();
        assert_eq!(
            first,
            Some(Notification::NewOrder { order_id: "o1".into(), order_number: 1001 })
        );
        assert!(listener.apply(&insert).unwrap().is_none());
        assert!(store.get_order("o1").unwrap().unwrap().synced);
    }

    #[test]
    fn test_status_update_notifies_only_on_change() {
        let (listener, store) = listener();
        listener
            .apply(&event(Table::Orders, EventType::Insert, order_row("o1", 1001, "pending"), Value::Null))
            .unwrap();

        let mut row = order_row("o1", 1001, "ready");
        row["updated_at"] = json!("2026-10-17T10:05:00.000Z");
        let update = event(Table::Orders, EventType::Update, row, Value::Null);
        match listener.apply(&update).unwrap() {
            Some(Notification::StatusChanged { from, to, message, .. }) => {
                assert_eq!(from, OrderStatus::Pending);
                assert_eq!(to, OrderStatus::Ready);
                assert_eq!(message, "Order #1001 is ready for pickup");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(listener.apply(&update).unwrap().is_none());

        let order = store.get_order("o1").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Ready);
        assert_eq!(order.updated_at, "2026-10-17T10:05:00.000Z");
    }

    #[test]
    fn test_order_delete_and_item_insert() {
        let (listener, store) = listener();
        listener
            .apply(&event(Table::Orders, EventType::Insert, order_row("o1", 1001, "pending"), Value::Null))
            .unwrap();

        let item = json!({
            "id": "i1",
            "order_id": "o1",
            "menu_item_id": "m1",
            "menu_item_name": "Paneer Tikka",
            "quantity": 2,
            "unit_price": 100.0,
            "total_price": 200.0,
        });
        listener
            .apply(&event(Table::OrderItems, EventType::Insert, item.clone(), Value::Null))
            .unwrap();
        listener
            .apply(&event(Table::OrderItems, EventType::Insert, item, Value::Null))
            .unwrap();
        assert_eq!(store.order_items("o1").unwrap().len(), 1);

        listener
            .apply(&event(Table::Orders, EventType::Delete, Value::Null, json!({ "id": "o1" })))
            .unwrap();
        assert!(store.get_order("o1").unwrap().is_none());
    }

    fn item_row(id: &str, order_id: &str) -> Value {
        json!({
            "id": id,
            "order_id": order_id,
            "menu_item_id": "m1",
            "menu_item_name": "Paneer Tikka",
            "quantity": 1,
            "unit_price": 100.0,
            "total_price": 100.0,
        })
    }

    #[test]
    fn test_order_item_delete_removes_synced_item() {
        let (listener, store) = listener();
        listener
            .apply(&event(Table::Orders, EventType::Insert, order_row("o1", 1001, "pending"), Value::Null))
            .unwrap();
        for id in ["i1", "i2"] {
            listener
                .apply(&event(Table::OrderItems, EventType::Insert, item_row(id, "o1"), Value::Null))
                .unwrap();
        }
        assert_eq!(store.order_items("o1").unwrap().len(), 2);

        let delete = event(Table::OrderItems, EventType::Delete, Value::Null, json!({ "id": "i1" }));
        assert!(listener.apply(&delete).unwrap().is_none());
        let left = store.order_items("o1").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id.as_str(), "i2");

        // Repeated delivery is harmless.
        listener.apply(&delete).unwrap();
        assert_eq!(store.order_items("o1").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_keeps_rows_with_unpushed_changes() {
        let (listener, store) = listener();
        listener
            .apply(&event(Table::Orders, EventType::Insert, order_row("o1", 1001, "pending"), Value::Null))
            .unwrap();

        let mut local = store.get_order("o1").unwrap().unwrap();
        local.status = OrderStatus::Preparing;
        local.synced = false;
        store.update_order(&local).unwrap();

        listener
            .apply(&event(Table::Orders, EventType::Delete, Value::Null, json!({ "id": "o1" })))
            .unwrap();
        let kept = store.get_order("o1").unwrap().unwrap();
        assert_eq!(kept.status, OrderStatus::Preparing);
        assert!(!kept.synced);

        let mut stranded: OrderItem = serde_json::from_value(item_row("local_1_abc", "o1")).unwrap();
        stranded.synced = false;
        store.mirror_created_order(&kept, &[stranded]).unwrap();
        listener
            .apply(&event(Table::OrderItems, EventType::Delete, Value::Null, json!({ "id": "local_1_abc" })))
            .unwrap();
        assert_eq!(store.order_items("o1").unwrap().len(), 1);
    }

    #[test]
    fn test_inventory_update_replaces_synced_stock() {
        let (listener, store) = listener();
        let row = json!({
            "id": "rice",
            "name": "Rice",
            "unit": "kg",
            "current_stock": 12.0,
            "min_stock": 5.0,
            "updated_at": "2026-10-17T09:00:00.000Z",
        });
        listener
            .apply(&event(Table::InventoryItems, EventType::Insert, row.clone(), Value::Null))
            .unwrap();

        let mut updated = row;
        updated["current_stock"] = json!(9.5);
        listener
            .apply(&event(Table::InventoryItems, EventType::Update, updated, Value::Null))
            .unwrap();
        let item = store.get_inventory_item("rice").unwrap().unwrap();
        assert_eq!(item.current_stock, 9.5);
        assert!(item.synced);

        store.set_inventory_stock("rice", 3.0).unwrap();
        listener
            .apply(&event(Table::InventoryItems, EventType::Delete, Value::Null, json!({ "id": "rice" })))
            .unwrap();
        assert_eq!(store.get_inventory_item("rice").unwrap().unwrap().current_stock, 3.0);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = REALTIME_BACKOFF_MIN;
        let mut seen = Vec::new();
        for _ in 0..7 {
            backoff = next_backoff(backoff);
            seen.push(backoff.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_join_ack_requires_ok_reply_to_a_join() {
        let refs = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let reply = |status: &str, r: &str| {
            json!({
                "topic": "realtime:public:orders",
                "event": "phx_reply",
                "payload": { "status": status, "response": {} },
                "ref": r,
            })
            .to_string()
        };
        assert!(is_join_ack(&reply("ok", "2"), &refs));
        assert!(!is_join_ack(&reply("error", "1"), &refs));
        // Heartbeat replies carry later refs.
        assert!(!is_join_ack(&reply("ok", "4"), &refs));
        assert!(!is_join_ack(r#"{"event":"postgres_changes","payload":{}}"#, &refs));
        assert!(!is_join_ack("garbage", &refs));
    }

    /// Accept one websocket, read the join frames, optionally acknowledge
    /// the first join, then close.
    async fn one_shot_server(acknowledge: bool) -> String {
        let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = tcp.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            for _ in 0..WATCHED_TABLES.len() {
                let _ = ws.next().await;
            }
            if acknowledge {
                let ack = json!({
                    "topic": "realtime:public:orders",
                    "event": "phx_reply",
                    "payload": { "status": "ok", "response": {} },
                    "ref": "1",
                });
                ws.send(Message::Text(ack.to_string())).await.unwrap();
            }
            let _ = ws.close(None).await;
        });
        format!("ws://{addr}/realtime/v1/websocket")
    }

    fn listener_at(url: String) -> Arc<RealtimeListener> {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let cache = Arc::new(CacheLayer::in_memory(CacheTtls::default(), Arc::new(SystemClock)));
        RealtimeListener::new(store, cache, url, Zeroizing::new("key".to_string()))
    }

    #[tokio::test]
    async fn test_backoff_kept_when_server_closes_before_join_ack() {
        let listener = listener_at(one_shot_server(false).await);
        let cancel = CancellationToken::new();
        let mut backoff = Duration::from_secs(8);
        listener.session(&cancel, &mut backoff).await.unwrap();
        assert_eq!(backoff, Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_backoff_resets_after_join_ack() {
        let listener = listener_at(one_shot_server(true).await);
        let cancel = CancellationToken::new();
        let mut backoff = Duration::from_secs(8);
        listener.session(&cancel, &mut backoff).await.unwrap();
        assert_eq!(backoff, REALTIME_BACKOFF_MIN);
    }

    #[test]
    fn test_join_frame_targets_table_topic() {
        let frame = join_frame(Table::OrderItems, "key", 3);
        assert_eq!(frame["topic"], "realtime:public:order_items");
        assert_eq!(frame["payload"]["config"]["postgres_changes"][0]["table"], "order_items");
        assert_eq!(frame["ref"], "3");
    }
}
