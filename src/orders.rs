//! Orders: local persistence and the order creation workflow.
//!
//! The workflow is the only place that mints order ids. Online, an order is
//! written to the backend first (authoritative number, immediate realtime
//! broadcast to other terminals) and mirrored locally as synced. Offline, or
//! when any remote step fails, it is written locally with a local-origin id
//! and a high-range order number and left for the sync engine to push.
//! Either way the caller reads the result from the local store.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{
    self, bounded, CreateOrderItemRequest, CreateOrderRequest, CreatedOrder, CreatedRow,
    OrderUpdateRequest, RemoteBackend,
};
use crate::connectivity::Connectivity;
use crate::db::{self, ApplyCounts, ChangeKind, LocalStore, StoreChange};
use crate::error::{RemoteError, StoreError, WorkflowError};
use crate::models::{
    line_amounts, local_day_bounds, now_iso, round2, EntityId, Order, OrderDraft, OrderItem,
    OrderStatus, OrderTotals, OrderWithItems, Table,
};
use crate::queue::OperationKind;
use crate::sync::{SyncEngine, SyncTrigger};

/// Offline order numbers start above this so they never collide with
/// numbers the backend issues.
pub const OFFLINE_ORDER_NUMBER_BASE: i64 = 900_000;

const ORDER_COLUMNS: &str = "id, order_number, customer_name, table_number, bill_type, subtotal, \
     tax_amount, discount_amount, total_amount, status, payment_method, created_by, created_at, \
     updated_at, synced, sync_error";

const ITEM_COLUMNS: &str = "id, order_id, menu_item_id, menu_item_name, quantity, unit_price, \
     tax_percentage, tax_amount, total_price, notes, synced, created_at";

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        id: row.get(0)?,
        order_number: row.get(1)?,
        customer_name: row.get(2)?,
        table_number: row.get(3)?,
        bill_type: row.get(4)?,
        subtotal: row.get(5)?,
        tax_amount: row.get(6)?,
        discount_amount: row.get(7)?,
        total_amount: row.get(8)?,
        status: row.get(9)?,
        payment_method: row.get(10)?,
        created_by: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        synced: row.get(14)?,
        sync_error: row.get(15)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<OrderItem> {
    Ok(OrderItem {
        id: row.get(0)?,
        order_id: row.get(1)?,
        menu_item_id: row.get(2)?,
        menu_item_name: row.get(3)?,
        quantity: row.get(4)?,
        unit_price: row.get(5)?,
        tax_percentage: row.get(6)?,
        tax_amount: row.get(7)?,
        total_price: row.get(8)?,
        notes: row.get(9)?,
        synced: row.get(10)?,
        created_at: row.get(11)?,
    })
}

const INSERT_ORDER_SQL: &str = "INSERT INTO orders (id, order_number, customer_name, table_number, \
     bill_type, subtotal, tax_amount, discount_amount, total_amount, status, payment_method, \
     created_by, created_at, updated_at, synced, sync_error)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)";

const UPSERT_ORDER_SQL: &str = "INSERT INTO orders (id, order_number, customer_name, table_number, \
     bill_type, subtotal, tax_amount, discount_amount, total_amount, status, payment_method, \
     created_by, created_at, updated_at, synced, sync_error)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
     ON CONFLICT(id) DO UPDATE SET
        order_number = excluded.order_number,
        customer_name = excluded.customer_name,
        table_number = excluded.table_number,
        bill_type = excluded.bill_type,
        subtotal = excluded.subtotal,
        tax_amount = excluded.tax_amount,
        discount_amount = excluded.discount_amount,
        total_amount = excluded.total_amount,
        status = excluded.status,
        payment_method = excluded.payment_method,
        created_by = excluded.created_by,
        created_at = excluded.created_at,
        updated_at = excluded.updated_at,
        synced = excluded.synced,
        sync_error = excluded.sync_error";

const INSERT_ITEM_SQL: &str = "INSERT INTO order_items (id, order_id, menu_item_id, menu_item_name, \
     quantity, unit_price, tax_percentage, tax_amount, total_price, notes, synced, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

const UPSERT_ITEM_SQL: &str = "INSERT INTO order_items (id, order_id, menu_item_id, menu_item_name, \
     quantity, unit_price, tax_percentage, tax_amount, total_price, notes, synced, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
     ON CONFLICT(id) DO UPDATE SET
        order_id = excluded.order_id,
        menu_item_id = excluded.menu_item_id,
        menu_item_name = COALESCE(excluded.menu_item_name, order_items.menu_item_name),
        quantity = excluded.quantity,
        unit_price = excluded.unit_price,
        tax_percentage = excluded.tax_percentage,
        tax_amount = excluded.tax_amount,
        total_price = excluded.total_price,
        notes = excluded.notes,
        synced = excluded.synced,
        created_at = excluded.created_at";

fn write_order(conn: &Connection, sql: &str, o: &Order) -> rusqlite::Result<usize> {
    conn.execute(
        sql,
        params![
            o.id,
            o.order_number,
            o.customer_name,
            o.table_number,
            o.bill_type,
            o.subtotal,
            o.tax_amount,
            o.discount_amount,
            o.total_amount,
            o.status,
            o.payment_method,
            o.created_by,
            o.created_at,
            o.updated_at,
            o.synced,
            o.sync_error,
        ],
    )
}

fn write_item(conn: &Connection, sql: &str, i: &OrderItem) -> rusqlite::Result<usize> {
    conn.execute(
        sql,
        params![
            i.id,
            i.order_id,
            i.menu_item_id,
            i.menu_item_name,
            i.quantity,
            i.unit_price,
            i.tax_percentage,
            i.tax_amount,
            i.total_price,
            i.notes,
            i.synced,
            i.created_at,
        ],
    )
}

fn load_items(conn: &Connection, order_id: &str) -> Result<Vec<OrderItem>, StoreError> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM order_items WHERE order_id = ?1 ORDER BY created_at, id");
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params![order_id], item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

fn load_order(conn: &Connection, id: &str) -> Result<Option<Order>, StoreError> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], order_from_row).optional()?)
}

/// Re-derive an order's totals from its item rows. Orders with no local
/// items keep the totals they arrived with.
fn recompute_totals(conn: &Connection, order_id: &str) -> Result<bool, StoreError> {
    let items = load_items(conn, order_id)?;
    if items.is_empty() {
        return Ok(false);
    }
    let Some(order) = load_order(conn, order_id)? else {
        return Ok(false);
    };
    let totals = OrderTotals::from_items(&items, order.discount_amount);
    if round2(order.total_amount) == totals.total_amount
        && round2(order.subtotal) == totals.subtotal
        && round2(order.tax_amount) == totals.tax_amount
    {
        return Ok(false);
    }
    warn!(
        order_id,
        stored_total = order.total_amount,
        derived_total = totals.total_amount,
        "order totals disagree with items, recomputing"
    );
    conn.execute(
        "UPDATE orders SET subtotal = ?2, tax_amount = ?3, total_amount = ?4 WHERE id = ?1",
        params![order_id, totals.subtotal, totals.tax_amount, totals.total_amount],
    )?;
    Ok(true)
}

/// An item still pointing at a menu item that only exists on this terminal
/// cannot be sent until that menu item has been pushed and remapped.
pub(crate) fn references_local_menu_item(item: &OrderItem) -> bool {
    EntityId::remote(item.menu_item_id.as_str()).is_local()
}

/// Look up the menu item name for an item that arrived without one.
fn resolve_item_name(conn: &Connection, item: &mut OrderItem) -> Result<(), StoreError> {
    if item.menu_item_name.is_none() {
        item.menu_item_name = conn
            .query_row(
                "SELECT name FROM menu_items WHERE id = ?1",
                params![item.menu_item_id],
                |row| row.get(0),
            )
            .optional()?;
    }
    Ok(())
}

/// Filters for order listings.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub date: Option<NaiveDate>,
    pub unsynced_only: bool,
}

// ---------------------------------------------------------------------------
// Local store operations
// ---------------------------------------------------------------------------

impl LocalStore {
    /// Write an order and its items as one unit.
    pub fn insert_order_with_items(&self, order: &Order, items: &[OrderItem]) -> Result<(), StoreError> {
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            write_order(&tx, INSERT_ORDER_SQL, order)
                .map_err(|e| db::insert_error(e, Table::Orders, order.id.as_str()))?;
            for item in items {
                write_item(&tx, INSERT_ITEM_SQL, item)
                    .map_err(|e| db::insert_error(e, Table::OrderItems, item.id.as_str()))?;
            }
            tx.commit()?;
        }
        let mut changes = vec![StoreChange::new(Table::Orders, order.id.as_str(), ChangeKind::Insert)];
        changes.extend(
            items
                .iter()
                .map(|i| StoreChange::new(Table::OrderItems, i.id.as_str(), ChangeKind::Insert)),
        );
        self.publish(changes);
        Ok(())
    }

    /// Mirror an order the backend just accepted. The realtime echo of the
    /// same insert may already have stored it, so existing rows are
    /// overwritten rather than rejected.
    pub fn mirror_created_order(&self, order: &Order, items: &[OrderItem]) -> Result<(), StoreError> {
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            write_order(&tx, UPSERT_ORDER_SQL, order)?;
            for item in items {
                write_item(&tx, UPSERT_ITEM_SQL, item)?;
            }
            tx.commit()?;
        }
        let mut changes = vec![StoreChange::new(Table::Orders, order.id.as_str(), ChangeKind::Insert)];
        changes.extend(
            items
                .iter()
                .map(|i| StoreChange::new(Table::OrderItems, i.id.as_str(), ChangeKind::Insert)),
        );
        self.publish(changes);
        Ok(())
    }

    pub fn get_order(&self, id: &str) -> Result<Option<Order>, StoreError> {
        let conn = self.lock()?;
        load_order(&conn, id)
    }

    pub fn order_items(&self, order_id: &str) -> Result<Vec<OrderItem>, StoreError> {
        let conn = self.lock()?;
        load_items(&conn, order_id)
    }

    pub fn get_order_with_items(&self, id: &str) -> Result<Option<OrderWithItems>, StoreError> {
        let conn = self.lock()?;
        let Some(order) = load_order(&conn, id)? else {
            return Ok(None);
        };
        let items = load_items(&conn, id)?;
        Ok(Some(OrderWithItems { order, items }))
    }

    /// Newest first.
    pub fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        let mut sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE 1 = 1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(status) = filter.status {
            args.push(Box::new(status));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(date) = filter.date {
            let (start, end) = local_day_bounds(date);
            args.push(Box::new(start));
            sql.push_str(&format!(" AND created_at >= ?{}", args.len()));
            args.push(Box::new(end));
            sql.push_str(&format!(" AND created_at < ?{}", args.len()));
        }
        if filter.unsynced_only {
            sql.push_str(" AND synced = 0");
        }
        sql.push_str(" ORDER BY created_at DESC, order_number DESC");

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let orders = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), order_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(orders)
    }

    /// Unsynced orders with their items, oldest first.
    pub fn unsynced_orders(&self) -> Result<Vec<OrderWithItems>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE synced = 0 ORDER BY created_at ASC");
        let mut stmt = conn.prepare(&sql)?;
        let orders = stmt
            .query_map([], order_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(orders.len());
        for order in orders {
            let items = load_items(&conn, order.id.as_str())?;
            out.push(OrderWithItems { order, items });
        }
        Ok(out)
    }

    /// Unsynced items whose parent order already carries a remote id; left
    /// behind when an item create failed after its order was created.
    pub fn stranded_order_items(&self) -> Result<Vec<OrderItem>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM order_items
             WHERE synced = 0
               AND order_id IN (SELECT id FROM orders WHERE synced = 1)
             ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map([], item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items
            .into_iter()
            .filter(|i| !i.order_id.is_local())
            .collect())
    }

    /// Replace every field of an existing order. Fails with `NotFound` when
    /// the id is unknown.
    pub fn update_order(&self, order: &Order) -> Result<(), StoreError> {
        {
            let conn = self.lock()?;
            let changed = conn.execute(
                "UPDATE orders SET order_number = ?2, customer_name = ?3, table_number = ?4,
                    bill_type = ?5, subtotal = ?6, tax_amount = ?7, discount_amount = ?8,
                    total_amount = ?9, status = ?10, payment_method = ?11, created_by = ?12,
                    created_at = ?13, updated_at = ?14, synced = ?15, sync_error = ?16
                 WHERE id = ?1",
                params![
                    order.id,
                    order.order_number,
                    order.customer_name,
                    order.table_number,
                    order.bill_type,
                    order.subtotal,
                    order.tax_amount,
                    order.discount_amount,
                    order.total_amount,
                    order.status,
                    order.payment_method,
                    order.created_by,
                    order.created_at,
                    order.updated_at,
                    order.synced,
                    order.sync_error,
                ],
            )?;
            db::expect_updated(changed, Table::Orders, order.id.as_str())?;
        }
        self.publish([StoreChange::new(Table::Orders, order.id.as_str(), ChangeKind::Update)]);
        Ok(())
    }

    /// Mark an order synced after a push, unless it changed again while the
    /// push was in flight. Returns whether it was marked.
    pub fn mark_order_pushed(&self, id: &str, pushed_updated_at: &str) -> Result<bool, StoreError> {
        let changed = {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE orders SET synced = 1, sync_error = NULL WHERE id = ?1 AND updated_at = ?2",
                params![id, pushed_updated_at],
            )?
        };
        if changed > 0 {
            self.publish([StoreChange::new(Table::Orders, id, ChangeKind::Update)]);
        }
        Ok(changed > 0)
    }

    /// Record a push failure; the row stays unsynced.
    pub fn mark_order_sync_error(&self, id: &str, error: &str) -> Result<(), StoreError> {
        {
            let conn = self.lock()?;
            let changed = conn.execute(
                "UPDATE orders SET synced = 0, sync_error = ?2 WHERE id = ?1",
                params![id, error],
            )?;
            db::expect_updated(changed, Table::Orders, id)?;
        }
        self.publish([StoreChange::new(Table::Orders, id, ChangeKind::Update)]);
        Ok(())
    }

    /// Re-key a pushed order from its local-origin id to the backend's id
    /// and number. Its items follow the new key. The order is marked synced
    /// unless it was edited after `pushed_updated_at`.
    pub fn remap_order(
        &self,
        old_id: &str,
        new_id: &str,
        order_number: i64,
        pushed_updated_at: &str,
    ) -> Result<(), StoreError> {
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let mut order =
                load_order(&tx, old_id)?.ok_or_else(|| StoreError::not_found("orders", old_id))?;
            order.id = EntityId::remote(new_id);
            order.order_number = order_number;
            order.synced = order.updated_at == pushed_updated_at;
            order.sync_error = None;
            write_order(&tx, INSERT_ORDER_SQL, &order)
                .map_err(|e| db::insert_error(e, Table::Orders, new_id))?;
            tx.execute(
                "UPDATE order_items SET order_id = ?2 WHERE order_id = ?1",
                params![old_id, new_id],
            )?;
            tx.execute("DELETE FROM orders WHERE id = ?1", params![old_id])?;
            tx.commit()?;
        }
        info!(old_id, new_id, order_number, "Remapped pushed order to remote id");
        self.publish([
            StoreChange::new(Table::Orders, old_id, ChangeKind::Delete),
            StoreChange::new(Table::Orders, new_id, ChangeKind::Insert),
        ]);
        Ok(())
    }

    /// Replace a pushed item row under its local id with the backend's id.
    pub fn remap_order_item(&self, old_id: &str, new_id: &str) -> Result<(), StoreError> {
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let sql = format!("SELECT {ITEM_COLUMNS} FROM order_items WHERE id = ?1");
            let mut item = tx
                .query_row(&sql, params![old_id], item_from_row)
                .optional()?
                .ok_or_else(|| StoreError::not_found("order_items", old_id))?;
            item.id = EntityId::remote(new_id);
            item.synced = true;
            tx.execute("DELETE FROM order_items WHERE id = ?1", params![old_id])?;
            write_item(&tx, UPSERT_ITEM_SQL, &item)?;
            tx.commit()?;
        }
        self.publish([
            StoreChange::new(Table::OrderItems, old_id, ChangeKind::Delete),
            StoreChange::new(Table::OrderItems, new_id, ChangeKind::Insert),
        ]);
        Ok(())
    }

    /// Highest order number held by a local-origin order.
    pub fn max_local_order_number(&self) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(order_number) FROM orders WHERE id LIKE 'local\\_%' ESCAPE '\\' OR id LIKE 'offline\\_%' ESCAPE '\\'",
            [],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    /// Apply pulled orders and items as synced, skipping every order that is
    /// unsynced locally (and its items). The sync state is re-checked per
    /// row inside the write transaction.
    pub fn upsert_remote_orders(
        &self,
        orders: Vec<Order>,
        items: Vec<OrderItem>,
    ) -> Result<ApplyCounts, StoreError> {
        let mut counts = ApplyCounts::default();
        let mut changes = Vec::new();
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let mut skipped: HashSet<String> = HashSet::new();
            let mut parents: HashSet<String> = HashSet::new();

            for mut order in orders {
                if db::row_synced_state(&tx, Table::Orders, order.id.as_str())? == Some(false) {
                    debug!(order_id = %order.id, "pull: keeping unsynced local order");
                    counts.skipped_unsynced += 1;
                    skipped.insert(order.id.to_string());
                    continue;
                }
                order.synced = true;
                order.sync_error = None;
                write_order(&tx, UPSERT_ORDER_SQL, &order)?;
                changes.push(StoreChange::new(Table::Orders, order.id.as_str(), ChangeKind::Update));
                counts.applied += 1;
            }

            for item in items {
                let order_id = item.order_id.to_string();
                if apply_remote_item(&tx, item, &skipped, &mut counts, &mut changes)? {
                    parents.insert(order_id);
                }
            }
            for order_id in parents {
                recompute_totals(&tx, &order_id)?;
            }
            tx.commit()?;
        }
        self.publish(changes);
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // Realtime application
    // -----------------------------------------------------------------------

    /// Insert a remote order if it is not present yet. Returns whether it
    /// was inserted.
    pub fn apply_remote_order_insert(&self, mut order: Order) -> Result<bool, StoreError> {
        {
            let conn = self.lock()?;
            if db::row_synced_state(&conn, Table::Orders, order.id.as_str())?.is_some() {
                return Ok(false);
            }
            order.synced = true;
            order.sync_error = None;
            write_order(&conn, INSERT_ORDER_SQL, &order)?;
        }
        self.publish([StoreChange::new(Table::Orders, order.id.as_str(), ChangeKind::Insert)]);
        Ok(true)
    }

    /// Patch status and `updated_at` from a remote update. Returns the
    /// previous status when the row was patched; `None` when the row is
    /// missing or has unpushed local changes.
    pub fn apply_remote_order_status(
        &self,
        id: &str,
        status: OrderStatus,
        updated_at: &str,
    ) -> Result<Option<OrderStatus>, StoreError> {
        let previous = {
            let conn = self.lock()?;
            let Some(order) = load_order(&conn, id)? else {
                return Ok(None);
            };
            if !order.synced {
                debug!(order_id = id, "realtime: keeping unsynced local order");
                return Ok(None);
            }
            conn.execute(
                "UPDATE orders SET status = ?2, updated_at = ?3, synced = 1 WHERE id = ?1",
                params![id, status, updated_at],
            )?;
            order.status
        };
        self.publish([StoreChange::new(Table::Orders, id, ChangeKind::Update)]);
        Ok(Some(previous))
    }

    /// Remove a synced order deleted remotely. Unsynced rows are kept.
    pub fn apply_remote_order_delete(&self, id: &str) -> Result<bool, StoreError> {
        self.delete_if_synced(Table::Orders, id)
    }

    /// Insert a remote item if absent and its order exists locally.
    pub fn apply_remote_order_item_insert(&self, item: OrderItem) -> Result<bool, StoreError> {
        let mut counts = ApplyCounts::default();
        let mut changes = Vec::new();
        let inserted = {
            let conn = self.lock()?;
            if db::row_synced_state(&conn, Table::OrderItems, item.id.as_str())?.is_some() {
                return Ok(false);
            }
            let order_id = item.order_id.to_string();
            let inserted = apply_remote_item(&conn, item, &HashSet::new(), &mut counts, &mut changes)?;
            if inserted {
                recompute_totals(&conn, &order_id)?;
                changes.push(StoreChange::new(Table::Orders, order_id, ChangeKind::Update));
            }
            inserted
        };
        self.publish(changes);
        Ok(inserted)
    }

    pub fn apply_remote_order_item_delete(&self, id: &str) -> Result<bool, StoreError> {
        self.delete_if_synced(Table::OrderItems, id)
    }

    pub(crate) fn delete_if_synced(&self, table: Table, id: &str) -> Result<bool, StoreError> {
        {
            let conn = self.lock()?;
            match db::row_synced_state(&conn, table, id)? {
                Some(true) => {
                    let sql = format!("DELETE FROM {} WHERE id = ?1", table.as_str());
                    conn.execute(&sql, params![id])?;
                }
                Some(false) => {
                    debug!(%table, id, "keeping unsynced row despite remote delete");
                    return Ok(false);
                }
                None => return Ok(false),
            }
        }
        self.publish([StoreChange::new(table, id, ChangeKind::Delete)]);
        Ok(true)
    }
}

/// Upsert one remote item unless it, or its order, is unsynced locally or
/// its order is missing. Returns whether the row was written.
fn apply_remote_item(
    conn: &Connection,
    mut item: OrderItem,
    skipped_orders: &HashSet<String>,
    counts: &mut ApplyCounts,
    changes: &mut Vec<StoreChange>,
) -> Result<bool, StoreError> {
    if skipped_orders.contains(item.order_id.as_str())
        || db::row_synced_state(conn, Table::OrderItems, item.id.as_str())? == Some(false)
    {
        counts.skipped_unsynced += 1;
        return Ok(false);
    }
    match db::row_synced_state(conn, Table::Orders, item.order_id.as_str())? {
        None => {
            debug!(item_id = %item.id, order_id = %item.order_id, "pull: item for unknown order, skipping");
            return Ok(false);
        }
        Some(false) => {
            counts.skipped_unsynced += 1;
            return Ok(false);
        }
        Some(true) => {}
    }
    resolve_item_name(conn, &mut item)?;
    item.synced = true;
    write_item(conn, UPSERT_ITEM_SQL, &item)?;
    changes.push(StoreChange::new(Table::OrderItems, item.id.as_str(), ChangeKind::Update));
    counts.applied += 1;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Order creation and status changes as invoked by the POS screens.
pub struct OrderWorkflow {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteBackend>,
    connectivity: Connectivity,
    sync: Arc<SyncEngine>,
    remote_timeout: Duration,
}

impl OrderWorkflow {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteBackend>,
        connectivity: Connectivity,
        sync: Arc<SyncEngine>,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            sync,
            remote_timeout,
        }
    }

    /// Create an order. Never fails because of connectivity: the worst case
    /// is an offline order flagged for the next push.
    pub async fn create_order(&self, draft: OrderDraft) -> Result<OrderWithItems, WorkflowError> {
        let (order, items) = self.build_order(&draft)?;

        let local_menu_refs = items.iter().any(references_local_menu_item);
        if local_menu_refs {
            debug!("order references a menu item not yet pushed, creating offline");
        }

        if self.connectivity.is_online() && !local_menu_refs {
            match self.create_online(&order, &items).await {
                Ok(created) => {
                    self.store.mirror_created_order(&created.order, &created.items)?;
                    info!(
                        order_id = %created.order.id,
                        order_number = created.order.order_number,
                        "Order created online"
                    );
                    return Ok(created);
                }
                Err(e) => {
                    warn!(error = %e, "Online order create failed, falling back to offline path");
                }
            }
        }

        self.create_offline(order, items)
    }

    fn create_offline(&self, mut order: Order, items: Vec<OrderItem>) -> Result<OrderWithItems, WorkflowError> {
        let max_local = self.store.max_local_order_number()?;
        order.order_number = max_local.max(OFFLINE_ORDER_NUMBER_BASE) + 1;
        order.synced = false;
        self.store.insert_order_with_items(&order, &items)?;
        info!(
            order_id = %order.id,
            order_number = order.order_number,
            items = items.len(),
            "Order created offline, pending sync"
        );

        if self.connectivity.is_online() {
            let sync = Arc::clone(&self.sync);
            tokio::spawn(async move {
                sync.run_full_sync(SyncTrigger::OfflineOrder).await;
            });
        }

        Ok(OrderWithItems { order, items })
    }

    /// Remote order first, then its items, returning the rows to mirror.
    /// Items whose create failed keep their local id and stay unsynced
    /// under the remote order id; the next push re-submits them.
    async fn create_online(&self, order: &Order, items: &[OrderItem]) -> Result<OrderWithItems, RemoteError> {
        let body = api::encode(&CreateOrderRequest::from(order))?;
        let created: CreatedOrder =
            api::decode(bounded(self.remote_timeout, self.remote.insert(Table::Orders, body)).await?)?;

        let mut mirrored = order.clone();
        mirrored.id = EntityId::remote(created.id);
        mirrored.order_number = created.order_number;
        mirrored.synced = true;
        mirrored.sync_error = None;

        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let mut item = item.clone();
            item.order_id = mirrored.id.clone();
            let result = match api::encode(&CreateOrderItemRequest::from(&item)) {
                Ok(body) => bounded(self.remote_timeout, self.remote.insert(Table::OrderItems, body))
                    .await
                    .and_then(api::decode::<CreatedRow>),
                Err(e) => Err(e),
            };
            match result {
                Ok(row) => {
                    item.id = EntityId::remote(row.id);
                    item.synced = true;
                }
                Err(e) => {
                    warn!(order_id = %mirrored.id, item_id = %item.id, error = %e, "Order item create failed, leaving for next push");
                    item.synced = false;
                }
            }
            out.push(item);
        }

        Ok(OrderWithItems {
            order: mirrored,
            items: out,
        })
    }

    /// Validate the draft against the local menu and compute every amount.
    fn build_order(&self, draft: &OrderDraft) -> Result<(Order, Vec<OrderItem>), WorkflowError> {
        if draft.items.is_empty() {
            return Err(WorkflowError::EmptyOrder);
        }
        if draft.discount_amount < 0.0 {
            return Err(WorkflowError::Validation("discount cannot be negative".into()));
        }

        let now = now_iso();
        let order_id = EntityId::mint_local();
        let mut items = Vec::with_capacity(draft.items.len());
        for line in &draft.items {
            if line.quantity <= 0 {
                return Err(WorkflowError::Validation(format!(
                    "quantity for {} must be positive",
                    line.menu_item_id
                )));
            }
            let menu_item = self
                .store
                .get_menu_item(&line.menu_item_id)?
                .ok_or_else(|| WorkflowError::Validation(format!("menu item not found: {}", line.menu_item_id)))?;
            if !menu_item.is_available {
                return Err(WorkflowError::Validation(format!(
                    "{} is not available",
                    menu_item.name
                )));
            }
            let (tax_amount, total_price) =
                line_amounts(line.quantity, menu_item.price, menu_item.tax_percentage, draft.bill_type);
            items.push(OrderItem {
                id: EntityId::mint_local(),
                order_id: order_id.clone(),
                menu_item_id: menu_item.id.to_string(),
                menu_item_name: Some(menu_item.name.clone()),
                quantity: line.quantity,
                unit_price: menu_item.price,
                tax_percentage: menu_item.tax_percentage,
                tax_amount,
                total_price,
                notes: line.notes.clone(),
                synced: false,
                created_at: now.clone(),
            });
        }

        let totals = OrderTotals::from_items(&items, draft.discount_amount);
        if totals.total_amount < 0.0 {
            return Err(WorkflowError::Validation("discount exceeds order total".into()));
        }

        let order = Order {
            id: order_id,
            order_number: 0,
            customer_name: draft.customer_name.clone(),
            table_number: draft.table_number.clone(),
            bill_type: draft.bill_type,
            subtotal: totals.subtotal,
            tax_amount: totals.tax_amount,
            discount_amount: round2(draft.discount_amount),
            total_amount: totals.total_amount,
            status: OrderStatus::Pending,
            payment_method: draft.payment_method.clone(),
            created_by: draft.created_by.clone(),
            created_at: now.clone(),
            updated_at: now,
            synced: false,
            sync_error: None,
        };
        Ok((order, items))
    }

    /// Move an order along `pending -> preparing -> ready -> completed` (or
    /// `pending -> cancelled`). Remote-origin orders are patched remotely
    /// first when online; any failure leaves the change local and unsynced.
    pub async fn update_status(&self, order_id: &str, next: OrderStatus) -> Result<Order, WorkflowError> {
        let mut order = self
            .store
            .get_order(order_id)?
            .ok_or_else(|| StoreError::not_found("orders", order_id))?;
        if !order.status.can_transition_to(next) {
            return Err(WorkflowError::InvalidTransition {
                from: order.status,
                to: next,
            });
        }

        order.status = next;
        order.updated_at = now_iso();
        order.synced = false;

        if !order.id.is_local() && self.connectivity.is_online() {
            let body = serde_json::to_value(OrderUpdateRequest::from(&order)).map_err(StoreError::from)?;
            let pushed = bounded(
                self.remote_timeout,
                self.remote.update(Table::Orders, order.id.as_str(), body.clone()),
            )
            .await;
            match pushed {
                Ok(_) => order.synced = true,
                Err(e) => {
                    warn!(order_id, error = %e, "Remote status update failed, queueing");
                    let mut payload = body;
                    if let Value::Object(ref mut fields) = payload {
                        fields.insert("id".into(), Value::String(order.id.to_string()));
                    }
                    self.store.enqueue(Table::Orders, OperationKind::Update, &payload)?;
                }
            }
        }

        self.store.update_order(&order)?;
        info!(order_id, status = %next, synced = order.synced, "Order status updated");
        Ok(order)
    }

    pub fn get_order(&self, order_id: &str) -> Result<Option<OrderWithItems>, StoreError> {
        self.store.get_order_with_items(order_id)
    }

    pub fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        self.store.list_orders(filter)
    }
}
