//! Inventory items: stock levels, adjustments and low-stock reads.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::CacheLayer;
use crate::db::{self, ApplyCounts, ChangeKind, LocalStore, StoreChange};
use crate::error::{StoreError, WorkflowError};
use crate::models::{now_iso, InventoryItem, Table};

pub const CACHE_PREFIX: &str = "inventory";
pub const CACHE_KEY_LOW_STOCK: &str = "inventory:lowStock";

const INVENTORY_COLUMNS: &str =
    "id, name, unit, current_stock, min_stock, cost_per_unit, is_active, synced, updated_at";

fn inventory_from_row(row: &Row<'_>) -> rusqlite::Result<InventoryItem> {
    Ok(InventoryItem {
        id: row.get(0)?,
        name: row.get(1)?,
        unit: row.get(2)?,
        current_stock: row.get(3)?,
        min_stock: row.get(4)?,
        cost_per_unit: row.get(5)?,
        is_active: row.get(6)?,
        synced: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn write_inventory_item(conn: &Connection, item: &InventoryItem) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO inventory_items (id, name, unit, current_stock, min_stock, cost_per_unit,
            is_active, synced, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            unit = excluded.unit,
            current_stock = excluded.current_stock,
            min_stock = excluded.min_stock,
            cost_per_unit = excluded.cost_per_unit,
            is_active = excluded.is_active,
            synced = excluded.synced,
            updated_at = excluded.updated_at",
        params![
            item.id,
            item.name,
            item.unit,
            item.current_stock,
            item.min_stock,
            item.cost_per_unit,
            item.is_active,
            item.synced,
            item.updated_at,
        ],
    )
}

pub(crate) fn load_inventory_item(conn: &Connection, id: &str) -> Result<Option<InventoryItem>, StoreError> {
    let sql = format!("SELECT {INVENTORY_COLUMNS} FROM inventory_items WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], inventory_from_row).optional()?)
}

/// Overwrite a stock level as an unpushed local change.
pub(crate) fn set_stock_local(conn: &Connection, id: &str, stock: f64, updated_at: &str) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE inventory_items SET current_stock = ?2, synced = 0, updated_at = ?3 WHERE id = ?1",
        params![id, stock, updated_at],
    )?;
    db::expect_updated(changed, Table::InventoryItems, id)
}

impl LocalStore {
    pub fn get_inventory_item(&self, id: &str) -> Result<Option<InventoryItem>, StoreError> {
        let conn = self.lock()?;
        load_inventory_item(&conn, id)
    }

    pub fn list_inventory(&self, active_only: bool) -> Result<Vec<InventoryItem>, StoreError> {
        let conn = self.lock()?;
        let filter = if active_only { "WHERE is_active = 1" } else { "" };
        let sql = format!("SELECT {INVENTORY_COLUMNS} FROM inventory_items {filter} ORDER BY name");
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map([], inventory_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Active items at or below their minimum stock.
    pub fn low_stock_items(&self) -> Result<Vec<InventoryItem>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventory_items
             WHERE is_active = 1 AND current_stock <= min_stock
             ORDER BY current_stock - min_stock, name"
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map([], inventory_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn set_inventory_stock(&self, id: &str, stock: f64) -> Result<(), StoreError> {
        {
            let conn = self.lock()?;
            set_stock_local(&conn, id, stock, &now_iso())?;
        }
        self.publish([StoreChange::new(Table::InventoryItems, id, ChangeKind::Update)]);
        Ok(())
    }

    pub fn unsynced_inventory(&self) -> Result<Vec<InventoryItem>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {INVENTORY_COLUMNS} FROM inventory_items WHERE synced = 0 ORDER BY updated_at");
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map([], inventory_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Mark pushed stock synced unless it was adjusted meanwhile.
    pub fn mark_inventory_pushed(&self, id: &str, pushed_updated_at: &str) -> Result<bool, StoreError> {
        let changed = {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE inventory_items SET synced = 1 WHERE id = ?1 AND updated_at = ?2",
                params![id, pushed_updated_at],
            )?
        };
        if changed > 0 {
            self.publish([StoreChange::new(Table::InventoryItems, id, ChangeKind::Update)]);
        }
        Ok(changed > 0)
    }

    /// Apply pulled inventory rows as synced, keeping unpushed local stock.
    pub fn upsert_remote_inventory(&self, items: Vec<InventoryItem>) -> Result<ApplyCounts, StoreError> {
        let mut counts = ApplyCounts::default();
        let mut changes = Vec::new();
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            for mut item in items {
                if db::row_synced_state(&tx, Table::InventoryItems, item.id.as_str())? == Some(false) {
                    debug!(item_id = %item.id, "pull: keeping unsynced local stock");
                    counts.skipped_unsynced += 1;
                    continue;
                }
                item.synced = true;
                write_inventory_item(&tx, &item)?;
                changes.push(StoreChange::new(Table::InventoryItems, item.id.as_str(), ChangeKind::Update));
                counts.applied += 1;
            }
            tx.commit()?;
        }
        self.publish(changes);
        Ok(counts)
    }

    /// Realtime insert or update of one inventory row. Returns whether it
    /// was applied.
    pub fn apply_remote_inventory_item(&self, item: InventoryItem) -> Result<bool, StoreError> {
        Ok(self.upsert_remote_inventory(vec![item])?.applied == 1)
    }

    pub fn apply_remote_inventory_delete(&self, id: &str) -> Result<bool, StoreError> {
        self.delete_if_synced(Table::InventoryItems, id)
    }
}

pub struct InventoryService {
    store: Arc<LocalStore>,
    cache: Arc<CacheLayer>,
}

impl InventoryService {
    pub fn new(store: Arc<LocalStore>, cache: Arc<CacheLayer>) -> Self {
        Self { store, cache }
    }

    pub fn list(&self) -> Result<Vec<InventoryItem>, StoreError> {
        self.store.list_inventory(true)
    }

    pub fn low_stock(&self) -> Result<Vec<InventoryItem>, StoreError> {
        if let Some(items) = self.cache.get::<Vec<InventoryItem>>(CACHE_KEY_LOW_STOCK) {
            return Ok(items);
        }
        let items = self.store.low_stock_items()?;
        self.cache.set(CACHE_KEY_LOW_STOCK, &items);
        Ok(items)
    }

    /// Add `delta` (negative to consume) to an item's stock. Stock never
    /// goes below zero.
    pub fn adjust_stock(&self, id: &str, delta: f64) -> Result<InventoryItem, WorkflowError> {
        if !delta.is_finite() {
            return Err(WorkflowError::Validation("stock delta must be a number".into()));
        }
        let mut item = self
            .store
            .get_inventory_item(id)?
            .ok_or_else(|| StoreError::not_found("inventory_items", id))?;
        let next = item.current_stock + delta;
        if next < 0.0 {
            return Err(WorkflowError::Validation(format!(
                "{} has only {} {} in stock",
                item.name, item.current_stock, item.unit
            )));
        }
        self.store.set_inventory_stock(id, next)?;
        self.cache.invalidate_prefix(CACHE_PREFIX);
        item.current_stock = next;
        item.synced = false;
        if item.is_low_stock() {
            info!(item_id = id, stock = next, min = item.min_stock, "Inventory item is low on stock");
        }
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SystemClock;
    use crate::config::CacheTtls;
    use crate::models::EntityId;

    fn item(id: &str, stock: f64, min: f64) -> InventoryItem {
        InventoryItem {
            id: EntityId::remote(id),
            name: id.to_uppercase(),
            unit: "kg".into(),
            current_stock: stock,
            min_stock: min,
            cost_per_unit: 12.5,
            is_active: true,
            synced: true,
            updated_at: now_iso(),
        }
    }

    fn service() -> (InventoryService, Arc<LocalStore>) {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let cache = Arc::new(CacheLayer::in_memory(CacheTtls::default(), Arc::new(SystemClock)));
        store
            .upsert_remote_inventory(vec![item("rice", 20.0, 5.0), item("oil", 2.0, 3.0)])
            .unwrap();
        (InventoryService::new(store.clone(), cache), store)
    }

    #[test]
    fn test_adjust_marks_unsynced_and_refreshes_low_stock() {
        let (svc, store) = service();
        assert_eq!(svc.low_stock().unwrap().len(), 1);

        let rice = svc.adjust_stock("rice", -16.0).unwrap();
        assert_eq!(rice.current_stock, 4.0);
        assert!(!store.get_inventory_item("rice").unwrap().unwrap().synced);
        assert_eq!(svc.low_stock().unwrap().len(), 2);
    }

    #[test]
    fn test_adjust_cannot_go_negative() {
        let (svc, store) = service();
        assert!(svc.adjust_stock("oil", -5.0).is_err());
        assert_eq!(store.get_inventory_item("oil").unwrap().unwrap().current_stock, 2.0);
        assert!(matches!(
            svc.adjust_stock("ghee", 1.0),
            Err(WorkflowError::Store(StoreError::NotFound { .. }))
        ));
    }

    #[test]
    fn test_pull_and_realtime_keep_unsynced_stock() {
        let (svc, store) = service();
        svc.adjust_stock("rice", 5.0).unwrap();

        let counts = store.upsert_remote_inventory(vec![item("rice", 1.0, 5.0)]).unwrap();
        assert_eq!(counts.skipped_unsynced, 1);
        assert!(!store.apply_remote_inventory_delete("rice").unwrap());
        assert_eq!(store.get_inventory_item("rice").unwrap().unwrap().current_stock, 25.0);

        assert!(store.apply_remote_inventory_delete("oil").unwrap());
        assert!(store.get_inventory_item("oil").unwrap().is_none());
    }
}
