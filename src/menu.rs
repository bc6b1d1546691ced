//! Menu items: local table, cached availability reads and offline editing.
//!
//! The POS screens read the available menu through the cache layer
//! (`menuItems:available`); every local change and every pull invalidates
//! the `menuItems` prefix. Admin edits are written locally with
//! `synced = false` and pushed by the sync engine.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{bounded, RemoteBackend};
use crate::cache::CacheLayer;
use crate::connectivity::Connectivity;
use crate::db::{self, ApplyCounts, ChangeKind, LocalStore, StoreChange};
use crate::error::{RemoteError, StoreError, WorkflowError};
use crate::models::{now_iso, round2, EntityId, MenuItem, Table};
use crate::queue::OperationKind;

pub const CACHE_PREFIX: &str = "menuItems";
pub const CACHE_KEY_AVAILABLE: &str = "menuItems:available";

const MENU_COLUMNS: &str = "id, name, description, category, price, tax_percentage, is_available, \
     is_vegetarian, display_order, synced, updated_at";

const UPSERT_MENU_SQL: &str = "INSERT INTO menu_items (id, name, description, category, price, \
     tax_percentage, is_available, is_vegetarian, display_order, synced, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
     ON CONFLICT(id) DO UPDATE SET
        name = excluded.name,
        description = excluded.description,
        category = excluded.category,
        price = excluded.price,
        tax_percentage = excluded.tax_percentage,
        is_available = excluded.is_available,
        is_vegetarian = excluded.is_vegetarian,
        display_order = excluded.display_order,
        synced = excluded.synced,
        updated_at = excluded.updated_at";

fn menu_item_from_row(row: &Row<'_>) -> rusqlite::Result<MenuItem> {
    Ok(MenuItem {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        category: row.get(3)?,
        price: row.get(4)?,
        tax_percentage: row.get(5)?,
        is_available: row.get(6)?,
        is_vegetarian: row.get(7)?,
        display_order: row.get(8)?,
        synced: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn write_menu_item(conn: &Connection, item: &MenuItem) -> rusqlite::Result<usize> {
    conn.execute(
        UPSERT_MENU_SQL,
        params![
            item.id,
            item.name,
            item.description,
            item.category,
            item.price,
            item.tax_percentage,
            item.is_available,
            item.is_vegetarian,
            item.display_order,
            item.synced,
            item.updated_at,
        ],
    )
}

impl LocalStore {
    /// Insert a new menu item; fails with `AlreadyExists` on a duplicate id.
    pub fn insert_menu_item(&self, item: &MenuItem) -> Result<(), StoreError> {
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO menu_items (id, name, description, category, price, tax_percentage,
                    is_available, is_vegetarian, display_order, synced, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    item.id,
                    item.name,
                    item.description,
                    item.category,
                    item.price,
                    item.tax_percentage,
                    item.is_available,
                    item.is_vegetarian,
                    item.display_order,
                    item.synced,
                    item.updated_at,
                ],
            )
            .map_err(|e| db::insert_error(e, Table::MenuItems, item.id.as_str()))?;
        }
        self.publish([StoreChange::new(Table::MenuItems, item.id.as_str(), ChangeKind::Insert)]);
        Ok(())
    }

    pub fn get_menu_item(&self, id: &str) -> Result<Option<MenuItem>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {MENU_COLUMNS} FROM menu_items WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], menu_item_from_row).optional()?)
    }

    /// Menu in display order, grouped by category.
    pub fn list_menu_items(&self, available_only: bool) -> Result<Vec<MenuItem>, StoreError> {
        let conn = self.lock()?;
        let filter = if available_only { "WHERE is_available = 1" } else { "" };
        let sql = format!(
            "SELECT {MENU_COLUMNS} FROM menu_items {filter} ORDER BY category, display_order, name"
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map([], menu_item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Replace an existing menu item; `NotFound` when the id is unknown.
    pub fn update_menu_item(&self, item: &MenuItem) -> Result<(), StoreError> {
        {
            let conn = self.lock()?;
            let changed = conn.execute(
                "UPDATE menu_items SET name = ?2, description = ?3, category = ?4, price = ?5,
                    tax_percentage = ?6, is_available = ?7, is_vegetarian = ?8,
                    display_order = ?9, synced = ?10, updated_at = ?11
                 WHERE id = ?1",
                params![
                    item.id,
                    item.name,
                    item.description,
                    item.category,
                    item.price,
                    item.tax_percentage,
                    item.is_available,
                    item.is_vegetarian,
                    item.display_order,
                    item.synced,
                    item.updated_at,
                ],
            )?;
            db::expect_updated(changed, Table::MenuItems, item.id.as_str())?;
        }
        self.publish([StoreChange::new(Table::MenuItems, item.id.as_str(), ChangeKind::Update)]);
        Ok(())
    }

    pub fn unsynced_menu_items(&self) -> Result<Vec<MenuItem>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {MENU_COLUMNS} FROM menu_items WHERE synced = 0 ORDER BY updated_at");
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map([], menu_item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Mark a pushed menu item synced unless it was edited meanwhile.
    pub fn mark_menu_item_pushed(&self, id: &str, pushed_updated_at: &str) -> Result<bool, StoreError> {
        let changed = {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE menu_items SET synced = 1 WHERE id = ?1 AND updated_at = ?2",
                params![id, pushed_updated_at],
            )?
        };
        if changed > 0 {
            self.publish([StoreChange::new(Table::MenuItems, id, ChangeKind::Update)]);
        }
        Ok(changed > 0)
    }

    /// Re-key a pushed menu item and every order line that references it.
    pub fn remap_menu_item(&self, old_id: &str, new_id: &str, pushed_updated_at: &str) -> Result<(), StoreError> {
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE menu_items SET id = ?2, synced = (updated_at = ?3) WHERE id = ?1",
                params![old_id, new_id, pushed_updated_at],
            )?;
            db::expect_updated(changed, Table::MenuItems, old_id)?;
            tx.execute(
                "UPDATE order_items SET menu_item_id = ?2 WHERE menu_item_id = ?1",
                params![old_id, new_id],
            )?;
            tx.commit()?;
        }
        self.publish([
            StoreChange::new(Table::MenuItems, old_id, ChangeKind::Delete),
            StoreChange::new(Table::MenuItems, new_id, ChangeKind::Insert),
        ]);
        Ok(())
    }

    /// Apply pulled menu rows as synced. Rows with unpushed local edits win.
    pub fn upsert_remote_menu_items(&self, items: Vec<MenuItem>) -> Result<ApplyCounts, StoreError> {
        let mut counts = ApplyCounts::default();
        let mut changes = Vec::new();
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            for mut item in items {
                if db::row_synced_state(&tx, Table::MenuItems, item.id.as_str())? == Some(false) {
                    debug!(menu_item_id = %item.id, "pull: keeping unsynced local menu item");
                    counts.skipped_unsynced += 1;
                    continue;
                }
                item.synced = true;
                write_menu_item(&tx, &item)?;
                changes.push(StoreChange::new(Table::MenuItems, item.id.as_str(), ChangeKind::Update));
                counts.applied += 1;
            }
            tx.commit()?;
        }
        self.publish(changes);
        Ok(counts)
    }
}

/// Fields an admin edits on a menu item.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MenuItemDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: String,
    pub price: f64,
    #[serde(default)]
    pub tax_percentage: f64,
    #[serde(default)]
    pub is_vegetarian: bool,
    #[serde(default)]
    pub display_order: i64,
}

impl MenuItemDraft {
    fn validate(&self) -> Result<(), WorkflowError> {
        if self.name.trim().is_empty() {
            return Err(WorkflowError::Validation("menu item name is required".into()));
        }
        if self.price.is_nan() || self.price < 0.0 {
            return Err(WorkflowError::Validation("price cannot be negative".into()));
        }
        if !(0.0..=100.0).contains(&self.tax_percentage) {
            return Err(WorkflowError::Validation("tax percentage must be between 0 and 100".into()));
        }
        Ok(())
    }

    fn apply_to(&self, item: &mut MenuItem) {
        item.name = self.name.trim().to_string();
        item.description = self.description.clone();
        item.category = self.category.clone();
        item.price = round2(self.price);
        item.tax_percentage = self.tax_percentage;
        item.is_vegetarian = self.is_vegetarian;
        item.display_order = self.display_order;
    }
}

pub struct MenuService {
    store: Arc<LocalStore>,
    cache: Arc<CacheLayer>,
    remote: Arc<dyn RemoteBackend>,
    connectivity: Connectivity,
    remote_timeout: Duration,
}

impl MenuService {
    pub fn new(
        store: Arc<LocalStore>,
        cache: Arc<CacheLayer>,
        remote: Arc<dyn RemoteBackend>,
        connectivity: Connectivity,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            remote,
            connectivity,
            remote_timeout,
        }
    }

    /// Items currently orderable, served from the cache when fresh.
    pub fn available_menu_items(&self) -> Result<Vec<MenuItem>, StoreError> {
        if let Some(items) = self.cache.get::<Vec<MenuItem>>(CACHE_KEY_AVAILABLE) {
            return Ok(items);
        }
        let items = self.store.list_menu_items(true)?;
        self.cache.set(CACHE_KEY_AVAILABLE, &items);
        Ok(items)
    }

    /// Full menu for the admin screen; always read from the store.
    pub fn all_menu_items(&self) -> Result<Vec<MenuItem>, StoreError> {
        self.store.list_menu_items(false)
    }

    pub fn create_menu_item(&self, draft: &MenuItemDraft) -> Result<MenuItem, WorkflowError> {
        draft.validate()?;
        let mut item = MenuItem {
            id: EntityId::mint_local(),
            name: String::new(),
            description: None,
            category: String::new(),
            price: 0.0,
            tax_percentage: 0.0,
            is_available: true,
            is_vegetarian: false,
            display_order: 0,
            synced: false,
            updated_at: now_iso(),
        };
        draft.apply_to(&mut item);
        self.store.insert_menu_item(&item)?;
        self.cache.invalidate_prefix(CACHE_PREFIX);
        info!(menu_item_id = %item.id, name = %item.name, "Menu item created locally");
        Ok(item)
    }

    pub fn update_menu_item(&self, id: &str, draft: &MenuItemDraft) -> Result<MenuItem, WorkflowError> {
        draft.validate()?;
        let mut item = self
            .store
            .get_menu_item(id)?
            .ok_or_else(|| StoreError::not_found("menu_items", id))?;
        draft.apply_to(&mut item);
        item.synced = false;
        item.updated_at = now_iso();
        self.store.update_menu_item(&item)?;
        self.cache.invalidate_prefix(CACHE_PREFIX);
        Ok(item)
    }

    pub fn set_availability(&self, id: &str, available: bool) -> Result<MenuItem, WorkflowError> {
        let mut item = self
            .store
            .get_menu_item(id)?
            .ok_or_else(|| StoreError::not_found("menu_items", id))?;
        item.is_available = available;
        item.synced = false;
        item.updated_at = now_iso();
        self.store.update_menu_item(&item)?;
        self.cache.invalidate_prefix(CACHE_PREFIX);
        info!(menu_item_id = id, available, "Menu item availability changed");
        Ok(item)
    }

    /// Delete locally, then remotely. A remote delete that cannot happen now
    /// is queued for replay at the next push. Items that never reached the
    /// backend are only deleted locally.
    pub async fn delete_menu_item(&self, id: &str) -> Result<bool, WorkflowError> {
        let existed = self.store.delete_row(Table::MenuItems, id)?;
        self.cache.invalidate_prefix(CACHE_PREFIX);
        if EntityId::from(id).is_local() {
            return Ok(existed);
        }

        let result = if self.connectivity.is_online() {
            bounded(self.remote_timeout, self.remote.delete(Table::MenuItems, id)).await
        } else {
            Err(RemoteError::Network("offline".into()))
        };
        if let Err(e) = result {
            warn!(menu_item_id = id, error = %e, "Remote menu delete deferred");
            self.store
                .enqueue(Table::MenuItems, OperationKind::Delete, &json!({ "id": id }))?;
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::config::CacheTtls;
    use crate::models::{BillType, Order, OrderItem, OrderStatus};
    use crate::testing::MemoryBackend;
    use chrono::Utc;

    fn service(online: bool) -> (MenuService, Arc<LocalStore>, Arc<MemoryBackend>, Arc<ManualClock>) {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(CacheLayer::in_memory(CacheTtls::default(), clock.clone()));
        let remote = Arc::new(MemoryBackend::new());
        let svc = MenuService::new(
            store.clone(),
            cache,
            remote.clone(),
            Connectivity::new(online),
            Duration::from_secs(1),
        );
        (svc, store, remote, clock)
    }

    fn draft(name: &str, price: f64) -> MenuItemDraft {
        MenuItemDraft {
            name: name.into(),
            category: "mains".into(),
            price,
            tax_percentage: 5.0,
            ..MenuItemDraft::default()
        }
    }

    #[test]
    fn test_create_is_local_and_unsynced() {
        let (svc, store, _, _) = service(false);
        let item = svc.create_menu_item(&draft("Idli", 40.0)).unwrap();
        assert!(item.id.is_local());
        assert!(!item.synced);
        assert_eq!(store.unsynced_menu_items().unwrap().len(), 1);
    }

    #[test]
    fn test_validation_rejects_bad_drafts() {
        let (svc, _, _, _) = service(false);
        assert!(svc.create_menu_item(&draft("  ", 10.0)).is_err());
        assert!(svc.create_menu_item(&draft("Vada", -1.0)).is_err());
    }

    #[test]
    fn test_available_menu_is_cached_and_invalidated() {
        let (svc, store, _, _) = service(false);
        let idli = svc.create_menu_item(&draft("Idli", 40.0)).unwrap();
        assert_eq!(svc.available_menu_items().unwrap().len(), 1);

        // A write that bypasses the service is not seen until the entry is invalidated.
        let mut hidden = idli.clone();
        hidden.id = EntityId::remote("m-2");
        hidden.name = "Vada".into();
        store.insert_menu_item(&hidden).unwrap();
        assert_eq!(svc.available_menu_items().unwrap().len(), 1);

        svc.set_availability(idli.id.as_str(), false).unwrap();
        let available = svc.available_menu_items().unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].name, "Vada");
    }

    #[test]
    fn test_cached_menu_expires_after_ttl() {
        let (svc, store, _, clock) = service(false);
        svc.create_menu_item(&draft("Idli", 40.0)).unwrap();
        assert_eq!(svc.available_menu_items().unwrap().len(), 1);

        let mut extra = store.list_menu_items(false).unwrap()[0].clone();
        extra.id = EntityId::remote("m-extra");
        store.insert_menu_item(&extra).unwrap();

        clock.advance(Duration::from_secs(31 * 60));
        assert_eq!(svc.available_menu_items().unwrap().len(), 2);
    }

    #[test]
    fn test_remap_rewrites_order_line_references() {
        let store = LocalStore::open_in_memory().unwrap();
        let item = MenuItem {
            id: EntityId::mint_local(),
            name: "Poha".into(),
            description: None,
            category: "breakfast".into(),
            price: 30.0,
            tax_percentage: 0.0,
            is_available: true,
            is_vegetarian: true,
            display_order: 1,
            synced: false,
            updated_at: now_iso(),
        };
        store.insert_menu_item(&item).unwrap();

        let order_id = EntityId::mint_local();
        let order = Order {
            id: order_id.clone(),
            order_number: 900_001,
            customer_name: None,
            table_number: Some("T1".into()),
            bill_type: BillType::Estimate,
            subtotal: 60.0,
            tax_amount: 0.0,
            discount_amount: 0.0,
            total_amount: 60.0,
            status: OrderStatus::Pending,
            payment_method: None,
            created_by: None,
            created_at: now_iso(),
            updated_at: now_iso(),
            synced: false,
            sync_error: None,
        };
        let line = OrderItem {
            id: EntityId::mint_local(),
            order_id: order_id.clone(),
            menu_item_id: item.id.to_string(),
            menu_item_name: Some("Poha".into()),
            quantity: 2,
            unit_price: 30.0,
            tax_percentage: 0.0,
            tax_amount: 0.0,
            total_price: 60.0,
            notes: None,
            synced: false,
            created_at: now_iso(),
        };
        store.insert_order_with_items(&order, &[line]).unwrap();

        store
            .remap_menu_item(item.id.as_str(), "m-remote", &item.updated_at)
            .unwrap();
        let remapped = store.get_menu_item("m-remote").unwrap().unwrap();
        assert!(remapped.synced);
        assert!(store.get_menu_item(item.id.as_str()).unwrap().is_none());

        let lines = store.order_items(order_id.as_str()).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].menu_item_id, "m-remote");
        assert!(!lines[0].synced);
    }

    #[test]
    fn test_pull_keeps_unsynced_local_edit() {
        let (svc, store, _, _) = service(false);
        let mut remote_row = MenuItem {
            id: EntityId::remote("m-1"),
            name: "Upma".into(),
            description: None,
            category: "breakfast".into(),
            price: 35.0,
            tax_percentage: 0.0,
            is_available: true,
            is_vegetarian: true,
            display_order: 0,
            synced: true,
            updated_at: now_iso(),
        };
        store.upsert_remote_menu_items(vec![remote_row.clone()]).unwrap();
        svc.update_menu_item("m-1", &draft("Upma Special", 45.0)).unwrap();

        remote_row.price = 99.0;
        let counts = store.upsert_remote_menu_items(vec![remote_row]).unwrap();
        assert_eq!(counts.skipped_unsynced, 1);
        assert_eq!(store.get_menu_item("m-1").unwrap().unwrap().price, 45.0);
    }

    #[tokio::test]
    async fn test_offline_delete_is_queued() {
        let (svc, store, remote, _) = service(false);
        store
            .upsert_remote_menu_items(vec![MenuItem {
                id: EntityId::remote("m-9"),
                name: "Lassi".into(),
                description: None,
                category: "drinks".into(),
                price: 60.0,
                tax_percentage: 5.0,
                is_available: true,
                is_vegetarian: true,
                display_order: 0,
                synced: true,
                updated_at: now_iso(),
            }])
            .unwrap();

        assert!(svc.delete_menu_item("m-9").await.unwrap());
        assert!(store.get_menu_item("m-9").unwrap().is_none());
        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target_id(), Some("m-9"));
        assert_eq!(remote.call_count(), 0);
    }

    #[tokio::test]
    async fn test_local_only_item_delete_is_not_queued() {
        let (svc, store, _, _) = service(true);
        let item = svc.create_menu_item(&draft("Idli", 40.0)).unwrap();
        assert!(svc.delete_menu_item(item.id.as_str()).await.unwrap());
        assert_eq!(store.pending_count().unwrap(), 0);
    }
}
