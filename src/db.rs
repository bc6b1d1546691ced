//! Local SQLite store for the POS sync core.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! the change bus that backs live queries, and the managed `LocalStore`
//! shared by the workflows, the sync engine and the realtime listener.
//! Entity-specific reads and writes live next to their workflows
//! (`orders`, `menu`, `inventory`, `closings`, `queue`).

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::models::Table;

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Capacity of the change bus. Slow subscribers see `Lagged` and re-query.
const CHANGE_BUS_CAPACITY: usize = 512;

const SETTINGS_SYNC: &str = "sync";
const SETTING_LAST_SYNC_AT: &str = "last_sync_at";

/// What happened to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Published on the change bus after every committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub table: Table,
    pub id: String,
    pub kind: ChangeKind,
}

impl StoreChange {
    pub fn new(table: Table, id: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            table,
            id: id.into(),
            kind,
        }
    }
}

/// Unsynced row counts for the status indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnsyncedCounts {
    pub orders: i64,
    pub order_items: i64,
    pub menu_items: i64,
    pub inventory_items: i64,
    pub daily_closings: i64,
    pub pending_operations: i64,
}

impl UnsyncedCounts {
    pub fn total(&self) -> i64 {
        self.orders
            + self.menu_items
            + self.inventory_items
            + self.daily_closings
            + self.pending_operations
    }
}

/// The on-device store: one connection guarded by a mutex plus a broadcast
/// bus of committed changes.
pub struct LocalStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    changes: broadcast::Sender<StoreChange>,
}

impl LocalStore {
    /// Open the store at `{data_dir}/pos.db`.
    ///
    /// Creates the directory if needed, opens the connection, sets pragmas,
    /// and runs any pending migrations. On corruption or open failure,
    /// deletes the file and retries once.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)
            .map_err(|e| StoreError::Unavailable(format!("create data dir: {e}")))?;

        let db_path = data_dir.join("pos.db");
        info!("Opening local store at {}", db_path.display());

        let conn = match open_and_configure(&db_path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!(
                    "Local store open failed ({}), deleting and retrying once",
                    first_err
                );
                if db_path.exists() {
                    let _ = fs::remove_file(&db_path);
                    let _ = fs::remove_file(db_path.with_extension("db-wal"));
                    let _ = fs::remove_file(db_path.with_extension("db-shm"));
                }
                open_and_configure(&db_path).map_err(|e| {
                    StoreError::Unavailable(format!("open failed after retry: {e}"))
                })?
            }
        };

        run_migrations(&conn)?;
        info!("Local store initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(Self::from_connection(conn, db_path))
    }

    /// Fresh in-memory store with the full schema.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self::from_connection(conn, PathBuf::from(":memory:")))
    }

    fn from_connection(conn: Connection, db_path: PathBuf) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUS_CAPACITY);
        Self {
            conn: Mutex::new(conn),
            db_path,
            changes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Lock the connection. Never hold the guard across an `.await`.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Publish committed changes. Having no subscribers is not an error.
    pub(crate) fn publish<I>(&self, changes: I)
    where
        I: IntoIterator<Item = StoreChange>,
    {
        for change in changes {
            let _ = self.changes.send(change);
        }
    }

    /// Subscribe to every committed change.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Run `query` now and again after every committed change to one of
    /// `tables`, publishing each result on the returned watch channel.
    ///
    /// Must be called from inside a tokio runtime. The refresh task ends when
    /// every receiver is dropped.
    pub fn live_query<T, F>(
        self: &Arc<Self>,
        tables: &[Table],
        query: F,
    ) -> Result<watch::Receiver<T>, StoreError>
    where
        T: Send + Sync + 'static,
        F: Fn(&LocalStore) -> Result<T, StoreError> + Send + 'static,
    {
        let initial = query(self)?;
        let (tx, rx) = watch::channel(initial);
        let watched: HashSet<Table> = tables.iter().copied().collect();
        let mut changes = self.subscribe();
        let store = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let refresh = tokio::select! {
                    _ = tx.closed() => break,
                    received = changes.recv() => match received {
                        Ok(change) => watched.contains(&change.table),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "live query lagged behind change bus, refreshing");
                            true
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if !refresh {
                    continue;
                }
                match query(&store) {
                    Ok(value) => {
                        if tx.send(value).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "live query refresh failed"),
                }
            }
        });

        Ok(rx)
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub fn get_setting(&self, category: &str, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        get_setting(&conn, category, key)
    }

    pub fn set_setting(&self, category: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        set_setting(&conn, category, key, value)
    }

    /// Timestamp of the last successful full sync, if any.
    pub fn last_sync_at(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .get_setting(SETTINGS_SYNC, SETTING_LAST_SYNC_AT)?
            .filter(|v| !v.trim().is_empty()))
    }

    pub fn set_last_sync_at(&self, timestamp: &str) -> Result<(), StoreError> {
        self.set_setting(SETTINGS_SYNC, SETTING_LAST_SYNC_AT, timestamp)
    }

    // -----------------------------------------------------------------------
    // Sync bookkeeping
    // -----------------------------------------------------------------------

    pub fn unsynced_counts(&self) -> Result<UnsyncedCounts, StoreError> {
        let conn = self.lock()?;
        let count = |sql: &str| -> Result<i64, StoreError> {
            Ok(conn.query_row(sql, [], |row| row.get(0))?)
        };
        Ok(UnsyncedCounts {
            orders: count("SELECT COUNT(*) FROM orders WHERE synced = 0")?,
            order_items: count("SELECT COUNT(*) FROM order_items WHERE synced = 0")?,
            menu_items: count("SELECT COUNT(*) FROM menu_items WHERE synced = 0")?,
            inventory_items: count("SELECT COUNT(*) FROM inventory_items WHERE synced = 0")?,
            daily_closings: count("SELECT COUNT(*) FROM daily_closings WHERE synced = 0")?,
            pending_operations: count("SELECT COUNT(*) FROM pending_operations")?,
        })
    }

    /// Ids of rows in `table` currently marked unsynced.
    pub fn unsynced_ids(&self, table: Table) -> Result<HashSet<String>, StoreError> {
        let conn = self.lock()?;
        unsynced_ids(&conn, table)
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| StoreError::Migration(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Migration(format!("read schema version: {e}")))?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Local store schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating local store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        apply_migration(conn, 1, migrate_v1)?;
    }
    if current < 2 {
        apply_migration(conn, 2, migrate_v2)?;
    }

    Ok(())
}

/// Run one migration step and its version bump as a single transaction.
fn apply_migration<F>(conn: &Connection, version: i32, step: F) -> Result<(), StoreError>
where
    F: FnOnce(&Connection) -> Result<(), StoreError>,
{
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| StoreError::Migration(format!("v{version}: begin: {e}")))?;
    step(&tx)?;
    tx.commit()
        .map_err(|e| StoreError::Migration(format!("v{version}: commit: {e}")))
}

/// Migration v1: entity tables, settings.
fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        CREATE TABLE IF NOT EXISTS menu_items (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            category TEXT NOT NULL DEFAULT '',
            price REAL NOT NULL DEFAULT 0,
            tax_percentage REAL NOT NULL DEFAULT 0,
            is_available INTEGER NOT NULL DEFAULT 1,
            is_vegetarian INTEGER NOT NULL DEFAULT 0,
            display_order INTEGER NOT NULL DEFAULT 0,
            synced INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_menu_items_category ON menu_items(category);
        CREATE INDEX IF NOT EXISTS idx_menu_items_synced ON menu_items(synced);

        CREATE TABLE IF NOT EXISTS inventory_items (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            unit TEXT NOT NULL DEFAULT '',
            current_stock REAL NOT NULL DEFAULT 0,
            min_stock REAL NOT NULL DEFAULT 0,
            cost_per_unit REAL NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            synced INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_inventory_items_synced ON inventory_items(synced);

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            order_number INTEGER NOT NULL,
            customer_name TEXT,
            table_number TEXT,
            bill_type TEXT NOT NULL DEFAULT 'tax_invoice',
            subtotal REAL NOT NULL DEFAULT 0,
            tax_amount REAL NOT NULL DEFAULT 0,
            discount_amount REAL NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            payment_method TEXT,
            created_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0,
            sync_error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_orders_synced ON orders(synced);
        CREATE INDEX IF NOT EXISTS idx_orders_number ON orders(order_number);

        CREATE TABLE IF NOT EXISTS order_items (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            menu_item_id TEXT NOT NULL,
            menu_item_name TEXT,
            quantity INTEGER NOT NULL,
            unit_price REAL NOT NULL,
            tax_percentage REAL NOT NULL DEFAULT 0,
            tax_amount REAL NOT NULL DEFAULT 0,
            total_price REAL NOT NULL,
            notes TEXT,
            synced INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);
        CREATE INDEX IF NOT EXISTS idx_order_items_synced ON order_items(synced);

        CREATE TABLE IF NOT EXISTS daily_closings (
            id TEXT PRIMARY KEY,
            closing_date TEXT NOT NULL UNIQUE,
            submitted_by TEXT,
            total_orders INTEGER NOT NULL DEFAULT 0,
            total_revenue REAL NOT NULL DEFAULT 0,
            notes TEXT,
            synced INTEGER NOT NULL DEFAULT 0,
            sync_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_daily_closings_synced ON daily_closings(synced);

        CREATE TABLE IF NOT EXISTS stock_verifications (
            id TEXT PRIMARY KEY,
            closing_id TEXT NOT NULL REFERENCES daily_closings(id) ON DELETE CASCADE,
            inventory_item_id TEXT NOT NULL,
            system_stock REAL NOT NULL,
            physical_stock REAL NOT NULL,
            wastage REAL NOT NULL DEFAULT 0,
            variance REAL NOT NULL DEFAULT 0,
            notes TEXT,
            synced INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_stock_verifications_closing
            ON stock_verifications(closing_id);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        StoreError::Migration(format!("v1: {e}"))
    })?;

    info!("Applied migration v1 (entity tables)");
    Ok(())
}

/// Migration v2: pending operation queue.
fn migrate_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pending_operations (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            table_name TEXT NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('insert', 'update', 'delete')),
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        StoreError::Migration(format!("v2: {e}"))
    })?;

    info!("Applied migration v2 (pending_operations table)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
            params![category, key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row helpers shared by the entity modules
// ---------------------------------------------------------------------------

pub(crate) fn unsynced_ids(conn: &Connection, table: Table) -> Result<HashSet<String>, StoreError> {
    let sql = format!("SELECT id FROM {} WHERE synced = 0", table.as_str());
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

/// `Some(synced)` when the row exists.
pub(crate) fn row_synced_state(
    conn: &Connection,
    table: Table,
    id: &str,
) -> Result<Option<bool>, StoreError> {
    let sql = format!("SELECT synced FROM {} WHERE id = ?1", table.as_str());
    Ok(conn
        .query_row(&sql, params![id], |row| row.get::<_, bool>(0))
        .optional()?)
}

/// Map a failed INSERT to `AlreadyExists` when the primary key collided.
pub(crate) fn insert_error(err: rusqlite::Error, table: Table, id: &str) -> StoreError {
    if let rusqlite::Error::SqliteFailure(ref failure, _) = err {
        if failure.code == ErrorCode::ConstraintViolation
            && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        {
            return StoreError::AlreadyExists {
                table: table.as_str(),
                id: id.to_string(),
            };
        }
    }
    StoreError::Sqlite(err)
}

/// Ensure an UPDATE touched a row; updating a missing key is distinct from
/// inserting one.
pub(crate) fn expect_updated(changed: usize, table: Table, id: &str) -> Result<(), StoreError> {
    if changed == 0 {
        Err(StoreError::not_found(table.as_str(), id))
    } else {
        Ok(())
    }
}

/// Outcome of applying a batch of remote rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyCounts {
    pub applied: usize,
    pub skipped_unsynced: usize,
}

impl ApplyCounts {
    pub fn merge(&mut self, other: ApplyCounts) {
        self.applied += other.applied;
        self.skipped_unsynced += other.skipped_unsynced;
    }
}

impl LocalStore {
    /// Delete a row by id from any entity table. Returns whether a row existed.
    pub fn delete_row(&self, table: Table, id: &str) -> Result<bool, StoreError> {
        let changed = {
            let conn = self.lock()?;
            let sql = format!("DELETE FROM {} WHERE id = ?1", table.as_str());
            conn.execute(&sql, params![id])?
        };
        if changed > 0 {
            self.publish([StoreChange::new(table, id, ChangeKind::Delete)]);
        }
        Ok(changed > 0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for expected in [
            "local_settings",
            "menu_items",
            "inventory_items",
            "orders",
            "order_items",
            "daily_closings",
            "stock_verifications",
            "pending_operations",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_failed_migration_step_rolls_back() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let result = apply_migration(&conn, 3, |tx| {
            tx.execute_batch(
                "CREATE TABLE half_done (id TEXT PRIMARY KEY);
                 INSERT INTO schema_version (version) VALUES (3);",
            )?;
            Err(StoreError::Migration("v3: boom".into()))
        });
        assert!(matches!(result, Err(StoreError::Migration(_))));
        assert!(!table_names(&conn).contains(&"half_done".to_string()));
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_unreadable_schema_version_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_version (version TEXT, applied_at TEXT);
             INSERT INTO schema_version (version) VALUES ('not-a-number');",
        )
        .unwrap();
        let err = run_migrations(&conn).unwrap_err();
        assert!(matches!(err, StoreError::Migration(ref m) if m.contains("schema version")));
        assert!(!table_names(&conn).contains(&"orders".to_string()));
    }

    #[test]
    fn test_last_sync_setting_roundtrip() {
        let store = LocalStore::open_in_memory().unwrap();
        assert_eq!(store.last_sync_at().unwrap(), None);
        store.set_last_sync_at("2026-10-17T09:00:00.000Z").unwrap();
        assert_eq!(
            store.last_sync_at().unwrap().as_deref(),
            Some("2026-10-17T09:00:00.000Z")
        );
    }

    #[test]
    fn test_unique_closing_date_is_enforced() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO daily_closings (id, closing_date, created_at, updated_at)
             VALUES ('c1', '2026-10-16', 'now', 'now')",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO daily_closings (id, closing_date, created_at, updated_at)
             VALUES ('c2', '2026-10-16', 'now', 'now')",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_open_on_disk_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("pos-db-test-{}", uuid::Uuid::new_v4()));
        {
            let store = LocalStore::open(&dir).unwrap();
            store.set_last_sync_at("2026-10-17T10:00:00.000Z").unwrap();
        }
        let reopened = LocalStore::open(&dir).unwrap();
        assert_eq!(
            reopened.last_sync_at().unwrap().as_deref(),
            Some("2026-10-17T10:00:00.000Z")
        );
        drop(reopened);
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_live_query_refreshes_on_matching_change() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let mut rx = store
            .live_query(&[Table::Orders], |s| {
                let conn = s.lock()?;
                Ok(conn.query_row("SELECT COUNT(*) FROM orders", [], |row| row.get::<_, i64>(0))?)
            })
            .unwrap();
        assert_eq!(*rx.borrow(), 0);

        {
            let conn = store.lock().unwrap();
            conn.execute(
                "INSERT INTO orders (id, order_number, status, created_at, updated_at)
                 VALUES ('o1', 1, 'pending', 'now', 'now')",
                [],
            )
            .unwrap();
        }
        store.publish([StoreChange::new(Table::Orders, "o1", ChangeKind::Insert)]);

        tokio::time::timeout(std::time::Duration::from_secs(2), rx.changed())
            .await
            .expect("live query refresh")
            .unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
