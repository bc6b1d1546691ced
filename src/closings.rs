//! Daily closings and their stock verifications.
//!
//! A closing summarizes one calendar date: the count and revenue of its
//! non-cancelled orders plus a physical stock count per inventory item.
//! Submitting a closing also resets each counted item's stock to the
//! physical figure. Everything is written locally first and pushed later.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::CacheLayer;
use crate::db::{self, ApplyCounts, ChangeKind, LocalStore, StoreChange};
use crate::error::{StoreError, WorkflowError};
use crate::inventory::{self, load_inventory_item};
use crate::models::{
    local_day_bounds, now_iso, round2, stock_variance, DailyClosing, EntityId, StockVerification,
    Table,
};

pub const CACHE_PREFIX: &str = "closings";

/// Recorded on a closing whose date the backend already has.
pub const DUPLICATE_CLOSING_MESSAGE: &str = "closing already exists for this date";

const CLOSING_COLUMNS: &str = "id, closing_date, submitted_by, total_orders, total_revenue, notes, \
     synced, sync_error, created_at, updated_at";

const VERIFICATION_COLUMNS: &str = "id, closing_id, inventory_item_id, system_stock, physical_stock, \
     wastage, variance, notes, synced, created_at";

fn closing_from_row(row: &Row<'_>) -> rusqlite::Result<DailyClosing> {
    Ok(DailyClosing {
        id: row.get(0)?,
        closing_date: row.get(1)?,
        submitted_by: row.get(2)?,
        total_orders: row.get(3)?,
        total_revenue: row.get(4)?,
        notes: row.get(5)?,
        synced: row.get(6)?,
        sync_error: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn verification_from_row(row: &Row<'_>) -> rusqlite::Result<StockVerification> {
    Ok(StockVerification {
        id: row.get(0)?,
        closing_id: row.get(1)?,
        inventory_item_id: row.get(2)?,
        system_stock: row.get(3)?,
        physical_stock: row.get(4)?,
        wastage: row.get(5)?,
        variance: row.get(6)?,
        notes: row.get(7)?,
        synced: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn write_closing(conn: &Connection, c: &DailyClosing) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO daily_closings (id, closing_date, submitted_by, total_orders, total_revenue,
            notes, synced, sync_error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
            closing_date = excluded.closing_date,
            submitted_by = excluded.submitted_by,
            total_orders = excluded.total_orders,
            total_revenue = excluded.total_revenue,
            notes = excluded.notes,
            synced = excluded.synced,
            sync_error = excluded.sync_error,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at",
        params![
            c.id,
            c.closing_date,
            c.submitted_by,
            c.total_orders,
            c.total_revenue,
            c.notes,
            c.synced,
            c.sync_error,
            c.created_at,
            c.updated_at,
        ],
    )
}

fn write_verification(conn: &Connection, v: &StockVerification) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO stock_verifications (id, closing_id, inventory_item_id, system_stock,
            physical_stock, wastage, variance, notes, synced, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
            closing_id = excluded.closing_id,
            inventory_item_id = excluded.inventory_item_id,
            system_stock = excluded.system_stock,
            physical_stock = excluded.physical_stock,
            wastage = excluded.wastage,
            variance = excluded.variance,
            notes = excluded.notes,
            synced = excluded.synced,
            created_at = excluded.created_at",
        params![
            v.id,
            v.closing_id,
            v.inventory_item_id,
            v.system_stock,
            v.physical_stock,
            v.wastage,
            v.variance,
            v.notes,
            v.synced,
            v.created_at,
        ],
    )
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Count and revenue of the date's non-cancelled orders.
fn day_totals(conn: &Connection, date: NaiveDate) -> Result<(i64, f64), StoreError> {
    let (start, end) = local_day_bounds(date);
    let (count, revenue): (i64, Option<f64>) = conn.query_row(
        "SELECT COUNT(*), SUM(total_amount) FROM orders
         WHERE status != 'cancelled' AND created_at >= ?1 AND created_at < ?2",
        params![start, end],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((count, round2(revenue.unwrap_or(0.0))))
}

/// One physical count entered at closing time.
#[derive(Debug, Clone, Deserialize)]
pub struct StockCount {
    pub inventory_item_id: String,
    pub physical_stock: f64,
    #[serde(default)]
    pub wastage: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A closing with its verifications.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ClosingWithVerifications {
    pub closing: DailyClosing,
    pub verifications: Vec<StockVerification>,
}

impl LocalStore {
    /// Write a closing, its verifications and the resulting stock levels as
    /// one unit. Totals are aggregated inside the same transaction.
    pub fn insert_daily_closing(
        &self,
        closing: &mut DailyClosing,
        counts: &[StockCount],
    ) -> Result<Vec<StockVerification>, StoreError> {
        let mut changes = Vec::new();
        let verifications = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;

            let (total_orders, total_revenue) = day_totals(&tx, closing.closing_date)?;
            closing.total_orders = total_orders;
            closing.total_revenue = total_revenue;

            if let Err(e) = write_closing(&tx, closing) {
                return Err(if is_unique_violation(&e) {
                    StoreError::DuplicateClosing(closing.closing_date.to_string())
                } else {
                    StoreError::Sqlite(e)
                });
            }
            changes.push(StoreChange::new(Table::DailyClosings, closing.id.as_str(), ChangeKind::Insert));

            let mut verifications = Vec::with_capacity(counts.len());
            for count in counts {
                let item = load_inventory_item(&tx, &count.inventory_item_id)?
                    .ok_or_else(|| StoreError::not_found("inventory_items", count.inventory_item_id.clone()))?;
                let verification = StockVerification {
                    id: EntityId::mint_local(),
                    closing_id: closing.id.clone(),
                    inventory_item_id: count.inventory_item_id.clone(),
                    system_stock: item.current_stock,
                    physical_stock: count.physical_stock,
                    wastage: count.wastage,
                    variance: stock_variance(item.current_stock, count.physical_stock, count.wastage),
                    notes: count.notes.clone(),
                    synced: false,
                    created_at: closing.created_at.clone(),
                };
                write_verification(&tx, &verification)?;
                inventory::set_stock_local(&tx, &count.inventory_item_id, count.physical_stock, &closing.updated_at)?;
                changes.push(StoreChange::new(
                    Table::StockVerifications,
                    verification.id.as_str(),
                    ChangeKind::Insert,
                ));
                changes.push(StoreChange::new(
                    Table::InventoryItems,
                    count.inventory_item_id.as_str(),
                    ChangeKind::Update,
                ));
                verifications.push(verification);
            }
            tx.commit()?;
            verifications
        };
        self.publish(changes);
        Ok(verifications)
    }

    pub fn get_closing_for_date(&self, date: NaiveDate) -> Result<Option<DailyClosing>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {CLOSING_COLUMNS} FROM daily_closings WHERE closing_date = ?1");
        Ok(conn.query_row(&sql, params![date], closing_from_row).optional()?)
    }

    /// Most recent first.
    pub fn list_closings(&self, limit: usize) -> Result<Vec<DailyClosing>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {CLOSING_COLUMNS} FROM daily_closings ORDER BY closing_date DESC LIMIT ?1");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64], closing_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn verifications_for(&self, closing_id: &str) -> Result<Vec<StockVerification>, StoreError> {
        let conn = self.lock()?;
        load_verifications(&conn, closing_id)
    }

    pub fn unsynced_closings(&self) -> Result<Vec<ClosingWithVerifications>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {CLOSING_COLUMNS} FROM daily_closings WHERE synced = 0 ORDER BY closing_date");
        let mut stmt = conn.prepare(&sql)?;
        let closings = stmt
            .query_map([], closing_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(closings.len());
        for closing in closings {
            let verifications = load_verifications(&conn, closing.id.as_str())?;
            out.push(ClosingWithVerifications { closing, verifications });
        }
        Ok(out)
    }

    pub fn mark_closing_sync_error(&self, id: &str, error: &str) -> Result<(), StoreError> {
        {
            let conn = self.lock()?;
            let changed = conn.execute(
                "UPDATE daily_closings SET synced = 0, sync_error = ?2 WHERE id = ?1",
                params![id, error],
            )?;
            db::expect_updated(changed, Table::DailyClosings, id)?;
        }
        self.publish([StoreChange::new(Table::DailyClosings, id, ChangeKind::Update)]);
        Ok(())
    }

    /// Re-key a pushed closing under the backend's id; its verifications
    /// are replaced by the ids the backend assigned (`verification_ids`
    /// pairs old with new) and marked synced.
    pub fn remap_closing(
        &self,
        old_id: &str,
        new_id: &str,
        verification_ids: &[(String, String)],
    ) -> Result<(), StoreError> {
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let sql = format!("SELECT {CLOSING_COLUMNS} FROM daily_closings WHERE id = ?1");
            let mut closing = tx
                .query_row(&sql, params![old_id], closing_from_row)
                .optional()?
                .ok_or_else(|| StoreError::not_found("daily_closings", old_id))?;
            let mut verifications = load_verifications(&tx, old_id)?;

            // Cascade drops the old verification rows.
            tx.execute("DELETE FROM daily_closings WHERE id = ?1", params![old_id])?;
            closing.id = EntityId::remote(new_id);
            closing.synced = true;
            closing.sync_error = None;
            write_closing(&tx, &closing)?;
            for v in &mut verifications {
                if let Some((_, remote_id)) = verification_ids.iter().find(|(old, _)| old == v.id.as_str()) {
                    v.id = EntityId::remote(remote_id.clone());
                    v.synced = true;
                }
                v.closing_id = closing.id.clone();
                write_verification(&tx, v)?;
            }
            tx.commit()?;
        }
        info!(old_id, new_id, "Remapped pushed closing to remote id");
        self.publish([
            StoreChange::new(Table::DailyClosings, old_id, ChangeKind::Delete),
            StoreChange::new(Table::DailyClosings, new_id, ChangeKind::Insert),
        ]);
        Ok(())
    }

    /// Unsynced verifications under a closing that already has a remote id.
    pub fn stranded_verifications(&self) -> Result<Vec<StockVerification>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {VERIFICATION_COLUMNS} FROM stock_verifications
             WHERE synced = 0
               AND closing_id IN (SELECT id FROM daily_closings WHERE synced = 1)
             ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], verification_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn remap_verification(&self, old_id: &str, new_id: &str) -> Result<(), StoreError> {
        {
            let conn = self.lock()?;
            let changed = conn.execute(
                "UPDATE stock_verifications SET id = ?2, synced = 1 WHERE id = ?1",
                params![old_id, new_id],
            )?;
            db::expect_updated(changed, Table::StockVerifications, old_id)?;
        }
        self.publish([
            StoreChange::new(Table::StockVerifications, old_id, ChangeKind::Delete),
            StoreChange::new(Table::StockVerifications, new_id, ChangeKind::Insert),
        ]);
        Ok(())
    }

    /// Apply pulled closings and verifications as synced. Closings that are
    /// unsynced locally, and their verifications, are left alone.
    pub fn upsert_remote_closings(
        &self,
        closings: Vec<DailyClosing>,
        verifications: Vec<StockVerification>,
    ) -> Result<ApplyCounts, StoreError> {
        let mut counts = ApplyCounts::default();
        let mut changes = Vec::new();
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let mut skipped = HashSet::new();
            for mut closing in closings {
                if db::row_synced_state(&tx, Table::DailyClosings, closing.id.as_str())? == Some(false) {
                    debug!(closing_id = %closing.id, "pull: keeping unsynced local closing");
                    counts.skipped_unsynced += 1;
                    skipped.insert(closing.id.to_string());
                    continue;
                }
                // A local unsynced closing for the same date blocks the remote
                // row until the user resolves the duplicate.
                let same_date: Option<(String, bool)> = tx
                    .query_row(
                        "SELECT id, synced FROM daily_closings WHERE closing_date = ?1 AND id != ?2",
                        params![closing.closing_date, closing.id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                match same_date {
                    Some((_, false)) => {
                        counts.skipped_unsynced += 1;
                        skipped.insert(closing.id.to_string());
                        continue;
                    }
                    Some((stale_id, true)) => {
                        tx.execute("DELETE FROM daily_closings WHERE id = ?1", params![stale_id])?;
                    }
                    None => {}
                }
                closing.synced = true;
                closing.sync_error = None;
                write_closing(&tx, &closing)?;
                changes.push(StoreChange::new(Table::DailyClosings, closing.id.as_str(), ChangeKind::Update));
                counts.applied += 1;
            }

            for mut v in verifications {
                if skipped.contains(v.closing_id.as_str())
                    || db::row_synced_state(&tx, Table::StockVerifications, v.id.as_str())? == Some(false)
                {
                    counts.skipped_unsynced += 1;
                    continue;
                }
                if db::row_synced_state(&tx, Table::DailyClosings, v.closing_id.as_str())? != Some(true) {
                    continue;
                }
                v.synced = true;
                write_verification(&tx, &v)?;
                changes.push(StoreChange::new(Table::StockVerifications, v.id.as_str(), ChangeKind::Update));
                counts.applied += 1;
            }
            tx.commit()?;
        }
        self.publish(changes);
        Ok(counts)
    }
}

fn load_verifications(conn: &Connection, closing_id: &str) -> Result<Vec<StockVerification>, StoreError> {
    let sql = format!(
        "SELECT {VERIFICATION_COLUMNS} FROM stock_verifications WHERE closing_id = ?1 ORDER BY created_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![closing_id], verification_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub struct ClosingService {
    store: Arc<LocalStore>,
    cache: Arc<CacheLayer>,
}

impl ClosingService {
    pub fn new(store: Arc<LocalStore>, cache: Arc<CacheLayer>) -> Self {
        Self { store, cache }
    }

    /// Close out `date`. Fails with `DuplicateClosing` when the date is
    /// already closed on this device.
    pub fn submit_daily_closing(
        &self,
        date: NaiveDate,
        submitted_by: Option<String>,
        notes: Option<String>,
        counts: &[StockCount],
    ) -> Result<ClosingWithVerifications, WorkflowError> {
        for count in counts {
            if !count.physical_stock.is_finite() || count.physical_stock < 0.0 {
                return Err(WorkflowError::Validation(format!(
                    "physical stock for {} must be zero or more",
                    count.inventory_item_id
                )));
            }
            if !count.wastage.is_finite() || count.wastage < 0.0 {
                return Err(WorkflowError::Validation(format!(
                    "wastage for {} must be zero or more",
                    count.inventory_item_id
                )));
            }
        }
        let mut seen = HashSet::new();
        if let Some(dup) = counts.iter().find(|c| !seen.insert(c.inventory_item_id.as_str())) {
            return Err(WorkflowError::Validation(format!(
                "{} was counted twice",
                dup.inventory_item_id
            )));
        }

        let now = now_iso();
        let mut closing = DailyClosing {
            id: EntityId::mint_local(),
            closing_date: date,
            submitted_by,
            total_orders: 0,
            total_revenue: 0.0,
            notes,
            synced: false,
            sync_error: None,
            created_at: now.clone(),
            updated_at: now,
        };
        let verifications = self.store.insert_daily_closing(&mut closing, counts)?;
        self.cache.invalidate_prefix(CACHE_PREFIX);
        self.cache.invalidate_prefix(inventory::CACHE_PREFIX);
        info!(
            closing_id = %closing.id,
            %date,
            orders = closing.total_orders,
            revenue = closing.total_revenue,
            verified = verifications.len(),
            "Daily closing submitted"
        );
        Ok(ClosingWithVerifications {
            closing,
            verifications,
        })
    }

    pub fn recent_closings(&self, limit: usize) -> Result<Vec<DailyClosing>, StoreError> {
        let key = format!("{CACHE_PREFIX}:recent:{limit}");
        if let Some(rows) = self.cache.get::<Vec<DailyClosing>>(&key) {
            return Ok(rows);
        }
        let rows = self.store.list_closings(limit)?;
        self.cache.set(&key, &rows);
        Ok(rows)
    }
}
