//! Pending operation queue.
//!
//! An ordered log of remote writes that were attempted directly while the
//! terminal believed it was online and failed. Entries are replayed by the
//! sync engine's push phase and removed only after the backend confirms
//! them (at-least-once).

use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{ChangeKind, LocalStore, StoreChange};
use crate::error::StoreError;
use crate::models::{now_iso, Table};

/// Operations past this many failed replays are kept but no longer retried
/// automatically.
pub const MAX_OPERATION_RETRIES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(OperationKind::Insert),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

/// One queued remote write. Update and delete payloads carry the target row
/// id under `"id"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOperation {
    pub id: String,
    pub table: Table,
    pub operation: OperationKind,
    pub payload: Value,
    pub created_at: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
}

impl PendingOperation {
    pub fn target_id(&self) -> Option<&str> {
        self.payload.get("id").and_then(Value::as_str)
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= MAX_OPERATION_RETRIES
    }
}

impl LocalStore {
    /// Append an operation; returns its generated id.
    pub fn enqueue(
        &self,
        table: Table,
        operation: OperationKind,
        payload: &Value,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO pending_operations (id, table_name, operation, payload, created_at, retry_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                params![
                    id,
                    table.as_str(),
                    operation.as_str(),
                    serde_json::to_string(payload)?,
                    now_iso()
                ],
            )?;
        }
        self.publish([StoreChange::new(Table::PendingOperations, id.as_str(), ChangeKind::Insert)]);
        info!(op_id = %id, table = %table, operation = %operation, "Queued pending operation");
        Ok(id)
    }

    /// Remove an operation after the backend confirmed it.
    pub fn dequeue(&self, id: &str) -> Result<bool, StoreError> {
        let removed = {
            let conn = self.lock()?;
            conn.execute("DELETE FROM pending_operations WHERE id = ?1", params![id])?
        };
        if removed > 0 {
            self.publish([StoreChange::new(Table::PendingOperations, id, ChangeKind::Delete)]);
        }
        debug!(op_id = %id, removed, "Dequeued pending operation");
        Ok(removed > 0)
    }

    /// All pending operations, oldest first.
    pub fn list_pending(&self) -> Result<Vec<PendingOperation>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, table_name, operation, payload, created_at, retry_count, last_error
             FROM pending_operations
             ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut ops = Vec::with_capacity(rows.len());
        for (id, table, operation, payload, created_at, retry_count, last_error) in rows {
            let table = table
                .parse::<Table>()
                .map_err(|e| StoreError::Unavailable(format!("pending operation {id}: {e}")))?;
            let operation = operation
                .parse::<OperationKind>()
                .map_err(|e| StoreError::Unavailable(format!("pending operation {id}: {e}")))?;
            ops.push(PendingOperation {
                id,
                table,
                operation,
                payload: serde_json::from_str(&payload)?,
                created_at,
                retry_count,
                last_error,
            });
        }
        Ok(ops)
    }

    pub fn pending_count(&self) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM pending_operations", [], |row| row.get(0))?)
    }

    /// Record a failed replay attempt.
    pub fn record_operation_failure(&self, id: &str, error: &str) -> Result<(), StoreError> {
        let changed = {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE pending_operations
                 SET retry_count = retry_count + 1, last_error = ?2
                 WHERE id = ?1",
                params![id, error],
            )?
        };
        if changed > 0 {
            self.publish([StoreChange::new(Table::PendingOperations, id, ChangeKind::Update)]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queue_is_fifo_and_counts() {
        let store = LocalStore::open_in_memory().unwrap();
        let first = store
            .enqueue(Table::Orders, OperationKind::Update, &json!({"id": "o1", "status": "ready"}))
            .unwrap();
        let second = store
            .enqueue(Table::MenuItems, OperationKind::Delete, &json!({"id": "m1"}))
            .unwrap();

        assert_eq!(store.pending_count().unwrap(), 2);
        let ops = store.list_pending().unwrap();
        assert_eq!(ops[0].id, first);
        assert_eq!(ops[0].table, Table::Orders);
        assert_eq!(ops[0].retry_count, 0);
        assert_eq!(ops[0].target_id(), Some("o1"));
        assert_eq!(ops[1].id, second);
        assert_eq!(ops[1].operation, OperationKind::Delete);

        assert!(store.dequeue(&first).unwrap());
        assert!(!store.dequeue(&first).unwrap());
        assert_eq!(store.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_queue_writes_are_published() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut changes = store.subscribe();

        let id = store
            .enqueue(Table::Orders, OperationKind::Update, &json!({"id": "o1", "status": "ready"}))
            .unwrap();
        let change = changes.try_recv().unwrap();
        assert_eq!(change, StoreChange::new(Table::PendingOperations, id.as_str(), ChangeKind::Insert));
        assert_eq!(store.unsynced_counts().unwrap().pending_operations, 1);

        store.record_operation_failure(&id, "HTTP 503").unwrap();
        assert_eq!(changes.try_recv().unwrap().kind, ChangeKind::Update);

        store.dequeue(&id).unwrap();
        let change = changes.try_recv().unwrap();
        assert_eq!(change.kind, ChangeKind::Delete);
        assert_eq!(change.table, Table::PendingOperations);
        assert_eq!(store.unsynced_counts().unwrap().pending_operations, 0);

        // Nothing left to remove, nothing published.
        store.dequeue(&id).unwrap();
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_failures_increment_retry_count() {
        let store = LocalStore::open_in_memory().unwrap();
        let id = store
            .enqueue(Table::InventoryItems, OperationKind::Update, &json!({"id": "i1"}))
            .unwrap();
        for _ in 0..MAX_OPERATION_RETRIES {
            store.record_operation_failure(&id, "HTTP 503").unwrap();
        }
        let op = &store.list_pending().unwrap()[0];
        assert_eq!(op.retry_count, MAX_OPERATION_RETRIES);
        assert_eq!(op.last_error.as_deref(), Some("HTTP 503"));
        assert!(op.is_exhausted());
    }
}
