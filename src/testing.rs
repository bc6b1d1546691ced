//! In-memory `RemoteBackend` for tests.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::api::{Filter, Query, RemoteBackend};
use crate::error::RemoteError;
use crate::models::{now_iso, Table};

pub struct MemoryBackend {
    tables: Mutex<HashMap<Table, Vec<Value>>>,
    next_order_number: AtomicI64,
    offline: AtomicBool,
    failing_inserts: Mutex<HashSet<Table>>,
    delay: Mutex<Option<Duration>>,
    lose_insert_responses: AtomicUsize,
    pub calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            next_order_number: AtomicI64::new(1001),
            offline: AtomicBool::new(false),
            failing_inserts: Mutex::new(HashSet::new()),
            delay: Mutex::new(None),
            lose_insert_responses: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_inserts_into(&self, table: Table) {
        self.failing_inserts.lock().unwrap().insert(table);
    }

    pub fn clear_insert_failures(&self) {
        self.failing_inserts.lock().unwrap().clear();
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Commit the next `n` inserts but fail while "reading" their response.
    pub fn lose_insert_responses(&self, n: usize) {
        self.lose_insert_responses.store(n, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Seed a row directly, bypassing call accounting.
    pub fn seed(&self, table: Table, row: Value) {
        self.tables.lock().unwrap().entry(table).or_default().push(row);
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("Cannot reach backend at memory://".into()));
        }
        Ok(())
    }
}

impl MemoryBackend {
    fn respond(&self, row: Value) -> Result<Value, RemoteError> {
        let lost = self
            .lose_insert_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(RemoteError::Transport("connection reset while reading response".into()));
        }
        Ok(row)
    }
}

fn compare(a: &Value, b: &Value) -> Option<CmpOrdering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn matches(row: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::Eq(col, v) => row.get(col).map(|x| compare(x, v) == Some(CmpOrdering::Equal)).unwrap_or(false),
        Filter::Gt(col, v) => row.get(col).map(|x| compare(x, v) == Some(CmpOrdering::Greater)).unwrap_or(false),
        Filter::Gte(col, v) => row
            .get(col)
            .map(|x| matches!(compare(x, v), Some(CmpOrdering::Greater | CmpOrdering::Equal)))
            .unwrap_or(false),
        Filter::In(col, vs) => row
            .get(col)
            .map(|x| vs.iter().any(|v| compare(x, v) == Some(CmpOrdering::Equal)))
            .unwrap_or(false),
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Value>, RemoteError> {
        self.enter().await?;
        let mut rows: Vec<Value> = self
            .rows(table)
            .into_iter()
            .filter(|row| query.filters.iter().all(|f| matches(row, f)))
            .collect();
        if let Some((col, asc)) = &query.order {
            rows.sort_by(|a, b| {
                let ord = match (a.get(col), b.get(col)) {
                    (Some(x), Some(y)) => compare(x, y).unwrap_or(CmpOrdering::Equal),
                    _ => CmpOrdering::Equal,
                };
                if *asc {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, RemoteError> {
        self.enter().await?;
        if self.failing_inserts.lock().unwrap().contains(&table) {
            return Err(RemoteError::Http {
                status: 503,
                message: "Backend server error (HTTP 503)".into(),
            });
        }
        let mut obj: Map<String, Value> = match row {
            Value::Object(m) => m,
            _ => return Err(RemoteError::Decode("row must be an object".into())),
        };

        let mut tables = self.tables.lock().unwrap();
        let existing = tables.entry(table).or_default();

        // Same id as an earlier insert: merge into that row.
        let id = obj.get("id").and_then(Value::as_str).map(str::to_string);
        let duplicate = id
            .as_deref()
            .and_then(|id| existing.iter().position(|r| r.get("id").and_then(Value::as_str) == Some(id)));
        if let Some(pos) = duplicate {
            if let Value::Object(target) = &mut existing[pos] {
                for (k, v) in obj {
                    target.insert(k, v);
                }
            }
            let stored = existing[pos].clone();
            drop(tables);
            return self.respond(stored);
        }

        if table == Table::DailyClosings {
            let date = obj.get("closing_date").cloned();
            if existing.iter().any(|r| r.get("closing_date") == date.as_ref()) {
                return Err(RemoteError::Conflict(
                    "duplicate key value violates unique constraint \"daily_closings_closing_date_key\"".into(),
                ));
            }
        }

        obj.entry("id").or_insert_with(|| json!(Uuid::new_v4().to_string()));
        if table == Table::Orders {
            let n = self.next_order_number.fetch_add(1, Ordering::SeqCst);
            obj.insert("order_number".into(), json!(n));
        }
        obj.entry("updated_at").or_insert_with(|| json!(now_iso()));
        let stored = Value::Object(obj);
        existing.push(stored.clone());
        drop(tables);
        self.respond(stored)
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, RemoteError> {
        self.enter().await?;
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table).or_default();
        let row = rows
            .iter_mut()
            .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
            .ok_or_else(|| RemoteError::Http {
                status: 404,
                message: format!("{table} row {id} not found"),
            })?;
        if let (Value::Object(target), Value::Object(fields)) = (row, patch) {
            for (k, v) in fields {
                target.insert(k, v);
            }
            return Ok(Value::Object(target.clone()));
        }
        Err(RemoteError::Decode("patch must be an object".into()))
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError> {
        self.enter().await?;
        let mut tables = self.tables.lock().unwrap();
        if let Some(rows) = tables.get_mut(&table) {
            rows.retain(|r| r.get("id").and_then(Value::as_str) != Some(id));
        }
        Ok(())
    }

    async fn health(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}
