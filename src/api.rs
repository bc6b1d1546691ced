//! Remote backend client.
//!
//! The sync core depends only on [`RemoteBackend`]: per-table select /
//! insert / update / delete with filter predicates, plus a health probe.
//! [`RestBackend`] implements it against a PostgREST-style HTTPS API
//! (`/rest/v1/<table>?col=eq.value`), authenticated with an API key.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::{normalize_remote_url, Config};
use crate::error::RemoteError;
use crate::models::{
    now_iso, BillType, DailyClosing, EntityId, MenuItem, Order, OrderItem, OrderStatus,
    StockVerification, Table,
};

/// Timeout used specifically for the lightweight connectivity probe.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Postgres unique violation, surfaced by PostgREST in the `code` field.
const PG_UNIQUE_VIOLATION: &str = "23505";

/// Inserts carry a client-derived id; a repeat of the same insert updates
/// the row the first attempt created instead of adding another.
const PREFER_INSERT: &str = "return=representation,resolution=merge-duplicates";
const PREFER_DEFAULT: &str = "return=representation";

// ---------------------------------------------------------------------------
// Query predicates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    In(String, Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Option<(String, bool)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.to_string(), value.into()));
        self
    }

    pub fn gt(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Gt(column.to_string(), value.into()));
        self
    }

    pub fn gte(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Gte(column.to_string(), value.into()));
        self
    }

    pub fn is_in<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.filters.push(Filter::In(
            column.to_string(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some((column.to_string(), ascending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Render as PostgREST query parameters.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        for filter in &self.filters {
            match filter {
                Filter::Eq(col, v) => params.push((col.clone(), format!("eq.{}", scalar(v)))),
                Filter::Gt(col, v) => params.push((col.clone(), format!("gt.{}", scalar(v)))),
                Filter::Gte(col, v) => params.push((col.clone(), format!("gte.{}", scalar(v)))),
                Filter::In(col, vs) => {
                    let list: Vec<String> = vs.iter().map(|v| quote_in_item(&scalar(v))).collect();
                    params.push((col.clone(), format!("in.({})", list.join(","))));
                }
            }
        }
        if let Some((col, asc)) = &self.order {
            let dir = if *asc { "asc" } else { "desc" };
            params.push(("order".to_string(), format!("{col}.{dir}")));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

fn scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn quote_in_item(item: &str) -> String {
    if item.contains([',', '(', ')', '"']) {
        format!("\"{}\"", item.replace('"', "\\\""))
    } else {
        item.to_string()
    }
}

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Value>, RemoteError>;

    /// Insert one row and return it as stored (with server-assigned fields).
    async fn insert(&self, table: Table, row: Value) -> Result<Value, RemoteError>;

    /// Patch the row with `id` and return it as stored.
    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, RemoteError>;

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError>;

    /// Lightweight reachability check.
    async fn health(&self) -> bool;
}

// ---------------------------------------------------------------------------
// REST implementation
// ---------------------------------------------------------------------------

pub struct RestBackend {
    client: Client,
    base_url: String,
    api_key: Zeroizing<String>,
}

impl RestBackend {
    pub fn new(config: &Config) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(config.remote_timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_remote_url(&config.remote_url),
            api_key: config.api_key.clone(),
        })
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.as_str())
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        params: &[(String, String)],
        body: Option<Value>,
    ) -> Result<Value, RemoteError> {
        let mut req = self
            .client
            .request(method.clone(), url)
            .query(params)
            .header("apikey", self.api_key.as_str())
            .bearer_auth(self.api_key.as_str())
            .header("Content-Type", "application/json")
            .header("Prefer", prefer_header(&method));
        if let Some(b) = body {
            req = req.json(&b);
        }

        let started = Instant::now();
        let resp = req.send().await.map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        debug!(%method, url, status = status.as_u16(), elapsed_ms = started.elapsed().as_millis() as u64, "remote call");

        let body_text = resp
            .text()
            .await
            .map_err(|e| RemoteError::Transport(format!("{method} {url}: {e}")))?;
        if !status.is_success() {
            return Err(error_from_response(status, &body_text));
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| RemoteError::Decode(format!("Invalid JSON from backend: {e}")))
    }
}

fn prefer_header(method: &Method) -> &'static str {
    if *method == Method::POST {
        PREFER_INSERT
    } else {
        PREFER_DEFAULT
    }
}

/// Remote id for a row minted on this terminal, derived from its local id
/// so every attempt to insert it names the same remote row. Rows that
/// already carry a remote id get `None`.
pub fn client_row_id(id: &EntityId) -> Option<String> {
    id.is_local()
        .then(|| Uuid::new_v5(&Uuid::NAMESPACE_OID, id.as_str().as_bytes()).to_string())
}

/// PostgREST answers writes with an array of affected rows.
fn first_row(value: Value, table: Table) -> Result<Value, RemoteError> {
    match value {
        Value::Array(mut rows) if !rows.is_empty() => Ok(rows.swap_remove(0)),
        Value::Object(_) => Ok(value),
        _ => Err(RemoteError::Decode(format!("{table}: write returned no row"))),
    }
}

#[async_trait]
impl RemoteBackend for RestBackend {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Value>, RemoteError> {
        let url = self.table_url(table);
        match self.send(Method::GET, &url, &query.to_params(), None).await? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Err(RemoteError::Decode(format!(
                "{table}: expected an array, got {}",
                other
            ))),
        }
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, RemoteError> {
        let url = self.table_url(table);
        let resp = self.send(Method::POST, &url, &[], Some(row)).await?;
        first_row(resp, table)
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, RemoteError> {
        let url = self.table_url(table);
        let params = vec![("id".to_string(), format!("eq.{id}"))];
        let resp = self.send(Method::PATCH, &url, &params, Some(patch)).await?;
        first_row(resp, table).map_err(|_| RemoteError::Http {
            status: 404,
            message: format!("{table} row {id} not found"),
        })
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError> {
        let url = self.table_url(table);
        let params = vec![("id".to_string(), format!("eq.{id}"))];
        self.send(Method::DELETE, &url, &params, None).await?;
        Ok(())
    }

    async fn health(&self) -> bool {
        let url = format!("{}/rest/v1/", self.base_url);
        let started = Instant::now();
        match self
            .client
            .get(&url)
            .timeout(CONNECTIVITY_TIMEOUT)
            .header("apikey", self.api_key.as_str())
            .send()
            .await
        {
            Ok(resp) => {
                // Any HTTP answer means the backend is reachable.
                let ok = !resp.status().is_server_error();
                if ok {
                    debug!(latency_ms = started.elapsed().as_millis() as u64, "connectivity probe passed");
                } else {
                    info!(status = resp.status().as_u16(), "connectivity probe: backend unhealthy");
                }
                ok
            }
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

/// Body of an order create. The id is derived from the local id; order
/// number and sync state stay local. `updated_at` is the push time so
/// terminals that synced since the order was taken still see it.
#[derive(Debug, Serialize)]
pub struct CreateOrderRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub customer_name: Option<&'a str>,
    pub table_number: Option<&'a str>,
    pub bill_type: BillType,
    pub subtotal: f64,
    pub tax_amount: f64,
    pub discount_amount: f64,
    pub total_amount: f64,
    pub status: OrderStatus,
    pub payment_method: Option<&'a str>,
    pub created_by: Option<&'a str>,
    pub created_at: &'a str,
    pub updated_at: String,
}

impl<'a> From<&'a Order> for CreateOrderRequest<'a> {
    fn from(order: &'a Order) -> Self {
        Self {
            id: client_row_id(&order.id),
            customer_name: order.customer_name.as_deref(),
            table_number: order.table_number.as_deref(),
            bill_type: order.bill_type,
            subtotal: order.subtotal,
            tax_amount: order.tax_amount,
            discount_amount: order.discount_amount,
            total_amount: order.total_amount,
            status: order.status,
            payment_method: order.payment_method.as_deref(),
            created_by: order.created_by.as_deref(),
            created_at: &order.created_at,
            updated_at: now_iso(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatedOrder {
    pub id: String,
    pub order_number: i64,
}

/// Patch for an order that already exists remotely.
#[derive(Debug, Serialize)]
pub struct OrderUpdateRequest<'a> {
    pub status: OrderStatus,
    pub payment_method: Option<&'a str>,
    pub subtotal: f64,
    pub tax_amount: f64,
    pub discount_amount: f64,
    pub total_amount: f64,
    pub updated_at: String,
}

impl<'a> From<&'a Order> for OrderUpdateRequest<'a> {
    fn from(order: &'a Order) -> Self {
        Self {
            status: order.status,
            payment_method: order.payment_method.as_deref(),
            subtotal: order.subtotal,
            tax_amount: order.tax_amount,
            discount_amount: order.discount_amount,
            total_amount: order.total_amount,
            updated_at: now_iso(),
        }
    }
}

/// Body of an order item create, keyed to the remote order id. The
/// denormalized menu item name stays local.
#[derive(Debug, Serialize)]
pub struct CreateOrderItemRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub order_id: &'a str,
    pub menu_item_id: &'a str,
    pub quantity: i64,
    pub unit_price: f64,
    pub tax_percentage: f64,
    pub tax_amount: f64,
    pub total_price: f64,
    pub notes: Option<&'a str>,
}

impl<'a> From<&'a OrderItem> for CreateOrderItemRequest<'a> {
    fn from(item: &'a OrderItem) -> Self {
        Self {
            id: client_row_id(&item.id),
            order_id: item.order_id.as_str(),
            menu_item_id: &item.menu_item_id,
            quantity: item.quantity,
            unit_price: item.unit_price,
            tax_percentage: item.tax_percentage,
            tax_amount: item.tax_amount,
            total_price: item.total_price,
            notes: item.notes.as_deref(),
        }
    }
}

/// Any write that only needs the server-assigned id back.
#[derive(Debug, Deserialize)]
pub struct CreatedRow {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct StockUpdateRequest {
    pub current_stock: f64,
    pub updated_at: String,
}

/// Body of a menu item insert or update. Only inserts carry an id.
#[derive(Debug, Serialize)]
pub struct MenuItemRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub category: &'a str,
    pub price: f64,
    pub tax_percentage: f64,
    pub is_available: bool,
    pub is_vegetarian: bool,
    pub display_order: i64,
    pub updated_at: String,
}

impl<'a> From<&'a MenuItem> for MenuItemRequest<'a> {
    fn from(item: &'a MenuItem) -> Self {
        Self {
            id: client_row_id(&item.id),
            name: &item.name,
            description: item.description.as_deref(),
            category: &item.category,
            price: item.price,
            tax_percentage: item.tax_percentage,
            is_available: item.is_available,
            is_vegetarian: item.is_vegetarian,
            display_order: item.display_order,
            updated_at: now_iso(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ClosingRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub closing_date: NaiveDate,
    pub submitted_by: Option<&'a str>,
    pub total_orders: i64,
    pub total_revenue: f64,
    pub notes: Option<&'a str>,
    pub created_at: &'a str,
    pub updated_at: String,
}

impl<'a> From<&'a DailyClosing> for ClosingRequest<'a> {
    fn from(closing: &'a DailyClosing) -> Self {
        Self {
            id: client_row_id(&closing.id),
            closing_date: closing.closing_date,
            submitted_by: closing.submitted_by.as_deref(),
            total_orders: closing.total_orders,
            total_revenue: closing.total_revenue,
            notes: closing.notes.as_deref(),
            created_at: &closing.created_at,
            updated_at: now_iso(),
        }
    }
}

/// Body of a stock verification insert, keyed to the remote closing id.
#[derive(Debug, Serialize)]
pub struct VerificationRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub closing_id: &'a str,
    pub inventory_item_id: &'a str,
    pub system_stock: f64,
    pub physical_stock: f64,
    pub wastage: f64,
    pub variance: f64,
    pub notes: Option<&'a str>,
}

impl<'a> From<&'a StockVerification> for VerificationRequest<'a> {
    fn from(v: &'a StockVerification) -> Self {
        Self {
            id: client_row_id(&v.id),
            closing_id: v.closing_id.as_str(),
            inventory_item_id: &v.inventory_item_id,
            system_stock: v.system_stock,
            physical_stock: v.physical_stock,
            wastage: v.wastage,
            variance: v.variance,
            notes: v.notes.as_deref(),
        }
    }
}

/// Serialize a request body.
pub fn encode<T: Serialize>(body: &T) -> Result<Value, RemoteError> {
    serde_json::to_value(body).map_err(|e| RemoteError::Decode(format!("request body: {e}")))
}

/// Decode a backend row into a typed response.
pub fn decode<T: DeserializeOwned>(row: Value) -> Result<T, RemoteError> {
    serde_json::from_value(row).map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Bound a remote call; an elapsed timer becomes `RemoteError::Timeout`.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(limit.as_secs())),
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::Network(format!("Connection to {url} timed out"));
    }
    if err.is_connect() {
        return RemoteError::Network(format!("Cannot reach backend at {url}"));
    }
    if err.is_builder() {
        return RemoteError::Network(format!("Invalid backend URL: {url}"));
    }
    RemoteError::Network(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Backend endpoint not found".to_string(),
        409 => "Row conflicts with existing data".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

/// Build a `RemoteError` from a non-success response, preserving the
/// backend's own message when it sent one.
pub(crate) fn error_from_response(status: StatusCode, body_text: &str) -> RemoteError {
    let json = serde_json::from_str::<Value>(body_text).ok();
    let message = json
        .as_ref()
        .and_then(|j| j.get("message").or_else(|| j.get("error")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| status_message(status));
    let code = json
        .as_ref()
        .and_then(|j| j.get("code"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    if status == StatusCode::CONFLICT || code == PG_UNIQUE_VIOLATION {
        return RemoteError::Conflict(message);
    }
    RemoteError::Http {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_renders_postgrest_params() {
        let q = Query::new()
            .eq("is_available", true)
            .gt("updated_at", "2026-10-17T09:00:00.000Z")
            .is_in("closing_id", ["c1", "c,2"])
            .order_by("closing_date", false)
            .limit(30);
        let params = q.to_params();
        assert_eq!(params[0], ("select".into(), "*".into()));
        assert!(params.contains(&("is_available".into(), "eq.true".into())));
        assert!(params.contains(&("updated_at".into(), "gt.2026-10-17T09:00:00.000Z".into())));
        assert!(params.contains(&("closing_id".into(), "in.(c1,\"c,2\")".into())));
        assert!(params.contains(&("order".into(), "closing_date.desc".into())));
        assert!(params.contains(&("limit".into(), "30".into())));
    }

    #[test]
    fn test_unique_violation_maps_to_conflict() {
        let body = r#"{"code":"23505","message":"duplicate key value violates unique constraint \"daily_closings_closing_date_key\""}"#;
        let err = error_from_response(StatusCode::CONFLICT, body);
        assert!(matches!(err, RemoteError::Conflict(ref m) if m.contains("duplicate key")));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_server_errors_are_transient() {
        let err = error_from_response(StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(matches!(err, RemoteError::Http { status: 503, .. }));
        assert!(err.is_transient());

        let err = error_from_response(StatusCode::UNAUTHORIZED, "");
        assert_eq!(err.to_string(), "API key is invalid or expired (HTTP 401)");
    }

    #[test]
    fn test_unreadable_body_is_transient() {
        let err = RemoteError::Transport("POST /rest/v1/orders: connection reset".into());
        assert!(err.is_transient());
    }

    #[test]
    fn test_only_inserts_merge_duplicates() {
        assert_eq!(prefer_header(&Method::POST), PREFER_INSERT);
        assert_eq!(prefer_header(&Method::PATCH), PREFER_DEFAULT);
        assert_eq!(prefer_header(&Method::GET), PREFER_DEFAULT);
    }

    #[test]
    fn test_client_row_id_is_stable_for_local_ids() {
        let local = EntityId::mint_local();
        let first = client_row_id(&local).unwrap();
        assert_eq!(client_row_id(&local), Some(first.clone()));
        assert!(!EntityId::remote(first.clone()).is_local());
        assert!(Uuid::parse_str(&first).is_ok());
        assert_ne!(client_row_id(&EntityId::mint_local()), Some(first));

        assert_eq!(client_row_id(&EntityId::remote("9b2f6c1e-remote")), None);
    }

    #[test]
    fn test_create_body_is_stamped_at_push_time() {
        let order = Order {
            id: EntityId::mint_local(),
            order_number: 900_001,
            customer_name: None,
            table_number: Some("T4".into()),
            bill_type: BillType::TaxInvoice,
            subtotal: 100.0,
            tax_amount: 5.0,
            discount_amount: 0.0,
            total_amount: 105.0,
            status: OrderStatus::Pending,
            payment_method: None,
            created_by: None,
            created_at: "2026-10-16T08:00:00.000Z".into(),
            updated_at: "2026-10-16T08:00:00.000Z".into(),
            synced: false,
            sync_error: None,
        };
        let body = encode(&CreateOrderRequest::from(&order)).unwrap();
        assert_eq!(body["created_at"], "2026-10-16T08:00:00.000Z");
        assert!(body["updated_at"].as_str().unwrap() > "2026-10-16T08:00:00.000Z");
        assert_eq!(body["id"], json!(client_row_id(&order.id)));
        assert!(body.get("order_number").is_none());

        let patch = encode(&OrderUpdateRequest::from(&order)).unwrap();
        assert!(patch.get("id").is_none());
        assert!(patch["updated_at"].as_str().unwrap() > "2026-10-16T08:00:00.000Z");
    }

    #[test]
    fn test_first_row_accepts_array_or_object() {
        let row = first_row(json!([{ "id": "a" }]), Table::Orders).unwrap();
        assert_eq!(row["id"], "a");
        let row = first_row(json!({ "id": "b" }), Table::Orders).unwrap();
        assert_eq!(row["id"], "b");
        assert!(first_row(json!([]), Table::Orders).is_err());
    }
}
