//! Entity types shared by the local store, the sync engine and the
//! workflows.
//!
//! Rows carry a `synced` flag: `false` means the local copy has changes the
//! remote backend has not confirmed yet. Remote rows decode into the same
//! structs; local-only fields default when absent.

use chrono::{DateTime, Local, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};
use rand::Rng;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix reserved for ids minted on this device.
pub const LOCAL_ID_PREFIX: &str = "local_";
/// Older builds minted offline order ids with this prefix.
const LEGACY_OFFLINE_PREFIX: &str = "offline_";

/// Current time as an RFC 3339 timestamp with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// UTC bounds `[start, end)` of a business date in the terminal's time
/// zone, formatted like stored timestamps so they compare as strings.
pub fn local_day_bounds(date: NaiveDate) -> (String, String) {
    let next = date.succ_opt().unwrap_or(date);
    let format = |d: NaiveDate| local_midnight(d).to_rfc3339_opts(SecondsFormat::Millis, true);
    (format(date), format(next))
}

/// First instant of `date` in local time, as UTC. A midnight skipped by a
/// DST change falls forward to the first hour that exists.
fn local_midnight(date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .or_else(|| Local.from_local_datetime(&(midnight + chrono::Duration::hours(1))).earliest())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

/// Round a money amount to two decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Every table the sync core knows about, local and remote names alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    MenuItems,
    InventoryItems,
    Orders,
    OrderItems,
    DailyClosings,
    StockVerifications,
    BusinessProfiles,
    /// Local write queue; never a remote table.
    PendingOperations,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::MenuItems => "menu_items",
            Table::InventoryItems => "inventory_items",
            Table::Orders => "orders",
            Table::OrderItems => "order_items",
            Table::DailyClosings => "daily_closings",
            Table::StockVerifications => "stock_verifications",
            Table::BusinessProfiles => "business_profiles",
            Table::PendingOperations => "pending_operations",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "menu_items" => Ok(Table::MenuItems),
            "inventory_items" => Ok(Table::InventoryItems),
            "orders" => Ok(Table::Orders),
            "order_items" => Ok(Table::OrderItems),
            "daily_closings" => Ok(Table::DailyClosings),
            "stock_verifications" => Ok(Table::StockVerifications),
            "business_profiles" => Ok(Table::BusinessProfiles),
            "pending_operations" => Ok(Table::PendingOperations),
            other => Err(format!("unknown table: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Entity ids
// ---------------------------------------------------------------------------

/// Where an id was minted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Local,
    Remote,
}

/// String key tagged with its origin. Local ids keep their reserved prefix
/// in the stored string so the tag survives a restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct EntityId {
    origin: Origin,
    raw: String,
}

impl EntityId {
    /// Mint a new local-origin id: prefix, epoch millis, random suffix.
    pub fn mint_local() -> Self {
        let millis = Utc::now().timestamp_millis();
        let suffix: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(8)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        Self {
            origin: Origin::Local,
            raw: format!("{LOCAL_ID_PREFIX}{millis}_{suffix}"),
        }
    }

    pub fn remote(raw: impl Into<String>) -> Self {
        Self::from(raw.into())
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl From<String> for EntityId {
    fn from(raw: String) -> Self {
        let origin = if raw.starts_with(LOCAL_ID_PREFIX) || raw.starts_with(LEGACY_OFFLINE_PREFIX) {
            Origin::Local
        } else {
            Origin::Remote
        };
        Self { origin, raw }
    }
}

impl From<&str> for EntityId {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.raw
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl ToSql for EntityId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.raw.as_str()))
    }
}

impl FromSql for EntityId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        String::column_result(value).map(EntityId::from)
    }
}

// ---------------------------------------------------------------------------
// Order status / bill type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Preparing,
    Ready,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// `pending -> preparing -> ready -> completed`, plus `pending -> cancelled`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Preparing)
                | (OrderStatus::Preparing, OrderStatus::Ready)
                | (OrderStatus::Ready, OrderStatus::Completed)
                | (OrderStatus::Pending, OrderStatus::Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "preparing" => Ok(OrderStatus::Preparing),
            "ready" => Ok(OrderStatus::Ready),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

impl ToSql for OrderStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for OrderStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        raw.parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillType {
    #[default]
    TaxInvoice,
    Estimate,
}

impl BillType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillType::TaxInvoice => "tax_invoice",
            BillType::Estimate => "estimate",
        }
    }
}

impl FromStr for BillType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tax_invoice" => Ok(BillType::TaxInvoice),
            "estimate" => Ok(BillType::Estimate),
            other => Err(format!("unknown bill type: {other}")),
        }
    }
}

impl ToSql for BillType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for BillType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        raw.parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: String,
    pub price: f64,
    #[serde(default)]
    pub tax_percentage: f64,
    #[serde(default = "default_true")]
    pub is_available: bool,
    #[serde(default)]
    pub is_vegetarian: bool,
    #[serde(default)]
    pub display_order: i64,
    #[serde(default)]
    pub synced: bool,
    #[serde(default = "now_iso")]
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub current_stock: f64,
    #[serde(default)]
    pub min_stock: f64,
    #[serde(default)]
    pub cost_per_unit: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub synced: bool,
    #[serde(default = "now_iso")]
    pub updated_at: String,
}

impl InventoryItem {
    pub fn is_low_stock(&self) -> bool {
        self.current_stock <= self.min_stock
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: EntityId,
    pub order_number: i64,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub table_number: Option<String>,
    #[serde(default)]
    pub bill_type: BillType,
    #[serde(default)]
    pub subtotal: f64,
    #[serde(default)]
    pub tax_amount: f64,
    #[serde(default)]
    pub discount_amount: f64,
    #[serde(default)]
    pub total_amount: f64,
    pub status: OrderStatus,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default = "now_iso")]
    pub created_at: String,
    #[serde(default = "now_iso")]
    pub updated_at: String,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub sync_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: EntityId,
    pub order_id: EntityId,
    pub menu_item_id: String,
    #[serde(default)]
    pub menu_item_name: Option<String>,
    pub quantity: i64,
    pub unit_price: f64,
    #[serde(default)]
    pub tax_percentage: f64,
    #[serde(default)]
    pub tax_amount: f64,
    pub total_price: f64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub synced: bool,
    #[serde(default = "now_iso")]
    pub created_at: String,
}

/// A fully resolved order, the shape handed to receipt / kitchen printing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderWithItems {
    pub order: Order,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyClosing {
    pub id: EntityId,
    pub closing_date: NaiveDate,
    #[serde(default)]
    pub submitted_by: Option<String>,
    #[serde(default)]
    pub total_orders: i64,
    #[serde(default)]
    pub total_revenue: f64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub sync_error: Option<String>,
    #[serde(default = "now_iso")]
    pub created_at: String,
    #[serde(default = "now_iso")]
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockVerification {
    pub id: EntityId,
    pub closing_id: EntityId,
    pub inventory_item_id: String,
    pub system_stock: f64,
    pub physical_stock: f64,
    #[serde(default)]
    pub wastage: f64,
    #[serde(default)]
    pub variance: f64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub synced: bool,
    #[serde(default = "now_iso")]
    pub created_at: String,
}

/// `physical - system + wastage`.
pub fn stock_variance(system_stock: f64, physical_stock: f64, wastage: f64) -> f64 {
    physical_stock - system_stock + wastage
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Totals
// ---------------------------------------------------------------------------

/// Tax and line total for one order line. Estimates carry no tax.
pub fn line_amounts(quantity: i64, unit_price: f64, tax_percentage: f64, bill_type: BillType) -> (f64, f64) {
    let net = quantity as f64 * unit_price;
    let tax = match bill_type {
        BillType::TaxInvoice => round2(net * tax_percentage / 100.0),
        BillType::Estimate => 0.0,
    };
    (tax, round2(net + tax))
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OrderTotals {
    pub subtotal: f64,
    pub tax_amount: f64,
    pub total_amount: f64,
}

impl OrderTotals {
    /// Totals derived from the item rows; `total = sum(total_price) - discount`.
    pub fn from_items(items: &[OrderItem], discount_amount: f64) -> Self {
        let lines: f64 = items.iter().map(|i| i.total_price).sum();
        let tax: f64 = items.iter().map(|i| i.tax_amount).sum();
        Self {
            subtotal: round2(lines - tax),
            tax_amount: round2(tax),
            total_amount: round2(lines - discount_amount),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderDraft {
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub table_number: Option<String>,
    #[serde(default)]
    pub bill_type: BillType,
    #[serde(default)]
    pub discount_amount: f64,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    pub items: Vec<OrderLineDraft>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderLineDraft {
    pub menu_item_id: String,
    pub quantity: i64,
    #[serde(default)]
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ids_are_tagged_and_distinct() {
        let a = EntityId::mint_local();
        let b = EntityId::mint_local();
        assert!(a.is_local());
        assert!(a.as_str().starts_with(LOCAL_ID_PREFIX));
        assert_ne!(a, b);

        let remote = EntityId::remote("3f1c2a9e-0000-4000-8000-000000000001");
        assert_eq!(remote.origin(), Origin::Remote);

        let legacy = EntityId::from("offline_1700000000000_ab12");
        assert!(legacy.is_local());
    }

    #[test]
    fn test_entity_id_serializes_as_plain_string() {
        let id = EntityId::remote("ord-1");
        assert_eq!(serde_json::to_value(&id).unwrap(), serde_json::json!("ord-1"));
        let back: EntityId = serde_json::from_value(serde_json::json!("local_1_x")).unwrap();
        assert!(back.is_local());
    }

    #[test]
    fn test_status_transitions() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Preparing));
        assert!(Preparing.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Ready));
        assert!(!Preparing.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Preparing));
    }

    #[test]
    fn test_line_amounts_respect_bill_type() {
        assert_eq!(line_amounts(2, 100.0, 5.0, BillType::TaxInvoice), (10.0, 210.0));
        assert_eq!(line_amounts(2, 100.0, 5.0, BillType::Estimate), (0.0, 200.0));
        assert_eq!(line_amounts(1, 50.0, 0.0, BillType::TaxInvoice), (0.0, 50.0));
    }

    #[test]
    fn test_variance_formula() {
        assert_eq!(stock_variance(10.0, 8.0, 1.5), -0.5);
        assert_eq!(stock_variance(5.0, 5.0, 0.0), 0.0);
    }
}
