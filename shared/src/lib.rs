use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, NaiveDate, Utc};

pub mod aggregate;
pub mod analytics;
pub mod catalog;

pub use aggregate::{reduce, SalesReduction};
pub use analytics::{compute, AnalyticsParams};
pub use catalog::{refine_category, CostOverride, CostOverrides};

/// A retail location after filtering and name cleaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub import_id: String,
    pub name: String,
    pub display_name: String,
}

impl Location {
    /// The id the upstream expects for per-location queries.
    pub fn api_id(&self) -> &str {
        if self.import_id.is_empty() {
            &self.id
        } else {
            &self.import_id
        }
    }

    pub fn matches_id(&self, id: &str) -> bool {
        !id.is_empty() && (self.id == id || self.import_id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryLine {
    pub location: String,
    pub item_id: String,
    pub product: String,
    pub category: String,
    pub brand: String,
    pub supplier: String,
    pub on_hand: f64,
    pub unit_cost: f64,
    pub unit_price: f64,
    pub inventory_cost: f64,
    pub inventory_retail: f64,
}

impl InventoryLine {
    pub fn key(&self) -> (String, String) {
        (self.location.clone(), self.item_id.clone())
    }

    /// Folds a duplicate upstream row for the same (location, item) into this one.
    pub fn absorb(&mut self, other: &InventoryLine) {
        self.on_hand += other.on_hand;
        self.inventory_cost += other.inventory_cost;
        self.inventory_retail += other.inventory_retail;
        if self.supplier.is_empty() && !other.supplier.is_empty() {
            self.supplier = other.supplier.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesLineItem {
    pub line_id: String,
    pub location: String,
    pub item_id: String,
    pub quantity: f64,
    pub gross: f64,
    pub discounts: f64,
    pub net_revenue: f64,
    pub cost: f64,
    /// Upstream creation timestamp, ISO-8601. Compared lexicographically for cursors.
    pub created_at: String,
    pub sold_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesAggregate {
    pub location: String,
    pub item_id: String,
    pub quantity: f64,
    pub gross: f64,
    pub discounts: f64,
    pub net_revenue: f64,
    pub cost: f64,
    /// Quantity per trailing week, most recent first.
    pub weekly: [f64; 4],
    pub weekly_velocity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationTotals {
    pub net_revenue: f64,
    pub gross: f64,
    pub discounts: f64,
    pub cost: f64,
    pub quantity: f64,
}

/// Per-location sales watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub location: String,
    pub value: String,
    pub synced_at: DateTime<Utc>,
}

impl Cursor {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.synced_at
    }

    /// Advances to `observed` only when it sorts after the current value.
    pub fn advance(&self, observed: Option<&str>, now: DateTime<Utc>) -> Cursor {
        let value = match observed {
            Some(candidate) if candidate > self.value.as_str() => candidate.to_string(),
            _ => self.value.clone(),
        };
        Cursor {
            location: self.location.clone(),
            value,
            synced_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MovementClass {
    A,
    B,
    C,
    D,
}

impl MovementClass {
    pub fn from_velocity(velocity: f64) -> Self {
        if velocity >= 20.0 {
            MovementClass::A
        } else if velocity >= 10.0 {
            MovementClass::B
        } else if velocity >= 3.0 {
            MovementClass::C
        } else {
            MovementClass::D
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub location_count: usize,
    pub product_count: usize,
    pub net_revenue: f64,
    pub gross_sales: f64,
    pub discounts: f64,
    pub cost: f64,
    pub gross_profit: f64,
    pub margin: f64,
    pub discount_rate: f64,
    pub units_sold: f64,
    pub inventory_cost: f64,
    pub inventory_units: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRollup {
    pub location: String,
    pub net_revenue: f64,
    pub cost: f64,
    pub margin: f64,
    pub discounts: f64,
    pub units: f64,
    pub product_count: usize,
    pub inventory_cost: f64,
    pub inventory_units: f64,
    pub dead_stock_cost: f64,
    pub dead_stock_pct: f64,
    pub overstock_cost: f64,
    pub order_units: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRow {
    pub location: String,
    pub item_id: String,
    pub product: String,
    pub brand: String,
    pub category: String,
    pub supplier: String,
    pub class: MovementClass,
    pub velocity: f64,
    pub velocity_estimated: bool,
    pub units_sold: f64,
    pub on_hand: f64,
    pub weeks_of_supply: Option<f64>,
    pub par: f64,
    pub order_quantity: f64,
    pub net_revenue: f64,
    pub cost: f64,
    pub margin: f64,
    pub trend: f64,
    pub weekly: [f64; 4],
    pub inventory_cost: f64,
    pub inventory_retail: f64,
    pub unit_cost: f64,
    pub unit_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub stats: GlobalStats,
    pub locations: Vec<LocationRollup>,
    pub products: Vec<ProductRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebuildPhase {
    Idle,
    LockAcquiring,
    Inventory,
    Sales,
    Finalizing,
    Complete,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildProgress {
    pub run_id: Uuid,
    pub phase: RebuildPhase,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RebuildProgress {
    pub fn new(run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            phase: RebuildPhase::LockAcquiring,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn advance(&mut self, phase: RebuildPhase) {
        self.phase = phase;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryMeta {
    pub refreshed_at: DateTime<Utc>,
    pub lines: usize,
    pub units: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesMeta {
    pub refreshed_at: DateTime<Utc>,
    pub window_end: NaiveDate,
    pub window_days: u32,
    pub aggregates: usize,
    pub raw_items: usize,
    pub preserved: bool,
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
