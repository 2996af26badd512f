//! Replenishment and profitability analytics.
//!
//! [`compute`] joins the inventory snapshot with the sales aggregate and
//! derives the dashboard views. It reads no clock and touches no I/O, so the
//! same inputs always serialize to the same bytes.

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};

use crate::aggregate::window_start;
use crate::catalog::CostOverrides;
use crate::{
    round_to, DashboardSnapshot, GlobalStats, InventoryLine, LocationRollup, LocationTotals,
    MovementClass, ProductRow, SalesAggregate,
};

/// Weeks-of-supply at or beyond this value is reported as unbounded.
pub const WEEKS_OF_SUPPLY_CAP: f64 = 999.0;
pub const OVERSTOCK_WEEKS: f64 = 8.0;

pub const DEFAULT_TARGET_WEEKS: f64 = 2.5;
pub const DEFAULT_WINDOW_DAYS: u32 = 31;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyticsParams {
    pub target_weeks_of_supply: f64,
    pub window_days: u32,
    /// Exclusive end of the sales window.
    pub window_end: NaiveDate,
}

impl AnalyticsParams {
    pub fn weeks(&self) -> f64 {
        f64::from(self.window_days) / 7.0
    }
}

struct Accumulated {
    row: ProductRow,
    dead: bool,
    overstock: bool,
}

pub fn compute(
    inventory: &[InventoryLine],
    sales: &[SalesAggregate],
    totals: &BTreeMap<String, LocationTotals>,
    overrides: &CostOverrides,
    params: &AnalyticsParams,
) -> DashboardSnapshot {
    let weeks = params.weeks();

    let mut stock: BTreeMap<(String, String), InventoryLine> = BTreeMap::new();
    for line in inventory {
        match stock.get_mut(&(line.location.clone(), line.item_id.clone())) {
            Some(existing) => existing.absorb(line),
            None => {
                stock.insert(line.key(), line.clone());
            }
        }
    }

    let mut sold: BTreeMap<(&str, &str), &SalesAggregate> = BTreeMap::new();
    let mut velocities_by_item: BTreeMap<&str, BTreeMap<&str, f64>> = BTreeMap::new();
    let mut selling_locations: BTreeSet<&str> = BTreeSet::new();
    for aggregate in sales {
        sold.insert((aggregate.location.as_str(), aggregate.item_id.as_str()), aggregate);
        velocities_by_item
            .entry(aggregate.item_id.as_str())
            .or_default()
            .insert(aggregate.location.as_str(), aggregate.weekly_velocity);
        selling_locations.insert(aggregate.location.as_str());
    }
    let network_velocity: BTreeMap<&str, f64> = velocities_by_item
        .iter()
        .map(|(item, per_location)| {
            let sum: f64 = per_location.values().sum();
            (*item, sum / per_location.len() as f64)
        })
        .collect();

    let mut products: Vec<Accumulated> = Vec::with_capacity(stock.len());
    for ((location, item_id), line) in &stock {
        let aggregate = sold.get(&(location.as_str(), item_id.as_str())).copied();

        let mut units_sold = aggregate.map(|a| a.quantity).unwrap_or(0.0);
        let mut velocity = aggregate.map(|a| a.weekly_velocity).unwrap_or(0.0);
        let net_revenue = aggregate.map(|a| a.net_revenue).unwrap_or(0.0);
        let mut cost = aggregate.map(|a| a.cost).unwrap_or(0.0);
        let weekly = aggregate.map(|a| a.weekly).unwrap_or([0.0; 4]);

        // Locations with no sales activity at all borrow the network average.
        let mut velocity_estimated = false;
        if units_sold == 0.0 && !selling_locations.contains(location.as_str()) {
            if let Some(estimate) = network_velocity.get(item_id.as_str()) {
                velocity = *estimate;
                units_sold = estimate * weeks;
                velocity_estimated = true;
            }
        }

        if let Some(unit_cost) = overrides.unit_cost(&line.brand, &line.category) {
            cost = units_sold * unit_cost;
        }

        let supply_ratio = (velocity > 0.0).then(|| line.on_hand / velocity);
        let weeks_of_supply = supply_ratio
            .filter(|ratio| *ratio < WEEKS_OF_SUPPLY_CAP)
            .map(|ratio| round_to(ratio, 1));
        let par = if velocity > 0.0 {
            (velocity * params.target_weeks_of_supply).round().max(0.0)
        } else {
            0.0
        };
        let order_quantity = (par - line.on_hand).max(0.0);

        let row = ProductRow {
            location: location.clone(),
            item_id: item_id.clone(),
            product: line.product.clone(),
            brand: line.brand.clone(),
            category: line.category.clone(),
            supplier: line.supplier.clone(),
            class: MovementClass::from_velocity(velocity),
            velocity: round_to(velocity, 2),
            velocity_estimated,
            units_sold: round_to(units_sold, 2),
            on_hand: line.on_hand,
            weeks_of_supply,
            par,
            order_quantity,
            net_revenue: round_to(net_revenue, 2),
            cost: round_to(cost, 2),
            margin: margin_pct(net_revenue, cost),
            trend: trend_pct(&weekly),
            weekly,
            inventory_cost: round_to(line.inventory_cost, 2),
            inventory_retail: round_to(line.inventory_retail, 2),
            unit_cost: line.unit_cost,
            unit_price: line.unit_price,
        };
        products.push(Accumulated {
            row,
            dead: velocity == 0.0,
            // Unbounded supply is reported as null and is not counted as overstock.
            overstock: weeks_of_supply.is_some_and(|weeks| weeks > OVERSTOCK_WEEKS),
        });
    }

    let locations = rollups(&products, totals);
    let stats = global_stats(&products, &locations, totals, params);

    DashboardSnapshot {
        stats,
        locations,
        products: products.into_iter().map(|p| p.row).collect(),
    }
}

fn rollups(products: &[Accumulated], totals: &BTreeMap<String, LocationTotals>) -> Vec<LocationRollup> {
    let mut by_location: BTreeMap<&str, Vec<&Accumulated>> = BTreeMap::new();
    for product in products {
        by_location.entry(product.row.location.as_str()).or_default().push(product);
    }

    let empty = LocationTotals::default();
    by_location
        .into_iter()
        .map(|(location, rows)| {
            let sales = totals.get(location).unwrap_or(&empty);
            // Bottom-up so overridden product costs reconcile with the rollup.
            let cost: f64 = rows.iter().map(|p| p.row.cost).sum();
            let inventory_cost: f64 = rows.iter().map(|p| p.row.inventory_cost).sum();
            let dead_stock_cost: f64 = rows
                .iter()
                .filter(|p| p.dead)
                .map(|p| p.row.inventory_cost)
                .sum();
            let overstock_cost: f64 = rows
                .iter()
                .filter(|p| p.overstock)
                .map(|p| p.row.inventory_cost)
                .sum();

            LocationRollup {
                location: location.to_string(),
                net_revenue: round_to(sales.net_revenue, 2),
                cost: round_to(cost, 2),
                margin: margin_pct(sales.net_revenue, cost),
                discounts: round_to(sales.discounts, 2),
                units: sales.quantity,
                product_count: rows.len(),
                inventory_cost: round_to(inventory_cost, 2),
                inventory_units: rows.iter().map(|p| p.row.on_hand).sum(),
                dead_stock_cost: round_to(dead_stock_cost, 2),
                dead_stock_pct: if inventory_cost > 0.0 {
                    round_to(dead_stock_cost / inventory_cost * 100.0, 1)
                } else {
                    0.0
                },
                overstock_cost: round_to(overstock_cost, 2),
                order_units: rows.iter().map(|p| p.row.order_quantity).sum(),
            }
        })
        .collect()
}

fn global_stats(
    products: &[Accumulated],
    locations: &[LocationRollup],
    totals: &BTreeMap<String, LocationTotals>,
    params: &AnalyticsParams,
) -> GlobalStats {
    let net_revenue: f64 = totals.values().map(|t| t.net_revenue).sum();
    let gross_sales: f64 = totals.values().map(|t| t.gross).sum();
    let discounts: f64 = totals.values().map(|t| t.discounts).sum();
    let units_sold: f64 = totals.values().map(|t| t.quantity).sum();
    let cost: f64 = locations.iter().map(|l| l.cost).sum();

    GlobalStats {
        period_start: window_start(params.window_end, params.window_days),
        period_end: params.window_end,
        location_count: locations.len(),
        product_count: products.len(),
        net_revenue: round_to(net_revenue, 2),
        gross_sales: round_to(gross_sales, 2),
        discounts: round_to(discounts, 2),
        cost: round_to(cost, 2),
        gross_profit: round_to(net_revenue - cost, 2),
        margin: margin_pct(net_revenue, cost),
        discount_rate: if gross_sales > 0.0 {
            round_to(discounts / gross_sales * 100.0, 1)
        } else {
            0.0
        },
        units_sold,
        inventory_cost: round_to(products.iter().map(|p| p.row.inventory_cost).sum(), 2),
        inventory_units: products.iter().map(|p| p.row.on_hand).sum(),
    }
}

fn margin_pct(net_revenue: f64, cost: f64) -> f64 {
    if net_revenue > 0.0 {
        round_to((net_revenue - cost) / net_revenue * 100.0, 1)
    } else {
        0.0
    }
}

/// Latest week against the mean of the three weeks before it.
fn trend_pct(weekly: &[f64; 4]) -> f64 {
    let current = weekly[0];
    let prior = (weekly[1] + weekly[2] + weekly[3]) / 3.0;
    if prior > 0.0 {
        round_to((current - prior) / prior * 100.0, 1)
    } else if current > 0.0 {
        100.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CostOverride;

    fn params() -> AnalyticsParams {
        AnalyticsParams {
            target_weeks_of_supply: 2.5,
            window_days: 28,
            window_end: NaiveDate::from_ymd_opt(2026, 3, 29).unwrap(),
        }
    }

    fn stock(location: &str, item: &str, on_hand: f64, unit_cost: f64, unit_price: f64) -> InventoryLine {
        InventoryLine {
            location: location.to_string(),
            item_id: item.to_string(),
            product: format!("Product {}", item),
            category: "Flower".to_string(),
            brand: "Acme".to_string(),
            supplier: "Acme Supply".to_string(),
            on_hand,
            unit_cost,
            unit_price,
            inventory_cost: on_hand * unit_cost,
            inventory_retail: on_hand * unit_price,
        }
    }

    fn sale(location: &str, item: &str, quantity: f64, net: f64, cost: f64, weeks: f64) -> SalesAggregate {
        SalesAggregate {
            location: location.to_string(),
            item_id: item.to_string(),
            quantity,
            gross: net,
            discounts: 0.0,
            net_revenue: net,
            cost,
            weekly: [quantity / 4.0; 4],
            weekly_velocity: quantity / weeks,
        }
    }

    fn totals_for(sales: &[SalesAggregate]) -> BTreeMap<String, LocationTotals> {
        let mut totals: BTreeMap<String, LocationTotals> = BTreeMap::new();
        for s in sales {
            let t = totals.entry(s.location.clone()).or_default();
            t.net_revenue += s.net_revenue;
            t.gross += s.gross;
            t.cost += s.cost;
            t.quantity += s.quantity;
        }
        totals
    }

    #[test]
    fn replenishment_figures_for_steady_seller() {
        let inventory = vec![stock("A", "v1", 20.0, 5.0, 10.0)];
        let sales = vec![sale("A", "v1", 56.0, 560.0, 280.0, 4.0)];
        let snapshot = compute(&inventory, &sales, &totals_for(&sales), &CostOverrides::default(), &params());

        let row = &snapshot.products[0];
        assert_eq!(row.velocity, 14.0);
        assert_eq!(row.class, MovementClass::B);
        assert_eq!(row.weeks_of_supply, Some(1.4));
        assert_eq!(row.par, 35.0);
        assert_eq!(row.order_quantity, 15.0);
        assert_eq!(row.margin, 50.0);
        assert!(!row.velocity_estimated);
    }

    #[test]
    fn location_without_sales_borrows_network_velocity() {
        let inventory = vec![stock("X", "v1", 5.0, 5.0, 10.0), stock("Y", "v1", 30.0, 5.0, 10.0)];
        let sales = vec![sale("X", "v1", 40.0, 400.0, 200.0, 4.0)];
        let snapshot = compute(&inventory, &sales, &totals_for(&sales), &CostOverrides::default(), &params());

        let y = snapshot.products.iter().find(|p| p.location == "Y").unwrap();
        assert_eq!(y.velocity, 10.0);
        assert!(y.velocity_estimated);
        assert_eq!(y.units_sold, 40.0);
        assert_eq!(y.weeks_of_supply, Some(3.0));
    }

    #[test]
    fn unsold_item_at_active_location_has_zero_velocity() {
        let inventory = vec![stock("X", "v1", 5.0, 5.0, 10.0), stock("X", "v2", 8.0, 2.0, 4.0)];
        let sales = vec![sale("X", "v1", 40.0, 400.0, 200.0, 4.0), sale("Z", "v2", 12.0, 48.0, 24.0, 4.0)];
        let snapshot = compute(&inventory, &sales, &totals_for(&sales), &CostOverrides::default(), &params());

        let v2 = snapshot.products.iter().find(|p| p.item_id == "v2").unwrap();
        assert_eq!(v2.velocity, 0.0);
        assert_eq!(v2.weeks_of_supply, None);
        assert_eq!(v2.par, 0.0);
        assert_eq!(v2.class, MovementClass::D);

        let rollup = &snapshot.locations[0];
        assert_eq!(rollup.dead_stock_cost, 16.0);
        assert_eq!(rollup.dead_stock_pct, round_to(16.0 / 41.0 * 100.0, 1));
    }

    #[test]
    fn cost_override_recomputes_costs_bottom_up() {
        let mut prerolls = stock("A", "v2", 10.0, 4.0, 12.0);
        prerolls.category = "Pre-Rolls".to_string();
        let inventory = vec![stock("A", "v1", 20.0, 5.0, 10.0), prerolls, stock("B", "v1", 4.0, 5.0, 10.0)];
        let sales = vec![
            sale("A", "v1", 56.0, 560.0, 280.0, 4.0),
            sale("A", "v2", 8.0, 96.0, 999.0, 4.0),
            sale("B", "v1", 12.0, 120.0, 60.0, 4.0),
            sale("A", "sold-out", 3.0, 30.0, 15.0, 4.0),
        ];
        let overrides = CostOverrides::new(vec![CostOverride {
            brand: "acme".to_string(),
            category: "pre-rolls".to_string(),
            unit_cost: 2.5,
        }]);
        let snapshot = compute(&inventory, &sales, &totals_for(&sales), &overrides, &params());

        let v2 = snapshot.products.iter().find(|p| p.item_id == "v2").unwrap();
        assert_eq!(v2.cost, 20.0);

        for rollup in &snapshot.locations {
            let product_sum: f64 = snapshot
                .products
                .iter()
                .filter(|p| p.location == rollup.location)
                .map(|p| p.cost)
                .sum();
            assert!((product_sum - rollup.cost).abs() < 0.01);

            let inventory_sum: f64 = snapshot
                .products
                .iter()
                .filter(|p| p.location == rollup.location)
                .map(|p| p.inventory_cost)
                .sum();
            assert!((inventory_sum - rollup.inventory_cost).abs() < 0.01);
        }
        assert_eq!(snapshot.locations[0].cost, 300.0);

        let location_sum: f64 = snapshot.locations.iter().map(|l| l.cost).sum();
        assert!((location_sum - snapshot.stats.cost).abs() < 0.01);
    }

    #[test]
    fn unbounded_supply_is_not_overstock() {
        let inventory = vec![stock("A", "slow", 100.0, 1.0, 2.0), stock("A", "crawl", 5000.0, 1.0, 2.0)];
        let sales = vec![sale("A", "slow", 4.0, 8.0, 4.0, 4.0), sale("A", "crawl", 0.02, 0.04, 0.02, 4.0)];
        let snapshot = compute(&inventory, &sales, &totals_for(&sales), &CostOverrides::default(), &params());

        let crawl = snapshot.products.iter().find(|p| p.item_id == "crawl").unwrap();
        assert_eq!(crawl.weeks_of_supply, None);
        let slow = snapshot.products.iter().find(|p| p.item_id == "slow").unwrap();
        assert_eq!(slow.weeks_of_supply, Some(100.0));
        assert_eq!(snapshot.locations[0].overstock_cost, 100.0);
    }

    #[test]
    fn trend_special_cases() {
        assert_eq!(trend_pct(&[10.0, 5.0, 5.0, 5.0]), 100.0);
        assert_eq!(trend_pct(&[3.0, 0.0, 0.0, 0.0]), 100.0);
        assert_eq!(trend_pct(&[0.0, 0.0, 0.0, 0.0]), 0.0);
        assert_eq!(trend_pct(&[2.0, 4.0, 4.0, 4.0]), -50.0);
    }

    #[test]
    fn identical_inputs_serialize_identically() {
        let inventory = vec![stock("A", "v1", 20.0, 5.0, 10.0), stock("B", "v1", 3.0, 5.0, 10.0), stock("A", "v1", 2.0, 5.0, 10.0)];
        let sales = vec![sale("A", "v1", 56.0, 560.0, 280.0, 4.0)];
        let totals = totals_for(&sales);

        let first = compute(&inventory, &sales, &totals, &CostOverrides::default(), &params());
        let second = compute(&inventory, &sales, &totals, &CostOverrides::default(), &params());
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
        assert_eq!(first.products.len(), 2);
        assert_eq!(first.products[0].on_hand, 22.0);
    }
}
