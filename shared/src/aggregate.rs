//! Reduction of raw sales lines into per-(location, item) aggregates.

use chrono::{Duration, NaiveDate};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::{LocationTotals, SalesAggregate, SalesLineItem};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SalesReduction {
    pub aggregates: Vec<SalesAggregate>,
    pub totals: BTreeMap<String, LocationTotals>,
}

/// First day covered by a window of `window_days` ending (exclusive) at `window_end`.
pub fn window_start(window_end: NaiveDate, window_days: u32) -> NaiveDate {
    window_end - Duration::days(i64::from(window_days))
}

/// Groups `items` by (location, item) and sums them.
///
/// Only lines sold within `[window_end - window_days, window_end)` count.
/// Weekly buckets are measured back from the day before `window_end`; bucket 0
/// is the most recent seven days. Lines are folded in a canonical order so the
/// result does not depend on the order of `items`.
///
/// `window_days` must be at least 1.
pub fn reduce(items: &[SalesLineItem], window_days: u32, window_end: NaiveDate) -> SalesReduction {
    debug_assert!(window_days >= 1, "window_days must be >= 1");
    let weeks = f64::from(window_days) / 7.0;
    let start = window_start(window_end, window_days);

    let mut ordered: Vec<&SalesLineItem> = items
        .iter()
        .filter(|item| item.sold_on >= start && item.sold_on < window_end)
        .collect();
    ordered.sort_by(|a, b| canonical_order(a, b));

    let mut grouped: BTreeMap<(String, String), SalesAggregate> = BTreeMap::new();
    let mut totals: BTreeMap<String, LocationTotals> = BTreeMap::new();

    for item in ordered {
        let entry = grouped
            .entry((item.location.clone(), item.item_id.clone()))
            .or_insert_with(|| SalesAggregate {
                location: item.location.clone(),
                item_id: item.item_id.clone(),
                quantity: 0.0,
                gross: 0.0,
                discounts: 0.0,
                net_revenue: 0.0,
                cost: 0.0,
                weekly: [0.0; 4],
                weekly_velocity: 0.0,
            });
        entry.quantity += item.quantity;
        entry.gross += item.gross;
        entry.discounts += item.discounts;
        entry.net_revenue += item.net_revenue;
        entry.cost += item.cost;

        let days_back = (window_end - item.sold_on).num_days() - 1;
        let bucket = (days_back / 7) as usize;
        if bucket < 4 {
            entry.weekly[bucket] += item.quantity;
        }

        let location = totals.entry(item.location.clone()).or_default();
        location.net_revenue += item.net_revenue;
        location.gross += item.gross;
        location.discounts += item.discounts;
        location.cost += item.cost;
        location.quantity += item.quantity;
    }

    let aggregates = grouped
        .into_values()
        .map(|mut aggregate| {
            aggregate.weekly_velocity = aggregate.quantity / weeks;
            aggregate
        })
        .collect();

    SalesReduction { aggregates, totals }
}

fn canonical_order(a: &SalesLineItem, b: &SalesLineItem) -> Ordering {
    a.location
        .cmp(&b.location)
        .then_with(|| a.item_id.cmp(&b.item_id))
        .then_with(|| a.line_id.cmp(&b.line_id))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.quantity.total_cmp(&b.quantity))
        .then_with(|| a.gross.total_cmp(&b.gross))
        .then_with(|| a.discounts.total_cmp(&b.discounts))
        .then_with(|| a.net_revenue.total_cmp(&b.net_revenue))
        .then_with(|| a.cost.total_cmp(&b.cost))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn line(id: &str, location: &str, item: &str, quantity: f64, net: f64, sold_on: NaiveDate) -> SalesLineItem {
        SalesLineItem {
            line_id: id.to_string(),
            location: location.to_string(),
            item_id: item.to_string(),
            quantity,
            gross: net + 1.0,
            discounts: 1.0,
            net_revenue: net,
            cost: net * 0.4,
            created_at: format!("{}T12:00:00Z", sold_on),
            sold_on,
        }
    }

    fn sample() -> Vec<SalesLineItem> {
        vec![
            line("o1:0", "Downtown", "v1", 2.0, 20.1, day(28)),
            line("o2:0", "Downtown", "v1", 3.0, 30.7, day(20)),
            line("o3:0", "Downtown", "v2", 1.0, 0.3, day(10)),
            line("o4:0", "Uptown", "v1", 4.0, 40.9, day(3)),
            line("o5:0", "Uptown", "v1", 0.5, 5.55, day(27)),
            line("o6:0", "Downtown", "v1", 1.0, 0.1, day(27)),
        ]
    }

    #[test]
    fn sums_per_location_and_item() {
        let end = day(29);
        let reduction = reduce(&sample(), 28, end);

        assert_eq!(reduction.aggregates.len(), 3);
        let downtown_v1 = &reduction.aggregates[0];
        assert_eq!(downtown_v1.location, "Downtown");
        assert_eq!(downtown_v1.item_id, "v1");
        assert_eq!(downtown_v1.quantity, 6.0);
        assert_eq!(downtown_v1.weekly, [3.0, 3.0, 0.0, 0.0]);
        assert!((downtown_v1.weekly_velocity - 1.5).abs() < 1e-9);

        let uptown = &reduction.totals["Uptown"];
        assert_eq!(uptown.quantity, 4.5);
        assert!((uptown.net_revenue - 46.45).abs() < 1e-9);
    }

    #[test]
    fn ignores_lines_outside_window() {
        let end = day(29);
        let mut items = sample();
        items.push(line("late:0", "Downtown", "v9", 5.0, 50.0, day(29)));
        items.push(line("early:0", "Downtown", "v9", 5.0, 50.0, NaiveDate::from_ymd_opt(2026, 2, 28).unwrap()));

        let reduction = reduce(&items, 28, end);
        assert!(reduction.aggregates.iter().all(|a| a.item_id != "v9"));
    }

    #[test]
    fn output_does_not_depend_on_input_order() {
        let end = day(29);
        let items = sample();
        let expected = reduce(&items, 28, end);

        let mut reversed = items.clone();
        reversed.reverse();
        assert_eq!(reduce(&reversed, 28, end), expected);

        for shift in 1..items.len() {
            let mut rotated = items.clone();
            rotated.rotate_left(shift);
            assert_eq!(reduce(&rotated, 28, end), expected);
        }

        let mut interleaved: Vec<SalesLineItem> = items.iter().step_by(2).cloned().collect();
        interleaved.extend(items.iter().skip(1).step_by(2).cloned());
        assert_eq!(reduce(&interleaved, 28, end), expected);
    }

    #[test]
    fn velocity_uses_window_weeks() {
        let end = day(29);
        let items = vec![line("o1:0", "A", "v1", 56.0, 560.0, day(15))];
        let reduction = reduce(&items, 28, end);
        assert!((reduction.aggregates[0].weekly_velocity - 14.0).abs() < 1e-9);
    }
}
