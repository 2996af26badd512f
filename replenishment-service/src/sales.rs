//! Cursor-driven incremental sales sync.
//!
//! Each location keeps a watermark cursor and the cleaned line items of the
//! current window. A fresh cursor means only orders created after it are
//! fetched and merged into the stored lines; a missing or stale cursor
//! re-fetches the whole window. Either way the stored lines are pruned to the
//! window, so the aggregate can always be rebuilt wholesale from them.
//!
//! Cursor values are upstream ISO-8601 timestamps compared as strings. That
//! only holds while the upstream formats every timestamp the same way.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use shared::aggregate::window_start;
use shared::{Cursor, Location, SalesLineItem};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{keys, Cache};
use crate::config::{PipelineConfig, CURSOR_MAX_AGE_DAYS, CURSOR_TTL};
use crate::error::UpstreamError;
use crate::upstream::{OrderQuery, Upstream, UpstreamOrder};

#[derive(Debug, Clone, PartialEq)]
pub enum FetchMode {
    Incremental { since: String },
    Full,
}

#[derive(Debug, Clone)]
pub struct LocationSync {
    pub location: String,
    pub mode: FetchMode,
    /// New lines fetched this run; `None` if the fetch failed.
    pub fetched: Option<usize>,
    /// Every stored line inside the window after merging.
    pub items: Vec<SalesLineItem>,
    pub cursor: Option<Cursor>,
}

impl LocationSync {
    pub fn failed(&self) -> bool {
        self.fetched.is_none()
    }
}

/// Sales windows end (exclusive) at the start of the current UTC day so a
/// still-accumulating day is never counted.
pub fn window_end(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

pub fn plan(cursor: Option<&Cursor>, now: DateTime<Utc>) -> FetchMode {
    match cursor {
        Some(cursor) if cursor.age(now) <= Duration::days(CURSOR_MAX_AGE_DAYS) => FetchMode::Incremental {
            since: cursor.value.clone(),
        },
        _ => FetchMode::Full,
    }
}

pub struct SalesCursorSync {
    upstream: Arc<dyn Upstream>,
    cache: Cache,
    window_days: u32,
    max_workers: usize,
    page_size: u32,
    page_delay: std::time::Duration,
}

impl SalesCursorSync {
    pub fn new(upstream: Arc<dyn Upstream>, cache: Cache, config: &PipelineConfig) -> Self {
        Self {
            upstream,
            cache,
            window_days: config.window_days.max(1),
            max_workers: config.max_workers.max(1),
            page_size: config.page_size.max(1),
            page_delay: config.page_delay,
        }
    }

    /// Syncs every location with bounded concurrency. A failing location is
    /// reported and keeps its previous lines; it never aborts the others.
    pub async fn sync(&self, locations: &[Location], now: DateTime<Utc>) -> Vec<LocationSync> {
        let mut results: Vec<LocationSync> = stream::iter(
            locations
                .iter()
                .map(|location| self.sync_location(location, now))
                .collect::<Vec<_>>(),
        )
        .buffer_unordered(self.max_workers)
        .collect()
        .await;
        results.sort_by(|a, b| a.location.cmp(&b.location));

        let failed = results.iter().filter(|r| r.failed()).count();
        let fetched: usize = results.iter().filter_map(|r| r.fetched).sum();
        info!(locations = results.len(), failed, fetched, "Sales sync finished");
        results
    }

    async fn sync_location(&self, location: &Location, now: DateTime<Utc>) -> LocationSync {
        let name = location.display_name.clone();
        let cursor: Option<Cursor> = self.cache.get_json_or_miss(&keys::cursor(&name)).await;
        let stored: Vec<SalesLineItem> = self
            .cache
            .get_json_or_miss(&keys::sales_items(&name))
            .await
            .unwrap_or_default();

        let end = window_end(now);
        let start = window_start(end, self.window_days);
        let mode = plan(cursor.as_ref(), now);
        let created_after = match &mode {
            FetchMode::Incremental { since } => since.clone(),
            FetchMode::Full => start.to_string(),
        };
        debug!(location = %name, mode = ?mode, "Syncing sales");

        let orders = match self.fetch_orders(location, created_after, end.to_string()).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(location = %name, "Sales fetch failed, keeping previous lines: {}", e);
                return LocationSync {
                    location: name,
                    mode,
                    fetched: None,
                    items: within_window(stored, start, end),
                    cursor,
                };
            }
        };

        let observed = orders
            .iter()
            .map(|o| o.created_at.as_str())
            .filter(|ts| !ts.is_empty())
            .max()
            .map(str::to_string);
        let fresh = clean_orders(&name, &orders);
        let fetched = fresh.len();

        let merged = match mode {
            FetchMode::Full => fresh,
            FetchMode::Incremental { .. } => merge_lines(stored, fresh),
        };
        let items = within_window(merged, start, end);

        let next_cursor = match &cursor {
            Some(previous) => Some(previous.advance(observed.as_deref(), now)),
            None => observed.map(|value| Cursor {
                location: name.clone(),
                value,
                synced_at: now,
            }),
        };

        // Lines before the cursor, so a crash in between only causes a re-fetch.
        if let Err(e) = self.cache.set_json(&keys::sales_items(&name), &items, CURSOR_TTL).await {
            warn!(location = %name, "Failed to persist sales lines: {}", e);
        } else if let Some(cursor) = &next_cursor {
            if let Err(e) = self.cache.set_json(&keys::cursor(&name), cursor, CURSOR_TTL).await {
                warn!(location = %name, "Failed to persist cursor: {}", e);
            }
        }

        info!(location = %name, fetched, stored = items.len(), "Location sales synced");
        LocationSync {
            location: name,
            mode,
            fetched: Some(fetched),
            items,
            cursor: next_cursor,
        }
    }

    /// Pages through orders oldest first; the running maximum creation time is
    /// only a safe watermark under ascending order.
    async fn fetch_orders(
        &self,
        location: &Location,
        created_after: String,
        created_before: String,
    ) -> Result<Vec<UpstreamOrder>, UpstreamError> {
        let mut orders: Vec<UpstreamOrder> = Vec::new();
        let mut page = 1;
        loop {
            let query = OrderQuery {
                created_after: created_after.clone(),
                created_before: created_before.clone(),
                page,
                page_size: self.page_size,
            };
            let batch = self.upstream.orders_page(location.api_id(), &query).await?;
            let received = batch.orders.len();

            if let (Some(last), Some(first)) = (orders.last(), batch.orders.first()) {
                if first.created_at < last.created_at {
                    warn!(location = %location.display_name, page, "Orders arrived out of creation order");
                }
            }
            orders.extend(batch.orders);
            debug!(location = %location.display_name, page, pulled = orders.len(), total = ?batch.total, "Fetched order page");

            // Without a reported total only a short page ends the listing.
            let reached_total = batch.total.is_some_and(|total| orders.len() as u64 >= total);
            if received < self.page_size as usize || reached_total {
                break;
            }
            page += 1;
            tokio::time::sleep(self.page_delay).await;
        }
        Ok(orders)
    }
}

/// Non-cancelled order lines as sales line items.
pub fn clean_orders(location: &str, orders: &[UpstreamOrder]) -> Vec<SalesLineItem> {
    let mut items = Vec::new();
    for order in orders.iter().filter(|o| !o.is_cancelled()) {
        let Some(sold_on) = parse_day(&order.created_at) else {
            debug!(order = %order.order_id, created_at = %order.created_at, "Skipping order with unreadable date");
            continue;
        };
        let order_key = if order.order_id.is_empty() {
            &order.created_at
        } else {
            &order.order_id
        };
        for (index, line) in order.items.iter().enumerate() {
            items.push(SalesLineItem {
                line_id: format!("{}:{}", order_key, index),
                location: location.to_string(),
                item_id: line.variant_id.clone(),
                quantity: line.quantity,
                gross: line.total_price,
                discounts: line.total_discounts,
                net_revenue: shared::round_to(line.total_price - line.total_discounts, 2),
                cost: line.total_cost,
                created_at: order.created_at.clone(),
                sold_on,
            });
        }
    }
    items
}

fn parse_day(timestamp: &str) -> Option<NaiveDate> {
    timestamp
        .get(..10)
        .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
}

/// Stored lines overlaid with fresh ones; a re-fetched line replaces its stored copy.
fn merge_lines(stored: Vec<SalesLineItem>, fresh: Vec<SalesLineItem>) -> Vec<SalesLineItem> {
    let mut by_id: BTreeMap<String, SalesLineItem> = stored
        .into_iter()
        .map(|item| (item.line_id.clone(), item))
        .collect();
    for item in fresh {
        by_id.insert(item.line_id.clone(), item);
    }
    by_id.into_values().collect()
}

fn within_window(items: Vec<SalesLineItem>, start: NaiveDate, end: NaiveDate) -> Vec<SalesLineItem> {
    items
        .into_iter()
        .filter(|item| item.sold_on >= start && item.sold_on < end)
        .collect()
}
