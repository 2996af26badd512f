use futures::stream::{self, StreamExt};
use shared::{refine_category, CostOverrides, InventoryLine, Location};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{keys, Cache};
use crate::config::{PipelineConfig, SUPPLIERS_TTL};
use crate::upstream::{Upstream, UpstreamInventoryItem};

type SupplierMemory = BTreeMap<String, String>;

pub struct InventorySnapshotBuilder {
    upstream: Arc<dyn Upstream>,
    cache: Cache,
    excluded_products: Vec<String>,
    overrides: CostOverrides,
    max_workers: usize,
    page_size: u32,
    page_delay: Duration,
}

impl InventorySnapshotBuilder {
    pub fn new(upstream: Arc<dyn Upstream>, cache: Cache, config: &PipelineConfig) -> Self {
        Self {
            upstream,
            cache,
            excluded_products: config
                .filter
                .excluded_products
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            overrides: config.overrides.clone(),
            max_workers: config.max_workers.max(1),
            page_size: config.page_size.max(1),
            page_delay: config.page_delay,
        }
    }

    /// Current on-hand inventory for `locations`, one line per (location, item).
    ///
    /// A location whose fetch fails keeps its lines from the last cached
    /// snapshot; an empty result means nothing usable came back.
    pub async fn build(&self, locations: &[Location]) -> Vec<InventoryLine> {
        let fetched: Vec<(Location, Option<Vec<UpstreamInventoryItem>>)> = stream::iter(locations.iter().cloned())
            .map(|location| async move {
                let items = self.fetch_location(&location).await;
                (location, items)
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        let mut suppliers: SupplierMemory = self
            .cache
            .get_json_or_miss(keys::SUPPLIERS)
            .await
            .unwrap_or_default();
        let learned = learn_suppliers(
            &mut suppliers,
            fetched.iter().flat_map(|(_, items)| items.iter().flatten()),
        );

        let mut merged: BTreeMap<(String, String), InventoryLine> = BTreeMap::new();
        let mut failed: Vec<&Location> = Vec::new();
        for (queried, items) in &fetched {
            let Some(items) = items else {
                failed.push(queried);
                continue;
            };
            for item in items.iter().filter(|item| belongs_to(item, queried)) {
                let Some(line) = self.normalize(item, queried, &suppliers) else {
                    continue;
                };
                match merged.get_mut(&line.key()) {
                    Some(existing) => existing.absorb(&line),
                    None => {
                        merged.insert(line.key(), line);
                    }
                }
            }
        }

        if !failed.is_empty() {
            self.carry_forward(&failed, &mut merged).await;
        }

        if learned > 0 {
            if let Err(e) = self.cache.set_json(keys::SUPPLIERS, &suppliers, SUPPLIERS_TTL).await {
                warn!("Failed to persist supplier memory: {}", e);
            }
        }

        let lines: Vec<InventoryLine> = merged.into_values().collect();
        let units: f64 = lines.iter().map(|l| l.on_hand).sum();
        let cost: f64 = lines.iter().map(|l| l.inventory_cost).sum();
        info!(lines = lines.len(), units, cost = %format!("{:.2}", cost), failed = failed.len(), "Inventory snapshot built");
        lines
    }

    /// Re-uses the last cached lines of locations whose fetch failed.
    async fn carry_forward(&self, failed: &[&Location], merged: &mut BTreeMap<(String, String), InventoryLine>) {
        let previous: Vec<InventoryLine> = self
            .cache
            .get_json_or_miss(keys::INVENTORY)
            .await
            .unwrap_or_default();
        for location in failed {
            let kept: Vec<&InventoryLine> = previous
                .iter()
                .filter(|line| line.location == location.display_name)
                .collect();
            warn!(location = %location.display_name, kept = kept.len(), "Keeping cached inventory for failed location");
            for line in kept {
                merged.insert(line.key(), line.clone());
            }
        }
    }

    async fn fetch_location(&self, location: &Location) -> Option<Vec<UpstreamInventoryItem>> {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            match self
                .upstream
                .inventory_page(location.api_id(), page, self.page_size)
                .await
            {
                Ok(batch) => {
                    let done = (batch.len() as u32) < self.page_size;
                    items.extend(batch);
                    if done {
                        break;
                    }
                }
                Err(e) => {
                    warn!(location = %location.display_name, page, "Inventory fetch failed, skipping location: {}", e);
                    return None;
                }
            }
            page += 1;
            tokio::time::sleep(self.page_delay).await;
        }
        debug!(location = %location.display_name, items = items.len(), "Fetched inventory");
        Some(items)
    }

    fn normalize(&self, item: &UpstreamInventoryItem, location: &Location, suppliers: &SupplierMemory) -> Option<InventoryLine> {
        if item.quantity <= 0.0 || item.variant_id.is_empty() {
            return None;
        }
        let product = item.product_name.to_lowercase();
        if self.excluded_products.iter().any(|excluded| product.contains(excluded)) {
            return None;
        }

        let category = refine_category(&item.item_type, &item.category, &item.product_name);
        let unit_cost = self
            .overrides
            .unit_cost(&item.brand, &category)
            .unwrap_or(item.unit_cost);
        let supplier = if item.supplier_name.is_empty() {
            suppliers.get(&item.variant_id).cloned().unwrap_or_default()
        } else {
            item.supplier_name.clone()
        };

        Some(InventoryLine {
            location: location.display_name.clone(),
            item_id: item.variant_id.clone(),
            product: item.product_name.clone(),
            category,
            brand: item.brand.clone(),
            supplier,
            on_hand: item.quantity,
            unit_cost,
            unit_price: item.unit_price,
            inventory_cost: item.quantity * unit_cost,
            inventory_retail: item.quantity * item.unit_price,
        })
    }
}

/// The endpoint may return rows for every location whatever is queried. Only
/// rows naming the queried location (by either id), or naming none, count.
fn belongs_to(item: &UpstreamInventoryItem, queried: &Location) -> bool {
    item.location_id.is_empty() || queried.matches_id(&item.location_id)
}

fn learn_suppliers<'a>(memory: &mut SupplierMemory, items: impl Iterator<Item = &'a UpstreamInventoryItem>) -> usize {
    let mut learned = 0;
    for item in items {
        if item.supplier_name.is_empty() || item.variant_id.is_empty() {
            continue;
        }
        if memory.get(&item.variant_id) != Some(&item.supplier_name) {
            memory.insert(item.variant_id.clone(), item.supplier_name.clone());
            learned += 1;
        }
    }
    learned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{stock_item, FakeUpstream};
    use shared::CostOverride;

    fn config() -> PipelineConfig {
        PipelineConfig {
            page_size: 2,
            page_delay: Duration::from_millis(0),
            ..PipelineConfig::default()
        }
    }

    async fn locations(upstream: &Arc<FakeUpstream>, cache: &Cache) -> Vec<Location> {
        crate::locations::LocationDirectory::new(upstream.clone(), cache.clone(), config().filter)
            .fetch()
            .await
    }

    #[tokio::test]
    async fn drops_empty_rows_and_merges_duplicates_across_pages() {
        let mut exit_bag = stock_item("i1", "bag", 10.0, 1.0, 2.0);
        exit_bag.product_name = "Exit Bag Large".to_string();
        let upstream = Arc::new(
            FakeUpstream::new()
                .with_location("l1", "i1", "Thrive Downtown")
                .with_stock("i1", stock_item("i1", "v1", 4.0, 5.0, 10.0))
                .with_stock("i1", stock_item("i1", "v2", 0.0, 5.0, 10.0))
                .with_stock("i1", exit_bag)
                .with_stock("i1", stock_item("", "v1", 6.0, 5.0, 10.0))
                .with_stock("i1", stock_item("i1", "v3", -2.0, 5.0, 10.0)),
        );
        let cache = Cache::in_memory();
        let locations = locations(&upstream, &cache).await;
        let builder = InventorySnapshotBuilder::new(upstream.clone(), cache, &config());

        let lines = builder.build(&locations).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].location, "Downtown");
        assert_eq!(lines[0].on_hand, 10.0);
        assert_eq!(lines[0].inventory_cost, 50.0);
        assert_eq!(lines[0].inventory_retail, 100.0);
    }

    #[tokio::test]
    async fn rows_for_excluded_locations_never_surface() {
        let upstream = Arc::new(
            FakeUpstream::new()
                .with_location("l1", "i1", "Thrive Downtown")
                .with_location("l9", "i9", "Cultivation")
                .with_stock("i1", stock_item("i9", "v1", 4.0, 5.0, 10.0))
                .with_stock("i1", stock_item("i1", "v2", 1.0, 5.0, 10.0)),
        );
        let cache = Cache::in_memory();
        let locations = locations(&upstream, &cache).await;
        let builder = InventorySnapshotBuilder::new(upstream.clone(), cache, &config());

        let lines = builder.build(&locations).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].item_id, "v2");
    }

    #[tokio::test]
    async fn supplier_memory_survives_later_omissions() {
        let upstream = Arc::new(
            FakeUpstream::new()
                .with_location("l1", "i1", "Thrive Downtown")
                .with_stock("i1", stock_item("i1", "v1", 4.0, 5.0, 10.0)),
        );
        let cache = Cache::in_memory();
        let locations = locations(&upstream, &cache).await;
        let builder = InventorySnapshotBuilder::new(upstream.clone(), cache.clone(), &config());

        assert_eq!(builder.build(&locations).await[0].supplier, "Acme Supply");

        upstream.clear_inventory();
        let mut anonymous = stock_item("i1", "v1", 3.0, 5.0, 10.0);
        anonymous.supplier_name.clear();
        upstream.state.lock().unwrap().inventory.insert("i1".to_string(), vec![anonymous]);

        let lines = builder.build(&locations).await;
        assert_eq!(lines[0].supplier, "Acme Supply");
        assert_eq!(lines[0].on_hand, 3.0);
    }

    #[tokio::test]
    async fn refines_category_then_applies_cost_override() {
        let mut preroll = stock_item("i1", "v1", 10.0, 4.0, 12.0);
        preroll.product_name = "Blue Dream Pre-Roll 1g".to_string();
        let upstream = Arc::new(
            FakeUpstream::new()
                .with_location("l1", "i1", "Thrive Downtown")
                .with_stock("i1", preroll),
        );
        let cache = Cache::in_memory();
        let locations = locations(&upstream, &cache).await;
        let config = PipelineConfig {
            overrides: CostOverrides::new(vec![CostOverride {
                brand: "ACME".to_string(),
                category: "pre-rolls".to_string(),
                unit_cost: 2.5,
            }]),
            ..config()
        };
        let builder = InventorySnapshotBuilder::new(upstream.clone(), cache, &config);

        let lines = builder.build(&locations).await;
        assert_eq!(lines[0].category, "Pre-Rolls");
        assert_eq!(lines[0].unit_cost, 2.5);
        assert_eq!(lines[0].inventory_cost, 25.0);
    }

    #[tokio::test]
    async fn unscoped_responses_are_not_double_counted() {
        let upstream = Arc::new(
            FakeUpstream::new()
                .with_location("l1", "i1", "Thrive Downtown")
                .with_location("l2", "i2", "Thrive Uptown")
                .with_stock("i1", stock_item("i1", "v1", 20.0, 5.0, 10.0))
                .with_stock("i2", stock_item("l2", "v1", 6.0, 5.0, 10.0)),
        );
        upstream.state.lock().unwrap().inventory_unscoped = true;
        let cache = Cache::in_memory();
        let locations = locations(&upstream, &cache).await;
        let builder = InventorySnapshotBuilder::new(upstream.clone(), cache, &config());

        let lines = builder.build(&locations).await;
        assert_eq!(lines.len(), 2);
        let on_hand = |name: &str| lines.iter().find(|l| l.location == name).unwrap().on_hand;
        assert_eq!(on_hand("Downtown"), 20.0);
        assert_eq!(on_hand("Uptown"), 6.0);
    }

    #[tokio::test]
    async fn failing_location_keeps_its_cached_lines() {
        let upstream = Arc::new(
            FakeUpstream::new()
                .with_location("l1", "i1", "Thrive Downtown")
                .with_location("l2", "i2", "Thrive Uptown")
                .with_stock("i1", stock_item("i1", "v1", 4.0, 5.0, 10.0))
                .with_stock("i2", stock_item("i2", "v1", 2.0, 5.0, 10.0)),
        );
        let cache = Cache::in_memory();
        let locations = locations(&upstream, &cache).await;
        let builder = InventorySnapshotBuilder::new(upstream.clone(), cache.clone(), &config());

        let first = builder.build(&locations).await;
        assert_eq!(builder.build(&locations).await, first);
        assert_eq!(first.len(), 2);

        // Nothing cached yet: the failed location simply has no lines.
        upstream.fail_location("i2");
        let partial = builder.build(&locations).await;
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].location, "Downtown");

        cache
            .set_json(keys::INVENTORY, &first, Duration::from_secs(60))
            .await
            .unwrap();
        upstream.state.lock().unwrap().inventory.insert(
            "i1".to_string(),
            vec![stock_item("i1", "v1", 9.0, 5.0, 10.0)],
        );
        let lines = builder.build(&locations).await;
        assert_eq!(lines.len(), 2);
        let downtown = lines.iter().find(|l| l.location == "Downtown").unwrap();
        let uptown = lines.iter().find(|l| l.location == "Uptown").unwrap();
        assert_eq!(downtown.on_hand, 9.0);
        assert_eq!(uptown.on_hand, 2.0);
    }
}
