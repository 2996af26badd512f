//! Scripted upstream and fixtures for component tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::UpstreamError;
use crate::upstream::{
    OrderPage, OrderQuery, Result, Upstream, UpstreamInventoryItem, UpstreamLocation, UpstreamOrder,
    UpstreamOrderItem,
};

#[derive(Default)]
pub struct FakeState {
    pub locations: Vec<UpstreamLocation>,
    pub locations_down: bool,
    pub inventory: HashMap<String, Vec<UpstreamInventoryItem>>,
    pub orders: HashMap<String, Vec<UpstreamOrder>>,
    pub failing: HashSet<String>,
    /// Every inventory query returns the rows of all locations.
    pub inventory_unscoped: bool,
    /// Order pages come back without a `total`.
    pub omit_order_total: bool,
    pub order_queries: Vec<(String, OrderQuery)>,
    pub location_calls: usize,
}

#[derive(Default)]
pub struct FakeUpstream {
    pub state: Mutex<FakeState>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_location(self, id: &str, import_id: &str, name: &str) -> Self {
        self.state.lock().unwrap().locations.push(UpstreamLocation {
            location_id: id.to_string(),
            import_id: import_id.to_string(),
            name: name.to_string(),
        });
        self
    }

    pub fn with_stock(self, location_id: &str, item: UpstreamInventoryItem) -> Self {
        self.state
            .lock()
            .unwrap()
            .inventory
            .entry(location_id.to_string())
            .or_default()
            .push(item);
        self
    }

    pub fn with_order(self, location_id: &str, order: UpstreamOrder) -> Self {
        self.push_order(location_id, order);
        self
    }

    pub fn push_order(&self, location_id: &str, order: UpstreamOrder) {
        self.state
            .lock()
            .unwrap()
            .orders
            .entry(location_id.to_string())
            .or_default()
            .push(order);
    }

    pub fn fail_location(&self, location_id: &str) {
        self.state.lock().unwrap().failing.insert(location_id.to_string());
    }

    pub fn clear_inventory(&self) {
        self.state.lock().unwrap().inventory.clear();
    }

    pub fn clear_orders(&self) {
        self.state.lock().unwrap().orders.clear();
    }

    pub fn order_queries(&self) -> Vec<(String, OrderQuery)> {
        self.state.lock().unwrap().order_queries.clone()
    }

    fn unavailable(path: &str) -> UpstreamError {
        UpstreamError::Unavailable {
            path: path.to_string(),
            attempts: 3,
        }
    }
}

fn page_of<T: Clone>(items: &[T], page: u32, page_size: u32) -> Vec<T> {
    let start = (page.saturating_sub(1) * page_size) as usize;
    items.iter().skip(start).take(page_size as usize).cloned().collect()
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn locations(&self) -> Result<Vec<UpstreamLocation>> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.location_calls += 1;
            if state.locations_down {
                Err(Self::unavailable("/v0/clientsLocations"))
            } else {
                Ok(state.locations.clone())
            }
        };
        // Let concurrent callers interleave the way a real network round trip would.
        tokio::task::yield_now().await;
        result
    }

    async fn inventory_page(
        &self,
        location_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<UpstreamInventoryItem>> {
        let state = self.state.lock().unwrap();
        if state.failing.contains(location_id) {
            return Err(Self::unavailable("/v0/inventory"));
        }
        let items: Vec<UpstreamInventoryItem> = if state.inventory_unscoped {
            let mut ids: Vec<&String> = state.inventory.keys().collect();
            ids.sort();
            ids.into_iter().flat_map(|id| state.inventory[id].clone()).collect()
        } else {
            state.inventory.get(location_id).cloned().unwrap_or_default()
        };
        Ok(page_of(&items, page, page_size))
    }

    async fn orders_page(&self, location_id: &str, query: &OrderQuery) -> Result<OrderPage> {
        let mut state = self.state.lock().unwrap();
        state.order_queries.push((location_id.to_string(), query.clone()));
        if state.failing.contains(location_id) {
            return Err(Self::unavailable("/v1/orders"));
        }
        let mut matching: Vec<UpstreamOrder> = state
            .orders
            .get(location_id)
            .map(|orders| {
                orders
                    .iter()
                    .filter(|o| {
                        o.created_at.as_str() > query.created_after.as_str()
                            && o.created_at.as_str() < query.created_before.as_str()
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(OrderPage {
            total: (!state.omit_order_total).then_some(matching.len() as u64),
            orders: page_of(&matching, query.page, query.page_size),
        })
    }
}

pub fn stock_item(location_id: &str, variant: &str, quantity: f64, unit_cost: f64, unit_price: f64) -> UpstreamInventoryItem {
    UpstreamInventoryItem {
        location_id: location_id.to_string(),
        variant_id: variant.to_string(),
        product_name: format!("Product {}", variant),
        category: "Flower".to_string(),
        item_type: "Flower".to_string(),
        brand: "Acme".to_string(),
        supplier_name: "Acme Supply".to_string(),
        quantity,
        unit_cost,
        unit_price,
    }
}

pub fn order(id: &str, created_at: &str, variant: &str, quantity: f64, total_price: f64) -> UpstreamOrder {
    UpstreamOrder {
        order_id: id.to_string(),
        created_at: created_at.to_string(),
        status: "sold".to_string(),
        voided: false,
        items: vec![UpstreamOrderItem {
            variant_id: variant.to_string(),
            quantity,
            total_price,
            total_discounts: 0.0,
            total_cost: total_price * 0.5,
        }],
    }
}
