//! Maps the upstream's loosely-shaped JSON onto strict records.
//!
//! The API is inconsistent about field names across endpoints and versions,
//! and about wrapping lists in an envelope. Every fallback is listed here and
//! nowhere else.

use serde_json::Value;

use crate::upstream::{OrderPage, UpstreamInventoryItem, UpstreamLocation, UpstreamOrder, UpstreamOrderItem};

/// First non-empty string among `fields`. Numbers are stringified.
fn text(value: &Value, fields: &[&str]) -> String {
    fields
        .iter()
        .filter_map(|field| match value.get(field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .next()
        .unwrap_or_default()
}

/// First numeric field among `fields`; null or missing counts as absent.
fn number(value: &Value, fields: &[&str]) -> Option<f64> {
    fields.iter().find_map(|field| match value.get(field) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

fn flag(value: &Value, field: &str) -> bool {
    value.get(field).and_then(Value::as_bool).unwrap_or(false)
}

/// Either a bare array or an object holding the array under one of `fields`.
fn list<'a>(payload: &'a Value, fields: &[&str]) -> &'a [Value] {
    if let Some(items) = payload.as_array() {
        return items;
    }
    fields
        .iter()
        .find_map(|field| payload.get(field).and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn minor_units(value: &Value, fields: &[&str]) -> f64 {
    number(value, fields).unwrap_or(0.0) / 100.0
}

fn money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn locations(payload: &Value) -> Vec<UpstreamLocation> {
    list(payload, &["data", "locations"])
        .iter()
        .map(|loc| UpstreamLocation {
            location_id: text(loc, &["locationId", "id", "importId"]),
            import_id: text(loc, &["importId"]),
            name: text(loc, &["locationName", "name"]),
        })
        .collect()
}

pub fn inventory_items(payload: &Value) -> Vec<UpstreamInventoryItem> {
    list(payload, &["data", "inventory"])
        .iter()
        .map(|item| UpstreamInventoryItem {
            location_id: text(item, &["locationId", "importId"]),
            variant_id: text(item, &["variantId", "productId", "id"]),
            product_name: text(item, &["productName", "parentProductName", "name"]),
            category: text(item, &["category", "customCategoryName"]),
            item_type: text(item, &["type", "productType"]),
            brand: text(item, &["brand", "brandName"]),
            supplier_name: text(item, &["supplierName", "vendorName"]),
            quantity: number(item, &["quantity", "quantityOnHand"]).unwrap_or(0.0),
            unit_cost: money(minor_units(item, &["costInMinorUnits", "costInPennies"])),
            unit_price: money(minor_units(item, &["priceInMinorUnits", "preTaxPriceInPennies"])),
        })
        .collect()
}

pub fn order_page(payload: &Value) -> OrderPage {
    let orders: Vec<UpstreamOrder> = list(payload, &["orders", "data"])
        .iter()
        .map(|order| UpstreamOrder {
            order_id: text(order, &["_id", "id", "orderId"]),
            created_at: text(order, &["createdAt", "created_at", "completedOn"]),
            status: text(order, &["orderStatus", "status"]),
            voided: flag(order, "voided"),
            items: list(order, &["itemsInCart", "items"])
                .iter()
                .map(|line| UpstreamOrderItem {
                    variant_id: text(line, &["variantId", "productId"]),
                    quantity: number(line, &["quantity"]).unwrap_or(0.0),
                    total_price: money(number(line, &["totalPrice"]).unwrap_or(0.0)),
                    total_discounts: money(number(line, &["totalDiscounts"]).unwrap_or(0.0)),
                    total_cost: money(number(line, &["totalCost"]).unwrap_or(0.0)),
                })
                .collect(),
        })
        .collect();

    let total = payload.get("total").and_then(Value::as_u64);
    OrderPage { total, orders }
}
