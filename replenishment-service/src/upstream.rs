//! Upstream retail-operations API.
//!
//! Business logic only sees the strict records below; field-name fallbacks
//! and unit conversion live in [`crate::normalize`].

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::UpstreamError;
use crate::normalize;

pub type Result<T> = std::result::Result<T, UpstreamError>;

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamLocation {
    pub location_id: String,
    pub import_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamInventoryItem {
    pub location_id: String,
    pub variant_id: String,
    pub product_name: String,
    pub category: String,
    pub item_type: String,
    pub brand: String,
    pub supplier_name: String,
    pub quantity: f64,
    pub unit_cost: f64,
    pub unit_price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamOrder {
    pub order_id: String,
    pub created_at: String,
    pub status: String,
    pub voided: bool,
    pub items: Vec<UpstreamOrderItem>,
}

impl UpstreamOrder {
    pub fn is_cancelled(&self) -> bool {
        self.voided || matches!(self.status.to_lowercase().as_str(), "cancelled" | "voided")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamOrderItem {
    pub variant_id: String,
    pub quantity: f64,
    pub total_price: f64,
    pub total_discounts: f64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderPage {
    /// Matching orders across all pages, when the payload reports it.
    pub total: Option<u64>,
    pub orders: Vec<UpstreamOrder>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderQuery {
    /// Exclusive lower bound: a cursor timestamp or a `YYYY-MM-DD` date.
    pub created_after: String,
    pub created_before: String,
    pub page: u32,
    pub page_size: u32,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn locations(&self) -> Result<Vec<UpstreamLocation>>;

    async fn inventory_page(
        &self,
        location_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<UpstreamInventoryItem>>;

    /// Orders in ascending creation order.
    async fn orders_page(&self, location_id: &str, query: &OrderQuery) -> Result<OrderPage>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

pub struct FlowhubClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl FlowhubClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    pub fn has_credentials(&self) -> bool {
        self.config.credentials.is_some()
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.config.backoff_base * 2u32.saturating_pow(attempt);
        let jitter = rand::thread_rng().gen_range(0..=exp.as_millis().min(1_000) as u64 / 4);
        exp + Duration::from_millis(jitter)
    }

    /// GET with bounded retry on rate limiting, server errors and transport failures.
    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let credentials = self
            .config
            .credentials
            .as_ref()
            .ok_or(UpstreamError::MissingCredentials)?;
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let attempts = self.config.max_attempts.max(1);

        for attempt in 0..attempts {
            let sent = self
                .http
                .get(&url)
                .header("clientId", &credentials.client_id)
                .header("key", &credentials.api_key)
                .query(query)
                .send()
                .await;

            let retryable = match sent {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<Value>()
                        .await
                        .map_err(|e| UpstreamError::Decode(e.to_string()));
                }
                Ok(response) => {
                    let status = response.status();
                    warn!(path = %path, status = status.as_u16(), attempt = attempt + 1, "Upstream returned error status");
                    if status != StatusCode::TOO_MANY_REQUESTS && !status.is_server_error() {
                        return Err(UpstreamError::Status {
                            path: path.to_string(),
                            status: status.as_u16(),
                        });
                    }
                    true
                }
                Err(e) => {
                    warn!(path = %path, attempt = attempt + 1, "Upstream request failed: {}", e);
                    e.is_timeout() || e.is_connect() || e.is_request()
                }
            };

            if !retryable {
                break;
            }
            if attempt + 1 < attempts {
                let delay = self.backoff(attempt);
                debug!(path = %path, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                tokio::time::sleep(delay).await;
            }
        }

        Err(UpstreamError::Unavailable {
            path: path.to_string(),
            attempts,
        })
    }
}

#[async_trait]
impl Upstream for FlowhubClient {
    async fn locations(&self) -> Result<Vec<UpstreamLocation>> {
        let payload = self.get_json("/v0/clientsLocations", &[]).await?;
        Ok(normalize::locations(&payload))
    }

    async fn inventory_page(
        &self,
        location_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<UpstreamInventoryItem>> {
        let query = [
            ("locationId", location_id.to_string()),
            ("page", page.to_string()),
            ("page_size", page_size.to_string()),
        ];
        let payload = self.get_json("/v0/inventory", &query).await?;
        Ok(normalize::inventory_items(&payload))
    }

    async fn orders_page(&self, location_id: &str, query: &OrderQuery) -> Result<OrderPage> {
        let path = format!("/v1/orders/findByLocationId/{}", location_id);
        let params = [
            ("created_after", query.created_after.clone()),
            ("created_before", query.created_before.clone()),
            ("page_size", query.page_size.to_string()),
            ("page", query.page.to_string()),
            ("order_by", "asc".to_string()),
        ];
        let payload = self.get_json(&path, &params).await?;
        Ok(normalize::order_page(&payload))
    }
}
