//! Stale-while-revalidate dashboard reads.

use chrono::Utc;
use serde::Serialize;
use shared::{compute, AnalyticsParams, DashboardSnapshot, InventoryLine, LocationTotals, SalesAggregate};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{keys, Cache};
use crate::config::DASHBOARD_TTL;
use crate::coordinator::{RebuildCoordinator, RebuildOutcome};
use crate::error::ReadError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "dashboard", rename_all = "snake_case")]
pub enum DashboardRead {
    /// Served from the derived-snapshot entry.
    Cached(DashboardSnapshot),
    /// Synthesized from the raw aggregates on this request.
    Computed(DashboardSnapshot),
    /// Nothing usable is cached yet; a rebuild was scheduled.
    Warming,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub target_weeks_of_supply: Option<f64>,
    /// Analysis window for velocity back-fill and the reported period.
    pub window_days: Option<u32>,
    /// Run a rebuild inline before reading.
    pub refresh: bool,
}

#[derive(Clone)]
pub struct DashboardReader {
    cache: Cache,
    coordinator: Arc<RebuildCoordinator>,
}

impl DashboardReader {
    pub fn new(cache: Cache, coordinator: Arc<RebuildCoordinator>) -> Self {
        Self { cache, coordinator }
    }

    pub async fn read(&self, options: ReadOptions) -> Result<DashboardRead, ReadError> {
        if options.refresh {
            match self.coordinator.run().await {
                Ok(outcome) => debug!(outcome = ?outcome, "Inline rebuild finished"),
                Err(e) => warn!("Inline rebuild could not start: {:#}", e),
            }
        }

        let defaults = self.coordinator.default_params(Utc::now());
        let params = AnalyticsParams {
            target_weeks_of_supply: options
                .target_weeks_of_supply
                .unwrap_or(defaults.target_weeks_of_supply),
            window_days: options.window_days.unwrap_or(defaults.window_days).max(1),
            ..defaults
        };
        let custom = params != defaults;

        if !custom {
            if let Some(snapshot) = self.cache.get_json_or_miss::<DashboardSnapshot>(keys::DASHBOARD).await {
                return Ok(DashboardRead::Cached(snapshot));
            }
        }

        if let Some(snapshot) = self.from_raw(&params).await {
            if !custom {
                if let Err(e) = self.cache.set_json(keys::DASHBOARD, &snapshot, DASHBOARD_TTL).await {
                    warn!("Failed to cache recomputed dashboard: {}", e);
                }
            }
            return Ok(DashboardRead::Computed(snapshot));
        }

        if options.refresh {
            return Err(ReadError::Unavailable(
                "no cached data and the rebuild produced none".to_string(),
            ));
        }

        self.schedule_rebuild();
        Ok(DashboardRead::Warming)
    }

    /// Kicks off a background rebuild; the lock coalesces concurrent triggers.
    pub fn schedule_rebuild(&self) {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            match coordinator.run().await {
                Ok(RebuildOutcome::Skipped) => debug!("Background rebuild coalesced into a running one"),
                Ok(outcome) => info!(outcome = ?outcome, "Background rebuild finished"),
                Err(e) => warn!("Background rebuild could not start: {:#}", e),
            }
        });
    }

    async fn from_raw(&self, params: &AnalyticsParams) -> Option<DashboardSnapshot> {
        let inventory: Vec<InventoryLine> = self.cache.get_json_or_miss(keys::INVENTORY).await?;
        let sales: Vec<SalesAggregate> = self.cache.get_json_or_miss(keys::SALES).await?;
        let totals: BTreeMap<String, LocationTotals> = self
            .cache
            .get_json_or_miss(keys::SALES_TOTALS)
            .await
            .unwrap_or_default();
        Some(compute(
            &inventory,
            &sales,
            &totals,
            &self.coordinator.config().overrides,
            params,
        ))
    }
}
