//! Rebuild pipeline under the cluster-wide lock.
//!
//! IDLE -> LOCK_ACQUIRING -> (ABORTED) -> INVENTORY -> SALES -> FINALIZING -> COMPLETE | FAILED
//!
//! Only one rebuild body runs across the deployment at a time. A trigger that
//! finds the lock taken is a silent no-op: the running rebuild converges to
//! the same snapshot.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use shared::{
    compute, reduce, AnalyticsParams, InventoryLine, InventoryMeta, LocationTotals,
    RebuildPhase, RebuildProgress, SalesAggregate, SalesMeta,
};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::{keys, Cache, LockToken};
use crate::config::{PipelineConfig, DASHBOARD_TTL, INVENTORY_TTL, SALES_TTL};
use crate::inventory::InventorySnapshotBuilder;
use crate::locations::LocationDirectory;
use crate::sales::{window_end, SalesCursorSync};
use crate::upstream::Upstream;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildSummary {
    pub run_id: Uuid,
    pub locations: usize,
    pub failed_locations: usize,
    pub inventory_lines: usize,
    pub sales_items: usize,
    pub aggregates: usize,
    pub products: usize,
    pub sales_preserved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RebuildOutcome {
    /// Another rebuild holds the lock.
    Skipped,
    Aborted { reason: String },
    Completed(RebuildSummary),
    Failed { error: String },
}

pub struct RebuildCoordinator {
    cache: Cache,
    directory: LocationDirectory,
    inventory: InventorySnapshotBuilder,
    sales: SalesCursorSync,
    config: PipelineConfig,
}

impl RebuildCoordinator {
    pub fn new(upstream: Arc<dyn Upstream>, cache: Cache, config: PipelineConfig) -> Self {
        Self {
            directory: LocationDirectory::new(upstream.clone(), cache.clone(), config.filter.clone()),
            inventory: InventorySnapshotBuilder::new(upstream.clone(), cache.clone(), &config),
            sales: SalesCursorSync::new(upstream, cache.clone(), &config),
            cache,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn default_params(&self, now: DateTime<Utc>) -> AnalyticsParams {
        AnalyticsParams {
            target_weeks_of_supply: self.config.target_weeks_of_supply,
            window_days: self.config.window_days.max(1),
            window_end: window_end(now),
        }
    }

    /// Runs one rebuild if no other is active.
    ///
    /// The rebuild runs on its own task, so dropping the returned future (a
    /// disconnected HTTP client, say) neither cancels it nor skips the lock
    /// release and progress cleanup.
    pub async fn run(self: &Arc<Self>) -> Result<RebuildOutcome> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.run_locked().await })
            .await
            .map_err(|e| anyhow::anyhow!("rebuild task aborted: {}", e))?
    }

    /// Lock release and progress cleanup happen on every path out, including
    /// panics in the body.
    async fn run_locked(&self) -> Result<RebuildOutcome> {
        let run_id = Uuid::new_v4();
        let Some(lock) = self.cache.acquire_lock(keys::REBUILD_LOCK, self.config.lock_ttl).await? else {
            info!("Rebuild already running elsewhere, skipping");
            return Ok(RebuildOutcome::Skipped);
        };
        info!(run_id = %run_id, "Rebuild lock acquired");

        let mut progress = RebuildProgress::new(run_id);
        let body = AssertUnwindSafe(self.execute(&mut progress)).catch_unwind().await;

        let outcome = match body {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(run_id = %run_id, phase = ?progress.phase, "Rebuild failed: {:#}", e);
                progress.advance(RebuildPhase::Failed);
                RebuildOutcome::Failed { error: e.to_string() }
            }
            Err(_) => {
                error!(run_id = %run_id, phase = ?progress.phase, "Rebuild panicked");
                progress.advance(RebuildPhase::Failed);
                RebuildOutcome::Failed {
                    error: "rebuild panicked".to_string(),
                }
            }
        };

        self.finish(lock).await;
        info!(run_id = %run_id, outcome = outcome_label(&outcome), "Rebuild finished");
        Ok(outcome)
    }

    async fn finish(&self, lock: LockToken) {
        if let Err(e) = self.cache.delete(keys::REBUILD_PROGRESS).await {
            warn!("Failed to clear rebuild progress: {}", e);
        }
        if let Err(e) = self.cache.release_lock(lock).await {
            warn!("Failed to release rebuild lock: {}", e);
        }
    }

    async fn mark(&self, progress: &mut RebuildProgress, phase: RebuildPhase) {
        progress.advance(phase);
        info!(run_id = %progress.run_id, phase = ?phase, "Rebuild phase");
        if let Err(e) = self
            .cache
            .set_json(keys::REBUILD_PROGRESS, progress, self.config.lock_ttl)
            .await
        {
            warn!("Failed to record rebuild progress: {}", e);
        }
    }

    async fn execute(&self, progress: &mut RebuildProgress) -> Result<RebuildOutcome> {
        let now = Utc::now();

        self.mark(progress, RebuildPhase::Inventory).await;
        let locations = self.directory.fetch().await;
        if locations.is_empty() {
            return Ok(self.abort(progress, "no locations available"));
        }
        let inventory = self.inventory.build(&locations).await;
        if inventory.is_empty() {
            return Ok(self.abort(progress, "inventory snapshot came back empty"));
        }

        self.mark(progress, RebuildPhase::Sales).await;
        let synced = self.sales.sync(&locations, now).await;
        let failed_locations = synced.iter().filter(|s| s.failed()).count();
        let items: Vec<_> = synced.into_iter().flat_map(|s| s.items).collect();
        let params = self.default_params(now);
        let reduction = reduce(&items, params.window_days, params.window_end);

        let (sales, totals, sales_preserved) = if items.is_empty() {
            match self.cached_sales().await {
                Some((sales, totals)) if !sales.is_empty() => {
                    warn!(cached = sales.len(), "Sales fetch came back empty, keeping cached aggregate");
                    (sales, totals, true)
                }
                _ => (reduction.aggregates, reduction.totals, false),
            }
        } else {
            (reduction.aggregates, reduction.totals, false)
        };

        self.mark(progress, RebuildPhase::Finalizing).await;
        self.persist_inventory(&inventory, now).await?;
        self.persist_sales(&sales, &totals, items.len(), sales_preserved, &params, now)
            .await?;

        let snapshot = compute(&inventory, &sales, &totals, &self.config.overrides, &params);
        self.cache.set_json(keys::DASHBOARD, &snapshot, DASHBOARD_TTL).await?;

        self.mark(progress, RebuildPhase::Complete).await;
        Ok(RebuildOutcome::Completed(RebuildSummary {
            run_id: progress.run_id,
            locations: locations.len(),
            failed_locations,
            inventory_lines: inventory.len(),
            sales_items: items.len(),
            aggregates: sales.len(),
            products: snapshot.products.len(),
            sales_preserved,
        }))
    }

    fn abort(&self, progress: &mut RebuildProgress, reason: &str) -> RebuildOutcome {
        warn!(run_id = %progress.run_id, "Rebuild aborted: {}; cached dashboard left untouched", reason);
        progress.advance(RebuildPhase::Aborted);
        RebuildOutcome::Aborted {
            reason: reason.to_string(),
        }
    }

    async fn cached_sales(&self) -> Option<(Vec<SalesAggregate>, BTreeMap<String, LocationTotals>)> {
        let sales: Vec<SalesAggregate> = self.cache.get_json_or_miss(keys::SALES).await?;
        let totals: BTreeMap<String, LocationTotals> = self
            .cache
            .get_json_or_miss(keys::SALES_TOTALS)
            .await
            .unwrap_or_default();
        Some((sales, totals))
    }

    async fn persist_inventory(&self, inventory: &[InventoryLine], now: DateTime<Utc>) -> Result<()> {
        self.cache.set_json(keys::INVENTORY, inventory, INVENTORY_TTL).await?;
        let meta = InventoryMeta {
            refreshed_at: now,
            lines: inventory.len(),
            units: inventory.iter().map(|l| l.on_hand).sum(),
            cost: inventory.iter().map(|l| l.inventory_cost).sum(),
        };
        self.cache.set_json(keys::INVENTORY_META, &meta, INVENTORY_TTL).await?;
        Ok(())
    }

    async fn persist_sales(
        &self,
        sales: &[SalesAggregate],
        totals: &BTreeMap<String, LocationTotals>,
        raw_items: usize,
        preserved: bool,
        params: &AnalyticsParams,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !preserved {
            self.cache.set_json(keys::SALES, sales, SALES_TTL).await?;
            self.cache.set_json(keys::SALES_TOTALS, totals, SALES_TTL).await?;
        }
        let meta = SalesMeta {
            refreshed_at: now,
            window_end: params.window_end,
            window_days: params.window_days,
            aggregates: sales.len(),
            raw_items,
            preserved,
        };
        self.cache.set_json(keys::SALES_META, &meta, SALES_TTL).await?;
        info!(aggregates = sales.len(), raw_items, preserved, "Sales aggregate persisted");
        Ok(())
    }
}

fn outcome_label(outcome: &RebuildOutcome) -> &'static str {
    match outcome {
        RebuildOutcome::Skipped => "skipped",
        RebuildOutcome::Aborted { .. } => "aborted",
        RebuildOutcome::Completed(_) => "completed",
        RebuildOutcome::Failed { .. } => "failed",
    }
}
