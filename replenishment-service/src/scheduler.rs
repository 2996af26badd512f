use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use crate::coordinator::{RebuildCoordinator, RebuildOutcome};

/// Fixed-interval rebuild trigger. Overlapping ticks across replicas are
/// coalesced by the rebuild lock.
pub struct RebuildScheduler {
    coordinator: Arc<RebuildCoordinator>,
    period: Duration,
}

impl RebuildScheduler {
    /// Returns `None` for a zero period, which disables scheduling.
    pub fn new(coordinator: Arc<RebuildCoordinator>, period: Duration) -> Option<Self> {
        if period.is_zero() {
            return None;
        }
        Some(Self { coordinator, period })
    }

    pub async fn run(&self) {
        let mut interval = time::interval_at(time::Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = self.period.as_secs(), "Rebuild scheduler started");

        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    async fn tick(&self) -> Option<RebuildOutcome> {
        match self.coordinator.run().await {
            Ok(outcome) => {
                info!(outcome = ?outcome, "Scheduled rebuild finished");
                Some(outcome)
            }
            Err(e) => {
                error!("Scheduled rebuild could not start: {:#}", e);
                None
            }
        }
    }
}
