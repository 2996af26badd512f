use anyhow::{Context, Result};
use shared::{CostOverride, CostOverrides};
use std::path::Path;
use std::time::Duration;

pub const LOCATIONS_TTL: Duration = Duration::from_secs(24 * 3600);
pub const SUPPLIERS_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
pub const INVENTORY_TTL: Duration = Duration::from_secs(3600);
pub const SALES_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
pub const CURSOR_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
/// Shorter than the raw-data TTLs so the derived view is recomputed on read
/// between rebuilds.
pub const DASHBOARD_TTL: Duration = Duration::from_secs(10 * 60);
pub const CURSOR_MAX_AGE_DAYS: i64 = 3;

#[derive(Debug, Clone)]
pub struct LocationFilter {
    pub excluded_locations: Vec<String>,
    pub excluded_products: Vec<String>,
    pub strip_prefix: String,
}

impl Default for LocationFilter {
    fn default() -> Self {
        Self {
            excluded_locations: vec![
                "MBNV".to_string(),
                "Smoke & Mirrors".to_string(),
                "Cultivation".to_string(),
            ],
            excluded_products: vec!["EXIT BAG".to_string()],
            strip_prefix: "Thrive ".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub window_days: u32,
    pub target_weeks_of_supply: f64,
    pub max_workers: usize,
    pub page_size: u32,
    pub page_delay: Duration,
    pub lock_ttl: Duration,
    pub filter: LocationFilter,
    pub overrides: CostOverrides,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_days: shared::analytics::DEFAULT_WINDOW_DAYS,
            target_weeks_of_supply: shared::analytics::DEFAULT_TARGET_WEEKS,
            max_workers: 4,
            page_size: 500,
            page_delay: Duration::from_millis(200),
            lock_ttl: Duration::from_secs(30 * 60),
            filter: LocationFilter::default(),
            overrides: CostOverrides::default(),
        }
    }
}

pub fn load_cost_overrides(path: &Path) -> Result<CostOverrides> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading cost overrides from {}", path.display()))?;
    let rules: Vec<CostOverride> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing cost overrides in {}", path.display()))?;
    Ok(CostOverrides::new(rules))
}
