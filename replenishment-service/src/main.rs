mod api;
mod cache;
mod config;
mod coordinator;
mod error;
mod inventory;
mod locations;
mod normalize;
mod reader;
mod redis_store;
mod sales;
mod scheduler;
mod upstream;

#[cfg(test)]
mod testing;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cache::{keys, Cache};
use crate::config::{LocationFilter, PipelineConfig};
use crate::coordinator::RebuildCoordinator;
use crate::reader::DashboardReader;
use crate::redis_store::RedisStore;
use crate::scheduler::RebuildScheduler;
use crate::upstream::{ClientConfig, Credentials, FlowhubClient};

#[derive(Parser, Debug)]
#[command(name = "replenishment-service")]
struct Args {
    /// Without it the service keeps all state in process memory.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, env = "FLOWHUB_BASE_URL", default_value = "https://api.flowhub.co")]
    flowhub_base_url: String,

    #[arg(long, env = "FLOWHUB_CLIENT_ID")]
    flowhub_client_id: Option<String>,

    #[arg(long, env = "FLOWHUB_API_KEY", hide_env_values = true)]
    flowhub_api_key: Option<String>,

    #[arg(long, env = "PORT", default_value = "8000")]
    port: u16,

    #[arg(long, default_value_t = shared::analytics::DEFAULT_WINDOW_DAYS, value_parser = clap::value_parser!(u32).range(1..))]
    window_days: u32,

    #[arg(long = "target-wos", default_value_t = shared::analytics::DEFAULT_TARGET_WEEKS)]
    target_wos: f64,

    #[arg(long, default_value = "4")]
    max_workers: usize,

    #[arg(long, default_value = "500")]
    page_size: u32,

    #[arg(long, default_value = "200")]
    page_delay_ms: u64,

    #[arg(long, default_value = "120")]
    request_timeout_secs: u64,

    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Must exceed the worst-case rebuild duration.
    #[arg(long, default_value = "1800")]
    lock_ttl_secs: u64,

    /// 0 disables the periodic rebuild.
    #[arg(long, env = "REBUILD_INTERVAL_SECS", default_value = "0")]
    rebuild_interval_secs: u64,

    /// JSON file of `[{"brand", "category", "unit_cost"}]` rules.
    #[arg(long, env = "COST_OVERRIDES")]
    cost_overrides: Option<PathBuf>,

    #[arg(long = "exclude-location", default_values = ["MBNV", "Smoke & Mirrors", "Cultivation"])]
    excluded_locations: Vec<String>,

    #[arg(long = "exclude-product", default_values = ["EXIT BAG"])]
    excluded_products: Vec<String>,

    #[arg(long, default_value = "Thrive ")]
    strip_location_prefix: String,
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let overrides = match &self.cost_overrides {
            Some(path) => config::load_cost_overrides(path)?,
            None => Default::default(),
        };
        Ok(PipelineConfig {
            window_days: self.window_days,
            target_weeks_of_supply: self.target_wos,
            max_workers: self.max_workers,
            page_size: self.page_size,
            page_delay: Duration::from_millis(self.page_delay_ms),
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            filter: LocationFilter {
                excluded_locations: self.excluded_locations.clone(),
                excluded_products: self.excluded_products.clone(),
                strip_prefix: self.strip_location_prefix.clone(),
            },
            overrides,
        })
    }

    fn client_config(&self) -> ClientConfig {
        let credentials = match (&self.flowhub_client_id, &self.flowhub_api_key) {
            (Some(client_id), Some(api_key)) if !client_id.is_empty() && !api_key.is_empty() => Some(Credentials {
                client_id: client_id.clone(),
                api_key: api_key.clone(),
            }),
            _ => None,
        };
        ClientConfig {
            base_url: self.flowhub_base_url.trim_end_matches('/').to_string(),
            credentials,
            timeout: Duration::from_secs(self.request_timeout_secs),
            max_attempts: self.max_attempts.max(1),
            backoff_base: Duration::from_millis(500),
        }
    }
}

async fn connect_cache(redis_url: Option<&str>) -> Result<Cache> {
    match redis_url {
        Some(url) => Ok(Cache::new(Arc::new(RedisStore::connect(url).await?))),
        None => {
            warn!("REDIS_URL not set, running without persistence");
            Ok(Cache::in_memory())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let config = args.pipeline_config()?;
    info!(
        window_days = config.window_days,
        target_wos = config.target_weeks_of_supply,
        overrides = config.overrides.len(),
        "Pipeline configured"
    );

    let cache = connect_cache(args.redis_url.as_deref()).await?;
    let client = FlowhubClient::new(args.client_config())?;
    let has_credentials = client.has_credentials();
    if !has_credentials {
        warn!("Flowhub credentials missing, upstream calls will fail until configured");
    }

    let coordinator = Arc::new(RebuildCoordinator::new(Arc::new(client), cache.clone(), config));
    let reader = DashboardReader::new(cache.clone(), coordinator.clone());

    if !cache.exists(keys::DASHBOARD).await.unwrap_or(false) {
        info!("No cached dashboard, warming in the background");
        reader.schedule_rebuild();
    }

    if let Some(scheduler) = RebuildScheduler::new(coordinator.clone(), Duration::from_secs(args.rebuild_interval_secs)) {
        tokio::spawn(async move {
            scheduler.run().await;
        });
    }

    let app_state = api::AppState {
        cache,
        coordinator,
        reader,
        has_credentials,
    };

    let app = api::create_router(app_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    info!("Replenishment service started on port {}", args.port);
    info!("Dashboard available at http://0.0.0.0:{}/api/dashboard", args.port);

    axum::serve(listener, app).await?;

    Ok(())
}
