use shared::Location;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{keys, Cache};
use crate::config::{LocationFilter, LOCATIONS_TTL};
use crate::upstream::{Upstream, UpstreamLocation};

pub struct LocationDirectory {
    upstream: Arc<dyn Upstream>,
    cache: Cache,
    filter: LocationFilter,
}

impl LocationDirectory {
    pub fn new(upstream: Arc<dyn Upstream>, cache: Cache, filter: LocationFilter) -> Self {
        Self { upstream, cache, filter }
    }

    /// Filtered retail locations, cached for a day.
    ///
    /// An empty result means the directory could not be resolved, not that no
    /// locations exist.
    pub async fn fetch(&self) -> Vec<Location> {
        if let Some(cached) = self.cache.get_json_or_miss::<Vec<Location>>(keys::LOCATIONS).await {
            if !cached.is_empty() {
                return cached;
            }
        }

        let raw = match self.upstream.locations().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to fetch locations: {}", e);
                return Vec::new();
            }
        };

        let locations: Vec<Location> = raw
            .into_iter()
            .filter_map(|loc| self.resolve(loc))
            .collect();

        if locations.is_empty() {
            warn!("Upstream returned no retail locations");
            return locations;
        }

        if let Err(e) = self.cache.set_json(keys::LOCATIONS, &locations, LOCATIONS_TTL).await {
            warn!("Failed to cache locations: {}", e);
        }
        info!(count = locations.len(), "Loaded locations");
        locations
    }

    fn resolve(&self, loc: UpstreamLocation) -> Option<Location> {
        if self.is_excluded(&loc.name) {
            return None;
        }
        let display_name = clean_name(&loc.name, &self.filter.strip_prefix);
        Some(Location {
            id: loc.location_id,
            import_id: loc.import_id,
            name: loc.name,
            display_name,
        })
    }

    fn is_excluded(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.filter
            .excluded_locations
            .iter()
            .any(|excluded| name.contains(&excluded.to_lowercase()))
    }
}

pub fn clean_name(name: &str, strip_prefix: &str) -> String {
    let stripped = if strip_prefix.is_empty() {
        name.to_string()
    } else {
        name.replace(strip_prefix, "")
    };
    if name.contains(" - RD") {
        stripped.split(" - ").next().unwrap_or_default().to_string()
    } else {
        stripped
    }
}
