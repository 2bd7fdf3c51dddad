//! Curated endpoint import.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, instrument, warn};

use overview_probe::clean_endpoint;
use overview_shared::{OverviewError, Result};
use overview_storage::Storage;

#[derive(Debug, Deserialize)]
struct CuratedEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
}

/// Outcome of [`import_curated_endpoints`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointImport {
    /// Usable `(id, endpoint)` pairs in the file.
    pub entries: usize,
    /// Datasources whose endpoint was set.
    pub updated: usize,
}

/// Parse a curated list (`[{ "id": .., "endpoint": .. }]`) into a map from
/// datasource id to cleaned endpoint.
///
/// Blank ids and blank endpoints are dropped; the first entry per id wins.
pub fn parse_curated_endpoints(json: &str) -> Result<HashMap<String, String>> {
    let entries: Vec<CuratedEntry> = serde_json::from_str(json)
        .map_err(|e| OverviewError::parse(format!("invalid curated endpoint list: {e}")))?;

    let mut endpoints = HashMap::new();
    for entry in entries {
        let Some(id) = entry.id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()) else {
            continue;
        };
        let Some(endpoint) = entry.endpoint.as_deref().and_then(clean_endpoint) else {
            continue;
        };
        if endpoints.contains_key(&id) {
            warn!(datasource = %id, "repeated curated endpoint, keeping first");
            continue;
        }
        endpoints.insert(id, endpoint);
    }
    Ok(endpoints)
}

/// Backfill datasource endpoints from the curated list at `path`.
#[instrument(skip(storage), fields(path = %path.display()))]
pub async fn import_curated_endpoints(storage: &Storage, path: &Path) -> Result<EndpointImport> {
    let json = std::fs::read_to_string(path).map_err(|e| OverviewError::io(path, e))?;
    let endpoints = parse_curated_endpoints(&json)?;
    let updated = storage.set_endpoints(&endpoints).await?;

    info!(entries = endpoints.len(), updated, "curated endpoints imported");
    Ok(EndpointImport {
        entries: endpoints.len(),
        updated,
    })
}
