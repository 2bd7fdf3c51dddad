//! Pipeline orchestration for the graph overview.
//!
//! This crate ties the graph client, the endpoint prober and storage together
//! into the end-to-end workflows the CLI exposes:
//! - [`EnrichmentOrchestrator`]: resolve identifiers and attach metrics to the reference list
//! - [`harvest_datasources`]: page through each organisation's datasources
//! - [`import_curated_endpoints`]: backfill endpoints from a curated list
//! - [`run_probe`]: validate every datasource endpoint
//! - [`collect_snapshot`]: append today's per-datasource counts to the history

mod endpoints;
mod enrichment;
mod harvest;
mod pipeline;
mod snapshot;

pub use endpoints::{EndpointImport, import_curated_endpoints, parse_curated_endpoints};
pub use enrichment::{EnrichmentOrchestrator, EnrichmentReport};
pub use harvest::{HarvestReport, harvest_datasources};
pub use pipeline::{ProbeRun, ProgressReporter, SilentProgress, collect_metrics, run_probe};
pub use snapshot::{SnapshotOutcome, collect_snapshot};

#[cfg(test)]
pub(crate) mod testing;
