//! OAI-PMH endpoint validation.
//!
//! This crate provides:
//! - [`endpoint`]: pure normalisation of raw endpoint strings into candidate URLs
//! - [`oai`]: `ListMetadataFormats` envelope parsing
//! - [`EndpointProber`]: the concurrent per-entity probe state machine
//! - [`ProbeSummary`]: run-level coverage counts

pub mod endpoint;
pub mod oai;
mod prober;
mod summary;

pub use endpoint::{build_probe_url, clean_endpoint, endpoint_candidates, unwrap_endpoint};
pub use oai::{FormatsResponse, OaiError, parse_metadata_formats};
pub use prober::{EndpointProber, ProbeProgress, SilentProbeProgress};
pub use summary::ProbeSummary;
