//! Shared types, error model, and configuration for the overview pipeline.
//!
//! This crate is the foundation depended on by all other overview crates.
//! It provides:
//! - [`OverviewError`], the unified error type
//! - Domain types ([`Entity`], [`MetricSet`], [`Datasource`], [`ProbeResult`], [`SnapshotRow`])
//! - Configuration ([`AppConfig`], runtime configs, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    ApiConfig, AppConfig, Credentials, GraphConfig, PipelineConfig, PipelineSection, ProbeConfig,
    ProbeSection, config_dir, config_file_path, init_config, load_config, load_config_from,
    load_credentials,
};
pub use error::{OverviewError, Result};
pub use types::{
    CapabilityFlag, CapabilityFlags, Datasource, ENTITY_METRICS, EndpointRecord, EnrichedEntity,
    EnrichmentStatus, Entity, Metric, MetricSet, ProbeResult, ProbeStatus, SNAPSHOT_METRICS,
    SnapshotRow,
};
