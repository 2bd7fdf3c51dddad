//! Core domain types shared by the graph client, prober, storage and pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Metric
// ---------------------------------------------------------------------------

/// One named count in the canonical metric list.
///
/// Declaration order is the canonical column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    FundingProjects,
    DataSources,
    TotalResearchProducts,
    Publications,
    ResearchData,
    ResearchSoftware,
    OtherResearchProducts,
}

impl Metric {
    /// Number of canonical metrics.
    pub const COUNT: usize = 7;

    /// All metrics in canonical order.
    pub const ALL: [Metric; Self::COUNT] = [
        Self::FundingProjects,
        Self::DataSources,
        Self::TotalResearchProducts,
        Self::Publications,
        Self::ResearchData,
        Self::ResearchSoftware,
        Self::OtherResearchProducts,
    ];

    /// The product-type metrics summed into [`Metric::TotalResearchProducts`].
    pub const PRODUCT_TYPES: [Metric; 4] = [
        Self::Publications,
        Self::ResearchData,
        Self::ResearchSoftware,
        Self::OtherResearchProducts,
    ];

    /// Human-readable label used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::FundingProjects => "Funding / Projects",
            Self::DataSources => "Data sources",
            Self::TotalResearchProducts => "Total Research Products",
            Self::Publications => "Publications",
            Self::ResearchData => "Research data",
            Self::ResearchSoftware => "Research software",
            Self::OtherResearchProducts => "Other research products",
        }
    }

    /// Stable storage column name.
    pub fn column(&self) -> &'static str {
        match self {
            Self::FundingProjects => "funding_projects",
            Self::DataSources => "data_sources",
            Self::TotalResearchProducts => "total_research_products",
            Self::Publications => "publications",
            Self::ResearchData => "research_data",
            Self::ResearchSoftware => "research_software",
            Self::OtherResearchProducts => "other_research_products",
        }
    }

    /// Graph API `type` filter value for product-type metrics.
    pub fn product_type(&self) -> Option<&'static str> {
        match self {
            Self::Publications => Some("publication"),
            Self::ResearchData => Some("dataset"),
            Self::ResearchSoftware => Some("software"),
            Self::OtherResearchProducts => Some("other"),
            _ => None,
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Metrics persisted per entity in the enriched table.
pub const ENTITY_METRICS: &[Metric] = &Metric::ALL;

/// Metrics persisted per dated row in the snapshot history.
pub const SNAPSHOT_METRICS: &[Metric] = &[
    Metric::TotalResearchProducts,
    Metric::Publications,
    Metric::ResearchData,
    Metric::ResearchSoftware,
    Metric::OtherResearchProducts,
];

// ---------------------------------------------------------------------------
// MetricSet
// ---------------------------------------------------------------------------

/// Counts for every canonical metric. `None` means unknown, never zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSet {
    counts: [Option<u64>; Metric::COUNT],
}

impl MetricSet {
    /// A set where every metric is unknown.
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn get(&self, metric: Metric) -> Option<u64> {
        self.counts[metric.index()]
    }

    pub fn set(&mut self, metric: Metric, value: Option<u64>) {
        self.counts[metric.index()] = value;
    }

    /// Builder-style [`MetricSet::set`].
    pub fn with(mut self, metric: Metric, value: Option<u64>) -> Self {
        self.set(metric, value);
        self
    }

    /// Sum of the product-type counts, or `None` if any of them is unknown.
    pub fn product_total(&self) -> Option<u64> {
        Metric::PRODUCT_TYPES
            .iter()
            .map(|m| self.get(*m))
            .sum::<Option<u64>>()
    }

    /// Fill [`Metric::TotalResearchProducts`] from the product-type counts.
    pub fn with_derived_total(mut self) -> Self {
        let total = self.product_total();
        self.set(Metric::TotalResearchProducts, total);
        self
    }

    /// `(metric, count)` pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (Metric, Option<u64>)> + '_ {
        Metric::ALL.iter().map(|m| (*m, self.get(*m)))
    }

    /// Whether every metric is unknown.
    pub fn is_all_unknown(&self) -> bool {
        self.counts.iter().all(Option::is_none)
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// An organisation or datasource from the reference list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Graph identifier; absent until resolved.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Free-text classification tag.
    #[serde(default)]
    pub kind: Option<String>,
    /// Persistent registry identifier (ROR) used to resolve a missing `id`.
    #[serde(default, rename = "ror", alias = "ROR")]
    pub registry_id: Option<String>,
    /// Identifiers of parent entities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_ids: Vec<String>,
}

impl Entity {
    /// Stable key for the entity's row in the enriched table.
    ///
    /// Derived from input fields only, so it survives identifier resolution:
    /// the registry id when present, then the graph id, then the name.
    /// Returns `None` when the entity carries no usable key at all.
    pub fn row_key(&self) -> Option<String> {
        [
            self.registry_id.as_deref(),
            self.id.as_deref(),
            Some(self.name.as_str()),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
    }

    /// The graph identifier, if present and non-blank.
    pub fn identifier(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }
}

/// Outcome of enriching one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    /// Identifier known and metrics fetched.
    Resolved,
    /// No identifier could be obtained; metrics absent.
    Unresolved,
    /// A lookup or fetch failed; metrics unknown.
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Unresolved => "unresolved",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for EnrichmentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "resolved" => Ok(Self::Resolved),
            "unresolved" => Ok(Self::Unresolved),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown enrichment status '{other}'")),
        }
    }
}

/// One row of the enriched-entities table.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedEntity {
    /// See [`Entity::row_key`].
    pub row_key: String,
    /// Position in the reference list, used for stable ordering.
    pub position: usize,
    /// The entity with its identifier filled in when resolution succeeded.
    pub entity: Entity,
    /// Whether the identifier was obtained during enrichment.
    pub added_identifier: bool,
    /// Absent when the entity has no identifier.
    pub metrics: Option<MetricSet>,
    pub status: EnrichmentStatus,
    pub error: Option<String>,
    pub enriched_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Datasource
// ---------------------------------------------------------------------------

/// A datasource registered under an organisation, with its harvesting endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datasource {
    pub id: String,
    pub organization_id: Option<String>,
    pub name: Option<String>,
    pub kind: Option<String>,
    pub website_url: Option<String>,
    /// Raw endpoint value; may be blank, scheme-less or list-encoded.
    pub oai_endpoint: Option<String>,
    pub compatibility: Option<String>,
    pub last_indexed: Option<String>,
    pub validated_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Endpoints and probing
// ---------------------------------------------------------------------------

/// Input to the prober: an entity and its raw endpoint strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRecord {
    pub entity_id: String,
    pub raw_endpoints: Vec<String>,
}

impl From<&Datasource> for EndpointRecord {
    fn from(ds: &Datasource) -> Self {
        Self {
            entity_id: ds.id.clone(),
            raw_endpoints: ds.oai_endpoint.iter().cloned().collect(),
        }
    }
}

/// A metadata-format group an endpoint can support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityFlag {
    NlDidl,
    OaiDc,
    OaiOpenaire,
    Rioxx,
    OaiCerifOpenaire,
    OpenaireData,
}

impl CapabilityFlag {
    pub const COUNT: usize = 6;

    pub const ALL: [CapabilityFlag; Self::COUNT] = [
        Self::NlDidl,
        Self::OaiDc,
        Self::OaiOpenaire,
        Self::Rioxx,
        Self::OaiCerifOpenaire,
        Self::OpenaireData,
    ];

    /// Stable storage column name.
    pub fn column(&self) -> &'static str {
        match self {
            Self::NlDidl => "supports_nl_didl",
            Self::OaiDc => "supports_oai_dc",
            Self::OaiOpenaire => "supports_oai_openaire",
            Self::Rioxx => "supports_rioxx",
            Self::OaiCerifOpenaire => "supports_oai_cerif_openaire",
            Self::OpenaireData => "supports_openaire_data",
        }
    }

    /// Lower-cased metadata prefixes that satisfy this group.
    pub fn tokens(&self) -> &'static [&'static str] {
        match self {
            Self::NlDidl => &["nl_didl"],
            Self::OaiDc => &["oai_dc"],
            Self::OaiOpenaire => &["oai_openaire"],
            Self::Rioxx => &["rioxx", "rioxxv2"],
            Self::OaiCerifOpenaire => &["cerif_openaire", "oai_cerif_openaire"],
            Self::OpenaireData => &[
                "oai_datacite",
                "datacite",
                "oai_openaire_data",
                "openaire_data",
            ],
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// One boolean per [`CapabilityFlag`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFlags([bool; CapabilityFlag::COUNT]);

impl CapabilityFlags {
    /// All flags false.
    pub fn none() -> Self {
        Self::default()
    }

    /// Test every flag independently against the detected format tokens.
    pub fn from_formats<S: AsRef<str>>(formats: &[S]) -> Self {
        let mut flags = Self::none();
        for flag in CapabilityFlag::ALL {
            let supported = formats
                .iter()
                .any(|f| flag.tokens().contains(&f.as_ref()));
            flags.set(flag, supported);
        }
        flags
    }

    pub fn get(&self, flag: CapabilityFlag) -> bool {
        self.0[flag.index()]
    }

    pub fn set(&mut self, flag: CapabilityFlag, value: bool) {
        self.0[flag.index()] = value;
    }

    pub fn any(&self) -> bool {
        self.0.iter().any(|v| *v)
    }
}

/// Terminal state of probing one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Ok,
    Error,
    MissingEndpoint,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::MissingEndpoint => "missing_endpoint",
        }
    }
}

impl std::str::FromStr for ProbeStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            "missing_endpoint" => Ok(Self::MissingEndpoint),
            other => Err(format!("unknown probe status '{other}'")),
        }
    }
}

/// Result of probing one entity during one run. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub entity_id: String,
    pub run_id: Uuid,
    pub status: ProbeStatus,
    pub error: Option<String>,
    /// Sorted, de-duplicated format tokens joined with `", "`.
    pub formats_detected: Option<String>,
    pub flags: CapabilityFlags,
    pub tested_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// One entity's metrics on one calendar day.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub entity_id: String,
    pub name: Option<String>,
    /// Only [`SNAPSHOT_METRICS`] are persisted.
    pub metrics: MetricSet,
    pub snapshot_date: NaiveDate,
}
