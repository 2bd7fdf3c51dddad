//! Enrichment orchestrator.
//!
//! Maps every reference entity to an identifier-resolution plus
//! metric-collection task, runs the tasks over a bounded pool and merges each
//! finished row into a table keyed by [`Entity::row_key`]. The whole table is
//! checkpointed to storage every `checkpoint_every` completions and once more
//! at the end, so an interrupted run loses at most `checkpoint_every - 1`
//! results. Rows already `resolved` in storage are never queried again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use overview_graph::{GraphClient, Scope};
use overview_shared::{
    EnrichedEntity, EnrichmentStatus, Entity, Metric, MetricSet, OverviewError, PipelineConfig,
    Result,
};
use overview_storage::Storage;

use crate::pipeline::{ProgressReporter, collect_metrics};

/// Metrics fetched directly for an organisation. The total is derived.
const ORGANIZATION_METRICS: [Metric; 6] = [
    Metric::FundingProjects,
    Metric::DataSources,
    Metric::Publications,
    Metric::ResearchData,
    Metric::ResearchSoftware,
    Metric::OtherResearchProducts,
];

/// Counts for one enrichment pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentReport {
    /// Entities in the input list.
    pub total: usize,
    /// Already resolved in storage and left untouched.
    pub skipped: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub failed: usize,
    /// Input entities with no usable key, or repeating an earlier key.
    pub rejected: usize,
    /// Identifiers obtained through registry lookup during this pass.
    pub identifiers_added: usize,
    /// The pass stopped early; unstarted entities were left for the next run.
    pub cancelled: bool,
}

/// Bounded-concurrency scheduler for entity enrichment.
pub struct EnrichmentOrchestrator {
    client: Arc<GraphClient>,
    config: PipelineConfig,
}

impl EnrichmentOrchestrator {
    pub fn new(client: Arc<GraphClient>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { client, config })
    }

    /// Enrich `entities` on top of the table already in `storage`.
    ///
    /// Per-entity failures are recorded in the entity's row. Only fatal errors
    /// (credentials, configuration) end the run: no further entity is
    /// started, in-flight tasks are drained, the table is checkpointed and
    /// the error returned. `cancel` stops the run the same way without an
    /// error.
    #[instrument(skip_all, fields(entities = entities.len(), workers = self.config.workers))]
    pub async fn run(
        &self,
        entities: Vec<Entity>,
        storage: &Storage,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<EnrichmentReport> {
        let mut report = EnrichmentReport {
            total: entities.len(),
            ..Default::default()
        };

        // --- Base table ---
        progress.phase("Loading previous results");
        let mut table: HashMap<String, EnrichedEntity> = storage
            .load_entities()
            .await?
            .into_iter()
            .map(|row| (row.row_key.clone(), row))
            .collect();
        info!(existing = table.len(), "loaded base table");

        // --- Plan ---
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for (position, entity) in entities.into_iter().enumerate() {
            let Some(key) = entity.row_key() else {
                warn!(position, "entity has no id, registry id or name, skipping");
                report.rejected += 1;
                continue;
            };
            if !seen.insert(key.clone()) {
                warn!(entity = %key, position, "duplicate entity in input, keeping first");
                report.rejected += 1;
                continue;
            }
            match table.get_mut(&key) {
                Some(existing) if existing.status == EnrichmentStatus::Resolved => {
                    existing.position = position;
                    report.skipped += 1;
                }
                _ => pending.push((position, key, entity)),
            }
        }

        let work = pending.len();
        info!(work, skipped = report.skipped, "planned enrichment");

        // --- Fan out ---
        progress.phase("Enriching entities");
        let stop = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut set = JoinSet::new();

        for (position, key, entity) in pending {
            let client = self.client.clone();
            let sem = semaphore.clone();
            let stop = stop.clone();
            set.spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return None;
                };
                if stop.is_cancelled() {
                    return None;
                }
                Some(enrich_entity(&client, position, key, entity).await)
            });
        }

        // --- Merge and checkpoint ---
        let mut completed = 0;
        let mut fatal: Option<OverviewError> = None;
        while let Some(joined) = set.join_next().await {
            let row = match joined {
                Ok(Some(Ok(row))) => row,
                Ok(Some(Err(e))) => {
                    if fatal.is_none() {
                        error!(error = %e, "fatal error, stopping enrichment");
                        stop.cancel();
                        fatal = Some(e);
                    }
                    continue;
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "enrichment task failed");
                    continue;
                }
            };

            match row.status {
                EnrichmentStatus::Resolved => report.resolved += 1,
                EnrichmentStatus::Unresolved => report.unresolved += 1,
                EnrichmentStatus::Failed => report.failed += 1,
            }
            if row.added_identifier {
                report.identifiers_added += 1;
            }

            completed += 1;
            progress.task_progress(completed, work, &row.entity.name);
            let stored = table.get(&row.row_key);
            let row = keep_unchanged_timestamp(row, stored);
            table.insert(row.row_key.clone(), row);

            if completed % self.config.checkpoint_every == 0 {
                checkpoint(storage, &table).await?;
            }
        }

        checkpoint(storage, &table).await?;

        if let Some(e) = fatal {
            return Err(e);
        }

        report.cancelled = cancel.is_cancelled();
        if report.cancelled {
            warn!(completed, work, "enrichment cancelled");
        } else {
            info!(
                resolved = report.resolved,
                unresolved = report.unresolved,
                failed = report.failed,
                "enrichment complete"
            );
        }
        Ok(report)
    }
}

/// Persist the whole table in input order.
async fn checkpoint(storage: &Storage, table: &HashMap<String, EnrichedEntity>) -> Result<()> {
    let mut rows: Vec<EnrichedEntity> = table.values().cloned().collect();
    rows.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.row_key.cmp(&b.row_key)));
    storage.replace_entities(&rows).await?;
    debug!(rows = rows.len(), "checkpoint written");
    Ok(())
}

/// Carry the stored `enriched_at` over when a recomputed row is otherwise
/// identical to the stored one, so re-running on unchanged input leaves the
/// table as it was.
fn keep_unchanged_timestamp(mut row: EnrichedEntity, stored: Option<&EnrichedEntity>) -> EnrichedEntity {
    if let Some(stored) = stored {
        let fresh = std::mem::replace(&mut row.enriched_at, stored.enriched_at);
        if row != *stored {
            row.enriched_at = fresh;
        }
    }
    row
}

/// Resolve and fetch one entity.
///
/// Returns `Err` only for fatal errors; everything else is captured in the row.
async fn enrich_entity(
    client: &GraphClient,
    position: usize,
    row_key: String,
    mut entity: Entity,
) -> Result<EnrichedEntity> {
    let mut row = EnrichedEntity {
        row_key,
        position,
        entity: entity.clone(),
        added_identifier: false,
        metrics: None,
        status: EnrichmentStatus::Unresolved,
        error: None,
        enriched_at: Utc::now(),
    };

    if entity.identifier().is_none() {
        if let Some(ror) = entity.registry_id.clone() {
            match client.resolve_identifier(&ror).await {
                Ok(Some(id)) => {
                    debug!(entity = %row.row_key, %id, "resolved identifier");
                    entity.id = Some(id);
                    row.added_identifier = true;
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(entity = %row.row_key, error = %e, "identifier lookup failed");
                    row.entity = entity;
                    row.metrics = Some(MetricSet::unknown());
                    row.status = EnrichmentStatus::Failed;
                    row.error = Some(e.to_string());
                    return Ok(row);
                }
            }
        }
    }

    let Some(id) = entity.identifier().map(str::to_string) else {
        debug!(entity = %row.row_key, "no identifier, metrics left absent");
        row.entity = entity;
        return Ok(row);
    };

    match collect_metrics(client, Scope::Organization, &id, &ORGANIZATION_METRICS).await {
        Ok(metrics) => {
            row.metrics = Some(metrics.with_derived_total());
            row.status = EnrichmentStatus::Resolved;
        }
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            warn!(entity = %row.row_key, %id, error = %e, "metric fetch failed");
            row.metrics = Some(MetricSet::unknown());
            row.status = EnrichmentStatus::Failed;
            row.error = Some(e.to_string());
        }
    }
    row.entity = entity;
    row.enriched_at = Utc::now();
    Ok(row)
}
