//! Shared pipeline plumbing: progress reporting, per-entity metric collection
//! and the endpoint probe run.

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use overview_graph::{GraphClient, Scope};
use overview_probe::{EndpointProber, ProbeProgress, ProbeSummary};
use overview_shared::{EndpointRecord, Metric, MetricSet, ProbeResult, Result};
use overview_storage::Storage;

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Task-level progress within the current phase.
    fn task_progress(&self, current: usize, total: usize, detail: &str);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn task_progress(&self, _current: usize, _total: usize, _detail: &str) {}
}

/// Forwards per-endpoint probe completions to a [`ProgressReporter`].
struct ProbeReporter<'a>(&'a dyn ProgressReporter);

impl ProbeProgress for ProbeReporter<'_> {
    fn probed(&self, result: &ProbeResult, current: usize, total: usize) {
        self.0.task_progress(
            current,
            total,
            &format!("{} ({})", result.entity_id, result.status.as_str()),
        );
    }
}

// ---------------------------------------------------------------------------
// Metric collection
// ---------------------------------------------------------------------------

/// Fetch `metrics` for one entity, one count call per metric.
///
/// Fails on the first call that fails; a count the API does not report stays
/// unknown.
pub async fn collect_metrics(
    client: &GraphClient,
    scope: Scope,
    id: &str,
    metrics: &[Metric],
) -> Result<MetricSet> {
    let mut set = MetricSet::unknown();
    for metric in metrics {
        let (path, filters) = scope.request_for(*metric, id);
        set.set(*metric, client.fetch_count(path, &filters).await?);
    }
    Ok(set)
}

// ---------------------------------------------------------------------------
// Probe run
// ---------------------------------------------------------------------------

/// Outcome of one probing run over the datasources table.
#[derive(Debug)]
pub struct ProbeRun {
    pub run_id: Uuid,
    pub results: Vec<ProbeResult>,
    pub summary: ProbeSummary,
    /// The run was interrupted; the capability flags table was left as it was.
    pub cancelled: bool,
}

/// Probe every datasource endpoint and replace the capability flags table.
///
/// A cancelled run returns its partial results but does not overwrite the
/// previous run's flags.
#[instrument(skip_all)]
pub async fn run_probe(
    prober: &EndpointProber,
    storage: &Storage,
    progress: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> Result<ProbeRun> {
    progress.phase("Loading datasources");
    let datasources = storage.load_datasources().await?;
    let records: Vec<EndpointRecord> = datasources.iter().map(EndpointRecord::from).collect();

    let run_id = Uuid::now_v7();
    progress.phase("Probing endpoints");
    let results = prober
        .probe_all(records, run_id, &ProbeReporter(progress), cancel)
        .await;
    let summary = ProbeSummary::from_results(&results, &datasources);

    let cancelled = cancel.is_cancelled();
    if cancelled {
        warn!(%run_id, probed = results.len(), "probe run cancelled, keeping previous capability flags");
    } else {
        progress.phase("Saving capability flags");
        storage.replace_capability_flags(&results).await?;
        info!(%run_id, passed = summary.passed, failed = summary.failed, missing = summary.missing, "probe run stored");
    }

    Ok(ProbeRun {
        run_id,
        results,
        summary,
        cancelled,
    })
}
