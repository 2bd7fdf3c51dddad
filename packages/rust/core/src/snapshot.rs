//! Daily snapshot collection.

use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use overview_graph::{GraphClient, Scope};
use overview_shared::{
    Datasource, MetricSet, OverviewError, PipelineConfig, Result, SNAPSHOT_METRICS, SnapshotRow,
};
use overview_storage::{AppendOutcome, Storage};

use crate::pipeline::{ProgressReporter, collect_metrics};

/// Outcome of [`collect_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Rows were appended for the date.
    Appended(usize),
    /// The history already holds the date; nothing was fetched or written.
    AlreadyPresent,
    /// Collection was interrupted; a partial day is never written.
    Cancelled,
}

/// Collect per-datasource product counts and append them as the snapshot for
/// `date`.
///
/// Skipped without any API call when the history already holds `date`. A
/// datasource whose counts cannot be fetched is recorded with unknown counts.
#[instrument(skip_all, fields(%date, workers = config.workers))]
pub async fn collect_snapshot(
    client: Arc<GraphClient>,
    storage: &Storage,
    config: &PipelineConfig,
    date: NaiveDate,
    progress: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> Result<SnapshotOutcome> {
    config.validate()?;

    if storage.has_snapshot_for(date).await? {
        info!("snapshot for this date already present, skipping collection");
        return Ok(SnapshotOutcome::AlreadyPresent);
    }

    progress.phase("Loading datasources");
    let datasources = storage.load_datasources().await?;
    let total = datasources.len();

    progress.phase("Collecting snapshot counts");
    let stop = cancel.child_token();
    let semaphore = Arc::new(Semaphore::new(config.workers));
    let mut set = JoinSet::new();

    for ds in datasources {
        let client = client.clone();
        let sem = semaphore.clone();
        let stop = stop.clone();
        set.spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else {
                return None;
            };
            if stop.is_cancelled() {
                return None;
            }
            Some(snapshot_row(&client, ds, date).await)
        });
    }

    let mut rows = Vec::with_capacity(total);
    let mut fatal: Option<OverviewError> = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Some(Ok(row))) => {
                progress.task_progress(rows.len() + 1, total, &row.entity_id);
                rows.push(row);
            }
            Ok(Some(Err(e))) => {
                if fatal.is_none() {
                    error!(error = %e, "fatal error, stopping snapshot collection");
                    stop.cancel();
                    fatal = Some(e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "snapshot task failed"),
        }
    }

    if let Some(e) = fatal {
        return Err(e);
    }
    if cancel.is_cancelled() {
        warn!(collected = rows.len(), total, "snapshot collection cancelled, nothing written");
        return Ok(SnapshotOutcome::Cancelled);
    }

    rows.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    progress.phase("Appending snapshot");
    match storage.append_snapshot(&rows, date).await? {
        AppendOutcome::Appended(n) => Ok(SnapshotOutcome::Appended(n)),
        AppendOutcome::DuplicateDate => Ok(SnapshotOutcome::AlreadyPresent),
    }
}

/// One datasource's row. Returns `Err` only for fatal errors.
async fn snapshot_row(client: &GraphClient, ds: Datasource, date: NaiveDate) -> Result<SnapshotRow> {
    let metrics = match collect_metrics(client, Scope::Datasource, &ds.id, SNAPSHOT_METRICS).await {
        Ok(metrics) => metrics,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            warn!(datasource = %ds.id, error = %e, "snapshot counts unavailable");
            MetricSet::unknown()
        }
    };
    Ok(SnapshotRow {
        entity_id: ds.id,
        name: ds.name,
        metrics,
        snapshot_date: date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentProgress;
    use crate::testing::{count_body, graph_client, mount_token, test_storage};
    use overview_shared::Metric;
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            workers: 2,
            checkpoint_every: 5,
        }
    }

    async fn storage_with(ids: &[&str]) -> Storage {
        let storage = test_storage().await;
        let datasources: Vec<Datasource> = ids
            .iter()
            .map(|id| Datasource {
                id: id.to_string(),
                name: Some(format!("Repository {id}")),
                ..Default::default()
            })
            .collect();
        storage.replace_datasources(&datasources).await.unwrap();
        storage
    }

    async fn mount_products(server: &MockServer, id: &str, total: u64, per_type: u64) {
        Mock::given(method("GET"))
            .and(path("/graph/v2/researchProducts"))
            .and(query_param("relCollectedFromDatasourceId", id))
            .and(query_param_is_missing("type"))
            .respond_with(count_body(Some(total)))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/graph/v2/researchProducts"))
            .and(query_param("relCollectedFromDatasourceId", id))
            .and(query_param("type", "publication"))
            .respond_with(count_body(Some(per_type)))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/graph/v2/researchProducts"))
            .and(query_param("relCollectedFromDatasourceId", id))
            .and(query_param("type", "dataset"))
            .respond_with(count_body(None))
            .mount(server)
            .await;
        for kind in ["software", "other"] {
            Mock::given(method("GET"))
                .and(path("/graph/v2/researchProducts"))
                .and(query_param("relCollectedFromDatasourceId", id))
                .and(query_param("type", kind))
                .respond_with(count_body(Some(0)))
                .mount(server)
                .await;
        }
    }

    #[tokio::test]
    async fn appends_once_per_day() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        mount_products(&server, "d1", 12, 10).await;
        mount_products(&server, "d2", 3, 3).await;

        let storage = storage_with(&["d1", "d2"]).await;
        let client = Arc::new(graph_client(&server));
        let cancel = CancellationToken::new();

        let first = collect_snapshot(client.clone(), &storage, &config(), date(), &SilentProgress, &cancel)
            .await
            .unwrap();
        assert_eq!(first, SnapshotOutcome::Appended(2));

        let history = storage.load_history().await.unwrap();
        assert_eq!(history.len(), 2);
        let d1 = &history[0];
        assert_eq!(d1.entity_id, "d1");
        assert_eq!(d1.name.as_deref(), Some("Repository d1"));
        assert_eq!(d1.metrics.get(Metric::TotalResearchProducts), Some(12));
        assert_eq!(d1.metrics.get(Metric::Publications), Some(10));
        assert_eq!(d1.metrics.get(Metric::ResearchData), None);
        assert_eq!(d1.metrics.get(Metric::ResearchSoftware), Some(0));

        // Same day again: no API traffic at all.
        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(count_body(Some(1)))
            .expect(0)
            .mount(&server)
            .await;

        let second = collect_snapshot(client, &storage, &config(), date(), &SilentProgress, &cancel)
            .await
            .unwrap();
        assert_eq!(second, SnapshotOutcome::AlreadyPresent);
        assert_eq!(storage.load_history().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_datasource_gets_unknown_counts() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        mount_products(&server, "d1", 5, 5).await;
        Mock::given(method("GET"))
            .and(query_param("relCollectedFromDatasourceId", "d2"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let storage = storage_with(&["d1", "d2"]).await;
        let outcome = collect_snapshot(
            Arc::new(graph_client(&server)),
            &storage,
            &config(),
            date(),
            &SilentProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, SnapshotOutcome::Appended(2));

        let history = storage.load_history().await.unwrap();
        let d2 = history.iter().find(|r| r.entity_id == "d2").unwrap();
        assert!(d2.metrics.is_all_unknown());
    }

    #[tokio::test]
    async fn cancelled_collection_writes_nothing() {
        let server = MockServer::start().await;
        mount_token(&server).await;

        let storage = storage_with(&["d1"]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = collect_snapshot(
            Arc::new(graph_client(&server)),
            &storage,
            &config(),
            date(),
            &SilentProgress,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(outcome, SnapshotOutcome::Cancelled);
        assert!(!storage.has_snapshot_for(date()).await.unwrap());
    }
}
