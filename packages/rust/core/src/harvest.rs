//! Datasource harvesting for enriched organisations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use overview_graph::{DATASOURCES_PATH, DatasourceRecord, GraphClient, Page, Scope};
use overview_shared::{Datasource, OverviewError, PipelineConfig, Result};
use overview_storage::Storage;

use crate::pipeline::ProgressReporter;

const PAGE_SIZE: u32 = 100;

/// Counts for one harvesting pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestReport {
    /// Organisations with an identifier that were queried.
    pub organizations: usize,
    /// Organisations whose datasources could not be fetched.
    pub failed: usize,
    /// Distinct datasources written.
    pub datasources: usize,
    /// Stored datasources carried over for organisations that failed.
    pub kept: usize,
    /// The pass was interrupted and the stored table left untouched.
    pub cancelled: bool,
}

/// Page through the datasources of every resolved organisation in storage
/// and overwrite the datasources table with them.
///
/// Organisations are fetched over a pool of `config.workers` tasks. A failing
/// organisation is logged and its previously stored datasources are kept.
/// Endpoints already recorded for a datasource survive the overwrite. An
/// interrupted pass writes nothing.
#[instrument(skip_all, fields(workers = config.workers))]
pub async fn harvest_datasources(
    client: Arc<GraphClient>,
    storage: &Storage,
    config: &PipelineConfig,
    progress: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> Result<HarvestReport> {
    config.validate()?;

    progress.phase("Loading organisations");
    let mut seen_orgs = HashSet::new();
    let org_ids: Vec<String> = storage
        .load_entities()
        .await?
        .into_iter()
        .filter_map(|row| row.entity.identifier().map(str::to_string))
        .filter(|id| seen_orgs.insert(id.clone()))
        .collect();
    let total = org_ids.len();

    let mut report = HarvestReport {
        organizations: total,
        ..Default::default()
    };

    progress.phase("Harvesting datasources");
    let stop = cancel.child_token();
    let semaphore = Arc::new(Semaphore::new(config.workers));
    let mut set = JoinSet::new();

    for org_id in org_ids {
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
            let found = fetch_organization_datasources(&client, &org_id).await;
            Some((org_id, found))
        });
    }

    let mut harvested: HashMap<String, Vec<Datasource>> = HashMap::new();
    let mut failed_orgs = HashSet::new();
    let mut fatal: Option<OverviewError> = None;
    let mut completed = 0;
    while let Some(joined) = set.join_next().await {
        let (org_id, found) = match joined {
            Ok(Some(outcome)) => outcome,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "harvest task failed");
                continue;
            }
        };
        completed += 1;
        progress.task_progress(completed, total, &org_id);

        match found {
            Ok(found) => {
                debug!(organization = %org_id, count = found.len(), "harvested datasources");
                harvested.insert(org_id, found);
            }
            Err(e) if e.is_fatal() => {
                if fatal.is_none() {
                    error!(error = %e, "fatal error, stopping datasource harvest");
                    stop.cancel();
                    fatal = Some(e);
                }
            }
            Err(e) => {
                warn!(organization = %org_id, error = %e, "datasource harvest failed, keeping stored datasources");
                failed_orgs.insert(org_id);
            }
        }
    }

    if let Some(e) = fatal {
        return Err(e);
    }
    if cancel.is_cancelled() {
        warn!(completed, total, "datasource harvest cancelled, nothing written");
        report.cancelled = true;
        return Ok(report);
    }
    report.failed = failed_orgs.len();

    // Harvested first, then stored rows of failed organisations; first id wins.
    let kept: Vec<Datasource> = if failed_orgs.is_empty() {
        Vec::new()
    } else {
        storage
            .load_datasources()
            .await?
            .into_iter()
            .filter(|ds| ds.organization_id.as_ref().is_some_and(|org| failed_orgs.contains(org)))
            .collect()
    };

    let mut org_order: Vec<&String> = harvested.keys().collect();
    org_order.sort();
    let mut seen = HashSet::new();
    let mut datasources = Vec::new();
    for ds in org_order
        .into_iter()
        .flat_map(|org| harvested[org].iter().cloned())
    {
        if seen.insert(ds.id.clone()) {
            datasources.push(ds);
        }
    }
    for ds in kept {
        if seen.insert(ds.id.clone()) {
            report.kept += 1;
            datasources.push(ds);
        }
    }

    progress.phase("Saving datasources");
    storage.replace_datasources(&datasources).await?;
    report.datasources = datasources.len();

    info!(
        organizations = report.organizations,
        failed = report.failed,
        kept = report.kept,
        datasources = report.datasources,
        "datasource harvest complete"
    );
    Ok(report)
}

/// All datasources registered under one organisation.
///
/// Stops once `page * PAGE_SIZE` reaches the reported total or a page comes
/// back empty.
async fn fetch_organization_datasources(client: &GraphClient, org_id: &str) -> Result<Vec<Datasource>> {
    let filters = Scope::Organization.datasources(org_id);
    let mut datasources = Vec::new();
    let mut page_no = 1;

    loop {
        let page: Page<DatasourceRecord> = client
            .fetch_page(DATASOURCES_PATH, &filters, page_no, PAGE_SIZE)
            .await?;
        if page.results.is_empty() {
            break;
        }

        let fetched = page.results.len();
        datasources.extend(
            page.results
                .into_iter()
                .filter_map(|record| record.into_datasource(org_id)),
        );

        let exhausted = match page.num_found {
            Some(total) => u64::from(page_no) * u64::from(PAGE_SIZE) >= total,
            None => fetched < PAGE_SIZE as usize,
        };
        if exhausted {
            break;
        }
        page_no += 1;
    }

    Ok(datasources)
}
