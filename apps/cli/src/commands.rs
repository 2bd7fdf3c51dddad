//! CLI command definitions, routing, and tracing setup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use overview_core::{
    EnrichmentOrchestrator, ProgressReporter, SnapshotOutcome, collect_snapshot,
    harvest_datasources, import_curated_endpoints, run_probe,
};
use overview_graph::GraphClient;
use overview_probe::EndpointProber;
use overview_shared::{
    AppConfig, Entity, GraphConfig, Metric, PipelineConfig, ProbeConfig, SNAPSHOT_METRICS,
    SnapshotRow, init_config, load_config, load_config_from, load_credentials,
};
use overview_storage::{Storage, latest, previous_two};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Graph overview: enrich organisations, validate endpoints, track snapshots.
#[derive(Parser)]
#[command(
    name = "overview",
    version,
    about = "Enrich organisations from the graph API, validate their OAI-PMH endpoints and track dated snapshots.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.overview/overview.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database path (overrides [pipeline].database).
    #[arg(long, global = true, env = "OVERVIEW_DB")]
    pub db: Option<PathBuf>,

    /// Concurrent tasks for enrichment, snapshots and probing.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Completed enrichment tasks between two checkpoints.
    #[arg(long, global = true)]
    pub checkpoint_every: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Resolve identifiers and fetch metrics for a reference list of organisations.
    Enrich {
        /// JSON array of entities (`id`, `name`, `kind`, `ror`, `parent_ids`).
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Harvest the datasources of every enriched organisation.
    Datasources,

    /// Datasource endpoint maintenance.
    Endpoints {
        #[command(subcommand)]
        action: EndpointsAction,
    },

    /// Validate every datasource endpoint against OAI-PMH.
    Probe,

    /// Append today's per-datasource counts to the snapshot history.
    Snapshot,

    /// Inspect the snapshot history.
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Endpoint subcommands.
#[derive(Subcommand)]
pub(crate) enum EndpointsAction {
    /// Backfill endpoints from a curated JSON list of `{ "id", "endpoint" }`.
    Import {
        /// Path to the curated list.
        file: PathBuf,
    },
}

/// History subcommands.
#[derive(Subcommand)]
pub(crate) enum HistoryAction {
    /// Show the most recent snapshot.
    Latest,
    /// Compare the two most recent snapshots.
    Compare,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "overview=info",
        1 => "overview=debug",
        _ => "overview=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // Logs go to stderr so reports on stdout stay clean.
    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// File config with CLI overrides applied.
struct Settings {
    config: AppConfig,
    db_path: PathBuf,
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(apply_overrides(config, cli))
}

fn apply_overrides(mut config: AppConfig, cli: &Cli) -> Settings {
    if let Some(workers) = cli.workers {
        config.pipeline.workers = workers;
        config.probe.workers = workers;
    }
    if let Some(every) = cli.checkpoint_every {
        config.pipeline.checkpoint_every = every;
    }
    if let Some(db) = &cli.db {
        config.pipeline.database = db.to_string_lossy().into_owned();
    }
    let db_path = PathBuf::from(&config.pipeline.database);
    Settings { config, db_path }
}

fn graph_client(config: &AppConfig) -> Result<Arc<GraphClient>> {
    let credentials = load_credentials(config)?;
    Ok(Arc::new(GraphClient::new(&GraphConfig::from(config), credentials)?))
}

/// A token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            trigger.cancel();
        }
    });
    token
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    // Writing a fresh config must not depend on reading the current one.
    if matches!(cli.command, Command::Config { action: ConfigAction::Init }) {
        return cmd_config_init().await;
    }
    let settings = load_settings(&cli)?;

    match cli.command {
        Command::Enrich { input } => cmd_enrich(&settings, &input).await,
        Command::Datasources => cmd_datasources(&settings).await,
        Command::Endpoints { action } => match action {
            EndpointsAction::Import { file } => cmd_endpoints_import(&settings, &file).await,
        },
        Command::Probe => cmd_probe(&settings).await,
        Command::Snapshot => cmd_snapshot(&settings).await,
        Command::History { action } => match action {
            HistoryAction::Latest => cmd_history_latest(&settings).await,
            HistoryAction::Compare => cmd_history_compare(&settings).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&settings),
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_enrich(settings: &Settings, input: &Path) -> Result<()> {
    let client = graph_client(&settings.config)?;

    let raw = std::fs::read_to_string(input)
        .map_err(|e| eyre!("cannot read '{}': {e}", input.display()))?;
    let entities: Vec<Entity> = serde_json::from_str(&raw)
        .map_err(|e| eyre!("'{}' is not a JSON array of entities: {e}", input.display()))?;

    let storage = Storage::open(&settings.db_path).await?;
    let orchestrator =
        EnrichmentOrchestrator::new(client, PipelineConfig::from(&settings.config))?;

    info!(input = %input.display(), entities = entities.len(), "enriching entities");

    let reporter = CliProgress::new();
    let result = orchestrator
        .run(entities, &storage, &reporter, &cancel_on_ctrl_c())
        .await;
    reporter.finish();
    let report = result?;

    println!();
    println!("  Enrichment {}", if report.cancelled { "interrupted" } else { "complete" });
    println!("  Entities:    {}", report.total);
    println!("  Skipped:     {}", report.skipped);
    println!("  Resolved:    {}", report.resolved);
    println!("  Unresolved:  {}", report.unresolved);
    println!("  Failed:      {}", report.failed);
    println!("  Rejected:    {}", report.rejected);
    println!("  New ids:     {}", report.identifiers_added);
    println!("  Database:    {}", settings.db_path.display());
    println!();

    Ok(())
}

async fn cmd_datasources(settings: &Settings) -> Result<()> {
    let client = graph_client(&settings.config)?;
    let storage = Storage::open(&settings.db_path).await?;

    let reporter = CliProgress::new();
    let result = harvest_datasources(
        client,
        &storage,
        &PipelineConfig::from(&settings.config),
        &reporter,
        &cancel_on_ctrl_c(),
    )
    .await;
    reporter.finish();
    let report = result?;

    if report.cancelled {
        println!("Datasource harvest interrupted, stored datasources left unchanged.");
        return Ok(());
    }
    println!();
    println!("  Organisations: {}", report.organizations);
    println!("  Failed:        {}", report.failed);
    println!("  Kept:          {}", report.kept);
    println!("  Datasources:   {}", report.datasources);
    println!();

    Ok(())
}

async fn cmd_endpoints_import(settings: &Settings, file: &Path) -> Result<()> {
    let storage = Storage::open(&settings.db_path).await?;
    let outcome = import_curated_endpoints(&storage, file).await?;
    println!(
        "Imported {} curated endpoints, {} datasources updated.",
        outcome.entries, outcome.updated
    );
    Ok(())
}

async fn cmd_probe(settings: &Settings) -> Result<()> {
    let storage = Storage::open(&settings.db_path).await?;
    let prober = EndpointProber::new(ProbeConfig::from(&settings.config))?;

    let reporter = CliProgress::new();
    let result = run_probe(&prober, &storage, &reporter, &cancel_on_ctrl_c()).await;
    reporter.finish();
    let run = result?;

    println!();
    println!("  Run {}{}", run.run_id, if run.cancelled { " (interrupted, not saved)" } else { "" });
    for (label, count) in run.summary.rows() {
        println!("  {label:<34} {count}");
    }
    println!();

    Ok(())
}

async fn cmd_snapshot(settings: &Settings) -> Result<()> {
    let client = graph_client(&settings.config)?;
    let storage = Storage::open(&settings.db_path).await?;
    let today = Utc::now().date_naive();

    let reporter = CliProgress::new();
    let result = collect_snapshot(
        client,
        &storage,
        &PipelineConfig::from(&settings.config),
        today,
        &reporter,
        &cancel_on_ctrl_c(),
    )
    .await;
    reporter.finish();

    match result? {
        SnapshotOutcome::Appended(n) => println!("Snapshot for {today}: {n} datasources appended."),
        SnapshotOutcome::AlreadyPresent => println!("Snapshot for {today} already present, nothing to do."),
        SnapshotOutcome::Cancelled => println!("Snapshot for {today} interrupted, nothing written."),
    }
    Ok(())
}

async fn cmd_history_latest(settings: &Settings) -> Result<()> {
    let storage = Storage::open_readonly(&settings.db_path).await?;
    let history = storage.load_history().await?;

    let Some((date, rows)) = latest(&history) else {
        println!("No snapshots recorded yet.");
        return Ok(());
    };

    println!("Snapshot {date} ({} datasources)", rows.len());
    let header: Vec<&str> = SNAPSHOT_METRICS.iter().map(Metric::label).collect();
    println!("{:<40} {}", "Datasource", header.join(" | "));
    for row in rows {
        let cells: Vec<String> = SNAPSHOT_METRICS
            .iter()
            .map(|m| format_count(row.metrics.get(*m)))
            .collect();
        let name = row.name.as_deref().unwrap_or(&row.entity_id);
        println!("{name:<40} {}", cells.join(" | "));
    }
    Ok(())
}

async fn cmd_history_compare(settings: &Settings) -> Result<()> {
    let storage = Storage::open_readonly(&settings.db_path).await?;
    let history = storage.load_history().await?;

    let (current, prior) = previous_two(&history);
    let (Some(current_date), Some(prior_date)) = (snapshot_date(&current), snapshot_date(&prior))
    else {
        println!("Need at least two snapshot dates to compare.");
        return Ok(());
    };

    println!("Comparing {prior_date} -> {current_date}");
    println!("  {:<26} {:>12} {:>12} {:>10}", "Metric", "Previous", "Latest", "Change");
    let before = totals(&prior);
    let after = totals(&current);
    for metric in SNAPSHOT_METRICS {
        let (old, new) = (before.get(metric).copied().flatten(), after.get(metric).copied().flatten());
        let change = match (old, new) {
            (Some(o), Some(n)) => format!("{:+}", n as i64 - o as i64),
            _ => "-".to_string(),
        };
        println!(
            "  {:<26} {:>12} {:>12} {:>10}",
            metric.label(),
            format_count(old),
            format_count(new),
            change
        );
    }
    println!("  {:<26} {:>12} {:>12}", "Datasources", prior.len(), current.len());
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(settings: &Settings) -> Result<()> {
    let toml_str = toml::to_string_pretty(&settings.config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Report helpers
// ---------------------------------------------------------------------------

fn snapshot_date(rows: &[&SnapshotRow]) -> Option<NaiveDate> {
    rows.first().map(|r| r.snapshot_date)
}

/// Per-metric sums. A sum is unknown as soon as one row's count is unknown.
fn totals(rows: &[&SnapshotRow]) -> HashMap<Metric, Option<u64>> {
    SNAPSHOT_METRICS
        .iter()
        .map(|metric| (*metric, rows.iter().map(|row| row.metrics.get(*metric)).sum()))
        .collect()
}

fn format_count(count: Option<u64>) -> String {
    count.map_or_else(|| "-".to_string(), |n| n.to_string())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
    phase: Mutex<String>,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self {
            spinner,
            phase: Mutex::new(String::new()),
        }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        if let Ok(mut phase) = self.phase.lock() {
            *phase = name.to_string();
        }
        self.spinner.set_message(name.to_string());
    }

    fn task_progress(&self, current: usize, total: usize, detail: &str) {
        let phase = self.phase.lock().map(|p| p.clone()).unwrap_or_default();
        self.spinner
            .set_message(format!("{phase} [{current}/{total}] {detail}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use overview_shared::MetricSet;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_file_config() {
        let cli = Cli::parse_from([
            "overview",
            "--workers",
            "9",
            "--checkpoint-every",
            "2",
            "--db",
            "/tmp/x.db",
            "probe",
        ]);
        let settings = apply_overrides(AppConfig::default(), &cli);
        assert_eq!(settings.config.pipeline.workers, 9);
        assert_eq!(settings.config.probe.workers, 9);
        assert_eq!(settings.config.pipeline.checkpoint_every, 2);
        assert_eq!(settings.db_path, PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn totals_are_unknown_when_any_count_is_unknown() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let row = |total: Option<u64>, publications: Option<u64>| SnapshotRow {
            entity_id: "d".into(),
            name: None,
            metrics: MetricSet::unknown()
                .with(Metric::TotalResearchProducts, total)
                .with(Metric::Publications, publications),
            snapshot_date: date,
        };
        let rows = [row(Some(3), Some(1)), row(None, Some(2)), row(Some(4), Some(0))];
        let refs: Vec<&SnapshotRow> = rows.iter().collect();

        let sums = totals(&refs);
        assert_eq!(sums[&Metric::TotalResearchProducts], None);
        assert_eq!(sums[&Metric::Publications], Some(3));
        assert_eq!(sums[&Metric::ResearchData], None);
        assert_eq!(format_count(sums[&Metric::TotalResearchProducts]), "-");
    }

    #[test]
    fn totals_of_fully_known_rows_add_up() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let rows: Vec<SnapshotRow> = [5, 7]
            .into_iter()
            .map(|n| SnapshotRow {
                entity_id: format!("d{n}"),
                name: None,
                metrics: SNAPSHOT_METRICS
                    .iter()
                    .fold(MetricSet::unknown(), |set, m| set.with(*m, Some(n))),
                snapshot_date: date,
            })
            .collect();
        let refs: Vec<&SnapshotRow> = rows.iter().collect();

        let sums = totals(&refs);
        assert!(SNAPSHOT_METRICS.iter().all(|m| sums[m] == Some(12)));
    }
}
