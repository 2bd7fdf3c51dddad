//! Application configuration for the overview pipeline.
//!
//! User config lives at `~/.overview/overview.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OverviewError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "overview.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".overview";

// ---------------------------------------------------------------------------
// Config structs (matching overview.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Graph API endpoints and client behaviour.
    #[serde(default)]
    pub api: ApiConfig,

    /// Enrichment pipeline settings.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// Endpoint probing settings.
    #[serde(default)]
    pub probe: ProbeSection,
}

/// `[api]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Graph API root; resource paths such as `/v1/projects` are appended.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// OIDC token endpoint for the client-credentials exchange.
    #[serde(default = "default_token_url")]
    pub token_url: String,

    /// User-Agent sent with every API and probe request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Name of the env var holding the client id (never store the value itself).
    #[serde(default = "default_client_id_env")]
    pub client_id_env: String,

    /// Name of the env var holding the client secret.
    #[serde(default = "default_client_secret_env")]
    pub client_secret_env: String,

    /// Pause after every graph API call, in milliseconds.
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,

    /// Per-request timeout for graph API and token calls.
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,

    /// Refresh the token this many seconds before it expires.
    #[serde(default = "default_refresh_buffer")]
    pub token_refresh_buffer_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token_url: default_token_url(),
            user_agent: default_user_agent(),
            client_id_env: default_client_id_env(),
            client_secret_env: default_client_secret_env(),
            throttle_ms: default_throttle_ms(),
            timeout_secs: default_api_timeout(),
            token_refresh_buffer_secs: default_refresh_buffer(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openaire.eu/graph".into()
}
fn default_token_url() -> String {
    "https://aai.openaire.eu/oidc/token".into()
}
fn default_user_agent() -> String {
    concat!("graph-overview/", env!("CARGO_PKG_VERSION")).into()
}
fn default_client_id_env() -> String {
    "CLIENT_ID".into()
}
fn default_client_secret_env() -> String {
    "CLIENT_SECRET".into()
}
fn default_throttle_ms() -> u64 {
    100
}
fn default_api_timeout() -> u64 {
    60
}
fn default_refresh_buffer() -> u64 {
    60
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Concurrent per-entity tasks.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Persist the full result table after this many completed tasks.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,

    /// Path to the libSQL database holding all tables.
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            checkpoint_every: default_checkpoint_every(),
            database: default_database(),
        }
    }
}

fn default_workers() -> usize {
    6
}
fn default_checkpoint_every() -> usize {
    5
}
fn default_database() -> String {
    "data/overview.db".into()
}

/// `[probe]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSection {
    /// Concurrent endpoints probed at once.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Timeout for a single candidate request.
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,

    /// OAI-PMH verb used to describe an endpoint.
    #[serde(default = "default_verb")]
    pub verb: String,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout_secs: default_probe_timeout(),
            verb: default_verb(),
        }
    }
}

fn default_probe_timeout() -> u64 {
    25
}
fn default_verb() -> String {
    "ListMetadataFormats".into()
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime settings for the graph API client.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub base_url: String,
    pub token_url: String,
    pub user_agent: String,
    /// Delay applied after every call.
    pub throttle: Duration,
    pub timeout: Duration,
    pub refresh_buffer: Duration,
}

impl From<&AppConfig> for GraphConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            token_url: config.api.token_url.clone(),
            user_agent: config.api.user_agent.clone(),
            throttle: Duration::from_millis(config.api.throttle_ms),
            timeout: Duration::from_secs(config.api.timeout_secs),
            refresh_buffer: Duration::from_secs(config.api.token_refresh_buffer_secs),
        }
    }
}

/// Runtime settings for the enrichment worker pool.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum tasks in flight.
    pub workers: usize,
    /// Completed tasks between two checkpoints.
    pub checkpoint_every: usize,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            workers: config.pipeline.workers,
            checkpoint_every: config.pipeline.checkpoint_every,
        }
    }
}

impl PipelineConfig {
    /// Reject settings that would stall the pool.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(OverviewError::config("pipeline.workers must be at least 1"));
        }
        if self.checkpoint_every == 0 {
            return Err(OverviewError::config(
                "pipeline.checkpoint_every must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Runtime settings for endpoint probing.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub workers: usize,
    pub timeout: Duration,
    pub verb: String,
    pub user_agent: String,
}

impl From<&AppConfig> for ProbeConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            workers: config.probe.workers,
            timeout: Duration::from_secs(config.probe.timeout_secs),
            verb: config.probe.verb.clone(),
            user_agent: config.api.user_agent.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Client-credentials pair for the token exchange.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Read the client id and secret from the env vars named in the config.
///
/// Absence of either value is a fatal configuration error.
pub fn load_credentials(config: &AppConfig) -> Result<Credentials> {
    let read = |var_name: &str| match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(OverviewError::config(format!(
            "missing graph API credentials. Set the {var_name} environment variable."
        ))),
    };

    Ok(Credentials {
        client_id: read(&config.api.client_id_env)?,
        client_secret: read(&config.api.client_secret_env)?,
    })
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.overview/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| OverviewError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.overview/overview.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| OverviewError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| OverviewError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| OverviewError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| OverviewError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| OverviewError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("token_url"));
        assert!(toml_str.contains("CLIENT_SECRET"));
        assert!(toml_str.contains("ListMetadataFormats"));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[pipeline]
workers = 12

[api]
throttle_ms = 250
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.pipeline.workers, 12);
        assert_eq!(config.pipeline.checkpoint_every, 5);
        assert_eq!(config.api.throttle_ms, 250);
        assert_eq!(config.api.token_refresh_buffer_secs, 60);
        assert_eq!(config.probe.timeout_secs, 25);
    }

    #[test]
    fn runtime_configs_from_app_config() {
        let mut app = AppConfig::default();
        app.api.base_url = "https://graph.example.org/".into();

        let graph = GraphConfig::from(&app);
        assert_eq!(graph.base_url, "https://graph.example.org");
        assert_eq!(graph.throttle, Duration::from_millis(100));
        assert_eq!(graph.refresh_buffer, Duration::from_secs(60));

        let pipeline = PipelineConfig::from(&app);
        assert_eq!(pipeline.workers, 6);
        assert_eq!(pipeline.checkpoint_every, 5);
        assert!(pipeline.validate().is_ok());

        let probe = ProbeConfig::from(&app);
        assert_eq!(probe.timeout, Duration::from_secs(25));
        assert_eq!(probe.verb, "ListMetadataFormats");
    }

    #[test]
    fn zero_workers_rejected() {
        let config = PipelineConfig {
            workers: 0,
            checkpoint_every: 5,
        };
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn missing_credentials_is_config_error() {
        let mut config = AppConfig::default();
        // Unique env var names so parallel tests do not interfere
        config.api.client_id_env = "OVERVIEW_TEST_NONEXISTENT_ID_12345".into();
        config.api.client_secret_env = "OVERVIEW_TEST_NONEXISTENT_SECRET_12345".into();
        let err = load_credentials(&config).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("OVERVIEW_TEST_NONEXISTENT_ID_12345"));
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let creds = Credentials {
            client_id: "abc".into(),
            client_secret: "super-secret".into(),
        };
        let printed = format!("{creds:?}");
        assert!(printed.contains("abc"));
        assert!(!printed.contains("super-secret"));
    }
}
