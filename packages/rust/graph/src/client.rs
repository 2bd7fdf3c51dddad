//! Rate-limited accessor for the graph API query endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use overview_shared::{Credentials, Datasource, GraphConfig, OverviewError, Result};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, instrument, warn};

use crate::filters::{ORGANIZATIONS_PATH, normalise_ror_link};
use crate::token::TokenCache;

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct EnvelopeHeader {
    #[serde(rename = "numFound", default)]
    num_found: Option<serde_json::Value>,
}

// Missing `Option` fields deserialize as `None`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    header: Option<EnvelopeHeader>,
    results: Option<Vec<T>>,
}

impl<T> Envelope<T> {
    /// The total-match count. Absent stays `None`, never zero.
    fn num_found(&self) -> Result<Option<u64>> {
        let Some(raw) = self.header.as_ref().and_then(|h| h.num_found.as_ref()) else {
            return Ok(None);
        };
        match raw {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| OverviewError::parse(format!("numFound is not a count: {n}"))),
            serde_json::Value::String(s) => s
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| OverviewError::parse(format!("numFound is not a count: {s:?}"))),
            other => Err(OverviewError::parse(format!(
                "numFound is not a count: {other}"
            ))),
        }
    }
}

/// One page of typed records.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub num_found: Option<u64>,
    pub results: Vec<T>,
}

// ---------------------------------------------------------------------------
// Typed records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct OrganizationRecord {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Classification {
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub official_name: Option<String>,
    #[serde(default)]
    pub english_name: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<Classification>,
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub openaire_compatibility: Option<String>,
    #[serde(default)]
    pub last_indexed_date: Option<String>,
    #[serde(default)]
    pub last_index_date: Option<String>,
    #[serde(default)]
    pub date_of_validation: Option<String>,
}

impl DatasourceRecord {
    /// Flatten into a [`Datasource`] owned by `organization_id`.
    ///
    /// Records without an id cannot be keyed and yield `None`.
    pub fn into_datasource(self, organization_id: &str) -> Option<Datasource> {
        let id = non_blank(self.id)?;
        Some(Datasource {
            id,
            organization_id: Some(organization_id.to_string()),
            name: non_blank(self.official_name).or(non_blank(self.english_name)),
            kind: self.kind.and_then(|k| non_blank(k.value)),
            website_url: non_blank(self.website_url),
            oai_endpoint: None,
            compatibility: non_blank(self.openaire_compatibility),
            last_indexed: non_blank(self.last_indexed_date).or(non_blank(self.last_index_date)),
            validated_at: non_blank(self.date_of_validation),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ---------------------------------------------------------------------------
// GraphClient
// ---------------------------------------------------------------------------

/// Authenticated, throttled client for the graph API.
///
/// Every request waits `throttle` after it completes, whatever the outcome.
/// With `n` workers sharing the client the request rate is bounded by
/// `n / throttle`.
pub struct GraphClient {
    http: Client,
    base_url: String,
    throttle: Duration,
    tokens: TokenCache,
    ror_cache: Mutex<HashMap<String, Arc<OnceCell<Option<String>>>>>,
}

impl GraphClient {
    pub fn new(config: &GraphConfig, credentials: Credentials) -> Result<Self> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()
            .map_err(|e| OverviewError::Network(format!("failed to build HTTP client: {e}")))?;

        let tokens = TokenCache::new(
            http.clone(),
            config.token_url.clone(),
            credentials,
            config.refresh_buffer,
        );

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            throttle: config.throttle,
            tokens,
            ror_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Total number of records matching `filters` at `path`.
    ///
    /// Requests a single one-record page; only the header is read.
    #[instrument(skip(self, filters), fields(path = %path))]
    pub async fn fetch_count(&self, path: &str, filters: &[(String, String)]) -> Result<Option<u64>> {
        let envelope: Envelope<serde::de::IgnoredAny> = self.get_envelope(path, filters, 1, 1).await?;
        let count = envelope.num_found()?;
        debug!(?count, "fetched count");
        Ok(count)
    }

    /// One page of typed records.
    pub async fn fetch_page<T: DeserializeOwned>(
        &self,
        path: &str,
        filters: &[(String, String)],
        page: u32,
        page_size: u32,
    ) -> Result<Page<T>> {
        let envelope: Envelope<T> = self.get_envelope(path, filters, page, page_size).await?;
        let num_found = envelope.num_found()?;
        Ok(Page {
            num_found,
            results: envelope.results.unwrap_or_default(),
        })
    }

    /// Look up the graph identifier of the organisation registered under a ROR id.
    ///
    /// Successful lookups, including "not found", are memoised for the
    /// lifetime of the client. Concurrent lookups of the same id wait on a
    /// single request. Failures are not cached.
    #[instrument(skip(self))]
    pub async fn resolve_identifier(&self, registry_id: &str) -> Result<Option<String>> {
        let Some(link) = normalise_ror_link(registry_id) else {
            return Ok(None);
        };

        let cell = self.ror_cache.lock().await.entry(link.clone()).or_default().clone();
        let link = &link;
        let resolved = cell
            .get_or_try_init(|| async move {
                let filters = vec![("pid".to_string(), link.clone())];
                let page: Page<OrganizationRecord> =
                    self.fetch_page(ORGANIZATIONS_PATH, &filters, 1, 1).await?;
                let resolved = page.results.into_iter().find_map(|r| non_blank(r.id));
                if resolved.is_none() {
                    warn!(ror = %link, "no organisation found for registry id");
                }
                Ok::<_, OverviewError>(resolved)
            })
            .await?;
        Ok(resolved.clone())
    }

    async fn get_envelope<T: DeserializeOwned>(
        &self,
        path: &str,
        filters: &[(String, String)],
        page: u32,
        page_size: u32,
    ) -> Result<Envelope<T>> {
        let token = self.tokens.get().await?;
        let url = format!("{}{}", self.base_url, path);

        let result = self.send(&url, &token, filters, page, page_size).await;
        tokio::time::sleep(self.throttle).await;
        result
    }

    async fn send<T: DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
        filters: &[(String, String)],
        page: u32,
        page_size: u32,
    ) -> Result<Envelope<T>> {
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(filters)
            .query(&[("page", page), ("pageSize", page_size)])
            .send()
            .await
            .map_err(|e| OverviewError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OverviewError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        response
            .json::<Envelope<T>>()
            .await
            .map_err(|e| OverviewError::parse(format!("{url}: {e}")))
    }
}
