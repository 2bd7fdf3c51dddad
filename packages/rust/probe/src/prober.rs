//! Concurrent OAI-PMH endpoint prober.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use overview_shared::{
    CapabilityFlags, EndpointRecord, OverviewError, ProbeConfig, ProbeResult, ProbeStatus, Result,
};

use crate::endpoint::{build_probe_url, endpoint_candidates};
use crate::oai::{FormatsResponse, parse_metadata_formats};

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for a probing run.
pub trait ProbeProgress: Send + Sync {
    /// Called once per finished entity, in completion order.
    fn probed(&self, result: &ProbeResult, current: usize, total: usize);
}

/// No-op probe progress.
pub struct SilentProbeProgress;

impl ProbeProgress for SilentProbeProgress {
    fn probed(&self, _result: &ProbeResult, _current: usize, _total: usize) {}
}

// ---------------------------------------------------------------------------
// EndpointProber
// ---------------------------------------------------------------------------

/// Validates endpoints against the OAI-PMH `ListMetadataFormats` verb.
#[derive(Clone)]
pub struct EndpointProber {
    client: Client,
    config: ProbeConfig,
}

impl EndpointProber {
    pub fn new(config: ProbeConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()
            .map_err(|e| OverviewError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Probe one entity. Never fails: every problem ends up in the result.
    ///
    /// Candidates are tried strictly in order and the first one that lists
    /// at least one metadata format wins.
    pub async fn probe(&self, record: &EndpointRecord, run_id: Uuid) -> ProbeResult {
        let candidates: Vec<String> = record
            .raw_endpoints
            .iter()
            .flat_map(|raw| endpoint_candidates(raw))
            .fold(Vec::new(), |mut acc, c| {
                if !acc.contains(&c) {
                    acc.push(c);
                }
                acc
            });

        if candidates.is_empty() {
            debug!(entity = %record.entity_id, "no endpoint to probe");
            return ProbeResult {
                entity_id: record.entity_id.clone(),
                run_id,
                status: ProbeStatus::MissingEndpoint,
                error: None,
                formats_detected: None,
                flags: CapabilityFlags::none(),
                tested_at: Utc::now(),
            };
        }

        let mut errors: Vec<String> = Vec::new();
        let mut formats: Vec<String> = Vec::new();

        for candidate in &candidates {
            match self.request(candidate).await {
                Ok(FormatsResponse::Formats(found)) => {
                    debug!(entity = %record.entity_id, %candidate, count = found.len(), "endpoint answered");
                    formats = found;
                    errors.clear();
                    break;
                }
                Ok(other) => {
                    if let Some(msg) = other.failure_message() {
                        errors.push(format!("{candidate}: {msg}"));
                    }
                }
                Err(msg) => errors.push(format!("{candidate}: {msg}")),
            }
        }

        let tested_at = Utc::now();
        if formats.is_empty() {
            let error = if errors.is_empty() {
                "Unknown error".to_string()
            } else {
                errors.join("; ")
            };
            debug!(entity = %record.entity_id, %error, "endpoint failed");
            return ProbeResult {
                entity_id: record.entity_id.clone(),
                run_id,
                status: ProbeStatus::Error,
                error: Some(error),
                formats_detected: None,
                flags: CapabilityFlags::none(),
                tested_at,
            };
        }

        let unique: BTreeSet<&str> = formats.iter().map(String::as_str).collect();
        ProbeResult {
            entity_id: record.entity_id.clone(),
            run_id,
            status: ProbeStatus::Ok,
            error: None,
            formats_detected: Some(unique.into_iter().collect::<Vec<_>>().join(", ")),
            flags: CapabilityFlags::from_formats(&formats),
            tested_at,
        }
    }

    /// Probe every record over a bounded pool.
    ///
    /// Once `cancel` fires no further record is started; records already in
    /// flight finish and are returned. Results come back in completion order.
    #[instrument(skip_all, fields(records = records.len(), workers = self.config.workers))]
    pub async fn probe_all(
        &self,
        records: Vec<EndpointRecord>,
        run_id: Uuid,
        progress: &dyn ProbeProgress,
        cancel: &CancellationToken,
    ) -> Vec<ProbeResult> {
        let total = records.len();
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut set = JoinSet::new();

        info!(total, %run_id, "starting endpoint probes");

        for record in records {
            let prober = self.clone();
            let sem = semaphore.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return None;
                };
                if cancel.is_cancelled() {
                    return None;
                }
                Some(prober.probe(&record, run_id).await)
            });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(result)) => {
                    progress.probed(&result, results.len() + 1, total);
                    results.push(result);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "probe task failed"),
            }
        }

        if cancel.is_cancelled() {
            warn!(probed = results.len(), total, "probe run cancelled");
        } else {
            info!(probed = results.len(), "endpoint probes complete");
        }
        results
    }

    async fn request(&self, candidate: &str) -> std::result::Result<FormatsResponse, String> {
        let url = build_probe_url(candidate, &self.config.verb);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }

        let body = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(parse_metadata_formats(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overview_shared::CapabilityFlag;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FORMATS_XML: &str = r#"<?xml version="1.0"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <ListMetadataFormats>
    <metadataFormat><metadataPrefix>oai_dc</metadataPrefix></metadataFormat>
    <metadataFormat><metadataPrefix>oai_cerif_openaire</metadataPrefix></metadataFormat>
  </ListMetadataFormats>
</OAI-PMH>"#;

    fn prober() -> EndpointProber {
        prober_with_timeout(Duration::from_secs(2))
    }

    fn prober_with_timeout(timeout: Duration) -> EndpointProber {
        EndpointProber::new(ProbeConfig {
            workers: 3,
            timeout,
            verb: "ListMetadataFormats".into(),
            user_agent: "overview-test".into(),
        })
        .unwrap()
    }

    fn record(id: &str, raw: &[&str]) -> EndpointRecord {
        EndpointRecord {
            entity_id: id.into(),
            raw_endpoints: raw.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn blank_endpoint_is_missing_without_network() {
        let server = MockServer::start().await;
        let prober = prober();

        for raw in [vec![], vec!["   "], vec!["[]"]] {
            let result = prober.probe(&record("ds", &raw), Uuid::now_v7()).await;
            assert_eq!(result.status, ProbeStatus::MissingEndpoint);
            assert_eq!(result.flags, CapabilityFlags::none());
            assert_eq!(result.error, None);
        }
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_successful_candidate_wins() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/oai"))
            .and(query_param("verb", "ListMetadataFormats"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FORMATS_XML))
            .expect(1)
            .mount(&server)
            .await;
        // Never reached once /oai succeeds.
        Mock::given(method("GET"))
            .and(path("/later"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FORMATS_XML))
            .expect(0)
            .mount(&server)
            .await;

        let base = server.uri();
        let broken = format!("{base}/broken");
        let oai = format!("{base}/oai");
        let later = format!("{base}/later");
        let rec = record("ds1", &[broken.as_str(), oai.as_str(), later.as_str()]);
        let result = prober().probe(&rec, Uuid::now_v7()).await;

        assert_eq!(result.status, ProbeStatus::Ok);
        assert_eq!(result.error, None);
        assert_eq!(
            result.formats_detected.as_deref(),
            Some("oai_cerif_openaire, oai_dc")
        );
        assert!(result.flags.get(CapabilityFlag::OaiDc));
        assert!(result.flags.get(CapabilityFlag::OaiCerifOpenaire));
        assert!(!result.flags.get(CapabilityFlag::OaiOpenaire));
        assert!(!result.flags.get(CapabilityFlag::NlDidl));
    }

    #[tokio::test]
    async fn all_candidates_failing_aggregates_errors() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/verb"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><error code="badVerb">Illegal verb</error></OAI-PMH>"#,
            ))
            .mount(&server)
            .await;

        let base = server.uri();
        let gone = format!("{base}/gone");
        let verb = format!("{base}/verb");
        let result = prober()
            .probe(&record("ds2", &[gone.as_str(), verb.as_str()]), Uuid::now_v7())
            .await;

        assert_eq!(result.status, ProbeStatus::Error);
        assert_eq!(result.formats_detected, None);
        assert!(!result.flags.any());
        let error = result.error.unwrap();
        assert!(error.starts_with(&format!("{gone}: HTTP 404")), "{error}");
        assert!(error.ends_with(&format!("{verb}: badVerb: Illegal verb")), "{error}");
    }

    #[tokio::test]
    async fn probe_all_returns_one_result_per_record() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/oai"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FORMATS_XML))
            .mount(&server)
            .await;

        let endpoint = format!("{}/oai", server.uri());
        let records = vec![
            record("a", &[endpoint.as_str()]),
            record("b", &[]),
            record("c", &[endpoint.as_str()]),
        ];
        let run_id = Uuid::now_v7();
        let results = prober()
            .probe_all(records, run_id, &SilentProbeProgress, &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.run_id == run_id));
        let missing: Vec<_> = results
            .iter()
            .filter(|r| r.status == ProbeStatus::MissingEndpoint)
            .map(|r| r.entity_id.as_str())
            .collect();
        assert_eq!(missing, vec!["b"]);
    }

    #[tokio::test]
    async fn cancelled_run_starts_nothing() {
        let server = MockServer::start().await;
        let endpoint = format!("{}/oai", server.uri());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = prober()
            .probe_all(
                vec![record("a", &[endpoint.as_str()])],
                Uuid::now_v7(),
                &SilentProbeProgress,
                &cancel,
            )
            .await;

        assert!(results.is_empty());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn timed_out_candidate_falls_through_to_next() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(FORMATS_XML)
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/oai"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FORMATS_XML))
            .expect(1)
            .mount(&server)
            .await;

        let slow = format!("{}/slow", server.uri());
        let oai = format!("{}/oai", server.uri());
        let result = prober_with_timeout(Duration::from_millis(200))
            .probe(&record("ds3", &[slow.as_str(), oai.as_str()]), Uuid::now_v7())
            .await;

        assert_eq!(result.status, ProbeStatus::Ok);
        assert_eq!(result.error, None);
        assert!(result.flags.get(CapabilityFlag::OaiDc));
    }

    #[tokio::test]
    async fn every_candidate_timing_out_is_an_error_result() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(FORMATS_XML)
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let first = format!("{}/one", server.uri());
        let second = format!("{}/two", server.uri());
        let result = prober_with_timeout(Duration::from_millis(200))
            .probe(&record("ds4", &[first.as_str(), second.as_str()]), Uuid::now_v7())
            .await;

        assert_eq!(result.status, ProbeStatus::Error);
        assert!(!result.flags.any());
        let error = result.error.unwrap();
        assert!(error.contains(&first) && error.contains(&second), "{error}");
    }
}
