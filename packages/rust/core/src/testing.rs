//! Shared fixtures for the pipeline tests.

use std::path::PathBuf;
use std::time::Duration;

use overview_graph::GraphClient;
use overview_shared::{Credentials, GraphConfig};
use overview_storage::Storage;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub(crate) fn test_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("overview_core_test_{}.db", Uuid::now_v7()))
}

pub(crate) async fn test_storage() -> Storage {
    Storage::open(&test_db_path()).await.unwrap()
}

pub(crate) async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/oidc/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "tok",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
}

pub(crate) fn graph_client(server: &MockServer) -> GraphClient {
    let config = GraphConfig {
        base_url: format!("{}/graph", server.uri()),
        token_url: format!("{}/oidc/token", server.uri()),
        user_agent: "overview-test".into(),
        throttle: Duration::ZERO,
        timeout: Duration::from_secs(5),
        refresh_buffer: Duration::from_secs(60),
    };
    let credentials = Credentials {
        client_id: "id".into(),
        client_secret: "secret".into(),
    };
    GraphClient::new(&config, credentials).unwrap()
}

/// A count-only envelope; `None` omits `numFound`.
pub(crate) fn count_body(count: Option<u64>) -> ResponseTemplate {
    let header = match count {
        Some(n) => serde_json::json!({ "numFound": n }),
        None => serde_json::json!({}),
    };
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "header": header,
        "results": []
    }))
}
