//! End-to-end ingestion: mocked WHOOP API into a temp SQLite database,
//! plus a Quest file export, both through the orchestrator.

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use healthsync::source::whoop::api::{RetryPolicy, WhoopClient};
use healthsync::source::whoop::auth::{OAuthSettings, TokenManager};
use healthsync::source::whoop::WhoopAdapter;
use healthsync::source::quest::QuestAdapter;
use healthsync::source::{ingest, IngestStatus};
use healthsync::store::{Credential, HealthStore};

fn oauth_settings(server_uri: &str) -> OAuthSettings {
    OAuthSettings {
        client_id: Some("cid".into()),
        client_secret: Some("cs".into()),
        auth_url: format!("{server_uri}/oauth/oauth2/auth"),
        token_url: format!("{server_uri}/oauth/oauth2/token"),
        redirect_uri: "http://localhost:0/callback".into(),
        callback_port: 0,
        scopes: String::new(),
        auth_timeout_secs: 1,
    }
}

fn whoop_adapter(server: &MockServer, store: &HealthStore) -> WhoopAdapter {
    store
        .save_credential(
            "whoop",
            &Credential {
                access_token: "tok".into(),
                refresh_token: Some("r".into()),
                scope: None,
                token_type: None,
                expires_at: Utc::now() + Duration::hours(1),
            },
        )
        .unwrap();
    let tokens = Arc::new(TokenManager::new(
        store.clone(),
        oauth_settings(&server.uri()),
        "whoop",
    ));
    let client = WhoopClient::new(
        server.uri(),
        tokens.clone(),
        RetryPolicy {
            max_attempts: 3,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(4),
        },
    );
    WhoopAdapter::new(client, tokens, store.clone(), 25)
}

fn sleep_record(id: u32) -> serde_json::Value {
    json!({
        "id": format!("sleep-{id}"),
        "user_id": 10129,
        "start": "2024-01-01T22:00:00Z",
        "end": "2024-01-02T06:00:00Z",
        "score": {
            "sleep_efficiency_percentage": 91.0,
            "respiratory_rate": 15.0,
            "stage_summary": {
                "total_rem_sleep_time_milli": 5_400_000,
                "total_slow_wave_sleep_time_milli": 3_600_000
            }
        }
    })
}

#[tokio::test]
async fn whoop_sleeps_flow_raw_and_unified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/activity/sleep"))
        .respond_with(|req: &Request| {
            let token = req
                .url
                .query_pairs()
                .find(|(k, _)| k == "nextToken")
                .map(|(_, v)| v.to_string());
            let body = match token.as_deref() {
                None => json!({
                    "records": (0..25).map(sleep_record).collect::<Vec<_>>(),
                    "next_token": "page2"
                }),
                Some("page2") => json!({
                    "records": (25..40).map(sleep_record).collect::<Vec<_>>(),
                    "next_token": null
                }),
                Some(other) => panic!("unexpected token {other}"),
            };
            ResponseTemplate::new(200).set_body_json(body)
        })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = HealthStore::open(&dir.path().join("healthsync.db")).unwrap();
    let adapter = whoop_adapter(&server, &store);

    let results = ingest(&adapter, &["sleeps"], None, None, true).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, IngestStatus::Success);
    assert_eq!(results[0].records_fetched, 40);
    assert_eq!(results[0].records_loaded, 40);

    assert_eq!(store.count_raw("whoop", "sleeps").unwrap(), 40);
    assert_eq!(store.count_sleep_sessions().unwrap(), 40);
    assert_eq!(store.count_identities().unwrap(), 1);

    let row = store.get_sleep_session("whoop", "sleep-0").unwrap().unwrap();
    assert_eq!(row.duration_minutes, Some(480));
    assert_eq!(row.rem_minutes, Some(90));

    // Replaying the same window must not duplicate anything.
    let results = ingest(&adapter, &["sleeps"], None, None, true).await;
    assert_eq!(results[0].status, IngestStatus::Success);
    assert_eq!(store.count_raw("whoop", "sleeps").unwrap(), 40);
    assert_eq!(store.count_sleep_sessions().unwrap(), 40);
}

#[tokio::test]
async fn failing_resource_leaves_siblings_intact() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/cycle"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/activity/sleep"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [sleep_record(1)],
            "next_token": null
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = HealthStore::open(&dir.path().join("healthsync.db")).unwrap();
    let adapter = whoop_adapter(&server, &store);

    let results = ingest(&adapter, &["cycles", "sleeps"], None, None, false).await;
    assert_eq!(results[0].status, IngestStatus::Error);
    assert!(results[0].error.is_some());
    assert_eq!(results[1].status, IngestStatus::Success);
    assert_eq!(store.count_raw("whoop", "sleeps").unwrap(), 1);
}

#[tokio::test]
async fn quest_observations_flow_to_lab_results() {
    let dir = tempfile::tempdir().unwrap();
    let export = json!([
        {"resourceType": "Patient", "id": "p1",
         "name": [{"family": "Doe", "given": ["Jane"]}]},
        {"resourceType": "Observation", "id": "obs-1",
         "subject": {"reference": "Patient/p1"},
         "effectiveDateTime": "2024-03-01T09:00:00Z",
         "code": {"coding": [{"code": "2345-7", "display": "Glucose"}]},
         "valueQuantity": {"value": 95.0, "unit": "mg/dL"},
         "referenceRange": [{"low": {"value": 70.0}, "high": {"value": 99.0}}]},
        {"resourceType": "Observation", "id": "obs-orphan",
         "code": {"coding": [{"code": "x"}]},
         "valueQuantity": {"value": 1.0}}
    ]);
    std::fs::write(
        dir.path().join("export.json"),
        serde_json::to_string(&export).unwrap(),
    )
    .unwrap();

    let store = HealthStore::open(&dir.path().join("healthsync.db")).unwrap();
    let adapter = QuestAdapter::new(store.clone(), dir.path().to_path_buf(), None);

    let results = ingest(
        &adapter,
        &["patient", "observations"],
        None,
        None,
        true,
    )
    .await;
    assert!(results.iter().all(|r| r.status == IngestStatus::Success));

    // Both observations land raw; only the one with a subject normalizes.
    assert_eq!(store.count_raw("quest", "observations").unwrap(), 2);
    assert_eq!(store.count_lab_results().unwrap(), 1);

    let identity = store.get_identity("quest", "p1").unwrap().unwrap();
    assert_eq!(identity.last_name.as_deref(), Some("Doe"));
    assert_eq!(identity.first_name.as_deref(), Some("Jane"));
}
