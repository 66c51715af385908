use std::sync::Arc;

use base64::Engine;
use docqa::extract::DefaultExtractor;
use docqa::server::{router, AppState};
use docqa_core::store::InMemoryStore;
use docqa_core::Pipeline;
use serde_json::{json, Value};

const POLICY: &str = "Section 1. Members aged 18 to 65 are eligible.\n\n\
Section 2. Knee surgery is covered up to Rs 2,00,000 per policy year.\n\n\
Section 3. Dental procedures are excluded.";

/// Serve the router on an ephemeral port and return its base URL.
async fn spawn_server() -> String {
    let pipeline = Pipeline::builder(Arc::new(InMemoryStore::new(0)))
        .extractor(Arc::new(DefaultExtractor))
        .build();
    let app = router(AppState {
        pipeline: Arc::new(pipeline),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn health_reports_version_and_tiers() {
    let base = spawn_server().await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["tiers"]["rule-based"], true);
}

#[tokio::test]
async fn ingest_then_process() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/v1/documents", base))
        .json(&json!({ "source": "policy.txt", "text": POLICY }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let report: Value = resp.json().await.unwrap();
    assert!(report["chunk_count"].as_u64().unwrap() >= 1);

    let resp = client
        .post(format!("{}/api/v1/process", base))
        .json(&json!({ "query": "46M, knee surgery in Pune, 3-month-old policy" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let answer: Value = resp.json().await.unwrap();
    assert_eq!(answer["generator_used"], "rule-based");
    assert!(!answer["source_chunk_ids"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn empty_query_is_bad_request() {
    let base = spawn_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/v1/process", base))
        .json(&json!({ "query": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn chunks_stats_and_delete() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let content = base64::engine::general_purpose::STANDARD.encode(POLICY);
    let report: Value = client
        .post(format!("{}/api/v1/documents", base))
        .json(&json!({ "source": "policy", "format": "text/plain", "content_base64": content }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = report["document_id"].as_str().unwrap().to_string();

    let listed: Value = client
        .get(format!("{}/api/v1/chunks?contains=dental", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chunks = listed["chunks"].as_array().unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0]["document_id"], id.as_str());

    let stats: Value = client
        .get(format!("{}/api/v1/stats", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["documents"], 1);
    assert_eq!(stats["embedded_chunks"], 0);

    let resp = client
        .delete(format!("{}/api/v1/documents/{}", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .delete(format!("{}/api/v1/documents/{}", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn unsupported_format_is_rejected() {
    let base = spawn_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/v1/documents", base))
        .json(&json!({ "source": "archive", "format": "application/zip", "text": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 415);
}
