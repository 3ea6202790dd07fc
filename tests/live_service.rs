/// Smoke tests against a running zipwater server.
///
/// Prerequisites:
/// - `zipwater serve` running with data loaded
/// - ZIPWATER_BASE_URL set, e.g. http://localhost:8000
///
/// Run with: cargo test --test live_service -- --ignored
///
/// Note: assertions only rely on the health endpoints and on input validation, so
/// they hold for any loaded dataset.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn base_url() -> String {
    dotenv::dotenv().ok();
    std::env::var("ZIPWATER_BASE_URL")
        .unwrap_or_else(|_| "http://localhost:8000".to_string())
        .trim_end_matches('/')
        .to_string()
}

fn client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("HTTP client should build")
}

fn get(path: &str) -> (StatusCode, Value) {
    let response = client()
        .get(format!("{}{}", base_url(), path))
        .send()
        .unwrap_or_else(|e| panic!("request to {} failed: {}", path, e));
    let status = response.status();
    let body = response.json::<Value>().unwrap_or(Value::Null);
    (status, body)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn health_endpoint_answers() {
    let (status, body) = get("/health");
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[test]
#[ignore]
fn readiness_reports_loaded_rows() {
    let (status, body) = get("/readyz");
    assert_eq!(status, StatusCode::OK, "store should be reachable");
    assert_eq!(body["ok"], true, "server should have data loaded: {}", body);
    assert!(body["pws_rows"].as_i64().unwrap_or(0) > 0);
}

#[test]
#[ignore]
fn malformed_zip_is_rejected() {
    let (status, body) = get("/v1/zip/1234/pws");
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _) = get("/v1/contaminants?zip=1234");
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[test]
#[ignore]
fn unserved_zip_is_not_found() {
    let (status, body) = get("/v1/contaminants?zip=00000");
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "No PWS mapping found for ZIP 00000.");
}

#[test]
#[ignore]
fn top_n_above_limit_is_rejected() {
    let (status, _) = get("/v1/contaminants?zip=21201&top_n=51");
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
