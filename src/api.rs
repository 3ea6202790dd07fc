//! HTTP serving boundary.
//!
//! Handlers validate their arguments on the async side, then run the
//! blocking store work on a `spawn_blocking` worker with a store session of
//! its own, borrowed from a bounded pool. If the client goes away before
//! the worker finishes, the in-flight Postgres query is cancelled, and a
//! worker still waiting for a connection skips its query entirely.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};

use crate::config::{Config, ServerConfig};
use crate::coverage;
use crate::logging::{self, LogSource};
use crate::model::{LookupError, ZipRanking, validate_zip};
use crate::ranking::{self, RankRequest};
use crate::store::{MeasurementStore, PgOpener, RowCounts, StoreError, StoreOpener};

// ---------------------------------------------------------------------------
// State and router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub opener: Arc<dyn StoreOpener>,
    pub server: ServerConfig,
}

impl AppState {
    pub fn new(opener: Arc<dyn StoreOpener>, server: ServerConfig) -> Self {
        Self { opener, server }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readyz))
        .route("/v1/zip/{zip}/pws", get(zip_systems))
        .route("/v1/contaminants", get(contaminants))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_ready() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "store not ready".to_string(),
        }
    }
}

impl From<LookupError> for ApiError {
    fn from(err: LookupError) -> Self {
        let (status, message) = match err {
            LookupError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            LookupError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            LookupError::DependencyUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "measurement store unavailable".to_string(),
            ),
            LookupError::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal store error".to_string(),
            ),
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Blocking store sessions
// ---------------------------------------------------------------------------

/// Cancels the session's running query unless disarmed first.
///
/// The worker publishes its cancel token, then checks `abandoned`; the
/// guard sets `abandoned`, then looks for a token. Whichever runs second
/// sees the other's write, so a dropped request either cancels the query or
/// stops the worker before it starts one.
struct CancelOnDrop {
    tokens: mpsc::Receiver<postgres::CancelToken>,
    abandoned: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.abandoned.store(true, Ordering::SeqCst);
        if let Ok(token) = self.tokens.try_recv() {
            logging::debug(LogSource::Http, None, "request dropped, cancelling store query");
            // cancel_query blocks on its own connection; keep it off the runtime.
            std::thread::spawn(move || {
                if let Err(e) = token.cancel_query(postgres::NoTls) {
                    logging::warn(LogSource::Store, None, &format!("query cancel failed: {}", e));
                }
            });
        }
    }
}

/// Runs `job` against a store session on a blocking worker.
async fn with_store<T, F>(opener: Arc<dyn StoreOpener>, job: F) -> Result<T, LookupError>
where
    T: Send + 'static,
    F: FnOnce(&mut (dyn MeasurementStore + Send)) -> Result<T, LookupError> + Send + 'static,
{
    let (token_tx, token_rx) = mpsc::channel();
    let abandoned = Arc::new(AtomicBool::new(false));
    let mut guard = CancelOnDrop {
        tokens: token_rx,
        abandoned: abandoned.clone(),
        armed: true,
    };

    let worker = tokio::task::spawn_blocking(move || -> Result<T, LookupError> {
        let mut store = opener.open()?;
        if let Some(token) = store.cancel_token() {
            let _ = token_tx.send(token);
        }
        drop(token_tx);
        if abandoned.load(Ordering::SeqCst) {
            logging::debug(LogSource::Http, None, "request dropped while connecting, skipping query");
            return Err(LookupError::Store("request abandoned".to_string()));
        }
        job(&mut *store)
    });

    let joined = worker.await;
    guard.armed = false;

    joined.map_err(|e| LookupError::Store(format!("store worker failed: {}", e)))?
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub ok: bool,
    pub pws_rows: i64,
    pub zip_map_rows: i64,
    pub contaminant_rows: i64,
    pub measurement_rows: i64,
}

impl From<RowCounts> for ReadyResponse {
    fn from(counts: RowCounts) -> Self {
        Self {
            ok: counts.water_systems > 0 && counts.zip_coverage > 0,
            pws_rows: counts.water_systems,
            zip_map_rows: counts.zip_coverage,
            contaminant_rows: counts.contaminants,
            measurement_rows: counts.measurements,
        }
    }
}

async fn readyz(State(state): State<AppState>) -> Result<Json<ReadyResponse>, ApiError> {
    let counts = with_store(state.opener.clone(), |store| Ok(store.row_counts()?))
        .await
        .map_err(|err| {
            logging::warn(LogSource::Http, None, &format!("readiness check failed: {}", err));
            ApiError::not_ready()
        })?;
    Ok(Json(ReadyResponse::from(counts)))
}

#[derive(Debug, Deserialize)]
struct CandidatesQuery {
    limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Candidate {
    pub zip: String,
    pub pws_name: String,
    pub pwsid: Option<String>,
    pub coverage_fraction: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ZipCandidatesResponse {
    pub zip: String,
    pub candidates: Vec<Candidate>,
}

/// Malformed query strings get the same JSON error body as every other 400.
fn query_args<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, LookupError> {
    query
        .map(|Query(args)| args)
        .map_err(|rejection| LookupError::InvalidInput(rejection.body_text()))
}

fn check_range(name: &str, value: i64, max: i64) -> Result<(), LookupError> {
    if (1..=max).contains(&value) {
        Ok(())
    } else {
        Err(LookupError::InvalidInput(format!(
            "{} must be between 1 and {}, got {}",
            name, max, value
        )))
    }
}

async fn zip_systems(
    Path(zip): Path<String>,
    State(state): State<AppState>,
    query: Result<Query<CandidatesQuery>, QueryRejection>,
) -> Result<Json<ZipCandidatesResponse>, ApiError> {
    let query = query_args(query)?;
    let limit = query.limit.unwrap_or(state.server.default_candidates);
    check_range("limit", limit, state.server.max_candidates)?;
    validate_zip(&zip)?;

    let lookup_zip = zip.clone();
    let systems = with_store(state.opener.clone(), move |store| {
        coverage::lookup(store, &lookup_zip, limit as usize)
    })
    .await
    .inspect_err(|err| logging::log_lookup_failure(&zip, "lookup", err))?;

    let candidates = systems
        .into_iter()
        .map(|system| Candidate {
            zip: zip.clone(),
            pws_name: system.pws_name,
            pwsid: system.pwsid,
            coverage_fraction: system.coverage_fraction.known(),
        })
        .collect();

    Ok(Json(ZipCandidatesResponse { zip, candidates }))
}

#[derive(Debug, Deserialize)]
struct ContaminantsQuery {
    zip: Option<String>,
    top_n: Option<i64>,
    year: Option<i32>,
    /// Pin the ranking to one system by exact name.
    pws: Option<String>,
}

async fn contaminants(
    State(state): State<AppState>,
    query: Result<Query<ContaminantsQuery>, QueryRejection>,
) -> Result<Json<ZipRanking>, ApiError> {
    let query = query_args(query)?;
    let zip = query
        .zip
        .ok_or_else(|| LookupError::InvalidInput("zip is required".to_string()))?;
    let top_n = query.top_n.unwrap_or(state.server.default_top_n);
    check_range("top_n", top_n, state.server.max_top_n)?;

    let request = RankRequest {
        zip,
        top_n,
        year: query.year,
        pws: query.pws.filter(|name| !name.trim().is_empty()),
    };
    request.validate()?;

    let zip = request.zip.clone();
    let ranking = with_store(state.opener.clone(), move |store| ranking::rank_zip(store, &request))
        .await
        .inspect_err(|err| logging::log_lookup_failure(&zip, "rank", err))?;

    Ok(Json(ranking))
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("invalid bind address '{addr}': {source}")]
    Address {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("store check at startup failed: {0}")]
    Store(#[from] StoreError),
    #[error("startup worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Serves the API until Ctrl-C. Fails fast if the store is unreachable.
pub async fn serve(config: &Config) -> Result<(), ServeError> {
    let addr: SocketAddr = config.server.bind.parse().map_err(|source| ServeError::Address {
        addr: config.server.bind.clone(),
        source,
    })?;

    let pool = PgOpener::new(&config.database)?;
    logging::info(
        LogSource::Store,
        None,
        &format!("connection pool allows {} sessions", pool.max_sessions()),
    );
    let opener: Arc<dyn StoreOpener> = Arc::new(pool);
    let ping = opener.clone();
    let counts = tokio::task::spawn_blocking(move || -> Result<RowCounts, StoreError> {
        let mut store = ping.open()?;
        store.row_counts()
    })
    .await
    .map_err(|e| ServeError::Worker(e.to_string()))??;

    logging::info(
        LogSource::System,
        None,
        &format!(
            "store reachable: {} systems, {} crosswalk rows, {} measurements",
            counts.water_systems, counts.zip_coverage, counts.measurements
        ),
    );
    if counts.zip_coverage == 0 {
        logging::warn(LogSource::System, None, "crosswalk is empty; every zip will 404");
    }

    let app = build_router(AppState::new(opener, config.server.clone()));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    logging::info(LogSource::Http, None, &format!("listening on http://{}", addr));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    logging::info(LogSource::System, None, "server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        logging::error(LogSource::System, None, &format!("could not listen for Ctrl-C: {}", e));
        std::future::pending::<()>().await;
    }
    logging::info(LogSource::System, None, "shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Counts sessions so tests can assert a request never reached the store.
    struct CountingOpener {
        inner: MemoryStore,
        opened: Arc<AtomicUsize>,
    }

    impl StoreOpener for CountingOpener {
        fn open(&self) -> Result<Box<dyn MeasurementStore + Send>, StoreError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.inner.open()
        }
    }

    /// Blocks in `open` until released, like a pool with no free connection.
    struct GatedOpener {
        inner: MemoryStore,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl StoreOpener for GatedOpener {
        fn open(&self) -> Result<Box<dyn MeasurementStore + Send>, StoreError> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            self.inner.open()
        }
    }

    fn baltimore() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.add_coverage("21201", "Baltimore City DPW", Some(0.99));
        store.add_measurement("Baltimore City DPW", "TTHM", Some(2023), 72.0);
        store.add_measurement("Baltimore City DPW", "HAA5", Some(2023), 54.0);
        store.add_measurement("Baltimore City DPW", "Lead", Some(2023), 2.74);
        store.add_measurement("Baltimore City DPW", "Lead", Some(2022), 3.10);
        store
    }

    fn app_with(store: MemoryStore) -> (Router, Arc<AtomicUsize>) {
        let opened = Arc::new(AtomicUsize::new(0));
        let opener = CountingOpener {
            inner: store,
            opened: opened.clone(),
        };
        let state = AppState::new(Arc::new(opener), ServerConfig::default());
        (build_router(state), opened)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn health_is_always_ok() {
        let (app, opened) = app_with(MemoryStore::offline());
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "ok": true }));
        assert_eq!(opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn readyz_reports_counts() {
        let (app, _) = app_with(baltimore());
        let (status, body) = get_json(app, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        let ready: ReadyResponse = serde_json::from_value(body).unwrap();
        assert!(ready.ok);
        assert_eq!(ready.pws_rows, 1);
        assert_eq!(ready.zip_map_rows, 1);
        assert_eq!(ready.measurement_rows, 4);
    }

    #[tokio::test]
    async fn readyz_is_503_when_store_is_down() {
        let (app, _) = app_with(MemoryStore::offline());
        let (status, body) = get_json(app, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "store not ready");
    }

    #[tokio::test]
    async fn zip_candidates_are_ordered_by_coverage() {
        let mut store = MemoryStore::new();
        store.add_coverage("20850", "Rockville", None);
        store.add_coverage("20850", "WSSC", Some(0.7));
        store.add_coverage("20850", "Gaithersburg", Some(0.2));
        let (app, _) = app_with(store);

        let (status, body) = get_json(app, "/v1/zip/20850/pws").await;
        assert_eq!(status, StatusCode::OK);
        let response: ZipCandidatesResponse = serde_json::from_value(body).unwrap();
        let names: Vec<&str> = response.candidates.iter().map(|c| c.pws_name.as_str()).collect();
        assert_eq!(names, ["WSSC", "Gaithersburg", "Rockville"]);
        assert_eq!(response.candidates[0].coverage_fraction, Some(0.7));
        assert_eq!(response.candidates[2].coverage_fraction, None);
    }

    #[tokio::test]
    async fn zip_candidates_respect_limit_bounds() {
        let (app, opened) = app_with(baltimore());
        for uri in ["/v1/zip/21201/pws?limit=0", "/v1/zip/21201/pws?limit=21"] {
            let (status, body) = get_json(app.clone(), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert!(body["error"].as_str().unwrap().contains("limit"));
        }
        assert_eq!(opened.load(Ordering::SeqCst), 0);

        let (status, body) = get_json(app, "/v1/zip/21201/pws?limit=20").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["candidates"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_zip_is_400_without_store_access() {
        let (app, opened) = app_with(baltimore());
        let (status, _) = get_json(app.clone(), "/v1/zip/2120/pws").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get_json(app, "/v1/contaminants?zip=abcde").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unserved_zip_is_404_on_both_routes() {
        let (app, _) = app_with(baltimore());
        let (status, body) = get_json(app.clone(), "/v1/zip/00000/pws").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "No PWS mapping found for ZIP 00000.");

        let (status, _) = get_json(app, "/v1/contaminants?zip=00000").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn contaminants_are_ranked_with_provenance() {
        let (app, _) = app_with(baltimore());
        let (status, body) = get_json(app, "/v1/contaminants?zip=21201&top_n=3").await;
        assert_eq!(status, StatusCode::OK);

        assert_eq!(body["zip"], "21201");
        let ranked: Vec<&str> = body["contaminants"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["contaminant"].as_str().unwrap())
            .collect();
        assert_eq!(ranked, ["TTHM", "HAA5", "Lead"]);

        let lead = &body["contaminants"][2];
        assert_eq!(lead["estimate_ppb"], 2.74, "latest year should be selected");
        assert_eq!(lead["method"], "weighted");
        assert_eq!(lead["contributions"][0]["year"], 2023);
        assert_eq!(body["systems"][0]["coverage_fraction"], 0.99);
    }

    #[tokio::test]
    async fn contaminants_year_filter() {
        let (app, _) = app_with(baltimore());
        let (status, body) = get_json(app, "/v1/contaminants?zip=21201&year=2022").await;
        assert_eq!(status, StatusCode::OK);
        let contaminants = body["contaminants"].as_array().unwrap();
        assert_eq!(contaminants.len(), 1);
        assert_eq!(contaminants[0]["estimate_ppb"], 3.10);
    }

    #[tokio::test]
    async fn contaminants_argument_errors() {
        let (app, opened) = app_with(baltimore());
        for uri in [
            "/v1/contaminants",
            "/v1/contaminants?zip=21201&top_n=0",
            "/v1/contaminants?zip=21201&top_n=51",
            "/v1/contaminants?zip=21201&year=1800",
            "/v1/contaminants?zip=21201&top_n=abc",
            "/v1/zip/21201/pws?limit=-x",
        ] {
            let (status, body) = get_json(app.clone(), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert!(body["error"].is_string(), "{} should answer with a JSON error, got {}", uri, body);
        }
        assert_eq!(opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unparsable_query_value_names_the_field() {
        let (app, _) = app_with(baltimore());
        let (status, body) = get_json(app, "/v1/contaminants?zip=21201&top_n=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("top_n"));
    }

    #[tokio::test]
    async fn contaminants_pinned_to_listed_system() {
        let mut store = MemoryStore::new();
        store.add_coverage("20850", "WSSC", Some(0.6));
        store.add_coverage("20850", "Rockville", Some(0.4));
        store.add_measurement("WSSC", "Nitrate", Some(2023), 100.0);
        store.add_measurement("Rockville", "Nitrate", Some(2023), 50.0);
        let (app, _) = app_with(store);

        let (status, body) = get_json(app.clone(), "/v1/contaminants?zip=20850").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["contaminants"][0]["estimate_ppb"], 80.0);

        let (status, body) = get_json(app, "/v1/contaminants?zip=20850&pws=Rockville").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["systems"].as_array().unwrap().len(), 1);
        assert_eq!(body["contaminants"][0]["estimate_ppb"], 50.0);
        assert_eq!(body["contaminants"][0]["method"], "weighted");
    }

    #[tokio::test]
    async fn contaminants_pinned_to_unlisted_system_is_low_confidence() {
        let mut store = baltimore();
        store.add_measurement("Patapsco", "TTHM", Some(2023), 30.0);
        let (app, _) = app_with(store);

        let (status, body) = get_json(app, "/v1/contaminants?zip=21201&pws=Patapsco").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["systems"][0]["pws_name"], "Patapsco");
        assert_eq!(body["systems"][0]["coverage_fraction"], "unknown");
        let tthm = &body["contaminants"][0];
        assert_eq!(tthm["estimate_ppb"], 30.0);
        assert_eq!(tthm["method"], "unweighted_fallback");
        assert_eq!(tthm["low_confidence"], true);
    }

    #[tokio::test]
    async fn request_dropped_while_connecting_never_runs_its_query() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let opener: Arc<dyn StoreOpener> = Arc::new(GatedOpener {
            inner: baltimore(),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let request = tokio::spawn(with_store(opener.clone(), move |store| {
            flag.store(true, Ordering::SeqCst);
            Ok(store.row_counts()?)
        }));
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();
        request.abort();
        assert!(request.await.unwrap_err().is_cancelled());

        release_tx.send(()).unwrap();
        // The worker holds the last other reference to the opener until it returns.
        for _ in 0..500 {
            if Arc::strong_count(&opener) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(Arc::strong_count(&opener), 1, "worker should have finished");
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn store_outage_is_503() {
        let (app, _) = app_with(MemoryStore::offline());
        let (status, body) = get_json(app, "/v1/contaminants?zip=21201").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "measurement store unavailable");
    }

    #[tokio::test]
    async fn cors_allows_any_origin() {
        let (app, _) = app_with(baltimore());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "https://example.org")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }
}
