//! Common test utilities for E2E tests
//!
//! Spins up the relay plus in-process stand-ins for both sides of it:
//! a stub source activity API and a stub sink push endpoint. Tests
//! script the stubs and drive the relay over plain HTTP.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use feedbridge::push::{compute_signature, format_signature_header};
use feedbridge::{AppState, config};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Bearer token the test server accepts on the management API.
pub const API_TOKEN: &str = "feedbridge-test-api-token";

/// Shared secret for signing test webhook payloads.
pub const WEBHOOK_SECRET: &str = "feedbridge-test-webhook-secret-32-bytes";

/// Scriptable stand-in for the source platform's activity API.
///
/// Serves `GET /api/activity/:handle` and
/// `GET /api/activity/:handle/last_read` from in-memory maps.
#[derive(Clone, Default)]
pub struct StubSource {
    activity: Arc<Mutex<HashMap<String, Vec<Value>>>>,
    last_read: Arc<Mutex<HashMap<String, String>>>,
}

impl StubSource {
    /// Add one raw activity record for a handle.
    pub async fn add_activity(&self, handle: &str, record: Value) {
        self.activity
            .lock()
            .await
            .entry(handle.to_string())
            .or_default()
            .push(record);
    }

    pub async fn set_last_read(&self, handle: &str, timestamp: &str) {
        self.last_read
            .lock()
            .await
            .insert(handle.to_string(), timestamp.to_string());
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/api/activity/:handle", get(stub_activity))
            .route("/api/activity/:handle/last_read", get(stub_last_read))
            .with_state(self.clone())
    }
}

async fn stub_activity(
    State(stub): State<StubSource>,
    Path(handle): Path<String>,
) -> Json<Vec<Value>> {
    let activity = stub.activity.lock().await;
    Json(activity.get(&handle).cloned().unwrap_or_default())
}

async fn stub_last_read(State(stub): State<StubSource>, Path(handle): Path<String>) -> Response {
    match stub.last_read.lock().await.get(&handle) {
        Some(timestamp) => Json(json!({ "last_read": timestamp })).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Scriptable stand-in for a sink push callback endpoint.
///
/// Captures every batch request and answers with a per-token receipt
/// built from the scripted invalid/rate-limited sets.
#[derive(Clone, Default)]
pub struct StubSink {
    requests: Arc<Mutex<Vec<Value>>>,
    invalid_tokens: Arc<Mutex<HashSet<String>>>,
    rate_limited_tokens: Arc<Mutex<HashSet<String>>>,
    unreachable: Arc<AtomicBool>,
}

impl StubSink {
    /// Report this token as permanently invalid in every receipt.
    pub async fn mark_invalid(&self, token: &str) {
        self.invalid_tokens.lock().await.insert(token.to_string());
    }

    /// Report this token as rate limited in every receipt.
    pub async fn mark_rate_limited(&self, token: &str) {
        self.rate_limited_tokens
            .lock()
            .await
            .insert(token.to_string());
    }

    /// Answer every batch with 503 until turned off again.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// All captured batch request bodies, in arrival order.
    pub async fn requests(&self) -> Vec<Value> {
        self.requests.lock().await.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/push", post(stub_push))
            .with_state(self.clone())
    }
}

async fn stub_push(State(stub): State<StubSink>, Json(body): Json<Value>) -> Response {
    if stub.unreachable.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    stub.requests.lock().await.push(body.clone());

    let tokens: Vec<String> = body["tokens"]
        .as_array()
        .map(|tokens| {
            tokens
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let invalid = stub.invalid_tokens.lock().await;
    let rate_limited = stub.rate_limited_tokens.lock().await;

    let mut successful = Vec::new();
    let mut rejected = Vec::new();
    let mut limited = Vec::new();
    for token in tokens {
        if invalid.contains(&token) {
            rejected.push(token);
        } else if rate_limited.contains(&token) {
            limited.push(token);
        } else {
            successful.push(token);
        }
    }

    Json(json!({
        "successfulTokens": successful,
        "invalidTokens": rejected,
        "rateLimitedTokens": limited,
    }))
    .into_response()
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
    pub source: StubSource,
    pub sink: StubSink,
    /// Full URL of the stub sink's push route, usable as a link's
    /// callback endpoint.
    pub sink_endpoint: String,
}

impl TestServer {
    /// Create a new test server instance with both stubs running.
    pub async fn new() -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Start the stub source and sink first so their addresses can
        // go into the relay configuration.
        let source = StubSource::default();
        let source_addr = spawn_stub(source.router()).await;

        let sink = StubSink::default();
        let sink_addr = spawn_stub(sink.router()).await;
        let sink_endpoint = format!("http://{}/push", sink_addr);

        // Create test configuration
        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
                api_token: API_TOKEN.to_string(),
            },
            database: config::DatabaseConfig {
                path: db_path.clone(),
            },
            source: config::SourceConfig {
                base_url: format!("http://{}", source_addr),
                web_base_url: "https://social.example.com".to_string(),
                timeout_seconds: 5,
            },
            sink: config::SinkConfig {
                webhook_secret: WEBHOOK_SECRET.to_string(),
                timeout_seconds: 5,
                allow_private_endpoints: true,
            },
            relay: config::RelayConfig {
                cycle_interval_seconds: 300,
                lookback_hours: 24,
                cold_start_max_events: 50,
                // Zero backoff so retry behavior is observable without
                // clock control.
                failure_backoff_seconds: 0,
                max_attempts: 3,
                pending_timeout_seconds: 600,
                retention_days: 30,
                max_concurrent_accounts: 4,
                lease_seconds: 60,
                purge_interval_seconds: 86400,
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        // Build router (same composition as the binary)
        let app = feedbridge::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait a bit for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr: addr_str,
            state,
            _temp_dir: temp_dir,
            client,
            source,
            sink,
            sink_endpoint,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Authorization header value for the management API.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", API_TOKEN)
    }

    /// Link a handle to the stub sink through the management API.
    pub async fn link_account(&self, handle: &str, sink_id: i64, delivery_token: &str) {
        let response = self
            .client
            .post(self.url("/api/v1/links"))
            .header("Authorization", self.bearer())
            .json(&json!({
                "source_handle": handle,
                "sink_id": sink_id,
                "delivery_token": delivery_token,
                "callback_endpoint": self.sink_endpoint,
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "link_account failed");
    }

    /// Signature header value for a webhook payload.
    pub fn sign(&self, payload: &[u8]) -> String {
        format_signature_header(&compute_signature(payload, WEBHOOK_SECRET.as_bytes()))
    }
}

/// Bind a stub router on an ephemeral port and serve it in the
/// background. Returns the bound address.
async fn spawn_stub(router: Router) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}
