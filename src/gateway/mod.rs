//! Axum-based HTTP gateway for the review pipeline.
//!
//! Two review surfaces share one pipeline:
//! - `POST /api/review` — run to completion, return the report as JSON
//! - `POST /api/review/stream` — SSE frames (`agent`, `merging`,
//!   `result`, `error`, `timeout`) while the pipeline runs; exactly
//!   one terminal frame per request
//!
//! Plus `GET /` (service info), `GET /health`, and the history
//! endpoints for authenticated callers. Body size limits and the
//! request timeout ride on tower-http; the streaming route is exempt
//! from the timeout layer because the pipeline's own global timeout
//! bounds it.

use crate::capability::create_capability;
use crate::config::Config;
use crate::identity::{create_identity, Caller, IdentityProvider};
use crate::review::orchestrator::PipelineEvent;
use crate::review::types::{CodeSubmission, ReviewError, ReviewReport};
use crate::review::{CapabilityPool, ReviewService};
use crate::storage::{create_store, ReviewStore};
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size — the configured code bound plus JSON
/// escaping headroom.
pub const MAX_BODY_SIZE: usize = 131_072;
/// Request timeout for non-streaming routes. Must exceed the worst
/// case pipeline runtime (queueing + analysis + fix).
pub const REQUEST_TIMEOUT_SECS: u64 = 240;

const SERVICE_NAME: &str = "fluxrev";

fn is_public_bind(host: &str) -> bool {
    !matches!(host, "127.0.0.1" | "localhost" | "::1")
}

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ReviewService>,
    pub identity: Arc<dyn IdentityProvider>,
    pub store: Arc<dyn ReviewStore>,
}

/// Run the HTTP gateway.
pub async fn run_gateway(config: Config) -> Result<()> {
    let host = config.gateway.host.clone();
    let port = config.gateway.port;

    // Refuse a public bind unless explicitly opted into.
    if is_public_bind(&host) && !config.gateway.allow_public_bind {
        anyhow::bail!(
            "refusing to bind to {host} — the gateway would be exposed publicly.\n\
             Fix: use host 127.0.0.1 (default) or set [gateway] allow_public_bind = true."
        );
    }

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let display_addr = listener.local_addr()?;

    let capability = create_capability(&config.capability)?;
    let pool = Arc::new(CapabilityPool::new(
        config.pool.capacity,
        Duration::from_secs(config.pool.queue_timeout_secs),
    ));
    let service = Arc::new(ReviewService::new(capability, pool, &config));
    let identity = create_identity(&config.auth);
    let store = create_store(&config.storage)?;

    tracing::info!(
        capability = ?config.capability.provider,
        identity = identity.name(),
        store = store.name(),
        pool = config.pool.capacity,
        "gateway collaborators initialized"
    );

    let state = AppState {
        service,
        identity,
        store,
    };

    println!("🦀 fluxrev gateway listening on http://{display_addr}");
    println!("  POST /api/review         — run the pipeline, JSON report back");
    println!("  POST /api/review/stream  — same input, SSE progress + result");
    println!("  GET  /api/reviews        — review history (token required)");
    println!("  GET  /health             — health check");
    println!("  Press Ctrl+C to stop.\n");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(Any);

    // The SSE route stays outside the timeout layer; the pipeline's
    // global timeout bounds it instead.
    let timed = Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/api/review", post(handle_review))
        .route("/api/reviews", get(handle_reviews_list))
        .route("/api/reviews/{id}", get(handle_review_get))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ));

    Router::new()
        .merge(timed)
        .route("/api/review/stream", post(handle_review_stream))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
}

// ══════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════

/// GET / — service roster, mirrors what the dashboard shows.
async fn handle_root() -> impl IntoResponse {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "operational",
        "agents": [
            "SecurityAgent",
            "PerformanceAgent",
            "StyleAgent",
            "BugDetectorAgent",
            "AutoFixAgent",
        ],
    }))
}

/// GET /health — always public.
async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "healthy", "version": env!("CARGO_PKG_VERSION") }))
}

#[derive(Debug, Deserialize)]
struct ReviewBody {
    #[serde(default = "default_filename")]
    filename: String,
    #[serde(default = "default_language")]
    language: String,
    code: String,
}

fn default_filename() -> String {
    "untitled".into()
}

fn default_language() -> String {
    "python".into()
}

#[derive(Debug, serde::Serialize)]
struct ReviewResponse {
    id: Option<i64>,
    #[serde(flatten)]
    report: ReviewReport,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn error_body(status: &str, message: String) -> Json<Value> {
    Json(json!({ "status": status, "error": message }))
}

fn review_error_response(err: &ReviewError) -> (StatusCode, Json<Value>) {
    let code = match err {
        ReviewError::RejectedInput(_) => StatusCode::BAD_REQUEST,
        ReviewError::Busy => StatusCode::SERVICE_UNAVAILABLE,
        ReviewError::GlobalTimeout => StatusCode::GATEWAY_TIMEOUT,
        ReviewError::AllAgentsFailed => StatusCode::BAD_GATEWAY,
        ReviewError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, error_body(err.status_id(), err.to_string()))
}

/// Admission checks shared by both review surfaces: caller resolution,
/// quota, and input validation before anything is dispatched.
fn admit_request(
    state: &AppState,
    headers: &HeaderMap,
    body: ReviewBody,
) -> Result<(Option<Caller>, CodeSubmission), (StatusCode, Json<Value>)> {
    let caller = state.identity.resolve(bearer_token(headers));
    if let Some(caller) = &caller {
        if caller.over_quota() {
            return Err((
                StatusCode::TOO_MANY_REQUESTS,
                error_body(
                    "quota_exhausted",
                    format!(
                        "review limit reached ({})",
                        caller.reviews_limit.unwrap_or_default()
                    ),
                ),
            ));
        }
    }

    let submission = CodeSubmission::new(body.filename, body.language, body.code);
    if let Err(err) = submission.validate(state.service.review_config()) {
        let err = ReviewError::from(err);
        return Err(review_error_response(&err));
    }

    Ok((caller, submission))
}

/// POST /api/review — synchronous review.
///
/// Anonymous callers get the report back; authenticated callers also
/// get it saved to history and counted against their quota.
async fn handle_review(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ReviewBody>,
) -> impl IntoResponse {
    let (caller, submission) = match admit_request(&state, &headers, body) {
        Ok(admitted) => admitted,
        Err(rejection) => return rejection.into_response(),
    };

    match state.service.review(submission.clone()).await {
        Ok(report) => {
            let id = persist(&state, caller.as_ref(), &submission, &report);
            (StatusCode::OK, Json(ReviewResponse { id, report })).into_response()
        }
        Err(err) => review_error_response(&err).into_response(),
    }
}

/// POST /api/review/stream — SSE streaming review.
async fn handle_review_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ReviewBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<Value>)> {
    let (caller, submission) = admit_request(&state, &headers, body)?;

    let cancel = CancellationToken::new();
    let rx = state.service.clone().stream(submission.clone(), cancel);

    let stream = ReceiverStream::new(rx).map(move |event| {
        let frame = match &event {
            PipelineEvent::Agent(progress) => sse_frame("agent", &json!(progress)),
            PipelineEvent::Merging => sse_frame("merging", &json!({ "phase": "merging" })),
            PipelineEvent::Result(report) => {
                let id = persist(&state, caller.as_ref(), &submission, report);
                let payload = serde_json::to_value(ReviewResponse {
                    id,
                    report: (**report).clone(),
                })
                .unwrap_or_else(|_| json!({}));
                sse_frame("result", &payload)
            }
            PipelineEvent::Error { status, message } => {
                sse_frame("error", &json!({ "status": status, "message": message }))
            }
            PipelineEvent::Timeout => sse_frame("timeout", &json!({})),
        };
        Ok(frame)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_frame(name: &str, payload: &Value) -> Event {
    let data = serde_json::to_string(payload).unwrap_or_else(|_| "{}".into());
    Event::default().event(name).data(data)
}

/// Save the finished report for an authenticated caller and count it
/// against their quota. Anonymous reviews are not persisted.
fn persist(
    state: &AppState,
    caller: Option<&Caller>,
    submission: &CodeSubmission,
    report: &ReviewReport,
) -> Option<i64> {
    let caller = caller?;
    state.identity.record_review(&caller.id);
    match state.store.save(&caller.id, submission, report) {
        Ok(id) => id,
        Err(err) => {
            tracing::warn!(caller = %caller.id, error = %err, "failed to save review history");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    20
}

/// GET /api/reviews — history for the authenticated caller.
async fn handle_reviews_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let Some(caller) = state.identity.resolve(bearer_token(&headers)) else {
        return (
            StatusCode::UNAUTHORIZED,
            error_body("unauthorized", "history requires a valid API token".into()),
        )
            .into_response();
    };

    match state.store.list(&caller.id, query.limit.min(100)) {
        Ok(rows) => Json(json!({ "reviews": rows, "total": rows.len() })).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "history listing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("storage_error", "failed to read history".into()),
            )
                .into_response()
        }
    }
}

/// GET /api/reviews/{id} — one saved review, scoped to its owner.
async fn handle_review_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let Some(caller) = state.identity.resolve(bearer_token(&headers)) else {
        return (
            StatusCode::UNAUTHORIZED,
            error_body("unauthorized", "history requires a valid API token".into()),
        )
            .into_response();
    };

    match state.store.get(&caller.id, id) {
        Ok(Some(review)) => Json(review).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            error_body("not_found", format!("review {id} not found")),
        )
            .into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "history lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("storage_error", "failed to read history".into()),
            )
                .into_response()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, CapabilityError, CapabilityRequest};
    use crate::config::{AuthConfig, TokenEntry};
    use crate::identity::TokenIdentity;
    use crate::storage::SqliteReviewStore;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use http_body_util::BodyExt;
    use serde_json::json;

    /// Capability that answers every domain with a clean payload,
    /// except style, which reports one spacing nit.
    struct StubCapability;

    #[async_trait]
    impl Capability for StubCapability {
        fn name(&self) -> &str {
            "stub"
        }

        async fn invoke(&self, req: &CapabilityRequest) -> Result<Value, CapabilityError> {
            if req.system.contains("security engineer") {
                Ok(json!({ "vulnerabilities": [], "security_score": 100, "summary": "clean" }))
            } else if req.system.contains("performance engineer") {
                Ok(json!({ "issues": [], "performance_score": 100, "summary": "clean" }))
            } else if req.system.contains("code quality engineer") {
                Ok(json!({
                    "issues": [{
                        "line": 1,
                        "severity": "low",
                        "description": "missing space after comma",
                        "suggestion": "write def add(a, b)"
                    }],
                    "style_score": 90,
                    "summary": "minor spacing"
                }))
            } else if req.system.contains("QA engineer") {
                Ok(json!({ "bugs": [], "reliability_score": 100, "summary": "clean" }))
            } else {
                Ok(json!({
                    "fixed_code": "def add(a, b):\n    return a + b\n",
                    "changes_made": [{ "line": 1, "type": "fix", "description": "spacing" }],
                    "improvement_summary": "reformatted"
                }))
            }
        }
    }

    fn test_state(store: Arc<dyn ReviewStore>, identity: Arc<dyn IdentityProvider>) -> AppState {
        let mut config = Config::default();
        config.review.agent_timeout_secs = 5;
        config.review.global_timeout_secs = 30;
        config.pool.queue_timeout_secs = 1;

        let pool = Arc::new(CapabilityPool::new(16, Duration::from_secs(1)));
        let service = Arc::new(ReviewService::new(Arc::new(StubCapability), pool, &config));
        AppState {
            service,
            identity,
            store,
        }
    }

    fn anonymous_state() -> AppState {
        test_state(
            Arc::new(crate::storage::NoopStore),
            crate::identity::create_identity(&AuthConfig::default()),
        )
    }

    fn token_state(limit: u64) -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteReviewStore::open(&dir.path().join("reviews.db")).unwrap();
        let identity = TokenIdentity::from_config(&AuthConfig {
            tokens: vec![TokenEntry {
                token: "frv-test".into(),
                user: "ada".into(),
                reviews_limit: limit,
            }],
        });
        (test_state(Arc::new(store), Arc::new(identity)), dir)
    }

    fn auth_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer frv-test"),
        );
        headers
    }

    fn body(code: &str) -> ReviewBody {
        ReviewBody {
            filename: "demo.py".into(),
            language: "python".into(),
            code: code.into(),
        }
    }

    async fn response_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn response_text(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let response = handle_health().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let parsed = response_json(response).await;
        assert_eq!(parsed["status"], "healthy");
    }

    #[tokio::test]
    async fn root_lists_the_agent_roster() {
        let response = handle_root().await.into_response();
        let parsed = response_json(response).await;
        assert_eq!(parsed["agents"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn review_returns_full_report() {
        let state = anonymous_state();
        let response = handle_review(
            State(state),
            HeaderMap::new(),
            Json(body("def add(a,b): return a+b")),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let parsed = response_json(response).await;
        assert!(parsed["score"].as_u64().unwrap() >= 85);
        assert_eq!(parsed["id"], Value::Null);
        assert!(parsed["fixed_code"].as_str().unwrap().contains("def add(a, b):"));
        assert_eq!(parsed["findings"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_code_is_rejected() {
        let state = anonymous_state();
        let response = handle_review(State(state), HeaderMap::new(), Json(body("   ")))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let parsed = response_json(response).await;
        assert_eq!(parsed["status"], "invalid_input");
    }

    #[tokio::test]
    async fn unsupported_language_is_rejected() {
        let state = anonymous_state();
        let mut request = body("MOVE A TO B.");
        request.language = "cobol".into();
        let response = handle_review(State(state), HeaderMap::new(), Json(request))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn authenticated_review_is_saved_and_metered() {
        let (state, _dir) = token_state(2);

        let response = handle_review(
            State(state.clone()),
            auth_headers(),
            Json(body("def add(a,b): return a+b")),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let parsed = response_json(response).await;
        let id = parsed["id"].as_i64().expect("saved review id");

        let listing = handle_reviews_list(
            State(state.clone()),
            auth_headers(),
            Query(HistoryQuery { limit: 10 }),
        )
        .await
        .into_response();
        let listing = response_json(listing).await;
        assert_eq!(listing["total"], 1);

        let fetched = handle_review_get(State(state), auth_headers(), Path(id))
            .await
            .into_response();
        assert_eq!(fetched.status(), StatusCode::OK);
        let fetched = response_json(fetched).await;
        assert_eq!(fetched["report"]["grade"], parsed["grade"]);
    }

    #[tokio::test]
    async fn quota_exhaustion_returns_429() {
        let (state, _dir) = token_state(1);

        let first = handle_review(
            State(state.clone()),
            auth_headers(),
            Json(body("print('hi')")),
        )
        .await
        .into_response();
        assert_eq!(first.status(), StatusCode::OK);

        let second = handle_review(State(state), auth_headers(), Json(body("print('hi')")))
            .await
            .into_response();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let parsed = response_json(second).await;
        assert_eq!(parsed["status"], "quota_exhausted");
    }

    #[tokio::test]
    async fn history_requires_a_token() {
        let state = anonymous_state();
        let response = handle_reviews_list(
            State(state),
            HeaderMap::new(),
            Query(HistoryQuery { limit: 10 }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn stream_emits_agent_frames_then_result_last() {
        let state = anonymous_state();
        let response = handle_review_stream(
            State(state),
            HeaderMap::new(),
            Json(body("def add(a,b): return a+b")),
        )
        .await
        .unwrap()
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let text = response_text(response).await;

        assert!(text.contains("event: agent"));
        assert!(text.contains("event: merging"));
        assert!(text.contains("event: result"));
        assert!(!text.contains("event: error"));
        assert!(!text.contains("event: timeout"));

        // The result frame is terminal: nothing follows it.
        let result_pos = text.find("event: result").unwrap();
        assert!(!text[result_pos + 1..].contains("event: agent"));
        assert_eq!(text.matches("event: result").count(), 1);

        // Terminal agent frames: four analysis agents plus autofix.
        let statuses: Vec<&str> = text
            .lines()
            .filter(|l| l.starts_with("data: ") && l.contains("\"status\""))
            .collect();
        assert!(!statuses.is_empty());
    }

    #[tokio::test]
    async fn stream_rejects_invalid_input_before_opening() {
        let state = anonymous_state();
        let result = handle_review_stream(State(state), HeaderMap::new(), Json(body(""))).await;
        let (status, _) = result.err().expect("must reject before streaming");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn public_bind_detection() {
        assert!(is_public_bind("0.0.0.0"));
        assert!(is_public_bind("192.168.1.10"));
        assert!(!is_public_bind("127.0.0.1"));
        assert!(!is_public_bind("localhost"));
    }
}
