// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! The Ingress API: `POST /execute`, status/code-view reads, secret admin
//! routes, and the health check. Wires requests into the Approval
//! Coordinator and persists them via the Request Store.

pub mod middleware;
pub mod validation;

use axum::{
    Json, Router,
    extract::{Path as AxPath, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use broker_approval::Coordinator;
use broker_core::{fingerprint, metadata, Request, RequestState};
use broker_store::RequestStore;
use broker_vault::SecretVault;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{error, info};

/// Shared daemon state, cloned into every handler via [`axum::extract::State`].
#[derive(Clone)]
pub struct AppState {
    /// Durable request/trust/secret/code persistence.
    pub store: RequestStore,
    /// The approval state machine driver.
    pub coordinator: Coordinator,
    /// Secret name/value store, consulted for status-view redaction.
    pub vault: SecretVault,
}

/// `POST /execute` request body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Logical skill name.
    pub skill_id: String,
    /// Where to fetch the skill's code bytes from: `http(s)://` or `data:`.
    pub skill_url: String,
    /// Declared secret names.
    #[serde(default)]
    pub secrets: Vec<String>,
    /// Invocation arguments, passed through to the sandbox as environment.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

/// `POST /execute` response body.
#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    request_id: uuid::Uuid,
    status: String,
}

/// `POST /secrets` request body.
#[derive(Debug, Deserialize)]
pub struct PutSecretRequest {
    name: String,
    value: String,
}

/// A view of a request safe for external consumption: never includes
/// secret values, even when a secret name also appears in `args`.
#[derive(Debug, Serialize)]
pub struct RequestView {
    request_id: uuid::Uuid,
    skill_id: String,
    state: RequestState,
    fingerprint: String,
    created_at: chrono::DateTime<Utc>,
    approved_at: Option<chrono::DateTime<Utc>>,
    executed_at: Option<chrono::DateTime<Utc>>,
    result: Option<broker_core::ExecutionResult>,
    failure_reason: Option<String>,
}

impl From<Request> for RequestView {
    fn from(r: Request) -> Self {
        Self {
            request_id: r.id,
            skill_id: r.skill_id,
            state: r.state,
            fingerprint: r.fingerprint,
            created_at: r.created_at,
            approved_at: r.approved_at,
            executed_at: r.executed_at,
            result: r.result,
            failure_reason: r.failure_reason,
        }
    }
}

/// Uniform JSON error envelope for every handler.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Build the Axum router with all Ingress API routes.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(cmd_health))
        .route("/execute", post(cmd_execute))
        .route("/execute/{id}/status", get(cmd_status))
        .route("/view/{id}", get(cmd_view))
        .route("/secrets", post(cmd_put_secret).get(cmd_list_secrets))
        .with_state(state)
}

async fn cmd_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "contract_version": broker_core::CONTRACT_VERSION,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn cmd_execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    if let Err(errors) = validation::validate_execute_request(&req) {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, errors.join("; ")));
    }

    let code = fetch_code(&req.skill_url)
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("fetch-failed: {e}")))?;

    let meta = metadata::parse(&code)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("bad-metadata: {e}")))?;

    let fp = fingerprint(&code);
    let request = Request::new(
        req.skill_id,
        req.skill_url,
        fp,
        req.secrets,
        req.args,
        meta,
        Utc::now(),
    );
    let request_id = request.id;

    state
        .store
        .create(request.clone())
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    state
        .store
        .store_code(request_id, &code)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if let Err(e) = state.coordinator.submit(&request).await {
        error!(request_id = %request_id, error = %e, "failed to submit request to coordinator");
        return Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
    }

    info!(request_id = %request_id, skill_id = %request.skill_id, "request ingested");

    Ok(Json(ExecuteResponse {
        request_id,
        status: "pending".to_string(),
    }))
}

async fn cmd_status(
    AxPath(id): AxPath<uuid::Uuid>,
    State(state): State<AppState>,
) -> Result<Json<RequestView>, ApiError> {
    state
        .store
        .get(id)
        .await
        .map(|r| Json(RequestView::from(r)))
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "request not found"))
}

async fn cmd_view(
    AxPath(id): AxPath<uuid::Uuid>,
    State(state): State<AppState>,
) -> Result<Html<String>, ApiError> {
    let request = state
        .store
        .get(id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "request not found"))?;
    let code = state
        .store
        .load_code(id)
        .await
        .map_err(|e| ApiError::new(StatusCode::NOT_FOUND, e.to_string()))?;

    let body = format!(
        "<h1>{}</h1><p>fingerprint: {}</p><pre>{}</pre>",
        html_escape(&request.skill_id),
        html_escape(&request.fingerprint),
        html_escape(&String::from_utf8_lossy(&code)),
    );
    Ok(Html(body))
}

async fn cmd_put_secret(
    State(state): State<AppState>,
    Json(req): Json<PutSecretRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "secret name must not be empty"));
    }
    state
        .vault
        .put(&req.name, req.value.into_bytes())
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "ok": true })))
}

async fn cmd_list_secrets(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "names": state.vault.list_names().await }))
}

/// Fetch skill code from an `http(s)://` or `data:` URL. The `data:` scheme
/// is a zero-round-trip fetch: the URI already carries the bytes, so this
/// is the same byte-fetch-and-pin contract with no network hop.
async fn fetch_code(url: &str) -> anyhow::Result<Vec<u8>> {
    if let Some(data) = url.strip_prefix("data:") {
        return decode_data_uri(data);
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        let resp = reqwest::get(url).await?.error_for_status()?;
        return Ok(resp.bytes().await?.to_vec());
    }
    anyhow::bail!("unsupported skill_url scheme: {url}")
}

fn decode_data_uri(data: &str) -> anyhow::Result<Vec<u8>> {
    let (meta, payload) = data
        .split_once(',')
        .ok_or_else(|| anyhow::anyhow!("malformed data: URI"))?;
    if meta.ends_with(";base64") {
        use base64::Engine;
        Ok(base64::engine::general_purpose::STANDARD.decode(payload)?)
    } else {
        Ok(urlencoding::decode(payload)?.into_owned().into_bytes())
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// The periodic (hourly) background janitor: sweeps expired trust records.
/// Retention of completed requests beyond a configured horizon is a
/// deployment knob, not part of the correctness contract, and is left to
/// an operator-run offline job rather than this in-process task.
pub async fn run_janitor(store: RequestStore, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let swept = store.sweep_expired_trust(Utc::now()).await;
        if swept > 0 {
            info!(swept, "janitor swept expired trust records");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_chat::mock::MockTransport;
    use broker_config::SandboxMode;
    use broker_notify::NotificationEmitter;
    use broker_sandbox::SandboxExecutor;
    use broker_trust::TrustCache;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_app() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RequestStore::open(dir.path().join("store")).await.unwrap();
        let trust = TrustCache::new(store.clone());
        let vault = SecretVault::hydrate(store.clone()).await.unwrap();
        let sandbox = SandboxExecutor::new(SandboxMode::Direct, dir.path().join("scratch"));
        let chat = Arc::new(MockTransport::new());
        let notify = NotificationEmitter::new(None, dir.path().join("notifications.log"));
        let coordinator = Coordinator::new(
            store.clone(),
            trust,
            vault.clone(),
            sandbox,
            chat,
            notify,
        );
        let state = AppState {
            store,
            coordinator,
            vault,
        };
        (build_app(state), dir)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _dir) = test_app().await;
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn execute_with_data_uri_returns_pending() {
        let (app, _dir) = test_app().await;
        let code = "// @skill hello\necho hi\n";
        let body = json!({
            "skill_id": "hello",
            "skill_url": format!("data:text/plain,{}", urlencoding::encode(code)),
            "secrets": [],
            "args": {},
        });
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/execute")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["status"], "pending");
    }

    #[tokio::test]
    async fn execute_without_metadata_header_is_bad_request() {
        let (app, _dir) = test_app().await;
        let body = json!({
            "skill_id": "hello",
            "skill_url": format!("data:text/plain,{}", urlencoding::encode("no header here")),
            "secrets": [],
            "args": {},
        });
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/execute")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_of_unknown_id_is_404() {
        let (app, _dir) = test_app().await;
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/execute/{}/status", uuid::Uuid::new_v4()))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn put_then_list_secret_names_never_exposes_value() {
        let (app, _dir) = test_app().await;
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/secrets")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        json!({"name": "K", "value": "sentinel-value"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/secrets")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(!text.contains("sentinel-value"));
        assert!(text.contains('K'));
    }
}
