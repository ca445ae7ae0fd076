//! Control-plane HTTP surface and the request middleware pipeline.
//!
//! Pipeline order, outer to inner: safe-mode gate, security gate
//! (rate limit + persistent blocks), latency and error accounting, handler.

use crate::state::AppState;
use aegis_proto::{AlertSeverity, SecurityEvent, SecurityEventKind};
use aegis_security::RateDecision;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, Request, State},
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// Paths exempt from the safe-mode write gate.
const SAFE_MODE_CONTROL_PREFIX: &str = "/system-mode";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/system-health", get(system_health))
        .route("/incidents", get(incidents))
        .route("/invariants/status", get(invariants_status))
        .route("/cron/status", get(cron_status))
        .route("/metrics", get(metrics_prometheus))
        .route("/metrics/json", get(metrics_json))
        .route(
            "/system-mode/safe",
            post(enable_safe_mode).delete(disable_safe_mode),
        )
        .route("/reports/executive", post(trigger_executive_report))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            latency_accounting,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), security_gate))
        .layer(middleware::from_fn_with_state(state.clone(), safe_mode_gate))
        .with_state(state)
}

// ─── Middleware ──────────────────────────────────────────────────────────────

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

async fn safe_mode_gate(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if is_mutating(request.method())
        && !request.uri().path().starts_with(SAFE_MODE_CONTROL_PREFIX)
    {
        let safe_mode = state.store.safe_mode();
        if safe_mode.safe_mode {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": "SERVICE_IN_SAFE_MODE",
                    "readOnly": true,
                    "reason": safe_mode.reason,
                })),
            )
                .into_response();
        }
    }
    next.run(request).await
}

fn client_ip(request: &Request) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

async fn security_gate(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&request);

    if let RateDecision::Blocked { until, fresh } = state.limiter.check(&format!("ip:{ip}")) {
        if fresh {
            state.store.append_security_event(SecurityEvent {
                id: Uuid::new_v4().to_string(),
                kind: SecurityEventKind::RateLimitExceeded,
                ip: Some(ip.clone()),
                user_id: None,
                details: serde_json::json!({"blocked_until": until}),
                severity: AlertSeverity::Medium,
                auto_blocked: true,
                created_at: Utc::now(),
            });
        }
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"error": "RATE_LIMITED", "retryAfter": until})),
        )
            .into_response();
    }

    if state.store.is_blocked(&ip) {
        return blocked_response("ip");
    }
    let user_id = request
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(user_id) = &user_id {
        if state.store.is_blocked(user_id) {
            return blocked_response("user");
        }
    }

    next.run(request).await
}

fn blocked_response(target: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(serde_json::json!({"error": "BLOCKED", "target": target})),
    )
        .into_response()
}

async fn latency_accounting(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let route = format!("{} {}", request.method(), path);
    let start = Instant::now();
    let response = next.run(request).await;

    // The metrics endpoints stay out of their own numbers.
    if path.starts_with("/metrics") {
        return response;
    }

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    state.tracker.record(&route, elapsed_ms);
    state.metrics.record("http.request_duration_ms", elapsed_ms);
    let total = state.metrics.increment("http.requests_total");
    let errors = if response.status().is_server_error() {
        state.metrics.increment("http.errors_total")
    } else {
        state.metrics.counter("http.errors_total")
    };
    state
        .metrics
        .set_gauge("http.error_rate", errors as f64 / total as f64);
    response
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let safe_mode = state.store.safe_mode().safe_mode;
    let degraded = state
        .store
        .latest_health_sample()
        .is_some_and(|s| s.grade == aegis_proto::HealthGrade::F);
    let body = serde_json::json!({
        "status": if degraded { "degraded" } else { "ok" },
        "safeMode": safe_mode,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    });
    let code = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(body)).into_response()
}

async fn system_health(State(state): State<Arc<AppState>>) -> Response {
    let sample = match state.store.latest_health_sample() {
        Some(sample) => sample,
        None => state.health.compute().await,
    };
    Json(serde_json::json!({
        "score": sample.score,
        "grade": sample.grade.to_string(),
        "components": sample.components,
        "safeMode": sample.safe_mode,
        "recordedAt": sample.recorded_at,
        "driftScore": state.store.latest_drift_sample().map(|d| d.score),
        "incidents": state.incidents.summary(),
    }))
    .into_response()
}

async fn incidents(State(state): State<Arc<AppState>>) -> Response {
    let mut open = state.store.open_incidents();
    open.truncate(50);
    Json(serde_json::json!({
        "summary": state.incidents.summary(),
        "open": open,
    }))
    .into_response()
}

async fn invariants_status(State(state): State<Arc<AppState>>) -> Response {
    let last24h = state
        .store
        .violations_since(Utc::now() - chrono::Duration::hours(24));
    Json(serde_json::json!({
        "driftScore": state.store.latest_drift_sample().map(|d| d.score),
        "last24h": last24h,
    }))
    .into_response()
}

async fn cron_status(State(state): State<Arc<AppState>>) -> Response {
    Json(state.scheduler.status()).into_response()
}

async fn metrics_prometheus(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
        .into_response()
}

async fn metrics_json(State(state): State<Arc<AppState>>) -> Response {
    Json(state.metrics.snapshot_json()).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnableSafeModeBody {
    reason: Option<String>,
    enabled_by: Option<String>,
}

/// Tolerates an empty body: both safe-mode endpoints are callable from
/// incident tooling that sends no payload.
fn parse_body<T: serde::de::DeserializeOwned + Default>(bytes: &Bytes) -> T {
    if bytes.is_empty() {
        return T::default();
    }
    serde_json::from_slice(bytes).unwrap_or_default()
}

async fn enable_safe_mode(State(state): State<Arc<AppState>>, bytes: Bytes) -> Response {
    let body: EnableSafeModeBody = parse_body(&bytes);
    let status = state.store.enable_safe_mode(
        body.reason.as_deref().unwrap_or("manual"),
        body.enabled_by.as_deref().unwrap_or("admin"),
    );
    warn!(reason = ?status.reason, by = ?status.enabled_by, "safe mode enabled via API");
    Json(serde_json::json!({"safeMode": true, "reason": status.reason})).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisableSafeModeBody {
    override_token: Option<String>,
}

async fn disable_safe_mode(State(state): State<Arc<AppState>>, bytes: Bytes) -> Response {
    let body: DisableSafeModeBody = parse_body(&bytes);
    let success = state
        .store
        .disable_safe_mode(body.override_token.as_deref(), "admin");
    if !success {
        warn!("safe mode disable refused: override token mismatch");
    }
    Json(serde_json::json!({"success": success})).into_response()
}

async fn trigger_executive_report(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
) -> Response {
    let Some(key) = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        let summary = state.reporter.run().await;
        return Json(summary).into_response();
    };

    let reporter = state.reporter.clone();
    let outcome = state
        .idempotency
        .execute(&key, || async move {
            let summary = reporter.run().await;
            Ok::<_, std::convert::Infallible>(aegis_idempotency::HandlerResponse {
                status_code: 200,
                body: serde_json::to_value(&summary).unwrap_or_default(),
            })
        })
        .await;
    match outcome {
        Ok(result) => (
            StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::OK),
            Json(result.body),
        )
            .into_response(),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}
