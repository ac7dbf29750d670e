//! Admin endpoint bodies. Kept as plain async functions taking
//! `State<AppState>` plus whatever extractors each route needs.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use logagent_core::dispatcher::ReprocessFilter;
use logagent_core::record::{Cursor, Record, SourceType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::build::build_pipeline;
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let sink_health = state.dispatcher.sink_health();
    let queue_depth = state.dispatcher.queue_depth();
    let queue_capacity = state.dispatcher.queue_capacity();
    let queue_critical = queue_capacity > 0 && queue_depth as f64 / queue_capacity as f64 >= 0.95;

    let mut checks = serde_json::Map::new();
    let mut healthy = true;
    for (name, ok) in &sink_health {
        checks.insert(name.clone(), json!({ "healthy": ok }));
        healthy &= ok;
    }
    checks.insert("queue".to_string(), json!({ "healthy": !queue_critical, "depth": queue_depth, "capacity": queue_capacity }));
    healthy &= !queue_critical;

    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "uptime_seconds": state.uptime_seconds(),
        "checks": Value::Object(checks),
    });

    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body))
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let sink_health = state.dispatcher.sink_health();
    let queue_depth = state.dispatcher.queue_depth();
    let queue_capacity = state.dispatcher.queue_capacity();

    Json(json!({
        "uptime_seconds": state.uptime_seconds(),
        "queue": { "depth": queue_depth, "capacity": queue_capacity, "utilization": state.metrics.queue_utilization() },
        "sinks": sink_health.into_iter().map(|(name, ok)| json!({ "name": name, "healthy": ok })).collect::<Vec<_>>(),
        "dlq_size": state.dispatcher.dlq().len(),
        "buffer_size": state.dispatcher.buffer().len(),
    }))
}

/// Redacts bearer tokens and message-bus URLs before returning the active
/// config.
pub async fn get_config(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let config = state.config.load_full();
    let mut value = serde_json::to_value(config.as_ref()).map_err(|e| AppError::internal(e.to_string()))?;
    redact_secrets(&mut value);
    Ok(Json(value))
}

fn redact_secrets(value: &mut Value) {
    if let Some(token) = value.pointer_mut("/security/admin_auth_token") {
        if !token.is_null() {
            *token = json!("REDACTED");
        }
    }
    if let Some(sinks) = value.pointer_mut("/sinks").and_then(Value::as_array_mut) {
        for sink in sinks {
            if let Some(token) = sink.pointer_mut("/auth_bearer_token") {
                if !token.is_null() {
                    *token = json!("REDACTED");
                }
            }
            if sink.get("type").and_then(Value::as_str) == Some("message_bus") {
                if let Some(url) = sink.pointer_mut("/url") {
                    *url = json!("REDACTED");
                }
            }
        }
    }
}

/// Re-reads and validates the config file, applying it atomically only on
/// success. Sink
/// and monitor definitions still require a process restart; only the
/// pipeline is rebuilt here.
pub async fn reload_config(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let (new_config, new_source) =
        logagent_config::source::load(&state.config_path, &state.default_config_path).map_err(AppError::from)?;

    let report = logagent_config::validate::validate(&new_config);
    if !report.errors.is_empty() {
        return Err(AppError::bad_request(format!("config validation failed: {}", report.errors.join("; "))));
    }

    let pipeline = build_pipeline(&new_config)?;
    state.dispatcher.reload_pipeline(pipeline);
    state.config.store(std::sync::Arc::new(new_config));
    state.config_source.store(std::sync::Arc::new(new_source));

    Ok(Json(json!({ "reloaded": true, "warnings": report.warnings })))
}

pub async fn positions(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.positions.snapshot();
    let entries: serde_json::Map<String, Value> = snapshot
        .into_iter()
        .map(|(source_id, entry)| (source_id, json!({ "cursor": entry.cursor, "last_seen": entry.last_seen })))
        .collect();
    Json(Value::Object(entries))
}

pub async fn dlq_stats(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let by_sink = state.dispatcher.dlq().stats().map_err(|e| AppError::internal(e.to_string()))?;
    Ok(Json(json!({
        "total": state.dispatcher.dlq().len(),
        "by_sink": by_sink.into_iter().map(|(sink, n)| json!({ "sink": sink, "count": n })).collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize, Default)]
pub struct DlqReprocessRequest {
    #[serde(default)]
    pub source_id_prefix: Option<String>,
    #[serde(default)]
    pub sink_name: Option<String>,
    #[serde(default)]
    pub min_retry_count: Option<u32>,
    #[serde(default)]
    pub failed_after: Option<chrono::DateTime<Utc>>,
}

pub async fn dlq_reprocess(State(state): State<AppState>, Json(req): Json<DlqReprocessRequest>) -> AppResult<Json<Value>> {
    let filter = ReprocessFilter {
        source_id_prefix: req.source_id_prefix,
        sink_name: req.sink_name,
        min_retry_count: req.min_retry_count,
        failed_after: req.failed_after,
    };
    let count = state.dispatcher.reprocess_dlq(filter).await.map_err(AppError::from)?;
    Ok(Json(json!({ "reprocessed": count })))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], state.metrics.render_prometheus())
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub source_id: String,
    pub message: String,
    #[serde(default)]
    pub labels: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: bool,
}

/// Direct ingestion: builds a
/// [`Record`] with an [`Cursor::Http`] cursor and hands it straight to the
/// dispatcher, applying the same backpressure contract a monitor would.
pub async fn ingest(State(state): State<AppState>, Json(req): Json<IngestRequest>) -> AppResult<(StatusCode, Json<IngestResponse>)> {
    let sequence = state.next_http_sequence();
    let mut record = Record::new(
        SourceType::Http,
        req.source_id,
        Cursor::Http { sequence },
        req.message.as_bytes(),
        Utc::now(),
    );
    for (k, v) in req.labels {
        record.labels.set(k, v);
    }

    use logagent_core::dispatcher::EnqueueOutcome;
    match state.dispatcher.enqueue(record).await {
        EnqueueOutcome::Accepted | EnqueueOutcome::Spilled => Ok((StatusCode::ACCEPTED, Json(IngestResponse { accepted: true }))),
        EnqueueOutcome::Rejected(err) => Err(AppError::from(err)),
    }
}

/// Rust has no goroutine count to report; this surfaces the closest
/// analog, the process's OS thread count.
pub async fn debug_goroutines() -> impl IntoResponse {
    let os_threads = std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| status.lines().find_map(|l| l.strip_prefix("Threads:")).map(|v| v.trim().to_string()))
        .and_then(|v| v.parse::<u64>().ok());

    Json(json!({ "os_threads": os_threads }))
}

pub async fn debug_heap() -> impl IntoResponse {
    match std::fs::read_to_string("/proc/self/statm") {
        Ok(statm) => {
            let pages_resident: u64 = statm.split_whitespace().nth(1).and_then(|s| s.parse().ok()).unwrap_or(0);
            let page_size = 4096u64;
            Json(json!({ "rss_bytes": pages_resident * page_size })).into_response()
        }
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "/proc/self/statm unavailable on this platform" }))).into_response(),
    }
}

pub async fn debug_profile() -> impl IntoResponse {
    (StatusCode::NOT_IMPLEMENTED, Json(json!({ "error": "cpu profiling is not wired into this build" })))
}
