use crate::gateway::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use offgate_cache::SKIP_WAITING_TYPE;
use serde_json::{json, Value};
use std::sync::Arc;

/// GET /api/stats — counters and cache occupancy for the live generation.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = state.engine.load();
    let stats = engine.stats();
    let pending = state
        .pending
        .lock()
        .as_ref()
        .map(|engine| engine.generation().to_string());

    Json(json!({
        "generation": engine.generation(),
        "phase": engine.phase().as_str(),
        "pending_generation": pending,
        "entries": stats.entries,
        "hits": stats.hits,
        "misses": stats.misses,
        "network_fetches": stats.network_fetches,
        "retries": stats.retries,
        "bootstrap": {
            "loaded": stats.bootstrap_loaded,
            "failed": stats.bootstrap_failed,
        },
    }))
}

/// GET /api/status — read-only registration info for install-prompt flows.
pub async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = state.engine.load();
    Json(json!({
        "generation": engine.generation(),
        "phase": engine.phase().as_str(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// POST /api/control — the external signal channel.
///
/// A message whose `type` field is `SKIP_WAITING` promotes a pending
/// generation to active; any other message is acknowledged and ignored.
pub async fn control_handler(
    State(state): State<Arc<AppState>>,
    Json(message): Json<Value>,
) -> impl IntoResponse {
    if message.get("type").and_then(Value::as_str) != Some(SKIP_WAITING_TYPE) {
        return Json(json!({"applied": false, "reason": "unrecognized message"}));
    }

    let pending = state.pending.lock().take();
    match pending {
        Some(engine) => {
            engine.on_skip_signal();
            engine.activate();
            let generation = engine.generation().to_string();
            state.engine.store(engine);
            tracing::info!(generation = %generation, "skip signal applied, generation activated");
            Json(json!({"applied": true, "generation": generation}))
        }
        None => {
            // Nothing waiting; the signal is a no-op, as when no update is pending.
            state.engine.load().on_skip_signal();
            Json(json!({"applied": false, "reason": "no pending generation"}))
        }
    }
}
