//! Health check endpoint

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::error::Result;
use crate::state::AppState;

/// Liveness plus uptime and cap usage. The store probe is best-effort so
/// a down IPFS daemon degrades the report instead of failing it.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    let relay = state.subscriptions.relay_usage().await?;
    let ipfs = match state.ipfs.version().await {
        Ok(version) => serde_json::json!({ "reachable": true, "version": version }),
        Err(_) => serde_json::json!({ "reachable": false }),
    };

    Ok(Json(serde_json::json!({
        "success": true,
        "status": "healthy",
        "version": state.version,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "relay": relay,
        "ipfs": ipfs,
    })))
}
