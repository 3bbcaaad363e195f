//! API key endpoints (admin only)

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use shogun_core::auth::apikey;
use shogun_core::auth::{Capability, Principal};
use shogun_core::CoreError;
use shogun_ledger::ApiKeyRecord;

use crate::error::{ApiError, Result};
use crate::routes::require;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyRequest {
    pub name: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Redacted listing view; the hash never leaves the ledger.
fn view(record: &ApiKeyRecord) -> serde_json::Value {
    serde_json::json!({
        "keyId": record.key_id,
        "name": record.name,
        "owner": record.owner,
        "createdAt": record.created_at,
        "expiresAt": record.expires_at,
        "lastUsedAt": record.last_used_at,
        "revoked": record.revoked,
    })
}

/// Mints a key; the token is shown exactly once in this response.
pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CreateKeyRequest>,
) -> Result<Response> {
    require(&principal, Capability::AdminWrite)?;
    if req.name.trim().is_empty() {
        return Err(ApiError(CoreError::malformed("key name required")));
    }

    let generated = apikey::generate();
    let record = ApiKeyRecord {
        key_id: generated.key_id.clone(),
        hashed_token: generated.hashed_token,
        name: req.name,
        owner: "admin".to_string(),
        created_at: Utc::now(),
        expires_at: req.expires_at,
        last_used_at: None,
        revoked: false,
    };
    state.ledger.put_api_key(&record).await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "success": true,
            "keyId": generated.key_id,
            "token": generated.token,
            "key": view(&record),
        })),
    )
        .into_response())
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<serde_json::Value>> {
    require(&principal, Capability::AdminWrite)?;
    let keys: Vec<serde_json::Value> = state.ledger.api_keys().await?.iter().map(view).collect();
    Ok(Json(serde_json::json!({ "success": true, "keys": keys })))
}

pub async fn revoke(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(key_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    require(&principal, Capability::AdminWrite)?;
    let mut record = state
        .ledger
        .api_key(&key_id)
        .await?
        .ok_or_else(|| ApiError(CoreError::NotFound(format!("api key {key_id}"))))?;
    record.revoked = true;
    state.ledger.put_api_key(&record).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "key": view(&record),
    })))
}
