//! Public link endpoints
//!
//! Links grant unauthenticated read of one drive file; they are created
//! and revoked by the admin only.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::warn;
use uuid::Uuid;

use shogun_core::auth::{Capability, Principal};
use shogun_core::CoreError;
use shogun_ledger::PublicLink;

use crate::error::{ApiError, Result};
use crate::routes::require;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLinkRequest {
    pub file_path: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CreateLinkRequest>,
) -> Result<Response> {
    require(&principal, Capability::AdminWrite)?;

    // The target must exist, and one live link per file.
    state.storage.read(&req.file_path).await?;
    if state.ledger.link_for_path(&req.file_path).await?.is_some() {
        return Err(ApiError(CoreError::Conflict(format!(
            "a live link already exists for {}",
            req.file_path
        ))));
    }

    let link = PublicLink {
        link_id: Uuid::new_v4().simple().to_string(),
        file_path: req.file_path,
        created_at: Utc::now(),
        expires_at: req.expires_at,
        access_count: 0,
        last_accessed_at: None,
        revoked: false,
    };
    state.ledger.put_link(&link).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "success": true, "link": link })),
    )
        .into_response())
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<serde_json::Value>> {
    require(&principal, Capability::AdminRead)?;
    let links = state.ledger.links().await?;
    Ok(Json(serde_json::json!({ "success": true, "links": links })))
}

pub async fn revoke(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(link_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    require(&principal, Capability::AdminWrite)?;
    let mut link = state
        .ledger
        .link(&link_id)
        .await?
        .ok_or_else(|| ApiError(CoreError::NotFound(format!("link {link_id}"))))?;
    link.revoked = true;
    state.ledger.put_link(&link).await?;
    Ok(Json(serde_json::json!({ "success": true, "link": link })))
}

/// Unauthenticated download through a live link.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(link_id): Path<String>,
) -> Result<Response> {
    let link = state
        .ledger
        .link(&link_id)
        .await?
        .filter(|l| l.is_live(Utc::now()))
        .ok_or_else(|| ApiError(CoreError::NotFound(format!("link {link_id}"))))?;

    let (reader, meta) = state.storage.read(&link.file_path).await?;

    // Access bookkeeping happens off the response path.
    {
        let ledger = state.ledger.clone();
        let mut touched = link.clone();
        tokio::spawn(async move {
            touched.access_count += 1;
            touched.last_accessed_at = Some(Utc::now());
            if let Err(e) = ledger.put_link(&touched).await {
                warn!(error = %e, "failed to update link access stats");
            }
        });
    }

    let filename = link
        .file_path
        .rsplit('/')
        .next()
        .unwrap_or("download")
        .to_string();
    let body = axum::body::Body::from_stream(ReaderStream::new(reader));
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, meta.content_type),
            (header::CONTENT_LENGTH, meta.size_bytes.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response())
}
