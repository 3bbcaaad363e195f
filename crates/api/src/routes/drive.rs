//! Drive endpoints: file tree CRUD for admin and api-key principals

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use shogun_core::auth::{Capability, Principal};
use shogun_core::CoreError;

use crate::error::{ApiError, Result};
use crate::routes::require;
use crate::state::AppState;

fn require_drive(state: &AppState, principal: &Principal) -> Result<()> {
    if !state.config.enable_drive {
        return Err(ApiError(CoreError::Disabled("drive".into())));
    }
    require(principal, Capability::AdminRead)
}

pub async fn list_root(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<serde_json::Value>> {
    require_drive(&state, &principal)?;
    let entries = state.storage.list("").await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "path": "",
        "entries": entries,
    })))
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(path): Path<String>,
) -> Result<Json<serde_json::Value>> {
    require_drive(&state, &principal)?;
    let entries = state.storage.list(&path).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "path": path,
        "entries": entries,
    })))
}

pub async fn download(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(path): Path<String>,
) -> Result<Response> {
    require_drive(&state, &principal)?;
    let (reader, meta) = state.storage.read(&path).await?;
    let filename = path.rsplit('/').next().unwrap_or("download").to_string();
    let body = axum::body::Body::from_stream(ReaderStream::new(reader));
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, meta.content_type),
            (header::CONTENT_LENGTH, meta.size_bytes.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response())
}

#[derive(Debug, Deserialize, Default)]
pub struct UploadQuery {
    /// Directory the files land in; defaults to the root.
    #[serde(default)]
    pub path: Option<String>,
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>> {
    require_drive(&state, &principal)?;
    let prefix = query.path.unwrap_or_default();

    let mut written = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(CoreError::malformed(format!("multipart: {e}"))))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| "upload.bin".to_string());
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError(CoreError::malformed(format!("multipart body: {e}"))))?;

        let target = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        let size = state
            .storage
            .write(&target, Box::pin(std::io::Cursor::new(bytes)))
            .await?;
        written.push(serde_json::json!({ "path": target, "sizeBytes": size }));
    }

    if written.is_empty() {
        return Err(ApiError(CoreError::malformed(
            "multipart body with a `file` part required",
        )));
    }
    Ok(Json(serde_json::json!({
        "success": true,
        "files": written,
    })))
}

#[derive(Debug, Deserialize, Default)]
pub struct DeleteQuery {
    #[serde(default)]
    pub recursive: Option<bool>,
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(path): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<serde_json::Value>> {
    require_drive(&state, &principal)?;
    state
        .storage
        .delete(&path, query.recursive.unwrap_or(false))
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "path": path })))
}

#[derive(Debug, Deserialize)]
pub struct MkdirRequest {
    pub path: String,
}

pub async fn mkdir(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<MkdirRequest>,
) -> Result<Json<serde_json::Value>> {
    require_drive(&state, &principal)?;
    state.storage.mkdir(&req.path).await?;
    Ok(Json(serde_json::json!({ "success": true, "path": req.path })))
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub src: String,
    pub dst: String,
}

/// Rename and move share the backend primitive.
pub async fn rename(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<serde_json::Value>> {
    require_drive(&state, &principal)?;
    state.storage.rename(&req.src, &req.dst).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "src": req.src,
        "dst": req.dst,
    })))
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<serde_json::Value>> {
    require_drive(&state, &principal)?;
    let stats = state.storage.stats().await?;
    Ok(Json(serde_json::json!({ "success": true, "stats": stats })))
}
