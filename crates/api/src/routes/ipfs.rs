//! Content pipeline endpoints: upload, directory upload, cat, pin, delete

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use shogun_core::auth::{Capability, Principal};
use shogun_core::pipeline::{UploadMeta, UploadOutcome};
use shogun_core::CoreError;
use shogun_storage::guess_content_type;

use crate::error::{ApiError, Result};
use crate::routes::require;
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct UploadQuery {
    /// `?deal=true` marks a deal-backed upload.
    #[serde(default)]
    pub deal: Option<bool>,
    #[serde(default)]
    pub encrypted: Option<bool>,
}

fn flag(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

/// Drains the multipart body into `(relative-path, bytes)` pairs.
async fn collect_parts(multipart: &mut Multipart) -> Result<Vec<(String, Option<String>, Bytes)>> {
    let mut parts = Vec::new();
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
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError(CoreError::malformed(format!("multipart body: {e}"))))?;
        parts.push((name, content_type, bytes));
    }
    if parts.is_empty() {
        return Err(ApiError(CoreError::malformed(
            "multipart body with a `file` part required",
        )));
    }
    Ok(parts)
}

fn upload_response(
    status: StatusCode,
    principal: &Principal,
    outcome: UploadOutcome,
) -> Response {
    let mut body = serde_json::json!({
        "success": true,
        "file": {
            "size": outcome.size_bytes,
            "mimetype": outcome.content_type,
            "hash": outcome.cid,
        },
        "dedup": outcome.dedup,
        "authType": principal.auth_type(),
    });
    if outcome.concurrent_duplicate {
        body["concurrentDuplicate"] = serde_json::json!(true);
    }
    if !outcome.entries.is_empty() {
        body["entries"] = serde_json::to_value(&outcome.entries).unwrap_or_default();
        body["parentDirectoryCid"] = serde_json::json!(outcome.cid);
    }
    if let Some(sub) = &outcome.subscription {
        body["subscription"] = serde_json::to_value(sub).unwrap_or_default();
    }
    (status, Json(body)).into_response()
}

/// 402 bodies carry the tier catalog so the client can fix the situation.
async fn payment_required_response(state: &AppState, err: CoreError) -> Response {
    let tiers = state
        .subscriptions
        .list_tiers()
        .await
        .ok()
        .map(|l| serde_json::to_value(l.tiers).unwrap_or_default());
    let body = serde_json::json!({
        "success": false,
        "error": err.to_string(),
        "reason": err.reason(),
        "tiers": tiers,
    });
    (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response()
}

/// Single-file upload.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response> {
    let mut parts = collect_parts(&mut multipart).await?;
    let (name, content_type, bytes) = parts.remove(0);

    let meta = UploadMeta {
        original_name: name,
        content_type,
        content_length: Some(bytes.len() as u64),
        encrypted: query.encrypted.unwrap_or(false) || flag(&headers, "x-encrypted"),
        deal_upload: query.deal.unwrap_or(false) || flag(&headers, "x-deal-upload"),
    };

    match state
        .pipeline
        .upload(&principal, meta, Box::pin(std::io::Cursor::new(bytes)))
        .await
    {
        Ok(outcome) => Ok(upload_response(StatusCode::CREATED, &principal, outcome)),
        Err(e @ CoreError::PaymentRequired(_)) => {
            Ok(payment_required_response(&state, e).await)
        }
        Err(e) => Err(ApiError(e)),
    }
}

/// Directory upload; part filenames carry the relative paths.
pub async fn upload_directory(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response> {
    let parts = collect_parts(&mut multipart).await?;
    let files: Vec<(String, Bytes)> = parts
        .into_iter()
        .map(|(name, _, bytes)| (name, bytes))
        .collect();

    let root = files
        .first()
        .and_then(|(p, _)| p.split('/').next())
        .unwrap_or("directory")
        .to_string();
    let meta = UploadMeta {
        original_name: root,
        content_type: None,
        content_length: None,
        encrypted: query.encrypted.unwrap_or(false) || flag(&headers, "x-encrypted"),
        deal_upload: query.deal.unwrap_or(false) || flag(&headers, "x-deal-upload"),
    };

    match state
        .pipeline
        .upload_directory(&principal, files, meta)
        .await
    {
        Ok(outcome) => Ok(upload_response(StatusCode::CREATED, &principal, outcome)),
        Err(e @ CoreError::PaymentRequired(_)) => {
            Ok(payment_required_response(&state, e).await)
        }
        Err(e) => Err(ApiError(e)),
    }
}

/// Parses `bytes=start-end`; open-ended and suffix forms fall back to a
/// full-body response.
fn parse_range(headers: &HeaderMap) -> Option<(u64, u64)> {
    let raw = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = end.parse().ok()?;
    (end >= start).then_some((start, end - start + 1))
}

/// Public gateway read: `GET /api/v1/ipfs/cat/{cid}[/{subpath}]`.
pub async fn cat(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let (cid, subpath) = match path.split_once('/') {
        Some((cid, rest)) => (cid.to_string(), Some(rest.to_string())),
        None => (path, None),
    };
    if cid.is_empty() {
        return Err(ApiError(CoreError::malformed("missing cid")));
    }

    let range = parse_range(&headers);
    // Idempotent read: one retry on a transient store failure.
    let reader = match state.ipfs.cat(&cid, subpath.as_deref(), range).await {
        Ok(reader) => reader,
        Err(e) if e.is_retryable() => state.ipfs.cat(&cid, subpath.as_deref(), range).await?,
        Err(e) => return Err(e.into()),
    };

    let content_type = subpath
        .as_deref()
        .map(guess_content_type)
        .unwrap_or("application/octet-stream");
    let status = if range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let body = axum::body::Body::from_stream(ReaderStream::new(reader));
    Ok((
        status,
        [
            (header::CONTENT_TYPE, content_type),
            (header::ACCEPT_RANGES, "bytes"),
        ],
        body,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct PinRequest {
    pub cid: String,
}

/// Pin an existing cid (admin or api-key).
pub async fn pin_add(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<PinRequest>,
) -> Result<Json<serde_json::Value>> {
    require(&principal, Capability::PinManage)?;
    state.ipfs.pin(&req.cid, None).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "cid": req.cid,
        "pinned": true,
    })))
}

/// Deletes the caller's upload; physical unpin happens at refcount zero.
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(cid): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let outcome = state.pipeline.delete(&principal, &cid).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "cid": outcome.cid,
        "unpinned": outcome.unpinned,
    })))
}
