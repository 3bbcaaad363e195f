//! Deal endpoints

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;

use shogun_core::auth::{Capability, Principal};
use shogun_core::deal::CreateDealRequest;
use shogun_core::CoreError;

use crate::error::{ApiError, Result};
use crate::routes::require;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCreateDeal {
    pub cid: String,
    pub client_address: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub duration_days: Option<u64>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    pub tier: String,
}

impl ApiCreateDeal {
    fn duration_secs(&self) -> Result<u64> {
        self.duration_secs
            .or(self.duration_days.map(|d| d * 86_400))
            .ok_or_else(|| {
                ApiError(CoreError::malformed(
                    "durationDays or durationSecs required",
                ))
            })
    }
}

/// New deal in `pending`; returns the payment the client owes.
pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<ApiCreateDeal>,
) -> Result<Json<serde_json::Value>> {
    require(&principal, Capability::DealWrite)?;
    if !principal.may_act_on(&req.client_address.to_lowercase()) {
        return Err(ApiError(CoreError::Forbidden(
            "clientAddress must match the authenticated wallet".into(),
        )));
    }

    let duration_secs = req.duration_secs()?;
    let deal = state
        .deals
        .create(CreateDealRequest {
            cid: req.cid,
            client_address: req.client_address,
            size_bytes: req.size_bytes,
            duration_secs,
            tier: req.tier,
        })
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "dealId": deal.deal_id,
        "status": deal.status,
        "paymentRequired": { "amountAtomic": deal.price_atomic },
    })))
}

#[derive(Debug, Deserialize, Default)]
pub struct ActivateRequest {
    #[serde(default)]
    pub payment: serde_json::Value,
}

fn requester_for(principal: &Principal, fallback: &str) -> String {
    match principal {
        Principal::Wallet { address } => address.clone(),
        // Admin and API keys act on behalf of the deal's own client.
        _ => fallback.to_string(),
    }
}

/// Verify payment → `paid` → confirm pin → `active`.
pub async fn activate(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(deal_id): Path<String>,
    Json(req): Json<ActivateRequest>,
) -> Result<Json<serde_json::Value>> {
    require(&principal, Capability::DealWrite)?;
    let current = state.deals.get(&deal_id).await?;
    let requester = requester_for(&principal, &current.client_address);

    let deal = state.deals.activate(&deal_id, &requester, &req.payment).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "deal": deal,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewRequest {
    #[serde(default)]
    pub duration_days: Option<u64>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub payment: serde_json::Value,
}

/// Extends an active deal or revives an expired one inside grace.
pub async fn renew(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(deal_id): Path<String>,
    Json(req): Json<RenewRequest>,
) -> Result<Json<serde_json::Value>> {
    require(&principal, Capability::DealWrite)?;
    let duration_secs = req
        .duration_secs
        .or(req.duration_days.map(|d| d * 86_400))
        .ok_or_else(|| ApiError(CoreError::malformed("durationDays or durationSecs required")))?;

    let current = state.deals.get(&deal_id).await?;
    let requester = requester_for(&principal, &current.client_address);
    let deal = state
        .deals
        .renew(&deal_id, &requester, duration_secs, &req.payment)
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "deal": deal })))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(deal_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let deal = state.deals.get(&deal_id).await?;
    Ok(Json(serde_json::json!({ "success": true, "deal": deal })))
}

pub async fn by_client(
    State(state): State<Arc<AppState>>,
    Path(addr): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let deals = state.deals.deals_for(&addr).await?;
    Ok(Json(serde_json::json!({ "success": true, "deals": deals })))
}

/// Client cancel within grace, or admin termination.
pub async fn terminate(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(deal_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    require(&principal, Capability::DealWrite)?;
    let is_admin = principal.can(Capability::AdminWrite);
    let requester = match &principal {
        Principal::Wallet { address } => address.clone(),
        _ => String::new(),
    };
    let deal = state.deals.terminate(&deal_id, &requester, is_admin).await?;
    Ok(Json(serde_json::json!({ "success": true, "deal": deal })))
}

#[derive(Debug, Deserialize, Default)]
pub struct VerifyQuery {
    #[serde(default)]
    pub challenge: Option<String>,
}

/// Public storage proof.
pub async fn verify(
    State(state): State<Arc<AppState>>,
    Path(deal_id): Path<String>,
    Query(query): Query<VerifyQuery>,
) -> Result<Json<serde_json::Value>> {
    let proof = state
        .deals
        .verify(&deal_id, query.challenge.as_deref())
        .await?;
    let mut body = serde_json::to_value(&proof)
        .map_err(|e| ApiError(CoreError::Backend(e.to_string())))?;
    body["success"] = serde_json::json!(true);
    Ok(Json(body))
}
