//! Subscription endpoints

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;

use shogun_core::auth::{Capability, Principal};
use shogun_core::CoreError;

use crate::error::{ApiError, Result};
use crate::routes::require;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub tier: String,
    #[serde(default)]
    pub payment: serde_json::Value,
}

/// Purchase or renew a subscription for the authenticated wallet.
pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<SubscribeRequest>,
) -> Result<Json<serde_json::Value>> {
    require(&principal, Capability::Subscribe)?;
    let addr = match &principal {
        Principal::Wallet { address } => address.clone(),
        _ => {
            return Err(ApiError(CoreError::Forbidden(
                "subscriptions are purchased by wallets".into(),
            )))
        }
    };

    let subscription = state.subscriptions.subscribe(&addr, &req.tier, &req.payment).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "address": addr,
        "subscription": subscription,
    })))
}

/// Public subscription status lookup.
pub async fn subscription(
    State(state): State<Arc<AppState>>,
    Path(addr): Path<String>,
) -> Result<Json<serde_json::Value>> {
    match state.subscriptions.get(&addr).await? {
        Some(sub) => {
            let active = sub.is_active(chrono::Utc::now());
            Ok(Json(serde_json::json!({
                "success": true,
                "active": active,
                "subscription": sub,
            })))
        }
        None => Ok(Json(serde_json::json!({
            "success": true,
            "active": false,
        }))),
    }
}

/// Tier catalog plus relay cap usage.
pub async fn tiers(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    let listing = state.subscriptions.list_tiers().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "tiers": listing.tiers,
        "relay": listing.relay,
    })))
}
