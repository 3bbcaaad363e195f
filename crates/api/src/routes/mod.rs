//! API routes

pub mod apikeys;
pub mod deals;
pub mod drive;
pub mod health;
pub mod ipfs;
pub mod links;
pub mod x402;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use shogun_core::auth::{Capability, Principal};
use shogun_core::CoreError;

use crate::error::ApiError;
use crate::state::AppState;

/// Capability gate shared by the handlers. `Public` principals get a 401
/// with a hint about what was expected; authenticated principals without
/// the capability get a 403.
pub(crate) fn require(principal: &Principal, cap: Capability) -> Result<(), ApiError> {
    if principal.can(cap) {
        return Ok(());
    }
    Err(ApiError(match principal {
        Principal::Public => CoreError::Unauthenticated(
            "no credentials presented; expected admin token, api key, or wallet signature".into(),
        ),
        other => CoreError::Forbidden(format!(
            "{} principal lacks the required capability",
            other.auth_type()
        )),
    }))
}

/// Create the main API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Content pipeline
        .route("/api/v1/ipfs/upload", post(ipfs::upload))
        .route("/api/v1/ipfs/upload-directory", post(ipfs::upload_directory))
        .route("/api/v1/ipfs/cat/*path", get(ipfs::cat))
        .route("/api/v1/ipfs/pin/add", post(ipfs::pin_add))
        .route("/api/v1/ipfs/:cid", delete(ipfs::remove))
        // Subscriptions
        .route("/api/v1/x402/subscribe", post(x402::subscribe))
        .route("/api/v1/x402/subscription/:addr", get(x402::subscription))
        .route("/api/v1/x402/tiers", get(x402::tiers))
        // Deals
        .route("/api/v1/deals/create", post(deals::create))
        .route("/api/v1/deals/:id", get(deals::get).delete(deals::terminate))
        .route("/api/v1/deals/:id/activate", post(deals::activate))
        .route("/api/v1/deals/:id/renew", post(deals::renew))
        .route("/api/v1/deals/:id/verify", get(deals::verify))
        .route("/api/v1/deals/:id/verify-proof", get(deals::verify))
        .route("/api/v1/deals/client/:addr", get(deals::by_client))
        // Drive
        .route("/api/v1/drive/list", get(drive::list_root))
        .route("/api/v1/drive/list/*path", get(drive::list))
        .route("/api/v1/drive/download/*path", get(drive::download))
        .route("/api/v1/drive/upload", post(drive::upload))
        .route("/api/v1/drive/delete/*path", delete(drive::remove))
        .route("/api/v1/drive/mkdir", post(drive::mkdir))
        .route("/api/v1/drive/rename", post(drive::rename))
        .route("/api/v1/drive/move", post(drive::rename))
        .route("/api/v1/drive/stats", get(drive::stats))
        // Public links
        .route("/api/v1/drive/links", post(links::create).get(links::list))
        .route("/api/v1/drive/links/:id", delete(links::revoke))
        .route("/api/v1/drive/public/:link_id", get(links::download))
        // API keys
        .route("/api/v1/api-keys", post(apikeys::create).get(apikeys::list))
        .route("/api/v1/api-keys/:key_id", delete(apikeys::revoke))
        .with_state(state)
}
