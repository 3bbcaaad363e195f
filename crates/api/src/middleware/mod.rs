//! Middleware chain
//!
//! Order on the wire: CORS → request-id → rate-limit → body limits →
//! auth → handler.

pub mod auth;
pub mod rate_limit;
pub mod request_id;

pub use auth::auth_middleware;
pub use rate_limit::{RateLimitConfig, RateLimitLayer};
pub use request_id::request_id_middleware;
