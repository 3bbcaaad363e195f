//! Shogun Relay HTTP surface
//!
//! Thin dispatcher over the core components: route handlers validate and
//! translate, business logic lives in `shogun-core`.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;
pub mod telemetry;

pub use error::{ApiError, Result};
pub use server::{Server, ServerConfig};
pub use state::AppState;
