//! API server setup and configuration

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use shogun_core::CoreError;

use crate::error::Result;
use crate::middleware::{
    auth_middleware, request_id_middleware, RateLimitConfig, RateLimitLayer,
};
use crate::routes;
use crate::state::AppState;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            enable_cors: true,
        }
    }
}

/// Tracks in-flight requests for the pulse record.
async fn connection_gauge(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    state.active_connections.fetch_add(1, Ordering::Relaxed);
    let response = next.run(req).await;
    state.active_connections.fetch_sub(1, Ordering::Relaxed);
    response
}

/// API Server
pub struct Server {
    config: ServerConfig,
    app: Router,
}

impl Server {
    /// Create a new API server over an already-built state.
    pub fn new(config: ServerConfig, state: Arc<AppState>) -> Self {
        let app = Self::build_app(state, &config);
        Self { config, app }
    }

    /// Build the application router.
    ///
    /// Middleware order on the wire: CORS → request-id → rate-limit →
    /// body limit → auth → handler. Layers apply outside-in, so they are
    /// attached innermost first.
    fn build_app(state: Arc<AppState>, config: &ServerConfig) -> Router {
        let rate_limits = RateLimitConfig {
            global_max: state.config.global_rate_limit,
            global_window: Duration::from_secs(state.config.global_rate_window_secs),
            upload_max: state.config.upload_rate_limit,
            upload_window: Duration::from_secs(state.config.upload_rate_window_secs),
        };
        // Multipart framing overhead on top of the pipeline's own cap.
        let body_limit = state.config.max_upload_bytes as usize + 1024 * 1024;

        let mut app = routes::create_router(Arc::clone(&state))
            .layer(axum::middleware::from_fn_with_state(
                Arc::clone(&state),
                auth_middleware,
            ))
            .layer(DefaultBodyLimit::max(body_limit))
            .layer(RateLimitLayer::new(rate_limits))
            .layer(axum::middleware::from_fn(request_id_middleware))
            .layer(axum::middleware::from_fn_with_state(
                Arc::clone(&state),
                connection_gauge,
            ));

        if config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            app = app.layer(cors);
        }

        app
    }

    /// Serve until `shutdown` resolves, then stop accepting and give
    /// in-flight requests a bounded drain window.
    pub async fn start<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        const DRAIN_WINDOW: Duration = Duration::from_secs(30);

        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| CoreError::Backend(format!("invalid listen address: {e}")))?;

        info!("🚀 Shogun relay listening on http://{}", addr);
        info!("📊 Health check: http://{}/health", addr);
        info!("📦 Upload: POST http://{}/api/v1/ipfs/upload", addr);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| CoreError::Backend(format!("bind {addr}: {e}")))?;

        let (tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            shutdown.await;
            let _ = tx.send(true);
        });

        let graceful = {
            let mut rx = rx.clone();
            async move {
                let _ = rx.changed().await;
            }
        };
        let serve = axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(graceful);

        let drain_deadline = {
            let mut rx = rx.clone();
            async move {
                let _ = rx.changed().await;
                tokio::time::sleep(DRAIN_WINDOW).await;
            }
        };

        tokio::select! {
            result = serve => {
                result.map_err(|e| CoreError::Backend(format!("server error: {e}")))?;
            }
            _ = drain_deadline => {
                warn!("drain window elapsed; aborting remaining requests");
            }
        }
        Ok(())
    }

    /// Get router for testing
    pub fn router(self) -> Router {
        self.app
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8765);
        assert!(config.enable_cors);
    }
}
