//! Rate limiting middleware
//!
//! Two sliding windows per client IP: a global request budget and a
//! tighter budget for upload routes. Auth-failure limiting is separate
//! and lives in the auth multiplexer.

use axum::{
    extract::Request,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tower::{Layer, Service};

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per window, any route.
    pub global_max: usize,
    pub global_window: Duration,
    /// Maximum upload requests per window.
    pub upload_max: usize,
    pub upload_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_max: 1_000,
            global_window: Duration::from_secs(900),
            upload_max: 100,
            upload_window: Duration::from_secs(3_600),
        }
    }
}

#[derive(Default)]
struct RateLimiterState {
    global: HashMap<IpAddr, Vec<Instant>>,
    uploads: HashMap<IpAddr, Vec<Instant>>,
}

fn check_window(
    requests: &mut HashMap<IpAddr, Vec<Instant>>,
    ip: IpAddr,
    max: usize,
    window: Duration,
) -> bool {
    let now = Instant::now();
    let cutoff = now - window;
    let history = requests.entry(ip).or_default();
    history.retain(|&t| t > cutoff);
    if history.len() < max {
        history.push(now);
        true
    } else {
        false
    }
}

/// Client IP: forwarded header first, then the socket peer address.
fn client_ip(req: &Request) -> IpAddr {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| {
            req.extensions()
                .get::<axum::extract::ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip())
        })
        .unwrap_or(IpAddr::from([0, 0, 0, 0]))
}

fn is_upload_route(path: &str) -> bool {
    path.starts_with("/api/v1/ipfs/upload") || path == "/api/v1/drive/upload"
}

/// Rate limiting layer
#[derive(Clone)]
pub struct RateLimitLayer {
    state: Arc<Mutex<RateLimiterState>>,
    config: RateLimitConfig,
}

impl RateLimitLayer {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(RateLimiterState::default())),
            config,
        }
    }
}

impl Default for RateLimitLayer {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            state: self.state.clone(),
            config: self.config.clone(),
        }
    }
}

/// Rate limiting service
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    state: Arc<Mutex<RateLimiterState>>,
    config: RateLimitConfig,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let mut inner = self.inner.clone();
        let state = self.state.clone();
        let config = self.config.clone();

        Box::pin(async move {
            let ip = client_ip(&req);
            let upload = is_upload_route(req.uri().path());

            let allowed = {
                let mut state = state.lock().expect("rate limiter lock");
                let global_ok =
                    check_window(&mut state.global, ip, config.global_max, config.global_window);
                let upload_ok = !upload
                    || check_window(
                        &mut state.uploads,
                        ip,
                        config.upload_max,
                        config.upload_window,
                    );
                global_ok && upload_ok
            };

            if !allowed {
                let body = serde_json::json!({
                    "success": false,
                    "error": "rate limit exceeded, try again later",
                    "reason": "rate-limited",
                });
                return Ok((StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response());
            }

            inner.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_admits_up_to_max() {
        let mut map = HashMap::new();
        let ip = IpAddr::from([1, 2, 3, 4]);
        for _ in 0..3 {
            assert!(check_window(&mut map, ip, 3, Duration::from_secs(60)));
        }
        assert!(!check_window(&mut map, ip, 3, Duration::from_secs(60)));
    }

    #[test]
    fn window_is_per_ip() {
        let mut map = HashMap::new();
        let a = IpAddr::from([1, 1, 1, 1]);
        let b = IpAddr::from([2, 2, 2, 2]);
        assert!(check_window(&mut map, a, 1, Duration::from_secs(60)));
        assert!(!check_window(&mut map, a, 1, Duration::from_secs(60)));
        assert!(check_window(&mut map, b, 1, Duration::from_secs(60)));
    }

    #[test]
    fn upload_routes_are_detected() {
        assert!(is_upload_route("/api/v1/ipfs/upload"));
        assert!(is_upload_route("/api/v1/ipfs/upload-directory"));
        assert!(is_upload_route("/api/v1/drive/upload"));
        assert!(!is_upload_route("/api/v1/ipfs/cat/bafy"));
        assert!(!is_upload_route("/health"));
    }
}
