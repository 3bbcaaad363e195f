//! Auth middleware
//!
//! Resolves every request's principal before the handler runs. Absent
//! credentials resolve to `Public`; invalid credentials are an error here,
//! so handlers only ever see a resolved principal in extensions.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use shogun_core::auth::AuthContext;

use crate::error::ApiError;
use crate::state::AppState;

fn header<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn client_ip(req: &Request) -> Option<IpAddr> {
    header(req, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| {
            req.extensions()
                .get::<axum::extract::ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip())
        })
}

fn session_cookie(req: &Request) -> Option<String> {
    header(req, "cookie")?.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "shogun_session").then(|| value.to_string())
    })
}

pub fn context_from(req: &Request) -> AuthContext {
    let bearer = header(req, "authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    AuthContext {
        bearer,
        token_header: header(req, "token").map(str::to_string),
        session: session_cookie(req),
        user_address: header(req, "x-user-address").map(str::to_string),
        wallet_signature: header(req, "x-wallet-signature").map(str::to_string),
        ip: client_ip(req),
    }
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let ctx = context_from(&req);
    match state.auth.resolve(&ctx).await {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(e) => ApiError(e).into_response(),
    }
}
