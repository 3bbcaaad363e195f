//! Authentication multiplexer
//!
//! Resolves, in order: admin bearer token, session cookie, API key, wallet
//! signature, anonymous. Handlers branch on capabilities, never on the
//! principal tag, so adding an auth method stays local to this module.

pub mod apikey;
pub mod session;
pub mod wallet;

use chrono::Utc;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use shogun_ledger::Ledger;

use crate::error::{CoreError, Result};
use apikey::{constant_time_eq, hash_token, key_id_of, API_KEY_PREFIX};
use session::SessionStore;

/// What a principal is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Upload,
    Delete,
    AdminRead,
    AdminWrite,
    PinManage,
    DealWrite,
    Subscribe,
}

/// Resolved identity of a request.
#[derive(Debug, Clone)]
pub enum Principal {
    Admin,
    ApiKey { key_id: String, name: String },
    Wallet { address: String },
    Public,
}

impl Principal {
    pub fn can(&self, cap: Capability) -> bool {
        match self {
            Self::Admin => true,
            // API keys act for the admin everywhere except config mutation.
            Self::ApiKey { .. } => cap != Capability::AdminWrite,
            Self::Wallet { .. } => matches!(
                cap,
                Capability::Upload
                    | Capability::Delete
                    | Capability::Subscribe
                    | Capability::DealWrite
            ),
            Self::Public => false,
        }
    }

    /// Ledger owner key for rows this principal owns.
    pub fn owner_key(&self) -> Option<&str> {
        match self {
            Self::Admin | Self::ApiKey { .. } => Some("admin"),
            Self::Wallet { address } => Some(address),
            Self::Public => None,
        }
    }

    pub fn auth_type(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::ApiKey { .. } => "api-key",
            Self::Wallet { .. } => "wallet",
            Self::Public => "public",
        }
    }

    /// Wallet principals only touch rows under their own address; admin
    /// and API keys may act on any owner.
    pub fn may_act_on(&self, owner_key: &str) -> bool {
        match self {
            Self::Admin | Self::ApiKey { .. } => true,
            Self::Wallet { address } => address.eq_ignore_ascii_case(owner_key),
            Self::Public => false,
        }
    }
}

/// Credential material extracted from request headers by the surface.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    /// `Authorization: Bearer <...>`
    pub bearer: Option<String>,
    /// Legacy `token:` header, admin only.
    pub token_header: Option<String>,
    /// Session cookie value.
    pub session: Option<String>,
    /// `X-User-Address`
    pub user_address: Option<String>,
    /// `X-Wallet-Signature`
    pub wallet_signature: Option<String>,
    pub ip: Option<IpAddr>,
}

impl AuthContext {
    fn has_credentials(&self) -> bool {
        self.bearer.is_some()
            || self.token_header.is_some()
            || self.session.is_some()
            || self.wallet_signature.is_some()
    }
}

/// Sliding-window counter of authentication failures per IP.
pub struct FailureWindow {
    state: Mutex<HashMap<IpAddr, Vec<Instant>>>,
    limit: usize,
    window: Duration,
}

impl FailureWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    pub fn record(&self, ip: IpAddr) {
        let mut state = self.state.lock().expect("failure window lock");
        state.entry(ip).or_default().push(Instant::now());
    }

    /// True once the IP has reached the failure limit inside the window.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        let cutoff = Instant::now() - self.window;
        let mut state = self.state.lock().expect("failure window lock");
        match state.get_mut(&ip) {
            Some(failures) => {
                failures.retain(|&t| t > cutoff);
                failures.len() >= self.limit
            }
            None => false,
        }
    }
}

pub struct AuthMultiplexer {
    admin_token: Option<String>,
    ledger: Ledger,
    sessions: Arc<SessionStore>,
    failures: FailureWindow,
    strict_session_ip: bool,
}

impl AuthMultiplexer {
    pub fn new(
        admin_token: Option<String>,
        ledger: Ledger,
        sessions: Arc<SessionStore>,
        failure_limit: usize,
        failure_window: Duration,
        strict_session_ip: bool,
    ) -> Self {
        Self {
            admin_token,
            ledger,
            sessions,
            failures: FailureWindow::new(failure_limit, failure_window),
            strict_session_ip,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    fn fail(&self, ip: Option<IpAddr>, method: &str) -> CoreError {
        if let Some(ip) = ip {
            self.failures.record(ip);
        }
        debug!(method, "authentication failure");
        CoreError::Unauthenticated(format!("{method} authentication failed"))
    }

    /// Resolves the request's principal. The first credential type present
    /// decides the outcome; an invalid credential is a failure, not a
    /// fall-through.
    pub async fn resolve(&self, ctx: &AuthContext) -> Result<Principal> {
        if ctx.has_credentials() {
            if let Some(ip) = ctx.ip {
                if self.failures.is_blocked(ip) {
                    warn!(%ip, "auth attempts rate limited");
                    return Err(CoreError::RateLimited(
                        "too many authentication failures".into(),
                    ));
                }
            }
        }

        // 1. Admin bearer token (also the legacy `token:` header).
        let admin_candidate = ctx
            .bearer
            .as_deref()
            .filter(|t| !t.starts_with(API_KEY_PREFIX))
            .or(ctx.token_header.as_deref());
        if let Some(presented) = admin_candidate {
            return match &self.admin_token {
                Some(expected)
                    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) =>
                {
                    Ok(Principal::Admin)
                }
                _ => Err(self.fail(ctx.ip, "admin-token")),
            };
        }

        // 2. Session cookie.
        if let Some(token) = ctx.session.as_deref() {
            let ip = ctx.ip.unwrap_or(IpAddr::from([0, 0, 0, 0]));
            return if self.sessions.validate(token, ip, self.strict_session_ip) {
                Ok(Principal::Admin)
            } else {
                Err(self.fail(ctx.ip, "session"))
            };
        }

        // 3. API key, detected by its fixed prefix.
        if let Some(token) = ctx
            .bearer
            .as_deref()
            .filter(|t| t.starts_with(API_KEY_PREFIX))
        {
            return self.resolve_api_key(ctx, token).await;
        }

        // 4. Wallet signature headers.
        if let Some(signature) = ctx.wallet_signature.as_deref() {
            let claimed = ctx
                .user_address
                .as_deref()
                .ok_or_else(|| self.fail(ctx.ip, "wallet"))?;
            return match wallet::verify_wallet(claimed, signature) {
                Ok(address) => Ok(Principal::Wallet { address }),
                Err(_) => Err(self.fail(ctx.ip, "wallet")),
            };
        }

        Ok(Principal::Public)
    }

    async fn resolve_api_key(&self, ctx: &AuthContext, token: &str) -> Result<Principal> {
        let key_id = match key_id_of(token) {
            Ok(id) => id.to_string(),
            Err(_) => return Err(self.fail(ctx.ip, "api-key")),
        };
        let record = match self.ledger.api_key(&key_id).await? {
            Some(r) => r,
            None => return Err(self.fail(ctx.ip, "api-key")),
        };
        if !record.is_usable(Utc::now()) {
            return Err(self.fail(ctx.ip, "api-key"));
        }
        let presented = hash_token(token);
        if !constant_time_eq(presented.as_bytes(), record.hashed_token.as_bytes()) {
            return Err(self.fail(ctx.ip, "api-key"));
        }

        // Touch lastUsedAt off the request path.
        let ledger = self.ledger.clone();
        let mut touched = record.clone();
        tokio::spawn(async move {
            touched.last_used_at = Some(Utc::now());
            if let Err(e) = ledger.put_api_key(&touched).await {
                warn!(error = %e, "failed to update api key last-used");
            }
        });

        Ok(Principal::ApiKey {
            key_id: record.key_id,
            name: record.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shogun_ledger::{ApiKeyRecord, MemorySubstrate};

    fn multiplexer(admin_token: Option<&str>) -> AuthMultiplexer {
        let ledger = Ledger::new(Arc::new(MemorySubstrate::new()), "test");
        AuthMultiplexer::new(
            admin_token.map(str::to_string),
            ledger,
            Arc::new(SessionStore::new()),
            5,
            Duration::from_secs(900),
            false,
        )
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[tokio::test]
    async fn admin_token_resolves_admin() {
        let mux = multiplexer(Some("sekrit"));
        let ctx = AuthContext {
            bearer: Some("sekrit".into()),
            ip: Some(ip(1)),
            ..Default::default()
        };
        assert!(matches!(
            mux.resolve(&ctx).await.unwrap(),
            Principal::Admin
        ));
    }

    #[tokio::test]
    async fn legacy_token_header_also_works() {
        let mux = multiplexer(Some("sekrit"));
        let ctx = AuthContext {
            token_header: Some("sekrit".into()),
            ip: Some(ip(1)),
            ..Default::default()
        };
        assert!(matches!(mux.resolve(&ctx).await.unwrap(), Principal::Admin));
    }

    #[tokio::test]
    async fn wrong_admin_token_fails_without_fallthrough() {
        let mux = multiplexer(Some("sekrit"));
        let ctx = AuthContext {
            bearer: Some("wrong".into()),
            ip: Some(ip(2)),
            ..Default::default()
        };
        assert!(matches!(
            mux.resolve(&ctx).await.unwrap_err(),
            CoreError::Unauthenticated(_)
        ));
    }

    #[tokio::test]
    async fn api_key_round_trip() {
        let ledger = Ledger::new(Arc::new(MemorySubstrate::new()), "test");
        let mux = AuthMultiplexer::new(
            Some("admin".into()),
            ledger.clone(),
            Arc::new(SessionStore::new()),
            5,
            Duration::from_secs(900),
            false,
        );

        let generated = apikey::generate();
        ledger
            .put_api_key(&ApiKeyRecord {
                key_id: generated.key_id.clone(),
                hashed_token: generated.hashed_token.clone(),
                name: "ci".into(),
                owner: "admin".into(),
                created_at: Utc::now(),
                expires_at: None,
                last_used_at: None,
                revoked: false,
            })
            .await
            .unwrap();

        let ctx = AuthContext {
            bearer: Some(generated.token.clone()),
            ip: Some(ip(3)),
            ..Default::default()
        };
        match mux.resolve(&ctx).await.unwrap() {
            Principal::ApiKey { key_id, .. } => assert_eq!(key_id, generated.key_id),
            other => panic!("expected ApiKey, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn revoked_api_key_is_rejected() {
        let ledger = Ledger::new(Arc::new(MemorySubstrate::new()), "test");
        let mux = AuthMultiplexer::new(
            None,
            ledger.clone(),
            Arc::new(SessionStore::new()),
            5,
            Duration::from_secs(900),
            false,
        );
        let generated = apikey::generate();
        ledger
            .put_api_key(&ApiKeyRecord {
                key_id: generated.key_id.clone(),
                hashed_token: generated.hashed_token.clone(),
                name: "old".into(),
                owner: "admin".into(),
                created_at: Utc::now(),
                expires_at: None,
                last_used_at: None,
                revoked: true,
            })
            .await
            .unwrap();

        let ctx = AuthContext {
            bearer: Some(generated.token),
            ip: Some(ip(4)),
            ..Default::default()
        };
        assert!(mux.resolve(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn wallet_signature_resolves_wallet() {
        let mux = multiplexer(None);
        let (address, sig) =
            wallet::tests::sign_challenge(&[21u8; 32], wallet::WALLET_CHALLENGE);
        let ctx = AuthContext {
            user_address: Some(address.clone()),
            wallet_signature: Some(sig),
            ip: Some(ip(5)),
            ..Default::default()
        };
        match mux.resolve(&ctx).await.unwrap() {
            Principal::Wallet { address: got } => assert_eq!(got, address),
            other => panic!("expected Wallet, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forged_wallet_signature_is_unauthenticated() {
        let mux = multiplexer(None);
        let (_, sig) = wallet::tests::sign_challenge(&[22u8; 32], wallet::WALLET_CHALLENGE);
        let ctx = AuthContext {
            user_address: Some("0x0000000000000000000000000000000000000042".into()),
            wallet_signature: Some(sig),
            ip: Some(ip(6)),
            ..Default::default()
        };
        assert!(matches!(
            mux.resolve(&ctx).await.unwrap_err(),
            CoreError::Unauthenticated(_)
        ));
    }

    #[tokio::test]
    async fn no_credentials_resolves_public() {
        let mux = multiplexer(Some("sekrit"));
        let ctx = AuthContext {
            ip: Some(ip(7)),
            ..Default::default()
        };
        assert!(matches!(
            mux.resolve(&ctx).await.unwrap(),
            Principal::Public
        ));
    }

    #[tokio::test]
    async fn repeated_failures_trip_the_window() {
        let ledger = Ledger::new(Arc::new(MemorySubstrate::new()), "test");
        let mux = AuthMultiplexer::new(
            Some("sekrit".into()),
            ledger,
            Arc::new(SessionStore::new()),
            3,
            Duration::from_secs(900),
            false,
        );
        let ctx = AuthContext {
            bearer: Some("wrong".into()),
            ip: Some(ip(8)),
            ..Default::default()
        };
        for _ in 0..3 {
            assert!(matches!(
                mux.resolve(&ctx).await.unwrap_err(),
                CoreError::Unauthenticated(_)
            ));
        }
        assert!(matches!(
            mux.resolve(&ctx).await.unwrap_err(),
            CoreError::RateLimited(_)
        ));
    }

    #[test]
    fn capability_table() {
        let admin = Principal::Admin;
        let key = Principal::ApiKey {
            key_id: "k".into(),
            name: "n".into(),
        };
        let wallet = Principal::Wallet {
            address: "0xabc".into(),
        };
        let public = Principal::Public;

        assert!(admin.can(Capability::AdminWrite));
        assert!(key.can(Capability::PinManage));
        assert!(!key.can(Capability::AdminWrite));
        assert!(wallet.can(Capability::Upload));
        assert!(!wallet.can(Capability::AdminRead));
        assert!(!public.can(Capability::Upload));

        assert_eq!(admin.owner_key(), Some("admin"));
        assert_eq!(wallet.owner_key(), Some("0xabc"));
        assert!(wallet.may_act_on("0xABC"));
        assert!(!wallet.may_act_on("0xdef"));
        assert!(admin.may_act_on("0xdef"));
    }
}
