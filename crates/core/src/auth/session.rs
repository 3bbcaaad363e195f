//! Admin sessions
//!
//! Opaque 128-bit tokens with a 24-hour lifetime. With `strict_session_ip`
//! a session only resolves from the IP that created it. The scheduler's
//! reaper evicts expired and idle sessions.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

/// Sessions expire 24 h after creation.
const SESSION_TTL_HOURS: i64 = 24;
/// Sessions idle longer than this are reaped early.
const SESSION_IDLE_HOURS: i64 = 6;

#[derive(Debug, Clone)]
struct Session {
    ip: IpAddr,
    created_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a new session bound to `ip`; returns the opaque token.
    pub fn issue(&self, ip: IpAddr) -> String {
        let mut raw = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let token = hex::encode(raw);
        let now = Utc::now();
        self.sessions
            .lock()
            .expect("session store lock")
            .insert(
                token.clone(),
                Session {
                    ip,
                    created_at: now,
                    last_seen: now,
                },
            );
        token
    }

    /// Validates a presented token, refreshing its last-seen stamp.
    pub fn validate(&self, token: &str, ip: IpAddr, strict_ip: bool) -> bool {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().expect("session store lock");
        match sessions.get_mut(token) {
            Some(session) => {
                if now - session.created_at > Duration::hours(SESSION_TTL_HOURS) {
                    sessions.remove(token);
                    return false;
                }
                if strict_ip && session.ip != ip {
                    return false;
                }
                session.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn revoke(&self, token: &str) {
        self.sessions
            .lock()
            .expect("session store lock")
            .remove(token);
    }

    /// Evicts sessions past TTL or idle beyond the threshold. Returns the
    /// eviction count for the reaper's log line.
    pub fn reap(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock().expect("session store lock");
        let before = sessions.len();
        sessions.retain(|_, s| {
            now - s.created_at <= Duration::hours(SESSION_TTL_HOURS)
                && now - s.last_seen <= Duration::hours(SESSION_IDLE_HOURS)
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn issue_then_validate() {
        let store = SessionStore::new();
        let token = store.issue(ip(1));
        assert!(store.validate(&token, ip(1), false));
        assert!(!store.validate("unknown", ip(1), false));
    }

    #[test]
    fn strict_ip_binding() {
        let store = SessionStore::new();
        let token = store.issue(ip(1));
        assert!(!store.validate(&token, ip(2), true));
        // Non-strict mode tolerates a roaming client.
        assert!(store.validate(&token, ip(2), false));
    }

    #[test]
    fn revoke_invalidates() {
        let store = SessionStore::new();
        let token = store.issue(ip(1));
        store.revoke(&token);
        assert!(!store.validate(&token, ip(1), false));
    }

    #[test]
    fn reap_evicts_old_sessions() {
        let store = SessionStore::new();
        let _token = store.issue(ip(1));
        assert_eq!(store.reap(Utc::now()), 0);
        let evicted = store.reap(Utc::now() + Duration::hours(25));
        assert_eq!(evicted, 1);
        assert!(store.is_empty());
    }
}
