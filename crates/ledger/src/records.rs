//! Ledger record types
//!
//! Serialized shapes of everything the relay persists in the substrate.
//! Field names are camelCase on the wire to match the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prepaid storage subscription, keyed by wallet address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub tier: String,
    pub storage_limit_bytes: u64,
    pub storage_used_bytes: u64,
    pub purchased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub payment_receipt: String,
}

impl Subscription {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Per-file storage deal lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DealStatus {
    Pending,
    Paid,
    Active,
    Expired,
    Terminated,
    Failed,
}

impl DealStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// The only legal moves of the deal state machine. Everything else is
    /// rejected at the single transition choke point in the deal manager.
    pub fn can_transition(self, next: DealStatus) -> bool {
        use DealStatus::*;
        matches!(
            (self, next),
            (Pending, Paid)
                | (Pending, Failed)
                | (Pending, Terminated)
                | (Paid, Active)
                | (Paid, Failed)
                | (Active, Expired)
                | (Active, Terminated)
                | (Active, Active)
                | (Expired, Active)
        )
    }
}

impl std::fmt::Display for DealStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A per-file storage contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    pub deal_id: String,
    pub cid: String,
    pub client_address: String,
    pub size_bytes: u64,
    pub tier: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    /// Price in atomic units, decimal string (u128 range).
    pub price_atomic: String,
    pub replication_factor: u32,
    pub status: DealStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_receipt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onchain_tx: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored object owned by one principal. Keyed by `{ownerKey, cid}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    pub cid: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub original_name: String,
    pub uploaded_at: DateTime<Utc>,
    /// Dedup handle: `{sha256-hex16}-{slug}` of the raw bytes. Never an
    /// address; the cid is the only public handle.
    pub content_id: String,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_directory_cid: Option<String>,
}

/// API key row; only the token hash persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub hashed_token: String,
    pub name: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
}

impl ApiKeyRecord {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at.map(|exp| now < exp).unwrap_or(true)
    }
}

/// Unauthenticated share link for one drive file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicLink {
    pub link_id: String,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
}

impl PublicLink {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at.map(|exp| now < exp).unwrap_or(true)
    }
}

/// Heartbeat record written under `relay/pulse/{host}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pulse {
    pub host: String,
    pub relay_address: String,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_bytes: Option<u64>,
    pub active_connections: u64,
    pub cap_used_bytes: u64,
    pub cap_total_bytes: u64,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    /// Relay-keypair signature over the serialized record body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deal_status_legal_transitions() {
        use DealStatus::*;
        assert!(Pending.can_transition(Paid));
        assert!(Pending.can_transition(Failed));
        assert!(Pending.can_transition(Terminated));
        assert!(Paid.can_transition(Active));
        assert!(Paid.can_transition(Failed));
        assert!(Active.can_transition(Expired));
        assert!(Active.can_transition(Active));
        assert!(Expired.can_transition(Active));
    }

    #[test]
    fn deal_status_illegal_transitions() {
        use DealStatus::*;
        assert!(!Pending.can_transition(Active));
        assert!(!Paid.can_transition(Expired));
        assert!(!Expired.can_transition(Paid));
        assert!(!Terminated.can_transition(Active));
        assert!(!Failed.can_transition(Pending));
        assert!(Terminated.is_terminal());
        assert!(Failed.is_terminal());
    }

    #[test]
    fn subscription_activity_window() {
        let now = Utc::now();
        let sub = Subscription {
            tier: "basic".into(),
            storage_limit_bytes: 1 << 30,
            storage_used_bytes: 0,
            purchased_at: now,
            expires_at: now + chrono::Duration::days(30),
            payment_receipt: "r".into(),
        };
        assert!(sub.is_active(now));
        assert!(!sub.is_active(now + chrono::Duration::days(31)));
    }

    #[test]
    fn records_serialize_camel_case() {
        let now = Utc::now();
        let upload = Upload {
            cid: "bafy".into(),
            size_bytes: 5,
            content_type: "text/plain".into(),
            original_name: "hello.txt".into(),
            uploaded_at: now,
            content_id: "abcd-hello-txt".into(),
            encrypted: false,
            parent_directory_cid: None,
        };
        let v = serde_json::to_value(&upload).unwrap();
        assert_eq!(v["sizeBytes"], 5);
        assert_eq!(v["originalName"], "hello.txt");
        assert!(v.get("parentDirectoryCid").is_none());
    }

    #[test]
    fn api_key_usability() {
        let now = Utc::now();
        let mut key = ApiKeyRecord {
            key_id: "k1".into(),
            hashed_token: "h".into(),
            name: "ci".into(),
            owner: "admin".into(),
            created_at: now,
            expires_at: Some(now + chrono::Duration::hours(1)),
            last_used_at: None,
            revoked: false,
        };
        assert!(key.is_usable(now));
        assert!(!key.is_usable(now + chrono::Duration::hours(2)));
        key.revoked = true;
        assert!(!key.is_usable(now));
    }
}
