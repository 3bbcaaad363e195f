//! Relay configuration
//!
//! Loaded from the environment through the `config` crate; every field has
//! a default so a bare `shogun-relay` starts against local collaborators.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Listen host for the HTTP surface.
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Ledger substrate root (env: `DATA_DIR`).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Drive root; only the storage adapter writes here.
    #[serde(default = "default_drive_root")]
    pub drive_root: String,

    /// Storage backend selection: `local` or `s3`.
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,

    #[serde(default)]
    pub s3_bucket: Option<String>,

    #[serde(default)]
    pub s3_prefix: Option<String>,

    /// Kubo RPC API endpoint.
    #[serde(default = "default_ipfs_api_url")]
    pub ipfs_api_url: String,

    #[serde(default = "default_ipfs_call_timeout_secs")]
    pub ipfs_call_timeout_secs: u64,

    /// Pin additions may fetch remote blocks; they get a longer deadline.
    #[serde(default = "default_ipfs_pin_timeout_secs")]
    pub ipfs_pin_timeout_secs: u64,

    /// Shared admin bearer token. Unset disables admin auth entirely.
    #[serde(default)]
    pub admin_token: Option<String>,

    /// Global relay cap in bytes; 0 disables the cap.
    #[serde(default)]
    pub relay_cap_bytes: u64,

    /// Hard maximum request size for uploads.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Conservative reservation when `Content-Length` is absent.
    #[serde(default = "default_reserve_bytes")]
    pub default_reserve_bytes: u64,

    /// Cap-usage percentage at which tier listings start warning.
    #[serde(default = "default_warn_threshold_percent")]
    pub warn_threshold_percent: u8,

    /// Bind sessions to the IP that created them.
    #[serde(default)]
    pub strict_session_ip: bool,

    /// Relay signing keypair location (0600, persisted across restarts).
    #[serde(default = "default_keypair_path")]
    pub keypair_path: String,

    /// x402-style payment facilitator; unset rejects all paid flows.
    #[serde(default)]
    pub facilitator_url: Option<String>,

    /// Grace window for deal cancellation/renewal.
    #[serde(default = "default_deal_grace_secs")]
    pub deal_grace_secs: u64,

    /// Freshness window of storage proofs.
    #[serde(default = "default_proof_freshness_secs")]
    pub proof_freshness_secs: u64,

    // -- scheduler intervals ----------------------------------------------
    #[serde(default = "default_deal_fast_sync_secs")]
    pub deal_fast_sync_secs: u64,

    #[serde(default = "default_deal_full_sync_secs")]
    pub deal_full_sync_secs: u64,

    #[serde(default = "default_orphan_sweep_secs")]
    pub orphan_sweep_secs: u64,

    /// Orphaned pins younger than this survive the sweep.
    #[serde(default = "default_orphan_max_age_secs")]
    pub orphan_max_age_secs: u64,

    #[serde(default = "default_link_expiry_secs")]
    pub link_expiry_secs: u64,

    #[serde(default = "default_reconcile_secs")]
    pub reconcile_secs: u64,

    #[serde(default = "default_session_reap_secs")]
    pub session_reap_secs: u64,

    #[serde(default = "default_pulse_secs")]
    pub pulse_secs: u64,

    // -- rate limits -------------------------------------------------------
    #[serde(default = "default_global_rate_limit")]
    pub global_rate_limit: usize,

    #[serde(default = "default_global_rate_window_secs")]
    pub global_rate_window_secs: u64,

    #[serde(default = "default_upload_rate_limit")]
    pub upload_rate_limit: usize,

    #[serde(default = "default_upload_rate_window_secs")]
    pub upload_rate_window_secs: u64,

    #[serde(default = "default_auth_failure_limit")]
    pub auth_failure_limit: usize,

    #[serde(default = "default_auth_failure_window_secs")]
    pub auth_failure_window_secs: u64,

    // -- module toggles ----------------------------------------------------
    #[serde(default = "default_true")]
    pub enable_uploads: bool,

    #[serde(default = "default_true")]
    pub enable_subscriptions: bool,

    #[serde(default = "default_true")]
    pub enable_deals: bool,

    #[serde(default = "default_true")]
    pub enable_drive: bool,

    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8765
}
fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_drive_root() -> String {
    "./drive".to_string()
}
fn default_storage_backend() -> String {
    "local".to_string()
}
fn default_ipfs_api_url() -> String {
    "http://127.0.0.1:5001".to_string()
}
fn default_ipfs_call_timeout_secs() -> u64 {
    30
}
fn default_ipfs_pin_timeout_secs() -> u64 {
    120
}
fn default_max_upload_bytes() -> u64 {
    100 * 1024 * 1024
}
fn default_reserve_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_warn_threshold_percent() -> u8 {
    80
}
fn default_keypair_path() -> String {
    "./data/relay-key.json".to_string()
}
fn default_deal_grace_secs() -> u64 {
    86_400
}
fn default_proof_freshness_secs() -> u64 {
    300
}
fn default_deal_fast_sync_secs() -> u64 {
    120
}
fn default_deal_full_sync_secs() -> u64 {
    300
}
fn default_orphan_sweep_secs() -> u64 {
    3_600
}
fn default_orphan_max_age_secs() -> u64 {
    3_600
}
fn default_link_expiry_secs() -> u64 {
    300
}
fn default_reconcile_secs() -> u64 {
    3_600
}
fn default_session_reap_secs() -> u64 {
    300
}
fn default_pulse_secs() -> u64 {
    10
}
fn default_global_rate_limit() -> usize {
    1_000
}
fn default_global_rate_window_secs() -> u64 {
    900
}
fn default_upload_rate_limit() -> usize {
    100
}
fn default_upload_rate_window_secs() -> u64 {
    3_600
}
fn default_auth_failure_limit() -> usize {
    5
}
fn default_auth_failure_window_secs() -> u64 {
    900
}
fn default_true() -> bool {
    true
}

impl Default for RelayConfig {
    fn default() -> Self {
        // All fields default, so an empty JSON object deserializes cleanly.
        serde_json::from_value(serde_json::json!({}))
            .expect("default config must deserialize")
    }
}

impl RelayConfig {
    pub fn load() -> std::result::Result<Self, config::ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        cfg.try_deserialize()
    }

    /// Convenience constructor from environment variables.
    pub fn from_env() -> std::result::Result<Self, config::ConfigError> {
        Self::load()
    }

    pub fn relay_cap(&self) -> Option<u64> {
        (self.relay_cap_bytes > 0).then_some(self.relay_cap_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.port, 8765);
        assert_eq!(cfg.max_upload_bytes, 100 * 1024 * 1024);
        assert_eq!(cfg.ipfs_pin_timeout_secs, 120);
        assert_eq!(cfg.auth_failure_limit, 5);
        assert!(cfg.enable_uploads);
        assert!(cfg.relay_cap().is_none());
    }

    #[test]
    fn cap_zero_means_disabled() {
        let mut cfg = RelayConfig::default();
        assert!(cfg.relay_cap().is_none());
        cfg.relay_cap_bytes = 1024;
        assert_eq!(cfg.relay_cap(), Some(1024));
    }
}
