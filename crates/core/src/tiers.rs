//! Tier catalog
//!
//! Preconfigured price/storage/duration bundles for subscriptions and
//! price-per-byte-second bounds for deals. Immutable for the lifetime of
//! the process.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

const KIB: u64 = 1024;
const GIB: u64 = 1024 * 1024 * 1024;
const DAY_SECS: u64 = 86_400;

/// Prepaid subscription bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionTier {
    pub id: String,
    /// Price in atomic payment units.
    pub price_atomic: u64,
    pub storage_bytes: u64,
    pub duration_secs: u64,
}

/// Per-file deal bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealTier {
    pub id: String,
    /// Atomic units per byte-second of retention.
    pub price_per_byte_second: f64,
    pub min_size: u64,
    pub max_size: u64,
    pub min_duration_secs: u64,
    pub max_duration_secs: u64,
    pub replication: u32,
}

#[derive(Debug, Clone)]
pub struct TierCatalog {
    subscription: Vec<SubscriptionTier>,
    deal: Vec<DealTier>,
}

impl TierCatalog {
    pub fn new(subscription: Vec<SubscriptionTier>, deal: Vec<DealTier>) -> Self {
        Self { subscription, deal }
    }

    /// The catalog a relay ships with when none is configured.
    pub fn default_catalog() -> Self {
        Self {
            subscription: vec![
                SubscriptionTier {
                    id: "basic".into(),
                    price_atomic: 1_000_000,
                    storage_bytes: GIB,
                    duration_secs: 30 * DAY_SECS,
                },
                SubscriptionTier {
                    id: "standard".into(),
                    price_atomic: 5_000_000,
                    storage_bytes: 10 * GIB,
                    duration_secs: 30 * DAY_SECS,
                },
                SubscriptionTier {
                    id: "premium".into(),
                    price_atomic: 20_000_000,
                    storage_bytes: 100 * GIB,
                    duration_secs: 30 * DAY_SECS,
                },
            ],
            deal: vec![
                DealTier {
                    id: "standard".into(),
                    price_per_byte_second: 1e-9,
                    min_size: KIB,
                    max_size: 10 * GIB,
                    min_duration_secs: DAY_SECS,
                    max_duration_secs: 365 * DAY_SECS,
                    replication: 1,
                },
                DealTier {
                    id: "premium".into(),
                    price_per_byte_second: 3e-9,
                    min_size: KIB,
                    max_size: 100 * GIB,
                    min_duration_secs: DAY_SECS,
                    max_duration_secs: 365 * DAY_SECS,
                    replication: 3,
                },
            ],
        }
    }

    pub fn subscription_tiers(&self) -> &[SubscriptionTier] {
        &self.subscription
    }

    pub fn deal_tiers(&self) -> &[DealTier] {
        &self.deal
    }

    pub fn subscription_tier(&self, id: &str) -> Result<&SubscriptionTier> {
        self.subscription
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| CoreError::malformed(format!("unknown subscription tier: {id}")))
    }

    pub fn deal_tier(&self, id: &str) -> Result<&DealTier> {
        self.deal
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| CoreError::malformed(format!("unknown deal tier: {id}")))
    }
}

/// `ceil(size × duration × price_per_byte_second × replication)` in atomic
/// units. Saturates far above any configurable tier.
pub fn deal_price_atomic(size_bytes: u64, duration_secs: u64, tier: &DealTier) -> u128 {
    let raw = size_bytes as f64
        * duration_secs as f64
        * tier.price_per_byte_second
        * tier.replication as f64;
    raw.ceil().max(0.0) as u128
}
