//! Subscription management
//!
//! Purchase and renewal against the payment verifier, quota math, and the
//! aggregate usage view exposed with tier listings. Expiry never deletes
//! files; it only withholds the upload capability until renewal.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use shogun_ledger::{Ledger, Subscription};

use crate::error::{CoreError, Result};
use crate::governor::{QuotaGovernor, SubscriptionBudget};
use crate::payment::{PaymentOutcome, PaymentVerifier};
use crate::tiers::{SubscriptionTier, TierCatalog};

/// Relay-wide usage block attached to tier listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayUsage {
    pub used_bytes: u64,
    pub cap_bytes: u64,
    pub percent_used: f64,
    pub warn_threshold_percent: u8,
    pub warning: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierListing {
    pub tiers: Vec<SubscriptionTier>,
    pub relay: RelayUsage,
}

#[derive(Clone)]
pub struct SubscriptionManager {
    ledger: Ledger,
    catalog: Arc<TierCatalog>,
    verifier: Arc<dyn PaymentVerifier>,
    governor: QuotaGovernor,
    enabled: bool,
}

impl SubscriptionManager {
    pub fn new(
        ledger: Ledger,
        catalog: Arc<TierCatalog>,
        verifier: Arc<dyn PaymentVerifier>,
        governor: QuotaGovernor,
        enabled: bool,
    ) -> Self {
        Self {
            ledger,
            catalog,
            verifier,
            governor,
            enabled,
        }
    }

    pub async fn relay_usage(&self) -> Result<RelayUsage> {
        let used = self.ledger.live_bytes().await?;
        let cap = self.governor.relay_cap().unwrap_or(0);
        let percent = if cap > 0 {
            (used as f64 / cap as f64) * 100.0
        } else {
            0.0
        };
        let warn_at = self.governor.warn_threshold_percent();
        Ok(RelayUsage {
            used_bytes: used,
            cap_bytes: cap,
            percent_used: percent,
            warn_threshold_percent: warn_at,
            warning: cap > 0 && percent >= warn_at as f64,
        })
    }

    /// The catalog plus the relay's aggregate usage.
    pub async fn list_tiers(&self) -> Result<TierListing> {
        Ok(TierListing {
            tiers: self.catalog.subscription_tiers().to_vec(),
            relay: self.relay_usage().await?,
        })
    }

    pub async fn get(&self, addr: &str) -> Result<Option<Subscription>> {
        Ok(self.ledger.subscription(&addr.to_lowercase()).await?)
    }

    /// Purchase or extend. An active subscription extends from its current
    /// expiry; a lapsed one restarts from now. The storage limit never
    /// shrinks and used bytes are never reset here.
    pub async fn subscribe(
        &self,
        addr: &str,
        tier_id: &str,
        payment: &serde_json::Value,
    ) -> Result<Subscription> {
        if !self.enabled {
            return Err(CoreError::Disabled("subscriptions".into()));
        }
        let addr = addr.to_lowercase();
        let tier = self.catalog.subscription_tier(tier_id)?;

        let receipt = match self
            .verifier
            .verify(tier.price_atomic as u128, payment)
            .await?
        {
            PaymentOutcome::Settled { receipt } => receipt,
            PaymentOutcome::Insufficient => {
                return Err(CoreError::PaymentInvalid("payment insufficient".into()))
            }
            PaymentOutcome::Expired => {
                return Err(CoreError::PaymentInvalid("payment expired".into()))
            }
            PaymentOutcome::Fraudulent => {
                return Err(CoreError::PaymentInvalid("payment rejected".into()))
            }
        };

        let now = Utc::now();
        let duration = Duration::seconds(tier.duration_secs as i64);
        let updated = match self.ledger.subscription(&addr).await? {
            Some(existing) => {
                let base = if existing.is_active(now) {
                    existing.expires_at
                } else {
                    now
                };
                Subscription {
                    tier: tier.id.clone(),
                    storage_limit_bytes: existing.storage_limit_bytes.max(tier.storage_bytes),
                    storage_used_bytes: existing.storage_used_bytes,
                    purchased_at: existing.purchased_at,
                    expires_at: base + duration,
                    payment_receipt: receipt,
                }
            }
            None => Subscription {
                tier: tier.id.clone(),
                storage_limit_bytes: tier.storage_bytes,
                storage_used_bytes: 0,
                purchased_at: now,
                expires_at: now + duration,
                payment_receipt: receipt,
            },
        };
        self.ledger.put_subscription(&addr, &updated).await?;
        info!(addr, tier = %tier.id, expires = %updated.expires_at, "subscription written");
        Ok(updated)
    }

    /// Pre-flight admission check without reserving anything.
    pub async fn can_upload(&self, addr: &str, size_bytes: u64) -> Result<()> {
        let addr = addr.to_lowercase();
        let sub = self
            .ledger
            .subscription(&addr)
            .await?
            .filter(|s| s.is_active(Utc::now()))
            .ok_or_else(|| CoreError::PaymentRequired("no active subscription".into()))?;
        let live = self.ledger.live_bytes().await?;
        self.governor.preflight(
            Some(&addr),
            size_bytes,
            Some(&SubscriptionBudget {
                limit_bytes: sub.storage_limit_bytes,
                used_bytes: sub.storage_used_bytes,
            }),
            live,
        )
    }

    /// Admin-only full reset of a wallet's subscription row.
    pub async fn reset(&self, addr: &str) -> Result<()> {
        let addr = addr.to_lowercase();
        // Clearing means writing an already-expired, empty subscription.
        let now = Utc::now();
        let cleared = Subscription {
            tier: String::new(),
            storage_limit_bytes: 0,
            storage_used_bytes: 0,
            purchased_at: now,
            expires_at: now,
            payment_receipt: String::new(),
        };
        self.ledger.put_subscription(&addr, &cleared).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::StaticVerifier;
    use shogun_ledger::MemorySubstrate;

    fn manager(outcome: PaymentOutcome, cap: Option<u64>) -> (SubscriptionManager, Ledger) {
        let ledger = Ledger::new(Arc::new(MemorySubstrate::new()), "test");
        let manager = SubscriptionManager::new(
            ledger.clone(),
            Arc::new(TierCatalog::default_catalog()),
            Arc::new(StaticVerifier(outcome)),
            QuotaGovernor::new(cap, 80),
            true,
        );
        (manager, ledger)
    }

    fn settled() -> PaymentOutcome {
        PaymentOutcome::Settled {
            receipt: "rcpt".into(),
        }
    }

    #[tokio::test]
    async fn first_purchase_creates_subscription() {
        let (manager, _) = manager(settled(), None);
        let sub = manager
            .subscribe("0xABC", "basic", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(sub.tier, "basic");
        assert_eq!(sub.storage_used_bytes, 0);
        assert!(sub.is_active(Utc::now()));

        // Lookup is case-normalized.
        assert!(manager.get("0xabc").await.unwrap().is_some());
        assert!(manager.get("0xABC").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn renewal_extends_and_keeps_usage() {
        let (manager, ledger) = manager(settled(), None);
        let first = manager
            .subscribe("0xabc", "basic", &serde_json::json!({}))
            .await
            .unwrap();

        // Simulate usage before renewal.
        let mut used = first.clone();
        used.storage_used_bytes = 777;
        ledger.put_subscription("0xabc", &used).await.unwrap();

        let renewed = manager
            .subscribe("0xabc", "basic", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(renewed.storage_used_bytes, 777);
        assert!(renewed.expires_at > first.expires_at);
    }

    #[tokio::test]
    async fn upgrade_never_shrinks_the_limit() {
        let (manager, _) = manager(settled(), None);
        let premium = manager
            .subscribe("0xabc", "premium", &serde_json::json!({}))
            .await
            .unwrap();
        let after_basic = manager
            .subscribe("0xabc", "basic", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(
            after_basic.storage_limit_bytes,
            premium.storage_limit_bytes
        );
    }

    #[tokio::test]
    async fn rejected_payment_writes_nothing() {
        let (manager, ledger) = manager(PaymentOutcome::Insufficient, None);
        let err = manager
            .subscribe("0xabc", "basic", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PaymentInvalid(_)));
        assert!(ledger.subscription("0xabc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_tier_is_malformed() {
        let (manager, _) = manager(settled(), None);
        let err = manager
            .subscribe("0xabc", "platinum", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Malformed { .. }));
    }

    #[tokio::test]
    async fn can_upload_enforces_subscription_budget() {
        let (manager, ledger) = manager(settled(), None);
        manager
            .subscribe("0xabc", "basic", &serde_json::json!({}))
            .await
            .unwrap();
        assert!(manager.can_upload("0xabc", 1024).await.is_ok());

        let mut sub = ledger.subscription("0xabc").await.unwrap().unwrap();
        sub.storage_used_bytes = sub.storage_limit_bytes;
        ledger.put_subscription("0xabc", &sub).await.unwrap();
        assert!(matches!(
            manager.can_upload("0xabc", 1).await.unwrap_err(),
            CoreError::QuotaExceeded(_)
        ));
    }

    #[tokio::test]
    async fn no_subscription_means_payment_required() {
        let (manager, _) = manager(settled(), None);
        assert!(matches!(
            manager.can_upload("0xnobody", 1).await.unwrap_err(),
            CoreError::PaymentRequired(_)
        ));
    }
}
