//! Deal lifecycle
//!
//! Per-file storage contracts move through the pending → paid → active →
//! expired/terminated machine. Every move funnels through one transition
//! choke point; anything the table in `DealStatus::can_transition` does
//! not allow is rejected there.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

use shogun_ipfs::IpfsClient;
use shogun_ledger::{Deal, DealStatus, Ledger};

use crate::error::{CoreError, Result};
use crate::keypair::RelayKeypair;
use crate::payment::{PaymentOutcome, PaymentVerifier};
use crate::tiers::{deal_price_atomic, TierCatalog};

/// Request body for deal creation.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDealRequest {
    pub cid: String,
    pub client_address: String,
    pub size_bytes: u64,
    pub duration_secs: u64,
    pub tier: String,
}

/// Proof-of-storage signal returned by `verify`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageProof {
    pub deal_id: String,
    pub cid: String,
    pub verified: bool,
    pub exists: bool,
    pub pinned: bool,
    pub proof_hash: String,
    pub timestamp: i64,
    pub size_bytes: u64,
    pub freshness_secs: u64,
    pub relay_address: String,
    pub signature: String,
}

#[derive(Clone)]
pub struct DealManager {
    ledger: Ledger,
    ipfs: IpfsClient,
    catalog: Arc<TierCatalog>,
    verifier: Arc<dyn PaymentVerifier>,
    keypair: Arc<RelayKeypair>,
    grace: Duration,
    proof_freshness_secs: u64,
    enabled: bool,
}

impl DealManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Ledger,
        ipfs: IpfsClient,
        catalog: Arc<TierCatalog>,
        verifier: Arc<dyn PaymentVerifier>,
        keypair: Arc<RelayKeypair>,
        grace_secs: u64,
        proof_freshness_secs: u64,
        enabled: bool,
    ) -> Self {
        Self {
            ledger,
            ipfs,
            catalog,
            verifier,
            keypair,
            grace: Duration::seconds(grace_secs as i64),
            proof_freshness_secs,
            enabled,
        }
    }

    fn require_enabled(&self) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(CoreError::Disabled("deals".into()))
        }
    }

    fn new_deal_id() -> String {
        let mut raw = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        hex::encode(raw)
    }

    /// The single transition choke point.
    async fn transition(&self, deal: &mut Deal, next: DealStatus) -> Result<()> {
        if !deal.status.can_transition(next) {
            return Err(CoreError::Conflict(format!(
                "deal {} cannot move {} -> {}",
                deal.deal_id, deal.status, next
            )));
        }
        info!(deal_id = %deal.deal_id, from = %deal.status, to = %next, "deal transition");
        deal.status = next;
        deal.updated_at = Utc::now();
        self.ledger.put_deal(deal).await?;
        Ok(())
    }

    async fn load(&self, deal_id: &str) -> Result<Deal> {
        self.ledger
            .deal(deal_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("deal {deal_id}")))
    }

    /// Validates bounds, prices the contract, writes it `pending`.
    pub async fn create(&self, req: CreateDealRequest) -> Result<Deal> {
        self.require_enabled()?;
        let tier = self.catalog.deal_tier(&req.tier)?;
        if req.size_bytes < tier.min_size || req.size_bytes > tier.max_size {
            return Err(CoreError::malformed(format!(
                "size {} outside tier bounds [{}, {}]",
                req.size_bytes, tier.min_size, tier.max_size
            )));
        }
        if req.duration_secs < tier.min_duration_secs || req.duration_secs > tier.max_duration_secs
        {
            return Err(CoreError::malformed(format!(
                "duration {}s outside tier bounds [{}s, {}s]",
                req.duration_secs, tier.min_duration_secs, tier.max_duration_secs
            )));
        }
        if req.cid.is_empty() {
            return Err(CoreError::malformed("deal without a cid"));
        }

        let price = deal_price_atomic(req.size_bytes, req.duration_secs, tier);
        let now = Utc::now();
        let deal = Deal {
            deal_id: Self::new_deal_id(),
            cid: req.cid,
            client_address: req.client_address.to_lowercase(),
            size_bytes: req.size_bytes,
            tier: tier.id.clone(),
            start_at: now,
            end_at: now + Duration::seconds(req.duration_secs as i64),
            price_atomic: price.to_string(),
            replication_factor: tier.replication,
            status: DealStatus::Pending,
            payment_receipt: None,
            onchain_tx: None,
            created_at: now,
            updated_at: now,
        };
        self.ledger.put_deal(&deal).await?;
        info!(deal_id = %deal.deal_id, price = %deal.price_atomic, "deal created");
        Ok(deal)
    }

    fn price_of(deal: &Deal) -> Result<u128> {
        deal.price_atomic
            .parse()
            .map_err(|_| CoreError::invariant("deal", "unparseable stored price"))
    }

    async fn settle(&self, deal: &Deal, payment: &serde_json::Value) -> Result<String> {
        match self.verifier.verify(Self::price_of(deal)?, payment).await? {
            PaymentOutcome::Settled { receipt } => Ok(receipt),
            PaymentOutcome::Insufficient => {
                Err(CoreError::PaymentInvalid("payment insufficient".into()))
            }
            PaymentOutcome::Expired => Err(CoreError::PaymentInvalid("payment expired".into())),
            PaymentOutcome::Fraudulent => Err(CoreError::PaymentInvalid("payment rejected".into())),
        }
    }

    /// Payment verified → `paid`; content confirmed pinned → `active`.
    /// A pin that cannot be confirmed fails the deal.
    pub async fn activate(
        &self,
        deal_id: &str,
        requester: &str,
        payment: &serde_json::Value,
    ) -> Result<Deal> {
        self.require_enabled()?;
        let mut deal = self.load(deal_id).await?;
        if !deal.client_address.eq_ignore_ascii_case(requester) {
            return Err(CoreError::Forbidden("deal belongs to another client".into()));
        }
        // Settlement is real money; refuse before the verifier runs.
        if deal.status != DealStatus::Pending {
            return Err(CoreError::Conflict(format!(
                "deal {deal_id} is {} and cannot be activated",
                deal.status
            )));
        }

        match self.settle(&deal, payment).await {
            Ok(receipt) => {
                deal.payment_receipt = Some(receipt);
                self.transition(&mut deal, DealStatus::Paid).await?;
            }
            Err(e @ CoreError::PaymentInvalid(_)) => {
                self.transition(&mut deal, DealStatus::Failed).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        // Confirm the content is pinned, pinning on demand when absent.
        match self.ipfs.pin(&deal.cid, None).await {
            Ok(()) => {
                let duration = deal.end_at - deal.start_at;
                let now = Utc::now();
                deal.start_at = now;
                deal.end_at = now + duration;
                self.transition(&mut deal, DealStatus::Active).await?;
                Ok(deal)
            }
            Err(e) => {
                warn!(deal_id, error = %e, "pin confirmation failed");
                self.transition(&mut deal, DealStatus::Failed).await?;
                Err(CoreError::Transient(format!(
                    "could not confirm pin for deal {deal_id}: {e}"
                )))
            }
        }
    }

    /// Extends an active deal, or revives an expired one inside the grace
    /// window, against a fresh payment for the added duration.
    pub async fn renew(
        &self,
        deal_id: &str,
        requester: &str,
        duration_secs: u64,
        payment: &serde_json::Value,
    ) -> Result<Deal> {
        self.require_enabled()?;
        let mut deal = self.load(deal_id).await?;
        if !deal.client_address.eq_ignore_ascii_case(requester) {
            return Err(CoreError::Forbidden("deal belongs to another client".into()));
        }
        let now = Utc::now();
        if !matches!(deal.status, DealStatus::Active | DealStatus::Expired) {
            return Err(CoreError::Conflict(format!(
                "deal {deal_id} is {} and cannot be renewed",
                deal.status
            )));
        }
        if deal.status == DealStatus::Expired && now > deal.end_at + self.grace {
            return Err(CoreError::Conflict("renewal grace window elapsed".into()));
        }

        let tier = self.catalog.deal_tier(&deal.tier)?;
        if duration_secs < tier.min_duration_secs || duration_secs > tier.max_duration_secs {
            return Err(CoreError::malformed("renewal duration outside tier bounds"));
        }
        let price = deal_price_atomic(deal.size_bytes, duration_secs, tier);
        let mut priced = deal.clone();
        priced.price_atomic = price.to_string();
        let receipt = self.settle(&priced, payment).await?;

        deal.payment_receipt = Some(receipt);
        deal.end_at = deal.end_at.max(now) + Duration::seconds(duration_secs as i64);
        self.transition(&mut deal, DealStatus::Active).await?;
        Ok(deal)
    }

    /// Client cancel inside the grace window, or admin termination.
    pub async fn terminate(&self, deal_id: &str, requester: &str, is_admin: bool) -> Result<Deal> {
        self.require_enabled()?;
        let mut deal = self.load(deal_id).await?;
        if !is_admin {
            if !deal.client_address.eq_ignore_ascii_case(requester) {
                return Err(CoreError::Forbidden("deal belongs to another client".into()));
            }
            if deal.status != DealStatus::Pending {
                return Err(CoreError::Conflict(
                    "clients may only cancel pending deals".into(),
                ));
            }
            if Utc::now() > deal.created_at + self.grace {
                return Err(CoreError::Conflict("cancellation window elapsed".into()));
            }
        }
        self.transition(&mut deal, DealStatus::Terminated).await?;
        Ok(deal)
    }

    pub async fn get(&self, deal_id: &str) -> Result<Deal> {
        self.load(deal_id).await
    }

    pub async fn deals_for(&self, addr: &str) -> Result<Vec<Deal>> {
        Ok(self.ledger.deals_by_client(&addr.to_lowercase()).await?)
    }

    /// Proof-of-storage signal: store existence, pinned status, and a
    /// relay-signed keyed hash fresh for the configured window.
    pub async fn verify(&self, deal_id: &str, challenge: Option<&str>) -> Result<StorageProof> {
        self.require_enabled()?;
        let deal = self.load(deal_id).await?;
        let exists = self.ipfs.has_local(&deal.cid).await.unwrap_or(false);
        let pinned = self
            .ipfs
            .pin_ls(shogun_ipfs::PinType::All)
            .await
            .map(|pins| pins.iter().any(|p| p == &deal.cid))
            .unwrap_or(false);

        let timestamp = Utc::now().timestamp();
        let challenge = challenge.unwrap_or("");
        let mut hasher = Sha256::new();
        hasher.update(deal.cid.as_bytes());
        hasher.update(challenge.as_bytes());
        hasher.update(timestamp.to_string().as_bytes());
        hasher.update(deal.size_bytes.to_string().as_bytes());
        let proof_hash = hex::encode(hasher.finalize());
        let signature = self.keypair.sign(proof_hash.as_bytes());

        Ok(StorageProof {
            deal_id: deal.deal_id,
            cid: deal.cid,
            verified: exists && pinned && deal.status == DealStatus::Active,
            exists,
            pinned,
            proof_hash,
            timestamp,
            size_bytes: deal.size_bytes,
            freshness_secs: self.proof_freshness_secs,
            relay_address: self.keypair.address().to_string(),
            signature,
        })
    }

    /// Scheduler hook: expires overdue active deals and fails pending
    /// deals abandoned past the grace window. Returns the touched count.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut touched = 0;
        for mut deal in self.ledger.all_deals().await? {
            match deal.status {
                DealStatus::Active if now >= deal.end_at => {
                    self.transition(&mut deal, DealStatus::Expired).await?;
                    touched += 1;
                }
                DealStatus::Pending if now > deal.created_at + self.grace => {
                    self.transition(&mut deal, DealStatus::Failed).await?;
                    touched += 1;
                }
                _ => {}
            }
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::StaticVerifier;
    use shogun_ledger::MemorySubstrate;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn mock_store() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/pin/add"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"Pins":["x"]}"#))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v0/block/stat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"Key":"x","Size":100}"#))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v0/pin/ls"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"Keys":{"bafydeal":{"Type":"recursive"}}}"#),
            )
            .mount(&server)
            .await;
        server
    }

    fn manager_with(server: &MockServer, outcome: PaymentOutcome, dir: &tempfile::TempDir) -> DealManager {
        let ledger = Ledger::new(Arc::new(MemorySubstrate::new()), "test");
        let keypair =
            Arc::new(RelayKeypair::load_or_generate(dir.path().join("key.json")).unwrap());
        DealManager::new(
            ledger,
            IpfsClient::new(server.uri()),
            Arc::new(TierCatalog::default_catalog()),
            Arc::new(StaticVerifier(outcome)),
            keypair,
            86_400,
            300,
            true,
        )
    }

    fn settled() -> PaymentOutcome {
        PaymentOutcome::Settled {
            receipt: "rcpt".into(),
        }
    }

    fn request(size: u64, duration_days: u64) -> CreateDealRequest {
        CreateDealRequest {
            cid: "bafydeal".into(),
            client_address: "0xABC".into(),
            size_bytes: size,
            duration_secs: duration_days * 86_400,
            tier: "standard".into(),
        }
    }

    // -----------------------------------------------------------------------
    // Creation and pricing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn create_prices_and_stores_pending() {
        let server = mock_store().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&server, settled(), &dir);

        let deal = manager.create(request(104_857_600, 30)).await.unwrap();
        assert_eq!(deal.status, DealStatus::Pending);
        assert_eq!(deal.client_address, "0xabc");
        // 104857600 * 2592000 * 1e-9 rounded up.
        assert_eq!(deal.price_atomic, "271791");
        assert_eq!(deal.deal_id.len(), 32);
    }

    #[tokio::test]
    async fn create_rejects_out_of_bounds() {
        let server = mock_store().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&server, settled(), &dir);

        // Too small for the tier.
        assert!(manager.create(request(10, 30)).await.is_err());
        // Too long for the tier.
        assert!(manager.create(request(1 << 20, 400)).await.is_err());
        // Unknown tier.
        let mut req = request(1 << 20, 30);
        req.tier = "bogus".into();
        assert!(manager.create(req).await.is_err());
    }

    // -----------------------------------------------------------------------
    // Activation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn activation_moves_pending_to_active() {
        let server = mock_store().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&server, settled(), &dir);

        let deal = manager.create(request(1 << 20, 30)).await.unwrap();
        let active = manager
            .activate(&deal.deal_id, "0xabc", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(active.status, DealStatus::Active);
        assert_eq!(active.payment_receipt.as_deref(), Some("rcpt"));
        assert!(active.end_at > active.start_at);
    }

    #[tokio::test]
    async fn activation_by_stranger_is_forbidden() {
        let server = mock_store().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&server, settled(), &dir);

        let deal = manager.create(request(1 << 20, 30)).await.unwrap();
        let err = manager
            .activate(&deal.deal_id, "0xother", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }

    #[tokio::test]
    async fn rejected_payment_fails_the_deal() {
        let server = mock_store().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&server, PaymentOutcome::Insufficient, &dir);

        let deal = manager.create(request(1 << 20, 30)).await.unwrap();
        let err = manager
            .activate(&deal.deal_id, "0xabc", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PaymentInvalid(_)));
        assert_eq!(
            manager.get(&deal.deal_id).await.unwrap().status,
            DealStatus::Failed
        );
    }

    #[tokio::test]
    async fn double_activation_is_a_conflict() {
        let server = mock_store().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&server, settled(), &dir);

        let deal = manager.create(request(1 << 20, 30)).await.unwrap();
        manager
            .activate(&deal.deal_id, "0xabc", &serde_json::json!({}))
            .await
            .unwrap();
        let err = manager
            .activate(&deal.deal_id, "0xabc", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    // -----------------------------------------------------------------------
    // Termination and sweep
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn client_cancels_pending_within_grace() {
        let server = mock_store().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&server, settled(), &dir);

        let deal = manager.create(request(1 << 20, 30)).await.unwrap();
        let terminated = manager
            .terminate(&deal.deal_id, "0xabc", false)
            .await
            .unwrap();
        assert_eq!(terminated.status, DealStatus::Terminated);

        // Terminal states never transition again.
        let err = manager
            .activate(&deal.deal_id, "0xabc", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn client_cannot_cancel_active_deals() {
        let server = mock_store().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&server, settled(), &dir);

        let deal = manager.create(request(1 << 20, 30)).await.unwrap();
        manager
            .activate(&deal.deal_id, "0xabc", &serde_json::json!({}))
            .await
            .unwrap();
        let err = manager
            .terminate(&deal.deal_id, "0xabc", false)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        // The admin can.
        let terminated = manager.terminate(&deal.deal_id, "", true).await.unwrap();
        assert_eq!(terminated.status, DealStatus::Terminated);
    }

    #[tokio::test]
    async fn sweep_expires_overdue_deals() {
        let server = mock_store().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&server, settled(), &dir);

        let deal = manager.create(request(1 << 20, 30)).await.unwrap();
        manager
            .activate(&deal.deal_id, "0xabc", &serde_json::json!({}))
            .await
            .unwrap();

        // Nothing due yet.
        assert_eq!(manager.sweep(Utc::now()).await.unwrap(), 0);
        // Past endAt the deal expires.
        let touched = manager
            .sweep(Utc::now() + Duration::days(31))
            .await
            .unwrap();
        assert_eq!(touched, 1);
        assert_eq!(
            manager.get(&deal.deal_id).await.unwrap().status,
            DealStatus::Expired
        );
    }

    // -----------------------------------------------------------------------
    // Proofs
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn verify_produces_signed_fresh_proof() {
        let server = mock_store().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&server, settled(), &dir);

        let deal = manager.create(request(1 << 20, 30)).await.unwrap();
        manager
            .activate(&deal.deal_id, "0xabc", &serde_json::json!({}))
            .await
            .unwrap();

        let proof = manager.verify(&deal.deal_id, Some("abc")).await.unwrap();
        assert!(proof.verified);
        assert!(proof.exists);
        assert!(proof.pinned);
        assert_eq!(proof.freshness_secs, 300);

        // The hash matches the documented recipe.
        let mut hasher = Sha256::new();
        hasher.update(proof.cid.as_bytes());
        hasher.update(b"abc");
        hasher.update(proof.timestamp.to_string().as_bytes());
        hasher.update(proof.size_bytes.to_string().as_bytes());
        assert_eq!(proof.proof_hash, hex::encode(hasher.finalize()));
        assert!(proof.signature.starts_with("0x"));
    }
}
