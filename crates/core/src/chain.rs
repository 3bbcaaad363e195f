//! On-chain collaborator interface
//!
//! Settlement and event history live on chain; the relay only consumes a
//! narrow sync surface. The shipped implementation is a stub that reports
//! nothing; deployments wire a real client behind the same trait.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

/// A deal-related event observed on chain.
#[derive(Debug, Clone)]
pub struct DealEvent {
    pub deal_id: String,
    pub onchain_tx: String,
}

#[async_trait]
pub trait ChainSync: Send + Sync {
    /// Events since the last poll; used by the fast sync task.
    async fn recent_events(&self) -> Result<Vec<DealEvent>>;

    /// Authoritative on-chain state for one deal, if the chain knows it.
    async fn deal_state(&self, deal_id: &str) -> Result<Option<String>>;
}

/// No chain configured: both sync tasks become cheap no-ops.
pub struct NoopChainSync;

#[async_trait]
impl ChainSync for NoopChainSync {
    async fn recent_events(&self) -> Result<Vec<DealEvent>> {
        debug!("chain sync disabled; no events");
        Ok(Vec::new())
    }

    async fn deal_state(&self, _deal_id: &str) -> Result<Option<String>> {
        Ok(None)
    }
}
