//! Shared application state

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use shogun_core::auth::session::SessionStore;
use shogun_core::auth::AuthMultiplexer;
use shogun_core::chain::{ChainSync, NoopChainSync};
use shogun_core::deal::DealManager;
use shogun_core::governor::QuotaGovernor;
use shogun_core::keypair::RelayKeypair;
use shogun_core::payment::{DisabledVerifier, HttpFacilitator, PaymentVerifier};
use shogun_core::pipeline::UploadPipeline;
use shogun_core::scheduler::{spawn_relay_tasks, Scheduler, TaskDeps, TaskIntervals};
use shogun_core::subscription::SubscriptionManager;
use shogun_core::tiers::TierCatalog;
use shogun_core::{CoreError, RelayConfig};
use shogun_ipfs::IpfsClient;
use shogun_ledger::{Ledger, Substrate};
use shogun_storage::StorageBackend;

/// Everything the handlers reach for. Built once at startup; tests build
/// independent instances against in-memory collaborators.
pub struct AppState {
    pub config: RelayConfig,
    pub ledger: Ledger,
    pub storage: Arc<dyn StorageBackend>,
    pub ipfs: IpfsClient,
    pub auth: AuthMultiplexer,
    pub pipeline: UploadPipeline,
    pub subscriptions: SubscriptionManager,
    pub deals: DealManager,
    pub governor: QuotaGovernor,
    pub keypair: Arc<RelayKeypair>,
    pub sessions: Arc<SessionStore>,
    pub chain: Arc<dyn ChainSync>,
    pub active_connections: Arc<AtomicU64>,
    pub started_at: Instant,
    pub version: String,
}

impl AppState {
    /// Wires the component graph from explicit collaborators so tests can
    /// swap any of them.
    pub fn build(
        config: RelayConfig,
        substrate: Arc<dyn Substrate>,
        storage: Arc<dyn StorageBackend>,
        verifier: Arc<dyn PaymentVerifier>,
        chain: Arc<dyn ChainSync>,
    ) -> Result<Self, CoreError> {
        let writer_id = format!("{}:{}", config.host, config.port);
        let ledger = Ledger::new(substrate, writer_id);

        let ipfs = IpfsClient::new(&config.ipfs_api_url).with_timeouts(
            Duration::from_secs(config.ipfs_call_timeout_secs),
            Duration::from_secs(config.ipfs_pin_timeout_secs),
        );

        let governor = QuotaGovernor::new(config.relay_cap(), config.warn_threshold_percent);
        let catalog = Arc::new(TierCatalog::default_catalog());
        let keypair = Arc::new(RelayKeypair::load_or_generate(&config.keypair_path)?);
        let sessions = Arc::new(SessionStore::new());

        let auth = AuthMultiplexer::new(
            config.admin_token.clone(),
            ledger.clone(),
            Arc::clone(&sessions),
            config.auth_failure_limit,
            Duration::from_secs(config.auth_failure_window_secs),
            config.strict_session_ip,
        );

        let pipeline = UploadPipeline::new(
            ledger.clone(),
            Arc::clone(&storage),
            ipfs.clone(),
            governor.clone(),
            config.max_upload_bytes,
            config.default_reserve_bytes,
            config.enable_uploads,
        );

        let subscriptions = SubscriptionManager::new(
            ledger.clone(),
            Arc::clone(&catalog),
            Arc::clone(&verifier),
            governor.clone(),
            config.enable_subscriptions,
        );

        let deals = DealManager::new(
            ledger.clone(),
            ipfs.clone(),
            Arc::clone(&catalog),
            verifier,
            Arc::clone(&keypair),
            config.deal_grace_secs,
            config.proof_freshness_secs,
            config.enable_deals,
        );

        Ok(Self {
            config,
            ledger,
            storage,
            ipfs,
            auth,
            pipeline,
            subscriptions,
            deals,
            governor,
            keypair,
            sessions,
            chain,
            active_connections: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Production wiring: sled substrate, configured storage backend, and
    /// the configured facilitator (or none).
    pub async fn from_config(config: RelayConfig) -> Result<Self, CoreError> {
        let substrate: Arc<dyn Substrate> = Arc::new(
            shogun_ledger::SledSubstrate::open(std::path::Path::new(&config.data_dir).join("ledger"))
                .map_err(|e| CoreError::Backend(e.to_string()))?,
        );

        let storage: Arc<dyn StorageBackend> = match config.storage_backend.as_str() {
            "s3" => {
                let bucket = config
                    .s3_bucket
                    .clone()
                    .ok_or_else(|| CoreError::malformed("s3 backend requires s3_bucket"))?;
                let sdk = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                let client = aws_sdk_s3::Client::new(&sdk);
                Arc::new(shogun_storage::S3Compatible::new(
                    client,
                    bucket,
                    config.s3_prefix.clone().unwrap_or_default(),
                    std::path::Path::new(&config.data_dir).join("spool"),
                ))
            }
            _ => Arc::new(
                shogun_storage::LocalFs::new(&config.drive_root)
                    .await
                    .map_err(CoreError::from)?,
            ),
        };

        let verifier: Arc<dyn PaymentVerifier> = match &config.facilitator_url {
            Some(url) => Arc::new(HttpFacilitator::new(url)),
            None => Arc::new(DisabledVerifier),
        };

        Self::build(
            config,
            substrate,
            storage,
            verifier,
            Arc::new(NoopChainSync),
        )
    }

    /// Starts the periodic task set for this state.
    pub fn start_scheduler(&self) -> Scheduler {
        let mut scheduler = Scheduler::new();
        spawn_relay_tasks(
            &mut scheduler,
            TaskDeps {
                ledger: self.ledger.clone(),
                ipfs: self.ipfs.clone(),
                chain: Arc::clone(&self.chain),
                deals: self.deals.clone(),
                sessions: Arc::clone(&self.sessions),
                keypair: Arc::clone(&self.keypair),
                governor: self.governor.clone(),
                active_connections: Arc::clone(&self.active_connections),
                host: format!("{}:{}", self.config.host, self.config.port),
                started_at: self.started_at,
            },
            TaskIntervals {
                deal_fast_sync: self.config.deal_fast_sync_secs,
                deal_full_sync: self.config.deal_full_sync_secs,
                orphan_sweep: self.config.orphan_sweep_secs,
                orphan_max_age: self.config.orphan_max_age_secs,
                link_expiry: self.config.link_expiry_secs,
                reconcile: self.config.reconcile_secs,
                session_reap: self.config.session_reap_secs,
                pulse: self.config.pulse_secs,
            },
        );
        scheduler
    }
}
