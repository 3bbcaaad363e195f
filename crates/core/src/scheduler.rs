//! Periodic tasks
//!
//! A small registry of named, cancellable loops. Each task holds its own
//! exclusive lock so a slow run is skipped rather than stacked, and every
//! loop watches the shutdown channel so the relay can drain cleanly.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use shogun_ipfs::{IpfsClient, PinType};
use shogun_ledger::{Ledger, Pulse};

use crate::auth::session::SessionStore;
use crate::chain::ChainSync;
use crate::deal::DealManager;
use crate::error::{CoreError, Result};
use crate::governor::QuotaGovernor;
use crate::keypair::RelayKeypair;

pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Registers a named periodic task. The task's own lock makes re-entry
    /// impossible even if it is registered twice under one name.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so tasks start one
            // period after boot.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Ok(_guard) = lock.try_lock() else {
                            debug!(task = name, "previous run still live; skipping tick");
                            continue;
                        };
                        let started = Instant::now();
                        match task().await {
                            Ok(()) => {
                                debug!(task = name, elapsed_ms = started.elapsed().as_millis() as u64, "task tick done");
                            }
                            Err(e) => match e.log_level() {
                                tracing::Level::ERROR => error!(task = name, error = %e, "task failed"),
                                tracing::Level::WARN => warn!(task = name, error = %e, "task failed"),
                                _ => debug!(task = name, error = %e, "task failed"),
                            },
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!(task = name, "scheduler task stopping");
                        break;
                    }
                }
            }
        });
        self.handles.push(handle);
    }

    /// Signals every task and waits for the loops to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Task bodies
// ---------------------------------------------------------------------------

/// Recomputes each subscription's used bytes from its live uploads and
/// rewrites rows that drifted. Also repairs pin refcounts from the
/// source-of-truth upload set. Returns the number of corrections.
pub async fn reconcile_counters(ledger: &Ledger) -> Result<usize> {
    let mut corrections = 0;

    for (addr, mut sub) in ledger.subscriptions().await? {
        let actual = ledger.live_bytes_for(&addr).await?;
        if sub.storage_used_bytes != actual {
            warn!(
                addr,
                recorded = sub.storage_used_bytes,
                actual,
                "usage counter drift; correcting"
            );
            sub.storage_used_bytes = actual;
            ledger.put_subscription(&addr, &sub).await?;
            corrections += 1;
        }
    }

    // Refcount truth: distinct owners per root cid.
    let mut owners_by_cid: HashMap<String, HashSet<String>> = HashMap::new();
    for (owner, upload) in ledger.all_uploads().await? {
        if upload.parent_directory_cid.is_none() {
            owners_by_cid.entry(upload.cid).or_default().insert(owner);
        }
    }
    for (cid, recorded) in ledger.all_pinrefs().await? {
        let actual = owners_by_cid.get(&cid).map(|o| o.len() as u64).unwrap_or(0);
        if recorded != actual {
            warn!(cid, recorded, actual, "pinref drift; correcting");
            ledger.pinref_set(&cid, actual).await?;
            corrections += 1;
        }
    }
    for (cid, owners) in &owners_by_cid {
        let recorded = ledger.pinref(cid).await?;
        if recorded == 0 && !owners.is_empty() {
            ledger.pinref_set(cid, owners.len() as u64).await?;
            corrections += 1;
        }
    }

    Ok(corrections)
}

/// Compares the store's pin list with the ledger and unpins cids nobody
/// references. `first_seen` carries orphan sightings between runs so a
/// cid must stay orphaned for `max_age` before it is collected, which
/// protects uploads that are pinned but not yet committed.
pub async fn sweep_orphan_pins(
    ledger: &Ledger,
    ipfs: &IpfsClient,
    first_seen: &mut HashMap<String, Instant>,
    max_age: Duration,
) -> Result<usize> {
    let pinned = ipfs.pin_ls(PinType::Recursive).await?;

    let mut referenced: HashSet<String> = HashSet::new();
    for (cid, count) in ledger.all_pinrefs().await? {
        if count > 0 {
            referenced.insert(cid);
        }
    }
    for (_, upload) in ledger.all_uploads().await? {
        referenced.insert(upload.cid);
    }

    let now = Instant::now();
    let mut collected = 0;
    for cid in &pinned {
        if referenced.contains(cid) {
            first_seen.remove(cid);
            continue;
        }
        let seen = *first_seen.entry(cid.clone()).or_insert(now);
        if now.duration_since(seen) >= max_age {
            info!(cid, "unpinning orphaned cid");
            if let Err(e) = ipfs.unpin(cid).await {
                warn!(cid, error = %e, "orphan unpin failed");
            } else {
                first_seen.remove(cid);
                collected += 1;
            }
        }
    }
    // Forget sightings of cids the store no longer pins.
    first_seen.retain(|cid, _| pinned.contains(cid));
    Ok(collected)
}

/// Marks expired public links revoked. Returns the sweep count.
pub async fn expire_links(ledger: &Ledger) -> Result<usize> {
    let now = Utc::now();
    let mut swept = 0;
    for mut link in ledger.links().await? {
        if !link.revoked && link.expires_at.map(|e| now >= e).unwrap_or(false) {
            link.revoked = true;
            ledger.put_link(&link).await?;
            swept += 1;
        }
    }
    Ok(swept)
}

#[cfg(target_os = "linux")]
fn resident_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn resident_bytes() -> Option<u64> {
    None
}

/// Everything the relay's periodic loops need.
pub struct TaskDeps {
    pub ledger: Ledger,
    pub ipfs: IpfsClient,
    pub chain: Arc<dyn ChainSync>,
    pub deals: DealManager,
    pub sessions: Arc<SessionStore>,
    pub keypair: Arc<RelayKeypair>,
    pub governor: QuotaGovernor,
    pub active_connections: Arc<AtomicU64>,
    pub host: String,
    pub started_at: Instant,
}

/// Intervals, all in seconds; defaults come from `RelayConfig`.
pub struct TaskIntervals {
    pub deal_fast_sync: u64,
    pub deal_full_sync: u64,
    pub orphan_sweep: u64,
    pub orphan_max_age: u64,
    pub link_expiry: u64,
    pub reconcile: u64,
    pub session_reap: u64,
    pub pulse: u64,
}

/// Registers the relay's seven periodic tasks on `scheduler`.
pub fn spawn_relay_tasks(scheduler: &mut Scheduler, deps: TaskDeps, intervals: TaskIntervals) {
    let TaskDeps {
        ledger,
        ipfs,
        chain,
        deals,
        sessions,
        keypair,
        governor,
        active_connections,
        host,
        started_at,
    } = deps;

    // Deal fast sync: fold recent on-chain events into deal rows.
    {
        let ledger = ledger.clone();
        let chain = Arc::clone(&chain);
        scheduler.spawn(
            "deal-fast-sync",
            Duration::from_secs(intervals.deal_fast_sync),
            move || {
                let ledger = ledger.clone();
                let chain = Arc::clone(&chain);
                async move {
                    for event in chain.recent_events().await? {
                        if let Some(mut deal) = ledger.deal(&event.deal_id).await? {
                            if deal.onchain_tx.as_deref() != Some(event.onchain_tx.as_str()) {
                                deal.onchain_tx = Some(event.onchain_tx);
                                deal.updated_at = Utc::now();
                                ledger.put_deal(&deal).await?;
                            }
                        }
                    }
                    Ok(())
                }
            },
        );
    }

    // Deal full sync: expire overdue deals and reconcile on-chain state.
    {
        let deals = deals.clone();
        let chain = Arc::clone(&chain);
        let ledger = ledger.clone();
        scheduler.spawn(
            "deal-full-sync",
            Duration::from_secs(intervals.deal_full_sync),
            move || {
                let deals = deals.clone();
                let chain = Arc::clone(&chain);
                let ledger = ledger.clone();
                async move {
                    let touched = deals.sweep(Utc::now()).await?;
                    if touched > 0 {
                        info!(touched, "deal sweep transitioned deals");
                    }
                    for deal in ledger.all_deals().await? {
                        if deal.status == shogun_ledger::DealStatus::Active {
                            if let Some(state) = chain.deal_state(&deal.deal_id).await? {
                                debug!(deal_id = %deal.deal_id, %state, "on-chain state");
                            }
                        }
                    }
                    Ok(())
                }
            },
        );
    }

    // Orphan pin sweep.
    {
        let ledger = ledger.clone();
        let ipfs = ipfs.clone();
        let max_age = Duration::from_secs(intervals.orphan_max_age);
        let first_seen = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        scheduler.spawn(
            "orphan-pin-sweep",
            Duration::from_secs(intervals.orphan_sweep),
            move || {
                let ledger = ledger.clone();
                let ipfs = ipfs.clone();
                let first_seen = Arc::clone(&first_seen);
                async move {
                    let mut seen = first_seen.lock().await;
                    let collected = sweep_orphan_pins(&ledger, &ipfs, &mut seen, max_age).await?;
                    if collected > 0 {
                        info!(collected, "orphan sweep unpinned cids");
                        // Freshly unpinned blocks are now collectable.
                        if let Err(e) = ipfs.gc().await {
                            warn!(error = %e, "repo gc after sweep failed");
                        }
                    }
                    Ok(())
                }
            },
        );
    }

    // Public link expiry.
    {
        let ledger = ledger.clone();
        scheduler.spawn(
            "link-expiry",
            Duration::from_secs(intervals.link_expiry),
            move || {
                let ledger = ledger.clone();
                async move {
                    let swept = expire_links(&ledger).await?;
                    if swept > 0 {
                        info!(swept, "revoked expired public links");
                    }
                    Ok(())
                }
            },
        );
    }

    // Counter reconciliation.
    {
        let ledger = ledger.clone();
        scheduler.spawn(
            "counter-reconciliation",
            Duration::from_secs(intervals.reconcile),
            move || {
                let ledger = ledger.clone();
                async move {
                    let corrections = reconcile_counters(&ledger).await?;
                    if corrections > 0 {
                        info!(corrections, "reconciliation corrected counters");
                    }
                    Ok(())
                }
            },
        );
    }

    // Session reaper.
    {
        let sessions = Arc::clone(&sessions);
        scheduler.spawn(
            "session-reaper",
            Duration::from_secs(intervals.session_reap),
            move || {
                let sessions = Arc::clone(&sessions);
                async move {
                    let evicted = sessions.reap(Utc::now());
                    if evicted > 0 {
                        debug!(evicted, "reaped sessions");
                    }
                    Ok(())
                }
            },
        );
    }

    // Heartbeat pulse.
    {
        scheduler.spawn(
            "pulse",
            Duration::from_secs(intervals.pulse),
            move || {
                let ledger = ledger.clone();
                let keypair = Arc::clone(&keypair);
                let governor = governor.clone();
                let connections = Arc::clone(&active_connections);
                let host = host.clone();
                async move {
                    let used = ledger.live_bytes().await?;
                    let mut pulse = Pulse {
                        host: host.clone(),
                        relay_address: keypair.address().to_string(),
                        uptime_secs: started_at.elapsed().as_secs(),
                        rss_bytes: resident_bytes(),
                        active_connections: connections.load(Ordering::Relaxed),
                        cap_used_bytes: used,
                        cap_total_bytes: governor.relay_cap().unwrap_or(0),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                        timestamp: Utc::now(),
                        signature: None,
                    };
                    let body = serde_json::to_vec(&pulse)
                        .map_err(|e| CoreError::Backend(e.to_string()))?;
                    pulse.signature = Some(keypair.sign(&body));
                    ledger.put_pulse(&pulse).await?;
                    Ok(())
                }
            },
        );
    }
}
