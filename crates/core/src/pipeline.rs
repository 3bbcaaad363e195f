//! Upload pipeline
//!
//! Streaming ingest with content-hash dedup, quota reservation, pinning,
//! and ledger commit. Three scoped resources are held per upload and
//! released LIFO on every exit path: the in-flight dedup entry, the staged
//! temp object, and the quota reservation.

use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shogun_ipfs::{AddOptions, IpfsClient};
use shogun_ledger::{Ledger, Subscription, Upload};
use shogun_storage::{guess_content_type, ByteStream, StorageBackend};

use crate::auth::{Capability, Principal};
use crate::error::{CoreError, Result};
use crate::governor::{QuotaGovernor, Reservation, SubscriptionBudget};

/// Prefix inside the storage adapter where in-flight bodies are staged.
const STAGING_PREFIX: &str = ".staging";

/// How a given upload is billed.
#[derive(Debug, Clone)]
enum Billing {
    /// Admin and API-key traffic: no subscription accounting.
    Unmetered,
    /// Deal-backed upload: consumes no subscription quota.
    Deal,
    /// Metered against the wallet's active subscription.
    Subscription(Box<Subscription>),
}

/// Request metadata accompanying an upload body.
#[derive(Debug, Clone, Default)]
pub struct UploadMeta {
    pub original_name: String,
    pub content_type: Option<String>,
    /// `Content-Length` when the client sent one.
    pub content_length: Option<u64>,
    /// Client-declared flag; the body is opaque either way.
    pub encrypted: bool,
    /// `X-Deal-Upload` header or `?deal=true`.
    pub deal_upload: bool,
}

/// One child of a directory-wrapped upload.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryChild {
    pub name: String,
    pub size_bytes: u64,
    pub cid: String,
}

/// Success record handed back to the surface.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub cid: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub owner_key: String,
    pub dedup: bool,
    pub concurrent_duplicate: bool,
    pub entries: Vec<DirectoryChild>,
    pub subscription: Option<Subscription>,
}

#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub cid: String,
    /// True when this delete took the refcount to zero and unpinned.
    pub unpinned: bool,
}

struct HashState {
    hasher: Sha256,
    count: u64,
    exceeded: bool,
}

/// AsyncRead wrapper that fingerprints and measures the stream while the
/// storage adapter consumes it, aborting past the hard cap.
struct HashingReader {
    inner: ByteStream,
    state: Arc<Mutex<HashState>>,
    cap: u64,
}

impl HashingReader {
    fn new(inner: ByteStream, cap: u64) -> (Self, Arc<Mutex<HashState>>) {
        let state = Arc::new(Mutex::new(HashState {
            hasher: Sha256::new(),
            count: 0,
            exceeded: false,
        }));
        (
            Self {
                inner,
                state: Arc::clone(&state),
                cap,
            },
            state,
        )
    }
}

impl AsyncRead for HashingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match this.inner.as_mut().poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = &buf.filled()[before..];
                if !filled.is_empty() {
                    let mut state = this.state.lock().expect("hash state lock");
                    state.count += filled.len() as u64;
                    if state.count > this.cap {
                        state.exceeded = true;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "maximum request size exceeded",
                        )));
                    }
                    state.hasher.update(filled);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Reduces a filename to the slug half of a content id: lowercase
/// alphanumerics and dashes, at most 40 characters.
fn slug(name: &str) -> String {
    let mut out = String::new();
    let mut last_dash = false;
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
        if out.len() >= 40 {
            break;
        }
    }
    let trimmed = out.trim_end_matches('-').to_string();
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed
    }
}

fn content_id(digest: &[u8; 32], name: &str) -> String {
    format!("{}-{}", hex::encode(&digest[..8]), slug(name))
}

/// Holds the in-flight dedup slot for one content fingerprint; waiters are
/// woken when the leader finishes, successfully or not.
struct InflightGuard {
    map: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
    key: String,
    notify: Arc<Notify>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.map
            .lock()
            .expect("inflight map lock")
            .remove(&self.key);
        self.notify.notify_waiters();
    }
}

enum InflightSlot {
    Leader(InflightGuard),
    Duplicate(Upload),
}

pub struct UploadPipeline {
    ledger: Ledger,
    storage: Arc<dyn StorageBackend>,
    ipfs: IpfsClient,
    governor: QuotaGovernor,
    max_upload_bytes: u64,
    default_reserve_bytes: u64,
    enabled: bool,
    inflight: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl UploadPipeline {
    pub fn new(
        ledger: Ledger,
        storage: Arc<dyn StorageBackend>,
        ipfs: IpfsClient,
        governor: QuotaGovernor,
        max_upload_bytes: u64,
        default_reserve_bytes: u64,
        enabled: bool,
    ) -> Self {
        Self {
            ledger,
            storage,
            ipfs,
            governor,
            max_upload_bytes,
            default_reserve_bytes,
            enabled,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn governor(&self) -> &QuotaGovernor {
        &self.governor
    }

    /// Capability check plus billing mode.
    async fn admit(&self, principal: &Principal, deal_upload: bool) -> Result<(String, Billing)> {
        if !self.enabled {
            return Err(CoreError::Disabled("uploads".into()));
        }
        if !principal.can(Capability::Upload) {
            return Err(match principal {
                Principal::Public => {
                    CoreError::Unauthenticated("upload requires admin or wallet auth".into())
                }
                _ => CoreError::Forbidden("principal lacks the upload capability".into()),
            });
        }
        let owner = principal
            .owner_key()
            .ok_or_else(|| CoreError::invariant("pipeline", "upload principal without owner"))?
            .to_string();

        let billing = if owner == "admin" {
            Billing::Unmetered
        } else if deal_upload {
            Billing::Deal
        } else {
            let sub = self
                .ledger
                .subscription(&owner)
                .await?
                .filter(|s| s.is_active(Utc::now()))
                .ok_or_else(|| {
                    CoreError::PaymentRequired("no active subscription for this wallet".into())
                })?;
            Billing::Subscription(Box::new(sub))
        };
        Ok((owner, billing))
    }

    /// Claims quota before any bytes land.
    async fn reserve(&self, owner: &str, billing: &Billing, estimate: u64) -> Result<Reservation> {
        let budget = match billing {
            Billing::Subscription(sub) => Some(SubscriptionBudget {
                limit_bytes: sub.storage_limit_bytes,
                used_bytes: sub.storage_used_bytes,
            }),
            _ => None,
        };
        let live = self.ledger.live_bytes().await?;
        self.governor.reserve(Some(owner), estimate, budget, live)
    }

    fn estimate(&self, content_length: Option<u64>) -> Result<u64> {
        match content_length {
            Some(len) if len > self.max_upload_bytes => Err(CoreError::PayloadTooLarge {
                max_bytes: self.max_upload_bytes,
            }),
            Some(len) => Ok(len),
            None => Ok(self.default_reserve_bytes),
        }
    }

    async fn discard_staging(&self, path: &str) {
        if let Err(e) = self.storage.delete(path, false).await {
            warn!(path, error = %e, "failed to remove staged upload");
        }
    }

    /// Unpins `cid` iff this operation is the only reference holder.
    async fn rollback_pin(&self, cid: &str, incremented: bool) {
        let refs = if incremented {
            self.ledger.pinref_decr(cid).await.unwrap_or(0)
        } else {
            self.ledger.pinref(cid).await.unwrap_or(0)
        };
        if refs == 0 {
            if let Err(e) = self.ipfs.unpin(cid).await {
                warn!(cid, error = %e, "rollback unpin failed; orphan sweep will retry");
            }
        }
    }

    /// Claims the in-flight slot for a fingerprint, or waits for whoever
    /// holds it and reuses their committed record.
    async fn join_or_lead(&self, owner: &str, fingerprint: &str) -> Result<InflightSlot> {
        let key = format!("{owner}:{fingerprint}");
        loop {
            let waiter = {
                let mut map = self.inflight.lock().expect("inflight map lock");
                match map.get(&key) {
                    Some(existing) => existing.clone(),
                    None => {
                        let notify = Arc::new(Notify::new());
                        map.insert(key.clone(), Arc::clone(&notify));
                        return Ok(InflightSlot::Leader(InflightGuard {
                            map: Arc::clone(&self.inflight),
                            key,
                            notify,
                        }));
                    }
                }
            };
            let notified = waiter.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            notified.await;

            // Leader finished: a dedup hit means it committed.
            if let Some(existing) = self.ledger.upload_by_content(owner, fingerprint).await? {
                return Ok(InflightSlot::Duplicate(existing));
            }
            // Leader failed; loop and try to take the slot ourselves.
        }
    }

    fn dedup_outcome(
        owner: &str,
        existing: Upload,
        concurrent: bool,
        subscription: Option<Subscription>,
    ) -> UploadOutcome {
        UploadOutcome {
            cid: existing.cid,
            size_bytes: existing.size_bytes,
            content_type: existing.content_type,
            owner_key: owner.to_string(),
            dedup: true,
            concurrent_duplicate: concurrent,
            entries: Vec::new(),
            subscription,
        }
    }

    /// Single-file upload: admit, reserve, stream, dedup, pin, commit.
    pub async fn upload(
        &self,
        principal: &Principal,
        meta: UploadMeta,
        body: ByteStream,
    ) -> Result<UploadOutcome> {
        let (owner, billing) = self.admit(principal, meta.deal_upload).await?;
        let estimate = self.estimate(meta.content_length)?;
        let mut reservation = self.reserve(&owner, &billing, estimate).await?;

        // Stream into staging while fingerprinting.
        let staging = format!("{STAGING_PREFIX}/{}", Uuid::new_v4());
        let (reader, hash_state) = HashingReader::new(body, self.max_upload_bytes);
        match self.storage.write(&staging, Box::pin(reader)).await {
            Ok(_) => {}
            Err(e) => {
                let exceeded = hash_state.lock().expect("hash state lock").exceeded;
                return Err(if exceeded {
                    CoreError::PayloadTooLarge {
                        max_bytes: self.max_upload_bytes,
                    }
                } else {
                    e.into()
                });
            }
        }

        let (digest, written) = {
            let state = hash_state.lock().expect("hash state lock");
            let digest: [u8; 32] = state.hasher.clone().finalize().into();
            (digest, state.count)
        };
        if let Err(e) = reservation.adjust(written) {
            self.discard_staging(&staging).await;
            return Err(e);
        }

        // Content fingerprint dedup before any pinning.
        let fingerprint = content_id(&digest, &meta.original_name);
        if let Some(existing) = self.ledger.upload_by_content(&owner, &fingerprint).await? {
            debug!(owner, fingerprint, "dedup hit");
            self.discard_staging(&staging).await;
            return Ok(Self::dedup_outcome(&owner, existing, false, None));
        }

        // Coalesce concurrent builds of the identical payload.
        let _inflight = match self.join_or_lead(&owner, &fingerprint).await? {
            InflightSlot::Duplicate(existing) => {
                self.discard_staging(&staging).await;
                return Ok(Self::dedup_outcome(&owner, existing, true, None));
            }
            InflightSlot::Leader(guard) => guard,
        };
        // A previous leader may have committed between our dedup lookup and
        // taking the slot; re-check before pinning anything.
        if let Some(existing) = self.ledger.upload_by_content(&owner, &fingerprint).await? {
            self.discard_staging(&staging).await;
            return Ok(Self::dedup_outcome(&owner, existing, true, None));
        }

        let result = self
            .pin_and_commit(&owner, &billing, &meta, &staging, written, &fingerprint)
            .await;
        self.discard_staging(&staging).await;
        result
    }

    /// Pin via the store, then commit the ledger rows in order.
    async fn pin_and_commit(
        &self,
        owner: &str,
        billing: &Billing,
        meta: &UploadMeta,
        staging: &str,
        written: u64,
        fingerprint: &str,
    ) -> Result<UploadOutcome> {
        let (stream, _) = self.storage.read(staging).await?;
        let added = self
            .ipfs
            .add_stream(
                &meta.original_name,
                Some(written),
                stream,
                AddOptions {
                    wrap_dir: false,
                    pin: true,
                },
            )
            .await?;
        let cid = added.cid.clone();

        let content_type = meta
            .content_type
            .clone()
            .unwrap_or_else(|| guess_content_type(&meta.original_name).to_string());
        let record = Upload {
            cid: cid.clone(),
            size_bytes: written,
            content_type: content_type.clone(),
            original_name: meta.original_name.clone(),
            uploaded_at: Utc::now(),
            content_id: fingerprint.to_string(),
            encrypted: meta.encrypted,
            parent_directory_cid: None,
        };

        if let Err(e) = self.ledger.put_upload(owner, &record).await {
            self.rollback_pin(&cid, false).await;
            return Err(e.into());
        }
        if let Err(e) = self.ledger.pinref_incr(&cid).await {
            // The upload row is in; reconciliation repairs the counter.
            warn!(cid, error = %e, "pinref increment failed after commit");
            return Err(e.into());
        }

        let subscription = match billing {
            Billing::Subscription(_) => {
                // Fresh read: a concurrent upload may have advanced usage.
                let mut sub = self.ledger.subscription(owner).await?.ok_or_else(|| {
                    CoreError::invariant("pipeline", "subscription vanished mid-upload")
                })?;
                sub.storage_used_bytes += written;
                self.ledger.put_subscription(owner, &sub).await?;
                Some(sub)
            }
            _ => None,
        };

        info!(owner, %cid, written, "upload committed");
        Ok(UploadOutcome {
            cid,
            size_bytes: written,
            content_type,
            owner_key: owner.to_string(),
            dedup: false,
            concurrent_duplicate: false,
            entries: Vec::new(),
            subscription,
        })
    }

    /// Directory upload: the parts stream in together and are wrapped in a
    /// single directory node whose cid becomes the owned root.
    pub async fn upload_directory(
        &self,
        principal: &Principal,
        parts: Vec<(String, Bytes)>,
        meta: UploadMeta,
    ) -> Result<UploadOutcome> {
        if parts.is_empty() {
            return Err(CoreError::malformed("directory upload with no parts"));
        }
        let (owner, billing) = self.admit(principal, meta.deal_upload).await?;
        let total: u64 = parts.iter().map(|(_, b)| b.len() as u64).sum();
        if total > self.max_upload_bytes {
            return Err(CoreError::PayloadTooLarge {
                max_bytes: self.max_upload_bytes,
            });
        }
        let _reservation = self.reserve(&owner, &billing, total).await?;

        // Fingerprint covers the relative paths and every byte.
        let mut hasher = Sha256::new();
        for (path, content) in &parts {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(content);
        }
        let digest: [u8; 32] = hasher.finalize().into();
        let root_name = if meta.original_name.is_empty() {
            "directory".to_string()
        } else {
            meta.original_name.clone()
        };
        let fingerprint = content_id(&digest, &root_name);

        if let Some(existing) = self.ledger.upload_by_content(&owner, &fingerprint).await? {
            return Ok(Self::dedup_outcome(&owner, existing, false, None));
        }
        let _inflight = match self.join_or_lead(&owner, &fingerprint).await? {
            InflightSlot::Duplicate(existing) => {
                return Ok(Self::dedup_outcome(&owner, existing, true, None));
            }
            InflightSlot::Leader(guard) => guard,
        };
        if let Some(existing) = self.ledger.upload_by_content(&owner, &fingerprint).await? {
            return Ok(Self::dedup_outcome(&owner, existing, true, None));
        }

        let added = self
            .ipfs
            .add_parts(
                parts
                    .iter()
                    .map(|(p, b)| (p.clone(), b.clone()))
                    .collect(),
                AddOptions {
                    wrap_dir: true,
                    pin: true,
                },
            )
            .await?;
        let root_cid = added.cid.clone();

        // Root row carries the fingerprint; children carry the sizes so
        // usage sums stay correct with cid-distinct accounting.
        let now = Utc::now();
        let root = Upload {
            cid: root_cid.clone(),
            size_bytes: 0,
            content_type: "inode/directory".to_string(),
            original_name: root_name,
            uploaded_at: now,
            content_id: fingerprint.clone(),
            encrypted: meta.encrypted,
            parent_directory_cid: None,
        };
        if let Err(e) = self.ledger.put_upload(&owner, &root).await {
            self.rollback_pin(&root_cid, false).await;
            return Err(e.into());
        }
        let mut children = Vec::new();
        for entry in &added.entries {
            let child = Upload {
                cid: entry.cid.clone(),
                size_bytes: entry.size_bytes,
                content_type: guess_content_type(&entry.name).to_string(),
                original_name: entry.name.clone(),
                uploaded_at: now,
                content_id: format!("{fingerprint}/{}", entry.name),
                encrypted: meta.encrypted,
                parent_directory_cid: Some(root_cid.clone()),
            };
            self.ledger.put_upload(&owner, &child).await?;
            children.push(DirectoryChild {
                name: entry.name.clone(),
                size_bytes: entry.size_bytes,
                cid: entry.cid.clone(),
            });
        }
        self.ledger.pinref_incr(&root_cid).await?;

        let subscription = match billing {
            Billing::Subscription(_) => {
                let mut sub = self.ledger.subscription(&owner).await?.ok_or_else(|| {
                    CoreError::invariant("pipeline", "subscription vanished mid-upload")
                })?;
                sub.storage_used_bytes += total;
                self.ledger.put_subscription(&owner, &sub).await?;
                Some(sub)
            }
            _ => None,
        };

        info!(owner, cid = %root_cid, total, files = children.len(), "directory upload committed");
        Ok(UploadOutcome {
            cid: root_cid,
            size_bytes: total,
            content_type: "inode/directory".to_string(),
            owner_key: owner,
            dedup: false,
            concurrent_duplicate: false,
            entries: children,
            subscription,
        })
    }

    /// Reverse flow: unpin at refcount zero, tombstone, decrement usage.
    pub async fn delete(&self, principal: &Principal, cid: &str) -> Result<DeleteOutcome> {
        if !principal.can(Capability::Delete) {
            return Err(match principal {
                Principal::Public => CoreError::Unauthenticated("delete requires auth".into()),
                _ => CoreError::Forbidden("principal lacks the delete capability".into()),
            });
        }
        let owner = principal
            .owner_key()
            .ok_or_else(|| CoreError::invariant("pipeline", "delete principal without owner"))?
            .to_string();

        let upload = self
            .ledger
            .upload(&owner, cid)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("no upload {cid} for this owner")))?;

        // Directory roots take their children rows with them.
        let mut billed = upload.size_bytes;
        let children: Vec<Upload> = self
            .ledger
            .uploads_for(&owner)
            .await?
            .into_iter()
            .filter(|u| u.parent_directory_cid.as_deref() == Some(cid))
            .collect();
        for child in &children {
            billed += child.size_bytes;
            self.ledger.remove_upload(&owner, child).await?;
        }

        let refs = self.ledger.pinref_decr(cid).await?;
        let mut unpinned = false;
        if refs == 0 {
            match self.ipfs.unpin(cid).await {
                Ok(()) => unpinned = true,
                // The orphan sweep retries zero-ref cids later.
                Err(e) => warn!(cid, error = %e, "unpin failed; deferring to orphan sweep"),
            }
        }

        self.ledger.remove_upload(&owner, &upload).await?;

        if owner != "admin" {
            if let Some(mut sub) = self.ledger.subscription(&owner).await? {
                sub.storage_used_bytes = sub.storage_used_bytes.saturating_sub(billed);
                self.ledger.put_subscription(&owner, &sub).await?;
            }
        }

        info!(owner, cid, refs, "upload deleted");
        Ok(DeleteOutcome {
            cid: cid.to_string(),
            unpinned,
        })
    }
}
