//! Typed projection over the substrate

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::error::{LedgerError, Result};
use crate::records::{ApiKeyRecord, Deal, PublicLink, Pulse, Subscription, Upload};
use crate::substrate::{Entry, Substrate};

/// Namespace key builders. Cross-references are string keys, never
/// embedded pointers, so replicated merges cannot form cycles.
pub mod keys {
    pub fn subscription(addr: &str) -> String {
        format!("sub/{addr}")
    }
    pub fn deal(id: &str) -> String {
        format!("deal/{id}")
    }
    pub fn deal_client_idx(addr: &str, id: &str) -> String {
        format!("deal-idx/client/{addr}/{id}")
    }
    pub fn deal_cid_idx(cid: &str, id: &str) -> String {
        format!("deal-idx/cid/{cid}/{id}")
    }
    pub fn upload(owner: &str, cid: &str) -> String {
        format!("upload/{owner}/{cid}")
    }
    pub fn upload_content_idx(owner: &str, content_id: &str) -> String {
        format!("upload-idx/content/{owner}/{content_id}")
    }
    pub fn pinref(cid: &str) -> String {
        format!("pinref/{cid}")
    }
    pub fn apikey(key_id: &str) -> String {
        format!("apikey/{key_id}")
    }
    pub fn link(link_id: &str) -> String {
        format!("link/{link_id}")
    }
    pub fn pulse(host: &str) -> String {
        format!("relay/pulse/{host}")
    }
}

/// Handle to the relay's metadata. Cheap to clone.
#[derive(Clone)]
pub struct Ledger {
    substrate: Arc<dyn Substrate>,
    writer_id: String,
}

impl Ledger {
    pub fn new(substrate: Arc<dyn Substrate>, writer_id: impl Into<String>) -> Self {
        Self {
            substrate,
            writer_id: writer_id.into(),
        }
    }

    fn entry<T: Serialize>(&self, value: &T) -> Result<Entry> {
        Ok(Entry::new(
            serde_json::to_value(value)?,
            Utc::now().timestamp_millis(),
            self.writer_id.clone(),
        ))
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.substrate.get(key).await? {
            Some(entry) => {
                let value =
                    serde_json::from_value(entry.value).map_err(|e| LedgerError::Corrupt {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.substrate.put(key, self.entry(value)?).await
    }

    // -- subscriptions -----------------------------------------------------

    pub async fn subscription(&self, addr: &str) -> Result<Option<Subscription>> {
        self.read(&keys::subscription(addr)).await
    }

    pub async fn put_subscription(&self, addr: &str, sub: &Subscription) -> Result<()> {
        self.write(&keys::subscription(addr), sub).await
    }

    pub async fn subscriptions(&self) -> Result<Vec<(String, Subscription)>> {
        let mut out = Vec::new();
        for (key, entry) in self.substrate.scan("sub/").await? {
            let addr = key.trim_start_matches("sub/").to_string();
            let sub = serde_json::from_value(entry.value).map_err(|e| LedgerError::Corrupt {
                key,
                reason: e.to_string(),
            })?;
            out.push((addr, sub));
        }
        Ok(out)
    }

    // -- deals -------------------------------------------------------------

    pub async fn deal(&self, id: &str) -> Result<Option<Deal>> {
        self.read(&keys::deal(id)).await
    }

    /// Writes a deal and both secondary indexes.
    pub async fn put_deal(&self, deal: &Deal) -> Result<()> {
        self.write(&keys::deal(&deal.deal_id), deal).await?;
        self.write(
            &keys::deal_client_idx(&deal.client_address, &deal.deal_id),
            &true,
        )
        .await?;
        self.write(&keys::deal_cid_idx(&deal.cid, &deal.deal_id), &true)
            .await
    }

    pub async fn deals_by_client(&self, addr: &str) -> Result<Vec<Deal>> {
        let prefix = format!("deal-idx/client/{addr}/");
        let mut deals = Vec::new();
        for (key, _) in self.substrate.scan(&prefix).await? {
            let id = key.trim_start_matches(&prefix);
            if let Some(deal) = self.deal(id).await? {
                deals.push(deal);
            }
        }
        Ok(deals)
    }

    pub async fn deals_by_cid(&self, cid: &str) -> Result<Vec<Deal>> {
        let prefix = format!("deal-idx/cid/{cid}/");
        let mut deals = Vec::new();
        for (key, _) in self.substrate.scan(&prefix).await? {
            let id = key.trim_start_matches(&prefix);
            if let Some(deal) = self.deal(id).await? {
                deals.push(deal);
            }
        }
        Ok(deals)
    }

    pub async fn all_deals(&self) -> Result<Vec<Deal>> {
        let mut deals = Vec::new();
        for (key, entry) in self.substrate.scan("deal/").await? {
            let deal = serde_json::from_value(entry.value).map_err(|e| LedgerError::Corrupt {
                key,
                reason: e.to_string(),
            })?;
            deals.push(deal);
        }
        Ok(deals)
    }

    // -- uploads -----------------------------------------------------------

    pub async fn upload(&self, owner: &str, cid: &str) -> Result<Option<Upload>> {
        self.read(&keys::upload(owner, cid)).await
    }

    /// Writes the upload row plus the content-id index used for dedup.
    pub async fn put_upload(&self, owner: &str, upload: &Upload) -> Result<()> {
        self.write(&keys::upload(owner, &upload.cid), upload).await?;
        self.write(
            &keys::upload_content_idx(owner, &upload.content_id),
            &upload.cid,
        )
        .await
    }

    /// Tombstones the upload row and its content index.
    pub async fn remove_upload(&self, owner: &str, upload: &Upload) -> Result<()> {
        self.substrate
            .remove(&keys::upload(owner, &upload.cid))
            .await?;
        self.substrate
            .remove(&keys::upload_content_idx(owner, &upload.content_id))
            .await
    }

    /// Dedup lookup: resolves a content fingerprint to the owner's
    /// existing upload record, if any.
    pub async fn upload_by_content(&self, owner: &str, content_id: &str) -> Result<Option<Upload>> {
        let cid: Option<String> = self.read(&keys::upload_content_idx(owner, content_id)).await?;
        match cid {
            Some(cid) => self.upload(owner, &cid).await,
            None => Ok(None),
        }
    }

    pub async fn uploads_for(&self, owner: &str) -> Result<Vec<Upload>> {
        let prefix = format!("upload/{owner}/");
        let mut uploads = Vec::new();
        for (key, entry) in self.substrate.scan(&prefix).await? {
            let upload = serde_json::from_value(entry.value).map_err(|e| LedgerError::Corrupt {
                key,
                reason: e.to_string(),
            })?;
            uploads.push(upload);
        }
        Ok(uploads)
    }

    pub async fn all_uploads(&self) -> Result<Vec<(String, Upload)>> {
        let mut uploads = Vec::new();
        for (key, entry) in self.substrate.scan("upload/").await? {
            let rest = key.trim_start_matches("upload/");
            let Some((owner, _cid)) = rest.split_once('/') else {
                continue;
            };
            let owner = owner.to_string();
            let upload = serde_json::from_value(entry.value).map_err(|e| LedgerError::Corrupt {
                key,
                reason: e.to_string(),
            })?;
            uploads.push((owner, upload));
        }
        Ok(uploads)
    }

    /// Physical bytes live on the relay: each cid counted once however
    /// many owners reference it.
    pub async fn live_bytes(&self) -> Result<u64> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut total = 0u64;
        for (_, upload) in self.all_uploads().await? {
            if seen.insert(upload.cid.clone()) {
                total += upload.size_bytes;
            }
        }
        Ok(total)
    }

    /// Billed bytes for one owner: the sum of that owner's rows.
    pub async fn live_bytes_for(&self, owner: &str) -> Result<u64> {
        Ok(self
            .uploads_for(owner)
            .await?
            .iter()
            .map(|u| u.size_bytes)
            .sum())
    }

    // -- pin refcounts -----------------------------------------------------

    pub async fn pinref(&self, cid: &str) -> Result<u64> {
        Ok(self.read(&keys::pinref(cid)).await?.unwrap_or(0))
    }

    /// Read-modify-write increment; drift is repaired by reconciliation.
    pub async fn pinref_incr(&self, cid: &str) -> Result<u64> {
        let next = self.pinref(cid).await? + 1;
        self.write(&keys::pinref(cid), &next).await?;
        Ok(next)
    }

    pub async fn pinref_decr(&self, cid: &str) -> Result<u64> {
        let next = self.pinref(cid).await?.saturating_sub(1);
        if next == 0 {
            self.substrate.remove(&keys::pinref(cid)).await?;
        } else {
            self.write(&keys::pinref(cid), &next).await?;
        }
        Ok(next)
    }

    pub async fn pinref_set(&self, cid: &str, value: u64) -> Result<()> {
        if value == 0 {
            self.substrate.remove(&keys::pinref(cid)).await
        } else {
            self.write(&keys::pinref(cid), &value).await
        }
    }

    pub async fn all_pinrefs(&self) -> Result<Vec<(String, u64)>> {
        let mut out = Vec::new();
        for (key, entry) in self.substrate.scan("pinref/").await? {
            let cid = key.trim_start_matches("pinref/").to_string();
            let count = entry.value.as_u64().unwrap_or(0);
            out.push((cid, count));
        }
        Ok(out)
    }

    // -- api keys ----------------------------------------------------------

    pub async fn api_key(&self, key_id: &str) -> Result<Option<ApiKeyRecord>> {
        self.read(&keys::apikey(key_id)).await
    }

    pub async fn put_api_key(&self, record: &ApiKeyRecord) -> Result<()> {
        self.write(&keys::apikey(&record.key_id), record).await
    }

    pub async fn remove_api_key(&self, key_id: &str) -> Result<()> {
        self.substrate.remove(&keys::apikey(key_id)).await
    }

    pub async fn api_keys(&self) -> Result<Vec<ApiKeyRecord>> {
        let mut out = Vec::new();
        for (key, entry) in self.substrate.scan("apikey/").await? {
            let record = serde_json::from_value(entry.value).map_err(|e| LedgerError::Corrupt {
                key,
                reason: e.to_string(),
            })?;
            out.push(record);
        }
        Ok(out)
    }

    // -- public links ------------------------------------------------------

    pub async fn link(&self, link_id: &str) -> Result<Option<PublicLink>> {
        self.read(&keys::link(link_id)).await
    }

    pub async fn put_link(&self, link: &PublicLink) -> Result<()> {
        self.write(&keys::link(&link.link_id), link).await
    }

    pub async fn remove_link(&self, link_id: &str) -> Result<()> {
        self.substrate.remove(&keys::link(link_id)).await
    }

    pub async fn links(&self) -> Result<Vec<PublicLink>> {
        let mut out = Vec::new();
        for (key, entry) in self.substrate.scan("link/").await? {
            let link = serde_json::from_value(entry.value).map_err(|e| LedgerError::Corrupt {
                key,
                reason: e.to_string(),
            })?;
            out.push(link);
        }
        Ok(out)
    }

    /// Returns the links whose file path matches; used to reject duplicate
    /// registrations for the same file.
    pub async fn link_for_path(&self, file_path: &str) -> Result<Option<PublicLink>> {
        Ok(self
            .links()
            .await?
            .into_iter()
            .find(|l| l.file_path == file_path && !l.revoked))
    }

    // -- pulse -------------------------------------------------------------

    pub async fn put_pulse(&self, pulse: &Pulse) -> Result<()> {
        debug!(host = %pulse.host, "writing pulse");
        self.write(&keys::pulse(&pulse.host), pulse).await
    }
}
