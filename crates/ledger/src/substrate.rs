//! Key-value substrate contract
//!
//! The relay's metadata lives in an externally replicated graph store. The
//! core only relies on the per-key contract below: last-writer-wins on
//! caller-supplied timestamps, prefix scans, possibly stale reads.
//! [`MemorySubstrate`] backs tests and ephemeral runs; [`SledSubstrate`]
//! persists locally. Replication and merge transport are out of scope.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::error::{LedgerError, Result};

/// A versioned value: payload plus the writer tag used for LWW merges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub value: serde_json::Value,
    pub timestamp_ms: i64,
    pub writer_id: String,
}

impl Entry {
    pub fn new(value: serde_json::Value, timestamp_ms: i64, writer_id: impl Into<String>) -> Self {
        Self {
            value,
            timestamp_ms,
            writer_id: writer_id.into(),
        }
    }

    /// LWW order: higher timestamp wins, writer id breaks ties.
    fn supersedes(&self, other: &Entry) -> bool {
        (self.timestamp_ms, self.writer_id.as_str()) > (other.timestamp_ms, other.writer_id.as_str())
    }
}

#[async_trait]
pub trait Substrate: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Entry>>;

    /// Writes `entry` unless a newer entry is already present (LWW).
    async fn put(&self, key: &str, entry: Entry) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Returns all `(key, entry)` pairs whose key starts with `prefix`,
    /// in key order.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Entry)>>;
}

/// In-process substrate used by tests and ephemeral relays.
#[derive(Default)]
pub struct MemorySubstrate {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, entry: Entry) -> Result<()> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(existing) if !entry.supersedes(existing) => Ok(()),
            _ => {
                entries.insert(key.to_string(), entry);
                Ok(())
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Entry)>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Embedded persistent substrate.
pub struct SledSubstrate {
    db: sled::Db,
}

impl SledSubstrate {
    /// Opens (or creates) the substrate at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Flushes outstanding writes; called on graceful shutdown.
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<Entry> {
        serde_json::from_slice(bytes).map_err(|e| LedgerError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Substrate for SledSubstrate {
    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(Self::decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, entry: Entry) -> Result<()> {
        // Compare-and-swap loop so concurrent writers keep LWW intact.
        loop {
            let current = self.db.get(key)?;
            if let Some(bytes) = &current {
                let existing = Self::decode(key, bytes)?;
                if !entry.supersedes(&existing) {
                    return Ok(());
                }
            }
            let encoded = serde_json::to_vec(&entry)?;
            match self
                .db
                .compare_and_swap(key, current, Some(encoded))
                .map_err(|e| LedgerError::Substrate(e.to_string()))?
            {
                Ok(()) => return Ok(()),
                Err(_) => continue,
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Entry)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (key, bytes) = item?;
            let key = String::from_utf8_lossy(&key).to_string();
            let entry = Self::decode(&key, &bytes)?;
            out.push((key, entry));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(value: i64, ts: i64) -> Entry {
        Entry::new(serde_json::json!(value), ts, "w1")
    }

    #[tokio::test]
    async fn memory_put_get_round_trip() {
        let substrate = MemorySubstrate::new();
        substrate.put("k", entry(1, 10)).await.unwrap();
        let got = substrate.get("k").await.unwrap().unwrap();
        assert_eq!(got.value, serde_json::json!(1));
    }

    #[tokio::test]
    async fn memory_lww_keeps_newest() {
        let substrate = MemorySubstrate::new();
        substrate.put("k", entry(1, 20)).await.unwrap();
        // Older write loses.
        substrate.put("k", entry(2, 10)).await.unwrap();
        assert_eq!(
            substrate.get("k").await.unwrap().unwrap().value,
            serde_json::json!(1)
        );
        // Newer write wins.
        substrate.put("k", entry(3, 30)).await.unwrap();
        assert_eq!(
            substrate.get("k").await.unwrap().unwrap().value,
            serde_json::json!(3)
        );
    }

    #[tokio::test]
    async fn memory_lww_ties_break_on_writer_id() {
        let substrate = MemorySubstrate::new();
        substrate
            .put("k", Entry::new(serde_json::json!("a"), 10, "writer-a"))
            .await
            .unwrap();
        substrate
            .put("k", Entry::new(serde_json::json!("b"), 10, "writer-b"))
            .await
            .unwrap();
        assert_eq!(
            substrate.get("k").await.unwrap().unwrap().value,
            serde_json::json!("b")
        );
    }

    #[tokio::test]
    async fn memory_scan_is_prefix_bounded_and_ordered() {
        let substrate = MemorySubstrate::new();
        substrate.put("a/1", entry(1, 1)).await.unwrap();
        substrate.put("a/2", entry(2, 1)).await.unwrap();
        substrate.put("b/1", entry(3, 1)).await.unwrap();

        let keys: Vec<String> = substrate
            .scan("a/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
    }

    #[tokio::test]
    async fn sled_round_trip_and_lww() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = SledSubstrate::open(dir.path()).unwrap();

        substrate.put("k", entry(1, 20)).await.unwrap();
        substrate.put("k", entry(2, 10)).await.unwrap();
        assert_eq!(
            substrate.get("k").await.unwrap().unwrap().value,
            serde_json::json!(1)
        );

        substrate.remove("k").await.unwrap();
        assert!(substrate.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sled_scan_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = SledSubstrate::open(dir.path()).unwrap();
        substrate.put("sub/0xa", entry(1, 1)).await.unwrap();
        substrate.put("sub/0xb", entry(2, 1)).await.unwrap();
        substrate.put("deal/1", entry(3, 1)).await.unwrap();

        let found = substrate.scan("sub/").await.unwrap();
        assert_eq!(found.len(), 2);
    }
}
