//! S3-compatible backend
//!
//! Directories are implicit key prefixes; `mkdir` writes a zero-byte
//! `{path}/` marker so empty directories survive listings. Renames are
//! copy-then-delete, which is the only move primitive S3 offers.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream as S3Body;
use aws_sdk_s3::Client;
use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::adapter::{
    guess_content_type, ByteStream, DriveEntry, DriveStats, EntryKind, FileMeta, StorageBackend,
};
use crate::error::{Result, StorageError};
use crate::path::clean_path;

/// Drive backend over an S3-compatible object store.
#[derive(Clone)]
pub struct S3Compatible {
    client: Client,
    bucket: String,
    prefix: String,
    spool_dir: std::path::PathBuf,
}

impl S3Compatible {
    /// Builds the backend from an already-configured SDK client.
    ///
    /// `prefix` scopes every key under `{prefix}/`; `spool_dir` is where
    /// incoming bodies are spooled before the single-part put.
    pub fn new(
        client: Client,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        spool_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self {
            client,
            bucket: bucket.into(),
            prefix,
            spool_dir: spool_dir.into(),
        }
    }

    fn key(&self, path: &str) -> Result<String> {
        let cleaned = clean_path(path)?;
        if self.prefix.is_empty() {
            Ok(cleaned)
        } else if cleaned.is_empty() {
            Ok(self.prefix.clone())
        } else {
            Ok(format!("{}/{}", self.prefix, cleaned))
        }
    }

    fn dir_prefix(&self, path: &str) -> Result<String> {
        let key = self.key(path)?;
        if key.is_empty() {
            Ok(String::new())
        } else {
            Ok(format!("{key}/"))
        }
    }

    fn backend_err(context: &str, e: impl std::fmt::Display) -> StorageError {
        StorageError::Backend(format!("{context}: {e}"))
    }

    fn to_chrono(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
        dt.and_then(|d| Utc.timestamp_opt(d.secs(), d.subsec_nanos()).single())
            .unwrap_or_else(Utc::now)
    }

    /// Collects every key under `prefix` (no delimiter), page by page.
    async fn keys_under(&self, prefix: &str) -> Result<Vec<(String, u64)>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| Self::backend_err("list_objects_v2", e))?;
            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    keys.push((key.to_string(), obj.size().unwrap_or(0).max(0) as u64));
                }
            }
            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl StorageBackend for S3Compatible {
    async fn list(&self, path: &str) -> Result<Vec<DriveEntry>> {
        let prefix = self.dir_prefix(path)?;
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/")
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| Self::backend_err("list_objects_v2", e))?;

            for common in resp.common_prefixes() {
                if let Some(p) = common.prefix() {
                    let name = p
                        .trim_end_matches('/')
                        .rsplit('/')
                        .next()
                        .unwrap_or_default()
                        .to_string();
                    entries.push(DriveEntry {
                        name,
                        kind: EntryKind::Dir,
                        size_bytes: 0,
                        modified_at: Utc::now(),
                    });
                }
            }
            for obj in resp.contents() {
                let Some(key) = obj.key() else { continue };
                // Skip the directory marker for the listed dir itself.
                if key == prefix || key.ends_with('/') {
                    continue;
                }
                let name = key.rsplit('/').next().unwrap_or_default().to_string();
                entries.push(DriveEntry {
                    name,
                    kind: EntryKind::File,
                    size_bytes: obj.size().unwrap_or(0).max(0) as u64,
                    modified_at: Self::to_chrono(obj.last_modified()),
                });
            }
            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read(&self, path: &str) -> Result<(ByteStream, FileMeta)> {
        let key = self.key(path)?;
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    StorageError::NotFound(path.to_string())
                } else {
                    Self::backend_err("get_object", service)
                }
            })?;

        let meta = FileMeta {
            size_bytes: resp.content_length().unwrap_or(0).max(0) as u64,
            content_type: resp
                .content_type()
                .map(str::to_string)
                .unwrap_or_else(|| guess_content_type(path).to_string()),
        };
        Ok((Box::pin(resp.body.into_async_read()), meta))
    }

    async fn write(&self, path: &str, mut data: ByteStream) -> Result<u64> {
        let key = self.key(path)?;

        // Spool to disk first so the put carries a known length and a
        // failed client stream never leaves a truncated object behind.
        tokio::fs::create_dir_all(&self.spool_dir).await?;
        let spool = self.spool_dir.join(format!(".s3-spool-{}", Uuid::new_v4()));
        let written = {
            let mut file = tokio::fs::File::create(&spool).await?;
            match tokio::io::copy(&mut data, &mut file).await {
                Ok(n) => n,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&spool).await;
                    return Err(StorageError::Io(e));
                }
            }
        };

        let body = S3Body::from_path(&spool)
            .await
            .map_err(|e| Self::backend_err("spool", e))?;
        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(guess_content_type(path))
            .body(body)
            .send()
            .await;
        let _ = tokio::fs::remove_file(&spool).await;
        put.map_err(|e| Self::backend_err("put_object", e))?;
        debug!(path, written, "wrote object");
        Ok(written)
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        if recursive {
            let prefix = self.dir_prefix(path)?;
            let keys = self.keys_under(&prefix).await?;
            let mut failed = 0usize;
            for (key, _) in &keys {
                if self
                    .client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .is_err()
                {
                    failed += 1;
                }
            }
            if failed > 0 {
                return Err(StorageError::Backend(format!(
                    "partial delete of {path}: {failed}/{} objects remain",
                    keys.len()
                )));
            }
            Ok(())
        } else {
            let key = self.key(path)?;
            // delete_object succeeds on missing keys; probe first so the
            // caller sees NotFound like the local backend reports it.
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|_| StorageError::NotFound(path.to_string()))?;
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| Self::backend_err("delete_object", e))?;
            Ok(())
        }
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let src_key = self.key(src)?;
        let dst_key = self.key(dst)?;
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, src_key))
            .key(&dst_key)
            .send()
            .await
            .map_err(|e| Self::backend_err("copy_object", e))?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&src_key)
            .send()
            .await
            .map_err(|e| Self::backend_err("delete_object", e))?;
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let marker = self.dir_prefix(path)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&marker)
            .body(S3Body::from_static(b""))
            .send()
            .await
            .map_err(|e| Self::backend_err("put_object", e))?;
        Ok(())
    }

    async fn stats(&self) -> Result<DriveStats> {
        let prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        let keys = self.keys_under(&prefix).await?;
        let mut stats = DriveStats::default();
        for (key, size) in keys {
            if key.ends_with('/') {
                stats.dir_count += 1;
            } else {
                stats.file_count += 1;
                stats.total_bytes += size;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_scoping_applies_prefix() {
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .build();
        let backend = S3Compatible::new(Client::from_conf(conf), "bucket", "/drive/", "/tmp");
        assert_eq!(backend.key("a/b.txt").unwrap(), "drive/a/b.txt");
        assert_eq!(backend.key("").unwrap(), "drive");
        assert_eq!(backend.dir_prefix("a").unwrap(), "drive/a/");
        assert!(backend.key("../x").is_err());
    }
}
