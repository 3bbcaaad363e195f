//! Local-filesystem backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapter::{
    guess_content_type, ByteStream, DriveEntry, DriveStats, EntryKind, FileMeta, StorageBackend,
};
use crate::error::{Result, StorageError};
use crate::path::clean_path;

/// Default number of directories statted concurrently during [`LocalFs::stats`].
const DEFAULT_STATS_FAN_OUT: usize = 8;

/// Drive backend rooted at a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
    stats_fan_out: usize,
}

impl LocalFs {
    /// Creates the backend, making the root directory if it does not exist.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            stats_fan_out: DEFAULT_STATS_FAN_OUT,
        })
    }

    pub fn with_stats_fan_out(mut self, fan_out: usize) -> Self {
        self.stats_fan_out = fan_out.max(1);
        self
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let cleaned = clean_path(path)?;
        Ok(self.root.join(cleaned))
    }

    async fn entry_from(path: &Path) -> Result<Option<DriveEntry>> {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            // Non-UTF-8 names cannot round-trip through the API; skip them.
            None => return Ok(None),
        };
        let meta = fs::metadata(path).await?;
        let modified_at: DateTime<Utc> = meta
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(DriveEntry {
            name,
            kind: if meta.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            },
            size_bytes: if meta.is_dir() { 0 } else { meta.len() },
            modified_at,
        }))
    }

    /// Reads one directory level: children entries plus subdirectory paths.
    async fn scan_dir(dir: PathBuf) -> std::io::Result<(Vec<PathBuf>, u64, u64)> {
        let mut subdirs = Vec::new();
        let mut bytes = 0u64;
        let mut files = 0u64;
        let mut reader = fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                subdirs.push(entry.path());
            } else {
                files += 1;
                bytes += meta.len();
            }
        }
        Ok((subdirs, bytes, files))
    }
}

#[async_trait]
impl StorageBackend for LocalFs {
    async fn list(&self, path: &str) -> Result<Vec<DriveEntry>> {
        let dir = self.resolve(path)?;
        let mut reader = fs::read_dir(&dir)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| StorageError::from_io(e, path))?
        {
            if let Some(e) = Self::entry_from(&entry.path()).await? {
                entries.push(e);
            }
        }
        // Deterministic order for callers and tests.
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read(&self, path: &str) -> Result<(ByteStream, FileMeta)> {
        let full = self.resolve(path)?;
        let file = fs::File::open(&full)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| StorageError::from_io(e, path))?;
        if meta.is_dir() {
            return Err(StorageError::Backend(format!(
                "cannot read a directory: {path}"
            )));
        }
        let file_meta = FileMeta {
            size_bytes: meta.len(),
            content_type: guess_content_type(path).to_string(),
        };
        Ok((Box::pin(file), file_meta))
    }

    async fn write(&self, path: &str, mut data: ByteStream) -> Result<u64> {
        let full = self.resolve(path)?;
        if path.is_empty() {
            return Err(StorageError::Backend("cannot write to the root".into()));
        }
        let parent = full
            .parent()
            .ok_or_else(|| StorageError::Backend(format!("no parent for {path}")))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;

        // Stream into a sibling temp file, then rename over the target so a
        // reader never observes a half-written body.
        let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let written = {
            let mut file = fs::File::create(&tmp)
                .await
                .map_err(|e| StorageError::from_io(e, path))?;
            let copied = tokio::io::copy(&mut data, &mut file).await;
            match copied {
                Ok(n) => {
                    file.flush().await.map_err(StorageError::Io)?;
                    n
                }
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&tmp).await;
                    return Err(StorageError::Io(e));
                }
            }
        };
        if let Err(e) = fs::rename(&tmp, &full).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::from_io(e, path));
        }
        debug!(path, written, "wrote drive file");
        Ok(written)
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;
        if meta.is_dir() {
            if recursive {
                // remove_dir_all is not transactional; an interrupted run
                // leaves a consistent (partially deleted) tree behind.
                fs::remove_dir_all(&full).await.map_err(|e| {
                    warn!(path, error = %e, "recursive delete interrupted");
                    StorageError::Backend(format!("partial delete of {path}: {e}"))
                })?;
            } else {
                fs::remove_dir(&full)
                    .await
                    .map_err(|e| StorageError::from_io(e, path))?;
            }
        } else {
            fs::remove_file(&full)
                .await
                .map_err(|e| StorageError::from_io(e, path))?;
        }
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let from = self.resolve(src)?;
        let to = self.resolve(dst)?;
        if fs::metadata(&to).await.is_ok() {
            return Err(StorageError::AlreadyExists(dst.to_string()));
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(e, dst))?;
        }
        fs::rename(&from, &to)
            .await
            .map_err(|e| StorageError::from_io(e, src))?;
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        fs::create_dir_all(&full)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;
        Ok(())
    }

    async fn stats(&self) -> Result<DriveStats> {
        let mut totals = DriveStats::default();
        let mut frontier = vec![self.root.clone()];

        while !frontier.is_empty() {
            let batch: Vec<PathBuf> = frontier.drain(..).collect();
            let results: Vec<std::io::Result<(Vec<PathBuf>, u64, u64)>> =
                stream::iter(batch.into_iter().map(Self::scan_dir))
                    .buffer_unordered(self.stats_fan_out)
                    .collect()
                    .await;

            for result in results {
                let (subdirs, bytes, files) = result.map_err(StorageError::Io)?;
                totals.total_bytes += bytes;
                totals.file_count += files;
                totals.dir_count += subdirs.len() as u64;
                frontier.extend(subdirs);
            }
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(bytes: &'static [u8]) -> ByteStream {
        Box::pin(bytes)
    }

    async fn backend() -> (tempfile::TempDir, LocalFs) {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path()).await.unwrap();
        (dir, fs)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_guard, fs) = backend().await;
        let written = fs.write("docs/hello.txt", stream_of(b"hello")).await.unwrap();
        assert_eq!(written, 5);

        let (mut stream, meta) = fs.read("docs/hello.txt").await.unwrap();
        assert_eq!(meta.size_bytes, 5);
        assert_eq!(meta.content_type, "text/plain");

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn write_replaces_existing_content_atomically() {
        let (_guard, fs) = backend().await;
        fs.write("a.txt", stream_of(b"first")).await.unwrap();
        fs.write("a.txt", stream_of(b"second!")).await.unwrap();

        let (_, meta) = fs.read("a.txt").await.unwrap();
        assert_eq!(meta.size_bytes, 7);

        // No temp droppings left behind.
        let listing = fs.list("").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "a.txt");
    }

    #[tokio::test]
    async fn list_is_name_sorted() {
        let (_guard, fs) = backend().await;
        fs.write("b.txt", stream_of(b"b")).await.unwrap();
        fs.write("a.txt", stream_of(b"a")).await.unwrap();
        fs.mkdir("c").await.unwrap();

        let names: Vec<String> = fs
            .list("")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "c"]);
    }

    #[tokio::test]
    async fn read_missing_file_is_not_found() {
        let (_guard, fs) = backend().await;
        assert!(matches!(
            fs.read("missing.bin").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn traversal_is_rejected_without_touching_disk() {
        let (_guard, fs) = backend().await;
        assert!(matches!(
            fs.read("../etc/passwd").await,
            Err(StorageError::PathEscape(_))
        ));
        assert!(matches!(
            fs.write("../x", stream_of(b"x")).await,
            Err(StorageError::PathEscape(_))
        ));
        assert!(matches!(
            fs.delete("..", true).await,
            Err(StorageError::PathEscape(_))
        ));
    }

    #[tokio::test]
    async fn delete_file_and_dir() {
        let (_guard, fs) = backend().await;
        fs.write("d/one.txt", stream_of(b"1")).await.unwrap();
        fs.write("d/two.txt", stream_of(b"2")).await.unwrap();

        fs.delete("d/one.txt", false).await.unwrap();
        assert!(matches!(
            fs.read("d/one.txt").await,
            Err(StorageError::NotFound(_))
        ));

        fs.delete("d", true).await.unwrap();
        assert!(matches!(fs.list("d").await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn rename_moves_and_refuses_overwrite() {
        let (_guard, fs) = backend().await;
        fs.write("src.txt", stream_of(b"data")).await.unwrap();
        fs.rename("src.txt", "sub/dst.txt").await.unwrap();

        let (_, meta) = fs.read("sub/dst.txt").await.unwrap();
        assert_eq!(meta.size_bytes, 4);

        fs.write("other.txt", stream_of(b"x")).await.unwrap();
        assert!(matches!(
            fs.rename("other.txt", "sub/dst.txt").await,
            Err(StorageError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn stats_counts_whole_tree() {
        let (_guard, fs) = backend().await;
        fs.write("a.txt", stream_of(b"12345")).await.unwrap();
        fs.write("d1/b.txt", stream_of(b"123")).await.unwrap();
        fs.write("d1/d2/c.txt", stream_of(b"12")).await.unwrap();

        let stats = fs.stats().await.unwrap();
        assert_eq!(stats.total_bytes, 10);
        assert_eq!(stats.file_count, 3);
        assert_eq!(stats.dir_count, 2);
    }
}
