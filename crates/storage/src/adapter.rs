//! Backend-agnostic storage contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::pin::Pin;
use tokio::io::AsyncRead;

use crate::error::Result;

/// Boxed async byte stream handed across the adapter boundary.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Kind of a drive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// A single node in the drive tree.
#[derive(Debug, Clone, Serialize)]
pub struct DriveEntry {
    pub name: String,
    pub kind: EntryKind,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
    #[serde(rename = "modifiedAt")]
    pub modified_at: DateTime<Utc>,
}

/// Metadata returned alongside a read stream.
#[derive(Debug, Clone, Serialize)]
pub struct FileMeta {
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
    #[serde(rename = "contentType")]
    pub content_type: String,
}

/// Aggregate usage of the whole drive tree.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DriveStats {
    #[serde(rename = "totalBytes")]
    pub total_bytes: u64,
    #[serde(rename = "fileCount")]
    pub file_count: u64,
    #[serde(rename = "dirCount")]
    pub dir_count: u64,
}

/// Capability interface over a rooted file tree.
///
/// All paths are pre-cleaned relative paths (see [`crate::clean_path`]);
/// implementations may assume they do not escape the root. Writes are
/// atomic per path; concurrent writers to the same path are serialized by
/// the upload pipeline, not here.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Lists the direct children of a directory, sorted by name.
    async fn list(&self, path: &str) -> Result<Vec<DriveEntry>>;

    /// Opens a file for streaming reads.
    async fn read(&self, path: &str) -> Result<(ByteStream, FileMeta)>;

    /// Streams `data` into `path`, replacing any previous content only once
    /// the full body has been persisted. Returns the byte count written.
    async fn write(&self, path: &str, data: ByteStream) -> Result<u64>;

    /// Removes a file, or a directory when `recursive` is set.
    async fn delete(&self, path: &str, recursive: bool) -> Result<()>;

    /// Renames `src` to `dst` within the backend.
    async fn rename(&self, src: &str, dst: &str) -> Result<()>;

    /// Creates a directory (and missing parents).
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Walks the whole tree and returns aggregate usage.
    async fn stats(&self) -> Result<DriveStats>;
}

/// Best-effort content type from a file extension.
///
/// The relay is a blind carrier; this only feeds the `Content-Type` header
/// on downloads and the metadata echoed back after uploads.
pub fn guess_content_type(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or_default();
    match ext.to_ascii_lowercase().as_str() {
        "txt" | "text" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_guesses() {
        assert_eq!(guess_content_type("hello.txt"), "text/plain");
        assert_eq!(guess_content_type("a/b/photo.JPG"), "image/jpeg");
        assert_eq!(guess_content_type("archive.tar"), "application/x-tar");
        assert_eq!(guess_content_type("noext"), "application/octet-stream");
    }

    #[test]
    fn drive_entry_serializes_camel_case() {
        let entry = DriveEntry {
            name: "a.txt".to_string(),
            kind: EntryKind::File,
            size_bytes: 5,
            modified_at: Utc::now(),
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["kind"], "file");
        assert_eq!(v["sizeBytes"], 5);
        assert!(v.get("modifiedAt").is_some());
    }
}
