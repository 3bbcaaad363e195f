//! Kubo RPC API client
//!
//! All endpoints live under `/api/v0` and are invoked with POST. Responses
//! are JSON except `add` and `repo/gc`, which stream newline-delimited
//! JSON, and `cat`, which streams raw bytes.

use bytes::Bytes;
use futures::TryStreamExt;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::error::{IpfsError, Result};

/// Default deadline for short calls (cat, stat, pin ls, unpin).
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Default deadline for pin additions, which may fetch remote blocks.
const DEFAULT_PIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Options for [`IpfsClient::add`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AddOptions {
    /// Wrap the uploaded content in a directory node.
    pub wrap_dir: bool,
    /// Pin the result as part of the add.
    pub pin: bool,
}

/// One entry produced by an `add` call.
#[derive(Debug, Clone)]
pub struct AddedEntry {
    pub name: String,
    pub cid: String,
    pub size_bytes: u64,
}

/// Result of an `add` call.
#[derive(Debug, Clone)]
pub struct AddOutcome {
    /// The authoritative cid: the wrapping directory when `wrap_dir` was
    /// set, the single file otherwise.
    pub cid: String,
    pub size_bytes: u64,
    /// Children entries for directory adds, empty otherwise.
    pub entries: Vec<AddedEntry>,
}

/// Pin listing filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinType {
    Direct,
    Recursive,
    All,
}

impl PinType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Recursive => "recursive",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddLine {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Hash")]
    hash: String,
    #[serde(rename = "Size", default)]
    size: String,
}

#[derive(Debug, Deserialize)]
struct StatResponse {
    #[serde(rename = "Key")]
    _key: Option<String>,
    #[serde(rename = "Size")]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(rename = "Version")]
    version: String,
}

#[derive(Clone)]
pub struct IpfsClient {
    base_url: String,
    http: reqwest::Client,
    call_timeout: Duration,
    pin_timeout: Duration,
}

impl IpfsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            pin_timeout: DEFAULT_PIN_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, call_timeout: Duration, pin_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self.pin_timeout = pin_timeout;
        self
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/v0/{}", self.base_url, endpoint)
    }

    /// Runs `fut` under `deadline`; an elapsed deadline becomes
    /// [`IpfsError::Timeout`] so callers can classify it as transient.
    async fn with_deadline<T, F>(deadline: Duration, context: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(IpfsError::Timeout {
                timeout_secs: deadline.as_secs(),
                context: context.to_string(),
            }),
        }
    }

    async fn check_status(endpoint: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            let message = resp.text().await.unwrap_or_default();
            Err(IpfsError::Api {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                message,
            })
        }
    }

    fn parse_add_lines(body: &str) -> Result<AddOutcome> {
        let mut entries = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let parsed: AddLine = serde_json::from_str(line)
                .map_err(|e| IpfsError::InvalidResponse(format!("add line {line:?}: {e}")))?;
            entries.push(AddedEntry {
                name: parsed.name,
                cid: parsed.hash,
                size_bytes: parsed.size.parse().unwrap_or(0),
            });
        }
        // The last line is the root of the added tree: the wrapping
        // directory for wrapped adds, the file itself otherwise.
        let root = entries
            .last()
            .cloned()
            .ok_or_else(|| IpfsError::InvalidResponse("empty add response".into()))?;
        let children = if entries.len() > 1 {
            entries[..entries.len() - 1].to_vec()
        } else {
            Vec::new()
        };
        Ok(AddOutcome {
            cid: root.cid,
            size_bytes: root.size_bytes,
            entries: children,
        })
    }

    /// Adds a single named blob.
    pub async fn add(&self, name: &str, content: Bytes, opts: AddOptions) -> Result<AddOutcome> {
        self.add_parts(vec![(name.to_string(), content)], opts).await
    }

    /// Adds multiple blobs in one call, preserving relative paths.
    /// With `wrap_dir` the store returns a directory cid covering them all.
    pub async fn add_parts(
        &self,
        parts: Vec<(String, Bytes)>,
        opts: AddOptions,
    ) -> Result<AddOutcome> {
        let endpoint = format!(
            "add?pin={}&wrap-with-directory={}&cid-version=1",
            opts.pin, opts.wrap_dir
        );
        let url = self.url(&endpoint);
        debug!(parts = parts.len(), wrap = opts.wrap_dir, "ipfs add");

        let mut form = reqwest::multipart::Form::new();
        for (path, content) in parts {
            let part = reqwest::multipart::Part::bytes(content.to_vec())
                .file_name(path)
                .mime_str("application/octet-stream")
                .map_err(|e| IpfsError::InvalidResponse(e.to_string()))?;
            form = form.part("file", part);
        }

        let http = self.http.clone();
        Self::with_deadline(self.pin_timeout, "add", async move {
            let resp = http.post(&url).multipart(form).send().await?;
            let resp = Self::check_status("add", resp).await?;
            let body = resp.text().await?;
            Self::parse_add_lines(&body)
        })
        .await
    }

    /// Adds a single blob from an async reader without buffering it whole.
    /// `size_hint` lets the multipart body carry a known length.
    pub async fn add_stream(
        &self,
        name: &str,
        size_hint: Option<u64>,
        reader: Pin<Box<dyn AsyncRead + Send + 'static>>,
        opts: AddOptions,
    ) -> Result<AddOutcome> {
        let endpoint = format!(
            "add?pin={}&wrap-with-directory={}&cid-version=1",
            opts.pin, opts.wrap_dir
        );
        let url = self.url(&endpoint);
        debug!(name, wrap = opts.wrap_dir, "ipfs add (stream)");

        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(reader));
        let part = match size_hint {
            Some(len) => reqwest::multipart::Part::stream_with_length(body, len),
            None => reqwest::multipart::Part::stream(body),
        }
        .file_name(name.to_string())
        .mime_str("application/octet-stream")
        .map_err(|e| IpfsError::InvalidResponse(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let http = self.http.clone();
        Self::with_deadline(self.pin_timeout, "add", async move {
            let resp = http.post(&url).multipart(form).send().await?;
            let resp = Self::check_status("add", resp).await?;
            let body = resp.text().await?;
            Self::parse_add_lines(&body)
        })
        .await
    }

    /// Pins `cid`, fetching blocks from the network if necessary.
    pub async fn pin(&self, cid: &str, timeout: Option<Duration>) -> Result<()> {
        let url = self.url(&format!("pin/add?arg={cid}"));
        let http = self.http.clone();
        let deadline = timeout.unwrap_or(self.pin_timeout);
        Self::with_deadline(deadline, "pin/add", async move {
            let resp = http.post(&url).send().await?;
            Self::check_status("pin/add", resp).await?;
            Ok(())
        })
        .await
    }

    /// Unpins `cid`. Missing pins are not an error.
    pub async fn unpin(&self, cid: &str) -> Result<()> {
        let url = self.url(&format!("pin/rm?arg={cid}"));
        let http = self.http.clone();
        Self::with_deadline(self.call_timeout, "pin/rm", async move {
            let resp = http.post(&url).send().await?;
            match Self::check_status("pin/rm", resp).await {
                Ok(_) => Ok(()),
                Err(IpfsError::Api { message, .. }) if message.contains("not pinned") => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Lists pinned cids of the given type.
    pub async fn pin_ls(&self, pin_type: PinType) -> Result<Vec<String>> {
        let url = self.url(&format!("pin/ls?type={}", pin_type.as_str()));
        let http = self.http.clone();
        Self::with_deadline(self.call_timeout, "pin/ls", async move {
            let resp = http.post(&url).send().await?;
            let resp = Self::check_status("pin/ls", resp).await?;
            let body: serde_json::Value = resp.json().await?;
            let keys = body
                .get("Keys")
                .and_then(|k| k.as_object())
                .ok_or_else(|| IpfsError::InvalidResponse("pin/ls missing Keys".into()))?;
            Ok(keys.keys().cloned().collect())
        })
        .await
    }

    /// Streams the content behind `cid` (optionally a subpath within a
    /// directory cid, optionally a byte range). The deadline covers
    /// response headers; body streaming is bounded by the caller.
    pub async fn cat(
        &self,
        cid: &str,
        subpath: Option<&str>,
        range: Option<(u64, u64)>,
    ) -> Result<Pin<Box<dyn AsyncRead + Send>>> {
        let arg = match subpath {
            Some(sub) => format!("{cid}/{sub}"),
            None => cid.to_string(),
        };
        let mut endpoint = format!("cat?arg={arg}");
        if let Some((offset, length)) = range {
            endpoint.push_str(&format!("&offset={offset}&length={length}"));
        }
        let url = self.url(&endpoint);
        let http = self.http.clone();
        let resp = Self::with_deadline(self.call_timeout, "cat", async move {
            let resp = http.post(&url).send().await?;
            Self::check_status("cat", resp).await
        })
        .await?;

        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::pin(StreamReader::new(stream)))
    }

    /// Convenience wrapper reading a full `cat` stream into memory.
    pub async fn cat_bytes(&self, cid: &str, subpath: Option<&str>) -> Result<Vec<u8>> {
        let mut reader = self.cat(cid, subpath, None).await?;
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf)
            .await
            .map_err(|e| IpfsError::InvalidResponse(format!("cat stream: {e}")))?;
        Ok(buf)
    }

    /// Returns the stored size of a block.
    pub async fn stat(&self, cid: &str) -> Result<u64> {
        let url = self.url(&format!("block/stat?arg={cid}"));
        let http = self.http.clone();
        Self::with_deadline(self.call_timeout, "block/stat", async move {
            let resp = http.post(&url).send().await?;
            let resp = Self::check_status("block/stat", resp).await?;
            let stat: StatResponse = resp.json().await?;
            Ok(stat.size)
        })
        .await
    }

    /// True when the store has the block locally (offline check).
    pub async fn has_local(&self, cid: &str) -> Result<bool> {
        match self.stat(cid).await {
            Ok(_) => Ok(true),
            Err(IpfsError::Api { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Asks the store to collect unreferenced blocks.
    pub async fn gc(&self) -> Result<()> {
        let url = self.url("repo/gc");
        let http = self.http.clone();
        Self::with_deadline(self.pin_timeout, "repo/gc", async move {
            let resp = http.post(&url).send().await?;
            Self::check_status("repo/gc", resp).await?;
            Ok(())
        })
        .await
    }

    /// Store version string; used by the health endpoint as a liveness probe.
    pub async fn version(&self) -> Result<String> {
        let url = self.url("version");
        let http = self.http.clone();
        Self::with_deadline(self.call_timeout, "version", async move {
            let resp = http.post(&url).send().await?;
            let resp = Self::check_status("version", resp).await?;
            let v: VersionResponse = resp.json().await?;
            Ok(v.version)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn add_response_single() -> String {
        r#"{"Name":"hello.txt","Hash":"bafyfile","Size":"13"}"#.to_string()
    }

    fn add_response_wrapped() -> String {
        [
            r#"{"Name":"a.txt","Hash":"bafyaaa","Size":"3"}"#,
            r#"{"Name":"b.txt","Hash":"bafybbb","Size":"4"}"#,
            r#"{"Name":"","Hash":"bafydir","Size":"120"}"#,
        ]
        .join("\n")
    }

    async fn client_for(server: &MockServer) -> IpfsClient {
        IpfsClient::new(server.uri())
    }

    // -----------------------------------------------------------------------
    // add
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn add_single_file_returns_cid_and_size() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/add"))
            .and(query_param("pin", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_string(add_response_single()))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let outcome = client
            .add(
                "hello.txt",
                Bytes::from_static(b"hello, storage"),
                AddOptions {
                    wrap_dir: false,
                    pin: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.cid, "bafyfile");
        assert_eq!(outcome.size_bytes, 13);
        assert!(outcome.entries.is_empty());
    }

    #[tokio::test]
    async fn add_wrapped_directory_enumerates_children() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/add"))
            .and(query_param("wrap-with-directory", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_string(add_response_wrapped()))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let outcome = client
            .add_parts(
                vec![
                    ("a.txt".to_string(), Bytes::from_static(b"aaa")),
                    ("b.txt".to_string(), Bytes::from_static(b"bbbb")),
                ],
                AddOptions {
                    wrap_dir: true,
                    pin: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.cid, "bafydir");
        assert_eq!(outcome.entries.len(), 2);
        assert_eq!(outcome.entries[0].name, "a.txt");
        assert_eq!(outcome.entries[1].cid, "bafybbb");
    }

    #[tokio::test]
    async fn add_empty_response_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/add"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .add("x", Bytes::from_static(b"x"), AddOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IpfsError::InvalidResponse(_)));
    }

    // -----------------------------------------------------------------------
    // pin / unpin / pin_ls
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn pin_add_hits_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/pin/add"))
            .and(query_param("arg", "bafyfile"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"Pins":["bafyfile"]}"#))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client.pin("bafyfile", None).await.unwrap();
    }

    #[tokio::test]
    async fn unpin_tolerates_not_pinned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/pin/rm"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_string(r#"{"Message":"not pinned or pinned indirectly"}"#),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client.unpin("bafygone").await.unwrap();
    }

    #[tokio::test]
    async fn pin_ls_parses_keys() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/pin/ls"))
            .and(query_param("type", "recursive"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"Keys":{"bafyone":{"Type":"recursive"},"bafytwo":{"Type":"recursive"}}}"#,
            ))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let mut pins = client.pin_ls(PinType::Recursive).await.unwrap();
        pins.sort();
        assert_eq!(pins, vec!["bafyone", "bafytwo"]);
    }

    // -----------------------------------------------------------------------
    // cat / stat
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn cat_streams_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/cat"))
            .and(query_param("arg", "bafyfile"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let body = client.cat_bytes("bafyfile", None).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn cat_with_range_passes_offset_and_length() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/cat"))
            .and(query_param("offset", "2"))
            .and(query_param("length", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"llo".to_vec()))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let mut reader = client.cat("bafyfile", None, Some((2, 3))).await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"llo");
    }

    #[tokio::test]
    async fn stat_returns_size_and_has_local_maps_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/block/stat"))
            .and(query_param("arg", "bafyfile"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"Key":"bafyfile","Size":512}"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v0/block/stat"))
            .and(query_param("arg", "bafymissing"))
            .respond_with(
                ResponseTemplate::new(500).set_body_string(r#"{"Message":"blockstore: block not found"}"#),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert_eq!(client.stat("bafyfile").await.unwrap(), 512);
        assert!(client.has_local("bafyfile").await.unwrap());
        assert!(!client.has_local("bafymissing").await.unwrap());
    }

    // -----------------------------------------------------------------------
    // deadlines and errors
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn slow_store_surfaces_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/pin/add"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let client = IpfsClient::new(server.uri())
            .with_timeouts(Duration::from_millis(50), Duration::from_millis(50));
        let err = client.pin("bafyslow", None).await.unwrap_err();
        assert!(matches!(err, IpfsError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn api_error_carries_status_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/version"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        match client.version().await.unwrap_err() {
            IpfsError::Api {
                status, message, ..
            } => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn version_parses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/version"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"Version":"0.29.0"}"#))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert_eq!(client.version().await.unwrap(), "0.29.0");
    }
}
