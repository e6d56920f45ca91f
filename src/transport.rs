//! Transport collaborator contracts and the built-in `file://` transport.

use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::error::{FetchError, FetchResult, TransportError};

/// Status codes accepted as a successful fetch.
pub const ACCEPTABLE_STATUS: Range<u16> = 200..400;

/// Content negotiation header attached to address requests.
pub const ACCEPT_HEADER: (&str, &str) = ("Accept", "image/*");

/// A request ready to hand to a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

impl TransportRequest {
    /// Plain GET request without headers.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
        }
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Key used to merge concurrent fetches of the same resource.
    pub fn key(&self) -> &str {
        self.url.as_str()
    }
}

/// Bytes plus status metadata.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub body: Bytes,
    /// HTTP status, or `None` for non-HTTP responses such as `file://`.
    pub status: Option<u16>,
}

impl TransportResponse {
    pub fn http(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            status: Some(status),
        }
    }

    pub fn local(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            status: None,
        }
    }
}

/// Which connection/cache pool a fetch goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachePolicy {
    /// Pool backed by a response cache.
    UseCache,
    /// Pool that never caches responses.
    NoCache,
}

impl CachePolicy {
    pub fn for_disk_cache(enabled: bool) -> Self {
        if enabled {
            CachePolicy::UseCache
        } else {
            CachePolicy::NoCache
        }
    }
}

/// Network fetch abstraction.
///
/// Implementations keep one independent pool per [`CachePolicy`], configured
/// once and not changed afterwards. Timeouts are the implementation's concern.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the resource through the pool selected by `policy`.
    async fn fetch(
        &self,
        request: &TransportRequest,
        policy: CachePolicy,
    ) -> Result<TransportResponse, TransportError>;

    /// Drop all cached responses from both pools.
    fn clear_cache(&self) {}
}

/// Produces authenticated transport requests for protected addresses.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticated_request(&self, url: &Url) -> FetchResult<TransportRequest>;
}

/// Reject responses whose HTTP status is outside [`ACCEPTABLE_STATUS`].
pub fn validate_status(response: &TransportResponse) -> FetchResult<()> {
    match response.status {
        Some(code) if !ACCEPTABLE_STATUS.contains(&code) => {
            Err(FetchError::UnacceptableStatus(code))
        }
        _ => Ok(()),
    }
}

/// Transport for `file://` URLs.
///
/// Both cache policies read straight from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileTransport;

#[async_trait]
impl Transport for FileTransport {
    async fn fetch(
        &self,
        request: &TransportRequest,
        _policy: CachePolicy,
    ) -> Result<TransportResponse, TransportError> {
        if request.url.scheme() != "file" {
            return Err(TransportError::UnsupportedScheme(
                request.url.scheme().to_owned(),
            ));
        }
        let path = request.url.to_file_path().map_err(|_| {
            TransportError::Connection(format!("Not a local path: {}", request.url))
        })?;
        let data = tokio::fs::read(&path).await?;
        Ok(TransportResponse::local(data))
    }
}
