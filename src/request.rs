//! Image request values and the keys derived from them.

use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::transport::{Authenticator, TransportRequest};

/// Image size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixel size for a size in points on a display with the given scale.
    ///
    /// Scales below 1.0 are treated as 1.0.
    pub fn scaled(width_points: f64, height_points: f64, scale: f64) -> Self {
        let scale = scale.max(1.0);
        Self {
            width: (width_points * scale).max(0.0) as u32,
            height: (height_points * scale).max(0.0) as u32,
        }
    }
}

/// Per-request caching and rendering options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageRequestOptions {
    /// Resize the decoded image to this size. `None` keeps the original size.
    pub size: Option<ImageSize>,
    /// Read from and store into the memory cache of decoded images.
    pub memory_cache_enabled: bool,
    /// Fetch through the caching transport pool.
    pub disk_cache_enabled: bool,
}

impl Default for ImageRequestOptions {
    fn default() -> Self {
        Self {
            size: None,
            memory_cache_enabled: true,
            disk_cache_enabled: true,
        }
    }
}

impl ImageRequestOptions {
    pub fn with_size(mut self, size: ImageSize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn memory_cache(mut self, enabled: bool) -> Self {
        self.memory_cache_enabled = enabled;
        self
    }

    pub fn disk_cache(mut self, enabled: bool) -> Self {
        self.disk_cache_enabled = enabled;
        self
    }
}

/// Where the image bytes come from.
#[derive(Clone)]
pub enum ImageSource {
    /// A plain address, optionally authenticated before fetching.
    Address {
        url: Url,
        authenticator: Option<Arc<dyn Authenticator>>,
    },
    /// A fully prepared transport request, sent as-is.
    Transport(TransportRequest),
}

impl ImageSource {
    /// The resolved address of the resource.
    pub fn url(&self) -> &Url {
        match self {
            ImageSource::Address { url, .. } => url,
            ImageSource::Transport(request) => &request.url,
        }
    }
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Address { url, authenticator } => f
                .debug_struct("Address")
                .field("url", &url.as_str())
                .field("authenticated", &authenticator.is_some())
                .finish(),
            ImageSource::Transport(request) => f.debug_tuple("Transport").field(request).finish(),
        }
    }
}

/// An immutable request for an image.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    source: ImageSource,
    options: ImageRequestOptions,
}

impl ImageRequest {
    /// Request an unauthenticated address.
    pub fn new(url: Url, options: ImageRequestOptions) -> Self {
        Self {
            source: ImageSource::Address {
                url,
                authenticator: None,
            },
            options,
        }
    }

    /// Request an address that must be authenticated before fetching.
    pub fn authenticated(
        url: Url,
        authenticator: Arc<dyn Authenticator>,
        options: ImageRequestOptions,
    ) -> Self {
        Self {
            source: ImageSource::Address {
                url,
                authenticator: Some(authenticator),
            },
            options,
        }
    }

    /// Request using a prepared transport request.
    pub fn from_transport_request(request: TransportRequest, options: ImageRequestOptions) -> Self {
        Self {
            source: ImageSource::Transport(request),
            options,
        }
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    pub fn options(&self) -> &ImageRequestOptions {
        &self.options
    }

    pub fn url(&self) -> &Url {
        self.source.url()
    }

    /// Canonical key used for the memory cache.
    pub fn key(&self) -> RequestKey {
        RequestKey::new(self.url().clone(), self.options.size)
    }
}

/// Canonical identity of a decoded image: address plus target size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub address: Url,
    pub size: Option<ImageSize>,
}

impl RequestKey {
    pub fn new(address: Url, size: Option<ImageSize>) -> Self {
        Self { address, size }
    }

    /// String form, e.g. `https://x/img.png?w=100,h=100`.
    pub fn cache_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.size {
            Some(size) => write!(f, "{}?w={},h={}", self.address, size.width, size.height),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Prefetch queue slot identity: the resolved address only.
///
/// Requests that differ only in size or cache flags share one slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrefetchKey(String);

impl PrefetchKey {
    pub fn new(request: &ImageRequest) -> Self {
        Self(request.url().as_str().to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrefetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
