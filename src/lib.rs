//! ImageFetch Core - Deduplicating image fetch pipeline.
//!
//! This crate provides:
//! - A fetch coordinator that merges concurrent requests for the same image
//! - Per-caller cancellation with reference-counted shared fetches
//! - Decoded-image memory cache using moka (TinyLFU eviction)
//! - Off-runtime JPEG decoding and thumbnailing on a rayon thread pool
//! - A FIFO prefetch queue with bounded concurrency
//!
//! Usage:
//! ```no_run
//! use std::sync::Arc;
//! use imagefetch_core::{
//!     FetchCoordinator, FileTransport, ImageRequest, ImageRequestOptions, ImageSize,
//!     PipelineConfig, PrefetchScheduler,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::default().with_env_overrides();
//! let coordinator = FetchCoordinator::with_defaults(Arc::new(FileTransport), &config)?;
//!
//! let request = ImageRequest::new(
//!     url::Url::parse("file:///photos/cat.jpg")?,
//!     ImageRequestOptions::default().with_size(ImageSize::new(256, 256)),
//! );
//!
//! // Warm the cache for upcoming images
//! let prefetcher = PrefetchScheduler::from_config(coordinator.clone(), &config);
//! prefetcher.start_prefetching(&[request.clone()]);
//!
//! let image = coordinator.image(&request).await?;
//! println!("{}x{}", image.width, image.height);
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod coordinator;
mod decoder;
mod error;
mod prefetch;
mod request;
mod transport;
#[cfg(test)]
pub(crate) mod test_utils;

pub use cache::{CacheStats, MemoryCache, MokaMemoryCache};
pub use config::{fetch_timing_enabled, PipelineConfig, FETCH_TIMING_ENV};
pub use coordinator::FetchCoordinator;
pub use decoder::{thumbnail, thumbnail_size, Decoder, Image, JpegDecoder, RGB_CHANNELS};
pub use error::{ConfigError, DecodeError, FetchError, FetchResult, TransportError};
pub use prefetch::PrefetchScheduler;
pub use request::{
    ImageRequest, ImageRequestOptions, ImageSize, ImageSource, PrefetchKey, RequestKey,
};
pub use transport::{
    validate_status, Authenticator, CachePolicy, FileTransport, Transport, TransportRequest,
    TransportResponse, ACCEPTABLE_STATUS, ACCEPT_HEADER,
};
