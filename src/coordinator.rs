//! Fetch coordinator with request deduplication and memory caching.
//!
//! Concurrent requests for the same transport key are merged into one
//! [`FetchOperation`]. Every caller holds a subscription to the operation;
//! dropping a caller's future removes only its own subscription, and the
//! underlying fetch is aborted once the last subscription is gone.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::cache::{MemoryCache, MokaMemoryCache};
use crate::config::PipelineConfig;
use crate::decoder::{Decoder, Image, JpegDecoder};
use crate::error::{ConfigError, DecodeError, FetchError, FetchResult, TransportError};
use crate::request::{ImageRequest, ImageRequestOptions, ImageSize, ImageSource, RequestKey};
use crate::transport::{
    validate_status, Authenticator, CachePolicy, Transport, TransportRequest, ACCEPT_HEADER,
};

/// Result of one shared fetch, cloned out to every subscriber.
type SharedFetch = Shared<BoxFuture<'static, FetchResult<Bytes>>>;

/// Unique id of one caller awaiting an operation.
type SubscriberId = u64;

/// One in-flight network fetch for a transport key.
struct FetchOperation {
    /// Distinguishes this operation from later ones registered under the same key.
    id: u64,
    subscribers: HashSet<SubscriberId>,
    abort: AbortHandle,
    result: SharedFetch,
}

struct CoordinatorInner {
    cache: Arc<dyn MemoryCache>,
    transport: Arc<dyn Transport>,
    decoder: Arc<dyn Decoder>,
    decode_pool: rayon::ThreadPool,
    /// In-flight operations keyed by transport key.
    operations: Mutex<HashMap<String, FetchOperation>>,
    next_id: AtomicU64,
    fetch_timing: bool,
}

/// Downloads, decodes and caches images.
///
/// Cheap to clone; clones share the operation table and caches.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl FetchCoordinator {
    /// Create a coordinator from explicit collaborators.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the decode pool
    /// cannot be started.
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<dyn MemoryCache>,
        decoder: Arc<dyn Decoder>,
        config: &PipelineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let decode_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.decode_threads)
            .thread_name(|idx| format!("image-decode-{}", idx))
            .panic_handler(|_| warn!("decode job panicked"))
            .build()
            .map_err(|e| ConfigError::ThreadPool(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                cache,
                transport,
                decoder,
                decode_pool,
                operations: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                fetch_timing: config.fetch_timing,
            }),
        })
    }

    /// Create a coordinator with the moka memory cache and the JPEG decoder.
    pub fn with_defaults(
        transport: Arc<dyn Transport>,
        config: &PipelineConfig,
    ) -> Result<Self, ConfigError> {
        Self::new(
            transport,
            Arc::new(MokaMemoryCache::new(config.memory_cache_bytes)),
            Arc::new(JpegDecoder),
            config,
        )
    }

    /// Load a decoded image, from memory when possible.
    ///
    /// # Panics
    /// Panics if polled outside a Tokio runtime when a network fetch has to
    /// be started.
    pub async fn image(&self, request: &ImageRequest) -> FetchResult<Image> {
        let options = request.options();
        let key = request.key();

        if options.memory_cache_enabled {
            if let Some(image) = self.inner.cache.get(&key) {
                trace!(%key, "memory cache hit");
                return Ok(image);
            }
        }

        let t0 = self.inner.fetch_timing.then(Instant::now);
        let data = self.data(request).await?;
        let t_data = t0.map(|t| t.elapsed());

        let image = match self.decode(data, options.size).await {
            Ok(image) => image,
            Err(e) => {
                warn!(%key, error = %e, "image decode failed");
                return Err(e);
            }
        };

        if let (Some(t), Some(t_data)) = (t0, t_data) {
            let total = t.elapsed();
            info!(
                "[FETCH TIMING] {key}  data={:.2?} decode={:.2?} total={:.2?}",
                t_data,
                total - t_data,
                total
            );
        }

        if options.memory_cache_enabled {
            self.inner.cache.set(key, image.clone());
        }
        Ok(image)
    }

    /// Load an image for an address.
    pub async fn image_from(
        &self,
        url: Url,
        authenticator: Option<Arc<dyn Authenticator>>,
        options: ImageRequestOptions,
    ) -> FetchResult<Image> {
        let request = match authenticator {
            Some(authenticator) => ImageRequest::authenticated(url, authenticator, options),
            None => ImageRequest::new(url, options),
        };
        self.image(&request).await
    }

    /// Like [`image`](Self::image), but gives up with [`FetchError::Cancelled`]
    /// once `token` is cancelled.
    pub async fn image_with_cancellation(
        &self,
        request: &ImageRequest,
        token: &CancellationToken,
    ) -> FetchResult<Image> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(FetchError::Cancelled),
            result = self.image(request) => result,
        }
    }

    /// Load the raw bytes of a resource, joining an in-flight fetch if one exists.
    ///
    /// # Panics
    /// Panics if polled outside a Tokio runtime when no fetch for the
    /// resource is in flight.
    pub async fn data(&self, request: &ImageRequest) -> FetchResult<Bytes> {
        let transport_request = make_transport_request(request).await?;
        let policy = CachePolicy::for_disk_cache(request.options().disk_cache_enabled);
        let subscription = self.inner.subscribe(transport_request, policy);
        subscription.wait().await
    }

    /// Decode on the dedicated pool. Dropping the returned future discards the result.
    async fn decode(&self, data: Bytes, size: Option<ImageSize>) -> FetchResult<Image> {
        let (tx, rx) = oneshot::channel();
        let decoder = Arc::clone(&self.inner.decoder);
        self.inner.decode_pool.spawn(move || {
            let _ = tx.send(decoder.decode(&data, size));
        });
        // Sender is only dropped unsent if the decoder panicked
        let image = rx
            .await
            .map_err(|_| DecodeError::Malformed("decoder panicked".into()))??;
        Ok(image)
    }

    /// Returns an image from the memory cache without touching the network.
    pub fn cached_image(&self, request: &ImageRequest) -> Option<Image> {
        self.inner.cache.get(&request.key())
    }

    /// Returns an image from the memory cache for an address and size.
    pub fn cached_image_for(&self, url: &Url, size: Option<ImageSize>) -> Option<Image> {
        self.inner.cache.get(&RequestKey::new(url.clone(), size))
    }

    /// Store an image in the memory cache, or remove the entry when `image` is `None`.
    pub fn set_cached_image(&self, url: &Url, size: Option<ImageSize>, image: Option<Image>) {
        let key = RequestKey::new(url.clone(), size);
        match image {
            Some(image) => self.inner.cache.set(key, image),
            None => self.inner.cache.remove(&key),
        }
    }

    /// Drop cached responses held by both transport pools.
    pub fn clear_transport_cache(&self) {
        self.inner.transport.clear_cache();
    }

    /// Drop all decoded images from the memory cache.
    pub fn clear_memory_cache(&self) {
        self.inner.cache.remove_all();
    }

    /// Number of fetch operations currently in flight.
    pub fn operation_count(&self) -> usize {
        self.inner.operations.lock().len()
    }
}

impl CoordinatorInner {
    /// Attach a new subscriber to the operation for this request's key,
    /// starting the operation if none is in flight.
    fn subscribe(self: &Arc<Self>, request: TransportRequest, policy: CachePolicy) -> Subscription {
        let key = request.key().to_owned();
        let subscriber = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut operations = self.operations.lock();

        if let Some(operation) = operations.get_mut(&key) {
            operation.subscribers.insert(subscriber);
            debug!(
                %key,
                subscribers = operation.subscribers.len(),
                "joined in-flight fetch"
            );
            return Subscription {
                coordinator: Arc::downgrade(self),
                key,
                operation_id: operation.id,
                subscriber,
                result: operation.result.clone(),
                finished: false,
            };
        }

        let operation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(Self::run_fetch(
            Arc::downgrade(self),
            Arc::clone(&self.transport),
            request,
            policy,
            operation_id,
            self.fetch_timing,
        ));
        let abort = handle.abort_handle();
        let result: SharedFetch = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(FetchError::Cancelled),
                Err(e) => Err(FetchError::Transport(TransportError::Connection(format!(
                    "fetch task failed: {e}"
                )))),
            }
        }
        .boxed()
        .shared();

        debug!(%key, ?policy, "starting fetch");
        operations.insert(
            key.clone(),
            FetchOperation {
                id: operation_id,
                subscribers: HashSet::from([subscriber]),
                abort,
                result: result.clone(),
            },
        );

        Subscription {
            coordinator: Arc::downgrade(self),
            key,
            operation_id,
            subscriber,
            result,
            finished: false,
        }
    }

    /// Body of the spawned fetch task.
    async fn run_fetch(
        coordinator: Weak<Self>,
        transport: Arc<dyn Transport>,
        request: TransportRequest,
        policy: CachePolicy,
        operation_id: u64,
        fetch_timing: bool,
    ) -> FetchResult<Bytes> {
        let t0 = fetch_timing.then(Instant::now);
        let result = match transport.fetch(&request, policy).await {
            Ok(response) => validate_status(&response).map(|()| response.body),
            Err(e) => Err(FetchError::from(e)),
        };

        if let Some(t) = t0 {
            info!("[FETCH TIMING] {}  transport={:.2?}", request.url, t.elapsed());
        }
        if let Err(e) = &result {
            debug!(url = %request.url, error = %e, "fetch failed");
        }

        if let Some(coordinator) = coordinator.upgrade() {
            coordinator.complete(request.key(), operation_id);
        }
        result
    }

    /// Remove a finished operation so the next request starts fresh.
    fn complete(&self, key: &str, operation_id: u64) {
        let mut operations = self.operations.lock();
        if operations.get(key).is_some_and(|op| op.id == operation_id) {
            operations.remove(key);
            trace!(%key, "fetch operation completed");
        }
    }

    /// Remove one subscriber; cancel the fetch if it was the last one.
    fn unsubscribe(&self, key: &str, operation_id: u64, subscriber: SubscriberId) {
        let mut operations = self.operations.lock();
        let Some(operation) = operations.get_mut(key) else {
            return;
        };
        if operation.id != operation_id || !operation.subscribers.remove(&subscriber) {
            return;
        }
        if operation.subscribers.is_empty() {
            operation.abort.abort();
            operations.remove(key);
            debug!(%key, "last subscriber left, fetch cancelled");
        } else {
            trace!(
                %key,
                remaining = operation.subscribers.len(),
                "subscriber left shared fetch"
            );
        }
    }
}

/// One caller's claim on a [`FetchOperation`].
///
/// Dropping it before the result arrives unsubscribes the caller.
struct Subscription {
    coordinator: Weak<CoordinatorInner>,
    key: String,
    operation_id: u64,
    subscriber: SubscriberId,
    result: SharedFetch,
    finished: bool,
}

impl Subscription {
    async fn wait(mut self) -> FetchResult<Bytes> {
        let result = self.result.clone().await;
        self.finished = true;
        result
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.unsubscribe(&self.key, self.operation_id, self.subscriber);
        }
    }
}

/// Resolve a request into the transport request that will be sent.
async fn make_transport_request(request: &ImageRequest) -> FetchResult<TransportRequest> {
    match request.source() {
        ImageSource::Address { url, authenticator } => {
            let transport_request = match authenticator {
                Some(authenticator) => authenticator.authenticated_request(url).await?,
                None => TransportRequest::get(url.clone()),
            };
            Ok(transport_request.with_header(ACCEPT_HEADER.0, ACCEPT_HEADER.1))
        }
        ImageSource::Transport(transport_request) => Ok(transport_request.clone()),
    }
}
