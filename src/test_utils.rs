//! Shared test fixtures: scripted transport, fixed-size decoder, recording cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use url::Url;

use crate::cache::MemoryCache;
use crate::config::PipelineConfig;
use crate::coordinator::FetchCoordinator;
use crate::decoder::{Decoder, Image, RGB_CHANNELS};
use crate::error::{DecodeError, TransportError};
use crate::request::{ImageSize, RequestKey};
use crate::transport::{CachePolicy, Transport, TransportRequest, TransportResponse};

/// Body that makes [`FixedDecoder`] fail.
pub const CORRUPT_BODY: &[u8] = b"corrupt";

/// Enable tracing with the RUST_LOG environment variable.
///
/// This is intended to be used in tests, so it defaults to DEBUG level.
pub fn enable_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::DEBUG.into())
                .from_env_lossy(),
        )
        .with_test_writer()
        .try_init();
}

pub fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

/// Poll `cond` until it holds, failing the test after ~5 seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

#[derive(Clone)]
enum Scripted {
    Respond(TransportResponse),
    Fail(TransportError),
}

/// Transport returning scripted responses, with gauges for assertions.
pub struct MockTransport {
    scripted: Mutex<HashMap<String, Scripted>>,
    gate: Option<Semaphore>,
    requests: Mutex<Vec<(TransportRequest, CachePolicy)>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
    cache_clears: AtomicUsize,
}

impl MockTransport {
    /// Fetches complete immediately.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Fetches block until [`release`](Self::release) hands out permits.
    pub fn gated() -> Arc<Self> {
        Arc::new(Self::build(Some(Semaphore::new(0))))
    }

    fn build(gate: Option<Semaphore>) -> Self {
        Self {
            scripted: Mutex::new(HashMap::new()),
            gate,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            cache_clears: AtomicUsize::new(0),
        }
    }

    pub fn respond(&self, url: &str, status: u16, body: &'static [u8]) {
        self.scripted.lock().insert(
            url.to_owned(),
            Scripted::Respond(TransportResponse::http(status, Bytes::from_static(body))),
        );
    }

    pub fn fail(&self, url: &str, error: TransportError) {
        self.scripted
            .lock()
            .insert(url.to_owned(), Scripted::Fail(error));
    }

    /// Let `n` blocked fetches proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cache_clears(&self) -> usize {
        self.cache_clears.load(Ordering::SeqCst)
    }

    /// URLs in the order their fetches started.
    pub fn started(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|(r, _)| r.url.to_string())
            .collect()
    }

    pub fn requests(&self) -> Vec<(TransportRequest, CachePolicy)> {
        self.requests.lock().clone()
    }
}

/// Tracks one fetch; counts it as cancelled if dropped before finishing.
struct FetchGuard<'a> {
    transport: &'a MockTransport,
    finished: bool,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.transport.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.finished {
            self.transport.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.transport.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(
        &self,
        request: &TransportRequest,
        policy: CachePolicy,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push((request.clone(), policy));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let mut guard = FetchGuard {
            transport: self,
            finished: false,
        };

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?
                .forget();
        }

        let scripted = self.scripted.lock().get(request.url.as_str()).cloned();
        guard.finished = true;
        match scripted {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(error)) => Err(error),
            None => Ok(TransportResponse::http(200, Bytes::from_static(b"image"))),
        }
    }

    fn clear_cache(&self) {
        self.cache_clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// Decoder producing a blank image of the requested size (1x1 when unsized).
#[derive(Default)]
pub struct FixedDecoder {
    decodes: AtomicUsize,
}

impl FixedDecoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

impl Decoder for FixedDecoder {
    fn decode(&self, data: &[u8], size: Option<ImageSize>) -> Result<Image, DecodeError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        if data == CORRUPT_BODY {
            return Err(DecodeError::Malformed("corrupt test body".into()));
        }
        let size = size.unwrap_or(ImageSize::new(1, 1));
        let len = size.width as usize * size.height as usize * RGB_CHANNELS;
        Ok(Image::new(vec![0u8; len], size.width, size.height))
    }
}

/// HashMap-backed cache counting writes.
#[derive(Default)]
pub struct RecordingCache {
    images: Mutex<HashMap<RequestKey, Image>>,
    sets: AtomicUsize,
}

impl RecordingCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.images.lock().len()
    }
}

impl MemoryCache for RecordingCache {
    fn get(&self, key: &RequestKey) -> Option<Image> {
        self.images.lock().get(key).cloned()
    }

    fn set(&self, key: RequestKey, image: Image) {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.images.lock().insert(key, image);
    }

    fn remove(&self, key: &RequestKey) {
        self.images.lock().remove(key);
    }

    fn remove_all(&self) {
        self.images.lock().clear();
    }
}

/// Coordinator wired to the given mocks with a fixed-size decoder.
pub fn test_coordinator(
    transport: &Arc<MockTransport>,
    cache: &Arc<RecordingCache>,
) -> FetchCoordinator {
    FetchCoordinator::new(
        transport.clone(),
        cache.clone(),
        FixedDecoder::new(),
        &PipelineConfig::default(),
    )
    .unwrap()
}
