//! Shared test fixtures: a scriptable data loader, counting cache
//! decorators, marker processors, and a mock progressive decoder.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::watch;
use url::Url;

use pixfetch::cache::{DataCaching, ImageCache, ImageCacheKey, ImageCaching};
use pixfetch::codec::{DecodeContext, ImageDecoder, RawBitmapCodec};
use pixfetch::config::PipelineConfig;
use pixfetch::image::{Bitmap, ImageContainer};
use pixfetch::loader::{DataChunk, DataLoader, DataResponse, DataStream};
use pixfetch::process::{ImageProcessor, ProcessContext};
use pixfetch::request::UrlRequest;
use pixfetch::{ImagePipeline, ImageRequest};

/// A solid-color test bitmap.
#[allow(dead_code)]
pub fn test_bitmap(width: u32, height: u32) -> Bitmap {
    Bitmap::filled(width, height, [120, 130, 140, 255])
}

/// Raw-bitmap-encoded bytes the default decoder factory accepts.
#[allow(dead_code)]
pub fn test_image_bytes(width: u32, height: u32) -> Bytes {
    RawBitmapCodec::encode_bitmap(&test_bitmap(width, height))
}

/// The canonical test URL.
#[allow(dead_code)]
pub fn test_url() -> Url {
    Url::parse("http://test.com/example.jpeg").unwrap()
}

/// Poll `condition` until it holds or the timeout expires.
#[allow(dead_code)]
pub async fn wait_until(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A scripted transfer for [`MockDataLoader`].
#[allow(dead_code)]
pub struct MockTransfer {
    pub response: DataResponse,
    pub chunks: Vec<Bytes>,
    /// Terminate with this error after the chunks instead of success.
    pub error: Option<pixfetch::PixfetchError>,
    /// Delay before each chunk.
    pub chunk_delay: Duration,
}

#[allow(dead_code)]
impl MockTransfer {
    /// A successful single-chunk 200 transfer.
    pub fn ok(url: &Url, data: Bytes) -> Self {
        let len = data.len() as i64;
        Self {
            response: response(url, 200, vec![], Some(len)),
            chunks: vec![data],
            error: None,
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn with_response(mut self, response: DataResponse) -> Self {
        self.response = response;
        self
    }

    pub fn with_chunks(mut self, chunks: Vec<Bytes>) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn failing_after(mut self, kept_chunks: usize) -> Self {
        self.chunks.truncate(kept_chunks);
        self.error = Some(pixfetch::PixfetchError::data_loading_failed(
            "simulated mid-stream failure",
        ));
        self
    }
}

impl Clone for MockTransfer {
    fn clone(&self) -> Self {
        Self {
            response: self.response.clone(),
            chunks: self.chunks.clone(),
            error: self.error.clone(),
            chunk_delay: self.chunk_delay,
        }
    }
}

/// Build a [`DataResponse`] for tests.
#[allow(dead_code)]
pub fn response(
    url: &Url,
    status_code: u16,
    headers: Vec<(&str, &str)>,
    expected_content_length: Option<i64>,
) -> DataResponse {
    DataResponse {
        url: url.clone(),
        status_code,
        headers: headers
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
        expected_content_length,
    }
}

struct LoaderState {
    transfers: HashMap<String, VecDeque<MockTransfer>>,
    requests: Vec<UrlRequest>,
}

/// A scriptable [`DataLoader`] with per-URL transfer scripts, a
/// suspension gate, and fetch/cancel counters.
pub struct MockDataLoader {
    state: Mutex<LoaderState>,
    fetch_count: AtomicUsize,
    cancel_count: Arc<AtomicUsize>,
    suspended_tx: watch::Sender<bool>,
    suspended_rx: watch::Receiver<bool>,
}

#[allow(dead_code)]
impl MockDataLoader {
    pub fn new() -> Arc<Self> {
        let (suspended_tx, suspended_rx) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(LoaderState {
                transfers: HashMap::new(),
                requests: Vec::new(),
            }),
            fetch_count: AtomicUsize::new(0),
            cancel_count: Arc::new(AtomicUsize::new(0)),
            suspended_tx,
            suspended_rx,
        })
    }

    /// Queue a transfer script for `url`; consecutive loads of the
    /// same URL consume scripts in order (the last one repeats).
    pub fn add_transfer(&self, url: &Url, transfer: MockTransfer) {
        let mut state = self.state.lock().unwrap();
        state
            .transfers
            .entry(url.to_string())
            .or_default()
            .push_back(transfer);
    }

    /// Script a successful single-chunk image response for `url`.
    pub fn add_image(&self, url: &Url, width: u32, height: u32) {
        self.add_transfer(url, MockTransfer::ok(url, test_image_bytes(width, height)));
    }

    /// Gate chunk delivery (loads still start and count as fetches).
    pub fn set_suspended(&self, suspended: bool) {
        let _ = self.suspended_tx.send(suspended);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Streams dropped before their terminal event.
    pub fn cancel_count(&self) -> usize {
        self.cancel_count.load(Ordering::SeqCst)
    }

    /// Every request observed, in order.
    pub fn requests(&self) -> Vec<UrlRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

struct CancelGuard {
    cancel_count: Arc<AtomicUsize>,
    finished: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct TransferState {
    items: VecDeque<pixfetch::Result<DataChunk>>,
    chunk_delay: Duration,
    suspended: watch::Receiver<bool>,
    guard: CancelGuard,
}

impl DataLoader for MockDataLoader {
    fn load(&self, request: &UrlRequest) -> DataStream {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let transfer = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(request.clone());
            match state.transfers.get_mut(&request.url.to_string()) {
                Some(scripts) if scripts.len() > 1 => scripts.pop_front(),
                Some(scripts) => scripts.front().cloned(),
                None => None,
            }
        };
        let Some(transfer) = transfer else {
            return futures::stream::once(async {
                Err(pixfetch::PixfetchError::data_loading_failed(
                    "no scripted response",
                ))
            })
            .boxed();
        };
        let mut items: VecDeque<pixfetch::Result<DataChunk>> = VecDeque::new();
        let mut response = Some(transfer.response);
        for chunk in transfer.chunks {
            items.push_back(Ok(DataChunk {
                data: chunk,
                response: response.take(),
            }));
        }
        if let Some(error) = transfer.error {
            items.push_back(Err(error));
        }
        let state = TransferState {
            items,
            chunk_delay: transfer.chunk_delay,
            suspended: self.suspended_rx.clone(),
            guard: CancelGuard {
                cancel_count: Arc::clone(&self.cancel_count),
                finished: false,
            },
        };
        futures::stream::unfold(state, |mut state| async move {
            while *state.suspended.borrow() {
                if state.suspended.changed().await.is_err() {
                    break;
                }
            }
            match state.items.pop_front() {
                Some(item) => {
                    if !state.chunk_delay.is_zero() {
                        tokio::time::sleep(state.chunk_delay).await;
                    }
                    if item.is_err() {
                        state.guard.finished = true;
                    }
                    Some((item, state))
                }
                None => {
                    state.guard.finished = true;
                    None
                }
            }
        })
        .boxed()
    }
}

/// Memory-cache decorator counting reads and writes.
pub struct CountingImageCache {
    inner: ImageCache,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

#[allow(dead_code)]
impl CountingImageCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: ImageCache::new().with_storing_previews(true),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn entry_count(&self) -> usize {
        self.inner.count()
    }
}

impl ImageCaching for CountingImageCache {
    fn image(&self, key: &ImageCacheKey) -> Option<ImageContainer> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.image(key)
    }

    fn set_image(&self, key: ImageCacheKey, container: ImageContainer) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set_image(key, container);
    }

    fn remove_image(&self, key: &ImageCacheKey) {
        self.inner.remove_image(key);
    }

    fn remove_all(&self) {
        self.inner.remove_all();
    }
}

/// In-memory stand-in for the disk tier, counting reads and writes.
pub struct CountingDataCache {
    entries: Mutex<HashMap<String, Bytes>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

#[allow(dead_code)]
impl CountingDataCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl DataCaching for CountingDataCache {
    async fn cached_data(&self, key: &str) -> Option<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().get(key).cloned()
    }

    async fn contains_data(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    fn store_data(&self, key: &str, data: Bytes) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().insert(key.to_string(), data);
    }

    fn remove_data(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    fn remove_all(&self) {
        self.entries.lock().unwrap().clear();
    }

    async fn flush(&self) {}
}

/// A processor that counts its applications and records its identity
/// in the container's `user_info` trail.
pub struct MarkProcessor {
    id: String,
    applied: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl MarkProcessor {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            applied: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }
}

impl ImageProcessor for MarkProcessor {
    fn identifier(&self) -> String {
        self.id.clone()
    }

    fn process(
        &self,
        mut container: ImageContainer,
        _context: &ProcessContext,
    ) -> pixfetch::Result<ImageContainer> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        let trail = container
            .user_info
            .entry("trail".to_string())
            .or_insert_with(|| serde_json::json!([]));
        if let Some(items) = trail.as_array_mut() {
            items.push(serde_json::json!(self.id));
        }
        Ok(container)
    }
}

/// The processor trail recorded by [`MarkProcessor`] applications.
#[allow(dead_code)]
pub fn trail(container: &ImageContainer) -> Vec<String> {
    container
        .user_info
        .get("trail")
        .and_then(|value| value.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// A decoder that treats any payload as a progressive source: every
/// partial decode yields a preview, the final decode records the byte
/// count it saw.
pub struct MockProgressiveDecoder {
    partial_decodes: AtomicUsize,
    final_byte_counts: Mutex<Vec<usize>>,
}

#[allow(dead_code)]
impl MockProgressiveDecoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            partial_decodes: AtomicUsize::new(0),
            final_byte_counts: Mutex::new(Vec::new()),
        })
    }

    pub fn partial_decodes(&self) -> usize {
        self.partial_decodes.load(Ordering::SeqCst)
    }

    pub fn final_byte_counts(&self) -> Vec<usize> {
        self.final_byte_counts.lock().unwrap().clone()
    }
}

impl ImageDecoder for MockProgressiveDecoder {
    fn decode(&self, data: &Bytes, _context: &DecodeContext) -> pixfetch::Result<ImageContainer> {
        self.final_byte_counts.lock().unwrap().push(data.len());
        Ok(ImageContainer::new(test_bitmap(8, 8)))
    }

    fn decode_partial(&self, _data: &Bytes, _context: &DecodeContext) -> Option<ImageContainer> {
        self.partial_decodes.fetch_add(1, Ordering::SeqCst);
        Some(ImageContainer::preview(test_bitmap(4, 4)))
    }

    fn is_progressive(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "mock-progressive"
    }
}

/// A pipeline plus its counting tiers.
#[allow(dead_code)]
pub struct TestPipeline {
    pub pipeline: ImagePipeline,
    pub loader: Arc<MockDataLoader>,
    pub image_cache: Arc<CountingImageCache>,
    pub data_cache: Arc<CountingDataCache>,
}

#[allow(dead_code)]
impl TestPipeline {
    /// Fully-wired pipeline with counting memory and data tiers.
    pub fn new(configure: impl FnOnce(&mut PipelineConfig)) -> Self {
        let loader = MockDataLoader::new();
        let image_cache = CountingImageCache::new();
        let data_cache = CountingDataCache::new();
        let mut config = PipelineConfig::new(loader.clone());
        config.image_cache = Some(image_cache.clone());
        config.data_cache = Some(data_cache.clone());
        config.is_rate_limiter_enabled = false;
        config.progressive_decoding_interval = Duration::ZERO;
        configure(&mut config);
        Self {
            pipeline: ImagePipeline::new(config),
            loader,
            image_cache,
            data_cache,
        }
    }

    pub fn request(&self) -> ImageRequest {
        ImageRequest::new(test_url())
    }
}
