//! Pipeline configuration.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::cache::{DataCaching, ImageCache, ImageCaching};
use crate::codec::{
    DecoderFactory, EncoderFactory, default_decoder_factory, default_encoder_factory,
};
use crate::core::WorkQueue;
use crate::loader::DataLoader;
use crate::observer::PipelineObserver;

/// What the disk tier stores after a successful load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum DataCachePolicy {
    /// Requests with processors store the encoded processed image;
    /// requests without processors store the original bytes.
    #[default]
    Automatic,
    /// Always store original bytes; never encode.
    StoreOriginalData,
    /// Always encode and store the processed image; never store
    /// originals.
    StoreEncodedImages,
    /// Store original bytes and, when processors exist, the encoded
    /// processed image too.
    StoreAll,
}

/// Construction-time options of an image pipeline.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use pixfetch::config::PipelineConfig;
/// use pixfetch::loader::HttpDataLoader;
///
/// let config = PipelineConfig::new(Arc::new(HttpDataLoader::new()));
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// The byte-fetcher collaborator.
    pub data_loader: Arc<dyn DataLoader>,
    /// Disk tier; `None` disables it.
    pub data_cache: Option<Arc<dyn DataCaching>>,
    /// Memory tier; `None` disables it.
    pub image_cache: Option<Arc<dyn ImageCaching>>,
    /// Per-request decoder factory.
    pub make_image_decoder: DecoderFactory,
    /// Per-request encoder factory.
    pub make_image_encoder: EncoderFactory,
    /// What the disk tier stores.
    pub data_cache_policy: DataCachePolicy,
    /// Decode partial data of progressive sources into previews.
    pub is_progressive_decoding_enabled: bool,
    /// Minimum spacing between speculative preview decodes.
    pub progressive_decoding_interval: Duration,
    /// Keep progressive previews in the memory cache.
    pub is_storing_previews_in_memory_cache: bool,
    /// Park interrupted transfers for HTTP range resumption.
    pub is_resumable_data_enabled: bool,
    /// Share work between equivalent concurrent requests.
    pub is_task_coalescing_enabled: bool,
    /// Force final images into render-ready form.
    pub is_decompression_enabled: bool,
    /// Smooth data-queue admissions through a token bucket.
    pub is_rate_limiter_enabled: bool,
    /// Queue for byte transfers.
    pub data_loading_queue: WorkQueue,
    /// Queue for decodes.
    pub image_decoding_queue: WorkQueue,
    /// Queue for processor chains.
    pub image_processing_queue: WorkQueue,
    /// Queue for render preparation.
    pub image_decompressing_queue: WorkQueue,
    /// Queue for disk-cache encodes.
    pub image_encoding_queue: WorkQueue,
    /// Host hooks, held weakly.
    pub observer: Option<Weak<dyn PipelineObserver>>,
}

impl PipelineConfig {
    /// A configuration with the shared memory cache, no disk cache,
    /// and default queues.
    pub fn new(data_loader: Arc<dyn DataLoader>) -> Self {
        Self {
            data_loader,
            data_cache: None,
            image_cache: Some(ImageCache::shared()),
            make_image_decoder: default_decoder_factory(),
            make_image_encoder: default_encoder_factory(),
            data_cache_policy: DataCachePolicy::default(),
            is_progressive_decoding_enabled: true,
            progressive_decoding_interval: Duration::from_millis(150),
            is_storing_previews_in_memory_cache: false,
            is_resumable_data_enabled: true,
            is_task_coalescing_enabled: true,
            is_decompression_enabled: true,
            is_rate_limiter_enabled: true,
            data_loading_queue: WorkQueue::with_name(6, "data-loading"),
            image_decoding_queue: WorkQueue::with_name(1, "image-decoding"),
            image_processing_queue: WorkQueue::with_name(2, "image-processing"),
            image_decompressing_queue: WorkQueue::with_name(2, "image-decompressing"),
            image_encoding_queue: WorkQueue::with_name(1, "image-encoding"),
            observer: None,
        }
    }

    /// Attach a disk cache.
    pub fn with_data_cache(mut self, data_cache: Arc<dyn DataCaching>) -> Self {
        self.data_cache = Some(data_cache);
        self
    }

    /// Replace (or disable) the memory cache.
    pub fn with_image_cache(mut self, image_cache: Option<Arc<dyn ImageCaching>>) -> Self {
        self.image_cache = image_cache;
        self
    }

    /// Attach an observer; the pipeline keeps only a weak reference.
    pub fn with_observer(mut self, observer: &Arc<dyn PipelineObserver>) -> Self {
        self.observer = Some(Arc::downgrade(observer));
        self
    }
}
