//! Immutable request descriptors for image loads.
//!
//! An [`ImageRequest`] names a logical image: where its bytes come
//! from, which processors to apply, how urgent it is, and which cache
//! layers it may touch. Requests are value types; cloning is cheap and
//! two requests are equivalent exactly when their derived cache keys
//! are equal.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::process::ImageProcessor;

/// Priority of a load task, lowest to highest.
///
/// The derived ordering follows declaration order, so `VeryLow <
/// Normal < VeryHigh` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

impl Priority {
    /// One step lower, saturating at [`Priority::VeryLow`]. Used to
    /// rank speculative preview work below the final pass.
    pub fn lowered(self) -> Priority {
        match self {
            Priority::VeryLow | Priority::Low => Priority::VeryLow,
            Priority::Normal => Priority::Low,
            Priority::High => Priority::Normal,
            Priority::VeryHigh => Priority::High,
        }
    }
}

/// Option flags controlling cache and delivery behavior of a request.
///
/// Each flag toggles independently; the default is all-off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Skip both cache reads; write back as usual.
    pub reload_ignoring_cached_data: bool,
    /// Only consult caches; fail with `DataMissingInCache` on a miss.
    pub return_cache_data_dont_load: bool,
    /// Do not read the memory cache.
    pub disable_memory_cache_reads: bool,
    /// Do not write the memory cache.
    pub disable_memory_cache_writes: bool,
    /// Do not read the disk cache.
    pub disable_disk_cache_reads: bool,
    /// Do not write the disk cache.
    pub disable_disk_cache_writes: bool,
    /// Deliver the decoded image without forcing it into render-ready
    /// form.
    pub skip_decompression: bool,
    /// Bypass the data-loading queue's concurrency bound. Useful when
    /// the source is known to be in memory.
    pub skip_data_loading_queue: bool,
}

impl RequestOptions {
    /// Whether memory-cache reads are permitted.
    pub fn memory_reads_allowed(&self) -> bool {
        !self.disable_memory_cache_reads && !self.reload_ignoring_cached_data
    }

    /// Whether memory-cache writes are permitted.
    pub fn memory_writes_allowed(&self) -> bool {
        !self.disable_memory_cache_writes
    }

    /// Whether disk-cache reads are permitted.
    pub fn disk_reads_allowed(&self) -> bool {
        !self.disable_disk_cache_reads && !self.reload_ignoring_cached_data
    }

    /// Whether disk-cache writes are permitted.
    pub fn disk_writes_allowed(&self) -> bool {
        !self.disable_disk_cache_writes
    }

    // Compact encoding used in coalescing keys: requests with different
    // cache behavior must never share work.
    pub(crate) fn fingerprint(&self) -> u8 {
        (self.reload_ignoring_cached_data as u8)
            | (self.return_cache_data_dont_load as u8) << 1
            | (self.disable_memory_cache_reads as u8) << 2
            | (self.disable_memory_cache_writes as u8) << 3
            | (self.disable_disk_cache_reads as u8) << 4
            | (self.disable_disk_cache_writes as u8) << 5
            | (self.skip_decompression as u8) << 6
            | (self.skip_data_loading_queue as u8) << 7
    }
}

/// An HTTP-level request: a URL plus extra header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRequest {
    /// Target URL
    pub url: Url,
    /// Additional header fields sent with the request
    pub headers: Vec<(String, String)>,
}

impl UrlRequest {
    /// Create a request for the given URL with no extra headers.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
        }
    }

    /// Append a header field.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Asynchronous byte producer used by [`ImageSource::Producer`].
pub type DataProducer = Arc<dyn Fn() -> BoxFuture<'static, crate::Result<Bytes>> + Send + Sync>;

/// Where the bytes of an image come from.
#[derive(Clone)]
pub enum ImageSource {
    /// Fetch from a URL with default transport options.
    Url(Url),
    /// Fetch from a URL with explicit header fields.
    UrlRequest(UrlRequest),
    /// Pull from an asynchronous closure; `id` is the stable identity
    /// used for cache keys.
    Producer {
        /// Stable identity for cache-key derivation
        id: String,
        /// The byte source
        producer: DataProducer,
    },
    /// Inline bytes; `id` is the stable identity used for cache keys.
    Data {
        /// Stable identity for cache-key derivation
        id: String,
        /// The image bytes
        data: Bytes,
    },
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            ImageSource::UrlRequest(request) => f.debug_tuple("UrlRequest").field(request).finish(),
            ImageSource::Producer { id, .. } => {
                f.debug_struct("Producer").field("id", id).finish_non_exhaustive()
            }
            ImageSource::Data { id, data } => f
                .debug_struct("Data")
                .field("id", id)
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// How a flexible-size thumbnail maps source pixels into the target box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentMode {
    /// Scale so the whole image fits inside the box
    AspectFit,
    /// Scale so the image covers the whole box
    AspectFill,
}

impl ContentMode {
    fn tag(&self) -> &'static str {
        match self {
            ContentMode::AspectFit => "aspectFit",
            ContentMode::AspectFill => "aspectFill",
        }
    }
}

/// Target geometry of a decode-time thumbnail.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThumbnailTarget {
    /// Bound the longest side to the given number of pixels.
    MaxPixelSize(f32),
    /// Fit or fill an explicit pixel box.
    Size {
        width: f32,
        height: f32,
        content_mode: ContentMode,
    },
}

/// Request for decode-time downsampling.
///
/// When present, the decoder produces a smaller image directly from
/// the byte source instead of decoding at full resolution first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThumbnailOptions {
    /// Target geometry
    pub target: ThumbnailTarget,
    /// Crop to the target box after scaling
    pub crop: bool,
    /// Allow scaling above the source resolution
    pub upscale: bool,
}

impl ThumbnailOptions {
    /// Bound the longest side to `max_pixel_size` pixels.
    pub fn max_pixel_size(max_pixel_size: f32) -> Self {
        Self {
            target: ThumbnailTarget::MaxPixelSize(max_pixel_size),
            crop: false,
            upscale: false,
        }
    }

    /// Fit or fill an explicit pixel box.
    pub fn size(width: f32, height: f32, content_mode: ContentMode) -> Self {
        Self {
            target: ThumbnailTarget::Size {
                width,
                height,
                content_mode,
            },
            crop: false,
            upscale: false,
        }
    }

    /// Canonical descriptor used in cache keys. Stable across releases.
    pub fn identifier(&self) -> String {
        match self.target {
            ThumbnailTarget::MaxPixelSize(size) => format!(
                "com.github/kean/nuke/thumbnail?maxPixelSize={:?},options={}{}",
                size, self.crop, self.upscale
            ),
            ThumbnailTarget::Size {
                width,
                height,
                content_mode,
            } => format!(
                "com.github/kean/nuke/thumbnail?width={:?},height={:?},contentMode={},options={}{}",
                width,
                height,
                content_mode.tag(),
                self.crop,
                self.upscale
            ),
        }
    }
}

impl Eq for ThumbnailOptions {}

impl std::hash::Hash for ThumbnailOptions {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self.target {
            ThumbnailTarget::MaxPixelSize(size) => {
                0u8.hash(state);
                size.to_bits().hash(state);
            }
            ThumbnailTarget::Size {
                width,
                height,
                content_mode,
            } => {
                1u8.hash(state);
                width.to_bits().hash(state);
                height.to_bits().hash(state);
                content_mode.hash(state);
            }
        }
        self.crop.hash(state);
        self.upscale.hash(state);
    }
}

/// A logical image request.
///
/// Mutable fields use value semantics: mutate a clone freely without
/// affecting in-flight loads.
#[derive(Clone)]
pub struct ImageRequest {
    source: ImageSource,
    /// Processors applied in order to the decoded image
    pub processors: Vec<Arc<dyn ImageProcessor>>,
    /// Base priority of the load
    pub priority: Priority,
    /// Cache and delivery options
    pub options: RequestOptions,
    /// Free-form metadata passed through to processors and observers
    pub user_info: HashMap<String, serde_json::Value>,
    /// Decode-time downsampling request
    pub thumbnail: Option<ThumbnailOptions>,
    /// Display-scale override recorded in the memory-cache key
    pub scale: Option<f32>,
}

impl ImageRequest {
    /// Request the image at `url`.
    pub fn new(url: Url) -> Self {
        Self::with_source(ImageSource::Url(url))
    }

    /// Request the image described by an HTTP-level request.
    pub fn with_url_request(request: UrlRequest) -> Self {
        Self::with_source(ImageSource::UrlRequest(request))
    }

    /// Request an image produced by an asynchronous byte source.
    pub fn with_producer(
        id: impl Into<String>,
        producer: impl Fn() -> BoxFuture<'static, crate::Result<Bytes>> + Send + Sync + 'static,
    ) -> Self {
        Self::with_source(ImageSource::Producer {
            id: id.into(),
            producer: Arc::new(producer),
        })
    }

    /// Request an image from inline bytes.
    pub fn with_data(id: impl Into<String>, data: Bytes) -> Self {
        Self::with_source(ImageSource::Data {
            id: id.into(),
            data,
        })
    }

    fn with_source(source: ImageSource) -> Self {
        Self {
            source,
            processors: Vec::new(),
            priority: Priority::default(),
            options: RequestOptions::default(),
            user_info: HashMap::new(),
            thumbnail: None,
            scale: None,
        }
    }

    /// Replace the processor chain.
    pub fn with_processors(mut self, processors: Vec<Arc<dyn ImageProcessor>>) -> Self {
        self.processors = processors;
        self
    }

    /// Replace the options.
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// The byte source of the request.
    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    /// The request's URL, when the source is URL-backed.
    pub fn url(&self) -> Option<&Url> {
        match &self.source {
            ImageSource::Url(url) => Some(url),
            ImageSource::UrlRequest(request) => Some(&request.url),
            _ => None,
        }
    }

    /// The HTTP-level request for URL-backed sources.
    pub fn url_request(&self) -> Option<UrlRequest> {
        match &self.source {
            ImageSource::Url(url) => Some(UrlRequest::new(url.clone())),
            ImageSource::UrlRequest(request) => Some(request.clone()),
            _ => None,
        }
    }

    /// Stable identity of the image: the URL string, or the explicit id
    /// for producer- and data-backed sources.
    pub fn image_id(&self) -> &str {
        match &self.source {
            ImageSource::Url(url) => url.as_str(),
            ImageSource::UrlRequest(request) => request.url.as_str(),
            ImageSource::Producer { id, .. } | ImageSource::Data { id, .. } => id,
        }
    }

    /// True for `file:` and `data:` URLs and for inline sources; such
    /// requests never write the disk cache and are never resumed.
    pub fn is_local_resource(&self) -> bool {
        match &self.source {
            ImageSource::Url(url) | ImageSource::UrlRequest(UrlRequest { url, .. }) => {
                matches!(url.scheme(), "file" | "data")
            }
            ImageSource::Producer { .. } | ImageSource::Data { .. } => true,
        }
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let processors: Vec<String> =
            self.processors.iter().map(|p| p.identifier()).collect();
        f.debug_struct("ImageRequest")
            .field("source", &self.source)
            .field("processors", &processors)
            .field("priority", &self.priority)
            .field("options", &self.options)
            .field("thumbnail", &self.thumbnail)
            .finish_non_exhaustive()
    }
}
