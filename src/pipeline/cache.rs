//! Direct cache access with the pipeline's key derivation.
//!
//! [`PipelineCache`] lets the host read, seed, and evict both tiers
//! using exactly the keys the pipeline would derive, including the
//! observer's key override and the per-request option bits.

use std::sync::Arc;

use bytes::Bytes;

use crate::cache::key::ImageCacheKey;
use crate::codec::{DecodeContext, EncodeContext};
use crate::image::ImageContainer;
use crate::pipeline::PipelineInner;
use crate::request::ImageRequest;

/// Which cache tiers an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLayers {
    /// Only the in-memory tier
    Memory,
    /// Only the on-disk tier
    Disk,
    /// Both tiers
    All,
}

impl CacheLayers {
    fn includes_memory(self) -> bool {
        matches!(self, CacheLayers::Memory | CacheLayers::All)
    }

    fn includes_disk(self) -> bool {
        matches!(self, CacheLayers::Disk | CacheLayers::All)
    }
}

/// Handle for direct cache access; obtained from
/// [`crate::ImagePipeline::cache`].
pub struct PipelineCache {
    inner: Arc<PipelineInner>,
}

impl PipelineCache {
    pub(crate) fn new(inner: Arc<PipelineInner>) -> Self {
        Self { inner }
    }

    /// Memory-cache key of the fully-processed image for `request`.
    pub fn image_cache_key(&self, request: &ImageRequest) -> ImageCacheKey {
        self.inner.image_cache_key_for(request, &request.processors)
    }

    /// Disk-cache key of the fully-processed image for `request`.
    pub fn disk_cache_key(&self, request: &ImageRequest) -> String {
        self.inner.disk_cache_key_for(request, &request.processors)
    }

    /// Disk-cache key of the original bytes for `request`.
    pub fn original_data_key(&self, request: &ImageRequest) -> String {
        self.inner.original_data_key(request)
    }

    /// Look up the fully-processed image, honoring the request's
    /// option bits. Disk hits are decoded inline.
    pub async fn cached_image(
        &self,
        request: &ImageRequest,
        layers: CacheLayers,
    ) -> Option<ImageContainer> {
        if layers.includes_memory() && request.options.memory_reads_allowed() {
            if let Some(image_cache) = &self.inner.config.image_cache {
                if let Some(container) = image_cache.image(&self.image_cache_key(request)) {
                    return Some(container);
                }
            }
        }
        if layers.includes_disk() && request.options.disk_reads_allowed() {
            if let Some(data_cache) = &self.inner.config.data_cache {
                let data = data_cache.cached_data(&self.disk_cache_key(request)).await?;
                let context = DecodeContext {
                    request: request.clone(),
                    data: data.clone(),
                    url_response: None,
                    is_completed: true,
                };
                let decoder = (self.inner.config.make_image_decoder)(&context)?;
                return decoder.decode(&data, &context).ok();
            }
        }
        None
    }

    /// Store a processed image into the given layers, honoring the
    /// request's option bits. Disk stores encode through the encoder
    /// factory.
    pub fn store_cached_image(
        &self,
        container: ImageContainer,
        request: &ImageRequest,
        layers: CacheLayers,
    ) {
        if layers.includes_memory() && request.options.memory_writes_allowed() {
            if let Some(image_cache) = &self.inner.config.image_cache {
                image_cache.set_image(self.image_cache_key(request), container.clone());
            }
        }
        if layers.includes_disk() && request.options.disk_writes_allowed() {
            if let Some(data_cache) = &self.inner.config.data_cache {
                let encoder = (self.inner.config.make_image_encoder)(&EncodeContext {
                    request: request.clone(),
                });
                if let Some(data) = encoder.encode(&container) {
                    data_cache.store_data(&self.disk_cache_key(request), data);
                }
            }
        }
    }

    /// Whether any requested layer holds the fully-processed image.
    pub async fn contains_cached_image(
        &self,
        request: &ImageRequest,
        layers: CacheLayers,
    ) -> bool {
        if layers.includes_memory() && request.options.memory_reads_allowed() {
            if let Some(image_cache) = &self.inner.config.image_cache {
                if image_cache.image(&self.image_cache_key(request)).is_some() {
                    return true;
                }
            }
        }
        if layers.includes_disk() && request.options.disk_reads_allowed() {
            if let Some(data_cache) = &self.inner.config.data_cache {
                return data_cache.contains_data(&self.disk_cache_key(request)).await;
            }
        }
        false
    }

    /// Remove the fully-processed image from the given layers.
    pub fn remove_cached_image(&self, request: &ImageRequest, layers: CacheLayers) {
        if layers.includes_memory() {
            if let Some(image_cache) = &self.inner.config.image_cache {
                image_cache.remove_image(&self.image_cache_key(request));
            }
        }
        if layers.includes_disk() {
            if let Some(data_cache) = &self.inner.config.data_cache {
                data_cache.remove_data(&self.disk_cache_key(request));
            }
        }
    }

    /// Look up the original bytes in the disk cache.
    pub async fn cached_data(&self, request: &ImageRequest) -> Option<Bytes> {
        if !request.options.disk_reads_allowed() {
            return None;
        }
        let data_cache = self.inner.config.data_cache.as_ref()?;
        data_cache.cached_data(&self.original_data_key(request)).await
    }

    /// Store original bytes into the disk cache.
    pub fn store_cached_data(&self, data: Bytes, request: &ImageRequest) {
        if !request.options.disk_writes_allowed() {
            return;
        }
        if let Some(data_cache) = &self.inner.config.data_cache {
            data_cache.store_data(&self.inner.original_data_key(request), data);
        }
    }

    /// Remove the original bytes from the disk cache.
    pub fn remove_cached_data(&self, request: &ImageRequest) {
        if let Some(data_cache) = &self.inner.config.data_cache {
            data_cache.remove_data(&self.inner.original_data_key(request));
        }
    }

    /// Drop everything from both tiers.
    pub fn remove_all(&self) {
        if let Some(image_cache) = &self.inner.config.image_cache {
            image_cache.remove_all();
        }
        if let Some(data_cache) = &self.inner.config.data_cache {
            data_cache.remove_all();
        }
    }
}
