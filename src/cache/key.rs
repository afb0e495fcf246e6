//! Cache-key derivation.
//!
//! Two key families exist: a hashable value key for the in-memory
//! image cache and a flat string key for the byte-oriented disk cache.
//! Both are order-sensitive over the processor chain; an observer's
//! key override replaces only the base component.

use std::sync::Arc;

use crate::process::ImageProcessor;
use crate::request::{ImageRequest, ThumbnailOptions};

/// Value-typed key for the in-memory image cache.
///
/// Two requests hit the same memory-cache entry exactly when their
/// keys compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageCacheKey {
    base: String,
    processors: Vec<String>,
    thumbnail: Option<ThumbnailOptions>,
    scale_bits: Option<u32>,
}

impl ImageCacheKey {
    /// The identity component: observer override, URL, or request id.
    pub fn base(&self) -> &str {
        &self.base
    }
}

/// Derive the memory-cache key for a request with an explicit
/// processor prefix.
///
/// `base_override` is the observer-provided key, when any; processors
/// contribute their hashable identifiers in order.
pub fn make_image_cache_key(
    request: &ImageRequest,
    processors: &[Arc<dyn ImageProcessor>],
    base_override: Option<&str>,
) -> ImageCacheKey {
    ImageCacheKey {
        base: base_override.unwrap_or_else(|| request.image_id()).to_string(),
        processors: processors
            .iter()
            .map(|p| p.hashable_identifier())
            .collect(),
        thumbnail: request.thumbnail,
        scale_bits: request.scale.map(f32::to_bits),
    }
}

/// Derive the disk-cache key for a request with an explicit processor
/// prefix: the base identity, each processor identifier in order, the
/// thumbnail descriptor, then the scale override.
pub fn make_disk_cache_key(
    request: &ImageRequest,
    processors: &[Arc<dyn ImageProcessor>],
    base_override: Option<&str>,
) -> String {
    let mut key = base_override
        .unwrap_or_else(|| request.image_id())
        .to_string();
    for processor in processors {
        key.push_str(&processor.identifier());
    }
    if let Some(thumbnail) = &request.thumbnail {
        key.push_str(&thumbnail.identifier());
    }
    if let Some(scale) = request.scale {
        key.push_str(&format!("scale={:?}", scale));
    }
    key
}
