//! Response envelopes and progress reporting.

use crate::image::{Bitmap, ImageContainer};
use crate::loader::DataResponse;
use crate::request::ImageRequest;

/// The cache layer that served a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CacheType {
    /// Served from the in-memory image cache
    Memory,
    /// Served from the on-disk data cache
    Disk,
}

/// A delivered image with its provenance.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    /// The decoded (and possibly processed) image
    pub container: ImageContainer,
    /// The request that produced this response
    pub request: ImageRequest,
    /// Transport-level response metadata, when the bytes came from a
    /// loader
    pub url_response: Option<DataResponse>,
    /// Which cache layer satisfied the request; `None` for fresh loads
    pub cache_type: Option<CacheType>,
}

impl ImageResponse {
    /// The delivered bitmap.
    pub fn image(&self) -> &Bitmap {
        &self.container.image
    }

    /// True when this is a progressive-decoding intermediate.
    pub fn is_preview(&self) -> bool {
        self.container.is_preview
    }
}

impl PartialEq for ImageResponse {
    fn eq(&self, other: &Self) -> bool {
        self.container == other.container && self.cache_type == other.cache_type
    }
}

/// Transfer progress of a load.
///
/// `total` may change when a later response reports a different
/// `Content-Length`; `completed` never decreases within one attempt and
/// includes the resumed offset of a continued download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Progress {
    /// Bytes received so far
    pub completed: i64,
    /// Expected total, or 0 when unknown
    pub total: i64,
}

impl Progress {
    /// Completed fraction in `[0, 1]`, or `None` when the total is
    /// unknown.
    pub fn fraction(&self) -> Option<f64> {
        if self.total > 0 {
            Some((self.completed as f64 / self.total as f64).clamp(0.0, 1.0))
        } else {
            None
        }
    }
}
