//! Image processor contract.
//!
//! Processors are pure transformations from image container to image
//! container, applied in request order after decoding. Each processor
//! carries two identities: `identifier` feeds string-keyed disk-cache
//! keys, `hashable_identifier` feeds the value-typed memory-cache key.
//! Two processors are interchangeable when both identities match.

use std::sync::Arc;

use crate::error::PixfetchError;
use crate::image::ImageContainer;
use crate::loader::DataResponse;
use crate::request::ImageRequest;

/// Context handed to a processor invocation.
#[derive(Clone)]
pub struct ProcessContext {
    /// The originating request
    pub request: ImageRequest,
    /// Transport metadata of the current response, when any
    pub url_response: Option<DataResponse>,
    /// False when processing a progressive preview
    pub is_completed: bool,
}

/// A single image transformation.
pub trait ImageProcessor: Send + Sync {
    /// Stable identity, unique per configuration (e.g.
    /// `"com.example/blur?radius=8"`). Used in disk-cache keys.
    fn identifier(&self) -> String;

    /// Identity used for memory-cache keys and in-memory equality.
    /// Defaults to [`Self::identifier`].
    fn hashable_identifier(&self) -> String {
        self.identifier()
    }

    /// Apply the transformation. Errors terminate the load with
    /// `ProcessingFailed` carrying [`Self::identifier`].
    fn process(
        &self,
        container: ImageContainer,
        context: &ProcessContext,
    ) -> crate::Result<ImageContainer>;
}

type ProcessFn = dyn Fn(ImageContainer) -> Option<ImageContainer> + Send + Sync;

/// A processor built from a closure; handy for one-off transformations
/// and tests.
///
/// # Examples
///
/// ```rust
/// use pixfetch::process::ClosureProcessor;
///
/// let invert = ClosureProcessor::new("invert", |container| {
///     Some(container) // transform here
/// });
/// ```
pub struct ClosureProcessor {
    id: String,
    f: Arc<ProcessFn>,
}

impl ClosureProcessor {
    /// Create a processor with the given identifier. The closure
    /// returns `None` to signal failure.
    pub fn new(
        id: impl Into<String>,
        f: impl Fn(ImageContainer) -> Option<ImageContainer> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            f: Arc::new(f),
        }
    }
}

impl ImageProcessor for ClosureProcessor {
    fn identifier(&self) -> String {
        self.id.clone()
    }

    fn process(
        &self,
        container: ImageContainer,
        _context: &ProcessContext,
    ) -> crate::Result<ImageContainer> {
        (self.f)(container).ok_or_else(|| {
            PixfetchError::processing_failed(self.id.clone(), "processor returned no image")
        })
    }
}
