//! Host integration hooks.
//!
//! A host application implements [`PipelineObserver`] to customize
//! cache identity, veto disk writes, tune progressive decoding, and
//! watch task lifecycles. The pipeline holds the observer weakly; the
//! host keeps it alive for as long as it cares.

use bytes::Bytes;
use uuid::Uuid;

use crate::codec::DecodeContext;
use crate::image::ImageContainer;
use crate::request::ImageRequest;
use crate::response::{ImageResponse, Progress};

/// Whether progressive sources produce intermediate previews.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewPolicy {
    /// Never decode partial data
    Disabled,
    /// Decode each completed scan into a preview
    Incremental,
}

/// Customization and lifecycle hooks, all optional.
///
/// Lifecycle callbacks fire on the pipeline's internal context and
/// never after the task's terminal event.
pub trait PipelineObserver: Send + Sync {
    /// Override the derived cache identity for `request`. The same
    /// override string means the same entity, for both the memory and
    /// the disk tier.
    fn cache_key(&self, _request: &ImageRequest) -> Option<String> {
        None
    }

    /// Veto or transform bytes before a disk-cache write. Returning
    /// `None` skips the write.
    fn will_cache(
        &self,
        data: Bytes,
        _image: Option<&ImageContainer>,
        _request: &ImageRequest,
    ) -> Option<Bytes> {
        Some(data)
    }

    /// Override the preview policy for a progressive source. `None`
    /// falls back to the decoder's own capability.
    fn preview_policy(&self, _context: &DecodeContext) -> Option<PreviewPolicy> {
        None
    }

    /// A task was created.
    fn task_created(&self, _task_id: Uuid, _request: &ImageRequest) {}

    /// A task reported transfer progress.
    fn task_progress(&self, _task_id: Uuid, _progress: Progress) {}

    /// A task produced a progressive preview.
    fn task_preview(&self, _task_id: Uuid, _response: &ImageResponse) {}

    /// A task finished with a final response or error.
    fn task_finished(&self, _task_id: Uuid, _result: &crate::Result<ImageResponse>) {}

    /// A task was cancelled before finishing.
    fn task_cancelled(&self, _task_id: Uuid) {}
}
