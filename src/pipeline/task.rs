//! The caller-facing task handle.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::PixfetchError;
use crate::pipeline::{PipelineInner, TaskShared};
use crate::request::{ImageRequest, Priority};
use crate::response::{ImageResponse, Progress};

/// An event delivered to the holder of an [`ImageTask`].
///
/// Within one task, progress events precede the terminal event and
/// previews precede the final value; exactly one `Finished` or
/// `Cancelled` is delivered, after which the stream ends.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// Transfer progress
    Progress(Progress),
    /// A progressive preview (`is_preview == true` on the container)
    Preview(ImageResponse),
    /// The final response or error
    Finished(crate::Result<ImageResponse>),
    /// The task was cancelled before finishing
    Cancelled,
}

/// A handle on one image load.
///
/// The handle is the event consumer: call [`ImageTask::event`] (or
/// [`ImageTask::response`]) to drive delivery. Dropping the handle
/// does not cancel the load; call [`ImageTask::cancel`] for that.
pub struct ImageTask {
    id: Uuid,
    request: ImageRequest,
    pipeline: Weak<PipelineInner>,
    events: mpsc::UnboundedReceiver<TaskEvent>,
    shared: Arc<TaskShared>,
}

impl ImageTask {
    pub(crate) fn new(
        id: Uuid,
        request: ImageRequest,
        pipeline: Weak<PipelineInner>,
        events: mpsc::UnboundedReceiver<TaskEvent>,
        shared: Arc<TaskShared>,
    ) -> Self {
        Self {
            id,
            request,
            pipeline,
            events,
            shared,
        }
    }

    /// Unique identifier of this task.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The originating request.
    pub fn request(&self) -> &ImageRequest {
        &self.request
    }

    /// Latest observed transfer progress.
    pub fn progress(&self) -> Progress {
        *self.shared.progress.lock().unwrap()
    }

    /// Current priority of this task's subscription.
    pub fn priority(&self) -> Priority {
        *self.shared.priority.lock().unwrap()
    }

    /// Re-prioritize the load. Takes effect on queued work
    /// immediately; executing work is not preempted.
    pub fn set_priority(&self, priority: Priority) {
        if let Some(inner) = self.pipeline.upgrade() {
            inner.set_task_priority(self.id, priority);
        }
    }

    /// Cancel the load. The task emits [`TaskEvent::Cancelled`] if it
    /// has not already finished; cancelling a finished task is a
    /// no-op.
    pub fn cancel(&self) {
        if let Some(inner) = self.pipeline.upgrade() {
            inner.cancel_task(self.id);
        }
    }

    /// Receive the next event, or `None` after the terminal event.
    pub async fn event(&mut self) -> Option<TaskEvent> {
        self.events.recv().await
    }

    /// Consume the task and await its final response. Cancellation
    /// surfaces as [`PixfetchError::Cancelled`].
    pub async fn response(mut self) -> crate::Result<ImageResponse> {
        loop {
            match self.event().await {
                Some(TaskEvent::Finished(result)) => return result,
                Some(TaskEvent::Cancelled) | None => return Err(PixfetchError::Cancelled),
                Some(_) => continue,
            }
        }
    }
}

impl std::fmt::Debug for ImageTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageTask")
            .field("id", &self.id)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}
