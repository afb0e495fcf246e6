//! The pipeline orchestrator.
//!
//! [`ImagePipeline`] converts an [`ImageRequest`] into an
//! [`ImageTask`]. Internally each request runs as a chain of stage
//! jobs (load data, decode, process, finalize); equivalent requests
//! coalesce onto shared jobs, priorities flow upstream, and results
//! write back to the cache tiers according to the data-cache policy.

mod cache;
mod decode_image;
mod load_data;
mod load_image;
mod process_image;
mod task;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cache::key::{ImageCacheKey, make_disk_cache_key, make_image_cache_key};
use crate::codec::DecodeContext;
use crate::config::PipelineConfig;
use crate::core::job::{Job, JobEvent, JobSubscription};
use crate::error::PixfetchError;
use crate::image::ImageContainer;
use crate::loader::DataResponse;
use crate::loader::rate_limiter::RateLimiter;
use crate::observer::PipelineObserver;
use crate::process::{ImageProcessor, ProcessContext};
use crate::request::{ImageRequest, Priority};
use crate::response::{CacheType, ImageResponse, Progress};

pub use cache::{CacheLayers, PipelineCache};
pub use task::{ImageTask, TaskEvent};

// Value flowing between the image-producing stages.
#[derive(Clone)]
pub(crate) struct ImageJobValue {
    pub container: ImageContainer,
    pub url_response: Option<DataResponse>,
    // Which cache tier the underlying artifact came from
    pub cache_type: Option<CacheType>,
    // True when the image was produced by decoding the original data
    // (as opposed to a partially-processed intermediate)
    pub is_from_original: bool,
    // True when at least one processor ran in this chain
    pub processors_applied: bool,
}

// Value produced by the data stage. `data` is cumulative.
#[derive(Clone)]
pub(crate) struct DataJobValue {
    pub data: Bytes,
    pub response: Option<DataResponse>,
    pub cache_type: Option<CacheType>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) enum StageKey {
    Image { key: ImageCacheKey, options: u8 },
    Data { id: String, options: u8 },
}

#[derive(Clone, Copy)]
pub(crate) enum StageKind {
    LoadImage,
    ProcessImage,
    DecodeImage,
    LoadData,
}

pub(crate) struct TaskShared {
    pub progress: Mutex<Progress>,
    pub priority: Mutex<Priority>,
}

struct TaskEntry {
    request: ImageRequest,
    subscription: Option<JobSubscription<ImageJobValue>>,
    events: mpsc::UnboundedSender<TaskEvent>,
    shared: Arc<TaskShared>,
}

struct PipelineState {
    is_invalidated: bool,
    tasks: HashMap<Uuid, TaskEntry>,
    jobs_load_image: HashMap<StageKey, Job<ImageJobValue>>,
    jobs_process_image: HashMap<StageKey, Job<ImageJobValue>>,
    jobs_decode_image: HashMap<StageKey, Job<ImageJobValue>>,
    jobs_load_data: HashMap<StageKey, Job<DataJobValue>>,
}

pub(crate) struct PipelineInner {
    pub(crate) config: PipelineConfig,
    state: Mutex<PipelineState>,
    rate_limiter: Arc<RateLimiter>,
    // Self-reference so stage constructors can hand weak backrefs to
    // spawned work without keeping the pipeline alive.
    self_weak: std::sync::Weak<PipelineInner>,
}

/// The image loading pipeline.
///
/// Cloning shares the same pipeline; all state lives behind the
/// handle.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use pixfetch::{ImagePipeline, ImageRequest};
/// use pixfetch::config::PipelineConfig;
/// use pixfetch::loader::HttpDataLoader;
/// use url::Url;
///
/// # async fn example() -> pixfetch::Result<()> {
/// let pipeline = ImagePipeline::new(PipelineConfig::new(Arc::new(HttpDataLoader::new())));
/// let request = ImageRequest::new(Url::parse("http://test.com/example.jpeg").unwrap());
/// let response = pipeline.image(request).await?;
/// println!("{}x{}", response.image().width(), response.image().height());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ImagePipeline {
    inner: Arc<PipelineInner>,
}

impl ImagePipeline {
    /// Create a pipeline from its configuration.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            inner: Arc::new_cyclic(|self_weak| PipelineInner {
                config,
                state: Mutex::new(PipelineState {
                    is_invalidated: false,
                    tasks: HashMap::new(),
                    jobs_load_image: HashMap::new(),
                    jobs_process_image: HashMap::new(),
                    jobs_decode_image: HashMap::new(),
                    jobs_load_data: HashMap::new(),
                }),
                rate_limiter: Arc::new(RateLimiter::new()),
                self_weak: self_weak.clone(),
            }),
        }
    }

    /// The pipeline's configuration.
    pub fn configuration(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Direct access to the cache tiers with the pipeline's key
    /// derivation.
    pub fn cache(&self) -> PipelineCache {
        PipelineCache::new(Arc::clone(&self.inner))
    }

    /// Start loading an image and return the task handle.
    pub fn load_image(&self, request: ImageRequest) -> ImageTask {
        let id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(TaskShared {
            progress: Mutex::new(Progress::default()),
            priority: Mutex::new(request.priority),
        });
        let task = ImageTask::new(
            id,
            request.clone(),
            Arc::downgrade(&self.inner),
            events_rx,
            Arc::clone(&shared),
        );

        let rejected = {
            let mut state = self.inner.state.lock().unwrap();
            if state.is_invalidated {
                true
            } else {
                state.tasks.insert(
                    id,
                    TaskEntry {
                        request: request.clone(),
                        subscription: None,
                        events: events_tx.clone(),
                        shared,
                    },
                );
                false
            }
        };
        if rejected {
            let _ = events_tx.send(TaskEvent::Finished(Err(PixfetchError::PipelineInvalidated)));
            if let Some(observer) = self.inner.observer() {
                observer.task_finished(id, &Err(PixfetchError::PipelineInvalidated));
            }
            return task;
        }

        if let Some(observer) = self.inner.observer() {
            observer.task_created(id, &request);
        }
        log::debug!("pipeline: task {} created for {:?}", id, request.image_id());

        let inner = Arc::clone(&self.inner);
        let weak = Arc::downgrade(&self.inner);
        let priority = request.priority;
        let subscription = subscribe_with_retry(
            || inner.job_load_image(&request),
            priority,
            move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_task_event(id, event);
                }
            },
        );
        // The task may already have finished or been cancelled while we
        // were subscribing; detach in that case.
        let stale = {
            let mut state = self.inner.state.lock().unwrap();
            match state.tasks.get_mut(&id) {
                Some(entry) => {
                    entry.subscription = Some(subscription.clone());
                    false
                }
                None => true,
            }
        };
        if stale {
            subscription.unsubscribe();
        }
        task
    }

    /// Load an image and await the final response.
    ///
    /// Dropping the returned future cancels the underlying task.
    pub async fn image(&self, request: ImageRequest) -> crate::Result<ImageResponse> {
        let mut task = self.load_image(request);
        let guard = TaskCancelGuard {
            pipeline: Arc::downgrade(&self.inner),
            id: task.id(),
            armed: true,
        };
        let result = loop {
            match task.event().await {
                Some(TaskEvent::Finished(result)) => break result,
                Some(TaskEvent::Cancelled) | None => break Err(PixfetchError::Cancelled),
                Some(_) => continue,
            }
        };
        let mut guard = guard;
        guard.armed = false;
        result
    }

    /// Load the original image data and await it, bypassing decoding
    /// and processing. Dropping the future cancels the load.
    pub async fn data(&self, request: ImageRequest) -> crate::Result<(Bytes, Option<DataResponse>)> {
        if self.inner.state.lock().unwrap().is_invalidated {
            return Err(PixfetchError::PipelineInvalidated);
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let inner = Arc::clone(&self.inner);
        let subscription = subscribe_with_retry(
            || inner.job_load_data(&request),
            request.priority,
            move |event| match event {
                JobEvent::Value {
                    value,
                    is_completed: true,
                } => {
                    let _ = tx.send(Ok(value));
                }
                JobEvent::Error(err) => {
                    let _ = tx.send(Err(err));
                }
                _ => {}
            },
        );
        let guard = SubscriptionGuard {
            subscription: subscription.clone(),
        };
        let result = match rx.recv().await {
            Some(Ok(value)) => Ok((value.data, value.response)),
            Some(Err(err)) => Err(err),
            None => Err(PixfetchError::Cancelled),
        };
        drop(guard);
        result
    }

    /// Cancel every live task with `PipelineInvalidated` and reject all
    /// subsequent requests with the same error.
    pub fn invalidate(&self) {
        let entries: Vec<(Uuid, TaskEntry)> = {
            let mut state = self.inner.state.lock().unwrap();
            state.is_invalidated = true;
            state.tasks.drain().collect()
        };
        log::debug!("pipeline: invalidated with {} live tasks", entries.len());
        let observer = self.inner.observer();
        for (id, entry) in entries {
            if let Some(subscription) = entry.subscription {
                subscription.unsubscribe();
            }
            let result = Err(PixfetchError::PipelineInvalidated);
            let _ = entry.events.send(TaskEvent::Finished(result.clone()));
            if let Some(observer) = &observer {
                observer.task_finished(id, &result);
            }
        }
    }
}

struct TaskCancelGuard {
    pipeline: std::sync::Weak<PipelineInner>,
    id: Uuid,
    armed: bool,
}

impl Drop for TaskCancelGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Some(inner) = self.pipeline.upgrade() {
                inner.cancel_task(self.id);
            }
        }
    }
}

struct SubscriptionGuard {
    subscription: JobSubscription<DataJobValue>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

impl PipelineInner {
    pub(crate) fn observer(&self) -> Option<Arc<dyn PipelineObserver>> {
        self.config.observer.as_ref()?.upgrade()
    }

    pub(crate) fn weak(&self) -> std::sync::Weak<PipelineInner> {
        self.self_weak.clone()
    }

    pub(crate) fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.rate_limiter)
    }

    fn observer_key(&self, request: &ImageRequest) -> Option<String> {
        self.observer()?.cache_key(request)
    }

    // Memory-cache key for the first `count` processors of the chain.
    pub(crate) fn image_cache_key_for(
        &self,
        request: &ImageRequest,
        processors: &[Arc<dyn ImageProcessor>],
    ) -> ImageCacheKey {
        make_image_cache_key(request, processors, self.observer_key(request).as_deref())
    }

    // Disk-cache key for the first `count` processors of the chain.
    pub(crate) fn disk_cache_key_for(
        &self,
        request: &ImageRequest,
        processors: &[Arc<dyn ImageProcessor>],
    ) -> String {
        make_disk_cache_key(request, processors, self.observer_key(request).as_deref())
    }

    // Key of the original bytes: no processors, no thumbnail, no
    // scale override (none of them change what was fetched).
    pub(crate) fn original_data_key(&self, request: &ImageRequest) -> String {
        let mut plain = request.clone();
        plain.thumbnail = None;
        plain.scale = None;
        make_disk_cache_key(&plain, &[], self.observer_key(request).as_deref())
    }

    pub(crate) fn stage_key_image(
        &self,
        request: &ImageRequest,
        processors: &[Arc<dyn ImageProcessor>],
    ) -> StageKey {
        StageKey::Image {
            key: self.image_cache_key_for(request, processors),
            options: request.options.fingerprint(),
        }
    }

    fn get_or_create_job<T, F>(&self, kind: StageKind, key: StageKey, make: F) -> (Job<T>, bool)
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Job<T>,
        PipelineState: StageMap<T>,
    {
        if !self.config.is_task_coalescing_enabled {
            return (make(), false);
        }
        let mut state = self.state.lock().unwrap();
        let map = state.stage_map(kind);
        if let Some(job) = map.get(&key) {
            if !job.is_disposed() {
                return (job.clone(), false);
            }
        }
        let job = make();
        map.insert(key, job.clone());
        (job, true)
    }

    // Fetches or creates the coalesced job for a stage and registers
    // map cleanup for fresh jobs.
    pub(crate) fn stage_job<T, F>(&self, kind: StageKind, key: StageKey, make: F) -> Job<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Job<T>,
        PipelineState: StageMap<T>,
    {
        let (job, fresh) = self.get_or_create_job(kind, key.clone(), make);
        if fresh {
            let weak = self.weak();
            job.set_on_dispose(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.remove_stage_job::<T>(kind, &key);
                }
            });
        }
        job
    }

    fn remove_stage_job<T>(&self, kind: StageKind, key: &StageKey)
    where
        T: Clone + Send + 'static,
        PipelineState: StageMap<T>,
    {
        let mut state = self.state.lock().unwrap();
        let map = state.stage_map(kind);
        if let Some(job) = map.get(key) {
            if job.is_disposed() {
                map.remove(key);
            }
        }
    }

    fn handle_task_event(&self, id: Uuid, event: JobEvent<ImageJobValue>) {
        let observer = self.observer();
        match event {
            JobEvent::Progress(progress) => {
                let sent = {
                    let state = self.state.lock().unwrap();
                    if let Some(entry) = state.tasks.get(&id) {
                        *entry.shared.progress.lock().unwrap() = progress;
                        let _ = entry.events.send(TaskEvent::Progress(progress));
                        true
                    } else {
                        false
                    }
                };
                if sent {
                    if let Some(observer) = observer {
                        observer.task_progress(id, progress);
                    }
                }
            }
            JobEvent::Value {
                value,
                is_completed: false,
            } => {
                let response = {
                    let state = self.state.lock().unwrap();
                    state.tasks.get(&id).map(|entry| {
                        let response = ImageResponse {
                            container: value.container.clone(),
                            request: entry.request.clone(),
                            url_response: value.url_response.clone(),
                            cache_type: value.cache_type,
                        };
                        let _ = entry.events.send(TaskEvent::Preview(response.clone()));
                        response
                    })
                };
                if let (Some(response), Some(observer)) = (response, observer) {
                    observer.task_preview(id, &response);
                }
            }
            JobEvent::Value {
                value,
                is_completed: true,
            } => {
                let delivered = {
                    let mut state = self.state.lock().unwrap();
                    state.tasks.remove(&id).map(|entry| {
                        let response = ImageResponse {
                            container: value.container.clone(),
                            request: entry.request.clone(),
                            url_response: value.url_response.clone(),
                            cache_type: value.cache_type,
                        };
                        let _ = entry.events.send(TaskEvent::Finished(Ok(response.clone())));
                        response
                    })
                };
                if let (Some(response), Some(observer)) = (delivered, observer) {
                    observer.task_finished(id, &Ok(response));
                }
            }
            JobEvent::Error(err) => {
                let delivered = {
                    let mut state = self.state.lock().unwrap();
                    state.tasks.remove(&id).map(|entry| {
                        let _ = entry.events.send(TaskEvent::Finished(Err(err.clone())));
                    })
                };
                if delivered.is_some() {
                    if let Some(observer) = observer {
                        observer.task_finished(id, &Err(err));
                    }
                }
            }
        }
    }

    pub(crate) fn cancel_task(&self, id: Uuid) {
        let entry = {
            let mut state = self.state.lock().unwrap();
            state.tasks.remove(&id)
        };
        let Some(entry) = entry else {
            return;
        };
        log::debug!("pipeline: task {} cancelled", id);
        if let Some(subscription) = entry.subscription {
            subscription.unsubscribe();
        }
        let _ = entry.events.send(TaskEvent::Cancelled);
        if let Some(observer) = self.observer() {
            observer.task_cancelled(id);
        }
    }

    pub(crate) fn set_task_priority(&self, id: Uuid, priority: Priority) {
        let subscription = {
            let state = self.state.lock().unwrap();
            state.tasks.get(&id).and_then(|entry| {
                *entry.shared.priority.lock().unwrap() = priority;
                entry.subscription.clone()
            })
        };
        if let Some(subscription) = subscription {
            subscription.set_priority(priority);
        }
    }

    // Runs one processor on the processing queue, tying the work item
    // to `job` for cancellation. `None` means the work was cancelled.
    pub(crate) async fn process_on_queue(
        &self,
        job: &Job<ImageJobValue>,
        request: &ImageRequest,
        processor: Arc<dyn ImageProcessor>,
        container: ImageContainer,
        url_response: Option<DataResponse>,
        is_completed: bool,
    ) -> Option<crate::Result<ImageContainer>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let context = ProcessContext {
            request: request.clone(),
            url_response,
            is_completed,
        };
        let item = self
            .config
            .image_processing_queue
            .enqueue(job.priority(), move |ctx| async move {
                if ctx.is_cancelled() {
                    return;
                }
                let _ = tx.send(apply_processor(&processor, container, &context));
            });
        job.set_operation(item);
        rx.await.ok()
    }

    // Decodes a complete payload on the decoding queue. `None` means
    // the work was cancelled.
    pub(crate) async fn decode_data_on_queue(
        &self,
        job: &Job<ImageJobValue>,
        request: &ImageRequest,
        data: Bytes,
    ) -> Option<crate::Result<ImageContainer>> {
        let context = DecodeContext {
            request: request.clone(),
            data: data.clone(),
            url_response: None,
            is_completed: true,
        };
        let Some(decoder) = (self.config.make_image_decoder)(&context) else {
            let format = context
                .image_type()
                .map(|t| t.name())
                .unwrap_or("unknown");
            return Some(Err(PixfetchError::decoder_not_registered(format)));
        };
        let (tx, rx) = tokio::sync::oneshot::channel();
        let item = self
            .config
            .image_decoding_queue
            .enqueue(job.priority(), move |ctx| async move {
                if ctx.is_cancelled() {
                    return;
                }
                let _ = tx.send(decoder.decode(&data, &context));
            });
        job.set_operation(item);
        rx.await.ok()
    }
}

// Maps each stage kind to its coalescing map; the value type picks the
// map family (image-producing stages vs the data stage).
pub(crate) trait StageMap<T: Clone + Send + 'static> {
    fn stage_map(&mut self, kind: StageKind) -> &mut HashMap<StageKey, Job<T>>;
}

impl StageMap<ImageJobValue> for PipelineState {
    fn stage_map(&mut self, kind: StageKind) -> &mut HashMap<StageKey, Job<ImageJobValue>> {
        match kind {
            StageKind::LoadImage => &mut self.jobs_load_image,
            StageKind::ProcessImage => &mut self.jobs_process_image,
            StageKind::DecodeImage => &mut self.jobs_decode_image,
            StageKind::LoadData => unreachable!("data stage carries DataJobValue"),
        }
    }
}

impl StageMap<DataJobValue> for PipelineState {
    fn stage_map(&mut self, _kind: StageKind) -> &mut HashMap<StageKey, Job<DataJobValue>> {
        &mut self.jobs_load_data
    }
}

// Subscribing can race a job that terminates between lookup and
// subscribe; retry with a fresh job in that case.
pub(crate) fn subscribe_with_retry<T, F, H>(
    mut get_job: F,
    priority: Priority,
    handler: H,
) -> JobSubscription<T>
where
    T: Clone + Send + 'static,
    F: FnMut() -> Job<T>,
    H: Fn(JobEvent<T>) + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    loop {
        let job = get_job();
        let handler = Arc::clone(&handler);
        if let Some(subscription) = job.subscribe(priority, move |event| handler(event)) {
            return subscription;
        }
    }
}

pub(crate) fn apply_processor(
    processor: &Arc<dyn ImageProcessor>,
    container: ImageContainer,
    context: &ProcessContext,
) -> crate::Result<ImageContainer> {
    match processor.process(container, context) {
        Ok(output) => Ok(output),
        Err(err @ PixfetchError::ProcessingFailed { .. }) => Err(err),
        Err(err) => Err(PixfetchError::processing_failed(
            processor.identifier(),
            err.to_string(),
        )),
    }
}
