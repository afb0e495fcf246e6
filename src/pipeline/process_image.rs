//! Stage: apply the request's processor chain.
//!
//! One job exists per processor-prefix of the chain; the job for
//! prefix `k` applies processor `k` to the output of the job for
//! prefix `k - 1` (prefix 0 being the decode stage). Before chaining
//! upstream, each job probes the disk cache for its own prefix and the
//! memory cache for the next-shorter prefix, which yields the
//! interleaved per-prefix lookup order of the cache read policy.
//!
//! Previews process at reduced priority and are superseded when the
//! final image arrives.

use std::sync::{Arc, Mutex};

use crate::core::job::{DependencyHandle, Job, JobEvent};
use crate::core::queue::WorkItem;
use crate::pipeline::{
    ImageJobValue, PipelineInner, StageKind, apply_processor, subscribe_with_retry,
};
use crate::process::ProcessContext;
use crate::request::ImageRequest;
use crate::response::CacheType;

impl PipelineInner {
    // `count` is the number of leading processors this job applies;
    // always >= 1 (prefix 0 is the decode stage).
    pub(crate) fn job_process_image(
        &self,
        request: &ImageRequest,
        count: usize,
    ) -> Job<ImageJobValue> {
        let key = self.stage_key_image(request, &request.processors[..count]);
        self.stage_job(StageKind::ProcessImage, key, || {
            make_process_image_job(self.weak(), request.clone(), count)
        })
    }
}

fn make_process_image_job(
    pipeline: std::sync::Weak<PipelineInner>,
    request: ImageRequest,
    count: usize,
) -> Job<ImageJobValue> {
    Job::new(move |job| {
        let Some(pipeline) = pipeline.upgrade() else {
            return;
        };
        let job = job.clone();
        let token = job.disposal_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = start(pipeline, request, count, job.clone()) => {}
            }
        });
    })
}

async fn start(
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
    count: usize,
    job: Job<ImageJobValue>,
) {
    // Disk lookup for this prefix.
    if request.options.disk_reads_allowed() {
        if let Some(data_cache) = &pipeline.config.data_cache {
            let key = pipeline.disk_cache_key_for(&request, &request.processors[..count]);
            if let Some(data) = data_cache.cached_data(&key).await {
                match pipeline.decode_data_on_queue(&job, &request, data).await {
                    Some(Ok(container)) => {
                        job.send_value(
                            ImageJobValue {
                                container,
                                url_response: None,
                                cache_type: Some(CacheType::Disk),
                                is_from_original: false,
                                processors_applied: false,
                            },
                            true,
                        );
                        return;
                    }
                    Some(Err(err)) => {
                        // A stale or corrupt cached derivative falls
                        // back to the full chain.
                        log::debug!(
                            "process image: cached derivative failed to decode: {}",
                            err
                        );
                    }
                    None => return,
                }
            }
        }
    }

    // Memory lookup for the next-shorter prefix.
    if request.options.memory_reads_allowed() {
        if let Some(image_cache) = &pipeline.config.image_cache {
            let key = pipeline.image_cache_key_for(&request, &request.processors[..count - 1]);
            if let Some(container) = image_cache.image(&key) {
                if !container.is_preview {
                    let processor = request.processors[count - 1].clone();
                    match pipeline
                        .process_on_queue(&job, &request, processor, container, None, true)
                        .await
                    {
                        Some(Ok(container)) => {
                            job.send_value(
                                ImageJobValue {
                                    container,
                                    url_response: None,
                                    cache_type: Some(CacheType::Memory),
                                    is_from_original: count == 1,
                                    processors_applied: true,
                                },
                                true,
                            );
                            return;
                        }
                        Some(Err(err)) => {
                            job.send_error(err);
                            return;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    // Chain to the next-shorter prefix (or the decode stage).
    let chain = Arc::new(ChainState::default());
    let handler_pipeline = Arc::downgrade(&pipeline);
    let handler_request = request.clone();
    let handler_job = job.clone();
    let subscription = subscribe_with_retry(
        || {
            if count > 1 {
                pipeline.job_process_image(&request, count - 1)
            } else {
                pipeline.job_decode_image(&request)
            }
        },
        job.priority(),
        move |event| {
            let Some(pipeline) = handler_pipeline.upgrade() else {
                return;
            };
            match event {
                JobEvent::Progress(progress) => handler_job.send_progress(progress),
                JobEvent::Error(err) => handler_job.send_error(err),
                JobEvent::Value {
                    value,
                    is_completed,
                } => on_upstream_image(
                    &pipeline,
                    &handler_request,
                    count,
                    &handler_job,
                    &chain,
                    value,
                    is_completed,
                ),
            }
        },
    );
    job.set_dependency(DependencyHandle::new(subscription));
}

#[derive(Default)]
struct ChainState {
    preview_item: Mutex<Option<Arc<WorkItem>>>,
}

fn on_upstream_image(
    pipeline: &Arc<PipelineInner>,
    request: &ImageRequest,
    count: usize,
    job: &Job<ImageJobValue>,
    chain: &Arc<ChainState>,
    value: ImageJobValue,
    is_completed: bool,
) {
    let processor = request.processors[count - 1].clone();
    let context = ProcessContext {
        request: request.clone(),
        url_response: value.url_response.clone(),
        is_completed,
    };

    if is_completed {
        // The final image supersedes any queued preview processing.
        if let Some(item) = chain.preview_item.lock().unwrap().take() {
            item.cancel();
        }
        let process_job = job.clone();
        let item = pipeline
            .config
            .image_processing_queue
            .enqueue(job.priority(), move |ctx| async move {
                if ctx.is_cancelled() {
                    return;
                }
                match apply_processor(&processor, value.container.clone(), &context) {
                    Ok(container) => process_job.send_value(
                        ImageJobValue {
                            container,
                            url_response: value.url_response,
                            cache_type: value.cache_type,
                            is_from_original: value.is_from_original,
                            processors_applied: true,
                        },
                        true,
                    ),
                    Err(err) => process_job.send_error(err),
                }
            });
        job.set_operation(item);
    } else {
        // Preview processing runs below the final pass and newer
        // previews replace older queued ones.
        if let Some(item) = chain.preview_item.lock().unwrap().take() {
            item.cancel();
        }
        let process_job = job.clone();
        let item = pipeline.config.image_processing_queue.enqueue(
            job.priority().lowered(),
            move |ctx| async move {
                if ctx.is_cancelled() {
                    return;
                }
                match apply_processor(&processor, value.container.clone(), &context) {
                    Ok(container) => process_job.send_value(
                        ImageJobValue {
                            container,
                            url_response: value.url_response,
                            cache_type: value.cache_type,
                            is_from_original: value.is_from_original,
                            processors_applied: true,
                        },
                        false,
                    ),
                    Err(err) => {
                        // Preview failures never fail the task.
                        log::debug!("process image: preview processing failed: {}", err);
                    }
                }
            },
        );
        *chain.preview_item.lock().unwrap() = Some(Arc::clone(&item));
        job.set_operation(item);
    }
}
