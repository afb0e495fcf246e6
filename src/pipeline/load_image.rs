//! Stage: finalize and deliver the image.
//!
//! The entry stage of every load. Checks the memory cache for the
//! fully-processed image, otherwise chains to the processing stage
//! (or straight to decoding when the request has no processors),
//! render-prepares unprocessed results on the decompression queue, and
//! performs the write-back side effects: the memory-cache store and,
//! policy permitting, the encoded-image disk store.

use std::sync::Arc;

use crate::codec::EncodeContext;
use crate::config::DataCachePolicy;
use crate::core::job::{DependencyHandle, Job, JobEvent};
use crate::pipeline::{
    ImageJobValue, PipelineInner, StageKind, subscribe_with_retry,
};
use crate::request::ImageRequest;
use crate::response::CacheType;

impl PipelineInner {
    pub(crate) fn job_load_image(&self, request: &ImageRequest) -> Job<ImageJobValue> {
        let key = self.stage_key_image(request, &request.processors);
        self.stage_job(StageKind::LoadImage, key, || {
            make_load_image_job(self.weak(), request.clone())
        })
    }
}

fn make_load_image_job(
    pipeline: std::sync::Weak<PipelineInner>,
    request: ImageRequest,
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
                _ = start(pipeline, request, job.clone()) => {}
            }
        });
    })
}

async fn start(pipeline: Arc<PipelineInner>, request: ImageRequest, job: Job<ImageJobValue>) {
    // Fully-processed image in the memory cache?
    if request.options.memory_reads_allowed() {
        if let Some(image_cache) = &pipeline.config.image_cache {
            let key = pipeline.image_cache_key_for(&request, &request.processors);
            if let Some(container) = image_cache.image(&key) {
                let is_final = !container.is_preview;
                job.send_value(
                    ImageJobValue {
                        container,
                        url_response: None,
                        cache_type: Some(CacheType::Memory),
                        is_from_original: false,
                        processors_applied: true,
                    },
                    is_final,
                );
                if is_final {
                    return;
                }
                // A cached preview is delivered right away, but the
                // load continues to the final image.
            }
        }
    }

    let handler_pipeline = Arc::downgrade(&pipeline);
    let handler_request = request.clone();
    let handler_job = job.clone();
    let subscription = subscribe_with_retry(
        || {
            if request.processors.is_empty() {
                pipeline.job_decode_image(&request)
            } else {
                pipeline.job_process_image(&request, request.processors.len())
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
                } => on_image(&pipeline, &handler_request, &handler_job, value, is_completed),
            }
        },
    );
    job.set_dependency(DependencyHandle::new(subscription));
}

fn on_image(
    pipeline: &Arc<PipelineInner>,
    request: &ImageRequest,
    job: &Job<ImageJobValue>,
    value: ImageJobValue,
    is_completed: bool,
) {
    if !is_completed {
        if pipeline.config.is_storing_previews_in_memory_cache
            && request.options.memory_writes_allowed()
        {
            if let Some(image_cache) = &pipeline.config.image_cache {
                let key = pipeline.image_cache_key_for(request, &request.processors);
                image_cache.set_image(key, value.container.clone());
            }
        }
        job.send_value(value, false);
        return;
    }

    let needs_decompression = pipeline.config.is_decompression_enabled
        && !request.options.skip_decompression
        && !value.processors_applied;
    if needs_decompression {
        let pipeline_for_item = Arc::clone(pipeline);
        let request = request.clone();
        let deliver_job = job.clone();
        let item = pipeline
            .config
            .image_decompressing_queue
            .enqueue(job.priority(), move |ctx| async move {
                if ctx.is_cancelled() {
                    return;
                }
                let mut value = value;
                value.container = value.container.map(|image| image.render_prepared());
                deliver(&pipeline_for_item, &request, &deliver_job, value);
            });
        job.set_operation(item);
    } else {
        deliver(pipeline, request, job, value);
    }
}

// Final write-backs, then delivery.
fn deliver(
    pipeline: &Arc<PipelineInner>,
    request: &ImageRequest,
    job: &Job<ImageJobValue>,
    value: ImageJobValue,
) {
    if request.options.memory_writes_allowed() && !value.container.is_preview {
        if let Some(image_cache) = &pipeline.config.image_cache {
            let key = pipeline.image_cache_key_for(request, &request.processors);
            image_cache.set_image(key, value.container.clone());
        }
    }
    if should_store_encoded(pipeline, request, &value) {
        store_encoded_image(pipeline, request, &value);
    }
    job.send_value(value, true);
}

fn should_store_encoded(
    pipeline: &Arc<PipelineInner>,
    request: &ImageRequest,
    value: &ImageJobValue,
) -> bool {
    let policy_allows = match pipeline.config.data_cache_policy {
        DataCachePolicy::StoreEncodedImages => true,
        DataCachePolicy::Automatic | DataCachePolicy::StoreAll => !request.processors.is_empty(),
        DataCachePolicy::StoreOriginalData => false,
    };
    policy_allows
        && pipeline.config.data_cache.is_some()
        && request.options.disk_writes_allowed()
        && value.is_from_original
        && value.cache_type != Some(CacheType::Disk)
        && !value.container.is_preview
        && request.thumbnail.is_none()
        && !request.is_local_resource()
}

// Encoding runs detached on the encoding queue; delivery never waits
// for it.
fn store_encoded_image(
    pipeline: &Arc<PipelineInner>,
    request: &ImageRequest,
    value: &ImageJobValue,
) {
    let pipeline = Arc::clone(pipeline);
    let request = request.clone();
    let container = value.container.clone();
    let priority = crate::request::Priority::VeryLow;
    pipeline
        .config
        .image_encoding_queue
        .clone()
        .enqueue(priority, move |ctx| async move {
            if ctx.is_cancelled() {
                return;
            }
            let encoder = (pipeline.config.make_image_encoder)(&EncodeContext {
                request: request.clone(),
            });
            let Some(data) = encoder.encode(&container) else {
                return;
            };
            let data = match pipeline.observer() {
                Some(observer) => {
                    match observer.will_cache(data, Some(&container), &request) {
                        Some(data) => data,
                        None => return,
                    }
                }
                None => data,
            };
            let Some(data_cache) = &pipeline.config.data_cache else {
                return;
            };
            let key = pipeline.disk_cache_key_for(&request, &request.processors);
            log::debug!("load image: storing encoded image for {}", key);
            data_cache.store_data(&key, data);
        });
}
