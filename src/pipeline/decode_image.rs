//! Stage: decode bytes into an image container.
//!
//! Subscribes to the data stage. Complete payloads decode on the
//! decoding queue; partial payloads of progressive sources decode
//! speculatively into previews, coalesced by the configured decoding
//! interval and superseded by the final pass (a final payload cancels
//! an in-flight preview decode). Preview decode failures never fail
//! the load.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::codec::{DecodeContext, ImageDecoder, ImageType};
use crate::core::job::{DependencyHandle, Job, JobEvent};
use crate::core::queue::WorkItem;
use crate::error::PixfetchError;
use crate::observer::PreviewPolicy;
use crate::pipeline::{
    DataJobValue, ImageJobValue, PipelineInner, StageKind, subscribe_with_retry,
};
use crate::request::ImageRequest;

impl PipelineInner {
    pub(crate) fn job_decode_image(&self, request: &ImageRequest) -> Job<ImageJobValue> {
        let key = self.stage_key_image(request, &[]);
        self.stage_job(StageKind::DecodeImage, key, || {
            make_decode_image_job(self.weak(), request.clone())
        })
    }
}

#[derive(Default)]
struct DecodeState {
    decoder: Option<Arc<dyn ImageDecoder>>,
    preview_policy: Option<PreviewPolicy>,
    preview_item: Option<Arc<WorkItem>>,
    latest_partial: Option<DataJobValue>,
    last_preview_at: Option<Instant>,
}

fn make_decode_image_job(
    pipeline: Weak<PipelineInner>,
    request: ImageRequest,
) -> Job<ImageJobValue> {
    Job::new(move |job| {
        let Some(pipeline) = pipeline.upgrade() else {
            return;
        };
        let job = job.clone();
        let state = Arc::new(Mutex::new(DecodeState::default()));
        let handler_pipeline = pipeline.weak();
        let handler_request = request.clone();
        let handler_job = job.clone();
        let subscription = subscribe_with_retry(
            || pipeline.job_load_data(&request),
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
                    } => on_data(
                        &pipeline,
                        &handler_request,
                        &handler_job,
                        &state,
                        value,
                        is_completed,
                    ),
                }
            },
        );
        job.set_dependency(DependencyHandle::new(subscription));
    })
}

fn on_data(
    pipeline: &Arc<PipelineInner>,
    request: &ImageRequest,
    job: &Job<ImageJobValue>,
    state: &Arc<Mutex<DecodeState>>,
    value: DataJobValue,
    is_completed: bool,
) {
    if is_completed {
        decode_final(pipeline, request, job, state, value);
    } else {
        decode_partial(pipeline, request, job, state, value);
    }
}

fn resolve_decoder(
    pipeline: &Arc<PipelineInner>,
    state: &Arc<Mutex<DecodeState>>,
    context: &DecodeContext,
) -> Option<Arc<dyn ImageDecoder>> {
    if let Some(decoder) = state.lock().unwrap().decoder.clone() {
        return Some(decoder);
    }
    let decoder = (pipeline.config.make_image_decoder)(context)?;
    state.lock().unwrap().decoder = Some(Arc::clone(&decoder));
    Some(decoder)
}

fn decode_final(
    pipeline: &Arc<PipelineInner>,
    request: &ImageRequest,
    job: &Job<ImageJobValue>,
    state: &Arc<Mutex<DecodeState>>,
    value: DataJobValue,
) {
    // The final pass owns the decoder from here on.
    let preview_item = state.lock().unwrap().preview_item.take();
    if let Some(item) = preview_item {
        item.cancel();
    }
    let context = DecodeContext {
        request: request.clone(),
        data: value.data.clone(),
        url_response: value.response.clone(),
        is_completed: true,
    };
    let Some(decoder) = resolve_decoder(pipeline, state, &context) else {
        let format = ImageType::sniff(&value.data)
            .map(|t| t.name())
            .unwrap_or("unknown");
        job.send_error(PixfetchError::decoder_not_registered(format));
        return;
    };
    let decode_job = job.clone();
    let item = pipeline
        .config
        .image_decoding_queue
        .enqueue(job.priority(), move |ctx| async move {
            if ctx.is_cancelled() {
                return;
            }
            match decoder.decode(&value.data, &context) {
                Ok(container) => decode_job.send_value(
                    ImageJobValue {
                        container,
                        url_response: value.response,
                        cache_type: value.cache_type,
                        is_from_original: true,
                        processors_applied: false,
                    },
                    true,
                ),
                Err(err) => decode_job.send_error(err),
            }
        });
    job.set_operation(item);
}

fn decode_partial(
    pipeline: &Arc<PipelineInner>,
    request: &ImageRequest,
    job: &Job<ImageJobValue>,
    state: &Arc<Mutex<DecodeState>>,
    value: DataJobValue,
) {
    if !pipeline.config.is_progressive_decoding_enabled {
        return;
    }
    let context = DecodeContext {
        request: request.clone(),
        data: value.data.clone(),
        url_response: value.response.clone(),
        is_completed: false,
    };
    let Some(decoder) = resolve_decoder(pipeline, state, &context) else {
        // Not enough data to pick a decoder yet.
        return;
    };
    let policy = {
        let mut locked = state.lock().unwrap();
        *locked.preview_policy.get_or_insert_with(|| {
            pipeline
                .observer()
                .and_then(|observer| observer.preview_policy(&context))
                .unwrap_or(if decoder.is_progressive() {
                    PreviewPolicy::Incremental
                } else {
                    PreviewPolicy::Disabled
                })
        })
    };
    if policy == PreviewPolicy::Disabled {
        return;
    }

    let schedule = {
        let mut locked = state.lock().unwrap();
        locked.latest_partial = Some(value);
        // An outstanding preview decode will pick up the newer bytes.
        match &locked.preview_item {
            Some(item) if !item.is_cancelled() && !matches!(
                item.state(),
                crate::core::queue::ItemState::Finished
            ) => false,
            _ => true,
        }
    };
    if !schedule {
        return;
    }

    let interval = pipeline.config.progressive_decoding_interval;
    let delay = {
        let locked = state.lock().unwrap();
        match locked.last_preview_at {
            Some(last) => interval.saturating_sub(last.elapsed()),
            None => std::time::Duration::ZERO,
        }
    };
    let preview_job = job.clone();
    let preview_state = Arc::clone(state);
    let preview_request = request.clone();
    let item = pipeline.config.image_decoding_queue.enqueue(
        job.priority().lowered(),
        move |ctx| async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if ctx.is_cancelled() {
                return;
            }
            let Some(value) = preview_state.lock().unwrap().latest_partial.take() else {
                return;
            };
            let context = DecodeContext {
                request: preview_request,
                data: value.data.clone(),
                url_response: value.response.clone(),
                is_completed: false,
            };
            let preview = decoder.decode_partial(&value.data, &context);
            preview_state.lock().unwrap().last_preview_at = Some(Instant::now());
            if let Some(mut container) = preview {
                container.is_preview = true;
                preview_job.send_value(
                    ImageJobValue {
                        container,
                        url_response: value.response,
                        cache_type: value.cache_type,
                        is_from_original: true,
                        processors_applied: false,
                    },
                    false,
                );
            }
        },
    );
    state.lock().unwrap().preview_item = Some(Arc::clone(&item));
    job.set_operation(item);
}
