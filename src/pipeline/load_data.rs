//! Stage: produce the original image bytes.
//!
//! Order of preference: inline data, the byte producer, the disk
//! cache, then the network through the data-loading queue. Network
//! loads stream chunks, report progress, forward partial payloads for
//! progressive decoding, park resumable state on interruption, and
//! offer the complete payload to the disk cache per the data-cache
//! policy.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::DataCachePolicy;
use crate::core::job::Job;
use crate::error::PixfetchError;
use crate::loader::DataResponse;
use crate::loader::resumable::{ResumableData, ResumableDataStore};
use crate::pipeline::{DataJobValue, PipelineInner, StageKey, StageKind};
use crate::request::{ImageRequest, ImageSource};
use crate::response::{CacheType, Progress};

impl PipelineInner {
    pub(crate) fn job_load_data(&self, request: &ImageRequest) -> Job<DataJobValue> {
        let key = StageKey::Data {
            id: request.image_id().to_string(),
            options: request.options.fingerprint(),
        };
        self.stage_job(StageKind::LoadData, key, || {
            make_load_data_job(self.weak(), request.clone())
        })
    }
}

fn make_load_data_job(
    pipeline: std::sync::Weak<PipelineInner>,
    request: ImageRequest,
) -> Job<DataJobValue> {
    Job::new(move |job| {
        let Some(pipeline) = pipeline.upgrade() else {
            return;
        };
        let job = job.clone();
        let token = job.disposal_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = start_load(pipeline, request, job.clone()) => {}
            }
        });
    })
}

async fn start_load(pipeline: Arc<PipelineInner>, request: ImageRequest, job: Job<DataJobValue>) {
    match request.source() {
        ImageSource::Data { data, .. } => {
            if data.is_empty() {
                job.send_error(PixfetchError::DataIsEmpty);
            } else {
                job.send_value(
                    DataJobValue {
                        data: data.clone(),
                        response: None,
                        cache_type: None,
                    },
                    true,
                );
            }
            return;
        }
        ImageSource::Producer { producer, .. } => {
            let producer = producer.clone();
            match producer().await {
                Ok(data) if data.is_empty() => job.send_error(PixfetchError::DataIsEmpty),
                Ok(data) => job.send_value(
                    DataJobValue {
                        data,
                        response: None,
                        cache_type: None,
                    },
                    true,
                ),
                Err(err) => job.send_error(PixfetchError::data_loading_failed(err)),
            }
            return;
        }
        _ => {}
    }

    // Disk-cache lookup for the original bytes.
    if request.options.disk_reads_allowed() {
        if let Some(data_cache) = &pipeline.config.data_cache {
            let key = pipeline.original_data_key(&request);
            if let Some(data) = data_cache.cached_data(&key).await {
                job.send_value(
                    DataJobValue {
                        data,
                        response: None,
                        cache_type: Some(CacheType::Disk),
                    },
                    true,
                );
                return;
            }
        }
    }
    if request.options.return_cache_data_dont_load {
        job.send_error(PixfetchError::DataMissingInCache);
        return;
    }

    let url = request.url().cloned();
    if let Some(url) = &url {
        if url.scheme() == "file" {
            match tokio::fs::read(url.path()).await {
                Ok(data) if data.is_empty() => job.send_error(PixfetchError::DataIsEmpty),
                Ok(data) => job.send_value(
                    DataJobValue {
                        data: Bytes::from(data),
                        response: None,
                        cache_type: None,
                    },
                    true,
                ),
                Err(err) => job.send_error(PixfetchError::data_loading_failed(err)),
            }
            return;
        }
        if url.scheme() == "data" {
            match decode_data_url(url.as_str()) {
                Ok(data) if !data.is_empty() => job.send_value(
                    DataJobValue {
                        data,
                        response: None,
                        cache_type: None,
                    },
                    true,
                ),
                Ok(_) => job.send_error(PixfetchError::DataIsEmpty),
                Err(()) => {
                    job.send_error(PixfetchError::data_loading_failed("malformed data: URL"))
                }
            }
            return;
        }
    }

    // Network load through the data-loading queue.
    let priority = job.priority();
    if request.options.skip_data_loading_queue {
        let token = job.disposal_token();
        tokio::spawn(fetch_over_network(pipeline.clone(), request, job, token));
        return;
    }
    let queue = pipeline.config.data_loading_queue.clone();
    let enqueue = {
        let pipeline = Arc::clone(&pipeline);
        let job = job.clone();
        move || {
            let item = queue.enqueue(priority, {
                let pipeline = Arc::clone(&pipeline);
                let request = request.clone();
                let job = job.clone();
                move |ctx| {
                    fetch_over_network(pipeline, request, job, ctx.token().clone())
                }
            });
            job.set_operation(item);
        }
    };
    if pipeline.config.is_rate_limiter_enabled {
        pipeline.rate_limiter().execute(enqueue);
    } else {
        enqueue();
    }
}

async fn fetch_over_network(
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
    job: Job<DataJobValue>,
    token: CancellationToken,
) {
    let Some(mut url_request) = request.url_request() else {
        job.send_error(PixfetchError::data_loading_failed("request has no URL"));
        return;
    };
    let url_string = url_request.url.to_string();
    let resumable_enabled =
        pipeline.config.is_resumable_data_enabled && !request.is_local_resource();
    let mut resumed = if resumable_enabled {
        ResumableDataStore::shared().take(&url_string)
    } else {
        None
    };
    if let Some(resumed) = &resumed {
        for (name, value) in resumed.resume_headers() {
            url_request = url_request.with_header(name, value);
        }
        log::debug!(
            "load data: resuming {} from offset {}",
            url_string,
            resumed.data.len()
        );
    }

    let mut stream = pipeline.config.data_loader.load(&url_request);
    let mut buffer = BytesMut::new();
    let mut response_meta: Option<DataResponse> = None;
    let mut total: i64 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                park_resumable(
                    resumable_enabled,
                    &url_string,
                    resumed.take(),
                    &response_meta,
                    &buffer,
                );
                return;
            }
            chunk = stream.next() => match chunk {
                Some(Ok(chunk)) => {
                    if let Some(response) = chunk.response {
                        if let Some(parked) = resumed.take() {
                            if ResumableData::is_resumed(&response) {
                                // Server honored the range; splice the
                                // parked prefix back in.
                                buffer.extend_from_slice(&parked.data);
                            }
                        }
                        total = match response.expected_content_length {
                            Some(expected) => expected + buffer.len() as i64,
                            None => 0,
                        };
                        response_meta = Some(response);
                    }
                    if chunk.data.is_empty() {
                        continue;
                    }
                    buffer.extend_from_slice(&chunk.data);
                    job.send_progress(Progress {
                        completed: buffer.len() as i64,
                        total,
                    });
                    let still_partial = total == 0 || (buffer.len() as i64) < total;
                    if pipeline.config.is_progressive_decoding_enabled && still_partial {
                        job.send_value(
                            DataJobValue {
                                data: buffer.clone().freeze(),
                                response: response_meta.clone(),
                                cache_type: None,
                            },
                            false,
                        );
                    }
                }
                Some(Err(err)) => {
                    park_resumable(
                        resumable_enabled,
                        &url_string,
                        resumed.take(),
                        &response_meta,
                        &buffer,
                    );
                    job.send_error(err);
                    return;
                }
                None => {
                    let data = buffer.freeze();
                    if data.is_empty() {
                        job.send_error(PixfetchError::DataIsEmpty);
                        return;
                    }
                    store_original_data(&pipeline, &request, &data);
                    job.send_value(
                        DataJobValue {
                            data,
                            response: response_meta,
                            cache_type: None,
                        },
                        true,
                    );
                    return;
                }
            }
        }
    }
}

// Parks whatever can be resumed later: the bytes of this attempt, or
// the untouched parked prefix when the transfer died before the first
// response.
fn park_resumable(
    enabled: bool,
    url: &str,
    untouched: Option<ResumableData>,
    response: &Option<DataResponse>,
    buffer: &BytesMut,
) {
    if !enabled {
        return;
    }
    if let Some(response) = response {
        if let Some(data) =
            ResumableData::new(response, Bytes::copy_from_slice(buffer))
        {
            ResumableDataStore::shared().store(url, data);
        }
    } else if let Some(untouched) = untouched {
        ResumableDataStore::shared().store(url, untouched);
    }
}

fn store_original_data(pipeline: &Arc<PipelineInner>, request: &ImageRequest, data: &Bytes) {
    let policy_allows = match pipeline.config.data_cache_policy {
        DataCachePolicy::StoreOriginalData | DataCachePolicy::StoreAll => true,
        DataCachePolicy::Automatic => request.processors.is_empty(),
        DataCachePolicy::StoreEncodedImages => false,
    };
    if !policy_allows
        || request.is_local_resource()
        || !request.options.disk_writes_allowed()
    {
        return;
    }
    let Some(data_cache) = &pipeline.config.data_cache else {
        return;
    };
    let data = match pipeline.observer() {
        Some(observer) => match observer.will_cache(data.clone(), None, request) {
            Some(data) => data,
            None => return,
        },
        None => data.clone(),
    };
    let key = pipeline.original_data_key(request);
    data_cache.store_data(&key, data);
}

// Minimal RFC 2397 support: base64 and percent-encoded payloads.
fn decode_data_url(url: &str) -> Result<Bytes, ()> {
    let rest = url.strip_prefix("data:").ok_or(())?;
    let (header, payload) = rest.split_once(',').ok_or(())?;
    if header.ends_with(";base64") {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map(Bytes::from)
            .map_err(|_| ())
    } else {
        let mut out = Vec::with_capacity(payload.len());
        let mut bytes = payload.bytes();
        while let Some(byte) = bytes.next() {
            if byte == b'%' {
                let hex = [bytes.next().ok_or(())?, bytes.next().ok_or(())?];
                let hex = std::str::from_utf8(&hex).map_err(|_| ())?;
                out.push(u8::from_str_radix(hex, 16).map_err(|_| ())?);
            } else {
                out.push(byte);
            }
        }
        Ok(Bytes::from(out))
    }
}
