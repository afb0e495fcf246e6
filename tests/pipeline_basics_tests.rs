//! End-to-end basics: successful loads, the error taxonomy, option
//! flags, and invalidation.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::*;
use futures::future::BoxFuture;
use pixfetch::process::ClosureProcessor;
use pixfetch::request::RequestOptions;
use pixfetch::{ImageRequest, PixfetchError, TaskEvent};
use std::sync::Arc;

#[tokio::test]
async fn test_load_image_from_network() {
    let fixture = TestPipeline::new(|_| {});
    fixture.loader.add_image(&test_url(), 16, 9);

    let response = fixture.pipeline.image(fixture.request()).await.unwrap();

    assert_eq!(response.image().width(), 16);
    assert_eq!(response.image().height(), 9);
    assert_eq!(response.cache_type, None);
    assert!(!response.is_preview());
    assert_eq!(fixture.loader.fetch_count(), 1);
    // The decoded image is now in the memory cache.
    assert_eq!(fixture.image_cache.entry_count(), 1);
}

#[tokio::test]
async fn test_decompression_prepares_unprocessed_images() {
    let fixture = TestPipeline::new(|_| {});
    fixture.loader.add_image(&test_url(), 4, 4);
    let response = fixture.pipeline.image(fixture.request()).await.unwrap();
    assert!(response.image().is_render_prepared());
}

#[tokio::test]
async fn test_skip_decompression_option() {
    let fixture = TestPipeline::new(|_| {});
    fixture.loader.add_image(&test_url(), 4, 4);
    let request = fixture.request().with_options(RequestOptions {
        skip_decompression: true,
        ..Default::default()
    });
    let response = fixture.pipeline.image(request).await.unwrap();
    assert!(!response.image().is_render_prepared());
}

#[tokio::test]
async fn test_processed_images_skip_decompression() {
    let fixture = TestPipeline::new(|_| {});
    fixture.loader.add_image(&test_url(), 4, 4);
    let processor = MarkProcessor::new("P1");
    let request = fixture.request().with_processors(vec![processor.clone()]);
    let response = fixture.pipeline.image(request).await.unwrap();
    assert_eq!(processor.applied(), 1);
    assert_eq!(trail(&response.container), vec!["P1"]);
    assert!(!response.image().is_render_prepared());
}

#[tokio::test]
async fn test_empty_payload_fails_with_data_is_empty() {
    let fixture = TestPipeline::new(|_| {});
    fixture.loader.add_transfer(
        &test_url(),
        MockTransfer::ok(&test_url(), Bytes::new()).with_chunks(vec![]),
    );
    let err = fixture.pipeline.image(fixture.request()).await.unwrap_err();
    assert!(matches!(err, PixfetchError::DataIsEmpty));
}

#[tokio::test]
async fn test_unknown_format_fails_with_decoder_not_registered() {
    let fixture = TestPipeline::new(|_| {});
    fixture.loader.add_transfer(
        &test_url(),
        MockTransfer::ok(&test_url(), Bytes::from_static(b"definitely not an image")),
    );
    let err = fixture.pipeline.image(fixture.request()).await.unwrap_err();
    assert!(matches!(err, PixfetchError::DecoderNotRegistered { .. }));
}

#[tokio::test]
async fn test_corrupt_payload_fails_with_decoding_failed() {
    let fixture = TestPipeline::new(|_| {});
    let truncated = test_image_bytes(8, 8).slice(..24);
    fixture
        .loader
        .add_transfer(&test_url(), MockTransfer::ok(&test_url(), truncated));
    let err = fixture.pipeline.image(fixture.request()).await.unwrap_err();
    assert!(matches!(err, PixfetchError::DecodingFailed { .. }));
}

#[tokio::test]
async fn test_processor_failure_carries_identity() {
    let fixture = TestPipeline::new(|_| {});
    fixture.loader.add_image(&test_url(), 8, 8);
    let failing: Arc<dyn pixfetch::process::ImageProcessor> =
        Arc::new(ClosureProcessor::new("broken", |_| None));
    let request = fixture.request().with_processors(vec![failing]);
    let err = fixture.pipeline.image(request).await.unwrap_err();
    match err {
        PixfetchError::ProcessingFailed { processor, .. } => assert_eq!(processor, "broken"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_cache_only_mode_fails_on_cold_caches() {
    let fixture = TestPipeline::new(|_| {});
    fixture.loader.add_image(&test_url(), 8, 8);
    let request = fixture.request().with_options(RequestOptions {
        return_cache_data_dont_load: true,
        ..Default::default()
    });
    let err = fixture.pipeline.image(request).await.unwrap_err();
    assert!(matches!(err, PixfetchError::DataMissingInCache));
    assert_eq!(fixture.loader.fetch_count(), 0);
}

#[tokio::test]
async fn test_load_data_bypasses_decoding() {
    let fixture = TestPipeline::new(|_| {});
    let payload = Bytes::from_static(b"opaque payload bytes");
    fixture
        .loader
        .add_transfer(&test_url(), MockTransfer::ok(&test_url(), payload.clone()));
    let (data, response) = fixture.pipeline.data(fixture.request()).await.unwrap();
    assert_eq!(data, payload);
    assert_eq!(response.unwrap().status_code, 200);
}

#[tokio::test]
async fn test_inline_data_source() {
    let fixture = TestPipeline::new(|_| {});
    let request = ImageRequest::with_data("inline-image", test_image_bytes(5, 5));
    let response = fixture.pipeline.image(request).await.unwrap();
    assert_eq!(response.image().width(), 5);
    assert_eq!(fixture.loader.fetch_count(), 0);
}

#[tokio::test]
async fn test_producer_source() {
    let fixture = TestPipeline::new(|_| {});
    let request = ImageRequest::with_producer("produced-image", || {
        let fut: BoxFuture<'static, pixfetch::Result<Bytes>> =
            Box::pin(async { Ok(test_image_bytes(6, 6)) });
        fut
    });
    let response = fixture.pipeline.image(request).await.unwrap();
    assert_eq!(response.image().width(), 6);
    assert_eq!(fixture.loader.fetch_count(), 0);
}

#[tokio::test]
async fn test_progress_is_monotonic_and_reaches_total() {
    let fixture = TestPipeline::new(|_| {});
    let payload = test_image_bytes(32, 32);
    let parts: Vec<Bytes> = payload
        .chunks(payload.len() / 3 + 1)
        .map(Bytes::copy_from_slice)
        .collect();
    fixture.loader.add_transfer(
        &test_url(),
        MockTransfer::ok(&test_url(), payload.clone())
            .with_chunks(parts)
            .with_chunk_delay(Duration::from_millis(5)),
    );

    let mut task = fixture.pipeline.load_image(fixture.request());
    let mut seen = Vec::new();
    let result = loop {
        match task.event().await {
            Some(TaskEvent::Progress(progress)) => seen.push(progress),
            Some(TaskEvent::Finished(result)) => break result,
            Some(_) => continue,
            None => panic!("stream ended without terminal event"),
        }
    };
    result.unwrap();
    assert!(!seen.is_empty());
    for pair in seen.windows(2) {
        assert!(pair[1].completed >= pair[0].completed);
    }
    let last = seen.last().unwrap();
    assert_eq!(last.completed, payload.len() as i64);
    assert_eq!(last.total, payload.len() as i64);
}

#[tokio::test]
async fn test_skip_data_loading_queue_bypasses_the_concurrency_bound() {
    let fixture = TestPipeline::new(|_| {});
    fixture.loader.add_image(&test_url(), 8, 8);
    // A fully suspended queue would stall a normal load forever.
    fixture
        .pipeline
        .configuration()
        .data_loading_queue
        .set_suspended(true);

    let request = fixture.request().with_options(RequestOptions {
        skip_data_loading_queue: true,
        ..Default::default()
    });
    let response = tokio::time::timeout(
        Duration::from_secs(2),
        fixture.pipeline.image(request),
    )
    .await
    .expect("load should bypass the suspended queue")
    .unwrap();
    assert_eq!(response.image().width(), 8);
}

#[tokio::test]
async fn test_invalidate_terminates_live_and_future_tasks() {
    let fixture = TestPipeline::new(|_| {});
    fixture.loader.set_suspended(true);
    fixture.loader.add_image(&test_url(), 8, 8);

    let mut live = fixture.pipeline.load_image(fixture.request());
    fixture.pipeline.invalidate();

    let event = live.event().await.unwrap();
    match event {
        TaskEvent::Finished(Err(PixfetchError::PipelineInvalidated)) => {}
        other => panic!("unexpected event: {other:?}"),
    }

    let err = fixture.pipeline.image(fixture.request()).await.unwrap_err();
    assert!(matches!(err, PixfetchError::PipelineInvalidated));
}
