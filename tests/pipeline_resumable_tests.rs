//! Resumable downloads: validator capture, range continuation, and
//! full-restart fallback.
//!
//! Each test uses its own URL because the resumable store is
//! process-wide.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use pixfetch::codec::{DecodeContext, ImageDecoder};
use pixfetch::{PixfetchError, TaskEvent};
use url::Url;

fn progressive_fixture(decoder: Arc<MockProgressiveDecoder>) -> TestPipeline {
    TestPipeline::new(move |config| {
        config.make_image_decoder = Arc::new(move |_context: &DecodeContext| {
            let decoder: Arc<dyn ImageDecoder> = decoder.clone();
            Some(decoder)
        });
    })
}

#[tokio::test]
async fn test_interrupted_download_resumes_with_range_headers() {
    let url = Url::parse("http://test.com/resumable_01.jpeg").unwrap();
    let decoder = MockProgressiveDecoder::new();
    let fixture = progressive_fixture(decoder.clone());

    // Attempt 1: 11397 of 22789 bytes, then a mid-stream failure.
    let full_len = 22789i64;
    let first = MockTransfer {
        response: response(
            &url,
            200,
            vec![("Accept-Ranges", "bytes"), ("ETag", "img_01")],
            Some(full_len),
        ),
        chunks: vec![Bytes::from(vec![1u8; 5000]), Bytes::from(vec![2u8; 6397])],
        error: None,
        chunk_delay: Duration::from_millis(2),
    }
    .failing_after(2);
    fixture.loader.add_transfer(&url, first);

    // Attempt 2: the server honors the range with a 206 for the
    // remaining 11392 bytes.
    let second = MockTransfer {
        response: response(
            &url,
            206,
            vec![("Accept-Ranges", "bytes"), ("ETag", "img_01")],
            Some(full_len - 11397),
        ),
        chunks: vec![Bytes::from(vec![3u8; 3799]), Bytes::from(vec![4u8; 7593])],
        error: None,
        chunk_delay: Duration::from_millis(2),
    };
    fixture.loader.add_transfer(&url, second);

    let request = pixfetch::ImageRequest::new(url.clone());
    let err = fixture.pipeline.image(request.clone()).await.unwrap_err();
    assert!(matches!(err, PixfetchError::DataLoadingFailed { .. }));

    // Second attempt reports progress continuing from the resumed
    // offset and completes the full payload.
    let mut task = fixture.pipeline.load_image(request);
    let mut progress = Vec::new();
    let result = loop {
        match task.event().await {
            Some(TaskEvent::Progress(p)) => progress.push(p),
            Some(TaskEvent::Finished(result)) => break result,
            Some(_) => continue,
            None => panic!("missing terminal event"),
        }
    };
    result.unwrap();

    assert_eq!(progress.first().unwrap().completed, 15196);
    assert_eq!(progress.first().unwrap().total, 22789);
    assert_eq!(progress.last().unwrap().completed, 22789);
    assert_eq!(progress.last().unwrap().total, 22789);
    // The decoder saw the complete spliced payload.
    assert_eq!(decoder.final_byte_counts(), vec![22789]);

    // The retry carried the continuation headers.
    let requests = fixture.loader.requests();
    assert_eq!(requests.len(), 2);
    let headers = &requests[1].headers;
    assert!(headers.contains(&("Range".to_string(), "bytes=11397-".to_string())));
    assert!(headers.contains(&("If-Range".to_string(), "img_01".to_string())));
}

#[tokio::test]
async fn test_full_response_discards_stale_partial_data() {
    let url = Url::parse("http://test.com/resumable_02.jpeg").unwrap();
    let decoder = MockProgressiveDecoder::new();
    let fixture = progressive_fixture(decoder.clone());

    let first = MockTransfer {
        response: response(
            &url,
            200,
            vec![("Accept-Ranges", "bytes"), ("ETag", "img_02")],
            Some(1000),
        ),
        chunks: vec![Bytes::from(vec![1u8; 400])],
        error: None,
        chunk_delay: Duration::ZERO,
    }
    .failing_after(1);
    fixture.loader.add_transfer(&url, first);

    // The resource changed; the server answers 200 with a fresh body.
    let second = MockTransfer {
        response: response(&url, 200, vec![("ETag", "img_02b")], Some(600)),
        chunks: vec![Bytes::from(vec![9u8; 600])],
        error: None,
        chunk_delay: Duration::ZERO,
    };
    fixture.loader.add_transfer(&url, second);

    let request = pixfetch::ImageRequest::new(url.clone());
    fixture.pipeline.image(request.clone()).await.unwrap_err();
    fixture.pipeline.image(request).await.unwrap();

    // Only the fresh 600 bytes reached the decoder.
    assert_eq!(decoder.final_byte_counts(), vec![600]);
}

#[tokio::test]
async fn test_resumable_disabled_sends_no_range_headers() {
    let url = Url::parse("http://test.com/resumable_03.jpeg").unwrap();
    let decoder = MockProgressiveDecoder::new();
    let fixture = {
        let decoder = decoder.clone();
        TestPipeline::new(move |config| {
            config.make_image_decoder = Arc::new(move |_context: &DecodeContext| {
                let inner: Arc<dyn ImageDecoder> = decoder.clone();
                Some(inner)
            });
            config.is_resumable_data_enabled = false;
        })
    };

    let first = MockTransfer {
        response: response(
            &url,
            200,
            vec![("Accept-Ranges", "bytes"), ("ETag", "img_03")],
            Some(1000),
        ),
        chunks: vec![Bytes::from(vec![1u8; 400])],
        error: None,
        chunk_delay: Duration::ZERO,
    }
    .failing_after(1);
    fixture.loader.add_transfer(&url, first);
    let second = MockTransfer {
        response: response(&url, 200, vec![], Some(500)),
        chunks: vec![Bytes::from(vec![2u8; 500])],
        error: None,
        chunk_delay: Duration::ZERO,
    };
    fixture.loader.add_transfer(&url, second);

    let request = pixfetch::ImageRequest::new(url.clone());
    fixture.pipeline.image(request.clone()).await.unwrap_err();
    fixture.pipeline.image(request).await.unwrap();

    let requests = fixture.loader.requests();
    assert!(requests[1].headers.is_empty());
}
