//! The built-in HTTP loader against a local mock server.

mod common;

use futures::StreamExt;

use pixfetch::loader::{DataLoader, HttpDataLoader};
use pixfetch::request::UrlRequest;
use tokio_test::assert_ok;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test]
async fn test_streams_body_and_response_metadata() {
    init_logging();
    let server = MockServer::start().await;
    let body = common::test_image_bytes(16, 16);
    Mock::given(method("GET"))
        .and(path("/image.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body.to_vec())
                .insert_header("ETag", "tag-1"),
        )
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/image.bin", server.uri())).unwrap();
    let loader = HttpDataLoader::new();
    let mut stream = loader.load(&UrlRequest::new(url));

    let mut collected = Vec::new();
    let mut response = None;
    while let Some(chunk) = stream.next().await {
        let chunk = assert_ok!(chunk);
        if let Some(meta) = chunk.response {
            response = Some(meta);
        }
        collected.extend_from_slice(&chunk.data);
    }

    assert_eq!(collected, body.to_vec());
    let response = response.expect("no response metadata delivered");
    assert_eq!(response.status_code, 200);
    assert_eq!(response.header("etag"), Some("tag-1"));
    assert_eq!(response.expected_content_length, Some(body.len() as i64));
}

#[tokio::test]
async fn test_request_headers_are_forwarded() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ranged.bin"))
        .and(header("Range", "bytes=100-"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![7u8; 32]))
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/ranged.bin", server.uri())).unwrap();
    let request = UrlRequest::new(url).with_header("Range", "bytes=100-");
    let mut stream = HttpDataLoader::new().load(&request);

    let first = stream.next().await.expect("empty stream").unwrap();
    assert_eq!(first.response.unwrap().status_code, 206);
}

#[tokio::test]
async fn test_error_status_fails_the_stream() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.bin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/missing.bin", server.uri())).unwrap();
    let mut stream = HttpDataLoader::new().load(&UrlRequest::new(url));
    let first = stream.next().await.expect("empty stream");
    assert!(matches!(
        first,
        Err(pixfetch::PixfetchError::DataLoadingFailed { .. })
    ));
}
