//! Byte transport: the loader contract, the built-in HTTP loader, the
//! resumable download store, and the data-queue rate limiter.

pub mod http;
pub mod rate_limiter;
pub mod resumable;

use bytes::Bytes;
use futures::stream::BoxStream;
use url::Url;

use crate::request::UrlRequest;

pub use http::HttpDataLoader;

/// Transport-level response metadata.
#[derive(Debug, Clone)]
pub struct DataResponse {
    /// Final URL of the response
    pub url: Url,
    /// HTTP status code
    pub status_code: u16,
    /// Response header fields
    pub headers: Vec<(String, String)>,
    /// `Content-Length` of this response, when known
    pub expected_content_length: Option<i64>,
}

impl DataResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whether the status code is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// One delivery from a loader: a chunk of bytes plus, at least on the
/// first delivery, the response metadata.
#[derive(Debug, Clone)]
pub struct DataChunk {
    /// The bytes of this chunk (not cumulative)
    pub data: Bytes,
    /// Response metadata; present at least on the first chunk
    pub response: Option<DataResponse>,
}

/// The stream of chunks produced by a loader. Dropping the stream
/// cancels the transfer.
pub type DataStream = BoxStream<'static, crate::Result<DataChunk>>;

/// The byte-fetcher collaborator.
///
/// Implementations stream chunks as they arrive and terminate the
/// stream with `Ok` exhaustion or a single error. Cancellation is
/// dropping the returned stream.
pub trait DataLoader: Send + Sync {
    /// Start a transfer for `request`.
    fn load(&self, request: &UrlRequest) -> DataStream;
}
