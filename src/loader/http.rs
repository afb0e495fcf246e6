//! Streaming HTTP data loader backed by `reqwest`.

use futures::StreamExt;
use futures::stream;

use crate::loader::{DataChunk, DataLoader, DataResponse, DataStream};
use crate::request::UrlRequest;

/// The default [`DataLoader`]: a shared `reqwest` client streaming
/// response bodies chunk by chunk.
///
/// Dropping the returned stream aborts the underlying transfer.
#[derive(Clone)]
pub struct HttpDataLoader {
    client: reqwest::Client,
}

impl HttpDataLoader {
    /// Create a loader with a default client.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Create a loader over a preconfigured client (proxies, custom
    /// TLS, timeouts).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn response_metadata(response: &reqwest::Response) -> DataResponse {
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        DataResponse {
            url: response.url().clone(),
            status_code: response.status().as_u16(),
            headers,
            expected_content_length: response.content_length().map(|len| len as i64),
        }
    }
}

impl Default for HttpDataLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DataLoader for HttpDataLoader {
    fn load(&self, request: &UrlRequest) -> DataStream {
        let client = self.client.clone();
        let request = request.clone();
        let opening = async move {
            let mut builder = client.get(request.url.clone());
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            let response = builder.send().await?;
            if response.status().is_server_error() || response.status().is_client_error() {
                return Err(crate::error::PixfetchError::data_loading_failed(format!(
                    "unexpected status {} for {}",
                    response.status(),
                    request.url
                )));
            }
            let metadata = Self::response_metadata(&response);
            log::debug!(
                "http loader: {} -> {} ({:?} bytes)",
                request.url,
                metadata.status_code,
                metadata.expected_content_length
            );
            Ok::<_, crate::error::PixfetchError>((metadata, response.bytes_stream()))
        };
        stream::once(opening)
            .map(|opened| match opened {
                Ok((metadata, body)) => {
                    let mut first = Some(metadata);
                    body.map(move |chunk| match chunk {
                        Ok(data) => Ok(DataChunk {
                            data,
                            response: first.take(),
                        }),
                        Err(err) => Err(err.into()),
                    })
                    .left_stream()
                }
                Err(err) => stream::once(async move { Err(err) }).right_stream(),
            })
            .flatten()
            .boxed()
    }
}
