//! Error types for the pixfetch image loading pipeline.
//!
//! This module defines the `PixfetchError` enum covering all error
//! conditions that can surface from a load task: cache misses in
//! cache-only mode, transport failures, decoder and processor failures,
//! and pipeline invalidation.
//!
//! Errors fan out to every subscriber of a coalesced load, so all
//! variants are cheap to clone.
use thiserror::Error;

/// Represents all possible errors surfaced by an image load task.
///
/// Each variant provides specific context to facilitate debugging and
/// user-friendly reporting.
///
/// # Examples
///
/// ```rust
/// use pixfetch::error::{PixfetchError, PixfetchResult};
///
/// fn example() -> PixfetchResult<()> {
///     Err(PixfetchError::DecodingFailed {
///         decoder: "raw-bitmap".to_string(),
///         message: "truncated pixel payload".to_string(),
///     })
/// }
/// ```
#[derive(Error, Debug, Clone)]
pub enum PixfetchError {
    /// The request demanded cached data only and the cache had none.
    ///
    /// Returned for requests with `return_cache_data_dont_load` when
    /// neither cache layer can satisfy them. No network activity occurs.
    #[error("data is missing from the cache")]
    DataMissingInCache,

    /// The byte transport failed before the full payload arrived.
    ///
    /// Contains the underlying loader failure rendered as a string.
    /// Partial transfers may still have been captured by the resumable
    /// download store for a later attempt.
    #[error("data loading failed: {message}")]
    DataLoadingFailed {
        /// Description of the transport failure
        message: String,
    },

    /// The transport completed but delivered zero bytes.
    #[error("the loaded data is empty")]
    DataIsEmpty,

    /// No decoder accepted the loaded data.
    ///
    /// The decoder factory was consulted with the full payload and
    /// returned none.
    #[error("no decoder is registered for the image [{format}]")]
    DecoderNotRegistered {
        /// Best-effort name of the detected format, or "unknown"
        format: String,
    },

    /// A decoder accepted the data but failed to produce an image.
    ///
    /// Only the final decode pass can produce this error; failures of
    /// speculative preview decodes are swallowed.
    #[error("image decoding failed [{decoder}]: {message}")]
    DecodingFailed {
        /// Name of the decoder that failed
        decoder: String,
        /// Detailed error message from the decoder
        message: String,
    },

    /// A processor in the request's processing chain failed.
    #[error("image processing failed [{processor}]: {message}")]
    ProcessingFailed {
        /// Identifier of the processor that failed
        processor: String,
        /// Detailed error message from the processor
        message: String,
    },

    /// The pipeline was invalidated; all tasks terminate with this error
    /// and new requests are rejected with it.
    #[error("the image pipeline has been invalidated")]
    PipelineInvalidated,

    /// The task was cancelled before completion.
    ///
    /// Emitted only by the awaitable convenience wrappers; the event
    /// stream reports cancellation as a distinct terminal event rather
    /// than an error.
    #[error("the image task was cancelled")]
    Cancelled,

    /// I/O failure outside the cache layers (cache I/O failures degrade
    /// to misses and are logged instead).
    #[error("I/O error: {0}")]
    Io(String),

    /// Catch-all wrapping a collaborator failure (custom loaders,
    /// producers, processors).
    #[error("{0}")]
    Other(std::sync::Arc<anyhow::Error>),
}

impl PixfetchError {
    /// Create a data-loading error from any displayable failure.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use pixfetch::error::PixfetchError;
    /// let err = PixfetchError::data_loading_failed("connection reset");
    /// assert_eq!(err.to_string(), "data loading failed: connection reset");
    /// ```
    pub fn data_loading_failed(message: impl ToString) -> Self {
        PixfetchError::DataLoadingFailed {
            message: message.to_string(),
        }
    }

    /// Create a decoder-not-registered error for the given format name.
    pub fn decoder_not_registered(format: impl Into<String>) -> Self {
        PixfetchError::DecoderNotRegistered {
            format: format.into(),
        }
    }

    /// Create a decoding error for the named decoder.
    pub fn decoding_failed<S1, S2>(decoder: S1, message: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        PixfetchError::DecodingFailed {
            decoder: decoder.into(),
            message: message.into(),
        }
    }

    /// Create a processing error carrying the processor identity.
    pub fn processing_failed<S1, S2>(processor: S1, message: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        PixfetchError::ProcessingFailed {
            processor: processor.into(),
            message: message.into(),
        }
    }

    /// True when the error is terminal for the whole pipeline rather
    /// than a single request.
    pub fn is_invalidation(&self) -> bool {
        matches!(self, PixfetchError::PipelineInvalidated)
    }
}

impl From<std::io::Error> for PixfetchError {
    fn from(err: std::io::Error) -> Self {
        PixfetchError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for PixfetchError {
    fn from(err: anyhow::Error) -> Self {
        PixfetchError::Other(std::sync::Arc::new(err))
    }
}

impl From<reqwest::Error> for PixfetchError {
    fn from(err: reqwest::Error) -> Self {
        PixfetchError::data_loading_failed(err)
    }
}

/// Specialized `Result` type for pipeline operations.
pub type PixfetchResult<T> = Result<T, PixfetchError>;
