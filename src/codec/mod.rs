//! Decoder and encoder contracts.
//!
//! Concrete codecs are collaborators supplied by the host; the
//! pipeline only knows the factory contracts defined here. The one
//! built-in codec handles the crate's raw bitmap wire format, which is
//! also what processed images are encoded to for disk caching.

pub mod image_type;
pub mod progressive;
pub mod raw;

use std::sync::Arc;

use bytes::Bytes;

use crate::image::ImageContainer;
use crate::loader::DataResponse;
use crate::request::ImageRequest;

pub use image_type::ImageType;
pub use progressive::{ProgressiveScanTracker, is_progressive_jpeg};
pub use raw::RawBitmapCodec;

/// Everything a decoder (or the decoder factory) may inspect.
#[derive(Clone)]
pub struct DecodeContext {
    /// The originating request (carries thumbnail options)
    pub request: ImageRequest,
    /// The bytes received so far
    pub data: Bytes,
    /// Transport metadata, when the bytes came from a loader
    pub url_response: Option<DataResponse>,
    /// False while the payload is still growing
    pub is_completed: bool,
}

impl DecodeContext {
    /// Number of bytes available so far.
    pub fn byte_count(&self) -> usize {
        self.data.len()
    }

    /// Best-effort format detection over the available bytes.
    pub fn image_type(&self) -> Option<ImageType> {
        ImageType::sniff(&self.data)
    }
}

/// A byte-to-image decoder.
///
/// Decoders may be stateful: for progressive sources the pipeline
/// creates one decoder per load and feeds it growing byte prefixes.
pub trait ImageDecoder: Send + Sync {
    /// Decode a complete payload.
    fn decode(&self, data: &Bytes, context: &DecodeContext) -> crate::Result<ImageContainer>;

    /// Decode a partial payload, returning a preview when the bytes
    /// received so far complete a scan. The returned container must
    /// have `is_preview == true`.
    fn decode_partial(&self, _data: &Bytes, _context: &DecodeContext) -> Option<ImageContainer> {
        None
    }

    /// Whether this decoder can produce previews from partial data.
    /// Drives the default preview policy.
    fn is_progressive(&self) -> bool {
        false
    }

    /// Name used in error reports.
    fn name(&self) -> &'static str {
        "decoder"
    }
}

/// Everything an encoder may inspect.
#[derive(Clone)]
pub struct EncodeContext {
    /// The originating request
    pub request: ImageRequest,
}

/// An image-to-bytes encoder. Returning `None` is a benign skip; the
/// pipeline simply does not cache the encoded form.
pub trait ImageEncoder: Send + Sync {
    fn encode(&self, container: &ImageContainer) -> Option<Bytes>;
}

/// Per-request decoder factory. Returning `None` fails the load with
/// `DecoderNotRegistered`.
pub type DecoderFactory =
    Arc<dyn Fn(&DecodeContext) -> Option<Arc<dyn ImageDecoder>> + Send + Sync>;

/// Per-request encoder factory.
pub type EncoderFactory = Arc<dyn Fn(&EncodeContext) -> Arc<dyn ImageEncoder> + Send + Sync>;

/// The default decoder factory: accepts the raw bitmap format and
/// rejects everything else (real codecs are host collaborators).
pub fn default_decoder_factory() -> DecoderFactory {
    Arc::new(|context| match context.image_type() {
        Some(ImageType::RawBitmap) => {
            let codec: Arc<dyn ImageDecoder> = Arc::new(RawBitmapCodec);
            Some(codec)
        }
        _ => None,
    })
}

/// The default encoder factory: encodes to the raw bitmap format.
pub fn default_encoder_factory() -> EncoderFactory {
    Arc::new(|_context| {
        let codec: Arc<dyn ImageEncoder> = Arc::new(RawBitmapCodec);
        codec
    })
}
