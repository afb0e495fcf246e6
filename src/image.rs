//! In-memory image representation shared across the pipeline.
//!
//! The pipeline is codec-agnostic: decoders produce a [`Bitmap`] (a
//! plain RGBA pixel buffer with display metadata) wrapped in an
//! [`ImageContainer`] that carries delivery metadata such as the
//! preview flag and, for animated formats, the original bytes.

use std::collections::HashMap;

use bytes::Bytes;

use crate::codec::ImageType;

/// EXIF-style display orientation of a bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum Orientation {
    /// Default row-major orientation
    #[default]
    Up,
    /// Rotated 180 degrees
    Down,
    /// Rotated 90 degrees counter-clockwise
    Left,
    /// Rotated 90 degrees clockwise
    Right,
    /// Mirrored horizontally
    UpMirrored,
    /// Rotated 180 degrees and mirrored
    DownMirrored,
    /// Rotated left and mirrored
    LeftMirrored,
    /// Rotated right and mirrored
    RightMirrored,
}

/// A decoded image: an RGBA8 pixel buffer plus display metadata.
///
/// Bitmaps are value types; the pixel buffer is a shared [`Bytes`]
/// handle, so cloning is cheap.
#[derive(Debug, Clone)]
pub struct Bitmap {
    width: u32,
    height: u32,
    /// Display scale factor (1.0 = one pixel per point)
    pub scale: f32,
    /// Display orientation
    pub orientation: Orientation,
    /// True when the image has no transparent pixels
    pub is_opaque: bool,
    pixels: Bytes,
    render_prepared: bool,
}

impl Bitmap {
    /// Create a bitmap from an RGBA8 pixel buffer.
    ///
    /// The buffer length must be exactly `width * height * 4` bytes.
    pub fn new(width: u32, height: u32, pixels: Bytes) -> Option<Self> {
        if pixels.len() != (width as usize) * (height as usize) * 4 {
            return None;
        }
        Some(Self {
            width,
            height,
            scale: 1.0,
            orientation: Orientation::Up,
            is_opaque: false,
            pixels,
            render_prepared: false,
        })
    }

    /// Create a bitmap filled with a single RGBA color.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let count = (width as usize) * (height as usize);
        let mut buf = Vec::with_capacity(count * 4);
        for _ in 0..count {
            buf.extend_from_slice(&rgba);
        }
        Self {
            width,
            height,
            scale: 1.0,
            orientation: Orientation::Up,
            is_opaque: rgba[3] == u8::MAX,
            pixels: Bytes::from(buf),
            render_prepared: false,
        }
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// The RGBA8 pixel buffer.
    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    /// Approximate memory footprint of the decoded pixels in bytes.
    pub fn cost(&self) -> usize {
        self.pixels.len()
    }

    /// Whether the bitmap has been forced into a render-ready form.
    pub fn is_render_prepared(&self) -> bool {
        self.render_prepared
    }

    /// Force the bitmap into a render-ready form: the pixel buffer is
    /// copied into fresh contiguous storage so a renderer never touches
    /// lazily-backed memory.
    pub(crate) fn render_prepared(mut self) -> Self {
        if !self.render_prepared {
            self.pixels = Bytes::from(self.pixels.to_vec());
            self.render_prepared = true;
        }
        self
    }

    /// Replace the pixel buffer, keeping the metadata.
    ///
    /// Returns `None` when the buffer does not match the dimensions.
    pub fn with_pixels(mut self, pixels: Bytes) -> Option<Self> {
        if pixels.len() != (self.width as usize) * (self.height as usize) * 4 {
            return None;
        }
        self.pixels = pixels;
        self.render_prepared = false;
        Some(self)
    }
}

// The render-prepared flag is a delivery detail, not part of identity.
impl PartialEq for Bitmap {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.scale.to_bits() == other.scale.to_bits()
            && self.orientation == other.orientation
            && self.is_opaque == other.is_opaque
            && self.pixels == other.pixels
    }
}

/// A decoded image plus delivery metadata.
///
/// `is_preview` marks intermediates produced by progressive decoding.
/// `data` optionally carries the original bytes, e.g. so an animated
/// image can be replayed by the host without another fetch.
#[derive(Debug, Clone, Default)]
pub struct ImageContainer {
    /// The decoded image
    pub image: Bitmap,
    /// Detected format of the source data, when known
    pub image_type: Option<ImageType>,
    /// True for progressive-decoding intermediates
    pub is_preview: bool,
    /// Original bytes, when the decoder chose to retain them
    pub data: Option<Bytes>,
    /// Free-form metadata attached by decoders and processors
    pub user_info: HashMap<String, serde_json::Value>,
}

impl ImageContainer {
    /// Wrap a bitmap as a final (non-preview) container.
    pub fn new(image: Bitmap) -> Self {
        Self {
            image,
            ..Default::default()
        }
    }

    /// Wrap a bitmap as a progressive preview.
    pub fn preview(image: Bitmap) -> Self {
        Self {
            image,
            is_preview: true,
            ..Default::default()
        }
    }

    /// Transform the image while keeping all metadata.
    pub fn map(mut self, f: impl FnOnce(Bitmap) -> Bitmap) -> Self {
        self.image = f(self.image);
        self
    }
}

impl PartialEq for ImageContainer {
    fn eq(&self, other: &Self) -> bool {
        self.image == other.image
            && self.image_type == other.image_type
            && self.is_preview == other.is_preview
    }
}

impl Default for Bitmap {
    fn default() -> Self {
        Bitmap::filled(0, 0, [0, 0, 0, 0])
    }
}
