//! The built-in raw bitmap codec.
//!
//! A trivial self-describing wire format for uncompressed RGBA images:
//!
//! ```text
//! offset  size  field
//! 0       4     magic "PXBM"
//! 4       1     version (1)
//! 5       1     flags (bit 0: opaque)
//! 6       1     orientation code
//! 7       1     reserved (0)
//! 8       4     width, u32 little-endian
//! 12      4     height, u32 little-endian
//! 16      4     scale, f32 little-endian
//! 20      ...   RGBA8 pixels, width * height * 4 bytes
//! ```
//!
//! Processed images are encoded to this format when the data-cache
//! policy stores them; it is also the format accepted by the default
//! decoder factory.

use bytes::Bytes;

use crate::codec::{DecodeContext, ImageDecoder, ImageEncoder, ImageType};
use crate::error::PixfetchError;
use crate::image::{Bitmap, ImageContainer, Orientation};

const MAGIC: &[u8; 4] = b"PXBM";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 20;

const FLAG_OPAQUE: u8 = 1;

fn orientation_code(orientation: Orientation) -> u8 {
    match orientation {
        Orientation::Up => 0,
        Orientation::Down => 1,
        Orientation::Left => 2,
        Orientation::Right => 3,
        Orientation::UpMirrored => 4,
        Orientation::DownMirrored => 5,
        Orientation::LeftMirrored => 6,
        Orientation::RightMirrored => 7,
    }
}

fn orientation_from_code(code: u8) -> Option<Orientation> {
    Some(match code {
        0 => Orientation::Up,
        1 => Orientation::Down,
        2 => Orientation::Left,
        3 => Orientation::Right,
        4 => Orientation::UpMirrored,
        5 => Orientation::DownMirrored,
        6 => Orientation::LeftMirrored,
        7 => Orientation::RightMirrored,
        _ => return None,
    })
}

/// Codec for the raw bitmap wire format.
pub struct RawBitmapCodec;

impl RawBitmapCodec {
    /// Serialize a bitmap to the wire format.
    pub fn encode_bitmap(bitmap: &Bitmap) -> Bytes {
        let mut out = Vec::with_capacity(HEADER_LEN + bitmap.pixels().len());
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(if bitmap.is_opaque { FLAG_OPAQUE } else { 0 });
        out.push(orientation_code(bitmap.orientation));
        out.push(0);
        out.extend_from_slice(&bitmap.width().to_le_bytes());
        out.extend_from_slice(&bitmap.height().to_le_bytes());
        out.extend_from_slice(&bitmap.scale.to_le_bytes());
        out.extend_from_slice(bitmap.pixels());
        Bytes::from(out)
    }

    fn decode_bitmap(data: &Bytes) -> crate::Result<Bitmap> {
        let fail = |message: &str| PixfetchError::decoding_failed("raw-bitmap", message);
        if data.len() < HEADER_LEN {
            return Err(fail("truncated header"));
        }
        if &data[0..4] != MAGIC {
            return Err(fail("bad magic"));
        }
        if data[4] != VERSION {
            return Err(fail("unsupported version"));
        }
        let flags = data[5];
        let orientation =
            orientation_from_code(data[6]).ok_or_else(|| fail("bad orientation code"))?;
        let width = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let height = u32::from_le_bytes(data[12..16].try_into().unwrap());
        let scale = f32::from_le_bytes(data[16..20].try_into().unwrap());
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| fail("dimensions overflow"))?;
        let pixels = data.slice(HEADER_LEN..);
        if pixels.len() != expected {
            return Err(fail("truncated pixel payload"));
        }
        let mut bitmap =
            Bitmap::new(width, height, pixels).ok_or_else(|| fail("inconsistent dimensions"))?;
        bitmap.scale = scale;
        bitmap.orientation = orientation;
        bitmap.is_opaque = flags & FLAG_OPAQUE != 0;
        Ok(bitmap)
    }
}

impl ImageDecoder for RawBitmapCodec {
    fn decode(&self, data: &Bytes, _context: &DecodeContext) -> crate::Result<ImageContainer> {
        let bitmap = Self::decode_bitmap(data)?;
        let mut container = ImageContainer::new(bitmap);
        container.image_type = Some(ImageType::RawBitmap);
        Ok(container)
    }

    fn name(&self) -> &'static str {
        "raw-bitmap"
    }
}

impl ImageEncoder for RawBitmapCodec {
    fn encode(&self, container: &ImageContainer) -> Option<Bytes> {
        Some(Self::encode_bitmap(&container.image))
    }
}
