//! Image format detection from magic numbers.

/// Recognized source formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ImageType {
    Jpeg,
    Png,
    Gif,
    Webp,
    /// The crate's own uncompressed bitmap wire format
    RawBitmap,
}

impl ImageType {
    /// Detect the format from the leading bytes. Needs at most 12
    /// bytes; returns `None` for unknown or too-short data.
    pub fn sniff(data: &[u8]) -> Option<ImageType> {
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageType::Jpeg)
        } else if data.starts_with(&[0x89, b'P', b'N', b'G']) {
            Some(ImageType::Png)
        } else if data.starts_with(b"GIF8") {
            Some(ImageType::Gif)
        } else if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            Some(ImageType::Webp)
        } else if data.starts_with(b"PXBM") {
            Some(ImageType::RawBitmap)
        } else {
            None
        }
    }

    /// Short lowercase name, used in error reports.
    pub fn name(&self) -> &'static str {
        match self {
            ImageType::Jpeg => "jpeg",
            ImageType::Png => "png",
            ImageType::Gif => "gif",
            ImageType::Webp => "webp",
            ImageType::RawBitmap => "raw-bitmap",
        }
    }
}
