//! Cache layers: the in-memory image cache and the on-disk data cache,
//! plus the key-derivation helpers shared by both.

pub mod disk;
pub mod key;
pub mod memory;

pub use disk::{DataCaching, DiskCache};
pub use key::{ImageCacheKey, make_disk_cache_key, make_image_cache_key};
pub use memory::{ImageCache, ImageCaching, MemoryCache};
