//! pixfetch library root.
//!
//! An async image loading pipeline: multi-layer caching (memory +
//! disk), request coalescing, prioritized bounded work queues,
//! progressive decoding with back-pressure, and resumable downloads.

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cache;
pub mod codec;
pub mod config;
pub mod core;
pub mod error;
pub mod image;
pub mod loader;
pub mod observer;
pub mod pipeline;
pub mod process;
pub mod request;
pub mod response;

pub type Result<T> = error::PixfetchResult<T>;

pub use config::{DataCachePolicy, PipelineConfig};
pub use error::PixfetchError;
pub use image::{Bitmap, ImageContainer, Orientation};
pub use pipeline::{CacheLayers, ImagePipeline, ImageTask, PipelineCache, TaskEvent};
pub use request::{ImageRequest, ImageSource, Priority, RequestOptions, ThumbnailOptions};
pub use response::{CacheType, ImageResponse, Progress};
