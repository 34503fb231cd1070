//! GPU-side texture handles and the caches that alias pixel buffers as textures

pub mod host;
mod pool;
pub mod wgpu_cache;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::capture::frame::{BufferId, PixelBuffer};

pub use host::{HostGpu, HostPlane, HostTextureCache};
pub use wgpu_cache::{WgpuGpu, WgpuPlane, WgpuTextureCache};

/// Texel formats a plane can be viewed as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// 8-bit single channel (luma)
    R8Unorm,
    /// 8-bit two channel (interleaved chroma)
    Rg8Unorm,
    /// 32-bit BGRA
    Bgra8Unorm,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rg8Unorm => 2,
            TextureFormat::Bgra8Unorm => 4,
        }
    }
}

/// Cache slot identity: one hardware buffer plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureKey {
    pub buffer: BufferId,
    pub plane: usize,
}

/// Backend storage behind a [`Texture`]
pub trait TextureResource: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

/// Reference-counted, immutable view of one plane as a sampleable texture
#[derive(Clone)]
pub struct Texture {
    key: TextureKey,
    width: u32,
    height: u32,
    format: TextureFormat,
    resource: Arc<dyn TextureResource>,
}

impl Texture {
    pub fn new(
        key: TextureKey,
        width: u32,
        height: u32,
        format: TextureFormat,
        resource: Arc<dyn TextureResource>,
    ) -> Self {
        Self {
            key,
            width,
            height,
            format,
            resource,
        }
    }

    pub fn key(&self) -> TextureKey {
        self.key
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Backend storage, if it is of type `R`
    pub fn resource<R: TextureResource>(&self) -> Option<&R> {
        self.resource.as_any().downcast_ref::<R>()
    }
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Texture")
            .field("buffer", &self.key.buffer)
            .field("plane", &self.key.plane)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TextureCacheError {
    #[error("texture cache capacity must be at least one entry")]
    ZeroCapacity,

    #[error("all {capacity} cache entries are still referenced")]
    Exhausted { capacity: usize },

    #[error("{buffer} has no plane {plane}")]
    MissingPlane { buffer: BufferId, plane: usize },

    #[error("{buffer} plane {plane} cannot be viewed as {format:?}: {reason}")]
    FormatMismatch {
        buffer: BufferId,
        plane: usize,
        format: TextureFormat,
        reason: &'static str,
    },

    #[error("GPU allocation failed: {0}")]
    Allocation(String),
}

/// A device able to host texture caches
pub trait GpuDevice: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn create_texture_cache(&self, capacity: usize) -> Result<Arc<dyn TextureCache>, TextureCacheError>;
}

/// Bounded pool translating pixel-buffer planes into textures.
///
/// Entries are keyed by buffer identity; a texture stays valid until the
/// cache is flushed or the pool recycles its entry.
pub trait TextureCache: Send + Sync {
    fn create_texture_from_image(
        &self,
        image: &PixelBuffer,
        plane: usize,
        format: TextureFormat,
        width: u32,
        height: u32,
    ) -> Result<Texture, TextureCacheError>;

    /// Drop every entry
    fn flush(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;
}

/// Check that `plane` of `image` can be aliased as a `width`x`height`
/// texture of `format`, returning its bytes and row stride.
pub(crate) fn validate_plane(
    image: &PixelBuffer,
    plane: usize,
    format: TextureFormat,
    width: u32,
    height: u32,
) -> Result<(Bytes, u32), TextureCacheError> {
    let buffer = image.id();
    let mismatch = |reason| TextureCacheError::FormatMismatch {
        buffer,
        plane,
        format,
        reason,
    };

    let (data, bytes_per_row) = image
        .plane_data(plane)
        .ok_or(TextureCacheError::MissingPlane { buffer, plane })?;

    if image.format().plane_texture_format(plane) != Some(format) {
        return Err(mismatch("pixel format differs"));
    }
    if width == 0 || height == 0 {
        return Err(mismatch("empty extent"));
    }

    let row = u64::from(width) * u64::from(format.bytes_per_pixel());
    if u64::from(bytes_per_row) < row {
        return Err(mismatch("row stride shorter than a row of texels"));
    }

    let needed = u64::from(bytes_per_row) * u64::from(height);
    if (data.len() as u64) < needed {
        return Err(mismatch("plane shorter than its extent"));
    }

    Ok((data.slice(..needed as usize), bytes_per_row))
}
