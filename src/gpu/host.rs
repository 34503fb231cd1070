//! Host-memory texture cache: textures are zero-copy views of plane bytes

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::pool::TexturePool;
use super::{
    validate_plane, GpuDevice, Texture, TextureCache, TextureCacheError, TextureFormat, TextureKey,
    TextureResource,
};
use crate::capture::frame::PixelBuffer;

/// Plane bytes shared with the pixel buffer they came from
#[derive(Debug)]
pub struct HostPlane {
    data: Bytes,
    bytes_per_row: u32,
}

impl HostPlane {
    pub fn new(data: Bytes, bytes_per_row: u32) -> Self {
        Self { data, bytes_per_row }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn bytes_per_row(&self) -> u32 {
        self.bytes_per_row
    }
}

impl TextureResource for HostPlane {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Device whose "GPU memory" is the pixel buffers themselves. Used by
/// headless consumers and tests.
#[derive(Debug, Clone)]
pub struct HostGpu {
    name: String,
}

impl HostGpu {
    pub fn new() -> Self {
        Self {
            name: "host".to_string(),
        }
    }
}

impl Default for HostGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HostGpu {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_texture_cache(&self, capacity: usize) -> Result<Arc<dyn TextureCache>, TextureCacheError> {
        debug!(capacity, "creating host texture cache");
        Ok(Arc::new(HostTextureCache::new(capacity)?))
    }
}

pub struct HostTextureCache {
    pool: TexturePool<HostPlane>,
}

impl HostTextureCache {
    pub fn new(capacity: usize) -> Result<Self, TextureCacheError> {
        Ok(Self {
            pool: TexturePool::new(capacity)?,
        })
    }
}

impl TextureCache for HostTextureCache {
    fn create_texture_from_image(
        &self,
        image: &PixelBuffer,
        plane: usize,
        format: TextureFormat,
        width: u32,
        height: u32,
    ) -> Result<Texture, TextureCacheError> {
        let (data, bytes_per_row) = validate_plane(image, plane, format, width, height)?;
        let key = TextureKey {
            buffer: image.id(),
            plane,
        };

        // A recycled buffer carries new contents, so the view is always rebuilt.
        let resource = self
            .pool
            .acquire(key, |_| Ok(Arc::new(HostPlane::new(data, bytes_per_row))))?;

        Ok(Texture::new(key, width, height, format, resource))
    }

    fn flush(&self) {
        self.pool.clear();
    }

    fn len(&self) -> usize {
        self.pool.len()
    }

    fn capacity(&self) -> usize {
        self.pool.capacity()
    }
}
