//! wgpu-backed texture cache

use std::any::Any;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, instrument};
use wgpu::{
    Adapter, Backends, Device, DeviceDescriptor, Extent3d, Features, ImageCopyTexture, ImageDataLayout,
    Instance, InstanceDescriptor, Limits, Origin3d, PowerPreference, Queue, RequestAdapterOptions,
    TextureAspect, TextureDescriptor, TextureDimension, TextureUsages, TextureView,
    TextureViewDescriptor,
};

use super::pool::TexturePool;
use super::{
    validate_plane, GpuDevice, Texture, TextureCache, TextureCacheError, TextureFormat, TextureKey,
    TextureResource,
};
use crate::capture::frame::PixelBuffer;

impl TextureFormat {
    pub fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
            TextureFormat::Rg8Unorm => wgpu::TextureFormat::Rg8Unorm,
            TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        }
    }
}

/// GPU device and queue shared by the texture cache and the renderer
pub struct WgpuGpu {
    name: String,
    pub instance: Instance,
    pub adapter: Adapter,
    pub device: Arc<Device>,
    pub queue: Arc<Queue>,
}

impl WgpuGpu {
    /// Pick a high-performance adapter and open a device on it
    #[instrument]
    pub async fn new() -> Result<Self> {
        let instance = Instance::new(InstanceDescriptor {
            backends: Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| eyre!("No suitable GPU adapter found"))?;

        let name = adapter.get_info().name;
        info!("GPU: {}", name);

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("camtex device"),
                    required_features: Features::empty(),
                    required_limits: Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await?;

        Ok(Self {
            name,
            instance,
            adapter,
            device: Arc::new(device),
            queue: Arc::new(queue),
        })
    }
}

impl GpuDevice for WgpuGpu {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_texture_cache(&self, capacity: usize) -> Result<Arc<dyn TextureCache>, TextureCacheError> {
        debug!(capacity, "creating wgpu texture cache");
        Ok(Arc::new(WgpuTextureCache {
            device: self.device.clone(),
            queue: self.queue.clone(),
            pool: TexturePool::new(capacity)?,
        }))
    }
}

/// A plane resident in GPU memory
#[derive(Debug)]
pub struct WgpuPlane {
    pub texture: wgpu::Texture,
    pub view: TextureView,
    width: u32,
    height: u32,
    format: TextureFormat,
}

impl WgpuPlane {
    fn new(device: &Device, width: u32, height: u32, format: TextureFormat) -> Self {
        let texture = device.create_texture(&TextureDescriptor {
            label: Some("camtex plane"),
            size: Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: format.to_wgpu(),
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&TextureViewDescriptor::default());

        Self {
            texture,
            view,
            width,
            height,
            format,
        }
    }

    fn fits(&self, width: u32, height: u32, format: TextureFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }
}

impl TextureResource for WgpuPlane {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One GPU texture per pool buffer plane, refreshed from the plane on
/// every arrival and reused while its extent and format still fit.
///
/// Not zero-copy like [`HostTextureCache`](super::HostTextureCache): each
/// plane is uploaded with `write_texture`, so conversion costs O(pixels)
/// on the capture queue.
pub struct WgpuTextureCache {
    device: Arc<Device>,
    queue: Arc<Queue>,
    pool: TexturePool<WgpuPlane>,
}

impl TextureCache for WgpuTextureCache {
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

        let resource = self.pool.acquire(key, |existing| {
            let target = match existing {
                Some(current) if current.fits(width, height, format) => current.clone(),
                _ => Arc::new(WgpuPlane::new(&self.device, width, height, format)),
            };

            self.queue.write_texture(
                ImageCopyTexture {
                    texture: &target.texture,
                    mip_level: 0,
                    origin: Origin3d::ZERO,
                    aspect: TextureAspect::All,
                },
                &data,
                ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(height),
                },
                Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
            Ok(target)
        })?;

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
