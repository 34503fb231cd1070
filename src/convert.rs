//! Sample buffer to texture conversion, run once per frame on the capture queue

use std::sync::Arc;

use tracing::{debug, trace};

use crate::capture::frame::{PixelLayout, SampleBuffer};
use crate::error::CameraError;
use crate::gpu::{Texture, TextureCache};

/// Textures of one frame (1 for RGB; luma then chroma for YCbCr) and its
/// presentation time in seconds
#[derive(Debug, Clone)]
pub struct ConvertedFrame {
    pub textures: Vec<Texture>,
    pub timestamp: f64,
}

pub struct FrameConverter {
    layout: PixelLayout,
    cache: Arc<dyn TextureCache>,
}

impl FrameConverter {
    pub fn new(layout: PixelLayout, cache: Arc<dyn TextureCache>) -> Self {
        Self { layout, cache }
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    /// Alias every plane the layout needs as a texture. No pixel data is
    /// copied; all-or-nothing, a failed plane yields no frame.
    pub fn convert(&self, sample: Option<&SampleBuffer>) -> Result<ConvertedFrame, CameraError> {
        let sample = sample.ok_or(CameraError::MissingSampleBuffer)?;
        let image = sample
            .image_buffer()
            .ok_or(CameraError::FailedToGetImageBuffer)?;

        let textures = self
            .layout
            .plane_formats()
            .iter()
            .enumerate()
            .map(|(plane, &format)| {
                let (width, height) = if image.is_planar() {
                    (
                        image.plane_width(plane).unwrap_or(0),
                        image.plane_height(plane).unwrap_or(0),
                    )
                } else {
                    (image.width(), image.height())
                };

                self.cache
                    .create_texture_from_image(image, plane, format, width, height)
                    .map_err(|e| {
                        debug!(buffer = %image.id(), plane, error = %e, "texture cache refused plane");
                        CameraError::FailedToCreateTextureFromImage
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let timestamp = sample
            .presentation_time()
            .seconds()
            .ok_or(CameraError::FailedToRetrieveTimestamp)?;

        trace!(sequence = sample.sequence, timestamp, planes = textures.len(), "frame converted");
        Ok(ConvertedFrame {
            textures,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{BufferId, MediaTime, PixelBuffer, PixelFormat, Plane};
    use crate::gpu::{HostTextureCache, TextureFormat};
    use bytes::Bytes;

    fn nv12(id: u64, width: u32, height: u32) -> PixelBuffer {
        let luma = Plane {
            data: Bytes::from(vec![0u8; (width * height) as usize]),
            width,
            height,
            bytes_per_row: width,
        };
        let chroma = Plane {
            data: Bytes::from(vec![128u8; (width * height / 2) as usize]),
            width: width / 2,
            height: height / 2,
            bytes_per_row: width,
        };
        PixelBuffer::planar(BufferId(id), PixelFormat::Nv12, width, height, vec![luma, chroma])
    }

    fn bgra(id: u64, width: u32, height: u32) -> PixelBuffer {
        PixelBuffer::packed(
            BufferId(id),
            PixelFormat::Bgra32,
            width,
            height,
            width * 4,
            Bytes::from(vec![255u8; (width * height * 4) as usize]),
        )
    }

    fn converter(layout: PixelLayout, capacity: usize) -> FrameConverter {
        FrameConverter::new(layout, Arc::new(HostTextureCache::new(capacity).unwrap()))
    }

    #[test]
    fn ycbcr_yields_luma_and_chroma_sized_per_plane() {
        let sample = SampleBuffer::new(Some(nv12(1, 640, 480)), MediaTime::new(90, 30), 0);
        let frame = converter(PixelLayout::YCbCr, 4)
            .convert(Some(&sample))
            .unwrap();

        assert_eq!(frame.textures.len(), 2);
        let luma = &frame.textures[0];
        let chroma = &frame.textures[1];
        assert_eq!((luma.width(), luma.height(), luma.format()), (640, 480, TextureFormat::R8Unorm));
        assert_eq!(
            (chroma.width(), chroma.height(), chroma.format()),
            (320, 240, TextureFormat::Rg8Unorm)
        );
        assert_eq!(frame.timestamp, 3.0);
    }

    #[test]
    fn rgb_yields_single_buffer_sized_texture() {
        let sample = SampleBuffer::new(Some(bgra(1, 1280, 720)), MediaTime::new(1001, 30000), 0);
        let frame = converter(PixelLayout::Rgb, 4).convert(Some(&sample)).unwrap();

        assert_eq!(frame.textures.len(), 1);
        assert_eq!(frame.textures[0].width(), 1280);
        assert_eq!(frame.textures[0].height(), 720);
        assert_eq!(frame.textures[0].format(), TextureFormat::Bgra8Unorm);
        assert_eq!(frame.timestamp, 1001.0 / 30000.0);
    }

    #[test]
    fn timestamp_is_value_over_timescale() {
        let converter = converter(PixelLayout::Rgb, 8);
        for (value, timescale) in [(0i64, 1i32), (1, 3), (-5, 2), (123_456_789, 1_000_000_000), (48_000, 600)] {
            let sample = SampleBuffer::new(Some(bgra(1, 2, 2)), MediaTime::new(value, timescale), 0);
            let frame = converter.convert(Some(&sample)).unwrap();
            assert_eq!(frame.timestamp, value as f64 / timescale as f64);
        }
    }

    #[test]
    fn invalid_timestamp_yields_no_frame() {
        let sample = SampleBuffer::new(Some(bgra(1, 2, 2)), MediaTime::INVALID, 0);
        assert_eq!(
            converter(PixelLayout::Rgb, 4).convert(Some(&sample)).unwrap_err(),
            CameraError::FailedToRetrieveTimestamp
        );
    }

    #[test]
    fn missing_sample_and_image_are_distinguished() {
        let converter = converter(PixelLayout::Rgb, 4);
        assert_eq!(converter.convert(None).unwrap_err(), CameraError::MissingSampleBuffer);

        let empty = SampleBuffer::new(None, MediaTime::new(1, 1), 0);
        assert_eq!(
            converter.convert(Some(&empty)).unwrap_err(),
            CameraError::FailedToGetImageBuffer
        );
    }

    #[test]
    fn layout_mismatch_fails_texture_creation() {
        // A packed BGRA buffer offered to a YCbCr session
        let sample = SampleBuffer::new(Some(bgra(1, 4, 4)), MediaTime::new(1, 1), 0);
        assert_eq!(
            converter(PixelLayout::YCbCr, 4).convert(Some(&sample)).unwrap_err(),
            CameraError::FailedToCreateTextureFromImage
        );
    }

    #[test]
    fn exhausted_cache_fails_texture_creation() {
        let converter = converter(PixelLayout::YCbCr, 1);
        let sample = SampleBuffer::new(Some(nv12(1, 8, 4)), MediaTime::new(1, 1), 0);
        assert_eq!(
            converter.convert(Some(&sample)).unwrap_err(),
            CameraError::FailedToCreateTextureFromImage
        );
    }
}
