use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::gpu::TextureFormat;

/// Pixel layout the session asks the hardware for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelLayout {
    /// Single interleaved BGRA plane, directly displayable
    #[default]
    Rgb,
    /// Bi-planar luma + interleaved chroma (NV12)
    YCbCr,
}

impl PixelLayout {
    /// Hardware format that backs this layout
    pub fn native_format(self) -> PixelFormat {
        match self {
            PixelLayout::Rgb => PixelFormat::Bgra32,
            PixelLayout::YCbCr => PixelFormat::Nv12,
        }
    }

    /// Texture format of each plane, in plane order
    pub fn plane_formats(self) -> &'static [TextureFormat] {
        match self {
            PixelLayout::Rgb => &[TextureFormat::Bgra8Unorm],
            PixelLayout::YCbCr => &[TextureFormat::R8Unorm, TextureFormat::Rg8Unorm],
        }
    }
}

impl FromStr for PixelLayout {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rgb" | "bgra" => Ok(PixelLayout::Rgb),
            "ycbcr" | "nv12" | "yuv" => Ok(PixelLayout::YCbCr),
            _ => Err(ConfigError::UnknownLayout(s.to_string())),
        }
    }
}

/// Where the capture hardware sits relative to the screen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePosition {
    #[default]
    Unspecified,
    Front,
    Back,
}

impl FromStr for DevicePosition {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unspecified" | "any" => Ok(DevicePosition::Unspecified),
            "front" => Ok(DevicePosition::Front),
            "back" => Ok(DevicePosition::Back),
            _ => Err(ConfigError::UnknownPosition(s.to_string())),
        }
    }
}

/// Orientation applied to the output connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Portrait,
    PortraitUpsideDown,
    LandscapeRight,
    LandscapeLeft,
}

/// Pixel formats the hardware can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 32-bit B, G, R, A
    Bgra32,
    /// 8-bit Y plane followed by an interleaved 8-bit CbCr plane at half resolution
    Nv12,
}

impl PixelFormat {
    pub fn is_planar(self) -> bool {
        matches!(self, PixelFormat::Nv12)
    }

    /// Texture format a cache must use to alias `plane`
    pub fn plane_texture_format(self, plane: usize) -> Option<TextureFormat> {
        match (self, plane) {
            (PixelFormat::Bgra32, 0) => Some(TextureFormat::Bgra8Unorm),
            (PixelFormat::Nv12, 0) => Some(TextureFormat::R8Unorm),
            (PixelFormat::Nv12, 1) => Some(TextureFormat::Rg8Unorm),
            _ => None,
        }
    }
}

/// A rational media timestamp: `value / timescale` seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: i32,
    valid: bool,
}

impl MediaTime {
    /// Sentinel for a timestamp the hardware could not provide
    pub const INVALID: MediaTime = MediaTime {
        value: 0,
        timescale: 0,
        valid: false,
    };

    /// A zero or negative timescale yields an invalid time.
    pub const fn new(value: i64, timescale: i32) -> Self {
        Self {
            value,
            timescale,
            valid: timescale > 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn seconds(&self) -> Option<f64> {
        self.is_valid()
            .then(|| self.value as f64 / self.timescale as f64)
    }
}

/// Identity of a hardware pool buffer; reused when the pool recycles it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// One plane of a planar pixel buffer
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub bytes_per_row: u32,
}

#[derive(Debug, Clone)]
enum Storage {
    Packed { data: Bytes, bytes_per_row: u32 },
    Planar(Vec<Plane>),
}

/// Hardware-owned pixel memory; cloning shares the underlying bytes
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    id: BufferId,
    format: PixelFormat,
    width: u32,
    height: u32,
    storage: Storage,
}

impl PixelBuffer {
    pub fn packed(
        id: BufferId,
        format: PixelFormat,
        width: u32,
        height: u32,
        bytes_per_row: u32,
        data: Bytes,
    ) -> Self {
        Self {
            id,
            format,
            width,
            height,
            storage: Storage::Packed {
                data,
                bytes_per_row,
            },
        }
    }

    pub fn planar(id: BufferId, format: PixelFormat, width: u32, height: u32, planes: Vec<Plane>) -> Self {
        Self {
            id,
            format,
            width,
            height,
            storage: Storage::Planar(planes),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_planar(&self) -> bool {
        matches!(self.storage, Storage::Planar(_))
    }

    /// Number of planes; packed buffers report zero
    pub fn plane_count(&self) -> usize {
        match &self.storage {
            Storage::Packed { .. } => 0,
            Storage::Planar(planes) => planes.len(),
        }
    }

    pub fn plane_width(&self, index: usize) -> Option<u32> {
        self.plane(index).map(|p| p.width)
    }

    pub fn plane_height(&self, index: usize) -> Option<u32> {
        self.plane(index).map(|p| p.height)
    }

    /// Bytes and row stride backing `index`; a packed buffer exposes its
    /// whole memory as plane 0.
    pub fn plane_data(&self, index: usize) -> Option<(&Bytes, u32)> {
        match &self.storage {
            Storage::Packed {
                data,
                bytes_per_row,
            } if index == 0 => Some((data, *bytes_per_row)),
            Storage::Packed { .. } => None,
            Storage::Planar(planes) => planes.get(index).map(|p| (&p.data, p.bytes_per_row)),
        }
    }

    fn plane(&self, index: usize) -> Option<&Plane> {
        match &self.storage {
            Storage::Packed { .. } => None,
            Storage::Planar(planes) => planes.get(index),
        }
    }
}

/// Raw frame as delivered by the hardware: an image buffer plus its
/// presentation time. Only valid for the duration of one callback.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    image: Option<PixelBuffer>,
    presentation_time: MediaTime,
    pub sequence: u64,
}

impl SampleBuffer {
    pub fn new(image: Option<PixelBuffer>, presentation_time: MediaTime, sequence: u64) -> Self {
        Self {
            image,
            presentation_time,
            sequence,
        }
    }

    pub fn image_buffer(&self) -> Option<&PixelBuffer> {
        self.image.as_ref()
    }

    pub fn presentation_time(&self) -> MediaTime {
        self.presentation_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_time_converts_to_seconds() {
        assert_eq!(MediaTime::new(3003, 1000).seconds(), Some(3.003));
        assert_eq!(MediaTime::new(1, 3).seconds(), Some(1.0 / 3.0));
        assert_eq!(MediaTime::new(10, 0).seconds(), None);
        assert_eq!(MediaTime::INVALID.seconds(), None);
    }

    #[test]
    fn packed_buffer_exposes_plane_zero_only() {
        let buffer = PixelBuffer::packed(
            BufferId(1),
            PixelFormat::Bgra32,
            4,
            2,
            16,
            Bytes::from(vec![0u8; 32]),
        );
        assert!(!buffer.is_planar());
        assert_eq!(buffer.plane_count(), 0);
        assert_eq!(buffer.plane_width(0), None);
        assert_eq!(buffer.plane_data(0).map(|(d, bpr)| (d.len(), bpr)), Some((32, 16)));
        assert!(buffer.plane_data(1).is_none());
    }

    #[test]
    fn layouts_parse_from_strings() {
        assert_eq!("RGB".parse::<PixelLayout>().ok(), Some(PixelLayout::Rgb));
        assert_eq!("nv12".parse::<PixelLayout>().ok(), Some(PixelLayout::YCbCr));
        assert!("rgba64".parse::<PixelLayout>().is_err());
        assert_eq!("back".parse::<DevicePosition>().ok(), Some(DevicePosition::Back));
    }
}
