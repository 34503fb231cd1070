//! V4L2 capture hardware: device discovery, access checks and
//! memory-mapped streaming

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use nix::unistd::AccessFlags;
use tracing::{debug, error, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::device::{
    AccessCallback, CaptureDevice, CaptureDeviceProvider, DeviceError, DeviceStream, MediaType,
    StreamSettings,
};
use super::frame::{BufferId, DevicePosition, MediaTime, PixelBuffer, PixelFormat, Plane, SampleBuffer};
use super::graph::{Delivery, FrameSink};
use super::notify::{NotificationCenter, RuntimeFailure};

/// Driver timestamps are microseconds
const TIMESCALE: i32 = 1_000_000;

/// Upper bound on a blocking dequeue, so `stop` is never stuck behind a
/// silent device
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

const MAX_NODES: usize = 64;

fn fourcc_to_format(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"NV12" => Some(PixelFormat::Nv12),
        b"AR24" | b"BGR4" => Some(PixelFormat::Bgra32),
        _ => None,
    }
}

fn format_to_fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Nv12 => FourCC::new(b"NV12"),
        PixelFormat::Bgra32 => FourCC::new(b"AR24"),
    }
}

/// Cameras found under `/dev/video*`
pub struct V4l2Provider {
    devices: Vec<Arc<V4l2Device>>,
    notifications: NotificationCenter,
}

impl V4l2Provider {
    /// Probe `path` only, or every video node when `path` is `None`
    pub fn discover(path: Option<&str>) -> Self {
        let notifications = NotificationCenter::new();
        let candidates: Vec<String> = match path {
            Some(path) => vec![path.to_string()],
            None => (0..MAX_NODES).map(|i| format!("/dev/video{}", i)).collect(),
        };

        info!("Probing capture devices...");
        let devices = candidates
            .into_iter()
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| V4l2Device::probe(&path, notifications.clone()))
            .map(Arc::new)
            .collect::<Vec<_>>();

        if devices.is_empty() {
            warn!("No capture-capable V4L2 device found");
        }

        Self {
            devices,
            notifications,
        }
    }

    pub fn devices(&self) -> &[Arc<V4l2Device>] {
        &self.devices
    }

    fn resolve(&self, position: DevicePosition) -> Option<&Arc<V4l2Device>> {
        self.devices
            .iter()
            .find(|d| position == DevicePosition::Unspecified || d.position() == position)
    }
}

fn node_accessible(path: &str) -> bool {
    match nix::unistd::access(path, AccessFlags::R_OK | AccessFlags::W_OK) {
        Ok(()) => true,
        Err(errno) => {
            debug!(%path, %errno, "no access to capture node");
            false
        }
    }
}

impl CaptureDeviceProvider for V4l2Provider {
    fn find_device(&self, media: MediaType, position: DevicePosition) -> Option<Arc<dyn CaptureDevice>> {
        let MediaType::Video = media;
        self.resolve(position)
            .map(|d| d.clone() as Arc<dyn CaptureDevice>)
    }

    /// Granted when the process may read and write the node that
    /// `find_device` hands out. V4L2 nodes carry no position, so every
    /// request resolves to the same node.
    fn request_access(&self, _media: MediaType, callback: AccessCallback) {
        let path = self
            .resolve(DevicePosition::Unspecified)
            .map(|d| d.path.clone());
        thread::spawn(move || {
            let granted = path.as_deref().is_some_and(node_accessible);
            info!(granted, ?path, "capture hardware access checked");
            callback(granted);
        });
    }

    fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }
}

#[derive(Debug)]
pub struct V4l2Device {
    path: String,
    card: String,
    formats: Vec<PixelFormat>,
    notifications: NotificationCenter,
}

impl V4l2Device {
    fn probe(path: &str, notifications: NotificationCenter) -> Option<Self> {
        let dev = Device::with_path(path).ok()?;
        let caps = dev.query_caps().ok()?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return None;
        }

        let formats = supported_formats(&dev);
        info!("Found capture device: {} - {} ({:?})", path, caps.card, formats);
        Some(Self {
            path: path.to_string(),
            card: caps.card,
            formats,
            notifications,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

fn supported_formats(dev: &Device) -> Vec<PixelFormat> {
    let mut formats = Vec::new();
    for description in dev.enum_formats().unwrap_or_default() {
        if let Some(format) = fourcc_to_format(description.fourcc) {
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
    }
    formats
}

impl CaptureDevice for V4l2Device {
    fn unique_id(&self) -> &str {
        &self.path
    }

    fn name(&self) -> &str {
        &self.card
    }

    /// V4L2 does not report where a camera faces
    fn position(&self) -> DevicePosition {
        DevicePosition::Unspecified
    }

    fn open(&self) -> Result<Box<dyn DeviceStream>, DeviceError> {
        let device = Device::with_path(&self.path).map_err(|source| DeviceError::Open {
            name: self.path.clone(),
            source,
        })?;

        Ok(Box::new(V4l2Stream {
            path: self.path.clone(),
            formats: supported_formats(&device),
            device: Some(device),
            notifications: self.notifications.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }))
    }
}

/// Frame layout negotiated with the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane
    pub stride: u32,
}

impl Geometry {
    fn frame_len(&self) -> usize {
        let luma = self.stride as usize * self.height as usize;
        match self.format {
            PixelFormat::Bgra32 => luma,
            PixelFormat::Nv12 => luma + self.stride as usize * self.height.div_ceil(2) as usize,
        }
    }
}

/// Wrap one dequeued driver buffer. A short buffer yields a sample with no
/// image.
pub fn sample_from_frame(
    geometry: Geometry,
    data: &[u8],
    sequence: u64,
    timestamp_us: i64,
    buffer_count: u32,
) -> SampleBuffer {
    let time = MediaTime::new(timestamp_us, TIMESCALE);
    if data.len() < geometry.frame_len() {
        warn!(
            sequence,
            len = data.len(),
            expected = geometry.frame_len(),
            "short frame from driver"
        );
        return SampleBuffer::new(None, time, sequence);
    }

    let id = BufferId(sequence % u64::from(buffer_count.max(1)));
    let data = Bytes::copy_from_slice(&data[..geometry.frame_len()]);
    let Geometry {
        format,
        width,
        height,
        stride,
    } = geometry;

    let image = match format {
        PixelFormat::Bgra32 => PixelBuffer::packed(id, format, width, height, stride, data),
        PixelFormat::Nv12 => {
            let split = stride as usize * height as usize;
            let planes = vec![
                Plane {
                    data: data.slice(..split),
                    width,
                    height,
                    bytes_per_row: stride,
                },
                Plane {
                    data: data.slice(split..),
                    width: width.div_ceil(2),
                    height: height.div_ceil(2),
                    bytes_per_row: stride,
                },
            ];
            PixelBuffer::planar(id, format, width, height, planes)
        }
    };

    SampleBuffer::new(Some(image), time, sequence)
}

struct V4l2Stream {
    path: String,
    formats: Vec<PixelFormat>,
    device: Option<Device>,
    notifications: NotificationCenter,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl V4l2Stream {
    fn negotiate(&self, dev: &Device, settings: &StreamSettings) -> Result<Geometry, DeviceError> {
        let mut fmt = dev.format()?;
        fmt.width = settings.width;
        fmt.height = settings.height;
        fmt.fourcc = format_to_fourcc(settings.format);
        let fmt = dev.set_format(&fmt)?;

        if fourcc_to_format(fmt.fourcc) != Some(settings.format) {
            return Err(DeviceError::UnsupportedFormat {
                name: self.path.clone(),
                format: settings.format,
            });
        }

        if let Err(e) = dev.set_params(&Parameters::with_fps(settings.fps)) {
            warn!(path = %self.path, error = %e, "driver refused frame rate");
        }

        Ok(Geometry {
            format: settings.format,
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride,
        })
    }
}

impl DeviceStream for V4l2Stream {
    fn formats(&self) -> Vec<PixelFormat> {
        self.formats.clone()
    }

    #[instrument(skip(self, sink), fields(path = %self.path))]
    fn start(&mut self, settings: &StreamSettings, sink: FrameSink) -> Result<(), DeviceError> {
        if self.worker.is_some() {
            return Err(DeviceError::AlreadyStreaming {
                name: self.path.clone(),
            });
        }

        let dev = match self.device.take() {
            Some(dev) => dev,
            None => Device::with_path(&self.path).map_err(|source| DeviceError::Open {
                name: self.path.clone(),
                source,
            })?,
        };

        let geometry = self.negotiate(&dev, settings)?;
        let mut stream = MmapStream::with_buffers(&dev, Type::VideoCapture, settings.buffer_count)?;
        stream.set_timeout(DEQUEUE_TIMEOUT);
        info!(
            "Capture stream started with {} buffers: {:?}",
            settings.buffer_count, geometry
        );

        let stop = Arc::new(AtomicBool::new(false));
        self.stop = stop.clone();

        let capture = CaptureLoop {
            path: self.path.clone(),
            geometry,
            buffer_count: settings.buffer_count,
            notifications: self.notifications.clone(),
        };
        let worker = thread::Builder::new()
            .name("camtex-v4l2".into())
            .spawn(move || {
                capture.run(&mut stream, sink, &stop);
                drop(dev);
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(path = %self.path, "capture thread panicked");
            }
            debug!(path = %self.path, "capture stream stopped");
        }
    }
}

impl Drop for V4l2Stream {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureLoop {
    path: String,
    geometry: Geometry,
    buffer_count: u32,
    notifications: NotificationCenter,
}

impl CaptureLoop {
    fn run(&self, stream: &mut MmapStream<'static>, sink: FrameSink, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) {
            let sample = match stream.next() {
                Ok((buf, meta)) => {
                    let timestamp_us = meta.timestamp.sec as i64 * 1_000_000 + meta.timestamp.usec as i64;
                    sample_from_frame(
                        self.geometry,
                        buf,
                        u64::from(meta.sequence),
                        timestamp_us,
                        self.buffer_count,
                    )
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    if !stop.load(Ordering::SeqCst) {
                        error!(path = %self.path, error = %e, "capture read failed");
                        self.notifications.post(RuntimeFailure {
                            device: self.path.clone(),
                            reason: e.to_string(),
                        });
                    }
                    return;
                }
            };

            if sink.deliver(Some(sample)) == Delivery::Closed {
                return;
            }
        }
    }
}
