//! Synthetic capture hardware producing test-pattern frames at a fixed rate.
//!
//! Access decisions, device lookup, open failures and per-sample faults
//! are all scriptable, which makes this provider the stand-in for real
//! cameras in tests and in `--synthetic` runs of the binary.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info};

use super::device::{
    AccessCallback, CaptureDevice, CaptureDeviceProvider, DeviceError, DeviceStream, MediaType,
    StreamSettings,
};
use super::frame::{
    BufferId, DevicePosition, MediaTime, Orientation, PixelBuffer, PixelFormat, Plane, SampleBuffer,
};
use super::graph::{Delivery, FrameSink};
use super::notify::{NotificationCenter, RuntimeFailure};

/// Timescale of synthetic presentation timestamps (nanoseconds)
pub const TIMESCALE: i32 = 1_000_000_000;

/// How the provider answers access requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    /// Answer `true` on the requesting thread
    Grant,
    /// Answer `false` on the requesting thread
    Deny,
    /// Answer `true` from another thread after a delay
    GrantAfter(Duration),
    /// Answer `false` from another thread after a delay
    DenyAfter(Duration),
    /// Never answer
    Never,
}

/// Defect injected into every sample a device produces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SampleFault {
    #[default]
    None,
    MissingSample,
    MissingImage,
    InvalidTimestamp,
}

pub struct SyntheticProvider {
    devices: Vec<Arc<SyntheticDevice>>,
    access: Mutex<AccessDecision>,
    access_requests: AtomicUsize,
    notifications: NotificationCenter,
}

impl SyntheticProvider {
    pub fn new(access: AccessDecision) -> Self {
        Self {
            devices: Vec::new(),
            access: Mutex::new(access),
            access_requests: AtomicUsize::new(0),
            notifications: NotificationCenter::new(),
        }
    }

    /// Access granted, one front and one back camera delivering both formats
    pub fn with_default_devices() -> Self {
        Self::new(AccessDecision::Grant)
            .with_device(SyntheticDevice::new("synthetic-front", DevicePosition::Front))
            .with_device(SyntheticDevice::new("synthetic-back", DevicePosition::Back))
    }

    pub fn with_device(mut self, device: SyntheticDevice) -> Self {
        self.devices.push(Arc::new(device));
        self
    }

    pub fn set_access(&self, decision: AccessDecision) {
        *self.access.lock().unwrap_or_else(PoisonError::into_inner) = decision;
    }

    pub fn access_requests(&self) -> usize {
        self.access_requests.load(Ordering::SeqCst)
    }

    pub fn device(&self, unique_id: &str) -> Option<Arc<SyntheticDevice>> {
        self.devices.iter().find(|d| d.id == unique_id).cloned()
    }

    /// Simulate a hardware fault on `unique_id`
    pub fn fail_device(&self, unique_id: &str, reason: &str) {
        if let Some(device) = self.device(unique_id) {
            device.stats.faulted.store(true, Ordering::SeqCst);
        }
        self.notifications.post(RuntimeFailure {
            device: unique_id.to_string(),
            reason: reason.to_string(),
        });
    }
}

impl CaptureDeviceProvider for SyntheticProvider {
    fn find_device(&self, media: MediaType, position: DevicePosition) -> Option<Arc<dyn CaptureDevice>> {
        let MediaType::Video = media;
        self.devices
            .iter()
            .find(|d| position == DevicePosition::Unspecified || d.position == position)
            .map(|d| d.clone() as Arc<dyn CaptureDevice>)
    }

    fn request_access(&self, _media: MediaType, callback: AccessCallback) {
        self.access_requests.fetch_add(1, Ordering::SeqCst);
        let decision = *self.access.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(?decision, "synthetic access request");

        match decision {
            AccessDecision::Grant => callback(true),
            AccessDecision::Deny => callback(false),
            AccessDecision::GrantAfter(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    callback(true);
                });
            }
            AccessDecision::DenyAfter(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    callback(false);
                });
            }
            AccessDecision::Never => drop(callback),
        }
    }

    fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }
}

#[derive(Debug, Default)]
struct DeviceStats {
    streams_started: AtomicUsize,
    frames_produced: AtomicU64,
    faulted: AtomicBool,
    last_settings: Mutex<Option<StreamSettings>>,
    orientation: Mutex<Option<Orientation>>,
}

/// A scriptable fake camera
#[derive(Debug)]
pub struct SyntheticDevice {
    id: String,
    position: DevicePosition,
    formats: Vec<PixelFormat>,
    fail_open: bool,
    fault: SampleFault,
    frame_limit: Option<u64>,
    pool_size: u64,
    stats: Arc<DeviceStats>,
}

impl SyntheticDevice {
    pub fn new(id: &str, position: DevicePosition) -> Self {
        Self {
            id: id.to_string(),
            position,
            formats: vec![PixelFormat::Bgra32, PixelFormat::Nv12],
            fail_open: false,
            fault: SampleFault::None,
            frame_limit: None,
            pool_size: 4,
            stats: Arc::default(),
        }
    }

    pub fn with_formats(mut self, formats: Vec<PixelFormat>) -> Self {
        self.formats = formats;
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn with_fault(mut self, fault: SampleFault) -> Self {
        self.fault = fault;
        self
    }

    /// Stop producing after `frames` samples per stream
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Number of distinct buffer identities cycled through
    pub fn with_pool_size(mut self, buffers: u64) -> Self {
        self.pool_size = buffers.max(1);
        self
    }

    pub fn streams_started(&self) -> usize {
        self.stats.streams_started.load(Ordering::SeqCst)
    }

    pub fn frames_produced(&self) -> u64 {
        self.stats.frames_produced.load(Ordering::SeqCst)
    }

    pub fn last_settings(&self) -> Option<StreamSettings> {
        self.stats
            .last_settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn orientation(&self) -> Option<Orientation> {
        *self.stats.orientation.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CaptureDevice for SyntheticDevice {
    fn unique_id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.id
    }

    fn position(&self) -> DevicePosition {
        self.position
    }

    fn open(&self) -> Result<Box<dyn DeviceStream>, DeviceError> {
        if self.fail_open {
            return Err(DeviceError::Open {
                name: self.id.clone(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "device busy"),
            });
        }

        Ok(Box::new(SyntheticStream {
            device: self.id.clone(),
            formats: self.formats.clone(),
            fault: self.fault,
            frame_limit: self.frame_limit,
            pool_size: self.pool_size,
            stats: self.stats.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }))
    }
}

struct SyntheticStream {
    device: String,
    formats: Vec<PixelFormat>,
    fault: SampleFault,
    frame_limit: Option<u64>,
    pool_size: u64,
    stats: Arc<DeviceStats>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl DeviceStream for SyntheticStream {
    fn formats(&self) -> Vec<PixelFormat> {
        self.formats.clone()
    }

    fn start(&mut self, settings: &StreamSettings, sink: FrameSink) -> Result<(), DeviceError> {
        if self.worker.is_some() {
            return Err(DeviceError::AlreadyStreaming {
                name: self.device.clone(),
            });
        }
        if !self.formats.contains(&settings.format) {
            return Err(DeviceError::UnsupportedFormat {
                name: self.device.clone(),
                format: settings.format,
            });
        }

        *self.stats.last_settings.lock().unwrap_or_else(PoisonError::into_inner) = Some(settings.clone());
        *self.stats.orientation.lock().unwrap_or_else(PoisonError::into_inner) = settings.orientation;
        self.stats.streams_started.fetch_add(1, Ordering::SeqCst);
        self.stats.faulted.store(false, Ordering::SeqCst);

        let stop = Arc::new(AtomicBool::new(false));
        self.stop = stop.clone();

        let generator = Generator {
            format: settings.format,
            width: settings.width.max(2),
            height: settings.height.max(2),
            interval: Duration::from_secs_f64(1.0 / f64::from(settings.fps.max(1))),
            fault: self.fault,
            frame_limit: self.frame_limit,
            pool_size: self.pool_size,
            stats: self.stats.clone(),
        };

        let worker = thread::Builder::new()
            .name("camtex-synthetic".into())
            .spawn(move || generator.run(sink, stop))?;
        self.worker = Some(worker);

        info!(device = %self.device, ?settings, "synthetic stream started");
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        debug!(device = %self.device, "synthetic stream stopped");
    }

    fn set_orientation(&mut self, orientation: Option<Orientation>) {
        *self.stats.orientation.lock().unwrap_or_else(PoisonError::into_inner) = orientation;
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Generator {
    format: PixelFormat,
    width: u32,
    height: u32,
    interval: Duration,
    fault: SampleFault,
    frame_limit: Option<u64>,
    pool_size: u64,
    stats: Arc<DeviceStats>,
}

impl Generator {
    fn run(self, sink: FrameSink, stop: Arc<AtomicBool>) {
        let started = Instant::now();

        for sequence in 0u64.. {
            if stop.load(Ordering::SeqCst) || self.stats.faulted.load(Ordering::SeqCst) {
                break;
            }
            if self.frame_limit.is_some_and(|limit| sequence >= limit) {
                break;
            }

            let time = MediaTime::new(started.elapsed().as_nanos() as i64, TIMESCALE);
            let sample = self.sample(sequence, time);
            self.stats.frames_produced.fetch_add(1, Ordering::SeqCst);
            if sink.deliver(sample) == Delivery::Closed {
                break;
            }

            thread::sleep(self.interval);
        }
    }

    fn sample(&self, sequence: u64, time: MediaTime) -> Option<SampleBuffer> {
        let id = BufferId(sequence % self.pool_size);
        let image = match self.format {
            PixelFormat::Bgra32 => bgra_test_pattern(id, self.width, self.height, sequence),
            PixelFormat::Nv12 => nv12_test_pattern(id, self.width, self.height, sequence),
        };

        match self.fault {
            SampleFault::None => Some(SampleBuffer::new(Some(image), time, sequence)),
            SampleFault::MissingSample => None,
            SampleFault::MissingImage => Some(SampleBuffer::new(None, time, sequence)),
            SampleFault::InvalidTimestamp => Some(SampleBuffer::new(Some(image), MediaTime::INVALID, sequence)),
        }
    }
}

/// Packed BGRA frame with bars scrolling by `phase`
pub fn bgra_test_pattern(id: BufferId, width: u32, height: u32, phase: u64) -> PixelBuffer {
    let shift = (phase * 4) as usize;
    let (w, h) = (width as usize, height as usize);
    let mut data = Vec::with_capacity(w * h * 4);
    for y in 0..h {
        for x in 0..w {
            let v = (((x + shift) % w) * 255 / w) as u8;
            data.extend_from_slice(&[v, (y * 255 / h) as u8, 255 - v, 255]);
        }
    }
    PixelBuffer::packed(id, PixelFormat::Bgra32, width, height, width * 4, Bytes::from(data))
}

/// NV12 frame: scrolling luma bars over a chroma gradient
pub fn nv12_test_pattern(id: BufferId, width: u32, height: u32, phase: u64) -> PixelBuffer {
    let shift = (phase * 4) as usize;
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));

    let mut luma = Vec::with_capacity(w * h);
    for _ in 0..h {
        for x in 0..w {
            luma.push((((x + shift) % w) * 219 / w + 16) as u8);
        }
    }

    let mut chroma = Vec::with_capacity(cw * ch * 2);
    for y in 0..ch {
        for x in 0..cw {
            chroma.push((x * 255 / cw) as u8);
            chroma.push((y * 255 / ch) as u8);
        }
    }

    let planes = vec![
        Plane {
            data: Bytes::from(luma),
            width,
            height,
            bytes_per_row: width,
        },
        Plane {
            data: Bytes::from(chroma),
            width: cw as u32,
            height: ch as u32,
            bytes_per_row: (cw * 2) as u32,
        },
    ];
    PixelBuffer::planar(id, PixelFormat::Nv12, width, height, planes)
}
