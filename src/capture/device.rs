//! Interfaces to the capture hardware

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::frame::{DevicePosition, Orientation, PixelFormat};
use super::graph::FrameSink;
use super::notify::NotificationCenter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Video,
}

/// Invoked once with the access decision, possibly on another thread
pub type AccessCallback = Box<dyn FnOnce(bool) + Send + 'static>;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device {name} cannot be opened: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("device {name} does not support {format:?}")]
    UnsupportedFormat { name: String, format: PixelFormat },

    #[error("device {name} is already streaming")]
    AlreadyStreaming { name: String },

    #[error("device stream failed: {0}")]
    Stream(#[from] std::io::Error),
}

/// Enumerates capture hardware and arbitrates OS-level permission
pub trait CaptureDeviceProvider: Send + Sync + 'static {
    fn find_device(&self, media: MediaType, position: DevicePosition) -> Option<Arc<dyn CaptureDevice>>;

    fn request_access(&self, media: MediaType, callback: AccessCallback);

    /// Where this provider's devices post runtime failures
    fn notifications(&self) -> &NotificationCenter;
}

pub trait CaptureDevice: Send + Sync + fmt::Debug {
    fn unique_id(&self) -> &str;

    fn name(&self) -> &str;

    fn position(&self) -> DevicePosition;

    /// Open the device as an input stream
    fn open(&self) -> Result<Box<dyn DeviceStream>, DeviceError>;
}

/// Parameters a stream is started with
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
    pub orientation: Option<Orientation>,
}

/// An opened device. Samples are pushed from a device-owned thread.
pub trait DeviceStream: Send {
    /// Formats the device can deliver; empty when it exposes no usable video format
    fn formats(&self) -> Vec<PixelFormat>;

    fn start(&mut self, settings: &StreamSettings, sink: FrameSink) -> Result<(), DeviceError>;

    /// Stop delivering and release the sink; a sample already handed to it
    /// is left alone
    fn stop(&mut self);

    fn set_orientation(&mut self, orientation: Option<Orientation>) {
        let _ = orientation;
    }
}
