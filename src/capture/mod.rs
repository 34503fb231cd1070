pub mod device;
pub mod frame;
pub mod graph;
pub mod notify;
pub mod synthetic;
pub mod v4l2;

pub use device::{CaptureDevice, CaptureDeviceProvider, DeviceError, DeviceStream, MediaType, StreamSettings};
pub use frame::{DevicePosition, MediaTime, Orientation, PixelBuffer, PixelFormat, PixelLayout, SampleBuffer};
pub use graph::{CaptureGraph, VideoDataOutput};
pub use notify::{NotificationCenter, RuntimeFailure};
pub use synthetic::{AccessDecision, SampleFault, SyntheticDevice, SyntheticProvider};
pub use v4l2::V4l2Provider;
