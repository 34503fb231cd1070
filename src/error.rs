//! Error kinds surfaced to session delegates

use thiserror::Error;

/// Closed set of failures the camera session reports.
///
/// Streaming-lifecycle kinds force the session into [`SessionState::Error`];
/// conversion kinds are reported without touching the state.
///
/// [`SessionState::Error`]: crate::session::SessionState::Error
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraError {
    #[error("access to the capture hardware was denied")]
    NoHardwareAccess,

    #[error("no capture device matches the requested position")]
    RequestedHardwareNotFound,

    #[error("capture device could not be opened as an input")]
    InputDeviceNotAvailable,

    #[error("capture graph rejected the input device")]
    FailedToAddCaptureInputDevice,

    #[error("capture graph rejected the video data output")]
    FailedToAddCaptureOutput,

    #[error("capture hardware reported a runtime failure")]
    CaptureSessionRuntimeError,

    #[error("sample buffer is missing")]
    MissingSampleBuffer,

    #[error("sample buffer carries no image buffer")]
    FailedToGetImageBuffer,

    #[error("texture cache could not be created")]
    FailedToCreateTextureCache,

    #[error("texture cache could not produce a texture from the image")]
    FailedToCreateTextureFromImage,

    #[error("presentation timestamp is invalid")]
    FailedToRetrieveTimestamp,
}

impl CameraError {
    /// Whether this error ends the current streaming run.
    pub fn is_streaming_error(&self) -> bool {
        matches!(
            self,
            CameraError::NoHardwareAccess
                | CameraError::RequestedHardwareNotFound
                | CameraError::InputDeviceNotAvailable
                | CameraError::FailedToAddCaptureInputDevice
                | CameraError::FailedToAddCaptureOutput
                | CameraError::CaptureSessionRuntimeError
        )
    }
}

/// Transient failures of a single render tick. The tick is skipped and
/// the gate released; the next tick tries again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("texture {0:?} has no storage this backend can sample")]
    UnsupportedTexture(crate::gpu::TextureKey),

    #[error("render target lost: {0}")]
    TargetLost(String),
}

/// Configuration loading and parsing failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("unknown pixel layout `{0}` (expected `rgb` or `ycbcr`)")]
    UnknownLayout(String),

    #[error("unknown device position `{0}` (expected `front`, `back` or `unspecified`)")]
    UnknownPosition(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_errors_are_streaming_errors() {
        for err in [
            CameraError::NoHardwareAccess,
            CameraError::RequestedHardwareNotFound,
            CameraError::InputDeviceNotAvailable,
            CameraError::FailedToAddCaptureInputDevice,
            CameraError::FailedToAddCaptureOutput,
            CameraError::CaptureSessionRuntimeError,
        ] {
            assert!(err.is_streaming_error(), "{err:?}");
        }
    }

    #[test]
    fn conversion_errors_are_not_streaming_errors() {
        for err in [
            CameraError::MissingSampleBuffer,
            CameraError::FailedToGetImageBuffer,
            CameraError::FailedToCreateTextureCache,
            CameraError::FailedToCreateTextureFromImage,
            CameraError::FailedToRetrieveTimestamp,
        ] {
            assert!(!err.is_streaming_error(), "{err:?}");
        }
    }
}
