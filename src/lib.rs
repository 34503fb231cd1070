pub mod capture;
pub mod convert;
pub mod display;
pub mod error;
pub mod gpu;
pub mod render;
pub mod session;
pub mod supervisor;

use std::path::Path;

use serde::{Deserialize, Serialize};

use capture::frame::{DevicePosition, Orientation, PixelLayout};
use error::ConfigError;

pub use convert::{ConvertedFrame, FrameConverter};
pub use error::CameraError;
pub use render::{RenderSlot, Renderer};
pub use session::{CameraSession, SessionControl, SessionDelegate, SessionEvent, SessionState};

/// Prefix of environment overrides, e.g. `CAMTEX__CAPTURE__FPS=60`
pub const ENV_PREFIX: &str = "CAMTEX";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// V4L2 node to open; the first capture-capable node when unset
    pub device_path: Option<String>,
    pub position: DevicePosition,
    pub layout: PixelLayout,
    pub orientation: Option<Orientation>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
    pub texture_cache_capacity: usize,
    pub synthetic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}

/// Restart policy applied after a capture runtime failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub backoff_ms: u64,
    pub max_attempts: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_path: None,
            position: DevicePosition::Unspecified,
            layout: PixelLayout::Rgb,
            orientation: None,
            width: 640,
            height: 480,
            fps: 30,
            buffer_count: 4,
            // Pool buffers plus headroom for textures held by the renderer
            texture_cache_capacity: 8,
            synthetic: false,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            vsync: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backoff_ms: 500,
            max_attempts: 5,
        }
    }
}

impl Config {
    /// Defaults, overlaid by the TOML file at `path` (when given), overlaid
    /// by `CAMTEX__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Defaults overlaid by TOML source text
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_only_named_keys() {
        let config = Config::from_toml(
            r#"
            [capture]
            layout = "ycbcr"
            position = "back"
            fps = 60

            [retry]
            max_attempts = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.capture.layout, PixelLayout::YCbCr);
        assert_eq!(config.capture.position, DevicePosition::Back);
        assert_eq!(config.capture.fps, 60);
        assert_eq!(config.capture.width, CaptureConfig::default().width);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.display, DisplayConfig::default());
    }

    #[test]
    fn empty_source_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn bad_value_is_reported() {
        let err = Config::from_toml("[capture]\nlayout = \"cmyk\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
