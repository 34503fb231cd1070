//! Camera session: the lifecycle state machine that drives the capture graph.
//!
//! All state lives on a dedicated session thread. Public calls, access
//! decisions, runtime failures and per-frame errors are turned into
//! commands and processed there one at a time, so state never races
//! with itself. Frames are converted and delivered on the capture queue
//! and never pass through the session thread.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use tracing::{debug, error, info, instrument, warn};

use crate::capture::device::{CaptureDeviceProvider, MediaType, StreamSettings};
use crate::capture::frame::{DevicePosition, Orientation, PixelLayout};
use crate::capture::graph::{CaptureGraph, CaptureInput, SampleHandler, VideoDataOutput};
use crate::capture::notify::{RuntimeFailure, Subscription};
use crate::convert::FrameConverter;
use crate::error::CameraError;
use crate::gpu::{GpuDevice, Texture, TextureCache};
use crate::CaptureConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Created, hardware access not yet confirmed
    Waiting,
    /// Hardware access confirmed, not streaming
    Ready,
    Streaming,
    /// Halted by `stop()`, resumable
    Stopped,
    /// Halted by a streaming error, recoverable with `start()`
    Error,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Waiting,
            1 => SessionState::Ready,
            2 => SessionState::Streaming,
            3 => SessionState::Stopped,
            _ => SessionState::Error,
        }
    }
}

/// Consumer of a session's output
pub trait SessionDelegate: Send + Sync + 'static {
    /// Called on the capture queue with 1 (RGB) or 2 (luma, chroma)
    /// textures. The textures may be kept; the sample they came from is not.
    fn on_frame(&self, textures: &[Texture], timestamp: f64);

    /// Called on the session thread after every transition, and with the
    /// resulting state whenever an error is raised.
    fn on_state_changed(&self, state: SessionState, error: Option<CameraError>);
}

/// A state notification, for delegates that forward them elsewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEvent {
    pub state: SessionState,
    pub error: Option<CameraError>,
}

#[derive(Debug)]
enum Command {
    Start,
    AccessResolved(bool),
    Configure,
    Stop,
    RuntimeFailure(RuntimeFailure),
    FrameFailed(CameraError),
    SetOrientation(Option<Orientation>),
    Shutdown,
}

/// Cloneable control surface of a [`CameraSession`]. Safe to use from any
/// thread, including from inside delegate callbacks.
#[derive(Clone)]
pub struct SessionControl {
    commands: Sender<Command>,
    provider: Arc<dyn CaptureDeviceProvider>,
}

impl SessionControl {
    /// Request hardware access and, in parallel, configure and start capture
    pub fn start(&self) {
        // Queued ahead of the request so an immediate answer lands after it
        self.send(Command::Start);

        let commands = self.commands.clone();
        self.provider.request_access(
            MediaType::Video,
            Box::new(move |granted| {
                let _ = commands.send(Command::AccessResolved(granted));
            }),
        );

        self.send(Command::Configure);
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn set_orientation(&self, orientation: Option<Orientation>) {
        self.send(Command::SetOrientation(orientation));
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.commands.send(command) {
            debug!(command = ?e.into_inner(), "session already shut down");
        }
    }
}

/// Long-lived owner of one camera pipeline
pub struct CameraSession {
    control: SessionControl,
    state: Arc<AtomicU8>,
    layout: PixelLayout,
    position: DevicePosition,
    worker: Option<JoinHandle<()>>,
    _runtime_failures: Subscription,
}

impl CameraSession {
    pub fn new(
        config: CaptureConfig,
        provider: Arc<dyn CaptureDeviceProvider>,
        gpu: Option<Arc<dyn GpuDevice>>,
        delegate: Arc<dyn SessionDelegate>,
    ) -> std::io::Result<Self> {
        let (commands, inbox) = flume::unbounded();
        let state = Arc::new(AtomicU8::new(SessionState::Waiting as u8));

        let runtime_failures = {
            let commands = commands.clone();
            provider.notifications().subscribe(move |failure| {
                let _ = commands.send(Command::RuntimeFailure(failure.clone()));
            })
        };

        let layout = config.layout;
        let position = config.position;
        let core = SessionCore {
            orientation: config.orientation,
            config,
            state: SessionState::Waiting,
            shared_state: state.clone(),
            access: Access::Pending,
            provider: provider.clone(),
            gpu,
            delegate,
            graph: CaptureGraph::new(),
            cache: None,
            commands: commands.clone(),
        };

        let worker = thread::Builder::new()
            .name("camtex-session".into())
            .spawn(move || core.run(inbox))?;

        info!(?layout, ?position, "camera session created");
        Ok(Self {
            control: SessionControl { commands, provider },
            state,
            layout,
            position,
            worker: Some(worker),
            _runtime_failures: runtime_failures,
        })
    }

    pub fn start(&self) {
        self.control.start();
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn set_orientation(&self, orientation: Option<Orientation>) {
        self.control.set_orientation(orientation);
    }

    /// Most recent state written by the session thread
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn position(&self) -> DevicePosition {
        self.position
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.control.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                error!("session thread panicked");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Pending,
    Granted,
    Denied,
}

struct SessionCore {
    config: CaptureConfig,
    orientation: Option<Orientation>,
    state: SessionState,
    shared_state: Arc<AtomicU8>,
    access: Access,
    provider: Arc<dyn CaptureDeviceProvider>,
    gpu: Option<Arc<dyn GpuDevice>>,
    delegate: Arc<dyn SessionDelegate>,
    graph: CaptureGraph,
    cache: Option<Arc<dyn TextureCache>>,
    commands: Sender<Command>,
}

impl SessionCore {
    fn run(mut self, inbox: Receiver<Command>) {
        debug!("session thread started");
        for command in inbox.iter() {
            match command {
                Command::Start => self.access = Access::Pending,
                Command::AccessResolved(granted) => self.access_resolved(granted),
                Command::Configure => self.configure(),
                Command::Stop => {
                    self.halt_capture();
                    self.set_state(SessionState::Stopped);
                }
                Command::RuntimeFailure(failure) => self.runtime_failure(failure),
                Command::FrameFailed(error) => self.handle_error(error),
                Command::SetOrientation(orientation) => {
                    self.orientation = orientation;
                    self.graph.set_orientation(orientation);
                }
                Command::Shutdown => break,
            }
        }

        self.halt_capture();
        info!("camera session shut down");
    }

    fn access_resolved(&mut self, granted: bool) {
        if granted {
            self.access = Access::Granted;
            if !matches!(self.state, SessionState::Streaming | SessionState::Error) {
                self.set_state(SessionState::Ready);
            }
            return;
        }

        self.access = Access::Denied;
        if self.graph.is_running() {
            self.halt_capture();
        }
        self.handle_error(CameraError::NoHardwareAccess);
    }

    fn configure(&mut self) {
        if self.access == Access::Denied {
            debug!("hardware access denied, skipping capture configuration");
            return;
        }

        match self.configure_pipeline() {
            Ok(()) => self.set_state(SessionState::Streaming),
            Err(error) => self.handle_error(error),
        }
    }

    #[instrument(skip(self), fields(layout = ?self.config.layout, position = ?self.config.position))]
    fn configure_pipeline(&mut self) -> Result<(), CameraError> {
        self.graph.begin_configuration();
        let attached = self.attach_input_and_output();
        self.graph.commit_configuration();
        attached?;

        let cache = self.initialize_texture_cache()?;
        let handler = self.sample_handler(cache.clone());
        let settings = self.stream_settings();
        self.graph
            .start_running(&settings, handler)
            .map_err(|e| {
                error!(error = %e, "capture stream failed to start");
                CameraError::CaptureSessionRuntimeError
            })?;

        self.cache = Some(cache);
        Ok(())
    }

    fn attach_input_and_output(&mut self) -> Result<(), CameraError> {
        let device = self
            .provider
            .find_device(MediaType::Video, self.config.position)
            .ok_or(CameraError::RequestedHardwareNotFound)?;

        let stream = device.open().map_err(|e| {
            warn!(device = device.name(), error = %e, "capture device unavailable");
            CameraError::InputDeviceNotAvailable
        })?;

        self.graph
            .add_input(CaptureInput::new(device.clone(), stream))
            .map_err(|_| CameraError::FailedToAddCaptureInputDevice)?;

        let output = VideoDataOutput::new(self.config.layout.native_format());
        self.graph
            .add_output(output)
            .map_err(|_| CameraError::FailedToAddCaptureOutput)?;

        debug!(device = device.name(), "capture input and output attached");
        Ok(())
    }

    fn initialize_texture_cache(&mut self) -> Result<Arc<dyn TextureCache>, CameraError> {
        if let Some(previous) = self.cache.take() {
            previous.flush();
        }

        let Some(gpu) = self.gpu.as_ref() else {
            warn!("no GPU device bound to the session");
            return Err(CameraError::FailedToCreateTextureCache);
        };

        gpu.create_texture_cache(self.config.texture_cache_capacity)
            .map_err(|e| {
                warn!(gpu = gpu.name(), error = %e, "texture cache unavailable");
                CameraError::FailedToCreateTextureCache
            })
    }

    fn sample_handler(&self, cache: Arc<dyn TextureCache>) -> SampleHandler {
        let converter = FrameConverter::new(self.config.layout, cache);
        let delegate = self.delegate.clone();
        let commands = self.commands.clone();

        Box::new(move |sample| match converter.convert(sample.as_ref()) {
            Ok(frame) => {
                metrics::counter!("camtex_frames_delivered_total").increment(1);
                delegate.on_frame(&frame.textures, frame.timestamp);
            }
            Err(error) => {
                metrics::counter!("camtex_conversion_errors_total").increment(1);
                let _ = commands.send(Command::FrameFailed(error));
            }
        })
    }

    fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            format: self.config.layout.native_format(),
            width: self.config.width,
            height: self.config.height,
            fps: self.config.fps,
            buffer_count: self.config.buffer_count,
            orientation: self.orientation,
        }
    }

    fn runtime_failure(&mut self, failure: RuntimeFailure) {
        if self.state != SessionState::Streaming {
            debug!(?failure, state = ?self.state, "runtime failure ignored outside streaming");
            return;
        }
        if self.graph.device_id().is_some_and(|id| id != failure.device) {
            debug!(?failure, "runtime failure from another device ignored");
            return;
        }

        error!(device = %failure.device, reason = %failure.reason, "capture runtime failure");
        self.halt_capture();
        self.handle_error(CameraError::CaptureSessionRuntimeError);
    }

    fn halt_capture(&mut self) {
        self.graph.stop_running();
        if let Some(cache) = self.cache.take() {
            cache.flush();
        }
    }

    fn set_state(&mut self, state: SessionState) {
        debug!(from = ?self.state, to = ?state, "session state");
        self.store_state(state);
        if state != SessionState::Error {
            self.delegate.on_state_changed(state, None);
        }
    }

    fn handle_error(&mut self, error: CameraError) {
        if error.is_streaming_error() {
            warn!(%error, "streaming error");
            self.store_state(SessionState::Error);
        } else {
            debug!(%error, "frame error");
        }
        self.delegate.on_state_changed(self.state, Some(error));
    }

    fn store_state(&mut self, state: SessionState) {
        self.state = state;
        self.shared_state.store(state as u8, Ordering::Release);
    }
}
