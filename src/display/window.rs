//! winit preview window: the display surface that drives render ticks

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, instrument, warn};
use wgpu::{CompositeAlphaMode, PresentMode, Surface, SurfaceConfiguration, SurfaceError, TextureUsages};
use winit::application::ApplicationHandler;
use winit::dpi::{LogicalSize, PhysicalSize};
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::gpu::WgpuGpu;
use crate::render::{RenderSlot, Renderer, TickOutcome, WgpuBackend};
use crate::session::CameraSession;
use crate::DisplayConfig;

/// Events injected into the window loop from other threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
    Shutdown,
}

struct PreviewView {
    window: Arc<Window>,
    surface: Surface<'static>,
    surface_config: SurfaceConfiguration,
    renderer: Renderer<WgpuBackend>,
}

/// Application handler for the winit event loop
pub struct PreviewApp {
    config: DisplayConfig,
    gpu: Arc<WgpuGpu>,
    slot: Arc<RenderSlot>,
    session: Option<CameraSession>,
    view: Option<PreviewView>,
}

impl PreviewApp {
    pub fn new(config: DisplayConfig, gpu: Arc<WgpuGpu>, slot: Arc<RenderSlot>, session: CameraSession) -> Self {
        Self {
            config,
            gpu,
            slot,
            session: Some(session),
            view: None,
        }
    }

    /// Start the session and run the event loop until the window closes
    pub fn run(mut self, event_loop: EventLoop<AppEvent>) -> Result<()> {
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(session) = self.session.as_ref() {
            session.start();
        }
        event_loop.run_app(&mut self)?;
        Ok(())
    }

    #[instrument(skip(self, event_loop))]
    fn create_view(&self, event_loop: &ActiveEventLoop) -> Result<PreviewView> {
        info!("Initializing preview window");

        let window = Arc::new(
            event_loop.create_window(
                Window::default_attributes()
                    .with_title("camtex")
                    .with_inner_size(LogicalSize::new(self.config.width, self.config.height)),
            )?,
        );

        let surface = self.gpu.instance.create_surface(window.clone())?;
        let caps = surface.get_capabilities(&self.gpu.adapter);

        // Camera pixels are already gamma encoded
        let format = caps
            .formats
            .iter()
            .find(|f| !f.is_srgb())
            .or_else(|| caps.formats.first())
            .copied()
            .ok_or_else(|| eyre!("Surface is not supported by the GPU adapter"))?;

        let size = window.inner_size();
        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: if self.config.vsync {
                PresentMode::AutoVsync
            } else {
                PresentMode::AutoNoVsync
            },
            alpha_mode: caps.alpha_modes.first().copied().unwrap_or(CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 1,
        };
        surface.configure(&self.gpu.device, &surface_config);

        let renderer = Renderer::new(self.slot.clone(), WgpuBackend::new(&self.gpu, format));

        Ok(PreviewView {
            window,
            surface,
            surface_config,
            renderer,
        })
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        let Some(view) = self.view.as_mut() else {
            return;
        };
        if size.width == 0 || size.height == 0 {
            return;
        }

        view.surface_config.width = size.width;
        view.surface_config.height = size.height;
        view.surface.configure(&self.gpu.device, &view.surface_config);
    }

    fn redraw(&mut self) {
        let Some(view) = self.view.as_mut() else {
            return;
        };
        let device = &self.gpu.device;
        let PreviewView {
            surface,
            surface_config,
            renderer,
            ..
        } = view;

        let outcome = renderer.draw(|| match surface.get_current_texture() {
            Ok(frame) => Some(frame),
            Err(SurfaceError::Outdated | SurfaceError::Lost) => {
                surface.configure(device, surface_config);
                None
            }
            Err(SurfaceError::Timeout) => None,
            Err(e) => {
                warn!("Surface error: {}", e);
                None
            }
        });

        if outcome == TickOutcome::Failed {
            error!("Render tick failed");
        }
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(session) = self.session.take() {
            info!("Stopping camera session");
            session.stop();
        }
        event_loop.exit();
    }
}

impl ApplicationHandler<AppEvent> for PreviewApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.view.is_some() {
            return;
        }

        match self.create_view(event_loop) {
            Ok(view) => self.view = Some(view),
            Err(e) => {
                error!("Failed to create preview window: {:?}", e);
                self.shutdown(event_loop);
            }
        }
    }

    fn user_event(&mut self, event_loop: &ActiveEventLoop, event: AppEvent) {
        match event {
            AppEvent::Shutdown => self.shutdown(event_loop),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Window close requested");
                self.shutdown(event_loop);
            }
            WindowEvent::Resized(size) => self.resize(size),
            WindowEvent::RedrawRequested => self.redraw(),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(view) = self.view.as_ref() {
            view.window.request_redraw();
        }
    }
}
