//! camtex live camera preview

use std::path::PathBuf;
use std::sync::Arc;

use camtex::capture::{CaptureDeviceProvider, DevicePosition, PixelLayout, SyntheticProvider, V4l2Provider};
use camtex::display::{AppEvent, PreviewApp, PreviewDelegate};
use camtex::gpu::{GpuDevice, WgpuGpu};
use camtex::supervisor::{self, SupervisorExit};
use camtex::{CameraSession, Config, RenderSlot};
use clap::Parser;
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use winit::event_loop::EventLoop;

#[derive(Debug, Parser)]
#[command(name = "camtex", about = "Live camera preview on the GPU")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the built-in test pattern camera
    #[arg(long)]
    synthetic: bool,

    /// Pixel layout: rgb or ycbcr
    #[arg(long)]
    layout: Option<PixelLayout>,

    /// Camera position: front, back or unspecified
    #[arg(long)]
    position: Option<DevicePosition>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camtex=debug"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    registry.with(tracing_tracy::TracyLayer::default()).init();
    #[cfg(not(feature = "profiling"))]
    registry.init();
}

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if args.synthetic {
        config.capture.synthetic = true;
    }
    if let Some(layout) = args.layout {
        config.capture.layout = layout;
    }
    if let Some(position) = args.position {
        config.capture.position = position;
    }

    info!("camtex launching: {:?}", config);

    let provider: Arc<dyn CaptureDeviceProvider> = if config.capture.synthetic {
        Arc::new(SyntheticProvider::with_default_devices())
    } else {
        Arc::new(V4l2Provider::discover(config.capture.device_path.as_deref()))
    };

    let gpu = Arc::new(pollster::block_on(WgpuGpu::new())?);
    let slot = Arc::new(RenderSlot::new());

    let (events_tx, events_rx) = flume::unbounded();
    let delegate = Arc::new(PreviewDelegate::new(slot.clone(), events_tx));
    let session = CameraSession::new(
        config.capture.clone(),
        provider,
        Some(gpu.clone() as Arc<dyn GpuDevice>),
        delegate,
    )?;

    let event_loop = EventLoop::<AppEvent>::with_user_event().build()?;
    let proxy = event_loop.create_proxy();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;

    let control = session.control();
    let retry = config.retry.clone();
    runtime.spawn(async move {
        if let SupervisorExit::GaveUp { attempts } = supervisor::supervise(control, retry, events_rx).await {
            warn!("Capture could not be restarted after {} attempts", attempts);
        }
    });

    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            let _ = proxy.send_event(AppEvent::Shutdown);
        }
    });

    PreviewApp::new(config.display, gpu, slot, session).run(event_loop)?;

    runtime.shutdown_background();
    info!("camtex shutting down");
    Ok(())
}
