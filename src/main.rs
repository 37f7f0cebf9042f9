//! xrdp-local
//!
//! Shows an xorgxrdp session in a local X11 window: frames from the X
//! server driver are drawn into an undecorated window spanning every local
//! monitor, and local keyboard and pointer input is forwarded back.

mod accel;
mod config;
mod dl;
mod input;
mod logging;
mod monitors;
mod render;
mod window;
mod x11_async;
mod xup;

use anyhow::{Context, Result};
use clap::Parser;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use xrdp_local_core::accel::AccelPipeline;
use xrdp_local_core::display::DisplayDescriptor;
use xrdp_local_core::input::ModuleMessage;
use xrdp_local_core::sink::DisplaySink;
use xrdp_local_core::worker::{ExitHandle, ProtocolModule, TransportWorker};

use accel::egl::EglBackend;
use config::{Config, Origin};
use render::{RenderHandle, RenderState};
use window::XWindow;
use x11_async::X11EventStream;
use xup::XupModule;
use xup::callbacks::CallbackContext;
use xup::ffi::ClientInfo;

#[derive(Parser, Debug)]
#[command(name = "xrdp-local", version, about)]
struct Args {
    /// Socket the xorgxrdp driver listens on
    socket_path: PathBuf,

    /// File descriptor that receives "connected" once the session is up
    feedback_fd: Option<RawFd>,

    /// Configuration file (default: ~/.config/xrdp-local/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use at most this many monitors (0 = all)
    #[arg(long)]
    max_displays: Option<usize>,

    /// Never use the accelerated buffer path
    #[arg(long)]
    no_accel: bool,
}

fn report_connected(fd: RawFd) {
    if fd < 0 {
        return;
    }
    let msg = b"connected\n";
    // SAFETY: the buffer is valid for its length; a bad fd only fails.
    let written = unsafe { libc::write(fd, msg.as_ptr().cast(), msg.len()) };
    if written < msg.len() as isize {
        warn!("Failed to write to feedback fd {}: {}", fd, std::io::Error::last_os_error());
    } else {
        debug!("Reported connection on fd {}", fd);
    }
}

/// Build the EGL backend if both sides can use accelerated buffers.
fn accel_pipeline(config: &Config, module_supported: bool, window: u32) -> Option<AccelPipeline<EglBackend>> {
    if !config.accel.enabled {
        info!("Accelerated path disabled by configuration");
        return None;
    }
    if !module_supported {
        return None;
    }
    let display_name = std::env::var("DISPLAY").unwrap_or_default();
    match EglBackend::new(&display_name, window) {
        Ok(backend) if backend.capability_supported(&display_name) => Some(AccelPipeline::new(backend)),
        Ok(_) => None,
        Err(e) => {
            warn!("EGL backend unavailable: {}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, origin) = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(n) = args.max_displays {
        config.display.max_displays = n;
    }
    if args.no_accel {
        config.accel.enabled = false;
    }
    logging::init(&config.logging)?;

    info!("Starting xrdp-local {}", env!("CARGO_PKG_VERSION"));
    match &origin {
        Origin::File(path) => info!("Loaded configuration from {:?}", path),
        Origin::Generated(path) => info!("Created default configuration at {:?}", path),
        Origin::Defaults(path, reason) => warn!("Using default configuration, could not write {:?}: {}", path, reason),
    }

    // Local display
    let (conn, screen_num) = x11rb::connect(None).context("Failed to connect to X server")?;
    let conn = Arc::new(conn);
    let screen = conn
        .setup()
        .roots
        .get(screen_num)
        .cloned()
        .context("X server reported no screens")?;

    let monitors = monitors::discover(conn.as_ref(), &screen)?;
    let display =
        DisplayDescriptor::build(&monitors, config.display.max_displays).context("No displays found")?;
    let (session_width, session_height) = (display.session_width, display.session_height);
    let (monitor_count, frame_interval_ms) = (display.monitors.len(), display.frame_interval_ms);
    info!(
        "Session {}x{} over {} monitor(s), frame interval {}ms",
        session_width, session_height, monitor_count, frame_interval_ms
    );

    let window = XWindow::create(conn.clone(), &screen, display.session_width, display.session_height)?;
    let window_id = window.id();
    let sink = DisplaySink::new(display.session_width, display.session_height, window);

    // Protocol module
    let (render, tasks) = RenderHandle::channel();
    let mut module = XupModule::load(&config.module.path)?;
    module.install(CallbackContext {
        render: render.clone(),
        transfer: config.frames.transfer,
        session_size: (display.session_width, display.session_height),
    });
    let (width, height) = display.primary_size();
    module.start(width, height)?;
    let client_info = ClientInfo::new(&display);
    module.set_client_info(&client_info)?;
    module.set_port(&args.socket_path)?;
    module.connect()?;
    module
        .send_event(&ModuleMessage::keyboard_sync())
        .context("Failed to send keyboard sync")?;
    if let Some(fd) = args.feedback_fd {
        report_connected(fd);
    }
    let capability = module.capability(config.accel.capability);
    info!("Protocol module {:?} ready", module.path());

    let module = Arc::new(Mutex::new(module));
    let exit: Arc<dyn ExitHandle> = Arc::new(render.clone());
    let mut worker = TransportWorker::spawn(module.clone(), exit, config.transport.poll_interval())
        .context("Failed to start transport worker")?;
    let input = worker.input();

    let accel = accel_pipeline(&config, capability.supported, window_id);
    if accel.is_some() {
        input.request_accel();
    }

    let mut state = RenderState::new(sink, accel);
    let stream = X11EventStream::new(conn.clone())?;
    let result = state.run(tasks, stream, input).await;

    // Pending render tasks are gone, so the worker cannot be blocked on us.
    worker.stop();
    drop(module);
    drop(state);
    info!("xrdp-local stopped");
    result
}
