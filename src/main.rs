//! Vision-stream binary: acquire frames from a camera until interrupted.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vision_stream::mock::{MockCamera, MockTransport, TestPattern};
use vision_stream::session::normalize_serial;
use vision_stream::{
    run_session, FrameSink, Library, LogSink, PixelFormat, PpmSink, SessionConfig, StopSignal,
    TargetFormat, UpdatePolicy,
};

/// Command-line arguments.
///
/// Every option can also be set through the environment variable named next
/// to it, so the binary can run unchanged under a launcher or a container.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial number of the camera to open (a leading `_` is ignored)
    #[arg(short, long, env = "SERIAL_NO")]
    serial_no: Option<String>,

    /// Acquisition frame rate in frames per second
    #[arg(short, long, env = "FPS", default_value_t = 30.0)]
    fps: f64,

    /// Producer directory to register (sysfs video4linux class directory)
    #[arg(short, long, env = "PRODUCER")]
    producer: Option<PathBuf>,

    /// Finished-buffer wait timeout in milliseconds
    #[arg(long, env = "TIMEOUT_MS", default_value_t = 5000)]
    timeout_ms: u64,

    /// Command acknowledgement timeout in milliseconds
    #[arg(long, env = "COMMAND_TIMEOUT_MS", default_value_t = 1000)]
    command_timeout_ms: u64,

    /// Output pixel layout (bgr8, bgra8, rgb8)
    #[arg(short, long, env = "ENCODING", default_value_t = TargetFormat::Bgr8)]
    encoding: TargetFormat,

    /// Buffers to allocate beyond the stream's minimum
    #[arg(long, env = "EXTRA_BUFFERS", default_value_t = 0)]
    extra_buffers: usize,

    /// Stop after this many frames
    #[arg(long, env = "MAX_FRAMES")]
    max_frames: Option<u64>,

    /// Write frames as PPM files into this directory instead of logging them
    #[arg(long, env = "PPM_DIR")]
    ppm_dir: Option<PathBuf>,

    /// Keep one frame in this many when writing PPM files
    #[arg(long, env = "EVERY", default_value_t = 30)]
    every: u64,

    /// Use a simulated camera instead of hardware
    #[arg(long, env = "MOCK")]
    mock: bool,

    /// Raw pixel format of the simulated camera
    #[arg(long, default_value_t = PixelFormat::Yuv422, requires = "mock")]
    mock_format: PixelFormat,

    /// Enable debug logging
    #[arg(short, long, env = "VERBOSE")]
    verbose: bool,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            serial_number: self.serial_no.as_deref().and_then(normalize_serial),
            frame_rate: self.fps,
            wait_timeout: Duration::from_millis(self.timeout_ms),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            target_format: self.encoding,
            extra_buffers: self.extra_buffers,
            max_frames: self.max_frames,
            ..SessionConfig::default()
        }
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(err) = run(&args) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .init();
}

fn run(args: &Args) -> vision_stream::Result<()> {
    let config = args.session_config();
    config.validate()?;

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        info!("interrupt received, stopping");
        handler_stop.request_stop();
    }) {
        warn!(%err, "Ctrl-C handler not installed");
    }

    let library = Library::initialize()?;
    let mut manager = library.device_manager();
    let policy = if args.mock {
        manager.add_transport(Box::new(MockTransport::new(vec![MockCamera::new("MOCK0001")
            .with_format(640, 480, args.mock_format)
            .with_pattern(TestPattern::ColorBars)])));
        UpdatePolicy::RegisteredOnly
    } else if let Some(producer) = &args.producer {
        manager.add_producer_library(producer)?;
        UpdatePolicy::RegisteredOnly
    } else {
        UpdatePolicy::ScanEnvironmentForProducerLibraries
    };
    manager.update(policy)?;

    let mut sink: Box<dyn FrameSink> = match &args.ppm_dir {
        Some(dir) => Box::new(PpmSink::new(dir.clone(), args.every)?),
        None => Box::new(LogSink::default()),
    };

    let stats = run_session(&mut manager, &config, sink.as_mut(), &stop)?;
    info!(
        delivered = stats.delivered,
        timeouts = stats.timeouts,
        dropped = stats.dropped,
        "done"
    );
    Ok(())
}
