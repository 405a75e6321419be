//! One acquisition session: select a device, stream until told to stop, and
//! tear everything down in order.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::convert::{convert, required_size, Frame, RawImage, TargetFormat};
use crate::error::{CameraError, Result};
use crate::handle::{DeviceHandle, DEFAULT_COMMAND_TIMEOUT};
use crate::manager::{DeviceManager, UpdatePolicy};
use crate::pool::BufferPool;
use crate::sink::FrameSink;
use crate::stream::{AcquisitionStream, FlushMode, StreamState, DEFAULT_WAIT_TIMEOUT};
use crate::traits::{AccessMode, AcquisitionStopMode, DeviceInfo};

/// Session settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Serial number of the device to open; `None` opens the first one.
    pub serial_number: Option<String>,
    /// Target frame rate in frames per second.
    pub frame_rate: f64,
    /// Bound on each finished-buffer wait.
    pub wait_timeout: Duration,
    /// Bound on command acknowledgement.
    pub command_timeout: Duration,
    /// Layout handed to the sink.
    pub target_format: TargetFormat,
    /// Buffers allocated beyond the stream's minimum.
    pub extra_buffers: usize,
    /// Data channel to open.
    pub stream_channel: usize,
    /// Stop after this many delivered frames.
    pub max_frames: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            serial_number: None,
            frame_rate: 30.0,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            target_format: TargetFormat::Bgr8,
            extra_buffers: 0,
            stream_channel: 0,
            max_frames: None,
        }
    }
}

impl SessionConfig {
    /// Reject settings no device could honor.
    pub fn validate(&self) -> Result<()> {
        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 {
            return Err(invalid("frame_rate", &self.frame_rate.to_string(), "must be a positive number"));
        }
        if self.wait_timeout.is_zero() {
            return Err(invalid("wait_timeout", "0ms", "must be positive"));
        }
        if self.command_timeout.is_zero() {
            return Err(invalid("command_timeout", "0ms", "must be positive"));
        }
        if self.max_frames == Some(0) {
            return Err(invalid("max_frames", "0", "must be positive when set"));
        }
        Ok(())
    }
}

fn invalid(name: &str, value: &str, reason: &str) -> CameraError {
    CameraError::ParameterRange {
        name: name.to_owned(),
        value: value.to_owned(),
        reason: reason.to_owned(),
    }
}

/// Normalize a serial number given on the command line or in the
/// environment. A leading `_` keeps all-digit serials from being read as
/// numbers by launch tooling and is stripped.
pub fn normalize_serial(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let serial = trimmed.strip_prefix('_').unwrap_or(trimmed);
    (!serial.is_empty()).then(|| serial.to_owned())
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames handed to the sink.
    pub delivered: u64,
    /// Waits that timed out.
    pub timeouts: u64,
    /// Frames that could not be converted.
    pub dropped: u64,
    /// Frames the sink rejected.
    pub sink_failures: u64,
}

/// Cooperative stop flag, checked once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// A flag that has not been raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the session to stop after the current iteration.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Outcome of matching a serial number against discovered devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelection {
    /// Index to open.
    pub index: usize,
    /// Whether the requested serial number matched.
    pub matched: bool,
    /// Human-readable list of every device.
    pub listing: String,
}

/// Pick the device to open and describe every candidate.
///
/// The first device whose serial number matches wins. Without a serial
/// number, or without a match, index 0 is selected.
pub fn select_device(devices: &[DeviceInfo], serial_number: Option<&str>) -> DeviceSelection {
    let mut listing = String::from("Devices available:\n");
    let mut selected = None;
    for (index, device) in devices.iter().enumerate() {
        let _ = writeln!(
            listing,
            "{index}: {} ({}; {} v.{})\nS/N: {}",
            device.model_name,
            device.interface.display_name,
            device.system.display_name,
            device.system.version,
            device.serial_number
        );
        if selected.is_none() && serial_number == Some(device.serial_number.as_str()) {
            selected = Some(index);
        }
    }
    DeviceSelection {
        index: selected.unwrap_or(0),
        matched: selected.is_some(),
        listing,
    }
}

/// Open the selected device and stream frames into `sink` until `stop` is
/// raised, `max_frames` are delivered, or a fatal error occurs.
///
/// Timeouts, conversion failures and sink failures are counted and the loop
/// continues. Teardown runs on every path.
pub fn run_session(
    manager: &mut DeviceManager<'_>,
    config: &SessionConfig,
    sink: &mut dyn FrameSink,
    stop: &StopSignal,
) -> Result<SessionStats> {
    config.validate()?;
    if manager.device_count() == 0 {
        manager.update(UpdatePolicy::RegisteredOnly)?;
    }
    let devices = manager.devices();
    if devices.is_empty() {
        return Err(CameraError::DeviceUnavailable("no devices discovered".to_owned()));
    }

    let selection = select_device(&devices, config.serial_number.as_deref());
    info!("{}", selection.listing.trim_end());
    if let (Some(serial), false) = (&config.serial_number, selection.matched) {
        warn!(%serial, "no device with this serial number, using device 0");
    }
    info!(device = selection.index, "publishing from device");

    let mut device = manager.open_device(selection.index, AccessMode::Control)?;
    device.set_command_timeout(config.command_timeout);
    let result = acquire(&mut device, config, sink, stop);
    device.close();

    match &result {
        Ok(stats) => info!(
            delivered = stats.delivered,
            timeouts = stats.timeouts,
            dropped = stats.dropped,
            sink_failures = stats.sink_failures,
            "session finished"
        ),
        Err(err) => error!(%err, "session failed"),
    }
    result
}

fn acquire(
    device: &mut DeviceHandle<'_>,
    config: &SessionConfig,
    sink: &mut dyn FrameSink,
    stop: &StopSignal,
) -> Result<SessionStats> {
    let payload_size = device.payload_size()?;
    let mut stream = device.open_stream(config.stream_channel)?;

    let result = prepare(device, &mut stream, config, payload_size)
        .and_then(|()| stream_frames(device, &mut stream, config, sink, stop));
    let teardown = teardown(device, &mut stream);

    match (result, teardown) {
        (Ok(stats), Ok(())) => Ok(stats),
        (Ok(_), Err(err)) | (Err(err), _) => Err(err),
    }
}

fn prepare(
    device: &mut DeviceHandle<'_>,
    stream: &mut AcquisitionStream<'_>,
    config: &SessionConfig,
    payload_size: usize,
) -> Result<()> {
    let count = stream.min_buffers_required().max(1) + config.extra_buffers;
    stream.attach_pool(BufferPool::allocate_for_payload(count, payload_size, payload_size)?)?;
    stream.announce_all()?;
    stream.queue_all_announced()?;

    device.set_enum("TriggerSelector", "ExposureStart")?;
    device.set_enum("TriggerMode", "Off")?;
    device.set_float("AcquisitionFrameRate", config.frame_rate)?;
    debug!(fps = config.frame_rate, "free-running acquisition configured");
    Ok(())
}

fn stream_frames(
    device: &mut DeviceHandle<'_>,
    stream: &mut AcquisitionStream<'_>,
    config: &SessionConfig,
    sink: &mut dyn FrameSink,
    stop: &StopSignal,
) -> Result<SessionStats> {
    stream.start_acquisition()?;
    device
        .execute_command_and_wait("AcquisitionStart")
        .map_err(|err| CameraError::AcquisitionStart(err.to_string()))?;

    let (width, height) = device.frame_geometry()?;
    let mut out = vec![0u8; required_size(width, height, config.target_format).unwrap_or_default()];
    let mut stats = SessionStats::default();

    while !stop.is_stop_requested() {
        if config.max_frames.is_some_and(|max| stats.delivered >= max) {
            debug!(delivered = stats.delivered, "frame limit reached");
            break;
        }

        let buffer = match stream.wait_for_finished_buffer(config.wait_timeout) {
            Ok(buffer) => buffer,
            Err(err) if err.is_recoverable() => {
                stats.timeouts += 1;
                warn!(%err, "no frame this iteration");
                continue;
            }
            Err(err) => return Err(err),
        };

        let converted = stream
            .raw_image(&buffer)
            .and_then(|raw| convert_into(&raw, config.target_format, &mut out));
        stream.queue_buffer(buffer)?;

        match converted {
            Ok(frame) => match sink.deliver(&frame) {
                Ok(()) => stats.delivered += 1,
                Err(err) if err.is_recoverable() => {
                    stats.sink_failures += 1;
                    warn!(sequence = frame.sequence, %err, "sink rejected frame");
                }
                Err(err) => return Err(err),
            },
            Err(err) if err.is_recoverable() => {
                stats.dropped += 1;
                warn!(%err, "frame dropped");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(stats)
}

fn convert_into<'o>(
    raw: &RawImage<'_>,
    target: TargetFormat,
    out: &'o mut Vec<u8>,
) -> Result<Frame<'o>> {
    let needed = required_size(raw.width, raw.height, target).ok_or_else(|| {
        CameraError::Conversion(format!("{}x{} frame is too large", raw.width, raw.height))
    })?;
    if out.len() < needed {
        out.resize(needed, 0);
    }
    convert(raw, target, out)
}

/// Stop, flush, revoke and close, continuing past failures. Returns the
/// first failure that is not a warning.
fn teardown(device: &mut DeviceHandle<'_>, stream: &mut AcquisitionStream<'_>) -> Result<()> {
    let mut first_error = None;
    if stream.state() == StreamState::Acquiring {
        if let Err(err) = stream.stop_acquisition(AcquisitionStopMode::Default) {
            warn!(%err, "stopping the stream failed");
            first_error.get_or_insert(err);
        }
    }
    if let Err(err) = device.execute_command_and_wait("AcquisitionStop") {
        warn!(%err, "AcquisitionStop failed, continuing teardown");
    }
    if let Err(err) = stream.flush(FlushMode::DiscardAll) {
        warn!(%err, "flush failed");
        first_error.get_or_insert(err);
    }
    match stream.revoke_all() {
        Ok(revoked) => debug!(revoked, "buffers revoked"),
        Err(err) => {
            warn!(%err, "revoke failed");
            first_error.get_or_insert(err);
        }
    }
    if let Err(err) = stream.close() {
        first_error.get_or_insert(err);
    }
    first_error.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::manager::Library;
    use crate::mock::{MockCamera, MockEvent, MockTransport};
    use crate::traits::{InterfaceInfo, SystemInfo};

    fn device(serial: &str, model: &str) -> DeviceInfo {
        DeviceInfo {
            serial_number: serial.to_owned(),
            model_name: model.to_owned(),
            display_name: model.to_owned(),
            interface: InterfaceInfo {
                display_name: "GEV".to_owned(),
            },
            system: SystemInfo {
                display_name: "Producer".to_owned(),
                version: "2.1".to_owned(),
            },
        }
    }

    fn quick_config() -> SessionConfig {
        SessionConfig {
            wait_timeout: Duration::from_millis(5),
            command_timeout: Duration::from_millis(50),
            max_frames: Some(3),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_listing_format() {
        let devices = [device("111", "Cam A"), device("222", "Cam B")];
        let selection = select_device(&devices, Some("222"));
        assert_eq!(selection.index, 1);
        assert!(selection.matched);
        assert_eq!(
            selection.listing,
            "Devices available:\n0: Cam A (GEV; Producer v.2.1)\nS/N: 111\n\
             1: Cam B (GEV; Producer v.2.1)\nS/N: 222\n"
        );
    }

    #[test]
    fn test_selection_defaults_to_first_device() {
        let devices = [device("111", "Cam A"), device("222", "Cam B")];
        let unmatched = select_device(&devices, Some("999"));
        assert_eq!(unmatched.index, 0);
        assert!(!unmatched.matched);
        assert_eq!(select_device(&devices, None).index, 0);
    }

    #[test]
    fn test_first_matching_serial_wins() {
        let devices = [device("111", "A"), device("222", "B"), device("222", "C")];
        assert_eq!(select_device(&devices, Some("222")).index, 1);
    }

    #[test]
    fn test_normalize_serial() {
        assert_eq!(normalize_serial("_0123"), Some("0123".to_owned()));
        assert_eq!(normalize_serial(" 22490017 "), Some("22490017".to_owned()));
        assert_eq!(normalize_serial(""), None);
        assert_eq!(normalize_serial("_"), None);
    }

    #[test]
    fn test_config_validation() {
        assert!(SessionConfig::default().validate().is_ok());
        let bad_fps = SessionConfig {
            frame_rate: f64::NAN,
            ..SessionConfig::default()
        };
        assert!(bad_fps.validate().is_err());
        let no_wait = SessionConfig {
            wait_timeout: Duration::ZERO,
            ..SessionConfig::default()
        };
        assert!(no_wait.validate().is_err());
    }

    #[test]
    fn test_stop_signal_is_shared() {
        let stop = StopSignal::new();
        let remote = stop.clone();
        assert!(!stop.is_stop_requested());
        remote.request_stop();
        assert!(stop.is_stop_requested());
    }

    #[test]
    #[serial]
    fn test_session_configures_device_and_tears_down() {
        let camera = MockCamera::new("S1").with_min_buffers(2);
        let library = Library::initialize().expect("init");
        let mut manager = library.device_manager();
        manager.add_transport(Box::new(MockTransport::new(vec![camera.clone()])));

        let mut frames = 0;
        let mut sink = |frame: &Frame<'_>| -> Result<()> {
            assert_eq!((frame.width, frame.height), (640, 480));
            frames += 1;
            Ok(())
        };
        let config = SessionConfig {
            frame_rate: 12.5,
            ..quick_config()
        };
        let stats = run_session(&mut manager, &config, &mut sink, &StopSignal::new())
            .expect("session succeeds");

        assert_eq!(stats.delivered, 3);
        assert_eq!(frames, 3);
        assert_eq!(camera.enum_value("TriggerSelector").as_deref(), Some("ExposureStart"));
        assert_eq!(camera.enum_value("TriggerMode").as_deref(), Some("Off"));
        assert!((camera.frame_rate() - 12.5).abs() < f64::EPSILON);
        assert!(!camera.is_running());
        assert!(!camera.is_stream_open());
        assert!(!camera.is_open());
    }

    #[test]
    #[serial]
    fn test_raised_stop_delivers_nothing() {
        let camera = MockCamera::new("S1");
        let library = Library::initialize().expect("init");
        let mut manager = library.device_manager();
        manager.add_transport(Box::new(MockTransport::new(vec![camera.clone()])));

        let stop = StopSignal::new();
        stop.request_stop();
        let mut sink = |_: &Frame<'_>| -> Result<()> { Ok(()) };
        let stats = run_session(&mut manager, &quick_config(), &mut sink, &stop).expect("session");
        assert_eq!(stats, SessionStats::default());
        assert!(!camera.is_open());
    }

    #[test]
    #[serial]
    fn test_timeouts_and_sink_failures_are_counted() {
        let camera = MockCamera::new("S1").with_script([MockEvent::Timeout, MockEvent::Timeout]);
        let library = Library::initialize().expect("init");
        let mut manager = library.device_manager();
        manager.add_transport(Box::new(MockTransport::new(vec![camera])));

        let mut calls = 0;
        let mut sink = |_: &Frame<'_>| -> Result<()> {
            calls += 1;
            if calls == 1 {
                Err(CameraError::Sink("subscriber gone".to_owned()))
            } else {
                Ok(())
            }
        };
        let stats = run_session(&mut manager, &quick_config(), &mut sink, &StopSignal::new())
            .expect("session");
        assert_eq!(stats.timeouts, 2);
        assert_eq!(stats.sink_failures, 1);
        assert_eq!(stats.delivered, 3);
    }

    #[test]
    #[serial]
    fn test_stream_fault_is_fatal_but_tears_down() {
        let camera = MockCamera::new("S1").with_script([MockEvent::Fault("link lost".to_owned())]);
        let library = Library::initialize().expect("init");
        let mut manager = library.device_manager();
        manager.add_transport(Box::new(MockTransport::new(vec![camera.clone()])));

        let mut sink = |_: &Frame<'_>| -> Result<()> { Ok(()) };
        let result = run_session(&mut manager, &quick_config(), &mut sink, &StopSignal::new());
        assert!(matches!(result, Err(CameraError::Stream(_))));
        assert_eq!(camera.stop_calls(), 1);
        assert!(!camera.is_stream_open());
        assert!(!camera.is_open());
    }

    #[test]
    #[serial]
    fn test_no_devices() {
        let library = Library::initialize().expect("init");
        let mut manager = library.device_manager();
        let mut sink = |_: &Frame<'_>| -> Result<()> { Ok(()) };
        let result = run_session(&mut manager, &quick_config(), &mut sink, &StopSignal::new());
        assert!(matches!(result, Err(CameraError::DeviceUnavailable(_))));
    }
}
