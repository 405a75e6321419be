//! Mock transport and camera for testing without hardware.
//!
//! A [`MockCamera`] is a cheap handle to shared device state: keep a clone
//! around to script events and inspect what the acquisition did after the
//! transport handed the device out.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::convert::{bayer_sample, rgb_to_yuv};
use crate::error::{CameraError, Result};
use crate::traits::{
    AccessMode, AcquisitionStopMode, CameraDevice, CaptureStream, Constraint, DeviceInfo,
    FrameMetadata, InterfaceInfo, NodeAccess, NodeDescriptor, ParameterKind, ParameterValue,
    PixelFormat, SystemInfo, Transport,
};
use crate::validation::SMPTE_COLOR_BARS;

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with the given red, green and blue.
    Solid(u8, u8, u8),
}

/// Scripted outcome of one buffer fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// Deliver a frame.
    Frame,
    /// Nothing arrives before the wait times out.
    Timeout,
    /// The data channel fails.
    Fault(String),
}

const WIDTH_RANGE: (i64, i64, i64) = (16, 4096, 16);
const HEIGHT_RANGE: (i64, i64, i64) = (2, 3072, 2);
const FRAME_RATE_RANGE: (f64, f64) = (1.0, 120.0);

#[derive(Debug)]
struct MockState {
    width: i64,
    height: i64,
    pixel_format: PixelFormat,
    frame_rate: f64,
    trigger_selector: String,
    trigger_mode: String,
    pattern: TestPattern,
    script: VecDeque<MockEvent>,
    min_buffers: usize,
    command_latency: Option<u32>,
    pending_polls: u32,
    running: bool,
    device_open: bool,
    stream_open: bool,
    stream_started: bool,
    stop_unsupported: bool,
    start_rejected: bool,
    busy: bool,
    sequence: u64,
    filled: Vec<usize>,
    stop_calls: usize,
}

impl MockState {
    fn payload_size(&self) -> usize {
        let width = u32::try_from(self.width).unwrap_or_default();
        let height = u32::try_from(self.height).unwrap_or_default();
        self.pixel_format.payload_size(width, height).unwrap_or_default()
    }
}

/// A simulated camera.
#[derive(Debug, Clone)]
pub struct MockCamera {
    serial_number: String,
    model_name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockCamera {
    /// 640x480 YUV422_8 color bars at 30 fps, trigger mode on.
    #[must_use]
    pub fn new(serial_number: &str) -> Self {
        Self {
            serial_number: serial_number.to_owned(),
            model_name: "MockCam".to_owned(),
            state: Arc::new(Mutex::new(MockState {
                width: 640,
                height: 480,
                pixel_format: PixelFormat::Yuv422,
                frame_rate: 30.0,
                trigger_selector: "FrameStart".to_owned(),
                trigger_mode: "On".to_owned(),
                pattern: TestPattern::ColorBars,
                script: VecDeque::new(),
                min_buffers: 1,
                command_latency: Some(0),
                pending_polls: 0,
                running: false,
                device_open: false,
                stream_open: false,
                stream_started: false,
                stop_unsupported: false,
                start_rejected: false,
                busy: false,
                sequence: 0,
                filled: Vec::new(),
                stop_calls: 0,
            })),
        }
    }

    /// Set the model name reported by discovery.
    #[must_use]
    pub fn with_model(mut self, model_name: &str) -> Self {
        model_name.clone_into(&mut self.model_name);
        self
    }

    /// Set the frame geometry and raw pixel format.
    #[must_use]
    pub fn with_format(self, width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        {
            let mut state = self.state.lock();
            state.width = i64::from(width);
            state.height = i64::from(height);
            state.pixel_format = pixel_format;
        }
        self
    }

    /// Set the test pattern.
    #[must_use]
    pub fn with_pattern(self, pattern: TestPattern) -> Self {
        self.state.lock().pattern = pattern;
        self
    }

    /// Require `count` announced buffers before acquisition may start.
    #[must_use]
    pub fn with_min_buffers(self, count: usize) -> Self {
        self.state.lock().min_buffers = count;
        self
    }

    /// Polls before a command reports done; `None` never completes.
    #[must_use]
    pub fn with_command_latency(self, polls: Option<u32>) -> Self {
        self.state.lock().command_latency = polls;
        self
    }

    /// Reject explicit acquisition stops, like a finite acquisition would.
    #[must_use]
    pub fn with_stop_unsupported(self) -> Self {
        self.state.lock().stop_unsupported = true;
        self
    }

    /// Refuse to start acquiring.
    #[must_use]
    pub fn with_start_rejected(self) -> Self {
        self.state.lock().start_rejected = true;
        self
    }

    /// Report the device as held by another process.
    #[must_use]
    pub fn with_busy(self) -> Self {
        self.state.lock().busy = true;
        self
    }

    /// Queue scripted fill outcomes. Once the script runs out every fill
    /// delivers a frame.
    #[must_use]
    pub fn with_script<I>(self, events: I) -> Self
    where
        I: IntoIterator<Item = MockEvent>,
    {
        self.state.lock().script.extend(events);
        self
    }

    /// Discovery record for this camera.
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            serial_number: self.serial_number.clone(),
            model_name: self.model_name.clone(),
            display_name: format!("{} ({})", self.model_name, self.serial_number),
            interface: InterfaceInfo {
                display_name: "MockInterface".to_owned(),
            },
            system: mock_system(),
        }
    }

    /// Open the camera directly, bypassing a transport.
    pub fn open_device(&self, access: AccessMode) -> Box<dyn CameraDevice> {
        self.state.lock().device_open = true;
        Box::new(MockDevice {
            state: Arc::clone(&self.state),
            access,
        })
    }

    /// Current payload size in bytes.
    pub fn payload_size(&self) -> usize {
        self.state.lock().payload_size()
    }

    /// Number of frames delivered so far.
    pub fn fill_count(&self) -> usize {
        self.state.lock().filled.len()
    }

    /// Start address of the buffer each frame was written into, in order.
    pub fn filled_addresses(&self) -> Vec<usize> {
        self.state.lock().filled.clone()
    }

    /// How many times the stream was asked to stop.
    pub fn stop_calls(&self) -> usize {
        self.state.lock().stop_calls
    }

    /// Whether the device-side acquisition is running.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Whether a handle to the device is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().device_open
    }

    /// Whether the data channel is open.
    pub fn is_stream_open(&self) -> bool {
        self.state.lock().stream_open
    }

    /// Current value of an enumeration node.
    pub fn enum_value(&self, name: &str) -> Option<String> {
        let state = self.state.lock();
        match name {
            "TriggerSelector" => Some(state.trigger_selector.clone()),
            "TriggerMode" => Some(state.trigger_mode.clone()),
            "PixelFormat" => Some(state.pixel_format.name().to_owned()),
            _ => None,
        }
    }

    /// Current frame rate.
    pub fn frame_rate(&self) -> f64 {
        self.state.lock().frame_rate
    }
}

fn mock_system() -> SystemInfo {
    SystemInfo {
        display_name: "MockProducer".to_owned(),
        version: "1.0".to_owned(),
    }
}

/// Transport serving a fixed set of mock cameras.
#[derive(Debug, Default)]
pub struct MockTransport {
    cameras: Vec<MockCamera>,
}

impl MockTransport {
    /// Serve `cameras` in discovery order.
    pub fn new(cameras: Vec<MockCamera>) -> Self {
        Self { cameras }
    }
}

impl Transport for MockTransport {
    fn system_info(&self) -> SystemInfo {
        mock_system()
    }

    fn discover(&mut self) -> Result<Vec<DeviceInfo>> {
        Ok(self.cameras.iter().map(MockCamera::info).collect())
    }

    fn open(&mut self, index: usize, access: AccessMode) -> Result<Box<dyn CameraDevice>> {
        let camera = self.cameras.get(index).ok_or_else(|| {
            CameraError::DeviceUnavailable(format!("no mock camera at index {index}"))
        })?;
        {
            let state = camera.state.lock();
            if state.busy || state.device_open {
                return Err(CameraError::DeviceUnavailable(format!(
                    "{} is in use",
                    camera.serial_number
                )));
            }
        }
        Ok(camera.open_device(access))
    }
}

struct MockDevice {
    state: Arc<Mutex<MockState>>,
    access: AccessMode,
}

impl CameraDevice for MockDevice {
    fn describe_parameter(&self, name: &str) -> Result<NodeDescriptor> {
        let (kind, access, constraint) = match name {
            "Width" => (
                ParameterKind::Integer,
                NodeAccess::ReadWrite,
                integer_range(WIDTH_RANGE),
            ),
            "Height" => (
                ParameterKind::Integer,
                NodeAccess::ReadWrite,
                integer_range(HEIGHT_RANGE),
            ),
            "PayloadSize" => (ParameterKind::Integer, NodeAccess::ReadOnly, Constraint::None),
            "PixelFormat" => (
                ParameterKind::Enumeration,
                NodeAccess::ReadWrite,
                Constraint::Entries(
                    PixelFormat::ALL
                        .iter()
                        .map(|format| format.name().to_owned())
                        .collect(),
                ),
            ),
            "AcquisitionFrameRate" => (
                ParameterKind::Float,
                NodeAccess::ReadWrite,
                Constraint::Float {
                    min: FRAME_RATE_RANGE.0,
                    max: FRAME_RATE_RANGE.1,
                },
            ),
            "TriggerSelector" => (
                ParameterKind::Enumeration,
                NodeAccess::ReadWrite,
                entries(&["FrameStart", "ExposureStart"]),
            ),
            "TriggerMode" => (
                ParameterKind::Enumeration,
                NodeAccess::ReadWrite,
                entries(&["Off", "On"]),
            ),
            "AcquisitionStart" | "AcquisitionStop" => {
                (ParameterKind::Command, NodeAccess::WriteOnly, Constraint::None)
            }
            _ => return Err(CameraError::ParameterNotFound(name.to_owned())),
        };
        Ok(NodeDescriptor {
            kind,
            access,
            constraint,
        })
    }

    fn read_parameter(&self, name: &str) -> Result<ParameterValue> {
        let state = self.state.lock();
        Ok(match name {
            "Width" => ParameterValue::Integer(state.width),
            "Height" => ParameterValue::Integer(state.height),
            "PayloadSize" => {
                ParameterValue::Integer(i64::try_from(state.payload_size()).unwrap_or(i64::MAX))
            }
            "PixelFormat" => ParameterValue::Enumeration(state.pixel_format.name().to_owned()),
            "AcquisitionFrameRate" => ParameterValue::Float(state.frame_rate),
            "TriggerSelector" => ParameterValue::Enumeration(state.trigger_selector.clone()),
            "TriggerMode" => ParameterValue::Enumeration(state.trigger_mode.clone()),
            "AcquisitionStart" | "AcquisitionStop" => {
                return Err(CameraError::ParameterAccess {
                    name: name.to_owned(),
                    reason: "command nodes have no value".to_owned(),
                })
            }
            _ => return Err(CameraError::ParameterNotFound(name.to_owned())),
        })
    }

    fn write_parameter(&mut self, name: &str, value: &ParameterValue) -> Result<()> {
        self.require_control(name)?;
        let mut state = self.state.lock();
        if state.stream_started && matches!(name, "Width" | "Height" | "PixelFormat") {
            return Err(CameraError::ParameterAccess {
                name: name.to_owned(),
                reason: "locked while acquiring".to_owned(),
            });
        }
        match (name, value) {
            ("Width", ParameterValue::Integer(width)) => state.width = *width,
            ("Height", ParameterValue::Integer(height)) => state.height = *height,
            ("AcquisitionFrameRate", ParameterValue::Float(rate)) => state.frame_rate = *rate,
            ("TriggerSelector", ParameterValue::Enumeration(entry)) => {
                state.trigger_selector.clone_from(entry);
            }
            ("TriggerMode", ParameterValue::Enumeration(entry)) => {
                state.trigger_mode.clone_from(entry);
            }
            ("PixelFormat", ParameterValue::Enumeration(entry)) => {
                state.pixel_format =
                    entry
                        .parse::<PixelFormat>()
                        .map_err(|reason| CameraError::ParameterRange {
                            name: name.to_owned(),
                            value: value.to_string(),
                            reason,
                        })?;
            }
            _ => {
                return Err(CameraError::ParameterType {
                    name: name.to_owned(),
                    expected: value.kind(),
                    actual: self.describe_parameter(name)?.kind,
                })
            }
        }
        Ok(())
    }

    fn execute_command(&mut self, name: &str) -> Result<()> {
        self.require_control(name)?;
        let mut state = self.state.lock();
        match name {
            "AcquisitionStart" => state.running = true,
            "AcquisitionStop" => state.running = false,
            _ => return Err(CameraError::ParameterNotFound(name.to_owned())),
        }
        state.pending_polls = state.command_latency.unwrap_or_default();
        Ok(())
    }

    fn is_command_done(&self, _name: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if state.command_latency.is_none() {
            return Ok(false);
        }
        if state.pending_polls == 0 {
            Ok(true)
        } else {
            state.pending_polls -= 1;
            Ok(false)
        }
    }

    fn data_stream_count(&self) -> usize {
        1
    }

    fn open_stream(&mut self, channel: usize) -> Result<Box<dyn CaptureStream>> {
        let mut state = self.state.lock();
        if channel != 0 {
            return Err(CameraError::StreamUnavailable(format!(
                "mock camera has no channel {channel}"
            )));
        }
        if state.stream_open {
            return Err(CameraError::StreamUnavailable(
                "channel 0 is already open".to_owned(),
            ));
        }
        state.stream_open = true;
        Ok(Box::new(MockStream {
            state: Arc::clone(&self.state),
        }))
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.running = false;
        state.device_open = false;
    }
}

impl MockDevice {
    fn require_control(&self, name: &str) -> Result<()> {
        if self.access == AccessMode::Control {
            Ok(())
        } else {
            Err(CameraError::ParameterAccess {
                name: name.to_owned(),
                reason: "device is opened read-only".to_owned(),
            })
        }
    }
}

fn integer_range((min, max, increment): (i64, i64, i64)) -> Constraint {
    Constraint::Integer {
        min,
        max,
        increment,
    }
}

fn entries(names: &[&str]) -> Constraint {
    Constraint::Entries(names.iter().map(|&name| name.to_owned()).collect())
}

struct MockStream {
    state: Arc<Mutex<MockState>>,
}

impl CaptureStream for MockStream {
    fn min_buffers_required(&self) -> usize {
        self.state.lock().min_buffers
    }

    fn start(&mut self, buffer_count: usize, buffer_size: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.start_rejected {
            return Err(CameraError::AcquisitionStart(
                "trigger configuration rejected".to_owned(),
            ));
        }
        if buffer_count < state.min_buffers || buffer_size < state.payload_size() {
            return Err(CameraError::AcquisitionStart(format!(
                "{buffer_count} buffers of {buffer_size} bytes cannot hold {}-byte frames",
                state.payload_size()
            )));
        }
        state.stream_started = true;
        Ok(())
    }

    fn next_frame(&mut self, target: &mut [u8], timeout: Duration) -> Result<FrameMetadata> {
        let mut state = self.state.lock();
        if !state.stream_started {
            return Err(CameraError::Stream("stream is not started".to_owned()));
        }
        match state.script.pop_front() {
            Some(MockEvent::Timeout) => return Err(CameraError::Timeout(timeout)),
            Some(MockEvent::Fault(reason)) => return Err(CameraError::Stream(reason)),
            Some(MockEvent::Frame) | None => {}
        }
        if !state.running {
            return Err(CameraError::Timeout(timeout));
        }

        let payload = state.payload_size();
        let available = target.len();
        let frame = target.get_mut(..payload).ok_or_else(|| {
            CameraError::Stream(format!("{available}-byte buffer for a {payload}-byte frame"))
        })?;
        let width = usize::try_from(state.width).unwrap_or_default();
        let height = usize::try_from(state.height).unwrap_or_default();
        render(state.pattern, width, height, state.pixel_format, frame);

        state.filled.push(frame.as_ptr() as usize);
        let sequence = state.sequence;
        state.sequence += 1;
        #[allow(clippy::cast_precision_loss)]
        let timestamp = Duration::from_secs_f64(sequence as f64 / state.frame_rate.max(1.0));

        Ok(FrameMetadata {
            sequence,
            timestamp,
            bytes_used: payload,
            width: u32::try_from(width).unwrap_or_default(),
            height: u32::try_from(height).unwrap_or_default(),
            pixel_format: state.pixel_format,
        })
    }

    fn stop(&mut self, _mode: AcquisitionStopMode) -> Result<()> {
        let mut state = self.state.lock();
        state.stop_calls += 1;
        state.stream_started = false;
        if state.stop_unsupported {
            return Err(CameraError::StopAcquisition(
                "acquisition ends on its own".to_owned(),
            ));
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.stream_open = false;
        state.stream_started = false;
    }
}

/// Generate a frame of `pattern` in `format` into `out`.
fn render(pattern: TestPattern, width: usize, height: usize, format: PixelFormat, out: &mut [u8]) {
    let row_bytes = out.len().checked_div(height).unwrap_or_default();
    if format == PixelFormat::Mono12Packed || row_bytes == 0 {
        out.fill(0);
        return;
    }
    for (y, row) in out.chunks_exact_mut(row_bytes).enumerate() {
        if format == PixelFormat::Yuv422 {
            for (pair, quad) in row.chunks_exact_mut(4).enumerate() {
                let x = pair * 2;
                let (y0, u, v) = rgb_at(pattern, x, width).into_yuv();
                let (y1, _, _) = rgb_at(pattern, x + 1, width).into_yuv();
                quad.copy_from_slice(&[y0, u, y1, v]);
            }
            continue;
        }
        let bpp = format.bits_per_pixel() / 8;
        for (x, pixel) in row.chunks_exact_mut(bpp).enumerate() {
            encode_pixel(format, x, y, rgb_at(pattern, x, width), pixel);
        }
    }
}

trait IntoYuv {
    fn into_yuv(self) -> (u8, u8, u8);
}

impl IntoYuv for (u8, u8, u8) {
    fn into_yuv(self) -> (u8, u8, u8) {
        rgb_to_yuv(self.0, self.1, self.2)
    }
}

fn rgb_at(pattern: TestPattern, x: usize, width: usize) -> (u8, u8, u8) {
    match pattern {
        TestPattern::ColorBars => {
            let bar_width = (width / 8).max(1);
            SMPTE_COLOR_BARS
                .get((x / bar_width).min(7))
                .copied()
                .unwrap_or_default()
        }
        TestPattern::Gradient => {
            let value = u8::try_from(x * 255 / width.max(1)).unwrap_or(u8::MAX);
            (value, value, value)
        }
        TestPattern::Solid(r, g, b) => (r, g, b),
    }
}

fn encode_pixel(format: PixelFormat, x: usize, y: usize, rgb: (u8, u8, u8), pixel: &mut [u8]) {
    let (r, g, b) = rgb;
    let luma = rgb.into_yuv().0;
    match format {
        PixelFormat::Mono8 => pixel.copy_from_slice(&[luma]),
        PixelFormat::Mono16 => pixel.copy_from_slice(&[0, luma]),
        PixelFormat::BayerRG8
        | PixelFormat::BayerGR8
        | PixelFormat::BayerGB8
        | PixelFormat::BayerBG8 => pixel.copy_from_slice(&[bayer_sample(format, x, y, rgb)]),
        PixelFormat::Rgb8 => pixel.copy_from_slice(&[r, g, b]),
        PixelFormat::Bgr8 => pixel.copy_from_slice(&[b, g, r]),
        PixelFormat::Rgba8 => pixel.copy_from_slice(&[r, g, b, u8::MAX]),
        PixelFormat::Bgra8 => pixel.copy_from_slice(&[b, g, r, u8::MAX]),
        PixelFormat::Mono12Packed | PixelFormat::Yuv422 => {}
    }
}
