//! V4L2 transport using the v4l crate.
//!
//! The producer is a sysfs class directory (normally `/sys/class/video4linux`);
//! every `videoN` entry with capture and streaming capabilities becomes a
//! device. The generic node names map onto the V4L2 format, stream parameters
//! and controls.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapabilityFlags;
use v4l::control::{Control, Description, Flags as ControlFlags, MenuItem, Type as ControlType, Value};
use v4l::io::mmap::Stream;
use v4l::io::traits::{CaptureStream as V4lCaptureStream, Stream as V4lStreamTrait};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC, Fraction};

use crate::error::{CameraError, Result};
use crate::traits::{
    AccessMode, AcquisitionStopMode, CameraDevice, CaptureStream, Constraint, DeviceInfo,
    FrameMetadata, InterfaceInfo, NodeAccess, NodeDescriptor, ParameterKind, ParameterValue,
    PixelFormat, SystemInfo, Transport,
};

/// Raw formats with a V4L2 fourcc.
const FOURCCS: [(PixelFormat, &[u8; 4]); 10] = [
    (PixelFormat::Mono8, b"GREY"),
    (PixelFormat::Mono16, b"Y16 "),
    (PixelFormat::BayerRG8, b"RGGB"),
    (PixelFormat::BayerGR8, b"GRBG"),
    (PixelFormat::BayerGB8, b"GBRG"),
    (PixelFormat::BayerBG8, b"BA81"),
    (PixelFormat::Rgb8, b"RGB3"),
    (PixelFormat::Bgr8, b"BGR3"),
    (PixelFormat::Rgba8, b"AB24"),
    (PixelFormat::Yuv422, b"YUYV"),
];

const MIN_BUFFERS: usize = 2;
const MAX_DIMENSION: i64 = 16_384;
const FRAME_RATE_RANGE: (f64, f64) = (0.1, 1000.0);

fn pixel_format_of(fourcc: FourCC) -> Option<PixelFormat> {
    FOURCCS
        .iter()
        .find(|(_, code)| **code == fourcc.repr)
        .map(|(format, _)| *format)
}

fn fourcc_of(format: PixelFormat) -> Option<FourCC> {
    FOURCCS
        .iter()
        .find(|(candidate, _)| *candidate == format)
        .map(|(_, code)| FourCC::new(code))
}

/// Control names lowercased with everything but letters and digits removed,
/// so "White Balance, Automatic" answers to `WhiteBalanceAutomatic`.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn node_index(file_name: &str) -> Option<usize> {
    file_name.strip_prefix("video")?.parse().ok()
}

/// Rows must be tightly packed; the converter has no notion of padding.
fn check_stride(width: u32, stride: u32, format: PixelFormat) -> Result<()> {
    let packed = usize::try_from(width)
        .ok()
        .and_then(|width| width.checked_mul(format.bits_per_pixel()))
        .map(|bits| bits / 8);
    if packed == usize::try_from(stride).ok() {
        Ok(())
    } else {
        Err(CameraError::AcquisitionStart(format!(
            "{format} rows are {stride} bytes for width {width}; padded rows are not supported"
        )))
    }
}

fn unavailable(node: usize, err: &io::Error) -> CameraError {
    CameraError::DeviceUnavailable(format!("/dev/video{node}: {err}"))
}

/// Producer backed by V4L2 device nodes.
#[derive(Debug)]
pub struct V4l2Transport {
    root: PathBuf,
    nodes: Vec<usize>,
}

impl V4l2Transport {
    /// Producer listing the `videoN` entries of `root`.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            nodes: Vec::new(),
        }
    }

    fn inspect_node(node: usize) -> io::Result<Option<DeviceInfo>> {
        let device = Device::new(node)?;
        let caps = device.query_caps()?;
        if !caps.capabilities.contains(CapabilityFlags::VIDEO_CAPTURE)
            || !caps.capabilities.contains(CapabilityFlags::STREAMING)
        {
            return Ok(None);
        }
        let (major, minor, patch) = caps.version;
        Ok(Some(DeviceInfo {
            serial_number: caps.bus,
            model_name: caps.card.clone(),
            display_name: format!("{} (/dev/video{node})", caps.card),
            interface: InterfaceInfo {
                display_name: caps.driver,
            },
            system: SystemInfo {
                display_name: "V4L2".to_owned(),
                version: format!("{major}.{minor}.{patch}"),
            },
        }))
    }
}

impl Transport for V4l2Transport {
    fn system_info(&self) -> SystemInfo {
        SystemInfo {
            display_name: "V4L2".to_owned(),
            version: self.root.display().to_string(),
        }
    }

    fn discover(&mut self) -> Result<Vec<DeviceInfo>> {
        let mut candidates: Vec<usize> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| node_index(&entry.file_name().to_string_lossy()))
            .collect();
        candidates.sort_unstable();

        self.nodes.clear();
        let mut devices = Vec::new();
        for node in candidates {
            match Self::inspect_node(node) {
                Ok(Some(info)) => {
                    debug!(node, serial = %info.serial_number, model = %info.model_name, "capture device found");
                    self.nodes.push(node);
                    devices.push(info);
                }
                Ok(None) => debug!(node, "skipping node without streaming capture"),
                Err(err) => debug!(node, %err, "skipping node that cannot be queried"),
            }
        }
        Ok(devices)
    }

    fn open(&mut self, index: usize, access: AccessMode) -> Result<Box<dyn CameraDevice>> {
        let node = *self.nodes.get(index).ok_or_else(|| {
            CameraError::DeviceUnavailable(format!("no V4L2 device at index {index}"))
        })?;
        let device = Device::new(node).map_err(|err| unavailable(node, &err))?;
        Ok(Box::new(V4l2Camera {
            device: Arc::new(device),
            node,
            access,
            stream_open: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// An open V4L2 capture node.
struct V4l2Camera {
    device: Arc<Device>,
    node: usize,
    access: AccessMode,
    stream_open: Arc<AtomicBool>,
}

impl V4l2Camera {
    fn format(&self) -> Result<Format> {
        Ok(self.device.format()?)
    }

    fn control(&self, name: &str) -> Result<Description> {
        let wanted = normalize(name);
        self.device
            .query_controls()?
            .into_iter()
            .find(|control| normalize(&control.name) == wanted)
            .ok_or_else(|| CameraError::ParameterNotFound(name.to_owned()))
    }

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

    fn supported_formats(&self) -> Result<Vec<String>> {
        Ok(self
            .device
            .enum_formats()?
            .into_iter()
            .filter_map(|description| pixel_format_of(description.fourcc))
            .map(|format| format.name().to_owned())
            .collect())
    }

    fn set_geometry(&self, name: &str, value: i64) -> Result<()> {
        let requested = u32::try_from(value).map_err(|_| CameraError::ParameterRange {
            name: name.to_owned(),
            value: value.to_string(),
            reason: "not a 32-bit dimension".to_owned(),
        })?;
        let mut format = self.format()?;
        if name == "Width" {
            format.width = requested;
        } else {
            format.height = requested;
        }
        let actual = self.device.set_format(&format)?;
        let applied = if name == "Width" { actual.width } else { actual.height };
        if applied != requested {
            warn!(parameter = name, requested, applied, "driver adjusted frame geometry");
        }
        Ok(())
    }
}

fn describe_control(name: &str, control: &Description) -> Result<NodeDescriptor> {
    let access = if control.flags.contains(ControlFlags::READ_ONLY) {
        NodeAccess::ReadOnly
    } else if control.flags.contains(ControlFlags::WRITE_ONLY) {
        NodeAccess::WriteOnly
    } else {
        NodeAccess::ReadWrite
    };
    let (kind, constraint) = match control.typ {
        ControlType::Integer | ControlType::Integer64 => (
            ParameterKind::Integer,
            Constraint::Integer {
                min: control.minimum,
                max: control.maximum,
                increment: i64::try_from(control.step).unwrap_or(1).max(1),
            },
        ),
        ControlType::Boolean => (
            ParameterKind::Integer,
            Constraint::Integer {
                min: 0,
                max: 1,
                increment: 1,
            },
        ),
        ControlType::Menu => (
            ParameterKind::Enumeration,
            Constraint::Entries(menu_entries(control).map(|(_, entry)| entry).collect()),
        ),
        ControlType::Button => (ParameterKind::Command, Constraint::None),
        _ => return Err(CameraError::ParameterNotFound(name.to_owned())),
    };
    Ok(NodeDescriptor {
        kind,
        access,
        constraint,
    })
}

fn menu_entries(control: &Description) -> impl Iterator<Item = (u32, String)> + '_ {
    control
        .items
        .iter()
        .flatten()
        .filter_map(|(index, item)| match item {
            MenuItem::Name(name) => Some((*index, name.clone())),
            MenuItem::Value(_) => None,
        })
}

impl CameraDevice for V4l2Camera {
    fn describe_parameter(&self, name: &str) -> Result<NodeDescriptor> {
        let (kind, access, constraint) = match name {
            "Width" | "Height" => (
                ParameterKind::Integer,
                NodeAccess::ReadWrite,
                Constraint::Integer {
                    min: 1,
                    max: MAX_DIMENSION,
                    increment: 1,
                },
            ),
            "PayloadSize" => (ParameterKind::Integer, NodeAccess::ReadOnly, Constraint::None),
            "PixelFormat" => (
                ParameterKind::Enumeration,
                NodeAccess::ReadWrite,
                Constraint::Entries(self.supported_formats()?),
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
                Constraint::Entries(vec!["ExposureStart".to_owned()]),
            ),
            "TriggerMode" => (
                ParameterKind::Enumeration,
                NodeAccess::ReadWrite,
                Constraint::Entries(vec!["Off".to_owned()]),
            ),
            "AcquisitionStart" | "AcquisitionStop" => {
                (ParameterKind::Command, NodeAccess::WriteOnly, Constraint::None)
            }
            _ => return describe_control(name, &self.control(name)?),
        };
        Ok(NodeDescriptor {
            kind,
            access,
            constraint,
        })
    }

    fn read_parameter(&self, name: &str) -> Result<ParameterValue> {
        match name {
            "Width" => Ok(ParameterValue::Integer(self.format()?.width.into())),
            "Height" => Ok(ParameterValue::Integer(self.format()?.height.into())),
            "PayloadSize" => Ok(ParameterValue::Integer(self.format()?.size.into())),
            "PixelFormat" => {
                let fourcc = self.format()?.fourcc;
                Ok(ParameterValue::Enumeration(pixel_format_of(fourcc).map_or_else(
                    || fourcc.to_string(),
                    |format| format.name().to_owned(),
                )))
            }
            "AcquisitionFrameRate" => {
                let interval = self.device.params()?.interval;
                if interval.numerator == 0 {
                    return Ok(ParameterValue::Float(0.0));
                }
                Ok(ParameterValue::Float(
                    f64::from(interval.denominator) / f64::from(interval.numerator),
                ))
            }
            "TriggerSelector" => Ok(ParameterValue::Enumeration("ExposureStart".to_owned())),
            "TriggerMode" => Ok(ParameterValue::Enumeration("Off".to_owned())),
            "AcquisitionStart" | "AcquisitionStop" => Err(CameraError::ParameterAccess {
                name: name.to_owned(),
                reason: "command nodes have no value".to_owned(),
            }),
            _ => {
                let description = self.control(name)?;
                let control = self.device.control(description.id)?;
                match (description.typ, control.value) {
                    (ControlType::Menu, Value::Integer(index)) => menu_entries(&description)
                        .find(|(item, _)| i64::from(*item) == index)
                        .map(|(_, entry)| ParameterValue::Enumeration(entry))
                        .ok_or_else(|| {
                            CameraError::Stream(format!("control '{name}' reports unknown entry {index}"))
                        }),
                    (_, Value::Integer(value)) => Ok(ParameterValue::Integer(value)),
                    (_, Value::Boolean(value)) => Ok(ParameterValue::Integer(i64::from(value))),
                    (_, other) => Err(CameraError::Stream(format!(
                        "control '{name}' holds an unsupported value {other:?}"
                    ))),
                }
            }
        }
    }

    fn write_parameter(&mut self, name: &str, value: &ParameterValue) -> Result<()> {
        self.require_control(name)?;
        match (name, value) {
            ("Width" | "Height", ParameterValue::Integer(value)) => self.set_geometry(name, *value),
            ("PixelFormat", ParameterValue::Enumeration(entry)) => {
                let fourcc = entry
                    .parse::<PixelFormat>()
                    .ok()
                    .and_then(fourcc_of)
                    .ok_or_else(|| CameraError::ParameterRange {
                        name: name.to_owned(),
                        value: value.to_string(),
                        reason: "no V4L2 equivalent".to_owned(),
                    })?;
                let mut format = self.format()?;
                format.fourcc = fourcc;
                let actual = self.device.set_format(&format)?;
                if actual.fourcc == fourcc {
                    Ok(())
                } else {
                    Err(CameraError::ParameterRange {
                        name: name.to_owned(),
                        value: value.to_string(),
                        reason: format!("driver kept {}", actual.fourcc),
                    })
                }
            }
            ("AcquisitionFrameRate", ParameterValue::Float(fps)) => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let millihertz = (fps * 1000.0).round() as u32;
                let applied = self
                    .device
                    .set_params(&Parameters::new(Fraction::new(1000, millihertz)))?;
                debug!(requested = fps, interval = %applied.interval, "frame interval set");
                Ok(())
            }
            ("TriggerSelector" | "TriggerMode", ParameterValue::Enumeration(entry)) => {
                debug!(parameter = name, %entry, "V4L2 capture is free-running");
                Ok(())
            }
            _ => {
                let description = self.control(name)?;
                let value = match (description.typ, value) {
                    (ControlType::Menu, ParameterValue::Enumeration(entry)) => {
                        let index = menu_entries(&description)
                            .find(|(_, candidate)| candidate == entry)
                            .map(|(index, _)| index)
                            .ok_or_else(|| CameraError::ParameterRange {
                                name: name.to_owned(),
                                value: value.to_string(),
                                reason: "not a menu entry".to_owned(),
                            })?;
                        Value::Integer(i64::from(index))
                    }
                    (ControlType::Boolean, ParameterValue::Integer(flag)) => Value::Boolean(*flag != 0),
                    (_, ParameterValue::Integer(value)) => Value::Integer(*value),
                    _ => {
                        return Err(CameraError::ParameterType {
                            name: name.to_owned(),
                            expected: value.kind(),
                            actual: describe_control(name, &description)?.kind,
                        })
                    }
                };
                self.device.set_control(Control {
                    id: description.id,
                    value,
                })?;
                Ok(())
            }
        }
    }

    fn execute_command(&mut self, name: &str) -> Result<()> {
        self.require_control(name)?;
        match name {
            "AcquisitionStart" | "AcquisitionStop" => {
                debug!(command = name, "streaming is driven by the data stream");
                Ok(())
            }
            _ => {
                let description = self.control(name)?;
                if description.typ != ControlType::Button {
                    return Err(CameraError::ParameterType {
                        name: name.to_owned(),
                        expected: ParameterKind::Command,
                        actual: describe_control(name, &description)?.kind,
                    });
                }
                self.device.set_control(Control {
                    id: description.id,
                    value: Value::None,
                })?;
                Ok(())
            }
        }
    }

    fn is_command_done(&self, _name: &str) -> Result<bool> {
        Ok(true)
    }

    fn data_stream_count(&self) -> usize {
        1
    }

    fn open_stream(&mut self, channel: usize) -> Result<Box<dyn CaptureStream>> {
        if channel != 0 {
            return Err(CameraError::StreamUnavailable(format!(
                "/dev/video{} has a single capture stream",
                self.node
            )));
        }
        if self.stream_open.swap(true, Ordering::AcqRel) {
            return Err(CameraError::StreamUnavailable(format!(
                "/dev/video{} capture stream is already open",
                self.node
            )));
        }
        Ok(Box::new(V4l2Stream {
            device: Arc::clone(&self.device),
            open: Arc::clone(&self.stream_open),
            stream: None,
            buffer_count: 0,
            geometry: None,
            primed: false,
        }))
    }

    fn close(&mut self) {
        debug!(node = self.node, "V4L2 device released");
    }
}

/// Memory-mapped capture on channel 0.
///
/// The kernel fills its own mmap buffers; each finished frame is copied into
/// the caller's buffer.
struct V4l2Stream {
    device: Arc<Device>,
    open: Arc<AtomicBool>,
    stream: Option<Stream<'static>>,
    buffer_count: u32,
    geometry: Option<(u32, u32, PixelFormat)>,
    primed: bool,
}

impl V4l2Stream {
    fn build(&self) -> Result<Stream<'static>> {
        Stream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)
            .map_err(|err| CameraError::AcquisitionStart(err.to_string()))
    }

    fn map_wait_error(err: io::Error, timeout: Duration) -> CameraError {
        if err.kind() == io::ErrorKind::TimedOut {
            CameraError::Timeout(timeout)
        } else {
            CameraError::Stream(err.to_string())
        }
    }
}

impl CaptureStream for V4l2Stream {
    fn min_buffers_required(&self) -> usize {
        MIN_BUFFERS
    }

    fn start(&mut self, buffer_count: usize, buffer_size: usize) -> Result<()> {
        let format = self.device.format()?;
        let pixel_format = pixel_format_of(format.fourcc).ok_or_else(|| {
            CameraError::AcquisitionStart(format!("unsupported fourcc {}", format.fourcc))
        })?;
        check_stride(format.width, format.stride, pixel_format)?;
        let payload = usize::try_from(format.size).unwrap_or(usize::MAX);
        if buffer_size < payload {
            return Err(CameraError::AcquisitionStart(format!(
                "{buffer_size}-byte buffers cannot hold {payload}-byte frames"
            )));
        }
        self.buffer_count = u32::try_from(buffer_count)
            .map_err(|_| CameraError::AcquisitionStart(format!("{buffer_count} buffers")))?;
        self.stream = Some(self.build()?);
        self.geometry = Some((format.width, format.height, pixel_format));
        self.primed = false;
        debug!(buffers = buffer_count, fourcc = %format.fourcc, "mmap stream prepared");
        Ok(())
    }

    fn next_frame(&mut self, target: &mut [u8], timeout: Duration) -> Result<FrameMetadata> {
        let (width, height, pixel_format) = self
            .geometry
            .ok_or_else(|| CameraError::Stream("stream is not started".to_owned()))?;
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

        if self.primed {
            let handle = self
                .stream
                .as_ref()
                .ok_or_else(|| CameraError::Stream("stream is not started".to_owned()))?
                .handle();
            if handle.poll(libc::POLLIN, millis)? == 0 {
                return Err(CameraError::Timeout(timeout));
            }
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::Stream("stream is not started".to_owned()))?;
        stream.set_timeout(Duration::from_millis(u64::from(millis.unsigned_abs())));
        let (data, meta) = match V4lCaptureStream::next(stream) {
            Ok(frame) => frame,
            Err(err) if !self.primed && err.kind() == io::ErrorKind::TimedOut => {
                // Every buffer is still queued in the kernel; start over.
                warn!("first frame timed out, rebuilding the mmap stream");
                self.stream = None;
                self.stream = Some(self.build()?);
                return Err(CameraError::Timeout(timeout));
            }
            Err(err) => return Err(Self::map_wait_error(err, timeout)),
        };
        self.primed = true;

        let bytes_used = usize::try_from(meta.bytesused)
            .unwrap_or(usize::MAX)
            .min(data.len());
        let available = target.len();
        let destination = target.get_mut(..bytes_used).ok_or_else(|| {
            CameraError::Stream(format!("{available}-byte buffer for a {bytes_used}-byte frame"))
        })?;
        let source = data.get(..bytes_used).unwrap_or_default();
        destination.copy_from_slice(source);

        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        Ok(FrameMetadata {
            sequence: u64::from(meta.sequence),
            timestamp: Duration::new(secs, nanos),
            bytes_used,
            width,
            height,
            pixel_format,
        })
    }

    fn stop(&mut self, _mode: AcquisitionStopMode) -> Result<()> {
        self.primed = false;
        if let Some(mut stream) = self.stream.take() {
            V4lStreamTrait::stop(&mut stream).map_err(|err| CameraError::Stream(err.to_string()))?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
        self.geometry = None;
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_mapping() {
        for (format, code) in FOURCCS {
            assert_eq!(pixel_format_of(FourCC::new(code)), Some(format));
            assert_eq!(fourcc_of(format), Some(FourCC::new(code)));
        }
        assert_eq!(pixel_format_of(FourCC::new(b"MJPG")), None);
        assert_eq!(fourcc_of(PixelFormat::Mono12Packed), None);
    }

    #[test]
    fn test_padded_rows_are_rejected() {
        assert!(check_stride(640, 1280, PixelFormat::Yuv422).is_ok());
        assert!(check_stride(640, 1920, PixelFormat::Rgb8).is_ok());
        assert!(check_stride(642, 642, PixelFormat::Mono8).is_ok());
        assert!(matches!(
            check_stride(642, 704, PixelFormat::Mono8),
            Err(CameraError::AcquisitionStart(_))
        ));
        assert!(check_stride(640, 1344, PixelFormat::Yuv422).is_err());
    }

    #[test]
    fn test_control_names_are_normalized() {
        assert_eq!(normalize("White Balance, Automatic"), "whitebalanceautomatic");
        assert_eq!(normalize("WhiteBalanceAutomatic"), "whitebalanceautomatic");
        assert_eq!(normalize("Gain"), "gain");
    }

    #[test]
    fn test_node_index() {
        assert_eq!(node_index("video0"), Some(0));
        assert_eq!(node_index("video12"), Some(12));
        assert_eq!(node_index("v4l-subdev0"), None);
        assert_eq!(node_index("video"), None);
    }

    #[test]
    fn test_discover_skips_unusable_nodes() {
        let root = tempfile::tempdir().expect("tempdir");
        fs::create_dir(root.path().join("video250")).expect("fake node");
        fs::create_dir(root.path().join("media0")).expect("other entry");

        let mut transport = V4l2Transport::new(root.path().to_path_buf());
        let devices = transport.discover().expect("discover");
        assert!(devices.is_empty());
        assert!(transport.open(0, AccessMode::Control).is_err());
    }

    #[test]
    fn test_discover_missing_root() {
        let mut transport = V4l2Transport::new(PathBuf::from("/nonexistent/video4linux"));
        assert!(matches!(transport.discover(), Err(CameraError::Io(_))));
    }
}
