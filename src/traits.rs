//! Core traits and types for the camera hardware abstraction.
//!
//! Three seams separate the acquisition core from whatever drives the
//! hardware: a [`Transport`] discovers and opens devices, a [`CameraDevice`]
//! exposes the device's parameter nodes and data channels, and a
//! [`CaptureStream`] fills caller-owned memory with frames.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Result;

/// Pixel layout of a raw payload, named after the GenICam naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit monochrome.
    Mono8,
    /// 16-bit little-endian monochrome.
    Mono16,
    /// 12-bit monochrome, two pixels packed in three bytes.
    Mono12Packed,
    /// 8-bit Bayer, red at the origin.
    BayerRG8,
    /// 8-bit Bayer, green-red first row.
    BayerGR8,
    /// 8-bit Bayer, green-blue first row.
    BayerGB8,
    /// 8-bit Bayer, blue at the origin.
    BayerBG8,
    /// Packed 24-bit RGB.
    Rgb8,
    /// Packed 24-bit BGR.
    Bgr8,
    /// Packed 32-bit RGBA.
    Rgba8,
    /// Packed 32-bit BGRA.
    Bgra8,
    /// 4:2:2 packed in Y0 U Y1 V order (YUYV).
    Yuv422,
}

impl PixelFormat {
    /// Every format, in the order devices usually list them.
    pub const ALL: [Self; 12] = [
        Self::Mono8,
        Self::Mono16,
        Self::Mono12Packed,
        Self::BayerRG8,
        Self::BayerGR8,
        Self::BayerGB8,
        Self::BayerBG8,
        Self::Rgb8,
        Self::Bgr8,
        Self::Rgba8,
        Self::Bgra8,
        Self::Yuv422,
    ];

    /// Node entry name of this format.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mono8 => "Mono8",
            Self::Mono16 => "Mono16",
            Self::Mono12Packed => "Mono12Packed",
            Self::BayerRG8 => "BayerRG8",
            Self::BayerGR8 => "BayerGR8",
            Self::BayerGB8 => "BayerGB8",
            Self::BayerBG8 => "BayerBG8",
            Self::Rgb8 => "RGB8",
            Self::Bgr8 => "BGR8",
            Self::Rgba8 => "RGBa8",
            Self::Bgra8 => "BGRa8",
            Self::Yuv422 => "YUV422_8",
        }
    }

    /// Bits occupied by one pixel in the raw payload.
    pub const fn bits_per_pixel(self) -> usize {
        match self {
            Self::Mono8 | Self::BayerRG8 | Self::BayerGR8 | Self::BayerGB8 | Self::BayerBG8 => 8,
            Self::Mono12Packed => 12,
            Self::Mono16 | Self::Yuv422 => 16,
            Self::Rgb8 | Self::Bgr8 => 24,
            Self::Rgba8 | Self::Bgra8 => 32,
        }
    }

    /// Bytes needed for a `width` x `height` payload, `None` on overflow.
    pub fn payload_size(self, width: u32, height: u32) -> Option<usize> {
        let pixels = usize::try_from(width)
            .ok()?
            .checked_mul(usize::try_from(height).ok()?)?;
        let bits = pixels.checked_mul(self.bits_per_pixel())?;
        Some(bits.div_ceil(8))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|format| format.name() == s)
            .ok_or_else(|| format!("unknown pixel format '{s}'"))
    }
}

/// Producer (transport layer) that exposes devices.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemInfo {
    /// Human-readable producer name.
    pub display_name: String,
    /// Producer version.
    pub version: String,
}

/// Interface (bus, driver) a device hangs off.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceInfo {
    /// Human-readable interface name.
    pub display_name: String,
}

/// A device found during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    /// Serial number, used to pick a device.
    pub serial_number: String,
    /// Model name.
    pub model_name: String,
    /// Display name.
    pub display_name: String,
    /// Parent interface.
    pub interface: InterfaceInfo,
    /// Parent system.
    pub system: SystemInfo,
}

/// How a device is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Exclusive control: parameters may be written and commands executed.
    Control,
    /// Read-only monitoring.
    ReadOnly,
}

/// Kind of value a parameter node holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    /// Signed integer.
    Integer,
    /// Floating point.
    Float,
    /// One of a fixed set of named entries.
    Enumeration,
    /// Action without a value.
    Command,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Enumeration => "enumeration",
            Self::Command => "command",
        })
    }
}

/// Value read from or written to a parameter node.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    /// Integer node value.
    Integer(i64),
    /// Float node value.
    Float(f64),
    /// Enumeration entry name.
    Enumeration(String),
}

impl ParameterValue {
    /// Kind of node this value belongs to.
    pub const fn kind(&self) -> ParameterKind {
        match self {
            Self::Integer(_) => ParameterKind::Integer,
            Self::Float(_) => ParameterKind::Float,
            Self::Enumeration(_) => ParameterKind::Enumeration,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Enumeration(entry) => write!(f, "'{entry}'"),
        }
    }
}

/// Read/write access a node grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAccess {
    /// Readable and writable.
    ReadWrite,
    /// Readable only.
    ReadOnly,
    /// Writable only (commands, triggers).
    WriteOnly,
}

impl NodeAccess {
    /// Whether the node may be read.
    pub const fn is_readable(self) -> bool {
        matches!(self, Self::ReadWrite | Self::ReadOnly)
    }

    /// Whether the node may be written.
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite | Self::WriteOnly)
    }
}

/// Constraint a node places on written values.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// Anything of the right kind.
    None,
    /// Inclusive integer range with increment.
    Integer {
        /// Smallest value.
        min: i64,
        /// Largest value.
        max: i64,
        /// Step from `min`.
        increment: i64,
    },
    /// Inclusive float range.
    Float {
        /// Smallest value.
        min: f64,
        /// Largest value.
        max: f64,
    },
    /// Valid enumeration entries.
    Entries(Vec<String>),
}

/// What the device reports about a named node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescriptor {
    /// Value kind.
    pub kind: ParameterKind,
    /// Access rights.
    pub access: NodeAccess,
    /// Write constraint.
    pub constraint: Constraint,
}

/// Metadata for a filled buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u64,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes written into the buffer.
    pub bytes_used: usize,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Raw pixel layout.
    pub pixel_format: PixelFormat,
}

/// How an acquisition is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquisitionStopMode {
    /// Finish the frame in flight.
    #[default]
    Default,
    /// Abort immediately.
    Kill,
}

/// A registered producer that discovers and opens devices.
pub trait Transport: Send {
    /// Producer identity, reported as the parent system of its devices.
    fn system_info(&self) -> SystemInfo;

    /// Rescan for devices. Indices of the returned list are what `open` takes.
    fn discover(&mut self) -> Result<Vec<DeviceInfo>>;

    /// Open the device at `index` of the last discovery.
    fn open(&mut self, index: usize, access: AccessMode) -> Result<Box<dyn CameraDevice>>;
}

/// Abstraction over an open device: its node map and its data channels.
///
/// Every call is a round-trip to the hardware; implementations must not
/// serve parameter values from a cache.
pub trait CameraDevice: Send {
    /// Describe a node, or fail with `ParameterNotFound`.
    fn describe_parameter(&self, name: &str) -> Result<NodeDescriptor>;

    /// Read a node's current value.
    fn read_parameter(&self, name: &str) -> Result<ParameterValue>;

    /// Write a node. Callers validate kind and constraint beforehand.
    fn write_parameter(&mut self, name: &str, value: &ParameterValue) -> Result<()>;

    /// Trigger a command node.
    fn execute_command(&mut self, name: &str) -> Result<()>;

    /// Whether the last execution of a command node has completed.
    fn is_command_done(&self, name: &str) -> Result<bool>;

    /// Number of data channels the device exposes.
    fn data_stream_count(&self) -> usize;

    /// Open a data channel. Fails with `StreamUnavailable` if it is already open.
    fn open_stream(&mut self, channel: usize) -> Result<Box<dyn CaptureStream>>;

    /// Release the device.
    fn close(&mut self);
}

/// Abstraction over a hardware data channel.
pub trait CaptureStream: Send {
    /// Minimum number of buffers that must be announced before starting.
    fn min_buffers_required(&self) -> usize;

    /// Start acquiring into `buffer_count` buffers of `buffer_size` bytes.
    fn start(&mut self, buffer_count: usize, buffer_size: usize) -> Result<()>;

    /// Fill `target` with the next frame, waiting at most `timeout`.
    fn next_frame(&mut self, target: &mut [u8], timeout: Duration) -> Result<FrameMetadata>;

    /// Stop acquiring.
    fn stop(&mut self, mode: AcquisitionStopMode) -> Result<()>;

    /// Release the channel so it can be opened again.
    fn close(&mut self);
}
