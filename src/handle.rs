//! Typed parameter surface over an open device.

use std::marker::PhantomData;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{CameraError, Result};
use crate::manager::Library;
use crate::stream::AcquisitionStream;
use crate::traits::{
    AccessMode, CameraDevice, Constraint, DeviceInfo, NodeDescriptor, ParameterKind,
    ParameterValue,
};

/// Default bound for `execute_command_and_wait`.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Rust types that map onto a parameter node kind.
pub trait NodeValue: Sized {
    /// Node kind this type reads and writes.
    const KIND: ParameterKind;

    /// Extract from a device value, `None` if the kinds differ.
    fn from_value(value: ParameterValue) -> Option<Self>;

    /// Wrap for writing.
    fn into_value(self) -> ParameterValue;
}

impl NodeValue for i64 {
    const KIND: ParameterKind = ParameterKind::Integer;

    fn from_value(value: ParameterValue) -> Option<Self> {
        match value {
            ParameterValue::Integer(value) => Some(value),
            _ => None,
        }
    }

    fn into_value(self) -> ParameterValue {
        ParameterValue::Integer(self)
    }
}

impl NodeValue for f64 {
    const KIND: ParameterKind = ParameterKind::Float;

    fn from_value(value: ParameterValue) -> Option<Self> {
        match value {
            ParameterValue::Float(value) => Some(value),
            _ => None,
        }
    }

    fn into_value(self) -> ParameterValue {
        ParameterValue::Float(self)
    }
}

impl NodeValue for String {
    const KIND: ParameterKind = ParameterKind::Enumeration;

    fn from_value(value: ParameterValue) -> Option<Self> {
        match value {
            ParameterValue::Enumeration(entry) => Some(entry),
            _ => None,
        }
    }

    fn into_value(self) -> ParameterValue {
        ParameterValue::Enumeration(self)
    }
}

/// An open device.
///
/// All accessors go to the hardware; nothing is cached between calls. The
/// handle is not `Sync`: share it across threads only behind a lock.
pub struct DeviceHandle<'lib> {
    device: Box<dyn CameraDevice>,
    info: DeviceInfo,
    access: AccessMode,
    command_timeout: Duration,
    closed: bool,
    _library: PhantomData<&'lib Library>,
}

impl std::fmt::Debug for DeviceHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("serial_number", &self.info.serial_number)
            .field("access", &self.access)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<'lib> DeviceHandle<'lib> {
    pub(crate) fn new(device: Box<dyn CameraDevice>, info: DeviceInfo, access: AccessMode) -> Self {
        info!(
            serial = %info.serial_number,
            model = %info.model_name,
            ?access,
            "device opened"
        );
        Self {
            device,
            info,
            access,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            closed: false,
            _library: PhantomData,
        }
    }

    /// Discovery information for this device.
    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Access mode the device was opened with.
    pub const fn access_mode(&self) -> AccessMode {
        self.access
    }

    /// Bound used by [`execute_command_and_wait`](Self::execute_command_and_wait).
    pub const fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Change the command completion bound.
    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.command_timeout = timeout;
    }

    /// Describe a node.
    pub fn describe(&self, name: &str) -> Result<NodeDescriptor> {
        self.device.describe_parameter(name)
    }

    /// Read a node as `T`.
    pub fn get<T: NodeValue>(&self, name: &str) -> Result<T> {
        let descriptor = self.device.describe_parameter(name)?;
        check_kind(name, T::KIND, descriptor.kind)?;
        if !descriptor.access.is_readable() {
            return Err(CameraError::ParameterAccess {
                name: name.to_owned(),
                reason: "node is write-only".to_owned(),
            });
        }
        let value = self.device.read_parameter(name)?;
        let actual = value.kind();
        T::from_value(value).ok_or_else(|| CameraError::ParameterType {
            name: name.to_owned(),
            expected: T::KIND,
            actual,
        })
    }

    /// Write `value` to a node after checking access, kind and constraint.
    pub fn set<T: NodeValue>(&mut self, name: &str, value: T) -> Result<()> {
        let descriptor = self.device.describe_parameter(name)?;
        self.check_writable(name, &descriptor)?;
        check_kind(name, T::KIND, descriptor.kind)?;
        let value = value.into_value();
        check_constraint(name, &value, &descriptor.constraint)?;
        debug!(parameter = name, %value, "writing parameter");
        self.device.write_parameter(name, &value)
    }

    /// Read an integer node.
    pub fn get_int(&self, name: &str) -> Result<i64> {
        self.get(name)
    }

    /// Read a float node.
    pub fn get_float(&self, name: &str) -> Result<f64> {
        self.get(name)
    }

    /// Read the current entry of an enumeration node.
    pub fn get_enum(&self, name: &str) -> Result<String> {
        self.get(name)
    }

    /// Write an integer node.
    pub fn set_int(&mut self, name: &str, value: i64) -> Result<()> {
        self.set(name, value)
    }

    /// Write a float node.
    pub fn set_float(&mut self, name: &str, value: f64) -> Result<()> {
        self.set(name, value)
    }

    /// Select an enumeration entry.
    pub fn set_enum(&mut self, name: &str, entry: &str) -> Result<()> {
        self.set(name, entry.to_owned())
    }

    /// Valid entries of an enumeration node.
    pub fn enum_entries(&self, name: &str) -> Result<Vec<String>> {
        let descriptor = self.device.describe_parameter(name)?;
        check_kind(name, ParameterKind::Enumeration, descriptor.kind)?;
        match descriptor.constraint {
            Constraint::Entries(entries) => Ok(entries),
            _ => Ok(Vec::new()),
        }
    }

    /// Trigger a command node without waiting for completion.
    pub fn execute_command(&mut self, name: &str) -> Result<()> {
        let descriptor = self.device.describe_parameter(name)?;
        self.check_writable(name, &descriptor)?;
        check_kind(name, ParameterKind::Command, descriptor.kind)?;
        debug!(command = name, "executing command");
        self.device.execute_command(name)
    }

    /// Trigger a command node and poll until the device acknowledges it or
    /// the handle's command timeout elapses.
    pub fn execute_command_and_wait(&mut self, name: &str) -> Result<()> {
        self.execute_command(name)?;
        let started = Instant::now();
        loop {
            if self.device.is_command_done(name)? {
                debug!(command = name, elapsed = ?started.elapsed(), "command done");
                return Ok(());
            }
            if started.elapsed() >= self.command_timeout {
                return Err(CameraError::CommandTimeout {
                    name: name.to_owned(),
                    timeout: self.command_timeout,
                });
            }
            thread::sleep(COMMAND_POLL_INTERVAL);
        }
    }

    /// Size in bytes of one raw frame.
    pub fn payload_size(&self) -> Result<usize> {
        let size = self.get_int("PayloadSize")?;
        usize::try_from(size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| CameraError::ParameterRange {
                name: "PayloadSize".to_owned(),
                value: size.to_string(),
                reason: "payload size must be positive".to_owned(),
            })
    }

    /// Current frame width and height.
    pub fn frame_geometry(&self) -> Result<(u32, u32)> {
        Ok((self.dimension("Width")?, self.dimension("Height")?))
    }

    /// Number of data channels.
    pub fn data_stream_count(&self) -> usize {
        self.device.data_stream_count()
    }

    /// Open data channel `channel`.
    pub fn open_stream(&mut self, channel: usize) -> Result<AcquisitionStream<'lib>> {
        let count = self.device.data_stream_count();
        if channel >= count {
            return Err(CameraError::StreamUnavailable(format!(
                "device {} has {count} data streams, channel {channel} requested",
                self.info.serial_number
            )));
        }
        let backend = self.device.open_stream(channel)?;
        Ok(AcquisitionStream::new(backend, channel))
    }

    /// Release the device.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.closed {
            self.device.close();
            self.closed = true;
            info!(serial = %self.info.serial_number, "device closed");
        }
    }

    fn dimension(&self, name: &str) -> Result<u32> {
        let value = self.get_int(name)?;
        u32::try_from(value)
            .ok()
            .filter(|value| *value > 0)
            .ok_or_else(|| CameraError::ParameterRange {
                name: name.to_owned(),
                value: value.to_string(),
                reason: "dimension must be a positive 32-bit value".to_owned(),
            })
    }

    fn check_writable(&self, name: &str, descriptor: &NodeDescriptor) -> Result<()> {
        if self.access == AccessMode::ReadOnly {
            return Err(CameraError::ParameterAccess {
                name: name.to_owned(),
                reason: "device is opened read-only".to_owned(),
            });
        }
        if !descriptor.access.is_writable() {
            return Err(CameraError::ParameterAccess {
                name: name.to_owned(),
                reason: "node is read-only".to_owned(),
            });
        }
        Ok(())
    }
}

impl Drop for DeviceHandle<'_> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(serial = %self.info.serial_number, "device handle dropped without close");
            self.release();
        }
    }
}

fn check_kind(name: &str, expected: ParameterKind, actual: ParameterKind) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(CameraError::ParameterType {
            name: name.to_owned(),
            expected,
            actual,
        })
    }
}

fn check_constraint(name: &str, value: &ParameterValue, constraint: &Constraint) -> Result<()> {
    let violation = match (value, constraint) {
        (ParameterValue::Integer(value), Constraint::Integer { min, max, increment }) => {
            if value < min || value > max {
                Some(format!("outside [{min}, {max}]"))
            } else if *increment > 1 && (value - min) % increment != 0 {
                Some(format!("not a multiple of {increment} from {min}"))
            } else {
                None
            }
        }
        (ParameterValue::Float(value), Constraint::Float { min, max }) => {
            (!value.is_finite() || value < min || value > max)
                .then(|| format!("outside [{min}, {max}]"))
        }
        (ParameterValue::Enumeration(entry), Constraint::Entries(entries)) => {
            (!entries.contains(entry)).then(|| format!("valid entries are {entries:?}"))
        }
        _ => None,
    };
    violation.map_or(Ok(()), |reason| {
        Err(CameraError::ParameterRange {
            name: name.to_owned(),
            value: value.to_string(),
            reason,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCamera;

    fn open(access: AccessMode) -> DeviceHandle<'static> {
        let camera = MockCamera::new("MOCK0001");
        let info = camera.info();
        DeviceHandle::new(camera.open_device(access), info, access)
    }

    #[test]
    fn test_typed_reads() {
        let handle = open(AccessMode::Control);
        assert_eq!(handle.get_int("Width").expect("Width"), 640);
        assert_eq!(handle.get_int("Height").expect("Height"), 480);
        assert_eq!(handle.payload_size().expect("PayloadSize"), 640 * 480 * 2);
        assert_eq!(handle.get_enum("TriggerMode").expect("TriggerMode"), "On");
        assert!(handle.get_float("AcquisitionFrameRate").expect("fps") > 0.0);
        assert_eq!(handle.frame_geometry().expect("geometry"), (640, 480));
    }

    #[test]
    fn test_unknown_parameter() {
        let handle = open(AccessMode::Control);
        assert!(matches!(
            handle.get_int("NoSuchNode"),
            Err(CameraError::ParameterNotFound(name)) if name == "NoSuchNode"
        ));
    }

    #[test]
    fn test_kind_mismatch() {
        let mut handle = open(AccessMode::Control);
        assert!(matches!(
            handle.get_float("Width"),
            Err(CameraError::ParameterType { .. })
        ));
        assert!(matches!(
            handle.set_int("AcquisitionFrameRate", 30),
            Err(CameraError::ParameterType { .. })
        ));
    }

    #[test]
    fn test_enum_rejects_unknown_entry() {
        let mut handle = open(AccessMode::Control);
        handle
            .set_enum("TriggerMode", "Off")
            .expect("Off is a valid entry");
        assert_eq!(handle.get_enum("TriggerMode").expect("read back"), "Off");

        let result = handle.set_enum("TriggerMode", "Sometimes");
        assert!(matches!(result, Err(CameraError::ParameterRange { .. })));
        assert_eq!(handle.get_enum("TriggerMode").expect("unchanged"), "Off");
    }

    #[test]
    fn test_range_and_increment() {
        let mut handle = open(AccessMode::Control);
        assert!(matches!(
            handle.set_float("AcquisitionFrameRate", 10_000.0),
            Err(CameraError::ParameterRange { .. })
        ));
        assert!(matches!(
            handle.set_int("Width", 641),
            Err(CameraError::ParameterRange { .. })
        ));
        handle.set_int("Width", 320).expect("320 is on the increment");
        assert_eq!(handle.payload_size().expect("payload follows width"), 320 * 480 * 2);
    }

    #[test]
    fn test_read_only_nodes_and_handles() {
        let mut handle = open(AccessMode::Control);
        assert!(matches!(
            handle.set_int("PayloadSize", 16),
            Err(CameraError::ParameterAccess { .. })
        ));

        let mut monitor = open(AccessMode::ReadOnly);
        assert_eq!(monitor.get_int("Width").expect("reads still work"), 640);
        assert!(matches!(
            monitor.set_enum("TriggerMode", "Off"),
            Err(CameraError::ParameterAccess { .. })
        ));
        assert!(matches!(
            monitor.execute_command("AcquisitionStart"),
            Err(CameraError::ParameterAccess { .. })
        ));
    }

    #[test]
    fn test_command_wait_is_bounded() {
        let camera = MockCamera::new("MOCK0001").with_command_latency(None);
        let info = camera.info();
        let mut handle = DeviceHandle::new(
            camera.open_device(AccessMode::Control),
            info,
            AccessMode::Control,
        );
        handle.set_command_timeout(Duration::from_millis(20));

        let started = Instant::now();
        let result = handle.execute_command_and_wait("AcquisitionStart");
        assert!(matches!(result, Err(CameraError::CommandTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_command_wait_completes() {
        let camera = MockCamera::new("MOCK0001").with_command_latency(Some(3));
        let info = camera.info();
        let mut handle = DeviceHandle::new(
            camera.open_device(AccessMode::Control),
            info,
            AccessMode::Control,
        );
        handle
            .execute_command_and_wait("AcquisitionStart")
            .expect("command completes after a few polls");
    }

    #[test]
    fn test_stream_channel_out_of_range() {
        let mut handle = open(AccessMode::Control);
        assert_eq!(handle.data_stream_count(), 1);
        assert!(matches!(
            handle.open_stream(1),
            Err(CameraError::StreamUnavailable(_))
        ));
    }
}
