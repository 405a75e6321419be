//! Library lifetime and device discovery across registered producers.

use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::error::{CameraError, Result};
use crate::handle::DeviceHandle;
use crate::traits::{AccessMode, DeviceInfo, Transport};
use crate::v4l2::V4l2Transport;

/// Producer directory registered by a scan of the environment.
pub const DEFAULT_PRODUCER_PATH: &str = "/sys/class/video4linux";

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Process-wide library guard.
///
/// Only one guard may be alive at a time. Everything that talks to hardware
/// borrows it, so devices and streams are closed before the library is.
#[derive(Debug)]
pub struct Library {
    _private: (),
}

impl Library {
    /// Initialize the library.
    pub fn initialize() -> Result<Self> {
        if INITIALIZED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CameraError::LibraryAlreadyInitialized);
        }
        info!("library initialized");
        Ok(Self { _private: () })
    }

    /// Whether a guard is currently alive.
    pub fn is_initialized() -> bool {
        INITIALIZED.load(Ordering::Acquire)
    }

    /// Device manager bound to this guard.
    pub fn device_manager(&self) -> DeviceManager<'_> {
        DeviceManager::new(self)
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        INITIALIZED.store(false, Ordering::Release);
        info!("library closed");
    }
}

/// How `update` looks for devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePolicy {
    /// Only query producers that were registered explicitly.
    #[default]
    RegisteredOnly,
    /// Also register the default producer path if it exists.
    ScanEnvironmentForProducerLibraries,
}

struct Discovered {
    transport: usize,
    index: usize,
    info: DeviceInfo,
}

/// Registry of producers and the devices they expose.
pub struct DeviceManager<'lib> {
    transports: Vec<Box<dyn Transport>>,
    producer_paths: Vec<PathBuf>,
    devices: Vec<Discovered>,
    _library: PhantomData<&'lib Library>,
}

impl fmt::Debug for DeviceManager<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceManager")
            .field("transports", &self.transports.len())
            .field("producer_paths", &self.producer_paths)
            .field("devices", &self.devices.len())
            .finish()
    }
}

impl<'lib> DeviceManager<'lib> {
    /// Empty manager bound to `library`.
    pub const fn new(_library: &'lib Library) -> Self {
        Self {
            transports: Vec::new(),
            producer_paths: Vec::new(),
            devices: Vec::new(),
            _library: PhantomData,
        }
    }

    /// Register a V4L2 producer rooted at a sysfs class directory.
    ///
    /// Registering the same path twice is a no-op.
    pub fn add_producer_library(&mut self, path: &Path) -> Result<()> {
        if !path.is_dir() {
            return Err(CameraError::ProducerLibrary {
                path: path.to_path_buf(),
                reason: "not a readable directory".to_owned(),
            });
        }
        if self.producer_paths.iter().any(|known| known == path) {
            debug!(path = %path.display(), "producer already registered");
            return Ok(());
        }
        self.producer_paths.push(path.to_path_buf());
        self.transports
            .push(Box::new(V4l2Transport::new(path.to_path_buf())));
        info!(path = %path.display(), "producer registered");
        Ok(())
    }

    /// Register any other transport.
    pub fn add_transport(&mut self, transport: Box<dyn Transport>) {
        info!(system = %transport.system_info().display_name, "transport registered");
        self.transports.push(transport);
    }

    /// Number of registered producers and transports.
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    /// Rediscover devices across every producer. Returns the device count.
    ///
    /// A producer that fails to enumerate is logged and skipped.
    pub fn update(&mut self, policy: UpdatePolicy) -> Result<usize> {
        if policy == UpdatePolicy::ScanEnvironmentForProducerLibraries {
            let default = Path::new(DEFAULT_PRODUCER_PATH);
            if default.is_dir() {
                self.add_producer_library(default)?;
            } else {
                debug!(path = DEFAULT_PRODUCER_PATH, "default producer not present");
            }
        }

        self.devices.clear();
        for (transport_index, transport) in self.transports.iter_mut().enumerate() {
            let system = transport.system_info();
            match transport.discover() {
                Ok(found) => {
                    debug!(system = %system.display_name, devices = found.len(), "producer enumerated");
                    self.devices
                        .extend(found.into_iter().enumerate().map(|(index, info)| Discovered {
                            transport: transport_index,
                            index,
                            info,
                        }));
                }
                Err(err) => {
                    warn!(system = %system.display_name, %err, "producer enumeration failed, skipping");
                }
            }
        }
        info!(devices = self.devices.len(), "device list updated");
        Ok(self.devices.len())
    }

    /// Devices found by the last `update`, in discovery order.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(|found| found.info.clone()).collect()
    }

    /// Number of devices found by the last `update`.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Open device `index` of the last discovery.
    pub fn open_device(&mut self, index: usize, access: AccessMode) -> Result<DeviceHandle<'lib>> {
        let found = self.devices.get(index).ok_or_else(|| {
            CameraError::DeviceUnavailable(format!(
                "device index {index} out of range ({} discovered)",
                self.devices.len()
            ))
        })?;
        let transport = self.transports.get_mut(found.transport).ok_or_else(|| {
            CameraError::DeviceUnavailable(format!("producer of device {index} is gone"))
        })?;
        let device = transport.open(found.index, access)?;
        Ok(DeviceHandle::new(device, found.info.clone(), access))
    }
}
