//! Integration tests using vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded via: `sudo modprobe vivid n_devs=2 node_types=0x1,0x1`
//! - Access to /dev/video* devices (may require sudo or video group membership)
//!
//! Expected vivid configuration (test patterns set with `v4l2-ctl -d <dev> -c test_pattern=N`):
//! - Device 1: Gray Ramp pattern (gradient) - `test_pattern=20`
//! - Device 2: 100% Colorbar pattern - `test_pattern=1`
//! - Format: 640x480 YUYV
//!
//! Tests will fail if vivid is not available or not configured correctly.

#![cfg(feature = "integration")]

use std::path::Path;
use std::time::Duration;

use serial_test::serial;
use vision_stream::manager::DEFAULT_PRODUCER_PATH;
use vision_stream::validation::{validate_color_bars, validate_frame_sequence, validate_gradient};
use vision_stream::{
    convert, run_session, AccessMode, AcquisitionStopMode, BufferPool, DeviceManager, Frame,
    Library, SessionConfig, StopSignal, TargetFormat, UpdatePolicy,
};

const WAIT: Duration = Duration::from_secs(2);

/// Indices of vivid devices known to `manager`, in discovery order.
fn find_vivid_devices(manager: &mut DeviceManager<'_>) -> Vec<usize> {
    if manager
        .add_producer_library(Path::new(DEFAULT_PRODUCER_PATH))
        .is_err()
    {
        return Vec::new();
    }
    if manager.update(UpdatePolicy::RegisteredOnly).is_err() {
        return Vec::new();
    }
    manager
        .devices()
        .iter()
        .enumerate()
        .filter(|(_, info)| info.interface.display_name.contains("vivid"))
        .map(|(index, _)| index)
        .collect()
}

/// Fail the test if vivid is not available. Returns the first vivid index.
///
/// Integration tests MUST have vivid loaded - they should fail, not silently skip.
macro_rules! require_vivid {
    ($manager:expr) => {
        match find_vivid_devices($manager).first().copied() {
            Some(idx) => idx,
            None => {
                panic!(
                    "vivid virtual camera not available.\n\
                     Load vivid with: sudo modprobe vivid n_devs=2 node_types=0x1,0x1\n\
                     Or run unit tests only: cargo test --lib"
                );
            }
        }
    };
}

/// Both vivid devices as (gradient index, colorbar index).
macro_rules! require_vivid_pair {
    ($manager:expr) => {{
        let devices = find_vivid_devices($manager);
        match devices.as_slice() {
            [gradient, colorbar, ..] => (*gradient, *colorbar),
            _ => panic!(
                "Two vivid devices required but found {}.\n\
                 Load vivid with: sudo modprobe vivid n_devs=2 node_types=0x1,0x1\n\
                 Or run unit tests only: cargo test --lib",
                devices.len()
            ),
        }
    }};
}

/// Capture `count` frames from device `index` and return the last one
/// converted to BGR8, with every sequence number seen.
fn capture(manager: &mut DeviceManager<'_>, index: usize, count: usize) -> (Vec<u8>, u32, u32, Vec<u64>) {
    let mut device = manager
        .open_device(index, AccessMode::Control)
        .expect("Failed to open vivid device");
    device.set_int("Width", 640).expect("Failed to set width");
    device.set_int("Height", 480).expect("Failed to set height");
    device
        .set_enum("PixelFormat", "YUV422_8")
        .expect("Failed to set pixel format");
    let payload = device.payload_size().expect("Failed to read payload size");
    let (width, height) = device.frame_geometry().expect("Failed to read geometry");

    let mut stream = device.open_stream(0).expect("Failed to open stream");
    let buffers = stream.min_buffers_required().max(4);
    stream
        .attach_pool(BufferPool::allocate(buffers, payload).expect("Failed to allocate"))
        .expect("Failed to attach pool");
    stream.announce_all().expect("Failed to announce");
    stream.queue_all_announced().expect("Failed to queue");
    stream.start_acquisition().expect("Failed to start");
    device
        .execute_command_and_wait("AcquisitionStart")
        .expect("AcquisitionStart failed");

    let mut out = vec![0u8; (width * height * 3) as usize];
    let mut sequences = Vec::with_capacity(count);
    for _ in 0..count {
        let buffer = stream
            .wait_for_finished_buffer(WAIT)
            .expect("Failed to capture frame");
        sequences.push(buffer.metadata().sequence);
        {
            let raw = stream.raw_image(&buffer).expect("Failed to read buffer");
            convert(&raw, TargetFormat::Bgr8, &mut out).expect("Failed to convert");
        }
        stream.queue_buffer(buffer).expect("Failed to requeue");
    }

    stream
        .stop_acquisition(AcquisitionStopMode::Default)
        .expect("Failed to stop");
    stream.close().expect("Failed to close stream");
    device.close();
    (out, width, height, sequences)
}

fn frame(data: &[u8], width: u32, height: u32) -> Frame<'_> {
    Frame {
        width,
        height,
        format: TargetFormat::Bgr8,
        data,
        timestamp: Duration::ZERO,
        sequence: 0,
    }
}

#[test]
#[serial]
fn test_vivid_discovery() {
    let library = Library::initialize().expect("init");
    let mut manager = library.device_manager();
    let index = require_vivid!(&mut manager);

    let devices = manager.devices();
    let info = devices.get(index).expect("discovered device");
    println!("Discovered vivid device:");
    println!("  Model: {}", info.model_name);
    println!("  Driver: {}", info.interface.display_name);
    println!("  Bus: {}", info.serial_number);
    println!("  System: {} v.{}", info.system.display_name, info.system.version);

    assert_eq!(info.system.display_name, "V4L2");
    assert!(!info.serial_number.is_empty(), "bus info is the serial number");
}

#[test]
#[serial]
fn test_vivid_parameters() {
    let library = Library::initialize().expect("init");
    let mut manager = library.device_manager();
    let index = require_vivid!(&mut manager);

    let mut device = manager
        .open_device(index, AccessMode::Control)
        .expect("Failed to open vivid device");
    device.set_int("Width", 640).expect("Failed to set width");
    device.set_int("Height", 480).expect("Failed to set height");
    device
        .set_enum("PixelFormat", "YUV422_8")
        .expect("Failed to set pixel format");

    assert_eq!(device.frame_geometry().expect("geometry"), (640, 480));
    assert_eq!(device.payload_size().expect("payload"), 640 * 480 * 2);
    assert!(device.set_int("PayloadSize", 1).is_err(), "PayloadSize is read-only");

    device
        .set_enum("TriggerSelector", "ExposureStart")
        .expect("TriggerSelector");
    device.set_enum("TriggerMode", "Off").expect("TriggerMode");
    device
        .set_float("AcquisitionFrameRate", 25.0)
        .expect("AcquisitionFrameRate");
    device.close();
}

#[test]
#[serial]
fn test_vivid_capture_multiple_frames() {
    let library = Library::initialize().expect("init");
    let mut manager = library.device_manager();
    let index = require_vivid!(&mut manager);

    let (_, _, _, sequences) = capture(&mut manager, index, 10);
    println!("Sequences: {sequences:?}");

    let result = validate_frame_sequence(&sequences);
    assert!(result.is_ok(), "Frame sequence validation failed: {:?}", result.err());
}

#[test]
#[serial]
fn test_vivid_gradient_pattern() {
    let library = Library::initialize().expect("init");
    let mut manager = library.device_manager();
    let (gradient_device, _) = require_vivid_pair!(&mut manager);

    let (data, width, height, _) = capture(&mut manager, gradient_device, 1);
    let result = validate_gradient(&frame(&data, width, height));
    assert!(
        result.is_ok(),
        "Gradient validation failed on first vivid device.\n\
         Expected Gray Ramp pattern (test_pattern=20).\n\
         Set it with: v4l2-ctl -c test_pattern=N\n\
         Error: {:?}",
        result.err()
    );
}

#[test]
#[serial]
fn test_vivid_colorbar_pattern() {
    let library = Library::initialize().expect("init");
    let mut manager = library.device_manager();
    let (_, colorbar_device) = require_vivid_pair!(&mut manager);

    let (data, width, height, _) = capture(&mut manager, colorbar_device, 1);
    let result = validate_color_bars(&frame(&data, width, height));
    assert!(
        result.is_ok(),
        "Color bars validation failed on second vivid device.\n\
         Expected 100% Colorbar pattern (test_pattern=1).\n\
         Set it with: v4l2-ctl -c test_pattern=N\n\
         Error: {:?}",
        result.err()
    );
}

#[test]
#[serial]
fn test_vivid_session() {
    let library = Library::initialize().expect("init");
    let mut manager = library.device_manager();
    let index = require_vivid!(&mut manager);
    let serial = manager
        .devices()
        .get(index)
        .map(|info| info.serial_number.clone());

    let config = SessionConfig {
        serial_number: serial,
        wait_timeout: WAIT,
        max_frames: Some(5),
        ..SessionConfig::default()
    };
    let mut sink = |frame: &Frame<'_>| -> vision_stream::Result<()> {
        assert_eq!(frame.data.len(), frame.stride() * frame.height as usize);
        Ok(())
    };
    let stats = run_session(&mut manager, &config, &mut sink, &StopSignal::new())
        .expect("session against vivid");
    assert_eq!(stats.delivered, 5);
}
