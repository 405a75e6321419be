//! Vision-Stream: continuous frame acquisition from cameras
//!
//! This library drives a camera through a buffered acquisition stream,
//! converts every frame to a fixed pixel layout and hands it to a sink.
//! Hardware sits behind trait seams, so the same session runs against V4L2
//! devices in production and against the mock transport in tests.

pub mod convert;
pub mod error;
pub mod handle;
pub mod manager;
pub mod mock;
pub mod pool;
pub mod session;
pub mod sink;
pub mod stream;
pub mod traits;
pub mod v4l2;
pub mod validation;

pub use convert::{convert, Frame, RawImage, TargetFormat};
pub use error::{CameraError, Result};
pub use handle::DeviceHandle;
pub use manager::{DeviceManager, Library, UpdatePolicy};
pub use pool::{BufferId, BufferPool, BufferState};
pub use session::{run_session, SessionConfig, SessionStats, StopSignal};
pub use sink::{FrameSink, LogSink, PpmSink};
pub use stream::{AcquisitionStream, FinishedBuffer, FlushMode, StreamState};
pub use traits::{
    AccessMode, AcquisitionStopMode, CameraDevice, CaptureStream, DeviceInfo, FrameMetadata,
    PixelFormat, Transport,
};
pub use v4l2::V4l2Transport;
