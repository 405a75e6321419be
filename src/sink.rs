//! Frame sinks: where converted frames go.
//!
//! A sink runs on the acquisition thread. There is no frame queue in front
//! of it, so a slow sink drops frames by starving the buffer pool.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use tracing::{debug, info};

use crate::convert::{Frame, TargetFormat};
use crate::error::{CameraError, Result};

/// Receives converted frames.
pub trait FrameSink {
    /// Consume one frame. The frame borrows memory that is reused for the
    /// next one; copy what must outlive the call.
    fn deliver(&mut self, frame: &Frame<'_>) -> Result<()>;
}

impl<F> FrameSink for F
where
    F: FnMut(&Frame<'_>) -> Result<()>,
{
    fn deliver(&mut self, frame: &Frame<'_>) -> Result<()> {
        self(frame)
    }
}

/// Logs every frame at debug level and a summary every `summary_interval`
/// frames.
#[derive(Debug)]
pub struct LogSink {
    delivered: u64,
    summary_interval: u64,
}

impl LogSink {
    /// Summarize every `summary_interval` frames (at least 1).
    pub fn new(summary_interval: u64) -> Self {
        Self {
            delivered: 0,
            summary_interval: summary_interval.max(1),
        }
    }

    /// Frames seen so far.
    pub const fn delivered(&self) -> u64 {
        self.delivered
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(100)
    }
}

impl FrameSink for LogSink {
    fn deliver(&mut self, frame: &Frame<'_>) -> Result<()> {
        self.delivered += 1;
        debug!(
            sequence = frame.sequence,
            width = frame.width,
            height = frame.height,
            encoding = frame.format.encoding(),
            timestamp = ?frame.timestamp,
            bytes = frame.data.len(),
            "frame delivered"
        );
        if self.delivered % self.summary_interval == 0 {
            info!(
                delivered = self.delivered,
                width = frame.width,
                height = frame.height,
                encoding = frame.format.encoding(),
                "streaming"
            );
        }
        Ok(())
    }
}

/// Writes every `every`-th frame as a binary PPM (P6) file.
#[derive(Debug)]
pub struct PpmSink {
    directory: PathBuf,
    every: u64,
    seen: u64,
    written: u64,
    scratch: Vec<u8>,
}

impl PpmSink {
    /// Write into `directory` (created if missing), keeping one frame in
    /// `every`.
    pub fn new(directory: PathBuf, every: u64) -> Result<Self> {
        fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            every: every.max(1),
            seen: 0,
            written: 0,
            scratch: Vec::new(),
        })
    }

    /// Files written so far.
    pub const fn written(&self) -> u64 {
        self.written
    }

    fn path_for(&self, sequence: u64) -> PathBuf {
        self.directory.join(format!("frame_{sequence:08}.ppm"))
    }
}

impl FrameSink for PpmSink {
    fn deliver(&mut self, frame: &Frame<'_>) -> Result<()> {
        self.seen += 1;
        if (self.seen - 1) % self.every != 0 {
            return Ok(());
        }

        let rgb: &[u8] = match frame.format {
            TargetFormat::Rgb8 => frame.data,
            TargetFormat::Bgr8 | TargetFormat::Bgra8 => {
                let bpp = frame.format.bytes_per_pixel();
                self.scratch.clear();
                for pixel in frame.data.chunks_exact(bpp) {
                    if let [b, g, r, ..] = pixel {
                        self.scratch.extend_from_slice(&[*r, *g, *b]);
                    }
                }
                &self.scratch
            }
        };

        let path = self.path_for(frame.sequence);
        let write = || -> std::io::Result<()> {
            let mut out = BufWriter::new(File::create(&path)?);
            write!(out, "P6\n{} {}\n255\n", frame.width, frame.height)?;
            out.write_all(rgb)?;
            out.flush()
        };
        write().map_err(|err| CameraError::Sink(format!("{}: {err}", path.display())))?;

        self.written += 1;
        debug!(path = %path.display(), sequence = frame.sequence, "frame written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn frame(data: &[u8], format: TargetFormat, sequence: u64) -> Frame<'_> {
        Frame {
            width: 2,
            height: 1,
            format,
            data,
            timestamp: Duration::from_millis(33),
            sequence,
        }
    }

    #[test]
    fn test_closure_is_a_sink() {
        let mut count = 0;
        let mut sink = |frame: &Frame<'_>| -> Result<()> {
            assert_eq!(frame.width, 2);
            count += 1;
            Ok(())
        };
        let data = [0u8; 6];
        sink.deliver(&frame(&data, TargetFormat::Rgb8, 0))
            .expect("deliver");
        sink.deliver(&frame(&data, TargetFormat::Rgb8, 1))
            .expect("deliver");
        assert_eq!(count, 2);
    }

    #[test]
    fn test_log_sink_counts() {
        let mut sink = LogSink::new(2);
        let data = [0u8; 6];
        for sequence in 0..3 {
            sink.deliver(&frame(&data, TargetFormat::Bgr8, sequence))
                .expect("deliver");
        }
        assert_eq!(sink.delivered(), 3);
    }

    #[test]
    fn test_ppm_sink_writes_rgb() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = PpmSink::new(dir.path().join("frames"), 1).expect("sink");

        let bgr = [30, 20, 10, 60, 50, 40];
        sink.deliver(&frame(&bgr, TargetFormat::Bgr8, 7))
            .expect("deliver");

        let written = fs::read(dir.path().join("frames").join("frame_00000007.ppm")).expect("file");
        let header = b"P6\n2 1\n255\n";
        assert_eq!(written.get(..header.len()), Some(&header[..]));
        assert_eq!(written.get(header.len()..), Some(&[10, 20, 30, 40, 50, 60][..]));
    }

    #[test]
    fn test_ppm_sink_decimates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = PpmSink::new(dir.path().to_path_buf(), 3).expect("sink");
        let bgra = [0u8; 8];
        for sequence in 0..7 {
            sink.deliver(&frame(&bgra, TargetFormat::Bgra8, sequence))
                .expect("deliver");
        }
        // Frames 0, 3 and 6.
        assert_eq!(sink.written(), 3);
        assert!(dir.path().join("frame_00000003.ppm").exists());
        assert!(!dir.path().join("frame_00000001.ppm").exists());
    }

    #[test]
    fn test_ppm_sink_failure_is_a_sink_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = PpmSink::new(dir.path().to_path_buf(), 1).expect("sink");
        // A directory where the file should go makes the write fail.
        fs::create_dir(dir.path().join("frame_00000000.ppm")).expect("blocker");
        let data = [0u8; 6];
        let result = sink.deliver(&frame(&data, TargetFormat::Rgb8, 0));
        assert!(matches!(result, Err(CameraError::Sink(_))));
        assert!(result.is_err_and(|err| err.is_recoverable()));
    }
}
