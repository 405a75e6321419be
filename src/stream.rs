//! Acquisition stream: buffer announcement, the acquisition state machine and
//! the timed wait for filled buffers.

use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::convert::RawImage;
use crate::error::{CameraError, Result};
use crate::manager::Library;
use crate::pool::{BufferId, BufferPool, BufferState};
use crate::traits::{AcquisitionStopMode, CaptureStream, FrameMetadata};

/// Default wait for a finished buffer.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(5000);

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Channel open, fewer buffers announced than required.
    Open,
    /// Enough buffers announced to start.
    Configured,
    /// Hardware is filling queued buffers.
    Acquiring,
    /// Acquisition stopped; buffers may be flushed and revoked.
    Stopped,
    /// Channel released.
    Closed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Configured => "configured",
            Self::Acquiring => "acquiring",
            Self::Stopped => "stopped",
            Self::Closed => "closed",
        })
    }
}

/// What `flush` does with queued buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Drop everything waiting in the queue back to `Announced`.
    DiscardAll,
    /// Queue every announced buffer.
    AllToInput,
}

/// Claim on a filled buffer.
///
/// Not `Clone`: handing it back through
/// [`AcquisitionStream::queue_buffer`] consumes it, so a buffer cannot be
/// requeued twice or claimed again before it was requeued. A claim is only
/// honored by the stream that issued it, and `flush(DiscardAll)` revokes
/// every outstanding claim.
#[derive(Debug)]
pub struct FinishedBuffer {
    id: BufferId,
    metadata: FrameMetadata,
    stream: u64,
    epoch: u64,
}

impl FinishedBuffer {
    /// Buffer that holds the frame.
    pub const fn id(&self) -> BufferId {
        self.id
    }

    /// Payload description reported by the hardware.
    pub const fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }
}

/// One device data channel and the buffers announced to it.
pub struct AcquisitionStream<'lib> {
    backend: Box<dyn CaptureStream>,
    pool: Option<BufferPool>,
    queue: VecDeque<BufferId>,
    state: StreamState,
    channel: usize,
    id: u64,
    epoch: u64,
    _library: PhantomData<&'lib Library>,
}

impl fmt::Debug for AcquisitionStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionStream")
            .field("channel", &self.channel)
            .field("state", &self.state)
            .field("pool", &self.pool)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl AcquisitionStream<'_> {
    pub(crate) fn new(backend: Box<dyn CaptureStream>, channel: usize) -> Self {
        debug!(channel, "data stream opened");
        Self {
            backend,
            pool: None,
            queue: VecDeque::new(),
            state: StreamState::Open,
            channel,
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            epoch: 0,
            _library: PhantomData,
        }
    }

    /// Current state.
    pub const fn state(&self) -> StreamState {
        self.state
    }

    /// Channel index this stream was opened on.
    pub const fn channel(&self) -> usize {
        self.channel
    }

    /// Minimum number of announced buffers before acquisition may start.
    pub fn min_buffers_required(&self) -> usize {
        self.backend.min_buffers_required()
    }

    /// Buffers currently owned by the stream (announced, queued or in use).
    pub fn announced_count(&self) -> usize {
        self.pool.as_ref().map_or(0, BufferPool::announced_count)
    }

    /// Buffers waiting for the hardware.
    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Ids of buffers in the `Announced` state.
    pub fn announced_buffers(&self) -> Vec<BufferId> {
        self.pool
            .as_ref()
            .map_or_else(Vec::new, |pool| pool.ids_in(BufferState::Announced))
    }

    /// The attached pool, if any.
    pub const fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// Hand a freshly allocated pool to the stream.
    pub fn attach_pool(&mut self, pool: BufferPool) -> Result<()> {
        self.require(&[StreamState::Open], "attach a buffer pool")?;
        if self.announced_count() > 0 {
            return Err(CameraError::InvalidState(
                "the current pool still has announced buffers".to_owned(),
            ));
        }
        self.pool = Some(pool);
        Ok(())
    }

    /// Transfer one buffer of the attached pool to the stream.
    pub fn announce_buffer(&mut self, id: BufferId) -> Result<()> {
        self.require(
            &[StreamState::Open, StreamState::Configured, StreamState::Stopped],
            "announce buffers",
        )?;
        self.pool_mut()?.announce(id)?;
        self.refresh_configuration();
        Ok(())
    }

    /// Announce every free buffer of the attached pool.
    pub fn announce_all(&mut self) -> Result<usize> {
        let free = self.pool_ref()?.ids_in(BufferState::Free);
        for id in &free {
            self.announce_buffer(*id)?;
        }
        debug!(count = free.len(), "buffers announced");
        Ok(free.len())
    }

    /// Queue an announced buffer for filling.
    pub fn queue_announced(&mut self, id: BufferId) -> Result<()> {
        self.require_not_closed("queue buffers")?;
        let pool = self.pool_mut()?;
        if pool.state(id)? != BufferState::Announced {
            return Err(CameraError::InvalidState(format!(
                "buffer {id} is {}, only announced buffers can be queued this way",
                pool.state(id)?
            )));
        }
        pool.mark_queued(id)?;
        self.queue.push_back(id);
        Ok(())
    }

    /// Queue every announced buffer.
    pub fn queue_all_announced(&mut self) -> Result<usize> {
        let announced = self.announced_buffers();
        for id in &announced {
            self.queue_announced(*id)?;
        }
        Ok(announced.len())
    }

    /// Return a claimed buffer to the queue.
    pub fn queue_buffer(&mut self, buffer: FinishedBuffer) -> Result<()> {
        self.require_not_closed("requeue buffers")?;
        self.check_claim(&buffer)?;
        self.pool_mut()?.mark_queued(buffer.id)?;
        self.queue.push_back(buffer.id);
        Ok(())
    }

    /// Start acquiring. Requires at least `min_buffers_required` announced
    /// buffers.
    pub fn start_acquisition(&mut self) -> Result<()> {
        self.require(
            &[StreamState::Open, StreamState::Configured, StreamState::Stopped],
            "start acquisition",
        )?;
        let required = self.backend.min_buffers_required();
        let announced = self.announced_count();
        if announced < required {
            return Err(CameraError::InsufficientBuffers {
                announced,
                required,
            });
        }
        let buffer_size = self.pool_ref()?.buffer_size();
        self.backend
            .start(announced, buffer_size)
            .map_err(|err| match err {
                CameraError::AcquisitionStart(_) | CameraError::StreamUnavailable(_) => err,
                other => CameraError::AcquisitionStart(other.to_string()),
            })?;
        self.state = StreamState::Acquiring;
        info!(
            channel = self.channel,
            buffers = announced,
            queued = self.queue.len(),
            "acquisition started"
        );
        Ok(())
    }

    /// Block until the hardware fills the oldest queued buffer or `timeout`
    /// elapses.
    ///
    /// A timeout leaves the stream acquiring and the buffer queued. When
    /// every buffer is claimed the wait starves for the full timeout.
    pub fn wait_for_finished_buffer(&mut self, timeout: Duration) -> Result<FinishedBuffer> {
        self.require(&[StreamState::Acquiring], "wait for buffers")?;
        let Some(id) = self.queue.pop_front() else {
            warn!(
                announced = self.announced_count(),
                "no buffer queued; requeue claimed buffers to keep acquiring"
            );
            thread::sleep(timeout);
            return Err(CameraError::Timeout(timeout));
        };

        let Some(pool) = self.pool.as_mut() else {
            self.queue.push_front(id);
            return Err(CameraError::InvalidState("no buffer pool attached".to_owned()));
        };
        let filled = pool
            .memory_mut(id)
            .and_then(|memory| self.backend.next_frame(memory, timeout));
        match filled {
            Ok(metadata) => {
                pool.mark_filled(id)?;
                pool.claim(id)?;
                debug!(
                    buffer = %id,
                    sequence = metadata.sequence,
                    bytes = metadata.bytes_used,
                    "buffer finished"
                );
                Ok(FinishedBuffer {
                    id,
                    metadata,
                    stream: self.id,
                    epoch: self.epoch,
                })
            }
            Err(err) => {
                self.queue.push_front(id);
                Err(err)
            }
        }
    }

    /// Borrow the payload of a claimed buffer for conversion.
    pub fn raw_image(&self, buffer: &FinishedBuffer) -> Result<RawImage<'_>> {
        self.check_claim(buffer)?;
        let memory = self.pool_ref()?.memory(buffer.id)?;
        let data = memory.get(..buffer.metadata.bytes_used).ok_or_else(|| {
            CameraError::Stream(format!(
                "buffer {} reports {} bytes but holds {}",
                buffer.id,
                buffer.metadata.bytes_used,
                memory.len()
            ))
        })?;
        Ok(RawImage::from_metadata(data, &buffer.metadata))
    }

    /// Stop acquiring.
    ///
    /// A transport refusing the stop (finite acquisitions) is logged and the
    /// stream is still considered stopped.
    pub fn stop_acquisition(&mut self, mode: AcquisitionStopMode) -> Result<()> {
        self.require(&[StreamState::Acquiring], "stop acquisition")?;
        let result = self.backend.stop(mode);
        self.state = StreamState::Stopped;
        match result {
            Ok(()) => {
                info!(channel = self.channel, "acquisition stopped");
                Ok(())
            }
            Err(CameraError::StopAcquisition(reason)) => {
                warn!(channel = self.channel, %reason, "transport rejected stop, continuing");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Move buffers according to `mode`. Not allowed while acquiring.
    ///
    /// `DiscardAll` returns queued, filled and claimed buffers to
    /// `Announced`; claims issued before the flush are void afterwards.
    pub fn flush(&mut self, mode: FlushMode) -> Result<()> {
        self.require(
            &[StreamState::Open, StreamState::Configured, StreamState::Stopped],
            "flush",
        )?;
        match mode {
            FlushMode::DiscardAll => {
                let queued: Vec<BufferId> = self.queue.drain(..).collect();
                let pool = self.pool_mut()?;
                for id in &queued {
                    pool.discard(*id)?;
                }
                let mut reclaimed = 0usize;
                for state in [BufferState::Filled, BufferState::InUse] {
                    for id in pool.ids_in(state) {
                        pool.discard(id)?;
                        reclaimed += 1;
                    }
                }
                self.epoch += 1;
                debug!(discarded = queued.len(), reclaimed, "queue flushed");
            }
            FlushMode::AllToInput => {
                self.queue_all_announced()?;
            }
        }
        Ok(())
    }

    /// Take one announced buffer back from the stream. Not allowed while
    /// acquiring.
    pub fn revoke_buffer(&mut self, id: BufferId) -> Result<()> {
        self.require(
            &[StreamState::Open, StreamState::Configured, StreamState::Stopped],
            "revoke buffers",
        )?;
        self.pool_mut()?.revoke(id)?;
        self.refresh_configuration();
        Ok(())
    }

    /// Revoke every announced buffer. Returns how many were revoked.
    pub fn revoke_all(&mut self) -> Result<usize> {
        let announced = self.announced_buffers();
        for id in &announced {
            self.revoke_buffer(*id)?;
        }
        let outstanding = self.announced_count();
        if outstanding > 0 {
            warn!(outstanding, "buffers still claimed or queued after revoke");
        }
        debug!(revoked = announced.len(), "buffers revoked");
        Ok(announced.len())
    }

    /// Stop, flush and revoke best effort, then release the channel.
    ///
    /// Every step runs even if an earlier one failed; the first failure is
    /// returned.
    pub fn close(&mut self) -> Result<()> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        let mut first_error = None;
        if self.state == StreamState::Acquiring {
            if let Err(err) = self.stop_acquisition(AcquisitionStopMode::Kill) {
                warn!(%err, "stop failed during close");
                first_error.get_or_insert(err);
            }
        }
        if self.pool.is_some() {
            if let Err(err) = self.flush(FlushMode::DiscardAll) {
                warn!(%err, "flush failed during close");
                first_error.get_or_insert(err);
            }
            if let Err(err) = self.revoke_all() {
                warn!(%err, "revoke failed during close");
                first_error.get_or_insert(err);
            }
        }
        self.backend.close();
        self.state = StreamState::Closed;
        debug!(channel = self.channel, "data stream closed");
        first_error.map_or(Ok(()), Err)
    }

    fn refresh_configuration(&mut self) {
        let announced = self.announced_count();
        let required = self.backend.min_buffers_required();
        self.state = match self.state {
            StreamState::Open | StreamState::Configured if announced >= required => {
                StreamState::Configured
            }
            StreamState::Open | StreamState::Configured => StreamState::Open,
            StreamState::Stopped if announced == 0 => StreamState::Open,
            other => other,
        };
    }

    fn check_claim(&self, buffer: &FinishedBuffer) -> Result<()> {
        if buffer.stream != self.id {
            return Err(CameraError::InvalidState(format!(
                "buffer {} was claimed from another stream",
                buffer.id
            )));
        }
        if buffer.epoch != self.epoch {
            return Err(CameraError::InvalidState(format!(
                "claim on buffer {} was voided by a flush",
                buffer.id
            )));
        }
        Ok(())
    }

    fn require(&self, allowed: &[StreamState], action: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(CameraError::InvalidState(format!(
                "cannot {action} while the stream is {}",
                self.state
            )))
        }
    }

    fn require_not_closed(&self, action: &str) -> Result<()> {
        if self.state == StreamState::Closed {
            Err(CameraError::InvalidState(format!(
                "cannot {action} on a closed stream"
            )))
        } else {
            Ok(())
        }
    }

    fn pool_ref(&self) -> Result<&BufferPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| CameraError::InvalidState("no buffer pool attached".to_owned()))
    }

    fn pool_mut(&mut self) -> Result<&mut BufferPool> {
        self.pool
            .as_mut()
            .ok_or_else(|| CameraError::InvalidState("no buffer pool attached".to_owned()))
    }
}

impl Drop for AcquisitionStream<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "stream teardown incomplete");
        }
    }
}
