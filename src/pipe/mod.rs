//! Frame pipe: bounded buffering and backpressure control between the transport's frame
//! callbacks and the encoder's input pipe.
//!
//! ## Delivery algorithm
//!
//! 1. Every arriving frame bumps a counter; only every `decimation`-th frame is forwarded.
//! 2. In [`DeliveryMode::Direct`] the frame is written straight to the sink. A write that
//!    reports backpressure switches the pipe to [`DeliveryMode::Buffered`], keeps the
//!    rejected frame at the head of the queue and requests a drain notification.
//! 3. In buffered mode frames are queued while there is room and dropped (and counted)
//!    otherwise. When the sink is known to be writable the queue is flushed right away.
//! 4. A drain notification marks the sink writable and flushes the queue in FIFO order
//!    until it empties or backpressure returns.
//! 5. After `drains_to_direct` consecutive flushes that emptied the queue with no overflow
//!    in between, the pipe returns to direct mode.
//!
//! The pipe itself never waits. Drain notifications are handed out by [`FramePipe::arm_drain`]
//! for the owner to schedule, and fed back through [`FramePipe::on_drained`].
//!
//! ```rust
//! use hlsbridge::config::PipeConfig;
//! use hlsbridge::pipe::{Delivery, DeliveryMode, DrainSignal, EncoderSink, FramePipe, WriteOutcome};
//! use hlsbridge::types::{RawFrame, SequencedFrame};
//! use futures::FutureExt;
//!
//! #[derive(Default)]
//! struct Collect(Vec<u64>);
//!
//! impl EncoderSink for Collect {
//!     fn try_write(&mut self, frame: SequencedFrame) -> WriteOutcome {
//!         self.0.push(frame.seq);
//!         WriteOutcome::Written
//!     }
//!
//!     fn drained(&self) -> DrainSignal {
//!         futures::future::ready(()).boxed()
//!     }
//! }
//!
//! let mut pipe = FramePipe::new(Collect::default(), &PipeConfig::default());
//!
//! assert_eq!(pipe.push(RawFrame::blank_i420(2, 2)), Delivery::Decimated);
//! assert_eq!(pipe.push(RawFrame::blank_i420(2, 2)), Delivery::Written);
//! assert_eq!(pipe.mode(), DeliveryMode::Direct);
//! assert_eq!(pipe.stats().written, 1);
//! ```

mod sink;

pub use sink::{ChannelSink, DrainSignal, EncoderSink, FrameReceiver, WriteOutcome, frame_channel};

use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, trace};

use crate::config::PipeConfig;
use crate::types::{RawFrame, SequencedFrame};

/// How the pipe currently delivers frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Write each forwarded frame immediately
    Direct,
    /// Queue frames and flush when the sink drains
    Buffered,
}

/// What happened to a frame handed to [`FramePipe::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Skipped by decimation
    Decimated,
    /// Written to the sink
    Written,
    /// Held in the queue (possibly flushed to the sink straight after)
    Queued,
    /// Discarded because the queue was full
    Dropped,
    /// Discarded because the sink is closed
    Closed,
}

/// Point-in-time counters of a frame pipe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipeStats {
    /// Frames handed to the pipe, before decimation
    pub produced: u64,
    /// Frames that survived decimation
    pub forwarded: u64,
    /// Frames accepted by the sink
    pub written: u64,
    /// Frames discarded after decimation (overflow or closed sink)
    pub dropped: u64,
    /// Frames currently queued
    pub queue_depth: usize,
    /// Current delivery mode
    pub mode: DeliveryMode,
    /// Last encoder speed relative to real time, if reported
    pub throughput: Option<f64>,
}

/// Bounded frame queue with a direct/buffered mode controller
#[derive(Debug)]
pub struct FramePipe<S: EncoderSink> {
    sink: S,
    capacity: usize,
    decimation: u64,
    drains_to_direct: u32,

    mode: DeliveryMode,
    queue: VecDeque<SequencedFrame>,
    writable: bool,
    closed: bool,

    /// Backpressure seen, notification not yet handed out
    drain_requested: bool,
    /// A notification is outstanding
    drain_armed: bool,
    /// Consecutive flushes that emptied the queue with no overflow in between
    full_drains: u32,

    produced: u64,
    forwarded: u64,
    written: u64,
    dropped: u64,
    throughput: Option<f64>,
}

impl<S: EncoderSink> FramePipe<S> {
    /// Create a pipe in direct mode
    pub fn new(sink: S, config: &PipeConfig) -> Self {
        Self {
            sink,
            capacity: config.max_buffer_size.max(1),
            decimation: u64::from(config.decimation.max(1)),
            drains_to_direct: config.drains_to_direct.max(1),
            mode: DeliveryMode::Direct,
            queue: VecDeque::with_capacity(config.max_buffer_size),
            writable: true,
            closed: false,
            drain_requested: false,
            drain_armed: false,
            full_drains: 0,
            produced: 0,
            forwarded: 0,
            written: 0,
            dropped: 0,
            throughput: None,
        }
    }

    /// Hand a frame to the pipe. Never blocks.
    pub fn push(&mut self, frame: RawFrame) -> Delivery {
        self.produced += 1;
        if self.produced % self.decimation != 0 {
            return Delivery::Decimated;
        }

        self.forwarded += 1;
        let frame = SequencedFrame { seq: self.produced, frame };

        if self.closed {
            self.dropped += 1;
            return Delivery::Closed;
        }

        match self.mode {
            DeliveryMode::Direct => match self.sink.try_write(frame) {
                WriteOutcome::Written => {
                    self.written += 1;
                    Delivery::Written
                }
                WriteOutcome::Backpressure(frame) => {
                    debug!(seq = frame.seq, "Encoder pipe backpressure, switching to buffered mode");
                    self.mode = DeliveryMode::Buffered;
                    self.full_drains = 0;
                    self.queue.push_back(frame);
                    self.block();
                    Delivery::Queued
                }
                WriteOutcome::Closed(_) => {
                    self.dropped += 1;
                    self.close();
                    Delivery::Closed
                }
            },
            DeliveryMode::Buffered => {
                if self.queue.len() >= self.capacity {
                    trace!(seq = frame.seq, "Frame queue full, dropping frame");
                    self.dropped += 1;
                    self.full_drains = 0;
                    return Delivery::Dropped;
                }

                self.queue.push_back(frame);
                if self.writable {
                    self.flush();
                }

                if self.closed { Delivery::Closed } else { Delivery::Queued }
            }
        }
    }

    /// Take the pending drain notification, if backpressure requested one
    ///
    /// At most one notification is outstanding at a time; the caller schedules it and
    /// reports back through [`FramePipe::on_drained`].
    pub fn arm_drain(&mut self) -> Option<DrainSignal> {
        if !self.drain_requested || self.drain_armed || self.closed {
            return None;
        }
        self.drain_requested = false;
        self.drain_armed = true;
        Some(self.sink.drained())
    }

    /// The armed drain notification fired
    pub fn on_drained(&mut self) {
        if !self.drain_armed {
            trace!("Ignoring stale drain notification");
            return;
        }
        self.drain_armed = false;
        if self.closed {
            return;
        }

        self.writable = true;
        self.flush();
    }

    /// Record the latest encoder throughput ratio
    pub fn set_throughput(&mut self, ratio: f64) {
        self.throughput = Some(ratio);
    }

    /// Whether the sink has been observed closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> PipeStats {
        PipeStats {
            produced: self.produced,
            forwarded: self.forwarded,
            written: self.written,
            dropped: self.dropped,
            queue_depth: self.queue.len(),
            mode: self.mode,
            throughput: self.throughput,
        }
    }

    /// Write queued frames in FIFO order until empty or backpressure
    fn flush(&mut self) {
        while let Some(frame) = self.queue.pop_front() {
            match self.sink.try_write(frame) {
                WriteOutcome::Written => self.written += 1,
                WriteOutcome::Backpressure(frame) => {
                    self.queue.push_front(frame);
                    self.full_drains = 0;
                    self.block();
                    return;
                }
                WriteOutcome::Closed(_) => {
                    self.dropped += 1;
                    self.close();
                    return;
                }
            }
        }

        self.full_drains += 1;
        if self.mode == DeliveryMode::Buffered && self.full_drains >= self.drains_to_direct {
            debug!(drains = self.full_drains, "Switching back to direct write mode");
            self.mode = DeliveryMode::Direct;
            self.full_drains = 0;
        }
    }

    fn block(&mut self) {
        self.writable = false;
        if !self.drain_armed {
            self.drain_requested = true;
        }
    }

    fn close(&mut self) {
        debug!(discarded = self.queue.len(), "Encoder pipe closed");
        self.closed = true;
        self.writable = false;
        self.drain_requested = false;
        self.dropped += self.queue.len() as u64;
        self.queue.clear();
    }
}
