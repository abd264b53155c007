//! Non-blocking write side of the frame pipe
//!
//! The pipe never awaits its sink. A write either lands, reports backpressure and hands
//! the frame back, or reports that the sink is gone. Readiness is signalled separately by a
//! [`DrainSignal`] future that the owner schedules outside the pipe.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};

use crate::types::SequencedFrame;

/// Future resolving once a sink that reported backpressure can accept writes again
pub type DrainSignal = BoxFuture<'static, ()>;

/// Result of a single non-blocking write
#[derive(Debug)]
pub enum WriteOutcome {
    /// The sink took ownership of the frame
    Written,
    /// The sink is full right now; the frame is handed back untouched
    Backpressure(SequencedFrame),
    /// The sink is closed for good; the frame is handed back for accounting
    Closed(SequencedFrame),
}

/// Destination of a frame pipe
pub trait EncoderSink: Send + 'static {
    /// Attempt to write without waiting
    fn try_write(&mut self, frame: SequencedFrame) -> WriteOutcome;

    /// One-shot readiness notification, armed after backpressure
    fn drained(&self) -> DrainSignal;
}

/// Create a bounded frame channel toward an encoder's stdin writer
///
/// `capacity` is how many frames may be in flight between the pipe and the writer before
/// writes report backpressure.
pub fn frame_channel(capacity: usize) -> (ChannelSink, FrameReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let notify = Arc::new(Notify::new());
    (ChannelSink { tx, notify: Arc::clone(&notify) }, FrameReceiver { rx, notify })
}

/// [`EncoderSink`] backed by a bounded channel drained by the stdin writer task
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<SequencedFrame>,
    notify: Arc<Notify>,
}

impl ChannelSink {
    /// Whether the receiving writer has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl EncoderSink for ChannelSink {
    fn try_write(&mut self, frame: SequencedFrame) -> WriteOutcome {
        match self.tx.try_send(frame) {
            Ok(()) => WriteOutcome::Written,
            Err(mpsc::error::TrySendError::Full(frame)) => WriteOutcome::Backpressure(frame),
            Err(mpsc::error::TrySendError::Closed(frame)) => WriteOutcome::Closed(frame),
        }
    }

    fn drained(&self) -> DrainSignal {
        // Only a weak handle is held while waiting so an armed signal never keeps the
        // writer's stdin open.
        let weak = self.tx.downgrade();
        let notify = Arc::clone(&self.notify);

        async move {
            loop {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match weak.upgrade() {
                    Some(tx) if tx.capacity() < tx.max_capacity() => {}
                    _ => return,
                }

                notified.await;
            }
        }
        .boxed()
    }
}

/// Receiving half of [`frame_channel`], owned by the stdin writer
#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::Receiver<SequencedFrame>,
    notify: Arc<Notify>,
}

impl FrameReceiver {
    /// Next frame, or `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<SequencedFrame> {
        self.rx.recv().await
    }

    /// Wake armed drain signals if nothing is left in flight
    pub fn notify_if_drained(&self) {
        if self.rx.is_empty() {
            self.notify.notify_waiters();
        }
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        // Armed signals re-check and observe the closed channel
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawFrame;
    use std::time::Duration;

    fn frame(seq: u64) -> SequencedFrame {
        SequencedFrame { seq, frame: RawFrame::new(vec![seq as u8], 1, 1) }
    }

    #[tokio::test]
    async fn full_channel_reports_backpressure_and_returns_frame() {
        let (mut sink, _rx) = frame_channel(1);

        assert!(matches!(sink.try_write(frame(1)), WriteOutcome::Written));
        match sink.try_write(frame(2)) {
            WriteOutcome::Backpressure(back) => assert_eq!(back.seq, 2),
            other => panic!("Expected backpressure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_receiver_reports_closed() {
        let (mut sink, rx) = frame_channel(1);
        drop(rx);

        assert!(sink.is_closed());
        assert!(matches!(sink.try_write(frame(1)), WriteOutcome::Closed(_)));
    }

    #[tokio::test]
    async fn drained_resolves_after_writer_empties_channel() {
        let (mut sink, mut rx) = frame_channel(2);
        assert!(matches!(sink.try_write(frame(1)), WriteOutcome::Written));
        assert!(matches!(sink.try_write(frame(2)), WriteOutcome::Written));

        let drained = tokio::spawn(sink.drained());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drained.is_finished(), "channel is still full");

        assert_eq!(rx.recv().await.map(|f| f.seq), Some(1));
        rx.notify_if_drained();
        assert_eq!(rx.recv().await.map(|f| f.seq), Some(2));
        rx.notify_if_drained();

        tokio::time::timeout(Duration::from_secs(1), drained)
            .await
            .expect("drain signal should fire")
            .unwrap();
    }

    #[tokio::test]
    async fn drained_does_not_keep_channel_open() {
        let (mut sink, mut rx) = frame_channel(1);
        assert!(matches!(sink.try_write(frame(1)), WriteOutcome::Written));

        let drained = tokio::spawn(sink.drained());
        drop(sink);

        assert_eq!(rx.recv().await.map(|f| f.seq), Some(1));
        assert!(rx.recv().await.is_none(), "armed signal must not hold a sender");
        drop(rx);

        tokio::time::timeout(Duration::from_secs(1), drained).await.unwrap().unwrap();
    }
}
