//! Transport trait for the media layer
//!
//! The media transport (handshake negotiation, ICE, DTLS/SRTP, decoding) lives outside
//! this crate. The bridge consumes it through two seams:
//!
//! - [`TransportFactory`] creates one [`Transport`] per session and hands it a
//!   [`TransportEvents`] handle for its callbacks;
//! - [`Transport`] exposes the three operations the bridge drives.
//!
//! Callbacks never block: every [`TransportEvents`] method only enqueues an event for the
//! bridge core and returns, so they are safe to call from a transport's own threads.
//!
//! Decoded frames are large, so each session may only have `pipe.pending_frames` of them
//! queued toward the core. Frames beyond that are shed before they are queued, which keeps
//! memory bounded while the core is busy (for instance waiting on encoders at shutdown).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::Result;
use crate::driver::BridgeEvent;
use crate::types::{
    ConnectionState, IceCandidate, RawFrame, SessionId, TrackId, TrackInfo, TrackStatus,
};

/// One peer media connection, owned by exactly one session
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Apply the remote offer and produce the local answer
    ///
    /// Both descriptions are set once this returns `Ok`.
    async fn negotiate(&self, offer_sdp: String) -> Result<String>;

    /// Add a trickled remote ICE candidate
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Close the connection and stop delivering events
    async fn close(&self);
}

/// Creates transports for new sessions
pub trait TransportFactory: Send + Sync + 'static {
    /// Create the transport for `session`, wiring its callbacks to `events`
    fn create(&self, session: SessionId, events: TransportEvents) -> Result<Arc<dyn Transport>>;
}

/// What a transport can report about its connection
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    Track(TrackInfo),
    TrackStatus { track: TrackId, status: TrackStatus },
}

#[derive(Debug)]
struct FrameGate {
    budget: usize,
    in_flight: AtomicUsize,
    shed: AtomicU64,
}

impl FrameGate {
    fn acquire(self: &Arc<Self>) -> Option<FrameTicket> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.budget).then_some(n + 1))
            .ok()
            .map(|_| FrameTicket(Arc::clone(self)))
    }
}

/// Slot held by one frame on its way to the core, released on drop
#[derive(Debug)]
pub(crate) struct FrameTicket(Arc<FrameGate>);

impl Drop for FrameTicket {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Callback handle given to a transport at creation
#[derive(Debug, Clone)]
pub struct TransportEvents {
    session: SessionId,
    core: mpsc::UnboundedSender<BridgeEvent>,
    frames: Arc<FrameGate>,
}

impl TransportEvents {
    pub(crate) fn new(
        session: SessionId,
        core: mpsc::UnboundedSender<BridgeEvent>,
        pending_frames: usize,
    ) -> Self {
        let frames = FrameGate {
            budget: pending_frames.max(1),
            in_flight: AtomicUsize::new(0),
            shed: AtomicU64::new(0),
        };
        Self { session, core, frames: Arc::new(frames) }
    }

    /// Session this handle reports for
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// A local ICE candidate was gathered
    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(TransportEvent::LocalCandidate(candidate));
    }

    /// The peer connection changed state
    pub fn connection_state(&self, state: ConnectionState) {
        self.emit(TransportEvent::ConnectionState(state));
    }

    /// A remote track was announced
    pub fn track(&self, track: TrackInfo) {
        self.emit(TransportEvent::Track(track));
    }

    /// An announced track ended, muted or unmuted
    pub fn track_status(&self, track: TrackId, status: TrackStatus) {
        self.emit(TransportEvent::TrackStatus { track, status });
    }

    /// A decoded video frame arrived on `track`
    ///
    /// Shed without queueing if the core has not yet taken this session's earlier frames.
    pub fn frame(&self, track: &TrackId, frame: RawFrame) {
        let Some(ticket) = self.frames.acquire() else {
            let shed = self.frames.shed.fetch_add(1, Ordering::Relaxed) + 1;
            if shed.is_power_of_two() {
                warn!(session = %self.session, shed, "Bridge core backed up, shedding frames");
            }
            return;
        };
        let event = BridgeEvent::Frame { session: self.session, track: track.clone(), frame, ticket };
        if self.core.send(event).is_err() {
            trace!(session = %self.session, "Bridge core gone, dropping frame");
        }
    }

    /// Frames shed so far because the core was backed up
    pub fn shed_frames(&self) -> u64 {
        self.frames.shed.load(Ordering::Relaxed)
    }

    fn emit(&self, event: TransportEvent) {
        if self.core.send(BridgeEvent::Transport { session: self.session, event }).is_err() {
            trace!(session = %self.session, "Bridge core gone, dropping transport event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_beyond_the_budget_are_shed() {
        let (core, mut rx) = mpsc::unbounded_channel();
        let events = TransportEvents::new(SessionId::new(1), core, 2);
        let track = TrackId::new("video0");

        for _ in 0..5 {
            events.frame(&track, RawFrame::blank_i420(4, 4));
        }
        assert_eq!(events.shed_frames(), 3);

        let first = rx.try_recv().unwrap();
        let _second = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());

        // Handling a frame frees its slot
        drop(first);
        events.frame(&track, RawFrame::blank_i420(4, 4));
        assert!(matches!(rx.try_recv(), Ok(BridgeEvent::Frame { .. })));
        assert_eq!(events.shed_frames(), 3);
    }

    #[test]
    fn control_events_are_never_shed() {
        let (core, mut rx) = mpsc::unbounded_channel();
        let events = TransportEvents::new(SessionId::new(1), core, 1);

        events.frame(&TrackId::new("video0"), RawFrame::blank_i420(4, 4));
        events.connection_state(ConnectionState::Connected);
        events.track(TrackInfo::video("video1"));

        assert!(matches!(rx.try_recv(), Ok(BridgeEvent::Frame { .. })));
        assert!(matches!(rx.try_recv(), Ok(BridgeEvent::Transport { .. })));
        assert!(matches!(rx.try_recv(), Ok(BridgeEvent::Transport { .. })));
    }
}
