//! Driver: the bridge's single event-driven core
//!
//! One task owns the [`SessionRegistry`] and the table of open signaling channels, and
//! handles every [`BridgeEvent`] from one queue: signaling messages, transport callbacks,
//! negotiation results, pipe drain notifications, encoder reports and grace timers.
//!
//! Handlers never await. Anything slow (negotiation, candidate adds, transport close,
//! encoder exit, drain readiness, timers) runs in a spawned task that posts its outcome
//! back to the queue. The only await outside the queue is the final wait for encoders
//! during shutdown.


use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::BridgeConfig;
use crate::encoder::{EncoderEvent, EncoderLauncher};
use crate::session::{Session, SessionContext, SessionRegistry, SessionSnapshot, StateChange};
use crate::signaling::{ClientMessage, ServerMessage};
use crate::transport::{FrameTicket, TransportEvent, TransportEvents, TransportFactory};
use crate::types::{ChannelId, IceCandidate, RawFrame, SessionId, TrackId};
use crate::{BridgeError, Result};

/// Everything the core reacts to
#[derive(Debug)]
pub(crate) enum BridgeEvent {
    ChannelOpened { channel: ChannelId, outbound: mpsc::Sender<ServerMessage> },
    Signal { channel: ChannelId, message: ClientMessage },
    ChannelClosed { channel: ChannelId },
    Negotiated { session: SessionId, result: Result<String> },
    Transport { session: SessionId, event: TransportEvent },
    Frame { session: SessionId, track: TrackId, frame: RawFrame, ticket: FrameTicket },
    PipeDrained { session: SessionId },
    Encoder { session: SessionId, event: EncoderEvent },
    GraceExpired { session: SessionId, timer: u64 },
    CloseSession { session: SessionId, reply: oneshot::Sender<bool> },
    Snapshot { reply: oneshot::Sender<Vec<SessionSnapshot>> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cloneable handle for feeding the core
#[derive(Debug, Clone)]
pub struct DriverHandle {
    core: mpsc::UnboundedSender<BridgeEvent>,
    next_channel: Arc<AtomicU64>,
}

impl DriverHandle {
    /// Register a signaling channel; `outbound` receives the messages addressed to it
    pub fn open_channel(&self, outbound: mpsc::Sender<ServerMessage>) -> Result<ChannelId> {
        let channel = ChannelId::new(self.next_channel.fetch_add(1, Ordering::Relaxed));
        self.send(BridgeEvent::ChannelOpened { channel, outbound })?;
        Ok(channel)
    }

    /// Deliver a validated client message
    pub fn signal(&self, channel: ChannelId, message: ClientMessage) -> Result<()> {
        self.send(BridgeEvent::Signal { channel, message })
    }

    /// The channel's connection is gone; its session, if any, is not torn down
    pub fn close_channel(&self, channel: ChannelId) {
        let _ = self.send(BridgeEvent::ChannelClosed { channel });
    }

    /// Explicitly stop a session
    pub async fn close_session(&self, session: SessionId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(BridgeEvent::CloseSession { session, reply })?;
        match rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BridgeError::SessionNotFound { session }),
            Err(_) => Err(BridgeError::Shutdown),
        }
    }

    /// Current state of every registered session, ordered by id
    pub async fn snapshot(&self) -> Result<Vec<SessionSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(BridgeEvent::Snapshot { reply })?;
        rx.await.map_err(|_| BridgeError::Shutdown)
    }

    /// Close every session, wait for every encoder to exit, then stop the core
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(BridgeEvent::Shutdown { reply })?;
        rx.await.map_err(|_| BridgeError::Shutdown)
    }

    fn send(&self, event: BridgeEvent) -> Result<()> {
        self.core.send(event).map_err(|_| BridgeError::Shutdown)
    }
}

/// Result of spawning the core
#[derive(Debug)]
pub struct SpawnedDriver {
    /// Handle for signaling relays and callers
    pub handle: DriverHandle,
    /// Completes once the core has shut down
    pub task: JoinHandle<()>,
}

/// The bridge core
pub struct Driver {
    ctx: Arc<SessionContext>,
    transports: Arc<dyn TransportFactory>,
    registry: SessionRegistry,
    channels: HashMap<ChannelId, mpsc::Sender<ServerMessage>>,
    next_session: u64,
}

impl Driver {
    /// Spawn the core task
    pub fn spawn(
        config: BridgeConfig,
        transports: Arc<dyn TransportFactory>,
        launcher: Arc<dyn EncoderLauncher>,
    ) -> SpawnedDriver {
        let (core, events) = mpsc::unbounded_channel();
        // `spawn` does not validate, and a zero period panics `interval_at`
        let stats_interval = config.session.stats_interval().max(Duration::from_millis(1));

        let driver = Driver {
            ctx: Arc::new(SessionContext { config, launcher, core: core.clone() }),
            transports,
            registry: SessionRegistry::new(),
            channels: HashMap::new(),
            next_session: 1,
        };
        let task = tokio::spawn(driver.run(events, stats_interval));

        SpawnedDriver { handle: DriverHandle { core, next_channel: Arc::new(AtomicU64::new(1)) }, task }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<BridgeEvent>, stats_interval: Duration) {
        info!("Bridge core started");
        let mut stats = tokio::time::interval_at(Instant::now() + stats_interval, stats_interval);
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(BridgeEvent::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(event) => self.handle(event),
                    // Unreachable while the core holds its own sender
                    None => break,
                },
                _ = stats.tick() => self.log_stats(),
            }
        }

        info!("Bridge core stopped");
    }

    fn handle(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::ChannelOpened { channel, outbound } => {
                debug!(%channel, "Channel registered");
                self.channels.insert(channel, outbound);
            }
            BridgeEvent::Signal { channel, message } => match message {
                ClientMessage::Offer { sdp } => self.on_offer(channel, sdp),
                ClientMessage::IceCandidate { candidate } => self.on_remote_candidate(channel, candidate),
            },
            BridgeEvent::ChannelClosed { channel } => self.on_channel_closed(channel),
            BridgeEvent::Negotiated { session, result } => self.on_negotiated(session, result),
            BridgeEvent::Transport { session, event } => self.on_transport_event(session, event),
            BridgeEvent::Frame { session, track, frame, ticket: _ticket } => {
                self.on_frame(session, &track, frame)
            }
            BridgeEvent::PipeDrained { session } => {
                if let Some(Err(e)) = self.registry.get_mut(session).map(Session::on_drained) {
                    self.fail_session(session, &e);
                }
            }
            BridgeEvent::Encoder { session, event } => self.on_encoder_event(session, event),
            BridgeEvent::GraceExpired { session, timer } => {
                let expired = self.registry.get_mut(session).is_some_and(|s| s.on_grace_expired(timer));
                if expired {
                    info!(%session, "Grace window elapsed, closing session");
                    self.registry.close(session);
                }
            }
            BridgeEvent::CloseSession { session, reply } => {
                let closed = self.registry.close(session);
                if closed {
                    info!(%session, "Session stopped on request");
                }
                let _ = reply.send(closed);
            }
            BridgeEvent::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshots());
            }
            BridgeEvent::Shutdown { reply } => {
                // Handled by the run loop; reaching here means the loop is gone
                let _ = reply.send(());
            }
        }
    }

    fn on_offer(&mut self, channel: ChannelId, sdp: String) {
        let session = match self.registry.find_by_channel(channel) {
            Some(session) => {
                debug!(%channel, %session, "Offer on bound channel, renegotiating");
                session
            }
            None => match self.create_session(channel) {
                Ok(session) => session,
                Err(e) => {
                    warn!(%channel, error = %e, "Failed to create session for offer");
                    return;
                }
            },
        };

        let Some(transport) = self.registry.get(session).map(|s| Arc::clone(s.transport())) else {
            return;
        };
        let core = self.ctx.core.clone();
        tokio::spawn(async move {
            let result = transport.negotiate(sdp).await;
            let _ = core.send(BridgeEvent::Negotiated { session, result });
        });
    }

    fn create_session(&mut self, channel: ChannelId) -> Result<SessionId> {
        let id = SessionId::new(self.next_session);
        self.next_session += 1;

        let events =
            TransportEvents::new(id, self.ctx.core.clone(), self.ctx.config.pipe.pending_frames);
        let transport = self.transports.create(id, events)?;
        // Insert fails only if a live session already owns this transport, so it stays open
        self.registry.insert(Session::new(id, channel, transport, Arc::clone(&self.ctx)))?;

        info!(session = %id, %channel, sessions = self.registry.len(), "Session created");
        Ok(id)
    }

    fn on_negotiated(&mut self, id: SessionId, result: Result<String>) {
        let Some(session) = self.registry.get_mut(id) else {
            debug!(session = %id, "Negotiation finished for a closed session");
            return;
        };

        let error = match result {
            Ok(answer) if !answer.trim().is_empty() => {
                session.negotiation_finished();
                debug!(session = %id, "Descriptions set, sending answer");
                if let Some(channel) = session.channel() {
                    self.send_to_channel(channel, ServerMessage::Answer { sdp: answer });
                }
                return;
            }
            Ok(_) => BridgeError::transport("negotiation produced an empty answer"),
            Err(e) => e,
        };

        if session.is_described() {
            warn!(session = %id, error = %error, "Renegotiation failed");
        } else {
            warn!(session = %id, error = %error, "Negotiation failed, closing session");
            self.registry.close(id);
        }
    }

    fn on_remote_candidate(&mut self, channel: ChannelId, candidate: IceCandidate) {
        let Some(transport) = self
            .registry
            .find_by_channel(channel)
            .and_then(|id| self.registry.get(id))
            .map(|s| Arc::clone(s.transport()))
        else {
            warn!(%channel, candidate = candidate.summary(), "ICE candidate without a session, dropping");
            return;
        };

        tokio::spawn(async move {
            if let Err(e) = transport.add_remote_candidate(candidate).await {
                warn!(%channel, error = %e, "Failed to add ICE candidate");
            }
        });
    }

    fn on_channel_closed(&mut self, channel: ChannelId) {
        self.channels.remove(&channel);
        if let Some(id) = self.registry.find_by_channel(channel) {
            if let Some(session) = self.registry.get_mut(id) {
                info!(%channel, session = %id, "Signaling channel closed, session detached");
                session.detach_channel();
            }
        }
    }

    fn on_transport_event(&mut self, id: SessionId, event: TransportEvent) {
        let Some(session) = self.registry.get_mut(id) else {
            trace!(session = %id, "Transport event for a closed session");
            return;
        };

        match event {
            TransportEvent::LocalCandidate(candidate) => match session.channel() {
                Some(channel) => {
                    self.send_to_channel(channel, ServerMessage::IceCandidate { candidate })
                }
                None => debug!(session = %id, "Local ICE candidate with no open channel, dropping"),
            },
            TransportEvent::ConnectionState(state) => {
                if session.on_connection_state(state) == StateChange::Close {
                    info!(session = %id, ?state, "Transport ended, closing session");
                    self.registry.close(id);
                }
            }
            TransportEvent::Track(track) => session.attach_track(track),
            TransportEvent::TrackStatus { track, status } => session.track_status(&track, status),
        }
    }

    fn on_frame(&mut self, id: SessionId, track: &TrackId, frame: RawFrame) {
        let Some(session) = self.registry.get_mut(id) else {
            trace!(session = %id, "Frame for a closed session");
            return;
        };
        if let Err(e) = session.on_frame(track, frame) {
            self.fail_session(id, &e);
        }
    }

    fn on_encoder_event(&mut self, id: SessionId, event: EncoderEvent) {
        let Some(session) = self.registry.get_mut(id) else {
            trace!(session = %id, "Encoder event for a closed session");
            return;
        };

        match event {
            EncoderEvent::Throughput(ratio) => session.on_throughput(ratio),
            EncoderEvent::PipeError(reason) => {
                self.fail_session(id, &BridgeError::encoder_pipe(reason, None));
            }
            EncoderEvent::Exited(report) => {
                self.fail_session(id, &BridgeError::encoder_exit(report.describe()));
            }
        }
    }

    /// Force-close a session after a fatal error; no restart is attempted
    fn fail_session(&mut self, id: SessionId, error: &BridgeError) {
        if error.is_session_fatal() {
            error!(session = %id, %error, "Encoder failed, closing session");
        } else {
            warn!(session = %id, %error, "Closing session");
        }
        self.registry.close(id);
    }

    fn send_to_channel(&self, channel: ChannelId, message: ServerMessage) {
        let Some(outbound) = self.channels.get(&channel) else {
            debug!(%channel, "Channel gone, dropping outbound message");
            return;
        };
        match outbound.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%channel, "Outbound signaling queue full, dropping message")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(%channel, "Channel closing, dropping outbound message")
            }
        }
    }

    fn log_stats(&mut self) {
        let now = Instant::now();
        for session in self.registry.iter_mut() {
            let id = session.id();
            let state = session.state();
            if let Some((stats, fps)) = session.stats_tick(now) {
                info!(
                    session = %id,
                    ?state,
                    input_fps = %format_args!("{fps:.1}"),
                    forwarded = stats.forwarded,
                    written = stats.written,
                    dropped = stats.dropped,
                    queue = stats.queue_depth,
                    mode = ?stats.mode,
                    speed = ?stats.throughput,
                    "Pipeline stats"
                );
            }
        }
    }

    async fn shutdown(&mut self) {
        let closed = self.registry.close_all();
        info!(sessions = closed, "Shutting down, stopping all sessions");

        // Dropping the senders ends every relay's outbound loop
        self.channels.clear();

        let reports = self.registry.wait_stopped().await;
        let forced = reports.iter().filter(|r| r.forced).count();
        info!(encoders = reports.len(), forced, "All encoders stopped");
    }
}
