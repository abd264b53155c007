//! Sessions: one negotiated media exchange each
//!
//! A [`Session`] wraps its transport handle, follows the transport's connection state and,
//! once video flows, owns one [`FramePipe`] feeding one [`EncoderProcess`].
//!
//! ```text
//! Negotiating ──first frame──▶ Active ◀──connected──┐
//!      │                          │                  │
//!      │                 disconnected/failed      Degraded
//!      │                          └────────────────▶ │
//!      └──────────── closed / grace elapsed / fatal ─┴──▶ Closed
//! ```
//!
//! Sessions never block. Everything slow (encoder exit, drain readiness, grace expiry) runs
//! in a spawned task that posts a [`BridgeEvent`] back to the core.

mod registry;
mod timer;

pub use registry::SessionRegistry;
pub use timer::GraceTimer;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::BridgeConfig;
use crate::driver::BridgeEvent;
use crate::encoder::{EncoderEvent, EncoderLauncher, EncoderNotify, EncoderProcess, EncoderState, ExitReport};
use crate::pipe::{ChannelSink, Delivery, FramePipe, PipeStats};
use crate::transport::Transport;
use crate::types::{
    ChannelId, ConnectionState, RawFrame, SessionId, TrackId, TrackInfo, TrackKind, TrackStatus,
    i420_frame_len,
};
use crate::{BridgeError, Result};

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Offer received, waiting for descriptions and the first frame
    Negotiating,
    /// Frames are flowing into the encoder
    Active,
    /// Transport lost; pipe and encoder kept alive for the grace window
    Degraded,
    /// Terminal
    Closed,
}

/// What a connection state change did to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Unchanged,
    Degraded,
    Recovered,
    /// The session must be closed
    Close,
}

/// Point-in-time view of a session for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub channel: Option<ChannelId>,
    pub state: SessionState,
    pub connection: ConnectionState,
    pub encoder: EncoderState,
    pub encoder_pid: Option<u32>,
    pub input_size: Option<(u32, u32)>,
    pub grace_pending: bool,
    pub pipe: Option<PipeStats>,
}

/// Everything sessions share: settings, the encoder launcher and the core's queue
pub(crate) struct SessionContext {
    pub config: BridgeConfig,
    pub launcher: Arc<dyn EncoderLauncher>,
    pub core: mpsc::UnboundedSender<BridgeEvent>,
}

/// One negotiated media exchange
pub struct Session {
    id: SessionId,
    channel: Option<ChannelId>,
    state: SessionState,
    connection: ConnectionState,
    described: bool,
    transport: Arc<dyn Transport>,

    /// Video tracks allowed to feed the encoder
    sources: Vec<TrackId>,
    /// Track that won the encoder
    encoder_track: Option<TrackId>,
    encoder: EncoderProcess,
    pipe: Option<FramePipe<ChannelSink>>,

    grace: Option<GraceTimer>,
    timers_started: u64,
    last_tick: Option<(Instant, u64)>,

    ctx: Arc<SessionContext>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("state", &self.state)
            .field("connection", &self.connection)
            .field("encoder", &self.encoder)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        channel: ChannelId,
        transport: Arc<dyn Transport>,
        ctx: Arc<SessionContext>,
    ) -> Self {
        Self {
            id,
            channel: Some(channel),
            state: SessionState::Negotiating,
            connection: ConnectionState::New,
            described: false,
            transport,
            sources: Vec::new(),
            encoder_track: None,
            encoder: EncoderProcess::new(id),
            pipe: None,
            grace: None,
            timers_started: 0,
            last_tick: None,
            ctx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Signaling channel, while it is open
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_described(&self) -> bool {
        self.described
    }

    /// Local and remote descriptions are both set
    pub fn negotiation_finished(&mut self) {
        if self.state != SessionState::Closed {
            self.described = true;
        }
    }

    /// The transport announced a remote track
    pub fn attach_track(&mut self, track: TrackInfo) {
        match track.kind {
            TrackKind::Audio => {
                debug!(session = %self.id, track = %track.id, "Ignoring audio track");
            }
            TrackKind::Video if self.sources.contains(&track.id) => {
                debug!(session = %self.id, track = %track.id, "Video track re-announced, replacing");
            }
            TrackKind::Video if self.encoder_track.is_some() => {
                warn!(session = %self.id, track = %track.id, "Encoder already attached, ignoring additional video track");
            }
            TrackKind::Video => {
                info!(session = %self.id, track = %track.id, "Video track attached");
                self.sources.push(track.id);
            }
        }
    }

    pub fn track_status(&self, track: &TrackId, status: TrackStatus) {
        info!(session = %self.id, %track, ?status, "Track status changed");
    }

    /// Follow the transport's connection state
    pub fn on_connection_state(&mut self, connection: ConnectionState) -> StateChange {
        let previous = std::mem::replace(&mut self.connection, connection);
        debug!(session = %self.id, from = ?previous, to = ?connection, "Transport state changed");

        match (self.state, connection) {
            (SessionState::Closed, _) => StateChange::Unchanged,
            (_, ConnectionState::Closed) => StateChange::Close,
            (SessionState::Active, loss) if loss.is_transient_loss() => {
                warn!(session = %self.id, state = ?loss, "Transport lost, entering grace window");
                self.state = SessionState::Degraded;
                self.arm_grace();
                StateChange::Degraded
            }
            (SessionState::Negotiating, ConnectionState::Failed) => StateChange::Close,
            (SessionState::Negotiating, ConnectionState::Disconnected) => {
                self.arm_grace();
                StateChange::Unchanged
            }
            (SessionState::Negotiating, ConnectionState::Connected) => {
                self.grace = None;
                StateChange::Unchanged
            }
            (SessionState::Degraded, ConnectionState::Connected) => {
                info!(session = %self.id, "Transport reconnected within grace window");
                self.state = SessionState::Active;
                self.grace = None;
                StateChange::Recovered
            }
            _ => StateChange::Unchanged,
        }
    }

    /// Route one decoded frame
    ///
    /// Frames before negotiation completes, while degraded, or from a track that did not
    /// win the encoder are ignored. The first accepted frame starts the encoder with its
    /// dimensions. An error means the encoder can no longer be fed.
    pub fn on_frame(&mut self, track: &TrackId, frame: RawFrame) -> Result<()> {
        match self.state {
            SessionState::Negotiating if !self.described => {
                trace!(session = %self.id, "Frame before negotiation finished, ignoring");
                return Ok(());
            }
            SessionState::Negotiating | SessionState::Active => {}
            SessionState::Degraded | SessionState::Closed => return Ok(()),
        }
        if !self.sources.contains(track) {
            trace!(session = %self.id, %track, "Frame from unattached track, ignoring");
            return Ok(());
        }
        if frame.len() != i420_frame_len(frame.width, frame.height) {
            warn!(session = %self.id, len = frame.len(), width = frame.width, height = frame.height, "Frame size does not match its dimensions, ignoring");
            return Ok(());
        }

        match &self.encoder_track {
            Some(attached) if attached != track => return Ok(()),
            Some(_) => {
                if self.encoder.input_size() != Some((frame.width, frame.height)) {
                    trace!(session = %self.id, "Frame resolution differs from encoder input, ignoring");
                    return Ok(());
                }
            }
            None => self.attach_encoder(track, &frame)?,
        }

        if self.state == SessionState::Negotiating {
            info!(session = %self.id, "Session active");
            self.state = SessionState::Active;
            self.grace = None;
        }

        let Some(pipe) = self.pipe.as_mut() else {
            return Ok(());
        };
        match pipe.push(frame) {
            Delivery::Closed => return Err(BridgeError::encoder_pipe("encoder input closed", None)),
            Delivery::Dropped => trace!(session = %self.id, "Frame dropped, queue full"),
            _ => {}
        }
        self.schedule_drain();
        Ok(())
    }

    /// The armed drain notification fired
    pub fn on_drained(&mut self) -> Result<()> {
        let Some(pipe) = self.pipe.as_mut() else {
            return Ok(());
        };
        pipe.on_drained();
        if pipe.is_closed() {
            return Err(BridgeError::encoder_pipe("encoder input closed", None));
        }
        self.schedule_drain();
        Ok(())
    }

    pub fn on_throughput(&mut self, ratio: f64) {
        if let Some(pipe) = self.pipe.as_mut() {
            pipe.set_throughput(ratio);
        }
    }

    /// The signaling channel went away
    ///
    /// An active session keeps running on transport liveness alone; one that is still
    /// negotiating or already degraded starts (or keeps) its grace window.
    pub fn detach_channel(&mut self) {
        self.channel = None;
        match self.state {
            SessionState::Negotiating | SessionState::Degraded => self.arm_grace(),
            SessionState::Active => {
                debug!(session = %self.id, "Signaling channel gone, session keeps running")
            }
            SessionState::Closed => {}
        }
    }

    /// A grace timer fired; returns whether the session must now close
    pub fn on_grace_expired(&mut self, timer: u64) -> bool {
        if self.grace.as_ref().map(GraceTimer::id) != Some(timer) {
            trace!(session = %self.id, timer, "Ignoring stale grace expiry");
            return false;
        }
        self.grace = None;
        matches!(self.state, SessionState::Negotiating | SessionState::Degraded)
    }

    /// Release everything the session holds
    ///
    /// Cancels the grace timer, detaches frame sources, releases the pipe (half-closing
    /// the encoder's input), closes the transport and begins the encoder stop. Returns the
    /// handle resolving once the encoder has exited, if one was running.
    pub fn close(&mut self) -> Option<JoinHandle<ExitReport>> {
        if self.state == SessionState::Closed {
            return None;
        }
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);

        self.grace = None;
        self.sources.clear();
        self.encoder_track = None;
        if let Some(pipe) = self.pipe.take() {
            debug!(session = %self.id, stats = ?pipe.stats(), "Frame pipe released");
        }

        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move { transport.close().await });

        let stopping = self.encoder.stop();
        info!(session = %self.id, from = ?previous, "Session closed");
        stopping
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            channel: self.channel,
            state: self.state,
            connection: self.connection,
            encoder: self.encoder.state(),
            encoder_pid: self.encoder.pid(),
            input_size: self.encoder.input_size(),
            grace_pending: self.grace.is_some(),
            pipe: self.pipe.as_ref().map(FramePipe::stats),
        }
    }

    /// Pipe counters plus the input frame rate since the previous tick
    pub fn stats_tick(&mut self, now: Instant) -> Option<(PipeStats, f64)> {
        let stats = self.pipe.as_ref()?.stats();
        let fps = match self.last_tick.replace((now, stats.produced)) {
            Some((at, produced)) => {
                let secs = now.duration_since(at).as_secs_f64();
                if secs > 0.0 { stats.produced.saturating_sub(produced) as f64 / secs } else { 0.0 }
            }
            None => 0.0,
        };
        Some((stats, fps))
    }

    fn attach_encoder(&mut self, track: &TrackId, frame: &RawFrame) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let notify = self.encoder_notify();
        let sink = self.encoder.start(
            ctx.launcher.as_ref(),
            frame.width,
            frame.height,
            ctx.config.pipe.write_queue,
            ctx.config.encoder.stop_timeout(),
            notify,
        )?;
        if let Some(sink) = sink {
            self.pipe = Some(FramePipe::new(sink, &ctx.config.pipe));
        }

        self.encoder_track = Some(track.clone());
        self.sources.retain(|source| source == track);
        info!(session = %self.id, %track, width = frame.width, height = frame.height, "Encoder attached");
        Ok(())
    }

    fn encoder_notify(&self) -> EncoderNotify {
        let core = self.ctx.core.clone();
        let session = self.id;
        Arc::new(move |event: EncoderEvent| {
            let _ = core.send(BridgeEvent::Encoder { session, event });
        })
    }

    fn schedule_drain(&mut self) {
        let Some(signal) = self.pipe.as_mut().and_then(FramePipe::arm_drain) else {
            return;
        };
        let core = self.ctx.core.clone();
        let session = self.id;
        tokio::spawn(async move {
            signal.await;
            let _ = core.send(BridgeEvent::PipeDrained { session });
        });
    }

    fn arm_grace(&mut self) {
        if self.grace.is_some() {
            return;
        }
        self.timers_started += 1;
        let timer = self.timers_started;
        let window = self.ctx.config.session.grace_window();
        let core = self.ctx.core.clone();
        let session = self.id;

        debug!(session = %self.id, ?window, "Grace window started");
        self.grace = Some(GraceTimer::start(timer, window, move || {
            let _ = core.send(BridgeEvent::GraceExpired { session, timer });
        }));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_utils::{MockTransport, ShellLauncher};
    use crate::transport::TransportEvents;
    use std::time::Duration;

    pub(crate) fn context(
        launcher: ShellLauncher,
    ) -> (Arc<SessionContext>, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (core, events) = mpsc::unbounded_channel();
        let mut config = BridgeConfig::default();
        config.session.grace_window_ms = 1_000;
        config.pipe.decimation = 1;
        (Arc::new(SessionContext { config, launcher: Arc::new(launcher), core }), events)
    }

    pub(crate) fn session(ctx: &Arc<SessionContext>, id: u64) -> (Session, Arc<MockTransport>) {
        let id = SessionId::new(id);
        let transport = Arc::new(MockTransport::new(TransportEvents::new(id, ctx.core.clone(), ctx.config.pipe.pending_frames)));
        let handle: Arc<dyn Transport> = transport.clone();
        (Session::new(id, ChannelId::new(id.as_u64()), handle, Arc::clone(ctx)), transport)
    }

    fn video() -> TrackId {
        TrackId::new("video0")
    }

    #[tokio::test]
    async fn frames_before_negotiation_are_ignored() {
        let (ctx, _events) = context(ShellLauncher::new("cat > /dev/null"));
        let (mut session, _) = session(&ctx, 1);
        session.attach_track(TrackInfo::video("video0"));

        session.on_frame(&video(), RawFrame::blank_i420(4, 4)).unwrap();
        assert_eq!(session.state(), SessionState::Negotiating);
        assert_eq!(session.snapshot().encoder, EncoderState::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn loss_before_first_frame_starts_grace() {
        let (ctx, mut events) = context(ShellLauncher::new("cat > /dev/null"));
        let (mut session, _) = session(&ctx, 1);

        assert_eq!(session.on_connection_state(ConnectionState::Disconnected), StateChange::Unchanged);
        assert!(session.snapshot().grace_pending);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let Some(BridgeEvent::GraceExpired { session: id, timer }) = events.recv().await else {
            panic!("grace timer should fire");
        };
        assert_eq!(id, session.id());
        assert!(session.on_grace_expired(timer));
        assert!(!session.on_grace_expired(timer), "second expiry is stale");
    }

    #[tokio::test(start_paused = true)]
    async fn channel_close_while_negotiating_arms_one_timer() {
        let (ctx, _events) = context(ShellLauncher::new("cat > /dev/null"));
        let (mut session, _) = session(&ctx, 1);

        session.detach_channel();
        assert_eq!(session.channel(), None);
        assert!(session.snapshot().grace_pending);

        // Still one timer: the first one's id keeps winning
        session.on_connection_state(ConnectionState::Disconnected);
        assert!(session.on_grace_expired(1));
        assert!(!session.on_grace_expired(2));
    }

    #[tokio::test]
    async fn failed_while_negotiating_closes() {
        let (ctx, _events) = context(ShellLauncher::new("cat > /dev/null"));
        let (mut session, transport) = session(&ctx, 1);

        assert_eq!(session.on_connection_state(ConnectionState::Failed), StateChange::Close);
        assert!(session.close().is_none(), "no encoder was running");
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.close().is_none());

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(transport.is_closed());
    }

    #[test]
    fn audio_and_extra_video_tracks_do_not_become_sources() {
        let (core, _events) = mpsc::unbounded_channel();
        let ctx = Arc::new(SessionContext {
            config: BridgeConfig::default(),
            launcher: Arc::new(ShellLauncher::new("true")),
            core,
        });
        let (mut session, _) = session(&ctx, 7);

        session.attach_track(TrackInfo::audio("audio0"));
        session.attach_track(TrackInfo::video("video0"));
        session.attach_track(TrackInfo::video("video0"));
        session.attach_track(TrackInfo::video("video1"));
        assert_eq!(session.sources, vec![TrackId::new("video0"), TrackId::new("video1")]);

        session.encoder_track = Some(TrackId::new("video0"));
        session.attach_track(TrackInfo::video("video2"));
        assert_eq!(session.sources.len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn degraded_session_recovers_with_same_encoder() {
        let (ctx, _events) = context(ShellLauncher::new("cat > /dev/null"));
        let (mut session, _) = session(&ctx, 1);
        session.negotiation_finished();
        session.attach_track(TrackInfo::video("video0"));

        session.on_frame(&video(), RawFrame::blank_i420(4, 4)).unwrap();
        assert_eq!(session.state(), SessionState::Active);
        let pid = session.snapshot().encoder_pid;
        assert!(pid.is_some());

        assert_eq!(session.on_connection_state(ConnectionState::Disconnected), StateChange::Degraded);
        session.on_frame(&video(), RawFrame::blank_i420(4, 4)).unwrap();
        assert_eq!(session.snapshot().pipe.unwrap().produced, 1, "degraded sessions take no frames");

        assert_eq!(session.on_connection_state(ConnectionState::Connected), StateChange::Recovered);
        assert_eq!(session.state(), SessionState::Active);
        assert!(!session.snapshot().grace_pending);
        assert_eq!(session.snapshot().encoder_pid, pid);

        let report = session.close().expect("encoder was running").await.unwrap();
        assert!(report.requested);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stats_tick_reports_input_rate() {
        let (ctx, _events) = context(ShellLauncher::new("cat > /dev/null"));
        let (mut session, _) = session(&ctx, 1);
        assert!(session.stats_tick(Instant::now()).is_none());

        session.negotiation_finished();
        session.attach_track(TrackInfo::video("video0"));
        let start = Instant::now();
        for _ in 0..10 {
            session.on_frame(&video(), RawFrame::blank_i420(4, 4)).unwrap();
        }
        let (stats, fps) = session.stats_tick(start).unwrap();
        assert_eq!(stats.produced, 10);
        assert_eq!(fps, 0.0);

        for _ in 0..5 {
            session.on_frame(&video(), RawFrame::blank_i420(4, 4)).unwrap();
        }
        let (_, fps) = session.stats_tick(start + Duration::from_secs(1)).unwrap();
        assert_eq!(fps, 5.0);

        session.close();
    }
}
