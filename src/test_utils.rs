//! Test utilities shared by unit tests and benchmarks
//!
//! Scripted stand-ins for the three external seams of the bridge: the encoder sink, the
//! encoder launcher and the media transport.

#![cfg(any(test, feature = "benchmark"))]

use futures::FutureExt;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::Command;

use crate::encoder::EncoderLauncher;
use crate::pipe::{DrainSignal, EncoderSink, WriteOutcome};
use crate::transport::{Transport, TransportEvents, TransportFactory};
use crate::types::{
    ConnectionState, IceCandidate, RawFrame, SequencedFrame, SessionId, TrackId, TrackInfo,
};
use crate::{BridgeError, Result};

#[derive(Debug, Default)]
struct SinkScript {
    written: Vec<u64>,
    blocked: bool,
    bounce_next: bool,
    bounce_seqs: BTreeSet<u64>,
    closed: bool,
}

/// [`EncoderSink`] whose answers are scripted through a [`SinkControl`]
///
/// Drain notifications resolve immediately; tests decide when to deliver them.
#[derive(Debug)]
pub struct ScriptedSink {
    script: Arc<Mutex<SinkScript>>,
}

/// Test-side handle of a [`ScriptedSink`]
#[derive(Debug, Clone)]
pub struct SinkControl {
    script: Arc<Mutex<SinkScript>>,
}

impl ScriptedSink {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (ScriptedSink, SinkControl) {
        let script = Arc::new(Mutex::new(SinkScript::default()));
        (ScriptedSink { script: Arc::clone(&script) }, SinkControl { script })
    }
}

impl EncoderSink for ScriptedSink {
    fn try_write(&mut self, frame: SequencedFrame) -> WriteOutcome {
        let mut script = self.script.lock().unwrap();
        if script.closed {
            return WriteOutcome::Closed(frame);
        }
        if script.blocked {
            return WriteOutcome::Backpressure(frame);
        }
        if std::mem::take(&mut script.bounce_next) || script.bounce_seqs.remove(&frame.seq) {
            return WriteOutcome::Backpressure(frame);
        }
        script.written.push(frame.seq);
        WriteOutcome::Written
    }

    fn drained(&self) -> DrainSignal {
        futures::future::ready(()).boxed()
    }
}

impl SinkControl {
    /// Sequence numbers accepted so far, in write order
    pub fn written(&self) -> Vec<u64> {
        self.script.lock().unwrap().written.clone()
    }

    /// Reject every write with backpressure while set
    pub fn set_blocked(&self, blocked: bool) {
        self.script.lock().unwrap().blocked = blocked;
    }

    /// Reject the first write attempt of frame `seq` once
    pub fn backpressure_on(&self, seq: u64) {
        self.script.lock().unwrap().bounce_seqs.insert(seq);
    }

    /// Reject the next write attempt once
    pub fn bounce_next(&self) {
        self.script.lock().unwrap().bounce_next = true;
    }

    /// Close the sink for good
    pub fn close(&self) {
        self.script.lock().unwrap().closed = true;
    }
}

/// Launches `sh -c <script>` in place of a real encoder
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    script: String,
}

impl ShellLauncher {
    pub fn new(script: impl Into<String>) -> Self {
        Self { script: script.into() }
    }
}

impl EncoderLauncher for ShellLauncher {
    fn program(&self) -> String {
        "sh".to_string()
    }

    fn command(&self, _session: SessionId, _width: u32, _height: u32) -> Result<Command> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(&self.script);
        Ok(command)
    }
}

/// Transport that records what the bridge asks of it
///
/// Offers containing `"reject"` fail negotiation. Events are pushed into the bridge with
/// the `emit_*` helpers.
#[derive(Debug)]
pub struct MockTransport {
    events: TransportEvents,
    offers: Mutex<Vec<String>>,
    candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new(events: TransportEvents) -> Self {
        Self {
            events,
            offers: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> SessionId {
        self.events.session()
    }

    pub fn offers(&self) -> Vec<String> {
        self.offers.lock().unwrap().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit_state(&self, state: ConnectionState) {
        self.events.connection_state(state);
    }

    pub fn emit_track(&self, track: TrackInfo) {
        self.events.track(track);
    }

    pub fn emit_frame(&self, track: &str, frame: RawFrame) {
        self.events.frame(&TrackId::new(track), frame);
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        self.events.local_candidate(candidate);
    }
}

/// Answer returned by [`MockTransport`] for a given session
pub fn mock_answer(session: SessionId) -> String {
    format!("v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns=answer\r\n", session.as_u64())
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn negotiate(&self, offer_sdp: String) -> Result<String> {
        let rejected = offer_sdp.contains("reject");
        self.offers.lock().unwrap().push(offer_sdp);
        if rejected {
            return Err(BridgeError::transport("remote description rejected"));
        }
        Ok(mock_answer(self.session()))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory handing out [`MockTransport`]s and remembering them
#[derive(Debug, Clone, Default)]
pub struct MockTransportFactory {
    created: Arc<Mutex<Vec<Arc<MockTransport>>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transports created so far, oldest first
    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().unwrap().last().cloned()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, _session: SessionId, events: TransportEvents) -> Result<Arc<dyn Transport>> {
        let transport = Arc::new(MockTransport::new(events));
        self.created.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}
