//! Encoder process manager
//!
//! Owns one external encoding subprocess per session. Starting is lazy (first frame) and
//! idempotent; the subprocess is fed through a [`ChannelSink`] whose receiving end is a
//! writer task holding the child's stdin.
//!
//! Three tasks run per encoder:
//! - the **writer** moves frames from the sink channel into stdin,
//! - the **monitor** scans stderr for throughput and logs errors and warnings,
//! - the **supervisor** owns the child, reports unexpected exits, and performs the stop
//!   sequence: half-close stdin, SIGINT, then a forced kill once the timeout elapses.
//!
//! None of these are awaited by the caller. Everything they observe is reported through
//! the [`EncoderNotify`] callback.

mod args;
mod progress;

pub use args::hls_args;
pub use progress::{LineKind, ProgressScanner, classify, parse_speed};

use serde::Serialize;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::EncoderConfig;
use crate::pipe::{ChannelSink, FrameReceiver, frame_channel};
use crate::types::SessionId;
use crate::{BridgeError, Result};

/// Callback receiving everything the encoder tasks observe
pub type EncoderNotify = Arc<dyn Fn(EncoderEvent) + Send + Sync>;

/// Builds the subprocess command for a given input size
pub trait EncoderLauncher: Send + Sync + 'static {
    /// Program name used in logs and spawn errors
    fn program(&self) -> String;

    /// Prepare `session`'s command for raw frames of `width`x`height` on stdin
    fn command(&self, session: SessionId, width: u32, height: u32) -> Result<Command>;
}

/// Launches ffmpeg writing an HLS playlist and segments
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    config: EncoderConfig,
}

impl FfmpegLauncher {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }
}

impl EncoderLauncher for FfmpegLauncher {
    fn program(&self) -> String {
        self.config.program.display().to_string()
    }

    fn command(&self, session: SessionId, width: u32, height: u32) -> Result<Command> {
        let output_dir = self.config.session_dir(session);
        if !output_dir.exists() {
            info!(%session, dir = %output_dir.display(), "Creating HLS output directory");
        }
        std::fs::create_dir_all(&output_dir).map_err(|e| {
            BridgeError::io(format!("creating output directory {}", output_dir.display()), e)
        })?;

        let mut command = Command::new(&self.config.program);
        command.args(hls_args(&self.config, session, width, height));
        Ok(command)
    }
}

/// Lifecycle of the encoder subprocess
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderState {
    Absent,
    Starting,
    Running,
    Stopping,
}

/// Observations reported by the encoder tasks
#[derive(Debug, Clone)]
pub enum EncoderEvent {
    /// Encoding speed relative to real time
    Throughput(f64),
    /// Writing to stdin failed; the encoder can no longer be fed
    PipeError(String),
    /// The subprocess exited without being asked to
    Exited(ExitReport),
}

/// How the subprocess ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit status, if it could be collected
    pub status: Option<ExitStatus>,
    /// Exit followed a stop request
    pub requested: bool,
    /// The process ignored SIGINT and was killed
    pub forced: bool,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }

    pub fn describe(&self) -> String {
        match self.status {
            Some(status) => status.to_string(),
            None => "unknown status".to_string(),
        }
    }
}

/// Handle to one encoder subprocess and its tasks
#[derive(Debug)]
pub struct EncoderProcess {
    session: SessionId,
    state: EncoderState,
    pid: Option<u32>,
    input_size: Option<(u32, u32)>,
    stop: CancellationToken,
    supervisor: Option<JoinHandle<ExitReport>>,
}

impl EncoderProcess {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            state: EncoderState::Absent,
            pid: None,
            input_size: None,
            stop: CancellationToken::new(),
            supervisor: None,
        }
    }

    /// Spawn the subprocess for frames of `width`x`height`
    ///
    /// Returns the sink feeding its stdin, or `None` if an encoder was already started
    /// for this handle (starting twice is a no-op).
    pub fn start(
        &mut self,
        launcher: &dyn EncoderLauncher,
        width: u32,
        height: u32,
        write_queue: usize,
        stop_timeout: Duration,
        notify: EncoderNotify,
    ) -> Result<Option<ChannelSink>> {
        if self.state != EncoderState::Absent {
            debug!(state = ?self.state, "Encoder already started");
            return Ok(None);
        }

        self.state = EncoderState::Starting;
        match self.spawn(launcher, width, height, write_queue, stop_timeout, notify) {
            Ok(sink) => {
                self.state = EncoderState::Running;
                Ok(Some(sink))
            }
            Err(e) => {
                self.state = EncoderState::Absent;
                Err(e)
            }
        }
    }

    fn spawn(
        &mut self,
        launcher: &dyn EncoderLauncher,
        width: u32,
        height: u32,
        write_queue: usize,
        stop_timeout: Duration,
        notify: EncoderNotify,
    ) -> Result<ChannelSink> {
        let program = launcher.program();
        let mut command = launcher.command(self.session, width, height)?;
        command.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::piped());
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| BridgeError::encoder_spawn(&program, e))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::encoder_pipe("stdin was not captured", None))?;
        let stderr = child.stderr.take();

        self.pid = child.id();
        self.input_size = Some((width, height));
        info!(session = %self.session, pid = ?self.pid, %program, width, height, "Encoder process spawned");

        let (sink, frames) = frame_channel(write_queue);
        let writer = tokio::spawn(write_frames(stdin, frames, self.stop.clone(), notify.clone()));
        if let Some(stderr) = stderr {
            tokio::spawn(monitor_diagnostics(stderr, notify.clone()));
        }
        self.supervisor =
            Some(tokio::spawn(supervise(child, writer, self.stop.clone(), stop_timeout, notify)));

        Ok(sink)
    }

    /// Begin the stop sequence
    ///
    /// Returns a handle resolving to the exit report once the process is gone, or `None`
    /// if no process was ever spawned. The caller is never required to await it.
    pub fn stop(&mut self) -> Option<JoinHandle<ExitReport>> {
        if self.state == EncoderState::Absent {
            return None;
        }
        info!(pid = ?self.pid, "Stopping encoder process");
        self.state = EncoderState::Stopping;
        self.stop.cancel();
        self.supervisor.take()
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn input_size(&self) -> Option<(u32, u32)> {
        self.input_size
    }
}

/// Move frames from the sink channel into stdin until stopped or the channel closes
///
/// Returning drops stdin, which is how the encoder learns there is no more input.
async fn write_frames(
    mut stdin: ChildStdin,
    mut frames: FrameReceiver,
    stop: CancellationToken,
    notify: EncoderNotify,
) {
    let mut written = 0u64;

    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = stop.cancelled() => break,
            result = stdin.write_all(&frame.frame.data) => result,
        };

        match result {
            Ok(()) => {
                written += 1;
                trace!(seq = frame.seq, "Frame written to encoder");
                frames.notify_if_drained();
            }
            Err(e) => {
                warn!(error = %e, "Encoder stdin write failed");
                notify(EncoderEvent::PipeError(e.to_string()));
                break;
            }
        }
    }

    debug!(written, "Encoder stdin closed");
}

/// Scan stderr for throughput figures and noteworthy lines
async fn monitor_diagnostics(mut stderr: ChildStderr, notify: EncoderNotify) {
    let mut scanner = ProgressScanner::new();
    let mut buf = vec![0u8; 4096];

    let handle = |line: &str| {
        if let Some(speed) = parse_speed(line) {
            notify(EncoderEvent::Throughput(speed));
        }
        match classify(line) {
            LineKind::Error | LineKind::Warning => warn!("Encoder: {}", line),
            LineKind::Other => trace!("Encoder: {}", line),
        }
    };

    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in scanner.feed(&buf[..n]) {
                    handle(&line);
                }
            }
            Err(e) => {
                debug!(error = %e, "Encoder diagnostic stream read failed");
                break;
            }
        }
    }

    if let Some(line) = scanner.finish() {
        handle(&line);
    }
}

/// Own the child: report unexpected exits, or run the stop sequence when asked
async fn supervise(
    mut child: Child,
    writer: JoinHandle<()>,
    stop: CancellationToken,
    stop_timeout: Duration,
    notify: EncoderNotify,
) -> ExitReport {
    let pid = child.id();

    tokio::select! {
        status = child.wait() => {
            // Also covers a stop request racing with an exit caused by closing stdin
            let requested = stop.is_cancelled();
            stop.cancel();
            let report = ExitReport { status: status.ok(), requested, forced: false };
            if requested {
                info!(?pid, status = %report.describe(), "Encoder process exited");
            } else {
                error!(?pid, status = %report.describe(), "Encoder process exited unexpectedly");
                notify(EncoderEvent::Exited(report.clone()));
            }
            let _ = writer.await;
            return report;
        }
        _ = stop.cancelled() => {}
    }

    // Half-close first so a well-behaved encoder can finish the last segment
    let _ = writer.await;
    interrupt(&mut child);

    match tokio::time::timeout(stop_timeout, child.wait()).await {
        Ok(status) => {
            let report = ExitReport { status: status.ok(), requested: true, forced: false };
            info!(?pid, status = %report.describe(), "Encoder process exited");
            report
        }
        Err(_) => {
            warn!(?pid, timeout = ?stop_timeout, "Encoder ignored interrupt, killing");
            if let Err(e) = child.start_kill() {
                warn!(?pid, error = %e, "Failed to kill encoder process");
            }
            let status = child.wait().await.ok();
            ExitReport { status, requested: true, forced: true }
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            debug!(pid, error = %e, "Failed to interrupt encoder");
        }
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    // No graceful signal available; the timeout path still bounds the wait
    let _ = child.start_kill();
}
