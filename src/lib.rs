//! WebRTC-to-HLS ingest bridge.
//!
//! Browsers publish a live camera stream over WebRTC; the bridge hands the decoded video
//! frames to an external `ffmpeg` process that writes a rolling HLS playlist and segments.
//!
//! # Architecture
//!
//! - **Signaling** ([`signaling`]): one WebSocket per client carrying `offer`,
//!   `answer` and `ice-candidate` JSON messages.
//! - **Driver** ([`driver`]): a single event-driven core task that owns every session
//!   and reacts to signaling, transport callbacks, timers and encoder reports.
//! - **Sessions** ([`session`]): one per negotiated connection, with a
//!   `Negotiating → Active → Degraded → Closed` lifecycle and a grace window that keeps
//!   the encoder alive across short transport losses.
//! - **Frame pipe** ([`pipe`]): decimation, a bounded queue and a direct/buffered
//!   backpressure controller between frame callbacks and the encoder.
//! - **Encoder** ([`encoder`]): spawns, monitors and stops the encoding subprocess.
//!
//! The media transport itself (ICE, DTLS/SRTP, decoding) is supplied by the caller through
//! the [`Transport`] and [`TransportFactory`] traits.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hlsbridge::{Bridge, BridgeConfig, IceCandidate, Transport, TransportEvents, TransportFactory};
//!
//! struct MyTransport;
//!
//! #[async_trait::async_trait]
//! impl Transport for MyTransport {
//!     async fn negotiate(&self, offer_sdp: String) -> hlsbridge::Result<String> {
//!         todo!("apply the offer, return the answer")
//!     }
//!     async fn add_remote_candidate(&self, _candidate: IceCandidate) -> hlsbridge::Result<()> {
//!         Ok(())
//!     }
//!     async fn close(&self) {}
//! }
//!
//! struct MyFactory;
//!
//! impl TransportFactory for MyFactory {
//!     fn create(
//!         &self,
//!         _session: hlsbridge::SessionId,
//!         _events: TransportEvents,
//!     ) -> hlsbridge::Result<Arc<dyn Transport>> {
//!         Ok(Arc::new(MyTransport))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> hlsbridge::Result<()> {
//!     hlsbridge::init_tracing();
//!     let config = BridgeConfig::load("bridge.yaml")?;
//!     Bridge::new(config, Arc::new(MyFactory)).run_until_shutdown().await
//! }
//! ```

pub mod config;
pub mod driver;
pub mod encoder;
mod error;
pub mod pipe;
pub mod session;
pub mod signaling;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod transport;
pub mod types;

pub use config::BridgeConfig;
pub use driver::{Driver, DriverHandle, SpawnedDriver};
pub use encoder::{EncoderLauncher, FfmpegLauncher};
pub use error::*;
pub use session::{SessionSnapshot, SessionState};
pub use signaling::SignalingServer;
pub use transport::{Transport, TransportEvents, TransportFactory};
pub use types::*;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`)
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Entry point wiring configuration, transport and encoder together
pub struct Bridge {
    config: BridgeConfig,
    transports: Arc<dyn TransportFactory>,
    launcher: Arc<dyn EncoderLauncher>,
}

impl Bridge {
    /// Bridge encoding with `ffmpeg` as configured
    pub fn new(config: BridgeConfig, transports: Arc<dyn TransportFactory>) -> Self {
        let launcher = Arc::new(FfmpegLauncher::new(config.encoder.clone()));
        Self { config, transports, launcher }
    }

    /// Replace the encoder launcher
    pub fn with_launcher(mut self, launcher: Arc<dyn EncoderLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Start the core and the signaling listener
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the listener cannot bind.
    pub async fn start(self) -> Result<RunningBridge> {
        self.config.validate()?;

        let signaling = self.config.signaling.clone();
        let SpawnedDriver { handle, task } = Driver::spawn(self.config, self.transports, self.launcher);

        let server = match SignalingServer::bind(&signaling, handle.clone()).await {
            Ok(server) => server,
            Err(e) => {
                let _ = handle.shutdown().await;
                let _ = task.await;
                return Err(e);
            }
        };
        let addr = server.local_addr()?;
        let cancel = CancellationToken::new();
        let server = tokio::spawn(server.run(cancel.clone()));

        info!(%addr, "Bridge running");
        Ok(RunningBridge { addr, driver: handle, driver_task: task, server, server_done: false, cancel })
    }

    /// Run until Ctrl-C or SIGTERM, then shut down in order
    pub async fn run_until_shutdown(self) -> Result<()> {
        self.serve(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves or the listener fails, then shut down in order
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?.run_until(shutdown).await
    }
}

/// A started bridge
#[derive(Debug)]
pub struct RunningBridge {
    addr: SocketAddr,
    driver: DriverHandle,
    driver_task: JoinHandle<()>,
    server: JoinHandle<Result<()>>,
    server_done: bool,
    cancel: CancellationToken,
}

impl RunningBridge {
    /// Address the signaling listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn driver(&self) -> &DriverHandle {
        &self.driver
    }

    /// Wait for `shutdown` or a listener failure, then shut down
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            _ = shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
            result = &mut self.server => {
                self.server_done = true;
                let result = flatten(result);
                if let Err(e) = &result {
                    warn!(error = %e, "Signaling server failed, shutting down");
                }
                result
            }
        };
        self.finish(outcome).await
    }

    /// Stop accepting, close every session and wait for every encoder to exit
    pub async fn shutdown(self) -> Result<()> {
        self.finish(Ok(())).await
    }

    async fn finish(self, outcome: Result<()>) -> Result<()> {
        self.cancel.cancel();
        let server = if self.server_done { Ok(()) } else { flatten(self.server.await) };

        if let Err(e) = self.driver.shutdown().await {
            warn!(error = %e, "Bridge core already stopped");
        }
        if let Err(e) = self.driver_task.await {
            warn!(error = %e, "Bridge core task failed");
        }

        info!("Bridge stopped");
        outcome.and(server)
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| BridgeError::io("signaling server task", std::io::Error::other(e)))?
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
