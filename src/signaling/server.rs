//! WebSocket listener for signaling channels

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::relay::handle_connection;
use crate::config::SignalingConfig;
use crate::driver::DriverHandle;
use crate::{BridgeError, Result};

/// Accepts WebSocket connections and runs one relay task per connection
#[derive(Debug)]
pub struct SignalingServer {
    listener: TcpListener,
    driver: DriverHandle,
    outbound_queue: usize,
}

impl SignalingServer {
    /// Bind the configured listen address
    pub async fn bind(config: &SignalingConfig, driver: DriverHandle) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|e| BridgeError::io(format!("binding signaling listener {}", config.listen), e))?;
        Ok(Self { listener, driver, outbound_queue: config.outbound_queue })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(|e| BridgeError::io("reading listener address", e))
    }

    /// Accept connections until `cancel` fires
    ///
    /// Transient accept failures are retried with backoff; a run of consecutive failures
    /// is returned as an error.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        const MAX_ERRORS: u32 = 10;
        let mut error_count = 0u32;
        let mut connections = JoinSet::new();

        info!(addr = ?self.listener.local_addr().ok(), "Signaling server listening");

        let result = loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                accepted = self.listener.accept() => accepted,
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    match finished {
                        Ok(Err(e)) => debug!(error = %e, "Signaling connection ended with error"),
                        Err(e) if e.is_panic() => error!(error = %e, "Signaling relay panicked"),
                        _ => {}
                    }
                    continue;
                }
            };

            match accepted {
                Ok((stream, peer)) => {
                    error_count = 0;
                    debug!(%peer, "Accepted signaling connection");
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        self.driver.clone(),
                        self.outbound_queue,
                    ));
                }
                Err(e) => {
                    error_count += 1;
                    warn!(error = %e, error_count, "Failed to accept signaling connection");
                    if error_count >= MAX_ERRORS {
                        break Err(BridgeError::io("accepting signaling connections", e));
                    }
                    let backoff = Duration::from_millis(10 * 2u64.pow(error_count.min(6)));
                    tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        };

        connections.shutdown().await;
        info!("Signaling server stopped");
        result
    }
}
