//! Per-connection signaling relay
//!
//! One task per WebSocket connection. It registers the connection with the bridge core as
//! a signaling channel, forwards validated client messages to the core, and writes the
//! core's outbound messages back to the socket.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use super::{ClientMessage, ServerMessage, SignalError};
use crate::Result;
use crate::driver::DriverHandle;
use crate::types::ChannelId;

/// Serve one accepted connection until either side closes it
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    driver: DriverHandle,
    outbound_queue: usize,
) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (tx, mut rx) = mpsc::channel::<ServerMessage>(outbound_queue.max(1));
    let channel = driver.open_channel(tx)?;
    info!(%channel, %peer, "Signaling channel opened");

    loop {
        tokio::select! {
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => relay_inbound(&driver, channel, &text),
                // tungstenite queues the Pong itself and flushes it on the next read
                Some(Ok(Message::Ping(_))) => trace!(%channel, "Ping received"),
                Some(Ok(Message::Close(_))) => {
                    info!(%channel, %peer, "Signaling channel closed by client");
                    break;
                }
                Some(Ok(_)) => trace!(%channel, "Ignoring non-text WebSocket message"),
                Some(Err(e)) => {
                    warn!(%channel, error = %e, "WebSocket error");
                    break;
                }
                None => break,
            },
            outgoing = rx.recv() => {
                // The core dropped its sender: the bridge is shutting down
                let Some(message) = outgoing else { break };
                let json = match message.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(%channel, error = %e, "Failed to encode signaling message");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(json)).await {
                    warn!(%channel, error = %e, "Failed to send signaling message");
                    break;
                }
            }
        }
    }

    driver.close_channel(channel);
    let _ = ws_tx.close().await;
    debug!(%channel, "Signaling relay finished");
    Ok(())
}

fn relay_inbound(driver: &DriverHandle, channel: ChannelId, text: &str) {
    match ClientMessage::parse(text) {
        Ok(message) => {
            trace!(%channel, kind = message.kind(), "Signaling message received");
            if driver.signal(channel, message).is_err() {
                debug!(%channel, "Bridge core gone, dropping signaling message");
            }
        }
        Err(SignalError::UnknownType(kind)) => {
            warn!(%channel, %kind, "Unknown message type received");
        }
        Err(e) => warn!(%channel, error = %e, "Dropping invalid signaling message"),
    }
}
