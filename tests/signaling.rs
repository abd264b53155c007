//! End-to-end signaling over a real WebSocket connection

use futures_util::{SinkExt, StreamExt};
use hlsbridge::{
    Bridge, BridgeConfig, DriverHandle, IceCandidate, RunningBridge, SessionId, SessionSnapshot,
    Transport, TransportEvents, TransportFactory,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct AnsweringTransport;

#[async_trait::async_trait]
impl Transport for AnsweringTransport {
    async fn negotiate(&self, offer_sdp: String) -> hlsbridge::Result<String> {
        Ok(format!("answer to {offer_sdp}"))
    }

    async fn add_remote_candidate(&self, _candidate: IceCandidate) -> hlsbridge::Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

/// Keeps each session's callback handle so tests can play the transport's part
#[derive(Clone, Default)]
struct Factory {
    events: Arc<Mutex<Vec<TransportEvents>>>,
}

impl TransportFactory for Factory {
    fn create(
        &self,
        _session: SessionId,
        events: TransportEvents,
    ) -> hlsbridge::Result<Arc<dyn Transport>> {
        self.events.lock().unwrap().push(events);
        Ok(Arc::new(AnsweringTransport))
    }
}

async fn start() -> anyhow::Result<(RunningBridge, Factory)> {
    let _ = tracing_subscriber::fmt::try_init();

    let mut config = BridgeConfig::default();
    config.signaling.listen = "127.0.0.1:0".parse()?;
    config.encoder.output_dir = std::env::temp_dir().join("hlsbridge-signaling-tests");

    let factory = Factory::default();
    let running = Bridge::new(config, Arc::new(factory.clone())).start().await?;
    Ok((running, factory))
}

async fn connect(running: &RunningBridge) -> anyhow::Result<Client> {
    let (client, _) = connect_async(format!("ws://{}", running.local_addr())).await?;
    Ok(client)
}

async fn next_message(client: &mut Client) -> anyhow::Result<Message> {
    let message = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("connection closed"))??;
    Ok(message)
}

async fn next_json(client: &mut Client) -> anyhow::Result<Value> {
    loop {
        if let Message::Text(text) = next_message(client).await? {
            return Ok(serde_json::from_str(&text)?);
        }
    }
}

async fn send_json(client: &mut Client, value: Value) -> anyhow::Result<()> {
    client.send(Message::Text(value.to_string())).await?;
    Ok(())
}

async fn wait_for<F>(driver: &DriverHandle, predicate: F) -> anyhow::Result<Vec<SessionSnapshot>>
where
    F: Fn(&[SessionSnapshot]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshots = driver.snapshot().await?;
        if predicate(&snapshots) {
            return Ok(snapshots);
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn offer_is_answered() -> anyhow::Result<()> {
    let (running, _) = start().await?;
    let mut client = connect(&running).await?;

    send_json(&mut client, json!({ "type": "offer", "sdp": "v=0 offer" })).await?;
    let answer = next_json(&mut client).await?;
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["sdp"], "answer to v=0 offer");

    let snapshots = running.driver().snapshot().await?;
    assert_eq!(snapshots.len(), 1);

    running.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn invalid_messages_keep_the_channel_open() -> anyhow::Result<()> {
    let (running, factory) = start().await?;
    let mut client = connect(&running).await?;

    client.send(Message::Text("{not json".to_string())).await?;
    send_json(&mut client, json!({ "type": "bye" })).await?;
    send_json(&mut client, json!({ "type": "offer" })).await?;
    send_json(&mut client, json!({ "type": "offer", "sdp": "" })).await?;
    send_json(&mut client, json!({ "type": "ice-candidate", "candidate": { "candidate": "candidate:1" } }))
        .await?;
    client.send(Message::Binary(vec![1, 2, 3])).await?;

    client.send(Message::Ping(vec![7])).await?;
    assert_eq!(next_message(&mut client).await?, Message::Pong(vec![7]));
    assert!(factory.events.lock().unwrap().is_empty(), "nothing above creates a session");

    send_json(&mut client, json!({ "type": "offer", "sdp": "v=0 offer" })).await?;
    // One Pong per Ping: the next frame is already the answer
    match next_message(&mut client).await? {
        Message::Text(text) => {
            let answer: Value = serde_json::from_str(&text)?;
            assert_eq!(answer["type"], "answer");
        }
        other => panic!("expected the answer, got {other:?}"),
    }

    running.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn local_candidates_reach_the_client() -> anyhow::Result<()> {
    let (running, factory) = start().await?;
    let mut client = connect(&running).await?;

    send_json(&mut client, json!({ "type": "offer", "sdp": "v=0 offer" })).await?;
    next_json(&mut client).await?;

    let events = factory.events.lock().unwrap()[0].clone();
    let mut candidate = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.2 54400 typ host");
    candidate.sdp_mid = Some("0".to_string());
    candidate.sdp_mline_index = Some(0);
    events.local_candidate(candidate);

    let message = next_json(&mut client).await?;
    assert_eq!(message["type"], "ice-candidate");
    assert_eq!(message["candidate"]["sdpMid"], "0");
    assert_eq!(message["candidate"]["sdpMLineIndex"], 0);

    running.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn disconnecting_detaches_the_session() -> anyhow::Result<()> {
    let (running, _) = start().await?;
    let mut client = connect(&running).await?;

    send_json(&mut client, json!({ "type": "offer", "sdp": "v=0 offer" })).await?;
    next_json(&mut client).await?;
    client.close(None).await?;

    let snapshots =
        wait_for(running.driver(), |s| s.len() == 1 && s[0].channel.is_none()).await?;
    assert!(snapshots[0].grace_pending, "negotiating session waits out its grace window");

    running.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_client_connections() -> anyhow::Result<()> {
    let (running, _) = start().await?;
    let mut client = connect(&running).await?;
    send_json(&mut client, json!({ "type": "offer", "sdp": "v=0 offer" })).await?;
    next_json(&mut client).await?;

    running.shutdown().await?;

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "client connection should end after shutdown");
    Ok(())
}
