//! WebSocket transport
//!
//! One task per connection: decodes JSON frames into [`ClientMessage`]s
//! for the coordinator and writes its outbound queue back to the socket.
//! Probes are answered right here so their timestamps never wait behind
//! the coordinator's queue.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use super::{CoordinatorHandle, ServiceError};
use crate::sync::{ClientMessage, ServerMessage};

/// Errors that end a single connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Accept connections until the listener fails
pub async fn serve(listener: TcpListener, coordinator: CoordinatorHandle) -> Result<(), TransportError> {
    info!("Listening for devices on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await?;
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, coordinator).await {
                debug!("Connection from {} ended: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    coordinator: CoordinatorHandle,
) -> Result<(), TransportError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    // Only the registry holds the sender: dropping it there (kick,
    // shutdown) ends this connection.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn = coordinator.connect(outbound_tx).await?;
    info!("{} connected from {}", conn, addr);

    let result: Result<(), TransportError> = async {
        loop {
            tokio::select! {
                outgoing = outbound_rx.recv() => {
                    let Some(message) = outgoing else {
                        debug!("{} closed by coordinator", conn);
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    };
                    let json = serde_json::to_string(&message)?;
                    write.send(Message::Text(json.into())).await?;
                }
                incoming = read.next() => {
                    let msg = match incoming {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    };

                    match msg {
                        Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(ClientMessage::Probe { send_time }) => {
                                let reply = ServerMessage::ProbeReply {
                                    send_time,
                                    reference_time: coordinator.reference_now(),
                                };
                                write.send(Message::Text(serde_json::to_string(&reply)?.into())).await?;
                            }
                            Ok(message) => coordinator.deliver(conn, message)?,
                            Err(e) => warn!("{} sent a malformed frame: {}", conn, e),
                        },
                        Message::Close(_) => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }
    .await;

    info!("{} disconnected", conn);
    coordinator.disconnect(conn);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::abc_catalog;
    use crate::clock::MonotonicClock;
    use crate::service::{Coordinator, ServiceConfig};
    use crate::sync::{Mode, Role};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_server() -> (String, CoordinatorHandle) {
        let coordinator = Coordinator::new(
            ServiceConfig::default(),
            Arc::new(abc_catalog()),
            Arc::new(MonotonicClock::starting_at(50_000)),
        )
        .start();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(serve(listener, coordinator.clone()));
        (url, coordinator)
    }

    async fn send(client: &mut Client, message: &ClientMessage) {
        let json = serde_json::to_string(message).unwrap();
        client.send(Message::Text(json.into())).await.unwrap();
    }

    async fn recv(client: &mut Client) -> ServerMessage {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    /// Skip frames until one matches
    async fn recv_until(client: &mut Client, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        loop {
            let msg = recv(client).await;
            if pred(&msg) {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_loopback_session() {
        let (url, coordinator) = start_server().await;

        let (mut controller, _) = connect_async(&url).await.unwrap();
        let (mut player, _) = connect_async(&url).await.unwrap();

        send(&mut controller, &ClientMessage::Hello { role: Role::Controller }).await;
        send(&mut player, &ClientMessage::Hello { role: Role::Player }).await;

        assert!(matches!(recv(&mut player).await, ServerMessage::TrackCatalog { .. }));
        assert!(matches!(recv(&mut player).await, ServerMessage::StateSnapshot(_)));

        // Probe is answered by the connection itself
        send(&mut player, &ClientMessage::Probe { send_time: 123 }).await;
        match recv(&mut player).await {
            ServerMessage::ProbeReply { send_time, reference_time } => {
                assert_eq!(send_time, 123);
                assert!(reference_time >= 50_000);
            }
            other => panic!("expected probeReply, got {:?}", other),
        }

        send(
            &mut controller,
            &ClientMessage::CmdStart {
                track_id: "C".into(),
                delay_ms: 2_000,
            },
        )
        .await;

        let state = recv_until(&mut player, |m| matches!(m, ServerMessage::StateSnapshot(_))).await;
        let ServerMessage::StateSnapshot(snapshot) = state else {
            unreachable!()
        };
        assert_eq!(snapshot.mode, Mode::Scheduled);
        assert_eq!(snapshot.track_id.as_deref(), Some("C"));

        let inspected = coordinator.inspect().await.unwrap();
        assert_eq!(inspected.sessions.len(), 1);
        assert_eq!(inspected.controllers, 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let (url, _coordinator) = start_server().await;
        let (mut client, _) = connect_async(&url).await.unwrap();

        client.send(Message::Text("{\"type\":\"bogus\"}".into())).await.unwrap();
        client.send(Message::Text("garbage".into())).await.unwrap();
        send(&mut client, &ClientMessage::Probe { send_time: 1 }).await;

        assert!(matches!(recv(&mut client).await, ServerMessage::ProbeReply { send_time: 1, .. }));
    }

    #[tokio::test]
    async fn test_kick_closes_socket() {
        let (url, coordinator) = start_server().await;
        let (mut controller, _) = connect_async(&url).await.unwrap();
        let (mut player, _) = connect_async(&url).await.unwrap();

        send(&mut controller, &ClientMessage::Hello { role: Role::Controller }).await;
        send(&mut player, &ClientMessage::Hello { role: Role::Player }).await;
        recv_until(&mut player, |m| matches!(m, ServerMessage::StateSnapshot(_))).await;

        let session_id = coordinator.inspect().await.unwrap().sessions[0].id;
        send(&mut controller, &ClientMessage::CmdKick { session_id }).await;

        assert_eq!(recv(&mut player).await, ServerMessage::Terminated);
        // Then the server closes the socket
        let end = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match player.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(end.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_removes_session() {
        let (url, coordinator) = start_server().await;
        let (mut player, _) = connect_async(&url).await.unwrap();
        send(&mut player, &ClientMessage::Hello { role: Role::Player }).await;
        recv_until(&mut player, |m| matches!(m, ServerMessage::StateSnapshot(_))).await;
        assert_eq!(coordinator.inspect().await.unwrap().sessions.len(), 1);

        player.close(None).await.unwrap();
        drop(player);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if coordinator.inspect().await.unwrap().sessions.is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "session was not removed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
