use crate::core::ControllerEvent;
use crate::BroadcastMessage;
use plusradio_proto::protocol::{Broadcast, Message, MAX_FRAME_LEN, PROTOCOL_VERSION};
use plusradio_proto::state::StateManager;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Where client commands go.  `None` when startup failed and no controller
/// is running; commands are then dropped.
pub type CommandSink = Option<mpsc::Sender<ControllerEvent>>;

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: StateManager,
    event_tx: CommandSink,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let connected = Arc::new(AtomicUsize::new(0));
        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    let count = connected.fetch_add(1, Ordering::Relaxed) + 1;
                    info!("Client {} connected from {} ({} connected)", id, peer, count);

                    let sm = state_manager.clone();
                    let evt_tx = event_tx.clone();
                    let bcast_rx = broadcast_tx.subscribe();
                    let connected = connected.clone();

                    tokio::spawn(async move {
                        let (read_half, write_half) = stream.into_split();
                        handle_client(read_half, write_half, sm, id, evt_tx, bcast_rx).await;
                        let count = connected.fetch_sub(1, Ordering::Relaxed) - 1;
                        info!("Client {} disconnected ({} connected)", id, count);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client<R, W>(
    mut read_half: R,
    mut write_half: W,
    state_manager: StateManager,
    client_id: usize,
    event_tx: CommandSink,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Hello carries the full snapshot, fatal flag included
    if let Ok(encoded) = encode_hello(&state_manager).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        while let Some(len) = Message::frame_len(&read_buf) {
                            if len > MAX_FRAME_LEN {
                                warn!("Client {} announced a {} byte frame, disconnecting", client_id, len);
                                return;
                            }
                            if read_buf.len() < 4 + len {
                                break;
                            }
                            let frame: Vec<u8> = read_buf.drain(..4 + len).collect();
                            match Message::decode(&frame) {
                                Ok((Message::Command(cmd), _)) => {
                                    debug!("Client {} sent command: {:?}", client_id, cmd);

                                    let Some(tx) = event_tx.as_ref() else {
                                        warn!("Client {}: no controller running, dropping {:?}", client_id, cmd);
                                        continue;
                                    };
                                    if tx.send(ControllerEvent::Command(cmd)).await.is_err() {
                                        warn!("Controller event channel closed");
                                        return;
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => warn!("Client {} sent a malformed frame: {}", client_id, e),
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let encoded = match msg {
                    Ok(BroadcastMessage::StateUpdated) => encode_state(&state_manager).await,
                    Ok(BroadcastMessage::Notice(notice)) => {
                        Message::Broadcast(Broadcast::Notice { notice }).encode()
                    }
                    Ok(BroadcastMessage::Fatal(message)) => {
                        Message::Broadcast(Broadcast::Fatal { message }).encode()
                    }
                    Ok(BroadcastMessage::Log(message)) => {
                        Message::Broadcast(Broadcast::Log { message }).encode()
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        encode_state(&state_manager).await
                    }
                    Err(_) => break,
                };
                if let Ok(encoded) = encoded {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn encode_hello(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        state,
    })
    .encode()
}

async fn encode_state(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::State { data: state }).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use plusradio_proto::protocol::{Command, Notice, PlayerView, Severity};

    async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Message {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        reader.read_exact(&mut body).await.unwrap();
        let mut frame = len.to_vec();
        frame.extend_from_slice(&body);
        Message::decode(&frame).unwrap().0
    }

    #[tokio::test]
    async fn test_hello_then_commands_and_broadcasts() {
        let state = StateManager::new();
        state
            .publish(PlayerView {
                query: "jazz".into(),
                ..PlayerView::default()
            })
            .await;
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (broadcast_tx, _) = broadcast::channel(8);

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let rx = broadcast_tx.subscribe();
        tokio::spawn(handle_client(
            server_read,
            server_write,
            state.clone(),
            1,
            Some(event_tx),
            rx,
        ));
        let (mut client_read, mut client_write) = tokio::io::split(client);

        match read_message(&mut client_read).await {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(state.query, "jazz");
            }
            other => panic!("expected hello, got {:?}", other),
        }

        let frame = Message::Command(Command::Next).encode().unwrap();
        client_write.write_all(&frame).await.unwrap();
        match event_rx.recv().await {
            Some(ControllerEvent::Command(Command::Next)) => {}
            other => panic!("expected Next, got {:?}", other),
        }

        broadcast_tx
            .send(BroadcastMessage::Notice(Notice::new(Severity::Info, "hi")))
            .unwrap();
        match read_message(&mut client_read).await {
            Message::Broadcast(Broadcast::Notice { notice }) => assert_eq!(notice.message, "hi"),
            other => panic!("expected notice, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (broadcast_tx, _) = broadcast::channel(8);

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        tokio::spawn(handle_client(
            server_read,
            server_write,
            StateManager::new(),
            1,
            Some(event_tx),
            broadcast_tx.subscribe(),
        ));
        let (mut client_read, mut client_write) = tokio::io::split(client);
        read_message(&mut client_read).await;

        let mut bytes = 5u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"xxxxx");
        bytes.extend(Message::Command(Command::Next).encode().unwrap());
        client_write.write_all(&bytes).await.unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), event_rx.recv()).await;
        assert!(matches!(got, Ok(Some(ControllerEvent::Command(Command::Next)))));
    }

    #[tokio::test]
    async fn test_oversized_frame_disconnects() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let (broadcast_tx, _) = broadcast::channel(8);

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let task = tokio::spawn(handle_client(
            server_read,
            server_write,
            StateManager::new(),
            1,
            Some(event_tx),
            broadcast_tx.subscribe(),
        ));
        let (mut client_read, mut client_write) = tokio::io::split(client);
        read_message(&mut client_read).await;

        let header = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        client_write.write_all(&header).await.unwrap();

        let finished = tokio::time::timeout(std::time::Duration::from_secs(1), task).await;
        assert!(finished.is_ok());
    }

    #[tokio::test]
    async fn test_fatal_state_in_hello_and_fatal_broadcast() {
        let state = StateManager::new();
        state.set_fatal("playlist not found: Radyo.m3u").await;
        let (broadcast_tx, _) = broadcast::channel(8);

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        tokio::spawn(handle_client(
            server_read,
            server_write,
            state,
            1,
            None,
            broadcast_tx.subscribe(),
        ));
        let (mut client_read, mut client_write) = tokio::io::split(client);

        match read_message(&mut client_read).await {
            Message::Broadcast(Broadcast::Hello { state, .. }) => {
                assert!(state.fatal.is_some());
                assert!(state.stations.is_empty());
            }
            other => panic!("expected hello, got {:?}", other),
        }

        // commands are dropped, the connection stays usable
        let frame = Message::Command(Command::Random).encode().unwrap();
        client_write.write_all(&frame).await.unwrap();
        broadcast_tx
            .send(BroadcastMessage::Fatal("boom".into()))
            .unwrap();
        match read_message(&mut client_read).await {
            Message::Broadcast(Broadcast::Fatal { message }) => assert_eq!(message, "boom"),
            other => panic!("expected fatal, got {:?}", other),
        }
    }
}
