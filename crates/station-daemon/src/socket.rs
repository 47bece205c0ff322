use crate::core::CoreEvent;
use crate::BroadcastMessage;
use station_proto::protocol::{Broadcast, Command, FrameError, Message, PROTOCOL_VERSION};
use station_proto::state::StateManager;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<CoreEvent>,
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
        serve(listener, state_manager, event_tx, broadcast_tx).await;
    })
}

pub async fn serve(
    listener: TcpListener,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<CoreEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) {
    let mut client_id = 0usize;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;
                info!("Client {} connected from {}", id, peer);

                let sm = state_manager.clone();
                let evt_tx = event_tx.clone();
                // Subscribe before the Hello snapshot is read so nothing
                // published in between is lost.
                let bcast_rx = broadcast_tx.subscribe();

                tokio::spawn(async move {
                    handle_client(stream, sm, id, evt_tx, bcast_rx).await;
                    info!("Client {} disconnected", id);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    state_manager: Arc<StateManager>,
    client_id: usize,
    event_tx: mpsc::Sender<CoreEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Send Hello with current state snapshot on connect
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

                        loop {
                            let msg = match Message::next_frame(&read_buf) {
                                Ok(Some((msg, consumed))) => {
                                    read_buf.drain(..consumed);
                                    msg
                                }
                                Ok(None) => break,
                                Err(FrameError::Malformed { consumed, error }) => {
                                    warn!("Client {} sent a malformed frame: {}", client_id, error);
                                    read_buf.drain(..consumed);
                                    continue;
                                }
                                Err(e @ FrameError::TooLarge(_)) => {
                                    warn!("Client {}: {}, closing", client_id, e);
                                    return;
                                }
                            };
                            match msg {
                                Message::Command(Command::GetState) => {
                                    if let Ok(encoded) = encode_state(&state_manager).await {
                                        if write_half.write_all(&encoded).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Message::Command(cmd) => {
                                    info!("Client {} sent command: {:?}", client_id, cmd);

                                    if event_tx.send(CoreEvent::Command(cmd)).await.is_err() {
                                        warn!("CoreEvent channel closed");
                                        return;
                                    }
                                }
                                Message::Broadcast(_) => {}
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
                    Ok(other) => match to_wire(other) {
                        Some(broadcast) => Message::Broadcast(broadcast).encode(),
                        None => continue,
                    },
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

/// Wire form of a broadcast that carries its own payload.  `StateUpdated`
/// has none; the snapshot is read from the state manager instead.
fn to_wire(msg: BroadcastMessage) -> Option<Broadcast> {
    match msg {
        BroadcastMessage::PlaybackChanged { is_playing, rev } => {
            Some(Broadcast::PlaybackChanged { is_playing, rev })
        }
        BroadcastMessage::TrackUpdated(label) => Some(Broadcast::Track { label }),
        BroadcastMessage::Notice(message) => Some(Broadcast::Notice { message }),
        BroadcastMessage::Log(message) => Some(Broadcast::Log { message }),
        BroadcastMessage::StateUpdated => None,
    }
}

async fn encode_hello(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    let rev = state.rev;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        daemon_rev: rev,
        state,
    })
    .encode()
}

async fn encode_state(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::State { data: state }).encode()
}
