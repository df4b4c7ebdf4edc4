use crate::core::DaemonEvent;
use crate::BroadcastMessage;
use preset_proto::protocol::{Broadcast, Frame, Message, PROTOCOL_VERSION};
use preset_proto::state::StateManager;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    snapshots: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
    clients_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!("client socket on {}", addr);
                serve(listener, snapshots, event_tx, clients_tx).await;
            }
            Err(e) => error!("cannot bind client socket {}: {}", addr, e),
        }
    })
}

/// Accept loop.  Every connection is a bound client for its whole lifetime.
pub async fn serve(
    listener: TcpListener,
    snapshots: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
    clients_tx: broadcast::Sender<BroadcastMessage>,
) {
    let mut next_client = 1usize;

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept failed: {}", e);
                continue;
            }
        };
        let client = ClientConn {
            id: next_client,
            snapshots: Arc::clone(&snapshots),
            event_tx: event_tx.clone(),
        };
        next_client += 1;

        let (bound_tx, bound_rx) = oneshot::channel();
        if event_tx.send(DaemonEvent::ClientBound(bound_tx)).await.is_err() {
            warn!("daemon core is gone, closing client socket");
            return;
        }

        let updates = clients_tx.subscribe();
        tokio::spawn(async move {
            let id = client.id;
            // Hello must already count this client.
            if bound_rx.await.is_err() {
                warn!(client = id, "bind was never acknowledged");
            }
            debug!(client = id, %peer, "bound");
            let unbind = client.event_tx.clone();
            client.run(stream, updates).await;
            debug!(client = id, "unbound");
            let _ = unbind.send(DaemonEvent::ClientUnbound).await;
        });
    }
}

struct ClientConn {
    id: usize,
    snapshots: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
}

impl ClientConn {
    async fn run(self, stream: TcpStream, mut updates: broadcast::Receiver<BroadcastMessage>) {
        let (mut reader, mut writer) = stream.into_split();
        let mut chunk = [0u8; 4096];
        let mut pending: Vec<u8> = Vec::new();

        match self.hello().await {
            Ok(bytes) => {
                if writer.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(client = self.id, "cannot encode hello: {}", e),
        }

        loop {
            tokio::select! {
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        pending.extend_from_slice(&chunk[..n]);
                        if !self.forward_commands(&mut pending).await {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(client = self.id, "read failed: {}", e);
                        break;
                    }
                },

                update = updates.recv() => {
                    let bytes = match update {
                        Ok(msg) => self.frame_for(msg).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(client = self.id, skipped, "client fell behind, resending state");
                            self.state().await
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    match bytes {
                        Ok(bytes) => {
                            if writer.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(client = self.id, "cannot encode update: {}", e),
                    }
                }
            }
        }
    }

    /// Hand every whole command in `pending` to the core.  False once the
    /// core has gone away or the client sent a frame we refuse to buffer.
    async fn forward_commands(&self, pending: &mut Vec<u8>) -> bool {
        loop {
            match Message::next_frame(pending) {
                Frame::Incomplete => return true,
                Frame::Message(msg, used) => {
                    pending.drain(..used);
                    let Message::Command(cmd) = msg else {
                        debug!(client = self.id, "ignoring non-command frame");
                        continue;
                    };
                    info!(client = self.id, "command {:?}", cmd);
                    if self.event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
                        warn!("daemon core is gone, dropping client");
                        return false;
                    }
                }
                Frame::Malformed(used, err) => {
                    pending.drain(..used);
                    warn!(client = self.id, "skipping malformed frame: {}", err);
                }
                Frame::Oversized(len) => {
                    warn!(client = self.id, len, "frame over limit, dropping client");
                    return false;
                }
            }
        }
    }

    async fn frame_for(&self, msg: BroadcastMessage) -> anyhow::Result<Vec<u8>> {
        let broadcast = match msg {
            BroadcastMessage::StateUpdated => return self.state().await,
            BroadcastMessage::Toast { message, long } => Broadcast::Toast { message, long },
            BroadcastMessage::Log(message) => Broadcast::Log { message },
            BroadcastMessage::Error(message) => Broadcast::Error { message },
        };
        Message::Broadcast(broadcast).encode()
    }

    async fn hello(&self) -> anyhow::Result<Vec<u8>> {
        let state = self.snapshots.get_state().await;
        Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            daemon_rev: state.rev,
            state,
        })
        .encode()
    }

    async fn state(&self) -> anyhow::Result<Vec<u8>> {
        let data = self.snapshots.get_state().await;
        Message::Broadcast(Broadcast::State { data }).encode()
    }
}
