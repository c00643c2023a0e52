use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use weft_switch::TransportError;
use weft_types::address::from_socket_addr;
use weft_types::{Multiaddr, Protocol};

use super::message::{read_message, write_message, StarMessage};
use super::StarKind;

/// How long a member has to answer an `Incoming` before the dialer is rejected.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

struct Member {
    conn_id: u64,
    tx: mpsc::UnboundedSender<StarMessage>,
}

#[derive(Default)]
struct Registry {
    members: HashMap<String, Member>,
    pending: HashMap<u64, oneshot::Sender<TcpStream>>,
}

struct ServerState {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    accept_timeout: Duration,
}

impl ServerState {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Rendezvous server for star transports.
///
/// Members join over a control connection and are told about each other.
/// A dialer's connection is held until the target member opens a matching
/// accept connection, then the two sockets are spliced.
pub struct StarServer {
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl StarServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::bind_with_timeout(addr, DEFAULT_ACCEPT_TIMEOUT).await
    }

    pub async fn bind_with_timeout(
        addr: SocketAddr,
        accept_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(ServerState {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            accept_timeout,
        });
        info!(addr = %local_addr, "star server listening");
        let task = tokio::spawn(serve(listener, state.clone()));
        Ok(Self {
            local_addr,
            state,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address members of `kind` listen and dial on, without a peer id.
    pub fn multiaddr(&self, kind: StarKind) -> Multiaddr {
        from_socket_addr(self.local_addr)
            .with(Protocol::Ws("/".into()))
            .with(kind.protocol())
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    /// Stop accepting. Connections already spliced keep running.
    pub fn shutdown(&self) {
        self.task.abort();
    }

    /// Resolve once the accept loop has ended.
    pub async fn closed(mut self) {
        let _ = (&mut self.task).await;
    }
}

impl Drop for StarServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "star server accept failed");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                debug!(remote = %remote, error = %e, "star connection ended");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<ServerState>,
) -> Result<(), TransportError> {
    match read_message(&mut stream).await? {
        StarMessage::Join { peer } => run_member(stream, peer, state).await,
        StarMessage::Connect { target, from } => relay(stream, target, from, state).await,
        StarMessage::Accept { token } => {
            let waiter = state.lock().pending.remove(&token);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(stream);
                    Ok(())
                }
                None => {
                    write_message(
                        &mut stream,
                        &StarMessage::Rejected {
                            reason: format!("unknown token {}", token),
                        },
                    )
                    .await
                }
            }
        }
        other => Err(TransportError::Io {
            reason: format!("unexpected first message: {:?}", other),
        }),
    }
}

async fn run_member(
    stream: TcpStream,
    peer: String,
    state: Arc<ServerState>,
) -> Result<(), TransportError> {
    let conn_id = state.next_id();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let existing: Vec<String> = {
        let mut registry = state.lock();
        let existing = registry
            .members
            .keys()
            .filter(|p| **p != peer)
            .cloned()
            .collect();
        for (id, member) in &registry.members {
            if *id != peer {
                let _ = member.tx.send(StarMessage::Joined { peer: peer.clone() });
            }
        }
        registry.members.insert(
            peer.clone(),
            Member {
                conn_id,
                tx: tx.clone(),
            },
        );
        existing
    };
    let _ = tx.send(StarMessage::Peers { peers: existing });
    info!(peer, "star member joined");

    let (mut reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write_message(&mut writer, &msg).await.is_err() {
                break;
            }
        }
    });

    // Members send nothing after joining; a read result means the socket ended.
    let result = read_message(&mut reader).await;
    writer_task.abort();

    let mut registry = state.lock();
    if registry.members.get(&peer).is_some_and(|m| m.conn_id == conn_id) {
        registry.members.remove(&peer);
        for member in registry.members.values() {
            let _ = member.tx.send(StarMessage::Left { peer: peer.clone() });
        }
        info!(peer, "star member left");
    }
    drop(registry);
    match result {
        Ok(msg) => Err(TransportError::Io {
            reason: format!("unexpected message from member: {:?}", msg),
        }),
        Err(_) => Ok(()),
    }
}

async fn relay(
    mut stream: TcpStream,
    target: String,
    from: String,
    state: Arc<ServerState>,
) -> Result<(), TransportError> {
    let token = state.next_id();
    let (accept_tx, accept_rx) = oneshot::channel();
    let notified = {
        let mut registry = state.lock();
        let notified = registry.members.get(&target).is_some_and(|member| {
            member
                .tx
                .send(StarMessage::Incoming {
                    token,
                    from: from.clone(),
                })
                .is_ok()
        });
        if notified {
            registry.pending.insert(token, accept_tx);
        }
        notified
    };
    if !notified {
        return write_message(
            &mut stream,
            &StarMessage::Rejected {
                reason: format!("peer {} is not connected", target),
            },
        )
        .await;
    }

    let mut accepted = match tokio::time::timeout(state.accept_timeout, accept_rx).await {
        Ok(Ok(accepted)) => accepted,
        _ => {
            state.lock().pending.remove(&token);
            return write_message(
                &mut stream,
                &StarMessage::Rejected {
                    reason: format!("peer {} did not accept in time", target),
                },
            )
            .await;
        }
    };

    write_message(&mut stream, &StarMessage::Ready).await?;
    debug!(from, target, "star relay spliced");
    copy_bidirectional(&mut stream, &mut accepted).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn join(server: &StarServer, peer: &str) -> TcpStream {
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        write_message(&mut stream, &StarMessage::Join { peer: peer.to_string() })
            .await
            .unwrap();
        stream
    }

    #[tokio::test]
    async fn test_join_lists_existing_members() {
        let server = StarServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut first = join(&server, "alpha").await;
        assert_eq!(
            read_message(&mut first).await.unwrap(),
            StarMessage::Peers { peers: vec![] }
        );

        let mut second = join(&server, "beta").await;
        assert_eq!(
            read_message(&mut second).await.unwrap(),
            StarMessage::Peers {
                peers: vec!["alpha".to_string()]
            }
        );
        assert_eq!(
            read_message(&mut first).await.unwrap(),
            StarMessage::Joined {
                peer: "beta".to_string()
            }
        );
        assert_eq!(server.member_count(), 2);

        drop(second);
        assert_eq!(
            read_message(&mut first).await.unwrap(),
            StarMessage::Left {
                peer: "beta".to_string()
            }
        );
        assert_eq!(server.member_count(), 1);
    }

    #[tokio::test]
    async fn test_unanswered_connect_times_out() {
        let server =
            StarServer::bind_with_timeout("127.0.0.1:0".parse().unwrap(), Duration::from_millis(100))
                .await
                .unwrap();
        let mut member = join(&server, "alpha").await;
        let _ = read_message(&mut member).await.unwrap();

        let mut dialer = TcpStream::connect(server.local_addr()).await.unwrap();
        write_message(
            &mut dialer,
            &StarMessage::Connect {
                target: "alpha".to_string(),
                from: "beta".to_string(),
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            read_message(&mut member).await.unwrap(),
            StarMessage::Incoming { .. }
        ));
        assert!(matches!(
            read_message(&mut dialer).await.unwrap(),
            StarMessage::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let server = StarServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        write_message(&mut stream, &StarMessage::Accept { token: 77 })
            .await
            .unwrap();
        assert!(matches!(
            read_message(&mut stream).await.unwrap(),
            StarMessage::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_multiaddr_shape() {
        let server = StarServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.multiaddr(StarKind::WebRtc).to_string();
        assert!(addr.starts_with("/ip4/127.0.0.1/tcp/"));
        assert!(addr.ends_with("/ws/p2p-webrtc-star"));
    }
}
