//! Inbound node links.
//!
//! Listens on the node port. A connecting node must send `Auth` then `Hello`; the server answers
//! with its own `Hello` and registers the socket under the remote node id. Several sockets may be
//! registered for one node; writes pick one at random.

use super::reader::CommandReader;
use super::socket::NodeSocket;
use super::{read_loop, CommandCallback, HANDSHAKE_TIMEOUT};
use drill_core::{with_retry, Command, DrillError, DrillResult, RetryOptions};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct InboundOptions {
    pub handshake_timeout: Duration,
    pub retry: RetryOptions,
}

impl Default for InboundOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            retry: RetryOptions::default(),
        }
    }
}

/// Authenticated inbound sockets keyed by remote node id.
#[derive(Default)]
struct SocketRegistry {
    sockets: Mutex<HashMap<Uuid, Vec<Arc<NodeSocket>>>>,
}

impl SocketRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Vec<Arc<NodeSocket>>>> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, node_id: Uuid, socket: Arc<NodeSocket>) {
        self.lock().entry(node_id).or_default().push(socket);
    }

    fn unregister(&self, node_id: Uuid, socket_id: u64) {
        let mut sockets = self.lock();
        if let Some(list) = sockets.get_mut(&node_id) {
            list.retain(|s| s.id() != socket_id);
            if list.is_empty() {
                sockets.remove(&node_id);
            }
        }
    }

    fn pick(&self, node_id: Uuid) -> Option<Arc<NodeSocket>> {
        let sockets = self.lock();
        let open: Vec<_> = sockets
            .get(&node_id)?
            .iter()
            .filter(|s| !s.is_closed())
            .collect();
        open.choose(&mut rand::thread_rng()).map(|s| Arc::clone(s))
    }
}

pub struct InboundTransport {
    node_id: Uuid,
    local_addr: SocketAddr,
    registry: Arc<SocketRegistry>,
    retry: RetryOptions,
    accept_task: JoinHandle<()>,
}

impl InboundTransport {
    /// Bind the node port and start accepting links.
    pub async fn bind(
        addr: SocketAddr,
        node_id: Uuid,
        password: String,
        callback: CommandCallback,
        options: InboundOptions,
    ) -> DrillResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, %node_id, "accepting node links");

        let registry = Arc::new(SocketRegistry::default());
        let accept_task = tokio::spawn(accept_loop(
            listener,
            node_id,
            Arc::new(password),
            registry.clone(),
            callback,
            options.handshake_timeout,
        ));

        Ok(Self {
            node_id,
            local_addr,
            registry,
            retry: options.retry,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Write to a random open socket of `node_id`, retrying with backoff.
    ///
    /// Fails with [`DrillError::NoRoute`] if the node has no open socket.
    pub async fn write_command_to(&self, node_id: Uuid, command: &Command) -> DrillResult<()> {
        with_retry(self.retry, move || async move {
            let socket = self
                .registry
                .pick(node_id)
                .ok_or(DrillError::NoRoute(node_id))?;
            socket.write_command(command).await
        })
        .await
    }

    #[cfg(test)]
    pub fn is_connected(&self, node_id: Uuid) -> bool {
        self.registry.pick(node_id).is_some()
    }

    /// Node ids with at least one registered socket.
    pub fn connected_nodes(&self) -> Vec<Uuid> {
        self.registry.lock().keys().copied().collect()
    }

    pub fn socket_count(&self) -> usize {
        self.registry.lock().values().map(Vec::len).sum()
    }

    /// Stop accepting and destroy every registered link.
    pub async fn close(&self) {
        self.accept_task.abort();
        let sockets: Vec<_> = self.registry.lock().values().flatten().cloned().collect();
        for socket in sockets {
            socket.destroy().await;
        }
    }
}

impl Drop for InboundTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    node_id: Uuid,
    password: Arc<String>,
    registry: Arc<SocketRegistry>,
    callback: CommandCallback,
    handshake_timeout: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "node link accepted");
                tokio::spawn(handle_link(
                    stream,
                    node_id,
                    password.clone(),
                    registry.clone(),
                    callback.clone(),
                    handshake_timeout,
                ));
            }
            Err(e) => {
                warn!(error = %e, "node accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_link(
    stream: TcpStream,
    node_id: Uuid,
    password: Arc<String>,
    registry: Arc<SocketRegistry>,
    callback: CommandCallback,
    handshake_timeout: Duration,
) {
    let (socket, mut reader) = match NodeSocket::new(stream) {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, "accepted link unusable");
            return;
        }
    };
    let peer = socket.peer_addr();

    let handshake = accept_handshake(&socket, &mut reader, &password, node_id);
    let remote_id = match tokio::time::timeout(handshake_timeout, handshake).await {
        Ok(Ok(remote_id)) => remote_id,
        Ok(Err(e)) => {
            warn!(%peer, error = %e, "node handshake rejected");
            socket.destroy().await;
            return;
        }
        Err(_) => {
            warn!(%peer, "node handshake timed out");
            socket.destroy().await;
            return;
        }
    };

    info!(%peer, node_id = %remote_id, socket = socket.id(), "node link established");
    registry.register(remote_id, socket.clone());
    read_loop(socket.clone(), reader, remote_id, callback).await;
    registry.unregister(remote_id, socket.id());
    info!(%peer, node_id = %remote_id, socket = socket.id(), "node link closed");
}

/// Server side of the handshake. Returns the remote node id.
async fn accept_handshake(
    socket: &NodeSocket,
    reader: &mut CommandReader,
    password: &str,
    node_id: Uuid,
) -> DrillResult<Uuid> {
    match reader.read_command().await? {
        Command::Auth(auth) => {
            if let Err(e) = auth.validate(password) {
                debug!(timestamp = ?auth.timestamp(), error = %e, "auth rejected");
                return Err(e.into());
            }
        }
        other => {
            return Err(DrillError::Handshake(format!(
                "expected Auth, got {:?}",
                other.command_type()
            )))
        }
    }

    let remote_id = match reader.read_command().await? {
        Command::Hello { node_id } => node_id,
        other => {
            return Err(DrillError::Handshake(format!(
                "expected Hello, got {:?}",
                other.command_type()
            )))
        }
    };

    socket.write_command(&Command::hello(node_id)).await?;
    Ok(remote_id)
}
