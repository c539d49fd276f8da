//! Outbound node links to one configured node.
//!
//! Links are pooled. Each new link connects, sends `Auth` and `Hello`, and waits for the remote
//! `Hello`, which tells us the remote node id. Once pooled, a link's read loop feeds the shared
//! callback like any inbound link.

use super::pool::{Pool, PoolOptions, PoolStats};
use super::reader::CommandReader;
use super::socket::NodeSocket;
use super::{read_loop, CommandCallback, HANDSHAKE_TIMEOUT};
use crate::config::NodeAddress;
use drill_core::{AuthCommand, Command, DrillError, DrillResult};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A pooled link. The reader is handed to the read loop once the link is pooled.
#[derive(Clone)]
struct PooledLink {
    socket: Arc<NodeSocket>,
    node_id: Uuid,
    reader: Arc<Mutex<Option<CommandReader>>>,
}

pub struct OutboundTransport {
    address: NodeAddress,
    remote_id: Arc<RwLock<Option<Uuid>>>,
    pool: Pool<PooledLink>,
}

impl OutboundTransport {
    /// Create the transport. No link is opened until the first write.
    pub fn new(
        node_id: Uuid,
        address: NodeAddress,
        password: String,
        callback: CommandCallback,
        pool_options: PoolOptions,
    ) -> Self {
        Self::with_handshake_timeout(
            node_id,
            address,
            password,
            callback,
            pool_options,
            HANDSHAKE_TIMEOUT,
        )
    }

    pub fn with_handshake_timeout(
        node_id: Uuid,
        address: NodeAddress,
        password: String,
        callback: CommandCallback,
        pool_options: PoolOptions,
        handshake_timeout: Duration,
    ) -> Self {
        let remote_id = Arc::new(RwLock::new(None));
        let password = Arc::new(password);

        let create = {
            let address = address.clone();
            let remote_id = remote_id.clone();
            move || {
                let address = address.clone();
                let password = password.clone();
                let remote_id = remote_id.clone();
                async move {
                    let open = open_link(&address, node_id, &password);
                    let (socket, reader, remote) = tokio::time::timeout(handshake_timeout, open)
                        .await
                        .map_err(|_| DrillError::Timeout)??;
                    *remote_id.write().unwrap_or_else(PoisonError::into_inner) = Some(remote);
                    info!(%address, node_id = %remote, socket = socket.id(), "node link established");
                    Ok(PooledLink {
                        socket,
                        node_id: remote,
                        reader: Arc::new(Mutex::new(Some(reader))),
                    })
                }
            }
        };

        let on_created = move |link: PooledLink| {
            let reader = link
                .reader
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(reader) = reader {
                tokio::spawn(read_loop(
                    link.socket.clone(),
                    reader,
                    link.node_id,
                    callback.clone(),
                ));
            }
        };

        let pool = Pool::new(
            pool_options,
            create,
            |link: &PooledLink| link.socket.is_closed(),
            on_created,
        );

        Self {
            address,
            remote_id,
            pool,
        }
    }

    /// Write a command over a pooled link, opening one if needed.
    pub async fn write_command(&self, command: &Command) -> DrillResult<()> {
        self.pool
            .use_resource(|link| async move { link.socket.write_command(command).await })
            .await
    }

    /// Remote node id, once a handshake has completed.
    pub fn node_id(&self) -> Option<Uuid> {
        *self.remote_id.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn host(&self) -> &str {
        &self.address.host
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Destroy every idle link. Links in use close once their writer is done with them.
    pub async fn close(&self) {
        for link in self.pool.drain() {
            link.socket.destroy().await;
        }
    }
}

/// Client side of the handshake.
async fn open_link(
    address: &NodeAddress,
    node_id: Uuid,
    password: &str,
) -> DrillResult<(Arc<NodeSocket>, CommandReader, Uuid)> {
    debug!(%address, "connecting to node");
    let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
    let (socket, mut reader) = NodeSocket::new(stream)?;

    let handshake = async {
        socket
            .write_command(&Command::Auth(AuthCommand::create(password)))
            .await?;
        socket.write_command(&Command::hello(node_id)).await?;
        match reader.read_command().await? {
            Command::Hello { node_id } => Ok(node_id),
            other => Err(DrillError::Handshake(format!(
                "expected Hello, got {:?}",
                other.command_type()
            ))),
        }
    };

    match handshake.await {
        Ok(remote) => Ok((socket, reader, remote)),
        Err(e) => {
            warn!(%address, error = %e, "node handshake failed");
            socket.destroy().await;
            Err(e)
        }
    }
}
