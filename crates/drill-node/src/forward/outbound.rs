//! Client-side destination dial.
//!
//! For every `EstablishConnection` we dial the local destination and relay it under the given
//! connection id. The owning node keeps the connection alive by repeating `EstablishConnection`;
//! a connection not refreshed within its lifetime is closed.

use super::relay::{ConnectionMap, Relay, RelayChannels, RelayHandle};
use crate::config::NodeAddress;
use crate::transport::CommandSink;
use drill_core::{DrillError, DrillResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct OutboundForwarderOptions {
    /// A connection not refreshed by `EstablishConnection` for this long is closed.
    pub connection_lifetime: Duration,
    pub sweep_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for OutboundForwarderOptions {
    fn default() -> Self {
        let connection_lifetime = Duration::from_secs(10);
        Self {
            connection_lifetime,
            sweep_interval: connection_lifetime / 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

struct OutboundConnection {
    /// Distinguishes this entry from a later one reusing the same connection id.
    serial: u64,
    owner: Uuid,
    last_activity: Instant,
    handle: RelayHandle,
}

pub struct OutboundForwarder {
    sink: Arc<dyn CommandSink>,
    options: OutboundForwarderOptions,
    connections: ConnectionMap<OutboundConnection>,
    sweeper: JoinHandle<()>,
}

impl OutboundForwarder {
    /// Must be called inside a tokio runtime; starts the expiry sweeper.
    pub fn new(sink: Arc<dyn CommandSink>, options: OutboundForwarderOptions) -> Self {
        let connections = Arc::new(Mutex::new(HashMap::new()));
        let sweeper = tokio::spawn(sweep_connections(connections.clone(), options));
        Self {
            sink,
            options,
            connections,
            sweeper,
        }
    }

    /// Dial `destination` for `connection_id`, or refresh the connection if `node_id` owns it.
    ///
    /// An id owned by another node is ignored. The dial itself runs in the background; a failed
    /// dial is reported to the owner with `CloseConnection`.
    pub async fn establish_connection(
        &self,
        node_id: Uuid,
        connection_id: Uuid,
        port: u16,
        destination: NodeAddress,
    ) {
        let (channels, serial) = {
            let mut connections = self.connections.lock().await;
            if let Some(connection) = connections.get_mut(&connection_id) {
                if connection.owner == node_id {
                    connection.last_activity = Instant::now();
                    trace!(%connection_id, "connection refreshed");
                } else {
                    debug!(%connection_id, owner = %connection.owner, requester = %node_id, "connection owned by another node, ignoring");
                }
                return;
            }

            let (handle, channels) = RelayHandle::channel();
            let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
            connections.insert(
                connection_id,
                OutboundConnection {
                    serial,
                    owner: node_id,
                    last_activity: Instant::now(),
                    handle,
                },
            );
            (channels, serial)
        };

        info!(%connection_id, %node_id, port, %destination, "establishing connection");
        let relay = Relay {
            connection_id,
            node_id,
            port,
            sink: self.sink.clone(),
            keepalive: None,
        };
        tokio::spawn(dial_and_relay(
            relay,
            destination,
            channels,
            serial,
            self.connections.clone(),
            self.options.connect_timeout,
        ));
    }

    /// Write bytes from the node link to the destination socket. Returns `false` if unknown.
    pub async fn write_to_connection(&self, connection_id: Uuid, data: Vec<u8>) -> bool {
        match self.connections.lock().await.get(&connection_id) {
            Some(connection) => connection.handle.write_tx.send(data).is_ok(),
            None => {
                trace!(%connection_id, "data for unknown connection");
                false
            }
        }
    }

    /// Close a destination socket without notifying the remote side. Returns `false` if unknown.
    pub async fn close_connection(&self, connection_id: Uuid) -> bool {
        match self.connections.lock().await.remove(&connection_id) {
            Some(connection) => {
                connection.handle.cancel();
                debug!(%connection_id, "connection closed by remote");
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub async fn connection_owner(&self, connection_id: Uuid) -> Option<Uuid> {
        self.connections
            .lock()
            .await
            .get(&connection_id)
            .map(|connection| connection.owner)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

impl Drop for OutboundForwarder {
    fn drop(&mut self) {
        self.sweeper.abort();
        if let Ok(connections) = self.connections.try_lock() {
            for connection in connections.values() {
                connection.handle.cancel();
            }
        }
    }
}

async fn sweep_connections(
    connections: ConnectionMap<OutboundConnection>,
    options: OutboundForwarderOptions,
) {
    let mut interval = tokio::time::interval(options.sweep_interval);
    loop {
        interval.tick().await;
        let mut connections = connections.lock().await;
        connections.retain(|connection_id, connection| {
            if connection.last_activity.elapsed() <= options.connection_lifetime {
                return true;
            }
            connection.handle.cancel();
            info!(%connection_id, owner = %connection.owner, "connection expired");
            false
        });
    }
}

async fn dial_and_relay(
    relay: Relay,
    destination: NodeAddress,
    channels: RelayChannels,
    serial: u64,
    connections: ConnectionMap<OutboundConnection>,
    connect_timeout: Duration,
) {
    let connection_id = relay.connection_id;

    let stream = match dial(&destination, connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%connection_id, %destination, error = %e, "cannot reach destination");
            remove_if_current(&connections, connection_id, serial).await;
            relay.send_close().await;
            return;
        }
    };

    let end = relay.run(stream, channels).await;
    remove_if_current(&connections, connection_id, serial).await;
    debug!(%connection_id, ?end, "destination connection finished");
}

async fn dial(destination: &NodeAddress, connect_timeout: Duration) -> DrillResult<TcpStream> {
    let connect = TcpStream::connect((destination.host.as_str(), destination.port));
    let stream = tokio::time::timeout(connect_timeout, connect)
        .await
        .map_err(|_| DrillError::Timeout)??;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Remove the entry unless it was already replaced by a newer connection with the same id.
async fn remove_if_current(
    connections: &ConnectionMap<OutboundConnection>,
    connection_id: Uuid,
    serial: u64,
) {
    let mut connections = connections.lock().await;
    if connections
        .get(&connection_id)
        .is_some_and(|connection| connection.serial == serial)
    {
        connections.remove(&connection_id);
    }
}
