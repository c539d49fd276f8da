//! Server-side port exposure.
//!
//! A node asks for a port with `AllocatePort`; we listen on it and lease it to that node. Every
//! local connection accepted on a leased port gets a fresh connection id and is relayed to the
//! lease holder. Leases expire unless renewed.

use super::relay::{ConnectionMap, Relay, RelayChannels, RelayHandle};
use crate::transport::CommandSink;
use drill_core::{Command, DrillResult};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct InboundForwarderOptions {
    /// A lease not renewed for this long is released.
    pub lease_lifetime: Duration,
    pub sweep_interval: Duration,
    /// Period of the `EstablishConnection` keep-alive for open connections.
    pub establish_interval: Duration,
    pub bind_host: IpAddr,
}

impl Default for InboundForwarderOptions {
    fn default() -> Self {
        let lease_lifetime = Duration::from_secs(15);
        Self {
            lease_lifetime,
            sweep_interval: lease_lifetime / 15,
            establish_interval: Duration::from_secs(3),
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// An allocated port and the node holding it.
struct PortLease {
    node_id: Uuid,
    renewed_at: Instant,
    local_addr: SocketAddr,
    /// Stops the accept loop; dropping the listener frees the port.
    cancel_tx: mpsc::Sender<()>,
}

pub struct InboundForwarder {
    sink: Arc<dyn CommandSink>,
    options: InboundForwarderOptions,
    ports: Arc<Mutex<HashMap<u16, PortLease>>>,
    connections: ConnectionMap<RelayHandle>,
    sweeper: JoinHandle<()>,
}

impl InboundForwarder {
    /// Must be called inside a tokio runtime; starts the lease sweeper.
    pub fn new(sink: Arc<dyn CommandSink>, options: InboundForwarderOptions) -> Self {
        let ports = Arc::new(Mutex::new(HashMap::new()));
        let sweeper = tokio::spawn(sweep_leases(ports.clone(), options));
        Self {
            sink,
            options,
            ports,
            connections: Arc::new(Mutex::new(HashMap::new())),
            sweeper,
        }
    }

    /// Lease `port` to `node_id`, or renew the lease if it already holds it.
    ///
    /// A port leased to another node is left alone. Fails if the port cannot be bound.
    pub async fn allocate_port(&self, port: u16, node_id: Uuid) -> DrillResult<()> {
        if renew_lease(&mut *self.ports.lock().await, port, node_id) {
            return Ok(());
        }

        // Bind without holding the lease table; a concurrent request may win the port meanwhile.
        let listener = match TcpListener::bind((self.options.bind_host, port)).await {
            Ok(listener) => listener,
            Err(e) => {
                if renew_lease(&mut *self.ports.lock().await, port, node_id) {
                    return Ok(());
                }
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;

        let mut ports = self.ports.lock().await;
        if renew_lease(&mut ports, port, node_id) {
            return Ok(());
        }

        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        tokio::spawn(accept_loop(
            listener,
            cancel_rx,
            port,
            node_id,
            self.sink.clone(),
            self.connections.clone(),
            self.options.establish_interval,
        ));

        ports.insert(
            port,
            PortLease {
                node_id,
                renewed_at: Instant::now(),
                local_addr,
                cancel_tx,
            },
        );
        info!(port, %node_id, addr = %local_addr, "port allocated");
        Ok(())
    }

    /// Release `port` and stop listening on it. Relayed connections stay open.
    pub async fn deallocate_port(&self, port: u16) -> bool {
        match self.ports.lock().await.remove(&port) {
            Some(lease) => {
                let _ = lease.cancel_tx.try_send(());
                info!(port, node_id = %lease.node_id, "port released");
                true
            }
            None => false,
        }
    }

    /// Write bytes from the node link to a local connection. Returns `false` if it is unknown.
    pub async fn write_to_connection(&self, connection_id: Uuid, data: Vec<u8>) -> bool {
        match self.connections.lock().await.get(&connection_id) {
            Some(handle) => handle.write_tx.send(data).is_ok(),
            None => {
                trace!(%connection_id, "data for unknown connection");
                false
            }
        }
    }

    /// Close a local connection without notifying the remote side. Returns `false` if unknown.
    pub async fn close_connection(&self, connection_id: Uuid) -> bool {
        match self.connections.lock().await.remove(&connection_id) {
            Some(handle) => {
                handle.cancel();
                debug!(%connection_id, "connection closed by remote");
                true
            }
            None => false,
        }
    }

    pub async fn has_connection(&self, connection_id: Uuid) -> bool {
        self.connections.lock().await.contains_key(&connection_id)
    }

    pub async fn lease_holder(&self, port: u16) -> Option<Uuid> {
        self.ports.lock().await.get(&port).map(|lease| lease.node_id)
    }

    pub async fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.ports.lock().await.get(&port).map(|lease| lease.local_addr)
    }

    pub async fn allocated_ports(&self) -> Vec<u16> {
        let mut ports: Vec<_> = self.ports.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

impl Drop for InboundForwarder {
    fn drop(&mut self) {
        self.sweeper.abort();
        if let Ok(ports) = self.ports.try_lock() {
            for lease in ports.values() {
                let _ = lease.cancel_tx.try_send(());
            }
        }
        if let Ok(connections) = self.connections.try_lock() {
            for handle in connections.values() {
                handle.cancel();
            }
        }
    }
}

async fn sweep_leases(ports: Arc<Mutex<HashMap<u16, PortLease>>>, options: InboundForwarderOptions) {
    let mut interval = tokio::time::interval(options.sweep_interval);
    loop {
        interval.tick().await;
        let mut ports = ports.lock().await;
        ports.retain(|port, lease| {
            if lease.renewed_at.elapsed() <= options.lease_lifetime {
                return true;
            }
            let _ = lease.cancel_tx.try_send(());
            info!(port, node_id = %lease.node_id, "port lease expired");
            false
        });
    }
}

/// Renew `port` if `node_id` holds it. Returns whether the port is leased at all.
fn renew_lease(ports: &mut HashMap<u16, PortLease>, port: u16, node_id: Uuid) -> bool {
    let Some(lease) = ports.get_mut(&port) else {
        return false;
    };
    if lease.node_id == node_id {
        lease.renewed_at = Instant::now();
        trace!(port, %node_id, "port lease renewed");
    } else {
        debug!(port, holder = %lease.node_id, requester = %node_id, "port leased to another node, ignoring");
    }
    true
}

async fn accept_loop(
    listener: TcpListener,
    mut cancel_rx: mpsc::Receiver<()>,
    port: u16,
    node_id: Uuid,
    sink: Arc<dyn CommandSink>,
    connections: ConnectionMap<RelayHandle>,
    establish_interval: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(port, "listener stopped");
                break;
            }
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let relay = Relay {
                        connection_id: Uuid::new_v4(),
                        node_id,
                        port,
                        sink: sink.clone(),
                        keepalive: Some(establish_interval),
                    };
                    info!(port, %peer, connection_id = %relay.connection_id, %node_id, "local connection accepted");
                    let (handle, channels) = RelayHandle::channel();
                    connections.lock().await.insert(relay.connection_id, handle);
                    tokio::spawn(relay_local(relay, stream, channels, connections.clone()));
                }
                Err(e) => {
                    warn!(port, error = %e, "accept failed");
                }
            }
        }
    }
}

async fn relay_local(
    relay: Relay,
    stream: TcpStream,
    channels: RelayChannels,
    connections: ConnectionMap<RelayHandle>,
) {
    let connection_id = relay.connection_id;
    let establish = Command::establish_connection(connection_id, relay.port);
    if let Err(e) = relay.sink.write_command_to(relay.node_id, establish).await {
        warn!(%connection_id, node_id = %relay.node_id, error = %e, "cannot reach lease holder, dropping connection");
        connections.lock().await.remove(&connection_id);
        return;
    }

    let end = relay.run(stream, channels).await;
    connections.lock().await.remove(&connection_id);
    debug!(%connection_id, ?end, "local connection finished");
}
