//! Node composition: transports, forwarders and the command router.

use crate::config::{Config, ForwardRule, NodeAddress, PortRange};
use crate::forward::{
    InboundForwarder, InboundForwarderOptions, OutboundForwarder, OutboundForwarderOptions,
};
use crate::transport::inbound::{InboundOptions, InboundTransport};
use crate::transport::outbound::OutboundTransport;
use crate::transport::{CommandCallback, CommandSink, TransportContext};
use drill_core::{Command, DrillError, DrillResult};
use futures_util::future::BoxFuture;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Period of the `AllocatePort` keep-alive for every forward rule.
pub const ALLOCATE_INTERVAL: Duration = Duration::from_secs(10);

/// Every transport of this node. Filled once during startup.
#[derive(Default)]
pub struct Links {
    inbound: OnceLock<InboundTransport>,
    outbound: OnceLock<Vec<OutboundTransport>>,
}

impl Links {
    pub fn inbound(&self) -> Option<&InboundTransport> {
        self.inbound.get()
    }

    pub fn outbound(&self) -> &[OutboundTransport] {
        self.outbound.get().map(Vec::as_slice).unwrap_or_default()
    }

    /// Outbound transport whose handshake announced `node_id`.
    pub fn outbound_for(&self, node_id: Uuid) -> Option<&OutboundTransport> {
        self.outbound()
            .iter()
            .find(|transport| transport.node_id() == Some(node_id))
    }

    pub fn outbound_for_host(&self, host: &str) -> Option<&OutboundTransport> {
        self.outbound()
            .iter()
            .find(|transport| transport.host() == host)
    }
}

impl CommandSink for Links {
    fn write_command_to(&self, node_id: Uuid, command: Command) -> BoxFuture<'_, DrillResult<()>> {
        Box::pin(async move {
            if let Some(transport) = self.outbound_for(node_id) {
                return transport.write_command(&command).await;
            }
            match self.inbound() {
                Some(inbound) => inbound.write_command_to(node_id, &command).await,
                None => Err(DrillError::NoRoute(node_id)),
            }
        })
    }
}

/// Destination for connections a node establishes on `port` of `host`.
pub fn find_destination(rules: &[ForwardRule], host: &str, port: u16) -> Option<NodeAddress> {
    rules
        .iter()
        .find(|rule| rule.from.host == host && rule.from.port == port)
        .map(|rule| rule.to.clone())
}

/// Routes every command received on any link to the forwarders.
pub struct Router {
    links: Arc<Links>,
    expose_ports: Option<Vec<PortRange>>,
    forward: Vec<ForwardRule>,
    inbound: Option<InboundForwarder>,
    outbound: OutboundForwarder,
}

impl Router {
    /// An inbound forwarder exists only when `expose_ports` is configured.
    pub fn new(
        links: Arc<Links>,
        expose_ports: Option<Vec<PortRange>>,
        forward: Vec<ForwardRule>,
        inbound_options: InboundForwarderOptions,
        outbound_options: OutboundForwarderOptions,
    ) -> Self {
        let sink: Arc<dyn CommandSink> = links.clone();
        let inbound = expose_ports
            .as_ref()
            .map(|_| InboundForwarder::new(sink.clone(), inbound_options));
        let outbound = OutboundForwarder::new(sink, outbound_options);
        Self {
            links,
            expose_ports,
            forward,
            inbound,
            outbound,
        }
    }

    pub fn can_expose_port(&self, port: u16) -> bool {
        self.expose_ports
            .iter()
            .flatten()
            .any(|range| range.contains(port))
    }

    /// Where to dial for a connection `node_id` establishes on `port`, if we forward it.
    pub fn destination_for(&self, node_id: Uuid, port: u16) -> Option<NodeAddress> {
        let transport = self.links.outbound_for(node_id)?;
        find_destination(&self.forward, transport.host(), port)
    }

    pub fn inbound_forwarder(&self) -> Option<&InboundForwarder> {
        self.inbound.as_ref()
    }

    pub fn outbound_forwarder(&self) -> &OutboundForwarder {
        &self.outbound
    }

    pub async fn dispatch(&self, command: Command, context: TransportContext) {
        let node_id = context.node_id;
        match command {
            Command::AllocatePort { port } => match &self.inbound {
                Some(forwarder) if self.can_expose_port(port) => {
                    if let Err(e) = forwarder.allocate_port(port, node_id).await {
                        warn!(port, %node_id, error = %e, "cannot allocate port");
                    }
                }
                _ => debug!(port, %node_id, "port not exposed, ignoring allocation"),
            },
            Command::EstablishConnection {
                connection_id,
                port,
            } => match self.destination_for(node_id, port) {
                Some(destination) => {
                    self.outbound
                        .establish_connection(node_id, connection_id, port, destination)
                        .await;
                }
                None => {
                    debug!(%connection_id, port, %node_id, "no forward rule, ignoring connection")
                }
            },
            Command::CloseConnection { connection_id, .. } => {
                if let Some(forwarder) = &self.inbound {
                    forwarder.close_connection(connection_id).await;
                }
                self.outbound.close_connection(connection_id).await;
            }
            Command::SendData {
                connection_id,
                data,
            } => {
                if let Some(forwarder) = &self.inbound {
                    if forwarder.has_connection(connection_id).await {
                        forwarder.write_to_connection(connection_id, data).await;
                        return;
                    }
                }
                self.outbound.write_to_connection(connection_id, data).await;
            }
            Command::Auth(_) | Command::Hello { .. } => {
                debug!(%node_id, socket = context.socket.id(), command = ?command.command_type(), "handshake command after handshake, ignoring");
            }
        }
    }

    /// Callback handing commands to this router. Holds it weakly so links do not keep it alive.
    fn callback(self: &Arc<Self>) -> CommandCallback {
        let router = Arc::downgrade(self);
        Arc::new(move |command: Command, context: TransportContext| -> BoxFuture<'static, ()> {
            let router = router.clone();
            Box::pin(async move {
                if let Some(router) = router.upgrade() {
                    router.dispatch(command, context).await;
                }
            })
        })
    }
}

/// A running node.
pub struct Drill {
    node_id: Uuid,
    links: Arc<Links>,
    router: Arc<Router>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drill {
    /// Start every transport and forwarder `config` asks for.
    ///
    /// Fails if the node port cannot be bound.
    pub async fn start(config: Config, node_id: Uuid) -> DrillResult<Self> {
        info!(%node_id, "starting node");
        let links = Arc::new(Links::default());
        let router = Arc::new(Router::new(
            links.clone(),
            config.expose_ports.clone(),
            config.forward.clone(),
            InboundForwarderOptions::default(),
            OutboundForwarderOptions::default(),
        ));
        let callback = router.callback();

        if let Some(port) = config.node_port {
            let inbound = InboundTransport::bind(
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
                node_id,
                config.password.clone(),
                callback.clone(),
                InboundOptions::default(),
            )
            .await?;
            let _ = links.inbound.set(inbound);
        }

        let outbound = config
            .nodes
            .iter()
            .map(|peer| {
                info!(address = %peer.address, "linking to node");
                OutboundTransport::new(
                    node_id,
                    peer.address.clone(),
                    peer.password.clone(),
                    callback.clone(),
                    config.pool,
                )
            })
            .collect();
        let _ = links.outbound.set(outbound);

        let mut tasks = Vec::new();
        for rule in &config.forward {
            if links.outbound_for_host(&rule.from.host).is_none() {
                warn!(from = %rule.from, "no node configured for forward source, skipping");
                continue;
            }
            tasks.push(tokio::spawn(keep_port_allocated(
                links.clone(),
                rule.from.clone(),
            )));
        }

        Ok(Self {
            node_id,
            links,
            router,
            tasks,
        })
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Address of the node port, if this node accepts links.
    pub fn inbound_addr(&self) -> Option<SocketAddr> {
        self.links.inbound().map(InboundTransport::local_addr)
    }

    #[cfg(test)]
    pub fn links(&self) -> &Links {
        &self.links
    }

    #[cfg(test)]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Log pool occupancy, links, leases and relayed connections.
    pub async fn log_status(&self) {
        for transport in self.links.outbound() {
            let stats = transport.stats();
            debug!(
                address = %transport.address(),
                node_id = ?transport.node_id(),
                pending = stats.pending,
                available = stats.available,
                in_use = stats.in_use,
                "outbound pool"
            );
        }
        if let Some(inbound) = self.links.inbound() {
            debug!(
                nodes = inbound.connected_nodes().len(),
                sockets = inbound.socket_count(),
                "inbound links"
            );
        }
        if let Some(forwarder) = self.router.inbound_forwarder() {
            for port in forwarder.allocated_ports().await {
                let holder = forwarder.lease_holder(port).await;
                let addr = forwarder.local_addr(port).await;
                debug!(port, holder = ?holder, addr = ?addr, "port lease");
            }
            let connections = forwarder.connection_count().await;
            debug!(connections, "exposed connections");
        }
        let connections = self.router.outbound_forwarder().connection_count().await;
        debug!(connections, "forwarded connections");
    }

    /// Release exposed ports and close every link.
    ///
    /// Relayed connections close when the forwarders drop with the router.
    pub async fn shutdown(self) {
        info!(node_id = %self.node_id, "shutting down node");
        for task in &self.tasks {
            task.abort();
        }
        if let Some(forwarder) = self.router.inbound_forwarder() {
            for port in forwarder.allocated_ports().await {
                forwarder.deallocate_port(port).await;
            }
        }
        if let Some(inbound) = self.links.inbound() {
            inbound.close().await;
        }
        for transport in self.links.outbound() {
            transport.close().await;
        }
    }
}

impl Drop for Drill {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Allocate `from.port` on its node now and every [`ALLOCATE_INTERVAL`].
async fn keep_port_allocated(links: Arc<Links>, from: NodeAddress) {
    let mut interval = tokio::time::interval(ALLOCATE_INTERVAL);
    loop {
        interval.tick().await;
        let Some(transport) = links.outbound_for_host(&from.host) else {
            return;
        };
        match transport.write_command(&Command::allocate_port(from.port)).await {
            Ok(()) => debug!(%from, "port allocation sent"),
            Err(e) => warn!(%from, error = %e, "port allocation failed"),
        }
    }
}
