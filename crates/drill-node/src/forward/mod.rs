//! Forwarding engine: relays local TCP connections across node links.
//!
//! - [`inbound::InboundForwarder`] exposes leased ports on this node and relays accepted
//!   connections to the lease holder.
//! - [`outbound::OutboundForwarder`] dials local destinations for connections another node
//!   established.
//!
//! Both share the relay loop in [`relay`] and identify connections by a UUID chosen on the
//! accepting side.

pub mod inbound;
pub mod outbound;
mod relay;

pub use inbound::{InboundForwarder, InboundForwarderOptions};
pub use outbound::{OutboundForwarder, OutboundForwarderOptions};
