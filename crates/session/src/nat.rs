//! NAT traversal hand-off.
use std::net::SocketAddr;

/// NAT packet classes routed to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatPacketKind {
    /// A peer asks the introducer to broker a hole punch.
    IntroductionRequest,
    /// The introducer tells two peers about each other.
    Introduction,
    /// The hole-punch datagram itself.
    PunchMessage,
}

/// Passive consumer of NAT traversal packets.
///
/// The session manager only classifies and routes; the auxiliary
/// protocol is entirely the handler's business.
pub trait NatHandler: Send + Sync {
    /// A NAT packet arrived from `addr`. `payload` excludes the
    /// property byte.
    fn handle(&self, addr: SocketAddr, kind: NatPacketKind, payload: &[u8]);
}
