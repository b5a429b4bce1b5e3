//! Peer engine interface.
//!
//! The session manager owns the peer table and the connection protocol;
//! everything per-peer and reliability-related (retransmission windows,
//! acks, channels, MTU discovery, RTT estimation) lives behind the
//! [`PeerEngine`] trait. Engines are minted by an [`EngineFactory`] and
//! talk back to the manager through the non-owning [`EngineHost`]
//! capability set.
use std::io;
use std::net::SocketAddr;

use crate::common::time::LocalDuration;

/// Connection state of a peer, as tracked by its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in flight; the engine is retransmitting the connect request.
    Connecting,
    /// Handshake completed.
    Connected,
    /// A graceful disconnect was initiated locally; the engine is
    /// retransmitting the disconnect packet until acknowledged.
    ShutdownRequested,
    /// The connection is dead. The session manager reaps peers in this
    /// state on its next logic tick.
    Disconnected,
}

/// Delivery guarantees for outbound payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMethod {
    /// Fire and forget.
    #[default]
    Unreliable,
    /// Unreliable, but stale datagrams are dropped.
    Sequenced,
    /// Retransmitted until acknowledged, any order.
    ReliableUnordered,
    /// Retransmitted until acknowledged, in order.
    ReliableOrdered,
}

/// Engine knobs carried by the session configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Keepalive ping cadence.
    pub ping_interval: LocalDuration,
    /// Delay between connect-request retransmissions.
    pub reconnect_delay: LocalDuration,
    /// Connect-request retransmissions before the handshake is abandoned.
    pub max_connect_attempts: u32,
    /// Whether small outbound packets may be merged into one datagram.
    pub merge_enabled: bool,
}

/// Capabilities an engine may invoke on the session manager.
///
/// Handed out as a non-owning handle: a host that has been stopped and
/// dropped turns every call into a no-op, so engines never keep the
/// manager alive and never touch freed state.
pub trait EngineHost: Send + Sync {
    /// Put a raw datagram on the wire.
    ///
    /// Send failures are subject to the manager's error policy; transient
    /// failures (no route, full send buffer) report `Ok(0)`.
    fn send_raw(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Deliver an application payload received from `addr` to the host
    /// as a Receive event.
    ///
    /// With unsynced events enabled the listener runs inside this call,
    /// while the calling engine's lock is held: the listener must not
    /// call back into operations on that same peer.
    fn deliver(&self, addr: SocketAddr, payload: &[u8]);

    /// Report a fresh round-trip latency estimate for `addr`. The
    /// unsynced-dispatch caveat of [`EngineHost::deliver`] applies.
    fn latency_update(&self, addr: SocketAddr, latency_ms: u32);
}

/// Per-peer reliability engine.
///
/// All methods are called with the peer's engine lock held; the session
/// manager never holds a table lock while calling into an engine.
pub trait PeerEngine: Send {
    /// Advance timers: retransmissions, acks, keepalives, handshake
    /// attempts. Called from the logic thread every update period.
    fn update(&mut self, delta: LocalDuration);

    /// Ingest an inbound datagram addressed to this peer. The slice is
    /// the whole datagram, property byte included.
    fn process_packet(&mut self, data: &[u8]);

    /// Ingest a connect-accept datagram. Returns `true` if the handshake
    /// completed and the peer is now connected.
    fn process_connect_accept(&mut self, data: &[u8]) -> bool;

    /// Queue an application payload for sending.
    fn send(&mut self, data: &[u8], method: DeliveryMethod);

    /// Begin a graceful shutdown: retransmit `packet` (a pre-built
    /// disconnect datagram) until the remote acknowledges, and move to
    /// [`ConnectionState::ShutdownRequested`].
    fn shutdown(&mut self, packet: &[u8]);

    /// Force queued payloads onto the wire.
    fn flush(&mut self);

    /// Current connection state.
    fn connection_state(&self) -> ConnectionState;

    /// Current path MTU.
    fn mtu(&self) -> usize;

    /// Time since the last datagram arrived from this peer.
    fn time_since_last_packet(&self) -> LocalDuration;
}

/// Mints engines for new peers.
pub trait EngineFactory: Send + Sync {
    /// Engine for an outbound peer. The engine starts in
    /// [`ConnectionState::Connecting`] and owns retransmission of the
    /// connect request built from `payload`.
    fn outbound(
        &self,
        addr: SocketAddr,
        connection_id: i64,
        payload: &[u8],
        config: &EngineConfig,
        host: std::sync::Arc<dyn EngineHost>,
    ) -> Box<dyn PeerEngine>;

    /// Engine for an accepted inbound peer, starting connected.
    fn inbound(
        &self,
        addr: SocketAddr,
        connection_id: i64,
        config: &EngineConfig,
        host: std::sync::Arc<dyn EngineHost>,
    ) -> Box<dyn PeerEngine>;
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Engine {}

    impl PeerEngine for Engine {
        fn update(&mut self, delta: LocalDuration);
        fn process_packet(&mut self, data: &[u8]);
        fn process_connect_accept(&mut self, data: &[u8]) -> bool;
        fn send(&mut self, data: &[u8], method: DeliveryMethod);
        fn shutdown(&mut self, packet: &[u8]);
        fn flush(&mut self);
        fn connection_state(&self) -> ConnectionState;
        fn mtu(&self) -> usize;
        fn time_since_last_packet(&self) -> LocalDuration;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_mock() {
        let mut mock = MockEngine::new();

        mock.expect_connection_state()
            .returning(|| ConnectionState::Connected);
        assert_eq!(mock.connection_state(), ConnectionState::Connected);
    }
}
