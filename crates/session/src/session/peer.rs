//! Remote peer handle.
use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::common::time::LocalDuration;
use crate::engine::{ConnectionState, DeliveryMethod, PeerEngine};
use crate::net::Link;

/// A remote peer.
///
/// The session manager owns every peer for its whole lifetime and hands
/// out shared handles (`Arc<Peer>`) through events and the public API.
/// The address and connection id never change; everything else is
/// delegated to the peer's engine, guarded by a per-peer lock.
pub struct Peer {
    addr: SocketAddr,
    connection_id: i64,
    link: Link,
    engine: Mutex<Box<dyn PeerEngine>>,
}

impl Peer {
    pub(crate) fn new(
        addr: SocketAddr,
        connection_id: i64,
        link: Link,
        engine: Box<dyn PeerEngine>,
    ) -> Self {
        Self {
            addr,
            connection_id,
            link,
            engine: Mutex::new(engine),
        }
    }

    /// The peer's remote address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether we or the remote initiated the connection.
    pub fn link(&self) -> Link {
        self.link
    }

    /// The connection id minted at handshake. Immutable for the life of
    /// the peer; carried in disconnect packets to reject stale ones.
    pub fn connection_id(&self) -> i64 {
        self.connection_id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.engine.lock().unwrap().connection_state()
    }

    /// Current path MTU.
    pub fn mtu(&self) -> usize {
        self.engine.lock().unwrap().mtu()
    }

    /// Time since the last datagram arrived from this peer.
    pub fn time_since_last_packet(&self) -> LocalDuration {
        self.engine.lock().unwrap().time_since_last_packet()
    }

    /// Queue an application payload for sending to this peer.
    pub fn send(&self, data: &[u8], method: DeliveryMethod) {
        self.engine.lock().unwrap().send(data, method);
    }

    /// Force queued payloads onto the wire.
    pub fn flush(&self) {
        self.engine.lock().unwrap().flush();
    }

    pub(crate) fn update(&self, delta: LocalDuration) {
        self.engine.lock().unwrap().update(delta);
    }

    pub(crate) fn process_packet(&self, data: &[u8]) {
        self.engine.lock().unwrap().process_packet(data);
    }

    pub(crate) fn process_connect_accept(&self, data: &[u8]) -> bool {
        self.engine.lock().unwrap().process_connect_accept(data)
    }

    pub(crate) fn shutdown(&self, packet: &[u8]) {
        self.engine.lock().unwrap().shutdown(packet);
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("connection_id", &self.connection_id)
            .field("link", &self.link)
            .finish()
    }
}
