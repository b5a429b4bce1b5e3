//! Pooled events and host-facing dispatch.
//!
//! Events are drawn from a LIFO pool so the hot path stops allocating
//! after warm-up, queued FIFO, and handed to the host listener either
//! from `poll_events` (default) or inline on the emitting thread when
//! unsynced dispatch is enabled. An event's payload buffer is owned by
//! the event; the reader passed to the listener borrows it, so anything
//! the host wants to keep past the callback must be copied out.
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::session::manager::ConnectionRequest;
use crate::session::peer::Peer;
use crate::wire::Reader;

/// Why a peer was disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectReason {
    /// The handshake ran out of connect attempts, or the engine gave up
    /// on the connection.
    #[default]
    ConnectionFailed,
    /// Nothing was heard from the peer within the disconnect timeout.
    Timeout,
    /// The remote sent a disconnect packet.
    RemoteConnectionClose,
    /// The local host asked for the disconnect.
    DisconnectPeerCalled,
    /// A datagram destined for the peer could not be sent.
    SocketSendError,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed => write!(f, "connection failed"),
            Self::Timeout => write!(f, "timed out"),
            Self::RemoteConnectionClose => write!(f, "closed by remote"),
            Self::DisconnectPeerCalled => write!(f, "disconnected locally"),
            Self::SocketSendError => write!(f, "socket send error"),
        }
    }
}

/// Details accompanying a peer disconnect.
pub struct DisconnectInfo<'a> {
    /// Why the peer is gone.
    pub reason: DisconnectReason,
    /// OS error code when `reason` is [`DisconnectReason::SocketSendError`].
    pub socket_error_code: i32,
    /// Payload carried by the remote's disconnect packet, if any.
    pub data: Reader<'a>,
}

/// Origin class of an out-of-session datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnconnectedKind {
    /// A plain unconnected message.
    Message,
    /// A LAN discovery probe.
    DiscoveryRequest,
    /// A reply to a LAN discovery probe.
    DiscoveryResponse,
}

/// The capability set the host provides to receive session events.
///
/// With unsynced dispatch enabled, callbacks run on whichever internal
/// thread emitted the event; otherwise they run on the thread calling
/// `poll_events`.
pub trait EventListener: Send + Sync {
    /// A peer completed its handshake.
    fn on_peer_connected(&self, peer: &Arc<Peer>);

    /// A peer is gone. This is the last event for the peer.
    fn on_peer_disconnected(&self, peer: &Arc<Peer>, info: DisconnectInfo<'_>);

    /// An application payload arrived from a connected peer.
    fn on_receive(&self, peer: &Arc<Peer>, data: &mut Reader<'_>);

    /// An out-of-session datagram arrived.
    fn on_receive_unconnected(&self, addr: SocketAddr, data: &mut Reader<'_>, kind: UnconnectedKind);

    /// A socket error occurred. `addr` is the remote involved, when known.
    fn on_error(&self, addr: Option<SocketAddr>, error_code: i32);

    /// A fresh latency estimate for a connected peer.
    fn on_latency_update(&self, peer: &Arc<Peer>, latency_ms: u32);

    /// A remote wants to connect. Resolve by calling
    /// [`ConnectionRequest::accept`] or [`ConnectionRequest::reject`].
    fn on_connection_request(&self, request: ConnectionRequest);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum EventKind {
    #[default]
    Connect,
    Disconnect,
    Receive,
    ReceiveUnconnected,
    Error,
    LatencyUpdate,
    DiscoveryRequest,
    DiscoveryResponse,
    ConnectionRequest,
}

/// A pooled event record.
#[derive(Default)]
pub(crate) struct Event {
    pub kind: EventKind,
    pub peer: Option<Arc<Peer>>,
    pub addr: Option<SocketAddr>,
    /// Reusable payload buffer; readers handed to the listener borrow it.
    pub payload: Vec<u8>,
    /// Latency in milliseconds, or an OS error code.
    pub aux: i32,
    pub reason: DisconnectReason,
    pub request: Option<ConnectionRequest>,
}

impl Event {
    /// Hand the event to the listener.
    pub fn dispatch(&mut self, listener: &dyn EventListener) {
        match self.kind {
            EventKind::Connect => {
                if let Some(peer) = &self.peer {
                    listener.on_peer_connected(peer);
                }
            }
            EventKind::Disconnect => {
                if let Some(peer) = &self.peer {
                    listener.on_peer_disconnected(
                        peer,
                        DisconnectInfo {
                            reason: self.reason,
                            socket_error_code: self.aux,
                            data: Reader::new(&self.payload),
                        },
                    );
                }
            }
            EventKind::Receive => {
                if let Some(peer) = &self.peer {
                    listener.on_receive(peer, &mut Reader::new(&self.payload));
                }
            }
            EventKind::ReceiveUnconnected => {
                if let Some(addr) = self.addr {
                    listener.on_receive_unconnected(
                        addr,
                        &mut Reader::new(&self.payload),
                        UnconnectedKind::Message,
                    );
                }
            }
            EventKind::DiscoveryRequest => {
                if let Some(addr) = self.addr {
                    listener.on_receive_unconnected(
                        addr,
                        &mut Reader::new(&self.payload),
                        UnconnectedKind::DiscoveryRequest,
                    );
                }
            }
            EventKind::DiscoveryResponse => {
                if let Some(addr) = self.addr {
                    listener.on_receive_unconnected(
                        addr,
                        &mut Reader::new(&self.payload),
                        UnconnectedKind::DiscoveryResponse,
                    );
                }
            }
            EventKind::Error => {
                listener.on_error(self.addr, self.aux);
            }
            EventKind::LatencyUpdate => {
                if let Some(peer) = &self.peer {
                    listener.on_latency_update(peer, self.aux as u32);
                }
            }
            EventKind::ConnectionRequest => {
                if let Some(request) = self.request.take() {
                    listener.on_connection_request(request);
                }
            }
        }
    }
}

/// LIFO reservoir of recycled events.
pub(crate) struct EventPool {
    free: Mutex<Vec<Box<Event>>>,
}

impl EventPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Pop a recycled event, or allocate a fresh one.
    pub fn acquire(&self, kind: EventKind) -> Box<Event> {
        let mut event = self
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Box::new(Event::default()));
        event.kind = kind;

        event
    }

    /// Reset an event and return it to the pool. The payload buffer
    /// keeps its capacity.
    pub fn recycle(&self, mut event: Box<Event>) {
        event.peer = None;
        event.addr = None;
        event.payload.clear();
        event.aux = 0;
        event.reason = DisconnectReason::default();
        event.request = None;

        self.free.lock().unwrap().push(event);
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// FIFO hand-off between the internal threads and the host poll.
pub(crate) struct EventQueue {
    queue: Mutex<VecDeque<Box<Event>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, event: Box<Event>) {
        self.queue.lock().unwrap().push_back(event);
    }

    /// Pop one event. The lock is released before the caller dispatches.
    pub fn pop(&self) -> Option<Box<Event>> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Drop all queued events, recycling them into `pool`.
    pub fn drain_into(&self, pool: &EventPool) {
        while let Some(event) = self.pop() {
            pool.recycle(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reuses_events() {
        let pool = EventPool::new();

        let mut event = pool.acquire(EventKind::Receive);
        event.payload.extend_from_slice(b"payload");
        event.aux = 42;
        pool.recycle(event);
        assert_eq!(pool.free_count(), 1);

        let event = pool.acquire(EventKind::Error);
        assert_eq!(event.kind, EventKind::Error);
        assert!(event.payload.is_empty());
        assert_eq!(event.aux, 0);
        assert!(event.peer.is_none());
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_pool_bounded_by_in_flight_events() {
        let pool = EventPool::new();

        for _ in 0..3 {
            let a = pool.acquire(EventKind::Connect);
            let b = pool.acquire(EventKind::Receive);
            pool.recycle(a);
            pool.recycle(b);
        }
        // Two events were ever in flight at once.
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_queue_is_fifo() {
        let pool = EventPool::new();
        let queue = EventQueue::new();

        for aux in 0..4 {
            let mut event = pool.acquire(EventKind::Error);
            event.aux = aux;
            queue.push(event);
        }
        for aux in 0..4 {
            let event = queue.pop().unwrap();
            assert_eq!(event.aux, aux);
            pool.recycle(event);
        }
        assert!(queue.pop().is_none());
    }
}
