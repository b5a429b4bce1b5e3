//! Session manager: owns the socket, the peer tables and the event
//! machinery, and coordinates the receive and logic threads.
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::thread::JoinHandle;

use flume as chan;
use tracing::{debug, error, trace, warn};

use crate::common::time::{LocalDuration, LocalTime};
use crate::engine::{ConnectionState, DeliveryMethod, EngineConfig, EngineFactory, EngineHost};
use crate::error::Error;
use crate::nat::{NatHandler, NatPacketKind};
use crate::net;
use crate::net::Link;
use crate::session::event::{
    DisconnectReason, Event, EventKind, EventListener, EventPool, EventQueue,
};
use crate::session::peer::Peer;
#[cfg(debug_assertions)]
use crate::session::simulator::{IngressSimulator, SimulatorConfig};
use crate::session::table::{PeerTable, RemoveIf, ShutdownTable};
use crate::wire;
use crate::wire::{PacketKind, Reader};

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Peer table capacity. Outbound connects return no handle and
    /// inbound connect requests are ignored once reached.
    pub max_peers: usize,
    /// Accept inbound unconnected messages as events.
    pub unconnected_messages_enabled: bool,
    /// Accept inbound discovery requests as events.
    pub discovery_enabled: bool,
    /// Route NAT traversal packets to the NAT handler.
    pub nat_punch_enabled: bool,
    /// Dispatch events inline on the emitting thread instead of queuing
    /// them for `poll_events`. The host takes over thread safety and
    /// must copy out any payload it wants to keep past the callback.
    /// Receive and LatencyUpdate events fire from inside the
    /// originating engine; their callbacks must not call back into
    /// that same peer.
    pub unsynced_events: bool,
    /// Let engines merge small packets into one datagram.
    pub merge_enabled: bool,
    /// Bind the socket with `SO_REUSEADDR`.
    pub reuse_address: bool,
    /// Logic tick period.
    pub update_time: LocalDuration,
    /// Keepalive ping cadence, consumed by peer engines.
    pub ping_interval: LocalDuration,
    /// Inactivity bound after which a connected peer is dropped.
    pub disconnect_timeout: LocalDuration,
    /// Delay between connect attempts, consumed by peer engines.
    pub reconnect_delay: LocalDuration,
    /// Connect attempts before the handshake is abandoned, consumed by
    /// peer engines.
    pub max_connect_attempts: u32,
    /// Drop every peer when the socket reports a receive error. Matches
    /// the historical behavior of this protocol family; disable to keep
    /// peers across transient receive failures.
    pub clear_peers_on_receive_error: bool,
    /// Ingress simulator: drop inbound datagrams at random (debug builds).
    pub simulate_packet_loss: bool,
    /// Ingress simulator: delay inbound datagrams at random (debug builds).
    pub simulate_latency: bool,
    /// Simulated loss probability, in percent.
    pub simulation_packet_loss_chance: u8,
    /// Lower bound of the simulated delay.
    pub simulation_min_latency: LocalDuration,
    /// Upper bound of the simulated delay.
    pub simulation_max_latency: LocalDuration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_peers: 16,
            unconnected_messages_enabled: false,
            discovery_enabled: false,
            nat_punch_enabled: false,
            unsynced_events: false,
            merge_enabled: false,
            reuse_address: false,
            update_time: LocalDuration::from_millis(15),
            ping_interval: LocalDuration::from_millis(1000),
            disconnect_timeout: LocalDuration::from_millis(5000),
            reconnect_delay: LocalDuration::from_millis(500),
            max_connect_attempts: 10,
            clear_peers_on_receive_error: true,
            simulate_packet_loss: false,
            simulate_latency: false,
            simulation_packet_loss_chance: 10,
            simulation_min_latency: LocalDuration::from_millis(30),
            simulation_max_latency: LocalDuration::from_millis(100),
        }
    }
}

/// An inbound connect awaiting the host's verdict.
///
/// Emitted through [`EventListener::on_connection_request`]; the host
/// answers by calling [`accept`](Self::accept) or
/// [`reject`](Self::reject), exactly once. A request outliving the
/// manager resolves to nothing.
pub struct ConnectionRequest {
    addr: SocketAddr,
    connection_id: i64,
    payload: Vec<u8>,
    resolved: AtomicBool,
    manager: Weak<Inner>,
}

impl ConnectionRequest {
    /// The requesting remote address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The connection id proposed by the remote.
    pub fn connection_id(&self) -> i64 {
        self.connection_id
    }

    /// Reader over the request payload that followed the handshake header.
    pub fn data(&self) -> Reader<'_> {
        Reader::new(&self.payload)
    }

    /// Accept the connection: create the peer and emit a Connect event.
    ///
    /// Returns the peer handle, or the existing one if the address was
    /// connected in the meantime. Returns nothing when the request was
    /// already resolved, the table filled up, or the manager is gone.
    pub fn accept(&self) -> Option<Arc<Peer>> {
        if self.resolved.swap(true, Ordering::AcqRel) {
            warn!(target: "session", "{}: connection request already resolved", self.addr);
            return None;
        }
        let inner = self.manager.upgrade()?;

        inner.accept_request(self.addr, self.connection_id)
    }

    /// Decline the connection. Nothing is sent to the remote.
    pub fn reject(&self) {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.manager.upgrade() {
            inner.pending_requests.lock().unwrap().remove(&self.addr);
            debug!(target: "session", "{}: connection request rejected", self.addr);
        }
    }
}

impl std::fmt::Debug for ConnectionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRequest")
            .field("addr", &self.addr)
            .field("connection_id", &self.connection_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Coordinates one datagram socket shared by many remote peers:
/// handshake, liveness, packet demultiplexing, reliable disconnection
/// and event delivery to the host.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager with the given listener and engine factory.
    pub fn new(
        config: Config,
        listener: Arc<dyn EventListener>,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        Self::with_nat_handler(config, listener, factory, None)
    }

    /// Create a manager that routes NAT packets to `nat` when
    /// `nat_punch_enabled` is set.
    pub fn with_nat_handler(
        config: Config,
        listener: Arc<dyn EventListener>,
        factory: Arc<dyn EngineFactory>,
        nat: Option<Arc<dyn NatHandler>>,
    ) -> Self {
        let engine_config = EngineConfig {
            ping_interval: config.ping_interval,
            reconnect_delay: config.reconnect_delay,
            max_connect_attempts: config.max_connect_attempts,
            merge_enabled: config.merge_enabled,
        };
        #[cfg(debug_assertions)]
        let simulator_config = (config.simulate_packet_loss || config.simulate_latency).then(|| {
            SimulatorConfig {
                packet_loss: config.simulate_packet_loss,
                latency: config.simulate_latency,
                packet_loss_chance: config.simulation_packet_loss_chance,
                min_latency: config.simulation_min_latency,
                max_latency: config.simulation_max_latency,
            }
        });

        let inner = Arc::new_cyclic(|weak| Inner {
            weak: weak.clone(),
            peers: PeerTable::new(config.max_peers),
            shutdown_peers: ShutdownTable::new(),
            pending_requests: Mutex::new(HashMap::new()),
            pending_send_errors: Mutex::new(Vec::new()),
            pool: EventPool::new(),
            queue: EventQueue::new(),
            listener,
            factory,
            nat,
            engine_config,
            running: Arc::new(AtomicBool::new(false)),
            socket: Mutex::new(None),
            waker: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            tick_stop: Mutex::new(None),
            rng: Mutex::new(fastrand::Rng::new()),
            #[cfg(debug_assertions)]
            simulator: IngressSimulator::new(fastrand::Rng::new()),
            #[cfg(debug_assertions)]
            simulator_config,
            config,
        });

        Self { inner }
    }

    /// Bind the socket on `port` (0 picks an ephemeral port) and start
    /// the receive and logic threads.
    pub fn start(&self, port: u16) -> Result<(), Error> {
        let inner = &self.inner;

        if inner.running.load(Ordering::Acquire) {
            return Err(Error::AlreadyRunning);
        }
        let socket = Arc::new(net::bind(port, inner.config.reuse_address).map_err(Error::Bind)?);
        let receiver = net::Receiver::new(socket.clone())?;

        *inner.socket.lock().unwrap() = Some(socket);
        *inner.waker.lock().unwrap() = Some(receiver.waker());
        inner.running.store(true, Ordering::Release);

        let io_thread = {
            let inner = inner.clone();
            let running = inner.running.clone();
            thread::Builder::new().name("session-io".into()).spawn(move || {
                let on_datagram = |data: &[u8], addr: SocketAddr| {
                    // A misbehaving listener on the unsynced path must not
                    // tear down the receive loop.
                    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                        inner.handle_datagram(data, addr)
                    }));
                    if result.is_err() {
                        error!(target: "session", "{}: panic while processing datagram", addr);
                    }
                };
                let on_error = |err: io::Error| inner.handle_receive_error(&err);

                receiver.run(running, on_datagram, on_error);
            })?
        };

        let (tick_tx, tick_rx) = chan::bounded::<()>(1);
        let logic_thread = {
            let inner = inner.clone();
            let period: std::time::Duration = inner.config.update_time.into();
            thread::Builder::new().name("session-logic".into()).spawn(move || {
                let mut last = LocalTime::now();
                loop {
                    match tick_rx.recv_timeout(period) {
                        Err(chan::RecvTimeoutError::Timeout) => {
                            let now = LocalTime::now();
                            inner.logic_tick(now - last);
                            last = now;
                        }
                        Ok(()) | Err(chan::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?
        };

        *inner.tick_stop.lock().unwrap() = Some(tick_tx);
        inner.threads.lock().unwrap().extend([io_thread, logic_thread]);

        debug!(target: "session", "started on port {}", self.local_port().unwrap_or(port));

        Ok(())
    }

    /// Stop the manager: best-effort terminal disconnects, join both
    /// threads, close the socket. Idempotent.
    pub fn stop(&self) {
        let inner = &self.inner;

        if !inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(target: "session", "stopping");

        // Fire-and-forget disconnects; nobody waits for acknowledgement.
        let socket = inner.socket.lock().unwrap().clone();
        for peer in inner.peers.take_all() {
            if let Some(socket) = &socket {
                let packet = wire::disconnect(peer.connection_id(), &[]);
                socket.send_to(&packet, peer.addr()).ok();
            }
        }
        inner.shutdown_peers.clear();
        inner.pending_requests.lock().unwrap().clear();
        inner.pending_send_errors.lock().unwrap().clear();

        // Dropping the sender ends the logic loop; the waker interrupts
        // the receive poll so it observes the cleared running flag.
        inner.tick_stop.lock().unwrap().take();
        if let Some(waker) = inner.waker.lock().unwrap().take() {
            waker.wake().ok();
        }

        let handles: Vec<JoinHandle<()>> = inner.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            // Listener callbacks may call `stop` from an internal thread.
            if handle.thread().id() != thread::current().id() {
                handle.join().ok();
            }
        }

        *inner.socket.lock().unwrap() = None;
        inner.queue.drain_into(&inner.pool);
    }

    /// Whether the manager has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Port the socket is bound to, while running.
    pub fn local_port(&self) -> Option<u16> {
        let socket = self.inner.socket.lock().unwrap();
        socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    /// Initiate an outbound connection to `addr`.
    ///
    /// Returns the existing handle if the address is already connected
    /// or connecting, and no handle when the peer table is full. The
    /// peer engine owns retransmission of the connect request carrying
    /// `payload`.
    pub fn connect(&self, addr: SocketAddr, payload: &[u8]) -> Result<Option<Arc<Peer>>, Error> {
        let inner = &self.inner;

        if !inner.running.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }
        if let Some(existing) = inner.peers.get(&addr) {
            return Ok(Some(existing));
        }
        // Reconnecting to an address still draining its shutdown
        // abandons the old entry.
        inner.shutdown_peers.remove(&addr);

        let connection_id = inner.rng.lock().unwrap().i64(..);
        let engine = inner.factory.outbound(
            addr,
            connection_id,
            payload,
            &inner.engine_config,
            inner.host(),
        );
        let peer = Arc::new(Peer::new(addr, connection_id, Link::Outbound, engine));

        if inner.peers.insert(peer.clone()) {
            debug!(target: "session", "{}: connecting (id {})", addr, connection_id);
            Ok(Some(peer))
        } else {
            // Lost a race with an inbound accept, or the table is full.
            Ok(inner.peers.get(&addr))
        }
    }

    /// Gracefully disconnect a peer.
    ///
    /// `payload` rides in the disconnect packet unless it would not fit
    /// the peer's MTU, in which case it is dropped. The packet is
    /// retransmitted by the engine until the remote acknowledges.
    pub fn disconnect_peer(&self, peer: &Arc<Peer>, payload: &[u8]) {
        self.inner
            .disconnect(peer, DisconnectReason::DisconnectPeerCalled, 0, payload, true);
    }

    /// Disconnect a peer without waiting for acknowledgement. The
    /// disconnect packet is sent once, best-effort.
    pub fn disconnect_peer_force(&self, peer: &Arc<Peer>) {
        self.inner
            .disconnect(peer, DisconnectReason::DisconnectPeerCalled, 0, &[], false);
    }

    /// Send `data` to every connected peer, optionally excluding one.
    pub fn send_to_all(
        &self,
        data: &[u8],
        method: DeliveryMethod,
        exclude: Option<&Arc<Peer>>,
    ) -> Result<(), Error> {
        let inner = &self.inner;

        if !inner.running.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }
        let mut peers = Vec::new();
        inner.peers.snapshot(&mut peers);

        for peer in peers {
            if exclude.map_or(false, |ex| Arc::ptr_eq(&peer, ex)) {
                continue;
            }
            if peer.state() == ConnectionState::Connected {
                peer.send(data, method);
            }
        }
        Ok(())
    }

    /// Force every peer's queued payloads onto the wire.
    pub fn flush(&self) {
        let mut peers = Vec::new();
        self.inner.peers.snapshot(&mut peers);

        for peer in peers {
            peer.flush();
        }
    }

    /// Send a sessionless application datagram. The receiver only
    /// surfaces it when it accepts unconnected messages.
    pub fn send_unconnected_message(&self, data: &[u8], addr: SocketAddr) -> Result<bool, Error> {
        self.send_out_of_band(PacketKind::UnconnectedMessage, data, addr)
    }

    /// Broadcast a discovery probe to the LAN on `port`.
    pub fn send_discovery_request(&self, data: &[u8], port: u16) -> Result<bool, Error> {
        let addr = SocketAddr::from((Ipv4Addr::BROADCAST, port));
        self.send_out_of_band(PacketKind::DiscoveryRequest, data, addr)
    }

    /// Reply to a discovery probe.
    pub fn send_discovery_response(&self, data: &[u8], addr: SocketAddr) -> Result<bool, Error> {
        self.send_out_of_band(PacketKind::DiscoveryResponse, data, addr)
    }

    fn send_out_of_band(
        &self,
        kind: PacketKind,
        data: &[u8],
        addr: SocketAddr,
    ) -> Result<bool, Error> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }
        let datagram = wire::unconnected(kind, data);

        Ok(self
            .inner
            .send_raw(&datagram, addr)
            .map(|sent| sent > 0)
            .unwrap_or(false))
    }

    /// Drain queued events, dispatching each to the listener on the
    /// calling thread. No lock is held while the listener runs.
    pub fn poll_events(&self) {
        while let Some(mut event) = self.inner.queue.pop() {
            event.dispatch(self.inner.listener.as_ref());
            self.inner.pool.recycle(event);
        }
    }

    /// Snapshot of the connected peers.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        let mut out = Vec::new();
        self.peers_into(&mut out);
        out
    }

    /// Snapshot of the connected peers, into a caller-owned buffer.
    pub fn peers_into(&self, out: &mut Vec<Arc<Peer>>) {
        out.clear();
        self.inner.peers.snapshot(out);
        out.retain(|peer| peer.state() == ConnectionState::Connected);
    }

    /// Number of peers in the table, any state.
    pub fn peers_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// An arbitrary peer from the table, if any.
    pub fn first_peer(&self) -> Option<Arc<Peer>> {
        self.inner.peers.first()
    }
}

struct Inner {
    weak: Weak<Inner>,
    config: Config,
    engine_config: EngineConfig,
    listener: Arc<dyn EventListener>,
    factory: Arc<dyn EngineFactory>,
    nat: Option<Arc<dyn NatHandler>>,
    peers: PeerTable,
    shutdown_peers: ShutdownTable,
    /// Inbound connect requests the host has not resolved yet.
    pending_requests: Mutex<HashMap<SocketAddr, i64>>,
    /// Fatal send errors awaiting the next logic tick.
    pending_send_errors: Mutex<Vec<(SocketAddr, i32)>>,
    pool: EventPool,
    queue: EventQueue,
    running: Arc<AtomicBool>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    waker: Mutex<Option<net::Waker>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    tick_stop: Mutex<Option<chan::Sender<()>>>,
    rng: Mutex<fastrand::Rng>,
    #[cfg(debug_assertions)]
    simulator: IngressSimulator,
    #[cfg(debug_assertions)]
    simulator_config: Option<SimulatorConfig>,
}

impl Inner {
    fn host(&self) -> Arc<dyn EngineHost> {
        Arc::new(HostHandle {
            inner: self.weak.clone(),
        })
    }

    /// Entry point for every inbound datagram.
    fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        #[cfg(debug_assertions)]
        {
            if let Some(config) = &self.simulator_config {
                if self.simulator.intercept(config, data, addr, LocalTime::now()) {
                    return;
                }
            }
        }
        self.classify(data, addr);
    }

    /// Parse the property header and route the datagram.
    fn classify(&self, data: &[u8], addr: SocketAddr) {
        let Some(&property) = data.first() else {
            trace!(target: "session", "{}: dropping empty datagram", addr);
            return;
        };
        let body = &data[wire::HEADER_SIZE..];

        match PacketKind::from(property) {
            PacketKind::DiscoveryRequest => {
                if self.config.discovery_enabled {
                    self.emit_out_of_band(EventKind::DiscoveryRequest, addr, body);
                } else {
                    trace!(target: "session", "{}: discovery disabled, dropping request", addr);
                }
            }
            PacketKind::DiscoveryResponse => {
                self.emit_out_of_band(EventKind::DiscoveryResponse, addr, body);
            }
            PacketKind::UnconnectedMessage => {
                if self.config.unconnected_messages_enabled {
                    self.emit_out_of_band(EventKind::ReceiveUnconnected, addr, body);
                } else {
                    trace!(target: "session", "{}: unconnected messages disabled, dropping", addr);
                }
            }
            PacketKind::NatIntroductionRequest
            | PacketKind::NatIntroduction
            | PacketKind::NatPunchMessage => {
                self.route_nat(PacketKind::from(property), addr, body);
            }
            PacketKind::Disconnect => self.handle_disconnect_packet(addr, body),
            PacketKind::AlreadyDisconnected => {
                if self.shutdown_peers.remove(&addr).is_some() {
                    debug!(target: "session", "{}: shutdown acknowledged", addr);
                } else {
                    trace!(target: "session", "{}: unsolicited shutdown acknowledgement", addr);
                }
            }
            PacketKind::ConnectAccept => {
                if let Some(peer) = self.peers.get(&addr) {
                    if peer.process_connect_accept(data) {
                        debug!(target: "session", "{}: connected (id {})", addr, peer.connection_id());
                        self.emit_connect(peer);
                    }
                } else {
                    trace!(target: "session", "{}: connect accept from unknown peer", addr);
                }
            }
            PacketKind::ConnectRequest => self.handle_connect_request(addr, data, body),
            PacketKind::Transport(_) => {
                if let Some(peer) = self.peers.get(&addr) {
                    peer.process_packet(data);
                } else {
                    trace!(target: "session", "{}: transport packet from unknown peer", addr);
                }
            }
        }
    }

    fn route_nat(&self, kind: PacketKind, addr: SocketAddr, body: &[u8]) {
        if !self.config.nat_punch_enabled {
            trace!(target: "session", "{}: nat punch disabled, dropping", addr);
            return;
        }
        let Some(nat) = &self.nat else {
            trace!(target: "session", "{}: no nat handler installed, dropping", addr);
            return;
        };
        let kind = match kind {
            PacketKind::NatIntroductionRequest => NatPacketKind::IntroductionRequest,
            PacketKind::NatIntroduction => NatPacketKind::Introduction,
            _ => NatPacketKind::PunchMessage,
        };
        nat.handle(addr, kind, body);
    }

    fn handle_disconnect_packet(&self, addr: SocketAddr, body: &[u8]) {
        let Some((connection_id, payload)) = wire::parse_disconnect(body) else {
            trace!(target: "session", "{}: malformed disconnect, dropping", addr);
            return;
        };

        match self
            .peers
            .remove_if(&addr, |peer| peer.connection_id() == connection_id)
        {
            RemoveIf::Removed(peer) => {
                debug!(target: "session", "{}: closed by remote", addr);
                self.emit_disconnect(peer, DisconnectReason::RemoteConnectionClose, 0, payload);
            }
            RemoveIf::Mismatch => {
                trace!(target: "session", "{}: stale disconnect (id {}), dropping", addr, connection_id);
            }
            RemoveIf::Missing => {
                // No such session on our side; tell the remote so it can
                // stop retransmitting.
                self.send_raw(&wire::already_disconnected(), addr).ok();
            }
        }
    }

    fn handle_connect_request(&self, addr: SocketAddr, data: &[u8], body: &[u8]) {
        let Some((protocol_id, connection_id, payload)) = wire::parse_connect_request(body) else {
            trace!(target: "session", "{}: undersized connect request, dropping", addr);
            return;
        };
        if protocol_id != wire::PROTOCOL_ID {
            trace!(
                target: "session",
                "{}: protocol mismatch ({} != {}), dropping connect request",
                addr, protocol_id, wire::PROTOCOL_ID,
            );
            return;
        }
        if let Some(peer) = self.peers.get(&addr) {
            // Retransmitted handshake; the engine may re-acknowledge a
            // lost connect accept. Never create a second peer.
            peer.process_packet(data);
            return;
        }
        if self.peers.is_full() {
            trace!(target: "session", "{}: peer table full, ignoring connect request", addr);
            return;
        }
        {
            let mut pending = self.pending_requests.lock().unwrap();
            if pending.contains_key(&addr) {
                trace!(target: "session", "{}: connect request already pending", addr);
                return;
            }
            pending.insert(addr, connection_id);
        }
        debug!(target: "session", "{}: connection requested (id {})", addr, connection_id);

        let mut event = self.pool.acquire(EventKind::ConnectionRequest);
        event.addr = Some(addr);
        event.request = Some(ConnectionRequest {
            addr,
            connection_id,
            payload: payload.to_vec(),
            resolved: AtomicBool::new(false),
            manager: self.weak.clone(),
        });
        self.emit(event);
    }

    /// Host accepted an inbound connect. Re-checks table state: the
    /// address may have connected, or the table filled, since the
    /// request event was emitted.
    fn accept_request(&self, addr: SocketAddr, connection_id: i64) -> Option<Arc<Peer>> {
        self.pending_requests.lock().unwrap().remove(&addr);

        if !self.running.load(Ordering::Acquire) {
            return None;
        }
        if let Some(existing) = self.peers.get(&addr) {
            return Some(existing);
        }
        // An accepted remote still draining an old shutdown abandons
        // that entry, as an outbound reconnect does.
        self.shutdown_peers.remove(&addr);

        let engine = self
            .factory
            .inbound(addr, connection_id, &self.engine_config, self.host());
        let peer = Arc::new(Peer::new(addr, connection_id, Link::Inbound, engine));

        if self.peers.insert(peer.clone()) {
            debug!(target: "session", "{}: accepted (id {})", addr, connection_id);
            self.emit_connect(peer.clone());
            Some(peer)
        } else {
            self.peers.get(&addr)
        }
    }

    /// Shared disconnect path. Graceful disconnects transfer the peer to
    /// the shutdown table and let the engine retransmit the packet;
    /// forced ones send it once, fire-and-forget.
    fn disconnect(
        &self,
        peer: &Arc<Peer>,
        reason: DisconnectReason,
        error_code: i32,
        payload: &[u8],
        graceful: bool,
    ) {
        let mut payload = payload;
        if !payload.is_empty() && payload.len() + 8 >= peer.mtu() {
            warn!(
                target: "session",
                "{}: disconnect payload of {} byte(s) does not fit the mtu, dropping it",
                peer.addr(), payload.len(),
            );
            payload = &[];
        }
        let packet = wire::disconnect(peer.connection_id(), payload);

        if graceful {
            if !self.peers.transfer_to_shutdown(peer, &self.shutdown_peers) {
                return;
            }
            peer.shutdown(&packet);
        } else {
            match self.peers.remove_if(&peer.addr(), |p| Arc::ptr_eq(p, peer)) {
                RemoveIf::Removed(_) => {
                    // No farewell packet to a peer we already failed to send to.
                    if reason != DisconnectReason::SocketSendError {
                        self.send_raw(&packet, peer.addr()).ok();
                    }
                }
                _ => return,
            }
        }
        debug!(target: "session", "{}: disconnected ({})", peer.addr(), reason);
        self.emit_disconnect(peer.clone(), reason, error_code, &[]);
    }

    /// Put a datagram on the wire, applying the send-error policy:
    /// transient errors are swallowed, oversize fails the send without
    /// further consequence, anything else schedules a forced disconnect
    /// of the addressed peer.
    fn send_raw(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let socket = self.socket.lock().unwrap().clone();
        let Some(socket) = socket else {
            return Ok(0);
        };

        match socket.send_to(data, addr) {
            Ok(sent) => Ok(sent),
            Err(err) if net::is_transient_send_error(&err) => {
                trace!(target: "session", "{}: transient send error: {}", addr, err);
                Ok(0)
            }
            Err(err) if net::is_oversize_send_error(&err) => {
                warn!(target: "session", "{}: datagram of {} byte(s) too long", addr, data.len());
                Err(err)
            }
            Err(err) => {
                let code = err.raw_os_error().unwrap_or(-1);
                error!(target: "session", "{}: send failed: {}", addr, err);
                self.pending_send_errors.lock().unwrap().push((addr, code));
                Err(err)
            }
        }
    }

    /// Socket-level receive failure.
    fn handle_receive_error(&self, err: &io::Error) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let code = err.raw_os_error().unwrap_or(-1);
        self.emit_error(None, code);

        if self.config.clear_peers_on_receive_error {
            warn!(target: "session", "receive error ({}), clearing peer table", err);
            self.peers.take_all();
        }
    }

    /// One pass of the logic thread: reap dead peers, advance the
    /// engines of the live and the shutting-down ones.
    fn logic_tick(&self, delta: LocalDuration) {
        #[cfg(debug_assertions)]
        {
            if self.simulator_config.is_some() {
                for (data, addr) in self.simulator.release(LocalTime::now()) {
                    self.classify(&data, addr);
                }
            }
        }
        self.drain_send_errors();

        let mut alive = Vec::new();
        self.peers.snapshot(&mut alive);

        for peer in alive {
            let doomed = match peer.state() {
                ConnectionState::Connected
                    if peer.time_since_last_packet() > self.config.disconnect_timeout =>
                {
                    Some(DisconnectReason::Timeout)
                }
                ConnectionState::Disconnected => Some(DisconnectReason::ConnectionFailed),
                _ => None,
            };

            match doomed {
                Some(reason) => {
                    let removed = self
                        .peers
                        .remove_if(&peer.addr(), |p| Arc::ptr_eq(p, &peer));
                    if let RemoveIf::Removed(peer) = removed {
                        debug!(target: "session", "{}: reaped ({})", peer.addr(), reason);
                        self.emit_disconnect(peer, reason, 0, &[]);
                    }
                }
                None => peer.update(delta),
            }
        }

        let mut draining = Vec::new();
        self.shutdown_peers.snapshot(&mut draining);
        for peer in draining {
            peer.update(delta);
        }
    }

    fn drain_send_errors(&self) {
        let errors: Vec<(SocketAddr, i32)> =
            std::mem::take(&mut *self.pending_send_errors.lock().unwrap());

        for (addr, code) in errors {
            self.emit_error(Some(addr), code);
            if let Some(peer) = self.peers.get(&addr) {
                self.disconnect(&peer, DisconnectReason::SocketSendError, code, &[], false);
            }
        }
    }

    /// Queue an event, or dispatch it inline in unsynced mode. No lock
    /// is held while the listener runs.
    fn emit(&self, event: Box<Event>) {
        if self.config.unsynced_events {
            let mut event = event;
            event.dispatch(self.listener.as_ref());
            self.pool.recycle(event);
        } else {
            self.queue.push(event);
        }
    }

    fn emit_connect(&self, peer: Arc<Peer>) {
        let mut event = self.pool.acquire(EventKind::Connect);
        event.peer = Some(peer);
        self.emit(event);
    }

    fn emit_disconnect(
        &self,
        peer: Arc<Peer>,
        reason: DisconnectReason,
        error_code: i32,
        payload: &[u8],
    ) {
        let mut event = self.pool.acquire(EventKind::Disconnect);
        event.peer = Some(peer);
        event.reason = reason;
        event.aux = error_code;
        event.payload.extend_from_slice(payload);
        self.emit(event);
    }

    fn emit_receive(&self, peer: Arc<Peer>, payload: &[u8]) {
        let mut event = self.pool.acquire(EventKind::Receive);
        event.peer = Some(peer);
        event.payload.extend_from_slice(payload);
        self.emit(event);
    }

    fn emit_out_of_band(&self, kind: EventKind, addr: SocketAddr, payload: &[u8]) {
        let mut event = self.pool.acquire(kind);
        event.addr = Some(addr);
        event.payload.extend_from_slice(payload);
        self.emit(event);
    }

    fn emit_error(&self, addr: Option<SocketAddr>, code: i32) {
        let mut event = self.pool.acquire(EventKind::Error);
        event.addr = addr;
        event.aux = code;
        self.emit(event);
    }

    fn emit_latency(&self, peer: Arc<Peer>, latency_ms: u32) {
        let mut event = self.pool.acquire(EventKind::LatencyUpdate);
        event.peer = Some(peer);
        event.aux = latency_ms as i32;
        self.emit(event);
    }
}

/// Non-owning back-handle engines use to reach the manager. Calls on a
/// stopped-and-dropped manager are no-ops.
struct HostHandle {
    inner: Weak<Inner>,
}

impl EngineHost for HostHandle {
    fn send_raw(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match self.inner.upgrade() {
            Some(inner) => inner.send_raw(data, addr),
            None => Ok(0),
        }
    }

    fn deliver(&self, addr: SocketAddr, payload: &[u8]) {
        if let Some(inner) = self.inner.upgrade() {
            if let Some(peer) = inner.peers.get(&addr) {
                inner.emit_receive(peer, payload);
            }
        }
    }

    fn latency_update(&self, addr: SocketAddr, latency_ms: u32) {
        if let Some(inner) = self.inner.upgrade() {
            if let Some(peer) = inner.peers.get(&addr) {
                inner.emit_latency(peer, latency_ms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    use super::*;
    use crate::engine::PeerEngine;
    use crate::session::event::UnconnectedKind;

    #[derive(Debug, PartialEq, Eq)]
    enum Recorded {
        Connect(SocketAddr),
        Disconnect(SocketAddr, DisconnectReason, Vec<u8>),
        Receive(SocketAddr, Vec<u8>),
        Unconnected(SocketAddr, UnconnectedKind, Vec<u8>),
        Error(Option<SocketAddr>, i32),
        Latency(SocketAddr, u32),
        Request(SocketAddr, i64),
    }

    #[derive(Default)]
    struct TestListener {
        events: Mutex<Vec<Recorded>>,
        requests: Mutex<Vec<ConnectionRequest>>,
    }

    impl TestListener {
        fn take_events(&self) -> Vec<Recorded> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn take_request(&self) -> Option<ConnectionRequest> {
            self.requests.lock().unwrap().pop()
        }
    }

    impl EventListener for TestListener {
        fn on_peer_connected(&self, peer: &Arc<Peer>) {
            self.events
                .lock()
                .unwrap()
                .push(Recorded::Connect(peer.addr()));
        }

        fn on_peer_disconnected(&self, peer: &Arc<Peer>, mut info: crate::session::event::DisconnectInfo<'_>) {
            self.events.lock().unwrap().push(Recorded::Disconnect(
                peer.addr(),
                info.reason,
                info.data.rest().to_vec(),
            ));
        }

        fn on_receive(&self, peer: &Arc<Peer>, data: &mut Reader<'_>) {
            self.events
                .lock()
                .unwrap()
                .push(Recorded::Receive(peer.addr(), data.rest().to_vec()));
        }

        fn on_receive_unconnected(
            &self,
            addr: SocketAddr,
            data: &mut Reader<'_>,
            kind: UnconnectedKind,
        ) {
            self.events
                .lock()
                .unwrap()
                .push(Recorded::Unconnected(addr, kind, data.rest().to_vec()));
        }

        fn on_error(&self, addr: Option<SocketAddr>, error_code: i32) {
            self.events
                .lock()
                .unwrap()
                .push(Recorded::Error(addr, error_code));
        }

        fn on_latency_update(&self, peer: &Arc<Peer>, latency_ms: u32) {
            self.events
                .lock()
                .unwrap()
                .push(Recorded::Latency(peer.addr(), latency_ms));
        }

        fn on_connection_request(&self, request: ConnectionRequest) {
            self.events
                .lock()
                .unwrap()
                .push(Recorded::Request(request.addr(), request.connection_id()));
            self.requests.lock().unwrap().push(request);
        }
    }

    #[derive(Default)]
    struct StubRecord {
        processed: Mutex<Vec<Vec<u8>>>,
        sent: Mutex<Vec<(Vec<u8>, DeliveryMethod)>>,
        shutdown_packets: Mutex<Vec<Vec<u8>>>,
    }

    struct StubEngine {
        state: ConnectionState,
        mtu: usize,
        silence: LocalDuration,
        record: Arc<StubRecord>,
    }

    impl PeerEngine for StubEngine {
        fn update(&mut self, _delta: LocalDuration) {}

        fn process_packet(&mut self, data: &[u8]) {
            self.record.processed.lock().unwrap().push(data.to_vec());
        }

        fn process_connect_accept(&mut self, _data: &[u8]) -> bool {
            self.state = ConnectionState::Connected;
            true
        }

        fn send(&mut self, data: &[u8], method: DeliveryMethod) {
            self.record.sent.lock().unwrap().push((data.to_vec(), method));
        }

        fn shutdown(&mut self, packet: &[u8]) {
            self.state = ConnectionState::ShutdownRequested;
            self.record
                .shutdown_packets
                .lock()
                .unwrap()
                .push(packet.to_vec());
        }

        fn flush(&mut self) {}

        fn connection_state(&self) -> ConnectionState {
            self.state
        }

        fn mtu(&self) -> usize {
            self.mtu
        }

        fn time_since_last_packet(&self) -> LocalDuration {
            self.silence
        }
    }

    struct StubFactory {
        mtu: AtomicUsize,
        silence_ms: AtomicU64,
        outbound_state: Mutex<ConnectionState>,
        records: Mutex<HashMap<SocketAddr, Arc<StubRecord>>>,
    }

    impl Default for StubFactory {
        fn default() -> Self {
            Self {
                mtu: AtomicUsize::new(1400),
                silence_ms: AtomicU64::new(0),
                outbound_state: Mutex::new(ConnectionState::Connecting),
                records: Mutex::new(HashMap::new()),
            }
        }
    }

    impl StubFactory {
        fn engine(&self, addr: SocketAddr, state: ConnectionState) -> Box<dyn PeerEngine> {
            let record = Arc::new(StubRecord::default());
            self.records.lock().unwrap().insert(addr, record.clone());

            Box::new(StubEngine {
                state,
                mtu: self.mtu.load(Ordering::Relaxed),
                silence: LocalDuration::from_millis(self.silence_ms.load(Ordering::Relaxed)),
                record,
            })
        }

        fn record(&self, addr: &SocketAddr) -> Arc<StubRecord> {
            self.records.lock().unwrap().get(addr).unwrap().clone()
        }
    }

    impl EngineFactory for StubFactory {
        fn outbound(
            &self,
            addr: SocketAddr,
            _connection_id: i64,
            _payload: &[u8],
            _config: &EngineConfig,
            _host: Arc<dyn EngineHost>,
        ) -> Box<dyn PeerEngine> {
            let state = *self.outbound_state.lock().unwrap();
            self.engine(addr, state)
        }

        fn inbound(
            &self,
            addr: SocketAddr,
            _connection_id: i64,
            _config: &EngineConfig,
            _host: Arc<dyn EngineHost>,
        ) -> Box<dyn PeerEngine> {
            self.engine(addr, ConnectionState::Connected)
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// A manager flagged as running, with no socket bound: sends become
    /// no-ops and no threads exist, so tests stay deterministic.
    fn manager(config: Config) -> (SessionManager, Arc<TestListener>, Arc<StubFactory>) {
        let listener = Arc::new(TestListener::default());
        let factory = Arc::new(StubFactory::default());
        let manager = SessionManager::new(config, listener.clone(), factory.clone());
        manager.inner.running.store(true, Ordering::Release);

        (manager, listener, factory)
    }

    /// Drive the full inbound handshake for `addr` with the given id.
    fn accept_peer(
        manager: &SessionManager,
        listener: &TestListener,
        peer_addr: SocketAddr,
        connection_id: i64,
    ) -> Arc<Peer> {
        let datagram = wire::connect_request(connection_id, b"");
        manager.inner.handle_datagram(&datagram, peer_addr);
        manager.poll_events();

        let request = listener.take_request().expect("connection request");
        let peer = request.accept().expect("accept");
        manager.poll_events();
        listener.take_events();

        peer
    }

    #[test]
    fn test_connection_request_and_accept() {
        let (manager, listener, _) = manager(Config::default());
        let remote = addr(4001);

        let datagram = wire::connect_request(42, b"hello");
        manager.inner.handle_datagram(&datagram, remote);
        manager.poll_events();

        assert_eq!(listener.take_events(), vec![Recorded::Request(remote, 42)]);

        let request = listener.take_request().unwrap();
        assert_eq!(request.data().peek_rest(), b"hello");

        let peer = request.accept().unwrap();
        assert_eq!(peer.addr(), remote);
        assert_eq!(peer.connection_id(), 42);
        assert_eq!(peer.link(), Link::Inbound);
        assert_eq!(manager.peers_count(), 1);

        manager.poll_events();
        assert_eq!(listener.take_events(), vec![Recorded::Connect(remote)]);
    }

    #[test]
    fn test_duplicate_connect_request_while_pending() {
        let (manager, listener, _) = manager(Config::default());
        let remote = addr(4002);

        let datagram = wire::connect_request(42, b"");
        manager.inner.handle_datagram(&datagram, remote);
        manager.inner.handle_datagram(&datagram, remote);
        manager.poll_events();

        assert_eq!(listener.take_events(), vec![Recorded::Request(remote, 42)]);
    }

    #[test]
    fn test_connect_request_to_existing_peer_forwards_to_engine() {
        let (manager, listener, factory) = manager(Config::default());
        let remote = addr(4003);
        accept_peer(&manager, &listener, remote, 42);

        let datagram = wire::connect_request(42, b"");
        manager.inner.handle_datagram(&datagram, remote);
        manager.poll_events();

        assert!(listener.take_events().is_empty());
        assert_eq!(manager.peers_count(), 1);
        assert_eq!(
            factory.record(&remote).processed.lock().unwrap().as_slice(),
            &[datagram]
        );
    }

    #[test]
    fn test_connect_request_ignored_when_full() {
        let (manager, listener, _) = manager(Config {
            max_peers: 1,
            ..Config::default()
        });
        accept_peer(&manager, &listener, addr(4004), 1);

        let datagram = wire::connect_request(2, b"");
        manager.inner.handle_datagram(&datagram, addr(4005));
        manager.poll_events();

        assert!(listener.take_events().is_empty());
        assert_eq!(manager.peers_count(), 1);
    }

    #[test]
    fn test_connect_request_protocol_mismatch_dropped() {
        let (manager, listener, _) = manager(Config::default());

        let mut w = wire::Writer::new();
        w.u8(u8::from(PacketKind::ConnectRequest))
            .i32(wire::PROTOCOL_ID + 1)
            .i64(42);
        manager.inner.handle_datagram(&w.into_vec(), addr(4006));
        manager.poll_events();

        assert!(listener.take_events().is_empty());
    }

    #[test]
    fn test_connect_request_undersized_dropped() {
        let (manager, listener, _) = manager(Config::default());

        // 11 bytes after the property header: one short of the minimum.
        let mut datagram = vec![u8::from(PacketKind::ConnectRequest)];
        datagram.extend_from_slice(&[0; wire::CONNECT_REQUEST_MIN_SIZE - 1]);
        manager.inner.handle_datagram(&datagram, addr(4007));
        manager.poll_events();

        assert!(listener.take_events().is_empty());
    }

    #[test]
    fn test_stale_disconnect_discarded() {
        let (manager, listener, _) = manager(Config::default());
        let remote = addr(4008);
        accept_peer(&manager, &listener, remote, 42);

        manager
            .inner
            .handle_datagram(&wire::disconnect(99, b""), remote);
        manager.poll_events();

        assert!(listener.take_events().is_empty());
        assert_eq!(manager.peers_count(), 1);
    }

    #[test]
    fn test_matching_disconnect_removes_peer() {
        let (manager, listener, _) = manager(Config::default());
        let remote = addr(4009);
        accept_peer(&manager, &listener, remote, 42);

        manager
            .inner
            .handle_datagram(&wire::disconnect(42, b"bye"), remote);
        manager.poll_events();

        assert_eq!(
            listener.take_events(),
            vec![Recorded::Disconnect(
                remote,
                DisconnectReason::RemoteConnectionClose,
                b"bye".to_vec(),
            )]
        );
        assert_eq!(manager.peers_count(), 0);
    }

    #[test]
    fn test_unconnected_and_discovery_gating() {
        let (manager, listener, _) = manager(Config {
            discovery_enabled: true,
            unconnected_messages_enabled: false,
            ..Config::default()
        });
        let remote = addr(4010);

        manager.inner.handle_datagram(
            &wire::unconnected(PacketKind::UnconnectedMessage, b"msg"),
            remote,
        );
        manager.inner.handle_datagram(
            &wire::unconnected(PacketKind::DiscoveryRequest, b"probe"),
            remote,
        );
        manager.poll_events();

        assert_eq!(
            listener.take_events(),
            vec![Recorded::Unconnected(
                remote,
                UnconnectedKind::DiscoveryRequest,
                b"probe".to_vec(),
            )]
        );
    }

    #[test]
    fn test_discovery_disabled_by_default() {
        let (manager, listener, _) = manager(Config::default());

        manager.inner.handle_datagram(
            &wire::unconnected(PacketKind::DiscoveryRequest, b"probe"),
            addr(4011),
        );
        manager.poll_events();

        assert!(listener.take_events().is_empty());
    }

    #[test]
    fn test_discovery_response_always_surfaced() {
        let (manager, listener, _) = manager(Config::default());
        let remote = addr(4012);

        manager.inner.handle_datagram(
            &wire::unconnected(PacketKind::DiscoveryResponse, b"here"),
            remote,
        );
        manager.poll_events();

        assert_eq!(
            listener.take_events(),
            vec![Recorded::Unconnected(
                remote,
                UnconnectedKind::DiscoveryResponse,
                b"here".to_vec(),
            )]
        );
    }

    #[test]
    fn test_connect_is_idempotent() {
        let (manager, listener, _) = manager(Config::default());
        let remote = addr(4013);

        let first = manager.connect(remote, b"hi").unwrap().unwrap();
        let second = manager.connect(remote, b"hi").unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.link(), Link::Outbound);
        assert_eq!(manager.peers_count(), 1);

        manager.poll_events();
        assert!(listener.take_events().is_empty());
    }

    #[test]
    fn test_connect_returns_none_when_full() {
        let (manager, _, _) = manager(Config {
            max_peers: 1,
            ..Config::default()
        });

        assert!(manager.connect(addr(4014), b"").unwrap().is_some());
        assert!(manager.connect(addr(4015), b"").unwrap().is_none());
    }

    #[test]
    fn test_connect_requires_running() {
        let listener = Arc::new(TestListener::default());
        let factory = Arc::new(StubFactory::default());
        let manager = SessionManager::new(Config::default(), listener, factory);

        assert!(matches!(
            manager.connect(addr(4016), b""),
            Err(Error::NotRunning)
        ));
    }

    #[test]
    fn test_graceful_disconnect() {
        let (manager, listener, factory) = manager(Config::default());
        let remote = addr(4017);
        let peer = accept_peer(&manager, &listener, remote, 42);

        manager.disconnect_peer(&peer, b"bye");

        assert_eq!(manager.peers_count(), 0);
        assert_eq!(manager.inner.shutdown_peers.len(), 1);
        assert_eq!(peer.state(), ConnectionState::ShutdownRequested);

        let packets = factory.record(&remote).shutdown_packets.lock().unwrap().clone();
        assert_eq!(packets.len(), 1);
        assert_eq!(
            wire::parse_disconnect(&packets[0][wire::HEADER_SIZE..]),
            Some((42, &b"bye"[..]))
        );

        manager.poll_events();
        assert_eq!(
            listener.take_events(),
            vec![Recorded::Disconnect(
                remote,
                DisconnectReason::DisconnectPeerCalled,
                Vec::new(),
            )]
        );

        // The remote acknowledges; the shutdown entry is dropped.
        manager
            .inner
            .handle_datagram(&wire::already_disconnected(), remote);
        assert_eq!(manager.inner.shutdown_peers.len(), 0);
    }

    #[test]
    fn test_disconnect_payload_dropped_when_oversize() {
        let (manager, listener, factory) = manager(Config::default());
        factory.mtu.store(16, Ordering::Relaxed);
        let remote = addr(4018);
        let peer = accept_peer(&manager, &listener, remote, 42);

        // 10 + 8 >= 16: the payload is dropped, the disconnect still goes out.
        manager.disconnect_peer(&peer, &[0xaa; 10]);

        let packets = factory.record(&remote).shutdown_packets.lock().unwrap().clone();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), wire::DISCONNECT_HEADER_SIZE);
    }

    #[test]
    fn test_force_disconnect_skips_shutdown_table() {
        let (manager, listener, _) = manager(Config::default());
        let remote = addr(4019);
        let peer = accept_peer(&manager, &listener, remote, 42);

        manager.disconnect_peer_force(&peer);

        assert_eq!(manager.peers_count(), 0);
        assert_eq!(manager.inner.shutdown_peers.len(), 0);

        manager.poll_events();
        assert_eq!(
            listener.take_events(),
            vec![Recorded::Disconnect(
                remote,
                DisconnectReason::DisconnectPeerCalled,
                Vec::new(),
            )]
        );

        // A second disconnect of the same handle is a no-op.
        manager.disconnect_peer_force(&peer);
        manager.poll_events();
        assert!(listener.take_events().is_empty());
    }

    #[test]
    fn test_tick_reaps_timed_out_peer() {
        let (manager, listener, factory) = manager(Config::default());
        factory.silence_ms.store(6000, Ordering::Relaxed);
        let remote = addr(4020);
        accept_peer(&manager, &listener, remote, 42);

        manager.inner.logic_tick(LocalDuration::from_millis(15));
        manager.poll_events();

        assert_eq!(
            listener.take_events(),
            vec![Recorded::Disconnect(
                remote,
                DisconnectReason::Timeout,
                Vec::new(),
            )]
        );
        assert_eq!(manager.peers_count(), 0);
    }

    #[test]
    fn test_tick_reaps_failed_outbound_peer() {
        let (manager, listener, factory) = manager(Config::default());
        *factory.outbound_state.lock().unwrap() = ConnectionState::Disconnected;
        let remote = addr(4021);
        manager.connect(remote, b"").unwrap().unwrap();

        manager.inner.logic_tick(LocalDuration::from_millis(15));
        manager.poll_events();

        assert_eq!(
            listener.take_events(),
            vec![Recorded::Disconnect(
                remote,
                DisconnectReason::ConnectionFailed,
                Vec::new(),
            )]
        );
        assert_eq!(manager.peers_count(), 0);
    }

    #[test]
    fn test_connect_accept_emits_connect() {
        let (manager, listener, _) = manager(Config::default());
        let remote = addr(4022);
        let peer = manager.connect(remote, b"").unwrap().unwrap();
        assert_eq!(peer.state(), ConnectionState::Connecting);

        manager
            .inner
            .handle_datagram(&[u8::from(PacketKind::ConnectAccept)], remote);
        manager.poll_events();

        assert_eq!(listener.take_events(), vec![Recorded::Connect(remote)]);
        assert_eq!(peer.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_unsynced_events_dispatch_inline() {
        let (manager, listener, _) = manager(Config {
            unsynced_events: true,
            ..Config::default()
        });
        let remote = addr(4023);

        manager
            .inner
            .handle_datagram(&wire::connect_request(42, b""), remote);

        // No poll: the event was dispatched on the emitting thread.
        assert_eq!(listener.take_events(), vec![Recorded::Request(remote, 42)]);
    }

    #[test]
    fn test_send_to_all_with_exclusion() {
        let (manager, listener, factory) = manager(Config::default());
        let first = accept_peer(&manager, &listener, addr(4024), 1);
        accept_peer(&manager, &listener, addr(4025), 2);

        manager
            .send_to_all(b"tick", DeliveryMethod::Sequenced, Some(&first))
            .unwrap();

        assert!(factory.record(&addr(4024)).sent.lock().unwrap().is_empty());
        assert_eq!(
            factory.record(&addr(4025)).sent.lock().unwrap().as_slice(),
            &[(b"tick".to_vec(), DeliveryMethod::Sequenced)]
        );
    }

    #[test]
    fn test_engine_host_delivers_receive_and_latency() {
        let (manager, listener, _) = manager(Config::default());
        let remote = addr(4026);
        accept_peer(&manager, &listener, remote, 42);

        let host = manager.inner.host();
        host.deliver(remote, b"data");
        host.latency_update(remote, 23);
        // Unknown addresses are dropped.
        host.deliver(addr(4027), b"ignored");
        manager.poll_events();

        assert_eq!(
            listener.take_events(),
            vec![
                Recorded::Receive(remote, b"data".to_vec()),
                Recorded::Latency(remote, 23),
            ]
        );
    }

    #[test]
    fn test_request_resolves_only_once() {
        let (manager, listener, _) = manager(Config::default());
        let remote = addr(4028);

        manager
            .inner
            .handle_datagram(&wire::connect_request(42, b""), remote);
        manager.poll_events();
        let request = listener.take_request().unwrap();

        assert!(request.accept().is_some());
        assert!(request.accept().is_none());
        assert_eq!(manager.peers_count(), 1);
    }

    #[test]
    fn test_reject_allows_a_new_request() {
        let (manager, listener, _) = manager(Config::default());
        let remote = addr(4029);
        let datagram = wire::connect_request(42, b"");

        manager.inner.handle_datagram(&datagram, remote);
        manager.poll_events();
        listener.take_request().unwrap().reject();
        listener.take_events();
        assert_eq!(manager.peers_count(), 0);

        manager.inner.handle_datagram(&datagram, remote);
        manager.poll_events();
        assert_eq!(listener.take_events(), vec![Recorded::Request(remote, 42)]);
    }

    #[test]
    fn test_accept_loses_race_when_table_fills() {
        let (manager, listener, _) = manager(Config {
            max_peers: 1,
            ..Config::default()
        });

        manager
            .inner
            .handle_datagram(&wire::connect_request(1, b""), addr(4030));
        manager
            .inner
            .handle_datagram(&wire::connect_request(2, b""), addr(4031));
        manager.poll_events();

        let second = listener.take_request().unwrap();
        let first = listener.take_request().unwrap();

        assert!(first.accept().is_some());
        assert!(second.accept().is_none());
        assert_eq!(manager.peers_count(), 1);

        manager.poll_events();
        assert_eq!(
            listener.take_events(),
            vec![
                Recorded::Request(addr(4030), 1),
                Recorded::Request(addr(4031), 2),
                Recorded::Connect(addr(4030)),
            ]
        );
    }

    #[test]
    fn test_receive_error_clears_peer_table() {
        let (manager, listener, _) = manager(Config::default());
        accept_peer(&manager, &listener, addr(4032), 1);
        accept_peer(&manager, &listener, addr(4033), 2);

        let err = io::Error::from_raw_os_error(111);
        manager.inner.handle_receive_error(&err);
        manager.poll_events();

        assert_eq!(listener.take_events(), vec![Recorded::Error(None, 111)]);
        assert_eq!(manager.peers_count(), 0);
    }

    #[test]
    fn test_receive_error_policy_can_be_disabled() {
        let (manager, listener, _) = manager(Config {
            clear_peers_on_receive_error: false,
            ..Config::default()
        });
        accept_peer(&manager, &listener, addr(4034), 1);

        manager
            .inner
            .handle_receive_error(&io::Error::from_raw_os_error(111));
        manager.poll_events();

        assert_eq!(listener.take_events(), vec![Recorded::Error(None, 111)]);
        assert_eq!(manager.peers_count(), 1);
    }

    #[test]
    fn test_pending_send_error_force_disconnects() {
        let (manager, listener, _) = manager(Config::default());
        let remote = addr(4035);
        accept_peer(&manager, &listener, remote, 42);

        manager
            .inner
            .pending_send_errors
            .lock()
            .unwrap()
            .push((remote, 10013));
        manager.inner.logic_tick(LocalDuration::from_millis(15));
        manager.poll_events();

        assert_eq!(
            listener.take_events(),
            vec![
                Recorded::Error(Some(remote), 10013),
                Recorded::Disconnect(remote, DisconnectReason::SocketSendError, Vec::new()),
            ]
        );
        assert_eq!(manager.peers_count(), 0);
    }

    #[test]
    fn test_reconnect_abandons_shutdown_entry() {
        let (manager, listener, _) = manager(Config::default());
        let remote = addr(4036);
        let peer = accept_peer(&manager, &listener, remote, 42);

        manager.disconnect_peer(&peer, b"");
        assert_eq!(manager.inner.shutdown_peers.len(), 1);

        let fresh = manager.connect(remote, b"").unwrap().unwrap();
        assert!(!Arc::ptr_eq(&peer, &fresh));
        assert_eq!(manager.inner.shutdown_peers.len(), 0);
        assert_eq!(manager.peers_count(), 1);
    }

    #[test]
    fn test_inbound_accept_abandons_shutdown_entry() {
        let (manager, listener, _) = manager(Config::default());
        let remote = addr(4039);
        let peer = accept_peer(&manager, &listener, remote, 42);

        manager.disconnect_peer(&peer, b"");
        assert_eq!(manager.inner.shutdown_peers.len(), 1);
        assert_eq!(manager.peers_count(), 0);
        manager.poll_events();
        listener.take_events();

        // The remote reconnects before its shutdown acknowledgement
        // arrived; accepting it must not leave two records behind.
        manager
            .inner
            .handle_datagram(&wire::connect_request(43, b""), remote);
        manager.poll_events();
        assert_eq!(listener.take_events(), vec![Recorded::Request(remote, 43)]);

        let fresh = listener.take_request().unwrap().accept().expect("accept");
        assert!(!Arc::ptr_eq(&peer, &fresh));
        assert_eq!(fresh.connection_id(), 43);
        assert_eq!(manager.inner.shutdown_peers.len(), 0);
        assert_eq!(manager.peers_count(), 1);

        // A late acknowledgement of the abandoned shutdown is a no-op.
        manager
            .inner
            .handle_datagram(&wire::already_disconnected(), remote);
        assert_eq!(manager.inner.shutdown_peers.len(), 0);
        assert_eq!(manager.peers_count(), 1);
    }

    #[test]
    fn test_transport_packet_routed_to_engine() {
        let (manager, listener, factory) = manager(Config::default());
        let remote = addr(4037);
        accept_peer(&manager, &listener, remote, 42);

        let datagram = [0u8, b'p', b'i', b'n', b'g'];
        manager.inner.handle_datagram(&datagram, remote);

        assert_eq!(
            factory.record(&remote).processed.lock().unwrap().as_slice(),
            &[datagram.to_vec()]
        );
        // Unknown senders are dropped without reaching any engine.
        manager.inner.handle_datagram(&datagram, addr(4038));
        manager.poll_events();
        assert!(listener.take_events().is_empty());
    }
}
