//! Datagram socket plumbing: bind options, the poll-based receive loop,
//! and send-error classification.
use std::io;
use std::net::{self, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, trace};

use crate::common::time::LocalDuration;

/// Maximum time to block waiting for the socket to become readable.
/// Bounds how long `stop` can lag behind a quiet socket.
const WAIT_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);

/// Receive buffer size. Large enough for any UDP datagram.
const RECV_BUFFER_SIZE: usize = 1 << 16;

/// Link direction of a peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    /// The remote initiated the handshake.
    Inbound,
    /// We initiated the handshake.
    Outbound,
}

impl Link {
    /// Check whether the link is outbound.
    pub fn is_outbound(&self) -> bool {
        *self == Link::Outbound
    }

    /// Check whether the link is inbound.
    pub fn is_inbound(&self) -> bool {
        *self == Link::Inbound
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) enum Source {
    Socket,
    Waker,
}

/// Wakes the receive loop out of its poll, e.g. when stopping.
#[derive(Clone)]
pub(crate) struct Waker(Arc<popol::Waker>);

impl Waker {
    fn new(sources: &mut popol::Sources<Source>) -> io::Result<Self> {
        let waker = Arc::new(popol::Waker::new(sources, Source::Waker)?);

        Ok(Self(waker))
    }

    pub fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

/// Bind a non-blocking UDP socket suitable for the session manager:
/// broadcast-capable (discovery) and optionally address-reusing.
pub(crate) fn bind(port: u16, reuse_address: bool) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    sock.set_reuse_address(reuse_address)?;
    sock.set_broadcast(true)?;
    sock.set_nonblocking(true)?;

    let addr = SocketAddr::from((net::Ipv4Addr::UNSPECIFIED, port));
    sock.bind(&addr.into())?;

    Ok(sock.into())
}

/// Poll-driven receive loop over a single datagram socket.
pub(crate) struct Receiver {
    socket: Arc<UdpSocket>,
    sources: popol::Sources<Source>,
    waker: Waker,
}

impl Receiver {
    pub fn new(socket: Arc<UdpSocket>) -> io::Result<Self> {
        let mut sources = popol::Sources::new();
        sources.register(Source::Socket, &*socket, popol::interest::READ);
        let waker = Waker::new(&mut sources)?;

        Ok(Self {
            socket,
            sources,
            waker,
        })
    }

    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Drive the receive loop until `running` turns false.
    ///
    /// `on_datagram` is invoked for every datagram with a reusable
    /// buffer slice; `on_error` for socket-level receive failures.
    pub fn run<D, E>(mut self, running: Arc<AtomicBool>, mut on_datagram: D, mut on_error: E)
    where
        D: FnMut(&[u8], SocketAddr),
        E: FnMut(io::Error),
    {
        let mut events = Vec::with_capacity(4);
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

        while running.load(Ordering::Acquire) {
            match self.sources.wait_timeout(&mut events, WAIT_TIMEOUT.into()) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::TimedOut => continue,
                Err(err) => {
                    error!(target: "session", "receive poll failed: {}", err);
                    on_error(err);
                    continue;
                }
            }

            for event in events.drain(..) {
                match &event.key {
                    Source::Socket => {
                        if event.is_invalid() {
                            // File descriptor closed under us; stop cleanly.
                            error!(target: "session", "socket is invalid, stopping receive loop");
                            return;
                        }
                        drain_socket(&self.socket, &mut buffer, &mut on_datagram, &mut on_error);
                    }
                    Source::Waker => {
                        trace!(target: "session", "receive loop woken up");
                        popol::Waker::reset(event.source).ok();
                    }
                }
            }
        }
    }
}

/// Read datagrams until the socket would block.
///
/// `poll` is level-triggered, so anything left unread re-arms the
/// readiness event on the next wait.
fn drain_socket<D, E>(socket: &UdpSocket, buffer: &mut [u8], on_datagram: &mut D, on_error: &mut E)
where
    D: FnMut(&[u8], SocketAddr),
    E: FnMut(io::Error),
{
    loop {
        match socket.recv_from(buffer) {
            Ok((count, addr)) => on_datagram(&buffer[..count], addr),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                trace!(target: "session", "receive error: {}", err);
                on_error(err);
                break;
            }
        }
    }
}

/// Send errors that are ignored outright: the datagram is dropped and
/// nothing is surfaced.
pub(crate) fn is_transient_send_error(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error().map_or(false, is_no_route_code)
}

/// The datagram exceeded the interface MTU: the send fails but the peer
/// is not disconnected.
pub(crate) fn is_oversize_send_error(err: &io::Error) -> bool {
    err.raw_os_error().map_or(false, is_oversize_code)
}

#[cfg(unix)]
fn is_no_route_code(code: i32) -> bool {
    code == libc::EHOSTUNREACH || code == libc::ENETUNREACH
}

#[cfg(windows)]
fn is_no_route_code(code: i32) -> bool {
    // WSAEHOSTUNREACH / WSAENETUNREACH
    code == 10065 || code == 10051
}

#[cfg(unix)]
fn is_oversize_code(code: i32) -> bool {
    code == libc::EMSGSIZE
}

#[cfg(windows)]
fn is_oversize_code(code: i32) -> bool {
    // WSAEMSGSIZE
    code == 10040
}
