//! Datagram wire format.
//!
//! Every datagram starts with a one-byte `property` discriminator. The
//! session layer owns the handshake, disconnect and out-of-band
//! properties defined here; everything else is engine traffic and is
//! routed to the owning peer's engine opaquely.
//!
//! All multi-byte integers are little-endian.
mod reader;

pub use reader::{Reader, UnexpectedEnd, Writer};

/// Protocol identifier carried by every connect request. Peers built
/// against a different protocol revision are silently rejected.
pub const PROTOCOL_ID: i32 = 11;

/// Size of the property header preceding every payload.
pub const HEADER_SIZE: usize = 1;

/// Minimum connect-request body: protocol id (4) + connection id (8),
/// counted after the property byte.
pub const CONNECT_REQUEST_MIN_SIZE: usize = 12;

/// Disconnect overhead: property byte + connection id.
pub const DISCONNECT_HEADER_SIZE: usize = 9;

const CONNECT_REQUEST: u8 = 5;
const CONNECT_ACCEPT: u8 = 6;
const DISCONNECT: u8 = 7;
const ALREADY_DISCONNECTED: u8 = 8;
const UNCONNECTED_MESSAGE: u8 = 9;
const NAT_INTRODUCTION_REQUEST: u8 = 10;
const NAT_INTRODUCTION: u8 = 11;
const NAT_PUNCH_MESSAGE: u8 = 12;
const DISCOVERY_REQUEST: u8 = 13;
const DISCOVERY_RESPONSE: u8 = 14;

/// Packet kind, decoded from the property byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Handshake initiation: `[prop][protocol id][connection id][payload…]`.
    ConnectRequest,
    /// Handshake completion, consumed by the peer engine.
    ConnectAccept,
    /// Reliable disconnect: `[prop][connection id][payload…]`.
    Disconnect,
    /// Single-byte acknowledgement that the sender holds no session.
    AlreadyDisconnected,
    /// Application datagram outside any session.
    UnconnectedMessage,
    /// NAT traversal, opaque to the session layer.
    NatIntroductionRequest,
    /// NAT traversal, opaque to the session layer.
    NatIntroduction,
    /// NAT traversal, opaque to the session layer.
    NatPunchMessage,
    /// LAN discovery probe.
    DiscoveryRequest,
    /// LAN discovery reply.
    DiscoveryResponse,
    /// Any other property: engine-owned traffic (data channels, acks,
    /// pings, MTU probes). Forwarded to the peer engine verbatim.
    Transport(u8),
}

impl From<u8> for PacketKind {
    fn from(byte: u8) -> Self {
        match byte {
            CONNECT_REQUEST => Self::ConnectRequest,
            CONNECT_ACCEPT => Self::ConnectAccept,
            DISCONNECT => Self::Disconnect,
            ALREADY_DISCONNECTED => Self::AlreadyDisconnected,
            UNCONNECTED_MESSAGE => Self::UnconnectedMessage,
            NAT_INTRODUCTION_REQUEST => Self::NatIntroductionRequest,
            NAT_INTRODUCTION => Self::NatIntroduction,
            NAT_PUNCH_MESSAGE => Self::NatPunchMessage,
            DISCOVERY_REQUEST => Self::DiscoveryRequest,
            DISCOVERY_RESPONSE => Self::DiscoveryResponse,
            other => Self::Transport(other),
        }
    }
}

impl From<PacketKind> for u8 {
    fn from(kind: PacketKind) -> Self {
        match kind {
            PacketKind::ConnectRequest => CONNECT_REQUEST,
            PacketKind::ConnectAccept => CONNECT_ACCEPT,
            PacketKind::Disconnect => DISCONNECT,
            PacketKind::AlreadyDisconnected => ALREADY_DISCONNECTED,
            PacketKind::UnconnectedMessage => UNCONNECTED_MESSAGE,
            PacketKind::NatIntroductionRequest => NAT_INTRODUCTION_REQUEST,
            PacketKind::NatIntroduction => NAT_INTRODUCTION,
            PacketKind::NatPunchMessage => NAT_PUNCH_MESSAGE,
            PacketKind::DiscoveryRequest => DISCOVERY_REQUEST,
            PacketKind::DiscoveryResponse => DISCOVERY_RESPONSE,
            PacketKind::Transport(byte) => byte,
        }
    }
}

/// Build a connect-request datagram.
pub fn connect_request(connection_id: i64, payload: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(HEADER_SIZE + CONNECT_REQUEST_MIN_SIZE + payload.len());
    w.u8(CONNECT_REQUEST)
        .i32(PROTOCOL_ID)
        .i64(connection_id)
        .bytes(payload);
    w.into_vec()
}

/// Parse a connect-request body (the datagram minus its property byte).
///
/// Returns the protocol id, the connection id and the trailing payload.
/// Bodies shorter than [`CONNECT_REQUEST_MIN_SIZE`] are malformed.
pub fn parse_connect_request(body: &[u8]) -> Option<(i32, i64, &[u8])> {
    if body.len() < CONNECT_REQUEST_MIN_SIZE {
        return None;
    }
    let mut r = Reader::new(body);
    let protocol_id = r.i32().ok()?;
    let connection_id = r.i64().ok()?;

    Some((protocol_id, connection_id, r.rest()))
}

/// Build a disconnect datagram carrying the session's connection id and
/// an optional payload.
pub fn disconnect(connection_id: i64, payload: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(DISCONNECT_HEADER_SIZE + payload.len());
    w.u8(DISCONNECT).i64(connection_id).bytes(payload);
    w.into_vec()
}

/// Parse a disconnect body (the datagram minus its property byte).
pub fn parse_disconnect(body: &[u8]) -> Option<(i64, &[u8])> {
    let mut r = Reader::new(body);
    let connection_id = r.i64().ok()?;

    Some((connection_id, r.rest()))
}

/// The single-byte already-disconnected reply.
pub fn already_disconnected() -> [u8; 1] {
    [ALREADY_DISCONNECTED]
}

/// Build an out-of-band datagram: `[prop][payload…]`.
///
/// Valid for [`PacketKind::UnconnectedMessage`],
/// [`PacketKind::DiscoveryRequest`] and [`PacketKind::DiscoveryResponse`].
pub fn unconnected(kind: PacketKind, payload: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(HEADER_SIZE + payload.len());
    w.u8(kind.into()).bytes(payload);
    w.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_byte_round_trip() {
        for byte in 0..=u8::MAX {
            let kind = PacketKind::from(byte);
            assert_eq!(u8::from(kind), byte);
        }
    }

    #[test]
    fn test_connect_request_round_trip() {
        let datagram = connect_request(42, b"hello");

        assert_eq!(PacketKind::from(datagram[0]), PacketKind::ConnectRequest);

        let (protocol_id, connection_id, payload) =
            parse_connect_request(&datagram[HEADER_SIZE..]).unwrap();
        assert_eq!(protocol_id, PROTOCOL_ID);
        assert_eq!(connection_id, 42);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_connect_request_too_small() {
        // 11 post-header bytes: one short of the minimum.
        let body = [0u8; CONNECT_REQUEST_MIN_SIZE - 1];
        assert!(parse_connect_request(&body).is_none());

        let body = [0u8; CONNECT_REQUEST_MIN_SIZE];
        assert!(parse_connect_request(&body).is_some());
    }

    #[test]
    fn test_disconnect_round_trip() {
        let datagram = disconnect(-3, b"bye");

        assert_eq!(datagram.len(), DISCONNECT_HEADER_SIZE + 3);
        assert_eq!(PacketKind::from(datagram[0]), PacketKind::Disconnect);

        let (connection_id, payload) = parse_disconnect(&datagram[HEADER_SIZE..]).unwrap();
        assert_eq!(connection_id, -3);
        assert_eq!(payload, b"bye");
    }

    #[test]
    fn test_disconnect_empty_payload() {
        let datagram = disconnect(7, &[]);
        let (connection_id, payload) = parse_disconnect(&datagram[HEADER_SIZE..]).unwrap();

        assert_eq!(connection_id, 7);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_disconnect_truncated() {
        let datagram = disconnect(7, &[]);
        assert!(parse_disconnect(&datagram[HEADER_SIZE..datagram.len() - 1]).is_none());
    }

    #[test]
    fn test_unconnected_header() {
        let datagram = unconnected(PacketKind::DiscoveryRequest, b"probe");

        assert_eq!(PacketKind::from(datagram[0]), PacketKind::DiscoveryRequest);
        assert_eq!(&datagram[HEADER_SIZE..], b"probe");
    }
}
