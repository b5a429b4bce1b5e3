//! Reliable-UDP session management.
//!
//! This crate is the session core of a reliable UDP stack: one datagram
//! socket shared by many remote peers, with connection establishment,
//! liveness tracking, packet demultiplexing, reliable disconnection and
//! event delivery to a host thread. Per-peer reliability (acks,
//! retransmission windows, channels, MTU discovery) lives behind the
//! [`PeerEngine`] trait and is provided by the embedding stack.
//!
//! A [`SessionManager`] runs two internal threads: a poll-driven
//! receive loop and a fixed-cadence logic tick. The host drives event
//! delivery with [`SessionManager::poll_events`], or opts into inline
//! dispatch from the internal threads with [`Config::unsynced_events`].
//! In that mode, payload readers borrow buffers that are recycled as
//! soon as the callback returns, so the host must copy anything it
//! wants to keep.
pub mod common;
pub mod engine;
pub mod error;
pub mod nat;
pub mod net;
pub mod session;
pub mod wire;

pub use crate::common::time::{LocalDuration, LocalTime};
pub use crate::engine::{
    ConnectionState, DeliveryMethod, EngineConfig, EngineFactory, EngineHost, PeerEngine,
};
pub use crate::error::Error;
pub use crate::nat::{NatHandler, NatPacketKind};
pub use crate::net::Link;
pub use crate::session::event::{
    DisconnectInfo, DisconnectReason, EventListener, UnconnectedKind,
};
pub use crate::session::manager::{Config, ConnectionRequest, SessionManager};
pub use crate::session::peer::Peer;

#[cfg(any(test, feature = "mocks"))]
pub use crate::engine::MockEngine;
