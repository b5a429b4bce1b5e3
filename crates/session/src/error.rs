//! Session manager errors.
use std::io;

use thiserror::Error;

/// An error returned by session manager operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The operation requires a running manager.
    #[error("session manager is not running")]
    NotRunning,
    /// The manager was already started.
    #[error("session manager is already running")]
    AlreadyRunning,
    /// Binding the datagram socket failed.
    #[error("failed to bind socket: {0}")]
    Bind(io::Error),
    /// An I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}
