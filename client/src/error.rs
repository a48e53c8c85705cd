//! The error type surfaced by every fallible [`crate::Client`] method.

use thiserror::Error;

/// Everything that can go wrong using a [`crate::Client`].
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration failed validation (bad hub URL, empty nick, ...).
    #[error(transparent)]
    Config(#[from] tigerhub_common::error::Error),

    /// The protocol engine rejected an operation (unknown peer, bad state, ...).
    #[error(transparent)]
    Engine(#[from] tigerhub_fsm::Error),

    /// Binding a listener for incoming peer connections failed.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        /// The address that failed to bind.
        addr: std::net::SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// `Client::run` was called on a client that is already running.
    #[error("client is already running")]
    AlreadyRunning,

    /// `Client::terminate` was called on a client that isn't running.
    #[error("client is not running")]
    NotRunning,
}
