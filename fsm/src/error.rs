//! Protocol-level errors: malformed wire messages, rejected logins, and
//! transfer failures. Composed upward into `tigerhub-client::Error`, which
//! adds the config/connect/terminate kinds from §7.

use tigerhub_common::peer::PeerId;
use tigerhub_proto::ProtoError;

/// An error raised by the protocol engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A connection sent something the state machine didn't expect in its
    /// current state, or the codec rejected a frame outright.
    #[error("protocol violation on connection {conn}: {reason}")]
    ProtocolViolation {
        /// The connection that violated the protocol.
        conn: tigerhub_net::ConnId,
        /// What went wrong.
        reason: String,
    },
    /// The hub rejected our password.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    /// A peer connection couldn't be established: both sides passive, or
    /// the peer never responded to `ConnectToMe`/`RevConnectToMe`.
    #[error("peer {0} unavailable")]
    PeerUnavailable(PeerId),
    /// A transfer failed: I/O error, disk error, or TTH mismatch.
    #[error("transfer failed: {0}")]
    TransferFailed(String),
}

impl Error {
    /// Wrap a codec failure as a protocol violation on `conn`.
    pub fn from_proto(conn: tigerhub_net::ConnId, err: ProtoError) -> Self {
        match err {
            ProtoError::Malformed(reason) => Error::ProtocolViolation { conn, reason },
        }
    }
}

/// Why a connection owned by the protocol engine was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The hub closed the session, or we closed it after a protocol violation.
    Hub(String),
    /// A peer connection ended; the peer roster entry may still be healthy.
    Peer(String),
    /// A transfer ended (successfully or not); the connection is done either way.
    Transfer(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Hub(reason) => write!(f, "hub: {reason}"),
            DisconnectReason::Peer(reason) => write!(f, "peer: {reason}"),
            DisconnectReason::Transfer(reason) => write!(f, "transfer: {reason}"),
        }
    }
}
