//! Transport-agnostic vocabulary shared between the protocol engine (`fsm`)
//! and whatever drives its sockets (`net-threaded`).
//!
//! The protocol engine never touches a socket directly. It implements
//! [`StateMachine`] and only ever emits [`Io`] values describing what it
//! wants done; a [`Reactor`] is responsible for turning those into actual
//! connects/writes/disconnects and for feeding received bytes back in via
//! `message_received`.
#![warn(missing_docs)]

use std::fmt;
use std::net::SocketAddr;

pub use tigerhub_common::peer::Link;
use tigerhub_common::time::LocalTime;

/// Identifies one connection. Opaque to the protocol engine; assigned by the
/// reactor when the connection is registered (on `Connect` or on accept).
pub type ConnId = u64;

/// Why a connection closed.
#[derive(Debug, Clone)]
pub enum Disconnect<T> {
    /// The local side asked for this connection to close.
    Command,
    /// A transport-level I/O error (read/write/timeout) closed the connection.
    ConnectionError(String),
    /// The protocol engine itself decided to close the connection.
    StateMachine(T),
}

impl<T: fmt::Display> fmt::Display for Disconnect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => write!(f, "disconnected by local command"),
            Self::ConnectionError(err) => write!(f, "connection error: {err}"),
            Self::StateMachine(reason) => write!(f, "{reason}"),
        }
    }
}

/// An instruction emitted by the protocol engine for the reactor to execute.
///
/// The engine never blocks: every side effect it wants is expressed as one
/// of these and drained by the reactor after each batch of state mutation.
#[derive(Debug)]
pub enum Io<M, E, D> {
    /// Write a message on the given connection.
    Write(ConnId, M),
    /// Write a raw byte payload on the given connection (the binary part of
    /// a file transfer, sent outside the dialect codec entirely).
    WriteBytes(ConnId, Vec<u8>),
    /// Switch a connection's read-side framing: `true` for raw binary chunks
    /// (mid file transfer), `false` back to delimiter-terminated lines.
    SetFraming(ConnId, bool),
    /// Open a new outbound TCP connection, to be registered under `ConnId`
    /// once established. The `bool` says whether the reactor should wrap
    /// the connection in TLS once the TCP handshake completes — the engine
    /// decides this per-connection (the hub's own scheme for `HUB_CONN`,
    /// `fsm::peerconn::negotiate_encryption`/the remote's own request for a
    /// peer connection), so the reactor never has to guess.
    Connect(ConnId, SocketAddr, bool),
    /// Close a connection for the given reason.
    Disconnect(ConnId, Disconnect<D>),
    /// Ask to be woken again after at least this long, even with no I/O activity.
    SetTimer(tigerhub_common::time::LocalDuration),
    /// Surface a user-visible event (fired on the public client's callbacks).
    Event(E),
}

/// The protocol engine's interface to the reactor.
///
/// Mirrors a typical poll-reactor state machine trait: the reactor calls
/// these as connection-lifecycle and timer events occur, and the engine
/// replies by pushing [`Io`] values onto its outbox (not modeled in this
/// trait directly — see `fsm::Outbox`).
pub trait StateMachine {
    /// The decoded message type flowing over connections.
    type Message;
    /// The user-visible event type.
    type Event;
    /// The protocol-specific disconnect-reason type.
    type DisconnectReason;

    /// Called once, before any other method, with the reactor's starting clock reading.
    fn initialize(&mut self, time: LocalTime) {
        let _ = time;
    }

    /// A message was decoded off `conn`.
    fn message_received(&mut self, conn: ConnId, msg: Self::Message);

    /// An outbound `Connect` finished dialing `conn` (success or failure is
    /// reported separately via `connected`/`disconnected`).
    fn attempted(&mut self, conn: ConnId) {
        let _ = conn;
    }

    /// `conn` finished its transport-level handshake (TCP connect, or accept).
    /// `tls_fingerprint` is the SHA-256 fingerprint of the peer's certificate,
    /// observed by the transport, when the connection is encrypted.
    fn connected(&mut self, conn: ConnId, link: Link, tls_fingerprint: Option<String>);

    /// `conn` closed.
    fn disconnected(&mut self, conn: ConnId, reason: Disconnect<Self::DisconnectReason>);

    /// The reactor's clock advanced; no guarantee of regularity.
    fn tick(&mut self, time: LocalTime) {
        let _ = time;
    }

    /// A previously requested `SetTimer` elapsed.
    fn timer_expired(&mut self) {}
}
