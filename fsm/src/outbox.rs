//! A queue of pending [`Io`] values. Sub-managers never touch the reactor
//! directly; they push onto a shared `Outbox`, which the owning [`crate::Engine`]
//! drains after each state transition. This keeps every manager's logic
//! synchronous and testable without a live reactor.

use std::collections::VecDeque;
use std::net::SocketAddr;

use tigerhub_common::time::LocalDuration;
use tigerhub_net::{ConnId, Disconnect, Io};

/// A FIFO of instructions produced by one batch of state mutation.
pub struct Outbox<M, E, D> {
    queue: VecDeque<Io<M, E, D>>,
}

impl<M, E, D> Outbox<M, E, D> {
    /// An empty outbox.
    pub fn new() -> Self {
        Self { queue: VecDeque::new() }
    }

    /// Queue a message write on `conn`.
    pub fn write(&mut self, conn: ConnId, msg: M) {
        self.queue.push_back(Io::Write(conn, msg));
    }

    /// Queue a raw binary payload write on `conn`, outside the dialect codec.
    pub fn write_bytes(&mut self, conn: ConnId, bytes: Vec<u8>) {
        self.queue.push_back(Io::WriteBytes(conn, bytes));
    }

    /// Queue a read-side framing switch on `conn` (binary mid-transfer, line otherwise).
    pub fn set_framing(&mut self, conn: ConnId, binary: bool) {
        self.queue.push_back(Io::SetFraming(conn, binary));
    }

    /// Queue an outbound dial, to be registered under `conn` once it
    /// completes. `encrypted` decides whether the reactor wraps it in TLS.
    pub fn connect(&mut self, conn: ConnId, addr: SocketAddr, encrypted: bool) {
        self.queue.push_back(Io::Connect(conn, addr, encrypted));
    }

    /// Queue a connection close.
    pub fn disconnect(&mut self, conn: ConnId, reason: Disconnect<D>) {
        self.queue.push_back(Io::Disconnect(conn, reason));
    }

    /// Ask to be woken again after at least `delay`.
    pub fn set_timer(&mut self, delay: LocalDuration) {
        self.queue.push_back(Io::SetTimer(delay));
    }

    /// Surface a user-visible event.
    pub fn event(&mut self, event: E) {
        self.queue.push_back(Io::Event(event));
    }

    /// Drain every queued instruction, in order.
    pub fn drain(&mut self) -> std::collections::vec_deque::Drain<'_, Io<M, E, D>> {
        self.queue.drain(..)
    }

    /// Whether anything is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<M, E, D> Default for Outbox<M, E, D> {
    fn default() -> Self {
        Self::new()
    }
}
