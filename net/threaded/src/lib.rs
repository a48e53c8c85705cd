//! A thread-per-connection [`Reactor`]-style transport: one reader thread
//! and one writer thread per connection, talking plain TCP or self-signed
//! TLS, framing a line-delimited text protocol or raw binary transfer
//! chunks, with NMDC's mid-stream `$ZOn`/`$ZOff` zlib toggle supported on
//! both directions independently.
//!
//! This crate knows nothing about NMDC or ADC syntax. It hands the protocol
//! engine (`tigerhub-fsm`) delimiter-stripped frames and raw binary chunks;
//! decoding those into [`tigerhub_proto`](../tigerhub_proto) messages happens
//! one layer up.
#![warn(missing_docs)]

mod conn;
pub mod tls;

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};

pub use tigerhub_net::{ConnId, Disconnect};
use tigerhub_net::Link;

use conn::{ConnHandle, ConnOpts, Framing, WriteCmd};

/// An event surfaced by the reactor to whatever drives the protocol engine's
/// event loop (the `client` crate's `Client::run`).
#[derive(Debug)]
pub enum ReactorEvent {
    /// A requested outbound connection finished its transport handshake.
    Connected {
        /// The connection this event is about.
        conn: ConnId,
        /// The remote address actually connected to.
        addr: SocketAddr,
        /// Whether this side dialed out or accepted the connection.
        link: Link,
        /// SHA-256 fingerprint of the peer's TLS certificate, observed
        /// during the handshake. `None` for plaintext connections, or when
        /// the peer presented no certificate (an inbound accept, since our
        /// own client config never presents a client certificate).
        tls_fingerprint: Option<String>,
    },
    /// A requested outbound connection failed before completing its handshake.
    ConnectFailed {
        /// The connection this event is about.
        conn: ConnId,
        /// A human-readable description of the failure.
        error: String,
    },
    /// One delimiter-stripped frame was received in line mode.
    Frame {
        /// The connection this event is about.
        conn: ConnId,
        /// The frame, with its terminator byte already stripped.
        bytes: Vec<u8>,
    },
    /// A chunk of raw bytes was received in binary mode (mid file transfer).
    BinaryChunk {
        /// The connection this event is about.
        conn: ConnId,
        /// The raw bytes, in receive order; no framing is implied.
        bytes: Vec<u8>,
    },
    /// A connection closed, for any reason.
    Disconnected {
        /// The connection this event is about.
        conn: ConnId,
        /// Why the connection closed.
        reason: Disconnect<String>,
    },
}

/// Options for an outbound [`ThreadedReactor::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOpts {
    /// Wrap the connection in TLS once the TCP handshake completes.
    pub tls: bool,
    /// Byte marking the end of a frame in line mode (`|` for NMDC, `\n` for ADC).
    pub terminator: u8,
    /// How long to wait for the initial TCP connect to complete.
    pub connect_timeout: Duration,
    /// How long a read may go without producing data before the connection is dropped.
    pub read_timeout: Duration,
    /// How long a write may block before the connection is dropped.
    pub write_timeout: Duration,
}

impl Default for ConnectOpts {
    fn default() -> Self {
        Self {
            tls: false,
            terminator: b'|',
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(30),
        }
    }
}

/// Options for [`ThreadedReactor::listen`].
pub struct ListenOpts {
    /// Accept connections over TLS using this self-signed certificate.
    pub tls: Option<Arc<tls::SelfSignedCert>>,
    /// Byte marking the end of a frame in line mode.
    pub terminator: u8,
    /// How long a read may go without producing data before the connection is dropped.
    pub read_timeout: Duration,
    /// How long a write may block before the connection is dropped.
    pub write_timeout: Duration,
}

impl Default for ListenOpts {
    fn default() -> Self {
        Self {
            tls: None,
            terminator: b'|',
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(30),
        }
    }
}

/// A thread-per-connection reactor: the transport half of the protocol
/// engine's `Io` loop. Connections are registered under caller-chosen
/// [`ConnId`]s for outbound dials (so the engine can correlate the eventual
/// `Connected`/`ConnectFailed` event with what it asked for) and
/// reactor-chosen ids for inbound accepts.
pub struct ThreadedReactor {
    next_conn: Arc<AtomicU64>,
    registry: Arc<Mutex<HashMap<ConnId, ConnHandle>>>,
    events_tx: Sender<ReactorEvent>,
    events_rx: Receiver<ReactorEvent>,
}

impl ThreadedReactor {
    /// Build a reactor with no open connections.
    ///
    /// Connection ids are partitioned so the engine (which picks ids for its
    /// own outbound dials, including the one hub connection) and this
    /// reactor's accept loop (which picks ids for inbound connections) never
    /// collide without needing to coordinate: id `0` is reserved for the hub
    /// connection, odd ids are engine-initiated outbound peer dials, even
    /// ids from `2` up are inbound accepts. See `tigerhub_fsm::HUB_CONN` and
    /// `tigerhub_fsm::OutboundIds::allocate`.
    pub fn new() -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            next_conn: Arc::new(AtomicU64::new(2)),
            registry: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            events_rx,
        }
    }

    /// The channel the event loop should drain on every iteration.
    pub fn events(&self) -> &Receiver<ReactorEvent> {
        &self.events_rx
    }

    /// Dial `addr`, registering the resulting connection under `conn`.
    ///
    /// `conn` must come from the caller's own id space (the hub's reserved
    /// `0`, or an odd id from `tigerhub_fsm`'s outbound allocator) — never
    /// from this reactor's inbound accept counter.
    ///
    /// Dialing and the TLS handshake happen on a dedicated thread; the
    /// caller finds out the outcome via a `Connected` or `ConnectFailed`
    /// event, never as a return value, so the event loop never blocks here.
    pub fn connect(&self, conn: ConnId, addr: SocketAddr, opts: ConnectOpts) {
        let events_tx = self.events_tx.clone();
        let registry = self.registry.clone();
        thread::spawn(move || {
            let stream = match TcpStream::connect_timeout(&addr, opts.connect_timeout) {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = events_tx.send(ReactorEvent::ConnectFailed { conn, error: err.to_string() });
                    return;
                }
            };
            let conn_opts = ConnOpts {
                terminator: opts.terminator,
                read_timeout: opts.read_timeout,
                write_timeout: opts.write_timeout,
            };
            let (handle, tls_fingerprint) = if opts.tls {
                match wrap_client_tls(stream) {
                    Ok((tls_stream, fingerprint)) => {
                        (conn::spawn_tls(conn, tls_stream, conn_opts, events_tx.clone()), fingerprint)
                    }
                    Err(err) => {
                        let _ = events_tx.send(ReactorEvent::ConnectFailed { conn, error: err.to_string() });
                        return;
                    }
                }
            } else {
                match conn::spawn_plain(conn, stream, conn_opts, events_tx.clone()) {
                    Ok(handle) => (handle, None),
                    Err(err) => {
                        let _ = events_tx.send(ReactorEvent::ConnectFailed { conn, error: err.to_string() });
                        return;
                    }
                }
            };
            registry.lock().unwrap().insert(conn, handle);
            let _ = events_tx.send(ReactorEvent::Connected { conn, addr, link: Link::Outbound, tls_fingerprint });
        });
    }

    /// Accept inbound connections on `bind_addr` for as long as the reactor lives.
    ///
    /// Spawns one long-running accept-loop thread; each accepted socket gets
    /// a fresh [`ConnId`] and its own reader/writer pair, same as an outbound
    /// [`Self::connect`].
    pub fn listen(&self, bind_addr: SocketAddr, opts: ListenOpts) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(bind_addr)?;
        let local_addr = listener.local_addr()?;
        let events_tx = self.events_tx.clone();
        let registry = self.registry.clone();
        let next_conn = self.next_conn.clone();
        thread::spawn(move || {
            for incoming in listener.incoming() {
                let stream = match incoming {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!("accept failed on {local_addr}: {err}");
                        continue;
                    }
                };
                let peer_addr = match stream.peer_addr() {
                    Ok(addr) => addr,
                    Err(_) => continue,
                };
                let conn = next_conn.fetch_add(2, Ordering::Relaxed);
                let conn_opts = ConnOpts {
                    terminator: opts.terminator,
                    read_timeout: opts.read_timeout,
                    write_timeout: opts.write_timeout,
                };
                let (handle, tls_fingerprint) = if let Some(cert) = &opts.tls {
                    match wrap_server_tls(stream, cert) {
                        Ok((tls_stream, fingerprint)) => {
                            (conn::spawn_tls(conn, tls_stream, conn_opts, events_tx.clone()), fingerprint)
                        }
                        Err(err) => {
                            warn!("tls accept failed from {peer_addr}: {err}");
                            continue;
                        }
                    }
                } else {
                    match conn::spawn_plain(conn, stream, conn_opts, events_tx.clone()) {
                        Ok(handle) => (handle, None),
                        Err(err) => {
                            warn!("accept setup failed from {peer_addr}: {err}");
                            continue;
                        }
                    }
                };
                registry.lock().unwrap().insert(conn, handle);
                debug!("accepted connection {conn} from {peer_addr}");
                let _ = events_tx.send(ReactorEvent::Connected {
                    conn,
                    addr: peer_addr,
                    link: Link::Inbound,
                    tls_fingerprint,
                });
            }
        });
        Ok(local_addr)
    }

    /// Queue `bytes` for writing on `conn`. Returns without blocking; a
    /// vanished or already-closed connection is silently dropped, matching
    /// a subsequent `Disconnected` event the caller will already have seen
    /// or will see shortly.
    pub fn write(&self, conn: ConnId, bytes: Vec<u8>) {
        let registry = self.registry.lock().unwrap();
        if let Some(handle) = registry.get(&conn) {
            let _ = handle.write_tx.send(WriteCmd::Bytes(bytes));
        }
    }

    /// Close `conn` and drop it from the registry.
    pub fn disconnect(&self, conn: ConnId) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(handle) = registry.remove(&conn) {
            handle.closed.store(true, Ordering::Release);
            let _ = handle.write_tx.send(WriteCmd::Close);
        }
    }

    /// Toggle NMDC's `$ZOn`/`$ZOff` zlib compression independently per
    /// direction. A hub or peer announces `$ZOn` before its own compressed
    /// bytes start, and stays compressed until the connection closes; we
    /// never see a `$ZOff` in practice, but the toggle is independent per
    /// direction to match the protocol's design.
    pub fn set_compression(&self, conn: ConnId, inbound: bool, outbound: bool) {
        let registry = self.registry.lock().unwrap();
        if let Some(handle) = registry.get(&conn) {
            let mut state = handle.state.lock().unwrap();
            state.compress_in = inbound;
            state.compress_out = outbound;
        }
    }

    /// Switch `conn` from line framing to raw binary framing, used when a
    /// file transfer begins after an `$ADCGET`/`$ADCSND` exchange.
    pub fn switch_to_binary(&self, conn: ConnId) {
        self.set_framing(conn, Framing::Binary);
    }

    /// Switch `conn` back to line framing once a transfer completes.
    pub fn switch_to_line(&self, conn: ConnId) {
        self.set_framing(conn, Framing::Line);
    }

    fn set_framing(&self, conn: ConnId, framing: Framing) {
        let registry = self.registry.lock().unwrap();
        if let Some(handle) = registry.get(&conn) {
            handle.state.lock().unwrap().framing = framing;
        }
    }

}

impl Default for ThreadedReactor {
    fn default() -> Self {
        Self::new()
    }
}

/// Complete the handshake on `session` before handing it back type-erased,
/// so its peer certificate (needed for [`tls::fingerprint`]) is still
/// reachable through the concrete connection type.
fn handshake_fingerprint<C: rustls::Connection>(
    session: &mut C,
    stream: &mut TcpStream,
) -> io::Result<Option<String>> {
    session.complete_io(stream)?;
    Ok(session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| tls::fingerprint(&cert.0)))
}

fn wrap_client_tls(
    mut stream: TcpStream,
) -> io::Result<(Box<dyn conn::DuplexStream>, Option<String>)> {
    let config = tls::client_config();
    let server_name = rustls::ServerName::try_from("tigerhub-peer")
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    let mut session = rustls::ClientConnection::new(config, server_name)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    let fingerprint = handshake_fingerprint(&mut session, &mut stream)?;
    Ok((Box::new(rustls::StreamOwned::new(session, stream)), fingerprint))
}

fn wrap_server_tls(
    mut stream: TcpStream,
    cert: &tls::SelfSignedCert,
) -> io::Result<(Box<dyn conn::DuplexStream>, Option<String>)> {
    let config = tls::server_config(cert).map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    let mut session = rustls::ServerConnection::new(config)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    let fingerprint = handshake_fingerprint(&mut session, &mut stream)?;
    Ok((Box::new(rustls::StreamOwned::new(session, stream)), fingerprint))
}
