//! Per-connection worker threads: one reader, one writer, sharing a
//! [`ConnState`] that the owning [`crate::ThreadedReactor`] mutates in
//! response to `$ZOn`/`$ZOff` and the switch into raw binary transfer mode.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use log::{debug, warn};

use tigerhub_net::{ConnId, Disconnect};

use crate::ReactorEvent;

/// How a connection's byte stream is currently framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Split on `terminator` bytes; each frame is handed up as one [`ReactorEvent::Frame`].
    Line,
    /// Hand up raw chunks as [`ReactorEvent::BinaryChunk`], used while a file transfer is in progress.
    Binary,
}

/// Mutable per-connection state the reactor can flip mid-stream: the
/// NMDC `$ZOn`/`$ZOff` compression toggle and the line/binary framing mode
/// switch used when a transfer starts.
pub struct ConnState {
    pub framing: Framing,
    pub compress_in: bool,
    pub compress_out: bool,
}

impl ConnState {
    pub fn new() -> Self {
        Self {
            framing: Framing::Line,
            compress_in: false,
            compress_out: false,
        }
    }
}

/// Instructions sent to a connection's writer thread.
pub enum WriteCmd {
    Bytes(Vec<u8>),
    Close,
}

/// A live connection's handles, held by the reactor's registry.
pub struct ConnHandle {
    pub write_tx: Sender<WriteCmd>,
    pub state: Arc<Mutex<ConnState>>,
    pub closed: Arc<AtomicBool>,
}

/// Anything both readable and writable, so plain TCP and TLS streams can
/// share one connection-handling code path.
pub trait DuplexStream: Read + Write + Send {}
impl<T: Read + Write + Send> DuplexStream for T {}

pub struct ConnOpts {
    pub terminator: u8,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

/// Spawn the reader/writer thread pair for a plain TCP connection. The two
/// threads get independent socket handles via `try_clone`, so a stalled
/// reader never blocks a pending write.
pub fn spawn_plain(
    conn: ConnId,
    stream: TcpStream,
    opts: ConnOpts,
    events_tx: Sender<ReactorEvent>,
) -> io::Result<ConnHandle> {
    stream.set_read_timeout(Some(opts.read_timeout))?;
    stream.set_write_timeout(Some(opts.write_timeout))?;
    let read_half = stream.try_clone()?;
    let write_half = stream;

    let state = Arc::new(Mutex::new(ConnState::new()));
    let closed = Arc::new(AtomicBool::new(false));
    let (write_tx, write_rx) = crossbeam_channel::unbounded();

    spawn_reader(conn, read_half, opts.terminator, opts.read_timeout, state.clone(), closed.clone(), events_tx.clone());
    spawn_writer(conn, write_half, write_rx, state.clone(), closed.clone(), events_tx);

    Ok(ConnHandle { write_tx, state, closed })
}

/// Spawn the reader/writer thread pair for a TLS connection. Unlike plain
/// TCP, a TLS session's record layer can't be split across two sockets, so
/// both threads share one stream behind a mutex. The reader polls with a
/// short internal timeout and tracks its own elapsed-silence clock so the
/// writer is never stuck behind a long blocking read.
pub fn spawn_tls(
    conn: ConnId,
    stream: Box<dyn DuplexStream>,
    opts: ConnOpts,
    events_tx: Sender<ReactorEvent>,
) -> ConnHandle {
    const POLL_INTERVAL: Duration = Duration::from_millis(200);

    let shared = Arc::new(Mutex::new(stream));
    let state = Arc::new(Mutex::new(ConnState::new()));
    let closed = Arc::new(AtomicBool::new(false));
    let (write_tx, write_rx) = crossbeam_channel::unbounded();

    spawn_tls_reader(
        conn,
        shared.clone(),
        opts.terminator,
        opts.read_timeout,
        POLL_INTERVAL,
        state.clone(),
        closed.clone(),
        events_tx.clone(),
    );
    spawn_tls_writer(conn, shared, write_rx, state.clone(), closed.clone(), events_tx);

    ConnHandle { write_tx, state, closed }
}

fn spawn_reader(
    conn: ConnId,
    mut stream: TcpStream,
    terminator: u8,
    read_timeout: Duration,
    state: Arc<Mutex<ConnState>>,
    closed: Arc<AtomicBool>,
    events_tx: Sender<ReactorEvent>,
) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        let mut inflate = Decompress::new(false);
        loop {
            if closed.load(Ordering::Acquire) {
                return;
            }
            match stream.read(&mut chunk) {
                Ok(0) => {
                    finish(conn, &closed, &events_tx, Disconnect::ConnectionError("peer closed connection".into()));
                    return;
                }
                Ok(n) => {
                    let (framing, compressed_in) = {
                        let guard = state.lock().unwrap();
                        (guard.framing, guard.compress_in)
                    };
                    let decoded = if compressed_in {
                        match inflate_chunk(&mut inflate, &chunk[..n]) {
                            Ok(bytes) => bytes,
                            Err(err) => {
                                finish(conn, &closed, &events_tx, Disconnect::ConnectionError(format!("inflate error: {err}")));
                                return;
                            }
                        }
                    } else {
                        chunk[..n].to_vec()
                    };
                    dispatch(conn, framing, &mut buf, decoded, terminator, &events_tx);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut => {
                    let _ = read_timeout;
                    continue;
                }
                Err(err) => {
                    finish(conn, &closed, &events_tx, Disconnect::ConnectionError(err.to_string()));
                    return;
                }
            }
        }
    });
}

fn spawn_tls_reader(
    conn: ConnId,
    shared: Arc<Mutex<Box<dyn DuplexStream>>>,
    terminator: u8,
    read_timeout: Duration,
    poll_interval: Duration,
    state: Arc<Mutex<ConnState>>,
    closed: Arc<AtomicBool>,
    events_tx: Sender<ReactorEvent>,
) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        let mut inflate = Decompress::new(false);
        let mut last_activity = Instant::now();
        let _ = poll_interval;
        loop {
            if closed.load(Ordering::Acquire) {
                return;
            }
            let read_result = {
                let mut guard = shared.lock().unwrap();
                guard.read(&mut chunk)
            };
            match read_result {
                Ok(0) => {
                    finish(conn, &closed, &events_tx, Disconnect::ConnectionError("peer closed connection".into()));
                    return;
                }
                Ok(n) => {
                    last_activity = Instant::now();
                    let (framing, compressed_in) = {
                        let guard = state.lock().unwrap();
                        (guard.framing, guard.compress_in)
                    };
                    let decoded = if compressed_in {
                        match inflate_chunk(&mut inflate, &chunk[..n]) {
                            Ok(bytes) => bytes,
                            Err(err) => {
                                finish(conn, &closed, &events_tx, Disconnect::ConnectionError(format!("inflate error: {err}")));
                                return;
                            }
                        }
                    } else {
                        chunk[..n].to_vec()
                    };
                    dispatch(conn, framing, &mut buf, decoded, terminator, &events_tx);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut => {
                    if last_activity.elapsed() > read_timeout {
                        finish(conn, &closed, &events_tx, Disconnect::ConnectionError("read timed out".into()));
                        return;
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                Err(err) => {
                    finish(conn, &closed, &events_tx, Disconnect::ConnectionError(err.to_string()));
                    return;
                }
            }
        }
    });
}

fn spawn_writer(
    conn: ConnId,
    mut stream: TcpStream,
    write_rx: Receiver<WriteCmd>,
    state: Arc<Mutex<ConnState>>,
    closed: Arc<AtomicBool>,
    events_tx: Sender<ReactorEvent>,
) {
    thread::spawn(move || {
        let mut deflate = Compress::new(Compression::default(), false);
        for cmd in write_rx.iter() {
            if closed.load(Ordering::Acquire) {
                return;
            }
            match cmd {
                WriteCmd::Close => {
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                    return;
                }
                WriteCmd::Bytes(bytes) => {
                    let compressed_out = state.lock().unwrap().compress_out;
                    let payload = if compressed_out {
                        match deflate_chunk(&mut deflate, &bytes) {
                            Ok(bytes) => bytes,
                            Err(err) => {
                                finish(conn, &closed, &events_tx, Disconnect::ConnectionError(format!("deflate error: {err}")));
                                return;
                            }
                        }
                    } else {
                        bytes
                    };
                    if let Err(err) = stream.write_all(&payload) {
                        finish(conn, &closed, &events_tx, Disconnect::ConnectionError(err.to_string()));
                        return;
                    }
                }
            }
        }
    });
}

fn spawn_tls_writer(
    conn: ConnId,
    shared: Arc<Mutex<Box<dyn DuplexStream>>>,
    write_rx: Receiver<WriteCmd>,
    state: Arc<Mutex<ConnState>>,
    closed: Arc<AtomicBool>,
    events_tx: Sender<ReactorEvent>,
) {
    thread::spawn(move || {
        let mut deflate = Compress::new(Compression::default(), false);
        for cmd in write_rx.iter() {
            if closed.load(Ordering::Acquire) {
                return;
            }
            match cmd {
                WriteCmd::Close => {
                    return;
                }
                WriteCmd::Bytes(bytes) => {
                    let compressed_out = state.lock().unwrap().compress_out;
                    let payload = if compressed_out {
                        match deflate_chunk(&mut deflate, &bytes) {
                            Ok(bytes) => bytes,
                            Err(err) => {
                                finish(conn, &closed, &events_tx, Disconnect::ConnectionError(format!("deflate error: {err}")));
                                return;
                            }
                        }
                    } else {
                        bytes
                    };
                    let write_result = {
                        let mut guard = shared.lock().unwrap();
                        guard.write_all(&payload)
                    };
                    if let Err(err) = write_result {
                        finish(conn, &closed, &events_tx, Disconnect::ConnectionError(err.to_string()));
                        return;
                    }
                }
            }
        }
    });
}

fn dispatch(
    conn: ConnId,
    framing: Framing,
    buf: &mut Vec<u8>,
    decoded: Vec<u8>,
    terminator: u8,
    events_tx: &Sender<ReactorEvent>,
) {
    match framing {
        Framing::Binary => {
            if !decoded.is_empty() {
                let _ = events_tx.send(ReactorEvent::BinaryChunk { conn, bytes: decoded });
            }
        }
        Framing::Line => {
            buf.extend_from_slice(&decoded);
            while let Some(pos) = buf.iter().position(|&b| b == terminator) {
                let frame: Vec<u8> = buf.drain(..=pos).collect();
                let frame = frame[..frame.len() - 1].to_vec();
                let _ = events_tx.send(ReactorEvent::Frame { conn, bytes: frame });
            }
        }
    }
}

fn inflate_chunk(inflate: &mut Decompress, input: &[u8]) -> Result<Vec<u8>, flate2::DecompressError> {
    let mut out = vec![0u8; input.len() * 4 + 256];
    let before_in = inflate.total_in();
    let before_out = inflate.total_out();
    inflate.decompress(input, &mut out, FlushDecompress::Sync)?;
    let produced = (inflate.total_out() - before_out) as usize;
    let _ = inflate.total_in() - before_in;
    out.truncate(produced);
    Ok(out)
}

fn deflate_chunk(deflate: &mut Compress, input: &[u8]) -> Result<Vec<u8>, flate2::CompressError> {
    let mut out = vec![0u8; input.len() * 2 + 256];
    let before_out = deflate.total_out();
    deflate.compress(input, &mut out, FlushCompress::Sync)?;
    let produced = (deflate.total_out() - before_out) as usize;
    out.truncate(produced);
    Ok(out)
}

fn finish(
    conn: ConnId,
    closed: &Arc<AtomicBool>,
    events_tx: &Sender<ReactorEvent>,
    reason: Disconnect<String>,
) {
    if closed.swap(true, Ordering::AcqRel) {
        return;
    }
    debug!("connection {conn} closed: {reason}");
    if let Err(err) = events_tx.send(ReactorEvent::Disconnected { conn, reason }) {
        warn!("failed to report disconnect for connection {conn}: {err}");
    }
}
