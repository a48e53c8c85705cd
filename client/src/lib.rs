//! The public Direct Connect client: owns one protocol [`Engine`] and one
//! [`ThreadedReactor`], and drives the two together on a dedicated thread.
//!
//! `Client` never blocks the caller: every method either queues work onto
//! the engine (draining its outbox onto the reactor immediately) or runs a
//! caller-supplied closure against the engine under a lock (`safe`), so it
//! can be called freely from any thread, including the callbacks it fires.
#![warn(missing_docs)]

mod callbacks;
mod error;
mod index;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use tigerhub_common::config::{ClientConfig, HubScheme};
use tigerhub_common::download::{Destination, DownloadConf, Resource};
use tigerhub_common::peer::{Peer, PeerId};
use tigerhub_common::search::{SearchConf, SearchToken};
use tigerhub_common::share::InMemoryShareIndex;
use tigerhub_common::time::{Clock, SystemClock};
use tigerhub_fsm::Engine;
use tigerhub_net::{ConnId, Disconnect, Io, StateMachine};
use tigerhub_net_threaded::{ConnectOpts, ListenOpts, ReactorEvent, ThreadedReactor};
use tigerhub_proto::message::Dialect;

pub use callbacks::Callbacks;
pub use error::Error;

/// How often the run loop wakes up even with no reactor events, so
/// `Engine::tick` (keepalives, search expiry) keeps running.
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// The public Direct Connect client.
pub struct Client {
    config: ClientConfig,
    engine: Arc<Mutex<Engine>>,
    reactor: Arc<ThreadedReactor>,
    callbacks: Arc<Callbacks>,
    shares: Arc<Mutex<HashMap<String, InMemoryShareIndex>>>,
    clock: SystemClock,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Build a client for `config`, validating it up front. No socket is
    /// opened until [`Client::run`] is called.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        let clock = SystemClock::new();
        let share = Arc::new(InMemoryShareIndex::new());
        let engine = Engine::new(config.clone(), share, clock.local_time());
        Ok(Self {
            config,
            engine: Arc::new(Mutex::new(engine)),
            reactor: Arc::new(ThreadedReactor::new()),
            callbacks: Arc::new(Callbacks::default()),
            shares: Arc::new(Mutex::new(HashMap::new())),
            clock,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    /// Register the callback fired once the hub login handshake completes.
    pub fn on_hub_connected(&mut self, f: impl Fn() + Send + Sync + 'static) {
        Arc::get_mut(&mut self.callbacks).expect("callbacks set before run").on_hub_connected(f);
    }

    /// Register the callback fired when the hub session ends.
    pub fn on_hub_disconnected(&mut self, f: impl Fn(String) + Send + Sync + 'static) {
        Arc::get_mut(&mut self.callbacks).expect("callbacks set before run").on_hub_disconnected(f);
    }

    /// Register the callback fired when a peer joins the roster or a peer
    /// connection finishes its handshake.
    pub fn on_peer_connected(&mut self, f: impl Fn(Peer) + Send + Sync + 'static) {
        Arc::get_mut(&mut self.callbacks).expect("callbacks set before run").on_peer_connected(f);
    }

    /// Register the callback fired when an existing peer's info changes.
    pub fn on_peer_updated(&mut self, f: impl Fn(Peer) + Send + Sync + 'static) {
        Arc::get_mut(&mut self.callbacks).expect("callbacks set before run").on_peer_updated(f);
    }

    /// Register the callback fired when a peer leaves the roster.
    pub fn on_peer_disconnected(&mut self, f: impl Fn(PeerId) + Send + Sync + 'static) {
        Arc::get_mut(&mut self.callbacks).expect("callbacks set before run").on_peer_disconnected(f);
    }

    /// Register the callback fired when a download completes successfully.
    pub fn on_download_successful(&mut self, f: impl Fn(PeerId, Option<PathBuf>) + Send + Sync + 'static) {
        Arc::get_mut(&mut self.callbacks).expect("callbacks set before run").on_download_succeeded(move |(peer, path)| f(peer, path));
    }

    /// Register the callback fired when a download fails.
    pub fn on_download_error(&mut self, f: impl Fn(PeerId, String) + Send + Sync + 'static) {
        Arc::get_mut(&mut self.callbacks).expect("callbacks set before run").on_download_error(move |(peer, reason)| f(peer, reason));
    }

    /// Register the callback fired on download progress updates.
    pub fn on_download_progress(
        &mut self,
        f: impl Fn(PeerId, tigerhub_common::download::DownloadState, u64) + Send + Sync + 'static,
    ) {
        Arc::get_mut(&mut self.callbacks).expect("callbacks set before run").on_download_progress(move |(peer, state, n)| f(peer, state, n));
    }

    /// Register the callback fired for each search result.
    pub fn on_search_result(
        &mut self,
        f: impl Fn(tigerhub_common::search::Search, tigerhub_common::search::SearchResult) + Send + Sync + 'static,
    ) {
        Arc::get_mut(&mut self.callbacks).expect("callbacks set before run").on_search_result(move |(s, r)| f(s, r));
    }

    /// Register the callback fired once an alias finishes (re)indexing.
    pub fn on_share_indexed(&mut self, f: impl Fn(String, u64) + Send + Sync + 'static) {
        Arc::get_mut(&mut self.callbacks).expect("callbacks set before run").on_share_indexed(move |(alias, n)| f(alias, n));
    }

    /// Register the callback fired once `Client::new` has finished.
    pub fn on_initialized(&mut self, f: impl Fn() + Send + Sync + 'static) {
        Arc::get_mut(&mut self.callbacks).expect("callbacks set before run").on_initialized(f);
    }

    /// Register the callback fired for recoverable protocol errors.
    pub fn on_error(&mut self, f: impl Fn(tigerhub_fsm::Error) + Send + Sync + 'static) {
        Arc::get_mut(&mut self.callbacks).expect("callbacks set before run").on_error(f);
    }

    /// Run the event loop on a dedicated thread and return immediately.
    ///
    /// Opens the peer listeners (unless `is_passive`), dials the hub (unless
    /// `hub_manual_connect`), and then loops draining reactor events and
    /// engine timer ticks until [`Client::terminate`] is called.
    pub fn run(&self) -> Result<(), Error> {
        let mut thread_slot = self.thread.lock().unwrap();
        if thread_slot.is_some() {
            return Err(Error::AlreadyRunning);
        }

        if !self.config.is_passive {
            let bind = SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), self.config.tcp_port);
            let terminator = dialect_for(self.config.hub_url.scheme).terminator();
            let opts = ListenOpts { tls: None, terminator, ..ListenOpts::default() };
            self.reactor.listen(bind, opts).map_err(|source| Error::Listen { addr: bind, source })?;

            if self.config.tcp_tls_port != 0 {
                let tls_bind = SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), self.config.tcp_tls_port);
                let cert = tigerhub_net_threaded::tls::generate_self_signed("tigerhub-peer")
                    .map_err(|source| Error::Listen { addr: tls_bind, source: std::io::Error::new(std::io::ErrorKind::Other, source.to_string()) })?;
                let opts = ListenOpts { tls: Some(Arc::new(cert)), terminator, ..ListenOpts::default() };
                self.reactor.listen(tls_bind, opts).map_err(|source| Error::Listen { addr: tls_bind, source })?;
            }
        }

        {
            let mut engine = self.engine.lock().unwrap();
            engine.initialize(self.clock.local_time());
            self.drain_and_apply(&mut engine);
        }

        if !self.config.hub_manual_connect {
            self.hub_connect()?;
        }

        self.running.store(true, Ordering::SeqCst);
        let engine = self.engine.clone();
        let reactor = self.reactor.clone();
        let callbacks = self.callbacks.clone();
        let running = self.running.clone();
        let clock = self.clock;
        let hub_scheme = self.config.hub_url.scheme;

        let handle = std::thread::spawn(move || {
            info!("event loop started");
            while running.load(Ordering::SeqCst) {
                match reactor.events().recv_timeout(TICK_INTERVAL) {
                    Ok(event) => {
                        let mut engine = engine.lock().unwrap();
                        apply_reactor_event(&mut engine, event, hub_scheme);
                        drain_into(&reactor, &mut engine, &callbacks, hub_scheme);
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        let mut engine = engine.lock().unwrap();
                        engine.tick(clock.local_time());
                        drain_into(&reactor, &mut engine, &callbacks, hub_scheme);
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("event loop stopped");
        });
        *thread_slot = Some(handle);
        Ok(())
    }

    /// Stop the event loop and join its thread. Open connections are left
    /// to close as the reactor's threads unwind; this does not block on them.
    pub fn terminate(&self) -> Result<(), Error> {
        let mut thread_slot = self.thread.lock().unwrap();
        let Some(handle) = thread_slot.take() else {
            return Err(Error::NotRunning);
        };
        self.running.store(false, Ordering::SeqCst);
        let _ = handle.join();
        Ok(())
    }

    /// Run `f` against the engine under its lock, draining and applying
    /// whatever it queues before returning. Safe to call from any thread,
    /// including from inside a callback.
    pub fn safe<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> R {
        let mut engine = self.engine.lock().unwrap();
        let result = f(&mut engine);
        self.drain_and_apply(&mut engine);
        result
    }

    /// Dial the hub now. Only needed when `hub_manual_connect` was set;
    /// `run` calls this itself otherwise.
    pub fn hub_connect(&self) -> Result<(), Error> {
        self.safe(|engine| engine.hub_connect())?;
        Ok(())
    }

    /// The current peer roster.
    pub fn peers(&self) -> Vec<Peer> {
        self.safe(|engine| engine.roster().cloned().collect())
    }

    /// Issue a search, returning the token results will be reported against.
    pub fn search(&self, conf: SearchConf) -> SearchToken {
        self.safe(|engine| engine.search(conf))
    }

    /// Download a peer's file list.
    pub fn download_file_list(&self, peer: impl Into<PeerId>, destination: Destination) -> Result<(), Error> {
        let conf = DownloadConf { peer: peer.into(), resource: Resource::FileList, destination };
        self.safe(|engine| engine.download(conf))?;
        Ok(())
    }

    /// Download a file by its Tiger-Tree-Hash (from a search result, typically).
    pub fn download_file(&self, peer: impl Into<PeerId>, tth: tigerhub_common::tth::Tth, size: Option<u64>, destination: Destination) -> Result<(), Error> {
        let conf = DownloadConf { peer: peer.into(), resource: Resource::Tth { tth, size }, destination };
        self.safe(|engine| engine.download(conf))?;
        Ok(())
    }

    /// Download a file by its virtual path inside a peer's already-fetched file list.
    pub fn download_fl_file(&self, peer: impl Into<PeerId>, path: impl Into<String>, destination: Destination) -> Result<(), Error> {
        let conf = DownloadConf { peer: peer.into(), resource: Resource::Path(path.into()), destination };
        self.safe(|engine| engine.download(conf))?;
        Ok(())
    }

    /// (Re)index a directory under `alias` and publish the merged share
    /// snapshot to the engine.
    pub fn share_add(&self, alias: impl Into<String>, root: impl AsRef<Path>) {
        let alias = alias.into();
        let indexed = index::index_directory(&alias, root.as_ref());
        let mut shares = self.shares.lock().unwrap();
        shares.insert(alias.clone(), indexed);
        let merged = Arc::new(index::merge(&shares));
        drop(shares);
        self.safe(|engine| engine.update_share(alias, merged));
    }

    fn drain_and_apply(&self, engine: &mut Engine) {
        drain_into(&self.reactor, engine, &self.callbacks, self.config.hub_url.scheme);
    }
}

/// The wire dialect a hub (and every peer connection it spawns) speaks.
fn dialect_for(scheme: HubScheme) -> Dialect {
    if scheme.is_adc() {
        Dialect::Adc
    } else {
        Dialect::Nmdc
    }
}

/// Reframe a transport-level disconnect reason as an engine one, attributing
/// it to the hub or a peer connection depending on which `conn` it came from.
fn convert_disconnect(reason: Disconnect<String>, conn: ConnId) -> Disconnect<tigerhub_fsm::DisconnectReason> {
    let wrap = |s: String| {
        if conn == tigerhub_fsm::HUB_CONN {
            tigerhub_fsm::DisconnectReason::Hub(s)
        } else {
            tigerhub_fsm::DisconnectReason::Peer(s)
        }
    };
    match reason {
        Disconnect::Command => Disconnect::Command,
        Disconnect::ConnectionError(e) => Disconnect::ConnectionError(e),
        Disconnect::StateMachine(s) => Disconnect::StateMachine(wrap(s)),
    }
}

fn apply_reactor_event(engine: &mut Engine, event: ReactorEvent, hub_scheme: HubScheme) {
    match event {
        ReactorEvent::Connected { conn, addr, link, tls_fingerprint } => {
            debug!("connection {conn} established with {addr}");
            engine.connected(conn, link, tls_fingerprint);
        }
        ReactorEvent::ConnectFailed { conn, error } => {
            warn!("connection {conn} failed: {error}");
            engine.disconnected(conn, Disconnect::ConnectionError(error));
        }
        ReactorEvent::Frame { conn, bytes } => {
            // The hub and every peer connection it spawns share one dialect.
            let dialect = dialect_for(hub_scheme);
            match tigerhub_proto::decode(dialect, &bytes) {
                Ok(msg) => engine.message_received(conn, msg),
                Err(err) => warn!("failed to decode frame on connection {conn}: {err}"),
            }
        }
        ReactorEvent::BinaryChunk { conn, bytes } => engine.binary_chunk_received(conn, &bytes),
        ReactorEvent::Disconnected { conn, reason } => {
            engine.disconnected(conn, convert_disconnect(reason, conn));
        }
    }
}

/// Drain the engine's outbox and apply every queued [`Io`] instruction,
/// firing callbacks for [`Io::Event`]s as they're encountered.
///
/// `hub_scheme` picks the framing terminator; every dial the engine issues
/// (the hub connection or a peer connection) shares the hub's dialect.
/// Whether a given dial is wrapped in TLS is decided by the engine itself
/// and carried on `Io::Connect`, not recomputed here.
fn drain_into(reactor: &ThreadedReactor, engine: &mut Engine, callbacks: &Callbacks, hub_scheme: HubScheme) {
    for io in engine.drain_outbox().collect::<Vec<_>>() {
        match io {
            Io::Write(conn, msg) => reactor.write(conn, tigerhub_proto::encode(&msg)),
            Io::WriteBytes(conn, bytes) => reactor.write(conn, bytes),
            Io::SetFraming(conn, true) => reactor.switch_to_binary(conn),
            Io::SetFraming(conn, false) => reactor.switch_to_line(conn),
            Io::Connect(conn, addr, tls) => {
                let terminator = dialect_for(hub_scheme).terminator();
                let opts = ConnectOpts { tls, terminator, ..ConnectOpts::default() };
                reactor.connect(conn, addr, opts);
            }
            Io::Disconnect(conn, _reason) => reactor.disconnect(conn),
            Io::SetTimer(_delay) => {}
            Io::Event(event) => callbacks.dispatch(event),
        }
    }
}
