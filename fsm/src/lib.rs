//! The protocol engine: wires the hub session, peer connection handshakes,
//! transfer engine and search engine into one [`tigerhub_net::StateMachine`].
//!
//! `Engine` never touches a socket. It consumes [`tigerhub_net::StateMachine`]
//! callbacks from whatever reactor drives it (`tigerhub-net-threaded`, via the
//! `client` crate's event loop) and replies by pushing [`tigerhub_net::Io`]
//! values onto its [`Outbox`], drained by the caller after each call.
#![warn(missing_docs)]

pub mod error;
pub mod event;
pub mod hub;
pub mod outbox;
pub mod peerconn;
pub mod search;
pub mod transfer;

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use tigerhub_common::config::ClientConfig;
use tigerhub_common::download::{Download, DownloadConf, Resource};
use tigerhub_common::peer::{Link, PeerId, Sid};
use tigerhub_common::search::{SearchConf, SearchToken};
use tigerhub_common::share::ShareIndex;
use tigerhub_common::time::LocalTime;
use tigerhub_net::{ConnId, Disconnect, StateMachine};
use tigerhub_proto::adc::AdcMessage;
use tigerhub_proto::message::Dialect;
use tigerhub_proto::nmdc::NmdcMessage;
use tigerhub_proto::Message;

pub use error::{DisconnectReason, Error};
pub use event::Event;
pub use hub::HUB_CONN;
pub use outbox::Outbox;
pub use peerconn::{OutboundIds, Purpose};

type EngineOutbox = Outbox<Message, Event, DisconnectReason>;

/// Aggregates every protocol-level sub-manager behind one
/// [`tigerhub_net::StateMachine`] implementation.
pub struct Engine {
    config: ClientConfig,
    now: LocalTime,
    hub: hub::HubSession,
    peers: peerconn::PeerConnections,
    outbound_ids: OutboundIds,
    transfers: transfer::TransferManager,
    search: search::SearchEngine,
    share: Arc<dyn ShareIndex>,
    outbox: EngineOutbox,
    /// Peer identity (and any token we must echo back) for an outbound dial
    /// we issued ourselves, keyed by the connection id we allocated for it —
    /// filled in at dial time since `connected()` only reports the
    /// transport link, not who it's for.
    dialing: HashMap<ConnId, DialingPeer>,
}

/// What we remember about an outbound dial between issuing it and the
/// transport reporting it `connected`.
struct DialingPeer {
    peer: PeerId,
    /// The ADC token we must echo back in our own `CINF`, when this dial
    /// answers a hub-relayed `DCTM` addressed to us.
    echo_token: Option<String>,
}

impl Engine {
    /// Build a new engine for `config`, not yet connected to the hub.
    pub fn new(config: ClientConfig, share: Arc<dyn ShareIndex>, now: LocalTime) -> Self {
        let hub = hub::HubSession::new(&config, now);
        Self {
            config,
            now,
            hub,
            peers: peerconn::PeerConnections::new(),
            outbound_ids: OutboundIds::new(),
            transfers: transfer::TransferManager::new(),
            search: search::SearchEngine::new(),
            share,
            outbox: Outbox::new(),
            dialing: HashMap::new(),
        }
    }

    /// Drain every [`tigerhub_net::Io`] queued since the last call.
    pub fn drain_outbox(&mut self) -> std::collections::vec_deque::Drain<'_, tigerhub_net::Io<Message, Event, DisconnectReason>> {
        self.outbox.drain()
    }

    /// Dial the hub. The reactor reports the outcome via `connected`/`disconnected`.
    ///
    /// Resolves the hub's hostname synchronously, before any connection
    /// exists to drive asynchronously; callers invoke this once, before
    /// starting the event loop.
    pub fn hub_connect(&mut self) -> Result<(), Error> {
        use std::net::ToSocketAddrs;
        let authority = self.config.hub_url.authority();
        let addr = authority
            .to_socket_addrs()
            .map_err(|err| Error::ProtocolViolation { conn: HUB_CONN, reason: format!("resolving hub address {authority}: {err}") })?
            .next()
            .ok_or_else(|| Error::ProtocolViolation { conn: HUB_CONN, reason: format!("hub address {authority} resolved to nothing") })?;
        debug!("dialing hub at {addr}");
        self.outbox.connect(HUB_CONN, addr, self.config.hub_url.scheme.is_secure());
        Ok(())
    }

    /// Replace the share snapshot served to peers (e.g. after re-indexing),
    /// and surface the change as an [`Event::ShareIndexed`].
    pub fn update_share(&mut self, alias: String, share: Arc<dyn ShareIndex>) {
        let total_size = share.total_size();
        self.share = share;
        self.outbox.event(Event::ShareIndexed { alias, total_size });
    }

    /// The current peer roster.
    pub fn roster(&self) -> impl Iterator<Item = &tigerhub_common::peer::Peer> {
        self.hub.roster.values()
    }

    /// Issue a search, returning the token later results will be tagged with.
    pub fn search(&mut self, conf: SearchConf) -> SearchToken {
        let our_sid = self.hub.roster.get(&self.config.nick).and_then(|p| p.adc.as_ref()).map(|a| a.sid);
        self.search.search(
            self.hub.dialect,
            our_sid,
            &self.config.nick,
            self.config.is_passive,
            self.config.udp_port,
            conf,
            self.now,
            &mut self.outbox,
        )
    }

    /// Start (or queue, pending a peer connection) a download.
    pub fn download(&mut self, conf: DownloadConf) -> Result<(), Error> {
        let peer = self.hub.roster.get(&conf.peer).cloned().ok_or_else(|| Error::PeerUnavailable(conf.peer.clone()))?;
        let purpose = match &conf.resource {
            Resource::FileList => Purpose::FileList,
            Resource::Tth { .. } => Purpose::Download(String::new()),
            Resource::Path(path) => Purpose::Download(path.clone()),
        };
        let encrypted = peerconn::negotiate_encryption(self.config.peer_encryption_mode, peer.supports_encryption())?;
        let peer_id = conf.peer.clone();
        self.transfers.queue_download(peer_id.clone(), Download::new(&conf));

        let our_sid = self.hub.roster.get(&self.config.nick).and_then(|p| p.adc.as_ref()).map(|a| a.sid);
        let token = format!("{:08x}", fastrand::u64(..));
        // Only the branch where we ask the peer to connect to us (we're
        // active) results in an inbound connection whose `CINF` echoes this
        // token; when we're passive the peer answers with its own fresh
        // `DCTM`, carrying a token of its own.
        let expected_token = if self.hub.dialect == Dialect::Adc && !self.config.is_passive {
            Some(token.clone())
        } else {
            None
        };
        self.peers.expect(peer_id.clone(), purpose, expected_token);
        let peer_nick_or_sid = match self.hub.dialect {
            Dialect::Nmdc => peer_id.as_str(),
            Dialect::Adc => peer.adc.as_ref().map(|a| sid_str(a.sid)).as_deref().unwrap_or(peer_id.as_str()),
        };
        let peer_nick_or_sid = peer_nick_or_sid.to_string();
        match peerconn::build_connect_request(
            self.hub.dialect,
            self.config.is_passive,
            peer.is_passive,
            our_sid,
            self.config.tcp_port,
            self.config.tcp_tls_port,
            encrypted,
            &peer_nick_or_sid,
            &token,
        ) {
            Some(msg) => {
                self.outbox.write(HUB_CONN, msg);
                Ok(())
            }
            None => Err(Error::PeerUnavailable(peer_id)),
        }
    }

    /// Dial a peer that asked (via a hub-relayed `$ConnectToMe`/`DCTM`) for
    /// us to connect to it. `encrypted` comes straight off that request
    /// (NMDC's `secure` flag, or ADC's `ADCS` protocol string) — the remote
    /// side is the one whose listening socket decides the transport, not
    /// our own [`tigerhub_common::config::PeerEncryptionMode`].
    fn dial_peer(&mut self, peer: PeerId, addr: std::net::SocketAddr, echo_token: Option<String>, encrypted: bool) {
        let conn = self.outbound_ids.allocate();
        self.dialing.insert(conn, DialingPeer { peer, echo_token });
        self.outbox.connect(conn, addr, encrypted);
    }
}

fn sid_str(sid: Sid) -> String {
    sid.to_string()
}

impl StateMachine for Engine {
    type Message = Message;
    type Event = Event;
    type DisconnectReason = DisconnectReason;

    fn initialize(&mut self, time: LocalTime) {
        self.now = time;
    }

    fn message_received(&mut self, conn: ConnId, msg: Self::Message) {
        if conn == HUB_CONN {
            self.handle_hub_message(msg);
        } else {
            self.handle_peer_message(conn, msg);
        }
    }

    fn connected(&mut self, conn: ConnId, link: Link, tls_fingerprint: Option<String>) {
        if conn == HUB_CONN {
            self.hub.on_connected(self.now);
            return;
        }
        let (peer, echo_token) = self.dialing.remove(&conn).map_or((None, None), |d| (Some(d.peer), d.echo_token));
        self.peers.on_connected(conn, link, self.hub.dialect, peer, echo_token, tls_fingerprint);
    }

    fn disconnected(&mut self, conn: ConnId, reason: Disconnect<Self::DisconnectReason>) {
        if conn == HUB_CONN {
            self.hub.on_disconnected(&reason, &mut self.outbox);
            return;
        }
        self.transfers.on_transfer_complete(conn, &mut self.outbox);
        self.peers.on_disconnected(conn);
    }

    fn tick(&mut self, time: LocalTime) {
        self.now = time;
        self.hub.tick(self.now, &mut self.outbox);
        let our_sid = self.hub.roster.get(&self.config.nick).and_then(|p| p.adc.as_ref()).map(|a| a.sid);
        self.search.tick(
            self.hub.dialect,
            our_sid,
            &self.config.nick,
            self.config.is_passive,
            self.config.udp_port,
            self.now,
            &mut self.outbox,
        );
    }
}

impl Engine {
    fn handle_hub_message(&mut self, msg: Message) {
        match &msg {
            Message::Nmdc(NmdcMessage::SearchResult(result)) => {
                if let Some((search, result)) = self.search.on_nmdc_result(result.clone()) {
                    self.outbox.event(Event::SearchResult { search, result });
                }
                return;
            }
            Message::Adc(AdcMessage::DirectResult { author, fields, .. }) => {
                // Routed back through the hub rather than sent over UDP:
                // the searcher (us) must be passive, mirroring NMDC's
                // `hub_address.is_some()` convention.
                let peer = self
                    .hub
                    .roster
                    .values()
                    .find(|p| p.adc.as_ref().map(|a| a.sid) == Some(*author))
                    .map(|p| p.nick.clone())
                    .unwrap_or_default();
                if let Some((search, result)) = self.search.on_adc_result(peer, fields.clone(), false) {
                    self.outbox.event(Event::SearchResult { search, result });
                }
                return;
            }
            Message::Adc(AdcMessage::UdpResult { cid, fields }) => {
                let peer = self
                    .hub
                    .roster
                    .values()
                    .find(|p| p.adc.as_ref().map(|a| &a.cid) == Some(cid))
                    .map(|p| p.nick.clone())
                    .unwrap_or_else(|| cid.0.clone());
                if let Some((search, result)) = self.search.on_adc_result(peer, fields.clone(), true) {
                    self.outbox.event(Event::SearchResult { search, result });
                }
                return;
            }
            Message::Nmdc(NmdcMessage::ConnectToMe { address, port, secure, .. }) => {
                if let Ok(ip) = address.parse::<std::net::IpAddr>() {
                    self.dial_peer(PeerId::new(), std::net::SocketAddr::new(ip, *port), None, *secure);
                } else {
                    warn!("malformed $ConnectToMe address: {address:?}");
                }
                return;
            }
            Message::Nmdc(NmdcMessage::RevConnectToMe { from_nick, .. }) => {
                // Only the active side can answer a `$RevConnectToMe` with a
                // `$ConnectToMe` of its own; a passive recipient has no
                // listen address to offer, and the exchange dies here.
                if !self.config.is_passive {
                    let token = format!("{:08x}", fastrand::u64(..));
                    let peer_supports_encryption = self.hub.roster.get(from_nick).map(|p| p.supports_encryption()).unwrap_or(false);
                    let encrypted = match peerconn::negotiate_encryption(self.config.peer_encryption_mode, peer_supports_encryption) {
                        Ok(encrypted) => encrypted,
                        Err(err) => {
                            warn!("cannot answer $RevConnectToMe from {from_nick}: {err}");
                            return;
                        }
                    };
                    if let Some(reply) = peerconn::build_connect_request(
                        Dialect::Nmdc,
                        false,
                        true,
                        None,
                        self.config.tcp_port,
                        self.config.tcp_tls_port,
                        encrypted,
                        from_nick,
                        &token,
                    ) {
                        // NMDC has no token mechanism; nothing for an inbound CINF to echo.
                        self.peers.expect(from_nick.clone(), Purpose::Serve, None);
                        self.outbox.write(HUB_CONN, reply);
                    }
                } else {
                    debug!("both sides passive; ignoring $RevConnectToMe from {from_nick}");
                }
                return;
            }
            Message::Adc(AdcMessage::DirectConnectToMe { author, port, protocol, token, .. }) => {
                let target = self.hub.roster.values().find(|p| p.adc.as_ref().map(|a| a.sid) == Some(*author)).cloned();
                if let Some(peer) = target {
                    if let Some(ip) = peer.ip {
                        let encrypted = protocol.starts_with("ADCS");
                        self.dial_peer(peer.nick.clone(), std::net::SocketAddr::new(ip, *port), Some(token.clone()), encrypted);
                    } else {
                        warn!("DCTM from {} with no known IP", peer.nick);
                    }
                }
                return;
            }
            _ => {}
        }
        if let Err(err) = self.hub.handle_message(&self.config, msg, self.now, &mut self.outbox) {
            warn!("hub protocol error: {err}");
            self.outbox.event(Event::Error(err.clone()));
            self.outbox.disconnect(HUB_CONN, Disconnect::StateMachine(DisconnectReason::Hub(err.to_string())));
        }
    }

    fn handle_peer_message(&mut self, conn: ConnId, msg: Message) {
        if self.peers.is_ready(conn) {
            self.dispatch_transfer_message(conn, msg);
            return;
        }
        match self.peers.handle_message(&self.config, conn, msg, &mut self.outbox) {
            Ok(Some(purpose)) => {
                if let Some(peer) = self.peers.peer_for(conn).cloned() {
                    self.transfers.on_peer_ready(conn, peer, self.hub.dialect, purpose, &mut self.outbox);
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!("peer connection {conn} protocol error: {err}");
                self.outbox.event(Event::Error(err.clone()));
                self.outbox.disconnect(conn, Disconnect::StateMachine(DisconnectReason::Peer(err.to_string())));
            }
        }
    }

    fn dispatch_transfer_message(&mut self, conn: ConnId, msg: Message) {
        let peer = self.peers.peer_for(conn).cloned().unwrap_or_default();
        match msg {
            Message::Nmdc(NmdcMessage::AdcSnd { length, .. }) | Message::Adc(AdcMessage::ClientSend { length, .. }) => {
                self.transfers.on_send_announced(conn, length);
                self.outbox.set_framing(conn, true);
            }
            Message::Nmdc(NmdcMessage::AdcGet { kind, path, start, length }) | Message::Adc(AdcMessage::ClientGet { kind, path, start, length }) => {
                // We're the uploader here: we announce and write the binary
                // payload out, but our own read side stays in line mode since
                // the peer may send further protocol commands, not bytes.
                let free_slots = self.config.upload_max_parallel;
                self.transfers.serve_get(conn, peer, self.hub.dialect, &kind, &path, start, length, self.share.as_ref(), free_slots, &mut self.outbox);
            }
            _ => {}
        }
    }

    /// The reactor received a raw binary chunk on `conn`.
    pub fn binary_chunk_received(&mut self, conn: ConnId, chunk: &[u8]) {
        if self.transfers.on_binary_chunk(conn, chunk, &mut self.outbox) {
            self.outbox.set_framing(conn, false);
            self.transfers.on_transfer_complete(conn, &mut self.outbox);
        }
    }
}
