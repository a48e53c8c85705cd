//! Peer connection handshake and direction negotiation (component D).
//!
//! A peer connection is either dialed by us (after sending `$ConnectToMe`/
//! `DCTM`) or accepted from the remote side (after receiving one). Either
//! way, once the transport handshake completes both sides exchange a short
//! preamble before the connection is handed off to the transfer engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use tigerhub_common::config::{ClientConfig, PeerEncryptionMode};
use tigerhub_common::peer::{Link, PeerId, Sid};
use tigerhub_net::ConnId;
use tigerhub_proto::adc::AdcMessage;
use tigerhub_proto::message::Dialect;
use tigerhub_proto::nmdc::{Direction, NmdcMessage};
use tigerhub_proto::Message;

use crate::error::{DisconnectReason, Error};
use crate::event::Event;
use crate::outbox::Outbox;

type EngineOutbox = Outbox<Message, Event, DisconnectReason>;

/// Allocates odd connection ids for outbound peer dials. Even ids (`>= 2`)
/// come from `tigerhub-net-threaded`'s inbound accept loop; `0` is the hub.
pub struct OutboundIds {
    next: AtomicU64,
}

impl OutboundIds {
    /// A fresh allocator, starting at connection id `1`.
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    /// Allocate the next odd connection id.
    pub fn allocate(&self) -> ConnId {
        self.next.fetch_add(2, Ordering::SeqCst)
    }
}

impl Default for OutboundIds {
    fn default() -> Self {
        Self::new()
    }
}

/// What a peer connection is waiting to do once its handshake completes.
#[derive(Debug, Clone)]
pub enum Purpose {
    /// Fetch the peer's compressed file list.
    FileList,
    /// Fetch a specific file, identified by its virtual path.
    Download(String),
    /// Serve whatever the remote side requests (an inbound connection with
    /// no outstanding download of our own).
    Serve,
}

/// One peer connection's handshake progress.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HandshakeState {
    AwaitingMyNickOrSupports,
    AwaitingLock,
    AwaitingDirection,
    AwaitingKey,
    AwaitingCSup,
    AwaitingCInf,
    Ready,
}

/// A peer connection tracked by [`PeerConnections`].
pub struct PeerConn {
    pub peer: PeerId,
    pub link: Link,
    pub purpose: Purpose,
    pub dialect: Dialect,
    state: HandshakeState,
    my_direction_number: u32,
    remote_nick: Option<String>,
    lock: Option<String>,
    encrypted: bool,
    /// Token (ADC `TO`) we generated ourselves and expect the peer's own
    /// `CINF` to echo back, when we're the side that sent the `DCTM`/`DRCM`.
    expected_token: Option<String>,
    /// Token we must echo back in our own `CINF`'s `TO` field, when we're
    /// dialing out in response to a hub-relayed `DCTM` addressed to us.
    echo_token: Option<String>,
    /// The `TO` field actually received on the peer's `CINF`, stashed until
    /// the handshake resolves far enough to validate it against `expected_token`.
    remote_token: Option<String>,
    /// SHA-256 fingerprint of the peer's TLS certificate, observed by the
    /// transport at connect time. Only ever populated on the dialing side
    /// (our own client TLS config never presents a certificate, so an
    /// inbound accept has nothing to capture).
    observed_fingerprint: Option<String>,
}

/// Tracks every live peer connection and the handshake each one is in.
#[derive(Default)]
pub struct PeerConnections {
    conns: HashMap<ConnId, PeerConn>,
    /// Pending `ConnectToMe`/`DCTM` requests we issued, keyed by peer, so an
    /// inbound accept can be matched back to the `purpose` it was opened
    /// for, and (ADC only) the token we expect that peer's `CINF` to echo.
    pending: HashMap<PeerId, (Purpose, Option<String>)>,
}

impl PeerConnections {
    /// An empty connection table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that we're expecting a connection from `peer` for `purpose`,
    /// before the `ConnectToMe`/`DCTM` request has even been sent.
    /// `expected_token` is the ADC token the peer's own `CINF` must echo
    /// back (`None` for NMDC, which has no such mechanism).
    pub fn expect(&mut self, peer: PeerId, purpose: Purpose, expected_token: Option<String>) {
        self.pending.insert(peer, (purpose, expected_token));
    }

    /// A transport-level connection came up (outbound dial succeeded, or an
    /// inbound accept completed). `peer` is known for outbound dials; for
    /// inbound accepts it's resolved once the remote side identifies itself.
    /// `echo_token` is the token we must send back in our own `CINF`, when
    /// this dial was made in response to a hub-relayed `DCTM` addressed to
    /// us. `tls_fingerprint` is the certificate fingerprint the transport
    /// observed during the TLS handshake, if any.
    pub fn on_connected(
        &mut self,
        conn: ConnId,
        link: Link,
        dialect: Dialect,
        peer: Option<PeerId>,
        echo_token: Option<String>,
        tls_fingerprint: Option<String>,
    ) {
        let (purpose, expected_token) = peer
            .as_ref()
            .and_then(|p| self.pending.remove(p))
            .unwrap_or((Purpose::Serve, None));
        let state = match (link, dialect) {
            (Link::Outbound, Dialect::Nmdc) => HandshakeState::AwaitingLock,
            (Link::Inbound, Dialect::Nmdc) => HandshakeState::AwaitingMyNickOrSupports,
            (_, Dialect::Adc) => HandshakeState::AwaitingCSup,
        };
        self.conns.insert(
            conn,
            PeerConn {
                peer: peer.unwrap_or_default(),
                link,
                purpose,
                dialect,
                state,
                my_direction_number: fastrand::u32(1..=0x7fff_ffff),
                remote_nick: None,
                lock: None,
                encrypted: false,
                expected_token,
                echo_token,
                remote_token: None,
                observed_fingerprint: tls_fingerprint,
            },
        );
    }

    /// A peer connection closed; drop its state.
    pub fn on_disconnected(&mut self, conn: ConnId) -> Option<PeerConn> {
        self.conns.remove(&conn)
    }

    /// Look up a connection's negotiated peer nick, once known.
    pub fn peer_for(&self, conn: ConnId) -> Option<&PeerId> {
        self.conns.get(&conn).map(|c| &c.peer)
    }

    /// Whether `conn` has completed its handshake and is ready for transfer traffic.
    pub fn is_ready(&self, conn: ConnId) -> bool {
        matches!(self.conns.get(&conn), Some(c) if c.state == HandshakeState::Ready)
    }

    /// Dispatch one decoded message on a peer connection. Returns `Some(purpose)`
    /// once the handshake completes and the transfer engine should take over.
    pub fn handle_message(
        &mut self,
        config: &ClientConfig,
        conn: ConnId,
        msg: Message,
        outbox: &mut EngineOutbox,
    ) -> Result<Option<Purpose>, Error> {
        let Some(pc) = self.conns.get_mut(&conn) else {
            return Err(Error::ProtocolViolation { conn, reason: "message on unknown peer connection".into() });
        };
        let result = match msg {
            Message::Nmdc(msg) => handle_nmdc(pc, config, conn, msg, outbox),
            Message::Adc(msg) => handle_adc(pc, config, conn, msg, outbox),
        };
        // A connection whose peer wasn't known up front (an inbound accept,
        // or an outbound dial made in response to a hub-relayed `$ConnectToMe`
        // whose sender isn't named in the message itself) starts out as
        // `Purpose::Serve`. Once the handshake reveals the remote nick,
        // resolve it against anything we were expecting from them.
        if matches!(pc.purpose, Purpose::Serve) && !pc.peer.is_empty() {
            if let Some((purpose, expected_token)) = self.pending.remove(&pc.peer) {
                pc.purpose = purpose;
                pc.expected_token = expected_token;
            }
        }
        // `handle_nmdc`/`handle_adc` read `pc.purpose` before the resolution
        // above could have corrected it away from `Serve`, so the `Some`
        // they return may carry the stale value; re-read it now that it's final.
        let result = result.map(|resolved| resolved.map(|_| pc.purpose.clone()));
        // Only checkable once the handshake has actually completed: for an
        // inbound accept, `expected_token` above is resolved from the very
        // `CINF` that also carries `remote_token`, so this can't run any
        // earlier than here.
        if matches!(result, Ok(Some(_))) && pc.dialect == Dialect::Adc {
            if let Some(expected) = &pc.expected_token {
                if pc.remote_token.as_deref() != Some(expected.as_str()) {
                    return Err(Error::ProtocolViolation {
                        conn,
                        reason: "CINF token does not match the DCTM/DRCM we sent".into(),
                    });
                }
            }
        }
        result
    }
}

fn handle_nmdc(
    pc: &mut PeerConn,
    config: &ClientConfig,
    conn: ConnId,
    msg: NmdcMessage,
    outbox: &mut EngineOutbox,
) -> Result<Option<Purpose>, Error> {
    match msg {
        // Both sides send `$MyNick`, but only whoever was waiting on it
        // (the accepting side, or an outbound dial that didn't already know
        // who it was dialing) replies with its own handshake kickoff.
        NmdcMessage::MyNick { nick } => {
            pc.remote_nick = Some(nick.clone());
            pc.peer = nick;
            if pc.state == HandshakeState::AwaitingMyNickOrSupports {
                outbox.write(conn, Message::Nmdc(NmdcMessage::MyNick { nick: config.nick.clone() }));
                let lock = format!("EXTENDEDPROTOCOL_{:08x}", fastrand::u64(..));
                pc.lock = Some(lock.clone());
                outbox.write(conn, Message::Nmdc(NmdcMessage::Lock { lock, pk: "tigerhub".into() }));
                outbox.write(conn, Message::Nmdc(NmdcMessage::Supports { features: vec!["MiniSlots".into(), "XmlBZList".into(), "ADCGet".into(), "TTHF".into()] }));
                pc.state = HandshakeState::AwaitingLock;
            }
            Ok(None)
        }
        NmdcMessage::Lock { lock, .. } => {
            let key = crate::hub::compute_nmdc_key(&lock);
            outbox.write(conn, Message::Nmdc(NmdcMessage::Key { key }));
            if pc.link == Link::Outbound {
                outbox.write(conn, Message::Nmdc(NmdcMessage::MyNick { nick: config.nick.clone() }));
                outbox.write(conn, Message::Nmdc(NmdcMessage::Supports { features: vec!["MiniSlots".into(), "XmlBZList".into(), "ADCGet".into(), "TTHF".into()] }));
            }
            let direction = match pc.purpose {
                Purpose::Serve => Direction::Upload,
                _ => Direction::Download,
            };
            outbox.write(conn, Message::Nmdc(NmdcMessage::Direction { direction, number: pc.my_direction_number }));
            pc.state = HandshakeState::AwaitingDirection;
            Ok(None)
        }
        NmdcMessage::Direction { direction, number } => {
            let we_upload = match (direction, pc.my_direction_number.cmp(&number)) {
                (Direction::Download, _) => true,
                (Direction::Upload, std::cmp::Ordering::Greater) => true,
                _ => false,
            };
            debug!("peer {} direction negotiated, we_upload={we_upload}", pc.peer);
            pc.state = HandshakeState::Ready;
            Ok(Some(pc.purpose.clone()))
        }
        NmdcMessage::Supports { .. } => Ok(None),
        NmdcMessage::Error { message } => Err(Error::ProtocolViolation { conn, reason: message }),
        _ => Ok(None),
    }
}

fn handle_adc(
    pc: &mut PeerConn,
    config: &ClientConfig,
    conn: ConnId,
    msg: AdcMessage,
    outbox: &mut EngineOutbox,
) -> Result<Option<Purpose>, Error> {
    match msg {
        AdcMessage::ClientSupports(_) if pc.state == HandshakeState::AwaitingCSup => {
            outbox.write(conn, Message::Adc(AdcMessage::ClientSupports(vec!["BASE".into(), "TIGR".into()])));
            let mut fields = tigerhub_proto::adc::AdcInfoFields {
                nick: Some(config.nick.clone()),
                ..Default::default()
            };
            if let Some(token) = pc.echo_token.clone() {
                fields.extra.insert("TO".into(), token);
            }
            outbox.write(conn, Message::Adc(AdcMessage::ClientInfo { fields }));
            pc.state = HandshakeState::AwaitingCInf;
            Ok(None)
        }
        AdcMessage::ClientInfo { fields } => {
            if let Some(nick) = fields.nick.clone() {
                pc.peer = nick;
            }
            if let Some(token) = fields.extra.get("TO").cloned() {
                pc.remote_token = Some(token);
            }
            if let Some(fp) = fields.fingerprint.clone() {
                if let Some(observed) = &pc.observed_fingerprint {
                    if observed != &fp {
                        return Err(Error::ProtocolViolation {
                            conn,
                            reason: format!("CINF fingerprint {fp} does not match the certificate observed at connect time"),
                        });
                    }
                }
                pc.encrypted = true;
            }
            pc.state = HandshakeState::Ready;
            Ok(Some(pc.purpose.clone()))
        }
        _ => Ok(None),
    }
}

/// Decide whether a peer connection to `peer` should use TLS, per the
/// client's [`PeerEncryptionMode`] and what the peer advertises.
pub fn negotiate_encryption(mode: PeerEncryptionMode, peer_supports_encryption: bool) -> Result<bool, Error> {
    match mode {
        PeerEncryptionMode::DisableEncryption => Ok(false),
        PeerEncryptionMode::PreferEncryption => Ok(peer_supports_encryption),
        PeerEncryptionMode::ForceEncryption => {
            if peer_supports_encryption {
                Ok(true)
            } else {
                Err(Error::PeerUnavailable("peer does not support encryption".into()))
            }
        }
    }
}

/// Build the `$ConnectToMe`/`RevConnectToMe` (or `DCTM`/`DRCM`) request to
/// initiate a peer connection, given both sides' passive/active status.
///
/// `encrypted` (typically the result of [`negotiate_encryption`]) only
/// matters when we're the active side offering a port to dial: it picks
/// `our_tls_port` over `our_port` and requests the `ADCS`/secure variant.
/// A `RevConnectToMe`/`DRCM` carries no port of our own to choose between,
/// so `encrypted` is ignored for that branch — the peer decides when it
/// answers with its own `ConnectToMe`/`DCTM`.
///
/// Returns `None` when both sides are passive — logged by the caller, not
/// fatal, since other searches/peers may still be reachable.
pub fn build_connect_request(
    dialect: Dialect,
    we_are_passive: bool,
    peer_is_passive: bool,
    our_sid: Option<Sid>,
    our_port: u16,
    our_tls_port: u16,
    encrypted: bool,
    peer_nick_or_sid: &str,
    token: &str,
) -> Option<Message> {
    match (we_are_passive, peer_is_passive) {
        (true, true) => None,
        (false, _) => match dialect {
            Dialect::Nmdc => Some(Message::Nmdc(NmdcMessage::ConnectToMe {
                target_nick: peer_nick_or_sid.to_string(),
                address: String::new(),
                port: if encrypted { our_tls_port } else { our_port },
                secure: encrypted,
            })),
            Dialect::Adc => our_sid.map(|sid| {
                Message::Adc(AdcMessage::DirectConnectToMe {
                    author: sid,
                    target: Sid::parse(peer_nick_or_sid).unwrap_or(sid),
                    protocol: if encrypted { "ADCS/0.10" } else { "ADC/1.0" }.into(),
                    port: if encrypted { our_tls_port } else { our_port },
                    token: token.into(),
                })
            }),
        },
        (true, false) => match dialect {
            Dialect::Nmdc => Some(Message::Nmdc(NmdcMessage::RevConnectToMe {
                from_nick: String::new(),
                to_nick: peer_nick_or_sid.to_string(),
            })),
            Dialect::Adc => our_sid.map(|sid| {
                Message::Adc(AdcMessage::DirectRevConnectToMe {
                    author: sid,
                    target: Sid::parse(peer_nick_or_sid).unwrap_or(sid),
                    protocol: "ADC/1.0".into(),
                    token: token.into(),
                })
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_passive_yields_no_request() {
        assert!(build_connect_request(Dialect::Nmdc, true, true, None, 0, 0, false, "bob", "t").is_none());
    }

    #[test]
    fn active_requester_sends_connect_to_me() {
        let msg = build_connect_request(Dialect::Nmdc, false, true, None, 412, 0, false, "bob", "t").unwrap();
        assert!(matches!(msg, Message::Nmdc(NmdcMessage::ConnectToMe { port: 412, secure: false, .. })));
    }

    #[test]
    fn active_requester_prefers_the_tls_port_when_encrypted() {
        let msg = build_connect_request(Dialect::Nmdc, false, true, None, 412, 413, true, "bob", "t").unwrap();
        assert!(matches!(msg, Message::Nmdc(NmdcMessage::ConnectToMe { port: 413, secure: true, .. })));
    }

    #[test]
    fn adc_active_requester_uses_the_secure_protocol_string_when_encrypted() {
        let sid = Sid::parse("AAAA").unwrap();
        let msg = build_connect_request(Dialect::Adc, false, true, Some(sid), 412, 413, true, "AAAB", "t").unwrap();
        assert!(matches!(msg, Message::Adc(AdcMessage::DirectConnectToMe { port: 413, protocol, .. }) if protocol == "ADCS/0.10"));
    }

    #[test]
    fn outbound_ids_are_odd_and_increasing() {
        let ids = OutboundIds::new();
        let a = ids.allocate();
        let b = ids.allocate();
        assert_eq!(a % 2, 1);
        assert_eq!(b, a + 2);
    }
}
