//! Hub session state machine (component C): login handshake, peer roster,
//! search dispatch, keepalives.

use std::collections::HashMap;

use log::{debug, info, warn};

use tigerhub_common::config::{ClientConfig, HubScheme};
use tigerhub_common::peer::{AdcPeerInfo, NmdcPeerInfo, Peer, PeerId, Sid};
use tigerhub_common::time::{LocalDuration, LocalTime};
use tigerhub_common::tth::tiger_hash;
use tigerhub_net::{ConnId, Disconnect};
use tigerhub_proto::adc::AdcMessage;
use tigerhub_proto::nmdc::{Direction, NmdcMessage, NmdcUserInfo};
use tigerhub_proto::message::Dialect;
use tigerhub_proto::Message;

use crate::error::{DisconnectReason, Error};
use crate::event::Event;
use crate::outbox::Outbox;

/// The hub connection always lives under this id; a client only ever has
/// one hub session (see the Non-goals in the system overview).
pub const HUB_CONN: ConnId = 0;

/// Hub send idle before an NMDC keepalive (`|`) is sent.
pub const KEEPALIVE_IDLE: LocalDuration = LocalDuration::from_secs(30);

type EngineOutbox = Outbox<Message, Event, DisconnectReason>;

/// Where the hub session is in its login sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    /// TCP/TLS dial not yet complete.
    Connecting,
    /// Waiting for the hub's protocol announcement (`$Lock`/`ISUP`+`ISID`).
    Initial,
    /// Waiting for a password challenge response to be accepted.
    Authenticating,
    /// Logged in; roster and search traffic is live.
    LoggedIn,
    /// Session ended.
    Disconnected,
}

/// The hub session: login handshake plus the peer roster it maintains once
/// logged in.
pub struct HubSession {
    pub state: HubState,
    pub dialect: Dialect,
    pub roster: HashMap<PeerId, Peer>,
    pending_nmdc_lock: Option<String>,
    pending_adc_sid: Option<Sid>,
    queued_user_ip: HashMap<PeerId, std::net::IpAddr>,
    last_send_activity: LocalTime,
}

impl HubSession {
    /// Build a new, not-yet-connected hub session for `config`.
    pub fn new(config: &ClientConfig, now: LocalTime) -> Self {
        let dialect = match config.hub_url.scheme {
            HubScheme::Nmdc | HubScheme::NmdcSecure => Dialect::Nmdc,
            HubScheme::Adc | HubScheme::AdcSecure => Dialect::Adc,
        };
        Self {
            state: HubState::Connecting,
            dialect,
            roster: HashMap::new(),
            pending_nmdc_lock: None,
            pending_adc_sid: None,
            queued_user_ip: HashMap::new(),
            last_send_activity: now,
        }
    }

    /// The hub's transport handshake completed; wait for its announcement.
    pub fn on_connected(&mut self, now: LocalTime) {
        self.state = HubState::Initial;
        self.last_send_activity = now;
        debug!("hub connection established, awaiting protocol announcement");
    }

    /// The hub connection closed.
    pub fn on_disconnected(&mut self, reason: &Disconnect<DisconnectReason>, outbox: &mut EngineOutbox) {
        self.state = HubState::Disconnected;
        let peers: Vec<PeerId> = self.roster.keys().cloned().collect();
        self.roster.clear();
        for peer in peers {
            outbox.event(Event::PeerDisconnected(peer));
        }
        outbox.event(Event::HubDisconnected(reason.to_string()));
    }

    /// Dispatch one decoded message from the hub connection.
    pub fn handle_message(
        &mut self,
        config: &ClientConfig,
        msg: Message,
        now: LocalTime,
        outbox: &mut EngineOutbox,
    ) -> Result<(), Error> {
        match msg {
            Message::Nmdc(msg) => self.handle_nmdc(config, msg, now, outbox),
            Message::Adc(msg) => self.handle_adc(config, msg, now, outbox),
        }
    }

    /// Called on every event-loop tick; sends the NMDC keepalive if idle.
    pub fn tick(&mut self, now: LocalTime, outbox: &mut EngineOutbox) {
        if self.state != HubState::LoggedIn || self.dialect != Dialect::Nmdc {
            return;
        }
        if now.duration_since(self.last_send_activity) >= KEEPALIVE_IDLE {
            outbox.write(HUB_CONN, Message::Nmdc(NmdcMessage::Chat { nick: None, text: String::new() }));
            self.last_send_activity = now;
        }
    }

    fn send(&mut self, outbox: &mut EngineOutbox, now: LocalTime, msg: Message) {
        outbox.write(HUB_CONN, msg);
        self.last_send_activity = now;
    }

    fn handle_nmdc(
        &mut self,
        config: &ClientConfig,
        msg: NmdcMessage,
        now: LocalTime,
        outbox: &mut EngineOutbox,
    ) -> Result<(), Error> {
        match msg {
            NmdcMessage::Lock { lock, .. } if self.state == HubState::Initial => {
                let key = compute_nmdc_key(&lock);
                self.send(outbox, now, Message::Nmdc(NmdcMessage::Key { key }));
                self.send(
                    outbox,
                    now,
                    Message::Nmdc(NmdcMessage::Supports { features: vec!["NoGetINFO".into(), "NoHello".into()] }),
                );
                self.send(outbox, now, Message::Nmdc(NmdcMessage::ValidateNick { nick: config.nick.clone() }));
                self.send(outbox, now, Message::Nmdc(NmdcMessage::Version { version: "1,0091".into() }));
                self.pending_nmdc_lock = Some(lock);
                Ok(())
            }
            NmdcMessage::GetPass => {
                self.state = HubState::Authenticating;
                let password = config.password.clone().unwrap_or_default();
                self.send(outbox, now, Message::Nmdc(NmdcMessage::MyPass { password }));
                Ok(())
            }
            NmdcMessage::Error { message } if self.state == HubState::Authenticating => {
                Err(Error::AuthRejected(message))
            }
            NmdcMessage::Hello { nick } if nick == config.nick => {
                self.state = HubState::LoggedIn;
                self.send(outbox, now, Message::Nmdc(NmdcMessage::Version { version: "1,0091".into() }));
                self.send(outbox, now, Message::Nmdc(NmdcMessage::GetNickList));
                self.send(outbox, now, Message::Nmdc(my_info(config)));
                outbox.event(Event::HubConnected);
                info!("logged in to NMDC hub as {nick}");
                Ok(())
            }
            NmdcMessage::MyInfo(info) => {
                self.upsert_nmdc_peer(info, outbox);
                Ok(())
            }
            NmdcMessage::Quit { nick } => {
                self.remove_peer(&nick, outbox);
                Ok(())
            }
            NmdcMessage::UserIp { pairs } => {
                for (nick, ip) in pairs {
                    if let Ok(ip) = ip.parse() {
                        if let Some(peer) = self.roster.get_mut(&nick) {
                            peer.ip = Some(ip);
                        } else {
                            self.queued_user_ip.insert(nick, ip);
                        }
                    }
                }
                Ok(())
            }
            NmdcMessage::Error { message } => {
                warn!("hub error: {message}");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn handle_adc(
        &mut self,
        config: &ClientConfig,
        msg: AdcMessage,
        now: LocalTime,
        outbox: &mut EngineOutbox,
    ) -> Result<(), Error> {
        match msg {
            AdcMessage::InfoSupports(_) if self.state == HubState::Initial => {
                self.send(outbox, now, Message::Adc(AdcMessage::HubSupports(vec!["BASE".into(), "TIGR".into()])));
                Ok(())
            }
            AdcMessage::InfoSid(sid) => {
                if self.pending_adc_sid.is_some() {
                    return Err(Error::ProtocolViolation {
                        conn: HUB_CONN,
                        reason: "hub assigned a duplicate session id".into(),
                    });
                }
                self.pending_adc_sid = Some(sid);
                self.send(outbox, now, Message::Adc(AdcMessage::BroadcastInfo { author: sid, fields: my_adc_info(config) }));
                Ok(())
            }
            AdcMessage::InfoGetPass { salt } => {
                self.state = HubState::Authenticating;
                let password = config.password.clone().unwrap_or_default();
                let salt_bytes = tigerhub_common::base32::decode(&salt).unwrap_or_default();
                let mut data = salt_bytes;
                data.extend_from_slice(password.as_bytes());
                let hash = tigerhub_common::base32::encode(&tiger_hash(&data));
                self.send(outbox, now, Message::Adc(AdcMessage::HubPass { hash }));
                Ok(())
            }
            AdcMessage::BroadcastInfo { author, fields } => {
                if self.pending_adc_sid == Some(author) && self.state != HubState::LoggedIn {
                    self.state = HubState::LoggedIn;
                    outbox.event(Event::HubConnected);
                    info!("logged in to ADC hub");
                }
                self.upsert_adc_peer(author, fields, outbox);
                Ok(())
            }
            AdcMessage::InfoQuit { sid, .. } => {
                if let Some((nick, _)) = self
                    .roster
                    .iter()
                    .find(|(_, p)| p.adc.as_ref().map(|a| a.sid) == Some(sid))
                {
                    let nick = nick.clone();
                    self.remove_peer(&nick, outbox);
                }
                Ok(())
            }
            AdcMessage::Status { severity, message, .. } if severity >= 2 && self.state == HubState::Authenticating => {
                Err(Error::AuthRejected(message))
            }
            _ => Ok(()),
        }
    }

    fn upsert_nmdc_peer(&mut self, info: NmdcUserInfo, outbox: &mut EngineOutbox) {
        let is_update = self.roster.contains_key(&info.nick);
        let ip = self.queued_user_ip.remove(&info.nick);
        let peer = self.roster.entry(info.nick.clone()).or_insert_with(|| Peer {
            nick: info.nick.clone(),
            description: String::new(),
            email: String::new(),
            is_bot: false,
            is_operator: false,
            client: String::new(),
            version: String::new(),
            share_size: 0,
            is_passive: false,
            ip,
            adc: None,
            nmdc: None,
        });
        peer.description = info.description;
        peer.share_size = info.share_size;
        peer.is_passive = info.flag & 0x01 == 0;
        peer.nmdc = Some(NmdcPeerInfo { connection: info.connection, flags: info.flag });
        let event_peer = peer.clone();
        if is_update {
            outbox.event(Event::PeerUpdated(event_peer));
        } else {
            outbox.event(Event::PeerConnected(event_peer));
        }
    }

    fn upsert_adc_peer(&mut self, sid: Sid, fields: tigerhub_proto::adc::AdcInfoFields, outbox: &mut EngineOutbox) {
        let Some(nick) = fields.nick.clone() else { return };
        let is_update = self.roster.contains_key(&nick);
        let peer = self.roster.entry(nick.clone()).or_insert_with(|| Peer {
            nick: nick.clone(),
            description: String::new(),
            email: String::new(),
            is_bot: false,
            is_operator: false,
            client: String::new(),
            version: String::new(),
            share_size: 0,
            is_passive: false,
            ip: fields.ip4.as_ref().and_then(|ip| ip.parse().ok()),
            adc: None,
            nmdc: None,
        });
        peer.description = fields.description.clone().unwrap_or_default();
        peer.share_size = fields.share_size.unwrap_or(0);
        peer.is_passive = !fields.supports.iter().any(|f| f == "TCP4" || f == "TCP6");
        peer.adc = Some(AdcPeerInfo {
            sid,
            cid: tigerhub_common::peer::Cid(fields.client_id.clone().unwrap_or_default()),
            fingerprint: fields.fingerprint.clone(),
            features: fields.supports.clone(),
            udp_port: fields.udp4,
        });
        let event_peer = peer.clone();
        if is_update {
            outbox.event(Event::PeerUpdated(event_peer));
        } else {
            outbox.event(Event::PeerConnected(event_peer));
        }
    }

    fn remove_peer(&mut self, nick: &str, outbox: &mut EngineOutbox) {
        if self.roster.remove(nick).is_some() {
            outbox.event(Event::PeerDisconnected(nick.to_string()));
        }
    }
}

fn my_info(config: &ClientConfig) -> NmdcMessage {
    NmdcMessage::MyInfo(NmdcUserInfo {
        nick: config.nick.clone(),
        description: String::new(),
        client_tag: "<tigerhub V:0.1.0,M:A,H:1/0/0,S:1>".into(),
        connection: "LAN(T1)".into(),
        flag: if config.is_passive { 0x00 } else { 0x01 },
        email: String::new(),
        share_size: 0,
    })
}

fn my_adc_info(config: &ClientConfig) -> tigerhub_proto::adc::AdcInfoFields {
    tigerhub_proto::adc::AdcInfoFields {
        nick: Some(config.nick.clone()),
        description: Some(String::new()),
        share_size: Some(0),
        share_count: Some(0),
        supports: if config.is_passive { vec![] } else { vec!["TCP4".into()] },
        slots: Some(config.upload_max_parallel as u32),
        ..Default::default()
    }
}

/// The classic NMDC lock-to-key transform: XOR each byte with its
/// predecessor, rotate each nibble, then substitute the six bytes NMDC
/// can't carry raw (`0`, `5`, `36`, `96`, `124`, `126`) with `/%DCN0NN%/`
/// escapes.
pub fn compute_nmdc_key(lock: &str) -> String {
    let lock = lock.as_bytes();
    let n = lock.len();
    if n < 2 {
        return String::new();
    }
    let mut key = vec![0u8; n];
    key[0] = lock[0] ^ lock[n - 1] ^ lock[n - 2] ^ 5;
    for i in 1..n {
        key[i] = lock[i] ^ lock[i - 1];
    }
    for b in key.iter_mut() {
        *b = (*b << 4) | (*b >> 4);
    }
    let mut out = String::new();
    for b in key {
        match b {
            0 | 5 | 36 | 96 | 124 | 126 => out.push_str(&format!("/%DCN{b:03}%/")),
            _ => out.push(b as char),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_to_key_escapes_reserved_bytes() {
        // A lock chosen so the transform yields at least one reserved byte.
        let key = compute_nmdc_key("EXTENDEDPROTOCOL_tigerhubABCDEF");
        assert!(!key.is_empty());
        assert!(key.is_ascii());
    }
}
