//! A remote user known to the hub, and protocol-specific identifiers.

use std::net::IpAddr;

/// A peer is identified, within a hub session, by its nickname.
pub type PeerId = String;

/// Whether a connection was dialed by us or accepted from the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// We dialed out to the peer.
    Outbound,
    /// The peer dialed in to us.
    Inbound,
}

/// A 4-character uppercase alphanumeric ADC session id, assigned by the hub
/// for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sid(pub [u8; 4]);

impl Sid {
    /// Parse a session id from its 4-character wire form.
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
        {
            return None;
        }
        let mut out = [0u8; 4];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }
}

impl std::fmt::Display for Sid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", std::str::from_utf8(&self.0).unwrap_or("????"))
    }
}

/// A stable, per-user base32 client id, derived from a private id via Tiger hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cid(pub String);

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A remote user known to the hub.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Nickname, unique within the hub.
    pub nick: String,
    /// Free-text description, if the peer advertises one.
    pub description: String,
    /// Contact email, if the peer advertises one.
    pub email: String,
    /// Whether the hub flagged this peer as a bot.
    pub is_bot: bool,
    /// Whether the hub flagged this peer as an operator.
    pub is_operator: bool,
    /// Client software name, e.g. `++`/`ADC`.
    pub client: String,
    /// Client software version.
    pub version: String,
    /// Total bytes shared by the peer, as last advertised.
    pub share_size: u64,
    /// Whether the peer is in passive mode (can't accept incoming connections).
    pub is_passive: bool,
    /// The peer's IP, if disclosed by the peer or the hub.
    pub ip: Option<IpAddr>,

    /// ADC-specific identifiers; `None` on an NMDC hub.
    pub adc: Option<AdcPeerInfo>,
    /// NMDC-specific identifiers; `None` on an ADC hub.
    pub nmdc: Option<NmdcPeerInfo>,
}

impl Peer {
    /// Whether this peer advertises support for encrypting peer connections.
    pub fn supports_encryption(&self) -> bool {
        if let Some(adc) = &self.adc {
            return adc.fingerprint.is_some() || adc.features.iter().any(|f| f == "ADCS");
        }
        if let Some(nmdc) = &self.nmdc {
            // Bit 4 (0x10) of the NMDC user-flag byte signals TLS download support.
            return nmdc.flags & 0x10 != 0;
        }
        false
    }
}

/// ADC-specific peer identifiers.
#[derive(Debug, Clone)]
pub struct AdcPeerInfo {
    /// Hub-assigned session id.
    pub sid: Sid,
    /// Stable client id.
    pub cid: Cid,
    /// TLS certificate fingerprint, if advertised via the `KP` field.
    pub fingerprint: Option<String>,
    /// Supported extension feature tokens, e.g. `ADCS`, `TCP4`.
    pub features: Vec<String>,
    /// UDP port for passive search results.
    pub udp_port: Option<u16>,
}

/// NMDC-specific peer identifiers.
#[derive(Debug, Clone)]
pub struct NmdcPeerInfo {
    /// Connection type string, e.g. `LAN(T1)`.
    pub connection: String,
    /// Raw NMDC user-flag byte.
    pub flags: u8,
}
