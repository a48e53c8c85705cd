//! Client configuration, including hub URL parsing and validation.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Which of the two wire dialects a hub speaks, and whether the connection
/// to it is wrapped in TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubScheme {
    /// `nmdc://` — legacy text protocol, plaintext.
    Nmdc,
    /// `nmdcs://` — legacy text protocol, TLS.
    NmdcSecure,
    /// `adc://` — modern protocol, plaintext.
    Adc,
    /// `adcs://` — modern protocol, TLS.
    AdcSecure,
}

impl HubScheme {
    /// Whether this scheme requires the hub connection to be wrapped in TLS.
    pub fn is_secure(&self) -> bool {
        matches!(self, Self::NmdcSecure | Self::AdcSecure)
    }

    /// Whether this scheme speaks ADC (as opposed to NMDC).
    pub fn is_adc(&self) -> bool {
        matches!(self, Self::Adc | Self::AdcSecure)
    }
}

impl fmt::Display for HubScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Nmdc => "nmdc",
            Self::NmdcSecure => "nmdcs",
            Self::Adc => "adc",
            Self::AdcSecure => "adcs",
        };
        write!(f, "{}", s)
    }
}

/// A parsed hub URL: `<scheme>://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubUrl {
    /// The protocol dialect and transport security selected by the scheme.
    pub scheme: HubScheme,
    /// Hub hostname or IP.
    pub host: String,
    /// Hub TCP port.
    pub port: u16,
}

impl HubUrl {
    /// `host:port`, as used to dial the hub.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for HubUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme_str, rest) = s
            .split_once("://")
            .ok_or_else(|| Error::ConfigInvalid(format!("missing scheme in hub url: {s}")))?;

        let scheme = match scheme_str {
            "nmdc" => HubScheme::Nmdc,
            "nmdcs" => HubScheme::NmdcSecure,
            "adc" => HubScheme::Adc,
            "adcs" => HubScheme::AdcSecure,
            other => {
                return Err(Error::ConfigInvalid(format!(
                    "unsupported hub url scheme: {other}"
                )))
            }
        };

        let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
            Error::ConfigInvalid(format!("missing port in hub url: {s}"))
        })?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::ConfigInvalid(format!("invalid port in hub url: {s}")))?;
        if host.is_empty() {
            return Err(Error::ConfigInvalid(format!("missing host in hub url: {s}")));
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

/// How a peer connection should negotiate encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEncryptionMode {
    /// Use TLS when both sides advertise support; fall back to plaintext otherwise.
    PreferEncryption,
    /// Never advertise or accept TLS for peer connections.
    DisableEncryption,
    /// Refuse to complete a peer connection that can't be encrypted.
    ForceEncryption,
}

impl Default for PeerEncryptionMode {
    fn default() -> Self {
        Self::PreferEncryption
    }
}

/// Client configuration. Constructed by the caller and validated once in
/// `Client::new`, before any socket is opened.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub endpoint and protocol selector (required).
    pub hub_url: HubUrl,
    /// Self nickname (required, must be non-empty).
    pub nick: String,
    /// Auth secret, if the hub requires one.
    pub password: Option<String>,
    /// Advertised external IP. If absent, the hub is asked to supply one.
    pub ip: Option<std::net::IpAddr>,
    /// TCP listen port for incoming peer connections. `0` picks an ephemeral port.
    pub tcp_port: u16,
    /// UDP listen port for active-mode search results. `0` picks an ephemeral port.
    pub udp_port: u16,
    /// TCP+TLS listen port for encrypted incoming peer connections.
    pub tcp_tls_port: u16,
    /// Skip listeners; this client cannot accept incoming peer connections.
    pub is_passive: bool,
    /// Encryption policy for peer connections.
    pub peer_encryption_mode: PeerEncryptionMode,
    /// Do not dial the hub until `Client::hub_connect` is called explicitly.
    pub hub_manual_connect: bool,
    /// Concurrent upload slot count.
    pub upload_max_parallel: usize,
    /// Concurrent download count.
    pub download_max_parallel: usize,
    /// Directory incoming file downloads are written to.
    pub download_dir: std::path::PathBuf,
}

impl ClientConfig {
    /// Construct a config with the two required fields and every optional
    /// field defaulted the way the reference implementation defaults them.
    pub fn new(hub_url: &str, nick: impl Into<String>) -> Result<Self, Error> {
        let nick = nick.into();
        if nick.is_empty() {
            return Err(Error::ConfigInvalid("nick must not be empty".into()));
        }
        Ok(Self {
            hub_url: hub_url.parse()?,
            nick,
            password: None,
            ip: None,
            tcp_port: 0,
            udp_port: 0,
            tcp_tls_port: 0,
            is_passive: false,
            peer_encryption_mode: PeerEncryptionMode::default(),
            hub_manual_connect: false,
            upload_max_parallel: 3,
            download_max_parallel: 3,
            download_dir: std::env::temp_dir(),
        })
    }

    /// Re-validate the configuration. Called by `Client::new` after the
    /// caller has had a chance to mutate fields from their defaults.
    pub fn validate(&self) -> Result<(), Error> {
        if self.nick.is_empty() {
            return Err(Error::ConfigInvalid("nick must not be empty".into()));
        }
        if self.upload_max_parallel == 0 {
            return Err(Error::ConfigInvalid(
                "upload_max_parallel must be at least 1".into(),
            ));
        }
        if self.download_max_parallel == 0 {
            return Err(Error::ConfigInvalid(
                "download_max_parallel must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_four_schemes() {
        for (s, scheme) in [
            ("nmdc://hub.example:411", HubScheme::Nmdc),
            ("nmdcs://hub.example:411", HubScheme::NmdcSecure),
            ("adc://hub.example:5000", HubScheme::Adc),
            ("adcs://hub.example:5000", HubScheme::AdcSecure),
        ] {
            let url: HubUrl = s.parse().unwrap();
            assert_eq!(url.scheme, scheme);
            assert_eq!(url.host, "hub.example");
        }
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!("ftp://hub.example:21".parse::<HubUrl>().is_err());
    }

    #[test]
    fn rejects_missing_port() {
        assert!("nmdc://hub.example".parse::<HubUrl>().is_err());
    }

    #[test]
    fn new_rejects_empty_nick() {
        assert!(ClientConfig::new("nmdc://hub.example:411", "").is_err());
    }
}
