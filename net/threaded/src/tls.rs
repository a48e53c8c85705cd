//! Self-signed TLS for peer connections.
//!
//! Direct Connect peers generate their own certificate; there is no CA to
//! validate against. We accept any presented certificate and instead let the
//! caller compare its SHA-256 fingerprint against the `KP` field a peer may
//! have advertised over the hub (see [`fingerprint`]).

use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::server::{ClientCertVerified, ClientCertVerifier};
use rustls::{Certificate, DistinguishedName, Error as TlsError, PrivateKey};
use sha2::{Digest, Sha256};

/// Accepts any certificate presented by a hub or peer. Direct Connect has no
/// certificate authority; trust is established out-of-band by comparing
/// [`fingerprint`] against an advertised `KP` value, not by chain validation.
pub struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::client::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Accepts any client certificate presented when this side listens for
/// incoming encrypted peer connections.
pub struct AcceptAnyClientCert;

impl ClientCertVerifier for AcceptAnyClientCert {
    fn client_auth_root_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _now: SystemTime,
    ) -> Result<ClientCertVerified, TlsError> {
        Ok(ClientCertVerified::assertion())
    }
}

/// SHA-256 fingerprint of a DER-encoded certificate, hex-encoded lower-case,
/// the form compared against a peer's advertised ADC `KP` field.
pub fn fingerprint(cert_der: &[u8]) -> String {
    let digest = Sha256::digest(cert_der);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A freshly generated self-signed certificate and its private key, plus the
/// fingerprint peers should be told to expect.
pub struct SelfSignedCert {
    /// DER-encoded certificate.
    pub cert_der: Vec<u8>,
    /// DER-encoded PKCS#8 private key.
    pub key_der: Vec<u8>,
    /// SHA-256 fingerprint of `cert_der`.
    pub fingerprint: String,
}

/// Generate a fresh self-signed certificate for this client's listeners.
///
/// Regenerated once per process start; Direct Connect clients don't persist
/// or rotate certificates the way a long-lived server would.
pub fn generate_self_signed(subject: &str) -> Result<SelfSignedCert, rcgen::RcgenError> {
    let cert = rcgen::generate_simple_self_signed(vec![subject.to_string()])?;
    let cert_der = cert.serialize_der()?;
    let key_der = cert.serialize_private_key_der();
    let fingerprint = fingerprint(&cert_der);
    Ok(SelfSignedCert {
        cert_der,
        key_der,
        fingerprint,
    })
}

/// Build a client-side TLS config that accepts any server certificate.
pub fn client_config() -> Arc<rustls::ClientConfig> {
    Arc::new(
        rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth(),
    )
}

/// Build a server-side TLS config around a self-signed certificate, for
/// accepting incoming encrypted peer connections.
pub fn server_config(
    cert: &SelfSignedCert,
) -> Result<Arc<rustls::ServerConfig>, rustls::Error> {
    let cert_chain = vec![Certificate(cert.cert_der.clone())];
    let key = PrivateKey(cert.key_der.clone());
    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
        .with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_hex() {
        let cert = generate_self_signed("tigerhub-test").unwrap();
        assert_eq!(cert.fingerprint.len(), 64);
        assert!(cert.fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
