//! Counterparty records bound to authenticated transport sessions.

use crate::trust::public_key_algorithm_name;
use rustls::pki_types::CertificateDer;
use rustls::ServerConnection;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use trisa_protocol::{ErrorCode, ProtocolError};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509Certificate};
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("no client certificate presented")]
    NoCertificate,

    #[error("could not parse client certificate: {0}")]
    Unparseable(String),

    #[error("client certificate names no subject")]
    MissingName,
}

impl From<PeerError> for ProtocolError {
    fn from(err: PeerError) -> Self {
        ProtocolError::unverified(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("could not parse PKIX public key: {0}")]
    Unparseable(String),

    #[error("unsupported signing algorithm {0}")]
    UnsupportedAlgorithm(String),
}

impl From<KeyError> for ProtocolError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::Unparseable(_) => {
                ProtocolError::new(ErrorCode::NoSigningKey, "could not parse signing key")
            }
            KeyError::UnsupportedAlgorithm(_) => {
                ProtocolError::new(ErrorCode::UnhandledAlgorithm, "unsupported signing algorithm")
            }
        }
    }
}

/// Transport-level view of a caller: the certificates it presented during
/// the mTLS handshake.
#[derive(Debug, Clone, Default)]
pub struct PeerSession {
    certificates: Vec<CertificateDer<'static>>,
    remote_addr: Option<SocketAddr>,
}

impl PeerSession {
    pub fn new(
        certificates: Vec<CertificateDer<'static>>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self { certificates, remote_addr }
    }

    pub fn from_connection(conn: &ServerConnection, remote_addr: Option<SocketAddr>) -> Self {
        let certificates = conn.peer_certificates().map(<[_]>::to_vec).unwrap_or_default();
        Self { certificates, remote_addr }
    }

    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.certificates.first()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

/// Public signing key a peer handed over during key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSigningKey {
    algorithm: String,
    bits: usize,
    pkix: Vec<u8>,
}

impl PeerSigningKey {
    /// Parses a DER `SubjectPublicKeyInfo`. Only RSA keys are accepted; PEM
    /// armour is not stripped.
    pub fn from_pkix(data: &[u8]) -> Result<Self, KeyError> {
        let (remaining, spki) = SubjectPublicKeyInfo::from_der(data)
            .map_err(|err| KeyError::Unparseable(err.to_string()))?;
        if !remaining.is_empty() {
            return Err(KeyError::Unparseable(format!(
                "{} trailing bytes after public key",
                remaining.len()
            )));
        }
        match spki.parsed() {
            Ok(PublicKey::RSA(rsa)) => {
                let bits = rsa.modulus.iter().skip_while(|byte| **byte == 0).count() * 8;
                Ok(Self { algorithm: "RSA".to_string(), bits, pkix: data.to_vec() })
            }
            Ok(_) => Err(KeyError::UnsupportedAlgorithm(public_key_algorithm_name(
                &spki.algorithm.algorithm.to_id_string(),
            ))),
            Err(err) => Err(KeyError::Unparseable(err.to_string())),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn pkix(&self) -> &[u8] {
        &self.pkix
    }
}

/// A resolved counterparty.
///
/// The signing key has its own lock so exchanges for different peers never
/// contend.
#[derive(Debug)]
pub struct Peer {
    name: String,
    signing_key: RwLock<Option<PeerSigningKey>>,
}

impl Peer {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), signing_key: RwLock::new(None) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signing_key(&self) -> Option<PeerSigningKey> {
        self.signing_key.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn has_signing_key(&self) -> bool {
        self.signing_key.read().unwrap_or_else(|poisoned| poisoned.into_inner()).is_some()
    }

    /// Replaces any previously cached key.
    pub fn update_signing_key(&self, key: PeerSigningKey) {
        *self.signing_key.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(key);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Binds an authenticated session to its peer record.
pub trait PeerResolver: Send + Sync {
    fn resolve(&self, session: &PeerSession) -> Result<Arc<Peer>, PeerError>;
}

/// In-memory peer records keyed by certificate subject name.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Peer>> {
        self.peers.read().unwrap_or_else(|poisoned| poisoned.into_inner()).get(name).cloned()
    }

    pub fn get_or_insert(&self, name: &str) -> Arc<Peer> {
        if let Some(peer) = self.get(name) {
            return peer;
        }
        let mut peers = self.peers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        peers.entry(name.to_string()).or_insert_with(|| Arc::new(Peer::new(name))).clone()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PeerResolver for PeerRegistry {
    fn resolve(&self, session: &PeerSession) -> Result<Arc<Peer>, PeerError> {
        let leaf = session.leaf().ok_or(PeerError::NoCertificate)?;
        let name = peer_name(leaf.as_ref())?;
        Ok(self.get_or_insert(&name))
    }
}

/// Common name of the certificate subject, falling back to the first DNS
/// subject alternative name.
pub fn peer_name(cert_der: &[u8]) -> Result<String, PeerError> {
    let (_remaining, cert) =
        X509Certificate::from_der(cert_der).map_err(|err| PeerError::Unparseable(err.to_string()))?;
    let common_name = cert
        .subject()
        .iter_common_name()
        .find_map(|name| name.as_str().ok().map(str::trim).map(str::to_string))
        .filter(|name| !name.is_empty());
    if let Some(name) = common_name {
        return Ok(name);
    }
    first_dns_name(&cert).ok_or(PeerError::MissingName)
}

fn first_dns_name(cert: &X509Certificate<'_>) -> Option<String> {
    for extension in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(subject_alt_name) =
            extension.parsed_extension()
        {
            for name in &subject_alt_name.general_names {
                if let GeneralName::DNSName(value) = name {
                    let value = value.trim();
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{KeyError, Peer, PeerError, PeerRegistry, PeerResolver, PeerSession};
    use rustls::pki_types::CertificateDer;
    use trisa_protocol::{ErrorCode, ProtocolError};

    #[test]
    fn session_without_certificate_is_unverified() {
        let registry = PeerRegistry::new();
        let err = registry.resolve(&PeerSession::default()).expect_err("no cert");
        assert_eq!(err, PeerError::NoCertificate);
        assert_eq!(ProtocolError::from(err).code, ErrorCode::Unverified);
        assert!(registry.is_empty());
    }

    #[test]
    fn garbage_certificate_is_unparseable() {
        let registry = PeerRegistry::new();
        let session = PeerSession::new(vec![CertificateDer::from(vec![0x30, 0x03, 0x01])], None);
        let err = registry.resolve(&session).expect_err("garbage cert");
        assert!(matches!(err, PeerError::Unparseable(_)));
    }

    #[test]
    fn registry_returns_same_record_for_same_name() {
        let registry = PeerRegistry::new();
        let first = registry.get_or_insert("alpha");
        let second = registry.get_or_insert("alpha");
        assert!(std::sync::Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn new_peer_has_no_signing_key() {
        let peer = Peer::new("alpha");
        assert!(!peer.has_signing_key());
        assert_eq!(peer.to_string(), "alpha");
    }

    #[test]
    fn key_errors_map_to_protocol_codes() {
        let parse = ProtocolError::from(KeyError::Unparseable("bad".into()));
        assert_eq!(parse.code, ErrorCode::NoSigningKey);
        let algo = ProtocolError::from(KeyError::UnsupportedAlgorithm("ECDSA".into()));
        assert_eq!(algo.code, ErrorCode::UnhandledAlgorithm);
    }
}
