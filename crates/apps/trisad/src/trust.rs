//! Node certificate material and mTLS credentials.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pemfile::private_key;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use trisa_protocol::SigningKey;
use x509_parser::prelude::{FromDer, X509Certificate};
use x509_parser::time::ASN1Time;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("no valid CA certificates found in {0}")]
    EmptyPool(PathBuf),

    #[error("failed to build client verifier: {0}")]
    Verifier(String),

    #[error("invalid server certificate/key configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid node certificate: {0}")]
    Certificate(String),
}

/// The node's own certificate chain, private key and trust pool.
///
/// Loaded once at startup and never mutated.
pub struct NodeIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    pool: Arc<RootCertStore>,
}

impl NodeIdentity {
    /// Loads the certificate/key bundle and the issuer pool from PEM files.
    pub fn load(certs_path: &Path, pool_path: &Path) -> Result<Self, IdentityError> {
        let chain = load_cert_chain(certs_path)?;
        let key = load_private_key(certs_path)?;
        let pool = load_root_store(pool_path)?;
        log::debug!(
            "loaded node identity certs={} chain_len={} pool={} pool_size={}",
            certs_path.display(),
            chain.len(),
            pool_path.display(),
            pool.len()
        );
        Ok(Self { chain, key, pool: Arc::new(pool) })
    }

    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    pub fn leaf(&self) -> &CertificateDer<'static> {
        // load_cert_chain refuses empty bundles
        &self.chain[0]
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Server TLS configuration that requires a client certificate issued by
    /// the trust pool.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, IdentityError> {
        let verifier = WebPkiClientVerifier::builder(self.pool.clone())
            .build()
            .map_err(|err| IdentityError::Verifier(err.to_string()))?;
        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.chain.clone(), self.key.clone_key())?;
        Ok(Arc::new(config))
    }

    /// Public signing-key record for the node, read from its leaf certificate.
    pub fn signing_key(&self) -> Result<SigningKey, IdentityError> {
        let (_remaining, cert) = X509Certificate::from_der(self.leaf().as_ref())
            .map_err(|err| IdentityError::Certificate(err.to_string()))?;
        let spki = cert.public_key();
        Ok(SigningKey {
            version: i64::from(cert.version().0) + 1,
            signature: cert.signature_value.data.to_vec(),
            signature_algorithm: signature_algorithm_name(
                &cert.signature_algorithm.algorithm.to_id_string(),
            ),
            public_key_algorithm: public_key_algorithm_name(
                &spki.algorithm.algorithm.to_id_string(),
            ),
            not_before: format_time(&cert.validity().not_before)?,
            not_after: format_time(&cert.validity().not_after)?,
            revoked: false,
            data: spki.raw.to_vec(),
        })
    }
}

fn format_time(value: &ASN1Time) -> Result<String, IdentityError> {
    value.to_datetime().format(&Rfc3339).map_err(|err| IdentityError::Certificate(err.to_string()))
}

pub fn signature_algorithm_name(oid: &str) -> String {
    let name = match oid {
        "1.2.840.113549.1.1.5" => "SHA1-RSA",
        "1.2.840.113549.1.1.10" => "SHA256-RSAPSS",
        "1.2.840.113549.1.1.11" => "SHA256-RSA",
        "1.2.840.113549.1.1.12" => "SHA384-RSA",
        "1.2.840.113549.1.1.13" => "SHA512-RSA",
        "1.2.840.10045.4.3.2" => "ECDSA-SHA256",
        "1.2.840.10045.4.3.3" => "ECDSA-SHA384",
        "1.2.840.10045.4.3.4" => "ECDSA-SHA512",
        "1.3.101.112" => "Ed25519",
        other => return other.to_string(),
    };
    name.to_string()
}

pub fn public_key_algorithm_name(oid: &str) -> String {
    let name = match oid {
        "1.2.840.113549.1.1.1" => "RSA",
        "1.2.840.10045.2.1" => "ECDSA",
        "1.3.101.112" => "Ed25519",
        other => return other.to_string(),
    };
    name.to_string()
}

fn open(path: &Path) -> Result<BufReader<File>, IdentityError> {
    let file =
        File::open(path).map_err(|source| IdentityError::Io { path: path.to_path_buf(), source })?;
    Ok(BufReader::new(file))
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, IdentityError> {
    let mut reader = open(path)?;
    let certificates = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| IdentityError::Io { path: path.to_path_buf(), source })?;
    if certificates.is_empty() {
        return Err(IdentityError::NoCertificates(path.to_path_buf()));
    }
    Ok(certificates)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, IdentityError> {
    let mut reader = open(path)?;
    let key = private_key(&mut reader)
        .map_err(|source| IdentityError::Io { path: path.to_path_buf(), source })?;
    key.ok_or_else(|| IdentityError::NoPrivateKey(path.to_path_buf()))
}

fn load_root_store(path: &Path) -> Result<RootCertStore, IdentityError> {
    let certificates = load_cert_chain(path)?;
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(certificates);
    if added == 0 {
        return Err(IdentityError::EmptyPool(path.to_path_buf()));
    }
    Ok(roots)
}
