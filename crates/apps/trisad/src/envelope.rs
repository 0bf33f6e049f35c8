//! Opening and sealing secure envelopes.
//!
//! The service core only sees [`EnvelopeCodec`]. [`HmacEnvelopeCodec`] is the
//! codec shipped with the node: cleartext payloads integrity-checked with
//! HMAC-SHA256. The HMAC secret travels inside the envelope, so the check
//! catches corruption but does not authenticate the sender; anyone holding
//! the envelope can re-sign a modified payload. Deployments that need
//! confidentiality or origin authentication plug in their own codec.

use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use rustls::pki_types::PrivateKeyDer;
use sha2::Sha256;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use trisa_protocol::{ErrorCode, Payload, ProtocolError, SecureEnvelope};

use crate::peers::PeerSigningKey;

pub const CLEARTEXT_ALGORITHM: &str = "NONE";
pub const HMAC_SHA256: &str = "HMAC-SHA256";

const HMAC_SECRET_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

pub trait EnvelopeCodec: Send + Sync {
    /// Opens an inbound envelope with the node's private key.
    fn open(
        &self,
        envelope: &SecureEnvelope,
        key: &PrivateKeyDer<'static>,
    ) -> Result<Payload, ProtocolError>;

    /// Seals `payload` for a recipient whose signing key is known.
    fn seal(
        &self,
        id: &str,
        payload: &Payload,
        recipient: &PeerSigningKey,
    ) -> Result<SecureEnvelope, ProtocolError>;
}

/// Cleartext codec with an HMAC-SHA256 integrity check keyed by the
/// envelope's own `hmac_secret`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HmacEnvelopeCodec;

impl EnvelopeCodec for HmacEnvelopeCodec {
    fn open(
        &self,
        envelope: &SecureEnvelope,
        _key: &PrivateKeyDer<'static>,
    ) -> Result<Payload, ProtocolError> {
        if let Some(err) = envelope.error.as_ref() {
            return Err(ProtocolError::new(
                ErrorCode::BadRequest,
                format!("envelope carries error {} instead of a payload", err.code),
            ));
        }
        if envelope.payload.is_empty() {
            return Err(ProtocolError::new(
                ErrorCode::EnvelopeDecodeFail,
                "envelope has no payload",
            ));
        }
        if envelope.encryption_algorithm != CLEARTEXT_ALGORITHM {
            return Err(ProtocolError::new(
                ErrorCode::UnhandledAlgorithm,
                format!("unsupported encryption algorithm {:?}", envelope.encryption_algorithm),
            ));
        }
        if envelope.hmac_algorithm != HMAC_SHA256 {
            return Err(ProtocolError::new(
                ErrorCode::UnhandledAlgorithm,
                format!("unsupported hmac algorithm {:?}", envelope.hmac_algorithm),
            ));
        }

        let mut mac = HmacSha256::new_from_slice(&envelope.hmac_secret)
            .map_err(|_| ProtocolError::new(ErrorCode::InvalidSignature, "invalid hmac secret"))?;
        mac.update(&envelope.payload);
        mac.verify_slice(&envelope.hmac).map_err(|_| {
            ProtocolError::new(ErrorCode::InvalidSignature, "hmac signature does not match payload")
        })?;

        rmp_decode(&envelope.payload)
    }

    fn seal(
        &self,
        id: &str,
        payload: &Payload,
        _recipient: &PeerSigningKey,
    ) -> Result<SecureEnvelope, ProtocolError> {
        let body = rmp_encode(payload)?;
        let mut secret = vec![0u8; HMAC_SECRET_LEN];
        OsRng.fill_bytes(&mut secret);

        let mut mac = HmacSha256::new_from_slice(&secret)
            .map_err(|_| ProtocolError::internal("could not key hmac"))?;
        mac.update(&body);
        let hmac = mac.finalize().into_bytes().to_vec();

        Ok(SecureEnvelope {
            id: id.to_string(),
            payload: body,
            encryption_key: Vec::new(),
            encryption_algorithm: CLEARTEXT_ALGORITHM.to_string(),
            hmac,
            hmac_secret: secret,
            hmac_algorithm: HMAC_SHA256.to_string(),
            error: None,
            timestamp: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
        })
    }
}

fn rmp_encode(payload: &Payload) -> Result<Vec<u8>, ProtocolError> {
    rmp_serde::to_vec(payload)
        .map_err(|err| ProtocolError::internal(format!("could not encode payload: {}", err)))
}

fn rmp_decode(body: &[u8]) -> Result<Payload, ProtocolError> {
    rmp_serde::from_slice(body).map_err(|err| {
        ProtocolError::new(
            ErrorCode::EnvelopeDecodeFail,
            format!("could not decode payload: {}", err),
        )
    })
}
