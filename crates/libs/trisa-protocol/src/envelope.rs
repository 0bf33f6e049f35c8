use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::ProtocolError;

/// Type URL of an IVMS101 identity payload.
pub const IDENTITY_PAYLOAD_TYPE: &str = "type.googleapis.com/ivms101.IdentityPayload";

/// Type URL of a generic travel-rule transaction.
pub const TRANSACTION_TYPE: &str = "type.googleapis.com/trisa.data.generic.v1beta1.Transaction";

/// Wire message exchanged between counterparties.
///
/// Either carries a sealed `payload` with the key material needed to open it,
/// or an `error` in place of the payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SecureEnvelope {
    pub id: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub encryption_key: Vec<u8>,
    pub encryption_algorithm: String,
    #[serde(with = "serde_bytes")]
    pub hmac: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub hmac_secret: Vec<u8>,
    pub hmac_algorithm: String,
    pub error: Option<ProtocolError>,
    pub timestamp: String,
}

impl SecureEnvelope {
    /// Envelope that answers request `id` with an in-band protocol error.
    pub fn from_error(id: impl Into<String>, error: ProtocolError) -> Self {
        Self { id: id.into(), error: Some(error), ..Self::default() }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Self-describing payload body, tagged with its canonical type URL.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Any {
    pub type_url: String,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

impl Any {
    pub fn pack<T: Serialize>(
        type_url: impl Into<String>,
        message: &T,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self { type_url: type_url.into(), value: rmp_serde::to_vec(message)? })
    }

    pub fn unpack<T: DeserializeOwned>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.value)
    }

    pub fn is(&self, type_url: &str) -> bool {
        self.type_url == type_url
    }
}

/// Opened envelope contents.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payload {
    pub identity: Any,
    pub transaction: Any,
    pub sent_at: String,
    pub received_at: String,
}

/// A natural or legal person named in an identity payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Party {
    pub name: String,
    pub account_numbers: Vec<String>,
    pub country: Option<String>,
}

/// IVMS101 identity information for both ends of a transfer.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityPayload {
    pub originator: Option<Party>,
    pub beneficiary: Option<Party>,
    pub originating_vasp: Option<Party>,
    pub beneficiary_vasp: Option<Party>,
}

/// Generic on-chain transaction details.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub txid: String,
    pub originator: String,
    pub beneficiary: String,
    pub amount: f64,
    pub network: String,
    pub timestamp: String,
    pub extra_json: String,
    pub asset_type: String,
    pub tag: String,
}
