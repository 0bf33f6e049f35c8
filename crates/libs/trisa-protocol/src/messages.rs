use serde::{Deserialize, Serialize};

/// Public signing-key record exchanged by `KeyExchange`.
///
/// `data` holds a PKIX (DER `SubjectPublicKeyInfo`) encoded public key.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SigningKey {
    pub version: i64,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    pub signature_algorithm: String,
    pub public_key_algorithm: String,
    pub not_before: String,
    pub not_after: String,
    pub revoked: bool,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Wallet address a counterparty asks this node to confirm.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Address {
    pub address: String,
    pub network: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressConfirmation {
    pub address: String,
    pub confirmed: bool,
}

/// Liveness probe; both fields are caller-side bookkeeping only.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    pub attempts: u32,
    pub last_checked_at: String,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    #[default]
    Healthy,
    Unhealthy,
    Maintenance,
}

/// Health report with the window in which the caller should check again.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceState {
    pub status: ServingStatus,
    pub not_before: String,
    pub not_after: String,
}
