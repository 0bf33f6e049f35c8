//! Wire contract for the TRISA node RPC surface.
//!
//! This crate defines everything that crosses the socket between a node and
//! its counterparties:
//!
//! - **Messages** for the five operations (`Transfer`, `TransferStream`,
//!   `ConfirmAddress`, `KeyExchange`, `Status`)
//! - **`ProtocolError`** with the closed [`ErrorCode`] taxonomy and its
//!   `retry` flag
//! - **Call framing** ([`Call`], [`Reply`], [`StreamFrame`], [`StreamReply`])
//! - **Frame codec**: 4-byte big-endian length prefix followed by a
//!   MessagePack body
//!
//! Envelope cryptography is not part of this crate. A [`SecureEnvelope`] is
//! carried as opaque bytes plus the metadata a codec needs to open it.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod messages;
pub mod rpc;

pub use envelope::{
    Any, IdentityPayload, Party, Payload, SecureEnvelope, Transaction, IDENTITY_PAYLOAD_TYPE,
    TRANSACTION_TYPE,
};
pub use error::{ErrorCode, ProtocolError};
pub use messages::{
    Address, AddressConfirmation, HealthCheck, ServiceState, ServingStatus, SigningKey,
};
pub use rpc::{Call, Reply, StreamFrame, StreamReply, StreamStatus};
