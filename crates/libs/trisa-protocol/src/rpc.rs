use serde::{Deserialize, Serialize};

use crate::envelope::SecureEnvelope;
use crate::error::ProtocolError;
use crate::messages::{Address, AddressConfirmation, HealthCheck, ServiceState, SigningKey};

/// A request frame sent by the client while the connection is in call mode.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Call {
    Transfer(SecureEnvelope),
    ConfirmAddress(Address),
    KeyExchange(SigningKey),
    Status(HealthCheck),
    /// Switches the connection into stream mode for `TransferStream`.
    OpenStream,
}

impl Call {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Transfer(_) => "Transfer",
            Self::ConfirmAddress(_) => "ConfirmAddress",
            Self::KeyExchange(_) => "KeyExchange",
            Self::Status(_) => "Status",
            Self::OpenStream => "TransferStream",
        }
    }
}

/// Response frame for a unary [`Call`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Reply {
    Envelope(SecureEnvelope),
    AddressConfirmation(AddressConfirmation),
    SigningKey(SigningKey),
    ServiceState(ServiceState),
    /// The call failed with a protocol error.
    Failed(ProtocolError),
}

/// Client frame in stream mode.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum StreamFrame {
    Envelope(SecureEnvelope),
    /// Graceful end of the client's half of the stream.
    CloseSend,
    /// The client abandons the stream.
    Cancel,
}

/// Server frame in stream mode.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum StreamReply {
    Envelope(SecureEnvelope),
    /// Terminal frame; nothing follows on this connection.
    Closed(StreamStatus),
}

/// Final status of a `TransferStream`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum StreamStatus {
    /// The client closed its half; `messages` were processed.
    Ok { messages: u64 },
    Cancelled,
    /// Send or receive failed; the client must reconnect.
    Unavailable { message: String },
    /// The stream was refused before any message was processed.
    Rejected(ProtocolError),
    Internal { message: String },
}

impl StreamStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}
