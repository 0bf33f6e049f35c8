use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed taxonomy of protocol failure codes.
///
/// Codes travel on the wire by name so that both sides agree on meaning
/// without sharing numeric tables.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The caller could not be authenticated from its transport session.
    Unverified,
    /// No signing key is cached for the caller; redo key exchange and resubmit.
    NoSigningKey,
    /// The identity payload is not an IVMS101 identity payload.
    UnparseableIdentity,
    /// The transaction payload is not a generic transaction.
    UnparseableTransaction,
    /// A key or envelope uses an algorithm this node does not handle.
    UnhandledAlgorithm,
    /// The envelope signature does not match its payload.
    InvalidSignature,
    /// The envelope payload could not be decoded.
    EnvelopeDecodeFail,
    /// The request is structurally invalid for this operation.
    BadRequest,
    /// The counterparty does not perform travel-rule compliance.
    NoCompliance,
    /// The operation is not implemented by this node.
    Unimplemented,
    /// The service is unavailable; the stream or call must be retried.
    Unavailable,
    /// The node failed internally while building a response.
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unverified => "UNVERIFIED",
            Self::NoSigningKey => "NO_SIGNING_KEY",
            Self::UnparseableIdentity => "UNPARSEABLE_IDENTITY",
            Self::UnparseableTransaction => "UNPARSEABLE_TRANSACTION",
            Self::UnhandledAlgorithm => "UNHANDLED_ALGORITHM",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::EnvelopeDecodeFail => "ENVELOPE_DECODE_FAIL",
            Self::BadRequest => "BAD_REQUEST",
            Self::NoCompliance => "NO_COMPLIANCE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Unavailable => "UNAVAILABLE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coded protocol failure.
///
/// Returned as the failure of a unary call, or carried inside a
/// [`SecureEnvelope`](crate::SecureEnvelope) when a stream must survive the
/// rejection of a single message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub retry: bool,
}

impl ProtocolError {
    /// Non-retryable error with the given code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), retry: false }
    }

    /// Error the caller is expected to resubmit after fixing its session state.
    pub fn retryable(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), retry: true }
    }

    pub fn unverified(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unverified, message)
    }

    pub fn no_signing_key(message: impl Into<String>) -> Self {
        Self::retryable(ErrorCode::NoSigningKey, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.retry
    }
}
