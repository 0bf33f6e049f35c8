use std::io;

use trisa_protocol::ProtocolError;

use crate::config::ConfigError;
use crate::trust::IdentityError;

/// Failure of the connection carrying a call or stream.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cancelled by caller")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Handler-boundary failure.
///
/// `Protocol` errors belong to the compliance domain: unary calls return them
/// to the caller and streams carry them in-band. `Transport` errors end the
/// call or stream.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Startup and serve-loop failures reported to the process.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("could not listen on {addr:?}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server already started")]
    AlreadyStarted,

    #[error("serve loop failed: {0}")]
    Serve(#[source] io::Error),

    #[error("could not install signal handler: {0}")]
    Signal(#[source] io::Error),

    #[error("could not initialise logging: {0}")]
    Logging(#[from] log::SetLoggerError),
}
