//! TRISA compliance node.
//!
//! Serves the TRISA network and health services over mutually authenticated
//! TLS: secure envelope transfer (unary and streaming), signing-key exchange,
//! address confirmation and status probes.

pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod peers;
pub mod server;
pub mod service;
pub mod stream;
pub mod trust;

pub use config::{ConfigError, NodeConfig};
pub use envelope::{EnvelopeCodec, HmacEnvelopeCodec};
pub use error::{NodeError, ServiceError, TransportError};
pub use peers::{Peer, PeerError, PeerRegistry, PeerResolver, PeerSession, PeerSigningKey};
pub use server::Server;
pub use service::{ComplianceHandler, DecodedTransaction, NoCompliance, TrisaService};
pub use stream::{EnvelopeStream, FramedEnvelopeStream};
pub use trust::{IdentityError, NodeIdentity};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
