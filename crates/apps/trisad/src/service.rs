//! RPC handlers for the network transfer and health services.

use async_trait::async_trait;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;
use trisa_protocol::{
    Address, AddressConfirmation, ErrorCode, HealthCheck, IdentityPayload, ProtocolError,
    SecureEnvelope, ServiceState, ServingStatus, SigningKey, StreamStatus, Transaction,
    IDENTITY_PAYLOAD_TYPE, TRANSACTION_TYPE,
};

use crate::envelope::{EnvelopeCodec, HmacEnvelopeCodec};
use crate::error::{ServiceError, TransportError};
use crate::peers::{Peer, PeerResolver, PeerSession, PeerSigningKey};
use crate::stream::EnvelopeStream;
use crate::trust::NodeIdentity;

/// Health checks are requested again between these offsets from now.
const STATUS_NOT_BEFORE: Duration = Duration::minutes(30);
const STATUS_NOT_AFTER: Duration = Duration::hours(1);

/// Identity and transaction recovered from one envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTransaction {
    pub envelope_id: String,
    pub identity: IdentityPayload,
    pub transaction: Transaction,
    pub sent_at: String,
}

/// Business logic applied to every validated transaction.
#[async_trait]
pub trait ComplianceHandler: Send + Sync {
    async fn handle(
        &self,
        peer: &Peer,
        transaction: DecodedTransaction,
    ) -> Result<SecureEnvelope, ServiceError>;
}

/// Rejects every transaction: the node does not perform travel-rule
/// compliance itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompliance;

#[async_trait]
impl ComplianceHandler for NoCompliance {
    async fn handle(
        &self,
        peer: &Peer,
        transaction: DecodedTransaction,
    ) -> Result<SecureEnvelope, ServiceError> {
        log::info!(
            "rejecting transaction peer={} id={} txid={}",
            peer,
            transaction.envelope_id,
            transaction.transaction.txid
        );
        Err(ProtocolError::new(
            ErrorCode::NoCompliance,
            "this node is not a VASP and therefore cannot perform travel rule compliance",
        )
        .into())
    }
}

pub struct TrisaService {
    identity: Arc<NodeIdentity>,
    peers: Arc<dyn PeerResolver>,
    codec: Arc<dyn EnvelopeCodec>,
    compliance: Arc<dyn ComplianceHandler>,
    maintenance: bool,
}

impl TrisaService {
    pub fn new(identity: Arc<NodeIdentity>, peers: Arc<dyn PeerResolver>) -> Self {
        Self {
            identity,
            peers,
            codec: Arc::new(HmacEnvelopeCodec),
            compliance: Arc::new(NoCompliance),
            maintenance: false,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn EnvelopeCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_compliance(mut self, compliance: Arc<dyn ComplianceHandler>) -> Self {
        self.compliance = compliance;
        self
    }

    pub fn with_maintenance(mut self, maintenance: bool) -> Self {
        self.maintenance = maintenance;
        self
    }

    fn authenticate(
        &self,
        session: &PeerSession,
        operation: &str,
    ) -> Result<Arc<Peer>, ProtocolError> {
        self.peers.resolve(session).map_err(|err| {
            log::error!(
                "could not verify peer from incoming {} remote={:?} err={}",
                operation,
                session.remote_addr(),
                err
            );
            ProtocolError::from(err)
        })
    }

    /// Unary `Transfer`.
    pub async fn transfer(
        &self,
        session: &PeerSession,
        envelope: SecureEnvelope,
    ) -> Result<SecureEnvelope, ServiceError> {
        let peer = self.authenticate(session, "request")?;
        log::info!("unary transfer request received peer={} id={}", peer, envelope.id);

        if !peer.has_signing_key() {
            log::warn!("no signing key available peer={} id={}", peer, envelope.id);
            return Err(
                ProtocolError::no_signing_key("please retry transfer after key exchange").into()
            );
        }

        self.handle_transaction(&peer, &envelope).await
    }

    /// Bidirectional `TransferStream`.
    ///
    /// Protocol errors for one message are answered in-band and the loop
    /// continues; transport failures and internal faults end the stream.
    pub async fn transfer_stream<S>(
        &self,
        session: &PeerSession,
        stream: &mut S,
        cancel: &CancellationToken,
    ) -> StreamStatus
    where
        S: EnvelopeStream + ?Sized,
    {
        let peer = match self.authenticate(session, "stream") {
            Ok(peer) => peer,
            Err(err) => return StreamStatus::Rejected(err),
        };
        log::info!("transfer stream opened peer={}", peer);

        if !peer.has_signing_key() {
            log::warn!("no signing key available peer={}", peer);
            return StreamStatus::Rejected(ProtocolError::no_signing_key(
                "please retry transfer stream after key exchange",
            ));
        }

        let mut messages: u64 = 0;
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                received = stream.recv() => received,
            };

            let envelope = match received {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    log::info!("transfer stream closed peer={} total_messages={}", peer, messages);
                    return StreamStatus::Ok { messages };
                }
                Err(TransportError::Cancelled) => {
                    log::info!(
                        "transfer stream cancelled peer={} total_messages={}",
                        peer,
                        messages
                    );
                    return StreamStatus::Cancelled;
                }
                Err(err) => {
                    log::warn!("transfer stream recv error peer={} err={}", peer, err);
                    return StreamStatus::Unavailable {
                        message: format!("stream closed prematurely: {}", err),
                    };
                }
            };

            messages += 1;
            let reply = match self.handle_transaction(&peer, &envelope).await {
                Ok(reply) => reply,
                Err(ServiceError::Protocol(err)) => {
                    SecureEnvelope::from_error(envelope.id.clone(), err)
                }
                Err(ServiceError::Transport(err)) => {
                    log::error!(
                        "transfer stream aborted peer={} id={} err={}",
                        peer,
                        envelope.id,
                        err
                    );
                    return StreamStatus::Internal { message: err.to_string() };
                }
            };

            match stream.send(reply).await {
                Ok(()) => {}
                Err(TransportError::Cancelled) => {
                    log::info!(
                        "transfer stream cancelled during send peer={} total_messages={}",
                        peer,
                        messages
                    );
                    return StreamStatus::Cancelled;
                }
                Err(err) => {
                    log::error!("transfer stream send error peer={} err={}", peer, err);
                    return StreamStatus::Unavailable {
                        message: format!("stream closed prematurely: {}", err),
                    };
                }
            }

            log::info!(
                "streaming transfer request received peer={} id={} n_messages={}",
                peer,
                envelope.id,
                messages
            );
        }
    }

    /// Opens and validates one envelope, then hands the decoded transaction to
    /// the compliance handler.
    async fn handle_transaction(
        &self,
        peer: &Peer,
        envelope: &SecureEnvelope,
    ) -> Result<SecureEnvelope, ServiceError> {
        let payload = self.codec.open(envelope, self.identity.private_key()).map_err(|err| {
            log::error!(
                "could not open secure envelope peer={} id={} err={}",
                peer,
                envelope.id,
                err
            );
            err
        })?;

        if !payload.identity.is(IDENTITY_PAYLOAD_TYPE) {
            log::warn!(
                "unsupported identity type peer={} id={} type={}",
                peer,
                envelope.id,
                payload.identity.type_url
            );
            return Err(ProtocolError::new(
                ErrorCode::UnparseableIdentity,
                "ivms101.IdentityPayload payload identity type required",
            )
            .into());
        }

        if !payload.transaction.is(TRANSACTION_TYPE) {
            log::warn!(
                "unsupported transaction type peer={} id={} type={}",
                peer,
                envelope.id,
                payload.transaction.type_url
            );
            return Err(ProtocolError::new(
                ErrorCode::UnparseableTransaction,
                "trisa.data.generic.v1beta1.Transaction payload transaction type required",
            )
            .into());
        }

        let identity: IdentityPayload = payload.identity.unpack().map_err(|err| {
            log::error!(
                "could not unmarshal identity peer={} id={} err={}",
                peer,
                envelope.id,
                err
            );
            ProtocolError::new(ErrorCode::UnparseableIdentity, "could not unmarshal identity")
        })?;
        let transaction: Transaction = payload.transaction.unpack().map_err(|err| {
            log::error!(
                "could not unmarshal transaction peer={} id={} err={}",
                peer,
                envelope.id,
                err
            );
            ProtocolError::new(
                ErrorCode::UnparseableTransaction,
                "could not unmarshal transaction",
            )
        })?;

        let decoded = DecodedTransaction {
            envelope_id: envelope.id.clone(),
            identity,
            transaction,
            sent_at: payload.sent_at,
        };
        self.compliance.handle(peer, decoded).await
    }

    /// `ConfirmAddress` is not offered by this node.
    pub fn confirm_address(
        &self,
        address: &Address,
    ) -> Result<AddressConfirmation, ProtocolError> {
        log::info!("confirm address network={}", address.network);
        Err(ProtocolError::new(
            ErrorCode::Unimplemented,
            "this node has not implemented address confirmation",
        ))
    }

    /// Caches the caller's signing key and returns the node's own.
    pub fn key_exchange(
        &self,
        session: &PeerSession,
        key: &SigningKey,
    ) -> Result<SigningKey, ProtocolError> {
        let peer = self.authenticate(session, "request")?;
        log::info!("key exchange request received peer={}", peer);

        let parsed = PeerSigningKey::from_pkix(&key.data).map_err(|err| {
            log::error!(
                "could not parse incoming PKIX public key peer={} version={} algorithm={} err={}",
                peer,
                key.version,
                key.public_key_algorithm,
                err
            );
            ProtocolError::from(err)
        })?;
        log::debug!(
            "caching signing key peer={} algorithm={} bits={}",
            peer,
            parsed.algorithm(),
            parsed.bits()
        );
        peer.update_signing_key(parsed);

        self.identity.signing_key().map_err(|err| {
            log::error!("could not extract node signing key peer={} err={}", peer, err);
            ProtocolError::internal("could not return signing keys")
        })
    }

    /// Liveness probe, usable before authentication.
    pub fn status(&self, check: &HealthCheck) -> ServiceState {
        log::info!(
            "status check attempts={} last_checked_at={}",
            check.attempts,
            check.last_checked_at
        );

        let now = OffsetDateTime::now_utc();
        let status =
            if self.maintenance { ServingStatus::Maintenance } else { ServingStatus::Healthy };
        ServiceState {
            status,
            not_before: (now + STATUS_NOT_BEFORE).format(&Rfc3339).unwrap_or_default(),
            not_after: (now + STATUS_NOT_AFTER).format(&Rfc3339).unwrap_or_default(),
        }
    }
}
