#![allow(dead_code)]

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use trisa_node::envelope::{EnvelopeCodec, HmacEnvelopeCodec};
use trisa_node::{
    ComplianceHandler, DecodedTransaction, NodeIdentity, Peer, PeerRegistry, PeerSession,
    PeerSigningKey, ServiceError, TrisaService,
};
use trisa_protocol::{
    Any, IdentityPayload, Party, Payload, SecureEnvelope, SigningKey, Transaction,
    IDENTITY_PAYLOAD_TYPE, TRANSACTION_TYPE,
};

pub const COUNTERPARTY: &str = "counterparty.example.test";

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

pub fn fixture_bytes(name: &str) -> Vec<u8> {
    std::fs::read(fixture(name)).expect("read fixture")
}

pub fn identity() -> Arc<NodeIdentity> {
    let identity = NodeIdentity::load(&fixture("server-bundle.pem"), &fixture("ca.pem"))
        .expect("load node identity");
    Arc::new(identity)
}

pub fn certificates(bundle: &str) -> Vec<CertificateDer<'static>> {
    let mut reader = BufReader::new(File::open(fixture(bundle)).expect("open bundle"));
    rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>().expect("parse certs")
}

/// Session as presented by the counterparty's client certificate.
pub fn client_session() -> PeerSession {
    let remote = "127.0.0.1:40000".parse().expect("addr");
    PeerSession::new(certificates("client-bundle.pem"), Some(remote))
}

pub fn signing_key(fixture_name: &str) -> SigningKey {
    SigningKey {
        version: 3,
        signature_algorithm: "SHA256-RSA".into(),
        public_key_algorithm: "RSA".into(),
        data: fixture_bytes(fixture_name),
        ..SigningKey::default()
    }
}

/// Service with a registry the test can inspect and a counting handler.
pub struct Harness {
    pub registry: Arc<PeerRegistry>,
    pub compliance: Arc<CountingCompliance>,
    pub service: TrisaService,
}

pub fn harness() -> Harness {
    let registry = Arc::new(PeerRegistry::new());
    let compliance = Arc::new(CountingCompliance::default());
    let service =
        TrisaService::new(identity(), registry.clone()).with_compliance(compliance.clone());
    Harness { registry, compliance, service }
}

/// Same as [`harness`] with the counterparty's signing key already cached.
pub fn keyed_harness() -> Harness {
    let harness = harness();
    let key = PeerSigningKey::from_pkix(&fixture_bytes("peer-rsa-a.der")).expect("peer key");
    harness.registry.get_or_insert(COUNTERPARTY).update_signing_key(key);
    harness
}

/// Accepts every transaction and echoes an envelope with the same id.
#[derive(Default)]
pub struct CountingCompliance {
    calls: AtomicUsize,
}

impl CountingCompliance {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComplianceHandler for CountingCompliance {
    async fn handle(
        &self,
        peer: &Peer,
        transaction: DecodedTransaction,
    ) -> Result<SecureEnvelope, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = peer.signing_key().expect("key cached before compliance");
        let payload = Payload {
            received_at: "2024-01-01T00:00:01Z".into(),
            ..payload_with(IDENTITY_PAYLOAD_TYPE, TRANSACTION_TYPE, &transaction.transaction.txid)
        };
        Ok(HmacEnvelopeCodec.seal(&transaction.envelope_id, &payload, &key)?)
    }
}

pub fn payload_with(identity_type: &str, transaction_type: &str, txid: &str) -> Payload {
    let identity = IdentityPayload {
        originator: Some(Party { name: "Alice".into(), ..Party::default() }),
        beneficiary: Some(Party { name: "Bob".into(), ..Party::default() }),
        ..IdentityPayload::default()
    };
    let transaction = Transaction {
        txid: txid.into(),
        originator: "addr-a".into(),
        beneficiary: "addr-b".into(),
        amount: 0.25,
        network: "BTC".into(),
        ..Transaction::default()
    };
    Payload {
        identity: Any::pack(identity_type, &identity).expect("pack identity"),
        transaction: Any::pack(transaction_type, &transaction).expect("pack transaction"),
        sent_at: "2024-01-01T00:00:00Z".into(),
        received_at: String::new(),
    }
}

pub fn envelope(id: &str) -> SecureEnvelope {
    envelope_with(id, IDENTITY_PAYLOAD_TYPE, TRANSACTION_TYPE)
}

pub fn envelope_with(id: &str, identity_type: &str, transaction_type: &str) -> SecureEnvelope {
    let recipient = PeerSigningKey::from_pkix(&fixture_bytes("peer-rsa-b.der")).expect("key");
    HmacEnvelopeCodec
        .seal(id, &payload_with(identity_type, transaction_type, id), &recipient)
        .expect("seal")
}
