//! Listener lifecycle and per-connection call dispatch.
//!
//! Every accepted connection is authenticated with mutual TLS and then
//! carries a sequence of framed [`Call`]s. `OpenStream` switches the
//! connection into streaming mode for the rest of its life.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use trisa_protocol::codec::{read_frame, write_frame};
use trisa_protocol::{Call, ProtocolError, Reply};

use crate::config::NodeConfig;
use crate::error::{NodeError, ServiceError};
use crate::peers::{PeerRegistry, PeerSession};
use crate::service::TrisaService;
use crate::stream::FramedEnvelopeStream;
use crate::trust::NodeIdentity;

/// Connections that have not completed the TLS handshake by then are dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on delivering the terminal status of a stream.
const STREAM_STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before accepting again after the process ran out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// errno values reported by accept(2) when descriptors or buffers run out.
const ENOMEM: i32 = 12;
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;
const ENOBUFS: i32 = 105;

type Outcome = Result<(), NodeError>;

/// Shared state between the server handle, the accept loop and every
/// connection task.
struct Lifecycle {
    started: AtomicBool,
    stopping: AtomicBool,
    /// Stops the accept loop, pending handshakes and idle connections.
    drain: CancellationToken,
    /// Parent of every stream's cancellation token.
    abort: CancellationToken,
    tracker: TaskTracker,
    accept_task: StdMutex<Option<JoinHandle<Option<TcpListener>>>>,
    errc_tx: mpsc::Sender<Outcome>,
    errc_rx: Mutex<mpsc::Receiver<Outcome>>,
}

impl Lifecycle {
    fn new() -> Self {
        let (errc_tx, errc_rx) = mpsc::channel(1);
        Self {
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            drain: CancellationToken::new(),
            abort: CancellationToken::new(),
            tracker: TaskTracker::new(),
            accept_task: StdMutex::new(None),
            errc_tx,
            errc_rx: Mutex::new(errc_rx),
        }
    }

    /// First outcome wins; later reports are dropped.
    fn report(&self, outcome: Outcome) {
        if let Err(err) = self.errc_tx.try_send(outcome) {
            log::debug!("serve outcome already reported err={}", err);
        }
    }

    async fn wait(&self) -> Outcome {
        let mut errc = self.errc_rx.lock().await;
        errc.recv().await.unwrap_or(Ok(()))
    }
}

/// How the accept loop reacts to a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// The pending connection died before it was accepted.
    Connection,
    /// Descriptors or buffers are exhausted; retry after a pause.
    Resources,
    /// The listener itself is unusable.
    Fatal,
}

impl AcceptFailure {
    fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut => return Self::Connection,
            _ => {}
        }
        match err.raw_os_error() {
            Some(ENOMEM | ENFILE | EMFILE | ENOBUFS) => Self::Resources,
            _ => Self::Fatal,
        }
    }
}

pub struct Server {
    config: NodeConfig,
    identity: Arc<NodeIdentity>,
    service: Arc<TrisaService>,
    lifecycle: Arc<Lifecycle>,
}

impl Server {
    /// Loads the node identity and builds the default service.
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let identity =
            Arc::new(NodeIdentity::load(&config.server_certs, &config.server_cert_pool)?);
        log::debug!("node identity loaded pool_size={}", identity.pool_size());
        let service = TrisaService::new(Arc::clone(&identity), Arc::new(PeerRegistry::new()))
            .with_maintenance(config.maintenance);
        Ok(Self::with_service(config, identity, service))
    }

    /// Builds a server around an already configured service.
    pub fn with_service(
        config: NodeConfig,
        identity: Arc<NodeIdentity>,
        service: TrisaService,
    ) -> Self {
        Self {
            config,
            identity,
            service: Arc::new(service),
            lifecycle: Arc::new(Lifecycle::new()),
        }
    }

    pub fn service(&self) -> &TrisaService {
        &self.service
    }

    /// Binds the listener and spawns the accept loop.
    ///
    /// Bind failures are returned immediately and leave the server
    /// startable. The bound address is returned so callers can use port `0`.
    pub async fn start(&self) -> Result<SocketAddr, NodeError> {
        if self.lifecycle.started.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyStarted);
        }
        match self.bind().await {
            Ok(local) => Ok(local),
            Err(err) => {
                self.lifecycle.started.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn bind(&self) -> Result<SocketAddr, NodeError> {
        let acceptor = TlsAcceptor::from(self.identity.server_config()?);
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| NodeError::Bind { addr: addr.clone(), source })?;
        let local = listener.local_addr().map_err(NodeError::Serve)?;
        log::info!("trisa server started listen={} version={}", local, crate::VERSION);

        let handle = tokio::spawn(accept_loop(
            listener,
            acceptor,
            Arc::clone(&self.service),
            Arc::clone(&self.lifecycle),
        ));
        if let Ok(mut slot) = self.lifecycle.accept_task.lock() {
            *slot = Some(handle);
        }
        Ok(local)
    }

    /// Starts the server and blocks until it stops.
    ///
    /// An interrupt signal triggers [`Server::shutdown`]; a second interrupt
    /// while draining triggers [`Server::abort`].
    pub async fn serve(self: Arc<Self>) -> Result<(), NodeError> {
        self.start().await?;
        let signals = tokio::spawn(Arc::clone(&self).watch_signals());
        let outcome = self.wait().await;
        signals.abort();
        outcome
    }

    /// Waits for the first reported outcome: a clean shutdown or a fatal
    /// serve error.
    pub async fn wait(&self) -> Result<(), NodeError> {
        self.lifecycle.wait().await
    }

    /// Gracefully stops the server.
    ///
    /// New connections are refused, pending handshakes and idle connections
    /// are closed, and in-flight calls and streams run to completion before
    /// the listening socket is released. Returns `false` if another shutdown
    /// is already in progress or completed.
    pub async fn shutdown(&self) -> bool {
        if self
            .lifecycle
            .stopping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("shutdown already in progress");
            return false;
        }

        log::info!("gracefully shutting down");
        self.lifecycle.drain.cancel();

        let accept_task = self.lifecycle.accept_task.lock().ok().and_then(|mut slot| slot.take());
        let listener = match accept_task {
            Some(handle) => handle.await.ok().flatten(),
            None => None,
        };

        self.lifecycle.tracker.close();
        self.lifecycle.tracker.wait().await;
        drop(listener);

        log::info!("successful shutdown");
        self.lifecycle.report(Ok(()));
        true
    }

    /// Cancels every in-flight stream, including replies blocked on a peer
    /// that stopped reading. Does not stop the listener.
    pub fn abort(&self) {
        log::warn!("aborting in-flight calls");
        self.lifecycle.abort.cancel();
    }

    async fn watch_signals(self: Arc<Self>) {
        if let Err(err) = tokio::signal::ctrl_c().await {
            self.lifecycle.report(Err(NodeError::Signal(err)));
            return;
        }
        log::info!("interrupt received, draining connections");

        let server = Arc::clone(&self);
        let forced = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                server.abort();
            }
        });
        self.shutdown().await;
        forced.abort();
    }
}

/// Accepts connections until drained. Hands the listener back so the socket
/// outlives the in-flight connections.
async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    service: Arc<TrisaService>,
    lifecycle: Arc<Lifecycle>,
) -> Option<TcpListener> {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = lifecycle.drain.cancelled() => return Some(listener),
            accepted = listener.accept() => accepted,
        };

        let err = match accepted {
            Ok((tcp, remote)) => {
                lifecycle.tracker.spawn(handle_connection(
                    tcp,
                    remote,
                    acceptor.clone(),
                    Arc::clone(&service),
                    Arc::clone(&lifecycle),
                ));
                continue;
            }
            Err(err) => err,
        };

        match AcceptFailure::classify(&err) {
            AcceptFailure::Connection => {
                log::debug!("pending connection dropped before accept err={}", err);
            }
            AcceptFailure::Resources => {
                log::warn!("accept failed, backing off err={}", err);
                tokio::select! {
                    _ = lifecycle.drain.cancelled() => return Some(listener),
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
            AcceptFailure::Fatal => {
                log::error!("accept failed err={}", err);
                lifecycle.report(Err(NodeError::Serve(err)));
                return None;
            }
        }
    }
}

async fn handle_connection(
    tcp: TcpStream,
    remote: SocketAddr,
    acceptor: TlsAcceptor,
    service: Arc<TrisaService>,
    lifecycle: Arc<Lifecycle>,
) {
    let handshake = tokio::select! {
        biased;
        _ = lifecycle.drain.cancelled() => {
            log::debug!("handshake abandoned on shutdown remote={}", remote);
            return;
        }
        _ = lifecycle.abort.cancelled() => return,
        handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)) => handshake,
    };
    let tls = match handshake {
        Ok(Ok(tls)) => tls,
        Ok(Err(err)) => {
            log::warn!("tls handshake failed remote={} err={}", remote, err);
            return;
        }
        Err(_) => {
            log::warn!("tls handshake timed out remote={}", remote);
            return;
        }
    };
    let session = PeerSession::from_connection(tls.get_ref().1, Some(remote));
    let (mut reader, mut writer) = tokio::io::split(tls);

    loop {
        let call = tokio::select! {
            biased;
            _ = lifecycle.drain.cancelled() => break,
            call = read_frame::<Call, _>(&mut reader) => call,
        };
        let call = match call {
            Ok(Some(call)) => call,
            Ok(None) => break,
            Err(err) => {
                log::warn!("rpc read failed remote={} err={}", remote, err);
                break;
            }
        };
        log::debug!("rpc call remote={} method={}", remote, call.method());

        let reply = match call {
            Call::Transfer(envelope) => match service.transfer(&session, envelope).await {
                Ok(reply) => Reply::Envelope(reply),
                Err(err) => Reply::Failed(unary_failure(err)),
            },
            Call::ConfirmAddress(address) => match service.confirm_address(&address) {
                Ok(confirmation) => Reply::AddressConfirmation(confirmation),
                Err(err) => Reply::Failed(err),
            },
            Call::KeyExchange(key) => match service.key_exchange(&session, &key) {
                Ok(key) => Reply::SigningKey(key),
                Err(err) => Reply::Failed(err),
            },
            Call::Status(check) => Reply::ServiceState(service.status(&check)),
            Call::OpenStream => {
                run_stream(&service, &session, reader, writer, &lifecycle).await;
                return;
            }
        };

        let written = tokio::select! {
            biased;
            _ = lifecycle.abort.cancelled() => {
                log::warn!("rpc reply abandoned on abort remote={}", remote);
                return;
            }
            written = write_frame(&mut writer, &reply) => written,
        };
        if let Err(err) = written {
            log::warn!("rpc write failed remote={} err={}", remote, err);
            break;
        }
    }

    if let Err(err) = writer.shutdown().await {
        log::debug!("connection close failed remote={} err={}", remote, err);
    }
}

async fn run_stream(
    service: &TrisaService,
    session: &PeerSession,
    reader: ReadHalf<TlsStream<TcpStream>>,
    writer: WriteHalf<TlsStream<TcpStream>>,
    lifecycle: &Lifecycle,
) {
    let remote = session.remote_addr();
    let cancel = lifecycle.abort.child_token();
    let mut stream = FramedEnvelopeStream::new(reader, writer, cancel.clone());
    let status = service.transfer_stream(session, &mut stream, &cancel).await;
    log::debug!("transfer stream finished remote={:?} status={:?}", remote, status);
    match tokio::time::timeout(STREAM_STATUS_TIMEOUT, stream.finish(&status)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            log::debug!("could not deliver stream status remote={:?} err={}", remote, err);
        }
        Err(_) => log::debug!("stream status delivery timed out remote={:?}", remote),
    }
}

/// Transport and internal faults are not leaked to unary callers.
fn unary_failure(err: ServiceError) -> ProtocolError {
    match err {
        ServiceError::Protocol(err) => err,
        ServiceError::Transport(err) => {
            log::error!("unary transfer failed err={}", err);
            ProtocolError::internal("request could not be processed")
        }
    }
}
