//! Public client facade (C5, §4.5): `connect`/`disconnect`/`send`, the
//! reconnection loop, and the fluent configuration builder (§10.4).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{info, warn};

use crate::auth::{SigningKey, TokenProvider, DEFAULT_REFRESH_THRESHOLD};
use crate::connection::{Command, ConnectionActor, ConnectionOptions, ConnectionState, Submission};
use crate::error::{PushyError, Result};
use crate::notification::PushNotification;
use crate::observer::{ClientObserver, NoopObserver};
use crate::response::Response;
use crate::transport::{Http2Transport, Transport};

/// Which host pool the client talks to (§6 endpoints).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Production,
    Development,
}

impl Endpoint {
    fn default_host(&self) -> &'static str {
        match self {
            Self::Production => "api.push.apple.com",
            Self::Development => "api.sandbox.push.apple.com",
        }
    }
}

/// How the client authenticates to APNs.
#[derive(Clone)]
pub enum AuthMode {
    /// JWT bearer tokens minted from a signing key.
    Token(Arc<SigningKey>),
    /// Client TLS certificate; no bearer token is sent.
    Certificate(Arc<rustls::sign::CertifiedKey>),
}

/// Configuration for a [`Client`] (§10.4).
#[derive(Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub host: Option<String>,
    pub port: u16,
    pub auth: AuthMode,
    pub idle_ping_interval: Duration,
    pub ping_ack_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
    pub soft_queue_limit: usize,
    pub token_refresh_threshold: Duration,
    pub extra_trust_roots: Vec<Vec<u8>>,
}

impl ClientConfig {
    /// Start building a config authenticating with a signing key.
    pub fn with_signing_key(key: SigningKey) -> ClientBuilder {
        ClientBuilder::new(AuthMode::Token(Arc::new(key)))
    }

    /// Start building a config authenticating with a client certificate.
    pub fn with_certificate(identity: rustls::sign::CertifiedKey) -> ClientBuilder {
        ClientBuilder::new(AuthMode::Certificate(Arc::new(identity)))
    }

    fn authority(&self) -> String {
        let host = self
            .host
            .clone()
            .unwrap_or_else(|| self.endpoint.default_host().to_string());
        format!("{host}:{}", self.port)
    }
}

/// Builder for [`ClientConfig`]. Consumes and returns `Self`, matching the
/// teacher's `ApnsConfig::new(...).environment(...).development()` shape.
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    fn new(auth: AuthMode) -> Self {
        Self {
            config: ClientConfig {
                endpoint: Endpoint::Production,
                host: None,
                port: 443,
                auth,
                idle_ping_interval: crate::connection::DEFAULT_IDLE_PING_INTERVAL,
                ping_ack_timeout: crate::connection::DEFAULT_PING_ACK_TIMEOUT,
                graceful_shutdown_timeout: crate::connection::DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT,
                soft_queue_limit: crate::connection::DEFAULT_SOFT_QUEUE_LIMIT,
                token_refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
                extra_trust_roots: Vec::new(),
            },
        }
    }

    /// Use the production endpoint (default).
    pub fn production(mut self) -> Self {
        self.config.endpoint = Endpoint::Production;
        self
    }

    /// Use the development/sandbox endpoint.
    pub fn development(mut self) -> Self {
        self.config.endpoint = Endpoint::Development;
        self
    }

    /// Override the endpoint selector directly.
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.config.endpoint = endpoint;
        self
    }

    /// Override the host string (for a proxy or test server). Overrides the
    /// endpoint's default host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = Some(host.into());
        self
    }

    /// Set the port. APNs accepts 443 (default) and 2197.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn idle_ping_interval(mut self, interval: Duration) -> Self {
        self.config.idle_ping_interval = interval;
        self
    }

    pub fn ping_ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_ack_timeout = timeout;
        self
    }

    pub fn graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.graceful_shutdown_timeout = timeout;
        self
    }

    pub fn soft_queue_limit(mut self, limit: usize) -> Self {
        self.config.soft_queue_limit = limit;
        self
    }

    pub fn token_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.config.token_refresh_threshold = threshold;
        self
    }

    /// Trust an additional root certificate (DER-encoded) when verifying the
    /// server's TLS chain, in addition to the platform's trust store. Meant
    /// for pointing a client at a development or mock server presenting a
    /// self-signed certificate; real deployments should not need this.
    pub fn trust_root_certificate(mut self, certificate_der: impl Into<Vec<u8>>) -> Self {
        self.config.extra_trust_roots.push(certificate_der.into());
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

struct Inner {
    config: ClientConfig,
    observer: Arc<dyn ClientObserver>,
    token_provider: Option<Arc<TokenProvider>>,
    command_tx: Mutex<Option<mpsc::Sender<Command>>>,
    state_rx: watch::Receiver<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
    reconnect_attempts: AtomicU64,
}

/// The public client facade. Maintains a single logical connection and
/// reconnects it with exponential backoff on unexpected teardown (§4.5).
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Construct a client. Does not connect until [`Client::connect`] is
    /// called.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_observer(config, Arc::new(NoopObserver))
    }

    /// Construct a client reporting lifecycle events to `observer`.
    pub fn with_observer(config: ClientConfig, observer: Arc<dyn ClientObserver>) -> Self {
        let token_provider = match &config.auth {
            AuthMode::Token(key) => Some(Arc::new(TokenProvider::new(
                (**key).clone(),
                config.token_refresh_threshold,
            ))),
            AuthMode::Certificate(_) => None,
        };
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);

        Self {
            inner: Arc::new(Inner {
                config,
                observer,
                token_provider,
                command_tx: Mutex::new(None),
                state_rx,
                state_tx,
                reconnect_attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Open a connection and run the reconnection loop until
    /// [`Client::disconnect`] is called. Idempotent: returns immediately if
    /// already `Ready`.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut guard = self.inner.command_tx.lock().await;
            if guard.is_some() {
                return Err(PushyError::Fatal("already connected".into()));
            }
            let (tx, rx) = mpsc::channel(256);
            *guard = Some(tx);
            drop(guard);
            self.spawn_connection_loop(rx);
        }

        let mut state_rx = self.inner.state_rx.clone();
        while *state_rx.borrow() != ConnectionState::Ready {
            if state_rx.changed().await.is_err() {
                return Err(PushyError::transport_failure("connection loop exited"));
            }
        }
        Ok(())
    }

    fn spawn_connection_loop(&self, mut commands: mpsc::Receiver<Command>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                let _ = inner.state_tx.send(ConnectionState::Connecting);
                inner.observer.on_connecting();

                let authority = inner.config.authority();
                let (host, port_str) = authority.rsplit_once(':').unwrap_or((authority.as_str(), "443"));
                let port = port_str.parse().unwrap_or(443);

                let tls_config = Arc::new(tls_config_for(&inner.config.auth, &inner.config.extra_trust_roots));
                match Http2Transport::connect(host, port, tls_config).await {
                    Ok(transport) => {
                        backoff = Duration::from_secs(1);
                        inner.reconnect_attempts.store(0, Ordering::Relaxed);
                        let _ = inner.state_tx.send(ConnectionState::Ready);
                        inner.observer.on_ready();

                        run_connection(transport, &inner, &mut commands).await;

                        let _ = inner.state_tx.send(ConnectionState::Closed);
                        inner.observer.on_closed("connection ended");
                    }
                    Err(e) => {
                        warn!(error = %e, "connect failed");
                    }
                }

                if commands.is_closed() {
                    break;
                }

                inner.observer.on_reconnect_scheduled(backoff);
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                tokio::time::sleep(backoff + jitter).await;
                backoff = (backoff * 2).min(Duration::from_secs(60));
            }
        });
    }

    /// Send one notification on the current connection.
    pub async fn send(&self, notification: PushNotification) -> Result<Response> {
        let tx = {
            let guard = self.inner.command_tx.lock().await;
            guard.clone().ok_or(PushyError::NotConnected)?
        };

        let device_token = notification.device_token().to_string();
        self.inner.observer.notification_sent(&device_token);

        let (completion_tx, completion_rx) = oneshot::channel();
        tx.send(Command::Send(Submission {
            notification,
            completion: completion_tx,
        }))
        .await
        .map_err(|_| PushyError::NotConnected)?;

        let outcome = completion_rx.await.map_err(|_| PushyError::Cancelled)?;
        match &outcome {
            Ok(Response::Accepted { apns_id }) => {
                self.inner.observer.notification_accepted(&device_token, *apns_id);
            }
            Ok(Response::Rejected { reason, .. }) => {
                self.inner.observer.notification_rejected(&device_token, reason);
            }
            Err(_) => {}
        }
        outcome
    }

    /// Begin a graceful shutdown; resolves once the connection reaches
    /// `Closed`. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        let tx = {
            let mut guard = self.inner.command_tx.lock().await;
            guard.take()
        };
        let Some(tx) = tx else {
            return Ok(());
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(Command::Disconnect(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }

        let mut state_rx = self.inner.state_rx.clone();
        while *state_rx.borrow() != ConnectionState::Closed {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
        info!("client disconnected");
        Ok(())
    }

    /// Resolves the next time the connection reaches `Ready`. Used by
    /// callers to await recovery after a transport failure.
    pub async fn reconnection_future(&self) {
        let mut state_rx = self.inner.state_rx.clone();
        loop {
            if *state_rx.borrow() == ConnectionState::Ready {
                return;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The connection's current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }
}

async fn run_connection(
    transport: Http2Transport,
    inner: &Arc<Inner>,
    commands: &mut mpsc::Receiver<Command>,
) {
    let mut actor = ConnectionActor::new(
        transport,
        inner.config.authority(),
        inner.token_provider.clone(),
        ConnectionOptions {
            idle_ping_interval: inner.config.idle_ping_interval,
            ping_ack_timeout: inner.config.ping_ack_timeout,
            graceful_shutdown_timeout: inner.config.graceful_shutdown_timeout,
            soft_queue_limit: inner.config.soft_queue_limit,
        },
    )
    .with_observer(inner.observer.clone());
    actor.mark_ready();
    actor.run(commands).await;
}

/// Hands back the same pre-built [`rustls::sign::CertifiedKey`] on every
/// handshake. Used for [`AuthMode::Certificate`], where the caller already
/// parsed the client certificate and key (§6: "the core receives
/// already-parsed keys and certificates").
struct StaticClientCertResolver(Arc<rustls::sign::CertifiedKey>);

impl rustls::client::ResolvesClientCert for StaticClientCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[rustls::SignatureScheme],
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        Some(self.0.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

fn tls_config_for(auth: &AuthMode, extra_trust_roots: &[Vec<u8>]) -> rustls::ClientConfig {
    // Root trust is supplied by the embedding application in practice (via
    // `rustls-native-certs` or a pinned bundle); this default starts from
    // an empty store so `ClientConfig` builds without an extra certificate
    // store dependency, and callers wire in real roots before connecting.
    // `extra_trust_roots` (`ClientBuilder::trust_root_certificate`) covers
    // the development/mock-server case where there is no public CA to lean
    // on at all.
    let mut root_store = rustls::RootCertStore::empty();
    for der in extra_trust_roots {
        let cert = rustls::pki_types::CertificateDer::from(der.clone());
        if let Err(e) = root_store.add(cert) {
            warn!(error = %e, "failed to add trusted root certificate");
        }
    }
    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);
    match auth {
        AuthMode::Token(_) => builder.with_no_client_auth(),
        AuthMode::Certificate(identity) => {
            builder.with_client_cert_resolver(Arc::new(StaticClientCertResolver(identity.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signing_key() -> SigningKey {
        use p256::pkcs8::EncodePrivateKey;
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let pem = secret
            .to_pkcs8_pem(p256::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        SigningKey::from_pkcs8_pem("TEAM1234AB", "KEYID6789A", &pem).unwrap()
    }

    #[test]
    fn builder_defaults_match_spec() {
        let config = ClientConfig::with_signing_key(test_signing_key()).build();
        assert_eq!(config.port, 443);
        assert_eq!(config.endpoint, Endpoint::Production);
        assert_eq!(
            config.idle_ping_interval,
            crate::connection::DEFAULT_IDLE_PING_INTERVAL
        );
    }

    #[test]
    fn development_switches_the_endpoint() {
        let config = ClientConfig::with_signing_key(test_signing_key())
            .development()
            .build();
        assert_eq!(config.endpoint, Endpoint::Development);
        assert_eq!(config.authority(), "api.sandbox.push.apple.com:443");
    }

    #[tokio::test]
    async fn send_before_connect_fails_not_connected() {
        let client = Client::new(ClientConfig::with_signing_key(test_signing_key()).build());
        let notification = PushNotification::builder("a".repeat(64), b"{}".to_vec())
            .build()
            .unwrap();
        let err = client.send(notification).await.unwrap_err();
        assert_eq!(err.classification(), crate::error::Classification::NotConnected);
    }
}
