//! An in-process mock APNs server, built on the same `tokio` + `h2` +
//! `tokio-rustls` stack as the client, for integration tests that want a
//! real HTTP/2 round trip rather than an in-process stub (§10.5).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use h2::server::SendResponse;
use http::{Request, Response as HttpResponse};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::auth::VerificationKey;
use crate::response::RejectionReason;
use crate::server::rules::{self, Authorization, IncomingRequest};

/// Shared, mutable registry the mock server consults per request. Wrapped
/// in a single owner behind a mutex rather than scattered interior
/// mutability, per the §9 design note on shared key stores.
#[derive(Default)]
struct Registry {
    /// topic -> team id, for credentials that authorize many topics.
    authorized_topics: HashMap<String, String>,
    /// device token -> invalidation instant.
    invalidated_tokens: HashMap<String, SystemTime>,
    /// team id -> verification key.
    verification_keys: HashMap<String, VerificationKey>,
}

/// Builder for [`MockServer`]: pre-register authorized topics, invalidated
/// tokens, and per-team verification keys before `bind`.
#[derive(Default)]
pub struct MockServerBuilder {
    registry: Registry,
}

impl MockServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authorize `topic` for `team_id`.
    pub fn authorize_topic(mut self, topic: impl Into<String>, team_id: impl Into<String>) -> Self {
        self.registry.authorized_topics.insert(topic.into(), team_id.into());
        self
    }

    /// Record `device_token` as invalidated as of `at`.
    pub fn invalidate_token(mut self, device_token: impl Into<String>, at: SystemTime) -> Self {
        self.registry
            .invalidated_tokens
            .insert(device_token.into().to_ascii_lowercase(), at);
        self
    }

    /// Register the verification key for `team_id`'s bearer tokens.
    pub fn verification_key(mut self, team_id: impl Into<String>, key: VerificationKey) -> Self {
        self.registry.verification_keys.insert(team_id.into(), key);
        self
    }

    /// Bind a TLS listener on an ephemeral local port using a freshly
    /// generated self-signed development certificate.
    pub async fn bind(self) -> std::io::Result<MockServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;

        // Both SANs so a test client can connect via either "localhost" or
        // the loopback IP and still pass hostname verification.
        let cert = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .expect("self-signed dev certificate generation cannot fail for a fixed SAN list");
        let cert_der = CertificateDer::from(cert.cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(cert.key_pair.serialize_der())
            .expect("rcgen emits a DER private key rustls can parse");
        let cert_der_for_trust = cert_der.clone();

        let mut tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .expect("self-signed cert/key pair is well-formed");
        tls_config.alpn_protocols = vec![b"h2".to_vec()];

        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let registry = Arc::new(Mutex::new(self.registry));
        let certificate_der = cert_der_for_trust.clone();

        let handle = tokio::spawn(accept_loop(listener, acceptor, registry));

        Ok(MockServer {
            local_addr,
            handle,
            certificate_der,
        })
    }
}

/// A running mock server. Dropping it does not stop the accept loop;
/// call [`MockServer::shutdown`] to abort it.
pub struct MockServer {
    local_addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
    certificate_der: CertificateDer<'static>,
}

impl MockServer {
    /// The address to connect the client under test to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The self-signed certificate this server presents, so a test client
    /// can trust it via `ClientBuilder::trust_root_certificate` instead of
    /// disabling certificate verification.
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.certificate_der
    }

    /// Stop accepting new connections.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

async fn accept_loop(listener: TcpListener, acceptor: TlsAcceptor, registry: Arc<Mutex<Registry>>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "mock server accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, acceptor, registry).await {
                debug!(error = %e, "mock server connection ended");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    registry: Arc<Mutex<Registry>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let tls_stream = acceptor.accept(stream).await?;
    let mut connection = h2::server::handshake(tls_stream).await?;

    while let Some(result) = connection.accept().await {
        let (request, respond) = result?;
        let registry = registry.clone();
        tokio::spawn(async move {
            handle_request(request, respond, registry).await;
        });
    }
    Ok(())
}

async fn handle_request(
    request: Request<h2::RecvStream>,
    mut respond: SendResponse<bytes::Bytes>,
    registry: Arc<Mutex<Registry>>,
) {
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let topic = header(&request, "apns-topic");
    let collapse_id = header(&request, "apns-collapse-id");
    let priority = header(&request, "apns-priority");
    let apns_id = header(&request, "apns-id");
    let authorization = header(&request, "authorization");

    let mut body_stream = request.into_body();
    let mut body = Vec::new();
    while let Some(chunk) = body_stream.data().await {
        match chunk {
            Ok(bytes) => {
                let _ = body_stream.flow_control().release_capacity(bytes.len());
                body.extend_from_slice(&bytes);
            }
            Err(e) => {
                warn!(error = %e, "error reading mock request body");
                break;
            }
        }
    }

    let registry = registry.lock().await;
    let auth = authorize(&registry, topic.as_deref(), authorization.as_deref());

    let incoming = IncomingRequest {
        method: &method,
        path: &path,
        topic: topic.as_deref(),
        collapse_id: collapse_id.as_deref(),
        priority: priority.as_deref(),
        apns_id: apns_id.as_deref(),
        body: &body,
    };

    let outcome: Result<(), (RejectionReason, Option<SystemTime>)> =
        rules::validate(&incoming, &auth)
            .map_err(|reason| (reason, None))
            .and_then(|device_token| match registry.invalidated_tokens.get(&device_token) {
                Some(at) => Err((RejectionReason::Unregistered, Some(*at))),
                None => Ok(()),
            });

    let response_id = apns_id
        .and_then(|v| uuid::Uuid::parse_str(&v).ok())
        .unwrap_or_else(uuid::Uuid::new_v4);

    match outcome {
        Ok(()) => send_accept(&mut respond, response_id),
        Err((reason, timestamp)) => send_reject(&mut respond, response_id, reason, timestamp),
    }
}

fn authorize(registry: &Registry, topic: Option<&str>, authorization: Option<&str>) -> Authorization {
    let authorized_topics: Vec<String> = match topic {
        Some(topic) if registry.authorized_topics.contains_key(topic) => vec![topic.to_string()],
        Some(_) => Vec::new(),
        None => registry.authorized_topics.keys().cloned().collect(),
    };

    let auth_failure = match authorization {
        None => Some(RejectionReason::MissingProviderToken),
        Some(header_value) => {
            let Some(token) = header_value.strip_prefix("bearer ") else {
                return Authorization {
                    authorized_topics,
                    auth_failure: Some(RejectionReason::InvalidProviderToken),
                };
            };
            let team_id = topic.and_then(|t| registry.authorized_topics.get(t));
            match team_id.and_then(|team| registry.verification_keys.get(team)) {
                Some(key) => match crate::auth::verify(
                    token,
                    key,
                    std::time::Duration::from_secs(3600),
                    std::time::Duration::from_secs(60),
                ) {
                    Ok(()) => None,
                    Err(crate::auth::VerificationFailure::Expired) => {
                        Some(RejectionReason::ExpiredProviderToken)
                    }
                    Err(_) => Some(RejectionReason::InvalidProviderToken),
                },
                None => None,
            }
        }
    };

    Authorization {
        authorized_topics,
        auth_failure,
    }
}

fn header(request: &Request<h2::RecvStream>, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn send_accept(respond: &mut SendResponse<bytes::Bytes>, apns_id: uuid::Uuid) {
    let response = HttpResponse::builder()
        .status(200)
        .header("apns-id", apns_id.to_string())
        .body(())
        .expect("status and header values are always valid here");
    match respond.send_response(response, true) {
        Ok(_) => {}
        Err(e) => warn!(error = %e, "failed to send mock accept response"),
    }
}

fn send_reject(
    respond: &mut SendResponse<bytes::Bytes>,
    apns_id: uuid::Uuid,
    reason: RejectionReason,
    timestamp: Option<SystemTime>,
) {
    #[derive(serde::Serialize)]
    struct ErrorBody {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    }

    let body = ErrorBody {
        reason: reason.canonical_text().to_string(),
        timestamp: timestamp.map(|t| {
            t.duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        }),
    };
    let payload = serde_json::to_vec(&body).unwrap_or_default();

    let response = HttpResponse::builder()
        .status(reason.status_code())
        .header("apns-id", apns_id.to_string())
        .header("content-length", payload.len())
        .body(())
        .expect("status and header values are always valid here");

    match respond.send_response(response, false) {
        Ok(mut send_stream) => {
            if let Err(e) = send_stream.send_data(bytes::Bytes::from(payload), true) {
                warn!(error = %e, "failed to send mock rejection body");
            }
        }
        Err(e) => warn!(error = %e, "failed to send mock rejection headers"),
    }
}
