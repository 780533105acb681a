//! Crate-wide error types.

use thiserror::Error;

/// Result type for pushy operations.
pub type Result<T> = std::result::Result<T, PushyError>;

/// Errors produced by the client engine.
///
/// Every variant maps to one of the kinds in the error-handling design: local
/// validation, local backpressure, remote rejection, remote auth rejection,
/// transport failure, or a fatal construction-time error.
/// [`PushyError::classification`] groups variants into that taxonomy for
/// callers that want to branch on retryability without an exhaustive match.
#[derive(Debug, Error)]
pub enum PushyError {
    /// The notification failed local validation before anything was sent.
    #[error("notification failed local validation: {0:?}")]
    LocalRejection(crate::response::RejectionReason),

    /// No ready connection was available to carry the submission.
    #[error("not connected")]
    NotConnected,

    /// The in-memory soft queue is full; the caller should back off.
    #[error("local backpressure: queue is full")]
    Backpressure,

    /// The submission was cancelled before it reached the wire.
    #[error("submission cancelled")]
    Cancelled,

    /// The connection was torn down (transport error, GOAWAY, idle timeout)
    /// while the submission was in flight. Safe to retry on a new connection.
    #[error("transport failure, safe to retry: {0}")]
    TransportFailure(String),

    /// The signing key itself was rejected by the peer; unlike
    /// `AuthRejected`, this is not resolved by minting a fresh token.
    #[error("signing key rejected: {0}")]
    KeyRejected(String),

    /// The peer rejected our bearer token (`ExpiredProviderToken`,
    /// `InvalidProviderToken`, `MissingProviderToken`). Submissions surface
    /// this family as `Ok(Response::Rejected{..})` rather than this variant
    /// (the token cache is invalidated as a side effect either way); this
    /// variant exists for callers that classify a raw `Response` through
    /// [`crate::response::Response::classification`] and want the same
    /// `Classification::AuthRejection` bucket available on the error side.
    #[error("auth token rejected: {0:?}")]
    AuthRejected(crate::response::RejectionReason),

    /// Construction-time failure: malformed key, unsupported algorithm, bad
    /// host configuration. The object that produced this is unusable.
    #[error("fatal construction error: {0}")]
    Fatal(String),

    /// Underlying HTTP/2 framing error.
    #[error("http/2 error: {0}")]
    Http2(#[from] h2::Error),

    /// TLS/IO error establishing or maintaining the transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed response body.
    #[error("response decoding error: {0}")]
    Decode(#[from] serde_json::Error),

    /// JWT construction/signing error.
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Invalid PEM/DER key material supplied at construction time.
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
}

/// Coarse-grained grouping of [`PushyError`] variants, mirroring §7 of the
/// design. Callers that only care whether a failure is safe to retry, a
/// permanent rejection, or a bug in their own setup can match on this instead
/// of every `PushyError` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Malformed input caught before any network traffic.
    Validation,
    /// No ready connection; safe to retry once reconnected.
    NotConnected,
    /// The server rejected the notification; do not retry as-is.
    ServerRejection,
    /// `UNREGISTERED`; stop sending to this token.
    TokenInvalidated,
    /// Bearer token was rejected; a fresh token will be used automatically.
    AuthRejection,
    /// Transport-level failure; safe to retry once reconnected.
    Transport,
    /// Unusable object; fix the caller's configuration.
    Fatal,
}

impl PushyError {
    /// Classify this error per §7 of the design.
    pub fn classification(&self) -> Classification {
        match self {
            Self::LocalRejection(_) => Classification::Validation,
            Self::NotConnected | Self::Backpressure | Self::Cancelled => {
                Classification::NotConnected
            }
            Self::TransportFailure(_) | Self::Http2(_) | Self::Io(_) => Classification::Transport,
            Self::KeyRejected(_) | Self::Fatal(_) | Self::InvalidKey(_) => Classification::Fatal,
            Self::AuthRejected(_) => Classification::AuthRejection,
            Self::Decode(_) | Self::Jwt(_) => Classification::Fatal,
        }
    }

    /// Whether retrying the same submission (unmodified) on a fresh
    /// connection is safe.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Classification::NotConnected | Classification::Transport
        )
    }

    /// Construct the `TransportFailure` variant used whenever in-flight
    /// submissions are force-failed on teardown (GOAWAY past the high-water
    /// mark, idle-ping timeout, connection close).
    pub fn transport_failure(reason: impl Into<String>) -> Self {
        Self::TransportFailure(reason.into())
    }
}
