//! Observation hooks for callers that want visibility into connection
//! lifecycle events without the core depending on any particular
//! metrics stack (§9 design note, §10.6).

/// Connection-lifecycle events a [`crate::client::Client`] reports as they
/// happen. Implement this to wire up metrics; the default is a no-op.
pub trait ClientObserver: Send + Sync {
    /// A connection attempt started.
    fn on_connecting(&self) {}

    /// A connection reached `Ready`.
    fn on_ready(&self) {}

    /// A connection began draining after `GOAWAY` or a local disconnect.
    fn on_draining(&self, last_stream_id: u32) {
        let _ = last_stream_id;
    }

    /// A connection reached `Closed`.
    fn on_closed(&self, reason: &str) {
        let _ = reason;
    }

    /// The reconnection loop is about to sleep before the next attempt.
    fn on_reconnect_scheduled(&self, delay: std::time::Duration) {
        let _ = delay;
    }

    /// A submission was handed to a connection for sending.
    fn notification_sent(&self, device_token: &str) {
        let _ = device_token;
    }

    /// A submission was accepted by the server.
    fn notification_accepted(&self, device_token: &str, apns_id: uuid::Uuid) {
        let _ = (device_token, apns_id);
    }

    /// A submission was rejected by the server or locally.
    fn notification_rejected(&self, device_token: &str, reason: &crate::response::RejectionReason) {
        let _ = (device_token, reason);
    }
}

/// The default observer: does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ClientObserver for NoopObserver {}
