//! Maps HTTP/2 stream IDs to pending submissions and resolves them exactly
//! once (C3, §4.3).

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::PushyError;
use crate::notification::PushNotification;
use crate::response::Response;

/// A hard cap on accumulated response-body bytes per stream. APNs error
/// bodies are a short JSON object; anything larger indicates a
/// misbehaving peer rather than a legitimate response.
const MAX_BODY_ACCUMULATION: usize = 16 * 1024;

/// One response-pending submission. Kept by the stream table from
/// `register` until `complete` or `fail_all` resolves it.
pub struct PendingSubmission {
    /// Kept for diagnostics (logging, panics-never-lose-context); not read
    /// by the table itself.
    pub notification: PushNotification,
    completion: Option<oneshot::Sender<crate::error::Result<Response>>>,
    body: Vec<u8>,
    status: Option<u16>,
    apns_id_header: Option<String>,
}

impl PendingSubmission {
    fn new(
        notification: PushNotification,
        completion: oneshot::Sender<crate::error::Result<Response>>,
    ) -> Self {
        Self {
            notification,
            completion: Some(completion),
            body: Vec::new(),
            status: None,
            apns_id_header: None,
        }
    }
}

/// The stream ID → pending-submission map for one connection.
///
/// Not internally synchronized: the connection task is the single writer
/// (§5), so the table is a plain `HashMap` driven from one place.
#[derive(Default)]
pub struct StreamTable {
    entries: HashMap<u32, PendingSubmission>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of submissions currently awaiting a response.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a newly opened stream, immediately after the transport
    /// allocates it and before any further frames go out (invariant I1).
    pub fn register(
        &mut self,
        stream_id: u32,
        notification: PushNotification,
        completion: oneshot::Sender<crate::error::Result<Response>>,
    ) {
        self.entries
            .insert(stream_id, PendingSubmission::new(notification, completion));
    }

    /// Record the response status and `apns-id` header once headers arrive.
    pub fn record_headers(&mut self, stream_id: u32, status: u16, apns_id_header: Option<String>) {
        if let Some(entry) = self.entries.get_mut(&stream_id) {
            entry.status = Some(status);
            entry.apns_id_header = apns_id_header;
        }
    }

    /// Append a fragment of the response body. Fails closed (and fails the
    /// submission) if the accumulator would exceed the hard cap.
    pub fn accumulate(&mut self, stream_id: u32, bytes: &[u8]) {
        let Some(entry) = self.entries.get_mut(&stream_id) else {
            return;
        };
        if entry.body.len() + bytes.len() > MAX_BODY_ACCUMULATION {
            if let Some(entry) = self.entries.remove(&stream_id) {
                resolve(entry, Err(PushyError::transport_failure(
                    "response body exceeded the accumulation cap",
                )));
            }
            return;
        }
        entry.body.extend_from_slice(bytes);
    }

    /// Resolve on end-of-stream: decode via the wire codec and complete the
    /// submission exactly once, removing it from the table (invariant I2).
    /// Returns the decoded response so the caller can react to it (e.g.
    /// invalidating an auth-token cache on an auth rejection) without a
    /// second decode.
    pub fn complete(&mut self, stream_id: u32) -> Option<Response> {
        let entry = self.entries.remove(&stream_id)?;
        let status = entry.status.unwrap_or(0);
        let response = crate::codec::decode_response(status, entry.apns_id_header.as_deref(), &entry.body);
        let returned = response.clone();
        resolve(entry, Ok(response));
        Some(returned)
    }

    /// Resolve every outstanding entry with a transport-failure outcome
    /// marked safe to retry. Called exactly once per connection, on
    /// teardown.
    pub fn fail_all(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        for (_, entry) in self.entries.drain() {
            resolve(
                entry,
                Err(PushyError::transport_failure(reason.clone())),
            );
        }
    }

    /// Resolve a single stream with a transport-failure outcome, e.g. a
    /// stream reset reported only for that stream.
    pub fn fail_one(&mut self, stream_id: u32, reason: impl Into<String>) {
        if let Some(entry) = self.entries.remove(&stream_id) {
            resolve(entry, Err(PushyError::transport_failure(reason.into())));
        }
    }

    /// Resolve every entry with a stream ID greater than `last_stream_id`
    /// with a transport-failure outcome, per the `GOAWAY` draining rule
    /// (§4.4): these streams were registered locally but the peer will
    /// never process them.
    pub fn fail_above(&mut self, last_stream_id: u32) {
        let stale: Vec<u32> = self
            .entries
            .keys()
            .copied()
            .filter(|id| *id > last_stream_id)
            .collect();
        for id in stale {
            if let Some(entry) = self.entries.remove(&id) {
                resolve(
                    entry,
                    Err(PushyError::transport_failure(
                        "stream was never processed before GOAWAY",
                    )),
                );
            }
        }
    }
}

fn resolve(mut entry: PendingSubmission, outcome: crate::error::Result<Response>) {
    if let Some(sender) = entry.completion.take() {
        let _ = sender.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification() -> PushNotification {
        PushNotification::builder("a".repeat(64), b"{}".to_vec())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn complete_resolves_the_waiting_future() {
        let mut table = StreamTable::new();
        let (tx, rx) = oneshot::channel();
        table.register(1, notification(), tx);
        table.record_headers(1, 200, Some(uuid::Uuid::nil().to_string()));
        table.complete(1);

        let response = rx.await.unwrap().unwrap();
        assert!(matches!(response, Response::Accepted { .. }));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn fail_all_resolves_every_pending_entry() {
        let mut table = StreamTable::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx3, rx3) = oneshot::channel();
        table.register(1, notification(), tx1);
        table.register(3, notification(), tx3);

        table.fail_all("connection closed");

        assert!(rx1.await.unwrap().is_err());
        assert!(rx3.await.unwrap().is_err());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn fail_above_only_resolves_streams_past_the_watermark() {
        let mut table = StreamTable::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx5, rx5) = oneshot::channel();
        table.register(1, notification(), tx1);
        table.register(5, notification(), tx5);

        table.fail_above(3);

        assert!(rx5.await.unwrap().is_err());
        assert_eq!(table.len(), 1);
        drop(rx1);
    }

    #[tokio::test]
    async fn accumulation_cap_fails_the_submission_instead_of_growing_forever() {
        let mut table = StreamTable::new();
        let (tx, rx) = oneshot::channel();
        table.register(7, notification(), tx);
        table.record_headers(7, 500, None);

        let chunk = vec![0u8; MAX_BODY_ACCUMULATION];
        table.accumulate(7, &chunk);
        table.accumulate(7, &[0u8; 1]);

        assert!(table.is_empty());
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn interleaved_streams_resolve_independently() {
        let mut table = StreamTable::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx3, rx3) = oneshot::channel();
        table.register(1, notification(), tx1);
        table.register(3, notification(), tx3);

        table.record_headers(3, 200, Some(uuid::Uuid::nil().to_string()));
        table.accumulate(1, b"{\"reason\":");
        table.record_headers(1, 400, None);
        table.accumulate(1, b"\"BadTopic\"}");
        table.complete(3);
        table.complete(1);

        assert!(matches!(
            rx3.await.unwrap().unwrap(),
            Response::Accepted { .. }
        ));
        assert!(matches!(
            rx1.await.unwrap().unwrap(),
            Response::Rejected { .. }
        ));
    }
}
