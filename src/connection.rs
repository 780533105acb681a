//! Per-connection lifecycle state machine (C4, §4.4) — owns exactly one
//! `Transport`, runs on a single task (§5's single-writer discipline), and
//! drives the stream correlator.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::codec;
use crate::error::{PushyError, Result};
use crate::notification::PushNotification;
use crate::observer::{ClientObserver, NoopObserver};
use crate::response::Response;
use crate::stream_table::StreamTable;
use crate::transport::{ConnectionEvent, StreamEvent, Transport, TransportStream};

/// Server-advertised default before the first `SETTINGS` frame arrives.
const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 1500;

/// Default idle interval before sending a keepalive `PING` (§4.4).
pub const DEFAULT_IDLE_PING_INTERVAL: Duration = Duration::from_secs(60);

/// Default window to wait for a `PING` ack before declaring the
/// connection dead.
pub const DEFAULT_PING_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on how long `Draining` waits before force-failing the
/// remaining streams (§5 timeouts).
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default in-memory queue depth once the concurrent-stream cap is hit
/// (§4.4 ready-state rules).
pub const DEFAULT_SOFT_QUEUE_LIMIT: usize = 2048;

/// The connection's externally observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Draining,
    Closed,
}

/// A submission handed to the connection task: the notification, whether
/// to bear a JWT (vs. mTLS), and where to deliver the eventual outcome.
pub struct Submission {
    pub notification: PushNotification,
    pub completion: oneshot::Sender<Result<Response>>,
}

/// Commands the facade sends into the connection task.
pub enum Command {
    Send(Submission),
    Disconnect(oneshot::Sender<()>),
}

/// Tunables governing one connection's behavior, independent of host/port
/// (those live in `ClientConfig`).
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub idle_ping_interval: Duration,
    pub ping_ack_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
    pub soft_queue_limit: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            idle_ping_interval: DEFAULT_IDLE_PING_INTERVAL,
            ping_ack_timeout: DEFAULT_PING_ACK_TIMEOUT,
            graceful_shutdown_timeout: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT,
            soft_queue_limit: DEFAULT_SOFT_QUEUE_LIMIT,
        }
    }
}

/// Runs one connection's lifecycle to completion, driving `transport` and
/// reacting to `commands` until the connection reaches `Closed`.
///
/// This is the single-writer context of §5: everything that touches
/// `StreamTable`, the next-stream-id counter, and `state` happens on the
/// task that calls this function.
pub struct ConnectionActor<T: Transport> {
    transport: T,
    authority: String,
    token_provider: Option<std::sync::Arc<TokenProvider>>,
    options: ConnectionOptions,
    state: ConnectionState,
    table: StreamTable,
    next_stream_id: u32,
    last_stream_id_sent: u32,
    max_concurrent_streams: u32,
    queued: VecDeque<Submission>,
    last_goaway_watermark: Option<u32>,
    stream_events_tx: mpsc::Sender<(u32, StreamUpdate)>,
    stream_events_rx: mpsc::Receiver<(u32, StreamUpdate)>,
    /// When a request was last sent, for the idle-ping policy (§4.4).
    last_send_activity: Instant,
    /// Set while an idle keepalive `PING` is outstanding; cleared by
    /// `ConnectionEvent::PingAck` or any further send activity.
    ping_pending_since: Option<Instant>,
    /// Set on entering `Draining`; past this instant, remaining streams are
    /// force-failed and the connection closes regardless of server replies.
    draining_deadline: Option<Instant>,
    observer: std::sync::Arc<dyn ClientObserver>,
}

/// An event forwarded from a per-stream reader task into the single-writer
/// connection task, which is the only place allowed to touch `StreamTable`.
enum StreamUpdate {
    Headers { status: u16, apns_id: Option<String> },
    Data(Bytes),
    EndOfStream,
    Error(PushyError),
}

impl<T: Transport> ConnectionActor<T> {
    pub fn new(
        transport: T,
        authority: String,
        token_provider: Option<std::sync::Arc<TokenProvider>>,
        options: ConnectionOptions,
    ) -> Self {
        let (stream_events_tx, stream_events_rx) = mpsc::channel(1024);
        Self {
            transport,
            authority,
            token_provider,
            options,
            state: ConnectionState::Connecting,
            table: StreamTable::new(),
            next_stream_id: 1,
            last_stream_id_sent: 0,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            queued: VecDeque::new(),
            last_goaway_watermark: None,
            stream_events_tx,
            stream_events_rx,
            last_send_activity: Instant::now(),
            ping_pending_since: None,
            draining_deadline: None,
            observer: std::sync::Arc::new(NoopObserver),
        }
    }

    /// Report connection-lifecycle events to `observer` instead of the
    /// default no-op (§9 listener-interface design note).
    pub fn with_observer(mut self, observer: std::sync::Arc<dyn ClientObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// The next instant the idle-ping policy should fire: either the
    /// ping-ack deadline, if a keepalive is outstanding, or the idle
    /// interval since the last send.
    fn idle_timer_deadline(&self) -> Instant {
        match self.ping_pending_since {
            Some(since) => since + self.options.ping_ack_timeout,
            None => self.last_send_activity + self.options.idle_ping_interval,
        }
    }

    /// Record activity that proves the connection is alive, resetting the
    /// idle-ping clock and clearing any outstanding keepalive wait.
    fn note_activity(&mut self) {
        self.last_send_activity = Instant::now();
        self.ping_pending_since = None;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Mark the connection `Ready`, the point at which it starts accepting
    /// sends. Called once the transport has completed its handshake.
    pub fn mark_ready(&mut self) {
        self.state = ConnectionState::Ready;
        info!("connection ready");
    }

    /// Drive this connection until `commands` closes or the connection is
    /// torn down. `commands` is owned by the caller's reconnection loop and
    /// reused across connection attempts, so it is borrowed rather than
    /// consumed.
    pub async fn run(mut self, commands: &mut mpsc::Receiver<Command>) {
        loop {
            match self.state {
                ConnectionState::Closed => break,
                _ => {}
            }

            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Send(submission)) => self.handle_send(submission).await,
                        Some(Command::Disconnect(ack)) => {
                            self.begin_draining().await;
                            let _ = ack.send(());
                        }
                        None => {
                            self.begin_draining().await;
                        }
                    }
                }
                event = self.transport.next_event() => {
                    match event {
                        Some(e) => self.handle_transport_event(e).await,
                        None => {
                            self.table.fail_all("connection closed");
                            self.state = ConnectionState::Closed;
                        }
                    }
                }
                Some((stream_id, update)) = self.stream_events_rx.recv() => {
                    self.apply_stream_update(stream_id, update);
                }
                _ = tokio::time::sleep_until(self.idle_timer_deadline()),
                    if self.state == ConnectionState::Ready =>
                {
                    self.handle_idle_timer().await;
                }
                _ = tokio::time::sleep_until(self.draining_deadline.unwrap_or_else(Instant::now)),
                    if self.draining_deadline.is_some() =>
                {
                    self.handle_draining_timeout();
                }
            }

            if self.state == ConnectionState::Draining && self.table.is_empty() {
                self.state = ConnectionState::Closed;
            }
        }
        debug!("connection task exiting, pending table empty: {}", self.table.is_empty());
    }

    async fn handle_send(&mut self, submission: Submission) {
        if submission.completion.is_closed() {
            // The caller already dropped the future that would have
            // received this outcome (cancellation before transmission,
            // §5); nothing to transmit or resolve.
            return;
        }
        if self.state != ConnectionState::Ready {
            let _ = submission.completion.send(Err(PushyError::NotConnected));
            return;
        }
        if self.table.len() as u32 >= self.max_concurrent_streams {
            if self.queued.len() >= self.options.soft_queue_limit {
                let _ = submission.completion.send(Err(PushyError::Backpressure));
                return;
            }
            self.queued.push_back(submission);
            return;
        }
        self.dispatch(submission).await;
    }

    async fn dispatch(&mut self, submission: Submission) {
        if submission.completion.is_closed() {
            // Cancelled while it sat in the soft queue; skip the stream
            // entirely rather than spend one on a caller nobody is
            // listening for (§5 cancellation).
            return;
        }
        let bearer = match &self.token_provider {
            Some(provider) => match provider.token().await {
                Ok(token) => Some(token.as_str().to_string()),
                Err(e) => {
                    let _ = submission.completion.send(Err(e));
                    return;
                }
            },
            None => None,
        };

        let encoded = codec::encode_request(&submission.notification, &self.authority, bearer.as_deref());

        match self.transport.open_stream(encoded.request).await {
            Ok(mut stream) => {
                let stream_id = stream.stream_id();
                self.next_stream_id = stream_id + 2;
                self.last_stream_id_sent = stream_id;
                self.note_activity();
                self.table
                    .register(stream_id, submission.notification, submission.completion);
                if let Err(e) = stream.send_body(Bytes::from(encoded.body)).await {
                    warn!(stream_id, error = %e, "failed to write request body");
                }
                self.spawn_stream_reader(stream_id, stream);
            }
            Err(e) => {
                let _ = submission.completion.send(Err(e));
            }
        }
    }

    /// Spawn a task that drains `stream`'s events and forwards them back
    /// into this actor's single-writer loop. The spawned task never
    /// touches `StreamTable` directly — only `apply_stream_update` does,
    /// on the connection task.
    fn spawn_stream_reader(&mut self, stream_id: u32, mut stream: Box<dyn TransportStream>) {
        let tx = self.stream_events_tx.clone();
        tokio::spawn(async move {
            loop {
                match stream.poll_event().await {
                    Some(Ok(StreamEvent::Headers { status, apns_id })) => {
                        if tx
                            .send((stream_id, StreamUpdate::Headers { status, apns_id }))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Ok(StreamEvent::Data(bytes))) => {
                        if tx.send((stream_id, StreamUpdate::Data(bytes))).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(StreamEvent::EndOfStream)) => {
                        let _ = tx.send((stream_id, StreamUpdate::EndOfStream)).await;
                        return;
                    }
                    Some(Err(e)) => {
                        let _ = tx.send((stream_id, StreamUpdate::Error(e))).await;
                        return;
                    }
                    None => return,
                }
            }
        });
    }

    fn apply_stream_update(&mut self, stream_id: u32, update: StreamUpdate) {
        self.note_activity();
        match update {
            StreamUpdate::Headers { status, apns_id } => {
                self.table.record_headers(stream_id, status, apns_id);
            }
            StreamUpdate::Data(bytes) => {
                self.table.accumulate(stream_id, &bytes);
            }
            StreamUpdate::EndOfStream => {
                if let Some(Response::Rejected { reason, .. }) = self.table.complete(stream_id) {
                    if reason.is_auth_rejection() {
                        if let Some(provider) = self.token_provider.clone() {
                            tokio::spawn(async move { provider.invalidate().await });
                        }
                    }
                }
            }
            StreamUpdate::Error(e) => {
                self.table.fail_one(stream_id, e.to_string());
            }
        }
    }

    async fn handle_transport_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::GoAway { last_stream_id } => {
                info!(last_stream_id, "received GOAWAY");
                self.last_goaway_watermark = Some(last_stream_id);
                self.table.fail_above(last_stream_id);
                self.state = ConnectionState::Draining;
                self.draining_deadline
                    .get_or_insert_with(|| Instant::now() + self.options.graceful_shutdown_timeout);
                self.observer.on_draining(last_stream_id);
            }
            ConnectionEvent::MaxConcurrentStreams(n) => {
                self.max_concurrent_streams = n;
                self.drain_queue_if_possible().await;
            }
            ConnectionEvent::PingAck => {
                debug!("ping acked");
                self.note_activity();
            }
            ConnectionEvent::TransportError(reason) => {
                warn!(%reason, "transport error, tearing down connection");
                self.table.fail_all(reason);
                self.state = ConnectionState::Closed;
            }
        }
    }

    /// Idle policy (§4.4): send a keepalive `PING` after an idle interval
    /// with no outbound traffic; if the previous one went unacknowledged
    /// within `ping_ack_timeout`, treat the connection as dead.
    async fn handle_idle_timer(&mut self) {
        if self.ping_pending_since.is_some() {
            warn!("idle ping not acknowledged in time, tearing down connection");
            self.table.fail_all("idle ping ack timeout");
            self.state = ConnectionState::Closed;
            return;
        }

        debug!("connection idle, sending keepalive ping");
        let payload: [u8; 8] = rand::random();
        if let Err(e) = self.transport.ping(payload).await {
            warn!(error = %e, "failed to send idle ping");
            self.table.fail_all(e.to_string());
            self.state = ConnectionState::Closed;
            return;
        }
        self.ping_pending_since = Some(Instant::now());
    }

    /// Bound on how long `Draining` waits (§5 timeouts): once the deadline
    /// passes, remaining streams are force-failed and the connection closes
    /// even if the server never finished responding to them.
    fn handle_draining_timeout(&mut self) {
        warn!("graceful shutdown timed out, forcing remaining streams to fail");
        self.table.fail_all("graceful shutdown timed out");
        self.state = ConnectionState::Closed;
    }

    async fn drain_queue_if_possible(&mut self) {
        while self.table.len() < self.max_concurrent_streams as usize {
            let Some(submission) = self.queued.pop_front() else {
                break;
            };
            self.dispatch(submission).await;
        }
    }

    async fn begin_draining(&mut self) {
        if self.state == ConnectionState::Ready {
            self.transport.graceful_shutdown().await;
            self.last_goaway_watermark = Some(self.last_stream_id_sent);
            self.state = ConnectionState::Draining;
            self.draining_deadline = Some(Instant::now() + self.options.graceful_shutdown_timeout);
            self.observer.on_draining(self.last_stream_id_sent);
        }
        for submission in self.queued.drain(..) {
            let _ = submission.completion.send(Err(PushyError::NotConnected));
        }
        if self.table.is_empty() {
            self.state = ConnectionState::Closed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_spec_defaults() {
        let opts = ConnectionOptions::default();
        assert_eq!(opts.idle_ping_interval, Duration::from_secs(60));
        assert_eq!(opts.graceful_shutdown_timeout, Duration::from_secs(30));
    }

    /// A transport that never reports a connection event, so the only way
    /// the connection task progresses is via the idle-ping timer (§4.4).
    struct SilentTransport {
        pings_sent: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Transport for SilentTransport {
        async fn open_stream(&mut self, _request: http::Request<()>) -> Result<Box<dyn TransportStream>> {
            unreachable!("this test never sends a notification")
        }

        async fn next_event(&mut self) -> Option<ConnectionEvent> {
            std::future::pending().await
        }

        async fn ping(&mut self, _payload: [u8; 8]) -> Result<()> {
            self.pings_sent
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn graceful_shutdown(&mut self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_sends_a_keepalive_ping_then_times_out_unacked() {
        let pings_sent = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let options = ConnectionOptions {
            idle_ping_interval: Duration::from_secs(5),
            ping_ack_timeout: Duration::from_secs(5),
            graceful_shutdown_timeout: Duration::from_secs(30),
            soft_queue_limit: 16,
        };
        let transport = SilentTransport {
            pings_sent: pings_sent.clone(),
        };
        let mut actor = ConnectionActor::new(transport, "example.test:443".to_string(), None, options);
        actor.mark_ready();

        // Keep the sender alive so `commands.recv()` stays pending instead
        // of observing a closed channel and draining immediately; the test
        // wants the idle-ping path, not the disconnect path, to close it.
        let (_keep_alive, mut commands) = mpsc::channel(1);

        actor.run(&mut commands).await;

        assert_eq!(
            pings_sent.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "exactly one keepalive ping should have been sent before the ack timeout"
        );
    }

    fn notification() -> PushNotification {
        PushNotification::builder("a".repeat(64), b"{}".to_vec())
            .build()
            .unwrap()
    }

    /// A transport whose `next_event` plays back a fixed script of
    /// connection-level events (one per call, then pending forever), and
    /// whose streams never deliver a response — so tests can drive
    /// `GoAway`/`MaxConcurrentStreams` handling without a real `h2` peer.
    struct ScriptedTransport {
        events: std::sync::Mutex<VecDeque<ConnectionEvent>>,
        next_stream_id: std::sync::atomic::AtomicU32,
    }

    struct HangingStream {
        stream_id: u32,
    }

    #[async_trait::async_trait]
    impl TransportStream for HangingStream {
        fn stream_id(&self) -> u32 {
            self.stream_id
        }
        async fn send_body(&mut self, _body: Bytes) -> Result<()> {
            Ok(())
        }
        async fn poll_event(&mut self) -> Option<Result<StreamEvent>> {
            std::future::pending().await
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn open_stream(&mut self, _request: http::Request<()>) -> Result<Box<dyn TransportStream>> {
            let id = self
                .next_stream_id
                .fetch_add(2, std::sync::atomic::Ordering::SeqCst);
            Ok(Box::new(HangingStream { stream_id: id }))
        }

        async fn next_event(&mut self) -> Option<ConnectionEvent> {
            let popped = self.events.lock().unwrap().pop_front();
            match popped {
                Some(event) => Some(event),
                None => std::future::pending().await,
            }
        }

        async fn ping(&mut self, _payload: [u8; 8]) -> Result<()> {
            Ok(())
        }

        async fn graceful_shutdown(&mut self) {}
    }

    #[tokio::test]
    async fn goaway_fails_streams_past_the_watermark_and_spares_earlier_ones() {
        let transport = ScriptedTransport {
            events: std::sync::Mutex::new(VecDeque::from([ConnectionEvent::GoAway { last_stream_id: 1 }])),
            next_stream_id: std::sync::atomic::AtomicU32::new(1),
        };
        let mut actor = ConnectionActor::new(
            transport,
            "example.test:443".to_string(),
            None,
            ConnectionOptions::default(),
        );
        actor.mark_ready();

        // Dispatch both streams directly, bypassing the command channel, so
        // both are registered in the table *before* `run` observes the
        // scripted GOAWAY — `select!` picks pseudo-randomly among
        // simultaneously ready branches, so racing this through `commands`
        // would make the watermark check flaky.
        let (c1_tx, mut c1_rx) = oneshot::channel();
        let (c2_tx, mut c2_rx) = oneshot::channel();
        actor
            .dispatch(Submission {
                notification: notification(),
                completion: c1_tx,
            })
            .await;
        actor
            .dispatch(Submission {
                notification: notification(),
                completion: c2_tx,
            })
            .await;
        assert_eq!(actor.table.len(), 2);

        let (_keep_alive, mut commands) = mpsc::channel(1);
        let _ = tokio::time::timeout(Duration::from_millis(200), actor.run(&mut commands)).await;

        assert!(
            c1_rx.try_recv().is_err(),
            "stream 1 is at or below the GOAWAY watermark and must stay pending"
        );
        match c2_rx.try_recv() {
            Ok(Err(e)) => assert!(e.is_retryable(), "stream 3 was never processed, so its failure must be retryable"),
            other => panic!("expected stream 3 to be failed as safe-to-retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn max_concurrent_streams_update_drains_the_soft_queue() {
        let transport = ScriptedTransport {
            events: std::sync::Mutex::new(VecDeque::from([ConnectionEvent::MaxConcurrentStreams(1)])),
            next_stream_id: std::sync::atomic::AtomicU32::new(1),
        };
        let mut actor = ConnectionActor::new(
            transport,
            "example.test:443".to_string(),
            None,
            ConnectionOptions {
                soft_queue_limit: 4,
                ..ConnectionOptions::default()
            },
        );
        actor.mark_ready();
        // Starve the cap so the next send queues instead of dispatching;
        // the scripted `MaxConcurrentStreams(1)` event then has something
        // to drain.
        actor.max_concurrent_streams = 0;

        let (c1_tx, mut c1_rx) = oneshot::channel();
        actor.handle_send(Submission {
            notification: notification(),
            completion: c1_tx,
        })
        .await;
        assert_eq!(actor.queued.len(), 1, "send should have queued, not dispatched, with the cap at 0");

        let (_keep_alive, mut commands) = mpsc::channel(1);
        let _ = tokio::time::timeout(Duration::from_millis(200), actor.run(&mut commands)).await;

        assert!(actor.queued.is_empty(), "the queued submission should have drained once the cap rose");
        assert!(
            c1_rx.try_recv().is_err(),
            "the submission should have opened a real stream rather than being failed"
        );
    }
}
