//! Reconnecting stream session.
//!
//! `StreamSession` keeps one logical subscription to a per-target event
//! stream. A single worker task owns all mutable state and applies commands
//! and transport callbacks strictly in the order they were dispatched; the
//! retry timer is only considered once the inbox is drained. Consumers see
//! the result through a status feed and a message feed.
//!
//! Every opened connection gets a fresh generation. Callbacks tagged with
//! any other generation are dropped, so a handle that was torn down by
//! `connect`, `disconnect` or an error can never touch current state.
//!
//! `connect` and `disconnect` also advance a command epoch on the caller's
//! thread and publish their status before returning. Worker output is only
//! published while its epoch is still the latest one, and the check shares a
//! lock with the commands. Callbacks that were already queued when a command
//! returned are therefore never relayed, and [`StreamSession::status`] reads
//! `Connecting` or `Disconnected` as soon as the command returns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::retry::ReconnectBackoff;
use crate::stream::proto::{sse_path, EventChannel, SessionStatus, TransportEvent, TICK_EVENT};
use crate::stream::transport::{Transport, TransportEvents, TransportHandle};

/// Default channel sizes used by [`SessionOptions::default`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionDefaults;

impl SessionDefaults {
    pub const STATUS_CAPACITY: usize = 64;
    pub const MESSAGE_CAPACITY: usize = 1024;
}

/// Tuning knobs for a [`StreamSession`].
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Delay policy between reconnect attempts.
    pub backoff: ReconnectBackoff,
    /// Ring size of the status broadcast channel.
    pub status_capacity: usize,
    /// Ring size of the message broadcast channel. Slow subscribers lag and
    /// lose the oldest payloads.
    pub message_capacity: usize,
    /// Labelled event types relayed alongside the default channel.
    pub named_events: Vec<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            backoff: ReconnectBackoff::default(),
            status_capacity: SessionDefaults::STATUS_CAPACITY,
            message_capacity: SessionDefaults::MESSAGE_CAPACITY,
            named_events: vec![TICK_EVENT.to_string()],
        }
    }
}

/// Unit of work processed by the session worker.
#[derive(Debug)]
pub(crate) enum Dispatch {
    Connect { target: String, epoch: u64 },
    Disconnect { epoch: u64 },
    Shutdown,
    Transport {
        epoch: u64,
        generation: u64,
        event: TransportEvent,
    },
}

/// Output side of a session, shared by the handle and the worker.
#[derive(Debug)]
struct SessionFeeds {
    // Latest command epoch. Held while publishing.
    epoch: Mutex<u64>,
    status: broadcast::Sender<SessionStatus>,
    current: watch::Sender<SessionStatus>,
    messages: broadcast::Sender<String>,
}

impl SessionFeeds {
    fn lock_epoch(&self) -> MutexGuard<'_, u64> {
        self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a new epoch and publishes its opening status.
    fn advance(&self, status: SessionStatus) -> u64 {
        let mut epoch = self.lock_epoch();
        *epoch += 1;
        self.publish_status(status);
        *epoch
    }

    fn is_current(&self, epoch: u64) -> bool {
        *self.lock_epoch() == epoch
    }

    fn emit_status(&self, epoch: u64, status: SessionStatus) {
        let current = self.lock_epoch();
        if *current != epoch {
            trace!(event = "superseded_status", epoch, current = *current, status = %status);
            return;
        }
        self.publish_status(status);
    }

    fn relay(&self, epoch: u64, data: String) {
        let current = self.lock_epoch();
        if *current != epoch {
            trace!(event = "superseded_message", epoch, current = *current);
            return;
        }
        // No subscribers is fine; the feed does not buffer.
        let _ = self.messages.send(data);
    }

    fn publish_status(&self, status: SessionStatus) {
        debug!(event = "session_status", status = %status);
        self.current.send_replace(status);
        let _ = self.status.send(status);
    }
}

/// Handle to a reconnecting subscription.
///
/// Commands return immediately. The status they set is visible right away;
/// everything else is observed through
/// [`subscribe_status`](Self::subscribe_status),
/// [`watch_status`](Self::watch_status) and
/// [`subscribe_messages`](Self::subscribe_messages). Dropping the handle
/// stops the worker and closes any open connection.
#[derive(Debug)]
pub struct StreamSession {
    inbox: mpsc::UnboundedSender<Dispatch>,
    feeds: Arc<SessionFeeds>,
}

impl StreamSession {
    /// Spawns a session worker that opens connections through `transport`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<T: Transport>(transport: T, options: SessionOptions) -> Self {
        Self::with_shared_transport(Arc::new(transport), options)
    }

    /// Same as [`new`](Self::new) for a transport that is already shared.
    pub fn with_shared_transport(transport: Arc<dyn Transport>, options: SessionOptions) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = broadcast::channel(options.status_capacity.max(1));
        let (messages_tx, _) = broadcast::channel(options.message_capacity.max(1));
        let (current_tx, _) = watch::channel(SessionStatus::Disconnected);
        let feeds = Arc::new(SessionFeeds {
            epoch: Mutex::new(0),
            status: status_tx,
            current: current_tx,
            messages: messages_tx,
        });

        let state = SessionState {
            transport,
            backoff: options.backoff,
            named_events: options.named_events,
            inbox: inbox_tx.clone(),
            feeds: Arc::clone(&feeds),
            epoch: 0,
            target: None,
            connection: None,
            generation: 0,
            retry_count: 0,
            retry_at: None,
        };
        tokio::spawn(session_worker(state, inbox_rx));

        Self {
            inbox: inbox_tx,
            feeds,
        }
    }

    /// Subscribes to `target`, replacing any previous subscription.
    ///
    /// Publishes `Connecting` before returning. Nothing from the previous
    /// subscription is relayed afterwards.
    pub fn connect(&self, target: impl Into<String>) {
        let epoch = self.feeds.advance(SessionStatus::Connecting);
        self.dispatch(Dispatch::Connect {
            target: target.into(),
            epoch,
        });
    }

    /// Drops the current subscription and cancels any pending retry.
    ///
    /// Publishes `Disconnected` before returning. No message or status from
    /// the dropped subscription follows it.
    pub fn disconnect(&self) {
        let epoch = self.feeds.advance(SessionStatus::Disconnected);
        self.dispatch(Dispatch::Disconnect { epoch });
    }

    /// Returns the latest published status.
    pub fn status(&self) -> SessionStatus {
        *self.feeds.current.borrow()
    }

    /// Returns a receiver that always holds the latest status.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.feeds.current.subscribe()
    }

    /// Receives every status transition emitted after this call, including
    /// repeated `Connecting` on each failure.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatus> {
        self.feeds.status.subscribe()
    }

    /// Receives every relayed payload emitted after this call.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<String> {
        self.feeds.messages.subscribe()
    }

    fn dispatch(&self, dispatch: Dispatch) {
        if self.inbox.send(dispatch).is_err() {
            debug!(event = "session_worker_gone");
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        let _ = self.inbox.send(Dispatch::Shutdown);
    }
}

struct ActiveConnection {
    generation: u64,
    handle: Box<dyn TransportHandle>,
}

struct SessionState {
    transport: Arc<dyn Transport>,
    backoff: ReconnectBackoff,
    named_events: Vec<String>,
    inbox: mpsc::UnboundedSender<Dispatch>,
    feeds: Arc<SessionFeeds>,
    // Epoch of the last command applied.
    epoch: u64,
    target: Option<String>,
    connection: Option<ActiveConnection>,
    generation: u64,
    retry_count: u32,
    retry_at: Option<Instant>,
}

impl SessionState {
    fn apply(&mut self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Connect { target, epoch } => self.connect(target, epoch),
            Dispatch::Disconnect { epoch } => self.disconnect(epoch),
            Dispatch::Shutdown => self.teardown(),
            Dispatch::Transport {
                epoch,
                generation,
                event,
            } => self.on_transport_event(epoch, generation, event),
        }
    }

    // The handle has already published `Connecting` for this epoch.
    fn connect(&mut self, target: String, epoch: u64) {
        self.teardown();
        debug!(event = "session_connect", epoch, stream_target = %target);
        self.epoch = epoch;
        self.target = Some(target);
        self.retry_count = 0;
        self.open();
    }

    fn disconnect(&mut self, epoch: u64) {
        self.teardown();
        debug!(event = "session_disconnect", epoch);
        self.epoch = epoch;
        self.target = None;
        self.retry_count = 0;
    }

    fn open(&mut self) {
        self.close_connection();

        let Some(target) = self.target.as_deref() else {
            return;
        };
        let path = sse_path(target);
        self.generation += 1;
        let generation = self.generation;
        let events = TransportEvents::new(self.epoch, generation, self.inbox.clone());

        match self.transport.open(&path, events) {
            Ok(handle) => {
                debug!(event = "transport_open_started", generation, path = %path);
                self.connection = Some(ActiveConnection { generation, handle });
            }
            Err(error) => {
                debug!(event = "transport_open_failed", generation, error = %error);
                self.on_failure();
            }
        }
    }

    fn on_transport_event(&mut self, epoch: u64, generation: u64, notification: TransportEvent) {
        let current = self.connection.as_ref().map(|connection| connection.generation);
        if epoch != self.epoch || current != Some(generation) || !self.feeds.is_current(epoch) {
            trace!(
                event = "stale_transport_event",
                epoch,
                generation,
                current = ?current
            );
            return;
        }

        match notification {
            TransportEvent::Opened => {
                self.retry_count = 0;
                self.emit_status(SessionStatus::Connected);
            }
            TransportEvent::Data { channel, data } => self.relay(channel, data),
            TransportEvent::Failed(error) => {
                debug!(event = "transport_failed", generation, error = %error);
                self.close_connection();
                self.on_failure();
            }
        }
    }

    fn on_failure(&mut self) {
        if self.has_target() {
            self.emit_status(SessionStatus::Connecting);
            self.schedule_retry();
        } else {
            self.emit_status(SessionStatus::Disconnected);
        }
    }

    fn schedule_retry(&mut self) {
        if !self.has_target() {
            return;
        }
        let delay = self.backoff.delay_for_retry(self.retry_count);
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_at = Some(Instant::now() + delay);
        debug!(
            event = "retry_scheduled",
            retry = self.retry_count,
            delay_ms = delay.as_millis() as u64
        );
    }

    fn on_retry_due(&mut self) {
        self.retry_at = None;
        if self.has_target() && self.feeds.is_current(self.epoch) {
            debug!(event = "retry_attempt", retry = self.retry_count);
            self.open();
        }
    }

    fn relay(&self, channel: EventChannel, data: String) {
        if data.is_empty() {
            return;
        }
        let relayed = match &channel {
            EventChannel::Default => true,
            EventChannel::Named(name) => self.named_events.iter().any(|known| known == name),
        };
        if !relayed {
            trace!(event = "unrelayed_channel", channel = ?channel);
            return;
        }
        self.feeds.relay(self.epoch, data);
    }

    fn emit_status(&self, status: SessionStatus) {
        self.feeds.emit_status(self.epoch, status);
    }

    fn has_target(&self) -> bool {
        self.target.as_deref().is_some_and(|target| !target.is_empty())
    }

    fn teardown(&mut self) {
        self.retry_at = None;
        self.close_connection();
    }

    fn close_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(error) = connection.handle.close() {
                debug!(
                    event = "transport_close_failed",
                    generation = connection.generation,
                    error = %error
                );
            }
        }
    }
}

async fn session_worker(mut state: SessionState, mut inbox: mpsc::UnboundedReceiver<Dispatch>) {
    loop {
        let retry_at = state.retry_at;
        tokio::select! {
            biased;
            dispatch = inbox.recv() => match dispatch {
                Some(Dispatch::Shutdown) | None => break,
                Some(dispatch) => state.apply(dispatch),
            },
            () = sleep_until_retry(retry_at) => state.on_retry_due(),
        }
    }

    state.teardown();
    debug!(event = "session_worker_stopped");
}

async fn sleep_until_retry(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::sync::{broadcast, mpsc};
    use tokio::time::{timeout, Instant};

    use super::{SessionOptions, StreamSession};
    use crate::stream::proto::SessionStatus;
    use crate::stream::transport::{
        Transport, TransportError, TransportEvents, TransportHandle,
    };

    struct Attempt {
        path: String,
        events: TransportEvents,
        at: Instant,
        closed: Arc<AtomicBool>,
    }

    struct ScriptedTransport {
        attempts: mpsc::UnboundedSender<Attempt>,
        refusals: Arc<AtomicUsize>,
        fail_close: bool,
    }

    struct ScriptedHandle {
        closed: Arc<AtomicBool>,
        fail_close: bool,
    }

    impl TransportHandle for ScriptedHandle {
        fn close(&mut self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::SeqCst);
            if self.fail_close {
                return Err(TransportError::Protocol("close refused".to_string()));
            }
            Ok(())
        }
    }

    impl Transport for ScriptedTransport {
        fn open(
            &self,
            path: &str,
            events: TransportEvents,
        ) -> Result<Box<dyn TransportHandle>, TransportError> {
            let closed = Arc::new(AtomicBool::new(false));
            let _ = self.attempts.send(Attempt {
                path: path.to_string(),
                events,
                at: Instant::now(),
                closed: Arc::clone(&closed),
            });

            let refused = self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if refused {
                return Err(TransportError::Protocol("connection refused".to_string()));
            }

            Ok(Box::new(ScriptedHandle {
                closed,
                fail_close: self.fail_close,
            }))
        }
    }

    struct Harness {
        session: StreamSession,
        attempts: mpsc::UnboundedReceiver<Attempt>,
        refusals: Arc<AtomicUsize>,
    }

    fn harness() -> Harness {
        harness_with(false)
    }

    fn harness_with(fail_close: bool) -> Harness {
        let (attempts_tx, attempts) = mpsc::unbounded_channel();
        let refusals = Arc::new(AtomicUsize::new(0));
        let transport = ScriptedTransport {
            attempts: attempts_tx,
            refusals: Arc::clone(&refusals),
            fail_close,
        };
        Harness {
            session: StreamSession::new(transport, SessionOptions::default()),
            attempts,
            refusals,
        }
    }

    async fn next_attempt(attempts: &mut mpsc::UnboundedReceiver<Attempt>) -> Attempt {
        timeout(Duration::from_secs(120), attempts.recv())
            .await
            .expect("timed out waiting for transport open")
            .expect("transport dropped")
    }

    async fn next_status(statuses: &mut broadcast::Receiver<SessionStatus>) -> SessionStatus {
        timeout(Duration::from_secs(5), statuses.recv())
            .await
            .expect("timed out waiting for status")
            .expect("status channel closed")
    }

    async fn next_message(messages: &mut broadcast::Receiver<String>) -> String {
        timeout(Duration::from_secs(5), messages.recv())
            .await
            .expect("timed out waiting for message")
            .expect("message channel closed")
    }

    // Lets the worker drain its inbox without reaching any retry deadline.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn assert_no_attempt_within(
        attempts: &mut mpsc::UnboundedReceiver<Attempt>,
        window: Duration,
    ) {
        assert!(
            timeout(window, attempts.recv()).await.is_err(),
            "unexpected transport open"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn open_then_data_is_relayed() {
        let Harness {
            session,
            mut attempts,
            ..
        } = harness();
        let mut statuses = session.subscribe_status();
        let mut messages = session.subscribe_messages();
        let mut second_reader = session.subscribe_messages();

        session.connect("john");
        let attempt = next_attempt(&mut attempts).await;
        assert_eq!(attempt.path, "/sse/john");
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);

        attempt.events.opened();
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connected);
        assert_eq!(session.status(), SessionStatus::Connected);

        attempt.events.message("hello");
        attempt.events.message("");
        attempt.events.named("tick", "");
        attempt.events.named("other", "ignored");
        attempt.events.named("tick", "time=1");

        assert_eq!(next_message(&mut messages).await, "hello");
        assert_eq!(next_message(&mut messages).await, "time=1");
        assert_eq!(next_message(&mut second_reader).await, "hello");
        assert_eq!(next_message(&mut second_reader).await, "time=1");

        settle().await;
        assert!(matches!(messages.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn target_is_escaped_into_the_stream_path() {
        let Harness {
            session,
            mut attempts,
            ..
        } = harness();

        session.connect("john doe/1");
        let attempt = next_attempt(&mut attempts).await;
        assert_eq!(attempt.path, "/sse/john%20doe%2F1");
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_follow_backoff_schedule() {
        let Harness {
            session,
            mut attempts,
            ..
        } = harness();
        let mut statuses = session.subscribe_status();

        session.connect("john");
        let mut attempt = next_attempt(&mut attempts).await;
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);

        let mut delays = Vec::new();
        for _ in 0..7 {
            let failed_at = Instant::now();
            attempt.events.failed(TransportError::Closed);
            assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);

            let next = next_attempt(&mut attempts).await;
            assert!(attempt.closed.load(Ordering::SeqCst));
            delays.push(next.at.duration_since(failed_at).as_millis());
            attempt = next;
        }

        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
        );
        assert_eq!(session.status(), SessionStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_backoff() {
        let Harness {
            session,
            mut attempts,
            ..
        } = harness();
        let mut statuses = session.subscribe_status();

        session.connect("john");
        let mut attempt = next_attempt(&mut attempts).await;
        for _ in 0..3 {
            attempt.events.failed(TransportError::Closed);
            attempt = next_attempt(&mut attempts).await;
        }

        attempt.events.opened();
        settle().await;
        assert_eq!(session.status(), SessionStatus::Connected);

        let failed_at = Instant::now();
        attempt.events.failed(TransportError::Closed);
        let next = next_attempt(&mut attempts).await;
        assert_eq!(next.at.duration_since(failed_at).as_millis(), 1_000);

        let observed: Vec<SessionStatus> =
            std::iter::from_fn(|| statuses.try_recv().ok()).collect();
        assert_eq!(
            observed,
            vec![
                SessionStatus::Connecting,
                SessionStatus::Connecting,
                SessionStatus::Connecting,
                SessionStatus::Connecting,
                SessionStatus::Connected,
                SessionStatus::Connecting,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_callbacks_from_failed_handle_are_ignored() {
        let Harness {
            session,
            mut attempts,
            ..
        } = harness();
        let mut statuses = session.subscribe_status();
        let mut messages = session.subscribe_messages();

        session.connect("john");
        let first = next_attempt(&mut attempts).await;
        first.events.failed(TransportError::Closed);
        first.events.failed(TransportError::Closed);
        first.events.opened();
        first.events.message("stale");

        let second = next_attempt(&mut attempts).await;
        second.events.failed(TransportError::Closed);
        let third = next_attempt(&mut attempts).await;
        assert_eq!(third.at.duration_since(second.at).as_millis(), 2_000);

        settle().await;
        let observed: Vec<SessionStatus> =
            std::iter::from_fn(|| statuses.try_recv().ok()).collect();
        assert_eq!(
            observed,
            vec![
                SessionStatus::Connecting,
                SessionStatus::Connecting,
                SessionStatus::Connecting,
            ]
        );
        assert!(matches!(messages.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_open_takes_the_retry_path() {
        let Harness {
            session,
            mut attempts,
            refusals,
        } = harness();
        let mut statuses = session.subscribe_status();
        refusals.store(1, Ordering::SeqCst);

        session.connect("john");
        let refused = next_attempt(&mut attempts).await;
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);

        let retried = next_attempt(&mut attempts).await;
        assert_eq!(retried.at.duration_since(refused.at).as_millis(), 1_000);
        retried.events.opened();
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_before_any_callback_suppresses_late_events() {
        let Harness {
            session,
            mut attempts,
            ..
        } = harness();
        let mut statuses = session.subscribe_status();
        let mut messages = session.subscribe_messages();

        session.connect("john");
        session.disconnect();
        let abandoned = next_attempt(&mut attempts).await;

        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Disconnected);
        assert!(abandoned.closed.load(Ordering::SeqCst));

        abandoned.events.opened();
        abandoned.events.message("late");
        abandoned.events.failed(TransportError::Closed);

        assert_no_attempt_within(&mut attempts, Duration::from_secs(120)).await;
        assert!(matches!(statuses.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(messages.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(session.status(), SessionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_queued_before_disconnect_are_dropped() {
        let Harness {
            session,
            mut attempts,
            ..
        } = harness();
        let mut statuses = session.subscribe_status();
        let mut messages = session.subscribe_messages();

        session.connect("john");
        let attempt = next_attempt(&mut attempts).await;
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);

        attempt.events.opened();
        attempt.events.message("late");
        attempt.events.named("tick", "time=1");
        attempt.events.failed(TransportError::Closed);
        session.disconnect();
        assert_eq!(session.status(), SessionStatus::Disconnected);

        assert_eq!(next_status(&mut statuses).await, SessionStatus::Disconnected);
        assert_no_attempt_within(&mut attempts, Duration::from_secs(120)).await;
        assert!(attempt.closed.load(Ordering::SeqCst));
        assert!(matches!(statuses.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(messages.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(session.status(), SessionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_queued_before_switch_are_dropped() {
        let Harness {
            session,
            mut attempts,
            ..
        } = harness();
        let mut statuses = session.subscribe_status();
        let mut messages = session.subscribe_messages();

        session.connect("john");
        let john = next_attempt(&mut attempts).await;
        john.events.opened();
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connected);

        john.events.message("from john");
        john.events.failed(TransportError::Closed);
        session.connect("alice");
        assert_eq!(session.status(), SessionStatus::Connecting);
        let mut late_reader = session.subscribe_messages();

        let alice = next_attempt(&mut attempts).await;
        assert_eq!(alice.path, "/sse/alice");
        alice.events.message("from alice");

        assert_eq!(next_message(&mut messages).await, "from alice");
        assert_eq!(next_message(&mut late_reader).await, "from alice");
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);
        settle().await;
        assert!(matches!(statuses.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(messages.try_recv(), Err(TryRecvError::Empty)));
        assert_no_attempt_within(&mut attempts, Duration::from_secs(120)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_publishes_connecting_before_returning() {
        let Harness { session, .. } = harness();
        let watcher = session.watch_status();

        session.connect("john");
        assert_eq!(session.status(), SessionStatus::Connecting);
        assert_eq!(*watcher.borrow(), SessionStatus::Connecting);

        session.disconnect();
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(*watcher.borrow(), SessionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_retry() {
        let Harness {
            session,
            mut attempts,
            ..
        } = harness();
        let mut statuses = session.subscribe_status();

        session.connect("john");
        let attempt = next_attempt(&mut attempts).await;
        attempt.events.failed(TransportError::Closed);
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);

        session.disconnect();
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Disconnected);
        assert_no_attempt_within(&mut attempts, Duration::from_secs(120)).await;
        assert!(matches!(statuses.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn switching_target_tears_down_previous_handle() {
        let Harness {
            session,
            mut attempts,
            ..
        } = harness();
        let mut statuses = session.subscribe_status();
        let mut messages = session.subscribe_messages();

        session.connect("john");
        let john = next_attempt(&mut attempts).await;
        john.events.opened();
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connected);

        session.connect("alice");
        let alice = next_attempt(&mut attempts).await;
        assert_eq!(alice.path, "/sse/alice");
        assert!(john.closed.load(Ordering::SeqCst));
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);

        john.events.message("from john");
        john.events.opened();
        john.events.failed(TransportError::Closed);
        alice.events.message("from alice");

        assert_eq!(next_message(&mut messages).await, "from alice");
        settle().await;
        assert!(matches!(statuses.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(messages.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(session.status(), SessionStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_target_cancels_pending_retry_and_resets_backoff() {
        let Harness {
            session,
            mut attempts,
            ..
        } = harness();

        session.connect("john");
        let mut attempt = next_attempt(&mut attempts).await;
        for _ in 0..3 {
            attempt.events.failed(TransportError::Closed);
            attempt = next_attempt(&mut attempts).await;
        }
        attempt.events.failed(TransportError::Closed);
        settle().await;

        session.connect("bob");
        let bob = next_attempt(&mut attempts).await;
        assert_eq!(bob.path, "/sse/bob");

        let failed_at = Instant::now();
        bob.events.failed(TransportError::Closed);
        let retried = next_attempt(&mut attempts).await;
        assert_eq!(retried.path, "/sse/bob");
        assert_eq!(retried.at.duration_since(failed_at).as_millis(), 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn close_failures_do_not_block_teardown() {
        let Harness {
            session,
            mut attempts,
            ..
        } = harness_with(true);
        let mut statuses = session.subscribe_status();

        session.connect("john");
        let john = next_attempt(&mut attempts).await;
        session.connect("bob");
        let bob = next_attempt(&mut attempts).await;
        assert!(john.closed.load(Ordering::SeqCst));

        bob.events.opened();
        settle().await;
        session.disconnect();
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connected);
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Disconnected);
        settle().await;
        assert!(bob.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_target_is_not_retried() {
        let Harness {
            session,
            mut attempts,
            ..
        } = harness();
        let mut statuses = session.subscribe_status();

        session.connect("");
        let attempt = next_attempt(&mut attempts).await;
        assert_eq!(attempt.path, "/sse/");
        attempt.events.failed(TransportError::Closed);

        assert_eq!(next_status(&mut statuses).await, SessionStatus::Connecting);
        assert_eq!(next_status(&mut statuses).await, SessionStatus::Disconnected);
        assert_no_attempt_within(&mut attempts, Duration::from_secs(120)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_session_closes_connection() {
        let Harness {
            session,
            mut attempts,
            ..
        } = harness();

        session.connect("john");
        let attempt = next_attempt(&mut attempts).await;
        drop(session);
        settle().await;

        assert!(attempt.closed.load(Ordering::SeqCst));
        assert!(attempt.events.is_closed());
        assert!(!attempt.events.opened());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_status_tracks_latest_value() {
        let Harness {
            session,
            mut attempts,
            ..
        } = harness();
        let mut watcher = session.watch_status();
        assert_eq!(*watcher.borrow(), SessionStatus::Disconnected);

        session.connect("john");
        let attempt = next_attempt(&mut attempts).await;
        attempt.events.opened();

        let status = timeout(
            Duration::from_secs(5),
            watcher.wait_for(|status| *status == SessionStatus::Connected),
        )
        .await
        .expect("timed out waiting for connected")
        .expect("watch closed");
        assert_eq!(*status, SessionStatus::Connected);
    }
}
