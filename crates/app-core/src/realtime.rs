//! Realtime event routing
//!
//! One push connection per session, shared by every view that wants
//! message events. Views register callbacks through
//! [`RealtimeRouter::subscribe`] and get a [`Subscription`] handle back; the
//! connection opens with the first subscriber and closes when the last
//! handle is disposed.
//!
//! A single pump task forwards transport signals to subscribers, so events
//! arrive in the order the transport produced them. Missed events are never
//! replayed after a reconnect: subscribers receive [`RouterEvent::Resumed`]
//! and refetch what they need.

use app_state::session::{SessionContext, SessionScoped};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_client::session::Session;
use market_client::{Message, MessageId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Default per-connection event buffer
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Errors from the push transport
#[derive(Debug, Clone, Error)]
#[error("Push transport error: {0}")]
pub struct TransportError(pub String);

/// Errors from the router
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The push channel could not be established; refresh manually
    #[error("Realtime updates unavailable: {0}")]
    Unavailable(#[from] TransportError),

    /// No user is signed in
    #[error("No active session")]
    NoActiveSession,
}

/// Result type for realtime operations
pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Events the push channel delivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// Someone sent the current user a message
    MessageReceived(Message),
    /// Echo of a message the current user sent
    MessageSent(Message),
    /// The counterpart read a message the current user sent
    MessageRead {
        /// The message that was read
        message_id: MessageId,
        /// When it was read
        read_at: DateTime<Utc>,
    },
}

impl PushEvent {
    /// Kind of this event, for filtering
    pub fn kind(&self) -> PushEventKind {
        match self {
            PushEvent::MessageReceived(_) => PushEventKind::MessageReceived,
            PushEvent::MessageSent(_) => PushEventKind::MessageSent,
            PushEvent::MessageRead { .. } => PushEventKind::MessageRead,
        }
    }
}

/// Push event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushEventKind {
    /// [`PushEvent::MessageReceived`]
    MessageReceived,
    /// [`PushEvent::MessageSent`]
    MessageSent,
    /// [`PushEvent::MessageRead`]
    MessageRead,
}

/// What a transport connection yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// An event
    Event(PushEvent),
    /// The connection dropped; the transport is reconnecting
    Disconnected,
    /// The connection is back
    Reconnected,
}

/// What subscribers receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// A push event
    Push(PushEvent),
    /// Delivery paused after a disconnect
    Interrupted,
    /// Delivery resumed; events sent meanwhile are not replayed
    Resumed,
}

/// Closes one transport connection
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Close the connection this handle was issued for, and only that one
    async fn close(&self);
}

/// An open transport connection
pub struct PushConnection {
    /// Signals in transport order; ends when the transport gives up for good
    pub signals: mpsc::Receiver<TransportSignal>,
    /// Closes this connection
    pub handle: Box<dyn ConnectionHandle>,
}

impl std::fmt::Debug for PushConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushConnection").finish_non_exhaustive()
    }
}

/// The push-channel collaborator
///
/// Reconnect policy (backoff, limits) belongs to the transport.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Open a connection for `session`
    async fn connect(
        &self,
        session: &Session,
        buffer: usize,
    ) -> std::result::Result<PushConnection, TransportError>;
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Signals buffered per connection before the transport waits
    pub event_buffer: usize,
}

impl RealtimeConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event buffer size
    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer.max(1);
        self
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Which push events a subscriber wants
///
/// Connection signals ([`RouterEvent::Interrupted`], [`RouterEvent::Resumed`])
/// reach every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    kinds: Option<Vec<PushEventKind>>,
}

impl EventFilter {
    /// Every push event
    pub fn all() -> Self {
        Self { kinds: None }
    }

    /// Only the listed kinds
    pub fn only(kinds: &[PushEventKind]) -> Self {
        Self {
            kinds: Some(kinds.to_vec()),
        }
    }

    /// Whether `event` passes the filter
    pub fn accepts(&self, event: &RouterEvent) -> bool {
        match (event, &self.kinds) {
            (RouterEvent::Push(push), Some(kinds)) => kinds.contains(&push.kind()),
            _ => true,
        }
    }
}

type Callback = Arc<dyn Fn(&RouterEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    filter: EventFilter,
    callback: Callback,
}

struct Connection {
    generation: u64,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct RouterInner {
    transport: Arc<dyn PushTransport>,
    session: SessionContext,
    config: RealtimeConfig,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    connection: Mutex<Option<Connection>>,
    next_generation: AtomicU64,
    /// Serializes connection setup
    connecting: tokio::sync::Mutex<()>,
    connections_opened: AtomicUsize,
}

impl RouterInner {
    /// Deliver `event` from connection `generation`
    ///
    /// Returns false, delivering nothing, when that connection has been
    /// replaced or released.
    fn dispatch(&self, generation: u64, event: RouterEvent) -> bool {
        let targets: Vec<Callback> = {
            let connection = self.connection.lock();
            if !connection.as_ref().is_some_and(|c| c.generation == generation) {
                return false;
            }
            self.subscribers
                .lock()
                .iter()
                .filter(|s| s.filter.accepts(&event))
                .map(|s| s.callback.clone())
                .collect()
        };

        for callback in targets {
            callback(&event);
        }
        true
    }

    fn unsubscribe(&self, id: u64) {
        let remaining = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|s| s.id != id);
            subscribers.len()
        };

        if remaining == 0 {
            self.disconnect();
        }
    }

    fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().take() {
            tracing::info!("closing push connection");
            let _ = connection.stop.send(());
        }
    }

    fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| !c.task.is_finished())
    }
}

/// Reference-counted fan-out of one push connection
#[derive(Clone)]
pub struct RealtimeRouter {
    inner: Arc<RouterInner>,
}

impl RealtimeRouter {
    /// Create a router over `transport`; nothing connects until the first subscriber
    pub fn new(
        transport: Arc<dyn PushTransport>,
        session: SessionContext,
        config: RealtimeConfig,
    ) -> Self {
        let router = Self {
            inner: Arc::new(RouterInner {
                transport,
                session: session.clone(),
                config,
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                connection: Mutex::new(None),
                next_generation: AtomicU64::new(1),
                connecting: tokio::sync::Mutex::new(()),
                connections_opened: AtomicUsize::new(0),
            }),
        };
        session.register(&router.inner);
        router
    }

    /// Register `callback` for events passing `filter`
    ///
    /// Opens the push connection if this is the first subscriber. If the
    /// connection cannot be established the subscriber is not registered and
    /// [`RealtimeError::Unavailable`] is returned; there is no retry.
    pub async fn subscribe<F>(&self, filter: EventFilter, callback: F) -> Result<Subscription>
    where
        F: Fn(&RouterEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push(Subscriber {
            id,
            filter,
            callback: Arc::new(callback),
        });

        if let Err(e) = self.ensure_connected().await {
            self.inner.subscribers.lock().retain(|s| s.id != id);
            return Err(e);
        }

        Ok(Subscription {
            id,
            router: Arc::downgrade(&self.inner),
        })
    }

    async fn ensure_connected(&self) -> Result<()> {
        let _setup = self.inner.connecting.lock().await;
        if self.inner.is_connected() {
            return Ok(());
        }

        let session = self
            .inner
            .session
            .current()
            .ok_or(RealtimeError::NoActiveSession)?;

        let connection = match self
            .inner
            .transport
            .connect(&session, self.inner.config.event_buffer)
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!("push channel unavailable, falling back to manual refresh: {}", e);
                return Err(e.into());
            }
        };

        self.inner.connections_opened.fetch_add(1, Ordering::SeqCst);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        tracing::info!(user_id = %session.user_id(), generation, "push connection established");

        // The slot is filled before the pump can observe it
        let (stop, stop_rx) = oneshot::channel();
        let mut slot = self.inner.connection.lock();
        let task = tokio::spawn(pump(
            Arc::downgrade(&self.inner),
            generation,
            connection,
            stop_rx,
        ));
        *slot = Some(Connection {
            generation,
            stop,
            task,
        });
        Ok(())
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Whether a push connection is open
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// How many connections have been opened so far
    pub fn connections_opened(&self) -> usize {
        self.inner.connections_opened.load(Ordering::SeqCst)
    }
}

/// Forward one connection's signals until it is stopped or ends
///
/// A pump whose connection is no longer the router's current one never
/// dispatches; it closes its own connection and exits.
async fn pump(
    router: Weak<RouterInner>,
    generation: u64,
    connection: PushConnection,
    mut stop: oneshot::Receiver<()>,
) {
    let PushConnection {
        mut signals,
        handle,
    } = connection;

    loop {
        let signal = tokio::select! {
            biased;
            _ = &mut stop => break,
            signal = signals.recv() => signal,
        };

        let Some(inner) = router.upgrade() else {
            break;
        };

        let (event, ended) = match signal {
            Some(TransportSignal::Event(event)) => (RouterEvent::Push(event), false),
            Some(TransportSignal::Disconnected) => (RouterEvent::Interrupted, false),
            Some(TransportSignal::Reconnected) => (RouterEvent::Resumed, false),
            None => (RouterEvent::Interrupted, true),
        };

        if !inner.dispatch(generation, event.clone()) {
            tracing::debug!(generation, "dropping signal from a replaced push connection");
            break;
        }
        match (event, ended) {
            (_, true) => {
                tracing::warn!(generation, "push transport closed the connection");
                return;
            }
            (RouterEvent::Interrupted, _) => tracing::info!(generation, "push connection interrupted"),
            (RouterEvent::Resumed, _) => tracing::info!(generation, "push connection resumed"),
            _ => {}
        }
    }

    handle.close().await;
}

impl SessionScoped for RouterInner {
    fn on_session_end(&self) {
        self.subscribers.lock().clear();
        self.disconnect();
    }
}

/// Handle on a router registration
///
/// Dropping the handle disposes it.
pub struct Subscription {
    id: u64,
    router: Weak<RouterInner>,
}

impl Subscription {
    /// Detach the callback; the last disposal closes the connection
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{settle, ScriptedTransport};
    use market_client::session::MemorySessionStore;
    use market_client::{UserId, UserSummary};

    async fn signed_in() -> SessionContext {
        let context = SessionContext::new(Arc::new(MemorySessionStore::new()));
        context
            .begin(Session::new(UserSummary::new(UserId(1), "me"), "token"))
            .await
            .unwrap();
        context
    }

    fn read_event(id: i64) -> TransportSignal {
        TransportSignal::Event(PushEvent::MessageRead {
            message_id: MessageId(id),
            read_at: Utc::now(),
        })
    }

    fn recorder() -> (Arc<Mutex<Vec<RouterEvent>>>, impl Fn(&RouterEvent) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |event: &RouterEvent| sink.lock().push(event.clone()))
    }

    #[tokio::test]
    async fn test_single_connection_for_many_subscribers() {
        let transport = ScriptedTransport::new();
        let router = RealtimeRouter::new(Arc::new(transport.clone()), signed_in().await, RealtimeConfig::default());

        let (sidebar_seen, sidebar) = recorder();
        let (chat_seen, chat) = recorder();
        let _a = router.subscribe(EventFilter::all(), sidebar).await.unwrap();
        let _b = router.subscribe(EventFilter::all(), chat).await.unwrap();

        assert_eq!(transport.connect_count(), 1);
        assert_eq!(router.connections_opened(), 1);

        transport.push(read_event(1)).await;
        settle().await;

        assert_eq!(sidebar_seen.lock().len(), 1);
        assert_eq!(chat_seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_last_dispose_closes_connection() {
        let transport = ScriptedTransport::new();
        let router = RealtimeRouter::new(Arc::new(transport.clone()), signed_in().await, RealtimeConfig::default());

        let first = router.subscribe(EventFilter::all(), |_| {}).await.unwrap();
        let second = router.subscribe(EventFilter::all(), |_| {}).await.unwrap();

        first.dispose();
        settle().await;
        assert!(router.is_connected());
        assert_eq!(transport.close_count(), 0);

        second.dispose();
        settle().await;
        assert!(!router.is_connected());
        assert_eq!(transport.close_count(), 1);

        // A later subscriber opens a fresh connection
        let _third = router.subscribe(EventFilter::all(), |_| {}).await.unwrap();
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_resubscribe_before_old_connection_stops() {
        let transport = ScriptedTransport::new();
        let router = RealtimeRouter::new(Arc::new(transport.clone()), signed_in().await, RealtimeConfig::default());

        let first = router.subscribe(EventFilter::all(), |_| {}).await.unwrap();
        first.dispose();
        let (seen, callback) = recorder();
        let _second = router.subscribe(EventFilter::all(), callback).await.unwrap();
        settle().await;

        // The released connection closed itself and nothing else
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(transport.close_count(), 1);
        assert_eq!(transport.open_count(), 1);
        assert!(router.is_connected());

        transport.push(read_event(7)).await;
        settle().await;
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            &seen[0],
            RouterEvent::Push(PushEvent::MessageRead { message_id, .. }) if *message_id == MessageId(7)
        ));
    }

    #[tokio::test]
    async fn test_transport_giving_up_allows_reconnect() {
        let transport = ScriptedTransport::new();
        let router = RealtimeRouter::new(Arc::new(transport.clone()), signed_in().await, RealtimeConfig::default());
        let (seen, callback) = recorder();
        let _first = router.subscribe(EventFilter::all(), callback).await.unwrap();

        transport.hang_up();
        settle().await;
        assert_eq!(*seen.lock(), vec![RouterEvent::Interrupted]);
        assert!(!router.is_connected());

        let _second = router.subscribe(EventFilter::all(), |_| {}).await.unwrap();
        assert_eq!(transport.connect_count(), 2);
        assert!(router.is_connected());
    }

    #[tokio::test]
    async fn test_delivery_order_preserved() {
        let transport = ScriptedTransport::new();
        let router = RealtimeRouter::new(Arc::new(transport.clone()), signed_in().await, RealtimeConfig::default());
        let (seen, callback) = recorder();
        let _sub = router.subscribe(EventFilter::all(), callback).await.unwrap();

        for id in 1..=5 {
            transport.push(read_event(id)).await;
        }
        settle().await;

        let ids: Vec<i64> = seen
            .lock()
            .iter()
            .filter_map(|e| match e {
                RouterEvent::Push(PushEvent::MessageRead { message_id, .. }) => Some(message_id.get()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_filter_by_kind() {
        let transport = ScriptedTransport::new();
        let router = RealtimeRouter::new(Arc::new(transport.clone()), signed_in().await, RealtimeConfig::default());
        let (seen, callback) = recorder();
        let _sub = router
            .subscribe(EventFilter::only(&[PushEventKind::MessageReceived]), callback)
            .await
            .unwrap();

        transport.push(read_event(1)).await;
        transport.push(TransportSignal::Disconnected).await;
        settle().await;

        assert_eq!(*seen.lock(), vec![RouterEvent::Interrupted]);
    }

    #[tokio::test]
    async fn test_reconnect_signals_without_replay() {
        let transport = ScriptedTransport::new();
        let router = RealtimeRouter::new(Arc::new(transport.clone()), signed_in().await, RealtimeConfig::default());
        let (seen, callback) = recorder();
        let _sub = router.subscribe(EventFilter::all(), callback).await.unwrap();

        transport.push(TransportSignal::Disconnected).await;
        transport.push(TransportSignal::Reconnected).await;
        transport.push(read_event(9)).await;
        settle().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], RouterEvent::Interrupted);
        assert_eq!(seen[1], RouterEvent::Resumed);
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_transport_degrades() {
        let transport = ScriptedTransport::new();
        transport.fail_connects(true);
        let router = RealtimeRouter::new(Arc::new(transport.clone()), signed_in().await, RealtimeConfig::default());

        let result = router.subscribe(EventFilter::all(), |_| {}).await;
        assert!(matches!(result, Err(RealtimeError::Unavailable(_))));
        assert_eq!(router.subscriber_count(), 0);
        assert!(!router.is_connected());
    }

    #[tokio::test]
    async fn test_requires_session() {
        let transport = ScriptedTransport::new();
        let session = SessionContext::new(Arc::new(MemorySessionStore::new()));
        let router = RealtimeRouter::new(Arc::new(transport.clone()), session, RealtimeConfig::default());

        let result = router.subscribe(EventFilter::all(), |_| {}).await;
        assert!(matches!(result, Err(RealtimeError::NoActiveSession)));
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_session_end_closes_connection() {
        let transport = ScriptedTransport::new();
        let session = signed_in().await;
        let router = RealtimeRouter::new(Arc::new(transport.clone()), session.clone(), RealtimeConfig::default());
        let sub = router.subscribe(EventFilter::all(), |_| {}).await.unwrap();

        session.teardown().await.unwrap();
        settle().await;

        assert!(!router.is_connected());
        assert_eq!(router.subscriber_count(), 0);
        assert_eq!(transport.close_count(), 1);

        // Disposing a handle after teardown is harmless
        sub.dispose();
    }
}
