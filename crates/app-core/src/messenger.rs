//! Messenger: the hook layer for direct messages
//!
//! Composes the conversation store, the read-state reconciler and the
//! realtime router into the operations a chat screen calls. Every operation
//! returns an [`Outcome`]; collaborator failures never escape as panics or
//! raw errors, and the state already held by the store is kept.
//!
//! Push events are handled inline on the router's pump, in arrival order.
//! Work that needs the network (a mark-read for a message arriving in the
//! open conversation, a refetch after a reconnect) is spawned.

use app_state::mutation::{MutationState, MutationTracker, Outcome, ViewError};
use app_state::session::SessionContext;
use app_state::{
    AppEvent, Conversation, ConversationStore, EventBus, ReadStateReconciler, UnreadBadges,
    ViewGuard,
};
use market_client::{MarketplaceApi, Message, UserId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::messages::{MessageError, MessageService, MAX_MESSAGE_LENGTH};
use crate::realtime::{
    EventFilter, PushEvent, PushTransport, RealtimeConfig, RealtimeRouter, RouterEvent,
    Subscription,
};

/// Messenger configuration
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Longest message accepted, in characters
    pub max_message_length: usize,
    /// Push router settings
    pub realtime: RealtimeConfig,
}

impl MessengerConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum message length
    pub fn with_max_message_length(mut self, max: usize) -> Self {
        self.max_message_length = max;
        self
    }

    /// Set the router configuration
    pub fn with_realtime(mut self, realtime: RealtimeConfig) -> Self {
        self.realtime = realtime;
        self
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            max_message_length: MAX_MESSAGE_LENGTH,
            realtime: RealtimeConfig::default(),
        }
    }
}

struct MessengerInner {
    api: Arc<dyn MarketplaceApi>,
    session: SessionContext,
    store: Arc<ConversationStore>,
    reconciler: Arc<ReadStateReconciler>,
    router: RealtimeRouter,
    bus: EventBus,
    badges: Arc<UnreadBadges>,
    messages: MessageService,
    /// Guards the open conversation's fetch
    conversation_view: ViewGuard,
    /// Guards the conversation list fetch
    list_view: ViewGuard,
    mutations: MutationTracker,
    subscription: Mutex<Option<Subscription>>,
    live: AtomicBool,
}

impl MessengerInner {
    fn update_badges(&self) {
        self.badges.set_messages(self.store.total_unread());
    }

    fn handle(self: &Arc<Self>, event: &RouterEvent) {
        match event {
            RouterEvent::Push(PushEvent::MessageReceived(message)) => {
                self.on_message_received(message.clone());
            }
            RouterEvent::Push(PushEvent::MessageSent(message)) => {
                self.store.append_message(message.clone());
            }
            RouterEvent::Push(PushEvent::MessageRead { message_id, read_at }) => {
                self.reconciler.apply_remote_read(*message_id, *read_at);
            }
            RouterEvent::Interrupted => {
                self.live.store(false, Ordering::SeqCst);
            }
            RouterEvent::Resumed => {
                self.live.store(true, Ordering::SeqCst);
                self.bus.publish(AppEvent::ConversationsStale);

                let inner = self.clone();
                tokio::spawn(async move {
                    let outcome = Messenger { inner }.refresh_conversations().await;
                    if let Some(error) = outcome.error {
                        tracing::warn!("refetch after reconnect failed: {}", error);
                    }
                });
            }
        }
    }

    fn on_message_received(self: &Arc<Self>, message: Message) {
        let Ok(me) = self.session.user_id() else {
            return;
        };
        let sender = message.sender_id;
        let addressed_to_me = message.receiver_id == me;

        if !self.store.append_message(message) || !addressed_to_me {
            return;
        }

        self.bus.publish(AppEvent::NewMessageReceived { from: sender });

        if self.reconciler.active() == Some(sender) {
            self.reconciler.reset(sender);
            let inner = self.clone();
            tokio::spawn(async move { inner.reconcile(sender).await });
        }
        self.update_badges();
    }

    /// Mark `counterpart`'s messages read, at most once per open
    ///
    /// Messages arriving while the request is in flight get one more pass
    /// once it settles.
    async fn reconcile(&self, counterpart: UserId) {
        loop {
            // Switching away before the request starts drops the intent
            if self.reconciler.active() != Some(counterpart) {
                return;
            }
            let Some(ticket) = self.reconciler.begin(counterpart) else {
                return;
            };
            self.update_badges();

            let rearmed = match self.api.mark_messages_read(counterpart).await {
                Ok(receipt) => {
                    let rearmed = self.reconciler.confirm(ticket, &receipt);
                    self.bus.publish(AppEvent::MessagesMarkedAsRead { counterpart });
                    rearmed
                }
                Err(e) => self.reconciler.fail(ticket, &e),
            };
            self.update_badges();

            if !rearmed {
                return;
            }
        }
    }
}

/// Chat-screen operations over one session
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<MessengerInner>,
}

impl Messenger {
    /// Create a messenger; nothing is fetched or connected until [`start`](Self::start)
    pub fn new(
        api: Arc<dyn MarketplaceApi>,
        transport: Arc<dyn PushTransport>,
        session: SessionContext,
        bus: EventBus,
        badges: Arc<UnreadBadges>,
        config: MessengerConfig,
    ) -> Self {
        let store = ConversationStore::new(session.clone());
        let reconciler = ReadStateReconciler::new(&session, store.clone());
        let router = RealtimeRouter::new(transport, session.clone(), config.realtime);
        let messages = MessageService::new(api.clone(), session.clone(), store.clone())
            .with_max_length(config.max_message_length);
        session.register(&badges);

        Self {
            inner: Arc::new(MessengerInner {
                api,
                session,
                store,
                reconciler,
                router,
                bus,
                badges,
                messages,
                conversation_view: ViewGuard::new(),
                list_view: ViewGuard::new(),
                mutations: MutationTracker::new(),
                subscription: Mutex::new(None),
                live: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to push events and load the conversation list
    ///
    /// When the push channel cannot be opened the messenger keeps working
    /// without it; the views refresh manually.
    pub async fn start(&self) -> Outcome<Vec<Conversation>> {
        let weak = Arc::downgrade(&self.inner);
        let subscribed = self
            .inner
            .router
            .subscribe(EventFilter::all(), move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle(event);
                }
            })
            .await;

        match subscribed {
            Ok(subscription) => {
                let previous = self.inner.subscription.lock().replace(subscription);
                drop(previous);
                self.inner.live.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                tracing::warn!("live updates off, conversations refresh manually: {}", e);
                self.inner.live.store(false, Ordering::SeqCst);
            }
        }

        self.refresh_conversations().await
    }

    /// Refetch the conversation summaries
    pub async fn refresh_conversations(&self) -> Outcome<Vec<Conversation>> {
        let inner = &self.inner;
        let token = inner.list_view.issue();
        let _loading = inner.store.begin_loading();

        match inner.messages.fetch_summaries().await {
            Ok(summaries) => {
                let Some(summaries) = inner.list_view.accept(token, summaries) else {
                    return Outcome::dropped();
                };
                inner.store.merge_summaries(summaries);
                inner.update_badges();
                Outcome::ok(inner.store.list_conversations())
            }
            Err(e) => {
                let error = ViewError::from(e);
                if inner.list_view.is_current(token) {
                    inner.store.record_error(error.message.clone());
                }
                Outcome::err(error)
            }
        }
    }

    /// Open the conversation with `counterpart`
    ///
    /// Fetches the messages, merges them, and marks the counterpart's
    /// messages read once for this open. A response arriving after another
    /// conversation was opened is dropped: the outcome has neither value nor
    /// error.
    pub async fn open_conversation(&self, counterpart: UserId) -> Outcome<Vec<Message>> {
        let inner = &self.inner;
        if let Err(e) = inner.session.require() {
            return Outcome::err(MessageError::from(e));
        }

        let token = inner.conversation_view.issue();
        inner.reconciler.set_active(Some(counterpart));
        let loading = inner.store.begin_loading();

        let fetched = match inner.messages.fetch_messages(counterpart).await {
            Ok(fetched) => fetched,
            Err(e) => {
                let error = ViewError::from(e);
                if !inner.conversation_view.is_current(token) {
                    return Outcome::dropped();
                }
                inner.store.record_error(error.message.clone());
                return Outcome::err(error);
            }
        };

        let Some(fetched) = inner.conversation_view.accept(token, fetched) else {
            return Outcome::dropped();
        };
        let merged = inner.store.merge_messages(fetched);
        drop(loading);
        tracing::debug!(%counterpart, merged, "conversation loaded");

        inner.reconcile(counterpart).await;
        Outcome::ok(inner.store.messages(counterpart))
    }

    /// Leave the open conversation
    pub fn close_conversation(&self) {
        self.inner.conversation_view.invalidate();
        self.inner.reconciler.set_active(None);
    }

    /// Send `content` to `receiver`
    pub async fn send_message(&self, receiver: UserId, content: impl Into<String>) -> Outcome<Message> {
        let key = send_key(receiver);
        self.inner
            .mutations
            .run(&key, self.inner.messages.send(receiver, content))
            .await
    }

    /// State of the last send to `receiver`
    pub fn send_state(&self, receiver: UserId) -> MutationState {
        self.inner.mutations.state(&send_key(receiver))
    }

    /// Dispose the push subscription and leave the open conversation
    pub fn shutdown(&self) {
        self.close_conversation();
        self.inner.live.store(false, Ordering::SeqCst);
        let subscription = self.inner.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.dispose();
        }
    }

    /// Conversation rows for the list view
    pub fn conversations(&self) -> Vec<Conversation> {
        self.inner.store.list_conversations()
    }

    /// Messages exchanged with `counterpart`, oldest first
    pub fn messages(&self, counterpart: UserId) -> Vec<Message> {
        self.inner.store.messages(counterpart)
    }

    /// The conversation on screen
    pub fn active_conversation(&self) -> Option<UserId> {
        self.inner.reconciler.active()
    }

    /// Whether push events are arriving
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// The conversation store
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.inner.store
    }

    /// The read-state reconciler
    pub fn reconciler(&self) -> &Arc<ReadStateReconciler> {
        &self.inner.reconciler
    }

    /// The realtime router, for other views that want push events
    pub fn router(&self) -> &RealtimeRouter {
        &self.inner.router
    }

    /// The unread badges
    pub fn badges(&self) -> &Arc<UnreadBadges> {
        &self.inner.badges
    }
}

fn send_key(receiver: UserId) -> String {
    format!("send-message:{}", receiver)
}
