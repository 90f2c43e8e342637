//! Conversation store
//!
//! Per-counterpart mailboxes of messages, keyed by the *other* participant's
//! user id. Conversations are never stored; they are derived from the
//! messages every time they are listed, so the unread count can never drift
//! from the messages it summarizes.
//!
//! All writes are idempotent: the same message may arrive from an optimistic
//! local send, a REST fetch and a push echo, and is stored once. Read state
//! only ever moves from unread to read.

use chrono::{DateTime, Utc};
use market_client::{ConversationSummary, Message, MessageId, UserId, UserSummary};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::session::{SessionContext, SessionScoped};

/// A conversation row, derived from the stored messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// The counterpart's id
    pub user_id: UserId,
    /// Profile snapshot of the counterpart, when known
    pub user: Option<UserSummary>,
    /// Chronologically last message
    pub last_message: Message,
    /// Messages from the counterpart the current user has not read
    pub unread_count: u32,
    /// Whether the counterpart is a friend
    pub is_friend: bool,
}

/// Result of flipping a message to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadChange {
    /// The message was unread and is now read
    Marked,
    /// The message was already read; nothing changed
    AlreadyRead,
    /// The store does not know the message
    Unknown,
}

/// Load status surfaced to the views
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStatus {
    /// At least one fetch is in flight
    pub loading: bool,
    /// Message of the last failed fetch; cleared by the next successful one
    pub error: Option<String>,
    /// When the last successful fetch completed
    pub loaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Mailbox {
    /// Ordered by `sent_at`, ties in arrival order
    messages: Vec<Message>,
    profile: Option<UserSummary>,
    is_friend: bool,
}

impl Mailbox {
    fn insert(&mut self, message: Message) {
        let at = self
            .messages
            .partition_point(|m| m.sent_at <= message.sent_at);
        self.messages.insert(at, message);
    }

    fn find_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    mailboxes: HashMap<UserId, Mailbox>,
    /// Which mailbox each known message lives in
    index: HashMap<MessageId, UserId>,
    status: StoreStatus,
    /// Fetches holding a [`LoadingGuard`]
    loads_in_flight: usize,
    /// Bumped by every clear; guards from an earlier era are ignored
    era: u64,
}

fn mark_read(message: &mut Message, read_at: DateTime<Utc>) -> bool {
    if message.is_read {
        return false;
    }
    message.is_read = true;
    message.read_at = Some(read_at);
    true
}

/// Tab-wide store of every message the client knows about
///
/// One writer path (the hook layer), many readers. Readers call
/// [`subscribe`](Self::subscribe) to learn when to re-render.
pub struct ConversationStore {
    session: SessionContext,
    inner: RwLock<StoreInner>,
    revision: watch::Sender<u64>,
}

impl ConversationStore {
    /// Create a store bound to `session`; it is cleared when the session ends
    pub fn new(session: SessionContext) -> Arc<Self> {
        let (revision, _) = watch::channel(0);
        let store = Arc::new(Self {
            session,
            inner: RwLock::new(StoreInner::default()),
            revision,
        });
        store.session.register(&store);
        store
    }

    fn owner(&self) -> Option<UserId> {
        self.session.user_id().ok()
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Watch the store revision; it increases after every visible change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Current revision
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Conversations ordered by last message, newest first
    pub fn list_conversations(&self) -> Vec<Conversation> {
        let Some(me) = self.owner() else {
            return Vec::new();
        };
        let inner = self.inner.read();

        let mut conversations: Vec<Conversation> = inner
            .mailboxes
            .iter()
            .filter_map(|(user_id, mailbox)| {
                let last_message = mailbox.messages.last()?.clone();
                let unread_count =
                    mailbox.messages.iter().filter(|m| m.is_unread_for(me)).count() as u32;
                Some(Conversation {
                    user_id: *user_id,
                    user: mailbox.profile.clone(),
                    last_message,
                    unread_count,
                    is_friend: mailbox.is_friend,
                })
            })
            .collect();

        conversations.sort_by(|a, b| {
            b.last_message
                .sent_at
                .cmp(&a.last_message.sent_at)
                .then(a.user_id.cmp(&b.user_id))
        });
        conversations
    }

    /// Messages exchanged with `counterpart`, oldest first
    pub fn messages(&self, counterpart: UserId) -> Vec<Message> {
        self.inner
            .read()
            .mailboxes
            .get(&counterpart)
            .map(|mailbox| mailbox.messages.clone())
            .unwrap_or_default()
    }

    /// Look up a single message
    pub fn message(&self, id: MessageId) -> Option<Message> {
        let inner = self.inner.read();
        let counterpart = inner.index.get(&id)?;
        inner
            .mailboxes
            .get(counterpart)?
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// Whether the store knows `id`
    pub fn contains(&self, id: MessageId) -> bool {
        self.inner.read().index.contains_key(&id)
    }

    /// Unread messages from `counterpart` addressed to the current user
    pub fn unread_count(&self, counterpart: UserId) -> u32 {
        let Some(me) = self.owner() else {
            return 0;
        };
        self.inner
            .read()
            .mailboxes
            .get(&counterpart)
            .map(|mailbox| mailbox.messages.iter().filter(|m| m.is_unread_for(me)).count() as u32)
            .unwrap_or(0)
    }

    /// Unread messages across all counterparts
    pub fn total_unread(&self) -> u32 {
        let Some(me) = self.owner() else {
            return 0;
        };
        self.inner
            .read()
            .mailboxes
            .values()
            .flat_map(|mailbox| mailbox.messages.iter())
            .filter(|m| m.is_unread_for(me))
            .count() as u32
    }

    /// Profile snapshot of `counterpart`, when known
    pub fn profile(&self, counterpart: UserId) -> Option<UserSummary> {
        self.inner.read().mailboxes.get(&counterpart)?.profile.clone()
    }

    /// Current load status
    pub fn status(&self) -> StoreStatus {
        self.inner.read().status.clone()
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Insert `message` unless its id is already stored
    ///
    /// Returns whether the message was inserted.
    pub fn append_message(&self, message: Message) -> bool {
        let Some(me) = self.owner() else {
            tracing::warn!(message_id = %message.id, "dropping message received without a session");
            return false;
        };

        let inserted = {
            let mut inner = self.inner.write();
            if inner.index.contains_key(&message.id) {
                false
            } else {
                let counterpart = message.counterpart(me);
                inner.index.insert(message.id, counterpart);
                inner.mailboxes.entry(counterpart).or_default().insert(message);
                true
            }
        };

        if inserted {
            self.bump();
        }
        inserted
    }

    /// Flip a message to read; never flips it back
    pub fn set_message_read(&self, id: MessageId, read_at: DateTime<Utc>) -> ReadChange {
        let change = {
            let mut inner = self.inner.write();
            let Some(counterpart) = inner.index.get(&id).copied() else {
                return ReadChange::Unknown;
            };
            match inner
                .mailboxes
                .get_mut(&counterpart)
                .and_then(|mailbox| mailbox.find_mut(id))
            {
                Some(message) => {
                    if mark_read(message, read_at) {
                        ReadChange::Marked
                    } else {
                        ReadChange::AlreadyRead
                    }
                }
                None => ReadChange::Unknown,
            }
        };

        if change == ReadChange::Marked {
            self.bump();
        }
        change
    }

    /// Mark every unread message from `counterpart` to the current user as read
    ///
    /// Returns the ids that changed.
    pub fn mark_incoming_read(&self, counterpart: UserId, read_at: DateTime<Utc>) -> Vec<MessageId> {
        let Some(me) = self.owner() else {
            return Vec::new();
        };

        let marked: Vec<MessageId> = {
            let mut inner = self.inner.write();
            match inner.mailboxes.get_mut(&counterpart) {
                Some(mailbox) => mailbox
                    .messages
                    .iter_mut()
                    .filter(|m| m.is_incoming(me))
                    .filter_map(|m| mark_read(m, read_at).then_some(m.id))
                    .collect(),
                None => Vec::new(),
            }
        };

        if !marked.is_empty() {
            self.bump();
        }
        marked
    }

    /// Merge a fetched message list for `counterpart`
    ///
    /// Unknown messages are inserted; known ones only pick up a read flag.
    /// Messages already held are never removed.
    pub fn merge_messages(&self, fetched: Vec<Message>) -> usize {
        let Some(me) = self.owner() else {
            return 0;
        };

        let changed = {
            let mut inner = self.inner.write();
            let mut changed = 0;
            for message in fetched {
                changed += usize::from(Self::merge_one(&mut inner, me, message));
            }
            inner.status.error = None;
            inner.status.loaded_at = Some(Utc::now());
            changed
        };

        self.bump();
        changed
    }

    /// Merge conversation summaries from the "list conversations" endpoint
    pub fn merge_summaries(&self, summaries: Vec<ConversationSummary>) {
        let Some(me) = self.owner() else {
            return;
        };

        {
            let mut inner = self.inner.write();
            for summary in summaries {
                let counterpart = summary.user.id;
                let mailbox = inner.mailboxes.entry(counterpart).or_default();
                mailbox.profile = Some(summary.user);
                mailbox.is_friend = summary.is_friend;
                Self::merge_one(&mut inner, me, summary.last_message);
            }
            inner.status.error = None;
            inner.status.loaded_at = Some(Utc::now());
        }

        self.bump();
    }

    fn merge_one(inner: &mut StoreInner, me: UserId, message: Message) -> bool {
        match inner.index.get(&message.id).copied() {
            Some(counterpart) => {
                let read_at = message.read_at.unwrap_or_else(Utc::now);
                match inner
                    .mailboxes
                    .get_mut(&counterpart)
                    .and_then(|mailbox| mailbox.find_mut(message.id))
                {
                    Some(existing) if message.is_read => mark_read(existing, read_at),
                    _ => false,
                }
            }
            None => {
                let counterpart = message.counterpart(me);
                inner.index.insert(message.id, counterpart);
                inner.mailboxes.entry(counterpart).or_default().insert(message);
                true
            }
        }
    }

    /// Remember the profile snapshot and friendship of `counterpart`
    pub fn set_profile(&self, profile: UserSummary, is_friend: bool) {
        {
            let mut inner = self.inner.write();
            let mailbox = inner.mailboxes.entry(profile.id).or_default();
            mailbox.profile = Some(profile);
            mailbox.is_friend = is_friend;
        }
        self.bump();
    }

    /// Clear the message-request flag on every message exchanged with `counterpart`
    pub fn clear_message_request(&self, counterpart: UserId) -> usize {
        let cleared = {
            let mut inner = self.inner.write();
            match inner.mailboxes.get_mut(&counterpart) {
                Some(mailbox) => {
                    let mut cleared = 0;
                    for message in mailbox.messages.iter_mut().filter(|m| m.is_message_request) {
                        message.is_message_request = false;
                        cleared += 1;
                    }
                    cleared
                }
                None => 0,
            }
        };

        if cleared > 0 {
            self.bump();
        }
        cleared
    }

    /// A fetch has started; it counts as loading until the guard drops
    ///
    /// Fetches overlap freely. [`StoreStatus::loading`] stays set while any
    /// of them holds its guard, whichever order they finish in.
    pub fn begin_loading(&self) -> LoadingGuard<'_> {
        let era = {
            let mut inner = self.inner.write();
            inner.loads_in_flight += 1;
            inner.status.loading = true;
            inner.era
        };
        self.bump();
        LoadingGuard { store: self, era }
    }

    fn finish_loading(&self, era: u64) {
        {
            let mut inner = self.inner.write();
            if inner.era != era {
                return;
            }
            inner.loads_in_flight = inner.loads_in_flight.saturating_sub(1);
            inner.status.loading = inner.loads_in_flight > 0;
        }
        self.bump();
    }

    /// A fetch failed; the messages already held stay as they are
    pub fn record_error(&self, message: impl Into<String>) {
        self.inner.write().status.error = Some(message.into());
        self.bump();
    }

    /// Drop everything
    pub fn clear(&self) {
        {
            let mut inner = self.inner.write();
            let era = inner.era + 1;
            *inner = StoreInner {
                era,
                ..StoreInner::default()
            };
        }
        self.bump();
    }
}

/// An in-flight fetch, see [`ConversationStore::begin_loading`]
#[must_use = "the fetch stops counting as loading once the guard drops"]
pub struct LoadingGuard<'a> {
    store: &'a ConversationStore,
    era: u64,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.store.finish_loading(self.era);
    }
}

impl std::fmt::Debug for LoadingGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadingGuard").field("era", &self.era).finish()
    }
}

impl SessionScoped for ConversationStore {
    fn on_session_end(&self) {
        self.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use market_client::session::{MemorySessionStore, Session};

    pub(crate) const ME: UserId = UserId(1);
    pub(crate) const BOB: UserId = UserId(2);
    pub(crate) const CAROL: UserId = UserId(3);

    pub(crate) async fn signed_in() -> SessionContext {
        let context = SessionContext::new(Arc::new(MemorySessionStore::new()));
        context
            .begin(Session::new(UserSummary::new(ME, "me"), "token"))
            .await
            .unwrap();
        context
    }

    pub(crate) fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + Duration::minutes(minute)
    }

    pub(crate) fn msg(id: i64, from: UserId, to: UserId, minute: i64) -> Message {
        Message {
            id: MessageId(id),
            sender_id: from,
            receiver_id: to,
            content: format!("message {}", id),
            sent_at: at(minute),
            is_read: false,
            read_at: None,
            is_message_request: false,
        }
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let store = ConversationStore::new(signed_in().await);

        assert!(store.append_message(msg(1, BOB, ME, 0)));
        assert!(!store.append_message(msg(1, BOB, ME, 0)));

        assert_eq!(store.messages(BOB).len(), 1);
    }

    #[tokio::test]
    async fn test_messages_keyed_by_counterpart() {
        let store = ConversationStore::new(signed_in().await);

        store.append_message(msg(1, BOB, ME, 0));
        store.append_message(msg(2, ME, BOB, 1));
        store.append_message(msg(3, CAROL, ME, 2));

        assert_eq!(store.messages(BOB).len(), 2);
        assert_eq!(store.messages(CAROL).len(), 1);
    }

    #[tokio::test]
    async fn test_messages_sorted_with_stable_ties() {
        let store = ConversationStore::new(signed_in().await);

        store.append_message(msg(3, BOB, ME, 5));
        store.append_message(msg(1, BOB, ME, 1));
        store.append_message(msg(2, ME, BOB, 5));

        let ids: Vec<i64> = store.messages(BOB).iter().map(|m| m.id.get()).collect();
        assert_eq!(ids, vec![1, 3, 2]);
    }

    #[tokio::test]
    async fn test_conversations_newest_first() {
        let store = ConversationStore::new(signed_in().await);

        store.append_message(msg(1, BOB, ME, 0));
        store.append_message(msg(2, CAROL, ME, 3));
        store.append_message(msg(3, ME, BOB, 1));

        let conversations = store.list_conversations();
        assert_eq!(conversations.len(), 2);
        assert_eq!(conversations[0].user_id, CAROL);
        assert_eq!(conversations[1].user_id, BOB);
        assert_eq!(conversations[1].last_message.id, MessageId(3));
    }

    #[tokio::test]
    async fn test_unread_count_only_counts_incoming() {
        let store = ConversationStore::new(signed_in().await);

        store.append_message(msg(1, BOB, ME, 0));
        store.append_message(msg(2, BOB, ME, 1));
        store.append_message(msg(3, ME, BOB, 2));
        store.append_message(msg(4, CAROL, ME, 3));

        assert_eq!(store.unread_count(BOB), 2);
        assert_eq!(store.unread_count(CAROL), 1);
        assert_eq!(store.total_unread(), 3);

        let bob = store
            .list_conversations()
            .into_iter()
            .find(|c| c.user_id == BOB)
            .unwrap();
        assert_eq!(bob.unread_count, 2);
    }

    #[tokio::test]
    async fn test_set_message_read_is_monotone() {
        let store = ConversationStore::new(signed_in().await);
        store.append_message(msg(1, BOB, ME, 0));

        assert_eq!(store.set_message_read(MessageId(1), at(1)), ReadChange::Marked);
        assert_eq!(store.set_message_read(MessageId(1), at(2)), ReadChange::AlreadyRead);
        assert_eq!(store.set_message_read(MessageId(99), at(2)), ReadChange::Unknown);

        // A stale fetch that still says unread cannot revert it
        store.merge_messages(vec![msg(1, BOB, ME, 0)]);

        let stored = store.message(MessageId(1)).unwrap();
        assert!(stored.is_read);
        assert_eq!(stored.read_at, Some(at(1)));
    }

    #[tokio::test]
    async fn test_read_signals_commute() {
        // Push read, REST confirmation and fetch arrive in either order
        for order in [[0, 1, 2], [2, 1, 0], [1, 2, 0]] {
            let store = ConversationStore::new(signed_in().await);
            store.append_message(msg(1, ME, BOB, 0));

            for step in order {
                match step {
                    0 => {
                        store.set_message_read(MessageId(1), at(1));
                    }
                    1 => {
                        store.merge_messages(vec![msg(1, ME, BOB, 0)]);
                    }
                    _ => {
                        let mut read = msg(1, ME, BOB, 0);
                        read.is_read = true;
                        store.merge_messages(vec![read]);
                    }
                }
            }

            assert!(store.message(MessageId(1)).unwrap().is_read);
        }
    }

    #[tokio::test]
    async fn test_mark_incoming_read() {
        let store = ConversationStore::new(signed_in().await);
        store.append_message(msg(1, BOB, ME, 0));
        store.append_message(msg(2, BOB, ME, 1));
        store.append_message(msg(3, ME, BOB, 2));

        let marked = store.mark_incoming_read(BOB, at(3));
        assert_eq!(marked, vec![MessageId(1), MessageId(2)]);
        assert_eq!(store.unread_count(BOB), 0);

        // Outgoing message untouched
        assert!(!store.message(MessageId(3)).unwrap().is_read);
        assert!(store.mark_incoming_read(BOB, at(4)).is_empty());
    }

    #[tokio::test]
    async fn test_fetch_error_keeps_messages() {
        let store = ConversationStore::new(signed_in().await);
        store.append_message(msg(1, BOB, ME, 0));

        let load = store.begin_loading();
        store.record_error("network unreachable");
        drop(load);

        let status = store.status();
        assert!(!status.loading);
        assert_eq!(status.error.as_deref(), Some("network unreachable"));
        assert_eq!(store.messages(BOB).len(), 1);

        store.merge_messages(vec![msg(2, BOB, ME, 1)]);
        assert!(store.status().error.is_none());
        assert_eq!(store.messages(BOB).len(), 2);
    }

    #[tokio::test]
    async fn test_overlapping_fetches_keep_loading() {
        let store = ConversationStore::new(signed_in().await);

        let summaries = store.begin_loading();
        let messages = store.begin_loading();
        store.merge_summaries(Vec::new());
        drop(summaries);

        // The message fetch is still out
        assert!(store.status().loading);

        store.record_error("timed out");
        drop(messages);
        assert!(!store.status().loading);
    }

    #[tokio::test]
    async fn test_clear_forgets_loads_in_flight() {
        let store = ConversationStore::new(signed_in().await);
        let stale = store.begin_loading();

        store.clear();
        assert!(!store.status().loading);

        let fresh = store.begin_loading();
        drop(stale);
        assert!(store.status().loading);
        drop(fresh);
        assert!(!store.status().loading);
    }

    #[tokio::test]
    async fn test_merge_summaries() {
        let store = ConversationStore::new(signed_in().await);

        store.merge_summaries(vec![ConversationSummary {
            user: UserSummary::new(BOB, "bob"),
            last_message: msg(7, BOB, ME, 0),
            unread_count: 1,
            is_friend: true,
        }]);

        let conversations = store.list_conversations();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].user.as_ref().unwrap().username, "bob");
        assert!(conversations[0].is_friend);
        assert_eq!(conversations[0].unread_count, 1);
    }

    #[tokio::test]
    async fn test_clear_message_request() {
        let store = ConversationStore::new(signed_in().await);
        let mut first = msg(1, BOB, ME, 0);
        first.is_message_request = true;
        store.append_message(first);

        assert_eq!(store.clear_message_request(BOB), 1);
        assert!(!store.message(MessageId(1)).unwrap().is_message_request);
        assert_eq!(store.clear_message_request(BOB), 0);
    }

    #[tokio::test]
    async fn test_revision_advances() {
        let store = ConversationStore::new(signed_in().await);
        let mut rx = store.subscribe();
        let before = store.revision();

        store.append_message(msg(1, BOB, ME, 0));
        rx.changed().await.unwrap();
        assert!(*rx.borrow() > before);

        // Duplicate append does not notify
        let rev = store.revision();
        store.append_message(msg(1, BOB, ME, 0));
        assert_eq!(store.revision(), rev);
    }

    #[tokio::test]
    async fn test_teardown_clears_store() {
        let session = signed_in().await;
        let store = ConversationStore::new(session.clone());
        store.append_message(msg(1, BOB, ME, 0));

        session.teardown().await.unwrap();

        assert!(store.messages(BOB).is_empty());
        assert!(store.list_conversations().is_empty());
        assert!(!store.append_message(msg(2, BOB, ME, 1)));
    }
}
