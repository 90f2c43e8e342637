//! Read-state reconciliation
//!
//! Three signals say a message was read: the optimistic local mark when the
//! user opens a conversation, the REST confirmation of that mark, and a push
//! event that the counterpart read something we sent. All of them funnel
//! into [`ConversationStore::set_message_read`], which only moves messages
//! from unread to read, so the signals commute.
//!
//! The reconciler additionally keeps one [`ReconcileState`] per counterpart
//! so the mark-read request fires at most once per conversation open. The
//! entry is reset when the user leaves the conversation or its data reloads.
//! A reset that lands while a request is in flight is remembered, and the
//! request re-arms the entry when it settles instead of closing it.

use chrono::{DateTime, Utc};
use market_client::{MarkReadReceipt, MessageId, UserId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::conversation_store::{ConversationStore, ReadChange};
use crate::session::{SessionContext, SessionScoped};

/// Reconciliation progress for one counterpart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileState {
    /// Nothing done since the conversation was opened
    #[default]
    NotReconciled,
    /// Optimistic mark applied, request in flight
    Reconciling,
    /// Request finished; no further request until reset
    Reconciled,
}

/// Proof that an optimistic mark was applied and a request should follow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileTicket {
    counterpart: UserId,
    epoch: u64,
    marked: Vec<MessageId>,
}

impl ReconcileTicket {
    /// Whose messages the request marks read
    pub fn counterpart(&self) -> UserId {
        self.counterpart
    }

    /// Messages flipped locally by the optimistic mark
    pub fn marked(&self) -> &[MessageId] {
        &self.marked
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: ReconcileState,
    epoch: u64,
    /// Reset while the request was in flight
    stale: bool,
}

#[derive(Debug, Default)]
struct Inner {
    active: Option<UserId>,
    entries: HashMap<UserId, Entry>,
    /// Counterparts whose last request failed; retried on the next open
    failed: HashSet<UserId>,
    next_epoch: u64,
}

/// Per-counterpart mark-read state machine on top of the conversation store
pub struct ReadStateReconciler {
    store: Arc<ConversationStore>,
    inner: Mutex<Inner>,
}

impl ReadStateReconciler {
    /// Create a reconciler writing into `store`; reset when `session` ends
    pub fn new(session: &SessionContext, store: Arc<ConversationStore>) -> Arc<Self> {
        let reconciler = Arc::new(Self {
            store,
            inner: Mutex::new(Inner::default()),
        });
        session.register(&reconciler);
        reconciler
    }

    /// Current state for `counterpart`
    pub fn state(&self, counterpart: UserId) -> ReconcileState {
        self.inner
            .lock()
            .entries
            .get(&counterpart)
            .map(|e| e.state)
            .unwrap_or_default()
    }

    /// The conversation currently on screen
    pub fn active(&self) -> Option<UserId> {
        self.inner.lock().active
    }

    /// Switch the conversation on screen
    ///
    /// Leaving a conversation resets its entry. A request already in flight
    /// for it still applies its receipt, but no longer settles the entry.
    pub fn set_active(&self, counterpart: Option<UserId>) {
        let mut inner = self.inner.lock();
        if inner.active == counterpart {
            return;
        }
        if let Some(previous) = inner.active {
            inner.entries.remove(&previous);
        }
        inner.active = counterpart;
    }

    /// Apply the optimistic mark for `counterpart` if it has not run yet
    ///
    /// Returns a ticket when the caller must now issue the mark-read request,
    /// `None` when a request already ran (or is running) for this open, or
    /// when there is nothing to mark.
    pub fn begin(&self, counterpart: UserId) -> Option<ReconcileTicket> {
        let mut inner = self.inner.lock();
        let state = inner
            .entries
            .get(&counterpart)
            .map(|e| e.state)
            .unwrap_or_default();
        if state != ReconcileState::NotReconciled {
            return None;
        }

        let marked = self.store.mark_incoming_read(counterpart, Utc::now());
        if marked.is_empty() && !inner.failed.contains(&counterpart) {
            return None;
        }

        inner.next_epoch += 1;
        let epoch = inner.next_epoch;
        inner.entries.insert(
            counterpart,
            Entry {
                state: ReconcileState::Reconciling,
                epoch,
                stale: false,
            },
        );

        tracing::debug!(%counterpart, marked = marked.len(), "optimistic mark-read applied");
        Some(ReconcileTicket {
            counterpart,
            epoch,
            marked,
        })
    }

    /// Abandon a ticket whose request was never started
    pub fn cancel(&self, ticket: ReconcileTicket) {
        let mut inner = self.inner.lock();
        if inner
            .entries
            .get(&ticket.counterpart)
            .is_some_and(|e| e.epoch == ticket.epoch)
        {
            inner.entries.remove(&ticket.counterpart);
        }
    }

    /// Apply the server's confirmation of a mark-read request
    ///
    /// Returns true when the entry was reset while the request was in flight
    /// and is armed again; the caller should [`begin`](Self::begin) another
    /// pass for messages the receipt may not cover.
    pub fn confirm(&self, ticket: ReconcileTicket, receipt: &MarkReadReceipt) -> bool {
        for id in &receipt.marked {
            self.store.set_message_read(*id, receipt.read_at);
        }

        let mut inner = self.inner.lock();
        inner.failed.remove(&ticket.counterpart);
        Self::settle(&mut inner, &ticket)
    }

    /// Record a failed mark-read request
    ///
    /// Local read state is kept. The entry still settles so the request is
    /// not repeated automatically; the next open of the conversation retries.
    /// Returns true when the entry re-armed, as for [`confirm`](Self::confirm).
    pub fn fail(&self, ticket: ReconcileTicket, error: &dyn std::fmt::Display) -> bool {
        tracing::warn!(counterpart = %ticket.counterpart, "mark-read request failed: {}", error);

        let mut inner = self.inner.lock();
        inner.failed.insert(ticket.counterpart);
        Self::settle(&mut inner, &ticket)
    }

    fn settle(inner: &mut Inner, ticket: &ReconcileTicket) -> bool {
        match inner.entries.get(&ticket.counterpart).copied() {
            Some(entry) if entry.epoch == ticket.epoch && entry.stale => {
                inner.entries.remove(&ticket.counterpart);
                tracing::debug!(counterpart = %ticket.counterpart, "messages arrived during mark-read, re-arming");
                true
            }
            Some(entry) if entry.epoch == ticket.epoch => {
                inner.entries.insert(
                    ticket.counterpart,
                    Entry {
                        state: ReconcileState::Reconciled,
                        ..entry
                    },
                );
                false
            }
            _ => {
                tracing::debug!(counterpart = %ticket.counterpart, "mark-read finished after the view moved on");
                false
            }
        }
    }

    /// Whether the last request for `counterpart` failed
    pub fn has_failed(&self, counterpart: UserId) -> bool {
        self.inner.lock().failed.contains(&counterpart)
    }

    /// Apply a push "message read" signal, whichever view is open
    pub fn apply_remote_read(&self, message_id: MessageId, read_at: DateTime<Utc>) -> ReadChange {
        self.store.set_message_read(message_id, read_at)
    }

    /// Data for `counterpart` reloaded; allow another request
    ///
    /// With a request in flight the entry stays `Reconciling` and re-arms
    /// once that request settles.
    pub fn reset(&self, counterpart: UserId) {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&counterpart) {
            Some(entry) if entry.state == ReconcileState::Reconciling => entry.stale = true,
            Some(_) => {
                inner.entries.remove(&counterpart);
            }
            None => {}
        }
    }

    /// Forget every entry
    pub fn reset_all(&self) {
        *self.inner.lock() = Inner::default();
    }
}

impl SessionScoped for ReadStateReconciler {
    fn on_session_end(&self) {
        self.reset_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation_store::tests::{at, msg, signed_in, BOB, CAROL, ME};

    async fn setup() -> (Arc<ConversationStore>, Arc<ReadStateReconciler>) {
        let session = signed_in().await;
        let store = ConversationStore::new(session.clone());
        let reconciler = ReadStateReconciler::new(&session, store.clone());
        (store, reconciler)
    }

    fn receipt(ids: &[i64]) -> MarkReadReceipt {
        MarkReadReceipt {
            marked: ids.iter().copied().map(MessageId).collect(),
            read_at: at(10),
        }
    }

    #[tokio::test]
    async fn test_begin_marks_optimistically() {
        let (store, reconciler) = setup().await;
        store.append_message(msg(1, BOB, ME, 0));
        store.append_message(msg(2, BOB, ME, 1));
        reconciler.set_active(Some(BOB));

        let ticket = reconciler.begin(BOB).unwrap();
        assert_eq!(ticket.counterpart(), BOB);
        assert_eq!(ticket.marked().len(), 2);
        assert_eq!(store.unread_count(BOB), 0);
        assert_eq!(reconciler.state(BOB), ReconcileState::Reconciling);
    }

    #[tokio::test]
    async fn test_fires_at_most_once_per_open() {
        let (store, reconciler) = setup().await;
        store.append_message(msg(1, BOB, ME, 0));
        reconciler.set_active(Some(BOB));

        let ticket = reconciler.begin(BOB).unwrap();
        assert!(reconciler.begin(BOB).is_none());

        reconciler.confirm(ticket, &receipt(&[1]));
        assert_eq!(reconciler.state(BOB), ReconcileState::Reconciled);

        // A new unread message without leaving does not re-arm by itself
        store.append_message(msg(2, BOB, ME, 1));
        assert!(reconciler.begin(BOB).is_none());

        // Data reload does
        reconciler.reset(BOB);
        assert!(reconciler.begin(BOB).is_some());
    }

    #[tokio::test]
    async fn test_reset_during_request_rearms() {
        let (store, reconciler) = setup().await;
        store.append_message(msg(1, BOB, ME, 0));
        reconciler.set_active(Some(BOB));
        let ticket = reconciler.begin(BOB).unwrap();

        // Arrives after the server processed the mark
        store.append_message(msg(2, BOB, ME, 1));
        reconciler.reset(BOB);
        assert_eq!(reconciler.state(BOB), ReconcileState::Reconciling);
        assert!(reconciler.begin(BOB).is_none());

        assert!(reconciler.confirm(ticket, &receipt(&[1])));
        assert_eq!(reconciler.state(BOB), ReconcileState::NotReconciled);
        assert_eq!(store.unread_count(BOB), 1);

        let again = reconciler.begin(BOB).unwrap();
        assert_eq!(again.marked(), &[MessageId(2)]);
        assert_eq!(store.unread_count(BOB), 0);
        assert!(!reconciler.confirm(again, &receipt(&[2])));
        assert_eq!(reconciler.state(BOB), ReconcileState::Reconciled);
    }

    #[tokio::test]
    async fn test_nothing_to_mark() {
        let (store, reconciler) = setup().await;
        store.append_message(msg(1, ME, BOB, 0));

        assert!(reconciler.begin(BOB).is_none());
        assert_eq!(reconciler.state(BOB), ReconcileState::NotReconciled);
    }

    #[tokio::test]
    async fn test_leaving_resets_entry() {
        let (store, reconciler) = setup().await;
        store.append_message(msg(1, BOB, ME, 0));
        reconciler.set_active(Some(BOB));
        let ticket = reconciler.begin(BOB).unwrap();
        reconciler.confirm(ticket, &receipt(&[1]));

        reconciler.set_active(Some(CAROL));
        assert_eq!(reconciler.state(BOB), ReconcileState::NotReconciled);
    }

    #[tokio::test]
    async fn test_in_flight_request_applies_after_switch() {
        let (store, reconciler) = setup().await;
        store.append_message(msg(1, BOB, ME, 0));
        reconciler.set_active(Some(BOB));
        let ticket = reconciler.begin(BOB).unwrap();

        reconciler.set_active(Some(CAROL));
        // Server marked a message we had not seen yet as well
        store.append_message(msg(2, BOB, ME, 1));
        reconciler.confirm(ticket, &receipt(&[1, 2]));

        assert_eq!(store.unread_count(BOB), 0);
        // The stale ticket did not settle the new page-load's entry
        assert_eq!(reconciler.state(BOB), ReconcileState::NotReconciled);
    }

    #[tokio::test]
    async fn test_failure_keeps_local_state_and_retries_next_open() {
        let (store, reconciler) = setup().await;
        store.append_message(msg(1, BOB, ME, 0));
        reconciler.set_active(Some(BOB));

        let ticket = reconciler.begin(BOB).unwrap();
        assert!(!reconciler.fail(ticket, &"connection reset"));

        assert_eq!(store.unread_count(BOB), 0);
        assert_eq!(reconciler.state(BOB), ReconcileState::Reconciled);
        assert!(reconciler.has_failed(BOB));
        assert!(reconciler.begin(BOB).is_none());

        reconciler.set_active(None);
        reconciler.set_active(Some(BOB));
        let retry = reconciler.begin(BOB).unwrap();
        assert!(retry.marked().is_empty());

        reconciler.confirm(retry, &receipt(&[]));
        assert!(!reconciler.has_failed(BOB));
    }

    #[tokio::test]
    async fn test_cancel_before_request() {
        let (store, reconciler) = setup().await;
        store.append_message(msg(1, BOB, ME, 0));

        let ticket = reconciler.begin(BOB).unwrap();
        reconciler.cancel(ticket);
        assert_eq!(reconciler.state(BOB), ReconcileState::NotReconciled);
    }

    #[tokio::test]
    async fn test_remote_read_is_global() {
        let (store, reconciler) = setup().await;
        store.append_message(msg(5, ME, CAROL, 0));
        reconciler.set_active(Some(BOB));

        assert_eq!(reconciler.apply_remote_read(MessageId(5), at(3)), ReadChange::Marked);
        assert_eq!(reconciler.apply_remote_read(MessageId(5), at(4)), ReadChange::AlreadyRead);
        assert!(store.message(MessageId(5)).unwrap().is_read);
    }

    #[tokio::test]
    async fn test_session_end_resets() {
        let session = signed_in().await;
        let store = ConversationStore::new(session.clone());
        let reconciler = ReadStateReconciler::new(&session, store.clone());
        store.append_message(msg(1, BOB, ME, 0));
        reconciler.set_active(Some(BOB));
        reconciler.begin(BOB);

        session.teardown().await.unwrap();
        assert_eq!(reconciler.active(), None);
        assert_eq!(reconciler.state(BOB), ReconcileState::NotReconciled);
    }
}
