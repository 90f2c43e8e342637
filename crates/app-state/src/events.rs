//! In-process event bus
//!
//! Fire-and-forget notifications between components that do not share a
//! subscription: the sidebar learns about a new message, the friends list
//! learns a request was accepted. Events carry just enough to decide whether
//! to refetch. Publishing with no listeners is not an error.

use market_client::{DealershipId, RequestId, UserId};
use tokio::sync::broadcast;

/// Default bus capacity; slow receivers past this lag and skip ahead
pub const DEFAULT_BUS_CAPACITY: usize = 64;

/// Cross-component notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// A message addressed to the current user arrived
    NewMessageReceived {
        /// Who sent it
        from: UserId,
    },
    /// Messages from a counterpart were marked read
    MessagesMarkedAsRead {
        /// The counterpart whose messages were read
        counterpart: UserId,
    },
    /// The current user sent a friend request
    FriendRequestSent {
        /// The new request
        request: RequestId,
    },
    /// A friend request was accepted
    FriendRequestAccepted {
        /// The accepted request
        request: RequestId,
    },
    /// A friend request was rejected or cancelled
    FriendRequestRejected {
        /// The resolved request
        request: RequestId,
    },
    /// A message request was accepted
    MessageRequestAccepted {
        /// The accepted request
        request: RequestId,
        /// Who sent it
        requester: UserId,
    },
    /// A message request was declined
    MessageRequestDeclined {
        /// The declined request
        request: RequestId,
    },
    /// A dealership membership record changed
    WorkerInvitationChanged {
        /// The dealership concerned
        dealership: DealershipId,
    },
    /// Conversation summaries may be out of date (reconnect)
    ConversationsStale,
}

/// Broadcast bus for [`AppEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a bus holding up to `capacity` undelivered events per receiver
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; returns how many listeners received it
    pub fn publish(&self, event: AppEvent) -> usize {
        tracing::debug!(?event, "publishing app event");
        self.tx.send(event).unwrap_or(0)
    }

    /// Listen for events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }

    /// Number of live listeners
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
