//! Message requests
//!
//! A message to a non-friend arrives as a message request. Sending one is an
//! ordinary send; only the addressee's acceptance turns the exchange into a
//! normal conversation, clearing the request flag on the stored messages.

use app_state::session::SessionContext;
use app_state::{AppEvent, ConversationStore, EventBus, UnreadBadges};
use market_client::{MarketplaceApi, MessageRequest, RequestId, UserId};
use std::sync::Arc;

use crate::invitations::{expect_target, InvitationAction, InvitationBook, Result};

/// Message request operations
pub struct MessageRequestService {
    api: Arc<dyn MarketplaceApi>,
    session: SessionContext,
    store: Arc<ConversationStore>,
    book: Arc<InvitationBook<MessageRequest>>,
    bus: EventBus,
    badges: Arc<UnreadBadges>,
}

impl MessageRequestService {
    /// Create a new message request service
    pub fn new(
        api: Arc<dyn MarketplaceApi>,
        session: SessionContext,
        store: Arc<ConversationStore>,
        bus: EventBus,
        badges: Arc<UnreadBadges>,
    ) -> Self {
        let book = Arc::new(InvitationBook::new());
        session.register(&book);

        Self {
            api,
            session,
            store,
            book,
            bus,
            badges,
        }
    }

    /// Refetch pending message requests
    pub async fn refresh(&self) -> Result<Vec<MessageRequest>> {
        let me = self.session.user_id()?;
        let requests = self.api.list_message_requests().await?;
        self.book.replace_all(requests);
        self.update_badge(me);
        Ok(self.pending())
    }

    fn update_badge(&self, me: UserId) {
        let count = self
            .book
            .pending()
            .iter()
            .filter(|r| r.addressee.id == me)
            .count() as u32;
        self.badges.set_message_requests(count);
    }

    /// Pending requests addressed to the current user
    pub fn pending(&self) -> Vec<MessageRequest> {
        let Ok(me) = self.session.user_id() else {
            return Vec::new();
        };
        self.book
            .pending()
            .into_iter()
            .filter(|r| r.addressee.id == me)
            .collect()
    }

    /// Accept a request; the exchange becomes a normal conversation
    pub async fn accept(&self, id: RequestId) -> Result<MessageRequest> {
        let me = self.session.user_id()?;
        let api = self.api.clone();
        let accepted = self
            .book
            .resolve(
                id,
                InvitationAction::Accept,
                me,
                |id| async move { api.accept_message_request(id).await },
                expect_target,
            )
            .await?;

        let requester = accepted.requester.id;
        let cleared = self.store.clear_message_request(requester);
        tracing::debug!(%id, %requester, cleared, "message request accepted");

        self.update_badge(me);
        self.bus.publish(AppEvent::MessageRequestAccepted {
            request: id,
            requester,
        });
        Ok(accepted)
    }

    /// Decline a request
    pub async fn decline(&self, id: RequestId) -> Result<MessageRequest> {
        let me = self.session.user_id()?;
        let api = self.api.clone();
        let declined = self
            .book
            .resolve(
                id,
                InvitationAction::Decline,
                me,
                |id| async move { api.decline_message_request(id).await },
                expect_target,
            )
            .await?;

        self.update_badge(me);
        self.bus.publish(AppEvent::MessageRequestDeclined { request: id });
        Ok(declined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invitations::InvitationError;
    use crate::messages::MessageService;
    use crate::test_utils::MarketplaceBackend;
    use app_state::UnreadDisplay;
    use tokio::sync::broadcast::error::TryRecvError;

    const SELLER: UserId = UserId(1);
    const BUYER: UserId = UserId(2);

    struct Side {
        store: Arc<ConversationStore>,
        messages: MessageService,
        requests: MessageRequestService,
        bus: EventBus,
    }

    async fn side(backend: &MarketplaceBackend, user: UserId) -> Side {
        let session = backend.session_for(user).await;
        let api: Arc<dyn MarketplaceApi> = Arc::new(backend.client_for(user));
        let store = ConversationStore::new(session.clone());
        let bus = EventBus::new();
        Side {
            messages: MessageService::new(api.clone(), session.clone(), store.clone()),
            requests: MessageRequestService::new(
                api,
                session,
                store.clone(),
                bus.clone(),
                Arc::new(UnreadBadges::new()),
            ),
            store,
            bus,
        }
    }

    fn backend() -> MarketplaceBackend {
        let backend = MarketplaceBackend::new();
        backend.add_user(SELLER, "seller");
        backend.add_user(BUYER, "buyer");
        backend
    }

    #[tokio::test]
    async fn test_acceptance_event_only_on_accept() {
        let backend = backend();
        let buyer = side(&backend, BUYER).await;
        let seller = side(&backend, SELLER).await;
        let mut buyer_events = buyer.bus.subscribe();
        let mut seller_events = seller.bus.subscribe();

        let message = buyer.messages.send(SELLER, "Is the Passat still available?").await.unwrap();
        assert!(message.is_message_request);
        assert!(matches!(buyer_events.try_recv(), Err(TryRecvError::Empty)));

        let pending = seller.requests.refresh().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(seller.requests.badges.message_requests(), UnreadDisplay::Count(1));

        let stored = seller.store.merge_messages(vec![message]);
        assert_eq!(stored, 1);

        seller.requests.accept(pending[0].id).await.unwrap();

        assert_eq!(
            seller_events.try_recv().unwrap(),
            AppEvent::MessageRequestAccepted {
                request: pending[0].id,
                requester: BUYER,
            }
        );
        assert!(seller.requests.pending().is_empty());
        assert!(seller
            .store
            .messages(BUYER)
            .iter()
            .all(|m| !m.is_message_request));
    }

    #[tokio::test]
    async fn test_sender_cannot_accept_own_request() {
        let backend = backend();
        let buyer = side(&backend, BUYER).await;
        buyer.messages.send(SELLER, "Hello").await.unwrap();

        // The buyer never sees the request in its pending list
        let pending = buyer.requests.refresh().await.unwrap();
        assert!(pending.is_empty());
        assert_eq!(backend.calls("accept_message_request"), 0);
    }

    #[tokio::test]
    async fn test_decline() {
        let backend = backend();
        let buyer = side(&backend, BUYER).await;
        let seller = side(&backend, SELLER).await;
        let mut events = seller.bus.subscribe();

        buyer.messages.send(SELLER, "Hello").await.unwrap();
        let pending = seller.requests.refresh().await.unwrap();

        seller.requests.decline(pending[0].id).await.unwrap();
        assert!(seller.requests.pending().is_empty());
        assert_eq!(
            events.try_recv().unwrap(),
            AppEvent::MessageRequestDeclined { request: pending[0].id }
        );

        let again = seller.requests.accept(pending[0].id).await.unwrap_err();
        assert!(matches!(again, InvitationError::NoLongerPending { .. }));
    }
}
