//! Friend requests and the friends list
//!
//! Accepting a request adds an edge on both sides, so instead of patching
//! the two lists locally the service refetches both after the backend
//! confirms the acceptance.

use app_state::session::{SessionContext, SessionScoped};
use app_state::{AppEvent, EventBus, UnreadBadges};
use market_client::{FriendRequest, MarketplaceApi, RequestId, UserId, UserSummary};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::invitations::{
    expect_target, user_pair, InvitationAction, InvitationBook, InvitationError, Result,
};

#[derive(Default)]
struct FriendList {
    friends: RwLock<Vec<UserSummary>>,
}

impl SessionScoped for FriendList {
    fn on_session_end(&self) {
        self.friends.write().clear();
    }
}

/// Friend request operations and the cached friends list
pub struct FriendService {
    api: Arc<dyn MarketplaceApi>,
    session: SessionContext,
    book: Arc<InvitationBook<FriendRequest>>,
    friends: Arc<FriendList>,
    bus: EventBus,
    badges: Arc<UnreadBadges>,
}

impl FriendService {
    /// Create a new friend service
    pub fn new(
        api: Arc<dyn MarketplaceApi>,
        session: SessionContext,
        bus: EventBus,
        badges: Arc<UnreadBadges>,
    ) -> Self {
        let book = Arc::new(InvitationBook::new());
        session.register(&book);
        let friends = Arc::new(FriendList::default());
        session.register(&friends);

        Self {
            api,
            session,
            book,
            friends,
            bus,
            badges,
        }
    }

    /// Refetch pending requests and friends
    pub async fn refresh(&self) -> Result<()> {
        let me = self.session.user_id()?;

        let requests = self.api.list_friend_requests().await?;
        let friends = self.api.list_friends().await?;

        self.book.replace_all(requests);
        *self.friends.friends.write() = friends;
        self.update_badge(me);
        Ok(())
    }

    fn update_badge(&self, me: UserId) {
        let incoming = self
            .book
            .pending()
            .iter()
            .filter(|r| r.addressee.id == me)
            .count() as u32;
        self.badges.set_friend_requests(incoming);
    }

    /// Cached friends
    pub fn friends(&self) -> Vec<UserSummary> {
        self.friends.friends.read().clone()
    }

    /// Whether `user` is a friend
    pub fn is_friend(&self, user: UserId) -> bool {
        self.friends.friends.read().iter().any(|f| f.id == user)
    }

    /// Pending requests addressed to the current user
    pub fn incoming(&self) -> Vec<FriendRequest> {
        let Ok(me) = self.session.user_id() else {
            return Vec::new();
        };
        self.book
            .pending()
            .into_iter()
            .filter(|r| r.addressee.id == me)
            .collect()
    }

    /// Pending requests the current user sent
    pub fn outgoing(&self) -> Vec<FriendRequest> {
        let Ok(me) = self.session.user_id() else {
            return Vec::new();
        };
        self.book
            .pending()
            .into_iter()
            .filter(|r| r.requester.id == me)
            .collect()
    }

    /// Ask `addressee` to become a friend
    ///
    /// Rejected before any network call when the pair already has a pending
    /// request in either direction or is already connected.
    pub async fn send_request(&self, addressee: UserId) -> Result<FriendRequest> {
        let me = self.session.user_id()?;
        if addressee == me {
            return Err(InvitationError::SelfInvitation);
        }
        if self.is_friend(addressee) {
            return Err(InvitationError::AlreadyConnected);
        }
        if self.book.has_pending(user_pair(me, addressee)) {
            return Err(InvitationError::DuplicatePending);
        }

        let request = self.api.send_friend_request(addressee).await?;
        tracing::debug!(id = %request.id, %addressee, "friend request sent");

        self.book.upsert(request.clone());
        self.bus.publish(AppEvent::FriendRequestSent { request: request.id });
        Ok(request)
    }

    /// Accept an incoming request, then refetch requests and friends
    pub async fn accept(&self, id: RequestId) -> Result<FriendRequest> {
        let me = self.session.user_id()?;
        let api = self.api.clone();
        let accepted = self
            .book
            .resolve(
                id,
                InvitationAction::Accept,
                me,
                |id| async move { api.accept_friend_request(id).await },
                expect_target,
            )
            .await?;

        self.bus.publish(AppEvent::FriendRequestAccepted { request: id });
        if let Err(e) = self.refresh().await {
            tracing::warn!(%id, "refetch after accepting friend request failed: {}", e);
        }
        Ok(accepted)
    }

    /// Reject an incoming request
    pub async fn decline(&self, id: RequestId) -> Result<FriendRequest> {
        self.resolve_and_drop(id, InvitationAction::Decline).await
    }

    /// Withdraw an outgoing request
    pub async fn cancel(&self, id: RequestId) -> Result<FriendRequest> {
        self.resolve_and_drop(id, InvitationAction::Cancel).await
    }

    async fn resolve_and_drop(&self, id: RequestId, action: InvitationAction) -> Result<FriendRequest> {
        let me = self.session.user_id()?;
        let api = self.api.clone();
        let resolved = self
            .book
            .resolve(
                id,
                action,
                me,
                |id| async move {
                    match action {
                        InvitationAction::Cancel => api.cancel_friend_request(id).await,
                        _ => api.decline_friend_request(id).await,
                    }
                },
                expect_target,
            )
            .await?;

        self.update_badge(me);
        self.bus.publish(AppEvent::FriendRequestRejected { request: id });
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MarketplaceBackend;
    use app_state::UnreadDisplay;

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);

    async fn service_for(backend: &MarketplaceBackend, user: UserId) -> (FriendService, EventBus) {
        let session = backend.session_for(user).await;
        let bus = EventBus::new();
        let service = FriendService::new(
            Arc::new(backend.client_for(user)),
            session,
            bus.clone(),
            Arc::new(UnreadBadges::new()),
        );
        (service, bus)
    }

    fn backend() -> MarketplaceBackend {
        let backend = MarketplaceBackend::new();
        backend.add_user(ALICE, "alice");
        backend.add_user(BOB, "bob");
        backend
    }

    #[tokio::test]
    async fn test_accept_refetches_both_lists() {
        let backend = backend();
        let (alice, _) = service_for(&backend, ALICE).await;
        let (bob, bus) = service_for(&backend, BOB).await;
        let mut events = bus.subscribe();

        let request = alice.send_request(BOB).await.unwrap();
        bob.refresh().await.unwrap();
        assert_eq!(bob.incoming().len(), 1);
        assert_eq!(bob.badges.friend_requests(), UnreadDisplay::Count(1));

        bob.accept(request.id).await.unwrap();

        assert!(bob.incoming().is_empty());
        assert!(bob.is_friend(ALICE));
        assert_eq!(bob.badges.friend_requests(), UnreadDisplay::None);
        assert_eq!(
            events.recv().await.unwrap(),
            AppEvent::FriendRequestAccepted { request: request.id }
        );
    }

    #[tokio::test]
    async fn test_duplicate_request_rejected_locally() {
        let backend = backend();
        let (alice, _) = service_for(&backend, ALICE).await;

        alice.send_request(BOB).await.unwrap();
        let err = alice.send_request(BOB).await.unwrap_err();

        assert!(matches!(err, InvitationError::DuplicatePending));
        assert_eq!(backend.calls("send_friend_request"), 1);
    }

    #[tokio::test]
    async fn test_cannot_befriend_self() {
        let backend = backend();
        let (alice, _) = service_for(&backend, ALICE).await;

        assert!(matches!(
            alice.send_request(ALICE).await,
            Err(InvitationError::SelfInvitation)
        ));
        assert_eq!(backend.calls("send_friend_request"), 0);
    }

    #[tokio::test]
    async fn test_requester_cancels() {
        let backend = backend();
        let (alice, bus) = service_for(&backend, ALICE).await;
        let mut events = bus.subscribe();

        let request = alice.send_request(BOB).await.unwrap();
        let cancelled = alice.cancel(request.id).await.unwrap();

        assert_eq!(cancelled.status, market_client::RequestStatus::Cancelled);
        assert!(alice.outgoing().is_empty());
        assert_eq!(
            events.recv().await.unwrap(),
            AppEvent::FriendRequestSent { request: request.id }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            AppEvent::FriendRequestRejected { request: request.id }
        );
    }

    #[tokio::test]
    async fn test_requester_cannot_accept() {
        let backend = backend();
        let (alice, _) = service_for(&backend, ALICE).await;

        let request = alice.send_request(BOB).await.unwrap();
        let err = alice.accept(request.id).await.unwrap_err();

        assert!(matches!(err, InvitationError::NotPermitted { .. }));
        assert_eq!(backend.calls("accept_friend_request"), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_remote_accept_is_conflict() {
        let backend = backend();
        let (alice, _) = service_for(&backend, ALICE).await;
        let (bob, _) = service_for(&backend, BOB).await;

        let request = alice.send_request(BOB).await.unwrap();
        bob.refresh().await.unwrap();
        bob.accept(request.id).await.unwrap();

        // Alice's list is stale; the backend refuses the cancel
        let err = alice.cancel(request.id).await.unwrap_err();
        assert!(matches!(err, InvitationError::NoLongerPending { .. }));

        alice.refresh().await.unwrap();
        assert!(alice.outgoing().is_empty());
        assert!(alice.is_friend(BOB));
    }
}
