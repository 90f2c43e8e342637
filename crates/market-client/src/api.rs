//! The marketplace REST collaborator
//!
//! [`MarketplaceApi`] is the contract the sync core consumes; every call
//! returns `Result<T, ApiError>` so callers branch on [`ErrorKind`](crate::rest::ErrorKind)
//! instead of inspecting response shapes. [`HttpMarketplaceApi`] binds it to
//! the backend's HTTP routes.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::{
    ConversationSummary, DealershipWorker, FriendRequest, MarkReadReceipt, Message,
    MessageRequest, UserSummary, WorkerRole,
};
use crate::rest::{ApiError, RestClient, RestRequest};
use crate::types::{DealershipId, RequestId, UserId};

/// Result type for collaborator calls
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// REST operations the sync core depends on
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    /// One summary per counterpart the current user has exchanged messages with
    async fn list_conversations(&self) -> ApiResult<Vec<ConversationSummary>>;

    /// All messages exchanged with `counterpart`
    async fn get_messages(&self, counterpart: UserId) -> ApiResult<Vec<Message>>;

    /// Send a message; the backend flags it as a message request for non-friends
    async fn send_message(&self, receiver: UserId, content: String) -> ApiResult<Message>;

    /// Mark every message from `sender` to the current user as read
    async fn mark_messages_read(&self, sender: UserId) -> ApiResult<MarkReadReceipt>;

    /// The current user's friends
    async fn list_friends(&self) -> ApiResult<Vec<UserSummary>>;

    /// Pending friend requests, incoming and outgoing
    async fn list_friend_requests(&self) -> ApiResult<Vec<FriendRequest>>;

    /// Ask `addressee` to become a friend
    async fn send_friend_request(&self, addressee: UserId) -> ApiResult<FriendRequest>;

    /// Accept an incoming friend request
    async fn accept_friend_request(&self, id: RequestId) -> ApiResult<FriendRequest>;

    /// Reject an incoming friend request
    async fn decline_friend_request(&self, id: RequestId) -> ApiResult<FriendRequest>;

    /// Withdraw an outgoing friend request
    async fn cancel_friend_request(&self, id: RequestId) -> ApiResult<FriendRequest>;

    /// Pending message requests addressed to the current user
    async fn list_message_requests(&self) -> ApiResult<Vec<MessageRequest>>;

    /// Accept a message request
    async fn accept_message_request(&self, id: RequestId) -> ApiResult<MessageRequest>;

    /// Decline a message request
    async fn decline_message_request(&self, id: RequestId) -> ApiResult<MessageRequest>;

    /// Membership records of a dealership, including pending invitations
    async fn list_dealership_workers(&self, dealership: DealershipId) -> ApiResult<Vec<DealershipWorker>>;

    /// Invite `user` to `dealership` with `role`
    async fn invite_worker(
        &self,
        dealership: DealershipId,
        user: UserId,
        role: WorkerRole,
    ) -> ApiResult<DealershipWorker>;

    /// Accept a worker invitation addressed to the current user
    async fn accept_worker_invitation(&self, id: RequestId) -> ApiResult<DealershipWorker>;

    /// Decline a worker invitation addressed to the current user
    async fn decline_worker_invitation(&self, id: RequestId) -> ApiResult<DealershipWorker>;

    /// Revoke a membership or withdraw a pending invitation
    async fn remove_worker(&self, id: RequestId) -> ApiResult<DealershipWorker>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    receiver_id: UserId,
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FriendRequestBody {
    addressee_id: UserId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InviteWorkerBody {
    user_id: UserId,
    role: WorkerRole,
}

/// [`MarketplaceApi`] over the backend's HTTP routes
///
/// # Examples
/// ```
/// use market_client::api::HttpMarketplaceApi;
/// use market_client::rest::{RestClient, RestClientConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = RestClient::new(RestClientConfig::new("https://api.example.com"))?;
/// let api = HttpMarketplaceApi::new(client);
/// api.set_access_token("token").await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HttpMarketplaceApi {
    client: RestClient,
    access_token: Arc<RwLock<Option<String>>>,
}

impl HttpMarketplaceApi {
    /// Create an API binding without credentials
    pub fn new(client: RestClient) -> Self {
        Self {
            client,
            access_token: Arc::new(RwLock::new(None)),
        }
    }

    /// Use `token` as bearer credential for subsequent calls
    pub async fn set_access_token(&self, token: impl Into<String>) {
        *self.access_token.write().await = Some(token.into());
    }

    /// Drop the bearer credential
    pub async fn clear_access_token(&self) {
        *self.access_token.write().await = None;
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, request: RestRequest) -> ApiResult<T> {
        let token = self.access_token.read().await.clone();
        let response = self.client.send(request, token.as_deref()).await?;
        Ok(response.data)
    }
}

#[async_trait]
impl MarketplaceApi for HttpMarketplaceApi {
    async fn list_conversations(&self) -> ApiResult<Vec<ConversationSummary>> {
        self.call(RestRequest::get("/api/messages/conversations")).await
    }

    async fn get_messages(&self, counterpart: UserId) -> ApiResult<Vec<Message>> {
        self.call(RestRequest::get(format!("/api/messages/{}", counterpart))).await
    }

    async fn send_message(&self, receiver: UserId, content: String) -> ApiResult<Message> {
        let body = SendMessageBody { receiver_id: receiver, content };
        self.call(RestRequest::post("/api/messages").json_body(&body)?).await
    }

    async fn mark_messages_read(&self, sender: UserId) -> ApiResult<MarkReadReceipt> {
        self.call(RestRequest::put(format!("/api/messages/read/{}", sender))).await
    }

    async fn list_friends(&self) -> ApiResult<Vec<UserSummary>> {
        self.call(RestRequest::get("/api/friends")).await
    }

    async fn list_friend_requests(&self) -> ApiResult<Vec<FriendRequest>> {
        self.call(RestRequest::get("/api/friends/requests")).await
    }

    async fn send_friend_request(&self, addressee: UserId) -> ApiResult<FriendRequest> {
        let body = FriendRequestBody { addressee_id: addressee };
        self.call(RestRequest::post("/api/friends/requests").json_body(&body)?).await
    }

    async fn accept_friend_request(&self, id: RequestId) -> ApiResult<FriendRequest> {
        self.call(RestRequest::post(format!("/api/friends/requests/{}/accept", id))).await
    }

    async fn decline_friend_request(&self, id: RequestId) -> ApiResult<FriendRequest> {
        self.call(RestRequest::post(format!("/api/friends/requests/{}/reject", id))).await
    }

    async fn cancel_friend_request(&self, id: RequestId) -> ApiResult<FriendRequest> {
        self.call(RestRequest::delete(format!("/api/friends/requests/{}", id))).await
    }

    async fn list_message_requests(&self) -> ApiResult<Vec<MessageRequest>> {
        self.call(RestRequest::get("/api/messages/requests")).await
    }

    async fn accept_message_request(&self, id: RequestId) -> ApiResult<MessageRequest> {
        self.call(RestRequest::post(format!("/api/messages/requests/{}/accept", id))).await
    }

    async fn decline_message_request(&self, id: RequestId) -> ApiResult<MessageRequest> {
        self.call(RestRequest::post(format!("/api/messages/requests/{}/decline", id))).await
    }

    async fn list_dealership_workers(&self, dealership: DealershipId) -> ApiResult<Vec<DealershipWorker>> {
        self.call(RestRequest::get(format!("/api/dealerships/{}/workers", dealership))).await
    }

    async fn invite_worker(
        &self,
        dealership: DealershipId,
        user: UserId,
        role: WorkerRole,
    ) -> ApiResult<DealershipWorker> {
        let body = InviteWorkerBody { user_id: user, role };
        self.call(
            RestRequest::post(format!("/api/dealerships/{}/workers", dealership)).json_body(&body)?,
        )
        .await
    }

    async fn accept_worker_invitation(&self, id: RequestId) -> ApiResult<DealershipWorker> {
        self.call(RestRequest::post(format!("/api/dealerships/workers/{}/accept", id))).await
    }

    async fn decline_worker_invitation(&self, id: RequestId) -> ApiResult<DealershipWorker> {
        self.call(RestRequest::post(format!("/api/dealerships/workers/{}/decline", id))).await
    }

    async fn remove_worker(&self, id: RequestId) -> ApiResult<DealershipWorker> {
        self.call(RestRequest::delete(format!("/api/dealerships/workers/{}", id))).await
    }
}
