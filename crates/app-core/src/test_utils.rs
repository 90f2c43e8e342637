//! In-memory collaborators for tests
//!
//! [`MarketplaceBackend`] is a small marketplace server held in memory.
//! Several users can act on it at once through [`InMemoryMarketplace`]
//! clients, and it enforces the same rules the real backend does: status
//! changes are compare-and-swap (409 once resolved), only the right party
//! may act (403), and every call is counted. Users with an attached
//! [`ScriptedTransport`] receive push events for the messages they send,
//! receive and have read.

use app_state::session::SessionContext;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use market_client::session::{MemorySessionStore, Session};
use market_client::{
    ApiError, ApiResult, ConversationSummary, DealershipId, DealershipWorker, FriendRequest,
    MarkReadReceipt, MarketplaceApi, Message, MessageId, MessageRequest, RequestId,
    RequestStatus, UserId, UserSummary, WorkerRole, WorkerStatus,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

use crate::invitations::user_pair;
use crate::realtime::{
    ConnectionHandle, PushConnection, PushEvent, PushTransport, TransportError, TransportSignal,
};

/// Let spawned tasks run until they go quiet
pub async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}

/// Poll `condition` until it holds or a second has passed
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}

// =============================================================================
// Scripted Transport
// =============================================================================

#[derive(Default)]
struct TransportState {
    /// Open connections by id; signals go to the newest
    open: BTreeMap<u64, mpsc::Sender<TransportSignal>>,
    next_connection: u64,
    connects: usize,
    closes: usize,
    fail_connects: bool,
}

/// Push transport driven by the test
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<TransportState>>,
}

impl ScriptedTransport {
    /// Create a transport that accepts connections
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connection attempts fail
    pub fn fail_connects(&self, fail: bool) {
        self.state.lock().fail_connects = fail;
    }

    /// Deliver `signal` on the newest open connection; dropped when none is open
    pub async fn push(&self, signal: TransportSignal) {
        let sender = self
            .state
            .lock()
            .open
            .last_key_value()
            .map(|(_, sender)| sender.clone());
        if let Some(sender) = sender {
            let _ = sender.send(signal).await;
        }
    }

    /// End the newest connection as if the transport gave up
    pub fn hang_up(&self) {
        self.state.lock().open.pop_last();
    }

    /// Connections opened so far
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Connections closed by the router so far
    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    /// Connections currently open
    pub fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Whether a connection is open
    pub fn is_open(&self) -> bool {
        self.open_count() > 0
    }
}

struct ScriptedHandle {
    id: u64,
    state: Arc<Mutex<TransportState>>,
}

#[async_trait]
impl ConnectionHandle for ScriptedHandle {
    async fn close(&self) {
        let mut state = self.state.lock();
        if state.open.remove(&self.id).is_some() {
            state.closes += 1;
        }
    }
}

#[async_trait]
impl PushTransport for ScriptedTransport {
    async fn connect(&self, _session: &Session, buffer: usize) -> Result<PushConnection, TransportError> {
        let mut state = self.state.lock();
        if state.fail_connects {
            return Err(TransportError("hub negotiation failed".to_string()));
        }
        let (tx, signals) = mpsc::channel(buffer);
        state.next_connection += 1;
        let id = state.next_connection;
        state.open.insert(id, tx);
        state.connects += 1;

        Ok(PushConnection {
            signals,
            handle: Box::new(ScriptedHandle {
                id,
                state: self.state.clone(),
            }),
        })
    }
}

// =============================================================================
// Marketplace Backend
// =============================================================================

struct BackendState {
    users: HashMap<UserId, UserSummary>,
    friendships: HashSet<(i64, i64)>,
    messages: Vec<Message>,
    friend_requests: BTreeMap<RequestId, FriendRequest>,
    message_requests: BTreeMap<RequestId, MessageRequest>,
    workers: BTreeMap<RequestId, DealershipWorker>,
    admins: HashSet<(DealershipId, UserId)>,
    transports: HashMap<UserId, ScriptedTransport>,
    failures: HashMap<&'static str, VecDeque<ApiError>>,
    holds: HashMap<&'static str, Arc<Semaphore>>,
    calls: HashMap<&'static str, usize>,
    drop_roles_on_accept: bool,
    next_message: i64,
    next_request: i64,
    clock: i64,
}

impl BackendState {
    fn now(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        base_time() + Duration::seconds(self.clock)
    }

    fn user(&self, id: UserId) -> ApiResult<UserSummary> {
        self.users
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::new(404, "UserNotFound", format!("User {} not found", id)))
    }

    fn are_friends(&self, a: UserId, b: UserId) -> bool {
        self.friendships.contains(&user_pair(a, b))
    }

    fn is_admin(&self, dealership: DealershipId, user: UserId) -> bool {
        self.admins.contains(&(dealership, user))
    }

    /// Whether messages between the pair are still a message request
    fn is_request_between(&self, a: UserId, b: UserId) -> bool {
        if self.are_friends(a, b) {
            return false;
        }
        !self.message_requests.values().any(|r| {
            r.status == RequestStatus::Accepted
                && user_pair(r.requester.id, r.addressee.id) == user_pair(a, b)
        })
    }
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn conflict(what: &str, id: RequestId) -> ApiError {
    ApiError::new(409, "NotPending", format!("{} {} is no longer pending", what, id))
}

fn forbidden(message: &str) -> ApiError {
    ApiError::new(403, "Forbidden", message)
}

fn not_found(what: &str, id: RequestId) -> ApiError {
    ApiError::new(404, "NotFound", format!("{} {} not found", what, id))
}

/// Shared in-memory marketplace
#[derive(Clone)]
pub struct MarketplaceBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MarketplaceBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                users: HashMap::new(),
                friendships: HashSet::new(),
                messages: Vec::new(),
                friend_requests: BTreeMap::new(),
                message_requests: BTreeMap::new(),
                workers: BTreeMap::new(),
                admins: HashSet::new(),
                transports: HashMap::new(),
                failures: HashMap::new(),
                holds: HashMap::new(),
                calls: HashMap::new(),
                drop_roles_on_accept: false,
                next_message: 1,
                next_request: 1,
                clock: 0,
            })),
        }
    }

    /// Register a user
    pub fn add_user(&self, id: UserId, username: &str) -> UserSummary {
        let user = UserSummary::new(id, username);
        self.state.lock().users.insert(id, user.clone());
        user
    }

    /// Make `a` and `b` friends
    pub fn befriend(&self, a: UserId, b: UserId) {
        self.state.lock().friendships.insert(user_pair(a, b));
    }

    /// Create a dealership administered by `admin`
    pub fn add_dealership(&self, dealership: DealershipId, admin: UserId) {
        self.state.lock().admins.insert((dealership, admin));
    }

    /// Deliver push events for `user` through `transport`
    pub fn attach_transport(&self, user: UserId, transport: ScriptedTransport) {
        self.state.lock().transports.insert(user, transport);
    }

    /// Make the next call to `op` fail with `error`
    pub fn fail_next(&self, op: &'static str, error: ApiError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Hold calls to `op` until [`release`](Self::release) is called
    pub fn hold(&self, op: &'static str) {
        self.state.lock().holds.insert(op, Arc::new(Semaphore::new(0)));
    }

    /// Let one held call to `op` through
    pub fn release(&self, op: &'static str) {
        if let Some(gate) = self.state.lock().holds.get(op) {
            gate.add_permits(1);
        }
    }

    /// Accept worker invitations without granting their role
    pub fn drop_roles_on_accept(&self, drop_roles: bool) {
        self.state.lock().drop_roles_on_accept = drop_roles;
    }

    /// How many times `op` was called
    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Insert a message directly, as if sent from another device
    pub fn insert_message(&self, sender: UserId, receiver: UserId, content: &str) -> Message {
        let mut state = self.state.lock();
        let message = Message {
            id: MessageId(state.next_message),
            sender_id: sender,
            receiver_id: receiver,
            content: content.to_string(),
            sent_at: state.now(),
            is_read: false,
            read_at: None,
            is_message_request: state.is_request_between(sender, receiver),
        };
        state.next_message += 1;
        state.messages.push(message.clone());
        message
    }

    /// A message as the backend holds it
    pub fn message(&self, id: MessageId) -> Option<Message> {
        self.state.lock().messages.iter().find(|m| m.id == id).cloned()
    }

    /// A client acting as `user`
    pub fn client_for(&self, user: UserId) -> InMemoryMarketplace {
        InMemoryMarketplace {
            backend: self.clone(),
            me: user,
        }
    }

    /// A session context signed in as `user`
    pub async fn session_for(&self, user: UserId) -> SessionContext {
        let summary = self
            .state
            .lock()
            .users
            .get(&user)
            .cloned()
            .unwrap_or_else(|| UserSummary::new(user, format!("user{}", user)));
        let context = SessionContext::new(Arc::new(MemorySessionStore::new()));
        if let Err(e) = context.begin(Session::new(summary, format!("token-{}", user))).await {
            tracing::error!("failed to start test session: {}", e);
        }
        context
    }

    async fn enter(&self, op: &'static str) -> ApiResult<()> {
        let gate = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            state.holds.get(op).cloned()
        };

        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let mut state = self.state.lock();
        match state.failures.get_mut(op).and_then(|q| q.pop_front()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn push_to(&self, pushes: Vec<(UserId, PushEvent)>) -> Vec<(ScriptedTransport, TransportSignal)> {
        let state = self.state.lock();
        pushes
            .into_iter()
            .filter_map(|(user, event)| {
                state
                    .transports
                    .get(&user)
                    .map(|t| (t.clone(), TransportSignal::Event(event)))
            })
            .collect()
    }
}

impl Default for MarketplaceBackend {
    fn default() -> Self {
        Self::new()
    }
}

async fn deliver(pushes: Vec<(ScriptedTransport, TransportSignal)>) {
    for (transport, signal) in pushes {
        transport.push(signal).await;
    }
}

/// [`MarketplaceApi`] client of a [`MarketplaceBackend`]
#[derive(Clone)]
pub struct InMemoryMarketplace {
    backend: MarketplaceBackend,
    me: UserId,
}

impl InMemoryMarketplace {
    fn state(&self) -> parking_lot::MutexGuard<'_, BackendState> {
        self.backend.state.lock()
    }
}

#[async_trait]
impl MarketplaceApi for InMemoryMarketplace {
    async fn list_conversations(&self) -> ApiResult<Vec<ConversationSummary>> {
        self.backend.enter("list_conversations").await?;
        let state = self.state();
        let me = self.me;

        let mut latest: HashMap<UserId, (Message, u32)> = HashMap::new();
        for message in state.messages.iter().filter(|m| m.sender_id == me || m.receiver_id == me) {
            let entry = latest
                .entry(message.counterpart(me))
                .or_insert_with(|| (message.clone(), 0));
            if message.sent_at >= entry.0.sent_at {
                entry.0 = message.clone();
            }
            if message.is_unread_for(me) {
                entry.1 += 1;
            }
        }

        let mut summaries: Vec<ConversationSummary> = latest
            .into_iter()
            .map(|(counterpart, (last_message, unread_count))| ConversationSummary {
                user: state
                    .users
                    .get(&counterpart)
                    .cloned()
                    .unwrap_or_else(|| UserSummary::new(counterpart, format!("user{}", counterpart))),
                last_message,
                unread_count,
                is_friend: state.are_friends(me, counterpart),
            })
            .collect();
        summaries.sort_by(|a, b| b.last_message.sent_at.cmp(&a.last_message.sent_at));
        Ok(summaries)
    }

    async fn get_messages(&self, counterpart: UserId) -> ApiResult<Vec<Message>> {
        self.backend.enter("get_messages").await?;
        let me = self.me;
        Ok(self
            .state()
            .messages
            .iter()
            .filter(|m| m.counterpart(me) == counterpart && (m.sender_id == me || m.receiver_id == me))
            .cloned()
            .collect())
    }

    async fn send_message(&self, receiver: UserId, content: String) -> ApiResult<Message> {
        self.backend.enter("send_message").await?;
        let me = self.me;

        let (message, pushes) = {
            let mut state = self.state();
            if content.trim().is_empty() {
                return Err(ApiError::new(422, "InvalidContent", "Message content is required"));
            }
            let requester = state.user(me)?;
            let addressee = state.user(receiver)?;

            let is_message_request = state.is_request_between(me, receiver);
            let message = Message {
                id: MessageId(state.next_message),
                sender_id: me,
                receiver_id: receiver,
                content,
                sent_at: state.now(),
                is_read: false,
                read_at: None,
                is_message_request,
            };
            state.next_message += 1;
            state.messages.push(message.clone());

            let already_requested = state.message_requests.values().any(|r| {
                r.status == RequestStatus::Pending && r.requester.id == me && r.addressee.id == receiver
            });
            if is_message_request && !already_requested {
                let id = RequestId(state.next_request);
                state.next_request += 1;
                let created_at = state.now();
                state.message_requests.insert(
                    id,
                    MessageRequest {
                        id,
                        requester,
                        addressee,
                        status: RequestStatus::Pending,
                        created_at,
                        first_message: Some(message.clone()),
                    },
                );
            }

            let pushes = vec![
                (receiver, PushEvent::MessageReceived(message.clone())),
                (me, PushEvent::MessageSent(message.clone())),
            ];
            (message, pushes)
        };

        deliver(self.backend.push_to(pushes)).await;
        Ok(message)
    }

    async fn mark_messages_read(&self, sender: UserId) -> ApiResult<MarkReadReceipt> {
        self.backend.enter("mark_messages_read").await?;
        let me = self.me;

        let (receipt, pushes) = {
            let mut state = self.state();
            let read_at = state.now();
            let mut marked = Vec::new();
            for message in state
                .messages
                .iter_mut()
                .filter(|m| m.sender_id == sender && m.receiver_id == me && !m.is_read)
            {
                message.is_read = true;
                message.read_at = Some(read_at);
                marked.push(message.id);
            }

            let pushes = marked
                .iter()
                .map(|id| {
                    (
                        sender,
                        PushEvent::MessageRead {
                            message_id: *id,
                            read_at,
                        },
                    )
                })
                .collect();
            (MarkReadReceipt { marked, read_at }, pushes)
        };

        deliver(self.backend.push_to(pushes)).await;
        Ok(receipt)
    }

    async fn list_friends(&self) -> ApiResult<Vec<UserSummary>> {
        self.backend.enter("list_friends").await?;
        let state = self.state();
        let me = self.me;
        let mut friends: Vec<UserSummary> = state
            .users
            .values()
            .filter(|u| u.id != me && state.are_friends(me, u.id))
            .cloned()
            .collect();
        friends.sort_by_key(|u| u.id);
        Ok(friends)
    }

    async fn list_friend_requests(&self) -> ApiResult<Vec<FriendRequest>> {
        self.backend.enter("list_friend_requests").await?;
        let me = self.me;
        Ok(self
            .state()
            .friend_requests
            .values()
            .filter(|r| r.status.is_pending() && (r.requester.id == me || r.addressee.id == me))
            .cloned()
            .collect())
    }

    async fn send_friend_request(&self, addressee: UserId) -> ApiResult<FriendRequest> {
        self.backend.enter("send_friend_request").await?;
        let me = self.me;
        let mut state = self.state();

        if addressee == me {
            return Err(ApiError::new(422, "InvalidAddressee", "Cannot befriend yourself"));
        }
        if state.are_friends(me, addressee) {
            return Err(ApiError::new(409, "AlreadyFriends", "Already friends"));
        }
        let pair = user_pair(me, addressee);
        if state
            .friend_requests
            .values()
            .any(|r| r.status.is_pending() && user_pair(r.requester.id, r.addressee.id) == pair)
        {
            return Err(ApiError::new(409, "DuplicateRequest", "A request is already pending"));
        }

        let request = FriendRequest {
            id: RequestId(state.next_request),
            requester: state.user(me)?,
            addressee: state.user(addressee)?,
            status: RequestStatus::Pending,
            created_at: state.now(),
        };
        state.next_request += 1;
        state.friend_requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn accept_friend_request(&self, id: RequestId) -> ApiResult<FriendRequest> {
        self.backend.enter("accept_friend_request").await?;
        let me = self.me;
        let mut state = self.state();

        let request = state
            .friend_requests
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("Friend request", id))?;
        if request.addressee.id != me {
            return Err(forbidden("Only the addressee may accept"));
        }
        if !request.status.is_pending() {
            return Err(conflict("Friend request", id));
        }

        let mut accepted = request;
        accepted.status = RequestStatus::Accepted;
        state.friendships.insert(user_pair(accepted.requester.id, accepted.addressee.id));
        state.friend_requests.insert(id, accepted.clone());
        Ok(accepted)
    }

    async fn decline_friend_request(&self, id: RequestId) -> ApiResult<FriendRequest> {
        self.backend.enter("decline_friend_request").await?;
        let me = self.me;
        let mut state = self.state();

        let request = state
            .friend_requests
            .get_mut(&id)
            .ok_or_else(|| not_found("Friend request", id))?;
        if request.addressee.id != me {
            return Err(forbidden("Only the addressee may reject"));
        }
        if !request.status.is_pending() {
            return Err(conflict("Friend request", id));
        }
        request.status = RequestStatus::Rejected;
        Ok(request.clone())
    }

    async fn cancel_friend_request(&self, id: RequestId) -> ApiResult<FriendRequest> {
        self.backend.enter("cancel_friend_request").await?;
        let me = self.me;
        let mut state = self.state();

        let request = state
            .friend_requests
            .get_mut(&id)
            .ok_or_else(|| not_found("Friend request", id))?;
        if request.requester.id != me {
            return Err(forbidden("Only the requester may cancel"));
        }
        if !request.status.is_pending() {
            return Err(conflict("Friend request", id));
        }
        request.status = RequestStatus::Cancelled;
        Ok(request.clone())
    }

    async fn list_message_requests(&self) -> ApiResult<Vec<MessageRequest>> {
        self.backend.enter("list_message_requests").await?;
        let me = self.me;
        Ok(self
            .state()
            .message_requests
            .values()
            .filter(|r| r.status.is_pending() && r.addressee.id == me)
            .cloned()
            .collect())
    }

    async fn accept_message_request(&self, id: RequestId) -> ApiResult<MessageRequest> {
        self.backend.enter("accept_message_request").await?;
        let me = self.me;
        let mut state = self.state();

        let request = state
            .message_requests
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("Message request", id))?;
        if request.addressee.id != me {
            return Err(forbidden("Only the addressee may accept"));
        }
        if !request.status.is_pending() {
            return Err(conflict("Message request", id));
        }

        let mut accepted = request;
        accepted.status = RequestStatus::Accepted;
        let pair = user_pair(accepted.requester.id, accepted.addressee.id);
        for message in state
            .messages
            .iter_mut()
            .filter(|m| user_pair(m.sender_id, m.receiver_id) == pair)
        {
            message.is_message_request = false;
        }
        state.message_requests.insert(id, accepted.clone());
        Ok(accepted)
    }

    async fn decline_message_request(&self, id: RequestId) -> ApiResult<MessageRequest> {
        self.backend.enter("decline_message_request").await?;
        let me = self.me;
        let mut state = self.state();

        let request = state
            .message_requests
            .get_mut(&id)
            .ok_or_else(|| not_found("Message request", id))?;
        if request.addressee.id != me {
            return Err(forbidden("Only the addressee may decline"));
        }
        if !request.status.is_pending() {
            return Err(conflict("Message request", id));
        }
        request.status = RequestStatus::Rejected;
        Ok(request.clone())
    }

    async fn list_dealership_workers(&self, dealership: DealershipId) -> ApiResult<Vec<DealershipWorker>> {
        self.backend.enter("list_dealership_workers").await?;
        let me = self.me;
        let state = self.state();
        let admin = state.is_admin(dealership, me);
        Ok(state
            .workers
            .values()
            .filter(|w| w.dealership_id == dealership && (admin || w.user.id == me))
            .cloned()
            .collect())
    }

    async fn invite_worker(
        &self,
        dealership: DealershipId,
        user: UserId,
        role: WorkerRole,
    ) -> ApiResult<DealershipWorker> {
        self.backend.enter("invite_worker").await?;
        let me = self.me;
        let mut state = self.state();

        if !state.is_admin(dealership, me) {
            return Err(forbidden("Only dealership admins may invite workers"));
        }
        if state.workers.values().any(|w| {
            w.dealership_id == dealership && w.user.id == user && w.status != WorkerStatus::Removed
        }) {
            return Err(ApiError::new(409, "AlreadyInvited", "User is already invited or a member"));
        }

        let worker = DealershipWorker {
            id: RequestId(state.next_request),
            dealership_id: dealership,
            inviter_id: me,
            user: state.user(user)?,
            role: Some(role),
            status: WorkerStatus::Pending,
            created_at: state.now(),
        };
        state.next_request += 1;
        state.workers.insert(worker.id, worker.clone());
        Ok(worker)
    }

    async fn accept_worker_invitation(&self, id: RequestId) -> ApiResult<DealershipWorker> {
        self.backend.enter("accept_worker_invitation").await?;
        let me = self.me;
        let mut state = self.state();
        let drop_roles = state.drop_roles_on_accept;

        let worker = state
            .workers
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("Worker invitation", id))?;
        if worker.user.id != me {
            return Err(forbidden("Only the invited user may accept"));
        }
        if worker.status != WorkerStatus::Pending {
            return Err(conflict("Worker invitation", id));
        }

        let mut accepted = worker;
        accepted.status = WorkerStatus::Active;
        if drop_roles {
            accepted.role = None;
        } else if accepted.role == Some(WorkerRole::Admin) {
            state.admins.insert((accepted.dealership_id, me));
        }
        state.workers.insert(id, accepted.clone());
        Ok(accepted)
    }

    async fn decline_worker_invitation(&self, id: RequestId) -> ApiResult<DealershipWorker> {
        self.backend.enter("decline_worker_invitation").await?;
        let me = self.me;
        let mut state = self.state();

        let worker = state
            .workers
            .get_mut(&id)
            .ok_or_else(|| not_found("Worker invitation", id))?;
        if worker.user.id != me {
            return Err(forbidden("Only the invited user may decline"));
        }
        if worker.status != WorkerStatus::Pending {
            return Err(conflict("Worker invitation", id));
        }
        worker.status = WorkerStatus::Removed;
        Ok(worker.clone())
    }

    async fn remove_worker(&self, id: RequestId) -> ApiResult<DealershipWorker> {
        self.backend.enter("remove_worker").await?;
        let me = self.me;
        let mut state = self.state();

        let worker = state
            .workers
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("Worker", id))?;
        if !state.is_admin(worker.dealership_id, me) {
            return Err(forbidden("Only dealership admins may remove workers"));
        }
        if worker.status == WorkerStatus::Removed {
            return Err(conflict("Worker", id));
        }

        let mut removed = worker;
        removed.status = WorkerStatus::Removed;
        state.admins.remove(&(removed.dealership_id, removed.user.id));
        state.workers.insert(id, removed.clone());
        Ok(removed)
    }
}
