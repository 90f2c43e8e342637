//! Invitation lifecycle
//!
//! Friend requests, message requests and dealership worker invitations share
//! one state machine:
//!
//! ```text
//! Pending --accept (addressee)--> Accepted
//!         --decline (addressee)-> Declined
//!         --cancel (requester)--> Cancelled
//! ```
//!
//! Terminal states are absorbing. Every mutation goes through an
//! [`InvitationBook`], which claims the record before the network call so
//! two local mutations of the same invitation cannot both proceed, and the
//! backend's 409 answer turns a lost race between sessions into
//! [`InvitationError::NoLongerPending`].

use app_state::mutation::{FailureKind, ViewError};
use app_state::session::{SessionScoped, SessionStateError};
use market_client::{
    ApiError, ApiResult, DealershipWorker, ErrorKind, FriendRequest, MessageRequest, RequestId,
    RequestStatus, UserId, WorkerStatus,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use thiserror::Error;

// =============================================================================
// State Machine
// =============================================================================

/// Lifecycle state of an invitation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvitationState {
    /// Awaiting a decision
    Pending,
    /// Accepted by the addressee
    Accepted,
    /// Declined by the addressee
    Declined,
    /// Withdrawn by the requester
    Cancelled,
}

impl InvitationState {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        self != InvitationState::Pending
    }
}

impl std::fmt::Display for InvitationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            InvitationState::Pending => "pending",
            InvitationState::Accepted => "accepted",
            InvitationState::Declined => "declined",
            InvitationState::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Mutations of an invitation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationAction {
    /// Accept
    Accept,
    /// Decline (reject)
    Decline,
    /// Withdraw
    Cancel,
}

impl std::fmt::Display for InvitationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            InvitationAction::Accept => "accept",
            InvitationAction::Decline => "decline",
            InvitationAction::Cancel => "cancel",
        };
        f.write_str(label)
    }
}

/// The current user's side of an invitation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// Sent the invitation
    Requester,
    /// Received the invitation
    Addressee,
}

/// Errors from invitation operations
#[derive(Debug, Error)]
pub enum InvitationError {
    /// Someone else resolved the invitation first
    #[error("Invitation {id} is no longer pending")]
    NoLongerPending {
        /// The invitation
        id: RequestId,
    },

    /// The current user may not perform this action
    #[error("Only the {allowed:?} may {action} this invitation")]
    NotPermitted {
        /// Attempted action
        action: InvitationAction,
        /// The side allowed to perform it
        allowed: Actor,
    },

    /// The current user is not a party to the invitation
    #[error("You are not a party to invitation {0}")]
    NotAParty(RequestId),

    /// An invitation for the same pair is already pending
    #[error("An invitation is already pending")]
    DuplicatePending,

    /// Inviting yourself
    #[error("You cannot invite yourself")]
    SelfInvitation,

    /// Already friends or already a member
    #[error("Already connected")]
    AlreadyConnected,

    /// The invitation is not known locally
    #[error("Invitation {0} not found")]
    NotFound(RequestId),

    /// The record is not an active membership
    #[error("Membership {0} is not active")]
    NotActive(RequestId),

    /// The backend answered with a state other than the one requested
    #[error("Invitation {id} ended up {found} instead of {expected}")]
    Unconfirmed {
        /// The invitation
        id: RequestId,
        /// State the action should have produced
        expected: InvitationState,
        /// State the backend reported
        found: InvitationState,
    },

    /// Acceptance changed the status without granting the role
    #[error("Invitation {0} was accepted without its role")]
    PartialAcceptance(RequestId),

    /// Collaborator failure
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// No active session
    #[error(transparent)]
    Session(#[from] SessionStateError),
}

/// Result type for invitation operations
pub type Result<T> = std::result::Result<T, InvitationError>;

impl From<InvitationError> for ViewError {
    fn from(err: InvitationError) -> Self {
        let kind = match &err {
            InvitationError::Api(e) => return ViewError::from(e),
            InvitationError::NoLongerPending { .. }
            | InvitationError::NotFound(_)
            | InvitationError::NotActive(_)
            | InvitationError::Unconfirmed { .. }
            | InvitationError::PartialAcceptance(_) => FailureKind::Conflict,
            InvitationError::NotPermitted { .. }
            | InvitationError::NotAParty(_)
            | InvitationError::Session(_) => FailureKind::Permission,
            InvitationError::DuplicatePending
            | InvitationError::SelfInvitation
            | InvitationError::AlreadyConnected => FailureKind::Validation,
        };
        ViewError::new(kind, err.to_string())
    }
}

/// Apply `action` by `actor` to an invitation in `state`
///
/// # Examples
/// ```
/// use app_core::invitations::{transition, Actor, InvitationAction, InvitationState};
///
/// let next = transition(InvitationState::Pending, InvitationAction::Accept, Actor::Addressee);
/// assert_eq!(next.unwrap(), InvitationState::Accepted);
/// ```
pub fn transition(
    state: InvitationState,
    action: InvitationAction,
    actor: Actor,
) -> std::result::Result<InvitationState, TransitionError> {
    if state.is_terminal() {
        return Err(TransitionError::Terminal(state));
    }

    match (action, actor) {
        (InvitationAction::Accept, Actor::Addressee) => Ok(InvitationState::Accepted),
        (InvitationAction::Decline, Actor::Addressee) => Ok(InvitationState::Declined),
        (InvitationAction::Cancel, Actor::Requester) => Ok(InvitationState::Cancelled),
        (InvitationAction::Cancel, _) => Err(TransitionError::WrongActor(Actor::Requester)),
        (_, _) => Err(TransitionError::WrongActor(Actor::Addressee)),
    }
}

/// Why a transition is not allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    /// The invitation is already resolved
    Terminal(InvitationState),
    /// Only the given side may perform the action
    WrongActor(Actor),
}

// =============================================================================
// Invitation Records
// =============================================================================

/// A record following the invitation lifecycle
pub trait Invitation: Clone + Send + Sync + 'static {
    /// Record id
    fn id(&self) -> RequestId;

    /// Lifecycle state
    fn state(&self) -> InvitationState;

    /// Which side `me` is on, if any
    fn actor(&self, me: UserId) -> Option<Actor>;

    /// Key identifying the pair that may have only one pending record
    fn pair_key(&self) -> (i64, i64);
}

fn request_state(status: RequestStatus) -> InvitationState {
    match status {
        RequestStatus::Pending => InvitationState::Pending,
        RequestStatus::Accepted => InvitationState::Accepted,
        RequestStatus::Rejected => InvitationState::Declined,
        RequestStatus::Cancelled => InvitationState::Cancelled,
    }
}

fn party(requester: UserId, addressee: UserId, me: UserId) -> Option<Actor> {
    if me == requester {
        Some(Actor::Requester)
    } else if me == addressee {
        Some(Actor::Addressee)
    } else {
        None
    }
}

/// Unordered key for a pair of users
pub fn user_pair(a: UserId, b: UserId) -> (i64, i64) {
    let (a, b) = (a.get(), b.get());
    (a.min(b), a.max(b))
}

impl Invitation for FriendRequest {
    fn id(&self) -> RequestId {
        self.id
    }

    fn state(&self) -> InvitationState {
        request_state(self.status)
    }

    fn actor(&self, me: UserId) -> Option<Actor> {
        party(self.requester.id, self.addressee.id, me)
    }

    fn pair_key(&self) -> (i64, i64) {
        user_pair(self.requester.id, self.addressee.id)
    }
}

impl Invitation for MessageRequest {
    fn id(&self) -> RequestId {
        self.id
    }

    fn state(&self) -> InvitationState {
        request_state(self.status)
    }

    fn actor(&self, me: UserId) -> Option<Actor> {
        party(self.requester.id, self.addressee.id, me)
    }

    fn pair_key(&self) -> (i64, i64) {
        (self.requester.id.get(), self.addressee.id.get())
    }
}

impl Invitation for DealershipWorker {
    fn id(&self) -> RequestId {
        self.id
    }

    /// Active counts as accepted; a removed record is resolved either way
    fn state(&self) -> InvitationState {
        match self.status {
            WorkerStatus::Pending => InvitationState::Pending,
            WorkerStatus::Active => InvitationState::Accepted,
            WorkerStatus::Removed => InvitationState::Declined,
        }
    }

    /// The invited user answers; any other caller acts for the dealership
    fn actor(&self, me: UserId) -> Option<Actor> {
        if me == self.user.id {
            Some(Actor::Addressee)
        } else {
            Some(Actor::Requester)
        }
    }

    fn pair_key(&self) -> (i64, i64) {
        (self.dealership_id.get(), self.user.id.get())
    }
}

// =============================================================================
// Invitation Book
// =============================================================================

/// A claimed invitation awaiting its network call
#[derive(Debug)]
#[must_use = "a claim must be committed or aborted"]
pub struct Claim {
    id: RequestId,
    action: InvitationAction,
    target: InvitationState,
}

impl Claim {
    /// The claimed invitation
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// The action in flight
    pub fn action(&self) -> InvitationAction {
        self.action
    }

    /// State the action should produce
    pub fn target(&self) -> InvitationState {
        self.target
    }
}

#[derive(Debug)]
struct BookInner<I> {
    records: BTreeMap<RequestId, I>,
    claims: HashSet<RequestId>,
}

/// Known invitations of one kind, with in-flight claims
pub struct InvitationBook<I: Invitation> {
    inner: Mutex<BookInner<I>>,
}

impl<I: Invitation> InvitationBook<I> {
    /// Create an empty book
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BookInner {
                records: BTreeMap::new(),
                claims: HashSet::new(),
            }),
        }
    }

    /// Replace every record with a fresh fetch
    pub fn replace_all(&self, records: Vec<I>) {
        self.replace_where(|_| true, records);
    }

    /// Replace the records matching `scope` with a fresh fetch
    pub fn replace_where(&self, scope: impl Fn(&I) -> bool, records: Vec<I>) {
        let mut inner = self.inner.lock();
        inner.records.retain(|_, record| !scope(record));
        for record in records {
            inner.records.insert(record.id(), record);
        }
    }

    /// Insert or update one record
    pub fn upsert(&self, record: I) {
        self.inner.lock().records.insert(record.id(), record);
    }

    /// Look up a record
    pub fn get(&self, id: RequestId) -> Option<I> {
        self.inner.lock().records.get(&id).cloned()
    }

    /// Every known record
    pub fn all(&self) -> Vec<I> {
        self.inner.lock().records.values().cloned().collect()
    }

    /// Records still pending, in id order
    pub fn pending(&self) -> Vec<I> {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| r.state() == InvitationState::Pending)
            .cloned()
            .collect()
    }

    /// Whether a pending record exists for `pair`
    pub fn has_pending(&self, pair: (i64, i64)) -> bool {
        self.inner
            .lock()
            .records
            .values()
            .any(|r| r.state() == InvitationState::Pending && r.pair_key() == pair)
    }

    /// Whether a mutation of `id` is in flight
    pub fn is_claimed(&self, id: RequestId) -> bool {
        self.inner.lock().claims.contains(&id)
    }

    /// Reserve `id` for `action` by the side `me` is on
    ///
    /// Fails with [`InvitationError::NoLongerPending`] when the record is
    /// resolved or another mutation of it is already in flight.
    pub fn claim(&self, id: RequestId, action: InvitationAction, me: UserId) -> Result<Claim> {
        let mut inner = self.inner.lock();
        let record = inner.records.get(&id).ok_or(InvitationError::NotFound(id))?;
        let actor = record.actor(me).ok_or(InvitationError::NotAParty(id))?;

        let target = match transition(record.state(), action, actor) {
            Ok(target) => target,
            Err(TransitionError::Terminal(_)) => {
                return Err(InvitationError::NoLongerPending { id });
            }
            Err(TransitionError::WrongActor(allowed)) => {
                return Err(InvitationError::NotPermitted { action, allowed });
            }
        };

        if !inner.claims.insert(id) {
            tracing::debug!(%id, %action, "invitation already has a mutation in flight");
            return Err(InvitationError::NoLongerPending { id });
        }

        Ok(Claim { id, action, target })
    }

    /// Store the backend's record for a finished claim
    pub fn commit(&self, claim: Claim, record: I) {
        let mut inner = self.inner.lock();
        inner.claims.remove(&claim.id);
        inner.records.insert(record.id(), record);
    }

    /// Release a claim whose network call failed
    pub fn abort(&self, claim: Claim) {
        self.inner.lock().claims.remove(&claim.id);
    }

    /// Claim, call the backend, verify and commit
    ///
    /// `verify` sees the backend's record before it is committed; an error
    /// from it releases the claim and is returned as is. A 409 answer means
    /// another session resolved the invitation first.
    pub async fn resolve<F, Fut, V>(
        &self,
        id: RequestId,
        action: InvitationAction,
        me: UserId,
        call: F,
        verify: V,
    ) -> Result<I>
    where
        F: FnOnce(RequestId) -> Fut,
        Fut: Future<Output = ApiResult<I>>,
        V: FnOnce(&Claim, &I) -> Result<()>,
    {
        let claim = self.claim(id, action, me)?;

        match call(id).await {
            Ok(record) => {
                if let Err(e) = verify(&claim, &record) {
                    tracing::warn!(%id, %action, "invitation mutation not confirmed: {}", e);
                    self.abort(claim);
                    return Err(e);
                }
                self.commit(claim, record.clone());
                Ok(record)
            }
            Err(e) if e.kind() == ErrorKind::Conflict => {
                tracing::info!(%id, %action, "invitation resolved elsewhere: {}", e);
                self.abort(claim);
                Err(InvitationError::NoLongerPending { id })
            }
            Err(e) => {
                self.abort(claim);
                Err(e.into())
            }
        }
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.claims.clear();
    }
}

impl<I: Invitation> Default for InvitationBook<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Invitation> SessionScoped for InvitationBook<I> {
    fn on_session_end(&self) {
        self.clear();
    }
}

/// Default verification: the backend reports the state the action targets
pub fn expect_target<I: Invitation>(claim: &Claim, record: &I) -> Result<()> {
    if record.state() == claim.target() {
        Ok(())
    } else {
        Err(InvitationError::Unconfirmed {
            id: claim.id(),
            expected: claim.target(),
            found: record.state(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use market_client::UserSummary;
    use std::sync::Arc;

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);
    const EVE: UserId = UserId(3);

    fn friend_request(id: i64, status: RequestStatus) -> FriendRequest {
        FriendRequest {
            id: RequestId(id),
            requester: UserSummary::new(ALICE, "alice"),
            addressee: UserSummary::new(BOB, "bob"),
            status,
            created_at: Utc::now(),
        }
    }

    fn with_status(mut request: FriendRequest, status: RequestStatus) -> FriendRequest {
        request.status = status;
        request
    }

    #[test]
    fn test_transitions() {
        use InvitationAction::*;
        use InvitationState::*;

        assert_eq!(transition(Pending, Accept, Actor::Addressee), Ok(Accepted));
        assert_eq!(transition(Pending, Decline, Actor::Addressee), Ok(Declined));
        assert_eq!(transition(Pending, Cancel, Actor::Requester), Ok(Cancelled));

        assert_eq!(
            transition(Pending, Accept, Actor::Requester),
            Err(TransitionError::WrongActor(Actor::Addressee))
        );
        assert_eq!(
            transition(Pending, Cancel, Actor::Addressee),
            Err(TransitionError::WrongActor(Actor::Requester))
        );
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for state in [
            InvitationState::Accepted,
            InvitationState::Declined,
            InvitationState::Cancelled,
        ] {
            for action in [
                InvitationAction::Accept,
                InvitationAction::Decline,
                InvitationAction::Cancel,
            ] {
                for actor in [Actor::Requester, Actor::Addressee] {
                    assert_eq!(
                        transition(state, action, actor),
                        Err(TransitionError::Terminal(state))
                    );
                }
            }
        }
    }

    #[test]
    fn test_record_state_mapping() {
        assert_eq!(
            friend_request(1, RequestStatus::Rejected).state(),
            InvitationState::Declined
        );
        let request = friend_request(1, RequestStatus::Pending);
        assert_eq!(request.actor(ALICE), Some(Actor::Requester));
        assert_eq!(request.actor(BOB), Some(Actor::Addressee));
        assert_eq!(request.actor(EVE), None);
        assert_eq!(request.pair_key(), user_pair(BOB, ALICE));
    }

    #[test]
    fn test_claim_is_exclusive() {
        let book = InvitationBook::new();
        book.upsert(friend_request(42, RequestStatus::Pending));

        let claim = book.claim(RequestId(42), InvitationAction::Accept, BOB).unwrap();
        assert!(book.is_claimed(RequestId(42)));

        let second = book.claim(RequestId(42), InvitationAction::Cancel, ALICE);
        assert!(matches!(second, Err(InvitationError::NoLongerPending { .. })));

        book.commit(claim, friend_request(42, RequestStatus::Accepted));
        assert!(book.pending().is_empty());

        // Resolved now; any further mutation is refused
        let third = book.claim(RequestId(42), InvitationAction::Decline, BOB);
        assert!(matches!(third, Err(InvitationError::NoLongerPending { .. })));
    }

    #[test]
    fn test_claim_checks_actor() {
        let book = InvitationBook::new();
        book.upsert(friend_request(1, RequestStatus::Pending));

        assert!(matches!(
            book.claim(RequestId(1), InvitationAction::Accept, ALICE),
            Err(InvitationError::NotPermitted { allowed: Actor::Addressee, .. })
        ));
        assert!(matches!(
            book.claim(RequestId(1), InvitationAction::Accept, EVE),
            Err(InvitationError::NotAParty(_))
        ));
        assert!(matches!(
            book.claim(RequestId(9), InvitationAction::Accept, BOB),
            Err(InvitationError::NotFound(_))
        ));
    }

    #[test]
    fn test_abort_releases_claim() {
        let book = InvitationBook::new();
        book.upsert(friend_request(1, RequestStatus::Pending));

        let claim = book.claim(RequestId(1), InvitationAction::Decline, BOB).unwrap();
        book.abort(claim);

        assert!(!book.is_claimed(RequestId(1)));
        assert_eq!(book.pending().len(), 1);
    }

    #[test]
    fn test_has_pending_pair() {
        let book = InvitationBook::new();
        book.upsert(friend_request(1, RequestStatus::Pending));

        assert!(book.has_pending(user_pair(ALICE, BOB)));
        assert!(book.has_pending(user_pair(BOB, ALICE)));
        assert!(!book.has_pending(user_pair(ALICE, EVE)));
    }

    #[test]
    fn test_replace_where_keeps_other_scopes() {
        let book = InvitationBook::new();
        book.upsert(friend_request(1, RequestStatus::Pending));
        book.upsert(friend_request(2, RequestStatus::Pending));

        book.replace_where(|r| r.id == RequestId(1), vec![]);
        assert!(book.get(RequestId(1)).is_none());
        assert!(book.get(RequestId(2)).is_some());
    }

    #[tokio::test]
    async fn test_resolve_commits_confirmed_record() {
        let book = InvitationBook::new();
        book.upsert(friend_request(42, RequestStatus::Pending));

        let accepted = book
            .resolve(
                RequestId(42),
                InvitationAction::Accept,
                BOB,
                |id| async move {
                    Ok(with_status(friend_request(id.get(), RequestStatus::Pending), RequestStatus::Accepted))
                },
                expect_target,
            )
            .await
            .unwrap();

        assert_eq!(accepted.status, RequestStatus::Accepted);
        assert!(!book.is_claimed(RequestId(42)));
        assert!(book.pending().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_maps_conflict() {
        let book = InvitationBook::new();
        book.upsert(friend_request(42, RequestStatus::Pending));

        let err = book
            .resolve(
                RequestId(42),
                InvitationAction::Cancel,
                ALICE,
                |_| async { Err(ApiError::new(409, "NotPending", "already accepted")) },
                expect_target,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, InvitationError::NoLongerPending { .. }));
        assert!(!book.is_claimed(RequestId(42)));
        assert_eq!(ViewError::from(err).kind, FailureKind::Conflict);
    }

    #[tokio::test]
    async fn test_resolve_rejects_unconfirmed_state() {
        let book = InvitationBook::new();
        book.upsert(friend_request(7, RequestStatus::Pending));

        let err = book
            .resolve(
                RequestId(7),
                InvitationAction::Decline,
                BOB,
                |id| async move { Ok(friend_request(id.get(), RequestStatus::Pending)) },
                expect_target,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, InvitationError::Unconfirmed { found: InvitationState::Pending, .. }));
        assert_eq!(book.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_local_mutations() {
        let book = Arc::new(InvitationBook::new());
        book.upsert(friend_request(42, RequestStatus::Pending));
        let gate = Arc::new(tokio::sync::Notify::new());

        let accept = {
            let book = book.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                book.resolve(
                    RequestId(42),
                    InvitationAction::Accept,
                    BOB,
                    |id| async move {
                        gate.notified().await;
                        Ok(friend_request(id.get(), RequestStatus::Accepted))
                    },
                    expect_target,
                )
                .await
            })
        };
        tokio::task::yield_now().await;
        while !book.is_claimed(RequestId(42)) {
            tokio::task::yield_now().await;
        }

        let cancel = book
            .resolve(
                RequestId(42),
                InvitationAction::Cancel,
                ALICE,
                |id| async move { Ok(friend_request(id.get(), RequestStatus::Cancelled)) },
                expect_target,
            )
            .await;
        gate.notify_one();

        assert!(matches!(cancel, Err(InvitationError::NoLongerPending { .. })));
        assert!(accept.await.unwrap().is_ok());
    }

    #[test]
    fn test_view_error_classes() {
        assert_eq!(
            ViewError::from(InvitationError::DuplicatePending).kind,
            FailureKind::Validation
        );
        assert_eq!(
            ViewError::from(InvitationError::PartialAcceptance(RequestId(1))).kind,
            FailureKind::Conflict
        );
        let permission = ViewError::from(InvitationError::NotAParty(RequestId(1)));
        assert_eq!(permission.kind, FailureKind::Permission);
    }
}
