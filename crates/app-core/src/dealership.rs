//! Dealership worker invitations and memberships
//!
//! A worker invitation follows the shared lifecycle while Pending. Accepting
//! it turns the record into an Active membership carrying the invited role;
//! an Active membership can later be removed by a dealership admin.

use app_state::session::SessionContext;
use app_state::{AppEvent, EventBus};
use market_client::{
    DealershipId, DealershipWorker, ErrorKind, MarketplaceApi, RequestId, UserId, WorkerRole,
    WorkerStatus,
};
use std::sync::Arc;

use crate::invitations::{
    expect_target, Claim, InvitationAction, InvitationBook, InvitationError, Result,
};

/// Check that an accepted invitation is Active and carries its role
fn verify_acceptance(
    invited_role: Option<WorkerRole>,
) -> impl FnOnce(&Claim, &DealershipWorker) -> Result<()> {
    move |claim, record| {
        let role_granted = match (invited_role, record.role) {
            (_, None) => false,
            (Some(invited), Some(granted)) => invited == granted,
            (None, Some(_)) => true,
        };
        if record.status == WorkerStatus::Active && role_granted {
            Ok(())
        } else {
            Err(InvitationError::PartialAcceptance(claim.id()))
        }
    }
}

/// Worker invitation and membership operations
pub struct WorkerService {
    api: Arc<dyn MarketplaceApi>,
    session: SessionContext,
    book: Arc<InvitationBook<DealershipWorker>>,
    bus: EventBus,
}

impl WorkerService {
    /// Create a new worker service
    pub fn new(api: Arc<dyn MarketplaceApi>, session: SessionContext, bus: EventBus) -> Self {
        let book = Arc::new(InvitationBook::new());
        session.register(&book);

        Self {
            api,
            session,
            book,
            bus,
        }
    }

    /// Refetch the membership records of `dealership`
    pub async fn refresh(&self, dealership: DealershipId) -> Result<Vec<DealershipWorker>> {
        self.session.require()?;
        let records = self.api.list_dealership_workers(dealership).await?;
        self.book
            .replace_where(|w| w.dealership_id == dealership, records);
        Ok(self.records(dealership))
    }

    fn records(&self, dealership: DealershipId) -> Vec<DealershipWorker> {
        self.book
            .all()
            .into_iter()
            .filter(|w| w.dealership_id == dealership)
            .collect()
    }

    /// Active members of `dealership`
    pub fn members(&self, dealership: DealershipId) -> Vec<DealershipWorker> {
        self.records(dealership)
            .into_iter()
            .filter(|w| w.status == WorkerStatus::Active)
            .collect()
    }

    /// Pending invitations of `dealership`
    pub fn pending_invitations(&self, dealership: DealershipId) -> Vec<DealershipWorker> {
        self.records(dealership)
            .into_iter()
            .filter(|w| w.status == WorkerStatus::Pending)
            .collect()
    }

    /// Look up a record
    pub fn get(&self, id: RequestId) -> Option<DealershipWorker> {
        self.book.get(id)
    }

    /// Invite `user` to `dealership` with `role`
    pub async fn invite(
        &self,
        dealership: DealershipId,
        user: UserId,
        role: WorkerRole,
    ) -> Result<DealershipWorker> {
        let me = self.session.user_id()?;
        if user == me {
            return Err(InvitationError::SelfInvitation);
        }
        if self.book.has_pending((dealership.get(), user.get())) {
            return Err(InvitationError::DuplicatePending);
        }
        if self.members(dealership).iter().any(|w| w.user.id == user) {
            return Err(InvitationError::AlreadyConnected);
        }

        let invitation = self.api.invite_worker(dealership, user, role).await?;
        tracing::debug!(id = %invitation.id, %dealership, %user, %role, "worker invited");

        self.book.upsert(invitation.clone());
        self.bus.publish(AppEvent::WorkerInvitationChanged { dealership });
        Ok(invitation)
    }

    /// Accept an invitation addressed to the current user
    ///
    /// The membership must come back Active with the invited role. Anything
    /// less is reported as [`InvitationError::PartialAcceptance`] and the
    /// dealership's records are refetched.
    pub async fn accept(&self, id: RequestId) -> Result<DealershipWorker> {
        let me = self.session.user_id()?;
        let invitation = self.book.get(id).ok_or(InvitationError::NotFound(id))?;
        let dealership = invitation.dealership_id;

        let api = self.api.clone();
        let result = self
            .book
            .resolve(
                id,
                InvitationAction::Accept,
                me,
                |id| async move { api.accept_worker_invitation(id).await },
                verify_acceptance(invitation.role),
            )
            .await;

        match result {
            Ok(accepted) => {
                self.bus.publish(AppEvent::WorkerInvitationChanged { dealership });
                Ok(accepted)
            }
            Err(e @ InvitationError::PartialAcceptance(_)) => {
                tracing::error!(%id, %dealership, "worker invitation accepted without its role");
                if let Err(refetch) = self.refresh(dealership).await {
                    tracing::warn!(%dealership, "refetch after partial acceptance failed: {}", refetch);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Decline an invitation addressed to the current user
    pub async fn decline(&self, id: RequestId) -> Result<DealershipWorker> {
        self.resolve_pending(id, InvitationAction::Decline).await
    }

    /// Withdraw a pending invitation on the dealership's behalf
    pub async fn withdraw(&self, id: RequestId) -> Result<DealershipWorker> {
        self.resolve_pending(id, InvitationAction::Cancel).await
    }

    async fn resolve_pending(&self, id: RequestId, action: InvitationAction) -> Result<DealershipWorker> {
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
                        InvitationAction::Decline => api.decline_worker_invitation(id).await,
                        _ => api.remove_worker(id).await,
                    }
                },
                // Both end as Removed on the backend
                |claim, record: &DealershipWorker| {
                    if record.status == WorkerStatus::Removed {
                        Ok(())
                    } else {
                        expect_target(claim, record)
                    }
                },
            )
            .await?;

        self.bus.publish(AppEvent::WorkerInvitationChanged {
            dealership: resolved.dealership_id,
        });
        Ok(resolved)
    }

    /// Remove an Active member (Active to Removed)
    pub async fn remove_member(&self, id: RequestId) -> Result<DealershipWorker> {
        self.session.require()?;
        let member = self.book.get(id).ok_or(InvitationError::NotFound(id))?;
        if member.status != WorkerStatus::Active {
            return Err(InvitationError::NotActive(id));
        }

        let removed = match self.api.remove_worker(id).await {
            Ok(removed) => removed,
            Err(e) if e.kind() == ErrorKind::Conflict => {
                tracing::info!(%id, "membership changed elsewhere: {}", e);
                return Err(InvitationError::NotActive(id));
            }
            Err(e) => return Err(e.into()),
        };

        self.book.upsert(removed.clone());
        self.bus.publish(AppEvent::WorkerInvitationChanged {
            dealership: removed.dealership_id,
        });
        Ok(removed)
    }
}
