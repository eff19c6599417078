use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ApprovalOutcome, JoinConflict, Membership, MembershipRole, MembershipStatus,
    OverlappingMembership, ParticipationError, ParticipationResult, ParticipationStore,
    PendingUpsert, Tour, TourStatus,
};
use crate::notifications::NotificationBridge;

#[derive(Debug, Clone, Serialize)]
pub struct Approval {
    pub membership: Membership,
    pub participant_count: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Departure {
    pub tour_id: Uuid,
    pub user_id: Uuid,
    pub participant_count: i32,
}

/// Join/approve/reject/leave on top of a [`ParticipationStore`].
///
/// Nothing here retries. The store's guarded writes decide races; the
/// workflow turns their outcomes into typed errors and, on success, hands the
/// transition to the [`NotificationBridge`].
#[derive(Clone)]
pub struct ParticipationWorkflow {
    store: Arc<dyn ParticipationStore>,
    bridge: NotificationBridge,
}

impl ParticipationWorkflow {
    pub fn new(store: Arc<dyn ParticipationStore>, bridge: NotificationBridge) -> Self {
        Self { store, bridge }
    }

    pub fn store(&self) -> &dyn ParticipationStore {
        self.store.as_ref()
    }

    pub async fn request_join(&self, tour_id: Uuid, user_id: Uuid) -> ParticipationResult<Membership> {
        self.request_join_as(tour_id, user_id, MembershipRole::Participant)
            .await
    }

    pub async fn request_join_as(
        &self,
        tour_id: Uuid,
        user_id: Uuid,
        role: MembershipRole,
    ) -> ParticipationResult<Membership> {
        let tour = self.load_tour(tour_id).await?;
        if tour.status == TourStatus::Cancelled {
            return Err(ParticipationError::InvalidState(
                "tour has been cancelled".to_string(),
            ));
        }

        if let Some(existing) = self.store.find_membership(tour_id, user_id).await? {
            if existing.status != MembershipStatus::Rejected {
                let conflict = existing_conflict(&existing);
                debug!(%tour_id, %user_id, %conflict, "join request refused");
                return Err(ParticipationError::Conflict(conflict));
            }
        }

        if let Some(hit) = self
            .store
            .find_overlapping(user_id, tour.start_date, tour.end_date, Some(tour_id))
            .await?
        {
            let conflict = overlap_conflict(hit);
            debug!(%tour_id, %user_id, %conflict, "join request refused");
            return Err(ParticipationError::Conflict(conflict));
        }

        let membership = match self
            .store
            .upsert_pending_request(tour_id, user_id, role)
            .await?
        {
            PendingUpsert::Requested(membership) => membership,
            // lost a race with a concurrent request for the same pair
            PendingUpsert::AlreadyExists(existing) => {
                return Err(ParticipationError::Conflict(existing_conflict(&existing)));
            }
        };

        info!(%tour_id, %user_id, request_id = %membership.id, "tour join requested");
        self.bridge.join_requested(&membership, &tour);
        Ok(membership)
    }

    pub async fn approve_request(
        &self,
        request_id: Uuid,
        approver_id: Uuid,
    ) -> ParticipationResult<Approval> {
        let request = self.load_pending(request_id).await?;
        let tour = self.load_tour(request.tour_id).await?;

        let membership = match self.store.approve(request_id, approver_id).await? {
            ApprovalOutcome::Approved(membership) => membership,
            ApprovalOutcome::NotPending => {
                return Err(ParticipationError::RequestAlreadyProcessed { request_id });
            }
            ApprovalOutcome::Overlap(hit) => {
                let conflict = overlap_conflict(hit);
                debug!(%request_id, %conflict, "approval refused");
                return Err(ParticipationError::Conflict(conflict));
            }
        };
        let participant_count = self.store.refresh_participant_count(tour.id).await?;

        info!(
            tour_id = %tour.id,
            user_id = %membership.user_id,
            %request_id,
            %approver_id,
            participant_count,
            "tour join request approved"
        );
        self.bridge.request_approved(&membership, &tour);
        Ok(Approval {
            membership,
            participant_count,
        })
    }

    pub async fn reject_request(
        &self,
        request_id: Uuid,
        reason: Option<String>,
    ) -> ParticipationResult<Membership> {
        let request = self.load_pending(request_id).await?;
        let tour = self.load_tour(request.tour_id).await?;

        let membership = self
            .store
            .reject(request_id, reason)
            .await?
            .ok_or(ParticipationError::RequestAlreadyProcessed { request_id })?;

        info!(
            tour_id = %tour.id,
            user_id = %membership.user_id,
            %request_id,
            "tour join request rejected"
        );
        self.bridge.request_rejected(&membership, &tour);
        Ok(membership)
    }

    /// Leaving is silent: no notification is sent for this transition.
    pub async fn leave_tour(&self, tour_id: Uuid, user_id: Uuid) -> ParticipationResult<Departure> {
        if !self.is_approved_member(tour_id, user_id).await? {
            return Err(ParticipationError::InvalidState(
                "not an approved member of this tour".to_string(),
            ));
        }
        if !self.store.remove(tour_id, user_id).await? {
            return Err(ParticipationError::InvalidState(
                "membership was already removed".to_string(),
            ));
        }
        let participant_count = self.store.refresh_participant_count(tour_id).await?;

        info!(%tour_id, %user_id, participant_count, "left tour");
        Ok(Departure {
            tour_id,
            user_id,
            participant_count,
        })
    }

    pub async fn list_pending(&self, tour_id: Uuid) -> ParticipationResult<Vec<Membership>> {
        self.load_tour(tour_id).await?;
        Ok(self.store.list_pending(tour_id).await?)
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> ParticipationResult<Vec<Membership>> {
        Ok(self.store.list_for_user(user_id).await?)
    }

    pub async fn is_approved_member(&self, tour_id: Uuid, user_id: Uuid) -> ParticipationResult<bool> {
        Ok(self
            .store
            .find_membership(tour_id, user_id)
            .await?
            .is_some_and(|m| m.status == MembershipStatus::Approved))
    }

    async fn load_tour(&self, tour_id: Uuid) -> ParticipationResult<Tour> {
        self.store
            .find_tour(tour_id)
            .await?
            .ok_or(ParticipationError::TourNotFound { tour_id })
    }

    async fn load_pending(&self, request_id: Uuid) -> ParticipationResult<Membership> {
        self.store
            .find_request(request_id)
            .await?
            .filter(|m| m.status == MembershipStatus::Pending)
            .ok_or(ParticipationError::RequestAlreadyProcessed { request_id })
    }
}

fn existing_conflict(existing: &Membership) -> JoinConflict {
    match existing.status {
        MembershipStatus::Approved => JoinConflict::AlreadyMember {
            membership_id: existing.id,
        },
        MembershipStatus::Pending | MembershipStatus::Rejected => JoinConflict::AlreadyPending {
            request_id: existing.id,
        },
    }
}

fn overlap_conflict(hit: OverlappingMembership) -> JoinConflict {
    JoinConflict::DateOverlap {
        tour_id: hit.tour.id,
        tour_name: hit.tour.name,
        start_date: hit.tour.start_date,
        end_date: hit.tour.end_date,
    }
}
