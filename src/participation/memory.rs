use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use super::{
    ApprovalOutcome, Membership, MembershipRole, MembershipStatus, OverlappingMembership, ParticipationStore,
    PendingUpsert, StoreResult, Tour, TourStatus,
};

#[derive(Default)]
struct Inner {
    tours: HashMap<Uuid, Tour>,
    memberships: HashMap<Uuid, Membership>,
    by_pair: HashMap<(Uuid, Uuid), Uuid>,
}

impl Inner {
    fn approved_count(&self, tour_id: Uuid) -> i64 {
        self.memberships
            .values()
            .filter(|m| m.tour_id == tour_id && m.status == MembershipStatus::Approved)
            .count() as i64
    }

    fn overlapping(
        &self,
        user_id: Uuid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        exclude_tour_id: Option<Uuid>,
    ) -> Option<OverlappingMembership> {
        self.memberships
            .values()
            .filter(|m| m.user_id == user_id && m.status == MembershipStatus::Approved)
            .filter(|m| Some(m.tour_id) != exclude_tour_id)
            .filter_map(|m| {
                self.tours.get(&m.tour_id).map(|tour| OverlappingMembership {
                    membership: m.clone(),
                    tour: tour.clone(),
                })
            })
            .filter(|hit| hit.tour.status != TourStatus::Cancelled)
            .filter(|hit| hit.tour.overlaps(start_date, end_date))
            .min_by_key(|hit| hit.tour.start_date)
    }
}

/// Process-local store. Each call runs inside one critical section, which gives
/// the same all-or-nothing behavior the PostgreSQL store gets from conditional
/// writes, but only within a single process.
#[derive(Default)]
pub struct MemoryParticipationStore {
    inner: Mutex<Inner>,
}

impl MemoryParticipationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tour(&self, tour: Tour) {
        self.lock().tours.insert(tour.id, tour);
    }

    pub fn set_tour_status(&self, tour_id: Uuid, status: TourStatus) {
        if let Some(tour) = self.lock().tours.get_mut(&tour_id) {
            tour.status = status;
        }
    }

    pub fn membership_rows(&self, tour_id: Uuid) -> usize {
        self.lock()
            .memberships
            .values()
            .filter(|m| m.tour_id == tour_id)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ParticipationStore for MemoryParticipationStore {
    async fn find_tour(&self, tour_id: Uuid) -> StoreResult<Option<Tour>> {
        Ok(self.lock().tours.get(&tour_id).cloned())
    }

    async fn find_request(&self, request_id: Uuid) -> StoreResult<Option<Membership>> {
        Ok(self.lock().memberships.get(&request_id).cloned())
    }

    async fn find_membership(
        &self,
        tour_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Option<Membership>> {
        let inner = self.lock();
        Ok(inner
            .by_pair
            .get(&(tour_id, user_id))
            .and_then(|id| inner.memberships.get(id))
            .cloned())
    }

    async fn upsert_pending_request(
        &self,
        tour_id: Uuid,
        user_id: Uuid,
        role: MembershipRole,
    ) -> StoreResult<PendingUpsert> {
        let now = Utc::now().naive_utc();
        let mut guard = self.lock();
        let inner = &mut *guard;

        if let Some(id) = inner.by_pair.get(&(tour_id, user_id)).copied() {
            if let Some(existing) = inner.memberships.get_mut(&id) {
                if existing.status != MembershipStatus::Rejected {
                    return Ok(PendingUpsert::AlreadyExists(existing.clone()));
                }
                existing.status = MembershipStatus::Pending;
                existing.role = role;
                existing.requested_at = now;
                existing.rejection_reason = None;
                existing.approved_by = None;
                existing.approved_at = None;
                existing.joined_at = None;
                return Ok(PendingUpsert::Requested(existing.clone()));
            }
        }

        let membership = Membership {
            id: Uuid::new_v4(),
            tour_id,
            user_id,
            role,
            status: MembershipStatus::Pending,
            requested_at: now,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            joined_at: None,
        };
        inner.by_pair.insert((tour_id, user_id), membership.id);
        inner.memberships.insert(membership.id, membership.clone());
        Ok(PendingUpsert::Requested(membership))
    }

    async fn approve(&self, request_id: Uuid, approver_id: Uuid) -> StoreResult<ApprovalOutcome> {
        let now = Utc::now().naive_utc();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let Some(request) = inner
            .memberships
            .get(&request_id)
            .filter(|m| m.status == MembershipStatus::Pending)
        else {
            return Ok(ApprovalOutcome::NotPending);
        };
        if let Some(tour) = inner.tours.get(&request.tour_id) {
            if let Some(hit) =
                inner.overlapping(request.user_id, tour.start_date, tour.end_date, Some(tour.id))
            {
                return Ok(ApprovalOutcome::Overlap(hit));
            }
        }

        let Some(m) = inner.memberships.get_mut(&request_id) else {
            return Ok(ApprovalOutcome::NotPending);
        };
        m.status = MembershipStatus::Approved;
        m.approved_by = Some(approver_id);
        m.approved_at = Some(now);
        m.joined_at = Some(now);
        Ok(ApprovalOutcome::Approved(m.clone()))
    }

    async fn reject(
        &self,
        request_id: Uuid,
        reason: Option<String>,
    ) -> StoreResult<Option<Membership>> {
        let mut inner = self.lock();
        Ok(inner
            .memberships
            .get_mut(&request_id)
            .filter(|m| m.status == MembershipStatus::Pending)
            .map(|m| {
                m.status = MembershipStatus::Rejected;
                m.rejection_reason = reason;
                m.clone()
            }))
    }

    async fn remove(&self, tour_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(id) = inner.by_pair.get(&(tour_id, user_id)).copied() else {
            return Ok(false);
        };
        let approved = inner
            .memberships
            .get(&id)
            .is_some_and(|m| m.status == MembershipStatus::Approved);
        if !approved {
            return Ok(false);
        }
        inner.memberships.remove(&id);
        inner.by_pair.remove(&(tour_id, user_id));
        Ok(true)
    }

    async fn count_approved(&self, tour_id: Uuid) -> StoreResult<i64> {
        Ok(self.lock().approved_count(tour_id))
    }

    async fn refresh_participant_count(&self, tour_id: Uuid) -> StoreResult<i32> {
        let mut inner = self.lock();
        let count = inner.approved_count(tour_id) as i32;
        if let Some(tour) = inner.tours.get_mut(&tour_id) {
            tour.participant_count = count;
        }
        Ok(count)
    }

    async fn find_overlapping(
        &self,
        user_id: Uuid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        exclude_tour_id: Option<Uuid>,
    ) -> StoreResult<Option<OverlappingMembership>> {
        Ok(self
            .lock()
            .overlapping(user_id, start_date, end_date, exclude_tour_id))
    }

    async fn list_pending(&self, tour_id: Uuid) -> StoreResult<Vec<Membership>> {
        let mut pending: Vec<Membership> = self
            .lock()
            .memberships
            .values()
            .filter(|m| m.tour_id == tour_id && m.status == MembershipStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.requested_at);
        Ok(pending)
    }

    async fn list_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Membership>> {
        let mut memberships: Vec<Membership> = self
            .lock()
            .memberships
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        memberships.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        Ok(memberships)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
