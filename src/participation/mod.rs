//! Tour participation: join requests, approvals and memberships.
//!
//! A membership row is identified by `(tour_id, user_id)` and moves through
//! `pending -> approved | rejected`, `rejected -> pending` (re-application) and
//! `approved -> none` (leave). Every status transition is a single guarded
//! storage write; see [`ParticipationStore`].

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod pg;
pub mod workflow;

pub use memory::MemoryParticipationStore;
pub use pg::PgParticipationStore;
pub use workflow::{Approval, Departure, ParticipationWorkflow};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_APPROVED: &str = "approved";
pub const STATUS_REJECTED: &str = "rejected";

pub const TOUR_CANCELLED: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Pending,
    Approved,
    Rejected,
}

impl MembershipStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => STATUS_PENDING,
            Self::Approved => STATUS_APPROVED,
            Self::Rejected => STATUS_REJECTED,
        }
    }
}

impl FromStr for MembershipStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            STATUS_PENDING => Ok(Self::Pending),
            STATUS_APPROVED => Ok(Self::Approved),
            STATUS_REJECTED => Ok(Self::Rejected),
            other => Err(StoreError::Corrupt(format!(
                "unknown membership status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipRole {
    #[default]
    Participant,
    Guide,
    Leader,
}

impl MembershipRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Participant => "participant",
            Self::Guide => "guide",
            Self::Leader => "leader",
        }
    }
}

impl FromStr for MembershipRole {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "participant" => Ok(Self::Participant),
            "guide" => Ok(Self::Guide),
            "leader" => Ok(Self::Leader),
            other => Err(StoreError::Corrupt(format!(
                "unknown membership role '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TourStatus {
    Planned,
    Ongoing,
    Completed,
    Cancelled,
}

impl TourStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Ongoing => "ongoing",
            Self::Completed => "completed",
            Self::Cancelled => TOUR_CANCELLED,
        }
    }
}

impl FromStr for TourStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "planned" => Ok(Self::Planned),
            "ongoing" => Ok(Self::Ongoing),
            "completed" => Ok(Self::Completed),
            TOUR_CANCELLED => Ok(Self::Cancelled),
            other => Err(StoreError::Corrupt(format!("unknown tour status '{other}'"))),
        }
    }
}

/// Read-only view of a tour. Tours are managed elsewhere; this core only reads
/// them and refreshes the cached `participant_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tour {
    pub id: Uuid,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: TourStatus,
    pub participant_count: i32,
}

impl Tour {
    /// Closed-interval intersection: tours sharing a single day overlap.
    pub fn overlaps(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.start_date <= end && self.end_date >= start
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Membership {
    pub id: Uuid,
    pub tour_id: Uuid,
    pub user_id: Uuid,
    pub role: MembershipRole,
    pub status: MembershipStatus,
    pub requested_at: NaiveDateTime,
    pub approved_by: Option<Uuid>,
    pub approved_at: Option<NaiveDateTime>,
    pub rejection_reason: Option<String>,
    pub joined_at: Option<NaiveDateTime>,
}

/// Result of the conditional upsert behind a join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingUpsert {
    /// A new pending row was inserted, or a rejected row was flipped back to pending.
    Requested(Membership),
    /// A pending or approved row already exists; nothing was written.
    AlreadyExists(Membership),
}

/// Result of the combined pending check, overlap check and approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved(Membership),
    /// The row is gone or no longer pending; nothing was written.
    NotPending,
    /// The requester already holds an approved membership on an intersecting
    /// tour; the request stays pending.
    Overlap(OverlappingMembership),
}

/// An approved membership on a tour whose dates intersect a requested range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlappingMembership {
    pub membership: Membership,
    pub tour: Tour,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable membership storage.
///
/// Implementations must make every mutating call a single atomic write:
/// the pending upsert is a conditional insert, approve/reject only match rows
/// that are still pending. Racing callers therefore collapse to one winner
/// without application-level locks.
#[async_trait]
pub trait ParticipationStore: Send + Sync + 'static {
    async fn find_tour(&self, tour_id: Uuid) -> StoreResult<Option<Tour>>;

    async fn find_request(&self, request_id: Uuid) -> StoreResult<Option<Membership>>;

    async fn find_membership(&self, tour_id: Uuid, user_id: Uuid)
        -> StoreResult<Option<Membership>>;

    /// Inserts a pending row, or flips an existing rejected row back to pending.
    /// Pending and approved rows are left untouched.
    async fn upsert_pending_request(
        &self,
        tour_id: Uuid,
        user_id: Uuid,
        role: MembershipRole,
    ) -> StoreResult<PendingUpsert>;

    /// `pending -> approved`, unless the requester holds an approved membership
    /// on another tour whose dates intersect this one. The check and the write
    /// are one atomic step per user, so two approvals for overlapping tours
    /// cannot both succeed.
    async fn approve(&self, request_id: Uuid, approver_id: Uuid) -> StoreResult<ApprovalOutcome>;

    /// `pending -> rejected`. Returns `None` when the row is gone or no longer pending.
    async fn reject(&self, request_id: Uuid, reason: Option<String>)
        -> StoreResult<Option<Membership>>;

    /// Deletes an approved membership. Returns whether a row was removed.
    async fn remove(&self, tour_id: Uuid, user_id: Uuid) -> StoreResult<bool>;

    async fn count_approved(&self, tour_id: Uuid) -> StoreResult<i64>;

    /// Recounts approved memberships and stores the result on the tour. Calls
    /// for one tour are serialized, and each counts only after taking its turn,
    /// so the last write always reflects every committed transition.
    async fn refresh_participant_count(&self, tour_id: Uuid) -> StoreResult<i32>;

    async fn find_overlapping(
        &self,
        user_id: Uuid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        exclude_tour_id: Option<Uuid>,
    ) -> StoreResult<Option<OverlappingMembership>>;

    async fn list_pending(&self, tour_id: Uuid) -> StoreResult<Vec<Membership>>;

    async fn list_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Membership>>;

    async fn ping(&self) -> StoreResult<()>;
}

/// Why a join request could not be accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinConflict {
    AlreadyPending { request_id: Uuid },
    AlreadyMember { membership_id: Uuid },
    DateOverlap {
        tour_id: Uuid,
        tour_name: String,
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
}

impl fmt::Display for JoinConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyPending { .. } => write!(f, "a join request for this tour is already pending"),
            Self::AlreadyMember { .. } => write!(f, "already a member of this tour"),
            Self::DateOverlap {
                tour_name,
                start_date,
                end_date,
                ..
            } => write!(
                f,
                "dates conflict with tour '{tour_name}' ({start_date} to {end_date})"
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParticipationError {
    #[error("tour not found")]
    TourNotFound { tour_id: Uuid },
    #[error("request already processed")]
    RequestAlreadyProcessed { request_id: Uuid },
    #[error("{0}")]
    Conflict(JoinConflict),
    #[error("{0}")]
    InvalidState(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl ParticipationError {
    /// Missing tours and already-processed requests both mean "nothing to do".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TourNotFound { .. } | Self::RequestAlreadyProcessed { .. }
        )
    }
}

pub type ParticipationResult<T> = Result<T, ParticipationError>;
