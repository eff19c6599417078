use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use diesel::{
    dsl::count_star,
    pg::PgConnection,
    prelude::*,
    sql_types::{Timestamptz, Uuid as SqlUuid, Varchar},
};
use tokio::task;
use uuid::Uuid;

use super::{
    ApprovalOutcome, Membership, MembershipRole, OverlappingMembership, ParticipationStore,
    PendingUpsert, StoreError, StoreResult, Tour, STATUS_APPROVED, STATUS_PENDING,
    STATUS_REJECTED, TOUR_CANCELLED,
};
use crate::{
    db::PgPool,
    models::{MembershipRow, TourRow},
    schema::{tour_participants, tours},
};

// ON CONFLICT ... WHERE keeps the upsert a single statement: the conflicting
// row is only rewritten while it is still rejected, otherwise nothing is returned.
const UPSERT_PENDING_SQL: &str = "\
INSERT INTO tour_participants (id, tour_id, user_id, role, status, requested_at) \
VALUES ($1, $2, $3, $4, 'pending', $5) \
ON CONFLICT (tour_id, user_id) DO UPDATE SET \
    status = 'pending', \
    role = EXCLUDED.role, \
    requested_at = EXCLUDED.requested_at, \
    approved_by = NULL, \
    approved_at = NULL, \
    rejection_reason = NULL, \
    joined_at = NULL, \
    updated_at = NOW() \
WHERE tour_participants.status = 'rejected' \
RETURNING *";

// Approvals for one user run one at a time, so the overlap check and the
// status flip see each other's committed writes.
const LOCK_USER_SQL: &str = "SELECT pg_advisory_xact_lock(hashtextextended(CAST($1 AS text), 0))";

impl TryFrom<MembershipRow> for Membership {
    type Error = StoreError;

    fn try_from(row: MembershipRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            tour_id: row.tour_id,
            user_id: row.user_id,
            role: row.role.parse()?,
            status: row.status.parse()?,
            requested_at: row.requested_at,
            approved_by: row.approved_by,
            approved_at: row.approved_at,
            rejection_reason: row.rejection_reason,
            joined_at: row.joined_at,
        })
    }
}

impl TryFrom<TourRow> for Tour {
    type Error = StoreError;

    fn try_from(row: TourRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            start_date: row.start_date,
            end_date: row.end_date,
            status: row.status.parse()?,
            participant_count: row.participant_count,
        })
    }
}

fn into_memberships(rows: Vec<MembershipRow>) -> StoreResult<Vec<Membership>> {
    rows.into_iter().map(Membership::try_from).collect()
}

/// PostgreSQL-backed store. Diesel is synchronous, so every call checks out a
/// pooled connection on the blocking thread pool.
#[derive(Clone)]
pub struct PgParticipationStore {
    pool: PgPool,
}

impl PgParticipationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut PgConnection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

fn load_membership(
    conn: &mut PgConnection,
    tour_id: Uuid,
    user_id: Uuid,
) -> StoreResult<Option<Membership>> {
    tour_participants::table
        .filter(tour_participants::tour_id.eq(tour_id))
        .filter(tour_participants::user_id.eq(user_id))
        .first::<MembershipRow>(conn)
        .optional()?
        .map(Membership::try_from)
        .transpose()
}

fn load_overlapping(
    conn: &mut PgConnection,
    user_id: Uuid,
    start_date: NaiveDate,
    end_date: NaiveDate,
    exclude_tour_id: Option<Uuid>,
) -> StoreResult<Option<OverlappingMembership>> {
    let mut query = tour_participants::table
        .inner_join(tours::table)
        .filter(tour_participants::user_id.eq(user_id))
        .filter(tour_participants::status.eq(STATUS_APPROVED))
        .filter(tours::status.ne(TOUR_CANCELLED))
        .filter(tours::start_date.le(end_date))
        .filter(tours::end_date.ge(start_date))
        .select((tour_participants::all_columns, tours::all_columns))
        .order(tours::start_date.asc())
        .into_boxed();

    if let Some(excluded) = exclude_tour_id {
        query = query.filter(tour_participants::tour_id.ne(excluded));
    }

    let hit = query.first::<(MembershipRow, TourRow)>(conn).optional()?;
    hit.map(|(membership, tour)| -> StoreResult<OverlappingMembership> {
        Ok(OverlappingMembership {
            membership: membership.try_into()?,
            tour: tour.try_into()?,
        })
    })
    .transpose()
}

#[async_trait]
impl ParticipationStore for PgParticipationStore {
    async fn find_tour(&self, tour_id: Uuid) -> StoreResult<Option<Tour>> {
        self.with_conn(move |conn| {
            tours::table
                .find(tour_id)
                .first::<TourRow>(conn)
                .optional()?
                .map(Tour::try_from)
                .transpose()
        })
        .await
    }

    async fn find_request(&self, request_id: Uuid) -> StoreResult<Option<Membership>> {
        self.with_conn(move |conn| {
            tour_participants::table
                .find(request_id)
                .first::<MembershipRow>(conn)
                .optional()?
                .map(Membership::try_from)
                .transpose()
        })
        .await
    }

    async fn find_membership(
        &self,
        tour_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Option<Membership>> {
        self.with_conn(move |conn| load_membership(conn, tour_id, user_id))
            .await
    }

    async fn upsert_pending_request(
        &self,
        tour_id: Uuid,
        user_id: Uuid,
        role: MembershipRole,
    ) -> StoreResult<PendingUpsert> {
        self.with_conn(move |conn| {
            let written = diesel::sql_query(UPSERT_PENDING_SQL)
                .bind::<SqlUuid, _>(Uuid::new_v4())
                .bind::<SqlUuid, _>(tour_id)
                .bind::<SqlUuid, _>(user_id)
                .bind::<Varchar, _>(role.as_str())
                .bind::<Timestamptz, _>(Utc::now().naive_utc())
                .get_result::<MembershipRow>(conn)
                .optional()?;

            if let Some(row) = written {
                return Ok(PendingUpsert::Requested(row.try_into()?));
            }

            // The guard did not match, so a pending or approved row holds the pair.
            let existing = load_membership(conn, tour_id, user_id)?.ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "membership for tour {tour_id} and user {user_id} vanished during upsert"
                ))
            })?;
            Ok(PendingUpsert::AlreadyExists(existing))
        })
        .await
    }

    async fn approve(&self, request_id: Uuid, approver_id: Uuid) -> StoreResult<ApprovalOutcome> {
        self.with_conn(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let Some(request) = tour_participants::table
                    .find(request_id)
                    .filter(tour_participants::status.eq(STATUS_PENDING))
                    .first::<MembershipRow>(conn)
                    .optional()?
                else {
                    return Ok(ApprovalOutcome::NotPending);
                };

                diesel::sql_query(LOCK_USER_SQL)
                    .bind::<SqlUuid, _>(request.user_id)
                    .execute(conn)?;

                let tour = tours::table.find(request.tour_id).first::<TourRow>(conn)?;
                if let Some(hit) = load_overlapping(
                    conn,
                    request.user_id,
                    tour.start_date,
                    tour.end_date,
                    Some(tour.id),
                )? {
                    return Ok(ApprovalOutcome::Overlap(hit));
                }

                let now = Utc::now().naive_utc();
                let approved = diesel::update(
                    tour_participants::table
                        .filter(tour_participants::id.eq(request_id))
                        .filter(tour_participants::status.eq(STATUS_PENDING)),
                )
                .set((
                    tour_participants::status.eq(STATUS_APPROVED),
                    tour_participants::approved_by.eq(Some(approver_id)),
                    tour_participants::approved_at.eq(Some(now)),
                    tour_participants::joined_at.eq(Some(now)),
                    tour_participants::updated_at.eq(now),
                ))
                .get_result::<MembershipRow>(conn)
                .optional()?;

                match approved {
                    Some(row) => Ok(ApprovalOutcome::Approved(row.try_into()?)),
                    None => Ok(ApprovalOutcome::NotPending),
                }
            })
        })
        .await
    }

    async fn reject(
        &self,
        request_id: Uuid,
        reason: Option<String>,
    ) -> StoreResult<Option<Membership>> {
        self.with_conn(move |conn| {
            diesel::update(
                tour_participants::table
                    .filter(tour_participants::id.eq(request_id))
                    .filter(tour_participants::status.eq(STATUS_PENDING)),
            )
            .set((
                tour_participants::status.eq(STATUS_REJECTED),
                tour_participants::rejection_reason.eq(reason),
                tour_participants::updated_at.eq(Utc::now().naive_utc()),
            ))
            .get_result::<MembershipRow>(conn)
            .optional()?
            .map(Membership::try_from)
            .transpose()
        })
        .await
    }

    async fn remove(&self, tour_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let deleted = diesel::delete(
                tour_participants::table
                    .filter(tour_participants::tour_id.eq(tour_id))
                    .filter(tour_participants::user_id.eq(user_id))
                    .filter(tour_participants::status.eq(STATUS_APPROVED)),
            )
            .execute(conn)?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn count_approved(&self, tour_id: Uuid) -> StoreResult<i64> {
        self.with_conn(move |conn| {
            let count = tour_participants::table
                .filter(tour_participants::tour_id.eq(tour_id))
                .filter(tour_participants::status.eq(STATUS_APPROVED))
                .select(count_star())
                .first::<i64>(conn)?;
            Ok(count)
        })
        .await
    }

    async fn refresh_participant_count(&self, tour_id: Uuid) -> StoreResult<i32> {
        self.with_conn(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                // Lock first, count second: the count statement takes its
                // snapshot only after every earlier refresh has committed.
                tours::table
                    .find(tour_id)
                    .select(tours::id)
                    .for_update()
                    .first::<Uuid>(conn)?;

                let approved = tour_participants::table
                    .filter(tour_participants::tour_id.eq(tour_id))
                    .filter(tour_participants::status.eq(STATUS_APPROVED))
                    .select(count_star())
                    .first::<i64>(conn)?;
                let approved = i32::try_from(approved).map_err(|_| {
                    StoreError::Corrupt(format!("tour {tour_id} has {approved} participants"))
                })?;

                diesel::update(tours::table.find(tour_id))
                    .set((
                        tours::participant_count.eq(approved),
                        tours::updated_at.eq(Utc::now().naive_utc()),
                    ))
                    .execute(conn)?;
                Ok(approved)
            })
        })
        .await
    }

    async fn find_overlapping(
        &self,
        user_id: Uuid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        exclude_tour_id: Option<Uuid>,
    ) -> StoreResult<Option<OverlappingMembership>> {
        self.with_conn(move |conn| {
            load_overlapping(conn, user_id, start_date, end_date, exclude_tour_id)
        })
        .await
    }

    async fn list_pending(&self, tour_id: Uuid) -> StoreResult<Vec<Membership>> {
        self.with_conn(move |conn| {
            let rows = tour_participants::table
                .filter(tour_participants::tour_id.eq(tour_id))
                .filter(tour_participants::status.eq(STATUS_PENDING))
                .order(tour_participants::requested_at.asc())
                .load::<MembershipRow>(conn)?;
            into_memberships(rows)
        })
        .await
    }

    async fn list_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Membership>> {
        self.with_conn(move |conn| {
            let rows = tour_participants::table
                .filter(tour_participants::user_id.eq(user_id))
                .order(tour_participants::requested_at.desc())
                .load::<MembershipRow>(conn)?;
            into_memberships(rows)
        })
        .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            diesel::sql_query("SELECT 1").execute(conn)?;
            Ok(())
        })
        .await
    }
}
