mod common;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use common::{acquire_db_lock, date, test_pool};
use diesel::prelude::*;
use tourdesk::db::PgPool;
use tourdesk::models::NewTourRow;
use tourdesk::participation::{
    ApprovalOutcome, MembershipRole, MembershipStatus, ParticipationStore, PendingUpsert,
    PgParticipationStore, TourStatus,
};
use tourdesk::schema::tours;
use uuid::Uuid;

async fn insert_tour(
    pool: &PgPool,
    name: &str,
    start: NaiveDate,
    end: NaiveDate,
    status: TourStatus,
) -> Result<Uuid> {
    let pool = pool.clone();
    let row = NewTourRow {
        id: Uuid::new_v4(),
        name: name.to_string(),
        start_date: start,
        end_date: end,
        status: status.as_str().to_string(),
    };
    tokio::task::spawn_blocking(move || -> Result<Uuid> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
        diesel::insert_into(tours::table)
            .values(&row)
            .execute(&mut conn)
            .context("failed to insert tour")?;
        Ok(row.id)
    })
    .await
    .context("insert task panicked")?
}

#[tokio::test]
async fn pending_upsert_and_guarded_transitions() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(pool) = test_pool().await? else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return Ok(());
    };
    let store = PgParticipationStore::new(pool.clone());
    let tour_id = insert_tour(
        &pool,
        "Dolomites",
        date(2026, 7, 1),
        date(2026, 7, 5),
        TourStatus::Planned,
    )
    .await?;
    let user_id = Uuid::new_v4();
    let admin_id = Uuid::new_v4();

    let PendingUpsert::Requested(request) = store
        .upsert_pending_request(tour_id, user_id, MembershipRole::Guide)
        .await?
    else {
        panic!("first upsert should insert");
    };
    assert_eq!(request.status, MembershipStatus::Pending);
    assert_eq!(request.role, MembershipRole::Guide);

    let again = store
        .upsert_pending_request(tour_id, user_id, MembershipRole::Participant)
        .await?;
    assert_eq!(again, PendingUpsert::AlreadyExists(request.clone()));

    let rejected = store
        .reject(request.id, Some("full".to_string()))
        .await?
        .expect("pending row is rejectable");
    assert_eq!(rejected.rejection_reason.as_deref(), Some("full"));
    assert_eq!(
        store.approve(request.id, admin_id).await?,
        ApprovalOutcome::NotPending
    );

    let PendingUpsert::Requested(reapplied) = store
        .upsert_pending_request(tour_id, user_id, MembershipRole::Participant)
        .await?
    else {
        panic!("rejected row should be reused");
    };
    assert_eq!(reapplied.id, request.id);
    assert_eq!(reapplied.status, MembershipStatus::Pending);
    assert_eq!(reapplied.role, MembershipRole::Participant);
    assert!(reapplied.rejection_reason.is_none());

    let ApprovalOutcome::Approved(approved) = store.approve(request.id, admin_id).await? else {
        panic!("pending row is approvable");
    };
    assert_eq!(approved.approved_by, Some(admin_id));
    assert!(approved.approved_at.is_some());
    assert!(approved.joined_at.is_some());
    assert!(store.reject(request.id, None).await?.is_none());

    assert_eq!(store.count_approved(tour_id).await?, 1);
    assert_eq!(store.refresh_participant_count(tour_id).await?, 1);
    let tour = store.find_tour(tour_id).await?.expect("tour exists");
    assert_eq!(tour.participant_count, 1);

    assert_eq!(store.list_for_user(user_id).await?.len(), 1);
    assert!(store.list_pending(tour_id).await?.is_empty());

    assert!(store.remove(tour_id, user_id).await?);
    assert!(!store.remove(tour_id, user_id).await?);
    assert_eq!(store.refresh_participant_count(tour_id).await?, 0);

    store.ping().await?;
    Ok(())
}

#[tokio::test]
async fn overlap_query_uses_closed_intervals() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(pool) = test_pool().await? else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return Ok(());
    };
    let store = PgParticipationStore::new(pool.clone());
    let user_id = Uuid::new_v4();
    let joined = insert_tour(
        &pool,
        "Tour A",
        date(2026, 3, 1),
        date(2026, 3, 10),
        TourStatus::Planned,
    )
    .await?;
    let cancelled = insert_tour(
        &pool,
        "Called off",
        date(2026, 4, 1),
        date(2026, 4, 10),
        TourStatus::Cancelled,
    )
    .await?;

    for tour_id in [joined, cancelled] {
        let PendingUpsert::Requested(request) = store
            .upsert_pending_request(tour_id, user_id, MembershipRole::Participant)
            .await?
        else {
            panic!("fresh pair should insert");
        };
        assert!(matches!(
            store.approve(request.id, Uuid::new_v4()).await?,
            ApprovalOutcome::Approved(_)
        ));
    }

    let hit = store
        .find_overlapping(user_id, date(2026, 3, 10), date(2026, 3, 12), None)
        .await?
        .expect("shared boundary day overlaps");
    assert_eq!(hit.tour.id, joined);
    assert_eq!(hit.tour.name, "Tour A");

    assert!(store
        .find_overlapping(user_id, date(2026, 3, 11), date(2026, 3, 14), None)
        .await?
        .is_none());
    assert!(store
        .find_overlapping(user_id, date(2026, 3, 5), date(2026, 3, 6), Some(joined))
        .await?
        .is_none());
    assert!(store
        .find_overlapping(user_id, date(2026, 4, 5), date(2026, 4, 6), None)
        .await?
        .is_none());

    Ok(())
}

#[tokio::test]
async fn concurrent_requests_leave_one_row() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(pool) = test_pool().await? else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return Ok(());
    };
    let store = Arc::new(PgParticipationStore::new(pool.clone()));
    let tour_id = insert_tour(
        &pool,
        "Coast",
        date(2026, 6, 1),
        date(2026, 6, 2),
        TourStatus::Planned,
    )
    .await?;
    let user_id = Uuid::new_v4();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store
                .upsert_pending_request(tour_id, user_id, MembershipRole::Participant)
                .await
        }));
    }

    let mut inserted = 0;
    for task in tasks {
        if let PendingUpsert::Requested(_) = task.await?? {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);
    assert_eq!(store.list_pending(tour_id).await?.len(), 1);

    Ok(())
}

async fn pending_request(
    store: &PgParticipationStore,
    tour_id: Uuid,
    user_id: Uuid,
) -> Result<Uuid> {
    match store
        .upsert_pending_request(tour_id, user_id, MembershipRole::Participant)
        .await?
    {
        PendingUpsert::Requested(request) => Ok(request.id),
        PendingUpsert::AlreadyExists(existing) => {
            Err(anyhow!("pair already held by {}", existing.id))
        }
    }
}

#[tokio::test]
async fn concurrent_approve_and_reject_have_one_winner() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(pool) = test_pool().await? else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return Ok(());
    };
    let store = Arc::new(PgParticipationStore::new(pool.clone()));
    let tour_id = insert_tour(
        &pool,
        "Prokletije",
        date(2026, 5, 10),
        date(2026, 5, 12),
        TourStatus::Planned,
    )
    .await?;

    for _ in 0..10 {
        let request_id = pending_request(&store, tour_id, Uuid::new_v4()).await?;

        let approve = {
            let store = store.clone();
            tokio::spawn(async move { store.approve(request_id, Uuid::new_v4()).await })
        };
        let reject = {
            let store = store.clone();
            tokio::spawn(async move { store.reject(request_id, None).await })
        };

        let approved = matches!(approve.await??, ApprovalOutcome::Approved(_));
        let rejected = reject.await??.is_some();
        assert!(approved ^ rejected, "exactly one transition must win");
    }

    Ok(())
}

#[tokio::test]
async fn concurrent_overlapping_approvals_never_double_book() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(pool) = test_pool().await? else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return Ok(());
    };
    let store = Arc::new(PgParticipationStore::new(pool.clone()));

    for _ in 0..5 {
        let tour_a = insert_tour(
            &pool,
            "Tour A",
            date(2026, 3, 1),
            date(2026, 3, 10),
            TourStatus::Planned,
        )
        .await?;
        let tour_b = insert_tour(
            &pool,
            "Tour B",
            date(2026, 3, 5),
            date(2026, 3, 12),
            TourStatus::Planned,
        )
        .await?;
        let user_id = Uuid::new_v4();
        let request_a = pending_request(&store, tour_a, user_id).await?;
        let request_b = pending_request(&store, tour_b, user_id).await?;

        let tasks: Vec<_> = [request_a, request_b]
            .into_iter()
            .map(|request_id| {
                let store = store.clone();
                tokio::spawn(async move { store.approve(request_id, Uuid::new_v4()).await })
            })
            .collect();

        let mut approved = 0;
        for task in tasks {
            match task.await?? {
                ApprovalOutcome::Approved(_) => approved += 1,
                ApprovalOutcome::Overlap(_) => {}
                ApprovalOutcome::NotPending => panic!("both requests were pending"),
            }
        }
        assert_eq!(approved, 1);
        assert_eq!(
            store.count_approved(tour_a).await? + store.count_approved(tour_b).await?,
            1
        );
    }

    Ok(())
}

#[tokio::test]
async fn cached_count_matches_recount_under_concurrent_transitions() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(pool) = test_pool().await? else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return Ok(());
    };
    let store = Arc::new(PgParticipationStore::new(pool.clone()));
    let tour_id = insert_tour(
        &pool,
        "Olympus",
        date(2026, 9, 20),
        date(2026, 9, 22),
        TourStatus::Planned,
    )
    .await?;

    // half the users start approved and leave; the other half get approved
    let leavers: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();
    for user_id in &leavers {
        let request_id = pending_request(&store, tour_id, *user_id).await?;
        store.approve(request_id, Uuid::new_v4()).await?;
    }
    store.refresh_participant_count(tour_id).await?;

    let mut joiners = Vec::new();
    for _ in 0..6 {
        joiners.push(pending_request(&store, tour_id, Uuid::new_v4()).await?);
    }

    let mut tasks = Vec::new();
    for (user_id, request_id) in leavers.into_iter().zip(joiners) {
        let leave = store.clone();
        tasks.push(tokio::spawn(async move {
            leave.remove(tour_id, user_id).await?;
            leave.refresh_participant_count(tour_id).await
        }));
        let approve = store.clone();
        tasks.push(tokio::spawn(async move {
            approve.approve(request_id, Uuid::new_v4()).await?;
            approve.refresh_participant_count(tour_id).await
        }));
    }
    for task in tasks {
        task.await??;
    }

    let recount = store.count_approved(tour_id).await?;
    let tour = store.find_tour(tour_id).await?.expect("tour exists");
    assert_eq!(recount, 6);
    assert_eq!(i64::from(tour.participant_count), recount);

    Ok(())
}
