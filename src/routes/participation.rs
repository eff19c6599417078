use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::participation::{Approval, Departure, Membership, MembershipRole};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct JoinTourRequest {
    #[serde(default)]
    pub role: MembershipRole,
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct MembershipStatusResponse {
    pub tour_id: Uuid,
    pub user_id: Uuid,
    pub approved: bool,
}

pub async fn request_join(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(tour_id): Path<Uuid>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<Membership>)> {
    let payload: JoinTourRequest = optional_json(&body)?;
    if payload.role != MembershipRole::Participant {
        // leader and guide slots are staffed by the desk, not self-assigned
        user.require_admin()?;
    }
    let membership = state
        .workflow
        .request_join_as(tour_id, user.user_id, payload.role)
        .await?;
    Ok((StatusCode::CREATED, Json(membership)))
}

pub async fn leave_tour(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(tour_id): Path<Uuid>,
) -> AppResult<Json<Departure>> {
    let departure = state.workflow.leave_tour(tour_id, user.user_id).await?;
    Ok(Json(departure))
}

pub async fn membership_status(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(tour_id): Path<Uuid>,
) -> AppResult<Json<MembershipStatusResponse>> {
    let approved = state
        .workflow
        .is_approved_member(tour_id, user.user_id)
        .await?;
    Ok(Json(MembershipStatusResponse {
        tour_id,
        user_id: user.user_id,
        approved,
    }))
}

pub async fn list_pending(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(tour_id): Path<Uuid>,
) -> AppResult<Json<Vec<Membership>>> {
    user.require_admin()?;
    Ok(Json(state.workflow.list_pending(tour_id).await?))
}

pub async fn approve_request(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(request_id): Path<Uuid>,
) -> AppResult<Json<Approval>> {
    user.require_admin()?;
    let approval = state
        .workflow
        .approve_request(request_id, user.user_id)
        .await?;
    Ok(Json(approval))
}

pub async fn reject_request(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(request_id): Path<Uuid>,
    body: Bytes,
) -> AppResult<Json<Membership>> {
    user.require_admin()?;
    let payload: RejectRequest = optional_json(&body)?;
    let reason = payload
        .reason
        .map(|reason| reason.trim().to_string())
        .filter(|reason| !reason.is_empty());
    let membership = state.workflow.reject_request(request_id, reason).await?;
    Ok(Json(membership))
}

pub async fn my_tours(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<Membership>>> {
    Ok(Json(state.workflow.list_for_user(user.user_id).await?))
}

/// An absent or empty body yields the payload's defaults.
fn optional_json<T>(body: &Bytes) -> AppResult<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| AppError::bad_request(format!("invalid body: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_join_body_defaults_to_participant() {
        let payload: JoinTourRequest = optional_json(&Bytes::new()).unwrap();
        assert_eq!(payload.role, MembershipRole::Participant);

        let payload: JoinTourRequest = optional_json(&Bytes::from_static(b"{}")).unwrap();
        assert_eq!(payload.role, MembershipRole::Participant);

        let payload: JoinTourRequest =
            optional_json(&Bytes::from_static(br#"{"role":"guide"}"#)).unwrap();
        assert_eq!(payload.role, MembershipRole::Guide);
    }

    #[test]
    fn unknown_role_is_a_bad_request() {
        let err = optional_json::<JoinTourRequest>(&Bytes::from_static(br#"{"role":"captain"}"#))
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
