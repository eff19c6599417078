use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Display;

use crate::participation::{JoinConflict, ParticipationError, StoreError};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    details: Option<Value>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden")
    }

    pub fn internal<E: Display>(error: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            details: self.details,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl From<ParticipationError> for AppError {
    fn from(value: ParticipationError) -> Self {
        match value {
            ParticipationError::TourNotFound { tour_id } => {
                AppError::new(StatusCode::NOT_FOUND, "tour not found")
                    .with_details(json!({ "tour_id": tour_id }))
            }
            ParticipationError::RequestAlreadyProcessed { request_id } => {
                AppError::new(StatusCode::CONFLICT, "request already processed")
                    .with_details(json!({ "reason": "already_processed", "request_id": request_id }))
            }
            ParticipationError::Conflict(conflict) => {
                let details = conflict_details(&conflict);
                AppError::new(StatusCode::CONFLICT, conflict.to_string()).with_details(details)
            }
            ParticipationError::InvalidState(message) => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, message)
            }
            ParticipationError::Storage(err) => AppError::from(err),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        tracing::error!(error = %value, "participation storage failure");
        AppError::internal("storage failure")
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}

fn conflict_details(conflict: &JoinConflict) -> Value {
    match conflict {
        JoinConflict::AlreadyPending { request_id } => {
            json!({ "reason": "already_pending", "request_id": request_id })
        }
        JoinConflict::AlreadyMember { membership_id } => {
            json!({ "reason": "already_member", "membership_id": membership_id })
        }
        JoinConflict::DateOverlap {
            tour_id,
            tour_name,
            start_date,
            end_date,
        } => json!({
            "reason": "date_overlap",
            "conflicting_tour": {
                "id": tour_id,
                "name": tour_name,
                "start_date": start_date,
                "end_date": end_date,
            }
        }),
    }
}
