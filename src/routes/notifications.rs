use std::{convert::Infallible, sync::Arc};

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::notifications::{
    ChannelHandle, Frame, HealthReport, NotificationHub, Severity, SosAlert,
};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnnounceRequest {
    pub title: String,
    pub message: String,
    pub severity: Option<Severity>,
}

#[derive(Debug, Deserialize)]
pub struct SosRequest {
    pub tour_id: Option<Uuid>,
    pub message: Option<String>,
    pub location: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct HealthReportRequest {
    pub tour_id: Option<Uuid>,
    pub description: String,
    pub severity: Option<Severity>,
}

#[derive(Serialize)]
pub struct DeliveryResponse {
    pub delivered: usize,
}

/// Releases the hub registration once the response body is dropped.
struct ChannelGuard {
    hub: Arc<NotificationHub>,
    handle: ChannelHandle,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.hub.release(self.handle);
    }
}

/// Opens a server-sent events stream. Browsers cannot set headers on an
/// `EventSource`, so the token may also come from `?access_token=`.
pub async fn stream_notifications(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    Query(params): Query<StreamParams>,
) -> AppResult<Response> {
    let token = match (&bearer, params.access_token.as_deref()) {
        (Some(TypedHeader(Authorization(bearer))), _) => bearer.token(),
        (None, Some(token)) => token,
        (None, None) => return Err(AppError::unauthorized()),
    };
    let user = AuthenticatedUser::from_token(&state, token)?;

    let (tx, rx) = mpsc::channel::<Frame>(state.config.notification_buffer.max(1));
    let handle = state.hub.connect(user.user_id, user.role, tx);
    let guard = ChannelGuard {
        hub: state.hub.clone(),
        handle,
    };

    // ends when the hub drops the sender (eviction or replacement)
    let frames = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        loop {
            let frame = rx.recv().await?;
            match frame.to_sse() {
                Ok(encoded) => return Some((Ok::<_, Infallible>(encoded), (rx, guard))),
                Err(err) => {
                    warn!(user_id = %guard.handle.user_id, error = %err, "dropping unencodable frame");
                }
            }
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(frames))
        .map_err(AppError::internal)
}

pub async fn announce(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<AnnounceRequest>,
) -> AppResult<Json<DeliveryResponse>> {
    user.require_admin()?;
    if payload.title.trim().is_empty() {
        return Err(AppError::bad_request("title must not be empty"));
    }
    let delivered = state.bridge.announce(
        user.user_id,
        payload.title.trim(),
        &payload.message,
        payload.severity.unwrap_or(Severity::Medium),
    );
    Ok(Json(DeliveryResponse { delivered }))
}

pub async fn trigger_sos(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<SosRequest>,
) -> AppResult<(StatusCode, Json<DeliveryResponse>)> {
    let alert = SosAlert {
        user_id: user.user_id,
        username: user.username,
        tour_id: payload.tour_id,
        message: payload.message.filter(|message| !message.trim().is_empty()),
        location: payload.location,
    };
    let delivered = state.bridge.sos_triggered(&alert);
    if delivered == 0 {
        warn!(user_id = %alert.user_id, "sos raised with no staff connected");
    }
    Ok((StatusCode::ACCEPTED, Json(DeliveryResponse { delivered })))
}

pub async fn report_health(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<HealthReportRequest>,
) -> AppResult<(StatusCode, Json<DeliveryResponse>)> {
    let description = payload.description.trim();
    if description.is_empty() {
        return Err(AppError::bad_request("description must not be empty"));
    }
    let report = HealthReport {
        user_id: user.user_id,
        username: user.username,
        tour_id: payload.tour_id,
        description: description.to_string(),
        severity: payload.severity,
    };
    let delivered = state.bridge.health_reported(&report);
    Ok((StatusCode::ACCEPTED, Json(DeliveryResponse { delivered })))
}
