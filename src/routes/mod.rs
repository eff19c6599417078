use axum::http::HeaderValue;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod health;
pub mod notifications;
pub mod participation;

pub fn create_router(state: AppState) -> Router<()> {
    let allow_origin = match state.config.cors_allowed_origin.as_deref() {
        Some(origins) => AllowOrigin::list(parse_origins(origins)),
        None => AllowOrigin::mirror_request(),
    };
    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);

    let tour_routes = Router::new()
        .route("/:tour_id/join", post(participation::request_join))
        .route(
            "/:tour_id/membership",
            get(participation::membership_status).delete(participation::leave_tour),
        )
        .route("/:tour_id/requests", get(participation::list_pending));

    let request_routes = Router::new()
        .route("/:id/approve", post(participation::approve_request))
        .route("/:id/reject", post(participation::reject_request));

    let notification_routes = Router::new()
        .route("/stream", get(notifications::stream_notifications))
        .route("/announce", post(notifications::announce));

    Router::new()
        .nest("/api/tours", tour_routes)
        .nest("/api/participation-requests", request_routes)
        .nest("/api/notifications", notification_routes)
        .route("/api/me/tours", get(participation::my_tours))
        .route("/api/sos", post(notifications::trigger_sos))
        .route("/api/health-reports", post(notifications::report_health))
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn parse_origins(raw: &str) -> Vec<HeaderValue> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect()
}
