//! Axum Handlers for the REST API
//!
//! Read-only endpoints a client calls before opening a tutor session. They use
//! `utoipa` doc comments to generate OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::debug;
use vocab_tutor_core::topic::Topic;

use crate::{
    models::{AvailabilityResponse, ErrorResponse, TopicView},
    state::AppState,
};

pub enum ApiError {
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
        }
    }
}

/// Report whether the configured language model can be used.
#[utoipa::path(
    get,
    path = "/availability",
    responses(
        (status = 200, description = "Model availability", body = AvailabilityResponse)
    )
)]
pub async fn availability(State(state): State<Arc<AppState>>) -> Json<AvailabilityResponse> {
    let availability = state.model.availability().await;
    debug!(?availability, provider = ?state.config.provider, "Availability requested");
    Json(availability.into())
}

/// List the topic catalog in display order.
#[utoipa::path(
    get,
    path = "/topics",
    responses(
        (status = 200, description = "Topic catalog", body = [TopicView])
    )
)]
pub async fn list_topics() -> Json<Vec<TopicView>> {
    Json(Topic::catalog().into_iter().map(TopicView::from).collect())
}

/// Look a topic up by id or by either label.
#[utoipa::path(
    get,
    path = "/topics/{key}",
    responses(
        (status = 200, description = "Topic details", body = TopicView),
        (status = 404, description = "Topic not found", body = ErrorResponse)
    ),
    params(
        ("key" = String, Path, description = "Topic id, English label or Vietnamese label")
    )
)]
pub async fn get_topic(Path(key): Path<String>) -> Result<Json<TopicView>, ApiError> {
    let topic = Topic::find(&key)
        .ok_or_else(|| ApiError::NotFound(format!("Topic '{}' not found", key)))?;
    Ok(Json(topic.into()))
}
