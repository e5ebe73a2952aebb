//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, the WebSocket endpoints, and OpenAPI documentation.

use crate::{
    handlers,
    models::{AvailabilityResponse, ErrorResponse, TopicView},
    state::AppState,
    ws::{chat_ws_handler, lab_ws_handler, ws_handler},
};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::availability,
        handlers::list_topics,
        handlers::get_topic,
    ),
    components(
        schemas(AvailabilityResponse, TopicView, ErrorResponse)
    ),
    tags(
        (name = "Vocab Tutor API", description = "Catalog and availability for the English vocabulary tutor")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/availability", get(handlers::availability))
        .route("/topics", get(handlers::list_topics))
        .route("/topics/{key}", get(handlers::get_topic))
        .route("/ws", get(ws_handler))
        .route("/ws/chat", get(chat_ws_handler))
        .route("/ws/lab", get(lab_ws_handler))
        .with_state(app_state);

    // Merge the stateful routes with the stateless Swagger UI.
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
