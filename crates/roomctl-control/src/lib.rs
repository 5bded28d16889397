pub mod api;
pub mod config;
pub mod request_meta;
pub mod state;

use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/start", post(api::start))
        .route("/stop", post(api::stop))
        .route("/status", get(api::status))
        .route("/status/:room_number", get(api::room_status))
        .route("/healthz", get(api::healthz))
        .layer(middleware::from_fn(request_meta::request_id))
        .with_state(state)
}
