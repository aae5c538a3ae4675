//! Routes of the HTTP server.
//!
use axum::{extract::DefaultBodyLimit, routing::get, Router};

use crate::{
    endpoints::{account, detect, healthcheck, stream},
    state::AppState,
};

/// Build the application with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(account::home))
        .route("/home", get(account::home))
        .route("/login", get(account::login_form).post(account::login))
        .route("/signup", get(account::signup_form).post(account::signup))
        .route("/dashboard", get(account::dashboard))
        .route("/logout", get(account::logout))
        .route("/index", get(detect::index).post(detect::upload))
        .route("/results/:job_id", get(detect::result))
        .route("/video_feed", get(stream::video_feed))
        .route("/webcam_feed", get(stream::webcam_feed))
        .route(
            "/webcam_feed/:job_id/stop",
            get(stream::stop_feed).post(stream::stop_feed),
        )
        .route("/healthcheck", get(healthcheck))
        .route("/:filename", get(detect::latest_image))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}
