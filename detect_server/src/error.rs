//! Error type of the HTTP handlers.
//!
use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use thiserror::Error;

use crate::media::MediaError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("multipart error: {0}")]
    Multipart(#[from] MultipartError),

    #[error("inference failed: {0}")]
    Inference(#[from] anyhow::Error),

    #[error("password hashing failed: {0}")]
    PasswordHash(String),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Email address already registered")]
    EmailTaken,

    #[error("Username already taken")]
    UsernameTaken,

    #[error("Invalid Username or password")]
    InvalidCredentials,

    #[error("not found")]
    NotFound,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::EmailTaken | AppError::UsernameTaken => StatusCode::BAD_REQUEST,
            AppError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AppError::Media(MediaError::CameraUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            log::error!("{self}");
        }

        let reason = status.canonical_reason().unwrap_or("Error");
        let body = Html(format!(
            "<!doctype html><title>{reason}</title><h1>{} {reason}</h1>",
            status.as_u16()
        ));
        (status, body).into_response()
    }
}
