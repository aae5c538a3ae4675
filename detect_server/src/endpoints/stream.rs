//! MJPEG streams of processed videos and of the camera.
//!
use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use uuid::Uuid;

use super::mjpeg_response;
use crate::{
    error::AppError,
    jobs::{JobKind, JobStatus},
    pipeline::{self, LiveFeed},
    session::CurrentUser,
    state::AppState,
};

/// Search parameters available to the replay stream.
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    job: Option<Uuid>,
}

/// Replay a processed video.
///
/// Without a job id the most recently finished video of any user is replayed.
pub async fn video_feed(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Result<Response, AppError> {
    let job = match params.job {
        Some(id) => state
            .jobs
            .get(id)
            .filter(|job| job.kind == JobKind::Video && job.status == JobStatus::Finished),
        None => state.jobs.latest_finished(JobKind::Video, None),
    }
    .ok_or(AppError::NotFound)?;

    if tokio::fs::metadata(&job.output).await.is_err() {
        return Err(AppError::NotFound);
    }

    log::info!("Replay of job {} requested", job.id);
    let delay = Duration::from_millis(state.config.replay_delay_ms);
    let rx = pipeline::spawn_replay(state.media.clone(), job.output, delay);
    Ok(mjpeg_response(rx, job.id))
}

/// Live detection on the camera.
pub async fn webcam_feed(
    State(state): State<AppState>,
    user: Option<CurrentUser>,
) -> Result<Response, AppError> {
    let media = Arc::clone(&state.media);
    let device = state.config.camera.clone();
    let source = tokio::task::spawn_blocking(move || media.open_camera(&device)).await??;

    let job_id = Uuid::new_v4();
    let output_dir = state.config.webcam_dir().join(job_id.to_string());
    tokio::fs::create_dir_all(&output_dir).await?;
    let output = output_dir.join(format!("webcam_output.{}", state.media.video_extension()));

    let user_id = user.map(|user| user.user.id);
    state
        .jobs
        .create(job_id, user_id, JobKind::Webcam, output.clone());
    let token = state.jobs.register_live(job_id);

    let feed = LiveFeed {
        model: Arc::clone(&state.model),
        media: Arc::clone(&state.media),
        jobs: Arc::clone(&state.jobs),
        job_id,
        output,
        fps: state.config.output_fps,
        token,
    };
    let rx = feed.spawn(source);
    Ok(mjpeg_response(rx, job_id))
}

/// Stop a running live feed.
///
/// Feeds opened while logged in can only be stopped by their owner. Other users get the same
/// answer as for an unknown feed.
pub async fn stop_feed(
    State(state): State<AppState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(job_id): Path<Uuid>,
) -> Response {
    let permitted = match state.jobs.get(job_id) {
        Some(job) => job.user_id.map_or(true, |owner| owner == user.id),
        None => false,
    };

    if permitted && state.jobs.stop_live(job_id) {
        log::info!("Live feed {} stopped by {}", job_id, user.username);
        StatusCode::NO_CONTENT.into_response()
    } else {
        AppError::NotFound.into_response()
    }
}
