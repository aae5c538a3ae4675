//! Upload form, detection dispatch and result files.
//!
use std::{
    path::{Path as FsPath, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::{
    extract::{multipart::Field, Multipart, Path, State},
    http::header,
    response::{Html, IntoResponse, Response},
};
use tokio::{fs::File, io::AsyncWriteExt};
use uuid::Uuid;

use super::{job_header, mjpeg_response};
use crate::{
    error::AppError,
    jobs::{Job, JobKind, JobStatus},
    pages::{self, SUPPORTED_TYPES},
    pipeline::{self, content_type_for, sanitize_filename, UploadKind},
    session::CurrentUser,
    state::AppState,
};

pub async fn index(CurrentUser { user, .. }: CurrentUser) -> Html<String> {
    pages::upload_page(&user, None)
}

/// Handle an upload: save it and run the image or the video path depending on its extension.
pub async fn upload(
    State(state): State<AppState>,
    CurrentUser { user, .. }: CurrentUser,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut upload: Option<(String, UploadKind, Uuid, PathBuf)> = None;
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = match field.file_name().and_then(sanitize_filename) {
            Some(file_name) => file_name,
            None => continue,
        };

        let kind = match UploadKind::from_filename(&file_name) {
            Some(kind) => kind,
            None => {
                log::info!("Ignoring upload {} of unsupported type", file_name);
                let notice =
                    format!("Cannot process {file_name}. Supported types: {SUPPORTED_TYPES}.");
                return Ok(pages::upload_page(&user, Some(&notice)).into_response());
            }
        };

        let job_id = Uuid::new_v4();
        let upload_dir = state.config.uploads_dir.join(job_id.to_string());
        tokio::fs::create_dir_all(&upload_dir).await?;
        let input = upload_dir.join(&file_name);
        let size = save_field(&mut field, &input).await?;

        log::info!(
            "User {} uploaded {} ({} bytes) as {:?} job {}",
            user.username,
            file_name,
            size,
            kind,
            job_id
        );
        upload = Some((file_name, kind, job_id, input));
        break;
    }

    let (file_name, kind, job_id, input) = match upload {
        Some(upload) => upload,
        None => {
            log::info!("Upload of {} without a file", user.username);
            return Ok(pages::upload_page(&user, Some("No file selected.")).into_response());
        }
    };

    let output_dir = state.config.detect_dir().join(job_id.to_string());
    tokio::fs::create_dir_all(&output_dir).await?;

    match kind {
        UploadKind::Image => {
            let output = output_dir.join(&file_name);
            let job = state
                .jobs
                .create(job_id, Some(user.id), JobKind::Image, output.clone());

            let model = Arc::clone(&state.model);
            let result = tokio::task::spawn_blocking(move || {
                pipeline::detect_image(model.as_ref(), &input, &output)
            })
            .await?;
            finish_job(&state, &job, result.map(|_| ()))?;

            serve_file(&job).await
        }
        UploadKind::Video => {
            let output = output_dir.join(format!("output.{}", state.media.video_extension()));
            let job = state
                .jobs
                .create(job_id, Some(user.id), JobKind::Video, output.clone());

            let model = Arc::clone(&state.model);
            let media = Arc::clone(&state.media);
            let fps = state.config.output_fps;
            let result = tokio::task::spawn_blocking(move || {
                pipeline::process_video(model.as_ref(), media.as_ref(), &input, &output, fps)
            })
            .await?;

            match result {
                Ok(0) => {
                    state.jobs.set_status(job.id, JobStatus::Failed);
                    log::info!("Video {} of job {} has no frames", file_name, job.id);
                    let notice = format!("{file_name} contains no frames.");
                    Ok(pages::upload_page(&user, Some(&notice)).into_response())
                }
                result => {
                    finish_job(&state, &job, result.map(|_| ()))?;
                    let delay = Duration::from_millis(state.config.replay_delay_ms);
                    let rx = pipeline::spawn_replay(state.media.clone(), job.output.clone(), delay);
                    Ok(mjpeg_response(rx, job.id))
                }
            }
        }
    }
}

/// Serve the output of a finished job of the current user.
pub async fn result(
    State(state): State<AppState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(job_id): Path<Uuid>,
) -> Result<Response, AppError> {
    match state.jobs.get(job_id) {
        Some(job) if job.user_id == Some(user.id) && job.status == JobStatus::Finished => {
            serve_file(&job).await
        }
        _ => Err(AppError::NotFound),
    }
}

/// Serve the most recent image result of the current user.
///
/// The file name only shows up in the log.
pub async fn latest_image(
    State(state): State<AppState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    log::debug!("Latest image requested as {}", filename);
    let job = state
        .jobs
        .latest_finished(JobKind::Image, Some(user.id))
        .ok_or(AppError::NotFound)?;
    serve_file(&job).await
}

fn finish_job(state: &AppState, job: &Job, result: Result<(), AppError>) -> Result<(), AppError> {
    match result {
        Ok(()) => {
            state.jobs.set_status(job.id, JobStatus::Finished);
            Ok(())
        }
        Err(e) => {
            state.jobs.set_status(job.id, JobStatus::Failed);
            log::error!("Job {} failed", job.id);
            Err(e)
        }
    }
}

async fn serve_file(job: &Job) -> Result<Response, AppError> {
    let data = read_output(&job.output).await?;
    let headers = [(header::CONTENT_TYPE, content_type_for(&job.output))];
    Ok((headers, [job_header(job.id)], data).into_response())
}

/// Write a multipart field to `path` chunk by chunk. Returns the number of bytes written.
async fn save_field(field: &mut Field<'_>, path: &FsPath) -> Result<u64, AppError> {
    let mut file = File::create(path).await?;
    let mut size = 0;
    while let Some(chunk) = field.chunk().await? {
        size += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(size)
}

async fn read_output(path: &FsPath) -> Result<Vec<u8>, AppError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::NotFound),
        Err(e) => Err(e.into()),
    }
}
