//! Endpoints of HTTP server.
//!
use std::convert::Infallible;

use axum::{
    body::StreamBody,
    http::{header, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use common::mjpeg::MULTIPART_CONTENT_TYPE;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::meter::METER;

pub mod account;
pub mod detect;
pub mod stream;

/// Header carrying the id of the job a response belongs to.
pub const JOB_ID_HEADER: &str = "x-job-id";

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

fn job_header(job_id: Uuid) -> (HeaderName, HeaderValue) {
    // A hyphenated uuid is always a valid header value
    let value = HeaderValue::from_str(&job_id.to_string())
        .unwrap_or_else(|_| HeaderValue::from_static(""));
    (HeaderName::from_static(JOB_ID_HEADER), value)
}

/// Multipart MJPEG response fed by a frame producer.
fn mjpeg_response(rx: mpsc::Receiver<Bytes>, job_id: Uuid) -> Response {
    let stream = ReceiverStream::new(rx).map(|x| {
        METER.tick_streamed();
        Ok::<_, Infallible>(x)
    });

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let (name, value) = job_header(job_id);
    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static(MULTIPART_CONTENT_TYPE)),
        (name, value),
    ];

    (headers, body).into_response()
}
