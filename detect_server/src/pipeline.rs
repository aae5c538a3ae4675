//! Detection on images, video files and live frames.
//!
//! Everything in here blocks and is meant to run on the blocking thread pool.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use common::mjpeg::as_jpeg_stream_item;
use image::RgbImage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    annotate::draw_bboxes_on_image,
    error::AppError,
    jobs::{JobRegistry, JobStatus},
    media::{encode_jpeg, FrameSink, FrameSource, MediaBackend, MediaError},
    meter::METER,
    nn::{Detection, InferModel},
};

/// Frames buffered between a producer and the HTTP response.
pub const FRAME_CHANNEL_CAPACITY: usize = 4;

/// What an upload is processed as, decided by its file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Image,
    Video,
}

impl UploadKind {
    pub fn from_filename(name: &str) -> Option<Self> {
        let extension = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "jpg" | "png" => Some(UploadKind::Image),
            "mp4" => Some(UploadKind::Video),
            _ => None,
        }
    }
}

/// Final path component of an uploaded file name, `None` if nothing usable is left.
pub fn sanitize_filename(name: &str) -> Option<String> {
    // Browsers on Windows may send the full client path
    let name = name.rsplit(['/', '\\']).next()?.trim();
    match name {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}

/// Content type of a result file.
pub fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("mp4") => "video/mp4",
        Some("mjpeg") => "video/x-motion-jpeg",
        _ => "image/jpeg",
    }
}

fn infer_and_draw(model: &dyn InferModel, frame: &mut RgbImage) -> Result<Vec<Detection>, AppError> {
    let detections = model.run(frame)?;
    METER.tick_inferred();
    draw_bboxes_on_image(frame, &detections);
    Ok(detections)
}

/// Run detection on an image file and save the annotated copy.
pub fn detect_image(
    model: &dyn InferModel,
    input: &Path,
    output: &Path,
) -> Result<Vec<Detection>, AppError> {
    let mut frame = image::open(input)?.to_rgb8();
    let detections = infer_and_draw(model, &mut frame)?;
    frame.save(output)?;

    log::info!(
        "Found {} objects in {}",
        detections.len(),
        input.display()
    );
    Ok(detections)
}

/// Run detection on every frame of a video and write the annotated frames to `output`.
///
/// Returns the number of frames written. Nothing is written for a video without frames.
pub fn process_video(
    model: &dyn InferModel,
    media: &dyn MediaBackend,
    input: &Path,
    output: &Path,
    fps: u32,
) -> Result<usize, AppError> {
    let mut source = media.open_video(input)?;

    let mut frame = match source.next_frame()? {
        Some(frame) => frame,
        None => return Ok(0),
    };
    let (width, height) = frame.dimensions();
    let mut sink = media.create_video(output, width, height, fps)?;

    let mut count = 0;
    loop {
        if frame.dimensions() != (width, height) {
            frame = image::imageops::resize(
                &frame,
                width,
                height,
                image::imageops::FilterType::Triangle,
            );
        }
        infer_and_draw(model, &mut frame)?;
        sink.write_frame(&frame)?;
        count += 1;

        frame = match source.next_frame()? {
            Some(frame) => frame,
            None => break,
        };
    }
    sink.finish()?;

    log::info!(
        "Wrote {} annotated frames of {} to {}",
        count,
        input.display(),
        output.display()
    );
    Ok(count)
}

/// Stream the frames of a video file, pausing `delay` after each frame.
///
/// The stream ends with the file or when the receiver is dropped.
pub fn spawn_replay(
    media: Arc<dyn MediaBackend>,
    path: PathBuf,
    delay: Duration,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || {
        let mut source = match media.open_video(&path) {
            Ok(source) => source,
            Err(e) => {
                log::error!("Could not open {} for replay: {e}", path.display());
                return;
            }
        };

        let mut count = 0;
        loop {
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    log::error!("Replay of {} failed: {e}", path.display());
                    break;
                }
            };
            let jpeg = match encode_jpeg(&frame) {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    log::error!("Could not encode frame: {e}");
                    break;
                }
            };
            if tx.blocking_send(as_jpeg_stream_item(&jpeg)).is_err() {
                log::debug!("Replay client of {} went away", path.display());
                break;
            }
            count += 1;
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
        log::debug!("Replayed {} frames of {}", count, path.display());
    });

    rx
}

/// Live detection on camera frames.
pub struct LiveFeed {
    pub model: Arc<dyn InferModel>,
    pub media: Arc<dyn MediaBackend>,
    pub jobs: Arc<JobRegistry>,
    pub job_id: Uuid,
    pub output: PathBuf,
    pub fps: u32,
    pub token: CancellationToken,
}

impl LiveFeed {
    /// Start the feed on an opened camera.
    ///
    /// Runs until the receiver is dropped, the token is cancelled or the camera fails. The
    /// annotated frames are recorded to `output` as well.
    pub fn spawn(self, source: Box<dyn FrameSource>) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || self.run(source, tx));
        rx
    }

    fn run(self, mut source: Box<dyn FrameSource>, tx: mpsc::Sender<Bytes>) {
        log::info!("Live feed {} started", self.job_id);

        let mut sink: Option<Box<dyn FrameSink>> = None;
        let mut failed = false;
        let mut count = 0;

        while !self.token.is_cancelled() && !tx.is_closed() {
            let mut frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    log::error!("Camera of live feed {} failed: {e}", self.job_id);
                    failed = true;
                    break;
                }
            };

            if let Err(e) = infer_and_draw(self.model.as_ref(), &mut frame) {
                log::error!("Live feed {}: {e}", self.job_id);
                failed = true;
                break;
            }

            if let Err(e) = self.record(&mut sink, &frame) {
                log::error!("Could not record live feed {}: {e}", self.job_id);
                failed = true;
                break;
            }

            let jpeg = match encode_jpeg(&frame) {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    log::error!("Could not encode frame: {e}");
                    failed = true;
                    break;
                }
            };
            if tx.blocking_send(as_jpeg_stream_item(&jpeg)).is_err() {
                break;
            }
            count += 1;
        }

        // Release the camera before finalising the recording
        drop(source);
        if let Some(sink) = sink {
            if let Err(e) = sink.finish() {
                log::error!("Could not finish recording of live feed {}: {e}", self.job_id);
                failed = true;
            }
        }

        self.jobs.unregister_live(self.job_id);
        let status = if failed || count == 0 {
            JobStatus::Failed
        } else {
            JobStatus::Finished
        };
        self.jobs.set_status(self.job_id, status);
        log::info!(
            "Live feed {} stopped after {} frames",
            self.job_id,
            count
        );
    }

    fn record(&self, sink: &mut Option<Box<dyn FrameSink>>, frame: &RgbImage) -> Result<(), MediaError> {
        if sink.is_none() {
            let (width, height) = frame.dimensions();
            *sink = Some(self.media.create_video(&self.output, width, height, self.fps)?);
        }
        match sink.as_mut() {
            Some(sink) => sink.write_frame(frame),
            None => Ok(()),
        }
    }
}
