//! Command line configuration.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::{Parser, ValueEnum};

use crate::{
    media::{FfmpegBackend, MediaBackend, MjpegBackend},
    nn::ModelSettings,
};

/// Backend used to read and write video files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VideoBackendKind {
    /// Decode/encode through an `ffmpeg` subprocess (mp4 in, mp4 out).
    Ffmpeg,
    /// Raw MJPEG files, no external tools required.
    Mjpeg,
}

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Web app running object detection on uploads and webcam")]
pub struct Config {
    /// Port to listen on
    #[clap(long, default_value_t = 5000)]
    pub port: u16,

    /// Address to bind to
    #[clap(long, default_value = "0.0.0.0")]
    pub host: String,

    /// SQLite database holding the user table
    #[clap(long, env = "DATABASE_URL", default_value = "sqlite://database.db")]
    pub database_url: String,

    /// Key for signing session cookies, at least 64 bytes. Random per process if unset.
    #[clap(long, env = "SESSION_SECRET", hide_env_values = true)]
    pub session_secret: Option<String>,

    /// ONNX export of the detection model
    #[clap(long, default_value = "best.onnx")]
    pub model: PathBuf,

    /// Class names, one per line
    #[clap(long)]
    pub labels: Option<PathBuf>,

    /// Side length of the square model input
    #[clap(long, default_value_t = 640)]
    pub input_size: u32,

    /// Minimum confidence of a reported detection
    #[clap(long, default_value_t = 0.25)]
    pub min_confidence: f32,

    /// Maximum overlap of two detections of the same class
    #[clap(long, default_value_t = 0.45)]
    pub max_iou: f32,

    /// Directory uploads are written to
    #[clap(long, default_value = "uploads")]
    pub uploads_dir: PathBuf,

    /// Directory detection outputs are written to
    #[clap(long, default_value = "runs")]
    pub runs_dir: PathBuf,

    /// Video file backend
    #[clap(long, value_enum, default_value_t = VideoBackendKind::Ffmpeg)]
    pub video_backend: VideoBackendKind,

    /// ffmpeg executable
    #[clap(long, default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Camera device of the live feed
    #[clap(long, default_value = "/dev/video0")]
    pub camera: String,

    /// Frame rate of written videos
    #[clap(long, default_value_t = 30)]
    pub output_fps: u32,

    /// Delay between frames when replaying a processed video
    #[clap(long, default_value_t = 100)]
    pub replay_delay_ms: u64,
}

impl Config {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(SocketAddr::new(self.host.parse()?, self.port))
    }

    pub fn model_settings(&self) -> ModelSettings {
        ModelSettings {
            input_size: self.input_size,
            min_confidence: self.min_confidence,
            max_iou: self.max_iou,
        }
    }

    pub fn media_backend(&self) -> Arc<dyn MediaBackend> {
        match self.video_backend {
            VideoBackendKind::Ffmpeg => Arc::new(FfmpegBackend::new(self.ffmpeg.clone())),
            VideoBackendKind::Mjpeg => Arc::new(MjpegBackend::new()),
        }
    }

    pub fn detect_dir(&self) -> PathBuf {
        self.runs_dir.join("detect")
    }

    pub fn webcam_dir(&self) -> PathBuf {
        self.runs_dir.join("webcam")
    }
}
