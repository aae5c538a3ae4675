//! Reading and writing of frame sequences.
//!
//! Videos are decoded into and encoded from `RgbImage`s behind the `FrameSource` and `FrameSink`
//! traits. Two backends exist:
//! - `FfmpegBackend` pipes frames through an `ffmpeg` subprocess and handles mp4 files,
//! - `MjpegBackend` reads and writes raw MJPEG files (JPEG images back to back) in-process.
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio},
    thread::JoinHandle,
};

use common::mjpeg::JpegSplitter;
use image::{codecs::jpeg::JpegEncoder, ColorType, ImageFormat, RgbImage};
use thiserror::Error;

/// JPEG quality of encoded frames.
pub const JPEG_QUALITY: u8 = 90;

const READ_CHUNK: usize = 64 * 1024;

/// Bytes of a subprocess' diagnostics kept for error messages.
const STDERR_TAIL: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not decode frame: {0}")]
    Decode(#[from] image::ImageError),

    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("{program} failed: {message}")]
    Subprocess { program: String, message: String },

    #[error("frame of size {got:?} does not fit video of size {expected:?}")]
    FrameSize { expected: (u32, u32), got: (u32, u32) },
}

/// Sequential access to decoded frames.
pub trait FrameSource: Send {
    /// Next frame, `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<RgbImage>, MediaError>;
}

/// Sequential writing of frames into a video.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), MediaError>;

    /// Flush and close the video. Frames written before are lost if this is not called.
    fn finish(self: Box<Self>) -> Result<(), MediaError>;
}

pub trait MediaBackend: Send + Sync {
    /// Extension of the videos written by `create_video`.
    fn video_extension(&self) -> &'static str;

    fn open_video(&self, path: &Path) -> Result<Box<dyn FrameSource>, MediaError>;

    fn create_video(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn FrameSink>, MediaError>;

    fn open_camera(&self, device: &str) -> Result<Box<dyn FrameSource>, MediaError>;
}

/// Encode an image as JPEG.
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, MediaError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode(
        image.as_raw(),
        image.width(),
        image.height(),
        ColorType::Rgb8,
    )?;
    Ok(buf)
}

/// Decode a JPEG image.
pub fn decode_jpeg(data: &[u8]) -> Result<RgbImage, MediaError> {
    Ok(image::load_from_memory_with_format(data, ImageFormat::Jpeg)?.to_rgb8())
}

/// Decodes the JPEG images of a concatenated-JPEG byte stream.
struct JpegFrameReader<R> {
    reader: R,
    splitter: JpegSplitter,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R: Read> JpegFrameReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            splitter: JpegSplitter::new(),
            chunk: vec![0; READ_CHUNK],
            eof: false,
        }
    }

    fn next_jpeg(&mut self) -> Result<Option<Vec<u8>>, MediaError> {
        loop {
            if let Some(jpeg) = self.splitter.next_frame() {
                return Ok(Some(jpeg));
            }
            if self.eof {
                if self.splitter.buffered() > 0 {
                    log::warn!(
                        "Dropping {} trailing bytes of incomplete image",
                        self.splitter.buffered()
                    );
                }
                return Ok(None);
            }

            let n = self.reader.read(&mut self.chunk)?;
            if n == 0 {
                self.eof = true;
            } else {
                self.splitter.push(&self.chunk[..n]);
            }
        }
    }

    fn next_image(&mut self) -> Result<Option<RgbImage>, MediaError> {
        match self.next_jpeg()? {
            Some(jpeg) => decode_jpeg(&jpeg).map(Some),
            None => Ok(None),
        }
    }
}

/// Raw MJPEG file.
pub struct MjpegReader {
    inner: JpegFrameReader<BufReader<File>>,
}

impl MjpegReader {
    pub fn open(path: &Path) -> Result<Self, MediaError> {
        let file = File::open(path)?;
        Ok(Self {
            inner: JpegFrameReader::new(BufReader::new(file)),
        })
    }
}

impl FrameSource for MjpegReader {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        self.inner.next_image()
    }
}

pub struct MjpegWriter {
    out: BufWriter<File>,
    size: (u32, u32),
}

impl MjpegWriter {
    pub fn create(path: &Path, width: u32, height: u32) -> Result<Self, MediaError> {
        let file = File::create(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            size: (width, height),
        })
    }
}

impl FrameSink for MjpegWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), MediaError> {
        check_frame_size(self.size, frame)?;
        self.out.write_all(&encode_jpeg(frame)?)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), MediaError> {
        self.out.flush()?;
        Ok(())
    }
}

/// In-process backend for raw MJPEG files.
#[derive(Debug, Default, Clone)]
pub struct MjpegBackend;

impl MjpegBackend {
    pub fn new() -> Self {
        Self
    }
}

impl MediaBackend for MjpegBackend {
    fn video_extension(&self) -> &'static str {
        "mjpeg"
    }

    fn open_video(&self, path: &Path) -> Result<Box<dyn FrameSource>, MediaError> {
        Ok(Box::new(MjpegReader::open(path)?))
    }

    fn create_video(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        _fps: u32,
    ) -> Result<Box<dyn FrameSink>, MediaError> {
        Ok(Box::new(MjpegWriter::create(path, width, height)?))
    }

    fn open_camera(&self, device: &str) -> Result<Box<dyn FrameSource>, MediaError> {
        open_native_camera(device)
    }
}

#[cfg(feature = "camera")]
fn open_native_camera(device: &str) -> Result<Box<dyn FrameSource>, MediaError> {
    Ok(Box::new(crate::sensors::RscamSource::open(device)?))
}

#[cfg(not(feature = "camera"))]
fn open_native_camera(device: &str) -> Result<Box<dyn FrameSource>, MediaError> {
    Err(MediaError::CameraUnavailable(format!(
        "cannot open {device}, built without the `camera` feature"
    )))
}

/// Backend running `ffmpeg` for decoding and encoding.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    program: PathBuf,
}

impl FfmpegBackend {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-hide_banner", "-loglevel", "error"]);
        cmd
    }

    fn spawn_decoder(&self, mut cmd: Command) -> Result<FfmpegReader, MediaError> {
        cmd.args(["-f", "image2pipe", "-c:v", "mjpeg", "-q:v", "2", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        let stderr = StderrTail::spawn(child.stderr.take());
        let stdout = child.stdout.take().ok_or_else(|| MediaError::Subprocess {
            program: self.program.display().to_string(),
            message: "no stdout".into(),
        })?;

        Ok(FfmpegReader {
            program: self.program.display().to_string(),
            inner: JpegFrameReader::new(stdout),
            child,
            stderr,
            frames: 0,
        })
    }

    fn spawn_error(&self, err: std::io::Error) -> MediaError {
        MediaError::Subprocess {
            program: self.program.display().to_string(),
            message: format!("could not start: {err}"),
        }
    }
}

impl MediaBackend for FfmpegBackend {
    fn video_extension(&self) -> &'static str {
        "mp4"
    }

    fn open_video(&self, path: &Path) -> Result<Box<dyn FrameSource>, MediaError> {
        log::debug!("Decoding {} with ffmpeg", path.display());
        let mut cmd = self.command();
        cmd.arg("-i").arg(path);
        Ok(Box::new(self.spawn_decoder(cmd)?))
    }

    fn create_video(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn FrameSink>, MediaError> {
        log::debug!("Encoding {} with ffmpeg", path.display());
        let mut cmd = self.command();
        cmd.args(["-y", "-f", "rawvideo", "-pix_fmt", "rgb24"])
            .arg("-s")
            .arg(format!("{width}x{height}"))
            .arg("-r")
            .arg(fps.to_string())
            .args(["-i", "-"])
            // yuv420p needs even dimensions
            .args(["-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2"])
            .args(["-c:v", "mpeg4", "-q:v", "3", "-pix_fmt", "yuv420p"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        let stdin = child.stdin.take();
        let stderr = StderrTail::spawn(child.stderr.take());

        Ok(Box::new(FfmpegWriter {
            program: self.program.display().to_string(),
            stdin,
            child: Some(child),
            stderr,
            size: (width, height),
        }))
    }

    fn open_camera(&self, device: &str) -> Result<Box<dyn FrameSource>, MediaError> {
        if cfg!(feature = "camera") {
            return open_native_camera(device);
        }
        if !Path::new(device).exists() {
            return Err(MediaError::CameraUnavailable(format!("{device} does not exist")));
        }

        let mut cmd = self.command();
        cmd.args(["-f", "v4l2", "-i", device]);
        let unavailable = |e: MediaError| match e {
            MediaError::Subprocess { message, .. } => MediaError::CameraUnavailable(message),
            other => MediaError::CameraUnavailable(other.to_string()),
        };
        let mut reader = self.spawn_decoder(cmd).map_err(unavailable)?;

        // A busy or unreadable device only shows once ffmpeg tries to read from it
        match reader.next_frame().map_err(unavailable)? {
            Some(first) => Ok(Box::new(PrimedSource {
                first: Some(first),
                rest: reader,
            })),
            None => Err(MediaError::CameraUnavailable(format!(
                "{device} delivered no frames"
            ))),
        }
    }
}

/// Source handing out an already read frame before the rest.
struct PrimedSource<S> {
    first: Option<RgbImage>,
    rest: S,
}

impl<S: FrameSource> FrameSource for PrimedSource<S> {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        match self.first.take() {
            Some(frame) => Ok(Some(frame)),
            None => self.rest.next_frame(),
        }
    }
}

/// Drains a subprocess' stderr on a helper thread, keeping its last bytes.
///
/// An undrained pipe fills up and blocks the subprocess.
struct StderrTail {
    handle: Option<JoinHandle<Vec<u8>>>,
}

impl StderrTail {
    fn spawn(stderr: Option<ChildStderr>) -> Self {
        let handle = stderr.map(|mut stderr| {
            std::thread::spawn(move || {
                let mut tail = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    match stderr.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            tail.extend_from_slice(&buf[..n]);
                            if tail.len() > STDERR_TAIL {
                                tail.drain(..tail.len() - STDERR_TAIL);
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
                tail
            })
        });
        Self { handle }
    }

    /// Collected output. Blocks until the subprocess closed its stderr.
    fn collect(&mut self) -> String {
        match self.handle.take().map(|handle| handle.join()) {
            Some(Ok(tail)) => String::from_utf8_lossy(&tail).trim().to_string(),
            _ => String::new(),
        }
    }
}

pub struct FfmpegReader {
    program: String,
    inner: JpegFrameReader<ChildStdout>,
    child: Child,
    stderr: StderrTail,
    frames: usize,
}

impl FfmpegReader {
    /// Reap the process once its output is exhausted.
    fn finish(&mut self) -> Result<(), MediaError> {
        let status = self.child.wait()?;
        let message = self.stderr.collect();
        if status.success() || self.frames > 0 {
            if !message.is_empty() {
                log::warn!("{} reported: {}", self.program, message);
            }
            return Ok(());
        }

        Err(MediaError::Subprocess {
            program: self.program.clone(),
            message: format!("{status}: {message}"),
        })
    }
}

impl FrameSource for FfmpegReader {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        match self.inner.next_image()? {
            Some(frame) => {
                self.frames += 1;
                Ok(Some(frame))
            }
            None => {
                self.finish()?;
                Ok(None)
            }
        }
    }
}

impl Drop for FfmpegReader {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.child.kill().ok();
            self.child.wait().ok();
        }
    }
}

pub struct FfmpegWriter {
    program: String,
    stdin: Option<ChildStdin>,
    child: Option<Child>,
    stderr: StderrTail,
    size: (u32, u32),
}

impl FrameSink for FfmpegWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), MediaError> {
        check_frame_size(self.size, frame)?;
        match self.stdin.as_mut() {
            Some(stdin) => Ok(stdin.write_all(frame.as_raw())?),
            None => Err(MediaError::Subprocess {
                program: self.program.clone(),
                message: "input already closed".into(),
            }),
        }
    }

    fn finish(mut self: Box<Self>) -> Result<(), MediaError> {
        // Closing stdin lets ffmpeg finalise the file
        drop(self.stdin.take());

        let mut child = match self.child.take() {
            Some(child) => child,
            None => return Ok(()),
        };
        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(MediaError::Subprocess {
                program: self.program.clone(),
                message: format!("{status}: {}", self.stderr.collect()),
            })
        }
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            child.kill().ok();
            child.wait().ok();
        }
    }
}

fn check_frame_size(expected: (u32, u32), frame: &RgbImage) -> Result<(), MediaError> {
    let got = frame.dimensions();
    if got == expected {
        Ok(())
    } else {
        Err(MediaError::FrameSize { expected, got })
    }
}
