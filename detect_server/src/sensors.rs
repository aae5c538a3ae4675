//! Sensors module.
//!
//! Native V4L2 capture, available with the `camera` feature.
use image::RgbImage;
use rscam::{Camera, Config};

use crate::media::{decode_jpeg, FrameSource, MediaError};

const FORMAT: &[u8] = b"MJPG";

/// Camera delivering MJPG frames at its highest resolution and frame rate.
pub struct RscamSource {
    cam: Camera,
}

impl RscamSource {
    pub fn open(device: &str) -> Result<Self, MediaError> {
        let unavailable = |e: &dyn std::fmt::Display| {
            MediaError::CameraUnavailable(format!("{device}: {e}"))
        };

        let mut cam = Camera::new(device).map_err(|e| unavailable(&e))?;
        log::info!("Using camera {}", device);

        let resolution = get_max_resolution(&cam).map_err(|e| unavailable(&e))?;
        let interval = get_max_frame_rate(&cam, resolution).map_err(|e| unavailable(&e))?;
        log::debug!("Capturing {resolution:?} at interval {interval:?}");

        cam.start(&Config {
            interval,
            resolution,
            format: FORMAT,
            ..Default::default()
        })
        .map_err(|e| unavailable(&e))?;

        Ok(Self { cam })
    }
}

impl FrameSource for RscamSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        let frame = self.cam.capture()?;
        decode_jpeg(&frame[..]).map(Some)
    }
}

/// Get the maximum supported resolution.
fn get_max_resolution(cam: &Camera) -> Result<(u32, u32), String> {
    let resolution_info = cam.resolutions(FORMAT).map_err(|e| e.to_string())?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            // Highest resolution in terms of number of pixels
            .max_by_key(|res| res.0 * res.1)
            .copied(),
        rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
    }
    .ok_or_else(|| "no resolution found".to_string())
}

/// Get the maximum supported frame rate for the given resolution.
fn get_max_frame_rate(cam: &Camera, resolution: (u32, u32)) -> Result<(u32, u32), String> {
    let interval_info = cam
        .intervals(FORMAT, resolution)
        .map_err(|e| e.to_string())?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        // Intervals are (numerator, denominator) seconds per frame
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .iter()
            .max_by_key(|(num, den)| den / num.max(&1))
            .copied(),
        rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
    }
    .ok_or_else(|| "no frame rate found".to_string())
}
