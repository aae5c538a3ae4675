//! Web application running object detection on uploaded images, videos and a camera feed.
//!
pub mod annotate;
pub mod config;
pub mod db;
pub mod endpoints;
pub mod error;
pub mod forms;
pub mod jobs;
pub mod media;
pub mod meter;
pub mod nn;
pub mod pages;
pub mod pipeline;
pub mod router;
#[cfg(feature = "camera")]
pub mod sensors;
pub mod session;
pub mod state;
