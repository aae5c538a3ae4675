//! Common code shared between `detect_server` and its tests.
pub mod mjpeg;
