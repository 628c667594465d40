mod synthetic;
mod v4l_capture;

pub use synthetic::SyntheticCapture;
pub use v4l_capture::WebcamCapture;

use anyhow::Result;
use image::RgbImage;

/// Settings a capture device reports about its stream.
///
/// Fields the device cannot report are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrackSettings {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f32>,
}

/// Trait for camera capture sources
pub trait CaptureSource {
    /// Capture a single frame
    fn capture_frame(&mut self) -> Result<RgbImage>;

    /// Stream settings, or `None` if the source cannot be introspected
    fn settings(&self) -> Option<TrackSettings>;

    /// Release the device
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}
