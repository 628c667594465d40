use super::{CaptureSource, TrackSettings};
use anyhow::{ensure, Result};
use image::{Rgb, RgbImage};

/// Generated test pattern: a bright ellipse (the "person") drifting over a
/// dark gradient. Useful without a camera attached.
pub struct SyntheticCapture {
    width: u32,
    height: u32,
    frame_rate: f32,
    frame_index: u64,
    stopped: bool,
}

impl SyntheticCapture {
    pub fn new(width: u32, height: u32, frame_rate: f32) -> Self {
        tracing::info!(
            "Synthetic capture at {}x{}@{}",
            width,
            height,
            frame_rate
        );

        Self {
            width,
            height,
            frame_rate,
            frame_index: 0,
            stopped: false,
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_index
    }
}

impl CaptureSource for SyntheticCapture {
    fn capture_frame(&mut self) -> Result<RgbImage> {
        ensure!(!self.stopped, "synthetic capture is stopped");

        let (w, h) = (self.width as f32, self.height as f32);
        let drift = (self.frame_index as f32 * 0.05).sin() * w * 0.1;
        let (cx, cy) = (w * 0.5 + drift, h * 0.6);
        let (rx, ry) = (w * 0.2, h * 0.45);

        let frame = RgbImage::from_fn(self.width, self.height, |x, y| {
            let dx = (x as f32 - cx) / rx;
            let dy = (y as f32 - cy) / ry;
            if dx * dx + dy * dy <= 1.0 {
                Rgb([230, 200, 170])
            } else {
                let shade = (40.0 + 60.0 * x as f32 / w) as u8;
                Rgb([shade, shade / 2, 90])
            }
        });

        self.frame_index += 1;
        Ok(frame)
    }

    fn settings(&self) -> Option<TrackSettings> {
        Some(TrackSettings {
            width: Some(self.width),
            height: Some(self.height),
            frame_rate: Some(self.frame_rate),
        })
    }

    fn stop(&mut self) -> Result<()> {
        self.stopped = true;
        Ok(())
    }
}
