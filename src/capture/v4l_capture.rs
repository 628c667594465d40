use super::{CaptureSource, TrackSettings};
use anyhow::{Context, Result};
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;

pub struct WebcamCapture {
    camera: Camera,
    streaming: bool,
}

impl WebcamCapture {
    /// Open camera `device_index` at the format closest to the request
    pub fn new(device_index: u32, width: u32, height: u32, fps: u32) -> Result<Self> {
        tracing::info!(
            "Initializing webcam {} at {}x{}@{}",
            device_index,
            width,
            height,
            fps
        );

        let index = CameraIndex::Index(device_index);
        let closest = CameraFormat::new(Resolution::new(width, height), FrameFormat::MJPEG, fps);
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(closest));

        let mut camera = Camera::new(index, requested).context("Failed to open camera")?;

        camera
            .open_stream()
            .context("Failed to open camera stream")?;

        let resolution = camera.resolution();
        tracing::info!(
            "Webcam streaming at {}x{}@{}",
            resolution.width(),
            resolution.height(),
            camera.frame_rate()
        );

        Ok(Self {
            camera,
            streaming: true,
        })
    }
}

impl CaptureSource for WebcamCapture {
    fn capture_frame(&mut self) -> Result<RgbImage> {
        let frame = self
            .camera
            .frame()
            .context("Failed to capture frame")?;

        let decoded = frame
            .decode_image::<RgbFormat>()
            .context("Failed to decode frame")?;

        Ok(decoded)
    }

    fn settings(&self) -> Option<TrackSettings> {
        let resolution = self.camera.resolution();
        let frame_rate = self.camera.frame_rate();

        Some(TrackSettings {
            width: Some(resolution.width()).filter(|&w| w > 0),
            height: Some(resolution.height()).filter(|&h| h > 0),
            frame_rate: Some(frame_rate as f32).filter(|&fps| fps > 0.0),
        })
    }

    fn stop(&mut self) -> Result<()> {
        if self.streaming {
            self.streaming = false;
            self.camera
                .stop_stream()
                .context("Failed to stop camera stream")?;
            tracing::info!("Webcam stream stopped");
        }
        Ok(())
    }
}
