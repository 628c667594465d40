use super::OutputSink;
use anyhow::{Context, Result};
use image::RgbImage;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use v4l::video::Output;
use v4l::{Device, Format, FourCC};

/// Writes YUYV frames into a v4l2loopback device.
pub struct V4L2Output {
    _device: Device,
    file: Option<File>,
    width: u32,
    height: u32,
    yuyv: Vec<u8>,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{})",
            path.display(),
            width,
            height
        );

        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open v4l2 device at {}", path.display()))?;

        let requested = Format::new(width, height, FourCC::new(b"YUYV"));
        let applied = Output::set_format(&device, &requested)
            .context("Failed to set v4l2loopback output format")?;
        tracing::debug!("v4l2loopback format: {:?}", applied);

        // v4l2loopback accepts raw frames written to the device node
        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;

        Ok(Self {
            _device: device,
            file: Some(file),
            width: applied.width,
            height: applied.height,
            yuyv: Vec::with_capacity((applied.width * applied.height * 2) as usize),
        })
    }
}

/// Pack RGB pixels as YUYV 4:2:2, averaging chroma over pixel pairs
fn rgb_to_yuyv(frame: &RgbImage, yuyv: &mut Vec<u8>) {
    yuyv.clear();

    for row in frame.as_raw().chunks_exact(frame.width() as usize * 3) {
        for pair in row.chunks(6) {
            let first = &pair[..3];
            let second = if pair.len() == 6 { &pair[3..] } else { first };

            let (y0, u0, v0) = rgb_to_yuv(first[0], first[1], first[2]);
            let (y1, u1, v1) = rgb_to_yuv(second[0], second[1], second[2]);

            yuyv.extend_from_slice(&[
                y0,
                ((u0 as u16 + u1 as u16) / 2) as u8,
                y1,
                ((v0 as u16 + v1 as u16) / 2) as u8,
            ]);
        }
    }
}

fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);

    let y = (0.299 * r + 0.587 * g + 0.114 * b).clamp(0.0, 255.0) as u8;
    let u = (-0.147 * r - 0.289 * g + 0.436 * b + 128.0).clamp(0.0, 255.0) as u8;
    let v = (0.615 * r - 0.515 * g - 0.100 * b + 128.0).clamp(0.0, 255.0) as u8;

    (y, u, v)
}

impl OutputSink for V4L2Output {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let resized;
        let frame = if frame.dimensions() != (self.width, self.height) {
            resized = image::imageops::resize(
                frame,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            );
            &resized
        } else {
            frame
        };

        rgb_to_yuyv(frame, &mut self.yuyv);

        let file = self
            .file
            .as_mut()
            .context("v4l2loopback device is closed")?;
        file.write_all(&self.yuyv)
            .context("Failed to write frame to v4l2loopback device")?;

        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().context("Failed to flush v4l2loopback device")?;
            tracing::info!("v4l2loopback device closed");
        }
        Ok(())
    }
}
