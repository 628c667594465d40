use anyhow::{bail, Context, Result};
use image::{imageops, RgbImage};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

/// Background still image that resolves asynchronously.
///
/// Decoding happens on a helper thread; the render thread only polls. Until
/// the image resolves the composite stages skip their frame. A failed load
/// never resolves.
pub struct BackgroundImage {
    state: ImageState,
}

enum ImageState {
    Pending(Receiver<Result<RgbImage>>),
    Ready(RgbImage),
    Unavailable,
}

impl BackgroundImage {
    /// Start fetching `url` (a path or `file://` URL)
    pub fn load(url: &str) -> Self {
        let (tx, rx) = mpsc::channel();
        let url = url.to_string();

        let spawned = thread::Builder::new()
            .name("background-image".into())
            .spawn(move || {
                let _ = tx.send(fetch(&url));
            });

        match spawned {
            Ok(_) => Self::from_receiver(rx),
            Err(err) => {
                tracing::warn!("Failed to start background image fetch: {}", err);
                Self {
                    state: ImageState::Unavailable,
                }
            }
        }
    }

    /// Resolve from an externally driven fetch
    pub fn from_receiver(receiver: Receiver<Result<RgbImage>>) -> Self {
        Self {
            state: ImageState::Pending(receiver),
        }
    }

    pub fn ready(image: RgbImage) -> Self {
        Self {
            state: ImageState::Ready(image),
        }
    }

    /// The decoded image, once it has arrived
    pub fn poll(&mut self) -> Option<&RgbImage> {
        if let ImageState::Pending(receiver) = &self.state {
            match receiver.try_recv() {
                Ok(Ok(image)) => {
                    tracing::info!(
                        "Background image loaded ({}x{})",
                        image.width(),
                        image.height()
                    );
                    self.state = ImageState::Ready(image);
                }
                Ok(Err(err)) => {
                    tracing::warn!("Background image unavailable: {:#}", err);
                    self.state = ImageState::Unavailable;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    tracing::warn!("Background image fetch ended without a result");
                    self.state = ImageState::Unavailable;
                }
            }
        }

        match &self.state {
            ImageState::Ready(image) => Some(image),
            _ => None,
        }
    }
}

fn fetch(url: &str) -> Result<RgbImage> {
    let path = match url.split_once("://") {
        None => PathBuf::from(url),
        Some(("file", path)) => PathBuf::from(path),
        Some((scheme, _)) => bail!("unsupported background image scheme '{}'", scheme),
    };

    let image = image::open(&path)
        .with_context(|| format!("Failed to decode background image {}", path.display()))?;
    Ok(image.to_rgb8())
}

/// Normalized crop that makes an image cover the output aspect ratio,
/// centered on the longer axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverCrop {
    pub scale: [f32; 2],
    pub offset: [f32; 2],
}

impl CoverCrop {
    pub fn compute(image: (u32, u32), output: (u32, u32)) -> Self {
        let (image_w, image_h) = (image.0 as f32, image.1 as f32);
        let output_ratio = output.0 as f32 / output.1 as f32;

        let (mut crop_w, mut crop_h) = (image_w, image_h);
        let (mut x_offset, mut y_offset) = (0.0, 0.0);

        if image_w / image_h < output_ratio {
            crop_h = image_w / output_ratio;
            y_offset = (image_h - crop_h) / 2.0;
        } else {
            crop_w = image_h * output_ratio;
            x_offset = (image_w - crop_w) / 2.0;
        }

        Self {
            scale: [crop_w / image_w, crop_h / image_h],
            offset: [x_offset / image_w, y_offset / image_h],
        }
    }

    /// Crop `image` and scale it to exactly `width` x `height`
    pub fn apply(&self, image: &RgbImage, width: u32, height: u32) -> RgbImage {
        let (image_w, image_h) = (image.width() as f32, image.height() as f32);
        let x = (self.offset[0] * image_w).round() as u32;
        let y = (self.offset[1] * image_h).round() as u32;
        let w = ((self.scale[0] * image_w).round() as u32).clamp(1, image.width() - x);
        let h = ((self.scale[1] * image_h).round() as u32).clamp(1, image.height() - y);

        let cropped = imageops::crop_imm(image, x, y, w, h).to_image();
        imageops::resize(&cropped, width, height, imageops::FilterType::Triangle)
    }
}
