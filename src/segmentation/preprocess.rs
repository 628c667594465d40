use crate::config::{SegmentationDims, INPUT_CHANNELS};
use anyhow::{ensure, Result};
use image::{imageops, RgbImage, RgbaImage};

/// Moves pixels in and out of a backend's fixed regions.
pub struct Preprocessor {
    dims: SegmentationDims,
}

impl Preprocessor {
    pub fn new(dims: SegmentationDims) -> Self {
        Self { dims }
    }

    /// Downscale `frame` to model resolution and write it into the input
    /// region as interleaved RGB floats in [0, 1].
    pub fn write_input(&self, frame: &RgbImage, region: &mut [f32]) -> Result<()> {
        let _span = tracing::debug_span!("preprocess").entered();

        ensure!(
            region.len() == self.dims.input_len(),
            "input region holds {} floats, expected {}",
            region.len(),
            self.dims.input_len()
        );

        let resized;
        let source = if frame.dimensions() != (self.dims.width, self.dims.height) {
            resized = imageops::resize(
                frame,
                self.dims.width,
                self.dims.height,
                imageops::FilterType::Triangle,
            );
            &resized
        } else {
            frame
        };

        for (value, &byte) in region.iter_mut().zip(source.as_raw().iter()) {
            *value = byte as f32 / 255.0;
        }

        Ok(())
    }

    /// Write one RGBA row read back from the device into the input region
    pub fn write_rgba_row(&self, row: usize, rgba: &[u8], region: &mut [f32]) {
        let width = self.dims.width as usize;
        let start = row * width * INPUT_CHANNELS;
        let dst = &mut region[start..start + width * INPUT_CHANNELS];

        for (pixel, texel) in dst.chunks_exact_mut(INPUT_CHANNELS).zip(rgba.chunks_exact(4)) {
            pixel[0] = texel[0] as f32 / 255.0;
            pixel[1] = texel[1] as f32 / 255.0;
            pixel[2] = texel[2] as f32 / 255.0;
        }
    }

    /// Write the matte into the alpha channel of a model-sized mask image
    pub fn matte_to_mask(matte: &[f32], mask: &mut RgbaImage) {
        for (pixel, &value) in mask.pixels_mut().zip(matte.iter()) {
            pixel.0 = [0, 0, 0, to_byte(value)];
        }
    }

    /// Quantize the matte for a single-channel texture upload
    pub fn matte_to_bytes(matte: &[f32], bytes: &mut Vec<u8>) {
        bytes.clear();
        bytes.extend(matte.iter().map(|&value| to_byte(value)));
    }
}

fn to_byte(value: f32) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}
