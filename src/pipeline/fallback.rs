use super::background::{BackgroundImage, CoverCrop};
use super::composite::{draw, CompositeOp};
use super::{Pipeline, PipelineConfig, PipelineKind, RenderOutcome};
use crate::config::{BackgroundConfig, SegmentationDims};
use crate::segmentation::{InferenceBackend, Preprocessor};
use anyhow::{bail, ensure, Context, Result};
use image::buffer::ConvertBuffer;
use image::{imageops, Pixel, RgbImage, RgbaImage};
use std::borrow::Cow;

/// CPU compositor built from 2D drawing operators.
///
/// Per frame: downscale, infer, build a model-sized mask, then
/// `Copy` the softened mask, `SourceIn` the frame and `DestinationOver` the
/// background. The mask is upscaled with plain bilinear interpolation.
pub struct FallbackPipeline {
    width: u32,
    height: u32,
    dims: SegmentationDims,
    preprocessor: Preprocessor,
    background: Background,
    mask_blur: f32,
    background_blur: f32,
    mask: RgbaImage,
    layer: RgbaImage,
    surface: RgbImage,
    released: bool,
}

enum Background {
    Blur,
    Image {
        source: BackgroundImage,
        covered: Option<RgbaImage>,
    },
}

impl FallbackPipeline {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let dims = config.options.segmentation;
        ensure!(
            config.width > 0 && config.height > 0,
            "output surface must not be empty"
        );
        ensure!(dims.pixels() > 0, "segmentation size must not be empty");

        let background = match &config.background {
            BackgroundConfig::Blur => Background::Blur,
            BackgroundConfig::Image(url) => Background::Image {
                source: BackgroundImage::load(url),
                covered: None,
            },
        };

        tracing::info!(
            "Fallback pipeline at {}x{} (segmentation {}x{})",
            config.width,
            config.height,
            dims.width,
            dims.height
        );

        let mask_blur = config.options.mask_blur_for(&config.background);
        Ok(Self::with_background(config, background, mask_blur))
    }

    /// Build with an already-started background fetch
    pub fn with_image(config: &PipelineConfig, image: BackgroundImage) -> Self {
        Self::with_background(
            config,
            Background::Image {
                source: image,
                covered: None,
            },
            config.options.image_mask_blur,
        )
    }

    fn with_background(config: &PipelineConfig, background: Background, mask_blur: f32) -> Self {
        let dims = config.options.segmentation;
        Self {
            width: config.width,
            height: config.height,
            dims,
            preprocessor: Preprocessor::new(dims),
            mask_blur,
            background_blur: config.options.background_blur,
            background,
            mask: RgbaImage::new(dims.width, dims.height),
            layer: RgbaImage::new(config.width, config.height),
            surface: RgbImage::new(config.width, config.height),
            released: false,
        }
    }

    /// Model-sized mask image, rebuilt in place every frame
    pub fn mask(&self) -> &RgbaImage {
        &self.mask
    }
}

impl Background {
    /// Background layer for this frame, `None` while the image is pending.
    /// The covered image is built once and lent out afterwards.
    fn layer(
        &mut self,
        frame: &RgbaImage,
        size: (u32, u32),
        blur: f32,
    ) -> Option<Cow<'_, RgbaImage>> {
        match self {
            Background::Blur => Some(Cow::Owned(post_filter_blur(frame, blur))),
            Background::Image { source, covered } => {
                if covered.is_none() {
                    let image = source.poll()?;
                    let crop = CoverCrop::compute(image.dimensions(), size);
                    *covered = Some(crop.apply(image, size.0, size.1).convert());
                }
                covered.as_ref().map(Cow::Borrowed)
            }
        }
    }
}

impl Pipeline for FallbackPipeline {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Fallback
    }

    fn render(
        &mut self,
        frame: &RgbImage,
        backend: &mut dyn InferenceBackend,
    ) -> Result<RenderOutcome> {
        if self.released {
            bail!("fallback pipeline used after cleanup");
        }
        ensure!(
            frame.dimensions() == (self.width, self.height),
            "frame is {}x{}, surface is {}x{}",
            frame.width(),
            frame.height(),
            self.width,
            self.height
        );
        ensure!(
            backend.dims() == self.dims,
            "backend runs at {}x{}, pipeline expects {}x{}",
            backend.dims().width,
            backend.dims().height,
            self.dims.width,
            self.dims.height
        );

        let _span = tracing::debug_span!("fallback_render").entered();

        self.preprocessor
            .write_input(frame, backend.input_region_mut())?;
        backend
            .run_inference()
            .context("Segmentation inference failed")?;
        Preprocessor::matte_to_mask(backend.output_region(), &mut self.mask);

        let frame_rgba: RgbaImage = frame.convert();
        let size = (self.width, self.height);
        let layer = self.background.layer(&frame_rgba, size, self.background_blur);
        let Some(background) = layer else {
            tracing::trace!("Background image not ready, skipping frame");
            return Ok(RenderOutcome::Skipped);
        };

        let upscaled = imageops::resize(
            &self.mask,
            self.width,
            self.height,
            imageops::FilterType::Triangle,
        );
        draw(
            &mut self.layer,
            &post_filter_blur(&upscaled, self.mask_blur),
            CompositeOp::Copy,
        );
        draw(&mut self.layer, &frame_rgba, CompositeOp::SourceIn);
        draw(&mut self.layer, &background, CompositeOp::DestinationOver);

        for (out, pixel) in self.surface.pixels_mut().zip(self.layer.pixels()) {
            *out = pixel.to_rgb();
        }

        Ok(RenderOutcome::Presented)
    }

    fn surface(&self) -> &RgbImage {
        &self.surface
    }

    fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.mask = RgbaImage::new(0, 0);
        self.layer = RgbaImage::new(0, 0);
        self.surface = RgbImage::new(0, 0);
        if let Background::Image { covered, .. } = &mut self.background {
            *covered = None;
        }
        tracing::debug!("Fallback pipeline released");
    }
}

/// Gaussian post-filter. Large radii run on a reduced copy.
fn post_filter_blur(image: &RgbaImage, sigma: f32) -> RgbaImage {
    if sigma <= 0.0 {
        return image.clone();
    }

    let factor = (sigma / 4.0).floor().clamp(1.0, 4.0) as u32;
    if factor == 1 {
        return imageops::blur(image, sigma);
    }

    let (width, height) = image.dimensions();
    let small = imageops::resize(
        image,
        (width / factor).max(1),
        (height / factor).max(1),
        imageops::FilterType::Triangle,
    );
    let blurred = imageops::blur(&small, sigma / factor as f32);
    imageops::resize(&blurred, width, height, imageops::FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EffectOptions;
    use crate::error::BackendError;
    use crate::segmentation::{BackendMemory, Matte};
    use image::Rgb;
    use std::sync::mpsc;

    /// Bright pixels are the person
    struct LumaBackend {
        memory: BackendMemory,
        runs: usize,
    }

    impl LumaBackend {
        fn new(dims: SegmentationDims) -> Self {
            Self {
                memory: BackendMemory::new(dims),
                runs: 0,
            }
        }
    }

    impl InferenceBackend for LumaBackend {
        fn load(&mut self, _model: &[u8]) -> Result<(), BackendError> {
            Ok(())
        }

        fn run_inference(&mut self) -> Result<(), BackendError> {
            self.runs += 1;
            let (input, output) = self.memory.split_mut();
            for (value, rgb) in output.iter_mut().zip(input.chunks_exact(3)) {
                *value = if (rgb[0] + rgb[1] + rgb[2]) / 3.0 > 0.5 { 1.0 } else { 0.0 };
            }
            Ok(())
        }

        fn dims(&self) -> SegmentationDims {
            self.memory.dims()
        }

        fn input_region(&self) -> &[f32] {
            self.memory.input()
        }

        fn input_region_mut(&mut self) -> &mut [f32] {
            self.memory.input_mut()
        }

        fn output_region(&self) -> &Matte {
            self.memory.output()
        }
    }

    fn config(width: u32, height: u32, background: BackgroundConfig) -> PipelineConfig {
        let mut options = EffectOptions::default();
        options.segmentation = SegmentationDims::new(32, 18);
        PipelineConfig {
            width,
            height,
            background,
            options,
        }
    }

    /// White square on a striped background
    fn frame(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let inside =
                x >= width / 4 && x < width * 3 / 4 && y >= height / 4 && y < height * 3 / 4;
            if inside {
                Rgb([255, 255, 255])
            } else if x % 2 == 0 {
                Rgb([0, 0, 200])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    #[test]
    fn blur_background_keeps_person_sharp() {
        let config = config(128, 72, BackgroundConfig::Blur);
        let mut pipeline = FallbackPipeline::new(&config).unwrap();
        let mut backend = LumaBackend::new(config.options.segmentation);
        let frame = frame(128, 72);

        let outcome = pipeline.render(&frame, &mut backend).unwrap();

        assert_eq!(outcome, RenderOutcome::Presented);
        assert_eq!(pipeline.surface().dimensions(), (128, 72));
        let center = pipeline.surface().get_pixel(64, 36);
        assert!(center.0.iter().all(|&c| c >= 240), "center {:?}", center);

        // Stripes in the corner are smeared by the blur
        let corner = pipeline.surface().get_pixel(1, 1);
        assert!(corner[2] > 20 && corner[2] < 180, "corner {:?}", corner);
    }

    #[test]
    fn mask_size_is_independent_of_source_resolution() {
        for (width, height) in [(64, 36), (320, 180)] {
            let config = config(width, height, BackgroundConfig::Blur);
            let mut pipeline = FallbackPipeline::new(&config).unwrap();
            let mut backend = LumaBackend::new(config.options.segmentation);

            pipeline.render(&frame(width, height), &mut backend).unwrap();

            assert_eq!(pipeline.mask().dimensions(), (32, 18));
            assert_eq!(backend.output_region().len(), 32 * 18);
        }
    }

    #[test]
    fn pending_image_skips_without_touching_surface() {
        let config = config(64, 36, BackgroundConfig::Image("pending".into()));
        let (_tx, rx) = mpsc::channel();
        let mut pipeline =
            FallbackPipeline::with_image(&config, BackgroundImage::from_receiver(rx));
        let mut backend = LumaBackend::new(config.options.segmentation);

        let outcome = pipeline.render(&frame(64, 36), &mut backend).unwrap();

        assert_eq!(outcome, RenderOutcome::Skipped);
        assert!(pipeline.surface().pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn image_background_replaces_pixels_behind_person() {
        let config = config(64, 36, BackgroundConfig::Image("green".into()));
        let green = RgbImage::from_pixel(100, 100, Rgb([0, 255, 0]));
        let mut pipeline = FallbackPipeline::with_image(&config, BackgroundImage::ready(green));
        let mut backend = LumaBackend::new(config.options.segmentation);

        let outcome = pipeline.render(&frame(64, 36), &mut backend).unwrap();

        assert_eq!(outcome, RenderOutcome::Presented);
        assert_eq!(pipeline.surface().get_pixel(0, 0).0, [0, 255, 0]);
        let person = pipeline.surface().get_pixel(32, 18);
        assert!(person.0.iter().all(|&c| c >= 240), "person {:?}", person);
    }

    #[test]
    fn image_pipeline_softens_mask_for_image_backgrounds() {
        let config = config(64, 36, BackgroundConfig::Blur);
        let green = RgbImage::from_pixel(10, 10, Rgb([0, 255, 0]));
        let pipeline = FallbackPipeline::with_image(&config, BackgroundImage::ready(green));

        assert_eq!(pipeline.mask_blur, config.options.image_mask_blur);
        assert_eq!(FallbackPipeline::new(&config).unwrap().mask_blur, config.options.mask_blur);
    }

    #[test]
    fn covered_image_is_built_once_and_reused() {
        let config = config(64, 36, BackgroundConfig::Image("green".into()));
        let green = RgbImage::from_pixel(100, 100, Rgb([0, 255, 0]));
        let mut pipeline = FallbackPipeline::with_image(&config, BackgroundImage::ready(green));
        let mut backend = LumaBackend::new(config.options.segmentation);

        pipeline.render(&frame(64, 36), &mut backend).unwrap();
        let first = match &pipeline.background {
            Background::Image {
                covered: Some(covered),
                ..
            } => covered.as_raw().as_ptr(),
            _ => panic!("covered image missing after first frame"),
        };

        let outcome = pipeline.render(&frame(64, 36), &mut backend).unwrap();

        assert_eq!(outcome, RenderOutcome::Presented);
        assert_eq!(pipeline.surface().get_pixel(0, 0).0, [0, 255, 0]);
        let Background::Image {
            covered: Some(covered),
            ..
        } = &pipeline.background
        else {
            panic!("covered image dropped after second frame");
        };
        assert_eq!(covered.as_raw().as_ptr(), first);
    }

    #[test]
    fn cleanup_is_idempotent_and_final() {
        let config = config(64, 36, BackgroundConfig::Blur);
        let mut pipeline = FallbackPipeline::new(&config).unwrap();
        let mut backend = LumaBackend::new(config.options.segmentation);

        pipeline.cleanup();
        pipeline.cleanup();

        assert!(pipeline.render(&frame(64, 36), &mut backend).is_err());
        assert_eq!(backend.runs, 0);
    }

    #[test]
    fn mismatched_backend_is_rejected() {
        let config = config(64, 36, BackgroundConfig::Blur);
        let mut pipeline = FallbackPipeline::new(&config).unwrap();
        let mut backend = LumaBackend::new(SegmentationDims::new(16, 16));
        assert!(pipeline.render(&frame(64, 36), &mut backend).is_err());
    }
}
