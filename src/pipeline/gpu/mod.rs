//! GPU pipeline: a fixed chain of full-screen passes on wgpu.
//!
//! resize -> inference -> load segmentation -> joint bilateral filter ->
//! background (blur or image). The output texture is read back into the
//! surface once every stage has run.

mod bilateral;
mod blur;
mod context;
mod image_background;
mod resize;
mod segmentation;

pub use bilateral::BilateralParams;

use self::bilateral::JointBilateralFilterStage;
use self::blur::BackgroundBlurStage;
use self::context::{FencePoller, FrameTextures, GpuContext, Readback};
use self::image_background::BackgroundImageStage;
use self::resize::ResizeStage;
use self::segmentation::{InferenceStage, LoadSegmentationStage};
use super::{BackgroundImage, Pipeline, PipelineConfig, PipelineKind, RenderOutcome};
use crate::config::{BackgroundConfig, SegmentationDims};
use crate::segmentation::InferenceBackend;
use anyhow::{bail, ensure, Context, Result};
use image::RgbImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageOutcome {
    Continue,
    /// Stop here and leave the surface as it is
    Skip,
}

/// Per-frame state handed to every stage.
pub(crate) struct StageContext<'a> {
    pub gpu: &'a GpuContext,
    pub textures: &'a FrameTextures,
    pub fence: &'a mut FencePoller,
    pub frame: &'a RgbImage,
    pub backend: &'a mut dyn InferenceBackend,
}

pub(crate) trait GpuStage {
    fn name(&self) -> &'static str;

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<StageOutcome>;

    /// Free the stage's own GPU objects
    fn release(&mut self);
}

pub struct AcceleratedPipeline {
    gpu: GpuContext,
    textures: FrameTextures,
    stages: Vec<Box<dyn GpuStage>>,
    readback: Readback,
    fence: FencePoller,
    surface: RgbImage,
    width: u32,
    height: u32,
    dims: SegmentationDims,
    released: bool,
}

impl AcceleratedPipeline {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let background = match &config.background {
            BackgroundConfig::Blur => None,
            BackgroundConfig::Image(url) => Some(BackgroundImage::load(url)),
        };
        Self::build(config, background)
    }

    /// Build with an already-started background fetch
    pub fn with_image(config: &PipelineConfig, image: BackgroundImage) -> Result<Self> {
        Self::build(config, Some(image))
    }

    fn build(config: &PipelineConfig, background: Option<BackgroundImage>) -> Result<Self> {
        let (width, height) = (config.width, config.height);
        let dims = config.options.segmentation;
        ensure!(width > 0 && height > 0, "output surface must not be empty");
        ensure!(dims.pixels() > 0, "segmentation size must not be empty");

        let gpu = GpuContext::new()?;
        let fence = FencePoller::new()?;

        gpu.push_validation_scope();
        let textures = FrameTextures::new(&gpu, width, height, dims);
        let readback = Readback::new(&gpu, "output readback", width, height, 4);

        let options = &config.options;
        let params = BilateralParams::derive(
            (width, height),
            dims,
            options.sigma_space,
            options.sigma_color,
        );
        let mut stages: Vec<Box<dyn GpuStage>> = vec![
            Box::new(ResizeStage::new(&gpu, &textures, dims)),
            Box::new(InferenceStage),
            Box::new(LoadSegmentationStage::new()),
            Box::new(JointBilateralFilterStage::new(&gpu, &textures, params)),
        ];
        let background_stage: Box<dyn GpuStage> = match background {
            None => Box::new(BackgroundBlurStage::new(&gpu, &textures, options.coverage)),
            Some(image) => Box::new(BackgroundImageStage::new(&gpu, image, options)),
        };
        stages.push(background_stage);
        gpu.pop_validation_scope()
            .context("GPU pipeline construction failed")?;

        tracing::info!(
            "Accelerated pipeline at {}x{} (segmentation {}x{}, {} stages)",
            width,
            height,
            dims.width,
            dims.height,
            stages.len()
        );

        Ok(Self {
            gpu,
            textures,
            stages,
            readback,
            fence,
            surface: RgbImage::new(width, height),
            width,
            height,
            dims,
            released: false,
        })
    }

    fn run_stages(
        &mut self,
        frame: &RgbImage,
        backend: &mut dyn InferenceBackend,
    ) -> Result<RenderOutcome> {
        let mut ctx = StageContext {
            gpu: &self.gpu,
            textures: &self.textures,
            fence: &mut self.fence,
            frame,
            backend,
        };

        for stage in self.stages.iter_mut() {
            let outcome = stage
                .run(&mut ctx)
                .with_context(|| format!("{} stage failed", stage.name()))?;
            if outcome == StageOutcome::Skip {
                tracing::trace!("{} stage skipped the frame", stage.name());
                return Ok(RenderOutcome::Skipped);
            }
        }

        let mut encoder = self.gpu.encoder("output readback");
        self.readback.copy_from(&mut encoder, &self.textures.output.texture);
        self.gpu.submit(encoder);

        let row_len = self.width as usize * 3;
        let surface: &mut [u8] = &mut self.surface;
        self.readback.read_rows(&self.gpu, ctx.fence, |y, rgba| {
            let dst = &mut surface[y * row_len..(y + 1) * row_len];
            for (pixel, texel) in dst.chunks_exact_mut(3).zip(rgba.chunks_exact(4)) {
                pixel.copy_from_slice(&texel[..3]);
            }
        })?;

        Ok(RenderOutcome::Presented)
    }
}

impl Pipeline for AcceleratedPipeline {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Accelerated
    }

    fn render(
        &mut self,
        frame: &RgbImage,
        backend: &mut dyn InferenceBackend,
    ) -> Result<RenderOutcome> {
        if self.released {
            bail!("accelerated pipeline used after cleanup");
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

        let _span = tracing::debug_span!("gpu_render").entered();

        self.gpu.push_validation_scope();
        let result = self.run_stages(frame, backend);
        let validation = self.gpu.pop_validation_scope();

        let outcome = result?;
        validation?;
        Ok(outcome)
    }

    fn surface(&self) -> &RgbImage {
        &self.surface
    }

    fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        for stage in self.stages.iter_mut().rev() {
            stage.release();
        }
        self.stages.clear();
        self.readback.destroy();
        self.textures.destroy();
        self.fence.close();
        self.surface = RgbImage::new(0, 0);

        tracing::debug!("Accelerated pipeline released");
    }
}

impl Drop for AcceleratedPipeline {
    fn drop(&mut self) {
        self.cleanup();
    }
}
