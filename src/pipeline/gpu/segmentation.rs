use super::{GpuStage, StageContext, StageOutcome};
use crate::segmentation::Preprocessor;
use anyhow::{Context, Result};

/// Runs the backend over the input region the resize stage filled.
pub(crate) struct InferenceStage;

impl GpuStage for InferenceStage {
    fn name(&self) -> &'static str {
        "inference"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
        ctx.backend
            .run_inference()
            .context("Segmentation inference failed")?;
        Ok(StageOutcome::Continue)
    }

    fn release(&mut self) {}
}

/// Uploads the backend's output region into the segmentation texture.
pub(crate) struct LoadSegmentationStage {
    bytes: Vec<u8>,
}

impl LoadSegmentationStage {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }
}

impl GpuStage for LoadSegmentationStage {
    fn name(&self) -> &'static str {
        "load segmentation"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
        Preprocessor::matte_to_bytes(ctx.backend.output_region(), &mut self.bytes);
        ctx.textures.segmentation.upload(ctx.gpu, &self.bytes, 1);
        Ok(StageOutcome::Continue)
    }

    fn release(&mut self) {
        self.bytes = Vec::new();
    }
}
