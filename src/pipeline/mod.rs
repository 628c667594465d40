//! Rendering strategies that turn a camera frame plus a person mask into the
//! output surface.

mod background;
mod composite;
mod fallback;
pub mod gpu;

pub use background::{BackgroundImage, CoverCrop};
pub use composite::{draw, CompositeOp};
pub use fallback::FallbackPipeline;
pub use gpu::AcceleratedPipeline;

use crate::config::{BackgroundConfig, EffectOptions, PipelineChoice};
use crate::error::EffectError;
use crate::segmentation::InferenceBackend;
use anyhow::Result;
use image::RgbImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Accelerated,
    Fallback,
}

/// Result of one successful `render()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// The surface holds a new frame
    Presented,
    /// The surface was left untouched (background not ready yet)
    Skipped,
}

/// A complete per-frame rendering strategy.
pub trait Pipeline {
    fn kind(&self) -> PipelineKind;

    /// Segment `frame` with `backend` and composite it onto the surface
    fn render(&mut self, frame: &RgbImage, backend: &mut dyn InferenceBackend)
        -> Result<RenderOutcome>;

    /// The output drawing surface, at source resolution
    fn surface(&self) -> &RgbImage;

    /// Release every owned resource. Idempotent.
    fn cleanup(&mut self);
}

/// Everything a pipeline needs at construction.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
    pub background: BackgroundConfig,
    pub options: EffectOptions,
}

/// Build the pipeline `config.options.pipeline` asks for
pub fn create_pipeline(config: &PipelineConfig) -> Result<Box<dyn Pipeline>, EffectError> {
    select_pipeline(
        config.options.pipeline,
        || Ok(Box::new(AcceleratedPipeline::new(config)?) as Box<dyn Pipeline>),
        || Ok(Box::new(FallbackPipeline::new(config)?) as Box<dyn Pipeline>),
    )
}

/// Pick a pipeline per `choice`; `Auto` tries `accelerated` and falls back
/// on any construction error.
pub fn select_pipeline<A, F>(
    choice: PipelineChoice,
    accelerated: A,
    fallback: F,
) -> Result<Box<dyn Pipeline>, EffectError>
where
    A: FnOnce() -> Result<Box<dyn Pipeline>>,
    F: FnOnce() -> Result<Box<dyn Pipeline>>,
{
    let construction = |kind: &str, err: anyhow::Error| {
        EffectError::Construction(format!("{} pipeline unavailable: {:#}", kind, err))
    };

    match choice {
        PipelineChoice::Accelerated => {
            accelerated().map_err(|err| construction("accelerated", err))
        }
        PipelineChoice::Fallback => fallback().map_err(|err| construction("fallback", err)),
        PipelineChoice::Auto => match accelerated() {
            Ok(pipeline) => Ok(pipeline),
            Err(err) => {
                tracing::warn!(
                    "Accelerated pipeline unavailable, using fallback: {:#}",
                    err
                );
                fallback().map_err(|fallback_err| {
                    EffectError::Construction(format!(
                        "no usable rendering context (accelerated: {:#}; fallback: {:#})",
                        err, fallback_err
                    ))
                })
            }
        },
    }
}
