use crate::config::SegmentationDims;
use crate::error::BackendError;

/// Person probability: 0.0 = background, 1.0 = foreground.
/// One value per segmentation pixel, row-major.
pub type Matte = [f32];

/// Trait for segmentation backends
///
/// A backend owns two fixed regions: the input (interleaved RGB in [0, 1])
/// and the output (one probability per pixel). Pipelines write the input,
/// call [`run_inference`](Self::run_inference), and read the output.
pub trait InferenceBackend: Send {
    /// Copy `model` into the backend and parse it
    fn load(&mut self, model: &[u8]) -> Result<(), BackendError>;

    /// Run the model over the whole input region, filling the output region
    fn run_inference(&mut self) -> Result<(), BackendError>;

    /// Model resolution; regions never change size
    fn dims(&self) -> SegmentationDims;

    fn input_region(&self) -> &[f32];

    fn input_region_mut(&mut self) -> &mut [f32];

    fn output_region(&self) -> &Matte;
}

/// Which runtime configuration a load attempt uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendVariant {
    /// Hardware execution providers, full graph optimization
    Accelerated,
    /// CPU only
    Plain,
}

impl BackendVariant {
    /// Attempt order when loading
    pub const ATTEMPTS: [BackendVariant; 2] = [BackendVariant::Accelerated, BackendVariant::Plain];
}
