//! Effect configuration shared by the controller and both pipelines.

use std::time::Duration;

/// Number of colour channels the segmentation model consumes.
pub const INPUT_CHANNELS: usize = 3;

/// Resolution the segmentation model runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentationDims {
    pub width: u32,
    pub height: u32,
}

impl SegmentationDims {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of mask pixels
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Length of the model input region in floats
    pub fn input_len(&self) -> usize {
        self.pixels() * INPUT_CHANNELS
    }
}

impl Default for SegmentationDims {
    /// Landscape selfie segmentation resolution
    fn default() -> Self {
        Self::new(256, 144)
    }
}

/// What goes behind the person.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundConfig {
    Blur,
    /// Still image, given as a filesystem path or `file://` URL
    Image(String),
}

/// How light from the background image bleeds over the person's edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Screen,
    LinearDodge,
}

impl BlendMode {
    /// Shader-side selector: 1.0 picks linear dodge, 0.0 picks screen
    pub fn weight(self) -> f32 {
        match self {
            BlendMode::Screen => 0.0,
            BlendMode::LinearDodge => 1.0,
        }
    }
}

/// Which rendering strategy the controller may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineChoice {
    /// Accelerated first, CPU fallback on any construction error
    #[default]
    Auto,
    Accelerated,
    Fallback,
}

/// Tunables for one background effect instance.
#[derive(Debug, Clone)]
pub struct EffectOptions {
    pub segmentation: SegmentationDims,
    pub pipeline: PipelineChoice,
    /// Overrides the input track's frame rate as the loop target
    pub target_fps: Option<f32>,
    /// Mask values mapped through `smoothstep(low, high, mask)`
    pub coverage: (f32, f32),
    /// Spatial sigma of the bilateral filter, in segmentation pixels
    pub sigma_space: f32,
    pub sigma_color: f32,
    pub light_wrapping: f32,
    pub blend_mode: BlendMode,
    /// Background blur of the CPU path, in output pixels
    pub background_blur: f32,
    /// Mask edge softening of the CPU path for blurred backgrounds
    pub mask_blur: f32,
    /// Mask edge softening of the CPU path for image backgrounds
    pub image_mask_blur: f32,
    /// Upper bound for each backend load attempt
    pub backend_timeout: Duration,
}

impl Default for EffectOptions {
    fn default() -> Self {
        Self {
            segmentation: SegmentationDims::default(),
            pipeline: PipelineChoice::Auto,
            target_fps: None,
            coverage: (0.5, 0.75),
            sigma_space: 1.0,
            sigma_color: 0.1,
            light_wrapping: 0.3,
            blend_mode: BlendMode::Screen,
            background_blur: 25.0,
            mask_blur: 8.0,
            image_mask_blur: 4.0,
            backend_timeout: Duration::from_millis(1000),
        }
    }
}

impl EffectOptions {
    /// Mask softening for the given background on the CPU path
    pub fn mask_blur_for(&self, background: &BackgroundConfig) -> f32 {
        match background {
            BackgroundConfig::Blur => self.mask_blur,
            BackgroundConfig::Image(_) => self.image_mask_blur,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dims_match_landscape_model() {
        let dims = SegmentationDims::default();
        assert_eq!(dims.pixels(), 256 * 144);
        assert_eq!(dims.input_len(), 256 * 144 * 3);
    }

    #[test]
    fn image_backgrounds_soften_less() {
        let options = EffectOptions::default();
        let image = BackgroundConfig::Image("bg.png".into());
        assert!(options.mask_blur_for(&image) < options.mask_blur_for(&BackgroundConfig::Blur));
    }
}
