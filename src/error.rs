use thiserror::Error;

/// Errors surfaced by the background effect to its caller.
#[derive(Debug, Clone, Error)]
pub enum EffectError {
    /// The platform cannot run the effect at all (no track introspection,
    /// or no segmentation backend could be created).
    #[error("background effect not supported: {0}")]
    NotSupported(String),

    /// The controller could not be built; nothing was started.
    #[error("failed to construct background effect: {0}")]
    Construction(String),

    /// A frame failed to render. The controller stops after this.
    #[error("render failed: {0}")]
    Render(String),
}

/// Errors raised by an inference backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend initialization failed: {0}")]
    Init(String),

    #[error("model is not loaded")]
    NotLoaded,

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("model produced {actual} output values, expected {expected} or {}", expected * 2)]
    OutputShape { expected: usize, actual: usize },
}

impl From<ort::Error> for BackendError {
    fn from(err: ort::Error) -> Self {
        BackendError::Inference(err.to_string())
    }
}
