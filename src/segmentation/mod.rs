mod memory;
mod onnx;
mod preprocess;
pub mod types;

pub use memory::BackendMemory;
pub use onnx::OnnxBackend;
pub use preprocess::Preprocessor;
pub use types::{BackendVariant, InferenceBackend, Matte};

use crate::config::SegmentationDims;
use crate::error::{BackendError, EffectError};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Load the ONNX segmentation backend, accelerated variant first
pub fn load_onnx_backend(
    model: &[u8],
    dims: SegmentationDims,
    timeout: Duration,
) -> Result<Box<dyn InferenceBackend>, EffectError> {
    load_backend(model, timeout, |variant| {
        Box::new(OnnxBackend::new(variant, dims)) as Box<dyn InferenceBackend>
    })
}

/// Try each [`BackendVariant`] in order, giving every attempt `timeout`
/// to load `model`. An attempt that times out is abandoned on its thread.
pub fn load_backend<F>(
    model: &[u8],
    timeout: Duration,
    mut create: F,
) -> Result<Box<dyn InferenceBackend>, EffectError>
where
    F: FnMut(BackendVariant) -> Box<dyn InferenceBackend>,
{
    let model: Arc<[u8]> = Arc::from(model);
    let mut failures = Vec::new();

    for variant in BackendVariant::ATTEMPTS {
        let mut backend = create(variant);
        let bytes = Arc::clone(&model);
        let (tx, rx) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name(format!("backend-load-{:?}", variant).to_lowercase())
            .spawn(move || {
                let result = backend.load(&bytes).map(|()| backend);
                let _ = tx.send(result);
            });

        if let Err(err) = spawned {
            failures.push(format!("{:?}: {}", variant, err));
            continue;
        }

        match rx.recv_timeout(timeout) {
            Ok(Ok(backend)) => {
                tracing::info!("Segmentation backend ready ({:?})", variant);
                return Ok(backend);
            }
            Ok(Err(err)) => {
                tracing::warn!("{:?} backend failed to load: {}", variant, err);
                failures.push(format!("{:?}: {}", variant, err));
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("{:?} backend timed out after {:?}", variant, timeout);
                failures.push(format!("{:?}: timed out", variant));
            }
            Err(RecvTimeoutError::Disconnected) => {
                let err = BackendError::Init("loader thread exited".into());
                failures.push(format!("{:?}: {}", variant, err));
            }
        }
    }

    Err(EffectError::NotSupported(format!(
        "no segmentation backend could be created ({})",
        failures.join("; ")
    )))
}
