use super::memory::BackendMemory;
use super::types::{BackendVariant, InferenceBackend, Matte};
use crate::config::SegmentationDims;
use crate::error::BackendError;
use ndarray::ArrayView4;
use ort::execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;

/// Person segmentation through ONNX Runtime
///
/// Expects an NHWC float input of `[1, height, width, 3]` and produces
/// either one sigmoid probability per pixel (`[1, height, width, 1]`) or
/// background/person logits (`[1, height, width, 2]`).
pub struct OnnxBackend {
    variant: BackendVariant,
    model: Vec<u8>,
    session: Option<Session>,
    memory: BackendMemory,
}

impl OnnxBackend {
    pub fn new(variant: BackendVariant, dims: SegmentationDims) -> Self {
        Self {
            variant,
            model: Vec::new(),
            session: None,
            memory: BackendMemory::new(dims),
        }
    }

    pub fn variant(&self) -> BackendVariant {
        self.variant
    }

    fn build_session(&self) -> Result<Session, BackendError> {
        let builder = Session::builder().map_err(init)?;
        let builder = match self.variant {
            BackendVariant::Accelerated => builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default().build(),
                    CUDAExecutionProvider::default().build(),
                ])
                .map_err(init)?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(init)?
                .with_intra_threads(4)
                .map_err(init)?,
            BackendVariant::Plain => builder
                .with_optimization_level(GraphOptimizationLevel::Level1)
                .map_err(init)?
                .with_intra_threads(1)
                .map_err(init)?,
        };

        builder.commit_from_memory(&self.model).map_err(init)
    }
}

impl InferenceBackend for OnnxBackend {
    fn load(&mut self, model: &[u8]) -> Result<(), BackendError> {
        tracing::info!(
            "Loading {:?} segmentation backend ({} bytes)",
            self.variant,
            model.len()
        );

        self.model.clear();
        self.model.extend_from_slice(model);

        let session = self.build_session()?;
        tracing::debug!(
            "Model inputs: {:?}",
            session.inputs.iter().map(|input| input.name.as_str()).collect::<Vec<_>>()
        );
        self.session = Some(session);
        Ok(())
    }

    fn run_inference(&mut self) -> Result<(), BackendError> {
        let _span = tracing::debug_span!("inference").entered();

        let session = self.session.as_mut().ok_or(BackendError::NotLoaded)?;
        let dims = self.memory.dims();
        let (input, output) = self.memory.split_mut();

        let view = ArrayView4::from_shape(
            (1, dims.height as usize, dims.width as usize, 3),
            input,
        )
        .map_err(|err| BackendError::Inference(err.to_string()))?;

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(view)?])?;
        let (_shape, data) = outputs[0].try_extract_tensor::<f32>()?;

        write_probabilities(data, output)
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

fn init(err: impl std::fmt::Display) -> BackendError {
    BackendError::Init(err.to_string())
}

/// Convert raw model output into one person probability per pixel
fn write_probabilities(data: &[f32], output: &mut [f32]) -> Result<(), BackendError> {
    let expected = output.len();

    if data.len() == expected {
        output.copy_from_slice(data);
    } else if data.len() == expected * 2 {
        // Two-class softmax, channel 1 is the person
        for (value, logits) in output.iter_mut().zip(data.chunks_exact(2)) {
            *value = 1.0 / (1.0 + (logits[0] - logits[1]).exp());
        }
    } else {
        return Err(BackendError::OutputShape {
            expected,
            actual: data.len(),
        });
    }

    Ok(())
}
