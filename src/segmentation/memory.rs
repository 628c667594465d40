use crate::config::SegmentationDims;

/// Linear float heap shared between pipelines and a backend.
///
/// Laid out as `[input | output]`. Offsets are fixed at construction.
#[derive(Debug, Clone)]
pub struct BackendMemory {
    heap: Vec<f32>,
    input_offset: usize,
    output_offset: usize,
    dims: SegmentationDims,
}

impl BackendMemory {
    pub fn new(dims: SegmentationDims) -> Self {
        let input_len = dims.input_len();
        let output_len = dims.pixels();

        tracing::debug!(
            "Allocating backend memory for {}x{} ({} input, {} output floats)",
            dims.width,
            dims.height,
            input_len,
            output_len
        );

        Self {
            heap: vec![0.0; input_len + output_len],
            input_offset: 0,
            output_offset: input_len,
            dims,
        }
    }

    pub fn dims(&self) -> SegmentationDims {
        self.dims
    }

    pub fn input(&self) -> &[f32] {
        &self.heap[self.input_offset..self.output_offset]
    }

    pub fn input_mut(&mut self) -> &mut [f32] {
        &mut self.heap[self.input_offset..self.output_offset]
    }

    pub fn output(&self) -> &[f32] {
        &self.heap[self.output_offset..]
    }

    pub fn output_mut(&mut self) -> &mut [f32] {
        &mut self.heap[self.output_offset..]
    }

    /// Read the input while writing the output
    pub fn split_mut(&mut self) -> (&[f32], &mut [f32]) {
        let (input, output) = self.heap.split_at_mut(self.output_offset);
        (&input[self.input_offset..], output)
    }
}
