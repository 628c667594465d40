//! Real-time background blur and replacement for camera streams.
//!
//! An [`EffectTrackController`] pulls frames from an [`InputTrack`], runs a
//! person segmentation model through an [`InferenceBackend`], composites the
//! result on the GPU (or on the CPU when no adapter is usable) and feeds an
//! [`OutputTrack`].

pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod scheduler;
pub mod segmentation;
pub mod track;

pub use config::{BackgroundConfig, BlendMode, EffectOptions, PipelineChoice, SegmentationDims};
pub use controller::EffectTrackController;
pub use error::{BackendError, EffectError};
pub use segmentation::InferenceBackend;
pub use track::{InputTrack, OutputTrack, ReadyState, VideoSettings};
