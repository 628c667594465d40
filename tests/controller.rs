use anyhow::{anyhow, Result};
use backdrop_fx::capture::{CaptureSource, SyntheticCapture, TrackSettings};
use backdrop_fx::output::OutputSink;
use backdrop_fx::pipeline::{
    select_pipeline, FallbackPipeline, Pipeline, PipelineConfig, PipelineKind,
};
use backdrop_fx::segmentation::{BackendMemory, Matte};
use backdrop_fx::{
    BackendError, BackgroundConfig, EffectError, EffectOptions, EffectTrackController,
    InferenceBackend, InputTrack, PipelineChoice, ReadyState, SegmentationDims,
};
use image::RgbImage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Bright input pixels are the person. Optionally fails on the n-th run.
struct StubBackend {
    memory: BackendMemory,
    runs: Arc<AtomicUsize>,
    fail_on: Option<usize>,
}

impl StubBackend {
    fn new(dims: SegmentationDims) -> Self {
        Self {
            memory: BackendMemory::new(dims),
            runs: Arc::new(AtomicUsize::new(0)),
            fail_on: None,
        }
    }

    fn failing_on(dims: SegmentationDims, run: usize) -> Self {
        Self {
            fail_on: Some(run),
            ..Self::new(dims)
        }
    }
}

impl InferenceBackend for StubBackend {
    fn load(&mut self, _model: &[u8]) -> Result<(), BackendError> {
        Ok(())
    }

    fn run_inference(&mut self) -> Result<(), BackendError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on == Some(run) {
            return Err(BackendError::Inference(format!("run {} failed", run)));
        }

        let (input, output) = self.memory.split_mut();
        for (value, rgb) in output.iter_mut().zip(input.chunks_exact(3)) {
            *value = if (rgb[0] + rgb[1] + rgb[2]) / 3.0 > 0.5 { 1.0 } else { 0.0 };
        }
        Ok(())
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

#[derive(Default)]
struct SinkLog {
    frames: Vec<(u32, u32)>,
    closed: bool,
}

struct RecordingSink {
    log: Arc<Mutex<SinkLog>>,
    resolution: (u32, u32),
}

impl RecordingSink {
    fn new(width: u32, height: u32) -> (Self, Arc<Mutex<SinkLog>>) {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let sink = Self {
            log: Arc::clone(&log),
            resolution: (width, height),
        };
        (sink, log)
    }
}

impl OutputSink for RecordingSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        self.log.lock().unwrap().frames.push(frame.dimensions());
        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn close(&mut self) -> Result<()> {
        self.log.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Capture that reports fixed settings
struct ReportingCapture {
    settings: Option<TrackSettings>,
}

impl CaptureSource for ReportingCapture {
    fn capture_frame(&mut self) -> Result<RgbImage> {
        Err(anyhow!("no frames"))
    }

    fn settings(&self) -> Option<TrackSettings> {
        self.settings
    }
}

fn options(dims: SegmentationDims) -> EffectOptions {
    EffectOptions {
        segmentation: dims,
        pipeline: PipelineChoice::Fallback,
        ..EffectOptions::default()
    }
}

fn small_controller(
    backend: StubBackend,
    background: BackgroundConfig,
) -> (EffectTrackController, Arc<Mutex<SinkLog>>) {
    let dims = SegmentationDims::new(32, 18);
    let input = InputTrack::new(Box::new(SyntheticCapture::new(320, 180, 30.0)));
    let (sink, log) = RecordingSink::new(320, 180);
    let controller = EffectTrackController::new(
        Box::new(backend),
        input,
        Box::new(sink),
        background,
        options(dims),
    )
    .unwrap();
    (controller, log)
}

#[test]
fn blur_effect_mirrors_input_settings() {
    let dims = SegmentationDims::new(256, 144);
    let input = InputTrack::new(Box::new(SyntheticCapture::new(1280, 720, 30.0)));
    let (sink, log) = RecordingSink::new(1280, 720);

    let mut controller = EffectTrackController::new(
        Box::new(StubBackend::new(dims)),
        input,
        Box::new(sink),
        BackgroundConfig::Blur,
        options(dims),
    )
    .unwrap();

    let settings = controller.output_track().settings();
    assert_eq!((settings.width, settings.height), (1280, 720));
    assert_eq!(settings.frame_rate, 30.0);
    assert_eq!(controller.output_track().ready_state(), ReadyState::Live);
    assert_eq!(controller.pipeline_kind(), PipelineKind::Fallback);

    assert!(controller.pump());
    assert_eq!(controller.frames_rendered(), 1);
    assert_eq!(log.lock().unwrap().frames, vec![(1280, 720)]);

    controller.stop();

    assert_eq!(controller.input_track().ready_state(), ReadyState::Ended);
    assert_eq!(controller.output_track().ready_state(), ReadyState::Ended);
    assert!(log.lock().unwrap().closed);
    assert!(controller.failure().is_none());
}

#[test]
fn unresolved_background_image_writes_nothing() {
    let backend = StubBackend::new(SegmentationDims::new(32, 18));
    let runs = Arc::clone(&backend.runs);
    let (mut controller, log) = small_controller(
        backend,
        BackgroundConfig::Image("/nonexistent/background.png".into()),
    );

    for _ in 0..3 {
        assert!(controller.pump());
    }

    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert!(log.lock().unwrap().frames.is_empty());
    assert_eq!(controller.frames_rendered(), 0);
    assert_eq!(controller.output_track().ready_state(), ReadyState::Live);
    assert!(controller.failure().is_none());
}

#[test]
fn inference_failure_stops_the_effect() {
    let backend = StubBackend::failing_on(SegmentationDims::new(32, 18), 3);
    let runs = Arc::clone(&backend.runs);
    let (mut controller, log) = small_controller(backend, BackgroundConfig::Blur);

    assert!(controller.pump());
    assert!(controller.pump());
    assert!(!controller.pump());

    assert!(matches!(controller.failure(), Some(EffectError::Render(_))));
    assert!(controller.is_stopped());
    assert_eq!(controller.pending_callbacks(), 0);
    assert_eq!(controller.input_track().ready_state(), ReadyState::Ended);
    assert_eq!(controller.output_track().ready_state(), ReadyState::Ended);
    assert_eq!(log.lock().unwrap().frames.len(), 2);

    // Nothing runs after the failure
    assert!(!controller.pump());
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert!(matches!(controller.run(), Err(EffectError::Render(_))));
}

#[test]
fn exactly_one_callback_is_pending_while_running() {
    let (mut controller, _log) =
        small_controller(StubBackend::new(SegmentationDims::new(32, 18)), BackgroundConfig::Blur);

    assert_eq!(controller.pending_callbacks(), 1);
    for _ in 0..3 {
        assert!(controller.pump());
        assert_eq!(controller.pending_callbacks(), 1);
    }

    controller.stop();
    assert_eq!(controller.pending_callbacks(), 0);
}

#[test]
fn stop_is_idempotent() {
    let backend = StubBackend::new(SegmentationDims::new(32, 18));
    let runs = Arc::clone(&backend.runs);
    let (mut controller, log) = small_controller(backend, BackgroundConfig::Blur);

    assert!(controller.pump());
    controller.stop();
    controller.stop();

    assert!(!controller.pump());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(log.lock().unwrap().frames.len(), 1);
    assert!(controller.failure().is_none());
    assert!(controller.run().is_ok());
}

#[test]
fn stop_before_first_tick_renders_nothing() {
    let backend = StubBackend::new(SegmentationDims::new(32, 18));
    let runs = Arc::clone(&backend.runs);
    let (mut controller, log) = small_controller(backend, BackgroundConfig::Blur);

    controller.stop();

    assert!(!controller.pump());
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(log.lock().unwrap().frames.is_empty());
}

#[test]
fn dropping_the_controller_ends_both_tracks() {
    let (controller, log) =
        small_controller(StubBackend::new(SegmentationDims::new(32, 18)), BackgroundConfig::Blur);
    drop(controller);
    assert!(log.lock().unwrap().closed);
}

#[test]
fn failed_accelerated_construction_uses_fallback() {
    let dims = SegmentationDims::new(32, 18);
    let config = PipelineConfig {
        width: 320,
        height: 180,
        background: BackgroundConfig::Blur,
        options: options(dims),
    };
    let pipeline = select_pipeline(
        PipelineChoice::Auto,
        || Err(anyhow!("no adapter")),
        || Ok(Box::new(FallbackPipeline::new(&config)?) as Box<dyn Pipeline>),
    )
    .unwrap();

    let input = InputTrack::new(Box::new(SyntheticCapture::new(320, 180, 30.0)));
    let (sink, log) = RecordingSink::new(320, 180);
    let mut controller = EffectTrackController::with_pipeline(
        Box::new(StubBackend::new(dims)),
        input,
        Box::new(sink),
        pipeline,
        &config.options,
    )
    .unwrap();

    assert_eq!(controller.pipeline_kind(), PipelineKind::Fallback);
    assert!(controller.pump());
    assert_eq!(log.lock().unwrap().frames, vec![(320, 180)]);
}

#[test]
fn missing_frame_rate_is_a_construction_error() {
    let dims = SegmentationDims::new(32, 18);
    let input = InputTrack::new(Box::new(ReportingCapture {
        settings: Some(TrackSettings {
            width: Some(640),
            height: Some(480),
            frame_rate: None,
        }),
    }));
    let (sink, _log) = RecordingSink::new(640, 480);

    let result = EffectTrackController::new(
        Box::new(StubBackend::new(dims)),
        input,
        Box::new(sink),
        BackgroundConfig::Blur,
        options(dims),
    );

    assert!(matches!(result, Err(EffectError::Construction(_))));
}

#[test]
fn unusably_low_frame_rate_is_a_construction_error() {
    let dims = SegmentationDims::new(32, 18);
    let input = InputTrack::new(Box::new(ReportingCapture {
        settings: Some(TrackSettings {
            width: Some(64),
            height: Some(36),
            frame_rate: Some(1e-20),
        }),
    }));
    let (sink, _log) = RecordingSink::new(64, 36);

    let result = EffectTrackController::new(
        Box::new(StubBackend::new(dims)),
        input,
        Box::new(sink),
        BackgroundConfig::Blur,
        options(dims),
    );
    assert!(matches!(result, Err(EffectError::Construction(_))));

    let input = InputTrack::new(Box::new(SyntheticCapture::new(64, 36, 30.0)));
    let (sink, _log) = RecordingSink::new(64, 36);
    let result = EffectTrackController::new(
        Box::new(StubBackend::new(dims)),
        input,
        Box::new(sink),
        BackgroundConfig::Blur,
        EffectOptions {
            target_fps: Some(1e-20),
            ..options(dims)
        },
    );
    assert!(matches!(result, Err(EffectError::Construction(_))));
}

#[test]
fn ticks_are_paced_to_target_frame_rate() {
    let dims = SegmentationDims::new(32, 18);
    let input = InputTrack::new(Box::new(SyntheticCapture::new(64, 36, 30.0)));
    let (sink, log) = RecordingSink::new(64, 36);
    let mut controller = EffectTrackController::new(
        Box::new(StubBackend::new(dims)),
        input,
        Box::new(sink),
        BackgroundConfig::Blur,
        EffectOptions {
            target_fps: Some(50.0),
            ..options(dims)
        },
    )
    .unwrap();

    let started = Instant::now();
    for _ in 0..6 {
        assert!(controller.pump());
    }
    let elapsed = started.elapsed();

    // First tick fires at once, the next five wait out 20ms intervals
    assert!(
        elapsed >= Duration::from_millis(95),
        "six ticks took {:?}",
        elapsed
    );
    assert_eq!(log.lock().unwrap().frames.len(), 6);
}

#[test]
fn track_without_settings_is_not_supported() {
    let dims = SegmentationDims::new(32, 18);
    let input = InputTrack::new(Box::new(ReportingCapture { settings: None }));
    let (sink, _log) = RecordingSink::new(640, 480);

    let result = EffectTrackController::new(
        Box::new(StubBackend::new(dims)),
        input,
        Box::new(sink),
        BackgroundConfig::Blur,
        options(dims),
    );

    assert!(matches!(result, Err(EffectError::NotSupported(_))));
}

#[test]
fn backend_resolution_must_match_options() {
    let input = InputTrack::new(Box::new(SyntheticCapture::new(320, 180, 30.0)));
    let (sink, _log) = RecordingSink::new(320, 180);

    let result = EffectTrackController::new(
        Box::new(StubBackend::new(SegmentationDims::new(16, 16))),
        input,
        Box::new(sink),
        BackgroundConfig::Blur,
        options(SegmentationDims::new(32, 18)),
    );

    assert!(matches!(result, Err(EffectError::Construction(_))));
}

#[test]
fn capture_failure_is_a_render_error() {
    let dims = SegmentationDims::new(32, 18);
    let input = InputTrack::new(Box::new(ReportingCapture {
        settings: Some(TrackSettings {
            width: Some(64),
            height: Some(36),
            frame_rate: Some(30.0),
        }),
    }));
    let (sink, log) = RecordingSink::new(64, 36);

    let mut controller = EffectTrackController::new(
        Box::new(StubBackend::new(dims)),
        input,
        Box::new(sink),
        BackgroundConfig::Blur,
        options(dims),
    )
    .unwrap();

    assert!(!controller.pump());
    assert!(matches!(controller.failure(), Some(EffectError::Render(_))));
    assert!(log.lock().unwrap().closed);
}
