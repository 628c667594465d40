//! Frame loop that turns an input track into a processed output track.

use crate::config::{BackgroundConfig, EffectOptions};
use crate::error::EffectError;
use crate::output::OutputSink;
use crate::pipeline::{create_pipeline, Pipeline, PipelineConfig, PipelineKind, RenderOutcome};
use crate::scheduler::SchedulingWorker;
use crate::segmentation::InferenceBackend;
use crate::track::{FrameSource, InputTrack, OutputTrack};
use anyhow::Context;
use std::time::{Duration, Instant};

/// Log timing statistics every this many ticks
const STATS_INTERVAL: u64 = 30;

/// Payload of a loop timer
struct Tick {
    id: u64,
}

/// Drives the background effect for one input track.
///
/// Each tick pulls a frame, renders it, writes presented frames to the
/// output track and arms the next tick so that ticks land at the target
/// frame rate. Ticks never overlap. Any failure stops the controller.
pub struct EffectTrackController {
    source: FrameSource,
    output: OutputTrack,
    pipeline: Box<dyn Pipeline>,
    backend: Box<dyn InferenceBackend>,
    worker: SchedulingWorker<Tick>,
    tick_id: u64,
    interval: Duration,
    stats: FrameStats,
    failure: Option<EffectError>,
    stopped: bool,
}

impl EffectTrackController {
    /// Build the controller and pick a pipeline per `options.pipeline`
    pub fn new(
        backend: Box<dyn InferenceBackend>,
        input: InputTrack,
        sink: Box<dyn OutputSink>,
        background: BackgroundConfig,
        options: EffectOptions,
    ) -> Result<Self, EffectError> {
        let source = FrameSource::bind(input)?;
        check_backend(backend.as_ref(), &options)?;

        let settings = source.settings();
        let config = PipelineConfig {
            width: settings.width,
            height: settings.height,
            background,
            options,
        };
        let pipeline = create_pipeline(&config)?;

        Self::assemble(backend, source, sink, pipeline, &config.options)
    }

    /// Build the controller around an already constructed pipeline
    pub fn with_pipeline(
        backend: Box<dyn InferenceBackend>,
        input: InputTrack,
        sink: Box<dyn OutputSink>,
        pipeline: Box<dyn Pipeline>,
        options: &EffectOptions,
    ) -> Result<Self, EffectError> {
        let source = FrameSource::bind(input)?;
        check_backend(backend.as_ref(), options)?;
        Self::assemble(backend, source, sink, pipeline, options)
    }

    fn assemble(
        backend: Box<dyn InferenceBackend>,
        mut source: FrameSource,
        sink: Box<dyn OutputSink>,
        mut pipeline: Box<dyn Pipeline>,
        options: &EffectOptions,
    ) -> Result<Self, EffectError> {
        let settings = source.settings();

        let target_fps = options
            .target_fps
            .filter(|&fps| fps > 0.0)
            .unwrap_or(settings.frame_rate);
        let interval = match frame_interval(target_fps) {
            Ok(interval) => interval,
            Err(err) => {
                pipeline.cleanup();
                source.detach();
                return Err(err);
            }
        };

        let mut worker = match SchedulingWorker::spawn("effect-loop") {
            Ok(worker) => worker,
            Err(err) => {
                pipeline.cleanup();
                source.detach();
                return Err(EffectError::Construction(format!(
                    "failed to start loop worker: {}",
                    err
                )));
            }
        };

        tracing::info!(
            "Background effect on {}x{}@{} using {:?} pipeline, target {:.1} fps",
            settings.width,
            settings.height,
            settings.frame_rate,
            pipeline.kind(),
            target_fps
        );

        worker.schedule(0, Duration::ZERO, Tick { id: 0 });

        Ok(Self {
            output: OutputTrack::new(sink, settings),
            source,
            pipeline,
            backend,
            worker,
            tick_id: 0,
            interval,
            stats: FrameStats::default(),
            failure: None,
            stopped: false,
        })
    }

    /// Wait for the next tick and process it.
    ///
    /// Returns `false` once the controller has stopped.
    pub fn pump(&mut self) -> bool {
        if self.stopped {
            return false;
        }

        let Some(tick) = self.worker.wait() else {
            return false;
        };
        if tick.id != self.tick_id {
            tracing::trace!("Ignoring stale tick {}", tick.id);
            return !self.stopped;
        }

        self.on_tick();
        !self.stopped
    }

    /// Process ticks until stopped. Returns the failure that stopped the
    /// loop, if any.
    pub fn run(&mut self) -> Result<(), EffectError> {
        while self.pump() {}
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Stop both tracks, the loop worker and the pipeline. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.tick_id += 1;
        self.worker.cancel();
        self.worker.close();
        self.source.detach();
        self.output.stop();
        self.pipeline.cleanup();

        tracing::info!(
            "Background effect stopped after {} frames ({} skipped)",
            self.stats.presented,
            self.stats.skipped
        );
    }

    /// The error that stopped the loop
    pub fn failure(&self) -> Option<&EffectError> {
        self.failure.as_ref()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Armed loop timers: 1 while running, 0 once stopped
    pub fn pending_callbacks(&self) -> usize {
        self.worker.pending()
    }

    /// Frames written to the output track
    pub fn frames_rendered(&self) -> u64 {
        self.stats.presented
    }

    pub fn input_track(&self) -> &InputTrack {
        self.source.track()
    }

    pub fn output_track(&self) -> &OutputTrack {
        &self.output
    }

    pub fn pipeline_kind(&self) -> PipelineKind {
        self.pipeline.kind()
    }

    fn on_tick(&mut self) {
        let started = Instant::now();

        match self.render_frame() {
            Ok(outcome) => self.stats.record(outcome, started.elapsed()),
            Err(err) => {
                tracing::error!("Background effect failed: {:#}", err);
                self.failure = Some(EffectError::Render(format!("{:#}", err)));
                self.stop();
                return;
            }
        }

        if self.stats.ticks % STATS_INTERVAL == 0 {
            self.stats.log();
        }

        let remaining = next_delay(self.interval, started.elapsed());
        self.tick_id += 1;
        self.worker.schedule(self.tick_id, remaining, Tick { id: self.tick_id });
    }

    fn render_frame(&mut self) -> anyhow::Result<RenderOutcome> {
        let frame = self.source.next_frame()?;
        let outcome = self.pipeline.render(&frame, self.backend.as_mut())?;

        if outcome == RenderOutcome::Presented {
            self.output
                .write(self.pipeline.surface())
                .context("Failed to write output frame")?;
        }

        Ok(outcome)
    }
}

impl Drop for EffectTrackController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Time between ticks at `fps`. Rates too low for a `Duration` are rejected.
fn frame_interval(fps: f32) -> Result<Duration, EffectError> {
    Duration::try_from_secs_f32(1.0 / fps).map_err(|err| {
        EffectError::Construction(format!("frame rate {} has no usable interval: {}", fps, err))
    })
}

/// Whatever is left of the frame interval once the tick's work is done
fn next_delay(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

fn check_backend(
    backend: &dyn InferenceBackend,
    options: &EffectOptions,
) -> Result<(), EffectError> {
    if backend.dims() != options.segmentation {
        return Err(EffectError::Construction(format!(
            "backend runs at {}x{}, effect is configured for {}x{}",
            backend.dims().width,
            backend.dims().height,
            options.segmentation.width,
            options.segmentation.height
        )));
    }
    Ok(())
}

#[derive(Default)]
struct FrameStats {
    ticks: u64,
    presented: u64,
    skipped: u64,
    total_tick_time: Duration,
}

impl FrameStats {
    fn record(&mut self, outcome: RenderOutcome, elapsed: Duration) {
        self.ticks += 1;
        self.total_tick_time += elapsed;
        match outcome {
            RenderOutcome::Presented => self.presented += 1,
            RenderOutcome::Skipped => self.skipped += 1,
        }
    }

    fn log(&self) {
        let avg_ms = self.total_tick_time.as_secs_f64() * 1000.0 / self.ticks as f64;
        tracing::info!(
            "Tick {}: presented={}, skipped={}, render={:.1}ms, max fps={:.1}",
            self.ticks,
            self.presented,
            self.skipped,
            avg_ms,
            1000.0 / avg_ms
        );
    }
}
