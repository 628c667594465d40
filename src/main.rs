use anyhow::{bail, Context, Result};
use backdrop_fx::capture::{CaptureSource, SyntheticCapture, WebcamCapture};
use backdrop_fx::output::{OutputSink, V4L2Output};
use backdrop_fx::segmentation::load_onnx_backend;
use backdrop_fx::{
    BackgroundConfig, BlendMode, EffectOptions, EffectTrackController, InputTrack, PipelineChoice,
    SegmentationDims,
};
use clap::{Parser, ValueEnum};
use std::time::{Duration, Instant};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum BackgroundArg {
    /// Blur everything behind the person
    Blur,
    /// Replace the background with --background-image
    Image,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum PipelineArg {
    /// GPU when an adapter is usable, CPU otherwise
    Auto,
    Gpu,
    Cpu,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum BlendArg {
    Screen,
    LinearDodge,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Capture resolution width
    #[arg(long, default_value_t = 1280)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = 720)]
    capture_height: u32,

    /// Target frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Path to segmentation model (ONNX file)
    /// If not provided, runs in passthrough mode without segmentation
    #[arg(long)]
    model: Option<String>,

    /// Background effect
    #[arg(long, value_enum, default_value_t = BackgroundArg::Blur)]
    background: BackgroundArg,

    /// Background image path or file:// URL
    #[arg(long)]
    background_image: Option<String>,

    /// Rendering pipeline
    #[arg(long, value_enum, default_value_t = PipelineArg::Auto)]
    pipeline: PipelineArg,

    /// Model input width
    #[arg(long, default_value_t = 256)]
    segmentation_width: u32,

    /// Model input height
    #[arg(long, default_value_t = 144)]
    segmentation_height: u32,

    /// How light wrapping is blended over the person
    #[arg(long, value_enum, default_value_t = BlendArg::Screen)]
    blend_mode: BlendArg,

    /// Strength of the background light around the person's edge
    #[arg(long, default_value_t = 0.3)]
    light_wrapping: f32,

    /// Use a generated test pattern instead of the webcam
    #[arg(long)]
    synthetic: bool,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("backdrop-fx starting");
    tracing::info!("Capture: {}x{}", args.capture_width, args.capture_height);
    tracing::info!("Target FPS: {}", args.fps);

    let capture = open_capture(&args)?;

    let output = V4L2Output::new(&args.output_device, args.capture_width, args.capture_height)
        .context("Failed to initialize v4l2loopback output")?;

    match &args.model {
        Some(model_path) => run_effect(&args, model_path, capture, Box::new(output)),
        None => {
            tracing::info!("Running in passthrough mode (no segmentation)");
            run_passthrough(capture, output, args.fps, args.frames)
        }
    }
}

fn open_capture(args: &Args) -> Result<Box<dyn CaptureSource>> {
    if args.synthetic {
        tracing::info!("Using synthetic capture");
        return Ok(Box::new(SyntheticCapture::new(
            args.capture_width,
            args.capture_height,
            args.fps as f32,
        )));
    }

    let capture = WebcamCapture::new(
        args.input_device,
        args.capture_width,
        args.capture_height,
        args.fps,
    )
    .context("Failed to initialize webcam capture")?;
    Ok(Box::new(capture))
}

fn effect_options(args: &Args) -> EffectOptions {
    EffectOptions {
        segmentation: SegmentationDims::new(args.segmentation_width, args.segmentation_height),
        pipeline: match args.pipeline {
            PipelineArg::Auto => PipelineChoice::Auto,
            PipelineArg::Gpu => PipelineChoice::Accelerated,
            PipelineArg::Cpu => PipelineChoice::Fallback,
        },
        blend_mode: match args.blend_mode {
            BlendArg::Screen => BlendMode::Screen,
            BlendArg::LinearDodge => BlendMode::LinearDodge,
        },
        light_wrapping: args.light_wrapping,
        ..EffectOptions::default()
    }
}

fn background_config(args: &Args) -> Result<BackgroundConfig> {
    match (args.background, &args.background_image) {
        (BackgroundArg::Blur, _) => Ok(BackgroundConfig::Blur),
        (BackgroundArg::Image, Some(url)) => Ok(BackgroundConfig::Image(url.clone())),
        (BackgroundArg::Image, None) => bail!("--background image requires --background-image"),
    }
}

fn run_effect(
    args: &Args,
    model_path: &str,
    capture: Box<dyn CaptureSource>,
    output: Box<dyn OutputSink>,
) -> Result<()> {
    let options = effect_options(args);
    let background = background_config(args)?;

    tracing::info!("Loading segmentation model from {}", model_path);
    let model = std::fs::read(model_path)
        .with_context(|| format!("Failed to read model {}", model_path))?;
    let backend = load_onnx_backend(&model, options.segmentation, options.backend_timeout)
        .context("Failed to load segmentation model")?;
    tracing::info!("Segmentation model loaded successfully");

    let mut controller = EffectTrackController::new(
        backend,
        InputTrack::new(capture),
        output,
        background,
        options,
    )
    .context("Failed to start background effect")?;

    match args.frames {
        Some(limit) => {
            while controller.frames_rendered() < limit && controller.pump() {}
            controller.stop();
            if let Some(err) = controller.failure() {
                return Err(err.clone().into());
            }
        }
        None => {
            tracing::info!("Press Ctrl+C to stop");
            controller.run()?;
        }
    }

    tracing::info!(
        "Wrote {} frames",
        controller.output_track().frames_written()
    );
    Ok(())
}

fn run_passthrough<O>(
    mut capture: Box<dyn CaptureSource>,
    mut output: O,
    target_fps: u32,
    frames: Option<u64>,
) -> Result<()>
where
    O: OutputSink,
{
    let frame_duration = Duration::from_secs_f32(1.0 / target_fps.max(1) as f32);
    let mut frame_count = 0u64;
    let mut total_capture_time = Duration::ZERO;
    let mut total_output_time = Duration::ZERO;

    while frames.map_or(true, |limit| frame_count < limit) {
        let loop_start = Instant::now();

        let capture_start = Instant::now();
        let frame = capture
            .capture_frame()
            .context("Failed to capture frame")?;
        total_capture_time += capture_start.elapsed();

        let output_start = Instant::now();
        output
            .write_frame(&frame)
            .context("Failed to write frame")?;
        total_output_time += output_start.elapsed();

        frame_count += 1;

        // Log stats every 30 frames
        if frame_count % 30 == 0 {
            let avg_capture_ms = total_capture_time.as_secs_f64() * 1000.0 / frame_count as f64;
            let avg_output_ms = total_output_time.as_secs_f64() * 1000.0 / frame_count as f64;
            let total_ms = avg_capture_ms + avg_output_ms;
            tracing::info!(
                "Frame {}: capture={:.1}ms, output={:.1}ms, total={:.1}ms, fps={:.1}",
                frame_count,
                avg_capture_ms,
                avg_output_ms,
                total_ms,
                1000.0 / total_ms
            );
        }

        // Frame rate limiting
        let elapsed = loop_start.elapsed();
        if elapsed < frame_duration {
            std::thread::sleep(frame_duration - elapsed);
        }
    }

    capture.stop()?;
    output.close()?;
    Ok(())
}
