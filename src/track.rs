//! Input and output video tracks.

use crate::capture::{CaptureSource, TrackSettings};
use crate::error::EffectError;
use crate::output::OutputSink;
use anyhow::{bail, Context, Result};
use image::{imageops, RgbImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Live,
    Ended,
}

/// Resolved stream settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
}

impl VideoSettings {
    /// Resolve reported settings, rejecting missing or zero values
    pub fn resolve(settings: &TrackSettings) -> Result<Self, EffectError> {
        let width = settings.width.filter(|&w| w > 0);
        let height = settings.height.filter(|&h| h > 0);
        let frame_rate = settings.frame_rate.filter(|&fps| fps > 0.0);

        match (width, height, frame_rate) {
            (Some(width), Some(height), Some(frame_rate)) => Ok(Self {
                width,
                height,
                frame_rate,
            }),
            (None, _, _) | (_, None, _) => Err(EffectError::Construction(
                "input track does not report its dimensions".into(),
            )),
            (_, _, None) => Err(EffectError::Construction(
                "input track does not report its frame rate".into(),
            )),
        }
    }
}

/// A live camera track handed in by the caller.
pub struct InputTrack {
    source: Box<dyn CaptureSource>,
    state: ReadyState,
}

impl InputTrack {
    pub fn new(source: Box<dyn CaptureSource>) -> Self {
        Self {
            source,
            state: ReadyState::Live,
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state
    }

    /// Settings as reported by the device
    pub fn settings(&self) -> Option<TrackSettings> {
        self.source.settings()
    }

    fn capture(&mut self) -> Result<RgbImage> {
        if self.state == ReadyState::Ended {
            bail!("input track has ended");
        }
        self.source.capture_frame()
    }

    /// End the track. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.state == ReadyState::Ended {
            return;
        }
        self.state = ReadyState::Ended;
        if let Err(err) = self.source.stop() {
            tracing::warn!("Failed to stop input track: {:#}", err);
        }
    }
}

/// Hidden sink bound to one input track. Its settings are captured once at
/// binding and never change.
pub struct FrameSource {
    track: InputTrack,
    settings: VideoSettings,
    attached: bool,
}

impl FrameSource {
    pub fn bind(track: InputTrack) -> Result<Self, EffectError> {
        let reported = track.settings().ok_or_else(|| {
            EffectError::NotSupported("input track cannot report its settings".into())
        })?;
        let settings = VideoSettings::resolve(&reported)?;

        tracing::debug!(
            "Frame source bound at {}x{}@{}",
            settings.width,
            settings.height,
            settings.frame_rate
        );

        Ok(Self {
            track,
            settings,
            attached: true,
        })
    }

    pub fn settings(&self) -> VideoSettings {
        self.settings
    }

    pub fn track(&self) -> &InputTrack {
        &self.track
    }

    /// Pull the next frame at the sink's fixed size
    pub fn next_frame(&mut self) -> Result<RgbImage> {
        if !self.attached {
            bail!("frame source is detached");
        }

        let frame = self.track.capture().context("Failed to capture frame")?;
        let (width, height) = (self.settings.width, self.settings.height);

        if frame.dimensions() == (width, height) {
            Ok(frame)
        } else {
            Ok(imageops::resize(
                &frame,
                width,
                height,
                imageops::FilterType::Triangle,
            ))
        }
    }

    /// Stop the input track and detach from it
    pub fn detach(&mut self) {
        self.track.stop();
        self.attached = false;
    }
}

/// Track derived from the output surface, feeding an [`OutputSink`].
pub struct OutputTrack {
    sink: Box<dyn OutputSink>,
    settings: VideoSettings,
    state: ReadyState,
    frames_written: u64,
}

impl OutputTrack {
    pub fn new(sink: Box<dyn OutputSink>, settings: VideoSettings) -> Self {
        let (sink_width, sink_height) = sink.resolution();
        if (sink_width, sink_height) != (settings.width, settings.height) {
            tracing::debug!(
                "Output sink runs at {}x{}, track at {}x{}",
                sink_width,
                sink_height,
                settings.width,
                settings.height
            );
        }

        Self {
            sink,
            settings,
            state: ReadyState::Live,
            frames_written: 0,
        }
    }

    pub fn settings(&self) -> VideoSettings {
        self.settings
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Capture one surface frame
    pub fn write(&mut self, surface: &RgbImage) -> Result<()> {
        if self.state == ReadyState::Ended {
            bail!("output track has ended");
        }
        self.sink.write_frame(surface)?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.state == ReadyState::Ended {
            return;
        }
        self.state = ReadyState::Ended;
        if let Err(err) = self.sink.close() {
            tracing::warn!("Failed to close output sink: {:#}", err);
        }
    }
}
