//! Optional postprocessing of inbound remote audio.
//!
//! A transform turns a remote audio track into a processed one by wiring a
//! small node graph (source, effect stages, sink) inside an
//! [`AudioContext`]. The context owns platform resources and must be closed
//! when the call is torn down. Failures never drop the call:
//! [`apply_transform`] substitutes the original track.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{MediaTrack, TrackKind, TrackRef};
use crate::error::CallError;

pub const DEFAULT_PITCH_SHIFT_CENTS: i32 = -400;
pub const MAX_PITCH_SHIFT_CENTS: i32 = 1200;
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Pluggable track postprocessing.
pub trait TrackTransform: Send + Sync {
    fn transform(&self, track: TrackRef) -> Result<TrackRef, CallError>;

    /// Releases the processing context. Idempotent.
    fn close(&self);
}

/// Runs `transform` on audio tracks, falling back to the original on error.
/// Video passes through untouched.
pub fn apply_transform(transform: Option<&dyn TrackTransform>, track: TrackRef) -> TrackRef {
    let Some(transform) = transform else {
        return track;
    };
    if track.kind() != TrackKind::Audio {
        return track;
    }
    match transform.transform(track.clone()) {
        Ok(processed) => processed,
        Err(err) => {
            warn!(track = %track.id(), error = %err, "audio transform failed, using original track");
            track
        }
    }
}

/// Processing stage between source and sink.
pub trait EffectStage: Send {
    fn process(&mut self, input: &[f32], output: &mut [f32]);
}

/// Interpolating pitch shifter. The shift parameter is read once per block.
pub struct PitchShift {
    cents: Arc<AtomicI32>,
    previous_sample: f32,
    phase: f32,
}

impl PitchShift {
    pub fn new(cents: Arc<AtomicI32>) -> Self {
        Self {
            cents,
            previous_sample: 0.0,
            phase: 0.0,
        }
    }

    fn ratio(&self) -> f32 {
        1.0 + self.cents.load(Ordering::Relaxed) as f32 / MAX_PITCH_SHIFT_CENTS as f32
    }
}

impl EffectStage for PitchShift {
    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        let shift = self.ratio();
        let len = input.len().min(output.len());
        for i in 0..len {
            self.phase += shift;
            let frac = self.phase - self.phase.floor();
            let current = input[i];
            output[i] = self.previous_sample * (1.0 - frac) + current * frac;
            self.previous_sample = current;
            if self.phase >= len as f32 {
                self.phase -= len as f32;
            }
        }
    }
}

/// Source -> stages -> sink.
pub struct AudioGraph {
    stages: Vec<Box<dyn EffectStage>>,
    scratch: Vec<f32>,
}

impl AudioGraph {
    fn new(stages: Vec<Box<dyn EffectStage>>) -> Self {
        Self {
            stages,
            scratch: Vec::new(),
        }
    }

    pub fn render(&mut self, input: &[f32], output: &mut [f32]) {
        let len = input.len().min(output.len());
        output[..len].copy_from_slice(&input[..len]);
        self.scratch.resize(len, 0.0);
        for stage in &mut self.stages {
            self.scratch.copy_from_slice(&output[..len]);
            stage.process(&self.scratch, &mut output[..len]);
        }
    }
}

#[derive(Debug)]
struct ContextState {
    closed: AtomicBool,
    graphs: Mutex<usize>,
}

/// Owner of every graph built for one call.
#[derive(Debug, Clone)]
pub struct AudioContext {
    sample_rate: u32,
    state: Arc<ContextState>,
}

impl AudioContext {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            state: Arc::new(ContextState {
                closed: AtomicBool::new(false),
                graphs: Mutex::new(0),
            }),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn active_graphs(&self) -> usize {
        *self.state.graphs.lock()
    }

    fn build(&self, stages: Vec<Box<dyn EffectStage>>) -> Result<AudioGraph, CallError> {
        if self.is_closed() {
            return Err(CallError::TransformFailed("audio context is closed".into()));
        }
        *self.state.graphs.lock() += 1;
        Ok(AudioGraph::new(stages))
    }

    /// Returns true only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let was_open = !self.state.closed.swap(true, Ordering::SeqCst);
        if was_open {
            *self.state.graphs.lock() = 0;
            debug!("audio context closed");
        }
        was_open
    }
}

/// Remote audio routed through an [`AudioGraph`].
pub struct ProcessedAudioTrack {
    id: String,
    source: TrackRef,
    graph: Mutex<AudioGraph>,
    context: AudioContext,
    live: AtomicBool,
}

impl std::fmt::Debug for ProcessedAudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessedAudioTrack")
            .field("id", &self.id)
            .field("source", &self.source.id())
            .finish()
    }
}

impl ProcessedAudioTrack {
    pub fn source(&self) -> &TrackRef {
        &self.source
    }

    /// Pushes one block of PCM through the graph. Silence once stopped.
    pub fn process(&self, input: &[f32], output: &mut [f32]) {
        if !self.is_live() || self.context.is_closed() {
            output.iter_mut().for_each(|sample| *sample = 0.0);
            return;
        }
        self.graph.lock().render(input, output);
    }
}

impl MediaTrack for ProcessedAudioTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn is_enabled(&self) -> bool {
        self.source.is_enabled()
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst) && self.source.is_live()
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            self.source.stop();
        }
    }
}

/// Voice pitch effect applied to the partner's audio.
pub struct PitchShiftTransform {
    context: AudioContext,
    cents: Arc<AtomicI32>,
}

impl Default for PitchShiftTransform {
    fn default() -> Self {
        Self::new(DEFAULT_PITCH_SHIFT_CENTS)
    }
}

impl PitchShiftTransform {
    pub fn new(cents: i32) -> Self {
        Self {
            context: AudioContext::new(DEFAULT_SAMPLE_RATE),
            cents: Arc::new(AtomicI32::new(cents)),
        }
    }

    pub fn context(&self) -> &AudioContext {
        &self.context
    }

    pub fn pitch_shift(&self) -> i32 {
        self.cents.load(Ordering::Relaxed)
    }

    /// Applies to live graphs from their next block on.
    pub fn set_pitch_shift(&self, cents: i32) {
        self.cents.store(
            cents.clamp(-MAX_PITCH_SHIFT_CENTS, MAX_PITCH_SHIFT_CENTS),
            Ordering::Relaxed,
        );
    }
}

impl TrackTransform for PitchShiftTransform {
    fn transform(&self, track: TrackRef) -> Result<TrackRef, CallError> {
        if track.kind() != TrackKind::Audio {
            return Err(CallError::TransformFailed(format!(
                "expected an audio track, got {}",
                track.kind()
            )));
        }
        if !track.is_live() {
            return Err(CallError::TransformFailed(format!(
                "track {} has ended",
                track.id()
            )));
        }
        let cents = self.pitch_shift();
        if cents.abs() > MAX_PITCH_SHIFT_CENTS {
            return Err(CallError::TransformFailed(format!(
                "pitch shift {cents} outside ±{MAX_PITCH_SHIFT_CENTS} cents"
            )));
        }

        let graph = self
            .context
            .build(vec![Box::new(PitchShift::new(self.cents.clone()))])?;
        debug!(track = %track.id(), cents, "audio transform attached");
        Ok(Arc::new(ProcessedAudioTrack {
            id: format!("{}-processed", track.id()),
            source: track,
            graph: Mutex::new(graph),
            context: self.context.clone(),
            live: AtomicBool::new(true),
        }))
    }

    fn close(&self) {
        self.context.close();
    }
}
