//! Local capture acquisition and the track/stream model shared with the
//! peer connection.
//!
//! The capture backend is a seam ([`CaptureDevices`]): the engine only needs
//! device enumeration and a `getUserMedia`-like call. [`MediaManager`] adds the
//! checks around it: platform support, device presence, an optional
//! permission probe whose tracks are stopped immediately, a timeout, and
//! attaching the result to the local preview.

pub mod transform;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::MediaError;
pub use crate::peer::types::TrackKind;
use crate::utils::random_id;

/// A media track, local or remote.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    fn is_live(&self) -> bool;
    /// Releases the underlying source. Calling it again has no effect.
    fn stop(&self);
}

pub type TrackRef = Arc<dyn MediaTrack>;

/// Plain track with atomic state, used for captured and synthetic tracks.
#[derive(Debug)]
pub struct CapturedTrack {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl CapturedTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: random_id(),
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl MediaTrack for CapturedTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            debug!(track = %self.id, kind = %self.kind, "track stopped");
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<TrackRef>,
}

impl MediaStream {
    pub fn new(tracks: Vec<TrackRef>) -> Self {
        Self {
            id: random_id(),
            tracks,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[TrackRef] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &TrackRef> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Replaces any existing track of the same id.
    pub fn add_track(&mut self, track: TrackRef) {
        self.tracks.retain(|t| t.id() != track.id());
        self.tracks.push(track);
    }

    /// True when an enabled, live track of `kind` is present.
    pub fn has_active(&self, kind: TrackKind) -> bool {
        self.tracks_of(kind).any(|t| t.is_enabled() && t.is_live())
    }

    pub fn has_active_audio_and_video(&self) -> bool {
        self.has_active(TrackKind::Audio) && self.has_active(TrackKind::Video)
    }

    /// Stops every track and empties the stream; returns how many were stopped.
    pub fn stop_all(&mut self) -> usize {
        let tracks = std::mem::take(&mut self.tracks);
        for track in &tracks {
            track.stop();
        }
        tracks.len()
    }
}

/// Both sides carry enabled audio and video.
pub fn check_stream_status(local: Option<&MediaStream>, remote: Option<&MediaStream>) -> bool {
    match (local, remote) {
        (Some(local), Some(remote)) => {
            local.has_active_audio_and_video() && remote.has_active_audio_and_video()
        }
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    User,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing_mode: FacingMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: Some(VideoConstraints {
                ideal_width: 1280,
                ideal_height: 720,
                facing_mode: FacingMode::User,
            }),
            audio: true,
        }
    }
}

impl MediaConstraints {
    pub fn wants(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio,
            TrackKind::Video => self.video.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
    AudioOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    pub label: String,
}

/// Platform capture API.
#[async_trait]
pub trait CaptureDevices: Send + Sync {
    /// False when the platform has no capture API at all.
    fn is_supported(&self) -> bool {
        true
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError>;

    async fn get_user_media(&self, constraints: &MediaConstraints)
        -> Result<MediaStream, MediaError>;
}

/// Backend for hosts without any capture support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

#[async_trait]
impl CaptureDevices for NoCapture {
    fn is_supported(&self) -> bool {
        false
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        Err(MediaError::PlatformUnsupported)
    }

    async fn get_user_media(&self, _: &MediaConstraints) -> Result<MediaStream, MediaError> {
        Err(MediaError::PlatformUnsupported)
    }
}

/// Where a stream is rendered (local preview, remote view).
pub trait MediaSink: Send + Sync {
    fn attach(&self, stream: &MediaStream, muted: bool);
    fn detach(&self);
}

pub struct MediaManager {
    devices: Arc<dyn CaptureDevices>,
    preview: Option<Arc<dyn MediaSink>>,
    permission_probe: bool,
    timeout: Duration,
}

impl MediaManager {
    pub fn new(devices: Arc<dyn CaptureDevices>, timeout: Duration) -> Self {
        Self {
            devices,
            preview: None,
            permission_probe: false,
            timeout,
        }
    }

    pub fn with_preview(mut self, preview: Arc<dyn MediaSink>) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn with_permission_probe(mut self, enabled: bool) -> Self {
        self.permission_probe = enabled;
        self
    }

    pub async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        match tokio::time::timeout(self.timeout, self.acquire_inner(constraints)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?self.timeout, "media acquisition timed out");
                Err(MediaError::Timeout)
            }
        }
    }

    async fn acquire_inner(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        if !self.devices.is_supported() {
            return Err(MediaError::PlatformUnsupported);
        }

        let devices = self.devices.enumerate_devices().await?;
        for (kind, device_kind) in [
            (TrackKind::Video, DeviceKind::VideoInput),
            (TrackKind::Audio, DeviceKind::AudioInput),
        ] {
            if constraints.wants(kind) && !devices.iter().any(|d| d.kind == device_kind) {
                return Err(MediaError::DeviceMissing(kind));
            }
        }

        if self.permission_probe {
            // surfaces permission errors without holding the devices open
            let mut probe = self.devices.get_user_media(constraints).await?;
            let stopped = probe.stop_all();
            debug!(stopped, "permission probe released");
        }

        let stream = self.devices.get_user_media(constraints).await?;
        info!(
            video_tracks = stream.tracks_of(TrackKind::Video).count(),
            audio_tracks = stream.tracks_of(TrackKind::Audio).count(),
            "media stream obtained"
        );
        if let Some(preview) = &self.preview {
            preview.attach(&stream, true);
        }
        Ok(stream)
    }
}
