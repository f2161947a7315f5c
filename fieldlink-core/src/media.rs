//! Local media acquisition
//!
//! This module owns the local capture bundle (one audio and one video track)
//! shared by every peer connection.
//!
//! # Fallback chain
//!
//! `acquire` walks these steps until the request is satisfied:
//! 1. full constraints tuned to the orientation
//! 2. relaxed constraints without aspect pinning
//! 3. separate audio-only and raw video-device requests
//! 4. a synthetic placeholder video track rendered from a still frame
//!
//! Capture hardware is reached through the [`CaptureBackend`] trait.

use crate::types::{CallKind, TrackKind};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone)]
pub enum MediaError {
    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// No device of the requested kind is reachable
    #[error("No {0} devices available")]
    NoDevices(String),

    /// Capture failed
    #[error("Capture error: {0}")]
    Capture(String),

    /// Placeholder frame could not be rendered
    #[error("Synthesis error: {0}")]
    Synthesis(String),

    /// Track was already released
    #[error("Track released")]
    Released,
}

/// Preferred capture orientation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    /// 16:9, 1280x720
    #[default]
    Landscape,
    /// 9:16, 720x1280
    Portrait,
}

impl Orientation {
    /// Target frame size
    #[must_use]
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Self::Landscape => (1280, 720),
            Self::Portrait => (720, 1280),
        }
    }

    /// Target aspect ratio
    #[must_use]
    pub fn aspect_ratio(self) -> f64 {
        match self {
            Self::Landscape => 16.0 / 9.0,
            Self::Portrait => 9.0 / 16.0,
        }
    }
}

/// What to acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireConfig {
    /// Audio requested
    pub audio: bool,
    /// Video requested
    pub video: bool,
    /// Capture orientation
    pub orientation: Orientation,
}

impl AcquireConfig {
    /// Audio-only request
    #[must_use]
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
            orientation: Orientation::Landscape,
        }
    }

    /// Audio and video request
    #[must_use]
    pub fn video_call(orientation: Orientation) -> Self {
        Self {
            audio: true,
            video: true,
            orientation,
        }
    }

    /// Request matching a call kind
    #[must_use]
    pub fn for_call(kind: CallKind, orientation: Orientation) -> Self {
        match kind {
            CallKind::Audio => Self::audio_only(),
            CallKind::Video => Self::video_call(orientation),
        }
    }
}

/// Audio processing constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    /// Echo cancellation
    pub echo_cancellation: bool,
    /// Noise suppression
    pub noise_suppression: bool,
    /// Automatic gain control
    pub auto_gain_control: bool,
}

impl AudioConstraints {
    /// Voice profile used for audio-only requests
    #[must_use]
    pub fn voice() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }

    /// Profile used alongside video
    #[must_use]
    pub fn standard() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: false,
            auto_gain_control: false,
        }
    }
}

/// Video capture constraints; `None` leaves the choice to the device
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VideoConstraints {
    /// Specific device
    pub device_id: Option<String>,
    /// Frame width
    pub width: Option<u32>,
    /// Frame height
    pub height: Option<u32>,
    /// Pinned aspect ratio
    pub aspect_ratio: Option<f64>,
    /// Frame rate
    pub frame_rate: Option<u32>,
}

impl VideoConstraints {
    /// Full constraints for an orientation
    #[must_use]
    pub fn full(orientation: Orientation, frame_rate: u32) -> Self {
        let (width, height) = orientation.dimensions();
        Self {
            device_id: None,
            width: Some(width),
            height: Some(height),
            aspect_ratio: Some(orientation.aspect_ratio()),
            frame_rate: Some(frame_rate),
        }
    }

    /// Same size without aspect pinning
    #[must_use]
    pub fn relaxed(orientation: Orientation) -> Self {
        let (width, height) = orientation.dimensions();
        Self {
            device_id: None,
            width: Some(width),
            height: Some(height),
            aspect_ratio: None,
            frame_rate: None,
        }
    }

    /// Bare device access
    #[must_use]
    pub fn raw() -> Self {
        Self::default()
    }

    /// Pin to a device
    #[must_use]
    pub fn on_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// A capture request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CaptureConstraints {
    /// Audio, if requested
    pub audio: Option<AudioConstraints>,
    /// Video, if requested
    pub video: Option<VideoConstraints>,
}

/// A capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureDevice {
    /// Device identifier
    pub id: String,
    /// Device name
    pub label: String,
    /// Audio or video
    pub kind: TrackKind,
}

impl CaptureDevice {
    /// Create a device description
    pub fn new(id: impl Into<String>, label: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind,
        }
    }
}

/// Where a track's content comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Camera or microphone
    Device,
    /// Rendered placeholder
    Synthetic,
}

/// Negotiated capture settings of a track
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackSettings {
    /// Frame width
    pub width: Option<u32>,
    /// Frame height
    pub height: Option<u32>,
    /// Aspect ratio
    pub aspect_ratio: Option<f64>,
    /// Frame rate
    pub frame_rate: Option<u32>,
    /// Audio processing
    pub audio: Option<AudioConstraints>,
}

/// A local media track
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    source: SourceKind,
    device_id: Option<String>,
    settings: TrackSettings,
    still_frame: Option<Bytes>,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MediaTrack {
    /// Track captured from a device
    pub fn from_device(device: &CaptureDevice, settings: TrackSettings) -> Self {
        Self {
            id: format!("{}-{}", device.kind.sdp_media(), Uuid::new_v4().simple()),
            kind: device.kind,
            source: SourceKind::Device,
            device_id: Some(device.id.clone()),
            settings,
            still_frame: None,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    /// Placeholder video track showing a rendered still frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame size is not renderable
    pub fn synthetic_video(width: u32, height: u32, frame_rate: u32) -> Result<Self, MediaError> {
        let frame = render_placeholder_frame(width, height)?;
        Ok(Self {
            id: format!("video-synthetic-{}", Uuid::new_v4().simple()),
            kind: TrackKind::Video,
            source: SourceKind::Synthetic,
            device_id: None,
            settings: TrackSettings {
                width: Some(width),
                height: Some(height),
                aspect_ratio: Some(f64::from(width) / f64::from(height)),
                frame_rate: Some(frame_rate),
                audio: None,
            },
            still_frame: Some(frame),
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        })
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Device or synthetic
    pub fn source(&self) -> SourceKind {
        self.source
    }

    /// Capture device, if any
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Capture settings
    pub fn settings(&self) -> &TrackSettings {
        &self.settings
    }

    /// I420 still frame of a synthetic track
    pub fn still_frame(&self) -> Option<&Bytes> {
        self.still_frame.as_ref()
    }

    /// Whether the track is sending content (mute flag)
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Flip the enabled flag
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether the track has not been stopped
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Stop the track; returns `false` if it was already stopped
    pub fn stop(&self) -> bool {
        self.live.swap(false, Ordering::AcqRel)
    }
}

/// Render a 4:2:0 placeholder: dark background with a lighter centered card.
fn render_placeholder_frame(width: u32, height: u32) -> Result<Bytes, MediaError> {
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        return Err(MediaError::Synthesis(format!(
            "frame size {width}x{height} must be even and non-zero"
        )));
    }
    let w = usize::try_from(width).map_err(|e| MediaError::Synthesis(e.to_string()))?;
    let h = usize::try_from(height).map_err(|e| MediaError::Synthesis(e.to_string()))?;

    let mut frame = Vec::with_capacity(w * h * 3 / 2);
    let (card_x, card_y) = (w / 4..w * 3 / 4, h / 4..h * 3 / 4);
    for y in 0..h {
        for x in 0..w {
            let luma = if card_x.contains(&x) && card_y.contains(&y) {
                96
            } else {
                32
            };
            frame.push(luma);
        }
    }
    frame.resize(w * h * 3 / 2, 128);
    Ok(Bytes::from(frame))
}

/// The local capture bundle
#[derive(Debug, Clone, Default)]
pub struct MediaBundle {
    /// Audio track
    pub audio: Option<Arc<MediaTrack>>,
    /// Video track
    pub video: Option<Arc<MediaTrack>>,
}

impl MediaBundle {
    /// Synthetic if any track is a placeholder
    #[must_use]
    pub fn source_kind(&self) -> SourceKind {
        let synthetic = self
            .tracks()
            .any(|track| track.source() == SourceKind::Synthetic);
        if synthetic {
            SourceKind::Synthetic
        } else {
            SourceKind::Device
        }
    }

    /// Track of a kind
    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&Arc<MediaTrack>> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    /// Every track held
    pub fn tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.audio.iter().chain(self.video.iter())
    }

    /// Whether the bundle covers a request
    #[must_use]
    pub fn satisfies(&self, config: &AcquireConfig) -> bool {
        (!config.audio || self.audio.is_some()) && (!config.video || self.video.is_some())
    }

    /// Whether nothing is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// Capture hardware access
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// List capture devices
    async fn enumerate_devices(&self) -> Result<Vec<CaptureDevice>, MediaError>;

    /// Capture tracks satisfying `constraints`; fails if any requested kind
    /// cannot be satisfied
    async fn capture(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<Arc<MediaTrack>>, MediaError>;
}

/// Backend over a fixed device list
///
/// Produces device tracks with the requested settings, without touching
/// hardware.
#[derive(Debug, Default)]
pub struct StaticCaptureBackend {
    devices: parking_lot::RwLock<Vec<CaptureDevice>>,
    reject_aspect_pinning: bool,
}

impl StaticCaptureBackend {
    /// Backend over `devices`
    #[must_use]
    pub fn new(devices: Vec<CaptureDevice>) -> Self {
        Self {
            devices: parking_lot::RwLock::new(devices),
            reject_aspect_pinning: false,
        }
    }

    /// One default microphone and one default camera
    #[must_use]
    pub fn with_default_devices() -> Self {
        Self::new(vec![
            CaptureDevice::new("default-audio", "Default Audio Device", TrackKind::Audio),
            CaptureDevice::new("default-video", "Default Video Device", TrackKind::Video),
        ])
    }

    /// Fail requests that pin an aspect ratio, as some cameras do
    #[must_use]
    pub fn rejecting_aspect_pinning(mut self) -> Self {
        self.reject_aspect_pinning = true;
        self
    }

    /// Replace the device list (hot-plug)
    pub fn set_devices(&self, devices: Vec<CaptureDevice>) {
        *self.devices.write() = devices;
    }

    fn pick(&self, kind: TrackKind, device_id: Option<&str>) -> Result<CaptureDevice, MediaError> {
        let devices = self.devices.read();
        let mut candidates = devices.iter().filter(|d| d.kind == kind);
        match device_id {
            Some(id) => candidates
                .find(|d| d.id == id)
                .cloned()
                .ok_or_else(|| MediaError::DeviceNotFound(id.to_string())),
            None => candidates
                .next()
                .cloned()
                .ok_or_else(|| MediaError::NoDevices(kind.sdp_media().to_string())),
        }
    }
}

#[async_trait]
impl CaptureBackend for StaticCaptureBackend {
    async fn enumerate_devices(&self) -> Result<Vec<CaptureDevice>, MediaError> {
        Ok(self.devices.read().clone())
    }

    async fn capture(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<Arc<MediaTrack>>, MediaError> {
        let mut tracks = Vec::new();
        if let Some(audio) = constraints.audio {
            let device = self.pick(TrackKind::Audio, None)?;
            tracks.push(Arc::new(MediaTrack::from_device(
                &device,
                TrackSettings {
                    audio: Some(audio),
                    ..TrackSettings::default()
                },
            )));
        }
        if let Some(video) = &constraints.video {
            if self.reject_aspect_pinning && video.aspect_ratio.is_some() {
                return Err(MediaError::Capture("aspect ratio not supported".to_string()));
            }
            let device = self.pick(TrackKind::Video, video.device_id.as_deref())?;
            tracks.push(Arc::new(MediaTrack::from_device(
                &device,
                TrackSettings {
                    width: video.width,
                    height: video.height,
                    aspect_ratio: video.aspect_ratio,
                    frame_rate: video.frame_rate,
                    audio: None,
                },
            )));
        }
        Ok(tracks)
    }
}

/// Step of the fallback chain that produced a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackStep {
    /// Constraints without aspect pinning
    Relaxed,
    /// Separate audio-only / raw video requests
    Separate,
    /// Rendered placeholder
    Synthetic,
}

/// Media events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MediaEvent {
    /// Track started
    TrackStarted {
        /// Track identifier
        track_id: String,
        /// Audio or video
        kind: TrackKind,
        /// Device or synthetic
        source: SourceKind,
    },
    /// Track stopped
    TrackStopped {
        /// Track identifier
        track_id: String,
        /// Audio or video
        kind: TrackKind,
    },
    /// Video source replaced
    SourceSwitched {
        /// New device
        device_id: String,
    },
    /// Acquisition needed a fallback step
    FallbackUsed {
        /// Step that succeeded
        step: FallbackStep,
    },
}

/// Result of `toggle`
#[derive(Debug, Clone)]
pub enum ToggleOutcome {
    /// Existing track flipped
    Toggled(Arc<MediaTrack>),
    /// A new video track was acquired and must be attached to senders
    Acquired(Arc<MediaTrack>),
    /// Nothing to toggle
    NoTrack,
}

/// Result of `switch_source`
#[derive(Debug, Clone)]
pub struct SourceSwitch {
    /// Track to stop once senders have been replaced
    pub previous: Option<Arc<MediaTrack>>,
    /// New video track, already in the bundle
    pub current: Arc<MediaTrack>,
}

/// Media configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Capture orientation
    pub orientation: Orientation,
    /// Capture frame rate
    pub frame_rate: u32,
    /// Placeholder width
    pub synthetic_width: u32,
    /// Placeholder height
    pub synthetic_height: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            orientation: Orientation::Landscape,
            frame_rate: 30,
            synthetic_width: 320,
            synthetic_height: 240,
        }
    }
}

#[derive(Default)]
struct Captured {
    audio: Option<Arc<MediaTrack>>,
    video: Option<Arc<MediaTrack>>,
}

impl Captured {
    fn absorb(&mut self, tracks: Vec<Arc<MediaTrack>>) {
        for track in tracks {
            let slot = match track.kind() {
                TrackKind::Audio => &mut self.audio,
                TrackKind::Video => &mut self.video,
            };
            if slot.is_none() {
                *slot = Some(track);
            } else {
                track.stop();
            }
        }
    }

    fn stop_all(&self) {
        for track in self.audio.iter().chain(self.video.iter()) {
            track.stop();
        }
    }
}

/// Media manager
///
/// Holds the single local bundle. Acquisitions are serialized, so two
/// concurrent callers never capture twice.
pub struct MediaManager {
    backend: Arc<dyn CaptureBackend>,
    config: MediaConfig,
    bundle: parking_lot::Mutex<Option<MediaBundle>>,
    acquisition: tokio::sync::Mutex<()>,
    event_sender: broadcast::Sender<MediaEvent>,
}

impl MediaManager {
    /// Create a manager over a capture backend
    pub fn new(backend: Arc<dyn CaptureBackend>, config: MediaConfig) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            backend,
            config,
            bundle: parking_lot::Mutex::new(None),
            acquisition: tokio::sync::Mutex::new(()),
            event_sender,
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    /// Subscribe to media events
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_sender.subscribe()
    }

    /// Current bundle
    #[must_use]
    pub fn bundle(&self) -> Option<MediaBundle> {
        self.bundle.lock().clone()
    }

    /// Whether the bundle covers a call kind
    #[must_use]
    pub fn has_media_for(&self, kind: CallKind) -> bool {
        self.bundle
            .lock()
            .as_ref()
            .is_some_and(|b| b.satisfies(&AcquireConfig::for_call(kind, self.config.orientation)))
    }

    /// Acquire local media, walking the fallback chain.
    ///
    /// An existing bundle that satisfies the request is returned unchanged;
    /// a bundle lacking a requested kind is completed in place.
    ///
    /// # Errors
    ///
    /// Returns error only if no step, including synthesis, yields a track.
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, config: AcquireConfig) -> Result<MediaBundle, MediaError> {
        let _serial = self.acquisition.lock().await;

        let existing = self.bundle().unwrap_or_default();
        if existing.satisfies(&config) && !existing.is_empty() {
            return Ok(existing);
        }
        let want_audio = config.audio && existing.audio.is_none();
        let want_video = config.video && existing.video.is_none();

        let captured = self
            .capture_with_fallback(want_audio, want_video, config.orientation)
            .await?;

        let bundle = {
            let mut guard = self.bundle.lock();
            let bundle = guard.get_or_insert_with(MediaBundle::default);
            if let Some(audio) = captured.audio {
                self.announce(&audio);
                bundle.audio = Some(audio);
            }
            if let Some(video) = captured.video {
                self.announce(&video);
                bundle.video = Some(video);
            }
            bundle.clone()
        };

        tracing::info!(
            audio = bundle.audio.is_some(),
            video = bundle.video.is_some(),
            source = ?bundle.source_kind(),
            "Local media acquired"
        );
        Ok(bundle)
    }

    async fn capture_with_fallback(
        &self,
        audio: bool,
        video: bool,
        orientation: Orientation,
    ) -> Result<Captured, MediaError> {
        let audio_profile = if video {
            AudioConstraints::standard()
        } else {
            AudioConstraints::voice()
        };

        let attempts = [
            (
                None,
                CaptureConstraints {
                    audio: audio.then_some(audio_profile),
                    video: video.then(|| VideoConstraints::full(orientation, self.config.frame_rate)),
                },
            ),
            (
                Some(FallbackStep::Relaxed),
                CaptureConstraints {
                    audio: audio.then_some(audio_profile),
                    video: video.then(|| VideoConstraints::relaxed(orientation)),
                },
            ),
        ];

        for (step, constraints) in attempts {
            match self.backend.capture(&constraints).await {
                Ok(tracks) => {
                    let mut captured = Captured::default();
                    captured.absorb(tracks);
                    let complete = (!audio || captured.audio.is_some())
                        && (!video || captured.video.is_some());
                    if complete {
                        if let Some(step) = step {
                            self.fallback_used(step);
                        }
                        return Ok(captured);
                    }
                    tracing::debug!(step = ?step, "Capture yielded incomplete bundle");
                    captured.stop_all();
                }
                Err(e) => tracing::debug!(step = ?step, error = %e, "Capture attempt failed"),
            }
        }

        let mut captured = Captured::default();
        let mut last_error = None;
        if audio {
            let constraints = CaptureConstraints {
                audio: Some(AudioConstraints::voice()),
                video: None,
            };
            match self.backend.capture(&constraints).await {
                Ok(tracks) => captured.absorb(tracks),
                Err(e) => {
                    tracing::warn!(error = %e, "Audio-only capture failed");
                    last_error = Some(e);
                }
            }
        }
        if video {
            let constraints = CaptureConstraints {
                audio: None,
                video: Some(VideoConstraints::raw()),
            };
            match self.backend.capture(&constraints).await {
                Ok(tracks) => captured.absorb(tracks),
                Err(e) => {
                    tracing::warn!(error = %e, "Raw video capture failed");
                    last_error = Some(e);
                }
            }
        }
        if captured.audio.is_some() || captured.video.is_some() {
            self.fallback_used(FallbackStep::Separate);
        }

        if video && captured.video.is_none() {
            let track = MediaTrack::synthetic_video(
                self.config.synthetic_width,
                self.config.synthetic_height,
                self.config.frame_rate,
            )?;
            tracing::warn!("No camera reachable, using synthetic video");
            captured.video = Some(Arc::new(track));
            self.fallback_used(FallbackStep::Synthetic);
        }

        if captured.audio.is_none() && captured.video.is_none() {
            return Err(last_error.unwrap_or_else(|| MediaError::NoDevices("audio".to_string())));
        }
        Ok(captured)
    }

    fn announce(&self, track: &Arc<MediaTrack>) {
        tracing::debug!(track_id = %track.id(), kind = ?track.kind(), source = ?track.source(), "Track started");
        let _ = self.event_sender.send(MediaEvent::TrackStarted {
            track_id: track.id().to_string(),
            kind: track.kind(),
            source: track.source(),
        });
    }

    fn fallback_used(&self, step: FallbackStep) {
        tracing::info!(step = ?step, "Media fallback used");
        let _ = self.event_sender.send(MediaEvent::FallbackUsed { step });
    }

    /// Flip a track's enabled flag without renegotiation.
    ///
    /// Enabling video with no video track acquires one; the caller attaches
    /// it to live senders.
    ///
    /// # Errors
    ///
    /// Returns error if on-demand acquisition fails
    #[tracing::instrument(skip(self))]
    pub async fn toggle(&self, kind: TrackKind, enabled: bool) -> Result<ToggleOutcome, MediaError> {
        if let Some(track) = self.bundle().and_then(|b| b.track(kind).cloned()) {
            track.set_enabled(enabled);
            tracing::debug!(track_id = %track.id(), enabled, "Track toggled");
            return Ok(ToggleOutcome::Toggled(track));
        }
        if kind != TrackKind::Video || !enabled {
            return Ok(ToggleOutcome::NoTrack);
        }

        let config = AcquireConfig {
            audio: false,
            video: true,
            orientation: self.config.orientation,
        };
        let bundle = self.acquire(config).await?;
        bundle
            .video
            .map(ToggleOutcome::Acquired)
            .ok_or_else(|| MediaError::NoDevices("video".to_string()))
    }

    /// Move to the next video device in rotation.
    ///
    /// The new track is placed in the bundle; the previous one is returned
    /// for the caller to stop after replacing senders (see [`Self::retire`]).
    ///
    /// # Errors
    ///
    /// Returns error if no video device exists or capture fails
    #[tracing::instrument(skip(self))]
    pub async fn switch_source(&self) -> Result<SourceSwitch, MediaError> {
        let _serial = self.acquisition.lock().await;

        let cameras: Vec<CaptureDevice> = self
            .backend
            .enumerate_devices()
            .await?
            .into_iter()
            .filter(|d| d.kind == TrackKind::Video)
            .collect();
        if cameras.is_empty() {
            return Err(MediaError::NoDevices("video".to_string()));
        }

        let previous = self.bundle().and_then(|b| b.video);
        let current_id = previous.as_ref().and_then(|t| t.device_id().map(str::to_string));
        let next_index = current_id
            .and_then(|id| cameras.iter().position(|d| d.id == id))
            .map_or(0, |i| (i + 1) % cameras.len());
        let next = &cameras[next_index];

        let orientation = self.config.orientation;
        let full = CaptureConstraints {
            audio: None,
            video: Some(VideoConstraints::full(orientation, self.config.frame_rate).on_device(&next.id)),
        };
        let tracks = match self.backend.capture(&full).await {
            Ok(tracks) => tracks,
            Err(e) => {
                tracing::debug!(error = %e, "Full constraints failed on switch, relaxing");
                let relaxed = CaptureConstraints {
                    audio: None,
                    video: Some(VideoConstraints::relaxed(orientation).on_device(&next.id)),
                };
                self.backend.capture(&relaxed).await?
            }
        };
        let current = tracks
            .into_iter()
            .find(|t| t.kind() == TrackKind::Video)
            .ok_or_else(|| MediaError::Capture(format!("device {} yielded no video", next.id)))?;
        if let Some(previous) = &previous {
            current.set_enabled(previous.is_enabled());
        }

        self.bundle
            .lock()
            .get_or_insert_with(MediaBundle::default)
            .video = Some(current.clone());
        self.announce(&current);
        let _ = self.event_sender.send(MediaEvent::SourceSwitched {
            device_id: next.id.clone(),
        });
        tracing::info!(device_id = %next.id, "Video source switched");

        Ok(SourceSwitch { previous, current })
    }

    /// Stop a track removed from the bundle
    pub fn retire(&self, track: &Arc<MediaTrack>) {
        if track.stop() {
            let _ = self.event_sender.send(MediaEvent::TrackStopped {
                track_id: track.id().to_string(),
                kind: track.kind(),
            });
        }
    }

    /// Stop every track and discard the bundle; idempotent
    pub fn release(&self) {
        let Some(bundle) = self.bundle.lock().take() else {
            return;
        };
        for track in bundle.tracks() {
            self.retire(track);
        }
        tracing::info!("Local media released");
    }
}
