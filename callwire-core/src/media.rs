//! Local capture and media stream handles
//!
//! A [`CaptureDevice`] is the host capability that opens capture tracks. The
//! [`MediaCaptureAdapter`] sits on top of it and enforces the session rules:
//! one live local stream at a time, idempotent release, and track toggling.
//!
//! [`MediaStreamHandle`] is a cheap, cloneable handle. Clones share the same
//! tracks, so stopping or disabling a track through one handle is visible
//! through every clone (including the ones published on the event bus).

use crate::types::{MediaConstraints, TrackKind};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[cfg(feature = "webrtc-backend")]
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The platform refused access to the device
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A local stream is already held; release it first
    #[error("Capture already acquired: {0}")]
    AlreadyAcquired(String),

    /// Neither audio nor video was requested
    #[error("No track kinds requested")]
    NothingRequested,

    /// Stream error
    #[error("Stream error: {0}")]
    StreamError(String),
}

/// Whether a stream was captured locally or received from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    /// Captured on this endpoint
    Local,
    /// Received from the remote peer
    Remote,
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
    #[cfg(feature = "webrtc-backend")]
    rtc: Option<Arc<TrackLocalStaticSample>>,
}

/// A single audio or video track
#[derive(Debug, Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a live, enabled track
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
                #[cfg(feature = "webrtc-backend")]
                rtc: None,
            }),
        }
    }

    /// Create a track backed by a `webrtc` sample track
    #[cfg(feature = "webrtc-backend")]
    pub fn with_rtc_track(
        id: impl Into<String>,
        kind: TrackKind,
        track: Arc<TrackLocalStaticSample>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
                rtc: Some(track),
            }),
        }
    }

    /// The `webrtc` sample track this track feeds, if any
    #[cfg(feature = "webrtc-backend")]
    #[must_use]
    pub fn rtc_track(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.inner.rtc.as_ref()
    }

    /// Write one encoded media sample to the peer
    ///
    /// Disabled or stopped tracks silently drop the sample.
    ///
    /// # Errors
    ///
    /// Returns error if the track has no sample sink or the write fails
    #[cfg(feature = "webrtc-backend")]
    pub async fn write_sample(
        &self,
        data: bytes::Bytes,
        duration: std::time::Duration,
    ) -> Result<(), MediaError> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(());
        }
        let track = self
            .rtc_track()
            .ok_or_else(|| MediaError::StreamError(format!("track {} has no sink", self.id())))?;

        let sample = webrtc::media::Sample {
            data,
            duration,
            ..Default::default()
        };
        track
            .write_sample(&sample)
            .await
            .map_err(|e| MediaError::StreamError(e.to_string()))
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Audio or video
    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Whether the track currently carries media
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Enable or mute the track without stopping it
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the track has not been stopped yet
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Stop the track; returns `false` if it was already stopped
    pub fn stop(&self) -> bool {
        let was_live = self.inner.live.swap(false, Ordering::SeqCst);
        if was_live {
            tracing::trace!(track_id = %self.inner.id, kind = %self.inner.kind, "Track stopped");
        }
        was_live
    }
}

#[derive(Debug)]
struct StreamInner {
    id: String,
    origin: StreamOrigin,
    tracks: RwLock<Vec<MediaTrack>>,
}

/// Shared handle to a local or remote media stream
#[derive(Debug, Clone)]
pub struct MediaStreamHandle {
    inner: Arc<StreamInner>,
}

impl MediaStreamHandle {
    /// Wrap a set of tracks into a stream
    pub fn new(id: impl Into<String>, origin: StreamOrigin, tracks: Vec<MediaTrack>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                origin,
                tracks: RwLock::new(tracks),
            }),
        }
    }

    /// Stream identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Local or remote
    #[must_use]
    pub fn origin(&self) -> StreamOrigin {
        self.inner.origin
    }

    /// Snapshot of the stream's tracks
    #[must_use]
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.inner.tracks.read().clone()
    }

    /// First track of a kind
    #[must_use]
    pub fn first_track(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.inner
            .tracks
            .read()
            .iter()
            .find(|t| t.kind() == kind)
            .cloned()
    }

    /// Number of tracks that have not been stopped
    #[must_use]
    pub fn live_track_count(&self) -> usize {
        self.inner.tracks.read().iter().filter(|t| t.is_live()).count()
    }

    /// Whether two handles refer to the same stream
    #[must_use]
    pub fn same_stream(&self, other: &MediaStreamHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn push_track(&self, track: MediaTrack) {
        self.inner.tracks.write().push(track);
    }

    /// Stop every track; returns how many were still live
    pub(crate) fn stop_all(&self) -> usize {
        self.inner
            .tracks
            .read()
            .iter()
            .filter(|t| t.stop())
            .count()
    }
}

/// Host capability that opens capture tracks
///
/// Implement this for the platform's camera/microphone access. The engine
/// never enumerates devices or manages permissions itself.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Open tracks satisfying the constraints
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` or `DeviceNotFound` when capture is refused
    async fn open(&self, constraints: &MediaConstraints) -> Result<Vec<MediaTrack>, MediaError>;
}

#[derive(Debug)]
enum CaptureSlot {
    Free,
    Acquiring,
    Held(String),
}

/// Acquires, releases and toggles the local capture stream
pub struct MediaCaptureAdapter {
    device: Arc<dyn CaptureDevice>,
    slot: Mutex<CaptureSlot>,
    stream_counter: AtomicU64,
}

impl MediaCaptureAdapter {
    /// Create an adapter over a capture device
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            slot: Mutex::new(CaptureSlot::Free),
            stream_counter: AtomicU64::new(0),
        }
    }

    /// Acquire a local stream with the requested track kinds
    ///
    /// # Errors
    ///
    /// Returns `AlreadyAcquired` while a previous stream is still held, or the
    /// device's error when capture is denied or a requested kind is missing.
    #[tracing::instrument(skip(self))]
    pub async fn acquire(
        &self,
        want_video: bool,
        want_audio: bool,
    ) -> Result<MediaStreamHandle, MediaError> {
        if !want_video && !want_audio {
            return Err(MediaError::NothingRequested);
        }

        {
            let mut slot = self.slot.lock();
            match &*slot {
                CaptureSlot::Free => *slot = CaptureSlot::Acquiring,
                CaptureSlot::Acquiring => {
                    return Err(MediaError::AlreadyAcquired("acquisition in progress".into()))
                }
                CaptureSlot::Held(id) => return Err(MediaError::AlreadyAcquired(id.clone())),
            }
        }

        let constraints = MediaConstraints {
            audio: want_audio,
            video: want_video,
        };

        let tracks = match self.device.open(&constraints).await {
            Ok(tracks) => tracks,
            Err(e) => {
                *self.slot.lock() = CaptureSlot::Free;
                tracing::warn!(error = %e, "Capture device refused");
                return Err(e);
            }
        };

        if let Some(missing) = constraints
            .to_track_kinds()
            .into_iter()
            .find(|kind| !tracks.iter().any(|t| t.kind() == *kind))
        {
            for track in &tracks {
                track.stop();
            }
            *self.slot.lock() = CaptureSlot::Free;
            return Err(MediaError::DeviceNotFound(format!("no {missing} track")));
        }

        let n = self.stream_counter.fetch_add(1, Ordering::SeqCst);
        let handle = MediaStreamHandle::new(format!("local-{n}"), StreamOrigin::Local, tracks);
        *self.slot.lock() = CaptureSlot::Held(handle.id().to_string());

        tracing::info!(
            stream_id = %handle.id(),
            tracks = handle.tracks().len(),
            "Local capture acquired"
        );
        Ok(handle)
    }

    /// Stop every track of a stream and free the capture slot
    ///
    /// Releasing an already-released stream stops nothing and returns 0.
    pub fn release(&self, handle: &MediaStreamHandle) -> usize {
        let stopped = handle.stop_all();
        let mut slot = self.slot.lock();
        if matches!(&*slot, CaptureSlot::Held(id) if id == handle.id()) {
            *slot = CaptureSlot::Free;
        }
        drop(slot);

        if stopped > 0 {
            tracing::debug!(stream_id = %handle.id(), stopped, "Local capture released");
        }
        stopped
    }

    /// Flip `enabled` on the first track of `kind` and return the new value
    ///
    /// Returns `false` without side effects when the stream has no such track.
    pub fn toggle_track_kind(&self, handle: &MediaStreamHandle, kind: TrackKind) -> bool {
        match handle.first_track(kind) {
            Some(track) => {
                let enabled = !track.is_enabled();
                track.set_enabled(enabled);
                tracing::debug!(track_id = %track.id(), %kind, enabled, "Track toggled");
                enabled
            }
            None => false,
        }
    }

    /// Whether a local stream is currently held
    #[must_use]
    pub fn is_holding(&self) -> bool {
        !matches!(&*self.slot.lock(), CaptureSlot::Free)
    }
}
