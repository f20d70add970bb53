//! Media session management
//!
//! Owns the peer connection and the local capture stream for the one active
//! call session, queues ICE candidates that arrive before the remote
//! description is set, and guarantees release of both resources on every
//! teardown path.
//!
//! # Architecture
//!
//! The module provides a backend trait seam so the state machine never
//! touches platform media types directly:
//!
//! - [`MediaBackend`] acquires capture media and opens peer connections.
//! - [`PeerLink`] is one peer connection: SDP negotiation primitives,
//!   candidate application, close.
//! - [`LocalMedia`] is the local capture stream: track enablement and stop.
//!
//! The production implementation lives in [`crate::rtc`]; tests script a
//! mock backend.

use crate::signaling::{CandidateInit, SdpType};
use crate::types::{CallKind, StreamHandle};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Media-related errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// The platform offers no capture capability
    #[error("Media capture unavailable: {0}")]
    Unavailable(String),

    /// The user declined the capture permission prompt
    #[error("Media permission denied")]
    PermissionDenied,

    /// The peer connection backend failed an operation
    #[error("Peer connection error: {0}")]
    Backend(String),

    /// A single ICE candidate could not be applied (non-fatal)
    #[error("Candidate rejected: {0}")]
    Candidate(String),

    /// The operation requires a peer connection, but none exists
    #[error("No media session")]
    NoSession,
}

/// Negotiation state of a peer link
///
/// Only the distinctions the state machine needs: the "offer sent" state
/// gates answer acceptance, everything else is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No description pending
    Stable,
    /// A local offer has been created and sent
    HaveLocalOffer,
    /// A remote offer has been applied, answer not yet created
    HaveRemoteOffer,
    /// The link is closed
    Closed,
}

/// Events surfaced by a peer link at arbitrary times
///
/// Backends never mutate session state from their callbacks; they post one
/// of these onto the channel handed to [`MediaBackend::connect`] and the
/// state machine processes it in order with everything else.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate was discovered and should be signaled
    CandidateDiscovered(CandidateInit),
    /// The remote peer's media stream arrived
    RemoteStream(StreamHandle),
    /// The connection transitioned to failed or disconnected
    ConnectionLost,
}

/// Local capture stream handle
pub trait LocalMedia: Send + Sync {
    /// Opaque stream reference for the presentation layer
    fn handle(&self) -> StreamHandle;

    /// Enable or disable the audio tracks (mute toggle)
    fn set_audio_enabled(&self, enabled: bool);

    /// Enable or disable the video tracks (camera toggle)
    fn set_video_enabled(&self, enabled: bool);

    /// Whether this capture includes video tracks
    fn has_video(&self) -> bool;

    /// Stop all tracks; further enable calls are no-ops
    fn stop(&self);

    /// Backend-specific escape hatch for [`MediaBackend::connect`]
    fn as_any(&self) -> &dyn std::any::Any;
}

/// One peer connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create an offer and set it as the local description
    ///
    /// # Errors
    ///
    /// Returns `MediaError::Backend` if SDP generation fails.
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Create an answer and set it as the local description
    ///
    /// # Errors
    ///
    /// Returns `MediaError::Backend` if SDP generation fails.
    async fn create_answer(&self) -> Result<String, MediaError>;

    /// Apply the remote peer's session description
    ///
    /// # Errors
    ///
    /// Returns `MediaError::Backend` if the description is rejected.
    async fn set_remote_description(&self, kind: SdpType, sdp: &str) -> Result<(), MediaError>;

    /// Apply one remote ICE candidate
    ///
    /// # Errors
    ///
    /// Returns `MediaError::Candidate`; callers treat this as non-fatal.
    async fn add_candidate(&self, candidate: CandidateInit) -> Result<(), MediaError>;

    /// Current negotiation state
    fn negotiation_state(&self) -> NegotiationState;

    /// Close the connection and detach all callbacks; idempotent
    async fn close(&self);
}

/// Platform media backend
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Acquire microphone capture, plus camera capture for video calls
    ///
    /// # Errors
    ///
    /// Returns `MediaError::Unavailable` if the platform has no capture
    /// capability and `MediaError::PermissionDenied` if the user declines.
    /// Either way the call attempt is aborted; there is no retry.
    async fn acquire_media(&self, kind: CallKind) -> Result<Arc<dyn LocalMedia>, MediaError>;

    /// Open a peer connection with the local media attached
    ///
    /// Remote-track arrival, local candidate discovery, and connection-state
    /// failures are delivered as [`PeerEvent`]s on `events`.
    ///
    /// # Errors
    ///
    /// Returns `MediaError::Backend` if the connection cannot be created.
    async fn connect(
        &self,
        local: Arc<dyn LocalMedia>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, MediaError>;
}

#[derive(Default)]
struct Inner {
    local: Option<Arc<dyn LocalMedia>>,
    link: Option<Arc<dyn PeerLink>>,
    remote: Option<StreamHandle>,
    pending: VecDeque<CandidateInit>,
    remote_description_set: bool,
    muted: bool,
    camera_off: bool,
}

/// Owner of the peer connection and capture stream for the active session
///
/// At most one connection and one local stream exist at a time; both are
/// released on every teardown path before the session is reset, and
/// [`MediaSessionManager::release`] is safe to call repeatedly or when no
/// session exists.
pub struct MediaSessionManager {
    backend: Arc<dyn MediaBackend>,
    inner: Mutex<Inner>,
}

impl MediaSessionManager {
    /// Create a manager over the given backend
    #[must_use]
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Acquire local capture for a call of the given kind
    ///
    /// # Errors
    ///
    /// Propagates `MediaError::Unavailable` / `MediaError::PermissionDenied`
    /// from the backend; the caller aborts the call attempt.
    pub async fn acquire_local_media(&self, kind: CallKind) -> Result<StreamHandle, MediaError> {
        let media = self.backend.acquire_media(kind).await?;
        let handle = media.handle();

        let mut inner = self.inner.lock();
        inner.local = Some(media);
        inner.muted = false;
        inner.camera_off = false;
        Ok(handle)
    }

    /// Create the session's peer connection
    ///
    /// Requires local media to have been acquired first. Events from the
    /// connection are delivered on `events`.
    ///
    /// # Errors
    ///
    /// Returns `MediaError::NoSession` without local media, or
    /// `MediaError::Backend` from the backend.
    pub async fn create_peer_connection(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<(), MediaError> {
        let local = self
            .inner
            .lock()
            .local
            .as_ref()
            .map(Arc::clone)
            .ok_or(MediaError::NoSession)?;

        let link = self.backend.connect(local, events).await?;

        let mut inner = self.inner.lock();
        inner.link = Some(link);
        inner.remote_description_set = false;
        Ok(())
    }

    /// Create an offer on the session's connection
    ///
    /// # Errors
    ///
    /// Returns `MediaError::NoSession` if no connection exists.
    pub async fn create_offer(&self) -> Result<String, MediaError> {
        let link = self.current_link()?;
        link.create_offer().await
    }

    /// Create an answer on the session's connection
    ///
    /// # Errors
    ///
    /// Returns `MediaError::NoSession` if no connection exists.
    pub async fn create_answer(&self) -> Result<String, MediaError> {
        let link = self.current_link()?;
        link.create_answer().await
    }

    /// Apply the remote description, then drain queued candidates in FIFO
    /// arrival order
    ///
    /// A candidate that fails to apply is logged and skipped; one bad
    /// candidate must not abort a call with many viable ones.
    ///
    /// # Errors
    ///
    /// Returns `MediaError::NoSession` if no connection exists, or the
    /// backend's error if the description itself is rejected.
    pub async fn apply_remote_description(
        &self,
        kind: SdpType,
        sdp: &str,
    ) -> Result<(), MediaError> {
        let link = self.current_link()?;
        link.set_remote_description(kind, sdp).await?;

        let queued: Vec<CandidateInit> = {
            let mut inner = self.inner.lock();
            inner.remote_description_set = true;
            inner.pending.drain(..).collect()
        };

        for candidate in queued {
            if let Err(e) = link.add_candidate(candidate).await {
                tracing::warn!(error = %e, "Skipping queued candidate");
            }
        }
        Ok(())
    }

    /// Apply a candidate now, or queue it until a remote description is set
    ///
    /// Failures applying an individual candidate are logged, never
    /// propagated.
    pub async fn queue_or_apply_candidate(&self, candidate: CandidateInit) {
        let link = {
            let mut inner = self.inner.lock();
            if inner.link.is_none() || !inner.remote_description_set {
                inner.pending.push_back(candidate);
                tracing::trace!(
                    queued = inner.pending.len(),
                    "Candidate queued until remote description is set"
                );
                return;
            }
            inner.link.as_ref().map(Arc::clone)
        };

        if let Some(link) = link {
            if let Err(e) = link.add_candidate(candidate).await {
                tracing::warn!(error = %e, "Skipping candidate");
            }
        }
    }

    /// Record the remote stream surfaced by the connection
    pub fn set_remote_stream(&self, handle: StreamHandle) {
        self.inner.lock().remote = Some(handle);
    }

    /// Negotiation state of the current connection, `Closed` if none exists
    #[must_use]
    pub fn negotiation_state(&self) -> NegotiationState {
        self.inner
            .lock()
            .link
            .as_ref()
            .map_or(NegotiationState::Closed, |link| link.negotiation_state())
    }

    /// Toggle the microphone; returns the new muted flag, or `None` when no
    /// local stream exists
    pub fn toggle_mute(&self) -> Option<bool> {
        let mut inner = self.inner.lock();
        let local = inner.local.as_ref()?;
        let muted = !inner.muted;
        local.set_audio_enabled(!muted);
        inner.muted = muted;
        Some(muted)
    }

    /// Toggle the camera; returns the new camera-off flag, or `None` when no
    /// local stream exists or the capture has no video tracks
    pub fn toggle_camera(&self) -> Option<bool> {
        let mut inner = self.inner.lock();
        let local = inner.local.as_ref()?;
        if !local.has_video() {
            return None;
        }
        let camera_off = !inner.camera_off;
        local.set_video_enabled(!camera_off);
        inner.camera_off = camera_off;
        Some(camera_off)
    }

    /// Stop all media, close the connection, clear the candidate queue
    ///
    /// Safe to call repeatedly and when no session exists. The connection
    /// handle is taken out of the manager before any asynchronous cleanup,
    /// so a new session cannot race against an unfinished teardown.
    pub async fn release(&self) {
        let (local, link) = {
            let mut inner = self.inner.lock();
            inner.pending.clear();
            inner.remote = None;
            inner.remote_description_set = false;
            inner.muted = false;
            inner.camera_off = false;
            (inner.local.take(), inner.link.take())
        };

        if let Some(local) = local {
            local.stop();
        }
        if let Some(link) = link {
            link.close().await;
        }
    }

    fn current_link(&self) -> Result<Arc<dyn PeerLink>, MediaError> {
        self.inner
            .lock()
            .link
            .as_ref()
            .map(Arc::clone)
            .ok_or(MediaError::NoSession)
    }
}
