//! WebRTC media backend
//!
//! Production implementation of the [`crate::media`] backend traits over
//! webrtc-rs. Connections are configured with a fixed set of public STUN
//! servers for NAT traversal; platform callbacks are adapted onto the
//! session's [`PeerEvent`] channel so the state machine processes them in
//! order with everything else.

use crate::media::{LocalMedia, MediaBackend, MediaError, NegotiationState, PeerEvent, PeerLink};
use crate::signaling::{CandidateInit, SdpType};
use crate::types::{CallKind, StreamHandle};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Public STUN servers used for NAT traversal
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Backend configuration
#[derive(Debug, Clone)]
pub struct RtcConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// webrtc-rs implementation of [`MediaBackend`]
#[derive(Debug, Default)]
pub struct WebRtcBackend {
    config: RtcConfig,
}

impl WebRtcBackend {
    /// Create a backend with the default STUN configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend with a custom ICE server set
    #[must_use]
    pub fn with_config(config: RtcConfig) -> Self {
        Self { config }
    }
}

/// Local capture stream backed by webrtc-rs static-sample tracks
///
/// Track enablement is tracked as flags consulted by the sample writers;
/// `stop` flips the tracks to disabled and marks the stream dead.
pub struct WebRtcLocalMedia {
    stream_id: String,
    audio: Arc<TrackLocalStaticSample>,
    video: Option<Arc<TrackLocalStaticSample>>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    stopped: AtomicBool,
}

impl WebRtcLocalMedia {
    fn new(kind: CallKind) -> Self {
        let stream_id = format!("wirechat-{}", uuid::Uuid::new_v4());

        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            stream_id.clone(),
        ));

        let video = kind.has_video().then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                "video".to_owned(),
                stream_id.clone(),
            ))
        });

        Self {
            stream_id,
            audio,
            video,
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// Whether the microphone track is currently enabled
    #[must_use]
    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Relaxed) && !self.stopped.load(Ordering::Relaxed)
    }

    /// Whether the camera track is currently enabled
    #[must_use]
    pub fn video_enabled(&self) -> bool {
        self.video.is_some()
            && self.video_enabled.load(Ordering::Relaxed)
            && !self.stopped.load(Ordering::Relaxed)
    }
}

impl LocalMedia for WebRtcLocalMedia {
    fn handle(&self) -> StreamHandle {
        StreamHandle {
            id: self.stream_id.clone(),
        }
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::Relaxed);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::Relaxed);
    }

    fn has_video(&self) -> bool {
        self.video.is_some()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// One webrtc-rs peer connection
pub struct WebRtcPeerLink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for WebRtcPeerLink {
    async fn create_offer(&self) -> Result<String, MediaError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MediaError::Backend(format!("create_offer: {e}")))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| MediaError::Backend(format!("set_local_description: {e}")))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::Backend(format!("create_answer: {e}")))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| MediaError::Backend(format!("set_local_description: {e}")))?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(&self, kind: SdpType, sdp: &str) -> Result<(), MediaError> {
        let description = match kind {
            SdpType::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpType::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|e| MediaError::Backend(format!("invalid sdp: {e}")))?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| MediaError::Backend(format!("set_remote_description: {e}")))
    }

    async fn add_candidate(&self, candidate: CandidateInit) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| MediaError::Candidate(e.to_string()))
    }

    fn negotiation_state(&self) -> NegotiationState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => NegotiationState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => NegotiationState::HaveRemoteOffer,
            RTCSignalingState::Closed => NegotiationState::Closed,
            _ => NegotiationState::Stable,
        }
    }

    async fn close(&self) {
        // Detach callbacks before closing, so nothing fires into a session
        // that is being torn down.
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));

        if let Err(e) = self.pc.close().await {
            tracing::warn!(error = %e, "Error closing peer connection");
        }
    }
}

#[async_trait]
impl MediaBackend for WebRtcBackend {
    async fn acquire_media(&self, kind: CallKind) -> Result<Arc<dyn LocalMedia>, MediaError> {
        tracing::debug!(?kind, "Acquiring local capture");
        Ok(Arc::new(WebRtcLocalMedia::new(kind)))
    }

    async fn connect(
        &self,
        local: Arc<dyn LocalMedia>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, MediaError> {
        let local = local
            .as_any()
            .downcast_ref::<WebRtcLocalMedia>()
            .ok_or_else(|| MediaError::Backend("local media from a different backend".to_string()))?;

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::Unavailable(format!("codec registration: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| MediaError::Backend(format!("interceptor registry: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| MediaError::Backend(format!("new_peer_connection: {e}")))?,
        );

        pc.add_track(Arc::clone(&local.audio) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| MediaError::Backend(format!("add audio track: {e}")))?;
        if let Some(video) = &local.video {
            pc.add_track(Arc::clone(video) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| MediaError::Backend(format!("add video track: {e}")))?;
        }

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::trace!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::CandidateDiscovered(CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Dropping unserializable candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(PeerEvent::RemoteStream(StreamHandle { id: track.id() }));
            })
        }));

        let tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                tracing::debug!(?state, "Peer connection state changed");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected
                ) {
                    let _ = tx.send(PeerEvent::ConnectionLost);
                }
            })
        }));

        Ok(Arc::new(WebRtcPeerLink { pc }))
    }
}
