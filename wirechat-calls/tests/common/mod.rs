//! Shared test harness: scripted media backend, recording message sink, and
//! relay-wired clients.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wirechat_calls::{
    CallEvent, CallKind, CallService, CallSnapshot, CallStatus, CandidateInit, ChannelId,
    ChatMessageSink, ConversationTarget, LocalMedia, LocalRelay, MediaBackend, MediaError,
    NegotiationState, PeerEvent, PeerInfo, PeerLink, RelayClient, SdpType, SignalEnvelope,
    SignalingError, SignalingTransport, StreamHandle, SummaryError, UserId,
};

/// Local capture stream with scripted flags
pub struct MockMedia {
    pub id: String,
    pub video: bool,
    pub stopped: Mutex<bool>,
    pub audio_enabled: Mutex<bool>,
    pub video_enabled: Mutex<bool>,
}

impl LocalMedia for MockMedia {
    fn handle(&self) -> StreamHandle {
        StreamHandle {
            id: self.id.clone(),
        }
    }

    fn set_audio_enabled(&self, enabled: bool) {
        *self.audio_enabled.lock() = enabled;
    }

    fn set_video_enabled(&self, enabled: bool) {
        *self.video_enabled.lock() = enabled;
    }

    fn has_video(&self) -> bool {
        self.video
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Peer link that records every operation and lets tests inject events
pub struct MockLink {
    pub state: Mutex<NegotiationState>,
    pub remote_descriptions: Mutex<Vec<(SdpType, String)>>,
    pub candidates: Mutex<Vec<CandidateInit>>,
    pub reject_candidates: Mutex<HashSet<String>>,
    pub closed: Mutex<bool>,
    pub events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
}

impl MockLink {
    fn new(events: mpsc::UnboundedSender<PeerEvent>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NegotiationState::Stable),
            remote_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            reject_candidates: Mutex::new(HashSet::new()),
            closed: Mutex::new(false),
            events: Mutex::new(Some(events)),
        })
    }

    /// Inject a peer event as if a platform callback fired
    pub fn inject(&self, event: PeerEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.candidates.lock().iter().map(|c| c.candidate.clone()).collect()
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&self) -> Result<String, MediaError> {
        *self.state.lock() = NegotiationState::HaveLocalOffer;
        Ok("v=0\r\nmock-offer\r\n".to_string())
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        *self.state.lock() = NegotiationState::Stable;
        Ok("v=0\r\nmock-answer\r\n".to_string())
    }

    async fn set_remote_description(&self, kind: SdpType, sdp: &str) -> Result<(), MediaError> {
        self.remote_descriptions.lock().push((kind, sdp.to_string()));
        *self.state.lock() = match kind {
            SdpType::Offer => NegotiationState::HaveRemoteOffer,
            SdpType::Answer => NegotiationState::Stable,
        };
        Ok(())
    }

    async fn add_candidate(&self, candidate: CandidateInit) -> Result<(), MediaError> {
        if self.reject_candidates.lock().contains(&candidate.candidate) {
            return Err(MediaError::Candidate("scripted failure".to_string()));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    fn negotiation_state(&self) -> NegotiationState {
        *self.state.lock()
    }

    async fn close(&self) {
        *self.closed.lock() = true;
        *self.state.lock() = NegotiationState::Closed;
        // Detach the event sender so pump tasks wind down.
        self.events.lock().take();
    }
}

/// Scripted failure mode for media acquisition
#[derive(Clone, Copy)]
pub enum AcquireFailure {
    PermissionDenied,
    Unavailable,
}

/// Media backend whose links and streams are fully scripted
#[derive(Default)]
pub struct MockBackend {
    pub acquire_failure: Mutex<Option<AcquireFailure>>,
    pub media: Mutex<Vec<Arc<MockMedia>>>,
    pub links: Mutex<Vec<Arc<MockLink>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_link(&self) -> Arc<MockLink> {
        self.links.lock().last().cloned().expect("no link created")
    }

    pub fn last_media(&self) -> Arc<MockMedia> {
        self.media.lock().last().cloned().expect("no media acquired")
    }
}

#[async_trait]
impl MediaBackend for MockBackend {
    async fn acquire_media(&self, kind: CallKind) -> Result<Arc<dyn LocalMedia>, MediaError> {
        match *self.acquire_failure.lock() {
            Some(AcquireFailure::PermissionDenied) => return Err(MediaError::PermissionDenied),
            Some(AcquireFailure::Unavailable) => {
                return Err(MediaError::Unavailable(
                    "no capture devices on this platform".to_string(),
                ))
            }
            None => {}
        }

        let media = Arc::new(MockMedia {
            id: format!("stream-{}", self.media.lock().len()),
            video: kind.has_video(),
            stopped: Mutex::new(false),
            audio_enabled: Mutex::new(true),
            video_enabled: Mutex::new(true),
        });
        self.media.lock().push(media.clone());
        Ok(media)
    }

    async fn connect(
        &self,
        _local: Arc<dyn LocalMedia>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, MediaError> {
        let link = MockLink::new(events);
        self.links.lock().push(link.clone());
        Ok(link)
    }
}

/// Message sink that records summaries and can be scripted to fail
#[derive(Default)]
pub struct RecordingSink {
    pub messages: Mutex<Vec<SummaryMessage>>,
    pub fail: Mutex<bool>,
}

#[derive(Debug, Clone)]
pub struct SummaryMessage {
    pub target: ConversationTarget,
    pub text: String,
    pub message_type: String,
    pub meta: serde_json::Value,
}

#[async_trait]
impl ChatMessageSink for RecordingSink {
    async fn send_chat_message(
        &self,
        target: ConversationTarget,
        text: &str,
        message_type: &str,
        meta: serde_json::Value,
    ) -> Result<(), SummaryError> {
        if *self.fail.lock() {
            return Err(SummaryError::SinkFailed("scripted".to_string()));
        }
        self.messages.lock().push(SummaryMessage {
            target,
            text: text.to_string(),
            message_type: message_type.to_string(),
            meta,
        });
        Ok(())
    }
}

/// Transport wrapper that can be scripted to fail sends
pub struct FlakyTransport {
    pub inner: Arc<RelayClient>,
    pub fail: Mutex<bool>,
}

impl FlakyTransport {
    pub fn new(inner: Arc<RelayClient>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail: Mutex::new(false),
        })
    }
}

#[async_trait]
impl SignalingTransport for FlakyTransport {
    async fn publish(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        if *self.fail.lock() {
            return Err(SignalingError::SendFailed("scripted outage".to_string()));
        }
        self.inner.publish(envelope).await
    }
}

/// A relay-wired client with scripted media and a recording sink
pub struct TestClient {
    pub service: CallService,
    pub relay_client: Arc<RelayClient>,
    pub backend: Arc<MockBackend>,
    pub sink: Arc<RecordingSink>,
}

impl TestClient {
    pub fn new(relay: &LocalRelay, id: i64, name: &str) -> Self {
        let me = PeerInfo {
            id: UserId(id),
            name: name.to_string(),
            avatar_url: None,
        };
        let relay_client = Arc::new(relay.connect(me.id));
        let backend = MockBackend::new();
        let sink = Arc::new(RecordingSink::default());

        let service = CallService::builder(me)
            .with_transport(relay_client.clone())
            .with_media_backend(backend.clone())
            .with_message_sink(sink.clone())
            .build()
            .expect("service builds");

        // Pump inbound envelopes into the state machine.
        let pump_client = relay_client.clone();
        let pump_service = service.clone();
        tokio::spawn(async move {
            while let Some(envelope) = pump_client.recv().await {
                pump_service.handle_incoming_signal(envelope).await;
            }
        });

        Self {
            service,
            relay_client,
            backend,
            sink,
        }
    }

    pub fn subscribe(&self, channel: ChannelId) {
        self.relay_client.subscribe(channel);
    }

    pub fn summaries(&self) -> Vec<SummaryMessage> {
        self.sink.messages.lock().clone()
    }
}

/// Wire two clients over a shared one-to-one channel
pub fn direct_pair(relay: &LocalRelay, a: i64, b: i64) -> (TestClient, TestClient) {
    let first = TestClient::new(relay, a, "Ana");
    let second = TestClient::new(relay, b, "Ben");
    let channel = ChannelId::pair(UserId(a), UserId(b));
    first.subscribe(channel.clone());
    second.subscribe(channel);
    (first, second)
}

/// Wait until the client's snapshot reaches the given status
pub async fn wait_for_status(service: &CallService, status: CallStatus) -> CallSnapshot {
    let mut rx = service.snapshot();
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        rx.wait_for(|snapshot| snapshot.status == status),
    )
    .await;
    match result {
        Ok(Ok(snapshot)) => snapshot.clone(),
        _ => panic!("timed out waiting for status {status:?}"),
    }
}

/// Give spawned pumps a moment to drain
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Drain currently queued events into a vector
pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
