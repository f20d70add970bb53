//! Call service orchestration
//!
//! The presentation adapter: exposes reactive session state to the UI layer
//! and forwards UI intents into the state machine. Hosts feed every inbound
//! signaling message addressed to the current user into
//! [`CallService::handle_incoming_signal`].

use crate::call::{CallEngine, CallError};
use crate::media::{MediaBackend, MediaSessionManager};
use crate::rtc::WebRtcBackend;
use crate::signaling::{SignalEnvelope, SignalingTransport};
use crate::summary::{ChatMessageSink, SummaryReporter};
use crate::types::{CallEvent, CallId, CallKind, CallSnapshot, ConversationTarget, PeerInfo};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

/// Client-facing call service
///
/// Thin façade over the state machine; cheap to clone and share with UI
/// code.
#[derive(Clone)]
pub struct CallService {
    engine: CallEngine,
}

impl CallService {
    /// Create a builder
    #[must_use]
    pub fn builder(me: PeerInfo) -> CallServiceBuilder {
        CallServiceBuilder::new(me)
    }

    /// The local user's identity
    #[must_use]
    pub fn me(&self) -> &PeerInfo {
        self.engine.me()
    }

    /// Subscribe to the reactive session snapshot
    ///
    /// The snapshot carries status, streams, mute/camera flags, and the
    /// elapsed active-call duration.
    #[must_use]
    pub fn snapshot(&self) -> watch::Receiver<CallSnapshot> {
        self.engine.snapshot()
    }

    /// Current session snapshot
    #[must_use]
    pub fn current(&self) -> CallSnapshot {
        self.engine.snapshot().borrow().clone()
    }

    /// Subscribe to call events and notices
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.engine.subscribe_events()
    }

    /// Start a call to a conversation
    ///
    /// # Errors
    ///
    /// Propagates [`CallError`] from the state machine.
    #[tracing::instrument(skip(self))]
    pub async fn start_call(
        &self,
        target: ConversationTarget,
        kind: CallKind,
    ) -> Result<CallId, CallError> {
        self.engine.start_call(target, kind).await
    }

    /// Accept the pending incoming call
    ///
    /// # Errors
    ///
    /// Propagates [`CallError`] from the state machine.
    #[tracing::instrument(skip(self))]
    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.engine.accept_call().await
    }

    /// Reject the pending incoming call
    ///
    /// # Errors
    ///
    /// Propagates [`CallError`] from the state machine.
    #[tracing::instrument(skip(self))]
    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.engine.reject_call().await
    }

    /// Hang up the current session; a no-op when idle
    #[tracing::instrument(skip(self))]
    pub async fn hang_up(&self) {
        self.engine.hang_up().await;
    }

    /// Toggle the microphone
    pub async fn toggle_mute(&self) {
        self.engine.toggle_mute().await;
    }

    /// Toggle the camera
    pub async fn toggle_camera(&self) {
        self.engine.toggle_camera().await;
    }

    /// Process one inbound signaling message addressed to the current user
    pub async fn handle_incoming_signal(&self, envelope: SignalEnvelope) {
        self.engine.handle_signal(envelope).await;
    }

    /// Spawn a pump that feeds envelopes from a channel into the state
    /// machine until the channel closes
    pub fn spawn_inbound(&self, mut signals: mpsc::UnboundedReceiver<SignalEnvelope>) {
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = signals.recv().await {
                service.handle_incoming_signal(envelope).await;
            }
        });
    }
}

/// Builder for [`CallService`]
pub struct CallServiceBuilder {
    me: PeerInfo,
    transport: Option<Arc<dyn SignalingTransport>>,
    backend: Option<Arc<dyn MediaBackend>>,
    sink: Option<Arc<dyn ChatMessageSink>>,
}

impl CallServiceBuilder {
    /// Create a builder for the local user
    #[must_use]
    pub fn new(me: PeerInfo) -> Self {
        Self {
            me,
            transport: None,
            backend: None,
            sink: None,
        }
    }

    /// Set the signaling transport (required)
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn SignalingTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the media backend; defaults to [`WebRtcBackend`]
    #[must_use]
    pub fn with_media_backend(mut self, backend: Arc<dyn MediaBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the chat message sink for call summaries (required)
    #[must_use]
    pub fn with_message_sink(mut self, sink: Arc<dyn ChatMessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns an error naming the missing collaborator, if any.
    pub fn build(self) -> anyhow::Result<CallService> {
        let transport = self
            .transport
            .ok_or_else(|| anyhow::anyhow!("a signaling transport is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| anyhow::anyhow!("a chat message sink is required"))?;
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(WebRtcBackend::new()));

        let media = Arc::new(MediaSessionManager::new(backend));
        let reporter = Arc::new(SummaryReporter::new(sink));
        let engine = CallEngine::new(self.me, transport, media, reporter);

        Ok(CallService { engine })
    }
}
