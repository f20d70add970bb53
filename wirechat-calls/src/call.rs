//! Call state machine
//!
//! The central component: holds the one call session, validates signal
//! transitions, drives offer/answer creation, and decides teardown reasons.
//!
//! # State machine
//!
//! ```text
//!            startCall                answer
//!     Idle ───────────► Outgoing ───────────► Active
//!      │ ▲                  │                    │
//!      │ │    offer         │ cancel/busy/       │ hangup/
//!      │ └─────────┐        │ local hangup       │ disconnect
//!      ▼           │        ▼                    ▼
//!   Incoming ──────┴──────► Idle ◄───────────────┘
//!         accept → Active
//!         reject → Idle
//! ```
//!
//! Every local intent, inbound signal, and peer-connection event is
//! processed under one lock, so the transition table runs as a single
//! ordered event stream even though the underlying callbacks fire at
//! arbitrary times.

use crate::media::{MediaError, MediaSessionManager, NegotiationState, PeerEvent};
use crate::signaling::{
    SdpType, SessionDescription, Signal, SignalEnvelope, SignalingError, SignalingTransport,
};
use crate::summary::{CallSummary, SummaryReporter};
use crate::types::{
    CallEvent, CallId, CallKind, CallSnapshot, CallStatus, ConversationTarget, PeerInfo,
    StreamHandle, SummaryReason,
};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};

/// Call state machine errors
#[derive(Error, Debug)]
pub enum CallError {
    /// A non-idle session already exists; no call waiting or merging
    #[error("Another call is already active")]
    AlreadyInCall,

    /// The intent is not valid for the current status
    #[error("Invalid call state")]
    InvalidState,

    /// Media acquisition or peer connection failure
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Signal could not be delivered
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

/// The one active session, owned exclusively by the engine
struct Session {
    call_id: CallId,
    kind: CallKind,
    target: ConversationTarget,
    /// Remote participant, once known (offer sender, or answer sender)
    peer: Option<PeerInfo>,
    is_initiator: bool,
    status: CallStatus,
    /// Remote offer buffered until the local user accepts
    pending_remote_description: Option<SessionDescription>,
    /// Set the instant the session reaches `Active`
    connected_at: Option<Instant>,
    muted: bool,
    camera_off: bool,
    local_stream: Option<StreamHandle>,
    remote_stream: Option<StreamHandle>,
}

impl Session {
    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            status: self.status,
            call_id: Some(self.call_id),
            kind: self.kind,
            target: Some(self.target),
            peer: self.peer.clone(),
            is_initiator: self.is_initiator,
            muted: self.muted,
            camera_off: self.camera_off,
            local_stream: self.local_stream.clone(),
            remote_stream: self.remote_stream.clone(),
            connected_at: self.connected_at,
        }
    }
}

/// Summary reason for a locally-driven teardown of the given status
///
/// The same mapping covers connection loss: an `Active` call that drops
/// still happened and is recorded with its duration.
fn local_hangup_reason(status: CallStatus) -> SummaryReason {
    match status {
        CallStatus::Active => SummaryReason::Completed,
        CallStatus::Outgoing => SummaryReason::Missed,
        _ => SummaryReason::Canceled,
    }
}

/// Summary reason for a remote terminal signal received in the given status
fn remote_terminal_reason(signal: &Signal, status: CallStatus) -> SummaryReason {
    match signal {
        Signal::Hangup if status == CallStatus::Active => SummaryReason::Completed,
        Signal::Reject => SummaryReason::Declined,
        Signal::Busy => SummaryReason::Missed,
        _ => SummaryReason::Canceled,
    }
}

/// What the remote peer did, for logging
fn remote_action_phrase(signal: &Signal) -> &'static str {
    match signal {
        Signal::Busy => "is already on another call",
        Signal::Reject => "declined the call",
        Signal::Cancel => "cancelled the call",
        Signal::Hangup => "ended the call",
        _ => "signaled",
    }
}

struct EngineInner {
    me: PeerInfo,
    transport: Arc<dyn SignalingTransport>,
    media: Arc<MediaSessionManager>,
    reporter: Arc<SummaryReporter>,
    state: Mutex<Option<Session>>,
    events: broadcast::Sender<CallEvent>,
    snapshot_tx: watch::Sender<CallSnapshot>,
}

/// Call signaling state machine
///
/// One engine per client; cheap to clone, all clones share the session. At
/// most one non-idle session exists at a time: `start_call` is rejected
/// unless the status is idle.
#[derive(Clone)]
pub struct CallEngine {
    inner: Arc<EngineInner>,
}

impl CallEngine {
    /// Create an engine for the local user
    #[must_use]
    pub fn new(
        me: PeerInfo,
        transport: Arc<dyn SignalingTransport>,
        media: Arc<MediaSessionManager>,
        reporter: Arc<SummaryReporter>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (snapshot_tx, _) = watch::channel(CallSnapshot::idle());
        Self {
            inner: Arc::new(EngineInner {
                me,
                transport,
                media,
                reporter,
                state: Mutex::new(None),
                events,
                snapshot_tx,
            }),
        }
    }

    /// The local user's identity
    #[must_use]
    pub fn me(&self) -> &PeerInfo {
        &self.inner.me
    }

    /// Subscribe to the reactive session snapshot
    #[must_use]
    pub fn snapshot(&self) -> watch::Receiver<CallSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Start a call to a conversation
    ///
    /// Acquires media, opens the peer connection, and sends the offer. The
    /// session is `Outgoing` until the remote answer (or a terminal signal)
    /// arrives.
    ///
    /// # Errors
    ///
    /// Returns `CallError::AlreadyInCall` when a session exists, or the
    /// failure that aborted the attempt. Failed attempts release every
    /// resource they acquired; no half-initialized session survives.
    pub async fn start_call(
        &self,
        target: ConversationTarget,
        kind: CallKind,
    ) -> Result<CallId, CallError> {
        let mut state = self.inner.state.lock().await;
        if state.is_some() {
            self.notify("Another call is already active");
            return Err(CallError::AlreadyInCall);
        }

        let call_id = CallId::new();
        tracing::info!(call_id = %call_id, ?kind, ?target, "Starting call");

        let local_stream = match self.inner.media.acquire_local_media(kind).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Media acquisition failed");
                self.notify(&e.to_string());
                self.inner.media.release().await;
                return Err(e.into());
            }
        };

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let setup = async {
            self.inner.media.create_peer_connection(peer_tx).await?;
            self.inner.media.create_offer().await
        };
        let sdp = match setup.await {
            Ok(sdp) => sdp,
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Call setup failed");
                self.notify("Unable to start the call");
                self.inner.media.release().await;
                return Err(e.into());
            }
        };

        self.spawn_peer_pump(call_id, peer_rx);

        *state = Some(Session {
            call_id,
            kind,
            target,
            peer: None,
            is_initiator: true,
            status: CallStatus::Outgoing,
            pending_remote_description: None,
            connected_at: None,
            muted: false,
            camera_off: false,
            local_stream: Some(local_stream.clone()),
            remote_stream: None,
        });
        self.publish_snapshot(&state);
        self.emit(CallEvent::LocalStream {
            handle: local_stream,
        });
        self.emit(CallEvent::CallInitiated {
            call_id,
            kind,
            target,
        });

        let offer = self.envelope(
            call_id,
            kind,
            Signal::Offer(SessionDescription::encode(SdpType::Offer, &sdp)),
            target,
        );
        if let Err(e) = self.inner.transport.publish(offer).await {
            tracing::warn!(call_id = %call_id, error = %e, "Offer send failed, aborting call");
            self.notify("Unable to start the call");
            self.abort_setup(&mut state).await;
            return Err(e.into());
        }

        Ok(call_id)
    }

    /// Accept the pending incoming call
    ///
    /// Acquires media, applies the buffered remote offer (draining any
    /// queued candidates), and sends the answer. The session is `Active`
    /// from here.
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` unless the status is `Incoming`,
    /// or the failure that aborted the attempt.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let mut state = self.inner.state.lock().await;
        let Some(session) = state.as_ref() else {
            return Err(CallError::InvalidState);
        };
        if session.status != CallStatus::Incoming {
            return Err(CallError::InvalidState);
        }

        let call_id = session.call_id;
        let kind = session.kind;
        let target = session.target;
        let buffered = session.pending_remote_description.clone();
        tracing::info!(call_id = %call_id, "Accepting call");

        let local_stream = match self.inner.media.acquire_local_media(kind).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Media acquisition failed");
                self.notify(&e.to_string());
                self.abort_setup(&mut state).await;
                return Err(e.into());
            }
        };

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let setup = async {
            self.inner.media.create_peer_connection(peer_tx).await?;
            if let Some(description) = &buffered {
                let sdp = description
                    .decode()
                    .map_err(|e| MediaError::Backend(e.to_string()))?;
                self.inner
                    .media
                    .apply_remote_description(SdpType::Offer, &sdp)
                    .await?;
            }
            self.inner.media.create_answer().await
        };
        let sdp = match setup.await {
            Ok(sdp) => sdp,
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Call setup failed");
                self.notify("Unable to join the call");
                self.abort_setup(&mut state).await;
                return Err(e.into());
            }
        };

        self.spawn_peer_pump(call_id, peer_rx);

        if let Some(session) = state.as_mut() {
            session.status = CallStatus::Active;
            session.connected_at = Some(Instant::now());
            session.pending_remote_description = None;
            session.local_stream = Some(local_stream.clone());
            session.muted = false;
            session.camera_off = false;
        }
        self.publish_snapshot(&state);
        self.emit(CallEvent::LocalStream {
            handle: local_stream,
        });
        self.emit(CallEvent::CallConnected { call_id });

        let answer = self.envelope(
            call_id,
            kind,
            Signal::Answer(SessionDescription::encode(SdpType::Answer, &sdp)),
            target,
        );
        if let Err(e) = self.inner.transport.publish(answer).await {
            tracing::warn!(call_id = %call_id, error = %e, "Answer send failed, aborting call");
            self.notify("Unable to join the call");
            self.abort_setup(&mut state).await;
            return Err(e.into());
        }

        Ok(())
    }

    /// Reject the pending incoming call
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` unless the status is `Incoming`.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let mut state = self.inner.state.lock().await;
        let Some(session) = state.as_ref() else {
            return Err(CallError::InvalidState);
        };
        if session.status != CallStatus::Incoming {
            return Err(CallError::InvalidState);
        }

        let reject = self.envelope(session.call_id, session.kind, Signal::Reject, session.target);
        if let Err(e) = self.inner.transport.publish(reject).await {
            tracing::warn!(error = %e, "Reject send failed, continuing teardown");
        }

        self.finish(&mut state, SummaryReason::Declined).await;
        Ok(())
    }

    /// Hang up the current session
    ///
    /// Sends `cancel` while still outgoing and `hangup` otherwise, records
    /// the matching summary reason, and tears everything down. A no-op when
    /// idle.
    pub async fn hang_up(&self) {
        let mut state = self.inner.state.lock().await;
        let Some(session) = state.as_ref() else {
            return;
        };

        let signal = if session.status == CallStatus::Outgoing {
            Signal::Cancel
        } else {
            Signal::Hangup
        };
        let reason = local_hangup_reason(session.status);

        let envelope = self.envelope(session.call_id, session.kind, signal, session.target);
        if let Err(e) = self.inner.transport.publish(envelope).await {
            tracing::warn!(error = %e, "Hangup send failed, continuing teardown");
        }

        self.finish(&mut state, reason).await;
    }

    /// Toggle the microphone; a no-op when no local stream exists
    pub async fn toggle_mute(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(muted) = self.inner.media.toggle_mute() {
            if let Some(session) = state.as_mut() {
                session.muted = muted;
            }
            self.publish_snapshot(&state);
        }
    }

    /// Toggle the camera; a no-op for audio calls or without a local stream
    pub async fn toggle_camera(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(camera_off) = self.inner.media.toggle_camera() {
            if let Some(session) = state.as_mut() {
                session.camera_off = camera_off;
            }
            self.publish_snapshot(&state);
        }
    }

    /// Process one inbound signaling message addressed to this client
    ///
    /// The host must call this for every envelope delivered by the relay.
    pub async fn handle_signal(&self, envelope: SignalEnvelope) {
        let mut state = self.inner.state.lock().await;
        tracing::debug!(
            call_id = %envelope.call_id,
            signal = envelope.signal.kind_str(),
            from = %envelope.sender.id,
            "Inbound signal"
        );

        match &envelope.signal {
            Signal::Offer(description) => {
                self.on_offer(&mut state, &envelope, description).await;
            }
            Signal::Answer(description) => {
                self.on_answer(&mut state, &envelope, description).await;
            }
            Signal::Candidate { candidate } => match state.as_ref() {
                Some(session) if session.call_id == envelope.call_id => {
                    self.inner
                        .media
                        .queue_or_apply_candidate(candidate.clone())
                        .await;
                }
                _ => {
                    tracing::debug!(
                        call_id = %envelope.call_id,
                        "Dropping candidate for unknown call"
                    );
                }
            },
            terminal => {
                let Some(session) = state.as_ref() else {
                    tracing::debug!(call_id = %envelope.call_id, "Terminal signal while idle");
                    return;
                };
                if session.call_id != envelope.call_id {
                    tracing::debug!(
                        call_id = %envelope.call_id,
                        current = %session.call_id,
                        "Ignoring terminal signal for another call"
                    );
                    return;
                }

                let reason = remote_terminal_reason(terminal, session.status);
                tracing::debug!(
                    peer = %envelope.sender.name,
                    action = remote_action_phrase(terminal),
                    "Remote peer ended the session"
                );
                self.finish(&mut state, reason).await;
            }
        }
    }

    async fn on_offer(
        &self,
        state: &mut Option<Session>,
        envelope: &SignalEnvelope,
        description: &SessionDescription,
    ) {
        // Only one offer may be in flight for a non-idle client: any other
        // offer gets an automatic busy reply and the buffered session stays
        // untouched.
        if state.is_some() {
            let reply_target = offer_target(envelope);
            tracing::debug!(call_id = %envelope.call_id, "Busy: already in a call");
            let busy = self.envelope(
                envelope.call_id,
                envelope.call_type,
                Signal::Busy,
                reply_target,
            );
            if let Err(e) = self.inner.transport.publish(busy).await {
                tracing::warn!(error = %e, "Busy reply failed");
            }
            return;
        }

        let target = offer_target(envelope);
        *state = Some(Session {
            call_id: envelope.call_id,
            kind: envelope.call_type,
            target,
            peer: Some(envelope.sender.clone()),
            is_initiator: false,
            status: CallStatus::Incoming,
            pending_remote_description: Some(description.clone()),
            connected_at: None,
            muted: false,
            camera_off: false,
            local_stream: None,
            remote_stream: None,
        });
        self.publish_snapshot(state);
        self.emit(CallEvent::IncomingCall {
            call_id: envelope.call_id,
            kind: envelope.call_type,
            from: envelope.sender.clone(),
            target,
        });
    }

    async fn on_answer(
        &self,
        state: &mut Option<Session>,
        envelope: &SignalEnvelope,
        description: &SessionDescription,
    ) {
        let Some(session) = state.as_ref() else {
            tracing::debug!(call_id = %envelope.call_id, "Answer while idle, ignored");
            return;
        };
        if session.call_id != envelope.call_id || session.status != CallStatus::Outgoing {
            tracing::warn!(
                call_id = %envelope.call_id,
                status = ?session.status,
                "Ignoring unexpected answer"
            );
            return;
        }
        // Late or duplicate answers arrive after negotiation has moved on
        // (the transport does not guarantee ordering); only the offer-sent
        // state may consume an answer.
        let negotiation = self.inner.media.negotiation_state();
        if negotiation != NegotiationState::HaveLocalOffer {
            tracing::warn!(
                call_id = %envelope.call_id,
                ?negotiation,
                "Ignoring answer outside the offer-sent state"
            );
            return;
        }

        let call_id = session.call_id;
        let applied = async {
            let sdp = description
                .decode()
                .map_err(|e| MediaError::Backend(e.to_string()))?;
            self.inner
                .media
                .apply_remote_description(SdpType::Answer, &sdp)
                .await
        };
        if let Err(e) = applied.await {
            tracing::warn!(call_id = %call_id, error = %e, "Answer could not be applied");
            self.notify("Unable to start the call");
            self.abort_setup(state).await;
            return;
        }

        if let Some(session) = state.as_mut() {
            session.status = CallStatus::Active;
            session.connected_at = Some(Instant::now());
            session.peer = Some(envelope.sender.clone());
        }
        self.publish_snapshot(state);
        self.emit(CallEvent::CallConnected { call_id });
        tracing::info!(call_id = %call_id, "Call active");
    }

    /// Process one event from the session's peer connection
    async fn handle_peer_event(&self, call_id: CallId, event: PeerEvent) {
        let mut state = self.inner.state.lock().await;
        let Some(session) = state.as_ref() else {
            return;
        };
        if session.call_id != call_id {
            tracing::debug!(call_id = %call_id, "Dropping event from a released connection");
            return;
        }

        match event {
            PeerEvent::CandidateDiscovered(candidate) => {
                let envelope = self.envelope(
                    call_id,
                    session.kind,
                    Signal::Candidate { candidate },
                    session.target,
                );
                if let Err(e) = self.inner.transport.publish(envelope).await {
                    tracing::warn!(call_id = %call_id, error = %e, "Candidate signal failed");
                }
            }
            PeerEvent::RemoteStream(handle) => {
                self.inner.media.set_remote_stream(handle.clone());
                if let Some(session) = state.as_mut() {
                    session.remote_stream = Some(handle.clone());
                }
                self.publish_snapshot(&state);
                self.emit(CallEvent::RemoteStream { handle });
            }
            PeerEvent::ConnectionLost => {
                tracing::warn!(call_id = %call_id, "Peer connection lost");
                let reason = local_hangup_reason(session.status);
                self.notify("Call disconnected");
                self.finish(&mut state, reason).await;
            }
        }
    }

    /// Tear the session down, reporting the summary exactly once
    async fn finish(&self, state: &mut Option<Session>, reason: SummaryReason) {
        let Some(session) = state.take() else {
            return;
        };

        let duration_seconds = session
            .connected_at
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);
        let initiated_by = if session.is_initiator {
            self.inner.me.id
        } else {
            session.peer.as_ref().map_or(self.inner.me.id, |p| p.id)
        };

        let summary = CallSummary {
            call_id: session.call_id,
            kind: session.kind,
            reason,
            duration_seconds,
            initiated_by,
            target: session.target,
        };
        if let Err(e) = self.inner.reporter.report_once(summary).await {
            tracing::warn!(call_id = %session.call_id, error = %e, "Unable to log call summary");
            self.notify("Unable to log call summary");
        }

        self.inner.media.release().await;
        self.publish_snapshot(state);
        self.emit(CallEvent::CallEnded {
            call_id: session.call_id,
            reason,
        });
        tracing::info!(
            call_id = %session.call_id,
            reason = reason.as_str(),
            duration = duration_seconds,
            "Call ended"
        );
    }

    /// Abort a half-built session without a summary
    async fn abort_setup(&self, state: &mut Option<Session>) {
        *state = None;
        self.inner.media.release().await;
        self.publish_snapshot(state);
    }

    fn spawn_peer_pump(&self, call_id: CallId, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                engine.handle_peer_event(call_id, event).await;
            }
        });
    }

    fn envelope(
        &self,
        call_id: CallId,
        kind: CallKind,
        signal: Signal,
        target: ConversationTarget,
    ) -> SignalEnvelope {
        let (group_id, receiver_id) = match target {
            ConversationTarget::Group(group_id) => (Some(group_id), None),
            ConversationTarget::User(user_id) => (None, Some(user_id)),
        };
        SignalEnvelope {
            call_id,
            call_type: kind,
            signal,
            group_id,
            receiver_id,
            sender: self.inner.me.clone(),
        }
    }

    fn publish_snapshot(&self, state: &Option<Session>) {
        let snapshot = state
            .as_ref()
            .map_or_else(CallSnapshot::idle, Session::snapshot);
        self.inner.snapshot_tx.send_replace(snapshot);
    }

    fn notify(&self, message: &str) {
        self.emit(CallEvent::Notice(message.to_string()));
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.inner.events.send(event);
    }
}

/// Conversation target an inbound offer addresses
fn offer_target(envelope: &SignalEnvelope) -> ConversationTarget {
    match envelope.group_id {
        Some(group_id) => ConversationTarget::Group(group_id),
        None => ConversationTarget::User(envelope.sender.id),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_local_hangup_reason_mapping() {
        assert_eq!(
            local_hangup_reason(CallStatus::Active),
            SummaryReason::Completed
        );
        assert_eq!(
            local_hangup_reason(CallStatus::Outgoing),
            SummaryReason::Missed
        );
        assert_eq!(
            local_hangup_reason(CallStatus::Incoming),
            SummaryReason::Canceled
        );
        assert_eq!(
            local_hangup_reason(CallStatus::Idle),
            SummaryReason::Canceled
        );
    }

    #[test]
    fn test_remote_terminal_reason_mapping() {
        assert_eq!(
            remote_terminal_reason(&Signal::Hangup, CallStatus::Active),
            SummaryReason::Completed
        );
        assert_eq!(
            remote_terminal_reason(&Signal::Hangup, CallStatus::Outgoing),
            SummaryReason::Canceled
        );
        assert_eq!(
            remote_terminal_reason(&Signal::Reject, CallStatus::Outgoing),
            SummaryReason::Declined
        );
        assert_eq!(
            remote_terminal_reason(&Signal::Busy, CallStatus::Outgoing),
            SummaryReason::Missed
        );
        assert_eq!(
            remote_terminal_reason(&Signal::Cancel, CallStatus::Incoming),
            SummaryReason::Canceled
        );
    }

    #[test]
    fn test_remote_action_phrases() {
        assert_eq!(
            remote_action_phrase(&Signal::Busy),
            "is already on another call"
        );
        assert_eq!(remote_action_phrase(&Signal::Reject), "declined the call");
        assert_eq!(remote_action_phrase(&Signal::Cancel), "cancelled the call");
        assert_eq!(remote_action_phrase(&Signal::Hangup), "ended the call");
    }
}
