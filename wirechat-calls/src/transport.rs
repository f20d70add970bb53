//! In-memory signaling relay
//!
//! A process-local stand-in for the chat application's broadcast relay,
//! with the same delivery contract: a published envelope is fanned out to
//! every subscriber of its channel except the sender, at most once, with no
//! retry and no cross-channel ordering. Used by the demo binary and the
//! integration tests; production deployments implement
//! [`SignalingTransport`] over the real push service instead.

use crate::signaling::{ChannelId, SignalEnvelope, SignalingError, SignalingTransport};
use crate::types::UserId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Subscriber {
    user_id: UserId,
    tx: mpsc::UnboundedSender<SignalEnvelope>,
}

/// Process-local pub/sub hub for signaling envelopes
///
/// Cheap to clone; all clones share the same channel registry.
#[derive(Clone, Default)]
pub struct LocalRelay {
    channels: Arc<Mutex<HashMap<ChannelId, Vec<Subscriber>>>>,
}

impl LocalRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a client to the relay
    ///
    /// The returned handle subscribes to channels and receives everything
    /// published to them by other users.
    #[must_use]
    pub fn connect(&self, user_id: UserId) -> RelayClient {
        let (tx, rx) = mpsc::unbounded_channel();
        RelayClient {
            user_id,
            relay: self.clone(),
            inbox_tx: tx,
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    fn deliver(&self, envelope: &SignalEnvelope) {
        let channel = envelope.channel();
        let mut channels = self.channels.lock();
        let Some(subscribers) = channels.get_mut(&channel) else {
            tracing::debug!(channel = %channel, "No subscribers for signal");
            return;
        };

        // Drop subscribers whose inbox has gone away while fanning out.
        subscribers.retain(|sub| {
            if sub.user_id == envelope.sender.id {
                return true;
            }
            sub.tx.send(envelope.clone()).is_ok()
        });
    }
}

/// One client's handle on the [`LocalRelay`]
pub struct RelayClient {
    user_id: UserId,
    relay: LocalRelay,
    inbox_tx: mpsc::UnboundedSender<SignalEnvelope>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalEnvelope>>,
}

impl RelayClient {
    /// The user this client is connected as
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Subscribe to a channel
    ///
    /// Envelopes published to the channel by other users are delivered to
    /// this client's inbox. Subscribing twice to the same channel is a
    /// no-op.
    pub fn subscribe(&self, channel: ChannelId) {
        let mut channels = self.relay.channels.lock();
        let subscribers = channels.entry(channel).or_default();
        if subscribers.iter().any(|s| s.user_id == self.user_id) {
            return;
        }
        subscribers.push(Subscriber {
            user_id: self.user_id,
            tx: self.inbox_tx.clone(),
        });
    }

    /// Receive the next inbound envelope
    ///
    /// Returns `None` once the client has been disconnected.
    pub async fn recv(&self) -> Option<SignalEnvelope> {
        self.inbox.lock().await.recv().await
    }
}

#[async_trait]
impl SignalingTransport for RelayClient {
    async fn publish(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        tracing::trace!(
            channel = %envelope.channel(),
            signal = envelope.signal.kind_str(),
            call_id = %envelope.call_id,
            "Publishing signal"
        );
        self.relay.deliver(&envelope);
        Ok(())
    }
}
