//! Wirechat Calls - call signaling and peer-connection lifecycle
//!
//! This library implements the client-side call core of the Wirechat
//! messenger: the state machine that negotiates a peer-to-peer WebRTC
//! session between two call participants over a relayed signaling channel.
//! It features:
//!
//! - **Single-session state machine**: idle → outgoing/incoming → active,
//!   with busy replies, stale-answer protection, and clean teardown on
//!   every exit path
//! - **Candidate queueing**: ICE candidates arriving before the remote
//!   description are buffered and drained in arrival order
//! - **Call summaries**: one chat message per ended call, with outcome and
//!   duration metadata
//! - **Reactive presentation state**: a watch channel carries status,
//!   streams, mute flags, and elapsed duration to the UI layer
//!
//! # Examples
//!
//! ```rust,no_run
//! use wirechat_calls::prelude::*;
//! use std::sync::Arc;
//!
//! # struct Sink;
//! # #[async_trait::async_trait]
//! # impl wirechat_calls::ChatMessageSink for Sink {
//! #     async fn send_chat_message(
//! #         &self,
//! #         _target: ConversationTarget,
//! #         _text: &str,
//! #         _message_type: &str,
//! #         _meta: serde_json::Value,
//! #     ) -> Result<(), wirechat_calls::SummaryError> {
//! #         Ok(())
//! #     }
//! # }
//! # async fn example() -> anyhow::Result<()> {
//! let me = PeerInfo {
//!     id: UserId(1),
//!     name: "Ana".to_string(),
//!     avatar_url: None,
//! };
//!
//! // Connect to the signaling relay
//! let relay = LocalRelay::new();
//! let transport = Arc::new(relay.connect(me.id));
//!
//! // Create the call service
//! let service = CallService::builder(me)
//!     .with_transport(transport)
//!     .with_message_sink(Arc::new(Sink))
//!     .build()?;
//!
//! // Initiate a video call
//! let call_id = service
//!     .start_call(ConversationTarget::User(UserId(2)), CallKind::Video)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Signaling envelope, channel naming, and transport trait
pub mod signaling;

/// In-memory signaling relay
pub mod transport;

/// Media session management
pub mod media;

/// WebRTC media backend
pub mod rtc;

/// Call state machine
pub mod call;

/// Call summary reporting
pub mod summary;

/// Call service and presentation adapter
pub mod service;

// Re-export main types at crate root
pub use call::{CallEngine, CallError};
pub use media::{
    LocalMedia, MediaBackend, MediaError, MediaSessionManager, NegotiationState, PeerEvent,
    PeerLink,
};
pub use rtc::{RtcConfig, WebRtcBackend, DEFAULT_STUN_SERVERS};
pub use service::{CallService, CallServiceBuilder};
pub use signaling::{
    CandidateInit, ChannelId, SdpType, SessionDescription, Signal, SignalEnvelope, SignalingError,
    SignalingTransport,
};
pub use summary::{
    CallSummary, ChatMessageSink, SummaryError, SummaryReporter, CALL_SUMMARY_MESSAGE_TYPE,
};
pub use transport::{LocalRelay, RelayClient};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallEngine, CallError};
    pub use crate::media::{MediaBackend, MediaSessionManager, PeerEvent};
    pub use crate::rtc::WebRtcBackend;
    pub use crate::service::{CallService, CallServiceBuilder};
    pub use crate::signaling::{
        ChannelId, Signal, SignalEnvelope, SignalingError, SignalingTransport,
    };
    pub use crate::summary::{CallSummary, ChatMessageSink, SummaryReporter};
    pub use crate::transport::{LocalRelay, RelayClient};
    pub use crate::types::{
        CallEvent, CallId, CallKind, CallSnapshot, CallStatus, ConversationTarget, GroupId,
        PeerInfo, StreamHandle, SummaryReason, UserId,
    };
}
