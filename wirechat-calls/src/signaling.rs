//! Call signaling protocol
//!
//! Defines the signaling envelope relayed between call participants and the
//! channel-naming rules of the relay. The relay itself is a dumb pipe: it
//! fans a message out to every subscriber of a channel except the sender,
//! at most once, with no ordering guarantee across message types.

use crate::types::{CallId, CallKind, GroupId, PeerInfo, UserId};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// The relay refused or failed to deliver a message
    #[error("Signal send failed: {0}")]
    SendFailed(String),

    /// A payload could not be decoded
    #[error("Invalid signal payload: {0}")]
    InvalidPayload(String),
}

/// Which half of the SDP handshake a description belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Session description proposed by the caller
    Offer,
    /// Session description returned by the callee
    Answer,
}

/// A session description as carried on the wire
///
/// The SDP text is base64-encoded before being embedded in the JSON payload
/// so line breaks and other special characters survive transport, and
/// decoded symmetrically on receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpType,
    /// Base64-encoded SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Wrap raw SDP text for transport
    #[must_use]
    pub fn encode(kind: SdpType, raw_sdp: &str) -> Self {
        Self {
            kind,
            sdp: BASE64.encode(raw_sdp.as_bytes()),
        }
    }

    /// Recover the raw SDP text
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::InvalidPayload` if the field is not valid
    /// base64-encoded UTF-8.
    pub fn decode(&self) -> Result<String, SignalingError> {
        let bytes = BASE64
            .decode(&self.sdp)
            .map_err(|e| SignalingError::InvalidPayload(format!("bad base64 sdp: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|e| SignalingError::InvalidPayload(format!("sdp is not utf-8: {e}")))
    }
}

/// An ICE candidate as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CandidateInit {
    /// Candidate attribute line
    pub candidate: String,
    /// SDP media id
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// The signal union, tagged by `signal_type`
///
/// Offer/answer carry a session description, candidate carries a candidate
/// payload, and the four terminal signals carry no payload at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal_type", content = "payload", rename_all = "lowercase")]
pub enum Signal {
    /// Start of the handshake, sent by the initiator
    Offer(SessionDescription),
    /// Completion of the handshake, sent by the acceptor
    Answer(SessionDescription),
    /// A discovered network path for the media transport
    Candidate {
        /// The candidate payload
        candidate: CandidateInit,
    },
    /// The remote side ended an active call
    Hangup,
    /// The callee refused an incoming call
    Reject,
    /// The caller withdrew a pending offer
    Cancel,
    /// The remote side is already in another call
    Busy,
}

impl Signal {
    /// Wire tag for logging
    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Hangup => "hangup",
            Self::Reject => "reject",
            Self::Cancel => "cancel",
            Self::Busy => "busy",
        }
    }

    /// Whether this signal terminates a session
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Hangup | Self::Reject | Self::Cancel | Self::Busy)
    }
}

/// One signaling message as relayed between clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Call the signal belongs to
    pub call_id: CallId,
    /// Audio or video
    pub call_type: CallKind,
    /// The signal itself (`signal_type` + `payload` on the wire)
    #[serde(flatten)]
    pub signal: Signal,
    /// Set when the call is signaled over a group channel
    pub group_id: Option<GroupId>,
    /// Set when the call is signaled over a one-to-one channel
    pub receiver_id: Option<UserId>,
    /// Who sent this signal
    pub sender: PeerInfo,
}

impl SignalEnvelope {
    /// The relay channel this envelope is routed to
    ///
    /// Group signals use the per-group channel; one-to-one signals use the
    /// channel keyed by the sorted participant pair, so both ends subscribe
    /// to the same name regardless of who is sending.
    #[must_use]
    pub fn channel(&self) -> ChannelId {
        if let Some(group_id) = self.group_id {
            ChannelId::group(group_id)
        } else {
            ChannelId::direct(self.sender.id, self.receiver_id)
        }
    }
}

/// Name of a relay channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(String);

impl ChannelId {
    /// Channel shared by all members of a group
    #[must_use]
    pub fn group(group_id: GroupId) -> Self {
        Self(format!("call.group.{group_id}"))
    }

    /// Channel shared by a pair of users, independent of direction
    #[must_use]
    pub fn pair(a: UserId, b: UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("call.user.{low}-{high}"))
    }

    /// Channel for a one-to-one signal, tolerating an absent receiver
    #[must_use]
    pub fn direct(sender: UserId, receiver: Option<UserId>) -> Self {
        match receiver {
            Some(receiver) => Self::pair(sender, receiver),
            None => Self(format!("call.user.{sender}")),
        }
    }

    /// The channel name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signaling transport trait
///
/// Implement this for the relay in use (websocket push service, in-memory
/// hub for tests, ...). Delivery is at-most-once with no retry: a failed
/// publish is surfaced to the caller, who decides whether to abort the call.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Post one signaling message to the channel derived from the envelope
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::SendFailed` if the relay could not accept
    /// the message.
    async fn publish(&self, envelope: SignalEnvelope) -> Result<(), SignalingError>;
}
