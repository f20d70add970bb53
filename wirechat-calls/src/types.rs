//! Call types and data structures

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Unique identifier for a call
///
/// Generated by the initiating client and echoed in every signaling message
/// for that call, so overlapping signals can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric user identifier assigned by the chat application
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric group identifier assigned by the chat application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub i64);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of media a call carries, fixed for the lifetime of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Microphone only
    Audio,
    /// Microphone and camera
    Video,
}

impl CallKind {
    /// Whether this kind captures camera input
    #[must_use]
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }

    /// Human-readable label ("Voice call" / "Video call")
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Audio => "Voice call",
            Self::Video => "Video call",
        }
    }
}

/// Call session status
///
/// The only states that exist. Every terminal transition goes straight back
/// to `Idle`; there is no separate "ending" or "failed" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// No call session
    Idle,
    /// Offer sent, waiting for the remote answer
    Outgoing,
    /// Offer received, waiting for the local user to accept or reject
    Incoming,
    /// Media session negotiated, call in progress
    Active,
}

impl CallStatus {
    /// Whether no session exists
    #[must_use]
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// The conversation a call belongs to
///
/// Determines the signaling channel: one-to-one calls use a channel keyed by
/// the sorted participant pair, group calls use the group channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationTarget {
    /// Direct conversation with another user
    User(UserId),
    /// Group conversation
    Group(GroupId),
}

impl ConversationTarget {
    /// Whether this target addresses a group channel
    #[must_use]
    pub fn is_group(self) -> bool {
        matches!(self, Self::Group(_))
    }
}

/// Identity of a call participant as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// User id
    pub id: UserId,
    /// Display name
    pub name: String,
    /// Avatar URL, if the user has one
    pub avatar_url: Option<String>,
}

/// Why a call ended, as recorded in the call summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryReason {
    /// The call reached `Active` and was hung up
    Completed,
    /// The callee never answered (canceled outgoing, or remote busy)
    Missed,
    /// The call was torn down before it connected
    Canceled,
    /// The callee explicitly rejected the call
    Declined,
}

impl SummaryReason {
    /// Wire value used in summary metadata
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Missed => "missed",
            Self::Canceled => "canceled",
            Self::Declined => "declined",
        }
    }
}

/// Opaque handle to a media stream, for the presentation layer
///
/// The UI only holds references to streams; their lifecycle is owned by the
/// media session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    /// Stream identifier assigned by the media backend
    pub id: String,
}

/// Call events for the presentation layer and notifications
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// An offer arrived while idle; the user should be asked to accept
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Audio or video
        kind: CallKind,
        /// Who is calling
        from: PeerInfo,
        /// Conversation the call belongs to
        target: ConversationTarget,
    },
    /// A local call attempt was started and its offer sent
    CallInitiated {
        /// Call identifier
        call_id: CallId,
        /// Audio or video
        kind: CallKind,
        /// Conversation being called
        target: ConversationTarget,
    },
    /// The session reached `Active`
    CallConnected {
        /// Call identifier
        call_id: CallId,
    },
    /// The session was torn down
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Outcome recorded in the summary
        reason: SummaryReason,
    },
    /// The local capture stream became available
    LocalStream {
        /// Stream reference
        handle: StreamHandle,
    },
    /// The remote peer's stream arrived
    RemoteStream {
        /// Stream reference
        handle: StreamHandle,
    },
    /// Transient user-facing notification (toast)
    Notice(String),
}

/// Read-only view of the current call session for the UI layer
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    /// Current status
    pub status: CallStatus,
    /// Call identifier, if a session exists
    pub call_id: Option<CallId>,
    /// Audio or video
    pub kind: CallKind,
    /// Conversation the session belongs to
    pub target: Option<ConversationTarget>,
    /// Remote participant, when known
    pub peer: Option<PeerInfo>,
    /// Whether this client created the session
    pub is_initiator: bool,
    /// Microphone muted
    pub muted: bool,
    /// Camera disabled (video calls only)
    pub camera_off: bool,
    /// Local capture stream, once acquired
    pub local_stream: Option<StreamHandle>,
    /// Remote stream, once received
    pub remote_stream: Option<StreamHandle>,
    /// Instant the session entered `Active`, cleared on exit
    pub connected_at: Option<Instant>,
}

impl CallSnapshot {
    /// Snapshot of an idle client
    #[must_use]
    pub fn idle() -> Self {
        Self {
            status: CallStatus::Idle,
            call_id: None,
            kind: CallKind::Audio,
            target: None,
            peer: None,
            is_initiator: false,
            muted: false,
            camera_off: false,
            local_stream: None,
            remote_stream: None,
            connected_at: None,
        }
    }

    /// Elapsed active-call time, zero unless the session is `Active`
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.connected_at
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Elapsed active-call time formatted as `MM:SS` or `HH:MM:SS`
    #[must_use]
    pub fn duration_label(&self) -> String {
        format_duration(self.duration().as_secs())
    }
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

/// Format a second count as `MM:SS`, switching to `HH:MM:SS` at one hour
#[must_use]
pub fn format_duration(total_seconds: u64) -> String {
    let hrs = total_seconds / 3600;
    let mins = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;

    if hrs > 0 {
        format!("{hrs:02}:{mins:02}:{secs:02}")
    } else {
        format!("{mins:02}:{secs:02}")
    }
}
