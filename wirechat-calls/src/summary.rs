//! Call summary reporting
//!
//! When a session ends, a single human-readable outcome message is handed to
//! the chat message collaborator, tagged so clients can render it apart from
//! ordinary text. Reporting is fire-and-forget: a failed write is logged and
//! surfaced as a notice, but never blocks or reverses the teardown.

use crate::types::{format_duration, CallId, CallKind, ConversationTarget, SummaryReason, UserId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

/// Message type tag distinguishing call summaries from ordinary messages
pub const CALL_SUMMARY_MESSAGE_TYPE: &str = "call_summary";

/// Summary reporting errors
#[derive(Error, Debug)]
pub enum SummaryError {
    /// The chat message collaborator rejected the summary
    #[error("Summary write failed: {0}")]
    SinkFailed(String),
}

/// Outcome record for one terminated call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    /// The call this summary describes
    pub call_id: CallId,
    /// Audio or video
    pub kind: CallKind,
    /// How the call ended
    pub reason: SummaryReason,
    /// Seconds spent in the active state (zero if never connected)
    pub duration_seconds: u64,
    /// The user who initiated the call
    pub initiated_by: UserId,
    /// Conversation the summary message is addressed to
    pub target: ConversationTarget,
}

impl CallSummary {
    /// Human-readable outcome line
    #[must_use]
    pub fn message_text(&self) -> String {
        let label = self.kind.label().to_lowercase();
        match self.reason {
            SummaryReason::Completed => {
                format!("Call ended • {}", format_duration(self.duration_seconds))
            }
            SummaryReason::Missed => format!("Missed {label}"),
            SummaryReason::Canceled => format!("Canceled {label}"),
            SummaryReason::Declined => format!("Declined {label}"),
        }
    }

    /// Structured metadata attached to the summary message
    #[must_use]
    pub fn metadata(&self) -> serde_json::Value {
        json!({
            "call_type": self.kind,
            "status": self.reason.as_str(),
            "duration_seconds": self.duration_seconds,
            "formatted_duration": format_duration(self.duration_seconds),
            "initiated_by": self.initiated_by.0,
        })
    }
}

/// External chat message collaborator
///
/// The message store and its broadcast pipeline are outside this crate; the
/// reporter only needs a way to persist one message with metadata.
#[async_trait]
pub trait ChatMessageSink: Send + Sync {
    /// Persist a chat message addressed to a conversation
    ///
    /// # Errors
    ///
    /// Returns `SummaryError::SinkFailed` if the message could not be
    /// stored.
    async fn send_chat_message(
        &self,
        target: ConversationTarget,
        text: &str,
        message_type: &str,
        meta: serde_json::Value,
    ) -> Result<(), SummaryError>;
}

/// Emits at most one summary per call
pub struct SummaryReporter {
    sink: Arc<dyn ChatMessageSink>,
    reported: Mutex<Option<CallId>>,
}

impl SummaryReporter {
    /// Create a reporter over the given sink
    #[must_use]
    pub fn new(sink: Arc<dyn ChatMessageSink>) -> Self {
        Self {
            sink,
            reported: Mutex::new(None),
        }
    }

    /// Report a call outcome, once
    ///
    /// A second report for the same call is a no-op, so a local hangup and a
    /// near-simultaneous remote terminal signal cannot produce two summary
    /// messages. The guard is set before the write: a failed write is not
    /// retried.
    ///
    /// # Errors
    ///
    /// Returns `SummaryError::SinkFailed` if the sink rejects the message;
    /// callers log and notify but never roll back the teardown.
    pub async fn report_once(&self, summary: CallSummary) -> Result<(), SummaryError> {
        {
            let mut reported = self.reported.lock();
            if *reported == Some(summary.call_id) {
                tracing::debug!(call_id = %summary.call_id, "Summary already reported");
                return Ok(());
            }
            *reported = Some(summary.call_id);
        }

        tracing::info!(
            call_id = %summary.call_id,
            reason = summary.reason.as_str(),
            duration = summary.duration_seconds,
            "Reporting call summary"
        );

        self.sink
            .send_chat_message(
                summary.target,
                &summary.message_text(),
                CALL_SUMMARY_MESSAGE_TYPE,
                summary.metadata(),
            )
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::GroupId;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct RecordingSink {
        messages: SyncMutex<Vec<(ConversationTarget, String, String, serde_json::Value)>>,
        fail: SyncMutex<bool>,
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
            self.messages
                .lock()
                .push((target, text.to_string(), message_type.to_string(), meta));
            Ok(())
        }
    }

    fn summary(reason: SummaryReason, duration: u64) -> CallSummary {
        CallSummary {
            call_id: CallId::new(),
            kind: CallKind::Audio,
            reason,
            duration_seconds: duration,
            initiated_by: UserId(7),
            target: ConversationTarget::User(UserId(3)),
        }
    }

    #[test]
    fn test_message_text_per_reason() {
        assert_eq!(
            summary(SummaryReason::Completed, 83).message_text(),
            "Call ended • 01:23"
        );
        assert_eq!(
            summary(SummaryReason::Missed, 0).message_text(),
            "Missed voice call"
        );
        assert_eq!(
            summary(SummaryReason::Canceled, 0).message_text(),
            "Canceled voice call"
        );
        assert_eq!(
            summary(SummaryReason::Declined, 0).message_text(),
            "Declined voice call"
        );

        let video = CallSummary {
            kind: CallKind::Video,
            ..summary(SummaryReason::Missed, 0)
        };
        assert_eq!(video.message_text(), "Missed video call");
    }

    #[test]
    fn test_metadata_fields() {
        let meta = summary(SummaryReason::Completed, 3661).metadata();
        assert_eq!(meta["call_type"], "audio");
        assert_eq!(meta["status"], "completed");
        assert_eq!(meta["duration_seconds"], 3661);
        assert_eq!(meta["formatted_duration"], "01:01:01");
        assert_eq!(meta["initiated_by"], 7);
    }

    #[tokio::test]
    async fn test_report_once_is_idempotent_per_call() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = SummaryReporter::new(sink.clone());

        let s = summary(SummaryReason::Completed, 10);
        reporter.report_once(s.clone()).await.unwrap();
        reporter.report_once(s).await.unwrap();

        assert_eq!(sink.messages.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_calls_each_get_a_summary() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = SummaryReporter::new(sink.clone());

        reporter
            .report_once(summary(SummaryReason::Missed, 0))
            .await
            .unwrap();
        reporter
            .report_once(summary(SummaryReason::Declined, 0))
            .await
            .unwrap();

        assert_eq!(sink.messages.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_group_summary_addressing() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = SummaryReporter::new(sink.clone());

        let mut s = summary(SummaryReason::Completed, 5);
        s.target = ConversationTarget::Group(GroupId(12));
        reporter.report_once(s).await.unwrap();

        let messages = sink.messages.lock();
        assert_eq!(messages[0].0, ConversationTarget::Group(GroupId(12)));
        assert_eq!(messages[0].2, CALL_SUMMARY_MESSAGE_TYPE);
    }

    #[tokio::test]
    async fn test_sink_failure_is_surfaced_not_retried() {
        let sink = Arc::new(RecordingSink::default());
        *sink.fail.lock() = true;
        let reporter = SummaryReporter::new(sink.clone());

        let s = summary(SummaryReason::Completed, 1);
        assert!(reporter.report_once(s.clone()).await.is_err());

        // The attempt consumed the one report allowed for this call.
        *sink.fail.lock() = false;
        reporter.report_once(s).await.unwrap();
        assert!(sink.messages.lock().is_empty());
    }
}
