//! Best-effort audit trail of queue mutations and sends.

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tracing::info,
};

use crate::{
    entry::{EntryId, FragmentKind},
    error::AuditError,
};

/// Something that happened to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Enqueued {
        entry_id: EntryId,
        destination: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
        text_len: usize,
        coalesced: bool,
    },
    Sent {
        entry_id: EntryId,
        destination: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
        fragment: FragmentKind,
        sent_len: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<i64>,
    },
    SendFailed {
        entry_id: EntryId,
        destination: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
        error: String,
    },
    Dropped {
        entry_id: EntryId,
        destination: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
        /// Unsent chars discarded with the entry.
        dropped_len: usize,
        error: String,
    },
}

impl AuditEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Sent { .. } => "sent",
            Self::SendFailed { .. } => "send_failed",
            Self::Dropped { .. } => "dropped",
        }
    }

    #[must_use]
    pub fn entry_id(&self) -> EntryId {
        match self {
            Self::Enqueued { entry_id, .. }
            | Self::Sent { entry_id, .. }
            | Self::SendFailed { entry_id, .. }
            | Self::Dropped { entry_id, .. } => *entry_id,
        }
    }

    #[must_use]
    pub fn destination(&self) -> &str {
        match self {
            Self::Enqueued { destination, .. }
            | Self::Sent { destination, .. }
            | Self::SendFailed { destination, .. }
            | Self::Dropped { destination, .. } => destination,
        }
    }
}

/// Receives audit events. Failures never affect the queue.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Emits every event as a structured `tracing` record on the `herald::audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let payload = serde_json::to_string(&event)?;
        info!(
            target: "herald::audit",
            event = event.kind(),
            entry_id = event.entry_id().0,
            destination = event.destination(),
            payload = %payload,
            "outbox audit"
        );
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let event = AuditEvent::Sent {
            entry_id: EntryId(7),
            destination: "-100".into(),
            thread: None,
            fragment: FragmentKind::Head,
            sent_len: 4090,
            message_id: Some(12),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "sent");
        assert_eq!(json["entry_id"], 7);
        assert_eq!(json["fragment"], "head");
        assert!(json.get("thread").is_none());

        let back: AuditEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn builtin_sinks_accept_events() {
        let event = AuditEvent::Enqueued {
            entry_id: EntryId(1),
            destination: "-100".into(),
            thread: Some("3".into()),
            text_len: 5,
            coalesced: false,
        };
        NoopAuditSink.record(event.clone()).await.unwrap();
        TracingAuditSink.record(event).await.unwrap();
    }
}
