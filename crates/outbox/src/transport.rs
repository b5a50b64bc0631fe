//! The "send text to a chat" port.

use {
    async_trait::async_trait,
    herald_common::ChatTarget,
    serde::{Deserialize, Serialize},
    tracing::info,
};

use crate::error::TransportError;

/// Acknowledgement of a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Id assigned by the chat endpoint, when it reports one.
    pub message_id: Option<i64>,
}

/// Delivers one already-sized payload.
///
/// Implementations must not retry on behalf of the outbox beyond what the
/// endpoint explicitly asks for; a returned error drops the attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, target: &ChatTarget, text: &str)
    -> Result<SendReceipt, TransportError>;
}

/// Logs payloads instead of sending them.
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send(
        &self,
        target: &ChatTarget,
        text: &str,
    ) -> Result<SendReceipt, TransportError> {
        info!(
            destination = %target.destination,
            thread = target.thread(),
            text_len = text.chars().count(),
            "dry run: would send message"
        );
        Ok(SendReceipt::default())
    }
}
