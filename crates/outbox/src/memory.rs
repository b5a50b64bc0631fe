//! In-memory transport for tests.

use std::{
    collections::HashSet,
    io,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicUsize, Ordering},
    },
};

use {
    async_trait::async_trait,
    herald_common::ChatTarget,
    tokio::sync::{Mutex, Notify, Semaphore},
};

use crate::{
    error::TransportError,
    transport::{SendReceipt, Transport},
};

/// A payload the transport accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub target: ChatTarget,
    pub text: String,
}

/// Records every send. Can fail on demand, reject destinations outright and
/// hold sends open until the caller releases them.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<SentMessage>>,
    failures: AtomicUsize,
    rejected: Mutex<HashSet<String>>,
    attempts: AtomicUsize,
    next_id: AtomicI64,
    gate: Option<Arc<Semaphore>>,
    started: Notify,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send waits for a permit on the returned semaphore.
    #[must_use]
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let transport = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (transport, gate)
    }

    /// Fail the next `count` sends with a transient error.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Reject every send to `destination` as the chat API does for an unknown
    /// or blocked chat.
    pub async fn reject_destination(&self, destination: impl Into<String>) {
        self.rejected.lock().await.insert(destination.into());
    }

    /// Resolves once a send has started (and is possibly held at the gate).
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }

    /// Sends attempted, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(
        &self,
        target: &ChatTarget,
        text: &str,
    ) -> Result<SendReceipt, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| TransportError::external("gate closed", e))?
                .forget();
        }

        if self.rejected.lock().await.contains(&target.destination) {
            return Err(TransportError::rejected("chat not found"));
        }

        let should_fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(TransportError::external(
                "injected failure",
                io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"),
            ));
        }

        self.sent.lock().await.push(SentMessage {
            target: target.clone(),
            text: text.to_string(),
        });
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SendReceipt {
            message_id: Some(id),
        })
    }
}
