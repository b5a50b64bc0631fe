//! Outbound message queue for chat delivery.
//!
//! Producers [`enqueue`](Outbox::enqueue) formatted text for a [`ChatTarget`];
//! the [`DeliveryScheduler`] drains one size-limited fragment per tick through a
//! [`Transport`]. Small messages for the same target coalesce, oversized ones
//! are split across several sends with code fences re-opened on each fragment.

pub mod audit;
pub mod audit_sqlite;
pub mod entry;
pub mod error;
pub mod limits;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod queue;
pub mod scheduler;
pub mod transport;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod concurrency_tests;

pub use {
    audit::{AuditEvent, AuditSink, NoopAuditSink, TracingAuditSink},
    audit_sqlite::SqliteAuditSink,
    entry::{EntryId, FragmentKind, PendingEntry, Phase},
    error::{AuditError, OutboxError, Result, TransportError},
    herald_common::ChatTarget,
    herald_config::RateLimitScope,
    limits::OutboxLimits,
    queue::{DrainOutcome, EnqueueOutcome, Outbox, OutboxStats, SendReport},
    scheduler::DeliveryScheduler,
    transport::{LogTransport, SendReceipt, Transport},
};
