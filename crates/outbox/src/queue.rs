//! The shared outbound buffer: coalescing `enqueue` and size-aware `drain_one`.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    herald_common::ChatTarget,
    herald_config::RateLimitScope,
    serde::Serialize,
    tokio::{sync::Mutex, time::Instant},
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use herald_metrics::{counter, gauge, histogram, labels, outbox as outbox_metrics};

use crate::{
    audit::{AuditEvent, AuditSink, NoopAuditSink},
    entry::{EntryId, Fragment, FragmentKind, PendingEntry},
    error::{OutboxError, Result, TransportError},
    limits::OutboxLimits,
    transport::{SendReceipt, Transport},
};

/// What `enqueue` did with the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended to the most recent entry for the same target.
    Coalesced { entry_id: EntryId },
    /// Started a new entry at the tail.
    Appended { entry_id: EntryId },
}

impl EnqueueOutcome {
    #[must_use]
    pub fn entry_id(&self) -> EntryId {
        match self {
            Self::Coalesced { entry_id } | Self::Appended { entry_id } => *entry_id,
        }
    }
}

/// A fragment the transport confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub entry_id: EntryId,
    pub target: ChatTarget,
    pub kind: FragmentKind,
    /// Chars of entry text delivered, fences excluded.
    pub sent_len: usize,
    /// `true` when the entry left the buffer.
    pub entry_done: bool,
    pub receipt: SendReceipt,
}

/// Result of one `drain_one` call.
#[derive(Debug)]
pub enum DrainOutcome {
    Sent(SendReport),
    /// The send failed; the entry is exactly as before the attempt.
    Failed(TransportError),
    /// The send failed permanently and the entry was discarded.
    Dropped {
        entry_id: EntryId,
        error: TransportError,
    },
    /// Another drain holds the send slot.
    Busy,
    Empty,
    /// Too soon after the last send attempt.
    RateLimited { ready_in: Duration },
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending_entries: usize,
    pub pending_chars: usize,
    pub in_flight: bool,
    pub enqueued: u64,
    pub coalesced: u64,
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<PendingEntry>,
    last_attempt: Option<Instant>,
    last_attempt_by_destination: HashMap<String, Instant>,
}

impl QueueState {
    fn record_attempt(&mut self, destination: &str, at: Instant) {
        self.last_attempt = Some(at);
        self.last_attempt_by_destination
            .insert(destination.to_string(), at);
    }

    fn position(&self, id: EntryId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }
}

#[derive(Default)]
struct Totals {
    enqueued: AtomicU64,
    coalesced: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Clears the in-flight flag however the drain ends, cancellation included.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Marks an `enqueue` critical section for the drain-side wait hint.
struct Mutating<'a>(&'a AtomicUsize);

impl<'a> Mutating<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for Mutating<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Ordered, coalescing buffer between change sources and the chat endpoint.
///
/// Producers call [`enqueue`](Self::enqueue) concurrently; a single periodic
/// consumer calls [`drain_one`](Self::drain_one). One mutex guards the whole
/// buffer and is never held across I/O: a drain snapshots the head fragment,
/// releases the lock for the transport call, then commits by entry id.
pub struct Outbox {
    state: Mutex<QueueState>,
    in_flight: AtomicBool,
    mutating: AtomicUsize,
    next_id: AtomicU64,
    transport: Arc<dyn Transport>,
    audit: Arc<dyn AuditSink>,
    limits: OutboxLimits,
    totals: Totals,
}

impl Outbox {
    pub fn new(transport: Arc<dyn Transport>, limits: OutboxLimits) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            in_flight: AtomicBool::new(false),
            mutating: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            transport,
            audit: Arc::new(NoopAuditSink),
            limits,
            totals: Totals::default(),
        }
    }

    #[must_use]
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn limits(&self) -> &OutboxLimits {
        &self.limits
    }

    /// Queue `text` for `target`, coalescing into the newest entry for the
    /// same target when the combined text stays under the combine threshold.
    pub async fn enqueue(
        &self,
        text: impl Into<String>,
        target: ChatTarget,
    ) -> Result<EnqueueOutcome> {
        let text = text.into();
        if text.is_empty() {
            return Err(OutboxError::EmptyText);
        }
        if target.destination.trim().is_empty() {
            return Err(OutboxError::MissingDestination);
        }

        self.wait_while(|| self.in_flight.load(Ordering::Acquire))
            .await;

        let text_len = text.chars().count();
        let outcome = {
            let _mutating = Mutating::enter(&self.mutating);
            let mut state = self.state.lock().await;
            let outcome = self.coalesce_or_append(&mut state, text, text_len, &target);
            #[cfg(feature = "metrics")]
            record_pending(&state);
            outcome
        };

        let coalesced = matches!(outcome, EnqueueOutcome::Coalesced { .. });
        self.totals.enqueued.fetch_add(1, Ordering::Relaxed);
        if coalesced {
            self.totals.coalesced.fetch_add(1, Ordering::Relaxed);
        }
        #[cfg(feature = "metrics")]
        {
            counter!(outbox_metrics::ENQUEUED_TOTAL).increment(1);
            if coalesced {
                counter!(outbox_metrics::COALESCED_TOTAL).increment(1);
            }
        }
        debug!(
            destination = %target.destination,
            thread = target.thread(),
            text_len,
            entry_id = outcome.entry_id().0,
            coalesced,
            "message enqueued"
        );

        self.record(AuditEvent::Enqueued {
            entry_id: outcome.entry_id(),
            destination: target.destination,
            thread: target.thread,
            text_len,
            coalesced,
        })
        .await;

        Ok(outcome)
    }

    fn coalesce_or_append(
        &self,
        state: &mut QueueState,
        text: String,
        text_len: usize,
        target: &ChatTarget,
    ) -> EnqueueOutcome {
        // Only the newest entry of a group may grow; appending to an older one
        // would reorder the group.
        if let Some(entry) = state.entries.iter_mut().rev().find(|e| e.target == *target)
            && entry.len() + text_len < self.limits.combine_threshold
        {
            entry.append(&text, &self.limits);
            return EnqueueOutcome::Coalesced { entry_id: entry.id };
        }

        let entry_id = EntryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        state
            .entries
            .push_back(PendingEntry::new(entry_id, target.clone(), text));
        EnqueueOutcome::Appended { entry_id }
    }

    /// Send at most one fragment.
    ///
    /// With `respect_interval`, returns [`DrainOutcome::RateLimited`] when the
    /// minimum send interval has not elapsed since the last attempt (globally
    /// or per destination, depending on the configured scope).
    pub async fn drain_one(&self, respect_interval: bool) -> DrainOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return DrainOutcome::Busy;
        }
        let _in_flight = InFlight(&self.in_flight);

        self.wait_while(|| self.mutating.load(Ordering::Acquire) > 0)
            .await;

        let (id, target, fragment) = {
            let mut state = self.state.lock().await;
            if state.entries.is_empty() {
                return DrainOutcome::Empty;
            }
            let now = Instant::now();
            let index = match self.pick(&state, now, respect_interval) {
                Ok(index) => index,
                Err(ready_in) => {
                    #[cfg(feature = "metrics")]
                    counter!(outbox_metrics::RATE_LIMITED_TOTAL).increment(1);
                    return DrainOutcome::RateLimited { ready_in };
                },
            };
            let entry = &state.entries[index];
            let snapshot = (entry.id, entry.target.clone(), entry.plan(&self.limits));
            state.record_attempt(&snapshot.1.destination, now);
            snapshot
        };

        #[cfg(feature = "metrics")]
        let started = Instant::now();
        let result = self.transport.send(&target, &fragment.payload).await;
        #[cfg(feature = "metrics")]
        histogram!(outbox_metrics::SEND_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match result {
            Ok(receipt) => {
                let entry_done = self.commit(id, &fragment).await;
                self.totals.sent.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "metrics")]
                counter!(outbox_metrics::SENDS_TOTAL, labels::FRAGMENT => fragment.kind.as_str())
                    .increment(1);
                info!(
                    destination = %target.destination,
                    thread = target.thread(),
                    entry_id = id.0,
                    fragment = fragment.kind.as_str(),
                    sent_len = fragment.consumed,
                    entry_done,
                    "message sent"
                );
                self.record(AuditEvent::Sent {
                    entry_id: id,
                    destination: target.destination.clone(),
                    thread: target.thread.clone(),
                    fragment: fragment.kind,
                    sent_len: fragment.consumed,
                    message_id: receipt.message_id,
                })
                .await;
                DrainOutcome::Sent(SendReport {
                    entry_id: id,
                    target,
                    kind: fragment.kind,
                    sent_len: fragment.consumed,
                    entry_done,
                    receipt,
                })
            },
            Err(error) => {
                self.totals.failed.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "metrics")]
                counter!(outbox_metrics::SEND_FAILURES_TOTAL, labels::ERROR_TYPE => error.kind())
                    .increment(1);
                let permanent = error.is_permanent();
                warn!(
                    destination = %target.destination,
                    thread = target.thread(),
                    entry_id = id.0,
                    fragment = fragment.kind.as_str(),
                    error = %error,
                    permanent,
                    "send failed"
                );
                self.record(AuditEvent::SendFailed {
                    entry_id: id,
                    destination: target.destination.clone(),
                    thread: target.thread.clone(),
                    error: error.to_string(),
                })
                .await;
                if !permanent {
                    return DrainOutcome::Failed(error);
                }

                let dropped_len = self.discard(id).await;
                self.totals.dropped.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "metrics")]
                counter!(outbox_metrics::DROPPED_TOTAL).increment(1);
                warn!(
                    destination = %target.destination,
                    thread = target.thread(),
                    entry_id = id.0,
                    dropped_len,
                    "entry discarded after permanent send failure"
                );
                self.record(AuditEvent::Dropped {
                    entry_id: id,
                    destination: target.destination,
                    thread: target.thread,
                    dropped_len,
                    error: error.to_string(),
                })
                .await;
                DrainOutcome::Dropped {
                    entry_id: id,
                    error,
                }
            },
        }
    }

    /// Index of the entry to send next, or how long until one is allowed.
    fn pick(
        &self,
        state: &QueueState,
        now: Instant,
        respect_interval: bool,
    ) -> std::result::Result<usize, Duration> {
        let interval = self.limits.min_send_interval;
        let wait_after = |last: Option<&Instant>| -> Duration {
            match last {
                Some(last) if respect_interval => {
                    interval.saturating_sub(now.saturating_duration_since(*last))
                },
                _ => Duration::ZERO,
            }
        };

        match self.limits.rate_limit_scope {
            RateLimitScope::Global => match wait_after(state.last_attempt.as_ref()) {
                Duration::ZERO => Ok(0),
                ready_in => Err(ready_in),
            },
            RateLimitScope::PerDestination => {
                let mut soonest = interval;
                for (index, entry) in state.entries.iter().enumerate() {
                    let last = state
                        .last_attempt_by_destination
                        .get(&entry.target.destination);
                    match wait_after(last) {
                        Duration::ZERO => return Ok(index),
                        ready_in => soonest = soonest.min(ready_in),
                    }
                }
                Err(soonest)
            },
        }
    }

    /// Drop the sent prefix of entry `id`. Returns `true` when the entry is gone.
    async fn commit(&self, id: EntryId, fragment: &Fragment) -> bool {
        let mut state = self.state.lock().await;
        let Some(index) = state.position(id) else {
            warn!(entry_id = id.0, "sent entry vanished before commit");
            return true;
        };
        let done = state.entries[index].commit(fragment.kind, fragment.consumed, &self.limits);
        if done {
            state.entries.remove(index);
        }
        #[cfg(feature = "metrics")]
        record_pending(&state);
        done
    }

    /// Remove entry `id`, including text coalesced during the failed send.
    /// Returns the number of chars discarded.
    async fn discard(&self, id: EntryId) -> usize {
        let mut state = self.state.lock().await;
        let removed = match state.position(id) {
            Some(index) => state.entries.remove(index),
            None => None,
        };
        let dropped_len = removed.map_or(0, |entry| entry.len());
        #[cfg(feature = "metrics")]
        record_pending(&state);
        dropped_len
    }

    /// Drain until the buffer is empty or `deadline` passes, honouring the
    /// send interval. Returns the number of entries left.
    pub async fn flush(&self, deadline: Instant) -> usize {
        let idle = self.limits.enqueue_wait_step.max(Duration::from_millis(10));
        loop {
            if Instant::now() >= deadline {
                break;
            }
            let pause = match self.drain_one(true).await {
                DrainOutcome::Empty => return 0,
                DrainOutcome::Sent(_) | DrainOutcome::Dropped { .. } => continue,
                DrainOutcome::RateLimited { ready_in } => ready_in,
                DrainOutcome::Failed(_) => self.limits.min_send_interval.max(idle),
                DrainOutcome::Busy => idle,
            };
            tokio::time::sleep_until((Instant::now() + pause).min(deadline)).await;
        }
        let left = self.len().await;
        if left > 0 {
            warn!(pending_entries = left, "flush deadline reached with entries left");
        }
        left
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Copy of the buffered entries, oldest first.
    pub async fn snapshot(&self) -> Vec<PendingEntry> {
        self.state.lock().await.entries.iter().cloned().collect()
    }

    pub async fn stats(&self) -> OutboxStats {
        let state = self.state.lock().await;
        OutboxStats {
            pending_entries: state.entries.len(),
            pending_chars: state.entries.iter().map(PendingEntry::len).sum(),
            in_flight: self.in_flight.load(Ordering::Acquire),
            enqueued: self.totals.enqueued.load(Ordering::Relaxed),
            coalesced: self.totals.coalesced.load(Ordering::Relaxed),
            sent: self.totals.sent.load(Ordering::Relaxed),
            failed: self.totals.failed.load(Ordering::Relaxed),
            dropped: self.totals.dropped.load(Ordering::Relaxed),
        }
    }

    /// Bounded backoff while `busy` holds. Latency hint only; the mutex
    /// provides exclusion.
    async fn wait_while(&self, busy: impl Fn() -> bool) {
        for _ in 0..self.limits.enqueue_wait_retries {
            if !busy() {
                return;
            }
            tokio::time::sleep(self.limits.enqueue_wait_step).await;
        }
    }

    async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(event).await {
            warn!(error = %e, "audit sink failed");
        }
    }
}

#[cfg(feature = "metrics")]
fn record_pending(state: &QueueState) {
    gauge!(outbox_metrics::PENDING_ENTRIES).set(state.entries.len() as f64);
    gauge!(outbox_metrics::PENDING_CHARS)
        .set(state.entries.iter().map(PendingEntry::len).sum::<usize>() as f64);
}
