//! Metric name and label definitions.
//!
//! Centralizing names keeps producers and dashboards in agreement.

/// Outbound queue metrics
pub mod outbox {
    /// Messages accepted by `enqueue`
    pub const ENQUEUED_TOTAL: &str = "herald_outbox_enqueued_total";
    /// Enqueued messages appended to an existing entry
    pub const COALESCED_TOTAL: &str = "herald_outbox_coalesced_total";
    /// Fragments confirmed by the transport (labelled by fragment kind)
    pub const SENDS_TOTAL: &str = "herald_outbox_sends_total";
    /// Failed send attempts
    pub const SEND_FAILURES_TOTAL: &str = "herald_outbox_send_failures_total";
    /// Entries discarded after a permanent send failure
    pub const DROPPED_TOTAL: &str = "herald_outbox_dropped_total";
    /// Drain attempts skipped because of the minimum send interval
    pub const RATE_LIMITED_TOTAL: &str = "herald_outbox_rate_limited_total";
    /// Transport call duration in seconds
    pub const SEND_DURATION_SECONDS: &str = "herald_outbox_send_duration_seconds";
    /// Entries currently buffered
    pub const PENDING_ENTRIES: &str = "herald_outbox_pending_entries";
    /// Chars currently buffered
    pub const PENDING_CHARS: &str = "herald_outbox_pending_chars";
}

/// Change source metrics
pub mod sources {
    /// Change events received (labelled by source kind)
    pub const EVENTS_TOTAL: &str = "herald_source_events_total";
    /// Events skipped as malformed or oversized
    pub const EVENTS_SKIPPED_TOTAL: &str = "herald_source_events_skipped_total";
    /// Listener reconnects
    pub const RECONNECTS_TOTAL: &str = "herald_source_reconnects_total";
}

/// Telegram transport metrics
pub mod telegram {
    /// `retry_after` responses waited out
    pub const RETRY_AFTER_TOTAL: &str = "herald_telegram_retry_after_total";
    /// Sends that fell back to plain text
    pub const PLAIN_FALLBACK_TOTAL: &str = "herald_telegram_plain_fallback_total";
}

/// Common label keys used across metrics
pub mod labels {
    pub const SOURCE: &str = "source";
    pub const FRAGMENT: &str = "fragment";
    pub const ERROR_TYPE: &str = "error_type";
    pub const REASON: &str = "reason";
}

/// Standard histogram buckets
pub mod buckets {
    use once_cell::sync::Lazy;

    /// Bot API call duration buckets (in seconds)
    /// Covers 10ms to 2 minutes, long tail from `retry_after` waits
    pub static SEND_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
        ]
    });
}
