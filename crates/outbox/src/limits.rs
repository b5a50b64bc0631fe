//! Size and timing limits of the outbox.

use std::time::Duration;

use herald_config::{OutboxConfig, RateLimitScope};

use crate::error::{OutboxError, Result};

/// Limits applied by [`Outbox`](crate::Outbox). All lengths are in chars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxLimits {
    /// A coalesce is accepted only while the combined text stays below this.
    pub combine_threshold: usize,
    /// Max chars of entry text carried by one send.
    pub split_len: usize,
    /// Hard cap of one send, fences included.
    pub transport_cap: usize,
    pub min_send_interval: Duration,
    pub rate_limit_scope: RateLimitScope,
    pub tick_interval: Duration,
    /// Re-opens the code block on every fragment after the first.
    pub open_fence: String,
    /// Closes the code block on every fragment but the last.
    pub close_fence: String,
    pub enqueue_wait_retries: u32,
    pub enqueue_wait_step: Duration,
    pub flush_timeout: Duration,
}

impl Default for OutboxLimits {
    fn default() -> Self {
        Self {
            combine_threshold: 3800,
            split_len: 4090,
            transport_cap: 4096,
            min_send_interval: Duration::from_secs(1),
            rate_limit_scope: RateLimitScope::Global,
            tick_interval: Duration::from_secs(1),
            open_fence: "```json\n".into(),
            close_fence: "\n```".into(),
            enqueue_wait_retries: 3,
            enqueue_wait_step: Duration::from_millis(50),
            flush_timeout: Duration::from_secs(10),
        }
    }
}

impl OutboxLimits {
    /// Build limits from config, rejecting combinations that leave no room for text.
    pub fn from_config(config: &OutboxConfig) -> Result<Self> {
        let limits = Self {
            combine_threshold: config.combine_threshold,
            split_len: config.split_len,
            transport_cap: config.transport_cap,
            min_send_interval: Duration::from_millis(config.min_send_interval_ms),
            rate_limit_scope: config.rate_limit_scope,
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            open_fence: config.open_fence.clone(),
            close_fence: config.close_fence.clone(),
            enqueue_wait_retries: config.enqueue_wait_retries,
            enqueue_wait_step: Duration::from_millis(config.enqueue_wait_step_ms),
            flush_timeout: Duration::from_secs(config.flush_timeout_secs),
        };
        limits.check()?;
        Ok(limits)
    }

    /// Every fragment kind must be able to carry at least one char.
    pub fn check(&self) -> Result<()> {
        if self.split_len == 0 {
            return Err(OutboxError::invalid_limits("split_len must be positive"));
        }
        if self.tick_interval.is_zero() {
            return Err(OutboxError::invalid_limits("tick_interval must be positive"));
        }
        if self.open_len() + self.close_len() >= self.transport_cap {
            return Err(OutboxError::invalid_limits(format!(
                "fences take {} of {} chars",
                self.open_len() + self.close_len(),
                self.transport_cap
            )));
        }
        Ok(())
    }

    pub(crate) fn open_len(&self) -> usize {
        self.open_fence.chars().count()
    }

    pub(crate) fn close_len(&self) -> usize {
        self.close_fence.chars().count()
    }

    /// Largest fresh entry sent unwrapped in one go.
    pub(crate) fn whole_budget(&self) -> usize {
        self.split_len.min(self.transport_cap)
    }

    /// First slice of a split entry, followed by the close fence.
    pub(crate) fn head_budget(&self) -> usize {
        self.split_len
            .min(self.transport_cap.saturating_sub(self.close_len()))
            .max(1)
    }

    /// Inner slice, wrapped in both fences.
    pub(crate) fn middle_budget(&self) -> usize {
        self.split_len
            .min(
                self.transport_cap
                    .saturating_sub(self.open_len() + self.close_len()),
            )
            .max(1)
    }

    /// Remainder that fits one send behind the open fence.
    pub(crate) fn tail_budget(&self) -> usize {
        self.split_len
            .min(self.transport_cap.saturating_sub(self.open_len()))
            .max(1)
    }
}
