//! Fixed-interval delivery loop.

use std::{sync::Arc, time::Duration};

use {
    tokio::{
        sync::Mutex,
        task::{JoinHandle, JoinSet},
        time::MissedTickBehavior,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::queue::{DrainOutcome, Outbox};

/// Calls [`Outbox::drain_one`] once per tick.
///
/// Each tick runs in its own task so a slow send never delays the timer; the
/// outbox's in-flight flag turns overlapping ticks into no-ops.
pub struct DeliveryScheduler {
    outbox: Arc<Outbox>,
    tick: Duration,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryScheduler {
    pub fn new(outbox: Arc<Outbox>, tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            outbox,
            tick,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    /// Start the timer loop. Calling it again while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        let svc = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            svc.timer_loop().await;
        }));
        info!(tick_ms = self.tick.as_millis() as u64, "delivery scheduler started");
    }

    /// Stop ticking and wait for in-flight ticks to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(error = %e, "delivery scheduler task ended abnormally");
        }
        info!("delivery scheduler stopped");
    }

    /// Flush the outbox (bounded by its flush timeout), then stop.
    pub async fn shutdown(&self) {
        let deadline = tokio::time::Instant::now() + self.outbox.limits().flush_timeout;
        self.stop().await;
        let left = self.outbox.flush(deadline).await;
        info!(pending_entries = left, "outbox flushed");
    }

    async fn timer_loop(&self) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = JoinSet::new();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {},
            }

            while let Some(done) = ticks.try_join_next() {
                if let Err(e) = done {
                    error!(error = %e, "delivery tick panicked");
                }
            }

            let outbox = Arc::clone(&self.outbox);
            ticks.spawn(async move {
                match outbox.drain_one(true).await {
                    DrainOutcome::Sent(report) => {
                        debug!(entry_id = report.entry_id.0, "tick delivered a fragment");
                    },
                    DrainOutcome::Failed(e) => {
                        warn!(error = %e, "tick send failed");
                    },
                    DrainOutcome::Dropped { entry_id, error } => {
                        warn!(entry_id = entry_id.0, error = %error, "tick dropped an undeliverable entry");
                    },
                    DrainOutcome::Busy | DrainOutcome::Empty | DrainOutcome::RateLimited { .. } => {},
                }
            });
        }

        while let Some(done) = ticks.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "delivery tick panicked");
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{limits::OutboxLimits, memory::MemoryTransport, transport::Transport},
        herald_common::ChatTarget,
    };

    #[tokio::test(start_paused = true)]
    async fn delivers_one_fragment_per_interval() {
        let transport = Arc::new(MemoryTransport::new());
        let outbox = Arc::new(Outbox::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            OutboxLimits::default(),
        ));
        for dest in ["a", "b", "c"] {
            outbox.enqueue("hi", ChatTarget::new(dest)).await.unwrap();
        }

        let scheduler = DeliveryScheduler::new(Arc::clone(&outbox), Duration::from_secs(1));
        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(transport.sent().await.len(), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.sent().await.len(), 3);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_ticking_after_failures() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next(3);
        let outbox = Arc::new(Outbox::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            OutboxLimits::default(),
        ));
        outbox.enqueue("hi", ChatTarget::new("a")).await.unwrap();

        let scheduler = DeliveryScheduler::new(Arc::clone(&outbox), Duration::from_secs(1));
        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(4500)).await;
        scheduler.stop().await;

        assert_eq!(transport.attempts(), 4);
        assert_eq!(transport.sent().await.len(), 1);
        assert!(outbox.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_entries() {
        let transport = Arc::new(MemoryTransport::new());
        let outbox = Arc::new(Outbox::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            OutboxLimits::default(),
        ));
        let scheduler = DeliveryScheduler::new(Arc::clone(&outbox), Duration::from_secs(60));
        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        outbox.enqueue("one", ChatTarget::new("a")).await.unwrap();
        outbox.enqueue("two", ChatTarget::new("b")).await.unwrap();
        scheduler.shutdown().await;

        assert!(outbox.is_empty().await);
        assert_eq!(transport.sent().await.len(), 2);
    }
}
