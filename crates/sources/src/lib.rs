//! Change-event sources.
//!
//! Each adapter watches one kind of upstream system, renders its events with a
//! [`Formatter`] and enqueues the text on the shared [`Outbox`].

pub mod error;
pub mod format;
#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "mongo")]
pub mod mongo;
pub mod postgres;

use std::sync::Arc;

use {
    herald_config::{HeraldConfig, SourcesConfig},
    herald_outbox::{ChatTarget, Outbox},
    tokio::task::JoinSet,
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use herald_metrics::{counter, labels, sources as source_metrics};

pub use {
    error::{Error, Result},
    format::{DocumentChange, DocumentOp, Formatter, RowChange, RowOp, TopicRecord},
    postgres::{PostgresSource, install_source_triggers, install_triggers},
};

pub type SourceError = Error;

/// Enqueue one rendered event. Outbox rejections are logged, never propagated.
pub(crate) async fn deliver(
    outbox: &Outbox,
    source: &'static str,
    text: String,
    target: ChatTarget,
) {
    #[cfg(feature = "metrics")]
    counter!(source_metrics::EVENTS_TOTAL, labels::SOURCE => source).increment(1);
    match outbox.enqueue(text, target.clone()).await {
        Ok(outcome) => {
            debug!(source, target = %target, entry_id = outcome.entry_id().0, "event enqueued");
        },
        Err(e) => {
            warn!(source, target = %target, error = %e, "outbox rejected event");
        },
    }
}

/// Log and count an event that could not be turned into a message.
pub(crate) fn skip(source: &'static str, error: &Error) {
    #[cfg(feature = "metrics")]
    counter!(source_metrics::EVENTS_SKIPPED_TOTAL, labels::SOURCE => source).increment(1);
    warn!(source, error = %error, "skipping change event");
}

/// Running source tasks. Dropping the set aborts them; prefer [`Sources::shutdown`].
pub struct Sources {
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl Sources {
    /// Spawn one task per configured source.
    ///
    /// Sources whose feature is not compiled in are reported and skipped.
    pub fn spawn(config: &HeraldConfig, outbox: Arc<Outbox>) -> Self {
        let cancel = CancellationToken::new();
        let formatter = Formatter::from_config(&config.redaction);
        let mut tasks = JoinSet::new();
        spawn_configured(&config.sources, formatter, outbox, &cancel, &mut tasks);
        info!(count = tasks.len(), "change sources started");
        Self { tasks, cancel }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel every source and wait for their tasks to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(done) = self.tasks.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "source task ended abnormally");
            }
        }
        info!("change sources stopped");
    }
}

fn spawn_configured(
    sources: &SourcesConfig,
    formatter: Formatter,
    outbox: Arc<Outbox>,
    cancel: &CancellationToken,
    tasks: &mut JoinSet<()>,
) {
    for pg in &sources.postgres {
        let source = Arc::new(PostgresSource::new(pg.clone(), formatter, Arc::clone(&outbox)));
        let cancel = cancel.clone();
        tasks.spawn(async move { source.run(cancel).await });
    }

    #[cfg(feature = "mongo")]
    for mongo in &sources.mongo {
        let source = Arc::new(mongo::MongoSource::new(
            mongo.clone(),
            formatter,
            Arc::clone(&outbox),
        ));
        let cancel = cancel.clone();
        tasks.spawn(async move { source.run(cancel).await });
    }
    #[cfg(not(feature = "mongo"))]
    if !sources.mongo.is_empty() {
        warn!("mongo sources configured but herald was built without the `mongo` feature");
    }

    #[cfg(feature = "kafka")]
    if let Some(kafka) = &sources.kafka {
        let source = kafka::KafkaSource::new(kafka.clone(), formatter, Arc::clone(&outbox));
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = source.run(cancel).await {
                error!(error = %e, "kafka source stopped");
            }
        });
    }
    #[cfg(not(feature = "kafka"))]
    if sources.kafka.is_some() {
        warn!("kafka source configured but herald was built without the `kafka` feature");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        herald_outbox::{OutboxLimits, Transport, memory::MemoryTransport},
    };

    #[tokio::test]
    async fn no_sources_spawns_nothing() {
        let outbox = Arc::new(Outbox::new(
            Arc::new(MemoryTransport::new()) as Arc<dyn Transport>,
            OutboxLimits::default(),
        ));
        let sources = Sources::spawn(&HeraldConfig::default(), outbox);
        assert!(sources.is_empty());
        sources.shutdown().await;
    }

    #[tokio::test]
    async fn deliver_swallows_outbox_errors() {
        let transport = Arc::new(MemoryTransport::new());
        let outbox = Outbox::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            OutboxLimits::default(),
        );
        deliver(&outbox, "test", String::new(), ChatTarget::new("x")).await;
        assert!(outbox.is_empty().await);
        deliver(&outbox, "test", "hi".into(), ChatTarget::new("x")).await;
        assert_eq!(outbox.len().await, 1);
    }
}
