//! Kafka topic source.

use std::{sync::Arc, time::Duration};

use {
    herald_config::KafkaSourceConfig,
    herald_outbox::{ChatTarget, Outbox},
    rdkafka::{
        ClientConfig,
        consumer::{Consumer, StreamConsumer},
        message::Message,
    },
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

#[cfg(feature = "metrics")]
use herald_metrics::{counter, labels, sources as source_metrics};

use crate::{
    error::{Error, Result},
    format::{Formatter, TopicRecord},
};

const SOURCE: &str = "kafka";
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Consumes every non-excluded topic of a cluster into one chat target.
pub struct KafkaSource {
    config: KafkaSourceConfig,
    formatter: Formatter,
    outbox: Arc<Outbox>,
}

impl KafkaSource {
    pub fn new(config: KafkaSourceConfig, formatter: Formatter, outbox: Arc<Outbox>) -> Self {
        Self {
            config,
            formatter,
            outbox,
        }
    }

    fn consumer(&self) -> Result<StreamConsumer> {
        let offset_reset = if self.config.from_beginning {
            "earliest"
        } else {
            "latest"
        };
        Ok(ClientConfig::new()
            .set("bootstrap.servers", self.config.brokers.join(","))
            .set("group.id", &self.config.group_id)
            .set("client.id", &self.config.client_id)
            .set("auto.offset.reset", offset_reset)
            .set("enable.auto.commit", "true")
            .create()?)
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let consumer = self.consumer()?;
        let metadata = consumer.fetch_metadata(None, METADATA_TIMEOUT)?;
        let topics = subscribable_topics(
            metadata.topics().iter().map(|topic| topic.name()),
            &self.config.exclude_topics,
        );
        if topics.is_empty() {
            return Err(Error::message("no kafka topics to subscribe to"));
        }
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&names)?;
        info!(topics = topics.len(), group_id = %self.config.group_id, "kafka consumer subscribed");

        let target = ChatTarget::in_thread(self.config.chat_id.clone(), self.config.thread_id.clone());
        let cap = self.outbox.limits().transport_cap;

        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                received = consumer.recv() => received,
            };
            let record = received.map(|message| {
                TopicRecord::decode(
                    message.topic(),
                    message.partition(),
                    message.offset(),
                    message.payload(),
                )
            });

            match record {
                Ok(Ok(record)) => {
                    let text = self.formatter.topic_record(&record);
                    if fits(&text, cap) {
                        crate::deliver(&self.outbox, SOURCE, text, target.clone()).await;
                    } else {
                        crate::skip(
                            SOURCE,
                            &Error::malformed(format!(
                                "{}/{}@{} renders to {} chars, cap is {cap}",
                                record.topic,
                                record.partition,
                                record.offset,
                                text.chars().count()
                            )),
                        );
                    }
                },
                Ok(Err(e)) => crate::skip(SOURCE, &e),
                Err(e) => {
                    warn!(error = %e, "kafka consumer error");
                    #[cfg(feature = "metrics")]
                    counter!(source_metrics::RECONNECTS_TOTAL, labels::SOURCE => SOURCE)
                        .increment(1);
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(ERROR_BACKOFF) => {},
                    }
                },
            }
        }

        info!("kafka consumer stopped");
        Ok(())
    }
}

fn subscribable_topics<'a>(
    all: impl IntoIterator<Item = &'a str>,
    exclude: &[String],
) -> Vec<String> {
    all.into_iter()
        .filter(|topic| !exclude.iter().any(|excluded| excluded.as_str() == *topic))
        .map(str::to_owned)
        .collect()
}

/// Records must render strictly below the transport cap; they are never split.
fn fits(text: &str, cap: usize) -> bool {
    text.chars().count() < cap
}
