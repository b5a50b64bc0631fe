//! MongoDB change-stream source.

use std::{sync::Arc, time::Duration};

use {
    futures::StreamExt,
    herald_config::{MongoDatabaseConfig, MongoSourceConfig},
    herald_outbox::{ChatTarget, Outbox},
    mongodb::{
        Client,
        bson::{Bson, Document},
        change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken},
    },
    secrecy::ExposeSecret,
    serde_json::{Map, Value},
    tokio::task::JoinSet,
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use herald_metrics::{counter, labels, sources as source_metrics};

use crate::{
    error::{Error, Result},
    format::{DocumentChange, DocumentOp, Formatter},
};

const SOURCE: &str = "mongo";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Watches every database of one MongoDB source.
pub struct MongoSource {
    config: MongoSourceConfig,
    formatter: Formatter,
    outbox: Arc<Outbox>,
}

impl MongoSource {
    pub fn new(config: MongoSourceConfig, formatter: Formatter, outbox: Arc<Outbox>) -> Self {
        Self {
            config,
            formatter,
            outbox,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut watchers = JoinSet::new();
        for db in self.config.databases.clone() {
            let source = Arc::clone(&self);
            let cancel = cancel.clone();
            watchers.spawn(async move { source.watch(&db, &cancel).await });
        }
        while let Some(done) = watchers.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "mongo watcher task panicked");
            }
        }
    }

    /// Reopen the change stream after errors, resuming from the last token seen.
    async fn watch(&self, db: &MongoDatabaseConfig, cancel: &CancellationToken) {
        let target = ChatTarget::in_thread(self.config.chat_id.clone(), db.thread_id.clone());
        let mut resume: Option<ResumeToken> = None;

        loop {
            let result = tokio::select! {
                () = cancel.cancelled() => break,
                result = self.stream_once(db, &target, &mut resume, cancel) => result,
            };
            match result {
                Ok(()) => break,
                Err(e) => {
                    warn!(database = %db.database, error = %e, "mongo change stream failed");
                    #[cfg(feature = "metrics")]
                    counter!(source_metrics::RECONNECTS_TOTAL, labels::SOURCE => SOURCE)
                        .increment(1);
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(RECONNECT_DELAY) => {},
                    }
                },
            }
        }
        info!(database = %db.database, "mongo watcher stopped");
    }

    async fn stream_once(
        &self,
        db: &MongoDatabaseConfig,
        target: &ChatTarget,
        resume: &mut Option<ResumeToken>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let client = Client::with_uri_str(db.uri.expose_secret()).await?;
        let database = client.database(&db.database);
        let mut watch = database.watch();
        if let Some(token) = resume.clone() {
            watch = watch.resume_after(token);
        }
        let mut stream = watch.await?;
        info!(database = %db.database, "watching change stream");

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                event = stream.next() => event,
            };
            let Some(event) = event else {
                return Err(Error::message("change stream closed"));
            };
            let event = event?;
            *resume = Some(event.id.clone());

            match to_change(event) {
                Ok(Some(change)) => {
                    let text = self.formatter.document(&change);
                    crate::deliver(&self.outbox, SOURCE, text, target.clone()).await;
                },
                Ok(None) => {},
                Err(e) => crate::skip(SOURCE, &e),
            }
        }
    }
}

/// Only inserts and updates are rendered; other operations yield `None`.
fn to_change(event: ChangeStreamEvent<Document>) -> Result<Option<DocumentChange>> {
    let collection = event
        .ns
        .and_then(|ns| ns.coll)
        .unwrap_or_default();

    let op = match event.operation_type {
        OperationType::Insert => {
            let doc = event
                .full_document
                .ok_or_else(|| Error::malformed("insert event without fullDocument"))?;
            DocumentOp::Insert(to_json(Bson::Document(doc)))
        },
        OperationType::Update => {
            let id = event
                .document_key
                .as_ref()
                .and_then(|key| key.get("_id"))
                .cloned()
                .map_or(Value::Null, to_json);
            let updated_fields = match event.update_description {
                Some(description) => match to_json(Bson::Document(description.updated_fields)) {
                    Value::Object(map) => map,
                    _ => Map::new(),
                },
                None => Map::new(),
            };
            DocumentOp::Update { id, updated_fields }
        },
        other => {
            debug!(operation = ?other, "ignoring change stream event");
            return Ok(None);
        },
    };

    Ok(Some(DocumentChange { collection, op }))
}

fn to_json(value: Bson) -> Value {
    value.into_relaxed_extjson()
}
