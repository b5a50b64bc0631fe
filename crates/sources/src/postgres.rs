//! Postgres `LISTEN`/`NOTIFY` source and trigger installer.

use std::{sync::Arc, time::Duration};

use {
    herald_config::{PostgresDatabaseConfig, PostgresSourceConfig, is_pg_identifier},
    herald_outbox::{ChatTarget, Outbox},
    secrecy::ExposeSecret,
    sqlx::{
        PgPool,
        postgres::{PgListener, PgPoolOptions},
    },
    tokio::task::JoinSet,
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
};

#[cfg(feature = "metrics")]
use herald_metrics::{counter, labels, sources as source_metrics};

use crate::{
    error::{Context, Error, Result},
    format::{Formatter, RowChange},
};

const SOURCE: &str = "postgres";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Fields at or above this many bytes are replaced once a row's JSON exceeds
/// [`LARGE_ROW_BYTES`].
const LARGE_FIELD_BYTES: usize = 248;
const LARGE_ROW_BYTES: usize = 7999;

/// Listens on every database of one Postgres source.
pub struct PostgresSource {
    config: PostgresSourceConfig,
    formatter: Formatter,
    outbox: Arc<Outbox>,
}

impl PostgresSource {
    pub fn new(config: PostgresSourceConfig, formatter: Formatter, outbox: Arc<Outbox>) -> Self {
        Self {
            config,
            formatter,
            outbox,
        }
    }

    /// Run one listener per database until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut listeners = JoinSet::new();
        for db in self.config.databases.clone() {
            let source = Arc::clone(&self);
            let cancel = cancel.clone();
            listeners.spawn(async move {
                if let Err(e) = source.listen(&db, &cancel).await {
                    error!(database = %db.database, error = %e, "postgres listener stopped");
                }
            });
        }
        while let Some(done) = listeners.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "postgres listener task panicked");
            }
        }
    }

    async fn listen(&self, db: &PostgresDatabaseConfig, cancel: &CancellationToken) -> Result<()> {
        if self.config.install_triggers {
            install_on(db, &self.config.channel).await?;
        }

        let mut listener = PgListener::connect(db.url.expose_secret())
            .await
            .with_context(|| format!("connect to {}", db.database))?;
        listener.listen(&self.config.channel).await?;
        info!(
            database = %db.database,
            channel = %self.config.channel,
            "listening for row changes"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = listener.recv() => match received {
                    Ok(notification) => self.handle_payload(notification.payload(), db).await,
                    Err(e) => {
                        // PgListener reconnects on the next recv().
                        warn!(database = %db.database, error = %e, "postgres listener error");
                        #[cfg(feature = "metrics")]
                        counter!(source_metrics::RECONNECTS_TOTAL, labels::SOURCE => SOURCE)
                            .increment(1);
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(RECONNECT_DELAY) => {},
                        }
                    },
                },
            }
        }

        info!(database = %db.database, "postgres listener stopped");
        Ok(())
    }

    pub(crate) async fn handle_payload(&self, payload: &str, listening: &PostgresDatabaseConfig) {
        let change = match RowChange::parse(payload) {
            Ok(change) => change,
            Err(e) => {
                crate::skip(SOURCE, &e);
                return;
            },
        };
        let target = self.target_for(change.database.as_deref(), listening);
        let text = self.formatter.row(&change);
        crate::deliver(&self.outbox, SOURCE, text, target).await;
    }

    /// The thread comes from the config entry named by the payload's
    /// `database_name`, falling back to the database the notice arrived on.
    pub(crate) fn target_for(
        &self,
        database: Option<&str>,
        listening: &PostgresDatabaseConfig,
    ) -> ChatTarget {
        let thread = database
            .and_then(|name| self.config.databases.iter().find(|db| db.database == name))
            .unwrap_or(listening)
            .thread_id
            .clone();
        ChatTarget::in_thread(self.config.chat_id.clone(), thread)
    }
}

/// Install triggers on every database of `config`. Returns the number of
/// tables covered.
pub async fn install_source_triggers(config: &PostgresSourceConfig) -> Result<usize> {
    let mut tables = 0;
    for db in &config.databases {
        tables += install_on(db, &config.channel).await?;
    }
    Ok(tables)
}

async fn install_on(db: &PostgresDatabaseConfig, channel: &str) -> Result<usize> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(db.url.expose_secret())
        .await
        .with_context(|| format!("connect to {}", db.database))?;
    let result = install_triggers(&pool, channel).await;
    pool.close().await;
    let tables = result?;
    info!(database = %db.database, tables, "change triggers installed");
    Ok(tables)
}

/// Create `filter_large_data`, `notify_change` and one row trigger per base
/// table of the `public` schema. Returns the number of tables.
pub async fn install_triggers(pool: &PgPool, channel: &str) -> Result<usize> {
    if !is_pg_identifier(channel) {
        return Err(Error::InvalidChannel {
            channel: channel.to_owned(),
        });
    }

    sqlx::query(&filter_function_sql()).execute(pool).await?;
    sqlx::query(&notify_function_sql(channel))
        .execute(pool)
        .await?;

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT table_name::text FROM information_schema.tables \
         WHERE table_schema = 'public' AND table_type = 'BASE TABLE'",
    )
    .fetch_all(pool)
    .await?;

    for table in &tables {
        let (drop, create) = trigger_sql(table);
        sqlx::query(&drop).execute(pool).await?;
        sqlx::query(&create).execute(pool).await?;
    }
    Ok(tables.len())
}

fn filter_function_sql() -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION filter_large_data(data JSON) RETURNS JSON AS $$
DECLARE
    result JSONB := '{{}}';
    field TEXT;
    field_value TEXT;
BEGIN
    IF octet_length(data::text) > {LARGE_ROW_BYTES} THEN
        FOR field IN SELECT json_object_keys(data)
        LOOP
            field_value := data->>field;
            IF field_value IS NULL OR octet_length(field_value) < {LARGE_FIELD_BYTES} THEN
                result := jsonb_set(result, ARRAY[field], to_jsonb(field_value));
            ELSE
                result := jsonb_set(result, ARRAY[field], '"large size"');
            END IF;
        END LOOP;
        RETURN result::json;
    END IF;
    RETURN data;
END;
$$ LANGUAGE plpgsql"#
    )
}

fn notify_function_sql(channel: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION notify_change() RETURNS TRIGGER AS $$
BEGIN
    IF (TG_OP = 'DELETE') THEN
        PERFORM pg_notify('{channel}', json_build_object(
            'action', 'delete',
            'table_name', TG_TABLE_NAME,
            'database_name', current_database(),
            'data', filter_large_data(row_to_json(OLD))
        )::text);
        RETURN OLD;
    ELSIF (TG_OP = 'UPDATE') THEN
        PERFORM pg_notify('{channel}', json_build_object(
            'action', 'update',
            'table_name', TG_TABLE_NAME,
            'database_name', current_database(),
            'new_data', filter_large_data(row_to_json(NEW)),
            'old_data', filter_large_data(row_to_json(OLD))
        )::text);
    ELSE
        PERFORM pg_notify('{channel}', json_build_object(
            'action', TG_OP,
            'table_name', TG_TABLE_NAME,
            'database_name', current_database(),
            'data', filter_large_data(row_to_json(NEW))
        )::text);
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql"#
    )
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn trigger_sql(table: &str) -> (String, String) {
    let trigger = quote_ident(&format!("trigger_{table}_change"));
    let table = quote_ident(table);
    (
        format!("DROP TRIGGER IF EXISTS {trigger} ON {table}"),
        format!(
            "CREATE TRIGGER {trigger} AFTER INSERT OR UPDATE OR DELETE ON {table} \
             FOR EACH ROW EXECUTE FUNCTION notify_change()"
        ),
    )
}
