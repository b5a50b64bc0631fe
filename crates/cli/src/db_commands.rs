//! Database-side commands: Postgres trigger installation and the audit log.

use {
    anyhow::{Context, Result, bail},
    herald_config::{AuditBackend, HeraldConfig},
    herald_outbox::{AuditEvent, SqliteAuditSink},
};

/// Install change triggers on every configured Postgres database.
pub async fn handle_install_triggers(config: &HeraldConfig) -> Result<()> {
    if config.sources.postgres.is_empty() {
        println!("No Postgres sources configured.");
        return Ok(());
    }

    let mut total = 0;
    for source in &config.sources.postgres {
        let tables = herald_sources::install_source_triggers(source)
            .await
            .with_context(|| format!("failed to install triggers for chat {}", source.chat_id))?;
        for db in &source.databases {
            println!("Installed: {} (channel {})", db.database, source.channel);
        }
        total += tables;
    }
    println!("Change triggers in place on {total} table(s).");
    Ok(())
}

/// Print the most recent audit records, newest first.
pub async fn handle_audit(config: &HeraldConfig, limit: u32) -> Result<()> {
    if config.audit.backend != AuditBackend::Sqlite {
        bail!("the audit log is only kept with `audit.backend = \"sqlite\"`");
    }
    let sink = SqliteAuditSink::connect(&config.audit.database_url)
        .await
        .with_context(|| format!("failed to open {}", config.audit.database_url))?;

    let records = sink.recent(limit).await?;
    if records.is_empty() {
        println!("No audit records.");
        return Ok(());
    }
    for record in records {
        println!("{:>6}  {:>13}  {}", record.id, record.created_at, describe(&record.event));
    }
    Ok(())
}

fn describe(event: &AuditEvent) -> String {
    match event {
        AuditEvent::Enqueued {
            entry_id,
            destination,
            text_len,
            coalesced,
            ..
        } => format!(
            "enqueued     #{entry_id} -> {destination} ({text_len} chars{})",
            if *coalesced { ", coalesced" } else { "" }
        ),
        AuditEvent::Sent {
            entry_id,
            destination,
            fragment,
            sent_len,
            message_id,
            ..
        } => format!(
            "sent         #{entry_id} -> {destination} ({} fragment, {sent_len} chars, message {})",
            fragment.as_str(),
            message_id.map_or_else(|| "-".to_string(), |id| id.to_string())
        ),
        AuditEvent::SendFailed {
            entry_id,
            destination,
            error,
            ..
        } => format!("send_failed  #{entry_id} -> {destination}: {error}"),
        AuditEvent::Dropped {
            entry_id,
            destination,
            dropped_len,
            error,
            ..
        } => format!("dropped      #{entry_id} -> {destination} ({dropped_len} chars): {error}"),
    }
}
