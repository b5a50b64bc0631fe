//! `herald run` and `herald send`.

use std::sync::Arc;

use {
    anyhow::{Context, Result, bail},
    herald_common::{ChatTarget, markdown::escape_markdown_v2},
    herald_config::{AuditBackend, HeraldConfig},
    herald_metrics::{MetricsRecorderConfig, init_metrics},
    herald_outbox::{
        AuditSink, DeliveryScheduler, LogTransport, NoopAuditSink, Outbox, OutboxLimits,
        SqliteAuditSink, TracingAuditSink, Transport,
    },
    herald_sources::Sources,
    herald_telegram::TelegramTransport,
    tokio::time::Instant,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::metrics_server;

async fn build_transport(config: &HeraldConfig) -> Result<Arc<dyn Transport>> {
    if config.telegram.dry_run {
        warn!("telegram dry run: messages are logged, not sent");
        return Ok(Arc::new(LogTransport));
    }
    let transport = TelegramTransport::new(&config.telegram)?;
    transport
        .verify()
        .await
        .context("telegram token check failed")?;
    Ok(Arc::new(transport))
}

async fn build_audit_sink(config: &HeraldConfig) -> Result<Arc<dyn AuditSink>> {
    Ok(match config.audit.backend {
        AuditBackend::Off => Arc::new(NoopAuditSink),
        AuditBackend::Tracing => Arc::new(TracingAuditSink),
        AuditBackend::Sqlite => Arc::new(
            SqliteAuditSink::connect(&config.audit.database_url)
                .await
                .with_context(|| format!("failed to open {}", config.audit.database_url))?,
        ),
    })
}

/// Outbox wired with the configured transport and audit sink.
pub(crate) async fn build_outbox(config: &HeraldConfig) -> Result<Arc<Outbox>> {
    let limits = OutboxLimits::from_config(&config.outbox)?;
    let transport = build_transport(config).await?;
    let audit = build_audit_sink(config).await?;
    Ok(Arc::new(Outbox::new(transport, limits).with_audit_sink(audit)))
}

pub async fn handle_run(config: HeraldConfig) -> Result<()> {
    if config.sources.is_empty() {
        warn!("no change sources configured, only the delivery loop will run");
    }

    let metrics = init_metrics(MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        ..Default::default()
    })?;
    let server_cancel = CancellationToken::new();
    let server = match &config.metrics.listen {
        Some(listen) if config.metrics.enabled => {
            Some(metrics_server::spawn(listen, metrics, server_cancel.clone()).await?)
        },
        _ => None,
    };

    let outbox = build_outbox(&config).await?;
    let scheduler = DeliveryScheduler::new(Arc::clone(&outbox), outbox.limits().tick_interval);
    scheduler.start().await;
    let sources = Sources::spawn(&config, Arc::clone(&outbox));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    sources.shutdown().await;
    scheduler.shutdown().await;

    server_cancel.cancel();
    if let Some(server) = server {
        server.await.ok();
    }

    let stats = outbox.stats().await;
    info!(
        enqueued = stats.enqueued,
        sent = stats.sent,
        failed = stats.failed,
        dropped = stats.dropped,
        pending_entries = stats.pending_entries,
        "herald stopped"
    );
    Ok(())
}

pub async fn handle_send(
    config: HeraldConfig,
    to: String,
    thread: Option<String>,
    message: &str,
    raw: bool,
) -> Result<()> {
    let text = if raw {
        message.to_owned()
    } else {
        escape_markdown_v2(message)
    };
    let outbox = build_outbox(&config).await?;
    let target = ChatTarget::in_thread(to, thread);
    outbox.enqueue(text, target.clone()).await?;

    let deadline = Instant::now() + outbox.limits().flush_timeout;
    let left = outbox.flush(deadline).await;
    if left > 0 {
        bail!("{left} entries still pending after the flush timeout");
    }
    let stats = outbox.stats().await;
    if stats.dropped > 0 {
        bail!("the chat endpoint permanently rejected the message for {target}");
    }
    println!("sent {} fragment(s)", stats.sent);
    Ok(())
}
