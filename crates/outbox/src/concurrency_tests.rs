//! Multi-task scenarios: concurrent producers, sends racing enqueues, and
//! failing destinations.

use std::{collections::HashMap, sync::Arc, time::Duration};

use herald_common::ChatTarget;

use crate::{
    audit::{AuditEvent, AuditSink},
    audit_sqlite::SqliteAuditSink,
    entry::FragmentKind,
    limits::OutboxLimits,
    memory::MemoryTransport,
    queue::{DrainOutcome, EnqueueOutcome, Outbox},
    transport::Transport,
};

fn fast_limits() -> OutboxLimits {
    OutboxLimits {
        min_send_interval: Duration::ZERO,
        enqueue_wait_retries: 0,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_deliver_everything_once_in_order() {
    const PRODUCERS: usize = 8;
    const MESSAGES: usize = 200;

    let transport = Arc::new(MemoryTransport::new());
    let outbox = Arc::new(Outbox::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        fast_limits(),
    ));

    let consumer = {
        let outbox = Arc::clone(&outbox);
        tokio::spawn(async move {
            loop {
                match outbox.drain_one(true).await {
                    DrainOutcome::Empty => tokio::time::sleep(Duration::from_millis(1)).await,
                    DrainOutcome::Failed(e) | DrainOutcome::Dropped { error: e, .. } => {
                        panic!("unexpected failure: {e}")
                    },
                    _ => tokio::task::yield_now().await,
                }
            }
        })
    };

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let outbox = Arc::clone(&outbox);
            tokio::spawn(async move {
                let target = ChatTarget::new(format!("chat-{}", p % 3)).with_thread(p.to_string());
                for m in 0..MESSAGES {
                    outbox
                        .enqueue(format!("<{p}:{m}>"), target.clone())
                        .await
                        .unwrap();
                    if m % 17 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !outbox.is_empty().await {
        assert!(tokio::time::Instant::now() < deadline, "queue never drained");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    consumer.abort();

    // Reassemble each producer's stream from what the transport saw.
    let mut streams: HashMap<String, Vec<(usize, usize)>> = HashMap::new();
    for sent in transport.sent().await {
        for token in sent.text.split('<').filter(|t| !t.is_empty()) {
            let token = token.trim_end_matches('>');
            let (p, m) = token.split_once(':').unwrap();
            streams
                .entry(sent.target.to_string())
                .or_default()
                .push((p.parse().unwrap(), m.parse().unwrap()));
        }
    }

    assert_eq!(streams.len(), PRODUCERS);
    for (target, messages) in streams {
        let expected: Vec<usize> = (0..MESSAGES).collect();
        let got: Vec<usize> = messages.iter().map(|(_, m)| *m).collect();
        assert_eq!(got, expected, "stream for {target} out of order or lossy");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn text_coalesced_during_send_is_kept() {
    let (transport, gate) = MemoryTransport::gated();
    let transport = Arc::new(transport);
    let outbox = Arc::new(Outbox::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        fast_limits(),
    ));
    let target = ChatTarget::new("-100");
    outbox.enqueue("first;", target.clone()).await.unwrap();

    let drain = {
        let outbox = Arc::clone(&outbox);
        tokio::spawn(async move { outbox.drain_one(false).await })
    };
    transport.wait_started().await;

    // The head entry is on the wire; this lands in the same entry.
    let outcome = outbox.enqueue("second;", target.clone()).await.unwrap();
    assert!(matches!(outcome, EnqueueOutcome::Coalesced { .. }));

    gate.add_permits(1);
    let DrainOutcome::Sent(report) = drain.await.unwrap() else {
        panic!("expected a send");
    };
    assert_eq!(report.kind, FragmentKind::Whole);
    assert!(!report.entry_done);

    let entries = outbox.snapshot().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].text, "second;");
    assert!(!entries[0].is_continuation());

    gate.add_permits(1);
    assert!(matches!(outbox.drain_one(false).await, DrainOutcome::Sent(_)));
    let texts: Vec<_> = transport.sent().await.into_iter().map(|m| m.text).collect();
    assert_eq!(texts, vec!["first;", "second;"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drain_during_inflight_send_is_busy() {
    let (transport, gate) = MemoryTransport::gated();
    let transport = Arc::new(transport);
    let outbox = Arc::new(Outbox::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        fast_limits(),
    ));
    outbox.enqueue("a", ChatTarget::new("x")).await.unwrap();
    outbox.enqueue("b", ChatTarget::new("y")).await.unwrap();

    let drain = {
        let outbox = Arc::clone(&outbox);
        tokio::spawn(async move { outbox.drain_one(false).await })
    };
    transport.wait_started().await;

    assert!(matches!(outbox.drain_one(false).await, DrainOutcome::Busy));
    assert!(outbox.stats().await.in_flight);

    gate.add_permits(1);
    assert!(matches!(drain.await.unwrap(), DrainOutcome::Sent(_)));
    assert!(!outbox.stats().await.in_flight);
    assert_eq!(outbox.len().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn split_entry_keeps_appended_text_after_remainder() {
    let (transport, gate) = MemoryTransport::gated();
    let transport = Arc::new(transport);
    let outbox = Arc::new(Outbox::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        OutboxLimits {
            combine_threshold: 10_000,
            ..fast_limits()
        },
    ));
    let target = ChatTarget::new("-100");
    outbox.enqueue("a".repeat(5000), target.clone()).await.unwrap();

    let drain = {
        let outbox = Arc::clone(&outbox);
        tokio::spawn(async move { outbox.drain_one(false).await })
    };
    transport.wait_started().await;
    outbox.enqueue("tail", target).await.unwrap();
    gate.add_permits(1);

    let DrainOutcome::Sent(report) = drain.await.unwrap() else {
        panic!("expected a send");
    };
    assert_eq!(report.kind, FragmentKind::Head);

    let entries = outbox.snapshot().await;
    assert_eq!(entries[0].len(), 910 + 4);
    assert!(entries[0].text.ends_with("atail"));
    assert!(entries[0].is_continuation());
}

#[tokio::test]
async fn audit_sink_sees_every_step() {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    SqliteAuditSink::init(&pool).await.unwrap();
    let sink = Arc::new(SqliteAuditSink::new(pool));

    let transport = Arc::new(MemoryTransport::new());
    transport.fail_next(1);
    let outbox = Outbox::new(Arc::clone(&transport) as Arc<dyn Transport>, fast_limits())
        .with_audit_sink(Arc::clone(&sink) as Arc<dyn AuditSink>);

    outbox.enqueue("a", ChatTarget::new("x")).await.unwrap();
    outbox.drain_one(false).await;
    outbox.drain_one(false).await;

    let kinds: Vec<_> = sink
        .recent(10)
        .await
        .unwrap()
        .into_iter()
        .rev()
        .map(|r| r.event.kind())
        .collect();
    assert_eq!(kinds, vec!["enqueued", "send_failed", "sent"]);

    let recent = sink.recent(1).await.unwrap();
    assert!(matches!(
        recent[0].event,
        AuditEvent::Sent {
            fragment: FragmentKind::Whole,
            message_id: Some(1),
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn rejected_destination_does_not_block_others() {
    let transport = Arc::new(MemoryTransport::new());
    transport.reject_destination("gone").await;
    let outbox = Outbox::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        OutboxLimits::default(),
    );
    outbox.enqueue("bad", ChatTarget::new("gone")).await.unwrap();
    outbox.enqueue("good", ChatTarget::new("ok")).await.unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        outcomes.push(outbox.drain_one(true).await);
        tokio::time::advance(Duration::from_secs(1)).await;
    }

    assert!(matches!(outcomes[0], DrainOutcome::Dropped { .. }));
    assert!(matches!(outcomes[1], DrainOutcome::Sent(_)));
    assert!(outcomes[2..].iter().all(|o| matches!(o, DrainOutcome::Empty)));
    assert_eq!(transport.attempts(), 2);

    let texts: Vec<_> = transport.sent().await.into_iter().map(|m| m.text).collect();
    assert_eq!(texts, vec!["good"]);
    let stats = outbox.stats().await;
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending_entries, 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_keep_the_head_entry() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_next(3);
    let outbox = Outbox::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        OutboxLimits::default(),
    );
    outbox.enqueue("first", ChatTarget::new("a")).await.unwrap();
    outbox.enqueue("second", ChatTarget::new("b")).await.unwrap();

    let left = outbox
        .flush(tokio::time::Instant::now() + Duration::from_secs(30))
        .await;
    assert_eq!(left, 0);

    let texts: Vec<_> = transport.sent().await.into_iter().map(|m| m.text).collect();
    assert_eq!(texts, vec!["first", "second"]);
    assert_eq!(outbox.stats().await.dropped, 0);
}

#[tokio::test]
async fn dropped_entry_is_audited() {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    SqliteAuditSink::init(&pool).await.unwrap();
    let sink = Arc::new(SqliteAuditSink::new(pool));

    let transport = Arc::new(MemoryTransport::new());
    transport.reject_destination("gone").await;
    let outbox = Outbox::new(Arc::clone(&transport) as Arc<dyn Transport>, fast_limits())
        .with_audit_sink(Arc::clone(&sink) as Arc<dyn AuditSink>);

    outbox.enqueue("x".repeat(12), ChatTarget::new("gone")).await.unwrap();
    outbox.drain_one(false).await;

    let recent = sink.recent(1).await.unwrap();
    assert!(matches!(
        &recent[0].event,
        AuditEvent::Dropped {
            destination,
            dropped_len: 12,
            ..
        } if destination == "gone"
    ));
    assert!(outbox.is_empty().await);
}
