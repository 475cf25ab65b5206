//! Buffer Integration Tests
//!
//! Drive the public handle against the in-memory transport and check what
//! reaches the wire: one merged datapoint per key per flush.

use statsd_buffer::dst::DeterministicRng;
use statsd_buffer::transport::{SimulatedTransport, SimulatedTransportConfig};
use statsd_buffer::{
    spawn_buffer, BufferConfig, BufferError, Event, InMemoryTransport, MergeError, TransportError,
};
use std::time::Duration;

fn manual_flush_config() -> BufferConfig {
    BufferConfig::with_interval(Duration::from_secs(3600))
}

#[tokio::test]
async fn test_counter_deltas_merge_into_one_send() {
    let transport = InMemoryTransport::new();
    let (buffer, task) = spawn_buffer(manual_flush_config(), transport.clone()).unwrap();

    buffer.increment("requests", 1).await.unwrap();
    buffer.increment("requests", 2).await.unwrap();
    buffer.decrement("requests", 1).await.unwrap();
    buffer.flush().await.unwrap();

    assert_eq!(transport.sent(), vec![Event::increment("requests", 2)]);
    assert_eq!(transport.attempts(), 1);

    buffer.close().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_last_value_wins_for_gauge_absolute_total() {
    let transport = InMemoryTransport::new();
    let (buffer, task) = spawn_buffer(manual_flush_config(), transport.clone()).unwrap();

    buffer.gauge("queue.depth", 10).await.unwrap();
    buffer.gauge("queue.depth", 3).await.unwrap();
    buffer.absolute("batch.size", 7).await.unwrap();
    buffer.absolute("batch.size", 9).await.unwrap();
    buffer.total("reads", 100).await.unwrap();
    buffer.total("reads", 140).await.unwrap();
    buffer.flush().await.unwrap();

    assert_eq!(transport.sent_for("queue.depth"), vec![Event::gauge("queue.depth", 3)]);
    assert_eq!(transport.sent_for("batch.size"), vec![Event::absolute("batch.size", 9)]);
    assert_eq!(transport.sent_for("reads"), vec![Event::total("reads", 140)]);
    assert_eq!(transport.sent().len(), 3);

    buffer.close().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_flush_clears_the_map() {
    let transport = InMemoryTransport::new();
    let (buffer, task) = spawn_buffer(manual_flush_config(), transport.clone()).unwrap();

    buffer.increment("a", 1).await.unwrap();
    buffer.flush().await.unwrap();
    assert_eq!(transport.take_sent().len(), 1);

    // Nothing new since the last flush
    buffer.flush().await.unwrap();
    assert!(transport.sent().is_empty());

    // A fresh event starts a fresh entry, not a continuation
    buffer.increment("a", 5).await.unwrap();
    buffer.flush().await.unwrap();
    assert_eq!(transport.sent(), vec![Event::increment("a", 5)]);

    buffer.close().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_close_flushes_every_key_once_then_closes_transport() {
    let transport = InMemoryTransport::new();
    let (buffer, task) = spawn_buffer(manual_flush_config(), transport.clone()).unwrap();

    for i in 0..25 {
        buffer.increment(format!("key.{}", i), 1).await.unwrap();
        buffer.increment(format!("key.{}", i), 1).await.unwrap();
    }
    buffer.close().await.unwrap();
    task.await.unwrap().unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 25);
    for i in 0..25 {
        let key = format!("key.{}", i);
        assert_eq!(transport.sent_for(&key), vec![Event::increment(key.as_str(), 2)]);
    }
    assert_eq!(transport.close_count(), 1);
    assert_eq!(transport.sends_after_close(), 0);
    assert!(transport.is_closed());
}

#[tokio::test]
async fn test_failed_send_does_not_block_siblings() {
    let transport = InMemoryTransport::new();
    transport.reject_key("bad");
    let (buffer, task) = spawn_buffer(manual_flush_config(), transport.clone()).unwrap();

    buffer.increment("good.1", 1).await.unwrap();
    buffer.increment("bad", 1).await.unwrap();
    buffer.increment("good.2", 1).await.unwrap();

    match buffer.flush().await {
        Err(BufferError::Flush {
            failed,
            attempted,
            source: TransportError::Rejected(_),
        }) => {
            assert_eq!(failed, 1);
            assert_eq!(attempted, 3);
        }
        other => panic!("expected rejected flush, got {:?}", other),
    }
    assert_eq!(transport.sent().len(), 2);
    assert!(transport.sent_for("bad").is_empty());

    // Failed sends are dropped, not retried on the next flush
    buffer.flush().await.unwrap();
    assert_eq!(transport.attempts(), 3);

    let stats = buffer.stats().await.unwrap();
    assert_eq!(stats.sends_attempted, 3);
    assert_eq!(stats.sends_failed, 1);

    buffer.close().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_panicking_send_is_contained() {
    let transport = InMemoryTransport::new();
    transport.panic_on_key("boom");
    let (buffer, task) = spawn_buffer(manual_flush_config(), transport.clone()).unwrap();

    buffer.increment("boom", 1).await.unwrap();
    buffer.increment("fine", 1).await.unwrap();

    let err = buffer.flush().await.unwrap_err();
    assert!(matches!(
        err,
        BufferError::Flush {
            failed: 1,
            source: TransportError::Panicked(_),
            ..
        }
    ));
    assert_eq!(transport.sent(), vec![Event::increment("fine", 1)]);

    // The actor survived and still serves requests
    buffer.increment("after", 1).await.unwrap();
    buffer.close().await.unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(transport.sent_for("after").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sends_within_a_flush_run_concurrently() {
    let transport = InMemoryTransport::new().with_latency(Duration::from_millis(50));
    let (buffer, task) = spawn_buffer(manual_flush_config(), transport.clone()).unwrap();

    for i in 0..10 {
        buffer.gauge(format!("g.{}", i), i).await.unwrap();
    }
    buffer.close().await.unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(transport.sent().len(), 10);
    assert!(transport.max_in_flight() > 1);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_flush_on_interval() {
    let transport = InMemoryTransport::new();
    let config = BufferConfig::with_interval(Duration::from_secs(1));
    let (buffer, task) = spawn_buffer(config, transport.clone()).unwrap();

    buffer.increment("ticks", 3).await.unwrap();

    // Not before the first full interval
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(transport.sent().is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.take_sent(), vec![Event::increment("ticks", 3)]);

    buffer.increment("ticks", 4).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.take_sent(), vec![Event::increment("ticks", 4)]);

    let stats = buffer.stats().await.unwrap();
    assert!(stats.flushes >= 2);

    buffer.close().await.unwrap();
    task.await.unwrap().unwrap();
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn test_timing_samples_merge_into_distribution() {
    let transport = InMemoryTransport::new();
    let (buffer, task) = spawn_buffer(manual_flush_config(), transport.clone()).unwrap();

    for ms in [10, 30, 20] {
        buffer.timing("db.query", Duration::from_millis(ms)).await.unwrap();
    }
    buffer.close().await.unwrap();
    task.await.unwrap().unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Event::Timing { name, distribution } => {
            assert_eq!(name, "db.query");
            assert_eq!(distribution.count(), 3);
            assert_eq!(distribution.sum(), Duration::from_millis(60));
            assert_eq!(distribution.min(), Duration::from_millis(10));
            assert_eq!(distribution.max(), Duration::from_millis(30));
        }
        other => panic!("expected timing, got {:?}", other),
    }
    let lines = sent[0].stats();
    assert_eq!(lines[0], "db.query.count:3|c");
    assert_eq!(lines[1], "db.query.avg:20|ms");
}

#[tokio::test]
async fn test_kind_mismatch_stops_actor_after_flushing() {
    let transport = InMemoryTransport::new();
    let (buffer, task) = spawn_buffer(manual_flush_config(), transport.clone()).unwrap();

    buffer.increment("other", 1).await.unwrap();
    buffer.increment("mixed", 1).await.unwrap();
    buffer.gauge("mixed", 5).await.unwrap();

    let exit = task.await.unwrap();
    match exit {
        Err(BufferError::Merge(MergeError::KindMismatch { key, .. })) => {
            assert_eq!(key, "mixed");
        }
        other => panic!("expected kind mismatch, got {:?}", other),
    }

    // Everything merged before the fault was flushed
    assert_eq!(transport.sent_for("other"), vec![Event::increment("other", 1)]);
    assert_eq!(transport.sent_for("mixed"), vec![Event::increment("mixed", 1)]);

    assert!(buffer.is_closed());
    assert!(matches!(
        buffer.increment("late", 1).await,
        Err(BufferError::Closed)
    ));
}

#[tokio::test]
async fn test_counter_overflow_is_fatal() {
    let transport = InMemoryTransport::new();
    let (buffer, task) = spawn_buffer(manual_flush_config(), transport.clone()).unwrap();

    buffer.increment("big", i64::MAX).await.unwrap();
    buffer.increment("big", 1).await.unwrap();

    assert!(matches!(
        task.await.unwrap(),
        Err(BufferError::Merge(MergeError::Overflow { .. }))
    ));
    assert_eq!(transport.sent(), vec![Event::increment("big", i64::MAX)]);
}

#[tokio::test(start_paused = true)]
async fn test_close_timeout_hands_transport_to_task() {
    let transport = InMemoryTransport::new().with_latency(Duration::from_secs(10));
    let config = BufferConfig {
        close_timeout: Some(Duration::from_millis(100)),
        ..manual_flush_config()
    };
    let (buffer, task) = spawn_buffer(config, transport.clone()).unwrap();

    buffer.increment("slow", 1).await.unwrap();
    let err = buffer.close().await.unwrap_err();
    assert!(matches!(err, BufferError::CloseTimeout(d) if d == Duration::from_millis(100)));
    assert_eq!(transport.close_count(), 0);
    assert!(buffer.is_closed());

    // The task finishes its flush, then closes the transport itself
    task.await.unwrap().unwrap();
    assert_eq!(transport.sent(), vec![Event::increment("slow", 1)]);
    assert_eq!(transport.close_count(), 1);
    assert_eq!(transport.sends_after_close(), 0);

    assert!(matches!(buffer.close().await, Err(BufferError::Closed)));
    assert_eq!(transport.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_timeout_on_full_channel_keeps_buffer_open() {
    let transport = InMemoryTransport::new().with_latency(Duration::from_secs(10));
    let config = BufferConfig {
        channel_capacity: 1,
        close_timeout: Some(Duration::from_millis(100)),
        ..manual_flush_config()
    };
    let (buffer, task) = spawn_buffer(config, transport.clone()).unwrap();

    // Park the task inside a slow flush, then fill the channel behind it
    buffer.increment("first", 1).await.unwrap();
    let flusher = buffer.clone();
    let pending_flush = tokio::spawn(async move { flusher.flush().await });
    tokio::time::sleep(Duration::from_millis(1)).await;
    buffer.increment("second", 1).await.unwrap();

    let err = buffer.close().await.unwrap_err();
    assert!(matches!(err, BufferError::CloseTimeout(_)));
    assert!(!buffer.is_closed());
    assert_eq!(transport.close_count(), 0);

    // Still accepting metrics, and a later close goes through
    pending_flush.await.unwrap().unwrap();
    buffer.increment("third", 1).await.unwrap();
    match buffer.close().await {
        // Final flush still pays the send latency, so the task closes the transport
        Err(BufferError::CloseTimeout(_)) => {}
        other => panic!("expected close timeout on slow final flush, got {:?}", other),
    }
    task.await.unwrap().unwrap();

    assert_eq!(transport.sent_for("first"), vec![Event::increment("first", 1)]);
    assert_eq!(transport.sent_for("second"), vec![Event::increment("second", 1)]);
    assert_eq!(transport.sent_for("third"), vec![Event::increment("third", 1)]);
    assert_eq!(transport.close_count(), 1);
    assert_eq!(transport.sends_after_close(), 0);
}

#[tokio::test]
async fn test_close_reports_flush_error_over_close_error() {
    let memory = InMemoryTransport::new();
    memory.reject_key("bad");
    let transport = SimulatedTransport::new(
        memory,
        DeterministicRng::new(7),
        SimulatedTransportConfig {
            close_fail_prob: 1.0,
            ..SimulatedTransportConfig::no_faults()
        },
    );
    let (buffer, task) = spawn_buffer(manual_flush_config(), transport.clone()).unwrap();

    buffer.increment("bad", 1).await.unwrap();
    let err = buffer.close().await.unwrap_err();
    match err {
        BufferError::Flush {
            failed,
            attempted,
            source: TransportError::Rejected(_),
        } => {
            assert_eq!(failed, 1);
            assert_eq!(attempted, 1);
        }
        other => panic!("expected flush error to win, got {:?}", other),
    }
    task.await.unwrap().unwrap();

    assert_eq!(transport.stats().close_failures, 1);
    assert_eq!(transport.inner().close_count(), 1);
}

#[tokio::test]
async fn test_close_reports_transport_error_after_clean_flush() {
    let transport = SimulatedTransport::new(
        InMemoryTransport::new(),
        DeterministicRng::new(7),
        SimulatedTransportConfig {
            close_fail_prob: 1.0,
            ..SimulatedTransportConfig::no_faults()
        },
    );
    let (buffer, task) = spawn_buffer(manual_flush_config(), transport.clone()).unwrap();

    buffer.increment("fine", 1).await.unwrap();
    let err = buffer.close().await.unwrap_err();
    assert!(matches!(err, BufferError::Transport(TransportError::Io(_))));
    task.await.unwrap().unwrap();

    assert_eq!(transport.inner().sent(), vec![Event::increment("fine", 1)]);
    assert_eq!(transport.inner().close_count(), 1);
}

#[tokio::test]
async fn test_decrement_by_min_is_refused() {
    let transport = InMemoryTransport::new();
    let (buffer, task) = spawn_buffer(manual_flush_config(), transport.clone()).unwrap();

    let err = buffer.decrement("floor", i64::MIN).await.unwrap_err();
    assert!(matches!(
        err,
        BufferError::Merge(MergeError::Overflow { ref key }) if key == "floor"
    ));

    // Refused up front; the buffer keeps running
    buffer.decrement("floor", i64::MAX).await.unwrap();
    buffer.close().await.unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(transport.sent(), vec![Event::increment("floor", -i64::MAX)]);
}

#[tokio::test]
async fn test_dropping_every_handle_flushes() {
    let transport = InMemoryTransport::new();
    let (buffer, task) = spawn_buffer(manual_flush_config(), transport.clone()).unwrap();

    let producer = buffer.clone();
    tokio::spawn(async move {
        producer.increment("background", 2).await.unwrap();
    })
    .await
    .unwrap();
    buffer.increment("background", 3).await.unwrap();
    drop(buffer);

    task.await.unwrap().unwrap();
    assert_eq!(transport.sent(), vec![Event::increment("background", 5)]);
    assert_eq!(transport.close_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers() {
    let transport = InMemoryTransport::new();
    let (buffer, task) = spawn_buffer(BufferConfig::test(), transport.clone()).unwrap();

    let mut producers = Vec::new();
    for p in 0..8 {
        let buffer = buffer.clone();
        producers.push(tokio::spawn(async move {
            for _ in 0..250 {
                buffer.increment("shared", 1).await.unwrap();
            }
            buffer.gauge(format!("owned.{}", p), p).await.unwrap();
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    buffer.close().await.unwrap();
    task.await.unwrap().unwrap();

    let total: i64 = transport
        .sent_for("shared")
        .iter()
        .map(|e| match e {
            Event::Increment { value, .. } => *value,
            other => panic!("unexpected event {:?}", other),
        })
        .sum();
    assert_eq!(total, 2000);
    for p in 0..8 {
        assert_eq!(
            transport.sent_for(&format!("owned.{}", p)),
            vec![Event::gauge(format!("owned.{}", p), p)]
        );
    }
    assert_eq!(transport.close_count(), 1);
}

#[tokio::test]
async fn test_stats_track_merges() {
    let (buffer, task) = spawn_buffer(manual_flush_config(), InMemoryTransport::new()).unwrap();

    buffer.increment("a", 1).await.unwrap();
    buffer.increment("a", 1).await.unwrap();
    buffer.gauge("b", 1).await.unwrap();

    let stats = buffer.stats().await.unwrap();
    assert_eq!(stats.events_received, 3);
    assert_eq!(stats.events_merged, 1);
    assert_eq!(stats.pending_keys, 2);
    assert_eq!(stats.sends_attempted, 0);

    buffer.flush().await.unwrap();
    let stats = buffer.stats().await.unwrap();
    assert_eq!(stats.pending_keys, 0);
    assert_eq!(stats.sends_attempted, 2);
    assert_eq!(stats.flushes, 1);

    buffer.close().await.unwrap();
    task.await.unwrap().unwrap();
}
