//! End-to-end dispatcher wiring: enqueue → worker → fan-out → sink send,
//! exercised against a mocked [`Sink`] rather than the real file/remote-index
//! implementations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use logagent_core::dispatcher::{
    BatcherConfig, DeadLetterQueue, Dispatcher, DispatcherConfig, PriorityClassifier, PriorityRuleConfig, RetryConfig,
};
use logagent_core::metrics::Registry;
use logagent_core::pipeline::Pipeline;
use logagent_core::position::PositionStore;
use logagent_core::record::{Cursor, Record, SourceType};
use logagent_core::sink::{DiskBuffer, MockSink};
use tokio_util::sync::CancellationToken;

async fn build_dispatcher(sinks: Vec<(String, Arc<dyn logagent_core::sink::Sink>, BatcherConfig)>) -> (Arc<Dispatcher>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let metrics = Arc::new(Registry::new());
    let dlq = Arc::new(DeadLetterQueue::open(dir.path().join("dlq")).unwrap());
    let buffer = Arc::new(DiskBuffer::open(dir.path().join("buffer")).unwrap());
    let positions = Arc::new(PositionStore::new(dir.path().join("positions.json"), 1000, Duration::from_secs(86_400)));

    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherConfig { worker_count: 1, sink_poll_interval: Duration::from_millis(5), ..Default::default() },
        Pipeline::new(Vec::new()),
        PriorityClassifier::new(PriorityRuleConfig::default()),
        sinks,
        RetryConfig::default(),
        dlq,
        buffer,
        positions,
        metrics,
    ));
    (dispatcher, dir)
}

#[tokio::test]
async fn enqueued_record_reaches_the_sink() {
    let sent_count = Arc::new(AtomicUsize::new(0));
    let counted = sent_count.clone();

    let mut sink = MockSink::new();
    sink.expect_name().return_const("mock".to_string());
    sink.expect_is_healthy().return_const(true);
    sink.expect_send().returning(move |records| {
        counted.fetch_add(records.len(), Ordering::SeqCst);
        Ok(())
    });

    let (dispatcher, _dir) =
        build_dispatcher(vec![("mock".to_string(), Arc::new(sink) as Arc<dyn logagent_core::sink::Sink>, BatcherConfig::default())])
            .await;

    let shutdown = CancellationToken::new();
    let handles = dispatcher.spawn(shutdown.clone());

    let record = Record::new(SourceType::File, "test.log", Cursor::File { inode: 1, byte_offset: 0 }, b"hello world", chrono::Utc::now());
    dispatcher.enqueue(record).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    assert_eq!(sent_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_sink_routes_the_record_to_the_dlq() {
    let mut sink = MockSink::new();
    sink.expect_name().return_const("mock".to_string());
    sink.expect_is_healthy().return_const(true);
    sink.expect_send().returning(|_records| Err(logagent_core::AgentError::SinkPermanent { sink: "mock".into(), message: "rejected".into() }));

    let (dispatcher, _dir) =
        build_dispatcher(vec![("mock".to_string(), Arc::new(sink) as Arc<dyn logagent_core::sink::Sink>, BatcherConfig::default())])
            .await;

    let shutdown = CancellationToken::new();
    let handles = dispatcher.spawn(shutdown.clone());

    let record = Record::new(SourceType::File, "test.log", Cursor::File { inode: 1, byte_offset: 0 }, b"boom", chrono::Utc::now());
    dispatcher.enqueue(record).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    assert_eq!(dispatcher.dlq().len(), 1);
}

#[tokio::test]
async fn spilled_records_drain_back_into_the_queue_and_reach_the_sink() {
    let sent_count = Arc::new(AtomicUsize::new(0));
    let counted = sent_count.clone();

    let mut sink = MockSink::new();
    sink.expect_name().return_const("mock".to_string());
    sink.expect_is_healthy().return_const(true);
    sink.expect_send().returning(move |records| {
        counted.fetch_add(records.len(), Ordering::SeqCst);
        Ok(())
    });

    let dir = tempfile::tempdir().unwrap();
    let metrics = Arc::new(Registry::new());
    let dlq = Arc::new(DeadLetterQueue::open(dir.path().join("dlq")).unwrap());
    let buffer = Arc::new(DiskBuffer::open(dir.path().join("buffer")).unwrap());
    let positions = Arc::new(PositionStore::new(dir.path().join("positions.json"), 1000, Duration::from_secs(86_400)));

    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherConfig {
            worker_count: 1,
            queue_capacity: 10,
            high_watermark: 0.8,
            critical_watermark: 0.95,
            sink_poll_interval: Duration::from_millis(5),
            ..Default::default()
        },
        Pipeline::new(Vec::new()),
        PriorityClassifier::new(PriorityRuleConfig::default()),
        vec![("mock".to_string(), Arc::new(sink) as Arc<dyn logagent_core::sink::Sink>, BatcherConfig::default())],
        RetryConfig::default(),
        dlq,
        buffer.clone(),
        positions,
        metrics,
    ));

    // Spill directly rather than driving the queue to saturation.
    for i in 0..5u64 {
        let record = Record::new(SourceType::File, "test.log", Cursor::File { inode: 1, byte_offset: i }, b"spilled", chrono::Utc::now());
        buffer.push(&record).unwrap();
    }
    assert_eq!(buffer.len(), 5);

    let shutdown = CancellationToken::new();
    let handles = dispatcher.spawn(shutdown.clone());

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    assert!(buffer.is_empty());
    assert_eq!(sent_count.load(Ordering::SeqCst), 5);
}
