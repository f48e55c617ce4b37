//! Integration test for the consumer pool's at-least-once guarantee under
//! a sink failure, the second half of the design's pool scenario: a sink
//! that throws on its first call leaves the batch pending, and a later
//! burst redelivers it via the recovery path and stores it exactly once.

use std::sync::Arc;

use core::sink::Sink;
use core::stream::EventStream;
use core::stream_sqlite::SqliteEventStream;
use serde_json::json;

use crate::pool::{ConsumerPool, WorkerConfig};
use crate::sink_reference::ReferenceSink;

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        stream_name: "events".to_string(),
        destination: "events".to_string(),
        consumer_group: "archivists".to_string(),
        batch_size: 10,
        block_timeout_ms: 50,
        recover_idle_ms: 0,
        backoff_base_ms: 10,
        backoff_cap_ms: 100,
    }
}

#[tokio::test]
async fn sink_failure_is_recovered_and_stored_exactly_once_per_id() {
    let stream_dir = tempfile::tempdir().unwrap();
    let sink_dir = tempfile::tempdir().unwrap();

    let stream: Arc<dyn EventStream> = Arc::new(
        SqliteEventStream::open(stream_dir.path().join("s.db"))
            .await
            .unwrap()
            .with_poll_interval_ms(5),
    );
    for i in 0..5 {
        stream.append("events", json!({"i": i})).await.unwrap();
    }

    let reference_sink = Arc::new(ReferenceSink::open(sink_dir.path().join("sink.db")).await.unwrap());
    reference_sink.ensure_destination("events").await.unwrap();
    reference_sink.poison("events").await;
    let sink: Arc<dyn Sink> = reference_sink.clone();

    let pool = ConsumerPool::new(stream.clone(), sink.clone(), worker_config(), 1);
    pool.start(true).await;

    // The poisoned store call left every entry pending and unacknowledged.
    let stored_after_failure = count_rows(&reference_sink).await;
    assert_eq!(stored_after_failure, 0);

    let pool = ConsumerPool::new(stream, sink, worker_config(), 1);
    pool.start(true).await;

    let stored_after_recovery = count_rows(&reference_sink).await;
    assert_eq!(stored_after_recovery, 5);
}

async fn count_rows(sink: &ReferenceSink) -> i64 {
    sink.row_count("events").await
}
