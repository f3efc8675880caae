mod common;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{emergency_ids, spawn_upstream, test_config, Upstream};
use jobstream_records::{ProcessorConfig, RecordProcessor};
use jobstream_storage::{BatchFileWriter, PageFetcher};
use jobstream_sync::pipeline::{Producer, ProducerEnd};
use jobstream_sync::{ingestion_queue, ProgressEvent};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn producer(
    url: String,
    dir: &Path,
    batch_size: usize,
) -> (Producer, mpsc::UnboundedReceiver<ProgressEvent>) {
    let config = test_config(url, dir);
    let (events, rx) = mpsc::unbounded_channel();
    let producer = Producer {
        fetcher: Arc::new(PageFetcher::new(config.fetch_config()).unwrap()),
        processor: Arc::new(RecordProcessor::new(ProcessorConfig::default())),
        writer: BatchFileWriter::new(dir).with_tabular_exports(false),
        batch_size,
        start_page: 1,
        max_pages: None,
        max_failed_pages: 3,
        stop: CancellationToken::new(),
        abort: CancellationToken::new(),
        events,
    };
    (producer, rx)
}

fn drain(mut rx: mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn consumer_leaving_mid_page_dumps_the_rest_of_the_page() {
    let dir = tempdir().unwrap();
    let (url, _upstream) = spawn_upstream(Upstream::new(1, 10)).await;
    let (producer, events) = producer(url, dir.path(), 3);
    let (tx, mut rx) = ingestion_queue(1);

    let run = tokio::spawn(producer.run(tx));
    // First batch fills the only slot; the second waits for space.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let queued = rx.close_and_drain();
    let report = run.await.unwrap();

    assert_eq!(report.end, ProducerEnd::ConsumerGone);
    assert!(!report.sentinel_sent);
    assert_eq!(report.batches_enqueued, 1);
    assert_eq!(report.last_page, None);
    assert_eq!(queued.len(), 1);

    let dumped = emergency_ids(dir.path());
    assert_eq!(dumped.len(), 7);
    let mut seen: HashSet<String> = dumped.into_iter().collect();
    seen.extend(queued[0].records.iter().map(|r| r.id.clone()));
    assert_eq!(seen.len(), 10, "every record is either queued or dumped");

    assert!(drain(events).contains(&ProgressEvent::RecordsDumped {
        records: 7,
        stored: true,
        reason: "unqueued_batch",
    }));
}

#[tokio::test]
async fn closed_queue_stops_the_producer_before_fetching() {
    let dir = tempdir().unwrap();
    let (url, upstream) = spawn_upstream(Upstream::new(5, 2)).await;
    let (producer, _events) = producer(url, dir.path(), 2);
    let (tx, mut rx) = ingestion_queue(4);
    assert!(rx.close_and_drain().is_empty());

    let report = producer.run(tx).await;
    assert_eq!(report.end, ProducerEnd::ConsumerGone);
    assert_eq!(report.pages_processed, 0);
    assert_eq!(upstream.hits(), 0);
    assert!(emergency_ids(dir.path()).is_empty());
}
