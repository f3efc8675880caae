//! Producer and consumer tasks joined by the ingestion queue.
//!
//! Neither task touches `RunState`; both report through [`ProgressEvent`]s
//! that the orchestrator applies.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use jobstream_core::{Batch, JobRecord, ValidationCounts};
use jobstream_records::RecordProcessor;
use jobstream_storage::{BatchFileWriter, FetchError, PageFetcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::persist::{PersistOutcome, PersistenceCoordinator};
use crate::queue::{EnqueueError, QueueItem, QueueReceiver, QueueSender};

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    PageProcessed {
        page: u32,
        listings: usize,
        counts: ValidationCounts,
    },
    PageFailed {
        page: u32,
        kind: &'static str,
        message: String,
    },
    BatchStored {
        batch_id: Uuid,
        records: usize,
        to_file: bool,
    },
    BatchLost {
        batch_id: Uuid,
        records: usize,
        reason: String,
    },
    CircuitOpened,
    /// Records diverted to an emergency dump; `stored` is false if that write failed too.
    RecordsDumped {
        records: usize,
        stored: bool,
        reason: &'static str,
    },
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;

fn emit(events: &ProgressSender, event: ProgressEvent) {
    if events.send(event).is_err() {
        debug!("progress receiver dropped");
    }
}

/// Dumps records that never reached persistence and reports the outcome.
async fn dump_records(
    writer: &BatchFileWriter,
    events: &ProgressSender,
    reason: &'static str,
    records: &[JobRecord],
) {
    if records.is_empty() {
        return;
    }
    let stored = match writer.emergency_dump(reason, records).await {
        Ok(_) => true,
        Err(err) => {
            error!(
                critical = true,
                records = records.len(),
                reason,
                error = %err,
                "emergency dump failed"
            );
            false
        }
    };
    emit(
        events,
        ProgressEvent::RecordsDumped {
            records: records.len(),
            stored,
            reason,
        },
    );
}

/// Collects validated records into fixed-size batches, rejecting ids already
/// present in the batch under construction.
#[derive(Debug)]
pub struct BatchAccumulator {
    size: usize,
    next_seq: u64,
    records: Vec<JobRecord>,
    ids: HashSet<String>,
}

impl BatchAccumulator {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            next_seq: 1,
            records: Vec::new(),
            ids: HashSet::new(),
        }
    }

    /// Returns false when the record's id is already in the current batch.
    pub fn push(&mut self, record: JobRecord) -> bool {
        if !self.ids.insert(record.id.clone()) {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.size
    }

    pub fn pending(&self) -> &[JobRecord] {
        &self.records
    }

    /// Seals the current records into a batch, if there are any.
    pub fn take(&mut self) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }
        self.ids.clear();
        let batch = Batch::new(self.next_seq, std::mem::take(&mut self.records));
        self.next_seq += 1;
        Some(batch)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProducerEnd {
    /// Upstream signalled the last page.
    Exhausted,
    MaxPages,
    Stopped,
    Aborted,
    /// The consumer closed the queue before the producer finished.
    ConsumerGone,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ProducerReport {
    pub end: ProducerEnd,
    pub pages_processed: u32,
    /// Highest page whose listings were fully handed on.
    pub last_page: Option<u32>,
    pub batches_enqueued: u64,
    pub sentinel_sent: bool,
}

pub struct Producer {
    pub fetcher: Arc<PageFetcher>,
    pub processor: Arc<RecordProcessor>,
    pub writer: BatchFileWriter,
    pub batch_size: usize,
    pub start_page: u32,
    pub max_pages: Option<u32>,
    pub max_failed_pages: usize,
    pub stop: CancellationToken,
    pub abort: CancellationToken,
    pub events: ProgressSender,
}

impl Producer {
    /// Fetches pages in order until the upstream is exhausted or the run
    /// ends, then always sends the sentinel.
    pub async fn run(self, queue: QueueSender) -> ProducerReport {
        let mut acc = BatchAccumulator::new(self.batch_size);
        let mut pages_processed = 0u32;
        let mut failed_pages = 0usize;
        let mut batches_enqueued = 0u64;
        let mut last_page = None;
        let mut page = self.start_page.max(1);

        let end = 'pages: loop {
            if self.abort.is_cancelled() {
                break ProducerEnd::Aborted;
            }
            if queue.is_closed() {
                warn!(page, "queue closed by the consumer; producer finishing");
                break ProducerEnd::ConsumerGone;
            }
            if self.stop.is_cancelled() {
                info!(page, "stop requested; producer finishing");
                break ProducerEnd::Stopped;
            }
            if self.max_pages.is_some_and(|max| page > max) {
                break ProducerEnd::MaxPages;
            }

            let fetched = tokio::select! {
                biased;
                _ = self.abort.cancelled() => break ProducerEnd::Aborted,
                fetched = self.fetcher.fetch_with_retry(page) => fetched,
            };

            match fetched {
                Ok(result) => {
                    pages_processed += 1;
                    let last = result.is_last();
                    let listings = result.listings.len();

                    let processor = self.processor.clone();
                    let raw = result.listings;
                    let ingested_at = Utc::now();
                    let output = match tokio::task::spawn_blocking(move || {
                        processor.process(raw, ingested_at)
                    })
                    .await
                    {
                        Ok(output) => output,
                        Err(err) => {
                            break ProducerEnd::Failed(format!("record processing task failed: {err}"))
                        }
                    };

                    let mut counts = output.counts;
                    let mut records = output.records.into_iter();
                    while let Some(record) = records.next() {
                        if !acc.push(record) {
                            counts.validated = counts.validated.saturating_sub(1);
                            counts.duplicates += 1;
                            continue;
                        }
                        if !acc.is_full() {
                            continue;
                        }
                        let Some(batch) = acc.take() else {
                            continue;
                        };
                        if let Err(err) = queue.enqueue(batch, &self.abort).await {
                            // The rest of the page never reached the accumulator.
                            let rest: Vec<JobRecord> = records.collect();
                            let end = self.enqueue_failed(err, rest).await;
                            emit(
                                &self.events,
                                ProgressEvent::PageProcessed { page, listings, counts },
                            );
                            break 'pages end;
                        }
                        batches_enqueued += 1;
                    }
                    last_page = Some(page);

                    debug!(
                        page,
                        listings,
                        validated = counts.validated,
                        duplicates = counts.duplicates,
                        invalid = counts.invalid,
                        "page processed"
                    );
                    emit(
                        &self.events,
                        ProgressEvent::PageProcessed { page, listings, counts },
                    );

                    if last {
                        info!(page, "upstream reports no further pages");
                        break ProducerEnd::Exhausted;
                    }
                }
                Err(FetchError::Shutdown) => break ProducerEnd::Aborted,
                Err(err) if err.is_terminal() => {
                    error!(page, error = %err, "terminal upstream error; aborting run");
                    emit(
                        &self.events,
                        ProgressEvent::PageFailed {
                            page,
                            kind: err.kind(),
                            message: err.to_string(),
                        },
                    );
                    break ProducerEnd::Failed(err.to_string());
                }
                Err(err) => {
                    failed_pages += 1;
                    warn!(page, kind = err.kind(), error = %err, "page skipped");
                    emit(
                        &self.events,
                        ProgressEvent::PageFailed {
                            page,
                            kind: err.kind(),
                            message: err.to_string(),
                        },
                    );
                    if failed_pages > self.max_failed_pages {
                        break ProducerEnd::Failed(format!(
                            "{failed_pages} failed pages exceeds limit of {}",
                            self.max_failed_pages
                        ));
                    }
                }
            }

            page = page.saturating_add(1);
        };

        let end = self.finish_pending(&mut acc, &queue, end, &mut batches_enqueued).await;
        let sentinel_sent = queue.finish(&self.abort).await;
        if !sentinel_sent {
            debug!("sentinel not delivered; consumer already gone");
        }

        info!(
            pages_processed,
            batches_enqueued,
            end = ?end,
            "producer finished"
        );
        ProducerReport {
            end,
            pages_processed,
            last_page,
            batches_enqueued,
            sentinel_sent,
        }
    }

    /// Dumps the rejected batch together with any records still waiting behind it.
    async fn enqueue_failed(&self, err: EnqueueError, rest: Vec<JobRecord>) -> ProducerEnd {
        let end = match &err {
            EnqueueError::Closed(_) => ProducerEnd::ConsumerGone,
            EnqueueError::Aborted(_) => ProducerEnd::Aborted,
        };
        warn!(error = %err, remaining = rest.len(), "batch could not be enqueued");
        let mut records = err.into_batch().records;
        records.extend(rest);
        dump_records(&self.writer, &self.events, "unqueued_batch", &records).await;
        end
    }

    /// Flushes the partial batch on a clean end, dumps it otherwise.
    async fn finish_pending(
        &self,
        acc: &mut BatchAccumulator,
        queue: &QueueSender,
        end: ProducerEnd,
        batches_enqueued: &mut u64,
    ) -> ProducerEnd {
        let clean = matches!(
            end,
            ProducerEnd::Exhausted | ProducerEnd::MaxPages | ProducerEnd::Stopped
        );
        if !clean {
            let pending = acc.pending().to_vec();
            dump_records(&self.writer, &self.events, "producer_pending", &pending).await;
            return end;
        }
        let Some(batch) = acc.take() else {
            return end;
        };
        match queue.enqueue(batch, &self.abort).await {
            Ok(()) => {
                *batches_enqueued += 1;
                end
            }
            Err(err) => self.enqueue_failed(err, Vec::new()).await,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEnd {
    Sentinel,
    /// The producer dropped its sender without a sentinel.
    Disconnected,
    Aborted,
    TooManyErrors,
}

#[derive(Debug, Clone)]
pub struct ConsumerReport {
    pub end: ConsumerEnd,
    pub batches_handled: u64,
}

pub struct Consumer {
    pub coordinator: PersistenceCoordinator,
    pub writer: BatchFileWriter,
    pub max_consecutive_errors: u32,
    pub abort: CancellationToken,
    pub events: ProgressSender,
}

impl Consumer {
    pub async fn run(mut self, mut queue: QueueReceiver) -> ConsumerReport {
        let mut batches_handled = 0u64;
        let mut consecutive_errors = 0u32;
        let mut circuit_reported = self.coordinator.circuit().is_open();

        let end = loop {
            let item = tokio::select! {
                biased;
                _ = self.abort.cancelled() => break ConsumerEnd::Aborted,
                item = queue.next() => item,
            };
            let batch = match item {
                Some(QueueItem::Batch(batch)) => batch,
                Some(QueueItem::End) => break ConsumerEnd::Sentinel,
                None => break ConsumerEnd::Disconnected,
            };

            let outcome = tokio::select! {
                biased;
                _ = self.abort.cancelled() => None,
                outcome = self.coordinator.persist(&batch) => Some(outcome),
            };
            let Some(outcome) = outcome else {
                dump_records(&self.writer, &self.events, "aborted_batch", &batch.records).await;
                break ConsumerEnd::Aborted;
            };
            batches_handled += 1;

            match outcome {
                PersistOutcome::Database { .. } | PersistOutcome::File { .. } => {
                    consecutive_errors = 0;
                    emit(
                        &self.events,
                        ProgressEvent::BatchStored {
                            batch_id: batch.batch_id,
                            records: batch.len(),
                            to_file: outcome.is_file(),
                        },
                    );
                }
                PersistOutcome::Lost { reason } => {
                    consecutive_errors += 1;
                    emit(
                        &self.events,
                        ProgressEvent::BatchLost {
                            batch_id: batch.batch_id,
                            records: batch.len(),
                            reason,
                        },
                    );
                }
            }

            if !circuit_reported && self.coordinator.circuit().is_open() {
                circuit_reported = true;
                emit(&self.events, ProgressEvent::CircuitOpened);
            }

            if consecutive_errors >= self.max_consecutive_errors {
                error!(
                    consecutive_errors,
                    "too many consecutive batch failures; consumer stopping"
                );
                break ConsumerEnd::TooManyErrors;
            }
        };

        if matches!(end, ConsumerEnd::Aborted | ConsumerEnd::TooManyErrors) {
            let remaining: Vec<JobRecord> = queue
                .close_and_drain()
                .into_iter()
                .flat_map(|batch| batch.records)
                .collect();
            dump_records(&self.writer, &self.events, "queued_batches", &remaining).await;
        }

        info!(batches_handled, end = ?end, "consumer finished");
        ConsumerReport {
            end,
            batches_handled,
        }
    }
}
