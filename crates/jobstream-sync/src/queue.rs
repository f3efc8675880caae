//! Bounded hand-off between the producer and consumer tasks.
//!
//! Capacity is counted in batches. `enqueue` waits for a free slot, so a slow
//! consumer throttles page fetching. The producer closes the stream with
//! [`QueueItem::End`].

use jobstream_core::Batch;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum QueueItem {
    Batch(Batch),
    End,
}

/// Returned when a batch could not be handed over; carries the batch back so
/// the caller can dump it.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("consumer has stopped; batch not enqueued")]
    Closed(Batch),
    #[error("run aborted while waiting for queue space")]
    Aborted(Batch),
}

impl EnqueueError {
    pub fn into_batch(self) -> Batch {
        match self {
            Self::Closed(batch) | Self::Aborted(batch) => batch,
        }
    }
}

pub fn ingestion_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (QueueSender { tx }, QueueReceiver { rx })
}

#[derive(Debug)]
pub struct QueueSender {
    tx: mpsc::Sender<QueueItem>,
}

impl QueueSender {
    /// Waits for capacity, then sends. The batch is not consumed unless a slot
    /// was reserved.
    pub async fn enqueue(&self, batch: Batch, abort: &CancellationToken) -> Result<(), EnqueueError> {
        let permit = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(EnqueueError::Aborted(batch)),
            permit = self.tx.reserve() => permit,
        };
        match permit {
            Ok(permit) => {
                permit.send(QueueItem::Batch(batch));
                Ok(())
            }
            Err(_) => Err(EnqueueError::Closed(batch)),
        }
    }

    /// Sends the end-of-input sentinel. Returns false if the consumer is gone.
    pub async fn finish(&self, abort: &CancellationToken) -> bool {
        if abort.is_cancelled() {
            return self.tx.try_send(QueueItem::End).is_ok();
        }
        tokio::select! {
            biased;
            _ = abort.cancelled() => self.tx.try_send(QueueItem::End).is_ok(),
            sent = self.tx.send(QueueItem::End) => sent.is_ok(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<QueueItem>,
}

impl QueueReceiver {
    /// `None` means every sender was dropped without a sentinel.
    pub async fn next(&mut self) -> Option<QueueItem> {
        self.rx.recv().await
    }

    /// Closes the queue and returns the batches still buffered.
    pub fn close_and_drain(&mut self) -> Vec<Batch> {
        self.rx.close();
        let mut remaining = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            if let QueueItem::Batch(batch) = item {
                remaining.push(batch);
            }
        }
        remaining
    }
}
