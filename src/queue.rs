//! Single-consumer FIFO of "batch ready" signals.
//!
//! Producers are the debounce timers and the size-cap path of `submit`; the only
//! consumer is the worker loop. Signals carry identities, never batch contents.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;

use crate::domain::batch::{BatchId, SubmitterId};
use crate::error::{Result, VolleyError};

/// Marker that a submitter's batch is ready for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchSignal {
    pub submitter: SubmitterId,
    pub batch_id: BatchId,
}

/// Producer side of the dispatch queue. Cheap to clone.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<DispatchSignal>,
    depth: Arc<AtomicUsize>,
}

/// Consumer side of the dispatch queue, owned by the worker.
pub struct DispatchReceiver {
    rx: mpsc::Receiver<DispatchSignal>,
    depth: Arc<AtomicUsize>,
}

/// Read-only view of the queue depth.
#[derive(Clone)]
pub struct QueueDepth(Arc<AtomicUsize>);

impl QueueDepth {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Create a bounded dispatch queue.
pub fn dispatch_queue(capacity: usize) -> (DispatchQueue, DispatchReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let depth = Arc::new(AtomicUsize::new(0));
    (
        DispatchQueue {
            tx,
            depth: depth.clone(),
        },
        DispatchReceiver { rx, depth },
    )
}

impl DispatchQueue {
    /// Append a signal, waiting for room if the queue is full.
    ///
    /// Fails with [`VolleyError::Shutdown`] once the receiver has been dropped.
    pub async fn enqueue(&self, signal: DispatchSignal) -> Result<()> {
        // Count before sending so the consumer never observes a negative depth
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(signal).await.is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(VolleyError::Shutdown);
        }
        tracing::debug!(
            submitter = %signal.submitter,
            batch_id = %signal.batch_id,
            "Enqueued dispatch signal"
        );
        Ok(())
    }

    /// Signals waiting to be consumed.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl DispatchReceiver {
    /// Wait for the next signal. Returns `None` once every producer is gone.
    pub async fn next(&mut self) -> Option<DispatchSignal> {
        let signal = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(signal)
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Handle for reading the depth from another task.
    pub fn depth_handle(&self) -> QueueDepth {
        QueueDepth(self.depth.clone())
    }

    /// Stop accepting new signals; already queued ones can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
