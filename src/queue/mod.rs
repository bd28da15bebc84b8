//! Per-service request queue for cold starts
//!
//! Bounded FIFO of parked requests. Each entry holds a single-shot completion
//! channel; the waiting request task owns the receiving half and enforces its
//! own deadline. Draining delivers one signal to every parked entry in
//! admission order.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::oneshot;

/// Outcome delivered to a parked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSignal {
    /// Service became ready; the request may proceed to the proxy
    Proceed,
    /// Startup exhausted all attempts; the request fails with 502
    StartupFailed,
    /// The gateway is shutting down
    GatewayShutdown,
    /// Evicted, e.g. a reload shrank the queue below its current depth
    Rejected,
}

/// Errors from queue admission.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Queue is at capacity; surfaced to the client as 503
    #[error("Queue is full ({capacity} requests)")]
    Full { capacity: usize },
}

struct QueueEntry {
    enqueued_at: Instant,
    tx: oneshot::Sender<QueueSignal>,
}

/// Bounded FIFO queue for one service.
///
/// Admission is atomic with the capacity check. Entries whose waiter has
/// already left (deadline expiry drops the receiver) are reclaimed lazily:
/// on drain, and on enqueue when the queue looks full.
pub struct RequestQueue {
    service_id: String,
    capacity: Mutex<usize>,
    entries: Mutex<VecDeque<QueueEntry>>,
}

impl RequestQueue {
    pub fn new(service_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            service_id: service_id.into(),
            capacity: Mutex::new(capacity),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Park a request. Returns the receiving half of the entry's completion
    /// channel, or `QueueError::Full` once `capacity` live entries are parked.
    pub fn enqueue(&self) -> Result<oneshot::Receiver<QueueSignal>, QueueError> {
        let capacity = *self.capacity.lock().unwrap();
        let mut entries = self.entries.lock().unwrap();

        if entries.len() >= capacity {
            // Abandoned waiters hold slots until reclaimed here
            entries.retain(|e| !e.tx.is_closed());
            if entries.len() >= capacity {
                return Err(QueueError::Full { capacity });
            }
        }

        let (tx, rx) = oneshot::channel();
        entries.push_back(QueueEntry {
            enqueued_at: Instant::now(),
            tx,
        });
        let depth = entries.len();
        drop(entries);

        metrics::gauge!("hestia_queue_depth", "service" => self.service_id.clone())
            .set(depth as f64);
        Ok(rx)
    }

    /// Deliver `signal` to every parked entry in FIFO order and empty the
    /// queue. Returns the number of entries that were still waiting.
    pub fn drain_all(&self, signal: QueueSignal) -> usize {
        let drained: Vec<QueueEntry> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain(..).collect()
        };

        let mut delivered = 0;
        for entry in drained {
            if entry.tx.send(signal).is_ok() {
                delivered += 1;
            } else {
                tracing::trace!(
                    service_id = %self.service_id,
                    waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                    "Skipping abandoned queue entry"
                );
            }
        }

        metrics::gauge!("hestia_queue_depth", "service" => self.service_id.clone()).set(0.0);
        delivered
    }

    /// Deliver `GatewayShutdown` to all entries.
    pub fn shutdown(&self) -> usize {
        self.drain_all(QueueSignal::GatewayShutdown)
    }

    /// Number of parked entries, including not-yet-reclaimed abandoned slots.
    pub fn depth(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Replace the capacity, evicting the newest entries beyond the new limit
    /// with `Rejected`. Used on config reload. Returns the eviction count.
    pub fn resize(&self, new_capacity: usize) -> usize {
        let evicted: Vec<QueueEntry> = {
            let mut capacity = self.capacity.lock().unwrap();
            let mut entries = self.entries.lock().unwrap();
            *capacity = new_capacity;

            let mut evicted = Vec::new();
            while entries.len() > new_capacity {
                if let Some(entry) = entries.pop_back() {
                    evicted.push(entry);
                }
            }
            evicted
        };

        let count = evicted.len();
        for entry in evicted {
            let _ = entry.tx.send(QueueSignal::Rejected);
        }
        count
    }
}
