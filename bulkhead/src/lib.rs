//! Bounded-concurrency + bounded-FIFO-queue isolation primitive.
//!
//! Grounded on the supervisory single-task style of edgelord's
//! `exchange::pool` (one management task handing off work rather than a
//! timer per waiter) and on `web3_proxy`'s use of semaphores to bound
//! concurrent work in `app.rs`.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{trace, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BulkheadError {
    #[error("bulkhead queue is full")]
    QueueFull,
    #[error("bulkhead queue wait exceeded deadline")]
    QueueTimeout,
    #[error("bulkhead queue was cleared")]
    QueueCleared,
}

#[derive(Debug, Clone, Copy)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    pub max_queue: usize,
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue: 50,
            queue_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BulkheadStats {
    pub active_count: usize,
    pub queued_count: usize,
    pub total_executed: u64,
    pub total_rejected: u64,
    pub total_timed_out: u64,
    pub load_percent: u64,
}

struct QueuedWaiter {
    id: u64,
    tx: oneshot::Sender<Result<(), BulkheadError>>,
}

struct Inner {
    active: usize,
    queue: VecDeque<QueuedWaiter>,
    total_executed: u64,
    total_rejected: u64,
    total_timed_out: u64,
}

pub struct Bulkhead {
    config: BulkheadConfig,
    inner: Mutex<Inner>,
    next_waiter_id: AtomicU64,
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                active: 0,
                queue: VecDeque::new(),
                total_executed: 0,
                total_rejected: 0,
                total_timed_out: 0,
            }),
            next_waiter_id: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> BulkheadStats {
        let inner = self.inner.lock();
        let denom = self.config.max_concurrent + self.config.max_queue;
        let load_percent = if denom == 0 {
            0
        } else {
            (100 * (inner.active + inner.queue.len()) as u64) / denom as u64
        };
        BulkheadStats {
            active_count: inner.active,
            queued_count: inner.queue.len(),
            total_executed: inner.total_executed,
            total_rejected: inner.total_rejected,
            total_timed_out: inner.total_timed_out,
            load_percent,
        }
    }

    /// Reject every currently-queued waiter with [`BulkheadError::QueueCleared`].
    pub fn clear_queue(&self) {
        let mut inner = self.inner.lock();
        for waiter in inner.queue.drain(..) {
            let _ = waiter.tx.send(Err(BulkheadError::QueueCleared));
        }
    }

    /// Run `op` once a slot is available, queuing (FIFO, bounded, with a
    /// per-waiter deadline) if the bulkhead is at capacity.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, BulkheadError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire_slot().await?;
        let result = op().await;
        self.release_slot();
        Ok(result)
    }

    async fn acquire_slot(&self) -> Result<(), BulkheadError> {
        let immediate = {
            let mut inner = self.inner.lock();
            if inner.active < self.config.max_concurrent {
                inner.active += 1;
                inner.total_executed += 1;
                true
            } else if inner.queue.len() >= self.config.max_queue {
                inner.total_rejected += 1;
                return Err(BulkheadError::QueueFull);
            } else {
                false
            }
        };

        if immediate {
            trace!("bulkhead slot acquired immediately");
            return Ok(());
        }

        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        let deadline = Instant::now() + self.config.queue_timeout;

        {
            let mut inner = self.inner.lock();
            inner.queue.push_back(QueuedWaiter { id, tx });
        }

        tokio::select! {
            res = &mut rx => match res {
                Ok(Ok(())) => {
                    let mut inner = self.inner.lock();
                    inner.total_executed += 1;
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(BulkheadError::QueueCleared),
            },
            _ = tokio::time::sleep_until(deadline) => {
                let mut inner = self.inner.lock();
                if let Some(pos) = inner.queue.iter().position(|w| w.id == id) {
                    inner.queue.remove(pos);
                    inner.total_timed_out += 1;
                    warn!("bulkhead waiter exceeded queue timeout");
                    Err(BulkheadError::QueueTimeout)
                } else {
                    drop(inner);
                    match rx.try_recv() {
                        Ok(Ok(())) => {
                            let mut inner = self.inner.lock();
                            inner.total_executed += 1;
                            Ok(())
                        }
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(BulkheadError::QueueCleared),
                    }
                }
            }
        }
    }

    /// Hand the freed slot directly to the oldest queued waiter, or give the
    /// slot back if the queue is empty.
    fn release_slot(&self) {
        let mut inner = self.inner.lock();
        match inner.queue.pop_front() {
            Some(waiter) => {
                let _ = waiter.tx.send(Ok(()));
            }
            None => {
                inner.active = inner.active.saturating_sub(1);
            }
        }
    }
}
