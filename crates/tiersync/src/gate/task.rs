//! TaskQueue - spawns work under an admission lease.
//!
//! `submit` resolves as soon as the work has been admitted and started, so a
//! driver looping over `submit` is naturally held back once the queue is full.
//! Submissions that are still waiting for admission are counted separately,
//! from the moment `submit` is called: the gate alone can look idle while a
//! submission is about to be admitted.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::queue::{AdmissionError, AdmissionQueue};

struct TaskQueueInner {
    name: String,
    gate: AdmissionQueue,
    in_flight: AtomicUsize,
    /// Fired whenever a submission stops being in flight.
    settled: Notify,
}

/// Marks one submission as in flight until dropped.
struct InFlight {
    queue: Arc<TaskQueueInner>,
}

impl InFlight {
    fn enter(queue: &Arc<TaskQueueInner>) -> Self {
        queue.in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            queue: Arc::clone(queue),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.queue.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.queue.settled.notify_waiters();
    }
}

/// Runs asynchronous work in parallel up to a weighted capacity.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<TaskQueueInner>,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            inner: Arc::new(TaskQueueInner {
                name: name.into(),
                gate: AdmissionQueue::new(capacity),
                in_flight: AtomicUsize::new(0),
                settled: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn gate(&self) -> &AdmissionQueue {
        &self.inner.gate
    }

    /// Submissions waiting for admission.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Submit work with weight 1.
    pub fn submit<F>(
        &self,
        work: F,
    ) -> impl Future<Output = Result<JoinHandle<F::Output>, AdmissionError>> + Send + use<F>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.submit_weighted(1, work)
    }

    /// Wait for `weight` units, then spawn `work` holding them.
    ///
    /// The submission counts as in flight from this call on, before the
    /// returned future is first polled, and stops counting once the work is
    /// admitted or the future is dropped. The future resolves once the work
    /// has started. The lease is released when the work completes, whether
    /// it succeeds, fails, or panics; the outcome is only observable through
    /// the returned handle.
    pub fn submit_weighted<F>(
        &self,
        weight: u64,
        work: F,
    ) -> impl Future<Output = Result<JoinHandle<F::Output>, AdmissionError>> + Send + use<F>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let in_flight = InFlight::enter(&self.inner);
        async move {
            let lease = {
                let guard = in_flight;
                let lease = guard.queue.gate.acquire(weight).await?;
                tracing::trace!(queue = %guard.queue.name, weight, "Work admitted");
                lease
            };

            Ok(tokio::spawn(async move {
                let _lease = lease;
                work.await
            }))
        }
    }

    /// Wait until no work is running and no submission is waiting.
    pub async fn wait_for_empty(&self) {
        loop {
            self.inner.gate.wait_for_idle().await;

            let settled = self.inner.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            // Counter first, gate second: a submission that slipped through
            // between the two reads holds weight by the time the gate is read.
            let in_flight = self.inner.in_flight.load(Ordering::Acquire);
            if in_flight == 0 {
                if self.inner.gate.active_weight() == 0 {
                    return;
                }
                continue;
            }

            tracing::trace!(queue = %self.inner.name, in_flight, "Gate idle with submissions pending");
            settled.await;
        }
    }

    /// Instantaneous quiescence check.
    pub fn is_empty(&self) -> bool {
        self.in_flight() == 0 && self.inner.gate.is_idle()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.inner.name)
            .field("gate", &self.inner.gate)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
