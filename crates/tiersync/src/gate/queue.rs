//! Weighted admission queue.
//!
//! A request is admitted when its weight fits in the remaining capacity, or
//! when the queue is fully drained (so a request larger than the whole
//! capacity still runs, alone). Every time weight is returned the complete
//! list of blocked requests is scanned in registration order and each one
//! that fits is admitted. The scan does not stop at the first request that
//! does not fit: small requests overtake a large one that is still blocked.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Lease weight must be positive")]
    ZeroWeight,
    #[error("Admission queue dropped the request")]
    Dropped,
}

enum Waiter {
    Acquire {
        weight: u64,
        tx: oneshot::Sender<Lease>,
    },
    Idle {
        tx: oneshot::Sender<()>,
    },
}

impl Waiter {
    /// The caller stopped waiting (its future was dropped).
    fn is_abandoned(&self) -> bool {
        match self {
            Waiter::Acquire { tx, .. } => tx.is_closed(),
            Waiter::Idle { tx } => tx.is_closed(),
        }
    }

    fn is_ready(&self, active: u64, capacity: u64) -> bool {
        match self {
            Waiter::Acquire { weight, .. } => fits(active, *weight, capacity),
            Waiter::Idle { .. } => active == 0,
        }
    }
}

fn fits(active: u64, weight: u64, capacity: u64) -> bool {
    active == 0 || active.saturating_add(weight) <= capacity
}

struct GateState {
    active: u64,
    waiters: Vec<Waiter>,
}

struct GateInner {
    capacity: u64,
    state: Mutex<GateState>,
}

impl GateInner {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        // No critical section can panic half-way, so the state is consistent
        // even if another holder panicked.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_weight(self: &Arc<Self>, weight: u64) {
        let mut state = self.lock();
        debug_assert!(state.active >= weight, "released more weight than granted");
        state.active = state.active.saturating_sub(weight);
        tracing::trace!(weight, active = state.active, "Lease released");
        self.admit_waiters(&mut state);
    }

    /// Admit every waiter whose condition holds, in registration order.
    ///
    /// Runs in the same critical section as the mutation that triggered it.
    fn admit_waiters(self: &Arc<Self>, state: &mut GateState) {
        loop {
            let mut reclaimed = false;
            let mut i = 0;
            while i < state.waiters.len() {
                let waiter = &state.waiters[i];
                if waiter.is_abandoned() {
                    state.waiters.remove(i);
                    continue;
                }
                if !waiter.is_ready(state.active, self.capacity) {
                    i += 1;
                    continue;
                }

                match state.waiters.remove(i) {
                    Waiter::Acquire { weight, tx } => {
                        state.active += weight;
                        if let Err(mut lease) = tx.send(Lease::new(Arc::clone(self), weight)) {
                            // Receiver went away between the abandon check and the send.
                            lease.disarm();
                            state.active -= weight;
                            reclaimed = true;
                        }
                    }
                    Waiter::Idle { tx } => {
                        let _ = tx.send(());
                    }
                }
            }

            // A rolled back grant may let an earlier, skipped waiter in.
            if !reclaimed {
                return;
            }
        }
    }
}

/// Bounded-capacity gate handing out weighted leases.
///
/// Cloning yields another handle to the same gate.
#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<GateInner>,
}

impl AdmissionQueue {
    pub fn new(capacity: u64) -> Self {
        debug_assert!(capacity > 0, "admission queue capacity must be positive");
        Self {
            inner: Arc::new(GateInner {
                capacity,
                state: Mutex::new(GateState {
                    active: 0,
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    /// Wait until `weight` units can be granted.
    ///
    /// A request larger than the capacity is granted once nothing else is
    /// active. Dropping the returned future before it completes never leaks
    /// capacity.
    pub async fn acquire(&self, weight: u64) -> Result<Lease, AdmissionError> {
        if weight == 0 {
            return Err(AdmissionError::ZeroWeight);
        }

        let rx = {
            let mut state = self.inner.lock();
            if fits(state.active, weight, self.inner.capacity) {
                state.active += weight;
                return Ok(Lease::new(Arc::clone(&self.inner), weight));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(Waiter::Acquire { weight, tx });
            tracing::trace!(weight, active = state.active, "Lease request queued");
            rx
        };

        rx.await.map_err(|_| AdmissionError::Dropped)
    }

    pub fn try_acquire(&self, weight: u64) -> Option<Lease> {
        if weight == 0 {
            return None;
        }
        let mut state = self.inner.lock();
        if !fits(state.active, weight, self.inner.capacity) {
            return None;
        }
        state.active += weight;
        Some(Lease::new(Arc::clone(&self.inner), weight))
    }

    /// Wait until no weight is granted.
    pub async fn wait_for_idle(&self) {
        let rx = {
            let mut state = self.inner.lock();
            if state.active == 0 {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(Waiter::Idle { tx });
            rx
        };

        let _ = rx.await;
    }

    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    pub fn active_weight(&self) -> u64 {
        self.inner.lock().active
    }

    /// Number of acquire requests still blocked.
    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .waiters
            .iter()
            .filter(|w| matches!(w, Waiter::Acquire { .. }) && !w.is_abandoned())
            .count()
    }

    /// No granted weight and no blocked acquire requests.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.lock();
        state.active == 0
            && !state
                .waiters
                .iter()
                .any(|w| matches!(w, Waiter::Acquire { .. }) && !w.is_abandoned())
    }
}

impl fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("AdmissionQueue")
            .field("capacity", &self.inner.capacity)
            .field("active", &state.active)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Granted reservation of weight against one `AdmissionQueue`.
///
/// The weight goes back to the queue exactly once: on `release()` or on drop.
#[must_use = "dropping a lease returns its weight immediately"]
pub struct Lease {
    gate: Arc<GateInner>,
    weight: u64,
    released: bool,
}

impl Lease {
    fn new(gate: Arc<GateInner>, weight: u64) -> Self {
        Self {
            gate,
            weight,
            released: false,
        }
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Return the weight to the queue, admitting any waiters that now fit.
    pub fn release(mut self) {
        self.released = true;
        self.gate.release_weight(self.weight);
    }

    /// Forget the grant without touching the queue. Only valid while the
    /// caller already holds the state lock and undoes the accounting itself.
    fn disarm(&mut self) {
        self.released = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.gate.release_weight(self.weight);
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("weight", &self.weight).finish()
    }
}
