//! Admission control for bounded concurrent work.
//!
//! Two layers:
//! - `AdmissionQueue` grants weighted `Lease`s against a fixed capacity and
//!   re-scans every blocked request whenever weight is returned.
//! - `TaskQueue` spawns work under a lease and tracks submissions that have
//!   not been admitted yet, so `wait_for_empty` is a true quiescence barrier.

mod queue;
mod task;

pub use queue::{AdmissionError, AdmissionQueue, Lease};
pub use task::TaskQueue;
