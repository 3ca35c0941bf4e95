// ============================================================
// Layer 3 — In-Flight Batch Transfers
// ============================================================
// The loop overlaps one thing with compute: getting batch N+1
// onto the device while batch N is being processed. That
// overlap is an explicit contract:
//
//   let pending = model.transfer(batch);   // start the copy
//   ... compute on the current batch ...
//   let batch = pending.join()?;           // wait, then use
//
// A PendingBatch can only be read through join(), so no batch
// is ever consumed before its transfer has completed.
//
//   Ready     → host-side device, the copy already happened
//   InFlight  → accelerator, the copy runs on its own thread
//
// Reference: Rust Book §16.1 (Using Threads to Run Code
//            Simultaneously)

use std::thread::{self, JoinHandle};

use crate::domain::error::{TrainError, TrainResult};

enum Transfer<T> {
    Ready(TrainResult<T>),
    InFlight(JoinHandle<TrainResult<T>>),
}

/// A batch whose transfer has been issued but not yet joined.
#[must_use = "a pending batch must be joined before use"]
pub struct PendingBatch<T> {
    state: Transfer<T>,
}

impl<T: Send + 'static> PendingBatch<T> {
    /// A transfer that completed synchronously
    pub fn ready(result: TrainResult<T>) -> Self {
        Self { state: Transfer::Ready(result) }
    }

    /// Run `upload` on a background thread.
    pub fn spawn<F>(upload: F) -> Self
    where
        F: FnOnce() -> TrainResult<T> + Send + 'static,
    {
        Self { state: Transfer::InFlight(thread::spawn(upload)) }
    }

    /// True once join() would return without blocking
    pub fn is_ready(&self) -> bool {
        match &self.state {
            Transfer::Ready(_) => true,
            Transfer::InFlight(handle) => handle.is_finished(),
        }
    }

    /// Block until the transfer has finished and hand over the
    /// batch.
    pub fn join(self) -> TrainResult<T> {
        match self.state {
            Transfer::Ready(result) => result,
            Transfer::InFlight(handle) => handle
                .join()
                .map_err(|_| TrainError::Model("batch transfer thread panicked".into()))?,
        }
    }
}

impl<T> std::fmt::Debug for PendingBatch<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            Transfer::Ready(_) => "ready",
            Transfer::InFlight(_) => "in flight",
        };
        f.debug_struct("PendingBatch").field("state", &state).finish()
    }
}
