//! Concurrency throttle bounding outbound operations against the remote API.
//!
//! One `Throttle` is built per provider and cloned into every reconciler. Each
//! reconciler operation holds exactly one [`Permit`] for its whole duration.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::error::{Error, Result};

/// Default number of operations allowed in flight at once.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Bounded admission gate shared by all reconcilers.
#[derive(Debug, Clone)]
pub struct Throttle {
    semaphore: Arc<Semaphore>,
    max_parallel: usize,
}

impl Throttle {
    /// Create a throttle admitting `max_parallel` operations (at least one).
    pub fn new(max_parallel: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
        }
    }

    /// Wait until a slot is free and take it.
    pub async fn acquire(&self) -> Result<Permit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Shutdown)?;
        trace!(in_flight = self.in_flight(), "throttle permit acquired");
        Ok(Permit {
            inner: Some(permit),
        })
    }

    /// Stop admitting operations. Waiters and later callers get [`Error::Shutdown`];
    /// permits already handed out stay valid until released.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Number of permits currently held.
    pub fn in_flight(&self) -> usize {
        self.max_parallel - self.semaphore.available_permits()
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PARALLEL)
    }
}

/// One unit of admission. Released on drop if not released explicitly.
#[derive(Debug)]
pub struct Permit {
    inner: Option<OwnedSemaphorePermit>,
}

impl Permit {
    /// Give the slot back. Calling this more than once is a no-op.
    pub fn release(&mut self) {
        if let Some(permit) = self.inner.take() {
            drop(permit);
            trace!("throttle permit released");
        }
    }

    pub fn is_held(&self) -> bool {
        self.inner.is_some()
    }
}
