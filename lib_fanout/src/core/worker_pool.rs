//! # Worker Pool
//!
//! A fixed-capacity pool for delivery tasks. Capacity is a semaphore: every
//! task owns one permit for its whole life, and [`WorkerPool::submit`] waits
//! for a free permit before spawning. A slow downstream therefore pushes back
//! on the submitter instead of growing an unbounded backlog of tasks.
//!
//! Tasks are tracked by a `TaskTracker` so that shutdown can wait for the
//! in-flight ones with a deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Errors raised by the pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,

    #[error("worker pool capacity must be greater than zero")]
    ZeroCapacity,
}

/// Bounded pool of spawned tasks.
#[derive(Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl WorkerPool {
    /// Creates a pool that runs at most `capacity` tasks at once.
    pub fn new(capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(capacity)),
            tracker: TaskTracker::new(),
        })
    }

    /// Spawns `task` once a slot is free. Waits while the pool is saturated.
    pub async fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        self.tracker.spawn(async move {
            task.await;
            drop(permit);
        });
        Ok(())
    }

    /// Number of tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Returns `true` once [`release`](Self::release) has started.
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Stops accepting tasks and waits up to `grace` for running ones.
    ///
    /// Returns `true` if every task finished in time. Tasks still running
    /// after the deadline are left to finish on their own.
    pub async fn release(&self, grace: Duration) -> bool {
        self.permits.close();
        self.tracker.close();
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                info!("worker pool drained");
                true
            }
            Err(_) => {
                warn!(in_flight = self.tracker.len(), "worker pool drain timed out, abandoning tasks");
                false
            }
        }
    }
}
