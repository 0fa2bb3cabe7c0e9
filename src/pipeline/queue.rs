//! Admission control for model runs.
//!
//! Requests are admitted up to `max_concurrent + max_queued`; beyond that they
//! are turned away immediately instead of piling up behind the model.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::PipelineError;

#[derive(Debug, Error)]
#[error("segmentation queue is full")]
pub struct QueueFull;

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub running: usize,
    pub waiting: usize,
    pub max_concurrent: usize,
    pub capacity: usize,
}

/// Cloneable handle shared by all request handlers.
#[derive(Debug, Clone)]
pub struct SegmentationQueue {
    admission: Arc<Semaphore>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    capacity: usize,
}

impl SegmentationQueue {
    pub fn new(max_concurrent: usize, max_queued: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let capacity = max_concurrent + max_queued;
        Self {
            admission: Arc::new(Semaphore::new(capacity)),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            capacity,
        }
    }

    /// Reserve a place in the queue without waiting.
    pub fn try_admit(&self) -> Result<Admission, QueueFull> {
        let permit = self
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| QueueFull)?;
        debug!(
            "Admitted segmentation request ({} of {} places free)",
            self.admission.available_permits(),
            self.capacity
        );
        Ok(Admission {
            _admission: permit,
            slots: self.slots.clone(),
        })
    }

    pub fn stats(&self) -> QueueStats {
        let running = self.max_concurrent - self.slots.available_permits();
        let admitted = self.capacity - self.admission.available_permits();
        QueueStats {
            running,
            waiting: admitted.saturating_sub(running),
            max_concurrent: self.max_concurrent,
            capacity: self.capacity,
        }
    }
}

/// A request's reserved place. Dropping it frees the place.
#[derive(Debug)]
pub struct Admission {
    _admission: OwnedSemaphorePermit,
    slots: Arc<Semaphore>,
}

impl Admission {
    /// Wait for a free model slot, then run `job` under `timeout`.
    pub async fn run<F, T>(&self, timeout: Duration, job: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        let _slot = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PipelineError::Aborted(e.to_string()))?;

        match tokio::time::timeout(timeout, job).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(timeout)),
        }
    }
}
