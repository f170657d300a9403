//! Bounded-concurrency gate shared by batch, manager and stream downloads

use crate::error::FetchError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// At most `limit` holders of a [`GatePermit`] exist at any time
#[derive(Clone, Debug)]
pub struct ConcurrencyGate {
    permits: Arc<Semaphore>,
    limit: usize,
}

/// Slot in a [`ConcurrencyGate`], released on drop
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    /// A limit of zero is treated as one
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free slot, giving up when `cancel` fires first
    pub async fn enter(&self, cancel: &CancellationToken) -> Result<GatePermit, FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            permit = self.permits.clone().acquire_owned() => permit
                .map(|permit| GatePermit { _permit: permit })
                .map_err(|_| FetchError::Shutdown),
        }
    }
}
