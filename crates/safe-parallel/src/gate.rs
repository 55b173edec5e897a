//! Admission gate - a counting semaphore over in-flight action invocations.
//!
//! Permits are RAII values: a [`GatePermit`] hands its slot back when it is
//! dropped, so every successful acquire is matched by exactly one release no
//! matter how the holder finishes (returns, errors, panics, or is aborted).

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::error::GateError;

/// Bounds the number of concurrent holders to a fixed capacity.
///
/// Cloning shares the same permits.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionGate {
    /// # Panics
    ///
    /// If `capacity` exceeds [`Semaphore::MAX_PERMITS`]. Run configs are
    /// validated against that limit before a gate is built.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Number of permits currently held.
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Wait for a permit.
    ///
    /// Fails with [`GateError::Cancelled`] if `cancel` fires first, in which
    /// case no permit is consumed. An already-cancelled token wins even when
    /// a permit is free.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<GatePermit, GateError> {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(
                    capacity = self.capacity,
                    available = self.available(),
                    "Permit acquisition cancelled"
                );
                Err(GateError::Cancelled)
            }
            permit = semaphore.acquire_owned() => {
                let permit = permit.map_err(|_| GateError::Closed)?;
                Ok(GatePermit::new(permit))
            }
        }
    }

    pub fn try_acquire(&self) -> Option<GatePermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(GatePermit::new(permit)),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => {
                tracing::error!("Admission gate closed while in use");
                None
            }
        }
    }
}

/// One unit of admission capacity. Released on drop.
#[must_use = "dropping a permit releases it immediately"]
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        tracing::trace!("Permit acquired");
        Self { _permit: permit }
    }

    /// Return the permit to the gate now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        tracing::trace!("Permit released");
    }
}
