//! FIFO of dispatched work, drained from the front only.
//!
//! Both run modes push a [`JoinHandle`] per dispatched item and pop in
//! dispatch order. Opportunistic draining pops the front only once its task
//! has finished, so it never waits; forced draining awaits the front even if
//! it is still running, which is what keeps the queue bounded when a slow
//! item sits at the head.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

use tokio::task::{JoinError, JoinHandle};

use crate::gate::GatePermit;

/// Call `action` and spawn its future, holding `permit` until the task ends.
///
/// A panic while the action builds its future is rethrown inside the spawned
/// task, so it surfaces through the [`JoinHandle`] like any other panic.
pub(crate) fn spawn_admitted<T, F, Fut>(
    action: &mut F,
    item: T,
    permit: GatePermit,
) -> JoinHandle<Fut::Output>
where
    F: FnMut(T) -> Fut,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    match panic::catch_unwind(AssertUnwindSafe(|| action(item))) {
        Ok(fut) => tokio::spawn(async move {
            let _permit = permit;
            fut.await
        }),
        Err(payload) => {
            tracing::warn!("Action panicked before returning a future");
            drop(permit);
            let handle: JoinHandle<Fut::Output> =
                tokio::spawn(async move { panic::resume_unwind(payload) });
            handle
        }
    }
}

/// A dispatched task plus whatever the driver needs to settle it.
pub(crate) struct InFlight<R, M> {
    meta: M,
    handle: JoinHandle<R>,
}

impl<R, M> InFlight<R, M> {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task. Dropping the returned future detaches the task.
    pub async fn join(self) -> (M, Result<R, JoinError>) {
        let result = self.handle.await;
        (self.meta, result)
    }
}

pub(crate) struct InFlightQueue<R, M = ()> {
    entries: VecDeque<InFlight<R, M>>,
    high_water: usize,
}

impl<R, M> InFlightQueue<R, M> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            high_water: 0,
        }
    }

    pub fn push(&mut self, meta: M, handle: JoinHandle<R>) {
        self.entries.push_back(InFlight { meta, handle });
        self.high_water = self.high_water.max(self.entries.len());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Longest the queue has been.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Pop the front entry only if its task is done.
    pub fn pop_finished(&mut self) -> Option<InFlight<R, M>> {
        if self.entries.front().is_some_and(InFlight::is_finished) {
            self.entries.pop_front()
        } else {
            None
        }
    }

    /// Pop the front entry whether or not it is done.
    pub fn pop_front(&mut self) -> Option<InFlight<R, M>> {
        self.entries.pop_front()
    }
}

impl<R, M> Drop for InFlightQueue<R, M> {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            tracing::debug!(
                detached = self.entries.len(),
                "Dropping in-flight queue, remaining tasks keep running detached"
            );
        }
    }
}
