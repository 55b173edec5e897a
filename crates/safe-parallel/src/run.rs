//! Fire-and-forget mode: run every item, stop at the first failure.
//!
//! Flow per item:
//! 1. If the queue already holds `max_parallelism` entries, await its front
//! 2. Acquire a gate permit
//! 3. Spawn the action with the permit moved into the task
//! 4. Pop and settle every finished entry at the front of the queue
//!
//! After the input ends the rest of the queue is settled in dispatch order.
//! Cancellation is honoured at every point where the driver waits.

use std::fmt;
use std::future::Future;

use futures::{Stream, StreamExt, stream};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::error::{RunError, panic_message};
use crate::gate::AdmissionGate;
use crate::queue::{InFlight, InFlightQueue, spawn_admitted};

/// Run `action` over every item of `inputs` with at most
/// `config.max_parallelism` invocations in flight.
///
/// Returns the first failure in dispatch order. Work already dispatched when
/// the run fails or is cancelled is left to finish on its own.
pub async fn run_all<I, F, Fut, E>(inputs: I, action: F, config: RunConfig) -> Result<(), RunError<E>>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    run_all_stream(stream::iter(inputs), action, config).await
}

/// [`run_all`] over an asynchronous input stream.
pub async fn run_all_stream<S, F, Fut, E>(
    inputs: S,
    action: F,
    config: RunConfig,
) -> Result<(), RunError<E>>
where
    S: Stream,
    F: FnMut(S::Item) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let max_parallelism = config.validate()?;
    let gate = AdmissionGate::new(max_parallelism);
    drive(inputs, action, max_parallelism, &gate, &config.cancel_token)
        .await
        .map(|_| ())
}

/// Counters from a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RunSummary {
    pub dispatched: u64,
    pub peak_in_flight: usize,
}

pub(crate) async fn drive<S, F, Fut, E>(
    inputs: S,
    mut action: F,
    max_in_flight: usize,
    gate: &AdmissionGate,
    cancel: &CancellationToken,
) -> Result<RunSummary, RunError<E>>
where
    S: Stream,
    F: FnMut(S::Item) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let mut inputs = std::pin::pin!(inputs);
    let mut queue: InFlightQueue<Result<(), E>> = InFlightQueue::with_capacity(max_in_flight);
    let mut dispatched: u64 = 0;

    tracing::debug!(max_parallelism = max_in_flight, "Starting bounded run");

    loop {
        // A slow head would otherwise let finished entries pile up behind it.
        while queue.len() >= max_in_flight {
            let Some(entry) = queue.pop_front() else {
                break;
            };
            join_or_cancel(entry, cancel, dispatched).await?;
        }

        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(dispatched)),
            next = inputs.next() => match next {
                Some(item) => item,
                None => break,
            },
        };

        let permit = match gate.acquire(cancel).await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::debug!(dispatched, "Run cancelled while waiting for a permit");
                return Err(e.into());
            }
        };
        queue.push((), spawn_admitted(&mut action, item, permit));
        dispatched += 1;
        tracing::trace!(dispatched, in_flight = queue.len(), "Dispatched item");

        while let Some(entry) = queue.pop_finished() {
            let (_, joined) = entry.join().await;
            settle(joined)?;
        }
    }

    tracing::debug!(dispatched, remaining = queue.len(), "Input exhausted, draining");
    while let Some(entry) = queue.pop_front() {
        join_or_cancel(entry, cancel, dispatched).await?;
    }

    let summary = RunSummary {
        dispatched,
        peak_in_flight: queue.high_water(),
    };
    tracing::debug!(
        dispatched = summary.dispatched,
        peak_in_flight = summary.peak_in_flight,
        "Bounded run complete"
    );
    Ok(summary)
}

async fn join_or_cancel<E>(
    entry: InFlight<Result<(), E>, ()>,
    cancel: &CancellationToken,
    dispatched: u64,
) -> Result<(), RunError<E>>
where
    E: fmt::Display,
{
    if entry.is_finished() {
        let (_, joined) = entry.join().await;
        return settle(joined);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(cancelled(dispatched)),
        (_, joined) = entry.join() => settle(joined),
    }
}

fn settle<E: fmt::Display>(joined: Result<Result<(), E>, JoinError>) -> Result<(), RunError<E>> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Action failed, aborting run");
            Err(RunError::Action(e))
        }
        Err(err) if err.is_panic() => {
            let message = panic_message(err.into_panic().as_ref());
            tracing::warn!(panic = %message, "Action panicked, aborting run");
            Err(RunError::Panicked(message))
        }
        Err(_) => {
            tracing::warn!("Action task was aborted by the runtime");
            Err(RunError::Cancelled)
        }
    }
}

fn cancelled<E>(dispatched: u64) -> RunError<E> {
    tracing::debug!(dispatched, "Run cancelled, no further dispatch");
    RunError::Cancelled
}
