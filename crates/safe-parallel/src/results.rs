//! Result-streaming mode: every item yields an [`ItemResult`], failures included.
//!
//! The returned stream is pull-driven. Nothing is read from the input or
//! dispatched until the consumer polls, and each poll does at most one of:
//! - yield the queue front if its task has finished
//! - yield the queue front (waiting for it) if the queue is full
//! - pull, admit and dispatch the next input item
//!
//! Results come out in dispatch order, never completion order.
//!
//! Cancellation stops pulling input and dispatching. Everything already
//! dispatched is still awaited and yielded. An item that was pulled but never
//! admitted is yielded last as [`ItemFailure::Cancelled`], then the stream ends.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use futures::stream::{self, FusedStream};
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::error::ConfigError;
use crate::gate::{AdmissionGate, GatePermit};
use crate::outcome::{ItemFailure, ItemResult};
use crate::queue::{InFlight, InFlightQueue, spawn_admitted};

/// Run `action` over every item of `inputs`, yielding one [`ItemResult`] per
/// dispatched item in input order.
///
/// The action receives a clone of each item; the original is returned in the
/// result. Configuration is checked here, before the stream exists.
pub fn run_all_with_results<I, F, Fut, E>(
    inputs: I,
    action: F,
    config: RunConfig,
) -> Result<impl FusedStream<Item = ItemResult<I::Item, E>>, ConfigError>
where
    I: IntoIterator,
    I::Item: Clone,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    run_all_with_results_stream(stream::iter(inputs), action, config)
}

/// [`run_all_with_results`] over an asynchronous input stream.
pub fn run_all_with_results_stream<S, F, Fut, E>(
    inputs: S,
    action: F,
    config: RunConfig,
) -> Result<impl FusedStream<Item = ItemResult<S::Item, E>>, ConfigError>
where
    S: Stream,
    S::Item: Clone,
    F: FnMut(S::Item) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let max_parallelism = config.validate()?;
    let gate = AdmissionGate::new(max_parallelism);
    Ok(result_stream(
        inputs,
        action,
        max_parallelism,
        gate,
        config.cancel_token,
    ))
}

pub(crate) fn result_stream<S, F, Fut, E>(
    inputs: S,
    action: F,
    max_in_flight: usize,
    gate: AdmissionGate,
    cancel: CancellationToken,
) -> impl FusedStream<Item = ItemResult<S::Item, E>>
where
    S: Stream,
    S::Item: Clone,
    F: FnMut(S::Item) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    tracing::debug!(max_parallelism = max_in_flight, "Starting bounded result stream");

    let driver = ResultDriver {
        inputs: Box::pin(inputs),
        action,
        gate,
        cancel,
        queue: InFlightQueue::with_capacity(max_in_flight),
        max_in_flight,
        dispatching: true,
        stranded: None,
        dispatched: 0,
    };

    stream::unfold(driver, |mut driver| async move {
        let next = driver.next_result().await?;
        Some((next, driver))
    })
    .fuse()
}

enum Pulled<T> {
    Item(T),
    Exhausted,
    Cancelled,
}

struct ResultDriver<S: Stream, F, E> {
    inputs: Pin<Box<S>>,
    action: F,
    gate: AdmissionGate,
    cancel: CancellationToken,
    queue: InFlightQueue<Result<(), E>, S::Item>,
    max_in_flight: usize,
    dispatching: bool,
    /// Pulled from the input but never admitted.
    stranded: Option<S::Item>,
    dispatched: u64,
}

impl<S, F, Fut, E> ResultDriver<S, F, E>
where
    S: Stream,
    S::Item: Clone,
    F: FnMut(S::Item) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    async fn next_result(&mut self) -> Option<ItemResult<S::Item, E>> {
        loop {
            if let Some(entry) = self.queue.pop_finished() {
                return Some(settle(entry).await);
            }

            if !self.dispatching || self.queue.len() >= self.max_in_flight {
                if let Some(entry) = self.queue.pop_front() {
                    return Some(settle(entry).await);
                }
            }

            if !self.dispatching {
                let stranded = self.stranded.take();
                if stranded.is_none() {
                    tracing::debug!(
                        dispatched = self.dispatched,
                        peak_in_flight = self.queue.high_water(),
                        "Bounded result stream complete"
                    );
                }
                return stranded
                    .map(|item| ItemResult::failed_with(item, ItemFailure::Cancelled));
            }

            let pulled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Pulled::Cancelled,
                next = self.inputs.next() => next.map_or(Pulled::Exhausted, Pulled::Item),
            };

            match pulled {
                Pulled::Item(item) => match self.gate.acquire(&self.cancel).await {
                    Ok(permit) => self.dispatch(item, permit),
                    Err(_) => {
                        self.stop_dispatch("Cancelled while waiting for a permit");
                        self.stranded = Some(item);
                    }
                },
                Pulled::Exhausted => self.stop_dispatch("Input exhausted, draining"),
                Pulled::Cancelled => self.stop_dispatch("Cancelled, draining dispatched work"),
            }
        }
    }

    fn dispatch(&mut self, item: S::Item, permit: GatePermit) {
        let handle = spawn_admitted(&mut self.action, item.clone(), permit);
        self.queue.push(item, handle);
        self.dispatched += 1;
        tracing::trace!(
            dispatched = self.dispatched,
            in_flight = self.queue.len(),
            "Dispatched item"
        );
    }

    fn stop_dispatch(&mut self, reason: &'static str) {
        self.dispatching = false;
        tracing::debug!(
            dispatched = self.dispatched,
            remaining = self.queue.len(),
            "{reason}"
        );
    }
}

async fn settle<T, E: fmt::Display>(entry: InFlight<Result<(), E>, T>) -> ItemResult<T, E> {
    let (item, joined) = entry.join().await;
    match joined {
        Ok(Ok(())) => ItemResult::succeeded_with(item),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Action failed, recorded in result");
            ItemResult::failed_with(item, ItemFailure::Action(e))
        }
        Err(err) => {
            let failure = ItemFailure::from_join_error(err);
            tracing::warn!(error = %failure, "Action task did not complete, recorded in result");
            ItemResult::failed_with(item, failure)
        }
    }
}
