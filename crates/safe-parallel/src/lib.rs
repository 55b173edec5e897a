//! safe-parallel: run an async action over large or unbounded inputs with a
//! hard cap on concurrent invocations.
//!
//! Two modes share one admission gate and one FIFO of in-flight tasks:
//! - [`run_all`] / [`run_all_stream`]: fire-and-forget, the first failure ends the run
//! - [`run_all_with_results`] / [`run_all_with_results_stream`]: a lazy stream
//!   of per-item [`ItemResult`]s in input order; failures never end the run
//!
//! Only a window of roughly `max_parallelism` items is held at any time, so
//! inputs read from files, sockets or generators can be arbitrarily long.

mod config;
mod error;
mod gate;
mod outcome;
mod queue;
mod results;
mod run;

#[cfg(test)]
mod test_support;

pub use config::{CancellationToken, DEFAULT_MAX_PARALLELISM, MAX_PARALLELISM_ENV, RunConfig};
pub use error::{ConfigError, GateError, RunError};
pub use gate::{AdmissionGate, GatePermit};
pub use outcome::{ItemFailure, ItemResult};
pub use results::{run_all_with_results, run_all_with_results_stream};
pub use run::{run_all, run_all_stream};
