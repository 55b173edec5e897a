//! Instrumented actions shared by the run-mode tests.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;

/// Records how many action invocations overlap and which items ran.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    started: Mutex<Vec<u32>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count an invocation. Call this synchronously when the action is invoked.
    pub fn called(&self, item: u32) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(item);
    }

    /// Mark the body as running until the guard drops.
    pub fn enter(self: &Arc<Self>) -> RecorderGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        RecorderGuard(Arc::clone(self))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<u32> {
        self.started.lock().unwrap().clone()
    }
}

pub(crate) struct RecorderGuard(Arc<Recorder>);

impl Drop for RecorderGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Action that sleeps for `delay(item)` and then applies `outcome(item)`.
pub(crate) fn recorded<D, O>(
    recorder: &Arc<Recorder>,
    delay: D,
    outcome: O,
) -> impl FnMut(u32) -> BoxFuture<'static, anyhow::Result<()>> + use<D, O>
where
    D: Fn(u32) -> Duration,
    O: Fn(u32) -> anyhow::Result<()> + Clone + Send + 'static,
{
    let recorder = Arc::clone(recorder);
    move |item| {
        recorder.called(item);
        let recorder = Arc::clone(&recorder);
        let wait = delay(item);
        let outcome = outcome.clone();
        let fut: BoxFuture<'static, anyhow::Result<()>> = Box::pin(async move {
            let _guard = recorder.enter();
            tokio::time::sleep(wait).await;
            outcome(item)
        });
        fut
    }
}

pub(crate) fn fixed(ms: u64) -> impl Fn(u32) -> Duration {
    move |_| Duration::from_millis(ms)
}

pub(crate) fn always_ok(_: u32) -> anyhow::Result<()> {
    Ok(())
}

/// Wait (bounded) until every permit of `gate` is back.
pub(crate) async fn wait_for_idle(gate: &crate::gate::AdmissionGate) {
    for _ in 0..200 {
        if gate.available() == gate.capacity() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "gate did not return to capacity: {} of {} available",
        gate.available(),
        gate.capacity()
    );
}
