//! Background sampler: drives a job on a fixed period until cancelled.
//!
//! Ticks run one after another on a single task, so a job never observes
//! overlapping ticks. Cancellation only interrupts the wait between ticks; a
//! tick that already started runs to completion.

use std::future::Future;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument, Span};

/// Callbacks driven by [`listen`].
pub trait Job: Send + 'static {
    /// Span every event of the job is recorded under.
    fn span(&self) -> Span;

    /// Runs once before `listen` returns.
    fn on_start(&mut self) {}

    /// Runs once per period. Errors are logged and never stop the loop.
    fn tick(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Runs once after cancellation, before `Listener::wait` returns.
    fn on_finish(&mut self) {}
}

/// Handle to a running job.
pub struct Listener {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl Listener {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait until the job observed cancellation and ran `on_finish`.
    pub async fn wait(self) -> Result<()> {
        self.handle
            .await
            .with_context(|| format!("{} loop aborted", self.name))
    }
}

/// Spawn `job` on its own task and return once its `on_start` has completed.
pub async fn listen<J: Job>(
    name: &'static str,
    period: Duration,
    job: J,
    cancel: CancellationToken,
) -> Result<Listener> {
    ensure!(!period.is_zero(), "{name}: tick period must be positive");

    let span = job.span();
    let (started_tx, started_rx) = oneshot::channel();
    let handle = tokio::spawn(run_loop(name, period, job, cancel, started_tx).instrument(span));

    started_rx
        .await
        .with_context(|| format!("{name} loop exited before start"))?;
    Ok(Listener { name, handle })
}

async fn run_loop<J: Job>(
    name: &'static str,
    period: Duration,
    mut job: J,
    cancel: CancellationToken,
    started: oneshot::Sender<()>,
) {
    // first tick one period after start, like a plain ticker
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    job.on_start();
    let _ = started.send(());
    debug!(name, ?period, "loop started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = job.tick().await {
                    warn!(name, "tick failed: {e:#}");
                }
            }
        }
    }

    job.on_finish();
    debug!(name, "loop finished");
}
