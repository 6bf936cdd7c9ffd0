//! Blocking queries
//!
//! A query with `min_query_index > 0` is re-run each time one of the watch
//! channels it registered fires, until its reply index passes the caller's
//! index, the wait elapses or the server shuts down. An elapsed wait is not an
//! error: the caller gets the latest result.

use crate::common::{MetricsRegistry, QueryConfig, Result};
use crate::state::{StateSnapshot, StateStore, WatchSet};
use crate::structs::QueryOptions;
use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Final wait for a query: the requested (or default) time, capped, plus jitter
pub fn query_wait(config: &QueryConfig, opts: &QueryOptions) -> Duration {
    let wait = opts
        .max_query_time()
        .unwrap_or_else(|| config.default_max_query_time())
        .min(config.max_query_time());
    wait + jitter(wait, config.jitter_fraction)
}

/// Random duration in `[0, wait / fraction)`
fn jitter(wait: Duration, fraction: u32) -> Duration {
    let span = wait.as_millis() as u64 / u64::from(fraction.max(1));
    if span == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..span))
}

/// Keeps the blocking-query gauge accurate even when the future is dropped
struct InFlight<'a>(&'a MetricsRegistry);

impl<'a> InFlight<'a> {
    fn new(metrics: &'a MetricsRegistry) -> Self {
        metrics.blocking_queries.inc();
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.blocking_queries.dec();
    }
}

/// Resolves once shutdown is signalled; never if the signal's sender is gone
async fn shutdown_signalled(mut shutdown: watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Everything a blocking query needs from the server
pub struct BlockingContext<'a> {
    pub state: &'a StateStore,
    pub config: &'a QueryConfig,
    pub metrics: &'a MetricsRegistry,
    pub shutdown: watch::Receiver<bool>,
}

impl BlockingContext<'_> {
    /// Run `run` as a blocking query.
    ///
    /// `run` builds the reply from a snapshot and returns it along with the
    /// index it reflects. The returned index is never below 1.
    pub async fn run<T, F>(&self, opts: &QueryOptions, mut run: F) -> Result<(T, u64)>
    where
        F: FnMut(&mut WatchSet, &StateSnapshot) -> Result<(T, u64)>,
    {
        let deadline =
            (opts.min_query_index > 0).then(|| Instant::now() + query_wait(self.config, opts));
        let _in_flight = deadline.map(|_| InFlight::new(self.metrics));

        loop {
            let mut ws = WatchSet::new();
            let snap = self.state.snapshot();
            let (reply, index) = run(&mut ws, &snap)?;
            let index = index.max(1);

            let Some(deadline) = deadline else {
                return Ok((reply, index));
            };
            if index > opts.min_query_index {
                return Ok((reply, index));
            }

            tokio::select! {
                timed_out = ws.watch_until(deadline) => {
                    if timed_out {
                        return Ok((reply, index));
                    }
                }
                _ = shutdown_signalled(self.shutdown.clone()) => {
                    return Ok((reply, index));
                }
            }
        }
    }
}
