//! Watch channels for blocking reads
//!
//! A [`WatchCh`] fires exactly once, when the row or bucket it guards is
//! mutated; the mutating transaction installs a fresh channel in its place.
//! Readers collect the channels they touched into a [`WatchSet`] and wait for
//! any of them to fire.

use futures_util::future::select_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

/// Default cap on channels tracked per read before falling back to a coarser one
pub const WATCH_LIMIT: usize = 2048;

/// A fire-once notification channel
#[derive(Debug, Clone)]
pub struct WatchCh(Arc<watch::Sender<bool>>);

impl WatchCh {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self(Arc::new(tx))
    }

    pub fn fire(&self) {
        self.0.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.0.borrow()
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl Default for WatchCh {
    fn default() -> Self {
        Self::new()
    }
}

/// The set of channels a read touched
#[derive(Debug, Default)]
pub struct WatchSet {
    chans: Vec<watch::Receiver<bool>>,
    seen: HashSet<usize>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, ch: &WatchCh) {
        if self.seen.insert(ch.key()) {
            self.chans.push(ch.0.subscribe());
        }
    }

    /// Add `ch`, or `alternate` once the set already holds `limit` channels
    pub fn add_with_limit(&mut self, limit: usize, ch: &WatchCh, alternate: &WatchCh) {
        if self.chans.len() < limit {
            self.add(ch);
        } else {
            self.add(alternate);
        }
    }

    pub fn len(&self) -> usize {
        self.chans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chans.is_empty()
    }

    /// Resolve once any channel in the set has fired. Never resolves for an empty set.
    pub async fn wait(&mut self) {
        if self.chans.is_empty() {
            std::future::pending::<()>().await;
        }
        if self.chans.iter().any(|rx| *rx.borrow()) {
            return;
        }
        let waits = self.chans.iter_mut().map(|rx| {
            Box::pin(async move {
                // A dropped sender also counts as a change
                let _ = rx.changed().await;
            })
        });
        select_all(waits).await;
    }

    /// Wait until a channel fires or `deadline` passes. Returns `true` on timeout.
    pub async fn watch_until(&mut self, deadline: Instant) -> bool {
        tokio::time::timeout_at(deadline, self.wait()).await.is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_wait_resolves_after_fire() {
        let a = WatchCh::new();
        let b = WatchCh::new();
        let mut ws = WatchSet::new();
        ws.add(&a);
        ws.add(&b);
        ws.add(&a);
        assert_eq!(ws.len(), 2);

        let mut fut = task::spawn(ws.wait());
        assert_pending!(fut.poll());
        b.fire();
        assert!(fut.is_woken());
        assert_ready!(fut.poll());
    }

    #[test]
    fn test_channel_fired_before_wait_is_seen() {
        let a = WatchCh::new();
        let mut ws = WatchSet::new();
        ws.add(&a);
        a.fire();
        assert!(a.is_fired());

        let mut fut = task::spawn(ws.wait());
        assert_ready!(fut.poll());
    }

    #[test]
    fn test_add_with_limit_falls_back() {
        let table = WatchCh::new();
        let rows: Vec<_> = (0..5).map(|_| WatchCh::new()).collect();
        let mut ws = WatchSet::new();
        for row in &rows {
            ws.add_with_limit(2, row, &table);
        }
        // two rows plus the table channel, added once
        assert_eq!(ws.len(), 3);

        let mut fut = task::spawn(ws.wait());
        assert_pending!(fut.poll());
        table.fire();
        assert_ready!(fut.poll());
    }

    #[tokio::test]
    async fn test_watch_until_times_out() {
        let a = WatchCh::new();
        let mut ws = WatchSet::new();
        ws.add(&a);
        let timed_out = ws
            .watch_until(Instant::now() + Duration::from_millis(20))
            .await;
        assert!(timed_out);
    }
}
