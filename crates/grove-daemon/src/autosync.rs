//! Debounced auto-sync timers.
//!
//! Every content change of a managed document (re)starts a timer for its
//! path; a change before expiry aborts the old timer and starts a new one.
//! Expired paths come out of [`AutoSync::next_expired`].

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Quiet period after the last change before a document is uploaded.
pub const AUTO_SYNC_DELAY: Duration = Duration::from_millis(1500);

pub struct AutoSync {
    delay: Duration,
    /// Live timer per path, tagged with its generation
    timers: HashMap<String, (u64, JoinHandle<()>)>,
    next_generation: u64,
    expired_tx: mpsc::UnboundedSender<(String, u64)>,
    expired_rx: mpsc::UnboundedReceiver<(String, u64)>,
}

impl AutoSync {
    pub fn new(delay: Duration) -> Self {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        Self {
            delay,
            timers: HashMap::new(),
            next_generation: 0,
            expired_tx,
            expired_rx,
        }
    }

    /// Start (or restart) the timer for `path`.
    pub fn schedule(&mut self, path: &str) {
        self.cancel(path);

        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.expired_tx.clone();
        let delay = self.delay;
        let owned = path.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send((owned, generation));
        });
        self.timers.insert(path.to_string(), (generation, timer));
        debug!("Auto-sync scheduled for {} in {:?}", path, delay);
    }

    /// Drop the pending timer for `path`, if any.
    pub fn cancel(&mut self, path: &str) {
        if let Some((_, timer)) = self.timers.remove(path) {
            timer.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, timer)) in self.timers.drain() {
            timer.abort();
        }
    }

    /// Number of pending timers.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Wait for the next expired path.
    pub async fn next_expired(&mut self) -> Option<String> {
        loop {
            let (path, generation) = self.expired_rx.recv().await?;
            // A timer replaced after it already fired leaves a stale entry
            // in the channel; only the live timer's expiry counts.
            if self.timers.get(&path).is_some_and(|(live, _)| *live == generation) {
                self.timers.remove(&path);
                return Some(path);
            }
        }
    }
}

impl Drop for AutoSync {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
