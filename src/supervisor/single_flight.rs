//! Per-key coalescing of concurrent operations.
//!
//! The first caller for a key becomes the leader and runs the work; every
//! caller that arrives while the work is in flight attaches to the same
//! outcome instead of starting its own. Used so that N concurrent
//! `find_or_spawn` calls for one `(kind, cwd)` launch exactly one child.

use std::collections::HashMap;
use std::future::Future;

use tokio::sync::{broadcast, Mutex};

/// Table of in-flight operations keyed by string.
pub struct SingleFlight<T> {
    inflight: Mutex<HashMap<String, broadcast::Sender<T>>>,
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` for `key`, or attach to the run already in flight.
    ///
    /// Every concurrent caller for the same key observes the same value.
    /// If a leader disappears without publishing (its task was aborted),
    /// one waiting caller is promoted to leader and runs the work itself.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send,
    {
        loop {
            let waiter = {
                let mut inflight = self.inflight.lock().await;
                if let Some(tx) = inflight.get(key) {
                    Some(tx.subscribe())
                } else {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.to_owned(), tx);
                    None
                }
            };

            let Some(mut rx) = waiter else {
                break;
            };
            if let Ok(value) = rx.recv().await {
                return value;
            }
            // Leader gone without a result; contend for leadership again.
        }

        let value = work().await;
        let entry = self.inflight.lock().await.remove(key);
        if let Some(tx) = entry {
            // No receivers is fine: nobody else asked while we worked.
            let _ = tx.send(value.clone());
        }
        value
    }
}

impl<T: Clone + Send + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}
