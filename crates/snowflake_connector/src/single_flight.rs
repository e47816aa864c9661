//! Coalesce concurrent callers that would otherwise repeat the same work.
//!
//! Callers sharing a key call [`SingleFlight::await_value`]. The first one
//! that finds the current value unacceptable becomes the worker, everybody
//! else waits until the worker reports back and then re-evaluates. If the
//! worker gives up (or is dropped) one waiter takes over.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Default)]
struct EntryState {
    working: bool,
    waiters: usize,
    /// Set once the entry is removed from the registry. Callers still holding
    /// a retired entry must look the key up again.
    retired: bool,
}

#[derive(Debug, Default)]
struct Entry {
    state: Mutex<EntryState>,
    notify: Notify,
}

/// Result of [`SingleFlight::await_value`].
pub enum Awaited<'a, K: Eq + Hash + Clone, T, E> {
    /// The attempt produced an acceptable result.
    Ready(Result<T, E>),
    /// The caller was elected to do the work. `value` comes from the fallback.
    Worker { value: T, turn: WorkerTurn<'a, K> },
}

/// Per-key registry of in-flight work.
///
/// Lock order is registry, then entry. Neither lock is held across an await.
#[derive(Debug)]
pub struct SingleFlight<K> {
    entries: Mutex<HashMap<K, Arc<Entry>>>,
}

impl<K> Default for SingleFlight<K> {
    fn default() -> Self {
        SingleFlight {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate `attempt` for `key` until its result is acceptable, or until
    /// this caller is elected worker.
    ///
    /// `attempt` runs while the entry lock is held, so it must be cheap and
    /// must not block.
    pub async fn await_value<T, E, A, P, F>(
        &self,
        key: K,
        mut attempt: A,
        is_acceptable: P,
        fallback: F,
    ) -> Awaited<'_, K, T, E>
    where
        A: FnMut() -> Result<T, E>,
        P: Fn(&Result<T, E>) -> bool,
        F: FnOnce() -> T,
    {
        let mut entry = self.entry(&key);

        loop {
            let current = entry.clone();
            let notified = current.notify.notified();
            tokio::pin!(notified);

            {
                let mut state = current.state.lock();
                if state.retired {
                    drop(state);
                    entry = self.entry(&key);
                    continue;
                }

                let result = attempt();
                if is_acceptable(&result) {
                    drop(state);
                    self.release_if_idle(&key, &current);
                    return Awaited::Ready(result);
                }

                if !state.working {
                    state.working = true;
                    trace!("elected single flight worker");
                    drop(state);
                    return Awaited::Worker {
                        value: fallback(),
                        turn: WorkerTurn {
                            flight: self,
                            key,
                            // `notified` still borrows `current`.
                            entry: current.clone(),
                            finished: false,
                        },
                    };
                }

                // Register before releasing the lock so a `resume_one` issued
                // right after can't be missed.
                notified.as_mut().enable();
                state.waiters += 1;
            }

            let _guard = WaiterGuard {
                entry: current.clone(),
            };
            notified.await;
        }
    }

    fn entry(&self, key: &K) -> Arc<Entry> {
        let mut entries = self.entries.lock();
        entries.entry(key.clone()).or_default().clone()
    }

    /// Remove the entry if nobody is working on it or waiting for it.
    fn release_if_idle(&self, key: &K, entry: &Arc<Entry>) {
        let mut entries = self.entries.lock();
        let mut state = entry.state.lock();
        if state.working || state.waiters > 0 || state.retired {
            return;
        }
        state.retired = true;
        if entries.get(key).is_some_and(|e| Arc::ptr_eq(e, entry)) {
            entries.remove(key);
        }
    }
}

/// Decrements the waiter count when a waiting caller wakes up or is dropped.
struct WaiterGuard {
    entry: Arc<Entry>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut state = self.entry.state.lock();
        state.waiters = state.waiters.saturating_sub(1);
    }
}

/// Proof of being the current worker for a key.
///
/// Finish with [`WorkerTurn::done`] or [`WorkerTurn::resume_one`]. Dropping
/// the turn without either behaves like `resume_one`.
pub struct WorkerTurn<'a, K: Eq + Hash + Clone> {
    flight: &'a SingleFlight<K>,
    key: K,
    entry: Arc<Entry>,
    finished: bool,
}

impl<K: Eq + Hash + Clone> WorkerTurn<'_, K> {
    /// Work succeeded. Wake every waiter so they can re-evaluate.
    pub fn done(mut self) {
        self.finish(true);
    }

    /// Work failed or was abandoned. Wake a single waiter to take over.
    pub fn resume_one(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, broadcast: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        let has_waiters = {
            let mut entries = self.flight.entries.lock();
            let mut state = self.entry.state.lock();
            state.working = false;
            if state.waiters == 0 {
                state.retired = true;
                if entries
                    .get(&self.key)
                    .is_some_and(|e| Arc::ptr_eq(e, &self.entry))
                {
                    entries.remove(&self.key);
                }
                false
            } else {
                true
            }
        };

        if has_waiters {
            if broadcast {
                self.entry.notify.notify_waiters();
            } else {
                self.entry.notify.notify_one();
            }
        }
    }
}

impl<K: Eq + Hash + Clone> Drop for WorkerTurn<'_, K> {
    fn drop(&mut self) {
        self.finish(false);
    }
}
