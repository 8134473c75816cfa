//! Request collapsing for expensive artifact generation.
//!
//! The first caller for a key becomes the leader and runs the computation;
//! callers arriving while it runs wait for the leader's result instead of
//! starting their own. Once the leader finishes the key is forgotten, so a
//! later call computes afresh (by then the artifact is usually on disk).
//!
//! If a leader's future is dropped before it completes, waiters are woken
//! and one of them takes over.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::debug;

struct InFlightState<V> {
    notify: Notify,
    result: Mutex<Option<V>>,
}

/// Collapses concurrent computations that share a key.
pub struct Singleflight<K, V> {
    in_flight: Mutex<HashMap<K, Arc<InFlightState<V>>>>,
}

enum Role<V> {
    Leader(Arc<InFlightState<V>>),
    Waiter(Arc<InFlightState<V>>),
}

impl<K, V> Singleflight<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `compute` for `key` unless an identical computation is in flight,
    /// in which case wait for and return its result.
    pub async fn run<F, Fut>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let state = loop {
            let role = {
                let mut in_flight = lock(&self.in_flight);
                match in_flight.get(&key) {
                    Some(state) => Role::Waiter(state.clone()),
                    None => {
                        let state = Arc::new(InFlightState {
                            notify: Notify::new(),
                            result: Mutex::new(None),
                        });
                        in_flight.insert(key.clone(), state.clone());
                        Role::Leader(state)
                    }
                }
            };

            match role {
                Role::Leader(state) => break state,
                Role::Waiter(state) => {
                    debug!(key = ?key, "Joining in-flight computation");
                    let notified = state.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    let ready = lock(&state.result).clone();
                    if let Some(value) = ready {
                        return value;
                    }
                    notified.await;
                    let ready = lock(&state.result).clone();
                    if let Some(value) = ready {
                        return value;
                    }
                    // Leader went away without a result; compete again.
                }
            }
        };

        let guard = LeaderGuard {
            flight: self,
            key: &key,
            state: &state,
        };
        let value = compute().await;
        *lock(&state.result) = Some(value.clone());
        drop(guard);
        value
    }

    /// Number of keys currently being computed.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

impl<K, V> Default for Singleflight<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the in-flight entry and wakes waiters when the leader finishes or
/// is dropped mid-computation.
struct LeaderGuard<'a, K: Eq + Hash, V> {
    flight: &'a Singleflight<K, V>,
    key: &'a K,
    state: &'a Arc<InFlightState<V>>,
}

impl<K: Eq + Hash, V> LeaderGuard<'_, K, V> {
    fn finish(&mut self) {
        {
            let mut in_flight = lock(&self.flight.in_flight);
            if in_flight
                .get(self.key)
                .is_some_and(|current| Arc::ptr_eq(current, self.state))
            {
                in_flight.remove(self.key);
            }
        }
        self.state.notify.notify_waiters();
    }
}

impl<K: Eq + Hash, V> Drop for LeaderGuard<'_, K, V> {
    fn drop(&mut self) {
        self.finish();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Tests
// =============================================================================
