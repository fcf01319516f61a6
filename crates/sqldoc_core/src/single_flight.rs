//! Deduplication of identical concurrent reads.
//!
//! # Invariants
//! - At most one query per key runs at a time; callers arriving meanwhile
//!   wait for its result.
//! - Only successful results are shared. When the leading query fails, every
//!   waiter runs its own query so each caller sees its own provider error.
//! - Nothing is cached once the leading query has finished.

use crate::error::StoreResult;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

enum Outcome<T> {
    Pending,
    Shared(T),
    Failed,
}

struct Call<T> {
    state: Mutex<CallState<T>>,
    done: Condvar,
}

struct CallState<T> {
    outcome: Outcome<T>,
    waiters: usize,
}

impl<T> Call<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(CallState {
                outcome: Outcome::Pending,
                waiters: 0,
            }),
            done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CallState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keyed single-flight coordinator shared by all sessions of a store.
pub(crate) struct SingleFlight<T> {
    calls: Mutex<HashMap<String, Arc<Call<T>>>>,
}

impl<T: Clone> SingleFlight<T> {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<String, Arc<Call<T>>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `query` unless an identical one is in flight, in which case its
    /// result is awaited and cloned.
    pub(crate) fn run<F>(&self, key: String, query: F) -> StoreResult<T>
    where
        F: FnOnce() -> StoreResult<T>,
    {
        let (call, leader) = {
            let mut calls = self.calls();
            match calls.get(&key) {
                Some(call) => {
                    let call = Arc::clone(call);
                    call.lock().waiters += 1;
                    (call, false)
                }
                None => {
                    let call = Arc::new(Call::new());
                    calls.insert(key.clone(), Arc::clone(&call));
                    (call, true)
                }
            }
        };

        if leader {
            let mut guard = LeaderGuard {
                flight: self,
                key,
                call: &call,
                result: None,
            };
            let result = query();
            guard.result = result.as_ref().ok().cloned();
            return result;
        }

        let mut state = call.lock();
        while matches!(state.outcome, Outcome::Pending) {
            state = call
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if let Outcome::Shared(value) = &state.outcome {
            return Ok(value.clone());
        }
        drop(state);
        query()
    }

    #[cfg(test)]
    fn waiters(&self, key: &str) -> usize {
        self.calls()
            .get(key)
            .map_or(0, |call| call.lock().waiters)
    }
}

/// Publishes the leader's outcome even if the query panics.
struct LeaderGuard<'a, T: Clone> {
    flight: &'a SingleFlight<T>,
    key: String,
    call: &'a Arc<Call<T>>,
    result: Option<T>,
}

impl<T: Clone> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        self.flight.calls().remove(&self.key);
        let mut state = self.call.lock();
        state.outcome = match self.result.take() {
            Some(value) => Outcome::Shared(value),
            None => Outcome::Failed,
        };
        drop(state);
        self.call.done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::SingleFlight;
    use crate::error::{StoreError, StoreResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    fn wait_for_waiters(flight: &SingleFlight<i64>, key: &str, expected: usize) {
        for _ in 0..500 {
            if flight.waiters(key) == expected {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("waiters never reached {expected}");
    }

    #[test]
    fn identical_concurrent_reads_run_once() {
        let flight = Arc::new(SingleFlight::<i64>::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let leader = {
            let flight = Arc::clone(&flight);
            let runs = Arc::clone(&runs);
            thread::spawn(move || {
                flight.run("get|Document|[1]".to_string(), || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    release_rx.recv().unwrap();
                    Ok(42)
                })
            })
        };
        while runs.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let followers = (0..3)
            .map(|_| {
                let flight = Arc::clone(&flight);
                let runs = Arc::clone(&runs);
                thread::spawn(move || {
                    flight.run("get|Document|[1]".to_string(), || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(0)
                    })
                })
            })
            .collect::<Vec<_>>();

        wait_for_waiters(&flight, "get|Document|[1]", 3);
        release_tx.send(()).unwrap();

        assert_eq!(leader.join().unwrap().unwrap(), 42);
        for follower in followers {
            assert_eq!(follower.join().unwrap().unwrap(), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waiters_rerun_when_leader_fails() {
        let flight = Arc::new(SingleFlight::<i64>::new());
        let started = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let leader = {
            let flight = Arc::clone(&flight);
            let started = Arc::clone(&started);
            thread::spawn(move || -> StoreResult<i64> {
                flight.run("k".to_string(), || {
                    started.fetch_add(1, Ordering::SeqCst);
                    release_rx.recv().unwrap();
                    Err(StoreError::InvalidData("boom".to_string()))
                })
            })
        };
        while started.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let follower = {
            let flight = Arc::clone(&flight);
            thread::spawn(move || flight.run("k".to_string(), || Ok(7)))
        };
        wait_for_waiters(&flight, "k", 1);
        release_tx.send(()).unwrap();

        assert!(leader.join().unwrap().is_err());
        assert_eq!(follower.join().unwrap().unwrap(), 7);
    }

    #[test]
    fn finished_results_are_not_cached() {
        let flight = SingleFlight::<i64>::new();
        assert_eq!(flight.run("k".to_string(), || Ok(1)).unwrap(), 1);
        assert_eq!(flight.run("k".to_string(), || Ok(2)).unwrap(), 2);
    }
}
