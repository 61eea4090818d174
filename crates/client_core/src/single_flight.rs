//! Single-flight coordination.
//!
//! At most one operation is in flight per [`SingleFlight`]. Callers that arrive
//! while it runs are queued and receive a clone of its outcome, in the order
//! they queued. The in-flight flag is owned by a [`FlightPermit`]; dropping the
//! permit clears the flag whether or not the operation completed, so a
//! cancelled or panicking leader never wedges the slot.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("in-flight operation was dropped before it settled")]
pub struct FlightAbandoned;

struct FlightState<T> {
    in_flight: bool,
    waiters: VecDeque<oneshot::Sender<T>>,
}

pub struct SingleFlight<T> {
    state: Arc<Mutex<FlightState<T>>>,
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FlightState {
                in_flight: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.state).in_flight
    }

    pub fn waiter_count(&self) -> usize {
        lock(&self.state).waiters.len()
    }

    /// Claims the slot without queueing. `None` while another flight holds it.
    pub fn try_acquire(&self) -> Option<FlightPermit<T>> {
        let mut state = lock(&self.state);
        if state.in_flight {
            return None;
        }
        state.in_flight = true;
        Some(FlightPermit {
            state: Arc::clone(&self.state),
            settled: false,
        })
    }
}

impl<T: Clone> SingleFlight<T> {
    /// Runs `operation` unless one is already in flight, in which case the
    /// caller waits for that one's outcome instead.
    pub async fn run<F, Fut>(&self, operation: F) -> Result<T, FlightAbandoned>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let claimed = {
            let mut state = lock(&self.state);
            if state.in_flight {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Err(rx)
            } else {
                state.in_flight = true;
                Ok(FlightPermit {
                    state: Arc::clone(&self.state),
                    settled: false,
                })
            }
        };
        let permit = match claimed {
            Ok(permit) => permit,
            Err(waiter) => return waiter.await.map_err(|_| FlightAbandoned),
        };

        let outcome = operation().await;
        permit.complete(outcome.clone());
        Ok(outcome)
    }
}

/// Ownership of the in-flight slot.
pub struct FlightPermit<T> {
    state: Arc<Mutex<FlightState<T>>>,
    settled: bool,
}

impl<T> FlightPermit<T> {
    fn release(&mut self) -> VecDeque<oneshot::Sender<T>> {
        self.settled = true;
        let mut state = lock(&self.state);
        state.in_flight = false;
        std::mem::take(&mut state.waiters)
    }
}

impl<T: Clone> FlightPermit<T> {
    /// Clears the slot, then hands `outcome` to every queued waiter in arrival
    /// order. Returns how many waiters were released.
    pub fn complete(mut self, outcome: T) -> usize {
        let waiters = self.release();
        let released = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        released
    }
}

impl<T> Drop for FlightPermit<T> {
    fn drop(&mut self) {
        if !self.settled {
            // Dropping the senders wakes every waiter with `FlightAbandoned`.
            drop(self.release());
        }
    }
}

fn lock<T>(state: &Mutex<FlightState<T>>) -> MutexGuard<'_, FlightState<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/single_flight_tests.rs"]
mod tests;
