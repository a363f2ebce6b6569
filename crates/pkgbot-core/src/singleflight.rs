use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Keyed leader/follower gate: the first caller for a key leads, later
/// callers wait until the leader's guard drops.
#[derive(Default)]
pub struct Singleflight {
    flights: Mutex<HashMap<String, Arc<FlightState>>>,
}

impl Singleflight {
    pub fn begin(&self, key: &str) -> FlightGuard<'_> {
        let mut map = self
            .flights
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(state) = map.get(key) {
            state.add_ref();
            FlightGuard::new_follower(self, key.to_string(), Arc::clone(state))
        } else {
            let state = Arc::new(FlightState::new());
            map.insert(key.to_string(), Arc::clone(&state));
            FlightGuard::new_leader(self, key.to_string(), state)
        }
    }

    pub fn in_flight(&self) -> usize {
        self.flights.lock().map(|map| map.len()).unwrap_or(0)
    }

    fn release(&self, key: &str, flight: &Arc<FlightState>) {
        let mut map = self
            .flights
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if flight.release() == 0 {
            if let Some(existing) = map.get(key) {
                if Arc::ptr_eq(existing, flight) {
                    map.remove(key);
                }
            }
        }
    }
}

struct FlightState {
    notify: Notify,
    done: AtomicBool,
    refs: AtomicUsize,
}

impl FlightState {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            done: AtomicBool::new(false),
            refs: AtomicUsize::new(1),
        }
    }

    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) -> usize {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    async fn wait(&self) {
        // A `Notified` receives `notify_waiters` from the moment it is created.
        let notified = self.notify.notified();
        if self.done.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    fn finish(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

pub struct FlightGuard<'a> {
    singleflight: &'a Singleflight,
    key: String,
    flight: Arc<FlightState>,
    is_leader: bool,
}

impl<'a> FlightGuard<'a> {
    fn new_leader(singleflight: &'a Singleflight, key: String, flight: Arc<FlightState>) -> Self {
        Self {
            singleflight,
            key,
            flight,
            is_leader: true,
        }
    }

    fn new_follower(singleflight: &'a Singleflight, key: String, flight: Arc<FlightState>) -> Self {
        Self {
            singleflight,
            key,
            flight,
            is_leader: false,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Resolves once the leader for this key has dropped its guard.
    pub async fn wait(&self) {
        if !self.is_leader {
            self.flight.wait().await;
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.is_leader {
            self.flight.finish();
        }
        self.singleflight.release(&self.key, &self.flight);
    }
}
