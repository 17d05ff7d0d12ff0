//! Timed promises.
//!
//! [`Delay::after`] returns a promise that fulfils once a duration has
//! elapsed. One dedicated daemon thread serves every delay in the process:
//! it sleeps until the earliest scheduled deadline, then settles expired
//! entries outside the service lock.
//!
//! A cancelled delay is rejected (by default with the [`Cancelled`]
//! sentinel), so a delay that may be cancelled should have a reject
//! callback attached; otherwise the rejection eventually reaches the
//! undelivered-rejection hook.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Condvar;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use tracing::trace;

use crate::error::Rejection;
use crate::promise::Promise;

// -----------------------------------------------------------------------------
// Cancellation sentinel

/// The default rejection payload of a cancelled delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("delayed promise has been cancelled")
    }
}

impl std::error::Error for Cancelled {}

// -----------------------------------------------------------------------------
// Timer service

struct Service {
    state: Mutex<ServiceState>,
    condvar: Condvar,
}

struct ServiceState {
    /// Pending delays ordered by deadline; the sequence number keeps
    /// same-instant entries distinct.
    entries: BTreeMap<(Instant, u64), Promise>,
    next_seq: u64,
}

static SERVICE: LazyLock<Service> = LazyLock::new(|| {
    thread::Builder::new()
        .name("delay".to_string())
        .spawn(run)
        .unwrap();
    Service {
        state: Mutex::new(ServiceState {
            entries: BTreeMap::new(),
            next_seq: 0,
        }),
        condvar: Condvar::new(),
    }
});

/// The timer thread: sleep until the earliest deadline (or until a new
/// earliest entry is inserted), then settle whatever has expired.
fn run() {
    // Blocks until the static above finishes initializing.
    let service = &*SERVICE;
    loop {
        let mut state = service.state.lock().unwrap();

        state = if let Some((&(deadline, _), _)) = state.entries.first_key_value() {
            let now = Instant::now();
            if deadline > now {
                service
                    .condvar
                    .wait_timeout(state, deadline - now)
                    .unwrap()
                    .0
            } else {
                state
            }
        } else {
            service.condvar.wait(state).unwrap()
        };

        // Remove expired entries, saving the promises.
        let now = Instant::now();
        let mut ready: Vec<Promise> = Vec::new();
        while let Some(entry) = state.entries.first_entry() {
            if entry.key().0 <= now {
                ready.push(entry.remove());
            } else {
                break;
            }
        }
        drop(state);

        // Settle outside the lock. A promise the producer settled directly
        // in the meantime is skipped.
        for promise in ready {
            trace!("settling expired delay");
            let _ = promise.settle_empty();
        }
    }
}

// -----------------------------------------------------------------------------
// Public api

/// Namespace for timed promise operations.
pub struct Delay;

impl Delay {
    /// Returns a promise that fulfils (with an empty value) no sooner than
    /// `duration` from now.
    pub fn after(duration: Duration) -> Promise {
        let promise = Promise::new();
        let service = &*SERVICE;

        let mut state = service.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        let key = (Instant::now() + duration, seq);
        state.entries.insert(key, promise.clone());

        // Wake the timer thread if the new entry is now the earliest.
        if state.entries.first_key_value().is_some_and(|(first, _)| *first == key) {
            service.condvar.notify_one();
        }
        drop(state);

        promise
    }

    /// Cancels a promise previously returned by [`Delay::after`], rejecting
    /// it with `rejection` (or [`Cancelled`] when omitted). Returns true if
    /// the delay was still pending.
    pub fn cancel(promise: &Promise, rejection: Option<Rejection>) -> bool {
        let service = &*SERVICE;

        let entry = {
            let mut state = service.state.lock().unwrap();
            let key = state
                .entries
                .iter()
                .find_map(|(key, candidate)| (candidate == promise).then_some(*key));
            key.and_then(|key| state.entries.remove(&key))
        };

        match entry {
            Some(target) => {
                // Reject outside the lock; the rejection propagates to
                // anything chained on the handle.
                let rejection = rejection.unwrap_or_else(|| Rejection::new(Cancelled));
                let _ = target.settle_rejection(rejection);
                true
            }
            None => false,
        }
    }
}
