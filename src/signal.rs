//! This module defines a basic completion signal that can be shared between
//! threads: many waiters, one (or more, idempotent) setters. It is the
//! rendezvous primitive behind [`ThreadPool::synchronize`].
//!
//! [`ThreadPool::synchronize`]: crate::ThreadPool::synchronize

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;

// -----------------------------------------------------------------------------
// Completion

/// A shared one-way completion flag.
///
/// Cloning a `Completion` yields another handle to the same flag. Waiters
/// block until some handle calls `set`; once set, the flag never resets and
/// every present and future [`Completion::wait`] returns immediately.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

struct CompletionInner {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl Completion {
    /// Creates a pending completion.
    pub(crate) fn new() -> Completion {
        Completion {
            inner: Arc::new(CompletionInner {
                done: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Creates an already-set completion.
    pub(crate) fn ready() -> Completion {
        let completion = Completion::new();
        completion.set();
        completion
    }

    /// Marks the completion as done, waking every waiter. Idempotent.
    pub(crate) fn set(&self) {
        let mut done = self.inner.done.lock().unwrap();
        *done = true;
        self.inner.condvar.notify_all();
    }

    /// Returns true if the completion has been set, without blocking.
    pub fn is_set(&self) -> bool {
        *self.inner.done.lock().unwrap()
    }

    /// Blocks the calling thread until the completion is set.
    pub fn wait(&self) {
        let mut done = self.inner.done.lock().unwrap();
        while !*done {
            done = self.inner.condvar.wait(done).unwrap();
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn ready_does_not_block() {
        let completion = Completion::ready();
        assert!(completion.is_set());
        completion.wait();
    }

    #[test]
    fn wakes_waiters() {
        let completion = Completion::new();
        assert!(!completion.is_set());

        let waiter = {
            let completion = completion.clone();
            thread::spawn(move || completion.wait())
        };

        thread::sleep(Duration::from_millis(10));
        completion.set();
        waiter.join().unwrap();
        assert!(completion.is_set());
    }
}
