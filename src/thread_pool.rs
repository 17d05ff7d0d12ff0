//! This module contains the api and worker logic for the thread pool.
//!
//! The pool consumes zero-argument tasks posted as promises: `post` wraps
//! the task into a pending [`Promise`] whose fulfil callback is the task
//! itself, and a worker later settles that promise, running the task and
//! propagating its outcome to anything chained on the handle.
//!
//! Workers park on a condition variable when the queue is empty. The queue
//! reports the empty-to-non-empty edge from the producer side, so most
//! posts skip the pool mutex entirely; only the post that makes the queue
//! non-empty takes it, to close the race against workers that are about to
//! park.

use std::cell::Cell;
use std::num::NonZero;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::thread::available_parallelism;

use tracing::debug;
use tracing::trace;

use crate::callback::Callback;
use crate::error::Error;
use crate::promise::Promise;
use crate::queue::ConcurrentQueue;
use crate::signal::Completion;

// -----------------------------------------------------------------------------
// Worker thread identity

std::thread_local! {
    /// The (pool id, worker index) of the current thread, when it is a
    /// worker. Set for the lifetime of the worker loop.
    static WORKER_SLOT: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

// -----------------------------------------------------------------------------
// Thread pool

/// A dynamic pool of worker threads that settle posted promises.
///
/// Tasks are zero-argument closures submitted with [`ThreadPool::post`],
/// which returns a [`Promise`] that fulfils with the task's return value or
/// rejects with its panic. Chaining `then`/`except` on the returned handle
/// composes follow-up work; note that a dependent callback attached after
/// the task already ran executes synchronously with the attachment, not
/// necessarily on a pool thread.
///
/// [`ThreadPool::set_thread_count`] must not overlap with any other call on
/// the same pool.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    queue: ConcurrentQueue<Promise>,
    state: Mutex<PoolState>,
    job_is_ready: Condvar,
}

struct PoolState {
    workers: Vec<WorkerHandle>,
}

/// Used to manage the lifecycle of a worker thread.
struct WorkerHandle {
    /// Tells the worker to exit when set to false. The `Arc` keeps the
    /// flag's address stable while the worker vec reallocates.
    running: Arc<AtomicBool>,
    /// The handle used to wait for the worker to complete.
    handle: JoinHandle<()>,
}

impl ThreadPool {
    /// Creates a pool sized to the available hardware parallelism (at
    /// least one thread).
    pub fn new() -> Result<ThreadPool, Error> {
        let threads = available_parallelism().map(NonZero::get).unwrap_or(1);
        ThreadPool::with_threads(threads)
    }

    /// Creates a pool with exactly `threads` worker threads.
    pub fn with_threads(threads: usize) -> Result<ThreadPool, Error> {
        if threads == 0 {
            return Err(Error::InvalidThreadCount);
        }
        let pool = ThreadPool {
            inner: Arc::new(PoolInner {
                queue: ConcurrentQueue::new(),
                state: Mutex::new(PoolState {
                    workers: Vec::new(),
                }),
                job_is_ready: Condvar::new(),
            }),
        };
        pool.resize(threads)?;
        Ok(pool)
    }

    /// Returns an opaque identifier for this pool.
    #[inline]
    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Enqueues a task to run on a worker thread.
    ///
    /// Returns a promise that fulfils with the task's return value, or
    /// rejects if the task panics.
    pub fn post<F, R>(&self, f: F) -> Promise
    where
        F: FnOnce() -> R + Send + 'static,
        R: Clone + Send + 'static,
    {
        let promise = Promise::with_fulfil(Callback::nullary(f));
        self.inner.enqueue(promise.clone());
        promise
    }

    /// Ensures a task runs on the pool: executes it inline when the calling
    /// thread is already one of this pool's workers, posts it otherwise.
    pub fn dispatch<F, R>(&self, f: F) -> Promise
    where
        F: FnOnce() -> R + Send + 'static,
        R: Clone + Send + 'static,
    {
        if self.index().is_some() {
            let promise = Promise::with_fulfil(Callback::nullary(f));
            // Freshly created and non-dependent, so this cannot fail.
            let _ = promise.settle_empty();
            promise
        } else {
            self.post(f)
        }
    }

    /// Wraps a task into a callable that dispatches it onto this pool each
    /// time it is invoked.
    pub fn wrap<F, R>(&self, f: F) -> impl Fn() -> Promise + '_
    where
        F: Fn() -> R + Clone + Send + 'static,
        R: Clone + Send + 'static,
    {
        move || self.dispatch(f.clone())
    }

    /// Returns the 0-based worker index of the calling thread, or `None`
    /// when the caller is not one of this pool's workers.
    pub fn index(&self) -> Option<usize> {
        let id = self.id();
        WORKER_SLOT.with(|slot| {
            slot.get()
                .and_then(|(pool, index)| (pool == id).then_some(index))
        })
    }

    /// The current number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.inner.state.lock().unwrap().workers.len()
    }

    /// Resizes the pool to `threads` workers. `0` is rejected with
    /// [`Error::InvalidThreadCount`]; on a spawn failure during growth the
    /// pool is rolled back to its previous size.
    ///
    /// Must not be called concurrently with any other operation on this
    /// pool.
    pub fn set_thread_count(&self, threads: usize) -> Result<(), Error> {
        if threads == 0 {
            return Err(Error::InvalidThreadCount);
        }
        self.resize(threads)
    }

    /// Flushes the queue: every task posted before this call completes
    /// before any task posted after it starts.
    ///
    /// The returned [`Completion`] is set once every current worker has
    /// executed one barrier task. Waiting on it from a worker thread of
    /// this pool would deadlock and is forbidden.
    pub fn synchronize(&self) -> Completion {
        self.inner.synchronize()
    }

    #[cold]
    fn resize(&self, new_size: usize) -> Result<(), Error> {
        debug!("starting thread pool resize");

        let current_size = self.thread_count();
        trace!(
            "attempting to resize thread pool from {} to {} thread(s)",
            current_size, new_size
        );

        if new_size == current_size {
            debug!("completed thread pool resize, size unchanged");
            return Ok(());
        }

        // Quiesce the pool first, so no worker is mid-task while the
        // worker list changes.
        self.synchronize().wait();

        if new_size > current_size {
            let mut state = self.inner.state.lock().unwrap();
            let mut spawned: Vec<WorkerHandle> = Vec::with_capacity(new_size - current_size);

            for index in current_size..new_size {
                debug!("spawning worker with index {}", index);
                let running = Arc::new(AtomicBool::new(true));
                let result = thread::Builder::new().name(format!("worker {index}")).spawn({
                    let inner = self.inner.clone();
                    let running = running.clone();
                    move || worker(inner, index, running)
                });
                match result {
                    Ok(handle) => spawned.push(WorkerHandle { running, handle }),
                    Err(error) => {
                        // Roll the growth back: tell the workers spawned so
                        // far to exit, wake them, and join them outside the
                        // lock.
                        debug!("worker spawn failed, rolling back");
                        for worker in &spawned {
                            worker.running.store(false, Ordering::Relaxed);
                        }
                        self.inner.job_is_ready.notify_all();
                        drop(state);
                        for worker in spawned {
                            let _ = worker.handle.join();
                        }
                        return Err(Error::Spawn(error));
                    }
                }
            }

            state.workers.append(&mut spawned);
        } else {
            let removed = {
                let mut state = self.inner.state.lock().unwrap();
                let removed = state.workers.split_off(new_size);
                for worker in &removed {
                    worker.running.store(false, Ordering::Relaxed);
                }
                // Holding the lock here means every departing worker is
                // either outside the lock (and will re-test its flag) or
                // parked and about to be woken.
                self.inner.job_is_ready.notify_all();
                removed
            };

            for worker in removed {
                trace!("joining departing worker");
                let _ = worker.handle.join();
            }
        }

        debug!("completed thread pool resize");
        Ok(())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Shrinking never fails.
        let _ = self.resize(0);
    }
}

// -----------------------------------------------------------------------------
// Pool internals

impl PoolInner {
    fn enqueue(&self, promise: Promise) {
        if self.queue.push(promise) {
            // The queue was empty: take the lock to close the window where
            // every worker has observed an empty queue but has not yet
            // issued its wait.
            let _guard = self.state.lock().unwrap();
            self.job_is_ready.notify_one();
        } else {
            // The queue was not empty, so at least one worker is active:
            // the one running the job ahead of this one. That worker needs
            // no notification to run the next job, so even if every other
            // worker misses this one, the queue still drains.
            self.job_is_ready.notify_one();
        }
    }

    fn synchronize(&self) -> Completion {
        // Take the lock directly rather than going through `enqueue`: when
        // it is released, every worker is either active outside the lock
        // or parked and freshly notified, so each of them pops exactly one
        // barrier promise.
        let state = self.state.lock().unwrap();
        let workers = state.workers.len();
        if workers == 0 {
            return Completion::ready();
        }

        debug!(workers, "synchronizing thread pool");
        let completion = Completion::new();
        let remaining = Arc::new(AtomicUsize::new(workers));
        for _ in 0..workers {
            let barrier = {
                let completion = completion.clone();
                let remaining = remaining.clone();
                Promise::with_fulfil(Callback::nullary(move || {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        // Last worker through releases everyone.
                        completion.set();
                    } else {
                        // Park here, off every engine lock, so that no
                        // worker returns to the queue before the
                        // rendezvous is complete.
                        completion.wait();
                    }
                }))
            };
            self.queue.push(barrier);
        }
        self.job_is_ready.notify_all();
        drop(state);

        completion
    }
}

// -----------------------------------------------------------------------------
// Worker loop

/// The main loop for a worker thread: pop a promise, settle it, repeat;
/// park when the queue is empty.
fn worker(inner: Arc<PoolInner>, index: usize, running: Arc<AtomicBool>) {
    trace!(index, "starting worker");
    let pool_id = Arc::as_ptr(&inner) as usize;
    WORKER_SLOT.with(|slot| slot.set(Some((pool_id, index))));

    while running.load(Ordering::Relaxed) {
        // Attempt to run the next task from the queue.
        if let Some(promise) = inner.queue.pop() {
            settle_task(promise);
            continue;
        }

        // The queue was empty, so we will wait for a condition
        // notification, which requires the lock.
        let state = inner.state.lock().unwrap();

        // Check the queue again in case a task was added and the
        // notification fired before the lock was acquired.
        if let Some(promise) = inner.queue.pop() {
            // Don't run user code with the lock held.
            drop(state);
            settle_task(promise);
        } else if running.load(Ordering::Relaxed) {
            // The queue is now known to be empty.
            let _parked = inner.job_is_ready.wait(state).unwrap();
        }
    }

    WORKER_SLOT.with(|slot| slot.set(None));
    trace!(index, "exiting worker");
}

fn settle_task(promise: Promise) {
    // The posted handle is public, so the producer may have settled it
    // already; skip it rather than take the worker down.
    if let Err(error) = promise.settle_empty() {
        trace!("skipping already-settled task: {error}");
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_runs_tasks() {
        let pool = ThreadPool::with_threads(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let counter = counter.clone();
            pool.post(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        pool.synchronize().wait();
        assert_eq!(counter.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn zero_threads_is_invalid() {
        assert!(matches!(
            ThreadPool::with_threads(0),
            Err(Error::InvalidThreadCount)
        ));

        let pool = ThreadPool::with_threads(1).unwrap();
        assert!(matches!(
            pool.set_thread_count(0),
            Err(Error::InvalidThreadCount)
        ));
        assert_eq!(pool.thread_count(), 1);
    }

    #[test]
    fn dispatch_outside_pool_posts() {
        let pool = ThreadPool::with_threads(1).unwrap();
        assert_eq!(pool.index(), None);

        let promise = pool.dispatch(|| 5_i32);
        pool.synchronize().wait();
        assert!(promise.is_settled());
    }

    #[test]
    fn resize_up_and_down() {
        let pool = ThreadPool::with_threads(1).unwrap();
        pool.set_thread_count(4).unwrap();
        assert_eq!(pool.thread_count(), 4);
        pool.set_thread_count(2).unwrap();
        assert_eq!(pool.thread_count(), 2);
    }
}
