//! A fast concurrent queue.
//!
//! This follows "Simple, Fast, and Practical Non-Blocking and Blocking
//! Concurrent Queue Algorithms" by Michael and Scott: an unbounded linked
//! FIFO with one lock on each end, so producers and consumers never contend
//! with each other. The one twist is the empty-queue condition: the head
//! node's `next` points to itself rather than at null. This lets `push`
//! observe the empty-to-non-empty transition from the tail side alone,
//! which is what allows the thread pool to skip its wakeup lock on most
//! posts.
//!
//! The end locks are spin locks rather than mutexes: each critical section
//! is a single pointer update.

use std::cell::UnsafeCell;
use std::hint::spin_loop;
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering;

use crossbeam_utils::CachePadded;

// -----------------------------------------------------------------------------
// Spin lock

struct SpinLock {
    locked: AtomicBool,
}

struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl SpinLock {
    const fn new() -> SpinLock {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> SpinGuard<'_> {
        while self.locked.swap(true, Ordering::Acquire) {
            spin_loop();
        }
        SpinGuard { lock: self }
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// -----------------------------------------------------------------------------
// Queue

struct Node<T> {
    value: Option<T>,
    next: AtomicPtr<Node<T>>,
}

/// An unbounded multi-producer multi-consumer FIFO.
pub(crate) struct ConcurrentQueue<T> {
    // Each pointer and its lock sit on their own cache line so that
    // producers and consumers do not false-share.
    head_lock: CachePadded<SpinLock>,
    tail_lock: CachePadded<SpinLock>,
    head: CachePadded<UnsafeCell<*mut Node<T>>>,
    tail: CachePadded<UnsafeCell<*mut Node<T>>>,
}

// SAFETY: The queue owns its nodes; values of `T` move across threads
// through it, so `T: Send` is required and sufficient.
unsafe impl<T: Send> Send for ConcurrentQueue<T> {}
// SAFETY: The head pointer is only touched under the head lock, the tail
// pointer only under the tail lock, and the `next` links are atomic.
unsafe impl<T: Send> Sync for ConcurrentQueue<T> {}

impl<T> ConcurrentQueue<T> {
    pub fn new() -> ConcurrentQueue<T> {
        let sentinel = Box::into_raw(Box::new(Node {
            value: None,
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        // Head points to itself when the queue is empty.
        // SAFETY: `sentinel` was just allocated above.
        unsafe { (*sentinel).next.store(sentinel, Ordering::Relaxed) };
        ConcurrentQueue {
            head_lock: CachePadded::new(SpinLock::new()),
            tail_lock: CachePadded::new(SpinLock::new()),
            head: CachePadded::new(UnsafeCell::new(sentinel)),
            tail: CachePadded::new(UnsafeCell::new(sentinel)),
        }
    }

    /// Appends a value at the tail. Returns true if the queue was empty
    /// before the operation.
    pub fn push(&self, value: T) -> bool {
        let node = Box::into_raw(Box::new(Node {
            value: Some(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }));

        let _guard = self.tail_lock.lock();
        // SAFETY: The tail pointer is only accessed under the tail lock,
        // and always points at a live node.
        let tail = unsafe { *self.tail.get() };
        // The old `next` of the tail is the self-pointer exactly when the
        // queue was empty (tail is then the sentinel head), and null
        // otherwise. The exchange publishes the node to consumers.
        // SAFETY: `tail` is live; nodes are only freed by `pop` after the
        // head has moved past them, and the tail is never behind the head.
        let previous = unsafe { (*tail).next.swap(node, Ordering::AcqRel) };
        // SAFETY: As above; still under the tail lock.
        unsafe { *self.tail.get() = node };
        !previous.is_null()
    }

    /// Removes the value at the head, if any.
    pub fn pop(&self) -> Option<T> {
        let guard = self.head_lock.lock();
        // SAFETY: The head pointer is only accessed under the head lock,
        // and always points at a live sentinel node.
        let head = unsafe { *self.head.get() };
        // SAFETY: `head` is live until this call frees it, below.
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() || next == head {
            // Empty (the self-pointer), or a fresh sentinel whose link a
            // racing pop reset a moment ago.
            return None;
        }

        // SAFETY: `next` was published by a push and cannot be freed while
        // we hold the head lock.
        let value = unsafe { (*next).value.take() };
        // SAFETY: Under the head lock.
        unsafe { *self.head.get() = next };
        // The popped node becomes the new sentinel. If it has no successor
        // the queue is now empty, so restore the self-pointer; a racing
        // push may have already installed a successor, in which case the
        // compare-exchange loses and the queue stays non-empty.
        // SAFETY: `next` is the live sentinel now.
        let _ = unsafe {
            (*next)
                .next
                .compare_exchange(ptr::null_mut(), next, Ordering::AcqRel, Ordering::Relaxed)
        };

        drop(guard);
        // SAFETY: The old sentinel is unreachable once the head pointer has
        // moved past it, so no other thread can touch it.
        drop(unsafe { Box::from_raw(head) });
        value
    }
}

impl<T> Drop for ConcurrentQueue<T> {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            // SAFETY: Exclusive access; every pointer in the chain came
            // from `Box::into_raw` and is freed exactly once here.
            let next = unsafe { (*node).next.load(Ordering::Relaxed) };
            // The self-pointer marks the end of the chain.
            let next = if next == node { ptr::null_mut() } else { next };
            // SAFETY: As above.
            drop(unsafe { Box::from_raw(node) });
            node = next;
        }
    }
}

// -----------------------------------------------------------------------------
// Tests
