//! Promise-chaining asynchronous operations with a promise-driven thread
//! pool.
//!
//! Segue provides two tightly coupled pieces. The first is a
//! [Promises/A+](https://promisesaplus.com/) style [`Promise`]: a handle to
//! the eventual result of an asynchronous operation, interacted with
//! through [`Promise::then`], which registers callbacks to receive either
//! the eventual value or the reason it cannot be produced. Unlike the
//! blocking future types in most runtimes, these promises synchronize by
//! callback chaining and never by blocking a thread.
//!
//! The second is a [`ThreadPool`] whose unit of work *is* a promise: each
//! posted task becomes a pending promise that a worker settles, so
//! everything chained on the returned handle composes with the pool for
//! free.
//!
//! ```
//! use segue::{Callback, ThreadPool};
//!
//! let pool = ThreadPool::with_threads(2)?;
//!
//! // Post a task; chain a transformation onto its outcome.
//! let doubled = pool
//!     .post(|| 21_i32)
//!     .then(Callback::map(|x: &i32| x * 2))?;
//!
//! // Flush the pool: every prior task has now completed.
//! pool.synchronize().wait();
//! assert!(doubled.is_settled());
//! # Ok::<(), segue::Error>(())
//! ```
//!
//! Failures inside a task or callback are captured as a [`Rejection`] and
//! travel down the chain to the nearest reject callback (attached with
//! [`Promise::except`] or [`Promise::then_catch`]). A rejection that is
//! never observed is handed to a process-wide hook when its promise is
//! destroyed; see [`set_undelivered_rejection_hook`].

// -----------------------------------------------------------------------------
// Modules

mod callback;
mod delay;
mod error;
mod promise;
mod queue;
mod signal;
mod thread_pool;
mod unwind;
mod value;

// -----------------------------------------------------------------------------
// Top-level exports

pub use callback::Callback;
pub use delay::Cancelled;
pub use delay::Delay;
pub use error::BadCastHook;
pub use error::CastError;
pub use error::Error;
pub use error::Rejection;
pub use error::UndeliveredRejectionHook;
pub use error::set_bad_cast_hook;
pub use error::set_undelivered_rejection_hook;
pub use promise::Promise;
pub use signal::Completion;
pub use thread_pool::ThreadPool;
pub use value::Value;
