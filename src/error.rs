//! Error types for the promise engine, the shared rejection payload, and
//! the two process-wide failure hooks.

use std::any::Any;
use std::fmt;
use std::io;
use std::process::abort;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::PoisonError;

use thiserror::Error as ThisError;

use crate::unwind;

// -----------------------------------------------------------------------------
// Engine errors

/// Errors reported by the promise engine and the thread pool.
///
/// These cover misuse of the api surface. Failures inside user callbacks are
/// never reported this way; they are captured as [`Rejection`] values and
/// propagated along the promise chain instead.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum Error {
    /// A second direct settlement was attempted on a settled promise.
    #[error("promise already settled")]
    AlreadySettled,

    /// A dependent promise (one produced by `then` or `except`) was settled
    /// directly. Dependent promises are settled by their upstream.
    #[error("invalid operation on dependent promise")]
    DependentPromise,

    /// `then` or `except` was called on a closed promise.
    #[error("promise is closed")]
    Closed,

    /// A settled value did not match the type a callback expected.
    #[error(transparent)]
    BadCast(#[from] CastError),

    /// An upstream callback's result type cannot feed a downstream
    /// callback's argument type. Detected at attach time when both types
    /// are concrete.
    #[error("type mismatch: {from} -> {to}")]
    TypeMismatch {
        from: &'static str,
        to: &'static str,
    },

    /// Fan-out required cloning a value that was stored without a clone
    /// shim (see [`Value::unique`](crate::Value::unique)).
    #[error("promise holds a non-cloneable value")]
    NonCloneableValue,

    /// The thread pool was asked to run with zero threads.
    #[error("thread count must be at least 1")]
    InvalidThreadCount,

    /// Spawning a worker thread failed. The pool is rolled back to its
    /// previous size before this is returned.
    #[error("failed to spawn worker thread")]
    Spawn(#[from] io::Error),
}

/// A failed exact-type retrieval from a [`Value`](crate::Value).
#[derive(Debug, Clone, ThisError)]
#[error("failed cast from {from} to {to}")]
pub struct CastError {
    /// Type name of the stored payload.
    pub from: &'static str,
    /// Type name the caller asked for.
    pub to: &'static str,
}

// -----------------------------------------------------------------------------
// Rejection payload

/// The payload of a rejected promise.
///
/// A `Rejection` is a cheaply cloneable, shared, type-erased error value. It
/// is created from any displayable error type, or captured automatically when
/// a callback panics. The engine treats rejections as just another payload
/// variant: they travel down the chain until an `on_reject` callback observes
/// them.
#[derive(Clone)]
pub struct Rejection {
    payload: Arc<dyn Any + Send + Sync>,
    message: Arc<str>,
}

impl Rejection {
    /// Wraps an error value in a rejection.
    pub fn new<E>(error: E) -> Rejection
    where
        E: Any + fmt::Display + Send + Sync,
    {
        let message = Arc::from(error.to_string().as_str());
        Rejection {
            payload: Arc::new(error),
            message,
        }
    }

    /// Builds a rejection from a caught panic payload, preserving the panic
    /// message when there is one.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Rejection {
        Rejection::new(unwind::panic_message(payload))
    }

    /// Borrows the original error value, if it has type `E`.
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.payload.downcast_ref()
    }

    /// The display form of the original error.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Rejection").field(&self.message).finish()
    }
}

impl From<Error> for Rejection {
    fn from(error: Error) -> Rejection {
        Rejection::new(error)
    }
}

impl From<CastError> for Rejection {
    fn from(error: CastError) -> Rejection {
        Rejection::new(error)
    }
}

// -----------------------------------------------------------------------------
// Process-wide hooks

/// Handler invoked when a rejection is dropped without ever reaching an
/// `on_reject` callback.
pub type UndeliveredRejectionHook = Box<dyn Fn(&Rejection) + Send + Sync>;

/// Handler invoked when a settled value fails to cast to a callback's
/// argument type during propagation.
pub type BadCastHook = Box<dyn Fn(&CastError) + Send + Sync>;

struct Hooks {
    undelivered: UndeliveredRejectionHook,
    bad_cast: BadCastHook,
}

// One mutex guards both installation and invocation: invocation can race
// with the destructor of a detached promise on another thread.
static HOOKS: LazyLock<Mutex<Hooks>> = LazyLock::new(|| {
    Mutex::new(Hooks {
        undelivered: Box::new(default_undelivered),
        bad_cast: Box::new(default_bad_cast),
    })
});

/// There is nothing technically wrong with discarding an undelivered
/// rejection, but it makes certain bugs much harder to find. The default
/// handler therefore logs and aborts.
fn default_undelivered(rejection: &Rejection) {
    tracing::error!("undelivered promise rejection: {rejection}");
    eprintln!("segue: undelivered promise rejection: {rejection}; aborting");
    abort();
}

/// A value/argument mismatch is usually a programming error, so the default
/// handler panics at the settlement site instead of capturing the error into
/// the rejection channel.
fn default_bad_cast(error: &CastError) {
    panic!("{error}");
}

/// Replaces the handler for undelivered rejections, returning the previous
/// handler. Thread-safe.
///
/// The handler runs while a promise is being destroyed, so it must not
/// panic, and it must not install hooks itself.
pub fn set_undelivered_rejection_hook(hook: UndeliveredRejectionHook) -> UndeliveredRejectionHook {
    let mut hooks = HOOKS.lock().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut hooks.undelivered, hook)
}

/// Replaces the handler for bad callback-argument casts, returning the
/// previous handler. Thread-safe.
///
/// If the replacement returns normally the cast error is captured and
/// propagated along the rejection channel like any other error.
pub fn set_bad_cast_hook(hook: BadCastHook) -> BadCastHook {
    let mut hooks = HOOKS.lock().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut hooks.bad_cast, hook)
}

/// Runs the undelivered-rejection hook under the handler mutex.
pub(crate) fn undelivered_rejection(rejection: &Rejection) {
    let hooks = HOOKS.lock().unwrap_or_else(PoisonError::into_inner);
    (hooks.undelivered)(rejection);
}

/// Runs the bad-cast hook under the handler mutex. Returning normally means
/// the caller should capture the error into the rejection channel.
pub(crate) fn bad_cast(error: &CastError) {
    let hooks = HOOKS.lock().unwrap_or_else(PoisonError::into_inner);
    (hooks.bad_cast)(error);
}

// -----------------------------------------------------------------------------
// Tests
