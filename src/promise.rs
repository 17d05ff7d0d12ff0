//! This module contains the promise state machine and the [`Promise`]
//! handle.
//!
//! A promise references shared state (a *cell*). Copying a handle produces
//! another reference to the same cell; the cell lives as long as necessary
//! to propagate results. A cell is *pending* until it is settled with a
//! value or a rejection, at which point the value is routed through the
//! matching callback and propagated to every dependent cell.
//!
//! Cells synchronize with a small protocol rather than a single big lock:
//!
//! - `settled_by` is zero while pending; afterwards it holds a token for
//!   the settling thread. Writers store it with release ordering after the
//!   value is in place, so any thread that observes it non-zero (acquire)
//!   can read the value.
//! - `closed` is a monotonic flag set by `close` or by attaching a
//!   consuming callback. Once closed, no further attachments are accepted,
//!   which gives the settle path exclusive access to the cell state
//!   without taking the lock.
//! - Everything else (`value`, `upstream`, `downstream`, the callback
//!   slots) lives in an `UnsafeCell` guarded by `lock`, except where the
//!   two flags above make lock-free access sound.
//!
//! Callbacks are never invoked while any cell lock is held.

use std::any::Any;
use std::any::TypeId;
use std::cell::UnsafeCell;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::mem;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::callback::Callback;
use crate::error;
use crate::error::Error;
use crate::error::Rejection;
use crate::unwind;
use crate::value::Value;

// -----------------------------------------------------------------------------
// Thread tokens

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// A small non-zero identifier for the current thread, cheaper to store in
/// an atomic than `std::thread::ThreadId`.
fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

// -----------------------------------------------------------------------------
// Shared cell state

struct State {
    value: Option<Value>,
    upstream: Weak<Inner>,
    downstream: Vec<Arc<Inner>>,
    on_fulfil: Option<Callback>,
    on_reject: Option<Callback>,
}

pub(crate) struct Inner {
    /// Guards `state`. Skipped on the closed fast path, see module notes.
    lock: Mutex<()>,
    state: UnsafeCell<State>,
    /// Zero while pending, afterwards the settling thread's token.
    settled_by: AtomicU64,
    closed: AtomicBool,
    undelivered: AtomicBool,
}

// SAFETY: `state` is only accessed under `lock` or under the lock-free
// conditions documented on `Inner::state`, both of which serialize access
// across threads. All contained data is `Send`.
unsafe impl Send for Inner {}
// SAFETY: As above; shared references to `Inner` only expose `state`
// through the same protocol.
unsafe impl Sync for Inner {}

impl Inner {
    fn new(on_fulfil: Option<Callback>, on_reject: Option<Callback>) -> Arc<Inner> {
        Arc::new(Inner {
            lock: Mutex::new(()),
            state: UnsafeCell::new(State {
                value: None,
                upstream: Weak::new(),
                downstream: Vec::new(),
                on_fulfil,
                on_reject,
            }),
            settled_by: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            undelivered: AtomicBool::new(false),
        })
    }

    /// Returns a mutable view of the cell state.
    ///
    /// # Safety
    ///
    /// The caller must either hold `lock`, or be on a path where no other
    /// thread can touch the state: the settle path of a closed cell (closed
    /// cells accept no new attachments), or an attach to an already settled
    /// cell (where only the value is read, or moved under the
    /// wait-for-settlement lock).
    #[allow(clippy::mut_from_ref)]
    unsafe fn state(&self) -> &mut State {
        // SAFETY: Deferred to the caller, per above.
        unsafe { &mut *self.state.get() }
    }

    fn settled(&self) -> bool {
        self.settled_by.load(Ordering::Relaxed) != 0
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Attaches `next` as a dependent of this cell. If this cell is already
    /// settled, `next` is settled synchronously on the calling thread.
    fn link(self: &Arc<Inner>, next: &Arc<Inner>) -> Result<(), Error> {
        // Mark `next` as dependent and snapshot the metadata needed for the
        // compatibility check, under its own lock. Taking the two locks
        // sequentially (never nested) keeps the lock order trivial.
        let (next_consumes, next_arg) = {
            let _guard = next.lock.lock().unwrap();
            // SAFETY: `next`'s lock is held.
            let state = unsafe { next.state() };
            state.upstream = Arc::downgrade(self);
            let consumes = state
                .on_fulfil
                .as_ref()
                .is_some_and(Callback::consumes_input);
            let arg = state
                .on_fulfil
                .as_ref()
                .and_then(|callback| callback.arg().concrete().copied());
            (consumes, arg)
        };

        let mut settled = self.settled_by.load(Ordering::Acquire);
        let mut closed_here = false;
        let mut delivery: Option<Value> = None;
        let mut target: Option<Arc<Inner>> = None;

        if settled == 0 {
            // The cell is probably not settled (it could settle right after
            // the check). The lock protects against concurrent callers of
            // this function and of `settle`.
            let guard = self.lock.lock().unwrap();
            // SAFETY: This cell's lock is held.
            let state = unsafe { self.state() };

            // Check the type match between the upstream callback result and
            // the downstream callback argument. The check is inconclusive
            // when either side is unknowable (no callbacks, a promise
            // result, an untyped argument); a mismatch would eventually be
            // found during propagation, but it is much easier to debug when
            // found during attachment.
            let output = state
                .on_fulfil
                .as_ref()
                .map(Callback::result)
                .or_else(|| state.on_reject.as_ref().map(Callback::result));
            if let (Some(output), Some(input)) = (output, next_arg)
                && output.id != input.id
                && output.id != TypeId::of::<Promise>()
            {
                return Err(Error::TypeMismatch {
                    from: output.name,
                    to: input.name,
                });
            }

            state.downstream.push(next.clone());

            // A cell is closed once a consuming callback is attached,
            // because that callback can steal the value. The release store
            // lets `settle` read the downstream list without the lock after
            // an acquire load of `closed`.
            if next_consumes {
                self.closed.store(true, Ordering::Release);
                closed_here = true;
            }

            if state.value.is_some() {
                // Settled in between testing `settled_by` and taking the
                // lock. The settling call released the lock before we
                // acquired it, so the value is visible here.
                settled = self.settled_by.load(Ordering::Relaxed);
                if state.value.as_ref().is_some_and(Value::is_rejected) {
                    self.undelivered.store(false, Ordering::Relaxed);
                }

                let mut targets = mem::take(&mut state.downstream);
                target = targets.pop();
                delivery = Some(if closed_here {
                    state
                        .value
                        .as_mut()
                        .map(Value::take_raw)
                        .unwrap_or_else(Value::empty)
                } else {
                    clone_stored(state.value.as_ref())
                });
            }

            drop(guard);
        } else {
            // This cell already has a value, so `next` can be settled with
            // it immediately. The downstream list is not used, and the
            // acquire load of `settled_by` made the value visible.
            if next_consumes {
                self.closed.store(true, Ordering::Relaxed);
                closed_here = true;
            }

            if closed_here && settled != thread_token() {
                // This call attached a consuming callback to a cell settled
                // on another thread. Wait until any in-progress settlement
                // completes before the value can be moved out from under it.
                drop(self.lock.lock().unwrap());
            }

            // SAFETY: The cell is settled, so `settle` is done mutating the
            // state (the lock acquisition above waits out the in-progress
            // case). Concurrent attaches only read the value, except when
            // one of them closed the cell, in which case racing attaches
            // are already a bug in the caller's code.
            let state = unsafe { self.state() };
            if state.value.as_ref().is_some_and(Value::is_rejected) {
                self.undelivered.store(false, Ordering::Relaxed);
            }
            delivery = Some(if closed_here {
                state
                    .value
                    .as_mut()
                    .map(Value::take_raw)
                    .unwrap_or_else(Value::empty)
            } else {
                clone_stored(state.value.as_ref())
            });
            target = Some(next.clone());
        }

        if settled != 0
            && let (Some(target), Some(delivery)) = (target, delivery)
        {
            // Propagated settlement cannot fail: it is not direct.
            let _ = target.settle(delivery, false);
        }

        Ok(())
    }

    /// Settles this cell with a value, routing it through the appropriate
    /// callback and propagating the outcome downstream. `direct` marks
    /// settlement by a handle (as opposed to propagation from upstream).
    fn settle(self: &Arc<Inner>, mut value: Value, direct: bool) -> Result<(), Error> {
        if direct && self.settled() {
            return Err(Error::AlreadySettled);
        }

        // Both slots are consumed by a settlement no matter which channel
        // fires; at most one of them is invoked. Taken under the lock so
        // the read does not race with the compatibility check in `link`.
        let (on_fulfil, on_reject) = {
            let _guard = self.lock.lock().unwrap();
            // SAFETY: This cell's lock is held.
            let state = unsafe { self.state() };
            (state.on_fulfil.take(), state.on_reject.take())
        };

        // Pass the value through the matching callback, if present. The
        // callback runs outside every lock.
        let produced = if value.is_rejected() {
            on_reject.map(|callback| run_callback(callback, &mut value))
        } else {
            on_fulfil.map(|callback| run_callback(callback, &mut value))
        };

        // A callback that returns a promise makes this cell dependent on
        // it: settlement arrives later, by propagation.
        let out = match produced {
            Some(mut out) if out.is::<Promise>() => {
                if let Ok(upstream) = out.take::<Promise>() {
                    upstream.inner.link(self)?;
                }
                return Ok(());
            }
            other => other,
        };

        // Access to the state is exclusive once closed (no further
        // attachments are accepted), so the lock can be skipped in that
        // state. The acquire load pairs with the release store in `link`.
        let closed = self.closed.load(Ordering::Acquire);
        let guard = (!closed).then(|| self.lock.lock().unwrap());

        // SAFETY: Either the lock is held, or the cell is closed and this
        // settlement is the only writer.
        let state = unsafe { self.state() };

        if direct && state.upstream.strong_count() != 0 {
            return Err(Error::DependentPromise);
        }
        state.upstream = Weak::new();

        // If a callback transformed the value, store its result; otherwise
        // store the incoming value unchanged.
        state.value = Some(out.unwrap_or(value));

        // The local update is complete. The release store lets threads
        // that acquire `settled_by` read the value.
        self.settled_by.store(thread_token(), Ordering::Release);

        let targets = mem::take(&mut state.downstream);
        if targets.is_empty() {
            if state.value.as_ref().is_some_and(Value::is_rejected) {
                // The value holds an undelivered rejection. If it is still
                // undelivered at destruction the hook fires, potentially on
                // another thread; the release store keeps the value visible
                // there when the lock was skipped.
                let ordering = if closed {
                    Ordering::Release
                } else {
                    Ordering::Relaxed
                };
                self.undelivered.store(true, ordering);
            }
            return Ok(());
        }

        // Clone to every target and keep the stored value, so that later
        // attachments still find it. Only on the closed path may the last
        // (in practice, only) target take the value by move; nothing can
        // attach afterwards.
        let last = targets.len() - 1;
        let mut deliveries = Vec::with_capacity(targets.len());
        if let Some(stored) = state.value.as_mut() {
            for index in 0..targets.len() {
                deliveries.push(if closed && index == last {
                    stored.take_raw()
                } else {
                    clone_stored(Some(&*stored))
                });
            }
        }
        drop(guard);

        for (target, delivery) in targets.into_iter().zip(deliveries) {
            // Propagated settlement cannot fail: it is not direct.
            let _ = target.settle(delivery, false);
        }

        Ok(())
    }
}

/// Clones a stored value for fan-out. A payload without a clone shim turns
/// into a rejection carrying the clone failure.
fn clone_stored(stored: Option<&Value>) -> Value {
    match stored {
        Some(value) => value
            .try_clone()
            .unwrap_or_else(|error| Value::rejected(Rejection::from(error))),
        None => Value::empty(),
    }
}

/// Invokes a callback, capturing panics and cast failures into the
/// rejection channel.
fn run_callback(callback: Callback, value: &mut Value) -> Value {
    match unwind::halt_unwinding(|| callback.invoke(value)) {
        Ok(Ok(out)) => out,
        Ok(Err(cast)) => {
            // The settled value does not match the callback argument, which
            // is a user code error. The hook gets the first look; if it
            // returns normally the error joins the rejection channel.
            error::bad_cast(&cast);
            Value::rejected(Rejection::from(cast))
        }
        Err(payload) => Value::rejected(Rejection::from_panic(payload)),
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Pass undelivered rejections to the process-wide hook.
        if self.undelivered.load(Ordering::Acquire) {
            let state = self.state.get_mut();
            if let Some(value) = &state.value
                && let Some(rejection) = value.rejection()
            {
                error::undelivered_rejection(rejection);
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Promise handle

/// A handle to the eventual result of an asynchronous operation.
///
/// `Promise` is a lightweight value with reference semantics: cloning a
/// handle yields a second reference to the same shared cell, and two
/// handles to the same cell compare equal and hash identically.
///
/// A promise built with [`Promise::new`] or [`Promise::with`] is
/// *non-dependent* and is settled explicitly through one of the `settle`
/// methods. A promise returned by [`Promise::then`] or [`Promise::except`]
/// is *dependent*: it is settled by its upstream, and settling it directly
/// fails with [`Error::DependentPromise`].
#[derive(Clone)]
pub struct Promise {
    inner: Arc<Inner>,
}

impl Promise {
    /// Creates a pending promise with no callbacks.
    pub fn new() -> Promise {
        Promise {
            inner: Inner::new(None, None),
        }
    }

    /// Creates a pending promise with optional fulfil and reject callbacks.
    /// When both are present their result types must agree.
    pub fn with(on_fulfil: Option<Callback>, on_reject: Option<Callback>) -> Result<Promise, Error> {
        if let (Some(fulfil), Some(reject)) = (&on_fulfil, &on_reject) {
            let (fulfil, reject) = (fulfil.result(), reject.result());
            if fulfil.id != reject.id {
                return Err(Error::TypeMismatch {
                    from: fulfil.name,
                    to: reject.name,
                });
            }
        }
        Ok(Promise {
            inner: Inner::new(on_fulfil, on_reject),
        })
    }

    /// Creates a pending promise with only a fulfil callback. Infallible
    /// counterpart of [`Promise::with`] for internal use.
    pub(crate) fn with_fulfil(on_fulfil: Callback) -> Promise {
        Promise {
            inner: Inner::new(Some(on_fulfil), None),
        }
    }

    /// Settles with a cloneable value.
    pub fn settle<T>(&self, value: T) -> Result<(), Error>
    where
        T: Clone + Send + 'static,
    {
        self.inner.settle(Value::of(value), true)
    }

    /// Settles with a value that is not `Clone`. The resulting chain cannot
    /// fan out past this value.
    pub fn settle_unique<T>(&self, value: T) -> Result<(), Error>
    where
        T: Send + 'static,
    {
        self.inner.settle(Value::unique(value), true)
    }

    /// Settles with an empty value.
    pub fn settle_empty(&self) -> Result<(), Error> {
        self.inner.settle(Value::empty(), true)
    }

    /// Settles with an already-erased [`Value`].
    pub fn settle_value(&self, value: Value) -> Result<(), Error> {
        self.inner.settle(value, true)
    }

    /// Settles with a rejection.
    pub fn settle_rejection(&self, rejection: Rejection) -> Result<(), Error> {
        self.inner.settle(Value::rejected(rejection), true)
    }

    /// Settles with an error wrapped into a rejection.
    pub fn reject<E>(&self, error: E) -> Result<(), Error>
    where
        E: Any + fmt::Display + Send + Sync,
    {
        self.settle_rejection(Rejection::new(error))
    }

    /// Attaches a fulfil callback, returning the dependent promise that
    /// receives the callback's result. Rejections pass through unchanged.
    ///
    /// Fails with [`Error::Closed`] on a closed promise, and with
    /// [`Error::TypeMismatch`] when this promise's result type cannot feed
    /// the callback's argument type.
    pub fn then(&self, on_fulfil: Callback) -> Result<Promise, Error> {
        self.attach(Some(on_fulfil), None)
    }

    /// Attaches a fulfil and a reject callback. At most one of them will
    /// ever be invoked.
    pub fn then_catch(&self, on_fulfil: Callback, on_reject: Callback) -> Result<Promise, Error> {
        self.attach(Some(on_fulfil), Some(on_reject))
    }

    /// Attaches only a reject callback. Fulfilment values pass through to
    /// the dependent promise unchanged.
    pub fn except(&self, on_reject: Callback) -> Result<Promise, Error> {
        self.attach(None, Some(on_reject))
    }

    fn attach(
        &self,
        on_fulfil: Option<Callback>,
        on_reject: Option<Callback>,
    ) -> Result<Promise, Error> {
        if self.inner.closed() {
            return Err(Error::Closed);
        }
        let next = Promise::with(on_fulfil, on_reject)?;
        self.inner.link(&next.inner)?;
        Ok(next)
    }

    /// Closes this promise: no further `then`/`except` attachments are
    /// accepted. A closed promise may settle slightly faster than an open
    /// one. Idempotent.
    pub fn close(&self) -> &Promise {
        self.inner.close();
        self
    }

    /// True once this promise has been fulfilled or rejected. Monotonic.
    pub fn is_settled(&self) -> bool {
        self.inner.settled()
    }

    /// True once this promise has been closed, either explicitly or by
    /// attaching a consuming callback. Monotonic.
    pub fn is_closed(&self) -> bool {
        self.inner.closed()
    }

    /// Returns a promise that fulfils with a `Vec<Value>` of the input
    /// values (in input order) once every input fulfils, or rejects with
    /// the first rejection. An empty input fulfils immediately.
    pub fn all<I>(promises: I) -> Result<Promise, Error>
    where
        I: IntoIterator<Item = Promise>,
    {
        let inputs: Vec<Promise> = promises.into_iter().collect();
        let combined = Promise::new();
        if inputs.is_empty() {
            let _ = combined.settle_value(Value::unique(Vec::<Value>::new()));
            return Ok(combined);
        }

        struct Gather {
            slots: Mutex<Vec<Option<Value>>>,
            remaining: AtomicUsize,
            rejected: AtomicBool,
        }

        let gather = Arc::new(Gather {
            slots: Mutex::new((0..inputs.len()).map(|_| None).collect()),
            remaining: AtomicUsize::new(inputs.len()),
            rejected: AtomicBool::new(false),
        });

        for (index, input) in inputs.iter().enumerate() {
            let on_value = {
                let gather = gather.clone();
                let combined = combined.clone();
                Callback::raw(move |value: &Value| match value.try_clone() {
                    Ok(value) => {
                        gather.slots.lock().unwrap()[index] = Some(value);
                        if gather.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            let slots = mem::take(&mut *gather.slots.lock().unwrap());
                            let values: Vec<Value> = slots
                                .into_iter()
                                .map(|slot| slot.unwrap_or_else(Value::empty))
                                .collect();
                            // Ignored if the caller settled `combined`
                            // directly in the meantime.
                            let _ = combined.settle_value(Value::unique(values));
                        }
                    }
                    Err(error) => {
                        if !gather.rejected.swap(true, Ordering::Relaxed) {
                            let _ = combined.settle_rejection(Rejection::from(error));
                        }
                    }
                })
            };
            let on_rejection = {
                let gather = gather.clone();
                let combined = combined.clone();
                Callback::catch(move |rejection: &Rejection| {
                    // Only the first rejection settles the combined promise.
                    if !gather.rejected.swap(true, Ordering::Relaxed) {
                        let _ = combined.settle_rejection(rejection.clone());
                    }
                })
            };
            input.then_catch(on_value, on_rejection)?;
        }

        Ok(combined)
    }

    /// Returns a promise that settles with the first input fulfilment, or
    /// rejects once every input has rejected. The rejection payload of the
    /// all-rejected case is unspecified. An empty input rejects
    /// immediately.
    pub fn any<I>(promises: I) -> Result<Promise, Error>
    where
        I: IntoIterator<Item = Promise>,
    {
        let inputs: Vec<Promise> = promises.into_iter().collect();
        let combined = Promise::new();
        if inputs.is_empty() {
            let _ = combined.settle_rejection(Rejection::new("no promise fulfilled"));
            return Ok(combined);
        }

        struct Race {
            remaining: AtomicUsize,
            fulfilled: AtomicBool,
        }

        let race = Arc::new(Race {
            remaining: AtomicUsize::new(inputs.len()),
            fulfilled: AtomicBool::new(false),
        });

        for input in &inputs {
            let on_value = {
                let race = race.clone();
                let combined = combined.clone();
                Callback::raw(move |value: &Value| {
                    if !race.fulfilled.swap(true, Ordering::Relaxed) {
                        let _ = combined.settle_value(clone_stored(Some(value)));
                    }
                })
            };
            let on_rejection = {
                let race = race.clone();
                let combined = combined.clone();
                Callback::catch(move |_rejection: &Rejection| {
                    if race.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let _ = combined.settle_rejection(Rejection::new("no promise fulfilled"));
                    }
                })
            };
            input.then_catch(on_value, on_rejection)?;
        }

        Ok(combined)
    }
}

impl Default for Promise {
    fn default() -> Promise {
        Promise::new()
    }
}

impl PartialEq for Promise {
    fn eq(&self, other: &Promise) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Promise {}

impl Hash for Promise {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("settled", &self.is_settled())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Tests
