//! This module defines [`Callback`], a type-erased one-shot callable with
//! reflected argument and result metadata.
//!
//! A callback is attached to one of a promise's two channels (fulfil or
//! reject) and is invoked at most once, when the promise settles. The
//! metadata lets the engine check upstream-result / downstream-argument
//! compatibility at attach time, and lets a consuming callback close its
//! upstream so the settled payload can be moved instead of cloned.

use std::any::Any;
use std::any::TypeId;
use std::any::type_name;
use std::fmt;

use crate::error::CastError;
use crate::error::Rejection;
use crate::value::Value;

// -----------------------------------------------------------------------------
// Reflected metadata

/// A dynamic type identity: a comparable id plus a printable name.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct TypeSpec {
    pub id: TypeId,
    pub name: &'static str,
}

impl TypeSpec {
    pub(crate) fn of<T: 'static>() -> TypeSpec {
        TypeSpec {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }
}

/// Describes how a callback binds its argument.
pub(crate) enum ArgSpec {
    /// Takes no argument; accepts any input and ignores it.
    Nullary,
    /// Takes a concrete type, by reference or by value.
    Typed { ty: TypeSpec, consumes: bool },
    /// Takes the erased [`Value`] itself; accepts any input.
    Raw,
    /// Takes the rejection payload; only meaningful on the reject channel.
    Rejection,
}

impl ArgSpec {
    /// The concrete argument type, when there is one.
    pub(crate) fn concrete(&self) -> Option<&TypeSpec> {
        match self {
            ArgSpec::Typed { ty, .. } => Some(ty),
            _ => None,
        }
    }
}

// -----------------------------------------------------------------------------
// Callback

type InvokeFn = Box<dyn FnOnce(&mut Value) -> Result<Value, CastError> + Send>;

/// A type-erased single-argument callable, consumed when its promise
/// settles.
///
/// Constructors differ in how the argument is bound:
///
/// - [`Callback::nullary`] ignores the settled value entirely.
/// - [`Callback::map`] borrows the settled value by exact type.
/// - [`Callback::consume`] moves the settled value out by exact type;
///   attaching one closes the upstream promise.
/// - [`Callback::raw`] receives the erased [`Value`].
/// - [`Callback::catch`] receives the [`Rejection`] payload and belongs on
///   the reject channel.
///
/// Results must be `Send + 'static` and, outside the `_unique` variants,
/// `Clone` (so the produced value can fan out to several downstream
/// promises). A result of type [`Promise`](crate::Promise) turns the
/// enclosing promise into a dependent of it.
pub struct Callback {
    invoke: InvokeFn,
    arg: ArgSpec,
    result: TypeSpec,
}

impl Callback {
    /// Wraps a zero-argument callable.
    pub fn nullary<R, F>(f: F) -> Callback
    where
        F: FnOnce() -> R + Send + 'static,
        R: Clone + Send + 'static,
    {
        Callback {
            invoke: Box::new(move |_value| Ok(Value::of(f()))),
            arg: ArgSpec::Nullary,
            result: TypeSpec::of::<R>(),
        }
    }

    /// Wraps a zero-argument callable whose result is not `Clone`.
    pub fn nullary_unique<R, F>(f: F) -> Callback
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        Callback {
            invoke: Box::new(move |_value| Ok(Value::unique(f()))),
            arg: ArgSpec::Nullary,
            result: TypeSpec::of::<R>(),
        }
    }

    /// Wraps a callable that borrows the settled value.
    pub fn map<A, R, F>(f: F) -> Callback
    where
        F: FnOnce(&A) -> R + Send + 'static,
        A: Any,
        R: Clone + Send + 'static,
    {
        Callback {
            invoke: Box::new(move |value| {
                let arg = value.borrow::<A>()?;
                Ok(Value::of(f(arg)))
            }),
            arg: ArgSpec::Typed {
                ty: TypeSpec::of::<A>(),
                consumes: false,
            },
            result: TypeSpec::of::<R>(),
        }
    }

    /// Wraps a callable that takes the settled value by move. Attaching a
    /// consuming callback closes the upstream promise: the value can only
    /// be moved out once.
    pub fn consume<A, R, F>(f: F) -> Callback
    where
        F: FnOnce(A) -> R + Send + 'static,
        A: Any,
        R: Clone + Send + 'static,
    {
        Callback {
            invoke: Box::new(move |value| {
                let arg = value.take::<A>()?;
                Ok(Value::of(f(arg)))
            }),
            arg: ArgSpec::Typed {
                ty: TypeSpec::of::<A>(),
                consumes: true,
            },
            result: TypeSpec::of::<R>(),
        }
    }

    /// Like [`Callback::consume`], for results that are not `Clone`.
    pub fn consume_unique<A, R, F>(f: F) -> Callback
    where
        F: FnOnce(A) -> R + Send + 'static,
        A: Any,
        R: Send + 'static,
    {
        Callback {
            invoke: Box::new(move |value| {
                let arg = value.take::<A>()?;
                Ok(Value::unique(f(arg)))
            }),
            arg: ArgSpec::Typed {
                ty: TypeSpec::of::<A>(),
                consumes: true,
            },
            result: TypeSpec::of::<R>(),
        }
    }

    /// Wraps a callable that receives the erased [`Value`]. Compatible with
    /// any upstream result type.
    pub fn raw<R, F>(f: F) -> Callback
    where
        F: FnOnce(&Value) -> R + Send + 'static,
        R: Clone + Send + 'static,
    {
        Callback {
            invoke: Box::new(move |value| Ok(Value::of(f(&*value)))),
            arg: ArgSpec::Raw,
            result: TypeSpec::of::<R>(),
        }
    }

    /// Wraps a callable that receives the rejection payload. Use with
    /// [`Promise::except`](crate::Promise::except) or as the second argument
    /// of [`Promise::then_catch`](crate::Promise::then_catch).
    pub fn catch<R, F>(f: F) -> Callback
    where
        F: FnOnce(&Rejection) -> R + Send + 'static,
        R: Clone + Send + 'static,
    {
        Callback {
            invoke: Box::new(move |value| {
                let rejection = value.rejection().ok_or(CastError {
                    from: value.type_name(),
                    to: type_name::<Rejection>(),
                })?;
                Ok(Value::of(f(rejection)))
            }),
            arg: ArgSpec::Rejection,
            result: TypeSpec::of::<R>(),
        }
    }

    /// True if invoking this callback moves the payload out of the settled
    /// value.
    pub(crate) fn consumes_input(&self) -> bool {
        matches!(self.arg, ArgSpec::Typed { consumes: true, .. })
    }

    pub(crate) fn arg(&self) -> &ArgSpec {
        &self.arg
    }

    pub(crate) fn result(&self) -> TypeSpec {
        self.result
    }

    /// Runs the callback against a settled value. The value is mutated only
    /// by consuming callbacks, which leave it empty.
    pub(crate) fn invoke(self, value: &mut Value) -> Result<Value, CastError> {
        (self.invoke)(value)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arg = match &self.arg {
            ArgSpec::Nullary => "()",
            ArgSpec::Typed { ty, .. } => ty.name,
            ArgSpec::Raw => "Value",
            ArgSpec::Rejection => "Rejection",
        };
        write!(f, "Callback({} -> {})", arg, self.result.name)
    }
}

// -----------------------------------------------------------------------------
// Tests
