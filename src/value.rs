//! This module defines [`Value`], the type-erased payload that travels
//! through a promise chain. A `Value` is either empty, a rejection, or a
//! boxed value of an arbitrary concrete type chosen by the producer.
//!
//! Dynamic typing is essential here: callback argument types are not known
//! when a promise is constructed, so the engine checks them at attach time
//! and again during propagation. Rejections are stored as a distinguished
//! variant so that routing between the fulfil and reject channels is a
//! constant-time test rather than user code.

use std::any::Any;
use std::any::TypeId;
use std::any::type_name;
use std::fmt;
use std::mem;

use crate::error::CastError;
use crate::error::Error;
use crate::error::Rejection;

// -----------------------------------------------------------------------------
// Value

/// A type-erased container for a promise's eventual payload.
///
/// Values are created by producers, moved through the pipeline, and
/// destroyed with the last promise that holds them. Retrieval is by exact
/// type: [`Value::take`] and [`Value::borrow`] fail with a
/// [`CastError`] when the requested type does not match the stored one.
///
/// Rust cannot discover `Clone` implementations at runtime, so clonability
/// is decided at construction: [`Value::of`] stores a clone shim alongside
/// the payload, [`Value::unique`] does not. Cloning a unique value fails
/// with [`Error::NonCloneableValue`].
pub struct Value {
    repr: Repr,
}

enum Repr {
    Empty,
    Rejected(Rejection),
    Boxed(Boxed),
}

struct Boxed {
    payload: Box<dyn Any + Send>,
    name: &'static str,
    clone_shim: Option<fn(&(dyn Any + Send)) -> Box<dyn Any + Send>>,
}

fn clone_shim<T: Clone + Send + 'static>(payload: &(dyn Any + Send)) -> Box<dyn Any + Send> {
    match payload.downcast_ref::<T>() {
        Some(value) => Box::new(value.clone()),
        // The shim is only ever stored alongside a payload of type T.
        None => unreachable!("clone shim invoked on a mismatched payload"),
    }
}

impl Value {
    /// Creates an empty value. Settling a promise with an empty value is
    /// how "void" outcomes are expressed.
    pub fn empty() -> Value {
        Value { repr: Repr::Empty }
    }

    /// Wraps a cloneable value.
    pub fn of<T>(value: T) -> Value
    where
        T: Clone + Send + 'static,
    {
        Value {
            repr: Repr::Boxed(Boxed {
                payload: Box::new(value),
                name: type_name::<T>(),
                clone_shim: Some(clone_shim::<T>),
            }),
        }
    }

    /// Wraps a value without requiring `Clone`. The resulting `Value` can
    /// be moved through a chain of consuming callbacks but cannot fan out
    /// to multiple downstream promises.
    pub fn unique<T>(value: T) -> Value
    where
        T: Send + 'static,
    {
        Value {
            repr: Repr::Boxed(Boxed {
                payload: Box::new(value),
                name: type_name::<T>(),
                clone_shim: None,
            }),
        }
    }

    /// Wraps a rejection.
    pub fn rejected(rejection: Rejection) -> Value {
        Value {
            repr: Repr::Rejected(rejection),
        }
    }

    /// Returns true if this value is empty.
    pub fn is_empty(&self) -> bool {
        matches!(self.repr, Repr::Empty)
    }

    /// Returns true if this value carries a rejection.
    pub fn is_rejected(&self) -> bool {
        matches!(self.repr, Repr::Rejected(_))
    }

    /// Returns true if this value holds a payload of type `T`.
    pub fn is<T: Any>(&self) -> bool {
        match &self.repr {
            Repr::Boxed(boxed) => boxed.payload.as_ref().type_id() == TypeId::of::<T>(),
            _ => false,
        }
    }

    /// The type identity of the stored payload, if there is one.
    pub fn type_id(&self) -> Option<TypeId> {
        match &self.repr {
            Repr::Boxed(boxed) => Some(boxed.payload.as_ref().type_id()),
            _ => None,
        }
    }

    /// A human-readable name for the stored type.
    pub fn type_name(&self) -> &'static str {
        match &self.repr {
            Repr::Empty => "(empty)",
            Repr::Rejected(_) => "(rejection)",
            Repr::Boxed(boxed) => boxed.name,
        }
    }

    /// Borrows the payload as a `T`.
    pub fn borrow<T: Any>(&self) -> Result<&T, CastError> {
        match &self.repr {
            Repr::Boxed(boxed) => boxed.payload.downcast_ref().ok_or(CastError {
                from: boxed.name,
                to: type_name::<T>(),
            }),
            _ => Err(CastError {
                from: self.type_name(),
                to: type_name::<T>(),
            }),
        }
    }

    /// Moves the payload out as a `T`, leaving this value empty. On a type
    /// mismatch the payload stays in place.
    pub fn take<T: Any>(&mut self) -> Result<T, CastError> {
        match mem::replace(&mut self.repr, Repr::Empty) {
            Repr::Boxed(boxed) => match boxed.payload.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(payload) => {
                    let from = boxed.name;
                    self.repr = Repr::Boxed(Boxed {
                        payload,
                        name: boxed.name,
                        clone_shim: boxed.clone_shim,
                    });
                    Err(CastError {
                        from,
                        to: type_name::<T>(),
                    })
                }
            },
            other => {
                let from = name_of(&other);
                self.repr = other;
                Err(CastError {
                    from,
                    to: type_name::<T>(),
                })
            }
        }
    }

    /// Transfers the entire contents out, leaving this value empty.
    pub fn take_raw(&mut self) -> Value {
        Value {
            repr: mem::replace(&mut self.repr, Repr::Empty),
        }
    }

    /// Borrows the rejection, if this value carries one.
    pub fn rejection(&self) -> Option<&Rejection> {
        match &self.repr {
            Repr::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }

    /// Duplicates this value. Fails with [`Error::NonCloneableValue`] when
    /// the payload was stored with [`Value::unique`].
    pub fn try_clone(&self) -> Result<Value, Error> {
        match &self.repr {
            Repr::Empty => Ok(Value::empty()),
            Repr::Rejected(rejection) => Ok(Value::rejected(rejection.clone())),
            Repr::Boxed(boxed) => match boxed.clone_shim {
                Some(shim) => Ok(Value {
                    repr: Repr::Boxed(Boxed {
                        payload: shim(boxed.payload.as_ref()),
                        name: boxed.name,
                        clone_shim: boxed.clone_shim,
                    }),
                }),
                None => Err(Error::NonCloneableValue),
            },
        }
    }
}

fn name_of(repr: &Repr) -> &'static str {
    match repr {
        Repr::Empty => "(empty)",
        Repr::Rejected(_) => "(rejection)",
        Repr::Boxed(boxed) => boxed.name,
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Empty => f.write_str("Value::Empty"),
            Repr::Rejected(rejection) => f.debug_tuple("Value::Rejected").field(rejection).finish(),
            Repr::Boxed(boxed) => f.debug_tuple("Value::Boxed").field(&boxed.name).finish(),
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_type_retrieval() {
        let mut value = Value::of(42_i32);
        assert!(value.is::<i32>());
        assert_eq!(*value.borrow::<i32>().unwrap(), 42);

        // A mismatched take leaves the payload in place.
        let error = value.take::<String>().unwrap_err();
        assert_eq!(error.from, "i32");
        assert!(value.is::<i32>());

        assert_eq!(value.take::<i32>().unwrap(), 42);
        assert!(value.is_empty());
    }

    #[test]
    fn clone_follows_construction() {
        struct NoClone(#[allow(dead_code)] u8);

        let cloneable = Value::of(String::from("hi"));
        assert_eq!(
            cloneable.try_clone().unwrap().take::<String>().unwrap(),
            "hi"
        );

        let unique = Value::unique(NoClone(1));
        assert!(matches!(
            unique.try_clone(),
            Err(Error::NonCloneableValue)
        ));
    }

    #[test]
    fn rejection_variant() {
        let value = Value::rejected(Rejection::new("bad"));
        assert!(value.is_rejected());
        assert_eq!(value.rejection().unwrap().message(), "bad");
        assert_eq!(value.type_name(), "(rejection)");
        assert!(value.try_clone().unwrap().is_rejected());
    }

    #[test]
    fn take_raw_leaves_empty() {
        let mut value = Value::of(5_u64);
        let moved = value.take_raw();
        assert!(value.is_empty());
        assert!(moved.is::<u64>());
    }
}
