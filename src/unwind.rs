//! Unwinding recovery utilities.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::thread::Result;

/// Executes `f` and captures any panic, translating that panic into an
/// `Err` result. The assumption is that any panic will be converted into a
/// rejection and propagated down the promise chain, and hence `f` can be
/// treated as exception safe.
#[inline(always)]
pub(crate) fn halt_unwinding<F, R>(func: F) -> Result<R>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(func))
}

/// Extracts the human-readable message from a panic payload. Panics raised
/// with `panic!` carry a `String` or a `&'static str`; anything else gets a
/// placeholder.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(_) => "callback panicked".to_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_panic_message() {
        let result = halt_unwinding(|| panic!("boom {}", 1));
        let payload = result.unwrap_err();
        assert_eq!(panic_message(payload), "boom 1");
    }

    #[test]
    fn passes_through_success() {
        assert_eq!(halt_unwinding(|| 3).unwrap(), 3);
    }
}
