//! Fatal internal-compiler-error reporting.
//!
//! The allocator has a binary error taxonomy: invariant violations are
//! fatal and abort the compilation of the current method, while register
//! exhaustion is ordinary control flow that ends in a spill. This module
//! only covers the former.

use thiserror::Error;

/// A fatal internal error raised by an invariant check.
///
/// Carries the phase (or component) that detected the violation and a
/// diagnostic message with enough context to reproduce the failure.
/// There is no recovery path: the driver discards the method's
/// compilation attempt on the first `FatalError`.
#[derive(Debug, Error)]
#[error("register allocation failed in `{phase}`: {message}")]
pub struct FatalError {
    /// Name of the phase or component that detected the violation.
    pub phase: &'static str,
    /// Human-readable diagnostic.
    pub message: String,
}

impl FatalError {
    pub fn new(phase: &'static str, message: impl Into<String>) -> Self {
        FatalError {
            phase,
            message: message.into(),
        }
    }
}

/// Checks an invariant, producing a `FatalError` when it does not hold.
///
/// This is deliberately not `debug_assert!`: the documented invariants
/// must be enforced in release builds too.
macro_rules! fatal_check {
    ($cond:expr, $phase:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::error::FatalError::new($phase, format!($($arg)*)));
        }
    };
}

pub(crate) use fatal_check;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FatalError::new("walk-intervals", "interval v3 has no ranges");
        let text = format!("{}", err);
        assert!(text.contains("walk-intervals"));
        assert!(text.contains("v3"));
    }

    #[test]
    fn test_fatal_check_macro() {
        fn check(x: u32) -> Result<u32, FatalError> {
            fatal_check!(x % 2 == 0, "numbering", "position {} is odd", x);
            Ok(x)
        }

        assert!(check(4).is_ok());
        let err = check(5).unwrap_err();
        assert_eq!(err.phase, "numbering");
        assert!(err.message.contains('5'));
    }
}
