//! Error types for the force-free path
//!
//! Two categories, deliberately asymmetric:
//! - [`FreeError`] is the recoverable kind, returned to the caller as a
//!   normal `Err`. It means the *caller* picked an ineligible target.
//! - Fatal conditions (a slot whose state contradicts the runtime's own
//!   bookkeeping, a buffer released twice) indicate heap corruption and
//!   panic after logging. Continuing with a known-corrupt object graph
//!   risks silent corruption elsewhere, so no recovery is attempted.
//!
//! There is no unknown-representation error at runtime: [`crate::repr::Repr`]
//! is a closed enum and the dispatcher matches it exhaustively, so a new
//! representation kind that lacks a teardown arm fails to compile.

use std::fmt;

/// Recoverable rejection of a force-free target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// Target is an immediate value (nil, fixnum, true, false, symbol);
    /// there is no heap representation to free.
    ImmediateTarget,
    /// Target is one of the runtime-critical singletons (core classes,
    /// boolean/nil classes); freeing it would corrupt bootstrap state.
    CriticalSingleton,
}

impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreeError::ImmediateTarget => {
                write!(f, "force-free called for immediate value")
            }
            FreeError::CriticalSingleton => {
                write!(f, "force-free called for critical runtime object")
            }
        }
    }
}

impl std::error::Error for FreeError {}

/// Result type for force-free operations
pub type FreeResult<T> = Result<T, FreeError>;

/// Fatal: a reference presented as heap data does not denote a live record.
///
/// Reached when the caller passes an already-recycled reference (double
/// free), when a destructor hook re-freed the object mid-teardown, or when
/// the slot table itself is inconsistent. Never returned, always a panic.
pub(crate) fn broken_object(slot: u32, state: &'static str) -> ! {
    tracing::error!(slot, state, "force-free called for broken object");
    panic!("force-free called for broken object (slot {slot} is {state})");
}

/// Fatal: an auxiliary buffer was released after it was already freed.
pub(crate) fn buffer_double_free(buffer: u32) -> ! {
    tracing::error!(buffer, "auxiliary buffer released twice");
    panic!("double free of auxiliary buffer {buffer}");
}

/// Fatal: a buffer holds a different payload kind than its record claims.
pub(crate) fn buffer_kind_mismatch(buffer: u32, expected: &'static str) -> ! {
    tracing::error!(buffer, expected, "auxiliary buffer kind mismatch");
    panic!("buffer {buffer} does not hold {expected} data");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_readable_messages() {
        assert_eq!(
            FreeError::ImmediateTarget.to_string(),
            "force-free called for immediate value"
        );
        assert_eq!(
            FreeError::CriticalSingleton.to_string(),
            "force-free called for critical runtime object"
        );
    }

    #[test]
    fn free_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(FreeError::ImmediateTarget);
        assert!(err.source().is_none());
    }
}
