//! Result and error types representing the outcome of register allocation.

use core::fmt;
use std::error::Error;

/// A compilation error.
///
/// When register allocation fails, it returns one of these error codes. The
/// caller is expected to mark the method as not compilable and fall back to a
/// different tier; none of these errors leave the function in a usable state.
#[derive(Debug, PartialEq, Eq)]
pub enum CodegenError {
    /// An operand whose register class has no spill mask (condition flags and
    /// similar special registers) needed to be spilled.
    NotSpillable,

    /// The spill-split-recycle loop failed to reach a coloring within its
    /// retry budget.
    SpillLimitExceeded,

    /// Splitting would grow the instruction graph past the node budget.
    ImplLimitExceeded,

    /// A chosen register cannot be represented in a safepoint record.
    IllegalStackmapRegister,

    /// A derived pointer was live across a safepoint with no reachable base.
    DerivedWithoutBase,

    /// The input shape cannot be allocated as-is; the caller should retry the
    /// whole compilation with load subsumption disabled.
    RetryWithoutSubsumedLoads,
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error
/// type.
pub type CodegenResult<T> = Result<T, CodegenError>;

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotSpillable => write!(f, "attempted to spill a non-spillable item"),
            Self::SpillLimitExceeded => write!(f, "failed spill-split-recycle sanity check"),
            Self::ImplLimitExceeded => write!(f, "out of nodes during spilling"),
            Self::IllegalStackmapRegister => {
                write!(f, "register cannot be represented in a safepoint record")
            }
            Self::DerivedWithoutBase => write!(f, "derived pointer without a base"),
            Self::RetryWithoutSubsumedLoads => {
                write!(f, "retry compilation without subsumed loads")
            }
        }
    }
}

impl Error for CodegenError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            CodegenError::NotSpillable.to_string(),
            "attempted to spill a non-spillable item"
        );
        assert_eq!(
            CodegenError::SpillLimitExceeded.to_string(),
            "failed spill-split-recycle sanity check"
        );
    }
}
