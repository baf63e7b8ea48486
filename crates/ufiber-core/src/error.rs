//! Error types for fiber operations

use core::fmt;

/// Result type for fiber operations
pub type FiberResult<T> = Result<T, FiberError>;

/// Errors returned by the fiber engine
///
/// Every operation reports exactly one of these; none of them leaves a
/// partially built registry row behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberError {
    /// Calling thread (or its process) has not been converted to a fiber
    NotConverted,

    /// Calling thread is already converted
    AlreadyConverted,

    /// Target fiber does not exist in the caller's process
    NoSuchFiber,

    /// Target fiber is currently running in some thread
    Busy,

    /// FLS index outside `[0, FLS_CAPACITY)`
    OutOfRange,

    /// FLS index is in range but not currently allocated
    NotAllocated,

    /// Every FLS slot of the fiber is in use
    Full,

    /// Bookkeeping memory (or a fiber id) could not be obtained
    AllocationFailure,
}

impl FiberError {
    /// Short stable name, used in log lines
    pub const fn name(&self) -> &'static str {
        match self {
            FiberError::NotConverted => "NotConverted",
            FiberError::AlreadyConverted => "AlreadyConverted",
            FiberError::NoSuchFiber => "NoSuchFiber",
            FiberError::Busy => "Busy",
            FiberError::OutOfRange => "OutOfRange",
            FiberError::NotAllocated => "NotAllocated",
            FiberError::Full => "Full",
            FiberError::AllocationFailure => "AllocationFailure",
        }
    }
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberError::NotConverted => write!(f, "thread is not converted to a fiber"),
            FiberError::AlreadyConverted => write!(f, "thread is already a fiber"),
            FiberError::NoSuchFiber => write!(f, "no such fiber"),
            FiberError::Busy => write!(f, "fiber is running in another thread"),
            FiberError::OutOfRange => write!(f, "FLS index out of range"),
            FiberError::NotAllocated => write!(f, "FLS index not allocated"),
            FiberError::Full => write!(f, "no free FLS slots"),
            FiberError::AllocationFailure => write!(f, "bookkeeping allocation failed"),
        }
    }
}

impl std::error::Error for FiberError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", FiberError::Busy), "fiber is running in another thread");
        assert_eq!(format!("{}", FiberError::Full), "no free FLS slots");
    }

    #[test]
    fn test_error_name() {
        assert_eq!(FiberError::NoSuchFiber.name(), "NoSuchFiber");
        assert_eq!(FiberError::AllocationFailure.name(), "AllocationFailure");
    }

    #[test]
    fn test_boxed_error() {
        let e: Box<dyn std::error::Error> = Box::new(FiberError::NotConverted);
        assert_eq!(e.to_string(), "thread is not converted to a fiber");
    }
}
