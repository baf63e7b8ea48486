//! Status codes for callers that speak errno
//!
//! Successful results become their non-negative value (0 for unit, the
//! fiber id, the FLS index or the stored value); failures become `-errno`.
//!
//! | Error              | errno    |
//! |--------------------|----------|
//! | `NotConverted`     | `EPERM`  |
//! | `AlreadyConverted` | `EEXIST` |
//! | `NoSuchFiber`      | `ESRCH`  |
//! | `Busy`             | `EBUSY`  |
//! | `OutOfRange`       | `EINVAL` |
//! | `NotAllocated`     | `ENOENT` |
//! | `Full`             | `ENOSPC` |
//! | `AllocationFailure`| `ENOMEM` |
//!
//! A stored FLS value may itself be negative, so `fls_get_value` results
//! are only unambiguous through [`FiberResult`] itself.

use ufiber_core::{FiberError, FiberId, FiberResult};

/// Positive errno for `err`
pub fn errno(err: FiberError) -> i32 {
    match err {
        FiberError::NotConverted => libc::EPERM,
        FiberError::AlreadyConverted => libc::EEXIST,
        FiberError::NoSuchFiber => libc::ESRCH,
        FiberError::Busy => libc::EBUSY,
        FiberError::OutOfRange => libc::EINVAL,
        FiberError::NotAllocated => libc::ENOENT,
        FiberError::Full => libc::ENOSPC,
        FiberError::AllocationFailure => libc::ENOMEM,
    }
}

/// Inverse of [`errno`]; accepts the code with either sign
pub fn from_errno(code: i32) -> Option<FiberError> {
    match code.checked_abs()? {
        libc::EPERM => Some(FiberError::NotConverted),
        libc::EEXIST => Some(FiberError::AlreadyConverted),
        libc::ESRCH => Some(FiberError::NoSuchFiber),
        libc::EBUSY => Some(FiberError::Busy),
        libc::EINVAL => Some(FiberError::OutOfRange),
        libc::ENOENT => Some(FiberError::NotAllocated),
        libc::ENOSPC => Some(FiberError::Full),
        libc::ENOMEM => Some(FiberError::AllocationFailure),
        _ => None,
    }
}

/// Values that can travel as a status code
pub trait StatusValue {
    fn into_status(self) -> i64;
}

impl StatusValue for () {
    fn into_status(self) -> i64 {
        0
    }
}

impl StatusValue for FiberId {
    fn into_status(self) -> i64 {
        i64::from(self.as_u32())
    }
}

impl StatusValue for usize {
    fn into_status(self) -> i64 {
        self as i64
    }
}

impl StatusValue for i64 {
    fn into_status(self) -> i64 {
        self
    }
}

/// Flatten a result into a single `i64`
pub fn status_code<T: StatusValue>(result: FiberResult<T>) -> i64 {
    match result {
        Ok(v) => v.into_status(),
        Err(e) => -i64::from(errno(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [FiberError; 8] = [
        FiberError::NotConverted,
        FiberError::AlreadyConverted,
        FiberError::NoSuchFiber,
        FiberError::Busy,
        FiberError::OutOfRange,
        FiberError::NotAllocated,
        FiberError::Full,
        FiberError::AllocationFailure,
    ];

    #[test]
    fn test_errno_distinct_and_reversible() {
        let mut seen = std::collections::HashSet::new();
        for e in ALL {
            let code = errno(e);
            assert!(code > 0);
            assert!(seen.insert(code), "duplicate errno for {}", e);
            assert_eq!(from_errno(code), Some(e));
            assert_eq!(from_errno(-code), Some(e));
        }
        assert_eq!(from_errno(0), None);
        assert_eq!(from_errno(i32::MIN), None);
    }

    #[test]
    fn test_status_code() {
        assert_eq!(status_code(Ok(())), 0);
        assert_eq!(status_code(Ok(FiberId::new(7))), 7);
        assert_eq!(status_code(Ok(4095usize)), 4095);
        assert_eq!(status_code(Ok(-3i64)), -3);
        assert_eq!(status_code::<()>(Err(FiberError::Busy)), -(libc::EBUSY as i64));
        assert_eq!(status_code::<usize>(Err(FiberError::Full)), -(libc::ENOSPC as i64));
    }
}
