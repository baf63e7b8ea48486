//! Read-only per-fiber snapshots
//!
//! `Display` renders the classic per-fiber dump:
//!
//! ```text
//! Currently Running: yes
//! Start Address: 0x000055d0c0a01234
//! Created From: 4711
//! Tot Activations: 3
//! Tot Failed Activations: 0
//! Total Execution Time: 12840
//! ```
//!
//! Execution time is in nanoseconds and covers completed activations only.

use core::fmt;

use ufiber_core::{FiberId, ThreadId};

use crate::fiber::{Fiber, StackOwnership};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberInfo {
    pub id: FiberId,
    pub running: bool,
    pub owner: Option<ThreadId>,
    pub entry_point: usize,
    pub creator: ThreadId,
    pub activations: u64,
    pub failed_activations: u64,
    pub total_running_ns: u64,
    pub last_activation_ns: Option<u64>,
    pub stack_base: usize,
    pub stack_size: usize,
    pub converted: bool,
}

impl FiberInfo {
    pub fn of(fiber: &Fiber) -> Self {
        let state = fiber.state();
        let m = fiber.metrics().snapshot();
        let stack = fiber.stack();
        Self {
            id: fiber.id(),
            running: state.is_running(),
            owner: state.owner(),
            entry_point: m.entry_point,
            creator: m.creator,
            activations: m.activations,
            failed_activations: m.failed_activations,
            total_running_ns: m.total_running_ns,
            last_activation_ns: m.last_activation_ns,
            stack_base: stack.base,
            stack_size: stack.size,
            converted: stack.ownership == StackOwnership::Thread,
        }
    }
}

impl fmt::Display for FiberInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Currently Running: {}", if self.running { "yes" } else { "no" })?;
        writeln!(f, "Start Address: {:#018x}", self.entry_point)?;
        writeln!(f, "Created From: {}", self.creator)?;
        writeln!(f, "Tot Activations: {}", self.activations)?;
        writeln!(f, "Tot Failed Activations: {}", self.failed_activations)?;
        writeln!(f, "Total Execution Time: {}", self.total_running_ns)?;
        writeln!(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_format() {
        let info = FiberInfo {
            id: FiberId::new(3),
            running: true,
            owner: ThreadId::new(12),
            entry_point: 0x1234,
            creator: ThreadId::new(11).unwrap(),
            activations: 3,
            failed_activations: 1,
            total_running_ns: 900,
            last_activation_ns: Some(10),
            stack_base: 0,
            stack_size: 0,
            converted: false,
        };
        assert_eq!(
            info.to_string(),
            "Currently Running: yes\n\
             Start Address: 0x0000000000001234\n\
             Created From: 11\n\
             Tot Activations: 3\n\
             Tot Failed Activations: 1\n\
             Total Execution Time: 900\n\n"
        );
    }

    #[test]
    fn test_of_converted() {
        let tid = ThreadId::new(5).unwrap();
        let fiber = Fiber::converted(FiberId::new(1), tid, 0);
        let info = FiberInfo::of(&fiber);
        assert!(info.running);
        assert!(info.converted);
        assert_eq!(info.owner, Some(tid));
        assert_eq!(info.activations, 1);
        assert!(info.to_string().starts_with("Currently Running: yes\nStart Address: 0x0000000000000000\n"));
    }
}
