//! Deterministic fault injection for testing
//!
//! This module lets tests make the simulated kernel fail requests with a
//! chosen error code, independent of what the request contains. It is how
//! tests reach failure paths a healthy kernel would never take, such as an
//! out-of-memory error in the middle of a feature probe.
//!
//! ## Example
//!
//! ```
//! use bpf_sys::{Command, Errno};
//! use sim_bpf_kernel::fault_injection::{FaultPlan, SyscallFault};
//!
//! let plan = FaultPlan::new()
//!     .with_fault(SyscallFault::FailNext { count: 1, errno: Errno::ENOMEM })
//!     .with_fault(SyscallFault::FailCommand {
//!         command: Command::ProgLoad,
//!         count: 2,
//!         errno: Errno::EPERM,
//!     });
//! assert_eq!(plan.faults().len(), 2);
//! ```

use bpf_sys::{Command, Errno};

/// A fault to inject into request handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallFault {
    /// Fail the next N requests of any kind
    FailNext { count: usize, errno: Errno },

    /// Fail the next N requests of one kind
    FailCommand {
        command: Command,
        count: usize,
        errno: Errno,
    },
}

/// A plan describing all faults to inject
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    faults: Vec<SyscallFault>,
}

impl FaultPlan {
    /// Creates a new empty fault plan
    pub fn new() -> Self {
        Self { faults: Vec::new() }
    }

    /// Adds a fault to the plan
    pub fn with_fault(mut self, fault: SyscallFault) -> Self {
        self.faults.push(fault);
        self
    }

    /// Returns the planned faults
    pub fn faults(&self) -> &[SyscallFault] {
        &self.faults
    }
}

/// Applies a [`FaultPlan`] to incoming requests
///
/// Faults are consumed in plan order; the first one matching a request
/// decides its error code.
#[derive(Debug)]
pub struct FaultInjector {
    remaining: Vec<SyscallFault>,
    injected: usize,
}

impl FaultInjector {
    /// Creates a new fault injector with the given plan
    pub fn new(plan: FaultPlan) -> Self {
        Self {
            remaining: plan.faults,
            injected: 0,
        }
    }

    /// Returns the error to fail `command` with, if a fault applies
    pub fn check(&mut self, command: Command) -> Option<Errno> {
        let position = self.remaining.iter().position(|fault| match fault {
            SyscallFault::FailNext { count, .. } => *count > 0,
            SyscallFault::FailCommand {
                command: target,
                count,
                ..
            } => *target == command && *count > 0,
        })?;

        let errno = match &mut self.remaining[position] {
            SyscallFault::FailNext { count, errno } => {
                *count -= 1;
                *errno
            }
            SyscallFault::FailCommand { count, errno, .. } => {
                *count -= 1;
                *errno
            }
        };
        self.injected += 1;
        Some(errno)
    }

    /// Returns how many requests have been failed so far
    pub fn injected(&self) -> usize {
        self.injected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_plan_creation() {
        let plan = FaultPlan::new();
        assert!(plan.faults().is_empty());
    }

    #[test]
    fn test_fail_next_counts_down() {
        let plan = FaultPlan::new().with_fault(SyscallFault::FailNext {
            count: 2,
            errno: Errno::ENOMEM,
        });
        let mut injector = FaultInjector::new(plan);

        assert_eq!(injector.check(Command::MapCreate), Some(Errno::ENOMEM));
        assert_eq!(injector.check(Command::ProgLoad), Some(Errno::ENOMEM));
        assert_eq!(injector.check(Command::MapCreate), None);
        assert_eq!(injector.injected(), 2);
    }

    #[test]
    fn test_fail_command_only_matches_its_command() {
        let plan = FaultPlan::new().with_fault(SyscallFault::FailCommand {
            command: Command::ProgLoad,
            count: 1,
            errno: Errno::EPERM,
        });
        let mut injector = FaultInjector::new(plan);

        assert_eq!(injector.check(Command::MapCreate), None);
        assert_eq!(injector.check(Command::ProgLoad), Some(Errno::EPERM));
        assert_eq!(injector.check(Command::ProgLoad), None);
    }
}
