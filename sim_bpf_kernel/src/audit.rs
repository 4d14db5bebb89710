//! Request audit trail
//!
//! Records every request the simulated kernel handles, so tests can assert
//! how often a trial ran and that every handle it created was released.

use bpf_sys::{Command, Errno};
use serde::{Deserialize, Serialize};

/// Request audit event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyscallEvent {
    /// A request was received
    Invoked { command: Command },
    /// A request succeeded, creating `fd` if it creates an object
    Completed { command: Command, fd: Option<u32> },
    /// A request was rejected
    Rejected { command: Command, errno: Errno },
    /// A handle was released
    Closed { fd: u32 },
}

/// Audit log for request handling
#[derive(Debug, Clone, Default)]
pub struct SyscallAuditLog {
    events: Vec<SyscallEvent>,
}

impl SyscallAuditLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: SyscallEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[SyscallEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SyscallEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(e)).count()
    }

    /// Number of requests of `command` received
    pub fn invocations(&self, command: Command) -> usize {
        self.count_events(|e| matches!(e, SyscallEvent::Invoked { command: c } if *c == command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_log_counts_invocations() {
        let mut log = SyscallAuditLog::new();
        log.record(SyscallEvent::Invoked {
            command: Command::MapCreate,
        });
        log.record(SyscallEvent::Rejected {
            command: Command::MapCreate,
            errno: Errno::EINVAL,
        });
        log.record(SyscallEvent::Invoked {
            command: Command::ProgLoad,
        });

        assert_eq!(log.events().len(), 3);
        assert_eq!(log.invocations(Command::MapCreate), 1);
        assert_eq!(log.invocations(Command::MapUpdateBatch), 0);

        log.clear();
        assert!(log.events().is_empty());
    }
}
