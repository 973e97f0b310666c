/// Number of PCB slots. Task creation fails once all are live.
pub const MAX_TASKS: usize = 8;

/// Process identifier. Assigned monotonically from 1; 0 means "unused"
/// and is what Zombie slots carry between owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub i32);

impl Pid {
    pub const NONE: Pid = Pid(0);
}

/// Why a Blocked task is blocked. Only message receive blocks today; the
/// variant exists so new reasons widen this enum instead of the PCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    ReceivingMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked(BlockReason),
    Zombie,
}

/// Task name, capped at 31 bytes.
#[derive(Debug, Clone, Copy)]
pub struct TaskName {
    bytes: [u8; 32],
    len: usize,
}

impl TaskName {
    pub const MAX_LEN: usize = 31;

    pub fn new(name: &str) -> TaskName {
        let mut bytes = [0u8; 32];
        let len = name.len().min(Self::MAX_LEN);
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        TaskName { bytes, len }
    }

    pub const fn unnamed() -> TaskName {
        TaskName {
            bytes: [0u8; 32],
            len: 0,
        }
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("?")
    }
}

/// Process control block. One per slot in the fixed task table; a Zombie
/// slot is reusable and its pid field is not authoritative.
pub struct Pcb {
    /// Saved stack pointer; points at the register frame while the task
    /// is switched out.
    pub rsp: u64,
    /// Entry instruction pointer the task was created with.
    pub rip: u64,
    pub rflags: u64,
    /// Address-space root. All tasks copy the boot CR3 in this design.
    pub cr3: u64,
    pub state: TaskState,
    pub pid: Pid,
    /// Stored but not consulted by the round-robin policy.
    pub priority: i32,
    pub stack_base: u64,
    pub stack_size: u64,
    pub name: TaskName,
}

impl Pcb {
    pub const fn vacant() -> Pcb {
        Pcb {
            rsp: 0,
            rip: 0,
            rflags: 0,
            cr3: 0,
            state: TaskState::Zombie,
            pid: Pid::NONE,
            priority: 0,
            stack_base: 0,
            stack_size: 0,
            name: TaskName::unnamed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_capped_at_31_bytes() {
        let long = "abcdefghijklmnopqrstuvwxyz0123456789";
        let name = TaskName::new(long);
        assert_eq!(name.as_str().len(), 31);
        assert_eq!(name.as_str(), &long[..31]);
    }

    #[test]
    fn short_name_round_trips() {
        assert_eq!(TaskName::new("idle").as_str(), "idle");
        assert_eq!(TaskName::unnamed().as_str(), "");
    }

    #[test]
    fn vacant_slot_is_zombie_with_no_pid() {
        let pcb = Pcb::vacant();
        assert_eq!(pcb.state, TaskState::Zombie);
        assert_eq!(pcb.pid, Pid::NONE);
    }
}
