use core::arch::naked_asm;

/// Register frame a switched-out task keeps on its stack. Layout must
/// match the push/pop sequences in `switch_stacks` below, lowest address
/// first: segment slots, RFLAGS, then the general registers, and finally
/// the return address the closing `ret` consumes.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TaskFrame {
    pub ss: u64,
    pub cs: u64,
    pub rflags: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
}

/// IF=1, IOPL=0.
pub const INITIAL_RFLAGS: u64 = 0x202;
/// User code and data selectors from the GDT layout.
pub const USER_CODE_SELECTOR: u64 = 0x18;
pub const USER_DATA_SELECTOR: u64 = 0x20;

impl TaskFrame {
    /// Canonical first-dispatch frame: general registers zeroed, user
    /// segment slots filled, resume at `entry` with interrupts enabled.
    pub fn initial(entry: u64) -> TaskFrame {
        TaskFrame {
            ss: USER_DATA_SELECTOR,
            cs: USER_CODE_SELECTOR,
            rflags: INITIAL_RFLAGS,
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rip: entry,
        }
    }
}

/// Install the canonical frame at the top of a fresh task's stack and
/// return the stack pointer to record in its PCB.
///
/// # Safety
/// The frame-sized region below `stack_top` must be mapped and owned by
/// the new task.
pub unsafe fn prepare_stack(stack_top: u64, entry: u64) -> u64 {
    let rsp = stack_top - core::mem::size_of::<TaskFrame>() as u64;
    core::ptr::write(rsp as *mut TaskFrame, TaskFrame::initial(entry));
    rsp
}

/// Switch from the task owning `prev_rsp` to the one owning `next_rsp`.
/// Saves the full register frame and RFLAGS on the outgoing stack and
/// records RSP through `prev_rsp`; loads the incoming RSP and unwinds its
/// frame. Returns (much) later, when the outgoing task is dispatched
/// again.
///
/// # Safety
/// Both pointers must reference the `rsp` fields of live PCBs, and
/// `*next_rsp` must point at a well-formed `TaskFrame`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_stacks(prev_rsp: *mut u64, next_rsp: *const u64) {
    naked_asm!(
        // Outgoing frame (rdi = prev_rsp slot). The call that got us here
        // already pushed the resume address.
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "pushfq",
        // rax is already saved; reuse it for the segment slots.
        "mov rax, cs",
        "push rax",
        "mov rax, ss",
        "push rax",
        "mov [rdi], rsp",
        // Incoming frame (rsi = next_rsp slot).
        "mov rsp, [rsi]",
        "pop rax", // ss slot; segments stay flat in long mode
        "pop rax", // cs slot
        "popfq",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "ret",
    );
}

/// Dispatch into `next_rsp` without saving the current context. Used for
/// the first dispatch from the boot stack and when the outgoing task is
/// dead.
///
/// # Safety
/// `*next_rsp` must point at a well-formed `TaskFrame`.
#[unsafe(naked)]
pub unsafe extern "C" fn resume_stack(next_rsp: *const u64) -> ! {
    naked_asm!(
        "mov rsp, [rdi]",
        "pop rax",
        "pop rax",
        "popfq",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_nineteen_qwords() {
        assert_eq!(core::mem::size_of::<TaskFrame>(), 19 * 8);
    }

    #[test]
    fn initial_frame_matches_the_abi_contract() {
        let frame = TaskFrame::initial(0x400000);
        assert_eq!(frame.rip, 0x400000);
        assert_eq!(frame.rflags, INITIAL_RFLAGS);
        assert_eq!(frame.cs, USER_CODE_SELECTOR);
        assert_eq!(frame.ss, USER_DATA_SELECTOR);
        assert_eq!(frame.rax, 0);
        assert_eq!(frame.r15, 0);
    }
}
