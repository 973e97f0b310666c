//! The int 0x80 syscall gate.
//!
//! User convention: RAX = syscall number, RDI/RSI/RDX = arguments,
//! result in RAX. RCX and R11 are clobbered as under the `syscall`
//! instruction contract.

use core::arch::naked_asm;

/// Entry stub for vector 0x80. Saves the user's general registers,
/// shuffles the syscall arguments into the System V positions, calls the
/// Rust dispatcher, and iretqs back with the result in RAX.
#[unsafe(naked)]
pub extern "C" fn syscall_entry() {
    naked_asm!(
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push r11",
        "push r10",
        "push r9",
        "push r8",
        "push rbp",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbx",
        "push rcx",
        // The CPU pushed 5 qwords, we pushed 14: realign to 16 bytes for
        // the call below.
        "sub rsp, 8",
        // dispatch(number, arg0, arg1, arg2) per System V: rdi, rsi,
        // rdx, rcx.
        "mov rcx, rdx",
        "mov rdx, rsi",
        "mov rsi, rdi",
        "mov rdi, rax",
        "call {dispatch}",
        "add rsp, 8",
        // RAX now holds the user-visible result; everything else is
        // restored.
        "pop rcx",
        "pop rbx",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "iretq",
        dispatch = sym crate::syscalls::dispatch,
    );
}
