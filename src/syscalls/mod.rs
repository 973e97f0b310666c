use crate::ipc::{self, MAX_MESSAGE_SIZE};
use crate::scheduler::{self, Pid};

/// Syscall numbers (RAX from userland).
pub const SYS_SEND: u64 = 1;
pub const SYS_RECV: u64 = 2;
pub const SYS_YIELD: u64 = 3;
pub const SYS_EXIT: u64 = 4;

const ERR: u64 = u64::MAX;

/// Central syscall dispatcher, called from the int 0x80 entry stub.
/// Register convention: rax=number, rdi=arg0, rsi=arg1, rdx=arg2; the
/// result lands back in the user's rax. Unknown numbers return -1.
pub extern "C" fn dispatch(number: u64, arg0: u64, arg1: u64, arg2: u64) -> u64 {
    match number {
        SYS_SEND => {
            let dest = Pid(arg0 as i32);
            let ptr = arg1 as *const u8;
            let len = arg2 as usize;
            if ptr.is_null() || len > MAX_MESSAGE_SIZE {
                return ERR;
            }
            let buf = unsafe { core::slice::from_raw_parts(ptr, len) };
            ipc::send(dest, buf) as u64
        }
        SYS_RECV => {
            let ptr = arg0 as *mut u8;
            // No message exceeds MAX_MESSAGE_SIZE, so a larger buffer is
            // never written past that.
            let cap = (arg1 as usize).min(MAX_MESSAGE_SIZE);
            if ptr.is_null() {
                return ERR;
            }
            let buf = unsafe { core::slice::from_raw_parts_mut(ptr, cap) };
            ipc::recv(buf) as u64
        }
        SYS_YIELD => {
            scheduler::yield_now();
            0
        }
        SYS_EXIT => scheduler::task_exit(arg0 as i32),
        _ => {
            crate::log_warn!("syscall: unknown number {}", number);
            ERR
        }
    }
}

pub fn init() {
    crate::log_info!("Syscall dispatcher ready (send/recv/yield/exit).");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_match_the_abi() {
        assert_eq!(SYS_SEND, 1);
        assert_eq!(SYS_RECV, 2);
        assert_eq!(SYS_YIELD, 3);
        assert_eq!(SYS_EXIT, 4);
    }

    #[test]
    fn error_return_is_minus_one_in_rax() {
        assert_eq!(ERR, (-1i64) as u64);
    }
}
