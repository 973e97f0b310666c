//! Synchronous message passing over per-task bounded mailboxes.
//!
//! Senders never block: a full mailbox, a dead destination, or an
//! oversized payload all fail with -1. Receivers block on an empty
//! mailbox and are woken by the next send addressed to them. Delivery
//! between one sender and one receiver is FIFO.

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::interrupts;

use crate::scheduler::{self, BlockReason, Pid, TaskState, MAX_TASKS, SCHEDULER};

pub const MAX_IPC_MESSAGES: usize = 32;
pub const MAX_MESSAGE_SIZE: usize = 256;

#[derive(Clone, Copy)]
pub struct Message {
    pub sender: Pid,
    pub receiver: Pid,
    pub len: usize,
    pub data: [u8; MAX_MESSAGE_SIZE],
}

impl Message {
    const fn empty() -> Message {
        Message {
            sender: Pid::NONE,
            receiver: Pid::NONE,
            len: 0,
            data: [0; MAX_MESSAGE_SIZE],
        }
    }
}

/// Bounded FIFO of messages for one PCB slot. Head and tail wrap modulo
/// MAX_IPC_MESSAGES; `count` tracks occupancy.
pub struct Mailbox {
    messages: [Message; MAX_IPC_MESSAGES],
    head: usize,
    tail: usize,
    count: usize,
    /// Sender of the most recently popped message.
    last_sender: Pid,
}

impl Mailbox {
    pub const fn new() -> Mailbox {
        Mailbox {
            messages: [Message::empty(); MAX_IPC_MESSAGES],
            head: 0,
            tail: 0,
            count: 0,
            last_sender: Pid::NONE,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == MAX_IPC_MESSAGES
    }

    pub fn push(&mut self, msg: Message) -> bool {
        if self.is_full() {
            return false;
        }
        self.messages[self.tail] = msg;
        self.tail = (self.tail + 1) % MAX_IPC_MESSAGES;
        self.count += 1;
        true
    }

    pub fn pop(&mut self) -> Option<Message> {
        if self.count == 0 {
            return None;
        }
        let msg = self.messages[self.head];
        self.head = (self.head + 1) % MAX_IPC_MESSAGES;
        self.count -= 1;
        self.last_sender = msg.sender;
        Some(msg)
    }

    pub fn peek(&self) -> Option<&Message> {
        if self.count == 0 {
            return None;
        }
        Some(&self.messages[self.head])
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.count = 0;
        self.last_sender = Pid::NONE;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IpcStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub receivers_blocked: u64,
}

struct IpcState {
    mailboxes: [Mailbox; MAX_TASKS],
    /// Slot is parked inside recv. Set only together with the task going
    /// Blocked(ReceivingMessage), cleared by the waking sender.
    blocked_receivers: [bool; MAX_TASKS],
    stats: IpcStats,
}

impl IpcState {
    const fn new() -> IpcState {
        IpcState {
            mailboxes: [
                Mailbox::new(),
                Mailbox::new(),
                Mailbox::new(),
                Mailbox::new(),
                Mailbox::new(),
                Mailbox::new(),
                Mailbox::new(),
                Mailbox::new(),
            ],
            blocked_receivers: [false; MAX_TASKS],
            stats: IpcStats {
                messages_sent: 0,
                messages_received: 0,
                messages_dropped: 0,
                receivers_blocked: 0,
            },
        }
    }
}

lazy_static! {
    static ref IPC: Mutex<IpcState> = Mutex::new(IpcState::new());
}

pub fn init() {
    let _ = IPC.lock();
    crate::log_info!(
        "IPC ready: {} mailboxes of {} messages, {} bytes max.",
        MAX_TASKS,
        MAX_IPC_MESSAGES,
        MAX_MESSAGE_SIZE
    );
}

/// Deliver `buf` to the task with `dest_pid`. Returns the byte count, or
/// -1 for an oversized payload, an unknown/dead destination, or a full
/// mailbox. Never blocks; wakes the destination if it sits in recv.
pub fn send(dest_pid: Pid, buf: &[u8]) -> i64 {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let Some(sender) = sched.current_pid() else {
            return -1;
        };
        if buf.len() > MAX_MESSAGE_SIZE {
            crate::log_warn!(
                "send: {} byte payload exceeds the {} byte limit.",
                buf.len(),
                MAX_MESSAGE_SIZE
            );
            IPC.lock().stats.messages_dropped += 1;
            return -1;
        }
        let Some(dest_slot) = sched.lookup_pid(dest_pid) else {
            return -1;
        };

        let mut ipc = IPC.lock();
        let mut msg = Message::empty();
        msg.sender = sender;
        msg.receiver = dest_pid;
        msg.len = buf.len();
        msg.data[..buf.len()].copy_from_slice(buf);
        if !ipc.mailboxes[dest_slot].push(msg) {
            ipc.stats.messages_dropped += 1;
            return -1;
        }
        ipc.stats.messages_sent += 1;

        if ipc.blocked_receivers[dest_slot] {
            ipc.blocked_receivers[dest_slot] = false;
            drop(ipc);
            sched.unblock(dest_slot);
        }
        buf.len() as i64
    })
}

/// Take the head message of the calling task's mailbox into `buf`,
/// returning the copied byte count (capped at the buffer size). An empty
/// mailbox blocks the caller until a sender delivers; only a task-less
/// call fails with -1.
pub fn recv(buf: &mut [u8]) -> i64 {
    loop {
        let outcome = interrupts::without_interrupts(|| {
            let sched = SCHEDULER.lock();
            let Some(cur) = sched.current_slot() else {
                return Some(-1);
            };
            let mut ipc = IPC.lock();
            if let Some(msg) = ipc.mailboxes[cur].pop() {
                let n = buf.len().min(msg.len);
                buf[..n].copy_from_slice(&msg.data[..n]);
                ipc.stats.messages_received += 1;
                return Some(n as i64);
            }
            ipc.blocked_receivers[cur] = true;
            ipc.stats.receivers_blocked += 1;
            drop(ipc);
            drop(sched);
            scheduler::block_current(BlockReason::ReceivingMessage);
            // Woken by a sender; retry the pop from the top.
            None
        });
        if let Some(n) = outcome {
            return n;
        }
    }
}

/// Size of the calling task's head message, or -1 with none pending.
pub fn peek_size() -> i64 {
    interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        let Some(cur) = sched.current_slot() else {
            return -1;
        };
        let ipc = IPC.lock();
        match ipc.mailboxes[cur].peek() {
            Some(msg) => msg.len as i64,
            None => -1,
        }
    })
}

/// PID of the sender of the message most recently received by the
/// calling task, or -1 before any receive.
pub fn last_sender() -> i64 {
    interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        let Some(cur) = sched.current_slot() else {
            return -1;
        };
        let ipc = IPC.lock();
        match ipc.mailboxes[cur].last_sender {
            Pid::NONE => -1,
            Pid(pid) => pid as i64,
        }
    })
}

/// Send `buf` to every live task except the caller. Returns how many
/// deliveries succeeded; full mailboxes are skipped, not retried.
pub fn broadcast(buf: &[u8]) -> i64 {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let Some(sender) = sched.current_pid() else {
            return -1;
        };
        if buf.len() > MAX_MESSAGE_SIZE {
            return -1;
        }

        let mut delivered = 0i64;
        for slot in 0..MAX_TASKS {
            let pcb = sched.task(slot);
            if pcb.state == TaskState::Zombie || pcb.pid == sender {
                continue;
            }
            let dest_pid = pcb.pid;

            let mut ipc = IPC.lock();
            let mut msg = Message::empty();
            msg.sender = sender;
            msg.receiver = dest_pid;
            msg.len = buf.len();
            msg.data[..buf.len()].copy_from_slice(buf);
            if !ipc.mailboxes[slot].push(msg) {
                ipc.stats.messages_dropped += 1;
                continue;
            }
            ipc.stats.messages_sent += 1;
            delivered += 1;

            if ipc.blocked_receivers[slot] {
                ipc.blocked_receivers[slot] = false;
                drop(ipc);
                sched.unblock(slot);
            }
        }
        delivered
    })
}

/// Pending message count for a live task, by PID.
pub fn pending_messages(pid: Pid) -> Option<usize> {
    interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        let slot = sched.lookup_pid(pid)?;
        Some(IPC.lock().mailboxes[slot].len())
    })
}

pub fn has_pending_messages(pid: Pid) -> bool {
    pending_messages(pid).unwrap_or(0) > 0
}

/// Reset one slot's mailbox and wakeup record. Called when a PCB slot is
/// recycled so the new owner starts clean.
pub fn reset_slot(slot: usize) {
    interrupts::without_interrupts(|| {
        let mut ipc = IPC.lock();
        ipc.mailboxes[slot].clear();
        ipc.blocked_receivers[slot] = false;
    });
}

pub fn stats() -> IpcStats {
    IPC.lock().stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_from(sender: i32, payload: &[u8]) -> Message {
        let mut msg = Message::empty();
        msg.sender = Pid(sender);
        msg.receiver = Pid(99);
        msg.len = payload.len();
        msg.data[..payload.len()].copy_from_slice(payload);
        msg
    }

    #[test]
    fn mailbox_delivers_fifo() {
        let mut mbox = Mailbox::new();
        assert!(mbox.push(message_from(1, b"first")));
        assert!(mbox.push(message_from(1, b"second")));
        assert_eq!(&mbox.pop().unwrap().data[..5], b"first");
        assert_eq!(&mbox.pop().unwrap().data[..6], b"second");
        assert!(mbox.pop().is_none());
    }

    // Scenario: 32 one-byte messages fill the box, the 33rd bounces, and
    // one pop makes room again.
    #[test]
    fn mailbox_bounds_at_32_messages() {
        let mut mbox = Mailbox::new();
        for i in 0..MAX_IPC_MESSAGES {
            assert!(mbox.push(message_from(1, &[i as u8])), "message {} fits", i);
        }
        assert_eq!(mbox.len(), MAX_IPC_MESSAGES);
        assert!(!mbox.push(message_from(1, b"x")), "33rd message bounces");

        assert_eq!(mbox.pop().unwrap().data[0], 0);
        assert!(mbox.push(message_from(1, b"x")), "pop frees one slot");
        assert_eq!(mbox.len(), MAX_IPC_MESSAGES);
    }

    #[test]
    fn mailbox_indices_wrap() {
        let mut mbox = Mailbox::new();
        // Cycle more messages than the capacity through the ring.
        for round in 0..3 {
            for i in 0..MAX_IPC_MESSAGES {
                assert!(mbox.push(message_from(1, &[(round * 7 + i) as u8])));
            }
            for i in 0..MAX_IPC_MESSAGES {
                assert_eq!(mbox.pop().unwrap().data[0], (round * 7 + i) as u8);
            }
        }
        assert!(mbox.is_empty());
    }

    #[test]
    fn pop_records_last_sender() {
        let mut mbox = Mailbox::new();
        assert_eq!(mbox.last_sender, Pid::NONE);
        mbox.push(message_from(5, b"ping"));
        mbox.push(message_from(7, b"pong"));
        mbox.pop();
        assert_eq!(mbox.last_sender, Pid(5));
        mbox.pop();
        assert_eq!(mbox.last_sender, Pid(7));
    }

    #[test]
    fn peek_leaves_the_head_in_place() {
        let mut mbox = Mailbox::new();
        mbox.push(message_from(1, b"abc"));
        assert_eq!(mbox.peek().unwrap().len, 3);
        assert_eq!(mbox.len(), 1);
        assert_eq!(mbox.pop().unwrap().len, 3);
    }

    #[test]
    fn clear_resets_everything() {
        let mut mbox = Mailbox::new();
        mbox.push(message_from(1, b"abc"));
        mbox.pop();
        mbox.push(message_from(2, b"def"));
        mbox.clear();
        assert!(mbox.is_empty());
        assert_eq!(mbox.last_sender, Pid::NONE);
        assert!(mbox.peek().is_none());
    }

    // Round-trip law: a payload pushed and popped comes back verbatim
    // with the sender preserved.
    #[test]
    fn round_trip_preserves_payload_and_sender() {
        let mut mbox = Mailbox::new();
        let payload = b"ABC";
        mbox.push(message_from(3, payload));
        let msg = mbox.pop().unwrap();
        assert_eq!(msg.len, 3);
        assert_eq!(&msg.data[..3], payload);
        assert_eq!(mbox.last_sender, Pid(3));
    }
}
