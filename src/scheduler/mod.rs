//! Task lifecycle and round-robin scheduling over a fixed PCB table.
//!
//! Slot indices into the table are the canonical task handles; the ready
//! queue is a bounded FIFO of such indices. All entry points take the
//! scheduler lock with interrupts disabled and release it before invoking
//! the context-switch primitive.

pub mod context;
pub mod task;

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::interrupts;

pub use task::{BlockReason, Pcb, Pid, TaskName, TaskState, MAX_TASKS};

use crate::memory::USER_STACK_SIZE;

/// Bounded FIFO of PCB slot indices. Insertion order is preserved; no
/// priority sorting.
pub struct ReadyQueue {
    slots: [usize; MAX_TASKS],
    head: usize,
    tail: usize,
    count: usize,
}

impl ReadyQueue {
    pub const fn new() -> ReadyQueue {
        ReadyQueue {
            slots: [0; MAX_TASKS],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn push(&mut self, slot: usize) -> bool {
        if self.count == MAX_TASKS {
            return false;
        }
        self.slots[self.tail] = slot;
        self.tail = (self.tail + 1) % MAX_TASKS;
        self.count += 1;
        true
    }

    pub fn pop(&mut self) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        let slot = self.slots[self.head];
        self.head = (self.head + 1) % MAX_TASKS;
        self.count -= 1;
        Some(slot)
    }

    pub fn contains(&self, slot: usize) -> bool {
        (0..self.count).any(|i| self.slots[(self.head + i) % MAX_TASKS] == slot)
    }

    /// Drop one occurrence of `slot`, keeping the order of the rest.
    fn remove(&mut self, slot: usize) {
        let mut kept = [0usize; MAX_TASKS];
        let mut kept_count = 0;
        let mut dropped = false;
        while let Some(s) = self.pop() {
            if s == slot && !dropped {
                dropped = true;
                continue;
            }
            kept[kept_count] = s;
            kept_count += 1;
        }
        for &s in &kept[..kept_count] {
            self.push(s);
        }
    }
}

pub struct Scheduler {
    tasks: [Pcb; MAX_TASKS],
    ready: ReadyQueue,
    current: Option<usize>,
    next_pid: i32,
}

impl Scheduler {
    pub const fn new() -> Scheduler {
        Scheduler {
            tasks: [
                Pcb::vacant(),
                Pcb::vacant(),
                Pcb::vacant(),
                Pcb::vacant(),
                Pcb::vacant(),
                Pcb::vacant(),
                Pcb::vacant(),
                Pcb::vacant(),
            ],
            ready: ReadyQueue::new(),
            current: None,
            next_pid: 1,
        }
    }

    pub fn task(&self, slot: usize) -> &Pcb {
        &self.tasks[slot]
    }

    pub fn task_mut(&mut self, slot: usize) -> &mut Pcb {
        &mut self.tasks[slot]
    }

    pub fn current_slot(&self) -> Option<usize> {
        self.current
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current.map(|slot| self.tasks[slot].pid)
    }

    /// Linear scan for a live task with this PID. Zombie slots never
    /// match, whatever their stale pid field says.
    pub fn lookup_pid(&self, pid: Pid) -> Option<usize> {
        self.tasks
            .iter()
            .position(|t| t.pid == pid && t.state != TaskState::Zombie)
    }

    /// Claim a Zombie slot for a new task: assign a fresh PID, build the
    /// PCB image, and append to the ready queue. The register frame is
    /// installed separately (it writes task memory).
    pub fn admit(&mut self, name: &str, entry_point: u64, priority: i32, cr3: u64) -> Option<usize> {
        let slot = self
            .tasks
            .iter()
            .position(|t| t.state == TaskState::Zombie)?;
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        self.tasks[slot] = Pcb {
            rsp: 0,
            rip: entry_point,
            rflags: context::INITIAL_RFLAGS,
            cr3,
            state: TaskState::Ready,
            pid,
            priority,
            stack_base: entry_point - USER_STACK_SIZE,
            stack_size: USER_STACK_SIZE,
            name: TaskName::new(name),
        };
        self.ready.push(slot);
        Some(slot)
    }

    fn take_next(&mut self) -> Option<usize> {
        self.ready.pop()
    }

    /// Current task goes Running -> Ready at the queue tail.
    fn requeue_current(&mut self, slot: usize) {
        self.tasks[slot].state = TaskState::Ready;
        self.ready.push(slot);
    }

    fn set_running(&mut self, slot: usize) {
        self.tasks[slot].state = TaskState::Running;
        self.current = Some(slot);
    }

    /// Blocked -> Ready at the queue tail; anything else is a no-op.
    pub fn unblock(&mut self, slot: usize) {
        if let TaskState::Blocked(_) = self.tasks[slot].state {
            self.tasks[slot].state = TaskState::Ready;
            self.ready.push(slot);
        }
    }
}

lazy_static! {
    pub static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

pub fn init() {
    let _ = SCHEDULER.lock();
    crate::log_info!("Scheduler ready: {} task slots, round-robin.", MAX_TASKS);
}

/// Create a task that resumes at `entry_point` on first dispatch. The
/// loader must have placed the task's code there already; its stack is
/// the USER_STACK_SIZE region ending at the entry point. Returns None
/// when all slots are live.
pub fn create_task(name: &str, entry_point: u64, priority: i32) -> Option<Pid> {
    interrupts::without_interrupts(|| {
        let cr3 = current_cr3();
        let mut sched = SCHEDULER.lock();
        let slot = sched.admit(name, entry_point, priority, cr3)?;
        let pcb = sched.task_mut(slot);
        let stack_top = pcb.stack_base + pcb.stack_size;
        pcb.rsp = unsafe { context::prepare_stack(stack_top, entry_point) };
        let pid = pcb.pid;
        drop(sched);
        // A recycled slot must not leak the previous owner's messages.
        crate::ipc::reset_slot(slot);
        crate::log_info!("Created task '{}' pid {} at {:#x}.", name, pid.0, entry_point);
        Some(pid)
    })
}

/// Cooperative round-robin step. With no running task, dispatches the
/// ready-queue head (this is how the boot path enters the run loop). With
/// one, rotates: head runs, current goes to the tail. No other ready task
/// means the caller just keeps the CPU.
pub fn schedule() {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        match sched.current_slot() {
            None => {
                let Some(next) = sched.take_next() else {
                    return;
                };
                sched.set_running(next);
                let next_rsp = &sched.tasks[next].rsp as *const u64;
                drop(sched);
                unsafe { context::resume_stack(next_rsp) }
            }
            Some(cur) => {
                let Some(next) = sched.take_next() else {
                    return;
                };
                sched.requeue_current(cur);
                sched.set_running(next);
                let prev_rsp = &mut sched.tasks[cur].rsp as *mut u64;
                let next_rsp = &sched.tasks[next].rsp as *const u64;
                drop(sched);
                unsafe { context::switch_stacks(prev_rsp, next_rsp) }
            }
        }
    });
}

/// Give up the CPU: current goes to the ready-queue tail, the head runs.
/// A task alone in the system switches to itself, which is a no-op.
pub fn yield_now() {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let Some(cur) = sched.current_slot() else {
            return;
        };
        sched.requeue_current(cur);
        let Some(next) = sched.take_next() else {
            return;
        };
        sched.set_running(next);
        let prev_rsp = &mut sched.tasks[cur].rsp as *mut u64;
        let next_rsp = &sched.tasks[next].rsp as *const u64;
        drop(sched);
        unsafe { context::switch_stacks(prev_rsp, next_rsp) }
    });
}

/// Timer-driven preemption, entered from the tick ISR with interrupts
/// already masked by the gate. Uses try_lock: a tick that lands while
/// kernel code holds the scheduler lock skips this quantum instead of
/// deadlocking.
pub fn preempt_on_tick() {
    let Some(mut sched) = SCHEDULER.try_lock() else {
        return;
    };
    match sched.current_slot() {
        Some(cur) => {
            // A Blocked current task is parked inside block_current's
            // halt loop; leave it alone.
            if sched.tasks[cur].state != TaskState::Running {
                return;
            }
            sched.requeue_current(cur);
            let Some(next) = sched.take_next() else {
                return;
            };
            sched.set_running(next);
            let prev_rsp = &mut sched.tasks[cur].rsp as *mut u64;
            let next_rsp = &sched.tasks[next].rsp as *const u64;
            drop(sched);
            unsafe { context::switch_stacks(prev_rsp, next_rsp) }
        }
        None => {
            // The CPU was parked (exit with an empty queue). Dispatch
            // whatever became ready; the parked context is abandoned.
            let Some(next) = sched.take_next() else {
                return;
            };
            sched.set_running(next);
            let next_rsp = &sched.tasks[next].rsp as *const u64;
            drop(sched);
            unsafe { context::resume_stack(next_rsp) }
        }
    }
}

/// Terminate the current task. Its slot becomes reusable immediately.
/// With an empty ready queue the CPU parks in a halt loop, interrupts
/// enabled, so a tick can dispatch tasks created later.
pub fn task_exit(exit_code: i32) -> ! {
    interrupts::disable();
    let mut sched = SCHEDULER.lock();
    let Some(cur) = sched.current.take() else {
        panic!("task_exit with no running task");
    };
    sched.tasks[cur].state = TaskState::Zombie;
    crate::log_info!(
        "Task '{}' pid {} exited with code {}.",
        sched.tasks[cur].name.as_str(),
        sched.tasks[cur].pid.0,
        exit_code
    );
    if let Some(next) = sched.take_next() {
        sched.set_running(next);
        let next_rsp = &sched.tasks[next].rsp as *const u64;
        drop(sched);
        unsafe { context::resume_stack(next_rsp) }
    }
    drop(sched);
    crate::log_info!("No runnable tasks; parking CPU.");
    park()
}

/// Block the current task (it stays off the ready queue) and run someone
/// else. Returns when the task is unblocked and dispatched again. With
/// nothing else runnable the CPU parks in place, interrupts enabled,
/// until an interrupt-context wakeup readies this task again.
pub fn block_current(reason: BlockReason) {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let Some(cur) = sched.current_slot() else {
            return;
        };
        sched.tasks[cur].state = TaskState::Blocked(reason);
        if let Some(next) = sched.take_next() {
            sched.set_running(next);
            let prev_rsp = &mut sched.tasks[cur].rsp as *mut u64;
            let next_rsp = &sched.tasks[next].rsp as *const u64;
            drop(sched);
            unsafe { context::switch_stacks(prev_rsp, next_rsp) }
        } else {
            drop(sched);
            loop {
                interrupts::enable_and_hlt();
                interrupts::disable();
                let mut sched = SCHEDULER.lock();
                if sched.tasks[cur].state == TaskState::Ready {
                    // We never switched away, so reclaim the CPU directly
                    // instead of going through a dispatch.
                    sched.ready.remove(cur);
                    sched.tasks[cur].state = TaskState::Running;
                    return;
                }
            }
        }
    });
}

/// PID of the task invoking us, if any.
pub fn current_pid() -> Option<Pid> {
    SCHEDULER.lock().current_pid()
}

fn current_cr3() -> u64 {
    use x86_64::registers::control::Cr3;
    let (frame, _) = Cr3::read();
    frame.start_address().as_u64()
}

fn park() -> ! {
    loop {
        interrupts::enable_and_hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CR3: u64 = 0x1000;
    const ENTRY: u64 = 0x400000;

    fn sched_with(names: &[&str]) -> Scheduler {
        let mut sched = Scheduler::new();
        for (i, name) in names.iter().enumerate() {
            sched
                .admit(name, ENTRY + i as u64 * 0x10000, 1, CR3)
                .unwrap();
        }
        sched
    }

    #[test]
    fn ready_queue_is_fifo_and_wraps() {
        let mut q = ReadyQueue::new();
        for slot in 0..MAX_TASKS {
            assert!(q.push(slot));
        }
        assert!(!q.push(0), "queue holds at most MAX_TASKS entries");
        assert_eq!(q.pop(), Some(0));
        assert!(q.push(0), "slot freed by pop is reusable");
        for slot in 1..MAX_TASKS {
            assert_eq!(q.pop(), Some(slot));
        }
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn ready_queue_remove_preserves_order() {
        let mut q = ReadyQueue::new();
        q.push(3);
        q.push(1);
        q.push(5);
        q.remove(1);
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(5));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn admit_assigns_monotonic_pids() {
        let sched = sched_with(&["a", "b", "c"]);
        assert_eq!(sched.task(0).pid, Pid(1));
        assert_eq!(sched.task(1).pid, Pid(2));
        assert_eq!(sched.task(2).pid, Pid(3));
        assert_eq!(sched.ready.len(), 3);
    }

    #[test]
    fn admit_fails_when_table_full_until_a_slot_exits() {
        let mut sched = sched_with(&["a", "b", "c", "d", "e", "f", "g", "h"]);
        assert!(sched.admit("overflow", ENTRY, 1, CR3).is_none());

        sched.tasks[4].state = TaskState::Zombie;
        let slot = sched.admit("reuse", ENTRY, 1, CR3).unwrap();
        assert_eq!(slot, 4);
        assert_eq!(sched.task(slot).pid, Pid(9), "reused slot gets a fresh pid");
    }

    #[test]
    fn admit_fixes_stack_at_top_of_own_region() {
        let sched = sched_with(&["a"]);
        let pcb = sched.task(0);
        assert_eq!(pcb.stack_base, ENTRY - USER_STACK_SIZE);
        assert_eq!(pcb.stack_base + pcb.stack_size, ENTRY);
        assert_eq!(pcb.rflags, context::INITIAL_RFLAGS);
    }

    #[test]
    fn lookup_skips_zombies() {
        let mut sched = sched_with(&["a", "b"]);
        assert_eq!(sched.lookup_pid(Pid(2)), Some(1));
        sched.tasks[1].state = TaskState::Zombie;
        assert_eq!(sched.lookup_pid(Pid(2)), None);
        assert_eq!(sched.lookup_pid(Pid(1)), Some(0));
    }

    // Scenario: three tasks each yielding once dispatch in creation order
    // and then wrap around.
    #[test]
    fn round_robin_dispatch_order() {
        let mut sched = sched_with(&["t1", "t2", "t3"]);

        // Boot path: no current task, head of the queue runs.
        let first = sched.take_next().unwrap();
        sched.set_running(first);
        assert_eq!(sched.task(first).name.as_str(), "t1");

        let mut order = [first; 4];
        for step in 1..4 {
            let cur = sched.current_slot().unwrap();
            sched.requeue_current(cur);
            let next = sched.take_next().unwrap();
            sched.set_running(next);
            order[step] = next;
        }
        let names: [&str; 4] = order.map(|s| sched.task(s).name.as_str());
        assert_eq!(names, ["t1", "t2", "t3", "t1"]);
    }

    #[test]
    fn unblock_is_idempotent_on_ready_tasks() {
        let mut sched = sched_with(&["a"]);
        assert_eq!(sched.ready.len(), 1);
        sched.unblock(0);
        assert_eq!(sched.ready.len(), 1, "unblocking a Ready task is a no-op");

        sched.ready.pop();
        sched.tasks[0].state = TaskState::Blocked(BlockReason::ReceivingMessage);
        sched.unblock(0);
        assert_eq!(sched.tasks[0].state, TaskState::Ready);
        assert!(sched.ready.contains(0));
        sched.unblock(0);
        assert_eq!(sched.ready.len(), 1, "second unblock does not enqueue twice");
    }

    #[test]
    fn blocked_tasks_are_not_in_the_ready_queue() {
        let mut sched = sched_with(&["a", "b"]);
        let cur = sched.take_next().unwrap();
        sched.set_running(cur);
        sched.tasks[cur].state = TaskState::Blocked(BlockReason::ReceivingMessage);
        sched.current = None;
        assert!(!sched.ready.contains(cur));
        // Only one Running task ever; here none, and "b" is next.
        let next = sched.take_next().unwrap();
        assert_eq!(sched.task(next).name.as_str(), "b");
    }
}
