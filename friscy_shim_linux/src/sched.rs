//! The cooperative user-thread scheduler.
//!
//! At most [`MAX_VTHREADS`] guest threads are multiplexed onto the single execution
//! host thread. Exactly one slot is "current": its registers live in the machine; every
//! other active slot carries its own saved copy. Switches happen only at syscalls —
//! futex wait/wake, `nanosleep`, `sched_yield`, and a quantum charged against frequent
//! time syscalls so a polling thread cannot starve runnable siblings.

use friscy::machine::{reg, Machine};
use friscy_common_linux::errno::Errno;
use friscy_common_linux::CloneFlags;

use crate::syscalls::{SysOutcome, SysResult};

/// Fixed scheduler capacity.
pub const MAX_VTHREADS: usize = 8;

/// Syscall budget per slot; exhausted by time syscalls, refilled on every switch.
const SYSCALL_QUANTUM: u32 = 50_000;

/// One virtual thread slot.
#[derive(Clone)]
pub struct VThread {
    regs: [u64; 32],
    pc: u64,
    pub tid: i32,
    pub active: bool,
    pub waiting: bool,
    /// Futex word this slot sleeps on, when `waiting`.
    futex_addr: u64,
    /// `set_tid_address` / `CLONE_CHILD_CLEARTID` pointer; zeroed-and-woken on exit.
    pub clear_child_tid: u64,
    quantum: u32,
}

impl VThread {
    fn idle() -> Self {
        Self {
            regs: [0; 32],
            pc: 0,
            tid: 0,
            active: false,
            waiting: false,
            futex_addr: 0,
            clear_child_tid: 0,
            quantum: SYSCALL_QUANTUM,
        }
    }
}

/// What a non-main thread exit resolved to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadExit {
    /// Another runnable slot took over; the machine keeps running.
    Switched,
    /// No runnable slot remains; the caller falls through to process exit.
    LastThread,
}

pub struct Scheduler {
    slots: [VThread; MAX_VTHREADS],
    current: usize,
    next_tid: i32,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let mut slots: [VThread; MAX_VTHREADS] = std::array::from_fn(|_| VThread::idle());
        slots[0].tid = 1;
        slots[0].active = true;
        Self {
            slots,
            current: 0,
            next_tid: 2,
        }
    }

    pub fn current_tid(&self) -> i32 {
        self.slots[self.current].tid
    }

    pub fn current_is_main(&self) -> bool {
        self.current == 0
    }

    pub fn live_threads(&self) -> usize {
        self.slots.iter().filter(|s| s.active).count()
    }

    pub fn set_clear_child_tid(&mut self, addr: u64) {
        self.slots[self.current].clear_child_tid = addr;
    }

    fn save_current(&mut self, m: &dyn Machine) {
        let slot = &mut self.slots[self.current];
        for r in 0..32 {
            slot.regs[r] = m.reg(r);
        }
        slot.pc = m.pc();
    }

    fn install(&mut self, m: &mut dyn Machine, idx: usize) {
        let slot = &self.slots[idx];
        for r in 1..32 {
            m.set_reg(r, slot.regs[r]);
        }
        m.set_pc(slot.pc);
        self.current = idx;
        self.slots[idx].quantum = SYSCALL_QUANTUM;
    }

    fn find_runnable_other(&self) -> Option<usize> {
        // Round-robin starting after the current slot.
        (1..=MAX_VTHREADS)
            .map(|i| (self.current + i) % MAX_VTHREADS)
            .find(|&i| i != self.current && self.slots[i].active && !self.slots[i].waiting)
    }

    /// `clone` with thread semantics: populate a new slot from the parent's state and
    /// make the child current.
    ///
    /// With every slot occupied this degrades to a stub: a TID is returned but no
    /// thread exists.
    pub fn clone_thread(
        &mut self,
        m: &mut dyn Machine,
        flags: CloneFlags,
        child_stack: u64,
        parent_tidptr: u64,
        tls: u64,
        child_tidptr: u64,
    ) -> SysOutcome {
        let tid = self.next_tid;
        self.next_tid += 1;

        let Some(free) = (0..MAX_VTHREADS).find(|&i| !self.slots[i].active) else {
            log::warn!("thread table full; clone degrades to stub tid {tid}");
            return Ok(SysResult::Value(tid as u64));
        };

        if flags.contains(CloneFlags::PARENT_SETTID) && parent_tidptr != 0 {
            m.write_i32(parent_tidptr, tid)?;
        }

        // Parent's saved copy returns the child TID from its clone.
        self.save_current(m);
        self.slots[self.current].regs[reg::A0] = tid as u64;

        let parent_regs = self.slots[self.current].regs;
        let parent_pc = self.slots[self.current].pc;
        let child = &mut self.slots[free];
        *child = VThread::idle();
        child.tid = tid;
        child.active = true;
        child.regs = parent_regs;
        child.pc = parent_pc;
        child.regs[reg::SP] = child_stack;
        child.regs[reg::A0] = 0;
        if flags.contains(CloneFlags::SETTLS) {
            child.regs[reg::TP] = tls;
        }
        if flags.contains(CloneFlags::CHILD_CLEARTID) {
            child.clear_child_tid = child_tidptr;
        }

        log::debug!("thread clone: tid {tid} in slot {free}, stack {child_stack:#x}");
        self.install(m, free);
        Ok(SysResult::NoReturn)
    }

    /// `futex(WAIT)`: park the current slot if the word still holds `expected`.
    pub fn futex_wait(&mut self, m: &mut dyn Machine, addr: u64, expected: u32) -> SysOutcome {
        let actual = m.read_u32(addr)?;
        if actual != expected {
            return Err(Errno::EAGAIN);
        }
        if let Some(next) = self.find_runnable_other() {
            // The wait returns 0 once woken.
            m.set_reg(reg::A0, 0);
            self.save_current(m);
            let slot = &mut self.slots[self.current];
            slot.waiting = true;
            slot.futex_addr = addr;
            self.install(m, next);
            Ok(SysResult::NoReturn)
        } else {
            // Nobody can wake us. Flip the word so the caller's spin loop terminates.
            m.write_u32(addr, 0)?;
            Ok(SysResult::Value(0))
        }
    }

    /// `futex(WAKE)`: make up to `max_wake` slots waiting on `addr` runnable.
    pub fn futex_wake(&mut self, addr: u64, max_wake: u32) -> u32 {
        let mut woken = 0;
        for slot in &mut self.slots {
            if woken == max_wake {
                break;
            }
            if slot.active && slot.waiting && slot.futex_addr == addr {
                slot.waiting = false;
                slot.futex_addr = 0;
                woken += 1;
            }
        }
        woken
    }

    /// Cooperation point for `nanosleep` and `sched_yield`: hand the CPU to another
    /// runnable slot, if any. The current slot stays runnable. Returns whether a switch
    /// happened; the current thread's result register must be set before calling.
    pub fn yield_now(&mut self, m: &mut dyn Machine) -> bool {
        match self.find_runnable_other() {
            Some(next) => {
                self.save_current(m);
                self.install(m, next);
                true
            }
            None => false,
        }
    }

    /// Charge the quantum for a time syscall; on exhaustion, preempt to the next
    /// runnable slot. The handler must have set its result register already.
    pub fn charge_time_syscall(&mut self, m: &mut dyn Machine) {
        let slot = &mut self.slots[self.current];
        slot.quantum = slot.quantum.saturating_sub(1);
        if slot.quantum == 0 {
            slot.quantum = SYSCALL_QUANTUM;
            self.yield_now(m);
        }
    }

    /// Exit protocol for the current (non-main) thread: clear-and-wake the
    /// `clear_child_tid` word, deactivate the slot, and switch to a runnable sibling.
    pub fn exit_thread(&mut self, m: &mut dyn Machine) -> ThreadExit {
        let ctid = self.slots[self.current].clear_child_tid;
        if ctid != 0 {
            let _ = m.write_u32(ctid, 0);
            self.futex_wake(ctid, 1);
        }
        self.slots[self.current].active = false;
        match self.find_runnable_other() {
            Some(next) => {
                self.install(m, next);
                ThreadExit::Switched
            }
            None => ThreadExit::LastThread,
        }
    }

    /// `exit_group`: every slot dies.
    pub fn exit_all(&mut self) {
        for slot in &mut self.slots {
            slot.active = false;
            slot.waiting = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use friscy::machine::mock::MockMachine;

    fn machine() -> MockMachine {
        let mut m = MockMachine::new(1 << 20);
        m.set_pc(0x1000);
        m
    }

    #[test]
    fn clone_switches_to_child_and_parent_sees_tid() {
        let mut m = machine();
        let mm: &mut dyn Machine = &mut m;
        let mut sched = Scheduler::new();
        mm.set_reg(reg::SP, 0x8000);

        let out = sched
            .clone_thread(
                mm,
                CloneFlags::THREAD | CloneFlags::VM | CloneFlags::SETTLS,
                0x9000,
                0,
                0x1234,
                0,
            )
            .unwrap();
        assert!(matches!(out, SysResult::NoReturn));

        // Property: the current TID after the clone is the new TID, and the machine
        // runs the child (a0 = 0, sp = child stack, tp = tls).
        assert_eq!(sched.current_tid(), 2);
        assert_eq!(mm.reg(reg::A0), 0);
        assert_eq!(mm.reg(reg::SP), 0x9000);
        assert_eq!(mm.reg(reg::TP), 0x1234);
        assert_eq!(sched.live_threads(), 2);

        // Yield back to the parent: it observes the child TID as its clone result.
        assert!(sched.yield_now(mm));
        assert_eq!(sched.current_tid(), 1);
        assert_eq!(mm.reg(reg::A0), 2);
        assert_eq!(mm.reg(reg::SP), 0x8000);
    }

    #[test]
    fn parent_settid_writes_guest_memory() {
        let mut m = machine();
        let mm: &mut dyn Machine = &mut m;
        let mut sched = Scheduler::new();
        sched
            .clone_thread(
                mm,
                CloneFlags::THREAD | CloneFlags::PARENT_SETTID,
                0x9000,
                0x5000,
                0,
                0,
            )
            .unwrap();
        assert_eq!(mm.read_i32(0x5000).unwrap(), 2);
    }

    #[test]
    fn futex_wait_then_wake() {
        let mut m = machine();
        let mm: &mut dyn Machine = &mut m;
        let mut sched = Scheduler::new();
        mm.write_u32(0x4000, 0).unwrap();

        // Second thread waits on the word.
        sched
            .clone_thread(mm, CloneFlags::THREAD, 0x9000, 0, 0, 0)
            .unwrap();
        assert_eq!(sched.current_tid(), 2);
        let out = sched.futex_wait(mm, 0x4000, 0).unwrap();
        assert!(matches!(out, SysResult::NoReturn));
        // The waiter yielded; the main thread is current again.
        assert_eq!(sched.current_tid(), 1);

        // A wake for a different address hits nothing.
        assert_eq!(sched.futex_wake(0x4444, 8), 0);
        // At most `max_wake` waiters transition per call.
        assert_eq!(sched.futex_wake(0x4000, 1), 1);
        assert_eq!(sched.futex_wake(0x4000, 1), 0);

        // The woken thread runs again on the next yield.
        assert!(sched.yield_now(mm));
        assert_eq!(sched.current_tid(), 2);
        assert_eq!(mm.reg(reg::A0), 0);
    }

    #[test]
    fn futex_wait_value_mismatch_is_eagain() {
        let mut m = machine();
        let mm: &mut dyn Machine = &mut m;
        let mut sched = Scheduler::new();
        mm.write_u32(0x4000, 7).unwrap();
        assert_eq!(sched.futex_wait(mm, 0x4000, 0), Err(Errno::EAGAIN));
    }

    #[test]
    fn lone_wait_breaks_the_spin_loop() {
        let mut m = machine();
        let mm: &mut dyn Machine = &mut m;
        let mut sched = Scheduler::new();
        mm.write_u32(0x4000, 1).unwrap();
        let out = sched.futex_wait(mm, 0x4000, 1).unwrap();
        assert!(matches!(out, SysResult::Value(0)));
        assert_eq!(mm.read_u32(0x4000).unwrap(), 0);
    }

    #[test]
    fn exit_clears_child_tid_and_wakes() {
        let mut m = machine();
        let mm: &mut dyn Machine = &mut m;
        let mut sched = Scheduler::new();
        mm.write_u32(0x4000, 99).unwrap();

        sched
            .clone_thread(mm, CloneFlags::THREAD | CloneFlags::CHILD_CLEARTID, 0x9000, 0, 0, 0x4000)
            .unwrap();
        // Main thread joins on the child tid word.
        sched.yield_now(mm);
        assert_eq!(sched.current_tid(), 1);
        sched.futex_wait(mm, 0x4000, 99).unwrap();
        assert_eq!(sched.current_tid(), 2);

        // Child exits: word zeroed, joiner woken and switched to.
        assert_eq!(sched.exit_thread(mm), ThreadExit::Switched);
        assert_eq!(sched.current_tid(), 1);
        assert_eq!(mm.read_u32(0x4000).unwrap(), 0);
        assert_eq!(sched.live_threads(), 1);

        // Last thread exiting has nowhere to go.
        assert_eq!(sched.exit_thread(mm), ThreadExit::LastThread);
    }

    #[test]
    fn quantum_preempts_a_polling_thread() {
        let mut m = machine();
        let mm: &mut dyn Machine = &mut m;
        let mut sched = Scheduler::new();
        sched
            .clone_thread(mm, CloneFlags::THREAD, 0x9000, 0, 0, 0)
            .unwrap();
        // The child polls the clock until its quantum runs out.
        for _ in 0..SYSCALL_QUANTUM {
            assert_eq!(sched.current_tid(), 2);
            sched.charge_time_syscall(mm);
        }
        assert_eq!(sched.current_tid(), 1);
    }
}
