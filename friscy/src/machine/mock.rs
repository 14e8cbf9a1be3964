// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A software [`Machine`](super::Machine) backed by a flat in-memory arena.
//!
//! Used throughout the workspace's tests. It does not execute instructions; `run` drains
//! a script of pre-programmed stop reasons so the execution loop, the rewind-and-stop
//! protocol and the syscall handlers can be exercised without a real interpreter.

use std::collections::VecDeque;

use hashbrown::HashMap;

use super::{MachineError, Machine, PageAttributes, StopReason, StopRequester, PAGE_MASK, PAGE_SIZE};

/// Flat-arena mock machine.
pub struct MockMachine {
    regs: [u64; 32],
    pc: u64,
    arena: Vec<u8>,
    /// Pages with explicit attributes. Untouched pages default to read+write so that
    /// plain data traffic succeeds; tests narrow attributes to provoke faults.
    pages: HashMap<u64, PageAttributes>,
    brk_current: u64,
    brk_limit: u64,
    mmap_next: u64,
    stop: StopRequester,
    instructions: u64,
    script: VecDeque<Result<StopReason, MachineError>>,
}

impl MockMachine {
    /// Create a machine with an arena of `arena_size` bytes (must be a power of two).
    ///
    /// The mmap bump allocator starts at half the arena; `brk` is limited to the first
    /// quarter, mirroring the layout the embedding interpreter sets up.
    pub fn new(arena_size: u64) -> Self {
        assert!(arena_size.is_power_of_two(), "arena size must be a power of two");
        Self {
            regs: [0; 32],
            pc: 0,
            arena: vec![0; arena_size as usize],
            pages: HashMap::new(),
            brk_current: 0,
            brk_limit: arena_size / 4,
            mmap_next: arena_size / 2,
            stop: StopRequester::new(),
            instructions: 0,
            script: VecDeque::new(),
        }
    }

    /// Queue the result of a future `run` call. With an empty script, `run` reports
    /// [`StopReason::Stopped`].
    pub fn push_run_result(&mut self, reason: StopReason) {
        self.script.push_back(Ok(reason));
    }

    /// Queue a page-fault outcome for a future `run` call, for exercising the
    /// execution loop's repair path.
    pub fn push_run_fault(&mut self, addr: u64) {
        self.script.push_back(Err(MachineError::PageFault { addr }));
    }

    fn index(&self, addr: u64) -> usize {
        (addr & (self.arena.len() as u64 - 1)) as usize
    }

    fn check_access(&self, addr: u64, len: u64, write: bool) -> Result<(), MachineError> {
        if len == 0 {
            return Ok(());
        }
        if self.index(addr) as u64 + len > self.arena.len() as u64 {
            return Err(MachineError::OutOfRange { addr });
        }
        let mut page = addr & PAGE_MASK;
        let end = addr + len;
        while page < end {
            let attr = self.page_attributes(page);
            let denied = if write { !attr.write } else { !attr.read };
            if denied {
                return Err(MachineError::PageFault {
                    addr: page.max(addr),
                });
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }
}

impl Machine for MockMachine {
    fn reg(&self, r: usize) -> u64 {
        if r == 0 { 0 } else { self.regs[r] }
    }

    fn set_reg(&mut self, r: usize, value: u64) {
        if r != 0 {
            self.regs[r] = value;
        }
    }

    fn pc(&self) -> u64 {
        self.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    fn read_mem(&self, addr: u64, buf: &mut [u8]) -> Result<(), MachineError> {
        self.check_access(addr, buf.len() as u64, false)?;
        let idx = self.index(addr);
        buf.copy_from_slice(&self.arena[idx..idx + buf.len()]);
        Ok(())
    }

    fn write_mem(&mut self, addr: u64, buf: &[u8]) -> Result<(), MachineError> {
        self.check_access(addr, buf.len() as u64, true)?;
        let idx = self.index(addr);
        self.arena[idx..idx + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn fill_mem(&mut self, addr: u64, value: u8, len: u64) -> Result<(), MachineError> {
        self.check_access(addr, len, true)?;
        let idx = self.index(addr);
        self.arena[idx..idx + len as usize].fill(value);
        Ok(())
    }

    fn page_attributes(&self, addr: u64) -> PageAttributes {
        self.pages
            .get(&(addr & PAGE_MASK))
            .copied()
            .unwrap_or(PageAttributes::RW)
    }

    fn set_page_attributes(&mut self, addr: u64, len: u64, attr: PageAttributes) {
        let mut page = addr & PAGE_MASK;
        let end = addr + len.max(1);
        while page < end {
            self.pages.insert(page, attr);
            page += PAGE_SIZE;
        }
    }

    fn arena(&self) -> Option<&[u8]> {
        Some(&self.arena)
    }

    fn arena_mut(&mut self) -> Option<&mut [u8]> {
        Some(&mut self.arena)
    }

    fn arena_size(&self) -> u64 {
        self.arena.len() as u64
    }

    fn brk(&mut self, addr: u64) -> u64 {
        if addr >= self.brk_current && addr <= self.brk_limit {
            self.brk_current = addr;
        }
        self.brk_current
    }

    fn mmap_allocate(&mut self, len: u64) -> u64 {
        let base = self.mmap_next;
        self.mmap_next += (len + PAGE_SIZE - 1) & PAGE_MASK;
        base
    }

    fn mmap_frontier(&self) -> u64 {
        self.mmap_next
    }

    fn mmap_advance_to(&mut self, addr: u64) {
        if addr > self.mmap_next {
            self.mmap_next = (addr + PAGE_SIZE - 1) & PAGE_MASK;
        }
    }

    fn mmap_release(&mut self, addr: u64, len: u64) {
        if addr + len == self.mmap_next {
            self.mmap_next = addr;
        }
    }

    fn run(&mut self, _max_instructions: u64) -> Result<StopReason, MachineError> {
        if self.stop.is_requested() {
            self.stop.clear();
            return Ok(StopReason::Stopped);
        }
        self.instructions += 1;
        match self.script.pop_front() {
            Some(outcome) => outcome,
            None => Ok(StopReason::Stopped),
        }
    }

    fn stop(&mut self) {
        self.stop.request();
    }

    fn stop_requested(&self) -> bool {
        self.stop.is_requested()
    }

    fn clear_stop(&mut self) {
        self.stop.clear();
    }

    fn stop_requester(&self) -> StopRequester {
        self.stop.clone()
    }

    fn instruction_counter(&self) -> u64 {
        self.instructions
    }

    fn reset_instruction_counter(&mut self) {
        self.instructions = 0;
    }

    fn register_file_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(33 * 8);
        for r in self.regs {
            out.extend_from_slice(&r.to_le_bytes());
        }
        out.extend_from_slice(&self.pc.to_le_bytes());
        out
    }

    fn restore_register_file(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() != 33 * 8 {
            return false;
        }
        for (i, chunk) in bytes.chunks_exact(8).enumerate() {
            let v = u64::from_le_bytes(chunk.try_into().unwrap());
            if i < 32 {
                self.regs[i] = v;
            } else {
                self.pc = v;
            }
        }
        self.regs[0] = 0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_faults_on_readonly_page() {
        let mut m = MockMachine::new(1 << 20);
        m.set_page_attributes(
            0x2000,
            PAGE_SIZE,
            PageAttributes {
                read: true,
                write: false,
                exec: false,
            },
        );
        let err = m.write_mem(0x2004, &[1, 2, 3]).unwrap_err();
        assert_eq!(err, MachineError::PageFault { addr: 0x2004 });
        // Promote and retry, like the loader's fault-retry loop does.
        m.set_page_attributes(0x2000, PAGE_SIZE, PageAttributes::RWX);
        m.write_mem(0x2004, &[1, 2, 3]).unwrap();
        let mut back = [0u8; 3];
        m.read_mem(0x2004, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3]);
    }

    #[test]
    fn register_file_round_trips() {
        let mut m = MockMachine::new(1 << 16);
        m.set_reg(2, 0xdead);
        m.set_pc(0x1000);
        let bytes = m.register_file_bytes();
        let mut other = MockMachine::new(1 << 16);
        assert!(other.restore_register_file(&bytes));
        assert_eq!(other.reg(2), 0xdead);
        assert_eq!(other.pc(), 0x1000);
    }

    #[test]
    fn stop_requester_interrupts_run() {
        let mut m = MockMachine::new(1 << 16);
        m.push_run_result(StopReason::Ecall);
        let req = m.stop_requester();
        req.request();
        assert_eq!(m.run(u64::MAX).unwrap(), StopReason::Stopped);
        // The pending script entry is still there for the next run.
        assert_eq!(m.run(u64::MAX).unwrap(), StopReason::Ecall);
    }
}
