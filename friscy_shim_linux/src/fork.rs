//! Cooperative single-process fork.
//!
//! `clone` in its fork form saves the parent's registers and the four writable memory
//! regions, then lets the "child" run in place. When the child exits, the parent's
//! snapshot is restored byte-for-byte, any fds the child opened are closed, and the
//! parent resumes just past the `clone` ecall seeing the child PID. `wait4` then reaps
//! the recorded exit status; it never blocks, because the child has always already run
//! to completion.

use std::collections::BTreeSet;

use friscy::machine::{reg, Machine, MachineError, PageAttributes, PAGE_MASK, PAGE_SIZE};
use friscy_common_linux::errno::Errno;
use friscy_common_linux::wait_status_from_exit_code;

use crate::syscalls::{SysOutcome, SysResult};
use crate::Runtime;

/// One saved writable region.
#[derive(Default)]
pub struct MemRegion {
    pub addr: u64,
    pub data: Vec<u8>,
}

impl MemRegion {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Snapshot of the parent at `clone` time.
#[derive(Default)]
pub struct ForkState {
    pub in_child: bool,
    pub child_reaped: bool,
    pub child_pid: i32,
    pub exit_status: i32,
    regs: [u64; 32],
    pc: u64,
    /// Main binary data/BSS plus the brk heap.
    exec_data: MemRegion,
    /// Interpreter data/BSS (the dynamic linker's state).
    interp_data: MemRegion,
    /// The live stack, from the parent's SP up to the original stack top.
    stack_data: MemRegion,
    /// Guest mmap allocations (TLS and the libc heap; musl mallocs via mmap, not brk).
    mmap_data: MemRegion,
    /// VFS fds open at fork time; anything else is closed on child exit to undo the
    /// child's redirections.
    parent_open_fds: BTreeSet<i32>,
}

/// Read guest memory with page-fault repair. The brk tail of the exec region may carry
/// no read permission yet; promoting and retrying mirrors the save discipline the
/// execution loop applies to the whole handler.
fn read_with_retry(m: &mut dyn Machine, addr: u64, len: u64) -> Result<Vec<u8>, MachineError> {
    let mut data = vec![0u8; len as usize];
    let mut offset = 0u64;
    while offset < len {
        match m.read_mem(addr + offset, &mut data[offset as usize..]) {
            Ok(()) => break,
            Err(MachineError::PageFault { addr: fault }) if fault >= addr + offset => {
                m.set_page_attributes(fault & PAGE_MASK, PAGE_SIZE, PageAttributes::RWX);
                offset = (fault & PAGE_MASK).saturating_sub(addr).max(offset);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(data)
}

/// The save phase: runs in the `clone` handler when the flags mean fork.
pub fn clone_fork(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    if rt.fork.in_child {
        // Nested fork is not supported in this model.
        return Err(Errno::EAGAIN);
    }

    let fork = &mut rt.fork;
    for r in 0..32 {
        fork.regs[r] = m.reg(r);
    }
    fork.pc = m.pc(); // already past the ecall
    fork.child_pid = rt.next_pid;
    rt.next_pid += 1;
    fork.exit_status = 0;

    let ctx = &rt.exec;

    // Region 1: main binary writable segments plus the brk heap. The brk tail may not
    // be readable yet, so the range is promoted before copying.
    {
        let start = ctx.exec_rw_start;
        let end = ctx.exec_rw_end.max(ctx.heap_start);
        if start > 0 && end > start {
            m.set_page_attributes(start, end - start, PageAttributes::RWX);
            fork.exec_data = MemRegion {
                addr: start,
                data: read_with_retry(m, start, end - start)?,
            };
        }
    }

    // Region 2: interpreter writable segments.
    if ctx.interp_rw_start > 0 && ctx.interp_rw_end > ctx.interp_rw_start {
        fork.interp_data = MemRegion {
            addr: ctx.interp_rw_start,
            data: read_with_retry(m, ctx.interp_rw_start, ctx.interp_rw_end - ctx.interp_rw_start)?,
        };
    }

    // Region 3: the live stack.
    {
        let sp = m.reg(reg::SP);
        let top = ctx.original_stack_top;
        if top > sp {
            fork.stack_data = MemRegion {
                addr: sp,
                data: read_with_retry(m, sp, top - sp)?,
            };
        }
    }

    // Region 4: guest mmap allocations past the native heap, up to the frontier.
    if ctx.heap_start > 0 && ctx.heap_size > 0 {
        let start = ctx.heap_start + ctx.heap_size;
        let frontier = m.mmap_frontier();
        if frontier > start {
            fork.mmap_data = MemRegion {
                addr: start,
                data: read_with_retry(m, start, frontier - start)?,
            };
        }
    }

    fork.parent_open_fds = rt.vfs.open_fds();

    // Only now does the child officially exist: a failed copy above re-enters this
    // handler through the fault-repair retry with `in_child` still false, so the save
    // restarts cleanly.
    fork.in_child = true;
    fork.child_reaped = false;

    log::debug!(
        "fork: child pid {} (regions {}/{}/{}/{} bytes)",
        fork.child_pid,
        fork.exec_data.len(),
        fork.interp_data.len(),
        fork.stack_data.len(),
        fork.mmap_data.len()
    );

    // The guest sees 0: it is the child.
    Ok(SysResult::Value(0))
}

/// The restore phase: runs when the child exits.
pub fn restore_parent(rt: &mut Runtime, m: &mut dyn Machine, exit_status: i32) {
    let fork = &mut rt.fork;
    fork.exit_status = exit_status & 0xff;
    fork.in_child = false;

    // Permissions come back before bytes. The child's RELRO may have made these pages
    // read-only; writing first would raise a protection fault that leaves the restore
    // half-applied and poisons the decoder cache.
    let regions = [
        (fork.exec_data.addr, fork.exec_data.len()),
        (fork.interp_data.addr, fork.interp_data.len()),
        (fork.stack_data.addr, fork.stack_data.len()),
        (fork.mmap_data.addr, fork.mmap_data.len()),
    ];
    for (addr, len) in regions {
        if addr > 0 && len > 0 {
            m.set_page_attributes(addr, len, PageAttributes::RWX);
        }
    }

    for region in [
        &mut fork.exec_data,
        &mut fork.interp_data,
        &mut fork.stack_data,
        &mut fork.mmap_data,
    ] {
        if !region.data.is_empty() {
            if let Err(e) = m.write_mem(region.addr, &region.data) {
                log::error!("fork restore failed at {:#x}: {e}", region.addr);
            }
            region.data = Vec::new();
        }
    }

    // Undo the child's fd changes: anything open now that the parent did not have is
    // closed, which reverts dup2 redirections of stdio.
    let snapshot = std::mem::take(&mut fork.parent_open_fds);
    for fd in rt.vfs.open_fds() {
        if !snapshot.contains(&fd) {
            let _ = rt.vfs.close(fd);
        }
    }

    // Registers (x0 stays hardwired), PC just past the clone ecall, and the child PID
    // as the parent's clone result.
    for r in 1..32 {
        m.set_reg(r, fork.regs[r]);
    }
    m.set_pc(fork.pc);
    m.set_reg(reg::A0, fork.child_pid as u64);

    log::debug!(
        "fork: child pid {} exited with {}, parent restored",
        fork.child_pid,
        fork.exit_status
    );
}

/// `wait4`: reap the cooperatively forked child. Never blocks.
pub fn sys_wait4(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fork = &mut rt.fork;
    if fork.child_reaped || fork.child_pid == 0 {
        return Err(Errno::ECHILD);
    }
    let wstatus_addr = m.reg(reg::A1);
    if wstatus_addr != 0 {
        m.write_i32(wstatus_addr, wait_status_from_exit_code(fork.exit_status))?;
    }
    fork.child_reaped = true;
    Ok(SysResult::Value(fork.child_pid as u64))
}
