//! Memory-management syscalls.
//!
//! `brk` and anonymous `mmap` forward to the machine's built-in allocators until an
//! `execve` installs its own brk region; file-backed `mmap` copies VFS content into
//! freshly opened pages. `mprotect` is deliberately inert while a fork child runs, so
//! the child's RELRO cannot leave read-only pages behind for the restored parent.

use friscy::fs::FileKind;
use friscy::machine::{Machine, PageAttributes, PAGE_MASK, PAGE_SIZE};
use friscy_common_linux::errno::Errno;
use friscy_common_linux::{MapFlags, ProtFlags};

use super::{arg, SysOutcome, SysResult};
use crate::exec::EXECVE_BRK_RESERVE;
use crate::Runtime;

fn page_align_up(value: u64) -> u64 {
    (value + PAGE_SIZE - 1) & PAGE_MASK
}

pub fn sys_brk(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let requested = arg(m, 0);
    if !rt.exec.brk_overridden {
        return Ok(SysResult::Value(m.brk(requested)));
    }

    let ctx = &mut rt.exec;
    if requested < ctx.brk_base {
        // Includes the brk(0) probe.
        return Ok(SysResult::Value(ctx.brk_current));
    }
    let accepted = requested.min(ctx.brk_base + EXECVE_BRK_RESERVE);
    if accepted > ctx.brk_current {
        m.set_page_attributes(ctx.brk_current, accepted - ctx.brk_current, PageAttributes::RW);
    }
    ctx.brk_current = accepted;
    Ok(SysResult::Value(accepted))
}

pub fn sys_mmap(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let addr = arg(m, 0);
    let len = arg(m, 1);
    let prot = ProtFlags::from_bits_retain(arg(m, 2) as u32);
    let flags = MapFlags::from_bits_retain(arg(m, 3) as u32);
    let fd = arg(m, 4) as i32;
    let offset = arg(m, 5);

    if len == 0 {
        return Err(Errno::EINVAL);
    }
    let len = page_align_up(len);

    if flags.contains(MapFlags::ANONYMOUS) || fd < 0 {
        let base = if flags.contains(MapFlags::FIXED) {
            m.mmap_advance_to(addr + len);
            addr
        } else {
            m.mmap_allocate(len)
        };
        if base + len > m.arena_size() {
            return Err(Errno::ENOMEM);
        }
        m.set_page_attributes(base, len, prot.page_attributes());
        rt.exec.mmap_frontier = m.mmap_frontier();
        return Ok(SysResult::Value(base));
    }

    // File-backed: the fd must be an open VFS regular file.
    let node = rt.vfs.node_of(fd).ok_or(Errno::EBADF)?;
    let content = {
        let node = node.read().unwrap();
        if node.kind != FileKind::Regular {
            return Err(Errno::EACCES);
        }
        node.content.clone()
    };

    let base = if addr == 0 {
        m.mmap_allocate(len)
    } else {
        // MAP_FIXED into an already-used region is fine; beyond the frontier the
        // frontier is advanced, provided the arena still fits it.
        if addr + len > m.arena_size() {
            return Err(Errno::ENOMEM);
        }
        m.mmap_advance_to(addr + len);
        addr
    };
    if base + len > m.arena_size() {
        return Err(Errno::ENOMEM);
    }

    // Open the range, discard whatever was there, then copy the file tail-zero style:
    // a mapping longer than the file reads as zeroes past EOF.
    m.set_page_attributes(base, len, PageAttributes::RW);
    m.fill_mem(base, 0, len)?;
    let start = (offset as usize).min(content.len());
    let copy_len = (content.len() - start).min(len as usize);
    if copy_len > 0 {
        m.write_mem(base, &content[start..start + copy_len])?;
    }
    m.set_page_attributes(base, len, prot.page_attributes());

    rt.exec.mmap_frontier = m.mmap_frontier();
    Ok(SysResult::Value(base))
}

pub fn sys_mprotect(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    if rt.fork.in_child {
        // The child's RELRO would narrow pages the parent restore has to write back;
        // page attributes stay frozen until the parent is back.
        return Ok(SysResult::Value(0));
    }
    let addr = arg(m, 0);
    let len = arg(m, 1);
    let prot = ProtFlags::from_bits_retain(arg(m, 2) as u32);

    // Only the mmap region past the native heap is remappable; the loaded images and
    // the heap itself keep their merged attributes stable.
    let mmap_start = rt.exec.heap_start + rt.exec.heap_size;
    if rt.exec.heap_start != 0 && addr >= mmap_start {
        m.set_page_attributes(addr, len, prot.page_attributes());
    }
    Ok(SysResult::Value(0))
}

pub fn sys_munmap(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let addr = arg(m, 0);
    let len = page_align_up(arg(m, 1));
    m.mmap_release(addr, len);
    rt.exec.mmap_frontier = m.mmap_frontier();
    Ok(SysResult::Value(0))
}
