//! The process-wide exec context and `execve`.
//!
//! The context records where the live binary and its interpreter landed, the brk and
//! mmap bookkeeping, and the byte images needed to reload on `execve`. `execve` itself
//! has three shapes: a busybox-applet fast path that only rebuilds the stack, a
//! full reload of a different ELF into the same arena, and shebang-script rewriting in
//! front of either.

use friscy::machine::{reg, Machine, PageAttributes, PAGE_MASK, PAGE_SIZE};
use friscy_common_linux::errno::Errno;

use crate::loader::elf::{get_load_range, get_writable_range, load_segments};
use crate::loader::{parse_elf, stack, ElfInfo, ElfKind};
use crate::syscalls::{read_guest_path, SysOutcome, SysResult};
use crate::Runtime;

/// PIE base used when `execve` loads a fresh position-independent binary.
pub const EXECVE_PIE_BASE: u64 = 0x40000;

/// Brk reservation carved out above the freshly loaded image.
pub const EXECVE_BRK_RESERVE: u64 = 16 << 20;

/// Stack reservation when the stack has to move below the interpreter.
const RELOCATED_STACK_SIZE: u64 = 8 << 20;

/// Upper bound on argv entries read from guest memory.
const MAX_ARGV: usize = 256;

/// Symlink depth for the execve path helpers.
const EXEC_SYMLINK_DEPTH: u32 = 10;

/// Process-wide record of the currently loaded binary.
#[derive(Default)]
pub struct ExecContext {
    /// Byte image of the main executable (needed to compare and reload on execve).
    pub exec_binary: Vec<u8>,
    /// Byte image of the interpreter.
    pub interp_binary: Vec<u8>,
    /// Parsed info of the main executable, with the load base already applied.
    pub exec_info: ElfInfo,
    pub exec_base: u64,
    pub exec_rw_start: u64,
    pub exec_rw_end: u64,
    pub interp_base: u64,
    pub interp_rw_start: u64,
    pub interp_rw_end: u64,
    pub interp_entry: u64,
    pub original_stack_top: u64,
    /// Native heap handed to the machine's bump allocator at load time.
    pub heap_start: u64,
    pub heap_size: u64,
    /// Brk region installed by execve; before any execve the machine's built-in brk
    /// handler is authoritative and `brk_overridden` is false.
    pub brk_base: u64,
    pub brk_current: u64,
    pub brk_overridden: bool,
    /// Mirror of the machine's mmap allocation frontier.
    pub mmap_frontier: u64,
    pub env: Vec<String>,
    pub dynamic: bool,
}

/// Resolve `path` through VFS symlinks, hop by hop.
pub fn resolve_symlinks(rt: &Runtime, path: &str) -> Option<String> {
    let mut resolved = path.to_owned();
    for _ in 0..EXEC_SYMLINK_DEPTH {
        rt.vfs.lstat(&resolved).ok()?;
        match rt.vfs.readlink(&resolved) {
            Ok(target) => {
                resolved = if target.starts_with('/') {
                    target
                } else {
                    match resolved.rfind('/') {
                        Some(slash) => format!("{}/{}", &resolved[..slash], target),
                        None => target,
                    }
                };
            }
            Err(_) => break,
        }
    }
    Some(resolved)
}

/// Search the guest's `PATH` for a bare command name.
fn search_path(rt: &Runtime, cmd: &str) -> Option<String> {
    if cmd.is_empty() || cmd.starts_with('/') {
        return Some(cmd.to_owned());
    }
    let path_value = rt
        .exec
        .env
        .iter()
        .find_map(|e| e.strip_prefix("PATH="))
        .unwrap_or("/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin");
    for dir in path_value.split(':') {
        let candidate = format!("{dir}/{cmd}");
        if let Some(resolved) = resolve_symlinks(rt, &candidate) {
            if rt.vfs.stat(&resolved).map(|md| md.kind == friscy::fs::FileKind::Regular) == Ok(true)
            {
                // Return the unresolved candidate; the caller resolves again.
                return Some(candidate);
            }
        }
    }
    None
}

/// Rewrite `args`/`resolved` for a `#!` script: `interp [arg] script argv[1..]`, with a
/// special case for `/usr/bin/env cmd`.
fn apply_shebang(rt: &Runtime, resolved: &mut String, args: &mut Vec<String>) -> Result<(), Errno> {
    let Ok(head) = rt.vfs.read_file(resolved) else {
        return Ok(());
    };
    if head.len() < 4 || &head[..2] != b"#!" {
        return Ok(());
    }
    let line_end = head.iter().position(|&b| b == b'\n').unwrap_or(head.len());
    let line = String::from_utf8_lossy(&head[2..line_end]).trim().to_owned();
    if line.is_empty() {
        return Ok(());
    }
    let (interp_path, interp_arg) = match line.split_once(char::is_whitespace) {
        Some((p, a)) => (p.to_owned(), Some(a.trim().to_owned()).filter(|a| !a.is_empty())),
        None => (line, None),
    };

    let mut new_args = Vec::with_capacity(args.len() + 2);
    new_args.push(interp_path.clone());
    if let Some(arg) = interp_arg {
        new_args.push(arg);
    }
    new_args.push(resolved.clone());
    new_args.extend(args.iter().skip(1).cloned());
    *args = new_args;

    if interp_path == "/usr/bin/env" && args.len() >= 2 {
        let cmd = args[1].clone();
        if let Some(found) = search_path(rt, &cmd) {
            args.remove(1);
            args[0] = found.clone();
            *resolved = resolve_symlinks(rt, &found).ok_or(Errno::ENOENT)?;
            return Ok(());
        }
    }
    *resolved = resolve_symlinks(rt, &interp_path).ok_or(Errno::ENOENT)?;
    Ok(())
}

fn round_up_page(value: u64) -> u64 {
    (value + PAGE_SIZE - 1) & PAGE_MASK
}

/// Load a different ELF into the arena, replacing the current image.
fn exec_new_binary(
    rt: &mut Runtime,
    m: &mut dyn Machine,
    resolved: &str,
    new_binary: Vec<u8>,
    args: &[String],
) -> SysOutcome {
    let mut exec_info = parse_elf(&new_binary).map_err(|_| Errno::ENOEXEC)?;
    let (load_lo, load_hi) = get_load_range(&new_binary);
    if load_hi.saturating_sub(load_lo) + EXECVE_PIE_BASE >= m.arena_size() {
        return Err(Errno::ENOMEM);
    }
    log::debug!("execve: loading {resolved} ({} bytes)", new_binary.len());

    // Open up everything the loader is about to write over: the old image's writable
    // segments and the new image's prospective range.
    if rt.exec.exec_rw_start < rt.exec.exec_rw_end {
        m.set_page_attributes(
            rt.exec.exec_rw_start,
            rt.exec.exec_rw_end - rt.exec.exec_rw_start,
            PageAttributes::RW,
        );
        let _ = m.fill_mem(
            rt.exec.exec_rw_start,
            0,
            rt.exec.exec_rw_end - rt.exec.exec_rw_start,
        );
    }

    let exec_end;
    let adjust;
    if exec_info.kind == ElfKind::Dyn {
        let base = EXECVE_PIE_BASE;
        load_segments(m, &new_binary, base).map_err(Errno::from)?;
        adjust = base - load_lo;
        exec_info.phdr_addr += adjust;
        exec_info.entry_point += adjust;
        exec_info.base_addr = base;
        rt.exec.exec_base = base;
        exec_end = adjust + load_hi;
    } else {
        load_segments(m, &new_binary, 0).map_err(Errno::from)?;
        adjust = 0;
        rt.exec.exec_base = 0;
        exec_end = load_hi;
    }
    let (rw_lo, rw_hi) = get_writable_range(&new_binary);
    if rw_lo != u64::MAX {
        rt.exec.exec_rw_start = adjust + rw_lo;
        rt.exec.exec_rw_end = adjust + rw_hi;
    } else {
        rt.exec.exec_rw_start = 0;
        rt.exec.exec_rw_end = 0;
    }

    // A dynamic binary drags its interpreter back in at the old interpreter base.
    let mut interp_end = rt.exec.interp_rw_end;
    if exec_info.is_dynamic && !exec_info.interpreter.is_empty() {
        let interp_resolved =
            resolve_symlinks(rt, &exec_info.interpreter).ok_or(Errno::ENOENT)?;
        let interp_binary = rt.vfs.read_file(&interp_resolved).map_err(|_| Errno::ENOENT)?;

        if rt.exec.interp_rw_start < rt.exec.interp_rw_end {
            m.set_page_attributes(
                rt.exec.interp_rw_start,
                rt.exec.interp_rw_end - rt.exec.interp_rw_start,
                PageAttributes::RW,
            );
            let _ = m.fill_mem(
                rt.exec.interp_rw_start,
                0,
                rt.exec.interp_rw_end - rt.exec.interp_rw_start,
            );
        }

        let interp_base = rt.exec.interp_base;
        load_segments(m, &interp_binary, interp_base).map_err(Errno::from)?;
        let interp_info = parse_elf(&interp_binary).map_err(|_| Errno::ENOEXEC)?;
        let (ilo, ihi) = get_load_range(&interp_binary);
        rt.exec.interp_entry = if interp_info.kind == ElfKind::Dyn {
            interp_info.entry_point - ilo + interp_base
        } else {
            interp_info.entry_point
        };
        let (irw_lo, irw_hi) = get_writable_range(&interp_binary);
        if irw_lo != u64::MAX {
            rt.exec.interp_rw_start = interp_base + irw_lo - ilo;
            rt.exec.interp_rw_end = interp_base + irw_hi - ilo;
        }
        rt.exec.interp_binary = interp_binary;
        interp_end = interp_base + ihi - ilo;
    }

    // Fresh brk region above whichever image ends higher, with the mmap frontier
    // pushed past the reservation.
    let brk_base = round_up_page(exec_end.max(interp_end));
    m.set_page_attributes(brk_base, EXECVE_BRK_RESERVE, PageAttributes::RW);
    m.mmap_advance_to(brk_base + EXECVE_BRK_RESERVE);
    rt.exec.brk_base = brk_base;
    rt.exec.brk_current = brk_base;
    rt.exec.brk_overridden = true;
    rt.exec.mmap_frontier = m.mmap_frontier();

    // If the image now reaches into the stack, move the stack just below the
    // interpreter and widen its mapping.
    let stack_bottom = rt.exec.original_stack_top.saturating_sub(RELOCATED_STACK_SIZE);
    if brk_base + EXECVE_BRK_RESERVE > stack_bottom {
        let new_top = rt.exec.interp_base & PAGE_MASK;
        m.set_page_attributes(
            new_top.saturating_sub(RELOCATED_STACK_SIZE),
            RELOCATED_STACK_SIZE,
            PageAttributes::RW,
        );
        rt.exec.original_stack_top = new_top;
        log::debug!("execve: stack relocated below interpreter at {new_top:#x}");
    }

    rt.exec.exec_binary = new_binary;
    rt.exec.exec_info = exec_info.clone();

    enter_image(rt, m, &exec_info, args)
}

/// Build the fresh initial stack, zero the registers, and jump.
fn enter_image(
    rt: &mut Runtime,
    m: &mut dyn Machine,
    exec_info: &ElfInfo,
    args: &[String],
) -> SysOutcome {
    let env = rt.exec.env.clone();
    let sp = stack::build_initial_stack(
        m,
        exec_info,
        rt.exec.interp_base,
        args,
        &env,
        &mut rt.rng,
        rt.exec.original_stack_top,
    )?;

    for r in 1..32 {
        m.set_reg(r, 0);
    }
    m.set_reg(reg::SP, sp);
    let entry = if exec_info.is_dynamic {
        rt.exec.interp_entry
    } else {
        exec_info.entry_point
    };
    m.set_pc(entry);
    log::debug!("execve: entering at {entry:#x}, sp {sp:#x}");

    // execve does not return on success: no result register is written.
    Ok(SysResult::NoReturn)
}

/// `execve(path, argv, envp)`.
pub fn sys_execve(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    if !rt.exec.dynamic || rt.exec.exec_binary.is_empty() {
        return Err(Errno::ENOSYS);
    }

    let path = read_guest_path(m, m.reg(reg::A0))?;
    let argv_addr = m.reg(reg::A1);

    let mut resolved = resolve_symlinks(rt, &path).ok_or(Errno::ENOENT)?;

    let mut args = Vec::new();
    for i in 0..MAX_ARGV {
        let ptr = m.read_u64(argv_addr + i as u64 * 8)?;
        if ptr == 0 {
            break;
        }
        args.push(m.read_cstring(ptr, 4096)?);
    }
    if args.is_empty() {
        args.push(path.clone());
    }

    apply_shebang(rt, &mut resolved, &mut args)?;

    let new_binary = rt.vfs.read_file(&resolved).unwrap_or_default();
    let is_new_elf = parse_elf(&new_binary).is_ok();

    if is_new_elf && new_binary != rt.exec.exec_binary {
        return exec_new_binary(rt, m, &resolved, new_binary, &args);
    }

    // Same binary (a busybox applet) or not an ELF at all: keep the loaded image and
    // only rebuild the initial stack with the new argv.
    let exec_info = rt.exec.exec_info.clone();
    enter_image(rt, m, &exec_info, &args)
}
