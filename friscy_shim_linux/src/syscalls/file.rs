//! File and fd syscalls.
//!
//! Routing for the stdio fds follows the redirection rules: a VFS-mapped fd 0/1/2
//! (installed by `dup2`) wins; otherwise fd 0 drains the host stdin buffer (or rewinds
//! and stops the machine when it is empty), and fds 1/2 go to the host printer.

use std::hash::{Hash, Hasher};

use friscy::fs::{FileKind, Node, OFlags, PipeEnd};
use friscy::io::StdinRead;
use friscy::machine::Machine;
use friscy_common_linux::errno::Errno;
use friscy_common_linux::{
    default_termios, SeekWhence, Stat, WinSize, AT_FDCWD, AT_REMOVEDIR, AT_SYMLINK_NOFOLLOW,
    ECALL_INSN_SIZE, FIONBIO, F_DUPFD, F_DUPFD_CLOEXEC, F_GETFD, F_GETFL, F_SETFD, F_SETFL,
    IOVEC_SIZE, TCGETS, TCSETS, TCSETSF, TCSETSW, TIOCGWINSZ,
};

use super::{arg, net, read_guest_path, SysOutcome, SysResult, MAX_IO_CHUNK};
use crate::Runtime;

/// Cap for a single `sendfile` transfer.
const SENDFILE_MAX: usize = 64 * 1024;

fn require_fdcwd(dirfd: i64) -> Result<(), Errno> {
    if dirfd as i32 == AT_FDCWD {
        Ok(())
    } else {
        Err(Errno::ENOTSUP)
    }
}

/// Rewind the PC back across the `ecall` and stop the machine; the host resumes it
/// when stdin has data and the syscall re-executes from scratch.
fn rewind_and_wait_for_stdin(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    rt.io.set_waiting_for_stdin(true);
    m.set_pc(m.pc() - ECALL_INSN_SIZE);
    m.stop();
    Ok(SysResult::NoReturn)
}

pub fn sys_openat(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    require_fdcwd(arg(m, 0) as i64)?;
    let path = read_guest_path(m, arg(m, 1))?;
    let flags = OFlags::from_bits_retain(arg(m, 2) as u32);
    let fd = if flags.contains(OFlags::DIRECTORY) {
        rt.vfs.opendir(&path)?
    } else {
        rt.vfs.open(&path, flags)?
    };
    Ok(SysResult::Value(fd as u64))
}

pub fn sys_close(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    if rt.net.is_socket_fd(fd) {
        net::close_socket(rt, fd);
    } else if rt.epolls.is_epoll_fd(fd) {
        rt.epolls.close(fd);
    } else {
        let _ = rt.vfs.close(fd);
    }
    Ok(SysResult::Value(0))
}

pub fn sys_read(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let buf_addr = arg(m, 1);
    let count = (arg(m, 2) as usize).min(MAX_IO_CHUNK);
    let mut buf = vec![0u8; count];

    // A redirected fd 0 reads from the VFS like any other fd.
    if fd == 0 && !rt.vfs.is_open(0) {
        return match rt.io.try_read_stdin(&mut buf) {
            StdinRead::Data(n) => {
                m.write_mem(buf_addr, &buf[..n])?;
                Ok(SysResult::Value(n as u64))
            }
            StdinRead::Eof => Ok(SysResult::Value(0)),
            StdinRead::WouldBlock => rewind_and_wait_for_stdin(rt, m),
        };
    }
    if rt.net.is_socket_fd(fd) {
        return net::recv_bytes(rt, m, fd, buf_addr, count);
    }

    let n = rt.vfs.read(fd, &mut buf)?;
    m.write_mem(buf_addr, &buf[..n])?;
    Ok(SysResult::Value(n as u64))
}

pub fn sys_write(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let buf_addr = arg(m, 1);
    let count = (arg(m, 2) as usize).min(MAX_IO_CHUNK);
    let mut buf = vec![0u8; count];
    m.read_mem(buf_addr, &mut buf)?;

    // fd 1/2 may have been dup2'd into the VFS; check that first.
    if rt.vfs.is_open(fd) {
        let n = rt.vfs.write(fd, &buf)?;
        return Ok(SysResult::Value(n as u64));
    }
    if rt.net.is_socket_fd(fd) {
        return net::send_bytes(rt, fd, &buf);
    }
    if fd == 1 || fd == 2 {
        rt.print(&buf);
        return Ok(SysResult::Value(count as u64));
    }
    Err(Errno::EBADF)
}

fn read_iovec(m: &dyn Machine, iov_addr: u64, index: u64) -> Result<(u64, usize), Errno> {
    let base = m.read_u64(iov_addr + index * IOVEC_SIZE)?;
    let len = m.read_u64(iov_addr + index * IOVEC_SIZE + 8)? as usize;
    Ok((base, len.min(MAX_IO_CHUNK)))
}

pub fn sys_readv(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let iov_addr = arg(m, 1);
    let iovcnt = (arg(m, 2) as usize).min(1024) as u64;

    if fd == 0 && !rt.vfs.is_open(0) {
        if rt.io.is_eof() && !rt.io.has_stdin_data() {
            return Ok(SysResult::Value(0));
        }
        if !rt.io.has_stdin_data() {
            return rewind_and_wait_for_stdin(rt, m);
        }
        let mut total = 0u64;
        for i in 0..iovcnt {
            let (base, len) = read_iovec(m, iov_addr, i)?;
            if len == 0 {
                continue;
            }
            let mut buf = vec![0u8; len];
            match rt.io.try_read_stdin(&mut buf) {
                StdinRead::Data(n) => {
                    m.write_mem(base, &buf[..n])?;
                    total += n as u64;
                    if n < len {
                        break;
                    }
                }
                _ => break,
            }
        }
        return Ok(SysResult::Value(total));
    }

    let mut total = 0u64;
    for i in 0..iovcnt {
        let (base, len) = read_iovec(m, iov_addr, i)?;
        if len == 0 {
            continue;
        }
        let mut buf = vec![0u8; len];
        let n = rt.vfs.read(fd, &mut buf)?;
        if n > 0 {
            m.write_mem(base, &buf[..n])?;
            total += n as u64;
        }
        if n < len {
            break;
        }
    }
    Ok(SysResult::Value(total))
}

pub fn sys_writev(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let iov_addr = arg(m, 1);
    let iovcnt = (arg(m, 2) as usize).min(1024) as u64;

    let via_vfs = rt.vfs.is_open(fd);
    if !via_vfs && fd != 1 && fd != 2 && !rt.net.is_socket_fd(fd) {
        return Err(Errno::EBADF);
    }

    let mut total = 0u64;
    for i in 0..iovcnt {
        let (base, len) = read_iovec(m, iov_addr, i)?;
        if len == 0 {
            continue;
        }
        let mut buf = vec![0u8; len];
        m.read_mem(base, &mut buf)?;
        if via_vfs {
            let n = rt.vfs.write(fd, &buf)?;
            total += n as u64;
            if n < len {
                break;
            }
        } else if rt.net.is_socket_fd(fd) {
            match net::send_bytes(rt, fd, &buf)? {
                SysResult::Value(n) => total += n,
                SysResult::NoReturn => unreachable!("send_bytes returns a value"),
            }
        } else {
            rt.print(&buf);
            total += len as u64;
        }
    }
    Ok(SysResult::Value(total))
}

pub fn sys_pread64(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let buf_addr = arg(m, 1);
    let count = (arg(m, 2) as usize).min(MAX_IO_CHUNK);
    let offset = arg(m, 3);
    let mut buf = vec![0u8; count];
    let n = rt.vfs.pread(fd, &mut buf, offset)?;
    m.write_mem(buf_addr, &buf[..n])?;
    Ok(SysResult::Value(n as u64))
}

pub fn sys_pwrite64(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let buf_addr = arg(m, 1);
    let count = (arg(m, 2) as usize).min(MAX_IO_CHUNK);
    let offset = arg(m, 3);
    let mut buf = vec![0u8; count];
    m.read_mem(buf_addr, &mut buf)?;
    let n = rt.vfs.pwrite(fd, &buf, offset)?;
    Ok(SysResult::Value(n as u64))
}

pub fn sys_pwritev(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let iov_addr = arg(m, 1);
    let iovcnt = (arg(m, 2) as usize).min(1024) as u64;
    let mut offset = arg(m, 3);

    let mut total = 0u64;
    for i in 0..iovcnt {
        let (base, len) = read_iovec(m, iov_addr, i)?;
        if len == 0 {
            continue;
        }
        let mut buf = vec![0u8; len];
        m.read_mem(base, &mut buf)?;
        let n = rt.vfs.pwrite(fd, &buf, offset)?;
        offset += n as u64;
        total += n as u64;
    }
    Ok(SysResult::Value(total))
}

pub fn sys_lseek(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let offset = arg(m, 1) as i64;
    let whence = SeekWhence::try_from(arg(m, 2) as u32).map_err(|_| Errno::EINVAL)?;
    let pos = rt.vfs.lseek(fd, offset, whence as u32)?;
    Ok(SysResult::Value(pos))
}

pub fn sys_ftruncate(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    rt.vfs.ftruncate(fd, arg(m, 1))?;
    Ok(SysResult::Value(0))
}

pub fn sys_sendfile(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let out_fd = arg(m, 0) as i32;
    let in_fd = arg(m, 1) as i32;
    let offset_ptr = arg(m, 2);
    let count = (arg(m, 3) as usize).min(SENDFILE_MAX);

    let mut buf = vec![0u8; count];
    let n = if offset_ptr != 0 {
        let off = m.read_i64(offset_ptr)?;
        let n = rt.vfs.pread(in_fd, &mut buf, off as u64)?;
        m.write_i64(offset_ptr, off + n as i64)?;
        n
    } else {
        rt.vfs.read(in_fd, &mut buf)?
    };
    if n == 0 {
        return Ok(SysResult::Value(0));
    }
    buf.truncate(n);

    if !rt.vfs.is_open(out_fd) && (out_fd == 1 || out_fd == 2) {
        rt.print(&buf);
        Ok(SysResult::Value(n as u64))
    } else {
        let written = rt.vfs.write(out_fd, &buf)?;
        Ok(SysResult::Value(written as u64))
    }
}

pub fn sys_dup(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = rt.vfs.dup(arg(m, 0) as i32)?;
    Ok(SysResult::Value(fd as u64))
}

pub fn sys_dup3(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let oldfd = arg(m, 0) as i32;
    let newfd = arg(m, 1) as i32;
    if oldfd == newfd {
        return Err(Errno::EINVAL);
    }
    let fd = rt.vfs.dup2(oldfd, newfd)?;
    Ok(SysResult::Value(fd as u64))
}

pub fn sys_pipe2(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let pipefd_addr = arg(m, 0);
    let fifo = Node::new_ref(FileKind::Fifo, 0o600);
    let read_fd = rt.vfs.open_pipe(std::sync::Arc::clone(&fifo), PipeEnd::Read);
    let write_fd = rt.vfs.open_pipe(fifo, PipeEnd::Write);
    m.write_i32(pipefd_addr, read_fd)?;
    m.write_i32(pipefd_addr + 4, write_fd)?;
    Ok(SysResult::Value(0))
}

/// `eventfd2`, realized as a small pipe-like entry the guest can read and write.
pub fn sys_eventfd2(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let initval = arg(m, 0) as u32;
    let fifo = Node::new_ref(FileKind::Fifo, 0o600);
    if initval != 0 {
        fifo.write().unwrap().content = u64::from(initval).to_le_bytes().to_vec();
    }
    let fd = rt.vfs.open_pipe(fifo, PipeEnd::Read);
    Ok(SysResult::Value(fd as u64))
}

pub fn sys_getdents64(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let buf_addr = arg(m, 1);
    let count = (arg(m, 2) as usize).min(MAX_IO_CHUNK);
    let mut buf = vec![0u8; count];
    let n = rt.vfs.getdents64(fd, &mut buf)?;
    m.write_mem(buf_addr, &buf[..n])?;
    Ok(SysResult::Value(n as u64))
}

fn path_inode(path: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

fn stat_of(md: &friscy::fs::Metadata, path: &str) -> Stat {
    Stat {
        st_dev: 1,
        st_ino: path_inode(path),
        st_mode: md.kind.mode_bits() | md.mode,
        st_nlink: md.nlink,
        st_uid: md.uid,
        st_gid: md.gid,
        st_size: md.size as i64,
        st_blksize: 4096,
        st_blocks: (md.size as i64 + 511) / 512,
        st_atime_sec: md.mtime as i64,
        st_mtime_sec: md.mtime as i64,
        st_ctime_sec: md.mtime as i64,
        ..Stat::default()
    }
}

pub fn sys_newfstatat(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    require_fdcwd(arg(m, 0) as i64)?;
    let path = read_guest_path(m, arg(m, 1))?;
    let statbuf = arg(m, 2);
    let flags = arg(m, 3) as u32;

    let md = if flags & AT_SYMLINK_NOFOLLOW != 0 {
        rt.vfs.lstat(&path)?
    } else {
        rt.vfs.stat(&path)?
    };
    m.write_mem(statbuf, &stat_of(&md, &path).to_bytes())?;
    Ok(SysResult::Value(0))
}

pub fn sys_fstat(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let statbuf = arg(m, 1);

    if (0..=2).contains(&fd) && !rt.vfs.is_open(fd) {
        // The stdio fds present as character devices.
        let st = Stat {
            st_dev: 1,
            st_mode: 0o020666,
            st_nlink: 1,
            st_blksize: 4096,
            ..Stat::default()
        };
        m.write_mem(statbuf, &st.to_bytes())?;
        return Ok(SysResult::Value(0));
    }
    if rt.net.is_socket_fd(fd) {
        let st = Stat {
            st_dev: 1,
            st_mode: 0o140666,
            st_nlink: 1,
            st_blksize: 4096,
            ..Stat::default()
        };
        m.write_mem(statbuf, &st.to_bytes())?;
        return Ok(SysResult::Value(0));
    }

    let md = rt.vfs.fstat(fd)?;
    let path = rt.vfs.path_of(fd).unwrap_or("").to_owned();
    m.write_mem(statbuf, &stat_of(&md, &path).to_bytes())?;
    Ok(SysResult::Value(0))
}

pub fn sys_statx(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    require_fdcwd(arg(m, 0) as i64)?;
    let path = read_guest_path(m, arg(m, 1))?;
    let buf_addr = arg(m, 4);
    if path.is_empty() {
        return Err(Errno::ENOENT);
    }
    let md = rt.vfs.stat(&path)?;

    let mut buf = [0u8; 256];
    buf[0..4].copy_from_slice(&0x07ffu32.to_le_bytes()); // stx_mask = STATX_BASIC_STATS
    buf[4..8].copy_from_slice(&4096u32.to_le_bytes()); // stx_blksize
    buf[16..20].copy_from_slice(&md.nlink.to_le_bytes());
    buf[20..24].copy_from_slice(&md.uid.to_le_bytes());
    buf[24..28].copy_from_slice(&md.gid.to_le_bytes());
    let mode16 = (md.kind.mode_bits() | md.mode) as u16;
    buf[28..30].copy_from_slice(&mode16.to_le_bytes());
    buf[32..40].copy_from_slice(&path_inode(&path).to_le_bytes());
    let size = if md.kind == FileKind::Directory { 4096 } else { md.size };
    buf[40..48].copy_from_slice(&size.to_le_bytes());
    buf[48..56].copy_from_slice(&size.div_ceil(512).to_le_bytes());
    let now = process_time_now();
    for i in 0..4 {
        let off = 64 + i * 16;
        buf[off..off + 8].copy_from_slice(&now.0.to_le_bytes());
        buf[off + 8..off + 12].copy_from_slice(&(now.1 as u32).to_le_bytes());
    }
    m.write_mem(buf_addr, &buf)?;
    Ok(SysResult::Value(0))
}

fn process_time_now() -> (i64, i64) {
    super::process::realtime_now()
}

pub fn sys_readlinkat(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    require_fdcwd(arg(m, 0) as i64)?;
    let path = read_guest_path(m, arg(m, 1))?;
    let buf_addr = arg(m, 2);
    let bufsiz = arg(m, 3) as usize;
    let target = rt.vfs.readlink(&path)?;
    let n = target.len().min(bufsiz);
    m.write_mem(buf_addr, &target.as_bytes()[..n])?;
    Ok(SysResult::Value(n as u64))
}

pub fn sys_faccessat(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    require_fdcwd(arg(m, 0) as i64)?;
    let path = read_guest_path(m, arg(m, 1))?;
    if rt.vfs.resolve(&path).is_some() {
        Ok(SysResult::Value(0))
    } else {
        Err(Errno::ENOENT)
    }
}

pub fn sys_mkdirat(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    require_fdcwd(arg(m, 0) as i64)?;
    let path = read_guest_path(m, arg(m, 1))?;
    rt.vfs.mkdir(&path, arg(m, 2) as u32)?;
    Ok(SysResult::Value(0))
}

pub fn sys_unlinkat(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    require_fdcwd(arg(m, 0) as i64)?;
    let path = read_guest_path(m, arg(m, 1))?;
    let flags = arg(m, 2) as u32;
    rt.vfs.unlink(&path, flags & AT_REMOVEDIR != 0)?;
    Ok(SysResult::Value(0))
}

pub fn sys_symlinkat(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let target = read_guest_path(m, arg(m, 0))?;
    require_fdcwd(arg(m, 1) as i64)?;
    let linkpath = read_guest_path(m, arg(m, 2))?;
    rt.vfs.symlink(&target, &linkpath)?;
    Ok(SysResult::Value(0))
}

pub fn sys_linkat(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    require_fdcwd(arg(m, 0) as i64)?;
    let oldpath = read_guest_path(m, arg(m, 1))?;
    require_fdcwd(arg(m, 2) as i64)?;
    let newpath = read_guest_path(m, arg(m, 3))?;
    rt.vfs.link(&oldpath, &newpath)?;
    Ok(SysResult::Value(0))
}

pub fn sys_renameat(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    require_fdcwd(arg(m, 0) as i64)?;
    let oldpath = read_guest_path(m, arg(m, 1))?;
    require_fdcwd(arg(m, 2) as i64)?;
    let newpath = read_guest_path(m, arg(m, 3))?;
    rt.vfs.rename(&oldpath, &newpath)?;
    Ok(SysResult::Value(0))
}

pub fn sys_getcwd(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let buf_addr = arg(m, 0);
    let size = arg(m, 1) as usize;
    let cwd = rt.vfs.getcwd().to_owned();
    if cwd.len() + 1 > size {
        return Err(Errno::ERANGE);
    }
    m.write_mem(buf_addr, cwd.as_bytes())?;
    m.write_mem(buf_addr + cwd.len() as u64, &[0])?;
    Ok(SysResult::Value(buf_addr))
}

pub fn sys_chdir(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let path = read_guest_path(m, arg(m, 0))?;
    rt.vfs.chdir(&path)?;
    Ok(SysResult::Value(0))
}

pub fn sys_ioctl(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let request = arg(m, 1);

    match request {
        TIOCGWINSZ if (0..=2).contains(&fd) => {
            let (cols, rows) = rt.io.terminal_size();
            let ws = WinSize {
                ws_row: rows,
                ws_col: cols,
                ws_xpixel: 0,
                ws_ypixel: 0,
            };
            let addr = arg(m, 2);
            m.write_u16(addr, ws.ws_row)?;
            m.write_u16(addr + 2, ws.ws_col)?;
            m.write_u16(addr + 4, ws.ws_xpixel)?;
            m.write_u16(addr + 6, ws.ws_ypixel)?;
            Ok(SysResult::Value(0))
        }
        TCGETS if (0..=2).contains(&fd) => {
            m.write_mem(arg(m, 2), &default_termios())?;
            Ok(SysResult::Value(0))
        }
        TCSETS | TCSETSW | TCSETSF if (0..=2).contains(&fd) => Ok(SysResult::Value(0)),
        FIONBIO => Ok(SysResult::Value(0)),
        _ => Err(Errno::ENOTSUP),
    }
}

pub fn sys_fcntl(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let cmd = arg(m, 1) as u32;
    match cmd {
        F_DUPFD | F_DUPFD_CLOEXEC => {
            let newfd = rt.vfs.dup(fd)?;
            Ok(SysResult::Value(newfd as u64))
        }
        F_GETFD | F_SETFD | F_GETFL | F_SETFL => Ok(SysResult::Value(0)),
        _ => Err(Errno::EINVAL),
    }
}
