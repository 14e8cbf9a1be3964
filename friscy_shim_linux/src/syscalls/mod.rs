//! Syscall dispatch.
//!
//! One fixed table keyed by the number in `a7`. Handlers are plain functions taking the
//! runtime and the machine; most return a value (or a negative errno) that the
//! dispatcher writes into `a0`, while handlers that manage registers themselves —
//! `execve`, `clone`, the rewind-and-stop reads, the scheduler switches — report
//! [`SysResult::NoReturn`].

use friscy::machine::{reg, Machine};
use friscy_common_linux::errno::Errno;
use friscy_common_linux::nr;

use crate::Runtime;

pub mod file;
pub mod mm;
pub mod net;
pub mod poll;
pub mod process;


/// What a handler did with the result register.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SysResult {
    /// Write this value into `a0`.
    Value(u64),
    /// The handler set registers (or stopped the machine) itself.
    NoReturn,
}

impl std::fmt::Debug for SysResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SysResult::Value(v) => write!(f, "Value({v:#x})"),
            SysResult::NoReturn => write!(f, "NoReturn"),
        }
    }
}

pub type SysOutcome = Result<SysResult, Errno>;

/// Syscall argument `i` (0-based) from `a0..a5`.
pub fn arg(m: &dyn Machine, i: usize) -> u64 {
    m.reg(reg::A0 + i)
}

/// Read a NUL-terminated path from guest memory. Faults become `EFAULT`.
pub fn read_guest_path(m: &dyn Machine, addr: u64) -> Result<String, Errno> {
    Ok(m.read_cstring(addr, 4096)?)
}

/// Upper bound for a single kernel-side I/O buffer, to keep a hostile count from
/// forcing a giant allocation. Short transfers are fine; the guest retries.
pub const MAX_IO_CHUNK: usize = 0x80_000;

/// Dispatch the `ecall` the machine just reported. On return the machine either has a
/// result in `a0`, or was redirected/stopped by the handler.
pub fn handle_ecall(rt: &mut Runtime, m: &mut dyn Machine) {
    let nr = m.reg(reg::A7);
    let outcome: SysOutcome = match nr {
        // File and fd operations
        nr::OPENAT => file::sys_openat(rt, m),
        nr::CLOSE => file::sys_close(rt, m),
        nr::READ => file::sys_read(rt, m),
        nr::WRITE => file::sys_write(rt, m),
        nr::READV => file::sys_readv(rt, m),
        nr::WRITEV => file::sys_writev(rt, m),
        nr::PREAD64 => file::sys_pread64(rt, m),
        nr::PWRITE64 => file::sys_pwrite64(rt, m),
        nr::PWRITEV => file::sys_pwritev(rt, m),
        nr::LSEEK => file::sys_lseek(rt, m),
        nr::FTRUNCATE => file::sys_ftruncate(rt, m),
        nr::SENDFILE => file::sys_sendfile(rt, m),
        nr::DUP => file::sys_dup(rt, m),
        nr::DUP3 => file::sys_dup3(rt, m),
        nr::PIPE2 => file::sys_pipe2(rt, m),
        nr::GETDENTS64 => file::sys_getdents64(rt, m),
        nr::NEWFSTATAT => file::sys_newfstatat(rt, m),
        nr::FSTAT => file::sys_fstat(rt, m),
        nr::STATX => file::sys_statx(rt, m),
        nr::READLINKAT => file::sys_readlinkat(rt, m),
        nr::FACCESSAT | nr::FACCESSAT2 => file::sys_faccessat(rt, m),
        nr::MKDIRAT => file::sys_mkdirat(rt, m),
        nr::UNLINKAT => file::sys_unlinkat(rt, m),
        nr::SYMLINKAT => file::sys_symlinkat(rt, m),
        nr::LINKAT => file::sys_linkat(rt, m),
        nr::RENAMEAT => file::sys_renameat(rt, m),
        nr::GETCWD => file::sys_getcwd(rt, m),
        nr::CHDIR => file::sys_chdir(rt, m),
        nr::IOCTL => file::sys_ioctl(rt, m),
        nr::FCNTL => file::sys_fcntl(rt, m),
        nr::EVENTFD2 => file::sys_eventfd2(rt, m),

        // Process, identity, time
        nr::EXIT | nr::EXIT_GROUP => process::sys_exit(rt, m, nr == nr::EXIT_GROUP),
        nr::CLONE => process::sys_clone(rt, m),
        nr::EXECVE => crate::exec::sys_execve(rt, m),
        nr::WAIT4 => crate::fork::sys_wait4(rt, m),
        nr::GETPID => Ok(SysResult::Value(1)),
        nr::GETPPID => Ok(SysResult::Value(0)),
        nr::GETTID => Ok(SysResult::Value(rt.sched.current_tid() as u64)),
        nr::GETUID | nr::GETEUID | nr::GETGID | nr::GETEGID => Ok(SysResult::Value(0)),
        nr::SET_TID_ADDRESS => process::sys_set_tid_address(rt, m),
        nr::SET_ROBUST_LIST => Ok(SysResult::Value(0)),
        nr::CLOCK_GETTIME => process::sys_clock_gettime(rt, m),
        nr::CLOCK_GETRES => process::sys_clock_getres(rt, m),
        nr::GETRANDOM => process::sys_getrandom(rt, m),
        nr::UNAME => process::sys_uname(rt, m),
        nr::SYSINFO => process::sys_sysinfo(rt, m),
        nr::NANOSLEEP => process::sys_nanosleep(rt, m),
        nr::SCHED_YIELD => process::sys_sched_yield(rt, m),
        nr::PRLIMIT64 => process::sys_prlimit64(rt, m),
        nr::GETRLIMIT => process::sys_getrlimit(rt, m),
        nr::RT_SIGACTION | nr::RT_SIGPROCMASK | nr::SIGALTSTACK | nr::RT_SIGRETURN => {
            Ok(SysResult::Value(0))
        }
        nr::KILL => process::sys_kill(rt, m),
        nr::TKILL | nr::TGKILL => process::sys_tkill(rt, m),
        nr::SCHED_GETSCHEDULER => Ok(SysResult::Value(0)),
        nr::SCHED_GETPARAM => process::sys_sched_getparam(rt, m),
        nr::SCHED_GETAFFINITY => process::sys_sched_getaffinity(rt, m),
        nr::UMASK => process::sys_umask(rt, m),
        nr::GETPGID => Ok(SysResult::Value(1)),
        nr::GETRESUID | nr::GETRESGID => process::sys_getresids(rt, m),
        nr::GETGROUPS => Ok(SysResult::Value(0)),
        nr::CAPGET => Err(Errno::EPERM),
        nr::MEMBARRIER => process::sys_membarrier(rt, m),

        // Memory
        nr::BRK => mm::sys_brk(rt, m),
        nr::MMAP => mm::sys_mmap(rt, m),
        nr::MPROTECT => mm::sys_mprotect(rt, m),
        nr::MUNMAP => mm::sys_munmap(rt, m),
        nr::MREMAP => Err(Errno::ENOSYS),
        nr::MADVISE => Ok(SysResult::Value(0)),

        // Polling and events
        nr::PPOLL => poll::sys_ppoll(rt, m),
        nr::EPOLL_CREATE1 => poll::sys_epoll_create1(rt, m),
        nr::EPOLL_CTL => poll::sys_epoll_ctl(rt, m),
        nr::EPOLL_PWAIT => poll::sys_epoll_pwait(rt, m),
        nr::FUTEX => process::sys_futex(rt, m),

        // Sockets
        nr::SOCKET => net::sys_socket(rt, m),
        nr::SOCKETPAIR => net::sys_socketpair(rt, m),
        nr::BIND => net::sys_bind(rt, m),
        nr::LISTEN => net::sys_listen(rt, m),
        nr::ACCEPT => net::sys_accept(rt, m),
        nr::ACCEPT4 => net::sys_accept4(rt, m),
        nr::CONNECT => net::sys_connect(rt, m),
        nr::SENDTO => net::sys_sendto(rt, m),
        nr::RECVFROM => net::sys_recvfrom(rt, m),
        nr::SETSOCKOPT => Ok(SysResult::Value(0)),
        nr::GETSOCKOPT => net::sys_getsockopt(rt, m),
        nr::SHUTDOWN => net::sys_shutdown(rt, m),
        nr::GETSOCKNAME => net::sys_getsockname(rt, m),
        nr::GETPEERNAME => Err(Errno::ENOSYS),
        nr::SENDMSG => net::sys_sendmsg(rt, m),
        nr::RECVMSG => net::sys_recvmsg(rt, m),

        // Miscellany
        nr::PRCTL => Ok(SysResult::Value(0)),
        nr::RSEQ | nr::IO_URING_SETUP | nr::RISCV_HWPROBE => Err(Errno::ENOSYS),
        nr::CLOSE_RANGE => Ok(SysResult::Value(0)),

        other => {
            log::debug!("unhandled syscall {other}");
            Err(Errno::ENOSYS)
        }
    };

    match outcome {
        Ok(SysResult::Value(v)) => m.set_reg(reg::A0, v),
        Ok(SysResult::NoReturn) => {}
        Err(e) => m.set_reg(reg::A0, e.as_neg() as u64),
    }
}
