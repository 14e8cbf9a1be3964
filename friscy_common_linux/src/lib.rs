// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Linux/RISC-V 64 ABI vocabulary for the friscy shim.
//!
//! Syscall numbers, flag bits, errnos, and the on-wire struct layouts the guest expects.
//! Raw integers stay raw (grouped constants) except where their domain is small and
//! closed, which get `num_enum`-decoded enums.

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

pub mod auxv;
pub mod errno;
pub mod nr;

/// `AT_FDCWD`: path lookups relative to the current working directory.
pub const AT_FDCWD: i32 = -100;
/// `unlinkat` flag selecting `rmdir` semantics.
pub const AT_REMOVEDIR: u32 = 0x200;
/// `newfstatat` flag: do not follow a final symlink.
pub const AT_SYMLINK_NOFOLLOW: u32 = 0x100;
/// `newfstatat`/`statx` flag: operate on the dirfd itself.
pub const AT_EMPTY_PATH: u32 = 0x1000;

/// Size of one `ecall` instruction; the rewind-and-stop protocol steps the PC back by
/// this much so re-entry re-executes the syscall.
pub const ECALL_INSN_SIZE: u64 = 4;

bitflags! {
    /// `PROT_*` bits for `mmap`/`mprotect`.
    #[repr(transparent)]
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct ProtFlags: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
        const _ = !0;
    }
}

impl ProtFlags {
    /// Translate to machine page attributes.
    pub fn page_attributes(self) -> friscy::machine::PageAttributes {
        friscy::machine::PageAttributes {
            read: self.contains(ProtFlags::READ),
            write: self.contains(ProtFlags::WRITE),
            exec: self.contains(ProtFlags::EXEC),
        }
    }
}

bitflags! {
    /// `MAP_*` bits for `mmap`.
    #[repr(transparent)]
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct MapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        const FIXED = 0x10;
        const ANONYMOUS = 0x20;
        const _ = !0;
    }
}

bitflags! {
    /// `CLONE_*` bits. The shim distinguishes the fork form from the thread form of
    /// `clone` by these.
    #[repr(transparent)]
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct CloneFlags: u64 {
        const VM = 0x100;
        const FS = 0x200;
        const FILES = 0x400;
        const SIGHAND = 0x800;
        const VFORK = 0x4000;
        const PARENT = 0x8000;
        const THREAD = 0x10000;
        const SYSVSEM = 0x40000;
        const SETTLS = 0x80000;
        const PARENT_SETTID = 0x100000;
        const CHILD_CLEARTID = 0x200000;
        const CHILD_SETTID = 0x1000000;
        const _ = !0;
    }
}

impl CloneFlags {
    /// Whether this `clone` creates a thread sharing the address space (scheduler slot)
    /// rather than a cooperative fork.
    pub fn is_thread(self) -> bool {
        self.contains(CloneFlags::THREAD)
            || (self.contains(CloneFlags::VM) && !self.contains(CloneFlags::VFORK))
    }
}

bitflags! {
    /// `POLL*` event bits for `ppoll`.
    #[repr(transparent)]
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct PollEvents: u16 {
        const IN = 0x001;
        const PRI = 0x002;
        const OUT = 0x004;
        const ERR = 0x008;
        const HUP = 0x010;
        const NVAL = 0x020;
        const _ = !0;
    }
}

bitflags! {
    /// `EPOLL*` event bits.
    #[repr(transparent)]
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct EpollEvents: u32 {
        const IN = 0x001;
        const PRI = 0x002;
        const OUT = 0x004;
        const ERR = 0x008;
        const HUP = 0x010;
        const _ = !0;
    }
}

/// `epoll_ctl` operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum EpollOp {
    Add = 1,
    Del = 2,
    Mod = 3,
}

/// Futex commands after masking `FUTEX_PRIVATE_FLAG` and `FUTEX_CLOCK_REALTIME`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum FutexCmd {
    Wait = 0,
    Wake = 1,
    WaitBitset = 9,
    WakeBitset = 10,
}

/// Mask selecting the futex command bits.
pub const FUTEX_CMD_MASK: u32 = 0x7f;

/// `lseek` whence values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum SeekWhence {
    Set = 0,
    Cur = 1,
    End = 2,
}

// --- ioctl requests the shim recognizes ---

pub const TCGETS: u64 = 0x5401;
pub const TCSETS: u64 = 0x5402;
pub const TCSETSW: u64 = 0x5403;
pub const TCSETSF: u64 = 0x5404;
pub const TIOCGWINSZ: u64 = 0x5413;
pub const FIONBIO: u64 = 0x5421;

/// The termios block returned by `TCGETS`: sane cooked-mode defaults so `isatty()`
/// holds and shells enable line editing.
pub fn default_termios() -> [u8; 44] {
    let mut buf = [0u8; 44];
    let c_iflag: u32 = 0;
    let c_oflag: u32 = 0x0005; // OPOST | ONLCR
    let c_cflag: u32 = 0x00bf; // CS8 | CREAD | CLOCAL
    let c_lflag: u32 = 0x8a3b; // ECHO | ICANON | ISIG | IEXTEN | ECHOCTL | ECHOKE | ECHOE
    buf[0..4].copy_from_slice(&c_iflag.to_le_bytes());
    buf[4..8].copy_from_slice(&c_oflag.to_le_bytes());
    buf[8..12].copy_from_slice(&c_cflag.to_le_bytes());
    buf[12..16].copy_from_slice(&c_lflag.to_le_bytes());
    buf
}

// --- fcntl commands ---

pub const F_DUPFD: u32 = 0;
pub const F_GETFD: u32 = 1;
pub const F_SETFD: u32 = 2;
pub const F_GETFL: u32 = 3;
pub const F_SETFL: u32 = 4;
pub const F_DUPFD_CLOEXEC: u32 = 1030;

// --- rlimit resources ---

pub const RLIMIT_STACK: u32 = 3;
pub const RLIMIT_NOFILE: u32 = 7;

/// `struct stat` for RISC-V 64, written to guest memory byte-for-byte.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Stat {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: u64,
    pub __pad1: u64,
    pub st_size: i64,
    pub st_blksize: i32,
    pub __pad2: i32,
    pub st_blocks: i64,
    pub st_atime_sec: i64,
    pub st_atime_nsec: i64,
    pub st_mtime_sec: i64,
    pub st_mtime_nsec: i64,
    pub st_ctime_sec: i64,
    pub st_ctime_nsec: i64,
    pub __reserved: [i32; 2],
}

impl Stat {
    /// The byte image the guest sees.
    pub fn to_bytes(&self) -> [u8; core::mem::size_of::<Stat>()] {
        // Stat is repr(C), fully initialized plain data.
        unsafe { core::mem::transmute_copy(self) }
    }
}

/// `struct timespec`.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

/// `struct sysinfo` (64-bit layout).
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Sysinfo {
    pub uptime: i64,
    pub loads: [u64; 3],
    pub totalram: u64,
    pub freeram: u64,
    pub bufferram: u64,
    pub totalswap: u64,
    pub freeswap: u64,
    pub procs: u16,
    pub pad: u16,
    pub pad2: u32,
    pub totalhigh: u64,
    pub freehigh: u64,
    pub mem_unit: u32,
}

impl Sysinfo {
    pub fn to_bytes(&self) -> [u8; core::mem::size_of::<Sysinfo>()] {
        unsafe { core::mem::transmute_copy(self) }
    }
}

/// `struct winsize` for `TIOCGWINSZ`.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct WinSize {
    pub ws_row: u16,
    pub ws_col: u16,
    pub ws_xpixel: u16,
    pub ws_ypixel: u16,
}

/// One `struct iovec` as read from guest memory.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct IoVec {
    pub base: u64,
    pub len: u64,
}

/// Size of one guest iovec record.
pub const IOVEC_SIZE: u64 = 16;

/// The six 65-byte `utsname` fields reported by `uname`.
pub const UTSNAME_FIELD_LEN: usize = 65;
pub const UTSNAME: [&str; 6] = [
    "Linux",
    "friscy",
    "6.1.0-friscy",
    "#1 SMP PREEMPT_DYNAMIC",
    "riscv64",
    "(none)",
];

/// Encode an exit code in the `wait4` status format (`WEXITSTATUS`).
pub fn wait_status_from_exit_code(code: i32) -> i32 {
    (code & 0xff) << 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_layout_matches_the_kernel_abi() {
        assert_eq!(core::mem::size_of::<Stat>(), 128);
        assert_eq!(core::mem::offset_of!(Stat, st_mode), 16);
        assert_eq!(core::mem::offset_of!(Stat, st_size), 48);
        assert_eq!(core::mem::offset_of!(Stat, st_blocks), 64);
        assert_eq!(core::mem::offset_of!(Stat, st_mtime_sec), 88);
    }

    #[test]
    fn clone_flag_classification() {
        // glibc/musl fork(): SIGCHLD only.
        assert!(!CloneFlags::from_bits_retain(17).is_thread());
        // vfork(): VFORK | VM.
        assert!(!(CloneFlags::VFORK | CloneFlags::VM).is_thread());
        // pthread_create: THREAD | VM | ...
        assert!((CloneFlags::THREAD | CloneFlags::VM | CloneFlags::SIGHAND).is_thread());
        // CLONE_VM without VFORK also schedules as a thread.
        assert!(CloneFlags::VM.is_thread());
    }

    #[test]
    fn wait_status_encoding() {
        assert_eq!(wait_status_from_exit_code(7), 7 << 8);
        assert_eq!(wait_status_from_exit_code(0x1ff), 0xff << 8);
    }
}
