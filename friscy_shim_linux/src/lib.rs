//! A shim that provides the Linux/RISC-V 64 syscall ABI on top of the friscy core.
//!
//! Everything a syscall handler can touch hangs off one [`Runtime`] value: the VFS, the
//! host I/O bridge, the exec context, the cooperative fork state, the thread scheduler,
//! the socket bridge and the epoll table. The launcher owns the `Runtime` and threads it
//! (together with the machine) through [`syscalls::handle_ecall`] on every `ecall`.

use std::sync::Arc;

use friscy::fs::VirtualFs;
use friscy::io::HostIo;
use friscy::utils::rng::FastRng;

pub mod exec;
pub mod fork;
pub mod loader;
pub mod sched;
pub mod syscalls;

/// Sink for guest stdout/stderr bytes. Invoked on the execution thread.
pub type OutputSink = Box<dyn Fn(&[u8]) + Send>;

/// First PID handed to cooperatively forked children.
const FIRST_CHILD_PID: i32 = 100;

/// Process-wide state threaded through every syscall handler.
pub struct Runtime {
    pub vfs: VirtualFs,
    pub io: Arc<HostIo>,
    pub exec: exec::ExecContext,
    pub fork: fork::ForkState,
    pub sched: sched::Scheduler,
    pub net: syscalls::net::NetworkContext,
    pub epolls: syscalls::poll::EpollTable,
    pub rng: FastRng,
    pub next_pid: i32,
    pub umask: u32,
    /// Set when the guest exits; the execution loop reads it after the machine stops.
    pub exit_code: Option<i32>,
    output: OutputSink,
}

impl Runtime {
    pub fn new(vfs: VirtualFs, io: Arc<HostIo>, output: OutputSink, rng_seed: u64) -> Self {
        Self {
            vfs,
            io,
            exec: exec::ExecContext::default(),
            fork: fork::ForkState::default(),
            sched: sched::Scheduler::new(),
            net: syscalls::net::NetworkContext::new(),
            epolls: syscalls::poll::EpollTable::new(),
            rng: FastRng::from_seed(rng_seed),
            next_pid: FIRST_CHILD_PID,
            umask: 0o022,
            exit_code: None,
            output,
        }
    }

    /// Deliver guest output to the host callback.
    pub fn print(&self, bytes: &[u8]) {
        (self.output)(bytes);
    }
}
