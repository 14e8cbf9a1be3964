//! `ppoll` and the epoll family.
//!
//! Readiness is computed against the stdio bridge, the VFS (pipes carry data, regular
//! files are always ready) and the socket bridge (zero-timeout host `poll`). When
//! nothing is ready and the guest may block, the machine rewinds across the ecall and
//! stops, handing control back to the host until input or timers arrive. A blocking
//! `epoll_pwait` over socket fds instead waits in a bounded host `poll`.

use friscy::fs::FileKind;
use friscy::machine::Machine;
use friscy_common_linux::errno::Errno;
use friscy_common_linux::{EpollEvents, EpollOp, PollEvents, ECALL_INSN_SIZE};
use hashbrown::HashMap;

use super::{arg, SysOutcome, SysResult};
use crate::Runtime;

/// Epoll fds come from their own range, disjoint from VFS and socket fds.
const EPOLL_FD_BASE: i32 = 2000;

/// Clamp on the number of pollfd entries walked.
const MAX_POLL_FDS: u64 = 64;

/// Cap on a single blocking host `poll` so a stop request is observed promptly.
const HOST_POLL_SLICE_MS: i32 = 1000;

/// One watched fd in an epoll instance.
#[derive(Clone, Copy)]
pub struct EpollInterest {
    pub events: EpollEvents,
    /// Opaque caller cookie, returned verbatim.
    pub data: u64,
}

#[derive(Default)]
pub struct EpollInstance {
    interests: HashMap<i32, EpollInterest>,
}

pub struct EpollTable {
    instances: HashMap<i32, EpollInstance>,
    next_fd: i32,
}

impl Default for EpollTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EpollTable {
    pub fn new() -> Self {
        Self {
            instances: HashMap::new(),
            next_fd: EPOLL_FD_BASE,
        }
    }

    pub fn is_epoll_fd(&self, fd: i32) -> bool {
        self.instances.contains_key(&fd)
    }

    pub fn close(&mut self, fd: i32) {
        self.instances.remove(&fd);
    }
}

pub fn sys_ppoll(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fds_addr = arg(m, 0);
    let nfds = arg(m, 1).min(MAX_POLL_FDS);
    let timeout_addr = arg(m, 2);

    if nfds == 0 {
        return Ok(SysResult::Value(0));
    }

    let mut ready = 0u64;

    for i in 0..nfds {
        let entry_addr = fds_addr + i * 8;
        let fd = m.read_i32(entry_addr)?;
        let events = PollEvents::from_bits_retain(m.read_u16(entry_addr + 4)?);
        let mut revents = PollEvents::empty();

        if fd == 0 && events.contains(PollEvents::IN) && !rt.vfs.is_open(0) {
            if rt.io.has_stdin_data() {
                revents |= PollEvents::IN;
            } else if rt.io.is_eof() {
                revents |= PollEvents::HUP;
            }
        } else if fd == 1 || fd == 2 {
            revents |= events & PollEvents::OUT;
        } else if fd >= 0 && (rt.vfs.is_open(fd) || rt.net.is_socket_fd(fd)) {
            // VFS and socket fds report ready; a blocked reader will find out on the
            // actual read.
            revents |= events & PollEvents::IN;
        }

        if !revents.is_empty() {
            ready += 1;
        }
        m.write_u16(entry_addr + 6, revents.bits())?;
    }

    if ready > 0 {
        return Ok(SysResult::Value(ready));
    }

    // A present zero timeout returns immediately.
    if timeout_addr != 0 {
        let sec = m.read_i64(timeout_addr)?;
        let nsec = m.read_i64(timeout_addr + 8)?;
        if sec == 0 && nsec == 0 {
            return Ok(SysResult::Value(0));
        }
    }

    // Nothing ready. Even with no stdin interest the machine yields to the host here:
    // the shell polls for signals after a fork cycle, and spinning would burn billions
    // of instructions.
    rt.io.set_waiting_for_stdin(true);
    m.set_pc(m.pc() - ECALL_INSN_SIZE);
    m.stop();
    Ok(SysResult::NoReturn)
}

pub fn sys_epoll_create1(rt: &mut Runtime, _m: &mut dyn Machine) -> SysOutcome {
    let fd = rt.epolls.next_fd;
    rt.epolls.next_fd += 1;
    rt.epolls.instances.insert(fd, EpollInstance::default());
    Ok(SysResult::Value(fd as u64))
}

pub fn sys_epoll_ctl(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let epfd = arg(m, 0) as i32;
    let op = EpollOp::try_from(arg(m, 1) as u32).map_err(|_| Errno::EINVAL)?;
    let fd = arg(m, 2) as i32;
    let event_addr = arg(m, 3);

    let instance = rt.epolls.instances.get_mut(&epfd).ok_or(Errno::EBADF)?;
    match op {
        EpollOp::Add | EpollOp::Mod => {
            // struct epoll_event { u32 events; pad; u64 data } = 16 bytes.
            let events = EpollEvents::from_bits_retain(m.read_u32(event_addr)?);
            let data = m.read_u64(event_addr + 8)?;
            instance.interests.insert(fd, EpollInterest { events, data });
        }
        EpollOp::Del => {
            instance.interests.remove(&fd);
        }
    }
    Ok(SysResult::Value(0))
}

fn socket_ready(rt: &Runtime, fd: i32, interest: EpollEvents) -> EpollEvents {
    let mut revents = EpollEvents::empty();
    let Some(native) = rt.net.native_fd(fd) else {
        return revents;
    };
    let mut pfd = libc::pollfd {
        fd: native,
        events: 0,
        revents: 0,
    };
    if interest.contains(EpollEvents::IN) {
        pfd.events |= libc::POLLIN;
    }
    if interest.contains(EpollEvents::OUT) {
        pfd.events |= libc::POLLOUT;
    }
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    if rc > 0 {
        if pfd.revents & libc::POLLIN != 0 {
            revents |= EpollEvents::IN;
        }
        if pfd.revents & libc::POLLOUT != 0 {
            revents |= EpollEvents::OUT;
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
            revents |= EpollEvents::ERR;
        }
    }
    revents
}

fn scan_interests(rt: &Runtime, epfd: i32, max_events: usize) -> Vec<(EpollEvents, u64)> {
    let Some(instance) = rt.epolls.instances.get(&epfd) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for (&fd, interest) in &instance.interests {
        if out.len() >= max_events {
            break;
        }
        let mut revents = EpollEvents::empty();
        if fd == 0 {
            if rt.io.has_stdin_data() && interest.events.contains(EpollEvents::IN) {
                revents |= EpollEvents::IN;
            }
        } else if fd == 1 || fd == 2 {
            revents |= interest.events & EpollEvents::OUT;
        } else if rt.net.is_socket_fd(fd) {
            revents = socket_ready(rt, fd, interest.events) & (interest.events | EpollEvents::ERR);
        } else if let Some(node) = rt.vfs.node_of(fd) {
            let node = node.read().unwrap();
            if node.kind == FileKind::Fifo {
                if interest.events.contains(EpollEvents::IN) && !node.content.is_empty() {
                    revents |= EpollEvents::IN;
                }
                revents |= interest.events & EpollEvents::OUT;
            } else {
                revents |= interest.events & (EpollEvents::IN | EpollEvents::OUT);
            }
        }
        if !revents.is_empty() {
            out.push((revents, interest.data));
        }
    }
    out
}

pub fn sys_epoll_pwait(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let epfd = arg(m, 0) as i32;
    let events_addr = arg(m, 1);
    let max_events = (arg(m, 2) as usize).min(256);
    let timeout = arg(m, 3) as i64 as i32;

    if !rt.epolls.instances.contains_key(&epfd) {
        return Err(Errno::EBADF);
    }

    let write_events =
        |m: &mut dyn Machine, ready: &[(EpollEvents, u64)]| -> Result<(), Errno> {
            for (i, (revents, data)) in ready.iter().enumerate() {
                let off = events_addr + i as u64 * 16;
                m.write_u32(off, revents.bits())?;
                m.write_u32(off + 4, 0)?;
                m.write_u64(off + 8, *data)?;
            }
            Ok(())
        };

    let ready = scan_interests(rt, epfd, max_events);
    if !ready.is_empty() {
        write_events(m, &ready)?;
        return Ok(SysResult::Value(ready.len() as u64));
    }
    if timeout == 0 {
        return Ok(SysResult::Value(0));
    }

    // Blocking wait. With sockets registered, wait inside a bounded host poll so
    // network traffic can wake the guest; otherwise yield the machine to the host and
    // let fresh stdin (or timers) resume it.
    let socket_natives: Vec<i32> = rt
        .epolls
        .instances
        .get(&epfd)
        .map(|inst| {
            inst.interests
                .keys()
                .filter_map(|&fd| rt.net.native_fd(fd))
                .collect()
        })
        .unwrap_or_default();

    if !socket_natives.is_empty() {
        let mut pfds: Vec<libc::pollfd> = socket_natives
            .iter()
            .map(|&fd| libc::pollfd {
                fd,
                events: libc::POLLIN | libc::POLLOUT,
                revents: 0,
            })
            .collect();
        let wait_ms = if timeout < 0 {
            HOST_POLL_SLICE_MS
        } else {
            timeout.min(HOST_POLL_SLICE_MS)
        };
        unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, wait_ms) };
        let ready = scan_interests(rt, epfd, max_events);
        write_events(m, &ready)?;
        return Ok(SysResult::Value(ready.len() as u64));
    }

    rt.io.set_waiting_for_stdin(true);
    m.set_pc(m.pc() - ECALL_INSN_SIZE);
    m.stop();
    Ok(SysResult::NoReturn)
}
