//! The socket bridge: guest socket fds backed by real host sockets.
//!
//! Guest socket fds live in their own range (≥ [`SOCKET_FD_BASE`]) so they can never
//! collide with VFS fds. Each entry pairs the guest-visible state (domain, type,
//! non-blocking flag) with a native host socket; data calls translate straight into the
//! corresponding host calls via `libc`.

use friscy::machine::Machine;
use friscy_common_linux::errno::Errno;
use hashbrown::HashMap;

use super::{arg, SysOutcome, SysResult, MAX_IO_CHUNK};
use crate::Runtime;

/// First guest socket fd; disjoint from VFS fds.
pub const SOCKET_FD_BASE: i32 = 1000;

const AF_INET: i32 = 2;
const AF_INET6: i32 = 10;
const SOCK_STREAM: i32 = 1;
const SOCK_DGRAM: i32 = 2;
const SOCK_NONBLOCK: i32 = 0x800;
const SOCK_CLOEXEC: i32 = 0x80000;
const SOL_SOCKET: i32 = 1;
const SO_ERROR: i32 = 4;

/// One guest socket.
pub struct SocketEntry {
    pub fd: i32,
    pub domain: i32,
    pub ty: i32,
    pub protocol: i32,
    pub connected: bool,
    pub listening: bool,
    pub nonblocking: bool,
    pub native_fd: i32,
}

/// All live guest sockets.
pub struct NetworkContext {
    sockets: HashMap<i32, SocketEntry>,
    next_fd: i32,
}

impl Default for NetworkContext {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkContext {
    pub fn new() -> Self {
        Self {
            sockets: HashMap::new(),
            next_fd: SOCKET_FD_BASE,
        }
    }

    pub fn is_socket_fd(&self, fd: i32) -> bool {
        fd >= SOCKET_FD_BASE && self.sockets.contains_key(&fd)
    }

    pub fn native_fd(&self, fd: i32) -> Option<i32> {
        self.sockets.get(&fd).map(|s| s.native_fd)
    }

    pub fn is_nonblocking(&self, fd: i32) -> bool {
        self.sockets.get(&fd).is_some_and(|s| s.nonblocking)
    }

    fn install(&mut self, domain: i32, ty: i32, protocol: i32, native_fd: i32) -> i32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.sockets.insert(
            fd,
            SocketEntry {
                fd,
                domain,
                ty,
                protocol,
                connected: false,
                listening: false,
                nonblocking: false,
                native_fd,
            },
        );
        fd
    }
}

fn host_errno() -> Errno {
    Errno::from_host_neg(-i64::from(
        std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL),
    ))
}

/// Read a guest sockaddr into a host-side buffer.
fn read_sockaddr(m: &dyn Machine, addr: u64, len: u32) -> Result<Vec<u8>, Errno> {
    if len < 2 {
        return Err(Errno::EINVAL);
    }
    let len = (len as usize).min(128);
    let mut buf = vec![0u8; len];
    m.read_mem(addr, &mut buf)?;
    Ok(buf)
}

/// Copy a host sockaddr back out to the guest `addr`/`addrlen` pair.
fn write_sockaddr(
    m: &mut dyn Machine,
    addr: u64,
    addrlen_ptr: u64,
    data: &[u8],
) -> Result<(), Errno> {
    if addr == 0 || addrlen_ptr == 0 {
        return Ok(());
    }
    let capacity = m.read_u32(addrlen_ptr)? as usize;
    let n = capacity.min(data.len());
    m.write_mem(addr, &data[..n])?;
    m.write_u32(addrlen_ptr, data.len() as u32)?;
    Ok(())
}

pub fn close_socket(rt: &mut Runtime, fd: i32) {
    if let Some(entry) = rt.net.sockets.remove(&fd) {
        if entry.native_fd >= 0 {
            unsafe { libc::close(entry.native_fd) };
        }
    }
}

pub fn sys_socket(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let domain = arg(m, 0) as i32;
    let raw_type = arg(m, 1) as i32;
    let protocol = arg(m, 2) as i32;

    if domain != AF_INET && domain != AF_INET6 {
        return Err(Errno::EAFNOSUPPORT);
    }
    let nonblocking = raw_type & SOCK_NONBLOCK != 0;
    let ty = raw_type & !(SOCK_NONBLOCK | SOCK_CLOEXEC);
    if ty != SOCK_STREAM && ty != SOCK_DGRAM {
        return Err(Errno::EPROTOTYPE);
    }

    let native_fd = unsafe { libc::socket(domain, ty, protocol) };
    if native_fd < 0 {
        return Err(host_errno());
    }
    let fd = rt.net.install(domain, ty, protocol, native_fd);
    if nonblocking {
        rt.net.sockets.get_mut(&fd).unwrap().nonblocking = true;
        unsafe {
            let flags = libc::fcntl(native_fd, libc::F_GETFL);
            libc::fcntl(native_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
    Ok(SysResult::Value(fd as u64))
}

/// `socketpair`, realized as a connected host pair wrapped in two guest entries.
pub fn sys_socketpair(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let sv_addr = arg(m, 3);
    let mut pair = [0i32; 2];
    let rc = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr())
    };
    if rc < 0 {
        return Err(host_errno());
    }
    let a = rt.net.install(libc::AF_UNIX, SOCK_STREAM, 0, pair[0]);
    let b = rt.net.install(libc::AF_UNIX, SOCK_STREAM, 0, pair[1]);
    m.write_i32(sv_addr, a)?;
    m.write_i32(sv_addr + 4, b)?;
    Ok(SysResult::Value(0))
}

fn native_of(rt: &Runtime, fd: i32) -> Result<i32, Errno> {
    rt.net
        .sockets
        .get(&fd)
        .map(|s| s.native_fd)
        .ok_or(Errno::ENOTSOCK)
}

pub fn sys_bind(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let native = native_of(rt, fd)?;
    let addr = read_sockaddr(m, arg(m, 1), arg(m, 2) as u32)?;
    let rc = unsafe {
        libc::bind(
            native,
            addr.as_ptr().cast::<libc::sockaddr>(),
            addr.len() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(host_errno());
    }
    Ok(SysResult::Value(0))
}

pub fn sys_listen(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let backlog = arg(m, 1) as i32;
    let native = native_of(rt, fd)?;
    let rc = unsafe { libc::listen(native, backlog) };
    if rc < 0 {
        return Err(host_errno());
    }
    // Accept must never wedge the single execution thread.
    unsafe {
        let flags = libc::fcntl(native, libc::F_GETFL);
        libc::fcntl(native, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
    if let Some(entry) = rt.net.sockets.get_mut(&fd) {
        entry.listening = true;
    }
    Ok(SysResult::Value(0))
}

fn do_accept(rt: &mut Runtime, m: &mut dyn Machine, nonblocking: bool) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let addr = arg(m, 1);
    let addrlen_ptr = arg(m, 2);

    let native = native_of(rt, fd)?;
    let mut storage = [0u8; 128];
    let mut len: libc::socklen_t = storage.len() as libc::socklen_t;
    let conn = unsafe {
        libc::accept(
            native,
            storage.as_mut_ptr().cast::<libc::sockaddr>(),
            &mut len,
        )
    };
    if conn < 0 {
        return Err(host_errno());
    }
    let (domain, ty, protocol) = {
        let entry = rt.net.sockets.get(&fd).ok_or(Errno::ENOTSOCK)?;
        (entry.domain, entry.ty, entry.protocol)
    };
    let guest_fd = rt.net.install(domain, ty, protocol, conn);
    if let Some(entry) = rt.net.sockets.get_mut(&guest_fd) {
        entry.connected = true;
        if nonblocking {
            entry.nonblocking = true;
            unsafe {
                let fl = libc::fcntl(conn, libc::F_GETFL);
                libc::fcntl(conn, libc::F_SETFL, fl | libc::O_NONBLOCK);
            }
        }
    }
    write_sockaddr(m, addr, addrlen_ptr, &storage[..len as usize])?;
    Ok(SysResult::Value(guest_fd as u64))
}

/// `accept`: the three-argument form. `a3` is leftover register state from whatever
/// ran before and must not be interpreted.
pub fn sys_accept(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    do_accept(rt, m, false)
}

/// `accept4`: like `accept`, with `SOCK_NONBLOCK` passed through to the new socket.
pub fn sys_accept4(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let flags = arg(m, 3) as i32;
    do_accept(rt, m, flags & SOCK_NONBLOCK != 0)
}

pub fn sys_connect(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let native = native_of(rt, fd)?;
    let addr = read_sockaddr(m, arg(m, 1), arg(m, 2) as u32)?;
    let rc = unsafe {
        libc::connect(
            native,
            addr.as_ptr().cast::<libc::sockaddr>(),
            addr.len() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(host_errno());
    }
    if let Some(entry) = rt.net.sockets.get_mut(&fd) {
        entry.connected = true;
    }
    Ok(SysResult::Value(0))
}

/// `read`/`recv` bytes off a socket into guest memory.
pub fn recv_bytes(
    rt: &mut Runtime,
    m: &mut dyn Machine,
    fd: i32,
    buf_addr: u64,
    count: usize,
) -> SysOutcome {
    let native = native_of(rt, fd)?;
    let mut buf = vec![0u8; count.min(MAX_IO_CHUNK)];
    let n = unsafe { libc::recv(native, buf.as_mut_ptr().cast(), buf.len(), 0) };
    if n < 0 {
        return Err(host_errno());
    }
    m.write_mem(buf_addr, &buf[..n as usize])?;
    Ok(SysResult::Value(n as u64))
}

/// `write`/`send` bytes from the shim to a socket.
pub fn send_bytes(rt: &mut Runtime, fd: i32, buf: &[u8]) -> SysOutcome {
    let native = native_of(rt, fd)?;
    let n = unsafe { libc::send(native, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(host_errno());
    }
    Ok(SysResult::Value(n as u64))
}

pub fn sys_sendto(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let buf_addr = arg(m, 1);
    let len = (arg(m, 2) as usize).min(MAX_IO_CHUNK);
    let dest_addr = arg(m, 4);
    let dest_len = arg(m, 5) as u32;

    let native = native_of(rt, fd)?;
    let mut buf = vec![0u8; len];
    m.read_mem(buf_addr, &mut buf)?;

    let n = if dest_addr != 0 && dest_len >= 2 {
        let dest = read_sockaddr(m, dest_addr, dest_len)?;
        unsafe {
            libc::sendto(
                native,
                buf.as_ptr().cast(),
                buf.len(),
                libc::MSG_NOSIGNAL,
                dest.as_ptr().cast::<libc::sockaddr>(),
                dest.len() as libc::socklen_t,
            )
        }
    } else {
        unsafe { libc::send(native, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL) }
    };
    if n < 0 {
        return Err(host_errno());
    }
    Ok(SysResult::Value(n as u64))
}

pub fn sys_recvfrom(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let buf_addr = arg(m, 1);
    let len = (arg(m, 2) as usize).min(MAX_IO_CHUNK);
    let src_addr = arg(m, 4);
    let src_len_ptr = arg(m, 5);

    let native = native_of(rt, fd)?;
    let mut buf = vec![0u8; len];
    let mut storage = [0u8; 128];
    let mut stor_len: libc::socklen_t = storage.len() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            native,
            buf.as_mut_ptr().cast(),
            buf.len(),
            0,
            storage.as_mut_ptr().cast::<libc::sockaddr>(),
            &mut stor_len,
        )
    };
    if n < 0 {
        return Err(host_errno());
    }
    m.write_mem(buf_addr, &buf[..n as usize])?;
    write_sockaddr(m, src_addr, src_len_ptr, &storage[..stor_len as usize])?;
    Ok(SysResult::Value(n as u64))
}

pub fn sys_getsockopt(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let level = arg(m, 1) as i32;
    let optname = arg(m, 2) as i32;
    let optval = arg(m, 3);
    let optlen_ptr = arg(m, 4);

    native_of(rt, fd)?;
    if level == SOL_SOCKET && optname == SO_ERROR {
        m.write_u32(optval, 0)?;
        if optlen_ptr != 0 {
            m.write_u32(optlen_ptr, 4)?;
        }
        return Ok(SysResult::Value(0));
    }
    Err(Errno::ENOPROTOOPT)
}

pub fn sys_shutdown(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let how = arg(m, 1) as i32;
    let native = native_of(rt, fd)?;
    let rc = unsafe { libc::shutdown(native, how) };
    if rc < 0 {
        return Err(host_errno());
    }
    Ok(SysResult::Value(0))
}

pub fn sys_getsockname(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let addr = arg(m, 1);
    let addrlen_ptr = arg(m, 2);
    let native = native_of(rt, fd)?;
    let mut storage = [0u8; 128];
    let mut len: libc::socklen_t = storage.len() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(native, storage.as_mut_ptr().cast::<libc::sockaddr>(), &mut len)
    };
    if rc < 0 {
        return Err(host_errno());
    }
    write_sockaddr(m, addr, addrlen_ptr, &storage[..len as usize])?;
    Ok(SysResult::Value(0))
}

/// Walk a guest `msghdr`'s iovec: `(iov_addr, iovlen)`.
fn msghdr_iov(m: &dyn Machine, msghdr_addr: u64) -> Result<(u64, u64), Errno> {
    let iov_addr = m.read_u64(msghdr_addr + 16)?;
    let iovlen = m.read_u64(msghdr_addr + 24)?.min(16);
    Ok((iov_addr, iovlen))
}

pub fn sys_sendmsg(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let msghdr_addr = arg(m, 1);
    native_of(rt, fd)?;

    let (iov_addr, iovlen) = msghdr_iov(m, msghdr_addr)?;
    let mut total = 0u64;
    for i in 0..iovlen {
        let base = m.read_u64(iov_addr + i * 16)?;
        let len = (m.read_u64(iov_addr + i * 16 + 8)? as usize).min(MAX_IO_CHUNK);
        if len == 0 {
            continue;
        }
        let mut buf = vec![0u8; len];
        m.read_mem(base, &mut buf)?;
        match send_bytes(rt, fd, &buf)? {
            SysResult::Value(n) => {
                total += n;
                if (n as usize) < len {
                    break;
                }
            }
            SysResult::NoReturn => unreachable!("send_bytes returns a value"),
        }
    }
    Ok(SysResult::Value(total))
}

pub fn sys_recvmsg(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let fd = arg(m, 0) as i32;
    let msghdr_addr = arg(m, 1);
    let native = native_of(rt, fd)?;

    let (iov_addr, iovlen) = msghdr_iov(m, msghdr_addr)?;
    let mut total = 0u64;
    for i in 0..iovlen {
        let base = m.read_u64(iov_addr + i * 16)?;
        let len = (m.read_u64(iov_addr + i * 16 + 8)? as usize).min(MAX_IO_CHUNK);
        if len == 0 {
            continue;
        }
        let mut buf = vec![0u8; len];
        let n = unsafe { libc::recv(native, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n < 0 {
            if total > 0 {
                break;
            }
            return Err(host_errno());
        }
        m.write_mem(base, &buf[..n as usize])?;
        total += n as u64;
        if (n as usize) < len {
            break;
        }
    }
    // No ancillary data: zero msg_controllen and msg_flags.
    m.write_u64(msghdr_addr + 40, 0)?;
    m.write_i32(msghdr_addr + 48, 0)?;
    Ok(SysResult::Value(total))
}
