//! Process, identity, time and signal-stub syscalls, plus the `clone`/`exit`/`futex`
//! entry points that route into the fork state and the thread scheduler.

use friscy::machine::{reg, Machine};
use friscy_common_linux::errno::Errno;
use friscy_common_linux::{
    FutexCmd, Sysinfo, Timespec, FUTEX_CMD_MASK, RLIMIT_NOFILE, RLIMIT_STACK, UTSNAME,
    UTSNAME_FIELD_LEN,
};

use super::{arg, SysOutcome, SysResult};
use crate::fork;
use crate::sched::ThreadExit;
use crate::Runtime;

/// Current host realtime clock as `(sec, nsec)`.
pub fn realtime_now() -> (i64, i64) {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, i64::from(d.subsec_nanos())),
        Err(_) => (0, 0),
    }
}

/// `exit` / `exit_group`.
pub fn sys_exit(rt: &mut Runtime, m: &mut dyn Machine, group: bool) -> SysOutcome {
    let status = arg(m, 0) as i32;

    if !group && !rt.sched.current_is_main() {
        // A non-main thread dies alone; siblings keep running if any are runnable.
        match rt.sched.exit_thread(m) {
            ThreadExit::Switched => return Ok(SysResult::NoReturn),
            ThreadExit::LastThread => {}
        }
    }

    if rt.fork.in_child {
        // The cooperative fork child is done: bring the parent back in place.
        fork::restore_parent(rt, m, status);
        return Ok(SysResult::NoReturn);
    }

    if group {
        rt.sched.exit_all();
    }
    rt.exit_code = Some(status);
    m.stop();
    Ok(SysResult::Value(status as u64))
}

/// `clone`: thread form goes to the scheduler, fork form to the fork state.
pub fn sys_clone(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let flags = friscy_common_linux::CloneFlags::from_bits_retain(arg(m, 0));
    if flags.is_thread() {
        let child_stack = arg(m, 1);
        let parent_tidptr = arg(m, 2);
        let tls = arg(m, 3);
        let child_tidptr = arg(m, 4);
        rt.sched
            .clone_thread(m, flags, child_stack, parent_tidptr, tls, child_tidptr)
    } else {
        fork::clone_fork(rt, m)
    }
}

pub fn sys_futex(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let uaddr = arg(m, 0);
    let op = arg(m, 1) as u32 & FUTEX_CMD_MASK;
    match FutexCmd::try_from(op) {
        Ok(FutexCmd::Wait | FutexCmd::WaitBitset) => {
            let expected = arg(m, 2) as u32;
            rt.sched.futex_wait(m, uaddr, expected)
        }
        Ok(FutexCmd::Wake | FutexCmd::WakeBitset) => {
            let max_wake = arg(m, 2) as u32;
            Ok(SysResult::Value(u64::from(rt.sched.futex_wake(uaddr, max_wake))))
        }
        Err(_) => Err(Errno::ENOSYS),
    }
}

pub fn sys_set_tid_address(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    rt.sched.set_clear_child_tid(arg(m, 0));
    Ok(SysResult::Value(rt.sched.current_tid() as u64))
}

pub fn sys_clock_gettime(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let tp_addr = arg(m, 1);
    let (sec, nsec) = realtime_now();
    let ts = Timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    };
    m.write_i64(tp_addr, ts.tv_sec)?;
    m.write_i64(tp_addr + 8, ts.tv_nsec)?;

    // The busiest syscall in polling loops carries the preemption quantum: the result
    // is written first, then the slot may be switched out.
    m.set_reg(reg::A0, 0);
    rt.sched.charge_time_syscall(m);
    Ok(SysResult::NoReturn)
}

pub fn sys_clock_getres(_rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let res_addr = arg(m, 1);
    if res_addr != 0 {
        m.write_i64(res_addr, 0)?;
        m.write_i64(res_addr + 8, 1_000_000)?; // 1 ms
    }
    Ok(SysResult::Value(0))
}

pub fn sys_getrandom(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let buf_addr = arg(m, 0);
    let count = (arg(m, 1) as usize).min(super::MAX_IO_CHUNK);
    let mut buf = vec![0u8; count];
    rt.rng.fill_bytes(&mut buf);
    m.write_mem(buf_addr, &buf)?;
    Ok(SysResult::Value(count as u64))
}

pub fn sys_uname(_rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let buf_addr = arg(m, 0);
    let mut buf = [0u8; UTSNAME_FIELD_LEN * 6];
    for (i, field) in UTSNAME.iter().enumerate() {
        let bytes = field.as_bytes();
        let len = bytes.len().min(UTSNAME_FIELD_LEN - 1);
        let off = i * UTSNAME_FIELD_LEN;
        buf[off..off + len].copy_from_slice(&bytes[..len]);
    }
    m.write_mem(buf_addr, &buf)?;
    Ok(SysResult::Value(0))
}

pub fn sys_sysinfo(_rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let info = Sysinfo {
        uptime: 100,
        totalram: 256 << 20,
        freeram: 128 << 20,
        procs: 1,
        mem_unit: 1,
        ..Sysinfo::default()
    };
    m.write_mem(arg(m, 0), &info.to_bytes())?;
    Ok(SysResult::Value(0))
}

pub fn sys_nanosleep(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let req_addr = arg(m, 0);
    let tv_sec = m.read_i64(req_addr)?;
    let tv_nsec = m.read_i64(req_addr + 8)?;
    let ms = (tv_sec * 1000 + tv_nsec / 1_000_000).max(1) as u64;

    m.set_reg(reg::A0, 0);
    if rt.sched.yield_now(m) {
        // Another thread runs instead of blocking the whole machine.
        return Ok(SysResult::NoReturn);
    }
    std::thread::sleep(std::time::Duration::from_millis(ms));
    Ok(SysResult::NoReturn)
}

pub fn sys_sched_yield(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    m.set_reg(reg::A0, 0);
    rt.sched.yield_now(m);
    Ok(SysResult::NoReturn)
}

fn rlimit_values(resource: u32) -> (u64, u64) {
    match resource {
        RLIMIT_NOFILE => (1024, 1024),
        RLIMIT_STACK => (8 << 20, 8 << 20),
        _ => (u64::MAX, u64::MAX),
    }
}

pub fn sys_prlimit64(_rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let resource = arg(m, 1) as u32;
    let old_limit = arg(m, 3);
    if old_limit != 0 {
        let (cur, max) = rlimit_values(resource);
        m.write_u64(old_limit, cur)?;
        m.write_u64(old_limit + 8, max)?;
    }
    Ok(SysResult::Value(0))
}

pub fn sys_getrlimit(_rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let resource = arg(m, 0) as u32;
    let rlim_addr = arg(m, 1);
    if rlim_addr != 0 {
        let (cur, max) = rlimit_values(resource);
        m.write_u64(rlim_addr, cur)?;
        m.write_u64(rlim_addr + 8, max)?;
    }
    Ok(SysResult::Value(0))
}

pub fn sys_kill(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let pid = arg(m, 0) as i64;
    if pid <= 1 || pid as i32 == rt.fork.child_pid {
        Ok(SysResult::Value(0))
    } else {
        Err(Errno::ESRCH)
    }
}

pub fn sys_tkill(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    // tkill(tid, sig) / tgkill(tgid, tid, sig): signals are not delivered, but an
    // abort is worth a diagnostic before it is swallowed.
    let sig = if m.reg(reg::A7) == friscy_common_linux::nr::TKILL {
        arg(m, 1)
    } else {
        arg(m, 2)
    };
    if sig == 6 {
        log::warn!("guest tid {} raised SIGABRT", rt.sched.current_tid());
    }
    Ok(SysResult::Value(0))
}

pub fn sys_sched_getparam(_rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    m.write_i32(arg(m, 1), 0)?;
    Ok(SysResult::Value(0))
}

pub fn sys_sched_getaffinity(_rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    m.write_u64(arg(m, 2), 1)?;
    Ok(SysResult::Value(8))
}

pub fn sys_umask(rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    let old = rt.umask;
    rt.umask = arg(m, 0) as u32 & 0o777;
    Ok(SysResult::Value(u64::from(old)))
}

pub fn sys_getresids(_rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    m.write_u32(arg(m, 0), 0)?;
    m.write_u32(arg(m, 1), 0)?;
    m.write_u32(arg(m, 2), 0)?;
    Ok(SysResult::Value(0))
}

pub fn sys_membarrier(_rt: &mut Runtime, m: &mut dyn Machine) -> SysOutcome {
    if arg(m, 0) == 0 {
        // MEMBARRIER_CMD_QUERY: no commands supported.
        Ok(SysResult::Value(0))
    } else {
        Err(Errno::ENOSYS)
    }
}
