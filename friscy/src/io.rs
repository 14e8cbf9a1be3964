// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The host I/O bridge shared between the UI thread and the execution thread.
//!
//! The UI side pushes stdin bytes and flips the running flag; the syscall handlers drain
//! the byte queue (never blocking) and the execution loop parks on the condition variable
//! when the guest is waiting for input. This is the only state touched from both host
//! threads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Condvar, Mutex};

/// Result of a non-blocking stdin read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StdinRead {
    /// `n` bytes were copied into the buffer.
    Data(usize),
    /// The queue is empty and EOF has been signalled.
    Eof,
    /// The queue is empty but more input may still arrive.
    WouldBlock,
}

/// Thread-safe stdin queue, terminal size and run/wait flags.
pub struct HostIo {
    stdin: Mutex<VecDeque<u8>>,
    stdin_cv: Condvar,
    eof: AtomicBool,
    running: AtomicBool,
    waiting_for_stdin: AtomicBool,
    term_cols: AtomicU16,
    term_rows: AtomicU16,
}

impl Default for HostIo {
    fn default() -> Self {
        Self::new()
    }
}

impl HostIo {
    pub fn new() -> Self {
        Self {
            stdin: Mutex::new(VecDeque::new()),
            stdin_cv: Condvar::new(),
            eof: AtomicBool::new(false),
            running: AtomicBool::new(false),
            waiting_for_stdin: AtomicBool::new(false),
            term_cols: AtomicU16::new(80),
            term_rows: AtomicU16::new(24),
        }
    }

    /// Append bytes to the stdin queue and wake a parked execution thread.
    pub fn push_stdin(&self, bytes: &[u8]) {
        {
            let mut q = self.stdin.lock().unwrap();
            q.extend(bytes.iter().copied());
        }
        self.stdin_cv.notify_one();
    }

    /// Copy up to `buf.len()` bytes from the head of the queue without blocking.
    pub fn try_read_stdin(&self, buf: &mut [u8]) -> StdinRead {
        let mut q = self.stdin.lock().unwrap();
        if q.is_empty() {
            return if self.eof.load(Ordering::Relaxed) {
                StdinRead::Eof
            } else {
                StdinRead::WouldBlock
            };
        }
        let n = buf.len().min(q.len());
        for (dst, b) in buf.iter_mut().zip(q.drain(..n)) {
            *dst = b;
        }
        StdinRead::Data(n)
    }

    pub fn has_stdin_data(&self) -> bool {
        !self.stdin.lock().unwrap().is_empty()
    }

    pub fn is_eof(&self) -> bool {
        self.eof.load(Ordering::Relaxed)
    }

    /// Signal end of input and wake a parked execution thread.
    pub fn set_eof(&self) {
        self.eof.store(true, Ordering::Relaxed);
        self.stdin_cv.notify_one();
    }

    /// Park the calling thread until stdin has data, EOF is signalled, or the running flag
    /// is cleared.
    pub fn wait_for_stdin(&self) {
        let q = self.stdin.lock().unwrap();
        let _unused = self
            .stdin_cv
            .wait_while(q, |q| {
                q.is_empty() && !self.eof.load(Ordering::Relaxed) && self.is_running()
            })
            .unwrap();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flip the running flag. Clearing it wakes any thread parked in
    /// [`Self::wait_for_stdin`].
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
        if !running {
            self.stdin_cv.notify_all();
        }
    }

    pub fn set_waiting_for_stdin(&self, waiting: bool) {
        self.waiting_for_stdin.store(waiting, Ordering::SeqCst);
    }

    pub fn is_waiting_for_stdin(&self) -> bool {
        self.waiting_for_stdin.load(Ordering::SeqCst)
    }

    /// Clear the waiting flag, returning whether it was set.
    pub fn take_waiting_for_stdin(&self) -> bool {
        self.waiting_for_stdin.swap(false, Ordering::SeqCst)
    }

    pub fn set_terminal_size(&self, cols: u16, rows: u16) {
        self.term_cols.store(cols, Ordering::Relaxed);
        self.term_rows.store(rows, Ordering::Relaxed);
    }

    /// Current (cols, rows), as reported to the guest via `TIOCGWINSZ`.
    pub fn terminal_size(&self) -> (u16, u16) {
        (
            self.term_cols.load(Ordering::Relaxed),
            self.term_rows.load(Ordering::Relaxed),
        )
    }

    /// Clear all state for a fresh session.
    pub fn reset(&self) {
        self.stdin.lock().unwrap().clear();
        self.eof.store(false, Ordering::Relaxed);
        self.running.store(false, Ordering::SeqCst);
        self.waiting_for_stdin.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn read_drains_from_the_head() {
        let io = HostIo::new();
        io.push_stdin(b"hello");
        let mut buf = [0u8; 3];
        assert_eq!(io.try_read_stdin(&mut buf), StdinRead::Data(3));
        assert_eq!(&buf, b"hel");
        let mut rest = [0u8; 8];
        assert_eq!(io.try_read_stdin(&mut rest), StdinRead::Data(2));
        assert_eq!(&rest[..2], b"lo");
        assert_eq!(io.try_read_stdin(&mut rest), StdinRead::WouldBlock);
    }

    #[test]
    fn eof_after_drain() {
        let io = HostIo::new();
        io.push_stdin(b"x");
        io.set_eof();
        let mut buf = [0u8; 4];
        assert_eq!(io.try_read_stdin(&mut buf), StdinRead::Data(1));
        assert_eq!(io.try_read_stdin(&mut buf), StdinRead::Eof);
    }

    #[test]
    fn wait_wakes_on_push() {
        let io = Arc::new(HostIo::new());
        io.set_running(true);
        let waiter = {
            let io = Arc::clone(&io);
            std::thread::spawn(move || io.wait_for_stdin())
        };
        // Give the waiter a moment to park, then wake it with data.
        std::thread::sleep(std::time::Duration::from_millis(10));
        io.push_stdin(b"y");
        waiter.join().unwrap();
        assert!(io.has_stdin_data());
    }

    #[test]
    fn wait_wakes_on_stop() {
        let io = Arc::new(HostIo::new());
        io.set_running(true);
        let waiter = {
            let io = Arc::clone(&io);
            std::thread::spawn(move || io.wait_for_stdin())
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        io.set_running(false);
        waiter.join().unwrap();
    }
}
