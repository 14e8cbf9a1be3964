// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The seam to the embedding RISC-V 64 interpreter.
//!
//! friscy treats the interpreter as a black box behind the [`Machine`] trait: 32 integer
//! registers plus the PC, guest memory with 4 KiB page attributes, a run function that
//! hands every `ecall` back to the caller, and the interpreter's built-in `brk` and
//! anonymous-`mmap` bump allocators.
//!
//! Page-permission violations surface as [`MachineError::PageFault`] carrying the faulting
//! address, so callers (the ELF loader, the execution loop) can repair the page and retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod mock;

/// RISC-V integer register numbers used by the syscall ABI.
pub mod reg {
    /// Hardwired zero.
    pub const ZERO: usize = 0;
    /// Return address.
    pub const RA: usize = 1;
    /// Stack pointer.
    pub const SP: usize = 2;
    /// Thread pointer (TLS base).
    pub const TP: usize = 4;
    /// First syscall argument / syscall result.
    pub const A0: usize = 10;
    pub const A1: usize = 11;
    pub const A2: usize = 12;
    pub const A3: usize = 13;
    pub const A4: usize = 14;
    pub const A5: usize = 15;
    /// Syscall number.
    pub const A7: usize = 17;
}

/// Guest page size. Page attributes are managed at this granularity.
pub const PAGE_SIZE: u64 = 4096;

/// Mask selecting the page base of a guest address.
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// R/W/X attributes of one guest page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageAttributes {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl PageAttributes {
    /// All three permissions set.
    pub const RWX: Self = Self {
        read: true,
        write: true,
        exec: true,
    };

    /// Read and write, no execute.
    pub const RW: Self = Self {
        read: true,
        write: true,
        exec: false,
    };
}

/// Errors surfaced by the machine.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MachineError {
    /// A memory access violated the page attributes. The address is the first byte that
    /// faulted; the caller may promote the containing page and retry.
    #[error("guest page fault at {addr:#x}")]
    PageFault { addr: u64 },
    /// A memory access fell outside the guest address space.
    #[error("guest access out of range at {addr:#x}")]
    OutOfRange { addr: u64 },
    /// Anything the interpreter cannot recover from (illegal instruction, internal error).
    #[error("machine fault: {0}")]
    Fatal(String),
}

/// Why [`Machine::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The guest executed an `ecall`; the PC already points past it. The caller dispatches
    /// the syscall and calls `run` again.
    Ecall,
    /// The machine was stopped, either by a syscall handler or by a [`StopRequester`].
    Stopped,
    /// The instruction budget was exhausted without a stop.
    InstructionLimit,
}

/// A cloneable, thread-safe handle that asks a running machine to stop.
///
/// The host UI thread holds one of these so `stop()` can interrupt the execution thread
/// without taking any lock.
#[derive(Clone, Default)]
pub struct StopRequester {
    flag: Arc<AtomicBool>,
}

impl StopRequester {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the machine to stop at the next opportunity.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// The interface the embedding RISC-V interpreter must provide.
///
/// The contract mirrors a single-hart RV64 interpreter with an "encompassing arena":
/// guest physical memory is one host-owned byte range, and guest addresses are masked
/// into it. `arena`/`arena_mut` expose that range for snapshotting and for the ELF
/// loader's fast path; an implementation without a flat arena may return `None`, but
/// snapshots are then unavailable.
pub trait Machine: Send {
    // --- Registers ---

    /// Read integer register `r` (0..32). Register 0 always reads zero.
    fn reg(&self, r: usize) -> u64;
    /// Write integer register `r`. Writes to register 0 are ignored.
    fn set_reg(&mut self, r: usize, value: u64);
    fn pc(&self) -> u64;
    /// Set the PC ("jump"). The next `run` resumes here.
    fn set_pc(&mut self, pc: u64);

    // --- Memory ---

    fn read_mem(&self, addr: u64, buf: &mut [u8]) -> Result<(), MachineError>;
    fn write_mem(&mut self, addr: u64, buf: &[u8]) -> Result<(), MachineError>;
    fn fill_mem(&mut self, addr: u64, value: u8, len: u64) -> Result<(), MachineError>;

    fn page_attributes(&self, addr: u64) -> PageAttributes;
    /// Set the attributes of every page overlapping `[addr, addr + len)`.
    fn set_page_attributes(&mut self, addr: u64, len: u64, attr: PageAttributes);

    /// The flat backing arena, if the interpreter is configured with one.
    fn arena(&self) -> Option<&[u8]>;
    fn arena_mut(&mut self) -> Option<&mut [u8]>;
    /// Size of the backing arena in bytes (a power of two).
    fn arena_size(&self) -> u64;

    // --- Built-in allocators ---

    /// The interpreter's `brk` handler: accept or clamp `addr`, returning the new break.
    fn brk(&mut self, addr: u64) -> u64;
    /// Bump-allocate `len` bytes from the mmap region, returning the base address.
    /// `len == 0` is not an allocation; use [`Self::mmap_frontier`] to probe.
    fn mmap_allocate(&mut self, len: u64) -> u64;
    /// The current mmap allocation frontier (the address the next allocation would get).
    fn mmap_frontier(&self) -> u64;
    /// Move the mmap frontier forward to at least `addr` (used by `MAP_FIXED` mappings
    /// beyond the frontier). A frontier already past `addr` is left unchanged.
    fn mmap_advance_to(&mut self, addr: u64);
    /// Release a mapping. Bump allocators may only reclaim a range ending exactly at
    /// the frontier; anything else is a no-op.
    fn mmap_release(&mut self, addr: u64, len: u64);

    // --- Execution ---

    /// Run guest code for up to `max_instructions`.
    fn run(&mut self, max_instructions: u64) -> Result<StopReason, MachineError>;
    /// Stop the machine; the current or next `run` returns [`StopReason::Stopped`].
    fn stop(&mut self);
    /// Whether a stop is pending (set by [`Self::stop`] or a [`StopRequester`]).
    fn stop_requested(&self) -> bool;
    /// Clear a pending stop so `run` can resume.
    fn clear_stop(&mut self);
    /// A handle that stops this machine from another thread.
    fn stop_requester(&self) -> StopRequester;

    fn instruction_counter(&self) -> u64;
    fn reset_instruction_counter(&mut self);

    // --- Register file as bytes (snapshot support) ---

    /// The raw register file, as an opaque byte block.
    fn register_file_bytes(&self) -> Vec<u8>;
    /// Restore a register file previously produced by [`Self::register_file_bytes`].
    /// Returns false if `bytes` has the wrong length for this machine.
    fn restore_register_file(&mut self, bytes: &[u8]) -> bool;
}

impl<'m> dyn Machine + 'm {
    // Typed memory helpers layered on the byte-level primitives. These are the accessors
    // the syscall handlers use for guest structs and strings.

    pub fn read_u16(&self, addr: u64) -> Result<u16, MachineError> {
        let mut b = [0u8; 2];
        self.read_mem(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MachineError> {
        let mut b = [0u8; 4];
        self.read_mem(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MachineError> {
        let mut b = [0u8; 8];
        self.read_mem(addr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn read_i32(&self, addr: u64) -> Result<i32, MachineError> {
        Ok(self.read_u32(addr)? as i32)
    }

    pub fn read_i64(&self, addr: u64) -> Result<i64, MachineError> {
        Ok(self.read_u64(addr)? as i64)
    }

    pub fn write_u16(&mut self, addr: u64, value: u16) -> Result<(), MachineError> {
        self.write_mem(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), MachineError> {
        self.write_mem(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), MachineError> {
        self.write_mem(addr, &value.to_le_bytes())
    }

    pub fn write_i32(&mut self, addr: u64, value: i32) -> Result<(), MachineError> {
        self.write_mem(addr, &value.to_le_bytes())
    }

    pub fn write_i64(&mut self, addr: u64, value: i64) -> Result<(), MachineError> {
        self.write_mem(addr, &value.to_le_bytes())
    }

    /// Read a NUL-terminated guest string of at most `max` bytes.
    pub fn read_cstring(&self, addr: u64, max: usize) -> Result<String, MachineError> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        let mut pos = addr;
        while out.len() < max {
            let want = chunk.len().min(max - out.len());
            self.read_mem(pos, &mut chunk[..want])?;
            if let Some(nul) = chunk[..want].iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.extend_from_slice(&chunk[..want]);
            pos += want as u64;
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}
