// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Auxiliary vector support.

/// Keys of the auxiliary vector entries the initial stack carries for the dynamic
/// linker.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u64)]
pub enum AuxKey {
    /// end of vector
    AT_NULL = 0,
    /// program headers for program
    AT_PHDR = 3,
    /// size of program header entry
    AT_PHENT = 4,
    /// number of program headers
    AT_PHNUM = 5,
    /// system page size
    AT_PAGESZ = 6,
    /// base address of interpreter
    AT_BASE = 7,
    /// entry point of program
    AT_ENTRY = 9,
    /// real uid
    AT_UID = 11,
    /// effective uid
    AT_EUID = 12,
    /// real gid
    AT_GID = 13,
    /// effective gid
    AT_EGID = 14,
    /// string identifying CPU for optimizations
    AT_PLATFORM = 15,
    /// arch dependent hints at CPU capabilities
    AT_HWCAP = 16,
    /// frequency at which times() increments
    AT_CLKTCK = 17,
    /// secure mode boolean
    AT_SECURE = 23,
    /// address of 16 random bytes
    AT_RANDOM = 25,
    /// filename of program
    AT_EXECFN = 31,
}

/// `AT_HWCAP` for an RV64 core with the I, M, A, F, D and C extensions.
pub const RISCV_HWCAP_IMAFDC: u64 = 0x112d;
