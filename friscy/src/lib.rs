// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! # friscy
//!
//! > A user-space Linux syscall emulation layer for an embedded RISC-V 64 machine.
//!
//! This crate provides the services that the Linux shim sits on: the [`machine::Machine`]
//! seam below (implemented by the embedding RISC-V interpreter), the [`io::HostIo`] bridge
//! shared with the host UI, and the tar-backed [`fs::VirtualFs`] that serves the guest's
//! file descriptors.
//!
//! The actual syscall semantics live in the `friscy_shim_linux` crate; the launcher and
//! execution loop live in `friscy_runner`.

pub mod fs;
pub mod io;
pub mod machine;
pub mod path;

// Public utilities that might be used in other friscy crates.
pub mod utils;
