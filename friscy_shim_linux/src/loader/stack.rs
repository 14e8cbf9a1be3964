// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Initial-stack construction for the dynamic linker.
//!
//! The layout, growing down from `stack_top` (string block first, vector block last):
//!
//! ```text
//! High addresses
//! ┌──────────────────────────────┐
//! │ platform string "riscv64\0"  │
//! │ 16 random bytes (AT_RANDOM)  │
//! │ executable name string       │
//! │ environment strings          │
//! │ argument strings             │
//! ├──────────────────────────────┤
//! │ auxv pairs, AT_NULL last     │
//! │ envp pointers, NULL last     │
//! │ argv pointers, NULL last     │
//! │ argc                         │ ← returned SP (16-byte aligned)
//! └──────────────────────────────┘
//! Low addresses
//! ```
//!
//! This is exactly the shape musl's `_start_c` walks: `argc` at SP, `argv` right above,
//! `envp` after the argv NULL, auxv after the envp NULL.

use friscy::machine::{Machine, MachineError};
use friscy::utils::rng::FastRng;
use friscy_common_linux::auxv::{AuxKey, RISCV_HWCAP_IMAFDC};

use super::elf::ElfInfo;

const PLATFORM: &[u8] = b"riscv64\0";

/// Build the initial stack and return the resulting SP.
///
/// `interp_base` is the interpreter load base (`AT_BASE`), 0 for static binaries.
pub fn build_initial_stack(
    m: &mut dyn Machine,
    exec_info: &ElfInfo,
    interp_base: u64,
    args: &[String],
    env: &[String],
    rng: &mut FastRng,
    stack_top: u64,
) -> Result<u64, MachineError> {
    let mut sp = stack_top;

    // Phase 1: the string block.
    sp -= PLATFORM.len() as u64;
    sp &= !7;
    let platform_addr = sp;
    m.write_mem(sp, PLATFORM)?;

    sp -= 16;
    let random_addr = sp;
    let mut seed = [0u8; 16];
    rng.fill_bytes(&mut seed);
    m.write_mem(sp, &seed)?;

    let execfn = args.first().map_or("/bin/program", String::as_str);
    sp -= execfn.len() as u64 + 1;
    sp &= !7;
    let execfn_addr = sp;
    m.write_mem(sp, execfn.as_bytes())?;
    m.write_mem(sp + execfn.len() as u64, &[0])?;

    let mut env_ptrs = Vec::with_capacity(env.len());
    for e in env {
        sp -= e.len() as u64 + 1;
        env_ptrs.push(sp);
        m.write_mem(sp, e.as_bytes())?;
        m.write_mem(sp + e.len() as u64, &[0])?;
    }

    let mut arg_ptrs = Vec::with_capacity(args.len());
    for a in args {
        sp -= a.len() as u64 + 1;
        arg_ptrs.push(sp);
        m.write_mem(sp, a.as_bytes())?;
        m.write_mem(sp + a.len() as u64, &[0])?;
    }

    sp &= !15;

    // Phase 2: the auxiliary vector, in the order the dynamic linker scans it.
    let auxv: Vec<(u64, u64)> = vec![
        (AuxKey::AT_PHDR as u64, exec_info.phdr_addr),
        (AuxKey::AT_PHENT as u64, u64::from(exec_info.phdr_size)),
        (AuxKey::AT_PHNUM as u64, u64::from(exec_info.phdr_count)),
        (AuxKey::AT_ENTRY as u64, exec_info.entry_point),
        (AuxKey::AT_BASE as u64, interp_base),
        (AuxKey::AT_PAGESZ as u64, 4096),
        (AuxKey::AT_UID as u64, 0),
        (AuxKey::AT_EUID as u64, 0),
        (AuxKey::AT_GID as u64, 0),
        (AuxKey::AT_EGID as u64, 0),
        (AuxKey::AT_HWCAP as u64, RISCV_HWCAP_IMAFDC),
        (AuxKey::AT_CLKTCK as u64, 100),
        (AuxKey::AT_SECURE as u64, 0),
        (AuxKey::AT_RANDOM as u64, random_addr),
        (AuxKey::AT_EXECFN as u64, execfn_addr),
        (AuxKey::AT_PLATFORM as u64, platform_addr),
        (AuxKey::AT_NULL as u64, 0),
    ];

    // Phase 3: the vector block: argc, argv+NULL, envp+NULL, auxv.
    let auxv_size = auxv.len() as u64 * 16;
    let envp_size = (env_ptrs.len() as u64 + 1) * 8;
    let argv_size = (arg_ptrs.len() as u64 + 1) * 8;
    let argc_size = 8u64;

    sp -= argc_size + argv_size + envp_size + auxv_size;
    sp &= !15;

    let mut cursor = sp;
    m.write_u64(cursor, arg_ptrs.len() as u64)?;
    cursor += 8;

    for ptr in &arg_ptrs {
        m.write_u64(cursor, *ptr)?;
        cursor += 8;
    }
    m.write_u64(cursor, 0)?;
    cursor += 8;

    for ptr in &env_ptrs {
        m.write_u64(cursor, *ptr)?;
        cursor += 8;
    }
    m.write_u64(cursor, 0)?;
    cursor += 8;

    for (key, value) in &auxv {
        m.write_u64(cursor, *key)?;
        cursor += 8;
        m.write_u64(cursor, *value)?;
        cursor += 8;
    }

    Ok(sp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use friscy::machine::mock::MockMachine;

    fn read_stack(m: &dyn Machine, sp: u64) -> (u64, Vec<u64>, Vec<u64>, Vec<(u64, u64)>) {
        let argc = m.read_u64(sp).unwrap();
        let mut cursor = sp + 8;
        let mut argv = Vec::new();
        loop {
            let p = m.read_u64(cursor).unwrap();
            cursor += 8;
            if p == 0 {
                break;
            }
            argv.push(p);
        }
        let mut envp = Vec::new();
        loop {
            let p = m.read_u64(cursor).unwrap();
            cursor += 8;
            if p == 0 {
                break;
            }
            envp.push(p);
        }
        let mut auxv = Vec::new();
        loop {
            let key = m.read_u64(cursor).unwrap();
            let value = m.read_u64(cursor + 8).unwrap();
            cursor += 16;
            auxv.push((key, value));
            if key == 0 {
                break;
            }
        }
        (argc, argv, envp, auxv)
    }

    #[test]
    fn layout_matches_musl_expectations() {
        let mut machine = MockMachine::new(1 << 24);
        let m: &mut dyn Machine = &mut machine;
        let info = ElfInfo {
            entry_point: 0x4abc,
            phdr_addr: 0x40040,
            phdr_size: 56,
            phdr_count: 9,
            ..ElfInfo::default()
        };
        let args = vec!["/bin/sh".to_owned(), "-c".to_owned(), "echo hi".to_owned()];
        let env = vec!["HOME=/root".to_owned(), "TERM=xterm-256color".to_owned()];
        let mut rng = FastRng::from_seed(42);
        let sp = build_initial_stack(m, &info, 0x1800_0000, &args, &env, &mut rng, 0x70_0000).unwrap();

        assert_eq!(sp % 16, 0);
        let (argc, argv, envp, auxv) = read_stack(m, sp);
        assert_eq!(argc, 3);
        assert_eq!(argv.len(), 3);
        assert_eq!(envp.len(), 2);
        assert_eq!(m.read_cstring(argv[0], 64).unwrap(), "/bin/sh");
        assert_eq!(m.read_cstring(argv[2], 64).unwrap(), "echo hi");
        assert_eq!(m.read_cstring(envp[0], 64).unwrap(), "HOME=/root");

        // Auxv entries the dynamic linker relies on.
        let lookup = |key: u64| auxv.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);
        assert_eq!(lookup(3), Some(0x40040)); // AT_PHDR
        assert_eq!(lookup(5), Some(9)); // AT_PHNUM
        assert_eq!(lookup(9), Some(0x4abc)); // AT_ENTRY
        assert_eq!(lookup(7), Some(0x1800_0000)); // AT_BASE
        assert_eq!(lookup(6), Some(4096)); // AT_PAGESZ
        assert_eq!(lookup(16), Some(0x112d)); // AT_HWCAP
        assert_eq!(auxv.last(), Some(&(0, 0)));

        // The platform string sits 8-byte aligned in the string block.
        let platform = lookup(15).unwrap();
        assert_eq!(platform % 8, 0);
        assert_eq!(m.read_cstring(platform, 16).unwrap(), "riscv64");
        // 16 random bytes directly below it.
        assert_eq!(lookup(25), Some(platform - 16));
    }
}
