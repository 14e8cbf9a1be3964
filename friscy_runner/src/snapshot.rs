//! Whole-machine snapshots for flat-arena configurations.
//!
//! ```text
//! u64 magic ("FYSCRISF")
//! u32 version (=1)
//! u32 register_block_size
//! u64 arena_size
//! u64 instruction_counter
//! byte[register_block_size] registers
//! byte[arena_size] arena
//! ```
//!
//! Restore validates magic, version, and that both sizes match the live machine
//! exactly; the saved instruction counter is recorded but the live counter is reset
//! rather than restored.

use std::io::{Read, Write};
use std::path::Path;

use friscy::machine::Machine;

pub const SNAPSHOT_MAGIC: u64 = 0x4653_5249_5343_5946; // "FYSCRISF"
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("machine has no flat memory arena")]
    NoArena,
    #[error("invalid snapshot magic")]
    BadMagic,
    #[error("unsupported snapshot version {0}")]
    BadVersion(u32),
    #[error("register block size mismatch: file {file}, machine {machine}")]
    RegisterSizeMismatch { file: u32, machine: u32 },
    #[error("arena size mismatch: file {file}, machine {machine}")]
    ArenaSizeMismatch { file: u64, machine: u64 },
}

pub fn save(m: &dyn Machine, path: &Path) -> Result<(), SnapshotError> {
    let arena = m.arena().ok_or(SnapshotError::NoArena)?;
    let registers = m.register_file_bytes();

    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    out.write_all(&SNAPSHOT_MAGIC.to_le_bytes())?;
    out.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
    out.write_all(&(registers.len() as u32).to_le_bytes())?;
    out.write_all(&(arena.len() as u64).to_le_bytes())?;
    out.write_all(&m.instruction_counter().to_le_bytes())?;
    out.write_all(&registers)?;
    out.write_all(arena)?;
    out.flush()?;
    log::debug!(
        "snapshot saved: {} register bytes, {} arena bytes",
        registers.len(),
        arena.len()
    );
    Ok(())
}

pub fn restore(m: &mut dyn Machine, path: &Path) -> Result<(), SnapshotError> {
    let mut input = std::io::BufReader::new(std::fs::File::open(path)?);

    let mut u64buf = [0u8; 8];
    let mut u32buf = [0u8; 4];

    input.read_exact(&mut u64buf)?;
    if u64::from_le_bytes(u64buf) != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    input.read_exact(&mut u32buf)?;
    let version = u32::from_le_bytes(u32buf);
    if version != SNAPSHOT_VERSION {
        return Err(SnapshotError::BadVersion(version));
    }
    input.read_exact(&mut u32buf)?;
    let regs_size = u32::from_le_bytes(u32buf);
    input.read_exact(&mut u64buf)?;
    let arena_size = u64::from_le_bytes(u64buf);
    input.read_exact(&mut u64buf)?;
    let _saved_counter = u64::from_le_bytes(u64buf);

    let expected_regs = m.register_file_bytes().len() as u32;
    if regs_size != expected_regs {
        return Err(SnapshotError::RegisterSizeMismatch {
            file: regs_size,
            machine: expected_regs,
        });
    }
    let expected_arena = m.arena_size();
    if arena_size != expected_arena {
        return Err(SnapshotError::ArenaSizeMismatch {
            file: arena_size,
            machine: expected_arena,
        });
    }

    let mut registers = vec![0u8; regs_size as usize];
    input.read_exact(&mut registers)?;
    if !m.restore_register_file(&registers) {
        return Err(SnapshotError::RegisterSizeMismatch {
            file: regs_size,
            machine: expected_regs,
        });
    }
    let arena = m.arena_mut().ok_or(SnapshotError::NoArena)?;
    input.read_exact(arena)?;

    m.reset_instruction_counter();
    log::debug!("snapshot restored: {regs_size} register bytes, {arena_size} arena bytes");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use friscy::machine::mock::MockMachine;
    use friscy::machine::reg;

    #[test]
    fn round_trip_is_exact() {
        let dir = std::env::temp_dir().join("friscy-snapshot-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("machine.snap");

        let mut m = MockMachine::new(1 << 16);
        {
            let mm: &mut dyn Machine = &mut m;
            mm.set_reg(reg::SP, 0x1234_5678);
            mm.set_pc(0x4000);
            mm.write_mem(0x100, b"snapshot payload").unwrap();
        }
        save(&m, &path).unwrap();

        let mut fresh = MockMachine::new(1 << 16);
        {
            let mm: &mut dyn Machine = &mut fresh;
            restore(mm, &path).unwrap();
            assert_eq!(mm.reg(reg::SP), 0x1234_5678);
            assert_eq!(mm.pc(), 0x4000);
            let mut buf = [0u8; 16];
            mm.read_mem(0x100, &mut buf).unwrap();
            assert_eq!(&buf, b"snapshot payload");
            assert_eq!(mm.instruction_counter(), 0);
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn size_mismatch_is_refused() {
        let dir = std::env::temp_dir().join("friscy-snapshot-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mismatch.snap");

        let m = MockMachine::new(1 << 16);
        save(&m, &path).unwrap();

        let mut bigger = MockMachine::new(1 << 17);
        let mm: &mut dyn Machine = &mut bigger;
        assert!(matches!(
            restore(mm, &path),
            Err(SnapshotError::ArenaSizeMismatch { .. })
        ));
        std::fs::remove_file(&path).unwrap();
    }
}
