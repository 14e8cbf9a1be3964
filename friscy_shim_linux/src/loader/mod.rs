//! ELF loading and initial-stack construction.

pub mod elf;
pub mod stack;

pub use elf::{parse_elf, ElfInfo, ElfKind, ElfLoaderError};
