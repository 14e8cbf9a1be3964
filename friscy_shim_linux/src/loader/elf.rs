//! ELF loader for friscy.
//!
//! Parses 64-bit RISC-V ELF executables and shared objects and loads their `PT_LOAD`
//! segments into guest memory in two passes: first copy data with a page-fault-repair
//! retry loop, then merge page permissions across all segments so a page shared by a
//! code segment (RX) and a data segment (RW) ends up RWX instead of losing execute.

use friscy::machine::{Machine, MachineError, PageAttributes, PAGE_MASK, PAGE_SIZE};
use friscy_common_linux::errno::Errno;
use thiserror::Error;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const EM_RISCV: u16 = 0xf3;

const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;
const PT_PHDR: u32 = 6;

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// ELF object kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElfKind {
    /// `ET_EXEC`: fixed-address executable.
    Exec,
    /// `ET_DYN`: position-independent executable or shared object.
    Dyn,
}

/// Parsed ELF header information.
#[derive(Clone, Debug)]
pub struct ElfInfo {
    pub entry_point: u64,
    /// Virtual address of the program headers in the loaded image.
    pub phdr_addr: u64,
    pub phdr_size: u16,
    pub phdr_count: u16,
    /// Load base applied (0 for `ET_EXEC`).
    pub base_addr: u64,
    /// Has a `PT_INTERP` segment.
    pub is_dynamic: bool,
    /// Path of the dynamic linker, when `is_dynamic`.
    pub interpreter: String,
    pub kind: ElfKind,
}

impl Default for ElfInfo {
    fn default() -> Self {
        Self {
            entry_point: 0,
            phdr_addr: 0,
            phdr_size: 0,
            phdr_count: 0,
            base_addr: 0,
            is_dynamic: false,
            interpreter: String::new(),
            kind: ElfKind::Exec,
        }
    }
}

#[derive(Error, Debug)]
pub enum ElfLoaderError {
    #[error("ELF too small")]
    TooSmall,
    #[error("not an ELF file")]
    BadMagic,
    #[error("not a 64-bit ELF")]
    Not64Bit,
    #[error("not a RISC-V ELF")]
    WrongMachine,
    #[error("ELF is neither executable nor shared object")]
    BadType,
    #[error("segment outside the file image")]
    TruncatedSegment,
    #[error(transparent)]
    Machine(#[from] MachineError),
}

impl From<ElfLoaderError> for Errno {
    fn from(value: ElfLoaderError) -> Self {
        match value {
            ElfLoaderError::Machine(_) => Errno::ENOMEM,
            _ => Errno::ENOEXEC,
        }
    }
}

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

fn u16_at(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(data[off..off + 2].try_into().unwrap())
}

fn u32_at(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

fn u64_at(data: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(data[off..off + 8].try_into().unwrap())
}

struct Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

fn phdrs(data: &[u8]) -> impl Iterator<Item = Phdr> + '_ {
    let phoff = u64_at(data, 32) as usize;
    let phentsize = u16_at(data, 54) as usize;
    let phnum = u16_at(data, 56) as usize;
    (0..phnum).filter_map(move |i| {
        let off = phoff + i * phentsize;
        if off + PHDR_SIZE > data.len() {
            return None;
        }
        Some(Phdr {
            p_type: u32_at(data, off),
            p_flags: u32_at(data, off + 4),
            p_offset: u64_at(data, off + 8),
            p_vaddr: u64_at(data, off + 16),
            p_filesz: u64_at(data, off + 32),
            p_memsz: u64_at(data, off + 40),
        })
    })
}

/// Parse and validate an ELF header.
pub fn parse_elf(data: &[u8]) -> Result<ElfInfo, ElfLoaderError> {
    if data.len() < EHDR_SIZE {
        return Err(ElfLoaderError::TooSmall);
    }
    if data[0..4] != ELF_MAGIC {
        return Err(ElfLoaderError::BadMagic);
    }
    if data[4] != ELFCLASS64 {
        return Err(ElfLoaderError::Not64Bit);
    }
    if u16_at(data, 18) != EM_RISCV {
        return Err(ElfLoaderError::WrongMachine);
    }
    let e_type = u16_at(data, 16);
    let kind = match e_type {
        ET_EXEC => ElfKind::Exec,
        ET_DYN => ElfKind::Dyn,
        _ => return Err(ElfLoaderError::BadType),
    };

    let mut info = ElfInfo {
        entry_point: u64_at(data, 24),
        phdr_size: u16_at(data, 54),
        phdr_count: u16_at(data, 56),
        kind,
        ..ElfInfo::default()
    };

    for phdr in phdrs(data) {
        if phdr.p_type == PT_PHDR {
            info.phdr_addr = phdr.p_vaddr;
        } else if phdr.p_type == PT_INTERP {
            info.is_dynamic = true;
            let start = phdr.p_offset as usize;
            let end = (phdr.p_offset + phdr.p_filesz) as usize;
            if end <= data.len() {
                let raw = &data[start..end];
                let trimmed = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                info.interpreter = String::from_utf8_lossy(&raw[..trimmed]).into_owned();
            }
        }
    }

    // Without PT_PHDR, the headers live inside the first PT_LOAD that covers offset 0.
    if info.phdr_addr == 0 {
        let phoff = u64_at(data, 32);
        for phdr in phdrs(data) {
            if phdr.p_type == PT_LOAD && phdr.p_offset == 0 {
                info.phdr_addr = phdr.p_vaddr + phoff;
                break;
            }
        }
    }

    Ok(info)
}

/// Lowest and highest virtual address touched by any `PT_LOAD` segment.
pub fn get_load_range(data: &[u8]) -> (u64, u64) {
    let mut lo = u64::MAX;
    let mut hi = 0;
    for phdr in phdrs(data) {
        if phdr.p_type == PT_LOAD {
            lo = lo.min(phdr.p_vaddr);
            hi = hi.max(phdr.p_vaddr + phdr.p_memsz);
        }
    }
    (lo, hi)
}

/// Like [`get_load_range`], restricted to writable (`PF_W`) segments. The cooperative
/// fork uses this to bound the data/BSS region it must save and restore.
pub fn get_writable_range(data: &[u8]) -> (u64, u64) {
    let mut lo = u64::MAX;
    let mut hi = 0;
    for phdr in phdrs(data) {
        if phdr.p_type == PT_LOAD && phdr.p_flags & PF_W != 0 {
            lo = lo.min(phdr.p_vaddr);
            hi = hi.max(phdr.p_vaddr + phdr.p_memsz);
        }
    }
    (lo, hi)
}

/// Copy into guest memory with page-fault repair: a write that hits a non-writable page
/// (code pages from a previous binary during execve) promotes the page to RWX and
/// resumes from the faulting page.
fn copy_with_retry(m: &mut dyn Machine, dst: u64, src: &[u8]) -> Result<(), MachineError> {
    let mut offset = 0u64;
    let mut faults = 0u32;
    while (offset as usize) < src.len() {
        match m.write_mem(dst + offset, &src[offset as usize..]) {
            Ok(()) => {
                if faults > 0 {
                    log::debug!("segment copy to {dst:#x} done after {faults} fault repairs");
                }
                return Ok(());
            }
            Err(MachineError::PageFault { addr }) if addr >= dst + offset => {
                faults += 1;
                m.set_page_attributes(addr & PAGE_MASK, PAGE_SIZE, PageAttributes::RWX);
                offset = (addr & PAGE_MASK).saturating_sub(dst).max(offset);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn fill_with_retry(m: &mut dyn Machine, dst: u64, len: u64) -> Result<(), MachineError> {
    let mut offset = 0u64;
    while offset < len {
        match m.fill_mem(dst + offset, 0, len - offset) {
            Ok(()) => return Ok(()),
            Err(MachineError::PageFault { addr }) if addr >= dst + offset => {
                m.set_page_attributes(addr & PAGE_MASK, PAGE_SIZE, PageAttributes::RWX);
                offset = (addr & PAGE_MASK).saturating_sub(dst).max(offset);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Load every `PT_LOAD` segment of `data` into guest memory.
///
/// For `ET_DYN` objects with a nonzero `requested_base`, all segment addresses are
/// shifted so the lowest loadable address lands on `requested_base`. Returns the
/// adjustment applied (0 for `ET_EXEC`).
pub fn load_segments(
    m: &mut dyn Machine,
    data: &[u8],
    requested_base: u64,
) -> Result<u64, ElfLoaderError> {
    let e_type = u16_at(data, 16);
    let base_adjust = if e_type == ET_DYN && requested_base != 0 {
        let (lo, _) = get_load_range(data);
        requested_base - lo
    } else {
        0
    };

    struct Seg {
        vaddr: u64,
        filesz: u64,
        memsz: u64,
        offset: u64,
        flags: u32,
    }
    let segments: Vec<Seg> = phdrs(data)
        .filter(|p| p.p_type == PT_LOAD)
        .map(|p| Seg {
            vaddr: p.p_vaddr + base_adjust,
            filesz: p.p_filesz,
            memsz: p.p_memsz,
            offset: p.p_offset,
            flags: p.p_flags,
        })
        .collect();

    // Pass 1: copy file data and zero the BSS tail of each segment.
    for seg in &segments {
        let file_end = seg.offset.checked_add(seg.filesz).ok_or(ElfLoaderError::TruncatedSegment)?;
        if file_end as usize > data.len() {
            return Err(ElfLoaderError::TruncatedSegment);
        }
        if seg.filesz > 0 {
            copy_with_retry(m, seg.vaddr, &data[seg.offset as usize..file_end as usize])?;
        }
        if seg.memsz > seg.filesz {
            fill_with_retry(m, seg.vaddr + seg.filesz, seg.memsz - seg.filesz)?;
        }

        // In encompassing-arena mode the fast-path loads and stores bypass the page
        // table and hit the arena directly, while the page-level copy above may have
        // landed in page objects that do not alias the arena (stale mappings from
        // before an execve). Write the segment into the arena as well so both views
        // agree.
        if let Some(arena) = m.arena_mut() {
            let mask = arena.len() as u64 - 1;
            let arena_dst = (seg.vaddr & mask) as usize;
            if seg.filesz > 0 && arena_dst + seg.filesz as usize <= arena.len() {
                arena[arena_dst..arena_dst + seg.filesz as usize]
                    .copy_from_slice(&data[seg.offset as usize..file_end as usize]);
            }
            if seg.memsz > seg.filesz {
                let bss_dst = ((seg.vaddr + seg.filesz) & mask) as usize;
                let bss_len = (seg.memsz - seg.filesz) as usize;
                if bss_dst + bss_len <= arena.len() {
                    arena[bss_dst..bss_dst + bss_len].fill(0);
                }
            }
        }
    }

    // Pass 2: per-page permission merge. Each page in the covered range gets the OR of
    // the R/W/X flags of every overlapping segment, so a data segment cannot revoke a
    // code page's execute bit.
    let mut range_lo = u64::MAX;
    let mut range_hi = 0u64;
    for seg in &segments {
        range_lo = range_lo.min(seg.vaddr & PAGE_MASK);
        range_hi = range_hi.max((seg.vaddr + seg.memsz + PAGE_SIZE - 1) & PAGE_MASK);
    }

    let mut page = range_lo;
    while page < range_hi {
        let mut attr = PageAttributes::default();
        let mut touched = false;
        for seg in &segments {
            let seg_end = seg.vaddr + seg.memsz;
            if page < seg_end && page + PAGE_SIZE > seg.vaddr {
                touched = true;
                attr.read |= seg.flags & PF_R != 0;
                attr.write |= seg.flags & PF_W != 0;
                attr.exec |= seg.flags & PF_X != 0;
            }
        }
        if touched {
            m.set_page_attributes(page, PAGE_SIZE, attr);
        }
        page += PAGE_SIZE;
    }

    Ok(base_adjust)
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Synthetic RISC-V ELF images for the loader and execve tests.

    /// One test segment: `(vaddr, file bytes, memsz, flags)`.
    pub struct TestSeg {
        pub vaddr: u64,
        pub data: Vec<u8>,
        pub memsz: u64,
        pub flags: u32,
    }

    /// Build a minimal RV64 ELF with the given type, entry point, segments, and
    /// optional interpreter path.
    pub fn build_elf(e_type: u16, entry: u64, segs: &[TestSeg], interp: Option<&str>) -> Vec<u8> {
        let phnum = segs.len() + usize::from(interp.is_some());
        let phoff = 64usize;
        let mut data_off = phoff + phnum * 56;
        // Keep segment file offsets page-congruent with their vaddrs to stay realistic.
        data_off = (data_off + 0xfff) & !0xfff;

        let mut image = vec![0u8; data_off];
        image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // little-endian
        image[6] = 1; // EV_CURRENT
        image[16..18].copy_from_slice(&e_type.to_le_bytes());
        image[18..20].copy_from_slice(&0xf3u16.to_le_bytes()); // EM_RISCV
        image[20..24].copy_from_slice(&1u32.to_le_bytes());
        image[24..32].copy_from_slice(&entry.to_le_bytes());
        image[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
        image[52..54].copy_from_slice(&64u16.to_le_bytes());
        image[54..56].copy_from_slice(&56u16.to_le_bytes());
        image[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

        let mut cursor = data_off;
        let mut ph = phoff;
        let mut write_phdr = |image: &mut Vec<u8>,
                              ph: usize,
                              p_type: u32,
                              flags: u32,
                              offset: u64,
                              vaddr: u64,
                              filesz: u64,
                              memsz: u64| {
            image[ph..ph + 4].copy_from_slice(&p_type.to_le_bytes());
            image[ph + 4..ph + 8].copy_from_slice(&flags.to_le_bytes());
            image[ph + 8..ph + 16].copy_from_slice(&offset.to_le_bytes());
            image[ph + 16..ph + 24].copy_from_slice(&vaddr.to_le_bytes());
            image[ph + 24..ph + 32].copy_from_slice(&vaddr.to_le_bytes());
            image[ph + 32..ph + 40].copy_from_slice(&filesz.to_le_bytes());
            image[ph + 40..ph + 48].copy_from_slice(&memsz.to_le_bytes());
            image[ph + 48..ph + 56].copy_from_slice(&0x1000u64.to_le_bytes());
        };

        if let Some(interp) = interp {
            let bytes = interp.as_bytes();
            let offset = cursor;
            image.extend_from_slice(bytes);
            image.push(0);
            cursor += bytes.len() + 1;
            write_phdr(
                &mut image,
                ph,
                3, // PT_INTERP
                4,
                offset as u64,
                0,
                (bytes.len() + 1) as u64,
                (bytes.len() + 1) as u64,
            );
            ph += 56;
        }

        for seg in segs {
            let offset = cursor;
            image.extend_from_slice(&seg.data);
            cursor += seg.data.len();
            write_phdr(
                &mut image,
                ph,
                1, // PT_LOAD
                seg.flags,
                offset as u64,
                seg.vaddr,
                seg.data.len() as u64,
                seg.memsz,
            );
            ph += 56;
        }

        image
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{build_elf, TestSeg};
    use super::*;
    use friscy::machine::mock::MockMachine;

    const PF_RX: u32 = PF_R | PF_X;
    const PF_RW: u32 = PF_R | PF_W;

    #[test]
    fn parse_rejects_foreign_elves() {
        assert!(matches!(parse_elf(&[0u8; 16]), Err(ElfLoaderError::TooSmall)));
        let mut not_elf = build_elf(ET_EXEC, 0x1000, &[], None);
        not_elf[0] = 0;
        assert!(matches!(parse_elf(&not_elf), Err(ElfLoaderError::BadMagic)));
        let mut x86 = build_elf(ET_EXEC, 0x1000, &[], None);
        x86[18] = 0x3e;
        assert!(matches!(parse_elf(&x86), Err(ElfLoaderError::WrongMachine)));
    }

    #[test]
    fn parse_finds_interpreter() {
        let elf = build_elf(
            ET_DYN,
            0x900,
            &[TestSeg {
                vaddr: 0,
                data: vec![0x13; 64],
                memsz: 64,
                flags: PF_RX,
            }],
            Some("/lib/ld-musl-riscv64.so.1"),
        );
        let info = parse_elf(&elf).unwrap();
        assert!(info.is_dynamic);
        assert_eq!(info.interpreter, "/lib/ld-musl-riscv64.so.1");
        assert_eq!(info.kind, ElfKind::Dyn);
    }

    #[test]
    fn load_applies_pie_base_and_zeroes_bss() {
        let mut m = MockMachine::new(1 << 24);
        let elf = build_elf(
            ET_DYN,
            0x100,
            &[TestSeg {
                vaddr: 0x0,
                data: vec![0xaa; 0x80],
                memsz: 0x200,
                flags: PF_RW,
            }],
            None,
        );
        let machine: &mut dyn Machine = &mut m;
        // Pre-dirty the BSS area to prove it gets zeroed.
        machine.fill_mem(0x40080, 0xff, 0x180).unwrap();
        let adjust = load_segments(machine, &elf, 0x40000).unwrap();
        assert_eq!(adjust, 0x40000);
        let mut probe = [0u8; 2];
        machine.read_mem(0x40000, &mut probe).unwrap();
        assert_eq!(probe, [0xaa, 0xaa]);
        machine.read_mem(0x40080, &mut probe).unwrap();
        assert_eq!(probe, [0, 0]);
    }

    #[test]
    fn overlapping_segments_or_their_permissions() {
        // A code segment and a data segment sharing the 0x1000 page frame: the frame
        // must come out RWX, not RW.
        let mut m = MockMachine::new(1 << 24);
        let elf = build_elf(
            ET_EXEC,
            0x1000,
            &[
                TestSeg {
                    vaddr: 0x1000,
                    data: vec![0x13; 0x800],
                    memsz: 0x800,
                    flags: PF_RX,
                },
                TestSeg {
                    vaddr: 0x1800,
                    data: vec![1; 0x100],
                    memsz: 0x100,
                    flags: PF_RW,
                },
            ],
            None,
        );
        let machine: &mut dyn Machine = &mut m;
        load_segments(machine, &elf, 0).unwrap();
        let attr = machine.page_attributes(0x1000);
        assert!(attr.read && attr.write && attr.exec);
    }

    #[test]
    fn load_repairs_readonly_pages() {
        let mut m = MockMachine::new(1 << 24);
        let machine: &mut dyn Machine = &mut m;
        machine.set_page_attributes(
            0x2000,
            PAGE_SIZE,
            PageAttributes {
                read: true,
                write: false,
                exec: true,
            },
        );
        let elf = build_elf(
            ET_EXEC,
            0x2000,
            &[TestSeg {
                vaddr: 0x2000,
                data: vec![0x42; 0x100],
                memsz: 0x100,
                flags: PF_RW,
            }],
            None,
        );
        load_segments(machine, &elf, 0).unwrap();
        let mut probe = [0u8; 1];
        machine.read_mem(0x2000, &mut probe).unwrap();
        assert_eq!(probe[0], 0x42);
    }

    #[test]
    fn writable_range_covers_only_pf_w_segments() {
        let elf = build_elf(
            ET_EXEC,
            0x1000,
            &[
                TestSeg {
                    vaddr: 0x1000,
                    data: vec![0x13; 0x100],
                    memsz: 0x100,
                    flags: PF_RX,
                },
                TestSeg {
                    vaddr: 0x3000,
                    data: vec![1; 0x100],
                    memsz: 0x400,
                    flags: PF_RW,
                },
            ],
            None,
        );
        assert_eq!(get_load_range(&elf), (0x1000, 0x3400));
        assert_eq!(get_writable_range(&elf), (0x3000, 0x3400));
    }
}
