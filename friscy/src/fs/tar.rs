// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! POSIX/GNU tar parsing and serialization for the VFS.
//!
//! Parsing accepts what an Alpine rootfs archive actually contains: ustar headers with
//! the `prefix` field, GNU `././@LongLink` headers for names over 100 bytes, octal-ASCII
//! numeric fields, and two zero blocks as end-of-archive. Serialization emits a
//! deterministic ustar archive (children sorted by name) that parses back to an equal
//! tree.

use std::sync::Arc;

use super::{FileKind, Node, NodeRef, VirtualFs};

const BLOCK: usize = 512;

#[derive(thiserror::Error, Debug)]
pub enum TarError {
    #[error("truncated tar header at offset {0}")]
    TruncatedHeader(usize),
    #[error("truncated file data at offset {0}")]
    TruncatedData(usize),
}

fn parse_octal(field: &[u8]) -> u64 {
    let mut value = 0u64;
    for &b in field {
        if !(b'0'..=b'7').contains(&b) {
            break;
        }
        value = value * 8 + u64::from(b - b'0');
    }
    value
}

fn field_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Strip the `./` prefix tar archives created with `tar cf foo.tar .` carry.
fn normalize_name(name: &str) -> &str {
    name.strip_prefix("./").unwrap_or(name)
}

/// Parse `data` into `fs`, creating parent directories on demand.
pub fn load_into(fs: &mut VirtualFs, data: &[u8]) -> Result<(), TarError> {
    let mut offset = 0usize;
    let mut entries = 0usize;
    while offset + BLOCK <= data.len() {
        let mut header = &data[offset..offset + BLOCK];

        // End-of-archive: an all-zero block.
        if header.iter().all(|&b| b == 0) {
            break;
        }

        let mut name = field_str(&header[0..100]);

        // GNU long-name extension: the header names `././@LongLink` and the following
        // block(s) carry the real name.
        if name == "././@LongLink" {
            let name_len = parse_octal(&header[124..136]) as usize;
            offset += BLOCK;
            if offset + name_len > data.len() {
                return Err(TarError::TruncatedData(offset));
            }
            let end = data[offset..offset + name_len]
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(name_len);
            name = String::from_utf8_lossy(&data[offset..offset + end]).into_owned();
            offset += name_len.div_ceil(BLOCK) * BLOCK;
            if offset + BLOCK > data.len() {
                return Err(TarError::TruncatedHeader(offset));
            }
            header = &data[offset..offset + BLOCK];
        }

        // ustar prefix field extends the name on the left.
        if &header[257..262] == b"ustar" {
            let prefix = field_str(&header[345..500]);
            if !prefix.is_empty() {
                name = format!("{prefix}/{name}");
            }
        }

        let name = normalize_name(&name).trim_end_matches('/').to_owned();
        let mode = parse_octal(&header[100..108]) as u32;
        let uid = parse_octal(&header[108..116]) as u32;
        let gid = parse_octal(&header[116..124]) as u32;
        let size = parse_octal(&header[124..136]) as usize;
        let mtime = parse_octal(&header[136..148]);
        let type_flag = header[156];
        let link_target = field_str(&header[157..257]);

        offset += BLOCK;

        if name.is_empty() {
            continue;
        }

        let kind = match type_flag {
            b'0' | 0 | b'1' => FileKind::Regular,
            b'2' => FileKind::Symlink,
            b'3' => FileKind::CharDev,
            b'4' => FileKind::BlockDev,
            b'5' => FileKind::Directory,
            b'6' => FileKind::Fifo,
            _ => FileKind::Regular,
        };

        let node = Node::new_ref(kind, mode & 0o7777);
        {
            let mut n = node.write().unwrap();
            n.uid = uid;
            n.gid = gid;
            n.mtime = mtime;
            if kind == FileKind::Symlink {
                n.link_target = link_target;
            }
            if kind == FileKind::Regular && size > 0 {
                if offset + size > data.len() {
                    return Err(TarError::TruncatedData(offset));
                }
                n.content = data[offset..offset + size].to_vec();
            }
        }
        if kind == FileKind::Regular && size > 0 {
            offset += size.div_ceil(BLOCK) * BLOCK;
        }

        fs.insert(&format!("/{name}"), node);
        entries += 1;
    }
    log::debug!("tar: loaded {entries} entries from {} bytes", data.len());
    Ok(())
}

fn write_octal(field: &mut [u8], value: u64) {
    // Right-aligned octal ASCII, NUL-terminated.
    let len = field.len();
    if len < 2 {
        return;
    }
    field[len - 1] = 0;
    let mut v = value;
    for i in (0..len - 1).rev() {
        field[i] = b'0' + (v & 7) as u8;
        v >>= 3;
    }
}

fn checksum(header: &[u8; BLOCK]) -> u32 {
    let mut sum = 0u32;
    for (i, &b) in header.iter().enumerate() {
        // The checksum field itself is counted as spaces.
        sum += if (148..156).contains(&i) {
            u32::from(b' ')
        } else {
            u32::from(b)
        };
    }
    sum
}

fn emit_long_name(out: &mut Vec<u8>, long_name: &str) {
    let mut header = [0u8; BLOCK];
    header[..13].copy_from_slice(b"././@LongLink");
    write_octal(&mut header[100..108], 0);
    write_octal(&mut header[108..116], 0);
    write_octal(&mut header[116..124], 0);
    let name_size = long_name.len() + 1;
    write_octal(&mut header[124..136], name_size as u64);
    write_octal(&mut header[136..148], 0);
    header[156] = b'L';
    header[257..262].copy_from_slice(b"ustar");
    header[262] = b' ';
    header[263] = b' ';
    let sum = checksum(&header);
    write_octal(&mut header[148..155], u64::from(sum));
    header[155] = b' ';
    out.extend_from_slice(&header);

    let padded = name_size.div_ceil(BLOCK) * BLOCK;
    let base = out.len();
    out.resize(base + padded, 0);
    out[base..base + long_name.len()].copy_from_slice(long_name.as_bytes());
}

fn emit_entry(out: &mut Vec<u8>, path: &str, node: &Node) {
    let mut tar_path = path.to_owned();
    if node.is_dir() && !tar_path.ends_with('/') {
        tar_path.push('/');
    }
    if tar_path.len() > 100 {
        emit_long_name(out, &tar_path);
    }

    let mut header = [0u8; BLOCK];
    let name_len = tar_path.len().min(100);
    header[..name_len].copy_from_slice(&tar_path.as_bytes()[..name_len]);

    write_octal(&mut header[100..108], u64::from(node.mode));
    write_octal(&mut header[108..116], u64::from(node.uid));
    write_octal(&mut header[116..124], u64::from(node.gid));
    let content_size = if node.is_file() {
        node.content.len() as u64
    } else {
        0
    };
    write_octal(&mut header[124..136], content_size);
    write_octal(&mut header[136..148], node.mtime);

    header[156] = match node.kind {
        FileKind::Regular => b'0',
        FileKind::Symlink => b'2',
        FileKind::CharDev => b'3',
        FileKind::BlockDev => b'4',
        FileKind::Directory => b'5',
        FileKind::Fifo => b'6',
        FileKind::Socket => b'0',
    };

    if node.is_symlink() {
        let len = node.link_target.len().min(100);
        header[157..157 + len].copy_from_slice(&node.link_target.as_bytes()[..len]);
    }

    header[257..263].copy_from_slice(b"ustar\0");
    header[263] = b'0';
    header[264] = b'0';
    header[265..269].copy_from_slice(b"root");
    header[297..301].copy_from_slice(b"root");

    let sum = checksum(&header);
    write_octal(&mut header[148..155], u64::from(sum));
    header[155] = b' ';

    out.extend_from_slice(&header);

    if content_size > 0 {
        out.extend_from_slice(&node.content);
        let rem = node.content.len() % BLOCK;
        if rem != 0 {
            out.resize(out.len() + BLOCK - rem, 0);
        }
    }
}

fn save_recursive(out: &mut Vec<u8>, node: &NodeRef, prefix: &str) {
    let node = node.read().unwrap();
    let mut names: Vec<&String> = node.children.keys().collect();
    names.sort();
    for name in names {
        let child = Arc::clone(&node.children[name]);
        let child_path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        {
            let c = child.read().unwrap();
            emit_entry(out, &child_path, &c);
        }
        if child.read().unwrap().is_dir() {
            save_recursive(out, &child, &child_path);
        }
    }
}

/// Serialize the tree rooted at `root` into a ustar archive with a two-block trailer.
pub fn save(root: &NodeRef) -> Vec<u8> {
    let mut out = Vec::new();
    save_recursive(&mut out, root, "");
    out.resize(out.len() + 2 * BLOCK, 0);
    out
}
