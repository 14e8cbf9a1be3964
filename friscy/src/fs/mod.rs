// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The tar-backed virtual file system.
//!
//! An in-memory tree of [`Node`]s parsed from a rootfs tar archive, plus the file
//! descriptor table the guest sees. Nodes are shared (`dup`, pipes, hard links all alias
//! the same node), so they live behind `Arc<RwLock<..>>`; a node is destroyed when the
//! last handle and the last tree reference drop.
//!
//! All fds handed out here are ≥ 3. Fds 0–2 are normally served by the host I/O bridge
//! and only appear in this table after a `dup2` redirection (shell pipelines).

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use bitflags::bitflags;
use hashbrown::HashMap;

pub mod tar;

/// File kinds, mirroring the Linux `S_IFMT` classes a tar archive can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    CharDev,
    BlockDev,
    Fifo,
    Socket,
}

impl FileKind {
    /// The `S_IFMT` bits for this kind.
    pub fn mode_bits(self) -> u32 {
        match self {
            FileKind::Regular => 0o100000,
            FileKind::Directory => 0o040000,
            FileKind::Symlink => 0o120000,
            FileKind::CharDev => 0o020000,
            FileKind::BlockDev => 0o060000,
            FileKind::Fifo => 0o010000,
            FileKind::Socket => 0o140000,
        }
    }

    /// The `d_type` byte used in `dirent64` records.
    pub fn dirent_type(self) -> u8 {
        match self {
            FileKind::Fifo => 1,
            FileKind::CharDev => 2,
            FileKind::Directory => 4,
            FileKind::BlockDev => 6,
            FileKind::Regular => 8,
            FileKind::Symlink => 10,
            FileKind::Socket => 12,
        }
    }
}

bitflags! {
    /// `O_*` open flags (Linux generic/RISC-V values).
    #[repr(transparent)]
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
    pub struct OFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const CREAT = 0o100;
        const EXCL = 0o200;
        const NOCTTY = 0o400;
        const TRUNC = 0o1000;
        const APPEND = 0o2000;
        const NONBLOCK = 0o4000;
        const DIRECTORY = 0o200000;
        const NOFOLLOW = 0o400000;
        const CLOEXEC = 0o2000000;
        /// <https://docs.rs/bitflags/*/bitflags/#externally-defined-flags>
        const _ = !0;
    }
}

/// One node in the VFS tree.
pub struct Node {
    pub name: String,
    pub kind: FileKind,
    /// Permission bits (no `S_IFMT` part).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    /// Target path, for symlinks.
    pub link_target: String,
    /// File bytes for regular files; the pipe buffer for fifos.
    pub content: Vec<u8>,
    /// Children, for directories. Names are unique; enumeration sorts by name.
    pub children: HashMap<String, NodeRef>,
}

pub type NodeRef = Arc<RwLock<Node>>;

impl Node {
    pub fn new(kind: FileKind, mode: u32) -> Self {
        Self {
            name: String::new(),
            kind,
            mode,
            uid: 0,
            gid: 0,
            mtime: 0,
            link_target: String::new(),
            content: Vec::new(),
            children: HashMap::new(),
        }
    }

    pub fn new_ref(kind: FileKind, mode: u32) -> NodeRef {
        Arc::new(RwLock::new(Self::new(kind, mode)))
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::Regular
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    /// Size as reported by `stat`: content length for regular files and fifos, zero for
    /// everything else (directories report a fixed block in the stat layer).
    pub fn size(&self) -> u64 {
        match self.kind {
            FileKind::Regular | FileKind::Fifo => self.content.len() as u64,
            _ => 0,
        }
    }
}

/// Errors out of the VFS. The shim lowers these to Linux errnos.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("file exists")]
    AlreadyExists,
    #[error("bad file descriptor")]
    BadFd,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("directory not empty")]
    NotEmpty,
    #[error("too many links")]
    TooManyLinks,
    #[error("resource busy")]
    Busy,
}

/// A `stat`-shaped view of a node.
#[derive(Clone, Debug)]
pub struct Metadata {
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: u64,
    pub nlink: u32,
}

impl Metadata {
    fn of(node: &Node) -> Self {
        Self {
            kind: node.kind,
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            size: node.size(),
            mtime: node.mtime,
            nlink: if node.is_dir() { 2 } else { 1 },
        }
    }
}

/// An open file: a node plus a byte offset and the flags it was opened with.
///
/// Multiple handles may reference the same node (`dup`, the two pipe halves, hard
/// links); offsets are per-handle.
pub struct FileHandle {
    pub node: NodeRef,
    pub offset: usize,
    pub flags: OFlags,
    /// The path used to open the handle, kept for diagnostics.
    pub path: String,
}

/// An open directory: a sorted name snapshot plus an iteration index.
pub struct DirHandle {
    pub node: NodeRef,
    names: Vec<String>,
    index: usize,
    pub path: String,
}

/// Which half of a pipe an fd serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

/// Maximum symlink indirections during path resolution.
const SYMLINK_DEPTH: u32 = 16;

/// First fd handed out for regular opens; 0–2 belong to stdio.
const FIRST_FD: i32 = 3;

/// The virtual file system and its fd table.
pub struct VirtualFs {
    root: NodeRef,
    cwd: String,
    files: HashMap<i32, FileHandle>,
    dirs: HashMap<i32, DirHandle>,
}

impl Default for VirtualFs {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFs {
    /// An empty file system with just the root directory.
    pub fn new() -> Self {
        let root = Node::new_ref(FileKind::Directory, 0o755);
        Self {
            root,
            cwd: "/".to_owned(),
            files: HashMap::new(),
            dirs: HashMap::new(),
        }
    }

    /// Build a file system from a tar archive.
    pub fn from_tar(data: &[u8]) -> Result<Self, tar::TarError> {
        let mut fs = Self::new();
        tar::load_into(&mut fs, data)?;
        Ok(fs)
    }

    /// Serialize the tree back to a deterministic ustar archive.
    pub fn save_tar(&self) -> Vec<u8> {
        tar::save(&self.root)
    }

    pub fn root(&self) -> NodeRef {
        Arc::clone(&self.root)
    }

    fn absolute(&self, path: &str) -> String {
        crate::path::absolutize(&self.cwd, path)
    }

    /// Resolve a path, following symlinks (including a final one).
    pub fn resolve(&self, path: &str) -> Option<NodeRef> {
        self.resolve_depth(&self.absolute(path), SYMLINK_DEPTH)
    }

    fn resolve_depth(&self, abs: &str, depth: u32) -> Option<NodeRef> {
        let parts = crate::path::normalized_components(abs);
        let mut current = Arc::clone(&self.root);
        for (i, part) in parts.iter().enumerate() {
            let child = {
                let node = current.read().unwrap();
                if !node.is_dir() {
                    return None;
                }
                Arc::clone(node.children.get(*part)?)
            };
            let (is_symlink, target) = {
                let n = child.read().unwrap();
                (n.is_symlink(), n.link_target.clone())
            };
            if is_symlink {
                if depth == 0 {
                    return None;
                }
                // Relative targets resolve against the directory holding the link; then
                // append whatever components remain past the link.
                let dir = format!("/{}", parts[..i].join("/"));
                let mut resolved = crate::path::absolutize(&dir, &target);
                for rest in &parts[i + 1..] {
                    resolved.push('/');
                    resolved.push_str(rest);
                }
                return self.resolve_depth(&resolved, depth - 1);
            }
            current = child;
        }
        Some(current)
    }

    /// Like [`Self::resolve`], but does not follow a symlink in the final component.
    pub fn resolve_no_symlink(&self, path: &str) -> Option<NodeRef> {
        let abs = self.absolute(path);
        match crate::path::parent_and_name(&abs) {
            None => Some(Arc::clone(&self.root)),
            Some((parent, name)) => {
                let dir = self.resolve_depth(&parent, SYMLINK_DEPTH)?;
                let dir = dir.read().unwrap();
                if !dir.is_dir() {
                    return None;
                }
                dir.children.get(name).cloned()
            }
        }
    }

    /// The lowest unused fd at or above [`FIRST_FD`].
    fn alloc_fd(&self) -> i32 {
        let mut fd = FIRST_FD;
        while self.files.contains_key(&fd) || self.dirs.contains_key(&fd) {
            fd += 1;
        }
        fd
    }

    /// Insert `node` at `path`, creating parent directories (mode 0755) on demand.
    pub fn insert(&mut self, path: &str, node: NodeRef) {
        let abs = self.absolute(path);
        let Some((parent_path, name)) = crate::path::parent_and_name(&abs) else {
            return;
        };
        let mut dir = Arc::clone(&self.root);
        for part in crate::path::normalized_components(&parent_path) {
            let next = {
                let mut d = dir.write().unwrap();
                match d.children.get(part) {
                    Some(child) => Arc::clone(child),
                    None => {
                        let created = Node::new_ref(FileKind::Directory, 0o755);
                        created.write().unwrap().name = part.to_owned();
                        d.children.insert(part.to_owned(), Arc::clone(&created));
                        created
                    }
                }
            };
            dir = next;
        }
        node.write().unwrap().name = name.to_owned();
        dir.write().unwrap().children.insert(name.to_owned(), node);
    }

    /// Add a regular file at `path` with the given content (for `/proc`-style virtual
    /// files). Parent directories are created on demand.
    pub fn add_file(&mut self, path: &str, content: &[u8]) {
        let node = Node::new_ref(FileKind::Regular, 0o444);
        node.write().unwrap().content = content.to_vec();
        self.insert(path, node);
    }

    /// Read a whole regular file (following symlinks). Used by the loaders.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let node = self.resolve(path).ok_or(FsError::NotFound)?;
        let node = node.read().unwrap();
        if node.is_dir() {
            return Err(FsError::IsADirectory);
        }
        Ok(node.content.clone())
    }

    // --- fd table operations ---

    pub fn open(&mut self, path: &str, flags: OFlags) -> Result<i32, FsError> {
        let abs = self.absolute(path);
        let node = match self.resolve(&abs) {
            Some(node) => {
                if flags.contains(OFlags::CREAT | OFlags::EXCL) {
                    return Err(FsError::AlreadyExists);
                }
                node
            }
            None => {
                if !flags.contains(OFlags::CREAT) {
                    return Err(FsError::NotFound);
                }
                let (parent_path, _) =
                    crate::path::parent_and_name(&abs).ok_or(FsError::NotFound)?;
                let parent = self.resolve(&parent_path).ok_or(FsError::NotFound)?;
                if !parent.read().unwrap().is_dir() {
                    return Err(FsError::NotADirectory);
                }
                let node = Node::new_ref(FileKind::Regular, 0o644);
                self.insert(&abs, Arc::clone(&node));
                node
            }
        };

        let (is_dir, len) = {
            let n = node.read().unwrap();
            (n.is_dir(), n.content.len())
        };
        if is_dir {
            // A directory opened without O_DIRECTORY still gets a (read-only) file
            // handle; getdents64 rewrites it into a dir handle on first use. Write
            // intent on a directory is refused.
            if flags.intersects(OFlags::WRONLY | OFlags::RDWR) {
                return Err(FsError::IsADirectory);
            }
        } else if flags.contains(OFlags::TRUNC) {
            node.write().unwrap().content.clear();
        }

        let offset = if flags.contains(OFlags::APPEND) && !is_dir {
            if flags.contains(OFlags::TRUNC) { 0 } else { len }
        } else {
            0
        };
        let fd = self.alloc_fd();
        self.files.insert(
            fd,
            FileHandle {
                node,
                offset,
                flags,
                path: abs,
            },
        );
        Ok(fd)
    }

    pub fn opendir(&mut self, path: &str) -> Result<i32, FsError> {
        let abs = self.absolute(path);
        let node = self.resolve(&abs).ok_or(FsError::NotFound)?;
        if !node.read().unwrap().is_dir() {
            return Err(FsError::NotADirectory);
        }
        let names = sorted_child_names(&node);
        let fd = self.alloc_fd();
        self.dirs.insert(
            fd,
            DirHandle {
                node,
                names,
                index: 0,
                path: abs,
            },
        );
        Ok(fd)
    }

    pub fn close(&mut self, fd: i32) -> Result<(), FsError> {
        let had_file = self.files.remove(&fd).is_some();
        let had_dir = self.dirs.remove(&fd).is_some();
        if had_file || had_dir {
            Ok(())
        } else {
            Err(FsError::BadFd)
        }
    }

    pub fn is_open(&self, fd: i32) -> bool {
        self.files.contains_key(&fd) || self.dirs.contains_key(&fd)
    }

    pub fn dup(&mut self, oldfd: i32) -> Result<i32, FsError> {
        let newfd = self.alloc_fd();
        self.copy_handle(oldfd, newfd)?;
        Ok(newfd)
    }

    /// `dup2`: close `newfd` first, then alias `oldfd` at `newfd`. Installing fds 0–2
    /// this way is how shell redirection reaches the VFS.
    pub fn dup2(&mut self, oldfd: i32, newfd: i32) -> Result<i32, FsError> {
        if oldfd == newfd {
            if !self.is_open(oldfd) {
                return Err(FsError::BadFd);
            }
            return Ok(newfd);
        }
        let _ = self.close(newfd);
        self.copy_handle(oldfd, newfd)?;
        Ok(newfd)
    }

    fn copy_handle(&mut self, oldfd: i32, newfd: i32) -> Result<(), FsError> {
        if let Some(fh) = self.files.get(&oldfd) {
            let copy = FileHandle {
                node: Arc::clone(&fh.node),
                offset: fh.offset,
                flags: fh.flags,
                path: fh.path.clone(),
            };
            self.files.insert(newfd, copy);
            return Ok(());
        }
        if let Some(dh) = self.dirs.get(&oldfd) {
            let copy = DirHandle {
                node: Arc::clone(&dh.node),
                names: dh.names.clone(),
                index: dh.index,
                path: dh.path.clone(),
            };
            self.dirs.insert(newfd, copy);
            return Ok(());
        }
        Err(FsError::BadFd)
    }

    pub fn read(&mut self, fd: i32, buf: &mut [u8]) -> Result<usize, FsError> {
        let fh = self.files.get_mut(&fd).ok_or(FsError::BadFd)?;
        let mut node = fh.node.write().unwrap();
        match node.kind {
            FileKind::Directory => Err(FsError::IsADirectory),
            FileKind::Fifo => {
                // Pipe semantics: drain from the head of the shared buffer.
                let n = buf.len().min(node.content.len());
                for (dst, b) in buf.iter_mut().zip(node.content.drain(..n)) {
                    *dst = b;
                }
                Ok(n)
            }
            _ => {
                let start = fh.offset.min(node.content.len());
                let end = (fh.offset + buf.len()).min(node.content.len());
                let n = end - start;
                buf[..n].copy_from_slice(&node.content[start..end]);
                fh.offset = end;
                Ok(n)
            }
        }
    }

    pub fn write(&mut self, fd: i32, buf: &[u8]) -> Result<usize, FsError> {
        let fh = self.files.get_mut(&fd).ok_or(FsError::BadFd)?;
        let mut node = fh.node.write().unwrap();
        match node.kind {
            FileKind::Directory => Err(FsError::IsADirectory),
            FileKind::Fifo => {
                // Pipe semantics: append to the tail.
                node.content.extend_from_slice(buf);
                Ok(buf.len())
            }
            _ => {
                let end = fh.offset + buf.len();
                if end > node.content.len() {
                    node.content.resize(end, 0);
                }
                let offset = fh.offset;
                node.content[offset..end].copy_from_slice(buf);
                fh.offset = end;
                Ok(buf.len())
            }
        }
    }

    /// Positional read; does not move the handle offset.
    pub fn pread(&self, fd: i32, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        let fh = self.files.get(&fd).ok_or(FsError::BadFd)?;
        let node = fh.node.read().unwrap();
        if node.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let offset = offset as usize;
        if offset >= node.content.len() {
            return Ok(0);
        }
        let n = buf.len().min(node.content.len() - offset);
        buf[..n].copy_from_slice(&node.content[offset..offset + n]);
        Ok(n)
    }

    /// Positional write; does not move the handle offset.
    pub fn pwrite(&mut self, fd: i32, buf: &[u8], offset: u64) -> Result<usize, FsError> {
        let fh = self.files.get(&fd).ok_or(FsError::BadFd)?;
        let mut node = fh.node.write().unwrap();
        if node.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > node.content.len() {
            node.content.resize(end, 0);
        }
        node.content[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    pub fn lseek(&mut self, fd: i32, offset: i64, whence: u32) -> Result<u64, FsError> {
        let fh = self.files.get_mut(&fd).ok_or(FsError::BadFd)?;
        let len = fh.node.read().unwrap().content.len() as i64;
        let base = match whence {
            0 => 0,
            1 => fh.offset as i64,
            2 => len,
            _ => return Err(FsError::InvalidArgument),
        };
        let target = base.checked_add(offset).ok_or(FsError::InvalidArgument)?;
        if target < 0 {
            return Err(FsError::InvalidArgument);
        }
        fh.offset = target as usize;
        Ok(target as u64)
    }

    pub fn ftruncate(&mut self, fd: i32, length: u64) -> Result<(), FsError> {
        let fh = self.files.get_mut(&fd).ok_or(FsError::BadFd)?;
        let mut node = fh.node.write().unwrap();
        if !node.is_file() {
            return Err(FsError::InvalidArgument);
        }
        node.content.resize(length as usize, 0);
        if fh.offset > length as usize {
            fh.offset = length as usize;
        }
        Ok(())
    }

    /// Emit `dirent64` records into `buf`, as many complete records as fit. The
    /// iteration index is left at the first unemitted entry.
    pub fn getdents64(&mut self, fd: i32, buf: &mut [u8]) -> Result<usize, FsError> {
        if !self.dirs.contains_key(&fd) {
            // Directories opened as plain files are rewritten to dir handles on first
            // use.
            let Some(fh) = self.files.get(&fd) else {
                return Err(FsError::BadFd);
            };
            if !fh.node.read().unwrap().is_dir() {
                return Err(FsError::NotADirectory);
            }
            let fh = self.files.remove(&fd).unwrap();
            let names = sorted_child_names(&fh.node);
            self.dirs.insert(
                fd,
                DirHandle {
                    node: fh.node,
                    names,
                    index: 0,
                    path: fh.path,
                },
            );
        }
        let dh = self.dirs.get_mut(&fd).unwrap();
        // Refresh the snapshot so names added since open (and not yet passed) are
        // observed; already-consumed positions stay consumed.
        dh.names = sorted_child_names(&dh.node);

        let mut written = 0usize;
        while dh.index < dh.names.len() {
            let name = dh.names[dh.index].clone();
            let kind = {
                let node = dh.node.read().unwrap();
                match node.children.get(&name) {
                    Some(child) => child.read().unwrap().kind,
                    None => {
                        // Unlinked since the snapshot; skip.
                        dh.index += 1;
                        continue;
                    }
                }
            };
            // d_ino + d_off + d_reclen + d_type + name + NUL, aligned up to 8.
            let reclen = (8 + 8 + 2 + 1 + name.len() + 1 + 7) & !7;
            if written + reclen > buf.len() {
                break;
            }
            let rec = &mut buf[written..written + reclen];
            rec.fill(0);
            rec[0..8].copy_from_slice(&((dh.index + 1) as u64).to_le_bytes());
            rec[8..16].copy_from_slice(&((dh.index + 1) as u64).to_le_bytes());
            rec[16..18].copy_from_slice(&(reclen as u16).to_le_bytes());
            rec[18] = kind.dirent_type();
            rec[19..19 + name.len()].copy_from_slice(name.as_bytes());
            written += reclen;
            dh.index += 1;
        }
        Ok(written)
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), FsError> {
        let abs = self.absolute(path);
        if self.resolve_no_symlink(&abs).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let (parent_path, _) = crate::path::parent_and_name(&abs).ok_or(FsError::AlreadyExists)?;
        let parent = self.resolve(&parent_path).ok_or(FsError::NotFound)?;
        if !parent.read().unwrap().is_dir() {
            return Err(FsError::NotADirectory);
        }
        self.insert(&abs, Node::new_ref(FileKind::Directory, mode & 0o777));
        Ok(())
    }

    /// Remove a directory entry. `remove_dir` selects `AT_REMOVEDIR` semantics.
    pub fn unlink(&mut self, path: &str, remove_dir: bool) -> Result<(), FsError> {
        let abs = self.absolute(path);
        let (parent_path, name) = crate::path::parent_and_name(&abs).ok_or(FsError::Busy)?;
        let parent = self.resolve(&parent_path).ok_or(FsError::NotFound)?;
        let mut parent = parent.write().unwrap();
        let entry = parent.children.get(name).ok_or(FsError::NotFound)?;
        let (is_dir, empty) = {
            let e = entry.read().unwrap();
            (e.is_dir(), e.children.is_empty())
        };
        if is_dir && !remove_dir {
            return Err(FsError::IsADirectory);
        }
        if !is_dir && remove_dir {
            return Err(FsError::NotADirectory);
        }
        if is_dir && !empty {
            return Err(FsError::NotEmpty);
        }
        parent.children.remove(name);
        Ok(())
    }

    pub fn symlink(&mut self, target: &str, linkpath: &str) -> Result<(), FsError> {
        if target.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let abs = self.absolute(linkpath);
        if self.resolve_no_symlink(&abs).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let node = Node::new_ref(FileKind::Symlink, 0o777);
        node.write().unwrap().link_target = target.to_owned();
        self.insert(&abs, node);
        Ok(())
    }

    /// Create a hard link: the same node under a second name.
    pub fn link(&mut self, oldpath: &str, newpath: &str) -> Result<(), FsError> {
        let target = self.resolve(oldpath).ok_or(FsError::NotFound)?;
        if target.read().unwrap().is_dir() {
            return Err(FsError::TooManyLinks);
        }
        let abs = self.absolute(newpath);
        if self.resolve_no_symlink(&abs).is_some() {
            return Err(FsError::AlreadyExists);
        }
        self.insert(&abs, target);
        Ok(())
    }

    pub fn rename(&mut self, oldpath: &str, newpath: &str) -> Result<(), FsError> {
        let abs_old = self.absolute(oldpath);
        let abs_new = self.absolute(newpath);
        let (old_parent_path, old_name) =
            crate::path::parent_and_name(&abs_old).ok_or(FsError::Busy)?;
        let (new_parent_path, new_name) =
            crate::path::parent_and_name(&abs_new).ok_or(FsError::Busy)?;

        let old_parent = self.resolve(&old_parent_path).ok_or(FsError::NotFound)?;
        let new_parent = self.resolve(&new_parent_path).ok_or(FsError::NotFound)?;
        if !new_parent.read().unwrap().is_dir() {
            return Err(FsError::NotADirectory);
        }
        let entry = old_parent
            .write()
            .unwrap()
            .children
            .remove(old_name)
            .ok_or(FsError::NotFound)?;
        entry.write().unwrap().name = new_name.to_owned();
        // Any existing destination entry is replaced.
        new_parent
            .write()
            .unwrap()
            .children
            .insert(new_name.to_owned(), entry);
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> Result<String, FsError> {
        let node = self.resolve_no_symlink(path).ok_or(FsError::NotFound)?;
        let node = node.read().unwrap();
        if !node.is_symlink() {
            return Err(FsError::InvalidArgument);
        }
        Ok(node.link_target.clone())
    }

    pub fn stat(&self, path: &str) -> Result<Metadata, FsError> {
        let node = self.resolve(path).ok_or(FsError::NotFound)?;
        let node = node.read().unwrap();
        Ok(Metadata::of(&node))
    }

    pub fn lstat(&self, path: &str) -> Result<Metadata, FsError> {
        let node = self.resolve_no_symlink(path).ok_or(FsError::NotFound)?;
        let node = node.read().unwrap();
        Ok(Metadata::of(&node))
    }

    pub fn fstat(&self, fd: i32) -> Result<Metadata, FsError> {
        let node = self.node_of(fd).ok_or(FsError::BadFd)?;
        let node = node.read().unwrap();
        Ok(Metadata::of(&node))
    }

    pub fn chdir(&mut self, path: &str) -> Result<(), FsError> {
        let abs = self.absolute(path);
        let node = self.resolve(&abs).ok_or(FsError::NotFound)?;
        if !node.read().unwrap().is_dir() {
            return Err(FsError::NotADirectory);
        }
        let parts = crate::path::normalized_components(&abs);
        self.cwd = if parts.is_empty() {
            "/".to_owned()
        } else {
            format!("/{}", parts.join("/"))
        };
        Ok(())
    }

    pub fn getcwd(&self) -> &str {
        &self.cwd
    }

    /// Allocate an fd over one end of a pipe. Both ends share the fifo node whose
    /// content vector is the pipe buffer.
    pub fn open_pipe(&mut self, node: NodeRef, end: PipeEnd) -> i32 {
        let fd = self.alloc_fd();
        let flags = match end {
            PipeEnd::Read => OFlags::RDONLY,
            PipeEnd::Write => OFlags::WRONLY,
        };
        self.files.insert(
            fd,
            FileHandle {
                node,
                offset: 0,
                flags,
                path: "[pipe]".to_owned(),
            },
        );
        fd
    }

    /// The node behind an open fd (file or directory handle).
    pub fn node_of(&self, fd: i32) -> Option<NodeRef> {
        if let Some(fh) = self.files.get(&fd) {
            return Some(Arc::clone(&fh.node));
        }
        self.dirs.get(&fd).map(|dh| Arc::clone(&dh.node))
    }

    pub fn path_of(&self, fd: i32) -> Option<&str> {
        if let Some(fh) = self.files.get(&fd) {
            return Some(&fh.path);
        }
        self.dirs.get(&fd).map(|dh| dh.path.as_str())
    }

    pub fn flags_of(&self, fd: i32) -> Option<OFlags> {
        self.files.get(&fd).map(|fh| fh.flags)
    }

    /// The set of open fds, sorted. Snapshotted by the cooperative fork so a child's
    /// opens and redirections can be undone.
    pub fn open_fds(&self) -> BTreeSet<i32> {
        self.files.keys().chain(self.dirs.keys()).copied().collect()
    }
}

fn sorted_child_names(node: &NodeRef) -> Vec<String> {
    let node = node.read().unwrap();
    let mut names: Vec<String> = node.children.keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests;
