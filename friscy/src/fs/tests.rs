// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::*;

fn fixture() -> VirtualFs {
    let mut fs = VirtualFs::new();
    fs.add_file("/bin/busybox", b"#!ELF not really");
    fs.symlink("/bin/busybox", "/bin/sh").unwrap();
    fs.add_file("/etc/hostname", b"friscy\n");
    fs.mkdir("/tmp", 0o777).unwrap();
    fs
}

#[test]
fn open_read_write_seek() {
    let mut fs = fixture();
    let fd = fs.open("/etc/hostname", OFlags::RDWR).unwrap();
    let mut buf = [0u8; 3];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 3);
    assert_eq!(&buf, b"fri");
    assert_eq!(fs.lseek(fd, 0, 0).unwrap(), 0);
    fs.write(fd, b"FRISCY\n").unwrap();
    assert_eq!(fs.lseek(fd, 0, 0).unwrap(), 0);
    let mut all = [0u8; 16];
    let n = fs.read(fd, &mut all).unwrap();
    assert_eq!(&all[..n], b"FRISCY\n");
    fs.close(fd).unwrap();
    assert!(!fs.is_open(fd));
}

#[test]
fn writes_visible_through_any_handle_of_same_node() {
    let mut fs = fixture();
    let a = fs.open("/etc/hostname", OFlags::RDWR).unwrap();
    let b = fs.open("/etc/hostname", OFlags::RDONLY).unwrap();
    fs.write(a, b"xyzzy").unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(fs.read(b, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"xyzzy");
}

#[test]
fn creat_excl_trunc_append() {
    let mut fs = fixture();
    // Parent must exist for O_CREAT.
    assert_eq!(
        fs.open("/nosuch/f", OFlags::CREAT | OFlags::WRONLY),
        Err(FsError::NotFound)
    );
    let fd = fs.open("/tmp/f", OFlags::CREAT | OFlags::WRONLY).unwrap();
    fs.write(fd, b"one").unwrap();
    fs.close(fd).unwrap();
    assert_eq!(
        fs.open("/tmp/f", OFlags::CREAT | OFlags::EXCL),
        Err(FsError::AlreadyExists)
    );
    let fd = fs.open("/tmp/f", OFlags::WRONLY | OFlags::APPEND).unwrap();
    fs.write(fd, b"two").unwrap();
    fs.close(fd).unwrap();
    assert_eq!(fs.read_file("/tmp/f").unwrap(), b"onetwo");
    let fd = fs.open("/tmp/f", OFlags::WRONLY | OFlags::TRUNC).unwrap();
    fs.close(fd).unwrap();
    assert_eq!(fs.read_file("/tmp/f").unwrap(), b"");
}

#[test]
fn symlink_resolution() {
    let mut fs = fixture();
    // /bin/sh -> /bin/busybox.
    assert_eq!(fs.read_file("/bin/sh").unwrap(), b"#!ELF not really");
    // lstat sees the link, stat sees the target.
    assert_eq!(fs.lstat("/bin/sh").unwrap().kind, FileKind::Symlink);
    assert_eq!(fs.stat("/bin/sh").unwrap().kind, FileKind::Regular);
    assert_eq!(fs.readlink("/bin/sh").unwrap(), "/bin/busybox");
    assert_eq!(fs.readlink("/bin/busybox"), Err(FsError::InvalidArgument));
    // Relative link through an intermediate component.
    fs.symlink("busybox", "/bin/ash").unwrap();
    assert_eq!(fs.read_file("/bin/ash").unwrap(), b"#!ELF not really");
}

#[test]
fn symlink_loop_is_bounded() {
    let mut fs = VirtualFs::new();
    fs.symlink("/b", "/a").unwrap();
    fs.symlink("/a", "/b").unwrap();
    assert!(fs.resolve("/a").is_none());
}

#[test]
fn dup_and_dup2() {
    let mut fs = fixture();
    let src = fs.open("/etc/hostname", OFlags::RDONLY).unwrap();
    let mut b = [0u8; 2];
    fs.read(src, &mut b).unwrap();

    // dup copies the offset but keeps it independent afterwards.
    let copy = fs.dup(src).unwrap();
    let mut c = [0u8; 2];
    fs.read(copy, &mut c).unwrap();
    assert_eq!(&c, b"is");
    fs.read(src, &mut b).unwrap();
    assert_eq!(&b, b"is");

    // dup2 onto fd 1 installs a stdio redirection; closing the source keeps it alive.
    let one = fs.dup2(src, 1).unwrap();
    assert_eq!(one, 1);
    fs.close(src).unwrap();
    let mut d = [0u8; 2];
    fs.read(1, &mut d).unwrap();
    assert_eq!(&d, b"cy");
}

#[test]
fn unlink_rules() {
    let mut fs = fixture();
    assert_eq!(fs.unlink("/tmp", false), Err(FsError::IsADirectory));
    assert_eq!(fs.unlink("/etc/hostname", true), Err(FsError::NotADirectory));
    fs.mkdir("/tmp/d", 0o755).unwrap();
    fs.add_file("/tmp/d/f", b"x");
    assert_eq!(fs.unlink("/tmp/d", true), Err(FsError::NotEmpty));
    fs.unlink("/tmp/d/f", false).unwrap();
    fs.unlink("/tmp/d", true).unwrap();
    assert!(fs.resolve("/tmp/d").is_none());
}

#[test]
fn hard_link_aliases_the_node() {
    let mut fs = fixture();
    fs.link("/etc/hostname", "/etc/alias").unwrap();
    let fd = fs.open("/etc/alias", OFlags::WRONLY | OFlags::TRUNC).unwrap();
    fs.write(fd, b"linked").unwrap();
    assert_eq!(fs.read_file("/etc/hostname").unwrap(), b"linked");
    assert_eq!(fs.link("/tmp", "/tmp2"), Err(FsError::TooManyLinks));
}

#[test]
fn pipe_drains_from_head() {
    let mut fs = VirtualFs::new();
    let fifo = Node::new_ref(FileKind::Fifo, 0o600);
    let r = fs.open_pipe(Arc::clone(&fifo), PipeEnd::Read);
    let w = fs.open_pipe(fifo, PipeEnd::Write);
    fs.write(w, b"abc\n").unwrap();
    fs.write(w, b"def").unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(fs.read(r, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"abc\n");
    assert_eq!(fs.read(r, &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"def");
    assert_eq!(fs.read(r, &mut buf).unwrap(), 0);
}

#[test]
fn getdents_small_buffer_resumes() {
    let mut fs = fixture();
    fs.add_file("/etc/passwd", b"root::0:0\n");
    fs.add_file("/etc/group", b"root:x:0\n");
    let fd = fs.opendir("/etc").unwrap();

    // A buffer big enough for exactly one record at a time: names come back in sorted
    // order across calls, one per call.
    let mut seen = Vec::new();
    loop {
        let mut buf = [0u8; 40];
        let n = fs.getdents64(fd, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        let reclen = u16::from_le_bytes([buf[16], buf[17]]) as usize;
        assert!(reclen <= n);
        let name_end = buf[19..reclen].iter().position(|&b| b == 0).unwrap() + 19;
        seen.push(String::from_utf8_lossy(&buf[19..name_end]).into_owned());
    }
    assert_eq!(seen, ["group", "hostname", "passwd"]);
}

#[test]
fn getdents_on_file_fd_converts_to_dir_handle() {
    let mut fs = fixture();
    let fd = fs.open("/etc", OFlags::RDONLY).unwrap();
    let mut buf = [0u8; 256];
    let n = fs.getdents64(fd, &mut buf).unwrap();
    assert!(n > 0);
}

#[test]
fn chdir_and_relative_paths() {
    let mut fs = fixture();
    fs.chdir("/etc").unwrap();
    assert_eq!(fs.getcwd(), "/etc");
    assert_eq!(fs.read_file("hostname").unwrap(), b"friscy\n");
    assert_eq!(fs.chdir("/etc/hostname"), Err(FsError::NotADirectory));
}

#[test]
fn rename_moves_and_replaces() {
    let mut fs = fixture();
    fs.add_file("/tmp/a", b"a");
    fs.add_file("/tmp/b", b"b");
    fs.rename("/tmp/a", "/tmp/b").unwrap();
    assert!(fs.resolve("/tmp/a").is_none());
    assert_eq!(fs.read_file("/tmp/b").unwrap(), b"a");
}

#[test]
fn tar_round_trip_tree_equality() {
    let mut fs = fixture();
    fs.add_file(
        "/very/deep/directory/holding/an/extremely/long/path/name/that/definitely/exceeds/one/hundred/characters/file.txt",
        b"long-name payload",
    );
    let archive = fs.save_tar();
    assert_eq!(archive.len() % 512, 0);

    let reloaded = VirtualFs::from_tar(&archive).unwrap();
    let archive2 = reloaded.save_tar();
    // Serialization is deterministic, so tree equality shows up as byte equality of the
    // re-serialized archive.
    assert_eq!(archive, archive2);
    assert_eq!(reloaded.read_file("/etc/hostname").unwrap(), b"friscy\n");
    assert_eq!(reloaded.readlink("/bin/sh").unwrap(), "/bin/busybox");
    assert_eq!(
        reloaded
            .read_file("/very/deep/directory/holding/an/extremely/long/path/name/that/definitely/exceeds/one/hundred/characters/file.txt")
            .unwrap(),
        b"long-name payload"
    );
}

#[test]
fn tar_parses_external_layout() {
    // Hand-build a minimal ustar archive: a directory, a file, a symlink.
    fn header(name: &str, size: u64, type_flag: u8, link: &str) -> [u8; 512] {
        let mut h = [0u8; 512];
        h[..name.len()].copy_from_slice(name.as_bytes());
        h[100..107].copy_from_slice(b"0000755");
        h[124..135].copy_from_slice(format!("{size:011o}").as_bytes());
        h[156] = type_flag;
        h[157..157 + link.len()].copy_from_slice(link.as_bytes());
        h[257..262].copy_from_slice(b"ustar");
        let mut sum = 0u32;
        for (i, &b) in h.iter().enumerate() {
            sum += if (148..156).contains(&i) { 32 } else { u32::from(b) };
        }
        h[148..155].copy_from_slice(format!("{sum:06o}\0").as_bytes());
        h[155] = b' ';
        h
    }
    let mut tar = Vec::new();
    tar.extend_from_slice(&header("./bin/", 0, b'5', ""));
    tar.extend_from_slice(&header("./bin/echo", 5, b'0', ""));
    tar.extend_from_slice(b"hello");
    tar.resize(tar.len() + 512 - 5, 0);
    tar.extend_from_slice(&header("bin/cat", 0, b'2', "/bin/echo"));
    tar.resize(tar.len() + 1024, 0);

    let fs = VirtualFs::from_tar(&tar).unwrap();
    assert_eq!(fs.stat("/bin").unwrap().kind, FileKind::Directory);
    assert_eq!(fs.read_file("/bin/echo").unwrap(), b"hello");
    assert_eq!(fs.read_file("/bin/cat").unwrap(), b"hello");
}
