use std::sync::Arc;

use fs_mut::MutFs;
use fuser::FileType;
use libc::{EIO, ENOENT};
use perm_lib::{ClaimClient, MemoryClient};
use tokio::runtime::Runtime;

use crate::fs_daemon::FsDaemon;

const ROOT: u64 = 1;

fn create_test_daemon() -> FsDaemon {
    let client = Arc::new(MemoryClient::new());
    let runtime = Runtime::new().expect("create runtime");
    let root_pn = runtime
        .block_on(client.upload_new_permanode())
        .expect("root permanode");
    let fs = MutFs::new(client.clone(), client.clone(), client.clone());
    let root = fs.root(root_pn);
    FsDaemon::new(runtime, root)
}

#[test]
fn test_mkdir_and_lookup() {
    let daemon = create_test_daemon();
    let (_ino, attr) = daemon.mkdir_entry(ROOT, "alpha").expect("mkdir alpha");
    assert_eq!(attr.kind, FileType::Directory);
    let (_ino, lookup_attr) = daemon.lookup_entry(ROOT, "alpha").expect("lookup alpha");
    assert_eq!(lookup_attr.kind, FileType::Directory);
}

#[test]
fn test_create_write_read_file() {
    let daemon = create_test_daemon();
    let (ino, _attr, fh) = daemon.create_entry(ROOT, "file.txt").expect("create file");
    assert_eq!(daemon.write_fh(fh, 0, b"hello").expect("write"), 5);
    daemon.release_fh(fh).expect("release");

    let fh = daemon.open_entry(ino, libc::O_RDONLY).expect("open ro");
    let data = daemon.read_fh(fh, 0, 5).expect("read");
    assert_eq!(data, b"hello");
    daemon.release_fh(fh).expect("release reader");

    let attr = daemon.getattr_entry(ino).expect("getattr");
    assert_eq!(attr.size, 5);
}

#[test]
fn test_rename_file() {
    let daemon = create_test_daemon();
    let (ino, _attr, fh) = daemon.create_entry(ROOT, "old.txt").expect("create old");
    daemon.release_fh(fh).expect("release");

    daemon
        .rename_entry(ROOT, "old.txt", ROOT, "new.txt")
        .expect("rename");
    assert_eq!(daemon.lookup_entry(ROOT, "old.txt").unwrap_err(), ENOENT);
    let (new_ino, _attr) = daemon.lookup_entry(ROOT, "new.txt").expect("lookup new");
    assert_eq!(new_ino, ino, "rename keeps the permanode and its inode");
}

#[test]
fn test_rename_into_file_is_rejected() {
    let daemon = create_test_daemon();
    let (file_ino, _attr, fh) = daemon.create_entry(ROOT, "target").expect("create target");
    daemon.release_fh(fh).expect("release");
    let (_ino, _attr, fh) = daemon.create_entry(ROOT, "a").expect("create a");
    daemon.release_fh(fh).expect("release");

    assert_eq!(
        daemon.rename_entry(ROOT, "a", file_ino, "b").unwrap_err(),
        EIO
    );
}

#[test]
fn test_unlink_file() {
    let daemon = create_test_daemon();
    let (_ino, _attr, fh) = daemon.create_entry(ROOT, "delete.txt").expect("create");
    daemon.release_fh(fh).expect("release");
    daemon.unlink_entry(ROOT, "delete.txt").expect("unlink");
    assert_eq!(
        daemon.lookup_entry(ROOT, "delete.txt").unwrap_err(),
        ENOENT
    );
}

#[test]
fn test_readdir_contains_entries() {
    let daemon = create_test_daemon();
    daemon.mkdir_entry(ROOT, "dir").expect("mkdir dir");
    let (_ino, _attr, fh) = daemon.create_entry(ROOT, "file").expect("create file");
    daemon.release_fh(fh).expect("release");

    let entries = daemon.readdir_entries(ROOT, 0).expect("readdir");
    let names: Vec<String> = entries.into_iter().map(|e| e.2).collect();
    assert!(names.contains(&".".to_string()));
    assert!(names.contains(&"..".to_string()));
    assert!(names.contains(&"dir".to_string()));
    assert!(names.contains(&"file".to_string()));
}

#[test]
fn test_symlink_and_readlink() {
    let daemon = create_test_daemon();
    let (ino, attr) = daemon
        .symlink_entry(ROOT, "lnk", "../target")
        .expect("symlink");
    assert_eq!(attr.kind, FileType::Symlink);
    let target = daemon.readlink_entry(ino).expect("readlink");
    assert_eq!(target, b"../target");
}

#[test]
fn test_truncate_through_setattr_with_handle() {
    let daemon = create_test_daemon();
    let (ino, _attr, fh) = daemon.create_entry(ROOT, "f").expect("create");
    daemon.write_fh(fh, 0, b"hello world").expect("write");

    let attr = daemon
        .setattr_entry(ino, Some(3), None, None, Some(fh))
        .expect("setattr truncate");
    assert_eq!(attr.size, 3);
    assert_eq!(daemon.read_fh(fh, 0, 10).expect("read"), b"hel");

    daemon.release_fh(fh).expect("release");
    assert_eq!(daemon.getattr_entry(ino).expect("getattr").size, 3);
}

#[test]
fn test_setattr_size_without_handle_only_reports() {
    let daemon = create_test_daemon();
    let (ino, _attr, fh) = daemon.create_entry(ROOT, "f").expect("create");
    daemon.write_fh(fh, 0, b"hello").expect("write");
    daemon.release_fh(fh).expect("release");

    let attr = daemon
        .setattr_entry(ino, Some(2), None, None, None)
        .expect("setattr");
    assert_eq!(attr.size, 2);

    // the stored bytes are untouched
    let fh = daemon.open_entry(ino, libc::O_RDONLY).expect("open ro");
    assert_eq!(daemon.read_fh(fh, 0, 10).expect("read"), b"hello");
    daemon.release_fh(fh).expect("release reader");
}

#[test]
fn test_fsync_commits_pending_writes() {
    let daemon = create_test_daemon();
    let (ino, _attr, fh) = daemon.create_entry(ROOT, "f").expect("create");
    daemon.write_fh(fh, 0, b"abc").expect("write");
    daemon.fsync_fh(fh).expect("fsync");

    // committed bytes are readable through a second, read-only handle
    let ro = daemon.open_entry(ino, libc::O_RDONLY).expect("open ro");
    assert_eq!(daemon.read_fh(ro, 0, 3).expect("read"), b"abc");
    daemon.release_fh(ro).expect("release reader");
    daemon.release_fh(fh).expect("release writer");
}
