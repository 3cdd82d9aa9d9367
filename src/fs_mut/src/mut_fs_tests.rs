use std::sync::Arc;

use perm_lib::{BlobRef, ClaimClient, ClaimType, FsError, MemoryClient};
use tokio::io::AsyncReadExt;

use crate::{MutDir, MutFile, MutFs, MutNode, SetattrRequest};

struct Harness {
    client: Arc<MemoryClient>,
    root_pn: BlobRef,
    root: Arc<MutDir>,
}

async fn harness() -> Harness {
    let client = Arc::new(MemoryClient::new());
    let root_pn = client.upload_new_permanode().await.expect("root permanode");
    let fs = MutFs::new(client.clone(), client.clone(), client.clone());
    let root = fs.root(root_pn.clone());
    Harness {
        client,
        root_pn,
        root,
    }
}

/// A second mount over the same store, starting with a cold cache.
fn fresh_view(h: &Harness) -> Arc<MutDir> {
    let fs = MutFs::new(h.client.clone(), h.client.clone(), h.client.clone());
    fs.root(h.root_pn.clone())
}

async fn read_all(file: &Arc<MutFile>) -> Vec<u8> {
    let mut reader = file.open_read().await.expect("open read");
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.expect("read");
    buf
}

#[tokio::test]
async fn test_create_and_write() {
    let h = harness().await;
    let dir = h.root.mkdir("d").await.expect("mkdir");
    let (_file, mut handle) = dir.create("f").await.expect("create");
    assert_eq!(handle.write(0, b"hello").expect("write"), 5);
    handle.release().await.expect("release");

    let dir = h.root.lookup("d").await.expect("lookup d");
    let dir = dir.as_dir().expect("d is a directory").clone();
    let node = dir.lookup("f").await.expect("lookup f");
    let file = node.as_file().expect("f is a file");
    assert_eq!(read_all(file).await, b"hello");
    assert_eq!(file.attr().size, 5);
}

#[tokio::test]
async fn test_append_after_reopen() {
    let h = harness().await;
    let dir = h.root.mkdir("d").await.unwrap();
    let (file, mut handle) = dir.create("f").await.unwrap();
    handle.write(0, b"hello").unwrap();
    handle.release().await.unwrap();

    let mut handle = file.open_rw().await.expect("reopen rw");
    handle.write(5, b" world").unwrap();
    handle.release().await.unwrap();

    assert_eq!(read_all(&file).await, b"hello world");
    assert_eq!(file.attr().size, 11);
}

#[tokio::test]
async fn test_write_then_read_on_same_handle() {
    let h = harness().await;
    let (_file, mut handle) = h.root.create("f").await.unwrap();
    handle.write(0, b"roundtrip").unwrap();
    assert_eq!(handle.read(0, 9).unwrap(), b"roundtrip");
    handle.release().await.unwrap();
}

#[tokio::test]
async fn test_symlink_round_trip() {
    let h = harness().await;
    let dir = h.root.mkdir("d").await.unwrap();
    dir.symlink("lnk", "../target").await.expect("symlink");

    let node = dir.lookup("lnk").await.expect("lookup lnk");
    let link = node.as_file().expect("symlink is a file node");
    assert!(link.is_symlink());
    assert_eq!(link.readlink().expect("readlink"), "../target");

    // symlinks survive the claim log round trip too
    let root = fresh_view(&h);
    let dir = root.lookup("d").await.unwrap();
    let node = dir.as_dir().unwrap().lookup("lnk").await.unwrap();
    assert_eq!(node.as_file().unwrap().readlink().unwrap(), "../target");
}

#[tokio::test]
async fn test_rename_within_directory() {
    let h = harness().await;
    let (file, mut handle) = h.root.create("a").await.unwrap();
    handle.release().await.unwrap();
    let inode = file.inode();

    h.root.rename("a", &h.root, "b").await.expect("rename");

    let err = h.root.lookup("a").await.unwrap_err();
    assert!(err.is_not_found());
    let node = h.root.lookup("b").await.expect("lookup b");
    assert_eq!(node.inode(), inode, "same permanode behind the new name");
}

#[tokio::test]
async fn test_rename_across_directories_moves_node() {
    let h = harness().await;
    let sub = h.root.mkdir("sub").await.unwrap();
    let (file, mut handle) = h.root.create("a").await.unwrap();
    handle.release().await.unwrap();

    h.root.rename("a", &sub, "b").await.expect("rename");

    assert!(h.root.lookup("a").await.unwrap_err().is_not_found());
    let node = sub.lookup("b").await.expect("lookup in destination");
    assert!(node.same_node(&MutNode::File(file.clone())));
    assert_eq!(file.name(), "b");
    let parent = file.parent().expect("moved file keeps a parent");
    assert!(Arc::ptr_eq(&parent, &sub));
}

#[tokio::test]
async fn test_rename_claim_ordering() {
    let h = harness().await;
    let (_file, mut handle) = h.root.create("a").await.unwrap();
    handle.release().await.unwrap();

    h.root.rename("a", &h.root, "b").await.unwrap();

    let log = h.client.claim_log();
    let link = &log[log.len() - 2];
    let unlink = &log[log.len() - 1];
    assert_eq!(link.claim_type, ClaimType::SetAttribute);
    assert_eq!(link.attribute, "camliPath:b");
    assert_eq!(unlink.claim_type, ClaimType::DelAttribute);
    assert_eq!(unlink.attribute, "camliPath:a");
    assert!(link.claim_date.is_some());
    assert_eq!(link.claim_date, unlink.claim_date);
}

#[tokio::test]
async fn test_remove() {
    let h = harness().await;
    let (_file, mut handle) = h.root.create("x").await.unwrap();
    handle.release().await.unwrap();

    h.root.remove("x").await.expect("remove");
    assert!(h.root.lookup("x").await.unwrap_err().is_not_found());

    // a cold cache sees the deletion too: the claim log reflects it
    let root = fresh_view(&h);
    assert!(root.lookup("x").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_truncate_semantics() {
    let h = harness().await;
    let (file, mut handle) = h.root.create("f").await.unwrap();
    handle.write(0, b"hello world").unwrap();
    handle.truncate(3).expect("truncate");
    assert_eq!(handle.read(0, 10).unwrap(), b"hel");
    handle.release().await.unwrap();
    assert_eq!(file.attr().size, 3);
    assert_eq!(read_all(&file).await, b"hel");
}

#[tokio::test]
async fn test_truncate_to_zero_uploads_empty_blob() {
    let h = harness().await;
    let (file, mut handle) = h.root.create("f").await.unwrap();
    handle.write(0, b"data").unwrap();
    handle.truncate(0).unwrap();
    handle.release().await.unwrap();
    assert_eq!(file.attr().size, 0);
    assert_eq!(read_all(&file).await, b"");
}

#[tokio::test]
async fn test_read_past_end_is_short() {
    let h = harness().await;
    let (_file, mut handle) = h.root.create("f").await.unwrap();
    handle.write(0, b"abc").unwrap();
    assert_eq!(handle.read(1, 100).unwrap(), b"bc");
    assert_eq!(handle.read(5, 10).unwrap(), b"");
    handle.release().await.unwrap();
}

#[tokio::test]
async fn test_setattr_size_only_changes_reported_size() {
    let h = harness().await;
    let (file, mut handle) = h.root.create("f").await.unwrap();
    handle.write(0, b"hello").unwrap();

    let attr = file.setattr(SetattrRequest {
        size: Some(2),
        ..Default::default()
    });
    assert_eq!(attr.size, 2);

    // a later write beyond the reported size extends again
    handle.write(5, b" world").unwrap();
    assert_eq!(file.attr().size, 11);
    handle.release().await.unwrap();
}

#[tokio::test]
async fn test_setattr_times() {
    use std::time::{Duration, UNIX_EPOCH};
    let h = harness().await;
    let (file, mut handle) = h.root.create("f").await.unwrap();
    handle.release().await.unwrap();

    let stamp = UNIX_EPOCH + Duration::from_secs(1_234_567);
    let attr = file.setattr(SetattrRequest {
        mtime: Some(stamp),
        atime: Some(stamp),
        size: None,
    });
    assert_eq!(attr.mtime, stamp);
    assert_eq!(attr.atime, stamp);
}

#[tokio::test]
async fn test_released_handle_fails_everything() {
    let h = harness().await;
    let (_file, mut handle) = h.root.create("f").await.unwrap();
    handle.release().await.unwrap();

    assert!(matches!(
        handle.read(0, 1).unwrap_err(),
        FsError::InvalidState(_)
    ));
    assert!(matches!(
        handle.write(0, b"x").unwrap_err(),
        FsError::InvalidState(_)
    ));
    assert!(matches!(
        handle.truncate(0).unwrap_err(),
        FsError::InvalidState(_)
    ));
    assert!(handle.release().await.is_err());
}

#[tokio::test]
async fn test_fsync_commits_and_keeps_handle() {
    let h = harness().await;
    let (file, mut handle) = h.root.create("f").await.unwrap();
    handle.write(0, b"abc").unwrap();
    handle.fsync().await.expect("fsync");

    // the commit is already visible through the claim log
    let root = fresh_view(&h);
    let node = root.lookup("f").await.unwrap();
    assert_eq!(read_all(node.as_file().unwrap()).await, b"abc");

    // and the handle keeps working
    handle.write(3, b"d").unwrap();
    handle.release().await.unwrap();
    assert_eq!(read_all(&file).await, b"abcd");
}

#[tokio::test]
async fn test_open_read_empty_file_yields_eof() {
    let h = harness().await;
    let (file, _handle) = h.root.create("f").await.unwrap();
    assert_eq!(read_all(&file).await, b"");
}

#[tokio::test]
async fn test_populate_interval_suppresses_describe() {
    let h = harness().await;
    h.root.readdir().await.unwrap();
    let after_first = h.client.describe_count();
    h.root.readdir().await.unwrap();
    h.root.lookup("missing").await.unwrap_err();
    assert_eq!(h.client.describe_count(), after_first);
}

#[tokio::test]
async fn test_populate_merge_preserves_local_nodes() {
    let h = harness().await;
    let dir = h.root.mkdir("d").await.unwrap();
    let (file, mut handle) = dir.create("f").await.unwrap();
    handle.release().await.unwrap();

    dir.force_repopulate();
    let node = dir.lookup("f").await.unwrap();
    assert!(
        node.same_node(&MutNode::File(file.clone())),
        "populate must not replace locally created nodes"
    );
    let parent = file.parent().unwrap();
    assert!(Arc::ptr_eq(&parent, &dir));
}

#[tokio::test]
async fn test_children_invariant_after_populate() {
    let h = harness().await;
    let dir = h.root.mkdir("d").await.unwrap();
    let (_file, mut handle) = dir.create("f").await.unwrap();
    handle.release().await.unwrap();
    dir.symlink("l", "f").await.unwrap();

    let root = fresh_view(&h);
    let dir = root.lookup("d").await.unwrap().as_dir().unwrap().clone();
    for entry in dir.readdir().await.unwrap() {
        let child = dir.child(&entry.name).unwrap();
        let (parent, name) = match &child {
            MutNode::Dir(d) => (d.parent(), d.name()),
            MutNode::File(f) => (f.parent(), f.name()),
        };
        assert_eq!(name, entry.name);
        assert!(Arc::ptr_eq(&parent.unwrap(), &dir));
        assert_eq!(child.inode(), entry.inode);
    }
}

#[tokio::test]
async fn test_failed_claim_leaves_map_unchanged() {
    let h = harness().await;
    let (_file, mut handle) = h.root.create("x").await.unwrap();
    handle.release().await.unwrap();

    h.client.set_fail_claims(true);
    assert!(h.root.remove("x").await.is_err());
    assert!(h.root.lookup("x").await.is_ok(), "failed remove keeps the entry");

    assert!(h.root.create("y").await.is_err());
    h.client.set_fail_claims(false);
    assert!(
        h.root.lookup("y").await.unwrap_err().is_not_found(),
        "failed create must not insert the node"
    );
}

#[tokio::test]
async fn test_readlink_on_regular_file_fails() {
    let h = harness().await;
    let (file, mut handle) = h.root.create("f").await.unwrap();
    handle.release().await.unwrap();
    assert!(matches!(
        file.readlink().unwrap_err(),
        FsError::InvalidState(_)
    ));
}

#[tokio::test]
async fn test_inode_is_stable_permanode_projection() {
    let h = harness().await;
    let (file, mut handle) = h.root.create("f").await.unwrap();
    handle.release().await.unwrap();
    assert_eq!(file.inode(), file.permanode().to_inode());

    let root = fresh_view(&h);
    let node = root.lookup("f").await.unwrap();
    assert_eq!(node.inode(), file.inode());
}

#[tokio::test]
async fn test_open_counters() {
    let h = harness().await;
    let (file, mut handle) = h.root.create("f").await.unwrap();
    handle.release().await.unwrap();

    let counters = file.fs().counters();
    let opens = counters.opens();
    file.open_read().await.unwrap();
    let mut handle = file.open_rw().await.unwrap();
    handle.release().await.unwrap();
    assert_eq!(counters.opens(), opens + 2);
    assert!(counters.read_only() >= 1);
    assert!(counters.read_write() >= 1);
    assert_eq!(counters.errors(), 0);
}
