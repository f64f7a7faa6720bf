//! Removal, compaction and descriptor fix-up.
#![allow(unused)]

mod common;

use std::sync::Arc;

use common::{check_invariants, fresh_fs, list_dir, walk_records, RamNvm};
use xipfs::Error;
use xipfs::FileKind;
use xipfs::OpenFlags;
use xipfs::Xipfs;
use xipfs::HEADER_SIZE;
use xipfs::PAGE_SIZE;

#[test]
fn test_s2_descriptor_survives_shift() {
    let mut fs = fresh_fs();
    fs.new_file("/a", 0, false).unwrap();

    let fd = fs
        .open("/b", OpenFlags::CREATE | OpenFlags::READ_WRITE)
        .unwrap();
    fs.write(fd, b"bee").unwrap();
    fs.fsync(fd).unwrap();

    fs.unlink("/a").unwrap();

    assert_eq!(list_dir(&mut fs, "/"), vec!["b"]);

    // The open descriptor now addresses the shifted record.
    fs.lseek(fd, std::io::SeekFrom::Start(0)).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"bee");
    fs.close(fd).unwrap();

    let records = walk_records(&fs.device(), 0, 8);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].offset, 0);
    assert_eq!(records[0].path, "/b");
    check_invariants(&fs.device(), 0, 8);
}

#[test]
fn test_descriptor_on_victim_is_closed() {
    let mut fs = fresh_fs();
    let fd = fs
        .open("/a", OpenFlags::CREATE | OpenFlags::READ_WRITE)
        .unwrap();

    fs.unlink("/a").unwrap();

    let mut buf = [0u8; 1];
    assert_eq!(fs.read(fd, &mut buf), Err(Error::BadDescriptor));
    assert_eq!(fs.close(fd), Err(Error::BadDescriptor));
}

#[test]
fn test_s3_fill_unlink_refill() {
    let mut fs = fresh_fs();

    let mut created = 0;
    loop {
        match fs.new_file(&format!("/f{}", created), 0, false) {
            Ok(()) => created += 1,
            Err(Error::Quota) => break,
            Err(err) => panic!("unexpected error: {:?}", err),
        }
        check_invariants(&fs.device(), 0, 8);
    }
    assert_eq!(created, 8);

    // The tail carries the full sentinel.
    let records = walk_records(&fs.device(), 0, 8);
    let tail = records.last().unwrap();
    assert_eq!(tail.next as usize, tail.offset);

    fs.unlink("/f0").unwrap();
    check_invariants(&fs.device(), 0, 8);

    // Compaction reshuffled the tail, so the freed page is allocatable.
    fs.new_file("/again", 0, false).unwrap();
    check_invariants(&fs.device(), 0, 8);
    assert_eq!(fs.new_file("/overflow", 0, false), Err(Error::Quota));
}

#[test]
fn test_multi_page_payload_survives_shift() {
    let mut fs = fresh_fs();
    fs.new_file("/a", 0, false).unwrap();
    fs.new_file("/big", (2 * PAGE_SIZE) as u32, false).unwrap();
    fs.new_file("/c", 0, false).unwrap();

    // Payload crossing both payload pages of /big.
    let payload: Vec<u8> = (0..PAGE_SIZE + 600).map(|i| (i % 239) as u8).collect();
    let fd = fs.open("/big", OpenFlags::WRITE_ONLY).unwrap();
    assert_eq!(fs.write(fd, &payload).unwrap(), payload.len());
    fs.close(fd).unwrap();

    let fd = fs
        .open("/c", OpenFlags::WRITE_ONLY | OpenFlags::APPEND)
        .unwrap();
    fs.write(fd, b"tail").unwrap();
    fs.close(fd).unwrap();

    fs.unlink("/a").unwrap();
    check_invariants(&fs.device(), 0, 8);

    // Survivors moved down one page and kept their payload verbatim.
    let records = walk_records(&fs.device(), 0, 8);
    assert_eq!(records[0].path, "/big");
    assert_eq!(records[0].offset, 0);
    assert_eq!(records[1].path, "/c");
    assert_eq!(records[1].offset, 3 * PAGE_SIZE);

    let fd = fs.open("/big", OpenFlags::READ_ONLY).unwrap();
    let mut back = vec![0u8; payload.len()];
    assert_eq!(fs.read(fd, &mut back).unwrap(), payload.len());
    assert_eq!(back, payload);
    fs.close(fd).unwrap();

    let fd = fs.open("/c", OpenFlags::READ_ONLY).unwrap();
    let mut back = [0u8; 8];
    assert_eq!(fs.read(fd, &mut back).unwrap(), 4);
    assert_eq!(&back[..4], b"tail");
    fs.close(fd).unwrap();
}

#[test]
fn test_unlink_rematerializes_empty_parent() {
    let mut fs = fresh_fs();
    fs.mkdir("/d").unwrap();
    fs.new_file("/d/f", 0, false).unwrap();

    // The placeholder was consumed by the first child.
    let paths: Vec<String> = walk_records(&fs.device(), 0, 8)
        .into_iter()
        .map(|r| r.path)
        .collect();
    assert_eq!(paths, vec!["/d/f"]);

    fs.unlink("/d/f").unwrap();

    // Now the directory lives on as a placeholder again.
    let paths: Vec<String> = walk_records(&fs.device(), 0, 8)
        .into_iter()
        .map(|r| r.path)
        .collect();
    assert_eq!(paths, vec!["/d/"]);
    assert_eq!(fs.stat("/d").unwrap().kind, FileKind::Directory);
    assert!(list_dir(&mut fs, "/d").is_empty());
}

#[test]
fn test_unlink_keeps_parent_with_siblings() {
    let mut fs = fresh_fs();
    fs.mkdir("/d").unwrap();
    fs.new_file("/d/f", 0, false).unwrap();
    fs.new_file("/d/g", 0, false).unwrap();

    fs.unlink("/d/f").unwrap();

    let paths: Vec<String> = walk_records(&fs.device(), 0, 8)
        .into_iter()
        .map(|r| r.path)
        .collect();
    assert_eq!(paths, vec!["/d/g"]);
    assert_eq!(list_dir(&mut fs, "/d"), vec!["g"]);
}

#[test]
fn test_format_closes_descriptors() {
    let mut fs = fresh_fs();
    let fd = fs
        .open("/a", OpenFlags::CREATE | OpenFlags::READ_WRITE)
        .unwrap();

    fs.format().unwrap();

    let mut buf = [0u8; 1];
    assert_eq!(fs.read(fd, &mut buf), Err(Error::BadDescriptor));
    assert!(list_dir(&mut fs, "/").is_empty());
    check_invariants(&fs.device(), 0, 8);
}

#[test]
fn test_umount_closes_descriptors() {
    let mut fs = fresh_fs();
    let fd = fs
        .open("/a", OpenFlags::CREATE | OpenFlags::READ_WRITE)
        .unwrap();

    fs.umount().unwrap();

    let mut buf = [0u8; 1];
    assert_eq!(fs.read(fd, &mut buf), Err(Error::BadDescriptor));
}

#[test]
fn test_descriptor_table_capacity() {
    let mut fs = fresh_fs();
    fs.new_file("/f", 0, false).unwrap();

    let mut fds = Vec::new();
    for _ in 0..xipfs::MAX_OPEN_DESC {
        fds.push(fs.open("/f", OpenFlags::READ_ONLY).unwrap());
    }
    assert_eq!(
        fs.open("/f", OpenFlags::READ_ONLY),
        Err(Error::TooManyOpen)
    );

    fs.close(fds.pop().unwrap()).unwrap();
    let fd = fs.open("/f", OpenFlags::READ_ONLY).unwrap();
    fs.close(fd).unwrap();
}

#[test]
fn test_sequences_hold_invariants() {
    let mut fs = fresh_fs();

    fs.mkdir("/d").unwrap();
    check_invariants(&fs.device(), 0, 8);
    fs.new_file("/d/a", 0, false).unwrap();
    check_invariants(&fs.device(), 0, 8);
    fs.new_file("/d/b", 300, false).unwrap();
    check_invariants(&fs.device(), 0, 8);
    fs.rename("/d/a", "/d/c").unwrap();
    check_invariants(&fs.device(), 0, 8);
    fs.unlink("/d/c").unwrap();
    check_invariants(&fs.device(), 0, 8);
    fs.rename("/d/", "/e/").unwrap();
    check_invariants(&fs.device(), 0, 8);
    fs.unlink("/e/b").unwrap();
    check_invariants(&fs.device(), 0, 8);
    fs.rmdir("/e").unwrap();
    check_invariants(&fs.device(), 0, 8);

    assert!(list_dir(&mut fs, "/").is_empty());
    fs.mount().unwrap();
}
