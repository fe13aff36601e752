//! Local files, `.url` links and `digest:` URLs

use relayfs::archive::tar::TarBuilder;
use relayfs::{read_all, write_all, Errno, OpenMode, RelayConfig, RelayError, Vfs};
use std::fs;
use tempfile::TempDir;

fn test_vfs() -> Vfs {
    let mut config = RelayConfig::default();
    config.broker.background_sweep = false;
    Vfs::new(config).unwrap()
}

fn at(dir: &TempDir, rest: &str) -> String {
    format!("{}/{}", dir.path().display(), rest)
}

#[test]
fn test_local_roundtrip_and_listing() {
    let dir = TempDir::new().unwrap();
    let vfs = test_vfs();

    vfs.get_file(&at(&dir, "sub")).unwrap().mkdir().unwrap();
    {
        let mut out = vfs.open(&at(&dir, "sub/notes.txt"), OpenMode::OUT).unwrap();
        write_all(out.as_mut(), b"first").unwrap();
    }
    {
        let mut out = vfs.open(&at(&dir, "sub/notes.txt"), OpenMode::OUT | OpenMode::APP).unwrap();
        write_all(out.as_mut(), b" second").unwrap();
    }
    assert_eq!(fs::read(dir.path().join("sub/notes.txt")).unwrap(), b"first second");

    let mut sub = vfs.get_file(&at(&dir, "sub")).unwrap();
    assert!(sub.is_directory());
    let child = sub.next_in_dir().unwrap();
    assert_eq!(child.name(), "notes.txt");
    assert!(sub.next_in_dir().is_none());

    let mut file = vfs.get_file(&at(&dir, "sub/notes.txt")).unwrap();
    assert_eq!(file.size(), 12);
    assert!(file.last_write().is_some());

    // Local files are not session backed
    assert_eq!(vfs.broker().count(), 0);
}

#[test]
fn test_local_missing_file() {
    let dir = TempDir::new().unwrap();
    let vfs = test_vfs();

    let mut file = vfs.get_file(&at(&dir, "nothing.prg")).unwrap();
    assert!(!file.exists());
    let err = file.source_stream(OpenMode::IN).err().unwrap();
    assert_eq!(err.code(), Errno::ENOENT);
}

#[test]
fn test_link_opens_target() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("target.prg"), b"\x01\x08TARGET").unwrap();
    fs::write(
        dir.path().join("shortcut.url"),
        format!("[InternetShortcut]\r\nURL={}\r\n", at(&dir, "target.prg")),
    )
    .unwrap();
    let vfs = test_vfs();

    let mut stream = vfs.open(&at(&dir, "shortcut.url"), OpenMode::IN).unwrap();
    assert_eq!(read_all(stream.as_mut()).unwrap(), b"\x01\x08TARGET");
}

#[test]
fn test_link_into_archive_and_chained_links() {
    let dir = TempDir::new().unwrap();
    let mut builder = TarBuilder::new();
    builder.add_file("disk1/elite.prg", b"ELITE").unwrap();
    fs::write(dir.path().join("games.tar"), builder.finish()).unwrap();
    fs::write(dir.path().join("elite.url"), at(&dir, "games.tar/disk1/elite.prg")).unwrap();
    fs::write(dir.path().join("again.url"), format!("{}\n", at(&dir, "elite.url"))).unwrap();
    let vfs = test_vfs();

    let mut stream = vfs.open(&at(&dir, "again.url"), OpenMode::IN).unwrap();
    assert_eq!(read_all(stream.as_mut()).unwrap(), b"ELITE");
}

#[test]
fn test_link_cycle_is_bounded() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.url"), at(&dir, "b.url")).unwrap();
    fs::write(dir.path().join("b.url"), at(&dir, "a.url")).unwrap();
    let vfs = test_vfs();

    let err = vfs.get_file(&at(&dir, "a.url")).err().unwrap();
    assert!(matches!(err, RelayError::PathError(_)));
}

#[test]
fn test_missing_link_is_a_plain_file() {
    let dir = TempDir::new().unwrap();
    let vfs = test_vfs();
    let url = at(&dir, "new.url");

    {
        let mut out = vfs.open(&url, OpenMode::OUT).unwrap();
        write_all(out.as_mut(), b"http://example.com/x.prg\n").unwrap();
    }
    assert_eq!(
        fs::read_to_string(dir.path().join("new.url")).unwrap(),
        "http://example.com/x.prg\n"
    );
}

#[test]
fn test_digest_of_local_file() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("abc.bin"), b"abc").unwrap();
    let vfs = test_vfs();

    let url = format!("digest:{}#algo=sha256", at(&dir, "abc.bin"));
    let mut file = vfs.get_file(&url).unwrap();
    assert!(file.exists());
    assert_eq!(file.size(), 64);

    let mut stream = file.source_stream(OpenMode::IN).unwrap();
    assert_eq!(
        read_all(stream.as_mut()).unwrap(),
        b"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );

    let err = file.source_stream(OpenMode::OUT).err().unwrap();
    assert_eq!(err.code(), Errno::EROFS);
}

#[test]
fn test_digest_defaults_and_rejects_unknown_algorithms() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("empty.bin"), b"").unwrap();
    let vfs = test_vfs();

    let mut stream = vfs
        .open(&format!("digest:{}", at(&dir, "empty.bin")), OpenMode::IN)
        .unwrap();
    assert_eq!(
        read_all(stream.as_mut()).unwrap(),
        b"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );

    let err = vfs
        .get_file(&format!("digest:{}#algo=md5", at(&dir, "empty.bin")))
        .err()
        .unwrap();
    assert_eq!(err.code(), Errno::EINVAL);
}
