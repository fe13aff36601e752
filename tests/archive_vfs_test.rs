//! Archive entries reached through the Vfs, with containers on local disk

use relayfs::archive::tar::TarBuilder;
use relayfs::archive::ArchiveContainer;
use relayfs::vfs::BufferStream;
use relayfs::{
    read_all, write_all, ArchiveConfig, ArchiveWriter, CachePolicy, Errno, OpenMode, RelayConfig, RelayError, Url,
    Vfs,
};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn test_vfs() -> Vfs {
    let mut config = RelayConfig::default();
    config.broker.background_sweep = false;
    Vfs::new(config).unwrap()
}

fn write_tar(path: &Path, files: &[(&str, &[u8])]) {
    let mut builder = TarBuilder::new();
    for (name, data) in files {
        builder.add_file(name, data).unwrap();
    }
    fs::write(path, builder.finish()).unwrap();
}

fn at(dir: &TempDir, rest: &str) -> String {
    format!("{}/{}", dir.path().display(), rest)
}

fn names(vfs: &Vfs, url: &str) -> Vec<String> {
    let mut dir = vfs.get_file(url).unwrap();
    let mut names = Vec::new();
    while let Some(child) = dir.next_in_dir() {
        names.push(child.name());
    }
    names
}

#[test]
fn test_read_entry_from_tar() {
    let dir = TempDir::new().unwrap();
    write_tar(
        &dir.path().join("games.tar"),
        &[("disk1/elite.prg", b"\x01\x08ELITE"), ("readme.txt", b"hello")],
    );
    let vfs = test_vfs();

    let mut stream = vfs.open(&at(&dir, "games.tar/disk1/elite.prg"), OpenMode::IN).unwrap();
    assert_eq!(stream.size(), 7);
    assert!(stream.is_random_access());
    assert_eq!(read_all(stream.as_mut()).unwrap(), b"\x01\x08ELITE");

    stream.seek(2).unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(stream.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf, b"ELITE");

    let err = stream.seek(8).unwrap_err();
    assert_eq!(err.code(), Errno::EINVAL);
    assert_eq!(stream.error(), Errno::EINVAL);
}

#[test]
fn test_container_listing() {
    let dir = TempDir::new().unwrap();
    write_tar(
        &dir.path().join("games.tar"),
        &[("disk1/elite.prg", b"E"), ("disk1/zork.prg", b"Z"), ("readme.txt", b"hello")],
    );
    let vfs = test_vfs();

    let mut root = vfs.get_file(&at(&dir, "games.tar")).unwrap();
    assert!(root.exists());
    assert!(root.is_directory());
    assert_eq!(names(&vfs, &at(&dir, "games.tar")), vec!["disk1", "readme.txt"]);
    assert_eq!(names(&vfs, &at(&dir, "games.tar/disk1")), vec!["elite.prg", "zork.prg"]);

    let mut readme = vfs.get_file(&at(&dir, "games.tar/readme.txt")).unwrap();
    assert!(!readme.is_directory());
    assert_eq!(readme.size(), 5);
    assert!(!vfs.get_file(&at(&dir, "games.tar/missing.prg")).unwrap().exists());
}

#[test]
fn test_wildcard_entry() {
    let dir = TempDir::new().unwrap();
    write_tar(
        &dir.path().join("set.tar"),
        &[("notes.txt", b"n"), ("images/Zork.D64", b"zork disk")],
    );
    let vfs = test_vfs();

    let mut stream = vfs.open(&at(&dir, "set.tar/*.d64"), OpenMode::IN).unwrap();
    assert_eq!(read_all(stream.as_mut()).unwrap(), b"zork disk");

    let err = vfs.open(&at(&dir, "set.tar/*.t64"), OpenMode::IN).err().unwrap();
    assert!(matches!(err, RelayError::EntryNotFound(_)));
}

#[test]
fn test_nested_containers() {
    let dir = TempDir::new().unwrap();
    let mut inner = TarBuilder::new();
    inner.add_file("deep/file.txt", b"nested").unwrap();
    let inner = inner.finish();
    write_tar(&dir.path().join("outer.tar"), &[("inner.tar", &inner)]);
    let vfs = test_vfs();

    let mut stream = vfs
        .open(&at(&dir, "outer.tar/inner.tar/deep/file.txt"), OpenMode::IN)
        .unwrap();
    assert_eq!(read_all(stream.as_mut()).unwrap(), b"nested");
}

#[test]
fn test_compressed_tar() {
    let dir = TempDir::new().unwrap();
    let mut builder = TarBuilder::new();
    builder.add_file("a.txt", &[b'a'; 4096]).unwrap();
    let packed = zstd::encode_all(&builder.finish()[..], 3).unwrap();
    fs::write(dir.path().join("a.tar.zst"), packed).unwrap();
    let vfs = test_vfs();

    let mut stream = vfs.open(&at(&dir, "a.tar.zst/a.txt"), OpenMode::IN).unwrap();
    assert_eq!(read_all(stream.as_mut()).unwrap(), vec![b'a'; 4096]);
}

#[test]
fn test_packed_container() {
    let dir = TempDir::new().unwrap();
    let mut writer = ArchiveWriter::create(dir.path().join("pack.rpk")).unwrap();
    writer.add_file("docs/manual.txt", "manual ".repeat(200).as_bytes()).unwrap();
    writer.add_file("bin/tool.prg", b"\x01\x08TOOL").unwrap();
    writer.finish().unwrap();
    let vfs = test_vfs();

    assert_eq!(names(&vfs, &at(&dir, "pack.rpk")), vec!["bin", "docs"]);
    let mut stream = vfs.open(&at(&dir, "pack.rpk/docs/manual.txt"), OpenMode::IN).unwrap();
    assert_eq!(read_all(stream.as_mut()).unwrap(), "manual ".repeat(200).as_bytes());
}

#[test]
fn test_zip_entries() {
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    let dir = TempDir::new().unwrap();
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    writer.start_file("disk1/elite.prg", options).unwrap();
    writer.write_all(b"\x01\x08ELITE").unwrap();
    writer.start_file("readme.txt", options).unwrap();
    writer.write_all(&b"zip ".repeat(100)).unwrap();
    fs::write(dir.path().join("bundle.zip"), writer.finish().unwrap().into_inner()).unwrap();
    let vfs = test_vfs();

    assert_eq!(names(&vfs, &at(&dir, "bundle.zip")), vec!["disk1", "readme.txt"]);
    let mut stream = vfs.open(&at(&dir, "bundle.zip/disk1/elite.prg"), OpenMode::IN).unwrap();
    assert_eq!(read_all(stream.as_mut()).unwrap(), b"\x01\x08ELITE");
    let mut readme = vfs.open(&at(&dir, "bundle.zip/README.TXT"), OpenMode::IN).unwrap();
    assert_eq!(readme.size(), 400);
    assert_eq!(read_all(readme.as_mut()).unwrap(), b"zip ".repeat(100));
}

#[test]
fn test_gzipped_tar_entries() {
    use std::io::Write;

    let dir = TempDir::new().unwrap();
    let mut builder = TarBuilder::new();
    builder.add_file("disk1/zork.prg", b"ZORK").unwrap();
    builder.add_file("notes.txt", b"west of house").unwrap();
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&builder.finish()).unwrap();
    fs::write(dir.path().join("games.tar.gz"), encoder.finish().unwrap()).unwrap();
    let vfs = test_vfs();

    let mut stream = vfs.open(&at(&dir, "games.tar.gz/notes.txt"), OpenMode::IN).unwrap();
    assert_eq!(read_all(stream.as_mut()).unwrap(), b"west of house");
    let mut stream = vfs.open(&at(&dir, "games.tar.gz/disk1/zork.prg"), OpenMode::IN).unwrap();
    assert_eq!(read_all(stream.as_mut()).unwrap(), b"ZORK");
}

#[test]
fn test_unsupported_container_format() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("bundle.7z"), b"7z\xBC\xAF\x27\x1Cnot really a 7z").unwrap();
    let vfs = test_vfs();

    let err = vfs.open(&at(&dir, "bundle.7z/a.txt"), OpenMode::IN).err().unwrap();
    assert!(matches!(err, RelayError::UnsupportedFormat(_)));
}

#[test]
fn test_entry_writes_stay_in_cache() {
    let dir = TempDir::new().unwrap();
    let tar = dir.path().join("save.tar");
    write_tar(&tar, &[("slot.sav", b"00000000")]);
    let before = fs::read(&tar).unwrap();
    let vfs = test_vfs();
    let url = at(&dir, "save.tar/slot.sav");

    {
        let mut stream = vfs.open(&url, OpenMode::IN | OpenMode::OUT).unwrap();
        stream.seek(4).unwrap();
        write_all(stream.as_mut(), b"1234").unwrap();

        let err = stream.write(b"x").unwrap_err();
        assert_eq!(err.code(), Errno::ENOSPC);
    }

    let mut again = vfs.open(&url, OpenMode::IN).unwrap();
    assert_eq!(read_all(again.as_mut()).unwrap(), b"00001234");
    assert_eq!(fs::read(&tar).unwrap(), before);

    let err = vfs.open(&url, OpenMode::OUT | OpenMode::TRUNC).err().unwrap();
    assert_eq!(err.code(), Errno::EROFS);
}

#[test]
fn test_container_root_is_not_a_stream() {
    let dir = TempDir::new().unwrap();
    write_tar(&dir.path().join("games.tar"), &[("a", b"a")]);
    let vfs = test_vfs();

    let err = vfs.open(&at(&dir, "games.tar"), OpenMode::IN).err().unwrap();
    assert_eq!(err.code(), Errno::EISDIR);
}

#[test]
fn test_late_entry_forward_only_and_seekable() {
    let mut builder = TarBuilder::new();
    for index in 0..50 {
        let data = if index == 42 {
            (0..5120u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>()
        } else {
            format!("entry {}", index).into_bytes()
        };
        builder.add_file(&format!("files/{:02}.bin", index), &data).unwrap();
    }
    let bytes = builder.finish();
    let expected: Vec<u8> = (0..5120u32).map(|i| (i % 251) as u8).collect();
    let url = Url::parse("mem:/big.tar").unwrap();

    let mut seekable = BufferStream::new(url.clone(), bytes.clone());
    let mut forward = BufferStream::new(url, bytes).forward_only();
    for stream in [&mut seekable, &mut forward] {
        let mut container = ArchiveContainer::new(stream, "big.tar", &ArchiveConfig::default());
        container.open().unwrap();
        // Indices count from 1
        assert!(container.seek_entry_index(43).unwrap());
        assert_eq!(container.entry().unwrap().name, "files/42.bin");
        let buffer = container.extract(&CachePolicy::heap()).unwrap();
        assert_eq!(buffer.size(), 5120);
        assert_eq!(buffer.to_vec().unwrap(), expected);

        // Back to the start of the container
        assert!(container.seek_entry_index(1).unwrap());
        assert_eq!(container.entry().unwrap().name, "files/00.bin");
    }
    assert!(forward.reopen_count() >= 1);
    assert_eq!(seekable.reopen_count(), 0);
}

#[test]
fn test_container_session_is_reused() {
    let dir = TempDir::new().unwrap();
    write_tar(&dir.path().join("games.tar"), &[("a", b"a"), ("b", b"b")]);
    let vfs = test_vfs();

    read_all(vfs.open(&at(&dir, "games.tar/a"), OpenMode::IN).unwrap().as_mut()).unwrap();
    read_all(vfs.open(&at(&dir, "games.tar/b"), OpenMode::IN).unwrap().as_mut()).unwrap();
    assert_eq!(vfs.broker().count(), 1);

    // Archive sessions are never probed by the sweep
    let report = vfs.broker().service();
    assert!(report.evicted.is_empty());
    assert_eq!(vfs.broker().count(), 1);
}
