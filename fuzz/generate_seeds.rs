//! Generate seed corpus for fuzzing

use relayfs::archive::tar::TarBuilder;
use relayfs::archive::{ArchiveWriter, CompressionMethod};
use std::fs;
use std::io::Cursor;

fn packed(entries: &[(&str, &[u8])]) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut writer = ArchiveWriter::new(Cursor::new(Vec::new()))?;
    for (path, data) in entries {
        writer.add_file(path, data)?;
    }
    Ok(writer.finish()?.into_inner())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let corpus_dir = "fuzz/corpus/fuzz_archive_parse";
    fs::create_dir_all(corpus_dir)?;

    // The first byte selects the container name in the fuzz target
    let mut seeds: Vec<(&str, u8, Vec<u8>)> = Vec::new();

    let mut tar = TarBuilder::new();
    tar.add_dir("games")?;
    tar.add_file("games/elite.prg", b"\x01\x08ELITE")?;
    tar.add_file("readme.txt", &b"relay ".repeat(200))?;
    let tar = tar.finish();
    seeds.push(("seed_tar", 0, tar.clone()));
    seeds.push(("seed_tar_zst", 1, zstd::encode_all(&tar[..], 3)?));

    seeds.push(("seed_packed_empty", 2, packed(&[])?));
    let large = b"This is test data for compression. ".repeat(1000);
    seeds.push((
        "seed_packed_multi",
        2,
        packed(&[
            ("file1.txt", &b"First file"[..]),
            ("dir/file2.txt", &b"Second file in directory"[..]),
            ("large.txt", &large[..]),
        ])?,
    ));

    let mut writer = ArchiveWriter::new(Cursor::new(Vec::new()))?;
    writer.add_file_with_compression("zero.bin", b"", CompressionMethod::None)?;
    seeds.push(("seed_packed_zero_length", 2, writer.finish()?.into_inner()));

    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    std::io::Write::write_all(&mut encoder, &(0..255u8).collect::<Vec<_>>())?;
    seeds.push(("seed_lz4_single", 3, encoder.finish()?));

    for (name, selector, body) in &seeds {
        let path = format!("{}/{}", corpus_dir, name);
        let mut data = vec![*selector];
        data.extend_from_slice(body);
        fs::write(&path, data)?;
        println!("Generated: {}", path);
    }

    println!("\nGenerated {} seed files in {}", seeds.len(), corpus_dir);
    Ok(())
}
