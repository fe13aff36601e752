#![no_main]

use libfuzzer_sys::fuzz_target;
use relayfs::archive::{ArchiveReader, SliceSource};

const NAMES: &[&str] = &["fuzz.tar", "fuzz.tar.zst", "fuzz.rpk", "fuzz.d64.lz4", "fuzz.tgz", "fuzz.zip"];

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    // The name only steers single-entry naming; detection is by content
    let name = NAMES[data[0] as usize % NAMES.len()];

    // Small blocks exercise refills across header boundaries
    let mut reader = match ArchiveReader::open(SliceSource::with_block(&data[1..], 97), name) {
        Ok(r) => r,
        Err(_) => return,
    };

    let mut buf = [0u8; 512];
    for _ in 0..256 {
        match reader.next_entry() {
            Ok(Some(entry)) => {
                if entry.is_file() {
                    while let Ok(n) = reader.read_data(&mut buf) {
                        if n == 0 {
                            break;
                        }
                    }
                }
            }
            _ => break,
        }
    }

    if reader.rewind().is_ok() {
        let _ = reader.next_entry();
    }
});
