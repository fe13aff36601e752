//! Heap and paged buffers behave like a plain byte vector

use proptest::prelude::*;
use relayfs::cache::{PagePool, PagedMemory};
use relayfs::{CachePolicy, CachedBuffer};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u64, data: Vec<u8> },
    Read { offset: u64, len: usize },
}

fn op(size: u64) -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..size + 64, prop::collection::vec(any::<u8>(), 0..300))
            .prop_map(|(offset, data)| Op::Write { offset, data }),
        (0..size + 64, 0usize..300).prop_map(|(offset, len)| Op::Read { offset, len }),
    ]
}

fn paged_policy(page_size: usize) -> (Arc<PagePool>, CachePolicy) {
    let pool = Arc::new(PagePool::new(page_size, 1 << 20));
    let memory = Arc::new(PagedMemory::new(pool.clone(), 2));
    (pool, CachePolicy::paged(memory, 0))
}

/// Apply `ops` to `buffer` and to a vector model, comparing every result
fn check_against_model(mut buffer: CachedBuffer, size: u64, ops: &[Op]) -> Result<(), TestCaseError> {
    let mut model = vec![0u8; size as usize];
    for op in ops {
        match op {
            Op::Write { offset, data } => {
                let written = buffer.write(*offset, data).unwrap();
                let start = (*offset).min(size) as usize;
                let end = (start + data.len()).min(size as usize);
                prop_assert_eq!(written, end - start);
                model[start..end].copy_from_slice(&data[..end - start]);
            }
            Op::Read { offset, len } => {
                let mut buf = vec![0xAAu8; *len];
                let read = buffer.read(*offset, &mut buf).unwrap();
                let start = (*offset).min(size) as usize;
                let end = (start + len).min(size as usize);
                prop_assert_eq!(read, end - start);
                prop_assert_eq!(&buf[..read], &model[start..end]);
            }
        }
    }
    prop_assert_eq!(buffer.to_vec().unwrap(), model);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn heap_buffer_matches_model(
        (size, ops) in (1u64..2000).prop_flat_map(|size| (Just(size), prop::collection::vec(op(size), 1..20)))
    ) {
        let buffer = CachedBuffer::heap(size).unwrap();
        check_against_model(buffer, size, &ops)?;
    }

    #[test]
    fn paged_buffer_matches_model(
        page_size in prop_oneof![Just(16usize), Just(100), Just(512)],
        (size, ops) in (1u64..2000).prop_flat_map(|size| (Just(size), prop::collection::vec(op(size), 1..20)))
    ) {
        let (pool, policy) = paged_policy(page_size);
        let buffer = CachedBuffer::allocate(size, &policy).unwrap();
        prop_assert!(buffer.is_paged());
        check_against_model(buffer, size, &ops)?;
        prop_assert_eq!(pool.used_pages(), 0);
        prop_assert_eq!(pool.live_ranges(), 0);
    }
}

#[test]
fn test_paged_load_and_release() {
    let (pool, policy) = paged_policy(64);
    let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

    let buffer = CachedBuffer::from_reader(data.len() as u64, &policy, &data[..]).unwrap();
    assert!(buffer.is_paged());
    assert!(!buffer.is_dirty());
    assert_eq!(pool.used_pages(), 16);
    assert_eq!(pool.live_ranges(), 1);

    let mut middle = [0u8; 100];
    assert_eq!(buffer.read(450, &mut middle).unwrap(), 100);
    assert_eq!(&middle[..], &data[450..550]);

    drop(buffer);
    assert_eq!(pool.used_pages(), 0);
    assert_eq!(pool.live_ranges(), 0);
}

#[test]
fn test_short_source_fails_load() {
    let err = CachedBuffer::from_reader(100, &CachePolicy::heap(), &[1u8; 40][..]).unwrap_err();
    assert_eq!(err.code(), relayfs::Errno::EIO);
}
