//! End-to-end exercise of the storage pool, upsert engine, and
//! archive/restore codec together, the way a real deployment chains them
//! (§4.1-§4.3, property P1).

use alloy_rlp::bytes::Bytes;
use monad_core::mpt::archive::{archive, restore};
use monad_core::mpt::chunk::{ChunkList, ChunkType};
use monad_core::mpt::engine::{StateMachine, UpdateAux, UpdateList};
use monad_core::mpt::pool::{open_file_pool, OpenFlags, OpenMode};
use std::sync::Arc;
use tempfile::tempdir;

fn make_aux(dir: &std::path::Path, chunk_count: u32) -> Arc<UpdateAux<monad_core::mpt::device::FileDevice>> {
    let sources = vec![
        (ChunkType::Conventional, dir.join("cnv"), chunk_count),
        (ChunkType::Sequential, dir.join("seq"), chunk_count),
    ];
    let pool = open_file_pool(&sources, OpenMode::CreateIfNeeded, 16, OpenFlags::default()).expect("open pool");
    Arc::new(UpdateAux::new(Arc::new(pool), StateMachine::default(), 16))
}

#[test]
fn sequential_versions_stay_readable_through_the_engine() {
    let dir = tempdir().expect("tempdir");
    let aux = make_aux(dir.path(), 64);

    let mut root = None;
    for v in 0u64..5 {
        let mut updates = UpdateList::new();
        let key = format!("account-{v}").into_bytes();
        updates.put(key, Bytes::from(vec![v as u8; 32]));
        root = Some(aux.upsert(root, updates, v).expect("upsert"));
    }

    for v in 0u64..5 {
        let key = format!("account-{v}").into_bytes();
        let value = aux.find(&key, v).expect("find").expect("present");
        assert_eq!(value.as_ref(), vec![v as u8; 32]);
    }
}

#[test]
fn archive_then_restore_preserves_chunk_membership() {
    let src_dir = tempdir().expect("src dir");
    let aux = make_aux(src_dir.path(), 64);

    let mut root = None;
    for v in 0u64..5 {
        let mut updates = UpdateList::new();
        let key = format!("account-{v}").into_bytes();
        updates.put(key, Bytes::from(vec![v as u8; 32]));
        root = Some(aux.upsert(root, updates, v).expect("upsert"));
    }

    let mut buf = Vec::new();
    archive(aux.pool(), &mut buf, 3).expect("archive");

    let dst_dir = tempdir().expect("dst dir");
    let dst_sources = vec![
        (ChunkType::Conventional, dst_dir.path().join("cnv"), 64),
        (ChunkType::Sequential, dst_dir.path().join("seq"), 64),
    ];
    let dst_pool = open_file_pool(&dst_sources, OpenMode::CreateIfNeeded, 16, OpenFlags::default()).expect("open dst pool");
    restore(&dst_pool, &buf[..], 1 << 30).expect("restore");

    assert_eq!(dst_pool.list_members(ChunkList::Fast), aux.pool().list_members(ChunkList::Fast));
    assert_eq!(dst_pool.list_members(ChunkList::Slow), aux.pool().list_members(ChunkList::Slow));
}

#[test]
fn restoring_into_a_too_small_pool_is_rejected() {
    let src_dir = tempdir().expect("src dir");
    let aux = make_aux(src_dir.path(), 64);
    let mut updates = UpdateList::new();
    updates.put(b"k".to_vec(), Bytes::from_static(b"v"));
    aux.upsert(None, updates, 0).expect("upsert");

    let mut buf = Vec::new();
    archive(aux.pool(), &mut buf, 3).expect("archive");

    let dst_dir = tempdir().expect("dst dir");
    let dst_sources = vec![
        (ChunkType::Conventional, dst_dir.path().join("cnv"), 1),
        (ChunkType::Sequential, dst_dir.path().join("seq"), 1),
    ];
    let dst_pool = open_file_pool(&dst_sources, OpenMode::CreateIfNeeded, 16, OpenFlags::default()).expect("open dst pool");
    assert!(restore(&dst_pool, &buf[..], 1 << 30).is_err());
}
