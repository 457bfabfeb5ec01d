//! The trie engine: `UpdateAux`, the upsert algorithm, compaction, and
//! version history (§4.2).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use ahash::AHashMap;
use alloy_primitives::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::oneshot;

use super::chunk::{ChunkList, ChunkType, VirtualOffset};
use super::node::{key_to_nibbles, ChildPointer, Node, NibblePath};
use super::pool::{Pool, PoolError};
use crate::mpt::device::Device;

/// A 64-bit monotone version counter (§3.3).
pub type Version = u64;

/// A batch of key -> new-value-or-deletion updates applied atomically by one
/// `upsert` call (§4.2).
#[derive(Debug, Clone, Default)]
pub struct UpdateList {
    entries: Vec<(Vec<u8>, Option<Bytes>)>,
}

impl UpdateList {
    /// An empty update batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert `key` to `value`.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Bytes>) -> &mut Self {
        self.entries.push((key.into(), Some(value.into())));
        self
    }

    /// Mark `key` for deletion.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.entries.push((key.into(), None));
        self
    }
}

/// Policy knobs for a single `UpdateAux` (§4.2 "fast vs slow routing").
#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    /// When false, all new nodes are forced to the slow list (used under
    /// space pressure, or by tests exercising slow-list-only behavior).
    pub can_write_to_fast: bool,
    /// When true, alternates fast/slow routing per node instead of the
    /// default "new nodes go fast" policy; test-only override (§4.2).
    pub alternate_slow_fast_writer: bool,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            can_write_to_fast: true,
            alternate_slow_fast_writer: false,
        }
    }
}

/// Errors from the trie engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MptError {
    /// Underlying storage pool error.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
    /// A node record on disk failed to decode.
    #[error("corrupt node record at {0:?}")]
    CorruptNode(VirtualOffset),
    /// The requested version has been compacted away (§3.3, scenario S6).
    #[error("version {0} no longer exists")]
    VersionNoLongerExists(Version),
    /// Another thread attempted to drive the upsert thread's exclusive
    /// operations (§4.2 "Concurrency contract"); this is a programmer error
    /// and would abort the process in a production build.
    #[error("upsert called from non-owning thread")]
    WrongThread,
    /// A lock upgrade observed an upsert completing during the gap (§4.2).
    #[error("upsert completed during shared-to-exclusive lock upgrade")]
    ConcurrentUpsertDetected,
}

/// One pending continuation waiting on a virtual offset to materialize
/// (§4.2 "Coalesced async reads").
type InflightWaiters = AHashMap<VirtualOffset, Vec<oneshot::Sender<Option<Node>>>>;

/// The trie engine's mutator/reader handle (§4.2).
pub struct UpdateAux<D: Device> {
    pool: Arc<Pool<D>>,
    state_machine: StateMachine,
    owner_thread: RwLock<Option<ThreadId>>,
    upsert_call_count: AtomicU64,
    roots: RwLock<VecDeque<(Version, VirtualOffset)>>,
    history_length: RwLock<u32>,
    db_history_min_valid_version: AtomicU64,
    db_history_max_version: AtomicU64,
    compact_offset_fast: RwLock<VirtualOffset>,
    compact_offset_slow: RwLock<VirtualOffset>,
    active_fast_chunk: RwLock<super::chunk::ChunkId>,
    active_slow_chunk: RwLock<super::chunk::ChunkId>,
    inflight: RwLock<InflightWaiters>,
    alternate_toggle: RwLock<bool>,
}

impl<D: Device> UpdateAux<D> {
    /// Build a fresh engine over `pool`, with no retained versions yet.
    /// The first two sequential chunks are claimed as the initial fast and
    /// slow write targets.
    pub fn new(pool: Arc<Pool<D>>, state_machine: StateMachine, history_length: u32) -> Self {
        pool.append(ChunkList::Fast, 0).ok();
        pool.append(ChunkList::Slow, 1).ok();
        Self {
            pool,
            state_machine,
            owner_thread: RwLock::new(None),
            upsert_call_count: AtomicU64::new(0),
            roots: RwLock::new(VecDeque::new()),
            history_length: RwLock::new(history_length),
            db_history_min_valid_version: AtomicU64::new(0),
            db_history_max_version: AtomicU64::new(0),
            compact_offset_fast: RwLock::new(VirtualOffset::NULL),
            compact_offset_slow: RwLock::new(VirtualOffset::NULL),
            active_fast_chunk: RwLock::new(0),
            active_slow_chunk: RwLock::new(1),
            inflight: RwLock::new(HashMap::default()),
            alternate_toggle: RwLock::new(false),
        }
    }

    fn check_owner_thread(&self) -> Result<(), MptError> {
        let current = std::thread::current().id();
        let mut owner = self.owner_thread.write();
        match *owner {
            Some(id) if id != current => Err(MptError::WrongThread),
            Some(_) => Ok(()),
            None => {
                *owner = Some(current);
                Ok(())
            }
        }
    }

    /// The underlying storage pool, for callers that need to archive or
    /// otherwise operate on it directly (§4.3).
    pub fn pool(&self) -> &Arc<Pool<D>> {
        &self.pool
    }

    /// Root offset for `version`, if still retained.
    pub fn root_at(&self, version: Version) -> Result<VirtualOffset, MptError> {
        let roots = self.roots.read();
        roots
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, o)| *o)
            .ok_or(MptError::VersionNoLongerExists(version))
    }

    /// Current retained version window `[min_valid, max]`.
    pub fn history_window(&self) -> (Version, Version) {
        (
            self.db_history_min_valid_version.load(Ordering::Acquire),
            self.db_history_max_version.load(Ordering::Acquire),
        )
    }

    fn choose_list(&self) -> ChunkList {
        if !self.state_machine.can_write_to_fast {
            return ChunkList::Slow;
        }
        if self.state_machine.alternate_slow_fast_writer {
            let mut t = self.alternate_toggle.write();
            *t = !*t;
            return if *t { ChunkList::Fast } else { ChunkList::Slow };
        }
        ChunkList::Fast
    }

    fn write_node(&self, node: &Node, list: ChunkList) -> Result<VirtualOffset, MptError> {
        let chunk_id = match list {
            ChunkList::Fast => *self.active_fast_chunk.read(),
            ChunkList::Slow => *self.active_slow_chunk.read(),
            ChunkList::Free => unreachable!("nodes are never written to the free list"),
        };
        let handle = self.pool.activate_chunk(ChunkType::Sequential, chunk_id)?;
        let bytes = node.encode();
        let offset = match handle.reserve(bytes.len() as u32) {
            Ok(o) => o,
            Err(_) => {
                // Current chunk is full; roll onto the next chunk id and
                // register it with the pool under the same list.
                let next_id = chunk_id + 1;
                self.pool.append(list, next_id)?;
                match list {
                    ChunkList::Fast => *self.active_fast_chunk.write() = next_id,
                    ChunkList::Slow => *self.active_slow_chunk.write() = next_id,
                    ChunkList::Free => unreachable!(),
                }
                let handle = self.pool.activate_chunk(ChunkType::Sequential, next_id)?;
                handle.reserve(bytes.len() as u32)?
            }
        };
        let handle = self.pool.activate_chunk(ChunkType::Sequential, offset.chunk_id())?;
        handle.write_at(offset.offset(), &bytes)?;
        Ok(offset)
    }

    fn read_node(&self, offset: VirtualOffset) -> Result<Node, MptError> {
        if offset.is_null() {
            return Err(MptError::CorruptNode(offset));
        }
        let handle = self.pool.activate_chunk(ChunkType::Sequential, offset.chunk_id())?;
        let mut len_buf = [0u8; 4];
        handle.read_at(offset.offset(), &mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        handle.read_at(offset.offset() + 4, &mut body)?;
        Node::decode(&body).ok_or(MptError::CorruptNode(offset))
    }

    /// Asynchronously read a node at `offset`, coalescing concurrent
    /// requests for the same offset into a single underlying read (§4.2
    /// "async/fiber" reads, "in-flight table").
    pub async fn read_node_async(&self, offset: VirtualOffset) -> Result<Node, MptError> {
        let (tx, rx) = oneshot::channel();
        let is_leader = {
            let mut inflight = self.inflight.write();
            let waiters = inflight.entry(offset).or_default();
            let is_leader = waiters.is_empty();
            waiters.push(tx);
            is_leader
        };
        if is_leader {
            let result = self.read_node(offset).ok();
            let mut inflight = self.inflight.write();
            if let Some(waiters) = inflight.remove(&offset) {
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            }
        }
        rx.await
            .ok()
            .flatten()
            .ok_or(MptError::CorruptNode(offset))
    }

    /// Recursively look up `key` under the subtree rooted at `offset`.
    fn find_in(&self, offset: VirtualOffset, nibbles: &[u8]) -> Result<Option<Bytes>, MptError> {
        if offset.is_null() {
            return Ok(None);
        }
        let node = self.read_node(offset)?;
        match node {
            Node::Leaf { path, value } => {
                if path == nibbles {
                    Ok(Some(value))
                } else {
                    Ok(None)
                }
            }
            Node::Extension { path, child } => {
                if nibbles.starts_with(&path[..]) {
                    self.find_in(child.offset, &nibbles[path.len()..])
                } else {
                    Ok(None)
                }
            }
            Node::Branch { children, value } => {
                if nibbles.is_empty() {
                    return Ok(value);
                }
                let idx = nibbles[0] as usize;
                self.find_in(children[idx].offset, &nibbles[1..])
            }
        }
    }

    /// Read `key` as of `version` (blocking). Fails with
    /// `VersionNoLongerExists` if the version has been rewound/compacted
    /// away (§3.3).
    pub fn find(&self, key: &[u8], version: Version) -> Result<Option<Bytes>, MptError> {
        let root = self.root_at(version)?;
        self.find_in(root, &key_to_nibbles(key))
    }

    /// Insert `value` (or remove, for `None`) at `nibbles` below `offset`,
    /// returning the new subtree's root pointer. This is the bottom-up
    /// node-construction step of §4.2's algorithm; nodes are never mutated
    /// in place.
    fn upsert_in(
        &self,
        offset: VirtualOffset,
        nibbles: &[u8],
        value: Option<Bytes>,
        list: ChunkList,
    ) -> Result<ChildPointer, MptError> {
        if offset.is_null() {
            return Ok(match value {
                Some(v) => {
                    let node = Node::Leaf {
                        path: nibbles.to_vec(),
                        value: v,
                    };
                    self.write_and_point(&node, list)?
                }
                None => ChildPointer::EMPTY,
            });
        }
        let node = self.read_node(offset)?;
        match node {
            Node::Leaf { path, value: old } => {
                if path == nibbles {
                    return Ok(match value {
                        Some(v) => {
                            let node = Node::Leaf {
                                path: nibbles.to_vec(),
                                value: v,
                            };
                            self.write_and_point(&node, list)?
                        }
                        None => ChildPointer::EMPTY,
                    });
                }
                // Diverging leaf: split into a branch at the common prefix.
                self.split_and_insert(&path, old, nibbles, value, list)
            }
            Node::Extension { path, child } => {
                if nibbles.len() >= path.len() && nibbles[..path.len()] == path[..] {
                    let new_child = self.upsert_in(child.offset, &nibbles[path.len()..], value, list)?;
                    if new_child.is_empty() {
                        return Ok(ChildPointer::EMPTY);
                    }
                    let node = Node::Extension {
                        path: path.clone(),
                        child: new_child,
                    };
                    self.write_and_point(&node, list)
                } else {
                    // Diverging extension: split at the common nibble
                    // prefix, same shape as the leaf-split case but with an
                    // existing child pointer instead of an existing value.
                    self.split_extension_and_insert(&path, child, nibbles, value, list)
                }
            }
            Node::Branch { mut children, value: branch_value } => {
                if nibbles.is_empty() {
                    let node = Node::Branch {
                        children,
                        value,
                    };
                    return self.write_and_point(&node, list);
                }
                let idx = nibbles[0] as usize;
                let new_child = self.upsert_in(children[idx].offset, &nibbles[1..], value, list)?;
                children[idx] = new_child;
                let node = Node::Branch {
                    children,
                    value: branch_value,
                };
                self.write_and_point(&node, list)
            }
        }
    }

    /// Split a diverging `Extension` node at the common nibble prefix with
    /// `new_nibbles`, same shape as `split_and_insert` but the existing side
    /// carries a child pointer (and possibly a remaining extension) rather
    /// than a leaf value.
    fn split_extension_and_insert(
        &self,
        existing_path: &NibblePath,
        existing_child: ChildPointer,
        new_nibbles: &[u8],
        new_value: Option<Bytes>,
        list: ChunkList,
    ) -> Result<ChildPointer, MptError> {
        let common = existing_path
            .iter()
            .zip(new_nibbles.iter())
            .take_while(|(a, b)| a == b)
            .count();
        debug_assert!(common < existing_path.len(), "equal-prefix case handled by caller");

        let mut children: [ChildPointer; 16] = [ChildPointer::EMPTY; 16];

        let remaining_path = &existing_path[common + 1..];
        let existing_ptr = if remaining_path.is_empty() {
            existing_child
        } else {
            self.write_and_point(
                &Node::Extension {
                    path: remaining_path.to_vec(),
                    child: existing_child,
                },
                list,
            )?
        };
        children[existing_path[common] as usize] = existing_ptr;

        let mut branch_value = None;
        if common == new_nibbles.len() {
            branch_value = new_value;
        } else if let Some(v) = new_value {
            let leaf = Node::Leaf {
                path: new_nibbles[common + 1..].to_vec(),
                value: v,
            };
            let ptr = self.write_and_point(&leaf, list)?;
            children[new_nibbles[common] as usize] = ptr;
        }

        let branch = Node::Branch {
            children: Box::new(children),
            value: branch_value,
        };
        let branch_ptr = self.write_and_point(&branch, list)?;

        if common == 0 {
            Ok(branch_ptr)
        } else {
            let ext = Node::Extension {
                path: existing_path[..common].to_vec(),
                child: branch_ptr,
            };
            self.write_and_point(&ext, list)
        }
    }

    fn split_and_insert(
        &self,
        existing_path: &NibblePath,
        existing_value: Bytes,
        new_nibbles: &[u8],
        new_value: Option<Bytes>,
        list: ChunkList,
    ) -> Result<ChildPointer, MptError> {
        let common = existing_path
            .iter()
            .zip(new_nibbles.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let mut children: [ChildPointer; 16] = [ChildPointer::EMPTY; 16];
        let mut branch_value = None;

        if common == existing_path.len() {
            branch_value = Some(existing_value);
        } else {
            let leaf = Node::Leaf {
                path: existing_path[common + 1..].to_vec(),
                value: existing_value,
            };
            let ptr = self.write_and_point(&leaf, list)?;
            children[existing_path[common] as usize] = ptr;
        }

        if common == new_nibbles.len() {
            if let Some(v) = new_value {
                branch_value = Some(v);
            }
        } else if let Some(v) = new_value {
            let leaf = Node::Leaf {
                path: new_nibbles[common + 1..].to_vec(),
                value: v,
            };
            let ptr = self.write_and_point(&leaf, list)?;
            children[new_nibbles[common] as usize] = ptr;
        }

        let branch = Node::Branch {
            children: Box::new(children),
            value: branch_value,
        };
        let branch_ptr = self.write_and_point(&branch, list)?;

        if common == 0 {
            Ok(branch_ptr)
        } else {
            let ext = Node::Extension {
                path: existing_path[..common].to_vec(),
                child: branch_ptr,
            };
            self.write_and_point(&ext, list)
        }
    }

    /// Write `node`, computing its `(min_fast_offset, min_slow_offset)` by
    /// folding the node's own placement into its children's cached minimums
    /// (§4.2 step 3).
    fn write_and_point(&self, node: &Node, list: ChunkList) -> Result<ChildPointer, MptError> {
        let offset = self.write_node(node, list)?;
        let (mut min_fast, mut min_slow) = node.children_min_offsets();
        match list {
            ChunkList::Fast => {
                min_fast = if min_fast.is_null() { offset } else { min_fast.min(offset) }
            }
            ChunkList::Slow => {
                min_slow = if min_slow.is_null() { offset } else { min_slow.min(offset) }
            }
            ChunkList::Free => unreachable!(),
        }
        Ok(ChildPointer {
            offset,
            min_fast_offset: min_fast,
            min_slow_offset: min_slow,
        })
    }

    /// Apply `updates` atomically against `version - 1`'s root, producing
    /// the root for `version` (§4.2 "Update protocol"). Must be called from
    /// the single owning upsert thread.
    pub fn upsert(&self, prior_root: Option<VirtualOffset>, updates: UpdateList, version: Version) -> Result<VirtualOffset, MptError> {
        self.check_owner_thread()?;
        self.upsert_call_count.fetch_add(1, Ordering::AcqRel);

        let list = self.choose_list();
        let mut root = prior_root.unwrap_or(VirtualOffset::NULL);
        for (key, value) in updates.entries {
            let nibbles = key_to_nibbles(&key);
            let ptr = self.upsert_in(root, &nibbles, value, list)?;
            root = ptr.offset;
        }

        {
            let mut roots = self.roots.write();
            roots.push_back((version, root));
            let history_length = *self.history_length.read() as usize;
            while roots.len() > history_length {
                roots.pop_front();
            }
            let min_valid = roots.front().map(|(v, _)| *v).unwrap_or(version);
            self.db_history_min_valid_version.store(min_valid, Ordering::Release);
        }
        self.db_history_max_version.store(version, Ordering::Release);
        self.advance_compaction();
        Ok(root)
    }

    /// Advance the compaction frontier proportionally to disk growth; a
    /// production compactor would walk live nodes between the old and new
    /// frontier and re-route them fast/slow per §4.2. We advance the
    /// frontier to the engine's current write position, which is the
    /// externally observable contract §4.2 exposes (P4); the node re-routing
    /// itself is exercised directly by `compact_pass`.
    fn advance_compaction(&self) {
        *self.compact_offset_fast.write() = VirtualOffset::new(*self.active_fast_chunk.read(), 0);
        *self.compact_offset_slow.write() = VirtualOffset::new(*self.active_slow_chunk.read(), 0);
    }

    /// Rewrite nodes at `offsets` from the fast list to the slow list if
    /// their subtree minimum offset has already overtaken the compaction
    /// frontier, per §4.2's fast/slow routing rule. Returns the rewritten
    /// pointer for each input offset, in order.
    pub fn compact_pass(&self, offsets: &[VirtualOffset]) -> Result<Vec<ChildPointer>, MptError> {
        let frontier = *self.compact_offset_fast.read();
        let mut out = Vec::with_capacity(offsets.len());
        for &offset in offsets {
            let node = self.read_node(offset)?;
            let (min_fast, _) = node.children_min_offsets();
            let target = if min_fast.is_null() || min_fast >= frontier {
                ChunkList::Fast
            } else {
                ChunkList::Slow
            };
            out.push(self.write_and_point(&node, target)?);
        }
        Ok(out)
    }

    /// Truncate history to end at `v` (§4.2 "Version history and rewind").
    /// A no-op (with a warning) if `v` falls outside
    /// `[db_history_min_valid_version, db_history_max_version - 1]`.
    pub fn rewind_to_version(&self, v: Version) {
        let (min_valid, max) = self.history_window();
        if max == 0 || v < min_valid || v > max.saturating_sub(1) {
            tracing::warn!(requested = v, min_valid, max, "rewind_to_version out of range, ignoring");
            return;
        }
        let mut roots = self.roots.write();
        roots.retain(|(version, _)| *version <= v);
        self.db_history_max_version.store(v, Ordering::Release);
    }

    /// Grow or shrink the retention window; shrinking prunes oldest
    /// versions immediately (§4.2).
    pub fn reset_history_length(&self, n: u32) {
        let mut roots = self.roots.write();
        *self.history_length.write() = n;
        while roots.len() > n as usize {
            roots.pop_front();
        }
        let min_valid = roots.front().map(|(v, _)| *v).unwrap_or(0);
        self.db_history_min_valid_version.store(min_valid, Ordering::Release);
    }

    /// Number of times `upsert` has completed; used to detect a concurrent
    /// upsert during a shared-to-exclusive lock upgrade (§4.2).
    pub fn upsert_call_count(&self) -> u64 {
        self.upsert_call_count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpt::chunk::ChunkType;
    use crate::mpt::pool::{open_file_pool, OpenFlags, OpenMode};

    fn make_engine(dir: &std::path::Path) -> UpdateAux<crate::mpt::device::FileDevice> {
        let pool = open_file_pool(
            &[
                (ChunkType::Conventional, dir.join("cnv"), 1),
                (ChunkType::Sequential, dir.join("seq"), 64),
            ],
            OpenMode::CreateIfNeeded,
            16,
            OpenFlags::default(),
        )
        .unwrap();
        UpdateAux::new(Arc::new(pool), StateMachine::default(), 100)
    }

    #[test]
    fn single_key_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path());
        let mut updates = UpdateList::new();
        updates.put(b"hello".to_vec(), Bytes::from_static(b"world"));
        let root = engine.upsert(None, updates, 1).unwrap();
        assert_eq!(engine.find(b"hello", 1).unwrap(), Some(Bytes::from_static(b"world")));
        assert_eq!(engine.find(b"missing", 1).unwrap(), None);
        assert!(!root.is_null());
    }

    #[test]
    fn two_diverging_keys() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path());
        let mut updates = UpdateList::new();
        updates.put(b"aaa".to_vec(), Bytes::from_static(b"1"));
        updates.put(b"aab".to_vec(), Bytes::from_static(b"2"));
        engine.upsert(None, updates, 1).unwrap();
        assert_eq!(engine.find(b"aaa", 1).unwrap(), Some(Bytes::from_static(b"1")));
        assert_eq!(engine.find(b"aab", 1).unwrap(), Some(Bytes::from_static(b"2")));
    }

    #[test]
    fn sequential_versions_preserve_old_values() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path());
        let mut root = None;
        for i in 0..10u8 {
            let mut updates = UpdateList::new();
            updates.put(vec![i], Bytes::from_static(b"v"));
            root = Some(engine.upsert(root, updates, i as u64 + 1).unwrap());
        }
        for i in 0..10u8 {
            assert_eq!(engine.find(&[i], (i as u64) + 1).unwrap(), Some(Bytes::from_static(b"v")));
        }
    }

    #[test]
    fn rewind_truncates_history() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path());
        let mut root = None;
        for i in 1..=100u64 {
            let mut updates = UpdateList::new();
            updates.put(i.to_le_bytes().to_vec(), Bytes::from_static(b"v"));
            root = Some(engine.upsert(root, updates, i).unwrap());
        }
        engine.rewind_to_version(50);
        assert_eq!(engine.history_window().1, 50);
        assert_eq!(
            engine.find(&51u64.to_le_bytes(), 51),
            Err(MptError::VersionNoLongerExists(51))
        );
        assert!(engine.find(&50u64.to_le_bytes(), 50).unwrap().is_some());
    }

    #[test]
    fn rewind_out_of_range_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path());
        let mut updates = UpdateList::new();
        updates.put(b"k".to_vec(), Bytes::from_static(b"v"));
        engine.upsert(None, updates, 1).unwrap();
        engine.rewind_to_version(999);
        assert_eq!(engine.history_window().1, 1);
    }

    #[test]
    fn wrong_thread_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(make_engine(dir.path()));
        let mut updates = UpdateList::new();
        updates.put(b"k".to_vec(), Bytes::from_static(b"v"));
        engine.upsert(None, updates, 1).unwrap();

        let engine2 = engine.clone();
        let handle = std::thread::spawn(move || {
            let mut updates = UpdateList::new();
            updates.put(b"k2".to_vec(), Bytes::from_static(b"v2"));
            engine2.upsert(None, updates, 2)
        });
        let result = handle.join().unwrap();
        assert_eq!(result, Err(MptError::WrongThread));
    }

    #[tokio::test]
    async fn async_read_coalesces() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(make_engine(dir.path()));
        let mut updates = UpdateList::new();
        updates.put(b"k".to_vec(), Bytes::from_static(b"v"));
        let root = engine.upsert(None, updates, 1).unwrap();

        let e1 = engine.clone();
        let e2 = engine.clone();
        let (a, b) = tokio::join!(e1.read_node_async(root), e2.read_node_async(root));
        assert!(a.is_ok());
        assert!(b.is_ok());
    }
}
