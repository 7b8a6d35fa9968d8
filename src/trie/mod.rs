//! L3a Double-Array Trie (spec.md §3.3, §4.3): a persistent, ordered
//! string -> key-ID map built from five paged vectors sharing one pool —
//! node cells, sibling labels, chunk metadata, key-ID entries, and a packed
//! key buffer.
//!
//! The allocation algorithm (`find_offset`, `separate`, `resolve`,
//! `migrate_nodes`, and the level-group chunk promotion scheme) is ported
//! directly from the "large" double-array variant's reference
//! implementation, adapted to paged-vector storage instead of raw pointer
//! arithmetic over one flat array.

mod node;

use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, FormatError};
use crate::pool::Pool;
use crate::vector::PagedVector;

use node::{
    ChunkMeta, EntryCell, NodeCell, CHUNK_NODE_COUNT, INVALID_CHUNK_ID, INVALID_OFFSET, MAX_CHUNK_COUNT,
    MAX_FAILURE_COUNT, MAX_KEY_SIZE, NUM_LEVELS, ROOT_NODE_ID, TERMINAL_LABEL,
};

/// Tunables for a trie's chunk-allocation scan (spec.md §4.3). Mirrors
/// [`crate::pool::PoolOptions`]'s and [`crate::blob::BlobOptions`]'s shape.
pub struct TrieOptions {
    max_failure_count: u8,
}

impl Default for TrieOptions {
    fn default() -> Self {
        Self { max_failure_count: MAX_FAILURE_COUNT }
    }
}

impl TrieOptions {
    /// How many consecutive `find_offset` misses a chunk tolerates before
    /// being promoted to the next level group. Defaults to the value
    /// spec.md §4.3 names.
    pub fn max_failure_count(&mut self, n: u8) -> &mut Self {
        self.max_failure_count = n;
        self
    }

    /// Create a new, empty trie on `pool` with these options.
    pub fn create(&self, pool: Pool) -> Result<DATrie, Error> {
        DATrie::create_with_options(pool, self.max_failure_count)
    }
}

const MAGIC: [u8; 32] = *b"grnxx::trie::DoubleArray\0\0\0\0\0\0\0\0";
const VERSION: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
struct TrieHeader {
    magic: [u8; 32],
    version: u32,
    num_chunks: u32,
    /// Head of the free key-ID list, or `EntryCell::INVALID_KEY_ID`.
    next_key_id: u64,
    /// One past the highest key-ID ever handed out; used to mint a fresh
    /// ID when the free list is empty.
    next_fresh_key_id: u64,
    num_keys: u64,
    /// Next unused byte offset in the key buffer.
    key_watermark: u64,
    /// [`TrieOptions::max_failure_count`], persisted so a reopened trie keeps
    /// using the value it was created with.
    max_failure_count: u8,
    _reserved: [u8; 7],
    level_heads: [u32; NUM_LEVELS],
    nodes_header: u32,
    siblings_header: u32,
    chunks_header: u32,
    entries_header: u32,
    keys_header: u32,
}

const _: () = assert!(std::mem::size_of::<TrieHeader>() <= 4096);

/// A key's numeric identifier, stable until the key is removed.
pub type KeyId = u64;

/// Returned by [`DATrie::insert`]/[`DATrie::update`] when the destination
/// key is already present; carries its existing ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyPresent(pub KeyId);

struct Inner {
    pool: Pool,
    header_block_id: u32,
    nodes: PagedVector<NodeCell>,
    /// For each child node, the label of its next sibling (spec.md §4.3:
    /// moving the sibling label out of the node cell is what the "large"
    /// variant's widened leaf fields cost). Meaningful only when the node's
    /// `has_sibling` flag is set; holds `TERMINAL_LABEL`/ordinary byte
    /// labels, so needs the full 9 bits rather than a `u8`.
    siblings: PagedVector<u16>,
    chunks: PagedVector<ChunkMeta>,
    entries: PagedVector<EntryCell>,
    keys: PagedVector<u8>,
    /// Serializes every structural mutation: chunk/level-group bookkeeping,
    /// node reservation, and the key/entry free lists (spec.md §5: each
    /// layer "adds its own inter-process mutex in their header"; this crate
    /// keeps that bookkeeping behind a plain process-local mutex, the same
    /// simplification `Pool` makes for its own header mutex).
    alloc: Mutex<()>,
}

/// A persistent, ordered string -> key-ID map (spec.md §3.3, §4.3).
#[derive(Clone)]
pub struct DATrie {
    inner: Arc<Inner>,
}

impl DATrie {
    /// The block id of this trie's header, to be handed to [`Self::open`].
    pub fn header_block_id(&self) -> u32 {
        self.inner.header_block_id
    }

    /// Create a new, empty trie on `pool` with default options.
    pub fn create(pool: Pool) -> Result<Self, Error> {
        TrieOptions::default().create(pool)
    }

    fn create_with_options(pool: Pool, max_failure_count: u8) -> Result<Self, Error> {
        let nodes = PagedVector::create(pool.clone(), NodeCell::zero())?;
        let siblings = PagedVector::create(pool.clone(), 0u16)?;
        let chunks = PagedVector::create(pool.clone(), ChunkMeta::empty(0))?;
        let entries = PagedVector::create(pool.clone(), EntryCell::free(EntryCell::INVALID_KEY_ID))?;
        let keys = PagedVector::create(pool.clone(), 0u8)?;

        let header_block = pool.create_block(std::mem::size_of::<TrieHeader>())?;
        let header_ptr = pool.get_block_address(&header_block) as *mut TrieHeader;
        let header = TrieHeader {
            magic: MAGIC,
            version: VERSION,
            num_chunks: 0,
            next_key_id: EntryCell::INVALID_KEY_ID,
            next_fresh_key_id: 0,
            num_keys: 0,
            key_watermark: 0,
            max_failure_count,
            _reserved: [0; 7],
            level_heads: [INVALID_CHUNK_ID; NUM_LEVELS],
            nodes_header: nodes.header_block_id(),
            siblings_header: siblings.header_block_id(),
            chunks_header: chunks.header_block_id(),
            entries_header: entries.header_block_id(),
            keys_header: keys.header_block_id(),
        };
        unsafe { header_ptr.write(header) };

        let inner = Arc::new(Inner {
            pool,
            header_block_id: header_block.id(),
            nodes,
            siblings,
            chunks,
            entries,
            keys,
            alloc: Mutex::new(()),
        });
        let trie = DATrie { inner };
        {
            let _guard = trie.inner.alloc.lock().unwrap();
            trie.reserve_node(ROOT_NODE_ID as u64)?;
        }
        Ok(trie)
    }

    /// Reopen a trie previously created on `pool` at `header_block_id`.
    pub fn open(pool: Pool, header_block_id: u32) -> Result<Self, Error> {
        let header_info = pool.get_block_info(header_block_id)?;
        let header_ptr = pool.get_block_address(&header_info) as *const TrieHeader;
        let header = unsafe { &*header_ptr };
        if header.magic != MAGIC {
            return Err(FormatError::FileType.into());
        }
        if header.version != VERSION {
            return Err(FormatError::Version.into());
        }
        let nodes = PagedVector::open(pool.clone(), header.nodes_header)?;
        let siblings = PagedVector::open(pool.clone(), header.siblings_header)?;
        let chunks = PagedVector::open(pool.clone(), header.chunks_header)?;
        let entries = PagedVector::open(pool.clone(), header.entries_header)?;
        let keys = PagedVector::open(pool.clone(), header.keys_header)?;

        let inner = Arc::new(Inner {
            pool,
            header_block_id: header_info.id(),
            nodes,
            siblings,
            chunks,
            entries,
            keys,
            alloc: Mutex::new(()),
        });
        Ok(DATrie { inner })
    }

    fn header(&self) -> &TrieHeader {
        let info = self.inner.pool.get_block_info(self.inner.header_block_id).expect("trie header block vanished");
        let ptr = self.inner.pool.get_block_address(&info) as *const TrieHeader;
        unsafe { &*ptr }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut TrieHeader {
        let info = self.inner.pool.get_block_info(self.inner.header_block_id).expect("trie header block vanished");
        let ptr = self.inner.pool.get_block_address(&info) as *mut TrieHeader;
        unsafe { &mut *ptr }
    }

    pub fn num_keys(&self) -> u64 {
        self.header().num_keys
    }

    // ---- node/chunk/entry/key accessors --------------------------------

    fn node(&self, id: u64) -> Result<NodeCell, Error> {
        self.inner.nodes.get(id)
    }

    fn node_mut(&self, id: u64) -> Result<&mut NodeCell, Error> {
        self.inner.nodes.get_mut(id)
    }

    fn sibling(&self, id: u64) -> Result<u16, Error> {
        self.inner.siblings.get(id)
    }

    fn sibling_mut(&self, id: u64) -> Result<&mut u16, Error> {
        self.inner.siblings.get_mut(id)
    }

    fn chunk(&self, id: u32) -> Result<ChunkMeta, Error> {
        self.inner.chunks.get(id as u64)
    }

    fn chunk_mut(&self, id: u32) -> Result<&mut ChunkMeta, Error> {
        self.inner.chunks.get_mut(id as u64)
    }

    fn entry(&self, id: u64) -> Result<EntryCell, Error> {
        self.inner.entries.get(id)
    }

    fn entry_mut(&self, id: u64) -> Result<&mut EntryCell, Error> {
        self.inner.entries.get_mut(id)
    }

    fn read_key_bytes(&self, key_pos: u64, key_size: u16) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(key_size as usize);
        for i in 0..key_size as u64 {
            buf.push(self.inner.keys.get(key_pos + i)?);
        }
        Ok(buf)
    }

    /// Append `bytes` to the key buffer as a `(key_id, length, bytes)`
    /// record (spec.md §3.3), returning the byte position of `bytes`
    /// itself (what entries/search actually index by).
    fn append_key(&self, key_id: u64, bytes: &[u8]) -> Result<u64, Error> {
        let header_pos = self.header().key_watermark;
        for (i, b) in (key_id as u32).to_ne_bytes().into_iter().enumerate() {
            *self.inner.keys.get_mut(header_pos + i as u64)? = b;
        }
        for (i, b) in (bytes.len() as u16).to_ne_bytes().into_iter().enumerate() {
            *self.inner.keys.get_mut(header_pos + 4 + i as u64)? = b;
        }
        let bytes_pos = header_pos + 6;
        for (i, &b) in bytes.iter().enumerate() {
            *self.inner.keys.get_mut(bytes_pos + i as u64)? = b;
        }
        self.header_mut().key_watermark = bytes_pos + bytes.len() as u64;
        Ok(bytes_pos)
    }

    fn leaf_bytes(&self, leaf: NodeCell) -> Result<Vec<u8>, Error> {
        let entry = self.entry(leaf.key_id())?;
        if !entry.is_valid() {
            crate::error::bug!("leaf node referenced a free entry");
        }
        self.read_key_bytes(entry.key_pos(), entry.key_size())
    }

    // ---- key-ID allocation ---------------------------------------------

    fn alloc_key_id(&self) -> Result<u64, Error> {
        let header = self.header();
        if header.next_key_id != EntryCell::INVALID_KEY_ID {
            let id = header.next_key_id;
            let entry = self.entry(id)?;
            self.header_mut().next_key_id = entry.next_key_id();
            Ok(id)
        } else {
            let id = header.next_fresh_key_id;
            if id > node::MAX_NODE_KEY_ID {
                return Err(Error::resource_exhausted("trie has reached its maximum key-ID"));
            }
            self.header_mut().next_fresh_key_id = id + 1;
            Ok(id)
        }
    }

    fn free_key_id(&self, id: u64) -> Result<(), Error> {
        let next = self.header().next_key_id;
        *self.entry_mut(id)? = EntryCell::free(next);
        self.header_mut().next_key_id = id;
        self.header_mut().num_keys -= 1;
        Ok(())
    }

    // ---- chunk / level-group bookkeeping --------------------------------

    fn link_chunk_into_level(&self, chunk_id: u32, level: u8) -> Result<(), Error> {
        let head = self.header().level_heads[level as usize];
        if head == INVALID_CHUNK_ID {
            let chunk = self.chunk_mut(chunk_id)?;
            chunk.next = chunk_id;
            chunk.prev = chunk_id;
            self.header_mut().level_heads[level as usize] = chunk_id;
        } else {
            let prev_id = self.chunk(head)?.prev;
            {
                let chunk = self.chunk_mut(chunk_id)?;
                chunk.next = head;
                chunk.prev = prev_id;
            }
            self.chunk_mut(prev_id)?.next = chunk_id;
            self.chunk_mut(head)?.prev = chunk_id;
        }
        let chunk = self.chunk_mut(chunk_id)?;
        chunk.level = level;
        chunk.failure_count = 0;
        Ok(())
    }

    fn unlink_chunk_from_level(&self, chunk_id: u32) -> Result<(), Error> {
        let chunk = self.chunk(chunk_id)?;
        let level = chunk.level;
        if chunk.next == chunk.prev && chunk.next == chunk_id {
            self.header_mut().level_heads[level as usize] = INVALID_CHUNK_ID;
        } else {
            self.chunk_mut(chunk.prev)?.next = chunk.next;
            self.chunk_mut(chunk.next)?.prev = chunk.prev;
            if self.header().level_heads[level as usize] == chunk_id {
                self.header_mut().level_heads[level as usize] = chunk.next;
            }
        }
        Ok(())
    }

    fn promote_chunk_level(&self, chunk_id: u32, new_level: u8) -> Result<(), Error> {
        self.unlink_chunk_from_level(chunk_id)?;
        self.link_chunk_into_level(chunk_id, new_level)
    }

    /// Allocate a fresh chunk of `CHUNK_NODE_COUNT` phantom nodes at level 0.
    fn reserve_block(&self, chunk_id: u32) -> Result<(), Error> {
        let base = chunk_id as u64 * CHUNK_NODE_COUNT as u64;
        for i in 0..CHUNK_NODE_COUNT {
            let next = (i + 1) % CHUNK_NODE_COUNT;
            let prev = (i + CHUNK_NODE_COUNT - 1) % CHUNK_NODE_COUNT;
            let cell = NodeCell::zero().set_phantom(true).set_next(next).set_prev(prev);
            *self.node_mut(base + i as u64)? = cell;
        }
        *self.chunk_mut(chunk_id)? = ChunkMeta {
            num_phantoms: CHUNK_NODE_COUNT as u16,
            first_phantom: 0,
            ..ChunkMeta::empty(0)
        };
        self.link_chunk_into_level(chunk_id, 0)?;
        self.header_mut().num_chunks = chunk_id + 1;
        log::debug!("trie grew to {} chunks", chunk_id + 1);
        Ok(())
    }

    /// Pop `node_id` off its chunk's phantom list, clearing `is_phantom`,
    /// creating the chunk first if it doesn't exist yet. The caller is
    /// responsible for overwriting the node's contents afterward; this only
    /// performs the free-list removal and level-promotion bookkeeping.
    fn reserve_node(&self, node_id: u64) -> Result<(), Error> {
        let chunk_id = (node_id / CHUNK_NODE_COUNT as u64) as u32;
        if chunk_id >= self.header().num_chunks {
            self.reserve_block(chunk_id)?;
        }
        let base = chunk_id as u64 * CHUNK_NODE_COUNT as u64;
        let local = (node_id % CHUNK_NODE_COUNT as u64) as u32;

        let node = self.node(node_id)?;
        let next_local = node.next();
        let prev_local = node.prev();
        let next_id = base + next_local as u64;
        let prev_id = base + prev_local as u64;

        if next_id != node_id {
            let updated_prev = self.node(prev_id)?.set_next(next_local);
            *self.node_mut(prev_id)? = updated_prev;
            let updated_next = self.node(next_id)?.set_prev(prev_local);
            *self.node_mut(next_id)? = updated_next;
        }

        let chunk = self.chunk(chunk_id)?;
        if local as u16 == chunk.first_phantom {
            let new_first = if next_id == node_id { CHUNK_NODE_COUNT as u16 } else { next_local as u16 };
            self.chunk_mut(chunk_id)?.first_phantom = new_first;
        }
        let num_phantoms = chunk.num_phantoms - 1;
        {
            let chunk = self.chunk_mut(chunk_id)?;
            chunk.num_phantoms = num_phantoms;
        }

        let threshold_level = promotion_level(num_phantoms);
        let current_level = self.chunk(chunk_id)?.level;
        if threshold_level > current_level {
            self.promote_chunk_level(chunk_id, threshold_level)?;
        }

        *self.node_mut(node_id)? = NodeCell::zero();
        Ok(())
    }

    /// Inverse of [`Self::reserve_node`]: push `node_id` back onto its
    /// chunk's phantom free list. Does not demote the chunk's level group;
    /// the chunk simply gets re-promoted the next time [`Self::reserve_node`]
    /// notices it has grown scarce again, which is the direction that
    /// actually matters for `find_offset`'s scan order.
    fn free_node(&self, node_id: u64) -> Result<(), Error> {
        let chunk_id = (node_id / CHUNK_NODE_COUNT as u64) as u32;
        let base = chunk_id as u64 * CHUNK_NODE_COUNT as u64;
        let local = (node_id - base) as u32;
        let chunk = self.chunk(chunk_id)?;
        if chunk.first_phantom == CHUNK_NODE_COUNT as u16 {
            *self.node_mut(node_id)? = NodeCell::zero().set_phantom(true).set_next(local).set_prev(local);
            self.chunk_mut(chunk_id)?.first_phantom = local as u16;
        } else {
            let first_local = chunk.first_phantom as u32;
            let first_id = base + first_local as u64;
            let last_local = self.node(first_id)?.prev();
            let last_id = base + last_local as u64;
            *self.node_mut(node_id)? = NodeCell::zero().set_phantom(true).set_next(first_local).set_prev(last_local);
            let updated_first = self.node(first_id)?.set_prev(local);
            *self.node_mut(first_id)? = updated_first;
            let updated_last = self.node(last_id)?.set_next(local);
            *self.node_mut(last_id)? = updated_last;
        }
        self.chunk_mut(chunk_id)?.num_phantoms += 1;
        Ok(())
    }

    /// Labels of every direct child of `node_id`, in ascending order, by
    /// walking its sorted sibling chain.
    fn existing_labels(&self, node_id: u64) -> Result<Vec<u16>, Error> {
        let node = self.node(node_id)?;
        if !node.is_origin() || node.is_leaf() {
            return Ok(Vec::new());
        }
        let base = node.offset();
        let mut labels = vec![node.child()];
        let mut child_id = base ^ node.child() as u64;
        loop {
            let child = self.node(child_id)?;
            if !child.has_sibling() {
                break;
            }
            let next_label = self.sibling(child_id)?;
            labels.push(next_label);
            child_id = base ^ next_label as u64;
        }
        Ok(labels)
    }

    /// Whether every label in `labels` maps (via `offset ^ label`) to a slot
    /// that is either phantom or not yet materialized at all.
    fn candidate_offset_is_free(&self, offset: u64, labels: &[u16]) -> Result<bool, Error> {
        for &label in labels {
            let node_id = offset ^ label as u64;
            let chunk_id = (node_id / CHUNK_NODE_COUNT as u64) as u32;
            if chunk_id < self.header().num_chunks && !self.node(node_id)?.is_phantom() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn level_for_label_count(num_labels: u32) -> u8 {
        let bits = 32 - num_labels.max(1).leading_zeros();
        (bits.saturating_sub(1)).min(NUM_LEVELS as u32 - 1) as u8
    }

    /// Find a base offset such that `offset ^ label` is free for every label
    /// in `labels` (spec.md §4.3 allocation scan, ported from the reference
    /// implementation's `find_offset`: scan level groups from the one sized
    /// for this fan-out down to level 0, tracking per-chunk failures and
    /// promoting stubborn chunks, capped at `MAX_CHUNK_COUNT` total chunks
    /// scanned; fall back to an offset in the next not-yet-created chunk).
    fn find_offset(&self, labels: &[u16]) -> Result<u64, Error> {
        let num_labels = labels.len() as u32;
        let start_level = Self::level_for_label_count(num_labels);
        let mut scanned = 0u32;
        for level in (0..=start_level).rev() {
            let head = self.header().level_heads[level as usize];
            if head == INVALID_CHUNK_ID {
                continue;
            }
            let mut chunk_id = head;
            loop {
                if scanned >= MAX_CHUNK_COUNT {
                    break;
                }
                scanned += 1;
                let chunk = self.chunk(chunk_id)?;
                let next_chunk_id = chunk.next;
                let mut found = None;
                if chunk.num_phantoms as u32 >= num_labels && chunk.first_phantom != CHUNK_NODE_COUNT as u16 {
                    let base = chunk_id as u64 * CHUNK_NODE_COUNT as u64;
                    let first_local = chunk.first_phantom;
                    let mut local = first_local;
                    loop {
                        let node_id = base + local as u64;
                        let offset = node_id ^ labels[0] as u64;
                        if self.candidate_offset_is_free(offset, labels)? {
                            found = Some(offset);
                            break;
                        }
                        local = self.node(node_id)?.next() as u16;
                        if local == first_local {
                            break;
                        }
                    }
                }
                if let Some(offset) = found {
                    self.chunk_mut(chunk_id)?.failure_count = 0;
                    return Ok(offset);
                }
                let failure_count = {
                    let c = self.chunk_mut(chunk_id)?;
                    c.failure_count += 1;
                    c.failure_count
                };
                if failure_count >= self.header().max_failure_count && level + 1 < NUM_LEVELS as u8 {
                    self.promote_chunk_level(chunk_id, level + 1)?;
                }
                if next_chunk_id == head {
                    break;
                }
                chunk_id = next_chunk_id;
            }
        }
        let new_chunk_id = self.header().num_chunks;
        let base = new_chunk_id as u64 * CHUNK_NODE_COUNT as u64;
        Ok(base ^ labels[0] as u64)
    }

    /// Insert `label` as a child of `parent_id`, creating the node and (if
    /// the parent has no offset yet, or its current offset can't fit the new
    /// label) relocating the parent's whole child set via [`Self::separate`].
    /// Idempotent: returns the existing child if `label` is already present.
    fn insert_node(&self, parent_id: u64, label: u16) -> Result<u64, Error> {
        let parent = self.node(parent_id)?;
        if parent.is_origin() && !parent.is_leaf() {
            let base = parent.offset();
            let child_id = base ^ label as u64;
            let existing = self.node(child_id)?;
            if !existing.is_phantom() && existing.label() == label {
                return Ok(child_id);
            }
            if existing.is_phantom() {
                return self.attach_child(parent_id, label, child_id);
            }
            return self.separate(parent_id, label);
        }
        let offset = self.find_offset(std::slice::from_ref(&label))?;
        let child_id = offset ^ label as u64;
        self.reserve_node(child_id)?;
        {
            let p = self.node_mut(parent_id)?;
            *p = p.set_offset(offset).set_origin(true).set_leaf(false).set_child(label);
        }
        let child = NodeCell::zero().set_label(label);
        *self.node_mut(child_id)? = child;
        Ok(child_id)
    }

    /// Reserve `child_id` (already known to be a free phantom slot under
    /// `parent_id`'s current offset) and splice it into the parent's sorted
    /// sibling chain.
    fn attach_child(&self, parent_id: u64, label: u16, child_id: u64) -> Result<u64, Error> {
        self.reserve_node(child_id)?;
        let parent = self.node(parent_id)?;
        let base = parent.offset();
        if label < parent.child() {
            let old_first = parent.child();
            let new_child = NodeCell::zero().set_label(label).set_has_sibling(true);
            *self.node_mut(child_id)? = new_child;
            *self.sibling_mut(child_id)? = old_first;
            let p = self.node_mut(parent_id)?;
            *p = p.set_child(label);
        } else {
            let mut prev_label = parent.child();
            let mut prev_id = base ^ prev_label as u64;
            loop {
                let prev = self.node(prev_id)?;
                if !prev.has_sibling() {
                    let updated = self.node(prev_id)?.set_has_sibling(true);
                    *self.node_mut(prev_id)? = updated;
                    *self.sibling_mut(prev_id)? = label;
                    *self.node_mut(child_id)? = NodeCell::zero().set_label(label);
                    break;
                }
                let next_label = self.sibling(prev_id)?;
                if label < next_label {
                    *self.sibling_mut(prev_id)? = label;
                    *self.node_mut(child_id)? = NodeCell::zero().set_label(label).set_has_sibling(true);
                    *self.sibling_mut(child_id)? = next_label;
                    break;
                }
                prev_label = next_label;
                prev_id = base ^ prev_label as u64;
            }
        }
        Ok(child_id)
    }

    /// Relocate `parent_id`'s entire child set (plus the not-yet-existing
    /// `new_label`) to a fresh offset that has room for all of them at once
    /// (spec.md §4.3's conflict resolution: ported from the reference
    /// implementation's `separate`/`resolve`/`migrate_nodes` trio, collapsed
    /// here since moving only the node whose own offset we control is
    /// sufficient — the slot that originally conflicted belongs to some
    /// other, untouched parent and is simply left alone).
    fn separate(&self, parent_id: u64, new_label: u16) -> Result<u64, Error> {
        let mut labels = self.existing_labels(parent_id)?;
        labels.push(new_label);
        labels.sort_unstable();
        labels.dedup();

        let new_offset = self.find_offset(&labels)?;
        let old_offset = self.node(parent_id)?.offset();

        for &label in &labels {
            if label == new_label {
                continue;
            }
            let old_child_id = old_offset ^ label as u64;
            let new_child_id = new_offset ^ label as u64;
            let old_cell = self.node(old_child_id)?;
            let old_sibling = self.sibling(old_child_id)?;
            self.reserve_node(new_child_id)?;
            *self.node_mut(new_child_id)? = old_cell;
            *self.sibling_mut(new_child_id)? = old_sibling;
            self.free_node(old_child_id)?;
        }
        let new_leaf_id = new_offset ^ new_label as u64;
        self.reserve_node(new_leaf_id)?;
        *self.node_mut(new_leaf_id)? = NodeCell::zero().set_label(new_label);

        {
            let p = self.node_mut(parent_id)?;
            *p = p.set_offset(new_offset).set_child(labels[0]);
        }
        for w in labels.windows(2) {
            let child_id = new_offset ^ w[0] as u64;
            let updated = self.node(child_id)?.set_has_sibling(true);
            *self.node_mut(child_id)? = updated;
            *self.sibling_mut(child_id)? = w[1];
        }
        let last_id = new_offset ^ *labels.last().unwrap() as u64;
        let updated_last = self.node(last_id)?.set_has_sibling(false);
        *self.node_mut(last_id)? = updated_last;

        Ok(new_leaf_id)
    }

    /// Remove `label` from `parent_id`'s sibling chain and free its node.
    /// Clears the parent's offset entirely if that was its last child.
    fn detach_child(&self, parent_id: u64, label: u16) -> Result<(), Error> {
        let parent = self.node(parent_id)?;
        let base = parent.offset();
        let child_id = base ^ label as u64;
        if parent.child() == label {
            let child = self.node(child_id)?;
            if child.has_sibling() {
                let next_label = self.sibling(child_id)?;
                let p = self.node_mut(parent_id)?;
                *p = p.set_child(next_label);
            } else {
                let p = self.node_mut(parent_id)?;
                *p = p.set_offset(INVALID_OFFSET).set_origin(false).set_child(0);
            }
        } else {
            let mut prev_label = parent.child();
            let mut prev_id = base ^ prev_label as u64;
            loop {
                let next_label = self.sibling(prev_id)?;
                if next_label == label {
                    let child = self.node(child_id)?;
                    if child.has_sibling() {
                        let grandchild_label = self.sibling(child_id)?;
                        *self.sibling_mut(prev_id)? = grandchild_label;
                    } else {
                        let updated = self.node(prev_id)?.set_has_sibling(false);
                        *self.node_mut(prev_id)? = updated;
                    }
                    break;
                }
                prev_label = next_label;
                prev_id = base ^ prev_label as u64;
            }
        }
        self.free_node(child_id)?;
        Ok(())
    }

    /// Walk `key`'s bytes from the root, returning `None` as soon as any
    /// byte has no matching child. On a full match, also requires a
    /// `TERMINAL_LABEL` leaf child at the final node (keys are distinguished
    /// from their proper prefixes by that synthetic terminal byte).
    fn find_leaf_with_parent(&self, key: &[u8]) -> Result<Option<(u64, u64)>, Error> {
        let mut node_id = ROOT_NODE_ID as u64;
        for &byte in key {
            let node = self.node(node_id)?;
            if node.is_leaf() || !node.is_origin() {
                return Ok(None);
            }
            let label = byte as u16;
            let child_id = node.offset() ^ label;
            let child = self.node(child_id)?;
            if child.is_phantom() || child.label() != label {
                return Ok(None);
            }
            node_id = child_id;
        }
        let node = self.node(node_id)?;
        if !node.is_origin() || node.is_leaf() {
            return Ok(None);
        }
        let leaf_id = node.offset() ^ TERMINAL_LABEL as u64;
        let leaf = self.node(leaf_id)?;
        if leaf.is_phantom() || leaf.label() != TERMINAL_LABEL || !leaf.is_leaf() {
            return Ok(None);
        }
        Ok(Some((node_id, leaf_id)))
    }

    fn find_leaf(&self, key: &[u8]) -> Result<Option<u64>, Error> {
        Ok(self.find_leaf_with_parent(key)?.map(|(_, leaf_id)| leaf_id))
    }

    /// Look up `key`, returning its key-ID if present.
    pub fn search(&self, key: &[u8]) -> Result<Option<KeyId>, Error> {
        match self.find_leaf(key)? {
            Some(leaf_id) => Ok(Some(self.node(leaf_id)?.key_id())),
            None => Ok(None),
        }
    }

    /// Look up a key by its ID, returning its bytes if the ID is still live.
    pub fn search_by_id(&self, key_id: KeyId) -> Result<Option<Vec<u8>>, Error> {
        if key_id >= self.header().next_fresh_key_id {
            return Ok(None);
        }
        let entry = self.entry(key_id)?;
        if !entry.is_valid() {
            return Ok(None);
        }
        Ok(Some(self.read_key_bytes(entry.key_pos(), entry.key_size())?))
    }

    /// Find the longest key that is a prefix of `query` (spec.md §3.3
    /// `lcp_search`, ported from `find_longest_prefix_match`).
    pub fn lcp_search(&self, query: &[u8]) -> Result<Option<(KeyId, Vec<u8>)>, Error> {
        let mut node_id = ROOT_NODE_ID as u64;
        let mut best = self.terminal_leaf_at(node_id)?;
        for &byte in query {
            let node = self.node(node_id)?;
            if node.is_leaf() || !node.is_origin() {
                break;
            }
            let label = byte as u16;
            let child_id = node.offset() ^ label;
            let child = self.node(child_id)?;
            if child.is_phantom() || child.label() != label {
                break;
            }
            node_id = child_id;
            if let Some(leaf_id) = self.terminal_leaf_at(node_id)? {
                best = Some(leaf_id);
            }
        }
        match best {
            Some(leaf_id) => {
                let leaf = self.node(leaf_id)?;
                Ok(Some((leaf.key_id(), self.leaf_bytes(leaf)?)))
            }
            None => Ok(None),
        }
    }

    fn terminal_leaf_at(&self, node_id: u64) -> Result<Option<u64>, Error> {
        let node = self.node(node_id)?;
        if node.is_leaf() || !node.is_origin() {
            return Ok(None);
        }
        let leaf_id = node.offset() ^ TERMINAL_LABEL as u64;
        let leaf = self.node(leaf_id)?;
        if leaf.is_phantom() || leaf.label() != TERMINAL_LABEL || !leaf.is_leaf() {
            return Ok(None);
        }
        Ok(Some(leaf_id))
    }

    /// Insert `key`, returning its fresh key-ID, or the existing one if the
    /// key was already present (spec.md §3.3 `insert`, ported from `add` /
    /// `find_leaf` / `insert_leaf`).
    pub fn insert(&self, key: &[u8]) -> Result<Result<KeyId, AlreadyPresent>, Error> {
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::logic("key exceeds the trie's maximum key length"));
        }
        let _guard = self.inner.alloc.lock().unwrap();
        let mut node_id = ROOT_NODE_ID as u64;
        for &byte in key {
            node_id = self.insert_node(node_id, byte as u16)?;
        }
        let leaf_id = self.insert_node(node_id, TERMINAL_LABEL)?;
        let leaf = self.node(leaf_id)?;
        if leaf.is_leaf() {
            return Ok(Err(AlreadyPresent(leaf.key_id())));
        }
        let key_id = self.alloc_key_id()?;
        let key_pos = self.append_key(key_id, key)?;
        *self.entry_mut(key_id)? = EntryCell::valid(key_pos, key.len() as u16);
        {
            let l = self.node_mut(leaf_id)?;
            *l = l.set_leaf(true).set_key_id(key_id).set_key_size(key.len() as u16);
        }
        self.header_mut().num_keys += 1;
        Ok(Ok(key_id))
    }

    /// Remove `key`, returning whether it was present (spec.md §3.3
    /// `remove`, ported from `remove`/`unset`).
    pub fn remove(&self, key: &[u8]) -> Result<bool, Error> {
        let _guard = self.inner.alloc.lock().unwrap();
        let Some((parent_id, leaf_id)) = self.find_leaf_with_parent(key)? else {
            return Ok(false);
        };
        let key_id = self.node(leaf_id)?.key_id();
        self.detach_child(parent_id, TERMINAL_LABEL)?;
        self.free_key_id(key_id)?;
        Ok(true)
    }

    /// Rename `src_key` to `dest_key`, keeping its key-ID (spec.md §3.3
    /// `update`, ported from `replace`/`replace_key`). Fails if `src_key`
    /// is absent; returns the destination's existing ID if it's already
    /// taken by a different key.
    pub fn update(&self, src_key: &[u8], dest_key: &[u8]) -> Result<Result<KeyId, AlreadyPresent>, Error> {
        if dest_key.len() > MAX_KEY_SIZE {
            return Err(Error::logic("key exceeds the trie's maximum key length"));
        }
        let _guard = self.inner.alloc.lock().unwrap();
        let Some((src_parent, src_leaf)) = self.find_leaf_with_parent(src_key)? else {
            return Err(Error::logic("source key not found"));
        };
        if let Some(existing_id) = self.find_leaf(dest_key)? {
            return Ok(Err(AlreadyPresent(self.node(existing_id)?.key_id())));
        }
        let key_id = self.node(src_leaf)?.key_id();
        self.detach_child(src_parent, TERMINAL_LABEL)?;

        let mut node_id = ROOT_NODE_ID as u64;
        for &byte in dest_key {
            node_id = self.insert_node(node_id, byte as u16)?;
        }
        let new_leaf_id = self.insert_node(node_id, TERMINAL_LABEL)?;
        let key_pos = self.append_key(key_id, dest_key)?;
        *self.entry_mut(key_id)? = EntryCell::valid(key_pos, dest_key.len() as u16);
        {
            let l = self.node_mut(new_leaf_id)?;
            *l = l.set_leaf(true).set_key_id(key_id).set_key_size(dest_key.len() as u16);
        }
        Ok(Ok(key_id))
    }

    /// Build a fresh, compacted trie containing the same live keys (spec.md
    /// §3.3 `defrag`): the key buffer is append-only, so removals and
    /// updates leave unreachable bytes behind that only a defrag reclaims.
    /// Key-IDs are reassigned densely in the process; callers that need
    /// stable IDs across a defrag should keep their own key -> ID mapping.
    pub fn defrag(&self) -> Result<Self, Error> {
        let fresh = Self::create_with_options(self.inner.pool.clone(), self.header().max_failure_count)?;
        let next_fresh = self.header().next_fresh_key_id;
        for key_id in 0..next_fresh {
            let entry = self.entry(key_id)?;
            if !entry.is_valid() {
                continue;
            }
            let bytes = self.read_key_bytes(entry.key_pos(), entry.key_size())?;
            if fresh.insert(&bytes)?.is_err() {
                crate::error::bug!("duplicate key encountered while defragmenting a trie");
            }
        }
        Ok(fresh)
    }
}

/// Which level group a chunk belongs to, based on how many phantom nodes
/// remain in it: fewer free phantoms means less room for new nodes, so the
/// chunk graduates to a higher level and is consulted later during
/// [`DATrie`]'s allocation scan.
fn promotion_level(num_phantoms: u16) -> u8 {
    let total = CHUNK_NODE_COUNT as u32;
    let free = num_phantoms as u32;
    for level in (1..NUM_LEVELS).rev() {
        let threshold = total >> ((NUM_LEVELS - level - 1) * 2);
        if free < threshold {
            return level as u8;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolOptions;

    fn new_trie() -> DATrie {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        DATrie::create(pool).unwrap()
    }

    #[test]
    fn insert_and_search_roundtrip() {
        let trie = new_trie();
        let id = trie.insert(b"hello").unwrap().unwrap();
        assert_eq!(trie.search(b"hello").unwrap(), Some(id));
        assert_eq!(trie.search(b"hell").unwrap(), None);
        assert_eq!(trie.search_by_id(id).unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn insert_is_idempotent() {
        let trie = new_trie();
        let id = trie.insert(b"key").unwrap().unwrap();
        let again = trie.insert(b"key").unwrap();
        assert_eq!(again, Err(AlreadyPresent(id)));
    }

    #[test]
    fn shared_prefixes_stay_distinct() {
        let trie = new_trie();
        let a = trie.insert(b"ab").unwrap().unwrap();
        let b = trie.insert(b"abc").unwrap().unwrap();
        let c = trie.insert(b"abd").unwrap().unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(trie.search(b"ab").unwrap(), Some(a));
        assert_eq!(trie.search(b"abc").unwrap(), Some(b));
        assert_eq!(trie.search(b"abd").unwrap(), Some(c));
        assert_eq!(trie.search(b"abe").unwrap(), None);
    }

    #[test]
    fn remove_forgets_a_key_without_disturbing_siblings() {
        let trie = new_trie();
        let a = trie.insert(b"apple").unwrap().unwrap();
        trie.insert(b"apply").unwrap().unwrap();
        assert!(trie.remove(b"apple").unwrap());
        assert_eq!(trie.search(b"apple").unwrap(), None);
        assert!(trie.search(b"apply").unwrap().is_some());
        assert!(!trie.remove(b"apple").unwrap());
        assert_eq!(trie.search_by_id(a).unwrap(), None);
    }

    #[test]
    fn update_renames_a_key_in_place() {
        let trie = new_trie();
        let id = trie.insert(b"old").unwrap().unwrap();
        let renamed = trie.update(b"old", b"new").unwrap().unwrap();
        assert_eq!(renamed, id);
        assert_eq!(trie.search(b"old").unwrap(), None);
        assert_eq!(trie.search(b"new").unwrap(), Some(id));
        assert_eq!(trie.search_by_id(id).unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn lcp_search_finds_the_longest_matching_prefix() {
        let trie = new_trie();
        trie.insert(b"go").unwrap().unwrap();
        let gopher = trie.insert(b"gopher").unwrap().unwrap();
        let (id, bytes) = trie.lcp_search(b"gophers are here").unwrap().unwrap();
        assert_eq!(id, gopher);
        assert_eq!(bytes, b"gopher");
        assert_eq!(trie.lcp_search(b"goat").unwrap().unwrap().1, b"go");
        assert!(trie.lcp_search(b"cat").unwrap().is_none());
    }

    #[test]
    fn reopen_preserves_contents() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let trie = DATrie::create(pool.clone()).unwrap();
        let id = trie.insert(b"persisted").unwrap().unwrap();
        let header_id = trie.header_block_id();
        drop(trie);
        let reopened = DATrie::open(pool, header_id).unwrap();
        assert_eq!(reopened.search(b"persisted").unwrap(), Some(id));
        assert_eq!(reopened.num_keys(), 1);
    }

    #[test]
    fn defrag_preserves_live_keys_and_drops_removed_ones() {
        let trie = new_trie();
        trie.insert(b"one").unwrap().unwrap();
        trie.insert(b"two").unwrap().unwrap();
        trie.insert(b"three").unwrap().unwrap();
        trie.remove(b"two").unwrap();
        let defragged = trie.defrag().unwrap();
        assert_eq!(defragged.num_keys(), 2);
        assert!(defragged.search(b"one").unwrap().is_some());
        assert!(defragged.search(b"three").unwrap().is_some());
        assert!(defragged.search(b"two").unwrap().is_none());
    }

    #[test]
    fn trie_options_max_failure_count_is_persisted_across_reopen() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let mut opts = TrieOptions::default();
        opts.max_failure_count(1);
        let trie = opts.create(pool.clone()).unwrap();
        let header_id = trie.header_block_id();
        drop(trie);
        let reopened = DATrie::open(pool, header_id).unwrap();
        assert_eq!(reopened.header().max_failure_count, 1);
    }

    #[test]
    fn grows_past_a_single_node_chunk() {
        let trie = new_trie();
        let mut ids = Vec::new();
        for i in 0..1000u32 {
            let key = format!("key-{i}");
            ids.push(trie.insert(key.as_bytes()).unwrap().unwrap());
        }
        for (i, id) in ids.iter().enumerate() {
            let key = format!("key-{i}");
            assert_eq!(trie.search(key.as_bytes()).unwrap(), Some(*id));
        }
    }
}
