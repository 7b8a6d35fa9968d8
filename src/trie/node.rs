//! Double-array node encoding (spec.md §4.3, "large" variant): a single
//! 64-bit packed cell with `const fn` encode/decode accessors, per the
//! design notes' guidance to model a bit-packed union this way rather than
//! mirror a C++ anonymous union.
//!
//! The large variant widens `offset`/`key_pos` relative to the basic layout
//! by moving the sibling label out of the cell into a parallel byte array
//! (`DATrie::siblings`); `has_sibling` only says whether that array's entry
//! is meaningful for this node.

use bytemuck::{Pod, Zeroable};

/// Sentinel label for "the empty suffix", ordered first among a node's
/// children (spec.md §4.3: "TERMINAL first, then ascending by byte").
/// Deliberately outside `0..=255` so it can't collide with a real byte —
/// the reason `label`/`child` need a 9th bit.
pub(crate) const TERMINAL_LABEL: u16 = 256;
/// Sentinel meaning "no label": an empty child or sibling chain.
pub(crate) const INVALID_LABEL: u16 = 511;
/// Sentinel meaning "no offset has been assigned yet".
pub(crate) const INVALID_OFFSET: u64 = (1 << 42) - 1;
/// Node id of the trie root.
pub(crate) const ROOT_NODE_ID: u32 = 0;
/// Nodes per chunk (spec.md §3.3: "chunk_i = nodes[i*512 : (i+1)*512]").
pub(crate) const CHUNK_NODE_COUNT: u32 = 512;
/// Number of level groups a chunk can belong to (spec.md §4.3 "level in
/// `[0, 5]`").
pub(crate) const NUM_LEVELS: usize = 6;
/// `find_offset` promotes a chunk to the next level after this many failed
/// scans (spec.md §4.3).
pub(crate) const MAX_FAILURE_COUNT: u8 = 4;
/// `find_offset` gives up on a level group and allocates a fresh chunk after
/// inspecting this many chunks (spec.md §4.3).
pub(crate) const MAX_CHUNK_COUNT: u32 = 16;
/// Largest key-ID a leaf node cell can stamp (one bit short of the `2^40-1`
/// bound spec.md §4.3 states for the large variant: the chunk-local node
/// encoding's 60 non-flag bits split as `label(9) + key_id(39) +
/// key_size(12)` leave only 39 bits here, a documented rounding — see
/// DESIGN.md).
pub(crate) const MAX_NODE_KEY_ID: u64 = (1 << 39) - 1;
/// Largest representable key length (spec.md §4.3: "max_key_size = 4095").
pub(crate) const MAX_KEY_SIZE: usize = 4095;
/// Sentinel chunk id meaning "no chunk" (empty level-group list).
pub(crate) const INVALID_CHUNK_ID: u32 = u32::MAX;

const IS_ORIGIN: u64 = 1 << 63;
const IS_PHANTOM: u64 = 1 << 62;
const IS_LEAF: u64 = 1 << 61;
const HAS_SIBLING: u64 = 1 << 60;

const LABEL_SHIFT: u32 = 0;
const LABEL_MASK: u64 = 0x1FF;
const PREV_SHIFT: u32 = 9;
const PREV_MASK: u64 = 0x1FF;
const KEY_POS_SHIFT: u32 = 9;
const KEY_POS_MASK: u64 = (1 << 39) - 1;
const KEY_SIZE_SHIFT: u32 = 48;
const KEY_SIZE_MASK: u64 = 0xFFF;
const OFFSET_SHIFT: u32 = 9;
const OFFSET_MASK: u64 = (1 << 42) - 1;
const CHILD_SHIFT: u32 = 51;
const CHILD_MASK: u64 = 0x1FF;

/// One double-array node. `label`/`next` alias the same bits (mutually
/// exclusive via `is_phantom`); likewise `key_id`+`key_size` (leaf) and
/// `offset`+`child` (non-leaf, non-phantom) alias `prev`'s bit range.
///
/// A leaf stores the key-ID rather than the key buffer position directly;
/// [`crate::trie::DATrie`]'s `entries` table maps that ID to the actual
/// `(key_pos, key_size)` pair in the key buffer (spec.md §3.3's entries
/// table). `key_size` is kept on the node too so a search can validate a
/// candidate leaf's length without a second indirection.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Zeroable, Pod)]
pub(crate) struct NodeCell(u64);

impl NodeCell {
    pub const fn zero() -> Self {
        NodeCell(0)
    }

    pub const fn is_origin(self) -> bool {
        self.0 & IS_ORIGIN != 0
    }
    pub const fn is_phantom(self) -> bool {
        self.0 & IS_PHANTOM != 0
    }
    pub const fn is_leaf(self) -> bool {
        self.0 & IS_LEAF != 0
    }
    pub const fn has_sibling(self) -> bool {
        self.0 & HAS_SIBLING != 0
    }

    pub const fn set_origin(self, v: bool) -> Self {
        NodeCell(if v { self.0 | IS_ORIGIN } else { self.0 & !IS_ORIGIN })
    }
    pub const fn set_phantom(self, v: bool) -> Self {
        NodeCell(if v { self.0 | IS_PHANTOM } else { self.0 & !IS_PHANTOM })
    }
    pub const fn set_leaf(self, v: bool) -> Self {
        NodeCell(if v { self.0 | IS_LEAF } else { self.0 & !IS_LEAF })
    }
    pub const fn set_has_sibling(self, v: bool) -> Self {
        NodeCell(if v { self.0 | HAS_SIBLING } else { self.0 & !HAS_SIBLING })
    }

    /// Incoming edge label from this node's parent (every non-root,
    /// non-phantom node has one).
    pub const fn label(self) -> u16 {
        ((self.0 >> LABEL_SHIFT) & LABEL_MASK) as u16
    }
    pub const fn set_label(self, label: u16) -> Self {
        let cleared = self.0 & !(LABEL_MASK << LABEL_SHIFT);
        NodeCell(cleared | ((label as u64 & LABEL_MASK) << LABEL_SHIFT))
    }

    /// Next phantom node in this chunk's free list (phantom nodes only).
    pub const fn next(self) -> u32 {
        ((self.0 >> LABEL_SHIFT) & LABEL_MASK) as u32
    }
    pub const fn set_next(self, next: u32) -> Self {
        let cleared = self.0 & !(LABEL_MASK << LABEL_SHIFT);
        NodeCell(cleared | ((next as u64 & LABEL_MASK) << LABEL_SHIFT))
    }

    /// Previous phantom node in this chunk's free list (phantom nodes only).
    pub const fn prev(self) -> u32 {
        ((self.0 >> PREV_SHIFT) & PREV_MASK) as u32
    }
    pub const fn set_prev(self, prev: u32) -> Self {
        let cleared = self.0 & !(PREV_MASK << PREV_SHIFT);
        NodeCell(cleared | ((prev as u64 & PREV_MASK) << PREV_SHIFT))
    }

    /// Key-ID this leaf carries (an index into `DATrie::entries`).
    pub const fn key_id(self) -> u64 {
        (self.0 >> KEY_POS_SHIFT) & KEY_POS_MASK
    }
    pub const fn set_key_id(self, key_id: u64) -> Self {
        let cleared = self.0 & !(KEY_POS_MASK << KEY_POS_SHIFT);
        NodeCell(cleared | ((key_id & KEY_POS_MASK) << KEY_POS_SHIFT))
    }

    /// Length in bytes of this leaf's key.
    pub const fn key_size(self) -> u16 {
        ((self.0 >> KEY_SIZE_SHIFT) & KEY_SIZE_MASK) as u16
    }
    pub const fn set_key_size(self, size: u16) -> Self {
        let cleared = self.0 & !(KEY_SIZE_MASK << KEY_SIZE_SHIFT);
        NodeCell(cleared | ((size as u64 & KEY_SIZE_MASK) << KEY_SIZE_SHIFT))
    }

    /// Base offset such that child `label` lives at node id `offset ^ label`.
    pub const fn offset(self) -> u64 {
        (self.0 >> OFFSET_SHIFT) & OFFSET_MASK
    }
    pub const fn set_offset(self, offset: u64) -> Self {
        let cleared = self.0 & !(OFFSET_MASK << OFFSET_SHIFT);
        NodeCell(cleared | ((offset & OFFSET_MASK) << OFFSET_SHIFT))
    }

    /// Label of this node's first child (children form a sorted sibling
    /// chain starting here, walked through [`crate::trie::DATrie`]'s
    /// `siblings` array).
    pub const fn child(self) -> u16 {
        ((self.0 >> CHILD_SHIFT) & CHILD_MASK) as u16
    }
    pub const fn set_child(self, child: u16) -> Self {
        let cleared = self.0 & !(CHILD_MASK << CHILD_SHIFT);
        NodeCell(cleared | ((child as u64 & CHILD_MASK) << CHILD_SHIFT))
    }
}

const _: () = assert!(std::mem::size_of::<NodeCell>() == 8);

/// Per-512-node chunk allocator bookkeeping (spec.md §4.3 "Chunk metadata").
#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
pub(crate) struct ChunkMeta {
    /// Next chunk in this level group's doubly linked list.
    pub next: u32,
    /// Previous chunk in this level group's doubly linked list.
    pub prev: u32,
    /// Local node index (0..512) of one phantom node in this chunk, or
    /// `CHUNK_NODE_COUNT` if the chunk has none.
    pub first_phantom: u16,
    pub level: u8,
    pub failure_count: u8,
    pub num_phantoms: u16,
    pub _reserved: u16,
}

const _: () = assert!(std::mem::size_of::<ChunkMeta>() == 16);

impl ChunkMeta {
    pub fn empty(level: u8) -> Self {
        ChunkMeta {
            next: INVALID_CHUNK_ID,
            prev: INVALID_CHUNK_ID,
            first_phantom: CHUNK_NODE_COUNT as u16,
            level,
            failure_count: 0,
            num_phantoms: 0,
            _reserved: 0,
        }
    }
}

const ENTRY_VALID: u64 = 1 << 63;
const ENTRY_POS_SHIFT: u32 = 0;
const ENTRY_POS_MASK: u64 = (1 << 40) - 1;
const ENTRY_SIZE_SHIFT: u32 = 40;
const ENTRY_SIZE_MASK: u64 = 0xFFF;

/// A key-ID table entry: either a live `(key_pos, key_size)` pair, or (when
/// free) the next id in the free-entry list (spec.md §3.3, §4.3 removal
/// protocol).
#[repr(transparent)]
#[derive(Clone, Copy, Zeroable, Pod)]
pub(crate) struct EntryCell(u64);

impl EntryCell {
    /// Sentinel terminating the free-entry list.
    pub const INVALID_KEY_ID: u64 = (1 << 40) - 1;

    pub const fn free(next_key_id: u64) -> Self {
        EntryCell(next_key_id & ENTRY_POS_MASK)
    }

    pub const fn valid(key_pos: u64, key_size: u16) -> Self {
        EntryCell(ENTRY_VALID | (key_pos & ENTRY_POS_MASK) | ((key_size as u64 & ENTRY_SIZE_MASK) << ENTRY_SIZE_SHIFT))
    }

    pub const fn is_valid(self) -> bool {
        self.0 & ENTRY_VALID != 0
    }

    pub const fn key_pos(self) -> u64 {
        self.0 & ENTRY_POS_MASK
    }

    pub const fn key_size(self) -> u16 {
        ((self.0 >> ENTRY_SIZE_SHIFT) & ENTRY_SIZE_MASK) as u16
    }

    pub const fn next_key_id(self) -> u64 {
        self.0 & ENTRY_POS_MASK
    }
}

const _: () = assert!(std::mem::size_of::<EntryCell>() == 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_cell_roundtrips_leaf_fields() {
        let cell = NodeCell::zero()
            .set_leaf(true)
            .set_label(TERMINAL_LABEL)
            .set_key_id(MAX_NODE_KEY_ID)
            .set_key_size(MAX_KEY_SIZE as u16);
        assert!(cell.is_leaf());
        assert_eq!(cell.label(), TERMINAL_LABEL);
        assert_eq!(cell.key_id(), MAX_NODE_KEY_ID);
        assert_eq!(cell.key_size(), MAX_KEY_SIZE as u16);
    }

    #[test]
    fn node_cell_roundtrips_interior_fields() {
        let cell = NodeCell::zero()
            .set_origin(true)
            .set_label(65)
            .set_offset(INVALID_OFFSET)
            .set_child(TERMINAL_LABEL);
        assert!(cell.is_origin());
        assert!(!cell.is_leaf());
        assert_eq!(cell.label(), 65);
        assert_eq!(cell.offset(), INVALID_OFFSET);
        assert_eq!(cell.child(), TERMINAL_LABEL);
    }

    #[test]
    fn node_cell_roundtrips_phantom_fields() {
        let cell = NodeCell::zero().set_phantom(true).set_next(7).set_prev(9);
        assert!(cell.is_phantom());
        assert_eq!(cell.next(), 7);
        assert_eq!(cell.prev(), 9);
    }

    #[test]
    fn entry_cell_distinguishes_valid_and_free() {
        let valid = EntryCell::valid(12345, 42);
        assert!(valid.is_valid());
        assert_eq!(valid.key_pos(), 12345);
        assert_eq!(valid.key_size(), 42);

        let free = EntryCell::free(999);
        assert!(!free.is_valid());
        assert_eq!(free.next_key_id(), 999);
    }
}
