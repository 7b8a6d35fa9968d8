//! On-disk layout of the pool header (spec.md §6), and the tunables in
//! [`crate::pool::PoolOptions`] that get folded into it.

use bytemuck::{Pod, Zeroable};

/// "grnxx::io::Pool" zero-padded to 64 bytes — the on-disk format tag
/// spec.md §6 names for the pool header.
pub(crate) const MAGIC: [u8; 64] = {
    let mut buf = [0u8; 64];
    let tag = b"grnxx::io::Pool";
    let mut i = 0;
    while i < tag.len() {
        buf[i] = tag[i];
        i += 1;
    }
    buf
};

pub(crate) const VERSION: [u8; 64] = {
    let mut buf = [0u8; 64];
    let tag = b"0.0.0";
    let mut i = 0;
    while i < tag.len() {
        buf[i] = tag[i];
        i += 1;
    }
    buf
};

/// Number of free lists (spec.md §4.1: "32 free lists").
pub(crate) const NUM_FREE_LISTS: usize = 32;

/// Maximum number of data chunks a pool can grow to. Spec.md §6 describes
/// 2048 `ChunkInfo` entries per array in the original's address-space-wide
/// design; this crate keeps the pool header to a single block
/// (`BLOCK_UNIT` bytes) and so caps the chunk tables at a size that fits —
/// see DESIGN.md for the tradeoff.
pub(crate) const MAX_DATA_CHUNKS: usize = 48;
/// Maximum number of chunks backing the block-info array itself.
pub(crate) const MAX_BI_CHUNKS: usize = 16;

/// Per-chunk allocator bookkeeping: the bump-pointer watermark for carving
/// fresh blocks off the chunk's unused tail, and the head/tail of the
/// chunk's doubly linked block list (spec.md §3.1: "every block is
/// reachable from its chunk's doubly linked list").
#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
pub(crate) struct ChunkInfo {
    pub watermark_units: u32,
    pub head_block_id: u32,
    pub tail_block_id: u32,
    /// The physical chunk id in the mapping provider that backs this entry.
    /// Stored explicitly (rather than assumed equal to the array index)
    /// because data chunks and block-info chunks are carved from the same
    /// underlying chunk-id sequence.
    pub chunk_id: u16,
    pub _reserved: u16,
}

const _: () = assert!(std::mem::size_of::<ChunkInfo>() == 16);

/// Fixed-layout tunables, persisted so a reopen uses the same policy the
/// pool was created with.
#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
pub(crate) struct PoolOptionsRaw {
    pub block_unit: u32,
    pub chunk_size: u32,
    pub frozen_duration_ms: u32,
    pub unfreeze_count_per_op: u32,
}

const _: () = assert!(std::mem::size_of::<PoolOptionsRaw>() == 16);

/// The full pool header, laid out at offset 0 of chunk 0 (spec.md §6: "The
/// first block of chunk 0 is the pool header").
#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
pub(crate) struct PoolHeader {
    pub magic: [u8; 64],
    pub version: [u8; 64],
    pub options: PoolOptionsRaw,
    pub num_bi_slots: u32,
    pub phantom_head: u32,
    pub freeze_head: u32,
    pub num_data_chunks: u16,
    pub num_bi_chunks: u16,
    pub free_list_heads: [u32; NUM_FREE_LISTS],
    pub free_list_tails: [u32; NUM_FREE_LISTS],
    pub recycler_tick: u64,
    pub data_chunks: [ChunkInfo; MAX_DATA_CHUNKS],
    pub bi_chunks: [ChunkInfo; MAX_BI_CHUNKS],
    pub data_mutex: u32,
    pub file_mutex: u32,
}

const _: () = assert!(std::mem::size_of::<PoolHeader>() <= 4096);
