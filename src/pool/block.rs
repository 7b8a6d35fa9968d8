//! §3.1 `BlockInfo`: the parallel array entry describing one allocated
//! block. Packed to exactly `BLOCK_INFO_SIZE = 32` bytes (spec.md §6) so the
//! on-disk block-info chunks are a plain array of these records.

use bytemuck::{Pod, Zeroable};

/// Sentinel block id meaning "no block" (spec.md §3.1).
pub const INVALID_BLOCK_ID: u32 = 0xFFFF_FFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    /// Place-holder reservation in the block-info array that never held
    /// user data; linked on its chunk's phantom free list.
    Phantom,
    /// In use by a caller.
    Active,
    /// Freed, but not yet past its frozen duration; unsafe to reuse.
    Frozen,
    /// Past its frozen duration; available to satisfy new allocations.
    Idle,
}

impl BlockStatus {
    const PHANTOM: u8 = 0;
    const ACTIVE: u8 = 1;
    const FROZEN: u8 = 2;
    const IDLE: u8 = 3;

    fn from_raw(v: u8) -> Self {
        match v {
            Self::PHANTOM => BlockStatus::Phantom,
            Self::ACTIVE => BlockStatus::Active,
            Self::FROZEN => BlockStatus::Frozen,
            Self::IDLE => BlockStatus::Idle,
            _ => crate::error::bug!("block status byte held a value outside {Phantom,Active,Frozen,Idle}"),
        }
    }

    fn to_raw(self) -> u8 {
        match self {
            BlockStatus::Phantom => Self::PHANTOM,
            BlockStatus::Active => Self::ACTIVE,
            BlockStatus::Frozen => Self::FROZEN,
            BlockStatus::Idle => Self::IDLE,
        }
    }
}

/// On-disk layout of one block-info record. 32 bytes, native byte order
/// (this crate picks native order and does not claim cross-endian
/// portability, per spec.md §6).
///
/// `link` is the single status-dependent pointer field: the next block on
/// whichever singly-linked list this block currently belongs to (a free
/// list when `Idle`, the freeze list when `Frozen`, the phantom list when
/// `Phantom`; unused when `Active`). `extra` holds either the frozen
/// timestamp (`Frozen`) or the previous-in-idle-list id used to support
/// FIFO removal from the tail (`Idle`); unused otherwise.
#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
pub(crate) struct BlockInfoRaw {
    pub id: u32,
    pub chunk_id: u16,
    pub status: u8,
    pub _reserved: u8,
    pub offset_units: u32,
    pub size_units: u32,
    pub next_block_id: u32,
    pub prev_block_id: u32,
    pub link: u32,
    pub extra: u32,
}

const _: () = assert!(std::mem::size_of::<BlockInfoRaw>() == 32);

impl BlockInfoRaw {
    pub fn phantom(id: u32, link: u32) -> Self {
        Self {
            id,
            chunk_id: 0,
            status: BlockStatus::Phantom.to_raw(),
            _reserved: 0,
            offset_units: 0,
            size_units: 0,
            next_block_id: INVALID_BLOCK_ID,
            prev_block_id: INVALID_BLOCK_ID,
            link,
            extra: 0,
        }
    }
}

/// An owned snapshot of one block-info record. Returned by value rather
/// than by reference (spec.md §4.1 writes the contract as `-> &BlockInfo`,
/// but the design notes call for not holding long-lived references across
/// operations that may remap the backing store; since the record is a
/// plain 32-byte `Copy` value, handing back an owned snapshot sidesteps the
/// issue entirely and is the more idiomatic rendition in Rust).
#[derive(Clone, Copy, Debug)]
pub struct BlockInfo {
    pub(crate) raw: BlockInfoRaw,
}

impl BlockInfo {
    pub(crate) fn from_raw(raw: BlockInfoRaw) -> Self {
        Self { raw }
    }

    pub fn id(&self) -> u32 {
        self.raw.id
    }

    pub fn status(&self) -> BlockStatus {
        BlockStatus::from_raw(self.raw.status)
    }

    pub fn chunk_id(&self) -> u16 {
        self.raw.chunk_id
    }

    pub fn offset(&self, block_unit: usize) -> usize {
        self.raw.offset_units as usize * block_unit
    }

    pub fn size(&self, block_unit: usize) -> usize {
        self.raw.size_units as usize * block_unit
    }

    pub fn next_block_id(&self) -> u32 {
        self.raw.next_block_id
    }

    pub fn prev_block_id(&self) -> u32 {
        self.raw.prev_block_id
    }

    /// The frozen timestamp, valid only when `status() == Frozen`.
    pub fn frozen_stamp(&self) -> u32 {
        self.raw.extra
    }
}
