//! L1 Block Pool (spec.md §3.1, §4.1): a logical address space of blocks
//! carved from fixed-size chunks, with a 32-way free-list allocator and
//! time-deferred ("frozen") reclamation so concurrent readers stay safe.

mod block;
mod header;

pub use block::{BlockInfo, BlockStatus, INVALID_BLOCK_ID};

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytemuck::{bytes_of, bytes_of_mut};

use crate::error::{bug, Error, FormatError, IoError};
use crate::mapping::{self, MappingProvider};
use crate::sync::Recycler;

use block::BlockInfoRaw;
use header::{ChunkInfo, PoolHeader, PoolOptionsRaw, MAGIC, MAX_BI_CHUNKS, MAX_DATA_CHUNKS, NUM_FREE_LISTS, VERSION};

/// The block unit: every block's offset and size is a multiple of this many
/// bytes (spec.md §3.1: "2^12 bytes").
pub const BLOCK_UNIT: usize = 1 << 12;

const MAX_FROZEN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Open mode flags (spec.md §4.1). Only `READ_ONLY` is meaningful today: it
/// controls whether the backing file is opened for writing, and is rejected
/// together with `create`/`open_temporary`/`open_anonymous` since those all
/// imply a writable pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const READ_ONLY: Self = Self(1 << 0);

    fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Builder for opening or creating a pool, mirroring the teacher crate's
/// `OpenOptions` pattern.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    chunk_size: usize,
    frozen_duration: Duration,
    unfreeze_count_per_op: u32,
    flags: OpenFlags,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            chunk_size: 4 << 20,
            frozen_duration: Duration::from_secs(600),
            unfreeze_count_per_op: 32,
            flags: OpenFlags::default(),
        }
    }
}

impl PoolOptions {
    pub fn chunk_size(&mut self, size: usize) -> &mut Self {
        self.chunk_size = size;
        self
    }

    /// How long a freed block stays `Frozen` before it's eligible for reuse.
    /// Defaults to 10 minutes; clamped to a maximum of 1 day (spec.md §5).
    pub fn frozen_duration(&mut self, d: Duration) -> &mut Self {
        self.frozen_duration = d.min(MAX_FROZEN_DURATION);
        self
    }

    pub fn unfreeze_count_per_operation(&mut self, n: u32) -> &mut Self {
        self.unfreeze_count_per_op = n;
        self
    }

    pub fn flags(&mut self, flags: OpenFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.chunk_size == 0
            || self.chunk_size % BLOCK_UNIT != 0
            || !self.chunk_size.is_power_of_two()
            || self.chunk_size > (1 << 30)
        {
            return Err(Error::logic(
                "chunk size must be a power of two, a multiple of the block unit, and at most 2^30 bytes",
            ));
        }
        Ok(())
    }

    /// Create a new pool backed by a file at `path`, failing if one already
    /// exists and is non-empty.
    pub fn create<P: AsRef<Path>>(&self, path: P) -> Result<Pool, Error> {
        self.validate()?;
        if self.flags.contains(OpenFlags::READ_ONLY) {
            return Err(Error::logic("cannot combine create() with the READ_ONLY flag"));
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(IoError::Open)?;
        self.open_file(file, true)
    }

    /// Open an existing file-backed pool, or create one if it doesn't exist
    /// yet (spec.md names `open` and an implicit create-or-open behavior;
    /// this crate exposes both through one call since `std::fs::OpenOptions`
    /// already makes that distinction cheap and safe).
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Pool, Error> {
        self.validate()?;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(!self.flags.contains(OpenFlags::READ_ONLY))
            .create(!self.flags.contains(OpenFlags::READ_ONLY))
            .open(path)
            .map_err(IoError::Open)?;
        let is_new = file.metadata().map_err(IoError::Open)?.len() == 0;
        self.open_file(file, is_new)
    }

    /// Open a file-backed pool that behaves like an anonymous one: the file
    /// exists only to back the mapping for this process's lifetime, and
    /// callers should treat its contents as not meant to outlive the
    /// process. A plain anonymous mapping would do as well; this crate opts
    /// for a real temp file so that `sync` still has somewhere to write,
    /// matching the "best-effort, explicit sync" durability story in
    /// spec.md §1 even for nominally temporary data.
    pub fn open_temporary(&self) -> Result<Pool, Error> {
        self.validate()?;
        if self.flags.contains(OpenFlags::READ_ONLY) {
            return Err(Error::logic("a temporary pool cannot be READ_ONLY"));
        }
        let mut path = std::env::temp_dir();
        let unique = format!("grnxx-pool-{}-{:p}.tmp", std::process::id(), &path);
        path.push(unique);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(IoError::Open)?;
        let _ = std::fs::remove_file(&path);
        self.open_file(file, true)
    }

    /// Open a pool backed purely by anonymous memory: nothing is persisted,
    /// and `sync` is a no-op.
    pub fn open_anonymous(&self) -> Result<Pool, Error> {
        self.validate()?;
        let mut mapping = mapping::open_anonymous(self.chunk_size);
        let chunk0 = mapping.create_chunk()?;
        debug_assert_eq!(chunk0, 0);
        Pool::init_new(mapping, self)
    }

    fn open_file(&self, file: File, is_new: bool) -> Result<Pool, Error> {
        use fs4::fs_std::FileExt;
        file.try_lock_exclusive().map_err(IoError::Lock)?;

        let file_len = file.metadata().map_err(IoError::Open)?.len() as usize;
        if !is_new && (file_len < self.chunk_size || file_len % self.chunk_size != 0) {
            return Err(FormatError::FileSize.into());
        }
        let existing_chunks = if is_new { 0 } else { (file_len / self.chunk_size) as u16 };

        let mut mapping = mapping::open_file(file, self.chunk_size, existing_chunks)?;
        if is_new {
            let chunk0 = mapping.create_chunk()?;
            debug_assert_eq!(chunk0, 0);
            Pool::init_new(mapping, self)
        } else {
            Pool::init_existing(mapping)
        }
    }
}

struct PoolState {
    mapping: MappingProvider,
}

struct PoolInner {
    /// Base pointer of chunk 0, where the header lives. Stable for the
    /// lifetime of `state.mapping` (chunks are only ever appended, never
    /// moved or unmapped) so it's safe to cache outside the lock.
    header_ptr: *mut u8,
    state: Mutex<PoolState>,
    recycler: Recycler,
    block_unit: usize,
    chunk_size: usize,
}

// Safety: `header_ptr` refers to memory owned by `state.mapping`, which
// outlives every access to it (the `Arc<PoolInner>` keeps both alive
// together); all mutation of the bytes it points to happens while
// `state` is locked.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

/// A persistent, memory-mapped block pool (spec.md §4.1).
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

/// Allocate a pool backed by anonymous memory with default options.
pub fn alloc_anon() -> Result<Pool, Error> {
    PoolOptions::default().open_anonymous()
}

/// Allocate a pool backed by a file at `path` with default options,
/// creating it if necessary.
pub fn alloc_open<P: AsRef<Path>>(path: P) -> Result<Pool, Error> {
    PoolOptions::default().open(path)
}

impl Pool {
    fn header(&self) -> &PoolHeader {
        unsafe { &*(self.inner.header_ptr as *const PoolHeader) }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut PoolHeader {
        unsafe { &mut *(self.inner.header_ptr as *mut PoolHeader) }
    }

    fn init_new(mapping: MappingProvider, options: &PoolOptions) -> Result<Pool, Error> {
        let chunk_size = mapping.chunk_size();
        let header_ptr = unsafe { mapping.chunk_base(0) };
        let header = unsafe { &mut *(header_ptr as *mut PoolHeader) };
        *header = bytemuck::Zeroable::zeroed();
        header.magic = MAGIC;
        header.version = VERSION;
        header.options = PoolOptionsRaw {
            block_unit: BLOCK_UNIT as u32,
            chunk_size: chunk_size as u32,
            frozen_duration_ms: options.frozen_duration.as_millis() as u32,
            unfreeze_count_per_op: options.unfreeze_count_per_op,
        };
        for list in header.free_list_heads.iter_mut() {
            *list = INVALID_BLOCK_ID;
        }
        for list in header.free_list_tails.iter_mut() {
            *list = INVALID_BLOCK_ID;
        }
        header.phantom_head = INVALID_BLOCK_ID;
        header.freeze_head = INVALID_BLOCK_ID;
        header.num_data_chunks = 1;
        header.data_chunks[0] = ChunkInfo {
            // The pool header occupies the first block unit of chunk 0.
            watermark_units: 1,
            head_block_id: INVALID_BLOCK_ID,
            tail_block_id: INVALID_BLOCK_ID,
            chunk_id: 0,
            _reserved: 0,
        };

        let inner = Arc::new(PoolInner {
            header_ptr,
            state: Mutex::new(PoolState { mapping }),
            recycler: Recycler::new(),
            block_unit: BLOCK_UNIT,
            chunk_size,
        });
        Ok(Pool { inner })
    }

    fn init_existing(mapping: MappingProvider) -> Result<Pool, Error> {
        let header_ptr = unsafe { mapping.chunk_base(0) };
        let header = unsafe { &*(header_ptr as *const PoolHeader) };
        if header.magic != MAGIC {
            return Err(FormatError::FileType.into());
        }
        if header.version != VERSION {
            return Err(FormatError::Version.into());
        }
        let block_unit = header.options.block_unit as usize;
        let chunk_size = header.options.chunk_size as usize;
        if block_unit != BLOCK_UNIT {
            return Err(FormatError::ValueSizeMismatch.into());
        }
        let inner = Arc::new(PoolInner {
            header_ptr,
            state: Mutex::new(PoolState { mapping }),
            recycler: Recycler::new(),
            block_unit,
            chunk_size,
        });
        Ok(Pool { inner })
    }

    pub fn block_unit(&self) -> usize {
        self.inner.block_unit
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// The opaque monotonic clock handle upper layers use for TTL decisions.
    pub(crate) fn recycler(&self) -> &Recycler {
        &self.inner.recycler
    }

    fn frozen_duration_ms(&self) -> u64 {
        self.header().options.frozen_duration_ms as u64
    }

    fn unfreeze_count_per_op(&self) -> u32 {
        self.header().options.unfreeze_count_per_op
    }

    fn capacity_per_bi_chunk(&self) -> u32 {
        (self.inner.chunk_size / std::mem::size_of::<BlockInfoRaw>()) as u32
    }

    /// Resolve a block-info slot id to its physical chunk id and byte offset.
    fn bi_slot_location(&self, id: u32) -> (u16, usize) {
        let cap = self.capacity_per_bi_chunk();
        let bi_index = (id / cap) as usize;
        let offset = (id % cap) as usize * std::mem::size_of::<BlockInfoRaw>();
        let chunk_id = self.header().bi_chunks[bi_index].chunk_id;
        (chunk_id, offset)
    }

    fn read_bi(&self, state: &PoolState, id: u32) -> BlockInfoRaw {
        let (chunk_id, offset) = self.bi_slot_location(id);
        let base = unsafe { state.mapping.chunk_base(chunk_id) };
        let mut raw: BlockInfoRaw = bytemuck::Zeroable::zeroed();
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(offset), bytes_of_mut(&mut raw).as_mut_ptr(), bytes_of_mut(&mut raw).len());
        }
        raw
    }

    fn write_bi(&self, state: &PoolState, raw: &BlockInfoRaw) {
        let (chunk_id, offset) = self.bi_slot_location(raw.id);
        let base = unsafe { state.mapping.chunk_base(chunk_id) };
        unsafe {
            std::ptr::copy_nonoverlapping(bytes_of(raw).as_ptr(), base.add(offset), bytes_of(raw).len());
        }
    }

    /// Grow the block-info array by one fresh chunk's worth of phantom
    /// slots, chaining them onto the existing phantom list.
    fn grow_bi_chunk(&self, state: &mut PoolState) -> Result<(), Error> {
        let header = self.header_mut();
        if header.num_bi_chunks as usize >= MAX_BI_CHUNKS {
            return Err(Error::resource_exhausted("block-info array has reached its maximum chunk count"));
        }
        let chunk_id = state.mapping.create_chunk()?;
        let cap = self.capacity_per_bi_chunk();
        let base_id = header.num_bi_slots;

        let header = self.header_mut();
        let bi_index = header.num_bi_chunks as usize;
        header.bi_chunks[bi_index] = ChunkInfo {
            watermark_units: 0,
            head_block_id: INVALID_BLOCK_ID,
            tail_block_id: INVALID_BLOCK_ID,
            chunk_id,
            _reserved: 0,
        };
        header.num_bi_chunks += 1;

        let mut link = header.phantom_head;
        for i in 0..cap {
            let id = base_id + i;
            let raw = BlockInfoRaw::phantom(id, link);
            self.write_bi(state, &raw);
            link = id;
        }
        let header = self.header_mut();
        header.phantom_head = base_id + cap - 1;
        header.num_bi_slots = base_id + cap;
        log::debug!("grew block-info array by {cap} slots (chunk {chunk_id})");
        Ok(())
    }

    /// Pop one block-info slot id off the phantom list, growing the array
    /// first if it's empty.
    fn take_phantom_slot(&self, state: &mut PoolState) -> Result<u32, Error> {
        if self.header().phantom_head == INVALID_BLOCK_ID {
            self.grow_bi_chunk(state)?;
        }
        let header = self.header_mut();
        let id = header.phantom_head;
        let raw = self.read_bi(state, id);
        header.phantom_head = raw.link;
        Ok(id)
    }

    /// Free list a block of exactly `units` units is stored on: list `c`
    /// holds blocks whose size is in `[2^c, 2^(c+1))` (spec.md §4.1's
    /// `[unit·2^(k-1), unit·2^k)`, indexed from 0 instead of 1). Every block
    /// on list `c` therefore has size `>= 2^c`.
    fn store_class(units: u32) -> usize {
        if units == 0 {
            0
        } else {
            (31 - units.leading_zeros()) as usize
        }
        .min(NUM_FREE_LISTS - 1)
    }

    /// Smallest free list a `create_block(units)` scan can start at and
    /// still be guaranteed every block on it (and every list after it) is
    /// big enough: the smallest `c` with `2^c >= units`, i.e. `ceil(log2
    /// units)`. Using [`Self::store_class`] here instead would also find
    /// the list `units` itself would be stored on, whose range dips as low
    /// as half of `units` — too small to hand out.
    fn size_class(units: u32) -> usize {
        if units <= 1 {
            0
        } else {
            (32 - (units - 1).leading_zeros() as usize).min(NUM_FREE_LISTS - 1)
        }
    }

    /// Pop the oldest block from free list `class`, if any.
    fn pop_free_list(&self, state: &mut PoolState, class: usize) -> Option<BlockInfoRaw> {
        let header = self.header_mut();
        let id = header.free_list_heads[class];
        if id == INVALID_BLOCK_ID {
            return None;
        }
        let raw = self.read_bi(state, id);
        let header = self.header_mut();
        header.free_list_heads[class] = raw.link;
        if raw.link == INVALID_BLOCK_ID {
            header.free_list_tails[class] = INVALID_BLOCK_ID;
        }
        Some(raw)
    }

    /// Push a newly-idle block onto the tail of its free list.
    fn push_free_list(&self, state: &mut PoolState, mut raw: BlockInfoRaw) {
        let class = Self::store_class(raw.size_units);
        raw.status = BlockStatus::Idle as u8;
        let header = self.header_mut();
        let tail = header.free_list_tails[class];
        raw.link = INVALID_BLOCK_ID;
        self.write_bi(state, &raw);
        let header = self.header_mut();
        if tail == INVALID_BLOCK_ID {
            header.free_list_heads[class] = raw.id;
        } else {
            let mut tail_raw = self.read_bi(state, tail);
            tail_raw.link = raw.id;
            self.write_bi(state, &tail_raw);
        }
        header.free_list_tails[class] = raw.id;
    }

    /// Move up to `unfreeze_count_per_op` expired blocks from the freeze
    /// list to their free lists.
    fn unfreeze(&self, state: &mut PoolState) {
        self.inner.recycler.publish();
        let now = self.inner.recycler.now();
        let threshold = now.saturating_sub(self.frozen_duration_ms());
        let limit = self.unfreeze_count_per_op();

        let mut kept_head = INVALID_BLOCK_ID;
        let mut kept_tail = INVALID_BLOCK_ID;
        let mut cur = self.header().freeze_head;
        let mut unfrozen = 0u32;
        let mut to_idle = Vec::new();

        while cur != INVALID_BLOCK_ID {
            let mut raw = self.read_bi(state, cur);
            let next = raw.link;
            if unfrozen < limit && (raw.extra as u64) <= threshold {
                raw.link = INVALID_BLOCK_ID;
                to_idle.push(raw);
                unfrozen += 1;
            } else {
                raw.link = INVALID_BLOCK_ID;
                self.write_bi(state, &raw);
                if kept_head == INVALID_BLOCK_ID {
                    kept_head = raw.id;
                } else {
                    let mut prev = self.read_bi(state, kept_tail);
                    prev.link = raw.id;
                    self.write_bi(state, &prev);
                }
                kept_tail = raw.id;
            }
            cur = next;
        }
        self.header_mut().freeze_head = kept_head;

        for raw in to_idle {
            let mut raw = raw;
            raw.status = BlockStatus::Idle as u8;
            self.push_free_list(state, raw);
        }
    }

    /// Create (or grow into) the current rearmost data chunk so it has at
    /// least `units` block units of trailing room, returning that chunk's
    /// index into `header.data_chunks`.
    fn ensure_room(&self, state: &mut PoolState, units: u32) -> Result<usize, Error> {
        let header = self.header();
        let units_per_chunk = (self.inner.chunk_size / self.inner.block_unit) as u32;
        let last = header.num_data_chunks as usize - 1;
        if header.data_chunks[last].watermark_units + units <= units_per_chunk {
            return Ok(last);
        }
        if units > units_per_chunk {
            return Err(Error::resource_exhausted("requested block is larger than the chunk size"));
        }
        let header = self.header_mut();
        if header.num_data_chunks as usize >= MAX_DATA_CHUNKS {
            return Err(Error::resource_exhausted("pool has reached its maximum chunk count"));
        }
        let chunk_id = state.mapping.create_chunk()?;
        let header = self.header_mut();
        let idx = header.num_data_chunks as usize;
        header.data_chunks[idx] = ChunkInfo {
            watermark_units: 0,
            head_block_id: INVALID_BLOCK_ID,
            tail_block_id: INVALID_BLOCK_ID,
            chunk_id,
            _reserved: 0,
        };
        header.num_data_chunks += 1;
        log::debug!("pool grew to {} data chunks", header.num_data_chunks);
        Ok(idx)
    }

    /// Append a freshly carved block to its chunk's doubly linked block list.
    fn link_into_chunk(&self, state: &mut PoolState, chunk_idx: usize, id: u32) {
        let header = self.header_mut();
        let tail = header.data_chunks[chunk_idx].tail_block_id;
        if tail == INVALID_BLOCK_ID {
            header.data_chunks[chunk_idx].head_block_id = id;
        } else {
            let mut tail_raw = self.read_bi(state, tail);
            tail_raw.next_block_id = id;
            self.write_bi(state, &tail_raw);
        }
        header.data_chunks[chunk_idx].tail_block_id = id;
    }

    /// Allocate a block of at least `size` bytes (spec.md §4.1).
    pub fn create_block(&self, size: usize) -> Result<BlockInfo, Error> {
        if size == 0 {
            return Err(Error::logic("cannot allocate a zero-sized block"));
        }
        let units = ((size + self.inner.block_unit - 1) / self.inner.block_unit) as u32;
        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;

        self.unfreeze(state);

        let start_class = Self::size_class(units);
        let mut found = None;
        for class in start_class..NUM_FREE_LISTS {
            if let Some(raw) = self.pop_free_list(state, class) {
                if raw.size_units < units {
                    crate::error::bug!("free list held a block smaller than the size class it was scanned for");
                }
                found = Some(raw);
                break;
            }
        }

        let mut raw = if let Some(raw) = found {
            raw
        } else {
            // Nothing idle fits: carve a fresh block off a chunk's tail.
            let chunk_idx = self.ensure_room(state, units)?;
            let id = self.take_phantom_slot(state)?;
            let header = self.header_mut();
            let chunk = &mut header.data_chunks[chunk_idx];
            let offset_units = chunk.watermark_units;
            chunk.watermark_units += units;
            let chunk_id = chunk.chunk_id;
            let mut raw = BlockInfoRaw::phantom(id, INVALID_BLOCK_ID);
            raw.chunk_id = chunk_id;
            raw.offset_units = offset_units;
            raw.size_units = units;
            self.link_into_chunk(state, chunk_idx, id);
            raw
        };

        // Split off any excess into a new idle block.
        if raw.size_units > units {
            let remainder_units = raw.size_units - units;
            let remainder_id = self.take_phantom_slot(state)?;
            let mut remainder = BlockInfoRaw {
                id: remainder_id,
                chunk_id: raw.chunk_id,
                status: BlockStatus::Idle as u8,
                _reserved: 0,
                offset_units: raw.offset_units + units,
                size_units: remainder_units,
                next_block_id: raw.next_block_id,
                prev_block_id: raw.id,
                link: INVALID_BLOCK_ID,
                extra: 0,
            };
            if remainder.next_block_id != INVALID_BLOCK_ID {
                let mut next_raw = self.read_bi(state, remainder.next_block_id);
                next_raw.prev_block_id = remainder.id;
                self.write_bi(state, &next_raw);
            } else {
                // Remainder becomes the new tail of its chunk.
                let header = self.header_mut();
                for ci in header.data_chunks.iter_mut().take(header.num_data_chunks as usize) {
                    if ci.chunk_id == raw.chunk_id && ci.tail_block_id == raw.id {
                        ci.tail_block_id = remainder.id;
                    }
                }
            }
            raw.next_block_id = remainder.id;
            raw.size_units = units;
            self.push_free_list(state, remainder);
        }

        raw.status = BlockStatus::Active as u8;
        raw.link = INVALID_BLOCK_ID;
        raw.extra = 0;
        self.write_bi(state, &raw);
        log::trace!("allocated block {} ({} bytes)", raw.id, raw.size_units as usize * self.inner.block_unit);
        Ok(BlockInfo::from_raw(raw))
    }

    /// Read a block's current info (spec.md §4.1). Returned by value; see
    /// `BlockInfo`'s doc comment for why.
    pub fn get_block_info(&self, id: u32) -> Result<BlockInfo, Error> {
        let guard = self.inner.state.lock().unwrap();
        if id >= self.header().num_bi_slots {
            return Err(Error::logic("block id is out of range"));
        }
        let raw = self.read_bi(&guard, id);
        Ok(BlockInfo::from_raw(raw))
    }

    /// Base address of a block's storage.
    pub fn get_block_address(&self, info: &BlockInfo) -> *mut u8 {
        let guard = self.inner.state.lock().unwrap();
        let base = unsafe { guard.mapping.chunk_base(info.chunk_id()) };
        unsafe { base.add(info.offset(self.inner.block_unit)) }
    }

    /// Free a block, transitioning it `Active` -> `Frozen`. Never reuses the
    /// storage immediately (spec.md §4.1; freeing a non-`Active` block is a
    /// programming error).
    pub fn free_block(&self, id: u32) -> Result<(), Error> {
        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;
        let mut raw = self.read_bi(state, id);
        if raw.status != BlockStatus::Active as u8 {
            bug!("freed a block that was not Active");
        }
        self.inner.recycler.publish();
        raw.status = BlockStatus::Frozen as u8;
        raw.extra = self.inner.recycler.now() as u32;
        let header = self.header_mut();
        raw.link = header.freeze_head;
        self.write_bi(state, &raw);
        header.freeze_head = id;
        log::trace!("froze block {id}");
        Ok(())
    }

    /// Request a write-back of the region backing `info`. Purely advisory.
    pub fn sync_block(&self, info: &BlockInfo) -> Result<(), Error> {
        let guard = self.inner.state.lock().unwrap();
        guard
            .mapping
            .sync(info.chunk_id(), info.offset(self.inner.block_unit), info.size(self.inner.block_unit))
    }

    /// Flush every mapped chunk to its backing file.
    pub fn sync(&self) -> Result<(), Error> {
        let guard = self.inner.state.lock().unwrap();
        guard.mapping.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_roundtrip() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let a = pool.create_block(4096).unwrap();
        assert_eq!(a.status(), BlockStatus::Active);
        let addr = pool.get_block_address(&a);
        unsafe {
            *addr = 0xAB;
        }
        pool.free_block(a.id()).unwrap();
        let info = pool.get_block_info(a.id()).unwrap();
        assert_eq!(info.status(), BlockStatus::Frozen);
    }

    #[test]
    fn split_excess_on_allocation() {
        let mut opts = PoolOptions::default();
        opts.chunk_size(64 << 10);
        let pool = opts.open_anonymous().unwrap();
        let big = pool.create_block(8 * BLOCK_UNIT).unwrap();
        pool.free_block(big.id()).unwrap();
        // Re-request a smaller size; the free block should split.
        let small = pool.create_block(2 * BLOCK_UNIT).unwrap();
        assert_eq!(small.size(BLOCK_UNIT), 2 * BLOCK_UNIT);
    }

    #[test]
    fn free_block_that_is_not_active_panics() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let a = pool.create_block(4096).unwrap();
        pool.free_block(a.id()).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pool.free_block(a.id())));
        assert!(result.is_err());
    }

    #[test]
    fn grows_chunks_on_demand() {
        let mut opts = PoolOptions::default();
        opts.chunk_size(64 << 10); // force many chunks quickly
        let pool = opts.open_anonymous().unwrap();
        let mut ids = Vec::new();
        for _ in 0..64 {
            ids.push(pool.create_block(BLOCK_UNIT).unwrap().id());
        }
        assert!(ids.len() == 64);
    }
}
