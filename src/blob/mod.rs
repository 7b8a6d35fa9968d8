//! L3b Blob Store (spec.md §3.4, §4.4): an ID -> bytes map built on one
//! paged vector of [`cell::BlobCell`]s plus four append-only MEDIUM
//! sub-stores (8/16/32/64-byte slots), one LARGE store with its own
//! in-band value headers and class-bucketed free/freeze lists, and
//! dedicated pool blocks for HUGE values.
//!
//! Replacing a value is always a compare-and-swap on its 64-bit cell (§5):
//! build the new cell (allocating its external storage first if needed),
//! swap, then free whatever the old cell pointed at. `unset` is the one
//! replace operation this store exposes, swapping in the all-zero SMALL
//! cell.

mod cell;

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytemuck::{Pod, Zeroable};

use crate::error::{bug, Error};
use crate::pool::Pool;
use crate::sync::cas_update;
use crate::vector::PagedVector;

use cell::{BlobCell, ValueHeader, TAG_HUGE, TAG_LARGE, TAG_MEDIUM, TAG_SMALL, VALUE_ACTIVE, VALUE_FROZEN, VALUE_IDLE};

const MAGIC: [u8; 32] = *b"grnxx::BlobStore\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0";
const VERSION: u32 = 1;

/// Slot sizes of the four MEDIUM sub-stores, smallest first (spec.md §3.4:
/// "four size classes: 8/16/32/64").
const MEDIUM_SLOT_SIZES: [usize; 4] = [8, 16, 32, 64];
const MEDIUM_MAX_LEN: usize = 64;
/// Largest payload a LARGE cell's 16-bit length field can record; anything
/// bigger goes to a dedicated HUGE block instead.
const LARGE_MAX_LEN: usize = u16::MAX as usize;

/// Allocation granularity of the LARGE store's byte-addressed region. The
/// in-band [`ValueHeader`] (24 bytes) plus payload is always rounded up to
/// a multiple of this before being classed into a free list, the same way
/// [`crate::pool::Pool`] rounds allocations up to its block unit.
const LARGE_UNIT: u64 = 32;
/// Number of LARGE-store free-list size classes. Mirrors
/// [`crate::pool::Pool`]'s 32-way free list (spec.md §4.1), applied here to
/// byte-addressed capacity classes instead of block counts.
const NUM_LARGE_CLASSES: usize = 32;
const INVALID_LARGE_OFFSET: u64 = u64::MAX;

const VALUE_HEADER_SIZE: u64 = std::mem::size_of::<ValueHeader>() as u64;

#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
struct BlobHeader {
    magic: [u8; 32],
    version: u32,
    cells_header: u32,
    large_header: u32,
    _reserved0: u32,
    medium_headers: [u32; 4],
    next_value_id: u64,
    large_watermark: u64,
    large_freeze_head: u64,
    frozen_duration_ms: u64,
    medium_watermarks: [u64; 4],
    unfreeze_count_per_op: u32,
    _reserved1: u32,
    large_free_heads: [u64; NUM_LARGE_CLASSES],
}

const _: () = assert!(std::mem::size_of::<BlobHeader>() <= 4096);

/// Tunables for a blob store's LARGE-value recycler (spec.md §5's freeze
/// model, applied to the blob store's own byte-addressed allocator rather
/// than the pool's blocks). Mirrors [`crate::pool::PoolOptions`]'s shape.
pub struct BlobOptions {
    frozen_duration_ms: u64,
    unfreeze_count_per_op: u32,
}

impl Default for BlobOptions {
    fn default() -> Self {
        Self {
            frozen_duration_ms: Duration::from_secs(10 * 60).as_millis() as u64,
            unfreeze_count_per_op: 32,
        }
    }
}

impl BlobOptions {
    pub fn frozen_duration(&mut self, d: Duration) -> &mut Self {
        self.frozen_duration_ms = d.as_millis() as u64;
        self
    }

    pub fn unfreeze_count_per_operation(&mut self, n: u32) -> &mut Self {
        self.unfreeze_count_per_op = n;
        self
    }

    /// Create a new, empty blob store backed by `pool`.
    pub fn create(&self, pool: Pool) -> Result<BlobStore, Error> {
        let cells: PagedVector<BlobCell> = PagedVector::create(pool.clone(), BlobCell::unset())?;
        let medium8: PagedVector<[u8; 8]> = PagedVector::create(pool.clone(), [0u8; 8])?;
        let medium16: PagedVector<[u8; 16]> = PagedVector::create(pool.clone(), [0u8; 16])?;
        let medium32: PagedVector<[u8; 32]> = PagedVector::create(pool.clone(), [0u8; 32])?;
        let medium64: PagedVector<[u8; 64]> = PagedVector::create(pool.clone(), [0u8; 64])?;
        let large: PagedVector<u8> = PagedVector::create(pool.clone(), 0u8)?;

        let header_block = pool.create_block(std::mem::size_of::<BlobHeader>())?;
        let header = BlobHeader {
            magic: MAGIC,
            version: VERSION,
            cells_header: cells.header_block_id(),
            large_header: large.header_block_id(),
            _reserved0: 0,
            medium_headers: [
                medium8.header_block_id(),
                medium16.header_block_id(),
                medium32.header_block_id(),
                medium64.header_block_id(),
            ],
            next_value_id: 0,
            large_watermark: 0,
            large_freeze_head: INVALID_LARGE_OFFSET,
            frozen_duration_ms: self.frozen_duration_ms,
            medium_watermarks: [0; 4],
            unfreeze_count_per_op: self.unfreeze_count_per_op,
            _reserved1: 0,
            large_free_heads: [INVALID_LARGE_OFFSET; NUM_LARGE_CLASSES],
        };
        let header_ptr = pool.get_block_address(&header_block) as *mut BlobHeader;
        unsafe { header_ptr.write(header) };

        Ok(BlobStore {
            inner: Arc::new(Inner {
                pool,
                header_block_id: header_block.id(),
                cells,
                medium8,
                medium16,
                medium32,
                medium64,
                large,
                alloc: Mutex::new(()),
            }),
        })
    }
}

struct Inner {
    pool: Pool,
    header_block_id: u32,
    cells: PagedVector<BlobCell>,
    medium8: PagedVector<[u8; 8]>,
    medium16: PagedVector<[u8; 16]>,
    medium32: PagedVector<[u8; 32]>,
    medium64: PagedVector<[u8; 64]>,
    large: PagedVector<u8>,
    /// Serializes structural mutations: id allocation on `add`, and
    /// free/freeze-list bookkeeping when `unset` reclaims a replaced
    /// value's external storage. The cell swap itself stays lock-free
    /// (spec.md §5); only the shared-list bookkeeping needs this.
    alloc: Mutex<()>,
}

/// An ID -> bytes map (spec.md §3.4, §4.4). Cheap to clone; clones share
/// the same underlying store.
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<Inner>,
}

impl BlobStore {
    /// Create a new, empty blob store with default options.
    pub fn create(pool: Pool) -> Result<Self, Error> {
        BlobOptions::default().create(pool)
    }

    /// Reopen a blob store previously created on `pool`.
    pub fn open(pool: Pool, header_block_id: u32) -> Result<Self, Error> {
        let info = pool.get_block_info(header_block_id)?;
        let ptr = pool.get_block_address(&info) as *const BlobHeader;
        let header = unsafe { &*ptr };
        if header.magic != MAGIC {
            return Err(crate::error::FormatError::FileType.into());
        }
        if header.version != VERSION {
            return Err(crate::error::FormatError::Version.into());
        }
        let cells = PagedVector::open(pool.clone(), header.cells_header)?;
        let medium8 = PagedVector::open(pool.clone(), header.medium_headers[0])?;
        let medium16 = PagedVector::open(pool.clone(), header.medium_headers[1])?;
        let medium32 = PagedVector::open(pool.clone(), header.medium_headers[2])?;
        let medium64 = PagedVector::open(pool.clone(), header.medium_headers[3])?;
        let large = PagedVector::open(pool.clone(), header.large_header)?;

        Ok(BlobStore {
            inner: Arc::new(Inner {
                pool,
                header_block_id: info.id(),
                cells,
                medium8,
                medium16,
                medium32,
                medium64,
                large,
                alloc: Mutex::new(()),
            }),
        })
    }

    pub fn header_block_id(&self) -> u32 {
        self.inner.header_block_id
    }

    fn header(&self) -> &BlobHeader {
        let info = self.inner.pool.get_block_info(self.inner.header_block_id).expect("blob header block vanished");
        unsafe { &*(self.inner.pool.get_block_address(&info) as *const BlobHeader) }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut BlobHeader {
        let info = self.inner.pool.get_block_info(self.inner.header_block_id).expect("blob header block vanished");
        unsafe { &mut *(self.inner.pool.get_block_address(&info) as *mut BlobHeader) }
    }

    /// Free list a capacity of exactly `units` units is stored on: list `c`
    /// holds capacities in `[2^c, 2^(c+1))`, mirroring
    /// [`crate::pool::Pool`]'s own `store_class`/`size_class` split (see its
    /// doc comments) and the same bug it fixes: every capacity on list `c`
    /// is `>= 2^c`, which the old single `ceil(log2)` formula did not
    /// guarantee when used both to store and to pick a scan's start class.
    fn store_class(units: u64) -> usize {
        if units == 0 {
            0
        } else {
            (63 - units.leading_zeros()) as usize
        }
        .min(NUM_LARGE_CLASSES - 1)
    }

    /// Smallest free list an `alloc_large(units)` scan can start at and
    /// still be guaranteed every capacity on it is big enough: `ceil(log2
    /// units)`.
    fn size_class(units: u64) -> usize {
        if units <= 1 {
            0
        } else {
            (64 - (units - 1).leading_zeros() as usize).min(NUM_LARGE_CLASSES - 1)
        }
    }

    fn write_large_bytes(&self, offset: u64, bytes: &[u8]) -> Result<(), Error> {
        for (i, &b) in bytes.iter().enumerate() {
            *self.inner.large.get_mut(offset + i as u64)? = b;
        }
        Ok(())
    }

    fn read_large_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(len);
        for i in 0..len as u64 {
            out.push(self.inner.large.get(offset + i)?);
        }
        Ok(out)
    }

    fn write_value_header(&self, offset: u64, vh: &ValueHeader) -> Result<(), Error> {
        self.write_large_bytes(offset, bytemuck::bytes_of(vh))
    }

    fn read_value_header(&self, offset: u64) -> Result<ValueHeader, Error> {
        let bytes = self.read_large_bytes(offset, VALUE_HEADER_SIZE as usize)?;
        Ok(*bytemuck::from_bytes(&bytes))
    }

    /// Move up to `unfreeze_count_per_op` LARGE entries whose freeze stamp
    /// has matured past `frozen_duration` from the freeze list onto their
    /// capacity class's idle free list. Same shape as
    /// [`crate::pool::Pool`]'s own block unfreezer, run over the blob
    /// store's private byte-addressed region instead of pool blocks.
    fn unfreeze_large(&self) -> Result<(), Error> {
        let now = self.inner.pool.recycler().publish();
        let threshold = now.saturating_sub(self.header().frozen_duration_ms);
        let limit = self.header().unfreeze_count_per_op;

        let mut kept_head = INVALID_LARGE_OFFSET;
        let mut kept_tail = INVALID_LARGE_OFFSET;
        let mut cur = self.header().large_freeze_head;
        let mut moved = 0u32;

        while cur != INVALID_LARGE_OFFSET {
            let mut vh = self.read_value_header(cur)?;
            let next = vh.next_offset;
            if moved < limit && vh.state_extra <= threshold {
                let class = Self::store_class((vh.capacity as u64).div_ceil(LARGE_UNIT));
                vh.state = VALUE_IDLE;
                vh.next_offset = self.header().large_free_heads[class];
                self.write_value_header(cur, &vh)?;
                self.header_mut().large_free_heads[class] = cur;
                moved += 1;
            } else {
                vh.next_offset = INVALID_LARGE_OFFSET;
                self.write_value_header(cur, &vh)?;
                if kept_head == INVALID_LARGE_OFFSET {
                    kept_head = cur;
                } else {
                    let mut prev = self.read_value_header(kept_tail)?;
                    prev.next_offset = cur;
                    self.write_value_header(kept_tail, &prev)?;
                }
                kept_tail = cur;
            }
            cur = next;
        }
        self.header_mut().large_freeze_head = kept_head;
        Ok(())
    }

    fn pop_large_free(&self, class: usize) -> Result<Option<(u64, u32)>, Error> {
        let off = self.header().large_free_heads[class];
        if off == INVALID_LARGE_OFFSET {
            return Ok(None);
        }
        let vh = self.read_value_header(off)?;
        self.header_mut().large_free_heads[class] = vh.next_offset;
        Ok(Some((off, vh.capacity)))
    }

    fn alloc_large(&self, len: usize) -> Result<u64, Error> {
        let needed = VALUE_HEADER_SIZE + len as u64;
        let units = needed.div_ceil(LARGE_UNIT);
        let start_class = Self::size_class(units);

        self.unfreeze_large()?;
        let mut found = None;
        for class in start_class..NUM_LARGE_CLASSES {
            if let Some(hit) = self.pop_large_free(class)? {
                if (hit.1 as u64) < units * LARGE_UNIT {
                    bug!("LARGE free list held a capacity smaller than the size class it was scanned for");
                }
                found = Some(hit);
                break;
            }
        }
        let (offset, capacity) = if let Some(hit) = found {
            hit
        } else {
            let capacity = (units * LARGE_UNIT) as u32;
            let offset = self.header().large_watermark;
            self.header_mut().large_watermark += capacity as u64;
            (offset, capacity)
        };

        let vh = ValueHeader {
            state: VALUE_ACTIVE,
            flags: 0,
            _reserved: 0,
            capacity,
            prev_capacity: 0,
            next_offset: 0,
            state_extra: 0,
        };
        self.write_value_header(offset, &vh)?;
        Ok(offset)
    }

    fn free_large(&self, offset: u64) -> Result<(), Error> {
        let mut vh = self.read_value_header(offset)?;
        if vh.state != VALUE_ACTIVE {
            bug!("freed a LARGE blob value that was not active");
        }
        let now = self.inner.pool.recycler().publish();
        vh.state = VALUE_FROZEN;
        vh.prev_capacity = vh.capacity;
        vh.state_extra = now;
        vh.next_offset = self.header().large_freeze_head;
        self.write_value_header(offset, &vh)?;
        self.header_mut().large_freeze_head = offset;
        Ok(())
    }

    fn store_cell_locked(&self, cell: BlobCell) -> Result<u64, Error> {
        let id = self.header().next_value_id;
        self.header_mut().next_value_id += 1;
        *self.inner.cells.get_mut(id)? = cell;
        Ok(id)
    }

    /// Store `bytes` under a freshly minted id, choosing the smallest
    /// class that fits (spec.md §4.4).
    pub fn add(&self, bytes: &[u8]) -> Result<u64, Error> {
        let _guard = self.inner.alloc.lock().unwrap();

        let cell = if bytes.len() <= cell::SMALL_MAX_LEN {
            BlobCell::small(bytes)
        } else if bytes.len() <= MEDIUM_MAX_LEN {
            let store = MEDIUM_SLOT_SIZES.iter().position(|&sz| bytes.len() <= sz).unwrap();
            let slot = self.header().medium_watermarks[store];
            self.header_mut().medium_watermarks[store] += 1;
            match store {
                0 => self.inner.medium8.get_mut(slot)?[..bytes.len()].copy_from_slice(bytes),
                1 => self.inner.medium16.get_mut(slot)?[..bytes.len()].copy_from_slice(bytes),
                2 => self.inner.medium32.get_mut(slot)?[..bytes.len()].copy_from_slice(bytes),
                3 => self.inner.medium64.get_mut(slot)?[..bytes.len()].copy_from_slice(bytes),
                _ => unreachable!(),
            }
            BlobCell::medium(store as u8, bytes.len() as u8, slot)
        } else if bytes.len() <= LARGE_MAX_LEN {
            let offset = self.alloc_large(bytes.len())?;
            self.write_large_bytes(offset + VALUE_HEADER_SIZE, bytes)?;
            BlobCell::large(bytes.len() as u16, offset)
        } else {
            let block = self.inner.pool.create_block(8 + bytes.len())?;
            let ptr = self.inner.pool.get_block_address(&block);
            unsafe {
                (ptr as *mut u64).write(bytes.len() as u64);
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(8), bytes.len());
            }
            BlobCell::huge(block.id())
        };

        self.store_cell_locked(cell)
    }

    /// Read the bytes stored at `value_id`. The returned copy is frozen at
    /// the moment of the call; a concurrent `unset` may immediately
    /// invalidate the live cell (spec.md §4.4).
    pub fn get(&self, value_id: u64) -> Result<Vec<u8>, Error> {
        let cell = self.inner.cells.get(value_id)?;
        match cell.tag() {
            TAG_SMALL => Ok(cell.small_bytes()),
            TAG_MEDIUM => {
                let len = cell.medium_len() as usize;
                let slot = cell.medium_slot();
                let bytes = match cell.medium_store() {
                    0 => self.inner.medium8.get(slot)?.to_vec(),
                    1 => self.inner.medium16.get(slot)?.to_vec(),
                    2 => self.inner.medium32.get(slot)?.to_vec(),
                    3 => self.inner.medium64.get(slot)?.to_vec(),
                    _ => bug!("medium blob cell named a store id outside 0..4"),
                };
                Ok(bytes[..len].to_vec())
            }
            TAG_LARGE => {
                let offset = cell.large_offset();
                self.read_large_bytes(offset + VALUE_HEADER_SIZE, cell.large_len() as usize)
            }
            TAG_HUGE => {
                let info = self.inner.pool.get_block_info(cell.huge_block_id())?;
                let ptr = self.inner.pool.get_block_address(&info);
                let len = unsafe { (ptr as *const u64).read() } as usize;
                let mut out = vec![0u8; len];
                unsafe { std::ptr::copy_nonoverlapping(ptr.add(8), out.as_mut_ptr(), len) };
                Ok(out)
            }
            _ => bug!("blob cell held a tag outside {SMALL,MEDIUM,LARGE,HUGE}"),
        }
    }

    fn free_external(&self, cell: BlobCell) -> Result<(), Error> {
        match cell.tag() {
            TAG_SMALL | TAG_MEDIUM => Ok(()),
            TAG_LARGE => self.free_large(cell.large_offset()),
            TAG_HUGE => self.inner.pool.free_block(cell.huge_block_id()),
            _ => bug!("blob cell held a tag outside {SMALL,MEDIUM,LARGE,HUGE}"),
        }
    }

    /// Replace `value_id`'s cell with the unset (SMALL, length 0) cell via
    /// CAS, then free whatever external storage the old cell pointed at
    /// (spec.md §3.4(b), §5).
    pub fn unset(&self, value_id: u64) -> Result<(), Error> {
        let cell_ptr = self.inner.cells.get_mut(value_id)? as *mut BlobCell as *const AtomicU64;
        let atomic = unsafe { &*cell_ptr };

        let mut freed = None;
        cas_update(
            atomic,
            |_old| Ok(BlobCell::unset().to_raw()),
            |old| freed = Some(BlobCell::from_raw(old)),
            |_new| {},
        )?;

        if let Some(old_cell) = freed {
            let _guard = self.inner.alloc.lock().unwrap();
            self.free_external(old_cell)?;
        }
        Ok(())
    }

    /// Tear the whole store down: free every HUGE value's dedicated block,
    /// then destroy every sub-store and the header block itself (spec.md
    /// §9 — mandated in full, unlike the incomplete source this is
    /// grounded on).
    pub fn unlink(self) -> Result<(), Error> {
        let inner = Arc::try_unwrap(self.inner).map_err(|_| Error::logic("cannot unlink a blob store with other live handles"))?;
        let next_id = inner.next_value_id()?;
        for id in 0..next_id {
            let cell = inner.cells.get(id)?;
            if cell.tag() == TAG_HUGE {
                inner.pool.free_block(cell.huge_block_id())?;
            }
        }
        inner.cells.destroy()?;
        inner.medium8.destroy()?;
        inner.medium16.destroy()?;
        inner.medium32.destroy()?;
        inner.medium64.destroy()?;
        inner.large.destroy()?;
        inner.pool.free_block(inner.header_block_id)?;
        Ok(())
    }
}

impl Inner {
    fn next_value_id(&self) -> Result<u64, Error> {
        let info = self.pool.get_block_info(self.header_block_id)?;
        let header = unsafe { &*(self.pool.get_block_address(&info) as *const BlobHeader) };
        Ok(header.next_value_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolOptions;

    #[test]
    fn small_blob_roundtrips() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let store = BlobStore::create(pool).unwrap();
        let id = store.add(b"hi").unwrap();
        assert_eq!(store.get(id).unwrap(), b"hi");
    }

    #[test]
    fn medium_blob_roundtrips_and_unset_clears_it() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let store = BlobStore::create(pool).unwrap();
        let payload = vec![7u8; 30];
        let id = store.add(&payload).unwrap();
        assert_eq!(store.get(id).unwrap(), payload);
        store.unset(id).unwrap();
        assert_eq!(store.get(id).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn large_blob_roundtrips_and_reuses_freed_space() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let store = BlobStore::create(pool).unwrap();
        let payload = vec![9u8; 5000];
        let id1 = store.add(&payload).unwrap();
        assert_eq!(store.get(id1).unwrap(), payload);
        store.unset(id1).unwrap();

        // A second value of the same size should reuse the freed region
        // once it's past its freeze duration.
        let mut opts = BlobOptions::default();
        opts.frozen_duration(Duration::from_millis(0));
        let pool2 = PoolOptions::default().open_anonymous().unwrap();
        let store2 = opts.create(pool2).unwrap();
        let first = store2.add(&payload).unwrap();
        store2.unset(first).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let second = store2.add(&payload).unwrap();
        assert_eq!(store2.get(second).unwrap(), payload);
    }

    #[test]
    fn freeing_a_small_large_value_does_not_corrupt_a_later_bigger_one() {
        // `small` needs a 160-byte capacity (5 units, store_class 2);
        // `big` needs a 256-byte capacity (8 units, start scan class 3).
        // Before the store_class/size_class split, both landed in the same
        // free-list bucket and `big`'s allocation could reuse `small`'s
        // freed, too-small slot, overwriting whatever sat right after it.
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let mut opts = BlobOptions::default();
        opts.frozen_duration(Duration::from_millis(0));
        let store = opts.create(pool).unwrap();

        let small = vec![0x11u8; 136];
        let neighbor = vec![0x22u8; 40];
        let small_id = store.add(&small).unwrap();
        let neighbor_id = store.add(&neighbor).unwrap();

        store.unset(small_id).unwrap();
        std::thread::sleep(Duration::from_millis(2));

        let big = vec![0x33u8; 232];
        let big_id = store.add(&big).unwrap();

        assert_eq!(store.get(big_id).unwrap(), big);
        assert_eq!(store.get(neighbor_id).unwrap(), neighbor);
    }

    #[test]
    fn huge_blob_roundtrips() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let store = BlobStore::create(pool).unwrap();
        let payload = vec![3u8; 200_000];
        let id = store.add(&payload).unwrap();
        assert_eq!(store.get(id).unwrap(), payload);
        store.unset(id).unwrap();
    }

    #[test]
    fn reopen_preserves_contents() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let store = BlobStore::create(pool.clone()).unwrap();
        let id = store.add(b"durable").unwrap();
        let header_id = store.header_block_id();
        drop(store);
        let reopened = BlobStore::open(pool, header_id).unwrap();
        assert_eq!(reopened.get(id).unwrap(), b"durable");
    }

    #[test]
    fn unlink_frees_a_huge_blocks_dedicated_storage() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let store = BlobStore::create(pool.clone()).unwrap();
        let payload = vec![1u8; 100_000];
        let id = store.add(&payload).unwrap();
        let block_info = {
            let cell = store.inner.cells.get(id).unwrap();
            pool.get_block_info(cell.huge_block_id()).unwrap()
        };
        store.unlink().unwrap();
        assert_ne!(pool.get_block_info(block_info.id()).unwrap().status(), crate::pool::BlockStatus::Active);
    }
}
