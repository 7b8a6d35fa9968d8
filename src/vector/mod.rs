//! L2 Paged Vector (spec.md §3.2, §4.2): an O(1)-addressable sparse
//! persistent array built on top of the block pool via a two-table page
//! index.
//!
//! Unmaterialized positions read as a caller-supplied default value; a page
//! is only allocated the first time one of its elements is written through
//! [`PagedVector::get_mut`].

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Mutex;

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, FormatError};
use crate::pool::{BlockInfo, Pool};

const NO_BLOCK: u32 = crate::pool::INVALID_BLOCK_ID;

const MAGIC: [u8; 16] = *b"grnxx::PVector\0\0";
const VERSION: u32 = 1;
const MAX_DEFAULT_BYTES: usize = 64;

#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
struct VectorHeader {
    magic: [u8; 16],
    version: u32,
    value_size: u32,
    ps: u32,
    ts: u32,
    sts: u32,
    first_table_block_id: u32,
    secondary_table_block_id: u32,
    default_len: u32,
    default_bytes: [u8; MAX_DEFAULT_BYTES],
}

const _: () = assert!(std::mem::size_of::<VectorHeader>() <= 4096);

/// Caches block id -> resolved base address, so repeated reads through an
/// already-materialized page don't re-take the pool's lock just to
/// re-derive a pointer that can't move (spec.md §5: "intra-process cache ...
/// published for other threads to read without re-resolving"). Entries are
/// never invalidated: a block id, once resolved, keeps the same address for
/// the pool's lifetime.
struct PageCache {
    entries: Mutex<HashMap<u32, usize>>,
}

impl PageCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, pool: &Pool, info: &BlockInfo) -> *mut u8 {
        let mut guard = self.entries.lock().unwrap();
        if let Some(&addr) = guard.get(&info.id()) {
            return addr as *mut u8;
        }
        let addr = pool.get_block_address(info);
        guard.insert(info.id(), addr as usize);
        addr
    }

    fn drop_block(&self, id: u32) {
        self.entries.lock().unwrap().remove(&id);
    }
}

/// Where a logical id resolves to, per spec.md §4.2's resolution protocol.
enum Location {
    /// `page_id < TS`: reachable in one hop off the first table.
    First { page_idx: usize, slot: usize },
    /// `page_id >= TS`: reachable via the secondary table's `page_id / TS`
    /// sub-table, slot `page_id % TS` within it.
    Secondary { sub_idx: usize, slot_idx: usize, slot: usize },
}

/// A sparse, O(1)-addressable persistent array of `T` (spec.md §3.2/§4.2).
///
/// `PS`, `TS`, `STS` are compile-time page/table shapes, each expected to be
/// a power of two; total capacity is `TS · PS` reachable through the first
/// table, extended to `STS · TS · PS` through the secondary table. Indices
/// below `TS · PS` resolve in one fewer hop (header → first table → page)
/// than indices above it (header → secondary table → sub-table → page);
/// spec.md §4.2 step 2/3 calls this out explicitly as a fast path, not just
/// an implementation detail, so it's kept as a real branch here rather than
/// folded into a uniform 3-level walk. Defaults (4096 each) match the
/// teacher's original single fixed page size so every pre-existing caller
/// that doesn't care about the shape keeps compiling unchanged.
pub struct PagedVector<T, const PS: usize = 4096, const TS: usize = 4096, const STS: usize = 4096> {
    pool: Pool,
    header_block_id: u32,
    first_table_block_id: Mutex<u32>,
    secondary_table_block_id: Mutex<u32>,
    default: T,
    cache: PageCache,
    _marker: PhantomData<T>,
}

impl<T: Pod + Zeroable, const PS: usize, const TS: usize, const STS: usize> PagedVector<T, PS, TS, STS> {
    /// Enforced once per method entry rather than as a top-level `const _: ()`
    /// so the generic parameters are in scope; panics at the first call if a
    /// caller ever instantiates a non-power-of-two shape.
    fn check_shape() {
        assert!(PS.is_power_of_two() && TS.is_power_of_two() && STS.is_power_of_two(), "PagedVector PS/TS/STS must be powers of two");
    }

    /// Largest id this vector can address: every index the secondary table
    /// can reach, `STS · TS · PS - 1` (a superset of what the first table
    /// alone reaches).
    pub fn max_id() -> u64 {
        (STS as u64) * (TS as u64) * (PS as u64) - 1
    }

    fn locate(id: u64) -> Location {
        let page_id = id / PS as u64;
        let slot = (id % PS as u64) as usize;
        if page_id < TS as u64 {
            Location::First {
                page_idx: page_id as usize,
                slot,
            }
        } else {
            let sub_idx = (page_id / TS as u64) as usize;
            let slot_idx = (page_id % TS as u64) as usize;
            Location::Secondary { sub_idx, slot_idx, slot }
        }
    }

    /// The block id of this vector's header, to be handed to [`Self::open`]
    /// by whatever owns this vector (a pool may host several vectors side
    /// by side, each with its own header block).
    pub fn header_block_id(&self) -> u32 {
        self.header_block_id
    }

    /// Create a new vector, allocating a fresh header block from `pool`.
    /// `pool` may already have other blocks (and other vectors) on it.
    pub fn create(pool: Pool, default: T) -> Result<Self, Error> {
        Self::check_shape();
        if std::mem::size_of::<T>() > MAX_DEFAULT_BYTES {
            return Err(Error::logic("paged vector element type is larger than the supported default-value buffer"));
        }
        let header_block = pool.create_block(std::mem::size_of::<VectorHeader>())?;
        let header_ptr = pool.get_block_address(&header_block) as *mut VectorHeader;

        let mut default_bytes = [0u8; MAX_DEFAULT_BYTES];
        let src = bytemuck::bytes_of(&default);
        default_bytes[..src.len()].copy_from_slice(src);

        let header = VectorHeader {
            magic: MAGIC,
            version: VERSION,
            value_size: std::mem::size_of::<T>() as u32,
            ps: PS as u32,
            ts: TS as u32,
            sts: STS as u32,
            first_table_block_id: NO_BLOCK,
            secondary_table_block_id: NO_BLOCK,
            default_len: src.len() as u32,
            default_bytes,
        };
        unsafe { header_ptr.write(header) };

        Ok(Self {
            pool,
            header_block_id: header_block.id(),
            first_table_block_id: Mutex::new(NO_BLOCK),
            secondary_table_block_id: Mutex::new(NO_BLOCK),
            default,
            cache: PageCache::new(),
            _marker: PhantomData,
        })
    }

    /// Reopen a vector previously created on `pool` at `header_block_id`
    /// (spec.md §4.2: `open(pool, header_block_id)`).
    pub fn open(pool: Pool, header_block_id: u32) -> Result<Self, Error> {
        Self::check_shape();
        let header_info = pool.get_block_info(header_block_id)?;
        let header_ptr = pool.get_block_address(&header_info) as *const VectorHeader;
        let header = unsafe { &*header_ptr };
        if header.magic != MAGIC {
            return Err(FormatError::FileType.into());
        }
        if header.version != VERSION {
            return Err(FormatError::Version.into());
        }
        if header.value_size as usize != std::mem::size_of::<T>() {
            return Err(FormatError::ValueSizeMismatch.into());
        }
        if header.ps as usize != PS || header.ts as usize != TS || header.sts as usize != STS {
            return Err(FormatError::PageShapeMismatch.into());
        }
        let default_len = header.default_len as usize;
        let mut bytes = [0u8; MAX_DEFAULT_BYTES];
        bytes[..default_len].copy_from_slice(&header.default_bytes[..default_len]);
        let default: T = *bytemuck::from_bytes(&bytes[..std::mem::size_of::<T>()]);

        Ok(Self {
            pool,
            header_block_id: header_info.id(),
            first_table_block_id: Mutex::new(header.first_table_block_id),
            secondary_table_block_id: Mutex::new(header.secondary_table_block_id),
            default,
            cache: PageCache::new(),
            _marker: PhantomData,
        })
    }

    fn header_ptr(&self) -> *mut VectorHeader {
        let info = self.pool.get_block_info(self.header_block_id).expect("vector header block vanished");
        self.pool.get_block_address(&info) as *mut VectorHeader
    }

    /// Resolve a table's (first table, secondary table, or a secondary
    /// sub-table) base pointer, each a raw array of `u32` block ids.
    fn table_ptr(&self, block_id: u32) -> *mut u32 {
        let info = self.pool.get_block_info(block_id).expect("paged vector table block vanished");
        self.cache.resolve(&self.pool, &info) as *mut u32
    }

    fn leaf_page(&self, block_id: u32) -> *mut T {
        let info = self.pool.get_block_info(block_id).expect("leaf block vanished");
        self.cache.resolve(&self.pool, &info) as *mut T
    }

    /// Allocate a `len`-entry `u32` block-id table, filled with
    /// [`NO_BLOCK`].
    fn alloc_table(&self, len: usize) -> Result<u32, Error> {
        let block = self.pool.create_block(len * std::mem::size_of::<u32>())?;
        let ptr = self.pool.get_block_address(&block) as *mut u32;
        unsafe {
            for i in 0..len {
                ptr.add(i).write(NO_BLOCK);
            }
        }
        Ok(block.id())
    }

    fn alloc_leaf_page(&self) -> Result<u32, Error> {
        let block = self.pool.create_block(std::mem::size_of::<T>() * PS)?;
        let ptr = self.pool.get_block_address(&block) as *mut T;
        unsafe {
            for i in 0..PS {
                ptr.add(i).write(self.default);
            }
        }
        Ok(block.id())
    }

    /// Read the value at `id`, or the vector's default if that position has
    /// never been written.
    pub fn get(&self, id: u64) -> Result<T, Error> {
        if id > Self::max_id() {
            return Err(Error::logic("paged vector id out of range"));
        }
        match Self::locate(id) {
            Location::First { page_idx, slot } => {
                let first_id = *self.first_table_block_id.lock().unwrap();
                if first_id == NO_BLOCK {
                    return Ok(self.default);
                }
                let leaf_id = unsafe { *self.table_ptr(first_id).add(page_idx) };
                if leaf_id == NO_BLOCK {
                    return Ok(self.default);
                }
                Ok(unsafe { *self.leaf_page(leaf_id).add(slot) })
            }
            Location::Secondary { sub_idx, slot_idx, slot } => {
                let secondary_id = *self.secondary_table_block_id.lock().unwrap();
                if secondary_id == NO_BLOCK {
                    return Ok(self.default);
                }
                let sub_table_id = unsafe { *self.table_ptr(secondary_id).add(sub_idx) };
                if sub_table_id == NO_BLOCK {
                    return Ok(self.default);
                }
                let leaf_id = unsafe { *self.table_ptr(sub_table_id).add(slot_idx) };
                if leaf_id == NO_BLOCK {
                    return Ok(self.default);
                }
                Ok(unsafe { *self.leaf_page(leaf_id).add(slot) })
            }
        }
    }

    /// Return a mutable reference to the slot at `id`, materializing any
    /// missing first/secondary/sub tables and the leaf page along the way
    /// (filled with the vector's default value).
    pub fn get_mut(&self, id: u64) -> Result<&mut T, Error> {
        if id > Self::max_id() {
            return Err(Error::logic("paged vector id out of range"));
        }
        let leaf_id = match Self::locate(id) {
            Location::First { page_idx, slot: _ } => {
                let mut guard = self.first_table_block_id.lock().unwrap();
                if *guard == NO_BLOCK {
                    let new_table = self.alloc_table(TS)?;
                    *guard = new_table;
                    let header = unsafe { &mut *self.header_ptr() };
                    header.first_table_block_id = new_table;
                }
                let first_id = *guard;
                drop(guard);

                let table = self.table_ptr(first_id);
                let existing = unsafe { *table.add(page_idx) };
                if existing == NO_BLOCK {
                    let leaf = self.alloc_leaf_page()?;
                    unsafe { table.add(page_idx).write(leaf) };
                    leaf
                } else {
                    existing
                }
            }
            Location::Secondary { sub_idx, slot_idx, slot: _ } => {
                let mut guard = self.secondary_table_block_id.lock().unwrap();
                if *guard == NO_BLOCK {
                    let new_table = self.alloc_table(STS)?;
                    *guard = new_table;
                    let header = unsafe { &mut *self.header_ptr() };
                    header.secondary_table_block_id = new_table;
                }
                let secondary_id = *guard;
                drop(guard);

                let secondary = self.table_ptr(secondary_id);
                let existing_sub = unsafe { *secondary.add(sub_idx) };
                let sub_table_id = if existing_sub == NO_BLOCK {
                    let sub = self.alloc_table(TS)?;
                    unsafe { secondary.add(sub_idx).write(sub) };
                    sub
                } else {
                    existing_sub
                };

                let sub_table = self.table_ptr(sub_table_id);
                let existing_leaf = unsafe { *sub_table.add(slot_idx) };
                if existing_leaf == NO_BLOCK {
                    let leaf = self.alloc_leaf_page()?;
                    unsafe { sub_table.add(slot_idx).write(leaf) };
                    leaf
                } else {
                    existing_leaf
                }
            }
        };

        // The slot within a leaf page is `id % PS` regardless of which
        // table path got us there.
        let slot = (id % PS as u64) as usize;
        let leaf = self.leaf_page(leaf_id);
        Ok(unsafe { &mut *leaf.add(slot) })
    }

    /// Free every block this vector has ever materialized — every leaf
    /// page, every first/secondary/sub table, and the header block itself.
    /// Unlike [`Self::unlink`], which only forgets one element's page, this
    /// tears the whole vector down; callers (the blob store's own `unlink`,
    /// spec.md §9) use it to fully release a sub-store they own rather than
    /// leaking its pages.
    pub fn destroy(self) -> Result<(), Error> {
        let first_id = *self.first_table_block_id.lock().unwrap();
        if first_id != NO_BLOCK {
            let table = self.table_ptr(first_id);
            for i in 0..TS {
                let leaf_id = unsafe { *table.add(i) };
                if leaf_id != NO_BLOCK {
                    self.pool.free_block(leaf_id)?;
                }
            }
            self.pool.free_block(first_id)?;
        }

        let secondary_id = *self.secondary_table_block_id.lock().unwrap();
        if secondary_id != NO_BLOCK {
            let secondary = self.table_ptr(secondary_id);
            for i in 0..STS {
                let sub_table_id = unsafe { *secondary.add(i) };
                if sub_table_id == NO_BLOCK {
                    continue;
                }
                let sub_table = self.table_ptr(sub_table_id);
                for j in 0..TS {
                    let leaf_id = unsafe { *sub_table.add(j) };
                    if leaf_id != NO_BLOCK {
                        self.pool.free_block(leaf_id)?;
                    }
                }
                self.pool.free_block(sub_table_id)?;
            }
            self.pool.free_block(secondary_id)?;
        }

        self.pool.free_block(self.header_block_id)?;
        Ok(())
    }

    /// Free the leaf page containing `id`, reverting every element in that
    /// page back to the default value (spec.md §4.2 `unlink`). A no-op if
    /// the page was never materialized.
    pub fn unlink(&self, id: u64) -> Result<(), Error> {
        if id > Self::max_id() {
            return Err(Error::logic("paged vector id out of range"));
        }
        match Self::locate(id) {
            Location::First { page_idx, slot: _ } => {
                let first_id = *self.first_table_block_id.lock().unwrap();
                if first_id == NO_BLOCK {
                    return Ok(());
                }
                let table = self.table_ptr(first_id);
                let leaf_id = unsafe { *table.add(page_idx) };
                if leaf_id == NO_BLOCK {
                    return Ok(());
                }
                unsafe { table.add(page_idx).write(NO_BLOCK) };
                self.cache.drop_block(leaf_id);
                self.pool.free_block(leaf_id)?;
            }
            Location::Secondary { sub_idx, slot_idx, slot: _ } => {
                let secondary_id = *self.secondary_table_block_id.lock().unwrap();
                if secondary_id == NO_BLOCK {
                    return Ok(());
                }
                let secondary = self.table_ptr(secondary_id);
                let sub_table_id = unsafe { *secondary.add(sub_idx) };
                if sub_table_id == NO_BLOCK {
                    return Ok(());
                }
                let sub_table = self.table_ptr(sub_table_id);
                let leaf_id = unsafe { *sub_table.add(slot_idx) };
                if leaf_id == NO_BLOCK {
                    return Ok(());
                }
                unsafe { sub_table.add(slot_idx).write(NO_BLOCK) };
                self.cache.drop_block(leaf_id);
                self.pool.free_block(leaf_id)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolOptions;

    #[test]
    fn default_fill_and_sparse_materialization() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let vec: PagedVector<u64> = PagedVector::create(pool, 0xAAAA).unwrap();

        assert_eq!(vec.get(12345).unwrap(), 0xAAAA);
        *vec.get_mut(12345).unwrap() = 7;
        assert_eq!(vec.get(12345).unwrap(), 7);
        // Neighboring, never-written slot in the same leaf stays default.
        assert_eq!(vec.get(12346).unwrap(), 0xAAAA);
    }

    #[test]
    fn unlink_resets_to_default() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let vec: PagedVector<u32> = PagedVector::create(pool, 0).unwrap();
        *vec.get_mut(99).unwrap() = 42;
        vec.unlink(99).unwrap();
        assert_eq!(vec.get(99).unwrap(), 0);
    }

    #[test]
    fn destroy_frees_every_materialized_page() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let vec: PagedVector<u64> = PagedVector::create(pool.clone(), 0).unwrap();
        *vec.get_mut(1).unwrap() = 1;
        *vec.get_mut(1 << 30).unwrap() = 2;
        let header_id = vec.header_block_id();
        vec.destroy().unwrap();
        assert!(pool.get_block_info(header_id).is_err() || pool.get_block_info(header_id).unwrap().status() != crate::pool::BlockStatus::Active);
    }

    #[test]
    fn reopen_preserves_contents() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let vec: PagedVector<u16> = PagedVector::create(pool.clone(), 0).unwrap();
        let header_id = vec.header_block_id();
        *vec.get_mut(5).unwrap() = 99;
        drop(vec);
        let reopened: PagedVector<u16> = PagedVector::open(pool, header_id).unwrap();
        assert_eq!(reopened.get(5).unwrap(), 99);
    }

    /// Exercises the secondary-table path directly with a small shape so
    /// the test doesn't need to touch gigabytes of address space to cross
    /// the first table's `TS` boundary.
    #[test]
    fn secondary_table_path_materializes_and_reads_back() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let vec: PagedVector<u32, 4, 4, 4> = PagedVector::create(pool, 0).unwrap();

        // page_id = 20 / 4 = 5, which is >= TS (4), so this must take the
        // secondary-table path (sub_idx = 5/4 = 1, slot_idx = 5%4 = 1).
        assert_eq!(vec.get(20).unwrap(), 0);
        *vec.get_mut(20).unwrap() = 123;
        assert_eq!(vec.get(20).unwrap(), 123);
        // A first-table-path id stays independent of the secondary table.
        assert_eq!(vec.get(1).unwrap(), 0);
    }

    #[test]
    fn reopen_rejects_mismatched_page_shape() {
        let pool = PoolOptions::default().open_anonymous().unwrap();
        let vec: PagedVector<u32, 4, 4, 4> = PagedVector::create(pool.clone(), 0).unwrap();
        let header_id = vec.header_block_id();
        drop(vec);
        let reopened = PagedVector::<u32, 8, 4, 4>::open(pool, header_id);
        assert!(reopened.is_err());
    }
}
