//! The L0 mapping provider: produces addressable, optionally file-backed
//! regions and exposes advisory `sync`. Out of scope as a *design* subject
//! (spec.md §1 excludes "the OS-level file/mapping wrapper"), but the pool
//! needs a concrete collaborator to run against, so this module adapts the
//! teacher crate's `storage::StorageInner` to the pool's chunk model: each
//! pool chunk gets its own fixed-size `memmap2` mapping, appended to a
//! growing list, rather than one map that's repeatedly `remap`-extended.
//! That's a deliberate simplification over the teacher (see DESIGN.md):
//! because a chunk's size never changes after creation, there is nothing to
//! remap in place — growth always means mapping one more chunk.
//!
//! `ChunkBacking` is a trait rather than one struct with an internal
//! file-or-anonymous enum, with [`FileBacking`] and [`AnonymousBacking`] as
//! its two concrete providers, so the pool is exercisable against either
//! without a runtime tag check on every call.

use std::fs::File;

use memmap2::{MmapMut, MmapOptions, MmapRaw};

use crate::error::{Error, IoError};

/// One backing store for a pool: owns every chunk mapping, always exactly
/// `chunk_size` bytes each.
///
/// # Safety contract
///
/// Base pointers handed out by [`ChunkBacking::chunk_base`] are valid for as
/// long as the `ChunkBacking` is alive. A chunk, once created, is never
/// unmapped or moved — only new chunks are appended — so pointers remain
/// stable across calls to `create_chunk`.
pub(crate) trait ChunkBacking: Send {
    fn chunk_size(&self) -> usize;

    fn num_chunks(&self) -> u16;

    /// Create and map one new chunk, returning its id. Guarded by the
    /// pool's file mutex at the call site (spec.md §5: "a file mutex
    /// protecting chunk-file creation").
    fn create_chunk(&mut self) -> Result<u16, Error>;

    /// Base pointer for an already-created chunk.
    ///
    /// # Safety
    /// `chunk_id` must be `< self.num_chunks()`.
    unsafe fn chunk_base(&self, chunk_id: u16) -> *mut u8;

    /// Request a write-back of part of a chunk. Purely advisory; a no-op
    /// for anonymous mappings.
    fn sync(&self, chunk_id: u16, offset: usize, len: usize) -> Result<(), Error>;

    fn sync_all(&self) -> Result<(), Error>;

    /// Punch a hole in a chunk, releasing its backing pages to the OS (file
    /// hole on file-backed storage, `MADV_FREE`/`MADV_REMOVE` otherwise).
    /// Advisory and irreversible for the bytes involved: callers must
    /// ensure no reader still holds a pointer into the range (the freeze
    /// scheme in `crate::sync` is what makes that true).
    fn hole_punch(&self, chunk_id: u16, offset: usize, len: usize) -> Result<(), Error>;
}

/// A single growing file, one `memmap2` mapping per chunk.
pub(crate) struct FileBacking {
    file: File,
    chunk_size: usize,
    chunks: Vec<MmapRaw>,
}

impl FileBacking {
    /// Open (or create) a file-backed provider. `existing_chunks` is the
    /// number of whole chunks already present in the file; any partial
    /// trailing chunk is an error the caller should have already rejected
    /// as a `FormatError::FileSize`.
    pub fn open(file: File, chunk_size: usize, existing_chunks: u16) -> Result<Self, Error> {
        let mut chunks = Vec::with_capacity(existing_chunks as usize);
        for i in 0..existing_chunks {
            let map = MmapOptions::new()
                .offset(i as u64 * chunk_size as u64)
                .len(chunk_size)
                .map_raw(&file)
                .map_err(|e| IoError::Map {
                    requested: chunk_size,
                    source: e,
                })?;
            chunks.push(map);
        }
        Ok(Self { file, chunk_size, chunks })
    }
}

impl ChunkBacking for FileBacking {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn num_chunks(&self) -> u16 {
        self.chunks.len() as u16
    }

    fn create_chunk(&mut self) -> Result<u16, Error> {
        let id = self.chunks.len();
        if id >= u16::MAX as usize {
            return Err(Error::resource_exhausted("pool has reached the maximum chunk count"));
        }
        let new_len = (id as u64 + 1) * self.chunk_size as u64;
        self.file.set_len(new_len).map_err(|e| IoError::Resize {
            size: id * self.chunk_size,
            requested: new_len as usize,
            source: e,
        })?;
        self.file.sync_all().map_err(IoError::Sync)?;
        let map = MmapOptions::new()
            .offset(id as u64 * self.chunk_size as u64)
            .len(self.chunk_size)
            .map_raw(&self.file)
            .map_err(|e| IoError::Map {
                requested: self.chunk_size,
                source: e,
            })?;
        self.chunks.push(map);
        Ok(id as u16)
    }

    unsafe fn chunk_base(&self, chunk_id: u16) -> *mut u8 {
        self.chunks[chunk_id as usize].as_mut_ptr()
    }

    fn sync(&self, chunk_id: u16, offset: usize, len: usize) -> Result<(), Error> {
        self.chunks[chunk_id as usize]
            .flush_range(offset, len)
            .map_err(IoError::Sync)?;
        Ok(())
    }

    fn sync_all(&self) -> Result<(), Error> {
        for chunk in &self.chunks {
            chunk.flush().map_err(IoError::Sync)?;
        }
        Ok(())
    }

    fn hole_punch(&self, chunk_id: u16, offset: usize, len: usize) -> Result<(), Error> {
        let map = &self.chunks[chunk_id as usize];
        #[cfg(not(windows))]
        unsafe {
            map.unchecked_advise_range(memmap2::UncheckedAdvice::Remove, offset, len)
                .map_err(IoError::HolePunch)?;
        }
        Ok(())
    }
}

/// Anonymous memory, discarded on process exit. Nothing is persisted, so
/// `sync`/`sync_all` are no-ops.
pub(crate) struct AnonymousBacking {
    chunk_size: usize,
    chunks: Vec<MmapRaw>,
}

impl AnonymousBacking {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            chunks: Vec::new(),
        }
    }
}

impl ChunkBacking for AnonymousBacking {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn num_chunks(&self) -> u16 {
        self.chunks.len() as u16
    }

    fn create_chunk(&mut self) -> Result<u16, Error> {
        let id = self.chunks.len();
        if id >= u16::MAX as usize {
            return Err(Error::resource_exhausted("pool has reached the maximum chunk count"));
        }
        let map = MmapRaw::from(MmapMut::map_anon(self.chunk_size).map_err(|e| IoError::Map {
            requested: self.chunk_size,
            source: e,
        })?);
        self.chunks.push(map);
        Ok(id as u16)
    }

    unsafe fn chunk_base(&self, chunk_id: u16) -> *mut u8 {
        self.chunks[chunk_id as usize].as_mut_ptr()
    }

    fn sync(&self, _chunk_id: u16, _offset: usize, _len: usize) -> Result<(), Error> {
        Ok(())
    }

    fn sync_all(&self) -> Result<(), Error> {
        Ok(())
    }

    fn hole_punch(&self, chunk_id: u16, offset: usize, len: usize) -> Result<(), Error> {
        let map = &self.chunks[chunk_id as usize];
        #[cfg(not(windows))]
        unsafe {
            map.unchecked_advise_range(memmap2::UncheckedAdvice::Free, offset, len)
                .map_err(IoError::HolePunch)?;
        }
        Ok(())
    }
}

/// The pool's handle on its backing store: either of [`ChunkBacking`]'s two
/// concrete providers, boxed so `Pool` doesn't need to be generic over it.
pub(crate) type MappingProvider = Box<dyn ChunkBacking>;

pub(crate) fn open_file(file: File, chunk_size: usize, existing_chunks: u16) -> Result<MappingProvider, Error> {
    Ok(Box::new(FileBacking::open(file, chunk_size, existing_chunks)?))
}

pub(crate) fn open_anonymous(chunk_size: usize) -> MappingProvider {
    Box::new(AnonymousBacking::new(chunk_size))
}
