//! §5 concurrency primitives shared by `pool`, `vector`, `trie` and `blob`:
//! the mapped-memory mutex, the recycler clock used for freeze/unfreeze TTL
//! decisions, and the compare-and-swap retry loop used for lock-free cell
//! replacement.
//!
//! Acquisition order is always intra-process ([`std::sync::Mutex`]) before
//! inter-process ([`RawMutex`]) — callers must take any process-local lock
//! first and only then reach into mapped memory for the `RawMutex`. The
//! reverse order is never used anywhere in this crate.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use crate::error::Error;

/// A mutex whose state lives inside a memory-mapped region, so that it can
/// coordinate threads across process boundaries sharing the same mapping.
///
/// This is a spinlock, not an OS futex/robust-mutex: the design notes call
/// for replacing the source's raw CAS intrinsics with `AtomicU32`/`AtomicU64`
/// operations rather than mirroring an OS-specific IPC primitive, and the
/// teacher crate itself only ever assumes a single writing process (enforced
/// with an exclusive file lock) plus many single-process reader/writer
/// threads. A held `RawMutex` therefore should only ever be contended by
/// threads, not by an indefinitely-scheduled separate process; a process
/// that dies while holding one will wedge every other opener, same as the
/// teacher's file lock does.
///
/// `AtomicU32` has the same layout as `u32`, so a `RawMutex` can be laid
/// directly over mapped bytes via a pointer cast, the same way the teacher
/// casts `*mut u8` to `&mut LeafHeader`.
#[repr(transparent)]
pub(crate) struct RawMutex(AtomicU32);

impl RawMutex {
    pub const UNLOCKED: u32 = 0;
    pub const LOCKED: u32 = 1;

    /// Initialize a `RawMutex` in place at `ptr`, which must point to at
    /// least 4 aligned bytes of mapped memory that nothing else is using.
    ///
    /// # Safety
    /// `ptr` must be valid for `'a` and exclusively owned for the duration.
    pub unsafe fn init_at<'a>(ptr: *mut u32) -> &'a RawMutex {
        ptr.write(Self::UNLOCKED);
        &*(ptr as *const RawMutex)
    }

    /// View an already-initialized `RawMutex` previously placed with
    /// [`Self::init_at`].
    ///
    /// # Safety
    /// `ptr` must point at a live `RawMutex` for `'a`.
    pub unsafe fn at<'a>(ptr: *mut u32) -> &'a RawMutex {
        &*(ptr as *const RawMutex)
    }

    pub fn lock(&self) -> RawMutexGuard<'_> {
        while self
            .0
            .compare_exchange_weak(Self::UNLOCKED, Self::LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        RawMutexGuard { lock: &self.0 }
    }
}

pub(crate) struct RawMutexGuard<'a> {
    lock: &'a AtomicU32,
}

impl Drop for RawMutexGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(RawMutex::UNLOCKED, Ordering::Release);
    }
}

/// The "opaque monotonic clock handle" of spec.md §4.1: a tick counter
/// published into the pool header, read by upper layers for TTL decisions
/// (block freeze duration, blob LARGE-value recycler staleness). Publishing
/// is a separate step from reading so that many readers can consult `now()`
/// without each re-querying the OS clock, matching the original's
/// periodically-refreshed clock in `lib/grnxx/time.cpp`.
pub(crate) struct Recycler {
    epoch: Instant,
    published: AtomicU64,
}

impl Recycler {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            published: AtomicU64::new(0),
        }
    }

    /// Refresh the published tick from the wall clock. Called once per
    /// allocating operation before consulting frozen stamps, so unfreeze
    /// decisions use a reasonably fresh time without a syscall per check.
    pub fn publish(&self) -> u64 {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.published.store(now, Ordering::Release);
        now
    }

    /// The most recently published tick, in milliseconds since this
    /// recycler was constructed.
    pub fn now(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }
}

/// Retry a compare-and-swap update of a 64-bit cell (§5 "lock-free cell
/// replacement"). `build` receives the cell's current value and must return
/// the new value to install, performing any external allocation it needs
/// *before* returning so that on a lost race the allocation can be
/// unwound. On a successful swap, `on_success` is handed the value that was
/// replaced (so its external storage, if any, can be freed); on a lost race,
/// `on_retry` is handed the value `build` just produced (so its allocation,
/// if any, can be freed) before trying again.
pub(crate) fn cas_update<B, S, R>(
    cell: &AtomicU64,
    mut build: B,
    mut on_success: S,
    mut on_retry: R,
) -> Result<(), Error>
where
    B: FnMut(u64) -> Result<u64, Error>,
    S: FnMut(u64),
    R: FnMut(u64),
{
    loop {
        let old = cell.load(Ordering::Acquire);
        let new = build(old)?;
        match cell.compare_exchange(old, new, Ordering::SeqCst, Ordering::Acquire) {
            Ok(_) => {
                on_success(old);
                return Ok(());
            }
            Err(_) => {
                on_retry(new);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_mutex_excludes() {
        let mut slot: u32 = 0xFFFF_FFFF;
        let m = unsafe { RawMutex::init_at(&mut slot as *mut u32) };
        let g = m.lock();
        drop(g);
        let _g2 = m.lock();
    }

    #[test]
    fn recycler_is_monotonic() {
        let r = Recycler::new();
        let t0 = r.publish();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let t1 = r.publish();
        assert!(t1 >= t0);
    }
}
