//! Per-context memory cache: a 2 MiB span allocator with rank-indexed free lists, sitting in
//! front of the kernel `mmap`/`munmap` boundary so that allocation and deallocation on the hot
//! path never issue a syscall.
//!
//! Each execution context owns exactly one [`Cache`]. A cache holds one *active* heap span that
//! services allocation requests, a list of *staging* spans kept around after the active span
//! fills up (so a later free can make room again without a fresh mapping), and a list of *huge*
//! spans for allocations beyond the largest rank. Freeing a pointer from a thread other than
//! the owner goes through [`RemoteFreeHandle`] instead of touching the span directly.

pub mod error;
pub mod heap;
pub mod huge;
pub mod rank;
pub mod span;

pub use error::{Error, Result};

use heap::HeapSpan;
use huge::HugeSpan;
use std::ptr::NonNull;
use std::sync::Arc;

/// Default capacity of a heap span's remote-free ring, matching the async-queue sizing floor
/// in `mpmc_ring::Ring::new`.
const DEFAULT_REMOTE_FREE_CAPACITY: usize = 64;

/// A handle another thread can use to return a pointer to its owning context's cache without
/// touching that cache's heap state directly.
///
/// Obtained from the owning [`Cache`] via [`Cache::remote_free_handle`] before a pointer crosses
/// thread boundaries (e.g. attached to an async-call message).
#[derive(Clone)]
pub struct RemoteFreeHandle {
    queue: Arc<mpmc_ring::Ring<usize>>,
}

impl RemoteFreeHandle {
    /// Enqueues `ptr` for the owning context to reclaim on its next [`Cache::collect`].
    pub fn free_remote(&self, ptr: NonNull<u8>) {
        self.queue.enqueue(ptr.as_ptr() as usize);
    }
}

/// Per-context allocator: one active heap span, a reserve of staging spans, and the huge-span
/// list for oversized requests.
pub struct Cache {
    active: Option<HeapSpan>,
    staging: Vec<HeapSpan>,
    huge: Vec<HugeSpan>,
    remote_free_capacity: usize,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            active: None,
            staging: Vec::new(),
            huge: Vec::new(),
            remote_free_capacity: DEFAULT_REMOTE_FREE_CAPACITY,
        }
    }

    /// Allocates at least `size` bytes, rounded up to the smallest representable rank.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        let rank = rank::rank_of(size);
        if rank::class_of(rank) == rank::RankClass::Huge {
            let span = HugeSpan::new(size)?;
            let ptr = span.ptr();
            self.huge.push(span);
            return Ok(ptr);
        }
        self.alloc_rank_from_heaps(rank)
    }

    fn alloc_rank_from_heaps(&mut self, rank: u32) -> Result<NonNull<u8>> {
        if let Some(active) = &mut self.active {
            match active.alloc(rank) {
                Ok(ptr) => return Ok(ptr),
                Err(Error::OutOfMemory) => {}
                Err(e) => return Err(e),
            }
        }

        // The active span has no room at this rank; look for a staging span that does, and
        // promote it to active so subsequent allocations of this rank hit it directly.
        let mut found = None;
        for (i, span) in self.staging.iter_mut().enumerate() {
            if let Ok(ptr) = span.alloc(rank) {
                found = Some((i, ptr));
                break;
            }
        }
        if let Some((i, ptr)) = found {
            let mut promoted = self.staging.swap_remove(i);
            promoted.status = heap::Status::Active;
            if let Some(old_active) = self.active.replace(promoted) {
                self.demote(old_active);
            }
            return Ok(ptr);
        }

        let mut fresh = HeapSpan::new(self.remote_free_capacity)?;
        let ptr = fresh.alloc(rank)?;
        if let Some(old_active) = self.active.replace(fresh) {
            self.demote(old_active);
        }
        Ok(ptr)
    }

    fn demote(&mut self, mut span: HeapSpan) {
        span.status = heap::Status::Staging;
        self.staging.push(span);
    }

    /// Allocates `size` bytes and zeroes them.
    pub fn zalloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        let ptr = self.alloc(size)?;
        let len = self.chunk_size(ptr).unwrap_or(size);
        // Safety: `ptr` was just allocated with room for at least `len` bytes.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, len);
        }
        Ok(ptr)
    }

    /// Allocates `size` bytes with at least `align` alignment.
    ///
    /// Since every rank size from 8 upward is already a multiple of a power of two matching its
    /// own magnitude, satisfying `align` just means rounding the request up until the rank's
    /// size itself is a multiple of `align`.
    pub fn aligned_alloc(&mut self, align: usize, size: usize) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() || align > span::SPAN_SIZE / 2 {
            return Err(Error::AlignmentInvalid(align));
        }
        let mut rank = rank::rank_of(size);
        while rank::class_of(rank) != rank::RankClass::Huge && rank::size_of_rank(rank) % align != 0 {
            rank += 1;
        }
        if rank::class_of(rank) == rank::RankClass::Huge {
            let requested = size.max(align).next_multiple_of(align);
            let span = HugeSpan::new(requested)?;
            let ptr = span.ptr();
            self.huge.push(span);
            return Ok(ptr);
        }
        self.alloc_rank_from_heaps(rank)
    }

    /// Allocates storage for `n` elements of `size` bytes each, zeroed, checking for overflow.
    pub fn calloc(&mut self, n: usize, size: usize) -> Result<NonNull<u8>> {
        let total = n.checked_mul(size).ok_or(Error::Overflow)?;
        self.zalloc(total)
    }

    /// Resizes the allocation at `ptr` to `new_size`, copying the overlapping prefix.
    ///
    /// There is no in-place growth path: every resize allocates fresh and copies, matching the
    /// rank allocator's lack of chunk splitting/merging (see `heap` module docs).
    pub fn realloc(&mut self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>> {
        let old_size = self.chunk_size(ptr).ok_or(Error::Fatal("realloc: pointer not live"))?;
        let new_ptr = self.alloc(new_size)?;
        let copy_len = old_size.min(new_size);
        // Safety: `ptr` has `old_size` live bytes, `new_ptr` has room for `new_size`; regions
        // can't overlap since `new_ptr` was just freshly allocated.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
        }
        self.free(ptr)?;
        Ok(new_ptr)
    }

    /// Frees a pointer previously returned by this cache's allocation methods.
    ///
    /// `ptr` must belong to a span owned by this cache. Freeing a pointer obtained from another
    /// context's cache is a programming error here — use the originating context's
    /// [`RemoteFreeHandle`] instead.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let base = span::span_base_of(ptr.as_ptr());

        if let Some(i) = self.huge.iter().position(|h| h.owns(ptr.as_ptr())) {
            let span = self.huge.swap_remove(i);
            debug_assert_eq!(span::span_base_of(span.ptr().as_ptr()), base);
            return Ok(());
        }

        if let Some(active) = &mut self.active {
            if active.owns(ptr.as_ptr()) {
                return active.free(ptr);
            }
        }
        if let Some(span) = self.staging.iter_mut().find(|s| s.owns(ptr.as_ptr())) {
            return span.free(ptr);
        }
        Err(Error::Fatal("free: pointer not owned by this cache"))
    }

    /// Reports the rounded-up live size of the allocation at `ptr`, or `None` if it isn't live
    /// in this cache.
    pub fn chunk_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        if let Some(h) = self.huge.iter().find(|h| h.owns(ptr.as_ptr())) {
            return Some(h.requested_size());
        }
        if let Some(active) = &self.active {
            if let Some(size) = active.chunk_size(ptr) {
                return Some(size);
            }
        }
        self.staging.iter().find_map(|s| s.chunk_size(ptr))
    }

    /// Returns a handle another thread can use to free a pointer owned by this cache's active
    /// or staging spans. Returns `None` for huge-span pointers, which have no remote-free path
    /// (the owner must free them directly).
    pub fn remote_free_handle(&self, ptr: NonNull<u8>) -> Option<RemoteFreeHandle> {
        let owner = self
            .active
            .iter()
            .chain(self.staging.iter())
            .find(|s| s.owns(ptr.as_ptr()))?;
        Some(RemoteFreeHandle {
            queue: owner.remote_free.clone(),
        })
    }

    /// Drains every span's remote-free queue and unmaps any staging span left completely idle
    /// afterward. Returns the number of pointers reclaimed.
    pub fn cache_collect(&mut self) -> usize {
        let mut reclaimed = 0;
        if let Some(active) = &mut self.active {
            reclaimed += active.collect();
        }
        for span in &mut self.staging {
            reclaimed += span.collect();
        }
        self.staging.retain(|span| !span.is_completely_free());
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_alloc_free_round_trip() {
        let mut cache = Cache::new();
        let ptr = cache.alloc(32).unwrap();
        assert!(cache.chunk_size(ptr).unwrap() >= 32);
        cache.free(ptr).unwrap();
        assert!(cache.chunk_size(ptr).is_none());
    }

    #[test]
    fn huge_alloc_bypasses_heap() {
        let mut cache = Cache::new();
        let ptr = cache.alloc(4 * 1024 * 1024).unwrap();
        assert_eq!(cache.chunk_size(ptr), Some(4 * 1024 * 1024));
        cache.free(ptr).unwrap();
    }

    #[test]
    fn zalloc_zeroes_memory() {
        let mut cache = Cache::new();
        let ptr = cache.zalloc(256).unwrap();
        let size = cache.chunk_size(ptr).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
        assert!(slice.iter().all(|&b| b == 0));
        cache.free(ptr).unwrap();
    }

    #[test]
    fn calloc_overflow_is_rejected() {
        let mut cache = Cache::new();
        assert!(matches!(cache.calloc(usize::MAX, 2), Err(Error::Overflow)));
    }

    #[test]
    fn realloc_preserves_prefix() {
        let mut cache = Cache::new();
        let ptr = cache.alloc(16).unwrap();
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xAB, 16);
        }
        let grown = cache.realloc(ptr, 256).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 16) };
        assert!(slice.iter().all(|&b| b == 0xAB));
        cache.free(grown).unwrap();
    }

    #[test]
    fn remote_free_handle_reclaims_on_collect() {
        let mut cache = Cache::new();
        let ptr = cache.alloc(64).unwrap();
        let handle = cache.remote_free_handle(ptr).unwrap();
        handle.free_remote(ptr);
        assert_eq!(cache.cache_collect(), 1);
        assert!(cache.chunk_size(ptr).is_none());
    }

    #[test]
    fn aligned_alloc_respects_alignment() {
        let mut cache = Cache::new();
        let ptr = cache.aligned_alloc(64, 100).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        cache.free(ptr).unwrap();
    }

    #[test]
    fn many_allocations_force_a_new_active_span() {
        let mut cache = Cache::new();
        // Large enough and numerous enough to exhaust the first heap span's large-rank
        // capacity and force at least one more `mmap`.
        let ptrs: Vec<_> = (0..64).map(|_| cache.alloc(400_000).unwrap()).collect();
        for p in ptrs {
            cache.free(p).unwrap();
        }
    }

    /// spec.md §8 S2: a long random alloc/free sequence on one cache never corrupts the heap,
    /// and every still-live pointer's reported chunk size is always `>= ` its requested size.
    #[test]
    fn allocator_stress_random_alloc_free_sequence() {
        use rand::Rng;
        use rand::SeedableRng;

        let mut cache = Cache::new();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0xCACE_CACE);
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

        for _ in 0..10_000 {
            if live.is_empty() || rng.random_bool(0.5) {
                let size = rng.random_range(1..=4096);
                let ptr = cache.alloc(size).unwrap();
                assert!(cache.chunk_size(ptr).unwrap() >= size);
                live.push((ptr, size));
            } else {
                let i = rng.random_range(0..live.len());
                let (ptr, _) = live.swap_remove(i);
                cache.free(ptr).unwrap();
            }
        }

        for (ptr, size) in &live {
            assert!(cache.chunk_size(*ptr).unwrap() >= *size);
        }
        for (ptr, _) in live {
            cache.free(ptr).unwrap();
        }
    }

    /// spec.md §8 S3: pointers allocated on one context and freed from another thread are
    /// reclaimed, without data races, once the owner calls `cache_collect`.
    #[test]
    fn remote_free_from_another_thread_is_reclaimed_on_collect() {
        struct SendPtr(NonNull<u8>);
        // Safety: the pointer is handed to exactly one other thread, which only enqueues its
        // address on the owning cache's remote-free ring and never dereferences it — the same
        // contract `RemoteFreeHandle::free_remote` documents for any cross-thread free.
        unsafe impl Send for SendPtr {}

        let mut cache = Cache::new();
        let mut handles = Vec::new();
        let mut ptrs = Vec::new();
        for _ in 0..100 {
            let ptr = cache.alloc(64).unwrap();
            handles.push(cache.remote_free_handle(ptr).unwrap());
            ptrs.push(ptr);
        }

        let threads: Vec<_> = handles
            .into_iter()
            .zip(ptrs.iter().map(|p| SendPtr(*p)))
            .map(|(handle, ptr)| std::thread::spawn(move || handle.free_remote(ptr.0)))
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(cache.cache_collect(), 100);
        for ptr in ptrs {
            assert!(cache.chunk_size(ptr).is_none());
        }
    }
}
