//! A single 2 MiB heap span: rank-indexed free lists for large chunks, and a two-level block
//! sub-allocator for medium and small chunks, all classified through one per-unit tag array
//! (§4.2's unit map).
//!
//! # Classification
//!
//! Every 1 KiB unit in the span carries a [`UnitEntry`] tag. A large chunk's head unit is tagged
//! `AllocLarge`/`FreeLarge` directly; its interior units are `Unused`. A medium block's head unit
//! is tagged `BlockHead`, carrying the block's own 32-slot free bitmap plus one optional
//! [`InnerSlot`] per medium slot for slots that have been further subdivided into a small
//! allocator; the block's interior units (a block always occupies a whole number of units, since
//! it's carved from a large chunk) are tagged `BlockBody` pointing back at the head. Classifying
//! any pointer is therefore `unit_of(ptr)` followed by one array index — O(1) regardless of how
//! many blocks are live, with no address-keyed search structure standing in for the tag array
//! itself (§4.2, §9).
//!
//! Locating a slot *within* a block, and a small slot within a subdivided medium slot, is plain
//! division/modulo against the block's base address — again arithmetic, never a lookup keyed by
//! the slot's own address, so an inner block can never collide with (or overwrite metadata
//! belonging to) the medium block hosting it.

use crate::error::{Error, Result};
use crate::rank::{self, LARGE_RANKS, MEDIUM_RANKS, RankClass, SMALL_RANKS, size_of_rank};
use crate::span::{RawSpan, SPAN_SIZE};
use std::ptr::NonNull;
use std::sync::Arc;

const UNIT_SIZE: usize = 1024;
const UNITS_PER_SPAN: usize = SPAN_SIZE / UNIT_SIZE;
const HEADER_UNITS: usize = 4;
const NUM_LARGE_RANKS: usize = LARGE_RANKS.end as usize - LARGE_RANKS.start as usize;
const NUM_MEDIUM_RANKS: usize = MEDIUM_RANKS.end as usize - MEDIUM_RANKS.start as usize;
const NUM_SMALL_RANKS: usize = SMALL_RANKS.end as usize - SMALL_RANKS.start as usize;
/// Slots per block/inner-block, fixed regardless of rank (§4.2).
const SLOTS_PER_BLOCK: u32 = 32;

#[derive(Debug)]
enum UnitEntry {
    /// Heap header (unit map + metadata); never allocated from.
    Reserved,
    /// Interior unit of a multi-unit large chunk, or of a medium block whose head lives
    /// elsewhere and has since been freed back to a large chunk; only the head unit carries a
    /// tag in either case.
    Unused,
    FreeLarge {
        rank: u32,
        next: Option<u32>,
    },
    AllocLarge {
        /// Rank the caller asked for; reported by `chunk_size`.
        requested_rank: u32,
        /// Rank actually backing the chunk (`>= requested_rank`) if first-fit matched a larger
        /// free chunk than requested; this is what's returned to the free list.
        backing_rank: u32,
    },
    /// Head unit of a medium block: 32 fixed-size slots carved out of one large chunk.
    BlockHead(Box<BlockHead>),
    /// Non-head unit occupied by a block; classification follows `head_unit` back to the tag
    /// that actually carries the block's state.
    BlockBody {
        head_unit: u32,
    },
}

/// State for one medium block (§4.2): 32 slots of `size_of_rank(rank)` bytes each, carved out of
/// a large chunk of `backing_rank`. A slot is either a live/free medium allocation directly, or
/// — if `inner[slot]` is `Some` — has been further subdivided into its own 32-slot small
/// allocator.
#[derive(Debug)]
struct BlockHead {
    rank: u32,
    backing_rank: u32,
    /// Bit `i` set means medium slot `i` is free at the medium level (never set while `inner[i]`
    /// is `Some`, since a subdivided slot is always "allocated" from the block's perspective).
    free_bitmap: u32,
    inner: [Option<InnerSlot>; SLOTS_PER_BLOCK as usize],
}

/// A medium slot that has been subdivided into small allocations.
#[derive(Debug)]
struct InnerSlot {
    rank: u32,
    /// Bit `i` set means small slot `i` is free.
    free_bitmap: u32,
}

pub enum Status {
    Active,
    Staging,
}

/// One 2 MiB heap span, owned by exactly one execution context's [`crate::Cache`] except for
/// the remote-free path.
pub struct HeapSpan {
    raw: RawSpan,
    units: Box<[UnitEntry]>,
    large_free: [Option<u32>; NUM_LARGE_RANKS],
    /// Head unit of the block currently serving each medium rank, if any.
    active_medium: [Option<u32>; NUM_MEDIUM_RANKS],
    /// `(head_unit, medium_slot)` of the inner block currently serving each small rank, if any.
    active_small: [Option<(u32, u8)>; NUM_SMALL_RANKS],
    /// Count of currently-live allocations, used only to decide whether a staging span can be
    /// unmapped during a sweep.
    live: usize,
    pub status: Status,
    pub remote_free: Arc<mpmc_ring::Ring<usize>>,
}

impl HeapSpan {
    /// Maps a fresh 2 MiB heap span and carves its body into the largest representable large
    /// chunks that fit, largest-first. Any remainder under the smallest large-chunk size (4
    /// units) is left unused — mirroring the "coalescing is a TODO" note in the original.
    pub fn new(remote_free_capacity: usize) -> Result<Self> {
        let raw = RawSpan::map(SPAN_SIZE)?;
        let mut units: Vec<UnitEntry> = (0..UNITS_PER_SPAN).map(|_| UnitEntry::Unused).collect();
        for u in units.iter_mut().take(HEADER_UNITS) {
            *u = UnitEntry::Reserved;
        }

        let mut this = Self {
            raw,
            units: units.into_boxed_slice(),
            large_free: [None; NUM_LARGE_RANKS],
            active_medium: [None; NUM_MEDIUM_RANKS],
            active_small: [None; NUM_SMALL_RANKS],
            live: 0,
            status: Status::Active,
            remote_free: Arc::new(mpmc_ring::Ring::new(remote_free_capacity)),
        };
        this.seed_free_lists();
        Ok(this)
    }

    fn seed_free_lists(&mut self) {
        let mut unit = HEADER_UNITS as u32;
        let mut remaining = (UNITS_PER_SPAN - HEADER_UNITS) as u32;
        while remaining > 0 {
            let Some((r, len)) = (LARGE_RANKS.start..LARGE_RANKS.end)
                .rev()
                .map(|r| (r, (size_of_rank(r) / UNIT_SIZE) as u32))
                .find(|&(_, len)| len <= remaining)
            else {
                break;
            };
            let idx = (r - LARGE_RANKS.start) as usize;
            self.units[unit as usize] = UnitEntry::FreeLarge {
                rank: r,
                next: self.large_free[idx],
            };
            self.large_free[idx] = Some(unit);
            unit += len;
            remaining -= len;
        }
    }

    #[inline]
    fn unit_of(&self, ptr: *mut u8) -> u32 {
        ((ptr as usize - self.raw.as_ptr() as usize) / UNIT_SIZE) as u32
    }

    #[inline]
    fn unit_to_ptr(&self, unit: u32) -> *mut u8 {
        // Safety: `unit` is always `< UNITS_PER_SPAN`.
        unsafe { self.raw.as_ptr().add(unit as usize * UNIT_SIZE) }
    }

    /// Whether `ptr` falls anywhere within this span's mapping.
    pub fn owns(&self, ptr: *mut u8) -> bool {
        let base = self.raw.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.raw.len()
    }

    pub fn alloc(&mut self, rank: u32) -> Result<NonNull<u8>> {
        let ptr = match rank::class_of(rank) {
            RankClass::Large => self.alloc_large(rank),
            RankClass::Medium => self.alloc_medium_slot(rank).map(|(ptr, ..)| ptr),
            RankClass::Small => self.alloc_small(rank),
            RankClass::Huge => unreachable!("huge allocations bypass the heap entirely"),
        }?;
        self.live += 1;
        Ok(ptr)
    }

    /// Whether this span currently has no live allocations at all (safe to unmap if staging).
    pub fn is_completely_free(&self) -> bool {
        self.live == 0
    }

    fn alloc_large(&mut self, requested_rank: u32) -> Result<NonNull<u8>> {
        for r in requested_rank..LARGE_RANKS.end {
            let idx = (r - LARGE_RANKS.start) as usize;
            if let Some(unit) = self.large_free[idx] {
                let next = match self.units[unit as usize] {
                    UnitEntry::FreeLarge { next, .. } => next,
                    _ => return Err(Error::Fatal("large free list points at a non-free unit")),
                };
                self.large_free[idx] = next;
                self.units[unit as usize] = UnitEntry::AllocLarge {
                    requested_rank,
                    backing_rank: r,
                };
                let ptr = self.unit_to_ptr(unit);
                // Safety: `unit_to_ptr` never returns null.
                return Ok(unsafe { NonNull::new_unchecked(ptr) });
            }
        }
        Err(Error::OutOfMemory)
    }

    /// Returns the allocated slot's pointer, the block's head unit, and the slot index within
    /// the block.
    fn alloc_medium_slot(&mut self, rank: u32) -> Result<(NonNull<u8>, u32, u8)> {
        let idx = (rank - MEDIUM_RANKS.start) as usize;
        loop {
            if let Some(head_unit) = self.active_medium[idx] {
                let head = match &mut self.units[head_unit as usize] {
                    UnitEntry::BlockHead(head) => head,
                    _ => return Err(Error::Fatal("active medium block vanished")),
                };
                if head.free_bitmap != 0 {
                    let bit = head.free_bitmap.trailing_zeros();
                    head.free_bitmap &= !(1 << bit);
                    let base = self.unit_to_ptr(head_unit) as usize;
                    return Ok((slot_ptr(base, rank, bit as u8), head_unit, bit as u8));
                }
                self.active_medium[idx] = None;
                continue;
            }

            let slot_size = size_of_rank(rank);
            let block_rank =
                rank::rank_of(slot_size.saturating_mul(SLOTS_PER_BLOCK as usize)).min(LARGE_RANKS.end - 1);
            let backing = self.alloc_large(block_rank)?;
            let head_unit = self.unit_of(backing.as_ptr());
            let backing_rank = match self.units[head_unit as usize] {
                UnitEntry::AllocLarge { backing_rank, .. } => backing_rank,
                _ => return Err(Error::Fatal("alloc: fresh large chunk missing its tag")),
            };
            let num_units = size_of_rank(backing_rank) / UNIT_SIZE;
            for u in (head_unit + 1)..(head_unit + num_units as u32) {
                self.units[u as usize] = UnitEntry::BlockBody { head_unit };
            }
            self.units[head_unit as usize] = UnitEntry::BlockHead(Box::new(BlockHead {
                rank,
                backing_rank,
                free_bitmap: u32::MAX & !1, // slot 0 is used immediately by this request
                inner: std::array::from_fn(|_| None),
            }));
            self.active_medium[idx] = Some(head_unit);
            let base = self.unit_to_ptr(head_unit) as usize;
            return Ok((slot_ptr(base, rank, 0), head_unit, 0));
        }
    }

    fn alloc_small(&mut self, rank: u32) -> Result<NonNull<u8>> {
        let idx = rank as usize;
        loop {
            if let Some((head_unit, medium_slot)) = self.active_small[idx] {
                let head = match &mut self.units[head_unit as usize] {
                    UnitEntry::BlockHead(head) => head,
                    _ => return Err(Error::Fatal("active small block vanished")),
                };
                let parent_rank = head.rank;
                let inner = head.inner[medium_slot as usize]
                    .as_mut()
                    .ok_or(Error::Fatal("active small slot missing inner state"))?;
                if inner.free_bitmap != 0 {
                    let bit = inner.free_bitmap.trailing_zeros();
                    inner.free_bitmap &= !(1 << bit);
                    let base = self.unit_to_ptr(head_unit) as usize
                        + medium_slot as usize * size_of_rank(parent_rank);
                    return Ok(slot_ptr(base, rank, bit as u8));
                }
                self.active_small[idx] = None;
                continue;
            }

            let slot_size = size_of_rank(rank);
            let parent_rank = rank::rank_of(slot_size.saturating_mul(SLOTS_PER_BLOCK as usize))
                .clamp(MEDIUM_RANKS.start, MEDIUM_RANKS.end - 1);
            let (parent_ptr, head_unit, medium_slot) = self.alloc_medium_slot(parent_rank)?;
            let head = match &mut self.units[head_unit as usize] {
                UnitEntry::BlockHead(head) => head,
                _ => return Err(Error::Fatal("alloc: fresh medium block missing its tag")),
            };
            head.inner[medium_slot as usize] = Some(InnerSlot {
                rank,
                free_bitmap: u32::MAX & !1,
            });
            self.active_small[idx] = Some((head_unit, medium_slot));
            let base = parent_ptr.as_ptr() as usize;
            return Ok(slot_ptr(base, rank, 0));
        }
    }

    /// Frees a pointer previously returned by `alloc`. Double frees and corrupted metadata are
    /// reported as `Error::Fatal`, matching the runtime's "bad free is unrecoverable" policy.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let unit = self.unit_of(ptr.as_ptr());

        enum Target {
            Block(u32),
            Large,
        }
        let target = match self.units.get(unit as usize) {
            Some(UnitEntry::BlockHead(_)) => Target::Block(unit),
            Some(UnitEntry::BlockBody { head_unit }) => Target::Block(*head_unit),
            _ => Target::Large,
        };

        let result = match target {
            Target::Block(head_unit) => self.free_block_slot(head_unit, addr),
            Target::Large => self.free_large(ptr.as_ptr()),
        };
        if result.is_ok() {
            self.live -= 1;
        }
        result
    }

    /// Frees the slot at `addr` within the block headed at `head_unit`, whether that slot is a
    /// direct medium allocation or one further subdivided into a small allocation.
    fn free_block_slot(&mut self, head_unit: u32, addr: usize) -> Result<()> {
        let base = self.unit_to_ptr(head_unit) as usize;
        let offset = addr
            .checked_sub(base)
            .ok_or(Error::Fatal("free: address before block base"))?;

        let medium_rank;
        let mut freed_inner_rank: Option<u32> = None;
        let block_now_empty;
        let medium_slot;
        {
            let head = match &mut self.units[head_unit as usize] {
                UnitEntry::BlockHead(head) => head,
                _ => return Err(Error::Fatal("free: expected a block head unit")),
            };
            medium_rank = head.rank;
            let medium_slot_size = size_of_rank(medium_rank);
            medium_slot = (offset / medium_slot_size) as u32;
            if medium_slot >= SLOTS_PER_BLOCK {
                return Err(Error::Fatal("free: slot index out of range"));
            }

            match &mut head.inner[medium_slot as usize] {
                Some(inner) => {
                    let inner_offset = offset - medium_slot as usize * medium_slot_size;
                    let inner_slot_size = size_of_rank(inner.rank);
                    if inner_offset % inner_slot_size != 0 {
                        return Err(Error::Fatal("free: misaligned small pointer"));
                    }
                    let small_slot = (inner_offset / inner_slot_size) as u32;
                    if small_slot >= SLOTS_PER_BLOCK {
                        return Err(Error::Fatal("free: small slot index out of range"));
                    }
                    let bit = 1u32 << small_slot;
                    if inner.free_bitmap & bit != 0 {
                        return Err(Error::Fatal("double free"));
                    }
                    inner.free_bitmap |= bit;
                    if inner.free_bitmap == u32::MAX {
                        freed_inner_rank = Some(inner.rank);
                        head.inner[medium_slot as usize] = None;
                        head.free_bitmap |= 1u32 << medium_slot;
                    }
                }
                None => {
                    if offset % medium_slot_size != 0 {
                        return Err(Error::Fatal("free: misaligned medium pointer"));
                    }
                    let bit = 1u32 << medium_slot;
                    if head.free_bitmap & bit != 0 {
                        return Err(Error::Fatal("double free"));
                    }
                    head.free_bitmap |= bit;
                }
            }
            block_now_empty = head.free_bitmap == u32::MAX;
        }

        if let Some(inner_rank) = freed_inner_rank {
            let sidx = inner_rank as usize;
            if self.active_small[sidx] == Some((head_unit, medium_slot as u8)) {
                self.active_small[sidx] = None;
            }
        }

        if block_now_empty {
            let idx = (medium_rank - MEDIUM_RANKS.start) as usize;
            if self.active_medium[idx] == Some(head_unit) {
                self.active_medium[idx] = None;
            }
            let backing_rank = match &self.units[head_unit as usize] {
                UnitEntry::BlockHead(head) => head.backing_rank,
                _ => return Err(Error::Fatal("free: block head vanished")),
            };
            let num_units = size_of_rank(backing_rank) / UNIT_SIZE;
            for u in (head_unit + 1)..(head_unit + num_units as u32) {
                self.units[u as usize] = UnitEntry::Unused;
            }
            let lidx = (backing_rank - LARGE_RANKS.start) as usize;
            self.units[head_unit as usize] = UnitEntry::FreeLarge {
                rank: backing_rank,
                next: self.large_free[lidx],
            };
            self.large_free[lidx] = Some(head_unit);
        }
        Ok(())
    }

    fn free_large(&mut self, ptr: *mut u8) -> Result<()> {
        let unit = self.unit_of(ptr);
        if self.unit_to_ptr(unit) != ptr {
            return Err(Error::Fatal("free: misaligned large chunk pointer"));
        }
        self.free_large_unit(unit)
    }

    fn free_large_unit(&mut self, unit: u32) -> Result<()> {
        let backing_rank = match self.units[unit as usize] {
            UnitEntry::AllocLarge { backing_rank, .. } => backing_rank,
            UnitEntry::FreeLarge { .. } => return Err(Error::Fatal("double free")),
            _ => return Err(Error::Fatal("free: not an allocated chunk")),
        };
        let idx = (backing_rank - LARGE_RANKS.start) as usize;
        self.units[unit as usize] = UnitEntry::FreeLarge {
            rank: backing_rank,
            next: self.large_free[idx],
        };
        self.large_free[idx] = Some(unit);
        Ok(())
    }

    /// Returns the rounded-up size class of the live allocation at `ptr`, or `None` if `ptr`
    /// is not currently allocated from this span.
    pub fn chunk_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        let unit = self.unit_of(ptr.as_ptr());
        let head_unit = match self.units.get(unit as usize) {
            Some(UnitEntry::BlockHead(_)) => unit,
            Some(UnitEntry::BlockBody { head_unit }) => *head_unit,
            Some(UnitEntry::AllocLarge { requested_rank, .. }) if self.unit_to_ptr(unit) == ptr.as_ptr() => {
                return Some(size_of_rank(*requested_rank));
            }
            _ => return None,
        };

        let head = match &self.units[head_unit as usize] {
            UnitEntry::BlockHead(head) => head,
            _ => return None,
        };
        let base = self.unit_to_ptr(head_unit) as usize;
        let medium_slot_size = size_of_rank(head.rank);
        let offset = addr.checked_sub(base)?;
        let medium_slot = offset / medium_slot_size;
        if medium_slot >= SLOTS_PER_BLOCK as usize || head.free_bitmap & (1u32 << medium_slot) != 0 {
            return None;
        }
        match &head.inner[medium_slot] {
            Some(inner) => {
                let inner_offset = offset - medium_slot * medium_slot_size;
                let inner_slot_size = size_of_rank(inner.rank);
                let small_slot = inner_offset / inner_slot_size;
                if small_slot >= SLOTS_PER_BLOCK as usize || inner.free_bitmap & (1u32 << small_slot) != 0 {
                    None
                } else {
                    Some(size_of_rank(inner.rank))
                }
            }
            None if offset % medium_slot_size == 0 => Some(size_of_rank(head.rank)),
            None => None,
        }
    }

    /// Drains the remote-free queue, applying each freed pointer locally. Returns the number
    /// of pointers reclaimed.
    pub fn collect(&mut self) -> usize {
        let mut n = 0;
        while let Ok(addr) = self.remote_free.try_dequeue() {
            n += 1;
            let Some(ptr) = NonNull::new(addr as *mut u8) else {
                continue;
            };
            if let Err(err) = self.free(ptr) {
                panic!("remote free reclaim failed: {err}");
            }
        }
        n
    }

    /// Largest number of *contiguous free* units currently available for a large allocation
    /// without growing — used by the cache to decide between this span, a staging span, and a
    /// fresh `mmap`.
    pub fn largest_free_large_rank(&self) -> Option<u32> {
        self.large_free
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, head)| head.map(|_| LARGE_RANKS.start + i as u32))
    }
}

#[inline]
fn slot_ptr(base: usize, rank: u32, slot: u8) -> NonNull<u8> {
    let addr = base + slot as usize * size_of_rank(rank);
    // Safety: `base` is a live block/chunk base (non-null by construction).
    unsafe { NonNull::new_unchecked(addr as *mut u8) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(rank: u32) {
        let mut heap = HeapSpan::new(16).unwrap();
        let ptr = heap.alloc(rank).unwrap();
        assert_eq!(heap.chunk_size(ptr), Some(size_of_rank(rank)));
        heap.free(ptr).unwrap();
        assert_eq!(heap.chunk_size(ptr), None);
    }

    #[test]
    fn round_trips_every_class() {
        round_trip(0); // small
        round_trip(25); // medium
        round_trip(50); // large
    }

    #[test]
    fn double_free_is_fatal() {
        let mut heap = HeapSpan::new(16).unwrap();
        let ptr = heap.alloc(10).unwrap();
        heap.free(ptr).unwrap();
        assert!(matches!(heap.free(ptr), Err(Error::Fatal(_))));
    }

    #[test]
    fn many_small_allocations_are_disjoint() {
        let mut heap = HeapSpan::new(16).unwrap();
        let mut ptrs = Vec::new();
        for _ in 0..500 {
            ptrs.push(heap.alloc(3).unwrap());
        }
        let mut addrs: Vec<usize> = ptrs.iter().map(|p| p.as_ptr() as usize).collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), 500);
        for p in ptrs {
            heap.free(p).unwrap();
        }
    }

    #[test]
    fn freeing_every_slot_returns_slab_to_parent() {
        let mut heap = HeapSpan::new(16).unwrap();
        // Fill exactly one inner block's worth of small allocations, then free them all; the
        // backing medium slot and ultimately the large chunk should become reusable again.
        let ptrs: Vec<_> = (0..32).map(|_| heap.alloc(0).unwrap()).collect();
        for p in ptrs {
            heap.free(p).unwrap();
        }
        // A fresh allocation at the same rank should succeed (no leaked/poisoned state).
        heap.alloc(0).unwrap();
    }

    #[test]
    fn remote_free_is_applied_on_collect() {
        let mut heap = HeapSpan::new(16).unwrap();
        let ptr = heap.alloc(10).unwrap();
        heap.remote_free.enqueue(ptr.as_ptr() as usize);
        assert_eq!(heap.collect(), 1);
        assert_eq!(heap.chunk_size(ptr), None);
    }

    /// A fresh medium block always hands back its own slot 0 first, whose address equals the
    /// block's own base. A slot-keyed (rather than address-keyed) classifier must not let the
    /// inner block subsequently carved from that slot alias the block's own metadata.
    #[test]
    fn small_alloc_from_a_fresh_block_does_not_corrupt_the_parent_block() {
        let mut heap = HeapSpan::new(16).unwrap();
        // rank 0 (4 B) subdivides out of medium rank 20 (128 B); a fresh block's slot 0 is
        // exactly the block's base, which is where this first small allocation lands too.
        let small = heap.alloc(0).unwrap();

        // The parent block must still report 31 other free medium slots: allocate every
        // remaining one and confirm none of them alias `small` or each other.
        let mut mediums = Vec::new();
        for _ in 0..31 {
            mediums.push(heap.alloc(20).unwrap());
        }
        let mut addrs: Vec<usize> = mediums.iter().map(|p| p.as_ptr() as usize).collect();
        addrs.push(small.as_ptr() as usize);
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), 32, "parent block's slots must all be distinct");

        heap.free(small).unwrap();
        for p in mediums {
            heap.free(p).unwrap();
        }
        // The whole block must be fully reclaimed, not stuck FATAL on the next round trip.
        heap.alloc(0).unwrap();
    }
}
