//! Huge allocations: requests at or beyond [`rank::HUGE_RANK`] bypass the heap's rank free
//! lists entirely and get a dedicated span sized to exactly fit the request.

use crate::error::{Error, Result};
use crate::span::{RawSpan, SPAN_MASK, SPAN_SIZE};
use std::ptr::NonNull;

/// A single-allocation span: one `mmap` region, one live pointer, freed as a unit.
pub struct HugeSpan {
    raw: RawSpan,
    requested: usize,
}

impl HugeSpan {
    /// Maps a span covering at least `requested` bytes (rounded up to a [`SPAN_SIZE`] multiple).
    pub fn new(requested: usize) -> Result<Self> {
        if requested == 0 {
            return Err(Error::Overflow);
        }
        let raw = RawSpan::map(requested)?;
        Ok(Self { raw, requested })
    }

    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        // Safety: `RawSpan::map` never returns a null base.
        unsafe { NonNull::new_unchecked(self.raw.as_ptr()) }
    }

    /// The size the caller asked for — what `cache_chunk_size` reports, not the rounded-up
    /// mapping size.
    #[inline]
    pub fn requested_size(&self) -> usize {
        self.requested
    }

    #[inline]
    pub fn owns(&self, ptr: *mut u8) -> bool {
        ptr as usize & !SPAN_MASK == self.raw.as_ptr() as usize & !SPAN_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_exact_request_rounded_to_span() {
        let huge = HugeSpan::new(SPAN_SIZE + 1).unwrap();
        assert_eq!(huge.requested_size(), SPAN_SIZE + 1);
        assert!(huge.owns(huge.ptr().as_ptr()));
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(HugeSpan::new(0), Err(Error::Overflow)));
    }
}
