//! 2 MiB-aligned virtual memory spans.
//!
//! Every allocation the cache hands out — whether a slab slice inside a [`HeapSpan`] or a
//! dedicated [`HugeSpan`] — lives inside one of these `mmap`-backed, 2 MiB-aligned regions.
//! Alignment lets any live pointer recover its owning span with a single mask:
//! `ptr & !(SPAN_SIZE - 1)`.

use crate::error::{Error, Result};
use std::ptr::NonNull;

pub const SPAN_SIZE: usize = 2 * 1024 * 1024;
pub const SPAN_MASK: usize = SPAN_SIZE - 1;

/// A raw `mmap`-backed region, aligned to [`SPAN_SIZE`] and sized to an exact multiple of it.
#[derive(Debug)]
pub struct RawSpan {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is exclusively owned by this `RawSpan`; pointers derived from it are only
// handed to the single context that owns the cache, except via the documented remote-free path.
unsafe impl Send for RawSpan {}

impl RawSpan {
    /// Reserves `len` bytes (rounded up to a multiple of [`SPAN_SIZE`]) at a [`SPAN_SIZE`]-aligned
    /// address. Implemented by over-mapping and trimming the misaligned slack, since POSIX gives
    /// no way to request an aligned `mmap` directly.
    pub fn map(len: usize) -> Result<Self> {
        let len = len
            .checked_add(SPAN_MASK)
            .ok_or(Error::Overflow)?
            & !SPAN_MASK;
        let over_len = len.checked_add(SPAN_SIZE).ok_or(Error::Overflow)?;

        // Safety: anonymous, non-file-backed mapping; arguments are all plain integers.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                over_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(Error::OutOfMemory);
        }
        let raw = raw as usize;
        let aligned = (raw + SPAN_MASK) & !SPAN_MASK;

        // Trim the unaligned head and unused tail.
        let head_slack = aligned - raw;
        if head_slack > 0 {
            // Safety: `head_slack` bytes at the start of the over-mapping are no longer needed.
            unsafe {
                libc::munmap(raw as *mut libc::c_void, head_slack);
            }
        }
        let tail_slack = over_len - head_slack - len;
        if tail_slack > 0 {
            // Safety: the bytes past `aligned + len` are no longer needed.
            unsafe {
                libc::munmap((aligned + len) as *mut libc::c_void, tail_slack);
            }
        }

        Ok(Self {
            // Safety: `aligned` is a non-null address returned by a successful `mmap`.
            base: unsafe { NonNull::new_unchecked(aligned as *mut u8) },
            len,
        })
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}

impl Drop for RawSpan {
    fn drop(&mut self) {
        // Safety: `base..base+len` is exactly the mapping created in `map`.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

/// Recovers the span base address owning `ptr`, assuming `ptr` was handed out by some span's
/// allocator.
#[inline]
pub fn span_base_of(ptr: *mut u8) -> *mut u8 {
    ((ptr as usize) & !SPAN_MASK) as *mut u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_span_is_aligned_and_sized() {
        let span = RawSpan::map(SPAN_SIZE).unwrap();
        assert_eq!(span.base().as_ptr() as usize & SPAN_MASK, 0);
        assert_eq!(span.len(), SPAN_SIZE);
    }

    #[test]
    fn span_base_of_recovers_alignment() {
        let span = RawSpan::map(SPAN_SIZE).unwrap();
        let interior = unsafe { span.as_ptr().add(12345) };
        assert_eq!(span_base_of(interior), span.as_ptr());
    }
}
