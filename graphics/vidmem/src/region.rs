//! CPU-visible memory windows
//!
//! A [`MappedRegion`] is a base pointer plus length for memory that is
//! already mapped into the process: the frame buffer aperture, or a window
//! the kernel mapped for one GEM object. Pointers are only handed out after
//! checking the requested range against the length.

use core::ptr::NonNull;

use crate::MapError;

/// Mapped memory window
#[derive(Debug)]
pub struct MappedRegion {
    base: NonNull<u8>,
    len: usize,
}

// The region only describes memory; access is serialized by the owner.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Describe `len` bytes mapped at `base`
    ///
    /// Returns `None` for a null base.
    ///
    /// # Safety
    ///
    /// `base..base + len` must stay mapped and writable for the lifetime of
    /// the region.
    pub unsafe fn new(base: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(base).map(|base| Self { base, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to `offset`, checked so that `offset + len` stays inside
    pub fn range(&self, offset: usize, len: usize) -> Result<NonNull<u8>, MapError> {
        let end = offset.checked_add(len).ok_or(MapError::OutOfBounds {
            offset,
            len,
            limit: self.len,
        })?;
        if end > self.len {
            return Err(MapError::OutOfBounds {
                offset,
                len,
                limit: self.len,
            });
        }

        // In bounds, so the add stays within the mapping.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }
}
