//! Linear pool over the frame buffer tail
//!
//! The screen-wide off-screen manager counts in pixels, not bytes. This
//! backend converts a byte request to `ceil(size / bytes_per_pixel)` pixels,
//! converts the returned pixel offset back to bytes and keeps the area token
//! so the range can be released later.

use std::collections::HashMap;

use crate::AllocError;

/// Area handed out by an off-screen manager, in pixel units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearArea {
    /// Token identifying the area for release
    pub id: u32,
    /// Offset from the start of the frame buffer
    pub offset: usize,
    /// Length of the area
    pub length: usize,
}

/// Screen-wide free-space manager for off-screen memory
pub trait OffscreenManager: Send {
    /// Reserve `length` units at an offset that is a multiple of `granularity`
    fn allocate_linear(&mut self, length: usize, granularity: usize) -> Option<LinearArea>;

    /// Return an area previously handed out
    fn free_linear(&mut self, area: LinearArea);

    /// Largest contiguous free run, in units
    fn largest_free(&self) -> usize;
}

/// First-fit free list over a range of pixel units
#[derive(Debug)]
pub struct TailFreeList {
    /// Free extents as (start, length), sorted by start, never adjacent
    extents: Vec<(usize, usize)>,
    next_id: u32,
}

impl TailFreeList {
    /// Manage units `start..end`
    pub fn new(start: usize, end: usize) -> Self {
        let mut extents = Vec::new();
        if end > start {
            extents.push((start, end - start));
        }

        Self {
            extents,
            next_id: 1,
        }
    }

    /// Total free units
    pub fn free_units(&self) -> usize {
        self.extents.iter().map(|&(_, len)| len).sum()
    }
}

impl OffscreenManager for TailFreeList {
    fn allocate_linear(&mut self, length: usize, granularity: usize) -> Option<LinearArea> {
        if length == 0 {
            return None;
        }
        let granularity = granularity.max(1);

        let (index, aligned) = self.extents.iter().enumerate().find_map(|(i, &(start, len))| {
            let aligned = start.div_ceil(granularity).checked_mul(granularity)?;
            let fits = aligned
                .checked_add(length)
                .is_some_and(|stop| stop <= start + len);
            fits.then_some((i, aligned))
        })?;

        let (start, len) = self.extents.remove(index);
        let end = start + len;
        let mut insert_at = index;
        if aligned > start {
            self.extents.insert(insert_at, (start, aligned - start));
            insert_at += 1;
        }
        if aligned + length < end {
            self.extents
                .insert(insert_at, (aligned + length, end - aligned - length));
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        Some(LinearArea {
            id,
            offset: aligned,
            length,
        })
    }

    fn free_linear(&mut self, area: LinearArea) {
        let index = self
            .extents
            .partition_point(|&(start, _)| start < area.offset);
        self.extents.insert(index, (area.offset, area.length));

        // Merge with the following extent, then the preceding one
        if index + 1 < self.extents.len() {
            let (start, len) = self.extents[index];
            if start + len == self.extents[index + 1].0 {
                self.extents[index].1 += self.extents[index + 1].1;
                self.extents.remove(index + 1);
            }
        }
        if index > 0 {
            let (prev_start, prev_len) = self.extents[index - 1];
            if prev_start + prev_len == self.extents[index].0 {
                self.extents[index - 1].1 += self.extents[index].1;
                self.extents.remove(index);
            }
        }
    }

    fn largest_free(&self) -> usize {
        self.extents.iter().map(|&(_, len)| len).max().unwrap_or(0)
    }
}

/// Linear pool backend
pub struct LinearPool {
    manager: Box<dyn OffscreenManager>,
    bytes_per_pixel: usize,
    /// Live areas by handle
    areas: HashMap<u32, LinearArea>,
}

impl LinearPool {
    pub fn new(manager: Box<dyn OffscreenManager>, bytes_per_pixel: usize) -> Self {
        Self {
            manager,
            bytes_per_pixel: bytes_per_pixel.max(1),
            areas: HashMap::new(),
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bytes_per_pixel
    }

    /// Reserve at least `size` bytes, returns (handle, byte offset)
    ///
    /// The byte offset is a multiple of `alignment` whenever both the
    /// alignment and the pixel size are powers of two.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<(u32, u64), AllocError> {
        let units = size.div_ceil(self.bytes_per_pixel);
        let granularity = alignment.div_ceil(self.bytes_per_pixel).max(1);

        let area = self
            .manager
            .allocate_linear(units, granularity)
            .ok_or(AllocError::Exhausted)?;
        let offset = (area.offset * self.bytes_per_pixel) as u64;

        self.areas.insert(area.id, area);
        Ok((area.id, offset))
    }

    /// Release the area behind `handle`
    pub fn free(&mut self, handle: u32) {
        match self.areas.remove(&handle) {
            Some(area) => self.manager.free_linear(area),
            None => log::warn!("vidmem: unknown linear area {}", handle),
        }
    }

    /// Bytes actually reserved for `handle`
    pub fn reserved_bytes(&self, handle: u32) -> Option<usize> {
        self.areas
            .get(&handle)
            .map(|area| area.length * self.bytes_per_pixel)
    }

    /// Largest request that could currently succeed, in bytes
    pub fn largest_free_bytes(&self) -> usize {
        self.manager.largest_free() * self.bytes_per_pixel
    }
}
