//! Static slot pool
//!
//! Last-resort backend for drivers without a usable off-screen manager. A
//! fixed region is split into `POOL_SLOTS` equal slots and tracked by a
//! used/free bitmap. Freeing trusts the caller: there is no ownership check.

use crate::AllocError;

/// Number of slots in the pool
pub const POOL_SLOTS: usize = 8;

/// Fixed-size, fixed-location slot pool
#[derive(Debug)]
pub struct StaticPool {
    base: u64,
    slot_size: usize,
    used: u32,
}

impl StaticPool {
    /// Split `size` bytes at `base` into `POOL_SLOTS` slots
    ///
    /// Returns `None` if a slot would be empty.
    pub fn new(base: u64, size: usize) -> Option<Self> {
        let slot_size = size / POOL_SLOTS;
        if slot_size == 0 {
            return None;
        }

        Some(Self {
            base,
            slot_size,
            used: 0,
        })
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Byte offset of a slot
    pub fn slot_offset(&self, slot: usize) -> u64 {
        self.base + (slot * self.slot_size) as u64
    }

    pub fn is_used(&self, slot: usize) -> bool {
        slot < POOL_SLOTS && self.used & (1 << slot) != 0
    }

    pub fn used_slots(&self) -> usize {
        self.used.count_ones() as usize
    }

    /// Claim the first free slot that can hold `size` bytes at `alignment`
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<usize, AllocError> {
        if size > self.slot_size {
            return Err(AllocError::TooLarge {
                requested: size,
                max: self.slot_size,
            });
        }

        let align = alignment.max(1) as u64;
        let slot = (0..POOL_SLOTS)
            .find(|&slot| !self.is_used(slot) && self.slot_offset(slot) % align == 0)
            .ok_or(AllocError::Exhausted)?;

        self.used |= 1 << slot;
        Ok(slot)
    }

    /// Release a slot
    pub fn free(&mut self, slot: usize) {
        if slot >= POOL_SLOTS {
            log::error!("vidmem: static pool slot {} out of range", slot);
            return;
        }
        self.used &= !(1 << slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_evenly_divided() {
        let pool = StaticPool::new(0x10_0000, 8 * 4096).unwrap();
        assert_eq!(pool.slot_size(), 4096);
        assert_eq!(pool.slot_offset(0), 0x10_0000);
        assert_eq!(pool.slot_offset(3), 0x10_0000 + 3 * 4096);
    }

    #[test]
    fn test_exhaustion_and_slot_reuse() {
        let mut pool = StaticPool::new(0, POOL_SLOTS * 1024).unwrap();
        for expected in 0..POOL_SLOTS {
            assert_eq!(pool.allocate(1024, 1), Ok(expected));
        }
        assert_eq!(pool.allocate(1, 1), Err(AllocError::Exhausted));

        pool.free(5);
        assert_eq!(pool.allocate(1000, 1), Ok(5));
        assert_eq!(pool.used_slots(), POOL_SLOTS);
    }

    #[test]
    fn test_too_large_regardless_of_free_slots() {
        let mut pool = StaticPool::new(0, POOL_SLOTS * 1024).unwrap();
        assert_eq!(
            pool.allocate(1025, 1),
            Err(AllocError::TooLarge {
                requested: 1025,
                max: 1024
            })
        );
        assert_eq!(pool.used_slots(), 0);
    }

    #[test]
    fn test_alignment_skips_slots() {
        // 1 KiB slots, so only every fourth slot is 4 KiB aligned
        let mut pool = StaticPool::new(0, POOL_SLOTS * 1024).unwrap();
        assert_eq!(pool.allocate(16, 4096), Ok(0));
        assert_eq!(pool.allocate(16, 4096), Ok(4));
        assert_eq!(pool.allocate(16, 4096), Err(AllocError::Exhausted));
        assert_eq!(pool.allocate(16, 1), Ok(1));
    }

    #[test]
    fn test_free_is_unconditional() {
        let mut pool = StaticPool::new(0, POOL_SLOTS * 64).unwrap();
        pool.free(2);
        assert!(!pool.is_used(2));

        pool.free(POOL_SLOTS + 1);
        assert_eq!(pool.used_slots(), 0);
    }

    #[test]
    fn test_tiny_region_rejected() {
        assert!(StaticPool::new(0, POOL_SLOTS - 1).is_none());
    }
}
