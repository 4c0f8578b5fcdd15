//! Graphics memory manager
//!
//! This crate hands out off-screen pixel buffers for display drivers. It
//! hides three incompatible backing stores behind one allocate/map/unmap/free
//! contract:
//!
//! - the unused tail of the frame buffer, managed in pixel units by an
//!   off-screen area manager ([`linear`])
//! - VRAM/AGP memory granted by the kernel memory manager, through either the
//!   legacy command protocol or the GEM descriptor protocol ([`kernel`])
//! - a fixed region split into equal slots, used when no linear pool exists
//!   ([`static_pool`])
//!
//! # Usage
//!
//! ```ignore
//! use vidmem::{BufferObjectManager, Domain, ManagerConfig};
//!
//! let config = ManagerConfig::new(fb_used, fb_size, 4);
//! let manager = BufferObjectManager::init(&config, Some(framebuffer), None)?;
//!
//! let mut cursor = manager.allocate(64 * 64 * 4, 256, Domain::Video)?;
//! let ptr = manager.map(&mut cursor)?;
//! // ... upload the cursor image ...
//! manager.unmap(&mut cursor);
//! manager.free(&mut cursor)?;
//! ```

pub mod config;
pub mod kernel;
pub mod linear;
pub mod manager;
pub mod region;
pub mod static_pool;
pub mod types;

// Re-exports
pub use config::ManagerConfig;
pub use kernel::{KernelBackend, KernelDevice, KernelProtocol};
pub use linear::{LinearArea, LinearPool, OffscreenManager, TailFreeList};
pub use manager::{BackendSet, BufferObjectManager, ManagerBuilder, ManagerStats};
pub use region::MappedRegion;
pub use static_pool::{StaticPool, POOL_SLOTS};
pub use types::{BackendKind, BufferObject, Domain, INVALID_HANDLE, PITCH_ALIGNMENT};

use core::fmt;

/// Allocation and free errors
#[derive(Debug, PartialEq, Eq)]
pub enum AllocError {
    /// Zero-byte request
    ZeroSize,
    /// Alignment is not a power of two
    BadAlignment(usize),
    /// No applicable backend had room
    Exhausted,
    /// Kernel granted a different size than requested
    SizeMismatch { requested: usize, granted: usize },
    /// Request exceeds the largest block the backend can offer
    TooLarge { requested: usize, max: usize },
    /// Object was already freed
    DoubleFree,
    /// Kernel transport or protocol error
    Kernel(syscall::Error),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::ZeroSize => write!(f, "Zero-sized allocation"),
            AllocError::BadAlignment(align) => {
                write!(f, "Alignment {} is not a power of two", align)
            }
            AllocError::Exhausted => write!(f, "Graphics memory exhausted"),
            AllocError::SizeMismatch { requested, granted } => write!(
                f,
                "Kernel granted {} bytes, {} requested",
                granted, requested
            ),
            AllocError::TooLarge { requested, max } => {
                write!(f, "Request of {} bytes exceeds limit of {}", requested, max)
            }
            AllocError::DoubleFree => write!(f, "Buffer object freed twice"),
            AllocError::Kernel(err) => write!(f, "Kernel memory manager: {}", err),
        }
    }
}

impl std::error::Error for AllocError {}

/// Mapping errors
#[derive(Debug, PartialEq, Eq)]
pub enum MapError {
    /// Object was freed
    Freed,
    /// No frame buffer mapping to derive a pointer from
    NoFramebuffer,
    /// Legacy AGP object without an AGP aperture mapping
    NoAperture,
    /// Range falls outside the mapped region
    OutOfBounds {
        offset: usize,
        len: usize,
        limit: usize,
    },
    /// Kernel refused the mapping
    Kernel(syscall::Error),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Freed => write!(f, "Buffer object is freed"),
            MapError::NoFramebuffer => write!(f, "No frame buffer mapping"),
            MapError::NoAperture => write!(f, "No AGP aperture mapping"),
            MapError::OutOfBounds { offset, len, limit } => write!(
                f,
                "Range {:#x}+{:#x} outside mapping of {:#x} bytes",
                offset, len, limit
            ),
            MapError::Kernel(err) => write!(f, "Kernel mapping failed: {}", err),
        }
    }
}

impl std::error::Error for MapError {}

/// Configuration errors reported by `init`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Bytes per pixel must be non-zero
    ZeroBytesPerPixel,
    /// Free range ends before it starts
    InvertedRange { start: u64, end: u64 },
    /// Static pool region cannot hold one byte per slot
    StaticPoolTooSmall { size: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroBytesPerPixel => write!(f, "Bytes per pixel is zero"),
            ConfigError::InvertedRange { start, end } => {
                write!(f, "Free range {:#x}..{:#x} is inverted", start, end)
            }
            ConfigError::StaticPoolTooSmall { size } => write!(
                f,
                "Static pool of {} bytes cannot hold {} slots",
                size, POOL_SLOTS
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Round `value` up to a multiple of `align` (power of two), `None` on overflow
pub(crate) const fn align_up(value: u64, align: u64) -> Option<u64> {
    match value.checked_add(align - 1) {
        Some(value) => Some(value & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), Some(0));
        assert_eq!(align_up(400, 64), Some(448));
        assert_eq!(align_up(448, 64), Some(448));
        assert_eq!(align_up(u64::MAX - 2, 64), None);
    }
}
