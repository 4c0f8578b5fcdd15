//! Buffer object and domain types

use core::ptr::NonNull;

use crate::region::MappedRegion;

/// Handle value written into a freed buffer object
pub const INVALID_HANDLE: u32 = u32::MAX;

/// Row stride alignment for surfaces
pub const PITCH_ALIGNMENT: usize = 64;

/// Address space a buffer lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// System memory, served from the linear frame buffer tail
    System,
    /// Video RAM
    Video,
    /// AGP-like shared memory
    AgpLike,
}

impl Domain {
    /// Check if the kernel memory manager can serve this domain
    pub fn is_kernel_managed(&self) -> bool {
        matches!(self, Domain::Video | Domain::AgpLike)
    }
}

/// Backend that owns a buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Off-screen area of the frame buffer tail
    Linear,
    /// Kernel memory manager, legacy command protocol
    KernelLegacy,
    /// Kernel memory manager, GEM descriptor protocol
    KernelGem,
    /// Fixed slot pool
    Static,
}

impl BackendKind {
    /// Index into per-backend tables
    pub(crate) fn index(&self) -> usize {
        match self {
            BackendKind::Linear => 0,
            BackendKind::KernelLegacy => 1,
            BackendKind::KernelGem => 2,
            BackendKind::Static => 3,
        }
    }

    /// Whether CPU access goes through a kernel-provided mapping
    pub fn maps_through_kernel(&self) -> bool {
        matches!(self, BackendKind::KernelGem)
    }
}

/// Uniform buffer object handle
///
/// Returned by [`BufferObjectManager::allocate`](crate::BufferObjectManager::allocate)
/// whichever backend satisfied the request. The owning backend is recorded
/// internally and every later map, unmap and free dispatches on it.
#[derive(Debug)]
pub struct BufferObject {
    pub(crate) handle: u32,
    pub(crate) offset: u64,
    pub(crate) pitch: u32,
    pub(crate) size: usize,
    pub(crate) domain: Domain,
    pub(crate) owner: Option<BackendKind>,
    pub(crate) map_offset: u64,
    pub(crate) mapped: Option<NonNull<u8>>,
    /// Kernel mapping held between map and unmap (GEM objects only)
    pub(crate) mapping: Option<MappedRegion>,
}

impl BufferObject {
    pub(crate) fn new(
        owner: BackendKind,
        handle: u32,
        offset: u64,
        size: usize,
        domain: Domain,
        map_offset: u64,
    ) -> Self {
        Self {
            handle,
            offset,
            pitch: 0,
            size,
            domain,
            owner: Some(owner),
            map_offset,
            mapped: None,
            mapping: None,
        }
    }

    /// Backend-defined identifier, `INVALID_HANDLE` once freed
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Byte offset within the domain's address space
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Row stride in bytes, 0 when not a surface
    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    /// Requested size in bytes, 0 once freed
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Owning backend, `None` once freed
    pub fn backend(&self) -> Option<BackendKind> {
        self.owner
    }

    /// Base used to derive the CPU pointer
    pub fn map_offset(&self) -> u64 {
        self.map_offset
    }

    /// CPU pointer, valid only between map and unmap
    pub fn mapped_pointer(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    pub fn is_freed(&self) -> bool {
        self.owner.is_none()
    }

    /// Write the freed sentinel
    pub(crate) fn invalidate(&mut self) {
        self.handle = INVALID_HANDLE;
        self.size = 0;
        self.owner = None;
        self.mapped = None;
        self.mapping = None;
    }
}
