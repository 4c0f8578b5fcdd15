//! Buffer object manager
//!
//! Composition root of the allocator. Picks a backend per request from the
//! requested domain, falls back toward the frame buffer tail when the kernel
//! cannot serve a request, and routes map, unmap and free back to whichever
//! backend produced the object.

use core::ptr::NonNull;

use spin::Mutex;

use crate::kernel::{KernelBackend, KernelDevice};
use crate::linear::{LinearPool, OffscreenManager, TailFreeList};
use crate::region::MappedRegion;
use crate::static_pool::StaticPool;
use crate::{
    align_up, AllocError, BackendKind, BufferObject, ConfigError, Domain, ManagerConfig,
    MapError, PITCH_ALIGNMENT,
};

/// Backends activated by `init`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendSet {
    pub linear: bool,
    /// `KernelLegacy` or `KernelGem` when a kernel backend is active
    pub kernel: Option<BackendKind>,
    pub static_pool: bool,
}

/// Live allocations of one backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub allocations: u32,
    pub bytes: u64,
}

/// Allocator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    backends: [BackendStats; 4],
    /// Kernel requests that were retried on a fallback backend
    pub fallbacks: u32,
}

impl ManagerStats {
    pub fn backend(&self, kind: BackendKind) -> BackendStats {
        self.backends[kind.index()]
    }

    pub fn live_allocations(&self) -> u32 {
        self.backends.iter().map(|b| b.allocations).sum()
    }

    pub fn live_bytes(&self) -> u64 {
        self.backends.iter().map(|b| b.bytes).sum()
    }
}

/// Builder for a manager with custom collaborators
pub struct ManagerBuilder {
    config: ManagerConfig,
    framebuffer: Option<MappedRegion>,
    agp_aperture: Option<MappedRegion>,
    kernel: Option<Box<dyn KernelDevice>>,
    offscreen: Option<Box<dyn OffscreenManager>>,
}

impl ManagerBuilder {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            framebuffer: None,
            agp_aperture: None,
            kernel: None,
            offscreen: None,
        }
    }

    /// CPU mapping of the whole frame buffer
    pub fn framebuffer(mut self, region: MappedRegion) -> Self {
        self.framebuffer = Some(region);
        self
    }

    /// CPU mapping of the AGP aperture
    ///
    /// Legacy kernel objects in `Domain::AgpLike` are mapped relative to it.
    pub fn agp_aperture(mut self, region: MappedRegion) -> Self {
        self.agp_aperture = Some(region);
        self
    }

    /// Kernel memory manager transport
    pub fn kernel_device(mut self, device: Box<dyn KernelDevice>) -> Self {
        self.kernel = Some(device);
        self
    }

    /// Replace the built-in tail free list
    pub fn offscreen_manager(mut self, manager: Box<dyn OffscreenManager>) -> Self {
        self.offscreen = Some(manager);
        self
    }

    pub fn build(self) -> Result<BufferObjectManager, ConfigError> {
        let config = self.config;
        config.validate()?;

        let (unit_start, unit_end) = config.tail_units();
        let (tail_start, tail_end) = config.tail_bytes();

        let linear = if config.linear_pool && (self.offscreen.is_some() || unit_end > unit_start) {
            let manager = self.offscreen.unwrap_or_else(|| {
                Box::new(TailFreeList::new(unit_start, unit_end)) as Box<dyn OffscreenManager>
            });
            Some(Mutex::new(LinearPool::new(manager, config.bytes_per_pixel)))
        } else {
            None
        };

        let pool = if linear.is_none() {
            let (base, size) = config
                .static_pool
                .unwrap_or((tail_start, (tail_end - tail_start) as usize));
            let pool = StaticPool::new(base, size);
            if pool.is_none() {
                log::warn!("vidmem: {} bytes too small for a static pool", size);
            }
            pool.map(Mutex::new)
        } else {
            None
        };

        let kernel = self.kernel.and_then(|device| {
            match KernelBackend::new(device, config.kernel_protocol) {
                Ok(backend) => Some(backend.with_context(config.kernel_context)),
                Err(err) => {
                    log::warn!("vidmem: kernel memory manager unavailable: {}", err);
                    None
                }
            }
        });
        let kernel_kind = kernel.as_ref().map(KernelBackend::kind);

        log::info!(
            "vidmem: tail {:#x}..{:#x}, linear={}, kernel={:?}, static={}",
            tail_start,
            tail_end,
            linear.is_some(),
            kernel_kind,
            pool.is_some()
        );

        Ok(BufferObjectManager {
            linear,
            kernel: kernel.map(Mutex::new),
            kernel_kind,
            pool,
            framebuffer: self.framebuffer,
            agp_aperture: self.agp_aperture,
            stats: Mutex::new(ManagerStats::default()),
        })
    }
}

/// Graphics memory manager
pub struct BufferObjectManager {
    linear: Option<Mutex<LinearPool>>,
    kernel: Option<Mutex<KernelBackend>>,
    kernel_kind: Option<BackendKind>,
    pool: Option<Mutex<StaticPool>>,
    framebuffer: Option<MappedRegion>,
    agp_aperture: Option<MappedRegion>,
    stats: Mutex<ManagerStats>,
}

impl BufferObjectManager {
    pub fn builder(config: ManagerConfig) -> ManagerBuilder {
        ManagerBuilder::new(config)
    }

    /// One-time setup
    ///
    /// Computes the free frame buffer tail, activates the linear pool over it
    /// (or the static pool when the linear pool is disabled or the tail is
    /// empty) and the kernel backend when a device is given.
    pub fn init(
        config: &ManagerConfig,
        framebuffer: Option<MappedRegion>,
        kernel: Option<Box<dyn KernelDevice>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ManagerBuilder::new(config.clone());
        builder.framebuffer = framebuffer;
        builder.kernel = kernel;
        builder.build()
    }

    pub fn backends(&self) -> BackendSet {
        BackendSet {
            linear: self.linear.is_some(),
            kernel: self.kernel_kind,
            static_pool: self.pool.is_some(),
        }
    }

    /// Allocate `size` bytes in `domain`
    ///
    /// Video and AGP requests go to the kernel first when one is active;
    /// any kernel failure falls back to the frame buffer tail. `Exhausted`
    /// means every applicable backend was tried. The static pool's `TooLarge`
    /// is passed through since no other backend is left to try.
    pub fn allocate(
        &self,
        size: usize,
        alignment: usize,
        domain: Domain,
    ) -> Result<BufferObject, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let alignment = alignment.max(1);
        if !alignment.is_power_of_two() {
            return Err(AllocError::BadAlignment(alignment));
        }

        #[cfg(feature = "debug-logging")]
        log::trace!(
            "vidmem: allocate {} bytes, align {}, {:?}",
            size,
            alignment,
            domain
        );

        if domain.is_kernel_managed() {
            if let Some(kernel) = &self.kernel {
                let mut kernel = kernel.lock();
                match kernel.allocate(size, alignment, domain) {
                    Ok(alloc) => {
                        let obj = BufferObject::new(
                            kernel.kind(),
                            alloc.handle,
                            alloc.offset,
                            size,
                            domain,
                            alloc.map_offset,
                        );
                        return Ok(self.track(obj));
                    }
                    Err(err) => {
                        log::warn!(
                            "vidmem: kernel allocation of {} bytes failed ({}), falling back",
                            size,
                            err
                        );
                        self.stats.lock().fallbacks += 1;
                    }
                }
            }
        }

        self.allocate_local(size, alignment, resident_domain(domain))
    }

    /// Allocate a `width` x `height` surface with an aligned pitch
    pub fn allocate_surface(
        &self,
        width: u32,
        height: u32,
        bytes_per_pixel: usize,
        domain: Domain,
    ) -> Result<BufferObject, AllocError> {
        let too_large = AllocError::TooLarge {
            requested: usize::MAX,
            max: u32::MAX as usize,
        };
        let pitch = (bytes_per_pixel as u64)
            .checked_mul(width as u64)
            .and_then(|row| align_up(row, PITCH_ALIGNMENT as u64))
            .filter(|&pitch| pitch <= u32::MAX as u64)
            .ok_or(too_large)?;
        let size = usize::try_from(pitch * height as u64).map_err(|_| AllocError::TooLarge {
            requested: usize::MAX,
            max: usize::MAX,
        })?;

        let mut obj = self.allocate(size, PITCH_ALIGNMENT, domain)?;
        obj.pitch = pitch as u32;
        Ok(obj)
    }

    /// Frame buffer tail: linear pool if active, otherwise the static pool
    fn allocate_local(
        &self,
        size: usize,
        alignment: usize,
        domain: Domain,
    ) -> Result<BufferObject, AllocError> {
        if let Some(linear) = &self.linear {
            let (handle, offset) = linear.lock().allocate(size, alignment)?;
            let obj = BufferObject::new(BackendKind::Linear, handle, offset, size, domain, offset);
            return Ok(self.track(obj));
        }

        if let Some(pool) = &self.pool {
            let mut pool = pool.lock();
            let slot = pool.allocate(size, alignment)?;
            let offset = pool.slot_offset(slot);
            let obj =
                BufferObject::new(BackendKind::Static, slot as u32, offset, size, domain, offset);
            return Ok(self.track(obj));
        }

        Err(AllocError::Exhausted)
    }

    fn track(&self, obj: BufferObject) -> BufferObject {
        if let Some(kind) = obj.owner {
            let mut stats = self.stats.lock();
            let backend = &mut stats.backends[kind.index()];
            backend.allocations += 1;
            backend.bytes += obj.size as u64;
        }
        log::debug!(
            "vidmem: {:?} handle {} at {:#x}, {} bytes",
            obj.owner,
            obj.handle,
            obj.offset,
            obj.size
        );
        obj
    }

    /// CPU pointer to the object
    ///
    /// Mapping an already mapped object returns the cached pointer without
    /// remapping.
    pub fn map(&self, obj: &mut BufferObject) -> Result<NonNull<u8>, MapError> {
        let owner = obj.owner.ok_or(MapError::Freed)?;
        if let Some(ptr) = obj.mapped {
            log::debug!("vidmem: handle {} already mapped", obj.handle);
            return Ok(ptr);
        }

        let ptr = match owner {
            BackendKind::KernelGem => {
                let kernel = self
                    .kernel
                    .as_ref()
                    .ok_or(MapError::Kernel(syscall::Error::new(syscall::ENODEV)))?;
                let region = kernel.lock().map(obj.map_offset, obj.size)?;
                let ptr = region.range(0, obj.size)?;
                obj.mapping = Some(region);
                ptr
            }
            // Legacy AGP offsets are relative to the aperture, not the frame buffer
            BackendKind::KernelLegacy if obj.domain == Domain::AgpLike => {
                let aperture = self.agp_aperture.as_ref().ok_or(MapError::NoAperture)?;
                direct_range(aperture, obj)?
            }
            BackendKind::KernelLegacy | BackendKind::Linear | BackendKind::Static => {
                let framebuffer = self.framebuffer.as_ref().ok_or(MapError::NoFramebuffer)?;
                direct_range(framebuffer, obj)?
            }
        };

        obj.mapped = Some(ptr);
        Ok(ptr)
    }

    /// Drop the CPU mapping, no-op if not mapped
    pub fn unmap(&self, obj: &mut BufferObject) {
        if obj.mapped.take().is_none() {
            return;
        }

        if let Some(region) = obj.mapping.take() {
            match &self.kernel {
                Some(kernel) => kernel.lock().unmap(region),
                None => log::warn!("vidmem: kernel mapping without kernel backend"),
            }
        }
    }

    /// Return the object's memory to its backend
    ///
    /// The object is left holding `INVALID_HANDLE` and size 0, and freeing it
    /// again returns `DoubleFree`.
    pub fn free(&self, obj: &mut BufferObject) -> Result<(), AllocError> {
        let Some(owner) = obj.owner else {
            log::error!("vidmem: double free of buffer object");
            return Err(AllocError::DoubleFree);
        };

        self.unmap(obj);

        match owner {
            BackendKind::Linear => {
                if let Some(linear) = &self.linear {
                    linear.lock().free(obj.handle);
                }
            }
            BackendKind::KernelLegacy | BackendKind::KernelGem => {
                if let Some(kernel) = &self.kernel {
                    kernel.lock().free(obj.handle, obj.domain);
                }
            }
            BackendKind::Static => {
                if let Some(pool) = &self.pool {
                    pool.lock().free(obj.handle as usize);
                }
            }
        }

        {
            let mut stats = self.stats.lock();
            let backend = &mut stats.backends[owner.index()];
            backend.allocations = backend.allocations.saturating_sub(1);
            backend.bytes = backend.bytes.saturating_sub(obj.size as u64);
        }

        log::debug!("vidmem: freed {:?} handle {}", owner, obj.handle);
        obj.invalidate();
        Ok(())
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats.lock().clone()
    }
}

/// Pointer to `obj` inside a region it lives in at `map_offset`
fn direct_range(region: &MappedRegion, obj: &BufferObject) -> Result<NonNull<u8>, MapError> {
    let offset = usize::try_from(obj.map_offset).map_err(|_| MapError::OutOfBounds {
        offset: usize::MAX,
        len: obj.size,
        limit: region.len(),
    })?;
    region.range(offset, obj.size)
}

/// Domain of memory served from the frame buffer tail
fn resident_domain(domain: Domain) -> Domain {
    match domain {
        Domain::AgpLike => Domain::Video,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{INVALID_HANDLE, POOL_SLOTS};

    fn framebuffer(backing: &mut [u8]) -> MappedRegion {
        unsafe { MappedRegion::new(backing.as_mut_ptr(), backing.len()) }.unwrap()
    }

    fn tail_manager(free_start: u64, free_end: u64, bpp: usize) -> BufferObjectManager {
        let config = ManagerConfig::new(free_start, free_end, bpp);
        BufferObjectManager::init(&config, None, None).unwrap()
    }

    #[test]
    fn test_init_picks_linear_pool() {
        let manager = tail_manager(0x1000, 0x10000, 4);
        assert_eq!(
            manager.backends(),
            BackendSet {
                linear: true,
                kernel: None,
                static_pool: false
            }
        );
    }

    #[test]
    fn test_init_static_pool_when_linear_disabled() {
        let config = ManagerConfig::new(0x1000, 0x9000, 4).linear_pool(false);
        let manager = BufferObjectManager::init(&config, None, None).unwrap();
        assert!(manager.backends().static_pool);
        assert!(!manager.backends().linear);
    }

    #[test]
    fn test_init_rejects_bad_config() {
        assert!(matches!(
            BufferObjectManager::init(&ManagerConfig::new(0, 16, 0), None, None),
            Err(ConfigError::ZeroBytesPerPixel)
        ));
    }

    #[test]
    fn test_linear_size_is_requested_size() {
        let manager = tail_manager(0, 0x10000, 4);
        let obj = manager.allocate(10, 1, Domain::System).unwrap();
        assert_eq!(obj.size(), 10);
        assert_eq!(obj.backend(), Some(BackendKind::Linear));
        assert_eq!(obj.domain(), Domain::System);
    }

    #[test]
    fn test_zero_size_and_bad_alignment() {
        let manager = tail_manager(0, 0x10000, 4);
        assert!(matches!(
            manager.allocate(0, 1, Domain::System),
            Err(AllocError::ZeroSize)
        ));
        assert!(matches!(
            manager.allocate(16, 48, Domain::System),
            Err(AllocError::BadAlignment(48))
        ));
    }

    #[test]
    fn test_free_then_allocate_reuses_capacity() {
        let manager = tail_manager(0, 0x1000, 4);

        let mut obj = manager.allocate(0x1000, 1, Domain::Video).unwrap();
        assert!(matches!(
            manager.allocate(4, 1, Domain::Video),
            Err(AllocError::Exhausted)
        ));

        manager.free(&mut obj).unwrap();
        assert!(manager.allocate(0x1000, 1, Domain::Video).is_ok());
    }

    #[test]
    fn test_static_pool_exhaustion_and_reuse() {
        let config = ManagerConfig::new(0, 0, 4).static_pool(0x8000, POOL_SLOTS * 256);
        let manager = BufferObjectManager::init(&config, None, None).unwrap();

        let mut objs: Vec<_> = (0..POOL_SLOTS)
            .map(|_| manager.allocate(256, 1, Domain::System).unwrap())
            .collect();
        assert!(matches!(
            manager.allocate(1, 1, Domain::System),
            Err(AllocError::Exhausted)
        ));

        manager.free(&mut objs[3]).unwrap();
        let reused = manager.allocate(200, 1, Domain::System).unwrap();
        assert_eq!(reused.handle(), 3);
        assert_eq!(reused.offset(), 0x8000 + 3 * 256);
    }

    #[test]
    fn test_static_pool_too_large() {
        let config = ManagerConfig::new(0, 0, 4).static_pool(0, POOL_SLOTS * 256);
        let manager = BufferObjectManager::init(&config, None, None).unwrap();
        assert_eq!(
            manager.allocate(257, 1, Domain::Video).map(|_| ()),
            Err(AllocError::TooLarge {
                requested: 257,
                max: 256
            })
        );
    }

    #[test]
    fn test_double_free_detected() {
        let manager = tail_manager(0, 0x1000, 4);
        let mut obj = manager.allocate(64, 1, Domain::System).unwrap();

        assert!(manager.free(&mut obj).is_ok());
        assert_eq!(obj.handle(), INVALID_HANDLE);
        assert_eq!(obj.size(), 0);
        assert_eq!(manager.free(&mut obj), Err(AllocError::DoubleFree));
        assert_eq!(manager.stats().live_allocations(), 0);
    }

    #[test]
    fn test_map_unmap_map_direct() {
        let mut backing = vec![0u8; 0x4000];
        let config = ManagerConfig::new(0x2000, 0x4000, 4);
        let manager =
            BufferObjectManager::init(&config, Some(framebuffer(&mut backing)), None).unwrap();

        let mut obj = manager.allocate(0x100, 16, Domain::Video).unwrap();
        let first = manager.map(&mut obj).unwrap();
        assert_eq!(
            first.as_ptr() as usize - backing.as_ptr() as usize,
            obj.offset() as usize
        );
        unsafe { first.as_ptr().write(0xAB) };

        // Second map returns the cached pointer
        assert_eq!(manager.map(&mut obj).unwrap(), first);

        manager.unmap(&mut obj);
        assert!(obj.mapped_pointer().is_none());
        let second = manager.map(&mut obj).unwrap();
        assert_eq!(unsafe { second.as_ptr().read() }, 0xAB);

        manager.free(&mut obj).unwrap();
        assert_eq!(manager.map(&mut obj), Err(MapError::Freed));
    }

    #[test]
    fn test_map_without_framebuffer() {
        let manager = tail_manager(0, 0x1000, 4);
        let mut obj = manager.allocate(64, 1, Domain::System).unwrap();
        assert_eq!(manager.map(&mut obj), Err(MapError::NoFramebuffer));

        // Never mapped, so unmap does nothing
        manager.unmap(&mut obj);
        assert!(!obj.is_mapped());
    }

    #[test]
    fn test_map_bounds_checked() {
        // Frame buffer mapping shorter than the managed range
        let mut backing = vec![0u8; 0x100];
        let manager = BufferObjectManager::init(
            &ManagerConfig::new(0, 0x1000, 4),
            Some(framebuffer(&mut backing)),
            None,
        )
        .unwrap();
        let mut obj = manager.allocate(0x200, 1, Domain::System).unwrap();
        assert!(matches!(
            manager.map(&mut obj),
            Err(MapError::OutOfBounds { .. })
        ));
        assert!(!obj.is_mapped());
    }

    #[test]
    fn test_surface_pitch() {
        let manager = tail_manager(0, 0x100000, 4);
        let obj = manager.allocate_surface(100, 10, 4, Domain::Video).unwrap();
        assert_eq!(obj.pitch(), 448);
        assert_eq!(obj.size(), 4480);
        assert_eq!(obj.offset() % PITCH_ALIGNMENT as u64, 0);
    }

    #[test]
    fn test_surface_overflow_is_too_large() {
        let manager = tail_manager(0, 0x100000, 4);
        assert!(matches!(
            manager.allocate_surface(u32::MAX, 1, usize::MAX, Domain::Video),
            Err(AllocError::TooLarge { .. })
        ));
        assert!(matches!(
            manager.allocate_surface(u32::MAX, 1, 4, Domain::Video),
            Err(AllocError::TooLarge { .. })
        ));
        assert_eq!(manager.stats().live_allocations(), 0);
    }

    #[test]
    fn test_huge_request_is_exhausted() {
        let manager = tail_manager(0x1000, 0x10000, 1);
        assert_eq!(
            manager.allocate(usize::MAX, 1, Domain::System).map(|_| ()),
            Err(AllocError::Exhausted)
        );
        // Tail is intact afterwards
        assert!(manager.allocate(0xF000, 1, Domain::System).is_ok());
    }

    #[test]
    fn test_agp_fallback_lives_in_video() {
        let manager = tail_manager(0, 0x1000, 4);
        let obj = manager.allocate(64, 1, Domain::AgpLike).unwrap();
        assert_eq!(obj.domain(), Domain::Video);
        assert_eq!(manager.stats().fallbacks, 0);
    }
}
