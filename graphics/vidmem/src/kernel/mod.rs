//! Kernel memory manager backend
//!
//! Video and AGP memory can be granted by the kernel memory manager. Two
//! protocol generations exist: the legacy command protocol, which hands back
//! an index and an offset inside the frame buffer, and the GEM descriptor
//! protocol, which hands back a handle plus a token for mapping the object
//! into the process. One protocol is picked when the backend is created and
//! used for every object it allocates.

pub mod protocol;
#[cfg(target_os = "redox")]
pub mod scheme;

use crate::region::MappedRegion;
use crate::{AllocError, BackendKind, Domain, MapError};

use protocol::{
    GemClose, GemCreate, GemDomain, LegacyAlloc, LegacyFree, LegacyMemType, Record, VersionInfo,
    MAX_RECORD_SIZE,
};
use syscall::error::{ENOMEM, ENOSPC};

#[cfg(target_os = "redox")]
pub use scheme::SchemeDevice;

/// Transport to the kernel memory manager
///
/// Calls are synchronous and bounded. `ioctl` exchanges one record in place.
pub trait KernelDevice: Send {
    /// Issue `command`, `data` holds the request on entry and the reply on return
    fn ioctl(&mut self, command: u32, data: &mut [u8]) -> syscall::Result<()>;

    /// Map `len` bytes of the object behind `map_offset` into the process
    fn mmap(&mut self, map_offset: u64, len: usize) -> syscall::Result<MappedRegion>;

    /// Release a mapping returned by `mmap`
    fn munmap(&mut self, region: MappedRegion) -> syscall::Result<()>;
}

/// Protocol selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelProtocol {
    /// Legacy command protocol
    Legacy,
    /// GEM descriptor protocol
    Gem,
    /// Ask the kernel for its version and pick the newest supported protocol
    #[default]
    Auto,
}

/// Result of a kernel allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelAllocation {
    pub handle: u32,
    pub offset: u64,
    pub map_offset: u64,
}

/// Protocol resolved at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Generation {
    Legacy,
    Gem,
}

/// Kernel allocation backend
pub struct KernelBackend {
    device: Box<dyn KernelDevice>,
    generation: Generation,
    context: u32,
}

impl KernelBackend {
    /// Create the backend, resolving `Auto` with a version query
    pub fn new(
        mut device: Box<dyn KernelDevice>,
        protocol: KernelProtocol,
    ) -> syscall::Result<Self> {
        let generation = match protocol {
            KernelProtocol::Legacy => Generation::Legacy,
            KernelProtocol::Gem => Generation::Gem,
            KernelProtocol::Auto => {
                let version = call(device.as_mut(), VersionInfo::default())?;
                log::info!(
                    "vidmem: kernel memory manager {}.{}.{}",
                    version.major,
                    version.minor,
                    version.patch
                );
                if version.supports_gem() {
                    Generation::Gem
                } else {
                    Generation::Legacy
                }
            }
        };

        Ok(Self {
            device,
            generation,
            context: 0,
        })
    }

    /// Set the context id carried by legacy requests
    pub fn with_context(mut self, context: u32) -> Self {
        self.context = context;
        self
    }

    /// `KernelLegacy` or `KernelGem`
    pub fn kind(&self) -> BackendKind {
        match self.generation {
            Generation::Legacy => BackendKind::KernelLegacy,
            Generation::Gem => BackendKind::KernelGem,
        }
    }

    /// Allocate exactly `size` bytes in `domain`
    ///
    /// A grant of any other size is released again and reported as
    /// `SizeMismatch`.
    pub fn allocate(
        &mut self,
        size: usize,
        alignment: usize,
        domain: Domain,
    ) -> Result<KernelAllocation, AllocError> {
        match self.generation {
            Generation::Gem => {
                let request = GemCreate::new(
                    GemDomain::for_domain(domain),
                    size as u64,
                    alignment as u64,
                );
                let reply = call(self.device.as_mut(), request).map_err(alloc_error)?;

                if reply.size != size as u64 {
                    self.free(reply.handle, domain);
                    return Err(AllocError::SizeMismatch {
                        requested: size,
                        granted: reply.size as usize,
                    });
                }

                Ok(KernelAllocation {
                    handle: reply.handle,
                    offset: reply.offset,
                    map_offset: reply.map_handle,
                })
            }
            Generation::Legacy => {
                let request = LegacyAlloc::new(
                    self.context,
                    LegacyMemType::for_domain(domain),
                    size as u64,
                    alignment as u64,
                );
                let reply = call(self.device.as_mut(), request).map_err(alloc_error)?;

                if reply.size != size as u64 {
                    self.free(reply.index, domain);
                    return Err(AllocError::SizeMismatch {
                        requested: size,
                        granted: reply.size as usize,
                    });
                }

                Ok(KernelAllocation {
                    handle: reply.index,
                    offset: reply.offset,
                    map_offset: reply.offset,
                })
            }
        }
    }

    /// Release `handle`
    ///
    /// Best effort: the kernel reclaims everything when the process exits, so
    /// a failure is only logged.
    pub fn free(&mut self, handle: u32, domain: Domain) {
        let result = match self.generation {
            Generation::Gem => call(self.device.as_mut(), GemClose { handle }).map(|_| ()),
            Generation::Legacy => call(
                self.device.as_mut(),
                LegacyFree {
                    context: self.context,
                    mem_type: LegacyMemType::for_domain(domain) as u32,
                    index: handle,
                },
            )
            .map(|_| ()),
        };

        if let Err(err) = result {
            log::warn!("vidmem: kernel free of handle {} failed: {}", handle, err);
        }
    }

    /// Map a GEM object into the process
    pub fn map(&mut self, map_offset: u64, size: usize) -> Result<MappedRegion, MapError> {
        let region = self
            .device
            .mmap(map_offset, size)
            .map_err(MapError::Kernel)?;

        if region.len() < size {
            let limit = region.len();
            self.unmap(region);
            return Err(MapError::OutOfBounds {
                offset: 0,
                len: size,
                limit,
            });
        }

        Ok(region)
    }

    pub fn unmap(&mut self, region: MappedRegion) {
        if let Err(err) = self.device.munmap(region) {
            log::warn!("vidmem: kernel unmap failed: {}", err);
        }
    }
}

/// Exchange one record with the kernel
fn call<R: Record>(device: &mut dyn KernelDevice, record: R) -> syscall::Result<R> {
    let mut buf = [0u8; MAX_RECORD_SIZE];
    let buf = &mut buf[..R::SIZE];
    record.encode(buf);
    device.ioctl(R::COMMAND as u32, buf)?;
    Ok(R::decode(buf))
}

fn alloc_error(err: syscall::Error) -> AllocError {
    match err.errno {
        ENOMEM | ENOSPC => AllocError::Exhausted,
        _ => AllocError::Kernel(err),
    }
}

#[cfg(test)]
mod tests {
    use super::protocol::Command;
    use super::*;
    use std::sync::{Arc, Mutex};
    use syscall::error::{EINVAL, ENOSYS};

    #[derive(Default)]
    struct Log {
        commands: Vec<u32>,
        closed: Vec<u32>,
    }

    /// Bump-allocating kernel stand-in
    struct FakeKernel {
        version: (u32, u32),
        next_offset: u64,
        capacity: u64,
        /// Grant this size instead of the requested one
        grant: Option<u64>,
        log: Arc<Mutex<Log>>,
        memory: Vec<u8>,
    }

    impl FakeKernel {
        fn new(version: (u32, u32)) -> (Self, Arc<Mutex<Log>>) {
            let log = Arc::new(Mutex::new(Log::default()));
            let kernel = Self {
                version,
                next_offset: 0,
                capacity: 0x10000,
                grant: None,
                log: log.clone(),
                memory: vec![0; 0x10000],
            };
            (kernel, log)
        }

        fn reserve(&mut self, size: u64) -> syscall::Result<u64> {
            let granted = self.grant.unwrap_or(size);
            if self.next_offset + granted > self.capacity {
                return Err(syscall::Error::new(ENOMEM));
            }
            let offset = self.next_offset;
            self.next_offset += granted;
            Ok(offset)
        }
    }

    impl KernelDevice for FakeKernel {
        fn ioctl(&mut self, command: u32, data: &mut [u8]) -> syscall::Result<()> {
            self.log.lock().unwrap().commands.push(command);
            if command == Command::GetVersion as u32 {
                VersionInfo {
                    major: self.version.0,
                    minor: self.version.1,
                    patch: 0,
                }
                .encode(data);
            } else if command == Command::GemCreate as u32 {
                if self.version < protocol::GEM_MIN_VERSION {
                    return Err(syscall::Error::new(ENOSYS));
                }
                let mut req = GemCreate::decode(data);
                req.offset = self.reserve(req.size)?;
                req.size = self.grant.unwrap_or(req.size);
                req.handle = req.offset as u32 / 0x100 + 1;
                req.map_handle = req.offset;
                req.encode(data);
            } else if command == Command::LegacyAlloc as u32 {
                let mut req = LegacyAlloc::decode(data);
                req.offset = self.reserve(req.size)?;
                req.size = self.grant.unwrap_or(req.size);
                req.index = req.offset as u32 / 0x100 + 1;
                req.encode(data);
            } else if command == Command::GemClose as u32 {
                self.log.lock().unwrap().closed.push(GemClose::decode(data).handle);
            } else if command == Command::LegacyFree as u32 {
                self.log.lock().unwrap().closed.push(LegacyFree::decode(data).index);
            } else {
                return Err(syscall::Error::new(EINVAL));
            }
            Ok(())
        }

        fn mmap(&mut self, map_offset: u64, len: usize) -> syscall::Result<MappedRegion> {
            let start = map_offset as usize;
            if start + len > self.memory.len() {
                return Err(syscall::Error::new(EINVAL));
            }
            unsafe { MappedRegion::new(self.memory.as_mut_ptr().add(start), len) }
                .ok_or(syscall::Error::new(EINVAL))
        }

        fn munmap(&mut self, _region: MappedRegion) -> syscall::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_auto_picks_gem_on_new_kernel() {
        let (kernel, _) = FakeKernel::new((2, 1));
        let backend = KernelBackend::new(Box::new(kernel), KernelProtocol::Auto).unwrap();
        assert_eq!(backend.kind(), BackendKind::KernelGem);
    }

    #[test]
    fn test_auto_falls_back_to_legacy() {
        let (kernel, _) = FakeKernel::new((1, 4));
        let backend = KernelBackend::new(Box::new(kernel), KernelProtocol::Auto).unwrap();
        assert_eq!(backend.kind(), BackendKind::KernelLegacy);
    }

    #[test]
    fn test_explicit_protocol_skips_version_query() {
        let (kernel, log) = FakeKernel::new((2, 0));
        let backend = KernelBackend::new(Box::new(kernel), KernelProtocol::Legacy).unwrap();
        assert_eq!(backend.kind(), BackendKind::KernelLegacy);
        assert!(log.lock().unwrap().commands.is_empty());
    }

    #[test]
    fn test_gem_allocation_carries_map_token() {
        let (kernel, _) = FakeKernel::new((2, 0));
        let mut backend = KernelBackend::new(Box::new(kernel), KernelProtocol::Gem).unwrap();

        backend.allocate(0x100, 0x100, Domain::Video).unwrap();
        let second = backend.allocate(0x200, 0x100, Domain::Video).unwrap();
        assert_eq!(second.offset, 0x100);
        assert_eq!(second.map_offset, 0x100);

        let region = backend.map(second.map_offset, 0x200).unwrap();
        assert_eq!(region.len(), 0x200);
        backend.unmap(region);
    }

    #[test]
    fn test_size_mismatch_releases_grant() {
        let (mut kernel, log) = FakeKernel::new((2, 0));
        kernel.grant = Some(0x800);
        let mut backend = KernelBackend::new(Box::new(kernel), KernelProtocol::Gem).unwrap();

        assert_eq!(
            backend.allocate(0x1000, 0x100, Domain::AgpLike),
            Err(AllocError::SizeMismatch {
                requested: 0x1000,
                granted: 0x800
            })
        );
        assert_eq!(log.lock().unwrap().closed, vec![1]);
    }

    #[test]
    fn test_legacy_size_mismatch() {
        let (mut kernel, log) = FakeKernel::new((1, 0));
        kernel.grant = Some(0x2000);
        let mut backend = KernelBackend::new(Box::new(kernel), KernelProtocol::Legacy).unwrap();

        assert!(matches!(
            backend.allocate(0x1000, 16, Domain::Video),
            Err(AllocError::SizeMismatch { .. })
        ));
        assert_eq!(log.lock().unwrap().closed.len(), 1);
    }

    #[test]
    fn test_out_of_memory_is_exhausted() {
        let (kernel, _) = FakeKernel::new((1, 0));
        let mut backend = KernelBackend::new(Box::new(kernel), KernelProtocol::Legacy).unwrap();
        assert_eq!(
            backend.allocate(0x20000, 16, Domain::Video),
            Err(AllocError::Exhausted)
        );
    }

    #[test]
    fn test_protocol_error_is_reported() {
        // Old kernel without GEM support rejects the command
        let (kernel, _) = FakeKernel::new((1, 0));
        let mut backend = KernelBackend::new(Box::new(kernel), KernelProtocol::Gem).unwrap();
        assert_eq!(
            backend.allocate(0x100, 16, Domain::Video),
            Err(AllocError::Kernel(syscall::Error::new(ENOSYS)))
        );
    }

    #[test]
    fn test_free_uses_protocol_of_backend() {
        let (kernel, log) = FakeKernel::new((2, 0));
        let mut backend = KernelBackend::new(Box::new(kernel), KernelProtocol::Gem).unwrap();
        let alloc = backend.allocate(0x100, 16, Domain::Video).unwrap();
        backend.free(alloc.handle, Domain::Video);

        let log = log.lock().unwrap();
        assert_eq!(log.commands.last(), Some(&(Command::GemClose as u32)));
        assert_eq!(log.closed, vec![alloc.handle]);
    }
}
