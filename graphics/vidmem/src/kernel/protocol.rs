//! Kernel memory manager protocol definitions
//!
//! Every request is a fixed-layout little-endian record exchanged in place:
//! the driver encodes the request fields, the kernel overwrites the reply
//! fields in the same buffer.

use bitflags::bitflags;

use crate::Domain;

/// Largest record in the protocol
pub const MAX_RECORD_SIZE: usize = 40;

/// First kernel version that speaks the GEM protocol
pub const GEM_MIN_VERSION: (u32, u32) = (2, 0);

/// Command codes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    GetVersion = 0x0000,

    // Legacy command protocol
    LegacyAlloc = 0x0010,
    LegacyFree,

    // GEM descriptor protocol
    GemCreate = 0x0040,
    GemClose,
}

/// Legacy memory type tag
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum LegacyMemType {
    Video = 0,
    Agp = 1,
}

impl LegacyMemType {
    pub fn for_domain(domain: Domain) -> Self {
        match domain {
            Domain::AgpLike => LegacyMemType::Agp,
            Domain::Video | Domain::System => LegacyMemType::Video,
        }
    }
}

bitflags! {
    /// GEM placement domains
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GemDomain: u32 {
        /// Object in VRAM
        const VRAM = 1 << 0;
        /// Object in the GART/AGP aperture
        const GTT = 1 << 1;
        /// Object in system memory
        const SYSTEM = 1 << 2;
        /// Object must be CPU mappable
        const CPU_ACCESS = 1 << 3;
    }
}

impl GemDomain {
    pub fn for_domain(domain: Domain) -> Self {
        match domain {
            Domain::Video => GemDomain::VRAM | GemDomain::CPU_ACCESS,
            Domain::AgpLike => GemDomain::GTT | GemDomain::CPU_ACCESS,
            Domain::System => GemDomain::SYSTEM | GemDomain::CPU_ACCESS,
        }
    }
}

/// Record exchanged through `KernelDevice::ioctl`
pub trait Record: Sized {
    const COMMAND: Command;
    const SIZE: usize;

    fn encode(&self, buf: &mut [u8]);

    fn decode(buf: &[u8]) -> Self;
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Version query reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl VersionInfo {
    pub fn supports_gem(&self) -> bool {
        (self.major, self.minor) >= GEM_MIN_VERSION
    }
}

impl Record for VersionInfo {
    const COMMAND: Command = Command::GetVersion;
    const SIZE: usize = 12;

    fn encode(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.major);
        put_u32(buf, 4, self.minor);
        put_u32(buf, 8, self.patch);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            major: get_u32(buf, 0),
            minor: get_u32(buf, 4),
            patch: get_u32(buf, 8),
        }
    }
}

/// Legacy allocation request
///
/// The kernel fills in `offset`, `index` and the granted `size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyAlloc {
    pub context: u32,
    pub mem_type: u32,
    pub size: u64,
    pub alignment: u64,
    pub offset: u64,
    pub index: u32,
}

impl LegacyAlloc {
    pub fn new(context: u32, mem_type: LegacyMemType, size: u64, alignment: u64) -> Self {
        Self {
            context,
            mem_type: mem_type as u32,
            size,
            alignment,
            offset: 0,
            index: 0,
        }
    }
}

impl Record for LegacyAlloc {
    const COMMAND: Command = Command::LegacyAlloc;
    const SIZE: usize = 40;

    fn encode(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.context);
        put_u32(buf, 4, self.mem_type);
        put_u64(buf, 8, self.size);
        put_u64(buf, 16, self.alignment);
        put_u64(buf, 24, self.offset);
        put_u32(buf, 32, self.index);
        put_u32(buf, 36, 0);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            context: get_u32(buf, 0),
            mem_type: get_u32(buf, 4),
            size: get_u64(buf, 8),
            alignment: get_u64(buf, 16),
            offset: get_u64(buf, 24),
            index: get_u32(buf, 32),
        }
    }
}

/// Legacy free request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyFree {
    pub context: u32,
    pub mem_type: u32,
    pub index: u32,
}

impl Record for LegacyFree {
    const COMMAND: Command = Command::LegacyFree;
    const SIZE: usize = 16;

    fn encode(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.context);
        put_u32(buf, 4, self.mem_type);
        put_u32(buf, 8, self.index);
        put_u32(buf, 12, 0);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            context: get_u32(buf, 0),
            mem_type: get_u32(buf, 4),
            index: get_u32(buf, 8),
        }
    }
}

/// GEM object creation request
///
/// The kernel fills in `handle`, `offset`, `map_handle` and the granted
/// `size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemCreate {
    pub domains: u32,
    pub handle: u32,
    pub size: u64,
    pub alignment: u64,
    pub offset: u64,
    pub map_handle: u64,
}

impl GemCreate {
    pub fn new(domains: GemDomain, size: u64, alignment: u64) -> Self {
        Self {
            domains: domains.bits(),
            handle: 0,
            size,
            alignment,
            offset: 0,
            map_handle: 0,
        }
    }
}

impl Record for GemCreate {
    const COMMAND: Command = Command::GemCreate;
    const SIZE: usize = 40;

    fn encode(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.domains);
        put_u32(buf, 4, self.handle);
        put_u64(buf, 8, self.size);
        put_u64(buf, 16, self.alignment);
        put_u64(buf, 24, self.offset);
        put_u64(buf, 32, self.map_handle);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            domains: get_u32(buf, 0),
            handle: get_u32(buf, 4),
            size: get_u64(buf, 8),
            alignment: get_u64(buf, 16),
            offset: get_u64(buf, 24),
            map_handle: get_u64(buf, 32),
        }
    }
}

/// GEM handle close request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemClose {
    pub handle: u32,
}

impl Record for GemClose {
    const COMMAND: Command = Command::GemClose;
    const SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.handle);
        put_u32(buf, 4, 0);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            handle: get_u32(buf, 0),
        }
    }
}
