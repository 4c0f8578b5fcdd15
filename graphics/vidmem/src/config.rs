//! Manager configuration

use crate::{ConfigError, KernelProtocol, POOL_SLOTS};

/// Parameters for [`BufferObjectManager::init`](crate::BufferObjectManager::init)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// First frame buffer byte not used by the visible screen
    pub free_start: u64,
    /// End of frame buffer memory
    pub free_end: u64,
    /// Bytes per pixel of the screen format
    pub bytes_per_pixel: usize,
    /// Activate the linear pool over the tail
    pub linear_pool: bool,
    /// Static pool region (base, size), defaults to the tail
    pub static_pool: Option<(u64, usize)>,
    /// Kernel protocol to speak when a kernel device is present
    pub kernel_protocol: KernelProtocol,
    /// Context id for legacy kernel requests
    pub kernel_context: u32,
}

impl ManagerConfig {
    /// Create a config for the free tail `free_start..free_end`
    pub fn new(free_start: u64, free_end: u64, bytes_per_pixel: usize) -> Self {
        Self {
            free_start,
            free_end,
            bytes_per_pixel,
            linear_pool: true,
            static_pool: None,
            kernel_protocol: KernelProtocol::Auto,
            kernel_context: 0,
        }
    }

    /// Enable or disable the linear pool
    pub fn linear_pool(mut self, enabled: bool) -> Self {
        self.linear_pool = enabled;
        self
    }

    /// Place the static pool at a fixed region
    pub fn static_pool(mut self, base: u64, size: usize) -> Self {
        self.static_pool = Some((base, size));
        self
    }

    /// Set kernel protocol
    pub fn kernel_protocol(mut self, protocol: KernelProtocol) -> Self {
        self.kernel_protocol = protocol;
        self
    }

    /// Set legacy kernel context id
    pub fn kernel_context(mut self, context: u32) -> Self {
        self.kernel_context = context;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bytes_per_pixel == 0 {
            return Err(ConfigError::ZeroBytesPerPixel);
        }
        if self.free_end < self.free_start {
            return Err(ConfigError::InvertedRange {
                start: self.free_start,
                end: self.free_end,
            });
        }
        if let Some((_, size)) = self.static_pool {
            if size < POOL_SLOTS {
                return Err(ConfigError::StaticPoolTooSmall { size });
            }
        }
        Ok(())
    }

    /// Tail in pixel units, start rounded up to a whole pixel
    pub fn tail_units(&self) -> (usize, usize) {
        let bpp = self.bytes_per_pixel.max(1) as u64;
        let start = self.free_start.div_ceil(bpp);
        let end = (self.free_end / bpp).max(start);
        (start as usize, end as usize)
    }

    /// Tail in bytes, start rounded up to a whole pixel
    pub fn tail_bytes(&self) -> (u64, u64) {
        let bpp = self.bytes_per_pixel.max(1) as u64;
        let start = self.free_start.div_ceil(bpp) * bpp;
        (start, self.free_end.max(start))
    }
}
