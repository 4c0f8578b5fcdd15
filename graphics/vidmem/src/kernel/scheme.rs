//! Kernel memory manager reached through a scheme file

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

use syscall::{MapFlags, EIO};

use super::KernelDevice;
use crate::region::MappedRegion;

/// Scheme-backed kernel transport
///
/// Each ioctl writes the command word followed by the record and reads the
/// reply record back.
pub struct SchemeDevice {
    file: File,
}

impl SchemeDevice {
    pub fn open(path: &str) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        log::info!("vidmem: opened kernel memory manager at {}", path);
        Ok(Self { file })
    }
}

fn io_error(err: io::Error) -> syscall::Error {
    syscall::Error::new(err.raw_os_error().unwrap_or(EIO))
}

impl KernelDevice for SchemeDevice {
    fn ioctl(&mut self, command: u32, data: &mut [u8]) -> syscall::Result<()> {
        let mut packet = Vec::with_capacity(4 + data.len());
        packet.extend_from_slice(&command.to_le_bytes());
        packet.extend_from_slice(data);

        self.file.write_all(&packet).map_err(io_error)?;
        self.file.read_exact(data).map_err(io_error)
    }

    fn mmap(&mut self, map_offset: u64, len: usize) -> syscall::Result<MappedRegion> {
        let map = syscall::Map {
            offset: map_offset as usize,
            size: len,
            flags: MapFlags::PROT_READ | MapFlags::PROT_WRITE | MapFlags::MAP_SHARED,
            address: 0,
        };
        let address = unsafe { syscall::fmap(self.file.as_raw_fd() as usize, &map)? };

        unsafe { MappedRegion::new(address as *mut u8, len) }.ok_or(syscall::Error::new(EIO))
    }

    fn munmap(&mut self, region: MappedRegion) -> syscall::Result<()> {
        unsafe { syscall::funmap(region.as_ptr() as usize, region.len())? };
        Ok(())
    }
}
