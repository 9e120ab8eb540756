//! Random-access byte storage, consumed by `ess` as an external contract.
//!
//! This mirrors the shape of `gpcc::StdIf::IRandomAccessStorage`: a flat address space
//! of `size` bytes, an optional `page_size` (0 = "no page constraint"), and read/write
//! primitives. `write_and_check` additionally reads back what it just wrote so callers
//! can detect an unstable/volatile storage cell without having to issue two calls.

use std::io;
use thiserror::Error;

pub mod file;
pub mod memory;
pub mod torn;

pub use file::FileDevice;
pub use memory::MemoryDevice;
pub use torn::TornWriteDevice;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("address {addr} + length {len} exceeds device size {size}")]
    OutOfRange { addr: u64, len: usize, size: u64 },

    #[error("read-back after write did not match (addr {addr})")]
    ReadBackMismatch { addr: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Contract for the underlying storage device (§6.2).
///
/// Implementations must satisfy one of the two power-fail-safety models described in
/// `spec.md` §6.2: either page writes are atomic (all-or-nothing), or a page write
/// that is interrupted leaves a strictly-ascending-address prefix durably written and
/// nothing beyond it.
pub trait BlockDevice {
    /// Total size of the device in bytes.
    fn size(&self) -> u64;

    /// Page size in bytes, or 0 if the device has no page-write constraint.
    fn page_size(&self) -> u32;

    /// Reads `buf.len()` bytes starting at `addr`.
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Writes `buf` starting at `addr`.
    fn write(&mut self, addr: u64, buf: &[u8]) -> Result<(), DeviceError>;

    /// Writes `buf` starting at `addr`, then reads the same range back and compares.
    ///
    /// Returns [`DeviceError::ReadBackMismatch`] if the two differ. This is the
    /// primitive `BlockAccessor::store_block` relies on to detect volatile storage
    /// cells (§4.1 "write-and-verify").
    fn write_and_check(&mut self, addr: u64, buf: &[u8]) -> Result<(), DeviceError> {
        self.write(addr, buf)?;
        let mut check = vec![0u8; buf.len()];
        self.read(addr, &mut check)?;
        if check != buf {
            return Err(DeviceError::ReadBackMismatch { addr });
        }
        Ok(())
    }
}

pub(crate) fn check_range(size: u64, addr: u64, len: usize) -> Result<(), DeviceError> {
    let end = addr
        .checked_add(len as u64)
        .ok_or(DeviceError::OutOfRange { addr, len, size })?;
    if end > size {
        return Err(DeviceError::OutOfRange { addr, len, size });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Toy(Vec<u8>);
    impl BlockDevice for Toy {
        fn size(&self) -> u64 {
            self.0.len() as u64
        }
        fn page_size(&self) -> u32 {
            0
        }
        fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
            check_range(self.size(), addr, buf.len())?;
            buf.copy_from_slice(&self.0[addr as usize..addr as usize + buf.len()]);
            Ok(())
        }
        fn write(&mut self, addr: u64, buf: &[u8]) -> Result<(), DeviceError> {
            check_range(self.size(), addr, buf.len())?;
            self.0[addr as usize..addr as usize + buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    #[test]
    fn default_write_and_check_succeeds_on_honest_device() {
        let mut dev = Toy(vec![0u8; 16]);
        dev.write_and_check(4, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        dev.read(4, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let mut dev = Toy(vec![0u8; 16]);
        assert!(matches!(
            dev.read(14, &mut [0u8; 4]),
            Err(DeviceError::OutOfRange { .. })
        ));
    }
}
