use std::io;

use crate::{BlockDevice, DeviceError};

/// Wraps a [`BlockDevice`] and simulates power loss partway through a write.
///
/// A budget of bytes-still-writable is tracked across the device's lifetime. Once a
/// `write` call would exceed the budget, only the prefix of the buffer that fits is
/// actually written (in ascending address order, as required by the sequential-write
/// power-fail model in `spec.md` §6.2) and the call returns an I/O error, exactly as
/// if the underlying medium had lost power mid-write. This is the Rust analogue of the
/// original implementation's `FakeEEPROMUndo` test double.
///
/// Used only by `ess`'s crash-atomicity tests (P3/P4 in `spec.md` §8); never used by
/// the `ess-cli` binary.
pub struct TornWriteDevice<D> {
    inner: D,
    budget: Option<u64>,
    tripped: bool,
}

impl<D: BlockDevice> TornWriteDevice<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            budget: None,
            tripped: false,
        }
    }

    /// Fail (truncate) the write that would push total bytes-written past `n`.
    pub fn trip_after(mut self, n: u64) -> Self {
        self.budget = Some(n);
        self
    }

    pub fn tripped(&self) -> bool {
        self.tripped
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    pub fn inner_mut(&mut self) -> &mut D {
        &mut self.inner
    }
}

impl<D: BlockDevice> BlockDevice for TornWriteDevice<D> {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn page_size(&self) -> u32 {
        self.inner.page_size()
    }

    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.inner.read(addr, buf)
    }

    fn write(&mut self, addr: u64, buf: &[u8]) -> Result<(), DeviceError> {
        if self.tripped {
            return Err(DeviceError::Io(io::Error::new(
                io::ErrorKind::Other,
                "device already tripped by a simulated power loss",
            )));
        }
        match self.budget {
            None => self.inner.write(addr, buf),
            Some(remaining) if (buf.len() as u64) <= remaining => {
                self.budget = Some(remaining - buf.len() as u64);
                self.inner.write(addr, buf)
            }
            Some(remaining) => {
                let n = remaining as usize;
                if n > 0 {
                    self.inner.write(addr, &buf[..n])?;
                }
                self.budget = Some(0);
                self.tripped = true;
                Err(DeviceError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "simulated power loss mid-write",
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryDevice;

    #[test]
    fn truncates_write_once_budget_is_exhausted() {
        let mut dev = TornWriteDevice::new(MemoryDevice::new(64)).trip_after(2);
        let err = dev.write(0, &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, DeviceError::Io(_)));
        let mut buf = [0u8; 4];
        dev.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 0, 0]);
        assert!(dev.tripped());
    }

    #[test]
    fn untripped_device_behaves_honestly() {
        let mut dev = TornWriteDevice::new(MemoryDevice::new(64));
        dev.write(0, &[9, 9, 9]).unwrap();
        let mut buf = [0u8; 3];
        dev.read(0, &mut buf).unwrap();
        assert_eq!(buf, [9, 9, 9]);
    }
}
