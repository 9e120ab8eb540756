use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::{check_range, BlockDevice, DeviceError};

/// File-backed device, used by the `ess-cli` demo binary so the section system
/// actually persists across process invocations.
pub struct FileDevice {
    file: File,
    size: u64,
    page_size: u32,
}

impl FileDevice {
    /// Opens (and, if necessary, zero-extends) `path` to exactly `size` bytes.
    pub fn open(path: impl AsRef<Path>, size: u64, page_size: u32) -> Result<Self, DeviceError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let existing = file.metadata()?.len();
        if existing < size {
            file.set_len(size)?;
        }
        Ok(Self {
            file,
            size,
            page_size,
        })
    }
}

impl BlockDevice for FileDevice {
    fn size(&self) -> u64 {
        self.size
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        check_range(self.size, addr, buf.len())?;
        self.file.seek(SeekFrom::Start(addr))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, addr: u64, buf: &[u8]) -> Result<(), DeviceError> {
        check_range(self.size, addr, buf.len())?;
        self.file.seek(SeekFrom::Start(addr))?;
        self.file.write_all(buf)?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn round_trips_through_a_real_file() {
        let tmp = NamedTempFile::new().unwrap();
        let mut dev = FileDevice::open(tmp.path(), 4096, 0).unwrap();
        dev.write(128, b"hello").unwrap();
        let mut buf = [0u8; 5];
        dev.read(128, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
