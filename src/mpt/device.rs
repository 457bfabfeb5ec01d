//! Byte-addressable backing stores (§3.1).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// An opaque byte-addressable backing store: a file, partition, or raw block
/// device. The pool only ever does positioned reads/writes, never relying on
/// a shared file cursor, so a `Device` implementation need not be `Seek`.
pub trait Device: Send + Sync {
    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write exactly `buf` starting at `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Flush any buffered writes to durable storage.
    fn sync(&self) -> io::Result<()>;

    /// Total addressable size of the device in bytes.
    fn len(&self) -> io::Result<u64>;
}

/// A device backed by a regular file (or a raw block device opened as one).
#[derive(Debug)]
pub struct FileDevice {
    path: PathBuf,
    file: File,
}

impl FileDevice {
    /// Open (or create) the file at `path` with the given size reservation.
    /// `create` requests `O_CREAT`; the file is truncated/extended to
    /// `size_hint` bytes when newly created.
    pub fn open(path: impl AsRef<Path>, create: bool, size_hint: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)?;
        if create {
            let current_len = file.metadata()?.len();
            if current_len < size_hint {
                file.set_len(size_hint)?;
            }
        }
        Ok(Self { path, file })
    }

    /// Path this device was opened from, for reporting (§4.1 `devices()`).
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Device for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Reporting summary of a device attached to a pool (§4.1 `devices()`).
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Path the device was opened from.
    pub path: PathBuf,
    /// Total size in bytes.
    pub len: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_device_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk0");
        let dev = FileDevice::open(&path, true, 4096).unwrap();
        dev.write_at(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        dev.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(dev.len().unwrap(), 4096);
    }
}
