//! Filesystem abstraction.
//!
//! The virtual memory subsystem only needs regular files (to back
//! memory-mapped regions and program segments) and a raw block device (to
//! back the swap area). Both are exposed here through the same narrow
//! interfaces a real file system would provide, together with in-memory
//! implementations, [`MemFile`] and [`Disk`], used by the hosted kernel.
//!
//! Both in-memory devices accept a *hook* that runs before every access and
//! may fail it, which is how I/O errors are injected.

/// Defines traits for file system operations.
pub mod traits {
    use super::{FileBlockNumber, InodeNumber};
    use crate::KernelError;

    /// Trait representing a regular file in the filesystem.
    ///
    /// A regular file contains user data and supports block-granular read and
    /// write operations.
    pub trait RegularFile
    where
        Self: Send + Sync,
    {
        /// Returns the inode number of the file.
        fn ino(&self) -> InodeNumber;

        /// Returns the size of the file in bytes.
        fn size(&self) -> usize;

        /// Reads one file block into the provided buffer.
        ///
        /// Bytes past the end of the file are filled with zero.
        ///
        /// # Returns
        /// - `Ok(true)`: The block lies (at least partially) within the file.
        /// - `Ok(false)`: The block lies past the end of the file.
        /// - `Err(KernelError)`: An error occured while the read operation.
        fn read(&self, fba: FileBlockNumber, buf: &mut [u8; 4096]) -> Result<bool, KernelError>;

        /// Writes a 4096-byte page of data into the specified file block.
        ///
        /// If the target block lies beyond the current end of the file, the
        /// file is extended up to `min_size` bytes. If `min_size` is
        /// insufficient to reach the block, the write fails.
        ///
        /// # Parameters
        /// - `fba`: The block to write to.
        /// - `buf`: Exactly 4096 bytes of data.
        /// - `min_size`: The desired minimum file size after the write.
        fn write(
            &self,
            fba: FileBlockNumber,
            buf: &[u8; 4096],
            min_size: usize,
        ) -> Result<(), KernelError>;
    }
}

use crate::{KernelError, sync::SpinLock};
use std::{
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

/// A handle to a regular file.
///
/// This struct provides a reference-counted handle to a file that supports
/// byte-granular reading and writing at the kernel level.
#[derive(Clone)]
pub struct RegularFile(pub Arc<dyn traits::RegularFile>);

impl RegularFile {
    /// Inode number of the file.
    pub fn ino(&self) -> InodeNumber {
        self.0.ino()
    }

    /// Creates a new [`RegularFile`] handle from a given implementation of
    /// [`traits::RegularFile`].
    pub fn new(r: impl traits::RegularFile + 'static) -> Self {
        Self(Arc::new(r))
    }

    /// Returns the size of the file in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// Opens an independent handle to the same file.
    ///
    /// Every access names its own position, so the handles share nothing but
    /// the underlying file; the new handle keeps the file alive even after
    /// the original one is closed.
    pub fn reopen(&self) -> Self {
        Self(self.0.clone())
    }

    /// Reads data from the file at `position` into `buf`.
    ///
    /// Reading stops at the end of the file.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes read.
    /// - `Err(Error)`: An error if the read operation fails.
    pub fn read(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let end = self.size().min(position.saturating_add(buf.len()));
        let mut block = Box::new([0; 4096]);
        let mut pos = position;
        while pos < end {
            let ofs = pos & 0xfff;
            let n = (0x1000 - ofs).min(end - pos);
            self.0.read(FileBlockNumber::from_offset(pos), &mut block)?;
            let done = pos - position;
            buf[done..done + n].copy_from_slice(&block[ofs..ofs + n]);
            pos += n;
        }
        Ok(pos.saturating_sub(position))
    }

    /// Writes data from `buf` into the file at `position`.
    ///
    /// If the write reaches beyond the current file size, the file is
    /// extended to the minimum size required to hold the update.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes written.
    /// - `Err(Error)`: An error if the write operation fails.
    pub fn write(&self, position: usize, buf: &[u8]) -> Result<usize, KernelError> {
        let mut block = Box::new([0; 4096]);
        let mut done = 0;
        while done < buf.len() {
            let pos = position + done;
            let ofs = pos & 0xfff;
            let n = (0x1000 - ofs).min(buf.len() - done);
            let fba = FileBlockNumber::from_offset(pos);
            // A partial block keeps the bytes around the update.
            if n != 0x1000 {
                self.0.read(fba, &mut block)?;
            }
            block[ofs..ofs + n].copy_from_slice(&buf[done..done + n]);
            self.0.write(fba, &block, pos + n)?;
            done += n;
        }
        Ok(done)
    }
}

impl core::fmt::Debug for RegularFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegularFile")
            .field("ino", &self.ino())
            .field("size", &self.size())
            .finish()
    }
}

/// Represents a unique identifier for an inode in the filesystem.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct InodeNumber(NonZeroU32);

impl InodeNumber {
    /// Creates a [`InodeNumber`] if the given value is not zero.
    pub const fn new(n: u32) -> Option<Self> {
        if let Some(v) = NonZeroU32::new(n) {
            Some(Self(v))
        } else {
            None
        }
    }

    /// Returns the contained value as a u32.
    #[inline]
    pub fn into_u32(&self) -> u32 {
        self.0.get()
    }
}

/// Represents a file block number within a file.
///
/// Each block contains 4096 bytes of contents.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct FileBlockNumber(pub usize);

impl FileBlockNumber {
    /// Computes the file block number from a byte offset within a file.
    pub const fn from_offset(offset: usize) -> Self {
        Self(offset / 0x1000)
    }

    /// Byte offset of the first byte of this block.
    pub const fn into_offset(self) -> usize {
        self.0 * 0x1000
    }
}

/// The type for file hooking.
///
/// Called with the accessed block and `true` for writes. Returning an error
/// fails the access before it touches the data.
pub type FileHook =
    Arc<dyn Fn(FileBlockNumber, bool) -> Result<(), KernelError> + Send + Sync + 'static>;

static NEXT_INO: AtomicU32 = AtomicU32::new(1);

/// A regular file whose contents live in kernel memory.
pub struct MemFile {
    ino: InodeNumber,
    data: SpinLock<Vec<u8>>,
    hook: Option<FileHook>,
}

impl MemFile {
    /// Creates a file holding `contents`.
    pub fn new(contents: &[u8]) -> Self {
        let ino = loop {
            if let Some(ino) = InodeNumber::new(NEXT_INO.fetch_add(1, Ordering::Relaxed)) {
                break ino;
            }
        };
        Self {
            ino,
            data: SpinLock::new(contents.to_vec()),
            hook: None,
        }
    }

    /// Add a hook for the file.
    pub fn hook(self, hook: FileHook) -> Self {
        Self {
            hook: Some(hook),
            ..self
        }
    }

    fn run_hook(&self, fba: FileBlockNumber, is_write: bool) -> Result<(), KernelError> {
        match self.hook.as_ref() {
            Some(hook) => hook(fba, is_write),
            None => Ok(()),
        }
    }
}

impl traits::RegularFile for MemFile {
    fn ino(&self) -> InodeNumber {
        self.ino
    }

    fn size(&self) -> usize {
        let data = self.data.lock();
        let size = data.len();
        data.unlock();
        size
    }

    fn read(&self, fba: FileBlockNumber, buf: &mut [u8; 4096]) -> Result<bool, KernelError> {
        self.run_hook(fba, false)?;
        let start = fba.into_offset();
        let data = self.data.lock();
        let in_file = start < data.len();
        let n = data.len().saturating_sub(start).min(buf.len());
        if in_file {
            buf[..n].copy_from_slice(&data[start..start + n]);
        }
        buf[n..].fill(0);
        data.unlock();
        Ok(in_file)
    }

    fn write(
        &self,
        fba: FileBlockNumber,
        buf: &[u8; 4096],
        min_size: usize,
    ) -> Result<(), KernelError> {
        self.run_hook(fba, true)?;
        let start = fba.into_offset();
        let mut data = self.data.lock();
        let size = data.len().max(min_size);
        if start >= size {
            data.unlock();
            return Err(KernelError::InvalidArgument);
        }
        data.resize(size, 0);
        let end = (start + buf.len()).min(size);
        data[start..end].copy_from_slice(&buf[..end - start]);
        data.unlock();
        Ok(())
    }
}

/// Sector, an access granuality for the disk.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Sector(pub usize);

impl Sector {
    /// Cast into usize.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0
    }
}

impl core::ops::Add<usize> for Sector {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

// The type for disk hooking.
#[doc(hidden)]
pub type Hook =
    Arc<dyn Fn(Sector, &[u8; 512], bool) -> Result<(), KernelError> + Send + Sync + 'static>;

/// The disk, a device that has byte sink.
///
/// The hosted disk keeps its sectors in memory.
pub struct Disk {
    sectors: SpinLock<Vec<[u8; 512]>>,
    hook: Option<Hook>,
}

impl Disk {
    /// Create a zero-filled disk of `sectors` sectors.
    pub fn new(sectors: usize) -> Self {
        Self {
            sectors: SpinLock::new(vec![[0; 512]; sectors]),
            hook: None,
        }
    }

    /// Add a hook for the disk.
    pub fn hook(self, hook: Hook) -> Self {
        Self {
            hook: Some(hook),
            ..self
        }
    }

    /// Number of sectors of the disk.
    pub fn sector_count(&self) -> usize {
        let sectors = self.sectors.lock();
        let n = sectors.len();
        sectors.unlock();
        n
    }

    /// Read 512 bytes from disk starting from sector.
    pub fn read(&self, sector: Sector, buf: &mut [u8; 512]) -> Result<(), KernelError> {
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, false)?;
        }
        let sectors = self.sectors.lock();
        let result = match sectors.get(sector.into_usize()) {
            Some(data) => {
                buf.copy_from_slice(data);
                Ok(())
            }
            None => Err(KernelError::IOError),
        };
        sectors.unlock();
        result
    }

    /// Write 512 bytes to disk starting from sector.
    pub fn write(&self, sector: Sector, buf: &[u8; 512]) -> Result<(), KernelError> {
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, true)?;
        }
        let mut sectors = self.sectors.lock();
        let result = match sectors.get_mut(sector.into_usize()) {
            Some(data) => {
                data.copy_from_slice(buf);
                Ok(())
            }
            None => Err(KernelError::IOError),
        };
        sectors.unlock();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn unaligned_read_stops_at_eof() {
        let file = RegularFile::new(MemFile::new(&pattern(5000)));
        let mut buf = vec![0; 8192];
        assert_eq!(file.read(4000, &mut buf), Ok(1000));
        assert_eq!(&buf[..1000], &pattern(5000)[4000..]);
        assert_eq!(file.read(6000, &mut buf), Ok(0));
    }

    #[test]
    fn write_extends_and_preserves_neighbours() {
        let file = RegularFile::new(MemFile::new(&pattern(100)));
        assert_eq!(file.write(50, &[0xee; 5000]), Ok(5000));
        assert_eq!(file.size(), 5050);
        let mut buf = vec![0; 5050];
        assert_eq!(file.read(0, &mut buf), Ok(5050));
        assert_eq!(&buf[..50], &pattern(100)[..50]);
        assert!(buf[50..].iter().all(|b| *b == 0xee));
    }

    #[test]
    fn reopen_shares_contents() {
        let file = RegularFile::new(MemFile::new(b"hello"));
        let other = file.reopen();
        drop(file);
        other.write(0, b"J").unwrap();
        let mut buf = [0; 5];
        other.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"Jello");
    }

    #[test]
    fn hooks_inject_errors() {
        let hook: FileHook = Arc::new(|_, is_write| {
            if is_write {
                Err(KernelError::IOError)
            } else {
                Ok(())
            }
        });
        let file = RegularFile::new(MemFile::new(&[1; 16]).hook(hook));
        let mut buf = [0; 16];
        assert_eq!(file.read(0, &mut buf), Ok(16));
        assert_eq!(file.write(0, &buf), Err(KernelError::IOError));

        let disk = Disk::new(2).hook(Arc::new(|sector, _, _| {
            if sector.into_usize() == 1 {
                Err(KernelError::IOError)
            } else {
                Ok(())
            }
        }));
        assert!(disk.write(Sector(0), &[3; 512]).is_ok());
        assert_eq!(disk.write(Sector(1), &[3; 512]), Err(KernelError::IOError));
        assert_eq!(disk.read(Sector(2), &mut [0; 512]), Err(KernelError::IOError));
    }
}
