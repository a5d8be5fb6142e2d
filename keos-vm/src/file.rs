//! # File-backed pages and memory-mapped files.
//!
//! A file-backed page mirrors `read_bytes` bytes of a file starting at
//! `offset`; the remaining `zero_bytes` of the page are zero. Its contents are
//! read from the file whenever the page is claimed, and written back to the
//! file when a **dirty** page is evicted, unmapped, or torn down with its
//! address space. A clean page is simply dropped since the file already holds
//! its contents.
//!
//! [`MmStruct::mmap`] creates a region of such pages, one per page of the
//! requested length, without reading anything: every page is loaded lazily on
//! its first access. Each region gets its own identifier so that
//! [`MmStruct::munmap`] can find every page of the region from its first
//! address. Mapping without a file creates zero-filled anonymous pages
//! instead.
use crate::{MmStruct, VmType, lazy_pager::LazyLoad};
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    fs::RegularFile,
};

/// Backing state of a file-backed page.
#[derive(Debug, Clone)]
pub struct FilePage {
    pub(crate) file: RegularFile,
    pub(crate) offset: usize,
    pub(crate) read_bytes: usize,
    pub(crate) zero_bytes: usize,
}

impl FilePage {
    /// Reads the page from the file into `page`, zero-filling the rest.
    ///
    /// Bytes the file no longer has (it shrank) read as zero.
    pub fn swap_in(&self, page: &mut [u8]) -> Result<(), KernelError> {
        if page.len() != self.read_bytes + self.zero_bytes {
            return Err(KernelError::InvalidArgument);
        }
        let n = self.file.read(self.offset, &mut page[..self.read_bytes])?;
        page[n..].fill(0);
        Ok(())
    }

    /// Writes `page` back to the file if it is `dirty`.
    ///
    /// Only the `read_bytes` bytes that came from the file are written, so
    /// the file never grows.
    pub fn swap_out(&self, page: &[u8], dirty: bool) -> Result<(), KernelError> {
        if !dirty || self.read_bytes == 0 {
            return Ok(());
        }
        if page.len() != PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        let n = self.file.write(self.offset, &page[..self.read_bytes])?;
        if n != self.read_bytes {
            return Err(KernelError::IOError);
        }
        Ok(())
    }

    /// Tears down the page. The file handle is closed when the page is
    /// dropped; nothing is written.
    pub fn destroy(&mut self) {}
}

impl From<LazyLoad> for FilePage {
    fn from(loader: LazyLoad) -> Self {
        Self {
            file: loader.file,
            offset: loader.offset,
            read_bytes: loader.read_bytes,
            zero_bytes: loader.zero_bytes,
        }
    }
}

impl MmStruct {
    /// Maps `length` bytes at `addr`, backed by `file` from `offset`, or by
    /// zero-filled anonymous memory if `file` is `None`.
    ///
    /// Nothing is read until the pages are accessed. A region of a file holds
    /// `min(file size - offset, length)` bytes of the file; the rest of its
    /// last page is zero. The file is reopened, so the mapping stays valid
    /// after the caller closes its handle.
    ///
    /// # Parameters
    /// - `addr`: Page-aligned, non-null user address of the region.
    /// - `length`: Size of the region in bytes; rounded up to whole pages.
    /// - `writable`: Whether user writes are allowed.
    /// - `file`: The file to map, if any.
    /// - `offset`: Page-aligned offset within `file`.
    ///
    /// # Returns
    /// - `Ok(Va)`: The start of the region (`addr`).
    /// - `Err(KernelError::InvalidArgument)`: `addr` is null or unaligned,
    ///   `length` is zero, `offset` is unaligned, or `offset` is not within
    ///   the file.
    /// - `Err(KernelError::BadAddress)`: The region leaves user space.
    /// - `Err(KernelError::FileExist)`: The region overlaps existing pages.
    pub fn mmap(
        &mut self,
        addr: Va,
        length: usize,
        writable: bool,
        file: Option<&RegularFile>,
        offset: usize,
    ) -> Result<Va, KernelError> {
        if addr.into_usize() == 0 || !addr.is_aligned() || length == 0 || offset % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let npages = length.div_ceil(PAGE_SIZE);
        let end = npages
            .checked_mul(PAGE_SIZE)
            .and_then(|size| addr.into_usize().checked_add(size))
            .and_then(|end| Va::new(end - 1))
            .ok_or(KernelError::BadAddress)?;
        if !addr.is_user() || !end.is_user() {
            return Err(KernelError::BadAddress);
        }
        if (0..npages).any(|i| self.spt.find(addr + i * PAGE_SIZE).is_some()) {
            return Err(KernelError::FileExist);
        }
        let file_bytes = match file {
            Some(file) if offset < file.size() => (file.size() - offset).min(length),
            Some(_) => return Err(KernelError::InvalidArgument),
            None => 0,
        };

        let mapping = self.next_mapping;
        self.next_mapping += 1;
        for i in 0..npages {
            let va = addr + i * PAGE_SIZE;
            let result = match file {
                Some(file) => {
                    let read_bytes = file_bytes.saturating_sub(i * PAGE_SIZE).min(PAGE_SIZE);
                    LazyLoad::new(
                        file.reopen(),
                        offset + i * PAGE_SIZE,
                        read_bytes,
                        PAGE_SIZE - read_bytes,
                    )
                    .and_then(|loader| {
                        self.spt
                            .allocate_in_mapping(VmType::File, va, writable, Some(loader), mapping)
                    })
                }
                None => self
                    .spt
                    .allocate_in_mapping(VmType::Anon, va, writable, None, mapping),
            };
            if let Err(e) = result {
                for j in 0..i {
                    self.spt.remove(addr + j * PAGE_SIZE);
                }
                return Err(e);
            }
        }
        debug!("mmap {:?} ({} pages, region {}).", addr, npages, mapping);
        Ok(addr)
    }

    /// Unmaps the region that starts at `addr`.
    ///
    /// Walks the consecutive pages created by the same [`MmStruct::mmap`]
    /// call, writes dirty file-backed pages back to their file and destroys
    /// them. A page whose write-back fails is still unmapped; the failure is
    /// logged.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)`: `addr` is not the start of a
    ///   mapped region.
    pub fn munmap(&mut self, addr: Va) -> Result<(), KernelError> {
        let mapping = self
            .spt
            .find(addr)
            .filter(|page| page.va() == addr)
            .and_then(|page| page.mapping())
            .ok_or(KernelError::InvalidArgument)?;
        let is_start = addr.into_usize() < PAGE_SIZE
            || self
                .spt
                .find(addr - PAGE_SIZE)
                .and_then(|page| page.mapping())
                != Some(mapping);
        if !is_start {
            return Err(KernelError::InvalidArgument);
        }

        let mut va = addr;
        let mut npages = 0;
        while let Some(page) = self.spt.find(va).filter(|page| page.mapping() == Some(mapping)) {
            if let Err(e) = page.writeback() {
                warning!("munmap: failed to write back {:?}: {:?}.", va, e);
            }
            self.spt.remove(va);
            npages += 1;
            va += PAGE_SIZE;
        }
        debug!("munmap {:?} ({} pages, region {}).", addr, npages, mapping);
        Ok(())
    }
}
