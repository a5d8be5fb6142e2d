//! # Lazy loading.
//!
//! Pages are created *uninitialized*: allocating a page only records it in
//! the [`SupplementalPageTable`], and no frame is spent until the page is
//! first touched. The first contents of a page come from one of two sources:
//!
//! - nothing, for pages created by [`SupplementalPageTable::allocate_page`]:
//!   the page is zero-filled;
//! - a [`LazyLoad`] descriptor, for pages created by
//!   [`SupplementalPageTable::allocate_deferred`]: `read_bytes` bytes are read
//!   from a file at `offset` and the remaining `zero_bytes` are zero-filled.
//!
//! A descriptor is a plain value. It can be cloned into a forked address
//! space and it becomes the backing state of a file-backed page once loaded.
use crate::{
    VmType,
    file::FilePage,
    page::{PageState, VmPage},
    spt::SupplementalPageTable,
};
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    fs::RegularFile,
};

/// Describes where the first contents of a page come from.
#[derive(Debug, Clone)]
pub struct LazyLoad {
    pub(crate) file: RegularFile,
    pub(crate) offset: usize,
    pub(crate) read_bytes: usize,
    pub(crate) zero_bytes: usize,
}

impl LazyLoad {
    /// Creates a descriptor reading `read_bytes` bytes of `file` at `offset`
    /// followed by `zero_bytes` zeros.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)` unless `read_bytes + zero_bytes`
    ///   is exactly one page.
    pub fn new(
        file: RegularFile,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Result<Self, KernelError> {
        if read_bytes.checked_add(zero_bytes) != Some(PAGE_SIZE) {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            file,
            offset,
            read_bytes,
            zero_bytes,
        })
    }

    /// Fills `page` with the described contents.
    ///
    /// # Returns
    /// - `Err(KernelError::IOError)` if the file holds fewer than
    ///   `read_bytes` bytes at `offset`.
    pub fn load(&self, page: &mut [u8]) -> Result<(), KernelError> {
        if page.len() != PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        let (head, tail) = page.split_at_mut(self.read_bytes);
        if self.file.read(self.offset, head)? != self.read_bytes {
            return Err(KernelError::IOError);
        }
        tail.fill(0);
        Ok(())
    }
}

impl From<FilePage> for LazyLoad {
    fn from(page: FilePage) -> Self {
        Self {
            file: page.file,
            offset: page.offset,
            read_bytes: page.read_bytes,
            zero_bytes: page.zero_bytes,
        }
    }
}

impl SupplementalPageTable {
    /// Records an uninitialized page at `va` that becomes a page of type `ty`
    /// on its first claim, with its contents supplied by `loader`.
    ///
    /// # Parameters
    /// - `ty`: [`VmType::Anon`] or [`VmType::File`].
    /// - `va`: Address of the page; rounded down to a page boundary.
    /// - `writable`: Whether user writes are allowed.
    /// - `loader`: Source of the first contents, required for
    ///   [`VmType::File`]. Without one the page is zero-filled.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)`: `ty` is [`VmType::Uninit`], or
    ///   [`VmType::File`] without a loader.
    /// - `Err(KernelError::FileExist)`: `va` already has a page.
    /// - `Err(KernelError::BadAddress)`: `va` is not a user address.
    pub fn allocate_deferred(
        &mut self,
        ty: VmType,
        va: Va,
        writable: bool,
        loader: Option<LazyLoad>,
    ) -> Result<(), KernelError> {
        self.allocate_with(ty, va, writable, loader, None)
    }

    /// Records a zero-filled page of type `ty` at `va`.
    ///
    /// Equivalent to [`SupplementalPageTable::allocate_deferred`] without a
    /// loader.
    pub fn allocate_page(&mut self, ty: VmType, va: Va, writable: bool) -> Result<(), KernelError> {
        self.allocate_deferred(ty, va, writable, None)
    }

    /// Makes the page at `va` resident.
    ///
    /// # Returns
    /// - `Err(KernelError::BadAddress)` if there is no page at `va`.
    /// - Any error of [`VmPage::claim`].
    pub fn claim_page(&self, va: Va) -> Result<(), KernelError> {
        self.find(va).ok_or(KernelError::BadAddress)?.claim()
    }

    pub(crate) fn allocate_in_mapping(
        &mut self,
        ty: VmType,
        va: Va,
        writable: bool,
        loader: Option<LazyLoad>,
        mapping: usize,
    ) -> Result<(), KernelError> {
        self.allocate_with(ty, va, writable, loader, Some(mapping))
    }

    fn allocate_with(
        &mut self,
        ty: VmType,
        va: Va,
        writable: bool,
        loader: Option<LazyLoad>,
        mapping: Option<usize>,
    ) -> Result<(), KernelError> {
        match (ty, loader.is_some()) {
            (VmType::Uninit, _) | (VmType::File, false) => Err(KernelError::InvalidArgument),
            _ => {
                let page = VmPage::new(
                    va,
                    writable,
                    PageState::Uninit { loader, target: ty },
                    mapping,
                    self.page_table(),
                    self.frames(),
                );
                self.insert(page)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_init;
    use keos::{SystemConfigurationBuilder, fs::MemFile};

    fn spt() -> SupplementalPageTable {
        SupplementalPageTable::new(&vm_init(
            &SystemConfigurationBuilder::new()
                .user_frames(2)
                .swap_pages(2)
                .build(),
        ))
    }

    fn va(a: usize) -> Va {
        Va::new(a).unwrap()
    }

    #[test]
    fn allocate_checks_its_arguments() {
        let mut spt = spt();
        let file = RegularFile::new(MemFile::new(&[1; 10]));
        let loader = LazyLoad::new(file, 0, 10, PAGE_SIZE - 10).unwrap();
        assert_eq!(
            spt.allocate_page(VmType::Uninit, va(0x1000), true),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            spt.allocate_page(VmType::File, va(0x1000), true),
            Err(KernelError::InvalidArgument)
        );
        spt.allocate_deferred(VmType::File, va(0x1000), true, Some(loader.clone()))
            .unwrap();
        assert_eq!(
            spt.allocate_deferred(VmType::File, va(0x1fff), true, Some(loader)),
            Err(KernelError::FileExist)
        );
        assert_eq!(spt.len(), 1);
        assert!(spt.frames().is_empty());
    }

    #[test]
    fn descriptor_must_cover_one_page() {
        let file = RegularFile::new(MemFile::new(&[1; 10]));
        assert!(LazyLoad::new(file.clone(), 0, 10, 10).is_err());
        assert!(LazyLoad::new(file, 0, PAGE_SIZE, 0).is_ok());
    }

    #[test]
    fn short_read_fails_the_claim() {
        let mut spt = spt();
        let file = RegularFile::new(MemFile::new(&[1; 10]));
        let loader = LazyLoad::new(file, 0, 100, PAGE_SIZE - 100).unwrap();
        spt.allocate_deferred(VmType::Anon, va(0x1000), true, Some(loader))
            .unwrap();
        assert_eq!(spt.claim_page(va(0x1000)), Err(KernelError::IOError));
        let page = spt.find(va(0x1000)).unwrap();
        assert_eq!(page.vm_type(), VmType::Uninit);
        assert!(!page.is_resident());
        assert!(spt.frames().is_empty());
        assert!(spt.page_table().is_empty());
    }

    #[test]
    fn loaded_segment_becomes_anonymous() {
        let mut spt = spt();
        let file = RegularFile::new(MemFile::new(b"0123456789"));
        let loader = LazyLoad::new(file, 4, 3, PAGE_SIZE - 3).unwrap();
        spt.allocate_deferred(VmType::Anon, va(0x1000), false, Some(loader))
            .unwrap();
        spt.claim_page(va(0x1000)).unwrap();
        let page = spt.find(va(0x1000)).unwrap();
        assert_eq!(page.vm_type(), VmType::Anon);
        let bytes = spt
            .page_table()
            .access(va(0x1000), false, true, |b| [b[0], b[1], b[2], b[3]]);
        assert_eq!(bytes, Ok(*b"456\0"));
    }

    #[test]
    fn claim_of_a_missing_page_fails() {
        let spt = spt();
        assert_eq!(spt.claim_page(va(0x1000)), Err(KernelError::BadAddress));
    }
}
