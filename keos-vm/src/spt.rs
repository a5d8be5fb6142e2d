//! Supplemental page table.
//!
//! The hardware page table can only describe pages that occupy a frame. The
//! supplemental page table describes *every* page of an address space,
//! including the ones that were never touched and the ones that were evicted,
//! so that a page fault can tell a legitimate access to a non-resident page
//! from a bad one.
use crate::{frame::FrameTable, page::VmPage};
use alloc::{collections::BTreeMap, sync::Arc};
use keos::{KernelError, addressing::Va, mm::page_table::PageTable};

/// Per-address-space record of every virtual page.
pub struct SupplementalPageTable {
    pages: BTreeMap<Va, VmPage>,
    page_table: Arc<PageTable>,
    frames: Arc<FrameTable>,
}

impl SupplementalPageTable {
    /// Creates an empty table for a new address space that draws its frames
    /// from `frames`.
    pub fn new(frames: &Arc<FrameTable>) -> Self {
        Self {
            pages: BTreeMap::new(),
            page_table: Arc::new(PageTable::new(frames.palloc())),
            frames: frames.clone(),
        }
    }

    /// The hardware page table of the address space.
    pub fn page_table(&self) -> &Arc<PageTable> {
        &self.page_table
    }

    /// The frame table the pages draw from.
    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    /// Finds the page containing `va`.
    pub fn find(&self, va: Va) -> Option<&VmPage> {
        self.pages.get(&va.page_down())
    }

    /// Adds `page` to the table.
    ///
    /// # Returns
    /// - `Err(KernelError::BadAddress)`: The page is not in user space.
    /// - `Err(KernelError::FileExist)`: There is already a page at its
    ///   address.
    pub fn insert(&mut self, page: VmPage) -> Result<(), KernelError> {
        let va = page.va();
        if !va.is_user() {
            return Err(KernelError::BadAddress);
        }
        if self.pages.contains_key(&va) {
            return Err(KernelError::FileExist);
        }
        self.pages.insert(va, page);
        Ok(())
    }

    /// Removes and destroys the page containing `va`.
    ///
    /// Returns `false` if there was none.
    pub fn remove(&mut self, va: Va) -> bool {
        match self.pages.remove(&va.page_down()) {
            Some(page) => {
                page.destroy();
                true
            }
            None => false,
        }
    }

    /// Destroys every page, after running `cleanup` on each of them.
    pub fn destroy_all(&mut self, cleanup: Option<&dyn Fn(&VmPage)>) {
        for (_, page) in core::mem::take(&mut self.pages) {
            if let Some(cleanup) = cleanup {
                cleanup(&page);
            }
            page.destroy();
        }
    }

    /// Iterates over the pages in address order.
    pub fn iter(&self) -> impl Iterator<Item = &VmPage> {
        self.pages.values()
    }

    /// Number of pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns `true` if the address space has no page.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl Drop for SupplementalPageTable {
    fn drop(&mut self) {
        self.destroy_all(None);
    }
}
