//! Memory state of a process.
//!
//! [`MmStruct`] bundles everything the virtual memory subsystem knows about
//! one address space: its [`SupplementalPageTable`] (and, through it, its
//! hardware page table), the user stack pointer saved on entry to the kernel,
//! and the identifiers of its memory-mapped regions.
use crate::{LazyLoad, VmType, frame::FrameTable, page::VmPage, spt::SupplementalPageTable};
use alloc::sync::Arc;
use core::ops::Range;
use keos::{KernelError, addressing::Va};

/// The memory state of a process.
pub struct MmStruct {
    pub(crate) spt: SupplementalPageTable,
    pub(crate) user_rsp: Option<usize>,
    pub(crate) next_mapping: usize,
}

impl MmStruct {
    /// Creates an empty address space whose pages draw frames from `frames`.
    pub fn new(frames: &Arc<FrameTable>) -> Self {
        Self {
            spt: SupplementalPageTable::new(frames),
            user_rsp: None,
            next_mapping: 0,
        }
    }

    /// The supplemental page table.
    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    /// The supplemental page table, mutably.
    pub fn spt_mut(&mut self) -> &mut SupplementalPageTable {
        &mut self.spt
    }

    /// The frame table the address space draws from.
    pub fn frames(&self) -> &Arc<FrameTable> {
        self.spt.frames()
    }

    /// Records the user stack pointer, saved when the process entered the
    /// kernel.
    ///
    /// Faults raised by the kernel on user memory grow the stack relative to
    /// this pointer.
    pub fn set_user_stack_pointer(&mut self, rsp: usize) {
        self.user_rsp = Some(rsp);
    }

    /// The saved user stack pointer.
    pub fn user_stack_pointer(&self) -> Option<usize> {
        self.user_rsp
    }

    /// See [`SupplementalPageTable::allocate_page`].
    pub fn allocate_page(&mut self, ty: VmType, va: Va, writable: bool) -> Result<(), KernelError> {
        self.spt.allocate_page(ty, va, writable)
    }

    /// See [`SupplementalPageTable::allocate_deferred`].
    pub fn allocate_deferred(
        &mut self,
        ty: VmType,
        va: Va,
        writable: bool,
        loader: Option<LazyLoad>,
    ) -> Result<(), KernelError> {
        self.spt.allocate_deferred(ty, va, writable, loader)
    }

    /// See [`SupplementalPageTable::claim_page`].
    pub fn claim_page(&self, va: Va) -> Result<(), KernelError> {
        self.spt.claim_page(va)
    }

    /// Checks whether every page of `addr` has a page that allows the access.
    ///
    /// Nothing is claimed: a non-resident page passes as long as it exists.
    /// An empty range is always accessible.
    pub fn access_ok(&self, addr: Range<Va>, is_write: bool) -> bool {
        let (start, end) = (addr.start.into_usize(), addr.end.into_usize());
        if start >= end {
            return true;
        }
        let Some(last) = Va::new(end - 1) else {
            return false;
        };
        let mut va = addr.start.page_down();
        while va <= last {
            match self.spt.find(va) {
                Some(page) if !is_write || page.writable() => {}
                _ => return false,
            }
            va += keos::addressing::PAGE_SIZE;
        }
        true
    }
}

impl core::fmt::Debug for MmStruct {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmStruct")
            .field("pages", &self.spt.len())
            .field("user_rsp", &self.user_rsp)
            .finish()
    }
}

impl Drop for MmStruct {
    fn drop(&mut self) {
        let writeback = |page: &VmPage| {
            if let Err(e) = page.writeback() {
                warning!("Failed to write back {:?}: {:?}.", page.va(), e);
            }
        };
        self.spt.destroy_all(Some(&writeback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_init;
    use keos::{
        SystemConfigurationBuilder,
        addressing::PAGE_SIZE,
        fs::{MemFile, RegularFile},
    };

    fn mm() -> MmStruct {
        MmStruct::new(&vm_init(
            &SystemConfigurationBuilder::new()
                .user_frames(4)
                .swap_pages(4)
                .build(),
        ))
    }

    fn va(a: usize) -> Va {
        Va::new(a).unwrap()
    }

    #[test]
    fn access_ok_checks_every_page() {
        let mut mm = mm();
        mm.allocate_page(VmType::Anon, va(0x1000), true).unwrap();
        mm.allocate_page(VmType::Anon, va(0x2000), false).unwrap();
        assert!(mm.access_ok(va(0x1000)..va(0x3000), false));
        assert!(!mm.access_ok(va(0x1000)..va(0x3000), true));
        assert!(mm.access_ok(va(0x1800)..va(0x2000), true));
        assert!(!mm.access_ok(va(0x1800)..va(0x3001), false));
        assert!(mm.access_ok(va(0x5000)..va(0x5000), true));
        assert!(!mm.access_ok(va(0xffff_8000_0000_0000)..va(0xffff_8000_0000_1000), false));
        // Checking does not make anything resident.
        assert!(mm.frames().is_empty());
    }

    #[test]
    fn teardown_writes_back_dirty_file_pages() {
        let frames = mm().frames().clone();
        let file = RegularFile::new(MemFile::new(&[0; PAGE_SIZE]));
        {
            let mut mm = MmStruct::new(&frames);
            let base = mm
                .mmap(va(0x1000_0000), PAGE_SIZE, true, Some(&file), 0)
                .unwrap();
            mm.write_user(base + 1, b"kept").unwrap();
        }
        let mut buf = [0; 5];
        file.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"\0kept");
        assert!(frames.is_empty());
    }
}
