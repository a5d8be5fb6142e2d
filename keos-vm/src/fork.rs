//! # Address space duplication for `fork`.
//!
//! The child of a `fork` starts with a copy of its parent's address space.
//! Every page of the parent gets a counterpart at the same address with the
//! same permission:
//!
//! - a page that was never touched stays untouched in the child, with a copy
//!   of its [`LazyLoad`] descriptor, so the child loads it on demand exactly
//!   as the parent would;
//! - a materialized page (resident, swapped out, or backed by a file) is
//!   copied eagerly into a private frame of the child. A file-backed page
//!   stays file-backed over the same region of the same file.
//!
//! No frame is ever shared between the two address spaces. Copying may evict
//! pages, including the parent's; the parent's contents are read before the
//! child's frame is acquired so no lock is held across the eviction.
//!
//! [`LazyLoad`]: crate::LazyLoad
use crate::{MmStruct, page::VmPage, spt::SupplementalPageTable};
use alloc::vec;
use keos::{KernelError, addressing::PAGE_SIZE};

impl SupplementalPageTable {
    /// Copies every page of `src` into this table.
    ///
    /// On failure the table holds a partial copy; the caller is expected to
    /// discard it.
    pub fn copy_from(&mut self, src: &SupplementalPageTable) -> Result<(), KernelError> {
        let mut contents = vec![0; PAGE_SIZE];
        for page in src.iter() {
            let forked = page.fork_state();
            let copy = VmPage::new(
                page.va(),
                page.writable(),
                forked.state,
                page.mapping(),
                self.page_table(),
                self.frames(),
            );
            self.insert(copy)?;
            if forked.materialize {
                page.read_contents(&mut contents)?;
                self.find(page.va())
                    .ok_or(KernelError::BadAddress)?
                    .claim_with(Some(&contents), forked.dirty)?;
            }
        }
        Ok(())
    }
}

impl MmStruct {
    /// Creates a copy of this address space for a forked child.
    ///
    /// # Returns
    /// - `Ok(MmStruct)`: The child's address space.
    /// - `Err(KernelError)`: The copy failed. Nothing of the child remains
    ///   and the parent is unchanged.
    pub fn fork(&self) -> Result<MmStruct, KernelError> {
        let mut child = MmStruct::new(self.frames());
        child.spt.copy_from(&self.spt)?;
        child.user_rsp = self.user_rsp;
        child.next_mapping = self.next_mapping;
        debug!("Fork an address space of {} pages.", child.spt.len());
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LazyLoad, VmType, vm_init};
    use alloc::vec::Vec;
    use keos::{
        SystemConfigurationBuilder,
        addressing::Va,
        fs::{MemFile, RegularFile},
    };

    fn mm(frames: usize, swap_pages: usize) -> MmStruct {
        MmStruct::new(&vm_init(
            &SystemConfigurationBuilder::new()
                .user_frames(frames)
                .swap_pages(swap_pages)
                .build(),
        ))
    }

    fn va(n: usize) -> Va {
        Va::new(0x1000_0000 + n * PAGE_SIZE).unwrap()
    }

    #[test]
    fn child_gets_private_copies() {
        let mut parent = mm(8, 8);
        for n in 0..3 {
            parent.allocate_page(VmType::Anon, va(n), true).unwrap();
            parent.write_user(va(n), &[n as u8 + 1; 16]).unwrap();
        }
        let mut child = parent.fork().unwrap();
        let addrs = |mm: &MmStruct| mm.spt().iter().map(VmPage::va).collect::<Vec<_>>();
        assert_eq!(addrs(&parent), addrs(&child));

        for n in 0..3 {
            let mut buf = [0; 16];
            child.read_user(va(n), &mut buf).unwrap();
            assert_eq!(buf, [n as u8 + 1; 16]);
            assert_ne!(
                child.spt().find(va(n)).unwrap().frame_pa(),
                parent.spt().find(va(n)).unwrap().frame_pa()
            );
        }

        child.write_user(va(0), &[0xee; 4]).unwrap();
        let mut buf = [0; 4];
        parent.read_user(va(0), &mut buf).unwrap();
        assert_eq!(buf, [1; 4]);
    }

    #[test]
    fn untouched_pages_stay_deferred() {
        let mut parent = mm(4, 4);
        let file = RegularFile::new(MemFile::new(b"lazy"));
        let loader = LazyLoad::new(file, 0, 4, PAGE_SIZE - 4).unwrap();
        parent
            .allocate_deferred(VmType::Anon, va(0), false, Some(loader))
            .unwrap();
        let mut child = parent.fork().unwrap();
        assert_eq!(child.spt().find(va(0)).unwrap().vm_type(), VmType::Uninit);
        assert!(child.frames().is_empty());

        let mut buf = [0; 4];
        child.read_user(va(0), &mut buf).unwrap();
        assert_eq!(&buf, b"lazy");
        assert_eq!(parent.spt().find(va(0)).unwrap().vm_type(), VmType::Uninit);
    }

    #[test]
    fn swapped_out_pages_are_copied_from_swap() {
        let mut parent = mm(2, 8);
        for n in 0..3 {
            parent.allocate_page(VmType::Anon, va(n), true).unwrap();
            parent.write_user(va(n), &[0x10 + n as u8]).unwrap();
        }
        assert!(parent.spt().iter().any(|page| page.swap_slot().is_some()));
        let mut child = parent.fork().unwrap();
        for n in 0..3 {
            let mut byte = [0];
            child.read_user(va(n), &mut byte).unwrap();
            assert_eq!(byte, [0x10 + n as u8]);
            parent.read_user(va(n), &mut byte).unwrap();
            assert_eq!(byte, [0x10 + n as u8]);
        }
    }

    #[test]
    fn file_pages_stay_file_backed() {
        let mut parent = mm(4, 4);
        let file = RegularFile::new(MemFile::new(&[5; PAGE_SIZE]));
        let base = parent
            .mmap(va(0), PAGE_SIZE, true, Some(&file), 0)
            .unwrap();
        parent.write_user(base, &[6]).unwrap();
        let mut child = parent.fork().unwrap();
        let page = child.spt().find(base).unwrap();
        assert_eq!(page.vm_type(), VmType::File);
        assert!(page.mapping().is_some());
        let mut byte = [0];
        child.read_user(base, &mut byte).unwrap();
        assert_eq!(byte, [6]);
        child.munmap(base).unwrap();
    }

    #[test]
    fn inherited_writes_survive_eviction() {
        let mut parent = mm(4, 4);
        let file = RegularFile::new(MemFile::new(&[5; PAGE_SIZE]));
        let base = parent
            .mmap(va(0), PAGE_SIZE, true, Some(&file), 0)
            .unwrap();
        parent.write_user(base, &[6]).unwrap();
        let mut child = parent.fork().unwrap();
        assert!(child.spt().page_table().is_dirty(base));

        // Keep the parent's copy resident so the file never sees its write.
        parent.spt().page_table().set_accessed(base, true);
        child.spt().page_table().set_accessed(base, false);
        drop(child.frames().evict_one().unwrap());
        assert!(!child.spt().find(base).unwrap().is_resident());
        assert!(parent.spt().find(base).unwrap().is_resident());

        let mut byte = [0];
        child.read_user(base, &mut byte).unwrap();
        assert_eq!(byte, [6], "The child must keep the bytes it inherited");
        parent.read_user(base, &mut byte).unwrap();
        assert_eq!(byte, [6]);
    }

    #[test]
    fn clean_file_pages_are_inherited_clean() {
        let mut parent = mm(4, 4);
        let file = RegularFile::new(MemFile::new(&[5; PAGE_SIZE]));
        let base = parent
            .mmap(va(0), PAGE_SIZE, true, Some(&file), 0)
            .unwrap();
        let mut byte = [0];
        parent.read_user(base, &mut byte).unwrap();
        let child = parent.fork().unwrap();
        assert!(child.spt().find(base).unwrap().is_resident());
        assert!(!child.spt().page_table().is_dirty(base));
    }

    #[test]
    fn failed_copy_leaves_the_parent_intact() {
        // One frame and no swap: the child cannot get a frame of its own.
        let mut parent = mm(1, 0);
        parent.allocate_page(VmType::Anon, va(0), true).unwrap();
        parent.write_user(va(0), &[0xab]).unwrap();
        let pa = parent.spt().find(va(0)).unwrap().frame_pa();

        assert_eq!(parent.fork().unwrap_err(), KernelError::NoSpace);
        let page = parent.spt().find(va(0)).unwrap();
        assert_eq!(page.frame_pa(), pa);
        assert!(parent.spt().page_table().walk(va(0)).is_ok());
        assert_eq!(parent.frames().len(), 1);
        let mut byte = [0];
        parent.read_user(va(0), &mut byte).unwrap();
        assert_eq!(byte, [0xab]);
    }
}
