//! # Lazy program loading.
//!
//! An executable is made of loadable segments, each described by where its
//! bytes live in the file and where they go in memory. Eagerly copying every
//! segment at `exec` time wastes both time and frames on code that may never
//! run. Instead, [`MmStruct::load_segment`] records one uninitialized page per
//! page of the segment with a [`LazyLoad`] descriptor, and the bytes are read
//! when the program first touches the page.
//!
//! Segment pages are anonymous once loaded: writes to a writable data segment
//! must never reach the executable, so they go to swap when evicted.
//!
//! The initial stack is the exception: its first page is claimed right away by
//! [`MmStruct::setup_stack`] since the loader writes the program arguments
//! into it before the program starts.
use crate::{LazyLoad, MmStruct, VmType};
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, USER_STACK, Va},
    fs::RegularFile,
};

impl MmStruct {
    /// Records the pages of a program segment for lazy loading.
    ///
    /// The segment occupies `read_bytes + zero_bytes` bytes starting at `va`:
    /// the first `read_bytes` come from `file` at `offset`, the rest is
    /// zero.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)`: `va` or `offset` is not page
    ///   aligned, or the segment size is not a multiple of the page size or
    ///   does not fit in the address space.
    /// - `Err(KernelError)`: A page could not be recorded; none of the
    ///   segment's pages remain.
    pub fn load_segment(
        &mut self,
        file: &RegularFile,
        mut offset: usize,
        va: Va,
        mut read_bytes: usize,
        mut zero_bytes: usize,
        writable: bool,
    ) -> Result<(), KernelError> {
        let size = read_bytes
            .checked_add(zero_bytes)
            .ok_or(KernelError::InvalidArgument)?;
        if !va.is_aligned()
            || offset % PAGE_SIZE != 0
            || size % PAGE_SIZE != 0
            || offset.checked_add(size).is_none()
            || va.into_usize().checked_add(size).is_none()
        {
            return Err(KernelError::InvalidArgument);
        }
        let mut upage = va;
        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = read_bytes.min(PAGE_SIZE);
            let page_zero_bytes = PAGE_SIZE - page_read_bytes;
            let result = LazyLoad::new(file.reopen(), offset, page_read_bytes, page_zero_bytes)
                .and_then(|loader| {
                    self.spt
                        .allocate_deferred(VmType::Anon, upage, writable, Some(loader))
                });
            if let Err(e) = result {
                let mut undo = va;
                while undo < upage {
                    self.spt.remove(undo);
                    undo += PAGE_SIZE;
                }
                return Err(e);
            }
            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            offset += PAGE_SIZE;
            upage += PAGE_SIZE;
        }
        Ok(())
    }

    /// Creates the initial user stack.
    ///
    /// The page right below [`USER_STACK`] is allocated and made resident,
    /// and the saved user stack pointer is set to [`USER_STACK`]. The stack
    /// grows below this page on demand.
    ///
    /// # Returns
    /// The initial stack pointer.
    pub fn setup_stack(&mut self) -> Result<Va, KernelError> {
        let top = Va::new(USER_STACK).ok_or(KernelError::BadAddress)?;
        let bottom = top - PAGE_SIZE;
        self.spt.allocate_page(VmType::Anon, bottom, true)?;
        if let Err(e) = self.spt.claim_page(bottom) {
            self.spt.remove(bottom);
            return Err(e);
        }
        self.set_user_stack_pointer(USER_STACK);
        Ok(top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PageFaultReason, vm_init};
    use alloc::vec::Vec;
    use keos::{SystemConfigurationBuilder, fs::MemFile, task::PFErrorCode};

    fn mm(frames: usize) -> MmStruct {
        MmStruct::new(&vm_init(
            &SystemConfigurationBuilder::new()
                .user_frames(frames)
                .swap_pages(8)
                .build(),
        ))
    }

    fn image() -> RegularFile {
        let bytes = (0..3 * PAGE_SIZE).map(|i| (i % 253) as u8).collect::<Vec<_>>();
        RegularFile::new(MemFile::new(&bytes))
    }

    #[test]
    fn segment_pages_are_deferred() {
        let mut mm = mm(4);
        let file = image();
        let base = Va::new(0x40_0000).unwrap();
        mm.load_segment(&file, PAGE_SIZE, base, PAGE_SIZE + 100, 2 * PAGE_SIZE - 100, true)
            .unwrap();
        assert_eq!(mm.spt().len(), 3);
        assert!(mm.frames().is_empty());
        assert!(mm.spt().iter().all(|p| p.vm_type() == VmType::Uninit));

        let mut buf = [0; 2];
        mm.read_user(base + PAGE_SIZE + 98, &mut buf).unwrap();
        let expect = |i: usize| ((PAGE_SIZE + i) % 253) as u8;
        assert_eq!(buf, [expect(PAGE_SIZE + 98), expect(PAGE_SIZE + 99)]);
        mm.read_user(base + PAGE_SIZE + 100, &mut buf).unwrap();
        assert_eq!(buf, [0, 0]);
        assert_eq!(
            mm.spt().find(base + PAGE_SIZE).map(|p| p.vm_type()),
            Some(VmType::Anon)
        );
        assert_eq!(
            mm.spt().find(base).map(|p| p.vm_type()),
            Some(VmType::Uninit)
        );
    }

    #[test]
    fn misaligned_segment_is_rejected() {
        let mut mm = mm(1);
        let file = image();
        let base = Va::new(0x40_0000).unwrap();
        assert_eq!(
            mm.load_segment(&file, 0, base + 1, 10, PAGE_SIZE - 10, false),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            mm.load_segment(&file, 0, base, 10, 10, false),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn oversized_segment_is_rejected() {
        let mut mm = mm(1);
        let file = image();
        let base = Va::new(0x40_0000).unwrap();
        assert_eq!(
            mm.load_segment(&file, 0, base, usize::MAX, 1, false),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            mm.load_segment(&file, 0, base, usize::MAX, usize::MAX, false),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            mm.load_segment(&file, usize::MAX - (PAGE_SIZE - 1), base, PAGE_SIZE, 0, false),
            Err(KernelError::InvalidArgument)
        );
        assert!(mm.spt().is_empty());
    }

    #[test]
    fn overlapping_segment_is_rolled_back() {
        let mut mm = mm(1);
        let file = image();
        let base = Va::new(0x40_0000).unwrap();
        mm.load_segment(&file, 0, base + 2 * PAGE_SIZE, 10, PAGE_SIZE - 10, false)
            .unwrap();
        assert_eq!(
            mm.load_segment(&file, 0, base, 3 * PAGE_SIZE, 0, false),
            Err(KernelError::FileExist)
        );
        assert_eq!(mm.spt().len(), 1);
    }

    #[test]
    fn stack_is_resident_and_grows() {
        let mut mm = mm(4);
        let sp = mm.setup_stack().unwrap();
        assert_eq!(sp.into_usize(), USER_STACK);
        assert_eq!(mm.user_stack_pointer(), Some(USER_STACK));
        assert!(mm.spt().find(sp - 1).unwrap().is_resident());

        let rsp = USER_STACK - PAGE_SIZE;
        let reason = PageFaultReason::new(
            PFErrorCode::USER | PFErrorCode::WRITE_ACCESS,
            Va::new(rsp - 8).unwrap(),
            Some(rsp),
        );
        mm.handle_page_fault(&reason).unwrap();
        assert_eq!(mm.spt().len(), 2);
    }
}
