//! Kernel access to user memory.
//!
//! System calls read and write user buffers through the page table of the
//! calling process, exactly like the program itself would. A buffer may span
//! non-resident pages: each access that faults is resolved with
//! [`MmStruct::handle_page_fault`] as a kernel-mode fault, which grows the
//! stack relative to the user stack pointer saved on entry to the kernel, and
//! then retried.
use crate::{MmStruct, PageFaultReason};
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
};

impl MmStruct {
    /// Copies `buf.len()` bytes of user memory at `addr` into `buf`.
    ///
    /// # Returns
    /// - `Err(KernelError::BadAddress)`: Part of the range has no page.
    pub fn read_user(&mut self, addr: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        self.access_user(addr, buf.len(), false, |done, page| {
            buf[done..done + page.len()].copy_from_slice(page)
        })
    }

    /// Copies `buf` into user memory at `addr`.
    ///
    /// # Returns
    /// - `Err(KernelError::BadAddress)`: Part of the range has no page.
    /// - `Err(KernelError::InvalidAccess)`: Part of the range is read-only.
    pub fn write_user(&mut self, addr: Va, buf: &[u8]) -> Result<(), KernelError> {
        self.access_user(addr, buf.len(), true, |done, page| {
            page.copy_from_slice(&buf[done..done + page.len()])
        })
    }

    // Runs `f` on each page-sized piece of the range, with the offset of the
    // piece within the range.
    fn access_user(
        &mut self,
        addr: Va,
        len: usize,
        is_write: bool,
        mut f: impl FnMut(usize, &mut [u8]),
    ) -> Result<(), KernelError> {
        let mut done = 0;
        while done < len {
            let va = addr
                .into_usize()
                .checked_add(done)
                .and_then(Va::new)
                .ok_or(KernelError::BadAddress)?;
            let ofs = va.offset();
            let n = (PAGE_SIZE - ofs).min(len - done);
            loop {
                let result = self
                    .spt
                    .page_table()
                    .access(va, is_write, false, |page| f(done, &mut page[ofs..ofs + n]));
                match result {
                    Ok(()) => break,
                    Err(ec) => self.handle_page_fault(&PageFaultReason::new(ec, va, None))?,
                }
            }
            done += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{VmType, vm_init};
    use keos::{SystemConfigurationBuilder, addressing::USER_STACK};

    fn mm(frames: usize) -> MmStruct {
        MmStruct::new(&vm_init(
            &SystemConfigurationBuilder::new()
                .user_frames(frames)
                .swap_pages(8)
                .build(),
        ))
    }

    #[test]
    fn copies_across_pages() {
        let mut mm = mm(2);
        let base = Va::new(0x1000_0000).unwrap();
        mm.allocate_page(VmType::Anon, base, true).unwrap();
        mm.allocate_page(VmType::Anon, base + PAGE_SIZE, true).unwrap();
        let data = (0..100).collect::<alloc::vec::Vec<u8>>();
        mm.write_user(base + PAGE_SIZE - 50, &data).unwrap();
        let mut back = [0; 100];
        mm.read_user(base + PAGE_SIZE - 50, &mut back).unwrap();
        assert_eq!(&back[..], &data[..]);
        assert_eq!(mm.frames().len(), 2);
    }

    #[test]
    fn faults_are_reported() {
        let mut mm = mm(2);
        let ro = Va::new(0x1000_0000).unwrap();
        mm.allocate_page(VmType::Anon, ro, false).unwrap();
        assert_eq!(mm.write_user(ro, &[1]), Err(KernelError::InvalidAccess));
        let mut byte = [0xff];
        mm.read_user(ro, &mut byte).unwrap();
        assert_eq!(byte, [0]);
        // Now resident: the fault comes from the present page.
        assert_eq!(mm.write_user(ro, &[1]), Err(KernelError::InvalidAccess));
        assert_eq!(
            mm.read_user(ro + PAGE_SIZE, &mut byte),
            Err(KernelError::BadAddress)
        );
        assert_eq!(mm.read_user(ro, &mut []), Ok(()));
    }

    #[test]
    fn kernel_access_grows_the_stack() {
        let mut mm = mm(2);
        mm.setup_stack().unwrap();
        let rsp = USER_STACK - PAGE_SIZE - 64;
        mm.set_user_stack_pointer(rsp);
        let below = Va::new(rsp - 8).unwrap();
        mm.write_user(below, &[7; 8]).unwrap();
        assert_eq!(mm.spt().len(), 2);
        assert!(mm.spt().find(below).unwrap().writable());
    }
}
