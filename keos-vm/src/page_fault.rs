//! # Page fault resolution.
//!
//! With demand paging, a page fault is the normal way a page becomes
//! resident. The resolver decides whether a fault is such a legitimate access
//! to a non-resident page, an access just below the stack that should grow
//! it, or a bad access that must kill the process.
//!
//! ## Stack growth
//!
//! The user stack starts as a single page right below [`USER_STACK`] and grows
//! on demand up to [`MAX_STACK_SIZE`]. An access is treated as a stack access
//! if it lies between `rsp - 8` and [`USER_STACK`]: `push` writes 8 bytes
//! below the stack pointer before moving it. The stack pointer of a fault
//! raised in user mode comes from the trap frame; a fault raised by the
//! kernel while touching user memory uses the stack pointer saved on entry to
//! the kernel ([`MmStruct::set_user_stack_pointer`]).
use crate::{MmStruct, VmType};
use keos::{
    KernelError,
    addressing::{MAX_STACK_SIZE, USER_STACK, Va},
    task::PFErrorCode,
};

/// Represents the reason for a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultReason {
    /// The address that caused the page fault.
    pub fault_addr: Va,

    /// Indicates whether the fault was due to a write access.
    pub is_write_access: bool,

    /// Indicates whether the faulting address has a translation.
    ///
    /// A fault on a present page is a protection violation; a fault on a
    /// non-present page may be resolved by demand paging.
    pub is_present: bool,

    /// Indicates whether the access was made in user mode.
    pub is_user: bool,

    /// The user stack pointer at the time of the fault, for faults raised
    /// in user mode.
    pub rsp: Option<usize>,
}

impl PageFaultReason {
    /// Probe the cause of page fault into a [`PageFaultReason`].
    ///
    /// # Parameters
    /// - `ec`: The error code pushed by the processor.
    /// - `cr2`: The faulting address.
    /// - `rsp`: The stack pointer of the trap frame, for user-mode faults.
    pub fn new(ec: PFErrorCode, cr2: Va, rsp: Option<usize>) -> Self {
        PageFaultReason {
            fault_addr: cr2,
            is_write_access: ec.contains(PFErrorCode::WRITE_ACCESS),
            is_present: ec.contains(PFErrorCode::PRESENT),
            is_user: ec.contains(PFErrorCode::USER),
            rsp,
        }
    }
}

fn is_stack_access(rsp: usize, addr: Va) -> bool {
    let addr = addr.into_usize();
    rsp.checked_sub(8).is_some_and(|low| {
        low >= USER_STACK - MAX_STACK_SIZE && low <= addr && addr < USER_STACK
    })
}

impl MmStruct {
    /// Resolves a page fault.
    ///
    /// # Returns
    /// - `Ok(())`: The faulting page is resident; the access can be retried.
    /// - `Err(KernelError::BadAddress)`: The address is null, in kernel
    ///   space, or has no page. Nothing was changed.
    /// - `Err(KernelError::InvalidAccess)`: The access violates the page's
    ///   protection.
    /// - `Err(KernelError)`: The page could not be made resident.
    pub fn handle_page_fault(&mut self, reason: &PageFaultReason) -> Result<(), KernelError> {
        let addr = reason.fault_addr;
        if !addr.is_user() {
            return Err(KernelError::BadAddress);
        }
        if reason.is_present {
            return Err(KernelError::InvalidAccess);
        }
        let rsp = if reason.is_user {
            reason.rsp
        } else {
            self.user_stack_pointer()
        };
        if rsp.is_some_and(|rsp| is_stack_access(rsp, addr)) && self.spt.find(addr).is_none() {
            debug!("Grow stack to {:?}.", addr.page_down());
            self.spt.allocate_page(VmType::Anon, addr.page_down(), true)?;
        }
        let page = self.spt.find(addr).ok_or(KernelError::BadAddress)?;
        if reason.is_write_access && !page.writable() {
            return Err(KernelError::InvalidAccess);
        }
        page.claim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_init;
    use keos::{SystemConfigurationBuilder, addressing::PAGE_SIZE};

    fn mm() -> MmStruct {
        MmStruct::new(&vm_init(
            &SystemConfigurationBuilder::new()
                .user_frames(4)
                .swap_pages(4)
                .build(),
        ))
    }

    fn user_fault(addr: usize, write: bool, rsp: usize) -> PageFaultReason {
        let mut ec = PFErrorCode::USER;
        ec.set(PFErrorCode::WRITE_ACCESS, write);
        PageFaultReason::new(ec, Va::new(addr).unwrap(), Some(rsp))
    }

    #[test]
    fn decode_error_code() {
        let reason = PageFaultReason::new(
            PFErrorCode::PRESENT | PFErrorCode::WRITE_ACCESS,
            Va::new(0x1234).unwrap(),
            None,
        );
        assert!(reason.is_present && reason.is_write_access && !reason.is_user);
    }

    #[test]
    fn kernel_address_has_no_side_effects() {
        let mut mm = mm();
        let reason = user_fault(0xffff_8000_0000_1000, true, USER_STACK - 64);
        assert_eq!(mm.handle_page_fault(&reason), Err(KernelError::BadAddress));
        let reason = user_fault(0, false, USER_STACK - 64);
        assert_eq!(mm.handle_page_fault(&reason), Err(KernelError::BadAddress));
        assert!(mm.spt().is_empty());
        assert!(mm.spt().page_table().is_empty());
        assert!(mm.frames().is_empty());
    }

    #[test]
    fn stack_grows_below_the_stack_pointer() {
        let mut mm = mm();
        let rsp = USER_STACK - 3 * PAGE_SIZE;
        mm.handle_page_fault(&user_fault(rsp - 8, true, rsp)).unwrap();
        let page = mm.spt().find(Va::new(rsp - 8).unwrap()).unwrap();
        assert_eq!(page.vm_type(), VmType::Anon);
        assert!(page.writable() && page.is_resident());
        assert_eq!(page.va(), Va::new(rsp - PAGE_SIZE).unwrap());
    }

    #[test]
    fn far_below_the_stack_pointer_is_bad() {
        let mut mm = mm();
        let rsp = USER_STACK - 3 * PAGE_SIZE;
        assert_eq!(
            mm.handle_page_fault(&user_fault(rsp - 16, true, rsp)),
            Err(KernelError::BadAddress)
        );
        let rsp = USER_STACK - MAX_STACK_SIZE - PAGE_SIZE;
        assert_eq!(
            mm.handle_page_fault(&user_fault(rsp, true, rsp)),
            Err(KernelError::BadAddress)
        );
        assert!(mm.spt().is_empty());
    }

    #[test]
    fn kernel_mode_fault_uses_the_saved_stack_pointer() {
        let mut mm = mm();
        let rsp = USER_STACK - 2 * PAGE_SIZE;
        let reason = PageFaultReason::new(
            PFErrorCode::WRITE_ACCESS,
            Va::new(rsp - 8).unwrap(),
            None,
        );
        assert_eq!(mm.handle_page_fault(&reason), Err(KernelError::BadAddress));
        mm.set_user_stack_pointer(rsp);
        mm.handle_page_fault(&reason).unwrap();
        assert!(mm.spt().find(Va::new(rsp - 8).unwrap()).is_some());
    }

    #[test]
    fn protection_violations() {
        let mut mm = mm();
        let ro = Va::new(0x1000_0000).unwrap();
        mm.allocate_page(VmType::Anon, ro, false).unwrap();
        assert_eq!(
            mm.handle_page_fault(&user_fault(ro.into_usize(), true, USER_STACK)),
            Err(KernelError::InvalidAccess)
        );
        assert!(!mm.spt().find(ro).unwrap().is_resident());

        mm.handle_page_fault(&user_fault(ro.into_usize(), false, USER_STACK))
            .unwrap();
        let present = PageFaultReason::new(
            PFErrorCode::PRESENT | PFErrorCode::WRITE_ACCESS | PFErrorCode::USER,
            ro,
            Some(USER_STACK),
        );
        assert_eq!(
            mm.handle_page_fault(&present),
            Err(KernelError::InvalidAccess)
        );
    }

    #[test]
    fn repeated_fault_is_benign() {
        let mut mm = mm();
        let va = Va::new(0x1000_0000).unwrap();
        mm.allocate_page(VmType::Anon, va, true).unwrap();
        let reason = user_fault(va.into_usize() + 8, true, USER_STACK);
        mm.handle_page_fault(&reason).unwrap();
        let pa = mm.spt().find(va).unwrap().frame_pa();
        mm.handle_page_fault(&reason).unwrap();
        assert_eq!(mm.spt().find(va).unwrap().frame_pa(), pa);
        assert_eq!(mm.frames().len(), 1);
    }
}
