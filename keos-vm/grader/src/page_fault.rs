use keos::{
    KernelError, SystemConfigurationBuilder,
    addressing::{MAX_STACK_SIZE, PAGE_SIZE, USER_STACK, Va},
    fs::{MemFile, RegularFile},
    task::PFErrorCode,
};
use keos_vm::{MmStruct, PageFaultReason, VmType, vm_init};

fn mm() -> MmStruct {
    MmStruct::new(&vm_init(
        &SystemConfigurationBuilder::new()
            .user_frames(8)
            .swap_pages(8)
            .build(),
    ))
}

fn push(addr: usize, rsp: usize) -> PageFaultReason {
    PageFaultReason::new(
        PFErrorCode::USER | PFErrorCode::WRITE_ACCESS,
        Va::new(addr).unwrap(),
        Some(rsp),
    )
}

pub fn stack_growth() {
    let mut mm = mm();
    mm.setup_stack().unwrap();
    let rsp = USER_STACK - PAGE_SIZE;
    mm.handle_page_fault(&push(rsp - 8, rsp)).unwrap();
    let page = mm.spt().find(Va::new(rsp - 8).unwrap()).unwrap();
    assert_eq!(page.vm_type(), VmType::Anon);
    assert!(page.writable(), "A stack page must be writable");
    assert!(page.is_resident());

    mm.set_user_stack_pointer(rsp - 8);
    mm.write_user(Va::new(rsp - 8).unwrap(), &0xdead_beef_u64.to_le_bytes())
        .unwrap();
    let mut word = [0; 8];
    mm.read_user(Va::new(rsp - 8).unwrap(), &mut word).unwrap();
    assert_eq!(u64::from_le_bytes(word), 0xdead_beef);
    assert_eq!(mm.spt().len(), 2);
}

pub fn stack_limit() {
    let mut mm = mm();
    let lowest = USER_STACK - MAX_STACK_SIZE;
    mm.handle_page_fault(&push(lowest, lowest + 8)).unwrap();
    assert_eq!(
        mm.handle_page_fault(&push(lowest - 8, lowest)),
        Err(KernelError::BadAddress),
        "The stack must not grow beyond its maximum size"
    );
    assert_eq!(
        mm.handle_page_fault(&push(USER_STACK - 4 * PAGE_SIZE, USER_STACK - PAGE_SIZE)),
        Err(KernelError::BadAddress),
        "An access far below the stack pointer is not a stack access"
    );
    assert_eq!(mm.spt().len(), 1);
}

pub fn kernel_address() {
    let mut mm = mm();
    mm.setup_stack().unwrap();
    let frames = mm.frames().len();
    let mapped = mm.spt().page_table().len();
    for addr in [0xffff_ff00_0090_0000, 0xffff_8000_0000_0000, USER_STACK] {
        assert_eq!(
            mm.handle_page_fault(&push(addr, USER_STACK)),
            Err(KernelError::BadAddress)
        );
    }
    assert_eq!(mm.spt().len(), 1, "A bad fault must not allocate pages");
    assert_eq!(mm.frames().len(), frames, "A bad fault must not take frames");
    assert_eq!(mm.spt().page_table().len(), mapped);
}

pub fn bad_code_write() {
    let mut mm = mm();
    let code = (0..PAGE_SIZE).map(|i| i as u8).collect::<Vec<_>>();
    let file = RegularFile::new(MemFile::new(&code));
    let text = Va::new(0x40_0000).unwrap();
    mm.load_segment(&file, 0, text, PAGE_SIZE, 0, false).unwrap();

    let write = PageFaultReason::new(
        PFErrorCode::USER | PFErrorCode::WRITE_ACCESS,
        text,
        Some(USER_STACK),
    );
    assert_eq!(mm.handle_page_fault(&write), Err(KernelError::InvalidAccess));
    assert!(!mm.spt().find(text).unwrap().is_resident());

    let fetch = PageFaultReason::new(PFErrorCode::USER, text, Some(USER_STACK));
    mm.handle_page_fault(&fetch).unwrap();
    let present = PageFaultReason::new(
        PFErrorCode::USER | PFErrorCode::WRITE_ACCESS | PFErrorCode::PRESENT,
        text,
        Some(USER_STACK),
    );
    assert_eq!(mm.handle_page_fault(&present), Err(KernelError::InvalidAccess));
    let mut buf = [0; 4];
    mm.read_user(text + 0x10, &mut buf).unwrap();
    assert_eq!(buf, [0x10, 0x11, 0x12, 0x13]);
}
