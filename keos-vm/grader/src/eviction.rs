use keos::{
    KernelError, SystemConfigurationBuilder,
    addressing::{PAGE_SIZE, Va},
    fs::{Disk, Hook, Sector},
    mm::Palloc,
    swap::{SECTORS_PER_PAGE, SwapDisk},
};
use keos_vm::{FrameTable, MmStruct, VmType, vm_init};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
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
    Va::new(0x1000 + n * PAGE_SIZE).unwrap()
}

fn read_byte(mm: &mut MmStruct, va: Va) -> u8 {
    let mut byte = [0];
    mm.read_user(va, &mut byte).unwrap();
    byte[0]
}

pub fn anon_round_trip() {
    let mut mm = mm(1, 4);
    mm.allocate_page(VmType::Anon, va(0), true).unwrap();
    mm.allocate_page(VmType::Anon, va(1), true).unwrap();
    mm.write_user(va(0), &[0xab]).unwrap();

    // The only frame goes to the second page.
    mm.write_user(va(1), &[0xcd]).unwrap();
    let first = mm.spt().find(va(0)).unwrap();
    assert!(!first.is_resident(), "The first page should have been evicted");
    assert!(first.swap_slot().is_some(), "An evicted anonymous page lives in swap");
    assert!(mm.spt().page_table().walk(va(0)).is_err());

    assert_eq!(read_byte(&mut mm, va(0)), 0xab);
    assert_eq!(
        mm.spt().find(va(0)).unwrap().swap_slot(),
        None,
        "Swapping in must release the slot"
    );
    assert_eq!(read_byte(&mut mm, va(1)), 0xcd);
    assert_eq!(mm.frames().len(), 1);
}

pub fn second_chance() {
    let mut mm = mm(2, 4);
    for n in 0..3 {
        mm.allocate_page(VmType::Anon, va(n), true).unwrap();
    }
    mm.write_user(va(0), &[1]).unwrap();
    mm.write_user(va(1), &[2]).unwrap();

    // Both pages were accessed: the sweep clears both bits and takes the
    // first one it meets again.
    drop(mm.frames().evict_one().unwrap());
    assert!(!mm.spt().find(va(0)).unwrap().is_resident());
    assert!(!mm.spt().page_table().is_accessed(va(1)));

    // The first page comes back and is accessed again; the second page was
    // not accessed since the sweep and goes first.
    assert_eq!(read_byte(&mut mm, va(0)), 1);
    mm.write_user(va(2), &[3]).unwrap();
    assert!(mm.spt().find(va(0)).unwrap().is_resident());
    assert!(
        !mm.spt().find(va(1)).unwrap().is_resident(),
        "A page accessed since the last sweep must get a second chance"
    );
    for n in 0..3 {
        assert_eq!(read_byte(&mut mm, va(n)), n as u8 + 1);
    }
}

pub fn swap_write_failure() {
    let failing = Arc::new(AtomicBool::new(false));
    let hook: Hook = {
        let failing = failing.clone();
        Arc::new(move |_: Sector, _: &[u8; 512], is_write: bool| {
            if is_write && failing.load(Ordering::SeqCst) {
                Err(KernelError::IOError)
            } else {
                Ok(())
            }
        })
    };
    let swap = SwapDisk::new(Disk::new(4 * SECTORS_PER_PAGE).hook(hook));
    let frames = FrameTable::new(Palloc::new(1), Arc::new(swap));
    let mut mm = MmStruct::new(&frames);
    mm.allocate_page(VmType::Anon, va(0), true).unwrap();
    mm.allocate_page(VmType::Anon, va(1), true).unwrap();
    mm.write_user(va(0), &[0x5a]).unwrap();
    let pa = mm.spt().find(va(0)).unwrap().frame_pa();

    failing.store(true, Ordering::SeqCst);
    assert_eq!(mm.write_user(va(1), &[0xa5]), Err(KernelError::IOError));
    let victim = mm.spt().find(va(0)).unwrap();
    assert_eq!(
        victim.frame_pa(),
        pa,
        "A failed eviction must leave the victim resident"
    );
    assert_eq!(
        mm.spt().page_table().walk(va(0)).ok().and_then(|pte| pte.pa()),
        pa,
        "A failed eviction must leave the victim mapped"
    );
    assert!(mm.spt().page_table().is_dirty(va(0)));
    assert_eq!(victim.swap_slot(), None);
    assert_eq!(frames.swap().used(), 0);
    assert!(!mm.spt().find(va(1)).unwrap().is_resident());

    failing.store(false, Ordering::SeqCst);
    mm.write_user(va(1), &[0xa5]).unwrap();
    assert_eq!(read_byte(&mut mm, va(0)), 0x5a);
    assert_eq!(read_byte(&mut mm, va(1)), 0xa5);
}

pub fn swap_exhausted() {
    let mut mm = mm(1, 1);
    for n in 0..3 {
        mm.allocate_page(VmType::Anon, va(n), true).unwrap();
    }
    mm.write_user(va(0), &[1]).unwrap();
    mm.write_user(va(1), &[2]).unwrap();
    assert_eq!(mm.frames().swap().used(), 1);
    assert_eq!(mm.write_user(va(2), &[3]), Err(KernelError::NoSpace));
    assert!(mm.spt().find(va(1)).unwrap().is_resident());
    assert_eq!(read_byte(&mut mm, va(1)), 2);

    // Tearing a page down gives its slot back.
    assert!(mm.spt_mut().remove(va(0)));
    assert_eq!(mm.frames().swap().used(), 0);
    mm.write_user(va(2), &[3]).unwrap();
    assert_eq!(read_byte(&mut mm, va(2)), 3);
}
