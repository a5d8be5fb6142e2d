use keos::{
    SystemConfigurationBuilder,
    addressing::{PAGE_SIZE, Va},
};
use keos_vm::{MmStruct, VmType, vm_init};

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

pub fn no_aliasing() {
    let mut parent = mm(8, 8);
    parent.allocate_page(VmType::Anon, va(0), true).unwrap();
    parent.write_user(va(0), b"parent").unwrap();
    let mut child = parent.fork().unwrap();

    child.write_user(va(0), b"child!").unwrap();
    let mut buf = [0; 6];
    parent.read_user(va(0), &mut buf).unwrap();
    assert_eq!(&buf, b"parent", "A child's write must not reach its parent");

    parent.write_user(va(0), b"PARENT").unwrap();
    child.read_user(va(0), &mut buf).unwrap();
    assert_eq!(&buf, b"child!", "A parent's write must not reach its child");
    assert_ne!(
        parent.spt().find(va(0)).unwrap().frame_pa(),
        child.spt().find(va(0)).unwrap().frame_pa()
    );
}

pub fn fork_after_eviction() {
    let mut parent = mm(3, 16);
    for n in 0..4 {
        parent.allocate_page(VmType::Anon, va(n), n % 2 == 0).unwrap();
        if n % 2 == 0 {
            parent.write_user(va(n), &[n as u8 + 0x40; 32]).unwrap();
        }
    }
    let mut child = parent.fork().unwrap();
    assert_eq!(child.spt().len(), 4);
    for n in 0..4 {
        let (p, c) = (parent.spt().find(va(n)).unwrap(), child.spt().find(va(n)).unwrap());
        assert_eq!(p.writable(), c.writable(), "Permissions must be preserved");
    }
    for n in (0..4).step_by(2) {
        let mut buf = [0; 32];
        child.read_user(va(n), &mut buf).unwrap();
        assert_eq!(buf, [n as u8 + 0x40; 32]);
    }
    assert!(
        child.frames().len() <= 3,
        "The child shares the system's frame pool"
    );
}

pub fn child_outlives_parent() {
    let parent = {
        let mut parent = mm(4, 8);
        parent.allocate_page(VmType::Anon, va(0), true).unwrap();
        parent.write_user(va(0), &[0x77]).unwrap();
        parent
    };
    let frames = parent.frames().clone();
    let mut child = parent.fork().unwrap();
    drop(parent);
    assert_eq!(frames.len(), 1, "The parent's frames must be released");
    let mut byte = [0];
    child.read_user(va(0), &mut byte).unwrap();
    assert_eq!(byte, [0x77]);
    drop(child);
    assert!(frames.is_empty());
    assert_eq!(frames.swap().used(), 0);
}
