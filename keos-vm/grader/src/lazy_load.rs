use keos::{
    SystemConfigurationBuilder,
    addressing::{PAGE_SIZE, Va},
    fs::{MemFile, RegularFile},
};
use keos_vm::{LazyLoad, MmStruct, VmType, vm_init};

fn mm(frames: usize) -> MmStruct {
    MmStruct::new(&vm_init(
        &SystemConfigurationBuilder::new()
            .user_frames(frames)
            .swap_pages(16)
            .build(),
    ))
}

pub fn uninit_until_touched() {
    let mut mm = mm(4);
    let file = RegularFile::new(MemFile::new(b"hello, lazy world"));
    let va = Va::new(0x1000_0000).unwrap();
    let loader = LazyLoad::new(file, 0, 17, PAGE_SIZE - 17).unwrap();
    mm.allocate_deferred(VmType::File, va, false, Some(loader))
        .unwrap();

    let page = mm.spt().find(va).unwrap();
    assert_eq!(
        page.vm_type(),
        VmType::Uninit,
        "A page must stay uninitialized until it is touched"
    );
    assert!(
        mm.frames().is_empty(),
        "Allocating a page must not consume a frame"
    );
    assert!(
        mm.spt().page_table().walk(va).is_err(),
        "An untouched page must not be mapped"
    );

    let mut buf = [0xff; 20];
    mm.read_user(va, &mut buf).unwrap();
    assert_eq!(&buf[..17], b"hello, lazy world");
    assert_eq!(&buf[17..], &[0; 3], "The tail of the page must be zero");
    assert_eq!(mm.spt().find(va).unwrap().vm_type(), VmType::File);
    assert_eq!(mm.frames().len(), 1);
}

pub fn segment_from_file() {
    let mut mm = mm(2);
    let image = (0..2 * PAGE_SIZE).map(|i| (i / 7) as u8).collect::<Vec<_>>();
    let file = RegularFile::new(MemFile::new(&image));
    let base = Va::new(0x40_0000).unwrap();
    mm.load_segment(&file, 0, base, 2 * PAGE_SIZE, 2 * PAGE_SIZE, true)
        .unwrap();
    assert_eq!(mm.spt().len(), 4);

    // More pages than frames: the segment survives eviction to swap.
    let original = |n: usize| match n {
        0 | 1 => image[n * PAGE_SIZE..(n + 1) * PAGE_SIZE].to_vec(),
        _ => vec![0; PAGE_SIZE],
    };
    let mut buf = vec![0; PAGE_SIZE];
    for n in 0..4 {
        mm.read_user(base + n * PAGE_SIZE, &mut buf).unwrap();
        assert_eq!(buf, original(n));
        mm.write_user(base + n * PAGE_SIZE, &[0xee]).unwrap();
    }
    for n in 0..4 {
        mm.read_user(base + n * PAGE_SIZE, &mut buf).unwrap();
        let mut expected = original(n);
        expected[0] = 0xee;
        assert_eq!(buf, expected, "Page {} lost its contents", n);
    }
    let mut first = [0];
    file.read(PAGE_SIZE, &mut first).unwrap();
    assert_eq!(
        first[0], image[PAGE_SIZE],
        "Writes to a loaded segment must never reach the executable"
    );
}

pub fn access_ok_does_not_claim() {
    let mut mm = mm(2);
    let ro = Va::new(0x1000).unwrap();
    let rw = Va::new(0x2000).unwrap();
    mm.allocate_page(VmType::Anon, ro, false).unwrap();
    mm.allocate_page(VmType::Anon, rw, true).unwrap();

    assert!(mm.access_ok(ro..ro + 0xfff, false));
    assert!(
        !mm.access_ok(ro..ro + 0xfff, true),
        "access_ok() with write attempt to read-only memory area should return false"
    );
    assert!(mm.access_ok(rw..rw + 0x1000, true));
    assert!(
        !mm.access_ok(rw..rw + 0x1001, false),
        "access_ok() with unallocated memory area should return false"
    );
    let null = Va::new(0).unwrap();
    assert!(!mm.access_ok(null..null + 1, false));
    assert!(mm.frames().is_empty());
}
