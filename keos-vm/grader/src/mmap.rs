use keos::{
    KernelError, SystemConfigurationBuilder,
    addressing::{PAGE_SIZE, Va},
    fs::{MemFile, RegularFile},
};
use keos_vm::{MmStruct, VmType, vm_init};

fn mm(frames: usize) -> MmStruct {
    MmStruct::new(&vm_init(
        &SystemConfigurationBuilder::new()
            .user_frames(frames)
            .swap_pages(8)
            .build(),
    ))
}

fn contents(file: &RegularFile) -> Vec<u8> {
    let mut buf = vec![0; file.size()];
    let n = file.read(0, &mut buf).unwrap();
    buf.truncate(n);
    buf
}

pub fn clean_unmap() {
    let mut mm = mm(4);
    let data = (0..PAGE_SIZE).map(|i| (i % 13) as u8).collect::<Vec<_>>();
    let file = RegularFile::new(MemFile::new(&data));
    let addr = mm
        .mmap(Va::new(0x1000_0000).unwrap(), PAGE_SIZE, true, Some(&file), 0)
        .unwrap();
    let page = mm.spt().find(addr).unwrap();
    assert_eq!(page.vm_type(), VmType::Uninit, "mmap() must not read the file");

    let mut buf = vec![0; PAGE_SIZE];
    mm.read_user(addr, &mut buf).unwrap();
    assert_eq!(buf, data);
    mm.munmap(addr).unwrap();
    assert!(mm.spt().is_empty());
    assert!(mm.frames().is_empty());
    assert_eq!(contents(&file), data, "A clean mapping must leave the file unchanged");
}

pub fn dirty_writeback() {
    let mut mm = mm(4);
    let file = RegularFile::new(MemFile::new(&[b'.'; 2 * PAGE_SIZE]));
    let addr = mm
        .mmap(Va::new(0x1000_0000).unwrap(), 2 * PAGE_SIZE, true, Some(&file), 0)
        .unwrap();
    mm.write_user(addr + PAGE_SIZE - 2, b"abcd").unwrap();
    mm.munmap(addr).unwrap();

    let after = contents(&file);
    assert_eq!(after.len(), 2 * PAGE_SIZE);
    assert_eq!(&after[PAGE_SIZE - 3..PAGE_SIZE + 3], b".abcd.");
    assert_eq!(
        mm.munmap(addr),
        Err(KernelError::InvalidArgument),
        "A region can be unmapped only once"
    );
}

pub fn partial_last_page() {
    let mut mm = mm(1);
    let file = RegularFile::new(MemFile::new(&[7; PAGE_SIZE + 10]));
    let addr = mm
        .mmap(Va::new(0x1000_0000).unwrap(), 3 * PAGE_SIZE, true, Some(&file), 0)
        .unwrap();
    assert_eq!(mm.spt().len(), 3);

    let mut buf = [0xff; 12];
    mm.read_user(addr + PAGE_SIZE, &mut buf).unwrap();
    assert_eq!(&buf[..10], &[7; 10]);
    assert_eq!(&buf[10..], &[0; 2], "Bytes past the end of the file must be zero");

    // Evicting a dirty file page writes it back but never grows the file.
    mm.write_user(addr + PAGE_SIZE + 5, &[1]).unwrap();
    mm.write_user(addr + 2 * PAGE_SIZE, &[2]).unwrap();
    assert!(!mm.spt().find(addr + PAGE_SIZE).unwrap().is_resident());
    assert_eq!(file.size(), PAGE_SIZE + 10);
    assert_eq!(contents(&file)[PAGE_SIZE + 5], 1);
    let mut byte = [0];
    mm.read_user(addr + PAGE_SIZE + 5, &mut byte).unwrap();
    assert_eq!(byte, [1]);
    mm.munmap(addr).unwrap();
    assert_eq!(file.size(), PAGE_SIZE + 10);
}

pub fn bad_arguments() {
    let mut mm = mm(2);
    let file = RegularFile::new(MemFile::new(&[1; PAGE_SIZE]));
    let empty = RegularFile::new(MemFile::new(&[]));
    let va = Va::new(0x1000_0000).unwrap();

    assert_eq!(
        mm.mmap(Va::new(0).unwrap(), PAGE_SIZE, true, Some(&file), 0),
        Err(KernelError::InvalidArgument),
        "mmap() to NULL should result in InvalidArgument"
    );
    assert_eq!(
        mm.mmap(va + 0x10, PAGE_SIZE, true, Some(&file), 0),
        Err(KernelError::InvalidArgument),
        "Misaligned mmap() should result in InvalidArgument"
    );
    assert_eq!(
        mm.mmap(va, 0, true, Some(&file), 0),
        Err(KernelError::InvalidArgument)
    );
    assert_eq!(
        mm.mmap(va, PAGE_SIZE, true, Some(&empty), 0),
        Err(KernelError::InvalidArgument),
        "An empty file cannot be mapped"
    );
    assert_eq!(
        mm.mmap(Va::new(0xffff_8000_0000_0000).unwrap(), PAGE_SIZE, true, Some(&file), 0),
        Err(KernelError::BadAddress),
        "mmap() to Kernel Virtual Address should fail"
    );

    mm.mmap(va, PAGE_SIZE, false, Some(&file), 0).unwrap();
    assert_eq!(
        mm.mmap(va, PAGE_SIZE, true, None, 0),
        Err(KernelError::FileExist),
        "Overlapping mmap() should fail"
    );
    assert_eq!(
        mm.write_user(va, &[0]),
        Err(KernelError::InvalidAccess),
        "A read-only mapping must reject writes"
    );
    assert_eq!(
        mm.munmap(va + PAGE_SIZE),
        Err(KernelError::InvalidArgument)
    );
    assert_eq!(mm.spt().len(), 1);
}

pub fn exit_writes_back() {
    let file = RegularFile::new(MemFile::new(&[0; 3 * PAGE_SIZE]));
    let frames = {
        let mut mm = mm(2);
        let addr = mm
            .mmap(Va::new(0x1000_0000).unwrap(), 3 * PAGE_SIZE, true, Some(&file), 0)
            .unwrap();
        for n in 0..3 {
            mm.write_user(addr + n * PAGE_SIZE, &[n as u8 + 1]).unwrap();
        }
        mm.frames().clone()
    };
    let after = contents(&file);
    for n in 0..3 {
        assert_eq!(
            after[n * PAGE_SIZE],
            n as u8 + 1,
            "Exiting must write dirty mapped pages back"
        );
    }
    assert!(frames.is_empty());
}
