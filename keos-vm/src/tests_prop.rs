#![cfg(test)]
//! Property tests of the paging machinery under random access patterns.
//!
//! A small pool of frames is shared by more pages than it can hold, so most
//! accesses evict something. After every step, the supplemental page table,
//! the hardware page table and the frame table must agree, and every page
//! must read back what was last written to it.

use crate::{MmStruct, VmType, vm_init};
use alloc::{collections::BTreeSet, vec::Vec};
use keos::{
    SystemConfigurationBuilder,
    addressing::{PAGE_SIZE, Va},
};
use proptest::prelude::*;

const PAGES: usize = 6;

#[derive(Debug, Clone)]
enum Op {
    Write { page: usize, at: usize, value: u8 },
    Read { page: usize, at: usize },
    Evict,
    Fork,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..PAGES, 0..PAGE_SIZE, any::<u8>())
            .prop_map(|(page, at, value)| Op::Write { page, at, value }),
        4 => (0..PAGES, 0..PAGE_SIZE).prop_map(|(page, at)| Op::Read { page, at }),
        1 => Just(Op::Evict),
        1 => Just(Op::Fork),
    ]
}

fn va(page: usize) -> Va {
    Va::new(0x2000_0000 + page * PAGE_SIZE).unwrap()
}

fn check_consistency(mm: &MmStruct) -> Result<(), TestCaseError> {
    let page_table = mm.spt().page_table();
    let mut resident = BTreeSet::new();
    for page in mm.spt().iter() {
        let mapped = page_table.walk(page.va()).ok().and_then(|pte| pte.pa());
        prop_assert_eq!(page.frame_pa(), mapped);
        if let Some(pa) = page.frame_pa() {
            prop_assert!(resident.insert(pa), "frame {:?} mapped twice", pa);
        }
    }
    prop_assert_eq!(page_table.len(), resident.len());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn paging_preserves_contents(frames in 1usize..4, ops in prop::collection::vec(arb_op(), 1..48)) {
        let table = vm_init(
            &SystemConfigurationBuilder::new()
                .user_frames(frames)
                .swap_pages(4 * PAGES)
                .build(),
        );
        let mut mm = MmStruct::new(&table);
        for page in 0..PAGES {
            mm.allocate_page(VmType::Anon, va(page), true).unwrap();
        }
        let mut model = alloc::vec![alloc::vec![0u8; PAGE_SIZE]; PAGES];
        // Forked children are kept alive so they compete for frames.
        let mut children = Vec::new();

        for op in ops {
            match op {
                Op::Write { page, at, value } => {
                    mm.write_user(va(page) + at, &[value]).unwrap();
                    model[page][at] = value;
                }
                Op::Read { page, at } => {
                    let mut byte = [0];
                    mm.read_user(va(page) + at, &mut byte).unwrap();
                    prop_assert_eq!(byte[0], model[page][at]);
                }
                Op::Evict => {
                    let _ = table.evict_one();
                }
                Op::Fork => {
                    if children.len() < 2 {
                        children.push((mm.fork().unwrap(), model.clone()));
                    }
                }
            }
            check_consistency(&mm)?;
            prop_assert!(table.len() <= table.capacity());
        }

        let mut buf = alloc::vec![0; PAGE_SIZE];
        for page in 0..PAGES {
            mm.read_user(va(page), &mut buf).unwrap();
            prop_assert_eq!(&buf, &model[page]);
        }
        for (child, snapshot) in children.iter_mut() {
            check_consistency(child)?;
            for page in 0..PAGES {
                child.read_user(va(page), &mut buf).unwrap();
                prop_assert_eq!(&buf, &snapshot[page]);
            }
        }
        drop(children);
        drop(mm);
        prop_assert!(table.is_empty());
        prop_assert_eq!(table.swap().used(), 0);
    }
}
