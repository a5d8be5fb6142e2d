//! # Demand-paged virtual memory for KeOS.
//!
//! This crate implements the virtual memory subsystem of KeOS: pages are
//! not backed by physical memory until they are touched, physical frames are
//! shared by every address space of the system and reclaimed with the clock
//! algorithm when they run out, and evicted contents are written back to swap
//! or to the file they came from.
//!
//! ## Overview
//!
//! Every address space ([`MmStruct`]) owns a [`SupplementalPageTable`] that
//! records each virtual page of the address space, resident or not, as a
//! [`VmPage`]. The hardware page table only ever maps the resident subset.
//! A page goes through the following life:
//!
//! 1. It is created *uninitialized* by [`SupplementalPageTable::allocate_page`]
//!    or [`SupplementalPageTable::allocate_deferred`], carrying an optional
//!    [`LazyLoad`] describing where its first contents come from.
//! 2. The first access raises a page fault. [`MmStruct::handle_page_fault`]
//!    finds the page and *claims* it: a frame is acquired from the
//!    [`FrameTable`], the contents are materialized and the mapping is
//!    installed. The page is now anonymous ([`anon`]) or file-backed
//!    ([`file`]).
//! 3. When the frame pool is exhausted, [`FrameTable::acquire_frame`] evicts a
//!    victim chosen by the clock policy. Its contents go to its backing store
//!    and its mapping is removed; the next access claims it again.
//! 4. Removing the page, unmapping its region, or dropping the address space
//!    destroys it and releases the frame and swap slot it held.
//!
//! ## Locking
//!
//! Each page has its own lock, and the frame table has one lock for its
//! membership and cursor. Locks are always taken in the order *page*, *frame
//! table*, *page table*. The holder of the frame table lock never waits for a
//! page lock: victim selection marks the chosen frame busy, drops the table
//! lock, then takes the victim's lock.
//!
//! ## Getting started
//!
//! ```
//! use keos::{SystemConfigurationBuilder, addressing::Va};
//! use keos_vm::{MmStruct, VmType, vm_init};
//!
//! let frames = vm_init(&SystemConfigurationBuilder::new().user_frames(4).build());
//! let mut mm = MmStruct::new(&frames);
//! let va = Va::new(0x1000).unwrap();
//! mm.allocate_page(VmType::Anon, va, true).unwrap();
//! mm.write_user(va, &[0xab]).unwrap();
//! let mut byte = [0];
//! mm.read_user(va, &mut byte).unwrap();
//! assert_eq!(byte, [0xab]);
//! ```
#![no_std]
#![deny(missing_docs)]

extern crate alloc;
#[macro_use]
extern crate keos;
#[cfg(test)]
extern crate std;

pub mod anon;
pub mod file;
pub mod fork;
pub mod frame;
pub mod lazy_pager;
pub mod loader;
pub mod mm_struct;
pub mod page;
pub mod page_fault;
pub mod spt;
pub mod uaccess;

#[cfg(test)]
mod tests_prop;

pub use frame::{Frame, FrameTable};
pub use lazy_pager::LazyLoad;
pub use mm_struct::MmStruct;
pub use page::VmPage;
pub use page_fault::PageFaultReason;
pub use spt::SupplementalPageTable;

use alloc::sync::Arc;
use keos::{
    SystemConfiguration,
    fs::Disk,
    mm::Palloc,
    swap::{SECTORS_PER_PAGE, SwapDisk},
};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Kind of the backing store of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum VmType {
    /// Not materialized yet. Only valid as the current state of a page, never
    /// as the type requested at allocation.
    Uninit = 0,
    /// Contents live in memory or in swap.
    Anon = 1,
    /// Contents mirror a region of a file.
    File = 2,
}

/// Initializes the virtual memory subsystem.
///
/// Builds the physical frame pool and the swap area sized by `config`, and
/// returns the frame table shared by every address space.
pub fn vm_init(config: &SystemConfiguration) -> Arc<FrameTable> {
    let palloc = Palloc::new(config.user_frames);
    let swap = SwapDisk::new(Disk::new(config.swap_pages * SECTORS_PER_PAGE));
    info!(
        "VM: {} user frames, {} swap slots.",
        palloc.capacity(),
        swap.capacity()
    );
    FrameTable::new(palloc, Arc::new(swap))
}
