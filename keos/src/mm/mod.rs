//! Memory Management.
//!
//! This module implements the physical memory allocator of the hosted kernel.
//! The core abstraction is the [`Page`], which represents a single physical
//! frame handed out by a [`Palloc`].
//!
//! Memory allocation and deallocation is tied to Rust's ownership system: a
//! frame is allocated by [`Palloc::get_user_frame`], which returns a [`Page`]
//! that exclusively owns it. Once the [`Page`] instance is dropped, the frame
//! is automatically returned to its pool, so a frame can neither leak nor be
//! freed twice.
//!
//! The pool is a fixed number of frames chosen at construction. Exhausting it
//! is an ordinary condition: [`Palloc::get_user_frame`] returns `None` and the
//! virtual memory subsystem is expected to evict something.
pub mod page_table;

use crate::addressing::{PAGE_SHIFT, PAGE_SIZE, Pa};
use crossbeam_queue::ArrayQueue;
use std::{cell::UnsafeCell, sync::Arc};

/// Physical address of the first frame of every pool.
const PA_BASE: usize = 0x10_0000;

struct FrameCell(UnsafeCell<[u8; PAGE_SIZE]>);

// Frames are only reached through a `Page` (exclusive owner) or a `PageRef`
// created under the translation table lock.
unsafe impl Sync for FrameCell {}

/// A pool of physical frames for user pages.
///
/// Free frames are kept in a lock-free queue, so allocation and release never
/// block.
pub struct Palloc {
    ram: Box<[FrameCell]>,
    free: ArrayQueue<usize>,
}

impl Palloc {
    /// Creates a pool of `nframes` physical frames.
    pub fn new(nframes: usize) -> Arc<Self> {
        let ram = (0..nframes)
            .map(|_| FrameCell(UnsafeCell::new([0; PAGE_SIZE])))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let free = ArrayQueue::new(nframes.max(1));
        for idx in 0..nframes {
            let _ = free.push(idx);
        }
        Arc::new(Self { ram, free })
    }

    /// Total number of frames in the pool.
    pub fn capacity(&self) -> usize {
        self.ram.len()
    }

    /// Number of frames currently free.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Allocates one zero-filled frame.
    ///
    /// # Returns
    /// - `Some(Page)` owning the frame.
    /// - `None` if the pool is exhausted.
    pub fn get_user_frame(self: &Arc<Self>) -> Option<Page> {
        let idx = self.free.pop()?;
        let mut page = Page {
            pa: Pa::new(PA_BASE + (idx << PAGE_SHIFT))?,
            pool: self.clone(),
        };
        page.inner_mut().fill(0);
        Some(page)
    }

    /// Builds a reference to the frame at `pa`.
    ///
    /// # Safety
    /// The frame must be held by another object for the lifetime of the
    /// reference, and the caller must not create overlapping mutable access.
    pub unsafe fn page_ref(&self, pa: Pa) -> Option<PageRef<'_>> {
        let idx = self.index_of(pa)?;
        Some(PageRef {
            pa,
            ptr: self.ram[idx].0.get() as *mut u8,
            _lt: core::marker::PhantomData,
        })
    }

    fn index_of(&self, pa: Pa) -> Option<usize> {
        let idx = pa.into_usize().checked_sub(PA_BASE)? >> PAGE_SHIFT;
        (pa.offset() == 0 && idx < self.ram.len()).then_some(idx)
    }

    fn frame_ptr(&self, pa: Pa) -> *mut u8 {
        match self.index_of(pa) {
            Some(idx) => self.ram[idx].0.get() as *mut u8,
            None => unreachable!("{:?} does not belong to this pool", pa),
        }
    }
}

/// A reference of a memory page.
///
/// `PageRef` borrows a frame that is owned by someone else, typically a
/// resident page reached through a translation table entry.
pub struct PageRef<'a> {
    pa: Pa,
    ptr: *mut u8,
    _lt: core::marker::PhantomData<&'a ()>,
}

impl PageRef<'_> {
    /// Get the physical address of this page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// Get a reference to the underlying slice of the page (read-only).
    pub fn inner(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr, PAGE_SIZE) }
    }

    /// Get a mutable reference to the underlying slice of the page.
    pub fn inner_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr, PAGE_SIZE) }
    }
}

/// A representation of a memory page.
///
/// The [`Page`] exclusively owns one physical frame. Dropping it returns the
/// frame to the [`Palloc`] it came from.
pub struct Page {
    pa: Pa,
    pool: Arc<Palloc>,
}

impl Page {
    /// Get the physical address of this page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// Get a reference to the underlying slice of the page (read-only).
    pub fn inner(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.pool.frame_ptr(self.pa), PAGE_SIZE) }
    }

    /// Get a mutable reference to the underlying slice of the page.
    pub fn inner_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.pool.frame_ptr(self.pa), PAGE_SIZE) }
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page").field("pa", &self.pa).finish()
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let Some(idx) = self.pool.index_of(self.pa) {
            let _ = self.pool.free.push(idx);
        }
    }
}
