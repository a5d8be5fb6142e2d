//! # Frame table and clock eviction.
//!
//! Physical frames are the scarcest resource of the system: every address
//! space competes for the same pool. The [`FrameTable`] is the single registry
//! of frames handed out to user pages. It remembers, for each frame, which
//! page currently occupies it, and when the pool runs dry it reclaims one of
//! them with the **clock** (second-chance) policy.
//!
//! ## Clock policy
//!
//! Frames are kept in acquisition order and a *hand* (the cursor) sweeps over
//! them. A frame whose page was accessed since the last sweep gets a second
//! chance: its accessed bit is cleared and the hand moves on. The first frame
//! found with a clear accessed bit becomes the victim and the hand stops right
//! after it, so that the next sweep resumes from there. After two full turns
//! every accessed bit has been cleared once, so a victim is always found unless
//! every frame is busy. In that case the caller backs off and sweeps again
//! until a frame is bound to its page or released.
//!
//! ## Busy frames
//!
//! A frame that is not bound to a page (the *owner* is unset) is **busy**: it
//! has just been acquired and is being filled, or it is being evicted. Busy
//! frames are never chosen as victims. The victim's owner is taken while the
//! table lock is held, so two evictors can never pick the same frame. The
//! write-back itself happens under the victim page's own lock, after the table
//! lock is dropped.
use crate::page::PageInner;
use alloc::{
    sync::{Arc, Weak},
    vec::Vec,
};
use crossbeam_utils::Backoff;
use keos::{
    KernelError,
    addressing::{Pa, Va},
    mm::{Page, Palloc, page_table::PageTable},
    swap::SwapDisk,
    sync::SpinLock,
};

/// A physical frame in use by a user page.
///
/// The frame belongs to exactly one [`VmPage`] at a time. Dropping it removes
/// it from the [`FrameTable`] and returns the physical memory to the pool.
///
/// [`VmPage`]: crate::VmPage
pub struct Frame {
    page: Page,
    table: Arc<FrameTable>,
}

impl Frame {
    /// Physical address of the frame.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.page.pa()
    }

    /// Contents of the frame.
    pub fn inner(&self) -> &[u8] {
        self.page.inner()
    }

    /// Mutable contents of the frame.
    pub fn inner_mut(&mut self) -> &mut [u8] {
        self.page.inner_mut()
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Frame").field("pa", &self.pa()).finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        let pa = self.pa();
        let mut clock = self.table.clock.lock();
        if let Some(idx) = clock.slots.iter().position(|slot| slot.pa == pa) {
            clock.slots.remove(idx);
            if idx < clock.cursor {
                clock.cursor -= 1;
            }
            if clock.cursor >= clock.slots.len() {
                clock.cursor = 0;
            }
        }
        clock.unlock();
    }
}

/// Back-reference from a frame to the page occupying it.
///
/// Both references are weak: the table never keeps a page or an address space
/// alive.
pub(crate) struct FrameOwner {
    pub(crate) va: Va,
    pub(crate) page: Weak<SpinLock<PageInner>>,
    pub(crate) page_table: Weak<PageTable>,
}

struct FrameSlot {
    pa: Pa,
    owner: Option<FrameOwner>,
}

/// Outcome of a sweep of the clock hand.
enum Victim {
    /// The frame at the address, now busy, with the page it held.
    Found(Pa, FrameOwner),
    /// Frames are in use but none can be evicted right now.
    Busy,
    /// No frame is in use.
    Empty,
}

struct Clock {
    slots: Vec<FrameSlot>,
    cursor: usize,
}

/// The system-wide registry of frames bound to user pages.
pub struct FrameTable {
    palloc: Arc<Palloc>,
    swap: Arc<SwapDisk>,
    clock: SpinLock<Clock>,
}

impl FrameTable {
    /// Creates a frame table that draws frames from `palloc` and evicts
    /// anonymous pages to `swap`.
    pub fn new(palloc: Arc<Palloc>, swap: Arc<SwapDisk>) -> Arc<Self> {
        Arc::new(Self {
            palloc,
            swap,
            clock: SpinLock::new(Clock {
                slots: Vec::new(),
                cursor: 0,
            }),
        })
    }

    /// The physical frame pool.
    pub fn palloc(&self) -> &Arc<Palloc> {
        &self.palloc
    }

    /// The swap area.
    pub fn swap(&self) -> &Arc<SwapDisk> {
        &self.swap
    }

    /// Total number of frames that can be in use at once.
    pub fn capacity(&self) -> usize {
        self.palloc.capacity()
    }

    /// Number of frames currently in use.
    pub fn len(&self) -> usize {
        let clock = self.clock.lock();
        let len = clock.slots.len();
        clock.unlock();
        len
    }

    /// Returns `true` if no frame is in use.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of the clock hand.
    pub fn cursor(&self) -> usize {
        let clock = self.clock.lock();
        let cursor = clock.cursor;
        clock.unlock();
        cursor
    }

    /// Acquires a zero-filled frame for a user page.
    ///
    /// A free frame is taken from the pool if there is one; otherwise a
    /// victim is evicted with the clock policy and its frame reused. While
    /// every frame in use is busy, this waits for one of them to be bound or
    /// released. The returned frame is busy until the page that claimed it
    /// is mapped.
    ///
    /// # Returns
    /// - `Ok(Frame)`: A frame exclusively owned by the caller.
    /// - `Err(KernelError::NoMemory)`: The pool has no frame at all.
    /// - `Err(KernelError)`: The victim's contents could not be written back.
    pub fn acquire_frame(self: &Arc<Self>) -> Result<Frame, KernelError> {
        if self.palloc.capacity() == 0 {
            return Err(KernelError::NoMemory);
        }
        let backoff = Backoff::new();
        loop {
            if let Some(page) = self.palloc.get_user_frame() {
                let mut clock = self.clock.lock();
                clock.slots.push(FrameSlot {
                    pa: page.pa(),
                    owner: None,
                });
                clock.unlock();
                return Ok(Frame {
                    page,
                    table: self.clone(),
                });
            }
            // An empty table means the frames are on their way back to the
            // pool.
            if let Victim::Found(pa, owner) = self.select_victim() {
                if let Some(mut frame) = self.reclaim(pa, owner)? {
                    frame.inner_mut().fill(0);
                    return Ok(frame);
                }
            } else {
                backoff.snooze();
            }
        }
    }

    /// Evicts one page chosen by the clock policy and returns its frame.
    ///
    /// The victim's contents are written to its backing store and its mapping
    /// is removed. The frame stays in the table as busy. If every frame is
    /// busy, this waits until one becomes evictable.
    ///
    /// If the write-back fails, the victim is left exactly as it was (mapped,
    /// bound and evictable) and the error is returned.
    ///
    /// # Returns
    /// - `Ok(Frame)`: The victim's frame.
    /// - `Err(KernelError::NoMemory)`: No frame is in use.
    /// - `Err(KernelError)`: The victim's contents could not be written back.
    pub fn evict_one(&self) -> Result<Frame, KernelError> {
        let backoff = Backoff::new();
        loop {
            match self.select_victim() {
                Victim::Found(pa, owner) => {
                    if let Some(frame) = self.reclaim(pa, owner)? {
                        return Ok(frame);
                    }
                }
                Victim::Busy => backoff.snooze(),
                Victim::Empty => return Err(KernelError::NoMemory),
            }
        }
    }

    /// Binds the frame at `pa` to `owner`, making it evictable.
    pub(crate) fn bind(&self, pa: Pa, owner: FrameOwner) {
        let mut clock = self.clock.lock();
        if let Some(slot) = clock.slots.iter_mut().find(|slot| slot.pa == pa) {
            slot.owner = Some(owner);
        }
        clock.unlock();
    }

    fn select_victim(&self) -> Victim {
        let mut clock = self.clock.lock();
        let len = clock.slots.len();
        let mut victim = if len == 0 { Victim::Empty } else { Victim::Busy };
        for _ in 0..2 * len {
            let idx = clock.cursor % len;
            clock.cursor = (idx + 1) % len;
            let slot = &mut clock.slots[idx];
            let Some(owner) = slot.owner.as_ref() else {
                continue;
            };
            // Its page is being torn down and will release the frame.
            let Some(page_table) = owner.page_table.upgrade() else {
                continue;
            };
            if page_table.is_accessed(owner.va) {
                page_table.set_accessed(owner.va, false);
                continue;
            }
            if let Some(owner) = slot.owner.take() {
                victim = Victim::Found(slot.pa, owner);
            }
            break;
        }
        clock.unlock();
        victim
    }

    // Returns `Ok(None)` if the victim released its frame in the meantime.
    fn reclaim(&self, pa: Pa, owner: FrameOwner) -> Result<Option<Frame>, KernelError> {
        let Some(page) = owner.page.upgrade() else {
            return Ok(None);
        };
        let mut inner = page.lock();
        if inner.frame_pa() != Some(pa) {
            inner.unlock();
            return Ok(None);
        }
        match inner.evict(&self.swap) {
            Ok(frame) => {
                inner.unlock();
                debug!("Evict {:?} from {:?}.", owner.va, pa);
                Ok(Some(frame))
            }
            Err(e) => {
                let va = owner.va;
                self.bind(pa, owner);
                inner.unlock();
                warning!("Failed to evict {:?}: {:?}.", va, e);
                Err(e)
            }
        }
    }
}
