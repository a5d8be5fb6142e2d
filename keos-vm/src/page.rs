//! Pages of an address space.
//!
//! A [`VmPage`] is the kernel's record of one virtual page, whether or not it
//! currently occupies a frame. Its mutable part lives behind a per-page lock,
//! shared (weakly) with the [`FrameTable`] so that eviction can find the page
//! occupying a frame.
//!
//! The state of a page only moves forward:
//!
//! ```text
//!   Uninit --claim--> Anon / File (resident) <--evict / claim--> (non-resident)
//! ```
//!
//! and every page ends up destroyed, which releases its frame, its mapping
//! and its swap slot.
use crate::{
    VmType,
    anon::AnonPage,
    file::FilePage,
    frame::{Frame, FrameOwner, FrameTable},
    lazy_pager::LazyLoad,
};
use alloc::sync::{Arc, Weak};
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Pa, Va},
    mm::page_table::{PageTable, Permission, PteFlags},
    swap::{SwapDisk, SwapSlot},
    sync::SpinLock,
};

/// Backing state of a page.
pub(crate) enum PageState {
    /// Never materialized. `target` is the state the page turns into on its
    /// first claim; `loader` supplies its first contents (zero-filled
    /// otherwise).
    Uninit {
        loader: Option<LazyLoad>,
        target: VmType,
    },
    /// Anonymous memory, swapped out when evicted.
    Anon(AnonPage),
    /// Memory mirroring a file region, written back when evicted dirty.
    File(FilePage),
}

impl PageState {
    fn vm_type(&self) -> VmType {
        match self {
            PageState::Uninit { .. } => VmType::Uninit,
            PageState::Anon(_) => VmType::Anon,
            PageState::File(_) => VmType::File,
        }
    }
}

/// A page's state as inherited by a forked address space.
pub(crate) struct ForkedState {
    pub(crate) state: PageState,
    /// The copy is claimed right away with the current contents.
    pub(crate) materialize: bool,
    /// The current contents differ from the backing store.
    pub(crate) dirty: bool,
}

pub(crate) struct PageInner {
    va: Va,
    writable: bool,
    state: PageState,
    frame: Option<Frame>,
    page_table: Arc<PageTable>,
    frames: Arc<FrameTable>,
}

impl PageInner {
    pub(crate) fn frame_pa(&self) -> Option<Pa> {
        self.frame.as_ref().map(Frame::pa)
    }

    fn swap(&self) -> Arc<SwapDisk> {
        self.frames.swap().clone()
    }

    // Fills `frame` with the contents of the page and advances its state.
    fn materialize(&mut self, frame: &mut Frame, contents: Option<&[u8]>) -> Result<(), KernelError> {
        let swap = self.swap();
        let next = match &mut self.state {
            PageState::Uninit { loader, target } => {
                match (contents, loader.as_ref()) {
                    (Some(bytes), _) => {
                        if bytes.len() != PAGE_SIZE {
                            return Err(KernelError::InvalidArgument);
                        }
                        frame.inner_mut().copy_from_slice(bytes);
                    }
                    (None, Some(loader)) => loader.load(frame.inner_mut())?,
                    (None, None) => frame.inner_mut().fill(0),
                }
                Some(match (*target, loader.take()) {
                    (VmType::File, Some(loader)) => PageState::File(FilePage::from(loader)),
                    _ => PageState::Anon(AnonPage::new()),
                })
            }
            PageState::Anon(anon) => {
                anon.swap_in(&swap, frame.inner_mut())?;
                None
            }
            PageState::File(file) => {
                file.swap_in(frame.inner_mut())?;
                None
            }
        };
        if let Some(next) = next {
            self.state = next;
        }
        Ok(())
    }

    fn install(&mut self, frame: Frame, page: Weak<SpinLock<PageInner>>) -> Result<(), KernelError> {
        let pa = frame.pa();
        // SAFETY: the frame is owned by this page until the mapping is
        // removed by `evict` or `release`.
        unsafe {
            self.page_table
                .do_map(self.va, pa, Permission::user(self.writable))?;
        }
        self.frames.bind(
            pa,
            FrameOwner {
                va: self.va,
                page,
                page_table: Arc::downgrade(&self.page_table),
            },
        );
        self.frame = Some(frame);
        Ok(())
    }

    /// Writes the contents to the backing store and gives up the frame.
    ///
    /// On failure the page is left resident and mapped, with its dirty bit
    /// as before.
    pub(crate) fn evict(&mut self, swap: &SwapDisk) -> Result<Frame, KernelError> {
        let pte = self.page_table.unmap(self.va)?;
        let dirty = pte.flags().contains(PteFlags::D);
        let Some(frame) = self.frame.take() else {
            return Err(KernelError::BadAddress);
        };
        let result = match &mut self.state {
            PageState::Anon(anon) => anon.swap_out(swap, frame.inner()),
            PageState::File(file) => file.swap_out(frame.inner(), dirty),
            PageState::Uninit { .. } => Err(KernelError::InvalidArgument),
        };
        match result {
            Ok(()) => Ok(frame),
            Err(e) => {
                // SAFETY: the frame goes back to this page below.
                let remapped = unsafe {
                    self.page_table
                        .do_map(self.va, frame.pa(), Permission::user(self.writable))
                };
                if remapped.is_ok() {
                    self.page_table.set_dirty(self.va, dirty);
                    self.page_table.set_accessed(self.va, true);
                }
                self.frame = Some(frame);
                Err(e)
            }
        }
    }

    fn read_contents(&self, buf: &mut [u8]) -> Result<(), KernelError> {
        if buf.len() != PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        if let Some(frame) = self.frame.as_ref() {
            buf.copy_from_slice(frame.inner());
            return Ok(());
        }
        match &self.state {
            PageState::Uninit {
                loader: Some(loader),
                ..
            } => loader.load(buf),
            PageState::Uninit { loader: None, .. } => {
                buf.fill(0);
                Ok(())
            }
            PageState::Anon(anon) => anon.peek(self.frames.swap(), buf),
            PageState::File(file) => file.swap_in(buf),
        }
    }

    fn writeback(&mut self) -> Result<(), KernelError> {
        let (Some(frame), PageState::File(file)) = (self.frame.as_ref(), &self.state) else {
            return Ok(());
        };
        if !self.page_table.is_dirty(self.va) {
            return Ok(());
        }
        self.page_table.set_dirty(self.va, false);
        file.swap_out(frame.inner(), true).inspect_err(|_| {
            self.page_table.set_dirty(self.va, true);
        })
    }

    fn release(&mut self) {
        if let Some(frame) = self.frame.take() {
            let _ = self.page_table.unmap(self.va);
            drop(frame);
        }
        let swap = self.swap();
        match &mut self.state {
            PageState::Anon(anon) => anon.destroy(&swap),
            PageState::File(file) => file.destroy(),
            PageState::Uninit { loader, .. } => {
                loader.take();
            }
        }
    }
}

impl Drop for PageInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Metadata for one virtual page of an address space.
pub struct VmPage {
    va: Va,
    writable: bool,
    mapping: Option<usize>,
    inner: Arc<SpinLock<PageInner>>,
}

impl VmPage {
    pub(crate) fn new(
        va: Va,
        writable: bool,
        state: PageState,
        mapping: Option<usize>,
        page_table: &Arc<PageTable>,
        frames: &Arc<FrameTable>,
    ) -> Self {
        let va = va.page_down();
        Self {
            va,
            writable,
            mapping,
            inner: Arc::new(SpinLock::new(PageInner {
                va,
                writable,
                state,
                frame: None,
                page_table: page_table.clone(),
                frames: frames.clone(),
            })),
        }
    }

    /// Page-aligned virtual address of the page.
    #[inline]
    pub fn va(&self) -> Va {
        self.va
    }

    /// Whether user writes are allowed.
    #[inline]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Identifier of the `mmap` region the page belongs to, if any.
    #[inline]
    pub fn mapping(&self) -> Option<usize> {
        self.mapping
    }

    /// Current kind of the page.
    pub fn vm_type(&self) -> VmType {
        let inner = self.inner.lock();
        let ty = inner.state.vm_type();
        inner.unlock();
        ty
    }

    /// Returns `true` if the page occupies a frame.
    pub fn is_resident(&self) -> bool {
        self.frame_pa().is_some()
    }

    /// Physical address of the frame the page occupies.
    pub fn frame_pa(&self) -> Option<Pa> {
        let inner = self.inner.lock();
        let pa = inner.frame_pa();
        inner.unlock();
        pa
    }

    /// Swap slot holding the contents of an evicted anonymous page.
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        let inner = self.inner.lock();
        let slot = match &inner.state {
            PageState::Anon(anon) => anon.slot(),
            _ => None,
        };
        inner.unlock();
        slot
    }

    /// Makes the page resident.
    ///
    /// Acquires a frame (evicting another page if needed), fills it from the
    /// page's loader or backing store and maps it. Claiming a resident page
    /// does nothing.
    ///
    /// # Returns
    /// - `Ok(())`: The page is resident and mapped.
    /// - `Err(KernelError::FileExist)`: The address is already mapped.
    /// - `Err(KernelError)`: No frame could be obtained or the contents could
    ///   not be read. The page is left as it was.
    pub fn claim(&self) -> Result<(), KernelError> {
        self.claim_with(None, false)
    }

    /// Claims the page, taking the first contents of an uninitialized page
    /// from `contents` instead of its loader.
    ///
    /// With `dirty` set, the new mapping starts dirty so that the contents
    /// reach the backing store before the frame is given up.
    pub(crate) fn claim_with(&self, contents: Option<&[u8]>, dirty: bool) -> Result<(), KernelError> {
        let inner = self.inner.lock();
        if inner.frame.is_some() {
            inner.unlock();
            return Ok(());
        }
        let frames = inner.frames.clone();
        inner.unlock();

        // Eviction may need other pages' locks; never hold ours meanwhile.
        let mut frame = frames.acquire_frame()?;

        let mut inner = self.inner.lock();
        if inner.frame.is_some() {
            inner.unlock();
            return Ok(());
        }
        if inner.page_table.walk(self.va).is_ok() {
            inner.unlock();
            return Err(KernelError::FileExist);
        }
        let result = match inner.materialize(&mut frame, contents) {
            Ok(()) => inner
                .install(frame, Arc::downgrade(&self.inner))
                .map(|_| inner.page_table.set_dirty(self.va, dirty)),
            Err(e) => {
                drop(frame);
                Err(e)
            }
        };
        inner.unlock();
        if result.is_ok() {
            debug!("Claim {:?}.", self.va);
        }
        result
    }

    /// Copies the current contents of the page into `buf` without claiming
    /// it.
    pub(crate) fn read_contents(&self, buf: &mut [u8]) -> Result<(), KernelError> {
        let inner = self.inner.lock();
        let result = inner.read_contents(buf);
        inner.unlock();
        result
    }

    /// Writes a resident, dirty file-backed page back to its file.
    pub(crate) fn writeback(&self) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        let result = inner.writeback();
        inner.unlock();
        result
    }

    /// State for a copy of this page in another address space.
    pub(crate) fn fork_state(&self) -> ForkedState {
        let inner = self.inner.lock();
        let forked = match &inner.state {
            PageState::Uninit { loader, target } => ForkedState {
                state: PageState::Uninit {
                    loader: loader.clone(),
                    target: *target,
                },
                materialize: false,
                dirty: false,
            },
            PageState::Anon(_) => ForkedState {
                state: PageState::Uninit {
                    loader: None,
                    target: VmType::Anon,
                },
                materialize: true,
                dirty: false,
            },
            // A resident page may hold writes its file has not seen yet.
            PageState::File(file) => ForkedState {
                state: PageState::Uninit {
                    loader: Some(LazyLoad::from(file.clone())),
                    target: VmType::File,
                },
                materialize: true,
                dirty: inner.frame.is_some() && inner.page_table.is_dirty(self.va),
            },
        };
        inner.unlock();
        forked
    }

    /// Releases the frame, the mapping and the swap slot of the page.
    ///
    /// Destroying a page twice is harmless.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        inner.release();
        inner.unlock();
    }
}

impl core::fmt::Debug for VmPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmPage")
            .field("va", &self.va)
            .field("writable", &self.writable)
            .field("mapping", &self.mapping)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_init;
    use keos::{
        SystemConfigurationBuilder,
        fs::{MemFile, RegularFile},
    };

    fn setup(frames: usize) -> (Arc<FrameTable>, Arc<PageTable>) {
        let frames = vm_init(
            &SystemConfigurationBuilder::new()
                .user_frames(frames)
                .swap_pages(4)
                .build(),
        );
        let page_table = Arc::new(PageTable::new(frames.palloc()));
        (frames, page_table)
    }

    fn uninit(target: VmType, loader: Option<LazyLoad>) -> PageState {
        PageState::Uninit { loader, target }
    }

    #[test]
    fn claim_zero_fills_and_maps() {
        let (frames, pt) = setup(2);
        let page = VmPage::new(
            Va::new(0x4321).unwrap(),
            true,
            uninit(VmType::Anon, None),
            None,
            &pt,
            &frames,
        );
        assert_eq!(page.va(), Va::new(0x4000).unwrap());
        assert_eq!(page.vm_type(), VmType::Uninit);
        page.claim().unwrap();
        assert_eq!(page.vm_type(), VmType::Anon);
        assert_eq!(pt.walk(page.va()).unwrap().pa(), page.frame_pa());
        assert_eq!(
            pt.access(page.va(), false, true, |b| b.iter().all(|x| *x == 0)),
            Ok(true)
        );
        // A second claim is a no-op.
        let pa = page.frame_pa();
        page.claim().unwrap();
        assert_eq!(page.frame_pa(), pa);
    }

    #[test]
    fn claim_runs_the_loader() {
        let (frames, pt) = setup(1);
        let file = RegularFile::new(MemFile::new(b"hello, world"));
        let loader = LazyLoad::new(file, 7, 5, PAGE_SIZE - 5).unwrap();
        let page = VmPage::new(
            Va::new(0x8000).unwrap(),
            false,
            uninit(VmType::File, Some(loader)),
            None,
            &pt,
            &frames,
        );
        page.claim().unwrap();
        assert_eq!(page.vm_type(), VmType::File);
        let head = pt.access(page.va(), false, true, |b| {
            (b[..5].to_vec(), b[5..].iter().all(|x| *x == 0))
        });
        assert_eq!(head, Ok((b"world".to_vec(), true)));
        assert!(pt.access(page.va(), true, true, |_| ()).is_err());
    }

    #[test]
    fn claim_fails_on_an_existing_mapping() {
        let (frames, pt) = setup(2);
        let other = frames.palloc().get_user_frame().unwrap();
        let va = Va::new(0x1000).unwrap();
        unsafe { pt.do_map(va, other.pa(), Permission::user(true)) }.unwrap();
        let page = VmPage::new(va, true, uninit(VmType::Anon, None), None, &pt, &frames);
        assert_eq!(page.claim(), Err(KernelError::FileExist));
        assert!(!page.is_resident());
        assert!(frames.is_empty());
        assert_eq!(page.vm_type(), VmType::Uninit);
    }

    #[test]
    fn destroy_is_idempotent() {
        let (frames, pt) = setup(1);
        let page = VmPage::new(
            Va::new(0x1000).unwrap(),
            true,
            uninit(VmType::Anon, None),
            None,
            &pt,
            &frames,
        );
        page.claim().unwrap();
        page.destroy();
        page.destroy();
        assert!(pt.is_empty());
        assert!(frames.is_empty());
        assert_eq!(frames.palloc().free_count(), 1);
    }
}
