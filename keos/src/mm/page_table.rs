//! Per-address-space address translation table.
//!
//! [`PageTable`] records the translation of each user virtual page to the
//! physical frame backing it, together with the hardware-maintained status
//! bits. The hosted kernel has no MMU, so the table also plays the MMU's
//! role: [`PageTable::access`] performs a user (or kernel) memory access the
//! way the processor would, setting the accessed and dirty bits on success and
//! raising a [`PFErrorCode`] otherwise.
//!
//! Entries are kept in an ordered map guarded by a [`SpinLock`], so a table can
//! be shared (`Arc<PageTable>`) between its address space and the frame table
//! that inspects accessed bits during eviction. An access holds the lock for
//! its whole duration, therefore an [`unmap`] never races with an in-flight
//! access to the same page.
//!
//! [`unmap`]: PageTable::unmap
use crate::{
    addressing::{Pa, Va},
    mm::Palloc,
    sync::SpinLock,
    task::PFErrorCode,
};
use std::{collections::BTreeMap, sync::Arc};

bitflags::bitflags! {
    /// Flags for pte.
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page.
        const P = 1 << 0;
        /// Read/write; if 0, writes are not allowed to the page.
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed.
        const US = 1 << 2;
        /// Accessed; set on every access through this entry.
        const A = 1 << 5;
        /// Dirty; set on every write through this entry.
        const D = 1 << 6;
        /// Execute-disable.
        const XD = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Possible memory permissions for a page.
    pub struct Permission: usize {
        /// Page is readable.
        const READ = 1 << 0;
        /// Page is writable.
        const WRITE = 1 << 1;
        /// Page is executable.
        const EXECUTABLE = 1 << 2;
        /// Page can be referred by user application.
        const USER = 1 << 3;
    }
}

impl Permission {
    /// Builds the permission of an ordinary user page.
    pub fn user(writable: bool) -> Self {
        if writable {
            Permission::READ | Permission::WRITE | Permission::USER
        } else {
            Permission::READ | Permission::USER
        }
    }
}

impl From<Permission> for PteFlags {
    fn from(perm: Permission) -> Self {
        let mut flags = PteFlags::empty();
        // In amd64, a present page is readable.
        if !(perm & !Permission::USER).is_empty() {
            flags |= PteFlags::P;
            if perm.contains(Permission::WRITE) {
                flags |= PteFlags::RW;
            }
            if perm.contains(Permission::USER) {
                flags |= PteFlags::US;
            }
            if !perm.contains(Permission::EXECUTABLE) {
                flags |= PteFlags::XD;
            }
        }
        flags
    }
}

/// Page Table Entry (PTE).
///
/// Holds the physical address of the mapped frame in its upper bits and the
/// [`PteFlags`] in the remaining ones.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub usize);

impl Pte {
    /// Get the physical address pointed to by this entry.
    ///
    /// # Returns
    /// - `Some(Pa)` if the page is present.
    /// - `None` if the "P" flag is not set.
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PteFlags::P) {
            Pa::new(self.0 & !PteFlags::all().bits())
        } else {
            None
        }
    }

    /// Get the flags associated with this page table entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    fn set_flags(&mut self, flags: PteFlags) {
        self.0 = (self.0 & !PteFlags::all().bits()) | flags.bits();
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pte")
            .field("pa", &self.pa())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Page Table Mapping Error.
#[derive(Debug, PartialEq, Eq)]
pub enum PageTableMappingError {
    /// Unaligned address.
    Unaligned,
    /// The requested entry does not exist.
    NotExist,
    /// An attempt to create a mapping for an address that is already mapped.
    Duplicated,
    /// An attempt to create a mapping with an invalid permission.
    InvalidPermission,
}

impl From<PageTableMappingError> for crate::KernelError {
    fn from(e: PageTableMappingError) -> Self {
        match e {
            PageTableMappingError::Unaligned => crate::KernelError::InvalidArgument,
            PageTableMappingError::NotExist => crate::KernelError::BadAddress,
            PageTableMappingError::Duplicated => crate::KernelError::FileExist,
            PageTableMappingError::InvalidPermission => crate::KernelError::InvalidAccess,
        }
    }
}

/// A page table of one address space.
pub struct PageTable {
    palloc: Arc<Palloc>,
    entries: SpinLock<BTreeMap<Va, Pte>>,
}

impl PageTable {
    /// Creates an empty page table whose entries refer to frames of `palloc`.
    pub fn new(palloc: &Arc<Palloc>) -> Self {
        Self {
            palloc: palloc.clone(),
            entries: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Map a physical address (`pa`) to a virtual address (`va`) with the
    /// specified permissions (`perm`).
    ///
    /// # Safety
    /// The frame at `pa` must be held by another object until the mapping is
    /// removed with [`PageTable::unmap`].
    ///
    /// # Returns
    /// - `Ok(())` on success.
    /// - `Err(PageTableMappingError::Unaligned)` if `va` or `pa` is unaligned.
    /// - `Err(PageTableMappingError::InvalidPermission)` if `perm` grants no
    ///   access.
    /// - `Err(PageTableMappingError::Duplicated)` if `va` is already mapped.
    pub unsafe fn do_map(
        &self,
        va: Va,
        pa: Pa,
        perm: Permission,
    ) -> Result<(), PageTableMappingError> {
        if !va.is_aligned() || pa.offset() != 0 {
            return Err(PageTableMappingError::Unaligned);
        }
        let flags = PteFlags::from(perm);
        if !flags.contains(PteFlags::P) {
            return Err(PageTableMappingError::InvalidPermission);
        }
        let mut entries = self.entries.lock();
        let result = if entries.contains_key(&va) {
            Err(PageTableMappingError::Duplicated)
        } else {
            entries.insert(va, Pte(pa.into_usize() | flags.bits()));
            Ok(())
        };
        entries.unlock();
        result
    }

    /// Unmap the given virtual address (`va`).
    ///
    /// # Returns
    /// The removed entry, including its final accessed and dirty bits, or
    /// `Err(PageTableMappingError::NotExist)` if `va` was not mapped.
    pub fn unmap(&self, va: Va) -> Result<Pte, PageTableMappingError> {
        let mut entries = self.entries.lock();
        let pte = entries.remove(&va.page_down());
        entries.unlock();
        pte.ok_or(PageTableMappingError::NotExist)
    }

    /// Find the page table entry for `va`.
    pub fn walk(&self, va: Va) -> Result<Pte, PageTableMappingError> {
        let entries = self.entries.lock();
        let pte = entries.get(&va.page_down()).copied();
        entries.unlock();
        pte.ok_or(PageTableMappingError::NotExist)
    }

    /// Number of present entries.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock();
        let len = entries.len();
        entries.unlock();
        len
    }

    /// Returns `true` if no page is mapped.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, va: Va, f: impl FnOnce(&mut Pte)) -> bool {
        let mut entries = self.entries.lock();
        let found = match entries.get_mut(&va.page_down()) {
            Some(pte) => {
                f(pte);
                true
            }
            None => false,
        };
        entries.unlock();
        found
    }

    fn test(&self, va: Va, flag: PteFlags) -> bool {
        self.walk(va)
            .map(|pte| pte.flags().contains(flag))
            .unwrap_or(false)
    }

    /// Returns the accessed bit of `va`, `false` if unmapped.
    pub fn is_accessed(&self, va: Va) -> bool {
        self.test(va, PteFlags::A)
    }

    /// Sets or clears the accessed bit of `va`. Unmapped addresses are
    /// ignored.
    pub fn set_accessed(&self, va: Va, accessed: bool) {
        self.update(va, |pte| {
            let mut flags = pte.flags();
            flags.set(PteFlags::A, accessed);
            pte.set_flags(flags);
        });
    }

    /// Returns the dirty bit of `va`, `false` if unmapped.
    pub fn is_dirty(&self, va: Va) -> bool {
        self.test(va, PteFlags::D)
    }

    /// Sets or clears the dirty bit of `va`. Unmapped addresses are ignored.
    pub fn set_dirty(&self, va: Va, dirty: bool) {
        self.update(va, |pte| {
            let mut flags = pte.flags();
            flags.set(PteFlags::D, dirty);
            pte.set_flags(flags);
        });
    }

    /// Performs a memory access on `va` the way the MMU would.
    ///
    /// On success the accessed bit (and the dirty bit for writes) is set and
    /// `f` runs on the contents of the mapped frame, while the table is
    /// locked.
    ///
    /// # Parameters
    /// - `va`: The address being accessed.
    /// - `is_write`: `true` for a store.
    /// - `is_user`: `true` if the access comes from user mode.
    /// - `f`: Closure receiving the whole frame.
    ///
    /// # Returns
    /// - `Ok(R)`: The result of `f`.
    /// - `Err(PFErrorCode)`: The error code of the page fault the access
    ///   raised.
    pub fn access<R>(
        &self,
        va: Va,
        is_write: bool,
        is_user: bool,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, PFErrorCode> {
        let mut ec = PFErrorCode::empty();
        ec.set(PFErrorCode::WRITE_ACCESS, is_write);
        ec.set(PFErrorCode::USER, is_user);

        let mut entries = self.entries.lock();
        let Some(pte) = entries.get_mut(&va.page_down()) else {
            entries.unlock();
            return Err(ec);
        };
        let flags = pte.flags();
        if (is_write && !flags.contains(PteFlags::RW)) || (is_user && !flags.contains(PteFlags::US))
        {
            entries.unlock();
            return Err(ec | PFErrorCode::PRESENT);
        }
        let pa = pte.pa();
        let mut next = flags | PteFlags::A;
        if is_write {
            next |= PteFlags::D;
        }
        pte.set_flags(next);

        // SAFETY: a present entry always refers to a frame owned by the
        // resident page, and the frame cannot be unmapped while we hold the
        // table lock.
        let result = match pa.and_then(|pa| unsafe { self.palloc.page_ref(pa) }) {
            Some(mut page) => Ok(f(page.inner_mut())),
            None => Err(ec),
        };
        entries.unlock();
        result
    }
}
