//! Swap area.
//!
//! The swap area is a raw [`Disk`] carved into page-sized slots of
//! [`SECTORS_PER_PAGE`] sectors each. A [`Bitmap`] records which slots hold
//! live data. Anonymous pages are written to a free slot when evicted and read
//! back when faulted in again; the slot is then released with
//! [`SwapDisk::swap_free`].

use crate::{
    KernelError,
    addressing::PAGE_SIZE,
    fs::{Disk, Sector},
    sync::SpinLock,
    util::Bitmap,
};

/// Number of disk sectors needed to hold one page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / 512;

/// Index of a page-sized slot in the swap area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(usize);

impl SwapSlot {
    /// Cast into usize.
    pub fn into_usize(self) -> usize {
        self.0
    }

    fn first_sector(self) -> Sector {
        Sector(self.0 * SECTORS_PER_PAGE)
    }
}

/// The swap device.
pub struct SwapDisk {
    disk: Disk,
    slots: SpinLock<Bitmap>,
}

impl SwapDisk {
    /// Builds the swap area on top of `disk`.
    ///
    /// Trailing sectors that do not form a full slot are unused.
    pub fn new(disk: Disk) -> Self {
        let nslots = disk.sector_count() / SECTORS_PER_PAGE;
        Self {
            disk,
            slots: SpinLock::new(Bitmap::new(nslots)),
        }
    }

    /// Number of slots of the swap area.
    pub fn capacity(&self) -> usize {
        let slots = self.slots.lock();
        let n = slots.len();
        slots.unlock();
        n
    }

    /// Number of slots currently holding data.
    pub fn used(&self) -> usize {
        let slots = self.slots.lock();
        let n = slots.count(true);
        slots.unlock();
        n
    }

    /// Writes one page to a free slot.
    ///
    /// # Returns
    /// - `Ok(SwapSlot)`: The slot now holding `page`.
    /// - `Err(KernelError::NoSpace)`: The swap area is full.
    /// - `Err(KernelError)`: The device failed; no slot is consumed.
    pub fn swap_out(&self, page: &[u8]) -> Result<SwapSlot, KernelError> {
        if page.len() != PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        let mut slots = self.slots.lock();
        let idx = slots.scan_and_flip(false);
        slots.unlock();
        let slot = SwapSlot(idx.ok_or(KernelError::NoSpace)?);

        for (i, chunk) in page.chunks_exact(512).enumerate() {
            let mut sector = [0; 512];
            sector.copy_from_slice(chunk);
            if let Err(e) = self.disk.write(slot.first_sector() + i, &sector) {
                self.swap_free(slot);
                return Err(e);
            }
        }
        Ok(slot)
    }

    /// Reads the page stored in `slot` into `buf`.
    ///
    /// The slot keeps its data; release it with [`SwapDisk::swap_free`].
    pub fn swap_in(&self, slot: SwapSlot, buf: &mut [u8]) -> Result<(), KernelError> {
        if buf.len() != PAGE_SIZE || !self.is_used(slot) {
            return Err(KernelError::InvalidArgument);
        }
        for (i, chunk) in buf.chunks_exact_mut(512).enumerate() {
            let mut sector = [0; 512];
            self.disk.read(slot.first_sector() + i, &mut sector)?;
            chunk.copy_from_slice(&sector);
        }
        Ok(())
    }

    /// Releases `slot`.
    pub fn swap_free(&self, slot: SwapSlot) {
        let mut slots = self.slots.lock();
        if slot.0 < slots.len() {
            slots.set(slot.0, false);
        }
        slots.unlock();
    }

    fn is_used(&self, slot: SwapSlot) -> bool {
        let slots = self.slots.lock();
        let used = slot.0 < slots.len() && slots.test(slot.0);
        slots.unlock();
        used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    #[test]
    fn round_trip_and_free() {
        let swap = SwapDisk::new(Disk::new(SECTORS_PER_PAGE * 2 + 3));
        assert_eq!(swap.capacity(), 2);
        let page = (0..PAGE_SIZE).map(|i| i as u8).collect::<Vec<_>>();
        let a = swap.swap_out(&page).unwrap();
        let b = swap.swap_out(&[0x11; PAGE_SIZE]).unwrap();
        assert_ne!(a, b);
        assert_eq!(swap.swap_out(&page), Err(KernelError::NoSpace));

        let mut buf = vec![0; PAGE_SIZE];
        swap.swap_in(a, &mut buf).unwrap();
        assert_eq!(buf, page);
        swap.swap_free(a);
        assert_eq!(swap.used(), 1);
        assert_eq!(swap.swap_in(a, &mut buf), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn failed_write_releases_the_slot() {
        let fail = Arc::new(AtomicBool::new(true));
        let hook_fail = fail.clone();
        let disk = Disk::new(SECTORS_PER_PAGE).hook(Arc::new(move |_, _, is_write| {
            if is_write && hook_fail.load(Ordering::SeqCst) {
                Err(KernelError::IOError)
            } else {
                Ok(())
            }
        }));
        let swap = SwapDisk::new(disk);
        assert_eq!(swap.swap_out(&[1; PAGE_SIZE]), Err(KernelError::IOError));
        assert_eq!(swap.used(), 0);
        fail.store(false, Ordering::SeqCst);
        assert!(swap.swap_out(&[1; PAGE_SIZE]).is_ok());
    }
}
