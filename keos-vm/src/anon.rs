//! Anonymous pages.
//!
//! An anonymous page has no file behind it: it starts zero-filled (or filled
//! by a [`LazyLoad`]) and lives only in memory. When evicted, its contents are
//! written to a slot of the swap area; the slot is read back and released when
//! the page is claimed again.
//!
//! [`LazyLoad`]: crate::LazyLoad
use keos::{
    KernelError,
    swap::{SwapDisk, SwapSlot},
};

/// Backing state of an anonymous page.
#[derive(Debug, Default)]
pub struct AnonPage {
    slot: Option<SwapSlot>,
}

impl AnonPage {
    /// A page whose contents are in memory.
    pub fn new() -> Self {
        Self { slot: None }
    }

    /// Swap slot holding the contents while the page is evicted.
    pub fn slot(&self) -> Option<SwapSlot> {
        self.slot
    }

    /// Restores the contents into `page`.
    ///
    /// The swap slot is released once its contents are read. A page that was
    /// never swapped out is zero-filled.
    pub fn swap_in(&mut self, swap: &SwapDisk, page: &mut [u8]) -> Result<(), KernelError> {
        match self.slot {
            Some(slot) => {
                swap.swap_in(slot, page)?;
                swap.swap_free(slot);
                self.slot = None;
            }
            None => page.fill(0),
        }
        Ok(())
    }

    /// Writes `page` to a free swap slot.
    ///
    /// # Returns
    /// - `Err(KernelError::NoSpace)` if the swap area is full.
    pub fn swap_out(&mut self, swap: &SwapDisk, page: &[u8]) -> Result<(), KernelError> {
        self.slot = Some(swap.swap_out(page)?);
        Ok(())
    }

    /// Reads the swapped-out contents into `page` without releasing the slot.
    pub(crate) fn peek(&self, swap: &SwapDisk, page: &mut [u8]) -> Result<(), KernelError> {
        match self.slot {
            Some(slot) => swap.swap_in(slot, page),
            None => {
                page.fill(0);
                Ok(())
            }
        }
    }

    /// Releases the swap slot, if any.
    pub fn destroy(&mut self, swap: &SwapDisk) {
        if let Some(slot) = self.slot.take() {
            swap.swap_free(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keos::{addressing::PAGE_SIZE, fs::Disk, swap::SECTORS_PER_PAGE};

    #[test]
    fn swap_round_trip_releases_the_slot() {
        let swap = SwapDisk::new(Disk::new(SECTORS_PER_PAGE));
        let mut anon = AnonPage::new();
        let mut page = [0x5a; PAGE_SIZE];
        anon.swap_out(&swap, &page).unwrap();
        assert_eq!(swap.used(), 1);
        assert!(anon.slot().is_some());

        page.fill(0);
        anon.swap_in(&swap, &mut page).unwrap();
        assert!(page.iter().all(|b| *b == 0x5a));
        assert_eq!(swap.used(), 0);
        assert!(anon.slot().is_none());
    }

    #[test]
    fn full_swap_is_reported() {
        let swap = SwapDisk::new(Disk::new(SECTORS_PER_PAGE));
        let (mut a, mut b) = (AnonPage::new(), AnonPage::new());
        a.swap_out(&swap, &[1; PAGE_SIZE]).unwrap();
        assert_eq!(b.swap_out(&swap, &[2; PAGE_SIZE]), Err(KernelError::NoSpace));
        assert!(b.slot().is_none());
        a.destroy(&swap);
        a.destroy(&swap);
        assert_eq!(swap.used(), 0);
    }
}
