//! Page-fault error code raised by the translation hardware.

bitflags::bitflags! {
    /// Error code pushed on a page fault.
    ///
    /// Mirrors the low bits of the x86_64 page-fault error code.
    pub struct PFErrorCode: usize {
        /// The fault was a protection violation on a present page. When
        /// clear, the page was not present.
        const PRESENT = 1 << 0;
        /// The access causing the fault was a write.
        const WRITE_ACCESS = 1 << 1;
        /// The access was made in user mode.
        const USER = 1 << 2;
    }
}
