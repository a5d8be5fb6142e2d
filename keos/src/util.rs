//! Utilities.

/// A fixed-size array of bits.
///
/// Bits are packed into 64-bit words; the first zero (or one) bit is found a
/// word at a time.
#[derive(Debug, Clone)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// Number of bits in the bitmap.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the bitmap holds no bits.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the value of the bit at `idx`.
    ///
    /// # Panics
    /// If `idx` is out of range.
    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of range {}", self.len);
        self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    /// Sets the bit at `idx` to `value`.
    ///
    /// # Panics
    /// If `idx` is out of range.
    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range {}", self.len);
        let (pos, ofs) = (idx / 64, idx % 64);
        if value {
            self.words[pos] |= 1 << ofs;
        } else {
            self.words[pos] &= !(1 << ofs);
        }
    }

    /// Counts the bits set to `value`.
    pub fn count(&self, value: bool) -> usize {
        let ones = self.words.iter().map(|w| w.count_ones() as usize).sum();
        if value { ones } else { self.len - ones }
    }

    /// Finds the first bit set to `value`, flips it and returns its index.
    pub fn scan_and_flip(&mut self, value: bool) -> Option<usize> {
        let idx = self.words.iter().enumerate().find_map(|(pos, w)| {
            let candidates = if value { *w } else { !*w };
            (candidates != 0).then(|| pos * 64 + candidates.trailing_zeros() as usize)
        })?;
        if idx >= self.len {
            return None;
        }
        self.set(idx, !value);
        Some(idx)
    }
}
