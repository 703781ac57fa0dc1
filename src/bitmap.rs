/// Fixed capacity set of block (or page) numbers, `WORDS * 32` entries.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockBitmap<const WORDS: usize> {
    words: [u32; WORDS],
}

impl<const WORDS: usize> BlockBitmap<WORDS> {
    /// Number of entries the bitmap can hold.
    pub const CAPACITY: u32 = (WORDS * 32) as u32;

    /// Creates an empty bitmap.
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Mark `index`.
    ///
    /// Returns `None` if `index` does not fit, `Some(true)` if it was
    /// not marked before, `Some(false)` otherwise.
    pub fn insert(&mut self, index: u32) -> Option<bool> {
        if index >= Self::CAPACITY {
            return None;
        }
        let (word, mask) = ((index / 32) as usize, 1u32 << (index % 32));
        let fresh = self.words[word] & mask == 0;
        self.words[word] |= mask;
        Some(fresh)
    }

    /// Returns `true` if `index` is marked.
    pub fn contains(&self, index: u32) -> bool {
        index < Self::CAPACITY && self.words[(index / 32) as usize] & (1 << (index % 32)) != 0
    }

    /// Unmark everything.
    pub fn clear(&mut self) {
        self.words.fill(0);
    }
}

impl<const WORDS: usize> Default for BlockBitmap<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}
