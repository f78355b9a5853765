//! Sliding window for replay protection.
//!
//! Tracks the highest accepted sequence number plus a bitmap covering
//! `highest - window_size ..= highest`. The bitmap is a ring indexed by
//! `sequence % capacity` with room for `window_size + 1` slots, so advancing
//! the window only clears the slots the window slides over instead of
//! shifting the whole map.
//!
//! - Sequences with `seq + window_size < highest` are rejected
//! - Sequences already seen within the window are rejected
//! - Anything newer than `highest` is accepted and advances the window
//!
//! Not thread-safe; the session table lock covers it.

/// Sliding replay window over `u32` packet sequence numbers.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    highest: Option<u64>,
    bitmap: Vec<u64>,
    window_size: u64,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW_SIZE)
    }
}

impl ReplayWindow {
    pub const DEFAULT_WINDOW_SIZE: usize = 1024;
    pub const MAX_WINDOW_SIZE: usize = 65536;

    /// Create a window tracking `size` sequences, clamped to
    /// `1..=MAX_WINDOW_SIZE`.
    pub fn new(size: usize) -> Self {
        let size = size.clamp(1, Self::MAX_WINDOW_SIZE);
        let words = (size + 1).div_ceil(64);
        Self {
            highest: None,
            bitmap: vec![0; words],
            window_size: size as u64,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size as usize
    }

    /// Highest sequence accepted so far.
    pub fn highest(&self) -> Option<u32> {
        self.highest.map(|h| h as u32)
    }

    fn capacity(&self) -> u64 {
        self.bitmap.len() as u64 * 64
    }

    fn slot(&self, seq: u64) -> (usize, u64) {
        let bit = seq % self.capacity();
        ((bit / 64) as usize, 1u64 << (bit % 64))
    }

    fn is_set(&self, seq: u64) -> bool {
        let (word, mask) = self.slot(seq);
        self.bitmap[word] & mask != 0
    }

    fn set(&mut self, seq: u64) {
        let (word, mask) = self.slot(seq);
        self.bitmap[word] |= mask;
    }

    fn clear(&mut self, seq: u64) {
        let (word, mask) = self.slot(seq);
        self.bitmap[word] &= !mask;
    }

    /// Whether `seq` would be accepted. Does not update state.
    pub fn check(&self, seq: u32) -> bool {
        let seq = u64::from(seq);
        let Some(highest) = self.highest else {
            return true;
        };

        if seq + self.window_size < highest {
            return false;
        }
        if seq > highest {
            return true;
        }
        !self.is_set(seq)
    }

    /// Check and, if accepted, mark `seq` as seen.
    pub fn check_and_record(&mut self, seq: u32) -> bool {
        if !self.check(seq) {
            return false;
        }

        let seq = u64::from(seq);
        match self.highest {
            Some(highest) if seq <= highest => {}
            Some(highest) => {
                if seq - highest >= self.capacity() {
                    self.bitmap.iter_mut().for_each(|w| *w = 0);
                } else {
                    for stale in highest + 1..=seq {
                        self.clear(stale);
                    }
                }
                self.highest = Some(seq);
            }
            None => self.highest = Some(seq),
        }

        self.set(seq);
        true
    }

    pub fn reset(&mut self) {
        self.highest = None;
        self.bitmap.iter_mut().for_each(|w| *w = 0);
    }
}
