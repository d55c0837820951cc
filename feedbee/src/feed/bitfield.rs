//! Tracks which entries are stored locally.

use std::ops::Range;

/// A growable set of entry numbers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Bitfield {
    words: Vec<u64>,
}

impl Bitfield {
    pub fn get(&self, index: u64) -> bool {
        let (word, bit) = Self::position(index);
        self.words
            .get(word)
            .map(|w| w & (1 << bit) != 0)
            .unwrap_or(false)
    }

    pub fn set(&mut self, index: u64) {
        let (word, bit) = Self::position(index);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << bit;
    }

    pub fn set_range(&mut self, range: Range<u64>) {
        for index in range {
            self.set(index);
        }
    }

    /// Number of set bits.
    pub fn count(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// The set bits as sorted, non overlapping, non adjacent ranges.
    pub fn ranges(&self) -> Vec<Range<u64>> {
        let mut ranges: Vec<Range<u64>> = Vec::new();
        for (word_index, word) in self.words.iter().enumerate() {
            if *word == 0 {
                continue;
            }
            for bit in 0..64 {
                if word & (1 << bit) == 0 {
                    continue;
                }
                let index = word_index as u64 * 64 + bit;
                match ranges.last_mut() {
                    Some(last) if last.end == index => last.end += 1,
                    _ => ranges.push(index..index + 1),
                }
            }
        }
        ranges
    }

    fn position(index: u64) -> (usize, u64) {
        ((index / 64) as usize, index % 64)
    }
}
