use serde::{Deserialize, Serialize};

/// A contiguous run of set bits, `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub start: u64,
    pub end: u64,
}

impl Run {
    /// Maximal runs covering `indices`, ascending.
    pub fn coalesce(indices: impl IntoIterator<Item = u64>) -> Vec<Run> {
        let mut sorted: Vec<u64> = indices.into_iter().collect();
        sorted.sort_unstable();
        sorted.dedup();
        let mut runs: Vec<Run> = Vec::new();
        for i in sorted {
            match runs.last_mut() {
                Some(run) if run.end == i => run.end += 1,
                _ => runs.push(Run { start: i, end: i + 1 }),
            }
        }
        runs
    }
}

/// Growable set of block indices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitfield {
    words: Vec<u64>,
    count: u64,
    /// Every index below this is set.
    contiguous: u64,
}

impl Bitfield {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_indices(indices: impl IntoIterator<Item = u64>) -> Self {
        let mut bits = Self::new();
        for i in indices {
            bits.set(i);
        }
        bits
    }

    pub fn from_runs(runs: &[Run]) -> Self {
        let mut bits = Self::new();
        for run in runs {
            bits.set_range(run.start, run.end);
        }
        bits
    }

    pub fn get(&self, index: u64) -> bool {
        let (word, bit) = Self::locate(index);
        self.words.get(word).is_some_and(|w| w & (1 << bit) != 0)
    }

    /// Set a bit; returns whether it was newly set.
    pub fn set(&mut self, index: u64) -> bool {
        let (word, bit) = Self::locate(index);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let mask = 1 << bit;
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.count += 1;
        if index == self.contiguous {
            self.advance();
        }
        true
    }

    /// Set every index in `[start, end)`, a word at a time.
    pub fn set_range(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let (last, _) = Self::locate(end - 1);
        if last >= self.words.len() {
            self.words.resize(last + 1, 0);
        }
        let mut i = start;
        while i < end {
            let (word, bit) = Self::locate(i);
            let span = (64 - bit).min(end - i);
            let mask = if span == 64 {
                u64::MAX
            } else {
                ((1u64 << span) - 1) << bit
            };
            let before = self.words[word];
            self.words[word] |= mask;
            self.count += u64::from((self.words[word] ^ before).count_ones());
            i += span;
        }
        if start <= self.contiguous {
            self.advance();
        }
    }

    /// Clear a bit; returns whether it was set.
    pub fn clear(&mut self, index: u64) -> bool {
        let (word, bit) = Self::locate(index);
        let Some(w) = self.words.get_mut(word) else {
            return false;
        };
        let mask = 1 << bit;
        if *w & mask == 0 {
            return false;
        }
        *w &= !mask;
        self.count -= 1;
        self.contiguous = self.contiguous.min(index);
        true
    }

    /// Number of set bits.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Length of the prefix of indices that are all set.
    pub fn contiguous(&self) -> u64 {
        self.contiguous
    }

    /// Whether every index in `[start, end)` is set.
    pub fn all(&self, start: u64, end: u64) -> bool {
        end <= self.contiguous || (start.max(self.contiguous)..end).all(|i| self.get(i))
    }

    /// Unset indices below `end`, ascending.
    pub fn missing(&self, end: u64) -> impl Iterator<Item = u64> + '_ {
        (self.contiguous.min(end)..end).filter(move |i| !self.get(*i))
    }

    /// Set bits as maximal runs, ascending.
    pub fn runs(&self) -> Vec<Run> {
        let mut runs = Vec::new();
        let mut open: Option<u64> = None;
        for (w, &word) in self.words.iter().enumerate() {
            match (word, open) {
                (0, None) | (u64::MAX, Some(_)) => continue,
                _ => {}
            }
            let base = w as u64 * 64;
            for bit in 0..64 {
                match (word & (1 << bit) != 0, open) {
                    (true, None) => open = Some(base + bit),
                    (false, Some(start)) => {
                        runs.push(Run { start, end: base + bit });
                        open = None;
                    }
                    _ => {}
                }
            }
        }
        if let Some(start) = open {
            runs.push(Run {
                start,
                end: self.words.len() as u64 * 64,
            });
        }
        runs
    }

    fn advance(&mut self) {
        loop {
            let (word, bit) = Self::locate(self.contiguous);
            match self.words.get(word) {
                Some(&w) if bit == 0 && w == u64::MAX => self.contiguous += 64,
                Some(&w) if w & (1 << bit) != 0 => self.contiguous += 1,
                _ => break,
            }
        }
    }

    fn locate(index: u64) -> (usize, u64) {
        ((index / 64) as usize, index % 64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_clear() {
        let mut bits = Bitfield::new();
        assert!(!bits.get(70));
        assert!(bits.set(70));
        assert!(!bits.set(70));
        assert!(bits.get(70));
        assert_eq!(bits.count(), 1);
        assert!(bits.clear(70));
        assert!(!bits.clear(70));
        assert_eq!(bits.count(), 0);
    }

    #[test]
    fn runs_are_maximal() {
        let bits = Bitfield::from_indices([0, 1, 2, 5, 63, 64, 65]);
        assert_eq!(
            bits.runs(),
            vec![
                Run { start: 0, end: 3 },
                Run { start: 5, end: 6 },
                Run { start: 63, end: 66 },
            ]
        );
        assert_eq!(Bitfield::from_runs(&bits.runs()), bits);
    }

    #[test]
    fn run_reaching_word_end_is_closed() {
        let bits = Bitfield::from_indices(60..64);
        assert_eq!(bits.runs(), vec![Run { start: 60, end: 64 }]);
    }

    #[test]
    fn ranges_fill_whole_words() {
        let mut bits = Bitfield::new();
        bits.set_range(3, 200);
        bits.set_range(100, 130);
        assert_eq!(bits.count(), 197);
        assert_eq!(bits.runs(), vec![Run { start: 3, end: 200 }]);
        assert_eq!(bits.contiguous(), 0);

        bits.set_range(0, 3);
        assert_eq!(bits.contiguous(), 200);
        bits.set_range(9, 9);
        assert_eq!(bits.count(), 200);
    }

    #[test]
    fn contiguous_prefix_tracks_gaps() {
        let mut bits = Bitfield::from_indices([0, 1, 3]);
        assert_eq!(bits.contiguous(), 2);
        bits.set(2);
        assert_eq!(bits.contiguous(), 4);
        bits.clear(1);
        assert_eq!(bits.contiguous(), 1);
        assert_eq!(bits.missing(5).collect::<Vec<_>>(), vec![1, 4]);
        assert!(bits.all(2, 4));
    }

    #[test]
    fn coalesce_merges_neighbours() {
        assert_eq!(
            Run::coalesce([7, 5, 6, 9, 6]),
            vec![Run { start: 5, end: 8 }, Run { start: 9, end: 10 }]
        );
        assert!(Run::coalesce([]).is_empty());
    }

    #[test]
    fn missing_and_all() {
        let bits = Bitfield::from_indices([0, 2]);
        assert_eq!(bits.missing(4).collect::<Vec<_>>(), vec![1, 3]);
        assert!(bits.all(0, 1));
        assert!(!bits.all(0, 3));
        assert!(bits.all(5, 5));
    }
}
