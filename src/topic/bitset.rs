const WORD_BITS: usize = u64::BITS as usize;

/// Growable bitset over pattern indices.
#[derive(Debug, Clone, Default)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bitset with bits `0..len` set.
    pub fn full(len: usize) -> Self {
        let mut words = vec![u64::MAX; len / WORD_BITS];
        let rem = len % WORD_BITS;
        if rem != 0 {
            words.push((1u64 << rem) - 1);
        }
        Self { words }
    }

    pub fn set(&mut self, index: usize) {
        let word = index / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (index % WORD_BITS);
    }

    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / WORD_BITS)
            .is_some_and(|word| word & (1u64 << (index % WORD_BITS)) != 0)
    }

    pub fn and_with(&mut self, other: &BitSet) {
        for (i, word) in self.words.iter_mut().enumerate() {
            *word &= other.words.get(i).copied().unwrap_or(0);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    /// Removes bit `index`, shifting every higher bit down by one so that bit `i`
    /// keeps naming the `i`-th entry of a list that lost its `index`-th element.
    pub fn remove_bit(&mut self, index: usize) {
        let start = index / WORD_BITS;
        if start >= self.words.len() {
            return;
        }

        let bit = index % WORD_BITS;
        let low_mask = (1u64 << bit) - 1;
        let word = self.words[start];
        let high = if bit == WORD_BITS - 1 {
            0
        } else {
            (word >> (bit + 1)) << bit
        };
        self.words[start] = (word & low_mask) | high;

        for i in start..self.words.len() {
            if i > start {
                self.words[i] >>= 1;
            }
            if let Some(&next) = self.words.get(i + 1) {
                self.words[i] |= (next & 1) << (WORD_BITS - 1);
            }
        }

        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            (0..WORD_BITS)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| i * WORD_BITS + bit)
        })
    }
}

impl PartialEq for BitSet {
    fn eq(&self, other: &Self) -> bool {
        let len = self.words.len().max(other.words.len());
        (0..len).all(|i| {
            self.words.get(i).copied().unwrap_or(0) == other.words.get(i).copied().unwrap_or(0)
        })
    }
}

impl Eq for BitSet {}
