//! Bitmap index for AMQP topic patterns.
//!
//! Patterns are dot-separated words where `*` matches exactly one word and a
//! trailing `#` matches zero or more words. Every pattern gets a column (its index
//! in the subscription list) and each word position gets a table of bitmaps:
//!
//! - one row per literal word seen at that position,
//! - `other`, the patterns holding a wildcard at that position,
//! - `null`, the patterns that may end before that position.
//!
//! Literal rows always include the `other` bits, so matching a topic is one AND per
//! topic word regardless of how many patterns are subscribed.

mod bitset;

use std::collections::HashMap;

pub use bitset::BitSet;

const SINGLE_WORD: &str = "*";
const MULTI_WORD: &str = "#";

#[derive(Debug, Clone, Default)]
struct ConstituentTable {
    literals: HashMap<String, BitSet>,
    null: BitSet,
    other: BitSet,
}

/// What a pattern holds at a given word position.
enum Slot<'a> {
    Literal(&'a str),
    Wildcard,
    /// A trailing `#`: any word, or no word at all.
    OpenTail,
    Null,
}

impl ConstituentTable {
    fn mark(&mut self, index: usize, slot: Slot<'_>) {
        match slot {
            Slot::Literal(word) => {
                let other = &self.other;
                self.literals
                    .entry(word.to_owned())
                    .or_insert_with(|| other.clone())
                    .set(index);
            }
            Slot::Wildcard => self.mark_other(index),
            Slot::OpenTail => {
                self.mark_other(index);
                self.null.set(index);
            }
            Slot::Null => self.null.set(index),
        }
    }

    fn mark_other(&mut self, index: usize) {
        self.other.set(index);
        for row in self.literals.values_mut() {
            row.set(index);
        }
    }

    fn remove_column(&mut self, index: usize) {
        self.null.remove_bit(index);
        self.other.remove_bit(index);
        for row in self.literals.values_mut() {
            row.remove_bit(index);
        }

        // A row holding nothing but wildcard bits is what the `other` fallback yields.
        let other = &self.other;
        self.literals.retain(|_, row| *row != *other);
    }

    fn row(&self, word: &str) -> &BitSet {
        self.literals.get(word).unwrap_or(&self.other)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TopicMatcher {
    patterns: Vec<String>,
    tables: Vec<ConstituentTable>,
    /// Patterns ending in `#`, which also match topics longer than every table.
    open_tails: BitSet,
}

fn slot_at<'a>(words: &[&'a str], position: usize) -> Slot<'a> {
    let last = words.len() - 1;
    let open = words[last] == MULTI_WORD;

    match words.get(position) {
        Some(_) if position == last && open => Slot::OpenTail,
        Some(&word) if word == SINGLE_WORD || word == MULTI_WORD => Slot::Wildcard,
        Some(&word) => Slot::Literal(word),
        None if open => Slot::OpenTail,
        None => Slot::Null,
    }
}

impl TopicMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.patterns.iter().any(|p| p == pattern)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Subscribes `pattern`. Returns `false` if it was already present.
    pub fn add(&mut self, pattern: &str) -> bool {
        if pattern.is_empty() || self.contains(pattern) {
            return false;
        }

        let index = self.patterns.len();
        let words: Vec<&str> = pattern.split('.').collect();

        // New positions start out knowing every existing pattern.
        while self.tables.len() < words.len() {
            let position = self.tables.len();
            let mut table = ConstituentTable::default();
            for (existing, p) in self.patterns.iter().enumerate() {
                let existing_words: Vec<&str> = p.split('.').collect();
                table.mark(existing, slot_at(&existing_words, position));
            }
            self.tables.push(table);
        }

        for (position, table) in self.tables.iter_mut().enumerate() {
            table.mark(index, slot_at(&words, position));
        }

        if words.last() == Some(&MULTI_WORD) {
            self.open_tails.set(index);
        }

        self.patterns.push(pattern.to_owned());
        true
    }

    /// Unsubscribes `pattern`. Returns `false` if it was not present.
    pub fn remove(&mut self, pattern: &str) -> bool {
        let Some(index) = self.patterns.iter().position(|p| p == pattern) else {
            return false;
        };

        self.patterns.remove(index);
        self.open_tails.remove_bit(index);
        for table in &mut self.tables {
            table.remove_column(index);
        }

        let depth = self
            .patterns
            .iter()
            .map(|p| p.split('.').count())
            .max()
            .unwrap_or(0);
        self.tables.truncate(depth);

        true
    }

    /// Returns the subscribed patterns matching `topic`, in subscription order.
    pub fn matches(&self, topic: &str) -> Vec<&str> {
        if topic.is_empty() || self.patterns.is_empty() {
            return Vec::new();
        }

        let words: Vec<&str> = topic.split('.').collect();
        let mut candidates = BitSet::full(self.patterns.len());

        for (position, word) in words.iter().enumerate() {
            match self.tables.get(position) {
                Some(table) => candidates.and_with(table.row(word)),
                None => candidates.and_with(&self.open_tails),
            }
            if candidates.is_empty() {
                return Vec::new();
            }
        }

        if let Some(table) = self.tables.get(words.len()) {
            candidates.and_with(&table.null);
        }

        candidates
            .iter()
            .map(|index| self.patterns[index].as_str())
            .collect()
    }
}
