//! Bindings and the per-exchange binding registry.

use std::{
    borrow::Cow,
    collections::{BTreeMap, HashMap},
    sync::OnceLock,
};

use crate::{
    error::{Error, Result},
    filter::Filter,
    message::{Headers, Metadata},
    store::BindingRecord,
};

/// A queue's interest in messages matching `pattern` on one exchange.
#[derive(Debug, Clone)]
pub struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
    arguments: Headers,
    filter: Option<Filter>,
}

impl PartialEq for Binding {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
            && self.queue == other.queue
            && self.filter_source() == other.filter_source()
    }
}

impl Binding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        pattern: impl Into<String>,
        arguments: Headers,
        filter: Option<Filter>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            pattern: pattern.into(),
            arguments,
            filter,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn arguments(&self) -> &Headers {
        &self.arguments
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn filter_source(&self) -> Option<&str> {
        self.filter.as_ref().map(Filter::source)
    }

    pub fn accepts(&self, metadata: &Metadata) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(metadata))
    }

    pub fn record(&self) -> BindingRecord {
        BindingRecord {
            exchange: self.exchange.clone(),
            queue: self.queue.clone(),
            pattern: self.pattern.clone(),
            arguments: self
                .arguments
                .iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
            filter: self.filter_source().map(str::to_owned),
        }
    }
}

/// All bindings registered under one routing pattern, at most one per queue.
#[derive(Debug, Clone, Default)]
pub struct BindingSet {
    unfiltered: BTreeMap<String, Binding>,
    /// A queue holds one filtered binding per pattern; a merged set can hold
    /// several, any of which admits a message.
    filtered: BTreeMap<String, Vec<Binding>>,
    frozen: bool,
}

impl BindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared empty set handed out for unknown patterns. It rejects mutation.
    pub fn empty() -> &'static BindingSet {
        static EMPTY: OnceLock<BindingSet> = OnceLock::new();
        EMPTY.get_or_init(|| BindingSet {
            frozen: true,
            ..Default::default()
        })
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn len(&self) -> usize {
        self.unfiltered.len() + self.filtered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unfiltered.is_empty() && self.filtered.is_empty()
    }

    pub fn get(&self, queue: &str) -> Option<&Binding> {
        self.unfiltered
            .get(queue)
            .or_else(|| self.filtered.get(queue).and_then(|bindings| bindings.first()))
    }

    /// Adds `binding`. Returns `Ok(false)` when an identical binding is already
    /// present and fails when the queue is bound here with a different filter.
    pub fn add(&mut self, binding: Binding) -> Result<bool> {
        if self.frozen {
            return Err(Error::opaque("attempted to modify the frozen empty binding set"));
        }

        if let Some(existing) = self.get(binding.queue()) {
            if *existing == binding {
                return Ok(false);
            }
            return Err(Error::validation(format!(
                "queue {} is already bound with pattern {:?} using a different filter",
                binding.queue(),
                binding.pattern()
            )));
        }

        if binding.filter.is_some() {
            self.filtered.insert(binding.queue.clone(), vec![binding]);
        } else {
            self.unfiltered.insert(binding.queue.clone(), binding);
        }

        Ok(true)
    }

    pub fn remove(&mut self, queue: &str) -> Result<Option<Binding>> {
        if self.frozen {
            return Err(Error::opaque("attempted to modify the frozen empty binding set"));
        }

        Ok(self.unfiltered.remove(queue).or_else(|| {
            self.filtered
                .remove(queue)
                .and_then(|bindings| bindings.into_iter().next())
        }))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.unfiltered
            .values()
            .chain(self.filtered.values().flatten())
    }

    /// Unions `other` into this set. Used to merge the sets of several topic
    /// patterns, so a queue may appear under more than one pattern. An unfiltered
    /// binding supersedes filtered ones; filtered ones accumulate.
    fn merge(&mut self, other: &BindingSet) {
        for binding in other.unfiltered.values() {
            self.filtered.remove(&binding.queue);
            self.unfiltered
                .entry(binding.queue.clone())
                .or_insert_with(|| binding.clone());
        }
        for (queue, bindings) in &other.filtered {
            if self.unfiltered.contains_key(queue) {
                continue;
            }
            self.filtered
                .entry(queue.clone())
                .or_default()
                .extend(bindings.iter().cloned());
        }
    }

    /// Queues that should receive a message with `metadata`. Unfiltered bindings
    /// always accept; filtered ones only when the predicate holds.
    pub fn target_queues<'a>(&'a self, metadata: &'a Metadata) -> impl Iterator<Item = &'a str> {
        self.unfiltered.keys().map(String::as_str).chain(
            self.filtered
                .iter()
                .filter(move |(_, bindings)| bindings.iter().any(|b| b.accepts(metadata)))
                .map(|(queue, _)| queue.as_str()),
        )
    }

    /// Unions several sets into a new one, borrowing when there is nothing to merge.
    pub fn union<'a>(sets: impl IntoIterator<Item = &'a BindingSet>) -> Cow<'a, BindingSet> {
        let mut sets = sets.into_iter().filter(|s| !s.is_empty());

        let Some(first) = sets.next() else {
            return Cow::Borrowed(BindingSet::empty());
        };

        let mut merged: Option<BindingSet> = None;
        for set in sets {
            merged
                .get_or_insert_with(|| BindingSet {
                    frozen: false,
                    ..first.clone()
                })
                .merge(set);
        }

        match merged {
            Some(merged) => Cow::Owned(merged),
            None => Cow::Borrowed(first),
        }
    }
}

/// Binding sets of one exchange, keyed by routing pattern.
#[derive(Debug, Clone, Default)]
pub struct BindingRegistry {
    by_pattern: HashMap<String, BindingSet>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pattern.is_empty()
    }

    pub fn get(&self, pattern: &str) -> &BindingSet {
        self.by_pattern
            .get(pattern)
            .unwrap_or_else(|| BindingSet::empty())
    }

    pub fn add(&mut self, binding: Binding) -> Result<bool> {
        self.by_pattern
            .entry(binding.pattern.clone())
            .or_default()
            .add(binding)
    }

    /// Removes the binding of `queue` under `pattern`. The second element reports
    /// whether the pattern lost its last binding.
    pub fn remove(&mut self, queue: &str, pattern: &str) -> Result<(Binding, bool)> {
        let set = self.by_pattern.get_mut(pattern).ok_or_else(|| {
            Error::not_found(format!("binding of queue {queue} with pattern {pattern:?}"))
        })?;

        let binding = set.remove(queue)?.ok_or_else(|| {
            Error::not_found(format!("binding of queue {queue} with pattern {pattern:?}"))
        })?;

        let last = set.is_empty();
        if last {
            self.by_pattern.remove(pattern);
        }

        Ok((binding, last))
    }

    /// Drops every binding of `queue`, returning them with the patterns left unused.
    pub fn remove_queue(&mut self, queue: &str) -> (Vec<Binding>, Vec<String>) {
        let mut removed = Vec::new();
        let mut unused = Vec::new();

        for (pattern, set) in self.by_pattern.iter_mut() {
            if let Ok(Some(binding)) = set.remove(queue) {
                removed.push(binding);
                if set.is_empty() {
                    unused.push(pattern.clone());
                }
            }
        }

        for pattern in &unused {
            self.by_pattern.remove(pattern);
        }

        (removed, unused)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.by_pattern.values().flat_map(BindingSet::iter)
    }
}
