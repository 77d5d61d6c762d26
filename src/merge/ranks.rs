use std::collections::{BTreeSet, HashMap};
use std::fmt;

use ahash::RandomState;

use crate::folded::{Aggregate, StackPath, DELIMITER};

/// A set of ranks.
///
/// Displays as runs of consecutive ranks joined by `/`, with each run written as `first-last`
/// (or just `rank` if it has one member). `{0, 1, 2, 5, 7, 8}` displays as `0-2/5/7-8`, and the
/// empty set displays as nothing at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankSet(BTreeSet<usize>);

impl RankSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rank. Returns whether it was not already present.
    pub fn insert(&mut self, rank: usize) -> bool {
        self.0.insert(rank)
    }

    /// Whether `rank` is in the set.
    pub fn contains(&self, rank: usize) -> bool {
        self.0.contains(&rank)
    }

    /// The number of ranks in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The ranks in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    /// Adds every rank of `other`.
    pub fn union_with(&mut self, other: &RankSet) {
        self.0.extend(other.iter());
    }

    /// The ranks of `self` that are not in `other`.
    pub fn difference(&self, other: &RankSet) -> RankSet {
        RankSet(self.0.difference(&other.0).copied().collect())
    }
}

impl FromIterator<usize> for RankSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        RankSet(iter.into_iter().collect())
    }
}

impl Extend<usize> for RankSet {
    fn extend<I: IntoIterator<Item = usize>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl fmt::Display for RankSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ranks = self.iter().peekable();
        let mut first_run = true;
        while let Some(start) = ranks.next() {
            let mut end = start;
            while ranks.peek() == Some(&(end + 1)) {
                end += 1;
                ranks.next();
            }

            if !first_run {
                f.write_str("/")?;
            }
            first_run = false;
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
        }
        Ok(())
    }
}

/// The ranks that sampled each call path prefix.
///
/// `main;foo` is reached by every rank that sampled `main;foo` itself or anything below it.
#[derive(Debug, Default)]
pub(crate) struct RankIndex {
    prefixes: HashMap<String, RankSet, RandomState>,
}

impl RankIndex {
    /// Records that `rank` sampled `stack`, and so every prefix of it.
    pub(crate) fn record(&mut self, stack: &StackPath, rank: usize) {
        let folded = stack.as_str();
        for (i, c) in folded.char_indices() {
            if c == DELIMITER {
                self.insert(&folded[..i], rank);
            }
        }
        self.insert(folded, rank);
    }

    fn insert(&mut self, prefix: &str, rank: usize) {
        match self.prefixes.get_mut(prefix) {
            Some(ranks) => {
                ranks.insert(rank);
            }
            None => {
                self.prefixes
                    .insert(prefix.to_string(), std::iter::once(rank).collect());
            }
        }
    }

    /// Folds `other` into this index.
    pub(crate) fn combine(&mut self, other: RankIndex) {
        for (prefix, ranks) in other.prefixes {
            self.prefixes.entry(prefix).or_default().union_with(&ranks);
        }
    }

    /// The ranks that sampled `prefix`, if any did.
    pub(crate) fn get(&self, prefix: &str) -> Option<&RankSet> {
        self.prefixes.get(prefix)
    }

    /// Renames every frame of every path in `aggregate` to `frame@present|missing`.
    ///
    /// `present` holds the ranks that reached the frame through the same callers, and `missing`
    /// holds the members of `all` that did not. Counts are carried over unchanged, and so is the
    /// shape of the call tree, because equal prefixes get equal annotations.
    pub(crate) fn annotate(&self, aggregate: &Aggregate, all: &RankSet) -> Aggregate {
        let empty = RankSet::new();
        let mut annotated = Aggregate::new();
        let mut frames = Vec::new();
        for (stack, count) in aggregate.iter() {
            frames.clear();
            let folded = stack.as_str();
            let mut start = 0;
            for frame in stack.frames() {
                let end = start + frame.len();
                let present = self.get(&folded[..end]).unwrap_or(&empty);
                frames.push(format!("{}@{}|{}", frame, present, all.difference(present)));
                start = end + DELIMITER.len_utf8();
            }

            match StackPath::from_frames(frames.iter().map(String::as_str)) {
                Some(path) => annotated.add(path, count),
                None => {
                    warn!("Leaving `{}` unannotated", stack);
                    annotated.add(stack.clone(), count);
                }
            }
        }
        annotated
    }
}
