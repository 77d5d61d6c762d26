use std::collections::HashMap;
use std::io::{self, prelude::*};

use ahash::RandomState;

use super::{parse_line, CollapsedRecord, StackPath};

const CAPACITY_HASHMAP: usize = 512;

/// How many lines of an input were accepted and rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineCounts {
    /// Lines that parsed into a record.
    pub accepted: usize,
    /// Lines that did not parse. Blank lines are not counted at all.
    pub rejected: usize,
}

impl LineCounts {
    pub(crate) fn add(&mut self, other: LineCounts) {
        self.accepted += other.accepted;
        self.rejected += other.rejected;
    }
}

/// Total sample counts, keyed by exact stack path.
///
/// Adding to an aggregate is commutative and associative: folding the same records in any order,
/// or folding them in batches and [`combine`](Aggregate::combine)-ing the batches, yields equal
/// aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    stacks: HashMap<StackPath, u64, RandomState>,
}

impl Default for Aggregate {
    fn default() -> Self {
        Aggregate {
            stacks: HashMap::with_capacity_and_hasher(CAPACITY_HASHMAP, RandomState::new()),
        }
    }
}

impl Aggregate {
    /// Creates an empty aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `count` samples to `stack`. Counts saturate at `u64::MAX`.
    pub fn add(&mut self, stack: StackPath, count: u64) {
        let total = self.stacks.entry(stack).or_insert(0);
        *total = total.saturating_add(count);
    }

    /// Adds a parsed record.
    pub fn add_record(&mut self, record: CollapsedRecord) {
        self.add(record.stack, record.count);
    }

    /// Folds every path of `other` into this aggregate.
    pub fn combine(&mut self, other: Aggregate) {
        // grow the larger map
        if other.stacks.len() > self.stacks.len() {
            let smaller = std::mem::replace(&mut self.stacks, other.stacks);
            for (stack, count) in smaller {
                self.add(stack, count);
            }
        } else {
            for (stack, count) in other.stacks {
                self.add(stack, count);
            }
        }
    }

    /// The aggregate count of exactly this path, if it was ever sampled.
    pub fn get(&self, stack: &str) -> Option<u64> {
        self.stacks.get(stack).copied()
    }

    /// The number of distinct paths.
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    /// Whether no samples were added.
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// The sum of all counts.
    pub fn total(&self) -> u64 {
        self.stacks
            .values()
            .fold(0u64, |total, &count| total.saturating_add(count))
    }

    /// Iterates over all paths and their counts, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&StackPath, u64)> {
        self.stacks.iter().map(|(stack, &count)| (stack, count))
    }

    /// All paths and their counts, sorted by path.
    pub fn sorted(&self) -> Vec<(&StackPath, u64)> {
        let mut contents: Vec<_> = self.iter().collect();
        contents.sort_unstable();
        contents
    }

    /// Writes the aggregate in the folded stack format, one line per path, sorted by path.
    pub fn write_to<W>(&self, mut writer: W) -> io::Result<()>
    where
        W: Write,
    {
        let mut count_buf = itoa::Buffer::new();
        for (stack, count) in self.sorted() {
            writer.write_all(stack.as_str().as_bytes())?;
            writer.write_all(b" ")?;
            writer.write_all(count_buf.format(count).as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()
    }

    /// Reads folded stack lines, for example a previously written merged file.
    ///
    /// Malformed lines are skipped with a warning and counted; only I/O errors are returned.
    /// Bytes that are not valid UTF-8 are replaced line by line, so they never cost more than
    /// the line they are on.
    pub fn from_reader<R>(mut reader: R) -> io::Result<(Self, LineCounts)>
    where
        R: BufRead,
    {
        let mut aggregate = Aggregate::new();
        let mut counts = LineCounts::default();
        let mut line_buffer = Vec::new();
        let mut line_num = 0;
        loop {
            line_buffer.clear();
            if reader.read_until(b'\n', &mut line_buffer)? == 0 {
                break;
            }
            line_num += 1;

            let line = String::from_utf8_lossy(&line_buffer);

            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line) {
                Ok(record) => {
                    aggregate.add_record(record);
                    counts.accepted += 1;
                }
                Err(e) => {
                    warn!("Ignoring line {}: {}", line_num, e);
                    counts.rejected += 1;
                }
            }
        }

        Ok((aggregate, counts))
    }
}

impl Extend<CollapsedRecord> for Aggregate {
    fn extend<I: IntoIterator<Item = CollapsedRecord>>(&mut self, iter: I) {
        for record in iter {
            self.add_record(record);
        }
    }
}

impl FromIterator<CollapsedRecord> for Aggregate {
    fn from_iter<I: IntoIterator<Item = CollapsedRecord>>(iter: I) -> Self {
        let mut aggregate = Aggregate::new();
        aggregate.extend(iter);
        aggregate
    }
}
