mod ranks;
mod report;

pub use ranks::RankSet;
pub use report::{MergeReport, SourceOutcome, SourceStatus};

use self::ranks::RankIndex;

use std::fmt;
use std::io;
use std::time::Duration;

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::folded::{parse_line, Aggregate, LineCounts};

/// The default number of threads to merge with: one per logical core.
#[doc(hidden)]
pub static DEFAULT_NTHREADS: Lazy<usize> =
    Lazy::new(|| std::thread::available_parallelism().map_or(1, |n| n.get()));

/// Where a stack dump came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Provenance {
    /// The rank of the worker process that produced the dump.
    pub rank: usize,
    /// Where the dump was read from (a network address or a file), if known.
    pub origin: Option<String>,
}

impl Provenance {
    /// A provenance with only a rank.
    pub fn rank(rank: usize) -> Self {
        Provenance { rank, origin: None }
    }

    /// A provenance with a rank and an origin.
    pub fn new<S: Into<String>>(rank: usize, origin: S) -> Self {
        Provenance {
            rank,
            origin: Some(origin.into()),
        }
    }

    /// The tag appended to frames when provenance tagging is on.
    pub fn tag(&self) -> String {
        format!("rank {}", self.rank)
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            Some(ref origin) => write!(f, "rank {} ({})", self.rank, origin),
            None => write!(f, "rank {}", self.rank),
        }
    }
}

/// Why a source did not contribute any stacks.
#[derive(Debug, Error)]
pub enum SourceUnavailable {
    /// Fetching the dump failed.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Fetching the dump took longer than allowed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The fetch was cancelled before this source was reached.
    #[error("cancelled")]
    Cancelled,

    /// The dump did not contain a single non-blank line.
    #[error("source is empty")]
    Empty,

    /// Reading the dump failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The payload of a source: either its dump, or the reason there is none.
#[derive(Debug)]
pub enum SourceData {
    /// The raw folded stack text.
    Text(String),
    /// The source could not be read.
    Unavailable(SourceUnavailable),
}

/// One rank's stack dump, tagged with where it came from.
#[derive(Debug)]
pub struct Source {
    /// Where the dump came from.
    pub provenance: Provenance,
    /// The dump itself.
    pub data: SourceData,
}

impl Source {
    /// A source with the given folded stack text.
    pub fn text<S: Into<String>>(provenance: Provenance, text: S) -> Self {
        Source {
            provenance,
            data: SourceData::Text(text.into()),
        }
    }

    /// A source with the given raw dump.
    ///
    /// Bytes that are not valid UTF-8 are replaced with `U+FFFD`, so a stray byte only affects
    /// the frame it is in.
    pub fn bytes(provenance: Provenance, bytes: Vec<u8>) -> Self {
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        Source::text(provenance, text)
    }

    /// A source that could not be read.
    pub fn unavailable(provenance: Provenance, reason: SourceUnavailable) -> Self {
        Source {
            provenance,
            data: SourceData::Unavailable(reason),
        }
    }
}

/// Configure how sources are merged.
#[derive(Debug, Clone)]
pub struct Options {
    /// Append each source's rank to all of its frames (`frame [rank N]`), so that stacks from
    /// different ranks stay apart in the merged result.
    ///
    /// Default is `false`.
    pub tag_provenance: bool,

    /// Rename every frame to `frame@present|missing`, where `present` is the set of ranks that
    /// reached the frame through the same callers and `missing` is every other rank that was
    /// given a source, failed ones included. See [`RankSet`] for how the sets are written.
    ///
    /// Default is `false`.
    pub annotate_ranks: bool,

    /// The number of threads to fold sources on.
    ///
    /// Default is the number of logical cores on your machine.
    pub nthreads: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            tag_provenance: false,
            annotate_ranks: false,
            nthreads: *DEFAULT_NTHREADS,
        }
    }
}

/// Merges every source into a single aggregate.
///
/// Each line is parsed on its own; malformed lines are logged, counted and skipped. Sources that
/// are unavailable or empty are recorded as failed and skipped. Nothing here aborts the merge,
/// so the returned aggregate holds everything that could be salvaged, and the report says how
/// much that was.
///
/// The result does not depend on the order of `sources`, nor on the number of threads used.
pub fn merge<I>(sources: I, opt: &Options) -> (Aggregate, MergeReport)
where
    I: IntoIterator<Item = Source>,
{
    let sources: Vec<Source> = sources.into_iter().collect();
    let all_ranks: RankSet = sources.iter().map(|s| s.provenance.rank).collect();

    let (aggregate, ranks, outcomes) = fold_all(sources, opt);
    let report = MergeReport::new(outcomes);
    info!("{}", report);

    let aggregate = match ranks {
        Some(ranks) => ranks.annotate(&aggregate, &all_ranks),
        None => aggregate,
    };
    (aggregate, report)
}

/// Everything folded out of a set of sources, before annotation.
type Folded = (Aggregate, Option<RankIndex>, Vec<SourceOutcome>);

fn fold_all(sources: Vec<Source>, opt: &Options) -> Folded {
    #[cfg(feature = "multithreaded")]
    {
        if opt.nthreads > 1 && sources.len() > 1 {
            return fold_multi_threaded(sources, opt);
        }
    }

    fold_single_threaded(sources, opt)
}

fn fold_single_threaded(sources: Vec<Source>, opt: &Options) -> Folded {
    let mut aggregate = Aggregate::new();
    let mut ranks = if opt.annotate_ranks {
        Some(RankIndex::default())
    } else {
        None
    };
    let mut outcomes = Vec::with_capacity(sources.len());
    for source in sources {
        outcomes.push(fold_source(source, opt, &mut aggregate, ranks.as_mut()));
    }
    (aggregate, ranks, outcomes)
}

#[cfg(feature = "multithreaded")]
fn fold_multi_threaded(sources: Vec<Source>, opt: &Options) -> Folded {
    use crossbeam_channel as channel;

    let nsources = sources.len();
    let nthreads = std::cmp::min(opt.nthreads, nsources);

    let (aggregate, ranks, mut outcomes) = crossbeam_utils::thread::scope(|scope| {
        // Every source is queued up front, so the channel never blocks the sender.
        let (tx_input, rx_input) = channel::bounded::<(usize, Source)>(nsources);
        for job in sources.into_iter().enumerate() {
            // the receiver is still alive, so this cannot fail
            let _ = tx_input.send(job);
        }
        drop(tx_input);

        let handles: Vec<_> = (0..nthreads)
            .map(|_| {
                let rx_input = rx_input.clone();
                scope.spawn(move |_| {
                    // Each worker folds into its own partial aggregate; partials are combined
                    // once everyone is done.
                    let mut partial = Aggregate::new();
                    let mut ranks = if opt.annotate_ranks {
                        Some(RankIndex::default())
                    } else {
                        None
                    };
                    let mut outcomes = Vec::new();
                    for (index, source) in rx_input.iter() {
                        let outcome = fold_source(source, opt, &mut partial, ranks.as_mut());
                        outcomes.push((index, outcome));
                    }
                    (partial, ranks, outcomes)
                })
            })
            .collect();

        let mut aggregate = Aggregate::new();
        let mut ranks = if opt.annotate_ranks {
            Some(RankIndex::default())
        } else {
            None
        };
        let mut outcomes = Vec::with_capacity(nsources);
        for handle in handles {
            let (partial, partial_ranks, partial_outcomes) = handle
                .join()
                .unwrap_or_else(|e| std::panic::resume_unwind(e));
            aggregate.combine(partial);
            if let (Some(ranks), Some(partial_ranks)) = (ranks.as_mut(), partial_ranks) {
                ranks.combine(partial_ranks);
            }
            outcomes.extend(partial_outcomes);
        }
        (aggregate, ranks, outcomes)
    })
    .unwrap_or_else(|e| std::panic::resume_unwind(e));

    // report sources in the order they were given
    outcomes.sort_unstable_by_key(|&(index, _)| index);
    let outcomes = outcomes.into_iter().map(|(_, outcome)| outcome).collect();
    (aggregate, ranks, outcomes)
}

/// Parses all lines of one source into `aggregate`.
fn fold_source(
    source: Source,
    opt: &Options,
    aggregate: &mut Aggregate,
    mut ranks: Option<&mut RankIndex>,
) -> SourceOutcome {
    let Source { provenance, data } = source;
    let text = match data {
        SourceData::Text(text) => text,
        SourceData::Unavailable(reason) => {
            warn!("Skipping {}: {}", provenance, reason);
            return SourceOutcome::new(provenance, SourceStatus::Unavailable(reason));
        }
    };

    let tag = if opt.tag_provenance {
        Some(provenance.tag())
    } else {
        None
    };

    let mut lines = LineCounts::default();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(mut record) => {
                if let Some(ref tag) = tag {
                    record.stack = record.stack.tagged(tag);
                }
                if let Some(ranks) = ranks.as_mut() {
                    ranks.record(&record.stack, provenance.rank);
                }
                aggregate.add_record(record);
                lines.accepted += 1;
            }
            Err(e) => {
                warn!("Ignoring line {} of {}: {}", i + 1, provenance, e);
                lines.rejected += 1;
            }
        }
    }

    if lines.accepted == 0 && lines.rejected == 0 {
        warn!("Skipping {}: {}", provenance, SourceUnavailable::Empty);
        return SourceOutcome::new(provenance, SourceStatus::Unavailable(SourceUnavailable::Empty));
    }

    debug!(
        "Folded {}: {} lines accepted, {} rejected",
        provenance, lines.accepted, lines.rejected
    );
    SourceOutcome::new(provenance, SourceStatus::Merged(lines))
}
