use std::fmt;

use super::{Provenance, SourceUnavailable};
use crate::folded::LineCounts;

/// What happened to one source during a merge.
#[derive(Debug)]
pub enum SourceStatus {
    /// The source was parsed; some of its lines may have been rejected.
    Merged(LineCounts),
    /// The source contributed nothing.
    Unavailable(SourceUnavailable),
}

/// The outcome of merging one source.
#[derive(Debug)]
pub struct SourceOutcome {
    /// Which source this is about.
    pub provenance: Provenance,
    /// What happened to it.
    pub status: SourceStatus,
}

impl SourceOutcome {
    pub(crate) fn new(provenance: Provenance, status: SourceStatus) -> Self {
        SourceOutcome { provenance, status }
    }

    /// Whether this source contributed at least one stack.
    pub fn succeeded(&self) -> bool {
        matches!(self.status, SourceStatus::Merged(lines) if lines.accepted > 0)
    }
}

/// Per-source outcomes of a merge, in the order the sources were given.
#[derive(Debug, Default)]
pub struct MergeReport {
    sources: Vec<SourceOutcome>,
}

impl MergeReport {
    pub(crate) fn new(sources: Vec<SourceOutcome>) -> Self {
        MergeReport { sources }
    }

    /// The outcome of every source.
    pub fn sources(&self) -> &[SourceOutcome] {
        &self.sources
    }

    /// The number of sources that contributed at least one stack.
    pub fn succeeded(&self) -> usize {
        self.sources.iter().filter(|o| o.succeeded()).count()
    }

    /// The number of sources that contributed nothing.
    pub fn failed(&self) -> usize {
        self.sources.len() - self.succeeded()
    }

    /// Accepted and rejected lines, summed over all sources.
    pub fn lines(&self) -> LineCounts {
        let mut lines = LineCounts::default();
        for outcome in &self.sources {
            if let SourceStatus::Merged(l) = outcome.status {
                lines.add(l);
            }
        }
        lines
    }

    /// The sources that contributed nothing.
    pub fn failures(&self) -> impl Iterator<Item = &SourceOutcome> {
        self.sources.iter().filter(|o| !o.succeeded())
    }
}

impl fmt::Display for MergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = self.lines();
        write!(
            f,
            "merged {} of {} sources ({} failed); {} lines accepted, {} rejected",
            self.succeeded(),
            self.sources.len(),
            self.failed(),
            lines.accepted,
            lines.rejected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_line() {
        let report = MergeReport::new(vec![
            SourceOutcome::new(
                Provenance::rank(0),
                SourceStatus::Merged(LineCounts {
                    accepted: 10,
                    rejected: 2,
                }),
            ),
            SourceOutcome::new(
                Provenance::rank(1),
                SourceStatus::Merged(LineCounts {
                    accepted: 0,
                    rejected: 3,
                }),
            ),
            SourceOutcome::new(
                Provenance::rank(2),
                SourceStatus::Unavailable(SourceUnavailable::Cancelled),
            ),
        ]);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 2);
        assert_eq!(
            report.failures().map(|o| o.provenance.rank).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(
            report.to_string(),
            "merged 1 of 3 sources (2 failed); 10 lines accepted, 5 rejected"
        );
    }
}
