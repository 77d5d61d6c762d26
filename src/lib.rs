//! rankflame turns the call-stack samples of a distributed job, collected separately from every
//! worker process (every "rank"), into a single [flame graph].
//!
//! Like the original flame graph toolkit, the work happens in stages, each of which is available
//! both as a library module and as a binary:
//!
//!  1. **fetch** ([`fetch`], `rankflame-fetch`): pull one collapsed stack dump per rank from the
//!     addresses listed in a source configuration, using a bounded pool of workers with a
//!     per-source timeout.
//!  2. **merge** ([`merge`], `rankflame-merge`): parse every dump line by line and fold them all
//!     into one canonical [`Aggregate`](folded::Aggregate), written out as a "merged" folded
//!     stack file.
//!  3. **render** ([`flamegraph`], `rankflame-render`): build a call tree from the merged stacks,
//!     lay it out, and write an SVG.
//!
//! # Command-line use
//!
//! ```console
//! $ cat ranks.txt
//! 0 10.0.0.1:9090
//! 1 10.0.0.2:9090
//! $ rankflame-fetch ranks.txt -o dumps/
//! $ rankflame-merge dumps/rank-*.folded -o merged.folded
//! $ rankflame-render merged.folded -o profile.svg
//! ```
//!
//! Every stage reports how many sources and lines it accepted and rejected, so a missing rank
//! never goes unnoticed.
//!
//! # Input format
//!
//! All stages exchange the folded stack format: one stack per line, frames from the outermost
//! caller to the sampled frame joined by `;`, then whitespace, then a positive sample count.
//!
//! ```text
//! main;foo;bar 5
//! main;qux 4
//! ```
//!
//!   [flame graph]: http://www.brendangregg.com/flamegraphs.html

#![deny(missing_docs)]

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

#[macro_use]
extern crate log;

/// Error types shared by the binaries.
pub mod error;

/// Parsing of folded stack lines, and the canonical aggregate they fold into.
///
/// See the [crate-level documentation] for details.
///
///   [crate-level documentation]: ../index.html
pub mod folded;

/// Merging many per-rank stack dumps into one aggregate.
///
/// See the [crate-level documentation] for details.
///
///   [crate-level documentation]: ../index.html
pub mod merge;

/// Collecting raw per-rank stack dumps over the network.
#[cfg(feature = "multithreaded")]
pub mod fetch;

/// Tools for producing flame graphs from merged folded stacks.
///
/// See the [crate-level documentation] for details.
///
///   [crate-level documentation]: ../index.html
pub mod flamegraph;

pub use error::Error;
