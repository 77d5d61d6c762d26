//! The network side of the pipeline.
//!
//! [`fetch_all`] pulls one stack dump per rank listed in a [`SourceConfig`], through any
//! [`Fetch`] implementation (see [`HttpFetcher`] for the default one). Ranks are fetched by a
//! bounded pool of workers, and every fetch gets its own deadline, so a rank that never answers
//! only costs its own timeout. The result is always one [`Source`] per configured rank, ready to
//! be handed to [`merge`](crate::merge::merge).

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::HttpFetcher;

use std::cmp;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{self as channel, Receiver, RecvTimeoutError, TryRecvError};

use crate::merge::{Provenance, Source, SourceData, SourceUnavailable};
use crate::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONCURRENCY: usize = 16;
const DEFAULT_PATH: &str = "/stacks";
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Which address to fetch each rank's dump from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceConfig {
    // sorted by rank, ranks unique
    ranks: Vec<(usize, String)>,
}

impl SourceConfig {
    /// Builds a configuration out of `(rank, address)` pairs.
    ///
    /// Fails if a rank appears twice.
    pub fn new<I, S>(entries: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (usize, S)>,
        S: Into<String>,
    {
        let mut ranks: Vec<(usize, String)> = entries
            .into_iter()
            .map(|(rank, address)| (rank, address.into()))
            .collect();
        ranks.sort_by_key(|&(rank, _)| rank);
        if let Some(w) = ranks.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(Error::config(format!("rank {} is listed more than once", w[0].0)));
        }
        Ok(SourceConfig { ranks })
    }

    /// Adds more `(rank, address)` pairs to this configuration.
    ///
    /// Fails if a rank appears twice, whether within `entries` or across both.
    pub fn with_entries<I, S>(self, entries: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (usize, S)>,
        S: Into<String>,
    {
        let extra = entries
            .into_iter()
            .map(|(rank, address)| (rank, address.into()));
        Self::new(self.ranks.into_iter().chain(extra))
    }

    /// Reads a configuration in either of two formats.
    ///
    /// The line format has one `RANK ADDRESS` pair per line. Blank lines and lines starting with
    /// `#` are ignored:
    ///
    /// ```text
    /// # rank address
    /// 0 10.0.0.1:9090
    /// 1 10.0.0.2:9090
    /// ```
    ///
    /// Input that starts with `{` is read as a JSON object instead, mapping `rankN` (or just `N`)
    /// to the address of rank `N`:
    ///
    /// ```text
    /// {"rank0": "10.0.0.1:9090", "rank1": "10.0.0.2:9090"}
    /// ```
    pub fn from_reader<R>(mut reader: R) -> Result<Self, Error>
    where
        R: BufRead,
    {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        if text.trim_start().starts_with('{') {
            Self::from_json(&text)
        } else {
            Self::from_lines(&text)
        }
    }

    fn from_json(text: &str) -> Result<Self, Error> {
        let map: BTreeMap<String, String> = serde_json::from_str(text)
            .map_err(|e| Error::config(format!("invalid JSON source configuration: {}", e)))?;
        let mut entries = Vec::with_capacity(map.len());
        for (key, address) in map {
            let rank = key.strip_prefix("rank").unwrap_or(key.as_str());
            let rank = rank
                .parse::<usize>()
                .map_err(|_| Error::config(format!("invalid rank `{}`", key)))?;
            entries.push((rank, address));
        }
        Self::new(entries)
    }

    fn from_lines(text: &str) -> Result<Self, Error> {
        let mut entries = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (rank, address) = match (fields.next(), fields.next(), fields.next()) {
                (Some(rank), Some(address), None) => (rank, address),
                _ => {
                    return Err(Error::config(format!(
                        "line {}: expected `RANK ADDRESS`, found `{}`",
                        i + 1,
                        line
                    )))
                }
            };
            let rank = rank.parse::<usize>().map_err(|_| {
                Error::config(format!("line {}: invalid rank `{}`", i + 1, rank))
            })?;
            entries.push((rank, address.to_string()));
        }
        Self::new(entries)
    }

    /// Reads a configuration file; see [`SourceConfig::from_reader`] for the formats.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::config(format!("cannot open source configuration {}: {}", path.display(), e))
        })?;
        Self::from_reader(io::BufReader::new(file))
    }

    /// The configured sources, in rank order.
    pub fn iter(&self) -> impl Iterator<Item = Provenance> + '_ {
        self.ranks
            .iter()
            .map(|(rank, address)| Provenance::new(*rank, address.as_str()))
    }

    /// The number of configured ranks.
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    /// Whether no ranks are configured.
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }
}

/// Parses a single `RANK:ADDRESS` source, as given on the command line.
///
/// The address may be wrapped in angle brackets, as in `3:<10.0.0.4:9090>`.
pub fn parse_rank_address(s: &str) -> Result<(usize, String), Error> {
    let (rank, address) = s
        .split_once(':')
        .ok_or_else(|| Error::config(format!("expected `RANK:ADDRESS`, found `{}`", s)))?;
    let rank = rank
        .trim()
        .parse::<usize>()
        .map_err(|_| Error::config(format!("invalid rank `{}` in `{}`", rank, s)))?;
    let address = address.trim().trim_start_matches('<').trim_end_matches('>');
    if address.is_empty() {
        return Err(Error::config(format!("missing address in `{}`", s)));
    }
    Ok((rank, address.to_string()))
}

/// Retrieves the raw folded stack dump of a single rank.
///
/// Implementations should give up once `timeout` has passed. [`fetch_all`] stops waiting at that
/// point either way, but a fetch that keeps running still holds on to its thread.
pub trait Fetch: Send + Sync {
    /// Fetches the dump of the rank described by `provenance`.
    fn fetch(&self, provenance: &Provenance, timeout: Duration) -> Result<String, SourceUnavailable>;
}

impl<F> Fetch for F
where
    F: Fn(&Provenance, Duration) -> Result<String, SourceUnavailable> + Send + Sync,
{
    fn fetch(&self, provenance: &Provenance, timeout: Duration) -> Result<String, SourceUnavailable> {
        self(provenance, timeout)
    }
}

/// Configure how sources are fetched.
#[derive(Debug, Clone)]
pub struct Options {
    /// How long to wait for any one rank.
    ///
    /// Default is 10 seconds.
    pub timeout: Duration,

    /// How many ranks to fetch at the same time.
    ///
    /// Default is 16.
    pub concurrency: usize,

    /// The HTTP path the dump is served under on every rank.
    ///
    /// Default is `/stacks`.
    pub path: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
            path: DEFAULT_PATH.to_string(),
        }
    }
}

/// A handle to stop an in-progress [`fetch_all`].
///
/// Once cancelled, no further fetches are started, and fetches still in flight are abandoned.
/// Everything that completed before is still returned.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counts of how fetching went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// Ranks whose dump was retrieved.
    pub fetched: usize,
    /// Ranks that did not answer in time.
    pub timed_out: usize,
    /// Ranks that were not fetched because of cancellation.
    pub cancelled: usize,
    /// Ranks whose fetch failed otherwise.
    pub failed: usize,
}

impl FetchReport {
    fn from_sources(sources: &[Source]) -> Self {
        let mut report = FetchReport::default();
        for source in sources {
            match source.data {
                SourceData::Text(_) => report.fetched += 1,
                SourceData::Unavailable(SourceUnavailable::Timeout(_)) => report.timed_out += 1,
                SourceData::Unavailable(SourceUnavailable::Cancelled) => report.cancelled += 1,
                SourceData::Unavailable(_) => report.failed += 1,
            }
        }
        report
    }

    /// The number of ranks that were attempted or skipped.
    pub fn total(&self) -> usize {
        self.fetched + self.timed_out + self.cancelled + self.failed
    }
}

impl fmt::Display for FetchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched {} of {} sources ({} timed out, {} cancelled, {} failed)",
            self.fetched,
            self.total(),
            self.timed_out,
            self.cancelled,
            self.failed
        )
    }
}

/// Fetches the dump of every configured rank.
///
/// At most `opt.concurrency` fetches run at once. A rank that fails, times out, or is skipped
/// because of `cancel` is returned as an unavailable [`Source`] rather than failing the whole
/// call. Sources are returned in rank order.
pub fn fetch_all<F>(
    config: &SourceConfig,
    fetcher: Arc<F>,
    opt: &Options,
    cancel: &CancelToken,
) -> (Vec<Source>, FetchReport)
where
    F: Fetch + ?Sized + 'static,
{
    let nsources = config.len();
    if nsources == 0 {
        return (Vec::new(), FetchReport::default());
    }

    let nworkers = cmp::max(1, cmp::min(opt.concurrency, nsources));
    let timeout = opt.timeout;

    let (tx_jobs, rx_jobs) = channel::bounded::<(usize, Provenance)>(nsources);
    for job in config.iter().enumerate() {
        // the receiver is still alive, so this cannot fail
        let _ = tx_jobs.send(job);
    }
    drop(tx_jobs);

    let (tx_done, rx_done) = channel::unbounded::<(usize, Source)>();

    crossbeam_utils::thread::scope(|scope| {
        for _ in 0..nworkers {
            let rx_jobs = rx_jobs.clone();
            let tx_done = tx_done.clone();
            let fetcher = Arc::clone(&fetcher);
            scope.spawn(move |_| {
                for (index, provenance) in rx_jobs.iter() {
                    let data = if cancel.is_cancelled() {
                        SourceData::Unavailable(SourceUnavailable::Cancelled)
                    } else {
                        fetch_one(&fetcher, &provenance, timeout, cancel)
                    };
                    match data {
                        SourceData::Text(ref text) => {
                            debug!("Fetched {} ({} bytes)", provenance, text.len())
                        }
                        SourceData::Unavailable(ref reason) => {
                            warn!("Could not fetch {}: {}", provenance, reason)
                        }
                    }
                    let _ = tx_done.send((index, Source { provenance, data }));
                }
            });
        }
    })
    .unwrap_or_else(|e| std::panic::resume_unwind(e));
    drop(tx_done);

    let mut slots: Vec<Option<Source>> = (0..nsources).map(|_| None).collect();
    for (index, source) in rx_done.iter() {
        slots[index] = Some(source);
    }

    let sources: Vec<Source> = slots
        .into_iter()
        .zip(config.iter())
        .map(|(slot, provenance)| {
            slot.unwrap_or_else(|| Source::unavailable(provenance, SourceUnavailable::Cancelled))
        })
        .collect();

    let report = FetchReport::from_sources(&sources);
    info!("{}", report);
    (sources, report)
}

/// Runs one fetch on its own thread, and waits for it until the deadline or cancellation.
fn fetch_one<F>(
    fetcher: &Arc<F>,
    provenance: &Provenance,
    timeout: Duration,
    cancel: &CancelToken,
) -> SourceData
where
    F: Fetch + ?Sized + 'static,
{
    let (tx, rx) = channel::bounded(1);
    let spawned = {
        let fetcher = Arc::clone(fetcher);
        let provenance = provenance.clone();
        thread::Builder::new()
            .name(format!("rankflame-fetch-{}", provenance.rank))
            .spawn(move || {
                // nobody is listening anymore if we took too long
                let _ = tx.send(fetcher.fetch(&provenance, timeout));
            })
    };
    if let Err(e) = spawned {
        return SourceData::Unavailable(SourceUnavailable::Io(e));
    }

    await_fetch(&rx, timeout, Instant::now() + timeout, cancel)
}

type FetchResult = Result<String, SourceUnavailable>;

/// Waits for a fetch result until `deadline` or cancellation, whichever comes first.
///
/// A result that has already arrived is returned even if the deadline has passed or `cancel`
/// was triggered in the meantime.
fn await_fetch(
    rx: &Receiver<FetchResult>,
    timeout: Duration,
    deadline: Instant,
    cancel: &CancelToken,
) -> SourceData {
    loop {
        match rx.try_recv() {
            Ok(result) => return received(result),
            Err(TryRecvError::Disconnected) => return fetch_panicked(),
            Err(TryRecvError::Empty) => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return SourceData::Unavailable(SourceUnavailable::Timeout(timeout));
        }
        if cancel.is_cancelled() {
            return SourceData::Unavailable(SourceUnavailable::Cancelled);
        }

        match rx.recv_timeout(cmp::min(deadline - now, CANCEL_POLL_INTERVAL)) {
            Ok(result) => return received(result),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return fetch_panicked(),
        }
    }
}

fn received(result: FetchResult) -> SourceData {
    match result {
        Ok(text) => SourceData::Text(text),
        Err(reason) => SourceData::Unavailable(reason),
    }
}

fn fetch_panicked() -> SourceData {
    SourceData::Unavailable(SourceUnavailable::Fetch(
        "fetch thread panicked".to_string(),
    ))
}
