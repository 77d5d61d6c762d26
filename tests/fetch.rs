#![cfg(feature = "multithreaded")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use maplit::btreemap;
use pretty_assertions::assert_eq;
use rankflame::fetch::{self, CancelToken, FetchReport, Options, SourceConfig};
use rankflame::merge::{self, Provenance, SourceData, SourceUnavailable};

fn config(nranks: usize) -> SourceConfig {
    SourceConfig::new((0..nranks).map(|rank| (rank, format!("10.0.0.{}:9090", rank + 1)))).unwrap()
}

fn options(timeout: Duration, concurrency: usize) -> Options {
    Options {
        timeout,
        concurrency,
        ..Default::default()
    }
}

fn dump(provenance: &Provenance) -> String {
    format!("main;rank{} {}\nmain {}\n", provenance.rank, provenance.rank + 1, 1)
}

#[test]
fn fetch_every_rank() {
    let fetcher = Arc::new(|p: &Provenance, _: Duration| -> Result<String, SourceUnavailable> {
        Ok(dump(p))
    });
    let (sources, report) = fetch::fetch_all(
        &config(5),
        fetcher,
        &options(Duration::from_secs(5), 2),
        &CancelToken::new(),
    );

    assert_eq!(
        report,
        FetchReport {
            fetched: 5,
            ..Default::default()
        }
    );
    let ranks: Vec<usize> = sources.iter().map(|s| s.provenance.rank).collect();
    assert_eq!(ranks, vec![0, 1, 2, 3, 4]);
    assert_eq!(
        sources[3].provenance.origin.as_deref(),
        Some("10.0.0.4:9090")
    );

    let (aggregate, merge_report) = merge::merge(sources, &merge::Options::default());
    assert_eq!(merge_report.succeeded(), 5);
    assert_eq!(aggregate.get("main"), Some(5));
    assert_eq!(aggregate.get("main;rank4"), Some(5));
    assert_eq!(aggregate.total(), 20);
}

#[test]
fn fetch_failures_are_per_rank() {
    let fetcher = Arc::new(|p: &Provenance, _: Duration| -> Result<String, SourceUnavailable> {
        match p.rank {
            1 => Err(SourceUnavailable::Fetch("connection refused".to_string())),
            2 => {
                // never answers in time
                thread::sleep(Duration::from_secs(2));
                Ok(dump(p))
            }
            _ => Ok(dump(p)),
        }
    });

    let start = Instant::now();
    let (sources, report) = fetch::fetch_all(
        &config(4),
        fetcher,
        &options(Duration::from_millis(200), 4),
        &CancelToken::new(),
    );
    assert!(start.elapsed() < Duration::from_secs(2));

    assert_eq!(
        report,
        FetchReport {
            fetched: 2,
            timed_out: 1,
            cancelled: 0,
            failed: 1,
        }
    );
    assert_eq!(report.to_string(), "fetched 2 of 4 sources (1 timed out, 0 cancelled, 1 failed)");

    let outcomes: std::collections::BTreeMap<usize, &'static str> = sources
        .iter()
        .map(|s| {
            let outcome = match s.data {
                SourceData::Text(_) => "text",
                SourceData::Unavailable(SourceUnavailable::Timeout(_)) => "timeout",
                SourceData::Unavailable(SourceUnavailable::Fetch(_)) => "fetch",
                SourceData::Unavailable(_) => "other",
            };
            (s.provenance.rank, outcome)
        })
        .collect();
    assert_eq!(
        outcomes,
        btreemap! {
            0 => "text",
            1 => "fetch",
            2 => "timeout",
            3 => "text",
        }
    );

    // the merge still goes ahead with what arrived
    let (aggregate, merge_report) = merge::merge(sources, &merge::Options::default());
    assert_eq!(merge_report.succeeded(), 2);
    assert_eq!(merge_report.failed(), 2);
    assert_eq!(aggregate.get("main"), Some(2));
}

#[test]
fn fetch_concurrency_is_bounded() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let fetcher = {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        Arc::new(move |p: &Provenance, _: Duration| -> Result<String, SourceUnavailable> {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(dump(p))
        })
    };

    let (sources, report) = fetch::fetch_all(
        &config(24),
        fetcher,
        &options(Duration::from_secs(5), 3),
        &CancelToken::new(),
    );
    assert_eq!(sources.len(), 24);
    assert_eq!(report.fetched, 24);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[test]
fn fetch_cancelled_up_front() {
    let fetcher = Arc::new(|_: &Provenance, _: Duration| -> Result<String, SourceUnavailable> {
        panic!("no fetch should start once cancelled")
    });
    let cancel = CancelToken::new();
    cancel.cancel();

    let (sources, report) = fetch::fetch_all(
        &config(3),
        fetcher,
        &options(Duration::from_secs(1), 2),
        &cancel,
    );
    assert_eq!(
        report,
        FetchReport {
            cancelled: 3,
            ..Default::default()
        }
    );
    assert!(sources
        .iter()
        .all(|s| matches!(s.data, SourceData::Unavailable(SourceUnavailable::Cancelled))));
}

#[test]
fn fetch_cancelled_midway() {
    let cancel = CancelToken::new();
    let fetcher = {
        let cancel = cancel.clone();
        Arc::new(move |p: &Provenance, _: Duration| -> Result<String, SourceUnavailable> {
            if p.rank == 1 {
                cancel.cancel();
            }
            Ok(dump(p))
        })
    };

    let (sources, report) = fetch::fetch_all(
        &config(6),
        fetcher,
        &options(Duration::from_secs(5), 1),
        &cancel,
    );
    assert_eq!(sources.len(), 6);
    assert_eq!(report.total(), 6);

    // with a single worker, rank 0 finished before anyone cancelled
    match sources[0].data {
        SourceData::Text(ref text) => assert_eq!(text, &dump(&sources[0].provenance)),
        ref other => panic!("rank 0 should have been fetched, got {:?}", other),
    }
    // rank 1 raced its own cancellation; nothing after it was started
    assert!(sources[2..]
        .iter()
        .all(|s| matches!(s.data, SourceData::Unavailable(SourceUnavailable::Cancelled))));
    assert!(report.fetched >= 1);
    assert!(report.cancelled >= 4);
    assert_eq!(report.fetched + report.cancelled, 6);
}

#[test]
fn fetch_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ranks.txt");
    std::fs::write(&path, "# two ranks\n1 node-b:9090\n0 node-a:9090\n").unwrap();

    let config = SourceConfig::from_file(&path).unwrap();
    assert_eq!(
        config.iter().collect::<Vec<_>>(),
        vec![
            Provenance::new(0, "node-a:9090"),
            Provenance::new(1, "node-b:9090"),
        ]
    );

    assert!(SourceConfig::from_file(dir.path().join("missing.txt")).is_err());

    let path = dir.path().join("ranks.json");
    std::fs::write(&path, "{\n  \"rank1\": \"node-b:9090\",\n  \"rank0\": \"node-a:9090\"\n}\n").unwrap();
    assert_eq!(SourceConfig::from_file(&path).unwrap(), config);
}
