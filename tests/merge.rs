use std::fs::{self, File};
use std::io::{BufRead, BufReader, Cursor};

use log::Level;
use pretty_assertions::assert_eq;
use rand::prelude::*;
use rand::rngs::SmallRng;
use rankflame::folded::{Aggregate, LineCounts};
use rankflame::merge::{self, Options, Provenance, Source, SourceStatus, SourceUnavailable};

const RANKS: &[&str] = &[
    "./tests/data/ranks/rank-0.folded",
    "./tests/data/ranks/rank-1.folded",
    "./tests/data/ranks/rank-2.folded",
];

fn options(nthreads: usize) -> Options {
    Options {
        nthreads,
        ..Default::default()
    }
}

fn read_source(rank: usize, path: &str) -> Source {
    Source::text(Provenance::new(rank, path), fs::read_to_string(path).unwrap())
}

fn rank_sources() -> Vec<Source> {
    RANKS
        .iter()
        .enumerate()
        .map(|(rank, path)| read_source(rank, path))
        .collect()
}

fn generated_sources(rng: &mut SmallRng, nsources: usize) -> Vec<Source> {
    const FRAMES: &[&str] = &["main", "run", "step", "allreduce", "wait", "compute", "io"];
    (0..nsources)
        .map(|rank| {
            let mut text = String::new();
            for _ in 0..rng.gen_range(1..40) {
                let depth = rng.gen_range(1..6);
                let stack: Vec<&str> = (0..depth)
                    .map(|_| *FRAMES.choose(rng).unwrap())
                    .collect();
                text.push_str(&format!("{} {}\n", stack.join(";"), rng.gen_range(1..1000)));
            }
            Source::text(Provenance::rank(rank), text)
        })
        .collect()
}

fn clone_sources(sources: &[Source]) -> Vec<Source> {
    sources
        .iter()
        .map(|source| match source.data {
            merge::SourceData::Text(ref text) => {
                Source::text(source.provenance.clone(), text.clone())
            }
            merge::SourceData::Unavailable(_) => {
                Source::unavailable(source.provenance.clone(), SourceUnavailable::Cancelled)
            }
        })
        .collect()
}

fn compare_with_file(aggregate: &Aggregate, expected_file: &str) {
    let mut result = Cursor::new(Vec::new());
    aggregate.write_to(&mut result).unwrap();

    result.set_position(0);
    let mut expected = BufReader::new(File::open(expected_file).unwrap());
    let mut buf = String::new();
    let mut line_num = 1;
    for line in result.lines() {
        if expected.read_line(&mut buf).unwrap() == 0 {
            panic!(
                "\noutput has more lines than expected result file: {}",
                expected_file
            );
        }
        assert_eq!(line.unwrap(), buf.trim_end(), "\n{}:{}", expected_file, line_num);
        buf.clear();
        line_num += 1;
    }

    if expected.read_line(&mut buf).unwrap() > 0 {
        panic!(
            "\n{} has more lines than output, beginning at line: {}",
            expected_file, line_num
        )
    }
}

#[test]
fn merge_rank_files() {
    for &nthreads in &[1, 2, 3] {
        let (aggregate, report) = merge::merge(rank_sources(), &options(nthreads));
        compare_with_file(&aggregate, "./tests/data/merged/ranks.folded");

        assert_eq!(report.succeeded(), 3);
        assert_eq!(report.failed(), 0);
        assert_eq!(
            report.lines(),
            LineCounts {
                accepted: 7,
                rejected: 2
            }
        );
    }
}

#[test]
fn merge_rank_files_annotated() {
    for &nthreads in &[1, 3] {
        let opt = Options {
            annotate_ranks: true,
            ..options(nthreads)
        };
        let (aggregate, _) = merge::merge(rank_sources(), &opt);
        compare_with_file(&aggregate, "./tests/data/merged/ranks-annotated.folded");
    }

    // a rank that failed outright is still listed as missing
    let mut sources = rank_sources();
    sources.push(Source::unavailable(
        Provenance::new(3, "10.0.0.4:9090"),
        SourceUnavailable::Timeout(std::time::Duration::from_secs(10)),
    ));
    let opt = Options {
        annotate_ranks: true,
        ..options(1)
    };
    let (aggregate, _) = merge::merge(sources, &opt);
    assert_eq!(aggregate.get("main@0-2|3;init@2|0-1/3"), Some(3));
    assert_eq!(aggregate.total(), 17);
}

#[test]
fn merge_is_order_independent() {
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let sources = generated_sources(&mut rng, 12);
    let (expected, _) = merge::merge(clone_sources(&sources), &options(1));

    for &nthreads in &[1, 2, 4, 8] {
        let mut shuffled = clone_sources(&sources);
        shuffled.shuffle(&mut rng);
        let (aggregate, report) = merge::merge(shuffled, &options(nthreads));
        assert_eq!(aggregate, expected, "nthreads = {}", nthreads);
        assert_eq!(report.succeeded(), 12);
    }
}

#[test]
fn merge_of_merged_outputs_is_the_same() {
    let mut rng = SmallRng::seed_from_u64(42);
    let sources = generated_sources(&mut rng, 9);
    let (all, _) = merge::merge(clone_sources(&sources), &options(2));

    // merge the first five, write that out, and merge it with the rest
    let mut sources = clone_sources(&sources);
    let rest = sources.split_off(5);
    let (partial, _) = merge::merge(sources, &options(2));
    let mut merged_text = Vec::new();
    partial.write_to(&mut merged_text).unwrap();

    let mut staged = vec![Source::text(
        Provenance::new(0, "partial.folded"),
        String::from_utf8(merged_text).unwrap(),
    )];
    staged.extend(rest);
    let (aggregate, _) = merge::merge(staged, &options(2));
    assert_eq!(aggregate, all);
}

#[test]
fn merging_with_itself_doubles_counts() {
    let mut rng = SmallRng::seed_from_u64(7);
    let sources = generated_sources(&mut rng, 1);
    let (once, _) = merge::merge(clone_sources(&sources), &options(1));

    let mut twice = clone_sources(&sources);
    twice.extend(clone_sources(&sources));
    let (doubled, _) = merge::merge(twice, &options(2));

    assert_eq!(doubled.len(), once.len());
    for (stack, count) in once.iter() {
        assert_eq!(doubled.get(stack.as_str()), Some(2 * count));
    }
}

#[test]
fn merge_conserves_samples() {
    let mut rng = SmallRng::seed_from_u64(1234);
    let sources = generated_sources(&mut rng, 6);
    let expected: u64 = sources
        .iter()
        .map(|source| match source.data {
            merge::SourceData::Text(ref text) => text
                .lines()
                .map(|line| line.rsplit(' ').next().unwrap().parse::<u64>().unwrap())
                .sum::<u64>(),
            merge::SourceData::Unavailable(_) => 0,
        })
        .sum();

    let (aggregate, _) = merge::merge(sources, &options(3));
    assert_eq!(aggregate.total(), expected);

    let tagged = Options {
        tag_provenance: true,
        ..options(3)
    };
    let sources = generated_sources(&mut SmallRng::seed_from_u64(1234), 6);
    let (aggregate, _) = merge::merge(sources, &tagged);
    assert_eq!(aggregate.total(), expected);
}

#[test]
fn merge_survives_broken_sources() {
    let mut sources = rank_sources();
    sources.push(Source::unavailable(
        Provenance::new(3, "10.0.0.4:9090"),
        SourceUnavailable::Fetch("connection refused".to_string()),
    ));
    sources.push(read_source(4, "./tests/data/empty.folded"));
    sources.push(Source::text(Provenance::rank(5), "garbage\nmore garbage\n"));

    let (aggregate, report) = merge::merge(sources, &options(2));
    compare_with_file(&aggregate, "./tests/data/merged/ranks.folded");

    assert_eq!(report.sources().len(), 6);
    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.failed(), 3);
    let failed: Vec<usize> = report.failures().map(|o| o.provenance.rank).collect();
    assert_eq!(failed, vec![3, 4, 5]);
    assert!(matches!(
        report.sources()[4].status,
        SourceStatus::Unavailable(SourceUnavailable::Empty)
    ));
    assert!(matches!(
        report.sources()[5].status,
        SourceStatus::Merged(LineCounts {
            accepted: 0,
            rejected: 2
        })
    ));
    assert_eq!(
        report.to_string(),
        "merged 3 of 6 sources (3 failed); 7 lines accepted, 4 rejected"
    );
}

#[test]
fn merge_nothing() {
    let (aggregate, report) = merge::merge(Vec::new(), &options(4));
    assert!(aggregate.is_empty());
    assert_eq!(report.sources().len(), 0);
}

#[test]
fn merge_logs_rejected_lines() {
    testing_logger::setup();
    let sources = vec![read_source(2, RANKS[2])];
    let _ = merge::merge(sources, &options(1));
    testing_logger::validate(|captured_logs| {
        let warnings: Vec<&str> = captured_logs
            .iter()
            .filter(|log| log.level == Level::Warn)
            .map(|log| log.body.as_str())
            .collect();
        assert_eq!(
            warnings,
            vec![
                "Ignoring line 1 of rank 2 (./tests/data/ranks/rank-2.folded): \
                 invalid sample count `oops`",
                "Ignoring line 3 of rank 2 (./tests/data/ranks/rank-2.folded): \
                 invalid sample count `count`",
            ]
        );
    });
}

#[test]
fn merge_logs_unavailable_sources() {
    testing_logger::setup();
    let sources = vec![Source::unavailable(Provenance::rank(9), SourceUnavailable::Cancelled)];
    let _ = merge::merge(sources, &options(1));
    testing_logger::validate(|captured_logs| {
        let warnings: Vec<&str> = captured_logs
            .iter()
            .filter(|log| log.level == Level::Warn)
            .map(|log| log.body.as_str())
            .collect();
        assert_eq!(warnings, vec!["Skipping rank 9: cancelled"]);
    });
}
