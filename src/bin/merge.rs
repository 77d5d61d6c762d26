use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use env_logger::Env;
use is_terminal::IsTerminal;
use rankflame::merge::{
    self, Options, Provenance, Source, SourceStatus, SourceUnavailable, DEFAULT_NTHREADS,
};
use rankflame::Error;

#[derive(Debug, Parser)]
#[clap(
    name = "rankflame-merge",
    about = "Merge per-rank folded stack dumps into one folded stack file",
    after_help = "\
Files named rank-N.folded (or anything with a rank-N stem) are attributed to rank N. Other \
files are numbered by their position on the command line, and no rank may be given twice. With \
no files, a single dump is read from STDIN as rank 0."
)]
struct Opt {
    // ************* //
    // *** FLAGS *** //
    // ************* //
    /// Append the rank to every frame, as in `main [rank 3]`, so ranks stay apart in the graph
    #[clap(long = "tag-ranks")]
    tag_ranks: bool,

    /// Rename every frame to `frame@PRESENT|MISSING`, listing which ranks reached it
    #[clap(long = "annotate-ranks")]
    annotate_ranks: bool,

    /// Silence all log output and the summary
    #[clap(short = 'q', long = "quiet")]
    quiet: bool,

    /// Verbose logging mode (-v, -vv, -vvv)
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    // *************** //
    // *** OPTIONS *** //
    // *************** //
    /// Number of threads to use
    #[clap(
        short = 'n',
        long = "nthreads",
        default_value = &**NTHREADS,
        value_name = "UINT"
    )]
    nthreads: usize,

    /// Write the merged stacks here instead of STDOUT
    #[clap(short = 'o', long = "output", value_name = "PATH")]
    output: Option<PathBuf>,

    // ************ //
    // *** ARGS *** //
    // ************ //
    /// Folded stack dumps, one per rank
    #[clap(value_name = "PATH")]
    infiles: Vec<PathBuf>,
}

impl Opt {
    fn into_parts(self) -> (Vec<PathBuf>, Option<PathBuf>, Options) {
        let options = Options {
            tag_provenance: self.tag_ranks,
            annotate_ranks: self.annotate_ranks,
            nthreads: self.nthreads,
        };
        (self.infiles, self.output, options)
    }
}

static NTHREADS: once_cell::sync::Lazy<String> =
    once_cell::sync::Lazy::new(|| DEFAULT_NTHREADS.to_string());

/// The rank a dump file belongs to: `N` for a `rank-N` stem, its position otherwise.
fn rank_of(path: &Path, position: usize) -> usize {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.strip_prefix("rank-"))
        .and_then(|rank| rank.parse().ok())
        .unwrap_or(position)
}

/// The rank of every dump file, in order. Two files may not claim the same rank.
fn assign_ranks(infiles: &[PathBuf]) -> Result<Vec<usize>, Error> {
    let mut seen: HashMap<usize, &Path> = HashMap::with_capacity(infiles.len());
    let mut ranks = Vec::with_capacity(infiles.len());
    for (i, path) in infiles.iter().enumerate() {
        let rank = rank_of(path, i);
        if let Some(other) = seen.insert(rank, path) {
            return Err(Error::Config(format!(
                "rank {} is given by both {} and {}",
                rank,
                other.display(),
                path.display()
            )));
        }
        ranks.push(rank);
    }
    Ok(ranks)
}

fn read_sources(infiles: &[PathBuf]) -> Result<Vec<Source>, Error> {
    if infiles.is_empty() {
        let stdin = io::stdin();
        if stdin.is_terminal() {
            eprintln!("Reading folded stacks from STDIN...");
        }
        let mut bytes = Vec::new();
        let provenance = Provenance::new(0, "<stdin>");
        let source = match stdin.lock().read_to_end(&mut bytes) {
            Ok(_) => Source::bytes(provenance, bytes),
            Err(e) => Source::unavailable(provenance, SourceUnavailable::Io(e)),
        };
        return Ok(vec![source]);
    }

    // a mistyped path is a usage error, not a failed rank
    for path in infiles {
        if !path.is_file() {
            return Err(Error::Config(format!("no such file: {}", path.display())));
        }
    }

    let ranks = assign_ranks(infiles)?;
    Ok(infiles
        .iter()
        .zip(ranks)
        .map(|(path, rank)| {
            let provenance = Provenance::new(rank, path.display().to_string());
            match fs::read(path) {
                Ok(bytes) => Source::bytes(provenance, bytes),
                Err(e) => Source::unavailable(provenance, SourceUnavailable::Io(e)),
            }
        })
        .collect())
}

fn run(opt: Opt) -> Result<(), Error> {
    let quiet = opt.quiet;
    let (infiles, output, options) = opt.into_parts();

    let sources = read_sources(&infiles)?;
    let (aggregate, report) = merge::merge(sources, &options);

    if !quiet {
        for failure in report.failures() {
            match failure.status {
                SourceStatus::Unavailable(ref reason) => {
                    eprintln!("{}: {}", failure.provenance, reason)
                }
                SourceStatus::Merged(lines) => eprintln!(
                    "{}: no valid lines ({} rejected)",
                    failure.provenance, lines.rejected
                ),
            }
        }
        eprintln!("{}", report);
    }
    if aggregate.is_empty() {
        return Err(Error::NoStacks);
    }

    match output {
        Some(path) => {
            let file = io::BufWriter::new(File::create(path)?);
            aggregate.write_to(file)?;
        }
        None => {
            let stdout = io::stdout();
            aggregate.write_to(stdout.lock())?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let opt = Opt::parse();

    // Initialize logger
    if !opt.quiet {
        env_logger::Builder::from_env(Env::default().default_filter_or(match opt.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }))
        .format_timestamp(None)
        .init();
    }

    match run(opt) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
