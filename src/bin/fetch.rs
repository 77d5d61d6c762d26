use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use env_logger::Env;
use log::debug;
use rankflame::fetch::{self, parse_rank_address, CancelToken, HttpFetcher, Options, SourceConfig};
use rankflame::merge::{self, SourceData};
use rankflame::Error;

#[derive(Debug, Parser)]
#[clap(
    name = "rankflame-fetch",
    about = "Fetch one folded stack dump per rank",
    after_help = "\
The source configuration lists one rank per line as `RANK ADDRESS`, where ADDRESS is host:port \
or a full http:// URL. Lines starting with # are ignored. A configuration that starts with `{` is \
read as a JSON object such as {\"rank0\": \"10.0.0.1:9090\"} instead. More ranks can be given \
with -r, and no rank may be given twice. Every dump that could be fetched is written to \
DIR/rank-RANK.folded."
)]
struct Opt {
    // ************* //
    // *** FLAGS *** //
    // ************* //
    /// With --merged, append the rank to every frame, as in `main [rank 3]`
    #[clap(long = "tag-ranks")]
    tag_ranks: bool,

    /// With --merged, rename every frame to `frame@PRESENT|MISSING`, listing which ranks reached it
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
    /// Directory to write the per-rank dumps to
    #[clap(short = 'o', long = "output-dir", default_value = ".", value_name = "DIR")]
    output_dir: PathBuf,

    /// Also merge the fetched dumps and write the result here
    #[clap(long = "merged", value_name = "PATH")]
    merged: Option<PathBuf>,

    /// Seconds to wait for any one rank
    #[clap(short = 't', long = "timeout", default_value_t = 10.0, value_name = "SECONDS")]
    timeout: f64,

    /// Number of ranks to fetch at the same time
    #[clap(short = 'j', long = "concurrency", default_value_t = 16, value_name = "UINT")]
    concurrency: usize,

    /// Fetch this rank too; may be given more than once
    #[clap(
        short = 'r',
        long = "rank",
        value_name = "RANK:ADDRESS",
        value_parser = parse_rank
    )]
    ranks: Vec<(usize, String)>,

    /// HTTP path the dumps are served under
    #[clap(long = "path", default_value = "/stacks", value_name = "PATH")]
    path: String,

    // ************ //
    // *** ARGS *** //
    // ************ //
    /// Source configuration file
    #[clap(value_name = "CONFIG")]
    config: Option<PathBuf>,
}

fn parse_rank(s: &str) -> Result<(usize, String), String> {
    parse_rank_address(s).map_err(|e| e.to_string())
}

struct Parts {
    config: SourceConfig,
    output_dir: PathBuf,
    merged: Option<PathBuf>,
    options: Options,
    merge_options: merge::Options,
}

impl Opt {
    fn into_parts(self) -> Result<Parts, Error> {
        if !(self.timeout > 0.0) || !self.timeout.is_finite() {
            return Err(Error::Config(format!("invalid timeout: {}", self.timeout)));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }

        let config = match self.config {
            Some(path) => SourceConfig::from_file(path)?,
            None if self.ranks.is_empty() => {
                return Err(Error::Config(
                    "no sources given: pass a CONFIG file or --rank".to_string(),
                ))
            }
            None => SourceConfig::default(),
        };
        let config = config.with_entries(self.ranks)?;

        Ok(Parts {
            config,
            output_dir: self.output_dir,
            merged: self.merged,
            options: Options {
                timeout: Duration::from_secs_f64(self.timeout),
                concurrency: self.concurrency,
                path: self.path,
            },
            merge_options: merge::Options {
                tag_provenance: self.tag_ranks,
                annotate_ranks: self.annotate_ranks,
                ..Default::default()
            },
        })
    }
}

fn run(opt: Opt) -> Result<(), Error> {
    let quiet = opt.quiet;
    let Parts {
        config,
        output_dir,
        merged,
        options,
        merge_options,
    } = opt.into_parts()?;

    if config.is_empty() {
        return Err(Error::Config("no ranks configured".to_string()));
    }
    fs::create_dir_all(&output_dir)?;

    let fetcher = HttpFetcher::new(options.path.as_str())
        .map_err(|e| Error::Config(format!("cannot set up HTTP client: {}", e)))?;
    let (sources, report) =
        fetch::fetch_all(&config, Arc::new(fetcher), &options, &CancelToken::new());

    for source in &sources {
        match source.data {
            SourceData::Text(ref text) => {
                let path = output_dir.join(format!("rank-{}.folded", source.provenance.rank));
                fs::write(&path, text)?;
                debug!("Wrote {}", path.display());
            }
            SourceData::Unavailable(ref reason) if !quiet => {
                eprintln!("{}: {}", source.provenance, reason);
            }
            SourceData::Unavailable(_) => {}
        }
    }
    if !quiet {
        eprintln!("{}", report);
    }
    if report.fetched == 0 {
        return Err(Error::NoStacks);
    }

    if let Some(path) = merged {
        let (aggregate, report) = merge::merge(sources, &merge_options);
        if !quiet {
            eprintln!("{}", report);
        }
        if aggregate.is_empty() {
            return Err(Error::NoStacks);
        }
        aggregate.write_to(io::BufWriter::new(File::create(path)?))?;
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
