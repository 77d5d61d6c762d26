use std::fs;
use std::io::{self, prelude::*};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use env_logger::Env;
use is_terminal::IsTerminal;
use rankflame::flamegraph::{self, defaults, Direction, Options, Palette, RootPolicy};
use rankflame::Error;

#[derive(Debug, Parser)]
#[clap(
    name = "rankflame-render",
    about = "Render a merged folded stack file as a flame graph SVG"
)]
struct Opt {
    // ************* //
    // *** FLAGS *** //
    // ************* //
    /// Plot the flame graph upside-down, as an icicle graph
    #[clap(short = 'i', long = "inverted")]
    inverted: bool,

    /// Silence all log output and the summary
    #[clap(short = 'q', long = "quiet")]
    quiet: bool,

    /// Verbose logging mode (-v, -vv, -vvv)
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    // *************** //
    // *** OPTIONS *** //
    // *************** //
    /// Set color palette
    #[clap(
        short = 'c',
        long = "colors",
        default_value = defaults::COLORS,
        value_parser = ["hot", "mem", "io", "red", "green", "blue", "aqua", "yellow", "purple", "orange"],
        value_name = "PALETTE"
    )]
    colors: String,

    /// Whether to draw the synthetic "all" frame (all) or start at the outermost frames (first)
    #[clap(
        long = "root",
        default_value = "all",
        value_parser = ["all", "first"],
        value_name = "POLICY"
    )]
    root: String,

    /// Change title text
    #[clap(long = "title", default_value = defaults::TITLE, value_name = "STRING")]
    title: String,

    /// Count type label
    #[clap(long = "countname", default_value = defaults::COUNT_NAME, value_name = "STRING")]
    count_name: String,

    /// Width of image
    #[clap(long = "width", default_value_t = defaults::IMAGE_WIDTH, value_name = "UINT")]
    image_width: usize,

    /// Height of each frame
    #[clap(long = "height", default_value_t = defaults::FRAME_HEIGHT, value_name = "UINT")]
    frame_height: usize,

    /// Font size
    #[clap(long = "fontsize", default_value_t = defaults::FONT_SIZE, value_name = "UINT")]
    font_size: usize,

    /// Font width
    #[clap(long = "fontwidth", default_value_t = defaults::FONT_WIDTH, value_name = "FLOAT")]
    font_width: f64,

    /// Omit smaller functions (default 0.1 pixels)
    #[clap(long = "minwidth", default_value_t = defaults::MIN_WIDTH, value_name = "FLOAT")]
    min_width: f64,

    /// Write the SVG here instead of STDOUT
    #[clap(short = 'o', long = "output", value_name = "PATH")]
    output: Option<PathBuf>,

    // ************ //
    // *** ARGS *** //
    // ************ //
    /// Merged folded stack file, or STDIN if not specified
    #[clap(value_name = "PATH")]
    infile: Option<PathBuf>,
}

impl Opt {
    fn into_parts(self) -> Result<(Option<PathBuf>, Option<PathBuf>, Options), Error> {
        let colors: Palette = self.colors.parse().map_err(Error::Config)?;
        let root: RootPolicy = self.root.parse().map_err(Error::Config)?;
        let options = Options {
            title: self.title,
            count_name: self.count_name,
            colors,
            direction: if self.inverted {
                Direction::Inverted
            } else {
                Direction::Straight
            },
            root,
            image_width: self.image_width,
            frame_height: self.frame_height,
            font_size: self.font_size,
            font_width: self.font_width,
            min_width: self.min_width,
            ..Default::default()
        };
        Ok((self.infile, self.output, options))
    }
}

fn run(opt: Opt) -> Result<(), Error> {
    let quiet = opt.quiet;
    let (infile, output, options) = opt.into_parts()?;

    if let Some(ref path) = infile {
        if !path.is_file() {
            return Err(Error::Config(format!("no such file: {}", path.display())));
        }
    } else if io::stdin().is_terminal() {
        eprintln!("Reading folded stacks from STDIN...");
    }

    // nothing is written unless the whole image could be drawn
    let mut svg = Vec::new();
    let report = flamegraph::from_file(&options, infile.as_ref(), &mut svg)?;
    if !quiet {
        eprintln!("{}", report);
    }

    match output {
        Some(path) => fs::write(path, svg)?,
        None => {
            let stdout = io::stdout();
            let mut stdout = stdout.lock();
            stdout.write_all(&svg)?;
            stdout.flush()?;
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
