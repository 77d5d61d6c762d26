mod color;
mod layout;
mod svg;
mod tree;

pub use color::{color_for, Palette};
pub use layout::{layout, Rect, RootPolicy};
pub use tree::{BuildError, CallTree, Node, NodeId};

use std::fmt;
use std::fs::File;
use std::io::{self, prelude::*};
use std::path::Path;

use num_format::{Buffer, Locale};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use str_stack::StrStack;
use thiserror::Error;

use crate::folded::{Aggregate, LineCounts};

const XPAD: usize = 10; // pad left and right
const FRAMEPAD: usize = 1; // vertical padding for frames
const READER_CAPACITY: usize = 128 * 1024;

/// Default values for [`Options`].
pub mod defaults {
    /// The title of the graph.
    pub const TITLE: &str = "Flame Graph";
    /// What the counts are counting.
    pub const COUNT_NAME: &str = "samples";
    /// The default palette, by name.
    pub const COLORS: &str = "hot";
    /// The width of the image, in pixels.
    pub const IMAGE_WIDTH: usize = 1200;
    /// The height of each row of frames, in pixels.
    pub const FRAME_HEIGHT: usize = 16;
    /// The base text size.
    pub const FONT_SIZE: usize = 12;
    /// The average character width relative to the font size.
    pub const FONT_WIDTH: f64 = 0.59;
    /// Frames narrower than this many pixels are not drawn.
    pub const MIN_WIDTH: f64 = 0.1;
    /// Labels are omitted rather than cut down to fewer characters than this.
    pub const MIN_LABEL_CHARS: usize = 3;
}

/// Configure the flame graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    /// The title shown at the top of the image.
    ///
    /// Default is "Flame Graph".
    pub title: String,

    /// What the counts are counting, as shown in the tooltips.
    ///
    /// Default is "samples".
    pub count_name: String,

    /// The palette frames are colored from.
    ///
    /// Default is [`Palette::Hot`].
    pub colors: Palette,

    /// Whether the graph grows upwards (a flame graph) or downwards (an icicle graph).
    ///
    /// Default is [`Direction::Straight`].
    pub direction: Direction,

    /// Whether the synthetic "all" frame is drawn.
    ///
    /// Default is [`RootPolicy::Synthetic`].
    pub root: RootPolicy,

    /// The width of the image, in pixels.
    ///
    /// Default is 1200.
    pub image_width: usize,

    /// The height of each row of frames, in pixels.
    ///
    /// Default is 16.
    pub frame_height: usize,

    /// The font size of the labels, in pixels.
    ///
    /// Default is 12.
    pub font_size: usize,

    /// The average width of a character relative to the font size.
    ///
    /// Default is 0.59.
    pub font_width: f64,

    /// Frames narrower than this many pixels are left out of the image.
    ///
    /// Default is 0.1.
    pub min_width: f64,

    /// The fewest characters of a name worth showing.
    ///
    /// A name that does not fit its frame is cut short and marked with `..`, unless fewer than
    /// this many characters would remain, in which case the frame gets no label at all.
    ///
    /// Default is 3.
    pub min_label_chars: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            title: defaults::TITLE.to_string(),
            count_name: defaults::COUNT_NAME.to_string(),
            colors: Palette::default(),
            direction: Direction::default(),
            root: RootPolicy::default(),
            image_width: defaults::IMAGE_WIDTH,
            frame_height: defaults::FRAME_HEIGHT,
            font_size: defaults::FONT_SIZE,
            font_width: defaults::FONT_WIDTH,
            min_width: defaults::MIN_WIDTH,
            min_label_chars: defaults::MIN_LABEL_CHARS,
        }
    }
}

impl Options {
    fn validate(&self) -> Result<(), RenderError> {
        if self.image_width <= 2 * XPAD {
            return Err(RenderError::InvalidOptions(format!(
                "image width must be more than {} pixels",
                2 * XPAD
            )));
        }
        if self.frame_height <= FRAMEPAD {
            return Err(RenderError::InvalidOptions(format!(
                "frame height must be more than {} pixel",
                FRAMEPAD
            )));
        }
        if self.font_size == 0 || !(self.font_width > 0.0) {
            return Err(RenderError::InvalidOptions(
                "font size and width must be positive".to_string(),
            ));
        }
        if !(self.min_width >= 0.0) {
            return Err(RenderError::InvalidOptions(
                "minimum frame width must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which way the graph grows.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    /// Callers at the bottom, callees stacked on top of them.
    Straight,
    /// Callers at the top, callees hanging below them.
    Inverted,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Straight
    }
}

/// Why a flame graph could not be drawn.
#[derive(Debug, Error)]
pub enum RenderError {
    /// There were no stacks to draw.
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Layout did not produce a single frame to draw.
    #[error("nothing to draw")]
    EmptyLayout,

    /// The options cannot produce a sensible image.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Writing the SVG failed.
    #[error("failed to write SVG: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Reading the input failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What went into a rendered flame graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderReport {
    /// Lines of input read, when rendering from folded text.
    pub lines: LineCounts,
    /// The total number of samples.
    pub samples: u64,
    /// Frames drawn.
    pub frames: usize,
    /// Frames too narrow to be drawn.
    pub pruned: usize,
}

impl fmt::Display for RenderReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rendered {} frames ({} too narrow to draw) from {} samples; \
             {} lines accepted, {} rejected",
            self.frames, self.pruned, self.samples, self.lines.accepted, self.lines.rejected
        )
    }
}

macro_rules! args {
    ($($key:expr => $value:expr),*) => {{
        [$(($key, $value),)*]
    }};
}

/// Produce a flame graph from an aggregate.
///
/// Fails without writing anything if the aggregate is empty.
pub fn from_aggregate<W>(
    opt: &Options,
    aggregate: &Aggregate,
    writer: W,
) -> Result<RenderReport, RenderError>
where
    W: Write,
{
    opt.validate()?;
    let tree = CallTree::from_aggregate(aggregate)?;
    let rects = layout(&tree, opt.root);
    if rects.is_empty() {
        return Err(RenderError::EmptyLayout);
    }
    render(opt, &tree, &rects, writer)
}

/// Produce a flame graph from folded stack lines, such as a merged file.
///
/// Malformed lines are skipped and counted in the report.
pub fn from_reader<R, W>(opt: &Options, reader: R, writer: W) -> Result<RenderReport, RenderError>
where
    R: BufRead,
    W: Write,
{
    let (aggregate, lines) = Aggregate::from_reader(reader)?;
    if lines.rejected != 0 {
        warn!("Ignored {} lines with invalid format", lines.rejected);
    }
    if aggregate.is_empty() {
        error!("No stack counts found");
    }

    let mut report = from_aggregate(opt, &aggregate, writer)?;
    report.lines = lines;
    Ok(report)
}

/// Produce a flame graph from a folded stack file (or STDIN if `infile` is `None`).
pub fn from_file<P, W>(opt: &Options, infile: Option<P>, writer: W) -> Result<RenderReport, RenderError>
where
    P: AsRef<Path>,
    W: Write,
{
    match infile {
        Some(ref path) => {
            let file = File::open(path)?;
            let reader = io::BufReader::with_capacity(READER_CAPACITY, file);
            from_reader(opt, reader, writer)
        }
        None => {
            let stdio = io::stdin();
            let stdio_guard = stdio.lock();
            let reader = io::BufReader::with_capacity(READER_CAPACITY, stdio_guard);
            from_reader(opt, reader, writer)
        }
    }
}

fn render<W>(
    opt: &Options,
    tree: &CallTree,
    rects: &[Rect],
    writer: W,
) -> Result<RenderReport, RenderError>
where
    W: Write,
{
    let samples = tree.root().total();
    let widthpx = (opt.image_width - 2 * XPAD) as f64;

    // prune blocks that are too narrow
    let mut depthmax = 0;
    let frames: Vec<&Rect> = rects
        .iter()
        .filter(|rect| {
            if rect.width * widthpx < opt.min_width {
                trace!("Pruning {:?}", tree.path(rect.node));
                false
            } else {
                depthmax = std::cmp::max(depthmax, rect.depth);
                true
            }
        })
        .collect();
    if frames.is_empty() {
        return Err(RenderError::EmptyLayout);
    }
    let pruned = rects.len() - frames.len();
    if pruned != 0 {
        debug!("Left out {} frames narrower than {} pixels", pruned, opt.min_width);
    }

    let ypad1 = opt.font_size * 3; // pad top, include title
    let ypad2 = opt.font_size * 2 + 10; // pad bottom
    let imageheight = ((depthmax + 1) * opt.frame_height) + ypad1 + ypad2;

    let mut svg = Writer::new(writer);
    svg::write_header(&mut svg, imageheight, opt)?;
    svg::write_prelude(&mut svg, imageheight, opt)?;
    svg.write_event(Event::Start(
        BytesStart::new("g").with_attributes(args!("id" => "frames")),
    ))?;

    let mut buffer = StrStack::new();
    let mut samples_txt_buffer = Buffer::default();
    let mut self_txt_buffer = Buffer::default();
    for rect in frames {
        let node = tree.node(rect.node);

        let x1 = XPAD as f64 + rect.x * widthpx;
        let width = rect.width * widthpx;
        let y1 = match opt.direction {
            Direction::Straight => {
                imageheight - ypad2 - (rect.depth + 1) * opt.frame_height + FRAMEPAD
            }
            Direction::Inverted => ypad1 + rect.depth * opt.frame_height,
        };
        let height = opt.frame_height - FRAMEPAD;

        // add thousands separators to the counts
        samples_txt_buffer.write_formatted(&node.total(), &Locale::en);
        self_txt_buffer.write_formatted(&node.self_count(), &Locale::en);
        let samples_txt = samples_txt_buffer.as_str();
        let self_txt = self_txt_buffer.as_str();

        let title = if node.is_root() {
            write!(
                buffer,
                "all ({} {}, 100%; self {})",
                samples_txt, opt.count_name, self_txt
            )
        } else {
            let pct = node.total() as f64 * 100.0 / samples as f64;
            write!(
                buffer,
                "{} ({} {}, {:.2}%; self {})",
                node.name(),
                samples_txt,
                opt.count_name,
                pct,
                self_txt
            )
        };
        let path = tree.path(rect.node).join(";");
        let total = write!(buffer, "{}", node.total());
        let self_count = write!(buffer, "{}", node.self_count());
        let x = write!(buffer, "{:.2}", x1);
        let y = write!(buffer, "{}", y1);
        let w = write!(buffer, "{:.2}", width);
        let h = write!(buffer, "{}", height);
        let fill = {
            let c = if node.is_root() {
                color::color_for(opt.colors, "all")
            } else {
                color::color_for(opt.colors, node.name())
            };
            write!(buffer, "rgb({},{},{})", c.r, c.g, c.b)
        };
        let label = label_for(opt, node, width, &mut buffer);

        // the root's path is empty
        svg.write_event(Event::Start(BytesStart::new("g").with_attributes(args!(
            "class" => "func_g",
            "data-path" => path.as_str(),
            "data-total" => &buffer[total],
            "data-self" => &buffer[self_count]
        ))))?;

        svg.write_event(Event::Start(BytesStart::new("title")))?;
        svg.write_event(Event::Text(BytesText::new(&buffer[title])))?;
        svg.write_event(Event::End(BytesEnd::new("title")))?;

        svg.write_event(Event::Empty(BytesStart::new("rect").with_attributes(args!(
            "x" => &buffer[x],
            "y" => &buffer[y],
            "width" => &buffer[w],
            "height" => &buffer[h],
            "fill" => &buffer[fill],
            "rx" => "2",
            "ry" => "2"
        ))))?;

        if let Some(label) = label {
            svg::write_str(
                &mut svg,
                &mut buffer,
                svg::TextItem {
                    x: x1 + 3.0,
                    y: 3.0 + (y1 as f64 + (y1 + height) as f64) / 2.0,
                    text: label.into(),
                    extra: std::iter::empty(),
                },
            )?;
        }

        buffer.clear();
        svg.write_event(Event::End(BytesEnd::new("g")))?;
    }

    svg.write_event(Event::End(BytesEnd::new("g")))?;
    svg.write_event(Event::End(BytesEnd::new("svg")))?;
    svg.into_inner().flush()?;

    let report = RenderReport {
        lines: LineCounts::default(),
        samples,
        frames: rects.len() - pruned,
        pruned,
    };
    info!("{}", report);
    Ok(report)
}

/// The label of a frame `width` pixels wide, written to `buffer`, or `None` if no readable label
/// fits.
fn label_for(opt: &Options, node: &Node, width: f64, buffer: &mut StrStack) -> Option<usize> {
    let fitchars = (width / (opt.font_size as f64 * opt.font_width)).trunc() as usize;
    let name = if node.is_root() { "all" } else { node.name() };

    let nchars = name.chars().count();
    if nchars < fitchars {
        Some(buffer.push(name))
    } else if fitchars >= opt.min_label_chars + 2 {
        // need to truncate :'(
        use std::fmt::Write;
        let mut w = buffer.writer();
        for c in name.chars().take(fitchars - 2) {
            w.write_char(c).ok()?;
        }
        w.write_str("..").ok()?;
        Some(w.finish())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folded::parse_line;

    fn example() -> Aggregate {
        ["main;foo;bar 7", "main;foo;baz 3", "main;qux 4"]
            .iter()
            .map(|l| parse_line(l).unwrap())
            .collect()
    }

    fn render_to_string(opt: &Options, aggregate: &Aggregate) -> String {
        let mut out = Vec::new();
        from_aggregate(opt, aggregate, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn label(name: &str, width: f64) -> Option<String> {
        let aggregate: Aggregate =
            std::iter::once(parse_line(&format!("{} 1", name)).unwrap()).collect();
        let tree = CallTree::from_aggregate(&aggregate).unwrap();
        let id = tree.find([name]).unwrap();
        let mut buffer = StrStack::new();
        label_for(&Options::default(), tree.node(id), width, &mut buffer)
            .map(|i| buffer[i].to_string())
    }

    #[test]
    fn labels_fit_or_are_omitted() {
        // 12 * 0.59 = 7.08 pixels per character
        assert_eq!(label("main", 40.0).as_deref(), Some("main"));
        assert_eq!(label("main", 28.0), None);
        assert_eq!(
            label("std::io::Read::read", 60.0).as_deref(),
            Some("std::i..")
        );
        assert_eq!(label("std::io::Read::read", 30.0), None);
        assert_eq!(label("x", 10.0), None);
        assert_eq!(label("x", 20.0).as_deref(), Some("x"));
    }

    #[test]
    fn renders_every_frame_with_metadata() {
        let svg = render_to_string(&Options::default(), &example());
        assert_eq!(svg.matches("<g class=\"func_g\"").count(), 6);
        assert!(svg.contains("data-path=\"main;foo;bar\" data-total=\"7\" data-self=\"7\""));
        assert!(svg.contains("data-path=\"main;foo\" data-total=\"10\" data-self=\"0\""));
        assert!(svg.contains("<title>all (14 samples, 100%; self 0)</title>"));
        assert!(svg.contains("data-path=\"\" data-total=\"14\" data-self=\"0\""));
        assert!(svg.contains("<title>qux (4 samples, 28.57%; self 4)</title>"));
        assert!(svg.contains("<title>Flame Graph</title>") || svg.contains(">Flame Graph</text>"));
    }

    #[test]
    fn first_frame_policy_has_no_all_frame() {
        let opt = Options {
            root: RootPolicy::FirstFrame,
            ..Default::default()
        };
        let svg = render_to_string(&opt, &example());
        assert_eq!(svg.matches("<g class=\"func_g\"").count(), 5);
        assert!(!svg.contains("<title>all ("));
    }

    #[test]
    fn same_input_same_image() {
        let mut reordered = Aggregate::new();
        for line in &["main;qux 4", "main;foo;baz 3", "main;foo;bar 2", "main;foo;bar 5"] {
            reordered.add_record(parse_line(line).unwrap());
        }
        let opt = Options::default();
        assert_eq!(render_to_string(&opt, &example()), render_to_string(&opt, &reordered));
    }

    #[test]
    fn frame_colors_follow_names() {
        let svg = render_to_string(&Options::default(), &example());
        let c = color_for(Palette::Hot, "bar");
        let fill = format!("fill=\"rgb({},{},{})\"", c.r, c.g, c.b);
        assert!(svg.contains(&fill));
    }

    #[test]
    fn empty_input_is_an_error() {
        let mut out = Vec::new();
        match from_aggregate(&Options::default(), &Aggregate::new(), &mut out) {
            Err(RenderError::Build(BuildError::EmptyAggregate)) => {}
            other => panic!("expected an empty aggregate error, got {:?}", other),
        }
        assert!(out.is_empty());

        match from_reader(&Options::default(), "garbage\n".as_bytes(), io::sink()) {
            Err(RenderError::Build(BuildError::EmptyAggregate)) => {}
            other => panic!("expected an empty aggregate error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_silly_options() {
        let opt = Options {
            image_width: 10,
            ..Default::default()
        };
        match from_aggregate(&opt, &example(), io::sink()) {
            Err(RenderError::InvalidOptions(_)) => {}
            other => panic!("expected invalid options, got {:?}", other),
        }
    }

    #[test]
    fn reports_counts() {
        let input = "main;foo 3\nmain;bar x\nmain 1\n";
        let report = from_reader(&Options::default(), input.as_bytes(), io::sink()).unwrap();
        assert_eq!(
            report,
            RenderReport {
                lines: LineCounts {
                    accepted: 2,
                    rejected: 1
                },
                samples: 4,
                frames: 3,
                pruned: 0,
            }
        );
    }
}
