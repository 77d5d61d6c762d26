use std::fmt;
use std::str::FromStr;

use rgb::RGB8;

/// The colors of the graph background gradient, top and bottom.
pub(super) type Gradient = (&'static str, &'static str);

const YELLOW_GRADIENT: Gradient = ("#eeeeee", "#eeeeb0");
const BLUE_GRADIENT: Gradient = ("#eeeeee", "#e0e0ff");
const GRAY_GRADIENT: Gradient = ("#f8f8f8", "#e8e8e8");

/// A range of colors frames are drawn in.
///
/// Within a palette, a frame's color depends only on its name, so the same function gets the
/// same color in every graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Palette {
    /// Reds, oranges and yellows.
    Hot,
    /// Greens and blues.
    Mem,
    /// Blues and purples.
    Io,
    /// Shades of red.
    Red,
    /// Shades of green.
    Green,
    /// Shades of blue.
    Blue,
    /// Shades of aqua.
    Aqua,
    /// Shades of yellow.
    Yellow,
    /// Shades of purple.
    Purple,
    /// Shades of orange.
    Orange,
}

impl Default for Palette {
    fn default() -> Self {
        Palette::Hot
    }
}

impl FromStr for Palette {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hot" => Ok(Palette::Hot),
            "mem" => Ok(Palette::Mem),
            "io" => Ok(Palette::Io),
            "red" => Ok(Palette::Red),
            "green" => Ok(Palette::Green),
            "blue" => Ok(Palette::Blue),
            "aqua" => Ok(Palette::Aqua),
            "yellow" => Ok(Palette::Yellow),
            "purple" => Ok(Palette::Purple),
            "orange" => Ok(Palette::Orange),
            unknown => Err(format!("unknown color palette: {}", unknown)),
        }
    }
}

impl fmt::Display for Palette {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Palette::Hot => "hot",
            Palette::Mem => "mem",
            Palette::Io => "io",
            Palette::Red => "red",
            Palette::Green => "green",
            Palette::Blue => "blue",
            Palette::Aqua => "aqua",
            Palette::Yellow => "yellow",
            Palette::Purple => "purple",
            Palette::Orange => "orange",
        })
    }
}

/// Generate a vector hash for the name string, weighting early over later characters, in
/// `[0, 1]`. Only the first three bytes matter, so names with a common prefix get similar
/// colors.
fn namehash<I>(name: I) -> f32
where
    I: Iterator<Item = u8>,
{
    let mut vector = 0.0;
    let mut weight = 1.0;
    let mut max = 1.0;
    let mut modulo = 10;

    for character in name.take(3) {
        let i = f32::from(character % modulo);
        vector += (i / f32::from(modulo - 1)) * weight;
        modulo += 1;
        max += weight;
        weight *= 0.70;
    }

    1.0 - vector / max
}

macro_rules! t {
    ($b:expr, $a:expr, $x:expr) => {
        $b + ($a as f32 * $x) as u8
    };
}

/// The color of the frame named `name`.
///
/// This is a pure function of the palette and the name: the first characters of the name pick
/// the main hue, the last characters fine-tune it, so frames whose names only differ in a suffix
/// (such as a rank tag) still look distinct.
pub fn color_for(palette: Palette, name: &str) -> RGB8 {
    let v1 = namehash(name.bytes());
    let v2 = namehash(name.bytes().rev());
    let v3 = v2;

    let (r, g, b) = match palette {
        Palette::Hot => (t!(205, 50, v3), t!(0, 230, v1), t!(0, 55, v2)),
        Palette::Mem => (t!(0, 0, v3), t!(190, 50, v2), t!(0, 210, v1)),
        Palette::Io => (t!(80, 60, v1), t!(80, 60, v1), t!(190, 55, v2)),
        Palette::Red => (t!(200, 55, v1), t!(50, 80, v2), t!(50, 80, v2)),
        Palette::Green => (t!(50, 60, v2), t!(200, 55, v1), t!(50, 60, v2)),
        Palette::Blue => (t!(80, 60, v2), t!(80, 60, v2), t!(205, 50, v1)),
        Palette::Yellow => (t!(175, 55, v1), t!(175, 55, v1), t!(50, 20, v2)),
        Palette::Purple => (t!(190, 65, v1), t!(80, 60, v2), t!(190, 65, v1)),
        Palette::Aqua => (t!(50, 60, v2), t!(165, 55, v1), t!(165, 55, v1)),
        Palette::Orange => (t!(190, 65, v1), t!(90, 65, v2), t!(0, 0, v1)),
    };
    RGB8::new(r, g, b)
}

pub(super) fn bgcolor_for(palette: Palette) -> Gradient {
    match palette {
        Palette::Hot | Palette::Yellow | Palette::Orange => YELLOW_GRADIENT,
        Palette::Mem | Palette::Blue | Palette::Io => BLUE_GRADIENT,
        _ => GRAY_GRADIENT,
    }
}
