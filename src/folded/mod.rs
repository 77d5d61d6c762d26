mod aggregate;

pub use aggregate::{Aggregate, LineCounts};

use std::borrow::Borrow;
use std::fmt;

use thiserror::Error;

/// The separator between frames of a folded stack.
pub const DELIMITER: char = ';';

/// Why a folded stack line was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// There is no whitespace between the stack and the count.
    #[error("no sample count found")]
    MissingCount,

    /// The trailing token is not a base-10 non-negative integer.
    #[error("invalid sample count `{0}`")]
    InvalidCount(String),

    /// The sample count is zero.
    #[error("sample count is zero")]
    ZeroCount,

    /// There are no frames in front of the count.
    #[error("stack has no frames")]
    EmptyStack,

    /// One of the frames is empty, as in `main;;foo`.
    #[error("stack `{0}` contains an empty frame")]
    EmptyFrame(String),
}

/// A call path, from the outermost caller to the sampled frame.
///
/// The path is stored in its folded form (frames joined by [`DELIMITER`]), which is also the key
/// it is aggregated under. Two paths are equal only if every frame is equal, byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackPath(String);

impl StackPath {
    /// Builds a path out of individual frame names.
    ///
    /// Returns `None` if there are no frames, or if any frame is empty or contains the delimiter.
    pub fn from_frames<'a, I>(frames: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut folded = String::new();
        for frame in frames {
            if frame.is_empty() || frame.contains(DELIMITER) {
                return None;
            }
            if !folded.is_empty() {
                folded.push(DELIMITER);
            }
            folded.push_str(frame);
        }

        if folded.is_empty() {
            None
        } else {
            Some(StackPath(folded))
        }
    }

    /// The frames of this path, root first.
    pub fn frames(&self) -> impl Iterator<Item = &str> + Clone {
        self.0.split(DELIMITER)
    }

    /// The number of frames in this path.
    pub fn depth(&self) -> usize {
        self.frames().count()
    }

    /// The sampled (innermost) frame.
    pub fn leaf(&self) -> &str {
        self.frames().last().unwrap_or_default()
    }

    /// The folded form of this path.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a copy of this path with `tag` appended to every frame, as `frame [tag]`.
    ///
    /// Frames that already end in ` [tag]` are left as they are, so tagging twice with the same
    /// tag is the same as tagging once.
    pub fn tagged(&self, tag: &str) -> StackPath {
        let suffix = format!(" [{}]", tag);
        let mut folded = String::with_capacity(self.0.len() + suffix.len() * self.depth());
        for (i, frame) in self.frames().enumerate() {
            if i != 0 {
                folded.push(DELIMITER);
            }
            folded.push_str(frame);
            if !frame.ends_with(&suffix) {
                folded.push_str(&suffix);
            }
        }
        StackPath(folded)
    }
}

impl fmt::Display for StackPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// `StackPath` hashes and compares exactly like its folded string.
impl Borrow<str> for StackPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One parsed line of folded stack input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollapsedRecord {
    /// The sampled call path.
    pub stack: StackPath,
    /// How many times it was sampled. Always at least 1.
    pub count: u64,
}

/// Parses one line of folded stack text.
///
/// The count is the token after the last run of whitespace, and everything before it is the
/// stack. Leading and trailing whitespace is ignored. The line is never partially accepted: any
/// problem with it yields a [`ParseError`].
pub fn parse_line(line: &str) -> Result<CollapsedRecord, ParseError> {
    let line = line.trim_end();
    let counti = line
        .rfind(char::is_whitespace)
        .ok_or(ParseError::MissingCount)?;

    // the character at `counti` is whitespace, but not necessarily a single byte
    let count = line[counti..].trim_start();
    let count = parse_count(count)?;

    let stack = line[..counti].trim();
    if stack.is_empty() {
        return Err(ParseError::EmptyStack);
    }
    if stack.split(DELIMITER).any(str::is_empty) {
        return Err(ParseError::EmptyFrame(stack.to_string()));
    }

    Ok(CollapsedRecord {
        stack: StackPath(stack.to_string()),
        count,
    })
}

fn parse_count(count: &str) -> Result<u64, ParseError> {
    // `u64::from_str` would also accept a leading `+`
    if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidCount(count.to_string()));
    }
    match count.parse::<u64>() {
        Ok(0) => Err(ParseError::ZeroCount),
        Ok(n) => Ok(n),
        Err(_) => Err(ParseError::InvalidCount(count.to_string())),
    }
}
