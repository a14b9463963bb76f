//! Line terminator parsing.
//!
//! Remote shells mix `\n`, `\r\n` and bare `\r` freely: progress bars redraw
//! a line with `\r`, PTYs translate `\n` into `\r\n`, and some tools emit bare
//! `\n`. This module splits text into lines tagged with the terminator that
//! ended them so the append engine can tell a carriage-return redraw apart
//! from a real line break.

/// The terminator that ended a [`ParsedLine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
    /// Bare carriage return: the next write redraws the same line.
    Cr,
    None,
}

impl LineEnding {
    pub fn as_str(self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
            LineEnding::Cr => "\r",
            LineEnding::None => "",
        }
    }

    fn byte_len(self) -> usize {
        self.as_str().len()
    }
}

/// One terminated line of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub content: String,
    pub ending: LineEnding,
    /// True iff `ending` is [`LineEnding::Cr`].
    pub should_overwrite: bool,
}

impl ParsedLine {
    fn new(content: &str, ending: LineEnding) -> Self {
        Self {
            content: content.to_string(),
            ending,
            should_overwrite: ending == LineEnding::Cr,
        }
    }
}

/// Result of [`parse`]: the terminated lines plus any unterminated tail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedText {
    pub lines: Vec<ParsedLine>,
    /// Trailing text with no terminator yet.
    pub remainder: String,
}

/// Find the next terminator at or after `from`.
///
/// CRLF is matched before CR so a Windows-style break is never split into an
/// overwrite followed by an empty line.
fn next_terminator(bytes: &[u8], from: usize) -> Option<(usize, LineEnding)> {
    let mut pos = from;
    while pos < bytes.len() {
        match bytes[pos] {
            b'\n' => return Some((pos, LineEnding::Lf)),
            b'\r' if bytes.get(pos + 1) == Some(&b'\n') => return Some((pos, LineEnding::CrLf)),
            b'\r' => return Some((pos, LineEnding::Cr)),
            _ => pos += 1,
        }
    }
    None
}

/// Split `text` into terminated lines and a remainder in one left-to-right pass.
pub fn parse(text: &str) -> ParsedText {
    let bytes = text.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0;

    while let Some((pos, ending)) = next_terminator(bytes, start) {
        // Terminators are ASCII, so `start` and `pos` are always char boundaries.
        lines.push(ParsedLine::new(&text[start..pos], ending));
        start = pos + ending.byte_len();
    }

    ParsedText {
        lines,
        remainder: text[start..].to_string(),
    }
}

/// Rewrite every LF, CRLF and bare CR in `text` to `target`.
///
/// `LineEnding::None` strips terminators entirely.
pub fn normalize(text: &str, target: LineEnding) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut start = 0;

    while let Some((pos, ending)) = next_terminator(bytes, start) {
        out.push_str(&text[start..pos]);
        out.push_str(target.as_str());
        start = pos + ending.byte_len();
    }
    out.push_str(&text[start..]);
    out
}

/// Count lines the way a progress counter does: empty input is one (current)
/// line, and a trailing terminator does not open a new counted line.
pub fn count_lines(text: &str) -> usize {
    if text.is_empty() {
        return 1;
    }
    let parsed = parse(text);
    let tail = usize::from(!parsed.remainder.is_empty());
    (parsed.lines.len() + tail).max(1)
}
