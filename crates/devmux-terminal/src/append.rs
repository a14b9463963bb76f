//! Merge decoded output into a [`TerminalBuffer`].
//!
//! Each call continues where the previous one stopped: an unterminated last
//! line keeps growing, a line ended by a bare `\r` is replaced by the next
//! write, and anything else starts a new line. After the write the buffer is
//! trimmed oldest-first back under its line cap.

use crate::buffer::TerminalBuffer;
use crate::cell::{CellAttributes, Row};
use crate::grid::LineTail;
use crate::line_ending::{self, LineEnding};

/// What [`append`] did to the buffer's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendOutcome {
    pub trimmed: bool,
    /// Oldest lines dropped to stay within `max_buffer_lines`.
    pub lines_removed: usize,
}

/// Append escape-free `raw` output to `buffer` using the buffer's pen.
pub fn append(buffer: &mut TerminalBuffer, raw: &str) -> AppendOutcome {
    if raw.is_empty() {
        return AppendOutcome::default();
    }

    let parsed = line_ending::parse(raw);
    let pen = buffer.pen();

    for line in &parsed.lines {
        write_line(buffer, &line.content, pen);
        let tail = match line.ending {
            LineEnding::Cr => LineTail::Overwrite,
            _ => LineTail::Terminated,
        };
        buffer.active_grid_mut().set_tail(tail);
    }

    if !parsed.remainder.is_empty() {
        write_line(buffer, &parsed.remainder, pen);
        buffer.active_grid_mut().set_tail(LineTail::Open);
    }

    let lines_removed = buffer.enforce_capacity();
    buffer.sync_cursor();
    buffer.mark_dirty();

    AppendOutcome {
        trimmed: lines_removed > 0,
        lines_removed,
    }
}

fn write_line(buffer: &mut TerminalBuffer, content: &str, pen: CellAttributes) {
    let tail = buffer.active_grid().tail();
    if let Some(last) = buffer.active_grid_mut().last_mut() {
        match tail {
            LineTail::Open => {
                last.push_str(content, pen);
                return;
            }
            LineTail::Overwrite => {
                // A CRLF split across chunks arrives as "\r" then "\n"; the
                // empty line before the "\n" must not erase the text.
                if !content.is_empty() {
                    last.replace(content, pen);
                }
                return;
            }
            LineTail::Terminated => {}
        }
    }
    buffer.push_line(Row::from_text(content, pen));
}
