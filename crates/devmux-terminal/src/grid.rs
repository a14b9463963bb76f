//! Per-screen line storage.

use std::collections::VecDeque;

use crate::cell::Row;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    /// Zero dimensions are bumped to 1.
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols: cols.max(1),
            rows: rows.max(1),
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// How the last line of a grid ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineTail {
    /// The next write starts a new line.
    #[default]
    Terminated,
    /// The last line is partial; the next write continues it.
    Open,
    /// A carriage return ended the last line; the next write replaces it.
    Overwrite,
}

/// Cursor position relative to the active grid.
///
/// `col == cols` means a wrap is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub row: usize,
    pub col: usize,
    pub visible: bool,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            row: 0,
            col: 0,
            visible: true,
        }
    }
}

/// Which grid is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Screen {
    #[default]
    Primary,
    Alternate,
}

/// Lines of one screen, oldest first.
#[derive(Clone, Debug, Default)]
pub struct Grid {
    lines: VecDeque<Row>,
    tail: LineTail,
}

impl Grid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows_used(&self) -> usize {
        self.lines.len()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Row> + ExactSizeIterator {
        self.lines.iter()
    }

    pub fn last(&self) -> Option<&Row> {
        self.lines.back()
    }

    pub fn last_mut(&mut self) -> Option<&mut Row> {
        self.lines.back_mut()
    }

    pub fn push(&mut self, row: Row) {
        self.lines.push_back(row);
    }

    pub fn pop_front(&mut self) -> Option<Row> {
        self.lines.pop_front()
    }

    pub fn tail(&self) -> LineTail {
        self.tail
    }

    pub fn set_tail(&mut self, tail: LineTail) {
        self.tail = tail;
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.tail = LineTail::Terminated;
    }
}
