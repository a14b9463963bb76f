//! TerminalBuffer: the structured screen state of one session.
//!
//! The buffer keeps a primary and an alternate grid, a cursor, bounded
//! scrollback and the current pen. Decoded text reaches it through
//! [`crate::append`]; recognized escape sequences through
//! [`TerminalBuffer::apply_sequence`].

use std::collections::VecDeque;

use crate::cell::{Cell, CellAttributes, Row};
use crate::decoder::{CsiKind, EscapeSequence};
use crate::grid::{Cursor, Grid, LineTail, Screen, TerminalSize};

/// Default cap on scrollback plus on-screen lines.
pub const DEFAULT_MAX_BUFFER_LINES: usize = 10_000;

/// What [`TerminalBuffer::clear`] erases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMode {
    /// The active grid only.
    Screen,
    /// The active grid and all scrollback.
    ScreenAndScrollback,
}

#[derive(Debug, Clone)]
pub struct TerminalBuffer {
    primary: Grid,
    alternate: Grid,
    active: Screen,
    cursor: Cursor,
    /// Primary cursor saved while the alternate screen is active.
    saved_cursor: Option<Cursor>,
    size: TerminalSize,
    /// Lines scrolled off the top of the primary grid, oldest first.
    scrollback: VecDeque<Row>,
    max_buffer_lines: usize,
    pen: CellAttributes,
    title: Option<String>,
    generation: u64,
}

impl Default for TerminalBuffer {
    fn default() -> Self {
        Self::with_size(TerminalSize::default())
    }
}

impl TerminalBuffer {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self::with_size(TerminalSize::new(cols, rows))
    }

    pub fn with_size(size: TerminalSize) -> Self {
        Self {
            primary: Grid::new(),
            alternate: Grid::new(),
            active: Screen::Primary,
            cursor: Cursor::default(),
            saved_cursor: None,
            size: TerminalSize::new(size.cols, size.rows),
            scrollback: VecDeque::new(),
            max_buffer_lines: DEFAULT_MAX_BUFFER_LINES,
            pen: CellAttributes::default(),
            title: None,
            generation: 0,
        }
    }

    /// Cap scrollback plus on-screen lines at `max` (at least 1).
    pub fn with_max_buffer_lines(mut self, max: usize) -> Self {
        self.max_buffer_lines = max.max(1);
        self.enforce_capacity();
        self
    }

    // ===== Accessors =====

    pub fn size(&self) -> TerminalSize {
        self.size
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn max_buffer_lines(&self) -> usize {
        self.max_buffer_lines
    }

    pub fn scrollback_len(&self) -> usize {
        self.scrollback.len()
    }

    pub fn rows_used(&self) -> usize {
        self.active_grid().rows_used()
    }

    pub fn is_alternate_active(&self) -> bool {
        self.active == Screen::Alternate
    }

    pub fn pen(&self) -> CellAttributes {
        self.pen
    }

    pub fn set_pen(&mut self, pen: CellAttributes) {
        self.pen = pen;
    }

    /// Window title from the last OSC 0/2.
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Incremented on every mutation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the active view holds any line.
    pub fn has_content(&self) -> bool {
        self.line_count() > 0
    }

    // ===== Line view =====

    /// Rows of the active view, oldest first. The primary view includes
    /// scrollback; the alternate view is its grid alone.
    fn view(&self) -> impl DoubleEndedIterator<Item = &Row> + '_ {
        let above = match self.active {
            Screen::Primary => Some(&self.scrollback),
            Screen::Alternate => None,
        };
        above.into_iter().flatten().chain(self.active_grid().iter())
    }

    pub fn line_count(&self) -> usize {
        let above = match self.active {
            Screen::Primary => self.scrollback.len(),
            Screen::Alternate => 0,
        };
        above + self.active_grid().rows_used()
    }

    /// Every line of the active view as text.
    pub fn lines(&self) -> Vec<String> {
        self.view().map(Row::text).collect()
    }

    pub fn line(&self, index: usize) -> Option<&Row> {
        self.view().nth(index)
    }

    pub fn cell(&self, line: usize, col: usize) -> Option<&Cell> {
        self.line(line).and_then(|row| row.get(col))
    }

    /// Exactly `viewport_rows` lines: the most recent lines of the view,
    /// padded at the end with empty strings when there are fewer.
    pub fn get_visible_lines(&self, viewport_rows: usize) -> Vec<String> {
        self.visible_rows(viewport_rows)
            .iter()
            .map(Row::text)
            .collect()
    }

    /// Styled counterpart of [`get_visible_lines`](Self::get_visible_lines).
    pub fn visible_rows(&self, viewport_rows: usize) -> Vec<Row> {
        let skip = self.line_count().saturating_sub(viewport_rows);
        let mut rows: Vec<Row> = self.view().skip(skip).cloned().collect();
        rows.resize_with(viewport_rows, Row::new);
        rows
    }

    // ===== Screen operations =====

    /// Change the terminal size. Lines pushed off a shorter primary grid move
    /// into scrollback; scrollback itself is kept.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        let size = TerminalSize::new(cols, rows);
        if size == self.size {
            return;
        }
        self.size = size;

        while self.primary.rows_used() > size.rows as usize {
            if let Some(row) = self.primary.pop_front() {
                self.scrollback.push_back(row);
            }
        }
        while self.alternate.rows_used() > size.rows as usize {
            self.alternate.pop_front();
        }

        self.enforce_capacity();
        self.sync_cursor();
        if let Some(saved) = self.saved_cursor.as_mut() {
            saved.row = saved.row.min(size.rows as usize - 1);
            saved.col = saved.col.min(size.cols as usize);
        }
        self.mark_dirty();
    }

    pub fn clear(&mut self, mode: ClearMode) {
        self.active_grid_mut().clear();
        if mode == ClearMode::ScreenAndScrollback {
            self.scrollback.clear();
        }
        self.cursor.row = 0;
        self.cursor.col = 0;
        self.mark_dirty();
    }

    /// Enter or leave the alternate screen. Entering starts from a blank
    /// alternate grid; leaving restores the primary grid and cursor as they
    /// were.
    pub fn switch_buffer(&mut self, to_alternate: bool) {
        match (self.active, to_alternate) {
            (Screen::Primary, true) => {
                self.saved_cursor = Some(self.cursor);
                self.alternate.clear();
                self.active = Screen::Alternate;
                self.cursor = Cursor {
                    visible: self.cursor.visible,
                    ..Cursor::default()
                };
            }
            (Screen::Alternate, false) => {
                self.active = Screen::Primary;
                let visible = self.cursor.visible;
                match self.saved_cursor.take() {
                    Some(saved) => self.cursor = Cursor { visible, ..saved },
                    None => self.sync_cursor(),
                }
            }
            _ => return,
        }
        self.mark_dirty();
    }

    /// Full reset (RIS): primary screen, blank grids, default pen.
    pub fn reset(&mut self) {
        let size = self.size;
        let max = self.max_buffer_lines;
        *self = Self::with_size(size).with_max_buffer_lines(max);
        self.generation = self.generation.wrapping_add(1);
    }

    /// Project a recognized escape sequence onto the buffer. Returns whether
    /// anything changed. Sequences without a line-model meaning are ignored.
    pub fn apply_sequence(&mut self, sequence: &EscapeSequence) -> bool {
        let changed = match sequence {
            EscapeSequence::Csi(csi) => match csi.kind() {
                CsiKind::Sgr => {
                    self.pen.apply_sgr(&csi.params);
                    true
                }
                CsiKind::EraseScreen => match csi.param(0, 0) {
                    2 => {
                        self.clear(ClearMode::Screen);
                        true
                    }
                    3 => {
                        self.clear(ClearMode::ScreenAndScrollback);
                        true
                    }
                    _ => false,
                },
                CsiKind::PrivateMode { set } => {
                    let mut changed = false;
                    for mode in csi.values() {
                        match mode {
                            47 | 1047 | 1049 => {
                                self.switch_buffer(set);
                                changed = true;
                            }
                            25 => {
                                self.cursor.visible = set;
                                changed = true;
                            }
                            _ => {}
                        }
                    }
                    changed
                }
                _ => false,
            },
            EscapeSequence::Osc { payload } => {
                let title = payload
                    .strip_prefix("0;")
                    .or_else(|| payload.strip_prefix("2;"));
                match title {
                    Some(title) => {
                        self.title = Some(title.to_string());
                        true
                    }
                    None => false,
                }
            }
            EscapeSequence::Simple { code: 'c' } => {
                self.reset();
                true
            }
            _ => false,
        };
        if changed {
            self.mark_dirty();
        }
        changed
    }

    // ===== Line-model primitives for the append engine =====

    pub(crate) fn active_grid(&self) -> &Grid {
        match self.active {
            Screen::Primary => &self.primary,
            Screen::Alternate => &self.alternate,
        }
    }

    pub(crate) fn active_grid_mut(&mut self) -> &mut Grid {
        match self.active {
            Screen::Primary => &mut self.primary,
            Screen::Alternate => &mut self.alternate,
        }
    }

    /// Append a row to the active grid, scrolling the top row off when the
    /// grid is full. Primary rows scroll into scrollback, alternate rows are
    /// discarded.
    pub(crate) fn push_line(&mut self, row: Row) {
        let rows = self.size.rows as usize;
        let active = self.active;
        let grid = self.active_grid_mut();
        grid.push(row);
        if grid.rows_used() > rows {
            if let Some(top) = grid.pop_front() {
                if active == Screen::Primary {
                    self.scrollback.push_back(top);
                }
            }
        }
    }

    /// Drop the oldest lines until scrollback plus the active grid fit in
    /// `max_buffer_lines`. Returns how many lines were dropped.
    pub(crate) fn enforce_capacity(&mut self) -> usize {
        let mut removed = 0;
        while self.scrollback.len() + self.active_grid().rows_used() > self.max_buffer_lines {
            if self.scrollback.pop_front().is_none() {
                self.active_grid_mut().pop_front();
            }
            removed += 1;
        }
        removed
    }

    /// Place the cursor after the active grid's last write.
    pub(crate) fn sync_cursor(&mut self) {
        let rows = self.size.rows as usize;
        let cols = self.size.cols as usize;
        let grid = self.active_grid();
        let used = grid.rows_used();
        let (row, col) = match grid.tail() {
            LineTail::Terminated => (used, 0),
            LineTail::Open => (
                used.saturating_sub(1),
                grid.last().map(Row::width).unwrap_or(0),
            ),
            LineTail::Overwrite => (used.saturating_sub(1), 0),
        };
        self.cursor.row = row.min(rows - 1);
        self.cursor.col = col.min(cols);
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}
