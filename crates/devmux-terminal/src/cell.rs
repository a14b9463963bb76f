//! Cell and row types.
//!
//! A row is one logical output line. Rows are not padded to the terminal
//! width; wrapping long lines is left to the renderer.

use ratatui::style::{Color, Modifier, Style};
use unicode_width::UnicodeWidthChar;

/// Columns between tab stops.
pub const TAB_WIDTH: usize = 8;

/// Rendition applied to a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CellAttributes {
    pub foreground: Option<Color>,
    pub background: Option<Color>,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strikethrough: bool,
    pub reverse: bool,
    pub dim: bool,
}

impl CellAttributes {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Convert to a ratatui Style.
    pub fn to_style(&self) -> Style {
        let mut style = Style::default();
        if let Some(fg) = self.foreground {
            style = style.fg(fg);
        }
        if let Some(bg) = self.background {
            style = style.bg(bg);
        }
        let flags = [
            (self.bold, Modifier::BOLD),
            (self.italic, Modifier::ITALIC),
            (self.underline, Modifier::UNDERLINED),
            (self.strikethrough, Modifier::CROSSED_OUT),
            (self.reverse, Modifier::REVERSED),
            (self.dim, Modifier::DIM),
        ];
        for (enabled, modifier) in flags {
            if enabled {
                style = style.add_modifier(modifier);
            }
        }
        style
    }

    /// Apply Select Graphic Rendition parameters. Each entry is a parameter
    /// with its `:` subparameters; an empty list resets.
    pub fn apply_sgr(&mut self, params: &[Vec<u16>]) {
        if params.is_empty() {
            *self = Self::default();
            return;
        }

        let mut i = 0;
        while i < params.len() {
            let param = &params[i];
            let code = param.first().copied().unwrap_or(0);

            match code {
                0 => *self = Self::default(),
                1 => self.bold = true,
                2 => self.dim = true,
                3 => self.italic = true,
                4 => self.underline = true,
                7 => self.reverse = true,
                9 => self.strikethrough = true,
                22 => {
                    self.bold = false;
                    self.dim = false;
                }
                23 => self.italic = false,
                24 => self.underline = false,
                27 => self.reverse = false,
                29 => self.strikethrough = false,
                30..=37 => self.foreground = Some(basic_color(code - 30)),
                38 => {
                    let (color, consumed) = extended_color(params, i);
                    if let Some(color) = color {
                        self.foreground = Some(color);
                    }
                    i += consumed;
                }
                39 => self.foreground = None,
                40..=47 => self.background = Some(basic_color(code - 40)),
                48 => {
                    let (color, consumed) = extended_color(params, i);
                    if let Some(color) = color {
                        self.background = Some(color);
                    }
                    i += consumed;
                }
                49 => self.background = None,
                90..=97 => self.foreground = Some(bright_color(code - 90)),
                100..=107 => self.background = Some(bright_color(code - 100)),
                _ => {}
            }
            i += 1;
        }
    }
}

fn basic_color(index: u16) -> Color {
    match index {
        0 => Color::Black,
        1 => Color::Red,
        2 => Color::Green,
        3 => Color::Yellow,
        4 => Color::Blue,
        5 => Color::Magenta,
        6 => Color::Cyan,
        _ => Color::Gray,
    }
}

fn bright_color(index: u16) -> Color {
    match index {
        0 => Color::DarkGray,
        1 => Color::LightRed,
        2 => Color::LightGreen,
        3 => Color::LightYellow,
        4 => Color::LightBlue,
        5 => Color::LightMagenta,
        6 => Color::LightCyan,
        _ => Color::Indexed(15),
    }
}

/// Decode a 38/48 extended color at `params[i]`. Returns the color and how
/// many extra semicolon-separated parameters it consumed.
fn extended_color(params: &[Vec<u16>], i: usize) -> (Option<Color>, usize) {
    let param = &params[i];

    // Colon form: 38:5:n, 38:2:r:g:b or 38:2:colorspace:r:g:b
    if param.len() >= 3 && param[1] == 5 {
        return (Some(Color::Indexed(param[2] as u8)), 0);
    }
    if param.len() >= 5 && param[1] == 2 {
        let rgb = if param.len() >= 6 {
            (param[3], param[4], param[5])
        } else {
            (param[2], param[3], param[4])
        };
        return (Some(Color::Rgb(rgb.0 as u8, rgb.1 as u8, rgb.2 as u8)), 0);
    }

    // Semicolon form: 38;5;n or 38;2;r;g;b
    let value = |offset: usize| {
        params
            .get(i + offset)
            .and_then(|group| group.first().copied())
    };
    match value(1) {
        Some(5) => match value(2) {
            Some(n) => (Some(Color::Indexed(n as u8)), 2),
            None => (None, 1),
        },
        Some(2) => match (value(2), value(3), value(4)) {
            (Some(r), Some(g), Some(b)) => (Some(Color::Rgb(r as u8, g as u8, b as u8)), 4),
            _ => (None, params.len() - i - 1),
        },
        _ => (None, 0),
    }
}

/// One screen position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cell {
    pub character: char,
    pub attributes: CellAttributes,
    /// Precomputed display width (1 or 2).
    width: u8,
}

impl Cell {
    pub fn new(character: char, attributes: CellAttributes) -> Self {
        let width = character.width().unwrap_or(1).clamp(1, 2) as u8;
        Self {
            character,
            attributes,
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width as usize
    }
}

/// One logical line of cells.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    cells: Vec<Cell>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a row from text using `attributes` for every cell.
    pub fn from_text(text: &str, attributes: CellAttributes) -> Self {
        let mut row = Self::new();
        row.push_str(text, attributes);
        row
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn get(&self, col: usize) -> Option<&Cell> {
        self.cells.get(col)
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Display width in columns.
    pub fn width(&self) -> usize {
        self.cells.iter().map(Cell::width).sum()
    }

    /// The row's characters as a string.
    pub fn text(&self) -> String {
        self.cells.iter().map(|cell| cell.character).collect()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// Append text to the end of the row.
    ///
    /// Tabs advance to the next tab stop, backspace erases the previous cell,
    /// zero-width characters and other C0 controls are dropped.
    pub fn push_str(&mut self, text: &str, attributes: CellAttributes) {
        for c in text.chars() {
            match c {
                '\t' => {
                    let pad = TAB_WIDTH - self.width() % TAB_WIDTH;
                    for _ in 0..pad {
                        self.cells.push(Cell::new(' ', attributes));
                    }
                }
                '\x08' => {
                    self.cells.pop();
                }
                c if c.is_control() => {}
                c if c.width() == Some(0) => {}
                c => self.cells.push(Cell::new(c, attributes)),
            }
        }
    }

    /// Replace the whole row with `text`.
    pub fn replace(&mut self, text: &str, attributes: CellAttributes) {
        self.cells.clear();
        self.push_str(text, attributes);
    }
}
