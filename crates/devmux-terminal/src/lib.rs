//! devmux-terminal: Streaming terminal output model
//!
//! This crate provides:
//! - `EscapeSequenceDecoder`: Chunk-safe ANSI/VT escape sequence decoder
//! - `line_ending`: Line terminator parsing (LF / CRLF / CR overwrite)
//! - `TerminalBuffer`: Primary and alternate grids, cursor, bounded scrollback
//! - `append`: Merges decoded output into a buffer's line list
//!
//! # Usage
//!
//! ```rust
//! use devmux_terminal::{append, EscapeSequenceDecoder, Segment, TerminalBuffer};
//!
//! let mut decoder = EscapeSequenceDecoder::new();
//! let mut buffer = TerminalBuffer::new(80, 24);
//!
//! for chunk in ["\x1b[32mok\x1b", "[0m\r\n$ "] {
//!     for segment in decoder.decode_segments(chunk) {
//!         match segment {
//!             Segment::Text(text) => {
//!                 append(&mut buffer, &text);
//!             }
//!             Segment::Sequence(sequence) => {
//!                 buffer.apply_sequence(&sequence);
//!             }
//!         }
//!     }
//! }
//!
//! assert_eq!(buffer.get_visible_lines(2), vec!["ok", "$ "]);
//! ```

mod append;
mod buffer;
mod cell;
mod decoder;
mod grid;
pub mod line_ending;

pub use append::{append, AppendOutcome};
pub use buffer::{ClearMode, TerminalBuffer, DEFAULT_MAX_BUFFER_LINES};
pub use cell::{Cell, CellAttributes, Row, TAB_WIDTH};
pub use decoder::{
    strip_escape_sequences, CsiKind, CsiSequence, DecodeFailure, EscapeSequence,
    EscapeSequenceDecoder, Segment, StringKind, MAX_PAYLOAD_BYTES, MAX_PENDING_BYTES,
};
pub use grid::{Cursor, LineTail, TerminalSize};
pub use line_ending::{count_lines, LineEnding, ParsedLine, ParsedText};

// Re-export ratatui types that are used in the public API
pub use ratatui::style::{Color, Modifier, Style};
