//! Streaming escape-sequence decoder.
//!
//! This module strips ANSI/VT escape sequences from remote shell output. PTY
//! reads split sequences at arbitrary byte positions, so the decoder keeps the
//! unfinished tail of a sequence and prepends it to the next chunk. Splitting
//! one input into any number of `decode` calls yields the same text as a
//! single call on the whole input.
//!
//! String sequences (OSC, DCS, APC, PM, SOS) are consumed as they stream in:
//! once the introducer is seen, the decoder keeps only a capped copy of the
//! payload and at most one held-back ESC, so a multi-megabyte clipboard or
//! image payload never accumulates in memory.

use thiserror::Error;
use tracing::warn;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

/// Longest CSI sequence the decoder accepts. A longer one is invalid and
/// left in the text, whether it arrives whole or in pieces.
pub const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Bytes of a string sequence's payload kept in its [`EscapeSequence`]
/// value. The rest of the payload is still consumed.
pub const MAX_PAYLOAD_BYTES: usize = 4 * 1024;

/// Internal decoder fault. Never escapes [`EscapeSequenceDecoder`]: the
/// decoder logs it and returns its input unmodified.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeFailure {
    #[error("escape scan started at byte {0}, which is not ESC")]
    MissingIntroducer(usize),
    #[error("byte range {start}..{end} does not fall on character boundaries")]
    Boundary { start: usize, end: usize },
}

/// Introducer of a string-carrying sequence terminated by ST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringKind {
    /// Device Control String (`ESC P`)
    Dcs,
    /// Application Program Command (`ESC _`)
    Apc,
    /// Privacy Message (`ESC ^`)
    Pm,
    /// Start Of String (`ESC X`)
    Sos,
}

/// A parsed Control Sequence Introducer sequence (`ESC [ ...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiSequence {
    /// Leading `<`, `=`, `>` or `?` marking a private sequence.
    pub private_marker: Option<char>,
    /// Parameters; each entry holds a parameter and its `:` subparameters.
    /// Omitted parameters are 0.
    pub params: Vec<Vec<u16>>,
    pub intermediates: String,
    pub final_byte: char,
}

/// Coarse classification of a CSI sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsiKind {
    Sgr,
    CursorMovement,
    EraseScreen,
    EraseLine,
    /// DEC private mode set (`h`) or reset (`l`).
    PrivateMode { set: bool },
    WindowOp,
    DeviceStatus,
    Other,
}

impl CsiSequence {
    /// First value of parameter `index`, or `default` when omitted.
    pub fn param(&self, index: usize, default: u16) -> u16 {
        self.params
            .get(index)
            .and_then(|group| group.first().copied())
            .unwrap_or(default)
    }

    /// Iterate the leading value of every parameter.
    pub fn values(&self) -> impl Iterator<Item = u16> + '_ {
        self.params.iter().map(|group| group.first().copied().unwrap_or(0))
    }

    pub fn kind(&self) -> CsiKind {
        match (self.private_marker, self.final_byte) {
            (Some('?'), 'h') => CsiKind::PrivateMode { set: true },
            (Some('?'), 'l') => CsiKind::PrivateMode { set: false },
            // `CSI > ... m` is modifyOtherKeys, not SGR
            (None, 'm') if self.intermediates.is_empty() => CsiKind::Sgr,
            (None, 'A'..='H' | 'a' | 'd' | 'e' | 'f' | '`') => CsiKind::CursorMovement,
            (_, 'J') => CsiKind::EraseScreen,
            (_, 'K') => CsiKind::EraseLine,
            (None, 't') => CsiKind::WindowOp,
            (_, 'n') => CsiKind::DeviceStatus,
            _ => CsiKind::Other,
        }
    }
}

/// Every sequence the decoder recognizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscapeSequence {
    Csi(CsiSequence),
    /// Operating System Command, terminated by BEL or ST.
    Osc { payload: String },
    /// Two-byte escape such as `ESC 7`, `ESC =` or `ESC M`.
    Simple { code: char },
    /// Escape with one intermediate, e.g. charset designation `ESC ( B`.
    Designate { intermediate: char, code: char },
    /// DCS/APC/PM/SOS string terminated by ST.
    Str { kind: StringKind, payload: String },
}

/// One piece of decoded output, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Sequence(EscapeSequence),
}

/// A string sequence whose terminator has not arrived yet.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenString {
    /// `None` for OSC.
    kind: Option<StringKind>,
    payload: String,
    truncated: bool,
}

impl OpenString {
    fn new(kind: Option<StringKind>) -> Self {
        Self {
            kind,
            payload: String::new(),
            truncated: false,
        }
    }

    /// Append payload up to [`MAX_PAYLOAD_BYTES`]. Once the cap is hit the
    /// rest is discarded, so the kept prefix does not depend on chunking.
    fn extend(&mut self, text: &str) {
        if self.truncated {
            return;
        }
        let room = MAX_PAYLOAD_BYTES - self.payload.len();
        if text.len() <= room {
            self.payload.push_str(text);
            return;
        }
        let mut cut = room;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        self.payload.push_str(&text[..cut]);
        self.truncated = true;
    }

    fn finish(self) -> EscapeSequence {
        match self.kind {
            None => EscapeSequence::Osc {
                payload: self.payload,
            },
            Some(kind) => EscapeSequence::Str {
                kind,
                payload: self.payload,
            },
        }
    }
}

/// Where a string sequence's payload stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringEnd {
    /// Payload ends at `end`; scanning resumes at `resume` (past BEL or ST,
    /// or at an aborting ESC).
    Closed { end: usize, resume: usize },
    /// Input ran out. Bytes from `end` on (a lone ESC) are held back.
    Open { end: usize },
}

/// Outcome of scanning at an ESC byte.
#[derive(Debug)]
enum Scan {
    Complete { sequence: EscapeSequence, len: usize },
    /// Input ended before the sequence could finish.
    Incomplete,
    /// Input ended inside a string sequence; its payload so far is in
    /// `string` and bytes from `held` on are held back.
    OpenString { string: OpenString, held: usize },
    /// The byte after ESC cannot continue any recognized sequence.
    Invalid,
}

/// Successful split of an input: segments, the held-back tail, and the
/// string sequence still open at the end, if any.
#[derive(Debug)]
struct Scanned {
    segments: Vec<Segment>,
    pending: String,
    open: Option<OpenString>,
}

fn slice(input: &str, start: usize, end: usize) -> Result<&str, DecodeFailure> {
    input
        .get(start..end)
        .ok_or(DecodeFailure::Boundary { start, end })
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Segment::Text(last)) = segments.last_mut() {
        last.push_str(text);
    } else {
        segments.push(Segment::Text(text.to_string()));
    }
}

fn parse_params(raw: &str) -> Vec<Vec<u16>> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(';')
        .map(|group| {
            group
                .split(':')
                .map(|value| value.parse::<u16>().unwrap_or(0))
                .collect()
        })
        .collect()
}

/// Scan `ESC [ params intermediates final`.
fn scan_csi(input: &str, start: usize) -> Result<Scan, DecodeFailure> {
    let bytes = input.as_bytes();
    let body = start + 2;
    let mut pos = body;

    let private_marker = match bytes.get(pos) {
        Some(&b @ (b'<' | b'=' | b'>' | b'?')) => {
            pos += 1;
            Some(b as char)
        }
        Some(_) => None,
        None => return Ok(Scan::Incomplete),
    };

    let params_start = pos;
    while let Some(&b) = bytes.get(pos) {
        if (0x30..=0x3f).contains(&b) {
            pos += 1;
        } else {
            break;
        }
    }
    let params_end = pos;

    while let Some(&b) = bytes.get(pos) {
        if (0x20..=0x2f).contains(&b) {
            pos += 1;
        } else {
            break;
        }
    }
    let intermediates_end = pos;

    if pos - start > MAX_PENDING_BYTES {
        return Ok(Scan::Invalid);
    }

    match bytes.get(pos) {
        None => Ok(Scan::Incomplete),
        Some(&b) if (0x40..=0x7e).contains(&b) => {
            let sequence = CsiSequence {
                private_marker,
                params: parse_params(slice(input, params_start, params_end)?),
                intermediates: slice(input, params_end, intermediates_end)?.to_string(),
                final_byte: b as char,
            };
            Ok(Scan::Complete {
                sequence: EscapeSequence::Csi(sequence),
                len: pos + 1 - start,
            })
        }
        Some(_) => Ok(Scan::Invalid),
    }
}

/// Find the end of a string payload starting at `from`.
///
/// OSC accepts BEL or ST; the other strings accept ST only. ST is `ESC \` or
/// the 8-bit form U+009C. An ESC that does not start ST aborts the string.
fn find_string_end(bytes: &[u8], from: usize, kind: Option<StringKind>) -> StringEnd {
    let mut pos = from;
    while pos < bytes.len() {
        match bytes[pos] {
            BEL if kind.is_none() => {
                return StringEnd::Closed {
                    end: pos,
                    resume: pos + 1,
                }
            }
            ESC => {
                return match bytes.get(pos + 1) {
                    Some(b'\\') => StringEnd::Closed {
                        end: pos,
                        resume: pos + 2,
                    },
                    Some(_) => StringEnd::Closed { end: pos, resume: pos },
                    None => StringEnd::Open { end: pos },
                }
            }
            0xc2 if bytes.get(pos + 1) == Some(&0x9c) => {
                return StringEnd::Closed {
                    end: pos,
                    resume: pos + 2,
                }
            }
            _ => pos += 1,
        }
    }
    StringEnd::Open { end: bytes.len() }
}

/// Scan an OSC or DCS/APC/PM/SOS string whose introducer is at `start`.
fn scan_string(input: &str, start: usize, kind: Option<StringKind>) -> Result<Scan, DecodeFailure> {
    let payload_start = start + 2;
    let mut string = OpenString::new(kind);

    match find_string_end(input.as_bytes(), payload_start, kind) {
        StringEnd::Closed { end, resume } => {
            string.extend(slice(input, payload_start, end)?);
            Ok(Scan::Complete {
                sequence: string.finish(),
                len: resume - start,
            })
        }
        StringEnd::Open { end } => {
            string.extend(slice(input, payload_start, end)?);
            Ok(Scan::OpenString { string, held: end })
        }
    }
}

/// Classify the sequence starting at `start`, which must be ESC.
fn scan_escape(input: &str, start: usize) -> Result<Scan, DecodeFailure> {
    let bytes = input.as_bytes();
    if bytes.get(start) != Some(&ESC) {
        return Err(DecodeFailure::MissingIntroducer(start));
    }

    let Some(&intro) = bytes.get(start + 1) else {
        return Ok(Scan::Incomplete);
    };

    match intro {
        b'[' => scan_csi(input, start),
        b']' => scan_string(input, start, None),
        b'P' => scan_string(input, start, Some(StringKind::Dcs)),
        b'_' => scan_string(input, start, Some(StringKind::Apc)),
        b'^' => scan_string(input, start, Some(StringKind::Pm)),
        b'X' => scan_string(input, start, Some(StringKind::Sos)),
        0x20..=0x2f => match bytes.get(start + 2) {
            None => Ok(Scan::Incomplete),
            Some(&code) if (0x30..=0x7e).contains(&code) => Ok(Scan::Complete {
                sequence: EscapeSequence::Designate {
                    intermediate: intro as char,
                    code: code as char,
                },
                len: 3,
            }),
            Some(_) => Ok(Scan::Invalid),
        },
        0x30..=0x7e => Ok(Scan::Complete {
            sequence: EscapeSequence::Simple { code: intro as char },
            len: 2,
        }),
        _ => Ok(Scan::Invalid),
    }
}

/// Split `input` into text and sequences, holding back a trailing incomplete
/// sequence. `open` is a string sequence left open by the previous input.
/// Pure: the same arguments always yield the same split.
fn split_sequences(input: &str, open: Option<OpenString>) -> Result<Scanned, DecodeFailure> {
    let bytes = input.as_bytes();
    let mut segments = Vec::new();
    let mut pos = 0;

    if let Some(mut string) = open {
        match find_string_end(bytes, 0, string.kind) {
            StringEnd::Open { end } => {
                string.extend(slice(input, 0, end)?);
                return Ok(Scanned {
                    segments,
                    pending: slice(input, end, input.len())?.to_string(),
                    open: Some(string),
                });
            }
            StringEnd::Closed { end, resume } => {
                string.extend(slice(input, 0, end)?);
                segments.push(Segment::Sequence(string.finish()));
                pos = resume;
            }
        }
    }

    let mut text_start = pos;
    while let Some(offset) = bytes[pos..].iter().position(|&b| b == ESC) {
        let esc = pos + offset;
        match scan_escape(input, esc)? {
            Scan::Complete { sequence, len } => {
                push_text(&mut segments, slice(input, text_start, esc)?);
                segments.push(Segment::Sequence(sequence));
                pos = esc + len;
                text_start = pos;
            }
            Scan::Invalid => {
                // Leave the ESC in the text run
                pos = esc + 1;
            }
            Scan::Incomplete => {
                push_text(&mut segments, slice(input, text_start, esc)?);
                return Ok(Scanned {
                    segments,
                    pending: slice(input, esc, input.len())?.to_string(),
                    open: None,
                });
            }
            Scan::OpenString { string, held } => {
                push_text(&mut segments, slice(input, text_start, esc)?);
                return Ok(Scanned {
                    segments,
                    pending: slice(input, held, input.len())?.to_string(),
                    open: Some(string),
                });
            }
        }
    }

    push_text(&mut segments, slice(input, text_start, input.len())?);
    Ok(Scanned {
        segments,
        pending: String::new(),
        open: None,
    })
}

/// Stateful decoder for one output stream.
///
/// Handles sequences split across chunks by keeping the unfinished tail in
/// `pending` until later input completes or invalidates it.
#[derive(Debug, Default)]
pub struct EscapeSequenceDecoder {
    /// Unconsumed start of a possible escape sequence; always begins with ESC.
    pending: String,
    /// String sequence being consumed across chunks.
    string: Option<OpenString>,
}

impl EscapeSequenceDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk into text with all recognized sequences removed.
    /// `\n`, `\r` and `\t` pass through untouched.
    pub fn decode(&mut self, chunk: &str) -> String {
        let mut text = String::with_capacity(chunk.len());
        for segment in self.decode_segments(chunk) {
            if let Segment::Text(run) = segment {
                text.push_str(&run);
            }
        }
        text
    }

    /// Decode a chunk into ordered text runs and recognized sequences.
    pub fn decode_segments(&mut self, chunk: &str) -> Vec<Segment> {
        if chunk.is_empty() && self.pending.is_empty() {
            return Vec::new();
        }

        let mut combined = std::mem::take(&mut self.pending);
        combined.push_str(chunk);

        let result = split_sequences(&combined, self.string.take());
        self.settle(combined, result)
    }

    /// Adopt a split's held-back state, or on failure reset and hand back
    /// `combined` (pending plus chunk) as text.
    fn settle(&mut self, combined: String, result: Result<Scanned, DecodeFailure>) -> Vec<Segment> {
        match result {
            Ok(scanned) => {
                self.pending = scanned.pending;
                self.string = scanned.open;
                scanned.segments
            }
            Err(failure) => {
                warn!(
                    "[decoder] {}; passing {} bytes through undecoded",
                    failure,
                    combined.len()
                );
                self.pending.clear();
                self.string = None;
                vec![Segment::Text(combined)]
            }
        }
    }

    /// Bytes currently held back as a possible sequence start.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Whether a string sequence (OSC, DCS, ...) is still awaiting its
    /// terminator.
    pub fn in_string(&self) -> bool {
        self.string.is_some()
    }

    /// Drop any held-back bytes (explicit session reset).
    pub fn clear_buffer(&mut self) {
        self.pending.clear();
        self.string = None;
    }

    /// Release held-back bytes as text. Call when the stream ends so an
    /// unfinished CSI or escape is not silently lost. An unterminated string
    /// sequence is dropped; its payload was never text.
    pub fn flush(&mut self) -> String {
        if self.string.take().is_some() {
            self.pending.clear();
            return String::new();
        }
        std::mem::take(&mut self.pending)
    }
}

/// Stateless helper for inputs that are known to be complete.
pub fn strip_escape_sequences(input: &str) -> String {
    let mut decoder = EscapeSequenceDecoder::new();
    let mut text = decoder.decode(input);
    text.push_str(&decoder.flush());
    text
}
