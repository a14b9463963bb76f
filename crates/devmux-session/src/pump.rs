//! SessionOutputPump: moves process output into the session's buffer.
//!
//! A reader thread does the blocking reads and forwards chunks over a bounded
//! channel. The pump task reassembles UTF-8 across chunks, decodes escape
//! sequences, projects the result onto the buffer and notifies subscribers.
//! Chunks are applied strictly in arrival order.
//!
//! The reader thread owns a cloned PTY master descriptor and cannot be
//! interrupted. After teardown it stays blocked in `read` until the slave side
//! closes (EIO) or more output arrives, at which point it notices the pump is
//! gone and exits. A background process on the remote side that keeps the
//! slave open therefore keeps the thread and its descriptor alive that long;
//! nothing it reads reaches the buffer.

use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use devmux_terminal::{append, EscapeSequence, EscapeSequenceDecoder, Segment};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::OutputMode;
use crate::session::{working_directory_from_osc, RemoteSession, SessionEvent, SessionId, SessionStatus};
use crate::subscription::Subscribers;

/// Why a pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// The session was disconnected.
    Cancelled,
    /// The process closed its output.
    StreamEnded,
    ReadFailed(String),
}

#[derive(Debug)]
pub(crate) enum ReadEvent {
    Data(Vec<u8>),
    Failed(String),
}

/// EIO from a PTY master means the slave side is gone.
fn is_end_of_stream(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

/// Blocking reader loop on its own thread. Ends at EOF, on a read error, or
/// when the pump drops its receiver.
pub(crate) fn spawn_reader_thread(
    session_id: SessionId,
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::Sender<ReadEvent>,
    buffer_size: usize,
) {
    std::thread::spawn(move || {
        let mut buf = vec![0u8; buffer_size.max(1)];
        let mut total_bytes_read: usize = 0;
        let mut read_count: usize = 0;

        debug!("[reader:{}] Reader thread started", session_id);

        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("[reader:{}] EOF received", session_id);
                    break;
                }
                Ok(n) => {
                    read_count += 1;
                    total_bytes_read += n;
                    if output_tx.blocking_send(ReadEvent::Data(buf[..n].to_vec())).is_err() {
                        debug!("[reader:{}] Pump gone, stopping", session_id);
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) if is_end_of_stream(&e) => {
                    debug!("[reader:{}] EIO, treating as EOF", session_id);
                    break;
                }
                Err(e) => {
                    error!(
                        "[reader:{}] Read error: {} (kind: {:?}, errno: {:?})",
                        session_id,
                        e,
                        e.kind(),
                        e.raw_os_error()
                    );
                    let _ = output_tx.blocking_send(ReadEvent::Failed(e.to_string()));
                    break;
                }
            }
        }

        info!(
            "[reader:{}] Reader finished. Total: {} reads, {} bytes",
            session_id, read_count, total_bytes_read
        );
    });
}

/// Length of the longest prefix that can be converted now. A truncated
/// character at the end is held back; invalid bytes elsewhere are let
/// through for lossy conversion.
fn utf8_boundary(bytes: &[u8]) -> usize {
    let mut start = 0;
    loop {
        match std::str::from_utf8(&bytes[start..]) {
            Ok(_) => return bytes.len(),
            Err(e) => match e.error_len() {
                None => return start + e.valid_up_to(),
                Some(len) => start += e.valid_up_to() + len,
            },
        }
    }
}

/// Apply decoded segments to the buffer and notify. Returns false if the
/// session was cancelled first, in which case nothing was applied.
fn project(
    session: &RemoteSession,
    subscribers: &Subscribers,
    segments: Vec<Segment>,
    mode: OutputMode,
) -> bool {
    if segments.is_empty() {
        return true;
    }

    let mut working_directory = None;
    let generation = {
        let mut buffer = session.buffer().write();
        if session.cancellation().is_cancelled() {
            return false;
        }
        let before = buffer.generation();
        for segment in segments {
            match segment {
                Segment::Text(text) => {
                    append(&mut buffer, &text);
                }
                Segment::Sequence(sequence) => {
                    if let EscapeSequence::Osc { payload } = &sequence {
                        if let Some(path) = working_directory_from_osc(payload) {
                            working_directory = Some(path);
                        }
                    }
                    if mode == OutputMode::Styled {
                        buffer.apply_sequence(&sequence);
                    }
                }
            }
        }
        let after = buffer.generation();
        (after != before).then_some(after)
    };

    session.touch();
    if let Some(path) = working_directory {
        session.set_working_directory(path);
    }
    if let Some(generation) = generation {
        subscribers.notify(session.id(), session.buffer());
        let _ = session.events().send(SessionEvent::Output {
            id: session.id(),
            generation,
        });
    }
    true
}

/// Pump loop for one session. Runs until cancellation, end of stream or a
/// read failure, then settles the session's status and releases its
/// resources.
pub(crate) async fn run_pump(
    session: Arc<RemoteSession>,
    mut output_rx: mpsc::Receiver<ReadEvent>,
    subscribers: Arc<Subscribers>,
    mode: OutputMode,
) -> PumpExit {
    let session_id = session.id();
    let cancel = session.cancellation().clone();
    let mut decoder = EscapeSequenceDecoder::new();
    let mut utf8_buffer: Vec<u8> = Vec::new();
    let mut chunk_count: usize = 0;
    let mut total_bytes: usize = 0;

    info!("[pump:{}] Pump started", session_id);

    let exit = loop {
        if cancel.is_cancelled() {
            break PumpExit::Cancelled;
        }

        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpExit::Cancelled,
            event = output_rx.recv() => event,
        };

        if cancel.is_cancelled() {
            break PumpExit::Cancelled;
        }

        match event {
            Some(ReadEvent::Data(bytes)) => {
                chunk_count += 1;
                total_bytes += bytes.len();
                utf8_buffer.extend_from_slice(&bytes);

                let valid_up_to = utf8_boundary(&utf8_buffer);
                if valid_up_to == 0 {
                    continue;
                }
                let text = String::from_utf8_lossy(&utf8_buffer[..valid_up_to]).into_owned();
                utf8_buffer.drain(..valid_up_to);

                let segments = decoder.decode_segments(&text);
                if !project(&session, &subscribers, segments, mode) {
                    break PumpExit::Cancelled;
                }
            }
            Some(ReadEvent::Failed(reason)) => break PumpExit::ReadFailed(reason),
            None => break PumpExit::StreamEnded,
        }
    };

    match &exit {
        PumpExit::Cancelled => {
            debug!(
                "[pump:{}] Cancelled after {} chunks, {} bytes",
                session_id, chunk_count, total_bytes
            );
        }
        PumpExit::StreamEnded => {
            let tail = String::from_utf8_lossy(&utf8_buffer).into_owned();
            let mut segments = decoder.decode_segments(&tail);
            let held_back = decoder.flush();
            if !held_back.is_empty() {
                segments.push(Segment::Text(held_back));
            }
            project(&session, &subscribers, segments, mode);

            info!(
                "[pump:{}] End of stream after {} chunks, {} bytes",
                session_id, chunk_count, total_bytes
            );

            let status = session.wait_for_exit().await;
            if !cancel.is_cancelled() && session.status() == SessionStatus::Connected {
                match status {
                    Some(status) if !status.success() => {
                        session.fail(format!("process exited with status {}", status.code));
                    }
                    _ => {
                        session.transition(SessionStatus::Disconnected, None);
                    }
                }
            }
            session.teardown();
        }
        PumpExit::ReadFailed(reason) => {
            if !cancel.is_cancelled() {
                session.fail(format!("read failed: {}", reason));
            }
            session.teardown();
        }
    }

    exit
}
