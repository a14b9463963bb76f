//! RemoteSession: one remote shell, its channels, and its status.

use std::io::Write as IoWrite;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use devmux_terminal::{TerminalBuffer, TerminalSize};
use parking_lot::{Mutex, RwLock};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::{EngineConfig, ResizeStrategy};
use crate::error::{SessionError, SessionResult};
use crate::process::{ProcessExit, ProcessHandle, SpawnRequest, SpawnedProcess};
use crate::pump::PumpExit;

pub type SessionId = Uuid;

/// A session's buffer, shared between its pump and readers.
pub type SharedBuffer = Arc<RwLock<TerminalBuffer>>;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const EXIT_POLL_ATTEMPTS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl SessionStatus {
    /// `Disconnected` and `Error` are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Disconnected | SessionStatus::Error)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Connecting, Connected) | (Connecting, Error) | (Connected, Disconnected) | (Connected, Error)
        )
    }
}

/// Notifications published on the manager's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StatusChanged {
        id: SessionId,
        status: SessionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// The buffer changed; `generation` is its new generation.
    Output { id: SessionId, generation: u64 },
    WorkingDirectoryChanged { id: SessionId, path: String },
    /// The session left the catalog.
    Removed { id: SessionId },
}

/// Serializable snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub owner_id: String,
    pub target_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub working_directory: Option<String>,
    pub last_error: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub pid: Option<u32>,
    pub title: Option<String>,
}

struct SessionState {
    status: SessionStatus,
    last_activity: DateTime<Utc>,
    working_directory: Option<String>,
    last_error: Option<String>,
    size: TerminalSize,
    pid: Option<u32>,
}

/// Handles released together by [`RemoteSession::teardown`].
#[derive(Default)]
struct SessionResources {
    input_tx: Option<SyncSender<Vec<u8>>>,
    handle: Option<Box<dyn ProcessHandle>>,
    pump: Option<JoinHandle<PumpExit>>,
}

pub struct RemoteSession {
    id: SessionId,
    owner_id: String,
    target_id: String,
    created_at: DateTime<Utc>,
    resize_strategy: ResizeStrategy,
    state: RwLock<SessionState>,
    resources: Mutex<SessionResources>,
    buffer: SharedBuffer,
    cancel: CancellationToken,
    events: broadcast::Sender<SessionEvent>,
}

impl RemoteSession {
    /// A new session in `Connecting`.
    pub fn new(
        owner_id: &str,
        target_id: &str,
        size: TerminalSize,
        config: &EngineConfig,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let now = Utc::now();
        let buffer = TerminalBuffer::with_size(size).with_max_buffer_lines(config.max_buffer_lines);
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            target_id: target_id.to_string(),
            created_at: now,
            resize_strategy: config.resize_strategy,
            state: RwLock::new(SessionState {
                status: SessionStatus::Connecting,
                last_activity: now,
                working_directory: config.working_directory.clone(),
                last_error: None,
                size: buffer.size(),
                pid: None,
            }),
            resources: Mutex::new(SessionResources::default()),
            buffer: Arc::new(RwLock::new(buffer)),
            cancel: CancellationToken::new(),
            events,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn status(&self) -> SessionStatus {
        self.state.read().status
    }

    pub fn size(&self) -> TerminalSize {
        self.state.read().size
    }

    pub fn working_directory(&self) -> Option<String> {
        self.state.read().working_directory.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn events(&self) -> &broadcast::Sender<SessionEvent> {
        &self.events
    }

    pub fn info(&self) -> SessionInfo {
        let title = self.buffer.read().title().map(str::to_string);
        let state = self.state.read();
        SessionInfo {
            id: self.id,
            owner_id: self.owner_id.clone(),
            target_id: self.target_id.clone(),
            status: state.status,
            created_at: self.created_at,
            last_activity: state.last_activity,
            working_directory: state.working_directory.clone(),
            last_error: state.last_error.clone(),
            cols: state.size.cols,
            rows: state.size.rows,
            pid: state.pid,
            title,
        }
    }

    /// The command line for this session's remote shell.
    pub fn spawn_request(&self, config: &EngineConfig) -> SpawnRequest {
        let shell = &config.remote_shell;
        SpawnRequest {
            program: shell.program.clone(),
            args: shell.args_for(&self.target_id),
            env: shell.env.clone(),
            cwd: config.working_directory.as_ref().map(PathBuf::from),
            size: self.size(),
        }
    }

    // ===== Status =====

    /// Move to `next` if the state machine allows it. Returns whether the
    /// status changed.
    pub(crate) fn transition(&self, next: SessionStatus, error: Option<String>) -> bool {
        {
            let mut state = self.state.write();
            if !state.status.can_transition_to(next) {
                warn!(
                    "[session:{}] Rejected status transition {:?} -> {:?}",
                    self.id, state.status, next
                );
                return false;
            }
            state.status = next;
            if error.is_some() {
                state.last_error = error.clone();
            }
        }

        match &error {
            Some(reason) => error!("[session:{}] Status -> {:?}: {}", self.id, next, reason),
            None => info!("[session:{}] Status -> {:?}", self.id, next),
        }
        let _ = self.events.send(SessionEvent::StatusChanged {
            id: self.id,
            status: next,
            error,
        });
        true
    }

    /// Record a failure and move to `Error`.
    pub(crate) fn fail(&self, reason: impl Into<String>) -> bool {
        self.transition(SessionStatus::Error, Some(reason.into()))
    }

    pub(crate) fn touch(&self) {
        self.state.write().last_activity = Utc::now();
    }

    pub(crate) fn set_working_directory(&self, path: String) {
        {
            let mut state = self.state.write();
            if state.working_directory.as_deref() == Some(path.as_str()) {
                return;
            }
            state.working_directory = Some(path.clone());
        }
        debug!("[session:{}] Working directory: {}", self.id, path);
        let _ = self
            .events
            .send(SessionEvent::WorkingDirectoryChanged { id: self.id, path });
    }

    // ===== Lifecycle =====

    /// Take ownership of a freshly spawned process: start the writer thread,
    /// keep the handle, and move to `Connected`. Returns the output stream for
    /// the pump.
    pub(crate) fn attach(
        self: &Arc<Self>,
        spawned: SpawnedProcess,
        config: &EngineConfig,
    ) -> Box<dyn std::io::Read + Send> {
        let SpawnedProcess {
            input,
            output,
            handle,
        } = spawned;

        let pid = handle.process_id();
        let (input_tx, input_rx) = std::sync::mpsc::sync_channel(config.input_channel_capacity);
        spawn_writer_thread(
            self.id,
            Arc::downgrade(self),
            input,
            input_rx,
            config.write_chunk_size,
        );

        {
            let mut resources = self.resources.lock();
            resources.input_tx = Some(input_tx);
            resources.handle = Some(handle);
        }
        self.state.write().pid = pid;

        info!(
            "[session:{}] Attached to process {:?} for target {}",
            self.id, pid, self.target_id
        );
        self.transition(SessionStatus::Connected, None);
        output
    }

    pub(crate) fn set_pump(&self, pump: JoinHandle<PumpExit>) {
        self.resources.lock().pump = Some(pump);
    }

    pub(crate) fn take_pump(&self) -> Option<JoinHandle<PumpExit>> {
        self.resources.lock().pump.take()
    }

    /// Release every resource: cancel the pump, close input, terminate the
    /// process. Safe to call from any exit path, any number of times.
    pub(crate) fn teardown(&self) {
        self.cancel.cancel();
        // Wait out any in-flight buffer mutation; later ones observe the
        // cancellation under the lock.
        drop(self.buffer.write());

        let (input_tx, handle) = {
            let mut resources = self.resources.lock();
            (resources.input_tx.take(), resources.handle.take())
        };
        let released = input_tx.is_some() || handle.is_some();
        drop(input_tx);

        if let Some(mut handle) = handle {
            if let Err(e) = handle.terminate() {
                warn!("[session:{}] Failed to terminate process: {}", self.id, e);
            }
        }
        if released {
            info!("[session:{}] Resources released", self.id);
        }
    }

    /// Close the session gracefully. No-op on a terminated session beyond
    /// releasing anything still held.
    pub fn disconnect(&self) {
        if self.status().is_active() {
            self.transition(SessionStatus::Disconnected, None);
        }
        self.teardown();
    }

    /// Poll for the process exit status for a short while.
    pub(crate) async fn wait_for_exit(&self) -> Option<ProcessExit> {
        for attempt in 0..EXIT_POLL_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
            let mut resources = self.resources.lock();
            let handle = resources.handle.as_mut()?;
            match handle.try_wait() {
                Ok(Some(exit)) => return Some(exit),
                Ok(None) => {}
                Err(e) => {
                    warn!("[session:{}] Failed to query exit status: {}", self.id, e);
                    return None;
                }
            }
        }
        None
    }

    // ===== Input =====

    /// Queue raw bytes for the remote shell. Blocks while the input channel is
    /// full.
    pub fn send_keystroke(&self, data: &[u8]) -> SessionResult<()> {
        let input_tx = self
            .resources
            .lock()
            .input_tx
            .clone()
            .ok_or(SessionError::NoInputChannel(self.id))?;

        if data.len() > 100 {
            debug!("[session:{}] Queueing large input: {} bytes", self.id, data.len());
        }
        input_tx.send(data.to_vec()).map_err(|e| {
            error!("[session:{}] Input channel send failed: {}", self.id, e);
            SessionError::NoInputChannel(self.id)
        })?;
        self.touch();
        Ok(())
    }

    /// Resize the remote terminal and the local buffer.
    pub fn resize(&self, size: TerminalSize) -> SessionResult<()> {
        let size = TerminalSize::new(size.cols, size.rows);

        if self.resize_strategy.writes_escape_report() {
            self.send_keystroke(resize_report(size).as_bytes())?;
        }
        if self.resize_strategy.resizes_pty() {
            let mut resources = self.resources.lock();
            let handle = resources.handle.as_mut().ok_or_else(|| SessionError::Resize {
                id: self.id,
                reason: "process released".to_string(),
            })?;
            handle.resize(size).map_err(|e| SessionError::Resize {
                id: self.id,
                reason: e.to_string(),
            })?;
        }

        self.buffer.write().resize(size.cols, size.rows);
        self.state.write().size = size;
        debug!("[session:{}] Resized to {}x{}", self.id, size.cols, size.rows);
        Ok(())
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The xterm window-size report `CSI 8 ; rows ; cols t`.
pub fn resize_report(size: TerminalSize) -> String {
    format!("\x1b[8;{};{}t", size.rows, size.cols)
}

/// Extract the path from an OSC 7 payload (`7;file://host/path`). The host
/// is the remote machine, so the path is taken as-is rather than resolved
/// locally.
pub fn working_directory_from_osc(payload: &str) -> Option<String> {
    let location = Url::parse(payload.strip_prefix("7;")?).ok()?;
    if location.scheme() != "file" {
        return None;
    }
    Some(
        percent_decode_str(location.path())
            .decode_utf8_lossy()
            .into_owned(),
    )
}

/// Dedicated writer thread: drains the input channel into the process in
/// small chunks so a large paste never stalls the PTY.
fn spawn_writer_thread(
    session_id: SessionId,
    session: Weak<RemoteSession>,
    mut writer: Box<dyn IoWrite + Send>,
    input_rx: Receiver<Vec<u8>>,
    chunk_size: usize,
) {
    std::thread::spawn(move || {
        debug!("[writer:{}] Writer thread started", session_id);

        let mut total_bytes_written: usize = 0;
        let mut message_count: usize = 0;

        while let Ok(data) = input_rx.recv() {
            message_count += 1;
            for chunk in data.chunks(chunk_size.max(1)) {
                let result = writer.write_all(chunk).and_then(|_| writer.flush());
                if let Err(e) = result {
                    error!(
                        "[writer:{}] Write error: {} (errno: {:?})",
                        session_id,
                        e,
                        e.raw_os_error()
                    );
                    if let Some(session) = session.upgrade() {
                        session.fail(format!("write failed: {}", e));
                        session.teardown();
                    }
                    return;
                }
                std::thread::yield_now();
            }
            total_bytes_written += data.len();
        }

        debug!(
            "[writer:{}] Writer thread finished (channel closed). Total: {} messages, {} bytes",
            session_id, message_count, total_bytes_written
        );
    });
}
