use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use devmux_session::{
    ClearMode, EngineConfig, ProcessExit, ProcessHandle, ProcessSpawner, PtySpawner,
    RemoteShellCommand, ResizeStrategy, SessionError, SessionEvent, SessionId, SessionManager,
    SessionStatus, SpawnRequest, SpawnedProcess, TerminalSize,
};
use parking_lot::Mutex;

// =============================================================================
// Scripted process
// =============================================================================

/// Test-side controls for one fake remote shell.
#[derive(Clone)]
struct FakeRemote {
    output: Sender<Vec<u8>>,
    input: Arc<Mutex<Vec<u8>>>,
    exit_code: Arc<Mutex<Option<u32>>>,
    closed: Arc<AtomicBool>,
    resized: Arc<Mutex<Vec<TerminalSize>>>,
    read_fault: Arc<Mutex<Option<i32>>>,
    write_fault: Arc<AtomicBool>,
}

impl FakeRemote {
    fn emit(&self, text: &str) {
        let _ = self.output.send(text.as_bytes().to_vec());
    }

    fn emit_bytes(&self, bytes: &[u8]) {
        let _ = self.output.send(bytes.to_vec());
    }

    /// End the output stream with `code` as the exit status.
    fn exit(&self, code: u32) {
        *self.exit_code.lock() = Some(code);
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Make the next idle read fail with OS error `errno`.
    fn fail_reads(&self, errno: i32) {
        *self.read_fault.lock() = Some(errno);
    }

    fn break_input(&self) {
        self.write_fault.store(true, Ordering::SeqCst);
    }

    fn input_text(&self) -> String {
        String::from_utf8_lossy(&self.input.lock()).into_owned()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    closed: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<i32>>>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.drain(..n);
                return Ok(n);
            }
            match self.rx.recv_timeout(Duration::from_millis(20)) {
                Ok(data) => self.pending = data,
                Err(RecvTimeoutError::Timeout) if self.fault.lock().is_some() => {
                    let errno = self.fault.lock().take().unwrap_or(libc::EIO);
                    return Err(io::Error::from_raw_os_error(errno));
                }
                Err(RecvTimeoutError::Timeout) if self.closed.load(Ordering::SeqCst) => return Ok(0),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
    }
}

struct RecordingWriter {
    input: Arc<Mutex<Vec<u8>>>,
    fault: Arc<AtomicBool>,
}

impl Write for RecordingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fault.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        self.input.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct FakeHandle(FakeRemote);

impl ProcessHandle for FakeHandle {
    fn process_id(&self) -> Option<u32> {
        Some(4242)
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        if !self.0.is_closed() {
            return Ok(None);
        }
        let code = self.0.exit_code.lock().unwrap_or(0);
        Ok(Some(ProcessExit { code }))
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.0.exit_code.lock().get_or_insert(0);
        self.0.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resize(&mut self, size: TerminalSize) -> io::Result<()> {
        self.0.resized.lock().push(size);
        Ok(())
    }
}

#[derive(Default)]
struct FakeSpawner {
    fail_with: Option<String>,
    remotes: Mutex<Vec<FakeRemote>>,
    requests: Mutex<Vec<SpawnRequest>>,
}

impl FakeSpawner {
    fn failing(reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_string()),
            ..Default::default()
        }
    }

    fn last_remote(&self) -> FakeRemote {
        self.remotes.lock().last().cloned().expect("no process spawned")
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedProcess> {
        self.requests.lock().push(request.clone());
        if let Some(reason) = &self.fail_with {
            return Err(io::Error::other(reason.clone()));
        }

        let (output, rx) = mpsc::channel();
        let remote = FakeRemote {
            output,
            input: Arc::default(),
            exit_code: Arc::default(),
            closed: Arc::default(),
            resized: Arc::default(),
            read_fault: Arc::default(),
            write_fault: Arc::default(),
        };
        self.remotes.lock().push(remote.clone());

        Ok(SpawnedProcess {
            input: Box::new(RecordingWriter {
                input: remote.input.clone(),
                fault: remote.write_fault.clone(),
            }),
            output: Box::new(ChannelReader {
                rx,
                pending: Vec::new(),
                closed: remote.closed.clone(),
                fault: remote.read_fault.clone(),
            }),
            handle: Box::new(FakeHandle(remote)),
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn manager_with(spawner: Arc<FakeSpawner>, config: EngineConfig) -> SessionManager {
    SessionManager::new(config, spawner)
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn connect(manager: &SessionManager) -> SessionId {
    manager
        .connect_to_target("owner-1", "box-1", Some(TerminalSize::new(80, 24)))
        .await
        .expect("connect")
        .id
}

fn lines(manager: &SessionManager, id: SessionId, rows: usize) -> Vec<String> {
    manager.get_visible_lines(id, Some(rows)).unwrap()
}

// =============================================================================
// Connection lifecycle
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_spawn_yields_connection_error_and_error_status() {
    let spawner = Arc::new(FakeSpawner::failing("no route to host"));
    let manager = manager_with(spawner.clone(), EngineConfig::default());
    let mut events = manager.subscribe_events();

    let err = manager
        .connect_to_target("owner-1", "box-404", None)
        .await
        .unwrap_err();

    match err {
        SessionError::Connection { target_id, reason } => {
            assert_eq!(target_id, "box-404");
            assert!(reason.contains("no route to host"), "reason: {}", reason);
        }
        other => panic!("expected connection error, got {:?}", other),
    }

    let mut reported = None;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StatusChanged {
            status: SessionStatus::Error,
            error,
            ..
        } = event
        {
            reported = error;
        }
    }
    assert!(reported.is_some(), "expected an error status event");
    assert!(manager.get_active_sessions().is_empty());
    assert!(manager.list_sessions().is_empty(), "failed sessions never enter the catalog");
}

#[tokio::test]
async fn keystroke_to_unknown_session_is_not_found() {
    let manager = manager_with(Arc::new(FakeSpawner::default()), EngineConfig::default());
    let id = SessionId::new_v4();

    let err = manager.send_keystroke(id, "ls\n").unwrap_err();
    assert!(matches!(err, SessionError::NotFound(missing) if missing == id));
    assert!(matches!(
        manager.get_visible_lines(id, None),
        Err(SessionError::NotFound(_))
    ));
    assert_eq!(manager.get_session_status(id), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_builds_remote_command_and_reports_connected() {
    let spawner = Arc::new(FakeSpawner::default());
    let manager = manager_with(spawner.clone(), EngineConfig::default());

    let info = manager
        .connect_to_target("owner-1", "box-1", Some(TerminalSize::new(100, 30)))
        .await
        .unwrap();

    assert_eq!(info.status, SessionStatus::Connected);
    assert_eq!(info.owner_id, "owner-1");
    assert_eq!((info.cols, info.rows), (100, 30));
    assert_eq!(info.pid, Some(4242));

    let request = spawner.requests.lock()[0].clone();
    assert_eq!(request.program, "ssh");
    assert_eq!(request.args, vec!["-tt", "box-1"]);
    assert_eq!(request.size, TerminalSize::new(100, 30));

    let active = manager.get_active_sessions();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, info.id);

    manager.shutdown().await;
    assert!(manager.list_sessions().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_is_idempotent_and_releases_the_process() {
    let spawner = Arc::new(FakeSpawner::default());
    let manager = manager_with(spawner.clone(), EngineConfig::default());
    let mut events = manager.subscribe_events();
    let id = connect(&manager).await;
    let remote = spawner.last_remote();

    manager.disconnect_session(id).await.unwrap();
    assert!(remote.is_closed(), "process should be terminated");
    assert_eq!(manager.get_session_status(id), None);

    manager
        .disconnect_session(id)
        .await
        .expect("second disconnect must not fail");

    let mut saw_disconnected = false;
    let mut saw_removed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::StatusChanged {
                status: SessionStatus::Disconnected,
                ..
            } => saw_disconnected = true,
            SessionEvent::Removed { id: removed } if removed == id => saw_removed = true,
            _ => {}
        }
    }
    assert!(saw_disconnected && saw_removed);

    assert!(matches!(
        manager.send_keystroke(id, "x"),
        Err(SessionError::NotFound(_))
    ));
}

// =============================================================================
// Output pump
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn output_chunks_are_applied_in_order() {
    let spawner = Arc::new(FakeSpawner::default());
    let manager = manager_with(spawner.clone(), EngineConfig::default());
    let id = connect(&manager).await;
    let remote = spawner.last_remote();

    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    manager
        .subscribe_to_buffer_changes(
            id,
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    remote.emit("line1\npar");
    remote.emit("tial\n\x1b[1;3");
    remote.emit("1mred\x1b[0m\r\n");
    remote.emit("\rfirst\rsecond\rthird");

    assert!(
        wait_until(|| lines(&manager, id, 4) == vec!["line1", "partial", "red", "third"]).await,
        "got {:?}",
        lines(&manager, id, 4)
    );
    assert!(notified.load(Ordering::SeqCst) > 0);

    let buffer = manager.buffer(id).unwrap();
    let styled = buffer.read().cell(2, 0).copied().unwrap();
    assert!(styled.attributes.bold, "SGR split across chunks still applies");

    manager.disconnect_session(id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multibyte_characters_survive_chunk_splits() {
    let spawner = Arc::new(FakeSpawner::default());
    let manager = manager_with(spawner.clone(), EngineConfig::default());
    let id = connect(&manager).await;
    let remote = spawner.last_remote();

    let bytes = "naïve 日本\n".as_bytes();
    remote.emit_bytes(&bytes[..3]);
    remote.emit_bytes(&bytes[3..8]);
    remote.emit_bytes(&bytes[8..]);

    assert!(wait_until(|| lines(&manager, id, 1) == vec!["naïve 日本"]).await);
    manager.disconnect_session(id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clean_exit_disconnects_and_nonzero_exit_errors() {
    let spawner = Arc::new(FakeSpawner::default());
    let manager = manager_with(spawner.clone(), EngineConfig::default());

    let clean = connect(&manager).await;
    let remote = spawner.last_remote();
    remote.emit("bye\n");
    remote.exit(0);
    assert!(
        wait_until(|| manager.get_session_status(clean) == Some(SessionStatus::Disconnected)).await
    );
    assert_eq!(lines(&manager, clean, 1), vec!["bye"]);

    let failed = connect(&manager).await;
    let remote = spawner.last_remote();
    remote.emit("Permission denied (publickey).\r\n");
    remote.exit(255);
    assert!(wait_until(|| manager.get_session_status(failed) == Some(SessionStatus::Error)).await);

    let info = manager.get_session_info(failed).unwrap();
    assert!(info
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("status 255"));
    assert_eq!(lines(&manager, failed, 1), vec!["Permission denied (publickey)."]);

    assert!(manager.get_active_sessions().is_empty());
    assert_eq!(manager.list_sessions().len(), 2, "ended sessions stay until disconnected");
    assert!(
        wait_until(|| matches!(
            manager.send_keystroke(failed, "x"),
            Err(SessionError::NoInputChannel(_))
        ))
        .await
    );

    manager.disconnect_session(failed).await.unwrap();
    assert_eq!(manager.list_sessions().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_failure_moves_to_error_and_releases_input() {
    let spawner = Arc::new(FakeSpawner::default());
    let manager = manager_with(spawner.clone(), EngineConfig::default());
    let id = connect(&manager).await;
    let remote = spawner.last_remote();

    remote.emit("partial output\n");
    assert!(wait_until(|| lines(&manager, id, 1) == vec!["partial output"]).await);

    remote.fail_reads(libc::EBADF);
    assert!(wait_until(|| manager.get_session_status(id) == Some(SessionStatus::Error)).await);

    let expected = format!("read failed: {}", io::Error::from_raw_os_error(libc::EBADF));
    assert_eq!(
        manager.get_session_info(id).unwrap().last_error.as_deref(),
        Some(expected.as_str())
    );
    assert!(
        wait_until(|| matches!(
            manager.send_keystroke(id, "x"),
            Err(SessionError::NoInputChannel(_))
        ))
        .await
    );
    assert!(remote.is_closed(), "process should be terminated");
    assert_eq!(lines(&manager, id, 1), vec!["partial output"]);

    manager.disconnect_session(id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_failure_moves_to_error_and_releases_input() {
    let spawner = Arc::new(FakeSpawner::default());
    let manager = manager_with(spawner.clone(), EngineConfig::default());
    let mut events = manager.subscribe_events();
    let id = connect(&manager).await;
    let remote = spawner.last_remote();

    remote.break_input();
    manager.send_keystroke(id, "ls\n").unwrap();

    assert!(wait_until(|| manager.get_session_status(id) == Some(SessionStatus::Error)).await);
    assert_eq!(
        manager.get_session_info(id).unwrap().last_error.as_deref(),
        Some("write failed: pipe closed")
    );
    assert!(
        wait_until(|| matches!(
            manager.send_keystroke(id, "x"),
            Err(SessionError::NoInputChannel(_))
        ))
        .await
    );
    assert!(wait_until(|| remote.is_closed()).await);
    assert!(remote.input_text().is_empty());

    let mut reported = None;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StatusChanged {
            status: SessionStatus::Error,
            error,
            ..
        } = event
        {
            reported = error;
        }
    }
    assert_eq!(reported.as_deref(), Some("write failed: pipe closed"));

    manager.disconnect_session(id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_buffer_mutation_after_disconnect() {
    let spawner = Arc::new(FakeSpawner::default());
    let manager = manager_with(spawner.clone(), EngineConfig::default());
    let id = connect(&manager).await;
    let remote = spawner.last_remote();
    let buffer = manager.buffer(id).unwrap();

    remote.emit("before\n");
    assert!(wait_until(|| buffer.read().lines() == vec!["before"]).await);

    manager.disconnect_session(id).await.unwrap();
    let generation = buffer.read().generation();

    remote.emit("after\n");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(buffer.read().generation(), generation);
    assert_eq!(buffer.read().lines(), vec!["before"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn osc7_updates_working_directory() {
    let spawner = Arc::new(FakeSpawner::default());
    let mut config = EngineConfig::default();
    config.working_directory = Some("/tmp".to_string());
    let manager = manager_with(spawner.clone(), config);
    let mut events = manager.subscribe_events();
    let id = connect(&manager).await;
    assert_eq!(
        manager.get_session_info(id).unwrap().working_directory.as_deref(),
        Some("/tmp")
    );

    spawner
        .last_remote()
        .emit("\x1b]7;file://box-1/home/dev/src\x07$ ");

    assert!(wait_until(|| {
        manager.get_session_info(id).unwrap().working_directory.as_deref() == Some("/home/dev/src")
    })
    .await);
    assert_eq!(lines(&manager, id, 1), vec!["$ "]);

    let mut reported = None;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::WorkingDirectoryChanged { path, .. } = event {
            reported = Some(path);
        }
    }
    assert_eq!(reported.as_deref(), Some("/home/dev/src"));

    manager.disconnect_session(id).await.unwrap();
}

// =============================================================================
// Input and resize
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keystrokes_reach_the_process_in_order() {
    let spawner = Arc::new(FakeSpawner::default());
    let mut config = EngineConfig::default();
    config.write_chunk_size = 3;
    let manager = manager_with(spawner.clone(), config);
    let id = connect(&manager).await;
    let remote = spawner.last_remote();

    manager.send_keystroke(id, "echo hello\n").unwrap();
    manager.send_keystroke(id, [0x03u8]).unwrap();

    assert!(wait_until(|| remote.input_text() == "echo hello\n\x03").await);
    manager.disconnect_session(id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resize_writes_escape_report_and_resizes_buffer() {
    let spawner = Arc::new(FakeSpawner::default());
    let manager = manager_with(spawner.clone(), EngineConfig::default());
    let id = connect(&manager).await;
    let remote = spawner.last_remote();

    manager.resize_terminal(id, 120, 40).unwrap();

    assert!(wait_until(|| remote.input_text() == "\x1b[8;40;120t").await);
    assert!(remote.resized.lock().is_empty());
    let info = manager.get_session_info(id).unwrap();
    assert_eq!((info.cols, info.rows), (120, 40));
    assert_eq!(manager.get_visible_lines(id, None).unwrap().len(), 40);

    manager.disconnect_session(id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn native_resize_strategy_resizes_the_pty_only() {
    let spawner = Arc::new(FakeSpawner::default());
    let mut config = EngineConfig::default();
    config.resize_strategy = ResizeStrategy::Native;
    let manager = manager_with(spawner.clone(), config);
    let id = connect(&manager).await;
    let remote = spawner.last_remote();

    manager.resize_terminal(id, 90, 20).unwrap();

    assert_eq!(remote.resized.lock().clone(), vec![TerminalSize::new(90, 20)]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(remote.input_text().is_empty());

    manager.disconnect_session(id).await.unwrap();
}

// =============================================================================
// Subscriptions and buffer control
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscriptions_are_scoped_to_live_sessions() {
    let spawner = Arc::new(FakeSpawner::default());
    let manager = manager_with(spawner.clone(), EngineConfig::default());

    assert!(matches!(
        manager.subscribe_to_buffer_changes(SessionId::new_v4(), Arc::new(|_, _| {})),
        Err(SessionError::NotFound(_))
    ));

    let id = connect(&manager).await;
    let first = manager
        .subscribe_to_buffer_changes(id, Arc::new(|_, _| {}))
        .unwrap();
    manager
        .subscribe_to_buffer_changes(id, Arc::new(|_, _| {}))
        .unwrap();
    assert_eq!(manager.subscription_count(id), 2);

    assert!(manager.unsubscribe(first));
    assert_eq!(manager.subscription_count(id), 1);

    manager.disconnect_session(id).await.unwrap();
    assert_eq!(manager.subscription_count(id), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clear_buffer_empties_visible_lines() {
    let spawner = Arc::new(FakeSpawner::default());
    let manager = manager_with(spawner.clone(), EngineConfig::default());
    let id = connect(&manager).await;

    spawner.last_remote().emit("one\ntwo\n");
    assert!(wait_until(|| lines(&manager, id, 2) == vec!["one", "two"]).await);

    manager.clear_buffer(id, ClearMode::ScreenAndScrollback).unwrap();
    assert_eq!(lines(&manager, id, 2), vec!["", ""]);

    manager.disconnect_session(id).await.unwrap();
}

// =============================================================================
// Real PTY
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pty_shell_round_trip() {
    let config = EngineConfig {
        remote_shell: RemoteShellCommand {
            program: "/bin/sh".to_string(),
            args: Vec::new(),
            env: [("TERM".to_string(), "xterm-256color".to_string())]
                .into_iter()
                .collect(),
        },
        working_directory: Some(std::env::temp_dir().to_string_lossy().into_owned()),
        ..Default::default()
    };
    let manager = SessionManager::new(config, Arc::new(PtySpawner::new()));
    let info = manager
        .connect_to_target("owner-1", "local", None)
        .await
        .expect("spawn /bin/sh");

    manager.send_keystroke(info.id, "echo devmux-$((40+2))\n").unwrap();

    let found = wait_until(|| {
        manager
            .get_visible_lines(info.id, None)
            .unwrap()
            .iter()
            .any(|line| line.trim_end() == "devmux-42")
    })
    .await;
    assert!(found, "got {:?}", manager.get_visible_lines(info.id, None));

    manager.send_keystroke(info.id, "exit 0\n").unwrap();
    assert!(
        wait_until(|| manager.get_session_status(info.id) == Some(SessionStatus::Disconnected)).await,
        "status: {:?}",
        manager.get_session_status(info.id)
    );
    manager.disconnect_session(info.id).await.unwrap();
}
