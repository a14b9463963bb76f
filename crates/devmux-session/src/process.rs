//! Process-spawn collaborator.
//!
//! Sessions never spawn processes directly; they ask a [`ProcessSpawner`].
//! [`PtySpawner`] is the production implementation over `portable-pty`. Tests
//! substitute scripted spawners.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use devmux_terminal::TerminalSize;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tracing::warn;

/// Everything needed to start one remote shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub size: TerminalSize,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: u32,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Control over a spawned process.
pub trait ProcessHandle: Send {
    fn process_id(&self) -> Option<u32>;

    /// Exit status if the process has ended, without blocking.
    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>>;

    /// Ask the process to exit. May block briefly while it does.
    fn terminate(&mut self) -> io::Result<()>;

    fn resize(&mut self, size: TerminalSize) -> io::Result<()>;
}

/// A running process with its byte streams.
pub struct SpawnedProcess {
    /// Keystrokes go here.
    pub input: Box<dyn Write + Send>,
    /// Combined stdout and stderr.
    pub output: Box<dyn Read + Send>,
    pub handle: Box<dyn ProcessHandle>,
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedProcess>;
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn pty_error(context: &str, err: impl std::fmt::Display) -> io::Error {
    io::Error::other(format!("{}: {}", context, err))
}

/// Spawns processes on a freshly allocated pseudo-terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl PtySpawner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessSpawner for PtySpawner {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedProcess> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(request.size))
            .map_err(|e| pty_error("failed to open pty", e))?;

        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| pty_error(&format!("failed to spawn {}", request.program), e))?;
        // The child holds its own copy; ours would keep the reader from seeing EOF.
        drop(pair.slave);

        let mut process = PtyProcess {
            master: pair.master,
            child,
        };

        let streams = process
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, process.master.take_writer()?)));

        match streams {
            Ok((output, input)) => Ok(SpawnedProcess {
                input,
                output,
                handle: Box::new(process),
            }),
            Err(e) => {
                if let Err(kill_err) = process.terminate() {
                    warn!("Failed to kill half-opened process: {}", kill_err);
                }
                Err(pty_error("failed to open pty streams", e))
            }
        }
    }
}

/// A child on a PTY. Holding the master keeps the terminal alive.
struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl ProcessHandle for PtyProcess {
    fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(self.child.try_wait()?.map(|status| ProcessExit {
            code: status.exit_code(),
        }))
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.kill()
    }

    fn resize(&mut self, size: TerminalSize) -> io::Result<()> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| pty_error("failed to resize pty", e))
    }
}
