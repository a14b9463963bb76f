//! devmux-session: Remote shell sessions for the devmux dashboard
//!
//! Each session runs a remote shell command (by default `ssh -tt <target>`)
//! on a pseudo-terminal. Its output is pumped through the
//! [`devmux_terminal`] decoder and append engine into a per-session
//! `TerminalBuffer`; keystrokes flow back through a dedicated writer thread.
//!
//! [`SessionManager`] is the entry point: it owns the session catalog, the
//! buffer-change subscriptions and the event broadcast channel.

pub mod config;
pub mod error;
pub mod manager;
pub mod process;
pub mod pump;
pub mod session;
pub mod subscription;

pub use config::{ConfigError, EngineConfig, OutputMode, RemoteShellCommand, ResizeStrategy, SizeConfig};
pub use error::{SessionError, SessionResult};
pub use manager::SessionManager;
pub use process::{ProcessExit, ProcessHandle, ProcessSpawner, PtySpawner, SpawnRequest, SpawnedProcess};
pub use pump::PumpExit;
pub use session::{
    resize_report, RemoteSession, SessionEvent, SessionId, SessionInfo, SessionStatus, SharedBuffer,
};
pub use subscription::{BufferChangeHandler, SubscriptionId};

pub use devmux_terminal::{ClearMode, TerminalSize};
