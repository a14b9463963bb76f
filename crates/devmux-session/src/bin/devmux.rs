use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use devmux_session::{EngineConfig, PtySpawner, SessionEvent, SessionManager, TerminalSize};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "devmux", about = "Remote development session terminal engine")]
#[command(version)]
struct Cli {
    /// Engine config file (JSON)
    #[arg(long, env = "DEVMUX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a target, optionally send input, and print the visible screen
    #[command(alias = "c")]
    Capture(CaptureArgs),

    /// Print the effective configuration as JSON
    Config,
}

#[derive(Args, Debug)]
struct CaptureArgs {
    /// Owner id recorded on the session
    #[arg(long, default_value = "cli")]
    owner: String,

    /// Target id substituted into the remote shell command
    #[arg(long)]
    target: String,

    /// Terminal columns (defaults to the configured size)
    #[arg(long)]
    cols: Option<u16>,

    /// Terminal rows (defaults to the configured size)
    #[arg(long)]
    rows: Option<u16>,

    /// Text to send after connecting; a newline is appended
    #[arg(long)]
    send: Option<String>,

    /// How long to collect output before capturing
    #[arg(long, default_value_t = 1000)]
    wait_ms: u64,

    /// Print the session snapshot and lines as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Capture {
    session: devmux_session::SessionInfo,
    lines: Vec<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("Failed to load config")?;

    match cli.command {
        Command::Config => print_json(&config)?,
        Command::Capture(args) => capture(config, args).await?,
    }
    Ok(())
}

async fn capture(config: EngineConfig, args: CaptureArgs) -> anyhow::Result<()> {
    let default_size = TerminalSize::from(config.default_size);
    let size = TerminalSize::new(
        args.cols.unwrap_or(default_size.cols),
        args.rows.unwrap_or(default_size.rows),
    );

    let manager = SessionManager::new(config, Arc::new(PtySpawner::new()));
    let mut events = manager.subscribe_events();

    let info = manager
        .connect_to_target(&args.owner, &args.target, Some(size))
        .await
        .with_context(|| format!("Failed to connect to {}", args.target))?;
    let id = info.id;

    if let Some(text) = &args.send {
        manager
            .send_keystroke(id, format!("{}\n", text))
            .context("Failed to send input")?;
    }

    // Collect output until the wait elapses or the session ends
    let deadline = tokio::time::sleep(Duration::from_millis(args.wait_ms));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(SessionEvent::StatusChanged { id: changed, status, .. })
                    if changed == id && status.is_terminal() => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    let lines = manager.get_visible_lines(id, None)?;
    let session = manager
        .get_session_info(id)
        .context("Session vanished before capture")?;
    manager.disconnect_session(id).await?;

    if args.json {
        print_json(&Capture { session, lines })?;
    } else {
        let end = lines
            .iter()
            .rposition(|line| !line.trim_end().is_empty())
            .map_or(0, |last| last + 1);
        for line in &lines[..end] {
            println!("{}", line.trim_end());
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
