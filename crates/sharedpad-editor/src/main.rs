//! sharedpad: headless rich-text editor that stays in sync with every other
//! instance in its session.
//!
//! Reads edits from stdin, one per line. See `commands` for the syntax.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sharedpad_bus::WsBusConnection;
use sharedpad_core::SessionEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sharedpad_editor::{Command, Config, Session, SessionHandle, parse_line};

#[derive(Parser, Debug)]
#[command(name = "sharedpad")]
#[command(about = "Shared rich-text editing session")]
struct Args {
    /// Session label to join (instances with the same label share a document)
    label: Option<String>,

    /// Run isolated: join no session and stay invisible to others
    #[arg(short = 'n', long)]
    no_session: bool,

    /// WebSocket URL of the sharedpad-bus broker
    #[arg(long, env = "SHAREDPAD_BUS")]
    bus: Option<String>,

    /// Directory for the shared bootstrap segment
    #[arg(long, env = "SHAREDPAD_SHM_DIR")]
    shm_dir: Option<PathBuf>,

    /// Broadcast the whole document every N seconds (0 disables)
    #[arg(long, env = "SHAREDPAD_RESYNC_SECS")]
    resync_secs: Option<u64>,

    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr, stdout is for `:show` output
    let default_filter = if args.verbose {
        "debug,sharedpad_core=debug,sharedpad_editor=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(label) = args.label {
        config.session = label;
    }
    if let Some(bus) = args.bus {
        config.bus_url = bus;
    }
    if let Some(dir) = args.shm_dir {
        config.shm_dir = Some(dir);
    }
    if let Some(secs) = args.resync_secs {
        config.resync_secs = secs;
    }

    let (connection, inbound) = WsBusConnection::connect(&config.bus_url)
        .await
        .with_context(|| format!("Failed to connect to bus at {}", config.bus_url))?;
    let session = Session::start(
        Arc::new(connection),
        inbound,
        config.session_settings(args.no_session),
    )
    .await
    .context("Failed to join session")?;

    let _notifications = session.events().subscribe(|event| match event {
        SessionEvent::ToolbarPrimed(toolbar) => println!(
            "toolbar: font {} color {} bold {} italic {} underline {}",
            toolbar.font_descriptor, toolbar.color_hex, toolbar.bold, toolbar.italic, toolbar.underline
        ),
        SessionEvent::EventRejected { member, reason } => {
            eprintln!("rejected {member}: {reason}")
        }
        _ => {}
    });

    let (handle, commands) = SessionHandle::channel();
    tokio::spawn(read_commands(handle));

    info!("Editing. Type text, or :quit to leave.");

    tokio::select! {
        _ = session.run(commands) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down");
    Ok(())
}

/// Forward stdin lines to the session until `:quit` or end of input.
async fn read_commands(handle: SessionHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        };

        match parse_line(&line) {
            Ok(Some(Command::Edit(edit))) => {
                if handle.edit(edit).is_err() {
                    return;
                }
            }
            Ok(Some(Command::Show)) => match handle.inspect().await {
                Ok(state) => {
                    println!("{}", state.markup);
                    println!("cursor {} font {} color {}", state.cursor, state.format.font, state.format.color);
                }
                Err(_) => return,
            },
            Ok(Some(Command::Quit)) => break,
            Ok(None) => {}
            Err(e) => eprintln!("{e}"),
        }
    }
    handle.quit();
}
