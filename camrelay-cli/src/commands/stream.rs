//! Stream command - run a session and drive it from stdin

use anyhow::{Context, Result};
use clap::Args;
use camrelay_core::capture::PatternSourceProvider;
use camrelay_core::config::descriptor_from_file;
use camrelay_core::{
    CamrelayError, FacingMode, Resolution, Session, SessionConfig, SessionState,
    SourceDescriptor, WsConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

/// How often the source is checked for having ended
const WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Arguments for the stream command
#[derive(Args)]
pub struct StreamArgs {
    /// Receiver host and port (e.g., "192.168.1.20:8080")
    #[arg(long)]
    host: Option<String>,

    /// Connect with wss:// instead of ws://
    #[arg(long)]
    secure: bool,

    /// Camera to start with (user, environment)
    #[arg(short, long)]
    facing: Option<String>,

    /// Requested capture resolution (e.g., "1280x720")
    #[arg(short, long)]
    resolution: Option<String>,

    /// Sample frames at refresh rate instead of using frame events
    #[arg(long)]
    poll: bool,

    /// FFmpeg encoder backend (e.g., "libx264", "h264_nvenc")
    #[arg(short, long)]
    backend: Option<String>,

    /// Config file to read instead of the default one
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// A command typed while streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiveCommand {
    Camera(FacingMode),
    Resolution(Resolution),
    Stats,
    Stop,
}

impl std::str::FromStr for LiveCommand {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default().to_lowercase();
        let argument = words.next();

        match (command.as_str(), argument) {
            ("camera" | "cam", Some(facing)) => facing.parse().map(Self::Camera),
            ("res" | "resolution", Some(size)) => size.parse().map(Self::Resolution),
            ("stats", None) => Ok(Self::Stats),
            ("stop" | "quit", None) => Ok(Self::Stop),
            _ => Err(format!(
                "Unknown command '{}'. Commands: camera <user|environment>, res <WxH>, stats, stop",
                line.trim()
            )),
        }
    }
}

/// Start a session and stream until stopped
pub async fn stream(args: StreamArgs) -> Result<()> {
    let mut file = super::load_config(args.config)?;
    if let Some(host) = args.host {
        file.server.host = host;
    }
    if args.secure {
        file.server.secure = true;
    }
    if let Some(facing) = args.facing {
        file.capture.facing = facing;
    }
    if let Some(resolution) = args.resolution {
        file.capture.resolution = resolution;
    }
    if args.poll {
        file.capture.delivery = "poll".to_string();
    }
    if let Some(backend) = args.backend {
        file.encoder.backend = backend;
    }

    let config = SessionConfig::from_file(&file).context("Invalid configuration")?;
    config.validate().context("Invalid configuration")?;
    let descriptor = descriptor_from_file(&file).context("Invalid capture settings")?;
    let encoders = super::encoder_provider(&file.encoder.backend)?;

    println!("camrelay - Starting Stream\n");
    println!("Configuration:");
    println!("  Receiver:    {}", config.endpoint);
    println!("  Camera:      {}", descriptor.facing);
    println!("  Resolution:  {}", descriptor.resolution());
    println!("  Encoder:     {}", encoders.name());
    println!("  Keyframes:   every {} frames", config.keyframes.interval());
    println!();

    let mut session = Session::new(
        config,
        Arc::new(PatternSourceProvider::new()),
        encoders,
        Arc::new(WsConnector),
    );

    if let Err(e) = session.start(descriptor).await {
        report(&e);
        session.stop().await?;
        return Err(e).context("Failed to start streaming");
    }

    if let Some(candidate) = session.active_candidate() {
        println!("Streaming with {}", candidate);
    }
    println!("Commands: camera <user|environment>, res <WxH>, stats, stop");
    println!("Press Ctrl+C to stop...\n");

    let result = drive(&mut session).await;

    println!("Stopping stream...");
    let stats = session.stats();
    session.stop().await?;
    println!("Stream stopped. {}", stats);

    result
}

/// Handle stdin commands until stopped, interrupted or the source ends
async fn drive(session: &mut Session) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut watch = tokio::time::interval(WATCH_INTERVAL);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("\nReceived interrupt signal...");
                return Ok(());
            }
            line = lines.next_line(), if stdin_open => {
                let line = match line.context("Failed to read stdin")? {
                    Some(line) => line,
                    None => {
                        info!("stdin closed, streaming until interrupted");
                        stdin_open = false;
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let command = match line.parse::<LiveCommand>() {
                    Ok(command) => command,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };

                if !apply(session, command).await? {
                    return Ok(());
                }
            }
            _ = watch.tick() => {
                if session.feed_finished() {
                    println!("Camera stopped delivering frames");
                    return Ok(());
                }
            }
        }
    }
}

/// Apply a live command; false when streaming should end
async fn apply(session: &mut Session, command: LiveCommand) -> Result<bool> {
    let current = session
        .descriptor()
        .context("Session has no active source")?;

    let next = match command {
        LiveCommand::Stop => return Ok(false),
        LiveCommand::Stats => {
            println!("{}", session.stats());
            return Ok(true);
        }
        LiveCommand::Camera(facing) => {
            SourceDescriptor::new(facing, current.width, current.height)
        }
        LiveCommand::Resolution(resolution) => {
            SourceDescriptor::new(current.facing, resolution.width, resolution.height)
        }
    };

    if next == current {
        println!("Already streaming {}", current);
        return Ok(true);
    }

    match session.reconfigure(next).await {
        Ok(()) => {
            if let Some(candidate) = session.active_candidate() {
                println!("Switched to {} with {}", next, candidate);
            }
            Ok(true)
        }
        Err(e) => {
            report(&e);
            if session.state() == SessionState::Failed {
                return Err(e).context("Reconfiguration failed");
            }
            Ok(true)
        }
    }
}

/// Print an error with its hint, if any
fn report(e: &CamrelayError) {
    warn!("{}", e);
    eprintln!("Error: {}", e);
    if let Some(hint) = e.user_hint() {
        eprintln!("Hint: {}", hint);
    }
}
