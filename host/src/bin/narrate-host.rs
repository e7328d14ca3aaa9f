use anyhow::{Context, Result};
use clap::Parser;
use narrate_core::{get_default_config_file, HostConfig};
use narrate_host::{logging, Dispatcher};
use narrate_ipc::{FrameReader, MessageSender};
use std::path::PathBuf;
use tracing::{debug, error, info, warn, Level};

#[derive(Parser, Debug)]
#[command(
    name = "narrate-host",
    about = "Native messaging host for the Narrate AI Core TTS backend"
)]
struct Args {
    /// Origin of the calling extension, passed by the browser
    caller: Vec<String>,

    /// Handle of the calling browser window (Windows only)
    #[arg(long)]
    parent_window: Option<String>,

    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Override the diagnostic log file location
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<HostConfig> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => get_default_config_file().context("Failed to locate config file")?,
    };
    HostConfig::load_from_file(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let configured_level = config.log_level.as_deref().and_then(logging::parse_level);
    let level = if args.verbose {
        Level::DEBUG
    } else {
        configured_level.unwrap_or(Level::INFO)
    };
    let log_file = args.log_file.clone().unwrap_or_else(|| config.log_file());
    let fallback = logging::init(&log_file, level)
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;

    info!("--- Host started ---");
    if let Some(e) = fallback {
        warn!("Could not open {}, logging to stderr: {}", log_file.display(), e);
    }
    info!("Caller: {:?}, parent window: {:?}", args.caller, args.parent_window);
    debug!("Configuration: {:#?}", config);

    let sender = MessageSender::new(tokio::io::stdout());
    let reader = FrameReader::new(tokio::io::stdin());
    let dispatcher = Dispatcher::new(config, sender);

    match dispatcher.run(reader).await {
        Ok(()) => {
            info!("--- Host exiting ---");
            Ok(())
        }
        Err(e) => {
            error!("Host stopped on channel failure: {}", e);
            // The stdin reader may still be parked on a blocking read, which
            // would hold up runtime shutdown.
            std::process::exit(1);
        }
    }
}
