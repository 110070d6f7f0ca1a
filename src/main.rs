use anyhow::Result;
use clap::Parser;
use process_lurker::logging::init_logging;
use process_lurker::{Config, ProcessWatcher};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Exit status when no candidate process appeared in time
const EXIT_TIMED_OUT: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "lurker")]
#[command(about = "Wait for a process you didn't launch to start, and optionally to exit", long_about = None)]
struct Args {
    /// Process names to watch for, highest priority first
    #[arg(required = true)]
    names: Vec<String>,

    /// Give up if no process appears within this many milliseconds
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Keep running until the process exits, then print "closed"
    #[arg(short = 'x', long)]
    wait_for_exit: bool,

    /// Wait until the process shows its main window
    #[arg(short = 'w', long)]
    wait_for_window: bool,

    /// Config file (default: searched in the usual locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.json);

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    let mut options = config.wait.to_options();
    options.wait_for_exit |= args.wait_for_exit;
    options.wait_for_window |= args.wait_for_window;
    if let Some(ms) = args.timeout_ms {
        options.timeout = Some(Duration::from_millis(ms));
    }

    let watcher = ProcessWatcher::builder(args.names)
        .config(config.watcher)
        .build();
    let mut closed = watcher.subscribe();

    let pid = tokio::select! {
        pid = watcher.wait(options.clone()) => pid,
        _ = tokio::signal::ctrl_c() => {
            watcher.dispose();
            return Ok(ExitCode::from(EXIT_INTERRUPTED));
        }
    };

    let Some(pid) = pid else {
        tracing::info!(event = "lurker.not_found", names = ?watcher.names());
        return Ok(ExitCode::from(EXIT_TIMED_OUT));
    };
    println!("{pid}");

    if options.wait_for_exit {
        tokio::select! {
            received = closed.recv() => match received {
                Ok(_) | Err(RecvError::Lagged(_)) => println!("closed"),
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                watcher.dispose();
                return Ok(ExitCode::from(EXIT_INTERRUPTED));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
