//! torrent-drive-sync CLI - torrent downloads with cloud drive publishing.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use torrent_drive_sync::{
    Config, Coordinator, DriveClient, Phase, ProgressEvent, RqbitEngine, RunOptions, SessionStore,
    SyncError, SyncResult, TorrentSource, TransferRequest,
};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "torrent-drive-sync")]
#[command(about = "Download torrents and publish them to a cloud drive folder")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file (defaults apply without one)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the session file (overrides the configured location)
    #[arg(long)]
    session_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download torrents, optionally publishing them afterwards
    Download {
        /// Torrent file path or magnet link (repeatable)
        #[arg(short = 't', long = "torrent", required = true)]
        torrents: Vec<String>,

        /// Download destination directory
        #[arg(short, long)]
        destination: Option<PathBuf>,

        /// Start fresh, ignoring prior download progress
        #[arg(long)]
        no_resume: bool,

        /// Publish to the cloud drive after downloading
        #[arg(long)]
        upload: bool,

        /// Destination drive folder id (required with --upload)
        #[arg(short, long)]
        folder_id: Option<String>,

        /// Redo items and files that already exist remotely
        #[arg(long)]
        no_skip: bool,

        /// Parallel upload workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Publish local files or folders to the cloud drive
    Upload {
        /// Local file or folder to publish (repeatable)
        #[arg(short, long = "path", required = true)]
        paths: Vec<PathBuf>,

        /// Destination drive folder id
        #[arg(short, long)]
        folder_id: Option<String>,

        /// Redo items and files that already exist remotely
        #[arg(long)]
        no_skip: bool,

        /// Parallel upload workers
        #[arg(long)]
        workers: Option<usize>,

        /// Include only files matching pattern (repeatable)
        #[arg(long)]
        include: Vec<String>,

        /// Exclude files matching pattern (repeatable)
        #[arg(long)]
        exclude: Vec<String>,

        /// Preview what would be uploaded without uploading
        #[arg(long)]
        dry_run: bool,

        /// Discard prior per-item progress and start fresh
        #[arg(long)]
        no_resume: bool,
    },

    /// Show the session's per-item status
    Status,

    /// Clear the session
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), SyncError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)?;

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let session_file = cli
        .session_file
        .clone()
        .unwrap_or_else(|| config.session_file.clone());
    let store = SessionStore::new(&session_file);

    match cli.command {
        Commands::Status => handle_status(&store),

        Commands::Clear => {
            store.clear()?;
            println!("Session cleared");
            Ok(())
        }

        Commands::Download {
            torrents,
            destination,
            no_resume,
            upload,
            folder_id,
            no_skip,
            workers,
        } => {
            // Resolve sources before anything touches the network.
            let mut requests = Vec::new();
            for raw in &torrents {
                requests.push(TransferRequest::Torrent(TorrentSource::parse(raw)?));
            }

            if let Some(dest) = destination {
                config.download.destination = dest;
            }
            let config = config.with_auto_tuning();

            let options = RunOptions {
                upload,
                folder_id,
                resume: !no_resume,
                skip_existing: config.transfer.skip_existing && !no_skip,
                workers,
                ..Default::default()
            };

            let engine = RqbitEngine::new(&config.download.destination).await?;
            let mut coordinator =
                Coordinator::new(config.clone(), store, options).with_engine(Arc::new(engine));
            if upload {
                coordinator = coordinator.with_cloud(Arc::new(DriveClient::new(&config.upload)?));
            }

            run_pipeline(coordinator, requests, cli.output_json).await
        }

        Commands::Upload {
            paths,
            folder_id,
            no_skip,
            workers,
            include,
            exclude,
            dry_run,
            no_resume,
        } => {
            let requests: Vec<TransferRequest> =
                paths.into_iter().map(TransferRequest::LocalPath).collect();
            let config = config.with_auto_tuning();

            let options = RunOptions {
                upload: true,
                folder_id,
                resume: !no_resume,
                skip_existing: config.transfer.skip_existing && !no_skip,
                dry_run,
                workers,
                include,
                exclude,
            };

            let mut coordinator = Coordinator::new(config.clone(), store, options);
            if !dry_run {
                coordinator = coordinator.with_cloud(Arc::new(DriveClient::new(&config.upload)?));
            }

            run_pipeline(coordinator, requests, cli.output_json).await
        }
    }
}

/// Run the coordinator with signal handling and progress rendering, then
/// report the result.
async fn run_pipeline(
    coordinator: Coordinator,
    requests: Vec<TransferRequest>,
    output_json: bool,
) -> Result<(), SyncError> {
    let cancel_token = setup_signal_handler()?;

    let (progress_tx, progress_rx) = mpsc::channel(64);
    let renderer = spawn_progress_renderer(progress_rx);
    let coordinator = coordinator.with_progress(progress_tx);

    let result = coordinator.run(requests, cancel_token).await;
    renderer.abort();

    match result {
        Ok(result) => {
            print_summary(&result, output_json)?;
            if result.items_failed > 0 {
                return Err(SyncError::ItemsFailed(result.items_failed));
            }
            Ok(())
        }
        Err(SyncError::Cancelled) => {
            eprintln!("\nOperation cancelled. Progress has been saved; resume with the same command.");
            Err(SyncError::Cancelled)
        }
        Err(e) => Err(e),
    }
}

fn print_summary(result: &SyncResult, output_json: bool) -> Result<(), SyncError> {
    if output_json {
        println!("{}", result.to_json()?);
        return Ok(());
    }

    println!("\nTransfer finished");
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!(
        "  Items: {} total, {} completed, {} skipped, {} failed",
        result.items_total, result.items_completed, result.items_skipped, result.items_failed
    );
    for outcome in &result.outcomes {
        if outcome.phase == Phase::Failed {
            println!(
                "  Failed: {} - {}",
                outcome.name,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(())
}

fn handle_status(store: &SessionStore) -> Result<(), SyncError> {
    let state = store.load()?;

    if state.items.is_empty() {
        println!("No session found");
        return Ok(());
    }

    let counts = state.phase_counts();
    let count_of = |phase: Phase| counts.get(&phase).copied().unwrap_or(0);
    println!(
        "Session: {} item(s) ({} completed, {} failed, {} pending)",
        state.items.len(),
        count_of(Phase::Completed),
        count_of(Phase::Failed),
        count_of(Phase::Pending) + count_of(Phase::Downloading) + count_of(Phase::Downloaded)
            + count_of(Phase::Uploading),
    );

    let mut items: Vec<_> = state.items.values().collect();
    items.sort_by(|a, b| a.display_name.cmp(&b.display_name));
    for item in items {
        println!("  {:<11} {}", item.phase.to_string(), item.display_name);
        if let Some(remote) = &item.remote_reference {
            println!("              remote: {remote}");
        }
        if let Some(error) = &item.last_error {
            println!("              last error: {error}");
        }
    }
    Ok(())
}

/// Render download progress events on a single progress bar.
fn spawn_progress_renderer(mut rx: mpsc::Receiver<ProgressEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{msg:30!} {bar:40} {bytes}/{total_bytes} ({eta})")
                .expect("valid progress template")
                .progress_chars("=> "),
        );
        while let Some(event) = rx.recv().await {
            if event.bytes_total > 0 {
                bar.set_length(event.bytes_total);
            }
            bar.set_position(event.bytes_done);
            bar.set_message(event.item);
        }
        bar.finish_and_clear();
    })
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), SyncError> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown (SIGINT and SIGTERM).
/// Returns a CancellationToken that fires when a signal arrives.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, SyncError> {
    let cancel_token = CancellationToken::new();

    let token_int = cancel_token.clone();
    let token_term = cancel_token.clone();

    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Finishing the current phase and saving the session...");
        token_int.cancel();
    });

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Finishing the current phase and saving the session...");
        token_term.cancel();
    });

    info!("Signal handlers installed");
    Ok(cancel_token)
}

/// Setup signal handler for non-unix targets (only Ctrl-C).
#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, SyncError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to setup Ctrl-C handler");
        eprintln!("\nReceived Ctrl-C. Finishing the current phase and saving the session...");
        token.cancel();
    });

    Ok(cancel_token)
}
