use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use llamabar::app::{App, ModelOverview};
use llamabar::config::Config;
use llamabar::downloads::{format_bytes, ModelStatus};
use llamabar::error::{LlamabarError, Result};
use llamabar::events::{DownloadEvent, Event, ServerEvent};
use llamabar::ipc::{Command, IpcClient, IpcServer, Response};
use llamabar::server::ServerState;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "llamabar")]
#[command(about = "Local LLM server manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Daemon,
    /// Show server state and per-model status
    Status,
    /// List catalog models
    Models,
    /// Download a model and watch its progress
    Download { model: String },
    /// Cancel a model's in-flight download
    Cancel { model: String },
    /// Delete a model's downloaded files
    Delete { model: String },
    /// Launch the server on a downloaded model
    Run {
        model: String,
        /// Cap the context length, in tokens
        #[arg(long)]
        context: Option<u32>,
    },
    /// Stop the running server
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Daemon) => run_daemon().await,
        Some(Commands::Status) => show_status(false).await,
        Some(Commands::Models) => show_status(true).await,
        Some(Commands::Download { model }) => download(model).await,
        Some(Commands::Cancel { model }) => send_simple(Command::CancelDownload { model }).await,
        Some(Commands::Delete { model }) => send_simple(Command::DeleteModel { model }).await,
        Some(Commands::Run { model, context }) => run_model(model, context).await,
        Some(Commands::Stop) => send_simple(Command::StopServer).await,
    }
}

async fn run_daemon() -> Result<()> {
    let config = Config::load()?;
    let app = App::new(config)?;

    tracing::info!("Starting llamabar daemon");

    let ipc = IpcServer::new(app.clone());
    let result = tokio::select! {
        result = ipc.start() => result,
        () = shutdown_signal() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    };

    // The engine process must not outlive the daemon.
    app.shutdown().await;
    result
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

async fn fetch_status(client: &IpcClient) -> Result<llamabar::app::StatusReport> {
    match client.send(&Command::Status).await? {
        Response::Status(report) => Ok(report),
        Response::Error(e) => Err(LlamabarError::Ipc(e)),
        Response::Ok => Err(LlamabarError::Ipc("Unexpected response".to_string())),
    }
}

async fn show_status(models_only: bool) -> Result<()> {
    let client = IpcClient::new();
    let report = fetch_status(&client).await?;

    if !models_only {
        let server = &report.server;
        match &server.state {
            ServerState::Idle => println!("Server: idle"),
            ServerState::Loading => {
                println!("Server: loading {}", server.model.as_deref().unwrap_or("?"));
            }
            ServerState::Running => {
                println!(
                    "Server: running {} (context {})",
                    server.model.as_deref().unwrap_or("?"),
                    server.context.unwrap_or(0)
                );
                if let Some(url) = &server.url {
                    println!("Endpoint: {url}");
                }
                if let Some(mb) = server.memory_mb {
                    println!("Memory: {mb} MB");
                }
            }
            ServerState::Error(reason) => println!("Server: error: {reason}"),
        }
        println!();
    }

    for row in &report.models {
        let marker = if row.active { "*" } else { " " };
        println!(
            "{} {:<20} {:<26} {:>10}  {}",
            marker,
            row.id,
            row.name,
            format_bytes(row.download_size),
            status_label(row)
        );
    }
    Ok(())
}

fn status_label(row: &ModelOverview) -> String {
    if row.active {
        return "running".to_string();
    }
    if !row.compatible {
        return match &row.incompatible_reason {
            Some(reason) => format!("incompatible: {reason}"),
            None => "incompatible".to_string(),
        };
    }
    match &row.status {
        ModelStatus::Downloaded => "downloaded".to_string(),
        ModelStatus::Downloading {
            completed_bytes,
            total_bytes,
        } => format!(
            "downloading {} / {}",
            format_bytes(*completed_bytes),
            format_bytes(*total_bytes)
        ),
        ModelStatus::Available => "available".to_string(),
    }
}

async fn download(model: String) -> Result<()> {
    let client = IpcClient::new();
    // Subscribe before issuing the command so no early event is missed.
    let mut stream = client.watch().await?;

    if let Response::Error(e) = client
        .send(&Command::Download {
            model: model.clone(),
        })
        .await?
    {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    // A fully-present model produces no events at all.
    let report = fetch_status(&client).await?;
    if let Some(row) = report.models.iter().find(|r| r.id == model) {
        if row.status == ModelStatus::Downloaded {
            println!("{model} is already downloaded");
            return Ok(());
        }
    }

    let mut bar: Option<ProgressBar> = None;
    while let Some(event) = stream.next().await? {
        let Event::Download(event) = event else {
            continue;
        };
        match event {
            DownloadEvent::Started { model: m, total_bytes } if m == model => {
                bar = Some(download_bar(total_bytes, &model));
            }
            DownloadEvent::Progress {
                model: m,
                completed_bytes,
                total_bytes,
            } if m == model => {
                if let Some(bar) = &bar {
                    // Totals converge on real sizes as transfers report in.
                    if bar.length() != Some(total_bytes) {
                        bar.set_length(total_bytes);
                    }
                    bar.set_position(completed_bytes);
                }
            }
            DownloadEvent::Completed { model: m } if m == model => {
                match &bar {
                    Some(bar) => bar.finish_with_message(format!("Downloaded {model}")),
                    None => println!("Downloaded {model}"),
                }
                return Ok(());
            }
            DownloadEvent::Failed { model: m, reason } if m == model => {
                if let Some(bar) = &bar {
                    bar.abandon();
                }
                eprintln!("Download failed: {reason}");
                std::process::exit(1);
            }
            DownloadEvent::Canceled { model: m } if m == model => {
                if let Some(bar) = &bar {
                    bar.abandon();
                }
                println!("Download canceled");
                return Ok(());
            }
            _ => {}
        }
    }
    Err(LlamabarError::Ipc(
        "Daemon closed the event stream".to_string(),
    ))
}

fn download_bar(total: u64, model: &str) -> ProgressBar {
    let bar = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    bar.set_style(style);
    bar.set_message(model.to_string());
    bar
}

async fn run_model(model: String, context: Option<u32>) -> Result<()> {
    let client = IpcClient::new();
    let mut stream = client.watch().await?;

    if let Response::Error(e) = client
        .send(&Command::Run {
            model: model.clone(),
            context,
        })
        .await?
    {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    println!("Loading {model}...");

    let wait = async {
        while let Some(event) = stream.next().await? {
            match event {
                Event::Server(ServerEvent::Running { model: m, context }) if m == model => {
                    println!("Running {m} with context {context}");
                    if let Ok(report) = fetch_status(&client).await {
                        if let Some(url) = report.server.url {
                            println!("Endpoint: {url}");
                        }
                    }
                    return Ok(true);
                }
                Event::Server(ServerEvent::Failed { reason }) => {
                    eprintln!("Error: {reason}");
                    return Ok(false);
                }
                _ => {}
            }
        }
        Err(LlamabarError::Ipc(
            "Daemon closed the event stream".to_string(),
        ))
    };

    // Health polling gives up well inside this window.
    match tokio::time::timeout(Duration::from_secs(60), wait).await {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => std::process::exit(1),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            println!("Still loading; check 'llamabar status'");
            Ok(())
        }
    }
}

async fn send_simple(command: Command) -> Result<()> {
    let client = IpcClient::new();
    match client.send(&command).await? {
        Response::Ok => {
            println!("OK");
            Ok(())
        }
        Response::Error(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
        Response::Status(_) => Ok(()),
    }
}
