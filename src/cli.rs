use crate::backend::{HttpBackend, HttpBackendConfig};
use crate::config::{self, FileConfig, RegistryConfig};
use crate::model::{InstanceModel, RegistryEvent, StartOptions, DEFAULT_RELOAD_INTERVAL};
use crate::registry::Registry;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8888";

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "board-registry",
    version,
    about = "Manage running log-directory visualization instances"
)]
pub struct Cli {
    /// Base URL of the server hosting the instance API
    #[arg(long)]
    pub base_url: Option<String>,

    /// Config file (defaults to <config dir>/board-registry/config.json)
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,

    /// Background poll period for `watch`
    #[arg(long)]
    pub poll_interval: Option<humantime::Duration>,

    /// Per-request timeout for backend calls
    #[arg(long)]
    pub request_timeout: Option<humantime::Duration>,

    /// Use --optimistic-shutdown false to keep instances listed until the backend confirms
    #[arg(long, action = clap::ArgAction::Set)]
    pub optimistic_shutdown: Option<bool>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// List running instances
    List,
    /// Start an instance for a log directory, or reuse the one serving it
    Start {
        /// Directory, or comma-separated `label:path` entries
        logdir: String,
        /// Seconds between reloads (0 disables)
        #[arg(long, allow_negative_numbers = true)]
        reload_interval: Option<i64>,
        /// Treat each subdirectory as a separate run
        #[arg(long)]
        multi_log: bool,
        /// Extra arguments passed to the instance verbatim
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        args: String,
    },
    /// Shut down one instance by name
    Stop { name: String },
    /// Shut down every running instance
    StopAll,
    /// Print the running list every time it changes, until Ctrl-C
    Watch,
    /// Show a log directory relative to the workspace root
    Format { dir: String },
}

/// Backend and registry settings resolved from flags and the config file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: HttpBackendConfig,
    pub registry: RegistryConfig,
}

/// Merge CLI flags over file settings over built-in defaults.
pub fn build_config(args: &Cli, file: &FileConfig) -> Settings {
    let backend = HttpBackendConfig {
        base_url: args
            .base_url
            .clone()
            .or_else(|| file.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        request_timeout: args
            .request_timeout
            .map(Duration::from)
            .or(file.request_timeout),
        ..Default::default()
    };

    let mut registry = RegistryConfig::default();
    if let Some(period) = args.poll_interval.map(Duration::from).or(file.poll_interval) {
        registry.poll_interval = Some(period);
    }
    if let Some(optimistic) = args.optimistic_shutdown.or(file.optimistic_shutdown) {
        registry.optimistic_shutdown = optimistic;
    }
    registry.default_start.reload_interval =
        file.reload_interval.unwrap_or(DEFAULT_RELOAD_INTERVAL);
    Settings { backend, registry }
}

fn load_file_config(args: &Cli) -> Result<FileConfig> {
    match args.config.clone().or_else(config::default_config_path) {
        Some(path) => config::load_file_config(&path),
        None => Ok(FileConfig::default()),
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let file = load_file_config(&args)?;
    let settings = build_config(&args, &file);

    // Reject bad input before any request goes out.
    let start_options = match &args.command {
        Command::Start {
            logdir,
            reload_interval,
            multi_log,
            args: extra,
        } => {
            let options = StartOptions {
                reload_interval: reload_interval
                    .unwrap_or(settings.registry.default_start.reload_interval),
                enable_multi_log: *multi_log,
                additional_args: extra.clone(),
            };
            options.validate(logdir)?;
            Some(options)
        }
        _ => None,
    };

    let backend = Arc::new(HttpBackend::new(&settings.backend).context("build HTTP client")?);
    let mut registry_cfg = settings.registry.clone();
    if !matches!(args.command, Command::Watch) {
        // One-shot commands poll explicitly.
        registry_cfg.poll_interval = None;
    }
    let registry = Registry::new(backend, registry_cfg).await;

    let (out_tx, out_handle) = spawn_output_writer();
    let res = run_command(&args, &registry, start_options, &out_tx).await;
    registry.dispose();

    drop(out_tx);
    let _ = out_handle.await;
    res
}

async fn run_command(
    args: &Cli,
    registry: &Arc<Registry>,
    start_options: Option<StartOptions>,
    out: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    match &args.command {
        Command::List => {
            registry
                .refresh_running()
                .await
                .context("failed to list running instances")?;
            print_running(registry, &registry.running(), args.json, out)?;
        }
        Command::Start { logdir, .. } => {
            let options = start_options.unwrap_or_else(|| registry.config().default_start.clone());
            let handle = registry
                .start(logdir, options)
                .await
                .with_context(|| format!("failed to start instance for {logdir}"))?;
            if args.json {
                let _ = out.send(OutputLine::Stdout(serde_json::to_string_pretty(
                    handle.model(),
                )?));
            } else {
                let _ = out.send(OutputLine::Stdout(describe(registry, handle.model())));
            }
        }
        Command::Stop { name } => {
            registry
                .refresh_running()
                .await
                .context("failed to list running instances")?;
            if !registry.running().iter().any(|m| &m.name == name) {
                let _ = out.send(OutputLine::Stderr(format!("No running instance named {name}")));
                return Ok(());
            }
            registry.shutdown(name).await;
            let _ = out.send(OutputLine::Stderr(format!("Stopped {name}")));
        }
        Command::StopAll => {
            registry
                .refresh_running()
                .await
                .context("failed to list running instances")?;
            let count = registry.running().len();
            registry.shutdown_all().await;
            let _ = out.send(OutputLine::Stderr(format!("Stopped {count} instance(s)")));
        }
        Command::Watch => watch(registry, args.json, out).await?,
        Command::Format { dir } => {
            let _ = out.send(OutputLine::Stdout(registry.format_dir(dir)));
        }
    }
    Ok(())
}

async fn watch(
    registry: &Arc<Registry>,
    json: bool,
    out: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    let mut events = registry.subscribe();
    let _ = out.send(OutputLine::Stderr("Watching for changes (Ctrl-C to stop)".into()));
    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Ok(RegistryEvent::RunningChanged(snapshot)) => {
                    let _ = out.send(OutputLine::Stderr(format!(
                        "== {} ({} running) ==",
                        timestamp(),
                        snapshot.len()
                    )));
                    print_running(registry, &snapshot, json, out)?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    let _ = out.send(OutputLine::Stderr(format!("Skipped {skipped} update(s)")));
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

/// One human-readable line per instance.
pub fn describe(registry: &Registry, model: &InstanceModel) -> String {
    let reload = if model.reload_interval <= 0 {
        "reload off".to_string()
    } else {
        format!("reload {}s", model.reload_interval)
    };
    let mut line = format!("{}\t{}\t{}", model.name, registry.format_dir(&model.logdir), reload);
    if model.enable_multi_log {
        line.push_str("\tmulti-log");
    }
    if !model.additional_args.is_empty() {
        line.push('\t');
        line.push_str(&model.additional_args);
    }
    line
}

fn print_running(
    registry: &Registry,
    models: &[InstanceModel],
    json: bool,
    out: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    if json {
        let _ = out.send(OutputLine::Stdout(serde_json::to_string_pretty(models)?));
        return Ok(());
    }
    if models.is_empty() {
        let _ = out.send(OutputLine::Stderr("No running instances".into()));
    }
    for model in models {
        let _ = out.send(OutputLine::Stdout(describe(registry, model)));
    }
    Ok(())
}
