//! termrelay
//!
//! Share a live shell with authenticated remote viewers, or join one.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use host::config::Config;
use host::pty::{terminal_size, PtyBridge, TerminalSource};
use host::{Session, Viewer, ViewerEvent};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Bound on the farewell exchange when a viewer leaves.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// termrelay - share a terminal session over TCP.
#[derive(Parser, Debug)]
#[command(name = "termrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Share your shell
    Host {
        /// Port to listen on
        #[arg(long, short)]
        port: Option<u16>,

        /// Maximum participants, yourself included
        #[arg(long)]
        max_clients: Option<usize>,

        /// Name shown to viewers
        #[arg(long)]
        owner: Option<String>,
    },

    /// Watch someone else's shell
    Join {
        /// Address of the host, e.g. 10.0.0.5:42024
        addr: String,

        /// Name to join under
        #[arg(long, short)]
        name: String,

        /// Passphrase (prompted for when omitted)
        #[arg(long)]
        passphrase: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    if let Commands::Host {
        port,
        max_clients,
        owner,
    } = &cli.command
    {
        if let Some(port) = port {
            config.network.port = *port;
        }
        if let Some(max) = max_clients {
            config.session.max_clients = *max;
        }
        if let Some(owner) = owner {
            config.session.owner = owner.clone();
        }
    }

    config.validate()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };

    match cli.command {
        Commands::Host { .. } => {
            let _guard = init_file_logging(&level, &config.daemon.data_dir)?;
            run_host(config).await
        }
        Commands::Join {
            addr,
            name,
            passphrase,
        } => {
            init_stderr_logging(&level);
            run_join(config, addr, name, passphrase).await
        }
    }
}

/// Logs to `<data_dir>/termrelay.log`; the terminal belongs to the shell.
fn init_file_logging(level: &str, data_dir: &Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

    let appender = tracing_appender::rolling::never(data_dir, "termrelay.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(guard)
}

fn init_stderr_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .init();
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

async fn run_host(config: Config) -> anyhow::Result<()> {
    let (cols, rows) = terminal_size();
    let bridge = Arc::new(
        PtyBridge::spawn(&config.session.shell, cols, rows)
            .with_context(|| format!("Failed to start shell {}", config.session.shell))?,
    );

    let session = Session::bind(
        config.session_config()?,
        Arc::new(config.authority()),
        Arc::clone(&bridge) as Arc<dyn TerminalSource>,
        Some(Box::new(std::io::stdout())),
    )
    .await
    .context("Failed to start session")?;

    println!(
        "Sharing {} on {} (max {} participants)",
        config.session.shell,
        session.local_addr(),
        config.session.max_clients
    );
    println!("Passphrase: {}", session.current_passphrase());
    tracing::info!(pid = ?bridge.pid(), addr = %session.local_addr(), "Hosting");

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone())?;
    spawn_rotation_notices(&session, cancel.clone());
    spawn_resize_forwarder(Arc::clone(&bridge), cancel.clone())?;

    crossterm::terminal::enable_raw_mode().context("Failed to enable raw mode")?;
    let raw = RawModeGuard;
    spawn_input_forwarder(Arc::clone(&bridge));

    let report = session.run(cancel).await;
    drop(raw);

    println!(
        "Session ended: {} viewer(s) notified{}",
        report.notified,
        if report.quiesced { "" } else { " (timed out waiting for transfers)" }
    );
    Ok(())
}

async fn run_join(
    config: Config,
    addr: String,
    name: String,
    passphrase: Option<String>,
) -> anyhow::Result<()> {
    let passphrase = match passphrase {
        Some(p) => p,
        None => prompt_passphrase().await?,
    };

    let mut viewer = Viewer::connect(addr.as_str(), name, config.pipeline.shrink)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    viewer
        .authenticate(
            &passphrase,
            Duration::from_secs(config.timeouts.auth_timeout_secs),
        )
        .await?;
    tracing::info!(name = %viewer.name(), addr = %addr, "Joined session");

    let heartbeat = viewer.spawn_heartbeat(Duration::from_secs(
        config.session.heartbeat_interval_secs,
    ));
    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone())?;

    let mut stdout = std::io::stdout();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => None,
            event = viewer.next_event(None) => Some(event),
        };
        let Some(event) = event else {
            let acknowledged = viewer.leave(LEAVE_TIMEOUT).await.unwrap_or(false);
            tracing::info!(acknowledged, "Left session");
            break;
        };

        match event {
            Ok(ViewerEvent::Output(bytes)) => {
                stdout.write_all(&bytes)?;
                stdout.flush()?;
            }
            Ok(ViewerEvent::Ended(message)) => {
                eprintln!("\r\nSession ended: {}", message);
                break;
            }
            Ok(ViewerEvent::Error(err)) => {
                tracing::warn!(code = ?err.code, detail = %err.detail, "Session reported an error");
            }
            Ok(ViewerEvent::Notice(info)) => {
                tracing::debug!(kind = ?info.info_type, message = %info.message, "Notice");
            }
            Ok(ViewerEvent::Heartbeat(_)) => {}
            Err(e) => {
                viewer.close().await;
                heartbeat.abort();
                return Err(e).context("Lost connection to session");
            }
        }
    }

    viewer.close().await;
    heartbeat.abort();
    Ok(())
}

/// Restores cooked mode when dropped.
struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            tracing::warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}

/// Translates SIGTERM and SIGINT into `cancel`.
fn spawn_signal_listener(cancel: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
        }
        cancel.cancel();
    });
    Ok(())
}

/// Keeps the shell's window size in step with the operator's terminal.
fn spawn_resize_forwarder(bridge: Arc<PtyBridge>, cancel: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch =
        signal(SignalKind::window_change()).context("Failed to register SIGWINCH handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = winch.recv() => {
                    if received.is_none() {
                        break;
                    }
                    let (cols, rows) = terminal_size();
                    if let Err(e) = bridge.resize(cols, rows) {
                        tracing::debug!(error = %e, "Stopped forwarding resizes");
                        break;
                    }
                }
            }
        }
    });
    Ok(())
}

fn spawn_rotation_notices(session: &Session, cancel: CancellationToken) {
    let mut updates = session.passphrase_updates();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let passphrase = updates.borrow_and_update().passphrase.clone();
                    eprint!("\r\n[termrelay] new passphrase: {}\r\n", passphrase);
                }
            }
        }
    });
}

/// Forwards operator keystrokes to the shell.
///
/// Runs on a plain thread: a blocking stdin read must not hold up runtime
/// shutdown.
fn spawn_input_forwarder(bridge: Arc<PtyBridge>) {
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = bridge.write_input(&buf[..n]) {
                        tracing::debug!(error = %e, "Stopped forwarding input");
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read operator input");
                    break;
                }
            }
        }
    });
}

async fn prompt_passphrase() -> anyhow::Result<String> {
    tokio::task::spawn_blocking(|| {
        eprint!("Passphrase: ");
        std::io::stderr().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok::<_, anyhow::Error>(line.trim().to_string())
    })
    .await
    .context("Passphrase prompt failed")?
}
