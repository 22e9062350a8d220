//! Pearsync CLI
//!
//! Decentralized directory synchronization over per-writer replicated
//! logs. No central server: a workspace is a 32-byte key, and every
//! holder of the key is a full peer.
//!
//! # Usage
//!
//! ```bash
//! # Create a workspace and print its key
//! pearsync init ~/notes --name notes
//!
//! # On another machine, join it
//! pearsync join <64-hex-key> ~/notes --name notes
//!
//! # Sync in the foreground (or via the daemon)
//! pearsync watch notes --foreground
//! pearsync daemon start &
//! pearsync watch notes
//! ```
//!
//! # Environment Variables
//!
//! - `PEARSYNC_LISTEN`: TCP listen address for the dev/LAN transport
//! - `PEARSYNC_PEERS`: comma-separated peer addresses in `host:port` form
//! - `XDG_CONFIG_HOME` / `XDG_DATA_HOME`: relocate config and stores
//!
//! Exit codes: 0 success, 1 user error, 2 I/O or network error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use pearsync_core::keys::{Keypair, PublicKey};
use pearsync_core::{paths, Config, ConfigError, WorkspaceEntry};
use pearsync_engine::{EngineError, SyncEngine, SyncEngineConfig, SyncEvent};
use pearsync_log::LogSet;
use pearsync_net::{TcpTransport, TcpTransportConfig, TopicTransport};

use pearsync_daemon::{ipc, Daemon, Request, TransportFactory, WorkspaceReport};

#[derive(Parser)]
#[command(name = "pearsync")]
#[command(about = "Peer-to-peer directory synchronization")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new workspace rooted at PATH and print its key
    Init {
        path: PathBuf,
        /// Alias for this workspace
        #[arg(long)]
        name: String,
        /// Disable delete propagation on pull
        #[arg(long)]
        no_delete: bool,
    },
    /// Join an existing workspace by its 64-hex key
    Join {
        key: String,
        path: PathBuf,
        /// Alias for this workspace
        #[arg(long)]
        name: String,
        /// Disable delete propagation on pull
        #[arg(long)]
        no_delete: bool,
    },
    /// Start syncing a configured workspace
    Watch {
        name: String,
        /// Run the engine in this process instead of the daemon
        #[arg(long, short = 'f')]
        foreground: bool,
    },
    /// Show sync status of watched workspaces
    Status { name: Option<String> },
    /// List configured workspaces
    List,
    /// Forget a workspace alias
    Remove {
        name: String,
        /// Also delete the local block store
        #[arg(long)]
        delete_data: bool,
    },
    /// Control the background daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    Start,
    Stop,
    Status,
}

/// CLI failure with its exit code: 1 user error, 2 I/O or network.
enum CliError {
    User(String),
    Io(String),
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Io(_) | ConfigError::Json(_) => CliError::Io(e.to_string()),
            _ => CliError::User(e.to_string()),
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Io(e.to_string())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pearsync=info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::User(message)) => {
            eprintln!("error: {message}");
            ExitCode::from(1)
        }
        Err(CliError::Io(message)) => {
            eprintln!("error: {message}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Init {
            path,
            name,
            no_delete,
        } => init_workspace(path, name, no_delete),
        Commands::Join {
            key,
            path,
            name,
            no_delete,
        } => join_workspace(key, path, name, no_delete),
        Commands::Watch { name, foreground } => {
            if foreground {
                watch_foreground(&name).await
            } else {
                watch_via_daemon(&name).await
            }
        }
        Commands::Status { name } => show_status(name.as_deref()).await,
        Commands::List => list_workspaces().await,
        Commands::Remove { name, delete_data } => remove_workspace(&name, delete_data).await,
        Commands::Daemon { action } => match action {
            DaemonAction::Start => daemon_start().await,
            DaemonAction::Stop => daemon_stop().await,
            DaemonAction::Status => daemon_status().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Workspace management
// ---------------------------------------------------------------------------

fn init_workspace(path: PathBuf, name: String, no_delete: bool) -> Result<(), CliError> {
    std::fs::create_dir_all(&path)?;
    let path = path.canonicalize()?;

    let mut config = Config::load(&paths::config_path())?;

    // The bootstrap writer's key *is* the workspace key, so it must be
    // generated before the store directory (named after it) can exist.
    let keypair = Keypair::generate();
    let key = keypair.public();
    LogSet::persist_keypair(&paths::store_dir(&key), &keypair)
        .map_err(|e| CliError::Io(e.to_string()))?;

    config.add_workspace(
        &name,
        WorkspaceEntry {
            key: key.to_hex(),
            path: path.clone(),
            is_writer: true,
            created: now_ms(),
            sync_deletes: !no_delete,
        },
    )?;
    config.save(&paths::config_path())?;

    println!("Created workspace '{name}' at {}", path.display());
    println!("Workspace key: {}", key.to_hex());
    println!("Share this key to let other machines join.");
    Ok(())
}

fn join_workspace(key: String, path: PathBuf, name: String, no_delete: bool) -> Result<(), CliError> {
    let key = PublicKey::from_hex(&key).map_err(|e| CliError::User(e.to_string()))?;
    std::fs::create_dir_all(&path)?;
    let path = path.canonicalize()?;

    let mut config = Config::load(&paths::config_path())?;
    config.add_workspace(
        &name,
        WorkspaceEntry {
            key: key.to_hex(),
            path: path.clone(),
            is_writer: false,
            created: now_ms(),
            sync_deletes: !no_delete,
        },
    )?;
    config.save(&paths::config_path())?;

    println!("Joined workspace '{name}' at {}", path.display());
    println!("Start syncing with: pearsync watch {name}");
    Ok(())
}

async fn remove_workspace(name: &str, delete_data: bool) -> Result<(), CliError> {
    let mut config = Config::load(&paths::config_path())?;
    let entry = config.remove_workspace(name)?;
    config.save(&paths::config_path())?;

    // Best effort: stop the daemon's engine if one is running.
    let _ = ipc::request(
        &paths::socket_path(),
        &Request::Unwatch {
            workspace: entry.path.clone(),
        },
    )
    .await;

    if delete_data {
        if let Ok(key) = PublicKey::from_hex(&entry.key) {
            let store = paths::store_dir(&key);
            if store.exists() {
                std::fs::remove_dir_all(&store)?;
                println!("Deleted local store {}", store.display());
            }
        }
    }
    println!("Removed workspace '{name}'");
    Ok(())
}

// ---------------------------------------------------------------------------
// Watching
// ---------------------------------------------------------------------------

async fn watch_foreground(name: &str) -> Result<(), CliError> {
    let config = Config::load(&paths::config_path())?;
    let entry = config.get_workspace(name)?.clone();
    let key = PublicKey::from_hex(&entry.key).map_err(|e| CliError::User(e.to_string()))?;

    let store = paths::store_dir(&key);
    let keypair =
        LogSet::load_or_generate_keypair(&store).map_err(|e| CliError::Io(e.to_string()))?;

    let mut engine_config = SyncEngineConfig::new(key, entry.path.clone(), store);
    engine_config.sync_deletes = entry.sync_deletes;
    let transport: Arc<dyn TopicTransport> =
        Arc::new(TcpTransport::new(keypair.public(), tcp_config_from_env()));

    let engine = SyncEngine::init(engine_config, transport)
        .await
        .map_err(|e| CliError::Io(e.to_string()))?;

    // Stream events with timestamps (tracing's formatter stamps them).
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(event);
        }
    });

    engine
        .start_watching()
        .map_err(|e| CliError::Io(e.to_string()))?;

    if !entry.is_writer && !engine.writable() {
        match engine.wait_until_writable().await {
            Ok(()) => tracing::info!("writer admission granted"),
            Err(EngineError::WriterAdmissionTimeout) => {
                tracing::warn!("no writer admission yet; syncing read-only until granted");
            }
            Err(e) => return Err(CliError::Io(e.to_string())),
        }
    }

    tracing::info!(workspace = name, "watching; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    engine.close().await.map_err(|e| CliError::Io(e.to_string()))?;
    Ok(())
}

async fn watch_via_daemon(name: &str) -> Result<(), CliError> {
    let config = Config::load(&paths::config_path())?;
    let entry = config.get_workspace(name)?;

    let response = ipc::request(
        &paths::socket_path(),
        &Request::Watch {
            workspace: entry.path.clone(),
        },
    )
    .await
    .map_err(|e| {
        CliError::Io(format!(
            "daemon unreachable ({e}); run `pearsync daemon start` or use --foreground"
        ))
    })?;

    if let Some(error) = response.error {
        return Err(CliError::User(error));
    }
    match response.note.as_deref() {
        Some(note) => println!("{note}: {name}"),
        None => println!("Watching '{name}' via daemon"),
    }
    Ok(())
}

fn print_event(event: SyncEvent) {
    match event {
        SyncEvent::PeerConnected { key } => tracing::info!(peer = %key, "peer connected"),
        SyncEvent::PeerDisconnected { key } => tracing::info!(peer = %key, "peer disconnected"),
        SyncEvent::WriterAdmitted { key } => tracing::info!(writer = %key, "writer admitted"),
        SyncEvent::Writable => tracing::info!("local writer admitted"),
        SyncEvent::FileUploaded { path } => tracing::info!(%path, "uploaded"),
        SyncEvent::FileDeleted { path } => tracing::info!(%path, "deleted remotely"),
        SyncEvent::FileDownloaded { path } => tracing::info!(%path, "downloaded"),
        SyncEvent::FileRemoved { path } => tracing::info!(%path, "removed locally"),
        SyncEvent::PushCompleted { ops } if ops > 0 => tracing::info!(ops, "push complete"),
        SyncEvent::PullCompleted { .. } | SyncEvent::PushCompleted { .. } => {}
        SyncEvent::SyncError { path, message } => {
            tracing::warn!(path = path.as_deref().unwrap_or("-"), "sync error: {message}");
        }
    }
}

// ---------------------------------------------------------------------------
// Status / list
// ---------------------------------------------------------------------------

async fn show_status(name: Option<&str>) -> Result<(), CliError> {
    let config = Config::load(&paths::config_path())?;
    let filter_path = match name {
        Some(name) => Some(config.get_workspace(name)?.path.clone()),
        None => None,
    };

    let response = match ipc::request(&paths::socket_path(), &Request::Status).await {
        Ok(response) => response,
        Err(_) => {
            println!("daemon: not running");
            return Ok(());
        }
    };
    let reports = response.workspaces.unwrap_or_default();
    let shown: Vec<&WorkspaceReport> = reports
        .iter()
        .filter(|r| filter_path.as_ref().map_or(true, |p| *p == r.path))
        .collect();

    if shown.is_empty() {
        println!("no watched workspaces");
        return Ok(());
    }
    for report in shown {
        println!(
            "{}  key={}…  writable={}  files={}  writers={}  peers={}  v{}",
            report.path.display(),
            &report.workspace_key[..16],
            report.writable,
            report.files,
            report.writers,
            report.peers,
            report.version,
        );
    }
    Ok(())
}

async fn list_workspaces() -> Result<(), CliError> {
    let config = Config::load(&paths::config_path())?;
    if config.workspaces.is_empty() {
        println!("no configured workspaces");
        return Ok(());
    }

    let watched: Vec<PathBuf> = match ipc::request(&paths::socket_path(), &Request::List).await {
        Ok(response) => response
            .workspaces
            .unwrap_or_default()
            .into_iter()
            .map(|r| r.path)
            .collect(),
        Err(_) => Vec::new(),
    };

    for (name, entry) in &config.workspaces {
        let state = if watched.contains(&entry.path) {
            "watching"
        } else {
            "idle"
        };
        println!(
            "{name}  {}  key={}…  {state}",
            entry.path.display(),
            &entry.key[..16]
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Daemon control
// ---------------------------------------------------------------------------

async fn daemon_start() -> Result<(), CliError> {
    let daemon = Daemon::new(paths::socket_path(), env_transport_factory());

    // SIGINT and SIGTERM both drain engines before exit.
    {
        let daemon = daemon.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("sigterm handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            tracing::info!("signal received, shutting down");
            daemon.trigger_shutdown();
        });
    }

    daemon.run().await.map_err(|e| CliError::Io(e.to_string()))
}

async fn daemon_stop() -> Result<(), CliError> {
    let response = ipc::request(&paths::socket_path(), &Request::Shutdown)
        .await
        .map_err(|e| CliError::Io(format!("daemon unreachable: {e}")))?;
    if let Some(error) = response.error {
        return Err(CliError::Io(error));
    }
    println!("daemon stopping");
    Ok(())
}

async fn daemon_status() -> Result<(), CliError> {
    match ipc::request(&paths::socket_path(), &Request::Status).await {
        Ok(response) => {
            let count = response.workspaces.map(|w| w.len()).unwrap_or(0);
            println!("daemon: running ({count} watched)");
        }
        Err(_) => println!("daemon: not running"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn env_transport_factory() -> TransportFactory {
    Arc::new(|_workspace_key| {
        // The handshake announces the *writer* identity, but the daemon
        // builds transports per workspace before the engine loads its
        // keypair; an ephemeral handshake key is fine for the dev
        // transport — channels are re-authenticated by block signatures.
        Arc::new(TcpTransport::new(
            Keypair::generate().public(),
            tcp_config_from_env(),
        )) as Arc<dyn TopicTransport>
    })
}

fn tcp_config_from_env() -> TcpTransportConfig {
    let listen = std::env::var("PEARSYNC_LISTEN")
        .ok()
        .and_then(|s| s.parse().ok());
    let peers = std::env::var("PEARSYNC_PEERS")
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    TcpTransportConfig { listen, peers }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
