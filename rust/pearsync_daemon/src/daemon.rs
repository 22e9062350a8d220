//! The daemon proper: a Unix-socket accept loop over a map of live sync
//! engines.
//!
//! Lifecycle: remove any stale socket file, bind, accept. Shutdown (the
//! `shutdown` command, SIGINT or SIGTERM via the binary) closes every
//! engine, closes the listener and unlinks the socket. A malformed
//! request gets an `{"error": ...}` line; the daemon never dies from bad
//! input.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pearsync_core::keys::PublicKey;
use pearsync_core::{paths, Config};
use pearsync_engine::{SyncEngine, SyncEngineConfig};
use pearsync_net::TopicTransport;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Mutex};

use crate::ipc::{Request, Response, WorkspaceReport};

/// Builds the topic transport for a workspace. The daemon stays agnostic
/// of the transport in use — a real DHT, TCP, or the in-memory hub in
/// tests.
pub type TransportFactory =
    Arc<dyn Fn(PublicKey) -> Arc<dyn TopicTransport> + Send + Sync + 'static>;

pub struct Daemon {
    socket_path: PathBuf,
    transport_factory: TransportFactory,
    engines: Mutex<HashMap<PathBuf, Arc<SyncEngine>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Daemon {
    pub fn new(socket_path: PathBuf, transport_factory: TransportFactory) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            socket_path,
            transport_factory,
            engines: Mutex::new(HashMap::new()),
            shutdown_tx,
        })
    }

    /// Ask a running daemon to stop (used by signal handlers and tests).
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Bind and serve until shutdown. Consumes the accept loop; engines
    /// are closed and the socket unlinked before this returns.
    pub async fn run(self: &Arc<Self>) -> std::io::Result<()> {
        if self.socket_path.exists() {
            tracing::debug!(socket = %self.socket_path.display(), "removing stale socket");
            let _ = std::fs::remove_file(&self.socket_path);
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!(socket = %self.socket_path.display(), "daemon listening");

        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { continue };
                    let daemon = self.clone();
                    tokio::spawn(async move {
                        daemon.serve_connection(stream).await;
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Drain: close every engine, then the socket.
        let engines: Vec<(PathBuf, Arc<SyncEngine>)> =
            self.engines.lock().await.drain().collect();
        for (path, engine) in engines {
            if let Err(e) = engine.close().await {
                tracing::warn!(workspace = %path.display(), "engine close failed: {e}");
            }
        }
        drop(listener);
        let _ = std::fs::remove_file(&self.socket_path);
        tracing::info!("daemon stopped");
        Ok(())
    }

    async fn serve_connection(self: &Arc<Self>, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => break,
            }
            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => Response::err(format!("invalid request: {e}")),
            };

            let mut out = match serde_json::to_string(&response) {
                Ok(out) => out,
                Err(e) => format!(r#"{{"error":"response encoding failed: {e}"}}"#),
            };
            out.push('\n');
            if write_half.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, request: Request) -> Response {
        match request {
            Request::Status | Request::List => {
                let engines = self.engines.lock().await;
                let mut reports = Vec::with_capacity(engines.len());
                for (path, engine) in engines.iter() {
                    match engine.status() {
                        Ok(status) => reports.push(WorkspaceReport {
                            path: path.clone(),
                            workspace_key: status.workspace_key,
                            writable: status.writable,
                            version: status.version,
                            files: status.files,
                            writers: status.writers,
                            peers: status.peers,
                        }),
                        Err(e) => {
                            return Response::err(format!(
                                "status of {} failed: {e}",
                                path.display()
                            ))
                        }
                    }
                }
                reports.sort_by(|a, b| a.path.cmp(&b.path));
                Response::ok_with_workspaces(reports)
            }
            Request::Watch { workspace } => self.watch(&workspace).await,
            Request::Unwatch { workspace } => {
                let engine = self.engines.lock().await.remove(&workspace);
                match engine {
                    Some(engine) => match engine.close().await {
                        Ok(()) => Response::ok(),
                        Err(e) => Response::err(format!("close failed: {e}")),
                    },
                    None => Response::err(format!("not watching {}", workspace.display())),
                }
            }
            Request::Shutdown => {
                self.trigger_shutdown();
                Response::ok()
            }
        }
    }

    async fn watch(self: &Arc<Self>, workspace: &Path) -> Response {
        {
            let engines = self.engines.lock().await;
            if engines.contains_key(workspace) {
                return Response::ok_with_note("Already watching");
            }
        }
        if !workspace.is_dir() {
            return Response::err(format!("{} is not a directory", workspace.display()));
        }

        // The workspace must be registered in the config file; that is
        // where its key and flags live.
        let config = match Config::load(&paths::config_path()) {
            Ok(config) => config,
            Err(e) => return Response::err(format!("config load failed: {e}")),
        };
        let Some((name, entry)) = config.workspace_for_path(workspace) else {
            return Response::err(format!(
                "{} is not a configured workspace",
                workspace.display()
            ));
        };
        let key = match PublicKey::from_hex(&entry.key) {
            Ok(key) => key,
            Err(e) => return Response::err(format!("bad key for '{name}': {e}")),
        };

        let mut engine_config =
            SyncEngineConfig::new(key, workspace.to_path_buf(), paths::store_dir(&key));
        engine_config.sync_deletes = entry.sync_deletes;

        let transport = (self.transport_factory)(key);
        let engine = match SyncEngine::init(engine_config, transport).await {
            Ok(engine) => engine,
            Err(e) => return Response::err(format!("engine init failed: {e}")),
        };
        if let Err(e) = engine.start_watching() {
            let _ = engine.close().await;
            return Response::err(format!("watcher failed: {e}"));
        }

        tracing::info!(workspace = %workspace.display(), name = %name, "watching workspace");
        self.engines
            .lock()
            .await
            .insert(workspace.to_path_buf(), engine);
        Response::ok()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc;
    use pearsync_net::MemoryHub;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_daemon(dir: &TempDir) -> (Arc<Daemon>, PathBuf) {
        let socket = dir.path().join("daemon.sock");
        let hub = MemoryHub::new();
        let factory: TransportFactory = Arc::new(move |key| {
            Arc::new(hub.transport(key)) as Arc<dyn TopicTransport>
        });
        (Daemon::new(socket.clone(), factory), socket)
    }

    async fn wait_for_socket(path: &Path) {
        for _ in 0..100 {
            if tokio::net::UnixStream::connect(path).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("daemon socket never appeared");
    }

    #[tokio::test]
    async fn malformed_requests_get_error_lines() {
        let dir = TempDir::new().unwrap();
        let (daemon, socket) = test_daemon(&dir);
        let run = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.run().await })
        };
        wait_for_socket(&socket).await;

        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        let stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"this is not json\n").await.unwrap();

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: Response = serde_json::from_str(&line).unwrap();
        assert!(response.error.is_some());

        // The daemon survives and still answers real requests.
        let response = ipc::request(&socket, &Request::List).await.unwrap();
        assert!(response.is_ok());

        daemon.trigger_shutdown();
        run.await.unwrap().unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn watch_rejects_non_directories_and_stays_alive() {
        let dir = TempDir::new().unwrap();
        let (daemon, socket) = test_daemon(&dir);
        let run = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.run().await })
        };
        wait_for_socket(&socket).await;

        let bogus = dir.path().join("no-such-dir");
        let response = ipc::request(
            &socket,
            &Request::Watch {
                workspace: bogus.clone(),
            },
        )
        .await
        .unwrap();
        assert!(response.error.is_some());

        let response = ipc::request(&socket, &Request::Status).await.unwrap();
        assert!(response.is_ok());
        assert_eq!(response.workspaces.unwrap().len(), 0);

        daemon.trigger_shutdown();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unwatch_unknown_path_is_an_error() {
        let dir = TempDir::new().unwrap();
        let (daemon, socket) = test_daemon(&dir);
        let run = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.run().await })
        };
        wait_for_socket(&socket).await;

        let response = ipc::request(
            &socket,
            &Request::Unwatch {
                workspace: PathBuf::from("/nowhere"),
            },
        )
        .await
        .unwrap();
        assert!(response.error.is_some());

        daemon.trigger_shutdown();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_command_stops_and_unlinks() {
        let dir = TempDir::new().unwrap();
        let (daemon, socket) = test_daemon(&dir);
        let run = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.run().await })
        };
        wait_for_socket(&socket).await;

        let response = ipc::request(&socket, &Request::Shutdown).await.unwrap();
        assert!(response.is_ok());

        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("daemon did not stop")
            .unwrap()
            .unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let dir = TempDir::new().unwrap();
        let (daemon, socket) = test_daemon(&dir);
        std::fs::write(&socket, b"stale").unwrap();

        let run = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.run().await })
        };
        wait_for_socket(&socket).await;

        let response = ipc::request(&socket, &Request::List).await.unwrap();
        assert!(response.is_ok());

        daemon.trigger_shutdown();
        run.await.unwrap().unwrap();
    }
}
