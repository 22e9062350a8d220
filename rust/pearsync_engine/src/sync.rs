//! The sync engine: bidirectional reconciliation between a local
//! directory and the workspace view.
//!
//! `push` walks the directory and turns local changes into log ops;
//! `pull` materializes newer view entries onto disk. One reconciliation
//! cycle always pushes before it reads the view. Conflicts need no
//! machinery here: the linearizer's total order decides, last writer
//! wins at op granularity.
//!
//! Peer plumbing: every connection the topic transport delivers is
//! wrapped in a sub-channel mux carrying one replication session per
//! known log plus the writer-exchange side channel. Logs discovered
//! later (an applied `add-writer`, or a peer replicating an unknown log)
//! get sessions on all open connections automatically.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use pearsync_core::ignore::IgnoreList;
use pearsync_core::keys::PublicKey;
use pearsync_core::op::{content_hash, FileMeta, Operation};
use pearsync_log::{replicate_log, LogSet};
use pearsync_net::{
    run_exchange, PeerChannel, PeerConnection, TopicTransport, JoinMode, WRITER_EXCHANGE_LABEL,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::events::{self, SyncEvent};
use crate::index::SyncIndex;
use crate::linearizer::Linearizer;
use crate::view::View;
use crate::{EngineError, Result};

/// Cross-platform filesystems have second-level mtime precision.
const MTIME_TOLERANCE_MS: u64 = 1000;

/// Delay between a writer-exchange admission and the follow-up pull.
const ADMISSION_PULL_DELAY: Duration = Duration::from_secs(1);

const WRITABLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Sub-channel label for one log's replication session.
fn log_label(key: &PublicKey) -> String {
    format!("log/{}", key.to_hex())
}

fn parse_log_label(label: &str) -> Option<PublicKey> {
    PublicKey::from_hex(label.strip_prefix("log/")?).ok()
}

#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// The workspace (bootstrap writer) key.
    pub workspace_key: PublicKey,
    /// Local directory being synchronized.
    pub dir: PathBuf,
    /// Per-workspace store root (logs, view, writer identity).
    pub store_dir: PathBuf,
    /// Whether pull removes local files absent from the view.
    pub sync_deletes: bool,
    /// Linearizer poll cadence.
    pub poll_interval: Duration,
    /// Filesystem watcher stability window.
    pub debounce: Duration,
    /// How long a joiner waits to observe its own admission.
    pub admission_timeout: Duration,
}

impl SyncEngineConfig {
    pub fn new(workspace_key: PublicKey, dir: PathBuf, store_dir: PathBuf) -> Self {
        Self {
            workspace_key,
            dir,
            store_dir,
            sync_deletes: true,
            poll_interval: Duration::from_secs(3),
            debounce: Duration::from_millis(200),
            admission_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot reported over IPC.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub workspace_key: String,
    pub local_key: String,
    pub writable: bool,
    pub version: u64,
    pub files: u64,
    pub writers: u64,
    pub peers: u64,
}

#[derive(Default)]
struct PushState {
    running: bool,
    queued: bool,
}

/// A live workspace.
pub struct SyncEngine {
    config: SyncEngineConfig,
    logs: Arc<LogSet>,
    view: Arc<View>,
    linearizer: Arc<Linearizer>,
    ignore: IgnoreList,
    index: SyncIndex,
    events: broadcast::Sender<SyncEvent>,
    shutdown_tx: watch::Sender<bool>,
    peers: AtomicU64,
    push_state: Mutex<PushState>,
    reconcile_lock: tokio::sync::Mutex<()>,
    pull_wakeup_tx: mpsc::Sender<()>,
    pull_wakeup_rx: Mutex<Option<mpsc::Receiver<()>>>,
    admissions_in_flight: Mutex<HashSet<PublicKey>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Open the workspace state and join the topic. Returns the engine;
    /// call [`start_watching`](Self::start_watching) for continuous sync.
    pub async fn init(
        config: SyncEngineConfig,
        transport: Arc<dyn TopicTransport>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.dir)?;

        let keypair = LogSet::load_or_generate_keypair(&config.store_dir)?;
        let logs = Arc::new(LogSet::open(
            &config.store_dir,
            config.workspace_key,
            keypair,
        )?);
        let view = Arc::new(View::open(
            &config.store_dir.join("view.redb"),
            config.workspace_key,
        )?);
        let linearizer = Arc::new(Linearizer::new(logs.clone(), view.clone()));
        let ignore = IgnoreList::load(&config.dir)?;
        let index = SyncIndex::load(&config.store_dir);

        let (shutdown_tx, _) = watch::channel(false);
        let (pull_wakeup_tx, pull_wakeup_rx) = mpsc::channel(8);

        let topic = config.workspace_key.topic();
        let engine = Arc::new(Self {
            config,
            logs,
            view,
            linearizer,
            ignore,
            index,
            events: events::channel(),
            shutdown_tx,
            peers: AtomicU64::new(0),
            push_state: Mutex::new(PushState::default()),
            reconcile_lock: tokio::sync::Mutex::new(()),
            pull_wakeup_tx,
            pull_wakeup_rx: Mutex::new(Some(pull_wakeup_rx)),
            admissions_in_flight: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
        });

        // Fold whatever is already on disk before any peer talks to us.
        engine.linearizer.update().await?;

        let mut handle = transport.join(topic, JoinMode::default()).await?;
        let acceptor = {
            let engine = engine.clone();
            let mut shutdown = engine.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        conn = handle.next_connection() => {
                            match conn {
                                Some(conn) => engine.handle_peer(conn),
                                None => break,
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                handle.leave();
            })
        };
        engine.tasks.lock().push(acceptor);

        tracing::info!(
            workspace = %engine.config.workspace_key,
            writer = %engine.logs.local_key(),
            dir = %engine.config.dir.display(),
            "sync engine initialized"
        );
        Ok(engine)
    }

    pub fn workspace_key(&self) -> PublicKey {
        self.config.workspace_key
    }

    pub fn local_key(&self) -> PublicKey {
        self.logs.local_key()
    }

    pub fn view(&self) -> &Arc<View> {
        &self.view
    }

    /// Whether the local writer is currently admitted.
    pub fn writable(&self) -> bool {
        self.view.is_writer(&self.logs.local_key())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            workspace_key: self.config.workspace_key.to_hex(),
            local_key: self.logs.local_key().to_hex(),
            writable: self.writable(),
            version: self.view.version(),
            files: self.view.file_count()?,
            writers: self.view.writer_set().len() as u64,
            peers: self.peers.load(Ordering::Relaxed),
        })
    }

    /// Poll until the local writer's admission has linearized, up to the
    /// configured deadline.
    pub async fn wait_until_writable(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.admission_timeout;
        loop {
            self.linearizer.update().await?;
            if self.writable() {
                let _ = self.events.send(SyncEvent::Writable);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::WriterAdmissionTimeout);
            }
            tokio::time::sleep(WRITABLE_POLL_INTERVAL).await;
        }
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Local → view: diff the directory against the manifest and append
    /// ops for every change. Returns the number of ops emitted.
    pub async fn push(&self) -> Result<u64> {
        let _guard = self.reconcile_lock.lock().await;
        self.push_inner().await
    }

    /// View → local: write newer manifest entries to disk (and apply
    /// deletions when configured). Returns files written plus removed.
    pub async fn pull(&self) -> Result<u64> {
        let _guard = self.reconcile_lock.lock().await;
        self.pull_inner().await
    }

    /// One full cycle: push (when admitted), then pull.
    pub async fn reconcile(&self) -> Result<()> {
        let _guard = self.reconcile_lock.lock().await;
        if self.writable() {
            self.push_inner().await?;
        }
        self.pull_inner().await?;
        Ok(())
    }

    async fn push_inner(&self) -> Result<u64> {
        if !self.writable() {
            return Err(EngineError::NotWritable);
        }
        let local_key = self.logs.local_key();
        let local_log = self.logs.local();
        let mut ops = 0u64;

        let mut on_disk: HashSet<String> = HashSet::new();
        for (rel, abs) in walk_files(&self.config.dir, &self.ignore)? {
            on_disk.insert(rel.clone());
            match self.push_one(&rel, &abs, &local_key) {
                Ok(true) => {
                    ops += 1;
                    let _ = self.events.send(SyncEvent::FileUploaded { path: rel });
                }
                Ok(false) => {}
                Err(e) => {
                    let _ = self.events.send(SyncEvent::SyncError {
                        path: Some(rel),
                        message: e.to_string(),
                    });
                }
            }
        }

        // Deletions: only paths this writer authored, so a fresh joiner
        // cannot wipe everyone else's files on its first push.
        for (path, meta) in self.view.scan()? {
            if self.ignore.is_ignored(&path) || on_disk.contains(&path) {
                continue;
            }
            if meta.author != *local_key.as_bytes() {
                continue;
            }
            let op = Operation::Del { path: path.clone() }
                .encode()
                .map_err(|e| EngineError::Fatal(e.to_string()))?;
            local_log.append(&op)?;
            self.index.forget(&path);
            ops += 1;
            let _ = self.events.send(SyncEvent::FileDeleted { path });
        }

        if let Err(e) = self.index.save() {
            tracing::warn!("sync index save failed: {e}");
        }

        // Fold our own ops before anything reads the view again.
        self.linearizer.update().await?;
        let _ = self.events.send(SyncEvent::PushCompleted { ops });
        Ok(ops)
    }

    /// Push a single file if it differs from its view entry.
    fn push_one(&self, rel: &str, abs: &Path, local_key: &PublicKey) -> Result<bool> {
        let meta = std::fs::metadata(abs)?;
        let mtime_ms = system_time_ms(meta.modified()?);
        let size = meta.len();
        let mode = file_mode(&meta);

        let entry = self.view.get(rel)?;
        if let Some(entry) = &entry {
            // Fast path: same size and mtime within filesystem precision.
            if entry.size == size && entry.mtime_ms.abs_diff(mtime_ms) < MTIME_TOLERANCE_MS {
                return Ok(false);
            }
        }

        let content = std::fs::read(abs)?;
        let hash = content_hash(&content);
        if let Some(entry) = &entry {
            if entry.hash == hash {
                // Content identical; the mtime drifted. No op keeps
                // consecutive pushes idempotent.
                return Ok(false);
            }
        } else if self.index.get(rel) == Some(hash) {
            // View-absent but unchanged since we last synced it: the
            // entry was deleted remotely, and pushing would resurrect
            // it. The next pull removes the file. A file that *differs*
            // from the index is a real local edit and falls through, so
            // a concurrent edit beats a concurrent delete.
            return Ok(false);
        }

        let op = Operation::Put {
            path: rel.to_string(),
            meta: FileMeta::from_content(content, mtime_ms, mode, *local_key.as_bytes()),
        }
        .encode()
        .map_err(|e| EngineError::Fatal(e.to_string()))?;
        self.logs.local().append(&op)?;
        self.index.record(rel, hash);
        Ok(true)
    }

    async fn pull_inner(&self) -> Result<u64> {
        self.linearizer.update().await?;
        let mut changed = 0u64;
        let mut in_view: HashSet<String> = HashSet::new();

        for (path, meta) in self.view.scan()? {
            if self.ignore.is_ignored(&path) {
                continue;
            }
            let Some(abs) = safe_join(&self.config.dir, &path) else {
                tracing::warn!(path = %path, "skipping manifest entry with unsafe path");
                continue;
            };
            in_view.insert(path.clone());

            match self.pull_one(&abs, &meta) {
                Ok(true) => {
                    changed += 1;
                    self.index.record(&path, meta.hash);
                    let _ = self.events.send(SyncEvent::FileDownloaded { path });
                }
                Ok(false) => {}
                Err(e) => {
                    let _ = self.events.send(SyncEvent::SyncError {
                        path: Some(path),
                        message: e.to_string(),
                    });
                }
            }
        }

        if self.config.sync_deletes {
            for (rel, abs) in walk_files(&self.config.dir, &self.ignore)? {
                if in_view.contains(&rel) {
                    continue;
                }
                // Only remove files this engine itself synced and that
                // are unchanged since: a never-synced local file is
                // waiting to be pushed, and a locally edited one beats a
                // concurrent remote delete.
                let Some(synced_hash) = self.index.get(&rel) else {
                    continue;
                };
                match std::fs::read(&abs) {
                    Ok(content) if content_hash(&content) != synced_hash => continue,
                    Ok(_) => {}
                    Err(_) => continue,
                }
                match std::fs::remove_file(&abs) {
                    Ok(()) => {
                        changed += 1;
                        self.index.forget(&rel);
                        let _ = self.events.send(SyncEvent::FileRemoved { path: rel });
                    }
                    Err(e) => {
                        let _ = self.events.send(SyncEvent::SyncError {
                            path: Some(rel),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        if let Err(e) = self.index.save() {
            tracing::warn!("sync index save failed: {e}");
        }
        let _ = self.events.send(SyncEvent::PullCompleted {
            version: self.view.version(),
        });
        Ok(changed)
    }

    /// Write one view entry to disk when it is newer than the local copy.
    fn pull_one(&self, abs: &Path, meta: &FileMeta) -> Result<bool> {
        let local_mtime = match std::fs::metadata(abs) {
            Ok(m) => Some(system_time_ms(m.modified()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(local_ms) = local_mtime {
            if meta.mtime_ms < local_ms + MTIME_TOLERANCE_MS {
                return Ok(false);
            }
        }

        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(abs)?;
        file.write_all(&meta.content)?;
        restore_mode(&file, meta.mode)?;
        file.set_modified(UNIX_EPOCH + Duration::from_millis(meta.mtime_ms))?;
        file.sync_all()?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Continuous sync
    // -----------------------------------------------------------------------

    /// Start the filesystem watcher (debounced pushes) and the
    /// linearizer poll loop (pulls on advance).
    pub fn start_watching(self: &Arc<Self>) -> Result<()> {
        let mut watcher = crate::watch::DirWatcher::start(&self.config.dir, self.config.debounce)?;

        let watch_task = {
            let engine = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        burst = watcher.next_burst() => {
                            if burst.is_none() {
                                break;
                            }
                            engine.request_push();
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        let poll_task = {
            let engine = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let mut wakeup = self
                .pull_wakeup_rx
                .lock()
                .take()
                .expect("start_watching called twice");
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(engine.config.poll_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let mut last_version = 0u64;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {}
                        Some(()) = wakeup.recv() => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                    }
                    match engine.linearizer.update().await {
                        Ok(outcome) => {
                            if outcome.version != last_version {
                                last_version = outcome.version;
                                if let Err(e) = engine.pull().await {
                                    let _ = engine.events.send(SyncEvent::SyncError {
                                        path: None,
                                        message: e.to_string(),
                                    });
                                }
                            }
                        }
                        Err(e) => {
                            let _ = engine.events.send(SyncEvent::SyncError {
                                path: None,
                                message: e.to_string(),
                            });
                        }
                    }
                }
            })
        };

        let mut tasks = self.tasks.lock();
        tasks.push(watch_task);
        tasks.push(poll_task);
        Ok(())
    }

    /// Coalesced push request: one in flight, at most one queued.
    pub fn request_push(self: &Arc<Self>) {
        {
            let mut state = self.push_state.lock();
            if state.running {
                state.queued = true;
                return;
            }
            state.running = true;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                match engine.push().await {
                    Ok(_) => {}
                    Err(EngineError::NotWritable) => {
                        // Not admitted yet; the change is pushed once the
                        // admission linearizes and the watcher fires again.
                        tracing::debug!("push skipped: not writable yet");
                    }
                    Err(e) => {
                        let _ = engine.events.send(SyncEvent::SyncError {
                            path: None,
                            message: e.to_string(),
                        });
                    }
                }
                let mut state = engine.push_state.lock();
                if state.queued {
                    state.queued = false;
                    continue;
                }
                state.running = false;
                break;
            }
        });
    }

    /// Stop the watcher, leave the topic, close the logs.
    pub async fn close(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                tracing::warn!("engine task did not stop in time, aborting");
                task.abort();
            }
        }
        self.logs.close()?;
        tracing::info!(workspace = %self.config.workspace_key, "sync engine closed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Peer plumbing
    // -----------------------------------------------------------------------

    fn handle_peer(self: &Arc<Self>, conn: PeerConnection) {
        let remote_key = conn.remote_key;
        self.peers.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(SyncEvent::PeerConnected { key: remote_key });
        tracing::debug!(peer = %remote_key, initiator = conn.initiator, "peer connected");

        let (channel, mut new_labels) = PeerChannel::new(conn.stream);
        let channel = Arc::new(channel);

        // Writer exchange side channel.
        let exchange_sub = channel.open(WRITER_EXCHANGE_LABEL);
        let (found_tx, mut found_rx) = mpsc::channel(16);
        {
            let local = self.logs.local_key();
            let topic = self.config.workspace_key.topic();
            tokio::spawn(async move {
                let _ = run_exchange(local, topic, exchange_sub.tx, exchange_sub.rx, found_tx)
                    .await;
            });
        }
        {
            let engine = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let admission_task = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        key = found_rx.recv() => {
                            match key {
                                Some(key) => engine.on_remote_writer(key).await,
                                None => break,
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
            self.tasks.lock().push(admission_task);
        }

        // Replication supervisor: a session per known log, plus any the
        // peer opens that we have never heard of.
        let engine = self.clone();
        let supervisor = tokio::spawn(async move {
            let shutdown = engine.shutdown_tx.subscribe();
            let mut shutdown_rx = engine.shutdown_tx.subscribe();
            let mut closed = channel.closed();
            let mut known_rx = engine.logs.watch_known();
            let mut started: HashSet<PublicKey> = HashSet::new();

            let start = |started: &mut HashSet<PublicKey>, key: PublicKey| {
                if !started.insert(key) {
                    return;
                }
                let Ok(store) = engine.logs.get_or_open(key) else {
                    return;
                };
                let sub = channel.open(&log_label(&key));
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = replicate_log(store, sub.tx, sub.rx, shutdown).await {
                        tracing::warn!(log = %key, "replication session ended: {e}");
                    }
                });
            };

            for (key, _) in engine.logs.known() {
                start(&mut started, key);
            }

            loop {
                tokio::select! {
                    changed = known_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        for (key, _) in engine.logs.known() {
                            start(&mut started, key);
                        }
                    }
                    label = new_labels.recv() => {
                        match label {
                            Some(label) => {
                                if let Some(key) = parse_log_label(&label) {
                                    start(&mut started, key);
                                }
                            }
                            None => break,
                        }
                    }
                    changed = closed.changed() => {
                        if changed.is_err() || *closed.borrow() {
                            break;
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            engine.peers.fetch_sub(1, Ordering::Relaxed);
            let _ = engine
                .events
                .send(SyncEvent::PeerDisconnected { key: remote_key });
            tracing::debug!(peer = %remote_key, "peer disconnected");
        });
        self.tasks.lock().push(supervisor);
    }

    /// A peer announced its writer key. The bootstrap peer (and any
    /// already-admitted writer) turns unseen keys into `add-writer` ops;
    /// everyone else takes no action.
    async fn on_remote_writer(self: &Arc<Self>, key: PublicKey) {
        if !self.writable() {
            return;
        }
        if self.view.is_writer(&key) {
            return;
        }
        if !self.admissions_in_flight.lock().insert(key) {
            return;
        }

        let op = match (Operation::AddWriter {
            writer: *key.as_bytes(),
        })
        .encode()
        {
            Ok(op) => op,
            Err(_) => return,
        };
        match self.logs.local().append(&op) {
            Ok(_) => {
                tracing::info!(writer = %key, "admitted new writer");
                let _ = self.events.send(SyncEvent::WriterAdmitted { key });
            }
            Err(e) => {
                tracing::warn!(writer = %key, "failed to append add-writer: {e}");
                self.admissions_in_flight.lock().remove(&key);
                return;
            }
        }

        // Reconcile shortly after, once the admission has replicated.
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ADMISSION_PULL_DELAY).await;
            let _ = engine.linearizer.update().await;
            let _ = engine.pull_wakeup_tx.send(()).await;
        });
    }
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

/// Recursively collect regular files under `root`, ignore-filtered,
/// as (relative path with `/` separators, absolute path) pairs.
fn walk_files(root: &Path, ignore: &IgnoreList) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Ok(rel_os) = path.strip_prefix(root) else {
                continue;
            };
            let rel = rel_os.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
            if ignore.is_ignored(&rel) {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                out.push((rel, path));
            }
            // Symlinks and special files are not synchronized.
        }
    }
    out.sort();
    Ok(out)
}

/// Join a manifest path under the workspace root, refusing absolute
/// paths and parent traversal.
fn safe_join(root: &Path, rel: &str) -> Option<PathBuf> {
    if rel.is_empty() || rel.starts_with('/') {
        return None;
    }
    if rel.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return None;
    }
    Some(root.join(rel))
}

fn system_time_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn restore_mode(file: &std::fs::File, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restore_mode(_file: &std::fs::File, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
