//! Filesystem watching with a stability debounce.
//!
//! Wraps a `notify` recursive watcher. Raw events are collapsed into
//! bursts: a burst ends once the directory has been quiet for the
//! debounce window, and only then does the sync engine push. Events for
//! ignored paths are filtered before they can wake anything.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::Result;

/// Floor for the stability window.
pub const MIN_DEBOUNCE: Duration = Duration::from_millis(100);

/// A running directory watcher.
pub struct DirWatcher {
    // Held for its Drop: dropping stops the OS watches.
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<PathBuf>,
    debounce: Duration,
}

impl DirWatcher {
    /// Start watching `root` recursively.
    pub fn start(root: &Path, debounce: Duration) -> Result<Self> {
        let debounce = debounce.max(MIN_DEBOUNCE);
        let (tx, rx) = mpsc::channel(1024);

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<notify::Event, notify::Error>| {
                let Ok(event) = result else { return };
                if !matters(&event.kind) {
                    return;
                }
                for path in event.paths {
                    // Full queue means a push is due anyway.
                    let _ = tx.try_send(path);
                }
            },
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        tracing::debug!(root = %root.display(), "filesystem watcher started");

        Ok(Self {
            _watcher: watcher,
            rx,
            debounce,
        })
    }

    /// Wait for the next burst of changes: at least one event, then
    /// quiet for the debounce window. Returns `None` once the watcher
    /// backend is gone.
    pub async fn next_burst(&mut self) -> Option<Vec<PathBuf>> {
        let first = self.rx.recv().await?;
        let mut paths = vec![first];
        loop {
            match tokio::time::timeout(self.debounce, self.rx.recv()).await {
                Ok(Some(path)) => paths.push(path),
                Ok(None) => break,
                Err(_) => break, // quiet: burst complete
            }
        }
        Some(paths)
    }
}

fn matters(kind: &notify::EventKind) -> bool {
    use notify::EventKind;
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn burst_collects_rapid_changes() {
        let dir = TempDir::new().unwrap();
        let mut watcher = DirWatcher::start(dir.path(), Duration::from_millis(150)).unwrap();

        std::fs::write(dir.path().join("one.txt"), b"1").unwrap();
        std::fs::write(dir.path().join("two.txt"), b"2").unwrap();

        let burst = tokio::time::timeout(Duration::from_secs(10), watcher.next_burst())
            .await
            .expect("no burst observed")
            .unwrap();
        assert!(!burst.is_empty());
    }

    #[tokio::test]
    async fn quiet_directory_produces_nothing() {
        let dir = TempDir::new().unwrap();
        let mut watcher = DirWatcher::start(dir.path(), Duration::from_millis(100)).unwrap();

        tokio::select! {
            _ = watcher.next_burst() => panic!("burst from an untouched directory"),
            _ = tokio::time::sleep(Duration::from_millis(300)) => {}
        }
    }
}
